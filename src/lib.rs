pub mod aggregate;
pub mod cache;
pub mod config;
pub mod data;
pub mod error;
pub mod index;
pub mod join;
pub mod listings;
pub mod normalize;
pub mod pipeline;
pub mod render;
pub mod scale;
pub mod server;
pub mod source;
pub mod types;
