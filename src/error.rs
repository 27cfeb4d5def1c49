//! Error types for loading, joining and serving price data.

use thiserror::Error;

pub type DashboardResult<T> = Result<T, DashboardError>;

#[derive(Debug, Error)]
pub enum DashboardError {
    // === Source errors ===
    #[error("Source not found: {0}")]
    MissingSource(String),

    #[error("{service} error: {message}")]
    Upstream { service: String, message: String },

    #[error("{service} authentication failed: {message}")]
    Auth { service: String, message: String },

    #[error("Failed to decode {source_name} with any of: {tried}")]
    Decode { source_name: String, tried: String },

    #[error("Failed to decode Parquet from {source_name}: {message}")]
    Parquet { source_name: String, message: String },

    #[error("Missing column '{0}' in price table")]
    MissingColumn(String),

    // === Reference data errors ===
    #[error("Invalid boundary document: {0}")]
    Boundary(String),

    #[error("Alias table conflict: {0}")]
    AliasConflict(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    // === Output errors ===
    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl DashboardError {
    /// Short hint shown next to the message for errors a user can fix.
    pub fn remediation(&self) -> Option<&'static str> {
        match self {
            DashboardError::MissingSource(_) => {
                Some("Check the configured path or object key and that the file was uploaded.")
            }
            DashboardError::Auth { service, .. } if service == "sheets" => Some(
                "Share the spreadsheet with the service account's client_email, \
                 or set the API key variable if the sheet is public.",
            ),
            DashboardError::Auth { .. } => {
                Some("Check AWS_ACCESS_KEY_ID / AWS_SECRET_ACCESS_KEY or the credentials file.")
            }
            DashboardError::Upstream { .. } => {
                Some("The remote service rejected the request; check the bucket and sheet id.")
            }
            DashboardError::Decode { .. } => {
                Some("Add the file's text encoding to input.encodings.")
            }
            DashboardError::MissingColumn(_) => {
                Some("Set the dataset's columns to match the header row of the table.")
            }
            _ => None,
        }
    }
}
