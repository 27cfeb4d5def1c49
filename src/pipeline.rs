//! One recomputation pass: load (through the cache), normalize, join,
//! and build the color scale. Both the `generate` command and every HTTP
//! request go through [`Dashboard::snapshot`].

use crate::aggregate::{filter_months, latest_per_region};
use crate::config::{AppConfig, DatasetConfig};
use crate::data::{BoundaryDocument, GroupTable, Loader};
use crate::error::DashboardResult;
use crate::join::{join_regions, normalize_records, JoinedTable};
use crate::listings::Listing;
use crate::normalize::{AliasTable, Normalizer};
use crate::scale::ColorScale;
use crate::types::PriceRecord;
use chrono::NaiveDate;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MonthRange {
    pub from: Option<NaiveDate>,
    pub to: Option<NaiveDate>,
}

/// Everything one render pass needs, computed from immutable inputs.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub dataset: String,
    pub boundary: Arc<BoundaryDocument>,
    /// All records in range, with normalized region names.
    pub records: Vec<PriceRecord>,
    pub joined: JoinedTable,
    pub scale: ColorScale,
    pub dropped_rows: usize,
    /// Normalizer anchored on this boundary, for resolving query names.
    pub normalizer: Normalizer,
}

/// Listings of one dataset with canonical municipality names.
#[derive(Debug, Clone)]
pub struct ListingSnapshot {
    pub dataset: String,
    pub listings: Vec<Listing>,
    pub dropped_rows: usize,
    pub normalizer: Normalizer,
}

pub struct Dashboard {
    config: AppConfig,
    loader: Loader,
    normalizer: Normalizer,
}

impl Dashboard {
    pub fn from_config(config: AppConfig) -> DashboardResult<Self> {
        let loader = Loader::from_config(&config)?;
        Self::new(config, loader)
    }

    pub fn new(config: AppConfig, loader: Loader) -> DashboardResult<Self> {
        let table = match &config.input.aliases {
            Some(path) => AliasTable::load(path)?,
            None => AliasTable::embedded()?,
        };
        let normalizer = Normalizer::new(&table, config.input.strip_accents)?;
        info!(version = table.version(), rules = table.rules.len(), "Alias table ready");
        Ok(Self {
            config,
            loader,
            normalizer,
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn normalizer(&self) -> &Normalizer {
        &self.normalizer
    }

    pub async fn snapshot(
        &self,
        dataset: &DatasetConfig,
        range: MonthRange,
    ) -> DashboardResult<Snapshot> {
        let prices = self.loader.prices(dataset).await?;
        let boundary = self.loader.boundary(dataset).await?;
        let groups = self.loader.groups().await?;

        let mut normalizer = self.normalizer.clone();
        let shadowed = normalizer.anchor(boundary.names());
        if !shadowed.is_empty() {
            warn!(dataset = %dataset.name, ?shadowed, "Boundary names rewritten by alias table");
        }

        let in_range = filter_months(&prices.records, range.from, range.to);
        let latest_raw = latest_per_region(&in_range);

        let mut source_names = HashMap::new();
        for record in &latest_raw {
            let canonical = normalizer.normalize_str(&record.region_name);
            source_names.insert(canonical, record.region_name.clone());
        }
        let latest = normalize_records(&latest_raw, &normalizer);
        // Group tables are hand-typed too. Key them by canonical name in
        // file order, so the last row for a name wins.
        let mut group_table = GroupTable::new();
        for (name, group) in groups.iter() {
            group_table.insert(normalizer.normalize_str(name), group.clone());
        }
        let joined = join_regions(&boundary.names(), &latest, &source_names, &group_table);

        if !joined.unmatched_sources().is_empty() {
            warn!(
                dataset = %dataset.name,
                names = ?joined.unmatched_sources(),
                "Price names without a boundary feature"
            );
        }

        let scale = ColorScale::from_config(&joined.real_prices(), &self.config.scale)?;

        Ok(Snapshot {
            dataset: dataset.name.clone(),
            boundary,
            records: normalize_records(&in_range, &normalizer),
            joined,
            scale,
            dropped_rows: prices.dropped,
            normalizer,
        })
    }

    pub async fn listings(&self, dataset: &DatasetConfig) -> DashboardResult<ListingSnapshot> {
        let table = self.loader.listings(dataset).await?;
        let boundary = self.loader.boundary(dataset).await?;

        let mut normalizer = self.normalizer.clone();
        normalizer.anchor(boundary.names());
        let listings = table
            .listings
            .iter()
            .map(|listing| Listing {
                municipio: normalizer.normalize_str(&listing.municipio),
                ..listing.clone()
            })
            .collect();

        Ok(ListingSnapshot {
            dataset: dataset.name.clone(),
            listings,
            dropped_rows: table.dropped,
            normalizer,
        })
    }
}
