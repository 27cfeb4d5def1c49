//! Join of normalized price rows onto the boundary document.
//!
//! The output has exactly one row per boundary feature, in boundary order.
//! Regions without a matching price carry [`RegionPrice::NoData`].

use crate::data::GroupTable;
use crate::normalize::Normalizer;
use crate::types::{
    JoinedRegionRow, PriceRecord, RegionPrice, NO_DATA_LABEL, UNASSIGNED_LABEL,
};
use std::collections::{HashMap, HashSet};
use tracing::debug;

#[derive(Debug, Clone, PartialEq)]
pub struct JoinedTable {
    rows: Vec<JoinedRegionRow>,
    unmatched_sources: Vec<String>,
}

impl JoinedTable {
    pub fn rows(&self) -> &[JoinedRegionRow] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn get(&self, canonical_name: &str) -> Option<&JoinedRegionRow> {
        self.rows.iter().find(|r| r.canonical_name == canonical_name)
    }

    pub fn matched_count(&self) -> usize {
        self.rows.iter().filter(|r| r.price.is_present()).count()
    }

    pub fn missing_count(&self) -> usize {
        self.len() - self.matched_count()
    }

    /// Prices of matched rows, in boundary order.
    pub fn real_prices(&self) -> Vec<f64> {
        self.rows.iter().filter_map(|r| r.price.value()).collect()
    }

    /// Normalized price-side names that no boundary feature carries.
    pub fn unmatched_sources(&self) -> &[String] {
        &self.unmatched_sources
    }

    /// User-facing note about regions without data, or `None` when every
    /// region matched.
    pub fn missing_advisory(&self) -> Option<String> {
        match self.missing_count() {
            0 => None,
            1 => Some("1 region without data".to_string()),
            n => Some(format!("{} regions without data", n)),
        }
    }
}

/// Apply the normalizer to every record's region name.
pub fn normalize_records(records: &[PriceRecord], normalizer: &Normalizer) -> Vec<PriceRecord> {
    records
        .iter()
        .map(|r| PriceRecord {
            region_name: normalizer.normalize_str(&r.region_name),
            ..r.clone()
        })
        .collect()
}

/// One row per canonical name, filled from `latest` where names match.
///
/// `latest` must already be normalized and reduced to one record per
/// region. If a name still repeats (several localities folded into one
/// municipality), the last record wins. `source_names` maps a normalized
/// name back to how it was spelled in the price data.
pub fn join_regions(
    canonical_names: &[&str],
    latest: &[PriceRecord],
    source_names: &HashMap<String, String>,
    groups: &GroupTable,
) -> JoinedTable {
    let mut by_name: HashMap<&str, &PriceRecord> = HashMap::with_capacity(latest.len());
    for record in latest {
        debug_assert!(
            record.price_per_sqm >= 0.0,
            "negative price for {} would collide with the no-data sentinel",
            record.region_name
        );
        by_name.insert(record.region_name.as_str(), record);
    }

    let rows: Vec<JoinedRegionRow> = canonical_names
        .iter()
        .map(|&name| match by_name.get(name) {
            Some(record) => JoinedRegionRow {
                canonical_name: name.to_string(),
                price: RegionPrice::Present(record.price_per_sqm),
                group_label: groups
                    .get(name)
                    .cloned()
                    .unwrap_or_else(|| UNASSIGNED_LABEL.to_string()),
                source_name: Some(
                    source_names
                        .get(name)
                        .cloned()
                        .unwrap_or_else(|| name.to_string()),
                ),
                date: Some(record.date),
            },
            None => JoinedRegionRow {
                canonical_name: name.to_string(),
                price: RegionPrice::NoData,
                group_label: NO_DATA_LABEL.to_string(),
                source_name: None,
                date: None,
            },
        })
        .collect();

    let known: HashSet<&str> = canonical_names.iter().copied().collect();
    let mut unmatched_sources: Vec<String> = by_name
        .keys()
        .filter(|name| !known.contains(*name))
        .map(|name| name.to_string())
        .collect();
    unmatched_sources.sort();

    let table = JoinedTable {
        rows,
        unmatched_sources,
    };
    debug!(
        regions = table.len(),
        matched = table.matched_count(),
        unmatched_sources = table.unmatched_sources.len(),
        "Joined prices onto boundary"
    );
    table
}
