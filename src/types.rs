use chrono::NaiveDate;
use geo::MultiPolygon;
use serde::{Deserialize, Serialize};

/// Price value written for regions without data at the export boundary.
pub const SENTINEL_NO_DATA: f64 = -1.0;

/// Group label given to boundary regions with no matching price.
pub const NO_DATA_LABEL: &str = "No data";

/// Group label for matched regions missing from the group reference table.
pub const UNASSIGNED_LABEL: &str = "Unassigned";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegionKind {
    #[default]
    Municipality,
    District,
    CensusSection,
}

impl RegionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RegionKind::Municipality => "municipality",
            RegionKind::District => "district",
            RegionKind::CensusSection => "census_section",
        }
    }
}

/// One price observation for a region in a calendar month.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PriceRecord {
    pub region_name: String,
    pub date: NaiveDate,
    pub price_per_sqm: f64,
    pub region_kind: RegionKind,
}

#[derive(Debug, Clone)]
pub struct BoundaryFeature {
    pub canonical_name: String,
    pub geometry: MultiPolygon<f64>,
}

/// Price attached to a joined region. Collapses to [`SENTINEL_NO_DATA`]
/// only when written out.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RegionPrice {
    Present(f64),
    NoData,
}

impl RegionPrice {
    pub fn value(&self) -> Option<f64> {
        match self {
            RegionPrice::Present(v) => Some(*v),
            RegionPrice::NoData => None,
        }
    }

    pub fn is_present(&self) -> bool {
        matches!(self, RegionPrice::Present(_))
    }

    pub fn to_sentinel(&self) -> f64 {
        self.value().unwrap_or(SENTINEL_NO_DATA)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct JoinedRegionRow {
    pub canonical_name: String,
    pub price: RegionPrice,
    pub group_label: String,
    /// Name as it appeared in the price data, before normalization.
    pub source_name: Option<String>,
    pub date: Option<NaiveDate>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sentinel_only_for_missing_prices() {
        assert_eq!(RegionPrice::NoData.to_sentinel(), SENTINEL_NO_DATA);
        assert_eq!(RegionPrice::Present(0.0).to_sentinel(), 0.0);
        assert_eq!(RegionPrice::Present(1520.5).value(), Some(1520.5));
        assert!(!RegionPrice::NoData.is_present());
    }
}
