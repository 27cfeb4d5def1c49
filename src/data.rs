use crate::cache::{Clock, SystemClock, TtlCache};
use crate::config::{AppConfig, ColumnConfig, DatasetConfig, SourceConfig, TableFormat};
use crate::error::{DashboardError, DashboardResult};
use crate::listings::{parse_listings, ListingTable};
use crate::source::{RawTable, SourceReader};
use crate::types::{BoundaryFeature, PriceRecord, RegionKind};
use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime};
use geo::MultiPolygon;
use geojson::GeoJson;
use std::collections::{HashMap, HashSet};
use std::convert::TryInto;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq)]
pub struct PriceTable {
    pub kind: RegionKind,
    pub records: Vec<PriceRecord>,
    /// Rows dropped for an unusable name, date or price.
    pub dropped: usize,
    /// Rows replaced by a later row for the same region and month.
    pub duplicates: usize,
}

#[derive(Debug, Clone)]
pub struct BoundaryDocument {
    pub features: Vec<BoundaryFeature>,
}

impl BoundaryDocument {
    pub fn names(&self) -> Vec<&str> {
        self.features
            .iter()
            .map(|f| f.canonical_name.as_str())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.features.len()
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }

    fn from_features(features: Vec<BoundaryFeature>) -> DashboardResult<Self> {
        let mut seen = HashSet::new();
        for feature in &features {
            if !seen.insert(feature.canonical_name.as_str()) {
                return Err(DashboardError::Boundary(format!(
                    "duplicate feature name '{}'",
                    feature.canonical_name
                )));
            }
        }
        Ok(Self { features })
    }
}

/// Canonical municipality name -> comarca.
pub type GroupTable = HashMap<String, String>;

pub type GroupRows = Vec<(String, String)>;

pub fn parse_month(value: &str) -> Option<NaiveDate> {
    let s = value.trim();
    if s.is_empty() {
        return None;
    }

    let date = NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .or_else(|_| NaiveDate::parse_from_str(&format!("{}-01", s), "%Y-%m-%d"))
        .or_else(|_| NaiveDate::parse_from_str(&format!("{}/01", s), "%Y/%m/%d"))
        .or_else(|_| NaiveDate::parse_from_str(&format!("01/{}", s), "%d/%m/%Y"))
        .ok()
        .or_else(|| {
            NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
                .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f"))
                .ok()
                .map(|dt| dt.date())
        })
        .or_else(|| DateTime::parse_from_rfc3339(s).ok().map(|dt| dt.date_naive()))?;

    date.with_day(1)
}

/// Price cell as a finite, non-negative number. `-` and blanks are missing.
///
/// When both separators appear the later one is the decimal point. A lone
/// dot followed by exactly three digits groups thousands ("2.100" is 2100),
/// as does a run of well-formed groups ("1.234.567"). Anything else that
/// mixes separators is malformed.
pub fn parse_price(value: &str) -> Option<f64> {
    let s: String = value
        .trim()
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '€')
        .collect();
    if s.is_empty() || s == "-" {
        return None;
    }

    let number = match (s.rfind('.'), s.rfind(',')) {
        (Some(dot), Some(comma)) => {
            let (decimal, thousands) = if dot > comma { (dot, ',') } else { (comma, '.') };
            format!("{}.{}", ungroup(&s[..decimal], thousands)?, &s[decimal + 1..])
        }
        (None, Some(_)) if s.matches(',').count() == 1 => s.replace(',', "."),
        (None, Some(_)) => ungroup(&s, ',')?,
        (Some(_), None) if s.matches('.').count() == 1 => ungroup(&s, '.').unwrap_or(s),
        (Some(_), None) => ungroup(&s, '.')?,
        (None, None) => s,
    };

    number
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite() && *v >= 0.0)
}

fn parse_typed_price(value: &str) -> Option<f64> {
    value
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite() && *v >= 0.0)
}

pub(crate) fn price_parser(table: &RawTable, column: usize) -> fn(&str) -> Option<f64> {
    if table.is_numeric(column) {
        parse_typed_price
    } else {
        parse_price
    }
}

/// Digits of `s` with thousands separators removed, or `None` unless every
/// group after the first has three digits and the first has one to three
/// without a leading zero.
fn ungroup(s: &str, sep: char) -> Option<String> {
    let mut groups = s.split(sep);
    let first = groups.next()?;
    let digits = |g: &str| g.chars().all(|c| c.is_ascii_digit());
    if first.is_empty() || first.len() > 3 || first.starts_with('0') || !digits(first) {
        return None;
    }

    let mut out = first.to_string();
    for group in groups {
        if group.len() != 3 || !digits(group) {
            return None;
        }
        out.push_str(group);
    }
    Some(out)
}

fn resolve_columns(
    table: &RawTable,
    columns: &ColumnConfig,
) -> DashboardResult<(usize, usize, usize)> {
    let region = table
        .column(&columns.region)
        .or_else(|| table.column("distrito"))
        .ok_or_else(|| DashboardError::MissingColumn(columns.region.clone()))?;
    let date = table
        .column(&columns.date)
        .ok_or_else(|| DashboardError::MissingColumn(columns.date.clone()))?;
    let price = table
        .column(&columns.price)
        .ok_or_else(|| DashboardError::MissingColumn(columns.price.clone()))?;
    Ok((region, date, price))
}

/// Malformed rows are dropped and counted. When the same region and month
/// appear twice, the later row replaces the earlier one in place.
pub fn parse_price_table(
    table: &RawTable,
    columns: &ColumnConfig,
    kind: RegionKind,
) -> DashboardResult<PriceTable> {
    let (region_idx, date_idx, price_idx) = resolve_columns(table, columns)?;
    let price_of = price_parser(table, price_idx);

    let mut records: Vec<PriceRecord> = Vec::with_capacity(table.rows.len());
    let mut index: HashMap<(String, NaiveDate), usize> = HashMap::new();
    let mut dropped = 0;
    let mut duplicates = 0;

    for row in &table.rows {
        let cell = |idx: usize| row.get(idx).map(String::as_str).unwrap_or("");

        let region_name = cell(region_idx).trim();
        let date = parse_month(cell(date_idx));
        let price = price_of(cell(price_idx));

        let (date, price) = match (region_name.is_empty(), date, price) {
            (false, Some(d), Some(p)) => (d, p),
            _ => {
                dropped += 1;
                continue;
            }
        };

        let record = PriceRecord {
            region_name: region_name.to_string(),
            date,
            price_per_sqm: price,
            region_kind: kind,
        };

        match index.get(&(record.region_name.clone(), date)) {
            Some(&i) => {
                records[i] = record;
                duplicates += 1;
            }
            None => {
                index.insert((record.region_name.clone(), date), records.len());
                records.push(record);
            }
        }
    }

    if dropped > 0 {
        warn!(dropped, kind = kind.as_str(), "Dropped rows with unusable values");
    }

    Ok(PriceTable {
        kind,
        records,
        dropped,
        duplicates,
    })
}

pub fn parse_geojson_boundary(
    text: &str,
    name_property: &str,
) -> DashboardResult<BoundaryDocument> {
    let geojson: GeoJson = text
        .parse()
        .map_err(|e| DashboardError::Boundary(format!("Failed to parse GeoJSON: {}", e)))?;

    let collection = match geojson {
        GeoJson::FeatureCollection(fc) => fc,
        _ => return Err(DashboardError::Boundary("GeoJSON must be a FeatureCollection".into())),
    };

    let mut features = Vec::with_capacity(collection.features.len());

    for feature in collection.features {
        let name_val = feature
            .properties
            .as_ref()
            .and_then(|props| props.get(name_property));

        let canonical_name = match name_val {
            Some(serde_json::Value::String(s)) => s.trim().to_string(),
            Some(serde_json::Value::Number(n)) => n.to_string(),
            _ => {
                warn!(property = name_property, "Skipping boundary feature without a name");
                continue;
            }
        };

        let geometry = match feature.geometry {
            Some(geom) => {
                let valid_geo: geo::Geometry<f64> = geom.value.try_into().map_err(|e| {
                    DashboardError::Boundary(format!(
                        "Failed to convert geometry of '{}': {:?}",
                        canonical_name, e
                    ))
                })?;

                match valid_geo {
                    geo::Geometry::MultiPolygon(mp) => mp,
                    geo::Geometry::Polygon(p) => MultiPolygon::new(vec![p]),
                    _ => MultiPolygon::new(vec![]),
                }
            }
            None => MultiPolygon::new(vec![]),
        };

        features.push(BoundaryFeature {
            canonical_name,
            geometry,
        });
    }

    BoundaryDocument::from_features(features)
}

pub fn read_shapefile_boundary(
    path: &Path,
    name_property: &str,
) -> DashboardResult<BoundaryDocument> {
    if !path.exists() {
        return Err(DashboardError::MissingSource(path.display().to_string()));
    }
    let mut reader = shapefile::Reader::from_path(path).map_err(|e| {
        DashboardError::Boundary(format!("Failed to open shapefile {:?}: {}", path, e))
    })?;

    let mut features = Vec::new();

    for result in reader.iter_shapes_and_records() {
        let (shape, record) =
            result.map_err(|e| DashboardError::Boundary(format!("Failed to read shape: {}", e)))?;

        let canonical_name = match record.get(name_property) {
            Some(shapefile::dbase::FieldValue::Character(Some(s))) => s.trim().to_string(),
            Some(shapefile::dbase::FieldValue::Character(None)) => continue,
            Some(_) => {
                return Err(DashboardError::Boundary(format!(
                    "Shapefile field '{}' must be a string",
                    name_property
                )))
            }
            None => {
                return Err(DashboardError::Boundary(format!(
                    "Field '{}' not found in shapefile",
                    name_property
                )))
            }
        };

        let geometry: MultiPolygon<f64> = match shape {
            shapefile::Shape::Polygon(polygon) => polygon.into(),
            shapefile::Shape::PolygonM(polygon) => polygon.into(),
            shapefile::Shape::PolygonZ(polygon) => polygon.into(),
            _ => MultiPolygon::new(vec![]),
        };

        features.push(BoundaryFeature {
            canonical_name,
            geometry,
        });
    }

    BoundaryDocument::from_features(features)
}

pub fn parse_groups(table: &RawTable) -> GroupRows {
    let name_idx = table.column("municipio").unwrap_or(0);
    let group_idx = table.column("comarca").unwrap_or(1);

    table
        .rows
        .iter()
        .filter_map(|row| {
            let name = row.get(name_idx)?.trim();
            let group = row.get(group_idx)?.trim();
            (!name.is_empty() && !group.is_empty()).then(|| (name.to_string(), group.to_string()))
        })
        .collect()
}

fn current_month() -> NaiveDate {
    let today = chrono::Utc::now().date_naive();
    today.with_day(1).unwrap_or(today)
}

fn is_shapefile(source: &SourceConfig) -> bool {
    source.has_extension("shp")
}

/// Cached access to every table a dataset needs.
pub struct Loader {
    reader: SourceReader,
    prices: TtlCache<PriceTable>,
    listings: TtlCache<ListingTable>,
    boundaries: TtlCache<BoundaryDocument>,
    groups: TtlCache<GroupRows>,
    groups_source: Option<SourceConfig>,
}

impl Loader {
    pub fn from_config(config: &AppConfig) -> DashboardResult<Self> {
        Self::with_clock(config, SourceReader::from_config(config)?, Arc::new(SystemClock))
    }

    pub fn with_clock(
        config: &AppConfig,
        reader: SourceReader,
        clock: Arc<dyn Clock>,
    ) -> DashboardResult<Self> {
        let ttl = Duration::from_secs(config.cache.ttl_secs);
        Ok(Self {
            reader,
            prices: TtlCache::with_clock(ttl, clock.clone()),
            listings: TtlCache::with_clock(ttl, clock.clone()),
            boundaries: TtlCache::with_clock(ttl, clock.clone()),
            groups: TtlCache::with_clock(ttl, clock),
            groups_source: config
                .input
                .groups_csv
                .clone()
                .map(|path| SourceConfig::Local { path }),
        })
    }

    /// Price table of a dataset. A listings dataset yields the monthly mean
    /// of each municipality, with undated listings in the current month.
    pub async fn prices(&self, dataset: &DatasetConfig) -> DashboardResult<Arc<PriceTable>> {
        self.prices
            .get_or_try_insert_with(&dataset.name, || async {
                let table = match dataset.format {
                    TableFormat::Prices => {
                        let raw = self.reader.read_table(&dataset.source).await?;
                        parse_price_table(&raw, &dataset.columns, dataset.kind)?
                    }
                    TableFormat::Listings => {
                        let listings = self.listings(dataset).await?;
                        listings.price_table(dataset.kind, current_month())
                    }
                };
                info!(
                    dataset = %dataset.name,
                    records = table.records.len(),
                    dropped = table.dropped,
                    "Loaded price table"
                );
                Ok::<_, DashboardError>(table)
            })
            .await
    }

    pub async fn listings(&self, dataset: &DatasetConfig) -> DashboardResult<Arc<ListingTable>> {
        if dataset.format != TableFormat::Listings {
            return Err(DashboardError::Config(format!(
                "Dataset '{}' is not a listings table",
                dataset.name
            )));
        }
        self.listings
            .get_or_try_insert_with(&dataset.name, || async {
                let raw = self.reader.read_table(&dataset.source).await?;
                let table = parse_listings(&raw, &dataset.listing_columns)?;
                info!(
                    dataset = %dataset.name,
                    listings = table.listings.len(),
                    dropped = table.dropped,
                    "Loaded listings"
                );
                Ok::<_, DashboardError>(table)
            })
            .await
    }

    pub async fn boundary(
        &self,
        dataset: &DatasetConfig,
    ) -> DashboardResult<Arc<BoundaryDocument>> {
        self.boundaries
            .get_or_try_insert_with(&dataset.name, || async {
                let document = if is_shapefile(&dataset.boundary) {
                    match &dataset.boundary {
                        SourceConfig::Local { path } => {
                            read_shapefile_boundary(path, &dataset.name_property)?
                        }
                        other => {
                            return Err(DashboardError::Config(format!(
                                "Shapefile boundaries must be local files, got {}",
                                other.describe()
                            )))
                        }
                    }
                } else {
                    let text = self.reader.read_text(&dataset.boundary).await?;
                    parse_geojson_boundary(&text, &dataset.name_property)?
                };
                info!(
                    dataset = %dataset.name,
                    features = document.len(),
                    "Loaded boundary document"
                );
                Ok::<_, DashboardError>(document)
            })
            .await
    }

    pub async fn groups(&self) -> DashboardResult<Arc<GroupRows>> {
        self.groups
            .get_or_try_insert_with("groups", || async {
                let groups = match &self.groups_source {
                    Some(source) => parse_groups(&self.reader.read_table(source).await?),
                    None => GroupRows::new(),
                };
                Ok::<_, DashboardError>(groups)
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(csv: &str) -> RawTable {
        RawTable::from_csv_str(csv).unwrap()
    }

    fn municipal_prices(table: &RawTable) -> DashboardResult<PriceTable> {
        parse_price_table(table, &ColumnConfig::default(), RegionKind::Municipality)
    }

    #[test]
    fn month_formats() {
        let jan = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        assert_eq!(parse_month("2024-01"), Some(jan));
        assert_eq!(parse_month("2024-01-17"), Some(jan));
        assert_eq!(parse_month("2024/01"), Some(jan));
        assert_eq!(parse_month("01/2024"), Some(jan));
        assert_eq!(parse_month("2024-01-31 00:00:00"), Some(jan));
        assert_eq!(parse_month("2024-01-31T00:00:00"), Some(jan));
        assert_eq!(parse_month("2024-01-31T00:00:00.250"), Some(jan));
        assert_eq!(parse_month("2024-01-31T10:00:00+01:00"), Some(jan));
        assert_eq!(parse_month("enero"), None);
        assert_eq!(parse_month(""), None);
    }

    #[test]
    fn price_formats() {
        assert_eq!(parse_price("1820.5"), Some(1820.5));
        assert_eq!(parse_price("1.820,5"), Some(1820.5));
        assert_eq!(parse_price("1820,5"), Some(1820.5));
        assert_eq!(parse_price(" 2.100 € "), Some(2100.0));
        assert_eq!(parse_price("2.100"), Some(2100.0));
        assert_eq!(parse_price("1,234.5"), Some(1234.5));
        assert_eq!(parse_price("1.234.567"), Some(1234567.0));
        assert_eq!(parse_price("1.234,5"), Some(1234.5));
        assert_eq!(parse_price("1,234,567"), Some(1234567.0));
        assert_eq!(parse_price("0.125"), Some(0.125));
        assert_eq!(parse_price("12.5"), Some(12.5));
        assert_eq!(parse_price("-"), None);
        assert_eq!(parse_price(""), None);
        assert_eq!(parse_price("n/d"), None);
        assert_eq!(parse_price("-15"), None);
        assert_eq!(parse_price("NaN"), None);
    }

    #[test]
    fn malformed_grouping_is_rejected() {
        assert_eq!(parse_price("1.23.456"), None);
        assert_eq!(parse_price("12,34,5"), None);
        assert_eq!(parse_price("1.2345,6"), None);
        assert_eq!(parse_price("1,234.5.6"), None);
        assert_eq!(parse_price("1234.567,8"), None);
    }

    #[test]
    fn malformed_rows_are_dropped() {
        let table = raw(
            "municipio,fecha,precio_m2\n\
             Laredo,2024-01,2500\n\
             Laredo,2024-02,-\n\
             Noja,sometime,2100\n\
             ,2024-01,1000\n\
             Noja,2024-01,2200\n",
        );
        let prices = municipal_prices(&table).unwrap();
        assert_eq!(prices.records.len(), 2);
        assert_eq!(prices.dropped, 3);
        assert!(prices.records.iter().all(|r| r.price_per_sqm >= 0.0));
    }

    #[test]
    fn duplicate_month_keeps_later_row() {
        let table = raw(
            "municipio,fecha,precio_m2\n\
             Laredo,2024-01,2500\n\
             Noja,2024-01,2100\n\
             Laredo,2024-01-15,2600\n",
        );
        let prices = municipal_prices(&table).unwrap();
        assert_eq!(prices.records.len(), 2);
        assert_eq!(prices.duplicates, 1);
        assert_eq!(prices.records[0].region_name, "Laredo");
        assert_eq!(prices.records[0].price_per_sqm, 2600.0);
    }

    #[test]
    fn distrito_column_stands_in_for_municipio() {
        let table = raw("distrito,fecha,precio_m2\nCentro,2024-03,3100\n");
        let prices =
            parse_price_table(&table, &ColumnConfig::default(), RegionKind::District).unwrap();
        assert_eq!(prices.records[0].region_name, "Centro");
        assert_eq!(prices.records[0].region_kind, RegionKind::District);
    }

    #[test]
    fn missing_price_column_is_an_error() {
        let table = raw("municipio,fecha\nLaredo,2024-01\n");
        let err = municipal_prices(&table).unwrap_err();
        assert!(matches!(err, DashboardError::MissingColumn(ref c) if c == "precio_m2"));
    }

    const BOUNDARY: &str = r#"{
        "type": "FeatureCollection",
        "features": [
            {"type": "Feature", "properties": {"NOMBRE": "Laredo"},
             "geometry": {"type": "Polygon",
                          "coordinates": [[[-3.5,43.4],[-3.4,43.4],[-3.4,43.5],[-3.5,43.4]]]}},
            {"type": "Feature", "properties": {"NOMBRE": "Noja"}, "geometry": null},
            {"type": "Feature", "properties": {"OTRO": "x"},
             "geometry": {"type": "Point", "coordinates": [-3.5,43.4]}}
        ]
    }"#;

    #[test]
    fn geojson_boundary_keeps_order_and_nameless_are_skipped() {
        let doc = parse_geojson_boundary(BOUNDARY, "NOMBRE").unwrap();
        assert_eq!(doc.names(), vec!["Laredo", "Noja"]);
        assert_eq!(doc.features[0].geometry.0.len(), 1);
        assert!(doc.features[1].geometry.0.is_empty());
    }

    #[test]
    fn duplicate_boundary_names_are_rejected() {
        let doc = r#"{"type": "FeatureCollection", "features": [
            {"type": "Feature", "properties": {"NOMBRE": "Noja"}, "geometry": null},
            {"type": "Feature", "properties": {"NOMBRE": "Noja"}, "geometry": null}
        ]}"#;
        assert!(matches!(
            parse_geojson_boundary(doc, "NOMBRE"),
            Err(DashboardError::Boundary(_))
        ));
    }

    #[test]
    fn groups_table() {
        let groups =
            parse_groups(&raw("municipio,comarca\nNoja,Trasmiera\nLaredo,Asón-Agüera\n,x\n"));
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0], ("Noja".to_string(), "Trasmiera".to_string()));
        assert_eq!(groups[1].0, "Laredo");
    }

    #[test]
    fn shapefile_extension_detection() {
        assert!(is_shapefile(&SourceConfig::Local { path: "a/municipios.SHP".into() }));
        assert!(!is_shapefile(&SourceConfig::S3 { key: "raw/municipios.geojson".into() }));
    }
}
