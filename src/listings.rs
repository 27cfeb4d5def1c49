//! Individual sale listings: price per square meter from the asking price
//! and built area, the municipality taken from the location breadcrumb,
//! and the filters and summaries behind the listings panel.

use crate::config::ListingColumns;
use crate::data::{parse_month, price_parser, PriceTable};
use crate::error::{DashboardError, DashboardResult};
use crate::source::RawTable;
use crate::types::{PriceRecord, RegionKind};
use chrono::NaiveDate;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use tracing::warn;

/// Municipality of a listing whose location has no breadcrumb.
pub const UNKNOWN_MUNICIPIO: &str = "Desconocido";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Listing {
    pub municipio: String,
    pub precio: f64,
    pub m2_construidos: f64,
    pub precio_m2: f64,
    pub habitaciones: Option<u32>,
    pub banos: Option<u32>,
    pub direccion: Option<String>,
    pub latitud: f64,
    pub longitud: f64,
    pub fecha: Option<NaiveDate>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ListingTable {
    pub listings: Vec<Listing>,
    /// Rows without a usable price, area or coordinates.
    pub dropped: usize,
}

impl ListingTable {
    /// Mean price per square meter of every municipality and month, as a
    /// price table. Undated listings count in the `as_of` month.
    pub fn price_table(&self, kind: RegionKind, as_of: NaiveDate) -> PriceTable {
        PriceTable {
            kind,
            records: municipio_records(&self.listings, kind, as_of),
            dropped: self.dropped,
            duplicates: 0,
        }
    }
}

/// Second-to-last `|` segment: "Calle Mayor | Laredo | Cantabria" is in
/// Laredo.
pub fn municipio_from_location(ubicacion: &str) -> String {
    let parts: Vec<&str> = ubicacion.split('|').collect();
    match parts.len() {
        0 | 1 => UNKNOWN_MUNICIPIO.to_string(),
        n => match parts[n - 2].trim() {
            "" => UNKNOWN_MUNICIPIO.to_string(),
            name => name.to_string(),
        },
    }
}

fn parse_coordinate(value: &str) -> Option<f64> {
    value
        .trim()
        .replace(',', ".")
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
}

fn parse_count(value: &str) -> Option<u32> {
    // "3.0" from float columns
    value
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite() && *v >= 0.0 && v.fract() == 0.0 && *v <= u32::MAX as f64)
        .map(|v| v as u32)
}

pub fn parse_listings(table: &RawTable, columns: &ListingColumns) -> DashboardResult<ListingTable> {
    let required = |name: &str| {
        table
            .column(name)
            .ok_or_else(|| DashboardError::MissingColumn(name.to_string()))
    };
    let price_idx = required(&columns.price)?;
    let area_idx = required(&columns.area)?;
    let location_idx = required(&columns.location)?;
    let lat_idx = required(&columns.latitude)?;
    let lon_idx = required(&columns.longitude)?;
    let rooms_idx = table.column(&columns.rooms);
    let baths_idx = table.column(&columns.bathrooms);
    let address_idx = table.column(&columns.address);
    let date_idx = columns.date.as_deref().and_then(|c| table.column(c));

    let price_of = price_parser(table, price_idx);
    let area_of = price_parser(table, area_idx);

    let mut listings = Vec::with_capacity(table.rows.len());
    let mut dropped = 0;

    for row in &table.rows {
        let cell = |idx: usize| row.get(idx).map(String::as_str).unwrap_or("");
        let optional = |idx: Option<usize>| idx.map(cell).filter(|v| !v.trim().is_empty());

        let parsed = (
            price_of(cell(price_idx)),
            area_of(cell(area_idx)).filter(|a| *a > 0.0),
            parse_coordinate(cell(lat_idx)),
            parse_coordinate(cell(lon_idx)),
        );
        let (precio, m2_construidos, latitud, longitud) = match parsed {
            (Some(p), Some(a), Some(lat), Some(lon)) => (p, a, lat, lon),
            _ => {
                dropped += 1;
                continue;
            }
        };

        listings.push(Listing {
            municipio: municipio_from_location(cell(location_idx)),
            precio,
            m2_construidos,
            precio_m2: precio / m2_construidos,
            habitaciones: optional(rooms_idx).and_then(parse_count),
            banos: optional(baths_idx).and_then(parse_count),
            direccion: optional(address_idx).map(|v| v.trim().to_string()),
            latitud,
            longitud,
            fecha: optional(date_idx).and_then(parse_month),
        });
    }

    if dropped > 0 {
        warn!(dropped, "Dropped listings without price, area or coordinates");
    }
    Ok(ListingTable { listings, dropped })
}

/// Selection made in the listings panel. Empty fields select everything.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ListingFilter {
    pub municipio: Option<String>,
    pub min_price: Option<f64>,
    pub max_price: Option<f64>,
    /// Room counts to keep; listings without a count never match.
    pub rooms: Vec<u32>,
}

impl ListingFilter {
    pub fn matches(&self, listing: &Listing) -> bool {
        self.municipio.as_deref().map_or(true, |m| listing.municipio == m)
            && self.min_price.map_or(true, |p| listing.precio >= p)
            && self.max_price.map_or(true, |p| listing.precio <= p)
            && (self.rooms.is_empty()
                || listing.habitaciones.map_or(false, |h| self.rooms.contains(&h)))
    }

    pub fn apply(&self, listings: &[Listing]) -> Vec<Listing> {
        listings.iter().filter(|l| self.matches(l)).cloned().collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ListingFacets {
    pub municipios: Vec<String>,
    pub rooms: Vec<u32>,
    pub min_price: Option<f64>,
    pub max_price: Option<f64>,
}

pub fn facets(listings: &[Listing]) -> ListingFacets {
    let municipios: BTreeSet<&str> = listings.iter().map(|l| l.municipio.as_str()).collect();
    let rooms: BTreeSet<u32> = listings.iter().filter_map(|l| l.habitaciones).collect();
    let prices = listings.iter().map(|l| l.precio);
    ListingFacets {
        municipios: municipios.into_iter().map(str::to_string).collect(),
        rooms: rooms.into_iter().collect(),
        min_price: prices.clone().reduce(f64::min),
        max_price: prices.reduce(f64::max),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ListingSummary {
    pub count: usize,
    pub mean_price: f64,
    pub mean_price_per_sqm: f64,
    pub mean_size: f64,
}

pub fn summarize_listings(listings: &[Listing]) -> Option<ListingSummary> {
    if listings.is_empty() {
        return None;
    }
    let n = listings.len() as f64;
    Some(ListingSummary {
        count: listings.len(),
        mean_price: listings.iter().map(|l| l.precio).sum::<f64>() / n,
        mean_price_per_sqm: listings.iter().map(|l| l.precio_m2).sum::<f64>() / n,
        mean_size: listings.iter().map(|l| l.m2_construidos).sum::<f64>() / n,
    })
}

/// Marker color class relative to the mean price per square meter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PriceBand {
    Above,
    Near,
    /// More than 20% below the mean.
    Below,
}

pub fn price_band(precio_m2: f64, mean: f64) -> PriceBand {
    if precio_m2 > mean {
        PriceBand::Above
    } else if precio_m2 < mean * 0.8 {
        PriceBand::Below
    } else {
        PriceBand::Near
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MunicipioStat {
    pub municipio: String,
    pub listings: usize,
    pub mean_price: f64,
    pub mean_price_per_sqm: f64,
    pub mean_size: f64,
    pub mean_rooms: Option<f64>,
}

pub fn municipio_stats(listings: &[Listing]) -> Vec<MunicipioStat> {
    let mut by_name: BTreeMap<&str, Vec<&Listing>> = BTreeMap::new();
    for listing in listings {
        by_name.entry(listing.municipio.as_str()).or_default().push(listing);
    }

    let mut stats: Vec<MunicipioStat> = by_name
        .into_iter()
        .map(|(name, group)| {
            let n = group.len() as f64;
            let rooms: Vec<f64> =
                group.iter().filter_map(|l| l.habitaciones).map(f64::from).collect();
            MunicipioStat {
                municipio: name.to_string(),
                listings: group.len(),
                mean_price: group.iter().map(|l| l.precio).sum::<f64>() / n,
                mean_price_per_sqm: group.iter().map(|l| l.precio_m2).sum::<f64>() / n,
                mean_size: group.iter().map(|l| l.m2_construidos).sum::<f64>() / n,
                mean_rooms: (!rooms.is_empty())
                    .then(|| rooms.iter().sum::<f64>() / rooms.len() as f64),
            }
        })
        .collect();

    stats.sort_by(|a, b| b.mean_price_per_sqm.total_cmp(&a.mean_price_per_sqm));
    stats
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct HeatPoint {
    pub lat: f64,
    pub lon: f64,
    /// Price per square meter rescaled to `[0, 1]`; 0.5 when all are equal.
    pub weight: f64,
}

pub fn heat_points(listings: &[Listing]) -> Vec<HeatPoint> {
    let values = listings.iter().map(|l| l.precio_m2);
    let (Some(min), Some(max)) = (values.clone().reduce(f64::min), values.reduce(f64::max)) else {
        return Vec::new();
    };

    listings
        .iter()
        .map(|l| HeatPoint {
            lat: l.latitud,
            lon: l.longitud,
            weight: if max > min { (l.precio_m2 - min) / (max - min) } else { 0.5 },
        })
        .collect()
}

/// One record per municipality and month holding the mean price per
/// square meter. Listings with an unknown municipality are left out.
pub fn municipio_records(
    listings: &[Listing],
    kind: RegionKind,
    as_of: NaiveDate,
) -> Vec<PriceRecord> {
    let mut sums: BTreeMap<(NaiveDate, &str), (usize, f64)> = BTreeMap::new();
    for listing in listings.iter().filter(|l| l.municipio != UNKNOWN_MUNICIPIO) {
        let date = listing.fecha.unwrap_or(as_of);
        let entry = sums.entry((date, listing.municipio.as_str())).or_insert((0, 0.0));
        entry.0 += 1;
        entry.1 += listing.precio_m2;
    }

    sums.into_iter()
        .map(|((date, name), (n, total))| PriceRecord {
            region_name: name.to_string(),
            date,
            price_per_sqm: total / n as f64,
            region_kind: kind,
        })
        .collect()
}
