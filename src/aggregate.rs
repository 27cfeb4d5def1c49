//! Group-by routines behind the dashboard panels: most recent value per
//! region, monthly variation, top movers, per-comarca averages, time
//! series and the price histogram.

use crate::join::JoinedTable;
use crate::types::PriceRecord;
use chrono::NaiveDate;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};

pub fn filter_months(
    records: &[PriceRecord],
    from: Option<NaiveDate>,
    to: Option<NaiveDate>,
) -> Vec<PriceRecord> {
    records
        .iter()
        .filter(|r| from.map_or(true, |f| r.date >= f) && to.map_or(true, |t| r.date <= t))
        .cloned()
        .collect()
}

/// Most recent record of every region, ordered by date (oldest first).
pub fn latest_per_region(records: &[PriceRecord]) -> Vec<PriceRecord> {
    let mut latest: HashMap<&str, (usize, &PriceRecord)> = HashMap::new();
    for (i, record) in records.iter().enumerate() {
        let newer = latest
            .get(record.region_name.as_str())
            .map_or(true, |(_, current)| record.date >= current.date);
        if newer {
            latest.insert(record.region_name.as_str(), (i, record));
        }
    }

    let mut out: Vec<(usize, &PriceRecord)> = latest.into_values().collect();
    out.sort_by(|a, b| a.1.date.cmp(&b.1.date).then(a.0.cmp(&b.0)));
    out.into_iter().map(|(_, r)| r.clone()).collect()
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Variation {
    pub region: String,
    pub date: NaiveDate,
    pub price_per_sqm: f64,
    /// Percent change against the region's previous observation.
    pub change_pct: f64,
}

/// Change between each region's last two observed months. Months where
/// several localities folded into the region are averaged first.
///
/// Regions with a single observation, or a previous price of zero, have no
/// variation and are left out.
pub fn monthly_variation(records: &[PriceRecord]) -> Vec<Variation> {
    let mut by_region: BTreeMap<&str, Vec<&PriceRecord>> = BTreeMap::new();
    for record in records {
        by_region.entry(record.region_name.as_str()).or_default().push(record);
    }

    by_region
        .into_iter()
        .filter_map(|(region, series)| {
            let points = average_by_month(series.into_iter());
            let [prev, last] = points.get(points.len().checked_sub(2)?..)? else {
                return None;
            };
            if prev.price_per_sqm == 0.0 {
                return None;
            }
            Some(Variation {
                region: region.to_string(),
                date: last.date,
                price_per_sqm: last.price_per_sqm,
                change_pct: (last.price_per_sqm / prev.price_per_sqm - 1.0) * 100.0,
            })
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Movers {
    pub risers: Vec<Variation>,
    pub fallers: Vec<Variation>,
}

pub fn top_movers(variations: &[Variation], n: usize) -> Movers {
    let mut sorted = variations.to_vec();
    sorted.sort_by(|a, b| b.change_pct.total_cmp(&a.change_pct));
    let risers = sorted.iter().take(n).cloned().collect();
    let fallers = sorted.iter().rev().take(n).cloned().collect();
    Movers { risers, fallers }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GroupStat {
    pub group: String,
    pub regions: usize,
    pub mean_price: f64,
}

/// Average joined price per group label, highest first. Regions without
/// data are not counted.
pub fn group_averages(joined: &JoinedTable) -> Vec<GroupStat> {
    let mut sums: BTreeMap<&str, (usize, f64)> = BTreeMap::new();
    for row in joined.rows() {
        if let Some(price) = row.price.value() {
            let entry = sums.entry(row.group_label.as_str()).or_insert((0, 0.0));
            entry.0 += 1;
            entry.1 += price;
        }
    }

    let mut stats: Vec<GroupStat> = sums
        .into_iter()
        .map(|(group, (regions, total))| GroupStat {
            group: group.to_string(),
            regions,
            mean_price: total / regions as f64,
        })
        .collect();
    stats.sort_by(|a, b| b.mean_price.total_cmp(&a.mean_price));
    stats
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SeriesPoint {
    pub date: NaiveDate,
    pub price_per_sqm: f64,
}

/// Monthly series for one (normalized) region. Months where several
/// localities folded into the region are averaged.
pub fn time_series(records: &[PriceRecord], region: &str) -> Vec<SeriesPoint> {
    average_by_month(records.iter().filter(|r| r.region_name == region))
}

pub fn overall_series(records: &[PriceRecord]) -> Vec<SeriesPoint> {
    average_by_month(records.iter())
}

fn average_by_month<'a>(records: impl Iterator<Item = &'a PriceRecord>) -> Vec<SeriesPoint> {
    let mut months: BTreeMap<NaiveDate, (usize, f64)> = BTreeMap::new();
    for record in records {
        let entry = months.entry(record.date).or_insert((0, 0.0));
        entry.0 += 1;
        entry.1 += record.price_per_sqm;
    }
    months
        .into_iter()
        .map(|(date, (n, total))| SeriesPoint {
            date,
            price_per_sqm: total / n as f64,
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Bin {
    pub lower: f64,
    pub upper: f64,
    pub count: usize,
}

pub const MAX_BINS: usize = 200;

/// Equal-width histogram; the last bin includes its upper edge.
/// `bins` is clamped to `1..=MAX_BINS`.
pub fn histogram(prices: &[f64], bins: usize) -> Vec<Bin> {
    let bins = bins.clamp(1, MAX_BINS);
    let Some(summary) = summarize(prices) else {
        return Vec::new();
    };
    let (min, max) = (summary.min, summary.max);
    let width = if max > min { (max - min) / bins as f64 } else { 1.0 };

    let mut counts = vec![0usize; bins];
    for &p in prices {
        let idx = (((p - min) / width) as usize).min(bins - 1);
        counts[idx] += 1;
    }

    counts
        .into_iter()
        .enumerate()
        .map(|(i, count)| Bin {
            lower: min + width * i as f64,
            upper: min + width * (i + 1) as f64,
            count,
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Summary {
    pub count: usize,
    pub mean: f64,
    pub min: f64,
    pub max: f64,
}

pub fn summarize(prices: &[f64]) -> Option<Summary> {
    if prices.is_empty() {
        return None;
    }
    let min = prices.iter().copied().fold(f64::INFINITY, f64::min);
    let max = prices.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let mean = prices.iter().sum::<f64>() / prices.len() as f64;
    Some(Summary {
        count: prices.len(),
        mean,
        min,
        max,
    })
}
