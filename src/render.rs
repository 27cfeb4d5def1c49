//! Export formats for a joined snapshot. This is the only place where a
//! missing price turns into the `-1` sentinel.

use crate::error::{DashboardError, DashboardResult};
use crate::index::RegionIndex;
use crate::listings::Listing;
use crate::pipeline::Snapshot;
use crate::scale::{Color, ColorScale};
use crate::types::{JoinedRegionRow, RegionPrice};
use chrono::NaiveDate;
use geojson::{Feature, FeatureCollection, Geometry, JsonObject, JsonValue};
use image::codecs::png::PngEncoder;
use image::{ColorType, ImageBuffer, ImageEncoder, Rgba, RgbaImage};
use rayon::prelude::*;
use serde::Serialize;
use std::f64::consts::PI;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::info;

const COLORBAR_HEIGHT: u32 = 16;
const PADDING: u32 = 8;
const TRANSPARENT: Rgba<u8> = Rgba([0, 0, 0, 0]);

/// FeatureCollection with one feature per joined row, in boundary order.
///
/// Properties: the boundary's name property, `price_per_sqm` (sentinel for
/// missing data), `fill`, `group`, `source_name` and `date` (`YYYY-MM`).
pub fn choropleth_geojson(snapshot: &Snapshot, name_property: &str) -> FeatureCollection {
    let features = snapshot
        .boundary
        .features
        .iter()
        .zip(snapshot.joined.rows())
        .map(|(feature, row)| {
            let geometry = if feature.geometry.0.is_empty() {
                None
            } else {
                Some(Geometry::new(geojson::Value::from(&feature.geometry)))
            };

            let mut properties = JsonObject::new();
            let fill = snapshot.scale.color_for(row.price).to_hex();
            properties.insert(name_property.to_string(), row.canonical_name.clone().into());
            properties.insert("price_per_sqm".to_string(), row.price.to_sentinel().into());
            properties.insert("fill".to_string(), JsonValue::from(fill));
            properties.insert("group".to_string(), JsonValue::from(row.group_label.clone()));
            properties.insert(
                "source_name".to_string(),
                row.source_name.clone().map_or(JsonValue::Null, JsonValue::from),
            );
            properties.insert(
                "date".to_string(),
                row.date.map_or(JsonValue::Null, |d| JsonValue::from(month_label(d))),
            );

            Feature {
                bbox: None,
                geometry,
                id: None,
                properties: Some(properties),
                foreign_members: None,
            }
        })
        .collect();

    FeatureCollection {
        bbox: None,
        features,
        foreign_members: None,
    }
}

/// One exported line of the joined table.
#[derive(Debug, Serialize)]
struct ExportRow<'a> {
    municipio: &'a str,
    precio_m2: f64,
    grupo: &'a str,
    nombre_origen: &'a str,
    fecha: String,
}

impl<'a> From<&'a JoinedRegionRow> for ExportRow<'a> {
    fn from(row: &'a JoinedRegionRow) -> Self {
        ExportRow {
            municipio: &row.canonical_name,
            precio_m2: row.price.to_sentinel(),
            grupo: &row.group_label,
            nombre_origen: row.source_name.as_deref().unwrap_or(""),
            fecha: row.date.map(month_label).unwrap_or_default(),
        }
    }
}

pub fn write_joined_csv<W: Write>(rows: &[JoinedRegionRow], writer: W) -> DashboardResult<()> {
    let mut wtr = csv::Writer::from_writer(writer);
    for row in rows {
        wtr.serialize(ExportRow::from(row))?;
    }
    wtr.flush()?;
    Ok(())
}

pub fn joined_csv(rows: &[JoinedRegionRow]) -> DashboardResult<Vec<u8>> {
    let mut buf = Vec::new();
    write_joined_csv(rows, &mut buf)?;
    Ok(buf)
}

#[derive(Serialize)]
struct ListingRow<'a> {
    municipio: &'a str,
    precio: f64,
    precio_m2: f64,
    m2_construidos: f64,
    habitaciones: Option<u32>,
    banos: Option<u32>,
    direccion: &'a str,
    latitud: f64,
    longitud: f64,
    fecha: String,
}

/// Listings as a CSV download, one row per property.
pub fn listings_csv(listings: &[Listing]) -> DashboardResult<Vec<u8>> {
    let mut wtr = csv::Writer::from_writer(Vec::new());
    for l in listings {
        wtr.serialize(ListingRow {
            municipio: &l.municipio,
            precio: l.precio,
            precio_m2: l.precio_m2,
            m2_construidos: l.m2_construidos,
            habitaciones: l.habitaciones,
            banos: l.banos,
            direccion: l.direccion.as_deref().unwrap_or(""),
            latitud: l.latitud,
            longitud: l.longitud,
            fecha: l.fecha.map(month_label).unwrap_or_default(),
        })?;
    }
    wtr.into_inner()
        .map_err(|e| DashboardError::Io(e.into_error()))
}

pub fn month_label(date: NaiveDate) -> String {
    date.format("%Y-%m").to_string()
}

/// Raster preview of the choropleth in Web Mercator, fitted to
/// `width x height`. A colorbar strip runs along the bottom when any
/// region has a price.
pub fn render_map(snapshot: &Snapshot, width: u32, height: u32) -> RgbaImage {
    let mut img: RgbaImage = ImageBuffer::from_pixel(width, height, TRANSPARENT);
    let index = RegionIndex::build(&snapshot.boundary);

    let bar = if snapshot.scale.real_range().is_some() && height > COLORBAR_HEIGHT * 2 {
        COLORBAR_HEIGHT
    } else {
        0
    };
    let map_height = height - bar;

    let Some(bounds) = index.bounds() else {
        return img;
    };
    let Some(view) = Viewport::fit(bounds, width, map_height) else {
        return img;
    };

    let colors: Vec<Rgba<u8>> = snapshot
        .joined
        .rows()
        .iter()
        .map(|row| opaque(snapshot.scale.color_for(row.price)))
        .collect();

    let row_len = width as usize * 4;
    img.par_chunks_mut(row_len)
        .take(map_height as usize)
        .enumerate()
        .for_each(|(py, row)| {
            for px in 0..width as usize {
                let (lon, lat) = view.unproject(px as f64 + 0.5, py as f64 + 0.5);
                if let Some(i) = index.locate(&snapshot.boundary, lon, lat) {
                    if let Some(color) = colors.get(i) {
                        row[px * 4..px * 4 + 4].copy_from_slice(&color.0);
                    }
                }
            }
        });

    if bar > 0 {
        draw_colorbar(&mut img, &snapshot.scale, map_height);
    }
    img
}

fn draw_colorbar(img: &mut RgbaImage, scale: &ColorScale, top: u32) {
    let Some((min, max)) = scale.real_range() else {
        return;
    };
    let width = img.width();
    for px in 0..width {
        let t = if width > 1 { px as f64 / (width - 1) as f64 } else { 0.0 };
        let color = opaque(scale.color_for(RegionPrice::Present(min + (max - min) * t)));
        for py in top..img.height() {
            img.put_pixel(px, py, color);
        }
    }
}

fn opaque(color: Color) -> Rgba<u8> {
    let [r, g, b] = color.0;
    Rgba([r, g, b, 255])
}

pub fn encode_png(img: &RgbaImage) -> DashboardResult<Vec<u8>> {
    let mut buf = Vec::new();
    PngEncoder::new(&mut buf).write_image(
        img.as_raw(),
        img.width(),
        img.height(),
        ColorType::Rgba8,
    )?;
    Ok(buf)
}

/// Maps pixels to lon/lat for a region extent fitted into the image.
struct Viewport {
    origin: (f64, f64),
    offset: (f64, f64),
    scale: f64,
}

impl Viewport {
    fn fit(bounds: geo::Rect<f64>, width: u32, height: u32) -> Option<Self> {
        let (x0, y0) = mercator(bounds.min().x, bounds.max().y);
        let (x1, y1) = mercator(bounds.max().x, bounds.min().y);
        let usable_w = width.checked_sub(2 * PADDING)?.max(1) as f64;
        let usable_h = height.checked_sub(2 * PADDING)?.max(1) as f64;
        let span_x = (x1 - x0).max(f64::EPSILON);
        let span_y = (y1 - y0).max(f64::EPSILON);

        let scale = (usable_w / span_x).min(usable_h / span_y);
        let offset = (
            (width as f64 - span_x * scale) / 2.0,
            (height as f64 - span_y * scale) / 2.0,
        );
        Some(Self {
            origin: (x0, y0),
            offset,
            scale,
        })
    }

    fn unproject(&self, px: f64, py: f64) -> (f64, f64) {
        let x = self.origin.0 + (px - self.offset.0) / self.scale;
        let y = self.origin.1 + (py - self.offset.1) / self.scale;
        inverse_mercator(x, y)
    }
}

// Web Mercator at zoom 0, both axes in [0, 1], y growing southwards.
fn mercator(lon: f64, lat: f64) -> (f64, f64) {
    let x = (lon + 180.0) / 360.0;
    let lat_rad = lat.to_radians();
    let y = (1.0 - (lat_rad.tan() + (1.0 / lat_rad.cos())).ln() / PI) / 2.0;
    (x, y)
}

fn inverse_mercator(x: f64, y: f64) -> (f64, f64) {
    let lon = x * 360.0 - 180.0;
    let lat = (PI * (1.0 - 2.0 * y)).sinh().atan().to_degrees();
    (lon, lat)
}

/// Files written by [`write_outputs`].
#[derive(Debug, Clone)]
pub struct OutputFiles {
    pub csv: PathBuf,
    pub geojson: PathBuf,
    pub scale: PathBuf,
    pub png: PathBuf,
}

/// Write `joined.csv`, `choropleth.geojson`, `scale.json` and `map.png`
/// under `dir`.
pub fn write_outputs(
    snapshot: &Snapshot,
    name_property: &str,
    dir: &Path,
    width: u32,
    height: u32,
) -> DashboardResult<OutputFiles> {
    fs::create_dir_all(dir)?;
    let files = OutputFiles {
        csv: dir.join("joined.csv"),
        geojson: dir.join("choropleth.geojson"),
        scale: dir.join("scale.json"),
        png: dir.join("map.png"),
    };

    write_joined_csv(snapshot.joined.rows(), fs::File::create(&files.csv)?)?;

    let collection = choropleth_geojson(snapshot, name_property);
    fs::write(&files.geojson, geojson::GeoJson::from(collection).to_string())?;

    fs::write(&files.scale, serde_json::to_vec_pretty(&snapshot.scale)?)?;

    let img = render_map(snapshot, width, height);
    img.save(&files.png)?;

    info!(dir = %dir.display(), regions = snapshot.joined.len(), "Wrote outputs");
    Ok(files)
}
