//! Shared fixtures: a temp directory with a boundary GeoJSON, a price CSV
//! and a config pointing at both.

#![allow(dead_code)]

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;
use vivienda_map::cache::{Clock, ManualClock};
use vivienda_map::config::{AppConfig, TableFormat};
use vivienda_map::data::Loader;
use vivienda_map::pipeline::Dashboard;
use vivienda_map::source::{resolve_encodings, SourceReader};

pub struct Fixture {
    pub dir: TempDir,
    pub config: AppConfig,
    pub clock: Arc<ManualClock>,
}

impl Fixture {
    pub fn new(boundary_names: &[&str], price_csv: &[u8]) -> Self {
        Self::with_extra(boundary_names, price_csv, "")
    }

    /// `extra` is appended to the generated TOML.
    pub fn with_extra(boundary_names: &[&str], price_csv: &[u8], extra: &str) -> Self {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("municipios.geojson"), boundary_geojson(boundary_names)).unwrap();
        fs::write(dir.path().join("precios.csv"), price_csv).unwrap();

        let toml = format!(
            r#"
[[datasets]]
name = "municipios"
source = {{ type = "local", path = "{prices}" }}
boundary = {{ type = "local", path = "{boundary}" }}

[output]
dir = "{out}"
width = 120
height = 90
{extra}
"#,
            prices = toml_path(dir.path().join("precios.csv")),
            boundary = toml_path(dir.path().join("municipios.geojson")),
            out = toml_path(dir.path().join("output")),
            extra = extra,
        );
        let config = AppConfig::from_toml_str(&toml).unwrap();

        Self {
            dir,
            config,
            clock: Arc::new(ManualClock::new()),
        }
    }

    pub fn prices_path(&self) -> PathBuf {
        self.dir.path().join("precios.csv")
    }

    pub fn loader(&self) -> Loader {
        let reader = SourceReader::local(resolve_encodings(&self.config.input.encodings).unwrap());
        let clock: Arc<dyn Clock> = self.clock.clone();
        Loader::with_clock(&self.config, reader, clock).unwrap()
    }

    pub fn dashboard(&self) -> Dashboard {
        Dashboard::new(self.config.clone(), self.loader()).unwrap()
    }
}

fn toml_path(path: PathBuf) -> String {
    path.display().to_string().replace('\\', "/")
}

/// One 0.09-degree square per name, laid out on a grid over Cantabria.
pub fn boundary_geojson(names: &[&str]) -> String {
    let features: Vec<serde_json::Value> = names
        .iter()
        .enumerate()
        .map(|(i, name)| {
            let (x, y) = square_origin(i);
            serde_json::json!({
                "type": "Feature",
                "properties": { "NOMBRE": name },
                "geometry": {
                    "type": "Polygon",
                    "coordinates": [[
                        [x, y], [x + 0.09, y], [x + 0.09, y + 0.09], [x, y + 0.09], [x, y]
                    ]]
                }
            })
        })
        .collect();
    serde_json::json!({ "type": "FeatureCollection", "features": features }).to_string()
}

/// South-west corner of the `i`-th square.
pub fn square_origin(i: usize) -> (f64, f64) {
    (-4.8 + (i % 12) as f64 * 0.1, 42.8 + (i / 12) as f64 * 0.1)
}

pub fn price_csv(rows: &[(&str, &str, &str)]) -> Vec<u8> {
    let mut out = String::from("municipio,fecha,precio_m2\n");
    for (name, month, price) in rows {
        out.push_str(&format!("{},{},{}\n", name, month, price));
    }
    out.into_bytes()
}

/// Three usable listings in Laredo and Noja plus one with no built area.
pub fn listings_csv() -> Vec<u8> {
    b"precio,m2_construidos,ubicacion,latitud,longitud,habitaciones,banos,direccion\n\
      300000,100,C/ Mar | Laredo | Cantabria,43.41,-3.41,3,2,C/ Mar 1\n\
      200000,100,Playa | Noja | Cantabria,43.48,-3.52,2,1,\n\
      150000,100,Centro | Noja | Cantabria,43.49,-3.53,3.0,1,Plaza 2\n\
      90000,0,Centro | Noja | Cantabria,43.49,-3.53,1,1,\n"
        .to_vec()
}

/// Fixture whose single dataset is read as individual listings.
pub fn listings_fixture(boundary_names: &[&str]) -> Fixture {
    let mut fx = Fixture::new(boundary_names, &listings_csv());
    fx.config.datasets[0].format = TableFormat::Listings;
    fx
}
