use crate::scale::Ramp;
use crate::source::resolve_encodings;
use crate::types::RegionKind;
use anyhow::{anyhow, bail, Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    #[serde(default)]
    pub input: InputConfig,
    pub datasets: Vec<DatasetConfig>,
    #[serde(default)]
    pub scale: ScaleConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub output: OutputConfig,
    #[serde(default)]
    pub server: ServerConfig,
    pub s3: Option<S3Config>,
    pub sheets: Option<SheetsConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct InputConfig {
    /// Alias table artifact; the embedded table is used when unset.
    pub aliases: Option<PathBuf>,
    #[serde(default = "default_true")]
    pub strip_accents: bool,
    /// Encodings tried in order when decoding flat files.
    #[serde(default = "default_encodings")]
    pub encodings: Vec<String>,
    /// CSV mapping canonical municipality names to their comarca.
    pub groups_csv: Option<PathBuf>,
}

impl Default for InputConfig {
    fn default() -> Self {
        Self {
            aliases: None,
            strip_accents: true,
            encodings: default_encodings(),
            groups_csv: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatasetConfig {
    pub name: String,
    #[serde(default)]
    pub kind: RegionKind,
    pub source: SourceConfig,
    pub boundary: SourceConfig,
    #[serde(default = "default_name_property")]
    pub name_property: String,
    #[serde(default)]
    pub columns: ColumnConfig,
    #[serde(default)]
    pub format: TableFormat,
    /// Column names of a listings table.
    #[serde(default)]
    pub listing_columns: ListingColumns,
}

#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TableFormat {
    /// One price per square meter per region and month.
    #[default]
    Prices,
    /// One row per property for sale.
    Listings,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SourceConfig {
    Local { path: PathBuf },
    S3 { key: String },
    Sheets { worksheet: String },
}

impl SourceConfig {
    pub fn describe(&self) -> String {
        match self {
            SourceConfig::Local { path } => format!("file {}", path.display()),
            SourceConfig::S3 { key } => format!("s3 object {}", key),
            SourceConfig::Sheets { worksheet } => format!("worksheet '{}'", worksheet),
        }
    }

    /// Case-insensitive extension check on a file path or object key.
    pub fn has_extension(&self, ext: &str) -> bool {
        let path = match self {
            SourceConfig::Local { path } => path.as_path(),
            SourceConfig::S3 { key } => Path::new(key.as_str()),
            SourceConfig::Sheets { .. } => return false,
        };
        path.extension()
            .and_then(|e| e.to_str())
            .map(|e| e.eq_ignore_ascii_case(ext))
            .unwrap_or(false)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ColumnConfig {
    #[serde(default = "default_region_column")]
    pub region: String,
    #[serde(default = "default_date_column")]
    pub date: String,
    #[serde(default = "default_price_column")]
    pub price: String,
}

impl Default for ColumnConfig {
    fn default() -> Self {
        Self {
            region: default_region_column(),
            date: default_date_column(),
            price: default_price_column(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ListingColumns {
    #[serde(default = "default_listing_price")]
    pub price: String,
    #[serde(default = "default_listing_area")]
    pub area: String,
    /// `|`-separated breadcrumb; the second-to-last part is the municipality.
    #[serde(default = "default_listing_location")]
    pub location: String,
    #[serde(default = "default_listing_latitude")]
    pub latitude: String,
    #[serde(default = "default_listing_longitude")]
    pub longitude: String,
    #[serde(default = "default_listing_rooms")]
    pub rooms: String,
    #[serde(default = "default_listing_bathrooms")]
    pub bathrooms: String,
    #[serde(default = "default_listing_address")]
    pub address: String,
    pub date: Option<String>,
}

impl Default for ListingColumns {
    fn default() -> Self {
        Self {
            price: default_listing_price(),
            area: default_listing_area(),
            location: default_listing_location(),
            latitude: default_listing_latitude(),
            longitude: default_listing_longitude(),
            rooms: default_listing_rooms(),
            bathrooms: default_listing_bathrooms(),
            address: default_listing_address(),
            date: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ScaleConfig {
    #[serde(default)]
    pub ramp: Ramp,
    pub colors: Option<Vec<String>>,
    #[serde(default = "default_no_data_color")]
    pub no_data_color: String,
}

impl Default for ScaleConfig {
    fn default() -> Self {
        Self {
            ramp: Ramp::default(),
            colors: None,
            no_data_color: default_no_data_color(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_ttl_secs(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct OutputConfig {
    #[serde(default = "default_output_dir")]
    pub dir: PathBuf,
    #[serde(default = "default_width")]
    pub width: u32,
    #[serde(default = "default_height")]
    pub height: u32,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            dir: default_output_dir(),
            width: default_width(),
            height: default_height(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    /// Directory with the dashboard front-end, served at `/`.
    pub static_dir: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            static_dir: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct S3Config {
    pub bucket: String,
    #[serde(default = "default_region")]
    pub region: String,
    pub endpoint: Option<String>,
    #[serde(default)]
    pub allow_http: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SheetsConfig {
    pub spreadsheet_id: String,
    /// Service account key file for private spreadsheets.
    pub service_account_file: Option<PathBuf>,
    /// Variable holding the key file's JSON, used when no file is set.
    #[serde(default = "default_service_account_env")]
    pub service_account_env: String,
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_sheets_url")]
    pub base_url: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_true() -> bool {
    true
}
fn default_encodings() -> Vec<String> {
    vec!["utf-8".into(), "windows-1252".into()]
}

fn default_name_property() -> String {
    "NOMBRE".into()
}
fn default_region_column() -> String {
    "municipio".into()
}
fn default_date_column() -> String {
    "fecha".into()
}
fn default_price_column() -> String {
    "precio_m2".into()
}
fn default_listing_price() -> String {
    "precio".into()
}
fn default_listing_area() -> String {
    "m2_construidos".into()
}
fn default_listing_location() -> String {
    "ubicacion".into()
}
fn default_listing_latitude() -> String {
    "latitud".into()
}
fn default_listing_longitude() -> String {
    "longitud".into()
}
fn default_listing_rooms() -> String {
    "habitaciones".into()
}
fn default_listing_bathrooms() -> String {
    "banos".into()
}
fn default_listing_address() -> String {
    "direccion".into()
}
fn default_no_data_color() -> String {
    "#d3d3d3".into()
}
fn default_ttl_secs() -> u64 {
    600
}
fn default_output_dir() -> PathBuf {
    PathBuf::from("output")
}
fn default_width() -> u32 {
    800
}
fn default_height() -> u32 {
    600
}
fn default_port() -> u16 {
    8080
}
fn default_region() -> String {
    "eu-west-1".into()
}
fn default_service_account_env() -> String {
    "GOOGLE_SERVICE_ACCOUNT_JSON".into()
}
fn default_api_key_env() -> String {
    "GOOGLE_SHEETS_API_KEY".into()
}
fn default_sheets_url() -> String {
    "https://sheets.googleapis.com/v4".into()
}
fn default_timeout_secs() -> u64 {
    30
}

impl AppConfig {
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: AppConfig =
            toml::from_str(content).with_context(|| "Failed to parse TOML configuration")?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.datasets.is_empty() {
            bail!("At least one [[datasets]] entry is required");
        }

        let mut seen = HashSet::new();
        for dataset in &self.datasets {
            if !seen.insert(dataset.name.as_str()) {
                bail!("Duplicate dataset name '{}'", dataset.name);
            }
            for source in [&dataset.source, &dataset.boundary] {
                match source {
                    SourceConfig::S3 { .. } if self.s3.is_none() => {
                        bail!("Dataset '{}' reads from S3 but [s3] is missing", dataset.name)
                    }
                    SourceConfig::Sheets { .. } if self.sheets.is_none() => {
                        bail!(
                            "Dataset '{}' reads from Google Sheets but [sheets] is missing",
                            dataset.name
                        )
                    }
                    _ => {}
                }
            }
            if matches!(dataset.boundary, SourceConfig::Sheets { .. }) {
                bail!("Dataset '{}': boundary cannot come from a spreadsheet", dataset.name);
            }
        }

        resolve_encodings(&self.input.encodings).map_err(|e| anyhow!("[input] {}", e))?;

        if self.cache.ttl_secs == 0 {
            bail!("cache.ttl_secs must be greater than zero");
        }
        Ok(())
    }

    pub fn dataset(&self, name: Option<&str>) -> Result<&DatasetConfig> {
        match name {
            Some(name) => self
                .datasets
                .iter()
                .find(|d| d.name == name)
                .ok_or_else(|| anyhow!("Unknown dataset '{}'", name)),
            None => self
                .datasets
                .first()
                .ok_or_else(|| anyhow!("No datasets configured")),
        }
    }
}
