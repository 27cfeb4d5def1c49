//! Raw access to the places price tables and boundary documents live:
//! local files, an S3-compatible bucket, or a Google Sheets spreadsheet.

use crate::config::{AppConfig, S3Config, SheetsConfig, SourceConfig};
use crate::error::{DashboardError, DashboardResult};
use arrow_cast::display::{ArrayFormatter, FormatOptions};
use bytes::Bytes;
use csv::ReaderBuilder;
use encoding_rs::Encoding;
use gcp_auth::{CustomServiceAccount, TokenProvider};
use object_store::{aws::AmazonS3Builder, path::Path as ObjectPath, ObjectStore};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

const SHEETS_SCOPES: &[&str] = &["https://www.googleapis.com/auth/spreadsheets.readonly"];

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawTable {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
    /// Columns stored as numbers at the source. Their cells are plain
    /// decimal text and skip thousands-separator handling.
    pub numeric: Vec<bool>,
}

impl RawTable {
    pub fn column(&self, name: &str) -> Option<usize> {
        self.headers.iter().position(|h| h.trim() == name)
    }

    pub fn is_numeric(&self, column: usize) -> bool {
        self.numeric.get(column).copied().unwrap_or(false)
    }

    pub fn from_csv_str(text: &str) -> DashboardResult<Self> {
        let mut rdr = ReaderBuilder::new()
            .flexible(true)
            .trim(csv::Trim::Headers)
            .from_reader(text.as_bytes());
        let headers = rdr.headers()?.iter().map(str::to_string).collect();

        let mut rows = Vec::new();
        for result in rdr.records() {
            let record = result?;
            rows.push(record.iter().map(str::to_string).collect());
        }
        Ok(Self {
            headers,
            rows,
            numeric: Vec::new(),
        })
    }

    /// First row is the header; short rows are padded with empty cells.
    pub fn from_values(values: Vec<Vec<String>>) -> Self {
        let mut iter = values.into_iter();
        let headers = match iter.next() {
            Some(h) => h,
            None => return Self::default(),
        };
        let width = headers.len();
        let rows = iter
            .map(|mut row| {
                row.resize(width.max(row.len()), String::new());
                row
            })
            .collect();
        Self {
            headers,
            rows,
            numeric: Vec::new(),
        }
    }

    /// Every row group of a Parquet file, cells rendered as text.
    /// Nulls become empty cells.
    pub fn from_parquet(bytes: Bytes, source_name: &str) -> DashboardResult<Self> {
        let decode_err = |message: String| DashboardError::Parquet {
            source_name: source_name.to_string(),
            message,
        };

        let builder =
            ParquetRecordBatchReaderBuilder::try_new(bytes).map_err(|e| decode_err(e.to_string()))?;
        let schema = builder.schema().clone();
        let reader = builder.build().map_err(|e| decode_err(e.to_string()))?;

        let headers = schema.fields().iter().map(|f| f.name().clone()).collect();
        let numeric = schema
            .fields()
            .iter()
            .map(|f| f.data_type().is_numeric())
            .collect();

        let options = FormatOptions::default();
        let mut rows = Vec::new();
        for batch in reader {
            let batch = batch.map_err(|e| decode_err(e.to_string()))?;
            let formatters = batch
                .columns()
                .iter()
                .map(|column| ArrayFormatter::try_new(column.as_ref(), &options))
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| decode_err(e.to_string()))?;

            for row in 0..batch.num_rows() {
                rows.push(formatters.iter().map(|f| f.value(row).to_string()).collect());
            }
        }

        debug!(source = source_name, rows = rows.len(), "Decoded Parquet table");
        Ok(Self {
            headers,
            rows,
            numeric,
        })
    }
}

/// Resolve encoding labels from config ("utf-8", "latin1", ...).
///
/// An encoding that maps every byte never fails, so nothing may follow it.
pub fn resolve_encodings(labels: &[String]) -> DashboardResult<Vec<&'static Encoding>> {
    let every_byte: Vec<u8> = (0..=u8::MAX).collect();
    let mut resolved: Vec<&'static Encoding> = Vec::with_capacity(labels.len());

    for label in labels {
        let encoding = Encoding::for_label(label.trim().as_bytes())
            .ok_or_else(|| DashboardError::Config(format!("Unknown text encoding '{}'", label)))?;
        let total = resolved.iter().find(|e| {
            e.decode_without_bom_handling_and_without_replacement(&every_byte)
                .is_some()
        });
        if let Some(total) = total {
            return Err(DashboardError::Config(format!(
                "Encoding '{}' is unreachable: {} decodes any input",
                label,
                total.name()
            )));
        }
        resolved.push(encoding);
    }
    Ok(resolved)
}

/// Decode `bytes` with the first encoding that accepts them without
/// replacement characters. A byte-order mark overrides the list.
pub fn decode_with_fallback(
    bytes: &[u8],
    encodings: &[&'static Encoding],
    source_name: &str,
) -> DashboardResult<(String, &'static Encoding)> {
    if let Some((encoding, bom_len)) = Encoding::for_bom(bytes) {
        if let Some(text) =
            encoding.decode_without_bom_handling_and_without_replacement(&bytes[bom_len..])
        {
            return Ok((text.into_owned(), encoding));
        }
    }

    for encoding in encodings {
        if let Some(text) = encoding.decode_without_bom_handling_and_without_replacement(bytes) {
            if *encoding != encoding_rs::UTF_8 {
                debug!(
                    source = source_name,
                    encoding = encoding.name(),
                    "Decoded with fallback encoding"
                );
            }
            return Ok((text.into_owned(), encoding));
        }
    }

    Err(DashboardError::Decode {
        source_name: source_name.to_string(),
        tried: encodings
            .iter()
            .map(|e| e.name())
            .collect::<Vec<_>>()
            .join(", "),
    })
}

pub struct ObjectStorage {
    store: Arc<dyn ObjectStore>,
    bucket: String,
}

impl ObjectStorage {
    /// Credentials come from the usual AWS environment variables.
    pub fn new(config: &S3Config) -> DashboardResult<Self> {
        let mut builder = AmazonS3Builder::from_env()
            .with_bucket_name(&config.bucket)
            .with_region(&config.region);

        if let Some(endpoint) = &config.endpoint {
            builder = builder.with_endpoint(endpoint);
        }
        if config.allow_http {
            builder = builder.with_allow_http(true);
        }

        let store = builder.build().map_err(|e| DashboardError::Auth {
            service: "s3".into(),
            message: format!("Failed to create S3 client: {}", e),
        })?;

        Ok(Self {
            store: Arc::new(store),
            bucket: config.bucket.clone(),
        })
    }

    #[instrument(skip(self), fields(bucket = %self.bucket, key = %key))]
    pub async fn get(&self, key: &str) -> DashboardResult<Bytes> {
        let location = ObjectPath::from(key);

        let result = self.store.get(&location).await.map_err(|e| match e {
            object_store::Error::NotFound { .. } => {
                DashboardError::MissingSource(format!("s3://{}/{}", self.bucket, key))
            }
            other => DashboardError::Upstream {
                service: "s3".into(),
                message: format!("Failed to read {}: {}", key, other),
            },
        })?;

        let bytes = result.bytes().await.map_err(|e| DashboardError::Upstream {
            service: "s3".into(),
            message: format!("Failed to read bytes of {}: {}", key, e),
        })?;

        debug!(size = bytes.len(), "Read object");
        Ok(bytes)
    }
}

#[derive(Debug, Deserialize)]
struct ValueRange {
    #[serde(default)]
    values: Vec<Vec<String>>,
}

enum SheetsAuth {
    /// Public sheets: an API key read from this environment variable.
    ApiKey { env: String },
    /// Private sheets shared with the account's `client_email`.
    ServiceAccount(Arc<CustomServiceAccount>),
}

enum Credential {
    ApiKey(String),
    Bearer(String),
}

pub struct SheetsClient {
    http: reqwest::Client,
    auth: SheetsAuth,
    config: SheetsConfig,
}

impl SheetsClient {
    pub fn new(config: &SheetsConfig) -> DashboardResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| DashboardError::Config(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            http,
            auth: Self::auth(config)?,
            config: config.clone(),
        })
    }

    /// A key file wins over key JSON in the environment; the API key is
    /// the fallback.
    fn auth(config: &SheetsConfig) -> DashboardResult<SheetsAuth> {
        let auth_err = |e: gcp_auth::Error| DashboardError::Auth {
            service: "sheets".into(),
            message: format!("Invalid service account credentials: {}", e),
        };

        if let Some(path) = &config.service_account_file {
            let account = CustomServiceAccount::from_file(path).map_err(auth_err)?;
            info!(path = %path.display(), "Using service account for Google Sheets");
            return Ok(SheetsAuth::ServiceAccount(Arc::new(account)));
        }
        if let Ok(json) = std::env::var(&config.service_account_env) {
            let account = CustomServiceAccount::from_json(&json).map_err(auth_err)?;
            info!(env = %config.service_account_env, "Using service account for Google Sheets");
            return Ok(SheetsAuth::ServiceAccount(Arc::new(account)));
        }
        Ok(SheetsAuth::ApiKey {
            env: config.api_key_env.clone(),
        })
    }

    async fn credential(&self) -> DashboardResult<Credential> {
        match &self.auth {
            SheetsAuth::ServiceAccount(account) => {
                let token = account.token(SHEETS_SCOPES).await.map_err(|e| DashboardError::Auth {
                    service: "sheets".into(),
                    message: format!("Token exchange failed: {}", e),
                })?;
                Ok(Credential::Bearer(token.as_str().to_string()))
            }
            SheetsAuth::ApiKey { env } => {
                std::env::var(env)
                    .map(Credential::ApiKey)
                    .map_err(|_| DashboardError::Auth {
                        service: "sheets".into(),
                        message: format!("environment variable {} is not set", env),
                    })
            }
        }
    }

    fn values_url(
        &self,
        worksheet: &str,
        credential: &Credential,
    ) -> DashboardResult<reqwest::Url> {
        let mut url = reqwest::Url::parse(&self.config.base_url)
            .map_err(|e| DashboardError::Config(format!("Invalid sheets base_url: {}", e)))?;
        url.path_segments_mut()
            .map_err(|_| DashboardError::Config("sheets base_url cannot be a base".into()))?
            .pop_if_empty()
            .extend(["spreadsheets", self.config.spreadsheet_id.as_str(), "values", worksheet]);
        if let Credential::ApiKey(key) = credential {
            url.query_pairs_mut().append_pair("key", key);
        }
        Ok(url)
    }

    #[instrument(skip(self), fields(spreadsheet = %self.config.spreadsheet_id))]
    pub async fn fetch(&self, worksheet: &str) -> DashboardResult<RawTable> {
        let credential = self.credential().await?;
        self.fetch_with(worksheet, &credential).await
    }

    async fn fetch_with(
        &self,
        worksheet: &str,
        credential: &Credential,
    ) -> DashboardResult<RawTable> {
        let mut request = self.http.get(self.values_url(worksheet, credential)?);
        if let Credential::Bearer(token) = credential {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(|e| DashboardError::Upstream {
            service: "sheets".into(),
            message: e.to_string(),
        })?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            let body = response.text().await.unwrap_or_default();
            return Err(DashboardError::Auth {
                service: "sheets".into(),
                message: format!("{}: {}", status, body),
            });
        }
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(DashboardError::MissingSource(format!(
                "worksheet '{}' in spreadsheet {}",
                worksheet, self.config.spreadsheet_id
            )));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(DashboardError::Upstream {
                service: "sheets".into(),
                message: format!("{}: {}", status, body),
            });
        }

        let range: ValueRange = response.json().await.map_err(|e| DashboardError::Upstream {
            service: "sheets".into(),
            message: format!("Unexpected response body: {}", e),
        })?;
        info!(worksheet, rows = range.values.len(), "Fetched worksheet");
        Ok(RawTable::from_values(range.values))
    }
}

pub struct SourceReader {
    s3: Option<ObjectStorage>,
    sheets: Option<SheetsClient>,
    encodings: Vec<&'static Encoding>,
}

impl SourceReader {
    pub fn from_config(config: &AppConfig) -> DashboardResult<Self> {
        let s3 = config.s3.as_ref().map(ObjectStorage::new).transpose()?;
        let sheets = config.sheets.as_ref().map(SheetsClient::new).transpose()?;
        let encodings = resolve_encodings(&config.input.encodings)?;
        Ok(Self {
            s3,
            sheets,
            encodings,
        })
    }

    pub fn local(encodings: Vec<&'static Encoding>) -> Self {
        Self {
            s3: None,
            sheets: None,
            encodings,
        }
    }

    pub async fn read_bytes(&self, source: &SourceConfig) -> DashboardResult<Bytes> {
        match source {
            SourceConfig::Local { path } => match tokio::fs::read(path).await {
                Ok(bytes) => Ok(Bytes::from(bytes)),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    Err(DashboardError::MissingSource(path.display().to_string()))
                }
                Err(e) => Err(DashboardError::Io(e)),
            },
            SourceConfig::S3 { key } => self.s3()?.get(key).await,
            SourceConfig::Sheets { worksheet } => Err(DashboardError::Config(format!(
                "worksheet '{}' is a table, not a document",
                worksheet
            ))),
        }
    }

    pub async fn read_text(&self, source: &SourceConfig) -> DashboardResult<String> {
        let bytes = self.read_bytes(source).await?;
        let (text, encoding) = decode_with_fallback(&bytes, &self.encodings, &source.describe())?;
        if encoding != encoding_rs::UTF_8 {
            warn!(source = %source.describe(), encoding = encoding.name(), "Source is not UTF-8");
        }
        Ok(text)
    }

    /// Worksheets come from the values API. Files ending in `.parquet` are
    /// read as Parquet and anything else as delimited text.
    pub async fn read_table(&self, source: &SourceConfig) -> DashboardResult<RawTable> {
        match source {
            SourceConfig::Sheets { worksheet } => self.sheets()?.fetch(worksheet).await,
            _ if source.has_extension("parquet") => {
                let bytes = self.read_bytes(source).await?;
                RawTable::from_parquet(bytes, &source.describe())
            }
            _ => RawTable::from_csv_str(&self.read_text(source).await?),
        }
    }

    fn s3(&self) -> DashboardResult<&ObjectStorage> {
        self.s3
            .as_ref()
            .ok_or_else(|| DashboardError::Config("S3 source used without [s3] section".into()))
    }

    fn sheets(&self) -> DashboardResult<&SheetsClient> {
        self.sheets.as_ref().ok_or_else(|| {
            DashboardError::Config("Sheets source used without [sheets] section".into())
        })
    }
}
