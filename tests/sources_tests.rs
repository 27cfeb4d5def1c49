//! Remote and binary sources: the Sheets values API against a local mock,
//! Parquet price tables and shapefile boundaries.

mod common;

use arrow_array::{ArrayRef, Float64Array, RecordBatch, StringArray, TimestampNanosecondArray};
use arrow_schema::{DataType, Field, Schema, TimeUnit};
use axum::extract::{Path, Query};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use bytes::Bytes;
use common::{price_csv, Fixture};
use parquet::arrow::ArrowWriter;
use std::collections::HashMap;
use std::fs;
use std::sync::Arc;
use vivienda_map::config::{ColumnConfig, SheetsConfig, SourceConfig};
use vivienda_map::data::{parse_price_table, read_shapefile_boundary};
use vivienda_map::error::DashboardError;
use vivienda_map::index::RegionIndex;
use vivienda_map::pipeline::{Dashboard, MonthRange};
use vivienda_map::source::{RawTable, SheetsClient};
use vivienda_map::types::{RegionKind, RegionPrice};

const API_KEY: &str = "clave-de-prueba";

// ============================================================================
// Sheets values API
// ============================================================================

async fn values(
    Path((_, worksheet)): Path<(String, String)>,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    if query.get("key").map(String::as_str) != Some(API_KEY) {
        return (StatusCode::FORBIDDEN, "API key not valid").into_response();
    }
    match worksheet.as_str() {
        "Distritos" => Json(serde_json::json!({
            "range": "Distritos!A1:C3",
            "majorDimension": "ROWS",
            "values": [
                ["distrito", "fecha", "precio_m2"],
                ["Centro", "2024-03", "3.100"],
                ["Castilla-Hermida", "2024-03"]
            ]
        }))
        .into_response(),
        "Vacia" => Json(serde_json::json!({ "range": "Vacia!A1:Z1000" })).into_response(),
        "Caducada" => (StatusCode::UNAUTHORIZED, "Request had invalid credentials").into_response(),
        "Rota" => (StatusCode::INTERNAL_SERVER_ERROR, "backend error").into_response(),
        _ => (StatusCode::NOT_FOUND, "Unable to parse range").into_response(),
    }
}

async fn spawn_sheets_mock() -> String {
    let app = Router::new().route("/v4/spreadsheets/:id/values/:worksheet", get(values));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}/v4", addr)
}

/// Each test names its own key variable so parallel tests do not race.
fn sheets_config(base_url: &str, api_key_env: &str) -> SheetsConfig {
    SheetsConfig {
        spreadsheet_id: "hoja-viviendas".into(),
        service_account_file: None,
        service_account_env: "VIVIENDA_MAP_TEST_UNSET_ACCOUNT".into(),
        api_key_env: api_key_env.into(),
        base_url: base_url.into(),
        timeout_secs: 5,
    }
}

#[tokio::test]
async fn test_sheets_values_become_a_padded_table() {
    let base = spawn_sheets_mock().await;
    std::env::set_var("VIVIENDA_MAP_TEST_KEY_OK", API_KEY);
    let client = SheetsClient::new(&sheets_config(&base, "VIVIENDA_MAP_TEST_KEY_OK")).unwrap();

    let table = client.fetch("Distritos").await.unwrap();
    assert_eq!(table.headers, vec!["distrito", "fecha", "precio_m2"]);
    assert_eq!(table.rows.len(), 2);
    assert_eq!(table.rows[1], vec!["Castilla-Hermida", "2024-03", ""]);

    let empty = client.fetch("Vacia").await.unwrap();
    assert!(empty.headers.is_empty());
    assert!(empty.rows.is_empty());
}

#[tokio::test]
async fn test_sheets_status_codes_map_to_errors() {
    let base = spawn_sheets_mock().await;
    std::env::set_var("VIVIENDA_MAP_TEST_KEY_STATUS", API_KEY);
    let client = SheetsClient::new(&sheets_config(&base, "VIVIENDA_MAP_TEST_KEY_STATUS")).unwrap();

    let err = client.fetch("Caducada").await.unwrap_err();
    assert!(matches!(err, DashboardError::Auth { ref service, .. } if service == "sheets"));
    assert!(err.remediation().unwrap().contains("client_email"));

    let err = client.fetch("Ausente").await.unwrap_err();
    assert!(matches!(err, DashboardError::MissingSource(ref m) if m.contains("Ausente")));

    let err = client.fetch("Rota").await.unwrap_err();
    assert!(matches!(err, DashboardError::Upstream { ref message, .. } if message.contains("500")));
}

#[tokio::test]
async fn test_sheets_rejected_key_is_an_auth_error() {
    let base = spawn_sheets_mock().await;
    std::env::set_var("VIVIENDA_MAP_TEST_KEY_WRONG", "otra-clave");
    let client = SheetsClient::new(&sheets_config(&base, "VIVIENDA_MAP_TEST_KEY_WRONG")).unwrap();

    let err = client.fetch("Distritos").await.unwrap_err();
    assert!(matches!(err, DashboardError::Auth { ref message, .. } if message.contains("403")));
}

#[tokio::test]
async fn test_sheets_without_credentials_fails_before_any_request() {
    let client = SheetsClient::new(&sheets_config(
        "http://127.0.0.1:9/v4",
        "VIVIENDA_MAP_TEST_KEY_NEVER_SET",
    ))
    .unwrap();

    let err = client.fetch("Distritos").await.unwrap_err();
    assert!(matches!(err, DashboardError::Auth { ref message, .. }
        if message.contains("VIVIENDA_MAP_TEST_KEY_NEVER_SET")));
}

#[tokio::test]
async fn test_sheets_dataset_feeds_snapshot() {
    let base = spawn_sheets_mock().await;
    std::env::set_var("VIVIENDA_MAP_TEST_KEY_DATASET", API_KEY);
    let extra = format!(
        "[sheets]\nspreadsheet_id = \"hoja-viviendas\"\nbase_url = \"{}\"\n\
         api_key_env = \"VIVIENDA_MAP_TEST_KEY_DATASET\"\n\
         service_account_env = \"VIVIENDA_MAP_TEST_UNSET_ACCOUNT\"\n",
        base
    );
    let mut fx = Fixture::with_extra(&["Centro", "Castilla-Hermida"], &price_csv(&[]), &extra);
    fx.config.datasets[0].source = SourceConfig::Sheets {
        worksheet: "Distritos".into(),
    };

    let dashboard = Dashboard::from_config(fx.config.clone()).unwrap();
    let dataset = fx.config.dataset(None).unwrap();
    let snapshot = dashboard.snapshot(dataset, MonthRange::default()).await.unwrap();

    assert_eq!(snapshot.joined.get("Centro").unwrap().price, RegionPrice::Present(3100.0));
    assert_eq!(snapshot.joined.get("Castilla-Hermida").unwrap().price, RegionPrice::NoData);
    assert_eq!(snapshot.dropped_rows, 1);
}

// ============================================================================
// Parquet
// ============================================================================

fn month_nanos(year: i32, month: u32) -> i64 {
    chrono::NaiveDate::from_ymd_opt(year, month, 1)
        .unwrap()
        .and_hms_opt(0, 0, 0)
        .unwrap()
        .and_utc()
        .timestamp_nanos_opt()
        .unwrap()
}

/// Laid out the way pandas writes a price frame: datetime64 dates and
/// float prices with nulls.
fn price_parquet(rows: &[(&str, i64, Option<f64>)]) -> Vec<u8> {
    let schema = Arc::new(Schema::new(vec![
        Field::new("distrito", DataType::Utf8, false),
        Field::new("fecha", DataType::Timestamp(TimeUnit::Nanosecond, None), false),
        Field::new("precio_m2", DataType::Float64, true),
    ]));
    let names: Vec<&str> = rows.iter().map(|r| r.0).collect();
    let dates: Vec<i64> = rows.iter().map(|r| r.1).collect();
    let prices: Vec<Option<f64>> = rows.iter().map(|r| r.2).collect();
    let batch = RecordBatch::try_new(
        schema.clone(),
        vec![
            Arc::new(StringArray::from(names)) as ArrayRef,
            Arc::new(TimestampNanosecondArray::from(dates)) as ArrayRef,
            Arc::new(Float64Array::from(prices)) as ArrayRef,
        ],
    )
    .unwrap();

    let mut buf = Vec::new();
    let mut writer = ArrowWriter::try_new(&mut buf, schema, None).unwrap();
    writer.write(&batch).unwrap();
    writer.close().unwrap();
    buf
}

#[test]
fn test_parquet_columns_keep_their_numbers() {
    let bytes = price_parquet(&[
        ("Centro", month_nanos(2024, 3), Some(850.125)),
        ("Cueto", month_nanos(2024, 3), None),
    ]);
    let table = RawTable::from_parquet(Bytes::from(bytes), "precios.parquet").unwrap();

    assert_eq!(table.headers, vec!["distrito", "fecha", "precio_m2"]);
    assert!(table.is_numeric(2));
    assert!(!table.is_numeric(0));
    assert_eq!(table.rows[1][2], "");

    let prices = parse_price_table(&table, &ColumnConfig::default(), RegionKind::District).unwrap();
    assert_eq!(prices.records.len(), 1);
    assert_eq!(prices.records[0].price_per_sqm, 850.125);
    assert_eq!(prices.records[0].date, chrono::NaiveDate::from_ymd_opt(2024, 3, 1).unwrap());
    assert_eq!(prices.dropped, 1);
}

#[test]
fn test_corrupt_parquet_is_a_decode_error() {
    let bytes = Bytes::from_static(b"municipio,fecha\n");
    let err = RawTable::from_parquet(bytes, "x.parquet").unwrap_err();
    assert!(matches!(
        err,
        DashboardError::Parquet { ref source_name, .. } if source_name == "x.parquet"
    ));
}

#[tokio::test]
async fn test_parquet_dataset_is_chosen_by_extension() {
    let mut fx = Fixture::new(&["Centro", "Cueto", "Monte"], &price_csv(&[]));
    let path = fx.dir.path().join("precios_distritos_santander.parquet");
    fs::write(
        &path,
        price_parquet(&[
            ("Centro", month_nanos(2024, 2), Some(3050.0)),
            ("Centro", month_nanos(2024, 3), Some(3120.5)),
            ("Cueto", month_nanos(2024, 3), Some(2280.0)),
        ]),
    )
    .unwrap();
    fx.config.datasets[0].source = SourceConfig::Local { path };

    let dashboard = fx.dashboard();
    let dataset = fx.config.dataset(None).unwrap();
    let snapshot = dashboard.snapshot(dataset, MonthRange::default()).await.unwrap();

    assert_eq!(snapshot.joined.get("Centro").unwrap().price, RegionPrice::Present(3120.5));
    assert_eq!(snapshot.joined.get("Cueto").unwrap().price, RegionPrice::Present(2280.0));
    assert_eq!(snapshot.joined.get("Monte").unwrap().price, RegionPrice::NoData);
    assert_eq!(snapshot.records.len(), 3);
}

// ============================================================================
// Shapefile boundaries
// ============================================================================

fn write_shapefile(path: &std::path::Path, names: &[&str]) {
    use shapefile::dbase::{FieldName, FieldValue, Record, TableWriterBuilder};
    use shapefile::{Point, Polygon, PolygonRing, Writer};

    let table = TableWriterBuilder::new()
        .add_character_field(FieldName::try_from("NOMBRE").unwrap(), 50);
    let mut writer = Writer::from_path(path, table).unwrap();

    for (i, name) in names.iter().enumerate() {
        let (x, y) = common::square_origin(i);
        let ring = vec![
            Point::new(x, y),
            Point::new(x, y + 0.09),
            Point::new(x + 0.09, y + 0.09),
            Point::new(x + 0.09, y),
            Point::new(x, y),
        ];
        let polygon = Polygon::new(PolygonRing::Outer(ring));
        let mut record = Record::default();
        record.insert("NOMBRE".to_string(), FieldValue::Character(Some(name.to_string())));
        writer.write_shape_and_record(&polygon, &record).unwrap();
    }
}

#[test]
fn test_shapefile_boundary_reads_names_and_rings() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("distritos_santander.shp");
    write_shapefile(&path, &["Centro", "Cueto", "Monte"]);

    let doc = read_shapefile_boundary(&path, "NOMBRE").unwrap();
    assert_eq!(doc.names(), vec!["Centro", "Cueto", "Monte"]);
    assert!(doc.features.iter().all(|f| f.geometry.0.len() == 1));

    let index = RegionIndex::build(&doc);
    let (x, y) = common::square_origin(1);
    assert_eq!(index.locate(&doc, x + 0.045, y + 0.045), Some(1));
}

#[test]
fn test_shapefile_errors() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("distritos_santander.shp");

    let err = read_shapefile_boundary(&path, "NOMBRE").unwrap_err();
    assert!(matches!(err, DashboardError::MissingSource(_)));

    write_shapefile(&path, &["Centro"]);
    let err = read_shapefile_boundary(&path, "NOMBRE_DISTRITO").unwrap_err();
    assert!(matches!(err, DashboardError::Boundary(ref m) if m.contains("NOMBRE_DISTRITO")));
}
