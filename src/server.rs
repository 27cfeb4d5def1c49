use crate::aggregate::{
    group_averages, histogram, monthly_variation, overall_series, summarize, time_series,
    top_movers, Bin, GroupStat, Movers, SeriesPoint, Summary, MAX_BINS,
};
use crate::config::{DatasetConfig, TableFormat};
use crate::data::parse_month;
use crate::error::DashboardError;
use crate::index::{centroids, Coordinates, RegionIndex};
use crate::listings::{
    facets, heat_points, municipio_stats, price_band, summarize_listings, HeatPoint, Listing,
    ListingFacets, ListingFilter, ListingSummary, MunicipioStat, PriceBand,
};
use crate::pipeline::{Dashboard, ListingSnapshot, MonthRange, Snapshot};
use crate::render::{
    choropleth_geojson, encode_png, joined_csv, listings_csv, month_label, render_map,
};
use crate::scale::ColorScale;
use crate::types::{JoinedRegionRow, RegionKind};
use anyhow::Result;
use axum::{
    extract::{Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use geojson::FeatureCollection;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

const DEFAULT_MOVERS: usize = 5;
const DEFAULT_BINS: usize = 20;

pub struct AppState {
    pub dashboard: Dashboard,
}

/// Dataset selection and month window, accepted by every endpoint.
#[derive(Debug, Default, Deserialize)]
pub struct ViewParams {
    dataset: Option<String>,
    kind: Option<RegionKind>,
    from: Option<String>,
    to: Option<String>,
}

#[derive(Deserialize)]
pub struct QueryParams {
    lat: f64,
    lon: f64,
}

#[derive(Deserialize)]
pub struct SeriesParams {
    region: Option<String>,
}

#[derive(Deserialize)]
pub struct MoversParams {
    n: Option<usize>,
}

#[derive(Deserialize)]
pub struct HistogramParams {
    bins: Option<usize>,
}

/// Listing filters; `rooms` is a comma-separated list of counts.
#[derive(Deserialize)]
pub struct ListingParams {
    municipio: Option<String>,
    min_price: Option<f64>,
    max_price: Option<f64>,
    rooms: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct RegionView {
    name: String,
    price_per_sqm: f64,
    has_data: bool,
    group: String,
    source_name: Option<String>,
    date: Option<String>,
    centroid: Option<Coordinates>,
}

impl RegionView {
    fn new(row: &JoinedRegionRow, centroid: Option<Coordinates>) -> Self {
        Self {
            name: row.canonical_name.clone(),
            price_per_sqm: row.price.to_sentinel(),
            has_data: row.price.is_present(),
            group: row.group_label.clone(),
            source_name: row.source_name.clone(),
            date: row.date.map(month_label),
            centroid,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct SeriesResponse {
    /// `None` when the series covers every region.
    region: Option<String>,
    points: Vec<SeriesPoint>,
}

#[derive(Debug, Serialize)]
pub struct SummaryResponse {
    dataset: String,
    regions: usize,
    matched: usize,
    missing: usize,
    advisory: Option<String>,
    dropped_rows: usize,
    unmatched_sources: Vec<String>,
    prices: Option<Summary>,
}

#[derive(Debug, Serialize)]
pub struct ListingView {
    #[serde(flatten)]
    listing: Listing,
    band: PriceBand,
}

#[derive(Debug, Serialize)]
pub struct ListingsResponse {
    dataset: String,
    dropped_rows: usize,
    /// Filter choices over every listing, before filtering.
    facets: ListingFacets,
    summary: Option<ListingSummary>,
    listings: Vec<ListingView>,
}

/// Errors surfaced to the dashboard as `{ "error", "remediation" }`.
#[derive(Debug)]
pub enum ApiError {
    Dashboard(DashboardError),
    BadRequest(String),
    Internal(String),
}

impl From<DashboardError> for ApiError {
    fn from(e: DashboardError) -> Self {
        ApiError::Dashboard(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message, remediation) = match &self {
            ApiError::Dashboard(e) => {
                let status = match e {
                    DashboardError::MissingSource(_) => StatusCode::NOT_FOUND,
                    DashboardError::Auth { .. } => StatusCode::UNAUTHORIZED,
                    DashboardError::Upstream { .. } => StatusCode::BAD_GATEWAY,
                    _ => StatusCode::INTERNAL_SERVER_ERROR,
                };
                (status, e.to_string(), e.remediation())
            }
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone(), None),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg.clone(), None),
        };
        if status.is_server_error() {
            error!(%status, %message, "Request failed");
        }
        let body = serde_json::json!({ "error": message, "remediation": remediation });
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

pub fn router(state: Arc<AppState>) -> Router {
    let mut app = Router::new()
        .route("/api/choropleth", get(choropleth_handler))
        .route("/api/scale", get(scale_handler))
        .route("/api/regions", get(regions_handler))
        .route("/api/query", get(query_handler))
        .route("/api/series", get(series_handler))
        .route("/api/movers", get(movers_handler))
        .route("/api/groups", get(groups_handler))
        .route("/api/histogram", get(histogram_handler))
        .route("/api/summary", get(summary_handler))
        .route("/api/export.csv", get(export_handler))
        .route("/api/listings", get(listings_handler))
        .route("/api/listings/municipios", get(listing_stats_handler))
        .route("/api/listings/heat", get(listing_heat_handler))
        .route("/api/listings.csv", get(listing_export_handler))
        .route("/map.png", get(map_handler));

    if let Some(dir) = &state.dashboard.config().server.static_dir {
        app = app.fallback_service(ServeDir::new(dir));
    }

    app.layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn start_server(dashboard: Dashboard) -> Result<()> {
    let port = dashboard.config().server.port;
    let state = Arc::new(AppState { dashboard });

    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    println!("Starting server on http://{}", addr);
    info!(%addr, "Listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router(state)).await?;
    Ok(())
}

impl AppState {
    fn select(&self, view: &ViewParams) -> ApiResult<&DatasetConfig> {
        let datasets = &self.dashboard.config().datasets;
        let found = match (&view.dataset, view.kind) {
            (Some(name), _) => datasets.iter().find(|d| &d.name == name),
            (None, Some(kind)) => datasets.iter().find(|d| d.kind == kind),
            (None, None) => datasets.first(),
        };
        found.ok_or_else(|| ApiError::BadRequest("No dataset matches the request".to_string()))
    }

    /// Named dataset, or the first listings dataset.
    async fn listings(&self, view: &ViewParams) -> ApiResult<ListingSnapshot> {
        let datasets = &self.dashboard.config().datasets;
        let dataset = match &view.dataset {
            Some(name) => datasets.iter().find(|d| &d.name == name),
            None => datasets.iter().find(|d| d.format == TableFormat::Listings),
        }
        .filter(|d| d.format == TableFormat::Listings)
        .ok_or_else(|| {
            ApiError::BadRequest("No listings dataset matches the request".to_string())
        })?;
        Ok(self.dashboard.listings(dataset).await?)
    }

    async fn snapshot(&self, view: &ViewParams) -> ApiResult<(&DatasetConfig, Snapshot)> {
        let dataset = self.select(view)?;
        let range = MonthRange {
            from: month_param("from", view.from.as_deref())?,
            to: month_param("to", view.to.as_deref())?,
        };
        let snapshot = self.dashboard.snapshot(dataset, range).await?;
        Ok((dataset, snapshot))
    }
}

fn month_param(field: &str, value: Option<&str>) -> ApiResult<Option<chrono::NaiveDate>> {
    match value.map(str::trim).filter(|v| !v.is_empty()) {
        None => Ok(None),
        Some(v) => parse_month(v)
            .map(Some)
            .ok_or_else(|| ApiError::BadRequest(format!("Invalid month for '{}': {}", field, v))),
    }
}

impl ListingParams {
    /// Municipality names go through the same normalizer as the listings.
    fn filter(&self, snapshot: &ListingSnapshot) -> ApiResult<ListingFilter> {
        let rooms: Vec<u32> = match self.rooms.as_deref().map(str::trim).filter(|r| !r.is_empty()) {
            None => Vec::new(),
            Some(list) => list
                .split(',')
                .map(|r| r.trim().parse::<u32>())
                .collect::<Result<_, _>>()
                .map_err(|_| ApiError::BadRequest(format!("Invalid room list: {}", list)))?,
        };
        Ok(ListingFilter {
            municipio: self
                .municipio
                .as_deref()
                .map(str::trim)
                .filter(|m| !m.is_empty())
                .map(|m| snapshot.normalizer.normalize_str(m)),
            min_price: self.min_price,
            max_price: self.max_price,
            rooms,
        })
    }
}

async fn filtered_listings(
    state: &AppState,
    view: &ViewParams,
    params: &ListingParams,
) -> ApiResult<(ListingSnapshot, Vec<Listing>)> {
    let snapshot = state.listings(view).await?;
    let selected = params.filter(&snapshot)?.apply(&snapshot.listings);
    Ok((snapshot, selected))
}

async fn choropleth_handler(
    State(state): State<Arc<AppState>>,
    Query(view): Query<ViewParams>,
) -> ApiResult<Json<FeatureCollection>> {
    let (dataset, snapshot) = state.snapshot(&view).await?;
    Ok(Json(choropleth_geojson(&snapshot, &dataset.name_property)))
}

async fn scale_handler(
    State(state): State<Arc<AppState>>,
    Query(view): Query<ViewParams>,
) -> ApiResult<Json<ColorScale>> {
    let (_, snapshot) = state.snapshot(&view).await?;
    Ok(Json(snapshot.scale))
}

async fn regions_handler(
    State(state): State<Arc<AppState>>,
    Query(view): Query<ViewParams>,
) -> ApiResult<Json<Vec<RegionView>>> {
    let (_, snapshot) = state.snapshot(&view).await?;
    let points = centroids(&snapshot.boundary);
    let regions = snapshot
        .joined
        .rows()
        .iter()
        .zip(points)
        .map(|(row, centroid)| RegionView::new(row, centroid))
        .collect();
    Ok(Json(regions))
}

async fn query_handler(
    State(state): State<Arc<AppState>>,
    Query(view): Query<ViewParams>,
    Query(params): Query<QueryParams>,
) -> ApiResult<Json<Option<RegionView>>> {
    let (_, snapshot) = state.snapshot(&view).await?;
    let index = RegionIndex::build(&snapshot.boundary);

    let found = index
        .locate(&snapshot.boundary, params.lon, params.lat)
        .and_then(|i| snapshot.joined.rows().get(i))
        .map(|row| RegionView::new(row, None));
    Ok(Json(found))
}

async fn series_handler(
    State(state): State<Arc<AppState>>,
    Query(view): Query<ViewParams>,
    Query(params): Query<SeriesParams>,
) -> ApiResult<Json<SeriesResponse>> {
    let (_, snapshot) = state.snapshot(&view).await?;
    let response = match params.region.as_deref().map(str::trim).filter(|r| !r.is_empty()) {
        Some(region) => {
            let canonical = snapshot.normalizer.normalize_str(region);
            SeriesResponse {
                points: time_series(&snapshot.records, &canonical),
                region: Some(canonical),
            }
        }
        None => SeriesResponse {
            region: None,
            points: overall_series(&snapshot.records),
        },
    };
    Ok(Json(response))
}

async fn movers_handler(
    State(state): State<Arc<AppState>>,
    Query(view): Query<ViewParams>,
    Query(params): Query<MoversParams>,
) -> ApiResult<Json<Movers>> {
    let (_, snapshot) = state.snapshot(&view).await?;
    let variations = monthly_variation(&snapshot.records);
    Ok(Json(top_movers(&variations, params.n.unwrap_or(DEFAULT_MOVERS))))
}

async fn groups_handler(
    State(state): State<Arc<AppState>>,
    Query(view): Query<ViewParams>,
) -> ApiResult<Json<Vec<GroupStat>>> {
    let (_, snapshot) = state.snapshot(&view).await?;
    Ok(Json(group_averages(&snapshot.joined)))
}

async fn histogram_handler(
    State(state): State<Arc<AppState>>,
    Query(view): Query<ViewParams>,
    Query(params): Query<HistogramParams>,
) -> ApiResult<Json<Vec<Bin>>> {
    let bins = params.bins.unwrap_or(DEFAULT_BINS);
    if !(1..=MAX_BINS).contains(&bins) {
        return Err(ApiError::BadRequest(format!(
            "'bins' must be between 1 and {}, got {}",
            MAX_BINS, bins
        )));
    }
    let (_, snapshot) = state.snapshot(&view).await?;
    let prices: Vec<f64> = snapshot.records.iter().map(|r| r.price_per_sqm).collect();
    Ok(Json(histogram(&prices, bins)))
}

async fn summary_handler(
    State(state): State<Arc<AppState>>,
    Query(view): Query<ViewParams>,
) -> ApiResult<Json<SummaryResponse>> {
    let (_, snapshot) = state.snapshot(&view).await?;
    let joined = &snapshot.joined;
    Ok(Json(SummaryResponse {
        dataset: snapshot.dataset.clone(),
        regions: joined.len(),
        matched: joined.matched_count(),
        missing: joined.missing_count(),
        advisory: joined.missing_advisory(),
        dropped_rows: snapshot.dropped_rows,
        unmatched_sources: joined.unmatched_sources().to_vec(),
        prices: summarize(&joined.real_prices()),
    }))
}

async fn export_handler(
    State(state): State<Arc<AppState>>,
    Query(view): Query<ViewParams>,
) -> ApiResult<Response> {
    let (_, snapshot) = state.snapshot(&view).await?;
    let body = joined_csv(snapshot.joined.rows())?;
    let disposition = format!("attachment; filename=\"{}.csv\"", snapshot.dataset);
    Ok((
        [
            (header::CONTENT_TYPE, "text/csv; charset=utf-8".to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        body,
    )
        .into_response())
}

async fn map_handler(
    State(state): State<Arc<AppState>>,
    Query(view): Query<ViewParams>,
) -> ApiResult<Response> {
    let (_, snapshot) = state.snapshot(&view).await?;
    let output = &state.dashboard.config().output;
    let (width, height) = (output.width, output.height);

    let png = tokio::task::spawn_blocking(move || encode_png(&render_map(&snapshot, width, height)))
        .await
        .map_err(|e| ApiError::Internal(format!("Render task failed: {}", e)))??;

    Ok(([(header::CONTENT_TYPE, "image/png")], png).into_response())
}

async fn listings_handler(
    State(state): State<Arc<AppState>>,
    Query(view): Query<ViewParams>,
    Query(params): Query<ListingParams>,
) -> ApiResult<Json<ListingsResponse>> {
    let (snapshot, selected) = filtered_listings(&state, &view, &params).await?;
    let summary = summarize_listings(&selected);
    let mean = summary.map(|s| s.mean_price_per_sqm).unwrap_or(0.0);

    Ok(Json(ListingsResponse {
        dataset: snapshot.dataset.clone(),
        dropped_rows: snapshot.dropped_rows,
        facets: facets(&snapshot.listings),
        summary,
        listings: selected
            .into_iter()
            .map(|listing| ListingView {
                band: price_band(listing.precio_m2, mean),
                listing,
            })
            .collect(),
    }))
}

async fn listing_stats_handler(
    State(state): State<Arc<AppState>>,
    Query(view): Query<ViewParams>,
    Query(params): Query<ListingParams>,
) -> ApiResult<Json<Vec<MunicipioStat>>> {
    let (_, selected) = filtered_listings(&state, &view, &params).await?;
    Ok(Json(municipio_stats(&selected)))
}

async fn listing_heat_handler(
    State(state): State<Arc<AppState>>,
    Query(view): Query<ViewParams>,
    Query(params): Query<ListingParams>,
) -> ApiResult<Json<Vec<HeatPoint>>> {
    let (_, selected) = filtered_listings(&state, &view, &params).await?;
    Ok(Json(heat_points(&selected)))
}

async fn listing_export_handler(
    State(state): State<Arc<AppState>>,
    Query(view): Query<ViewParams>,
    Query(params): Query<ListingParams>,
) -> ApiResult<Response> {
    let (snapshot, selected) = filtered_listings(&state, &view, &params).await?;
    let body = listings_csv(&selected)?;
    let disposition = format!("attachment; filename=\"{}_filtrado.csv\"", snapshot.dataset);
    Ok((
        [
            (header::CONTENT_TYPE, "text/csv; charset=utf-8".to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        body,
    )
        .into_response())
}
