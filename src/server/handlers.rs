//! HTTP handlers
//!
//! Four routes: the liveness probe, the dynamic layer.json/terrain
//! endpoints parameterized per request, and their named-dataset twins
//! whose parameters are locked to the dataset config. Core errors map
//! onto status codes here; bodies are small JSON objects and never
//! carry stack traces.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Serialize;
use serde_json::json;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::core::error::Error;
use crate::core::factory::{TerrainFactory, TileRequest};
use crate::core::tms::{TileKey, TileMatrixSet};
use crate::server::config::DatasetConfig;
use crate::server::layer::layer_json;
use crate::server::queries::{octvertexnormals_enabled, TileOptions, TileQuery};

pub struct AppState {
    pub factory: TerrainFactory,
    pub datasets: DatasetConfig,
    pub tms: TileMatrixSet,
    pub no_dynamic: bool,
    pub started_at: SystemTime,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
}

pub fn router(state: Arc<AppState>, cors: CorsLayer) -> Router {
    Router::new()
        .route("/status", get(status))
        .route("/tiles/dynamic/layer.json", get(dynamic_layer))
        .route("/tiles/dynamic/:z/:x/:y", get(dynamic_terrain))
        .route("/tiles/:dataset/layer.json", get(dataset_layer))
        .route("/tiles/:dataset/:z/:x/:y", get(dataset_terrain))
        .layer(CatchPanicLayer::new())
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

fn status_code(err: &Error) -> StatusCode {
    match err {
        Error::BadRequest(_) | Error::NoSuchTms(_) | Error::TileOutOfRange(_) => {
            StatusCode::BAD_REQUEST
        }
        Error::NoSuchDataset(_) => StatusCode::NOT_FOUND,
        Error::UnsafeRequest(_) => StatusCode::PAYLOAD_TOO_LARGE,
        Error::SourceUnavailable(_) => StatusCode::BAD_GATEWAY,
        Error::Timeout => StatusCode::GATEWAY_TIMEOUT,
        Error::Overloaded => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(err: &Error) -> Response {
    (
        status_code(err),
        Json(ErrorBody {
            error: err.kind(),
            message: err.to_string(),
        }),
    )
        .into_response()
}

fn dynamic_disabled() -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(ErrorBody {
            error: "NoSuchDataset",
            message: "Dynamic tiles are disabled".into(),
        }),
    )
        .into_response()
}

async fn status(State(state): State<Arc<AppState>>) -> Response {
    let uptime = state.started_at.elapsed().unwrap_or_default();
    Json(json!({
        "status": "ok",
        "start_time": format_rfc3339(state.started_at),
        "uptime": format_uptime(uptime),
    }))
    .into_response()
}

async fn dynamic_layer(
    State(state): State<Arc<AppState>>,
    Query(query): Query<TileQuery>,
) -> Response {
    if state.no_dynamic {
        return dynamic_disabled();
    }
    let options = match query.resolve() {
        Ok(options) => options,
        Err(err) => return error_response(&err),
    };
    layer_response(&state, options, true).await
}

async fn dataset_layer(
    State(state): State<Arc<AppState>>,
    Path(dataset): Path<String>,
) -> Response {
    let options = match dataset_options(&state, &dataset) {
        Ok(options) => options,
        Err(err) => return error_response(&err),
    };
    layer_response(&state, options, false).await
}

async fn layer_response(state: &AppState, options: TileOptions, dynamic: bool) -> Response {
    match state.factory.open_dataset(&options.cog).await {
        Ok(source) => {
            Json(layer_json(state.tms, &source.info().bounds, &options, dynamic)).into_response()
        }
        Err(err) => error_response(&err),
    }
}

async fn dynamic_terrain(
    State(state): State<Arc<AppState>>,
    Path((z, x, y)): Path<(u8, u32, String)>,
    Query(query): Query<TileQuery>,
    headers: HeaderMap,
) -> Response {
    if state.no_dynamic {
        return dynamic_disabled();
    }
    let options = match query.resolve() {
        Ok(options) => options,
        Err(err) => return error_response(&err),
    };
    serve_tile(&state, options, z, x, &y, &headers).await
}

async fn dataset_terrain(
    State(state): State<Arc<AppState>>,
    Path((dataset, z, x, y)): Path<(String, u8, u32, String)>,
    headers: HeaderMap,
) -> Response {
    let options = match dataset_options(&state, &dataset) {
        Ok(options) => options,
        Err(err) => return error_response(&err),
    };
    serve_tile(&state, options, z, x, &y, &headers).await
}

fn dataset_options(
    state: &AppState,
    dataset: &str,
) -> std::result::Result<TileOptions, Error> {
    state
        .datasets
        .get(dataset)
        .ok_or_else(|| Error::NoSuchDataset(dataset.to_string()))?
        .resolve()
}

async fn serve_tile(
    state: &AppState,
    options: TileOptions,
    z: u8,
    x: u32,
    y_segment: &str,
    headers: &HeaderMap,
) -> Response {
    let y: u32 = match y_segment
        .strip_suffix(".terrain")
        .and_then(|y| y.parse().ok())
    {
        Some(y) => y,
        None => {
            return error_response(&Error::BadRequest(format!(
                "expected a '{{y}}.terrain' path segment, got '{}'",
                y_segment
            )))
        }
    };

    // Cesium numbers rows from the south; flip to the matrix index
    let (cols, rows) = state.tms.matrix_size(z);
    if x >= cols || y >= rows {
        return error_response(&Error::TileOutOfRange(format!(
            "{}/{}/{} exceeds {}x{} matrix",
            z, x, y, cols, rows
        )));
    }
    let (x, y) = state.tms.tile_index_from_cesium(z, x, y);

    let accept = headers
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok());
    let with_normals = octvertexnormals_enabled(accept, options.extensions.as_deref());

    let request = TileRequest {
        tms: state.tms,
        tile: TileKey::new(z, x, y),
        cog: options.cog,
        min_zoom: options.min_zoom,
        resampling: options.resampling,
        no_data: options.no_data,
        method: options.method,
        tables: options.tables,
        skip_cache: options.skip_cache,
        with_normals,
    };

    match state.factory.get_tile(&request).await {
        Ok(artifact) => (
            StatusCode::OK,
            [
                (header::CONTENT_TYPE, artifact.content_type.to_string()),
                (header::ETAG, format!("\"{}\"", artifact.etag)),
            ],
            artifact.bytes,
        )
            .into_response(),
        Err(err) => error_response(&err),
    }
}

fn format_uptime(uptime: Duration) -> String {
    let total = uptime.as_secs();
    let days = total / 86_400;
    let hours = (total % 86_400) / 3_600;
    let minutes = (total % 3_600) / 60;
    let seconds = total % 60;
    format!("{}d {}h {}m {}s", days, hours, minutes, seconds)
}

fn format_rfc3339(t: SystemTime) -> String {
    let secs = t.duration_since(UNIX_EPOCH).unwrap_or_default().as_secs();
    let (year, month, day) = civil_from_days((secs / 86_400) as i64);
    let rem = secs % 86_400;
    format!(
        "{:04}-{:02}-{:02}T{:02}:{:02}:{:02}Z",
        year,
        month,
        day,
        rem / 3_600,
        (rem % 3_600) / 60,
        rem % 60
    )
}

/// Days since 1970-01-01 to a civil date (Gregorian, proleptic)
fn civil_from_days(days: i64) -> (i64, u32, u32) {
    let z = days + 719_468;
    let era = if z >= 0 { z } else { z - 146_096 } / 146_097;
    let doe = (z - era * 146_097) as u64;
    let yoe = (doe - doe / 1_460 + doe / 36_524 - doe / 146_096) / 365;
    let year = yoe as i64 + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let month = if mp < 10 { mp + 3 } else { mp - 9 } as u32;
    (if month <= 2 { year + 1 } else { year }, month, day)
}
