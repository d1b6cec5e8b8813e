//! HTTP API
//!
//! Routes:
//! - `POST /convert`               submit a scene for conversion
//! - `GET  /status/:source_id`     ledger state of a scene
//! - `GET  /info/:bucket/*key`     artifact metadata
//! - `GET  /tiles/:bucket/*rest`   map tiles, `rest` ends in `/z/x/y.png`
//! - `GET  /health`                backend liveness
//!
//! All routes except `/` and `/health` sit behind the API key middleware.

use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    middleware as axum_middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tracing::warn;

use crate::config::Config;
use crate::error::AppError;
use crate::ledger::{ConversionJob, JobLedger, JobStatus};
use crate::middleware::{api_key::require_api_key, cors_layer, tracing_layer};
use crate::pipeline::{Orchestrator, SubmitOutcome};
use crate::storage::ObjectStore;
use crate::tiles::TileService;

/// Browser cache lifetime for rendered tiles
const TILE_CACHE_CONTROL: &str = "public, max-age=3600";

#[derive(Clone)]
pub struct AppState {
    pub ledger: Arc<dyn JobLedger>,
    pub objects: Arc<dyn ObjectStore>,
    pub orchestrator: Arc<Orchestrator>,
    pub tiles: Arc<TileService>,
    pub config: Arc<Config>,
}

/// Build the full application router
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/convert", post(convert))
        .route("/status/:source_id", get(status))
        .route("/info/:bucket/*key", get(info))
        .route("/tiles/:bucket/*rest", get(tile))
        .layer(axum_middleware::from_fn_with_state(
            state.clone(),
            require_api_key,
        ))
        .layer(cors_layer(&state.config.cors))
        .layer(tracing_layer())
        .with_state(state)
}

async fn root() -> Json<serde_json::Value> {
    Json(json!({
        "service": "cogger-server",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// GET /health
///
/// Reports per-backend status; 503 when any backend is down
async fn health(State(state): State<AppState>) -> Response {
    let ledger_ok = match state.ledger.ping().await {
        Ok(()) => true,
        Err(e) => {
            warn!("ledger health check failed: {}", e);
            false
        },
    };
    let storage_ok = match state.objects.ping().await {
        Ok(()) => true,
        Err(e) => {
            warn!("storage health check failed: {}", e);
            false
        },
    };

    let healthy = ledger_ok && storage_ok;
    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    let body = Json(json!({
        "status": if healthy { "ok" } else { "degraded" },
        "ledger": if ledger_ok { "up" } else { "down" },
        "storage": if storage_ok { "up" } else { "down" },
    }));

    (status, body).into_response()
}

#[derive(Debug, Deserialize)]
struct ConvertRequest {
    source_id: String,
}

/// POST /convert
///
/// Accepts the scene for background conversion; replays the stored outcome
/// when the scene is already converted or in flight
async fn convert(
    State(state): State<AppState>,
    Json(request): Json<ConvertRequest>,
) -> Result<Response, AppError> {
    let source_id = request.source_id.trim();

    match state.orchestrator.submit(source_id).await? {
        SubmitOutcome::Accepted | SubmitOutcome::AlreadyProcessing => Ok((
            StatusCode::ACCEPTED,
            Json(json!({
                "source_id": source_id,
                "status": JobStatus::Processing.as_str(),
            })),
        )
            .into_response()),
        SubmitOutcome::Ready(location) => Ok((
            StatusCode::OK,
            Json(json!({
                "source_id": source_id,
                "status": JobStatus::Ready.as_str(),
                "location": {
                    "bucket": location.bucket,
                    "path": location.path,
                    "uri": location.uri(),
                },
            })),
        )
            .into_response()),
    }
}

/// GET /status/:source_id
///
/// Unknown scenes report `not_available` rather than 404, matching the
/// claimable ledger state they would start from
async fn status(
    State(state): State<AppState>,
    Path(source_id): Path<String>,
) -> Result<Response, AppError> {
    match state.ledger.get(&source_id).await? {
        Some(job) => Ok(Json(job_document(&job)).into_response()),
        None => Ok(Json(json!({
            "source_id": source_id,
            "status": JobStatus::NotAvailable.as_str(),
        }))
        .into_response()),
    }
}

fn job_document(job: &ConversionJob) -> serde_json::Value {
    let mut doc = json!({
        "source_id": job.source_id,
        "status": job.status.as_str(),
        "created_at": job.created_at,
        "updated_at": job.updated_at,
    });
    if let Some(location) = job.location() {
        doc["location"] = json!({
            "bucket": location.bucket,
            "path": location.path,
            "uri": location.uri(),
        });
    }
    if let Some(detail) = &job.error_detail {
        doc["error_detail"] = json!(detail);
    }
    doc
}

/// GET /info/:bucket/*key
async fn info(
    State(state): State<AppState>,
    Path((bucket, key)): Path<(String, String)>,
) -> Result<Response, AppError> {
    let header = state.tiles.header(&bucket, &key).await.map_err(AppError::from)?;
    let full = header.full();

    let (min_x, min_y, max_x, max_y) = header.georef.bounds(full.width, full.height);
    let geographic = header
        .georef
        .geographic_bounds(full.width, full.height)
        .map_err(|e| AppError::Validation(e.to_string()))?;

    Ok(Json(json!({
        "bucket": bucket,
        "path": key,
        "width": full.width,
        "height": full.height,
        "tile_size": full.tile_width,
        "bands": full.samples_per_pixel,
        "dtype": "uint8",
        "nodata": crate::cog::NODATA,
        "overviews": header.ifds.len() - 1,
        "crs": format!("EPSG:{}", header.georef.epsg),
        "bounds": [min_x, min_y, max_x, max_y],
        "geographic_bounds": {
            "west": geographic.0,
            "south": geographic.1,
            "east": geographic.2,
            "north": geographic.3,
        },
    }))
    .into_response())
}

/// GET /tiles/:bucket/*rest
///
/// The wildcard carries both the object key and the tile address:
/// `<key>/<z>/<x>/<y>.png`
async fn tile(
    State(state): State<AppState>,
    Path((bucket, rest)): Path<(String, String)>,
) -> Result<Response, AppError> {
    let (key, z, x, y) = parse_tile_path(&rest)
        .ok_or_else(|| AppError::BadRequest(format!("malformed tile path: {rest}")))?;

    let png = state.tiles.render(&bucket, key, z, x, y).await?;

    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "image/png"),
            (header::CACHE_CONTROL, TILE_CACHE_CONTROL),
        ],
        png,
    )
        .into_response())
}

/// Split `<key>/<z>/<x>/<y>[.png]` into its parts
fn parse_tile_path(rest: &str) -> Option<(&str, u32, u32, u32)> {
    let mut parts = rest.rsplitn(4, '/');
    let y = parts.next()?.trim_end_matches(".png").parse().ok()?;
    let x = parts.next()?.parse().ok()?;
    let z = parts.next()?.parse().ok()?;
    let key = parts.next()?;
    if key.is_empty() {
        return None;
    }
    Some((key, z, x, y))
}
