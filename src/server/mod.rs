//! Pipeline HTTP routes.
//!
//! Provides endpoints for:
//! - Uploading a track's master audio file
//! - Checking per-artifact processing status
//! - Reprocessing a terminal artifact key
//! - Health/preflight and pipeline statistics

use axum::{
    extract::{DefaultBodyLimit, Multipart, Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use std::path::Path as FsPath;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::AppConfig;
use crate::intake::{IntakeError, IntakeValidator};
use crate::pipeline::{
    ArtifactKey, PipelineOrchestrator, PipelineStats, ProcessingStatusStore, TrackProcessingView,
};
use crate::storage::save_master;
use crate::transcoder::Transcoder;

/// Identity/ownership check for uploads. Authentication itself lives in the
/// surrounding system; the pipeline only asks allow/deny.
pub trait UploadAuthorizer: Send + Sync {
    fn can_upload(&self, user_id: &str, track_id: &str) -> bool;
}

/// Authorizer that accepts every upload (single-tenant deployments).
pub struct AllowAllAuthorizer;

impl UploadAuthorizer for AllowAllAuthorizer {
    fn can_upload(&self, _user_id: &str, _track_id: &str) -> bool {
        true
    }
}

/// Shared state handed to every route.
pub struct ServerState {
    pub orchestrator: Arc<PipelineOrchestrator>,
    pub validator: Arc<IntakeValidator>,
    pub transcoder: Arc<dyn Transcoder>,
    pub store: Arc<dyn ProcessingStatusStore>,
    pub authorizer: Arc<dyn UploadAuthorizer>,
    pub config: AppConfig,
}

// =============================================================================
// Request/Response Types
// =============================================================================

#[derive(Debug, Serialize)]
pub struct UploadResponse {
    pub track_id: String,
    pub state: String,
    pub duration_secs: f64,
}

#[derive(Debug, Serialize)]
pub struct RejectionResponse {
    pub error: String,
    pub rejection: IntakeError,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub transcoder_available: bool,
    pub transcoder_version: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

fn error_response(status: StatusCode, message: impl Into<String>) -> axum::response::Response {
    (
        status,
        Json(ErrorResponse {
            error: message.into(),
        }),
    )
        .into_response()
}

// =============================================================================
// Routes
// =============================================================================

/// POST /tracks/:track_id/master - Upload a master file (multipart/form-data)
async fn upload_master(
    State(state): State<Arc<ServerState>>,
    Path(track_id): Path<String>,
    mut multipart: Multipart,
) -> impl IntoResponse {
    let mut filename: Option<String> = None;
    let mut data: Option<Vec<u8>> = None;
    let mut user_id = "anonymous".to_string();

    while let Ok(Some(field)) = multipart.next_field().await {
        let field_name = field.name().unwrap_or("").to_string();
        match field_name.as_str() {
            "file" => {
                filename = field.file_name().map(|s| s.to_string());
                match field.bytes().await {
                    Ok(bytes) => data = Some(bytes.to_vec()),
                    Err(e) => {
                        warn!("Failed to read upload data: {}", e);
                        return error_response(StatusCode::BAD_REQUEST, "Failed to read file");
                    }
                }
            }
            "user_id" => {
                if let Ok(bytes) = field.bytes().await {
                    let value = String::from_utf8_lossy(&bytes).to_string();
                    if !value.is_empty() {
                        user_id = value;
                    }
                }
            }
            _ => {}
        }
    }

    if !state.authorizer.can_upload(&user_id, &track_id) {
        return StatusCode::FORBIDDEN.into_response();
    }

    let Some(filename) = filename.filter(|f| !f.is_empty()) else {
        return error_response(StatusCode::BAD_REQUEST, "No filename provided");
    };
    let Some(data) = data.filter(|d| !d.is_empty()) else {
        return error_response(StatusCode::BAD_REQUEST, "No file data provided");
    };

    if data.len() as u64 > state.config.pipeline.max_upload_bytes {
        return error_response(StatusCode::PAYLOAD_TOO_LARGE, "Upload exceeds size limit");
    }

    let extension = FsPath::new(&filename)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase())
        .unwrap_or_default();
    if extension.is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "Filename has no extension");
    }

    debug!(
        "User {} uploading master for track {}: {} ({} bytes)",
        user_id,
        track_id,
        filename,
        data.len()
    );

    // Store the master once; it is read-only from here on
    let master_path =
        match save_master(&state.config.media_path, &track_id, &extension, &data).await {
            Ok(path) => path,
            Err(e) => {
                warn!("Failed to store master for track {}: {}", track_id, e);
                return error_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Failed to store master file",
                );
            }
        };

    // Synchronous validation: no job is ever scheduled for invalid input
    let descriptor = match state.validator.validate(&master_path).await {
        Ok(d) => d,
        Err(rejection) => {
            info!("Intake rejected track {}: {}", track_id, rejection);
            if let Err(e) = state.orchestrator.on_intake_rejected(&track_id) {
                warn!("Failed to record rejection for {}: {:#}", track_id, e);
            }
            let _ = tokio::fs::remove_file(&master_path).await;
            return (
                StatusCode::UNPROCESSABLE_ENTITY,
                Json(RejectionResponse {
                    error: rejection.to_string(),
                    rejection,
                }),
            )
                .into_response();
        }
    };

    match state
        .orchestrator
        .on_intake_validated(&track_id, &master_path, &descriptor)
    {
        Ok(()) => Json(UploadResponse {
            track_id,
            state: "PROCESSING".to_string(),
            duration_secs: descriptor.duration_secs,
        })
        .into_response(),
        Err(e) => {
            warn!("Fan-out failed for track {}: {:#}", track_id, e);
            error_response(StatusCode::CONFLICT, e.to_string())
        }
    }
}

/// GET /tracks/:track_id/processing - Full per-artifact status
async fn get_processing_status(
    State(state): State<Arc<ServerState>>,
    Path(track_id): Path<String>,
) -> Result<Json<TrackProcessingView>, axum::response::Response> {
    state
        .orchestrator
        .get_processing_status(&track_id)
        .map(Json)
        .map_err(|e| {
            warn!("Failed to read status for {}: {:#}", track_id, e);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to read status")
        })
}

/// POST /tracks/:track_id/reprocess/:key - Reset a terminal key and rerun it
async fn reprocess_artifact(
    State(state): State<Arc<ServerState>>,
    Path((track_id, key)): Path<(String, String)>,
) -> impl IntoResponse {
    let Some(key) = ArtifactKey::parse(&key) else {
        return error_response(StatusCode::BAD_REQUEST, format!("Unknown artifact key: {}", key));
    };

    match state.orchestrator.reprocess(&track_id, key) {
        Ok(()) => StatusCode::ACCEPTED.into_response(),
        Err(e) => {
            debug!("Reprocess {}/{} refused: {:#}", track_id, key, e);
            error_response(StatusCode::CONFLICT, e.to_string())
        }
    }
}

/// GET /health - Environment preflight, surfaced here rather than per job
async fn health(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    let available = state.transcoder.is_available().await;
    let version = state.transcoder.version().await;

    let status_code = if available {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status_code,
        Json(HealthResponse {
            status: if available { "ok" } else { "degraded" },
            transcoder_available: available,
            transcoder_version: version,
        }),
    )
}

/// GET /stats - Aggregate pipeline counts
async fn stats(
    State(state): State<Arc<ServerState>>,
) -> Result<Json<PipelineStats>, axum::response::Response> {
    state.store.stats().map(Json).map_err(|e| {
        warn!("Failed to read stats: {:#}", e);
        error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to read stats")
    })
}

/// Build the pipeline router.
pub fn create_router(state: Arc<ServerState>) -> Router {
    let upload_limit = state.config.pipeline.max_upload_bytes as usize;
    Router::new()
        .route("/tracks/{track_id}/master", post(upload_master))
        .route("/tracks/{track_id}/processing", get(get_processing_status))
        .route("/tracks/{track_id}/reprocess/{key}", post(reprocess_artifact))
        .route("/health", get(health))
        .route("/stats", get(stats))
        .layer(DefaultBodyLimit::max(upload_limit))
        .with_state(state)
}

/// Serve the pipeline API until the process is stopped.
pub async fn run_server(state: Arc<ServerState>, port: u16) -> anyhow::Result<()> {
    let router = create_router(state);
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    info!("Pipeline server listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router).await?;
    Ok(())
}
