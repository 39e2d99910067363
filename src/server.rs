use crate::config::AppConfig;
use crate::pipeline::{self, LevelOutcome};
use crate::types::{Level, Reduction};
use anyhow::Result;
use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tracing::{error, info};

const MAX_UPLOAD_BYTES: usize = 256 * 1024 * 1024;

pub struct AppState {
    pub config: AppConfig,
}

#[derive(Deserialize)]
pub struct UploadParams {
    filename: Option<String>,
}

#[derive(Serialize)]
pub struct UploadResponse {
    input: String,
    bytes: usize,
}

#[derive(Deserialize)]
pub struct ProcessRequest {
    /// Name returned by `/api/upload`; defaults to `input.data_csv`.
    input: Option<String>,
    levels: Option<Vec<Level>>,
    /// Column name to reduction for this run, over `aggregation.overrides`.
    overrides: Option<HashMap<String, Reduction>>,
}

pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn internal(err: impl std::fmt::Display) -> Self {
        error!("request failed: {}", err);
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

/// Keeps only the final path component so uploads cannot escape `dir`.
pub fn upload_path(dir: &Path, requested: &str) -> Option<PathBuf> {
    let name = Path::new(requested).file_name()?.to_str()?;
    if name.starts_with('.') {
        return None;
    }
    Some(dir.join(name))
}

/// Output prefix for an uploaded file, so separate uploads do not overwrite
/// each other's results.
pub fn dataset_for(input: &Path, fallback: &str) -> String {
    let stem: String = input
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or_default()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    if stem.trim_matches('_').is_empty() {
        fallback.to_string()
    } else {
        stem
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    let output = ServeDir::new(&state.config.output.dir);
    Router::new()
        .route("/api/health", get(health_handler))
        .route("/api/upload", post(upload_handler))
        .route("/api/process", post(process_handler))
        .nest_service("/output", output)
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub async fn start_server(config: AppConfig) -> Result<()> {
    tokio::fs::create_dir_all(&config.server.upload_dir).await?;
    tokio::fs::create_dir_all(&config.output.dir).await?;

    let addr = SocketAddr::from(([127, 0, 0, 1], config.server.port));
    let state = Arc::new(AppState { config });

    info!("starting server on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router(state)).await?;
    Ok(())
}

async fn health_handler() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

async fn upload_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<UploadParams>,
    body: Bytes,
) -> Result<Json<UploadResponse>, ApiError> {
    if body.is_empty() {
        return Err(ApiError::bad_request("empty upload"));
    }
    let requested = params.filename.unwrap_or_else(|| "upload.csv".to_string());
    let path = upload_path(&state.config.server.upload_dir, &requested)
        .ok_or_else(|| ApiError::bad_request(format!("invalid file name '{}'", requested)))?;

    tokio::fs::write(&path, &body).await.map_err(ApiError::internal)?;
    info!(bytes = body.len(), "stored upload {:?}", path);

    Ok(Json(UploadResponse {
        input: requested,
        bytes: body.len(),
    }))
}

async fn process_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ProcessRequest>,
) -> Result<Json<Vec<LevelOutcome>>, ApiError> {
    let input = match &request.input {
        Some(name) => upload_path(&state.config.server.upload_dir, name)
            .ok_or_else(|| ApiError::bad_request(format!("invalid file name '{}'", name)))?,
        None => state
            .config
            .input
            .data_csv
            .clone()
            .ok_or_else(|| ApiError::bad_request("no input given and none configured"))?,
    };
    if !input.exists() {
        return Err(ApiError::bad_request(format!("{:?} has not been uploaded", input)));
    }
    let levels = request
        .levels
        .filter(|l| !l.is_empty())
        .unwrap_or_else(|| state.config.input.levels.clone());

    let mut config = state.config.clone();
    if request.input.is_some() {
        config.input.dataset = dataset_for(&input, &state.config.input.dataset);
    }
    if let Some(overrides) = request.overrides {
        config.aggregation.apply_overrides(overrides);
    }

    let outcomes = tokio::task::spawn_blocking(move || pipeline::process_file(&input, &levels, &config))
        .await
        .map_err(ApiError::internal)?
        .map_err(ApiError::internal)?;
    Ok(Json(outcomes))
}
