//! REST surface: `GET /` liveness and `POST /face_recognition`.
//!
//! Every response to `/face_recognition` is HTTP 200; failures are reported
//! in the JSON body as `error-message` / `error-type`.

use crate::engine::{EngineError, EngineHandle};
use axum::body::Bytes;
use axum::extract::multipart::{Multipart, MultipartError};
use axum::extract::{DefaultBodyLimit, State};
use axum::response::Json;
use axum::routing::{get, post};
use axum::Router;
use serde_json::{json, Value};
use std::path::PathBuf;
use tempfile::NamedTempFile;
use thiserror::Error;
use tower_http::cors::{AllowHeaders, AllowMethods, AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;

/// Upload size limit.
pub const MAX_BODY_BYTES: usize = 50 * 1024 * 1024;

/// Multipart field carrying media files.
const MEDIA_FIELD: &str = "data";

#[derive(Error, Debug)]
pub enum RequestError {
    #[error("invalid upload: {0}")]
    Multipart(#[from] MultipartError),
    #[error("can't store upload: {0}")]
    Storage(#[from] std::io::Error),
    #[error(transparent)]
    Engine(#[from] EngineError),
}

impl RequestError {
    pub fn kind(&self) -> &'static str {
        match self {
            RequestError::Multipart(_) => "InvalidUpload",
            RequestError::Storage(_) => "StorageError",
            RequestError::Engine(err) => err.kind(),
        }
    }
}

/// One uploaded file.
#[derive(Debug, Clone)]
pub struct Upload {
    pub file_name: Option<String>,
    pub bytes: Bytes,
}

#[derive(Clone)]
struct AppState {
    engine: EngineHandle,
}

pub fn router(engine: EngineHandle) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::mirror_request())
        .allow_methods(AllowMethods::mirror_request())
        .allow_headers(AllowHeaders::mirror_request())
        .allow_credentials(true);

    Router::new()
        .route("/", get(home))
        .route("/face_recognition", post(face_recognition))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(AppState { engine })
}

async fn home() -> &'static str {
    "Service Running"
}

async fn face_recognition(State(state): State<AppState>, multipart: Multipart) -> Json<Value> {
    let result = match read_uploads(multipart).await {
        Ok(uploads) => recognize_uploads(&state.engine, uploads).await,
        Err(err) => Err(err),
    };
    Json(envelope(result))
}

async fn read_uploads(mut multipart: Multipart) -> Result<Vec<Upload>, RequestError> {
    let mut uploads = Vec::new();
    while let Some(field) = multipart.next_field().await? {
        if field.name() != Some(MEDIA_FIELD) {
            tracing::debug!(field = ?field.name(), "ignoring multipart field");
            continue;
        }
        let file_name = field.file_name().map(str::to_string);
        let bytes = field.bytes().await?;
        uploads.push(Upload { file_name, bytes });
    }
    Ok(uploads)
}

/// Store uploads as temporary files and identify the person across all of
/// them. The files are removed when this returns.
pub async fn recognize_uploads(engine: &EngineHandle, uploads: Vec<Upload>) -> Result<String, RequestError> {
    let mut files: Vec<NamedTempFile> = Vec::with_capacity(uploads.len());
    for upload in &uploads {
        let file = tempfile::Builder::new()
            .prefix("faceid-")
            .suffix(&format!(".{}", upload_extension(upload.file_name.as_deref())))
            .tempfile()?;
        tokio::fs::write(file.path(), &upload.bytes).await?;
        tracing::debug!(name = ?upload.file_name, bytes = upload.bytes.len(), path = %file.path().display(), "stored upload");
        files.push(file);
    }

    let media: Vec<PathBuf> = files.iter().map(|f| f.path().to_path_buf()).collect();
    let label = engine.recognize(media).await?;
    drop(files);
    Ok(label)
}

/// Extension of the client's file name; uploads without one are assumed JPEG.
fn upload_extension(file_name: Option<&str>) -> String {
    file_name
        .and_then(|name| std::path::Path::new(name).extension())
        .map(|ext| ext.to_string_lossy().to_ascii_lowercase())
        .filter(|ext| !ext.is_empty() && ext.chars().all(|c| c.is_ascii_alphanumeric()))
        .unwrap_or_else(|| "jpg".to_string())
}

fn envelope(result: Result<String, RequestError>) -> Value {
    match result {
        Ok(label) => json!({ "Person Identified": label }),
        Err(err) => json!({
            "error-message": err.to_string(),
            "error-type": err.kind(),
        }),
    }
}
