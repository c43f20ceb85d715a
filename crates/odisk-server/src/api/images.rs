use std::collections::BTreeMap;
use std::path::Path as FsPath;

use axum::extract::{Multipart, Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get};
use axum::{Json, Router};
use odisk_media::{is_image_file, DiskError, DiskSummary, IMAGE_EXTENSIONS};
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use crate::AppState;

/// Multipart field carrying the uploaded image.
const UPLOAD_FIELD: &str = "image";

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/images", get(list_images).post(upload_image))
        .route("/images/:id", delete(delete_image))
}

#[derive(Debug, serde::Serialize)]
pub struct UploadResponse {
    pub size: u64,
    pub success: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("disk not found")]
    NotFound,
    #[error("{0}")]
    Forbidden(String),
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("{0} is not supported")]
    NotImplemented(&'static str),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Disk(DiskError),
}

impl From<DiskError> for ApiError {
    fn from(err: DiskError) -> Self {
        match err {
            DiskError::NotImplemented(operation) => ApiError::NotImplemented(operation),
            other => ApiError::Disk(other),
        }
    }
}

impl From<axum::extract::multipart::MultipartError> for ApiError {
    fn from(err: axum::extract::multipart::MultipartError) -> Self {
        ApiError::BadRequest(err.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::NotFound => StatusCode::NOT_FOUND,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotImplemented(_) => StatusCode::NOT_IMPLEMENTED,
            ApiError::Io(_) | ApiError::Disk(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() && status != StatusCode::NOT_IMPLEMENTED {
            tracing::error!(error = %self, "image api request failed");
        }
        (status, Json(serde_json::json!({ "error": self.to_string() }))).into_response()
    }
}

pub async fn list_images(State(state): State<AppState>) -> Json<BTreeMap<String, DiskSummary>> {
    let snapshot = state.registry.snapshot();
    let mut disks = BTreeMap::new();
    for (id, disk) in snapshot.iter() {
        disks.insert(id.to_string(), disk.summary().await);
    }
    Json(disks)
}

pub async fn upload_image(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<UploadResponse>, ApiError> {
    while let Some(mut field) = multipart.next_field().await? {
        if field.name() != Some(UPLOAD_FIELD) {
            continue;
        }

        let name = upload_file_name(field.file_name())?;
        let root = state.registry.image_root().to_path_buf();
        let dest = root.join(&name);
        let partial = root.join(format!(".{name}.{}.partial", Uuid::new_v4()));

        let mut size = 0u64;
        let written = async {
            let mut file = tokio::fs::File::create(&partial).await?;
            while let Some(chunk) = field.chunk().await? {
                file.write_all(&chunk).await?;
                size += chunk.len() as u64;
            }
            file.sync_all().await?;
            Ok::<(), ApiError>(())
        }
        .await;
        if let Err(err) = written {
            if let Err(cleanup) = tokio::fs::remove_file(&partial).await {
                tracing::warn!(path = %partial.display(), error = %cleanup, "failed to remove partial upload");
            }
            return Err(err);
        }
        tokio::fs::rename(&partial, &dest).await?;
        tracing::info!(path = %dest.display(), size, "image uploaded");

        let success = match state.registry.refresh().await {
            Ok(_) => true,
            Err(err) => {
                tracing::error!(error = %err, "registry refresh after upload failed");
                false
            }
        };
        return Ok(Json(UploadResponse { size, success }));
    }

    Err(ApiError::BadRequest(format!(
        "missing multipart field {UPLOAD_FIELD:?}"
    )))
}

pub async fn delete_image(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let disk = state.registry.snapshot().get(&id).ok_or(ApiError::NotFound)?;
    disk.erase().await?;
    if let Err(err) = state.registry.refresh().await {
        tracing::error!(error = %err, "registry refresh after delete failed");
    }
    Ok(StatusCode::NO_CONTENT)
}

/// Keep only the final path component of a client-supplied file name and check its extension.
fn upload_file_name(client_name: Option<&str>) -> Result<String, ApiError> {
    let client_name = client_name
        .ok_or_else(|| ApiError::BadRequest("upload has no file name".to_string()))?;
    let name = client_name
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(client_name)
        .trim();
    if name.is_empty() || name == "." || name == ".." {
        return Err(ApiError::BadRequest(format!(
            "invalid file name {client_name:?}"
        )));
    }
    if !is_image_file(FsPath::new(name)) {
        return Err(ApiError::Forbidden(format!(
            "{name:?} is not an image; expected one of {}",
            IMAGE_EXTENSIONS.join(", ")
        )));
    }
    Ok(name.to_string())
}
