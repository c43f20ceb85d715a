mod images;

use axum::{extract::DefaultBodyLimit, Router};

use crate::AppState;

pub use images::{ApiError, UploadResponse};

pub fn router(state: AppState) -> Router {
    Router::new()
        .merge(images::router())
        // Images are routinely larger than any sensible in-memory limit; uploads are streamed.
        .layer(DefaultBodyLimit::disable())
        .with_state(state)
}
