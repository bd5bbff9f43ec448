//! API Routes
//!
//! - `/api/health` - Health check with store status and active job count
//! - `/api/clients/{client_id}/documents` - Upload and list documents
//! - `/api/clients/{client_id}/urls` - Register URL sources
//! - `/api/documents/{id}` - Status (long-poll with `?wait_secs=`), delete,
//!   chunks and retry

pub mod documents;
pub mod health;

use axum::{extract::DefaultBodyLimit, Router};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::middleware::cors_layer;
use crate::models::AppState;

/// Headroom above the upload cap for multipart framing, so oversized files
/// reach intake validation and get an explicit size error.
const BODY_LIMIT_HEADROOM: usize = 1024 * 1024;

/// Create the main application router
pub fn create_router(state: AppState) -> Router {
    info!("Creating application router");

    let body_limit = usize::try_from(state.config.pipeline.max_upload_bytes)
        .unwrap_or(usize::MAX)
        .saturating_add(BODY_LIMIT_HEADROOM);
    let cors = cors_layer(&state.config.server.cors_allowed_origins);

    Router::new()
        .merge(documents::router(state.clone()))
        .merge(health::router(state))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}
