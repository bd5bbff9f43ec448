use axum::{extract::State, http::StatusCode, routing::get, Json, Router};

use crate::models::{AppState, HealthResponse};

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health_check))
        .with_state(state)
}

async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let (backend, reachable) = state.pipeline.store_health().await;

    let (status, code, database) = if reachable {
        ("ok", StatusCode::OK, format!("{} connected", backend))
    } else {
        ("degraded", StatusCode::SERVICE_UNAVAILABLE, format!("{} unreachable", backend))
    };

    let response = HealthResponse {
        status: status.to_string(),
        timestamp: chrono::Utc::now().to_rfc3339(),
        database,
        active_jobs: state.pipeline.active_jobs().await,
    };

    (code, Json(response))
}
