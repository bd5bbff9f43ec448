// Knowledge Ingest - document and web-source ingestion for per-client assistants

pub mod chunker;
pub mod config;
pub mod db;
pub mod fetcher;
pub mod intake;
pub mod middleware;
pub mod models;
pub mod normalizer;
pub mod parsing;
pub mod pipeline;
pub mod registrar;
pub mod routes;
pub mod storage;
pub mod types;
pub mod utils;

// Re-exports for convenience
pub use config::Config;
pub use models::AppState;
pub use pipeline::Pipeline;

pub fn create_router(state: AppState) -> axum::Router {
    routes::create_router(state)
}
