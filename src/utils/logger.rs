// Logger initialization

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LogConfig;

const DEFAULT_FILTER: &str = "knowledge_ingest=debug,tower_http=debug,axum=debug";

/// Install the global subscriber. When a log directory is configured a daily
/// rolling file layer is added; keep the returned guard alive for the life of
/// the process so buffered lines are flushed.
pub fn init_logger(config: &LogConfig) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| DEFAULT_FILTER.into());

    match &config.directory {
        Some(directory) => {
            let appender = tracing_appender::rolling::daily(directory, "knowledge-ingest.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);

            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer())
                .with(tracing_subscriber::fmt::layer().with_ansi(false).with_writer(writer))
                .init();

            Some(guard)
        }
        None => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer())
                .init();

            None
        }
    }
}
