use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tracing::{info, warn};

use knowledge_ingest::{
    config::Config,
    db::{self, DocumentStore, MemoryDocumentStore, PgDocumentStore},
    fetcher::HttpFetcher,
    parsing::HttpParsingClient,
    pipeline::{sweeper, Pipeline},
    routes::create_router,
    storage,
    utils::init_logger,
    AppState,
};

#[derive(Parser, Debug)]
#[command(
    name = "knowledge-ingest",
    about = "Document and web-source ingestion pipeline",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, Copy)]
enum Command {
    /// Run the HTTP API with the background orphan sweeper (default)
    Serve,
    /// Resume or expire orphaned documents once, then exit
    Sweep,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config = Config::from_env()?;
    let _log_guard = init_logger(&config.log);
    info!("Configuration loaded: {:?}", config.server);

    let pipeline = build_pipeline(&config).await?;

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(config, pipeline).await,
        Command::Sweep => sweep_once(pipeline).await,
    }
}

async fn build_pipeline(config: &Config) -> anyhow::Result<Pipeline> {
    let store: Arc<dyn DocumentStore> = match &config.database.url {
        Some(url) => {
            let pool = db::create_pool(url, &config.database).await?;

            info!("Running database migrations...");
            db::run_migrations(&pool)
                .await
                .map_err(|e| anyhow::anyhow!("Failed to run migrations: {}", e))?;
            info!("Database migrations completed");

            Arc::new(PgDocumentStore::new(pool))
        }
        None => {
            warn!("DATABASE_URL not set, documents are kept in memory only");
            Arc::new(MemoryDocumentStore::new())
        }
    };

    let storage = storage::from_config(&config.storage)?;
    let parser = Arc::new(HttpParsingClient::new(&config.parser)?);
    let fetcher = Arc::new(HttpFetcher::new(config.pipeline.fetch_timeout())?);

    Ok(Pipeline::new(
        config.pipeline.clone(),
        store,
        storage,
        parser,
        fetcher,
    ))
}

async fn serve(config: Config, pipeline: Pipeline) -> anyhow::Result<()> {
    let sweeper = sweeper::spawn_periodic(pipeline.clone(), config.pipeline.sweep_interval());

    let state = AppState {
        config: config.clone(),
        pipeline,
    };
    let app = create_router(state);

    let ip = config
        .server
        .host
        .parse::<std::net::IpAddr>()
        .map_err(|e| anyhow::anyhow!("Invalid HOST '{}': {}", config.server.host, e))?;
    let addr = SocketAddr::new(ip, config.server.port);
    info!("Server listening on {}", addr);

    let listener = TcpListener::bind(addr).await?;
    let result = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| anyhow::anyhow!("Server error: {}", e));

    sweeper.abort();
    result
}

async fn sweep_once(pipeline: Pipeline) -> anyhow::Result<()> {
    let report = pipeline.sweep_orphans().await?;
    info!(
        resumed = report.resumed,
        expired = report.expired,
        skipped = report.skipped,
        "Orphan sweep finished"
    );

    // resumed jobs poll in the background; wait for them to settle
    while pipeline.active_jobs().await > 0 {
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
