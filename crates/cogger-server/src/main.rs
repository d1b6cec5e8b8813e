//! Cogger Server - Main entry point

use anyhow::Result;
use cogger_common::logging::{init_logging, LogConfig};
use sqlx::postgres::PgPoolOptions;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::info;

use cogger_server::{
    api::{router, AppState},
    config::Config,
    convert::Converter,
    fetch::{FetchConfig, SceneFetcher},
    ledger::{postgres::PgJobLedger, JobLedger},
    pipeline::{ArtifactStore, Orchestrator, PipelineConfig},
    storage::{config::StorageConfig, fs::FsStorage, ObjectStore, Storage},
    tiles::{TileService, TileServiceConfig},
};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging with configuration from environment
    let log_config = LogConfig::builder()
        .log_file_prefix("cogger-server".to_string())
        .filter_directives(
            "cogger_server=debug,tower_http=debug,axum=trace,sqlx=info".to_string(),
        )
        .build();

    // Merge with environment variables (they take precedence)
    let log_config = LogConfig::from_env().unwrap_or(log_config);

    init_logging(&log_config)?;

    info!("Starting Cogger Server");

    // Load configuration
    let config = Config::load()?;
    info!(
        "Configuration loaded - server will bind to {}:{}",
        config.server.host, config.server.port
    );

    // Initialize database connection pool
    let db_pool = PgPoolOptions::new()
        .max_connections(config.database.max_connections)
        .min_connections(config.database.min_connections)
        .acquire_timeout(Duration::from_secs(config.database.connect_timeout_secs))
        .connect(&config.database.url)
        .await?;

    info!("Database connection pool established");

    // Run migrations
    sqlx::migrate!("../../migrations")
        .run(&db_pool)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to run migrations: {}", e))?;

    info!("Database migrations completed");

    // Job ledger over Postgres, with the stale-claim takeover window
    let ledger: Arc<dyn JobLedger> = Arc::new(PgJobLedger::new(
        db_pool,
        Duration::from_secs(config.pipeline.stale_claim_secs),
    ));

    // Object storage backend
    let (artifacts, objects): (Arc<dyn ArtifactStore>, Arc<dyn ObjectStore>) =
        match config.storage.backend.as_str() {
            "fs" => {
                info!("Using filesystem storage at {}", config.storage.fs_root);
                let store = Arc::new(FsStorage::new(
                    config.storage.fs_root.clone(),
                    &config.storage.bucket,
                ));
                (store.clone(), store)
            },
            _ => {
                let store = Arc::new(Storage::new(StorageConfig::from_env()?).await?);
                (store.clone(), store)
            },
        };

    // Provider fetcher
    let fetcher = SceneFetcher::new(FetchConfig {
        token_url: config.provider.token_url.clone(),
        catalog_url: config.provider.catalog_url.clone(),
        username: config.provider.username.clone(),
        password: config.provider.password.clone(),
        max_retries: config.pipeline.fetch_max_retries,
        backoff_base: Duration::from_millis(config.pipeline.fetch_backoff_ms),
        request_timeout: Duration::from_secs(config.pipeline.fetch_request_timeout_secs),
    })?;

    // Conversion pipeline
    let orchestrator = Arc::new(Orchestrator::new(
        Arc::clone(&ledger),
        Arc::new(fetcher),
        Arc::new(Converter),
        artifacts,
        PipelineConfig {
            job_timeout: Duration::from_secs(config.pipeline.job_timeout_secs),
            worker_slots: config.pipeline.worker_slots,
            heartbeat_interval: Duration::from_secs(config.pipeline.heartbeat_secs),
        },
    ));

    // Tile service
    let tiles = Arc::new(TileService::new(
        Arc::clone(&objects),
        TileServiceConfig {
            header_cache_capacity: config.tiler.header_cache_capacity,
            header_cache_ttl: Duration::from_secs(config.tiler.header_cache_ttl_secs),
        },
    ));

    let config = Arc::new(config);
    let state = AppState {
        ledger,
        objects,
        orchestrator,
        tiles,
        config: Arc::clone(&config),
    };

    // Build the application router
    let app = router(state);

    // Create socket address
    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    info!("Server listening on {}", addr);

    // Create TCP listener
    let listener = tokio::net::TcpListener::bind(addr).await?;

    // Start server with graceful shutdown
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(config.server.shutdown_timeout_secs))
        .await?;

    info!("Server shut down gracefully");

    Ok(())
}

async fn shutdown_signal(timeout_secs: u64) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            },
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, starting graceful shutdown");
        },
        _ = terminate => {
            info!("Received terminate signal, starting graceful shutdown");
        },
    }

    // Give ongoing requests time to complete
    info!("Waiting up to {} seconds for connections to close", timeout_secs);
    tokio::time::sleep(Duration::from_secs(timeout_secs.min(5))).await;
}
