// Main entry point for the Ragline ingestion server

use std::sync::Arc;

use anyhow::{Context, Result};
use ragline_core::kernel::workflow::{
    NoopChunkingStage, NoopEmbeddingStage, PostgresIdempotencyLedger, PostgresProgressStore,
    ProgressBroadcaster, ProgressManager, WorkflowOrchestrator,
};
use ragline_core::kernel::{ConnectionRegistry, NatsProgressPublisher, ProgressPublisher};
use ragline_core::server::{build_app, AxumAppState};
use ragline_core::Config;
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,ragline_core=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Ragline ingestion server");

    // Load configuration
    let config = Config::from_env().context("Failed to load configuration")?;
    tracing::info!("Configuration loaded");

    // Connect to database
    tracing::info!("Connecting to database...");
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await
        .context("Failed to connect to database")?;
    tracing::info!("Database connected");

    // Run migrations
    tracing::info!("Running database migrations...");
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .context("Failed to run migrations")?;
    tracing::info!("Migrations complete");

    // Optional low-latency notification bus
    let publisher: Option<Arc<dyn ProgressPublisher>> = match &config.nats_url {
        Some(url) => match async_nats::connect(url).await {
            Ok(client) => {
                tracing::info!(url = %url, "NATS connected");
                Some(Arc::new(NatsProgressPublisher::new(client)))
            }
            Err(error) => {
                tracing::warn!(url = %url, error = %error, "NATS unavailable, continuing without it");
                None
            }
        },
        None => None,
    };

    // Wire the workflow core
    let registry = Arc::new(ConnectionRegistry::new());
    let progress = ProgressManager::new(Arc::new(PostgresProgressStore::new(pool.clone())));
    let broadcaster =
        ProgressBroadcaster::new(progress.clone(), publisher, Some(registry.clone()));
    let ledger = Arc::new(PostgresIdempotencyLedger::new(pool.clone()));

    // Chunking/embedding collaborators are wired here; the placeholders
    // keep the pipeline runnable until real ones are configured.
    let orchestrator = Arc::new(WorkflowOrchestrator::new(
        broadcaster,
        ledger,
        Arc::new(NoopChunkingStage),
        Arc::new(NoopEmbeddingStage),
    ));

    let app = build_app(AxumAppState {
        orchestrator,
        progress,
        registry,
    });

    // Start server
    let addr = format!("0.0.0.0:{}", config.port);
    tracing::info!("Starting server on {}", addr);
    tracing::info!("Health check: http://localhost:{}/health", config.port);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, app).await.context("Server error")?;

    Ok(())
}
