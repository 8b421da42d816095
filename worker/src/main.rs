use anyhow::{Context, Result};
use creatorlink::accounts::AccountStore;
use creatorlink::config::{load_config, AppConfig};
use creatorlink::connectors::run_state_cleanup;
use creatorlink::queue::NatsJobQueue;
use creatorlink::store::SqliteJobStore;
use creatorlink::{ConnectorRegistry, Worker};
use creatorlink_worker::{registry, ProcessorClient};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing subscriber
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "creatorlink=info,creatorlink_worker=info".into()),
        )
        .init();

    info!("creatorlink worker starting...");

    // Config file from the first argument or CREATORLINK_CONFIG, env overlays on top
    let config_path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("CREATORLINK_CONFIG").ok());
    let mut config = match &config_path {
        Some(path) => load_config(path)?,
        None => AppConfig::default(),
    };
    config.apply_env();

    info!(
        config = config_path.as_deref().unwrap_or("<defaults>"),
        nats_url = %config.queue.url,
        jobs_db = %config.store.database_path,
        accounts_db = %config.accounts.database_path,
        processor_url = %config.processor.base_url,
        "Configuration loaded"
    );

    let store = Arc::new(
        SqliteJobStore::open(&config.store.database_path)
            .context("Failed to initialize job store")?,
    );

    let encryption_key = config
        .accounts
        .encryption_key
        .as_deref()
        .context("CREATORLINK_ENCRYPTION_KEY is required (base64-encoded 32-byte key)")?;
    let accounts = Arc::new(
        AccountStore::open(&config.accounts.database_path, encryption_key)
            .context("Failed to initialize account store")?,
    );

    let connectors = Arc::new(
        ConnectorRegistry::from_config(&config.connectors)
            .context("Failed to initialize connector registry")?,
    );
    info!(capabilities = ?connectors.capabilities(), "Connector registry ready");

    let state_cleanup = tokio::spawn(run_state_cleanup(
        connectors.states().clone(),
        config.connectors.state_cleanup_interval(),
    ));

    let processor = Arc::new(ProcessorClient::new(&config.processor)?);

    // Unreachable broker is fatal: exit non-zero instead of spinning
    let queue = Arc::new(
        NatsJobQueue::connect(config.queue.clone())
            .await
            .context("Failed to connect to job queue")?,
    );

    let worker = Worker::new(
        store,
        queue.clone(),
        registry(processor, accounts, connectors),
    )
    .with_jobs_config(&config.jobs)
    .with_pull_wait(config.queue.pull_wait());

    // Wait for shutdown signal
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for ctrl_c signal");
        }
        info!("Shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    worker.run(shutdown_rx).await?;
    state_cleanup.abort();

    queue.close().await?;
    info!("creatorlink worker stopped");

    Ok(())
}
