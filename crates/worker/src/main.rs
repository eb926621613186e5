//! Callscope Pipeline Worker
//!
//! Consumes call jobs from the external queue (SQS):
//! 1. Receives a batch of jobs
//! 2. Runs each call through acquisition, transcription and analysis
//! 3. Deletes the message on success, or leaves it for redelivery
//!
//! The gateway runs the same workers in-process when the queue backend is
//! `memory`, so this binary has nothing to consume in that mode.

use callscope_common::{
    config::AppConfig,
    db::DbPool,
    metrics,
    queue::create_queue,
    telemetry, BlobStore, Repository, VERSION,
};
use callscope_pipeline::{PipelineRuntime, Services};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Load configuration
    let config = AppConfig::load().map_err(|e| {
        eprintln!("Failed to load configuration: {}", e);
        e
    })?;

    // Initialize tracing
    telemetry::init_tracing(&config.observability);
    info!("Starting Callscope Pipeline Worker v{}", VERSION);

    let config = Arc::new(config);

    // Initialize database connection
    info!("Connecting to database...");
    let db = DbPool::new(&config.database).await?;
    db.migrate().await?;
    let repo = Repository::new(db);

    // Initialize metrics
    telemetry::install_exporter(&config.observability)?;
    metrics::register_metrics();

    let queue = create_queue(&config.queue).await?;
    if queue.backend() == "memory" {
        warn!("Queue backend is in-process; the gateway runs the workers. Waiting for shutdown signal...");
        tokio::signal::ctrl_c().await?;
        info!("Pipeline worker shutting down");
        return Ok(());
    }

    let storage = BlobStore::new(&config.storage)?;
    let runtime = PipelineRuntime::from_config(&config, repo, storage, queue)?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handles = runtime.spawn(Services::workers_only(), shutdown_rx);
    info!(workers = config.pipeline.workers, "Pipeline worker ready, starting queue polling...");

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    // In-flight jobs finish; anything unacknowledged is redelivered
    let _ = shutdown_tx.send(true);
    let drain = async {
        for handle in handles {
            let _ = handle.await;
        }
    };
    if tokio::time::timeout(config.shutdown_timeout(), drain).await.is_err() {
        warn!("Workers did not stop before the shutdown timeout");
    }

    info!("Pipeline worker shutting down");
    Ok(())
}
