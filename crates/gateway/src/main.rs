//! Callscope API Gateway
//!
//! The entry point for everything arriving over HTTP.
//! Handles:
//! - PBX CDR webhooks (per-tenant Basic auth)
//! - Call detail queries
//! - Health, readiness and Prometheus metrics
//! - The embedded pipeline (workers, poller, resume sweep)

mod handlers;
mod middleware;
mod provision;

use axum::{
    middleware as axum_middleware,
    routing::{get, post},
    Router,
};
use callscope_common::{
    config::AppConfig,
    db::DbPool,
    metrics,
    queue::create_queue,
    telemetry, BlobStore, Repository,
};
use callscope_pipeline::{Ingestor, PipelineRuntime, Services};
use metrics_exporter_prometheus::PrometheusHandle;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::watch;
use tower_http::{
    cors::{Any, CorsLayer},
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    trace::TraceLayer,
};
use tracing::{info, warn};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub repo: Repository,
    pub storage: BlobStore,
    pub ingestor: Ingestor,
    pub metrics: Option<PrometheusHandle>,
}

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
    info!("Starting Callscope API Gateway v{}", callscope_common::VERSION);

    let config = Arc::new(config);

    // Initialize database connection
    info!("Connecting to database...");
    let db = DbPool::new(&config.database).await?;
    db.migrate().await?;
    let repo = Repository::new(db);

    // Provisioning commands run and exit
    let args: Vec<String> = std::env::args().collect();
    if args.len() > 1 {
        provision::run(&repo, &args[1..]).await?;
        return Ok(());
    }

    // Initialize metrics
    let metrics_handle = telemetry::install_recorder(&config.observability)?;
    metrics::register_metrics();

    // Initialize queue, storage and the pipeline
    let queue = create_queue(&config.queue).await?;
    let storage = BlobStore::new(&config.storage)?;
    let runtime = PipelineRuntime::from_config(&config, repo.clone(), storage.clone(), queue.clone())?;

    // With an external queue the worker binary consumes jobs
    let services = if queue.backend() == "memory" {
        Services::all()
    } else {
        Services {
            workers: false,
            ..Services::all()
        }
    };
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let background = runtime.spawn(services, shutdown_rx);

    // Create app state
    let state = AppState {
        config: config.clone(),
        repo,
        storage,
        ingestor: runtime.ingestor().clone(),
        metrics: metrics_handle,
    };

    // Build the router
    let app = create_router(state)?;

    // Start the server
    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Let in-flight pipeline jobs finish
    let _ = shutdown_tx.send(true);
    let drain = join_background(background);
    if tokio::time::timeout(config.shutdown_timeout(), drain).await.is_err() {
        warn!("Pipeline services did not stop before the shutdown timeout");
    }

    info!("Server shutdown complete");
    Ok(())
}

async fn join_background(handles: Vec<tokio::task::JoinHandle<()>>) {
    for handle in handles {
        let _ = handle.await;
    }
}

/// Create the main application router
fn create_router(state: AppState) -> anyhow::Result<Router> {
    // CORS configuration
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    // Request ID propagation
    let request_id = SetRequestIdLayer::x_request_id(MakeRequestUuid);
    let propagate_id = PropagateRequestIdLayer::x_request_id();

    // PBX webhooks and tenant queries
    let mut tenant_routes = Router::new()
        .route("/webhook/cdr/{subdomain}", post(handlers::webhook::receive_cdr))
        .route(
            "/v1/tenants/{subdomain}/calls/{uniqueid}",
            get(handlers::calls::get_call),
        );

    if state.config.rate_limit.enabled {
        let limiter = middleware::rate_limit::create_rate_limiter(
            state.config.rate_limit.requests_per_second,
            state.config.rate_limit.burst,
        )?;
        tenant_routes = tenant_routes.layer(axum_middleware::from_fn(
            move |request: axum::extract::Request, next: axum_middleware::Next| {
                middleware::rate_limit::rate_limit_middleware(request, next, limiter.clone())
            },
        ));
    }

    // Compose the app
    Ok(Router::new()
        // Health endpoints (no auth)
        .route("/health", get(handlers::health::health))
        .route("/ready", get(handlers::health::ready))
        .route("/metrics", get(handlers::health::metrics))
        .merge(tenant_routes)
        .layer(axum_middleware::from_fn(middleware::metrics::track_requests))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .layer(request_id)
        .layer(propagate_id)
        .with_state(state))
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, starting shutdown..."),
        _ = terminate => info!("Received SIGTERM, starting shutdown..."),
    }
}
