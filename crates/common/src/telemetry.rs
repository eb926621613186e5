//! Logging and metrics exporter setup shared by the binaries

use std::net::{Ipv4Addr, SocketAddr};

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing_subscriber::EnvFilter;

use crate::config::ObservabilityConfig;
use crate::errors::{AppError, Result};
use crate::metrics::LATENCY_BUCKETS;

/// Install the global tracing subscriber
///
/// `RUST_LOG` wins over `observability.log_level` when set.
pub fn init_tracing(config: &ObservabilityConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);

    if config.json_logging {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn builder() -> Result<PrometheusBuilder> {
    PrometheusBuilder::new()
        .set_buckets(LATENCY_BUCKETS)
        .map_err(|e| AppError::Configuration {
            message: format!("prometheus buckets: {}", e),
        })
}

/// Install the global recorder and return a handle for a `/metrics` route
///
/// `None` when metrics are disabled (`metrics_port = 0`) or a recorder is
/// already installed.
pub fn install_recorder(config: &ObservabilityConfig) -> Result<Option<PrometheusHandle>> {
    if config.metrics_port == 0 {
        return Ok(None);
    }

    let recorder = builder()?.build_recorder();
    let handle = recorder.handle();
    match ::metrics::set_global_recorder(recorder) {
        Ok(()) => Ok(Some(handle)),
        Err(e) => {
            tracing::warn!(error = %e, "Metrics recorder already installed");
            Ok(None)
        }
    }
}

/// Install the global recorder with its own scrape listener on `metrics_port`
///
/// Used by processes without an HTTP surface. Must run inside a tokio runtime.
pub fn install_exporter(config: &ObservabilityConfig) -> Result<()> {
    if config.metrics_port == 0 {
        return Ok(());
    }

    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, config.metrics_port));
    builder()?
        .with_http_listener(addr)
        .install()
        .map_err(|e| AppError::Configuration {
            message: format!("prometheus exporter: {}", e),
        })?;

    tracing::info!(%addr, "Prometheus exporter listening");
    Ok(())
}
