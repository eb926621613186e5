//! Metrics and observability utilities
//!
//! Provides Prometheus metrics with stage-aligned histograms
//! and standardized naming conventions.

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram, Unit};
use std::time::Instant;

/// Metrics prefix for all Callscope metrics
pub const METRICS_PREFIX: &str = "callscope";

/// Histogram buckets for HTTP request latency (in seconds)
pub const LATENCY_BUCKETS: &[f64] = &[
    0.001, // 1ms
    0.005, // 5ms
    0.010, // 10ms
    0.025, // 25ms
    0.050, // 50ms
    0.100, // 100ms
    0.250, // 250ms
    0.500, // 500ms
    1.000, // 1s
    2.500, // 2.5s
    5.000, // 5s
];

/// Buckets for pipeline stages (downloads, transcoding, STT and LLM calls)
pub const STAGE_BUCKETS: &[f64] = &[
    0.100, // 100ms
    0.500, // 500ms
    1.000, // 1s
    2.500, // 2.5s
    5.000, // 5s
    10.00, // 10s
    30.00, // 30s
    60.00, // 1m
    120.0, // 2m
    300.0, // 5m
];

/// Register all metric descriptions
pub fn register_metrics() {
    // Request metrics
    describe_counter!(
        format!("{}_requests_total", METRICS_PREFIX),
        Unit::Count,
        "Total number of HTTP requests"
    );

    describe_histogram!(
        format!("{}_request_duration_seconds", METRICS_PREFIX),
        Unit::Seconds,
        "HTTP request latency in seconds"
    );

    // Ingestion metrics
    describe_counter!(
        format!("{}_cdrs_ingested_total", METRICS_PREFIX),
        Unit::Count,
        "CDRs received, by source and outcome"
    );

    describe_counter!(
        format!("{}_poll_cycles_total", METRICS_PREFIX),
        Unit::Count,
        "PBX poll cycles, by outcome"
    );

    // PBX metrics
    describe_counter!(
        format!("{}_pbx_logins_total", METRICS_PREFIX),
        Unit::Count,
        "PBX challenge/login handshakes"
    );

    // Pipeline metrics
    describe_counter!(
        format!("{}_stage_runs_total", METRICS_PREFIX),
        Unit::Count,
        "Pipeline stage executions, by stage and outcome"
    );

    describe_histogram!(
        format!("{}_stage_duration_seconds", METRICS_PREFIX),
        Unit::Seconds,
        "Pipeline stage latency in seconds"
    );

    describe_counter!(
        format!("{}_recordings_acquired_total", METRICS_PREFIX),
        Unit::Count,
        "Recordings acquired, by acquisition path"
    );

    describe_counter!(
        format!("{}_llm_cost_usd_total", METRICS_PREFIX),
        Unit::Count,
        "Estimated LLM spend in micro-dollars"
    );

    // Queue metrics
    describe_gauge!(
        format!("{}_queue_depth", METRICS_PREFIX),
        Unit::Count,
        "Number of jobs waiting in the in-process queue"
    );

    describe_counter!(
        format!("{}_queue_messages_processed_total", METRICS_PREFIX),
        Unit::Count,
        "Total queue messages processed"
    );

    describe_counter!(
        format!("{}_sweep_requeued_total", METRICS_PREFIX),
        Unit::Count,
        "Calls re-enqueued by the resume sweep"
    );

    tracing::info!("Metrics registered");
}

/// Helper to record request metrics
pub struct RequestMetrics {
    start: Instant,
    endpoint: String,
    method: String,
}

impl RequestMetrics {
    /// Start tracking a request
    pub fn start(method: &str, endpoint: &str) -> Self {
        Self {
            start: Instant::now(),
            endpoint: endpoint.to_string(),
            method: method.to_string(),
        }
    }

    /// Record request completion
    pub fn finish(self, status: u16) {
        let duration = self.start.elapsed().as_secs_f64();

        counter!(
            format!("{}_requests_total", METRICS_PREFIX),
            "method" => self.method.clone(),
            "endpoint" => self.endpoint.clone(),
            "status" => status.to_string()
        )
        .increment(1);

        histogram!(
            format!("{}_request_duration_seconds", METRICS_PREFIX),
            "method" => self.method,
            "endpoint" => self.endpoint
        )
        .record(duration);
    }
}

/// Helper to record a CDR arriving from a webhook or a poll
pub fn record_cdr_ingested(source: &str, outcome: &str) {
    counter!(
        format!("{}_cdrs_ingested_total", METRICS_PREFIX),
        "source" => source.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Helper to record a poll cycle
pub fn record_poll_cycle(success: bool, fetched: usize) {
    let status = if success { "success" } else { "error" };

    counter!(
        format!("{}_poll_cycles_total", METRICS_PREFIX),
        "status" => status.to_string()
    )
    .increment(1);

    gauge!(format!("{}_poll_last_batch_size", METRICS_PREFIX)).set(fetched as f64);
}

/// Helper to record a PBX login
pub fn record_pbx_login(success: bool) {
    let status = if success { "success" } else { "error" };

    counter!(
        format!("{}_pbx_logins_total", METRICS_PREFIX),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Helper to record one stage execution
pub fn record_stage(stage: &str, outcome: &str, duration_secs: f64) {
    counter!(
        format!("{}_stage_runs_total", METRICS_PREFIX),
        "stage" => stage.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);

    histogram!(
        format!("{}_stage_duration_seconds", METRICS_PREFIX),
        "stage" => stage.to_string()
    )
    .record(duration_secs);
}

/// Helper to record which path produced a recording
pub fn record_acquisition_path(path: &str) {
    counter!(
        format!("{}_recordings_acquired_total", METRICS_PREFIX),
        "path" => path.to_string()
    )
    .increment(1);
}

/// Helper to record LLM spend for a feature
pub fn record_llm_cost(feature: &str, cost_usd: f64) {
    counter!(
        format!("{}_llm_cost_usd_total", METRICS_PREFIX),
        "feature" => feature.to_string()
    )
    .increment((cost_usd * 1_000_000.0).round() as u64);
}

/// Helper to record queue activity
pub fn record_queue_processed(backend: &str, success: bool) {
    let status = if success { "success" } else { "error" };

    counter!(
        format!("{}_queue_messages_processed_total", METRICS_PREFIX),
        "backend" => backend.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

pub fn record_queue_depth(depth: usize) {
    gauge!(format!("{}_queue_depth", METRICS_PREFIX)).set(depth as f64);
}

pub fn record_sweep_requeued(count: usize) {
    counter!(format!("{}_sweep_requeued_total", METRICS_PREFIX)).increment(count as u64);
}
