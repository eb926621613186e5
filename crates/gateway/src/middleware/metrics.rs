//! Per-request Prometheus instrumentation

use axum::{
    extract::{MatchedPath, Request},
    middleware::Next,
    response::Response,
};
use callscope_common::metrics::RequestMetrics;

/// Record count and latency labelled by route template, not raw path
pub async fn track_requests(request: Request, next: Next) -> Response {
    let endpoint = request
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_owned())
        .unwrap_or_else(|| "unmatched".to_string());
    let timer = RequestMetrics::start(request.method().as_str(), &endpoint);

    let response = next.run(request).await;
    timer.finish(response.status().as_u16());
    response
}
