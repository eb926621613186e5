//! Rate limiting middleware using token bucket algorithm

use axum::{extract::Request, middleware::Next, response::Response};
use callscope_common::errors::AppError;
use governor::{
    clock::QuantaClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
use std::num::NonZeroU32;
use std::sync::Arc;

/// Rate limiter using governor crate
pub type GlobalRateLimiter = RateLimiter<NotKeyed, InMemoryState, QuantaClock>;

/// Shared limiter plus the configured rate for error reporting
#[derive(Clone)]
pub struct Limiter {
    inner: Arc<GlobalRateLimiter>,
    per_second: u32,
}

impl Limiter {
    pub fn check(&self) -> bool {
        self.inner.check().is_ok()
    }
}

/// Create a new rate limiter
pub fn create_rate_limiter(requests_per_second: u32, burst: u32) -> Result<Limiter, AppError> {
    let rate = NonZeroU32::new(requests_per_second).ok_or_else(|| AppError::Configuration {
        message: "rate_limit.requests_per_second must be greater than zero".to_string(),
    })?;
    let burst = NonZeroU32::new(burst).unwrap_or(rate);

    Ok(Limiter {
        inner: Arc::new(RateLimiter::direct(Quota::per_second(rate).allow_burst(burst))),
        per_second: requests_per_second,
    })
}

/// Rate limiting middleware
pub async fn rate_limit_middleware(
    request: Request,
    next: Next,
    limiter: Limiter,
) -> Result<Response, AppError> {
    if limiter.check() {
        return Ok(next.run(request).await);
    }

    tracing::warn!(path = %request.uri().path(), "Rate limit exceeded");
    Err(AppError::RateLimited {
        limit: limiter.per_second,
    })
}
