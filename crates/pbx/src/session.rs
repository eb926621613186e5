//! Per-tenant PBX session cache
//!
//! One cookie per tenant, guarded by its own async mutex so concurrent
//! workers for the same tenant wait on a single in-flight login instead of
//! racing their own.

use crate::client::{challenge_token, PbxApi, PbxEndpoint};
use bytes::Bytes;
use callscope_common::errors::{AppError, FailureKind, Result};
use callscope_common::metrics;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
struct Session {
    cookie: String,
    issued_at: Instant,
}

type Slot = Arc<Mutex<Option<Session>>>;

/// Cached PBX sessions, keyed by tenant
pub struct SessionManager {
    api: Arc<dyn PbxApi>,
    ttl: Duration,
    slots: std::sync::Mutex<HashMap<Uuid, Slot>>,
}

impl SessionManager {
    pub fn new(api: Arc<dyn PbxApi>, ttl: Duration) -> Self {
        Self {
            api,
            ttl,
            slots: std::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Underlying API client
    pub fn api(&self) -> &Arc<dyn PbxApi> {
        &self.api
    }

    fn slot(&self, tenant_id: Uuid) -> Slot {
        let mut slots = match self.slots.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        slots.entry(tenant_id).or_default().clone()
    }

    /// Return a valid cookie, logging in if none is cached or it aged out
    pub async fn authenticate(&self, endpoint: &PbxEndpoint) -> Result<String> {
        let slot = self.slot(endpoint.tenant_id);
        let mut session = slot.lock().await;

        if let Some(current) = session.as_ref() {
            if current.issued_at.elapsed() < self.ttl {
                return Ok(current.cookie.clone());
            }
            debug!(tenant_id = %endpoint.tenant_id, "PBX session aged out");
        }

        let cookie = self.login(endpoint).await;
        metrics::record_pbx_login(cookie.is_ok());
        let cookie = cookie?;

        *session = Some(Session {
            cookie: cookie.clone(),
            issued_at: Instant::now(),
        });

        info!(tenant_id = %endpoint.tenant_id, host = %endpoint.host, "PBX session established");
        Ok(cookie)
    }

    async fn login(&self, endpoint: &PbxEndpoint) -> Result<String> {
        let challenge = self.api.challenge(endpoint).await?;
        let token = challenge_token(&challenge, &endpoint.password);
        self.api.login(endpoint, &token).await
    }

    /// Drop the cached cookie if it is still the one that failed
    pub async fn invalidate(&self, endpoint: &PbxEndpoint, cookie: &str) {
        let slot = self.slot(endpoint.tenant_id);
        let mut session = slot.lock().await;

        if session.as_ref().is_some_and(|s| s.cookie == cookie) {
            *session = None;
        }
    }

    /// Run `op` with a session cookie.
    ///
    /// An authentication failure from `op` invalidates the cookie and the call
    /// is retried once with a fresh login. A second authentication failure is
    /// returned as `PbxAuth`.
    pub async fn with_session<T, F, Fut>(&self, endpoint: &PbxEndpoint, op: F) -> Result<T>
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let cookie = self.authenticate(endpoint).await?;

        match op(cookie.clone()).await {
            Err(e) if e.failure_kind() == FailureKind::Authentication => {
                warn!(
                    tenant_id = %endpoint.tenant_id,
                    error = %e,
                    "PBX rejected session, re-authenticating"
                );
                self.invalidate(endpoint, &cookie).await;

                let fresh = self.authenticate(endpoint).await?;
                op(fresh).await.map_err(|e| match e.failure_kind() {
                    FailureKind::Authentication => AppError::PbxAuth {
                        message: format!("session rejected after re-authentication: {}", e),
                    },
                    _ => e,
                })
            }
            other => other,
        }
    }

    /// Fetch CDRs for `[start, end)` with session handling
    pub async fn fetch_cdrs(
        &self,
        endpoint: &PbxEndpoint,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Value> {
        let api = self.api.clone();
        self.with_session(endpoint, |cookie| {
            let api = api.clone();
            async move { api.fetch_cdrs(endpoint, &cookie, start, end).await }
        })
        .await
    }

    /// Download a recording with session handling
    pub async fn download_recording(
        &self,
        endpoint: &PbxEndpoint,
        dir: &str,
        filename: &str,
    ) -> Result<Bytes> {
        let api = self.api.clone();
        self.with_session(endpoint, |cookie| {
            let api = api.clone();
            async move { api.download_recording(endpoint, &cookie, dir, filename).await }
        })
        .await
    }
}
