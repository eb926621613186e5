//! Periodic CDR pull from each tenant's PBX
//!
//! Each tenant keeps a watermark. A cycle fetches `[watermark, now)`, ingests
//! every authoritative leg, enqueues the calls that need work and only then
//! moves the watermark to `now`. Any error before that point leaves the
//! watermark where it was so the next cycle fetches the same window again.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use callscope_common::config::PollerConfig;
use callscope_common::db::models::Tenant;
use callscope_common::errors::{FailureKind, Result};
use callscope_common::metrics;
use callscope_common::Repository;
use callscope_pbx::{extract_calls, LegRule, PbxEndpoint, SessionManager};
use chrono::Utc;
use futures::future::join_all;
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::ingest::{IngestStatus, Ingestor};

/// What one tenant cycle did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PollReport {
    pub fetched: usize,
    pub created: usize,
    pub duplicates: usize,
    pub rejected: usize,
    pub enqueued: usize,
}

pub struct CdrPoller {
    repo: Repository,
    sessions: Arc<SessionManager>,
    ingestor: Ingestor,
    leg_rule: LegRule,
    interval: Duration,
    initial_lookback: chrono::Duration,
    /// Per-tenant guard so cycles for one tenant never overlap
    running: std::sync::Mutex<HashMap<Uuid, Arc<Mutex<()>>>>,
}

impl CdrPoller {
    pub fn new(
        repo: Repository,
        sessions: Arc<SessionManager>,
        ingestor: Ingestor,
        leg_rule: LegRule,
        config: &PollerConfig,
    ) -> Self {
        Self {
            repo,
            sessions,
            ingestor,
            leg_rule,
            interval: Duration::from_secs(config.interval_secs.max(1)),
            initial_lookback: chrono::Duration::seconds(config.initial_lookback_secs as i64),
            running: std::sync::Mutex::new(HashMap::new()),
        }
    }

    fn tenant_guard(&self, tenant_id: Uuid) -> Arc<Mutex<()>> {
        let mut running = self
            .running
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        running.entry(tenant_id).or_default().clone()
    }

    /// Poll every tenant with an enabled PBX connection concurrently.
    /// One tenant failing does not affect the others.
    pub async fn run_cycle(&self) -> Result<()> {
        let tenants = self.repo.list_pollable_tenants().await?;
        debug!(tenants = tenants.len(), "Starting poll cycle");

        let results = join_all(tenants.iter().map(|tenant| self.poll_tenant(tenant))).await;

        for (tenant, result) in tenants.iter().zip(results) {
            match result {
                Ok(Some(report)) if report.fetched > 0 => {
                    info!(
                        tenant = %tenant.subdomain,
                        fetched = report.fetched,
                        created = report.created,
                        duplicates = report.duplicates,
                        enqueued = report.enqueued,
                        "Poll cycle complete"
                    );
                }
                Ok(_) => {}
                Err(e) => {
                    error!(tenant = %tenant.subdomain, error = %e, "Poll cycle failed, watermark kept");
                }
            }
        }

        Ok(())
    }

    /// One cycle for one tenant. Returns `None` when a cycle for this
    /// tenant is already running.
    #[instrument(skip(self, tenant), fields(tenant = %tenant.subdomain))]
    pub async fn poll_tenant(&self, tenant: &Tenant) -> Result<Option<PollReport>> {
        let guard = self.tenant_guard(tenant.id);
        let Ok(_lock) = guard.try_lock() else {
            debug!("Previous cycle still running, skipping");
            return Ok(None);
        };

        let Some(endpoint) = PbxEndpoint::from_tenant(tenant) else {
            return Ok(None);
        };

        let result = self.sync_window(tenant, &endpoint).await;
        match &result {
            Ok(report) => metrics::record_poll_cycle(true, report.fetched),
            Err(_) => metrics::record_poll_cycle(false, 0),
        }
        result.map(Some)
    }

    async fn sync_window(&self, tenant: &Tenant, endpoint: &PbxEndpoint) -> Result<PollReport> {
        let now = Utc::now();
        let start = match self.repo.get_watermark(tenant.id).await? {
            Some(watermark) => watermark,
            None => now - self.initial_lookback,
        };

        let cdr_root = self.sessions.fetch_cdrs(endpoint, start, now).await?;
        let calls = extract_calls(&cdr_root, &self.leg_rule);

        let mut report = PollReport {
            fetched: calls.len(),
            ..PollReport::default()
        };

        for call in calls {
            let outcome = match self.ingestor.ingest(tenant, call, "poller").await {
                Ok(outcome) => outcome,
                Err(e) if e.failure_kind() == FailureKind::Permanent => {
                    // a malformed record will not improve on refetch
                    warn!(error = %e, "Skipping unusable CDR");
                    report.rejected += 1;
                    continue;
                }
                Err(e) => return Err(e),
            };

            match outcome.status {
                IngestStatus::Duplicate => report.duplicates += 1,
                IngestStatus::Created | IngestStatus::QuotaExceeded => report.created += 1,
            }

            if outcome.needs_processing {
                self.ingestor.enqueue(&outcome.cdr).await?;
                report.enqueued += 1;
            }
        }

        self.repo.set_watermark(tenant.id, now).await?;
        Ok(report)
    }

    /// Run cycles on the configured interval until `shutdown` flips
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(interval_secs = self.interval.as_secs(), "CDR poller started");
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.run_cycle().await {
                        error!(error = %e, "Failed to list tenants for polling");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("CDR poller stopped");
    }
}
