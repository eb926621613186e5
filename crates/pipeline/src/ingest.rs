//! CDR ingestion shared by the webhook and the poller
//!
//! Parses one record, charges usage for answered calls, inserts it
//! idempotently by (tenant, uniqueid) and decides whether the pipeline has
//! work to do. Enqueueing is a separate step so callers can choose how an
//! enqueue failure is handled.

use std::sync::Arc;

use callscope_common::db::models::{CdrRecord, Disposition, PipelineState, Tenant};
use callscope_common::db::{usage_period, InsertOutcome};
use callscope_common::errors::Result;
use callscope_common::metrics;
use callscope_common::{JobQueue, PipelineJob, Repository};
use callscope_pbx::CdrPayload;
use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::orchestrator::initial_state;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestStatus {
    Created,
    /// Already stored; nothing was changed
    Duplicate,
    /// Stored and flagged; no recording processing
    QuotaExceeded,
}

impl IngestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IngestStatus::Created => "created",
            IngestStatus::Duplicate => "duplicate",
            IngestStatus::QuotaExceeded => "quota_exceeded",
        }
    }
}

#[derive(Debug, Clone)]
pub struct IngestOutcome {
    pub cdr: CdrRecord,
    pub status: IngestStatus,
    /// The call should be handed to the pipeline
    pub needs_processing: bool,
}

#[derive(Clone)]
pub struct Ingestor {
    repo: Repository,
    queue: Arc<dyn JobQueue>,
}

impl Ingestor {
    pub fn new(repo: Repository, queue: Arc<dyn JobQueue>) -> Self {
        Self { repo, queue }
    }

    #[instrument(skip(self, tenant, raw), fields(tenant_id = %tenant.id))]
    pub async fn ingest(&self, tenant: &Tenant, raw: Value, source: &str) -> Result<IngestOutcome> {
        let payload = CdrPayload::from_value(&raw)?;
        let mut new_cdr = payload.into_new_cdr(tenant.id, source, raw)?;

        // Redelivery is common; skip the usage reservation when we can
        if let Some(existing) = self
            .repo
            .find_cdr_by_uniqueid(tenant.id, &new_cdr.uniqueid)
            .await?
        {
            return Ok(self.duplicate(existing, source));
        }

        let mut reserved = false;
        if new_cdr.disposition == Disposition::Answered {
            reserved = self
                .repo
                .reserve_usage(tenant.id, &usage_period(Utc::now()))
                .await?;
            if !reserved {
                info!(uniqueid = %new_cdr.uniqueid, limit = tenant.monthly_limit, "Monthly usage limit reached, storing call without processing");
                new_cdr.quota_exceeded = true;
            }
        }

        let inserted = match self.repo.insert_cdr(new_cdr).await {
            Ok(inserted) => inserted,
            Err(e) => {
                // nothing was stored, so nothing may be charged
                if reserved {
                    if let Err(release) = self.repo.release_usage(tenant.id).await {
                        warn!(error = %release, "Failed to release usage after insert failure");
                    }
                }
                return Err(e);
            }
        };

        match inserted {
            InsertOutcome::Duplicate(existing) => {
                // lost a race with a concurrent delivery of the same call
                if reserved {
                    self.repo.release_usage(tenant.id).await?;
                }
                Ok(self.duplicate(existing, source))
            }
            InsertOutcome::Inserted(mut cdr) => {
                let status = if cdr.quota_exceeded {
                    IngestStatus::QuotaExceeded
                } else {
                    IngestStatus::Created
                };

                let needs_processing = initial_state(&cdr) == PipelineState::Received;
                if !needs_processing
                    && self
                        .repo
                        .transition_state(cdr.id, PipelineState::Received, PipelineState::Done)
                        .await?
                {
                    cdr.pipeline_state = PipelineState::Done.into();
                }

                metrics::record_cdr_ingested(source, status.as_str());
                info!(
                    cdr_id = %cdr.id,
                    uniqueid = %cdr.uniqueid,
                    disposition = %cdr.disposition,
                    status = status.as_str(),
                    needs_processing,
                    "CDR ingested"
                );

                Ok(IngestOutcome {
                    cdr,
                    status,
                    needs_processing,
                })
            }
        }
    }

    /// Hand a call to the pipeline workers
    pub async fn enqueue(&self, cdr: &CdrRecord) -> Result<()> {
        self.queue.enqueue(&PipelineJob::new(cdr.id, cdr.tenant_id)).await?;
        debug!(cdr_id = %cdr.id, backend = self.queue.backend(), "Call enqueued");
        Ok(())
    }

    fn duplicate(&self, existing: CdrRecord, source: &str) -> IngestOutcome {
        metrics::record_cdr_ingested(source, IngestStatus::Duplicate.as_str());
        debug!(cdr_id = %existing.id, uniqueid = %existing.uniqueid, "Duplicate CDR ignored");

        // a call whose first enqueue was lost gets another chance
        let needs_processing =
            existing.state() == PipelineState::Received && existing.is_eligible_for_acquisition();

        IngestOutcome {
            cdr: existing,
            status: IngestStatus::Duplicate,
            needs_processing,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;
    use callscope_common::queue::MemoryQueue;
    use std::time::Duration;

    fn ingestor(repo: &Repository) -> (Ingestor, Arc<MemoryQueue>) {
        let queue = Arc::new(MemoryQueue::new(Duration::from_millis(10)));
        (Ingestor::new(repo.clone(), queue.clone()), queue)
    }

    #[tokio::test]
    async fn test_same_payload_twice_is_one_row() {
        let repo = testing::repo().await;
        let tenant = testing::tenant(&repo, "acme", &[]).await;
        let (ingestor, _) = ingestor(&repo);
        let raw = testing::payload("abc-123", "ANSWERED", "2026-02/rec.wav@");

        let first = ingestor.ingest(&tenant, raw.clone(), "webhook").await.unwrap();
        let second = ingestor.ingest(&tenant, raw, "poller").await.unwrap();

        assert_eq!(first.status, IngestStatus::Created);
        assert_eq!(second.status, IngestStatus::Duplicate);
        assert_eq!(first.cdr.id, second.cdr.id);
        assert_eq!(second.cdr.source, "webhook");
        assert_eq!(repo.count_cdrs(tenant.id).await.unwrap(), 1);

        let tenant = repo.find_tenant_by_id(tenant.id).await.unwrap().unwrap();
        assert_eq!(tenant.usage_this_month, 1);
    }

    #[tokio::test]
    async fn test_quota_flags_answered_calls_only() {
        let repo = testing::repo().await;
        let tenant = testing::tenant_with_limit(&repo, "acme", &[], 1).await;
        let (ingestor, _) = ingestor(&repo);

        let first = ingestor
            .ingest(&tenant, testing::payload("c-1", "ANSWERED", "a/1.wav@"), "webhook")
            .await
            .unwrap();
        let over = ingestor
            .ingest(&tenant, testing::payload("c-2", "ANSWERED", "a/2.wav@"), "webhook")
            .await
            .unwrap();
        let missed = ingestor
            .ingest(&tenant, testing::payload("c-3", "NO ANSWER", ""), "webhook")
            .await
            .unwrap();

        assert!(first.needs_processing);
        assert_eq!(over.status, IngestStatus::QuotaExceeded);
        assert!(over.cdr.quota_exceeded);
        assert!(!over.needs_processing);
        assert_eq!(over.cdr.state(), PipelineState::Done);
        assert_eq!(missed.status, IngestStatus::Created);

        let tenant = repo.find_tenant_by_id(tenant.id).await.unwrap().unwrap();
        assert_eq!(tenant.usage_this_month, 1);
        assert_eq!(repo.count_cdrs(tenant.id).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_calls_without_recording_finish_immediately() {
        let repo = testing::repo().await;
        let tenant = testing::tenant(&repo, "acme", &[]).await;
        let (ingestor, _) = ingestor(&repo);

        let outcome = ingestor
            .ingest(&tenant, testing::payload("c-1", "ANSWERED", "@"), "webhook")
            .await
            .unwrap();

        assert!(!outcome.needs_processing);
        assert_eq!(outcome.cdr.state(), PipelineState::Done);
        let stored = repo.find_cdr(outcome.cdr.id).await.unwrap().unwrap();
        assert_eq!(stored.state(), PipelineState::Done);
    }

    #[tokio::test]
    async fn test_redelivery_of_unprocessed_call_is_requeued() {
        let repo = testing::repo().await;
        let tenant = testing::tenant(&repo, "acme", &[]).await;
        let (ingestor, queue) = ingestor(&repo);
        let raw = testing::payload("abc-123", "ANSWERED", "2026-02/rec.wav@");

        let first = ingestor.ingest(&tenant, raw.clone(), "webhook").await.unwrap();
        ingestor.enqueue(&first.cdr).await.unwrap();
        let again = ingestor.ingest(&tenant, raw, "webhook").await.unwrap();

        assert!(again.needs_processing);
        assert_eq!(queue.len().await, 1);
    }

    #[tokio::test]
    async fn test_failed_insert_releases_reserved_usage() {
        use callscope_common::db::test_pool;
        use sea_orm::ConnectionTrait;

        let pool = test_pool().await.unwrap();
        let repo = Repository::new(pool.clone());
        let tenant = testing::tenant(&repo, "acme", &[]).await;
        let (ingestor, queue) = ingestor(&repo);
        pool.write()
            .execute_unprepared(
                "CREATE TRIGGER reject_cdrs BEFORE INSERT ON cdr_records \
                 BEGIN SELECT RAISE(ABORT, 'disk full'); END;",
            )
            .await
            .unwrap();

        let raw = testing::payload("abc-123", "ANSWERED", "2026-02/rec.wav@");
        assert!(ingestor.ingest(&tenant, raw, "webhook").await.is_err());

        let tenant = repo.find_tenant_by_id(tenant.id).await.unwrap().unwrap();
        assert_eq!(tenant.usage_this_month, 0);
        assert_eq!(repo.count_cdrs(tenant.id).await.unwrap(), 0);
        assert!(queue.is_empty().await);
    }

    #[tokio::test]
    async fn test_missing_uniqueid_is_rejected() {
        let repo = testing::repo().await;
        let tenant = testing::tenant(&repo, "acme", &[]).await;
        let (ingestor, _) = ingestor(&repo);

        let err = ingestor
            .ingest(&tenant, serde_json::json!({ "disposition": "ANSWERED" }), "webhook")
            .await
            .unwrap_err();
        assert!(!err.is_retryable());
        assert_eq!(repo.count_cdrs(tenant.id).await.unwrap(), 0);
    }
}
