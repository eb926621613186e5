//! Resume sweep
//!
//! Finds calls stuck in a non-terminal state (a worker died mid-stage, or
//! the job was lost between the database and the queue) and puts them back
//! on the queue. In-flight states are rolled back to the state the stage
//! was claimed from first, so the orchestrator can claim them again. A live
//! stage heartbeats `updated_at` and never looks stale.

use std::sync::Arc;
use std::time::Duration;

use callscope_common::config::PipelineConfig;
use callscope_common::errors::Result;
use callscope_common::metrics;
use callscope_common::{JobQueue, PipelineJob, Repository};
use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

pub struct ResumeSweep {
    repo: Repository,
    queue: Arc<dyn JobQueue>,
    interval: Duration,
    stale_after: chrono::Duration,
    batch_size: u64,
}

impl ResumeSweep {
    pub fn new(repo: Repository, queue: Arc<dyn JobQueue>, config: &PipelineConfig) -> Self {
        Self {
            repo,
            queue,
            interval: Duration::from_secs(config.sweep_interval_secs.max(1)),
            stale_after: chrono::Duration::seconds(config.stale_after_secs as i64),
            batch_size: config.sweep_batch_size.max(1),
        }
    }

    /// One pass over calls untouched for longer than `stale_after`.
    /// Returns how many were re-enqueued.
    pub async fn sweep_once(&self) -> Result<usize> {
        self.resume_stale(Utc::now() - self.stale_after).await
    }

    pub async fn resume_stale(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let stale = self.repo.find_stale_cdrs(cutoff, self.batch_size).await?;
        if stale.is_empty() {
            return Ok(0);
        }

        let mut resumed = 0;
        for cdr in stale {
            let state = cdr.state();
            let target = state.resumable_predecessor().unwrap_or(state);

            // a same-state CAS bumps updated_at, so the next sweep skips the
            // call unless it is stuck again
            if !self.repo.transition_state(cdr.id, state, target).await? {
                debug!(cdr_id = %cdr.id, "Call moved on since it was selected");
                continue;
            }

            if target != state {
                warn!(cdr_id = %cdr.id, from = %state, to = %target, "Rolled back abandoned stage");
            }

            self.queue
                .enqueue(&PipelineJob::new(cdr.id, cdr.tenant_id))
                .await?;
            resumed += 1;
        }

        metrics::record_sweep_requeued(resumed);
        info!(resumed, "Resume sweep re-enqueued stalled calls");
        Ok(resumed)
    }

    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.interval.as_secs(),
            stale_after_secs = self.stale_after.num_seconds(),
            "Resume sweep started"
        );
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep_once().await {
                        error!(error = %e, "Resume sweep failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Resume sweep stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::StageOutcome;
    use crate::testing;
    use callscope_common::db::models::PipelineState;
    use callscope_common::queue::MemoryQueue;

    fn sweep(repo: &Repository, queue: Arc<MemoryQueue>) -> ResumeSweep {
        ResumeSweep::new(repo.clone(), queue, &PipelineConfig::default())
    }

    fn soon() -> DateTime<Utc> {
        Utc::now() + chrono::Duration::seconds(5)
    }

    #[tokio::test]
    async fn test_in_flight_calls_roll_back_and_requeue() {
        let repo = testing::repo().await;
        let tenant = testing::tenant(&repo, "acme", &[]).await;
        let queue = Arc::new(MemoryQueue::new(Duration::from_millis(10)));

        let stuck = testing::cdr(&repo, &tenant, "c-1", "2026-02/1.wav@").await;
        repo.transition_state(stuck.id, PipelineState::Received, PipelineState::Acquiring)
            .await
            .unwrap();
        let waiting = testing::cdr(&repo, &tenant, "c-2", "2026-02/2.wav@").await;
        let finished = testing::cdr(&repo, &tenant, "c-3", "2026-02/3.wav@").await;
        repo.set_state(finished.id, PipelineState::Done, None).await.unwrap();

        let resumed = sweep(&repo, queue.clone()).resume_stale(soon()).await.unwrap();

        assert_eq!(resumed, 2);
        let stuck = repo.find_cdr(stuck.id).await.unwrap().unwrap();
        assert_eq!(stuck.state(), PipelineState::Received);
        let waiting = repo.find_cdr(waiting.id).await.unwrap().unwrap();
        assert_eq!(waiting.state(), PipelineState::Received);

        let mut jobs: Vec<_> = queue.drain().await.into_iter().map(|j| j.cdr_id).collect();
        jobs.sort();
        let mut expected = vec![stuck.id, waiting.id];
        expected.sort();
        assert_eq!(jobs, expected);
    }

    #[tokio::test]
    async fn test_recent_calls_are_left_alone() {
        let repo = testing::repo().await;
        let tenant = testing::tenant(&repo, "acme", &[]).await;
        let queue = Arc::new(MemoryQueue::new(Duration::from_millis(10)));
        testing::cdr(&repo, &tenant, "c-1", "2026-02/1.wav@").await;

        let resumed = sweep(&repo, queue.clone()).sweep_once().await.unwrap();

        assert_eq!(resumed, 0);
        assert!(queue.is_empty().await);
    }

    #[tokio::test]
    async fn test_resumed_call_completes() {
        let repo = testing::repo().await;
        let mocks = testing::mocks();
        let orchestrator = testing::orchestrator(&repo, &mocks);
        let tenant = testing::tenant(&repo, "acme", &["call-summary"]).await;
        let queue = Arc::new(MemoryQueue::new(Duration::from_millis(10)));
        mocks.pbx.add_recording("2026-02", "rec.wav", testing::vendor_recording(42));

        // a worker died after claiming acquisition
        let cdr = testing::cdr(&repo, &tenant, "abc-123", "2026-02/rec.wav@").await;
        repo.transition_state(cdr.id, PipelineState::Received, PipelineState::Acquiring)
            .await
            .unwrap();
        assert_eq!(
            orchestrator.process(&PipelineJob::new(cdr.id, tenant.id)).await.unwrap(),
            StageOutcome::Skipped
        );

        sweep(&repo, queue.clone()).resume_stale(soon()).await.unwrap();
        let job = queue.drain().await.pop().unwrap();
        let outcome = orchestrator.process(&job).await.unwrap();

        assert_eq!(outcome, StageOutcome::Completed(PipelineState::Done));
        let detail = repo.get_call_detail(tenant.id, "abc-123").await.unwrap().unwrap();
        assert!(detail.features.call_summary.is_some());
    }
}
