//! Pipeline worker pool
//!
//! A fixed number of tasks pull jobs from the queue and hand each to the
//! orchestrator. Every call is isolated: a failing call is nacked with a
//! delay and the worker moves on. Repeated infrastructure errors (database
//! or broker down) trip a per-worker circuit breaker that pauses receiving.

use std::sync::Arc;
use std::time::Duration;

use callscope_common::metrics;
use callscope_common::queue::Delivery;
use callscope_common::JobQueue;
use futures::future::join_all;
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

use crate::orchestrator::{Orchestrator, StageOutcome};

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub workers: usize,
    /// Jobs taken per receive
    pub batch_size: usize,
    /// Consecutive errors before the breaker opens
    pub max_failures: u32,
    pub breaker_pause: Duration,
    /// Redelivery delay for jobs that errored outside a stage
    pub error_delay: Duration,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            workers: 4,
            batch_size: 1,
            max_failures: 5,
            breaker_pause: Duration::from_secs(30),
            error_delay: Duration::from_secs(5),
        }
    }
}

/// Whether a delivery was handled cleanly, for the circuit breaker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handled {
    Ok,
    Error,
}

pub struct WorkerPool {
    queue: Arc<dyn JobQueue>,
    orchestrator: Arc<Orchestrator>,
    settings: WorkerSettings,
}

impl WorkerPool {
    pub fn new(queue: Arc<dyn JobQueue>, orchestrator: Arc<Orchestrator>, settings: WorkerSettings) -> Self {
        Self {
            queue,
            orchestrator,
            settings,
        }
    }

    /// Run all workers until `shutdown` flips; in-flight jobs finish first
    pub async fn run(self: Arc<Self>, shutdown: watch::Receiver<bool>) {
        let workers = self.settings.workers.max(1);
        info!(workers, backend = self.queue.backend(), "Pipeline workers started");

        let tasks = (0..workers).map(|id| {
            let pool = self.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { pool.worker_loop(id, shutdown).await })
        });

        for result in join_all(tasks).await {
            if let Err(e) = result {
                error!(error = %e, "Worker task panicked");
            }
        }

        info!("Pipeline workers stopped");
    }

    async fn worker_loop(&self, id: usize, mut shutdown: watch::Receiver<bool>) {
        let mut consecutive_failures = 0u32;

        loop {
            if *shutdown.borrow() {
                break;
            }

            if consecutive_failures >= self.settings.max_failures {
                warn!(worker = id, failures = consecutive_failures, "Circuit breaker open, pausing...");
                tokio::select! {
                    _ = tokio::time::sleep(self.settings.breaker_pause) => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        continue;
                    }
                }
                consecutive_failures = 0;
                info!(worker = id, "Circuit breaker reset, resuming...");
            }

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                result = self.queue.receive(self.settings.batch_size) => {
                    match result {
                        Ok(deliveries) => {
                            for delivery in deliveries {
                                match self.handle(delivery).await {
                                    Handled::Ok => consecutive_failures = 0,
                                    Handled::Error => consecutive_failures += 1,
                                }
                            }
                        }
                        Err(e) => {
                            consecutive_failures += 1;
                            error!(worker = id, error = %e, "Failed to receive jobs from queue");
                            tokio::time::sleep(self.settings.error_delay).await;
                        }
                    }
                }
            }
        }

        debug!(worker = id, "Worker stopped");
    }

    /// Process one delivery and settle it with the queue
    #[instrument(skip(self, delivery), fields(cdr_id = %delivery.job.cdr_id, attempt = delivery.job.attempt))]
    pub async fn handle(&self, delivery: Delivery) -> Handled {
        let backend = self.queue.backend();

        match self.orchestrator.process(&delivery.job).await {
            Ok(StageOutcome::Retry { delay }) => {
                metrics::record_queue_processed(backend, true);
                if let Err(e) = self.queue.nack(delivery, delay).await {
                    error!(error = %e, "Failed to requeue job");
                    return Handled::Error;
                }
                Handled::Ok
            }
            Ok(outcome) => {
                debug!(?outcome, "Job finished");
                metrics::record_queue_processed(backend, true);
                if let Err(e) = self.queue.ack(&delivery).await {
                    // redelivery is harmless; the orchestrator will skip the call
                    error!(error = %e, "Failed to ack job");
                    return Handled::Error;
                }
                Handled::Ok
            }
            Err(e) => {
                error!(error = %e, "Failed to process job");
                metrics::record_queue_processed(backend, false);
                if let Err(e) = self.queue.nack(delivery, self.settings.error_delay).await {
                    error!(error = %e, "Failed to requeue job");
                }
                Handled::Error
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;
    use callscope_common::db::models::PipelineState;
    use callscope_common::queue::MemoryQueue;
    use callscope_common::PipelineJob;

    fn pool(queue: Arc<MemoryQueue>, orchestrator: Orchestrator) -> Arc<WorkerPool> {
        Arc::new(WorkerPool::new(
            queue,
            Arc::new(orchestrator),
            WorkerSettings {
                workers: 2,
                breaker_pause: Duration::from_millis(10),
                error_delay: Duration::from_millis(10),
                ..WorkerSettings::default()
            },
        ))
    }

    #[tokio::test]
    async fn test_retry_outcome_is_nacked_with_delay() {
        let repo = testing::repo().await;
        let mocks = testing::mocks();
        let tenant = testing::tenant(&repo, "acme", &[]).await;
        let cdr = testing::cdr(&repo, &tenant, "abc-123", "2026-02/rec.wav@").await;
        mocks.pbx.add_recording("2026-02", "rec.wav", testing::vendor_recording(42));
        mocks.stt.fail_requests(true);
        let queue = Arc::new(MemoryQueue::new(Duration::from_millis(10)));
        let pool = pool(queue.clone(), testing::orchestrator(&repo, &mocks));

        let handled = pool
            .handle(Delivery {
                job: PipelineJob::new(cdr.id, tenant.id),
                receipt: None,
            })
            .await;

        assert_eq!(handled, Handled::Ok);
        assert_eq!(queue.delayed_len().await, 1);
    }

    #[tokio::test]
    async fn test_unknown_call_is_acked() {
        let repo = testing::repo().await;
        let mocks = testing::mocks();
        let queue = Arc::new(MemoryQueue::new(Duration::from_millis(10)));
        let pool = pool(queue.clone(), testing::orchestrator(&repo, &mocks));

        let handled = pool
            .handle(Delivery {
                job: PipelineJob::new(uuid::Uuid::new_v4(), uuid::Uuid::new_v4()),
                receipt: None,
            })
            .await;

        assert_eq!(handled, Handled::Ok);
        assert!(queue.is_empty().await);
        assert_eq!(queue.delayed_len().await, 0);
    }

    #[tokio::test]
    async fn test_workers_drain_queue_and_stop() {
        let repo = testing::repo().await;
        let mocks = testing::mocks();
        let tenant = testing::tenant(&repo, "acme", &["sentiment-analysis"]).await;
        let queue = Arc::new(MemoryQueue::new(Duration::from_millis(10)));
        let mut ids = Vec::new();
        for n in 0..3 {
            let file = format!("{}.wav", n);
            mocks.pbx.add_recording("2026-02", &file, testing::vendor_recording(40));
            let cdr = testing::cdr(&repo, &tenant, &format!("c-{}", n), &format!("2026-02/{}@", file)).await;
            queue.enqueue(&PipelineJob::new(cdr.id, tenant.id)).await.unwrap();
            ids.push(cdr.id);
        }

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(pool(queue.clone(), testing::orchestrator(&repo, &mocks)).run(rx));

        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            let mut done = 0;
            for id in &ids {
                if repo.find_cdr(*id).await.unwrap().unwrap().state() == PipelineState::Done {
                    done += 1;
                }
            }
            if done == ids.len() {
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "calls did not finish");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(mocks.stt.call_count(), 3);
    }
}
