//! Pipeline job queue
//!
//! Provides:
//! - `JobQueue` abstraction used by ingestion, the sweep and the workers
//! - In-process queue for single-node deployments and tests
//! - SQS client wrapper with retry logic for distributed workers

use crate::config::QueueConfig;
use crate::errors::{AppError, Result};
use async_trait::async_trait;
use aws_sdk_sqs::types::Message;
use aws_sdk_sqs::Client as SqsClient;
use backoff::{future::retry, ExponentialBackoff};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Work item: advance one call through the pipeline
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineJob {
    pub cdr_id: Uuid,
    pub tenant_id: Uuid,
    /// Delivery count, bumped on every redelivery
    #[serde(default)]
    pub attempt: u32,
}

impl PipelineJob {
    pub fn new(cdr_id: Uuid, tenant_id: Uuid) -> Self {
        Self {
            cdr_id,
            tenant_id,
            attempt: 0,
        }
    }
}

/// A received job plus whatever the backend needs to ack it
#[derive(Debug, Clone)]
pub struct Delivery {
    pub job: PipelineJob,
    pub receipt: Option<String>,
}

/// Queue abstraction for pipeline jobs
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Publish a job
    async fn enqueue(&self, job: &PipelineJob) -> Result<()>;

    /// Wait for up to `max` jobs
    async fn receive(&self, max: usize) -> Result<Vec<Delivery>>;

    /// Remove a job after it has been handled
    async fn ack(&self, delivery: &Delivery) -> Result<()>;

    /// Hand a job back for redelivery after `delay`
    async fn nack(&self, delivery: Delivery, delay: Duration) -> Result<()>;

    /// Backend name for logs
    fn backend(&self) -> &'static str;
}

/// Create the configured queue backend
pub async fn create_queue(config: &QueueConfig) -> Result<Arc<dyn JobQueue>> {
    match config.backend.as_str() {
        "memory" => {
            info!("Using in-process job queue");
            Ok(Arc::new(MemoryQueue::new(Duration::from_secs(
                config.poll_timeout_secs,
            ))))
        }
        "sqs" => {
            let url = config
                .pipeline_queue_url
                .clone()
                .ok_or_else(|| AppError::Configuration {
                    message: "queue.pipeline_queue_url is required for the sqs backend".into(),
                })?;
            info!(url = %url, "Using SQS job queue");
            Ok(Arc::new(SqsQueue::new(SqsSettings::from_config(url, config)).await?))
        }
        other => Err(AppError::Configuration {
            message: format!("Unknown queue backend: {}", other),
        }),
    }
}

// ============================================================================
// In-process queue
// ============================================================================

/// FIFO queue held in memory. Jobs are lost on restart; the resume sweep
/// re-enqueues anything left unfinished.
pub struct MemoryQueue {
    jobs: Mutex<VecDeque<PipelineJob>>,
    delayed: Mutex<Vec<(Instant, PipelineJob)>>,
    notify: Notify,
    wait: Duration,
}

impl MemoryQueue {
    pub fn new(wait: Duration) -> Self {
        Self {
            jobs: Mutex::new(VecDeque::new()),
            delayed: Mutex::new(Vec::new()),
            notify: Notify::new(),
            wait,
        }
    }

    /// Move delayed jobs whose time has come to the ready queue.
    /// Returns how long until the next delayed job is due.
    async fn promote_due(&self) -> Option<Duration> {
        let now = Instant::now();
        let mut delayed = self.delayed.lock().await;
        if delayed.is_empty() {
            return None;
        }

        let mut jobs = self.jobs.lock().await;
        let mut next_due: Option<Duration> = None;
        delayed.retain(|(due, job)| {
            if *due <= now {
                jobs.push_back(job.clone());
                false
            } else {
                let remaining = *due - now;
                next_due = Some(next_due.map_or(remaining, |d| d.min(remaining)));
                true
            }
        });
        next_due
    }

    fn take(jobs: &mut VecDeque<PipelineJob>, max: usize) -> Vec<Delivery> {
        let n = max.min(jobs.len());
        jobs.drain(..n)
            .map(|job| Delivery { job, receipt: None })
            .collect()
    }

    /// Number of jobs waiting
    pub async fn len(&self) -> usize {
        self.jobs.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.jobs.lock().await.is_empty()
    }

    /// Take every ready job without blocking
    pub async fn drain(&self) -> Vec<PipelineJob> {
        self.promote_due().await;
        self.jobs.lock().await.drain(..).collect()
    }

    /// Jobs parked by `nack` that are not yet due
    pub async fn delayed_len(&self) -> usize {
        self.delayed.lock().await.len()
    }
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::new(Duration::from_secs(1))
    }
}

#[async_trait]
impl JobQueue for MemoryQueue {
    async fn enqueue(&self, job: &PipelineJob) -> Result<()> {
        let depth = {
            let mut jobs = self.jobs.lock().await;
            jobs.push_back(job.clone());
            jobs.len()
        };
        crate::metrics::record_queue_depth(depth);
        self.notify.notify_one();
        Ok(())
    }

    async fn receive(&self, max: usize) -> Result<Vec<Delivery>> {
        let max = max.max(1);
        let next_due = self.promote_due().await;

        {
            let mut jobs = self.jobs.lock().await;
            if !jobs.is_empty() {
                return Ok(Self::take(&mut jobs, max));
            }
        }

        // Empty: park until a producer signals, a delayed job is due, or the wait elapses
        let wait = next_due.map_or(self.wait, |due| due.min(self.wait));
        let _ = tokio::time::timeout(wait, self.notify.notified()).await;
        self.promote_due().await;

        let mut jobs = self.jobs.lock().await;
        Ok(Self::take(&mut jobs, max))
    }

    async fn ack(&self, _delivery: &Delivery) -> Result<()> {
        Ok(())
    }

    async fn nack(&self, delivery: Delivery, delay: Duration) -> Result<()> {
        let mut job = delivery.job;
        job.attempt += 1;

        if delay.is_zero() {
            return self.enqueue(&job).await;
        }

        self.delayed.lock().await.push((Instant::now() + delay, job));
        Ok(())
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}

// ============================================================================
// SQS
// ============================================================================

/// SQS queue settings
#[derive(Debug, Clone)]
pub struct SqsSettings {
    /// Queue URL
    pub url: String,
    /// Visibility timeout in seconds
    pub visibility_timeout: i32,
    /// Wait time for long polling (seconds)
    pub wait_time_seconds: i32,
    /// Maximum number of messages per poll
    pub max_messages: i32,
}

impl SqsSettings {
    pub fn from_config(url: String, config: &QueueConfig) -> Self {
        Self {
            url,
            visibility_timeout: config.visibility_timeout_secs as i32,
            wait_time_seconds: config.poll_timeout_secs.min(20) as i32,
            max_messages: config.batch_size.clamp(1, 10) as i32,
        }
    }
}

/// SQS queue client wrapper
pub struct SqsQueue {
    client: SqsClient,
    settings: SqsSettings,
}

impl SqsQueue {
    /// Create a new queue client
    pub async fn new(settings: SqsSettings) -> Result<Self> {
        let aws_config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
        let client = SqsClient::new(&aws_config);

        Ok(Self { client, settings })
    }

    /// Send a message to the queue, retrying transient failures
    pub async fn send<T: Serialize>(&self, message: &T) -> Result<String> {
        let body = serde_json::to_string(message).map_err(|e| AppError::QueueError {
            message: format!("Failed to serialize message: {}", e),
        })?;

        let policy = ExponentialBackoff {
            max_elapsed_time: Some(Duration::from_secs(10)),
            ..Default::default()
        };

        let result = retry(policy, || async {
            self.client
                .send_message()
                .queue_url(&self.settings.url)
                .message_body(&body)
                .send()
                .await
                .map_err(|e| {
                    warn!(error = %e, "SQS send failed, retrying");
                    backoff::Error::transient(e)
                })
        })
        .await
        .map_err(|e| AppError::QueueError {
            message: format!("Failed to send message: {}", e),
        })?;

        let message_id = result.message_id.unwrap_or_default();
        debug!(message_id = %message_id, "Message sent to queue");

        Ok(message_id)
    }

    /// Change visibility timeout
    pub async fn set_visibility(&self, receipt_handle: &str, seconds: i32) -> Result<()> {
        self.client
            .change_message_visibility()
            .queue_url(&self.settings.url)
            .receipt_handle(receipt_handle)
            .visibility_timeout(seconds)
            .send()
            .await
            .map_err(|e| AppError::QueueError {
                message: format!("Failed to change visibility: {}", e),
            })?;

        debug!(seconds, "Changed message visibility");
        Ok(())
    }

    /// Parse message body as JSON
    pub fn parse_message<T: DeserializeOwned>(message: &Message) -> Result<T> {
        let body = message.body.as_ref().ok_or_else(|| AppError::QueueError {
            message: "Message has no body".to_string(),
        })?;

        serde_json::from_str(body).map_err(|e| AppError::QueueError {
            message: format!("Failed to parse message: {}", e),
        })
    }
}

#[async_trait]
impl JobQueue for SqsQueue {
    async fn enqueue(&self, job: &PipelineJob) -> Result<()> {
        self.send(job).await.map(|_| ())
    }

    async fn receive(&self, max: usize) -> Result<Vec<Delivery>> {
        let max_messages = (max as i32).clamp(1, self.settings.max_messages);

        let result = self
            .client
            .receive_message()
            .queue_url(&self.settings.url)
            .max_number_of_messages(max_messages)
            .visibility_timeout(self.settings.visibility_timeout)
            .wait_time_seconds(self.settings.wait_time_seconds)
            .send()
            .await
            .map_err(|e| AppError::QueueError {
                message: format!("Failed to receive messages: {}", e),
            })?;

        let messages = result.messages.unwrap_or_default();
        debug!(count = messages.len(), "Received messages from queue");

        let mut deliveries = Vec::with_capacity(messages.len());
        for message in messages {
            match Self::parse_message::<PipelineJob>(&message) {
                Ok(job) => deliveries.push(Delivery {
                    job,
                    receipt: message.receipt_handle.clone(),
                }),
                Err(e) => {
                    // Unparseable bodies would loop forever; drop them
                    warn!(error = %e, "Discarding malformed queue message");
                    if let Some(handle) = message.receipt_handle.as_deref() {
                        self.client
                            .delete_message()
                            .queue_url(&self.settings.url)
                            .receipt_handle(handle)
                            .send()
                            .await
                            .map_err(|e| AppError::QueueError {
                                message: format!("Failed to delete message: {}", e),
                            })?;
                    }
                }
            }
        }

        Ok(deliveries)
    }

    async fn ack(&self, delivery: &Delivery) -> Result<()> {
        let Some(handle) = delivery.receipt.as_deref() else {
            return Ok(());
        };

        self.client
            .delete_message()
            .queue_url(&self.settings.url)
            .receipt_handle(handle)
            .send()
            .await
            .map_err(|e| AppError::QueueError {
                message: format!("Failed to delete message: {}", e),
            })?;

        debug!("Message deleted from queue");
        Ok(())
    }

    async fn nack(&self, delivery: Delivery, delay: Duration) -> Result<()> {
        // Visible again after `delay`; SQS redrive moves it to the DLQ after maxReceiveCount
        match delivery.receipt.as_deref() {
            Some(handle) => {
                let seconds = delay.as_secs().min(43_200) as i32;
                self.set_visibility(handle, seconds).await
            }
            None => Ok(()),
        }
    }

    fn backend(&self) -> &'static str {
        "sqs"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_message_serialization() {
        let job = PipelineJob::new(Uuid::new_v4(), Uuid::new_v4());

        let json = serde_json::to_string(&job).unwrap();
        let parsed: PipelineJob = serde_json::from_str(&json).unwrap();

        assert_eq!(job, parsed);
    }

    #[test]
    fn test_job_attempt_defaults_to_zero() {
        let json = format!(
            r#"{{"cdr_id":"{}","tenant_id":"{}"}}"#,
            Uuid::new_v4(),
            Uuid::new_v4()
        );
        let parsed: PipelineJob = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.attempt, 0);
    }

    #[test]
    fn test_sqs_settings_clamp_to_service_limits() {
        let config = QueueConfig {
            backend: "sqs".into(),
            pipeline_queue_url: Some("https://sqs.example/queue".into()),
            batch_size: 50,
            poll_timeout_secs: 60,
            visibility_timeout_secs: 300,
        };

        let settings = SqsSettings::from_config("https://sqs.example/queue".into(), &config);

        assert_eq!(settings.url, "https://sqs.example/queue");
        assert_eq!(settings.max_messages, 10);
        assert_eq!(settings.wait_time_seconds, 20);
        assert_eq!(settings.visibility_timeout, 300);
    }

    #[tokio::test]
    async fn test_memory_queue_fifo() {
        let queue = MemoryQueue::new(Duration::from_millis(10));
        let a = PipelineJob::new(Uuid::new_v4(), Uuid::new_v4());
        let b = PipelineJob::new(Uuid::new_v4(), Uuid::new_v4());

        queue.enqueue(&a).await.unwrap();
        queue.enqueue(&b).await.unwrap();

        let got = queue.receive(1).await.unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].job, a);

        let got = queue.receive(10).await.unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].job, b);
    }

    #[tokio::test]
    async fn test_memory_queue_receive_times_out_empty() {
        let queue = MemoryQueue::new(Duration::from_millis(10));
        assert!(queue.receive(5).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_memory_queue_nack_redelivers() {
        let queue = MemoryQueue::new(Duration::from_millis(10));
        queue
            .enqueue(&PipelineJob::new(Uuid::new_v4(), Uuid::new_v4()))
            .await
            .unwrap();

        let mut got = queue.receive(1).await.unwrap();
        queue.nack(got.remove(0), Duration::ZERO).await.unwrap();

        let again = queue.drain().await;
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].attempt, 1);
    }

    #[tokio::test]
    async fn test_memory_queue_delayed_nack() {
        let queue = MemoryQueue::new(Duration::from_millis(200));
        queue
            .enqueue(&PipelineJob::new(Uuid::new_v4(), Uuid::new_v4()))
            .await
            .unwrap();

        let mut got = queue.receive(1).await.unwrap();
        queue
            .nack(got.remove(0), Duration::from_millis(30))
            .await
            .unwrap();

        assert!(queue.drain().await.is_empty());
        assert_eq!(queue.delayed_len().await, 1);

        let later = queue.receive(1).await.unwrap();
        assert_eq!(later.len(), 1);
        assert_eq!(later[0].job.attempt, 1);
    }

    #[tokio::test]
    async fn test_memory_queue_wakes_waiting_receiver() {
        let queue = Arc::new(MemoryQueue::new(Duration::from_secs(5)));
        let job = PipelineJob::new(Uuid::new_v4(), Uuid::new_v4());

        let receiver = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.receive(1).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.enqueue(&job).await.unwrap();

        let got = receiver.await.unwrap().unwrap();
        assert_eq!(got[0].job, job);
    }
}
