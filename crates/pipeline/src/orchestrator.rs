//! Per-call pipeline state machine
//!
//! ```text
//! RECEIVED -> ACQUIRING -> ACQUIRED -> TRANSCRIBING -> TRANSCRIBED -> ANALYZING -> DONE
//!    |            |                          |
//!    |            +-> DISCARDED              +-> TRANSCRIPTION_FAILED
//!    |            +-> ACQUISITION_FAILED
//!    +-> DONE (nothing to acquire)
//! ```
//!
//! Every stage is claimed with a compare-and-set on the state column, so
//! re-running `process` for any call at any time is safe: a stage that is
//! already done is skipped, a stage another worker holds is left alone.
//! While a stage runs its worker keeps `updated_at` fresh, so the resume
//! sweep only rolls back stages whose worker has gone away.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use callscope_common::config::PipelineConfig;
use callscope_common::db::models::{CdrRecord, PipelineState, Tenant};
use callscope_common::errors::{AppError, FailureKind, Result};
use callscope_common::metrics;
use callscope_common::{PipelineJob, Repository};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::acquisition::{Acquired, RecordingAcquirer};
use crate::analysis::AnalysisDispatcher;
use crate::transcription::TranscriptionStage;

/// State a freshly stored call starts the pipeline in
pub fn initial_state(cdr: &CdrRecord) -> PipelineState {
    if cdr.is_eligible_for_acquisition() {
        PipelineState::Received
    } else {
        PipelineState::Done
    }
}

/// What a worker should do with the job afterwards
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageOutcome {
    /// The call reached a terminal state
    Completed(PipelineState),
    /// A transient failure; redeliver after `delay`
    Retry { delay: Duration },
    /// Nothing to do here: unknown call, or another worker holds the stage
    Skipped,
}

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub max_stage_attempts: u32,
    /// Base delay before a retried stage; doubles per attempt
    pub retry_delay: Duration,
    /// How often a running stage refreshes `updated_at`
    pub heartbeat_interval: Duration,
}

impl OrchestratorSettings {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            max_stage_attempts: config.max_stage_attempts.max(1),
            retry_delay: Duration::from_secs(5),
            heartbeat_interval: heartbeat_interval(config.stale_after_secs),
        }
    }
}

/// A third of the sweep's staleness window, so two missed beats still
/// leave the call looking alive
pub fn heartbeat_interval(stale_after_secs: u64) -> Duration {
    Duration::from_millis((stale_after_secs.saturating_mul(1000) / 3).max(1000))
}

#[derive(Debug, Clone, Copy)]
enum Stage {
    Acquisition,
    Transcription,
    Analysis,
}

impl Stage {
    fn as_str(&self) -> &'static str {
        match self {
            Stage::Acquisition => "acquisition",
            Stage::Transcription => "transcription",
            Stage::Analysis => "analysis",
        }
    }

    /// (claimed from, failed terminal state)
    fn states(&self) -> (PipelineState, PipelineState) {
        match self {
            Stage::Acquisition => (PipelineState::Received, PipelineState::AcquisitionFailed),
            Stage::Transcription => (PipelineState::Acquired, PipelineState::TranscriptionFailed),
            // analysis never fails a call; exhausted attempts degrade instead
            Stage::Analysis => (PipelineState::Transcribed, PipelineState::Done),
        }
    }
}

pub struct Orchestrator {
    repo: Repository,
    acquirer: Arc<RecordingAcquirer>,
    transcription: Arc<TranscriptionStage>,
    analysis: Arc<AnalysisDispatcher>,
    settings: OrchestratorSettings,
}

impl Orchestrator {
    pub fn new(
        repo: Repository,
        acquirer: Arc<RecordingAcquirer>,
        transcription: Arc<TranscriptionStage>,
        analysis: Arc<AnalysisDispatcher>,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            repo,
            acquirer,
            transcription,
            analysis,
            settings,
        }
    }

    /// Drive one call as far as it can go
    #[instrument(skip(self, job), fields(cdr_id = %job.cdr_id, tenant_id = %job.tenant_id, attempt = job.attempt))]
    pub async fn process(&self, job: &PipelineJob) -> Result<StageOutcome> {
        let Some(mut cdr) = self.repo.find_cdr(job.cdr_id).await? else {
            warn!("Job for unknown call, dropping");
            return Ok(StageOutcome::Skipped);
        };

        let Some(tenant) = self.repo.find_tenant_by_id(cdr.tenant_id).await? else {
            warn!("Call belongs to an unknown tenant, dropping");
            return Ok(StageOutcome::Skipped);
        };

        loop {
            let state = cdr.state();
            let step = match state {
                PipelineState::Received => self.acquire(&tenant, &cdr).await?,
                PipelineState::Acquired => self.transcribe(&cdr).await?,
                PipelineState::Transcribed => self.analyze(&tenant, &cdr).await?,
                PipelineState::Acquiring | PipelineState::Transcribing | PipelineState::Analyzing => {
                    debug!(state = %state, "Stage held by another worker");
                    return Ok(StageOutcome::Skipped);
                }
                terminal => return Ok(StageOutcome::Completed(terminal)),
            };

            if let Some(outcome) = step {
                return Ok(outcome);
            }

            cdr = match self.repo.find_cdr(cdr.id).await? {
                Some(cdr) => cdr,
                None => return Ok(StageOutcome::Skipped),
            };
        }
    }

    /// `None` means the call moved on and the loop should continue
    async fn acquire(&self, tenant: &Tenant, cdr: &CdrRecord) -> Result<Option<StageOutcome>> {
        if !cdr.is_eligible_for_acquisition() {
            self.repo
                .transition_state(cdr.id, PipelineState::Received, PipelineState::Done)
                .await?;
            return Ok(None);
        }

        if !self
            .repo
            .transition_state(cdr.id, PipelineState::Received, PipelineState::Acquiring)
            .await?
        {
            return Ok(Some(StageOutcome::Skipped));
        }

        let started = Instant::now();
        let acquired = self
            .with_heartbeat(cdr.id, PipelineState::Acquiring, self.acquirer.acquire(tenant, cdr))
            .await;
        match acquired {
            Ok(Acquired::Stored(recording)) => {
                self.repo
                    .mark_recording_acquired(
                        cdr.id,
                        &recording.key,
                        recording.size_bytes,
                        &recording.sha256,
                        recording.duration_secs.round() as i32,
                    )
                    .await?;
                metrics::record_stage(Stage::Acquisition.as_str(), "success", started.elapsed().as_secs_f64());
                Ok(None)
            }
            Ok(Acquired::Discarded { duration_secs }) => {
                self.repo
                    .mark_discarded(cdr.id, duration_secs.round() as i32)
                    .await?;
                if !cdr.quota_exceeded {
                    self.repo.release_usage(tenant.id).await?;
                }
                metrics::record_stage(Stage::Acquisition.as_str(), "discarded", started.elapsed().as_secs_f64());
                info!(cdr_id = %cdr.id, duration_secs, "Call discarded as too short");
                Ok(Some(StageOutcome::Completed(PipelineState::Discarded)))
            }
            Err(e) => self.stage_failed(Stage::Acquisition, cdr, e, started).await.map(Some),
        }
    }

    async fn transcribe(&self, cdr: &CdrRecord) -> Result<Option<StageOutcome>> {
        if !self
            .repo
            .transition_state(cdr.id, PipelineState::Acquired, PipelineState::Transcribing)
            .await?
        {
            return Ok(Some(StageOutcome::Skipped));
        }

        let started = Instant::now();
        let transcribed = self
            .with_heartbeat(cdr.id, PipelineState::Transcribing, self.transcription.run(cdr))
            .await;
        match transcribed {
            Ok(_) => {
                self.repo
                    .complete_stage(cdr.id, PipelineState::Transcribing, PipelineState::Transcribed)
                    .await?;
                metrics::record_stage(Stage::Transcription.as_str(), "success", started.elapsed().as_secs_f64());
                Ok(None)
            }
            Err(e) => self.stage_failed(Stage::Transcription, cdr, e, started).await.map(Some),
        }
    }

    async fn analyze(&self, tenant: &Tenant, cdr: &CdrRecord) -> Result<Option<StageOutcome>> {
        if !self
            .repo
            .transition_state(cdr.id, PipelineState::Transcribed, PipelineState::Analyzing)
            .await?
        {
            return Ok(Some(StageOutcome::Skipped));
        }

        let Some(transcript) = self.repo.find_transcription(cdr.id).await? else {
            warn!(cdr_id = %cdr.id, "Transcribed call has no transcript, transcribing again");
            self.repo
                .complete_stage(cdr.id, PipelineState::Analyzing, PipelineState::Acquired)
                .await?;
            return Ok(None);
        };

        let started = Instant::now();
        let final_attempt = cdr.stage_attempts as u32 + 1 >= self.settings.max_stage_attempts;
        let summary = self
            .with_heartbeat(
                cdr.id,
                PipelineState::Analyzing,
                self.analysis.analyze_all(tenant, cdr, &transcript.text, final_attempt),
            )
            .await;

        if summary.is_complete() {
            self.repo
                .complete_stage(cdr.id, PipelineState::Analyzing, PipelineState::Done)
                .await?;
            metrics::record_stage(Stage::Analysis.as_str(), "success", started.elapsed().as_secs_f64());
            info!(cdr_id = %cdr.id, cost_usd = summary.cost_usd, "Call processed");
            return Ok(Some(StageOutcome::Completed(PipelineState::Done)));
        }

        let failed: Vec<String> = summary
            .failed
            .iter()
            .map(|(kind, message)| format!("{}: {}", kind, message))
            .collect();
        let error = AppError::Llm {
            message: failed.join("; "),
        };
        self.stage_failed(Stage::Analysis, cdr, error, started).await.map(Some)
    }

    /// Run `work` while periodically re-asserting `state`, which bumps
    /// `updated_at` and keeps the resume sweep away from a live stage.
    /// A failed or lost heartbeat is logged; the stage itself keeps going
    /// and its closing compare-and-set decides the outcome.
    async fn with_heartbeat<F: Future>(&self, id: Uuid, state: PipelineState, work: F) -> F::Output {
        let mut ticker = tokio::time::interval(self.settings.heartbeat_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // the claim itself just set updated_at
        ticker.tick().await;
        tokio::pin!(work);

        loop {
            tokio::select! {
                biased;
                output = &mut work => return output,
                _ = ticker.tick() => match self.repo.transition_state(id, state, state).await {
                    Ok(true) => debug!(cdr_id = %id, state = %state, "Stage heartbeat"),
                    Ok(false) => warn!(cdr_id = %id, state = %state, "Stage no longer held by this worker"),
                    Err(e) => warn!(cdr_id = %id, error = %e, "Stage heartbeat failed"),
                },
            }
        }
    }

    /// Classify a stage error: permanent errors end the call, the rest are
    /// retried until the attempt budget is spent.
    async fn stage_failed(
        &self,
        stage: Stage,
        cdr: &CdrRecord,
        error: AppError,
        started: Instant,
    ) -> Result<StageOutcome> {
        let (revert_to, failed_state) = stage.states();
        let message = error.to_string();
        let elapsed = started.elapsed().as_secs_f64();

        if error.failure_kind() == FailureKind::Permanent {
            error!(cdr_id = %cdr.id, stage = stage.as_str(), error = %message, "Stage failed permanently");
            self.repo.set_state(cdr.id, failed_state, Some(message)).await?;
            metrics::record_stage(stage.as_str(), "failed", elapsed);
            return Ok(StageOutcome::Completed(failed_state));
        }

        let attempts = self
            .repo
            .record_stage_failure(cdr.id, revert_to, &message)
            .await?
            .max(1) as u32;

        if attempts >= self.settings.max_stage_attempts {
            error!(
                cdr_id = %cdr.id,
                stage = stage.as_str(),
                attempts,
                error = %message,
                "Stage attempts exhausted"
            );
            self.repo.set_state(cdr.id, failed_state, Some(message)).await?;
            metrics::record_stage(stage.as_str(), "exhausted", elapsed);
            return Ok(StageOutcome::Completed(failed_state));
        }

        let delay = self.settings.retry_delay * 2u32.saturating_pow(attempts - 1);
        warn!(
            cdr_id = %cdr.id,
            stage = stage.as_str(),
            attempts,
            retry_in_ms = delay.as_millis() as u64,
            error = %message,
            "Stage failed, will retry"
        );
        metrics::record_stage(stage.as_str(), "retry", elapsed);
        Ok(StageOutcome::Retry { delay })
    }
}
