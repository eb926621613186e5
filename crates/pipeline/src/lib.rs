//! Callscope Call Pipeline
//!
//! Everything that happens to a call after the PBX reports it:
//! - CDR ingestion shared by the webhook and the poller
//! - Recording acquisition with storage fallback, normalization and transcoding
//! - Idempotent transcription
//! - Per-feature AI analysis
//! - The orchestrator state machine, resume sweep and worker pool

pub mod acquisition;
pub mod analysis;
pub mod audio;
pub mod ingest;
pub mod orchestrator;
pub mod poller;
pub mod runtime;
pub mod sweep;
pub mod transcoder;
pub mod transcription;
pub mod worker;

#[cfg(test)]
mod testing;

pub use acquisition::{Acquired, RecordingAcquirer, StoredRecording};
pub use analysis::{AnalysisDispatcher, FeatureKind};
pub use ingest::{IngestOutcome, IngestStatus, Ingestor};
pub use orchestrator::{Orchestrator, StageOutcome};
pub use poller::CdrPoller;
pub use runtime::{Collaborators, PipelineRuntime, Services};
pub use sweep::ResumeSweep;
pub use worker::WorkerPool;
