//! Wiring for the pipeline services
//!
//! Both binaries build a `PipelineRuntime` from configuration and choose
//! which background loops to run: the gateway runs everything when the
//! queue is in-process, the worker binary runs only the worker pool.

use std::sync::Arc;
use std::time::Duration;

use callscope_common::errors::Result;
use callscope_common::{AppConfig, BlobStore, JobQueue, Repository};
use callscope_pbx::{LegRule, PbxApi, SessionManager, UcmClient};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

use crate::acquisition::{AcquisitionSettings, RecordingAcquirer};
use crate::analysis::{create_llm_client, AnalysisDispatcher, LlmClient};
use crate::ingest::Ingestor;
use crate::orchestrator::{Orchestrator, OrchestratorSettings};
use crate::poller::CdrPoller;
use crate::sweep::ResumeSweep;
use crate::transcoder::{FfmpegTranscoder, Transcoder};
use crate::transcription::{create_transcriber, Transcriber, TranscriptionStage};
use crate::worker::{WorkerPool, WorkerSettings};

/// Background loops to start
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Services {
    pub workers: bool,
    pub poller: bool,
    pub sweep: bool,
}

impl Services {
    pub fn all() -> Self {
        Self {
            workers: true,
            poller: true,
            sweep: true,
        }
    }

    pub fn workers_only() -> Self {
        Self {
            workers: true,
            poller: false,
            sweep: false,
        }
    }
}

/// External collaborators, replaceable in tests
pub struct Collaborators {
    pub pbx: Arc<dyn PbxApi>,
    pub transcoder: Arc<dyn Transcoder>,
    pub transcriber: Arc<dyn Transcriber>,
    pub llm: Arc<dyn LlmClient>,
}

impl Collaborators {
    pub fn from_config(config: &AppConfig) -> Result<Self> {
        Ok(Self {
            pbx: Arc::new(UcmClient::new(&config.pbx)?),
            transcoder: Arc::new(FfmpegTranscoder::new(&config.audio)),
            transcriber: create_transcriber(&config.stt)?,
            llm: create_llm_client(&config.llm)?,
        })
    }
}

pub struct PipelineRuntime {
    ingestor: Ingestor,
    orchestrator: Arc<Orchestrator>,
    poller: Arc<CdrPoller>,
    sweep: Arc<ResumeSweep>,
    workers: Arc<WorkerPool>,
    poller_enabled: bool,
}

impl PipelineRuntime {
    pub fn from_config(
        config: &AppConfig,
        repo: Repository,
        storage: BlobStore,
        queue: Arc<dyn JobQueue>,
    ) -> Result<Self> {
        Self::build(config, repo, storage, queue, Collaborators::from_config(config)?)
    }

    pub fn build(
        config: &AppConfig,
        repo: Repository,
        storage: BlobStore,
        queue: Arc<dyn JobQueue>,
        collaborators: Collaborators,
    ) -> Result<Self> {
        let leg_rule = LegRule::from_config(&config.pbx)?;
        let sessions = Arc::new(SessionManager::new(
            collaborators.pbx,
            Duration::from_secs(config.pbx.session_ttl_secs),
        ));

        let acquirer = RecordingAcquirer::new(
            sessions.clone(),
            storage.clone(),
            collaborators.transcoder,
            AcquisitionSettings::from_config(config),
        );
        let transcription = TranscriptionStage::new(repo.clone(), storage, collaborators.transcriber);
        let analysis = AnalysisDispatcher::new(repo.clone(), collaborators.llm, &config.analysis, &config.llm);

        let orchestrator = Arc::new(Orchestrator::new(
            repo.clone(),
            Arc::new(acquirer),
            Arc::new(transcription),
            Arc::new(analysis),
            OrchestratorSettings::from_config(&config.pipeline),
        ));

        let ingestor = Ingestor::new(repo.clone(), queue.clone());
        let poller = Arc::new(CdrPoller::new(
            repo.clone(),
            sessions,
            ingestor.clone(),
            leg_rule,
            &config.poller,
        ));
        let sweep = Arc::new(ResumeSweep::new(repo, queue.clone(), &config.pipeline));
        let workers = Arc::new(WorkerPool::new(
            queue,
            orchestrator.clone(),
            WorkerSettings {
                workers: config.pipeline.workers.max(1),
                batch_size: config.queue.batch_size.max(1) as usize,
                ..WorkerSettings::default()
            },
        ));

        Ok(Self {
            ingestor,
            orchestrator,
            poller,
            sweep,
            workers,
            poller_enabled: config.poller.enabled,
        })
    }

    pub fn ingestor(&self) -> &Ingestor {
        &self.ingestor
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    /// Start the selected loops; they stop when `shutdown` flips to true
    pub fn spawn(&self, services: Services, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        if services.workers {
            handles.push(tokio::spawn(self.workers.clone().run(shutdown.clone())));
        }
        if services.poller && self.poller_enabled {
            handles.push(tokio::spawn(self.poller.clone().run(shutdown.clone())));
        }
        if services.sweep {
            handles.push(tokio::spawn(self.sweep.clone().run(shutdown)));
        }

        info!(
            workers = services.workers,
            poller = services.poller && self.poller_enabled,
            sweep = services.sweep,
            "Pipeline services started"
        );
        handles
    }
}
