//! Shared fixtures for pipeline tests

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use callscope_common::config::{AnalysisConfig, AudioConfig, LlmConfig};
use callscope_common::db::models::{CdrRecord, Disposition, Tenant};
use callscope_common::db::{test_pool, NewCdr, NewTenant, Repository};
use callscope_common::BlobStore;
use callscope_pbx::{MockPbx, SessionManager};
use uuid::Uuid;

use crate::acquisition::{AcquisitionSettings, RecordingAcquirer};
use crate::analysis::{AnalysisDispatcher, MockLlm};
use crate::orchestrator::{Orchestrator, OrchestratorSettings};
use crate::transcoder::MockTranscoder;
use crate::transcription::{MockTranscriber, TranscriptionStage};

pub const PBX_PASSWORD: &str = "secret";
pub const VENDOR_HEADER_LEN: usize = 16;

pub async fn repo() -> Repository {
    Repository::new(test_pool().await.unwrap())
}

pub fn audio_config() -> AudioConfig {
    AudioConfig {
        proprietary_header_len: VENDOR_HEADER_LEN,
        proprietary_encoding: "mulaw".to_string(),
        ..AudioConfig::default()
    }
}

pub async fn tenant(repo: &Repository, subdomain: &str, features: &[&str]) -> Tenant {
    tenant_with_limit(repo, subdomain, features, 10_000).await
}

pub async fn tenant_with_limit(repo: &Repository, subdomain: &str, features: &[&str], monthly_limit: i64) -> Tenant {
    repo.create_tenant(NewTenant {
        subdomain: subdomain.to_string(),
        name: subdomain.to_uppercase(),
        pbx_host: Some("10.0.0.5".to_string()),
        pbx_port: 8089,
        pbx_username: Some("cdrapi".to_string()),
        pbx_password: Some(PBX_PASSWORD.to_string()),
        pbx_enabled: true,
        webhook_username: subdomain.to_string(),
        webhook_password_hash: "unused".to_string(),
        enabled_features: features.iter().map(|f| f.to_string()).collect(),
        monthly_limit,
    })
    .await
    .unwrap()
}

pub fn new_cdr(tenant_id: Uuid, uniqueid: &str, recordfiles: Option<&str>) -> NewCdr {
    NewCdr {
        tenant_id,
        uniqueid: uniqueid.to_string(),
        source: "webhook".to_string(),
        src: Some("1001".to_string()),
        dst: Some("5551234".to_string()),
        caller_name: None,
        start_time: None,
        answer_time: None,
        end_time: None,
        duration: 60,
        billsec: 55,
        disposition: Disposition::Answered,
        recordfiles: recordfiles.map(String::from),
        quota_exceeded: false,
        raw_payload: None,
    }
}

pub async fn cdr(repo: &Repository, tenant: &Tenant, uniqueid: &str, recordfiles: &str) -> CdrRecord {
    repo.insert_cdr(new_cdr(tenant.id, uniqueid, Some(recordfiles)))
        .await
        .unwrap()
        .record()
        .clone()
}

/// Webhook-style JSON body for one call
pub fn payload(uniqueid: &str, disposition: &str, recordfiles: &str) -> serde_json::Value {
    serde_json::json!({
        "uniqueid": uniqueid,
        "src": "1001",
        "dst": "5551234",
        "start": "2026-02-03 10:00:00",
        "answer": "2026-02-03 10:00:05",
        "end": "2026-02-03 10:01:00",
        "duration": "60",
        "billsec": 55,
        "disposition": disposition,
        "recordfiles": recordfiles
    })
}

/// Vendor-framed μ-law recording of the given length at 8 kHz
pub fn vendor_recording(seconds: usize) -> Bytes {
    let mut out = vec![0xA5u8; VENDOR_HEADER_LEN];
    out.extend(std::iter::repeat(0xFFu8).take(seconds * 8000));
    Bytes::from(out)
}

/// Every external collaborator of the pipeline, mocked
pub struct Mocks {
    pub pbx: Arc<MockPbx>,
    pub sessions: Arc<SessionManager>,
    pub storage: BlobStore,
    pub transcoder: Arc<MockTranscoder>,
    pub stt: Arc<MockTranscriber>,
    pub llm: Arc<MockLlm>,
}

pub fn mocks() -> Mocks {
    let pbx = Arc::new(MockPbx::new(PBX_PASSWORD));
    Mocks {
        sessions: Arc::new(SessionManager::new(pbx.clone(), Duration::from_secs(1800))),
        pbx,
        storage: BlobStore::in_memory(),
        transcoder: Arc::new(MockTranscoder::new()),
        stt: Arc::new(MockTranscriber::new("Hello, how can I help you")),
        llm: Arc::new(MockLlm::new()),
    }
}

pub fn orchestrator(repo: &Repository, mocks: &Mocks) -> Orchestrator {
    let acquirer = RecordingAcquirer::new(
        mocks.sessions.clone(),
        mocks.storage.clone(),
        mocks.transcoder.clone(),
        AcquisitionSettings {
            min_recording_secs: 30,
            download_attempts: 2,
            retry_interval: Duration::from_millis(1),
            default_recording_dir: "monitor".to_string(),
            audio: audio_config(),
        },
    );
    let transcription = TranscriptionStage::new(repo.clone(), mocks.storage.clone(), mocks.stt.clone());
    let analysis = AnalysisDispatcher::new(
        repo.clone(),
        mocks.llm.clone(),
        &AnalysisConfig::default(),
        &LlmConfig::default(),
    );

    Orchestrator::new(
        repo.clone(),
        Arc::new(acquirer),
        Arc::new(transcription),
        Arc::new(analysis),
        OrchestratorSettings {
            max_stage_attempts: 3,
            retry_delay: Duration::from_millis(5),
            heartbeat_interval: Duration::from_millis(25),
        },
    )
}
