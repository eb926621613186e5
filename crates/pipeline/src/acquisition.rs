//! Recording acquisition
//!
//! Fetches the audio for one call, normalizes it, measures its real length,
//! transcodes it for delivery and uploads it. Two sources are tried in order:
//! the PBX recording API, then a copy mirrored into object storage.

use std::sync::Arc;
use std::time::{Duration, Instant};

use backoff::future::retry;
use backoff::ExponentialBackoff;
use bytes::Bytes;
use callscope_common::auth::sha256_hex;
use callscope_common::config::{AppConfig, AudioConfig};
use callscope_common::db::models::{CdrRecord, Tenant};
use callscope_common::errors::{AppError, Result};
use callscope_common::metrics;
use callscope_common::storage::{pbx_mirror_key, recording_key};
use callscope_common::BlobStore;
use callscope_pbx::{PbxEndpoint, RecordingRef, SessionManager};
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::audio::{self, AudioFormat, NormalizedAudio};
use crate::transcoder::Transcoder;

#[derive(Debug, Clone)]
pub struct AcquisitionSettings {
    pub min_recording_secs: u32,
    pub download_attempts: u32,
    /// First delay between direct download attempts; doubles each retry
    pub retry_interval: Duration,
    pub default_recording_dir: String,
    pub audio: AudioConfig,
}

impl AcquisitionSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            min_recording_secs: config.pipeline.min_recording_secs,
            download_attempts: config.pipeline.download_attempts.max(1),
            retry_interval: Duration::from_secs(1),
            default_recording_dir: config.pbx.default_recording_dir.clone(),
            audio: config.audio.clone(),
        }
    }
}

/// Where the bytes came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AcquisitionPath {
    Direct,
    Fallback,
}

impl AcquisitionPath {
    pub fn as_str(&self) -> &'static str {
        match self {
            AcquisitionPath::Direct => "direct",
            AcquisitionPath::Fallback => "fallback",
        }
    }
}

#[derive(Debug, Clone)]
pub struct StoredRecording {
    pub key: String,
    pub size_bytes: i64,
    pub sha256: String,
    pub duration_secs: f64,
    pub path: AcquisitionPath,
    pub format: AudioFormat,
    /// False when the bytes were stored as fetched or normalized: the source
    /// was already MP3, or transcoding failed
    pub transcoded: bool,
}

#[derive(Debug, Clone)]
pub enum Acquired {
    Stored(StoredRecording),
    /// Shorter than the minimum; nothing was uploaded
    Discarded { duration_secs: f64 },
}

pub struct RecordingAcquirer {
    sessions: Arc<SessionManager>,
    storage: BlobStore,
    transcoder: Arc<dyn Transcoder>,
    settings: AcquisitionSettings,
}

impl RecordingAcquirer {
    pub fn new(
        sessions: Arc<SessionManager>,
        storage: BlobStore,
        transcoder: Arc<dyn Transcoder>,
        settings: AcquisitionSettings,
    ) -> Self {
        Self {
            sessions,
            storage,
            transcoder,
            settings,
        }
    }

    #[instrument(skip(self, tenant, cdr), fields(tenant_id = %tenant.id, cdr_id = %cdr.id, uniqueid = %cdr.uniqueid))]
    pub async fn acquire(&self, tenant: &Tenant, cdr: &CdrRecord) -> Result<Acquired> {
        let raw = cdr.recordfiles.as_deref().unwrap_or_default();
        let reference = RecordingRef::parse(raw, &self.settings.default_recording_dir)
            .ok_or_else(|| AppError::RecordingUnavailable {
                reference: raw.to_string(),
                message: "no usable recording path".to_string(),
            })?;

        let (downloaded, path) = self.fetch(tenant, &reference).await?;
        metrics::record_acquisition_path(path.as_str());
        debug!(bytes = downloaded.len(), path = path.as_str(), recording = %reference, "Recording downloaded");

        let normalized = self.normalize(downloaded).await?;
        if normalized.converted() {
            info!(normalization = ?normalized.normalization, "Normalized proprietary recording");
        }

        let duration_secs = self.measure(&normalized).await?;
        if duration_secs < f64::from(self.settings.min_recording_secs) {
            info!(
                duration_secs,
                min_secs = self.settings.min_recording_secs,
                "Recording below minimum duration, discarding"
            );
            return Ok(Acquired::Discarded { duration_secs });
        }

        let (artifact, format, transcoded) = if normalized.format == AudioFormat::Mp3 {
            (normalized.bytes, AudioFormat::Mp3, false)
        } else {
            match self
                .transcoder
                .to_delivery(normalized.bytes.clone(), normalized.format)
                .await
            {
                Ok(mp3) => (mp3, AudioFormat::Mp3, true),
                Err(e) => {
                    warn!(error = %e, "Transcoding failed, storing normalized audio");
                    (normalized.bytes, normalized.format, false)
                }
            }
        };

        let key = recording_key(tenant.id, cdr.id, format.extension());
        let sha256 = sha256_hex(&artifact);
        let size_bytes = artifact.len() as i64;
        self.storage.put(&key, artifact).await?;

        info!(key = %key, size_bytes, duration_secs, "Recording stored");

        Ok(Acquired::Stored(StoredRecording {
            key,
            size_bytes,
            sha256,
            duration_secs,
            path,
            format,
            transcoded,
        }))
    }

    async fn fetch(&self, tenant: &Tenant, reference: &RecordingRef) -> Result<(Bytes, AcquisitionPath)> {
        let direct_error = match PbxEndpoint::from_tenant(tenant) {
            Some(endpoint) => match self.download_direct(&endpoint, reference).await {
                Ok(bytes) => return Ok((bytes, AcquisitionPath::Direct)),
                Err(e) => {
                    warn!(error = %e, recording = %reference, "Direct download failed, trying storage mirror");
                    e
                }
            },
            None => AppError::RecordingUnavailable {
                reference: reference.to_string(),
                message: "tenant has no PBX connection".to_string(),
            },
        };

        let mirror = pbx_mirror_key(tenant.id, &reference.dir, &reference.filename);
        match self.storage.get(&mirror).await {
            Ok(bytes) => Ok((bytes, AcquisitionPath::Fallback)),
            Err(AppError::StorageNotFound { .. }) => Err(AppError::RecordingUnavailable {
                reference: reference.to_string(),
                message: format!("direct download failed ({}) and no mirrored copy", direct_error),
            }),
            Err(e) => Err(e),
        }
    }

    /// Bounded retries of transient failures; session renewal is handled by
    /// the session manager underneath each attempt.
    async fn download_direct(&self, endpoint: &PbxEndpoint, reference: &RecordingRef) -> Result<Bytes> {
        let max_attempts = self.settings.download_attempts.max(1);
        let policy = ExponentialBackoff {
            initial_interval: self.settings.retry_interval,
            current_interval: self.settings.retry_interval,
            multiplier: 2.0,
            randomization_factor: 0.1,
            max_elapsed_time: None,
            ..Default::default()
        };

        let mut attempt = 0u32;
        retry(policy, || {
            attempt += 1;
            let current = attempt;
            async move {
                match self
                    .sessions
                    .download_recording(endpoint, &reference.dir, &reference.filename)
                    .await
                {
                    Ok(bytes) => Ok(bytes),
                    Err(e) if e.is_retryable() && current < max_attempts => {
                        debug!(attempt = current, error = %e, "Download attempt failed, retrying");
                        Err(backoff::Error::transient(e))
                    }
                    Err(e) => Err(backoff::Error::permanent(e)),
                }
            }
        })
        .await
    }

    async fn normalize(&self, bytes: Bytes) -> Result<NormalizedAudio> {
        let config = self.settings.audio.clone();
        tokio::task::spawn_blocking(move || audio::normalize(bytes, &config))
            .await
            .map_err(|e| AppError::Internal {
                message: format!("normalization task failed: {}", e),
            })?
    }

    async fn measure(&self, audio: &NormalizedAudio) -> Result<f64> {
        let started = Instant::now();
        let duration = match audio.format {
            AudioFormat::Wav => match audio::wav_duration_secs(&audio.bytes) {
                Ok(secs) => secs,
                Err(_) => {
                    self.transcoder
                        .probe_duration(audio.bytes.clone(), audio.format)
                        .await?
                }
            },
            other => self.transcoder.probe_duration(audio.bytes.clone(), other).await?,
        };

        debug!(duration_secs = duration, elapsed_ms = started.elapsed().as_millis() as u64, "Measured recording");
        Ok(duration)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;
    use crate::transcoder::MockTranscoder;
    use callscope_pbx::MockPbx;

    struct Harness {
        pbx: Arc<MockPbx>,
        storage: BlobStore,
        transcoder: Arc<MockTranscoder>,
        acquirer: RecordingAcquirer,
    }

    fn harness() -> Harness {
        harness_with(testing::audio_config())
    }

    fn harness_with(audio: AudioConfig) -> Harness {
        let pbx = Arc::new(MockPbx::new(testing::PBX_PASSWORD));
        let sessions = Arc::new(SessionManager::new(pbx.clone(), Duration::from_secs(1800)));
        let storage = BlobStore::in_memory();
        let transcoder = Arc::new(MockTranscoder::new());
        let acquirer = RecordingAcquirer::new(
            sessions,
            storage.clone(),
            transcoder.clone(),
            AcquisitionSettings {
                min_recording_secs: 30,
                download_attempts: 3,
                retry_interval: Duration::from_millis(1),
                default_recording_dir: "monitor".to_string(),
                audio,
            },
        );
        Harness {
            pbx,
            storage,
            transcoder,
            acquirer,
        }
    }

    fn stored(acquired: Acquired) -> StoredRecording {
        match acquired {
            Acquired::Stored(s) => s,
            Acquired::Discarded { duration_secs } => panic!("discarded at {}s", duration_secs),
        }
    }

    #[tokio::test]
    async fn test_direct_download_is_normalized_and_stored() {
        let h = harness();
        let repo = testing::repo().await;
        let tenant = testing::tenant(&repo, "acme", &[]).await;
        let cdr = testing::cdr(&repo, &tenant, "abc-123", "2026-02/rec.wav@").await;
        h.pbx.add_recording("2026-02", "rec.wav", testing::vendor_recording(42));

        let rec = stored(h.acquirer.acquire(&tenant, &cdr).await.unwrap());

        assert_eq!(rec.path, AcquisitionPath::Direct);
        assert!((rec.duration_secs - 42.0).abs() < 1e-6);
        assert!(rec.transcoded);
        assert_eq!(rec.key, recording_key(tenant.id, cdr.id, "mp3"));

        let body = h.storage.get(&rec.key).await.unwrap();
        assert_eq!(AudioFormat::detect(&body), AudioFormat::Mp3);
        assert_eq!(rec.size_bytes, body.len() as i64);
        assert_eq!(rec.sha256, sha256_hex(&body));
    }

    #[tokio::test]
    async fn test_falls_back_to_storage_mirror() {
        let h = harness();
        let repo = testing::repo().await;
        let tenant = testing::tenant(&repo, "acme", &[]).await;
        let cdr = testing::cdr(&repo, &tenant, "abc-123", "2026-02/rec.wav@").await;

        h.pbx.fail_downloads(true);
        h.storage
            .put(
                &pbx_mirror_key(tenant.id, "2026-02", "rec.wav"),
                testing::vendor_recording(40),
            )
            .await
            .unwrap();

        let rec = stored(h.acquirer.acquire(&tenant, &cdr).await.unwrap());

        assert_eq!(rec.path, AcquisitionPath::Fallback);
        assert_eq!(h.pbx.download_count(), 3);
        assert!(h.storage.exists(&rec.key).await.unwrap());
    }

    #[tokio::test]
    async fn test_both_sources_missing_is_permanent() {
        let h = harness();
        let repo = testing::repo().await;
        let tenant = testing::tenant(&repo, "acme", &[]).await;
        let cdr = testing::cdr(&repo, &tenant, "abc-123", "2026-02/missing.wav@").await;

        let err = h.acquirer.acquire(&tenant, &cdr).await.unwrap_err();

        assert!(matches!(err, AppError::RecordingUnavailable { .. }));
        assert!(!err.is_retryable());
        // not found on the PBX is not retried
        assert_eq!(h.pbx.download_count(), 1);
    }

    #[tokio::test]
    async fn test_short_recording_is_discarded_without_upload() {
        let h = harness();
        let repo = testing::repo().await;
        let tenant = testing::tenant(&repo, "acme", &[]).await;
        let cdr = testing::cdr(&repo, &tenant, "short-1", "2026-02/short.wav@").await;
        h.pbx.add_recording("2026-02", "short.wav", testing::vendor_recording(15));

        let acquired = h.acquirer.acquire(&tenant, &cdr).await.unwrap();

        match acquired {
            Acquired::Discarded { duration_secs } => assert!((duration_secs - 15.0).abs() < 1e-6),
            other => panic!("expected discard, got {:?}", other),
        }
        assert_eq!(h.transcoder.call_count(), 0);
        assert!(!h.storage.exists(&recording_key(tenant.id, cdr.id, "mp3")).await.unwrap());
    }

    #[tokio::test]
    async fn test_transcode_failure_keeps_normalized_wav() {
        let h = harness();
        let repo = testing::repo().await;
        let tenant = testing::tenant(&repo, "acme", &[]).await;
        let cdr = testing::cdr(&repo, &tenant, "abc-123", "2026-02/rec.wav@").await;
        h.pbx.add_recording("2026-02", "rec.wav", testing::vendor_recording(35));
        h.transcoder.fail_transcodes(true);

        let rec = stored(h.acquirer.acquire(&tenant, &cdr).await.unwrap());

        assert!(!rec.transcoded);
        assert_eq!(rec.format, AudioFormat::Wav);
        assert!(rec.key.ends_with(".wav"));
        let body = h.storage.get(&rec.key).await.unwrap();
        assert_eq!(AudioFormat::detect(&body), AudioFormat::Wav);
    }

    #[tokio::test]
    async fn test_unusable_reference_is_permanent() {
        let h = harness();
        let repo = testing::repo().await;
        let tenant = testing::tenant(&repo, "acme", &[]).await;
        let cdr = testing::cdr(&repo, &tenant, "abc-123", "../../etc/passwd@").await;

        let err = h.acquirer.acquire(&tenant, &cdr).await.unwrap_err();
        assert!(matches!(err, AppError::RecordingUnavailable { .. }));
        assert_eq!(h.pbx.download_count(), 0);
    }

    #[tokio::test]
    async fn test_headerless_mulaw_with_default_audio_config() {
        let h = harness_with(AudioConfig::default());
        let repo = testing::repo().await;
        let tenant = testing::tenant(&repo, "acme", &[]).await;
        let cdr = testing::cdr(&repo, &tenant, "abc-123", "2026-02/raw.ulaw@").await;
        // silence first, so the payload starts with a run of 0xFF
        let mut samples = vec![0xFFu8; 8000 * 45];
        for (i, b) in samples.iter_mut().enumerate().skip(8000) {
            *b = 0x60 + (i % 40) as u8;
        }
        h.pbx.add_recording("2026-02", "raw.ulaw", Bytes::from(samples));

        let rec = stored(h.acquirer.acquire(&tenant, &cdr).await.unwrap());

        assert!((rec.duration_secs - 45.0).abs() < 1e-6);
        assert!(rec.transcoded);
        assert_eq!(h.transcoder.call_count(), 1);
    }

    #[tokio::test]
    async fn test_mp3_source_is_stored_without_transcoding() {
        let h = harness();
        let repo = testing::repo().await;
        let tenant = testing::tenant(&repo, "acme", &[]).await;
        let cdr = testing::cdr(&repo, &tenant, "abc-123", "2026-02/rec.mp3@").await;
        let mut mp3 = b"ID3\x04\x00\x00\x00\x00\x00\x00".to_vec();
        mp3.extend(std::iter::repeat(0x55u8).take(4096));
        let original = Bytes::from(mp3);
        h.pbx.add_recording("2026-02", "rec.mp3", original.clone());
        h.transcoder.set_probe_duration(61.5);

        let rec = stored(h.acquirer.acquire(&tenant, &cdr).await.unwrap());

        assert_eq!(h.transcoder.call_count(), 0);
        assert!(!rec.transcoded);
        assert_eq!(rec.format, AudioFormat::Mp3);
        assert_eq!(rec.key, recording_key(tenant.id, cdr.id, "mp3"));
        assert_eq!(h.storage.get(&rec.key).await.unwrap(), original);
        assert_eq!(rec.sha256, sha256_hex(&original));
    }
}
