//! Speech-to-text stage
//!
//! Provides a unified interface for transcription providers:
//! - OpenAI-compatible `/audio/transcriptions` (Whisper)
//! - Mock transcriber for tests and keyless development

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use callscope_common::config::SttConfig;
use callscope_common::db::models::{CdrRecord, Transcription};
use callscope_common::errors::{AppError, Result};
use callscope_common::{BlobStore, Repository};
use reqwest::multipart;
use serde::Deserialize;
use tracing::{debug, info, instrument, warn};

use crate::audio::AudioFormat;

/// Transcript as returned by a provider
#[derive(Debug, Clone)]
pub struct TranscriptText {
    pub text: String,
    pub language: Option<String>,
    pub duration_secs: Option<f64>,
}

/// Trait for speech-to-text providers
#[async_trait]
pub trait Transcriber: Send + Sync {
    async fn transcribe(&self, audio: Bytes, filename: &str, content_type: &str) -> Result<TranscriptText>;

    /// Provider name stored with each transcript
    fn provider(&self) -> &str;
}

/// OpenAI Whisper client
pub struct WhisperTranscriber {
    client: reqwest::Client,
    api_key: String,
    model: String,
    base_url: String,
    max_retries: u32,
}

#[derive(Deserialize)]
struct WhisperResponse {
    text: String,
    #[serde(default)]
    language: Option<String>,
    #[serde(default)]
    duration: Option<f64>,
}

impl WhisperTranscriber {
    pub fn new(api_key: String, config: &SttConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            api_key,
            model: config.model.clone(),
            base_url: config
                .api_base
                .clone()
                .unwrap_or_else(|| "https://api.openai.com/v1".to_string()),
            max_retries: config.max_retries.max(1),
        })
    }

    /// Make request with retry
    async fn request_with_retry(&self, audio: &Bytes, filename: &str, content_type: &str) -> Result<TranscriptText> {
        let mut last_error = None;

        for attempt in 0..self.max_retries {
            if attempt > 0 {
                let delay = Duration::from_millis(500 * 2_u64.pow(attempt));
                tokio::time::sleep(delay).await;
            }

            match self.make_request(audio.clone(), filename, content_type).await {
                Ok(transcript) => return Ok(transcript),
                Err(e) if e.is_retryable() => {
                    warn!(
                        attempt = attempt + 1,
                        max_retries = self.max_retries,
                        error = %e,
                        "Transcription request failed, retrying"
                    );
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_error.unwrap_or_else(|| AppError::Transcription {
            message: "Unknown error after retries".to_string(),
            retryable: true,
        }))
    }

    async fn make_request(&self, audio: Bytes, filename: &str, content_type: &str) -> Result<TranscriptText> {
        let url = format!("{}/audio/transcriptions", self.base_url.trim_end_matches('/'));

        let file_part = multipart::Part::stream(audio)
            .file_name(filename.to_string())
            .mime_str(content_type)
            .map_err(|e| AppError::Transcription {
                message: format!("Invalid content type: {}", e),
                retryable: false,
            })?;

        let form = multipart::Form::new()
            .part("file", file_part)
            .text("model", self.model.clone())
            .text("response_format", "verbose_json");

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .multipart(form)
            .send()
            .await
            .map_err(|e| AppError::Transcription {
                message: format!("Request failed: {}", e),
                retryable: true,
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::Transcription {
                message: format!("API error {}: {}", status, body),
                retryable: status.as_u16() == 429 || status.is_server_error(),
            });
        }

        let result: WhisperResponse = response.json().await.map_err(|e| AppError::Transcription {
            message: format!("Failed to parse response: {}", e),
            retryable: false,
        })?;

        Ok(TranscriptText {
            text: result.text.trim().to_string(),
            language: result.language,
            duration_secs: result.duration,
        })
    }
}

#[async_trait]
impl Transcriber for WhisperTranscriber {
    async fn transcribe(&self, audio: Bytes, filename: &str, content_type: &str) -> Result<TranscriptText> {
        self.request_with_retry(&audio, filename, content_type).await
    }

    fn provider(&self) -> &str {
        "openai"
    }
}

/// Mock transcriber for testing
pub struct MockTranscriber {
    text: Mutex<String>,
    calls: AtomicUsize,
    fail: AtomicBool,
    delay: Mutex<Duration>,
}

impl MockTranscriber {
    pub fn new(text: &str) -> Self {
        Self {
            text: Mutex::new(text.to_string()),
            calls: AtomicUsize::new(0),
            fail: AtomicBool::new(false),
            delay: Mutex::new(Duration::ZERO),
        }
    }

    /// Time each call takes before answering
    pub fn set_delay(&self, delay: Duration) {
        if let Ok(mut d) = self.delay.lock() {
            *d = delay;
        }
    }

    pub fn set_text(&self, text: &str) {
        if let Ok(mut t) = self.text.lock() {
            *t = text.to_string();
        }
    }

    /// Make every call fail with a retryable error
    pub fn fail_requests(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transcriber for MockTranscriber {
    async fn transcribe(&self, _audio: Bytes, _filename: &str, _content_type: &str) -> Result<TranscriptText> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let delay = self.delay.lock().map(|d| *d).unwrap_or_default();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(AppError::Transcription {
                message: "mock provider unavailable".to_string(),
                retryable: true,
            });
        }

        let text = self.text.lock().map(|t| t.clone()).unwrap_or_default();
        Ok(TranscriptText {
            text,
            language: Some("en".to_string()),
            duration_secs: None,
        })
    }

    fn provider(&self) -> &str {
        "mock"
    }
}

/// Create a transcriber based on configuration
pub fn create_transcriber(config: &SttConfig) -> Result<Arc<dyn Transcriber>> {
    match (config.provider.as_str(), config.api_key.clone()) {
        ("openai", Some(key)) if !key.is_empty() => Ok(Arc::new(WhisperTranscriber::new(key, config)?)),
        ("openai", _) => {
            warn!("No STT API key configured, using mock transcriber");
            Ok(Arc::new(MockTranscriber::new("")))
        }
        ("mock", _) => Ok(Arc::new(MockTranscriber::new(""))),
        (provider, _) => {
            warn!(provider = provider, "Unknown STT provider, using mock");
            Ok(Arc::new(MockTranscriber::new("")))
        }
    }
}

/// Transcribes a stored recording once per call
pub struct TranscriptionStage {
    repo: Repository,
    storage: BlobStore,
    transcriber: Arc<dyn Transcriber>,
}

impl TranscriptionStage {
    pub fn new(repo: Repository, storage: BlobStore, transcriber: Arc<dyn Transcriber>) -> Self {
        Self {
            repo,
            storage,
            transcriber,
        }
    }

    /// Returns the stored transcript, calling the provider only if none exists
    #[instrument(skip(self, cdr), fields(cdr_id = %cdr.id, tenant_id = %cdr.tenant_id))]
    pub async fn run(&self, cdr: &CdrRecord) -> Result<Transcription> {
        if let Some(existing) = self.repo.find_transcription(cdr.id).await? {
            debug!("Transcript already stored, skipping provider call");
            return Ok(existing);
        }

        let key = cdr
            .recording_local_path
            .as_deref()
            .ok_or_else(|| AppError::RecordingUnavailable {
                reference: cdr.uniqueid.clone(),
                message: "call has no stored recording".to_string(),
            })?;

        let audio = self.storage.get(key).await?;
        let format = AudioFormat::detect(&audio);
        let filename = key.rsplit('/').next().unwrap_or(key);

        let transcript = self
            .transcriber
            .transcribe(audio, filename, format.content_type())
            .await?;

        let stored = self
            .repo
            .insert_transcription(
                cdr,
                transcript.text,
                transcript.language,
                cdr.duration,
                self.transcriber.provider(),
            )
            .await?;

        info!(chars = stored.text.len(), provider = %stored.provider, "Transcript stored");
        Ok(stored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;
    use callscope_common::storage::recording_key;

    async fn acquired_cdr(repo: &Repository, storage: &BlobStore) -> CdrRecord {
        let tenant = testing::tenant(repo, "acme", &[]).await;
        let cdr = testing::cdr(repo, &tenant, "abc-123", "2026-02/rec.wav@").await;
        let key = recording_key(tenant.id, cdr.id, "mp3");
        storage
            .put(&key, Bytes::from_static(b"ID3\x04\x00\x00\x00\x00\x00\x00audio"))
            .await
            .unwrap();
        repo.mark_recording_acquired(cdr.id, &key, 16, "abc", 42).await.unwrap()
    }

    #[tokio::test]
    async fn test_transcribes_once() {
        let repo = testing::repo().await;
        let storage = BlobStore::in_memory();
        let mock = Arc::new(MockTranscriber::new("Hello, how can I help you"));
        let stage = TranscriptionStage::new(repo.clone(), storage.clone(), mock.clone());
        let cdr = acquired_cdr(&repo, &storage).await;

        let first = stage.run(&cdr).await.unwrap();
        mock.set_text("something else entirely");
        let second = stage.run(&cdr).await.unwrap();

        assert_eq!(mock.call_count(), 1);
        assert_eq!(first.id, second.id);
        assert_eq!(second.text, "Hello, how can I help you");
        assert_eq!(second.duration_seconds, 42);
        assert_eq!(second.provider, "mock");
    }

    #[tokio::test]
    async fn test_provider_outage_is_retryable() {
        let repo = testing::repo().await;
        let storage = BlobStore::in_memory();
        let mock = Arc::new(MockTranscriber::new("text"));
        mock.fail_requests(true);
        let stage = TranscriptionStage::new(repo.clone(), storage.clone(), mock);
        let cdr = acquired_cdr(&repo, &storage).await;

        let err = stage.run(&cdr).await.unwrap_err();
        assert!(err.is_retryable());
        assert!(repo.find_transcription(cdr.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_missing_recording_is_permanent() {
        let repo = testing::repo().await;
        let storage = BlobStore::in_memory();
        let mock = Arc::new(MockTranscriber::new("text"));
        let stage = TranscriptionStage::new(repo.clone(), storage, mock.clone());
        let tenant = testing::tenant(&repo, "acme", &[]).await;
        let cdr = testing::cdr(&repo, &tenant, "abc-123", "2026-02/rec.wav@").await;

        let err = stage.run(&cdr).await.unwrap_err();
        assert!(!err.is_retryable());
        assert_eq!(mock.call_count(), 0);
    }

    #[test]
    fn test_keyless_openai_falls_back_to_mock() {
        let transcriber = create_transcriber(&SttConfig::default()).unwrap();
        assert_eq!(transcriber.provider(), "mock");
    }
}
