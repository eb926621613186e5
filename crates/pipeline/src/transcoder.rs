//! Delivery transcoding via ffmpeg
//!
//! Normalized audio is re-encoded to a compact mono MP3 for storage and
//! playback. The subprocess is CPU-bound, so it runs outside the async
//! executor threads and is bounded by a timeout.

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use callscope_common::config::AudioConfig;
use callscope_common::errors::{AppError, Result};
use tokio::process::Command;
use tracing::debug;

use crate::audio::AudioFormat;

#[async_trait]
pub trait Transcoder: Send + Sync {
    /// Re-encode to the delivery format (MP3)
    async fn to_delivery(&self, input: Bytes, format: AudioFormat) -> Result<Bytes>;

    /// Decoded duration in seconds, for containers we cannot parse ourselves
    async fn probe_duration(&self, input: Bytes, format: AudioFormat) -> Result<f64>;
}

pub struct FfmpegTranscoder {
    ffmpeg_path: String,
    ffprobe_path: String,
    bitrate: String,
    timeout: Duration,
}

impl FfmpegTranscoder {
    pub fn new(config: &AudioConfig) -> Self {
        Self {
            ffmpeg_path: config.ffmpeg_path.clone(),
            ffprobe_path: config.ffprobe_path.clone(),
            bitrate: config.delivery_bitrate.clone(),
            timeout: Duration::from_secs(config.transcode_timeout_secs),
        }
    }

    async fn write_input(dir: &Path, input: &[u8], format: AudioFormat) -> Result<std::path::PathBuf> {
        let path = dir.join(format!("input.{}", format.extension()));
        tokio::fs::write(&path, input).await?;
        Ok(path)
    }

    async fn run(&self, command: &mut Command, what: &str) -> Result<std::process::Output> {
        command.kill_on_drop(true);

        let output = tokio::time::timeout(self.timeout, command.output())
            .await
            .map_err(|_| AppError::Transcoding {
                message: format!("{} timed out after {}s", what, self.timeout.as_secs()),
            })?
            .map_err(|e| AppError::Transcoding {
                message: format!("failed to start {}: {}", what, e),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let tail: String = stderr
                .lines()
                .rev()
                .take(3)
                .collect::<Vec<_>>()
                .into_iter()
                .rev()
                .collect::<Vec<_>>()
                .join(" | ");
            return Err(AppError::Transcoding {
                message: format!("{} exited with {}: {}", what, output.status, tail),
            });
        }

        Ok(output)
    }
}

#[async_trait]
impl Transcoder for FfmpegTranscoder {
    async fn to_delivery(&self, input: Bytes, format: AudioFormat) -> Result<Bytes> {
        let dir = tempfile::tempdir()?;
        let input_path = Self::write_input(dir.path(), &input, format).await?;
        let output_path = dir.path().join("delivery.mp3");

        let mut command = Command::new(&self.ffmpeg_path);
        command
            .arg("-hide_banner")
            .args(["-loglevel", "error"])
            .arg("-y")
            .arg("-i")
            .arg(&input_path)
            .arg("-vn")
            .args(["-ac", "1"])
            .args(["-codec:a", "libmp3lame"])
            .args(["-b:a", &self.bitrate])
            .arg(&output_path);

        self.run(&mut command, "ffmpeg").await?;

        let encoded = tokio::fs::read(&output_path).await?;
        if encoded.is_empty() {
            return Err(AppError::Transcoding {
                message: "ffmpeg produced an empty file".to_string(),
            });
        }

        debug!(
            input_bytes = input.len(),
            output_bytes = encoded.len(),
            "Transcoded recording to MP3"
        );
        Ok(Bytes::from(encoded))
    }

    async fn probe_duration(&self, input: Bytes, format: AudioFormat) -> Result<f64> {
        let dir = tempfile::tempdir()?;
        let input_path = Self::write_input(dir.path(), &input, format).await?;

        let mut command = Command::new(&self.ffprobe_path);
        command
            .args(["-v", "error"])
            .args(["-show_entries", "format=duration"])
            .args(["-of", "default=noprint_wrappers=1:nokey=1"])
            .arg(&input_path);

        let output = self.run(&mut command, "ffprobe").await?;
        let stdout = String::from_utf8_lossy(&output.stdout);

        stdout
            .trim()
            .parse::<f64>()
            .map_err(|_| AppError::InvalidAudio {
                message: format!("ffprobe reported no duration: '{}'", stdout.trim()),
            })
    }
}

/// Scripted transcoder for tests
///
/// Delivery output is the input prefixed with an ID3 tag so it detects as MP3.
#[derive(Default)]
pub struct MockTranscoder {
    fail: AtomicBool,
    duration: Mutex<Option<f64>>,
    calls: AtomicUsize,
}

impl MockTranscoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_transcodes(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    /// Duration returned by `probe_duration`
    pub fn set_probe_duration(&self, secs: f64) {
        if let Ok(mut d) = self.duration.lock() {
            *d = Some(secs);
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transcoder for MockTranscoder {
    async fn to_delivery(&self, input: Bytes, _format: AudioFormat) -> Result<Bytes> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(AppError::Transcoding {
                message: "mock transcoder failure".to_string(),
            });
        }

        let mut out = Vec::with_capacity(input.len() + 10);
        out.extend_from_slice(b"ID3\x04\x00\x00\x00\x00\x00\x00");
        out.extend_from_slice(&input);
        Ok(Bytes::from(out))
    }

    async fn probe_duration(&self, _input: Bytes, format: AudioFormat) -> Result<f64> {
        let configured = self.duration.lock().ok().and_then(|d| *d);
        configured.ok_or_else(|| AppError::InvalidAudio {
            message: format!("no duration scripted for {}", format),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_output_detects_as_mp3() {
        let mock = MockTranscoder::new();
        let out = mock
            .to_delivery(Bytes::from_static(b"RIFF"), AudioFormat::Wav)
            .await
            .unwrap();

        assert_eq!(AudioFormat::detect(&out), AudioFormat::Mp3);
        assert_eq!(mock.call_count(), 1);
    }

    #[tokio::test]
    async fn test_mock_failure_is_transcoding_error() {
        let mock = MockTranscoder::new();
        mock.fail_transcodes(true);

        let err = mock
            .to_delivery(Bytes::from_static(b"x"), AudioFormat::Wav)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Transcoding { .. }));
    }

    #[tokio::test]
    async fn test_missing_binary_is_transcoding_error() {
        let transcoder = FfmpegTranscoder::new(&AudioConfig {
            ffmpeg_path: "/nonexistent/ffmpeg-binary".to_string(),
            ..AudioConfig::default()
        });

        let err = transcoder
            .to_delivery(Bytes::from_static(b"RIFF0000WAVE"), AudioFormat::Wav)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Transcoding { .. }));
    }
}
