//! Configuration management for Callscope services
//!
//! Supports loading configuration from:
//! - Environment variables (prefixed with APP__)
//! - Configuration files (config/default, config/{APP_ENV}, config/local)
//! - Default values

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Main application configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AppConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Database configuration
    pub database: DatabaseConfig,

    /// PBX (Grandstream UCM) API settings shared by all tenants
    #[serde(default)]
    pub pbx: PbxConfig,

    /// Durable object storage
    #[serde(default)]
    pub storage: StorageConfig,

    /// Audio normalization and transcoding
    #[serde(default)]
    pub audio: AudioConfig,

    /// Speech-to-text service
    #[serde(default)]
    pub stt: SttConfig,

    /// LLM service
    #[serde(default)]
    pub llm: LlmConfig,

    /// AI feature prompts
    #[serde(default)]
    pub analysis: AnalysisConfig,

    /// Job queue configuration
    #[serde(default)]
    pub queue: QueueConfig,

    /// Pipeline workers, retries and sweep
    #[serde(default)]
    pub pipeline: PipelineConfig,

    /// CDR poller
    #[serde(default)]
    pub poller: PollerConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    /// Observability configuration
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Host to bind to
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,

    /// Request timeout in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Shutdown timeout in seconds
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,

    /// Run workers, poller and sweep inside the gateway process
    #[serde(default = "default_enabled")]
    pub embedded_pipeline: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DatabaseConfig {
    /// Primary database URL (for writes)
    pub url: String,

    /// Read replica URL (optional, falls back to primary)
    pub read_url: Option<String>,

    /// Maximum number of connections
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Minimum number of connections
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,

    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Idle timeout in seconds
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,

    /// Apply pending migrations on startup
    #[serde(default = "default_enabled")]
    pub run_migrations: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PbxConfig {
    /// Path of the JSON API endpoint on the PBX
    #[serde(default = "default_pbx_api_path")]
    pub api_path: String,

    /// API version sent with the challenge request
    #[serde(default = "default_pbx_api_version")]
    pub api_version: String,

    /// Timeout for challenge/login/CDR requests
    #[serde(default = "default_pbx_request_timeout")]
    pub request_timeout_secs: u64,

    /// Timeout for recording downloads
    #[serde(default = "default_pbx_download_timeout")]
    pub download_timeout_secs: u64,

    /// How long a session cookie is trusted before re-authenticating
    #[serde(default = "default_pbx_session_ttl")]
    pub session_ttl_secs: u64,

    /// The UCM ships self-signed certificates
    #[serde(default = "default_enabled")]
    pub accept_invalid_certs: bool,

    /// Directory used when a recording reference is a bare filename
    #[serde(default = "default_recording_dir")]
    pub default_recording_dir: String,

    /// Authoritative leg rule: "recording" or "key:<leg name>"
    #[serde(default = "default_leg_rule")]
    pub leg_rule: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
    /// Backend: local, s3, memory
    #[serde(default = "default_storage_backend")]
    pub backend: String,

    /// Root directory for the local backend
    #[serde(default = "default_storage_path")]
    pub local_path: String,

    /// S3 bucket
    pub bucket: Option<String>,

    /// S3 region
    pub region: Option<String>,

    /// Custom S3 endpoint (MinIO etc.)
    pub endpoint: Option<String>,

    pub access_key: Option<String>,

    pub secret_key: Option<String>,

    /// Key prefix applied to every object
    pub prefix: Option<String>,

    /// Lifetime of signed URLs in seconds
    #[serde(default = "default_signed_url_ttl")]
    pub signed_url_ttl_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AudioConfig {
    /// Encoding of headerless vendor payloads: mulaw, alaw, pcm16
    #[serde(default = "default_proprietary_encoding")]
    pub proprietary_encoding: String,

    /// Bytes of vendor header to skip before raw samples
    #[serde(default)]
    pub proprietary_header_len: usize,

    /// Sample rate of headerless vendor payloads
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,

    /// How far into a payload to look for an embedded RIFF header
    #[serde(default = "default_riff_scan_limit")]
    pub riff_scan_limit: usize,

    #[serde(default = "default_ffmpeg_path")]
    pub ffmpeg_path: String,

    #[serde(default = "default_ffprobe_path")]
    pub ffprobe_path: String,

    /// MP3 bitrate for the delivery artifact
    #[serde(default = "default_delivery_bitrate")]
    pub delivery_bitrate: String,

    /// Transcode timeout in seconds
    #[serde(default = "default_transcode_timeout")]
    pub transcode_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SttConfig {
    /// Provider: openai, mock
    #[serde(default = "default_openai_provider")]
    pub provider: String,

    pub api_key: Option<String>,

    /// API base URL (for custom endpoints)
    pub api_base: Option<String>,

    #[serde(default = "default_stt_model")]
    pub model: String,

    #[serde(default = "default_stt_timeout")]
    pub timeout_secs: u64,

    #[serde(default = "default_retries")]
    pub max_retries: u32,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LlmConfig {
    /// Provider: openai, mock
    #[serde(default = "default_openai_provider")]
    pub provider: String,

    pub api_key: Option<String>,

    pub api_base: Option<String>,

    #[serde(default = "default_llm_model")]
    pub model: String,

    #[serde(default = "default_llm_timeout")]
    pub timeout_secs: u64,

    #[serde(default = "default_retries")]
    pub max_retries: u32,

    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// USD per 1K prompt tokens
    #[serde(default = "default_prompt_price")]
    pub prompt_price_per_1k: f64,

    /// USD per 1K completion tokens
    #[serde(default = "default_completion_price")]
    pub completion_price_per_1k: f64,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AnalysisConfig {
    /// Instruction text per feature slug, opaque to the pipeline
    #[serde(default)]
    pub prompts: HashMap<String, String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct QueueConfig {
    /// Backend: memory, sqs
    #[serde(default = "default_queue_backend")]
    pub backend: String,

    /// SQS pipeline queue URL
    pub pipeline_queue_url: Option<String>,

    /// Maximum messages to receive per poll
    #[serde(default = "default_queue_batch_size")]
    pub batch_size: u32,

    /// Long polling timeout in seconds
    #[serde(default = "default_queue_poll_timeout")]
    pub poll_timeout_secs: u64,

    /// Visibility timeout in seconds
    #[serde(default = "default_visibility_timeout")]
    pub visibility_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PipelineConfig {
    /// Concurrent calls processed by one worker pool
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Recordings shorter than this are discarded
    #[serde(default = "default_min_recording_secs")]
    pub min_recording_secs: u32,

    /// Transient failures tolerated per stage before the call is failed
    #[serde(default = "default_retries")]
    pub max_stage_attempts: u32,

    /// Attempts per acquisition strategy within one stage run
    #[serde(default = "default_retries")]
    pub download_attempts: u32,

    /// Resume sweep interval
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    /// A non-terminal call untouched for this long is considered stuck.
    /// Running stages refresh their row every third of this window.
    #[serde(default = "default_stale_after")]
    pub stale_after_secs: u64,

    /// Maximum calls re-enqueued by one sweep
    #[serde(default = "default_sweep_batch")]
    pub sweep_batch_size: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PollerConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Interval between poll cycles
    #[serde(default = "default_poll_interval")]
    pub interval_secs: u64,

    /// Watermark used on a tenant's first cycle (now minus this)
    #[serde(default = "default_initial_lookback")]
    pub initial_lookback_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RateLimitConfig {
    /// Requests per second
    #[serde(default = "default_rate_limit")]
    pub requests_per_second: u32,

    /// Burst capacity
    #[serde(default = "default_burst")]
    pub burst: u32,

    /// Enable rate limiting
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ObservabilityConfig {
    /// Log level (debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Enable JSON logging
    #[serde(default = "default_enabled")]
    pub json_logging: bool,

    /// Metrics port (0 to disable)
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,

    /// Service name for logs
    #[serde(default = "default_service_name")]
    pub service_name: String,
}

// Default value functions
fn default_host() -> String { "0.0.0.0".to_string() }
fn default_port() -> u16 { 8080 }
fn default_request_timeout() -> u64 { 30 }
fn default_shutdown_timeout() -> u64 { 30 }
fn default_max_connections() -> u32 { 20 }
fn default_min_connections() -> u32 { 2 }
fn default_connect_timeout() -> u64 { 10 }
fn default_idle_timeout() -> u64 { 300 }
fn default_pbx_api_path() -> String { "/api".to_string() }
fn default_pbx_api_version() -> String { "1.0".to_string() }
fn default_pbx_request_timeout() -> u64 { 30 }
fn default_pbx_download_timeout() -> u64 { 120 }
fn default_pbx_session_ttl() -> u64 { 1800 }
fn default_recording_dir() -> String { "monitor".to_string() }
fn default_leg_rule() -> String { "recording".to_string() }
fn default_storage_backend() -> String { "local".to_string() }
fn default_storage_path() -> String { "storage".to_string() }
fn default_signed_url_ttl() -> u64 { 3600 }
fn default_proprietary_encoding() -> String { "mulaw".to_string() }
fn default_sample_rate() -> u32 { 8000 }
fn default_riff_scan_limit() -> usize { 4096 }
fn default_ffmpeg_path() -> String { "ffmpeg".to_string() }
fn default_ffprobe_path() -> String { "ffprobe".to_string() }
fn default_delivery_bitrate() -> String { "32k".to_string() }
fn default_transcode_timeout() -> u64 { 120 }
fn default_openai_provider() -> String { "openai".to_string() }
fn default_stt_model() -> String { "whisper-1".to_string() }
fn default_stt_timeout() -> u64 { 300 }
fn default_llm_model() -> String { "gpt-4o-mini".to_string() }
fn default_llm_timeout() -> u64 { 60 }
fn default_temperature() -> f32 { 0.2 }
fn default_prompt_price() -> f64 { 0.00015 }
fn default_completion_price() -> f64 { 0.0006 }
fn default_retries() -> u32 { 3 }
fn default_queue_backend() -> String { "memory".to_string() }
fn default_queue_batch_size() -> u32 { 10 }
fn default_queue_poll_timeout() -> u64 { 20 }
fn default_visibility_timeout() -> u64 { 900 }
fn default_workers() -> usize { 4 }
fn default_min_recording_secs() -> u32 { 30 }
fn default_sweep_interval() -> u64 { 300 }
fn default_stale_after() -> u64 { 600 }
fn default_sweep_batch() -> u64 { 200 }
fn default_poll_interval() -> u64 { 120 }
fn default_initial_lookback() -> u64 { 7200 }
fn default_rate_limit() -> u32 { 50 }
fn default_burst() -> u32 { 100 }
fn default_log_level() -> String { "info".to_string() }
fn default_metrics_port() -> u16 { 9090 }
fn default_service_name() -> String { "callscope".to_string() }
fn default_enabled() -> bool { true }

impl AppConfig {
    /// Load configuration from environment and files
    pub fn load() -> Result<Self, ConfigError> {
        let env = std::env::var("APP_ENV").unwrap_or_else(|_| "development".to_string());

        let config = Config::builder()
            // Start with defaults
            .set_default("server.host", "0.0.0.0")?
            .set_default("server.port", 8080)?

            // Load base config file
            .add_source(File::with_name("config/default").required(false))

            // Load environment-specific config
            .add_source(File::with_name(&format!("config/{}", env)).required(false))

            // Load local overrides
            .add_source(File::with_name("config/local").required(false))

            // Load from environment variables with APP__ prefix
            // e.g., APP__PIPELINE__WORKERS=8
            .add_source(
                Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true)
            )

            .build()?;

        config.try_deserialize()
    }

    /// Load from a specific config file
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let config = Config::builder()
            .add_source(File::with_name(path))
            .add_source(
                Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true)
            )
            .build()?;

        config.try_deserialize()
    }

    /// Get request timeout as Duration
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.server.request_timeout_secs)
    }

    /// Get shutdown timeout as Duration
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.server.shutdown_timeout_secs)
    }

    /// Get the read database URL (falls back to primary)
    pub fn read_database_url(&self) -> &str {
        self.database.read_url.as_deref().unwrap_or(&self.database.url)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            request_timeout_secs: default_request_timeout(),
            shutdown_timeout_secs: default_shutdown_timeout(),
            embedded_pipeline: default_enabled(),
        }
    }
}

impl Default for PbxConfig {
    fn default() -> Self {
        Self {
            api_path: default_pbx_api_path(),
            api_version: default_pbx_api_version(),
            request_timeout_secs: default_pbx_request_timeout(),
            download_timeout_secs: default_pbx_download_timeout(),
            session_ttl_secs: default_pbx_session_ttl(),
            accept_invalid_certs: default_enabled(),
            default_recording_dir: default_recording_dir(),
            leg_rule: default_leg_rule(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_storage_backend(),
            local_path: default_storage_path(),
            bucket: None,
            region: None,
            endpoint: None,
            access_key: None,
            secret_key: None,
            prefix: None,
            signed_url_ttl_secs: default_signed_url_ttl(),
        }
    }
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            proprietary_encoding: default_proprietary_encoding(),
            proprietary_header_len: 0,
            sample_rate: default_sample_rate(),
            riff_scan_limit: default_riff_scan_limit(),
            ffmpeg_path: default_ffmpeg_path(),
            ffprobe_path: default_ffprobe_path(),
            delivery_bitrate: default_delivery_bitrate(),
            transcode_timeout_secs: default_transcode_timeout(),
        }
    }
}

impl Default for SttConfig {
    fn default() -> Self {
        Self {
            provider: default_openai_provider(),
            api_key: None,
            api_base: None,
            model: default_stt_model(),
            timeout_secs: default_stt_timeout(),
            max_retries: default_retries(),
        }
    }
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: default_openai_provider(),
            api_key: None,
            api_base: None,
            model: default_llm_model(),
            timeout_secs: default_llm_timeout(),
            max_retries: default_retries(),
            temperature: default_temperature(),
            prompt_price_per_1k: default_prompt_price(),
            completion_price_per_1k: default_completion_price(),
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            backend: default_queue_backend(),
            pipeline_queue_url: None,
            batch_size: default_queue_batch_size(),
            poll_timeout_secs: default_queue_poll_timeout(),
            visibility_timeout_secs: default_visibility_timeout(),
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            min_recording_secs: default_min_recording_secs(),
            max_stage_attempts: default_retries(),
            download_attempts: default_retries(),
            sweep_interval_secs: default_sweep_interval(),
            stale_after_secs: default_stale_after(),
            sweep_batch_size: default_sweep_batch(),
        }
    }
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            interval_secs: default_poll_interval(),
            initial_lookback_secs: default_initial_lookback(),
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_second: default_rate_limit(),
            burst: default_burst(),
            enabled: default_enabled(),
        }
    }
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            json_logging: default_enabled(),
            metrics_port: default_metrics_port(),
            service_name: default_service_name(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            database: DatabaseConfig {
                url: "postgres://localhost/callscope".to_string(),
                read_url: None,
                max_connections: default_max_connections(),
                min_connections: default_min_connections(),
                connect_timeout_secs: default_connect_timeout(),
                idle_timeout_secs: default_idle_timeout(),
                run_migrations: default_enabled(),
            },
            pbx: PbxConfig::default(),
            storage: StorageConfig::default(),
            audio: AudioConfig::default(),
            stt: SttConfig::default(),
            llm: LlmConfig::default(),
            analysis: AnalysisConfig::default(),
            queue: QueueConfig::default(),
            pipeline: PipelineConfig::default(),
            poller: PollerConfig::default(),
            rate_limit: RateLimitConfig::default(),
            observability: ObservabilityConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.pipeline.min_recording_secs, 30);
        assert_eq!(config.poller.interval_secs, 120);
        assert_eq!(config.poller.initial_lookback_secs, 2 * 60 * 60);
        assert_eq!(config.pbx.session_ttl_secs, 30 * 60);
    }

    #[test]
    fn test_read_database_fallback() {
        let config = AppConfig::default();
        assert_eq!(config.read_database_url(), "postgres://localhost/callscope");
    }

    #[test]
    fn test_partial_sections_fill_defaults() {
        let config: AppConfig = Config::builder()
            .set_override("database.url", "sqlite::memory:")
            .unwrap()
            .set_override("pipeline.workers", 8)
            .unwrap()
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();

        assert_eq!(config.pipeline.workers, 8);
        assert_eq!(config.pipeline.max_stage_attempts, 3);
        assert_eq!(config.queue.backend, "memory");
        assert!(config.pbx.accept_invalid_certs);
    }
}
