//! Callscope Common Library
//!
//! Shared code for the Callscope services including:
//! - Database entities, migrations and repository patterns
//! - Error types and handling
//! - Configuration management
//! - Pipeline job queue (in-process and SQS)
//! - Object storage for recordings
//! - Webhook authentication utilities
//! - Metrics and observability

pub mod auth;
pub mod config;
pub mod db;
pub mod errors;
pub mod metrics;
pub mod queue;
pub mod storage;
pub mod telemetry;

// Re-export commonly used types
pub use config::AppConfig;
pub use db::Repository;
pub use errors::{AppError, Result};
pub use queue::{JobQueue, PipelineJob};
pub use storage::BlobStore;

/// Application version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
