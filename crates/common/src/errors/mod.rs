//! Error types for Callscope services
//!
//! Provides a comprehensive error handling system with:
//! - Distinct error types for different failure modes
//! - Retry classification (transient / authentication / permanent)
//! - HTTP status code mapping
//! - Structured error responses

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias using AppError
pub type Result<T> = std::result::Result<T, AppError>;

/// Error codes for machine-readable error identification
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Validation errors (1xxx)
    ValidationError,
    MissingField,
    InvalidFormat,

    // Authentication errors (2xxx)
    Unauthorized,
    InvalidCredentials,
    PbxAuthFailed,
    SessionExpired,

    // Resource errors (4xxx)
    NotFound,
    TenantNotFound,
    CallNotFound,
    RecordingNotFound,

    // Rate limiting (6xxx)
    RateLimited,
    QuotaExceeded,

    // Database errors (7xxx)
    DatabaseError,
    ConnectionError,

    // External service errors (8xxx)
    UpstreamError,
    PbxError,
    RecordingUnavailable,
    StorageError,
    TranscriptionError,
    LlmError,
    QueueError,

    // Internal errors (9xxx)
    InternalError,
    ConfigurationError,
    SerializationError,
    InvalidAudio,
    TranscodingError,
}

impl ErrorCode {
    /// Get the numeric code for this error
    pub fn as_code(&self) -> u16 {
        match self {
            // Validation (1xxx)
            ErrorCode::ValidationError => 1001,
            ErrorCode::MissingField => 1002,
            ErrorCode::InvalidFormat => 1003,

            // Auth (2xxx)
            ErrorCode::Unauthorized => 2001,
            ErrorCode::InvalidCredentials => 2002,
            ErrorCode::PbxAuthFailed => 2003,
            ErrorCode::SessionExpired => 2004,

            // Resources (4xxx)
            ErrorCode::NotFound => 4001,
            ErrorCode::TenantNotFound => 4002,
            ErrorCode::CallNotFound => 4003,
            ErrorCode::RecordingNotFound => 4004,

            // Rate limits (6xxx)
            ErrorCode::RateLimited => 6001,
            ErrorCode::QuotaExceeded => 6002,

            // Database (7xxx)
            ErrorCode::DatabaseError => 7001,
            ErrorCode::ConnectionError => 7002,

            // External (8xxx)
            ErrorCode::UpstreamError => 8001,
            ErrorCode::PbxError => 8002,
            ErrorCode::RecordingUnavailable => 8003,
            ErrorCode::StorageError => 8004,
            ErrorCode::TranscriptionError => 8005,
            ErrorCode::LlmError => 8006,
            ErrorCode::QueueError => 8008,

            // Internal (9xxx)
            ErrorCode::InternalError => 9001,
            ErrorCode::ConfigurationError => 9002,
            ErrorCode::SerializationError => 9003,
            ErrorCode::InvalidAudio => 9004,
            ErrorCode::TranscodingError => 9005,
        }
    }
}

/// How a failure should be treated by the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Timeouts, rate limits, temporary unavailability: retry with backoff
    Transient,
    /// Bad or expired PBX session: one re-authentication, then a stage failure
    Authentication,
    /// Malformed data, absent recordings, unreadable audio: terminal for the call
    Permanent,
}

/// Application error types
#[derive(Error, Debug)]
pub enum AppError {
    // Validation errors
    #[error("Validation failed: {message}")]
    Validation {
        message: String,
        field: Option<String>,
    },

    #[error("Required field missing: {field}")]
    MissingField { field: String },

    #[error("Invalid format: {message}")]
    InvalidFormat { message: String },

    // Authentication errors
    #[error("Unauthorized: {message}")]
    Unauthorized { message: String },

    #[error("Invalid webhook credentials")]
    InvalidCredentials,

    #[error("PBX authentication failed: {message}")]
    PbxAuth { message: String },

    #[error("PBX session expired")]
    SessionExpired,

    // Resource errors
    #[error("Resource not found: {resource_type} with id {id}")]
    NotFound { resource_type: String, id: String },

    #[error("Tenant not found: {subdomain}")]
    TenantNotFound { subdomain: String },

    #[error("Call not found: {uniqueid}")]
    CallNotFound { uniqueid: String },

    #[error("Stored object not found: {path}")]
    StorageNotFound { path: String },

    // Rate limiting
    #[error("Rate limit exceeded: {limit} requests per second")]
    RateLimited { limit: u32 },

    #[error("Monthly usage limit of {limit} calls reached")]
    QuotaExceeded { limit: i64 },

    // Database errors
    #[error("Database error: {0}")]
    Database(#[from] sea_orm::DbErr),

    #[error("Database connection error: {message}")]
    DatabaseConnection { message: String },

    // External service errors
    #[error("{service} unavailable: {message}")]
    Upstream { service: String, message: String },

    #[error("PBX returned status {status}: {message}")]
    Pbx { status: i64, message: String },

    #[error("Recording {reference} unavailable: {message}")]
    RecordingUnavailable { reference: String, message: String },

    #[error("Storage error: {message}")]
    Storage { message: String },

    #[error("Transcription failed: {message}")]
    Transcription { message: String, retryable: bool },

    #[error("LLM error: {message}")]
    Llm { message: String },

    #[error("Queue error: {message}")]
    QueueError { message: String },

    #[error("HTTP client error: {0}")]
    HttpClient(#[from] reqwest::Error),

    // Internal errors
    #[error("Invalid audio: {message}")]
    InvalidAudio { message: String },

    #[error("Transcoding failed: {message}")]
    Transcoding { message: String },

    #[error("Internal server error: {message}")]
    Internal { message: String },

    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // Generic
    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl AppError {
    /// Shorthand for a transient upstream failure
    pub fn upstream(service: impl Into<String>, message: impl Into<String>) -> Self {
        AppError::Upstream {
            service: service.into(),
            message: message.into(),
        }
    }

    /// Get the error code for this error
    pub fn code(&self) -> ErrorCode {
        match self {
            AppError::Validation { .. } => ErrorCode::ValidationError,
            AppError::MissingField { .. } => ErrorCode::MissingField,
            AppError::InvalidFormat { .. } => ErrorCode::InvalidFormat,
            AppError::Unauthorized { .. } => ErrorCode::Unauthorized,
            AppError::InvalidCredentials => ErrorCode::InvalidCredentials,
            AppError::PbxAuth { .. } => ErrorCode::PbxAuthFailed,
            AppError::SessionExpired => ErrorCode::SessionExpired,
            AppError::NotFound { .. } => ErrorCode::NotFound,
            AppError::TenantNotFound { .. } => ErrorCode::TenantNotFound,
            AppError::CallNotFound { .. } => ErrorCode::CallNotFound,
            AppError::StorageNotFound { .. } => ErrorCode::RecordingNotFound,
            AppError::RateLimited { .. } => ErrorCode::RateLimited,
            AppError::QuotaExceeded { .. } => ErrorCode::QuotaExceeded,
            AppError::Database(_) => ErrorCode::DatabaseError,
            AppError::DatabaseConnection { .. } => ErrorCode::ConnectionError,
            AppError::Upstream { .. } => ErrorCode::UpstreamError,
            AppError::Pbx { .. } => ErrorCode::PbxError,
            AppError::RecordingUnavailable { .. } => ErrorCode::RecordingUnavailable,
            AppError::Storage { .. } => ErrorCode::StorageError,
            AppError::Transcription { .. } => ErrorCode::TranscriptionError,
            AppError::Llm { .. } => ErrorCode::LlmError,
            AppError::QueueError { .. } => ErrorCode::QueueError,
            AppError::HttpClient(_) => ErrorCode::UpstreamError,
            AppError::InvalidAudio { .. } => ErrorCode::InvalidAudio,
            AppError::Transcoding { .. } => ErrorCode::TranscodingError,
            AppError::Internal { .. } => ErrorCode::InternalError,
            AppError::Configuration { .. } => ErrorCode::ConfigurationError,
            AppError::Serialization(_) => ErrorCode::SerializationError,
            AppError::Other(_) => ErrorCode::InternalError,
        }
    }

    /// Classify the failure for retry decisions
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            AppError::PbxAuth { .. }
            | AppError::SessionExpired
            | AppError::Unauthorized { .. }
            | AppError::InvalidCredentials => FailureKind::Authentication,

            AppError::Upstream { .. }
            | AppError::HttpClient(_)
            | AppError::Storage { .. }
            | AppError::Llm { .. }
            | AppError::QueueError { .. }
            | AppError::RateLimited { .. }
            | AppError::Database(_)
            | AppError::DatabaseConnection { .. } => FailureKind::Transient,

            AppError::Transcription { retryable: true, .. } => FailureKind::Transient,

            _ => FailureKind::Permanent,
        }
    }

    /// Whether a bounded retry with backoff may succeed
    pub fn is_retryable(&self) -> bool {
        self.failure_kind() == FailureKind::Transient
    }

    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            // 400 Bad Request
            AppError::Validation { .. } |
            AppError::MissingField { .. } |
            AppError::InvalidFormat { .. } => StatusCode::BAD_REQUEST,

            // 401 Unauthorized
            AppError::Unauthorized { .. } |
            AppError::InvalidCredentials => StatusCode::UNAUTHORIZED,

            // 404 Not Found
            AppError::NotFound { .. } |
            AppError::TenantNotFound { .. } |
            AppError::CallNotFound { .. } |
            AppError::StorageNotFound { .. } => StatusCode::NOT_FOUND,

            // 429 Too Many Requests
            AppError::RateLimited { .. } |
            AppError::QuotaExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,

            // 500 Internal Server Error
            AppError::Database(_) |
            AppError::DatabaseConnection { .. } |
            AppError::InvalidAudio { .. } |
            AppError::Transcoding { .. } |
            AppError::Internal { .. } |
            AppError::Configuration { .. } |
            AppError::Serialization(_) |
            AppError::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,

            // 502 Bad Gateway
            AppError::PbxAuth { .. } |
            AppError::SessionExpired |
            AppError::Pbx { .. } |
            AppError::Upstream { .. } |
            AppError::RecordingUnavailable { .. } |
            AppError::Transcription { .. } |
            AppError::Llm { .. } |
            AppError::HttpClient(_) => StatusCode::BAD_GATEWAY,

            // 503 Service Unavailable
            AppError::Storage { .. } |
            AppError::QueueError { .. } => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    /// Check if this error should be logged at error level
    pub fn is_server_error(&self) -> bool {
        self.status_code().is_server_error()
    }

    /// Check if this error is a client error
    pub fn is_client_error(&self) -> bool {
        self.status_code().is_client_error()
    }
}

/// Structured error response for API
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: ErrorDetails,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorDetails {
    pub code: ErrorCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let code = self.code();
        let message = self.to_string();

        // Log based on severity
        if self.is_server_error() {
            tracing::error!(
                error = %message,
                code = ?code,
                status = status.as_u16(),
                "Server error"
            );
        } else if self.is_client_error() {
            tracing::warn!(
                error = %message,
                code = ?code,
                status = status.as_u16(),
                "Client error"
            );
        }

        let mut response = (
            status,
            Json(ErrorResponse {
                error: ErrorDetails {
                    code,
                    message,
                    details: None,
                },
            }),
        )
            .into_response();

        if status == StatusCode::UNAUTHORIZED {
            response.headers_mut().insert(
                axum::http::header::WWW_AUTHENTICATE,
                axum::http::HeaderValue::from_static("Basic realm=\"callscope\""),
            );
        }

        response
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::Internal {
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_mapping() {
        let err = AppError::TenantNotFound { subdomain: "acme".into() };
        assert_eq!(err.code(), ErrorCode::TenantNotFound);
        assert_eq!(err.status_code(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_validation_error() {
        let err = AppError::Validation {
            message: "uniqueid is empty".into(),
            field: Some("uniqueid".into()),
        };
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
        assert!(!err.is_server_error());
        assert!(err.is_client_error());
        assert_eq!(err.failure_kind(), FailureKind::Permanent);
    }

    #[test]
    fn test_failure_classification() {
        assert!(AppError::upstream("pbx", "connection reset").is_retryable());
        assert!(AppError::Storage { message: "503".into() }.is_retryable());
        assert_eq!(AppError::SessionExpired.failure_kind(), FailureKind::Authentication);
        assert_eq!(
            AppError::PbxAuth { message: "bad token".into() }.failure_kind(),
            FailureKind::Authentication
        );
        assert!(!AppError::InvalidAudio { message: "empty".into() }.is_retryable());
        assert!(!AppError::RecordingUnavailable {
            reference: "monitor/a.wav".into(),
            message: "not found".into(),
        }
        .is_retryable());
        assert!(AppError::Transcription { message: "429".into(), retryable: true }.is_retryable());
        assert!(!AppError::Transcription { message: "bad file".into(), retryable: false }.is_retryable());
    }

    #[test]
    fn test_unavailable_dependencies_are_503_and_transient() {
        for err in [
            AppError::Storage { message: "bucket unreachable".into() },
            AppError::QueueError { message: "sqs throttled".into() },
        ] {
            assert_eq!(err.status_code(), StatusCode::SERVICE_UNAVAILABLE);
            assert_eq!(err.failure_kind(), FailureKind::Transient);
        }
        assert_eq!(ErrorCode::QueueError.as_code(), 8008);
    }

    #[test]
    fn test_server_error() {
        let err = AppError::Internal {
            message: "Something went wrong".into(),
        };
        assert_eq!(err.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(err.is_server_error());
    }

    #[test]
    fn test_unauthorized_sets_challenge_header() {
        let response = AppError::InvalidCredentials.into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(response.headers().contains_key(axum::http::header::WWW_AUTHENTICATE));
    }
}
