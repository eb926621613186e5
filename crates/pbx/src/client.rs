//! UCM JSON API client
//!
//! Every call is a POST of `{"request": {"action": ..}}` to the PBX API path.
//! Responses carry a numeric `status` (0 on success) next to the `response`
//! object. Recording downloads answer with the raw file body instead.

use async_trait::async_trait;
use bytes::Bytes;
use callscope_common::config::PbxConfig;
use callscope_common::db::models::Tenant;
use callscope_common::errors::{AppError, Result};
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

/// PBX status code for an expired or unknown session cookie
pub const STATUS_SESSION_EXPIRED: i64 = -6;

/// Timestamp format used by the CDR API filters and records
pub const PBX_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Connection details for one tenant's PBX
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PbxEndpoint {
    pub tenant_id: Uuid,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
}

impl PbxEndpoint {
    /// Build from a tenant row; `None` when the connection settings are incomplete
    pub fn from_tenant(tenant: &Tenant) -> Option<Self> {
        if !tenant.has_pbx_connection() {
            return None;
        }

        Some(Self {
            tenant_id: tenant.id,
            host: tenant.pbx_host.clone()?,
            port: u16::try_from(tenant.pbx_port).unwrap_or(8089),
            username: tenant.pbx_username.clone()?,
            password: tenant.pbx_password.clone()?,
        })
    }

    /// Base URL of the API for this endpoint
    pub fn api_url(&self, api_path: &str) -> String {
        let host = self
            .host
            .trim_start_matches("https://")
            .trim_start_matches("http://")
            .trim_end_matches('/');
        format!("https://{}:{}{}", host, self.port, api_path)
    }
}

/// Raw operations of the UCM API
///
/// Implementations are stateless; session reuse lives in `SessionManager`.
#[async_trait]
pub trait PbxApi: Send + Sync {
    /// Step one of the login handshake: obtain a challenge string
    async fn challenge(&self, endpoint: &PbxEndpoint) -> Result<String>;

    /// Step two: exchange `md5(challenge + password)` for a session cookie
    async fn login(&self, endpoint: &PbxEndpoint, token: &str) -> Result<String>;

    /// CDRs that started within `[start, end)`; returns the raw `cdr_root` value
    async fn fetch_cdrs(
        &self,
        endpoint: &PbxEndpoint,
        cookie: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Value>;

    /// Binary content of one recording file
    async fn download_recording(
        &self,
        endpoint: &PbxEndpoint,
        cookie: &str,
        dir: &str,
        filename: &str,
    ) -> Result<Bytes>;
}

/// Login token for a challenge
pub fn challenge_token(challenge: &str, password: &str) -> String {
    format!("{:x}", md5::compute(format!("{}{}", challenge, password)))
}

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    status: Option<i64>,
    #[serde(default)]
    response: Value,
}

impl Envelope {
    fn status(&self) -> i64 {
        self.status.unwrap_or(0)
    }
}

/// reqwest-backed UCM client
pub struct UcmClient {
    client: reqwest::Client,
    download_timeout: Duration,
    api_path: String,
    api_version: String,
}

impl UcmClient {
    /// Create a client from PBX settings
    pub fn new(config: &PbxConfig) -> Result<Self> {
        // UCM appliances ship self-signed certificates
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(config.accept_invalid_certs)
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;

        Ok(Self {
            client,
            download_timeout: Duration::from_secs(config.download_timeout_secs),
            api_path: config.api_path.clone(),
            api_version: config.api_version.clone(),
        })
    }

    async fn post(&self, endpoint: &PbxEndpoint, body: Value, timeout: Option<Duration>) -> Result<reqwest::Response> {
        let url = endpoint.api_url(&self.api_path);
        let mut request = self.client.post(&url).json(&body);
        if let Some(timeout) = timeout {
            request = request.timeout(timeout);
        }

        let response = request
            .send()
            .await
            .map_err(|e| AppError::upstream("pbx", format!("{} unreachable: {}", endpoint.host, e)))?;

        match response.status() {
            StatusCode::UNAUTHORIZED => Err(AppError::SessionExpired),
            status if status.is_server_error() => Err(AppError::upstream(
                "pbx",
                format!("{} returned HTTP {}", endpoint.host, status),
            )),
            _ => Ok(response),
        }
    }

    async fn call(&self, endpoint: &PbxEndpoint, body: Value) -> Result<Envelope> {
        let response = self.post(endpoint, body, None).await?;
        let http_status = response.status();

        let envelope: Envelope = response.json().await.map_err(|e| AppError::Pbx {
            status: i64::from(http_status.as_u16()),
            message: format!("malformed response: {}", e),
        })?;

        match envelope.status() {
            0 => Ok(envelope),
            STATUS_SESSION_EXPIRED => Err(AppError::SessionExpired),
            status => Err(AppError::Pbx {
                status,
                message: envelope_message(&envelope),
            }),
        }
    }
}

fn envelope_message(envelope: &Envelope) -> String {
    envelope
        .response
        .get("message")
        .and_then(Value::as_str)
        .map(String::from)
        .unwrap_or_else(|| format!("status {}", envelope.status()))
}

#[async_trait]
impl PbxApi for UcmClient {
    async fn challenge(&self, endpoint: &PbxEndpoint) -> Result<String> {
        let body = json!({
            "request": {
                "action": "challenge",
                "user": endpoint.username,
                "version": self.api_version,
            }
        });

        let envelope = self.call(endpoint, body).await.map_err(|e| match e {
            AppError::Pbx { status, message } => AppError::PbxAuth {
                message: format!("challenge rejected ({}): {}", status, message),
            },
            other => other,
        })?;

        envelope
            .response
            .get("challenge")
            .and_then(Value::as_str)
            .filter(|c| !c.is_empty())
            .map(String::from)
            .ok_or_else(|| AppError::PbxAuth {
                message: "challenge response carried no challenge".into(),
            })
    }

    async fn login(&self, endpoint: &PbxEndpoint, token: &str) -> Result<String> {
        let body = json!({
            "request": {
                "action": "login",
                "user": endpoint.username,
                "token": token,
            }
        });

        let envelope = self.call(endpoint, body).await.map_err(|e| match e {
            AppError::Pbx { status, message } => AppError::PbxAuth {
                message: format!("login rejected ({}): {}", status, message),
            },
            AppError::SessionExpired => AppError::PbxAuth {
                message: "login rejected".into(),
            },
            other => other,
        })?;

        envelope
            .response
            .get("cookie")
            .and_then(Value::as_str)
            .filter(|c| !c.is_empty())
            .map(String::from)
            .ok_or_else(|| AppError::PbxAuth {
                message: "login response carried no cookie".into(),
            })
    }

    async fn fetch_cdrs(
        &self,
        endpoint: &PbxEndpoint,
        cookie: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Value> {
        let body = json!({
            "request": {
                "action": "cdrapi",
                "cookie": cookie,
                "format": "json",
                "startTime": start.format(PBX_TIME_FORMAT).to_string(),
                "endTime": end.format(PBX_TIME_FORMAT).to_string(),
            }
        });

        let envelope = self.call(endpoint, body).await?;
        let root = envelope
            .response
            .get("cdr_root")
            .cloned()
            .or_else(|| envelope.response.as_array().map(|a| Value::Array(a.clone())))
            .unwrap_or(Value::Array(Vec::new()));

        debug!(
            tenant_id = %endpoint.tenant_id,
            records = root.as_array().map(Vec::len).unwrap_or(0),
            "Fetched CDR page"
        );

        Ok(root)
    }

    async fn download_recording(
        &self,
        endpoint: &PbxEndpoint,
        cookie: &str,
        dir: &str,
        filename: &str,
    ) -> Result<Bytes> {
        let body = json!({
            "request": {
                "action": "recapi",
                "cookie": cookie,
                "filedir": dir,
                "filename": filename,
            }
        });

        let response = self.post(endpoint, body, Some(self.download_timeout)).await?;
        let http_status = response.status();
        let is_json = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.contains("json"));

        if http_status == StatusCode::NOT_FOUND {
            return Err(AppError::RecordingUnavailable {
                reference: format!("{}/{}", dir, filename),
                message: "PBX returned 404".into(),
            });
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| AppError::upstream("pbx", format!("download interrupted: {}", e)))?;

        // Failures come back as a JSON envelope instead of audio
        if is_json || bytes.first() == Some(&b'{') {
            if let Ok(envelope) = serde_json::from_slice::<Envelope>(&bytes) {
                return match envelope.status() {
                    STATUS_SESSION_EXPIRED => Err(AppError::SessionExpired),
                    _ => Err(AppError::RecordingUnavailable {
                        reference: format!("{}/{}", dir, filename),
                        message: envelope_message(&envelope),
                    }),
                };
            }
        }

        if bytes.is_empty() {
            return Err(AppError::RecordingUnavailable {
                reference: format!("{}/{}", dir, filename),
                message: "empty body".into(),
            });
        }

        Ok(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_challenge_token_is_lowercase_md5() {
        // md5("abc" + "") is the classic test vector for "abc"
        assert_eq!(challenge_token("abc", ""), "900150983cd24fb0d6963f7d28e17f72");
        assert_eq!(challenge_token("ab", "c"), challenge_token("a", "bc"));
        assert_eq!(challenge_token("x", "y").len(), 32);
    }

    #[test]
    fn test_api_url() {
        let endpoint = PbxEndpoint {
            tenant_id: Uuid::nil(),
            host: "https://pbx.example.com/".into(),
            port: 8089,
            username: "cdrapi".into(),
            password: "pw".into(),
        };
        assert_eq!(endpoint.api_url("/api"), "https://pbx.example.com:8089/api");
    }

    #[test]
    fn test_envelope_status_defaults_to_success() {
        let envelope: Envelope =
            serde_json::from_str(r#"{"response":{"challenge":"0000001"}}"#).unwrap();
        assert_eq!(envelope.status(), 0);

        let envelope: Envelope =
            serde_json::from_str(r#"{"response":{"message":"bad"},"status":-37}"#).unwrap();
        assert_eq!(envelope.status(), -37);
        assert_eq!(envelope_message(&envelope), "bad");
    }
}
