//! Authentication utilities
//!
//! Provides:
//! - HTTP Basic credential parsing for PBX webhooks
//! - Argon2 hashing of per-tenant webhook passwords
//! - Webhook credential generation

use crate::errors::{AppError, Result};
use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use axum::http::{header::AUTHORIZATION, HeaderMap};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use sha2::{Digest, Sha256};

/// Username and password from an `Authorization: Basic` header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BasicCredentials {
    pub username: String,
    pub password: String,
}

impl BasicCredentials {
    /// Parse the Authorization header, if present and well-formed
    pub fn from_headers(headers: &HeaderMap) -> Option<Self> {
        let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
        Self::parse(value)
    }

    /// Parse a `Basic <base64(user:pass)>` header value
    pub fn parse(header: &str) -> Option<Self> {
        let (scheme, encoded) = header.trim().split_once(' ')?;
        if !scheme.eq_ignore_ascii_case("basic") {
            return None;
        }

        let decoded = STANDARD.decode(encoded.trim()).ok()?;
        let decoded = String::from_utf8(decoded).ok()?;
        let (username, password) = decoded.split_once(':')?;

        Some(Self {
            username: username.to_string(),
            password: password.to_string(),
        })
    }

    /// Encode as an Authorization header value
    pub fn to_header_value(&self) -> String {
        format!(
            "Basic {}",
            STANDARD.encode(format!("{}:{}", self.username, self.password))
        )
    }
}

/// Hash a webhook password for storage
pub fn hash_password(password: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| AppError::Internal {
            message: format!("Failed to hash password: {}", e),
        })
}

/// Check a password against a stored Argon2 hash
pub fn verify_password(password: &str, stored_hash: &str) -> bool {
    match PasswordHash::new(stored_hash) {
        Ok(parsed) => Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok(),
        Err(_) => false,
    }
}

/// Check webhook credentials against a tenant's stored username and hash
pub fn verify_webhook_credentials(
    credentials: &BasicCredentials,
    expected_username: &str,
    stored_hash: &str,
) -> bool {
    // Always run the hash check so a wrong username costs the same as a wrong password
    let password_ok = verify_password(&credentials.password, stored_hash);
    credentials.username == expected_username && password_ok
}

/// Generate a random webhook password
pub fn generate_webhook_password() -> String {
    let random_bytes: [u8; 24] = rand::random();
    format!("whk_{}", hex::encode(random_bytes))
}

/// Content hash used for recording integrity checks
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}
