//! API handlers module

pub mod calls;
pub mod health;
pub mod webhook;

use std::collections::HashMap;

use axum::extract::{FromRequestParts, Path};
use axum::http::request::Parts;
use callscope_common::auth::{verify_webhook_credentials, BasicCredentials};
use callscope_common::db::models::Tenant;
use callscope_common::errors::{AppError, Result};
use serde::Deserialize;
use validator::Validate;

use crate::AppState;

#[derive(Debug, Deserialize, Validate)]
struct TenantPath {
    #[validate(length(min = 1, max = 63))]
    subdomain: String,
}

/// Tenant resolved from the `{subdomain}` path segment and verified
/// against the request's Basic credentials
#[derive(Debug, Clone)]
pub struct TenantAuth {
    pub tenant: Tenant,
}

impl FromRequestParts<AppState> for TenantAuth {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self> {
        let Path(params) = Path::<HashMap<String, String>>::from_request_parts(parts, state)
            .await
            .map_err(|e| AppError::Validation {
                message: e.to_string(),
                field: Some("path".to_string()),
            })?;

        let path = TenantPath {
            subdomain: params.get("subdomain").cloned().unwrap_or_default(),
        };
        path.validate().map_err(|e| AppError::Validation {
            message: e.to_string(),
            field: Some("subdomain".to_string()),
        })?;

        let tenant = state
            .repo
            .find_tenant_by_subdomain(&path.subdomain)
            .await?
            .filter(|t| t.is_active)
            .ok_or_else(|| AppError::TenantNotFound {
                subdomain: path.subdomain.clone(),
            })?;

        let credentials = BasicCredentials::from_headers(&parts.headers).ok_or_else(|| {
            AppError::Unauthorized {
                message: "Missing Basic credentials".to_string(),
            }
        })?;

        // Argon2 verification blocks; run it off the async workers
        let username = tenant.webhook_username.clone();
        let hash = tenant.webhook_password_hash.clone();
        let valid = tokio::task::spawn_blocking(move || {
            verify_webhook_credentials(&credentials, &username, &hash)
        })
        .await
        .map_err(|e| AppError::Internal {
            message: format!("credential check failed: {}", e),
        })?;

        if !valid {
            tracing::warn!(tenant = %tenant.subdomain, "Rejected webhook credentials");
            return Err(AppError::InvalidCredentials);
        }

        Ok(Self { tenant })
    }
}
