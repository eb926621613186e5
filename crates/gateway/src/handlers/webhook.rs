//! PBX CDR webhook

use axum::{body::Bytes, extract::State, Json};
use callscope_common::errors::{AppError, Result};
use callscope_pipeline::IngestStatus;
use serde::Serialize;
use serde_json::Value;
use tracing::{instrument, warn};
use uuid::Uuid;

use super::TenantAuth;
use crate::AppState;

#[derive(Debug, Serialize)]
pub struct WebhookResponse {
    pub status: &'static str,
    pub message: String,
    pub cdr_id: Uuid,
}

/// Accept one CDR pushed by the PBX
///
/// Redeliveries answer 200 with status `duplicate` so the PBX stops
/// retrying. An enqueue failure is logged and still acknowledged: the
/// row is stored in RECEIVED and the resume sweep picks it up.
#[instrument(skip(state, auth, body), fields(tenant = %auth.tenant.subdomain))]
pub async fn receive_cdr(
    State(state): State<AppState>,
    auth: TenantAuth,
    body: Bytes,
) -> Result<Json<WebhookResponse>> {
    let raw: Value = serde_json::from_slice(&body).map_err(|e| AppError::InvalidFormat {
        message: format!("CDR body is not valid JSON: {}", e),
    })?;

    let outcome = state.ingestor.ingest(&auth.tenant, raw, "webhook").await?;

    if outcome.needs_processing {
        if let Err(e) = state.ingestor.enqueue(&outcome.cdr).await {
            warn!(
                cdr_id = %outcome.cdr.id,
                error = %e,
                "Enqueue failed, leaving call for the resume sweep"
            );
        }
    }

    let message = match outcome.status {
        IngestStatus::Created => format!("CDR {} accepted", outcome.cdr.uniqueid),
        IngestStatus::Duplicate => format!("CDR {} already received", outcome.cdr.uniqueid),
        IngestStatus::QuotaExceeded => format!(
            "CDR {} stored; monthly limit of {} calls reached",
            outcome.cdr.uniqueid, auth.tenant.monthly_limit
        ),
    };

    Ok(Json(WebhookResponse {
        status: outcome.status.as_str(),
        message,
        cdr_id: outcome.cdr.id,
    }))
}
