//! Call detail queries

use axum::{
    extract::{Path, State},
    Json,
};
use callscope_common::db::models::{CdrRecord, RecordingStatus, Transcription};
use callscope_common::db::FeatureRows;
use callscope_common::errors::{AppError, Result};
use chrono::{DateTime, FixedOffset};
use serde::Serialize;
use tracing::{instrument, warn};
use uuid::Uuid;

use super::TenantAuth;
use crate::AppState;

#[derive(Debug, Serialize)]
pub struct CallResponse {
    pub call: CallView,
    pub recording: RecordingView,
    pub transcript: Option<TranscriptView>,
    pub features: FeatureRows,
}

#[derive(Debug, Serialize)]
pub struct CallView {
    pub id: Uuid,
    pub uniqueid: String,
    pub source: String,
    pub src: Option<String>,
    pub dst: Option<String>,
    pub caller_name: Option<String>,
    pub start_time: Option<DateTime<FixedOffset>>,
    pub answer_time: Option<DateTime<FixedOffset>>,
    pub end_time: Option<DateTime<FixedOffset>>,
    pub duration: i32,
    pub billsec: i32,
    pub disposition: String,
    pub pipeline_state: String,
    pub quota_exceeded: bool,
    pub last_error: Option<String>,
    pub created_at: DateTime<FixedOffset>,
}

impl From<&CdrRecord> for CallView {
    fn from(cdr: &CdrRecord) -> Self {
        Self {
            id: cdr.id,
            uniqueid: cdr.uniqueid.clone(),
            source: cdr.source.clone(),
            src: cdr.src.clone(),
            dst: cdr.dst.clone(),
            caller_name: cdr.caller_name.clone(),
            start_time: cdr.start_time,
            answer_time: cdr.answer_time,
            end_time: cdr.end_time,
            duration: cdr.duration,
            billsec: cdr.billsec,
            disposition: cdr.disposition.clone(),
            pipeline_state: cdr.pipeline_state.clone(),
            quota_exceeded: cdr.quota_exceeded,
            last_error: cdr.last_error.clone(),
            created_at: cdr.created_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct RecordingView {
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signed_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct TranscriptView {
    pub text: String,
    pub language: Option<String>,
    pub duration_seconds: i32,
    pub provider: String,
}

impl From<Transcription> for TranscriptView {
    fn from(t: Transcription) -> Self {
        Self {
            text: t.text,
            language: t.language,
            duration_seconds: t.duration_seconds,
            provider: t.provider,
        }
    }
}

/// Everything stored for one call of the authenticated tenant
#[instrument(skip(state, auth), fields(tenant = %auth.tenant.subdomain))]
pub async fn get_call(
    State(state): State<AppState>,
    auth: TenantAuth,
    Path((_subdomain, uniqueid)): Path<(String, String)>,
) -> Result<Json<CallResponse>> {
    let detail = state
        .repo
        .get_call_detail(auth.tenant.id, &uniqueid)
        .await?
        .ok_or_else(|| AppError::CallNotFound {
            uniqueid: uniqueid.clone(),
        })?;

    let recording = match detail.cdr.recording_status() {
        RecordingStatus::Downloaded(key) => {
            // The call data is still useful without a link
            let signed_url = match state.storage.signed_url(&key).await {
                Ok(url) => url,
                Err(e) => {
                    warn!(cdr_id = %detail.cdr.id, error = %e, "Failed to sign recording URL");
                    None
                }
            };
            RecordingView {
                status: "downloaded",
                signed_url,
                size_bytes: detail.cdr.recording_size_bytes,
                sha256: detail.cdr.recording_sha256.clone(),
            }
        }
        other => RecordingView {
            status: match other {
                RecordingStatus::Discarded => "discarded",
                RecordingStatus::Failed => "failed",
                _ => "not_attempted",
            },
            signed_url: None,
            size_bytes: None,
            sha256: None,
        },
    };

    Ok(Json(CallResponse {
        call: CallView::from(&detail.cdr),
        recording,
        transcript: detail.transcription.map(TranscriptView::from),
        features: detail.features,
    }))
}
