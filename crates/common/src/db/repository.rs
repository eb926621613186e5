//! Repository pattern for database operations
//!
//! Provides a clean interface for all data access operations
//! with proper error handling. Writes that must be idempotent
//! go through unique keys with `ON CONFLICT DO NOTHING`.

use crate::db::models::*;
use crate::db::DbPool;
use crate::errors::Result;
use chrono::{DateTime, Utc};
use sea_orm::sea_query::{Expr, OnConflict};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, IntoActiveModel,
    PaginatorTrait, QueryFilter, QueryOrder, QuerySelect, Set,
};
use serde::Serialize;
use uuid::Uuid;

/// Fields needed to provision a tenant
#[derive(Debug, Clone)]
pub struct NewTenant {
    pub subdomain: String,
    pub name: String,
    pub pbx_host: Option<String>,
    pub pbx_port: i32,
    pub pbx_username: Option<String>,
    pub pbx_password: Option<String>,
    pub pbx_enabled: bool,
    pub webhook_username: String,
    pub webhook_password_hash: String,
    pub enabled_features: Vec<String>,
    pub monthly_limit: i64,
}

/// A CDR as parsed from a webhook body or a poll response
#[derive(Debug, Clone)]
pub struct NewCdr {
    pub tenant_id: Uuid,
    pub uniqueid: String,
    pub source: String,
    pub src: Option<String>,
    pub dst: Option<String>,
    pub caller_name: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub answer_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub duration: i32,
    pub billsec: i32,
    pub disposition: Disposition,
    pub recordfiles: Option<String>,
    pub quota_exceeded: bool,
    pub raw_payload: Option<serde_json::Value>,
}

/// Result of an idempotent CDR insert
#[derive(Debug, Clone)]
pub enum InsertOutcome {
    Inserted(CdrRecord),
    /// A row with the same (tenant_id, uniqueid) already existed; it was not touched
    Duplicate(CdrRecord),
}

impl InsertOutcome {
    pub fn record(&self) -> &CdrRecord {
        match self {
            InsertOutcome::Inserted(r) | InsertOutcome::Duplicate(r) => r,
        }
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, InsertOutcome::Duplicate(_))
    }
}

/// Stored analysis results for one call
#[derive(Debug, Clone, Default, Serialize)]
pub struct FeatureRows {
    #[serde(rename = "sentiment_analysis")]
    pub sentiment: Option<SentimentRow>,
    #[serde(rename = "quality_scoring")]
    pub quality_score: Option<QualityScoreRow>,
    pub churn_prediction: Option<ChurnRow>,
    pub call_summary: Option<CallSummaryRow>,
}

impl FeatureRows {
    pub fn count(&self) -> usize {
        [
            self.sentiment.is_some(),
            self.quality_score.is_some(),
            self.churn_prediction.is_some(),
            self.call_summary.is_some(),
        ]
        .iter()
        .filter(|present| **present)
        .count()
    }
}

/// Everything known about one call
#[derive(Debug, Clone, Serialize)]
pub struct CallDetail {
    pub cdr: CdrRecord,
    pub transcription: Option<Transcription>,
    pub features: FeatureRows,
}

/// Repository for data access operations
#[derive(Clone)]
pub struct Repository {
    pool: DbPool,
}

impl Repository {
    /// Create a new repository with the given connection pool
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Get the read connection
    fn read_conn(&self) -> &DatabaseConnection {
        self.pool.read()
    }

    /// Get the write connection
    fn write_conn(&self) -> &DatabaseConnection {
        self.pool.write()
    }

    // ========================================================================
    // Health Check
    // ========================================================================

    /// Ping the database
    pub async fn ping(&self) -> Result<()> {
        self.pool.ping().await
    }

    // ========================================================================
    // Tenant Operations
    // ========================================================================

    /// Provision a tenant
    pub async fn create_tenant(&self, tenant: NewTenant) -> Result<Tenant> {
        let now = Utc::now();

        let model = TenantActiveModel {
            id: Set(Uuid::new_v4()),
            subdomain: Set(tenant.subdomain),
            name: Set(tenant.name),
            is_active: Set(true),
            pbx_host: Set(tenant.pbx_host),
            pbx_port: Set(tenant.pbx_port),
            pbx_username: Set(tenant.pbx_username),
            pbx_password: Set(tenant.pbx_password),
            pbx_enabled: Set(tenant.pbx_enabled),
            webhook_username: Set(tenant.webhook_username),
            webhook_password_hash: Set(tenant.webhook_password_hash),
            enabled_features: Set(serde_json::json!(tenant.enabled_features)),
            usage_this_month: Set(0),
            monthly_limit: Set(tenant.monthly_limit),
            usage_period: Set(usage_period(now)),
            created_at: Set(now.into()),
            updated_at: Set(now.into()),
        };

        model.insert(self.write_conn()).await.map_err(Into::into)
    }

    /// Find tenant by ID
    pub async fn find_tenant_by_id(&self, id: Uuid) -> Result<Option<Tenant>> {
        TenantEntity::find_by_id(id)
            .one(self.read_conn())
            .await
            .map_err(Into::into)
    }

    /// Find an active tenant by subdomain
    pub async fn find_tenant_by_subdomain(&self, subdomain: &str) -> Result<Option<Tenant>> {
        TenantEntity::find()
            .filter(TenantColumn::Subdomain.eq(subdomain.to_ascii_lowercase()))
            .filter(TenantColumn::IsActive.eq(true))
            .one(self.read_conn())
            .await
            .map_err(Into::into)
    }

    /// Active tenants that opted into PBX polling
    pub async fn list_pollable_tenants(&self) -> Result<Vec<Tenant>> {
        let tenants = TenantEntity::find()
            .filter(TenantColumn::IsActive.eq(true))
            .filter(TenantColumn::PbxEnabled.eq(true))
            .order_by_asc(TenantColumn::Subdomain)
            .all(self.read_conn())
            .await?;

        Ok(tenants.into_iter().filter(|t| t.has_pbx_connection()).collect())
    }

    /// Take one unit of monthly usage.
    ///
    /// Returns false when the tenant is at its limit. The counter rolls over
    /// when `period` differs from the stored one. The check and the increment
    /// are one conditional UPDATE so concurrent deliveries cannot overshoot.
    pub async fn reserve_usage(&self, tenant_id: Uuid, period: &str) -> Result<bool> {
        TenantEntity::update_many()
            .col_expr(TenantColumn::UsageThisMonth, Expr::value(0i64))
            .col_expr(TenantColumn::UsagePeriod, Expr::value(period))
            .filter(TenantColumn::Id.eq(tenant_id))
            .filter(TenantColumn::UsagePeriod.ne(period))
            .exec(self.write_conn())
            .await?;

        let result = TenantEntity::update_many()
            .col_expr(
                TenantColumn::UsageThisMonth,
                Expr::col(TenantColumn::UsageThisMonth).add(1),
            )
            .filter(TenantColumn::Id.eq(tenant_id))
            .filter(Expr::col(TenantColumn::UsageThisMonth).lt(Expr::col(TenantColumn::MonthlyLimit)))
            .exec(self.write_conn())
            .await?;

        Ok(result.rows_affected == 1)
    }

    /// Give back a unit taken by `reserve_usage`
    pub async fn release_usage(&self, tenant_id: Uuid) -> Result<()> {
        TenantEntity::update_many()
            .col_expr(
                TenantColumn::UsageThisMonth,
                Expr::col(TenantColumn::UsageThisMonth).sub(1),
            )
            .filter(TenantColumn::Id.eq(tenant_id))
            .filter(TenantColumn::UsageThisMonth.gt(0))
            .exec(self.write_conn())
            .await?;

        Ok(())
    }

    // ========================================================================
    // CDR Operations
    // ========================================================================

    /// Insert a CDR unless (tenant_id, uniqueid) already exists
    pub async fn insert_cdr(&self, cdr: NewCdr) -> Result<InsertOutcome> {
        let now = Utc::now();
        let tenant_id = cdr.tenant_id;
        let uniqueid = cdr.uniqueid.clone();

        let model = CdrActiveModel {
            id: Set(Uuid::new_v4()),
            tenant_id: Set(cdr.tenant_id),
            uniqueid: Set(cdr.uniqueid),
            source: Set(cdr.source),
            src: Set(cdr.src),
            dst: Set(cdr.dst),
            caller_name: Set(cdr.caller_name),
            start_time: Set(cdr.start_time.map(Into::into)),
            answer_time: Set(cdr.answer_time.map(Into::into)),
            end_time: Set(cdr.end_time.map(Into::into)),
            duration: Set(cdr.duration),
            billsec: Set(cdr.billsec),
            disposition: Set(cdr.disposition.as_str().to_string()),
            recordfiles: Set(cdr.recordfiles),
            recording_downloaded: Set(false),
            recording_local_path: Set(None),
            recording_size_bytes: Set(None),
            recording_sha256: Set(None),
            pipeline_state: Set(PipelineState::Received.into()),
            stage_attempts: Set(0),
            last_error: Set(None),
            quota_exceeded: Set(cdr.quota_exceeded),
            raw_payload: Set(cdr.raw_payload),
            created_at: Set(now.into()),
            updated_at: Set(now.into()),
        };

        let inserted = CdrEntity::insert(model)
            .on_conflict(
                OnConflict::columns([CdrColumn::TenantId, CdrColumn::Uniqueid])
                    .do_nothing()
                    .to_owned(),
            )
            .exec_without_returning(self.write_conn())
            .await?;

        // Read back from the primary so a lagging replica cannot hide the row
        let record = CdrEntity::find()
            .filter(CdrColumn::TenantId.eq(tenant_id))
            .filter(CdrColumn::Uniqueid.eq(uniqueid.as_str()))
            .one(self.write_conn())
            .await?
            .ok_or_else(|| crate::errors::AppError::Internal {
                message: format!("CDR {} vanished after insert", uniqueid),
            })?;

        if inserted > 0 {
            Ok(InsertOutcome::Inserted(record))
        } else {
            Ok(InsertOutcome::Duplicate(record))
        }
    }

    /// Find CDR by ID (primary, the pipeline reads its own writes)
    pub async fn find_cdr(&self, id: Uuid) -> Result<Option<CdrRecord>> {
        CdrEntity::find_by_id(id)
            .one(self.write_conn())
            .await
            .map_err(Into::into)
    }

    /// Find CDR by its natural key
    pub async fn find_cdr_by_uniqueid(
        &self,
        tenant_id: Uuid,
        uniqueid: &str,
    ) -> Result<Option<CdrRecord>> {
        CdrEntity::find()
            .filter(CdrColumn::TenantId.eq(tenant_id))
            .filter(CdrColumn::Uniqueid.eq(uniqueid))
            .one(self.read_conn())
            .await
            .map_err(Into::into)
    }

    /// Number of CDRs stored for a tenant
    pub async fn count_cdrs(&self, tenant_id: Uuid) -> Result<u64> {
        CdrEntity::find()
            .filter(CdrColumn::TenantId.eq(tenant_id))
            .count(self.read_conn())
            .await
            .map_err(Into::into)
    }

    /// Compare-and-set on the pipeline state. Returns false if another
    /// worker moved the call first.
    pub async fn transition_state(
        &self,
        id: Uuid,
        from: PipelineState,
        to: PipelineState,
    ) -> Result<bool> {
        let now: sea_orm::prelude::DateTimeWithTimeZone = Utc::now().into();

        let result = CdrEntity::update_many()
            .col_expr(CdrColumn::PipelineState, Expr::value(to.as_str()))
            .col_expr(CdrColumn::UpdatedAt, Expr::value(now))
            .filter(CdrColumn::Id.eq(id))
            .filter(CdrColumn::PipelineState.eq(from.as_str()))
            .exec(self.write_conn())
            .await?;

        Ok(result.rows_affected == 1)
    }

    /// Compare-and-set that also starts the next stage with a clean attempt
    /// counter and error
    pub async fn complete_stage(
        &self,
        id: Uuid,
        from: PipelineState,
        to: PipelineState,
    ) -> Result<bool> {
        let now: sea_orm::prelude::DateTimeWithTimeZone = Utc::now().into();

        let result = CdrEntity::update_many()
            .col_expr(CdrColumn::PipelineState, Expr::value(to.as_str()))
            .col_expr(CdrColumn::StageAttempts, Expr::value(0))
            .col_expr(CdrColumn::LastError, Expr::value(Option::<String>::None))
            .col_expr(CdrColumn::UpdatedAt, Expr::value(now))
            .filter(CdrColumn::Id.eq(id))
            .filter(CdrColumn::PipelineState.eq(from.as_str()))
            .exec(self.write_conn())
            .await?;

        Ok(result.rows_affected == 1)
    }

    /// Move a call to a state, resetting the per-stage attempt counter
    pub async fn set_state(
        &self,
        id: Uuid,
        to: PipelineState,
        last_error: Option<String>,
    ) -> Result<()> {
        let now: sea_orm::prelude::DateTimeWithTimeZone = Utc::now().into();

        CdrEntity::update_many()
            .col_expr(CdrColumn::PipelineState, Expr::value(to.as_str()))
            .col_expr(CdrColumn::StageAttempts, Expr::value(0))
            .col_expr(CdrColumn::LastError, Expr::value(last_error))
            .col_expr(CdrColumn::UpdatedAt, Expr::value(now))
            .filter(CdrColumn::Id.eq(id))
            .exec(self.write_conn())
            .await?;

        Ok(())
    }

    /// Record a retryable stage failure and put the call back in `revert_to`.
    /// Returns the attempt count after the increment.
    pub async fn record_stage_failure(
        &self,
        id: Uuid,
        revert_to: PipelineState,
        error: &str,
    ) -> Result<i32> {
        let now: sea_orm::prelude::DateTimeWithTimeZone = Utc::now().into();

        CdrEntity::update_many()
            .col_expr(
                CdrColumn::StageAttempts,
                Expr::col(CdrColumn::StageAttempts).add(1),
            )
            .col_expr(CdrColumn::PipelineState, Expr::value(revert_to.as_str()))
            .col_expr(CdrColumn::LastError, Expr::value(error))
            .col_expr(CdrColumn::UpdatedAt, Expr::value(now))
            .filter(CdrColumn::Id.eq(id))
            .exec(self.write_conn())
            .await?;

        let attempts = self
            .find_cdr(id)
            .await?
            .map(|cdr| cdr.stage_attempts)
            .unwrap_or_default();

        Ok(attempts)
    }

    /// Store the acquisition result and correct the PBX-reported duration
    pub async fn mark_recording_acquired(
        &self,
        id: Uuid,
        storage_key: &str,
        size_bytes: i64,
        sha256: &str,
        duration_secs: i32,
    ) -> Result<CdrRecord> {
        let cdr = self.find_cdr(id).await?.ok_or_else(|| {
            crate::errors::AppError::NotFound {
                resource_type: "cdr".into(),
                id: id.to_string(),
            }
        })?;

        let mut model = cdr.into_active_model();
        model.recording_downloaded = Set(true);
        model.recording_local_path = Set(Some(storage_key.to_string()));
        model.recording_size_bytes = Set(Some(size_bytes));
        model.recording_sha256 = Set(Some(sha256.to_string()));
        model.duration = Set(duration_secs);
        model.billsec = Set(duration_secs);
        model.pipeline_state = Set(PipelineState::Acquired.into());
        model.stage_attempts = Set(0);
        model.last_error = Set(None);
        model.updated_at = Set(Utc::now().into());

        model.update(self.write_conn()).await.map_err(Into::into)
    }

    /// Short recording: keep the CDR with its measured duration, drop the audio
    pub async fn mark_discarded(&self, id: Uuid, duration_secs: i32) -> Result<()> {
        let now: sea_orm::prelude::DateTimeWithTimeZone = Utc::now().into();

        CdrEntity::update_many()
            .col_expr(CdrColumn::PipelineState, Expr::value(PipelineState::Discarded.as_str()))
            .col_expr(CdrColumn::Duration, Expr::value(duration_secs))
            .col_expr(CdrColumn::Billsec, Expr::value(duration_secs))
            .col_expr(CdrColumn::StageAttempts, Expr::value(0))
            .col_expr(CdrColumn::UpdatedAt, Expr::value(now))
            .filter(CdrColumn::Id.eq(id))
            .exec(self.write_conn())
            .await?;

        Ok(())
    }

    /// Non-terminal calls not touched since `before`, oldest first
    pub async fn find_stale_cdrs(
        &self,
        before: DateTime<Utc>,
        limit: u64,
    ) -> Result<Vec<CdrRecord>> {
        let before: sea_orm::prelude::DateTimeWithTimeZone = before.into();
        let states: Vec<&'static str> = PipelineState::non_terminal()
            .iter()
            .map(|s| s.as_str())
            .collect();

        CdrEntity::find()
            .filter(CdrColumn::PipelineState.is_in(states))
            .filter(CdrColumn::UpdatedAt.lt(before))
            .order_by_asc(CdrColumn::UpdatedAt)
            .limit(limit)
            .all(self.write_conn())
            .await
            .map_err(Into::into)
    }

    // ========================================================================
    // Transcription Operations
    // ========================================================================

    pub async fn find_transcription(&self, cdr_id: Uuid) -> Result<Option<Transcription>> {
        TranscriptionEntity::find()
            .filter(TranscriptionColumn::CdrId.eq(cdr_id))
            .one(self.write_conn())
            .await
            .map_err(Into::into)
    }

    /// Insert the transcript for a call; an existing row wins
    pub async fn insert_transcription(
        &self,
        cdr: &CdrRecord,
        text: String,
        language: Option<String>,
        duration_seconds: i32,
        provider: &str,
    ) -> Result<Transcription> {
        let model = TranscriptionActiveModel {
            id: Set(Uuid::new_v4()),
            cdr_id: Set(cdr.id),
            tenant_id: Set(cdr.tenant_id),
            text: Set(text),
            language: Set(language),
            duration_seconds: Set(duration_seconds),
            provider: Set(provider.to_string()),
            created_at: Set(Utc::now().into()),
        };

        TranscriptionEntity::insert(model)
            .on_conflict(
                OnConflict::column(TranscriptionColumn::CdrId)
                    .do_nothing()
                    .to_owned(),
            )
            .exec_without_returning(self.write_conn())
            .await?;

        self.find_transcription(cdr.id).await?.ok_or_else(|| {
            crate::errors::AppError::Internal {
                message: format!("transcription for {} vanished after insert", cdr.id),
            }
        })
    }

    // ========================================================================
    // Feature Result Operations
    // ========================================================================

    async fn insert_unique_row<A>(
        &self,
        row: A,
        cdr_column: <A::Entity as EntityTrait>::Column,
    ) -> Result<bool>
    where
        A: ActiveModelTrait,
        <A::Entity as EntityTrait>::Model: IntoActiveModel<A>,
    {
        let inserted = <A::Entity as EntityTrait>::insert(row)
            .on_conflict(OnConflict::column(cdr_column).do_nothing().to_owned())
            .exec_without_returning(self.write_conn())
            .await?;

        Ok(inserted > 0)
    }

    pub async fn insert_sentiment(&self, row: SentimentActiveModel) -> Result<bool> {
        self.insert_unique_row(row, SentimentColumn::CdrId).await
    }

    pub async fn insert_quality_score(&self, row: QualityScoreActiveModel) -> Result<bool> {
        self.insert_unique_row(row, QualityScoreColumn::CdrId).await
    }

    pub async fn insert_churn_prediction(&self, row: ChurnActiveModel) -> Result<bool> {
        self.insert_unique_row(row, ChurnColumn::CdrId).await
    }

    pub async fn insert_call_summary(&self, row: CallSummaryActiveModel) -> Result<bool> {
        self.insert_unique_row(row, CallSummaryColumn::CdrId).await
    }

    /// Load every stored feature result for a call
    pub async fn load_feature_rows(&self, cdr_id: Uuid) -> Result<FeatureRows> {
        let conn = self.write_conn();

        Ok(FeatureRows {
            sentiment: SentimentEntity::find()
                .filter(SentimentColumn::CdrId.eq(cdr_id))
                .one(conn)
                .await?,
            quality_score: QualityScoreEntity::find()
                .filter(QualityScoreColumn::CdrId.eq(cdr_id))
                .one(conn)
                .await?,
            churn_prediction: ChurnEntity::find()
                .filter(ChurnColumn::CdrId.eq(cdr_id))
                .one(conn)
                .await?,
            call_summary: CallSummaryEntity::find()
                .filter(CallSummaryColumn::CdrId.eq(cdr_id))
                .one(conn)
                .await?,
        })
    }

    // ========================================================================
    // Poll Watermarks
    // ========================================================================

    pub async fn get_watermark(&self, tenant_id: Uuid) -> Result<Option<DateTime<Utc>>> {
        let row = WatermarkEntity::find_by_id(tenant_id)
            .one(self.write_conn())
            .await?;

        Ok(row.map(|w| w.last_synced_at.with_timezone(&Utc)))
    }

    pub async fn set_watermark(&self, tenant_id: Uuid, at: DateTime<Utc>) -> Result<()> {
        let model = WatermarkActiveModel {
            tenant_id: Set(tenant_id),
            last_synced_at: Set(at.into()),
            updated_at: Set(Utc::now().into()),
        };

        WatermarkEntity::insert(model)
            .on_conflict(
                OnConflict::column(WatermarkColumn::TenantId)
                    .update_columns([WatermarkColumn::LastSyncedAt, WatermarkColumn::UpdatedAt])
                    .to_owned(),
            )
            .exec_without_returning(self.write_conn())
            .await?;

        Ok(())
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// CDR plus transcript and feature results
    pub async fn get_call_detail(
        &self,
        tenant_id: Uuid,
        uniqueid: &str,
    ) -> Result<Option<CallDetail>> {
        let Some(cdr) = self.find_cdr_by_uniqueid(tenant_id, uniqueid).await? else {
            return Ok(None);
        };

        let transcription = self.find_transcription(cdr.id).await?;
        let features = self.load_feature_rows(cdr.id).await?;

        Ok(Some(CallDetail {
            cdr,
            transcription,
            features,
        }))
    }
}

/// Usage period label for a timestamp, `YYYY-MM`
pub fn usage_period(at: DateTime<Utc>) -> String {
    at.format("%Y-%m").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_pool;

    fn new_tenant(subdomain: &str, limit: i64) -> NewTenant {
        NewTenant {
            subdomain: subdomain.to_string(),
            name: subdomain.to_uppercase(),
            pbx_host: Some("10.0.0.5".to_string()),
            pbx_port: 8089,
            pbx_username: Some("cdrapi".to_string()),
            pbx_password: Some("secret".to_string()),
            pbx_enabled: true,
            webhook_username: "hook".to_string(),
            webhook_password_hash: "x".to_string(),
            enabled_features: vec!["sentiment-analysis".to_string()],
            monthly_limit: limit,
        }
    }

    fn new_cdr(tenant_id: Uuid, uniqueid: &str) -> NewCdr {
        NewCdr {
            tenant_id,
            uniqueid: uniqueid.to_string(),
            source: "webhook".to_string(),
            src: Some("1001".to_string()),
            dst: Some("5551234".to_string()),
            caller_name: None,
            start_time: Some(Utc::now()),
            answer_time: None,
            end_time: None,
            duration: 60,
            billsec: 55,
            disposition: Disposition::Answered,
            recordfiles: Some("2026-02/rec.wav@".to_string()),
            quota_exceeded: false,
            raw_payload: None,
        }
    }

    #[tokio::test]
    async fn test_insert_cdr_is_idempotent() {
        let repo = Repository::new(test_pool().await.unwrap());
        let tenant = repo.create_tenant(new_tenant("acme", 10)).await.unwrap();

        let first = repo.insert_cdr(new_cdr(tenant.id, "abc-123")).await.unwrap();
        assert!(!first.is_duplicate());

        let mut again = new_cdr(tenant.id, "abc-123");
        again.duration = 999;
        let second = repo.insert_cdr(again).await.unwrap();

        assert!(second.is_duplicate());
        assert_eq!(second.record().id, first.record().id);
        assert_eq!(second.record().duration, 60);
        assert_eq!(repo.count_cdrs(tenant.id).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_same_uniqueid_different_tenants() {
        let repo = Repository::new(test_pool().await.unwrap());
        let a = repo.create_tenant(new_tenant("acme", 10)).await.unwrap();
        let b = repo.create_tenant(new_tenant("globex", 10)).await.unwrap();

        assert!(!repo.insert_cdr(new_cdr(a.id, "same")).await.unwrap().is_duplicate());
        assert!(!repo.insert_cdr(new_cdr(b.id, "same")).await.unwrap().is_duplicate());
    }

    #[tokio::test]
    async fn test_reserve_usage_stops_at_limit() {
        let repo = Repository::new(test_pool().await.unwrap());
        let tenant = repo.create_tenant(new_tenant("acme", 2)).await.unwrap();
        let period = tenant.usage_period.clone();

        assert!(repo.reserve_usage(tenant.id, &period).await.unwrap());
        assert!(repo.reserve_usage(tenant.id, &period).await.unwrap());
        assert!(!repo.reserve_usage(tenant.id, &period).await.unwrap());

        let stored = repo.find_tenant_by_id(tenant.id).await.unwrap().unwrap();
        assert_eq!(stored.usage_this_month, 2);

        repo.release_usage(tenant.id).await.unwrap();
        let stored = repo.find_tenant_by_id(tenant.id).await.unwrap().unwrap();
        assert_eq!(stored.usage_this_month, 1);
    }

    #[tokio::test]
    async fn test_reserve_usage_rolls_over_period() {
        let repo = Repository::new(test_pool().await.unwrap());
        let tenant = repo.create_tenant(new_tenant("acme", 1)).await.unwrap();

        assert!(repo.reserve_usage(tenant.id, "2026-01").await.unwrap());
        assert!(!repo.reserve_usage(tenant.id, "2026-01").await.unwrap());
        assert!(repo.reserve_usage(tenant.id, "2026-02").await.unwrap());

        let stored = repo.find_tenant_by_id(tenant.id).await.unwrap().unwrap();
        assert_eq!(stored.usage_period, "2026-02");
        assert_eq!(stored.usage_this_month, 1);
    }

    #[tokio::test]
    async fn test_transition_state_is_compare_and_set() {
        let repo = Repository::new(test_pool().await.unwrap());
        let tenant = repo.create_tenant(new_tenant("acme", 10)).await.unwrap();
        let cdr = repo.insert_cdr(new_cdr(tenant.id, "c1")).await.unwrap();
        let id = cdr.record().id;

        assert!(repo
            .transition_state(id, PipelineState::Received, PipelineState::Acquiring)
            .await
            .unwrap());
        assert!(!repo
            .transition_state(id, PipelineState::Received, PipelineState::Acquiring)
            .await
            .unwrap());

        let attempts = repo
            .record_stage_failure(id, PipelineState::Received, "upload failed")
            .await
            .unwrap();
        assert_eq!(attempts, 1);

        let stored = repo.find_cdr(id).await.unwrap().unwrap();
        assert_eq!(stored.state(), PipelineState::Received);
        assert_eq!(stored.last_error.as_deref(), Some("upload failed"));
    }

    #[tokio::test]
    async fn test_watermark_upsert() {
        let repo = Repository::new(test_pool().await.unwrap());
        let tenant = repo.create_tenant(new_tenant("acme", 10)).await.unwrap();

        assert!(repo.get_watermark(tenant.id).await.unwrap().is_none());

        let first = Utc::now() - chrono::Duration::hours(1);
        repo.set_watermark(tenant.id, first).await.unwrap();
        let second = Utc::now();
        repo.set_watermark(tenant.id, second).await.unwrap();

        let stored = repo.get_watermark(tenant.id).await.unwrap().unwrap();
        assert_eq!(stored.timestamp(), second.timestamp());
    }

    #[tokio::test]
    async fn test_transcription_insert_keeps_first_row() {
        let repo = Repository::new(test_pool().await.unwrap());
        let tenant = repo.create_tenant(new_tenant("acme", 10)).await.unwrap();
        let cdr = repo.insert_cdr(new_cdr(tenant.id, "c1")).await.unwrap();
        let cdr = cdr.record().clone();

        let first = repo
            .insert_transcription(&cdr, "hello".into(), Some("en".into()), 42, "mock")
            .await
            .unwrap();
        let second = repo
            .insert_transcription(&cdr, "other".into(), None, 1, "mock")
            .await
            .unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(second.text, "hello");
    }
}
