//! Call detail record entity and pipeline state

use sea_orm::entity::prelude::*;
use sea_orm_migration::prelude::*;
use sea_orm_migration::schema::{
    big_integer_null, boolean, integer, json_null, string, string_null, text_null,
    timestamp_with_time_zone, timestamp_with_time_zone_null, uuid,
};
use sea_orm_migration::sea_query::ForeignKeyAction as MigrationForeignKeyAction;
use serde::{Deserialize, Serialize};

/// Per-call pipeline state, stored in `cdr_records.pipeline_state`
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PipelineState {
    Received,
    Acquiring,
    Acquired,
    Transcribing,
    Transcribed,
    Analyzing,
    Done,
    /// Recording shorter than the minimum duration; CDR kept, audio dropped
    Discarded,
    AcquisitionFailed,
    TranscriptionFailed,
}

impl PipelineState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineState::Received => "RECEIVED",
            PipelineState::Acquiring => "ACQUIRING",
            PipelineState::Acquired => "ACQUIRED",
            PipelineState::Transcribing => "TRANSCRIBING",
            PipelineState::Transcribed => "TRANSCRIBED",
            PipelineState::Analyzing => "ANALYZING",
            PipelineState::Done => "DONE",
            PipelineState::Discarded => "DISCARDED",
            PipelineState::AcquisitionFailed => "ACQUISITION_FAILED",
            PipelineState::TranscriptionFailed => "TRANSCRIPTION_FAILED",
        }
    }

    /// No further stage will run for a call in this state
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PipelineState::Done
                | PipelineState::Discarded
                | PipelineState::AcquisitionFailed
                | PipelineState::TranscriptionFailed
        )
    }

    /// State a stage is claimed from; in-flight states roll back here on resume
    pub fn resumable_predecessor(&self) -> Option<PipelineState> {
        match self {
            PipelineState::Acquiring => Some(PipelineState::Received),
            PipelineState::Transcribing => Some(PipelineState::Acquired),
            PipelineState::Analyzing => Some(PipelineState::Transcribed),
            _ => None,
        }
    }

    /// States the resume sweep looks at
    pub fn non_terminal() -> [PipelineState; 6] {
        [
            PipelineState::Received,
            PipelineState::Acquiring,
            PipelineState::Acquired,
            PipelineState::Transcribing,
            PipelineState::Transcribed,
            PipelineState::Analyzing,
        ]
    }
}

impl std::fmt::Display for PipelineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<String> for PipelineState {
    fn from(s: String) -> Self {
        match s.as_str() {
            "RECEIVED" => PipelineState::Received,
            "ACQUIRING" => PipelineState::Acquiring,
            "ACQUIRED" => PipelineState::Acquired,
            "TRANSCRIBING" => PipelineState::Transcribing,
            "TRANSCRIBED" => PipelineState::Transcribed,
            "ANALYZING" => PipelineState::Analyzing,
            "DONE" => PipelineState::Done,
            "DISCARDED" => PipelineState::Discarded,
            "ACQUISITION_FAILED" => PipelineState::AcquisitionFailed,
            "TRANSCRIPTION_FAILED" => PipelineState::TranscriptionFailed,
            _ => PipelineState::Received,
        }
    }
}

impl From<PipelineState> for String {
    fn from(state: PipelineState) -> Self {
        state.as_str().to_string()
    }
}

/// Normalized call outcome
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Disposition {
    Answered,
    NoAnswer,
    Busy,
    Failed,
    Unknown,
}

impl Disposition {
    /// Parse the PBX spelling ("ANSWERED", "NO ANSWER", "no-answer", ...)
    pub fn parse(raw: &str) -> Self {
        let normalized: String = raw
            .trim()
            .to_ascii_lowercase()
            .chars()
            .map(|c| if c == ' ' || c == '_' { '-' } else { c })
            .collect();

        match normalized.as_str() {
            "answered" => Disposition::Answered,
            "no-answer" | "noanswer" => Disposition::NoAnswer,
            "busy" => Disposition::Busy,
            "failed" | "congestion" | "chanunavail" => Disposition::Failed,
            _ => Disposition::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Disposition::Answered => "answered",
            Disposition::NoAnswer => "no-answer",
            Disposition::Busy => "busy",
            Disposition::Failed => "failed",
            Disposition::Unknown => "unknown",
        }
    }
}

/// Where a call's recording stands
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "status", content = "path")]
pub enum RecordingStatus {
    NotAttempted,
    Downloaded(String),
    Discarded,
    Failed,
}

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "cdr_records")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    pub tenant_id: Uuid,

    /// Provider-assigned call id, unique per tenant
    pub uniqueid: String,

    /// webhook or poller
    pub source: String,

    pub src: Option<String>,

    pub dst: Option<String>,

    pub caller_name: Option<String>,

    pub start_time: Option<DateTimeWithTimeZone>,

    pub answer_time: Option<DateTimeWithTimeZone>,

    pub end_time: Option<DateTimeWithTimeZone>,

    /// Seconds; corrected to the measured audio length after acquisition
    pub duration: i32,

    pub billsec: i32,

    pub disposition: String,

    /// Raw recording reference as sent by the PBX
    pub recordfiles: Option<String>,

    pub recording_downloaded: bool,

    /// Object storage key of the delivery artifact
    pub recording_local_path: Option<String>,

    pub recording_size_bytes: Option<i64>,

    pub recording_sha256: Option<String>,

    pub pipeline_state: String,

    pub stage_attempts: i32,

    pub last_error: Option<String>,

    pub quota_exceeded: bool,

    pub raw_payload: Option<Json>,

    pub created_at: DateTimeWithTimeZone,

    pub updated_at: DateTimeWithTimeZone,
}

impl Model {
    /// Get the pipeline state as an enum
    pub fn state(&self) -> PipelineState {
        PipelineState::from(self.pipeline_state.clone())
    }

    pub fn is_answered(&self) -> bool {
        Disposition::parse(&self.disposition) == Disposition::Answered
    }

    pub fn has_recording_reference(&self) -> bool {
        self.recordfiles
            .as_deref()
            .is_some_and(|r| !r.trim().trim_end_matches('@').trim().is_empty())
    }

    /// Only answered calls with a recording reference are acquired
    pub fn is_eligible_for_acquisition(&self) -> bool {
        self.is_answered() && self.has_recording_reference() && !self.quota_exceeded
    }

    pub fn recording_status(&self) -> RecordingStatus {
        match (self.recording_downloaded, &self.recording_local_path) {
            (true, Some(path)) => RecordingStatus::Downloaded(path.clone()),
            _ => match self.state() {
                PipelineState::AcquisitionFailed => RecordingStatus::Failed,
                PipelineState::Discarded => RecordingStatus::Discarded,
                _ => RecordingStatus::NotAttempted,
            },
        }
    }
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::tenant::Entity",
        from = "Column::TenantId",
        to = "super::tenant::Column::Id"
    )]
    Tenant,

    #[sea_orm(has_one = "super::transcription::Entity")]
    Transcription,
}

impl Related<super::tenant::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Tenant.def()
    }
}

impl Related<super::transcription::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Transcription.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Entity)
                    .if_not_exists()
                    .col(uuid(Column::Id).primary_key())
                    .col(uuid(Column::TenantId))
                    .col(string(Column::Uniqueid).string_len(128))
                    .col(string(Column::Source).string_len(16))
                    .col(string_null(Column::Src).string_len(64))
                    .col(string_null(Column::Dst).string_len(64))
                    .col(string_null(Column::CallerName).string_len(160))
                    .col(timestamp_with_time_zone_null(Column::StartTime))
                    .col(timestamp_with_time_zone_null(Column::AnswerTime))
                    .col(timestamp_with_time_zone_null(Column::EndTime))
                    .col(integer(Column::Duration).default(0))
                    .col(integer(Column::Billsec).default(0))
                    .col(string(Column::Disposition).string_len(16))
                    .col(text_null(Column::Recordfiles))
                    .col(boolean(Column::RecordingDownloaded).default(false))
                    .col(text_null(Column::RecordingLocalPath))
                    .col(big_integer_null(Column::RecordingSizeBytes))
                    .col(string_null(Column::RecordingSha256).string_len(64))
                    .col(string(Column::PipelineState).string_len(32).default("RECEIVED"))
                    .col(integer(Column::StageAttempts).default(0))
                    .col(text_null(Column::LastError))
                    .col(boolean(Column::QuotaExceeded).default(false))
                    .col(json_null(Column::RawPayload))
                    .col(timestamp_with_time_zone(Column::CreatedAt).default(Expr::current_timestamp()))
                    .col(timestamp_with_time_zone(Column::UpdatedAt).default(Expr::current_timestamp()))
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_cdr_records_tenant")
                            .from(Entity, Column::TenantId)
                            .to(super::tenant::Entity, super::tenant::Column::Id)
                            .on_delete(MigrationForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        // Duplicate deliveries collapse onto this key
        manager
            .create_index(
                Index::create()
                    .name("idx_cdr_records_tenant_uniqueid")
                    .table(Entity)
                    .col(Column::TenantId)
                    .col(Column::Uniqueid)
                    .unique()
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_cdr_records_state_updated")
                    .table(Entity)
                    .col(Column::PipelineState)
                    .col(Column::UpdatedAt)
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(Entity).to_owned())
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pipeline_state_roundtrip_and_terminals() {
        for state in PipelineState::non_terminal() {
            assert!(!state.is_terminal());
            assert_eq!(PipelineState::from(String::from(state)), state);
        }
        assert!(PipelineState::Done.is_terminal());
        assert!(PipelineState::Discarded.is_terminal());
        assert!(PipelineState::AcquisitionFailed.is_terminal());
        assert!(PipelineState::TranscriptionFailed.is_terminal());
    }

    #[test]
    fn test_resumable_predecessor() {
        assert_eq!(
            PipelineState::Acquiring.resumable_predecessor(),
            Some(PipelineState::Received)
        );
        assert_eq!(
            PipelineState::Transcribing.resumable_predecessor(),
            Some(PipelineState::Acquired)
        );
        assert_eq!(
            PipelineState::Analyzing.resumable_predecessor(),
            Some(PipelineState::Transcribed)
        );
        assert_eq!(PipelineState::Received.resumable_predecessor(), None);
    }

    #[test]
    fn test_disposition_parse() {
        assert_eq!(Disposition::parse("ANSWERED"), Disposition::Answered);
        assert_eq!(Disposition::parse("NO ANSWER"), Disposition::NoAnswer);
        assert_eq!(Disposition::parse("no-answer"), Disposition::NoAnswer);
        assert_eq!(Disposition::parse("Busy"), Disposition::Busy);
        assert_eq!(Disposition::parse("CONGESTION"), Disposition::Failed);
        assert_eq!(Disposition::parse("???"), Disposition::Unknown);
    }
}
