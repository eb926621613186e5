//! SeaORM entity models
//!
//! Database entities for Callscope, each carrying its own migration

mod call_summary;
mod cdr_record;
mod churn_prediction;
mod poll_watermark;
mod quality_score;
mod sentiment_result;
mod tenant;
mod transcription;

pub(crate) mod migrations {
    pub use super::call_summary::Migration as CallSummaries;
    pub use super::cdr_record::Migration as CdrRecords;
    pub use super::churn_prediction::Migration as ChurnPredictions;
    pub use super::poll_watermark::Migration as PollWatermarks;
    pub use super::quality_score::Migration as QualityScores;
    pub use super::sentiment_result::Migration as SentimentResults;
    pub use super::tenant::Migration as Tenants;
    pub use super::transcription::Migration as Transcriptions;
}

pub use tenant::{
    Entity as TenantEntity,
    Model as Tenant,
    ActiveModel as TenantActiveModel,
    Column as TenantColumn,
};

pub use cdr_record::{
    Entity as CdrEntity,
    Model as CdrRecord,
    ActiveModel as CdrActiveModel,
    Column as CdrColumn,
    Disposition,
    PipelineState,
    RecordingStatus,
};

pub use transcription::{
    Entity as TranscriptionEntity,
    Model as Transcription,
    ActiveModel as TranscriptionActiveModel,
    Column as TranscriptionColumn,
};

pub use sentiment_result::{
    Entity as SentimentEntity,
    Model as SentimentRow,
    ActiveModel as SentimentActiveModel,
    Column as SentimentColumn,
};

pub use quality_score::{
    Entity as QualityScoreEntity,
    Model as QualityScoreRow,
    ActiveModel as QualityScoreActiveModel,
    Column as QualityScoreColumn,
};

pub use churn_prediction::{
    Entity as ChurnEntity,
    Model as ChurnRow,
    ActiveModel as ChurnActiveModel,
    Column as ChurnColumn,
};

pub use call_summary::{
    Entity as CallSummaryEntity,
    Model as CallSummaryRow,
    ActiveModel as CallSummaryActiveModel,
    Column as CallSummaryColumn,
};

pub use poll_watermark::{
    Entity as WatermarkEntity,
    Model as PollWatermark,
    ActiveModel as WatermarkActiveModel,
    Column as WatermarkColumn,
};
