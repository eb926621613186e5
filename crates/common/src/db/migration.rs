//! Schema migrations

use super::models::migrations;
use sea_orm_migration::{MigrationTrait, MigratorTrait};

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(migrations::Tenants),
            Box::new(migrations::CdrRecords),
            Box::new(migrations::Transcriptions),
            Box::new(migrations::SentimentResults),
            Box::new(migrations::QualityScores),
            Box::new(migrations::ChurnPredictions),
            Box::new(migrations::CallSummaries),
            Box::new(migrations::PollWatermarks),
        ]
    }
}
