//! Agent quality score, one row per call

use sea_orm::entity::prelude::*;
use sea_orm_migration::prelude::*;
use sea_orm_migration::schema::{
    big_integer, boolean, double, integer, json, string, timestamp_with_time_zone, uuid,
};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "quality_scores")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    #[sea_orm(unique)]
    pub cdr_id: Uuid,

    pub tenant_id: Uuid,

    /// 0 ..= 100
    pub overall_score: i32,

    pub greeting: i32,

    pub empathy: i32,

    pub resolution: i32,

    pub professionalism: i32,

    pub strengths: Json,

    pub improvements: Json,

    pub degraded: bool,

    pub model: String,

    pub cost_usd: f64,

    pub processing_ms: i64,

    pub created_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

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
                    .col(uuid(Column::CdrId).unique_key())
                    .col(uuid(Column::TenantId))
                    .col(integer(Column::OverallScore))
                    .col(integer(Column::Greeting))
                    .col(integer(Column::Empathy))
                    .col(integer(Column::Resolution))
                    .col(integer(Column::Professionalism))
                    .col(json(Column::Strengths))
                    .col(json(Column::Improvements))
                    .col(boolean(Column::Degraded).default(false))
                    .col(string(Column::Model))
                    .col(double(Column::CostUsd).default(0.0))
                    .col(big_integer(Column::ProcessingMs).default(0))
                    .col(timestamp_with_time_zone(Column::CreatedAt).default(Expr::current_timestamp()))
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
