//! Call summary, one row per call

use sea_orm::entity::prelude::*;
use sea_orm_migration::prelude::*;
use sea_orm_migration::schema::{
    big_integer, boolean, double, json, string, string_null, text, timestamp_with_time_zone, uuid,
};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "call_summaries")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    #[sea_orm(unique)]
    pub cdr_id: Uuid,

    pub tenant_id: Uuid,

    pub summary: String,

    pub key_points: Json,

    pub action_items: Json,

    pub topic: Option<String>,

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
                    .col(text(Column::Summary))
                    .col(json(Column::KeyPoints))
                    .col(json(Column::ActionItems))
                    .col(string_null(Column::Topic))
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
