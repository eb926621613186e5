//! Transcription entity, one row per acquired call

use sea_orm::entity::prelude::*;
use sea_orm_migration::prelude::*;
use sea_orm_migration::schema::{integer, string, string_null, text, timestamp_with_time_zone, uuid};
use sea_orm_migration::sea_query::ForeignKeyAction as MigrationForeignKeyAction;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "transcriptions")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    #[sea_orm(unique)]
    pub cdr_id: Uuid,

    pub tenant_id: Uuid,

    pub text: String,

    pub language: Option<String>,

    /// Measured from the decoded audio, not the PBX
    pub duration_seconds: i32,

    pub provider: String,

    pub created_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::cdr_record::Entity",
        from = "Column::CdrId",
        to = "super::cdr_record::Column::Id"
    )]
    CdrRecord,
}

impl Related<super::cdr_record::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::CdrRecord.def()
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
                    .col(uuid(Column::CdrId).unique_key())
                    .col(uuid(Column::TenantId))
                    .col(text(Column::Text))
                    .col(string_null(Column::Language).string_len(16))
                    .col(integer(Column::DurationSeconds).default(0))
                    .col(string(Column::Provider).string_len(32))
                    .col(timestamp_with_time_zone(Column::CreatedAt).default(Expr::current_timestamp()))
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_transcriptions_cdr")
                            .from(Entity, Column::CdrId)
                            .to(super::cdr_record::Entity, super::cdr_record::Column::Id)
                            .on_delete(MigrationForeignKeyAction::Cascade),
                    )
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
