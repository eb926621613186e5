//! Tenant entity

use sea_orm::entity::prelude::*;
use sea_orm_migration::prelude::*;
use sea_orm_migration::schema::{
    big_integer, boolean, integer, json, string, string_null, timestamp_with_time_zone, uuid,
};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "tenants")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    #[sea_orm(unique)]
    pub subdomain: String,

    pub name: String,

    pub is_active: bool,

    pub pbx_host: Option<String>,

    pub pbx_port: i32,

    pub pbx_username: Option<String>,

    #[serde(skip_serializing)]
    pub pbx_password: Option<String>,

    /// Poll this tenant's PBX on a schedule
    pub pbx_enabled: bool,

    pub webhook_username: String,

    /// Argon2 PHC string
    #[serde(skip_serializing)]
    pub webhook_password_hash: String,

    /// JSON array of feature slugs
    pub enabled_features: Json,

    pub usage_this_month: i64,

    pub monthly_limit: i64,

    /// Month the usage counter belongs to, `YYYY-MM`
    pub usage_period: String,

    pub created_at: DateTimeWithTimeZone,

    pub updated_at: DateTimeWithTimeZone,
}

impl Model {
    /// Feature slugs the tenant has switched on
    pub fn enabled_feature_slugs(&self) -> Vec<String> {
        self.enabled_features
            .as_array()
            .map(|items| {
                items
                    .iter()
                    .filter_map(|v| v.as_str().map(String::from))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Whether the PBX connection settings are complete
    pub fn has_pbx_connection(&self) -> bool {
        self.pbx_host.as_deref().is_some_and(|h| !h.is_empty())
            && self.pbx_username.as_deref().is_some_and(|u| !u.is_empty())
            && self.pbx_password.is_some()
    }

    /// Whether the usage counter has reached the plan limit
    pub fn is_over_quota(&self) -> bool {
        self.usage_this_month >= self.monthly_limit
    }
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::cdr_record::Entity")]
    CdrRecords,
}

impl Related<super::cdr_record::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::CdrRecords.def()
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
                    .col(string(Column::Subdomain).string_len(63).unique_key())
                    .col(string(Column::Name))
                    .col(boolean(Column::IsActive).default(true))
                    .col(string_null(Column::PbxHost))
                    .col(integer(Column::PbxPort).default(8089))
                    .col(string_null(Column::PbxUsername))
                    .col(string_null(Column::PbxPassword))
                    .col(boolean(Column::PbxEnabled).default(false))
                    .col(string(Column::WebhookUsername))
                    .col(string(Column::WebhookPasswordHash))
                    .col(json(Column::EnabledFeatures))
                    .col(big_integer(Column::UsageThisMonth).default(0))
                    .col(big_integer(Column::MonthlyLimit).default(0))
                    .col(string(Column::UsagePeriod).string_len(7))
                    .col(timestamp_with_time_zone(Column::CreatedAt).default(Expr::current_timestamp()))
                    .col(timestamp_with_time_zone(Column::UpdatedAt).default(Expr::current_timestamp()))
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
