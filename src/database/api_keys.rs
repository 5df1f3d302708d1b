use sea_orm::entity::prelude::*;
use sea_orm::Set;
use serde::{Deserialize, Serialize};

/// API keys are stored as SHA-256 digests; `prefix` keeps the first eight
/// chars of the raw key for operator-facing listings.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "api_keys")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    pub app_id: Uuid,

    pub name: String,

    #[sea_orm(unique)]
    pub key_hash: String,

    pub prefix: String,

    /// Permission tags, e.g. ["emails:send", "queues:read"].
    #[sea_orm(column_type = "JsonBinary")]
    pub scopes: Json,

    /// Per-minute override; falls back to the global default when null.
    #[sea_orm(nullable)]
    pub rate_limit: Option<i32>,

    /// CIDR/IP allowlist; null means any source address.
    #[sea_orm(nullable, column_type = "JsonBinary")]
    pub allowed_ips: Option<Json>,

    pub active: bool,

    #[sea_orm(nullable)]
    pub expires_at: Option<DateTimeUtc>,

    #[sea_orm(nullable)]
    pub last_used_at: Option<DateTimeUtc>,

    pub created_at: DateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::apps::Entity",
        from = "Column::AppId",
        to = "super::apps::Column::Id"
    )]
    App,
}

impl Related<super::apps::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::App.def()
    }
}

impl ActiveModelBehavior for ActiveModel {
    fn new() -> Self {
        Self {
            id: Set(Uuid::now_v7()),
            scopes: Set(serde_json::json!(["emails:send"])),
            active: Set(true),
            created_at: Set(chrono::Utc::now()),
            ..ActiveModelTrait::default()
        }
    }
}
