use sea_orm::entity::prelude::*;
use sea_orm::Set;
use serde::{Deserialize, Serialize};

/// Tenant row. Apps are the isolation boundary: queues, SMTP configs, emails
/// and suppressions all hang off an app.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "apps")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    #[sea_orm(nullable)]
    pub account_id: Option<Uuid>,

    pub name: String,

    pub active: bool,

    pub sandbox: bool,

    #[sea_orm(nullable)]
    pub webhook_url: Option<String>,

    /// AES-256-GCM ciphertext; at most one active secret per app, replaced
    /// wholesale on regeneration.
    #[sea_orm(nullable)]
    pub webhook_secret_enc: Option<String>,

    #[sea_orm(nullable)]
    pub daily_quota: Option<i64>,

    #[sea_orm(nullable)]
    pub monthly_quota: Option<i64>,

    #[sea_orm(column_type = "JsonBinary")]
    pub settings: Json,

    pub created_at: DateTimeUtc,

    pub updated_at: DateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::queues::Entity")]
    Queues,
    #[sea_orm(has_many = "super::emails::Entity")]
    Emails,
}

impl Related<super::queues::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Queues.def()
    }
}

impl Related<super::emails::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Emails.def()
    }
}

impl ActiveModelBehavior for ActiveModel {
    fn new() -> Self {
        let now = chrono::Utc::now();
        Self {
            id: Set(Uuid::now_v7()),
            active: Set(true),
            sandbox: Set(false),
            settings: Set(serde_json::json!({})),
            created_at: Set(now),
            updated_at: Set(now),
            ..ActiveModelTrait::default()
        }
    }
}
