use sea_orm::entity::prelude::*;
use sea_orm::Set;
use serde::{Deserialize, Serialize};

/// Recurring send. `template` is an email submission payload that the
/// scheduler resubmits through the admission path at every fire time.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "scheduled_emails")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    pub app_id: Uuid,

    pub queue_id: Uuid,

    #[sea_orm(nullable)]
    pub name: Option<String>,

    pub cron_expression: String,

    /// IANA timezone name, e.g. "Europe/Zurich".
    pub timezone: String,

    #[sea_orm(column_type = "JsonBinary")]
    pub template: Json,

    pub active: bool,

    #[sea_orm(nullable)]
    pub last_run_at: Option<DateTimeUtc>,

    #[sea_orm(nullable)]
    pub next_run_at: Option<DateTimeUtc>,

    pub created_at: DateTimeUtc,

    pub updated_at: DateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::apps::Entity",
        from = "Column::AppId",
        to = "super::apps::Column::Id"
    )]
    App,
    #[sea_orm(
        belongs_to = "super::queues::Entity",
        from = "Column::QueueId",
        to = "super::queues::Column::Id"
    )]
    Queue,
}

impl Related<super::apps::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::App.def()
    }
}

impl ActiveModelBehavior for ActiveModel {
    fn new() -> Self {
        let now = chrono::Utc::now();
        Self {
            id: Set(Uuid::now_v7()),
            timezone: Set("UTC".to_string()),
            active: Set(true),
            created_at: Set(now),
            updated_at: Set(now),
            ..ActiveModelTrait::default()
        }
    }
}
