use sea_orm::entity::prelude::*;
use sea_orm::Set;
use serde::{Deserialize, Serialize};

/// A named send channel within an app. Name is unique per app and constrained
/// to lowercase-alphanumeric-hyphen at the admission layer.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "queues")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    pub app_id: Uuid,

    pub name: String,

    /// 1..=10, 10 dispatched first.
    pub priority: i16,

    /// Emails per minute; null = unbounded.
    #[sea_orm(nullable)]
    pub rate_limit: Option<i32>,

    /// 0..=10 delivery attempts after the first.
    pub max_retries: i16,

    /// Ordered backoff sequence in seconds.
    #[sea_orm(column_type = "JsonBinary")]
    pub retry_delays: Json,

    /// Kept nullable so deleting an SMTP config preserves the queue.
    #[sea_orm(nullable)]
    pub smtp_config_id: Option<Uuid>,

    pub paused: bool,

    pub track_opens: bool,

    pub track_clicks: bool,

    pub created_at: DateTimeUtc,

    pub updated_at: DateTimeUtc,
}

pub const DEFAULT_RETRY_DELAYS: [i64; 5] = [30, 120, 600, 3600, 86400];

impl Model {
    pub fn retry_delay_secs(&self, attempt: u32) -> i64 {
        let delays: Vec<i64> = serde_json::from_value(self.retry_delays.clone())
            .unwrap_or_else(|_| DEFAULT_RETRY_DELAYS.to_vec());
        if delays.is_empty() {
            return DEFAULT_RETRY_DELAYS[(attempt as usize).min(DEFAULT_RETRY_DELAYS.len() - 1)];
        }
        delays[(attempt as usize).min(delays.len() - 1)]
    }
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
        belongs_to = "super::smtp_configs::Entity",
        from = "Column::SmtpConfigId",
        to = "super::smtp_configs::Column::Id"
    )]
    SmtpConfig,
    #[sea_orm(has_many = "super::emails::Entity")]
    Emails,
}

impl Related<super::apps::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::App.def()
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
            priority: Set(5),
            max_retries: Set(3),
            retry_delays: Set(serde_json::json!(DEFAULT_RETRY_DELAYS)),
            paused: Set(false),
            track_opens: Set(false),
            track_clicks: Set(false),
            created_at: Set(now),
            updated_at: Set(now),
            ..ActiveModelTrait::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue_with_delays(delays: serde_json::Value) -> Model {
        Model {
            id: Uuid::now_v7(),
            app_id: Uuid::now_v7(),
            name: "transactional".to_string(),
            priority: 5,
            rate_limit: None,
            max_retries: 5,
            retry_delays: delays,
            smtp_config_id: None,
            paused: false,
            track_opens: false,
            track_clicks: false,
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
        }
    }

    #[test]
    fn test_retry_delay_clamps_to_last() {
        let q = queue_with_delays(serde_json::json!([30, 120, 600]));
        assert_eq!(q.retry_delay_secs(0), 30);
        assert_eq!(q.retry_delay_secs(2), 600);
        assert_eq!(q.retry_delay_secs(9), 600);
    }

    #[test]
    fn test_retry_delay_falls_back_to_default() {
        let q = queue_with_delays(serde_json::json!([]));
        assert_eq!(q.retry_delay_secs(0), 30);
        assert_eq!(q.retry_delay_secs(100), 86400);
    }
}
