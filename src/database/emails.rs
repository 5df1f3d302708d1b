use sea_orm::entity::prelude::*;
use sea_orm::Set;
use serde::{Deserialize, Serialize};

/// One submitted email. Recipient arrays are stored as JSON
/// `[{"email": "...", "name": "..."}]` in submission order.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "emails")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    pub app_id: Uuid,

    pub queue_id: Uuid,

    /// Unique per app when present.
    #[sea_orm(nullable)]
    pub idempotency_key: Option<String>,

    /// Outbound Message-ID once sent (or the sandbox synthetic id).
    #[sea_orm(nullable)]
    pub message_id: Option<String>,

    pub from_email: String,

    #[sea_orm(nullable)]
    pub from_name: Option<String>,

    #[sea_orm(column_type = "JsonBinary")]
    pub to: Json,

    #[sea_orm(column_type = "JsonBinary")]
    pub cc: Json,

    #[sea_orm(column_type = "JsonBinary")]
    pub bcc: Json,

    #[sea_orm(nullable)]
    pub reply_to: Option<String>,

    pub subject: String,

    #[sea_orm(nullable, column_type = "Text")]
    pub html_body: Option<String>,

    #[sea_orm(nullable, column_type = "Text")]
    pub text_body: Option<String>,

    #[sea_orm(column_type = "JsonBinary")]
    pub headers: Json,

    #[sea_orm(column_type = "JsonBinary")]
    pub personalization: Json,

    #[sea_orm(column_type = "JsonBinary")]
    pub metadata: Json,

    pub status: String,

    pub retry_count: i32,

    #[sea_orm(nullable, column_type = "Text")]
    pub last_error: Option<String>,

    #[sea_orm(nullable)]
    pub scheduled_at: Option<DateTimeUtc>,

    #[sea_orm(nullable)]
    pub sent_at: Option<DateTimeUtc>,

    #[sea_orm(nullable)]
    pub delivered_at: Option<DateTimeUtc>,

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
    #[sea_orm(has_many = "super::email_events::Entity")]
    Events,
}

impl Related<super::apps::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::App.def()
    }
}

impl Related<super::queues::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Queue.def()
    }
}

impl Related<super::email_events::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Events.def()
    }
}

impl ActiveModelBehavior for ActiveModel {
    fn new() -> Self {
        let now = chrono::Utc::now();
        Self {
            id: Set(Uuid::now_v7()),
            to: Set(serde_json::json!([])),
            cc: Set(serde_json::json!([])),
            bcc: Set(serde_json::json!([])),
            headers: Set(serde_json::json!({})),
            personalization: Set(serde_json::json!({})),
            metadata: Set(serde_json::json!({})),
            status: Set(EmailStatus::Queued.to_string()),
            retry_count: Set(0),
            created_at: Set(now),
            updated_at: Set(now),
            ..ActiveModelTrait::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmailStatus {
    Queued,
    Processing,
    Sent,
    Delivered,
    Bounced,
    Failed,
    Cancelled,
}

impl EmailStatus {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(Self::Queued),
            "processing" => Some(Self::Processing),
            "sent" => Some(Self::Sent),
            "delivered" => Some(Self::Delivered),
            "bounced" => Some(Self::Bounced),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Sent | Self::Delivered | Self::Bounced | Self::Failed | Self::Cancelled
        )
    }

    /// Status transitions are monotonic except the retry loop
    /// queued -> processing -> queued. `cancelled` is only reachable from
    /// `queued`.
    pub fn can_transition_to(&self, next: Self) -> bool {
        use EmailStatus::*;
        matches!(
            (self, next),
            (Queued, Processing)
                | (Queued, Cancelled)
                | (Processing, Queued)
                | (Processing, Sent)
                | (Processing, Failed)
                | (Processing, Bounced)
                | (Sent, Delivered)
                | (Sent, Bounced)
        )
    }
}

impl std::fmt::Display for EmailStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Queued => "queued",
            Self::Processing => "processing",
            Self::Sent => "sent",
            Self::Delivered => "delivered",
            Self::Bounced => "bounced",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

#[cfg(test)]
mod tests {
    use super::EmailStatus::*;

    #[test]
    fn test_retry_loop_is_allowed() {
        assert!(Queued.can_transition_to(Processing));
        assert!(Processing.can_transition_to(Queued));
    }

    #[test]
    fn test_cancel_only_from_queued() {
        assert!(Queued.can_transition_to(Cancelled));
        assert!(!Processing.can_transition_to(Cancelled));
        assert!(!Sent.can_transition_to(Cancelled));
    }

    #[test]
    fn test_terminal_states_are_sinks() {
        for terminal in [Failed, Cancelled, Delivered, Bounced] {
            for next in [Queued, Processing, Sent, Delivered, Bounced, Failed, Cancelled] {
                assert!(!terminal.can_transition_to(next), "{terminal} -> {next}");
            }
        }
    }

    #[test]
    fn test_sent_can_settle() {
        assert!(Sent.can_transition_to(Delivered));
        assert!(Sent.can_transition_to(Bounced));
        assert!(!Sent.can_transition_to(Queued));
    }
}
