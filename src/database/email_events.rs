use sea_orm::entity::prelude::*;
use sea_orm::Set;
use serde::{Deserialize, Serialize};

/// Append-only lifecycle log. `event_type` mirrors the tag inside
/// `event_data` so listings can filter without deserializing.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "email_events")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    pub email_id: Uuid,

    pub event_type: String,

    #[sea_orm(column_type = "JsonBinary")]
    pub event_data: Json,

    pub created_at: DateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::emails::Entity",
        from = "Column::EmailId",
        to = "super::emails::Column::Id"
    )]
    Email,
}

impl Related<super::emails::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Email.def()
    }
}

impl ActiveModelBehavior for ActiveModel {
    fn new() -> Self {
        Self {
            id: Set(Uuid::now_v7()),
            event_data: Set(serde_json::json!({})),
            created_at: Set(chrono::Utc::now()),
            ..ActiveModelTrait::default()
        }
    }
}

/// Typed payload per event kind. Serialized form carries a `type` tag so
/// `event_data` stays self-describing on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventData {
    Queued {
        queue: String,
    },
    Processing {
        attempt: i32,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        throttled: bool,
    },
    Sent {
        message_id: String,
        accepted: Vec<String>,
        rejected: Vec<String>,
    },
    Delivered {},
    Opened {
        #[serde(skip_serializing_if = "Option::is_none")]
        ip: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        user_agent: Option<String>,
    },
    Clicked {
        url: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        ip: Option<String>,
    },
    Bounced {
        #[serde(skip_serializing_if = "Option::is_none")]
        code: Option<u16>,
        #[serde(skip_serializing_if = "Option::is_none")]
        description: Option<String>,
        hard: bool,
    },
    Complained {},
    Unsubscribed {},
    Failed {
        error: String,
    },
    Cancelled {},
}

impl EventData {
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Queued { .. } => "queued",
            Self::Processing { .. } => "processing",
            Self::Sent { .. } => "sent",
            Self::Delivered {} => "delivered",
            Self::Opened { .. } => "opened",
            Self::Clicked { .. } => "clicked",
            Self::Bounced { .. } => "bounced",
            Self::Complained {} => "complained",
            Self::Unsubscribed {} => "unsubscribed",
            Self::Failed { .. } => "failed",
            Self::Cancelled {} => "cancelled",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_data_round_trips_with_tag() {
        let data = EventData::Sent {
            message_id: "<abc@relay>".to_string(),
            accepted: vec!["b@y.io".to_string()],
            rejected: vec![],
        };
        let json = serde_json::to_value(&data).unwrap();
        assert_eq!(json["type"], "sent");
        let back: EventData = serde_json::from_value(json).unwrap();
        assert_eq!(back, data);
    }

    #[test]
    fn test_throttled_flag_omitted_when_false() {
        let json = serde_json::to_value(EventData::Processing {
            attempt: 1,
            throttled: false,
        })
        .unwrap();
        assert!(json.get("throttled").is_none());

        let json = serde_json::to_value(EventData::Processing {
            attempt: 1,
            throttled: true,
        })
        .unwrap();
        assert_eq!(json["throttled"], true);
    }
}
