use sea_orm::entity::prelude::*;
use sea_orm::Set;
use serde::{Deserialize, Serialize};

/// Backing row for the queue broker. `queue` is the logical channel
/// ("email", "webhook", "tracking"), not a tenant queue.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "jobs")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    pub queue: String,

    #[sea_orm(column_type = "JsonBinary")]
    pub payload: Json,

    /// 1..=10, higher dispatched first.
    pub priority: i16,

    pub status: String,

    pub attempts: i32,

    /// Jobs become visible once `run_at <= now`; delayed jobs carry a future
    /// value.
    pub run_at: DateTimeUtc,

    #[sea_orm(nullable)]
    pub reserved_until: Option<DateTimeUtc>,

    #[sea_orm(nullable)]
    pub reserved_by: Option<String>,

    #[sea_orm(nullable, column_type = "Text")]
    pub last_error: Option<String>,

    #[sea_orm(nullable)]
    pub completed_at: Option<DateTimeUtc>,

    pub created_at: DateTimeUtc,

    pub updated_at: DateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {
    fn new() -> Self {
        let now = chrono::Utc::now();
        Self {
            id: Set(Uuid::now_v7()),
            priority: Set(5),
            status: Set(JobStatus::Waiting.to_string()),
            attempts: Set(0),
            run_at: Set(now),
            created_at: Set(now),
            updated_at: Set(now),
            ..ActiveModelTrait::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Waiting,
    Active,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "waiting" => Some(Self::Waiting),
            "active" => Some(Self::Active),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Waiting => "waiting",
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        write!(f, "{s}")
    }
}
