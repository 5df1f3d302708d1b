use sea_orm::entity::prelude::*;
use sea_orm::Set;
use serde::{Deserialize, Serialize};

/// Per-tenant sending reputation. Score 0..=100; sends are rejected below
/// [`CRITICAL_SCORE`] unless the app is in sandbox mode.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "reputations")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub app_id: Uuid,

    pub score: f64,

    pub sent_count: i64,

    pub bounce_count: i64,

    pub complaint_count: i64,

    pub updated_at: DateTimeUtc,
}

pub const CRITICAL_SCORE: f64 = 20.0;

impl Model {
    /// Bounces weigh 5x, complaints 20x against delivered volume.
    pub fn recompute(sent: i64, bounces: i64, complaints: i64) -> f64 {
        if sent <= 0 {
            return 100.0;
        }
        let penalty =
            (bounces as f64 * 5.0 + complaints as f64 * 20.0) / sent as f64 * 100.0;
        (100.0 - penalty).clamp(0.0, 100.0)
    }

    pub fn is_throttled(&self) -> bool {
        self.score < CRITICAL_SCORE
    }
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {
    fn new() -> Self {
        Self {
            score: Set(100.0),
            sent_count: Set(0),
            bounce_count: Set(0),
            complaint_count: Set(0),
            updated_at: Set(chrono::Utc::now()),
            ..ActiveModelTrait::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_tenant_has_full_score() {
        assert_eq!(Model::recompute(0, 0, 0), 100.0);
    }

    #[test]
    fn test_heavy_complaints_hit_critical() {
        // 100 sends, 5 complaints: 100 - 5*20 = 0
        assert_eq!(Model::recompute(100, 0, 5), 0.0);
    }

    #[test]
    fn test_score_is_clamped() {
        assert_eq!(Model::recompute(10, 100, 100), 0.0);
        assert_eq!(Model::recompute(1000, 1, 0), 99.5);
    }
}
