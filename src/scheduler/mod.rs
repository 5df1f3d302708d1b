use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use cron::Schedule as CronSchedule;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, Set,
};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::time::{interval, sleep_until, Duration, Instant};
use uuid::Uuid;

use crate::admission::{AdmissionController, AuthContext, SendEmailRequest};
use crate::database::scheduled_emails::{self, Entity as ScheduledEmails};
use crate::database::{apps, queues};
use crate::error::{MailroomError, Result};

const SECONDS_PER_DAY: i64 = 86400;
const MAX_SCHEDULE_DURATION_SECS: i64 = SECONDS_PER_DAY * 365;

const DEFAULT_SYNC_INTERVAL_SECS: u64 = 30;

/// Expands recurring scheduled emails. One tokio timer per active schedule
/// plus a periodic sync pass that picks up created, changed and deleted rows;
/// each fire goes through the ordinary admission path, so rate limits and
/// suppressions still apply to scheduled traffic.
pub struct CronScheduler {
    db: Arc<DatabaseConnection>,
    admission: Arc<AdmissionController>,
    tasks: Arc<RwLock<HashMap<Uuid, tokio::task::JoinHandle<()>>>>,
    // schedule id -> (cron expression, timezone), for change detection
    configs: Arc<RwLock<HashMap<Uuid, (String, String)>>>,
}

impl CronScheduler {
    pub fn new(db: Arc<DatabaseConnection>, admission: Arc<AdmissionController>) -> Self {
        Self {
            db,
            admission,
            tasks: Arc::new(RwLock::new(HashMap::new())),
            configs: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Runs forever; the caller spawns it.
    pub async fn run(self: Arc<Self>) {
        tracing::info!("cron scheduler started");
        let mut tick = interval(Duration::from_secs(DEFAULT_SYNC_INTERVAL_SECS));
        loop {
            tick.tick().await;
            if let Err(e) = self.sync_schedules().await {
                tracing::error!("schedule sync failed: {e}");
            }
        }
    }

    /// Reconciles timers against the table: arms new/changed schedules,
    /// cancels deleted or deactivated ones.
    async fn sync_schedules(&self) -> Result<()> {
        let active_rows = ScheduledEmails::find()
            .filter(scheduled_emails::Column::Active.eq(true))
            .all(&*self.db)
            .await?;

        let armed: std::collections::HashSet<Uuid> =
            self.tasks.read().await.keys().copied().collect();
        let mut live = std::collections::HashSet::new();

        for row in active_rows {
            live.insert(row.id);
            let current_config = (row.cron_expression.clone(), row.timezone.clone());

            let needs_rearm = if armed.contains(&row.id) {
                let configs = self.configs.read().await;
                configs.get(&row.id) != Some(&current_config)
            } else {
                true
            };

            if needs_rearm {
                self.cancel(row.id).await;
                match self.arm(row).await {
                    Ok(id) => {
                        self.configs.write().await.insert(id, current_config);
                    }
                    Err(e) => tracing::error!("failed to arm schedule: {e}"),
                }
            }
        }

        for stale in armed.difference(&live) {
            tracing::info!(schedule_id = %stale, "schedule removed or deactivated, cancelling");
            self.cancel(*stale).await;
        }

        Ok(())
    }

    /// Arms one timer for the next fire time in the schedule's timezone.
    async fn arm(&self, row: scheduled_emails::Model) -> Result<Uuid> {
        let schedule_id = row.id;
        let next = calculate_next_fire(&row.cron_expression, &row.timezone, Utc::now())?;

        let wait_secs = (next - Utc::now()).num_seconds();
        if wait_secs < 0 {
            return Err(MailroomError::Internal(format!(
                "schedule {schedule_id} computed a fire time in the past"
            )));
        }
        if wait_secs > MAX_SCHEDULE_DURATION_SECS {
            return Err(MailroomError::Validation(format!(
                "schedule {schedule_id} fires more than a year out"
            )));
        }

        let wake = Instant::now() + Duration::from_secs(wait_secs as u64);
        let db = self.db.clone();
        let admission = self.admission.clone();
        let tasks_for_cleanup = self.tasks.clone();

        let handle = tokio::spawn(async move {
            sleep_until(wake).await;
            if let Err(e) = fire_schedule(db, admission, schedule_id).await {
                tracing::error!(schedule_id = %schedule_id, "scheduled send failed: {e}");
            }
            // Drop the handle; the next sync pass re-arms for the following
            // fire time.
            tasks_for_cleanup.write().await.remove(&schedule_id);
        });

        let mut tasks = self.tasks.write().await;
        if tasks.contains_key(&schedule_id) {
            handle.abort();
            return Ok(schedule_id);
        }
        tasks.insert(schedule_id, handle);

        tracing::debug!(
            schedule_id = %schedule_id,
            next_fire = %next,
            "schedule armed"
        );
        Ok(schedule_id)
    }

    pub async fn cancel(&self, schedule_id: Uuid) {
        if let Some(handle) = self.tasks.write().await.remove(&schedule_id) {
            handle.abort();
            self.configs.write().await.remove(&schedule_id);
        }
    }

    pub async fn shutdown(&self) {
        let mut tasks = self.tasks.write().await;
        for (_, handle) in tasks.drain() {
            handle.abort();
        }
        self.configs.write().await.clear();
        tracing::info!("cron scheduler stopped");
    }
}

/// Builds the send request from the stored template and submits it through
/// admission, then advances the schedule's bookkeeping.
async fn fire_schedule(
    db: Arc<DatabaseConnection>,
    admission: Arc<AdmissionController>,
    schedule_id: Uuid,
) -> Result<()> {
    let Some(row) = ScheduledEmails::find_by_id(schedule_id).one(&*db).await? else {
        return Ok(()); // deleted between arm and fire
    };
    if !row.active {
        return Ok(());
    }

    let app = apps::Entity::find_by_id(row.app_id)
        .one(&*db)
        .await?
        .ok_or_else(|| MailroomError::AppNotFound(row.app_id.to_string()))?;
    let queue = queues::Entity::find_by_id(row.queue_id)
        .one(&*db)
        .await?
        .ok_or_else(|| MailroomError::QueueNotFound(row.queue_id.to_string()))?;

    // The template omits routing; the schedule's queue is authoritative
    let mut template = row.template.clone();
    template["queue"] = serde_json::json!(queue.name);
    let mut request: SendEmailRequest = serde_json::from_value(template)
        .map_err(|e| MailroomError::Validation(format!("schedule template invalid: {e}")))?;
    request.scheduled_at = None;

    let ctx = AuthContext {
        app,
        api_key: None,
        is_admin: false,
    };

    let now = Utc::now();
    match admission.submit(&ctx, request, None).await {
        Ok(outcome) => {
            tracing::info!(
                schedule_id = %schedule_id,
                email_id = %outcome.email.id,
                "scheduled email queued"
            );
        }
        Err(e) => {
            // Rate limits and suppressions apply to scheduled sends too;
            // the miss is logged and the schedule keeps its cadence.
            tracing::warn!(schedule_id = %schedule_id, "scheduled send rejected: {e}");
        }
    }

    let next = calculate_next_fire(&row.cron_expression, &row.timezone, now)?;
    let mut active: scheduled_emails::ActiveModel = row.into();
    active.last_run_at = Set(Some(now));
    active.next_run_at = Set(Some(next));
    active.updated_at = Set(now);
    active.update(&*db).await?;

    Ok(())
}

/// Next fire strictly after `after`, evaluated in the schedule's timezone.
pub fn calculate_next_fire(
    cron_expression: &str,
    timezone: &str,
    after: DateTime<Utc>,
) -> Result<DateTime<Utc>> {
    let schedule = parse_cron(cron_expression)?;
    let tz: Tz = timezone
        .parse()
        .map_err(|_| MailroomError::Validation(format!("invalid timezone: {timezone}")))?;

    schedule
        .after(&after.with_timezone(&tz))
        .next()
        .map(|t| t.with_timezone(&Utc))
        .ok_or_else(|| {
            MailroomError::Validation(format!(
                "cron expression '{cron_expression}' has no future fire time"
            ))
        })
}

pub fn parse_cron(cron_expression: &str) -> Result<CronSchedule> {
    CronSchedule::from_str(cron_expression)
        .map_err(|e| MailroomError::Validation(format!("invalid cron expression: {e}")))
}

/// Preview used by the validate endpoint: the next `count` fire times.
pub fn preview_fires(
    cron_expression: &str,
    timezone: &str,
    count: usize,
) -> Result<Vec<DateTime<Utc>>> {
    let schedule = parse_cron(cron_expression)?;
    let tz: Tz = timezone
        .parse()
        .map_err(|_| MailroomError::Validation(format!("invalid timezone: {timezone}")))?;

    Ok(schedule
        .upcoming(tz)
        .take(count)
        .map(|t| t.with_timezone(&Utc))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    // The `cron` crate uses 6/7-field expressions (seconds first).
    const EVERY_DAY_AT_NOON: &str = "0 0 12 * * *";

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_cron("not a cron").is_err());
        assert!(parse_cron("99 99 99 * * *").is_err());
        assert!(parse_cron(EVERY_DAY_AT_NOON).is_ok());
    }

    #[test]
    fn test_next_fire_respects_timezone() {
        let after = DateTime::parse_from_rfc3339("2025-06-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);

        let utc_noon = calculate_next_fire(EVERY_DAY_AT_NOON, "UTC", after).unwrap();
        let zurich_noon =
            calculate_next_fire(EVERY_DAY_AT_NOON, "Europe/Zurich", after).unwrap();

        assert_eq!(utc_noon.to_rfc3339(), "2025-06-01T12:00:00+00:00");
        // CEST is UTC+2 in June
        assert_eq!(zurich_noon.to_rfc3339(), "2025-06-01T10:00:00+00:00");
    }

    #[test]
    fn test_invalid_timezone_is_rejected() {
        assert!(calculate_next_fire(EVERY_DAY_AT_NOON, "Mars/Olympus", Utc::now()).is_err());
    }

    #[test]
    fn test_preview_returns_monotonic_times() {
        let fires = preview_fires(EVERY_DAY_AT_NOON, "UTC", 3).unwrap();
        assert_eq!(fires.len(), 3);
        assert!(fires.windows(2).all(|w| w[0] < w[1]));
    }
}
