use chrono::{Duration, Utc};
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, PaginatorTrait, QueryFilter,
    QueryOrder, QuerySelect, Set,
};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::database::jobs::{self, Entity as Jobs, JobStatus};
use crate::error::{MailroomError, Result};

/// Logical channels inside the broker. These are process-level queues, not
/// tenant queues.
pub const EMAIL_QUEUE: &str = "email";
pub const WEBHOOK_QUEUE: &str = "webhook";
pub const TRACKING_QUEUE: &str = "tracking";

#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    /// 1..=10, higher dispatched first.
    pub priority: Option<i16>,
    pub delay_ms: Option<i64>,
    /// Caller-chosen id, e.g. to tie a job to its email row.
    pub job_id: Option<Uuid>,
}

/// What `fail` should do with the job.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RetryDecision {
    /// Re-queue with the given backoff.
    Retry { delay_secs: i64 },
    /// No retries left; the job lands in `failed`.
    Discard,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct QueueStats {
    pub waiting: u64,
    pub active: u64,
    pub delayed: u64,
    pub completed: u64,
    pub failed: u64,
}

/// Durable, prioritized, delayed job store with per-worker reservation.
/// FIFO within a priority level; a reserved job is invisible until its
/// `reserved_until` deadline, after which the expiry sweeper hands it back.
pub struct QueueBroker {
    db: Arc<DatabaseConnection>,
    paused: RwLock<HashSet<String>>,
}

impl QueueBroker {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self {
            db,
            paused: RwLock::new(HashSet::new()),
        }
    }

    pub async fn enqueue(
        &self,
        queue: &str,
        payload: serde_json::Value,
        opts: EnqueueOptions,
    ) -> Result<Uuid> {
        let now = Utc::now();
        let priority = opts.priority.unwrap_or(5).clamp(1, 10);
        let run_at = match opts.delay_ms {
            Some(ms) if ms > 0 => now + Duration::milliseconds(ms),
            _ => now,
        };
        let id = opts.job_id.unwrap_or_else(Uuid::now_v7);

        let job = jobs::ActiveModel {
            id: Set(id),
            queue: Set(queue.to_string()),
            payload: Set(payload),
            priority: Set(priority),
            status: Set(JobStatus::Waiting.to_string()),
            attempts: Set(0),
            run_at: Set(run_at),
            reserved_until: Set(None),
            reserved_by: Set(None),
            last_error: Set(None),
            completed_at: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
        };
        job.insert(&*self.db).await?;

        tracing::debug!(job_id = %id, queue = queue, priority = priority, "enqueued job");
        Ok(id)
    }

    /// Claims the next visible job. The claim is an atomic conditional
    /// update, so concurrent workers (and worker processes) never double-
    /// reserve; a lost race just retries against the next candidate.
    pub async fn reserve(
        &self,
        queue: &str,
        visibility_ms: i64,
        worker_id: &str,
    ) -> Result<Option<jobs::Model>> {
        if self.paused.read().await.contains(queue) {
            return Ok(None);
        }

        let now = Utc::now();
        for _ in 0..4 {
            let candidate = Jobs::find()
                .filter(jobs::Column::Queue.eq(queue))
                .filter(jobs::Column::Status.eq(JobStatus::Waiting.to_string()))
                .filter(jobs::Column::RunAt.lte(now))
                .order_by_desc(jobs::Column::Priority)
                .order_by_asc(jobs::Column::CreatedAt)
                .one(&*self.db)
                .await?;

            let Some(job) = candidate else {
                return Ok(None);
            };

            let deadline = now + Duration::milliseconds(visibility_ms);
            let claimed = Jobs::update_many()
                .col_expr(
                    jobs::Column::Status,
                    Expr::value(JobStatus::Active.to_string()),
                )
                .col_expr(jobs::Column::ReservedUntil, Expr::value(deadline))
                .col_expr(jobs::Column::ReservedBy, Expr::value(worker_id))
                .col_expr(jobs::Column::UpdatedAt, Expr::value(now))
                .filter(jobs::Column::Id.eq(job.id))
                .filter(jobs::Column::Status.eq(JobStatus::Waiting.to_string()))
                .exec(&*self.db)
                .await?;

            if claimed.rows_affected == 1 {
                return Ok(Some(jobs::Model {
                    status: JobStatus::Active.to_string(),
                    reserved_until: Some(deadline),
                    reserved_by: Some(worker_id.to_string()),
                    updated_at: now,
                    ..job
                }));
            }
            // Another worker won this job; try the next candidate.
        }
        Ok(None)
    }

    pub async fn complete(&self, id: Uuid) -> Result<()> {
        let now = Utc::now();
        Jobs::update_many()
            .col_expr(
                jobs::Column::Status,
                Expr::value(JobStatus::Completed.to_string()),
            )
            .col_expr(jobs::Column::ReservedUntil, Expr::value(Option::<chrono::DateTime<Utc>>::None))
            .col_expr(jobs::Column::ReservedBy, Expr::value(Option::<String>::None))
            .col_expr(jobs::Column::CompletedAt, Expr::value(Some(now)))
            .col_expr(jobs::Column::UpdatedAt, Expr::value(now))
            .filter(jobs::Column::Id.eq(id))
            .filter(jobs::Column::Status.eq(JobStatus::Active.to_string()))
            .exec(&*self.db)
            .await?;
        Ok(())
    }

    pub async fn fail(&self, id: Uuid, error: &str, decision: RetryDecision) -> Result<()> {
        let job = Jobs::find_by_id(id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| MailroomError::Internal(format!("job {id} not found")))?;

        let now = Utc::now();
        let mut active: jobs::ActiveModel = job.clone().into();
        active.attempts = Set(job.attempts + 1);
        active.last_error = Set(Some(error.to_string()));
        active.reserved_until = Set(None);
        active.reserved_by = Set(None);
        active.updated_at = Set(now);

        match decision {
            RetryDecision::Retry { delay_secs } => {
                active.status = Set(JobStatus::Waiting.to_string());
                active.run_at = Set(now + Duration::seconds(delay_secs));
                tracing::info!(
                    job_id = %id,
                    attempts = job.attempts + 1,
                    delay_secs = delay_secs,
                    "job failed, re-queued with backoff"
                );
            }
            RetryDecision::Discard => {
                active.status = Set(JobStatus::Failed.to_string());
                active.completed_at = Set(Some(now));
                tracing::warn!(job_id = %id, attempts = job.attempts + 1, "job failed permanently");
            }
        }
        active.update(&*self.db).await?;
        Ok(())
    }

    /// Moves a reservation deadline forward for long-running work.
    pub async fn extend(&self, id: Uuid, extra_ms: i64) -> Result<()> {
        let now = Utc::now();
        let updated = Jobs::update_many()
            .col_expr(
                jobs::Column::ReservedUntil,
                Expr::value(Some(now + Duration::milliseconds(extra_ms))),
            )
            .col_expr(jobs::Column::UpdatedAt, Expr::value(now))
            .filter(jobs::Column::Id.eq(id))
            .filter(jobs::Column::Status.eq(JobStatus::Active.to_string()))
            .exec(&*self.db)
            .await?;
        if updated.rows_affected == 0 {
            return Err(MailroomError::Internal(format!(
                "cannot extend job {id}: not active"
            )));
        }
        Ok(())
    }

    pub async fn stats(&self, queue: &str) -> Result<QueueStats> {
        let now = Utc::now();
        let base = || Jobs::find().filter(jobs::Column::Queue.eq(queue));

        let waiting = base()
            .filter(jobs::Column::Status.eq(JobStatus::Waiting.to_string()))
            .filter(jobs::Column::RunAt.lte(now))
            .count(&*self.db)
            .await?;
        let delayed = base()
            .filter(jobs::Column::Status.eq(JobStatus::Waiting.to_string()))
            .filter(jobs::Column::RunAt.gt(now))
            .count(&*self.db)
            .await?;
        let active = base()
            .filter(jobs::Column::Status.eq(JobStatus::Active.to_string()))
            .count(&*self.db)
            .await?;
        let completed = base()
            .filter(jobs::Column::Status.eq(JobStatus::Completed.to_string()))
            .count(&*self.db)
            .await?;
        let failed = base()
            .filter(jobs::Column::Status.eq(JobStatus::Failed.to_string()))
            .count(&*self.db)
            .await?;

        Ok(QueueStats {
            waiting,
            active,
            delayed,
            completed,
            failed,
        })
    }

    /// Process-level intake valve, used for drain and shutdown. Independent
    /// of the tenant queue rows' `paused` flag.
    pub async fn pause(&self, queue: &str) {
        self.paused.write().await.insert(queue.to_string());
        tracing::info!(queue = queue, "broker queue paused");
    }

    pub async fn resume(&self, queue: &str) {
        self.paused.write().await.remove(queue);
        tracing::info!(queue = queue, "broker queue resumed");
    }

    /// Returns expired reservations to `waiting` with attempts unchanged.
    /// Covers worker crashes and missed `extend` calls.
    pub async fn release_expired(&self) -> Result<u64> {
        let now = Utc::now();
        let released = Jobs::update_many()
            .col_expr(
                jobs::Column::Status,
                Expr::value(JobStatus::Waiting.to_string()),
            )
            .col_expr(jobs::Column::ReservedUntil, Expr::value(Option::<chrono::DateTime<Utc>>::None))
            .col_expr(jobs::Column::ReservedBy, Expr::value(Option::<String>::None))
            .col_expr(jobs::Column::UpdatedAt, Expr::value(now))
            .filter(jobs::Column::Status.eq(JobStatus::Active.to_string()))
            .filter(jobs::Column::ReservedUntil.lt(now))
            .exec(&*self.db)
            .await?;

        if released.rows_affected > 0 {
            tracing::warn!(count = released.rows_affected, "released expired job reservations");
        }
        Ok(released.rows_affected)
    }

    /// Evicts settled jobs past their retention window. A job survives while
    /// it is younger than the age bound or still within the newest N.
    pub async fn run_retention(&self) -> Result<u64> {
        let mut total = 0;
        for (queue, completed_age_hours, completed_keep) in [
            (EMAIL_QUEUE, 24i64, 1000u64),
            (WEBHOOK_QUEUE, 24, 1000),
            (TRACKING_QUEUE, 6, 500),
        ] {
            total += self
                .trim(queue, JobStatus::Completed, completed_age_hours, completed_keep)
                .await?;
            total += self.trim(queue, JobStatus::Failed, 24 * 7, 5000).await?;
        }
        if total > 0 {
            tracing::info!(evicted = total, "broker retention sweep complete");
        }
        Ok(total)
    }

    async fn trim(
        &self,
        queue: &str,
        status: JobStatus,
        max_age_hours: i64,
        keep_newest: u64,
    ) -> Result<u64> {
        // The Nth-newest completion time bounds the count-based retention;
        // only rows older than both bounds are evicted.
        let nth = Jobs::find()
            .filter(jobs::Column::Queue.eq(queue))
            .filter(jobs::Column::Status.eq(status.to_string()))
            .order_by_desc(jobs::Column::CompletedAt)
            .offset(keep_newest)
            .limit(1)
            .one(&*self.db)
            .await?;

        let Some(nth) = nth else { return Ok(0) };
        let Some(nth_completed) = nth.completed_at else {
            return Ok(0);
        };

        let age_cutoff = Utc::now() - Duration::hours(max_age_hours);
        let cutoff = age_cutoff.min(nth_completed);

        let deleted = Jobs::delete_many()
            .filter(jobs::Column::Queue.eq(queue))
            .filter(jobs::Column::Status.eq(status.to_string()))
            .filter(jobs::Column::CompletedAt.lt(cutoff))
            .exec(&*self.db)
            .await?;
        Ok(deleted.rows_affected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::establish_connection;

    async fn broker() -> QueueBroker {
        let db = establish_connection("sqlite::memory:").await.unwrap();
        QueueBroker::new(Arc::new(db))
    }

    #[tokio::test]
    async fn test_priority_then_fifo_ordering() {
        let broker = broker().await;
        let low = broker
            .enqueue(EMAIL_QUEUE, serde_json::json!({"n": 1}), EnqueueOptions {
                priority: Some(1),
                ..Default::default()
            })
            .await
            .unwrap();
        let high_first = broker
            .enqueue(EMAIL_QUEUE, serde_json::json!({"n": 2}), EnqueueOptions {
                priority: Some(9),
                ..Default::default()
            })
            .await
            .unwrap();
        let high_second = broker
            .enqueue(EMAIL_QUEUE, serde_json::json!({"n": 3}), EnqueueOptions {
                priority: Some(9),
                ..Default::default()
            })
            .await
            .unwrap();

        let order: Vec<Uuid> = [
            broker.reserve(EMAIL_QUEUE, 30_000, "w1").await.unwrap(),
            broker.reserve(EMAIL_QUEUE, 30_000, "w1").await.unwrap(),
            broker.reserve(EMAIL_QUEUE, 30_000, "w1").await.unwrap(),
        ]
        .into_iter()
        .map(|j| j.unwrap().id)
        .collect();

        assert_eq!(order, vec![high_first, high_second, low]);
        assert!(broker
            .reserve(EMAIL_QUEUE, 30_000, "w1")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_delayed_jobs_stay_invisible() {
        let broker = broker().await;
        broker
            .enqueue(EMAIL_QUEUE, serde_json::json!({}), EnqueueOptions {
                delay_ms: Some(60_000),
                ..Default::default()
            })
            .await
            .unwrap();

        assert!(broker
            .reserve(EMAIL_QUEUE, 30_000, "w1")
            .await
            .unwrap()
            .is_none());

        let stats = broker.stats(EMAIL_QUEUE).await.unwrap();
        assert_eq!(stats.delayed, 1);
        assert_eq!(stats.waiting, 0);
    }

    #[tokio::test]
    async fn test_reserved_job_is_invisible_until_expiry() {
        let broker = broker().await;
        let id = broker
            .enqueue(EMAIL_QUEUE, serde_json::json!({}), EnqueueOptions::default())
            .await
            .unwrap();

        let job = broker
            .reserve(EMAIL_QUEUE, -1, "w1") // already-expired visibility
            .await
            .unwrap()
            .unwrap();
        assert_eq!(job.id, id);
        assert!(broker
            .reserve(EMAIL_QUEUE, 30_000, "w2")
            .await
            .unwrap()
            .is_none());

        // Expired reservation goes back to waiting with attempts untouched
        assert_eq!(broker.release_expired().await.unwrap(), 1);
        let again = broker
            .reserve(EMAIL_QUEUE, 30_000, "w2")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(again.id, id);
        assert_eq!(again.attempts, 0);
    }

    #[tokio::test]
    async fn test_fail_with_retry_requeues_with_backoff() {
        let broker = broker().await;
        let id = broker
            .enqueue(EMAIL_QUEUE, serde_json::json!({}), EnqueueOptions::default())
            .await
            .unwrap();
        broker.reserve(EMAIL_QUEUE, 30_000, "w1").await.unwrap().unwrap();

        broker
            .fail(id, "451 try later", RetryDecision::Retry { delay_secs: 120 })
            .await
            .unwrap();

        // Backoff makes it delayed, not waiting
        let stats = broker.stats(EMAIL_QUEUE).await.unwrap();
        assert_eq!(stats.delayed, 1);

        let job = Jobs::find_by_id(id).one(&*broker.db).await.unwrap().unwrap();
        assert_eq!(job.attempts, 1);
        assert_eq!(job.last_error.as_deref(), Some("451 try later"));
    }

    #[tokio::test]
    async fn test_fail_discard_marks_failed() {
        let broker = broker().await;
        let id = broker
            .enqueue(EMAIL_QUEUE, serde_json::json!({}), EnqueueOptions::default())
            .await
            .unwrap();
        broker.reserve(EMAIL_QUEUE, 30_000, "w1").await.unwrap().unwrap();
        broker
            .fail(id, "550 no such user", RetryDecision::Discard)
            .await
            .unwrap();

        let stats = broker.stats(EMAIL_QUEUE).await.unwrap();
        assert_eq!(stats.failed, 1);
    }

    #[tokio::test]
    async fn test_complete_and_stats() {
        let broker = broker().await;
        let id = broker
            .enqueue(EMAIL_QUEUE, serde_json::json!({}), EnqueueOptions::default())
            .await
            .unwrap();
        broker.reserve(EMAIL_QUEUE, 30_000, "w1").await.unwrap().unwrap();
        broker.complete(id).await.unwrap();

        let stats = broker.stats(EMAIL_QUEUE).await.unwrap();
        assert_eq!(
            stats,
            QueueStats {
                waiting: 0,
                active: 0,
                delayed: 0,
                completed: 1,
                failed: 0
            }
        );
    }

    #[tokio::test]
    async fn test_paused_queue_reserves_nothing() {
        let broker = broker().await;
        broker
            .enqueue(EMAIL_QUEUE, serde_json::json!({}), EnqueueOptions::default())
            .await
            .unwrap();
        broker.pause(EMAIL_QUEUE).await;
        assert!(broker
            .reserve(EMAIL_QUEUE, 30_000, "w1")
            .await
            .unwrap()
            .is_none());
        broker.resume(EMAIL_QUEUE).await;
        assert!(broker
            .reserve(EMAIL_QUEUE, 30_000, "w1")
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_extend_requires_active_job() {
        let broker = broker().await;
        let id = broker
            .enqueue(EMAIL_QUEUE, serde_json::json!({}), EnqueueOptions::default())
            .await
            .unwrap();
        assert!(broker.extend(id, 10_000).await.is_err());

        broker.reserve(EMAIL_QUEUE, 30_000, "w1").await.unwrap().unwrap();
        assert!(broker.extend(id, 10_000).await.is_ok());
    }
}
