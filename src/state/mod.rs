use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, Condition, ConnectionTrait, DatabaseConnection, EntityTrait,
    QueryFilter, QueryOrder, QuerySelect, Set, TransactionTrait,
};
use std::sync::Arc;
use uuid::Uuid;

use crate::database::email_events::{self, Entity as EmailEvents, EventData};
use crate::database::emails::{self, EmailStatus, Entity as Emails};
use crate::database::{apps, queues};
use crate::error::{MailroomError, Result};
use crate::metrics::Metrics;
use crate::utils::cursor::Cursor;
use crate::webhook::WebhookDispatcher;

/// The one place where email status, the append-only event log and webhook
/// fan-out meet. Every observable transition goes through here: the status
/// update and its event land in one transaction, then the webhook channel is
/// notified. Nothing else writes email status.
pub struct EmailStateStore {
    db: Arc<DatabaseConnection>,
    dispatcher: Arc<WebhookDispatcher>,
    metrics: Arc<Metrics>,
}

impl EmailStateStore {
    pub fn new(
        db: Arc<DatabaseConnection>,
        dispatcher: Arc<WebhookDispatcher>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            db,
            dispatcher,
            metrics,
        }
    }

    pub fn db(&self) -> &DatabaseConnection {
        &self.db
    }

    /// Inserts a new email in `queued` together with its first event, then
    /// fans out. The caller owns idempotency-key population; the unique
    /// `(app_id, idempotency_key)` index backs it up.
    pub async fn create_queued_email(
        &self,
        app: &apps::Model,
        queue: &queues::Model,
        email: emails::ActiveModel,
    ) -> Result<emails::Model> {
        let txn = self.db.begin().await?;
        let email = email.insert(&txn).await?;
        append_event(
            &txn,
            email.id,
            &EventData::Queued {
                queue: queue.name.clone(),
            },
        )
        .await?;
        txn.commit().await?;

        self.metrics.emails_queued_total.inc();
        self.dispatcher
            .record_event(
                app,
                Some(&queue.name),
                Some(&email),
                &EventData::Queued {
                    queue: queue.name.clone(),
                },
            )
            .await?;
        Ok(email)
    }

    pub async fn mark_processing(
        &self,
        app: &apps::Model,
        queue: &queues::Model,
        email: emails::Model,
        attempt: i32,
        throttled: bool,
    ) -> Result<emails::Model> {
        self.persist_transition(
            app,
            queue,
            email,
            EmailStatus::Processing,
            EventData::Processing { attempt, throttled },
            |_| {},
        )
        .await
    }

    pub async fn mark_sent(
        &self,
        app: &apps::Model,
        queue: &queues::Model,
        email: emails::Model,
        message_id: String,
        accepted: Vec<String>,
        rejected: Vec<String>,
    ) -> Result<emails::Model> {
        let event = EventData::Sent {
            message_id: message_id.clone(),
            accepted,
            rejected,
        };
        let updated = self
            .persist_transition(app, queue, email, EmailStatus::Sent, event, |active| {
                active.message_id = Set(Some(message_id.clone()));
                active.sent_at = Set(Some(Utc::now()));
                active.last_error = Set(None);
            })
            .await?;
        self.metrics.emails_sent_total.inc();
        Ok(updated)
    }

    /// Terminal failure. `error` must already be redacted.
    pub async fn mark_failed(
        &self,
        app: &apps::Model,
        queue: &queues::Model,
        email: emails::Model,
        error: String,
    ) -> Result<emails::Model> {
        let event = EventData::Failed {
            error: error.clone(),
        };
        let updated = self
            .persist_transition(app, queue, email, EmailStatus::Failed, event, |active| {
                active.last_error = Set(Some(error.clone()));
            })
            .await?;
        self.metrics.emails_failed_total.inc();
        Ok(updated)
    }

    /// The retry loop: processing goes back to queued with the attempt
    /// counter bumped, producing another `queued` event in the log.
    pub async fn requeue_for_retry(
        &self,
        app: &apps::Model,
        queue: &queues::Model,
        email: emails::Model,
        error: String,
    ) -> Result<emails::Model> {
        let retry_count = email.retry_count + 1;
        self.persist_transition(
            app,
            queue,
            email,
            EmailStatus::Queued,
            EventData::Queued {
                queue: queue.name.clone(),
            },
            |active| {
                active.retry_count = Set(retry_count);
                active.last_error = Set(Some(error.clone()));
            },
        )
        .await
    }

    pub async fn mark_cancelled(
        &self,
        app: &apps::Model,
        queue: &queues::Model,
        email: emails::Model,
    ) -> Result<emails::Model> {
        self.persist_transition(
            app,
            queue,
            email,
            EmailStatus::Cancelled,
            EventData::Cancelled {},
            |_| {},
        )
        .await
    }

    pub async fn mark_delivered(
        &self,
        app: &apps::Model,
        queue: &queues::Model,
        email: emails::Model,
    ) -> Result<emails::Model> {
        self.persist_transition(
            app,
            queue,
            email,
            EmailStatus::Delivered,
            EventData::Delivered {},
            |active| {
                active.delivered_at = Set(Some(Utc::now()));
            },
        )
        .await
    }

    pub async fn mark_bounced(
        &self,
        app: &apps::Model,
        queue: &queues::Model,
        email: emails::Model,
        code: Option<u16>,
        description: Option<String>,
        hard: bool,
    ) -> Result<emails::Model> {
        self.persist_transition(
            app,
            queue,
            email,
            EmailStatus::Bounced,
            EventData::Bounced {
                code,
                description,
                hard,
            },
            |_| {},
        )
        .await
    }

    /// Operator-triggered retry of a failed email. This is the one sanctioned
    /// exit from the `failed` terminal state; the pipeline guard stays strict
    /// for everything else.
    pub async fn retry_failed(
        &self,
        app: &apps::Model,
        queue: &queues::Model,
        email: emails::Model,
    ) -> Result<emails::Model> {
        if email.status != EmailStatus::Failed.to_string() {
            return Err(MailroomError::Conflict(format!(
                "only failed emails can be retried (status is {})",
                email.status
            )));
        }

        let txn = self.db.begin().await?;
        let mut active: emails::ActiveModel = email.into();
        active.status = Set(EmailStatus::Queued.to_string());
        active.retry_count = Set(0);
        active.updated_at = Set(Utc::now());
        let updated = active.update(&txn).await?;
        append_event(
            &txn,
            updated.id,
            &EventData::Queued {
                queue: queue.name.clone(),
            },
        )
        .await?;
        txn.commit().await?;

        self.dispatcher
            .record_event(
                app,
                Some(&queue.name),
                Some(&updated),
                &EventData::Queued {
                    queue: queue.name.clone(),
                },
            )
            .await?;
        Ok(updated)
    }

    /// Engagement and feedback events (opened, clicked, complained,
    /// unsubscribed) append to the log and fan out without touching status.
    pub async fn record_engagement(
        &self,
        app: &apps::Model,
        queue_name: Option<&str>,
        email: &emails::Model,
        event: EventData,
    ) -> Result<()> {
        append_event(&*self.db, email.id, &event).await?;
        self.dispatcher
            .record_event(app, queue_name, Some(email), &event)
            .await?;
        Ok(())
    }

    async fn persist_transition(
        &self,
        app: &apps::Model,
        queue: &queues::Model,
        email: emails::Model,
        next: EmailStatus,
        event: EventData,
        mutate: impl FnOnce(&mut emails::ActiveModel),
    ) -> Result<emails::Model> {
        let current = EmailStatus::parse(&email.status).ok_or_else(|| {
            MailroomError::Internal(format!("email {} has unknown status {}", email.id, email.status))
        })?;
        if !current.can_transition_to(next) {
            return Err(MailroomError::InvalidTransition {
                from: current.to_string(),
                to: next.to_string(),
            });
        }

        let txn = self.db.begin().await?;
        let mut active: emails::ActiveModel = email.into();
        active.status = Set(next.to_string());
        active.updated_at = Set(Utc::now());
        mutate(&mut active);
        let updated = active.update(&txn).await?;
        append_event(&txn, updated.id, &event).await?;
        txn.commit().await?;

        self.dispatcher
            .record_event(app, Some(&queue.name), Some(&updated), &event)
            .await?;
        Ok(updated)
    }

    /// Event history, newest first.
    pub async fn list_events(&self, email_id: Uuid) -> Result<Vec<email_events::Model>> {
        Ok(EmailEvents::find()
            .filter(email_events::Column::EmailId.eq(email_id))
            .order_by_desc(email_events::Column::CreatedAt)
            .order_by_desc(email_events::Column::Id)
            .all(&*self.db)
            .await?)
    }

    /// Keyset pagination over `(created_at desc, id desc)`. Returns the page
    /// plus the cursor for the next one (None when the page was short).
    pub async fn list_emails(
        &self,
        app_id: Uuid,
        status: Option<EmailStatus>,
        cursor: Option<Cursor>,
        limit: u64,
    ) -> Result<(Vec<emails::Model>, Option<Cursor>)> {
        let mut query = Emails::find().filter(emails::Column::AppId.eq(app_id));

        if let Some(status) = status {
            query = query.filter(emails::Column::Status.eq(status.to_string()));
        }
        if let Some(cursor) = cursor {
            query = query.filter(
                Condition::any()
                    .add(emails::Column::CreatedAt.lt(cursor.c))
                    .add(
                        Condition::all()
                            .add(emails::Column::CreatedAt.eq(cursor.c))
                            .add(emails::Column::Id.lt(cursor.i)),
                    ),
            );
        }

        let page = query
            .order_by_desc(emails::Column::CreatedAt)
            .order_by_desc(emails::Column::Id)
            .limit(limit)
            .all(&*self.db)
            .await?;

        let next = if page.len() as u64 == limit {
            page.last().map(|e| Cursor::new(e.created_at, e.id))
        } else {
            None
        };
        Ok((page, next))
    }
}

/// Append-only event insert, usable inside a caller's transaction.
pub async fn append_event<C: ConnectionTrait>(
    conn: &C,
    email_id: Uuid,
    event: &EventData,
) -> Result<email_events::Model> {
    let model = email_events::ActiveModel {
        id: Set(Uuid::now_v7()),
        email_id: Set(email_id),
        event_type: Set(event.event_type().to_string()),
        event_data: Set(serde_json::to_value(event)?),
        created_at: Set(Utc::now()),
    };
    Ok(model.insert(conn).await?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::QueueBroker;
    use crate::crypto::EncryptionService;
    use crate::database::establish_connection;
    use sea_orm::ActiveModelBehavior;

    async fn store() -> (EmailStateStore, apps::Model, queues::Model) {
        let db = Arc::new(establish_connection("sqlite::memory:").await.unwrap());
        let metrics = Arc::new(Metrics::new());
        let broker = Arc::new(QueueBroker::new(db.clone()));
        let dispatcher = Arc::new(WebhookDispatcher::new(
            db.clone(),
            broker,
            EncryptionService::new(&[0u8; 32]),
            metrics.clone(),
        ));
        let store = EmailStateStore::new(db.clone(), dispatcher, metrics);

        let app = apps::ActiveModel {
            name: Set("acme".to_string()),
            ..apps::ActiveModel::new()
        }
        .insert(&*db)
        .await
        .unwrap();
        let queue = queues::ActiveModel {
            app_id: Set(app.id),
            name: Set("transactional".to_string()),
            ..queues::ActiveModel::new()
        }
        .insert(&*db)
        .await
        .unwrap();
        (store, app, queue)
    }

    fn draft(app: &apps::Model, queue: &queues::Model) -> emails::ActiveModel {
        emails::ActiveModel {
            app_id: Set(app.id),
            queue_id: Set(queue.id),
            from_email: Set("a@x.io".to_string()),
            to: Set(serde_json::json!([{"email": "b@y.io"}])),
            subject: Set("hi".to_string()),
            text_body: Set(Some("hi".to_string())),
            ..emails::ActiveModel::new()
        }
    }

    #[tokio::test]
    async fn test_lifecycle_appends_ordered_events() {
        let (store, app, queue) = store().await;
        let email = store
            .create_queued_email(&app, &queue, draft(&app, &queue))
            .await
            .unwrap();

        let email = store
            .mark_processing(&app, &queue, email, 0, false)
            .await
            .unwrap();
        let email = store
            .mark_sent(
                &app,
                &queue,
                email,
                "<m@relay>".to_string(),
                vec!["b@y.io".to_string()],
                vec![],
            )
            .await
            .unwrap();

        assert_eq!(email.status, "sent");
        assert!(email.sent_at.is_some());
        assert_eq!(email.message_id.as_deref(), Some("<m@relay>"));

        // Newest first
        let events: Vec<String> = store
            .list_events(email.id)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.event_type)
            .collect();
        assert_eq!(events, vec!["sent", "processing", "queued"]);
    }

    #[tokio::test]
    async fn test_retry_produces_second_queued_event() {
        let (store, app, queue) = store().await;
        let email = store
            .create_queued_email(&app, &queue, draft(&app, &queue))
            .await
            .unwrap();
        let email = store
            .mark_processing(&app, &queue, email, 0, false)
            .await
            .unwrap();
        let email = store
            .requeue_for_retry(&app, &queue, email, "451 greylisted".to_string())
            .await
            .unwrap();

        assert_eq!(email.status, "queued");
        assert_eq!(email.retry_count, 1);

        let events: Vec<String> = store
            .list_events(email.id)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.event_type)
            .collect();
        assert_eq!(events, vec!["queued", "processing", "queued"]);
    }

    #[tokio::test]
    async fn test_illegal_transition_is_rejected() {
        let (store, app, queue) = store().await;
        let email = store
            .create_queued_email(&app, &queue, draft(&app, &queue))
            .await
            .unwrap();

        // queued -> sent skips processing
        let err = store
            .mark_sent(&app, &queue, email.clone(), "<m>".to_string(), vec![], vec![])
            .await
            .unwrap_err();
        assert!(matches!(err, MailroomError::InvalidTransition { .. }));

        // cancel only works from queued
        let email = store
            .mark_processing(&app, &queue, email, 0, false)
            .await
            .unwrap();
        assert!(store.mark_cancelled(&app, &queue, email).await.is_err());
    }

    #[tokio::test]
    async fn test_cursor_pages_are_strictly_decreasing_without_gaps() {
        let (store, app, queue) = store().await;
        for _ in 0..7 {
            store
                .create_queued_email(&app, &queue, draft(&app, &queue))
                .await
                .unwrap();
        }

        let (page1, cursor) = store.list_emails(app.id, None, None, 3).await.unwrap();
        assert_eq!(page1.len(), 3);
        let cursor = cursor.unwrap();

        let (page2, cursor2) = store
            .list_emails(app.id, None, Some(cursor), 3)
            .await
            .unwrap();
        let (page3, cursor3) = store
            .list_emails(app.id, None, cursor2.clone(), 3)
            .await
            .unwrap();

        let all: Vec<(chrono::DateTime<Utc>, Uuid)> = page1
            .iter()
            .chain(page2.iter())
            .chain(page3.iter())
            .map(|e| (e.created_at, e.id))
            .collect();

        assert_eq!(all.len(), 7);
        for pair in all.windows(2) {
            assert!(pair[0] > pair[1], "keys must strictly decrease");
        }
        assert!(cursor3.is_none());
    }
}
