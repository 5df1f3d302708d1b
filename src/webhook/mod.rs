pub mod signing;
pub mod ssrf;

use chrono::{Duration, Utc};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder,
    QuerySelect, Set,
};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::broker::{EnqueueOptions, QueueBroker, RetryDecision, WEBHOOK_QUEUE};
use crate::crypto::EncryptionService;
use crate::database::email_events::EventData;
use crate::database::webhook_deliveries::{self, DeliveryStatus, Entity as WebhookDeliveries};
use crate::database::{apps, emails};
use crate::error::{Result, WebhookError};
use crate::metrics::Metrics;

pub const MAX_ATTEMPTS: i32 = 5;

/// Backoff between delivery attempts: 1m, 5m, 30m, 2h, 24h.
pub const RETRY_DELAYS_SECS: [i64; 5] = [60, 300, 1800, 7200, 86400];

const POST_TIMEOUT: StdDuration = StdDuration::from_secs(10);

/// Broker payload for one delivery attempt.
#[derive(Debug, Serialize, Deserialize)]
pub struct WebhookJob {
    pub delivery_id: Uuid,
}

/// Builds, signs and posts outbound webhooks, at-least-once. Each observable
/// email event becomes one `webhook_deliveries` row plus one broker job; the
/// row is the retry ledger, the job is just a wake-up.
pub struct WebhookDispatcher {
    db: Arc<DatabaseConnection>,
    broker: Arc<QueueBroker>,
    crypto: EncryptionService,
    metrics: Arc<Metrics>,
    client: reqwest::Client,
}

impl WebhookDispatcher {
    pub fn new(
        db: Arc<DatabaseConnection>,
        broker: Arc<QueueBroker>,
        crypto: EncryptionService,
        metrics: Arc<Metrics>,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(POST_TIMEOUT)
            .user_agent(concat!("mailroom-webhook/", env!("CARGO_PKG_VERSION")))
            .build()
            .expect("reqwest client builds");
        Self {
            db,
            broker,
            crypto,
            metrics,
            client,
        }
    }

    /// Snapshot an event into a pending delivery and queue the first attempt.
    /// No-op for apps without a webhook URL.
    pub async fn record_event(
        &self,
        app: &apps::Model,
        queue_name: Option<&str>,
        email: Option<&emails::Model>,
        event: &EventData,
    ) -> Result<()> {
        if app.webhook_url.is_none() {
            return Ok(());
        }

        let event_type = format!("email.{}", event.event_type());
        let payload = build_payload(app, queue_name, email, event, &event_type);

        let now = Utc::now();
        let delivery_id = Uuid::now_v7();
        let delivery = webhook_deliveries::ActiveModel {
            id: Set(delivery_id),
            app_id: Set(app.id),
            email_id: Set(email.map(|e| e.id)),
            event_type: Set(event_type),
            payload: Set(payload),
            status: Set(DeliveryStatus::Pending.to_string()),
            attempts: Set(0),
            last_error: Set(None),
            next_retry_at: Set(None),
            delivered_at: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
        };
        delivery.insert(&*self.db).await?;

        self.broker
            .enqueue(
                WEBHOOK_QUEUE,
                serde_json::to_value(WebhookJob { delivery_id })?,
                EnqueueOptions::default(),
            )
            .await?;
        Ok(())
    }

    /// One delivery attempt. Permanent failures (SSRF block, missing secret)
    /// settle the row immediately; transport failures schedule the next
    /// attempt through `next_retry_at` and the sweeper.
    pub async fn process_delivery(&self, delivery_id: Uuid) -> Result<()> {
        let Some(delivery) = WebhookDeliveries::find_by_id(delivery_id)
            .one(&*self.db)
            .await?
        else {
            tracing::warn!(delivery_id = %delivery_id, "webhook delivery row vanished, dropping job");
            return Ok(());
        };

        // Re-delivered broker jobs after a settle are acked silently
        if delivery.status != DeliveryStatus::Pending.to_string() {
            return Ok(());
        }

        let Some(app) = apps::Entity::find_by_id(delivery.app_id).one(&*self.db).await? else {
            return self
                .settle_failed(delivery, "owning app no longer exists")
                .await;
        };

        let Some(url) = app.webhook_url.clone() else {
            return self.settle_failed(delivery, "app has no webhook url").await;
        };

        let url = match ssrf::validate_webhook_url(&url).await {
            Ok(url) => url,
            Err(e @ WebhookError::BlockedUrl(_)) => {
                tracing::warn!(
                    delivery_id = %delivery.id,
                    app_id = %app.id,
                    "webhook url rejected: {e}"
                );
                return self.settle_failed(delivery, &e.to_string()).await;
            }
            Err(e) => return self.attempt_failed(delivery, &e.to_string()).await,
        };

        let Some(secret_enc) = app.webhook_secret_enc.as_deref() else {
            return self
                .settle_failed(delivery, "app has no webhook secret")
                .await;
        };
        let secret = self.crypto.decrypt(secret_enc)?;

        let body = serde_json::to_string(&delivery.payload)?;
        let timestamp = Utc::now().timestamp();
        let signature = signing::sign(&secret, timestamp, &body);

        let response = self
            .client
            .post(url)
            .header("Content-Type", "application/json")
            .header("X-Webhook-Signature", signature)
            .header("X-Webhook-Timestamp", timestamp.to_string())
            .body(body)
            .send()
            .await;

        match response {
            Ok(resp) if resp.status().is_success() => {
                let now = Utc::now();
                let attempts = delivery.attempts + 1;
                let mut active: webhook_deliveries::ActiveModel = delivery.into();
                active.status = Set(DeliveryStatus::Delivered.to_string());
                active.attempts = Set(attempts);
                active.delivered_at = Set(Some(now));
                active.next_retry_at = Set(None);
                active.updated_at = Set(now);
                active.update(&*self.db).await?;
                self.metrics
                    .webhook_deliveries_total
                    .with_label_values(&["delivered"])
                    .inc();
                Ok(())
            }
            Ok(resp) => {
                self.attempt_failed(delivery, &format!("http status {}", resp.status().as_u16()))
                    .await
            }
            Err(e) => {
                let reason = if e.is_timeout() {
                    "request timed out".to_string()
                } else {
                    format!("network error: {e}")
                };
                self.attempt_failed(delivery, &reason).await
            }
        }
    }

    async fn attempt_failed(
        &self,
        delivery: webhook_deliveries::Model,
        error: &str,
    ) -> Result<()> {
        let now = Utc::now();
        let attempts = delivery.attempts + 1;
        let mut active: webhook_deliveries::ActiveModel = delivery.into();
        active.attempts = Set(attempts);
        active.last_error = Set(Some(error.to_string()));
        active.updated_at = Set(now);

        if attempts < MAX_ATTEMPTS {
            let delay = RETRY_DELAYS_SECS[(attempts as usize - 1).min(RETRY_DELAYS_SECS.len() - 1)];
            active.next_retry_at = Set(Some(now + Duration::seconds(delay)));
            self.metrics
                .webhook_deliveries_total
                .with_label_values(&["retried"])
                .inc();
        } else {
            active.status = Set(DeliveryStatus::Failed.to_string());
            active.next_retry_at = Set(None);
            self.metrics
                .webhook_deliveries_total
                .with_label_values(&["failed"])
                .inc();
        }
        active.update(&*self.db).await?;
        Ok(())
    }

    async fn settle_failed(
        &self,
        delivery: webhook_deliveries::Model,
        error: &str,
    ) -> Result<()> {
        let now = Utc::now();
        let mut active: webhook_deliveries::ActiveModel = delivery.into();
        active.status = Set(DeliveryStatus::Failed.to_string());
        active.last_error = Set(Some(error.to_string()));
        active.next_retry_at = Set(None);
        active.updated_at = Set(now);
        active.update(&*self.db).await?;
        self.metrics
            .webhook_deliveries_total
            .with_label_values(&["failed"])
            .inc();
        Ok(())
    }

    /// Queues a fresh attempt for every pending row whose retry deadline has
    /// passed. `next_retry_at` is pushed forward as a re-arm guard so a
    /// delivery is never double-enqueued by overlapping sweeps.
    pub async fn sweep_due(&self) -> Result<u64> {
        let now = Utc::now();
        let due = WebhookDeliveries::find()
            .filter(webhook_deliveries::Column::Status.eq(DeliveryStatus::Pending.to_string()))
            .filter(webhook_deliveries::Column::NextRetryAt.lte(now))
            .order_by_asc(webhook_deliveries::Column::NextRetryAt)
            .limit(100)
            .all(&*self.db)
            .await?;

        let mut released = 0;
        for delivery in due {
            let delivery_id = delivery.id;
            let mut active: webhook_deliveries::ActiveModel = delivery.into();
            active.next_retry_at = Set(Some(now + Duration::minutes(10)));
            active.updated_at = Set(now);
            active.update(&*self.db).await?;

            self.broker
                .enqueue(
                    WEBHOOK_QUEUE,
                    serde_json::to_value(WebhookJob { delivery_id })?,
                    EnqueueOptions::default(),
                )
                .await?;
            released += 1;
        }
        Ok(released)
    }

    /// Operator-triggered replay of a settled delivery.
    pub async fn requeue(&self, delivery_id: Uuid) -> Result<()> {
        let Some(delivery) = WebhookDeliveries::find_by_id(delivery_id)
            .one(&*self.db)
            .await?
        else {
            return Err(crate::error::MailroomError::Internal(format!(
                "webhook delivery {delivery_id} not found"
            )));
        };

        let now = Utc::now();
        let mut active: webhook_deliveries::ActiveModel = delivery.into();
        active.status = Set(DeliveryStatus::Pending.to_string());
        active.next_retry_at = Set(Some(now + Duration::minutes(10)));
        active.updated_at = Set(now);
        active.update(&*self.db).await?;

        self.broker
            .enqueue(
                WEBHOOK_QUEUE,
                serde_json::to_value(WebhookJob { delivery_id })?,
                EnqueueOptions::default(),
            )
            .await?;
        Ok(())
    }
}

/// Wire payload per delivery. Receivers deduplicate on `id`.
fn build_payload(
    app: &apps::Model,
    queue_name: Option<&str>,
    email: Option<&emails::Model>,
    event: &EventData,
    event_type: &str,
) -> serde_json::Value {
    let data = match email {
        Some(email) => serde_json::json!({
            "emailId": email.id,
            "messageId": email.message_id,
            "appId": app.id,
            "queueName": queue_name,
            "from": email.from_email,
            "to": email.to,
            "subject": email.subject,
            "status": email.status,
            "metadata": email.metadata,
            "event": event,
        }),
        None => serde_json::json!({
            "appId": app.id,
            "queueName": queue_name,
            "event": event,
        }),
    };

    serde_json::json!({
        "id": Uuid::new_v4(),
        "type": event_type,
        "timestamp": Utc::now().to_rfc3339(),
        "data": data,
    })
}

/// Consumes webhook jobs off the broker. Small sibling of the email worker
/// pool; attempts settle through the delivery row, so broker jobs complete
/// after a single try.
pub struct WebhookWorkerPool {
    dispatcher: Arc<WebhookDispatcher>,
    broker: Arc<QueueBroker>,
    is_running: Arc<AtomicBool>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl WebhookWorkerPool {
    pub fn new(dispatcher: Arc<WebhookDispatcher>, broker: Arc<QueueBroker>) -> Self {
        Self {
            dispatcher,
            broker,
            is_running: Arc::new(AtomicBool::new(false)),
            handles: Mutex::new(Vec::new()),
        }
    }

    pub async fn start(&self, worker_count: usize) {
        if self.is_running.swap(true, Ordering::SeqCst) {
            tracing::warn!("webhook worker pool is already running");
            return;
        }

        let mut handles = self.handles.lock().await;
        for i in 0..worker_count {
            let worker_id = format!("webhook-worker-{i}");
            let dispatcher = self.dispatcher.clone();
            let broker = self.broker.clone();
            let is_running = self.is_running.clone();

            handles.push(tokio::spawn(async move {
                tracing::info!("{worker_id} started");
                while is_running.load(Ordering::SeqCst) {
                    let job = match broker.reserve(WEBHOOK_QUEUE, 60_000, &worker_id).await {
                        Ok(job) => job,
                        Err(e) => {
                            tracing::error!("{worker_id} reserve failed: {e}");
                            tokio::time::sleep(StdDuration::from_secs(1)).await;
                            continue;
                        }
                    };

                    let Some(job) = job else {
                        tokio::time::sleep(StdDuration::from_millis(500)).await;
                        continue;
                    };

                    let parsed: std::result::Result<WebhookJob, _> =
                        serde_json::from_value(job.payload.clone());
                    let outcome = match parsed {
                        Ok(webhook_job) => {
                            dispatcher.process_delivery(webhook_job.delivery_id).await
                        }
                        Err(e) => {
                            tracing::error!(job_id = %job.id, "malformed webhook job payload: {e}");
                            Ok(())
                        }
                    };

                    match outcome {
                        Ok(()) => {
                            if let Err(e) = broker.complete(job.id).await {
                                tracing::error!(job_id = %job.id, "failed to complete webhook job: {e}");
                            }
                        }
                        Err(e) => {
                            // Internal failure (db etc.); a short broker-side
                            // retry keeps the attempt ledger untouched.
                            let decision = if job.attempts < 3 {
                                RetryDecision::Retry { delay_secs: 30 }
                            } else {
                                RetryDecision::Discard
                            };
                            if let Err(fail_err) =
                                broker.fail(job.id, &e.to_string(), decision).await
                            {
                                tracing::error!(job_id = %job.id, "failed to fail webhook job: {fail_err}");
                            }
                        }
                    }
                }
                tracing::info!("{worker_id} stopped");
            }));
        }
        tracing::info!("webhook worker pool started with {} workers", handles.len());
    }

    pub async fn shutdown(&self) {
        self.is_running.store(false, Ordering::SeqCst);
        let mut handles = self.handles.lock().await;
        for handle in handles.drain(..) {
            if tokio::time::timeout(StdDuration::from_secs(10), handle)
                .await
                .is_err()
            {
                tracing::warn!("webhook worker shutdown timed out");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn app() -> apps::Model {
        apps::Model {
            id: Uuid::now_v7(),
            account_id: None,
            name: "acme".to_string(),
            active: true,
            sandbox: false,
            webhook_url: Some("https://hooks.example.com/in".to_string()),
            webhook_secret_enc: None,
            daily_quota: None,
            monthly_quota: None,
            settings: serde_json::json!({}),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_payload_shape() {
        let app = app();
        let event = EventData::Sent {
            message_id: "<m@relay>".to_string(),
            accepted: vec!["b@y.io".to_string()],
            rejected: vec![],
        };
        let payload = build_payload(&app, Some("transactional"), None, &event, "email.sent");

        assert_eq!(payload["type"], "email.sent");
        assert!(payload["id"].as_str().is_some());
        assert!(payload["timestamp"].as_str().is_some());
        assert_eq!(payload["data"]["queueName"], "transactional");
        assert_eq!(payload["data"]["event"]["type"], "sent");
    }

    #[test]
    fn test_retry_delay_table_matches_max_attempts() {
        assert_eq!(RETRY_DELAYS_SECS.len(), MAX_ATTEMPTS as usize);
        // Monotonic backoff
        assert!(RETRY_DELAYS_SECS.windows(2).all(|w| w[0] < w[1]));
    }
}
