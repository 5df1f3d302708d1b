pub mod validation;

use chrono::{DateTime, Utc};
use sea_orm::{
    ActiveModelBehavior, ColumnTrait, Condition, DatabaseConnection, DbErr, EntityTrait, QueryFilter, RuntimeErr, Set,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::broker::{EnqueueOptions, QueueBroker, EMAIL_QUEUE};
use crate::database::emails::{self, Entity as Emails};
use crate::database::queues::{self, Entity as Queues};
use crate::database::suppressions::{self, Entity as Suppressions};
use crate::database::{api_keys, apps};
use crate::error::{MailroomError, Result};
use crate::metrics::Metrics;
use crate::ratelimit::RateLimiter;
use crate::state::EmailStateStore;
use validation::{
    validate_bodies, validate_email_address, validate_html_safety, validate_queue_name,
    validate_subject, MAX_BATCH_ENTRIES, MAX_RECIPIENTS_PER_FIELD,
};

/// Authenticated caller identity, resolved by the HTTP layer before
/// admission runs.
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub app: apps::Model,
    pub api_key: Option<api_keys::Model>,
    pub is_admin: bool,
}

impl AuthContext {
    /// Scope gate for API-key callers. Admin and internal callers (no key)
    /// pass; keys need the named scope or the `*` wildcard.
    pub fn require_scope(&self, scope: &str) -> Result<()> {
        if self.is_admin {
            return Ok(());
        }
        let Some(key) = &self.api_key else {
            return Ok(());
        };
        let scopes: Vec<String> = serde_json::from_value(key.scopes.clone()).unwrap_or_default();
        if scopes.iter().any(|s| s == scope || s == "*") {
            Ok(())
        } else {
            Err(MailroomError::Forbidden(format!(
                "api key is missing the '{scope}' scope"
            )))
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct EmailAddressInput {
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// Single-send payload for `POST /v1/emails`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendEmailRequest {
    pub queue: String,
    pub from: EmailAddressInput,
    pub to: Vec<EmailAddressInput>,
    #[serde(default)]
    pub cc: Vec<EmailAddressInput>,
    #[serde(default)]
    pub bcc: Vec<EmailAddressInput>,
    #[serde(default)]
    pub reply_to: Option<EmailAddressInput>,
    pub subject: String,
    #[serde(default)]
    pub html: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub personalization: serde_json::Value,
    #[serde(default)]
    pub metadata: serde_json::Value,
    #[serde(default)]
    pub scheduled_at: Option<DateTime<Utc>>,
}

/// Batch payload: shared envelope plus per-recipient entries.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchSendRequest {
    pub queue: String,
    pub from: EmailAddressInput,
    pub subject: String,
    #[serde(default)]
    pub html: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
    pub emails: Vec<BatchEntry>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchEntry {
    pub to: Vec<EmailAddressInput>,
    #[serde(default)]
    pub cc: Vec<EmailAddressInput>,
    #[serde(default)]
    pub bcc: Vec<EmailAddressInput>,
    #[serde(default)]
    pub personalization: serde_json::Value,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

#[derive(Debug)]
pub struct SubmitOutcome {
    pub email: emails::Model,
    pub replayed: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchOutcome {
    pub total_count: usize,
    pub queued_count: usize,
    pub failed_count: usize,
    pub email_ids: Vec<Uuid>,
    pub errors: Vec<BatchEntryError>,
}

#[derive(Debug, Serialize)]
pub struct BatchEntryError {
    pub index: usize,
    pub code: &'static str,
    pub message: String,
}

/// Broker payload for one delivery job.
#[derive(Debug, Serialize, Deserialize)]
pub struct EmailJob {
    pub email_id: Uuid,
}

/// Front door of the send pipeline: validation, queue resolution,
/// idempotency, hierarchical rate limiting, suppression filtering, and the
/// queued-email persist + enqueue.
pub struct AdmissionController {
    db: Arc<DatabaseConnection>,
    state: Arc<EmailStateStore>,
    broker: Arc<QueueBroker>,
    limiter: Arc<RateLimiter>,
    metrics: Arc<Metrics>,
    global_rate_limit: u32,
}

impl AdmissionController {
    pub fn new(
        db: Arc<DatabaseConnection>,
        state: Arc<EmailStateStore>,
        broker: Arc<QueueBroker>,
        limiter: Arc<RateLimiter>,
        metrics: Arc<Metrics>,
        global_rate_limit: u32,
    ) -> Self {
        Self {
            db,
            state,
            broker,
            limiter,
            metrics,
            global_rate_limit,
        }
    }

    pub async fn submit(
        &self,
        ctx: &AuthContext,
        req: SendEmailRequest,
        idempotency_key: Option<String>,
    ) -> Result<SubmitOutcome> {
        ctx.require_scope("emails:send")?;
        validate_send_request(&req)?;

        let queue = self.resolve_queue(ctx.app.id, &req.queue).await?;

        // Idempotent replay before limits are consumed: the first submission
        // already paid for its tokens.
        if let Some(key) = &idempotency_key {
            if let Some(existing) = self.find_by_idempotency_key(ctx.app.id, key).await? {
                return Ok(SubmitOutcome {
                    email: existing,
                    replayed: true,
                });
            }
        }

        self.enforce_rate_limits(ctx, &queue).await?;
        self.enforce_suppressions(ctx.app.id, &req.to, &req.cc, &req.bcc)
            .await?;

        let email = self
            .persist_and_enqueue(ctx, &queue, &req, idempotency_key.clone())
            .await?;
        match email {
            PersistResult::Created(email) => Ok(SubmitOutcome {
                email,
                replayed: false,
            }),
            PersistResult::Replayed(email) => Ok(SubmitOutcome {
                email,
                replayed: true,
            }),
        }
    }

    /// Batch submission. Auth, queue resolution and rate limiting run once;
    /// recipient validation, suppression and the persist run per entry with
    /// per-index error reporting.
    pub async fn submit_batch(
        &self,
        ctx: &AuthContext,
        req: BatchSendRequest,
    ) -> Result<BatchOutcome> {
        ctx.require_scope("emails:send")?;

        let mut shared_errors = Vec::new();
        if let Err(msg) = validate_queue_name(&req.queue) {
            shared_errors.push(("queue".to_string(), msg));
        }
        if let Err(msg) = validate_email_address(&req.from.email) {
            shared_errors.push(("from.email".to_string(), msg));
        }
        if let Err(msg) = validate_subject(&req.subject) {
            shared_errors.push(("subject".to_string(), msg));
        }
        if let Err(msg) = validate_bodies(req.html.as_deref(), req.text.as_deref()) {
            shared_errors.push(("html".to_string(), msg));
        }
        if let Some(html) = &req.html {
            if let Err(msg) = validate_html_safety(html) {
                shared_errors.push(("html".to_string(), msg));
            }
        }
        if req.emails.is_empty() {
            shared_errors.push(("emails".to_string(), "batch is empty".to_string()));
        }
        if req.emails.len() > MAX_BATCH_ENTRIES {
            shared_errors.push((
                "emails".to_string(),
                format!("batch exceeds {MAX_BATCH_ENTRIES} entries"),
            ));
        }
        if !shared_errors.is_empty() {
            return Err(MailroomError::PayloadInvalid {
                errors: shared_errors,
            });
        }

        let queue = self.resolve_queue(ctx.app.id, &req.queue).await?;
        self.enforce_rate_limits(ctx, &queue).await?;

        let mut outcome = BatchOutcome {
            total_count: req.emails.len(),
            queued_count: 0,
            failed_count: 0,
            email_ids: Vec::new(),
            errors: Vec::new(),
        };

        for (index, entry) in req.emails.iter().enumerate() {
            let single = SendEmailRequest {
                queue: req.queue.clone(),
                from: req.from.clone(),
                to: entry.to.clone(),
                cc: entry.cc.clone(),
                bcc: entry.bcc.clone(),
                reply_to: None,
                subject: req.subject.clone(),
                html: req.html.clone(),
                text: req.text.clone(),
                headers: HashMap::new(),
                personalization: entry.personalization.clone(),
                metadata: entry.metadata.clone(),
                scheduled_at: None,
            };

            let result = async {
                validate_send_request(&single)?;
                self.enforce_suppressions(ctx.app.id, &single.to, &single.cc, &single.bcc)
                    .await?;
                self.persist_and_enqueue(ctx, &queue, &single, None).await
            }
            .await;

            match result {
                Ok(PersistResult::Created(email)) | Ok(PersistResult::Replayed(email)) => {
                    outcome.queued_count += 1;
                    outcome.email_ids.push(email.id);
                }
                Err(e) => {
                    outcome.failed_count += 1;
                    outcome.errors.push(BatchEntryError {
                        index,
                        code: e.code(),
                        message: e.to_string(),
                    });
                }
            }
        }

        Ok(outcome)
    }

    async fn resolve_queue(&self, app_id: Uuid, name: &str) -> Result<queues::Model> {
        let queue = Queues::find()
            .filter(queues::Column::AppId.eq(app_id))
            .filter(queues::Column::Name.eq(name))
            .one(&*self.db)
            .await?
            .ok_or_else(|| MailroomError::QueueNotFound(name.to_string()))?;

        if queue.paused {
            return Err(MailroomError::QueuePaused(queue.name.clone()));
        }
        Ok(queue)
    }

    async fn find_by_idempotency_key(
        &self,
        app_id: Uuid,
        key: &str,
    ) -> Result<Option<emails::Model>> {
        Ok(Emails::find()
            .filter(emails::Column::AppId.eq(app_id))
            .filter(emails::Column::IdempotencyKey.eq(key))
            .one(&*self.db)
            .await?)
    }

    async fn enforce_rate_limits(&self, ctx: &AuthContext, queue: &queues::Model) -> Result<()> {
        let api_key_limit = ctx
            .api_key
            .as_ref()
            .and_then(|k| k.rate_limit)
            .map(|l| l as u32)
            .unwrap_or(self.global_rate_limit);

        let hit = self
            .limiter
            .check_submission(
                ctx.api_key.as_ref().map(|k| k.id),
                api_key_limit,
                ctx.app.id,
                ctx.app.daily_quota,
                queue.id,
                queue.rate_limit,
            )
            .await;

        if let Some(hit) = hit {
            self.metrics
                .rate_limited_total
                .with_label_values(&[hit.scope.as_str()])
                .inc();
            return Err(MailroomError::RateLimited {
                scope: hit.scope.as_str().to_string(),
                retry_after_secs: hit.decision.retry_after_secs(),
                limit: hit.decision.limit,
                reset_at_unix: hit.decision.reset_at.timestamp(),
            });
        }
        Ok(())
    }

    /// Blocks the submission when any recipient carries a live suppression
    /// for this tenant or globally; reports the first match in recipient
    /// order.
    async fn enforce_suppressions(
        &self,
        app_id: Uuid,
        to: &[EmailAddressInput],
        cc: &[EmailAddressInput],
        bcc: &[EmailAddressInput],
    ) -> Result<()> {
        let recipients: Vec<String> = to
            .iter()
            .chain(cc.iter())
            .chain(bcc.iter())
            .map(|a| a.email.to_lowercase())
            .collect();

        let now = Utc::now();
        let matches = Suppressions::find()
            .filter(suppressions::Column::Email.is_in(recipients.clone()))
            .filter(
                Condition::any()
                    .add(suppressions::Column::AppId.eq(app_id))
                    .add(suppressions::Column::AppId.is_null()),
            )
            .filter(
                Condition::any()
                    .add(suppressions::Column::ExpiresAt.is_null())
                    .add(suppressions::Column::ExpiresAt.gt(now)),
            )
            .all(&*self.db)
            .await?;

        if matches.is_empty() {
            return Ok(());
        }

        for recipient in &recipients {
            if let Some(hit) = matches.iter().find(|s| &s.email == recipient) {
                self.metrics.suppressed_total.inc();
                return Err(MailroomError::Suppressed {
                    address: hit.email.clone(),
                    reason: hit.reason.clone(),
                });
            }
        }
        Ok(())
    }

    async fn persist_and_enqueue(
        &self,
        ctx: &AuthContext,
        queue: &queues::Model,
        req: &SendEmailRequest,
        idempotency_key: Option<String>,
    ) -> Result<PersistResult> {
        let active = emails::ActiveModel {
            app_id: Set(ctx.app.id),
            queue_id: Set(queue.id),
            idempotency_key: Set(idempotency_key.clone()),
            from_email: Set(req.from.email.clone()),
            from_name: Set(req.from.name.clone()),
            to: Set(serde_json::to_value(&req.to)?),
            cc: Set(serde_json::to_value(&req.cc)?),
            bcc: Set(serde_json::to_value(&req.bcc)?),
            reply_to: Set(req.reply_to.as_ref().map(|a| a.email.clone())),
            subject: Set(req.subject.clone()),
            html_body: Set(req.html.clone()),
            text_body: Set(req.text.clone()),
            headers: Set(serde_json::to_value(&req.headers)?),
            personalization: Set(normalize_map(&req.personalization)),
            metadata: Set(normalize_map(&req.metadata)),
            scheduled_at: Set(req.scheduled_at),
            ..emails::ActiveModel::new()
        };

        let email = match self.state.create_queued_email(&ctx.app, queue, active).await {
            Ok(email) => email,
            Err(MailroomError::Database(db_err)) if is_unique_violation(&db_err) => {
                // Two submissions raced on the same idempotency key; the
                // loser replays the winner's row.
                if let Some(key) = &idempotency_key {
                    if let Some(existing) = self.find_by_idempotency_key(ctx.app.id, key).await? {
                        return Ok(PersistResult::Replayed(existing));
                    }
                }
                return Err(MailroomError::Database(db_err));
            }
            Err(e) => return Err(e),
        };

        let delay_ms = req
            .scheduled_at
            .map(|at| (at - Utc::now()).num_milliseconds())
            .filter(|ms| *ms > 0);

        self.broker
            .enqueue(
                EMAIL_QUEUE,
                serde_json::to_value(EmailJob { email_id: email.id })?,
                EnqueueOptions {
                    priority: Some(queue.priority),
                    delay_ms,
                    job_id: None,
                },
            )
            .await?;

        Ok(PersistResult::Created(email))
    }
}

enum PersistResult {
    Created(emails::Model),
    Replayed(emails::Model),
}

fn normalize_map(value: &serde_json::Value) -> serde_json::Value {
    if value.is_object() {
        value.clone()
    } else {
        serde_json::json!({})
    }
}

fn is_unique_violation(err: &DbErr) -> bool {
    match err {
        DbErr::Query(RuntimeErr::SqlxError(e)) | DbErr::Exec(RuntimeErr::SqlxError(e)) => {
            let msg = e.to_string();
            msg.contains("UNIQUE") || msg.contains("unique") || msg.contains("duplicate key")
        }
        other => {
            let msg = other.to_string();
            msg.contains("UNIQUE") || msg.contains("unique") || msg.contains("duplicate key")
        }
    }
}

fn validate_send_request(req: &SendEmailRequest) -> Result<()> {
    let mut errors: Vec<(String, String)> = Vec::new();

    if let Err(msg) = validate_queue_name(&req.queue) {
        errors.push(("queue".to_string(), msg));
    }
    if let Err(msg) = validate_email_address(&req.from.email) {
        errors.push(("from.email".to_string(), msg));
    }
    if let Some(reply_to) = &req.reply_to {
        if let Err(msg) = validate_email_address(&reply_to.email) {
            errors.push(("replyTo.email".to_string(), msg));
        }
    }

    if req.to.is_empty() {
        errors.push(("to".to_string(), "at least one recipient is required".to_string()));
    }
    for (field, list) in [("to", &req.to), ("cc", &req.cc), ("bcc", &req.bcc)] {
        if list.len() > MAX_RECIPIENTS_PER_FIELD {
            errors.push((
                field.to_string(),
                format!("exceeds {MAX_RECIPIENTS_PER_FIELD} recipients"),
            ));
        }
        for (i, addr) in list.iter().enumerate() {
            if let Err(msg) = validate_email_address(&addr.email) {
                errors.push((format!("{field}[{i}].email"), msg));
            }
        }
    }

    if let Err(msg) = validate_subject(&req.subject) {
        errors.push(("subject".to_string(), msg));
    }
    if let Err(msg) = validate_bodies(req.html.as_deref(), req.text.as_deref()) {
        errors.push(("html".to_string(), msg));
    }
    if let Some(html) = &req.html {
        if let Err(msg) = validate_html_safety(html) {
            errors.push(("html".to_string(), msg));
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(MailroomError::PayloadInvalid { errors })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::EncryptionService;
    use crate::database::establish_connection;
    use crate::webhook::WebhookDispatcher;
    use sea_orm::ActiveModelTrait;

    struct Fixture {
        controller: AdmissionController,
        ctx: AuthContext,
        broker: Arc<QueueBroker>,
        db: Arc<DatabaseConnection>,
    }

    async fn fixture() -> Fixture {
        let db = Arc::new(establish_connection("sqlite::memory:").await.unwrap());
        let metrics = Arc::new(Metrics::new());
        let broker = Arc::new(QueueBroker::new(db.clone()));
        let dispatcher = Arc::new(WebhookDispatcher::new(
            db.clone(),
            broker.clone(),
            EncryptionService::new(&[0u8; 32]),
            metrics.clone(),
        ));
        let state = Arc::new(EmailStateStore::new(db.clone(), dispatcher, metrics.clone()));
        let limiter = Arc::new(RateLimiter::disconnected());

        let app = apps::ActiveModel {
            name: Set("acme".to_string()),
            ..apps::ActiveModel::new()
        }
        .insert(&*db)
        .await
        .unwrap();
        queues::ActiveModel {
            app_id: Set(app.id),
            name: Set("transactional".to_string()),
            ..queues::ActiveModel::new()
        }
        .insert(&*db)
        .await
        .unwrap();

        let controller = AdmissionController::new(
            db.clone(),
            state,
            broker.clone(),
            limiter,
            metrics,
            600,
        );
        let ctx = AuthContext {
            app,
            api_key: None,
            is_admin: false,
        };
        Fixture {
            controller,
            ctx,
            broker,
            db,
        }
    }

    fn request() -> SendEmailRequest {
        SendEmailRequest {
            queue: "transactional".to_string(),
            from: EmailAddressInput {
                email: "a@x.io".to_string(),
                name: None,
            },
            to: vec![EmailAddressInput {
                email: "b@y.io".to_string(),
                name: None,
            }],
            cc: vec![],
            bcc: vec![],
            reply_to: None,
            subject: "hi".to_string(),
            html: None,
            text: Some("hi".to_string()),
            headers: HashMap::new(),
            personalization: serde_json::json!({}),
            metadata: serde_json::json!({}),
            scheduled_at: None,
        }
    }

    #[tokio::test]
    async fn test_happy_submit_persists_and_enqueues() {
        let f = fixture().await;
        let outcome = f.controller.submit(&f.ctx, request(), None).await.unwrap();
        assert!(!outcome.replayed);
        assert_eq!(outcome.email.status, "queued");

        let stats = f.broker.stats(EMAIL_QUEUE).await.unwrap();
        assert_eq!(stats.waiting, 1);
    }

    #[tokio::test]
    async fn test_validation_reports_paths() {
        let f = fixture().await;
        let mut req = request();
        req.to = vec![EmailAddressInput {
            email: "not-an-address".to_string(),
            name: None,
        }];
        req.subject = String::new();

        let err = f.controller.submit(&f.ctx, req, None).await.unwrap_err();
        let MailroomError::PayloadInvalid { errors } = err else {
            panic!("expected PayloadInvalid");
        };
        let paths: Vec<&str> = errors.iter().map(|(p, _)| p.as_str()).collect();
        assert!(paths.contains(&"to[0].email"));
        assert!(paths.contains(&"subject"));
    }

    #[tokio::test]
    async fn test_unknown_queue_and_paused_queue() {
        let f = fixture().await;
        let mut req = request();
        req.queue = "nope".to_string();
        assert!(matches!(
            f.controller.submit(&f.ctx, req, None).await.unwrap_err(),
            MailroomError::QueueNotFound(_)
        ));

        let queue = Queues::find()
            .filter(queues::Column::AppId.eq(f.ctx.app.id))
            .one(&*f.db)
            .await
            .unwrap()
            .unwrap();
        let mut active: queues::ActiveModel = queue.into();
        active.paused = Set(true);
        active.update(&*f.db).await.unwrap();

        assert!(matches!(
            f.controller.submit(&f.ctx, request(), None).await.unwrap_err(),
            MailroomError::QueuePaused(_)
        ));
    }

    #[tokio::test]
    async fn test_idempotent_replay_returns_same_row() {
        let f = fixture().await;
        let first = f
            .controller
            .submit(&f.ctx, request(), Some("k1".to_string()))
            .await
            .unwrap();
        let second = f
            .controller
            .submit(&f.ctx, request(), Some("k1".to_string()))
            .await
            .unwrap();

        assert!(!first.replayed);
        assert!(second.replayed);
        assert_eq!(first.email.id, second.email.id);

        let count = Emails::find()
            .filter(emails::Column::AppId.eq(f.ctx.app.id))
            .all(&*f.db)
            .await
            .unwrap()
            .len();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn test_suppressed_recipient_blocks_submit() {
        let f = fixture().await;
        suppressions::ActiveModel {
            app_id: Set(Some(f.ctx.app.id)),
            email: Set("b@y.io".to_string()),
            reason: Set("manual".to_string()),
            ..suppressions::ActiveModel::new()
        }
        .insert(&*f.db)
        .await
        .unwrap();

        let err = f.controller.submit(&f.ctx, request(), None).await.unwrap_err();
        let MailroomError::Suppressed { address, reason } = err else {
            panic!("expected Suppressed");
        };
        assert_eq!(address, "b@y.io");
        assert_eq!(reason, "manual");

        // No email row was created
        assert!(Emails::find().one(&*f.db).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_expired_suppression_does_not_block() {
        let f = fixture().await;
        suppressions::ActiveModel {
            app_id: Set(Some(f.ctx.app.id)),
            email: Set("b@y.io".to_string()),
            reason: Set("soft_bounce".to_string()),
            expires_at: Set(Some(Utc::now() - chrono::Duration::hours(1))),
            ..suppressions::ActiveModel::new()
        }
        .insert(&*f.db)
        .await
        .unwrap();

        assert!(f.controller.submit(&f.ctx, request(), None).await.is_ok());
    }

    #[tokio::test]
    async fn test_global_suppression_applies_to_any_tenant() {
        let f = fixture().await;
        suppressions::ActiveModel {
            app_id: Set(None),
            email: Set("b@y.io".to_string()),
            reason: Set("complaint".to_string()),
            ..suppressions::ActiveModel::new()
        }
        .insert(&*f.db)
        .await
        .unwrap();

        assert!(matches!(
            f.controller.submit(&f.ctx, request(), None).await.unwrap_err(),
            MailroomError::Suppressed { .. }
        ));
    }

    #[tokio::test]
    async fn test_scheduled_send_is_delayed() {
        let f = fixture().await;
        let mut req = request();
        req.scheduled_at = Some(Utc::now() + chrono::Duration::hours(1));
        f.controller.submit(&f.ctx, req, None).await.unwrap();

        let stats = f.broker.stats(EMAIL_QUEUE).await.unwrap();
        assert_eq!(stats.delayed, 1);
        assert_eq!(stats.waiting, 0);
    }

    #[tokio::test]
    async fn test_batch_reports_per_index_errors() {
        let f = fixture().await;
        suppressions::ActiveModel {
            app_id: Set(Some(f.ctx.app.id)),
            email: Set("blocked@y.io".to_string()),
            reason: Set("hard_bounce".to_string()),
            ..suppressions::ActiveModel::new()
        }
        .insert(&*f.db)
        .await
        .unwrap();

        let batch = BatchSendRequest {
            queue: "transactional".to_string(),
            from: EmailAddressInput {
                email: "a@x.io".to_string(),
                name: None,
            },
            subject: "hello".to_string(),
            html: None,
            text: Some("hello".to_string()),
            emails: vec![
                BatchEntry {
                    to: vec![EmailAddressInput {
                        email: "ok@y.io".to_string(),
                        name: None,
                    }],
                    cc: vec![],
                    bcc: vec![],
                    personalization: serde_json::json!({}),
                    metadata: serde_json::json!({}),
                },
                BatchEntry {
                    to: vec![EmailAddressInput {
                        email: "blocked@y.io".to_string(),
                        name: None,
                    }],
                    cc: vec![],
                    bcc: vec![],
                    personalization: serde_json::json!({}),
                    metadata: serde_json::json!({}),
                },
                BatchEntry {
                    to: vec![EmailAddressInput {
                        email: "bad-address".to_string(),
                        name: None,
                    }],
                    cc: vec![],
                    bcc: vec![],
                    personalization: serde_json::json!({}),
                    metadata: serde_json::json!({}),
                },
            ],
        };

        let outcome = f.controller.submit_batch(&f.ctx, batch).await.unwrap();
        assert_eq!(outcome.total_count, 3);
        assert_eq!(outcome.queued_count, 1);
        assert_eq!(outcome.failed_count, 2);
        assert_eq!(outcome.email_ids.len(), 1);

        let codes: Vec<(usize, &str)> =
            outcome.errors.iter().map(|e| (e.index, e.code)).collect();
        assert!(codes.contains(&(1, "EMAIL_SUPPRESSED")));
        assert!(codes.contains(&(2, "VALIDATION_ERROR")));
    }
}
