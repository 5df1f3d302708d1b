use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::Json;
use axum::routing::{get, post};
use axum::{Extension, Router};
use chrono::{DateTime, Utc};
use sea_orm::{ColumnTrait, EntityTrait, QueryFilter};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::admission::{AuthContext, BatchSendRequest, SendEmailRequest};
use crate::api::error::{ApiError, ApiResult};
use crate::broker::{EnqueueOptions, EMAIL_QUEUE};
use crate::admission::EmailJob;
use crate::database::emails::{self, EmailStatus, Entity as Emails};
use crate::database::queues::{self, Entity as Queues};
use crate::utils::cursor::Cursor;
use crate::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/emails", post(submit_email).get(list_emails))
        .route("/emails/batch", post(submit_batch))
        .route(
            "/emails/:id",
            get(get_email).delete(cancel_email),
        )
        .route("/emails/:id/events", get(list_email_events))
        .route("/emails/:id/retry", post(retry_email))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct EmailResponse {
    id: Uuid,
    queue_id: Uuid,
    status: String,
    from: Value,
    to: Value,
    cc: Value,
    bcc: Value,
    subject: String,
    message_id: Option<String>,
    retry_count: i32,
    last_error: Option<String>,
    metadata: Value,
    scheduled_at: Option<DateTime<Utc>>,
    sent_at: Option<DateTime<Utc>>,
    delivered_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

impl From<emails::Model> for EmailResponse {
    fn from(m: emails::Model) -> Self {
        Self {
            id: m.id,
            queue_id: m.queue_id,
            status: m.status,
            from: json!({"email": m.from_email, "name": m.from_name}),
            to: m.to,
            cc: m.cc,
            bcc: m.bcc,
            subject: m.subject,
            message_id: m.message_id,
            retry_count: m.retry_count,
            last_error: m.last_error,
            metadata: m.metadata,
            scheduled_at: m.scheduled_at,
            sent_at: m.sent_at,
            delivered_at: m.delivered_at,
            created_at: m.created_at,
        }
    }
}

async fn submit_email(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    headers: HeaderMap,
    Json(request): Json<SendEmailRequest>,
) -> ApiResult<(StatusCode, HeaderMap, Json<Value>)> {
    let idempotency_key = headers
        .get("idempotency-key")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string());

    let outcome = state
        .admission
        .submit(&ctx, request, idempotency_key)
        .await?;

    let mut response_headers = HeaderMap::new();
    if outcome.replayed {
        response_headers.insert("x-idempotency-replayed", "true".parse().unwrap());
    }

    let body = json!({
        "id": outcome.email.id,
        "status": outcome.email.status,
        "queuedAt": outcome.email.created_at,
    });
    Ok((StatusCode::CREATED, response_headers, Json(body)))
}

async fn submit_batch(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Json(request): Json<BatchSendRequest>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let outcome = state.admission.submit_batch(&ctx, request).await?;
    let status = if outcome.queued_count > 0 {
        StatusCode::CREATED
    } else {
        StatusCode::BAD_REQUEST
    };
    Ok((status, Json(serde_json::to_value(outcome).unwrap_or_default())))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListQuery {
    status: Option<String>,
    cursor: Option<String>,
    limit: Option<u64>,
}

async fn list_emails(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Json<Value>> {
    let status = match &query.status {
        Some(raw) => Some(
            EmailStatus::parse(raw)
                .ok_or_else(|| ApiError::bad_request(format!("unknown status '{raw}'")))?,
        ),
        None => None,
    };
    let cursor = match &query.cursor {
        Some(raw) => Some(Cursor::decode(raw).map_err(ApiError::from)?),
        None => None,
    };
    let limit = query.limit.unwrap_or(50).clamp(1, 200);

    let (page, next) = state
        .state_store
        .list_emails(ctx.app.id, status, cursor, limit)
        .await?;

    Ok(Json(json!({
        "data": page.into_iter().map(EmailResponse::from).collect::<Vec<_>>(),
        "nextCursor": next.map(|c| c.encode()),
    })))
}

async fn load_scoped_email(
    state: &AppState,
    ctx: &AuthContext,
    id: Uuid,
) -> ApiResult<emails::Model> {
    Emails::find_by_id(id)
        .filter(emails::Column::AppId.eq(ctx.app.id))
        .one(&*state.db)
        .await
        .map_err(|e| ApiError::from(crate::error::MailroomError::from(e)))?
        .ok_or_else(|| ApiError::not_found(format!("email {id} not found")))
}

async fn get_email(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<EmailResponse>> {
    let email = load_scoped_email(&state, &ctx, id).await?;
    Ok(Json(email.into()))
}

async fn list_email_events(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Value>> {
    let email = load_scoped_email(&state, &ctx, id).await?;
    let events = state.state_store.list_events(email.id).await?;
    Ok(Json(json!({
        "data": events
            .into_iter()
            .map(|e| json!({
                "id": e.id,
                "type": e.event_type,
                "data": e.event_data,
                "createdAt": e.created_at,
            }))
            .collect::<Vec<_>>(),
    })))
}

/// Cancel is only legal while the email still sits in `queued`; the broker
/// job is dropped by the worker's status guard.
async fn cancel_email(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<EmailResponse>> {
    let email = load_scoped_email(&state, &ctx, id).await?;
    let queue = load_queue(&state, email.queue_id).await?;
    let cancelled = state
        .state_store
        .mark_cancelled(&ctx.app, &queue, email)
        .await
        .map_err(|e| match e {
            crate::error::MailroomError::InvalidTransition { from, .. } => ApiError::conflict(
                format!("only queued emails can be cancelled (status is {from})"),
            ),
            other => other.into(),
        })?;
    Ok(Json(cancelled.into()))
}

async fn retry_email(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<EmailResponse>> {
    let email = load_scoped_email(&state, &ctx, id).await?;
    let queue = load_queue(&state, email.queue_id).await?;

    let requeued = state
        .state_store
        .retry_failed(&ctx.app, &queue, email)
        .await?;

    state
        .broker
        .enqueue(
            EMAIL_QUEUE,
            serde_json::to_value(EmailJob {
                email_id: requeued.id,
            })
            .map_err(|e| ApiError::from(crate::error::MailroomError::from(e)))?,
            EnqueueOptions {
                priority: Some(queue.priority),
                delay_ms: None,
                job_id: None,
            },
        )
        .await?;

    Ok(Json(requeued.into()))
}

async fn load_queue(state: &AppState, queue_id: Uuid) -> ApiResult<queues::Model> {
    Queues::find_by_id(queue_id)
        .one(&*state.db)
        .await
        .map_err(|e| ApiError::from(crate::error::MailroomError::from(e)))?
        .ok_or_else(|| ApiError::not_found(format!("queue {queue_id} not found")))
}
