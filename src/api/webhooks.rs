use axum::extract::{Path, Query, State};
use axum::response::Json;
use axum::routing::{get, post};
use axum::{Extension, Router};
use chrono::{DateTime, Utc};
use sea_orm::{ActiveModelBehavior, ActiveModelTrait, ColumnTrait, EntityTrait, QueryFilter, QueryOrder, QuerySelect, Set};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::admission::AuthContext;
use crate::api::error::{ApiError, ApiResult};
use crate::database::email_events::EventData;
use crate::database::emails::{self, EmailStatus, Entity as Emails};
use crate::database::queues::Entity as Queues;
use crate::database::reputations::{self, Entity as Reputations};
use crate::database::suppressions::{self, Entity as Suppressions, SuppressionReason};
use crate::database::webhook_deliveries::{self, Entity as WebhookDeliveries};
use crate::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/webhooks/deliveries", get(list_deliveries))
        .route("/webhooks/deliveries/:id", get(get_delivery))
        .route("/webhooks/deliveries/:id/retry", post(retry_delivery))
        .route("/events/bounce", post(ingest_bounce))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct DeliveryResponse {
    id: Uuid,
    email_id: Option<Uuid>,
    event_type: String,
    status: String,
    attempts: i32,
    last_error: Option<String>,
    next_retry_at: Option<DateTime<Utc>>,
    delivered_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

impl From<webhook_deliveries::Model> for DeliveryResponse {
    fn from(m: webhook_deliveries::Model) -> Self {
        Self {
            id: m.id,
            email_id: m.email_id,
            event_type: m.event_type,
            status: m.status,
            attempts: m.attempts,
            last_error: m.last_error,
            next_retry_at: m.next_retry_at,
            delivered_at: m.delivered_at,
            created_at: m.created_at,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListQuery {
    status: Option<String>,
    limit: Option<u64>,
    offset: Option<u64>,
}

async fn list_deliveries(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Json<Value>> {
    let mut select =
        WebhookDeliveries::find().filter(webhook_deliveries::Column::AppId.eq(ctx.app.id));
    if let Some(status) = &query.status {
        select = select.filter(webhook_deliveries::Column::Status.eq(status.clone()));
    }

    let rows = select
        .order_by_desc(webhook_deliveries::Column::CreatedAt)
        .offset(query.offset.unwrap_or(0))
        .limit(query.limit.unwrap_or(50).clamp(1, 200))
        .all(&*state.db)
        .await
        .map_err(db_err)?;

    Ok(Json(json!({
        "data": rows.into_iter().map(DeliveryResponse::from).collect::<Vec<_>>(),
    })))
}

async fn get_delivery(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Value>> {
    let row = WebhookDeliveries::find_by_id(id)
        .filter(webhook_deliveries::Column::AppId.eq(ctx.app.id))
        .one(&*state.db)
        .await
        .map_err(db_err)?
        .ok_or_else(|| ApiError::not_found(format!("webhook delivery {id} not found")))?;

    let mut body = serde_json::to_value(DeliveryResponse::from(row.clone())).unwrap_or_default();
    body["payload"] = row.payload;
    Ok(Json(body))
}

async fn retry_delivery(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Value>> {
    // Scope check before the requeue touches the row
    WebhookDeliveries::find_by_id(id)
        .filter(webhook_deliveries::Column::AppId.eq(ctx.app.id))
        .one(&*state.db)
        .await
        .map_err(db_err)?
        .ok_or_else(|| ApiError::not_found(format!("webhook delivery {id} not found")))?;

    state.dispatcher.requeue(id).await?;
    Ok(Json(json!({"success": true})))
}

/// Relay feedback ingress: delivery acknowledgments, bounces and complaints
/// reported by the downstream relay or by client POST. Updates email state,
/// writes the suppression, adjusts reputation and fans out the event.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BounceReport {
    email_id: Uuid,
    recipient: String,
    /// "delivered", "bounce" or "complaint"
    #[serde(default = "default_kind")]
    kind: String,
    code: Option<u16>,
    description: Option<String>,
    /// Hard bounces suppress permanently; soft ones expire after 72h.
    #[serde(default)]
    hard: bool,
}

fn default_kind() -> String {
    "bounce".to_string()
}

async fn ingest_bounce(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Json(report): Json<BounceReport>,
) -> ApiResult<Json<Value>> {
    let email = Emails::find_by_id(report.email_id)
        .filter(emails::Column::AppId.eq(ctx.app.id))
        .one(&*state.db)
        .await
        .map_err(db_err)?
        .ok_or_else(|| ApiError::not_found(format!("email {} not found", report.email_id)))?;
    let queue = Queues::find_by_id(email.queue_id)
        .one(&*state.db)
        .await
        .map_err(db_err)?
        .ok_or_else(|| ApiError::not_found("owning queue not found"))?;

    // Delivery acknowledgment settles the row without touching suppression
    // or reputation counters
    if report.kind == "delivered" {
        if email.status == EmailStatus::Sent.to_string() {
            state
                .state_store
                .mark_delivered(&ctx.app, &queue, email)
                .await?;
        }
        return Ok(Json(json!({"success": true})));
    }

    let is_complaint = report.kind == "complaint";

    if is_complaint {
        state
            .state_store
            .record_engagement(&ctx.app, Some(&queue.name), &email, EventData::Complained {})
            .await?;
    } else if email.status == EmailStatus::Sent.to_string() {
        state
            .state_store
            .mark_bounced(
                &ctx.app,
                &queue,
                email.clone(),
                report.code,
                report.description.clone(),
                report.hard,
            )
            .await?;
    } else {
        // Late or duplicate report: keep the history without a state change
        state
            .state_store
            .record_engagement(
                &ctx.app,
                Some(&queue.name),
                &email,
                EventData::Bounced {
                    code: report.code,
                    description: report.description.clone(),
                    hard: report.hard,
                },
            )
            .await?;
    }

    upsert_suppression(&state, &ctx, &report, email.id).await?;
    bump_reputation(&state, ctx.app.id, is_complaint).await?;

    Ok(Json(json!({"success": true})))
}

async fn upsert_suppression(
    state: &AppState,
    ctx: &AuthContext,
    report: &BounceReport,
    source_email_id: Uuid,
) -> ApiResult<()> {
    let email = report.recipient.to_lowercase();
    let exists = Suppressions::find()
        .filter(suppressions::Column::AppId.eq(ctx.app.id))
        .filter(suppressions::Column::Email.eq(email.clone()))
        .one(&*state.db)
        .await
        .map_err(db_err)?;
    if exists.is_some() {
        return Ok(());
    }

    let (reason, expires_at) = if report.kind == "complaint" {
        (SuppressionReason::Complaint, None)
    } else if report.hard {
        (SuppressionReason::HardBounce, None)
    } else {
        (
            SuppressionReason::SoftBounce,
            Some(Utc::now() + chrono::Duration::hours(72)),
        )
    };

    suppressions::ActiveModel {
        app_id: Set(Some(ctx.app.id)),
        email: Set(email),
        reason: Set(reason.to_string()),
        source_email_id: Set(Some(source_email_id)),
        expires_at: Set(expires_at),
        ..suppressions::ActiveModel::new()
    }
    .insert(&*state.db)
    .await
    .map_err(db_err)?;
    Ok(())
}

async fn bump_reputation(state: &AppState, app_id: Uuid, complaint: bool) -> ApiResult<()> {
    let now = Utc::now();
    match Reputations::find_by_id(app_id)
        .one(&*state.db)
        .await
        .map_err(db_err)?
    {
        Some(rep) => {
            let bounces = rep.bounce_count + if complaint { 0 } else { 1 };
            let complaints = rep.complaint_count + if complaint { 1 } else { 0 };
            let score = reputations::Model::recompute(rep.sent_count, bounces, complaints);
            let mut active: reputations::ActiveModel = rep.into();
            active.bounce_count = Set(bounces);
            active.complaint_count = Set(complaints);
            active.score = Set(score);
            active.updated_at = Set(now);
            active.update(&*state.db).await.map_err(db_err)?;
        }
        None => {
            reputations::ActiveModel {
                app_id: Set(app_id),
                bounce_count: Set(if complaint { 0 } else { 1 }),
                complaint_count: Set(if complaint { 1 } else { 0 }),
                ..reputations::ActiveModel::new()
            }
            .insert(&*state.db)
            .await
            .map_err(db_err)?;
        }
    }
    Ok(())
}

fn db_err(e: sea_orm::DbErr) -> ApiError {
    ApiError::from(crate::error::MailroomError::from(e))
}
