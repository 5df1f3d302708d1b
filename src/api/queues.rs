use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::Json;
use axum::routing::{get, post};
use axum::{Extension, Router};
use chrono::Utc;
use sea_orm::{ActiveModelBehavior, ActiveModelTrait, ColumnTrait, EntityTrait, PaginatorTrait, QueryFilter, QueryOrder, Set};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;
use validator::Validate;

use crate::admission::validation::validate_queue_name;
use crate::admission::AuthContext;
use crate::api::error::{ApiError, ApiResult};
use crate::database::emails::{self, Entity as Emails};
use crate::database::queues::{self, Entity as Queues, DEFAULT_RETRY_DELAYS};
use crate::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/queues", post(create_queue).get(list_queues))
        .route(
            "/queues/:id",
            get(get_queue).patch(update_queue).delete(delete_queue),
        )
        .route("/queues/:id/pause", post(pause_queue))
        .route("/queues/:id/resume", post(resume_queue))
        .route("/queues/:id/stats", get(queue_stats))
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
struct CreateQueueRequest {
    name: String,
    #[validate(range(min = 1, max = 10))]
    priority: Option<i16>,
    rate_limit: Option<i32>,
    #[validate(range(min = 0, max = 10))]
    max_retries: Option<i16>,
    retry_delays: Option<Vec<i64>>,
    smtp_config_id: Option<Uuid>,
    track_opens: Option<bool>,
    track_clicks: Option<bool>,
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
struct UpdateQueueRequest {
    #[validate(range(min = 1, max = 10))]
    priority: Option<i16>,
    rate_limit: Option<Option<i32>>,
    #[validate(range(min = 0, max = 10))]
    max_retries: Option<i16>,
    retry_delays: Option<Vec<i64>>,
    smtp_config_id: Option<Option<Uuid>>,
    track_opens: Option<bool>,
    track_clicks: Option<bool>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct QueueResponse {
    id: Uuid,
    name: String,
    priority: i16,
    rate_limit: Option<i32>,
    max_retries: i16,
    retry_delays: Value,
    smtp_config_id: Option<Uuid>,
    paused: bool,
    track_opens: bool,
    track_clicks: bool,
    created_at: chrono::DateTime<Utc>,
}

impl From<queues::Model> for QueueResponse {
    fn from(m: queues::Model) -> Self {
        Self {
            id: m.id,
            name: m.name,
            priority: m.priority,
            rate_limit: m.rate_limit,
            max_retries: m.max_retries,
            retry_delays: m.retry_delays,
            smtp_config_id: m.smtp_config_id,
            paused: m.paused,
            track_opens: m.track_opens,
            track_clicks: m.track_clicks,
            created_at: m.created_at,
        }
    }
}

async fn create_queue(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Json(request): Json<CreateQueueRequest>,
) -> ApiResult<(StatusCode, Json<QueueResponse>)> {
    ctx.require_scope("queues:write")?;
    validate_queue_name(&request.name).map_err(ApiError::bad_request)?;
    request
        .validate()
        .map_err(|e| ApiError::bad_request(e.to_string()))?;

    let exists = Queues::find()
        .filter(queues::Column::AppId.eq(ctx.app.id))
        .filter(queues::Column::Name.eq(request.name.clone()))
        .count(&*state.db)
        .await
        .map_err(db_err)?;
    if exists > 0 {
        return Err(ApiError::conflict(format!(
            "queue '{}' already exists",
            request.name
        )));
    }

    let queue = queues::ActiveModel {
        app_id: Set(ctx.app.id),
        name: Set(request.name),
        priority: Set(request.priority.unwrap_or(5)),
        rate_limit: Set(request.rate_limit),
        max_retries: Set(request.max_retries.unwrap_or(3)),
        retry_delays: Set(json!(request
            .retry_delays
            .unwrap_or_else(|| DEFAULT_RETRY_DELAYS.to_vec()))),
        smtp_config_id: Set(request.smtp_config_id),
        track_opens: Set(request.track_opens.unwrap_or(false)),
        track_clicks: Set(request.track_clicks.unwrap_or(false)),
        ..queues::ActiveModel::new()
    }
    .insert(&*state.db)
    .await
    .map_err(db_err)?;

    Ok((StatusCode::CREATED, Json(queue.into())))
}

async fn list_queues(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
) -> ApiResult<Json<Value>> {
    let queues = Queues::find()
        .filter(queues::Column::AppId.eq(ctx.app.id))
        .order_by_asc(queues::Column::Name)
        .all(&*state.db)
        .await
        .map_err(db_err)?;
    Ok(Json(json!({
        "data": queues.into_iter().map(QueueResponse::from).collect::<Vec<_>>(),
    })))
}

async fn load_scoped_queue(
    state: &AppState,
    ctx: &AuthContext,
    id: Uuid,
) -> ApiResult<queues::Model> {
    Queues::find_by_id(id)
        .filter(queues::Column::AppId.eq(ctx.app.id))
        .one(&*state.db)
        .await
        .map_err(db_err)?
        .ok_or_else(|| ApiError::not_found(format!("queue {id} not found")))
}

async fn get_queue(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<QueueResponse>> {
    Ok(Json(load_scoped_queue(&state, &ctx, id).await?.into()))
}

async fn update_queue(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Path(id): Path<Uuid>,
    Json(request): Json<UpdateQueueRequest>,
) -> ApiResult<Json<QueueResponse>> {
    ctx.require_scope("queues:write")?;
    request
        .validate()
        .map_err(|e| ApiError::bad_request(e.to_string()))?;
    let queue = load_scoped_queue(&state, &ctx, id).await?;

    let mut active: queues::ActiveModel = queue.into();
    if let Some(priority) = request.priority {
        active.priority = Set(priority);
    }
    if let Some(rate_limit) = request.rate_limit {
        active.rate_limit = Set(rate_limit);
    }
    if let Some(max_retries) = request.max_retries {
        active.max_retries = Set(max_retries);
    }
    if let Some(delays) = request.retry_delays {
        active.retry_delays = Set(json!(delays));
    }
    if let Some(smtp_config_id) = request.smtp_config_id {
        active.smtp_config_id = Set(smtp_config_id);
    }
    if let Some(track_opens) = request.track_opens {
        active.track_opens = Set(track_opens);
    }
    if let Some(track_clicks) = request.track_clicks {
        active.track_clicks = Set(track_clicks);
    }
    active.updated_at = Set(Utc::now());

    let updated = active.update(&*state.db).await.map_err(db_err)?;
    Ok(Json(updated.into()))
}

async fn delete_queue(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Path(id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    ctx.require_scope("queues:write")?;
    let queue = load_scoped_queue(&state, &ctx, id).await?;
    queues::Entity::delete_by_id(queue.id)
        .exec(&*state.db)
        .await
        .map_err(db_err)?;
    Ok(StatusCode::NO_CONTENT)
}

/// Pausing stops admission immediately; jobs already reserved by workers
/// run to completion.
async fn pause_queue(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<QueueResponse>> {
    set_paused(&state, &ctx, id, true).await
}

async fn resume_queue(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<QueueResponse>> {
    set_paused(&state, &ctx, id, false).await
}

async fn set_paused(
    state: &AppState,
    ctx: &AuthContext,
    id: Uuid,
    paused: bool,
) -> ApiResult<Json<QueueResponse>> {
    ctx.require_scope("queues:write")?;
    let queue = load_scoped_queue(state, ctx, id).await?;
    let mut active: queues::ActiveModel = queue.into();
    active.paused = Set(paused);
    active.updated_at = Set(Utc::now());
    let updated = active.update(&*state.db).await.map_err(db_err)?;
    Ok(Json(updated.into()))
}

/// Per-queue view over the email table, in the broker's stats vocabulary.
async fn queue_stats(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Value>> {
    let queue = load_scoped_queue(&state, &ctx, id).await?;
    let now = Utc::now();

    let count = |status: &str| {
        Emails::find()
            .filter(emails::Column::QueueId.eq(queue.id))
            .filter(emails::Column::Status.eq(status.to_string()))
            .count(&*state.db)
    };

    let queued = count("queued").await.map_err(db_err)?;
    let delayed = Emails::find()
        .filter(emails::Column::QueueId.eq(queue.id))
        .filter(emails::Column::Status.eq("queued"))
        .filter(emails::Column::ScheduledAt.gt(now))
        .count(&*state.db)
        .await
        .map_err(db_err)?;
    let active = count("processing").await.map_err(db_err)?;
    let sent = count("sent").await.map_err(db_err)?;
    let delivered = count("delivered").await.map_err(db_err)?;
    let failed = count("failed").await.map_err(db_err)?;

    Ok(Json(json!({
        "waiting": queued.saturating_sub(delayed),
        "active": active,
        "delayed": delayed,
        "completed": sent + delivered,
        "failed": failed,
    })))
}

fn db_err(e: sea_orm::DbErr) -> ApiError {
    ApiError::from(crate::error::MailroomError::from(e))
}
