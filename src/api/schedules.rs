use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::Json;
use axum::routing::{get, post};
use axum::{Extension, Router};
use chrono::{DateTime, Utc};
use sea_orm::{ActiveModelBehavior, ActiveModelTrait, ColumnTrait, EntityTrait, QueryFilter, QueryOrder, Set};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::admission::AuthContext;
use crate::api::error::{ApiError, ApiResult};
use crate::database::queues::{self, Entity as Queues};
use crate::database::scheduled_emails::{self, Entity as ScheduledEmails};
use crate::scheduler::{calculate_next_fire, preview_fires};
use crate::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route(
            "/scheduled-emails",
            post(create_schedule).get(list_schedules),
        )
        .route(
            "/scheduled-emails/:id",
            get(get_schedule).patch(update_schedule).delete(delete_schedule),
        )
        .route("/scheduled-emails/validate-cron", post(validate_cron))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateScheduleRequest {
    queue: String,
    name: Option<String>,
    cron_expression: String,
    timezone: Option<String>,
    template: Value,
    active: Option<bool>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdateScheduleRequest {
    name: Option<String>,
    cron_expression: Option<String>,
    timezone: Option<String>,
    template: Option<Value>,
    active: Option<bool>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ValidateCronRequest {
    cron_expression: String,
    timezone: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ScheduleResponse {
    id: Uuid,
    queue_id: Uuid,
    name: Option<String>,
    cron_expression: String,
    timezone: String,
    template: Value,
    active: bool,
    last_run_at: Option<DateTime<Utc>>,
    next_run_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

impl From<scheduled_emails::Model> for ScheduleResponse {
    fn from(m: scheduled_emails::Model) -> Self {
        Self {
            id: m.id,
            queue_id: m.queue_id,
            name: m.name,
            cron_expression: m.cron_expression,
            timezone: m.timezone,
            template: m.template,
            active: m.active,
            last_run_at: m.last_run_at,
            next_run_at: m.next_run_at,
            created_at: m.created_at,
        }
    }
}

async fn create_schedule(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Json(request): Json<CreateScheduleRequest>,
) -> ApiResult<(StatusCode, Json<ScheduleResponse>)> {
    ctx.require_scope("schedules:write")?;
    let timezone = request.timezone.unwrap_or_else(|| "UTC".to_string());

    // Expressions are validated on create; the scheduler trusts stored rows
    let next_run = calculate_next_fire(&request.cron_expression, &timezone, Utc::now())?;

    let queue = Queues::find()
        .filter(queues::Column::AppId.eq(ctx.app.id))
        .filter(queues::Column::Name.eq(request.queue.clone()))
        .one(&*state.db)
        .await
        .map_err(db_err)?
        .ok_or_else(|| ApiError::not_found(format!("queue '{}' not found", request.queue)))?;

    validate_template(&request.template, &queue.name)?;

    let model = scheduled_emails::ActiveModel {
        app_id: Set(ctx.app.id),
        queue_id: Set(queue.id),
        name: Set(request.name),
        cron_expression: Set(request.cron_expression),
        timezone: Set(timezone),
        template: Set(request.template),
        active: Set(request.active.unwrap_or(true)),
        next_run_at: Set(Some(next_run)),
        ..scheduled_emails::ActiveModel::new()
    }
    .insert(&*state.db)
    .await
    .map_err(db_err)?;

    Ok((StatusCode::CREATED, Json(model.into())))
}

async fn list_schedules(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
) -> ApiResult<Json<Value>> {
    let rows = ScheduledEmails::find()
        .filter(scheduled_emails::Column::AppId.eq(ctx.app.id))
        .order_by_desc(scheduled_emails::Column::CreatedAt)
        .all(&*state.db)
        .await
        .map_err(db_err)?;
    Ok(Json(json!({
        "data": rows.into_iter().map(ScheduleResponse::from).collect::<Vec<_>>(),
    })))
}

async fn load_scoped_schedule(
    state: &AppState,
    ctx: &AuthContext,
    id: Uuid,
) -> ApiResult<scheduled_emails::Model> {
    ScheduledEmails::find_by_id(id)
        .filter(scheduled_emails::Column::AppId.eq(ctx.app.id))
        .one(&*state.db)
        .await
        .map_err(db_err)?
        .ok_or_else(|| ApiError::not_found(format!("scheduled email {id} not found")))
}

async fn get_schedule(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<ScheduleResponse>> {
    Ok(Json(load_scoped_schedule(&state, &ctx, id).await?.into()))
}

async fn update_schedule(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Path(id): Path<Uuid>,
    Json(request): Json<UpdateScheduleRequest>,
) -> ApiResult<Json<ScheduleResponse>> {
    ctx.require_scope("schedules:write")?;
    let schedule = load_scoped_schedule(&state, &ctx, id).await?;

    let cron_expression = request
        .cron_expression
        .clone()
        .unwrap_or_else(|| schedule.cron_expression.clone());
    let timezone = request
        .timezone
        .clone()
        .unwrap_or_else(|| schedule.timezone.clone());
    let next_run = calculate_next_fire(&cron_expression, &timezone, Utc::now())?;

    let mut active: scheduled_emails::ActiveModel = schedule.into();
    if let Some(name) = request.name {
        active.name = Set(Some(name));
    }
    active.cron_expression = Set(cron_expression);
    active.timezone = Set(timezone);
    if let Some(template) = request.template {
        validate_template(&template, "placeholder")?;
        active.template = Set(template);
    }
    if let Some(enabled) = request.active {
        active.active = Set(enabled);
    }
    active.next_run_at = Set(Some(next_run));
    active.updated_at = Set(Utc::now());

    let updated = active.update(&*state.db).await.map_err(db_err)?;
    Ok(Json(updated.into()))
}

async fn delete_schedule(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Path(id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    ctx.require_scope("schedules:write")?;
    let schedule = load_scoped_schedule(&state, &ctx, id).await?;
    ScheduledEmails::delete_by_id(schedule.id)
        .exec(&*state.db)
        .await
        .map_err(db_err)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn validate_cron(
    Json(request): Json<ValidateCronRequest>,
) -> ApiResult<Json<Value>> {
    let timezone = request.timezone.unwrap_or_else(|| "UTC".to_string());
    match preview_fires(&request.cron_expression, &timezone, 3) {
        Ok(fires) => Ok(Json(json!({
            "valid": true,
            "nextExecutions": fires.iter().map(|t| t.to_rfc3339()).collect::<Vec<_>>(),
        }))),
        Err(e) => Ok(Json(json!({
            "valid": false,
            "error": e.to_string(),
            "nextExecutions": [],
        }))),
    }
}

/// The stored template is a send payload without routing; parse it with the
/// queue injected so a broken template fails at creation, not at fire time.
fn validate_template(template: &Value, queue_name: &str) -> ApiResult<()> {
    if !template.is_object() {
        return Err(ApiError::bad_request("template must be an email payload object"));
    }
    let mut candidate = template.clone();
    candidate["queue"] = json!(queue_name);
    serde_json::from_value::<crate::admission::SendEmailRequest>(candidate)
        .map_err(|e| ApiError::bad_request(format!("template is not a valid email payload: {e}")))?;
    Ok(())
}

fn db_err(e: sea_orm::DbErr) -> ApiError {
    ApiError::from(crate::error::MailroomError::from(e))
}
