use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::Json;
use axum::routing::{get, post};
use axum::{Extension, Router};
use chrono::{DateTime, Utc};
use sea_orm::{ActiveModelBehavior, ActiveModelTrait, ColumnTrait, Condition, EntityTrait, PaginatorTrait, QueryFilter, QueryOrder, QuerySelect, Set};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::admission::validation::validate_email_address;
use crate::admission::AuthContext;
use crate::api::error::{ApiError, ApiResult};
use crate::database::suppressions::{self, Entity as Suppressions, SuppressionReason};
use crate::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/suppressions", post(create_suppression).get(list_suppressions))
        .route("/suppressions/bulk", post(bulk_create))
        .route("/suppressions/:id", get(get_suppression).delete(delete_suppression))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateSuppressionRequest {
    email: String,
    reason: String,
    expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct BulkCreateRequest {
    entries: Vec<CreateSuppressionRequest>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SuppressionResponse {
    id: Uuid,
    email: String,
    reason: String,
    source_email_id: Option<Uuid>,
    expires_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

impl From<suppressions::Model> for SuppressionResponse {
    fn from(m: suppressions::Model) -> Self {
        Self {
            id: m.id,
            email: m.email,
            reason: m.reason,
            source_email_id: m.source_email_id,
            expires_at: m.expires_at,
            created_at: m.created_at,
        }
    }
}

fn validate_entry(entry: &CreateSuppressionRequest) -> Result<SuppressionReason, ApiError> {
    validate_email_address(&entry.email).map_err(ApiError::bad_request)?;
    SuppressionReason::parse(&entry.reason)
        .ok_or_else(|| ApiError::bad_request(format!("unknown reason '{}'", entry.reason)))
}

async fn create_suppression(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Json(request): Json<CreateSuppressionRequest>,
) -> ApiResult<(StatusCode, Json<SuppressionResponse>)> {
    ctx.require_scope("suppressions:write")?;
    let reason = validate_entry(&request)?;
    let email = request.email.to_lowercase();

    let existing = Suppressions::find()
        .filter(suppressions::Column::AppId.eq(ctx.app.id))
        .filter(suppressions::Column::Email.eq(email.clone()))
        .count(&*state.db)
        .await
        .map_err(db_err)?;
    if existing > 0 {
        return Err(ApiError::conflict(format!("{email} is already suppressed")));
    }

    let model = suppressions::ActiveModel {
        app_id: Set(Some(ctx.app.id)),
        email: Set(email),
        reason: Set(reason.to_string()),
        expires_at: Set(request.expires_at),
        ..suppressions::ActiveModel::new()
    }
    .insert(&*state.db)
    .await
    .map_err(db_err)?;

    Ok((StatusCode::CREATED, Json(model.into())))
}

async fn bulk_create(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Json(request): Json<BulkCreateRequest>,
) -> ApiResult<Json<Value>> {
    ctx.require_scope("suppressions:write")?;
    let mut created = 0usize;
    let mut skipped = 0usize;
    let mut errors: Vec<Value> = Vec::new();

    for (index, entry) in request.entries.iter().enumerate() {
        let reason = match validate_entry(entry) {
            Ok(reason) => reason,
            Err(e) => {
                errors.push(json!({"index": index, "message": e.message}));
                continue;
            }
        };
        let email = entry.email.to_lowercase();

        let exists = Suppressions::find()
            .filter(suppressions::Column::AppId.eq(ctx.app.id))
            .filter(suppressions::Column::Email.eq(email.clone()))
            .count(&*state.db)
            .await
            .map_err(db_err)?;
        if exists > 0 {
            skipped += 1;
            continue;
        }

        suppressions::ActiveModel {
            app_id: Set(Some(ctx.app.id)),
            email: Set(email),
            reason: Set(reason.to_string()),
            expires_at: Set(entry.expires_at),
            ..suppressions::ActiveModel::new()
        }
        .insert(&*state.db)
        .await
        .map_err(db_err)?;
        created += 1;
    }

    Ok(Json(json!({
        "created": created,
        "skipped": skipped,
        "errors": errors,
    })))
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    email: Option<String>,
    limit: Option<u64>,
    offset: Option<u64>,
}

/// Tenant-scoped entries plus the global ones that also bind this tenant.
async fn list_suppressions(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Json<Value>> {
    let mut select = Suppressions::find().filter(
        Condition::any()
            .add(suppressions::Column::AppId.eq(ctx.app.id))
            .add(suppressions::Column::AppId.is_null()),
    );
    if let Some(email) = &query.email {
        select = select.filter(suppressions::Column::Email.eq(email.to_lowercase()));
    }

    let rows = select
        .order_by_desc(suppressions::Column::CreatedAt)
        .offset(query.offset.unwrap_or(0))
        .limit(query.limit.unwrap_or(50).clamp(1, 200))
        .all(&*state.db)
        .await
        .map_err(db_err)?;

    Ok(Json(json!({
        "data": rows.into_iter().map(SuppressionResponse::from).collect::<Vec<_>>(),
    })))
}

async fn get_suppression(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<SuppressionResponse>> {
    let row = Suppressions::find_by_id(id)
        .filter(suppressions::Column::AppId.eq(ctx.app.id))
        .one(&*state.db)
        .await
        .map_err(db_err)?
        .ok_or_else(|| ApiError::not_found(format!("suppression {id} not found")))?;
    Ok(Json(row.into()))
}

async fn delete_suppression(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Path(id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    ctx.require_scope("suppressions:write")?;
    let row = Suppressions::find_by_id(id)
        .filter(suppressions::Column::AppId.eq(ctx.app.id))
        .one(&*state.db)
        .await
        .map_err(db_err)?
        .ok_or_else(|| ApiError::not_found(format!("suppression {id} not found")))?;

    Suppressions::delete_by_id(row.id)
        .exec(&*state.db)
        .await
        .map_err(db_err)?;
    Ok(StatusCode::NO_CONTENT)
}

fn db_err(e: sea_orm::DbErr) -> ApiError {
    ApiError::from(crate::error::MailroomError::from(e))
}
