use axum::extract::State;
use axum::http::StatusCode;
use axum::response::Json;
use axum::routing::get;
use axum::Router;
use sea_orm::ConnectionTrait;
use serde_json::{json, Value};

use crate::broker::{EMAIL_QUEUE, WEBHOOK_QUEUE};
use crate::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/health/detailed", get(health_detailed))
        .route("/health/ready", get(health_ready))
        .route("/metrics", get(metrics))
}

async fn health() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "service": "mailroom",
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}

async fn health_detailed(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    let db_ok = state
        .db
        .execute_unprepared("SELECT 1")
        .await
        .is_ok();
    let redis_ok = state.limiter.ping().await;

    let email_stats = state.broker.stats(EMAIL_QUEUE).await.ok();
    let webhook_stats = state.broker.stats(WEBHOOK_QUEUE).await.ok();

    // Redis degradation is tolerated (the limiter fails open); the database
    // is not.
    let status = if db_ok { "healthy" } else { "unhealthy" };
    let code = if db_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        code,
        Json(json!({
            "status": status,
            "checks": {
                "postgresql": if db_ok { "up" } else { "down" },
                "redis": if redis_ok { "up" } else { "down" },
            },
            "queues": {
                "email": email_stats,
                "webhook": webhook_stats,
            },
        })),
    )
}

async fn health_ready(State(state): State<AppState>) -> StatusCode {
    if state.db.execute_unprepared("SELECT 1").await.is_ok() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

async fn metrics(State(state): State<AppState>) -> String {
    state.metrics.export()
}
