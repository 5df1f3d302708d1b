pub mod auth;
pub mod emails;
pub mod error;
pub mod health;
pub mod queues;
pub mod schedules;
pub mod suppressions;
pub mod webhooks;

use axum::{middleware, Router};

use crate::AppState;

pub fn create_router(state: AppState) -> Router<AppState> {
    let v1 = Router::new()
        .merge(emails::routes())
        .merge(queues::routes())
        .merge(suppressions::routes())
        .merge(schedules::routes())
        .merge(webhooks::routes())
        .layer(middleware::from_fn_with_state(state, auth::auth_middleware));

    Router::new()
        // Probes and metrics stay unauthenticated
        .merge(health::routes())
        .nest("/v1", v1)
}
