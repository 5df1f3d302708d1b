use std::sync::Arc;

pub mod admission;
pub mod api;
pub mod broker;
pub mod config;
pub mod crypto;
pub mod database;
pub mod error;
pub mod metrics;
pub mod ratelimit;
pub mod scheduler;
pub mod smtp;
pub mod state;
pub mod tracking;
pub mod utils;
pub mod webhook;
pub mod worker;

pub use database::establish_connection;

/// Process-wide singletons, constructed once in `main` and passed down as
/// explicit dependencies.
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<sea_orm::DatabaseConnection>,
    pub config: Arc<config::Config>,
    pub metrics: Arc<metrics::Metrics>,
    pub broker: Arc<broker::QueueBroker>,
    pub limiter: Arc<ratelimit::RateLimiter>,
    pub admission: Arc<admission::AdmissionController>,
    pub state_store: Arc<state::EmailStateStore>,
    pub dispatcher: Arc<webhook::WebhookDispatcher>,
}
