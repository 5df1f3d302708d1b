use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tracing_subscriber::EnvFilter;

use mailroom::admission::AdmissionController;
use mailroom::broker::QueueBroker;
use mailroom::config::Config;
use mailroom::crypto::EncryptionService;
use mailroom::database::establish_connection;
use mailroom::metrics::Metrics;
use mailroom::ratelimit::RateLimiter;
use mailroom::scheduler::CronScheduler;
use mailroom::smtp::{SmtpEngine, IDLE_TIMEOUT};
use mailroom::state::EmailStateStore;
use mailroom::tracking::TrackingService;
use mailroom::webhook::{WebhookDispatcher, WebhookWorkerPool};
use mailroom::worker::EmailWorkerPool;
use mailroom::{api, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let config = Config::from_env()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone())),
        )
        .init();

    tracing::info!("Starting mailroom on port {}", config.port);

    // Schema migrations run inside establish_connection
    let db = Arc::new(establish_connection(&config.database_url).await?);

    let metrics = Arc::new(Metrics::new());
    let crypto = EncryptionService::new(&config.encryption_key);

    let limiter = Arc::new(RateLimiter::connect(&config.redis_url).await);
    if limiter.is_connected() {
        tracing::info!("Rate limit store connected");
    } else {
        tracing::warn!("Rate limit store unavailable - limiter is failing open");
    }

    let broker = Arc::new(QueueBroker::new(db.clone()));
    let dispatcher = Arc::new(WebhookDispatcher::new(
        db.clone(),
        broker.clone(),
        crypto.clone(),
        metrics.clone(),
    ));
    let state_store = Arc::new(EmailStateStore::new(
        db.clone(),
        dispatcher.clone(),
        metrics.clone(),
    ));
    let tracking = Arc::new(TrackingService::new(
        db.clone(),
        state_store.clone(),
        config.tracking_base_url.clone(),
        config.anonymize_ips,
    ));
    let smtp = Arc::new(SmtpEngine::new(
        crypto.clone(),
        metrics.clone(),
        config.global_rate_limit_per_minute,
    ));
    let admission = Arc::new(AdmissionController::new(
        db.clone(),
        state_store.clone(),
        broker.clone(),
        limiter.clone(),
        metrics.clone(),
        config.global_rate_limit_per_minute,
    ));

    // Email delivery workers
    let email_pool = Arc::new(EmailWorkerPool::new(
        db.clone(),
        state_store.clone(),
        broker.clone(),
        smtp.clone(),
        tracking.clone(),
        config.default_smtp.clone(),
        config.worker_concurrency,
    ));
    email_pool.clone().start().await;

    // Webhook delivery workers
    let webhook_pool = Arc::new(WebhookWorkerPool::new(dispatcher.clone(), broker.clone()));
    webhook_pool.start(config.webhook_worker_concurrency).await;

    // Broker maintenance: expired reservations every 30s, retention hourly
    {
        let broker = broker.clone();
        let metrics = metrics.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(30));
            loop {
                tick.tick().await;
                if let Err(e) = broker.release_expired().await {
                    tracing::error!("reservation sweep failed: {e}");
                }
                for queue in [
                    mailroom::broker::EMAIL_QUEUE,
                    mailroom::broker::WEBHOOK_QUEUE,
                ] {
                    if let Ok(stats) = broker.stats(queue).await {
                        for (label, value) in [
                            ("waiting", stats.waiting),
                            ("active", stats.active),
                            ("delayed", stats.delayed),
                            ("failed", stats.failed),
                        ] {
                            metrics
                                .jobs_gauge
                                .with_label_values(&[queue, label])
                                .set(value as i64);
                        }
                    }
                }
            }
        });
    }
    {
        let broker = broker.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(3600));
            loop {
                tick.tick().await;
                if let Err(e) = broker.run_retention().await {
                    tracing::error!("retention sweep failed: {e}");
                }
            }
        });
    }

    // Webhook retry sweeper
    {
        let dispatcher = dispatcher.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(15));
            loop {
                tick.tick().await;
                match dispatcher.sweep_due().await {
                    Ok(0) => {}
                    Ok(n) => tracing::debug!("released {n} due webhook deliveries"),
                    Err(e) => tracing::error!("webhook sweep failed: {e}"),
                }
            }
        });
    }

    // SMTP idle-connection reaper
    {
        let smtp = smtp.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(IDLE_TIMEOUT);
            loop {
                tick.tick().await;
                smtp.reap_idle(IDLE_TIMEOUT).await;
            }
        });
    }

    // Cron expansion for scheduled emails
    let scheduler = Arc::new(CronScheduler::new(db.clone(), admission.clone()));
    {
        let scheduler = scheduler.clone();
        tokio::spawn(async move {
            scheduler.run().await;
        });
    }

    let port = config.port;
    let drain = Duration::from_secs(config.shutdown_drain_secs);
    let state = AppState {
        db,
        config: Arc::new(config),
        metrics,
        broker: broker.clone(),
        limiter,
        admission,
        state_store,
        dispatcher,
    };

    let cors = CorsLayer::new()
        .allow_methods([
            axum::http::Method::GET,
            axum::http::Method::POST,
            axum::http::Method::PATCH,
            axum::http::Method::DELETE,
            axum::http::Method::OPTIONS,
        ])
        .allow_headers([
            axum::http::header::AUTHORIZATION,
            axum::http::header::CONTENT_TYPE,
        ]);

    let app = api::create_router(state.clone())
        .layer(cors)
        .with_state(state.clone());

    // Probes and the Prometheus endpoint also listen on a dedicated port so
    // scrapers never depend on the public API surface
    {
        let metrics_port = state.config.metrics_port;
        let metrics_app = api::health::routes().with_state(state);
        tokio::spawn(async move {
            match TcpListener::bind(&format!("0.0.0.0:{metrics_port}")).await {
                Ok(listener) => {
                    tracing::info!("metrics listener on http://0.0.0.0:{metrics_port}");
                    if let Err(e) = axum::serve(listener, metrics_app).await {
                        tracing::error!("metrics listener failed: {e}");
                    }
                }
                Err(e) => tracing::error!("failed to bind metrics port {metrics_port}: {e}"),
            }
        });
    }

    let listener = TcpListener::bind(&format!("0.0.0.0:{port}")).await?;
    tracing::info!("mailroom listening on http://0.0.0.0:{port}");

    let shutdown_signal = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
        tracing::info!("Received shutdown signal");
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal)
        .await?;

    // Drain order: stop intake, finish in-flight sends, settle webhooks,
    // then release the SMTP pools.
    tracing::info!("Draining workers...");
    broker.pause(mailroom::broker::EMAIL_QUEUE).await;
    broker.pause(mailroom::broker::WEBHOOK_QUEUE).await;
    email_pool.shutdown(drain).await;
    webhook_pool.shutdown().await;
    scheduler.shutdown().await;
    smtp.shutdown().await;

    tracing::info!("Shutdown complete");
    Ok(())
}
