use thiserror::Error;

#[derive(Debug, Error)]
pub enum MailroomError {
    #[error("Database error: {0}")]
    Database(#[from] sea_orm::DbErr),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Validation failed: {0}")]
    Validation(String),

    /// Per-path messages for 400 responses, e.g. ("to[2].email", "missing @").
    #[error("Validation failed on {} field(s)", errors.len())]
    PayloadInvalid { errors: Vec<(String, String)> },

    #[error("App not found: {0}")]
    AppNotFound(String),

    #[error("Queue not found: {0}")]
    QueueNotFound(String),

    #[error("Queue is paused: {0}")]
    QueuePaused(String),

    #[error("Email not found: {0}")]
    EmailNotFound(String),

    #[error("SMTP config not found: {0}")]
    SmtpConfigNotFound(String),

    #[error("Recipient suppressed: {address} ({reason})")]
    Suppressed { address: String, reason: String },

    #[error("Rate limit exceeded for {scope}, retry after {retry_after_secs}s")]
    RateLimited {
        scope: String,
        retry_after_secs: u64,
        limit: u32,
        reset_at_unix: i64,
    },

    #[error("Idempotency key conflict: {0}")]
    IdempotencyConflict(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Invalid state transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("SMTP error: {0}")]
    Smtp(#[from] SmtpError),

    #[error("Webhook error: {0}")]
    Webhook(#[from] WebhookError),

    #[error("Encryption error: {0}")]
    Crypto(String),

    #[error("HTTP request failed: {0}")]
    HttpRequest(#[from] reqwest::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

#[derive(Debug, Error)]
pub enum SmtpError {
    #[error("SMTP connection error: {message}")]
    Connection { message: String },

    #[error("SMTP send rejected (code {code:?}): {message}")]
    Rejected { code: Option<u16>, message: String },

    #[error("SMTP transient failure (code {code:?}): {message}")]
    Transient { code: Option<u16>, message: String },

    #[error("Message build error: {message}")]
    Build { message: String },

    #[error("Connection pool exhausted for {key}")]
    PoolExhausted { key: String },
}

impl SmtpError {
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    pub fn build(message: impl Into<String>) -> Self {
        Self::Build {
            message: message.into(),
        }
    }

    /// Transient failures go back to the broker for backoff; everything else
    /// exhausts the email immediately.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Transient { .. } | Self::Connection { .. } | Self::PoolExhausted { .. }
        )
    }
}

#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("blocked url: {0}")]
    BlockedUrl(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("http error {status}")]
    Http { status: u16 },

    #[error("missing webhook secret for app {0}")]
    MissingSecret(uuid::Uuid),

    #[error("signing error: {0}")]
    Signing(String),
}

impl WebhookError {
    /// Permanent failures are never retried; the delivery row goes straight
    /// to `failed`.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            Self::BlockedUrl(_) | Self::MissingSecret(_) | Self::Signing(_)
        )
    }
}

impl MailroomError {
    /// Stable machine-readable code, used in the API error envelope and in
    /// batch per-entry errors.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) | Self::PayloadInvalid { .. } => "VALIDATION_ERROR",
            Self::AppNotFound(_) => "APP_NOT_FOUND",
            Self::QueueNotFound(_) => "QUEUE_NOT_FOUND",
            Self::QueuePaused(_) => "QUEUE_PAUSED",
            Self::EmailNotFound(_) => "EMAIL_NOT_FOUND",
            Self::SmtpConfigNotFound(_) => "SMTP_CONFIG_NOT_FOUND",
            Self::Suppressed { .. } => "EMAIL_SUPPRESSED",
            Self::RateLimited { .. } => "RATE_LIMIT_EXCEEDED",
            Self::IdempotencyConflict(_) => "IDEMPOTENCY_CONFLICT",
            Self::Unauthorized(_) => "UNAUTHORIZED",
            Self::Forbidden(_) => "FORBIDDEN",
            Self::Conflict(_) => "CONFLICT",
            Self::InvalidTransition { .. } => "INVALID_STATE",
            Self::Smtp(_) => "SMTP_ERROR",
            Self::Webhook(_) => "WEBHOOK_ERROR",
            Self::Config(_) => "CONFIG_ERROR",
            _ => "INTERNAL_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, MailroomError>;
