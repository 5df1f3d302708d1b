use crate::error::MailroomError;
use std::env;

#[derive(Clone, Debug)]
pub struct Config {
    pub database_url: String,
    pub redis_url: String,
    pub port: u16,
    pub metrics_port: u16,
    /// 32-byte AES-256-GCM key, decoded from 64 hex chars.
    pub encryption_key: [u8; 32],
    pub admin_secret: String,
    pub jwt_secret: String,
    pub default_smtp: Option<DefaultSmtpConfig>,
    pub global_rate_limit_per_minute: u32,
    pub worker_concurrency: usize,
    pub webhook_worker_concurrency: usize,
    pub log_level: String,
    pub anonymize_ips: bool,
    pub shutdown_drain_secs: u64,
    /// Public base for tracking pixel/redirect URLs baked into outbound html.
    pub tracking_base_url: String,
}

/// Process-level fallback relay used when a queue has no SMTP config of its
/// own.
#[derive(Clone, Debug)]
pub struct DefaultSmtpConfig {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub secure: bool,
}

fn required(name: &str) -> Result<String, MailroomError> {
    env::var(name).map_err(|_| {
        MailroomError::Config(format!("{name} environment variable is required"))
    })
}

fn parsed<T: std::str::FromStr>(name: &str, default: &str) -> Result<T, MailroomError> {
    env::var(name)
        .unwrap_or_else(|_| default.to_string())
        .parse()
        .map_err(|_| MailroomError::Config(format!("Invalid {name} value")))
}

impl Config {
    pub fn from_env() -> Result<Self, MailroomError> {
        let database_url = env::var("DATABASE_URL")
            .unwrap_or_else(|_| "sqlite:data/mailroom.db?mode=rwc".to_string());
        let redis_url =
            env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());

        let port = parsed("PORT", "3800")?;
        let metrics_port = parsed("METRICS_PORT", "9090")?;

        let key_hex = required("ENCRYPTION_KEY")?;
        if key_hex.len() != 64 {
            return Err(MailroomError::Config(format!(
                "ENCRYPTION_KEY must be exactly 64 hex chars (32 bytes), got {}",
                key_hex.len()
            )));
        }
        let key_bytes = hex::decode(&key_hex)
            .map_err(|e| MailroomError::Config(format!("ENCRYPTION_KEY is not valid hex: {e}")))?;
        let mut encryption_key = [0u8; 32];
        encryption_key.copy_from_slice(&key_bytes);

        let admin_secret = required("ADMIN_SECRET")?;
        if admin_secret.len() < 16 {
            return Err(MailroomError::Config(
                "ADMIN_SECRET must be at least 16 characters".to_string(),
            ));
        }

        let jwt_secret = required("JWT_SECRET")?;
        if jwt_secret.len() < 32 {
            return Err(MailroomError::Config(
                "JWT_SECRET must be at least 32 characters".to_string(),
            ));
        }

        let default_smtp = match env::var("SMTP_HOST") {
            Ok(host) => Some(DefaultSmtpConfig {
                host,
                port: parsed("SMTP_PORT", "587")?,
                username: env::var("SMTP_USER").ok(),
                password: env::var("SMTP_PASSWORD").ok(),
                secure: parsed("SMTP_SECURE", "true")?,
            }),
            Err(_) => {
                tracing::info!("SMTP_HOST not set - queues must carry their own SMTP config");
                None
            }
        };

        // Ensure data directory exists for sqlite URLs
        if let Some(db_path_str) = database_url.strip_prefix("sqlite:") {
            if let Some(db_path) = db_path_str.split('?').next() {
                if let Some(parent) = std::path::Path::new(db_path).parent() {
                    std::fs::create_dir_all(parent).map_err(|e| {
                        MailroomError::Config(format!("Failed to create data directory: {e}"))
                    })?;
                }
            }
        }

        Ok(Config {
            database_url,
            redis_url,
            port,
            metrics_port,
            encryption_key,
            admin_secret,
            jwt_secret,
            default_smtp,
            global_rate_limit_per_minute: parsed("RATE_LIMIT_PER_MINUTE", "600")?,
            worker_concurrency: parsed("WORKER_CONCURRENCY", "10")?,
            webhook_worker_concurrency: parsed("WEBHOOK_WORKER_CONCURRENCY", "4")?,
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            anonymize_ips: parsed("ANONYMIZE_IPS", "false")?,
            shutdown_drain_secs: parsed("SHUTDOWN_DRAIN_SECS", "30")?,
            tracking_base_url: env::var("TRACKING_BASE_URL")
                .unwrap_or_else(|_| "http://localhost:3800".to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Env-var tests mutate process state, so the whole cycle runs in one
    // test body.
    #[test]
    fn test_from_env_validates_key_lengths() {
        env::set_var("ENCRYPTION_KEY", "deadbeef");
        env::set_var("ADMIN_SECRET", "0123456789abcdef");
        env::set_var("JWT_SECRET", "0123456789abcdef0123456789abcdef");
        assert!(Config::from_env().is_err());

        env::set_var(
            "ENCRYPTION_KEY",
            "167a1d8d680d5021324256b7700feefb8a433abfc8805c04937a346dff67530f",
        );
        env::set_var("ADMIN_SECRET", "short");
        assert!(Config::from_env().is_err());

        env::set_var("ADMIN_SECRET", "0123456789abcdef");
        env::set_var("JWT_SECRET", "too-short");
        assert!(Config::from_env().is_err());

        env::set_var("JWT_SECRET", "0123456789abcdef0123456789abcdef");
        env::set_var("DATABASE_URL", "sqlite::memory:");
        let cfg = Config::from_env().expect("valid config");
        assert_eq!(cfg.worker_concurrency, 10);
        assert_eq!(cfg.encryption_key.len(), 32);
    }
}
