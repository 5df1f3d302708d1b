use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
use lettre::{
    message::Message,
    transport::smtp::{
        authentication::Credentials,
        client::{Tls, TlsParameters},
        PoolConfig,
    },
    AsyncSmtpTransport, AsyncTransport, Tokio1Executor,
};
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

use crate::config::DefaultSmtpConfig;
use crate::crypto::EncryptionService;
use crate::database::smtp_configs::{self, SmtpEncryption};
use crate::error::SmtpError;
use crate::metrics::Metrics;

/// How long a cached transport may sit unused before the reaper drops it.
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Relay coordinates, normalized from either a tenant SMTP config row or the
/// process default. The password stays encrypted until transport creation.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    credentials: RelayCredentials,
    pub encryption: SmtpEncryption,
    pub pool_size: u32,
    pub timeout_ms: u64,
}

#[derive(Debug, Clone)]
enum RelayCredentials {
    Encrypted(String),
    Plain(String),
    None,
}

impl RelayConfig {
    pub fn from_model(model: &smtp_configs::Model) -> Result<Self, SmtpError> {
        let encryption = SmtpEncryption::parse(&model.encryption).ok_or_else(|| {
            SmtpError::connection(format!("unknown encryption mode '{}'", model.encryption))
        })?;
        Ok(Self {
            host: model.host.clone(),
            port: model.port as u16,
            username: Some(model.username.clone()),
            credentials: RelayCredentials::Encrypted(model.password_enc.clone()),
            encryption,
            pool_size: (model.pool_size.clamp(1, 50)) as u32,
            timeout_ms: model.timeout_ms.max(1) as u64,
        })
    }

    pub fn from_default(cfg: &DefaultSmtpConfig) -> Self {
        Self {
            host: cfg.host.clone(),
            port: cfg.port,
            username: cfg.username.clone(),
            credentials: match &cfg.password {
                Some(p) => RelayCredentials::Plain(p.clone()),
                None => RelayCredentials::None,
            },
            encryption: if cfg.secure {
                SmtpEncryption::Tls
            } else {
                SmtpEncryption::Starttls
            },
            pool_size: 5,
            timeout_ms: 30_000,
        }
    }

    /// Transports are shared by relay identity: hash(host|port|user).
    pub fn pool_key(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.host.hash(&mut hasher);
        self.port.hash(&mut hasher);
        self.username.hash(&mut hasher);
        hasher.finish()
    }
}

#[derive(Debug, Clone)]
pub struct SendOutcome {
    pub accepted: Vec<String>,
    pub rejected: Vec<String>,
    pub relay_response: String,
}

struct CachedTransport {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    last_used: Instant,
}

/// Connection-pooled SMTP delivery. One cached lettre transport per relay
/// key; the transport's own pool bounds concurrent connections at the
/// config's `pool_size`, and a background reaper drops transports idle past
/// [`IDLE_TIMEOUT`].
pub struct SmtpEngine {
    crypto: EncryptionService,
    metrics: Arc<Metrics>,
    transports: RwLock<HashMap<u64, CachedTransport>>,
    /// Process-wide outbound throttle; saturation surfaces as a transient
    /// failure so the broker backs off.
    throttle: RateLimiter<NotKeyed, InMemoryState, DefaultClock>,
}

impl SmtpEngine {
    pub fn new(crypto: EncryptionService, metrics: Arc<Metrics>, max_per_minute: u32) -> Self {
        let quota = Quota::per_minute(
            NonZeroU32::new(max_per_minute.max(1)).expect("nonzero outbound quota"),
        );
        Self {
            crypto,
            metrics,
            transports: RwLock::new(HashMap::new()),
            throttle: RateLimiter::direct(quota),
        }
    }

    /// Serializes and submits a message. The envelope in `message` drives
    /// the relay conversation; `recipients` is echoed back as the accepted
    /// set on success since a 250 does not enumerate mailboxes.
    pub async fn send(
        &self,
        cfg: &RelayConfig,
        message: Message,
        recipients: Vec<String>,
    ) -> Result<SendOutcome, SmtpError> {
        if self.throttle.check().is_err() {
            return Err(SmtpError::Transient {
                code: None,
                message: "process outbound rate limit reached".to_string(),
            });
        }

        let transport = self.acquire(cfg).await?;

        let timer = self.metrics.smtp_send_seconds.start_timer();
        let result = transport.send(message).await;
        timer.observe_duration();

        self.touch(cfg.pool_key()).await;

        match result {
            Ok(response) => {
                let relay_response = response.message().collect::<Vec<_>>().join(" ");
                Ok(SendOutcome {
                    accepted: recipients,
                    rejected: Vec::new(),
                    relay_response,
                })
            }
            Err(e) => Err(classify_smtp_error(e)),
        }
    }

    /// Returns the cached transport for this relay, creating and verifying a
    /// new one on first use. Verification latency is recorded per host.
    async fn acquire(
        &self,
        cfg: &RelayConfig,
    ) -> Result<AsyncSmtpTransport<Tokio1Executor>, SmtpError> {
        let key = cfg.pool_key();

        if let Some(cached) = self.transports.read().await.get(&key) {
            return Ok(cached.transport.clone());
        }

        let transport = self.build_transport(cfg)?;

        let started = Instant::now();
        let verified = transport
            .test_connection()
            .await
            .map_err(|e| SmtpError::connection(format!("verify failed for {}: {e}", cfg.host)))?;
        self.metrics
            .smtp_verify_seconds
            .with_label_values(&[cfg.host.as_str()])
            .observe(started.elapsed().as_secs_f64());

        if !verified {
            return Err(SmtpError::connection(format!(
                "relay {} refused the handshake",
                cfg.host
            )));
        }

        let mut transports = self.transports.write().await;
        // A concurrent creator may have won; prefer the existing entry so the
        // pool bound stays per relay key.
        let entry = transports.entry(key).or_insert(CachedTransport {
            transport,
            last_used: Instant::now(),
        });
        Ok(entry.transport.clone())
    }

    fn build_transport(
        &self,
        cfg: &RelayConfig,
    ) -> Result<AsyncSmtpTransport<Tokio1Executor>, SmtpError> {
        let mut builder = AsyncSmtpTransport::<Tokio1Executor>::relay(&cfg.host)
            .map_err(|e| SmtpError::connection(format!("relay setup failed: {e}")))?
            .port(cfg.port)
            .timeout(Some(Duration::from_millis(cfg.timeout_ms)))
            .pool_config(PoolConfig::new().max_size(cfg.pool_size));

        builder = match cfg.encryption {
            SmtpEncryption::None => builder.tls(Tls::None),
            SmtpEncryption::Starttls => {
                let params = TlsParameters::new(cfg.host.clone())
                    .map_err(|e| SmtpError::connection(format!("tls configuration error: {e}")))?;
                builder.tls(Tls::Required(params))
            }
            SmtpEncryption::Tls => {
                let params = TlsParameters::new(cfg.host.clone())
                    .map_err(|e| SmtpError::connection(format!("tls configuration error: {e}")))?;
                builder.tls(Tls::Wrapper(params))
            }
        };

        // Passwords are decrypted here and live only inside the transport
        if let Some(username) = &cfg.username {
            let password = match &cfg.credentials {
                RelayCredentials::Encrypted(ciphertext) => {
                    Some(self.crypto.decrypt(ciphertext).map_err(|e| {
                        SmtpError::connection(format!("password decryption failed: {e}"))
                    })?)
                }
                RelayCredentials::Plain(p) => Some(p.clone()),
                RelayCredentials::None => None,
            };
            if let Some(password) = password {
                builder = builder.credentials(Credentials::new(username.clone(), password));
            }
        }

        Ok(builder.build())
    }

    async fn touch(&self, key: u64) {
        if let Some(cached) = self.transports.write().await.get_mut(&key) {
            cached.last_used = Instant::now();
        }
    }

    /// Drops transports idle longer than `max_idle`. Dropping a lettre
    /// transport closes its pooled connections.
    pub async fn reap_idle(&self, max_idle: Duration) -> usize {
        let mut transports = self.transports.write().await;
        let before = transports.len();
        transports.retain(|_, cached| cached.last_used.elapsed() < max_idle);
        let reaped = before - transports.len();
        if reaped > 0 {
            tracing::debug!(reaped = reaped, "reaped idle smtp transports");
        }
        reaped
    }

    pub async fn shutdown(&self) {
        let mut transports = self.transports.write().await;
        let count = transports.len();
        transports.clear();
        tracing::info!(pools = count, "smtp engine shut down");
    }
}

fn classify_smtp_error(e: lettre::transport::smtp::Error) -> SmtpError {
    let code = e
        .status()
        .map(|c| format!("{c}"))
        .and_then(|s| s.parse::<u16>().ok());
    if e.is_permanent() {
        SmtpError::Rejected {
            code,
            message: e.to_string(),
        }
    } else if e.is_transient() {
        SmtpError::Transient {
            code,
            message: e.to_string(),
        }
    } else {
        SmtpError::Connection {
            message: e.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model(host: &str, port: i32, user: &str) -> smtp_configs::Model {
        smtp_configs::Model {
            id: uuid::Uuid::now_v7(),
            app_id: uuid::Uuid::now_v7(),
            name: "primary".to_string(),
            host: host.to_string(),
            port,
            username: user.to_string(),
            password_enc: "irrelevant".to_string(),
            encryption: "starttls".to_string(),
            pool_size: 10,
            timeout_ms: 5000,
            active: true,
            created_at: chrono::Utc::now(),
        }
    }

    #[test]
    fn test_pool_key_is_stable_per_relay_identity() {
        let a = RelayConfig::from_model(&model("smtp.x.io", 587, "u1")).unwrap();
        let b = RelayConfig::from_model(&model("smtp.x.io", 587, "u1")).unwrap();
        let c = RelayConfig::from_model(&model("smtp.x.io", 587, "u2")).unwrap();
        let d = RelayConfig::from_model(&model("smtp.x.io", 465, "u1")).unwrap();

        assert_eq!(a.pool_key(), b.pool_key());
        assert_ne!(a.pool_key(), c.pool_key());
        assert_ne!(a.pool_key(), d.pool_key());
    }

    #[test]
    fn test_unknown_encryption_mode_is_rejected() {
        let mut m = model("smtp.x.io", 587, "u");
        m.encryption = "ssl3".to_string();
        assert!(RelayConfig::from_model(&m).is_err());
    }

    #[test]
    fn test_pool_size_is_clamped() {
        let mut m = model("smtp.x.io", 587, "u");
        m.pool_size = 900;
        assert_eq!(RelayConfig::from_model(&m).unwrap().pool_size, 50);
        m.pool_size = 0;
        assert_eq!(RelayConfig::from_model(&m).unwrap().pool_size, 1);
    }

    #[tokio::test]
    async fn test_reap_idle_empties_cold_cache() {
        let engine = SmtpEngine::new(
            EncryptionService::new(&[0u8; 32]),
            Arc::new(Metrics::new()),
            60,
        );
        assert_eq!(engine.reap_idle(Duration::from_secs(0)).await, 0);
    }
}
