use chrono::{DateTime, TimeZone, Utc};
use redis::aio::ConnectionManager;
use redis::Script;
use uuid::Uuid;

/// Sliding-window rate limiter over a shared redis store. Every decision is a
/// single Lua round-trip, so concurrent submitters across processes see one
/// consistent window. Any store failure fails open: availability of the send
/// path wins over strict limiting.
///
/// Hierarchical checks consume tokens optimistically and refund the outer
/// windows when an inner level rejects, so a queue-throttled submission never
/// drains the tenant's api-key or daily budget.
#[derive(Clone)]
pub struct RateLimiter {
    conn: Option<ConnectionManager>,
    script: Script,
}

/// Outcome of a window check, carried up to the HTTP layer for the
/// `X-RateLimit-*` headers.
#[derive(Debug, Clone)]
pub struct RateDecision {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    pub reset_at: DateTime<Utc>,
}

/// Which scope blocked a hierarchical check. Precedence: api key, then app
/// daily, then queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateScope {
    ApiKey,
    App,
    Queue,
}

impl RateScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ApiKey => "api_key",
            Self::App => "app",
            Self::Queue => "queue",
        }
    }
}

#[derive(Debug, Clone)]
pub struct RateLimitHit {
    pub scope: RateScope,
    pub decision: RateDecision,
}

/// A token admitted into one window; held so it can be refunded if a later
/// level rejects the submission.
#[derive(Debug, Clone, PartialEq)]
struct WindowGrant {
    key: String,
    member: String,
}

/// One evaluated level of the hierarchy, in precedence order.
struct Level {
    scope: RateScope,
    decision: RateDecision,
    grant: Option<WindowGrant>,
}

// Prune, count, then conditionally admit: all inside redis so the
// check-and-insert cannot interleave with another submitter.
const SLIDING_WINDOW_LUA: &str = r#"
redis.call('ZREMRANGEBYSCORE', KEYS[1], 0, ARGV[1])
local count = redis.call('ZCARD', KEYS[1])
local limit = tonumber(ARGV[2])
if count < limit then
  redis.call('ZADD', KEYS[1], ARGV[3], ARGV[4])
  redis.call('PEXPIRE', KEYS[1], ARGV[5])
  return {1, limit - count - 1, 0}
end
local oldest = redis.call('ZRANGE', KEYS[1], 0, 0, 'WITHSCORES')
return {0, 0, tonumber(oldest[2])}
"#;

impl RateLimiter {
    pub async fn connect(redis_url: &str) -> Self {
        let client = match redis::Client::open(redis_url) {
            Ok(c) => c,
            Err(e) => {
                tracing::error!("Invalid redis URL, rate limiting disabled (fail-open): {e}");
                return Self::disconnected();
            }
        };
        match ConnectionManager::new(client).await {
            Ok(conn) => Self {
                conn: Some(conn),
                script: Script::new(SLIDING_WINDOW_LUA),
            },
            Err(e) => {
                tracing::error!("Redis unreachable, rate limiting disabled (fail-open): {e}");
                Self::disconnected()
            }
        }
    }

    pub fn disconnected() -> Self {
        Self {
            conn: None,
            script: Script::new(SLIDING_WINDOW_LUA),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.conn.is_some()
    }

    pub async fn ping(&self) -> bool {
        let Some(conn) = &self.conn else { return false };
        let mut conn = conn.clone();
        redis::cmd("PING")
            .query_async::<_, String>(&mut conn)
            .await
            .is_ok()
    }

    /// Atomic sliding-window check for one key.
    pub async fn check(&self, key: &str, limit: u32, window_ms: i64) -> RateDecision {
        self.consume(key, limit, window_ms).await.0
    }

    /// Atomic check-and-admit. Window members are `"<now_ms>-<uuid>"`, so two
    /// admissions in the same millisecond never collide; the grant identifies
    /// the admitted member for a possible refund.
    async fn consume(
        &self,
        key: &str,
        limit: u32,
        window_ms: i64,
    ) -> (RateDecision, Option<WindowGrant>) {
        let Some(conn) = &self.conn else {
            return (self.fail_open(limit), None);
        };

        let now_ms = Utc::now().timestamp_millis();
        let member = format!("{}-{}", now_ms, Uuid::new_v4());

        let mut conn = conn.clone();
        let result: Result<(u8, u32, i64), redis::RedisError> = self
            .script
            .key(key)
            .arg(now_ms - window_ms)
            .arg(limit)
            .arg(now_ms)
            .arg(&member)
            .arg(window_ms)
            .invoke_async(&mut conn)
            .await;

        match result {
            Ok((1, remaining, _)) => (
                RateDecision {
                    allowed: true,
                    limit,
                    remaining,
                    reset_at: ms_to_datetime(now_ms + window_ms),
                },
                Some(WindowGrant {
                    key: key.to_string(),
                    member,
                }),
            ),
            Ok((_, _, oldest_ms)) => (
                RateDecision {
                    allowed: false,
                    limit,
                    remaining: 0,
                    reset_at: ms_to_datetime(oldest_ms + window_ms),
                },
                None,
            ),
            Err(e) => {
                tracing::error!(key = key, "Rate limit store error, failing open: {e}");
                (self.fail_open(limit), None)
            }
        }
    }

    /// Best-effort removal of an admitted member after a sibling level
    /// rejected the submission. A lost refund only costs one slot for the
    /// remainder of the window.
    async fn refund(&self, grant: &WindowGrant) {
        let Some(conn) = &self.conn else { return };
        let mut conn = conn.clone();
        if let Err(e) = redis::cmd("ZREM")
            .arg(&grant.key)
            .arg(&grant.member)
            .query_async::<_, ()>(&mut conn)
            .await
        {
            tracing::warn!(key = %grant.key, "failed to refund rate limit token: {e}");
        }
    }

    async fn refund_all(&self, grants: Vec<WindowGrant>) {
        for grant in &grants {
            self.refund(grant).await;
        }
    }

    /// Hierarchical admission check. Api-key and tenant-daily windows run
    /// concurrently; the queue window only once both admit. The first blocker
    /// in api-key -> app -> queue order wins, and every token consumed on a
    /// blocked submission is refunded.
    pub async fn check_submission(
        &self,
        api_key_id: Option<Uuid>,
        api_key_limit: u32,
        app_id: Uuid,
        daily_quota: Option<i64>,
        queue_id: Uuid,
        queue_limit: Option<i32>,
    ) -> Option<RateLimitHit> {
        const MINUTE_MS: i64 = 60_000;
        const DAY_MS: i64 = 86_400_000;

        let key_check = async {
            match api_key_id {
                Some(id) => {
                    let (decision, grant) = self
                        .consume(&format!("apikey:{id}"), api_key_limit, MINUTE_MS)
                        .await;
                    Some(Level {
                        scope: RateScope::ApiKey,
                        decision,
                        grant,
                    })
                }
                None => None,
            }
        };
        let app_check = async {
            match daily_quota {
                Some(quota) if quota >= 0 => {
                    let (decision, grant) = self
                        .consume(&format!("app:{app_id}:daily"), quota as u32, DAY_MS)
                        .await;
                    Some(Level {
                        scope: RateScope::App,
                        decision,
                        grant,
                    })
                }
                _ => None,
            }
        };

        let (key_level, app_level) = futures::join!(key_check, app_check);
        let mut levels: Vec<Level> = [key_level, app_level].into_iter().flatten().collect();

        if levels.iter().any(|l| !l.decision.allowed) {
            let (hit, refunds) = pick_blocker(levels);
            self.refund_all(refunds).await;
            return hit;
        }

        if let Some(limit) = queue_limit {
            if limit >= 0 {
                let (decision, grant) = self
                    .consume(&format!("queue:{queue_id}"), limit as u32, MINUTE_MS)
                    .await;
                levels.push(Level {
                    scope: RateScope::Queue,
                    decision,
                    grant,
                });
                if !levels.last().expect("queue level just pushed").decision.allowed {
                    let (hit, refunds) = pick_blocker(levels);
                    self.refund_all(refunds).await;
                    return hit;
                }
            }
        }

        None
    }

    fn fail_open(&self, limit: u32) -> RateDecision {
        RateDecision {
            allowed: true,
            limit,
            remaining: limit,
            reset_at: Utc::now(),
        }
    }
}

/// Resolves a blocked hierarchy pass: the first denied level (in the given
/// precedence order) becomes the hit, and every token any level consumed is
/// returned for refund. All-allowed passes keep their tokens.
fn pick_blocker(levels: Vec<Level>) -> (Option<RateLimitHit>, Vec<WindowGrant>) {
    let denied = levels.iter().position(|l| !l.decision.allowed);
    match denied {
        Some(index) => {
            let hit = RateLimitHit {
                scope: levels[index].scope,
                decision: levels[index].decision.clone(),
            };
            let refunds = levels.into_iter().filter_map(|l| l.grant).collect();
            (Some(hit), refunds)
        }
        None => (None, Vec::new()),
    }
}

fn ms_to_datetime(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_else(Utc::now)
}

impl RateDecision {
    pub fn retry_after_secs(&self) -> u64 {
        (self.reset_at - Utc::now()).num_seconds().max(1) as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allowed(limit: u32) -> RateDecision {
        RateDecision {
            allowed: true,
            limit,
            remaining: limit - 1,
            reset_at: Utc::now(),
        }
    }

    fn denied(limit: u32) -> RateDecision {
        RateDecision {
            allowed: false,
            limit,
            remaining: 0,
            reset_at: Utc::now(),
        }
    }

    fn grant(key: &str) -> WindowGrant {
        WindowGrant {
            key: key.to_string(),
            member: format!("1700000000000-{}", Uuid::new_v4()),
        }
    }

    #[tokio::test]
    async fn test_disconnected_limiter_fails_open() {
        let limiter = RateLimiter::disconnected();
        let d = limiter.check("apikey:test", 5, 60_000).await;
        assert!(d.allowed);
        assert_eq!(d.remaining, 5);
    }

    #[tokio::test]
    async fn test_hierarchy_passes_when_store_is_down() {
        let limiter = RateLimiter::disconnected();
        let hit = limiter
            .check_submission(
                Some(Uuid::new_v4()),
                60,
                Uuid::new_v4(),
                Some(1000),
                Uuid::new_v4(),
                Some(1),
            )
            .await;
        assert!(hit.is_none());
    }

    #[test]
    fn test_queue_block_refunds_outer_grants() {
        let key_grant = grant("apikey:k1");
        let app_grant = grant("app:a1:daily");
        let levels = vec![
            Level {
                scope: RateScope::ApiKey,
                decision: allowed(60),
                grant: Some(key_grant.clone()),
            },
            Level {
                scope: RateScope::App,
                decision: allowed(1000),
                grant: Some(app_grant.clone()),
            },
            Level {
                scope: RateScope::Queue,
                decision: denied(1),
                grant: None,
            },
        ];

        let (hit, refunds) = pick_blocker(levels);
        assert_eq!(hit.unwrap().scope, RateScope::Queue);
        // Both consumed outer tokens come back
        assert_eq!(refunds, vec![key_grant, app_grant]);
    }

    #[test]
    fn test_api_key_block_wins_precedence_and_refunds_app() {
        let app_grant = grant("app:a1:daily");
        let levels = vec![
            Level {
                scope: RateScope::ApiKey,
                decision: denied(60),
                grant: None,
            },
            Level {
                scope: RateScope::App,
                decision: allowed(1000),
                grant: Some(app_grant.clone()),
            },
        ];

        let (hit, refunds) = pick_blocker(levels);
        assert_eq!(hit.unwrap().scope, RateScope::ApiKey);
        assert_eq!(refunds, vec![app_grant]);
    }

    #[test]
    fn test_all_allowed_keeps_tokens() {
        let levels = vec![
            Level {
                scope: RateScope::ApiKey,
                decision: allowed(60),
                grant: Some(grant("apikey:k1")),
            },
            Level {
                scope: RateScope::App,
                decision: allowed(1000),
                grant: Some(grant("app:a1:daily")),
            },
        ];

        let (hit, refunds) = pick_blocker(levels);
        assert!(hit.is_none());
        assert!(refunds.is_empty());
    }

    #[test]
    fn test_retry_after_is_at_least_one_second() {
        let d = RateDecision {
            allowed: false,
            limit: 1,
            remaining: 0,
            reset_at: Utc::now() - chrono::Duration::seconds(5),
        };
        assert_eq!(d.retry_after_secs(), 1);
    }

    #[test]
    fn test_scope_labels() {
        assert_eq!(RateScope::ApiKey.as_str(), "api_key");
        assert_eq!(RateScope::App.as_str(), "app");
        assert_eq!(RateScope::Queue.as_str(), "queue");
    }
}
