use axum::extract::{Request, State};
use axum::http::HeaderMap;
use axum::middleware::Next;
use axum::response::Response;
use chrono::Utc;
use sea_orm::{ActiveModelTrait, ColumnTrait, EntityTrait, QueryFilter, Set};
use std::net::{IpAddr, Ipv4Addr};
use uuid::Uuid;

use crate::admission::AuthContext;
use crate::api::error::ApiError;
use crate::crypto::sha256_hex;
use crate::database::api_keys::{self, Entity as ApiKeys};
use crate::database::apps::Entity as Apps;
use crate::AppState;

/// Bearer auth for everything under /v1. Accepts a tenant API key or the
/// operator admin secret; the resolved [`AuthContext`] rides in request
/// extensions.
pub async fn auth_middleware(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let token = bearer_token(request.headers())
        .ok_or_else(|| ApiError::unauthorized("missing bearer token"))?;

    let client_ip = client_ip(request.headers());
    let app_hint = request
        .headers()
        .get("x-app-id")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| Uuid::parse_str(v).ok());

    let ctx = authenticate(&state, &token, client_ip, app_hint).await?;
    request.extensions_mut().insert(ctx);
    Ok(next.run(request).await)
}

pub async fn authenticate(
    state: &AppState,
    token: &str,
    client_ip: Option<IpAddr>,
    app_hint: Option<Uuid>,
) -> Result<AuthContext, ApiError> {
    // Operator secret: full access, tenant chosen via X-App-Id
    if constant_time_eq(token, &state.config.admin_secret) {
        let app_id =
            app_hint.ok_or_else(|| ApiError::bad_request("admin requests require X-App-Id"))?;
        let app = Apps::find_by_id(app_id)
            .one(&*state.db)
            .await
            .map_err(internal)?
            .ok_or_else(|| ApiError::not_found(format!("app {app_id} not found")))?;
        return Ok(AuthContext {
            app,
            api_key: None,
            is_admin: true,
        });
    }

    let key = ApiKeys::find()
        .filter(api_keys::Column::KeyHash.eq(sha256_hex(token)))
        .one(&*state.db)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::unauthorized("unknown api key"))?;

    if !key.active {
        return Err(ApiError::unauthorized("api key is disabled"));
    }
    if let Some(expires_at) = key.expires_at {
        if expires_at <= Utc::now() {
            return Err(ApiError::unauthorized("api key is expired"));
        }
    }
    if let Some(allowed) = &key.allowed_ips {
        let allowed: Vec<String> = serde_json::from_value(allowed.clone()).unwrap_or_default();
        if !allowed.is_empty() {
            let Some(ip) = client_ip else {
                return Err(ApiError::forbidden("source address not allowed"));
            };
            if !ip_allowed(ip, &allowed) {
                return Err(ApiError::forbidden("source address not allowed"));
            }
        }
    }

    let app = Apps::find_by_id(key.app_id)
        .one(&*state.db)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::unauthorized("api key has no app"))?;
    if !app.active {
        return Err(ApiError::forbidden("app is deactivated"));
    }

    // Best-effort usage stamp; auth never fails on it
    let mut stamp: api_keys::ActiveModel = key.clone().into();
    stamp.last_used_at = Set(Some(Utc::now()));
    if let Err(e) = stamp.update(&*state.db).await {
        tracing::debug!("failed to stamp api key usage: {e}");
    }

    Ok(AuthContext {
        app,
        api_key: Some(key),
        is_admin: false,
    })
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn client_ip(headers: &HeaderMap) -> Option<IpAddr> {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .and_then(|v| v.trim().parse().ok())
}

/// Allowlist entries are exact addresses or v4 CIDR blocks.
fn ip_allowed(ip: IpAddr, allowed: &[String]) -> bool {
    for entry in allowed {
        if let Ok(exact) = entry.parse::<IpAddr>() {
            if exact == ip {
                return true;
            }
            continue;
        }
        if let (IpAddr::V4(ip4), Some((network, prefix))) = (ip, parse_cidr4(entry)) {
            if prefix <= 32 && in_cidr4(ip4, network, prefix) {
                return true;
            }
        }
    }
    false
}

fn parse_cidr4(entry: &str) -> Option<(Ipv4Addr, u8)> {
    let (addr, prefix) = entry.split_once('/')?;
    Some((addr.parse().ok()?, prefix.parse().ok()?))
}

fn in_cidr4(ip: Ipv4Addr, network: Ipv4Addr, prefix: u8) -> bool {
    if prefix == 0 {
        return true;
    }
    let mask = u32::MAX << (32 - prefix as u32);
    (u32::from(ip) & mask) == (u32::from(network) & mask)
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.bytes().zip(b.bytes()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

fn internal(e: sea_orm::DbErr) -> ApiError {
    tracing::error!("database error during auth: {e}");
    ApiError::new(
        axum::http::StatusCode::INTERNAL_SERVER_ERROR,
        "INTERNAL_ERROR",
        "internal error",
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ip_allowlist_exact_and_cidr() {
        let allowed = vec!["203.0.113.7".to_string(), "10.1.0.0/16".to_string()];
        assert!(ip_allowed("203.0.113.7".parse().unwrap(), &allowed));
        assert!(ip_allowed("10.1.200.3".parse().unwrap(), &allowed));
        assert!(!ip_allowed("10.2.0.1".parse().unwrap(), &allowed));
        assert!(!ip_allowed("203.0.113.8".parse().unwrap(), &allowed));
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq("secret", "secret"));
        assert!(!constant_time_eq("secret", "secreT"));
        assert!(!constant_time_eq("secret", "longer-secret"));
    }

    #[test]
    fn test_bearer_token_extraction() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", "Bearer mk_live_abc".parse().unwrap());
        assert_eq!(bearer_token(&headers).as_deref(), Some("mk_live_abc"));

        headers.insert("authorization", "Basic dXNlcg==".parse().unwrap());
        assert!(bearer_token(&headers).is_none());
    }
}
