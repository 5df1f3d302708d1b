use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use serde_json::json;

use crate::error::MailroomError;

/// HTTP-facing error: `{success:false, error:{code, message, details?}}`
/// plus any response headers the failure carries (rate-limit headers on 429).
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: &'static str,
    pub message: String,
    pub details: Option<serde_json::Value>,
    pub headers: HeaderMap,
}

impl ApiError {
    pub fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
            details: None,
            headers: HeaderMap::new(),
        }
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "UNAUTHORIZED", message)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, "FORBIDDEN", message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "NOT_FOUND", message)
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "VALIDATION_ERROR", message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, "CONFLICT", message)
    }
}

impl From<MailroomError> for ApiError {
    fn from(err: MailroomError) -> Self {
        let code = err.code();
        match err {
            MailroomError::PayloadInvalid { ref errors } => {
                let details = json!(errors
                    .iter()
                    .map(|(path, message)| json!({"path": path, "message": message}))
                    .collect::<Vec<_>>());
                Self {
                    status: StatusCode::BAD_REQUEST,
                    code,
                    message: err.to_string(),
                    details: Some(details),
                    headers: HeaderMap::new(),
                }
            }
            MailroomError::Validation(_) => {
                Self::new(StatusCode::BAD_REQUEST, code, err.to_string())
            }
            MailroomError::Suppressed { .. } => Self {
                status: StatusCode::BAD_REQUEST,
                code,
                message: err.to_string(),
                details: None,
                headers: HeaderMap::new(),
            },
            MailroomError::RateLimited {
                retry_after_secs,
                limit,
                reset_at_unix,
                ..
            } => {
                let mut headers = HeaderMap::new();
                insert_header(&mut headers, "retry-after", retry_after_secs.to_string());
                insert_header(&mut headers, "x-ratelimit-limit", limit.to_string());
                insert_header(&mut headers, "x-ratelimit-remaining", "0".to_string());
                insert_header(&mut headers, "x-ratelimit-reset", reset_at_unix.to_string());
                Self {
                    status: StatusCode::TOO_MANY_REQUESTS,
                    code,
                    message: err.to_string(),
                    details: None,
                    headers,
                }
            }
            MailroomError::Unauthorized(_) => {
                Self::new(StatusCode::UNAUTHORIZED, code, err.to_string())
            }
            MailroomError::Forbidden(_) => {
                Self::new(StatusCode::FORBIDDEN, code, err.to_string())
            }
            MailroomError::AppNotFound(_)
            | MailroomError::QueueNotFound(_)
            | MailroomError::EmailNotFound(_)
            | MailroomError::SmtpConfigNotFound(_) => {
                Self::new(StatusCode::NOT_FOUND, code, err.to_string())
            }
            MailroomError::QueuePaused(_) => {
                Self::new(StatusCode::SERVICE_UNAVAILABLE, code, err.to_string())
            }
            MailroomError::Conflict(_)
            | MailroomError::IdempotencyConflict(_)
            | MailroomError::InvalidTransition { .. } => {
                Self::new(StatusCode::CONFLICT, code, err.to_string())
            }
            MailroomError::Smtp(_) => Self::new(StatusCode::BAD_GATEWAY, code, err.to_string()),
            other => {
                tracing::error!("internal error surfaced to API: {other}");
                Self::new(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL_ERROR",
                    "internal error",
                )
            }
        }
    }
}

fn insert_header(headers: &mut HeaderMap, name: &'static str, value: String) {
    if let Ok(value) = HeaderValue::from_str(&value) {
        headers.insert(HeaderName::from_static(name), value);
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut error = json!({
            "code": self.code,
            "message": self.message,
        });
        if let Some(details) = self.details {
            error["details"] = details;
        }
        let body = Json(json!({ "success": false, "error": error }));
        (self.status, self.headers, body).into_response()
    }
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_limited_carries_headers() {
        let api: ApiError = MailroomError::RateLimited {
            scope: "queue".to_string(),
            retry_after_secs: 60,
            limit: 1,
            reset_at_unix: 1700000060,
        }
        .into();

        assert_eq!(api.status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(api.headers.get("retry-after").unwrap(), "60");
        assert_eq!(api.headers.get("x-ratelimit-remaining").unwrap(), "0");
        assert_eq!(api.headers.get("x-ratelimit-limit").unwrap(), "1");
    }

    #[test]
    fn test_suppressed_maps_to_400_with_code() {
        let api: ApiError = MailroomError::Suppressed {
            address: "b@y.io".to_string(),
            reason: "manual".to_string(),
        }
        .into();
        assert_eq!(api.status, StatusCode::BAD_REQUEST);
        assert_eq!(api.code, "EMAIL_SUPPRESSED");
    }

    #[test]
    fn test_paused_queue_maps_to_503() {
        let api: ApiError = MailroomError::QueuePaused("transactional".to_string()).into();
        assert_eq!(api.status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(api.code, "QUEUE_PAUSED");
    }

    #[test]
    fn test_internal_details_are_not_leaked() {
        let api: ApiError =
            MailroomError::Internal("secret connection string".to_string()).into();
        assert_eq!(api.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(!api.message.contains("secret"));
    }

    #[test]
    fn test_payload_invalid_exposes_paths() {
        let api: ApiError = MailroomError::PayloadInvalid {
            errors: vec![("to[0].email".to_string(), "missing '@'".to_string())],
        }
        .into();
        let details = api.details.unwrap();
        assert_eq!(details[0]["path"], "to[0].email");
    }
}
