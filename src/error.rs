use crate::security::moderation::{ModerationError, Rejection};
use crate::store::StoreError;
use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;
use tracing::error;

/// Every way a request can stop short of success.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("rate limit exceeded, retry in {retry_after_secs}s")]
    Throttled { retry_after_secs: u64 },

    #[error("access denied")]
    Blocked,

    #[error("{0}")]
    InvalidContent(String),

    #[error("not found")]
    NotFound,

    #[error("missing or invalid user identity")]
    Unauthorized,

    #[error("not allowed to modify this resource")]
    Forbidden,

    #[error(transparent)]
    Infrastructure(#[from] anyhow::Error),
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_seconds: Option<u64>,
}

impl AppError {
    /// Throttled, rounding the wait up to whole seconds.
    pub fn throttled(retry_after: Duration) -> Self {
        let mut secs = retry_after.as_secs();
        if retry_after.subsec_nanos() > 0 {
            secs += 1;
        }
        AppError::Throttled {
            retry_after_secs: secs.max(1),
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            AppError::Throttled { .. } => StatusCode::TOO_MANY_REQUESTS,
            AppError::Blocked | AppError::Forbidden => StatusCode::FORBIDDEN,
            AppError::InvalidContent(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound => StatusCode::NOT_FOUND,
            AppError::Unauthorized => StatusCode::UNAUTHORIZED,
            AppError::Infrastructure(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            AppError::Throttled { .. } => "rate_limit_exceeded",
            AppError::Blocked => "access_denied",
            AppError::InvalidContent(_) => "invalid_content",
            AppError::NotFound => "not_found",
            AppError::Unauthorized => "unauthorized",
            AppError::Forbidden => "forbidden",
            AppError::Infrastructure(_) => "internal_error",
        }
    }

    fn body(&self) -> ErrorBody {
        let (message, retry_after_seconds) = match self {
            AppError::Throttled { retry_after_secs } => (
                format!("Please wait {} seconds before trying again", retry_after_secs),
                Some(*retry_after_secs),
            ),
            AppError::Blocked => ("Access denied".to_string(), None),
            // Internals stay in the log
            AppError::Infrastructure(_) => ("Something went wrong, please try again later".to_string(), None),
            other => (other.to_string(), None),
        };
        ErrorBody {
            error: self.code(),
            message,
            retry_after_seconds,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        if let AppError::Infrastructure(e) = &self {
            error!(error = ?e, "Request failed on infrastructure error");
        }

        let status = self.status();
        let mut response = (status, Json(self.body())).into_response();
        if let AppError::Throttled { retry_after_secs } = self {
            if let Ok(value) = HeaderValue::from_str(&retry_after_secs.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}

impl From<Rejection> for AppError {
    fn from(rejection: Rejection) -> Self {
        AppError::InvalidContent(rejection.message)
    }
}

impl From<ModerationError> for AppError {
    fn from(e: ModerationError) -> Self {
        AppError::Infrastructure(e.into())
    }
}

impl From<StoreError> for AppError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound => AppError::NotFound,
            StoreError::NotOwner => AppError::Forbidden,
            other => AppError::Infrastructure(other.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::moderation::ReasonCode;

    #[test]
    fn test_status_mapping() {
        assert_eq!(AppError::Throttled { retry_after_secs: 3 }.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(AppError::Blocked.status(), StatusCode::FORBIDDEN);
        assert_eq!(
            AppError::from(Rejection::new(ReasonCode::TooLong, "too long")).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(AppError::from(StoreError::NotFound).status(), StatusCode::NOT_FOUND);
        assert_eq!(
            AppError::from(StoreError::Unavailable("db down".into())).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_infrastructure_message_is_generic() {
        let body = AppError::Infrastructure(anyhow::anyhow!("connection refused to 10.0.0.5")).body();
        assert!(!body.message.contains("10.0.0.5"));
        assert_eq!(body.error, "internal_error");
    }

    #[test]
    fn test_throttled_rounds_up() {
        assert!(matches!(
            AppError::throttled(Duration::from_millis(1500)),
            AppError::Throttled { retry_after_secs: 2 }
        ));
        assert!(matches!(
            AppError::throttled(Duration::ZERO),
            AppError::Throttled { retry_after_secs: 1 }
        ));
    }

    #[test]
    fn test_throttled_carries_retry_after() {
        let response = AppError::Throttled { retry_after_secs: 42 }.into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers().get(header::RETRY_AFTER).unwrap(), "42");
    }
}
