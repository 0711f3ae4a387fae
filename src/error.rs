use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use chrono::{DateTime, SecondsFormat, Utc};

use crate::gateway::GatewayError;
use crate::session::SessionError;
use crate::validation::ValidationError;

/// Every way an AI route can fail before (or while) streaming.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("no credits remaining")]
    InsufficientCredits,

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("rate limit exceeded, retry in {retry_after}s")]
    RateLimited {
        limit: u32,
        retry_after: i64,
        reset: DateTime<Utc>,
    },

    #[error("model not found: {0}")]
    ModelNotFound(String),

    #[error("stream failed: {0}")]
    Stream(String),

    #[error("{0}")]
    Unknown(String),
}

impl AppError {
    pub fn status(&self) -> StatusCode {
        match self {
            AppError::Authentication(_) => StatusCode::UNAUTHORIZED,
            AppError::InsufficientCredits => StatusCode::PAYMENT_REQUIRED,
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            AppError::ModelNotFound(_) => StatusCode::BAD_REQUEST,
            AppError::Stream(_) | AppError::Unknown(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    // Label used in logs and the rejection counter
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::Authentication(_) => "authentication",
            AppError::InsufficientCredits => "insufficient_credits",
            AppError::Validation(_) => "validation",
            AppError::RateLimited { .. } => "rate_limited",
            AppError::ModelNotFound(_) => "model_not_found",
            AppError::Stream(_) => "stream",
            AppError::Unknown(_) => "unknown",
        }
    }

    // Text the client is allowed to see
    pub fn client_message(&self) -> String {
        match self {
            AppError::Authentication(_) => "Unauthorized".to_string(),
            AppError::InsufficientCredits => "You have no credits remaining".to_string(),
            AppError::Validation(err) => err.message().to_string(),
            AppError::RateLimited { .. } => "Too many requests, please try again later".to_string(),
            AppError::ModelNotFound(_) => "Invalid model".to_string(),
            AppError::Stream(_) | AppError::Unknown(_) => "Internal server error".to_string(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let mut response = (self.status(), self.client_message()).into_response();

        if let AppError::RateLimited {
            limit,
            retry_after,
            reset,
        } = &self
        {
            let headers = response.headers_mut();
            headers.insert(header::RETRY_AFTER, HeaderValue::from(*retry_after));
            headers.insert("x-ratelimit-limit", HeaderValue::from(*limit));
            headers.insert("x-ratelimit-remaining", HeaderValue::from(0u32));
            if let Ok(value) =
                HeaderValue::from_str(&reset.to_rfc3339_opts(SecondsFormat::Millis, true))
            {
                headers.insert("x-ratelimit-reset", value);
            }
        }

        response
    }
}

impl From<SessionError> for AppError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::MissingToken | SessionError::InvalidToken | SessionError::NotSubscribed => {
                AppError::Authentication(err.to_string())
            }
            SessionError::NoCredits => AppError::InsufficientCredits,
            SessionError::Store(msg) => AppError::Unknown(msg),
        }
    }
}

impl From<GatewayError> for AppError {
    fn from(err: GatewayError) -> Self {
        AppError::Unknown(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn statuses_follow_the_error_kind() {
        assert_eq!(
            AppError::Authentication("x".into()).status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            AppError::ModelNotFound("m".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            AppError::Unknown("db down".into()).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn internal_detail_is_not_leaked() {
        let err = AppError::Unknown("connection refused to 10.0.0.3".into());
        assert_eq!(err.client_message(), "Internal server error");
    }

    #[test]
    fn rate_limited_response_carries_retry_headers() {
        let reset = Utc.with_ymd_and_hms(2026, 1, 1, 0, 1, 0).unwrap();
        let response = AppError::RateLimited {
            limit: 60,
            retry_after: 42,
            reset,
        }
        .into_response();

        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[header::RETRY_AFTER], "42");
        assert_eq!(response.headers()["x-ratelimit-limit"], "60");
        assert_eq!(
            response.headers()["x-ratelimit-reset"],
            "2026-01-01T00:01:00.000Z"
        );
    }

    #[test]
    fn session_errors_map_to_closed_kinds() {
        assert_eq!(
            AppError::from(SessionError::MissingToken).kind(),
            "authentication"
        );
        assert_eq!(
            AppError::from(SessionError::NotSubscribed).kind(),
            "authentication"
        );
        assert_eq!(
            AppError::from(SessionError::NoCredits).status(),
            StatusCode::PAYMENT_REQUIRED
        );
        assert_eq!(
            AppError::from(SessionError::Store("io".into())).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
