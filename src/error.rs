use axum::{
    Json,
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};
use serde_json::json;

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("Missing API key")]
    MissingApiKey,

    #[error("Invalid API key")]
    InvalidApiKey,

    #[error("API key is revoked")]
    KeyRevoked,

    #[error("Rate limit exceeded, retry in {retry_after_secs}s")]
    RateLimitExceeded { retry_after_secs: u64 },

    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Upstream provider error: {0}")]
    Upstream(String),

    #[error("Upstream provider timed out")]
    UpstreamTimeout,

    #[error("Database error: {0}")]
    Database(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<reqwest::Error> for GatewayError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            GatewayError::UpstreamTimeout
        } else {
            GatewayError::Upstream(err.to_string())
        }
    }
}

impl GatewayError {
    fn status(&self) -> StatusCode {
        match self {
            GatewayError::MissingApiKey | GatewayError::InvalidApiKey => StatusCode::UNAUTHORIZED,
            GatewayError::KeyRevoked => StatusCode::FORBIDDEN,
            GatewayError::RateLimitExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            GatewayError::Upstream(_) => StatusCode::BAD_GATEWAY,
            GatewayError::UpstreamTimeout => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::Database(_) | GatewayError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_type(&self) -> &'static str {
        match self {
            GatewayError::MissingApiKey
            | GatewayError::InvalidApiKey
            | GatewayError::KeyRevoked => "authentication_error",
            GatewayError::RateLimitExceeded { .. } => "rate_limit_error",
            GatewayError::Validation(_) => "invalid_request_error",
            GatewayError::Upstream(_) | GatewayError::UpstreamTimeout => "upstream_error",
            GatewayError::Database(_) | GatewayError::Io(_) => "api_error",
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let mut error = json!({
            "type": self.error_type(),
            "message": self.to_string(),
        });

        if let GatewayError::RateLimitExceeded { retry_after_secs } = &self
            && let Some(obj) = error.as_object_mut()
        {
            obj.insert("retryAfterSeconds".into(), json!(retry_after_secs));
        }

        let mut response = (self.status(), Json(json!({ "error": error }))).into_response();

        if let GatewayError::RateLimitExceeded { retry_after_secs } = &self
            && let Ok(value) = retry_after_secs.to_string().parse()
        {
            response.headers_mut().insert(header::RETRY_AFTER, value);
        }

        response
    }
}
