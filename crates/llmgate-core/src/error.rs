use llmgate_protocol::chat::{ErrorBody, ErrorPayload};
use llmgate_provider::{ErrorKind, UpstreamError};
use thiserror::Error;

/// A request-level failure with its canonical wire classification.
/// Retryability is decided where errors arise (see the dispatch loop);
/// by the time a `GatewayError` surfaces, only kind and message matter.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GatewayError {
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    InvalidRequest(String),
    #[error("{0}")]
    Auth(String),
    #[error("{0}")]
    RateLimit(String),
    #[error("{0}")]
    ServiceUnavailable(String),
    #[error("{0}")]
    Unknown(String),
}

impl GatewayError {
    pub fn no_available_provider() -> Self {
        Self::ServiceUnavailable("No available provider".to_string())
    }

    pub fn http_status(&self) -> u16 {
        match self {
            GatewayError::Validation(_) | GatewayError::InvalidRequest(_) => 400,
            GatewayError::Auth(_) => 401,
            GatewayError::RateLimit(_) => 429,
            GatewayError::ServiceUnavailable(_) => 503,
            GatewayError::Unknown(_) => 500,
        }
    }

    pub fn error_type(&self) -> &'static str {
        match self {
            GatewayError::Validation(_) | GatewayError::InvalidRequest(_) => {
                "invalid_request_error"
            }
            GatewayError::Auth(_) => "authentication_error",
            GatewayError::RateLimit(_) => "rate_limit_error",
            GatewayError::ServiceUnavailable(_) | GatewayError::Unknown(_) => "server_error",
        }
    }

    pub fn error_code(&self) -> Option<&'static str> {
        match self {
            GatewayError::Auth(_) => Some("invalid_api_key"),
            GatewayError::RateLimit(_) => Some("rate_limit_exceeded"),
            GatewayError::ServiceUnavailable(_) => Some("service_unavailable"),
            _ => None,
        }
    }

    pub fn payload(&self) -> ErrorPayload {
        ErrorPayload {
            error: ErrorBody {
                message: self.to_string(),
                r#type: self.error_type().to_string(),
                code: self.error_code().map(|code| code.to_string()),
            },
        }
    }
}

impl From<UpstreamError> for GatewayError {
    fn from(err: UpstreamError) -> Self {
        let message = err.to_string();
        match err.kind {
            ErrorKind::Auth => GatewayError::Auth(message),
            ErrorKind::RateLimit => GatewayError::RateLimit(message),
            ErrorKind::ServiceUnavailable => GatewayError::ServiceUnavailable(message),
            ErrorKind::InvalidRequest => GatewayError::InvalidRequest(message),
            ErrorKind::Unknown => GatewayError::Unknown(message),
        }
    }
}
