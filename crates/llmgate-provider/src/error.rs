use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Auth,
    RateLimit,
    ServiceUnavailable,
    InvalidRequest,
    Unknown,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Auth => "auth",
            ErrorKind::RateLimit => "rate_limit",
            ErrorKind::ServiceUnavailable => "service_unavailable",
            ErrorKind::InvalidRequest => "invalid_request",
            ErrorKind::Unknown => "unknown",
        }
    }
}

/// A failed upstream attempt, classified for the dispatch loop.
///
/// `retryable` decides whether the router may rotate to the next
/// candidate; it is fixed at construction because the same kind can be
/// retryable or not depending on where the error arose (a provider 429
/// is retryable, a local queue-full is not).
#[derive(Debug, Clone, Error)]
#[error("{provider}: {message}")]
pub struct UpstreamError {
    pub provider: String,
    pub status: Option<u16>,
    pub message: String,
    pub kind: ErrorKind,
    pub retryable: bool,
}

impl UpstreamError {
    pub fn from_status(provider: impl Into<String>, status: u16, message: impl Into<String>) -> Self {
        let (kind, retryable) = classify_status(status);
        Self {
            provider: provider.into(),
            status: Some(status),
            message: message.into(),
            kind,
            retryable,
        }
    }

    /// Connection, TLS, and timeout failures: no status to classify, so
    /// treat them like an unavailable upstream and let the router move on.
    pub fn transport(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            status: None,
            message: message.into(),
            kind: ErrorKind::ServiceUnavailable,
            retryable: true,
        }
    }

    pub fn invalid(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            status: None,
            message: message.into(),
            kind: ErrorKind::InvalidRequest,
            retryable: false,
        }
    }
}

fn classify_status(status: u16) -> (ErrorKind, bool) {
    match status {
        401 | 403 => (ErrorKind::Auth, false),
        429 => (ErrorKind::RateLimit, true),
        400 => (ErrorKind::InvalidRequest, false),
        500..=599 => (ErrorKind::ServiceUnavailable, true),
        _ => (ErrorKind::Unknown, false),
    }
}
