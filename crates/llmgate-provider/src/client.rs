use std::time::Duration;

use wreq::Client;

use crate::error::UpstreamError;

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Deadline for a single non-streaming call, and the idle ceiling
/// between consecutive stream chunks.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Shared upstream HTTP client. Streaming responses must outlive the
/// per-request deadline, so the 30 s budget is enforced as a read
/// timeout here and applied as a whole-request timeout per call site.
pub fn build_client() -> Result<Client, wreq::Error> {
    Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .read_timeout(REQUEST_TIMEOUT)
        .build()
}

/// Drain a non-2xx response into a classified error, preferring the
/// provider's own `error.message` when the body carries one.
pub(crate) async fn error_from_response(provider: &str, resp: wreq::Response) -> UpstreamError {
    let status = resp.status().as_u16();
    let message = match resp.bytes().await {
        Ok(body) => extract_error_message(&body)
            .unwrap_or_else(|| String::from_utf8_lossy(&body).trim().to_string()),
        Err(err) => err.to_string(),
    };
    let message = if message.is_empty() {
        format!("upstream returned status {status}")
    } else {
        message
    };
    UpstreamError::from_status(provider, status, message)
}

fn extract_error_message(body: &[u8]) -> Option<String> {
    let value = serde_json::from_slice::<serde_json::Value>(body).ok()?;
    value
        .get("error")
        .and_then(|e| e.get("message"))
        .and_then(|m| m.as_str())
        .map(|m| m.to_string())
}
