use std::sync::Arc;

use bytes::Bytes;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{info, warn};

use llmgate_protocol::chat::ChatCompletionRequest;
use llmgate_provider::{
    AdapterRegistry, EventReceiver, ProviderRequest, StreamEvent, UpstreamAdapter,
};

use crate::auth::AuthManager;
use crate::config::ProviderModel;
use crate::error::GatewayError;
use crate::limiter::RateLimiter;
use crate::normalize;
use crate::router::ModelRouter;
use crate::usage::UsageTracker;

pub const DEFAULT_MAX_RETRIES: usize = 3;

/// A failed attempt: the surfaced error plus whether the dispatch loop
/// may rotate to the next candidate.
struct AttemptFailure {
    error: GatewayError,
    retryable: bool,
}

impl AttemptFailure {
    fn fatal(error: GatewayError) -> Self {
        Self {
            error,
            retryable: false,
        }
    }
}

/// Orchestrates one request across limiter, auth, adapter, and
/// normalizer. Owns no state of its own; the long-lived components are
/// shared behind `Arc`s.
pub struct Dispatcher {
    router: Arc<ModelRouter>,
    limiter: Arc<RateLimiter>,
    auth: Arc<AuthManager>,
    adapters: Arc<AdapterRegistry>,
    usage: Arc<UsageTracker>,
    max_retries: usize,
}

impl Dispatcher {
    pub fn new(
        router: Arc<ModelRouter>,
        limiter: Arc<RateLimiter>,
        auth: Arc<AuthManager>,
        adapters: Arc<AdapterRegistry>,
        usage: Arc<UsageTracker>,
    ) -> Self {
        Self {
            router,
            limiter,
            auth,
            adapters,
            usage,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    pub fn with_max_retries(mut self, max_retries: usize) -> Self {
        self.max_retries = max_retries.max(1);
        self
    }

    /// Validate the raw body into a canonical request. Shape errors are
    /// reported with field-level messages rather than serde noise.
    pub fn parse(body: &[u8]) -> Result<ChatCompletionRequest, GatewayError> {
        let value: Value = serde_json::from_slice(body).map_err(|err| {
            GatewayError::Validation(format!("request body must be valid JSON: {err}"))
        })?;
        let Some(object) = value.as_object() else {
            return Err(GatewayError::Validation(
                "request body must be a JSON object".to_string(),
            ));
        };

        let model_ok = object
            .get("model")
            .and_then(|model| model.as_str())
            .map(|model| !model.is_empty())
            .unwrap_or(false);
        if !model_ok {
            return Err(GatewayError::Validation(
                "model is required and must be a non-empty string".to_string(),
            ));
        }

        let Some(messages) = object.get("messages").and_then(|m| m.as_array()) else {
            return Err(GatewayError::Validation(
                "messages is required and must be an array".to_string(),
            ));
        };
        if messages.is_empty() {
            return Err(GatewayError::Validation(
                "messages must be a non-empty array".to_string(),
            ));
        }
        for (index, message) in messages.iter().enumerate() {
            let role_ok = message
                .get("role")
                .map(|role| role.is_string())
                .unwrap_or(false);
            if !role_ok {
                return Err(GatewayError::Validation(format!(
                    "messages[{index}] must have a string role"
                )));
            }
            let has_content = message
                .get("content")
                .map(|content| !content.is_null())
                .unwrap_or(false);
            let has_tool_calls = message
                .get("tool_calls")
                .map(|calls| !calls.is_null())
                .unwrap_or(false);
            let has_function_call = message
                .get("function_call")
                .map(|call| !call.is_null())
                .unwrap_or(false);
            if !has_content && !has_tool_calls && !has_function_call {
                return Err(GatewayError::Validation(format!(
                    "messages[{index}] must have content, tool_calls, or function_call"
                )));
            }
        }

        serde_json::from_value(value)
            .map_err(|err| GatewayError::Validation(format!("invalid request shape: {err}")))
    }

    pub async fn complete(
        &self,
        req: &ChatCompletionRequest,
    ) -> Result<llmgate_protocol::chat::ChatCompletionResponse, GatewayError> {
        let candidates = self
            .router
            .resolve(&req.model)
            .map_err(|err| GatewayError::Validation(err.to_string()))?;
        let mut selected = self.router.select(&candidates).await;
        if selected.is_none() {
            return Err(GatewayError::no_available_provider());
        }

        let mut last_err: Option<GatewayError> = None;
        let mut attempts = 0;
        while attempts < self.max_retries {
            let Some(candidate) = selected.take() else {
                break;
            };
            attempts += 1;

            match self.attempt(&candidate, req).await {
                Ok(reply) => {
                    if let Some(usage) = &reply.usage {
                        self.usage.record(&candidate.provider, &candidate.model, usage);
                    }
                    info!(
                        event = "dispatch_complete",
                        model = %req.model,
                        provider = %candidate.provider,
                        attempts = attempts
                    );
                    return Ok(normalize::to_response(reply, &req.model));
                }
                Err(failure) => {
                    warn!(
                        event = "dispatch_attempt_failed",
                        model = %req.model,
                        provider = %candidate.provider,
                        attempt = attempts,
                        retryable = failure.retryable,
                        error = %failure.error
                    );
                    let rotate = failure.retryable && attempts < self.max_retries;
                    last_err = Some(failure.error);
                    if !rotate {
                        break;
                    }
                    selected = self
                        .router
                        .next_provider(&req.model, &candidate.provider)
                        .await
                        .ok()
                        .flatten();
                }
            }
        }

        Err(last_err.unwrap_or_else(GatewayError::no_available_provider))
    }

    /// SSE frames for a streaming request. Provider fallback applies
    /// only until the first upstream event: once a chunk has been
    /// delivered, the stream's identity is committed and a later
    /// failure is announced in-band (error frame, then `[DONE]`).
    pub async fn complete_stream(
        &self,
        req: &ChatCompletionRequest,
    ) -> Result<mpsc::Receiver<Bytes>, GatewayError> {
        let candidates = self
            .router
            .resolve(&req.model)
            .map_err(|err| GatewayError::Validation(err.to_string()))?;
        let mut selected = self.router.select(&candidates).await;
        if selected.is_none() {
            return Err(GatewayError::no_available_provider());
        }

        let mut last_err: Option<GatewayError> = None;
        let mut attempts = 0;
        while attempts < self.max_retries {
            let Some(candidate) = selected.take() else {
                break;
            };
            attempts += 1;

            match self.attempt_stream(&candidate, req).await {
                Ok((first, events)) => {
                    info!(
                        event = "dispatch_stream_committed",
                        model = %req.model,
                        provider = %candidate.provider,
                        attempts = attempts
                    );
                    let (tx, rx) = mpsc::channel::<Bytes>(16);
                    let stream_id = normalize::new_stream_id();
                    let requested_model = req.model.clone();
                    let usage = self.usage.clone();
                    tokio::spawn(forward_stream(
                        first,
                        events,
                        tx,
                        stream_id,
                        requested_model,
                        candidate,
                        usage,
                    ));
                    return Ok(rx);
                }
                Err(failure) => {
                    warn!(
                        event = "dispatch_attempt_failed",
                        model = %req.model,
                        provider = %candidate.provider,
                        attempt = attempts,
                        retryable = failure.retryable,
                        error = %failure.error
                    );
                    let rotate = failure.retryable && attempts < self.max_retries;
                    last_err = Some(failure.error);
                    if !rotate {
                        break;
                    }
                    selected = self
                        .router
                        .next_provider(&req.model, &candidate.provider)
                        .await
                        .ok()
                        .flatten();
                }
            }
        }

        Err(last_err.unwrap_or_else(GatewayError::no_available_provider))
    }

    async fn prepare(
        &self,
        candidate: &ProviderModel,
        req: &ChatCompletionRequest,
        stream: bool,
    ) -> Result<(Arc<dyn UpstreamAdapter>, ProviderRequest), AttemptFailure> {
        // Queue-full is a rate_limit on the wire but the caller must back
        // off, not fail over.
        self.limiter
            .acquire(&candidate.provider)
            .await
            .map_err(|err| AttemptFailure::fatal(GatewayError::RateLimit(err.to_string())))?;

        let token = self
            .auth
            .get_valid_token(&candidate.provider)
            .await
            .map_err(|err| AttemptFailure::fatal(GatewayError::Auth(err.to_string())))?;

        let adapter = self.adapters.get(&candidate.provider).ok_or_else(|| {
            AttemptFailure {
                error: GatewayError::ServiceUnavailable(format!(
                    "no adapter registered for provider {}",
                    candidate.provider
                )),
                retryable: true,
            }
        })?;

        let provider_req = ProviderRequest {
            model: candidate.model.clone(),
            messages: req.messages.clone(),
            stream,
            temperature: req.temperature,
            top_p: req.top_p,
            max_tokens: req.max_tokens,
            stop: req.stop.clone(),
            tools: req.tools.clone(),
            access_token: token.access_token,
        };
        Ok((adapter, provider_req))
    }

    async fn attempt(
        &self,
        candidate: &ProviderModel,
        req: &ChatCompletionRequest,
    ) -> Result<llmgate_provider::ProviderReply, AttemptFailure> {
        let (adapter, provider_req) = self.prepare(candidate, req, false).await?;
        adapter.call(provider_req).await.map_err(|err| {
            let retryable = err.retryable;
            AttemptFailure {
                error: err.into(),
                retryable,
            }
        })
    }

    /// Open the upstream stream and wait for its first event; an error
    /// before any event still counts as a failed attempt eligible for
    /// fallback.
    async fn attempt_stream(
        &self,
        candidate: &ProviderModel,
        req: &ChatCompletionRequest,
    ) -> Result<(Option<StreamEvent>, EventReceiver), AttemptFailure> {
        let (adapter, provider_req) = self.prepare(candidate, req, true).await?;
        let mut events = adapter.stream(provider_req).await.map_err(|err| {
            let retryable = err.retryable;
            AttemptFailure {
                error: err.into(),
                retryable,
            }
        })?;

        match events.recv().await {
            Some(Ok(event)) => Ok((Some(event), events)),
            Some(Err(err)) => {
                let retryable = err.retryable;
                Err(AttemptFailure {
                    error: err.into(),
                    retryable,
                })
            }
            // Upstream closed cleanly before sending anything: commit an
            // empty stream rather than replaying the request elsewhere.
            None => Ok((None, events)),
        }
    }
}

async fn forward_stream(
    first: Option<StreamEvent>,
    mut events: EventReceiver,
    tx: mpsc::Sender<Bytes>,
    stream_id: String,
    requested_model: String,
    candidate: ProviderModel,
    usage: Arc<UsageTracker>,
) {
    if let Some(event) = first
        && !emit_event(&tx, event, &stream_id, &requested_model, &candidate, &usage).await
    {
        return;
    }

    while let Some(item) = events.recv().await {
        match item {
            Ok(event) => {
                if !emit_event(&tx, event, &stream_id, &requested_model, &candidate, &usage).await
                {
                    return;
                }
            }
            Err(err) => {
                warn!(
                    event = "stream_failed_midway",
                    provider = %candidate.provider,
                    error = %err
                );
                let gateway_err = GatewayError::from(err);
                let _ = tx.send(normalize::sse_error_frame(&gateway_err)).await;
                break;
            }
        }
    }

    let _ = tx.send(normalize::sse_done()).await;
}

/// False when the client went away; the upstream receiver is dropped
/// with us, which aborts the adapter's pump.
async fn emit_event(
    tx: &mpsc::Sender<Bytes>,
    event: StreamEvent,
    stream_id: &str,
    requested_model: &str,
    candidate: &ProviderModel,
    usage: &UsageTracker,
) -> bool {
    if let Some(sample) = &event.usage {
        usage.record(&candidate.provider, &candidate.model, sample);
    }
    let chunk = normalize::to_chunk(event, requested_model, stream_id);
    tx.send(normalize::sse_frame(&chunk)).await.is_ok()
}
