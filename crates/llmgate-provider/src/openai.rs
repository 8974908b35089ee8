use std::sync::Arc;

use futures_util::StreamExt;
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{info, warn};
use wreq::Client;

use llmgate_protocol::chat::{
    ChatCompletionRequest, FinishReason, FunctionCall, MessageDelta, ToolCall, Usage,
};
use llmgate_protocol::sse::{DONE_PAYLOAD, DataFrameDecoder};

use crate::adapter::{EventReceiver, ProviderReply, ProviderRequest, StreamEvent, UpstreamAdapter};
use crate::client::{REQUEST_TIMEOUT, error_from_response};
use crate::error::UpstreamError;
use crate::user_agent::UserAgentPool;

/// Adapter for OpenAI-compatible upstreams: the canonical request is
/// already in their wire format, so shaping is a near passthrough.
pub struct OpenAiAdapter {
    name: String,
    endpoint: String,
    client: Client,
    agents: Arc<UserAgentPool>,
}

impl OpenAiAdapter {
    pub fn new(
        name: impl Into<String>,
        api_endpoint: impl Into<String>,
        client: Client,
        agents: Arc<UserAgentPool>,
    ) -> Self {
        Self {
            name: name.into(),
            endpoint: api_endpoint.into().trim_end_matches('/').to_string(),
            client,
            agents,
        }
    }

    fn wire_body(req: &ProviderRequest, stream: bool) -> ChatCompletionRequest {
        ChatCompletionRequest {
            model: req.model.clone(),
            messages: req.messages.clone(),
            stream: Some(stream),
            temperature: req.temperature,
            top_p: req.top_p,
            max_tokens: req.max_tokens,
            stop: req.stop.clone(),
            tools: req.tools.clone(),
            tool_choice: None,
            user: None,
        }
    }

    async fn send(
        &self,
        req: &ProviderRequest,
        stream: bool,
    ) -> Result<wreq::Response, UpstreamError> {
        let url = format!("{}/chat/completions", self.endpoint);
        let body = serde_json::to_vec(&Self::wire_body(req, stream))
            .map_err(|err| UpstreamError::invalid(&self.name, err.to_string()))?;

        info!(
            event = "upstream_request",
            provider = %self.name,
            model = %req.model,
            is_stream = stream
        );

        let mut builder = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", req.access_token))
            .header("Content-Type", "application/json")
            .header("User-Agent", self.agents.next())
            .body(body);
        if !stream {
            builder = builder.timeout(REQUEST_TIMEOUT);
        }

        let resp = builder
            .send()
            .await
            .map_err(|err| UpstreamError::transport(&self.name, err.to_string()))?;

        if !resp.status().is_success() {
            let err = error_from_response(&self.name, resp).await;
            warn!(
                event = "upstream_response",
                provider = %self.name,
                status = ?err.status,
                error = %err.message
            );
            return Err(err);
        }
        Ok(resp)
    }
}

#[async_trait::async_trait]
impl UpstreamAdapter for OpenAiAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn call(&self, req: ProviderRequest) -> Result<ProviderReply, UpstreamError> {
        let resp = self.send(&req, false).await?;
        let body = resp
            .bytes()
            .await
            .map_err(|err| UpstreamError::transport(&self.name, err.to_string()))?;
        let wire = serde_json::from_slice::<WireResponse>(&body).map_err(|err| {
            UpstreamError::transport(&self.name, format!("decode response: {err}"))
        })?;

        let choice = wire.choices.into_iter().next();
        Ok(ProviderReply {
            content: choice.as_ref().and_then(|c| c.message.content.clone()),
            tool_calls: choice.as_ref().and_then(|c| c.message.tool_calls.clone()),
            function_call: choice.as_ref().and_then(|c| c.message.function_call.clone()),
            finish_reason: choice
                .as_ref()
                .and_then(|c| c.finish_reason.as_deref())
                .and_then(parse_finish),
            usage: wire.usage,
        })
    }

    async fn stream(&self, req: ProviderRequest) -> Result<EventReceiver, UpstreamError> {
        let resp = self.send(&req, true).await?;
        let provider = self.name.clone();
        let (tx, rx) = mpsc::channel(16);

        tokio::spawn(async move {
            let mut decoder = DataFrameDecoder::new();
            let mut stream = resp.bytes_stream();
            'pump: while let Some(item) = stream.next().await {
                let chunk = match item {
                    Ok(chunk) => chunk,
                    Err(err) => {
                        let _ = tx
                            .send(Err(UpstreamError::transport(&provider, err.to_string())))
                            .await;
                        break;
                    }
                };
                for payload in decoder.push(&chunk) {
                    if payload == DONE_PAYLOAD {
                        break 'pump;
                    }
                    // Malformed frames are dropped, not fatal.
                    let Ok(wire) = serde_json::from_str::<WireChunk>(&payload) else {
                        continue;
                    };
                    if tx.send(Ok(chunk_event(wire))).await.is_err() {
                        break 'pump;
                    }
                }
            }
        });

        Ok(rx)
    }
}

fn chunk_event(wire: WireChunk) -> StreamEvent {
    let choice = wire.choices.into_iter().next();
    StreamEvent {
        delta: choice.as_ref().map(|c| c.delta.clone()).unwrap_or_default(),
        finish_reason: choice
            .as_ref()
            .and_then(|c| c.finish_reason.as_deref())
            .and_then(parse_finish),
        usage: wire.usage,
    }
}

fn parse_finish(value: &str) -> Option<FinishReason> {
    match value {
        "stop" => Some(FinishReason::Stop),
        "length" => Some(FinishReason::Length),
        "tool_calls" => Some(FinishReason::ToolCalls),
        "content_filter" => Some(FinishReason::ContentFilter),
        "function_call" => Some(FinishReason::FunctionCall),
        _ => None,
    }
}

// Lenient parse shapes: unknown finish reasons and extra fields must not
// fail the request, so the typed response structs are not reused here.

#[derive(Debug, Deserialize)]
struct WireResponse {
    #[serde(default)]
    choices: Vec<WireChoice>,
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct WireChoice {
    message: WireMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireMessage {
    content: Option<String>,
    tool_calls: Option<Vec<ToolCall>>,
    function_call: Option<FunctionCall>,
}

#[derive(Debug, Deserialize)]
struct WireChunk {
    #[serde(default)]
    choices: Vec<WireStreamChoice>,
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct WireStreamChoice {
    #[serde(default)]
    delta: MessageDelta,
    finish_reason: Option<String>,
}
