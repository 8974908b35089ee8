use std::sync::Arc;

use futures_util::StreamExt;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;
use wreq::Client;

use llmgate_protocol::chat::{
    FinishReason, FunctionCall, FunctionCallDelta, MessageDelta, StopSequences, ToolCall,
    ToolCallDelta, ToolCallType, Usage,
};
use llmgate_protocol::gemini::{
    Candidate, Content, FunctionDeclaration, GenerateContentRequest, GenerateContentResponse,
    GenerationConfig, Part, Tool, UsageMetadata,
};
use llmgate_protocol::sse::DataFrameDecoder;

use crate::adapter::{EventReceiver, ProviderReply, ProviderRequest, StreamEvent, UpstreamAdapter};
use crate::client::{REQUEST_TIMEOUT, error_from_response};
use crate::error::UpstreamError;
use crate::user_agent::UserAgentPool;

/// Adapter for Gemini `generateContent` upstreams. Chat messages are
/// refolded into `contents` (Gemini has no system role on this path:
/// system text rides the next user turn), function traffic maps onto
/// `functionCall`/`functionResponse` parts, and streaming uses the
/// `alt=sse` variant.
pub struct GeminiAdapter {
    name: String,
    endpoint: String,
    client: Client,
    agents: Arc<UserAgentPool>,
}

impl GeminiAdapter {
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

    async fn send(
        &self,
        req: &ProviderRequest,
        stream: bool,
    ) -> Result<wreq::Response, UpstreamError> {
        let action = if stream {
            "streamGenerateContent?alt=sse"
        } else {
            "generateContent"
        };
        let url = format!("{}/models/{}:{action}", self.endpoint, req.model);
        let body = serde_json::to_vec(&translate_request(req))
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
impl UpstreamAdapter for GeminiAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn call(&self, req: ProviderRequest) -> Result<ProviderReply, UpstreamError> {
        let resp = self.send(&req, false).await?;
        let body = resp
            .bytes()
            .await
            .map_err(|err| UpstreamError::transport(&self.name, err.to_string()))?;
        let wire = serde_json::from_slice::<GenerateContentResponse>(&body).map_err(|err| {
            UpstreamError::transport(&self.name, format!("decode response: {err}"))
        })?;
        Ok(reply_from_response(wire))
    }

    async fn stream(&self, req: ProviderRequest) -> Result<EventReceiver, UpstreamError> {
        let resp = self.send(&req, true).await?;
        let provider = self.name.clone();
        let (tx, rx) = mpsc::channel(16);

        tokio::spawn(async move {
            let mut decoder = DataFrameDecoder::new();
            let mut stream = resp.bytes_stream();
            // The Gemini stream has no terminal sentinel; it ends with the body.
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
                    let Ok(wire) = serde_json::from_str::<GenerateContentResponse>(&payload)
                    else {
                        continue;
                    };
                    if tx.send(Ok(stream_event(wire))).await.is_err() {
                        break 'pump;
                    }
                }
            }
        });

        Ok(rx)
    }
}

/// Refold canonical chat messages into Gemini `contents`.
///
/// Consecutive system messages are joined with blank lines and prefixed
/// as `[System] …` onto the next user turn (or a trailing user turn if
/// none follows). Assistant function/tool calls become `functionCall`
/// parts with decoded args; `tool`/`function` results become user-role
/// `functionResponse` parts.
fn translate_request(req: &ProviderRequest) -> GenerateContentRequest {
    let mut contents = Vec::new();
    let mut pending_system: Vec<String> = Vec::new();

    for message in &req.messages {
        match message.role.as_str() {
            "system" => {
                if let Some(text) = message.text_content() {
                    pending_system.push(text);
                }
            }
            "user" => {
                let text = message.text_content().unwrap_or_default();
                let text = fold_system(&mut pending_system, text);
                contents.push(Content {
                    role: "user".to_string(),
                    parts: vec![Part::text(text)],
                });
            }
            "assistant" => {
                let mut parts = Vec::new();
                if let Some(text) = message.text_content()
                    && !text.is_empty()
                {
                    parts.push(Part::text(text));
                }
                if let Some(call) = &message.function_call {
                    parts.push(function_call_part(&call.name, &call.arguments));
                }
                if let Some(calls) = &message.tool_calls {
                    for call in calls {
                        parts.push(function_call_part(
                            &call.function.name,
                            &call.function.arguments,
                        ));
                    }
                }
                if !parts.is_empty() {
                    contents.push(Content {
                        role: "model".to_string(),
                        parts,
                    });
                }
            }
            "tool" | "function" => {
                let name = message
                    .name
                    .clone()
                    .or_else(|| message.tool_call_id.clone())
                    .unwrap_or_else(|| "function".to_string());
                let response = match message.text_content() {
                    Some(text) => {
                        serde_json::from_str(&text).unwrap_or(Value::String(text))
                    }
                    None => Value::Null,
                };
                contents.push(Content {
                    role: "user".to_string(),
                    parts: vec![Part {
                        function_response: Some(llmgate_protocol::gemini::FunctionResponse {
                            name,
                            response,
                        }),
                        ..Part::default()
                    }],
                });
            }
            _ => {}
        }
    }

    if !pending_system.is_empty() {
        let text = fold_system(&mut pending_system, String::new());
        contents.push(Content {
            role: "user".to_string(),
            parts: vec![Part::text(text)],
        });
    }

    let generation_config = GenerationConfig {
        temperature: req.temperature,
        top_p: req.top_p,
        max_output_tokens: req.max_tokens,
        stop_sequences: req.stop.clone().map(StopSequences::into_vec),
    };

    let tools = req.tools.as_ref().map(|tools| {
        vec![Tool {
            function_declarations: tools
                .iter()
                .map(|tool| FunctionDeclaration {
                    name: tool.function.name.clone(),
                    description: tool.function.description.clone(),
                    parameters: tool.function.parameters.clone(),
                })
                .collect(),
        }]
    });

    GenerateContentRequest {
        contents,
        generation_config: (!generation_config.is_empty()).then_some(generation_config),
        tools,
    }
}

fn fold_system(pending: &mut Vec<String>, user_text: String) -> String {
    if pending.is_empty() {
        return user_text;
    }
    let joined = pending.join("\n\n");
    pending.clear();
    if user_text.is_empty() {
        format!("[System] {joined}")
    } else {
        format!("[System] {joined}\n\n{user_text}")
    }
}

fn function_call_part(name: &str, arguments: &str) -> Part {
    let args = serde_json::from_str(arguments)
        .unwrap_or_else(|_| Value::String(arguments.to_string()));
    Part {
        function_call: Some(llmgate_protocol::gemini::FunctionCall {
            name: name.to_string(),
            args,
        }),
        ..Part::default()
    }
}

fn reply_from_response(wire: GenerateContentResponse) -> ProviderReply {
    let usage = wire.usage_metadata.map(usage_from_metadata);
    let Some(candidate) = wire.candidates.into_iter().next() else {
        return ProviderReply {
            usage,
            ..ProviderReply::default()
        };
    };

    let (content, tool_calls) = split_parts(&candidate);
    ProviderReply {
        content,
        tool_calls,
        function_call: None,
        finish_reason: candidate.finish_reason.as_deref().map(map_finish),
        usage,
    }
}

fn stream_event(wire: GenerateContentResponse) -> StreamEvent {
    let usage = wire.usage_metadata.map(usage_from_metadata);
    let Some(candidate) = wire.candidates.into_iter().next() else {
        return StreamEvent {
            usage,
            ..StreamEvent::default()
        };
    };

    let (content, tool_calls) = split_parts(&candidate);
    StreamEvent {
        delta: MessageDelta {
            role: None,
            content,
            tool_calls: tool_calls.map(|calls| {
                calls
                    .into_iter()
                    .enumerate()
                    .map(|(index, call)| ToolCallDelta {
                        index: index as i64,
                        id: Some(call.id),
                        r#type: Some(ToolCallType::Function),
                        function: Some(FunctionCallDelta {
                            name: Some(call.function.name),
                            arguments: Some(call.function.arguments),
                        }),
                    })
                    .collect()
            }),
            function_call: None,
        },
        finish_reason: candidate.finish_reason.as_deref().map(map_finish),
        usage,
    }
}

fn split_parts(candidate: &Candidate) -> (Option<String>, Option<Vec<ToolCall>>) {
    let Some(content) = &candidate.content else {
        return (None, None);
    };

    let mut text = String::new();
    let mut calls = Vec::new();
    for part in &content.parts {
        if let Some(value) = &part.text {
            text.push_str(value);
        }
        if let Some(call) = &part.function_call {
            calls.push(ToolCall {
                id: format!("call_{}", Uuid::new_v4().simple()),
                r#type: ToolCallType::Function,
                function: FunctionCall {
                    name: call.name.clone(),
                    arguments: serde_json::to_string(&call.args)
                        .unwrap_or_else(|_| "{}".to_string()),
                },
            });
        }
    }

    (
        (!text.is_empty()).then_some(text),
        (!calls.is_empty()).then_some(calls),
    )
}

fn usage_from_metadata(meta: UsageMetadata) -> Usage {
    Usage {
        prompt_tokens: meta.prompt_token_count,
        completion_tokens: meta.candidates_token_count,
        total_tokens: meta.total_token_count,
    }
}

fn map_finish(value: &str) -> FinishReason {
    match value {
        "MAX_TOKENS" => FinishReason::Length,
        "SAFETY" | "RECITATION" => FinishReason::ContentFilter,
        _ => FinishReason::Stop,
    }
}
