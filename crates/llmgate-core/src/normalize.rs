use bytes::Bytes;
use serde::Serialize;
use uuid::Uuid;

use llmgate_protocol::chat::{
    AssistantMessage, AssistantRole, ChatChoice, ChatCompletionChunk, ChatCompletionChunkObject,
    ChatCompletionObject, ChatCompletionResponse, FinishReason, StreamChoice, Usage,
};
use llmgate_provider::{ProviderReply, StreamEvent};

use crate::epoch_millis;
use crate::error::GatewayError;

/// Response and stream ids share the `chatcmpl-` namespace clients expect.
pub fn new_stream_id() -> String {
    format!("chatcmpl-{}", Uuid::new_v4())
}

fn epoch_seconds() -> i64 {
    epoch_millis() / 1000
}

/// Wrap a provider reply in the canonical completion envelope. The id is
/// fabricated here; upstream ids never leak through.
pub fn to_response(reply: ProviderReply, requested_model: &str) -> ChatCompletionResponse {
    ChatCompletionResponse {
        id: new_stream_id(),
        object: ChatCompletionObject::ChatCompletion,
        created: epoch_seconds(),
        model: requested_model.to_string(),
        choices: vec![ChatChoice {
            index: 0,
            message: AssistantMessage {
                role: AssistantRole::Assistant,
                content: reply.content,
                tool_calls: reply.tool_calls,
                function_call: reply.function_call,
            },
            finish_reason: Some(reply.finish_reason.unwrap_or(FinishReason::Stop)),
            logprobs: None,
        }],
        usage: reply.usage.unwrap_or(Usage::default()),
    }
}

/// One canonical chunk; `stream_id` is caller-supplied so every chunk of
/// a stream shares it.
pub fn to_chunk(
    event: StreamEvent,
    requested_model: &str,
    stream_id: &str,
) -> ChatCompletionChunk {
    ChatCompletionChunk {
        id: stream_id.to_string(),
        object: ChatCompletionChunkObject::ChatCompletionChunk,
        created: epoch_seconds(),
        model: requested_model.to_string(),
        choices: vec![StreamChoice {
            index: 0,
            delta: event.delta,
            logprobs: None,
            finish_reason: event.finish_reason,
        }],
        usage: event.usage,
    }
}

pub fn sse_frame(value: &impl Serialize) -> Bytes {
    let payload = serde_json::to_vec(value).unwrap_or_default();
    let mut data = Vec::with_capacity(payload.len() + 8);
    data.extend_from_slice(b"data: ");
    data.extend_from_slice(&payload);
    data.extend_from_slice(b"\n\n");
    Bytes::from(data)
}

pub fn sse_error_frame(err: &GatewayError) -> Bytes {
    sse_frame(&err.payload())
}

pub fn sse_done() -> Bytes {
    Bytes::from_static(b"data: [DONE]\n\n")
}
