use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use llmgate_protocol::chat::{
    ChatMessage, FinishReason, FunctionCall, MessageDelta, StopSequences, Tool, ToolCall, Usage,
};

use crate::error::UpstreamError;

/// A completion request shaped for one upstream attempt: the canonical
/// request narrowed to the selected provider model and stamped with the
/// bearer token for that provider.
#[derive(Debug, Clone)]
pub struct ProviderRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub stream: bool,
    pub temperature: Option<f64>,
    pub top_p: Option<f64>,
    pub max_tokens: Option<u32>,
    pub stop: Option<StopSequences>,
    pub tools: Option<Vec<Tool>>,
    pub access_token: String,
}

/// The provider's answer, already lifted out of its wire format.
/// Finish reasons are canonical here; provider-specific vocabularies
/// are mapped inside each adapter.
#[derive(Debug, Clone, Default)]
pub struct ProviderReply {
    pub content: Option<String>,
    pub tool_calls: Option<Vec<ToolCall>>,
    pub function_call: Option<FunctionCall>,
    pub finish_reason: Option<FinishReason>,
    pub usage: Option<Usage>,
}

#[derive(Debug, Clone, Default)]
pub struct StreamEvent {
    pub delta: MessageDelta,
    pub finish_reason: Option<FinishReason>,
    pub usage: Option<Usage>,
}

/// Stream events arrive in upstream order. Dropping the receiver stops
/// the pump task and aborts the upstream read.
pub type EventReceiver = mpsc::Receiver<Result<StreamEvent, UpstreamError>>;

#[async_trait]
pub trait UpstreamAdapter: Send + Sync {
    fn name(&self) -> &str;

    async fn call(&self, req: ProviderRequest) -> Result<ProviderReply, UpstreamError>;

    async fn stream(&self, req: ProviderRequest) -> Result<EventReceiver, UpstreamError>;
}

#[derive(Default)]
pub struct AdapterRegistry {
    adapters: HashMap<String, Arc<dyn UpstreamAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, adapter: Arc<dyn UpstreamAdapter>) {
        self.adapters.insert(adapter.name().to_string(), adapter);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn UpstreamAdapter>> {
        self.adapters.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.adapters.keys().cloned().collect();
        names.sort();
        names
    }
}
