use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::mpsc;

use llmgate_core::auth::AuthManager;
use llmgate_core::config::{ModelAlias, ProviderModel, ProviderSettings, RateLimitConfig};
use llmgate_core::dispatch::Dispatcher;
use llmgate_core::epoch_millis;
use llmgate_core::error::GatewayError;
use llmgate_core::limiter::RateLimiter;
use llmgate_core::router::ModelRouter;
use llmgate_core::token_store::{TokenSet, TokenStore};
use llmgate_core::usage::UsageTracker;
use llmgate_protocol::chat::{FinishReason, MessageDelta, Usage};
use llmgate_provider::{
    AdapterRegistry, EventReceiver, ProviderReply, ProviderRequest, StreamEvent, UpstreamAdapter,
    UpstreamError,
};

enum Behavior {
    Reply(ProviderReply),
    Fail(u16),
    Stream(Vec<StreamEvent>),
    StreamThenError(Vec<StreamEvent>, u16),
}

struct MockAdapter {
    name: String,
    behavior: Behavior,
    calls: AtomicUsize,
    seen_tokens: std::sync::Mutex<Vec<String>>,
}

impl MockAdapter {
    fn new(name: &str, behavior: Behavior) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            behavior,
            calls: AtomicUsize::new(0),
            seen_tokens: std::sync::Mutex::new(Vec::new()),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl UpstreamAdapter for MockAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn call(&self, req: ProviderRequest) -> Result<ProviderReply, UpstreamError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen_tokens.lock().unwrap().push(req.access_token);
        match &self.behavior {
            Behavior::Reply(reply) => Ok(reply.clone()),
            Behavior::Fail(status) => Err(UpstreamError::from_status(&self.name, *status, "down")),
            _ => panic!("call on streaming mock"),
        }
    }

    async fn stream(&self, _req: ProviderRequest) -> Result<EventReceiver, UpstreamError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let (events, trailing_error) = match &self.behavior {
            Behavior::Stream(events) => (events.clone(), None),
            Behavior::StreamThenError(events, status) => (
                events.clone(),
                Some(UpstreamError::from_status(&self.name, *status, "cut off")),
            ),
            Behavior::Fail(status) => {
                return Err(UpstreamError::from_status(&self.name, *status, "down"));
            }
            Behavior::Reply(_) => panic!("stream on non-streaming mock"),
        };
        let (tx, rx) = mpsc::channel(16);
        tokio::spawn(async move {
            for event in events {
                if tx.send(Ok(event)).await.is_err() {
                    return;
                }
            }
            if let Some(err) = trailing_error {
                let _ = tx.send(Err(err)).await;
            }
        });
        Ok(rx)
    }
}

struct Harness {
    dispatcher: Dispatcher,
    _dir: tempfile::TempDir,
}

async fn harness(
    aliases: Vec<ModelAlias>,
    rate_limits: Vec<RateLimitConfig>,
    adapters: Vec<Arc<MockAdapter>>,
) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(TokenStore::new(dir.path().join("tokens.json")));

    let mut providers = HashMap::new();
    for adapter in &adapters {
        providers.insert(
            adapter.name.clone(),
            ProviderSettings {
                enabled: true,
                client_id: None,
                client_secret: None,
                auth_endpoint: None,
                token_endpoint: None,
                api_endpoint: "http://127.0.0.1:9/unused".to_string(),
            },
        );
        store
            .save(TokenSet {
                provider: adapter.name.clone(),
                access_token: format!("token-{}", adapter.name),
                refresh_token: None,
                expires_at: epoch_millis() + 60_000,
            })
            .await
            .unwrap();
    }

    let auth = Arc::new(AuthManager::new(
        providers,
        store,
        llmgate_provider::client::build_client().unwrap(),
    ));
    let mut registry = AdapterRegistry::new();
    for adapter in adapters {
        registry.register(adapter);
    }

    let dispatcher = Dispatcher::new(
        Arc::new(ModelRouter::new(&aliases)),
        Arc::new(RateLimiter::new(&rate_limits)),
        auth,
        Arc::new(registry),
        Arc::new(UsageTracker::new()),
    );
    Harness {
        dispatcher,
        _dir: dir,
    }
}

fn alias(name: &str, providers: &[(&str, &str, u32)]) -> ModelAlias {
    ModelAlias {
        alias: name.to_string(),
        providers: providers
            .iter()
            .map(|(provider, model, priority)| ProviderModel {
                provider: provider.to_string(),
                model: model.to_string(),
                priority: *priority,
            })
            .collect(),
    }
}

fn parse_request(body: &str) -> llmgate_protocol::chat::ChatCompletionRequest {
    Dispatcher::parse(body.as_bytes()).unwrap()
}

fn hello_reply() -> ProviderReply {
    ProviderReply {
        content: Some("Hello".to_string()),
        tool_calls: None,
        function_call: None,
        finish_reason: Some(FinishReason::Stop),
        usage: Some(Usage {
            prompt_tokens: 10,
            completion_tokens: 5,
            total_tokens: 15,
        }),
    }
}

async fn collect_frames(mut rx: mpsc::Receiver<bytes::Bytes>) -> Vec<String> {
    let mut frames = Vec::new();
    while let Some(frame) = rx.recv().await {
        frames.push(String::from_utf8(frame.to_vec()).unwrap());
    }
    frames
}

#[tokio::test]
async fn happy_path_returns_canonical_response() {
    let openai = MockAdapter::new("openai", Behavior::Reply(hello_reply()));
    let h = harness(
        vec![alias("gpt-4", &[("openai", "gpt-4", 1)])],
        vec![],
        vec![openai.clone()],
    )
    .await;

    let req = parse_request(r#"{"model":"gpt-4","messages":[{"role":"user","content":"Hi"}]}"#);
    let resp = h.dispatcher.complete(&req).await.unwrap();

    assert_eq!(resp.model, "gpt-4");
    assert_eq!(resp.choices[0].message.content.as_deref(), Some("Hello"));
    assert_eq!(resp.choices[0].finish_reason, Some(FinishReason::Stop));
    assert_eq!(resp.usage.total_tokens, 15);
    assert_eq!(openai.calls(), 1);
    // The stored bearer was handed to the adapter.
    assert_eq!(
        openai.seen_tokens.lock().unwrap().as_slice(),
        ["token-openai"]
    );
}

#[tokio::test]
async fn retryable_failure_falls_back_to_next_candidate() {
    let openai = MockAdapter::new("openai", Behavior::Fail(503));
    let gemini = MockAdapter::new(
        "gemini",
        Behavior::Reply(ProviderReply {
            content: Some("from gemini".to_string()),
            ..ProviderReply::default()
        }),
    );
    let h = harness(
        vec![alias(
            "gpt-4",
            &[("openai", "gpt-4", 1), ("gemini", "gemini-1.5-pro", 2)],
        )],
        vec![],
        vec![openai.clone(), gemini.clone()],
    )
    .await;

    let req = parse_request(r#"{"model":"gpt-4","messages":[{"role":"user","content":"Hi"}]}"#);
    let resp = h.dispatcher.complete(&req).await.unwrap();

    assert_eq!(
        resp.choices[0].message.content.as_deref(),
        Some("from gemini")
    );
    assert_eq!(openai.calls(), 1);
    assert_eq!(gemini.calls(), 1);
}

#[tokio::test]
async fn exhaustion_surfaces_the_last_error() {
    let openai = MockAdapter::new("openai", Behavior::Fail(503));
    let gemini = MockAdapter::new("gemini", Behavior::Fail(503));
    let h = harness(
        vec![alias(
            "gpt-4",
            &[("openai", "gpt-4", 1), ("gemini", "gemini-1.5-pro", 2)],
        )],
        vec![],
        vec![openai.clone(), gemini.clone()],
    )
    .await;

    let req = parse_request(r#"{"model":"gpt-4","messages":[{"role":"user","content":"Hi"}]}"#);
    let err = h.dispatcher.complete(&req).await.unwrap_err();

    assert!(matches!(err, GatewayError::ServiceUnavailable(_)));
    assert_eq!(err.http_status(), 503);
}

#[tokio::test]
async fn non_retryable_failure_stops_the_loop() {
    let openai = MockAdapter::new("openai", Behavior::Fail(401));
    let gemini = MockAdapter::new("gemini", Behavior::Reply(hello_reply()));
    let h = harness(
        vec![alias(
            "gpt-4",
            &[("openai", "gpt-4", 1), ("gemini", "gemini-1.5-pro", 2)],
        )],
        vec![],
        vec![openai.clone(), gemini.clone()],
    )
    .await;

    let req = parse_request(r#"{"model":"gpt-4","messages":[{"role":"user","content":"Hi"}]}"#);
    let err = h.dispatcher.complete(&req).await.unwrap_err();

    assert!(matches!(err, GatewayError::Auth(_)));
    assert_eq!(err.http_status(), 401);
    assert_eq!(openai.calls(), 1);
    assert_eq!(gemini.calls(), 0);
}

#[tokio::test]
async fn unknown_model_is_a_validation_error() {
    let h = harness(vec![], vec![], vec![]).await;
    let req = parse_request(r#"{"model":"mystery","messages":[{"role":"user","content":"x"}]}"#);
    let err = h.dispatcher.complete(&req).await.unwrap_err();
    assert!(matches!(err, GatewayError::Validation(_)));
    assert!(err.to_string().contains("Unknown model"));
    assert_eq!(err.http_status(), 400);
}

#[tokio::test]
async fn queue_full_is_rate_limited_and_not_retried() {
    let openai = MockAdapter::new("openai", Behavior::Reply(hello_reply()));
    let gemini = MockAdapter::new("gemini", Behavior::Reply(hello_reply()));
    let h = harness(
        vec![alias(
            "gpt-4",
            &[("openai", "gpt-4", 1), ("gemini", "gemini-1.5-pro", 2)],
        )],
        vec![RateLimitConfig {
            provider: "openai".to_string(),
            requests_per_minute: 0,
            max_queue_size: 0,
        }],
        vec![openai.clone(), gemini.clone()],
    )
    .await;

    let req = parse_request(r#"{"model":"gpt-4","messages":[{"role":"user","content":"Hi"}]}"#);
    let err = h.dispatcher.complete(&req).await.unwrap_err();

    assert!(matches!(err, GatewayError::RateLimit(_)));
    assert_eq!(err.http_status(), 429);
    // Back off, not fail over: neither upstream was called.
    assert_eq!(openai.calls(), 0);
    assert_eq!(gemini.calls(), 0);
}

#[tokio::test]
async fn missing_token_surfaces_as_auth_error() {
    let openai = MockAdapter::new("openai", Behavior::Reply(hello_reply()));
    let mut h = harness(
        vec![alias("gpt-4", &[("openai", "gpt-4", 1)])],
        vec![],
        vec![openai.clone()],
    )
    .await;
    // Rebuild the harness store without a token for openai.
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(TokenStore::new(dir.path().join("tokens.json")));
    let auth = Arc::new(AuthManager::new(
        HashMap::new(),
        store,
        llmgate_provider::client::build_client().unwrap(),
    ));
    let mut registry = AdapterRegistry::new();
    registry.register(openai.clone());
    h.dispatcher = Dispatcher::new(
        Arc::new(ModelRouter::new(&[alias("gpt-4", &[("openai", "gpt-4", 1)])])),
        Arc::new(RateLimiter::new(&[])),
        auth,
        Arc::new(registry),
        Arc::new(UsageTracker::new()),
    );

    let req = parse_request(r#"{"model":"gpt-4","messages":[{"role":"user","content":"Hi"}]}"#);
    let err = h.dispatcher.complete(&req).await.unwrap_err();
    assert!(matches!(err, GatewayError::Auth(_)));
    assert_eq!(openai.calls(), 0);
}

#[tokio::test]
async fn stream_emits_frames_with_shared_id_and_done() {
    let events = vec![
        StreamEvent {
            delta: MessageDelta {
                content: Some("Hello".to_string()),
                ..MessageDelta::default()
            },
            ..StreamEvent::default()
        },
        StreamEvent {
            delta: MessageDelta {
                content: Some(" world".to_string()),
                ..MessageDelta::default()
            },
            finish_reason: Some(FinishReason::Stop),
            ..StreamEvent::default()
        },
    ];
    let openai = MockAdapter::new("openai", Behavior::Stream(events));
    let h = harness(
        vec![alias("gpt-4", &[("openai", "gpt-4", 1)])],
        vec![],
        vec![openai],
    )
    .await;

    let req = parse_request(
        r#"{"model":"gpt-4","messages":[{"role":"user","content":"Hi"}],"stream":true}"#,
    );
    let rx = h.dispatcher.complete_stream(&req).await.unwrap();
    let frames = collect_frames(rx).await;

    assert_eq!(frames.len(), 3);
    for frame in &frames {
        assert!(frame.starts_with("data: "));
        assert!(frame.ends_with("\n\n"));
    }
    assert_eq!(frames[2], "data: [DONE]\n\n");

    let first: serde_json::Value =
        serde_json::from_str(frames[0].trim_start_matches("data: ").trim()).unwrap();
    let second: serde_json::Value =
        serde_json::from_str(frames[1].trim_start_matches("data: ").trim()).unwrap();
    assert_eq!(first["object"], "chat.completion.chunk");
    assert_eq!(first["id"], second["id"]);
    assert_eq!(first["choices"][0]["delta"]["content"], "Hello");
    assert_eq!(second["choices"][0]["finish_reason"], "stop");
}

#[tokio::test]
async fn stream_failure_before_first_chunk_falls_back() {
    let openai = MockAdapter::new("openai", Behavior::Fail(503));
    let gemini = MockAdapter::new(
        "gemini",
        Behavior::Stream(vec![StreamEvent {
            delta: MessageDelta {
                content: Some("from gemini".to_string()),
                ..MessageDelta::default()
            },
            finish_reason: Some(FinishReason::Stop),
            ..StreamEvent::default()
        }]),
    );
    let h = harness(
        vec![alias(
            "gpt-4",
            &[("openai", "gpt-4", 1), ("gemini", "gemini-1.5-pro", 2)],
        )],
        vec![],
        vec![openai.clone(), gemini.clone()],
    )
    .await;

    let req = parse_request(
        r#"{"model":"gpt-4","messages":[{"role":"user","content":"Hi"}],"stream":true}"#,
    );
    let rx = h.dispatcher.complete_stream(&req).await.unwrap();
    let frames = collect_frames(rx).await;

    assert_eq!(openai.calls(), 1);
    assert_eq!(gemini.calls(), 1);
    assert!(frames[0].contains("from gemini"));
    assert_eq!(frames.last().unwrap(), "data: [DONE]\n\n");
}

#[tokio::test]
async fn mid_stream_failure_emits_error_frame_then_done() {
    let events = vec![StreamEvent {
        delta: MessageDelta {
            content: Some("partial".to_string()),
            ..MessageDelta::default()
        },
        ..StreamEvent::default()
    }];
    let openai = MockAdapter::new("openai", Behavior::StreamThenError(events, 503));
    let gemini = MockAdapter::new("gemini", Behavior::Stream(vec![]));
    let h = harness(
        vec![alias(
            "gpt-4",
            &[("openai", "gpt-4", 1), ("gemini", "gemini-1.5-pro", 2)],
        )],
        vec![],
        vec![openai.clone(), gemini.clone()],
    )
    .await;

    let req = parse_request(
        r#"{"model":"gpt-4","messages":[{"role":"user","content":"Hi"}],"stream":true}"#,
    );
    let rx = h.dispatcher.complete_stream(&req).await.unwrap();
    let frames = collect_frames(rx).await;

    // One content frame, one canonical error frame, then [DONE]. No
    // fallback once bytes have been delivered.
    assert_eq!(frames.len(), 3);
    assert!(frames[0].contains("partial"));
    let error: serde_json::Value =
        serde_json::from_str(frames[1].trim_start_matches("data: ").trim()).unwrap();
    assert_eq!(error["error"]["type"], "server_error");
    assert_eq!(frames[2], "data: [DONE]\n\n");
    assert_eq!(gemini.calls(), 0);
}

mod parse {
    use super::*;

    #[test]
    fn missing_model_is_rejected() {
        let err =
            Dispatcher::parse(br#"{"messages":[{"role":"user","content":"x"}]}"#).unwrap_err();
        assert!(matches!(err, GatewayError::Validation(_)));
        assert!(err.to_string().contains("model"));
        assert_eq!(err.http_status(), 400);
    }

    #[test]
    fn empty_or_missing_messages_are_rejected() {
        assert!(Dispatcher::parse(br#"{"model":"gpt-4"}"#).is_err());
        assert!(Dispatcher::parse(br#"{"model":"gpt-4","messages":[]}"#).is_err());
    }

    #[test]
    fn message_without_role_is_rejected() {
        let err = Dispatcher::parse(br#"{"model":"m","messages":[{"content":"x"}]}"#).unwrap_err();
        assert!(err.to_string().contains("role"));
    }

    #[test]
    fn message_needs_content_or_calls() {
        let err =
            Dispatcher::parse(br#"{"model":"m","messages":[{"role":"assistant"}]}"#).unwrap_err();
        assert!(err.to_string().contains("content"));

        let ok = Dispatcher::parse(
            br#"{"model":"m","messages":[{"role":"assistant","tool_calls":[{"id":"1","type":"function","function":{"name":"f","arguments":"{}"}}]}]}"#,
        );
        assert!(ok.is_ok());

        let null_content =
            Dispatcher::parse(br#"{"model":"m","messages":[{"role":"user","content":null}]}"#);
        assert!(null_content.is_err());
    }

    #[test]
    fn non_object_bodies_are_rejected() {
        assert!(Dispatcher::parse(b"[]").is_err());
        assert!(Dispatcher::parse(b"not json").is_err());
        assert!(Dispatcher::parse(b"\"string\"").is_err());
    }
}
