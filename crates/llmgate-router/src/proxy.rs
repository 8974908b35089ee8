use std::convert::Infallible;
use std::time::Instant;

use axum::Json;
use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderName, HeaderValue, StatusCode, header};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use bytes::Bytes;
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::info;
use uuid::Uuid;

use llmgate_core::dispatch::Dispatcher;
use llmgate_core::error::GatewayError;
use llmgate_core::state::GatewayState;
use llmgate_protocol::chat::{ErrorBody, ErrorPayload, ListObject, ModelEntry, ModelList, ModelObject};

use crate::dashboard;

pub const OWNED_BY: &str = "llm-gateway";

/// The gateway's HTTP surface: the OpenAI-compatible `/v1` routes, a
/// health probe, and the dashboard JSON API. Every response carries an
/// `X-Request-Id`.
pub fn gateway_router(state: GatewayState) -> axum::Router {
    axum::Router::new()
        .route("/v1/chat/completions", post(chat_completions))
        .route("/v1/models", get(models_list))
        .route("/health", get(health))
        .nest("/api/dashboard", dashboard::router())
        .fallback(not_found)
        .layer(middleware::from_fn(request_id))
        .with_state(state)
}

async fn request_id(req: axum::http::Request<Body>, next: Next) -> Response {
    let mut resp = next.run(req).await;
    if let Ok(value) = HeaderValue::from_str(&Uuid::new_v4().to_string()) {
        resp.headers_mut()
            .insert(HeaderName::from_static("x-request-id"), value);
    }
    resp
}

async fn chat_completions(State(state): State<GatewayState>, body: Bytes) -> Response {
    let started_at = Instant::now();
    let req = match Dispatcher::parse(&body) {
        Ok(req) => req,
        Err(err) => return error_response(err),
    };
    let stream = req.stream.unwrap_or(false);
    info!(
        event = "chat_request",
        model = %req.model,
        messages = req.messages.len(),
        is_stream = stream
    );

    if stream {
        match state.dispatcher.complete_stream(&req).await {
            Ok(frames) => sse_response(frames),
            Err(err) => error_response(err),
        }
    } else {
        match state.dispatcher.complete(&req).await {
            Ok(resp) => {
                info!(
                    event = "chat_response",
                    model = %req.model,
                    elapsed_ms = started_at.elapsed().as_millis() as u64,
                    total_tokens = resp.usage.total_tokens
                );
                (StatusCode::OK, Json(resp)).into_response()
            }
            Err(err) => error_response(err),
        }
    }
}

fn sse_response(frames: mpsc::Receiver<Bytes>) -> Response {
    let stream = ReceiverStream::new(frames).map(Ok::<_, Infallible>);
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .header(header::CONNECTION, "keep-alive")
        // Hint reverse proxies not to buffer the event stream.
        .header(HeaderName::from_static("x-accel-buffering"), "no")
        .body(Body::from_stream(stream))
        .unwrap_or_else(|_| {
            (StatusCode::INTERNAL_SERVER_ERROR, "response_build_failed").into_response()
        })
}

pub(crate) fn error_response(err: GatewayError) -> Response {
    let status =
        StatusCode::from_u16(err.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(err.payload())).into_response()
}

async fn models_list(State(state): State<GatewayState>) -> Json<ModelList> {
    let created = state.started_at_epoch_sec;
    let data = state
        .router
        .aliases()
        .into_iter()
        .map(|alias| ModelEntry {
            id: alias,
            object: ModelObject::Model,
            created,
            owned_by: OWNED_BY.to_string(),
        })
        .collect();
    Json(ModelList {
        object: ListObject::List,
        data,
    })
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "ok"}))
}

async fn not_found() -> Response {
    let payload = ErrorPayload {
        error: ErrorBody {
            message: "Not found".to_string(),
            r#type: "invalid_request_error".to_string(),
            code: None,
        },
    };
    (StatusCode::NOT_FOUND, Json(payload)).into_response()
}
