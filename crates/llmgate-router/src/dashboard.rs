use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use serde::Deserialize;
use serde_json::json;

use llmgate_core::auth::AuthError;
use llmgate_core::epoch_millis;
use llmgate_core::state::GatewayState;
use llmgate_core::token_store::TokenSet;

/// Read-mostly JSON API consumed by the dashboard. Token material is
/// never returned whole; access tokens are masked to their tail.
pub fn router() -> axum::Router<GatewayState> {
    axum::Router::new()
        .route("/status", get(status))
        .route("/tokens", get(tokens))
        .route("/usage", get(usage))
        .route("/models", get(models))
        .route("/tokens/{provider}/device-flow", post(device_flow_start))
        .route(
            "/tokens/{provider}/device-flow/complete",
            post(device_flow_complete),
        )
        .route("/tokens/{provider}/refresh", post(refresh_token))
        .route("/tokens/{provider}", post(insert_token))
}

async fn status(State(state): State<GatewayState>) -> Json<serde_json::Value> {
    let now_ms = epoch_millis();
    let stored = state.store.all().await;

    let mut providers = Vec::new();
    for name in state.enabled_providers() {
        let token = stored.get(&name);
        providers.push(json!({
            "provider": name,
            "token": token.map(|token| json!({
                "present": true,
                "expired": token.is_expired_at(now_ms),
                "expires_at": token.expires_at,
            })).unwrap_or_else(|| json!({"present": false})),
            "rate_limit": state.limiter.status(&name).await,
        }));
    }

    Json(json!({
        "status": "ok",
        "uptime_seconds": now_ms / 1000 - state.started_at_epoch_sec,
        "providers": providers,
        "failed_providers": state.router.failed_providers().await,
    }))
}

async fn tokens(State(state): State<GatewayState>) -> Json<serde_json::Value> {
    let now_ms = epoch_millis();
    let mut rows: Vec<serde_json::Value> = state
        .store
        .all()
        .await
        .into_values()
        .map(|token| {
            json!({
                "provider": token.provider,
                "access_token": mask_token(&token.access_token),
                "has_refresh_token": token.refresh_token.is_some(),
                "expires_at": token.expires_at,
                "expired": token.is_expired_at(now_ms),
            })
        })
        .collect();
    rows.sort_by_key(|row| row["provider"].as_str().unwrap_or_default().to_string());
    Json(json!({"tokens": rows}))
}

async fn usage(State(state): State<GatewayState>) -> Json<serde_json::Value> {
    Json(json!({"usage": state.usage.snapshot()}))
}

async fn models(State(state): State<GatewayState>) -> Json<serde_json::Value> {
    Json(json!({"models": state.router.aliases()}))
}

async fn device_flow_start(
    State(state): State<GatewayState>,
    Path(provider): Path<String>,
) -> Response {
    match state.auth.initiate_device_flow(&provider).await {
        Ok(init) => Json(init).into_response(),
        Err(err) => auth_error_response(err),
    }
}

#[derive(Debug, Deserialize)]
struct CompleteDeviceFlowBody {
    device_code: String,
}

async fn device_flow_complete(
    State(state): State<GatewayState>,
    Path(provider): Path<String>,
    Json(body): Json<CompleteDeviceFlowBody>,
) -> Response {
    match state
        .auth
        .complete_device_flow(&provider, &body.device_code)
        .await
    {
        Ok(token) => token_summary(&token),
        Err(err) => auth_error_response(err),
    }
}

async fn refresh_token(
    State(state): State<GatewayState>,
    Path(provider): Path<String>,
) -> Response {
    match state.auth.refresh_token(&provider).await {
        Ok(token) => token_summary(&token),
        Err(err) => auth_error_response(err),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
struct InsertTokenBody {
    access_token: String,
    refresh_token: Option<String>,
    expires_at: Option<i64>,
}

/// Manual insert for tokens obtained out of band.
async fn insert_token(
    State(state): State<GatewayState>,
    Path(provider): Path<String>,
    Json(body): Json<InsertTokenBody>,
) -> Response {
    if body.access_token.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "access_token must be non-empty"})),
        )
            .into_response();
    }
    let token = TokenSet {
        provider: provider.clone(),
        access_token: body.access_token,
        refresh_token: body.refresh_token,
        expires_at: body
            .expires_at
            .unwrap_or_else(|| epoch_millis() + 3_600_000),
    };
    match state.store.save(token.clone()).await {
        Ok(()) => token_summary(&token),
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": err.to_string()})),
        )
            .into_response(),
    }
}

fn token_summary(token: &TokenSet) -> Response {
    Json(json!({
        "provider": token.provider,
        "access_token": mask_token(&token.access_token),
        "has_refresh_token": token.refresh_token.is_some(),
        "expires_at": token.expires_at,
    }))
    .into_response()
}

fn auth_error_response(err: AuthError) -> Response {
    let status = match &err {
        AuthError::NotConfigured(_) | AuthError::Disabled(_) | AuthError::MissingField(_, _) => {
            StatusCode::BAD_REQUEST
        }
        AuthError::NotAuthenticated(_) | AuthError::Reauthenticate(_) => StatusCode::UNAUTHORIZED,
        _ => StatusCode::BAD_GATEWAY,
    };
    (status, Json(json!({"error": err.to_string()}))).into_response()
}

/// Only the tail is ever surfaced.
fn mask_token(token: &str) -> String {
    let tail: String = token
        .chars()
        .rev()
        .take(8)
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    format!("...{tail}")
}
