use std::collections::HashMap;
use std::sync::Arc;

use wiremock::matchers::{body_string_contains, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use llmgate_core::auth::{AuthError, AuthManager, sync_token_file};
use llmgate_core::config::ProviderSettings;
use llmgate_core::epoch_millis;
use llmgate_core::token_store::{TokenSet, TokenStore};

fn settings(auth_endpoint: Option<String>, token_endpoint: Option<String>) -> ProviderSettings {
    ProviderSettings {
        enabled: true,
        client_id: Some("client-123".to_string()),
        client_secret: None,
        auth_endpoint,
        token_endpoint,
        api_endpoint: "http://127.0.0.1:9/unused".to_string(),
    }
}

fn manager_with(
    provider: &str,
    provider_settings: ProviderSettings,
    store: Arc<TokenStore>,
) -> AuthManager {
    let mut providers = HashMap::new();
    providers.insert(provider.to_string(), provider_settings);
    let client = llmgate_provider::client::build_client().unwrap();
    AuthManager::new(providers, store, client)
}

fn expired_token(provider: &str) -> TokenSet {
    TokenSet {
        provider: provider.to_string(),
        access_token: "stale".to_string(),
        refresh_token: Some("refresh-1".to_string()),
        expires_at: epoch_millis() - 1_000,
    }
}

#[tokio::test]
async fn expired_token_with_refresh_is_refreshed_inline() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .and(body_string_contains("grant_type=refresh_token"))
        .and(body_string_contains("refresh_token=refresh-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "access_token": "fresh",
            "expires_in": 3600,
        })))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(TokenStore::new(dir.path().join("tokens.json")));
    store.save(expired_token("openai")).await.unwrap();

    let manager = manager_with(
        "openai",
        settings(None, Some(format!("{}/token", server.uri()))),
        store.clone(),
    );

    let token = manager.get_valid_token("openai").await.unwrap();
    assert_eq!(token.access_token, "fresh");
    assert!(token.expires_at > epoch_millis());
    // The endpoint sent no new refresh token, so the old grant is kept.
    assert_eq!(token.refresh_token.as_deref(), Some("refresh-1"));
    assert_eq!(store.get("openai").await.unwrap().access_token, "fresh");
}

#[tokio::test]
async fn valid_token_is_returned_without_a_refresh() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(TokenStore::new(dir.path().join("tokens.json")));
    store
        .save(TokenSet {
            provider: "openai".to_string(),
            access_token: "live".to_string(),
            refresh_token: None,
            expires_at: epoch_millis() + 60_000,
        })
        .await
        .unwrap();

    // No token endpoint configured: a refresh attempt would error.
    let manager = manager_with("openai", settings(None, None), store);
    let token = manager.get_valid_token("openai").await.unwrap();
    assert_eq!(token.access_token, "live");
}

#[tokio::test]
async fn refresh_failure_deletes_the_stored_entry() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
            "error": "invalid_grant",
        })))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(TokenStore::new(dir.path().join("tokens.json")));
    store.save(expired_token("openai")).await.unwrap();

    let manager = manager_with(
        "openai",
        settings(None, Some(format!("{}/token", server.uri()))),
        store.clone(),
    );

    let err = manager.get_valid_token("openai").await.unwrap_err();
    assert!(matches!(err, AuthError::Refresh(_)));
    // A reported refresh failure also clears state: re-auth is forced.
    assert!(store.get("openai").await.is_none());
    assert!(matches!(
        manager.get_valid_token("openai").await.unwrap_err(),
        AuthError::NotAuthenticated(_)
    ));
}

#[tokio::test]
async fn concurrent_expiry_shares_one_refresh() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(serde_json::json!({
                    "access_token": "fresh",
                    "expires_in": 3600,
                }))
                .set_delay(std::time::Duration::from_millis(100)),
        )
        .expect(1)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(TokenStore::new(dir.path().join("tokens.json")));
    store.save(expired_token("openai")).await.unwrap();

    let manager = Arc::new(manager_with(
        "openai",
        settings(None, Some(format!("{}/token", server.uri()))),
        store,
    ));

    let a = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.get_valid_token("openai").await })
    };
    let b = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.get_valid_token("openai").await })
    };

    assert_eq!(a.await.unwrap().unwrap().access_token, "fresh");
    assert_eq!(b.await.unwrap().unwrap().access_token, "fresh");
    // MockServer::verify on drop enforces expect(1).
}

#[tokio::test]
async fn expired_token_without_refresh_demands_reauth() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(TokenStore::new(dir.path().join("tokens.json")));
    store
        .save(TokenSet {
            provider: "openai".to_string(),
            access_token: "stale".to_string(),
            refresh_token: None,
            expires_at: epoch_millis() - 1_000,
        })
        .await
        .unwrap();

    let manager = manager_with("openai", settings(None, None), store);
    assert!(matches!(
        manager.get_valid_token("openai").await.unwrap_err(),
        AuthError::Reauthenticate(_)
    ));
}

#[tokio::test]
async fn device_flow_init_posts_client_id_and_scope() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/device"))
        .and(body_string_contains("client-123"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "device_code": "dev-1",
            "user_code": "ABCD-1234",
            "verification_uri": "https://example.com/activate",
            "expires_in": 900,
        })))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(TokenStore::new(dir.path().join("tokens.json")));
    let manager = manager_with(
        "openai",
        settings(Some(format!("{}/device", server.uri())), None),
        store,
    );

    let init = manager.initiate_device_flow("openai").await.unwrap();
    assert_eq!(init.device_code, "dev-1");
    assert_eq!(init.user_code, "ABCD-1234");
    assert_eq!(init.verification_url, "https://example.com/activate");
    assert_eq!(init.expires_in, 900);
}

#[tokio::test]
async fn device_flow_requires_client_id_and_endpoint() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(TokenStore::new(dir.path().join("tokens.json")));

    let mut no_client_id = settings(Some("http://localhost/device".to_string()), None);
    no_client_id.client_id = None;
    let manager = manager_with("openai", no_client_id, store.clone());
    assert!(matches!(
        manager.initiate_device_flow("openai").await.unwrap_err(),
        AuthError::MissingField(_, "clientId")
    ));

    let manager = manager_with("openai", settings(None, None), store.clone());
    assert!(matches!(
        manager.initiate_device_flow("openai").await.unwrap_err(),
        AuthError::MissingField(_, "authEndpoint")
    ));

    let mut disabled = settings(Some("http://localhost/device".to_string()), None);
    disabled.enabled = false;
    let manager = manager_with("openai", disabled, store);
    assert!(matches!(
        manager.initiate_device_flow("openai").await.unwrap_err(),
        AuthError::Disabled(_)
    ));
}

#[tokio::test]
async fn sync_from_file_never_raises_on_garbage() {
    let dir = tempfile::tempdir().unwrap();
    let store = TokenStore::new(dir.path().join("tokens.json"));

    let cases: &[&[u8]] = &[
        b"",
        b"null",
        b"[]",
        b"{",
        b"{\"refresh_token\":\"only\"}",
        b"{\"access_token\":\"\"}",
        b"\xff\xfe\x00random bytes\x01",
        b"42",
    ];
    for (index, contents) in cases.iter().enumerate() {
        let path = dir.path().join(format!("case-{index}.json"));
        tokio::fs::write(&path, contents).await.unwrap();
        sync_token_file(&store, &path, "openai").await;
    }
    let missing = dir.path().join("does-not-exist.json");
    sync_token_file(&store, &missing, "openai").await;

    assert!(store.get("openai").await.is_none());
}

#[tokio::test]
async fn sync_from_file_imports_and_defaults_expiry() {
    let dir = tempfile::tempdir().unwrap();
    let store = TokenStore::new(dir.path().join("tokens.json"));

    let path = dir.path().join("openai.json");
    tokio::fs::write(&path, br#"{"accessToken":"imported","refreshToken":"r2"}"#)
        .await
        .unwrap();
    sync_token_file(&store, &path, "openai").await;

    let token = store.get("openai").await.unwrap();
    assert_eq!(token.access_token, "imported");
    assert_eq!(token.refresh_token.as_deref(), Some("r2"));
    // Missing expiry defaults to roughly an hour out.
    let delta = token.expires_at - epoch_millis();
    assert!(delta > 3_500_000 && delta <= 3_600_000);
}

#[tokio::test]
async fn sync_from_file_refuses_expired_payloads() {
    let dir = tempfile::tempdir().unwrap();
    let store = TokenStore::new(dir.path().join("tokens.json"));

    let path = dir.path().join("openai.json");
    let body = format!(
        r#"{{"access_token":"late","expires_at":{}}}"#,
        epoch_millis() - 5_000
    );
    tokio::fs::write(&path, body).await.unwrap();
    sync_token_file(&store, &path, "openai").await;

    assert!(store.get("openai").await.is_none());
}

#[tokio::test]
async fn watch_files_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(TokenStore::new(dir.path().join("tokens.json")));
    let manager = manager_with("openai", settings(None, None), store);

    let watched = vec![dir.path().join("openai-token.json")];
    manager.watch_files(&watched).unwrap();
    manager.watch_files(&watched).unwrap();
    manager.stop_watching();
    manager.stop_watching();
}
