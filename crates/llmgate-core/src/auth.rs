use std::collections::{HashMap, HashSet};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use notify::{EventKind, RecursiveMode, Watcher};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval, sleep};
use tracing::{info, warn};
use wreq::Client;

use crate::config::ProviderSettings;
use crate::epoch_millis;
use crate::token_store::{StoreError, TokenSet, TokenStore};

const DEVICE_SCOPE: &str = "openid profile email offline_access";
const DEVICE_GRANT: &str = "urn:ietf:params:oauth:grant-type:device_code";
const DEVICE_POLL_INTERVAL: Duration = Duration::from_secs(5);
const DEVICE_POLL_BUDGET: u32 = 120;
const FILE_SYNC_DEFAULT_TTL_MS: i64 = 3_600_000;
/// A changed file must sit still this long before it is read.
const WATCH_STABILITY: Duration = Duration::from_secs(2);
const WATCH_SWEEP: Duration = Duration::from_millis(500);

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("provider {0} is not configured")]
    NotConfigured(String),
    #[error("provider {0} is disabled")]
    Disabled(String),
    #[error("provider {0} is missing {1}")]
    MissingField(String, &'static str),
    #[error("no token stored for provider {0}; authenticate first")]
    NotAuthenticated(String),
    #[error("token for provider {0} expired without a refresh token; re-authenticate")]
    Reauthenticate(String),
    #[error("device flow failed: {0}")]
    DeviceFlow(String),
    #[error("device flow denied: {0}")]
    DeviceDenied(String),
    #[error("token refresh failed: {0}")]
    Refresh(String),
    #[error("token endpoint request failed: {0}")]
    Http(String),
    #[error("file watcher failed: {0}")]
    Watch(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct DeviceFlowInit {
    pub device_code: String,
    pub user_code: String,
    pub verification_url: String,
    pub expires_in: u64,
}

#[derive(Debug, Deserialize)]
struct DeviceInitWire {
    device_code: String,
    user_code: String,
    #[serde(alias = "verification_uri")]
    verification_url: String,
    #[serde(default = "default_device_expiry")]
    expires_in: u64,
}

#[derive(Debug, Deserialize)]
struct TokenWire {
    access_token: String,
    refresh_token: Option<String>,
    #[serde(default = "default_expires_in")]
    expires_in: u64,
}

#[derive(Debug, Default, Deserialize)]
struct TokenErrorWire {
    error: Option<String>,
    error_description: Option<String>,
}

/// Token payload accepted by file import: snake_case or camelCase.
#[derive(Debug, Deserialize)]
struct FileTokenWire {
    #[serde(alias = "accessToken")]
    access_token: Option<String>,
    #[serde(alias = "refreshToken")]
    refresh_token: Option<String>,
    #[serde(alias = "expiresAt")]
    expires_at: Option<i64>,
}

struct WatchHandle {
    _watcher: notify::RecommendedWatcher,
    task: JoinHandle<()>,
}

/// OAuth token lifecycle per provider: device-flow acquisition,
/// refresh on expiry, and import from watched files.
pub struct AuthManager {
    providers: HashMap<String, ProviderSettings>,
    store: Arc<TokenStore>,
    client: Client,
    /// One in-flight refresh per provider; concurrent callers that see
    /// an expired token share a single token-endpoint round trip.
    refresh_flights: HashMap<String, Mutex<()>>,
    watcher: std::sync::Mutex<Option<WatchHandle>>,
}

impl AuthManager {
    pub fn new(
        providers: HashMap<String, ProviderSettings>,
        store: Arc<TokenStore>,
        client: Client,
    ) -> Self {
        let refresh_flights = providers
            .keys()
            .map(|name| (name.clone(), Mutex::new(())))
            .collect();
        Self {
            providers,
            store,
            client,
            refresh_flights,
            watcher: std::sync::Mutex::new(None),
        }
    }

    pub fn store(&self) -> &Arc<TokenStore> {
        &self.store
    }

    fn require(&self, provider: &str) -> Result<&ProviderSettings, AuthError> {
        let settings = self
            .providers
            .get(provider)
            .ok_or_else(|| AuthError::NotConfigured(provider.to_string()))?;
        if !settings.enabled {
            return Err(AuthError::Disabled(provider.to_string()));
        }
        Ok(settings)
    }

    pub async fn initiate_device_flow(&self, provider: &str) -> Result<DeviceFlowInit, AuthError> {
        let settings = self.require(provider)?;
        let client_id = settings
            .client_id
            .as_deref()
            .ok_or_else(|| AuthError::MissingField(provider.to_string(), "clientId"))?;
        let auth_endpoint = settings
            .auth_endpoint
            .as_deref()
            .ok_or_else(|| AuthError::MissingField(provider.to_string(), "authEndpoint"))?;

        let body = serde_json::to_vec(&serde_json::json!({
            "client_id": client_id,
            "scope": DEVICE_SCOPE,
        }))
        .map_err(|err| AuthError::DeviceFlow(err.to_string()))?;

        let resp = self
            .client
            .post(auth_endpoint)
            .header("Content-Type", "application/json")
            .body(body)
            .send()
            .await
            .map_err(|err| AuthError::Http(err.to_string()))?;
        let status = resp.status();
        let bytes = resp
            .bytes()
            .await
            .map_err(|err| AuthError::Http(err.to_string()))?;
        if !status.is_success() {
            return Err(AuthError::DeviceFlow(format!(
                "{status} {}",
                String::from_utf8_lossy(&bytes)
            )));
        }

        let wire = serde_json::from_slice::<DeviceInitWire>(&bytes)
            .map_err(|err| AuthError::DeviceFlow(err.to_string()))?;
        info!(event = "device_flow_started", provider = %provider, user_code = %wire.user_code);
        Ok(DeviceFlowInit {
            device_code: wire.device_code,
            user_code: wire.user_code,
            verification_url: wire.verification_url,
            expires_in: wire.expires_in,
        })
    }

    /// Poll the token endpoint until the user approves or the budget
    /// runs out. `slow_down` doubles the interval for subsequent polls.
    pub async fn complete_device_flow(
        &self,
        provider: &str,
        device_code: &str,
    ) -> Result<TokenSet, AuthError> {
        let settings = self.require(provider)?;
        let client_id = settings
            .client_id
            .as_deref()
            .ok_or_else(|| AuthError::MissingField(provider.to_string(), "clientId"))?;
        let token_endpoint = settings
            .token_endpoint
            .as_deref()
            .ok_or_else(|| AuthError::MissingField(provider.to_string(), "tokenEndpoint"))?;

        let body = format!(
            "grant_type={}&device_code={}&client_id={}",
            urlencoding::encode(DEVICE_GRANT),
            urlencoding::encode(device_code),
            urlencoding::encode(client_id),
        );

        let mut poll_interval = DEVICE_POLL_INTERVAL;
        for _ in 0..DEVICE_POLL_BUDGET {
            sleep(poll_interval).await;

            let resp = self
                .client
                .post(token_endpoint)
                .header("Content-Type", "application/x-www-form-urlencoded")
                .body(body.clone())
                .send()
                .await
                .map_err(|err| AuthError::Http(err.to_string()))?;
            let status = resp.status();
            let bytes = resp
                .bytes()
                .await
                .map_err(|err| AuthError::Http(err.to_string()))?;

            if status.is_success() {
                let wire = serde_json::from_slice::<TokenWire>(&bytes)
                    .map_err(|err| AuthError::DeviceFlow(err.to_string()))?;
                let token = TokenSet {
                    provider: provider.to_string(),
                    access_token: wire.access_token,
                    refresh_token: wire.refresh_token,
                    expires_at: epoch_millis() + wire.expires_in as i64 * 1000,
                };
                self.store.save(token.clone()).await?;
                info!(event = "device_flow_complete", provider = %provider);
                return Ok(token);
            }

            let err = serde_json::from_slice::<TokenErrorWire>(&bytes).unwrap_or_default();
            match err.error.as_deref() {
                Some("authorization_pending") => continue,
                Some("slow_down") => {
                    poll_interval *= 2;
                    continue;
                }
                Some(code @ ("expired_token" | "access_denied")) => {
                    return Err(AuthError::DeviceDenied(
                        err.error_description.unwrap_or_else(|| code.to_string()),
                    ));
                }
                // Anything without a recognized error field is fatal.
                _ => {
                    return Err(AuthError::DeviceFlow(format!(
                        "{status} {}",
                        String::from_utf8_lossy(&bytes)
                    )));
                }
            }
        }

        Err(AuthError::DeviceFlow(
            "device flow polling budget exhausted".to_string(),
        ))
    }

    /// Exchange the stored refresh token for a fresh access token. A
    /// failed exchange deletes the stored entry: the next request will
    /// demand a full re-authentication instead of retrying a dead grant.
    pub async fn refresh_token(&self, provider: &str) -> Result<TokenSet, AuthError> {
        let settings = self.require(provider)?;
        let client_id = settings
            .client_id
            .as_deref()
            .ok_or_else(|| AuthError::MissingField(provider.to_string(), "clientId"))?;
        let token_endpoint = settings
            .token_endpoint
            .as_deref()
            .ok_or_else(|| AuthError::MissingField(provider.to_string(), "tokenEndpoint"))?;

        let Some(current) = self.store.get(provider).await else {
            return Err(AuthError::NotAuthenticated(provider.to_string()));
        };
        let Some(refresh_token) = current.refresh_token.clone() else {
            return Err(AuthError::Reauthenticate(provider.to_string()));
        };

        let mut body = format!(
            "grant_type=refresh_token&refresh_token={}&client_id={}",
            urlencoding::encode(&refresh_token),
            urlencoding::encode(client_id),
        );
        if let Some(secret) = settings.client_secret.as_deref() {
            body.push_str("&client_secret=");
            body.push_str(&urlencoding::encode(secret));
        }

        match self.post_token_endpoint(token_endpoint, body).await {
            Ok(wire) => {
                let token = TokenSet {
                    provider: provider.to_string(),
                    access_token: wire.access_token,
                    // Endpoints that rotate refresh tokens send a new one;
                    // otherwise the old grant stays valid.
                    refresh_token: wire.refresh_token.or(Some(refresh_token)),
                    expires_at: epoch_millis() + wire.expires_in as i64 * 1000,
                };
                self.store.save(token.clone()).await?;
                info!(event = "token_refreshed", provider = %provider);
                Ok(token)
            }
            Err(err) => {
                if let Err(delete_err) = self.store.delete(provider).await {
                    warn!(
                        event = "token_delete_failed",
                        provider = %provider,
                        error = %delete_err
                    );
                }
                warn!(event = "token_refresh_failed", provider = %provider, error = %err);
                Err(AuthError::Refresh(err.to_string()))
            }
        }
    }

    async fn post_token_endpoint(
        &self,
        endpoint: &str,
        body: String,
    ) -> Result<TokenWire, AuthError> {
        let resp = self
            .client
            .post(endpoint)
            .header("Content-Type", "application/x-www-form-urlencoded")
            .body(body)
            .send()
            .await
            .map_err(|err| AuthError::Http(err.to_string()))?;
        let status = resp.status();
        let bytes = resp
            .bytes()
            .await
            .map_err(|err| AuthError::Http(err.to_string()))?;
        if !status.is_success() {
            return Err(AuthError::Http(format!(
                "{status} {}",
                String::from_utf8_lossy(&bytes)
            )));
        }
        serde_json::from_slice::<TokenWire>(&bytes).map_err(|err| AuthError::Http(err.to_string()))
    }

    pub async fn delete_token(&self, provider: &str) -> Result<(), AuthError> {
        self.store.delete(provider).await?;
        Ok(())
    }

    /// A token ready to send upstream, refreshing once inline when the
    /// stored one has expired.
    pub async fn get_valid_token(&self, provider: &str) -> Result<TokenSet, AuthError> {
        let Some(current) = self.store.get(provider).await else {
            return Err(AuthError::NotAuthenticated(provider.to_string()));
        };
        if !current.is_expired_at(epoch_millis()) {
            return Ok(current);
        }
        if current.refresh_token.is_none() {
            return Err(AuthError::Reauthenticate(provider.to_string()));
        }

        let Some(flight) = self.refresh_flights.get(provider) else {
            return Err(AuthError::NotConfigured(provider.to_string()));
        };
        let _guard = flight.lock().await;
        // A concurrent caller may have refreshed while we queued.
        if let Some(current) = self.store.get(provider).await
            && !current.is_expired_at(epoch_millis())
        {
            return Ok(current);
        }
        self.refresh_token(provider).await
    }

    pub async fn sync_from_file(&self, path: &Path, provider: &str) {
        sync_token_file(&self.store, path, provider).await;
    }

    /// Start watching token files for add/change events. Starting twice
    /// is a no-op; `stop_watching` releases the watcher and its task.
    pub fn watch_files(&self, paths: &[PathBuf]) -> Result<(), AuthError> {
        let mut slot = self
            .watcher
            .lock()
            .map_err(|_| AuthError::Watch("watcher lock failed".to_string()))?;
        if slot.is_some() || paths.is_empty() {
            return Ok(());
        }

        let watched_names: HashSet<OsString> = paths
            .iter()
            .filter_map(|path| path.file_name().map(|name| name.to_os_string()))
            .collect();

        let (tx, rx) = tokio::sync::mpsc::unbounded_channel::<PathBuf>();
        let names_for_events = watched_names.clone();
        let mut watcher = notify::recommended_watcher(
            move |result: Result<notify::Event, notify::Error>| {
                let Ok(event) = result else { return };
                if !matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
                    return;
                }
                for path in event.paths {
                    let matched = path
                        .file_name()
                        .map(|name| names_for_events.contains(name))
                        .unwrap_or(false);
                    if matched {
                        let _ = tx.send(path);
                    }
                }
            },
        )
        .map_err(|err| AuthError::Watch(err.to_string()))?;

        // Watch parent directories so files created after startup are seen.
        let mut dirs: HashSet<PathBuf> = HashSet::new();
        for path in paths {
            let dir = path
                .parent()
                .filter(|parent| !parent.as_os_str().is_empty())
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from("."));
            dirs.insert(dir);
        }
        for dir in dirs {
            watcher
                .watch(&dir, RecursiveMode::NonRecursive)
                .map_err(|err| AuthError::Watch(err.to_string()))?;
        }

        let task = spawn_debounce_task(self.store.clone(), rx);
        *slot = Some(WatchHandle {
            _watcher: watcher,
            task,
        });
        info!(event = "token_watch_started", files = paths.len());
        Ok(())
    }

    pub fn stop_watching(&self) {
        let handle = match self.watcher.lock() {
            Ok(mut slot) => slot.take(),
            Err(_) => None,
        };
        if let Some(handle) = handle {
            handle.task.abort();
        }
    }
}

impl Drop for AuthManager {
    fn drop(&mut self) {
        self.stop_watching();
    }
}

fn spawn_debounce_task(
    store: Arc<TokenStore>,
    mut rx: tokio::sync::mpsc::UnboundedReceiver<PathBuf>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut pending: HashMap<PathBuf, Instant> = HashMap::new();
        let mut sweep = interval(WATCH_SWEEP);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                event = rx.recv() => {
                    match event {
                        Some(path) => {
                            pending.insert(path, Instant::now());
                        }
                        None => break,
                    }
                }
                _ = sweep.tick() => {
                    let now = Instant::now();
                    let ready: Vec<PathBuf> = pending
                        .iter()
                        .filter(|(_, seen)| now.duration_since(**seen) >= WATCH_STABILITY)
                        .map(|(path, _)| path.clone())
                        .collect();
                    for path in ready {
                        pending.remove(&path);
                        let provider = infer_provider(&path);
                        sync_token_file(&store, &path, provider).await;
                    }
                }
            }
        }
    })
}

/// Import a token payload from disk. Failures are logged and swallowed:
/// the watcher must survive whatever lands in these files.
pub async fn sync_token_file(store: &TokenStore, path: &Path, provider: &str) {
    if let Err(reason) = try_sync_token_file(store, path, provider).await {
        warn!(
            event = "token_file_rejected",
            provider = %provider,
            path = %path.display(),
            reason = %reason
        );
    }
}

async fn try_sync_token_file(
    store: &TokenStore,
    path: &Path,
    provider: &str,
) -> Result<(), String> {
    let bytes = tokio::fs::read(path)
        .await
        .map_err(|err| format!("read: {err}"))?;
    let wire =
        serde_json::from_slice::<FileTokenWire>(&bytes).map_err(|err| format!("parse: {err}"))?;

    let access_token = wire
        .access_token
        .filter(|token| !token.is_empty())
        .ok_or("missing access token")?;
    let expires_at = wire
        .expires_at
        .unwrap_or_else(|| epoch_millis() + FILE_SYNC_DEFAULT_TTL_MS);
    if expires_at <= epoch_millis() {
        return Err("token already expired".to_string());
    }

    store
        .save(TokenSet {
            provider: provider.to_string(),
            access_token,
            refresh_token: wire.refresh_token,
            expires_at,
        })
        .await
        .map_err(|err| format!("persist: {err}"))?;

    info!(
        event = "token_file_imported",
        provider = %provider,
        path = %path.display()
    );
    Ok(())
}

/// Guess the provider a token file belongs to from its name.
pub fn infer_provider(path: &Path) -> &'static str {
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();
    if name.contains("gemini") || name.contains("google") {
        "gemini"
    } else {
        "openai"
    }
}

fn default_device_expiry() -> u64 {
    900
}

fn default_expires_in() -> u64 {
    3600
}
