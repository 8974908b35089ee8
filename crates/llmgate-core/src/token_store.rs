use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, MutexGuard};
use tracing::warn;

use crate::epoch_millis;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("persist token store: {0}")]
    Io(#[from] std::io::Error),
    #[error("encode token store: {0}")]
    Encode(#[from] serde_json::Error),
}

/// One provider's OAuth material. Mutated only by whole-record
/// replacement; `expires_at` is the absolute wall-clock deadline in ms.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenSet {
    pub provider: String,
    pub access_token: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    pub expires_at: i64,
}

impl TokenSet {
    pub fn is_expired_at(&self, now_ms: i64) -> bool {
        now_ms >= self.expires_at
    }
}

/// `provider → TokenSet` persisted as one pretty-printed JSON file.
///
/// The file is loaded lazily on first use; a missing file is an empty
/// store, and unreadable or malformed content starts empty with a
/// warning rather than failing the process. Writes serialize the full
/// snapshot to a temp file and rename it into place.
pub struct TokenStore {
    path: PathBuf,
    entries: Mutex<Option<HashMap<String, TokenSet>>>,
}

impl TokenStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            entries: Mutex::new(None),
        }
    }

    pub async fn save(&self, token: TokenSet) -> Result<(), StoreError> {
        let mut guard = self.loaded().await;
        if let Some(entries) = guard.as_mut() {
            entries.insert(token.provider.clone(), token);
        }
        self.persist(&guard).await
    }

    pub async fn get(&self, provider: &str) -> Option<TokenSet> {
        let guard = self.loaded().await;
        guard.as_ref().and_then(|entries| entries.get(provider).cloned())
    }

    pub async fn delete(&self, provider: &str) -> Result<(), StoreError> {
        let mut guard = self.loaded().await;
        if let Some(entries) = guard.as_mut() {
            entries.remove(provider);
        }
        self.persist(&guard).await
    }

    /// Snapshot of every stored entry; callers get owned copies.
    pub async fn all(&self) -> HashMap<String, TokenSet> {
        let guard = self.loaded().await;
        guard.as_ref().cloned().unwrap_or_default()
    }

    /// True when no entry exists or its deadline has passed.
    pub async fn is_expired(&self, provider: &str) -> bool {
        match self.get(provider).await {
            Some(token) => token.is_expired_at(epoch_millis()),
            None => true,
        }
    }

    async fn loaded(&self) -> MutexGuard<'_, Option<HashMap<String, TokenSet>>> {
        let mut guard = self.entries.lock().await;
        if guard.is_none() {
            *guard = Some(self.read_file().await);
        }
        guard
    }

    async fn read_file(&self) -> HashMap<String, TokenSet> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return HashMap::new(),
            Err(err) => {
                warn!(
                    event = "token_store_unreadable",
                    path = %self.path.display(),
                    error = %err
                );
                return HashMap::new();
            }
        };
        match serde_json::from_slice(&bytes) {
            Ok(entries) => entries,
            Err(err) => {
                warn!(
                    event = "token_store_malformed",
                    path = %self.path.display(),
                    error = %err
                );
                HashMap::new()
            }
        }
    }

    async fn persist(
        &self,
        guard: &MutexGuard<'_, Option<HashMap<String, TokenSet>>>,
    ) -> Result<(), StoreError> {
        let entries = guard.as_ref().cloned().unwrap_or_default();
        let body = serde_json::to_vec_pretty(&entries)?;

        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }

        // Write-then-rename so a crash mid-write never truncates the store.
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &body).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}
