use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::config::{ModelAlias, ProviderModel};

pub const DEFAULT_FAILURE_TTL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unknown model: {0}")]
pub struct UnknownModel(pub String);

/// Alias resolution plus transient failure memory.
///
/// A provider reported failed stays out of selection for `failure_ttl`;
/// entries are evicted lazily on each read. When every candidate is
/// failed the router still hands back the best of them, so the gateway
/// degrades to attempting upstream instead of short-circuiting.
pub struct ModelRouter {
    aliases: HashMap<String, Vec<ProviderModel>>,
    failed: Mutex<HashMap<String, Instant>>,
    failure_ttl: Duration,
}

impl ModelRouter {
    pub fn new(aliases: &[ModelAlias]) -> Self {
        Self::with_failure_ttl(aliases, DEFAULT_FAILURE_TTL)
    }

    pub fn with_failure_ttl(aliases: &[ModelAlias], failure_ttl: Duration) -> Self {
        let aliases = aliases
            .iter()
            .map(|alias| {
                let mut providers = alias.providers.clone();
                providers.sort_by_key(|candidate| candidate.priority);
                (alias.alias.clone(), providers)
            })
            .collect();
        Self {
            aliases,
            failed: Mutex::new(HashMap::new()),
            failure_ttl,
        }
    }

    /// Candidates for a client-visible model name, best first. A name
    /// with no alias falls back to an explicit `provider/model` split.
    pub fn resolve(&self, model: &str) -> Result<Vec<ProviderModel>, UnknownModel> {
        if let Some(candidates) = self.aliases.get(model) {
            return Ok(candidates.clone());
        }
        if let Some((provider, name)) = model.split_once('/')
            && !provider.is_empty()
            && !name.is_empty()
        {
            return Ok(vec![ProviderModel {
                provider: provider.to_string(),
                model: name.to_string(),
                priority: 0,
            }]);
        }
        Err(UnknownModel(model.to_string()))
    }

    pub async fn select(&self, candidates: &[ProviderModel]) -> Option<ProviderModel> {
        let now = Instant::now();
        let mut failed = self.failed.lock().await;
        failed.retain(|_, at| now.duration_since(*at) <= self.failure_ttl);

        candidates
            .iter()
            .find(|candidate| !failed.contains_key(&candidate.provider))
            .or_else(|| candidates.first())
            .cloned()
    }

    pub async fn mark_failed(&self, provider: &str) {
        let mut failed = self.failed.lock().await;
        failed.insert(provider.to_string(), Instant::now());
    }

    /// Record a failure and pick the next candidate for the same model.
    pub async fn next_provider(
        &self,
        model: &str,
        failed_provider: &str,
    ) -> Result<Option<ProviderModel>, UnknownModel> {
        self.mark_failed(failed_provider).await;
        let candidates = self.resolve(model)?;
        Ok(self.select(&candidates).await)
    }

    pub fn aliases(&self) -> Vec<String> {
        let mut names: Vec<_> = self.aliases.keys().cloned().collect();
        names.sort();
        names
    }

    /// Providers currently inside the failure TTL.
    pub async fn failed_providers(&self) -> Vec<String> {
        let now = Instant::now();
        let mut failed = self.failed.lock().await;
        failed.retain(|_, at| now.duration_since(*at) <= self.failure_ttl);
        let mut names: Vec<_> = failed.keys().cloned().collect();
        names.sort();
        names
    }
}
