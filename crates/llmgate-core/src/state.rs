use std::sync::Arc;

use llmgate_provider::AdapterRegistry;

use crate::auth::AuthManager;
use crate::config::GatewayConfig;
use crate::dispatch::Dispatcher;
use crate::epoch_millis;
use crate::limiter::RateLimiter;
use crate::router::ModelRouter;
use crate::token_store::TokenStore;
use crate::usage::UsageTracker;

/// Long-lived components shared by the HTTP surface. Each component
/// owns its own state; this is just the wiring.
#[derive(Clone)]
pub struct GatewayState {
    pub config: Arc<GatewayConfig>,
    pub store: Arc<TokenStore>,
    pub limiter: Arc<RateLimiter>,
    pub router: Arc<ModelRouter>,
    pub auth: Arc<AuthManager>,
    pub usage: Arc<UsageTracker>,
    pub dispatcher: Arc<Dispatcher>,
    pub started_at_epoch_sec: i64,
}

impl GatewayState {
    /// Wire the core from a parsed config and a registry of upstream
    /// adapters (built by the binary, which owns the HTTP client).
    pub fn new(config: GatewayConfig, adapters: AdapterRegistry, auth_client: wreq::Client) -> Self {
        let store = Arc::new(TokenStore::new(config.auth.token_store_path.clone()));
        let limiter = Arc::new(RateLimiter::new(&config.rate_limits));
        let router = Arc::new(ModelRouter::new(&config.model_aliases));
        let auth = Arc::new(AuthManager::new(
            config.providers.clone(),
            store.clone(),
            auth_client,
        ));
        let usage = Arc::new(UsageTracker::new());
        let dispatcher = Arc::new(Dispatcher::new(
            router.clone(),
            limiter.clone(),
            auth.clone(),
            Arc::new(adapters),
            usage.clone(),
        ));
        Self {
            config: Arc::new(config),
            store,
            limiter,
            router,
            auth,
            usage,
            dispatcher,
            started_at_epoch_sec: epoch_millis() / 1000,
        }
    }

    pub fn enabled_providers(&self) -> Vec<String> {
        let mut names: Vec<_> = self
            .config
            .providers
            .iter()
            .filter(|(_, settings)| settings.enabled)
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }
}
