use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("gateway host must be a loopback address, got {0:?}")]
    NonLoopbackHost(String),
}

/// Final, parsed gateway configuration. The core consumes this record;
/// reading it from disk is the binary's job. Immutable after load.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayConfig {
    #[serde(default)]
    pub gateway: GatewaySettings,
    #[serde(default)]
    pub auth: AuthSettings,
    #[serde(default)]
    pub model_aliases: Vec<ModelAlias>,
    #[serde(default)]
    pub rate_limits: Vec<RateLimitConfig>,
    #[serde(default)]
    pub providers: HashMap<String, ProviderSettings>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewaySettings {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthSettings {
    #[serde(default = "default_token_store_path")]
    pub token_store_path: PathBuf,
    #[serde(default)]
    pub watch_files: Vec<PathBuf>,
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            token_store_path: default_token_store_path(),
            watch_files: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderSettings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_endpoint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_endpoint: Option<String>,
    pub api_endpoint: String,
}

/// One candidate expansion of an alias. Lower `priority` wins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderModel {
    pub provider: String,
    pub model: String,
    #[serde(default)]
    pub priority: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelAlias {
    pub alias: String,
    pub providers: Vec<ProviderModel>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitConfig {
    pub provider: String,
    pub requests_per_minute: u32,
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8787
}

fn default_token_store_path() -> PathBuf {
    PathBuf::from("tokens.json")
}

fn default_max_queue_size() -> usize {
    100
}

/// The gateway forwards stored bearer tokens verbatim; it must never be
/// reachable from off-host.
pub fn ensure_loopback(host: &str) -> Result<(), ConfigError> {
    match host {
        "localhost" | "127.0.0.1" | "::1" => Ok(()),
        other => Err(ConfigError::NonLoopbackHost(other.to_string())),
    }
}
