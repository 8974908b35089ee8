use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use llmgate_core::config::{GatewayConfig, ensure_loopback};
use llmgate_core::state::GatewayState;
use llmgate_provider::{AdapterRegistry, GeminiAdapter, OpenAiAdapter, UserAgentPool};

#[derive(Debug, Parser)]
#[command(name = "llmgate", about = "Local OpenAI-compatible gateway over OAuth LLM providers")]
struct Cli {
    /// Path to the JSON configuration file.
    #[arg(short, long, default_value = "llmgate.json")]
    config: PathBuf,
    /// Override the configured listen host.
    #[arg(long)]
    host: Option<String>,
    /// Override the configured listen port.
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let mut config = load_config(&cli.config)?;
    if let Some(host) = cli.host {
        config.gateway.host = host;
    }
    if let Some(port) = cli.port {
        config.gateway.port = port;
    }

    // Refuse to start anywhere but loopback; stored bearer tokens are
    // forwarded verbatim to whoever can reach this listener.
    ensure_loopback(&config.gateway.host)?;

    let client = llmgate_provider::client::build_client()?;
    let registry = build_adapters(&config, client.clone());
    let watch_files = config.auth.watch_files.clone();
    let state = GatewayState::new(config, registry, client);

    for path in &watch_files {
        let provider = llmgate_core::auth::infer_provider(path);
        state.auth.sync_from_file(path, provider).await;
    }
    state.auth.watch_files(&watch_files)?;

    let app = llmgate_router::gateway_router(state.clone());
    let bind = format!(
        "{}:{}",
        state.config.gateway.host, state.config.gateway.port
    );
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("bind {bind}"))?;
    info!(event = "gateway_listening", addr = %bind);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Reject queued waiters deterministically before the process exits.
    state.limiter.dispose().await;
    state.auth.stop_watching();
    info!(event = "gateway_stopped");
    Ok(())
}

fn load_config(path: &PathBuf) -> Result<GatewayConfig> {
    let raw = std::fs::read(path).with_context(|| format!("read config {}", path.display()))?;
    serde_json::from_slice(&raw).with_context(|| format!("parse config {}", path.display()))
}

/// Provider name decides the wire dialect: `gemini`/`google` speak
/// `generateContent`, everything else is treated as OpenAI-compatible.
fn build_adapters(config: &GatewayConfig, client: wreq::Client) -> AdapterRegistry {
    let agents = Arc::new(UserAgentPool::new());
    let mut registry = AdapterRegistry::new();
    for (name, settings) in &config.providers {
        if !settings.enabled {
            continue;
        }
        if name.contains("gemini") || name.contains("google") {
            registry.register(Arc::new(GeminiAdapter::new(
                name.clone(),
                settings.api_endpoint.clone(),
                client.clone(),
                agents.clone(),
            )));
        } else {
            registry.register(Arc::new(OpenAiAdapter::new(
                name.clone(),
                settings.api_endpoint.clone(),
                client.clone(),
                agents.clone(),
            )));
        }
        info!(event = "provider_registered", provider = %name);
    }
    registry
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!(event = "shutdown_requested");
}
