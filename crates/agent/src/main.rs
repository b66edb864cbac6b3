//! `gx-agent`: reference Galaxy node.
//!
//! Loads `agent.toml` (or `GX_CONFIG`), applies `GX_*` overrides, connects to
//! the orchestration server and serves a few diagnostic actions until
//! Ctrl-C.
//!
//! # Env vars
//!
//! | Variable                    | Default                          |
//! |-----------------------------|----------------------------------|
//! | `GX_CONFIG`                 | `agent.toml`                     |
//! | `GX_GATEWAY_URL`            | `ws://localhost:8765/ws/device`  |
//! | `GX_NODE_ID`                | `android-node`                   |
//! | `GX_NODE_NAME`              | `galaxy-agent`                   |
//! | `GX_DEVICE_TYPE`            | `android`                        |
//! | `GX_HEARTBEAT_SECS`         | `30`                             |
//! | `GX_RECONNECT_BASE_MS`      | `5000`                           |
//! | `GX_RECONNECT_MAX_ATTEMPTS` | `10`                             |
//! | `GX_REQUEST_TIMEOUT_MS`     | `30000`                          |
//! | `GX_LOG_FORMAT`             | `json` (`pretty` for humans)     |
//!
//! # Actions
//!
//! - `ping`: pong with a timestamp
//! - `echo`: payload echoed back
//! - `device_info`: identity and capabilities of this node
//! - `node_wakeup`: built into the runtime

mod handlers;

use gx_node_sdk::{AgentConfig, ConfigSeverity, NodeRuntimeBuilder, RuntimeError};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let (config, path) = AgentConfig::load()?;
    let issues = config.validate();
    for issue in &issues {
        match issue.severity {
            ConfigSeverity::Error => tracing::error!(config = %path, "{issue}"),
            ConfigSeverity::Warning => tracing::warn!(config = %path, "{issue}"),
        }
    }
    if AgentConfig::has_errors(&issues) {
        anyhow::bail!("invalid configuration in {path}");
    }

    let runtime = NodeRuntimeBuilder::from_config(&config)
        .handler("ping", handlers::Ping)
        .handler("echo", handlers::Echo)
        .handler(
            "device_info",
            handlers::DeviceInfo {
                node_id: config.node_id.clone(),
                name: config.node_name.clone(),
                device_type: config.device_type.clone(),
                capabilities: config.capabilities.clone(),
            },
        )
        .listener("status_changed", handlers::LogEvents)
        .listener("config_changed", handlers::LogEvents)
        .stream_handler(handlers::LogStreams)
        .build()?;

    tracing::info!(
        node_id = %config.node_id,
        name = %config.node_name,
        url = %config.gateway_url,
        "starting gx-agent"
    );

    match runtime.start().await {
        Ok(()) => {}
        // Keeps retrying in the background.
        Err(RuntimeError::Transport(e)) => {
            tracing::warn!(error = %e, "initial connection failed, retrying in background");
        }
        Err(e) => return Err(e.into()),
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("Ctrl-C received, shutting down");
    runtime.shutdown().await;
    Ok(())
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,gx_node_sdk=debug"));

    let pretty = std::env::var("GX_LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("pretty"));
    if pretty {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    }
}
