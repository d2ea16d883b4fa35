use std::sync::Arc;

use clap::Parser;

use visor_gateway::{GatewayClient, GatewayConfig};
use visor_server::{start_control_plane, ControlPlaneConfig, SessionRegistry};

/// Bridges a wearable display to a conversational backend.
#[derive(Parser, Debug)]
#[command(name = "visor", version)]
struct Args {
    /// Gateway WebSocket URL.
    #[arg(long, env = "VISOR_GATEWAY_URL", default_value = "ws://127.0.0.1:18789")]
    gateway_url: String,

    /// Gateway auth token.
    #[arg(long, env = "VISOR_GATEWAY_TOKEN", default_value = "", hide_env_values = true)]
    gateway_token: String,

    /// Backend conversation every turn is pinned to.
    #[arg(long, env = "VISOR_SESSION_KEY", default_value = "agent:main:main")]
    session_key: String,

    /// Control-plane port (loopback only).
    #[arg(long, env = "VISOR_CONTROL_PORT", default_value_t = 3001)]
    control_port: u16,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    tracing::info!(
        gateway = %args.gateway_url,
        control_port = args.control_port,
        "starting visor bridge"
    );

    let gateway = GatewayClient::new(GatewayConfig {
        url: args.gateway_url,
        token: args.gateway_token,
        session_key: args.session_key,
        ..GatewayConfig::default()
    });

    // Connection loss is never fatal: a failed first attempt keeps
    // retrying with backoff while the rest of the bridge comes up.
    if let Err(e) = gateway.connect().await {
        tracing::warn!(error = %e, "initial gateway connect failed, retrying in background");
    }

    // Device sessions attach through visor_server::attach_session from
    // the device SDK integration; the registry starts empty.
    let registry = Arc::new(SessionRegistry::new());

    let control = start_control_plane(
        ControlPlaneConfig {
            port: args.control_port,
        },
        Arc::clone(&registry),
        gateway.clone(),
    )
    .await?;

    tracing::info!(port = control.port, "visor bridge ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    gateway.shutdown();
    Ok(())
}
