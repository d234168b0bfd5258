use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use vibe_coder_rendezvous::config::RendezvousConfig;
use vibe_coder_rendezvous::state::SharedState;
use vibe_coder_rendezvous::ws;

#[tokio::main]
async fn main() -> Result<()> {
    let json_logs = std::env::var("VIBE_RENDEZVOUS_LOG_JSON").unwrap_or_default() == "1";
    let filter =
        EnvFilter::from_default_env().add_directive("vibe_coder_rendezvous=info".parse()?);
    if json_logs {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let config = RendezvousConfig::parse();
    if let Err(e) = config.validate() {
        tracing::error!("invalid configuration: {e}");
        std::process::exit(2);
    }

    tracing::info!(
        addr = %config.listen_addr,
        path = %config.ws_path,
        "starting vibe-coder rendezvous"
    );

    let state = Arc::new(SharedState::new());

    tokio::spawn(ws::run_sweep(
        Arc::clone(&state),
        Duration::from_secs(config.session_ttl_secs),
        Duration::from_secs(config.sweep_interval_secs),
    ));

    let app = ws::router(Arc::clone(&state), &config.ws_path);
    let listener = match tokio::net::TcpListener::bind(&config.listen_addr).await {
        Ok(l) => l,
        Err(e) => {
            tracing::error!("failed to bind {}: {e}", config.listen_addr);
            std::process::exit(1);
        }
    };

    axum::serve(listener, app).await?;
    Ok(())
}
