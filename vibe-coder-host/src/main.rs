use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use vibe_coder_host::admin::{self, AppState};
use vibe_coder_host::bridge::signaling_client;
use vibe_coder_host::bridge::Bridge;
use vibe_coder_host::config::HostConfig;
use vibe_coder_host::dispatch::dispatch_signaling_message;
use vibe_coder_host::persist;
use vibe_coder_host::session::SessionTable;

use vibe_coder_proto::SignalingMessage;

#[tokio::main]
async fn main() -> Result<()> {
    let json_logs = std::env::var("VIBE_CODER_LOG_JSON").unwrap_or_default() == "1";
    let config = HostConfig::parse();
    let filter = EnvFilter::from_default_env()
        .add_directive(format!("vibe_coder_host={}", config.log_level).parse()?);
    if json_logs {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    if let Err(e) = config.validate() {
        tracing::error!("invalid configuration: {e}");
        std::process::exit(2);
    }
    let config = Arc::new(config);

    let identity = match persist::load_or_create(&config.workspace_path) {
        Ok(identity) => identity,
        Err(e) => {
            tracing::error!("failed to load host identity: {e}");
            std::process::exit(1);
        }
    };
    tracing::info!(host_id = %identity.host_id, "host identity ready");

    let sessions = Arc::new(SessionTable::new(
        identity,
        config.workspace_path.clone(),
        config.totp_window_steps,
        config.max_connections,
    ));

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let signaling_url = format!(
        "{}{}",
        config.signaling_url.trim_end_matches('/'),
        config.signaling_ws_path
    );

    // Bridge and signaling client reference each other: the bridge sends
    // outbound signaling frames, the signaling client dispatches inbound
    // ones into the bridge/session table. Build the client first with a
    // placeholder dispatcher cell, then fill it in once the bridge exists.
    let dispatch_cell: Arc<tokio::sync::OnceCell<Arc<Bridge>>> = Arc::new(tokio::sync::OnceCell::new());
    let dispatch_cell_for_client = Arc::clone(&dispatch_cell);
    let sessions_for_dispatch = Arc::clone(&sessions);

    let signaling = signaling_client::spawn(
        signaling_url,
        Arc::new(move |msg: SignalingMessage| {
            let bridge_cell = Arc::clone(&dispatch_cell_for_client);
            let sessions = Arc::clone(&sessions_for_dispatch);
            tokio::spawn(async move {
                if let Some(bridge) = bridge_cell.get() {
                    dispatch_signaling_message(&sessions, bridge, msg).await;
                }
            });
        }),
        shutdown_rx.clone(),
    );

    let bridge = Bridge::new(Arc::clone(&config), Arc::clone(&sessions), signaling.clone());
    let _ = dispatch_cell.set(Arc::clone(&bridge));

    let sweep_bridge = Arc::clone(&bridge);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(5 * 60));
        loop {
            ticker.tick().await;
            sweep_bridge.sweep().await;
        }
    });

    let app_state = AppState {
        sessions: Arc::clone(&sessions),
        bridge: Arc::clone(&bridge),
        config: Arc::clone(&config),
        started_at: Instant::now(),
    };
    let app = admin::router(app_state).into_make_service_with_connect_info::<std::net::SocketAddr>();

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            tracing::error!("failed to bind {addr}: {e}");
            std::process::exit(1);
        }
    };

    tracing::info!(
        addr = %addr,
        signaling_url = %config.signaling_url,
        "starting vibe-coder host agent"
    );

    // Graceful shutdown (spec.md §5): stop accepting new peer channels by
    // tearing down the admin listener's serve future, then close every live
    // peer channel and assistant session, then drop the signaling client.
    // The whole sequence is capped well under the spec's 30s budget.
    tokio::select! {
        result = axum::serve(listener, app) => {
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown requested, draining peer channels and assistants");
            let _ = shutdown_tx.send(true);
            let _ = tokio::time::timeout(Duration::from_secs(20), bridge.shutdown()).await;
        }
    }

    Ok(())
}
