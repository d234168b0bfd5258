//! Drives the host agent's own signaling client and admin router against a
//! real rendezvous server, in-process. Unlike vibe-coder-rendezvous's own
//! routing tests (which fake both sides with raw WebSocket clients), this
//! exercises `vibe_coder_host::dispatch`, `bridge::signaling_client`, and
//! `admin::router` exactly as `main()` wires them — the only thing faked
//! here is the mobile client.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;

use vibe_coder_host::admin::{self, AppState};
use vibe_coder_host::bridge::{signaling_client, Bridge};
use vibe_coder_host::config::{AssistantMode, HostConfig};
use vibe_coder_host::dispatch::dispatch_signaling_message;
use vibe_coder_host::persist;
use vibe_coder_host::session::SessionTable;

use vibe_coder_proto::{totp, SignalingMessage};
use vibe_coder_rendezvous::{state::SharedState, ws};

async fn spawn_rendezvous() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let state = Arc::new(SharedState::new());
    let app = ws::router(state, "/");
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("ws://{addr}/")
}

type Client = tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

async fn connect(url: &str) -> Client {
    let (stream, _) = tokio_tungstenite::connect_async(url).await.unwrap();
    stream
}

async fn send(ws: &mut Client, msg: &SignalingMessage) {
    let json = serde_json::to_string(msg).unwrap();
    ws.send(Message::Text(json.into())).await.unwrap();
}

async fn recv(ws: &mut Client) -> SignalingMessage {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("stream ended")
            .unwrap();
        if let Message::Text(text) = frame {
            return serde_json::from_str(&text).unwrap();
        }
    }
}

/// Boots a host agent's admin router + signaling client against `rendezvous_url`,
/// mirroring `main()`'s wiring, and returns the admin base URL.
async fn spawn_host(rendezvous_url: &str) -> String {
    let workspace = tempfile::tempdir().unwrap();
    let config = Arc::new(HostConfig {
        workspace_path: workspace.path().to_str().unwrap().to_string(),
        port: 0,
        signaling_url: rendezvous_url.to_string(),
        signaling_ws_path: String::new(),
        stun_servers: String::new(),
        turn_servers: String::new(),
        max_connections: 16,
        log_level: "error".to_string(),
        assistant_mode: AssistantMode::PerSession,
        assistant_bin: "/bin/cat".to_string(),
        command_timeout_secs: 10,
        totp_window_steps: 2,
    });

    let identity = persist::load_or_create(&config.workspace_path).unwrap();
    let sessions = Arc::new(SessionTable::new(
        identity,
        config.workspace_path.clone(),
        config.totp_window_steps,
        config.max_connections,
    ));

    let (_shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let dispatch_cell: Arc<tokio::sync::OnceCell<Arc<Bridge>>> = Arc::new(tokio::sync::OnceCell::new());
    let dispatch_cell_for_client = Arc::clone(&dispatch_cell);
    let sessions_for_dispatch = Arc::clone(&sessions);

    let signaling = signaling_client::spawn(
        rendezvous_url.to_string(),
        Arc::new(move |msg: SignalingMessage| {
            let bridge_cell = Arc::clone(&dispatch_cell_for_client);
            let sessions = Arc::clone(&sessions_for_dispatch);
            tokio::spawn(async move {
                if let Some(bridge) = bridge_cell.get() {
                    dispatch_signaling_message(&sessions, bridge, msg).await;
                }
            });
        }),
        shutdown_rx,
    );

    let bridge = Bridge::new(Arc::clone(&config), Arc::clone(&sessions), signaling);
    let _ = dispatch_cell.set(Arc::clone(&bridge));

    let app_state = AppState {
        sessions,
        bridge,
        config,
        started_at: Instant::now(),
    };
    let app = admin::router(app_state).into_make_service_with_connect_info::<std::net::SocketAddr>();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let admin_addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    // Give the signaling client time to establish its rendezvous connection.
    tokio::time::sleep(Duration::from_millis(200)).await;

    format!("http://{admin_addr}")
}

#[derive(serde::Deserialize)]
struct AuthSetupResponse {
    session_id: String,
    totp_secret: String,
}

#[tokio::test]
async fn auth_setup_registers_the_host_and_completes_totp_verification() {
    let rendezvous_url = spawn_rendezvous().await;
    let admin_url = spawn_host(&rendezvous_url).await;

    let http = reqwest::Client::new();
    let setup: AuthSetupResponse = http
        .get(format!("{admin_url}/api/auth/setup"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    // Give the RegisterHost frame sent from auth_setup time to reach the
    // rendezvous and be applied before a client tries to use the session.
    tokio::time::sleep(Duration::from_millis(200)).await;

    let mut client = connect(&rendezvous_url).await;
    send(
        &mut client,
        &SignalingMessage::JoinSession {
            session_id: setup.session_id.clone(),
            client_id: "mobile-1".into(),
        },
    )
    .await;
    assert!(matches!(recv(&mut client).await, SignalingMessage::SessionJoined { .. }));

    let code = totp::generate_code(&setup.totp_secret, chrono::Utc::now().timestamp()).unwrap();
    send(
        &mut client,
        &SignalingMessage::VerifyTotp {
            session_id: setup.session_id.clone(),
            client_id: Some("mobile-1".into()),
            totp_code: code,
        },
    )
    .await;

    // If RegisterHost was never sent, the rendezvous has no host socket on
    // file and replies with an `error("Host not available")` instead of
    // ever reaching the host's dispatch loop — this would hang or fail.
    match recv(&mut client).await {
        SignalingMessage::AuthSuccess { session_id } => assert_eq!(session_id, setup.session_id),
        other => panic!("expected AuthSuccess, got {other:?}"),
    }
}
