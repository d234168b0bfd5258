//! Host-side signaling client: a `tokio-tungstenite` connection out to the
//! rendezvous, reconnected with exponential backoff on drop.
//!
//! The backoff shape (1s initial, doubling, 60s cap) mirrors the teacher's
//! `s2s::connect_peer_with_retry` — only the transport differs (WebSocket
//! here instead of an iroh QUIC stream).

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

use vibe_coder_proto::SignalingMessage;

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(60);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Handle used by the rest of the host agent to send signaling frames; the
/// receive side is driven internally and dispatched via `on_message`.
#[derive(Clone)]
pub struct SignalingClient {
    outbound: mpsc::UnboundedSender<SignalingMessage>,
}

impl SignalingClient {
    pub fn send(&self, msg: SignalingMessage) {
        let _ = self.outbound.send(msg);
    }
}

/// Run the signaling client until `shutdown` resolves. Reconnects forever
/// with exponential backoff; each successful connection resets the backoff
/// to its initial value, matching the teacher's pattern.
pub fn spawn<F>(url: String, on_message: Arc<F>, mut shutdown: tokio::sync::watch::Receiver<bool>)
-> SignalingClient
where
    F: Fn(SignalingMessage) + Send + Sync + 'static,
{
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<SignalingMessage>();
    let client = SignalingClient {
        outbound: outbound_tx,
    };

    tokio::spawn(async move {
        let mut backoff = INITIAL_BACKOFF;

        loop {
            if *shutdown.borrow() {
                return;
            }

            tracing::info!(url = %url, "connecting to rendezvous");
            let connect_result = tokio::time::timeout(
                CONNECT_TIMEOUT,
                tokio_tungstenite::connect_async(&url),
            )
            .await;

            let stream = match connect_result {
                Ok(Ok((stream, _))) => stream,
                Ok(Err(e)) => {
                    tracing::warn!(backoff_secs = backoff.as_secs(), "rendezvous connect failed: {e}");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                    continue;
                }
                Err(_) => {
                    tracing::warn!(backoff_secs = backoff.as_secs(), "rendezvous connect timed out");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                    continue;
                }
            };

            backoff = INITIAL_BACKOFF;
            tracing::info!("connected to rendezvous");

            let (mut write, mut read) = stream.split();
            let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
            heartbeat.tick().await; // first tick fires immediately

            'connection: loop {
                tokio::select! {
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            let _ = write.send(Message::Close(None)).await;
                            return;
                        }
                    }
                    _ = heartbeat.tick() => {
                        let hb = SignalingMessage::Heartbeat {
                            session_id: String::new(),
                            client_id: None,
                            timestamp: chrono::Utc::now().timestamp(),
                        };
                        if let Ok(json) = serde_json::to_string(&hb) {
                            if write.send(Message::Text(json.into())).await.is_err() {
                                break 'connection;
                            }
                        }
                    }
                    outgoing = outbound_rx.recv() => {
                        match outgoing {
                            Some(msg) => {
                                let json = serde_json::to_string(&msg).expect("SignalingMessage always serializes");
                                if write.send(Message::Text(json.into())).await.is_err() {
                                    break 'connection;
                                }
                            }
                            None => return,
                        }
                    }
                    incoming = read.next() => {
                        match incoming {
                            Some(Ok(Message::Text(text))) => {
                                match serde_json::from_str::<SignalingMessage>(&text) {
                                    Ok(msg) => on_message(msg),
                                    Err(e) => tracing::warn!("malformed signaling frame: {e}"),
                                }
                            }
                            Some(Ok(Message::Close(_))) | None => break 'connection,
                            Some(Ok(_)) => {}
                            Some(Err(e)) => {
                                tracing::warn!("rendezvous socket error: {e}");
                                break 'connection;
                            }
                        }
                    }
                }
            }

            tracing::warn!(backoff_secs = backoff.as_secs(), "rendezvous link dropped, will reconnect");
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
    });

    client
}
