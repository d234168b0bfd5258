//! WebSocket signaling endpoint: accepts connections, identifies them as
//! host or client within a session, and routes offer/answer/ICE/TOTP
//! traffic between exactly one host and one-or-many clients per session
//! (spec.md §4.1). Holds no authentication state — the host alone owns
//! TOTP validation; this process only moves bytes and tracks connections.

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tower_http::cors::CorsLayer;
use vibe_coder_proto::ids::generate_connection_id;
use vibe_coder_proto::{IceCandidateInit, SessionDescription, SignalingMessage};

use crate::state::{Role, SharedState, SignalingError};

pub fn router(state: Arc<SharedState>, ws_path: &str) -> Router {
    Router::new()
        .route(ws_path, get(ws_upgrade))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn ws_upgrade(
    ws: WebSocketUpgrade,
    State(state): State<Arc<SharedState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<SharedState>) {
    let connection_id = generate_connection_id();
    let (mut ws_tx, mut ws_rx) = socket.split();

    let (out_tx, mut out_rx) = mpsc::channel::<Message>(64);
    let writer_task = tokio::spawn(async move {
        while let Some(msg) = out_rx.recv().await {
            if ws_tx.send(msg).await.is_err() {
                break;
            }
        }
    });

    while let Some(frame) = ws_rx.next().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(e) => {
                tracing::debug!("websocket read error: {e}");
                break;
            }
        };
        match frame {
            Message::Text(text) => {
                handle_text(&text, &connection_id, &out_tx, &state).await;
            }
            Message::Binary(_) => {
                send(&out_tx, &SignalingMessage::error(None, "binary frames are rejected")).await;
            }
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) => {}
        }
    }

    drop(out_tx);
    let _ = writer_task.await;
    on_disconnect(&connection_id, &state).await;
}

async fn send(tx: &mpsc::Sender<Message>, msg: &SignalingMessage) {
    let Ok(json) = serde_json::to_string(msg) else {
        tracing::error!("failed to serialize outbound signaling message");
        return;
    };
    if tx.send(Message::Text(json.into())).await.is_err() {
        tracing::warn!("dropped outbound signaling message: socket closed");
    }
}

async fn handle_text(
    text: &str,
    connection_id: &str,
    out_tx: &mpsc::Sender<Message>,
    state: &Arc<SharedState>,
) {
    let message: SignalingMessage = match serde_json::from_str(text) {
        Ok(m) => m,
        Err(e) => {
            tracing::debug!("malformed signaling frame: {e}");
            send(out_tx, &SignalingMessage::error(None, "malformed JSON")).await;
            return;
        }
    };

    use SignalingMessage::*;
    match message {
        RegisterHost { session_id } => {
            state.register_host(&session_id, connection_id, out_tx.clone());
            send(out_tx, &SessionCreated { session_id }).await;
        }
        JoinSession {
            session_id,
            client_id,
        } => {
            state.join_session(&session_id, &client_id, connection_id, out_tx.clone());
            send(
                out_tx,
                &SessionJoined {
                    session_id: session_id.clone(),
                    client_id: client_id.clone(),
                },
            )
            .await;
            if let Some(host) = state.host_socket(&session_id) {
                send(
                    &host,
                    &PeerConnected {
                        session_id,
                        client_id: Some(client_id),
                    },
                )
                .await;
            }
        }
        VerifyTotp {
            session_id,
            client_id,
            totp_code,
        } => {
            state.touch(&session_id);
            let Some(host) = state.host_socket(&session_id) else {
                send(
                    out_tx,
                    &SignalingMessage::error(Some(session_id), SignalingError::HostUnavailable.to_string()),
                )
                .await;
                return;
            };
            // Forwarded verbatim — the rendezvous never inspects TOTP codes.
            send(
                &host,
                &VerifyTotp {
                    session_id,
                    client_id,
                    totp_code,
                },
            )
            .await;
        }
        Offer {
            session_id,
            client_id,
            offer,
        } => {
            let Some(client_id) = client_id else {
                send(out_tx, &SignalingMessage::error(Some(session_id), SignalingError::OfferMissingClientId.to_string())).await;
                return;
            };
            state.record_offer(&session_id, &client_id, offer.clone());
            route_from_client_to_host(
                &session_id,
                out_tx,
                state,
                OfferReceived {
                    session_id: session_id.clone(),
                    client_id,
                    offer,
                },
            )
            .await;
        }
        Answer {
            session_id,
            client_id,
            answer,
        } => {
            state.record_answer(&session_id, answer.clone());
            deliver_to_clients(
                &session_id,
                client_id,
                out_tx,
                state,
                |cid| AnswerReceived {
                    session_id: session_id.clone(),
                    client_id: cid,
                    answer: answer.clone(),
                },
            )
            .await;
        }
        IceCandidate {
            session_id,
            client_id,
            candidate,
        } => {
            handle_ice_candidate(session_id, client_id, candidate, connection_id, out_tx, state)
                .await;
        }
        LeaveSession {
            session_id,
            client_id,
        } => {
            state.leave_session(&session_id, &client_id);
            if let Some(host) = state.host_socket(&session_id) {
                send(
                    &host,
                    &PeerDisconnected {
                        session_id,
                        client_id: Some(client_id),
                    },
                )
                .await;
            }
        }
        Heartbeat {
            session_id,
            timestamp,
            ..
        } => {
            state.touch(&session_id);
            send(
                out_tx,
                &HeartbeatAck {
                    session_id,
                    timestamp,
                },
            )
            .await;
        }
        // Host → rendezvous, after a successful verify-totp round trip:
        // broadcast to every client of the session (AuthSuccess carries no
        // clientId of its own).
        AuthSuccess { session_id } => {
            deliver_to_clients(&session_id, None, out_tx, state, |_| AuthSuccess {
                session_id: session_id.clone(),
            })
            .await;
        }
        // Every other variant is an outbound-only notification; receiving
        // one from a client/host is a protocol violation.
        other => {
            send(
                out_tx,
                &SignalingMessage::error(
                    other.session_id().map(str::to_string),
                    SignalingError::UnexpectedDirection.to_string(),
                ),
            )
            .await;
        }
    }
}

/// Route a message that originated from a client to the session's host.
async fn route_from_client_to_host(
    session_id: &str,
    out_tx: &mpsc::Sender<Message>,
    state: &Arc<SharedState>,
    msg: SignalingMessage,
) {
    match state.host_socket(session_id) {
        Some(host) => send(&host, &msg).await,
        None => {
            send(
                out_tx,
                &SignalingMessage::error(Some(session_id.to_string()), SignalingError::HostUnavailable.to_string()),
            )
            .await
        }
    }
}

/// Deliver a message from the host to one client (if `client_id` is given)
/// or to every client of the session (broadcast).
async fn deliver_to_clients<F>(
    session_id: &str,
    client_id: Option<String>,
    out_tx: &mpsc::Sender<Message>,
    state: &Arc<SharedState>,
    build: F,
) where
    F: Fn(Option<String>) -> SignalingMessage,
{
    match client_id {
        Some(cid) => match state.client_socket(session_id, &cid) {
            Some(client) => send(&client, &build(Some(cid))).await,
            None => {
                send(
                    out_tx,
                    &SignalingMessage::error(Some(session_id.to_string()), SignalingError::SessionNotFound.to_string()),
                )
                .await
            }
        },
        None => {
            let sockets = state.all_client_sockets(session_id);
            if sockets.is_empty() {
                send(
                    out_tx,
                    &SignalingMessage::error(Some(session_id.to_string()), SignalingError::SessionNotFound.to_string()),
                )
                .await;
                return;
            }
            for client in sockets {
                send(&client, &build(None)).await;
            }
        }
    }
}

async fn handle_ice_candidate(
    session_id: String,
    client_id: Option<String>,
    candidate: IceCandidateInit,
    connection_id: &str,
    out_tx: &mpsc::Sender<Message>,
    state: &Arc<SharedState>,
) {
    state.touch(&session_id);
    // Determine which side sent this by checking whether this connection
    // is the registered host for the session.
    let sender_is_host = state
        .host_socket(&session_id)
        .map(|h| h.same_channel(out_tx))
        .unwrap_or(false);

    if sender_is_host {
        deliver_to_clients(
            &session_id,
            client_id,
            out_tx,
            state,
            |cid| CandidateReceived {
                session_id: session_id.clone(),
                client_id: cid,
                candidate: candidate.clone(),
            },
        )
        .await;
    } else {
        if let Some(ref cid) = client_id {
            state.queue_candidate(&session_id, cid, candidate.clone());
        }
        route_from_client_to_host(
            &session_id,
            out_tx,
            state,
            CandidateReceived {
                session_id,
                client_id,
                candidate,
            },
        )
        .await;
    }
    let _ = connection_id; // kept in signature for symmetry/future auditing hooks
}

async fn on_disconnect(connection_id: &str, state: &Arc<SharedState>) {
    let Some((session_id, role, client_id, empty)) = state.detach_connection(connection_id) else {
        return;
    };
    match role {
        Role::Host => {
            for client in state.all_client_sockets(&session_id) {
                send(
                    &client,
                    &SignalingMessage::PeerDisconnected {
                        session_id: session_id.clone(),
                        client_id: None,
                    },
                )
                .await;
            }
        }
        Role::Client => {
            if let Some(host) = state.host_socket(&session_id) {
                send(
                    &host,
                    &SignalingMessage::PeerDisconnected {
                        session_id: session_id.clone(),
                        client_id,
                    },
                )
                .await;
            }
        }
    }
    if empty {
        state.remove_session(&session_id);
    }
}

/// Periodic sweep: removes sessions inactive for longer than `ttl`.
pub async fn run_sweep(state: Arc<SharedState>, ttl: Duration, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        for session_id in state.expired_session_ids(ttl) {
            tracing::info!(session_id, "reaping inactive rendezvous session");
            state.remove_session(&session_id);
        }
    }
}
