//! Peer-channel bridge (spec.md §4.3): one real WebRTC peer connection per
//! authenticated session, its data channel wired to a supervised assistant
//! process.
//!
//! Grounded in the reconnect/session bookkeeping shape of the pack's own
//! `WebRtcServerCore` (peers/sessions maps behind `RwLock`, event channel
//! for notifications) but built directly against the `webrtc` crate's real
//! `RTCPeerConnection` rather than that retrieval's FFI-facing wrapper,
//! since here the host agent *is* the WebRTC endpoint, not a binding over
//! one.

pub mod assistant;
pub mod signaling_client;

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use thiserror::Error;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_message::DataChannelMessage as RtcDataChannelMessage;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

use vibe_coder_proto::{ids, safety, DataChannelMessage, IceCandidateInit, SessionDescription};

use crate::config::{AssistantMode, HostConfig};
use crate::session::SharedSessionTable;
use assistant::{AssistantError, AssistantSession};
use signaling_client::SignalingClient;

const PEER_CHANNEL_IDLE_SECS: i64 = 5 * 60;
const ASSISTANT_IDLE_SECS: i64 = 30 * 60;

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("session {0} is not authenticated")]
    NotAuthenticated(String),
    #[error("peer connection error: {0}")]
    PeerConnection(String),
    #[error("no such peer channel: {0}")]
    NoSuchChannel(String),
    #[error("assistant error: {0}")]
    Assistant(#[from] AssistantError),
}

struct PeerChannel {
    connection_id: String,
    session_id: String,
    pc: Arc<RTCPeerConnection>,
    data_channel: Mutex<Option<Arc<RTCDataChannel>>>,
    last_activity: AtomicI64,
}

impl PeerChannel {
    fn touch(&self) {
        self.last_activity.store(Utc::now().timestamp(), Ordering::SeqCst);
    }

    fn idle_for(&self) -> i64 {
        Utc::now().timestamp() - self.last_activity.load(Ordering::SeqCst)
    }
}

/// Shared bridge state: every live peer channel and assistant session,
/// plus the pieces needed to build new peer connections and push
/// signaling frames back out.
pub struct Bridge {
    config: Arc<HostConfig>,
    sessions: SharedSessionTable,
    signaling: SignalingClient,
    peers: Mutex<HashMap<String, Arc<PeerChannel>>>,
    /// Latest peer channel opened for a given session — signaling frames
    /// arriving after the initial offer carry sessionId/clientId, not the
    /// connectionId the bridge keys peer channels by internally.
    session_to_connection: Mutex<HashMap<String, String>>,
    assistants: Mutex<HashMap<String, Arc<AssistantSession>>>,
}

impl Bridge {
    pub fn new(config: Arc<HostConfig>, sessions: SharedSessionTable, signaling: SignalingClient) -> Arc<Self> {
        Arc::new(Self {
            config,
            sessions,
            signaling,
            peers: Mutex::new(HashMap::new()),
            session_to_connection: Mutex::new(HashMap::new()),
            assistants: Mutex::new(HashMap::new()),
        })
    }

    async fn build_peer_connection(&self) -> Result<Arc<RTCPeerConnection>, BridgeError> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| BridgeError::PeerConnection(e.to_string()))?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .map_err(|e| BridgeError::PeerConnection(e.to_string()))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let mut ice_servers = vec![RTCIceServer {
            urls: self.config.stun_server_list(),
            ..Default::default()
        }];
        let turn_urls = self.config.turn_server_list();
        if !turn_urls.is_empty() {
            ice_servers.push(RTCIceServer {
                urls: turn_urls,
                ..Default::default()
            });
        }

        let rtc_config = RTCConfiguration {
            ice_servers,
            ..Default::default()
        };

        let pc = api
            .new_peer_connection(rtc_config)
            .await
            .map_err(|e| BridgeError::PeerConnection(e.to_string()))?;
        Ok(Arc::new(pc))
    }

    /// **offer**: client is the ICE initiator. Locate or create the peer
    /// for `session_id`, set the remote description, answer, and wire the
    /// data channel the client is expected to open.
    pub async fn handle_offer(
        self: &Arc<Self>,
        session_id: &str,
        client_id: Option<String>,
        offer: SessionDescription,
    ) -> Result<SessionDescription, BridgeError> {
        let record = self.sessions.get(session_id).ok_or_else(|| BridgeError::NotAuthenticated(session_id.to_string()))?;
        if !record.authenticated() {
            return Err(BridgeError::NotAuthenticated(session_id.to_string()));
        }

        let pc = self.build_peer_connection().await?;
        let connection_id = ids::generate_connection_id();

        let channel = Arc::new(PeerChannel {
            connection_id: connection_id.clone(),
            session_id: session_id.to_string(),
            pc: Arc::clone(&pc),
            data_channel: Mutex::new(None),
            last_activity: AtomicI64::new(Utc::now().timestamp()),
        });
        self.peers.lock().insert(connection_id.clone(), Arc::clone(&channel));
        self.session_to_connection.lock().insert(session_id.to_string(), connection_id.clone());
        self.sessions.add_peer_channel(session_id, &connection_id);

        self.wire_peer_connection_callbacks(Arc::clone(&channel), client_id.clone());

        let remote_desc = RTCSessionDescription::offer(offer.sdp)
            .map_err(|e| BridgeError::PeerConnection(e.to_string()))?;
        pc.set_remote_description(remote_desc)
            .await
            .map_err(|e| BridgeError::PeerConnection(e.to_string()))?;

        let answer = pc
            .create_answer(None)
            .await
            .map_err(|e| BridgeError::PeerConnection(e.to_string()))?;
        pc.set_local_description(answer.clone())
            .await
            .map_err(|e| BridgeError::PeerConnection(e.to_string()))?;

        Ok(SessionDescription {
            sdp: answer.sdp,
            kind: "answer".to_string(),
        })
    }

    /// **answer** (host-as-initiator symmetric case): apply the remote
    /// description to an existing peer connection.
    pub async fn handle_answer(
        &self,
        connection_id: &str,
        answer: SessionDescription,
    ) -> Result<(), BridgeError> {
        let channel = self.get_channel(connection_id)?;
        let remote_desc = RTCSessionDescription::answer(answer.sdp)
            .map_err(|e| BridgeError::PeerConnection(e.to_string()))?;
        channel
            .pc
            .set_remote_description(remote_desc)
            .await
            .map_err(|e| BridgeError::PeerConnection(e.to_string()))?;
        Ok(())
    }

    /// **ice-candidate**: `webrtc-rs` queues candidates added before a
    /// remote description is set and applies them once it is, so
    /// out-of-order arrival needs no manual buffering here.
    pub async fn handle_ice_candidate(
        &self,
        connection_id: &str,
        candidate: IceCandidateInit,
    ) -> Result<(), BridgeError> {
        let channel = self.get_channel(connection_id)?;
        channel.touch();
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_m_line_index,
            ..Default::default()
        };
        channel
            .pc
            .add_ice_candidate(init)
            .await
            .map_err(|e| BridgeError::PeerConnection(e.to_string()))
    }

    pub fn connection_id_for_session(&self, session_id: &str) -> Option<String> {
        self.session_to_connection.lock().get(session_id).cloned()
    }

    fn get_channel(&self, connection_id: &str) -> Result<Arc<PeerChannel>, BridgeError> {
        self.peers
            .lock()
            .get(connection_id)
            .cloned()
            .ok_or_else(|| BridgeError::NoSuchChannel(connection_id.to_string()))
    }

    fn wire_peer_connection_callbacks(self: &Arc<Self>, channel: Arc<PeerChannel>, client_id: Option<String>) {
        let bridge = Arc::clone(self);
        let signaling_channel = Arc::clone(&channel);
        channel.pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let bridge = Arc::clone(&bridge);
            let channel = Arc::clone(&signaling_channel);
            let client_id = client_id.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else { return };
                if let Ok(init) = candidate.to_json() {
                    bridge.signaling.send(vibe_coder_proto::SignalingMessage::IceCandidate {
                        session_id: channel.session_id.clone(),
                        client_id,
                        candidate: IceCandidateInit {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_m_line_index: init.sdp_mline_index,
                        },
                    });
                }
            })
        }));

        let bridge = Arc::clone(self);
        let dc_channel = Arc::clone(&channel);
        channel.pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
            let bridge = Arc::clone(&bridge);
            let channel = Arc::clone(&dc_channel);
            Box::pin(async move {
                *channel.data_channel.lock() = Some(Arc::clone(&dc));
                bridge.wire_data_channel(channel, dc);
            })
        }));
    }

    fn wire_data_channel(self: &Arc<Self>, channel: Arc<PeerChannel>, dc: Arc<RTCDataChannel>) {
        let bridge = Arc::clone(self);
        let on_message_channel = Arc::clone(&channel);
        let on_message_dc = Arc::clone(&dc);
        dc.on_message(Box::new(move |msg: RtcDataChannelMessage| {
            let bridge = Arc::clone(&bridge);
            let channel = Arc::clone(&on_message_channel);
            let dc = Arc::clone(&on_message_dc);
            Box::pin(async move {
                channel.touch();
                let Ok(text) = String::from_utf8(msg.data.to_vec()) else {
                    tracing::warn!("dropped non-utf8 data channel frame");
                    return;
                };
                let parsed: Result<DataChannelMessage, _> = serde_json::from_str(&text);
                match parsed {
                    Ok(message) => bridge.handle_data_channel_message(&channel, &dc, message).await,
                    Err(e) => {
                        tracing::warn!("malformed data channel frame: {e}");
                        send_frame(&dc, &DataChannelMessage::Error {
                            message: "malformed frame".to_string(),
                            code: Some("parse-error".to_string()),
                        })
                        .await;
                    }
                }
            })
        }));
    }

    async fn handle_data_channel_message(
        self: &Arc<Self>,
        channel: &Arc<PeerChannel>,
        dc: &Arc<RTCDataChannel>,
        message: DataChannelMessage,
    ) {
        // §4.3: a data channel is only used once its readyState is "open" —
        // `send_frame` below no-ops with a logged warning otherwise.
        match message {
            DataChannelMessage::Ping { .. } => {
                send_frame(dc, &DataChannelMessage::Pong { timestamp: Utc::now().timestamp() }).await;
            }
            DataChannelMessage::ClaudeCommand { command } => {
                if let Err(rejection) = safety::check_command(&command) {
                    send_frame(dc, &DataChannelMessage::Error {
                        message: rejection.reason(),
                        code: Some("safety-filter".to_string()),
                    })
                    .await;
                    return;
                }
                self.run_claude_command(channel, dc, &command).await;
            }
            DataChannelMessage::Response { text } => {
                if let Some(assistant) = self.get_assistant(&channel.session_id) {
                    if let Err(e) = assistant.write_raw(&format!("{text}\n")) {
                        send_frame(dc, &DataChannelMessage::Error {
                            message: e.to_string(),
                            code: Some("assistant-write-failed".to_string()),
                        })
                        .await;
                    }
                }
            }
            DataChannelMessage::KeyInput { data } => {
                if let Some(assistant) = self.get_assistant(&channel.session_id) {
                    let _ = assistant.write_raw(&data);
                }
            }
            DataChannelMessage::Pong { .. }
            | DataChannelMessage::Output { .. }
            | DataChannelMessage::Completed { .. }
            | DataChannelMessage::Error { .. } => {
                // Host-to-client-only variants; ignore if a misbehaving
                // client echoes one back.
            }
        }
    }

    async fn run_claude_command(self: &Arc<Self>, channel: &Arc<PeerChannel>, dc: &Arc<RTCDataChannel>, command: &str) {
        let assistant = match self.get_or_create_assistant(&channel.session_id).await {
            Ok(a) => a,
            Err(e) => {
                send_frame(dc, &DataChannelMessage::Error {
                    message: e.to_string(),
                    code: Some("assistant-spawn-failed".to_string()),
                })
                .await;
                return;
            }
        };

        if command.trim() == "/exit" {
            assistant.exit().await;
            self.assistants.lock().remove(&self.assistant_key(&channel.session_id));
            send_frame(dc, &DataChannelMessage::Completed { timestamp: Utc::now().timestamp() }).await;
            return;
        }

        let timeout = std::time::Duration::from_secs(self.config.command_timeout_secs);
        match assistant.run_command(command, timeout).await {
            Ok(chunks) => {
                for chunk in chunks {
                    send_frame(dc, &DataChannelMessage::Output { chunk }).await;
                }
                send_frame(dc, &DataChannelMessage::Completed { timestamp: Utc::now().timestamp() }).await;
            }
            Err(AssistantError::Busy) => {
                send_frame(dc, &DataChannelMessage::Error {
                    message: AssistantError::Busy.to_string(),
                    code: Some("conflict".to_string()),
                })
                .await;
            }
            Err(e) => {
                send_frame(dc, &DataChannelMessage::Error {
                    message: e.to_string(),
                    code: Some("assistant-run-failed".to_string()),
                })
                .await;
            }
        }
    }

    fn assistant_key(&self, session_id: &str) -> String {
        match self.config.assistant_mode {
            AssistantMode::PerSession => session_id.to_string(),
            AssistantMode::Singleton => "singleton".to_string(),
        }
    }

    fn get_assistant(&self, session_id: &str) -> Option<Arc<AssistantSession>> {
        self.assistants.lock().get(&self.assistant_key(session_id)).cloned()
    }

    pub fn has_assistant(&self, session_id: &str) -> bool {
        self.get_assistant(session_id).is_some()
    }

    /// Looks up the session's live assistant, if any, so a caller can
    /// request cancellation of whatever command it is currently running.
    /// Used by the admin `/api/claude/cancel` handler (spec.md §6/§7).
    pub fn find_assistant(&self, session_id: &str) -> Option<Arc<AssistantSession>> {
        self.get_assistant(session_id)
    }

    /// Public entry point for the HTTP fallback (spec.md §6
    /// `/api/claude/execute`) — same lazy-spawn path the data channel uses.
    pub async fn get_or_create_assistant_public(&self, session_id: &str) -> Result<Arc<AssistantSession>, BridgeError> {
        self.get_or_create_assistant(session_id).await
    }

    async fn get_or_create_assistant(&self, session_id: &str) -> Result<Arc<AssistantSession>, BridgeError> {
        let key = self.assistant_key(session_id);
        if let Some(existing) = self.assistants.lock().get(&key).cloned() {
            if !existing.is_destroyed() {
                return Ok(existing);
            }
        }
        let spawned = AssistantSession::spawn(session_id.to_string(), &self.config.assistant_bin, &self.config.workspace_path).await?;
        let spawned = Arc::new(spawned);
        self.assistants.lock().insert(key, Arc::clone(&spawned));
        Ok(spawned)
    }

    /// Periodic sweep: peer channels idle >5min, assistant sessions idle
    /// >30min (spec.md §4.3 "Cleanup").
    pub async fn sweep(&self) {
        let stale_peers: Vec<String> = self
            .peers
            .lock()
            .values()
            .filter(|c| c.idle_for() > PEER_CHANNEL_IDLE_SECS)
            .map(|c| c.connection_id.clone())
            .collect();
        for connection_id in stale_peers {
            if let Some(channel) = self.peers.lock().remove(&connection_id) {
                self.sessions.remove_peer_channel(&channel.session_id, &connection_id);
                self.session_to_connection.lock().remove(&channel.session_id);
                let _ = channel.pc.close().await;
            }
        }

        let stale_assistants: Vec<String> = self
            .assistants
            .lock()
            .iter()
            .filter(|(_, a)| a.idle_for() > ASSISTANT_IDLE_SECS)
            .map(|(k, _)| k.clone())
            .collect();
        for key in stale_assistants {
            if let Some(assistant) = self.assistants.lock().remove(&key) {
                assistant.exit().await;
            }
        }
    }

    pub fn peer_channel_count(&self) -> usize {
        self.peers.lock().len()
    }

    pub fn assistant_session_count(&self) -> usize {
        self.assistants.lock().len()
    }

    /// Push a frame out over the rendezvous connection. Used by the host's
    /// signaling dispatch loop to answer offers and relay auth outcomes.
    pub fn send_signaling(&self, msg: vibe_coder_proto::SignalingMessage) {
        self.signaling.send(msg);
    }

    /// Graceful-shutdown step two and three (spec.md §5): close every live
    /// peer channel and assistant session. Called once the admin listener
    /// has stopped accepting new connections.
    pub async fn shutdown(&self) {
        let peers: Vec<Arc<PeerChannel>> = self.peers.lock().drain().map(|(_, c)| c).collect();
        for channel in peers {
            let _ = channel.pc.close().await;
        }
        self.session_to_connection.lock().clear();

        let assistants: Vec<Arc<AssistantSession>> =
            self.assistants.lock().drain().map(|(_, a)| a).collect();
        for assistant in assistants {
            assistant.exit().await;
        }
    }
}

/// Send a frame only if the channel is open; drop with a logged warning
/// otherwise (spec.md §4.3 key invariant).
async fn send_frame(dc: &Arc<RTCDataChannel>, message: &DataChannelMessage) {
    use webrtc::data_channel::data_channel_state::RTCDataChannelState;
    if dc.ready_state() != RTCDataChannelState::Open {
        tracing::warn!("dropped outbound frame: data channel not open");
        return;
    }
    let json = serde_json::to_string(message).expect("DataChannelMessage always serializes");
    if let Err(e) = dc.send_text(json).await {
        tracing::warn!("data channel send failed: {e}");
    }
}
