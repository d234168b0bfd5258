//! Rendezvous session table — the only shared-mutable structure in this
//! process. One coarse lock guards the whole table (spec.md §5 permits
//! either a per-session lock or one lock for the table, "provided routing
//! inside a session is serialized").

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;

use axum::extract::ws::Message;
use thiserror::Error;
use tokio::sync::mpsc;
use vibe_coder_proto::{IceCandidateInit, SessionDescription};

/// Routing failures surfaced back to the socket that triggered them, as the
/// `error` field of a [`vibe_coder_proto::SignalingMessage::Error`] frame.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SignalingError {
    #[error("Host not available")]
    HostUnavailable,
    #[error("Session not found")]
    SessionNotFound,
    #[error("offer requires clientId")]
    OfferMissingClientId,
    #[error("unexpected message type for this direction")]
    UnexpectedDirection,
}

/// Which side of a session a connected socket plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Host,
    Client,
}

/// Channel to the task that owns a connected WebSocket's write half.
pub type SocketHandle = mpsc::Sender<Message>;

pub struct RendezvousSession {
    pub session_id: String,
    pub host_socket: Option<SocketHandle>,
    /// client_id -> socket
    pub client_sockets: HashMap<String, SocketHandle>,
    /// client_id -> last offer received from that client, awaiting an answer.
    pub pending_offer: HashMap<String, SessionDescription>,
    pub pending_answer: Option<SessionDescription>,
    /// client_id -> ICE candidates queued before the peer on the other side
    /// has joined.
    pub pending_candidates: HashMap<String, Vec<IceCandidateInit>>,
    pub created_at: Instant,
    pub last_activity: Instant,
}

impl RendezvousSession {
    fn new(session_id: String) -> Self {
        let now = Instant::now();
        Self {
            session_id,
            host_socket: None,
            client_sockets: HashMap::new(),
            pending_offer: HashMap::new(),
            pending_answer: None,
            pending_candidates: HashMap::new(),
            created_at: now,
            last_activity: now,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.host_socket.is_none() && self.client_sockets.is_empty()
    }

    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }
}

/// Where a connected socket lives, so a disconnect can be resolved in O(1)
/// instead of scanning every session.
#[derive(Clone)]
struct SocketLocation {
    session_id: String,
    role: Role,
    /// Present only for `Role::Client`.
    client_id: Option<String>,
}

#[derive(Default)]
pub struct SharedState {
    sessions: Mutex<HashMap<String, RendezvousSession>>,
    sockets: Mutex<HashMap<String, SocketLocation>>,
}

impl SharedState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `socket` as the host endpoint for `session_id`, creating
    /// the session if it doesn't exist yet.
    pub fn register_host(&self, session_id: &str, connection_id: &str, socket: SocketHandle) {
        let mut sessions = self.sessions.lock().unwrap();
        let session = sessions
            .entry(session_id.to_string())
            .or_insert_with(|| RendezvousSession::new(session_id.to_string()));
        session.host_socket = Some(socket);
        session.touch();
        drop(sessions);
        self.sockets.lock().unwrap().insert(
            connection_id.to_string(),
            SocketLocation {
                session_id: session_id.to_string(),
                role: Role::Host,
                client_id: None,
            },
        );
    }

    /// Add `socket` as a client of `session_id`, creating the session
    /// lazily if needed.
    pub fn join_session(
        &self,
        session_id: &str,
        client_id: &str,
        connection_id: &str,
        socket: SocketHandle,
    ) {
        let mut sessions = self.sessions.lock().unwrap();
        let session = sessions
            .entry(session_id.to_string())
            .or_insert_with(|| RendezvousSession::new(session_id.to_string()));
        session.client_sockets.insert(client_id.to_string(), socket);
        session.touch();
        drop(sessions);
        self.sockets.lock().unwrap().insert(
            connection_id.to_string(),
            SocketLocation {
                session_id: session_id.to_string(),
                role: Role::Client,
                client_id: Some(client_id.to_string()),
            },
        );
    }

    pub fn touch(&self, session_id: &str) {
        if let Some(session) = self.sessions.lock().unwrap().get_mut(session_id) {
            session.touch();
        }
    }

    pub fn host_socket(&self, session_id: &str) -> Option<SocketHandle> {
        self.sessions
            .lock()
            .unwrap()
            .get(session_id)
            .and_then(|s| s.host_socket.clone())
    }

    pub fn client_socket(&self, session_id: &str, client_id: &str) -> Option<SocketHandle> {
        self.sessions
            .lock()
            .unwrap()
            .get(session_id)
            .and_then(|s| s.client_sockets.get(client_id).cloned())
    }

    pub fn all_client_sockets(&self, session_id: &str) -> Vec<SocketHandle> {
        self.sessions
            .lock()
            .unwrap()
            .get(session_id)
            .map(|s| s.client_sockets.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn client_ids(&self, session_id: &str) -> Vec<String> {
        self.sessions
            .lock()
            .unwrap()
            .get(session_id)
            .map(|s| s.client_sockets.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn record_offer(&self, session_id: &str, client_id: &str, offer: SessionDescription) {
        if let Some(session) = self.sessions.lock().unwrap().get_mut(session_id) {
            session.pending_offer.insert(client_id.to_string(), offer);
            session.touch();
        }
    }

    pub fn record_answer(&self, session_id: &str, answer: SessionDescription) {
        if let Some(session) = self.sessions.lock().unwrap().get_mut(session_id) {
            session.pending_answer = Some(answer);
            session.touch();
        }
    }

    pub fn queue_candidate(&self, session_id: &str, client_id: &str, candidate: IceCandidateInit) {
        if let Some(session) = self.sessions.lock().unwrap().get_mut(session_id) {
            session
                .pending_candidates
                .entry(client_id.to_string())
                .or_default()
                .push(candidate);
            session.touch();
        }
    }

    /// Remove a client from a session. Returns true if the session is now
    /// empty (caller should drop it).
    pub fn leave_session(&self, session_id: &str, client_id: &str) -> bool {
        let mut sessions = self.sessions.lock().unwrap();
        let Some(session) = sessions.get_mut(session_id) else {
            return false;
        };
        session.client_sockets.remove(client_id);
        session.pending_offer.remove(client_id);
        session.pending_candidates.remove(client_id);
        let empty = session.is_empty();
        if empty {
            sessions.remove(session_id);
        }
        empty
    }

    /// Detach whatever socket `connection_id` was playing. Returns the
    /// session id and role it occupied, and whether the session is now
    /// empty, so the caller can notify the remaining peer and sweep the
    /// session if needed.
    pub fn detach_connection(&self, connection_id: &str) -> Option<(String, Role, Option<String>, bool)> {
        let location = self.sockets.lock().unwrap().remove(connection_id)?;
        let mut sessions = self.sessions.lock().unwrap();
        let Some(session) = sessions.get_mut(&location.session_id) else {
            return Some((location.session_id, location.role, location.client_id, true));
        };
        match location.role {
            Role::Host => session.host_socket = None,
            Role::Client => {
                if let Some(ref cid) = location.client_id {
                    session.client_sockets.remove(cid);
                    session.pending_offer.remove(cid);
                    session.pending_candidates.remove(cid);
                }
            }
        }
        let empty = session.is_empty();
        if empty {
            sessions.remove(&location.session_id);
        }
        Some((location.session_id, location.role, location.client_id, empty))
    }

    /// Snapshot of session ids whose `last_activity` is older than `ttl`,
    /// for the periodic reaper to sweep one at a time.
    pub fn expired_session_ids(&self, ttl: std::time::Duration) -> Vec<String> {
        self.sessions
            .lock()
            .unwrap()
            .values()
            .filter(|s| s.last_activity.elapsed() > ttl)
            .map(|s| s.session_id.clone())
            .collect()
    }

    pub fn remove_session(&self, session_id: &str) {
        self.sessions.lock().unwrap().remove(session_id);
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn socket() -> SocketHandle {
        mpsc::channel(4).0
    }

    #[test]
    fn register_host_then_join_creates_one_session() {
        let state = SharedState::new();
        state.register_host("S1", "conn-host", socket());
        state.join_session("S1", "C1", "conn-client", socket());
        assert_eq!(state.session_count(), 1);
        assert_eq!(state.client_ids("S1"), vec!["C1".to_string()]);
    }

    #[test]
    fn detach_both_sides_removes_empty_session() {
        let state = SharedState::new();
        state.register_host("S1", "conn-host", socket());
        state.join_session("S1", "C1", "conn-client", socket());
        let (_, role, _, empty) = state.detach_connection("conn-host").unwrap();
        assert_eq!(role, Role::Host);
        assert!(!empty, "client is still present");
        let (_, role, _, empty) = state.detach_connection("conn-client").unwrap();
        assert_eq!(role, Role::Client);
        assert!(empty);
        assert_eq!(state.session_count(), 0);
    }

    #[test]
    fn expired_sessions_are_listed_by_sweep() {
        let state = SharedState::new();
        state.register_host("S1", "conn-host", socket());
        let expired = state.expired_session_ids(std::time::Duration::from_secs(0));
        assert_eq!(expired, vec!["S1".to_string()]);
    }
}
