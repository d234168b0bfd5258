//! Session & authentication state machine (spec.md §4.2).
//!
//! One [`SessionTable`] per host process, holding every client's lifecycle
//! from `Pending` through `Authenticated`/`Negotiating`/`Live` to
//! `Terminated`. Mirrors the rendezvous's own `SharedState` shape — one
//! coarse lock over a `HashMap`, with all mutation routed through methods
//! here so call sites never touch the map directly.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;

use thiserror::Error;
use vibe_coder_proto::{ids, token::{self, TokenPayload}, totp};

use crate::persist::{self, HostIdentity, PersistError};

/// Failures from the session/auth state machine that are genuine errors
/// rather than an expected outcome (contrast [`VerifyOutcome`], which
/// models TOTP verification's own result space).
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("session {0} not found")]
    SessionNotFound(String),
    #[error("host identity persistence failed: {0}")]
    Persist(#[from] PersistError),
    #[error("maximum concurrent sessions ({0}) reached")]
    TooManyConnections(usize),
}

const SESSION_TTL_SECS: i64 = 24 * 60 * 60;
const INACTIVITY_REAUTH_SECS: i64 = 30 * 60;
const MAX_RECONNECT_ATTEMPTS: u32 = 3;
const MAX_TOTP_ATTEMPTS: u32 = 4;
const MULTIPLE_CONNECTIONS_THRESHOLD: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Pending,
    Authenticated,
    Negotiating,
    Live,
    ReauthRequired,
    Terminated,
}

#[derive(Debug, Clone)]
pub struct SessionRecord {
    pub session_id: String,
    pub host_id: String,
    pub state: SessionState,
    pub bearer_token: Option<String>,
    pub token_expiry: Option<i64>,
    pub last_activity: i64,
    pub reconnect_attempts: u32,
    pub totp_failures: u32,
    pub suspicious: bool,
    pub multiple_connections: bool,
    pub peer_channels: HashSet<String>,
    pub created_at: i64,
    pub expires_at: i64,
}

impl SessionRecord {
    pub fn authenticated(&self) -> bool {
        matches!(
            self.state,
            SessionState::Authenticated | SessionState::Negotiating | SessionState::Live
        )
    }
}

/// Result of a TOTP verification attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyOutcome {
    Ok,
    BadCode,
    Unknown,
    Terminated,
}

/// The session table plus the host identity it authenticates against.
/// `identity` is behind its own lock since `renewHostId` replaces it
/// wholesale while sessions are cleared.
pub struct SessionTable {
    sessions: Mutex<HashMap<String, SessionRecord>>,
    identity: RwLock<HostIdentity>,
    workspace: String,
    totp_window: i64,
    max_connections: usize,
}

impl SessionTable {
    pub fn new(identity: HostIdentity, workspace: String, totp_window: i64, max_connections: usize) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            identity: RwLock::new(identity),
            workspace,
            totp_window,
            max_connections,
        }
    }

    pub fn host_id(&self) -> String {
        self.identity.read().host_id.clone()
    }

    pub fn totp_secret(&self) -> String {
        self.identity.read().totp_secret.clone()
    }

    /// createSession() — inserts a new Pending record, 24h expiry. Rejected
    /// once `max_connections` non-terminated sessions are already on file
    /// (spec.md §6 `VIBE_CODER_MAX_CONNECTIONS`).
    pub fn create_session(&self) -> Result<(String, String), AuthError> {
        let now = Utc::now().timestamp();
        let session_id = ids::generate_session_id();
        let host_id = self.host_id();
        let totp_secret = self.totp_secret();

        let mut sessions = self.sessions.lock();
        let active = sessions.values().filter(|r| r.state != SessionState::Terminated).count();
        if active >= self.max_connections {
            return Err(AuthError::TooManyConnections(self.max_connections));
        }

        let record = SessionRecord {
            session_id: session_id.clone(),
            host_id: host_id.clone(),
            state: SessionState::Pending,
            bearer_token: None,
            token_expiry: None,
            last_activity: now,
            reconnect_attempts: 0,
            totp_failures: 0,
            suspicious: false,
            multiple_connections: false,
            peer_channels: HashSet::new(),
            created_at: now,
            expires_at: now + SESSION_TTL_SECS,
        };
        sessions.insert(session_id.clone(), record);
        drop(sessions);
        Ok((session_id, totp_secret))
    }

    /// verifyTotp(sessionId, code) — ±window-step check against the host's
    /// single shared TOTP secret. Serialized per table lock, so no two
    /// concurrent verifications on the same session can both succeed.
    pub fn verify_totp(&self, session_id: &str, code: &str) -> VerifyOutcome {
        let now = Utc::now().timestamp();
        let secret = self.totp_secret();
        let mut table = self.sessions.lock();
        let Some(record) = table.get_mut(session_id) else {
            return VerifyOutcome::Unknown;
        };
        if record.state == SessionState::Terminated {
            return VerifyOutcome::Terminated;
        }

        let ok = totp::verify_code(&secret, code, now, self.totp_window).unwrap_or(false);
        if ok {
            record.state = SessionState::Authenticated;
            record.totp_failures = 0;
            record.last_activity = now;
            VerifyOutcome::Ok
        } else {
            record.totp_failures += 1;
            record.last_activity = now;
            if record.totp_failures > MAX_TOTP_ATTEMPTS - 1 {
                record.suspicious = true;
                record.state = SessionState::Terminated;
                return VerifyOutcome::Terminated;
            }
            VerifyOutcome::BadCode
        }
    }

    /// issueToken(sessionId) — only on Authenticated/Negotiating/Live
    /// sessions.
    pub fn issue_token(&self, session_id: &str) -> Option<String> {
        let mut table = self.sessions.lock();
        let record = table.get_mut(session_id)?;
        if !record.authenticated() {
            return None;
        }
        let payload = TokenPayload {
            session_id: record.session_id.clone(),
            host_id: record.host_id.clone(),
            exp: record.expires_at,
        };
        let secret = self.identity.read().session_secret.clone();
        let issued = token::issue(&payload, secret.as_bytes());
        record.bearer_token = Some(issued.clone());
        record.token_expiry = Some(record.expires_at);
        Some(issued)
    }

    /// verifyToken(token) — decode, check signature, confirm the session
    /// still exists, is authenticated, and unexpired.
    pub fn verify_token(&self, bearer: &str) -> Option<(String, String)> {
        let now = Utc::now().timestamp();
        let secret = self.identity.read().session_secret.clone();
        let payload = token::verify(bearer, secret.as_bytes(), now).ok()?;

        let mut table = self.sessions.lock();
        let record = table.get_mut(&payload.session_id)?;
        if !record.authenticated() {
            return None;
        }
        if record.bearer_token.as_deref() != Some(bearer) {
            return None;
        }
        record.last_activity = now;
        Some((payload.session_id, payload.host_id))
    }

    /// requiresReAuth(sessionId).
    pub fn requires_reauth(&self, session_id: &str) -> bool {
        let now = Utc::now().timestamp();
        let table = self.sessions.lock();
        let Some(record) = table.get(session_id) else {
            return true;
        };
        let inactive = now - record.last_activity > INACTIVITY_REAUTH_SECS;
        inactive || record.reconnect_attempts > MAX_RECONNECT_ATTEMPTS || record.suspicious
    }

    /// extendSession(sessionId, newToken) — atomically replace the bearer
    /// token and push expiry forward by another 24h.
    pub fn extend_session(&self, session_id: &str) -> Result<String, AuthError> {
        let now = Utc::now().timestamp();
        let mut table = self.sessions.lock();
        let record = table
            .get_mut(session_id)
            .ok_or_else(|| AuthError::SessionNotFound(session_id.to_string()))?;
        if !record.authenticated() {
            return Err(AuthError::SessionNotFound(session_id.to_string()));
        }
        record.expires_at = now + SESSION_TTL_SECS;
        drop(table);
        self.issue_token(session_id)
            .ok_or_else(|| AuthError::SessionNotFound(session_id.to_string()))
    }

    /// addPeerChannel(sessionId, connectionId). Third channel onward sets
    /// multipleConnections (SPEC_FULL.md resolves the spec's open question
    /// at three).
    pub fn add_peer_channel(&self, session_id: &str, connection_id: &str) -> bool {
        let now = Utc::now().timestamp();
        let mut table = self.sessions.lock();
        let Some(record) = table.get_mut(session_id) else {
            return false;
        };
        record.peer_channels.insert(connection_id.to_string());
        record.last_activity = now;
        if record.peer_channels.len() >= MULTIPLE_CONNECTIONS_THRESHOLD {
            record.multiple_connections = true;
        }
        record.state = SessionState::Negotiating;
        true
    }

    pub fn remove_peer_channel(&self, session_id: &str, connection_id: &str) {
        let mut table = self.sessions.lock();
        if let Some(record) = table.get_mut(session_id) {
            record.peer_channels.remove(connection_id);
        }
    }

    pub fn mark_connected(&self, session_id: &str) {
        let now = Utc::now().timestamp();
        let mut table = self.sessions.lock();
        if let Some(record) = table.get_mut(session_id) {
            record.state = SessionState::Live;
            record.last_activity = now;
        }
    }

    pub fn mark_disconnected(&self, session_id: &str) {
        let now = Utc::now().timestamp();
        let mut table = self.sessions.lock();
        if let Some(record) = table.get_mut(session_id) {
            if record.state == SessionState::Live {
                record.state = SessionState::Authenticated;
            }
            record.reconnect_attempts += 1;
            record.last_activity = now;
        }
    }

    pub fn increment_reconnect_attempts(&self, session_id: &str) {
        let mut table = self.sessions.lock();
        if let Some(record) = table.get_mut(session_id) {
            record.reconnect_attempts += 1;
        }
    }

    /// invalidateSession(sessionId) — irreversible.
    pub fn invalidate_session(&self, session_id: &str) {
        let mut table = self.sessions.lock();
        if let Some(record) = table.get_mut(session_id) {
            record.bearer_token = None;
            record.token_expiry = None;
            record.peer_channels.clear();
            record.state = SessionState::Terminated;
        }
    }

    pub fn get(&self, session_id: &str) -> Option<SessionRecord> {
        self.sessions.lock().get(session_id).cloned()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }

    /// renewHostId() — fresh identity, bulk-clears the session table.
    /// Fatal on persistence failure (spec.md §4.2): the caller should treat
    /// an `Err` as a failed, no-op rotation.
    pub fn renew_host_id(&self) -> Result<String, AuthError> {
        let fresh = persist::renew(&self.workspace)?;
        let host_id = fresh.host_id.clone();
        *self.identity.write() = fresh;
        self.sessions.lock().clear();
        Ok(host_id)
    }

    /// Session ids whose inactivity window has expired, for the periodic
    /// sweep to tear down peer channels / assistant sessions against.
    pub fn reauth_required_ids(&self) -> Vec<String> {
        let table = self.sessions.lock();
        let now = Utc::now().timestamp();
        table
            .values()
            .filter(|r| {
                r.state != SessionState::Terminated
                    && (now - r.last_activity > INACTIVITY_REAUTH_SECS
                        || r.reconnect_attempts > MAX_RECONNECT_ATTEMPTS
                        || r.suspicious)
            })
            .map(|r| r.session_id.clone())
            .collect()
    }
}

pub type SharedSessionTable = Arc<SessionTable>;

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> SessionTable {
        let identity = HostIdentity {
            host_id: "12345678".into(),
            totp_secret: totp::generate_secret(),
            session_secret: token::generate_session_secret(),
        };
        SessionTable::new(identity, "/tmp/does-not-matter".into(), 2, 16)
    }

    #[test]
    fn token_issues_only_after_totp_verification() {
        let t = table();
        let (sid, secret) = t.create_session().unwrap();
        assert!(t.issue_token(&sid).is_none());

        let code = totp::generate_code(&secret, Utc::now().timestamp()).unwrap();
        assert_eq!(t.verify_totp(&sid, &code), VerifyOutcome::Ok);

        let issued = t.issue_token(&sid).unwrap();
        let (verified_sid, _) = t.verify_token(&issued).unwrap();
        assert_eq!(verified_sid, sid);
    }

    #[test]
    fn four_failed_totp_attempts_terminate_the_session() {
        let t = table();
        let (sid, _secret) = t.create_session().unwrap();
        for _ in 0..3 {
            assert_eq!(t.verify_totp(&sid, "000000"), VerifyOutcome::BadCode);
        }
        assert_eq!(t.verify_totp(&sid, "000000"), VerifyOutcome::Terminated);
        assert!(t.requires_reauth(&sid));
    }

    #[test]
    fn fifth_attempt_with_the_correct_code_is_still_rejected() {
        let t = table();
        let (sid, secret) = t.create_session().unwrap();
        for _ in 0..4 {
            t.verify_totp(&sid, "000000");
        }
        let code = totp::generate_code(&secret, Utc::now().timestamp()).unwrap();
        assert_eq!(t.verify_totp(&sid, &code), VerifyOutcome::Terminated);
    }

    #[test]
    fn invalidated_session_never_verifies_again() {
        let t = table();
        let (sid, secret) = t.create_session().unwrap();
        let code = totp::generate_code(&secret, Utc::now().timestamp()).unwrap();
        t.verify_totp(&sid, &code);
        let issued = t.issue_token(&sid).unwrap();

        t.invalidate_session(&sid);
        assert!(t.verify_token(&issued).is_none());
    }

    #[test]
    fn third_peer_channel_trips_multiple_connections() {
        let t = table();
        let (sid, secret) = t.create_session().unwrap();
        let code = totp::generate_code(&secret, Utc::now().timestamp()).unwrap();
        t.verify_totp(&sid, &code);

        t.add_peer_channel(&sid, "c1");
        t.add_peer_channel(&sid, "c2");
        assert!(!t.get(&sid).unwrap().multiple_connections);
        t.add_peer_channel(&sid, "c3");
        assert!(t.get(&sid).unwrap().multiple_connections);
    }

    #[test]
    fn renew_host_id_clears_every_session() {
        let t = table();
        let (sid, secret) = t.create_session().unwrap();
        let code = totp::generate_code(&secret, Utc::now().timestamp()).unwrap();
        t.verify_totp(&sid, &code);
        let issued = t.issue_token(&sid).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let t = SessionTable::new(
            HostIdentity {
                host_id: "12345678".into(),
                totp_secret: totp::generate_secret(),
                session_secret: token::generate_session_secret(),
            },
            dir.path().to_str().unwrap().to_string(),
            2,
            16,
        );
        let (sid2, secret2) = t.create_session().unwrap();
        let code2 = totp::generate_code(&secret2, Utc::now().timestamp()).unwrap();
        t.verify_totp(&sid2, &code2);
        let issued2 = t.issue_token(&sid2).unwrap();

        let new_host_id = t.renew_host_id().unwrap();
        assert_ne!(new_host_id, "12345678");
        assert_eq!(t.session_count(), 0);
        assert!(t.verify_token(&issued2).is_none());
        let _ = (sid, issued);
    }

    #[test]
    fn unknown_session_id_is_absent_not_a_panic() {
        let t = table();
        assert_eq!(t.verify_totp("NOPE0000", "123456"), VerifyOutcome::Unknown);
        assert!(t.issue_token("NOPE0000").is_none());
        assert!(t.requires_reauth("NOPE0000"));
    }

    #[test]
    fn create_session_is_rejected_once_the_cap_is_reached() {
        let identity = HostIdentity {
            host_id: "12345678".into(),
            totp_secret: totp::generate_secret(),
            session_secret: token::generate_session_secret(),
        };
        let t = SessionTable::new(identity, "/tmp/does-not-matter".into(), 2, 2);
        t.create_session().unwrap();
        t.create_session().unwrap();
        assert!(matches!(
            t.create_session(),
            Err(AuthError::TooManyConnections(2))
        ));
    }

    #[test]
    fn a_terminated_session_frees_up_a_connection_slot() {
        let identity = HostIdentity {
            host_id: "12345678".into(),
            totp_secret: totp::generate_secret(),
            session_secret: token::generate_session_secret(),
        };
        let t = SessionTable::new(identity, "/tmp/does-not-matter".into(), 2, 1);
        let (sid, _secret) = t.create_session().unwrap();
        assert!(t.create_session().is_err());

        for _ in 0..4 {
            t.verify_totp(&sid, "000000");
        }
        assert!(t.create_session().is_ok());
    }
}
