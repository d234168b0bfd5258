//! Wire schema for the two JSON message surfaces in this system:
//!
//! - [`SignalingMessage`] — frames exchanged over the rendezvous WebSocket
//!   between host, client, and rendezvous (offer/answer/ICE/TOTP/routing).
//! - [`DataChannelMessage`] — frames exchanged over the peer data channel
//!   once it is open, carrying assistant commands and output.
//!
//! Both are internally tagged on `type` so an unknown tag fails to parse
//! instead of being silently ignored — replacing the reference's dynamic
//! JSON dispatch with a sum type validated at parse time.

use serde::{Deserialize, Serialize};

/// An ICE candidate as handed to/from the browser peer stack.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidateInit {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_m_line_index: Option<u16>,
}

/// A session description (offer or answer).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionDescription {
    pub sdp: String,
    #[serde(rename = "type")]
    pub kind: String,
}

/// One frame on the rendezvous WebSocket, in either direction.
///
/// `sessionId` is required on every inbound variant; rendezvous-generated
/// outbound variants fill it from the `RendezvousSession` they're routed
/// through.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum SignalingMessage {
    /// Host → rendezvous: claim the host slot for a session.
    RegisterHost { session_id: String },
    /// Client → rendezvous: join an existing (or not-yet-existing) session.
    JoinSession {
        session_id: String,
        client_id: String,
    },
    /// Client → rendezvous → host: TOTP challenge response.
    VerifyTotp {
        session_id: String,
        client_id: Option<String>,
        totp_code: String,
    },
    /// Either side → rendezvous → other side: SDP offer.
    Offer {
        session_id: String,
        client_id: Option<String>,
        offer: SessionDescription,
    },
    /// Either side → rendezvous → other side: SDP answer.
    Answer {
        session_id: String,
        client_id: Option<String>,
        answer: SessionDescription,
    },
    /// Either side → rendezvous → other side: one ICE candidate.
    IceCandidate {
        session_id: String,
        client_id: Option<String>,
        candidate: IceCandidateInit,
    },
    /// Client → rendezvous: detach from a session.
    LeaveSession {
        session_id: String,
        client_id: String,
    },
    /// Either side → rendezvous: liveness probe.
    Heartbeat {
        session_id: String,
        client_id: Option<String>,
        timestamp: i64,
    },

    // ── Rendezvous → host/client notifications ──────────────────────
    SessionCreated { session_id: String },
    SessionJoined {
        session_id: String,
        client_id: String,
    },
    SessionLeft {
        session_id: String,
        client_id: String,
    },
    OfferReceived {
        session_id: String,
        client_id: String,
        offer: SessionDescription,
    },
    AnswerReceived {
        session_id: String,
        client_id: Option<String>,
        answer: SessionDescription,
    },
    CandidateReceived {
        session_id: String,
        client_id: Option<String>,
        candidate: IceCandidateInit,
    },
    PeerConnected {
        session_id: String,
        client_id: Option<String>,
    },
    PeerDisconnected {
        session_id: String,
        client_id: Option<String>,
    },
    AuthSuccess { session_id: String },
    HeartbeatAck {
        session_id: String,
        timestamp: i64,
    },
    /// A routing or protocol failure. `session_id` is best-effort — absent
    /// when the envelope itself couldn't be parsed far enough to find one.
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        error: String,
    },
}

impl SignalingMessage {
    pub fn session_id(&self) -> Option<&str> {
        use SignalingMessage::*;
        match self {
            RegisterHost { session_id }
            | JoinSession { session_id, .. }
            | VerifyTotp { session_id, .. }
            | Offer { session_id, .. }
            | Answer { session_id, .. }
            | IceCandidate { session_id, .. }
            | LeaveSession { session_id, .. }
            | Heartbeat { session_id, .. }
            | SessionCreated { session_id }
            | SessionJoined { session_id, .. }
            | SessionLeft { session_id, .. }
            | OfferReceived { session_id, .. }
            | AnswerReceived { session_id, .. }
            | CandidateReceived { session_id, .. }
            | PeerConnected { session_id, .. }
            | PeerDisconnected { session_id, .. }
            | AuthSuccess { session_id }
            | HeartbeatAck { session_id, .. } => Some(session_id),
            Error { session_id, .. } => session_id.as_deref(),
        }
    }

    pub fn error(session_id: Option<String>, message: impl Into<String>) -> Self {
        SignalingMessage::Error {
            session_id,
            error: message.into(),
        }
    }
}

/// One frame on the open peer data channel, in either direction.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum DataChannelMessage {
    /// Client → host: liveness probe.
    Ping { timestamp: i64 },
    /// Host → client: reply to [`DataChannelMessage::Ping`].
    Pong { timestamp: i64 },
    /// Client → host: run a command against the assistant.
    ClaudeCommand { command: String },
    /// Client → host: user input answering an assistant prompt.
    Response { text: String },
    /// Client → host: raw keystrokes forwarded to the assistant's pty.
    KeyInput { data: String },
    /// Host → client: a chunk of assistant stdout/stderr.
    Output { chunk: String },
    /// Host → client: the current command finished.
    Completed { timestamp: i64 },
    /// Host → client: an error occurred processing the last inbound frame.
    Error {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<String>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signaling_message_round_trips_through_json() {
        let msg = SignalingMessage::VerifyTotp {
            session_id: "ABCD1234".into(),
            client_id: None,
            totp_code: "123456".into(),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"verify-totp\""));
        let back: SignalingMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn unknown_type_is_rejected_at_parse_time() {
        let raw = r#"{"type":"not-a-real-type","sessionId":"X"}"#;
        assert!(serde_json::from_str::<SignalingMessage>(raw).is_err());
    }

    #[test]
    fn session_id_accessor_covers_every_variant() {
        let msg = SignalingMessage::Heartbeat {
            session_id: "S1".into(),
            client_id: Some("C1".into()),
            timestamp: 42,
        };
        assert_eq!(msg.session_id(), Some("S1"));
    }

    #[test]
    fn data_channel_ping_round_trips() {
        let msg = DataChannelMessage::Ping { timestamp: 7 };
        let json = serde_json::to_string(&msg).unwrap();
        let back: DataChannelMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn signaling_message_fields_are_camel_case_on_the_wire() {
        let msg = SignalingMessage::VerifyTotp {
            session_id: "ABCD1234".into(),
            client_id: Some("C1".into()),
            totp_code: "123456".into(),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"sessionId\":\"ABCD1234\""));
        assert!(json.contains("\"clientId\":\"C1\""));
        assert!(json.contains("\"totpCode\":\"123456\""));
        assert!(!json.contains("session_id"));
    }

    #[test]
    fn ice_candidate_init_fields_are_camel_case_on_the_wire() {
        let candidate = IceCandidateInit {
            candidate: "candidate:1 1 UDP 1 0.0.0.0 1 typ host".into(),
            sdp_mid: Some("0".into()),
            sdp_m_line_index: Some(0),
        };
        let json = serde_json::to_string(&candidate).unwrap();
        assert!(json.contains("\"sdpMid\":\"0\""));
        assert!(json.contains("\"sdpMLineIndex\":0"));
    }
}
