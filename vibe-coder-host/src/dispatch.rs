//! Routes inbound rendezvous frames into the session table and bridge.
//! Split out of the binary so an integration test can drive the same
//! dispatch the running host agent uses, instead of re-implementing it
//! against a faked host.

use std::sync::Arc;

use vibe_coder_proto::SignalingMessage;

use crate::bridge::Bridge;
use crate::session::{SessionTable, VerifyOutcome};

pub async fn dispatch_signaling_message(sessions: &Arc<SessionTable>, bridge: &Arc<Bridge>, msg: SignalingMessage) {
    match msg {
        SignalingMessage::SessionCreated { session_id } => {
            tracing::info!(session_id, "registered with rendezvous");
        }
        SignalingMessage::PeerConnected { session_id, .. } => {
            tracing::debug!(session_id, "peer joined session");
        }
        SignalingMessage::PeerDisconnected { session_id, .. } => {
            if let Some(connection_id) = bridge.connection_id_for_session(&session_id) {
                tracing::info!(session_id, connection_id, "peer disconnected");
            }
            sessions.mark_disconnected(&session_id);
        }
        SignalingMessage::VerifyTotp {
            session_id,
            totp_code,
            ..
        } => match sessions.verify_totp(&session_id, &totp_code) {
            VerifyOutcome::Ok => {
                bridge.send_signaling(SignalingMessage::AuthSuccess { session_id });
            }
            VerifyOutcome::BadCode | VerifyOutcome::Unknown | VerifyOutcome::Terminated => {
                // Rejects silently per spec.md §4.2 — no error frame to
                // the client, since a wrong-code frame is routine.
            }
        },
        SignalingMessage::OfferReceived {
            session_id,
            client_id,
            offer,
        } => match bridge.handle_offer(&session_id, Some(client_id.clone()), offer).await {
            Ok(answer) => bridge.send_signaling(SignalingMessage::Answer {
                session_id,
                client_id: Some(client_id),
                answer,
            }),
            Err(e) => tracing::warn!(session_id, "failed to answer offer: {e}"),
        },
        SignalingMessage::CandidateReceived {
            session_id,
            candidate,
            ..
        } => {
            if let Some(connection_id) = bridge.connection_id_for_session(&session_id) {
                if let Err(e) = bridge.handle_ice_candidate(&connection_id, candidate).await {
                    tracing::warn!(session_id, "failed to add ice candidate: {e}");
                }
            }
        }
        SignalingMessage::Error { session_id, error } => {
            tracing::warn!(?session_id, "rendezvous reported an error: {error}");
        }
        _ => {}
    }
}
