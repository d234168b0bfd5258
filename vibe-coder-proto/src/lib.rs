//! Shared wire schema and security primitives for the vibe-coder bridge.
//!
//! Used by both `vibe-coder-rendezvous` and `vibe-coder-host` so the two
//! binaries agree on message shapes and never re-implement TOTP/token/
//! safety-filter logic independently.

pub mod ids;
pub mod message;
pub mod safety;
pub mod token;
pub mod totp;

pub use message::{DataChannelMessage, IceCandidateInit, SessionDescription, SignalingMessage};
