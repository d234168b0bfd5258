//! Host agent library: session/auth state machine, WebRTC peer-channel
//! bridge, assistant supervision, and the admin HTTP surface. Split out
//! from the binary crate so integration tests can drive it directly —
//! the same `[lib]` + `[[bin]]` shape as `vibe-coder-rendezvous`.

pub mod admin;
pub mod bridge;
pub mod config;
pub mod dispatch;
pub mod persist;
pub mod session;
