//! Rendezvous configuration — CLI flags with environment-variable fallback,
//! in the shape of the teacher's `ServerConfig` (`clap::Parser` derive with
//! `env = "..."` on every field).

use clap::Parser;

#[derive(Debug, Clone, Parser)]
#[command(name = "vibe-coder-rendezvous", about = "WebRTC signaling rendezvous")]
pub struct RendezvousConfig {
    /// Address to bind the WebSocket listener on.
    #[arg(long, env = "VIBE_RENDEZVOUS_LISTEN_ADDR", default_value = "0.0.0.0:8787")]
    pub listen_addr: String,

    /// Path the signaling WebSocket is served on.
    #[arg(long, env = "VIBE_RENDEZVOUS_WS_PATH", default_value = "/")]
    pub ws_path: String,

    /// How long (seconds) a session may go without activity before the
    /// periodic sweep reaps it.
    #[arg(long, env = "VIBE_RENDEZVOUS_SESSION_TTL_SECS", default_value_t = 600)]
    pub session_ttl_secs: u64,

    /// How often (seconds) the reaper sweep runs.
    #[arg(long, env = "VIBE_RENDEZVOUS_SWEEP_INTERVAL_SECS", default_value_t = 60)]
    pub sweep_interval_secs: u64,
}

impl RendezvousConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.listen_addr.parse::<std::net::SocketAddr>().is_err() {
            anyhow::bail!("invalid listen_addr: {}", self.listen_addr);
        }
        if !self.ws_path.starts_with('/') {
            anyhow::bail!("ws_path must start with '/'");
        }
        Ok(())
    }
}
