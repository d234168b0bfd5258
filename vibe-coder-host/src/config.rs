//! Host agent configuration — CLI flags with environment-variable
//! fallback, matching spec.md §6's `VIBE_CODER_*` variables and the
//! teacher's `clap::Parser`-derived `ServerConfig`.

use clap::Parser;

/// How the assistant process is attached to sessions (spec.md §9 open
/// question — resolved in SPEC_FULL.md §4.3: per-session by default,
/// configurable to a shared singleton).
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum AssistantMode {
    PerSession,
    Singleton,
}

#[derive(Debug, Clone, Parser)]
#[command(name = "vibe-coder-host", about = "Remote execution bridge host agent")]
pub struct HostConfig {
    /// Directory holding persisted host identity/secrets.
    #[arg(long, env = "VIBE_CODER_WORKSPACE_PATH")]
    pub workspace_path: String,

    /// Admin HTTP port.
    #[arg(long, env = "VIBE_CODER_PORT")]
    pub port: u16,

    /// Rendezvous base URL, e.g. wss://rendezvous.example.com
    #[arg(long, env = "VIBE_CODER_SIGNALING_URL", default_value = "ws://127.0.0.1:8787")]
    pub signaling_url: String,

    /// Path component of the signaling WebSocket.
    #[arg(long, env = "VIBE_CODER_SIGNALING_WS_PATH", default_value = "/")]
    pub signaling_ws_path: String,

    /// Comma-separated STUN server URLs.
    #[arg(long, env = "VIBE_CODER_WEBRTC_STUN_SERVERS", default_value = "stun:stun.l.google.com:19302")]
    pub stun_servers: String,

    /// Comma-separated TURN server URLs (optional).
    #[arg(long, env = "VIBE_CODER_WEBRTC_TURN_SERVERS", default_value = "")]
    pub turn_servers: String,

    /// Maximum concurrent authenticated sessions.
    #[arg(long, env = "VIBE_CODER_MAX_CONNECTIONS", default_value_t = 16)]
    pub max_connections: usize,

    #[arg(long, env = "VIBE_CODER_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// One assistant process per session, or one shared across all sessions.
    #[arg(long, env = "VIBE_CODER_ASSISTANT_MODE", value_enum, default_value = "per-session")]
    pub assistant_mode: AssistantMode,

    /// Assistant executable to launch (the only command the bridge ever
    /// execs directly).
    #[arg(long, env = "VIBE_CODER_ASSISTANT_BIN", default_value = "claude")]
    pub assistant_bin: String,

    /// Wall-clock cap, in seconds, on a single assistant command.
    #[arg(long, env = "VIBE_CODER_COMMAND_TIMEOUT_SECS", default_value_t = 30)]
    pub command_timeout_secs: u64,

    /// TOTP verification window, in 30-second steps either side of now.
    #[arg(long, env = "VIBE_CODER_TOTP_WINDOW_STEPS", default_value_t = 2)]
    pub totp_window_steps: i64,
}

impl HostConfig {
    pub fn stun_server_list(&self) -> Vec<String> {
        self.stun_servers
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    }

    pub fn turn_server_list(&self) -> Vec<String> {
        self.turn_servers
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    }

    /// Validate configuration at startup. Returns a descriptive error on
    /// any validation failure (exit code 2, spec.md §6).
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.workspace_path.trim().is_empty() {
            anyhow::bail!("VIBE_CODER_WORKSPACE_PATH must not be empty");
        }
        if self.port == 0 {
            anyhow::bail!("VIBE_CODER_PORT must be nonzero");
        }
        if self.max_connections == 0 {
            anyhow::bail!("VIBE_CODER_MAX_CONNECTIONS must be at least 1");
        }
        if self.command_timeout_secs < 10 {
            anyhow::bail!("VIBE_CODER_COMMAND_TIMEOUT_SECS must be at least 10");
        }
        if self.totp_window_steps < 0 {
            anyhow::bail!("VIBE_CODER_TOTP_WINDOW_STEPS must not be negative");
        }
        Ok(())
    }
}
