//! Process configuration.
//!
//! CLI flags with `env` fallbacks, following the teacher's `Args` pattern in
//! `main.rs`: every knob can be set from the environment for container
//! deployments, with explicit flags taking precedence.

use clap::Parser;

use crate::channel::ChannelMode;

#[derive(Parser, Debug)]
#[command(name = "webrtc-session-bridge", version, about = "WebRTC signaling and session bridge")]
pub struct Args {
    /// Host to bind the signaling WebSocket (and health/stats HTTP) listener on.
    #[arg(long, default_value = "0.0.0.0", env = "BRIDGE_HOST")]
    pub host: String,

    /// Port to bind the signaling WebSocket (and health/stats HTTP) listener on.
    #[arg(short, long, default_value_t = 8088, env = "BRIDGE_PORT")]
    pub port: u16,

    /// STUN/TURN ICE server URLs (comma-separated).
    #[arg(
        long,
        env = "BRIDGE_ICE_SERVERS",
        value_delimiter = ',',
        default_value = "stun:stun.l.google.com:19302"
    )]
    pub ice_servers: Vec<String>,

    /// Number of application data channels to open per session, in addition
    /// to the reserved system channel.
    #[arg(long, default_value_t = 2, env = "BRIDGE_CHANNEL_COUNT")]
    pub channel_count: usize,

    /// Default mode for application channels when no per-socket template is
    /// supplied by the host facade: "unreliable" | "sequenced" | "reliable".
    #[arg(long, default_value = "reliable", env = "BRIDGE_DEFAULT_CHANNEL_MODE")]
    pub default_channel_mode: String,

    /// Auth-phase deadline in milliseconds (AUTH_TIMEOUT_MS in the spec).
    #[arg(long, default_value_t = 5000, env = "BRIDGE_AUTH_TIMEOUT_MS")]
    pub auth_timeout_ms: u64,

    /// Ping cadence over the system channel, in milliseconds.
    #[arg(long, default_value_t = 100, env = "BRIDGE_PING_INTERVAL_MS")]
    pub ping_interval_ms: u64,
}

impl Args {
    pub fn default_channel_mode(&self) -> ChannelMode {
        match self.default_channel_mode.as_str() {
            "unreliable" => ChannelMode::Unreliable,
            "sequenced" => ChannelMode::Sequenced,
            _ => ChannelMode::Reliable,
        }
    }
}

/// Immutable, cloneable view of the settings that matter past startup.
/// Plain `Args` is kept around only for the CLI parse; this is what the
/// rest of the core holds onto.
#[derive(Debug, Clone)]
pub struct Config {
    pub ice_servers: Vec<String>,
    pub channel_count: usize,
    pub default_channel_mode: ChannelMode,
    pub auth_timeout_ms: u64,
    pub ping_interval_ms: u64,
}

impl From<&Args> for Config {
    fn from(args: &Args) -> Self {
        Config {
            ice_servers: args.ice_servers.clone(),
            channel_count: args.channel_count,
            default_channel_mode: args.default_channel_mode(),
            auth_timeout_ms: args.auth_timeout_ms,
            ping_interval_ms: args.ping_interval_ms,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            ice_servers: vec!["stun:stun.l.google.com:19302".to_string()],
            channel_count: 2,
            default_channel_mode: ChannelMode::Reliable,
            auth_timeout_ms: 5000,
            ping_interval_ms: 100,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_matches_constants() {
        let config = Config::default();
        assert_eq!(config.auth_timeout_ms, 5000);
        assert_eq!(config.ping_interval_ms, 100);
    }
}
