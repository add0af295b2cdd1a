//! The host plugin façade: the core's only dependency on the upstream
//! game-server process.
//!
//! Grounded in `socket/socket-plugin.c` (channel count/mode lookup,
//! socket-to-native association) and `session.c`'s use of
//! `plugin->session_create`/`session_receive`/`session_disconnect`. In
//! production this trait would be backed by a real game-server process
//! reached over IPC; [`InProcessHost`] is the reference stub used by this
//! repository's own tests and examples, playing the same role the original
//! plugin.c played for the reference implementation's own self-tests.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::channel::ChannelMode;
use crate::codec::packed::read_packed_uint64;
use crate::config::Config;
use crate::error::{Error, Result};

pub const CONNECT_TOKEN_BYTES: usize = 2048;

/// Opaque handle the host hands back for a created native session; the
/// core never interprets its value, only threads it back through
/// `session_receive`/`session_destroy`.
pub type NativeSessionHandle = u64;

#[derive(Debug, Clone)]
pub struct TokenInfo {
    pub client_id: u64,
    pub timeout_ms: u64,
    pub user_data: Vec<u8>,
}

/// The core's view of the upstream game server. Every method may be called
/// from the single loop thread only, except where noted — the host is free
/// to hop onto its own IPC thread internally, but must deliver any
/// resulting callback back through [`HostFacade::executor_submit`] rather
/// than calling into the core directly.
pub trait HostFacade: Send + Sync {
    fn channel_count(&self) -> usize;
    fn channel_mode(&self, index: usize) -> ChannelMode;

    /// Monotonic host-clock time in nanoseconds, used as the PONG time
    /// field so a client can compute the host's processing delay.
    fn time_ns(&self) -> u64;

    /// Validates and unpacks a connect token. Called once per session,
    /// right after the WS AUTH frame arrives.
    fn decode_connect_token(&self, bytes: &[u8]) -> Result<TokenInfo>;

    /// Opens a native session on the host side. Failure here is
    /// `HostRejected` and closes the bridge session immediately.
    fn session_create(&self, client_id: u64, address: &str) -> Result<NativeSessionHandle>;

    fn session_destroy(&self, native: NativeSessionHandle);

    /// Delivers one inbound application-channel message to the host.
    fn session_receive(&self, native: NativeSessionHandle, channel_index: usize, bytes: &[u8]);

    /// Runs `callback` on the host's executor; for the in-process stub this
    /// is simply "run it now", since there is no separate host thread.
    fn executor_submit(&self, callback: Box<dyn FnOnce() + Send>);

    /// Called once the first socket opens. Lets the host stand up whatever
    /// it needs to service `executor_submit` calls.
    fn executor_startup(&self);

    /// Called once the last socket closes. Mirror of `executor_startup`.
    fn executor_shutdown(&self);
}

/// Reference in-process host: validates a fixed-size token by treating its
/// first 8 bytes as a packed client id and the next 8 as a millisecond
/// timeout, accepts every session, and discards inbound messages after
/// counting them. Exists so the bridge core can be exercised and tested
/// without a real game server process.
pub struct InProcessHost {
    config: Config,
    next_native_handle: AtomicU64,
}

impl InProcessHost {
    pub fn new(config: Config) -> Self {
        InProcessHost {
            config,
            next_native_handle: AtomicU64::new(1),
        }
    }
}

impl HostFacade for InProcessHost {
    fn channel_count(&self) -> usize {
        self.config.channel_count
    }

    fn channel_mode(&self, _index: usize) -> ChannelMode {
        self.config.default_channel_mode
    }

    fn time_ns(&self) -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0)
    }

    fn decode_connect_token(&self, bytes: &[u8]) -> Result<TokenInfo> {
        // Base64 padding means a caller may hand us either the padded
        // length or the unpadded one; §6.2 accepts both either side of the
        // decode boundary, so by the time it reaches us it must be exactly
        // CONNECT_TOKEN_BYTES.
        if bytes.len() != CONNECT_TOKEN_BYTES {
            return Err(Error::ProtocolViolation(format!(
                "connect token has {} bytes, expected {CONNECT_TOKEN_BYTES}",
                bytes.len()
            )));
        }
        let client_id = read_packed_uint64(&bytes[0..8], 8);
        let timeout_ms = read_packed_uint64(&bytes[8..16], 8).max(1_000);
        Ok(TokenInfo {
            client_id,
            timeout_ms,
            user_data: bytes[16..].to_vec(),
        })
    }

    fn session_create(&self, _client_id: u64, _address: &str) -> Result<NativeSessionHandle> {
        Ok(self.next_native_handle.fetch_add(1, Ordering::SeqCst))
    }

    fn session_destroy(&self, _native: NativeSessionHandle) {}

    fn session_receive(&self, _native: NativeSessionHandle, _channel_index: usize, _bytes: &[u8]) {}

    fn executor_submit(&self, callback: Box<dyn FnOnce() + Send>) {
        callback();
    }

    fn executor_startup(&self) {}

    fn executor_shutdown(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token_bytes(client_id: u64, timeout_ms: u64) -> Vec<u8> {
        let mut bytes = vec![0u8; CONNECT_TOKEN_BYTES];
        bytes[0..8].copy_from_slice(&client_id.to_le_bytes());
        bytes[8..16].copy_from_slice(&timeout_ms.to_le_bytes());
        bytes
    }

    #[test]
    fn decodes_well_formed_token() {
        let host = InProcessHost::new(Config::default());
        let info = host.decode_connect_token(&token_bytes(7, 9_000)).unwrap();
        assert_eq!(info.client_id, 7);
        assert_eq!(info.timeout_ms, 9_000);
    }

    #[test]
    fn rejects_wrong_length_token() {
        let host = InProcessHost::new(Config::default());
        assert!(host.decode_connect_token(&[0u8; 10]).is_err());
    }

    #[test]
    fn session_handles_are_unique_and_increasing() {
        let host = InProcessHost::new(Config::default());
        let a = host.session_create(1, "127.0.0.1:1").unwrap();
        let b = host.session_create(2, "127.0.0.1:2").unwrap();
        assert_ne!(a, b);
    }
}
