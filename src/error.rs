//! Error taxonomy for the bridge core.
//!
//! Kinds mirror the handling policy described for the session lifecycle: each
//! variant carries enough context for the call site to decide whether to drop
//! a frame, close a session, or simply log and continue. Nothing in this
//! crate unwinds across an async boundary except genuine programmer-error
//! assertions (`Error::Internal`), which are only raised in debug builds.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Malformed signaling frame, bad address string, unknown channel label,
    /// out-of-range codec frame.
    #[error("invalid input: {0}")]
    InputInvalid(String),

    /// Pool, queue, or string-buffer allocation failed.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Auth failure, timeout expiry, PC state failed/disconnected.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// WS closed or DC closed from the far side.
    #[error("peer closed: {0}")]
    PeerClosed(String),

    /// Native session creation failed on the host side.
    #[error("host rejected session: {0}")]
    HostRejected(String),

    /// Broken invariant. Debug builds should have asserted before reaching
    /// this; release builds log at error level and treat it as
    /// `ResourceExhausted` plus close.
    #[error("internal invariant violated: {0}")]
    Internal(String),
}

impl Error {
    /// Whether this error, surfaced mid-session, should cascade into closing
    /// the session rather than merely dropping the offending frame.
    pub fn is_fatal_to_session(&self) -> bool {
        matches!(
            self,
            Error::ProtocolViolation(_)
                | Error::PeerClosed(_)
                | Error::HostRejected(_)
                | Error::Internal(_)
        )
    }
}
