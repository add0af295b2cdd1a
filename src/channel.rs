//! Data channel entity: mode-to-transport mapping and per-channel state.
//!
//! Grounded in `channel/channel-dc.c` for the mode mapping and lifecycle
//! flags, and in `matchbox_socket`'s `ChannelConfig` builder for how that
//! mapping is idiomatically expressed against the `webrtc` crate's
//! `RTCDataChannelInit`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::RTCDataChannel;

/// Prefix for server-originated application channel labels; the reserved
/// system channel uses [`SYSTEM_CHANNEL_LABEL`] instead.
pub const SERVER_CHANNEL_PREFIX: &str = "server-channel-";
/// Prefix the client is expected to use for the matching inbound stream it
/// opens for each server-originated application channel.
pub const CLIENT_CHANNEL_PREFIX: &str = "client-channel-";
pub const SYSTEM_CHANNEL_LABEL: &str = "system";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelMode {
    /// No retransmission, no ordering guarantee.
    Unreliable,
    /// No retransmission, but delivered in order (stale packets dropped).
    Sequenced,
    /// Retransmitted and delivered in order — ordinary TCP-like semantics.
    Reliable,
}

impl ChannelMode {
    /// `(unreliable, unordered)` pair as named in the reference
    /// implementation's `rtc_data_channel_options_t`.
    pub fn flags(self) -> (bool, bool) {
        match self {
            ChannelMode::Unreliable => (true, true),
            ChannelMode::Sequenced => (true, false),
            ChannelMode::Reliable => (false, false),
        }
    }

    /// Translates to the options the `webrtc` crate's
    /// `create_data_channel` expects: `max_retransmits: Some(0)` disables
    /// retransmission (the "unreliable" half), `ordered` controls whether
    /// out-of-order frames are held back for re-sequencing.
    pub fn data_channel_init(self) -> RTCDataChannelInit {
        let (unreliable, unordered) = self.flags();
        RTCDataChannelInit {
            ordered: Some(!unordered),
            max_retransmits: if unreliable { Some(0) } else { None },
            ..Default::default()
        }
    }
}

/// Channel label for an application channel at `index`, or the reserved
/// system channel when `index` is `None`.
pub fn label_for(index: Option<usize>) -> String {
    match index {
        Some(index) => format!("{SERVER_CHANNEL_PREFIX}{index}"),
        None => SYSTEM_CHANNEL_LABEL.to_string(),
    }
}

/// The channel an inbound (client-opened) data channel label resolves to,
/// per `pomelo_webrtc_dc_on_open_callback`'s label dispatch: client streams
/// are named by the same index scheme as the server's own outgoing
/// channels, just under the client-facing prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundLabel {
    Channel(usize),
    System,
}

/// Parses a label received via `on_data_channel` into the application
/// channel index (or system channel) it pairs with. Any label outside the
/// two recognized families is unknown and, per the labeling contract, should
/// close the session rather than be silently ignored.
pub fn parse_inbound_label(label: &str) -> Option<InboundLabel> {
    if label == SYSTEM_CHANNEL_LABEL {
        return Some(InboundLabel::System);
    }
    label
        .strip_prefix(CLIENT_CHANNEL_PREFIX)
        .and_then(|index| index.parse().ok())
        .map(InboundLabel::Channel)
}

/// A single data channel belonging to a session: either one of the
/// session's application channels (`index = Some(_)`) or its one system
/// channel (`index = None`), used for ping/pong and the READY handshake.
///
/// Each logical channel carries two distinct `webrtc` streams once
/// negotiation completes: `outgoing` is the one this side created (open and
/// close act on it), `incoming` is the peer's matching stream received
/// through `on_data_channel` (message delivery acts on it). They are kept
/// separate because `webrtc-rs` data channels are one-directional-origin
/// objects even though the logical channel they back is bidirectional.
pub struct Channel {
    pub index: Option<usize>,
    pub mode: ChannelMode,
    pub label: String,
    outgoing: Mutex<Option<Arc<RTCDataChannel>>>,
    incoming: Mutex<Option<Arc<RTCDataChannel>>>,
    active: AtomicBool,
    receiving_enabled: AtomicBool,
}

impl Channel {
    pub fn new(index: Option<usize>, mode: ChannelMode) -> Self {
        Channel {
            label: label_for(index),
            index,
            mode,
            outgoing: Mutex::new(None),
            incoming: Mutex::new(None),
            active: AtomicBool::new(true),
            receiving_enabled: AtomicBool::new(false),
        }
    }

    pub fn is_system(&self) -> bool {
        self.index.is_none()
    }

    pub fn attach_outgoing(&self, data_channel: Arc<RTCDataChannel>) {
        *self.outgoing.lock() = Some(data_channel);
    }

    pub fn attach_incoming(&self, data_channel: Arc<RTCDataChannel>) {
        *self.incoming.lock() = Some(data_channel);
    }

    pub fn outgoing_data_channel(&self) -> Option<Arc<RTCDataChannel>> {
        self.outgoing.lock().clone()
    }

    pub fn incoming_data_channel(&self) -> Option<Arc<RTCDataChannel>> {
        self.incoming.lock().clone()
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Marks the channel closed. Idempotent; returns whether this call was
    /// the one that transitioned it (mirrors the reference implementation's
    /// active-flag guard against double-close).
    pub fn deactivate(&self) -> bool {
        self.active.swap(false, Ordering::AcqRel)
    }

    /// Enabled once the session has reached CONNECTED, per
    /// `session_on_connected` — before that, inbound frames on an opened
    /// channel are dropped rather than routed to the host facade.
    pub fn set_receiving_enabled(&self, enabled: bool) {
        self.receiving_enabled.store(enabled, Ordering::Release);
    }

    pub fn receiving_enabled(&self) -> bool {
        self.receiving_enabled.load(Ordering::Acquire)
    }

    /// Whether an inbound message on this channel should be routed at all:
    /// the channel must still be active and receiving must be enabled.
    pub fn accepts_inbound(&self) -> bool {
        self.is_active() && self.receiving_enabled()
    }
}
