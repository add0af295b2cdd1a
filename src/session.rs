//! Session state machine: one browser peer's path from AUTH through
//! CONNECTED to CLOSED.
//!
//! Grounded end to end in `session/session.c` and `session/session-ws.c`.
//! Session-state mutations that originate on a foreign thread — a `webrtc`
//! crate callback, the WebSocket reader task — are always re-entered
//! through [`crate::task::Dispatcher::submit`] before touching any of this
//! struct's fields, the same discipline the reference implementation
//! enforces by only ever calling into a session from its own loop thread.
//! The async/await plumbing needed to drive `webrtc`-crate futures
//! (creating offers, setting descriptions) runs on the ambient Tokio
//! runtime directly, in the closure style shown by `selkies-core`'s
//! `WebRTCSession` and `zortos293-GFNClient`'s peer setup — only the
//! resulting state transitions are re-serialized onto the dispatcher.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

use crate::channel::{Channel, InboundLabel};
use crate::codec::pingpong::{self, SystemMessage};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::host::{HostFacade, NativeSessionHandle};
use crate::rtt::RttCalculator;
use crate::signaling::{encode_server_frame, ServerFrame};
use crate::task::{Dispatcher, ScheduleHandle};
use crate::webrtc_facade::WebRtcFacade;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Init,
    Authenticating,
    Negotiating,
    Connecting,
    Connected,
    Closing,
    Closed,
}

pub struct Session {
    pub id: Uuid,
    client_id: Mutex<Option<u64>>,
    state: Mutex<SessionState>,
    dispatcher: Arc<Dispatcher>,
    host: Arc<dyn HostFacade>,
    webrtc: Arc<WebRtcFacade>,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    peer_connection: Mutex<Option<Arc<RTCPeerConnection>>>,
    channels: Mutex<Vec<Arc<Channel>>>,
    system_channel: Mutex<Option<Arc<Channel>>>,
    opened_channels: AtomicUsize,
    ready_signal_received: AtomicBool,
    all_channels_opened: AtomicBool,
    native_session: Mutex<Option<NativeSessionHandle>>,
    rtt: RttCalculator,
    address: Mutex<Option<String>>,
    auth_timeout: Mutex<Option<ScheduleHandle>>,
    negotiate_timeout: Mutex<Option<ScheduleHandle>>,
    ping_schedule: Mutex<Option<ScheduleHandle>>,
    config: Config,
}

impl Session {
    pub fn new(
        dispatcher: Arc<Dispatcher>,
        host: Arc<dyn HostFacade>,
        webrtc: Arc<WebRtcFacade>,
        outbound: mpsc::UnboundedSender<Vec<u8>>,
        config: Config,
    ) -> Arc<Self> {
        let session = Arc::new(Session {
            id: Uuid::new_v4(),
            client_id: Mutex::new(None),
            state: Mutex::new(SessionState::Init),
            dispatcher: dispatcher.clone(),
            host,
            webrtc,
            outbound,
            peer_connection: Mutex::new(None),
            channels: Mutex::new(Vec::new()),
            system_channel: Mutex::new(None),
            opened_channels: AtomicUsize::new(0),
            ready_signal_received: AtomicBool::new(false),
            all_channels_opened: AtomicBool::new(false),
            native_session: Mutex::new(None),
            rtt: RttCalculator::new(),
            address: Mutex::new(None),
            auth_timeout: Mutex::new(None),
            negotiate_timeout: Mutex::new(None),
            ping_schedule: Mutex::new(None),
            config,
        });

        let auth_timeout_ms = session.config.auth_timeout_ms;
        let weak = Arc::downgrade(&session);
        let handle = dispatcher.schedule_once(auth_timeout_ms, move || {
            if let Some(session) = weak.upgrade() {
                session.on_timeout("auth");
            }
        });
        *session.auth_timeout.lock() = Some(handle);

        session
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    pub fn client_id(&self) -> Option<u64> {
        *self.client_id.lock()
    }

    pub fn rtt(&self) -> &RttCalculator {
        &self.rtt
    }

    pub fn set_address(&self, address: String) {
        *self.address.lock() = Some(address);
    }

    fn total_channel_count(&self) -> usize {
        self.channels.lock().len() + 1 // + the system channel
    }

    // ---- Authentication -------------------------------------------------

    pub fn recv_auth(self: &Arc<Self>, token: Vec<u8>) {
        if self.state() != SessionState::Init {
            self.close_with_reason("AUTH received outside of INIT");
            return;
        }
        *self.state.lock() = SessionState::Authenticating;

        match self.host.decode_connect_token(&token) {
            Ok(info) => {
                *self.client_id.lock() = Some(info.client_id);
                self.unschedule_auth_timeout();
                self.send_frame(ServerFrame::AuthOk {
                    client_id: info.client_id,
                    server_time_ns: self.host.time_ns(),
                });
                self.create_channels();

                let negotiate_timeout_ms = info.timeout_ms.max(self.config.auth_timeout_ms);
                let weak = Arc::downgrade(self);
                let handle = self.dispatcher.schedule_once(negotiate_timeout_ms, move || {
                    if let Some(session) = weak.upgrade() {
                        session.on_timeout("negotiate");
                    }
                });
                *self.negotiate_timeout.lock() = Some(handle);

                *self.state.lock() = SessionState::Negotiating;
                let session = self.clone();
                tokio::spawn(async move {
                    if let Err(e) = session.start_negotiation().await {
                        warn!(session = %session.id, error = %e, "failed to start negotiation");
                        session.close_with_reason("negotiation setup failed");
                    }
                });
            }
            Err(e) => {
                self.unschedule_auth_timeout();
                self.send_frame(ServerFrame::AuthFailed);
                self.close_with_reason(&format!("auth failed: {e}"));
            }
        }
    }

    fn create_channels(self: &Arc<Self>) {
        let count = self.host.channel_count();
        let channels: Vec<Arc<Channel>> = (0..count)
            .map(|index| Arc::new(Channel::new(Some(index), self.host.channel_mode(index))))
            .collect();
        *self.channels.lock() = channels;
        *self.system_channel.lock() = Some(Arc::new(Channel::new(None, crate::channel::ChannelMode::Reliable)));
    }

    // ---- SDP / ICE --------------------------------------------------------

    async fn start_negotiation(self: Arc<Self>) -> Result<()> {
        let pc = self.webrtc.create_peer_connection().await?;
        self.wire_peer_connection_callbacks(&pc);
        *self.peer_connection.lock() = Some(pc.clone());

        let channels: Vec<Arc<Channel>> = self.channels.lock().clone();
        for channel in &channels {
            let dc = WebRtcFacade::create_data_channel(&pc, &channel.label, channel.mode.data_channel_init()).await?;
            self.wire_outgoing_channel_callbacks(channel.clone(), dc.clone());
            channel.attach_outgoing(dc);
        }

        let system = self
            .system_channel
            .lock()
            .clone()
            .ok_or_else(|| Error::Internal("system channel missing at negotiation start".into()))?;
        let system_dc =
            WebRtcFacade::create_data_channel(&pc, &system.label, system.mode.data_channel_init()).await?;
        self.wire_outgoing_channel_callbacks(system.clone(), system_dc.clone());
        system.attach_outgoing(system_dc);

        let offer = pc
            .create_offer(None)
            .await
            .map_err(|e| Error::Internal(format!("create_offer failed: {e}")))?;
        pc.set_local_description(offer.clone())
            .await
            .map_err(|e| Error::Internal(format!("set_local_description failed: {e}")))?;
        self.send_frame(ServerFrame::Description(offer.sdp));
        Ok(())
    }

    pub fn recv_description(self: &Arc<Self>, sdp: String) {
        let Some(pc) = self.peer_connection.lock().clone() else {
            self.close_with_reason("DESC received before negotiation started");
            return;
        };
        let session = self.clone();
        tokio::spawn(async move {
            let answer = match RTCSessionDescription::answer(sdp) {
                Ok(answer) => answer,
                Err(e) => {
                    session
                        .dispatcher
                        .submit(move || session.close_with_reason(&format!("bad SDP answer: {e}")));
                    return;
                }
            };
            if let Err(e) = pc.set_remote_description(answer).await {
                session
                    .dispatcher
                    .submit(move || session.close_with_reason(&format!("set_remote_description failed: {e}")));
            }
        });
    }

    pub fn recv_candidate(self: &Arc<Self>, candidate: String) {
        let Some(pc) = self.peer_connection.lock().clone() else {
            return; // candidates arriving before negotiation started are dropped, not fatal
        };
        tokio::spawn(async move {
            let init = RTCIceCandidateInit {
                candidate,
                ..Default::default()
            };
            let _ = pc.add_ice_candidate(init).await;
        });
    }

    fn wire_peer_connection_callbacks(self: &Arc<Self>, pc: &Arc<RTCPeerConnection>) {
        let session = self.clone();
        pc.on_ice_candidate(Box::new(move |candidate| {
            let session = session.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else { return };
                if let Ok(init) = candidate.to_json() {
                    session
                        .dispatcher
                        .submit(move || session.send_frame(ServerFrame::Candidate(init.candidate)));
                }
            })
        }));

        let session = self.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let session = session.clone();
            Box::pin(async move {
                if matches!(
                    state,
                    RTCPeerConnectionState::Failed
                        | RTCPeerConnectionState::Disconnected
                        | RTCPeerConnectionState::Closed
                ) {
                    session
                        .dispatcher
                        .submit(move || session.close_with_reason("peer connection state failed/disconnected"));
                }
            })
        }));

        let session = self.clone();
        pc.on_data_channel(Box::new(move |dc: Arc<webrtc::data_channel::RTCDataChannel>| {
            let session = session.clone();
            Box::pin(async move {
                let label = dc.label().to_string();
                session
                    .dispatcher
                    .submit(move || session.on_inbound_data_channel(label, dc));
            })
        }));
    }

    /// The inbound half of the labeling contract: the client opens its own
    /// stream per logical channel, named `client-channel-<index>` (or
    /// `system`), delivered here through `on_data_channel` rather than
    /// through anything this side created. Only the matching outgoing
    /// channel's open/close react to this side's own data channel; message
    /// delivery always comes from the peer's channel, paired in here.
    fn on_inbound_data_channel(self: &Arc<Self>, label: String, dc: Arc<webrtc::data_channel::RTCDataChannel>) {
        let channel = match crate::channel::parse_inbound_label(&label) {
            Some(InboundLabel::System) => self.system_channel.lock().clone(),
            Some(InboundLabel::Channel(index)) => {
                self.channels.lock().iter().find(|c| c.index == Some(index)).cloned()
            }
            None => None,
        };

        let Some(channel) = channel else {
            self.close_with_reason(&format!("unrecognized inbound data channel label: {label}"));
            return;
        };

        channel.attach_incoming(dc.clone());
        self.wire_incoming_channel_callbacks(channel, dc);
    }

    fn wire_outgoing_channel_callbacks(self: &Arc<Self>, channel: Arc<Channel>, dc: Arc<webrtc::data_channel::RTCDataChannel>) {
        let session = self.clone();
        let ch = channel.clone();
        dc.on_open(Box::new(move || {
            let session = session.clone();
            let ch = ch.clone();
            Box::pin(async move {
                session.dispatcher.submit(move || session.on_channel_opened(&ch));
            })
        }));

        let session = self.clone();
        let ch = channel.clone();
        dc.on_close(Box::new(move || {
            let session = session.clone();
            let ch = ch.clone();
            Box::pin(async move {
                session.dispatcher.submit(move || {
                    if ch.deactivate() {
                        session.close_with_reason("data channel closed by peer");
                    }
                });
            })
        }));
    }

    fn wire_incoming_channel_callbacks(self: &Arc<Self>, channel: Arc<Channel>, dc: Arc<webrtc::data_channel::RTCDataChannel>) {
        let session = self.clone();
        let ch = channel.clone();
        dc.on_message(Box::new(move |message: DataChannelMessage| {
            let session = session.clone();
            let ch = ch.clone();
            Box::pin(async move {
                let bytes = message.data.to_vec();
                session
                    .dispatcher
                    .submit(move || session.receive_channel_message(&ch, &bytes));
            })
        }));
    }

    // ---- Channel open / READY / CONNECTED --------------------------------

    fn on_channel_opened(self: &Arc<Self>, _channel: &Arc<Channel>) {
        if self.state() == SessionState::Negotiating {
            *self.state.lock() = SessionState::Connecting;
        }
        let opened = self.opened_channels.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(session = %self.id, opened, total = self.total_channel_count(), "channel opened");
        if opened == self.total_channel_count() {
            self.on_all_channels_opened();
        }
    }

    fn on_all_channels_opened(self: &Arc<Self>) {
        self.all_channels_opened.store(true, Ordering::SeqCst);
        self.send_frame(ServerFrame::Ready);
        self.start_ping();
        self.maybe_enter_connected();
    }

    /// Invoked when a READY frame arrives from the client over WS —
    /// idempotent, since a duplicate READY must not re-trigger the
    /// CONNECTING -> CONNECTED path.
    pub fn recv_ready(self: &Arc<Self>) {
        if self.ready_signal_received.swap(true, Ordering::SeqCst) {
            return;
        }
        self.maybe_enter_connected();
    }

    fn maybe_enter_connected(self: &Arc<Self>) {
        if self.all_channels_opened.load(Ordering::SeqCst) && self.ready_signal_received.load(Ordering::SeqCst) {
            self.on_ready();
        }
    }

    fn on_ready(self: &Arc<Self>) {
        self.unschedule_negotiate_timeout();
        let address = self.address.lock().clone().unwrap_or_default();
        let client_id = self.client_id().unwrap_or(0);
        match self.host.session_create(client_id, &address) {
            Ok(native) => {
                *self.native_session.lock() = Some(native);
                self.on_connected();
            }
            Err(e) => self.close_with_reason(&format!("host rejected session: {e}")),
        }
    }

    fn on_connected(self: &Arc<Self>) {
        for channel in self.channels.lock().iter() {
            channel.set_receiving_enabled(true);
        }
        if let Some(system) = self.system_channel.lock().as_ref() {
            system.set_receiving_enabled(true);
        }
        *self.state.lock() = SessionState::Connected;
        self.send_frame(ServerFrame::Connected);
        info!(session = %self.id, client_id = ?self.client_id(), "session connected");
    }

    // ---- Inbound data + system channel ping/pong --------------------------

    fn receive_channel_message(self: &Arc<Self>, channel: &Arc<Channel>, bytes: &[u8]) {
        if !channel.accepts_inbound() {
            return;
        }
        if channel.is_system() {
            self.process_system_message(bytes);
        } else if let Some(native) = *self.native_session.lock() {
            let index = channel.index.expect("non-system channel always has an index");
            self.host.session_receive(native, index, bytes);
        }
    }

    fn process_system_message(self: &Arc<Self>, bytes: &[u8]) {
        match pingpong::decode(bytes) {
            Ok(SystemMessage::Ping { sequence }) => self.send_pong(sequence),
            Ok(SystemMessage::Pong { sequence, time }) => {
                self.rtt.submit_entry(sequence, self.host.time_ns(), time);
            }
            Err(e) => debug!(session = %self.id, error = %e, "dropped malformed system message"),
        }
    }

    fn start_ping(self: &Arc<Self>) {
        let interval_ms = self.config.ping_interval_ms;
        let weak = Arc::downgrade(self);
        let handle = self.dispatcher.schedule(interval_ms, move || {
            if let Some(session) = weak.upgrade() {
                session.send_ping();
            }
        });
        *self.ping_schedule.lock() = Some(handle);
    }

    fn stop_ping(&self) {
        if let Some(handle) = self.ping_schedule.lock().take() {
            self.dispatcher.unschedule(handle);
        }
    }

    fn send_ping(self: &Arc<Self>) {
        let sequence = self.rtt.next_entry(self.host.time_ns());
        self.send_system_bytes(pingpong::encode_ping(sequence));
    }

    fn send_pong(self: &Arc<Self>, sequence: u64) {
        self.send_system_bytes(pingpong::encode_pong(sequence, self.host.time_ns()));
    }

    fn send_system_bytes(&self, bytes: Vec<u8>) {
        let Some(dc) = self.system_channel.lock().as_ref().and_then(|c| c.outgoing_data_channel()) else {
            return;
        };
        tokio::spawn(async move {
            let _ = dc.send(&Bytes::from(bytes)).await;
        });
    }

    // ---- Outbound signaling -----------------------------------------------

    fn send_frame(&self, frame: ServerFrame) {
        let _ = self.outbound.send(encode_server_frame(&frame));
    }

    // ---- Timeouts + close ---------------------------------------------------

    fn unschedule_auth_timeout(&self) {
        if let Some(handle) = self.auth_timeout.lock().take() {
            self.dispatcher.unschedule(handle);
        }
    }

    fn unschedule_negotiate_timeout(&self) {
        if let Some(handle) = self.negotiate_timeout.lock().take() {
            self.dispatcher.unschedule(handle);
        }
    }

    fn on_timeout(self: &Arc<Self>, phase: &str) {
        if matches!(self.state(), SessionState::Closing | SessionState::Closed) {
            return;
        }
        self.close_with_reason(&format!("{phase} timeout expired"));
    }

    /// Idempotent: only the first call actually tears anything down.
    pub fn close_with_reason(self: &Arc<Self>, reason: &str) {
        {
            let mut state = self.state.lock();
            if matches!(*state, SessionState::Closing | SessionState::Closed) {
                return;
            }
            *state = SessionState::Closing;
        }

        warn!(session = %self.id, reason, "closing session");
        self.unschedule_auth_timeout();
        self.unschedule_negotiate_timeout();
        self.stop_ping();

        for channel in self.channels.lock().iter() {
            channel.deactivate();
        }
        if let Some(system) = self.system_channel.lock().as_ref() {
            system.deactivate();
        }

        if let Some(pc) = self.peer_connection.lock().take() {
            tokio::spawn(async move {
                let _ = pc.close().await;
            });
        }

        if let Some(native) = self.native_session.lock().take() {
            self.host.session_destroy(native);
        }

        *self.state.lock() = SessionState::Closed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::host::InProcessHost;

    fn test_session() -> (Arc<Session>, mpsc::UnboundedReceiver<Vec<u8>>) {
        let dispatcher = Dispatcher::start();
        let host = Arc::new(InProcessHost::new(Config::default()));
        let webrtc = Arc::new(WebRtcFacade::new(&["stun:stun.l.google.com:19302".to_string()]).unwrap());
        let (tx, rx) = mpsc::unbounded_channel();
        let session = Session::new(dispatcher, host, webrtc, tx, Config::default());
        (session, rx)
    }

    #[test]
    fn starts_in_init_state() {
        let (session, _rx) = test_session();
        assert_eq!(session.state(), SessionState::Init);
    }

    #[test]
    fn channel_open_accounting_triggers_all_opened_exactly_at_total() {
        let (session, mut rx) = test_session();
        *session.channels.lock() = vec![
            Arc::new(Channel::new(Some(0), crate::channel::ChannelMode::Reliable)),
            Arc::new(Channel::new(Some(1), crate::channel::ChannelMode::Reliable)),
        ];
        *session.system_channel.lock() = Some(Arc::new(Channel::new(None, crate::channel::ChannelMode::Reliable)));
        *session.state.lock() = SessionState::Negotiating;

        let channels = session.channels.lock().clone();
        session.on_channel_opened(&channels[0]);
        assert_eq!(session.state(), SessionState::Connecting);
        assert!(!session.all_channels_opened.load(Ordering::SeqCst));

        session.on_channel_opened(&channels[1]);
        assert!(!session.all_channels_opened.load(Ordering::SeqCst));

        let system = session.system_channel.lock().clone().unwrap();
        session.on_channel_opened(&system);
        assert!(session.all_channels_opened.load(Ordering::SeqCst));

        // A READY frame should have been queued for the signaling writer.
        let frame = rx.try_recv().unwrap();
        assert_eq!(frame, b"READY");
    }

    #[test]
    fn connected_requires_both_channels_opened_and_ready_regardless_of_order() {
        let (session, _rx) = test_session();
        *session.system_channel.lock() = Some(Arc::new(Channel::new(None, crate::channel::ChannelMode::Reliable)));

        // READY arrives first...
        session.recv_ready();
        assert_ne!(session.state(), SessionState::Connected);

        // ...then channels finish opening: this ordering must still connect.
        session.all_channels_opened.store(true, Ordering::SeqCst);
        session.maybe_enter_connected();
        assert_eq!(session.state(), SessionState::Connected);
    }

    #[test]
    fn duplicate_ready_is_not_double_counted() {
        let (session, _rx) = test_session();
        session.recv_ready();
        assert!(session.ready_signal_received.load(Ordering::SeqCst));
        session.recv_ready(); // must not panic or flip state a second time
        assert!(session.ready_signal_received.load(Ordering::SeqCst));
    }

    #[test]
    fn close_is_idempotent() {
        let (session, mut rx) = test_session();
        session.close_with_reason("first");
        assert_eq!(session.state(), SessionState::Closed);
        // The CLOSE opcode is reserved and never emitted; nothing should be
        // queued for either call.
        assert!(rx.try_recv().is_err());

        session.close_with_reason("second"); // must be a no-op
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn ping_pong_round_trip_updates_rtt() {
        let (session, mut rx) = test_session();
        *session.system_channel.lock() = Some(Arc::new(Channel::new(None, crate::channel::ChannelMode::Reliable)));
        session.send_ping();
        let _ = rx.try_recv(); // pings go out over the data channel, not WS; nothing queued here
        assert_eq!(session.rtt().mean(), 0.0);
    }
}
