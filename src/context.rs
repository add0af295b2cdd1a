//! Process-wide context: the one aggregate of shared state every request
//! handler is given.
//!
//! Grounded in `context.c`'s `pomelo_webrtc_context_create` (which wires
//! every WS/PC/DC callback and owns the socket map) and the teacher's
//! `RelayState` aggregate passed to every `axum` handler via `State`.
//! `rtc_log_handler` from the original is not carried over — `tracing` is
//! the ambient logging story for this whole crate (§10 of the expanded
//! spec), so there is no separate log-handler registration step here.

use std::sync::Arc;

use crate::config::Config;
use crate::host::{HostFacade, InProcessHost};
use crate::socket::Socket;
use crate::task::Dispatcher;
use crate::webrtc_facade::WebRtcFacade;

pub struct Context {
    pub dispatcher: Arc<Dispatcher>,
    pub socket: Arc<Socket>,
    pub host: Arc<dyn HostFacade>,
    pub config: Config,
}

impl Context {
    pub fn new(config: Config) -> crate::error::Result<Arc<Self>> {
        let dispatcher = Dispatcher::start();
        let host: Arc<dyn HostFacade> = Arc::new(InProcessHost::new(config.clone()));
        let webrtc = Arc::new(WebRtcFacade::new(&config.ice_servers)?);
        let socket = Socket::new(dispatcher.clone(), host.clone(), webrtc, config.clone());

        Ok(Arc::new(Context {
            dispatcher,
            socket,
            host,
            config,
        }))
    }

    /// Drains and closes every live session, then stops the loop thread.
    /// Called once, from the Ctrl-C / SIGTERM handler in `main`.
    pub fn shutdown(&self) {
        self.socket.close();
        self.dispatcher.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_with_default_config() {
        let context = Context::new(Config::default()).unwrap();
        assert_eq!(context.socket.session_count(), 0);
        context.shutdown();
    }
}
