//! Thin wrapper over the `webrtc` crate's connection-construction API.
//!
//! Grounded in the `zortos293-GFNClient` peer setup (`MediaEngine::default`
//! + `register_default_codecs`, `APIBuilder`, `RTCIceServer`/
//! `RTCConfiguration`) and the closure-based callback style shared by that
//! file and `selkies-core`'s `WebRTCSession`. No media track or codec
//! negotiation is performed here — this bridge only ever carries data
//! channels — but `APIBuilder` still needs a populated `MediaEngine` to
//! construct, same as any other `webrtc` crate consumer.

use std::sync::Arc;

use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::RTCPeerConnection;

use crate::error::{Error, Result};

pub struct WebRtcFacade {
    api: API,
    ice_servers: Vec<RTCIceServer>,
}

impl WebRtcFacade {
    pub fn new(ice_server_urls: &[String]) -> Result<Self> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| Error::Internal(format!("failed to register codecs: {e}")))?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .map_err(|e| Error::Internal(format!("failed to register interceptors: {e}")))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let ice_servers = ice_server_urls
            .iter()
            .map(|url| RTCIceServer {
                urls: vec![url.clone()],
                ..Default::default()
            })
            .collect();

        Ok(WebRtcFacade { api, ice_servers })
    }

    pub async fn create_peer_connection(&self) -> Result<Arc<RTCPeerConnection>> {
        let config = RTCConfiguration {
            ice_servers: self.ice_servers.clone(),
            ..Default::default()
        };
        let pc = self
            .api
            .new_peer_connection(config)
            .await
            .map_err(|e| Error::Internal(format!("failed to create peer connection: {e}")))?;
        Ok(Arc::new(pc))
    }

    pub async fn create_data_channel(
        pc: &Arc<RTCPeerConnection>,
        label: &str,
        init: RTCDataChannelInit,
    ) -> Result<Arc<RTCDataChannel>> {
        pc.create_data_channel(label, Some(init))
            .await
            .map_err(|e| Error::Internal(format!("failed to create data channel {label}: {e}")))
    }
}
