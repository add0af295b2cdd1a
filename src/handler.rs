//! WebSocket connection handler: the signaling transport for one browser
//! peer.
//!
//! Grounded in the teacher's `ws_handler`/`handle_websocket` split
//! (`sender_task` draining an outbound `mpsc` channel while the main loop
//! reads inbound frames), adapted from JSON text frames to the binary
//! pipe-delimited protocol in [`crate::signaling`]. Malformed-frame
//! handling follows §7's taxonomy: drop pre-auth and post-connect, close
//! the session if it happens mid-handshake (a state transient enough that
//! a malformed frame there is far more likely to indicate a confused or
//! hostile peer than a harmless out-of-order message).

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{ConnectInfo, State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::context::Context;
use crate::session::{Session, SessionState};
use crate::signaling::{self, ClientFrame};

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(context): State<Arc<Context>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_websocket(socket, context, addr))
}

pub async fn handle_websocket(socket: WebSocket, context: Arc<Context>, addr: SocketAddr) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();

    let session = context.socket.create_session(tx);
    session.set_address(addr.to_string());

    let sender_task = tokio::spawn(async move {
        while let Some(bytes) = rx.recv().await {
            if ws_sender.send(Message::Binary(bytes)).await.is_err() {
                break;
            }
        }
    });

    while let Some(msg_result) = ws_receiver.next().await {
        match msg_result {
            Ok(Message::Binary(bytes)) => handle_inbound_frame(&session, &bytes),
            Ok(Message::Close(_)) => break,
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) | Ok(Message::Text(_)) => {
                // The signaling protocol is binary-only; a stray text/ping
                // frame is ignored rather than treated as malformed, since
                // axum already answers protocol-level pings itself.
            }
            Err(e) => {
                warn!(session = %session.id, error = %e, "websocket error");
                break;
            }
        }
    }

    session.close_with_reason("websocket connection closed");
    context.socket.remove_session(session.id);
    sender_task.abort();
}

fn handle_inbound_frame(session: &Arc<Session>, bytes: &[u8]) {
    match signaling::parse_client_frame(bytes) {
        Ok(frame) => dispatch_frame(session, frame),
        // An error the taxonomy marks fatal closes the session regardless of
        // phase; a merely malformed frame falls back to the per-phase policy
        // below.
        Err(e) if e.is_fatal_to_session() => {
            session.close_with_reason(&format!("malformed signaling frame: {e}"));
        }
        Err(e) => match session.state() {
            SessionState::Init | SessionState::Connected => {
                debug!(session = %session.id, error = %e, "dropped malformed signaling frame");
            }
            _ => session.close_with_reason(&format!("malformed signaling frame: {e}")),
        },
    }
}

fn dispatch_frame(session: &Arc<Session>, frame: ClientFrame) {
    match frame {
        ClientFrame::Auth(token) => session.recv_auth(token),
        ClientFrame::Description(sdp) => session.recv_description(sdp),
        ClientFrame::Candidate(candidate) => session.recv_candidate(candidate),
        ClientFrame::Ready => session.recv_ready(),
        ClientFrame::Close(reason) => {
            session.close_with_reason(reason.as_deref().unwrap_or("closed by peer"))
        }
    }
}
