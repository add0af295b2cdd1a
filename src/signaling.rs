//! Binary, pipe-delimited ASCII signaling sub-protocol carried over the
//! WebSocket connection, before a peer connection exists to carry anything
//! else.
//!
//! Grounded in `session/session-ws.c`. Frames are `OPCODE` or
//! `OPCODE|payload`, ASCII, sent as WebSocket binary messages. Inbound
//! (client-to-server) frames carry a trailing NUL byte — an artifact of how
//! the browser client builds its outgoing buffer — which
//! `pomelo_webrtc_session_ws_process_message` strips by dispatching on
//! `message_length - 1` rather than `message_length`. We preserve that
//! exact accounting here rather than "fixing" it, since peers out in the
//! wild already send it.

use base64::engine::general_purpose::URL_SAFE as BASE64;
use base64::Engine;

use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientFrame {
    /// Connect token, base64-encoded by the client.
    Auth(Vec<u8>),
    /// SDP offer or answer.
    Description(String),
    /// A single ICE candidate.
    Candidate(String),
    /// All application + system channels have opened on the client side.
    Ready,
    Close(Option<String>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerFrame {
    /// Carries the client id the host assigned and the host's current clock,
    /// so the client can compute its own clock offset from the first reply.
    AuthOk { client_id: u64, server_time_ns: u64 },
    AuthFailed,
    Description(String),
    Candidate(String),
    /// Sent once the bridge's own channels (including the system channel)
    /// have all opened — the server-side half of the same READY handshake
    /// the client performs on its side.
    Ready,
    /// Sent once the session reaches CONNECTED.
    Connected,
    Close(Option<String>),
}

fn strip_trailing_nul(raw: &[u8]) -> &[u8] {
    match raw.last() {
        Some(0) => &raw[..raw.len() - 1],
        _ => raw,
    }
}

pub fn parse_client_frame(raw: &[u8]) -> Result<ClientFrame> {
    let trimmed = strip_trailing_nul(raw);
    let text = std::str::from_utf8(trimmed)
        .map_err(|_| Error::InputInvalid("signaling frame is not valid utf-8".into()))?;

    let mut parts = text.splitn(2, '|');
    let opcode = parts
        .next()
        .ok_or_else(|| Error::InputInvalid("empty signaling frame".into()))?;
    let rest = parts.next().unwrap_or("");

    match opcode {
        "AUTH" => {
            let token = BASE64
                .decode(rest)
                .map_err(|e| Error::InputInvalid(format!("bad AUTH base64: {e}")))?;
            Ok(ClientFrame::Auth(token))
        }
        "DESC" => Ok(ClientFrame::Description(rest.to_string())),
        "CAND" => Ok(ClientFrame::Candidate(rest.to_string())),
        "READY" => Ok(ClientFrame::Ready),
        "CLOSE" => Ok(ClientFrame::Close(
            (!rest.is_empty()).then(|| rest.to_string()),
        )),
        other => Err(Error::InputInvalid(format!("unknown opcode: {other}"))),
    }
}

/// Server-to-client frames are not NUL-terminated; that convention belongs
/// only to the browser client's outgoing buffer.
pub fn encode_server_frame(frame: &ServerFrame) -> Vec<u8> {
    match frame {
        ServerFrame::AuthOk {
            client_id,
            server_time_ns,
        } => format!("AUTH|OK|{client_id}|{server_time_ns}").into_bytes(),
        ServerFrame::AuthFailed => b"AUTH|FAILED".to_vec(),
        ServerFrame::Description(sdp) => format!("DESC|{sdp}").into_bytes(),
        ServerFrame::Candidate(candidate) => format!("CAND|{candidate}").into_bytes(),
        ServerFrame::Ready => b"READY".to_vec(),
        ServerFrame::Connected => b"CONN".to_vec(),
        ServerFrame::Close(None) => b"CLOSE".to_vec(),
        ServerFrame::Close(Some(reason)) => format!("CLOSE|{reason}").into_bytes(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_auth_with_trailing_nul() {
        let token = b"token-bytes";
        let encoded = BASE64.encode(token);
        let mut frame = format!("AUTH|{encoded}").into_bytes();
        frame.push(0); // the browser client's NUL terminator

        match parse_client_frame(&frame).unwrap() {
            ClientFrame::Auth(bytes) => assert_eq!(bytes, token),
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn parses_auth_without_trailing_nul() {
        let encoded = BASE64.encode(b"x");
        let frame = format!("AUTH|{encoded}").into_bytes();
        assert!(matches!(
            parse_client_frame(&frame).unwrap(),
            ClientFrame::Auth(_)
        ));
    }

    #[test]
    fn parses_payload_free_ready() {
        assert_eq!(parse_client_frame(b"READY\0").unwrap(), ClientFrame::Ready);
    }

    #[test]
    fn parses_description_and_candidate() {
        assert_eq!(
            parse_client_frame(b"DESC|v=0 sdp-body\0").unwrap(),
            ClientFrame::Description("v=0 sdp-body".to_string())
        );
        assert_eq!(
            parse_client_frame(b"CAND|candidate:1 1 udp\0").unwrap(),
            ClientFrame::Candidate("candidate:1 1 udp".to_string())
        );
    }

    #[test]
    fn close_without_reason_has_no_payload() {
        assert_eq!(
            parse_client_frame(b"CLOSE\0").unwrap(),
            ClientFrame::Close(None)
        );
        assert_eq!(
            parse_client_frame(b"CLOSE|bye\0").unwrap(),
            ClientFrame::Close(Some("bye".to_string()))
        );
    }

    #[test]
    fn rejects_unknown_opcode() {
        assert!(parse_client_frame(b"NOPE|x\0").is_err());
    }

    #[test]
    fn encodes_server_frames() {
        assert_eq!(
            encode_server_frame(&ServerFrame::AuthOk {
                client_id: 42,
                server_time_ns: 7,
            }),
            b"AUTH|OK|42|7"
        );
        assert_eq!(encode_server_frame(&ServerFrame::Connected), b"CONN");
        assert_eq!(
            encode_server_frame(&ServerFrame::Close(Some("done".into()))),
            b"CLOSE|done"
        );
    }
}
