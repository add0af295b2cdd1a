//! System-channel ping/pong header-byte codec.
//!
//! Grounded in `session.c`'s `pomelo_webrtc_session_send_ping`,
//! `send_pong`, `process_ping` and `process_pong`. The header byte packs:
//!
//! ```text
//! bit:   7 6 | 5 4 3 | 2 1 0
//!        op  | seqw  | timew   (timew only meaningful for PONG)
//! ```
//!
//! `op` is 0 for PING, 1 for PONG. `seqw`/`timew` store `(width - 1)`, since
//! a packed width is always 1-8 and 3 bits only cover 0-7. The sequence (and,
//! for PONG, the socket receive time) immediately follow the header,
//! minimal-byte little-endian per [`crate::codec::packed`].

use crate::codec::packed::{packed_uint64_bytes, read_packed_uint64, write_packed_uint64};
use crate::error::{Error, Result};

const OPCODE_PING: u8 = 0;
const OPCODE_PONG: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemMessage {
    Ping { sequence: u64 },
    Pong { sequence: u64, time: u64 },
}

fn width_from_field(field: u8) -> usize {
    (field as usize & 0x07) + 1
}

fn field_from_width(width: usize) -> u8 {
    debug_assert!((1..=8).contains(&width));
    ((width - 1) & 0x07) as u8
}

pub fn encode_ping(sequence: u64) -> Vec<u8> {
    let seq_bytes = packed_uint64_bytes(sequence);
    let header = (OPCODE_PING << 6) | (field_from_width(seq_bytes) << 3);
    let mut out = vec![0u8; 1 + seq_bytes];
    out[0] = header;
    write_packed_uint64(&mut out[1..], sequence, seq_bytes);
    out
}

pub fn encode_pong(sequence: u64, time: u64) -> Vec<u8> {
    let seq_bytes = packed_uint64_bytes(sequence);
    let time_bytes = packed_uint64_bytes(time);
    let header = (OPCODE_PONG << 6) | (field_from_width(seq_bytes) << 3) | field_from_width(time_bytes);
    let mut out = vec![0u8; 1 + seq_bytes + time_bytes];
    out[0] = header;
    write_packed_uint64(&mut out[1..], sequence, seq_bytes);
    write_packed_uint64(&mut out[1 + seq_bytes..], time, time_bytes);
    out
}

/// Decodes a system-channel message, validating the reference
/// implementation's exact length bounds: `[2, 9]` for PING (header plus a
/// 1-8 byte sequence), `[3, 17]` for PONG (header plus a 1-8 byte sequence
/// plus a 1-8 byte time).
pub fn decode(frame: &[u8]) -> Result<SystemMessage> {
    let header = *frame
        .first()
        .ok_or_else(|| Error::InputInvalid("empty system message".into()))?;
    let opcode = header >> 6;
    let seq_bytes = width_from_field((header >> 3) & 0x07);

    match opcode {
        OPCODE_PING => {
            if !(2..=9).contains(&frame.len()) || frame.len() != 1 + seq_bytes {
                return Err(Error::InputInvalid(format!(
                    "malformed ping frame: len={}",
                    frame.len()
                )));
            }
            let sequence = read_packed_uint64(&frame[1..], seq_bytes);
            Ok(SystemMessage::Ping { sequence })
        }
        OPCODE_PONG => {
            let time_bytes = width_from_field(header & 0x07);
            if !(3..=17).contains(&frame.len()) || frame.len() != 1 + seq_bytes + time_bytes {
                return Err(Error::InputInvalid(format!(
                    "malformed pong frame: len={}",
                    frame.len()
                )));
            }
            let sequence = read_packed_uint64(&frame[1..], seq_bytes);
            let time = read_packed_uint64(&frame[1 + seq_bytes..], time_bytes);
            Ok(SystemMessage::Pong { sequence, time })
        }
        other => Err(Error::InputInvalid(format!("unknown system opcode {other}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ping_round_trips() {
        for sequence in [0u64, 1, 300, u16::MAX as u64, u64::MAX] {
            let frame = encode_ping(sequence);
            assert!((2..=9).contains(&frame.len()));
            assert_eq!(decode(&frame).unwrap(), SystemMessage::Ping { sequence });
        }
    }

    #[test]
    fn pong_round_trips() {
        for (sequence, time) in [(0u64, 0u64), (5, 70_000), (u64::MAX, u64::MAX)] {
            let frame = encode_pong(sequence, time);
            assert!((3..=17).contains(&frame.len()));
            assert_eq!(
                decode(&frame).unwrap(),
                SystemMessage::Pong { sequence, time }
            );
        }
    }

    #[test]
    fn rejects_truncated_frame() {
        let mut frame = encode_pong(70_000, 70_000);
        frame.truncate(frame.len() - 1);
        assert!(decode(&frame).is_err());
    }

    #[test]
    fn rejects_unknown_opcode() {
        let frame = vec![0b1100_0000u8, 0x00];
        assert!(decode(&frame).is_err());
    }

    #[test]
    fn rejects_empty_frame() {
        assert!(decode(&[]).is_err());
    }
}
