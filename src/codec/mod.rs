// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The DNY frame codec (spec §4.1, §6.1).
//!
//! Stateless functions over byte buffers, grounded on the teacher's
//! [`FrameCodec`](crate) (`transport/tcp/frame_codec.rs`): an incremental
//! decode loop driven by a `ReadState` enum over an accumulating buffer. This
//! generalizes that length-prefixed shape to DNY's magic+length+body+
//! checksum framing and to the two non-DNY-framed pre-registration byte
//! sequences (raw ICCID, `"link"`).
//!
//! Unlike the teacher's `FrameCodec`, which owns its accumulation buffer,
//! this module is pure: [`decode`] takes a borrowed buffer and handshake
//! state and reports how many bytes it consumed, leaving the caller
//! ([`crate::transport::reader`]) to own buffering and I/O.

use crate::error::DecodeError;
use crate::registry::HandshakeState;

/// Wire framing magic (spec §6.1).
pub const MAGIC: &[u8; 3] = b"DNY";

/// Minimum body length: physicalID(4) + messageID(2) + command(1) + checksum(2).
pub const MIN_BODY_LEN: usize = 9;

/// Bytes counted by the `length` field after itself: physicalID(4) +
/// messageID(2) + command(1) + checksum(2) = 9, plus `|data|`.
const LENGTH_FIELD_OVERHEAD: usize = 9;

/// Bound on how far the resync scanner looks for the next magic occurrence
/// before giving up (spec §4.1, "the decoder may attempt to resync by
/// scanning forward for the magic"). Not named in the spec's config table;
/// a fixed constant is enough since resync only ever runs during the
/// handshake window against a small buffer.
pub const MAX_RESYNC_SCAN_BYTES: usize = 4096;

/// A decoded DNY frame (spec §3 "Frame", §6.1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub physical_id: u32,
    pub message_id: u16,
    pub command: u8,
    pub data: Vec<u8>,
}

impl Frame {
    pub fn new(physical_id: u32, message_id: u16, command: u8, data: Vec<u8>) -> Self {
        Self {
            physical_id,
            message_id,
            command,
            data,
        }
    }
}

/// One logical unit recognized off the wire (spec §4.1 "Decode contract").
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Unit {
    /// A fully framed DNY message.
    Frame(Frame),
    /// The 20-ASCII-digit ICCID recognized during the pre-registration
    /// handshake (spec §6.2).
    Iccid([u8; 20]),
    /// The literal ASCII `"link"` keep-alive (spec §6.2). Refreshes
    /// liveness; never dispatched as a command.
    Link,
}

/// Result of attempting to decode the next unit from the front of a buffer.
#[derive(Debug)]
pub enum DecodeOutcome {
    /// A full unit was recognized; `consumed` bytes should be drained from
    /// the front of the buffer.
    Unit { unit: Unit, consumed: usize },
    /// Not enough bytes buffered yet to make a decision. No bytes consumed.
    NeedMoreData,
    /// The buffer does not start with a recognizable unit, but a `"DNY"`
    /// magic was found `skip` bytes in. The caller should drop `skip` bytes
    /// and retry (handshake-window resync only, spec §4.1).
    Resync { skip: usize },
    /// Unrecoverable for this connection; the caller closes it.
    Error(DecodeError),
}

/// Attempts to decode exactly one logical unit from the front of `buf`
/// (spec §4.1 "Decode contract"). `max_packet_size` bounds a DNY frame's
/// `data` field (spec §6.3 `tcp.maxPacketSize`).
pub fn decode(buf: &[u8], handshake_state: HandshakeState, max_packet_size: usize) -> DecodeOutcome {
    if handshake_state == HandshakeState::Connected {
        if let Some(outcome) = try_decode_iccid(buf) {
            return outcome;
        }
    }
    if let Some(outcome) = try_decode_link(buf) {
        return outcome;
    }
    try_decode_frame(buf, handshake_state, max_packet_size)
}

fn try_decode_iccid(buf: &[u8]) -> Option<DecodeOutcome> {
    if buf.len() < 20 {
        // Deferred: a short all-digit prefix isn't decidable yet. Falling
        // through to the frame path's magic-mismatch resync/NeedMoreData
        // handling below covers this case without duplicating it here.
        return None;
    }
    if buf[..20].iter().all(|b| b.is_ascii_digit()) {
        let mut iccid = [0u8; 20];
        iccid.copy_from_slice(&buf[..20]);
        return Some(DecodeOutcome::Unit {
            unit: Unit::Iccid(iccid),
            consumed: 20,
        });
    }
    None
}

fn try_decode_link(buf: &[u8]) -> Option<DecodeOutcome> {
    if buf.len() < 4 {
        return None;
    }
    if &buf[..4] == b"link" {
        return Some(DecodeOutcome::Unit {
            unit: Unit::Link,
            consumed: 4,
        });
    }
    None
}

fn try_decode_frame(
    buf: &[u8],
    handshake_state: HandshakeState,
    max_packet_size: usize,
) -> DecodeOutcome {
    if buf.len() < 3 {
        return DecodeOutcome::NeedMoreData;
    }
    if &buf[..3] != MAGIC {
        if handshake_state == HandshakeState::Connected {
            return scan_for_magic(buf);
        }
        return DecodeOutcome::Error(DecodeError::HeaderMagic);
    }
    if buf.len() < 5 {
        return DecodeOutcome::NeedMoreData;
    }
    let length = u16::from_le_bytes([buf[3], buf[4]]) as usize;
    if length < LENGTH_FIELD_OVERHEAD || length - LENGTH_FIELD_OVERHEAD > max_packet_size {
        return DecodeOutcome::Error(DecodeError::LengthOutOfRange {
            len: length as u16,
            max: max_packet_size,
        });
    }
    let total_len = 3 + 2 + length; // magic + length field + everything length counts
    if buf.len() < total_len {
        return DecodeOutcome::NeedMoreData;
    }

    let body = &buf[5..total_len];
    let data_len = length - LENGTH_FIELD_OVERHEAD;
    let physical_id = u32::from_le_bytes([body[0], body[1], body[2], body[3]]);
    let message_id = u16::from_le_bytes([body[4], body[5]]);
    let command = body[6];
    let data = body[7..7 + data_len].to_vec();
    let checksum_bytes = &body[7 + data_len..7 + data_len + 2];
    let expected = u16::from_le_bytes([checksum_bytes[0], checksum_bytes[1]]);

    let actual = checksum(&buf[3..total_len - 2]);
    if actual != expected {
        return DecodeOutcome::Error(DecodeError::Checksum { expected, actual });
    }

    DecodeOutcome::Unit {
        unit: Unit::Frame(Frame::new(physical_id, message_id, command, data)),
        consumed: total_len,
    }
}

/// Scans forward (bounded by [`MAX_RESYNC_SCAN_BYTES`]) for the next
/// occurrence of the magic, used only while resyncing during the handshake
/// window (spec §4.1).
fn scan_for_magic(buf: &[u8]) -> DecodeOutcome {
    let bound = buf.len().min(MAX_RESYNC_SCAN_BYTES);
    for i in 1..bound.saturating_sub(2).max(1) {
        if i + 3 <= buf.len() && &buf[i..i + 3] == MAGIC {
            return DecodeOutcome::Resync { skip: i };
        }
    }
    if buf.len() >= MAX_RESYNC_SCAN_BYTES {
        DecodeOutcome::Error(DecodeError::HeaderMagic)
    } else {
        DecodeOutcome::NeedMoreData
    }
}

/// Arithmetic sum (mod 2^16) of every byte from the `length` field through
/// `data`, inclusive (spec §4.1 "Checksum"). `span` is `buf[3..12+N-1]` of
/// the full frame, i.e. length+physicalID+messageID+command+data.
pub fn checksum(span: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    for &b in span {
        sum = sum.wrapping_add(b as u32);
    }
    (sum & 0xFFFF) as u16
}

/// Recomputes `length` and `checksum` and serializes a [`Frame`] (spec §4.1
/// "Encode contract"). The caller never supplies length/checksum directly.
pub fn encode(frame: &Frame) -> Vec<u8> {
    let data_len = frame.data.len();
    let length = (LENGTH_FIELD_OVERHEAD + data_len) as u16;

    let mut out = Vec::with_capacity(5 + length as usize);
    out.extend_from_slice(MAGIC);
    out.extend_from_slice(&length.to_le_bytes());
    out.extend_from_slice(&frame.physical_id.to_le_bytes());
    out.extend_from_slice(&frame.message_id.to_le_bytes());
    out.push(frame.command);
    out.extend_from_slice(&frame.data);

    let cksum = checksum(&out[3..]);
    out.extend_from_slice(&cksum.to_le_bytes());
    out
}
