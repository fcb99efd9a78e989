//! Packet framing for the remote-serial debug protocol.
//!
//! A packet is `$<payload>#<cs>` where `cs` is the payload byte sum modulo
//! 256 as two lowercase hex digits. Replies may carry a leading `+`/`-`
//! acknowledgment unless no-ack mode has been negotiated.
use crate::interfaces::GdbError;

/// Interrupt byte sent outside of any frame.
pub const INTERRUPT: u8 = 0x03;
pub const ACK: u8 = b'+';
pub const NACK: u8 = b'-';

pub fn checksum(payload: &str) -> u8 {
    payload.bytes().fold(0u8, |acc, b| acc.wrapping_add(b))
}

pub fn encode(payload: &str) -> Vec<u8> {
    format!("${}#{:02x}", payload, checksum(payload)).into_bytes()
}

fn strip_ack(raw: &str) -> &str {
    raw.strip_prefix(['+', '-']).unwrap_or(raw)
}

/// Extracts the payload of a framed reply.
pub fn decode(raw: &str) -> Result<&str, GdbError> {
    let text = strip_ack(raw);
    let start = text.find('$');
    let end = text.rfind('#');
    match (start, end) {
        (Some(start), Some(end)) if start < end => Ok(&text[start + 1..end]),
        _ => Err(GdbError::ProtocolFraming(raw.to_string())),
    }
}

/// Like [`decode`], but returns the ack-stripped text unchanged when no
/// frame is present. Some stubs send urgent replies without framing.
pub fn decode_lenient(raw: &str) -> &str {
    decode(raw).unwrap_or_else(|_| strip_ack(raw))
}

/// Checks the two hex digits after the last `#` against the payload.
pub fn verify_checksum(raw: &str) -> Result<(), GdbError> {
    let payload = decode(raw)?;
    let text = strip_ack(raw);
    let hash = text.rfind('#').unwrap_or(text.len());
    let digits = text
        .get(hash + 1..hash + 3)
        .ok_or_else(|| GdbError::ProtocolFraming(raw.to_string()))?;
    let actual =
        u8::from_str_radix(digits, 16).map_err(|_| GdbError::ProtocolFraming(raw.to_string()))?;
    let expected = checksum(payload);
    if expected != actual {
        return Err(GdbError::ChecksumMismatch { expected, actual });
    }
    Ok(())
}

/// True once the buffer holds a `#` followed by at least two more bytes.
pub fn frame_complete(buf: &[u8]) -> bool {
    buf.iter()
        .rposition(|&b| b == b'#')
        .is_some_and(|idx| buf.len() >= idx + 3)
}

/// Length of the first complete `$...#xx` frame in `buf`, counting any ack
/// bytes before the `$`. Bytes after it belong to the next message.
pub fn frame_len(buf: &[u8]) -> Option<usize> {
    let start = buf.iter().position(|&b| b == b'$')?;
    let hash = buf[start..].iter().position(|&b| b == b'#')? + start;
    (buf.len() >= hash + 3).then_some(hash + 3)
}

/// Parses a little-endian hex string as sent for register values:
/// `78563412` is `0x12345678`.
pub fn hex_swap_u32(hex: &str) -> Option<u32> {
    if hex.is_empty() || hex.len() % 2 != 0 || hex.len() > 8 {
        return None;
    }
    let bytes = hex::decode(hex).ok()?;
    Some(bytes.iter().rev().fold(0u32, |acc, &b| (acc << 8) | u32::from(b)))
}
