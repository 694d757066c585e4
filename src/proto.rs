//! Wire framing (§3, §4.B).
//!
//! A frame is a 1-byte command tag followed by a 2-byte little-endian
//! unsigned payload length, followed by that many payload bytes. There is no
//! padding between the two header fields and no other framing layer (no
//! newline terminators, no separate length prefix on top of this one).

/// Size of the fixed header: one tag byte, two length bytes.
pub const HEADER_LEN: usize = 3;

/// Largest payload a single frame can carry; the length field is 16 bits.
pub const MAX_PAYLOAD: usize = u16::MAX as usize;

/// Tags sent client → server. Only valid while the connection is in the
/// state(s) listed in the dispatch table in §4.C.
pub mod client_tag {
    pub const APP_PATH: u8 = b'A';
    pub const COMMAND_LINE: u8 = b'C';
    pub const WORK_DIR: u8 = b'W';
    pub const EXECUTE: u8 = b'E';
    pub const STDIN: u8 = b'I';
}

/// Tags sent server → client.
pub mod server_tag {
    pub const STDOUT: u8 = b'O';
    pub const STDERR: u8 = b'E';
    pub const EXIT: u8 = b'X';
}

/// A frame header view decoded from the front of a buffer, without copying
/// the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub tag: u8,
    pub payload_len: usize,
}

/// Total on-wire size of a frame carrying `payload_len` bytes.
pub fn encoded_len(payload_len: usize) -> usize {
    HEADER_LEN + payload_len
}

/// Attempts to decode a frame header from the front of `buf`.
///
/// Returns `None` if `buf` does not yet hold a complete header, or holds a
/// header but not the full payload (§3: "A frame is decoded only when
/// `used >= 3 + payload_length`"). Never consumes anything; callers slice
/// the payload out themselves and then advance past `encoded_len`.
pub fn peek_frame(buf: &[u8]) -> Option<FrameHeader> {
    if buf.len() < HEADER_LEN {
        return None;
    }
    let payload_len = u16::from_le_bytes([buf[1], buf[2]]) as usize;
    if buf.len() < encoded_len(payload_len) {
        return None;
    }
    Some(FrameHeader {
        tag: buf[0],
        payload_len,
    })
}

/// Appends a complete frame (header + payload) to `out`.
///
/// `payload.len()` must be `<= MAX_PAYLOAD`; this is an invariant enforced by
/// callers (the send path never constructs an oversized frame; see
/// `connection::Connection::queue_frame`).
pub fn encode_frame(out: &mut Vec<u8>, tag: u8, payload: &[u8]) {
    debug_assert!(payload.len() <= MAX_PAYLOAD);
    out.push(tag);
    out.extend_from_slice(&(payload.len() as u16).to_le_bytes());
    out.extend_from_slice(payload);
}

/// Signed 32-bit little-endian exit code payload used by the `X` frame.
pub fn encode_exit_code(code: i32) -> [u8; 4] {
    code.to_le_bytes()
}

/// Decodes an `X` frame's 4-byte payload. Returns `None` if the payload isn't
/// exactly 4 bytes, which is a protocol error at the call site.
pub fn decode_exit_code(payload: &[u8]) -> Option<i32> {
    let bytes: [u8; 4] = payload.try_into().ok()?;
    Some(i32::from_le_bytes(bytes))
}
