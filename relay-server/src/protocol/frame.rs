//! Wire frame codec
//!
//! Every unit on a cluster connection is a self-delimiting frame:
//!
//! ```text
//! | magic FF FF FF FF | content length u32 LE | message id i64 LE | payload |
//! ```
//!
//! `content length` covers the message id plus the payload, so it is never
//! below 8. A stream polluted with foreign bytes resynchronizes at the next
//! magic marker.

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Marker that opens every frame
pub const FRAME_MAGIC: [u8; 4] = [0xFF, 0xFF, 0xFF, 0xFF];

/// Magic plus content length
pub const HEADER_LEN: usize = 8;

/// Size of the message id that starts the content section
pub const MESSAGE_ID_LEN: usize = 8;

/// Default cap on the declared content length
pub const DEFAULT_MAX_FRAME_LEN: usize = 1_024_000;

/// Message id carried by keepalive frames
pub const KEEPALIVE_ID: i64 = 1;

/// Highest message id reserved for system frames (0 and 1)
pub const RESERVED_ID_MAX: i64 = 1;

/// First message id handed out to application frames
pub const FIRST_USER_ID: i64 = RESERVED_ID_MAX + 1;

/// Frame codec errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("Invalid frame: magic marker not found")]
    InvalidFrame,

    #[error("Frame too large: declared {declared} bytes, limit {limit}")]
    FrameTooLarge { declared: usize, limit: usize },

    #[error("Malformed frame: content length {0} is shorter than the message id")]
    MalformedFrame(usize),
}

pub type FrameResult<T> = std::result::Result<T, FrameError>;

/// One decoded frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub message_id: i64,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(message_id: i64, payload: impl Into<Bytes>) -> Self {
        Self {
            message_id,
            payload: payload.into(),
        }
    }

    /// Zero-length frame on the reserved keepalive id
    pub fn keepalive() -> Self {
        Self::new(KEEPALIVE_ID, Bytes::new())
    }

    pub fn is_keepalive(&self) -> bool {
        self.message_id == KEEPALIVE_ID && self.payload.is_empty()
    }

    /// Whether the id can be matched against an outstanding request
    pub fn is_correlatable(&self) -> bool {
        self.message_id > RESERVED_ID_MAX
    }

    pub fn encode(&self) -> Bytes {
        encode(self.message_id, &self.payload)
    }
}

/// Outcome of a single decode attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    /// The buffer holds no complete frame yet
    Incomplete,
    /// A frame was found; `consumed` includes any garbage skipped before it
    Frame { frame: Frame, consumed: usize },
}

/// Encode a frame into a fresh buffer
pub fn encode(message_id: i64, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(HEADER_LEN + MESSAGE_ID_LEN + payload.len());
    encode_into(&mut buf, message_id, payload);
    buf.freeze()
}

/// Append an encoded frame to `dst`
pub fn encode_into(dst: &mut BytesMut, message_id: i64, payload: &[u8]) {
    dst.reserve(HEADER_LEN + MESSAGE_ID_LEN + payload.len());
    dst.put_slice(&FRAME_MAGIC);
    dst.put_u32_le((MESSAGE_ID_LEN + payload.len()) as u32);
    dst.put_i64_le(message_id);
    dst.put_slice(payload);
}

/// Decode the first frame in `buf`
///
/// Never mutates its input; the returned payload is an owned copy so the
/// caller may advance or clear its receive buffer freely.
///
/// Garbage ending in `0xFF` or a content length whose low byte is `0xFF`
/// makes the marker run longer than four bytes. The latest marker in the
/// run is tried first, and earlier ones only when its header is oversized
/// or malformed. A content length whose two low bytes are both `0xFF` can
/// still be misread when the shifted length happens to fit the cap.
pub fn decode(buf: &[u8], max_frame_len: usize) -> FrameResult<Decoded> {
    if buf.is_empty() {
        return Ok(Decoded::Incomplete);
    }

    let first = match find_magic(buf) {
        Some(pos) => pos,
        // A marker split across reads is still pending
        None if partial_magic_suffix(buf) => return Ok(Decoded::Incomplete),
        None => return Err(FrameError::InvalidFrame),
    };

    let run = buf[first..].iter().take_while(|&&b| b == 0xFF).count();
    let last = first + run - FRAME_MAGIC.len();

    let mut result = decode_at(buf, last, max_frame_len);
    for start in (first..last).rev() {
        if result.is_ok() {
            break;
        }
        result = decode_at(buf, start, max_frame_len);
    }
    result
}

/// Decode a frame whose marker starts at `start`
fn decode_at(buf: &[u8], start: usize, max_frame_len: usize) -> FrameResult<Decoded> {
    let body = &buf[start..];
    if body.len() < HEADER_LEN {
        return Ok(Decoded::Incomplete);
    }

    let content_len = u32::from_le_bytes([body[4], body[5], body[6], body[7]]) as usize;
    if content_len > max_frame_len {
        return Err(FrameError::FrameTooLarge {
            declared: content_len,
            limit: max_frame_len,
        });
    }
    if content_len < MESSAGE_ID_LEN {
        return Err(FrameError::MalformedFrame(content_len));
    }

    let frame_len = HEADER_LEN + content_len;
    if body.len() < frame_len {
        return Ok(Decoded::Incomplete);
    }

    let mut id = [0u8; MESSAGE_ID_LEN];
    id.copy_from_slice(&body[HEADER_LEN..HEADER_LEN + MESSAGE_ID_LEN]);
    let payload = Bytes::copy_from_slice(&body[HEADER_LEN + MESSAGE_ID_LEN..frame_len]);

    Ok(Decoded::Frame {
        frame: Frame {
            message_id: i64::from_le_bytes(id),
            payload,
        },
        consumed: start + frame_len,
    })
}

fn find_magic(buf: &[u8]) -> Option<usize> {
    buf.windows(FRAME_MAGIC.len())
        .position(|window| window == FRAME_MAGIC)
}

/// True when the buffer ends with 1..=3 marker bytes
fn partial_magic_suffix(buf: &[u8]) -> bool {
    let tail = buf.len().min(FRAME_MAGIC.len() - 1);
    (1..=tail).any(|n| buf[buf.len() - n..] == FRAME_MAGIC[..n])
}
