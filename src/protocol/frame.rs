//! WebSocket frame codec (RFC 6455 Section 5.2)
//!
//! Stateless translation between [`Frame`] values and their wire bytes.
//! Server-to-client frames are never masked; client-to-server frames are
//! always masked and are unmasked on decode.
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |F|R|R|R| opcode|M| Payload len |    Extended payload length    |
//! |I|S|S|S|  (4)  |A|     (7)     |             (16/64)           |
//! |N|V|V|V|       |S|             |   (if payload len==126/127)   |
//! +-+-+-+-+-------+-+-------------+ - - - - - - - - - - - - - - - +
//! |                 Masking-key (if MASK set to 1)                |
//! +---------------------------------------------------------------+
//! :                         Payload Data                          :
//! +---------------------------------------------------------------+
//! ```

use thiserror::Error;

/// FIN bit of the first header byte
const FIN_BIT: u8 = 0x80;

/// RSV1..RSV3 bits of the first header byte
const RSV_BITS: u8 = 0x70;

/// MASK bit of the second header byte
const MASK_BIT: u8 = 0x80;

/// Largest payload that fits in the 7-bit length field
pub const MAX_SHORT_PAYLOAD: usize = 125;

/// Length selector announcing a 16-bit extended length
const LEN_16_MARKER: u8 = 126;

/// Length selector announcing a 64-bit extended length
const LEN_64_MARKER: u8 = 127;

/// Control frames may never carry more than this many payload bytes
pub const MAX_CONTROL_PAYLOAD: usize = 125;

// ============================================================================
// Error Types
// ============================================================================

/// Errors produced while encoding or decoding frames
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("Frame type {0:?} cannot be encoded")]
    InvalidFrameType(Opcode),

    #[error("Unknown opcode 0x{0:X}")]
    InvalidOpcode(u8),

    #[error("Truncated frame: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },

    #[error("Client frame is not masked")]
    UnmaskedFrame,

    #[error("Reserved bits set without a negotiated extension")]
    ReservedBits,

    #[error("Fragmented frames are not supported")]
    Fragmented,

    #[error("Control frame payload of {0} bytes exceeds 125")]
    ControlFrameTooLong(usize),

    #[error("Invalid 64-bit payload length")]
    InvalidLength,

    #[error("Frame payload of {len} bytes exceeds limit of {max}")]
    FrameTooLarge { len: u64, max: usize },
}

impl FrameError {
    /// True for errors caused by peer input, as opposed to local misuse
    pub fn is_protocol_violation(&self) -> bool {
        !matches!(self, Self::InvalidFrameType(_))
    }
}

/// Result type for frame operations
pub type FrameResult<T> = Result<T, FrameError>;

// ============================================================================
// Opcode
// ============================================================================

/// Frame opcode (4 bits)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    Continuation = 0x0,
    Text = 0x1,
    Binary = 0x2,
    Close = 0x8,
    Ping = 0x9,
    Pong = 0xA,
}

impl Opcode {
    /// Close, Ping and Pong
    pub const fn is_control(self) -> bool {
        matches!(self, Self::Close | Self::Ping | Self::Pong)
    }

    /// Wire value of the opcode nibble
    pub const fn as_u8(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for Opcode {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x0 => Ok(Self::Continuation),
            0x1 => Ok(Self::Text),
            0x2 => Ok(Self::Binary),
            0x8 => Ok(Self::Close),
            0x9 => Ok(Self::Ping),
            0xA => Ok(Self::Pong),
            other => Err(FrameError::InvalidOpcode(other)),
        }
    }
}

// ============================================================================
// Frame
// ============================================================================

/// A single, always-final WebSocket frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Frame opcode
    pub opcode: Opcode,
    /// Unmasked payload bytes
    pub payload: Vec<u8>,
    /// Masking key the payload arrived with (client frames only)
    pub mask_key: Option<[u8; 4]>,
}

impl Frame {
    /// Create an unmasked frame
    pub fn new(opcode: Opcode, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            opcode,
            payload: payload.into(),
            mask_key: None,
        }
    }

    /// Encode this frame for sending to a client
    pub fn encode(&self) -> FrameResult<Vec<u8>> {
        encode(self.opcode, &self.payload)
    }
}

/// XOR `payload` in place with the repeating 4-byte mask key
pub fn apply_mask(payload: &mut [u8], key: [u8; 4]) {
    for (i, byte) in payload.iter_mut().enumerate() {
        *byte ^= key[i % 4];
    }
}

// ============================================================================
// Encoding
// ============================================================================

/// Encode an unmasked server-to-client frame with FIN set
pub fn encode(opcode: Opcode, payload: &[u8]) -> FrameResult<Vec<u8>> {
    if opcode == Opcode::Continuation {
        return Err(FrameError::InvalidFrameType(opcode));
    }
    if opcode.is_control() && payload.len() > MAX_CONTROL_PAYLOAD {
        return Err(FrameError::ControlFrameTooLong(payload.len()));
    }

    let len = payload.len();
    let mut out = Vec::with_capacity(header_len(len) + len);
    out.push(FIN_BIT | opcode.as_u8());

    if len <= MAX_SHORT_PAYLOAD {
        out.push(len as u8);
    } else if let Ok(short) = u16::try_from(len) {
        out.push(LEN_16_MARKER);
        out.extend_from_slice(&short.to_be_bytes());
    } else {
        out.push(LEN_64_MARKER);
        out.extend_from_slice(&(len as u64).to_be_bytes());
    }

    out.extend_from_slice(payload);
    Ok(out)
}

/// Unmasked header size for a payload of `len` bytes
fn header_len(len: usize) -> usize {
    if len <= MAX_SHORT_PAYLOAD {
        2
    } else if len <= u16::MAX as usize {
        4
    } else {
        10
    }
}

// ============================================================================
// Decoding
// ============================================================================

/// Parsed header of a client frame
#[derive(Debug, Clone, Copy)]
struct Header {
    opcode: Opcode,
    mask_key: [u8; 4],
    /// Offset of the first payload byte
    payload_start: usize,
    payload_len: usize,
}

/// Parse the header at the start of `buf`
///
/// Returns `Ok(None)` while the header is still incomplete.
fn parse_header(buf: &[u8], max_payload: usize) -> FrameResult<Option<Header>> {
    if buf.len() < 2 {
        return Ok(None);
    }

    let first = buf[0];
    let second = buf[1];

    if first & RSV_BITS != 0 {
        return Err(FrameError::ReservedBits);
    }
    let opcode = Opcode::try_from(first & 0x0F)?;
    if first & FIN_BIT == 0 || opcode == Opcode::Continuation {
        return Err(FrameError::Fragmented);
    }
    if second & MASK_BIT == 0 {
        return Err(FrameError::UnmaskedFrame);
    }

    let (declared, mut offset): (u64, usize) = match second & 0x7F {
        LEN_16_MARKER => {
            if buf.len() < 4 {
                return Ok(None);
            }
            (u64::from(u16::from_be_bytes([buf[2], buf[3]])), 4)
        }
        LEN_64_MARKER => {
            if buf.len() < 10 {
                return Ok(None);
            }
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&buf[2..10]);
            let len = u64::from_be_bytes(raw);
            if len & (1 << 63) != 0 {
                return Err(FrameError::InvalidLength);
            }
            (len, 10)
        }
        short => (u64::from(short), 2),
    };

    if opcode.is_control() && declared > MAX_CONTROL_PAYLOAD as u64 {
        return Err(FrameError::ControlFrameTooLong(declared as usize));
    }
    if declared > max_payload as u64 {
        return Err(FrameError::FrameTooLarge {
            len: declared,
            max: max_payload,
        });
    }

    if buf.len() < offset + 4 {
        return Ok(None);
    }
    let mut mask_key = [0u8; 4];
    mask_key.copy_from_slice(&buf[offset..offset + 4]);
    offset += 4;

    Ok(Some(Header {
        opcode,
        mask_key,
        payload_start: offset,
        payload_len: declared as usize,
    }))
}

/// Total wire length of the frame at the start of `buf`
///
/// `None` means more bytes are needed before the length is known. Callers
/// buffer until `buf.len()` reaches the returned length, then [`decode`].
pub fn frame_len(buf: &[u8], max_payload: usize) -> FrameResult<Option<usize>> {
    Ok(parse_header(buf, max_payload)?.map(|h| h.payload_start + h.payload_len))
}

/// Decode one complete masked client frame
///
/// Returns the frame and the number of bytes it occupied in `buf`.
pub fn decode(buf: &[u8]) -> FrameResult<(Frame, usize)> {
    decode_with_limit(buf, usize::MAX)
}

/// Decode one complete masked client frame, rejecting payloads over `max_payload`
pub fn decode_with_limit(buf: &[u8], max_payload: usize) -> FrameResult<(Frame, usize)> {
    let header = match parse_header(buf, max_payload)? {
        Some(header) => header,
        None => {
            return Err(FrameError::Truncated {
                needed: minimum_header_len(buf),
                available: buf.len(),
            })
        }
    };

    let end = header
        .payload_start
        .checked_add(header.payload_len)
        .ok_or(FrameError::InvalidLength)?;
    if buf.len() < end {
        return Err(FrameError::Truncated {
            needed: end,
            available: buf.len(),
        });
    }

    let mut payload = buf[header.payload_start..end].to_vec();
    apply_mask(&mut payload, header.mask_key);

    Ok((
        Frame {
            opcode: header.opcode,
            payload,
            mask_key: Some(header.mask_key),
        },
        end,
    ))
}

/// Smallest byte count that could hold the header already begun in `buf`
fn minimum_header_len(buf: &[u8]) -> usize {
    match buf.get(1).map(|b| b & 0x7F) {
        Some(LEN_16_MARKER) => 8,
        Some(LEN_64_MARKER) => 14,
        _ => 6,
    }
}
