//! Close frame payloads (RFC 6455 Section 7.4)
//!
//! A close payload is empty, or a big-endian status code optionally followed
//! by UTF-8 reason text.

use std::fmt;

use thiserror::Error;

use super::frame::MAX_CONTROL_PAYLOAD;

/// Longest reason text that fits next to the 2-byte status code
pub const MAX_REASON_LEN: usize = MAX_CONTROL_PAYLOAD - 2;

/// Close status codes used by this endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CloseCode {
    /// 1000
    Normal,
    /// 1001
    GoingAway,
    /// 1002
    ProtocolError,
    /// 1003
    Unsupported,
    /// 1005, never sent on the wire
    NoStatus,
    /// 1007
    InvalidPayload,
    /// 1008
    PolicyViolation,
    /// 1009
    MessageTooBig,
    /// 1011
    InternalError,
    /// Any other code
    Other(u16),
}

impl CloseCode {
    pub fn as_u16(self) -> u16 {
        match self {
            Self::Normal => 1000,
            Self::GoingAway => 1001,
            Self::ProtocolError => 1002,
            Self::Unsupported => 1003,
            Self::NoStatus => 1005,
            Self::InvalidPayload => 1007,
            Self::PolicyViolation => 1008,
            Self::MessageTooBig => 1009,
            Self::InternalError => 1011,
            Self::Other(code) => code,
        }
    }

    /// Codes a peer may legitimately place in a close frame
    pub fn is_sendable(self) -> bool {
        matches!(self.as_u16(), 1000..=1003 | 1007..=1011 | 3000..=4999)
    }
}

impl From<u16> for CloseCode {
    fn from(code: u16) -> Self {
        match code {
            1000 => Self::Normal,
            1001 => Self::GoingAway,
            1002 => Self::ProtocolError,
            1003 => Self::Unsupported,
            1005 => Self::NoStatus,
            1007 => Self::InvalidPayload,
            1008 => Self::PolicyViolation,
            1009 => Self::MessageTooBig,
            1011 => Self::InternalError,
            other => Self::Other(other),
        }
    }
}

impl From<CloseCode> for u16 {
    fn from(code: CloseCode) -> Self {
        code.as_u16()
    }
}

impl fmt::Display for CloseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_u16())
    }
}

/// Status code and reason text carried by a close frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseReason {
    pub code: CloseCode,
    pub reason: String,
}

impl CloseReason {
    pub fn new(code: impl Into<CloseCode>, reason: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            reason: reason.into(),
        }
    }

    /// Parse a close frame payload
    ///
    /// An empty payload yields [`CloseCode::NoStatus`]. A 1005 that a peer put
    /// on the wire stays `Other(1005)` so it is not mistaken for an absent
    /// code. A 1-byte payload or a reason that is not UTF-8 is invalid.
    pub fn parse(payload: &[u8]) -> Result<Self, CloseParseError> {
        match payload.len() {
            0 => Ok(Self::new(CloseCode::NoStatus, "")),
            1 => Err(CloseParseError::TooShort),
            _ => {
                let code = match u16::from_be_bytes([payload[0], payload[1]]) {
                    1005 => CloseCode::Other(1005),
                    code => CloseCode::from(code),
                };
                let reason = std::str::from_utf8(&payload[2..])
                    .map_err(|_| CloseParseError::InvalidUtf8)?;
                Ok(Self::new(code, reason))
            }
        }
    }

    /// Encode as a close frame payload
    ///
    /// The reason is cut at a character boundary so the payload fits in a
    /// control frame.
    pub fn encode(&self) -> Vec<u8> {
        let reason = truncate_reason(&self.reason);
        let mut payload = Vec::with_capacity(2 + reason.len());
        payload.extend_from_slice(&self.code.as_u16().to_be_bytes());
        payload.extend_from_slice(reason.as_bytes());
        payload
    }

    /// Code to echo back when answering this close
    pub fn reply_code(&self) -> CloseCode {
        match self.code {
            CloseCode::NoStatus => CloseCode::Normal,
            code => code,
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.reason.is_empty() {
            write!(f, "{}", self.code)
        } else {
            write!(f, "{} ({})", self.code, self.reason)
        }
    }
}

/// Malformed close payloads
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CloseParseError {
    #[error("Close payload of 1 byte")]
    TooShort,
    #[error("Close reason is not valid UTF-8")]
    InvalidUtf8,
}

fn truncate_reason(reason: &str) -> &str {
    if reason.len() <= MAX_REASON_LEN {
        return reason;
    }
    let mut end = MAX_REASON_LEN;
    while !reason.is_char_boundary(end) {
        end -= 1;
    }
    &reason[..end]
}
