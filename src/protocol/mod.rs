//! WebSocket wire protocol
//!
//! Pure, I/O-free pieces: frame codec, close payloads, opening handshake
//! validation and service pattern matching.

pub mod close;
pub mod frame;
pub mod handshake;
pub mod service;

pub use close::{CloseCode, CloseParseError, CloseReason};
pub use frame::{
    apply_mask, decode, decode_with_limit, encode, frame_len, Frame, FrameError, Opcode,
};
pub use handshake::{
    compute_accept_key, AcceptedHandshake, HandshakeRejection, HandshakeRequest,
    HandshakeValidator,
};
pub use service::{PatternError, ServicePattern};
