//! Wire protocols: the local remote-control protocol, the internal peer
//! protocol, and the collaboration bus protocol. All three share the same
//! length-prefixed binary framing specified in §6.1–§6.3: a big-endian `u16`
//! length followed by a hand-rolled binary payload (see [`framing`]). JSON is
//! used only where the protocol explicitly carries a JSON string field (the
//! `goals`/`environment` fields of [`control::ControlRequest`]), never for
//! the message envelope itself.

pub mod collab;
pub mod control;
pub mod framing;
pub mod internal;

use thiserror::Error;

/// Errors raised while encoding or decoding a wire message.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The buffer ended before a complete frame could be read.
    #[error("truncated frame")]
    Truncated,

    /// The declared frame length exceeded [`framing::MAX_FRAME_LEN`].
    #[error("frame of {0} bytes exceeds the maximum frame size")]
    FrameTooLarge(usize),

    /// A tagged enum's discriminant byte did not match a known variant.
    #[error("unknown message variant tag {0}")]
    UnknownVariant(u8),

    /// A length-prefixed string field was not valid UTF-8.
    #[error("string field is not valid UTF-8")]
    InvalidUtf8,

    /// The underlying transport failed.
    #[error("transport error: {0}")]
    Io(#[from] std::io::Error),
}
