//! MLLP framing for HL7 over TCP
//!
//! A frame on the wire is `<VT> payload <FS><CR>` (`0x0B`, payload, `0x1C 0x0D`).
//! [`MllpCodec`] plugs into `tokio_util::codec::Framed` for both directions:
//! - Bytes outside a frame are discarded (and logged)
//! - A frame that grows past the configured maximum without a terminator is
//!   reported once as [`Frame::Oversized`]; the decoder then skips input up to
//!   the next end marker and resynchronises instead of buffering without bound
//! - An empty frame (`<VT><FS><CR>`) is surfaced as [`Frame::KeepAlive`]

mod codec;
mod error;

pub use codec::{encode_frame, Frame, MllpCodec, DEFAULT_MAX_FRAME_LENGTH};
pub use error::MllpError;

/// Start-of-block marker (vertical tab)
pub const START_BLOCK: u8 = 0x0B;
/// End-of-block marker (file separator)
pub const END_BLOCK: u8 = 0x1C;
/// Trailer following the end-of-block marker
pub const CARRIAGE_RETURN: u8 = 0x0D;
