//! Tunnel wire protocol.
//!
//! The tunnel carries length-prefixed frames ([`FrameCodec`]), each holding
//! one [`Envelope`] that pairs a UDP datagram with its original source
//! address and port.

mod envelope;
mod frame;

pub use envelope::{Envelope, ENVELOPE_HEADER_SIZE};
pub use frame::{FrameCodec, LENGTH_PREFIX_SIZE, MAX_FRAME_BODY};
