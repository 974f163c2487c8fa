//! Bridges HDHomeRun LAN discovery across two networks over a TCP tunnel.
//!
//! Discovery uses UDP broadcast, which does not cross network segments. The
//! bridge runs one agent on each side of the divide:
//! - [`CaptureAgent`] on the client's network captures broadcast queries and
//!   tunnels them out.
//! - [`ResponderAgent`] on the device's network replays each query locally
//!   and tunnels every reply back to the original client address.
//!
//! The tunnel carries length-prefixed frames ([`FrameCodec`]), each holding
//! one [`Envelope`] pairing a datagram with its source address and port.

pub mod agent;
pub mod config;
pub mod diag;
pub mod error;
pub mod net;
pub mod protocol;

pub use agent::{CaptureAgent, ResponderAgent};
pub use config::{CaptureConfig, ResponderConfig};
pub use error::{BridgeError, Result};
pub use protocol::{Envelope, FrameCodec};
