use std::io;
use thiserror::Error;

/// Errors produced by the bridge.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// IO error
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// Frame body too large for the 16-bit length prefix
    #[error("frame body of {0} bytes exceeds the 16-bit length prefix")]
    FrameTooLarge(usize),

    /// Envelope body shorter than the fixed address/port header
    #[error("envelope body of {0} bytes is shorter than the 6-byte header")]
    TruncatedEnvelope(usize),

    /// Peer hostname did not resolve
    #[error("peer host did not resolve: {0}")]
    UnresolvedHost(String),

    /// Discovery packet decode error
    #[error("packet decode error: {0}")]
    PacketDecode(String),
}

pub type Result<T> = std::result::Result<T, BridgeError>;
