//! Encapsulation of a UDP datagram for transport through the tunnel.

use std::net::{Ipv4Addr, SocketAddrV4};

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{BridgeError, Result};

/// Fixed size of the address + port header.
pub const ENVELOPE_HEADER_SIZE: usize = 6;

/// A UDP datagram's original source address and port plus its payload.
///
/// Wire layout: 4-byte IPv4 address, 2-byte big-endian port, then the
/// payload. The payload carries no length tag of its own; the frame housing
/// the envelope already bounds it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// Source address and port of the original datagram.
    pub source: SocketAddrV4,
    /// Original datagram contents, opaque to the bridge.
    pub payload: Bytes,
}

impl Envelope {
    pub fn new(source: SocketAddrV4, payload: Bytes) -> Self {
        Self { source, payload }
    }

    /// Serializes the envelope into a frame body.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(ENVELOPE_HEADER_SIZE + self.payload.len());
        buf.put_slice(&self.source.ip().octets());
        buf.put_u16(self.source.port());
        buf.put(self.payload.clone());
        buf.freeze()
    }

    /// Parses a frame body back into an envelope.
    ///
    /// Returns [`BridgeError::TruncatedEnvelope`] if the body is shorter
    /// than the fixed header; nothing is extracted in that case.
    pub fn decode(body: &[u8]) -> Result<Self> {
        if body.len() < ENVELOPE_HEADER_SIZE {
            return Err(BridgeError::TruncatedEnvelope(body.len()));
        }

        let ip = Ipv4Addr::new(body[0], body[1], body[2], body[3]);
        let port = u16::from_be_bytes([body[4], body[5]]);

        Ok(Self {
            source: SocketAddrV4::new(ip, port),
            payload: Bytes::copy_from_slice(&body[ENVELOPE_HEADER_SIZE..]),
        })
    }
}
