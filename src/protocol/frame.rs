//! Length-prefixed framing for the tunnel byte stream.
//!
//! Each frame is a 2-byte big-endian length followed by exactly that many
//! body bytes. One codec instance transcodes one direction of the stream.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{BridgeError, Result};

/// Size of the length prefix in bytes.
pub const LENGTH_PREFIX_SIZE: usize = 2;

/// Largest body a frame can carry; bound by the 16-bit length prefix.
pub const MAX_FRAME_BODY: usize = u16::MAX as usize;

/// Stateful stream-to-message transcoder.
///
/// [`decode`](Self::decode) accepts arbitrarily fragmented chunks of the
/// stream in arrival order and invokes the callback exactly once per
/// complete frame body, never partially. The codec owns no transport.
#[derive(Debug)]
pub struct FrameCodec {
    length_bytes_remaining: usize,
    body_bytes_remaining: usize,
    body: BytesMut,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameCodec {
    pub fn new() -> Self {
        Self {
            length_bytes_remaining: LENGTH_PREFIX_SIZE,
            body_bytes_remaining: 0,
            body: BytesMut::new(),
        }
    }

    /// Prepends the big-endian length prefix to `body`.
    pub fn encode(body: &[u8]) -> Result<Bytes> {
        if body.len() > MAX_FRAME_BODY {
            return Err(BridgeError::FrameTooLarge(body.len()));
        }

        let mut buf = BytesMut::with_capacity(LENGTH_PREFIX_SIZE + body.len());
        buf.put_u16(body.len() as u16);
        buf.put_slice(body);
        Ok(buf.freeze())
    }

    /// Feeds one chunk of the stream into the codec, invoking `on_message`
    /// for every frame body it completes.
    pub fn decode(&mut self, chunk: &[u8], mut on_message: impl FnMut(Bytes)) {
        let mut i = 0;

        loop {
            // Accumulate the big-endian length prefix, possibly across calls.
            while self.length_bytes_remaining > 0 {
                if i >= chunk.len() {
                    return;
                }
                self.length_bytes_remaining -= 1;
                self.body_bytes_remaining |=
                    (chunk[i] as usize) << (self.length_bytes_remaining * 8);
                i += 1;
            }

            if self.body_bytes_remaining > 0 {
                let take = (chunk.len() - i).min(self.body_bytes_remaining);
                self.body.extend_from_slice(&chunk[i..i + take]);
                self.body_bytes_remaining -= take;
                i += take;
            }

            if self.body_bytes_remaining > 0 {
                return;
            }

            // Reset to "awaiting new frame" before the callback runs, so a
            // reentrant decode cannot observe a half-consumed frame.
            let message = self.body.split().freeze();
            self.length_bytes_remaining = LENGTH_PREFIX_SIZE;
            self.body_bytes_remaining = 0;

            on_message(message);
        }
    }
}
