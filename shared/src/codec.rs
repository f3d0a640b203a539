//! Length-delimited framing for [`Packet`]s over a byte stream.
//!
//! Each frame is a 4-byte big-endian payload length followed by the
//! bincode-encoded packet. The decoder keeps whatever it could not consume,
//! so it can be fed straight from partial socket reads.

use crate::Packet;
use thiserror::Error;

/// Size of the length prefix in bytes.
pub const HEADER_LEN: usize = 4;

/// Largest payload a peer may announce before the stream is considered corrupt.
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed frame: {0}")]
    Malformed(#[source] bincode::Error),
    #[error("failed to encode packet: {0}")]
    Encode(#[source] bincode::Error),
    #[error("frame length {len} exceeds maximum of {max} bytes")]
    FrameTooLarge { len: usize, max: usize },
    #[error("stream is corrupted")]
    Corrupted,
}

impl ProtocolError {
    /// Fatal errors leave the stream unreadable; everything else only costs one frame.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ProtocolError::FrameTooLarge { .. } | ProtocolError::Corrupted
        )
    }
}

/// Serializes a packet into a complete frame, header included.
pub fn encode(packet: &Packet) -> Result<Vec<u8>, ProtocolError> {
    let payload = bincode::serialize(packet).map_err(ProtocolError::Encode)?;
    if payload.len() > MAX_FRAME_LEN {
        return Err(ProtocolError::FrameTooLarge {
            len: payload.len(),
            max: MAX_FRAME_LEN,
        });
    }

    let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Streaming frame decoder.
#[derive(Debug)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
    max_frame_len: usize,
    corrupted: bool,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::with_max_frame_len(MAX_FRAME_LEN)
    }

    pub fn with_max_frame_len(max_frame_len: usize) -> Self {
        Self {
            buffer: Vec::new(),
            max_frame_len,
            corrupted: false,
        }
    }

    /// Feeds a chunk and returns every frame completed by it, in order.
    ///
    /// A malformed payload yields one `Err` entry and decoding continues
    /// behind it. Once a fatal error is returned the decoder discards its
    /// buffer and every later call yields `Corrupted`.
    pub fn decode(&mut self, chunk: &[u8]) -> Vec<Result<Packet, ProtocolError>> {
        if self.corrupted {
            return vec![Err(ProtocolError::Corrupted)];
        }

        self.buffer.extend_from_slice(chunk);

        let mut packets = Vec::new();
        let mut consumed = 0;

        loop {
            let remaining = &self.buffer[consumed..];
            if remaining.len() < HEADER_LEN {
                break;
            }

            let len = u32::from_be_bytes([remaining[0], remaining[1], remaining[2], remaining[3]])
                as usize;
            if len > self.max_frame_len {
                self.corrupted = true;
                self.buffer.clear();
                packets.push(Err(ProtocolError::FrameTooLarge {
                    len,
                    max: self.max_frame_len,
                }));
                return packets;
            }

            if remaining.len() < HEADER_LEN + len {
                break;
            }

            let payload = &remaining[HEADER_LEN..HEADER_LEN + len];
            packets.push(bincode::deserialize::<Packet>(payload).map_err(ProtocolError::Malformed));
            consumed += HEADER_LEN + len;
        }

        self.buffer.drain(..consumed);
        packets
    }

    /// Bytes received but not yet part of a complete frame.
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_corrupted(&self) -> bool {
        self.corrupted
    }
}
