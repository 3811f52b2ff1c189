//! Frame buffer for accumulating partial reads.
//!
//! Uses `bytes::BytesMut` for zero-copy buffer management.
//! Implements a state machine for handling fragmented frames:
//! - `WaitingForLength`: Need the complete MessagePack length prefix
//! - `WaitingForPacket`: Length parsed, need N more bytes of header + body
//!
//! # Example
//!
//! ```ignore
//! use iproto_client::protocol::FrameBuffer;
//!
//! let mut buffer = FrameBuffer::new();
//!
//! // Data arrives in chunks from socket
//! let frames = buffer.push(&chunk)?;
//!
//! for frame in frames {
//!     println!("Got frame with sync: {}", frame.sync());
//! }
//! ```

use bytes::BytesMut;

use super::wire_format::{decode_length, DEFAULT_MAX_PAYLOAD_SIZE};
use super::Frame;
use crate::error::{Error, Result};

/// Default initial buffer capacity (64 KB).
pub const DEFAULT_BUFFER_CAPACITY: usize = 64 * 1024;

/// State machine for frame parsing.
#[derive(Debug, Clone, Copy)]
enum State {
    /// Waiting for a complete length prefix.
    WaitingForLength,
    /// Prefix consumed, waiting for `len` packet bytes.
    WaitingForPacket { len: usize },
}

/// Buffer for accumulating incoming bytes and extracting complete frames.
///
/// Uses a state machine to handle partial reads efficiently.
/// All data is stored in a single `BytesMut` buffer to minimize allocations.
pub struct FrameBuffer {
    /// Accumulated bytes from socket reads.
    buffer: BytesMut,
    /// Current parsing state.
    state: State,
    /// Maximum allowed packet size.
    max_payload_size: u32,
}

impl FrameBuffer {
    /// Create a new frame buffer with default settings.
    ///
    /// Default capacity: 64KB, max payload: 1GB.
    pub fn new() -> Self {
        Self::with_capacity_and_max_payload(DEFAULT_BUFFER_CAPACITY, DEFAULT_MAX_PAYLOAD_SIZE)
    }

    /// Create a new frame buffer with custom capacity and max payload.
    pub fn with_capacity_and_max_payload(capacity: usize, max_payload_size: u32) -> Self {
        Self {
            buffer: BytesMut::with_capacity(capacity),
            state: State::WaitingForLength,
            max_payload_size,
        }
    }

    /// Push data into the buffer and extract all complete frames.
    ///
    /// Returns a vector of complete frames (possibly empty). Partial data is
    /// kept for the next push.
    ///
    /// # Errors
    ///
    /// Returns error if a packet exceeds `max_payload_size` or its header
    /// cannot be decoded.
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<Frame>> {
        self.buffer.extend_from_slice(data);

        let mut frames = Vec::new();
        while let Some(frame) = self.try_extract_one()? {
            frames.push(frame);
        }

        Ok(frames)
    }

    /// Try to extract a single frame from the buffer.
    fn try_extract_one(&mut self) -> Result<Option<Frame>> {
        loop {
            match self.state {
                State::WaitingForLength => {
                    let Some((prefix_len, len)) = decode_length(&self.buffer)? else {
                        return Ok(None);
                    };

                    if len > u64::from(self.max_payload_size) {
                        return Err(Error::Protocol(format!(
                            "Payload size {} exceeds maximum {}",
                            len, self.max_payload_size
                        )));
                    }

                    let _ = self.buffer.split_to(prefix_len);
                    // Bounded by max_payload_size (u32) above.
                    self.state = State::WaitingForPacket { len: len as usize };
                }

                State::WaitingForPacket { len } => {
                    if self.buffer.len() < len {
                        return Ok(None);
                    }

                    let packet = self.buffer.split_to(len).freeze();
                    self.state = State::WaitingForLength;

                    return Frame::parse(packet).map(Some);
                }
            }
        }
    }

    /// Get the number of buffered bytes.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Check if the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Clear the buffer and reset state.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.state = State::WaitingForLength;
    }

    #[cfg(test)]
    fn state_name(&self) -> &'static str {
        match &self.state {
            State::WaitingForLength => "WaitingForLength",
            State::WaitingForPacket { .. } => "WaitingForPacket",
        }
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}
