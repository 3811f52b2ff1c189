//! Inbound side of a session: greeting and the lazy frame sequence.

use std::collections::VecDeque;

use tokio::io::{AsyncRead, AsyncReadExt};

use super::socket::BoxedReader;
use crate::error::Result;
use crate::protocol::{Frame, FrameBuffer, Greeting, GREETING_SIZE};

/// Read and parse the 128-byte server greeting.
pub async fn read_greeting<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Greeting> {
    let mut raw = [0u8; GREETING_SIZE];
    reader.read_exact(&mut raw).await?;
    Greeting::parse(&raw)
}

/// Yields inbound frames one at a time.
pub struct FrameReader {
    reader: BoxedReader,
    buffer: FrameBuffer,
    ready: VecDeque<Frame>,
    read_buf: Vec<u8>,
}

impl FrameReader {
    pub fn new(reader: BoxedReader, read_buffer_size: usize, max_payload_size: u32) -> Self {
        Self {
            reader,
            buffer: FrameBuffer::with_capacity_and_max_payload(read_buffer_size, max_payload_size),
            ready: VecDeque::new(),
            read_buf: vec![0u8; read_buffer_size.max(GREETING_SIZE)],
        }
    }

    /// Next complete frame, or `None` once the peer closed the socket.
    ///
    /// EOF in the middle of a frame is reported as an error.
    pub async fn next_frame(&mut self) -> Result<Option<Frame>> {
        loop {
            if let Some(frame) = self.ready.pop_front() {
                return Ok(Some(frame));
            }

            let n = self.reader.read(&mut self.read_buf).await?;
            if n == 0 {
                if !self.buffer.is_empty() {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        format!("Connection closed with {} unread bytes", self.buffer.len()),
                    )
                    .into());
                }
                return Ok(None);
            }

            self.ready.extend(self.buffer.push(&self.read_buf[..n])?);
        }
    }
}
