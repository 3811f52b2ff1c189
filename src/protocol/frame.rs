//! Frame struct with typed accessors.
//!
//! A frame is one complete packet with the length prefix stripped: the
//! decoded header plus the raw body bytes. The body is kept as
//! `bytes::Bytes` so it can be handed to the codec without copying.
//!
//! # Example
//!
//! ```
//! use iproto_client::protocol::{build_frame, request_type, Frame, Header, LENGTH_PREFIX_SIZE};
//! use bytes::Bytes;
//!
//! let header = Header::new(request_type::PING, 7);
//! let bytes = build_frame(&header, &[]).unwrap();
//! let frame = Frame::parse(Bytes::copy_from_slice(&bytes[LENGTH_PREFIX_SIZE..])).unwrap();
//!
//! assert_eq!(frame.sync(), 7);
//! assert!(frame.body().is_empty());
//! ```

use bytes::Bytes;

use super::wire_format::{encode_length, Header, LENGTH_PREFIX_SIZE};
use crate::error::{Error, Result};

/// A complete protocol frame.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Decoded header.
    pub header: Header,
    /// Body bytes following the header map (may be empty).
    pub body: Bytes,
}

impl Frame {
    /// Create a new frame from header and body.
    pub fn new(header: Header, body: Bytes) -> Self {
        Self { header, body }
    }

    /// Parse a packet (header map followed by the body) into a frame.
    pub fn parse(packet: Bytes) -> Result<Self> {
        let mut cursor: &[u8] = &packet;
        let header = Header::decode(&mut cursor)?;
        let consumed = packet.len() - cursor.len();
        Ok(Self {
            header,
            body: packet.slice(consumed..),
        })
    }

    /// Get a reference to the body bytes.
    #[inline]
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Get the correlation id.
    #[inline]
    pub fn sync(&self) -> u64 {
        self.header.sync
    }

    /// Get the response code.
    #[inline]
    pub fn code(&self) -> u32 {
        self.header.code
    }

    /// Get the schema version the server stamped on this frame.
    #[inline]
    pub fn schema_version(&self) -> u64 {
        self.header.schema_version
    }

    /// Check if this is an error response.
    #[inline]
    pub fn is_error(&self) -> bool {
        self.header.is_error()
    }

    /// Check if this is an in-band push chunk.
    #[inline]
    pub fn is_chunk(&self) -> bool {
        self.header.is_chunk()
    }

    /// Check if this is a watcher event.
    #[inline]
    pub fn is_event(&self) -> bool {
        self.header.is_event()
    }
}

/// Encode header and body into a packet without the length prefix.
///
/// The writer task prepends the prefix itself, see
/// [`OutboundFrame`](crate::writer::OutboundFrame).
pub fn encode_packet(header: &Header, body: &[u8]) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(16 + body.len());
    header.encode_into(&mut buf)?;
    buf.extend_from_slice(body);
    Ok(buf)
}

/// Build a complete frame (length prefix, header, body) as a single buffer.
pub fn build_frame(header: &Header, body: &[u8]) -> Result<Vec<u8>> {
    let packet = encode_packet(header, body)?;
    let len = u32::try_from(packet.len())
        .map_err(|_| Error::Protocol(format!("Packet of {} bytes is too large", packet.len())))?;

    let mut buf = Vec::with_capacity(LENGTH_PREFIX_SIZE + packet.len());
    buf.extend_from_slice(&encode_length(len));
    buf.extend_from_slice(&packet);
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::wire_format::{codes, request_type};

    #[test]
    fn test_parse_splits_header_and_body() {
        let header = Header::new(codes::OK, 42).with_schema_version(3);
        let body = [0x81, 0x30, 0x90]; // {DATA: []}
        let packet = encode_packet(&header, &body).unwrap();

        let frame = Frame::parse(Bytes::from(packet)).unwrap();
        assert_eq!(frame.sync(), 42);
        assert_eq!(frame.code(), codes::OK);
        assert_eq!(frame.schema_version(), 3);
        assert_eq!(frame.body(), &body);
    }

    #[test]
    fn test_parse_empty_body() {
        let packet = encode_packet(&Header::new(codes::OK, 1), &[]).unwrap();
        let frame = Frame::parse(Bytes::from(packet)).unwrap();
        assert!(frame.body().is_empty());
    }

    #[test]
    fn test_parse_body_is_zero_copy() {
        let packet = Bytes::from(encode_packet(&Header::new(codes::OK, 1), b"\x90").unwrap());
        let frame = Frame::parse(packet.clone()).unwrap();
        let offset = packet.len() - 1;
        assert_eq!(frame.body.as_ptr(), packet[offset..].as_ptr());
    }

    #[test]
    fn test_frame_flag_accessors() {
        let error = Frame::new(
            Header::new(codes::ERROR_FLAG | codes::ER_LOADING, 1),
            Bytes::new(),
        );
        assert!(error.is_error());
        assert!(!error.is_chunk());

        let chunk = Frame::new(Header::new(codes::CHUNK, 1), Bytes::new());
        assert!(chunk.is_chunk());

        let event = Frame::new(Header::new(codes::EVENT, 0), Bytes::new());
        assert!(event.is_event());
        assert!(!event.is_error());
    }

    #[test]
    fn test_build_frame_prefix() {
        let bytes = build_frame(&Header::new(request_type::PING, 1), &[]).unwrap();
        // header map {0: 64, 1: 1} is 5 bytes
        assert_eq!(&bytes[..LENGTH_PREFIX_SIZE], &[0xce, 0, 0, 0, 5]);
        assert_eq!(bytes.len(), LENGTH_PREFIX_SIZE + 5);
    }

    #[test]
    fn test_build_frame_roundtrip() {
        use super::super::FrameBuffer;

        let header = Header::new(request_type::SELECT, 456).with_stream_id(9);
        let body = [0x81, 0x10, 0xcd, 0x02, 0x00]; // {SPACE_ID: 512}
        let bytes = build_frame(&header, &body).unwrap();

        let mut buffer = FrameBuffer::new();
        let frames = buffer.push(&bytes).unwrap();

        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].header, header);
        assert_eq!(frames[0].body(), &body);
    }
}
