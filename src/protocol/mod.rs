//! Protocol module - wire format, framing, greeting and authentication.
//!
//! This module implements the binary IProto framing:
//! - MessagePack length prefix and header map encoding/decoding
//! - Frame buffer for accumulating partial reads
//! - Frame struct with typed accessors
//! - Server greeting parsing and chap-sha1 scramble

mod auth;
mod frame;
mod frame_buffer;
mod greeting;
mod wire_format;

pub use auth::{encode_auth_body, scramble, verify_scramble, CHAP_SHA1, SCRAMBLE_SIZE};
pub use frame::{build_frame, encode_packet, Frame};
pub use frame_buffer::{FrameBuffer, DEFAULT_BUFFER_CAPACITY};
pub use greeting::{encode_greeting, Greeting, SALT_SIZE};
pub use wire_format::{
    codes, decode_length, encode_length, keys, request_type, Header, DEFAULT_MAX_PAYLOAD_SIZE,
    GREETING_SIZE, LENGTH_PREFIX_SIZE,
};
