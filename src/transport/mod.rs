//! Transport module - socket connect, greeting, and inbound frame stream.
//!
//! Provides:
//! - TCP and Unix Domain Socket connect with a single timeout
//! - Greeting read
//! - [`FrameReader`] yielding inbound frames

mod reader;
mod socket;

pub use reader::{read_greeting, FrameReader};
pub use socket::{BoxedReader, BoxedWriter, Endpoint, Transport};
