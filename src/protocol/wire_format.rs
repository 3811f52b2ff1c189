//! Wire format encoding and decoding.
//!
//! Every packet on the wire is laid out as:
//! ```text
//! ┌──────────────┬─────────────────────┬──────────────────┐
//! │ Length       │ Header              │ Body             │
//! │ MP_UINT      │ MP_MAP              │ MP_MAP, optional │
//! │ 0xCE + u32 BE│ code/sync/schema/.. │ request fields   │
//! └──────────────┴─────────────────────┴──────────────────┘
//! ```
//!
//! The length covers header and body. The client always writes the 5-byte
//! `0xCE` form; the reader accepts any MessagePack unsigned integer.

use rmpv::Value;

use crate::error::{Error, Result};

/// Size of the length prefix written by the client (`0xCE` + u32 BE).
pub const LENGTH_PREFIX_SIZE: usize = 5;

/// Size of the server greeting sent right after the socket is accepted.
pub const GREETING_SIZE: usize = 128;

/// Default maximum packet size (1 GB).
pub const DEFAULT_MAX_PAYLOAD_SIZE: u32 = 1_073_741_824;

/// Header and body map keys.
pub mod keys {
    pub const CODE: u8 = 0x00;
    pub const SYNC: u8 = 0x01;
    pub const SCHEMA_VERSION: u8 = 0x05;
    pub const STREAM_ID: u8 = 0x0a;

    pub const SPACE_ID: u8 = 0x10;
    pub const INDEX_ID: u8 = 0x11;
    pub const LIMIT: u8 = 0x12;
    pub const OFFSET: u8 = 0x13;
    pub const ITERATOR: u8 = 0x14;
    pub const KEY: u8 = 0x20;
    pub const TUPLE: u8 = 0x21;
    pub const FUNCTION_NAME: u8 = 0x22;
    pub const USER_NAME: u8 = 0x23;
    pub const EXPR: u8 = 0x27;
    pub const OPS: u8 = 0x28;

    pub const DATA: u8 = 0x30;
    pub const ERROR_24: u8 = 0x31;

    pub const TIMEOUT: u8 = 0x56;
    pub const EVENT_KEY: u8 = 0x57;
    pub const EVENT_DATA: u8 = 0x58;
    pub const TXN_ISOLATION: u8 = 0x59;
}

/// Request type codes (the `CODE` header field of outgoing packets).
pub mod request_type {
    pub const SELECT: u32 = 1;
    pub const INSERT: u32 = 2;
    pub const REPLACE: u32 = 3;
    pub const UPDATE: u32 = 4;
    pub const DELETE: u32 = 5;
    pub const AUTH: u32 = 7;
    pub const EVAL: u32 = 8;
    pub const UPSERT: u32 = 9;
    pub const CALL: u32 = 10;
    pub const BEGIN: u32 = 14;
    pub const COMMIT: u32 = 15;
    pub const ROLLBACK: u32 = 16;
    pub const PING: u32 = 64;
    pub const WATCH: u32 = 74;
    pub const UNWATCH: u32 = 75;
}

/// Response codes and well-known server error codes.
pub mod codes {
    /// Success.
    pub const OK: u32 = 0x00;
    /// Server event for a watched key (sync is 0).
    pub const EVENT: u32 = 0x4c;
    /// In-band push sent while a request is still executing.
    pub const CHUNK: u32 = 0x80;
    /// Set on every error response; the low bits carry the error code.
    pub const ERROR_FLAG: u32 = 0x8000;

    pub const ER_NO_SUCH_USER: u32 = 45;
    pub const ER_PASSWORD_MISMATCH: u32 = 47;
    pub const ER_NO_SUCH_SPACE: u32 = 36;
    pub const ER_WRONG_SCHEMA_VERSION: u32 = 109;
    pub const ER_LOADING: u32 = 116;
}

/// Decoded packet header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Header {
    /// Request type on requests, response code on responses.
    pub code: u32,
    /// Correlation id (0 = unsolicited).
    pub sync: u64,
    /// Schema version the packet was produced against (0 = not set).
    pub schema_version: u64,
    /// Stream (interactive transaction) id (0 = none).
    pub stream_id: u64,
}

impl Header {
    /// Create a header with the given code and sync.
    pub fn new(code: u32, sync: u64) -> Self {
        Self {
            code,
            sync,
            ..Self::default()
        }
    }

    /// Set the schema version.
    pub fn with_schema_version(mut self, schema_version: u64) -> Self {
        self.schema_version = schema_version;
        self
    }

    /// Set the stream id.
    pub fn with_stream_id(mut self, stream_id: u64) -> Self {
        self.stream_id = stream_id;
        self
    }

    /// Encode the header map, appending it to `buf`.
    ///
    /// Zero schema version and stream id are omitted.
    pub fn encode_into(&self, buf: &mut Vec<u8>) -> Result<()> {
        let len = 2 + u32::from(self.schema_version != 0) + u32::from(self.stream_id != 0);
        rmp::encode::write_map_len(buf, len)?;
        rmp::encode::write_pfix(buf, keys::CODE)?;
        rmp::encode::write_uint(buf, u64::from(self.code))?;
        rmp::encode::write_pfix(buf, keys::SYNC)?;
        rmp::encode::write_uint(buf, self.sync)?;
        if self.schema_version != 0 {
            rmp::encode::write_pfix(buf, keys::SCHEMA_VERSION)?;
            rmp::encode::write_uint(buf, self.schema_version)?;
        }
        if self.stream_id != 0 {
            rmp::encode::write_pfix(buf, keys::STREAM_ID)?;
            rmp::encode::write_uint(buf, self.stream_id)?;
        }
        Ok(())
    }

    /// Decode a header map from the front of `buf`, advancing it past the map.
    ///
    /// Unknown keys are skipped.
    pub fn decode(buf: &mut &[u8]) -> Result<Self> {
        let value = rmpv::decode::read_value(buf)?;
        let Value::Map(entries) = value else {
            return Err(Error::Protocol(format!("Header is not a map: {}", value)));
        };

        let mut header = Header::default();
        let mut has_code = false;
        for (key, value) in entries {
            let Some(key) = key.as_u64() else {
                continue;
            };
            let field = || {
                value.as_u64().ok_or_else(|| {
                    Error::Protocol(format!("Header key {:#x} is not an unsigned integer", key))
                })
            };
            match key {
                k if k == u64::from(keys::CODE) => {
                    header.code = u32::try_from(field()?)
                        .map_err(|_| Error::Protocol("Header code out of range".to_string()))?;
                    has_code = true;
                }
                k if k == u64::from(keys::SYNC) => header.sync = field()?,
                k if k == u64::from(keys::SCHEMA_VERSION) => header.schema_version = field()?,
                k if k == u64::from(keys::STREAM_ID) => header.stream_id = field()?,
                _ => {}
            }
        }

        if !has_code {
            return Err(Error::Protocol("Header has no code".to_string()));
        }
        Ok(header)
    }

    /// Check if this is an error response.
    #[inline]
    pub fn is_error(&self) -> bool {
        self.code & codes::ERROR_FLAG != 0
    }

    /// Server error code with the error flag stripped.
    #[inline]
    pub fn error_code(&self) -> u32 {
        self.code & !codes::ERROR_FLAG
    }

    /// Check if this is an in-band push chunk.
    #[inline]
    pub fn is_chunk(&self) -> bool {
        self.code == codes::CHUNK
    }

    /// Check if this is a watcher event.
    #[inline]
    pub fn is_event(&self) -> bool {
        self.code == codes::EVENT
    }
}

/// Encode a packet length as the fixed 5-byte prefix.
#[inline]
pub fn encode_length(len: u32) -> [u8; LENGTH_PREFIX_SIZE] {
    let mut buf = [0u8; LENGTH_PREFIX_SIZE];
    buf[0] = 0xce;
    buf[1..].copy_from_slice(&len.to_be_bytes());
    buf
}

/// Decode a length prefix from the front of `buf`.
///
/// Returns `Ok(None)` if more bytes are needed, otherwise the number of
/// prefix bytes and the packet length.
pub fn decode_length(buf: &[u8]) -> Result<Option<(usize, u64)>> {
    let Some(&marker) = buf.first() else {
        return Ok(None);
    };

    let width = match marker {
        0x00..=0x7f => return Ok(Some((1, u64::from(marker)))),
        0xcc => 1,
        0xcd => 2,
        0xce => 4,
        0xcf => 8,
        other => {
            return Err(Error::Protocol(format!(
                "Invalid length prefix marker {:#04x}",
                other
            )))
        }
    };

    if buf.len() < 1 + width {
        return Ok(None);
    }

    let len = buf[1..=width]
        .iter()
        .fold(0u64, |acc, b| (acc << 8) | u64::from(*b));
    Ok(Some((1 + width, len)))
}
