//! MsgPack codec using `rmp-serde` and `rmpv`.
//!
//! Tuples are positional, so structs are serialized with `to_vec`
//! (struct-as-array). A `#[derive(Serialize)]` struct therefore maps onto a
//! tuple field by field, in declaration order.
//!
//! # Example
//!
//! ```
//! use iproto_client::codec::MsgPackCodec;
//! use serde::{Serialize, Deserialize};
//!
//! #[derive(Serialize, Deserialize, PartialEq, Debug)]
//! struct User {
//!     id: u32,
//!     name: String,
//! }
//!
//! let user = User { id: 42, name: "alice".to_string() };
//! let value = MsgPackCodec::to_value(&user).unwrap();
//! assert!(value.is_array());
//!
//! let decoded: User = MsgPackCodec::from_value(value).unwrap();
//! assert_eq!(decoded, user);
//! ```

use rmpv::Value;

use crate::error::Result;

/// MessagePack codec for structured data.
pub struct MsgPackCodec;

impl MsgPackCodec {
    /// Encode a value to MsgPack bytes.
    #[inline]
    pub fn encode<T: serde::Serialize + ?Sized>(value: &T) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec(value)?)
    }

    /// Decode MsgPack bytes to a value.
    #[inline]
    pub fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T> {
        Ok(rmp_serde::from_slice(bytes)?)
    }

    /// Convert a serde value into a dynamic MsgPack value.
    #[inline]
    pub fn to_value<T: serde::Serialize>(value: T) -> Result<Value> {
        Ok(rmpv::ext::to_value(value)?)
    }

    /// Convert a dynamic MsgPack value into a serde value.
    #[inline]
    pub fn from_value<T: serde::de::DeserializeOwned>(value: Value) -> Result<T> {
        Ok(rmpv::ext::from_value(value)?)
    }

    /// Append a dynamic value to `buf`.
    #[inline]
    pub fn write_value(buf: &mut Vec<u8>, value: &Value) -> Result<()> {
        rmp_serde::encode::write(buf, value)?;
        Ok(())
    }

    /// Read one dynamic value from the front of `buf`, advancing it.
    #[inline]
    pub fn read_value(buf: &mut &[u8]) -> Result<Value> {
        Ok(rmpv::decode::read_value(buf)?)
    }
}
