//! Codec module - request encoding and response decoding.
//!
//! - [`MsgPackCodec`] - MessagePack helpers over `rmp-serde` and `rmpv`
//! - [`Operation`] - requests and their body encoding
//! - [`decode_reply`] / [`PushNotification`] - inbound payload decoding
//!
//! The connection core never interprets body bytes itself; everything goes
//! through this module.
//!
//! # Example
//!
//! ```
//! use iproto_client::codec::{MsgPackCodec, Operation};
//! use iproto_client::schema::Schema;
//!
//! let op = Operation::Call {
//!     function: "echo".to_string(),
//!     args: MsgPackCodec::to_value(("hello",)).unwrap(),
//! };
//! let encoded = op.encode(&Schema::empty()).unwrap();
//! assert!(!encoded.body.is_empty());
//! ```

mod msgpack;
mod request;
mod response;

pub use msgpack::MsgPackCodec;
pub use request::{EncodedRequest, IteratorType, Isolation, Operation, SelectOptions};
pub use response::{decode_reply, PushNotification, Response, Tuple};
