//! # iproto-client
//!
//! Asynchronous client for the IProto binary protocol spoken by Tarantool.
//!
//! Many requests share one socket: each carries a correlation id (`sync`)
//! and replies are matched back to their callers in whatever order they
//! arrive.
//!
//! ## Architecture
//!
//! - **Transport**: TCP or Unix socket, greeting, length-prefixed MsgPack frames
//! - **Multiplexer**: sync ids, per-request timeouts, late-reply discarding
//! - **Schema cache**: space/index names, single-flight refetch on version change
//! - **Connection**: handshake, state machine, reconnect, push broadcast
//!
//! ## Example
//!
//! ```ignore
//! use iproto_client::{Connection, SelectOptions};
//!
//! #[tokio::main]
//! async fn main() -> iproto_client::Result<()> {
//!     let conn = Connection::builder()
//!         .host("127.0.0.1")
//!         .port(3301)
//!         .connect()
//!         .await?;
//!
//!     conn.ping().await?;
//!     let reply = conn.select("tester", (1,), SelectOptions::new()).await?;
//!     println!("{:?}", reply.data);
//!     Ok(())
//! }
//! ```

pub mod codec;
pub mod config;
pub mod connection;
pub mod error;
pub mod multiplexer;
pub mod protocol;
pub mod push;
pub mod schema;
pub mod stream;
pub mod transport;
pub mod writer;

mod backpressure;

pub use codec::{
    IteratorType, Isolation, Operation, PushNotification, Response, SelectOptions, Tuple,
};
pub use config::{Config, ConnectionBuilder};
pub use connection::{Connection, ConnectionState, RequestOptions};
pub use error::{Error, Result};
pub use push::PushIterator;
pub use schema::{IndexRef, Schema, SpaceMeta, SpaceRef};
pub use stream::Stream;

/// Connect to `host:port` with default settings.
pub async fn connect(host: impl Into<String>, port: u16) -> Result<Connection> {
    Connection::builder().host(host).port(port).connect().await
}
