//! Socket connect for TCP and Unix domain sockets.
//!
//! # Example
//!
//! ```ignore
//! use iproto_client::transport::{Endpoint, Transport};
//!
//! let endpoint = Endpoint::tcp("127.0.0.1", 3301);
//! let transport = Transport::connect(&endpoint, timeout, 64 * 1024, max_payload).await?;
//! println!("connected to {}", transport.greeting.version);
//! ```

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

use super::reader::{read_greeting, FrameReader};
use crate::error::{Error, Result};
use crate::protocol::Greeting;

/// Read half of a connected socket.
pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

/// Write half of a connected socket.
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Where to connect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Tcp { host: String, port: u16 },
    Unix(PathBuf),
}

impl Endpoint {
    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Endpoint::Tcp {
            host: host.into(),
            port,
        }
    }

    pub fn unix(path: impl Into<PathBuf>) -> Self {
        Endpoint::Unix(path.into())
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Tcp { host, port } => write!(f, "{}:{}", host, port),
            Endpoint::Unix(path) => write!(f, "unix/:{}", path.display()),
        }
    }
}

/// An open socket with the greeting already consumed.
pub struct Transport {
    pub greeting: Greeting,
    pub reader: FrameReader,
    pub writer: BoxedWriter,
}

impl Transport {
    /// Open the socket and read the greeting, both within `timeout`.
    ///
    /// Every failure is reported as [`Error::Connect`].
    pub async fn connect(
        endpoint: &Endpoint,
        timeout: Duration,
        read_buffer_size: usize,
        max_payload_size: u32,
    ) -> Result<Self> {
        let attempt = async {
            let (mut reader, writer) = open(endpoint).await?;
            let greeting = read_greeting(&mut reader).await?;
            Ok::<_, Error>((greeting, reader, writer))
        };

        let (greeting, reader, writer) = match tokio::time::timeout(timeout, attempt).await {
            Ok(Ok(parts)) => parts,
            Ok(Err(e)) => {
                return Err(Error::Connect {
                    addr: endpoint.to_string(),
                    reason: e.to_string(),
                })
            }
            Err(_) => {
                return Err(Error::Connect {
                    addr: endpoint.to_string(),
                    reason: format!("timed out after {:?}", timeout),
                })
            }
        };

        tracing::debug!(
            "Connected to {} (server {} {})",
            endpoint,
            greeting.version,
            greeting.uuid.as_deref().unwrap_or("-")
        );

        Ok(Self {
            greeting,
            reader: FrameReader::new(reader, read_buffer_size, max_payload_size),
            writer,
        })
    }
}

async fn open(endpoint: &Endpoint) -> Result<(BoxedReader, BoxedWriter)> {
    match endpoint {
        Endpoint::Tcp { host, port } => {
            let stream = TcpStream::connect((host.as_str(), *port)).await?;
            stream.set_nodelay(true)?;
            let (read_half, write_half) = stream.into_split();
            Ok((Box::new(read_half), Box::new(write_half)))
        }
        Endpoint::Unix(path) => open_unix(path).await,
    }
}

#[cfg(unix)]
async fn open_unix(path: &std::path::Path) -> Result<(BoxedReader, BoxedWriter)> {
    let stream = tokio::net::UnixStream::connect(path).await?;
    let (read_half, write_half) = stream.into_split();
    Ok((Box::new(read_half), Box::new(write_half)))
}

#[cfg(not(unix))]
async fn open_unix(path: &std::path::Path) -> Result<(BoxedReader, BoxedWriter)> {
    Err(Error::Protocol(format!(
        "Unix sockets are not supported on this platform: {}",
        path.display()
    )))
}
