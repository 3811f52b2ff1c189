//! Server greeting.
//!
//! The server sends a fixed 128-byte greeting as soon as the socket is
//! accepted: two 64-byte lines, the first holding the banner
//! (`Tarantool 2.11.1 (Binary) <instance uuid>`), the second a base64
//! encoded salt used by the chap-sha1 scramble.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;

use super::wire_format::GREETING_SIZE;
use crate::error::{Error, Result};

const LINE_SIZE: usize = GREETING_SIZE / 2;

/// Number of salt bytes used by the scramble.
pub const SALT_SIZE: usize = 20;

/// Parsed server greeting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Greeting {
    /// Server version as printed in the banner, e.g. `2.11.1-0-g96877bd`.
    pub version: String,
    /// Numeric `(major, minor, patch)` prefix of the version.
    pub version_id: (u32, u32, u32),
    /// Protocol name, normally `Binary`.
    pub protocol: String,
    /// Instance uuid, if the banner carries one.
    pub uuid: Option<String>,
    /// Decoded salt.
    pub salt: Vec<u8>,
}

impl Greeting {
    /// Parse the raw 128-byte greeting.
    pub fn parse(raw: &[u8]) -> Result<Self> {
        if raw.len() < GREETING_SIZE {
            return Err(Error::Protocol(format!(
                "Greeting is {} bytes, expected {}",
                raw.len(),
                GREETING_SIZE
            )));
        }

        let banner = line(&raw[..LINE_SIZE])?;
        let salt_line = line(&raw[LINE_SIZE..GREETING_SIZE])?;

        let mut parts = banner.split_whitespace();
        match parts.next() {
            Some("Tarantool") => {}
            _ => {
                return Err(Error::Protocol(format!(
                    "Unexpected greeting banner: {:?}",
                    banner
                )))
            }
        }
        let version = parts
            .next()
            .ok_or_else(|| Error::Protocol("Greeting has no version".to_string()))?
            .to_string();
        let protocol = parts
            .next()
            .map(|p| p.trim_start_matches('(').trim_end_matches(')').to_string())
            .unwrap_or_else(|| "Binary".to_string());
        let uuid = parts.next().map(str::to_string);

        let salt = STANDARD
            .decode(salt_line.trim())
            .map_err(|e| Error::Protocol(format!("Invalid greeting salt: {}", e)))?;
        if salt.len() < SALT_SIZE {
            return Err(Error::Protocol(format!(
                "Greeting salt is {} bytes, expected at least {}",
                salt.len(),
                SALT_SIZE
            )));
        }

        Ok(Self {
            version_id: parse_version_id(&version),
            version,
            protocol,
            uuid,
            salt,
        })
    }
}

fn line(raw: &[u8]) -> Result<&str> {
    std::str::from_utf8(raw)
        .map(|s| s.trim_end_matches(['\n', '\0', ' ']))
        .map_err(|_| Error::Protocol("Greeting is not valid UTF-8".to_string()))
}

/// Parse the leading `major.minor.patch` of a version string, treating
/// missing or non-numeric components as zero.
fn parse_version_id(version: &str) -> (u32, u32, u32) {
    let numeric = version.split('-').next().unwrap_or(version);
    let mut parts = numeric
        .split('.')
        .map(|p| p.parse::<u32>().unwrap_or(0));
    (
        parts.next().unwrap_or(0),
        parts.next().unwrap_or(0),
        parts.next().unwrap_or(0),
    )
}

/// Build a greeting as a server would send it.
///
/// Used by tests and local tooling that speak the server side of the
/// protocol.
pub fn encode_greeting(version: &str, uuid: &str, salt: &[u8]) -> [u8; GREETING_SIZE] {
    let mut out = [b' '; GREETING_SIZE];

    let banner = format!("Tarantool {} (Binary) {}", version, uuid);
    let banner = &banner.as_bytes()[..banner.len().min(LINE_SIZE - 1)];
    out[..banner.len()].copy_from_slice(banner);
    out[LINE_SIZE - 1] = b'\n';

    let salt = STANDARD.encode(salt);
    let salt = &salt.as_bytes()[..salt.len().min(LINE_SIZE - 1)];
    out[LINE_SIZE..LINE_SIZE + salt.len()].copy_from_slice(salt);
    out[GREETING_SIZE - 1] = b'\n';

    out
}
