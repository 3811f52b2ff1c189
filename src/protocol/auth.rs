//! chap-sha1 authentication.
//!
//! ```text
//! hash1    = sha1(password)
//! hash2    = sha1(hash1)
//! scramble = hash1 XOR sha1(salt[..20] ++ hash2)
//! ```

use sha1::{Digest, Sha1};

use super::greeting::SALT_SIZE;
use super::wire_format::keys;
use crate::error::{Error, Result};

/// Authentication mechanism name sent in the auth tuple.
pub const CHAP_SHA1: &str = "chap-sha1";

/// Length of a SHA-1 digest and therefore of the scramble.
pub const SCRAMBLE_SIZE: usize = 20;

/// Compute the chap-sha1 scramble for `password` and the greeting salt.
pub fn scramble(salt: &[u8], password: &str) -> Result<[u8; SCRAMBLE_SIZE]> {
    if salt.len() < SALT_SIZE {
        return Err(Error::Protocol(format!(
            "Salt is {} bytes, expected at least {}",
            salt.len(),
            SALT_SIZE
        )));
    }

    let hash1 = Sha1::digest(password.as_bytes());
    let hash2 = Sha1::digest(hash1);

    let mut hasher = Sha1::new();
    hasher.update(&salt[..SALT_SIZE]);
    hasher.update(hash2);
    let salted = hasher.finalize();

    let mut out = [0u8; SCRAMBLE_SIZE];
    for (i, byte) in out.iter_mut().enumerate() {
        *byte = hash1[i] ^ salted[i];
    }
    Ok(out)
}

/// Encode the body of an AUTH request:
/// `{USER_NAME: user, TUPLE: ["chap-sha1", scramble]}`.
pub fn encode_auth_body(user: &str, salt: &[u8], password: &str) -> Result<Vec<u8>> {
    let scramble = scramble(salt, password)?;

    let mut buf = Vec::with_capacity(64 + user.len());
    rmp::encode::write_map_len(&mut buf, 2)?;
    rmp::encode::write_pfix(&mut buf, keys::USER_NAME)?;
    rmp::encode::write_str(&mut buf, user)?;
    rmp::encode::write_pfix(&mut buf, keys::TUPLE)?;
    rmp::encode::write_array_len(&mut buf, 2)?;
    rmp::encode::write_str(&mut buf, CHAP_SHA1)?;
    rmp::encode::write_bin(&mut buf, &scramble)?;
    Ok(buf)
}

/// Check a scramble received from a client against the stored password.
///
/// Server-side counterpart of [`scramble`], used by test servers.
pub fn verify_scramble(salt: &[u8], password: &str, received: &[u8]) -> bool {
    match scramble(salt, password) {
        Ok(expected) => expected.as_slice() == received,
        Err(_) => false,
    }
}
