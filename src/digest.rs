//! Digests used during the opening handshake.
//!
//! The RFC 6455 accept key is `base64(sha1(key ++ GUID))`. The legacy two-key handshake
//! answers with a raw MD5 digest instead.

use base64::prelude::*;
use md5::Md5;
use sha1::{Digest, Sha1};

/// GUID appended to the client key before hashing, fixed by RFC 6455 section 1.3.
pub const WEBSOCKET_GUID: &[u8] = b"258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Computes the SHA-1 digest of `data`.
#[inline]
pub fn sha1(data: &[u8]) -> [u8; 20] {
    Sha1::digest(data).into()
}

/// Computes the MD5 digest of `data`.
#[inline]
pub fn md5(data: &[u8]) -> [u8; 16] {
    Md5::digest(data).into()
}

/// Computes the `Sec-WebSocket-Accept` value for a `Sec-WebSocket-Key`.
pub fn accept_key(key: &[u8]) -> String {
    let mut sha1 = Sha1::new();
    sha1.update(key);
    sha1.update(WEBSOCKET_GUID);
    BASE64_STANDARD.encode(sha1.finalize())
}
