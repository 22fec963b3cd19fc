//! Opening handshake.
//!
//! The negotiator looks at the raw bytes a client sent before any framing, decides which
//! [`HandshakeScheme`] the request speaks and produces the literal upgrade response. Only the
//! headers the upgrade needs are inspected; lookups go through [`extract_header_value`].
//!
//! # RFC 6455
//! ```text
//! GET /chat HTTP/1.1
//! Upgrade: websocket
//! Connection: Upgrade
//! Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==
//! Sec-WebSocket-Version: 13
//! ```
//! is answered with `Sec-WebSocket-Accept: base64(sha1(key ++ GUID))`.
//!
//! # Legacy two-key handshake
//! A request without `Sec-WebSocket-Version` but with `Sec-WebSocket-Key1` and
//! `Sec-WebSocket-Key2` is followed by 8 raw bytes. The response body is the MD5 digest of the
//! two decoded keys (32-bit big-endian each) followed by those 8 bytes.

use bytes::{BufMut, Bytes, BytesMut};

use crate::{
    buffer::find,
    digest::{accept_key, md5},
    options::MAX_HANDSHAKE_SIZE,
    WebSocketError,
};

/// Blank line that ends the request head.
const HEAD_TERMINATOR: &[u8] = b"\r\n\r\n";

/// Number of raw bytes that follow the head of a legacy request.
const LEGACY_CHALLENGE_LEN: usize = 8;

/// Response sent before closing a connection whose upgrade request was rejected.
pub const REJECT_RESPONSE: &[u8] =
    b"HTTP/1.1 400 Bad Request\r\nConnection: close\r\nContent-Length: 0\r\n\r\n";

/// The handshake variant a connection negotiated.
///
/// The scheme also fixes the framing used afterwards and whether client frames must be masked.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum HandshakeScheme {
    /// `Sec-WebSocket-Key` + SHA-1 accept value, RFC 6455 framing.
    Rfc6455,
    /// `Sec-WebSocket-Key1`/`Key2` + MD5 challenge, `0x00 … 0xFF` framing.
    Legacy,
}

impl HandshakeScheme {
    /// Returns `true` if client frames must carry a mask key.
    pub fn requires_masking(self) -> bool {
        self == HandshakeScheme::Rfc6455
    }

    /// Decides the scheme from the request head.
    fn detect(head: &[u8], allow_legacy: bool) -> Result<Self, WebSocketError> {
        let version = extract_header_value(head, "Sec-WebSocket-Version");
        let legacy_keys = extract_header_value(head, "Sec-WebSocket-Key1").is_some()
            && extract_header_value(head, "Sec-WebSocket-Key2").is_some();

        if version.is_none() && legacy_keys && allow_legacy {
            return Ok(HandshakeScheme::Legacy);
        }

        match extract_header_value(head, "Sec-WebSocket-Key") {
            Some(key) if !key.is_empty() => {}
            _ => return Err(WebSocketError::MissingSecWebSocketKey),
        }

        // hybi-08 through RFC 6455 share the accept computation
        match version {
            None | Some("8") | Some("13") => Ok(HandshakeScheme::Rfc6455),
            Some(_) => Err(WebSocketError::InvalidSecWebsocketVersion),
        }
    }

    /// Builds the upgrade response for `request`.
    fn respond(self, request: &HandshakeRequest<'_>) -> Result<Bytes, WebSocketError> {
        match self {
            HandshakeScheme::Rfc6455 => {
                let key = request
                    .sec_websocket_key()
                    .ok_or(WebSocketError::MissingSecWebSocketKey)?;

                let response = format!(
                    "HTTP/1.1 101 Switching Protocols\r\n\
                     Upgrade: websocket\r\n\
                     Connection: Upgrade\r\n\
                     Sec-WebSocket-Accept: {}\r\n\r\n",
                    accept_key(key.as_bytes())
                );
                Ok(Bytes::from(response))
            }
            HandshakeScheme::Legacy => {
                let key1 = request
                    .header("Sec-WebSocket-Key1")
                    .ok_or(WebSocketError::MissingSecWebSocketKey)?;
                let key2 = request
                    .header("Sec-WebSocket-Key2")
                    .ok_or(WebSocketError::MissingSecWebSocketKey)?;

                let mut challenge = [0u8; 16];
                challenge[..4].copy_from_slice(&legacy_key_number(key1)?.to_be_bytes());
                challenge[4..8].copy_from_slice(&legacy_key_number(key2)?.to_be_bytes());
                challenge[8..].copy_from_slice(request.challenge);

                let mut response = BytesMut::with_capacity(256);
                response.put_slice(
                    b"HTTP/1.1 101 Web Socket Protocol Handshake\r\n\
                      Upgrade: WebSocket\r\n\
                      Connection: Upgrade\r\n",
                );
                if let Some(origin) = request.header("Origin") {
                    let origin = echoable(origin)?;
                    response.put_slice(format!("Sec-WebSocket-Origin: {origin}\r\n").as_bytes());
                }
                if let Some(host) = request.header("Host") {
                    let location = format!("ws://{host}{}", request.path());
                    let location = echoable(&location)?;
                    response.put_slice(format!("Sec-WebSocket-Location: {location}\r\n").as_bytes());
                }
                response.put_slice(b"\r\n");
                response.put_slice(&md5(&challenge));

                Ok(response.freeze())
            }
        }
    }
}

/// A complete upgrade request.
#[derive(Debug)]
pub struct HandshakeRequest<'a> {
    /// Request line and headers, without the blank-line terminator.
    pub head: &'a [u8],
    pub scheme: HandshakeScheme,
    /// The 8 raw bytes that follow a legacy request head; empty for RFC 6455.
    pub challenge: &'a [u8],
}

impl<'a> HandshakeRequest<'a> {
    /// Looks up a header value, see [`extract_header_value`].
    pub fn header(&self, name: &str) -> Option<&'a str> {
        extract_header_value(self.head, name)
    }

    pub fn sec_websocket_key(&self) -> Option<&'a str> {
        self.header("Sec-WebSocket-Key")
    }

    /// The request target from the request line, `/` when absent.
    pub fn path(&self) -> &'a str {
        let line_end = find(self.head, b"\r\n").unwrap_or(self.head.len());
        std::str::from_utf8(&self.head[..line_end])
            .ok()
            .and_then(|line| line.split_ascii_whitespace().nth(1))
            .unwrap_or("/")
    }

    /// Number of bytes of the raw input this request occupies.
    pub fn len(&self) -> usize {
        self.head.len() + HEAD_TERMINATOR.len() + self.challenge.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// An accepted upgrade.
#[derive(Debug, Clone)]
pub struct Upgrade {
    /// Bytes to send back before any frame.
    pub response: Bytes,
    pub scheme: HandshakeScheme,
    /// Number of input bytes the request occupied. Anything after it is already framed data.
    pub consumed: usize,
}

impl Upgrade {
    #[inline]
    pub fn requires_masking(&self) -> bool {
        self.scheme.requires_masking()
    }
}

/// Result of one negotiation attempt.
#[derive(Debug)]
pub enum HandshakeOutcome {
    Accepted(Upgrade),
    Rejected(WebSocketError),
    /// The request is not complete yet; try again once more bytes arrived.
    Incomplete,
}

/// Server-side handshake negotiator.
#[derive(Debug, Clone)]
pub struct Negotiator {
    max_handshake_size: usize,
    allow_legacy: bool,
}

impl Default for Negotiator {
    fn default() -> Self {
        Self::new(MAX_HANDSHAKE_SIZE, true)
    }
}

impl Negotiator {
    /// Creates a negotiator that rejects request heads longer than `max_handshake_size` and
    /// optionally accepts the legacy two-key scheme.
    pub fn new(max_handshake_size: usize, allow_legacy: bool) -> Self {
        Self {
            max_handshake_size,
            allow_legacy,
        }
    }

    /// Parses as much of the request as `raw` holds.
    ///
    /// Returns `Ok(None)` while the head or the legacy challenge is incomplete.
    pub fn parse<'a>(&self, raw: &'a [u8]) -> Result<Option<HandshakeRequest<'a>>, WebSocketError> {
        let Some(end) = find(raw, HEAD_TERMINATOR) else {
            if raw.len() > self.max_handshake_size {
                return Err(WebSocketError::MalformedRequest);
            }
            return Ok(None);
        };
        if end + HEAD_TERMINATOR.len() > self.max_handshake_size {
            return Err(WebSocketError::MalformedRequest);
        }

        let head = &raw[..end];
        let scheme = HandshakeScheme::detect(head, self.allow_legacy)?;

        let body = &raw[end + HEAD_TERMINATOR.len()..];
        let challenge = match scheme {
            HandshakeScheme::Rfc6455 => &body[..0],
            HandshakeScheme::Legacy if body.len() < LEGACY_CHALLENGE_LEN => return Ok(None),
            HandshakeScheme::Legacy => &body[..LEGACY_CHALLENGE_LEN],
        };

        Ok(Some(HandshakeRequest {
            head,
            scheme,
            challenge,
        }))
    }

    /// Attempts to negotiate an upgrade from the bytes received so far.
    pub fn try_negotiate(&self, raw: &[u8]) -> HandshakeOutcome {
        let request = match self.parse(raw) {
            Ok(Some(request)) => request,
            Ok(None) => return HandshakeOutcome::Incomplete,
            Err(err) => return HandshakeOutcome::Rejected(err),
        };

        match request.scheme.respond(&request) {
            Ok(response) => HandshakeOutcome::Accepted(Upgrade {
                response,
                scheme: request.scheme,
                consumed: request.len(),
            }),
            Err(err) => HandshakeOutcome::Rejected(err),
        }
    }
}

/// Negotiates with the default limits and the legacy scheme enabled.
pub fn try_negotiate(raw: &[u8]) -> HandshakeOutcome {
    Negotiator::default().try_negotiate(raw)
}

/// Returns the value of the first header called `name` (ASCII case-insensitive).
///
/// Only the part of `raw` before the blank line is searched and the request line is skipped.
/// The value is trimmed; headers whose value is not UTF-8 are ignored.
pub fn extract_header_value<'a>(raw: &'a [u8], name: &str) -> Option<&'a str> {
    let head = match find(raw, HEAD_TERMINATOR) {
        Some(end) => &raw[..end],
        None => raw,
    };

    head.split(|&b| b == b'\n').skip(1).find_map(|line| {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        let colon = line.iter().position(|&b| b == b':')?;
        if !line[..colon].trim_ascii().eq_ignore_ascii_case(name.as_bytes()) {
            return None;
        }
        std::str::from_utf8(line[colon + 1..].trim_ascii()).ok()
    })
}

/// Checks that a request value can be copied into a response header.
fn echoable(value: &str) -> Result<&str, WebSocketError> {
    if value.bytes().any(|b| b.is_ascii_control() && b != b'\t') {
        return Err(WebSocketError::MalformedRequest);
    }
    Ok(value)
}

/// Decodes one legacy key: its digits read as a number, divided by its number of spaces.
fn legacy_key_number(value: &str) -> Result<u32, WebSocketError> {
    let spaces = value.bytes().filter(|&b| b == b' ').count() as u64;
    let digits: String = value.chars().filter(char::is_ascii_digit).collect();
    let number: u64 = digits
        .parse()
        .map_err(|_| WebSocketError::InvalidLegacyKey)?;

    if spaces == 0 || number % spaces != 0 {
        return Err(WebSocketError::InvalidLegacyKey);
    }
    u32::try_from(number / spaces).map_err(|_| WebSocketError::InvalidLegacyKey)
}
