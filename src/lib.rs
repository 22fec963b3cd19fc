//! # wsbridge
//! A WebSocket server engine (RFC 6455) for control-system glue code, with a fallback for the
//! legacy two-key handshake still spoken by some older touchpanel firmware.
//!
//! The crate is split in two layers:
//!
//! - A sans-io protocol core: [`handshake`] negotiates the HTTP upgrade, [`codec`] turns bytes into
//!   [`Frame`]s and back, and [`Connection`] runs one connection's lifecycle on top of both. None
//!   of these touch a socket; they consume byte slices and produce byte buffers plus events.
//! - A tokio server: [`Server`] accepts TCP connections, drives one [`Connection`] per socket and
//!   keeps the registry of live connections used by [`Handle::send`], [`Handle::broadcast`] and
//!   [`Handle::disconnect`]. Connection events are delivered to the [`EventHandler`] registered
//!   with the server.
//!
//! # Features
//!
//! - `logging`: Enables debug logging for handshakes, frame processing and connection lifecycle
//!   using the `log` crate.
//!
//! - `json`: Enables [`Handle::send_json`] and [`Handle::broadcast_json`].
//!
//! - `simd`: Validates UTF-8 text payloads with `simdutf8`.
//!
//! # Server Example
//! ```no_run
//! use wsbridge::{ConnectionId, EventHandler, Handle, Options, Server};
//!
//! struct Echo;
//!
//! impl EventHandler for Echo {
//!     fn on_message(&self, handle: &Handle, id: ConnectionId, text: String) {
//!         let _ = handle.send(id, &text);
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> wsbridge::Result<()> {
//!     let server = Server::start(8080, Options::default(), Echo).await?;
//!     server.run().await
//! }
//! ```
//!
//! # Memory Safety
//! - Frame payloads are capped (default 100 KiB) and checked as soon as the header is read
//! - The per-connection read buffer is bounded
//! - Fragmented messages are bounded by the same payload cap
//! - Handshakes that never complete are closed after a timeout

#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod buffer;
pub mod close;
pub mod codec;
pub mod connection;
pub mod digest;
pub mod frame;
pub mod handshake;
mod mask;
mod options;
mod registry;
mod server;

use thiserror::Error;

pub use connection::{Connection, ConnectionEvent, State};
pub use frame::{Frame, OpCode};
pub use handshake::HandshakeScheme;
pub use options::{Options, MAX_HANDSHAKE_SIZE, MAX_PAYLOAD_READ};
pub use registry::ConnectionId;
pub use server::{Event, EventHandler, Handle, Server};

/// A result type for WebSocket operations, using `WebSocketError` as the error type.
pub type Result<T> = std::result::Result<T, WebSocketError>;

/// Represents errors that can occur during WebSocket operations.
///
/// The errors are broadly categorized into:
///
/// - Handshake errors, which reject the upgrade request
/// - Frame errors (protocol violations, oversized payloads, invalid UTF-8)
/// - Lifecycle errors (closed or unknown connections, timeouts)
/// - I/O errors reported by the transport
///
/// Every error is local to the connection it happened on.
#[derive(Error, Debug)]
pub enum WebSocketError {
    /// Occurs during handshake when neither the "Sec-WebSocket-Key" header nor the pair of
    /// legacy key headers is present in the client request.
    #[error("Sec-WebSocket-Key header is missing")]
    MissingSecWebSocketKey,

    /// Returned when the "Sec-WebSocket-Version" header names a version whose accept key
    /// computation differs from RFC 6455.
    #[error("Sec-WebSocket-Version must be 8 or 13")]
    InvalidSecWebsocketVersion,

    /// One of the legacy "Sec-WebSocket-Key1"/"Sec-WebSocket-Key2" values carries no spaces,
    /// is not a multiple of its space count, or does not fit in 32 bits.
    #[error("Invalid legacy handshake key")]
    InvalidLegacyKey,

    /// The upgrade request is not valid UTF-8 or exceeds the maximum handshake size without
    /// a blank-line terminator.
    #[error("Malformed upgrade request")]
    MalformedRequest,

    /// The client did not complete the handshake within the configured timeout.
    #[error("Handshake timed out")]
    HandshakeTimeout,

    /// The connection received nothing within the configured idle timeout.
    #[error("Connection idle timeout")]
    IdleTimeout,

    /// Occurs when receiving a WebSocket fragment that violates the protocol specification,
    /// such as receiving a new data frame before completing the previous message.
    #[error("Invalid fragment")]
    InvalidFragment,

    /// Occurs when receiving a continuation frame without a preceding initial frame.
    #[error("Invalid continuation frame")]
    InvalidContinuationFrame,

    /// Indicates that a text frame or close frame reason contains invalid UTF-8 data.
    #[error("Invalid UTF-8")]
    InvalidUTF8,

    /// Returned when attempting to send on a connection that is not open.
    #[error("Connection is closed")]
    ConnectionClosed,

    /// The connection id is not present in the server registry.
    #[error("Unknown connection {0}")]
    UnknownConnection(ConnectionId),

    /// Indicates that a received close frame has a 1-byte payload (close frames must be
    /// either empty or at least 2 bytes).
    #[error("Invalid close frame")]
    InvalidCloseFrame,

    /// Occurs when a close frame carries a status code that may not be sent on the wire.
    #[error("Invalid close code")]
    InvalidCloseCode,

    /// Reserved bits in the frame header are set while no extension was negotiated.
    #[error("Reserved bits are not zero")]
    ReservedBitsNotZero,

    /// A control frame (ping, pong, or close) was received with the FIN bit unset.
    #[error("Control frame must not be fragmented")]
    ControlFrameFragmented,

    /// A control frame declared a payload above 125 bytes.
    #[error("Control frame too large")]
    ControlFrameTooLarge,

    /// The declared payload length, or the size of a reassembled message, exceeds the
    /// configured maximum.
    #[error("Frame too large")]
    FrameTooLarge,

    /// The per-connection read buffer reached its limit.
    #[error("Read buffer full")]
    ReadBufferFull,

    /// Indicates receipt of a frame with an opcode outside the values defined by RFC 6455.
    #[error("Invalid opcode (byte={0})")]
    InvalidOpCode(u8),

    /// A legacy-framed connection sent a frame type byte other than `0x00` or `0xFF`.
    #[error("Invalid legacy frame (byte={0})")]
    InvalidLegacyFrame(u8),

    /// A client frame arrived without a mask on a connection that requires masking.
    #[error("Client frame is not masked")]
    UnmaskedFrame,

    /// The frame cannot be expressed with the connection's framing, e.g. a ping on a
    /// legacy connection.
    #[error("Frame not supported by this framing")]
    UnsupportedFrame,

    /// Wraps standard I/O errors reported by the transport, such as connection resets.
    #[error(transparent)]
    IoError(#[from] std::io::Error),

    /// Occurs when serialization of JSON data fails.
    /// Only available when the `json` feature is enabled.
    #[cfg(feature = "json")]
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl WebSocketError {
    /// Returns the close code sent to the peer when this error terminates an open connection.
    ///
    /// Errors that do not originate from the peer's data (transport failures, local misuse)
    /// return `None`.
    pub fn close_code(&self) -> Option<close::CloseCode> {
        use close::CloseCode;

        match self {
            Self::InvalidUTF8 => Some(CloseCode::Invalid),
            Self::FrameTooLarge | Self::ReadBufferFull => Some(CloseCode::Size),
            Self::IdleTimeout => Some(CloseCode::Away),
            Self::InvalidFragment
            | Self::InvalidContinuationFrame
            | Self::InvalidCloseFrame
            | Self::InvalidCloseCode
            | Self::ReservedBitsNotZero
            | Self::ControlFrameFragmented
            | Self::ControlFrameTooLarge
            | Self::InvalidOpCode(_)
            | Self::InvalidLegacyFrame(_)
            | Self::UnmaskedFrame => Some(CloseCode::Protocol),
            _ => None,
        }
    }
}
