use std::time::Duration;

use crate::frame::MAX_HEAD_SIZE;

/// The default maximum payload size for reading WebSocket frames, 100 KiB.
pub const MAX_PAYLOAD_READ: usize = 100 * 1024;

/// The default maximum size of an upgrade request head, 8 KiB.
pub const MAX_HANDSHAKE_SIZE: usize = 8 * 1024;

/// Default time a client has to complete the opening handshake.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Default time a closing connection waits for the peer's close frame.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Default number of messages that may wait for one connection's task.
const MAX_QUEUED_MESSAGES: usize = 1024;

/// Default number of unwritten bytes above which a connection stops taking more work.
const BACKPRESSURE_BOUNDARY: usize = 256 * 1024;

/// Configuration options for the server and the connections it accepts.
///
/// `Options` groups the limits that bound memory per connection, the timeouts that reclaim
/// stalled connections, and the protocol switches.
///
/// # Example
/// ```rust
/// use std::time::Duration;
/// use wsbridge::Options;
///
/// let options = Options::default()
///     .with_max_payload_read(16 * 1024)
///     .with_idle_timeout(Duration::from_secs(60))
///     .without_legacy_handshake();
/// ```
#[derive(Clone, Debug)]
pub struct Options {
    /// Maximum allowed payload size for incoming frames, and for a message reassembled from
    /// fragments, in bytes.
    ///
    /// A frame declaring a larger payload closes the connection with `1009` before the payload
    /// is read.
    ///
    /// Default: 100 KiB as defined in [`MAX_PAYLOAD_READ`]
    pub max_payload_read: usize,

    /// Maximum number of bytes buffered from the socket while waiting for a complete request
    /// head or frame.
    ///
    /// Default: `max_payload_read` plus the largest frame header, and never less than
    /// [`MAX_HANDSHAKE_SIZE`] so the upgrade request always fits.
    pub max_read_buffer: Option<usize>,

    /// Maximum size of the upgrade request head.
    ///
    /// Default: 8 KiB as defined in [`MAX_HANDSHAKE_SIZE`]
    pub max_handshake_size: usize,

    /// Time a client has, from accept, to send a complete upgrade request. `None` waits
    /// forever.
    ///
    /// Default: 10 seconds
    pub handshake_timeout: Option<Duration>,

    /// Closes an open connection with `1001` after this long without receiving anything.
    ///
    /// Default: `None`
    pub idle_timeout: Option<Duration>,

    /// Time a connection stays in `Closing` waiting for the peer to answer a server close.
    ///
    /// Default: 5 seconds
    pub close_timeout: Duration,

    /// Maximum number of messages queued for a connection by `send` and `broadcast`.
    ///
    /// A connection whose queue is full is dropped from the registry and closed with `1008`.
    ///
    /// Default: 1024
    pub max_queued_messages: usize,

    /// Number of bytes waiting to be written above which a connection stops reading from the
    /// socket and from its message queue, until the peer catches up.
    ///
    /// A close requested while the connection is over the boundary discards the queued
    /// messages.
    ///
    /// Default: 256 KiB
    pub backpressure_boundary: usize,

    /// Whether incoming text payloads are validated as UTF-8.
    ///
    /// If `true`, invalid text closes the connection with `1007`. If `false`, invalid sequences
    /// are replaced when the message is delivered.
    ///
    /// Default: `true`
    pub check_utf8: bool,

    /// Whether requests using the legacy two-key handshake are accepted.
    ///
    /// Default: `true`
    pub legacy_handshake: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            max_payload_read: MAX_PAYLOAD_READ,
            max_read_buffer: None,
            max_handshake_size: MAX_HANDSHAKE_SIZE,
            handshake_timeout: Some(HANDSHAKE_TIMEOUT),
            idle_timeout: None,
            close_timeout: CLOSE_TIMEOUT,
            max_queued_messages: MAX_QUEUED_MESSAGES,
            backpressure_boundary: BACKPRESSURE_BOUNDARY,
            check_utf8: true,
            legacy_handshake: true,
        }
    }
}

impl Options {
    /// Sets the maximum allowed payload size for incoming messages.
    pub fn with_max_payload_read(self, size: usize) -> Self {
        Self {
            max_payload_read: size,
            ..self
        }
    }

    /// Sets the maximum number of bytes buffered from the socket.
    ///
    /// Values below the handshake size are raised to it when the connection is created.
    pub fn with_max_read_buffer(self, size: usize) -> Self {
        Self {
            max_read_buffer: Some(size),
            ..self
        }
    }

    /// Sets the maximum size of the upgrade request head.
    pub fn with_max_handshake_size(self, size: usize) -> Self {
        Self {
            max_handshake_size: size,
            ..self
        }
    }

    /// Sets the time a client has to complete the handshake.
    pub fn with_handshake_timeout(self, timeout: Duration) -> Self {
        Self {
            handshake_timeout: Some(timeout),
            ..self
        }
    }

    /// Lets clients take as long as they want to complete the handshake.
    pub fn without_handshake_timeout(self) -> Self {
        Self {
            handshake_timeout: None,
            ..self
        }
    }

    /// Closes connections that stay silent for `timeout`.
    pub fn with_idle_timeout(self, timeout: Duration) -> Self {
        Self {
            idle_timeout: Some(timeout),
            ..self
        }
    }

    /// Sets how long a closing connection waits for the peer's close frame.
    pub fn with_close_timeout(self, timeout: Duration) -> Self {
        Self {
            close_timeout: timeout,
            ..self
        }
    }

    /// Sets how many messages may be queued for one connection.
    ///
    /// Values below 1 are raised to 1.
    pub fn with_max_queued_messages(self, count: usize) -> Self {
        Self {
            max_queued_messages: count.max(1),
            ..self
        }
    }

    /// Sets the number of unwritten bytes above which a connection applies backpressure.
    pub fn with_backpressure_boundary(self, size: usize) -> Self {
        Self {
            backpressure_boundary: size,
            ..self
        }
    }

    /// Delivers text with invalid UTF-8 sequences replaced instead of closing the connection.
    pub fn without_utf8(self) -> Self {
        Self {
            check_utf8: false,
            ..self
        }
    }

    /// Rejects requests that use the legacy two-key handshake.
    pub fn without_legacy_handshake(self) -> Self {
        Self {
            legacy_handshake: false,
            ..self
        }
    }

    /// The effective read buffer limit.
    pub(crate) fn read_buffer_limit(&self) -> usize {
        let limit = self
            .max_read_buffer
            .unwrap_or_else(|| self.max_payload_read.saturating_add(MAX_HEAD_SIZE));
        limit.max(self.max_handshake_size).max(MAX_HANDSHAKE_SIZE)
    }
}
