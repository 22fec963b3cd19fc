//! Per-connection receive buffer.
//!
//! TCP delivers the upgrade request and the frames that follow in arbitrary chunks. The
//! [`Accumulator`] collects those chunks until the handshake negotiator or the frame codec can
//! make progress, and refuses to grow past a fixed limit.

use bytes::BytesMut;

use crate::{Result, WebSocketError};

/// Initial capacity of an accumulator, large enough for a typical upgrade request.
const INITIAL_CAPACITY: usize = 4096;

/// A bounded, growable byte buffer.
#[derive(Debug)]
pub struct Accumulator {
    buf: BytesMut,
    limit: usize,
}

impl Accumulator {
    /// Creates an empty accumulator that holds at most `limit` bytes.
    pub fn new(limit: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(INITIAL_CAPACITY.min(limit)),
            limit,
        }
    }

    /// Appends a chunk received from the transport.
    ///
    /// Fails with [`WebSocketError::ReadBufferFull`] and leaves the buffer untouched if the
    /// chunk would take it past its limit.
    pub fn append(&mut self, chunk: &[u8]) -> Result<()> {
        if self.buf.len() + chunk.len() > self.limit {
            return Err(WebSocketError::ReadBufferFull);
        }
        self.buf.extend_from_slice(chunk);
        Ok(())
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Maximum number of bytes the accumulator accepts.
    #[inline]
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Returns the position of the first occurrence of `pattern`.
    pub fn find(&self, pattern: &[u8]) -> Option<usize> {
        find(&self.buf, pattern)
    }

    /// Returns `count` bytes starting at `start`, clamped to the buffered data.
    pub fn slice(&self, start: usize, count: usize) -> &[u8] {
        let start = start.min(self.buf.len());
        let end = start.saturating_add(count).min(self.buf.len());
        &self.buf[start..end]
    }

    /// Removes `count` bytes starting at `start`, clamped to the buffered data.
    pub fn remove_range(&mut self, start: usize, count: usize) {
        let start = start.min(self.buf.len());
        let end = start.saturating_add(count).min(self.buf.len());
        if start == 0 {
            let _ = self.buf.split_to(end);
        } else {
            let tail = self.buf.split_off(end);
            self.buf.truncate(start);
            self.buf.unsplit(tail);
        }
    }

    /// Drops all buffered bytes.
    #[inline]
    pub fn clear(&mut self) {
        self.buf.clear();
    }

    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    /// Gives the codec direct access so it can split complete frames off the front.
    #[inline]
    pub(crate) fn bytes_mut(&mut self) -> &mut BytesMut {
        &mut self.buf
    }
}

/// Returns the position of the first occurrence of `needle` in `haystack`.
pub(crate) fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() {
        return Some(0);
    }
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
