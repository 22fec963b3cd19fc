//! # Frame
//!
//! WebSocket frames as defined in [RFC 6455 Section 5.2](https://datatracker.ietf.org/doc/html/rfc6455#section-5.2).
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |F|R|R|R| opcode|M| Payload len |    Extended payload length    |
//! |I|S|S|S|  (4)  |A|     (7)     |         (16 or 64 bits)       |
//! |N|V|V|V|       |S|             |                               |
//! | |1|2|3|       |K|             |                               |
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |        Extended payload length continued, if payload len == 127|
//! +---------------------------------------------------------------+
//! |                               |   Masking-key, if MASK set to 1|
//! +-------------------------------+-------------------------------+
//! |     Masking-key (continued)       |          Payload Data      |
//! +-----------------------------------+ - - - - - - - - - - - - - -+
//! :                     Payload Data continued ...                :
//! +---------------------------------------------------------------+
//! ```
//!
//! The payload length uses 7 bits up to 125 bytes, the marker 126 plus a 16-bit length below
//! 65536 bytes, and the marker 127 plus a 64-bit length otherwise. Both lengths are big-endian.
//!
//! Frames sent by this server are never masked. Frames built with a mask key (see
//! [`Frame::with_mask`]) are masked by the encoder, which is how a client would write them.
use bytes::BytesMut;

use crate::{close::CloseCode, WebSocketError};

/// WebSocket operation code, the 4-bit tag that determines how a frame is handled.
///
/// # Data Frame OpCodes
/// - `Continuation` (0x0): continues a fragmented message
/// - `Text` (0x1): UTF-8 text data
/// - `Binary` (0x2): raw binary data
///
/// # Control Frame OpCodes
/// - `Close` (0x8): initiates or confirms connection closure
/// - `Ping` (0x9): liveness check, answered with a `Pong`
/// - `Pong` (0xA): answer to a `Ping`
///
/// The ranges 0x3-0x7 and 0xB-0xF are reserved and rejected when decoding.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum OpCode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl OpCode {
    /// Returns `true` for `Close`, `Ping` and `Pong`.
    ///
    /// Control frames cannot be fragmented and carry at most 125 bytes of payload.
    pub fn is_control(&self) -> bool {
        matches!(*self, OpCode::Close | OpCode::Ping | OpCode::Pong)
    }
}

impl TryFrom<u8> for OpCode {
    type Error = WebSocketError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x0 => Ok(Self::Continuation),
            0x1 => Ok(Self::Text),
            0x2 => Ok(Self::Binary),
            0x8 => Ok(Self::Close),
            0x9 => Ok(Self::Ping),
            0xA => Ok(Self::Pong),
            _ => Err(WebSocketError::InvalidOpCode(value)),
        }
    }
}

impl From<OpCode> for u8 {
    fn from(val: OpCode) -> Self {
        match val {
            OpCode::Continuation => 0x0,
            OpCode::Text => 0x1,
            OpCode::Binary => 0x2,
            OpCode::Close => 0x8,
            OpCode::Ping => 0x9,
            OpCode::Pong => 0xA,
        }
    }
}

/// Largest possible frame header: 2 fixed bytes, 8 bytes of extended length, 4 bytes of mask.
pub(crate) const MAX_HEAD_SIZE: usize = 14;

/// Largest payload a control frame may carry.
pub(crate) const MAX_CONTROL_PAYLOAD: usize = 125;

/// A single WebSocket frame.
///
/// Decoded frames always hold their payload unmasked; the mask key is only kept for frames
/// that are about to be encoded.
///
/// # Fields
/// - `fin`: Final fragment flag. When `true`, this frame completes a message.
/// - `rsv1`..`rsv3`: Reserved bits, only meaningful when an extension is negotiated.
/// - `opcode`: Defines the frame type.
/// - `payload`: Frame payload data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Indicates if this is the final frame in a message.
    pub fin: bool,
    pub rsv1: bool,
    pub rsv2: bool,
    pub rsv3: bool,
    /// The opcode of the frame, defining its type.
    pub opcode: OpCode,
    /// Masking key applied by the encoder, if any.
    mask: Option<[u8; 4]>,
    /// The payload of the frame.
    pub payload: BytesMut,
}

impl Frame {
    /// Creates a new unmasked frame with all reserved bits cleared.
    pub fn new(fin: bool, opcode: OpCode, payload: impl Into<BytesMut>) -> Self {
        Self {
            fin,
            rsv1: false,
            rsv2: false,
            rsv3: false,
            opcode,
            mask: None,
            payload: payload.into(),
        }
    }

    /// Final text frame.
    pub fn text(payload: impl AsRef<[u8]>) -> Self {
        Self::new(true, OpCode::Text, payload.as_ref())
    }

    /// Final binary frame.
    pub fn binary(payload: impl AsRef<[u8]>) -> Self {
        Self::new(true, OpCode::Binary, payload.as_ref())
    }

    pub fn ping(payload: impl AsRef<[u8]>) -> Self {
        Self::new(true, OpCode::Ping, payload.as_ref())
    }

    pub fn pong(payload: impl AsRef<[u8]>) -> Self {
        Self::new(true, OpCode::Pong, payload.as_ref())
    }

    /// Close frame carrying `code` followed by `reason`.
    pub fn close(code: CloseCode, reason: impl AsRef<[u8]>) -> Self {
        let reason = reason.as_ref();
        let mut payload = BytesMut::with_capacity(2 + reason.len());
        payload.extend_from_slice(&u16::from(code).to_be_bytes());
        payload.extend_from_slice(reason);
        Self::new(true, OpCode::Close, payload)
    }

    /// Close frame with a raw payload.
    ///
    /// This method does not validate if `payload` is a valid close frame payload.
    pub fn close_raw(payload: impl AsRef<[u8]>) -> Self {
        Self::new(true, OpCode::Close, payload.as_ref())
    }

    /// Sets the key the encoder masks this frame with.
    pub fn with_mask(mut self, key: [u8; 4]) -> Self {
        self.mask = Some(key);
        self
    }

    /// Returns the mask key the encoder will apply, if any.
    #[inline]
    pub fn mask_key(&self) -> Option<[u8; 4]> {
        self.mask
    }

    #[inline]
    pub fn is_masked(&self) -> bool {
        self.mask.is_some()
    }

    #[inline]
    pub fn payload_len(&self) -> usize {
        self.payload.len()
    }

    /// Checks if the frame payload is valid UTF-8.
    #[inline(always)]
    pub fn is_utf8(&self) -> bool {
        is_utf8(&self.payload)
    }

    /// Extracts the status code from a close frame's payload, if it carries one.
    pub fn close_code(&self) -> Option<CloseCode> {
        let code = u16::from_be_bytes(self.payload.get(0..2)?.try_into().ok()?);
        Some(CloseCode::from(code))
    }

    /// Extracts the reason from a close frame's payload, if it is present and valid UTF-8.
    pub fn close_reason(&self) -> Option<&str> {
        std::str::from_utf8(self.payload.get(2..)?).ok()
    }

    /// Removes the mask from the payload.
    pub(crate) fn unmask(&mut self, key: [u8; 4]) {
        crate::mask::apply_mask(&mut self.payload, key);
        self.mask = None;
    }

    /// Formats the frame header into `head` and returns its size.
    ///
    /// # Panics
    /// Panics if `head` is shorter than [`MAX_HEAD_SIZE`].
    pub(crate) fn fmt_head(&self, head: &mut [u8]) -> usize {
        head[0] = (self.fin as u8) << 7
            | (self.rsv1 as u8) << 6
            | (self.rsv2 as u8) << 5
            | (self.rsv3 as u8) << 4
            | u8::from(self.opcode);

        let len = self.payload.len();
        let size = if len < 126 {
            head[1] = len as u8;
            2
        } else if len < 65536 {
            head[1] = 126;
            head[2..4].copy_from_slice(&(len as u16).to_be_bytes());
            4
        } else {
            head[1] = 127;
            head[2..10].copy_from_slice(&(len as u64).to_be_bytes());
            10
        };

        if let Some(mask) = self.mask {
            head[1] |= 0x80;
            head[size..size + 4].copy_from_slice(&mask);
            size + 4
        } else {
            size
        }
    }
}

#[inline]
pub(crate) fn is_utf8(data: &[u8]) -> bool {
    #[cfg(feature = "simd")]
    {
        simdutf8::basic::from_utf8(data).is_ok()
    }
    #[cfg(not(feature = "simd"))]
    {
        std::str::from_utf8(data).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod opcode_tests {
        use super::*;

        #[test]
        fn test_is_control() {
            assert!(OpCode::Close.is_control());
            assert!(OpCode::Ping.is_control());
            assert!(OpCode::Pong.is_control());

            assert!(!OpCode::Continuation.is_control());
            assert!(!OpCode::Text.is_control());
            assert!(!OpCode::Binary.is_control());
        }

        #[test]
        fn test_try_from_u8() {
            for op in [
                OpCode::Continuation,
                OpCode::Text,
                OpCode::Binary,
                OpCode::Close,
                OpCode::Ping,
                OpCode::Pong,
            ] {
                assert_eq!(OpCode::try_from(u8::from(op)).unwrap(), op);
            }

            for code in [0x3, 0x4, 0x5, 0x6, 0x7, 0xB, 0xC, 0xD, 0xE, 0xF] {
                assert!(matches!(
                    OpCode::try_from(code),
                    Err(WebSocketError::InvalidOpCode(c)) if c == code
                ));
            }
        }
    }

    mod frame_tests {
        use super::*;

        #[test]
        fn test_close_payload() {
            let frame = Frame::close(CloseCode::Normal, "bye");
            assert_eq!(frame.opcode, OpCode::Close);
            assert_eq!(&frame.payload[..], b"\x03\xE8bye");
            assert_eq!(frame.close_code(), Some(CloseCode::Normal));
            assert_eq!(frame.close_reason(), Some("bye"));

            let empty = Frame::close_raw(b"");
            assert_eq!(empty.close_code(), None);
            assert_eq!(empty.close_reason(), None);
        }

        #[test]
        fn test_is_utf8() {
            assert!(Frame::text("Hello, 世界").is_utf8());
            assert!(!Frame::binary([0xFF, 0xFE, 0xFD]).is_utf8());
        }

        #[test]
        fn test_fmt_head_small_masked() {
            let key = [0xAA, 0xBB, 0xCC, 0xDD];
            let frame = Frame::text("Header test").with_mask(key);

            let mut head = [0u8; MAX_HEAD_SIZE];
            let size = frame.fmt_head(&mut head);

            assert_eq!(size, 2 + 4);
            assert_eq!(head[0], 0x81);
            assert_eq!(head[1], 0x80 | 11);
            assert_eq!(&head[2..6], &key);
        }

        #[test]
        fn test_fmt_head_length_boundaries() {
            let cases: [(usize, usize, u8); 6] = [
                (0, 2, 0),
                (125, 2, 125),
                (126, 4, 126),
                (65535, 4, 126),
                (65536, 10, 127),
                (70000, 10, 127),
            ];

            for (len, head_size, marker) in cases {
                let frame = Frame::binary(vec![0u8; len]);
                let mut head = [0u8; MAX_HEAD_SIZE];
                assert_eq!(frame.fmt_head(&mut head), head_size, "len {len}");
                assert_eq!(head[1], marker, "len {len}");

                match head_size {
                    4 => assert_eq!(u16::from_be_bytes([head[2], head[3]]) as usize, len),
                    10 => {
                        let mut be = [0u8; 8];
                        be.copy_from_slice(&head[2..10]);
                        assert_eq!(u64::from_be_bytes(be) as usize, len);
                    }
                    _ => {}
                }
            }
        }

        #[test]
        fn test_fmt_head_reserved_bits() {
            let mut frame = Frame::new(false, OpCode::Binary, &b"x"[..]);
            frame.rsv1 = true;
            frame.rsv3 = true;

            let mut head = [0u8; MAX_HEAD_SIZE];
            frame.fmt_head(&mut head);
            assert_eq!(head[0], 0b0101_0010);
        }

        #[test]
        fn test_unmask() {
            let key = [0x01, 0x02, 0x03, 0x04];
            let mut frame = Frame::text("Mask me").with_mask(key);
            crate::mask::apply_mask(&mut frame.payload, key);
            assert_ne!(&frame.payload[..], b"Mask me");

            frame.unmask(key);
            assert_eq!(&frame.payload[..], b"Mask me");
            assert!(!frame.is_masked());
        }
    }
}
