//! Frame codecs.
//!
//! [`Codec`] speaks RFC 6455 framing; [`LegacyCodec`] speaks the `0x00 … 0xFF` framing used by
//! connections that negotiated the legacy two-key handshake. [`FrameCodec`] picks one of the two
//! from the negotiated [`HandshakeScheme`].
//!
//! All decoders follow the `tokio_util` contract: `Ok(None)` means more bytes are needed, and in
//! that case nothing is consumed from the source buffer.

use bytes::{Buf, Bytes, BytesMut};
use tokio_util::codec::{self, Decoder as _, Encoder as _};

use crate::{
    frame::{self, Frame, MAX_CONTROL_PAYLOAD, MAX_HEAD_SIZE},
    handshake::HandshakeScheme,
    OpCode, Result, WebSocketError,
};

/// A combined codec that provides both encoding and decoding of RFC 6455 frames.
pub struct Codec {
    decoder: Decoder,
    encoder: Encoder,
}

impl From<(Decoder, Encoder)> for Codec {
    fn from((decoder, encoder): (Decoder, Encoder)) -> Self {
        Self { decoder, encoder }
    }
}

impl codec::Decoder for Codec {
    type Item = <Decoder as codec::Decoder>::Item;
    type Error = <Decoder as codec::Decoder>::Error;

    #[inline]
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        self.decoder.decode(src)
    }
}

impl codec::Encoder<Frame> for Codec {
    type Error = <Encoder as codec::Encoder<Frame>>::Error;

    #[inline]
    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<()> {
        self.encoder.encode(item, dst)
    }
}

/// A decoder for RFC 6455 frames.
///
/// The decoder is stateless between calls: it peeks at the header, and only once the whole
/// frame is buffered does it split it off the source. Header-level violations (reserved bits,
/// unknown opcodes, oversized payloads) are reported as soon as the header bytes that reveal
/// them have arrived, without waiting for the payload.
pub struct Decoder {
    /// Maximum allowed size for the frame payload.
    max_payload_size: usize,
    /// Whether unmasked frames are a protocol error.
    require_mask: bool,
}

impl Decoder {
    /// Creates a new `Decoder` that rejects payloads larger than `max_payload_size` bytes.
    pub fn new(max_payload_size: usize) -> Self {
        Self {
            max_payload_size,
            require_mask: false,
        }
    }

    /// Rejects frames without a mask key, as a server must for client frames.
    pub fn require_mask(self, require_mask: bool) -> Self {
        Self {
            require_mask,
            ..self
        }
    }
}

impl codec::Decoder for Decoder {
    type Item = Frame;
    type Error = WebSocketError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        if src.len() < 2 {
            return Ok(None);
        }

        let fin = src[0] & 0b1000_0000 != 0;
        if src[0] & 0b0111_0000 != 0 {
            return Err(WebSocketError::ReservedBitsNotZero);
        }

        let opcode = OpCode::try_from(src[0] & 0b0000_1111)?;
        let masked = src[1] & 0b1000_0000 != 0;
        let length_code = src[1] & 0x7F;

        if opcode.is_control() {
            if !fin {
                return Err(WebSocketError::ControlFrameFragmented);
            }
            if usize::from(length_code) > MAX_CONTROL_PAYLOAD {
                return Err(WebSocketError::ControlFrameTooLarge);
            }
        }
        if self.require_mask && !masked {
            return Err(WebSocketError::UnmaskedFrame);
        }

        let extra = match length_code {
            126 => 2,
            127 => 8,
            _ => 0,
        };
        if src.len() < 2 + extra {
            return Ok(None);
        }

        let payload_len = match extra {
            0 => u64::from(length_code),
            2 => u64::from(u16::from_be_bytes([src[2], src[3]])),
            _ => {
                let mut be = [0u8; 8];
                be.copy_from_slice(&src[2..10]);
                u64::from_be_bytes(be)
            }
        };
        if payload_len > self.max_payload_size as u64 {
            return Err(WebSocketError::FrameTooLarge);
        }
        // bounded by max_payload_size above
        let payload_len = payload_len as usize;

        let header_size = 2 + extra + if masked { 4 } else { 0 };
        let frame_size = header_size + payload_len;
        if src.len() < frame_size {
            src.reserve(frame_size - src.len());
            return Ok(None);
        }

        let mask = masked.then(|| {
            let at = 2 + extra;
            [src[at], src[at + 1], src[at + 2], src[at + 3]]
        });

        src.advance(header_size);
        let payload = src.split_to(payload_len);

        let mut frame = Frame::new(fin, opcode, payload);
        if let Some(key) = mask {
            frame.unmask(key);
        }

        Ok(Some(frame))
    }
}

/// Serializes frames into RFC 6455 wire format.
///
/// Frames carrying a mask key are masked on the way out; server frames carry none.
pub struct Encoder;

impl codec::Encoder<Frame> for Encoder {
    type Error = WebSocketError;

    fn encode(&mut self, mut frame: Frame, dst: &mut BytesMut) -> Result<()> {
        let mut header = [0; MAX_HEAD_SIZE];
        let size = frame.fmt_head(&mut header[..]);

        if let Some(key) = frame.mask_key() {
            crate::mask::apply_mask(&mut frame.payload, key);
        }

        dst.reserve(size + frame.payload.len());
        dst.extend_from_slice(&header[..size]);
        dst.extend_from_slice(&frame.payload);

        Ok(())
    }
}

/// Codec for the framing that accompanies the legacy two-key handshake.
///
/// Text messages travel as `0x00 ++ utf8 ++ 0xFF` and the closing handshake is the two bytes
/// `0xFF 0x00`. Nothing is masked and there are no control frames besides close.
pub struct LegacyCodec {
    max_payload_size: usize,
}

const LEGACY_TEXT_START: u8 = 0x00;
const LEGACY_SENTINEL: u8 = 0xFF;

impl LegacyCodec {
    pub fn new(max_payload_size: usize) -> Self {
        Self { max_payload_size }
    }
}

impl codec::Decoder for LegacyCodec {
    type Item = Frame;
    type Error = WebSocketError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        let Some(&kind) = src.first() else {
            return Ok(None);
        };

        match kind {
            LEGACY_TEXT_START => {
                let Some(end) = src[1..].iter().position(|&b| b == LEGACY_SENTINEL) else {
                    if src.len() - 1 > self.max_payload_size {
                        return Err(WebSocketError::FrameTooLarge);
                    }
                    return Ok(None);
                };
                if end > self.max_payload_size {
                    return Err(WebSocketError::FrameTooLarge);
                }

                src.advance(1);
                let payload = src.split_to(end);
                src.advance(1);

                Ok(Some(Frame::new(true, OpCode::Text, payload)))
            }
            LEGACY_SENTINEL => match src.get(1) {
                None => Ok(None),
                Some(0x00) => {
                    src.advance(2);
                    Ok(Some(Frame::close_raw(b"")))
                }
                Some(_) => Err(WebSocketError::InvalidLegacyFrame(kind)),
            },
            other => Err(WebSocketError::InvalidLegacyFrame(other)),
        }
    }
}

impl codec::Encoder<Frame> for LegacyCodec {
    type Error = WebSocketError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<()> {
        match frame.opcode {
            OpCode::Text => {
                // a UTF-8 payload never contains 0xFF, so the sentinel stays unambiguous
                if !frame::is_utf8(&frame.payload) {
                    return Err(WebSocketError::InvalidUTF8);
                }
                dst.reserve(frame.payload.len() + 2);
                dst.extend_from_slice(&[LEGACY_TEXT_START]);
                dst.extend_from_slice(&frame.payload);
                dst.extend_from_slice(&[LEGACY_SENTINEL]);
                Ok(())
            }
            OpCode::Close => {
                dst.extend_from_slice(&[LEGACY_SENTINEL, 0x00]);
                Ok(())
            }
            _ => Err(WebSocketError::UnsupportedFrame),
        }
    }
}

/// The codec in use on one connection, selected by its handshake scheme.
pub enum FrameCodec {
    Rfc6455(Codec),
    Legacy(LegacyCodec),
}

impl FrameCodec {
    /// Builds the server-side codec for `scheme`.
    ///
    /// RFC 6455 connections require every client frame to be masked.
    pub fn new(scheme: HandshakeScheme, max_payload_size: usize) -> Self {
        match scheme {
            HandshakeScheme::Rfc6455 => Self::Rfc6455(Codec::from((
                Decoder::new(max_payload_size).require_mask(scheme.requires_masking()),
                Encoder,
            ))),
            HandshakeScheme::Legacy => Self::Legacy(LegacyCodec::new(max_payload_size)),
        }
    }
}

impl codec::Decoder for FrameCodec {
    type Item = Frame;
    type Error = WebSocketError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        match self {
            Self::Rfc6455(codec) => codec.decode(src),
            Self::Legacy(codec) => codec.decode(src),
        }
    }
}

impl codec::Encoder<Frame> for FrameCodec {
    type Error = WebSocketError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<()> {
        match self {
            Self::Rfc6455(codec) => codec.encode(item, dst),
            Self::Legacy(codec) => codec.encode(item, dst),
        }
    }
}

/// Encodes a single frame for a connection using `scheme`.
///
/// Used to encode a broadcast once and hand the same bytes to every recipient.
pub fn encode(scheme: HandshakeScheme, frame: Frame) -> Result<Bytes> {
    let mut dst = BytesMut::with_capacity(frame.payload_len() + MAX_HEAD_SIZE);
    match scheme {
        HandshakeScheme::Rfc6455 => Encoder.encode(frame, &mut dst)?,
        HandshakeScheme::Legacy => LegacyCodec::new(usize::MAX).encode(frame, &mut dst)?,
    }
    Ok(dst.freeze())
}
