//! Connection lifecycle.
//!
//! A [`Connection`] owns everything one peer needs between accept and teardown: the receive
//! buffer, the handshake negotiator and, once upgraded, the frame codec for the negotiated
//! scheme. It never touches a socket. The driver feeds received bytes to
//! [`Connection::receive`], writes whatever [`Connection::take_outbound`] returns, and reacts to
//! the returned [`ConnectionEvent`]s.
//!
//! ```text
//! Connecting -> Handshaking -> Open -> Closing -> Closed
//!                    |           |                  ^
//!                    +-----------+------------------+  (rejection, protocol error, timeout)
//! ```

use std::{mem, time::Duration};

use bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder as _, Encoder as _};

use crate::{
    buffer::Accumulator,
    close::CloseCode,
    codec::FrameCodec,
    frame::{self, Frame, OpCode},
    handshake::{HandshakeOutcome, HandshakeScheme, Negotiator, REJECT_RESPONSE},
    options::Options,
    registry::ConnectionId,
    Result, WebSocketError,
};

/// Lifecycle state of a connection.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum State {
    /// Accepted by the transport, nothing received yet.
    Connecting,
    /// Waiting for a complete upgrade request.
    Handshaking,
    /// Upgraded; frames flow both ways.
    Open,
    /// A close frame was sent or received; waiting for the closing handshake to finish.
    Closing,
    Closed,
}

/// Something the application should hear about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// The upgrade was accepted.
    Opened,
    /// A complete text or binary message, as text.
    Message(String),
    /// The connection is gone. Only emitted for connections that were opened, and only once.
    Closed,
}

/// The protocol state of one connection.
pub struct Connection {
    id: ConnectionId,
    state: State,
    buffer: Accumulator,
    negotiator: Negotiator,
    codec: Option<FrameCodec>,
    scheme: Option<HandshakeScheme>,
    /// Encoded bytes waiting to be written to the transport.
    outbound: BytesMut,
    /// Events produced but not yet handed to the driver.
    pending: Vec<ConnectionEvent>,
    /// Opcode of the message being reassembled from fragments.
    fragment: Option<OpCode>,
    accumulated: BytesMut,
    max_payload_read: usize,
    check_utf8: bool,
    handshake_timeout: Option<Duration>,
    idle_timeout: Option<Duration>,
    close_timeout: Duration,
    /// The peer sent its close frame.
    peer_closed: bool,
    opened: bool,
    closed_emitted: bool,
}

impl Connection {
    /// Creates a connection in the `Connecting` state.
    pub fn new(id: ConnectionId, options: &Options) -> Self {
        Self {
            id,
            state: State::Connecting,
            buffer: Accumulator::new(options.read_buffer_limit()),
            negotiator: Negotiator::new(options.max_handshake_size, options.legacy_handshake),
            codec: None,
            scheme: None,
            outbound: BytesMut::new(),
            pending: Vec::new(),
            fragment: None,
            accumulated: BytesMut::new(),
            max_payload_read: options.max_payload_read,
            check_utf8: options.check_utf8,
            handshake_timeout: options.handshake_timeout,
            idle_timeout: options.idle_timeout,
            close_timeout: options.close_timeout,
            peer_closed: false,
            opened: false,
            closed_emitted: false,
        }
    }

    #[inline]
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    #[inline]
    pub fn state(&self) -> State {
        self.state
    }

    /// The negotiated handshake scheme, once the connection is open.
    #[inline]
    pub fn scheme(&self) -> Option<HandshakeScheme> {
        self.scheme
    }

    /// Whether client frames must be masked. Always `true` before the handshake completes.
    pub fn requires_masking(&self) -> bool {
        self.scheme.map_or(true, HandshakeScheme::requires_masking)
    }

    /// Moves a freshly accepted connection to `Handshaking`.
    pub fn accept(&mut self) {
        if self.state == State::Connecting {
            self.state = State::Handshaking;
        }
    }

    /// Feeds bytes received from the transport.
    ///
    /// Handshake bytes and frames may be split or coalesced arbitrarily; anything incomplete
    /// stays buffered for the next call. On error the connection is `Closed`, a close frame
    /// (or a `400` response during the handshake) may be queued, and events decoded before
    /// the error remain available from [`Connection::on_disconnect`].
    pub fn receive(&mut self, data: &[u8]) -> Result<Vec<ConnectionEvent>> {
        self.accept();

        let mut rest = data;
        while !rest.is_empty() && self.state != State::Closed {
            let room = self.buffer.limit() - self.buffer.len();
            if room == 0 {
                if self.state == State::Handshaking {
                    self.outbound.extend_from_slice(REJECT_RESPONSE);
                }
                return Err(self.fail(WebSocketError::ReadBufferFull));
            }

            let (chunk, tail) = rest.split_at(room.min(rest.len()));
            rest = tail;
            if let Err(err) = self.buffer.append(chunk).and_then(|_| self.process()) {
                return Err(self.fail(err));
            }
        }

        Ok(mem::take(&mut self.pending))
    }

    /// Queues a text message.
    pub fn send_text(&mut self, text: &str) -> Result<()> {
        if self.state != State::Open {
            return Err(WebSocketError::ConnectionClosed);
        }
        self.queue(Frame::text(text))
    }

    /// Queues bytes that were already encoded for this connection's scheme.
    pub fn send_encoded(&mut self, bytes: &[u8]) -> Result<()> {
        if self.state != State::Open {
            return Err(WebSocketError::ConnectionClosed);
        }
        self.outbound.extend_from_slice(bytes);
        Ok(())
    }

    /// Starts a server-initiated close.
    ///
    /// An open connection queues a close frame and waits in `Closing` for the peer's reply. A
    /// connection that never opened goes straight to `Closed`.
    pub fn close(&mut self, code: CloseCode) {
        match self.state {
            State::Open => {
                if let Err(_err) = self.queue(Frame::close(code, "")) {
                    #[cfg(feature = "logging")]
                    log::warn!("{}: unable to encode close frame: {_err}", self.id);
                }
                self.state = State::Closing;
            }
            State::Connecting | State::Handshaking => self.state = State::Closed,
            State::Closing | State::Closed => {}
        }
    }

    /// Completes a closing handshake started by the peer, once our reply was flushed.
    ///
    /// Does nothing while a server-initiated close is still waiting for the peer's reply.
    pub fn finish(&mut self) -> Option<ConnectionEvent> {
        if self.state == State::Closing && self.peer_closed {
            self.state = State::Closed;
            return self.closed_event();
        }
        None
    }

    /// Tears the connection down after the transport went away or the driver gave up on it.
    ///
    /// Returns the events still pending, followed by `Closed` if the connection had opened and
    /// that was not reported yet.
    pub fn on_disconnect(&mut self) -> Vec<ConnectionEvent> {
        self.state = State::Closed;
        let mut events = mem::take(&mut self.pending);
        events.extend(self.closed_event());
        events
    }

    /// Takes everything queued for the transport.
    pub fn take_outbound(&mut self) -> Option<Bytes> {
        if self.outbound.is_empty() {
            None
        } else {
            Some(self.outbound.split().freeze())
        }
    }

    /// Number of bytes queued for the transport.
    #[inline]
    pub fn outbound_len(&self) -> usize {
        self.outbound.len()
    }

    /// How long the connection may stay silent in its current state.
    pub fn timeout(&self) -> Option<Duration> {
        match self.state {
            State::Connecting | State::Handshaking => self.handshake_timeout,
            State::Open => self.idle_timeout,
            State::Closing => Some(self.close_timeout),
            State::Closed => None,
        }
    }

    /// Called by the driver when [`Connection::timeout`] elapsed without any input.
    ///
    /// Idle open connections are closed with `1001`. A close that was never answered just
    /// finishes. Either way the connection ends up `Closed`.
    pub fn on_timeout(&mut self) -> Result<()> {
        match self.state {
            State::Connecting | State::Handshaking => {
                Err(self.fail(WebSocketError::HandshakeTimeout))
            }
            State::Open => Err(self.fail(WebSocketError::IdleTimeout)),
            State::Closing | State::Closed => {
                self.state = State::Closed;
                Ok(())
            }
        }
    }

    /// Makes as much progress as the buffered bytes allow.
    fn process(&mut self) -> Result<()> {
        loop {
            match self.state {
                State::Handshaking => {
                    match self.negotiator.try_negotiate(self.buffer.as_slice()) {
                        HandshakeOutcome::Incomplete => return Ok(()),
                        HandshakeOutcome::Rejected(err) => {
                            #[cfg(feature = "logging")]
                            log::debug!("{}: handshake rejected: {err}", self.id);
                            self.outbound.extend_from_slice(REJECT_RESPONSE);
                            return Err(err);
                        }
                        HandshakeOutcome::Accepted(upgrade) => {
                            #[cfg(feature = "logging")]
                            log::debug!("{}: upgraded using {:?}", self.id, upgrade.scheme);

                            self.buffer.remove_range(0, upgrade.consumed);
                            self.outbound.extend_from_slice(&upgrade.response);
                            self.codec = Some(FrameCodec::new(upgrade.scheme, self.max_payload_read));
                            self.scheme = Some(upgrade.scheme);
                            self.state = State::Open;
                            self.opened = true;
                            self.pending.push(ConnectionEvent::Opened);
                        }
                    }
                }
                State::Open | State::Closing => {
                    let Some(codec) = self.codec.as_mut() else {
                        return Ok(());
                    };
                    let Some(frame) = codec.decode(self.buffer.bytes_mut())? else {
                        return Ok(());
                    };
                    self.on_frame(frame)?;
                }
                State::Connecting | State::Closed => return Ok(()),
            }
        }
    }

    fn on_frame(&mut self, frame: Frame) -> Result<()> {
        #[cfg(feature = "logging")]
        log::trace!(
            "{}: <<fin={} {:?} len={}",
            self.id,
            frame.fin,
            frame.opcode,
            frame.payload_len()
        );

        match frame.opcode {
            OpCode::Text | OpCode::Binary => {
                if self.fragment.is_some() {
                    return Err(WebSocketError::InvalidFragment);
                }
                if frame.fin {
                    return self.on_message(frame.opcode, frame.payload);
                }

                self.fragment = Some(frame.opcode);
                self.accumulated.extend_from_slice(&frame.payload);
                Ok(())
            }
            OpCode::Continuation => {
                let opcode = self
                    .fragment
                    .ok_or(WebSocketError::InvalidContinuationFrame)?;

                if self.accumulated.len() + frame.payload.len() > self.max_payload_read {
                    return Err(WebSocketError::FrameTooLarge);
                }
                self.accumulated.extend_from_slice(&frame.payload);

                if frame.fin {
                    self.fragment = None;
                    let payload = self.accumulated.split();
                    return self.on_message(opcode, payload);
                }
                Ok(())
            }
            OpCode::Ping => {
                if self.state == State::Open {
                    self.queue(Frame::pong(&frame.payload))?;
                }
                Ok(())
            }
            OpCode::Pong => Ok(()),
            OpCode::Close => self.on_close(&frame),
        }
    }

    fn on_message(&mut self, opcode: OpCode, payload: BytesMut) -> Result<()> {
        // data that arrives after a close frame is dropped
        if self.state != State::Open {
            return Ok(());
        }
        if opcode == OpCode::Text && self.check_utf8 && !frame::is_utf8(&payload) {
            return Err(WebSocketError::InvalidUTF8);
        }

        let text = String::from_utf8_lossy(&payload).into_owned();
        self.pending.push(ConnectionEvent::Message(text));
        Ok(())
    }

    fn on_close(&mut self, frame: &Frame) -> Result<()> {
        match frame.payload.len() {
            0 => {}
            1 => return Err(WebSocketError::InvalidCloseFrame),
            _ => {
                let code = frame
                    .close_code()
                    .ok_or(WebSocketError::InvalidCloseFrame)?;
                if frame.close_reason().is_none() {
                    return Err(WebSocketError::InvalidUTF8);
                }
                if !code.is_allowed() {
                    return Err(WebSocketError::InvalidCloseCode);
                }
            }
        }

        self.peer_closed = true;
        match self.state {
            State::Open => {
                #[cfg(feature = "logging")]
                log::debug!("{}: peer closed {:?}", self.id, frame.close_code());

                self.queue(Frame::close_raw(&frame.payload))?;
                self.state = State::Closing;
            }
            State::Closing => {
                self.state = State::Closed;
                let event = self.closed_event();
                self.pending.extend(event);
            }
            _ => {}
        }
        Ok(())
    }

    fn queue(&mut self, frame: Frame) -> Result<()> {
        let codec = self
            .codec
            .as_mut()
            .ok_or(WebSocketError::ConnectionClosed)?;
        codec.encode(frame, &mut self.outbound)
    }

    /// Moves to `Closed`, queueing the close frame the error calls for.
    fn fail(&mut self, err: WebSocketError) -> WebSocketError {
        if self.state == State::Open {
            if let Some(code) = err.close_code() {
                let _ = self.queue(Frame::close(code, err.to_string()));
            }
        }
        self.state = State::Closed;
        err
    }

    fn closed_event(&mut self) -> Option<ConnectionEvent> {
        if self.opened && !self.closed_emitted {
            self.closed_emitted = true;
            return Some(ConnectionEvent::Closed);
        }
        None
    }
}
