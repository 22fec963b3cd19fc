//! Registry of live connections.
//!
//! The registry is the only state shared between connection tasks. Each entry holds the
//! sending side of the connection task's bounded command channel and a status block the task
//! keeps up to date, so send and broadcast never need to reach into a task's [`Connection`].
//!
//! Close requests do not go through the channel: they are stored in the status block and the
//! task is woken, so a connection whose queue is backed up can still be closed.
//!
//! [`Connection`]: crate::Connection

use std::{
    collections::HashMap,
    fmt,
    num::ParseIntError,
    str::FromStr,
    sync::{
        atomic::{AtomicU16, AtomicU64, AtomicU8, Ordering},
        Arc,
    },
};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{
    mpsc::{error::TrySendError, Sender},
    futures::Notified,
    Notify,
};

use crate::{
    close::CloseCode, codec, connection::State, frame::Frame, handshake::HandshakeScheme, Result,
    WebSocketError,
};

/// Identifies a connection within one server. Displayed as `#<n>`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    #[inline]
    pub const fn raw(self) -> u64 {
        self.0
    }
}

impl From<u64> for ConnectionId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Parses `#3` as well as `3`.
impl FromStr for ConnectionId {
    type Err = ParseIntError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        s.trim().trim_start_matches('#').parse().map(Self)
    }
}

/// A command for a connection task.
#[derive(Debug)]
pub(crate) enum Outbound {
    Text(String),
    /// Bytes already encoded for the connection's scheme.
    Encoded(Bytes),
}

/// Connection state mirrored by the owning task, plus pending close requests for it.
#[derive(Debug)]
pub(crate) struct PeerStatus {
    state: AtomicU8,
    scheme: AtomicU8,
    /// Requested close code, `0` when none.
    close_code: AtomicU16,
    close_notify: Notify,
}

const SCHEME_NONE: u8 = 0;
const SCHEME_RFC6455: u8 = 1;
const SCHEME_LEGACY: u8 = 2;

impl Default for PeerStatus {
    fn default() -> Self {
        Self {
            state: AtomicU8::new(state_to_u8(State::Connecting)),
            scheme: AtomicU8::new(SCHEME_NONE),
            close_code: AtomicU16::new(0),
            close_notify: Notify::new(),
        }
    }
}

impl PeerStatus {
    pub(crate) fn state(&self) -> State {
        state_from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: State) {
        self.state.store(state_to_u8(state), Ordering::Release);
    }

    pub(crate) fn scheme(&self) -> Option<HandshakeScheme> {
        match self.scheme.load(Ordering::Acquire) {
            SCHEME_RFC6455 => Some(HandshakeScheme::Rfc6455),
            SCHEME_LEGACY => Some(HandshakeScheme::Legacy),
            _ => None,
        }
    }

    pub(crate) fn set_scheme(&self, scheme: HandshakeScheme) {
        let value = match scheme {
            HandshakeScheme::Rfc6455 => SCHEME_RFC6455,
            HandshakeScheme::Legacy => SCHEME_LEGACY,
        };
        self.scheme.store(value, Ordering::Release);
    }

    /// Asks the owning task to close the connection. The first request wins.
    pub(crate) fn request_close(&self, code: CloseCode) {
        let _ = self.close_code.compare_exchange(
            0,
            u16::from(code),
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        self.close_notify.notify_one();
    }

    /// Takes the pending close request, if any.
    pub(crate) fn take_close_request(&self) -> Option<CloseCode> {
        match self.close_code.swap(0, Ordering::AcqRel) {
            0 => None,
            code => Some(CloseCode::from(code)),
        }
    }

    /// Completes when a close was requested.
    pub(crate) fn close_requested(&self) -> Notified<'_> {
        self.close_notify.notified()
    }
}

fn state_to_u8(state: State) -> u8 {
    match state {
        State::Connecting => 0,
        State::Handshaking => 1,
        State::Open => 2,
        State::Closing => 3,
        State::Closed => 4,
    }
}

fn state_from_u8(value: u8) -> State {
    match value {
        0 => State::Connecting,
        1 => State::Handshaking,
        2 => State::Open,
        3 => State::Closing,
        _ => State::Closed,
    }
}

/// A registry entry.
#[derive(Debug, Clone)]
pub(crate) struct Peer {
    pub(crate) tx: Sender<Outbound>,
    pub(crate) status: Arc<PeerStatus>,
}

impl Peer {
    pub(crate) fn new(tx: Sender<Outbound>) -> Self {
        Self {
            tx,
            status: Arc::default(),
        }
    }

    /// The task is gone or the connection finished.
    fn is_stale(&self) -> bool {
        self.tx.is_closed() || self.status.state() == State::Closed
    }
}

#[derive(Debug, Default)]
pub(crate) struct Registry {
    next_id: AtomicU64,
    peers: Mutex<HashMap<ConnectionId, Peer>>,
}

impl Registry {
    /// Allocates the next connection id, starting at `#1`.
    pub(crate) fn next_id(&self) -> ConnectionId {
        ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1)
    }

    pub(crate) fn insert(&self, id: ConnectionId, peer: Peer) {
        self.peers.lock().insert(id, peer);
    }

    pub(crate) fn remove(&self, id: ConnectionId) -> Option<Peer> {
        self.peers.lock().remove(&id)
    }

    pub(crate) fn len(&self) -> usize {
        self.peers.lock().len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.peers.lock().is_empty()
    }

    /// Ids of all registered connections, in ascending order.
    pub(crate) fn ids(&self) -> Vec<ConnectionId> {
        let mut ids: Vec<_> = self.peers.lock().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Hands `command` to the task owning `id`.
    ///
    /// Messages are only accepted for open connections. A peer whose task is gone is removed
    /// on the way; a peer whose queue is full is evicted and closed with `1008`.
    pub(crate) fn send(&self, id: ConnectionId, command: Outbound) -> Result<()> {
        let mut peers = self.peers.lock();
        let peer = peers
            .get(&id)
            .ok_or(WebSocketError::UnknownConnection(id))?;

        if peer.is_stale() {
            peers.remove(&id);
            return Err(WebSocketError::ConnectionClosed);
        }
        if peer.status.state() != State::Open {
            return Err(WebSocketError::ConnectionClosed);
        }
        if !deliver(&id, peer, command) {
            peers.remove(&id);
            return Err(WebSocketError::ConnectionClosed);
        }
        Ok(())
    }

    /// Asks the task owning `id` to close the connection with `code`.
    ///
    /// Accepted in any state. Messages already queued are still written unless the peer has
    /// stopped reading.
    pub(crate) fn close(&self, id: ConnectionId, code: CloseCode) -> Result<()> {
        let mut peers = self.peers.lock();
        let peer = peers
            .get(&id)
            .ok_or(WebSocketError::UnknownConnection(id))?;

        if peer.is_stale() {
            peers.remove(&id);
            return Err(WebSocketError::ConnectionClosed);
        }
        peer.status.request_close(code);
        Ok(())
    }

    /// Sends `text` to every open connection and returns the number of recipients.
    ///
    /// The frame is encoded once per scheme in use. Stale entries are dropped; connections
    /// still handshaking or closing are skipped.
    pub(crate) fn broadcast(&self, text: &str) -> usize {
        let mut rfc6455 = None;
        let mut legacy = None;
        let mut sent = 0;

        self.peers.lock().retain(|_id, peer| {
            if peer.is_stale() {
                #[cfg(feature = "logging")]
                log::debug!("{_id}: dropped from registry during broadcast");
                return false;
            }
            if peer.status.state() != State::Open {
                return true;
            }

            let bytes = match peer.status.scheme() {
                Some(HandshakeScheme::Rfc6455) => {
                    encoded(&mut rfc6455, HandshakeScheme::Rfc6455, text)
                }
                Some(HandshakeScheme::Legacy) => encoded(&mut legacy, HandshakeScheme::Legacy, text),
                None => return true,
            };
            let Some(bytes) = bytes else {
                return true;
            };

            if !deliver(_id, peer, Outbound::Encoded(bytes)) {
                return false;
            }
            sent += 1;
            true
        });

        sent
    }
}

/// Queues `command` for `peer`. Returns `false` if the peer must leave the registry.
fn deliver(_id: &ConnectionId, peer: &Peer, command: Outbound) -> bool {
    match peer.tx.try_send(command) {
        Ok(()) => true,
        Err(TrySendError::Full(_)) => {
            #[cfg(feature = "logging")]
            log::warn!("{_id}: message queue full, closing");
            peer.status.request_close(CloseCode::Policy);
            false
        }
        Err(TrySendError::Closed(_)) => false,
    }
}

/// Encodes `text` for `scheme` the first time it is needed.
fn encoded(slot: &mut Option<Bytes>, scheme: HandshakeScheme, text: &str) -> Option<Bytes> {
    if slot.is_none() {
        *slot = codec::encode(scheme, Frame::text(text)).ok();
    }
    slot.clone()
}
