//! TCP server.
//!
//! [`Server`] owns the listener and spawns one task per accepted socket. Each task drives a
//! [`Connection`] and is the only place that touches its socket; everything else talks to it
//! through the registry, which is what [`Handle`] wraps.
//!
//! A task never waits on a write alone: pending bytes are written from the same `select!` that
//! reads the socket, the message queue, close requests and the connection's deadline. Once more
//! than [`Options::backpressure_boundary`] bytes are waiting, the task stops reading until the
//! peer catches up, so its message queue fills and the registry evicts it.

use std::{
    io,
    net::{Ipv4Addr, SocketAddr},
    sync::Arc,
    time::Duration,
};

use bytes::{Buf, Bytes};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpListener, TcpStream, ToSocketAddrs,
    },
    sync::mpsc::{self, Receiver, UnboundedSender},
    time::{sleep_until, timeout, Instant},
};

use crate::{
    close::CloseCode,
    connection::{Connection, ConnectionEvent, State},
    options::Options,
    registry::{ConnectionId, Outbound, Peer, PeerStatus, Registry},
    Result,
};

/// Size of the buffer each connection task reads into.
const READ_CHUNK: usize = 8 * 1024;

/// Pause after a failed accept, so a full file descriptor table does not spin the loop.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// A connection event, as delivered by the [`EventHandler`] implementation for
/// [`UnboundedSender<Event>`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Opened(ConnectionId),
    Message(ConnectionId, String),
    Closed(ConnectionId),
}

/// Receives connection events.
///
/// The handler is called from the connection's task, in the order events happen on that
/// connection. The [`Handle`] can be used to reply, broadcast or disconnect; none of its methods
/// block.
pub trait EventHandler: Send + Sync + 'static {
    /// The upgrade handshake completed.
    fn on_open(&self, handle: &Handle, id: ConnectionId) {
        let _ = (handle, id);
    }

    /// A complete message arrived.
    fn on_message(&self, handle: &Handle, id: ConnectionId, text: String) {
        let _ = (handle, id, text);
    }

    /// An opened connection is gone.
    fn on_close(&self, handle: &Handle, id: ConnectionId) {
        let _ = (handle, id);
    }
}

/// Forwards events into a channel.
impl EventHandler for UnboundedSender<Event> {
    fn on_open(&self, _handle: &Handle, id: ConnectionId) {
        let _ = self.send(Event::Opened(id));
    }

    fn on_message(&self, _handle: &Handle, id: ConnectionId, text: String) {
        let _ = self.send(Event::Message(id, text));
    }

    fn on_close(&self, _handle: &Handle, id: ConnectionId) {
        let _ = self.send(Event::Closed(id));
    }
}

/// A cloneable handle to a running server's connections.
#[derive(Debug, Clone)]
pub struct Handle {
    registry: Arc<Registry>,
}

impl Handle {
    /// Sends a text message to one connection.
    ///
    /// # Errors
    /// [`UnknownConnection`] if no such connection is registered, [`ConnectionClosed`] if it is
    /// not open.
    ///
    /// [`UnknownConnection`]: crate::WebSocketError::UnknownConnection
    /// [`ConnectionClosed`]: crate::WebSocketError::ConnectionClosed
    pub fn send(&self, id: ConnectionId, text: &str) -> Result<()> {
        self.registry.send(id, Outbound::Text(text.to_owned()))
    }

    /// Sends a text message to every open connection and returns how many were reached.
    pub fn broadcast(&self, text: &str) -> usize {
        self.registry.broadcast(text)
    }

    /// Closes a connection with `1000`.
    ///
    /// Takes effect even when the peer stopped reading; messages still queued for it are then
    /// dropped.
    pub fn disconnect(&self, id: ConnectionId) -> Result<()> {
        self.registry.close(id, CloseCode::Normal)
    }

    /// Ids of all registered connections, in ascending order.
    pub fn connections(&self) -> Vec<ConnectionId> {
        self.registry.ids()
    }

    /// Number of registered connections, including those still handshaking.
    pub fn len(&self) -> usize {
        self.registry.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registry.is_empty()
    }

    /// Serializes `data` to JSON and sends it to one connection.
    #[cfg(feature = "json")]
    #[cfg_attr(docsrs, doc(cfg(feature = "json")))]
    pub fn send_json<T: serde::Serialize>(&self, id: ConnectionId, data: &T) -> Result<()> {
        let text = serde_json::to_string(data)?;
        self.send(id, &text)
    }

    /// Serializes `data` to JSON once and sends it to every open connection.
    #[cfg(feature = "json")]
    #[cfg_attr(docsrs, doc(cfg(feature = "json")))]
    pub fn broadcast_json<T: serde::Serialize>(&self, data: &T) -> Result<usize> {
        let text = serde_json::to_string(data)?;
        Ok(self.broadcast(&text))
    }
}

/// A WebSocket server bound to a TCP port.
///
/// # Example
/// ```no_run
/// use tokio::sync::mpsc;
/// use wsbridge::{Event, Options, Server};
///
/// #[tokio::main]
/// async fn main() -> wsbridge::Result<()> {
///     let (tx, mut rx) = mpsc::unbounded_channel();
///     let server = Server::bind("127.0.0.1:9001", Options::default(), tx).await?;
///     let handle = server.handle();
///     tokio::spawn(server.run());
///
///     while let Some(event) = rx.recv().await {
///         if let Event::Message(_, text) = event {
///             handle.broadcast(&text);
///         }
///     }
///     Ok(())
/// }
/// ```
pub struct Server {
    listener: TcpListener,
    options: Arc<Options>,
    handler: Arc<dyn EventHandler>,
    handle: Handle,
}

impl Server {
    /// Binds a server to `addr`.
    pub async fn bind(
        addr: impl ToSocketAddrs,
        options: Options,
        handler: impl EventHandler,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;

        #[cfg(feature = "logging")]
        log::info!("listening on {}", listener.local_addr()?);

        Ok(Self {
            listener,
            options: Arc::new(options),
            handler: Arc::new(handler),
            handle: Handle {
                registry: Arc::default(),
            },
        })
    }

    /// Binds a server to `port` on all IPv4 interfaces.
    pub async fn start(port: u16, options: Options, handler: impl EventHandler) -> Result<Self> {
        Self::bind((Ipv4Addr::UNSPECIFIED, port), options, handler).await
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn handle(&self) -> Handle {
        self.handle.clone()
    }

    /// Accepts connections until the task is dropped.
    ///
    /// Accept failures are logged and do not stop the loop.
    pub async fn run(self) -> Result<()> {
        loop {
            match self.listener.accept().await {
                Ok((stream, _addr)) => {
                    let id = self.handle.registry.next_id();

                    #[cfg(feature = "logging")]
                    log::debug!("{id}: accepted from {_addr}");

                    let (tx, rx) = mpsc::channel(self.options.max_queued_messages.max(1));
                    let peer = Peer::new(tx);
                    let status = Arc::clone(&peer.status);
                    self.handle.registry.insert(id, peer);

                    let task = ConnectionTask::new(
                        Connection::new(id, &self.options),
                        stream,
                        rx,
                        status,
                        Arc::clone(&self.handler),
                        self.handle.clone(),
                        &self.options,
                    );
                    tokio::spawn(task.run());
                }
                Err(_err) => {
                    #[cfg(feature = "logging")]
                    log::warn!("accept failed: {_err}");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            }
        }
    }
}

/// Drives one accepted socket.
struct ConnectionTask {
    conn: Connection,
    reader: OwnedReadHalf,
    writer: OwnedWriteHalf,
    /// Taken from the connection, not yet accepted by the socket.
    writing: Bytes,
    rx: Receiver<Outbound>,
    status: Arc<PeerStatus>,
    handler: Arc<dyn EventHandler>,
    handle: Handle,
    backpressure_boundary: usize,
    close_timeout: Duration,
    /// The connection reported `Closed`.
    closed: bool,
}

impl ConnectionTask {
    fn new(
        conn: Connection,
        stream: TcpStream,
        rx: Receiver<Outbound>,
        status: Arc<PeerStatus>,
        handler: Arc<dyn EventHandler>,
        handle: Handle,
        options: &Options,
    ) -> Self {
        let (reader, writer) = stream.into_split();
        Self {
            conn,
            reader,
            writer,
            writing: Bytes::new(),
            rx,
            status,
            handler,
            handle,
            backpressure_boundary: options.backpressure_boundary,
            close_timeout: options.close_timeout,
            closed: false,
        }
    }

    async fn run(mut self) {
        let id = self.conn.id();
        self.conn.accept();
        self.sync_status();

        if let Err(_err) = self.drive().await {
            #[cfg(feature = "logging")]
            log::debug!("{id}: {_err}");
        }

        self.status.set_state(State::Closed);
        self.handle.registry.remove(id);

        // whatever is still queued: a close frame or a rejection response
        if timeout(self.close_timeout, self.flush()).await.is_err() {
            #[cfg(feature = "logging")]
            log::debug!("{id}: peer stopped reading, dropping unwritten bytes");
        }
        let _ = self.writer.shutdown().await;

        let events = self.conn.on_disconnect();
        self.dispatch(events);
        if self.closed {
            self.handler.on_close(&self.handle, id);
        }

        #[cfg(feature = "logging")]
        log::debug!("{id}: disconnected");
    }

    async fn drive(&mut self) -> Result<()> {
        let mut buf = vec![0u8; READ_CHUNK];
        let mut state = self.conn.state();
        let mut deadline = self.deadline();

        while self.conn.state() != State::Closed {
            if self.writing.is_empty() {
                if let Some(bytes) = self.conn.take_outbound() {
                    self.writing = bytes;
                }
            }
            let writing = !self.writing.is_empty();
            let backlogged = self.backlogged();

            tokio::select! {
                read = self.reader.read(&mut buf), if !backlogged => {
                    let n = read?;
                    if n == 0 {
                        return Ok(());
                    }
                    let events = self.conn.receive(&buf[..n])?;
                    self.sync_status();
                    self.dispatch(events);

                    // only open connections count input as activity
                    if self.conn.state() == State::Open {
                        deadline = self.deadline();
                    }
                }
                written = self.writer.write_buf(&mut self.writing), if writing => {
                    if written? == 0 {
                        return Err(io::Error::from(io::ErrorKind::WriteZero).into());
                    }
                }
                Some(command) = self.rx.recv(), if !backlogged => {
                    self.on_command(command);
                }
                _ = self.status.close_requested() => {
                    if let Some(code) = self.status.take_close_request() {
                        self.on_close_request(code);
                    }
                }
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    #[cfg(feature = "logging")]
                    log::debug!("{}: timed out in {:?}", self.conn.id(), self.conn.state());
                    self.conn.on_timeout()?;
                }
            }

            if let Some(event) = self.conn.finish() {
                self.dispatch(vec![event]);
            }
            self.sync_status();

            if self.conn.state() != state {
                state = self.conn.state();
                deadline = self.deadline();
            }
        }

        Ok(())
    }

    fn on_command(&mut self, command: Outbound) {
        let res = match command {
            Outbound::Text(text) => self.conn.send_text(&text),
            Outbound::Encoded(bytes) => self.conn.send_encoded(&bytes),
        };

        if let Err(_err) = res {
            #[cfg(feature = "logging")]
            log::debug!("{}: dropped outbound message: {_err}", self.conn.id());
        }
    }

    /// Queues what the peer can still take from the message queue, then starts the close.
    fn on_close_request(&mut self, code: CloseCode) {
        while let Ok(command) = self.rx.try_recv() {
            if !self.backlogged() {
                self.on_command(command);
            }
        }
        self.conn.close(code);
    }

    /// Writes everything queued, waiting for the socket as long as it takes.
    async fn flush(&mut self) -> Result<()> {
        loop {
            if self.writing.is_empty() {
                match self.conn.take_outbound() {
                    Some(bytes) => self.writing = bytes,
                    None => return Ok(()),
                }
            }
            self.writer.write_all_buf(&mut self.writing).await?;
        }
    }

    /// More bytes wait for the socket than the peer should be handed.
    fn backlogged(&self) -> bool {
        self.writing.remaining() + self.conn.outbound_len() >= self.backpressure_boundary
    }

    /// Hands events to the handler. `Closed` is held back until the connection has left the
    /// registry.
    fn dispatch(&mut self, events: Vec<ConnectionEvent>) {
        let id = self.conn.id();
        for event in events {
            match event {
                ConnectionEvent::Opened => self.handler.on_open(&self.handle, id),
                ConnectionEvent::Message(text) => self.handler.on_message(&self.handle, id, text),
                ConnectionEvent::Closed => self.closed = true,
            }
        }
    }

    fn sync_status(&self) {
        if let Some(scheme) = self.conn.scheme() {
            self.status.set_scheme(scheme);
        }
        self.status.set_state(self.conn.state());
    }

    fn deadline(&self) -> Option<Instant> {
        self.conn.timeout().map(|timeout| Instant::now() + timeout)
    }
}
