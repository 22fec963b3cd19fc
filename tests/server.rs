use std::{
    net::SocketAddr,
    time::{Duration, Instant},
};

use bytes::BytesMut;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    sync::mpsc::{self, UnboundedReceiver},
    time::{sleep, timeout},
};
use tokio_util::codec::Decoder as _;
use wsbridge::{
    close::CloseCode, codec, ConnectionId, Event, EventHandler, Frame, Handle, HandshakeScheme,
    OpCode, Options, Server, WebSocketError,
};

const WAIT: Duration = Duration::from_secs(5);

const REQUEST: &[u8] = b"GET /panel HTTP/1.1\r\n\
    Host: localhost\r\n\
    Upgrade: websocket\r\n\
    Connection: Upgrade\r\n\
    Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
    Sec-WebSocket-Version: 13\r\n\r\n";

const LEGACY_REQUEST: &[u8] = b"GET /demo HTTP/1.1\r\n\
    Host: example.com\r\n\
    Origin: http://example.com\r\n\
    Sec-WebSocket-Key1: 4 @1  46546xW%0l 1 5\r\n\
    Sec-WebSocket-Key2: 12998 5 Y3 1  .P00\r\n\r\n\
    ^n:ds[4U";

fn init_logger() {
    let _ = simple_logger::init_with_level(log::Level::Debug);
}

async fn start(options: Options) -> anyhow::Result<(SocketAddr, Handle, UnboundedReceiver<Event>)> {
    init_logger();

    let (tx, rx) = mpsc::unbounded_channel();
    let server = Server::bind("127.0.0.1:0", options, tx).await?;
    let addr = server.local_addr()?;
    let handle = server.handle();
    tokio::spawn(server.run());

    Ok((addr, handle, rx))
}

async fn next_event(rx: &mut UnboundedReceiver<Event>) -> Event {
    timeout(WAIT, rx.recv())
        .await
        .expect("event timeout")
        .expect("event channel closed")
}

async fn expect_opened(rx: &mut UnboundedReceiver<Event>) -> ConnectionId {
    match next_event(rx).await {
        Event::Opened(id) => id,
        other => panic!("expected Opened, got {other:?}"),
    }
}

/// A minimal client speaking raw bytes.
struct Client {
    stream: TcpStream,
    buf: BytesMut,
}

impl Client {
    async fn raw(addr: SocketAddr) -> anyhow::Result<Self> {
        Ok(Self {
            stream: TcpStream::connect(addr).await?,
            buf: BytesMut::new(),
        })
    }

    async fn connect(addr: SocketAddr) -> anyhow::Result<Self> {
        let mut client = Self::raw(addr).await?;
        client.stream.write_all(REQUEST).await?;
        let head = client.read_head().await?;
        assert!(head.starts_with("HTTP/1.1 101 Switching Protocols\r\n"), "{head}");
        assert!(head.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n"));
        Ok(client)
    }

    async fn fill(&mut self) -> anyhow::Result<usize> {
        let n = timeout(WAIT, self.stream.read_buf(&mut self.buf)).await??;
        Ok(n)
    }

    async fn read_head(&mut self) -> anyhow::Result<String> {
        loop {
            if let Some(end) = self.buf.windows(4).position(|w| w == b"\r\n\r\n") {
                let head = self.buf.split_to(end + 4);
                return Ok(String::from_utf8(head.to_vec())?);
            }
            anyhow::ensure!(self.fill().await? > 0, "eof before response head");
        }
    }

    async fn read_frame(&mut self) -> anyhow::Result<Frame> {
        let mut decoder = codec::Decoder::new(wsbridge::MAX_PAYLOAD_READ);
        loop {
            if let Some(frame) = decoder.decode(&mut self.buf)? {
                return Ok(frame);
            }
            anyhow::ensure!(self.fill().await? > 0, "eof before frame");
        }
    }

    async fn send(&mut self, frame: Frame) -> anyhow::Result<()> {
        let key: [u8; 4] = rand::random();
        let bytes = codec::encode(HandshakeScheme::Rfc6455, frame.with_mask(key))?;
        self.stream.write_all(&bytes).await?;
        Ok(())
    }

    /// Reads until the server closes the socket.
    async fn read_to_end(&mut self) -> anyhow::Result<()> {
        while self.fill().await? > 0 {}
        Ok(())
    }
}

#[tokio::test]
async fn test_echo_through_handle() -> anyhow::Result<()> {
    let (addr, handle, mut rx) = start(Options::default()).await?;
    let mut client = Client::connect(addr).await?;
    let id = expect_opened(&mut rx).await;

    client.send(Frame::text("hello")).await?;
    assert_eq!(next_event(&mut rx).await, Event::Message(id, "hello".into()));

    handle.send(id, "world")?;
    let frame = client.read_frame().await?;
    assert_eq!(frame.opcode, OpCode::Text);
    assert!(!frame.is_masked());
    assert_eq!(&frame.payload[..], b"world");

    Ok(())
}

struct Echo;

impl EventHandler for Echo {
    fn on_message(&self, handle: &Handle, id: ConnectionId, text: String) {
        let _ = handle.send(id, &text.to_uppercase());
    }
}

#[tokio::test]
async fn test_event_handler_trait() -> anyhow::Result<()> {
    init_logger();
    let server = Server::bind("127.0.0.1:0", Options::default(), Echo).await?;
    let addr = server.local_addr()?;
    tokio::spawn(server.run());

    let mut client = Client::connect(addr).await?;
    // fragmented, with a ping in between
    client
        .send(Frame::new(false, OpCode::Text, &b"shout "[..]))
        .await?;
    client.send(Frame::ping("p")).await?;
    client
        .send(Frame::new(true, OpCode::Continuation, &b"this"[..]))
        .await?;

    let pong = client.read_frame().await?;
    assert_eq!(pong.opcode, OpCode::Pong);
    assert_eq!(&pong.payload[..], b"p");

    let reply = client.read_frame().await?;
    assert_eq!(&reply.payload[..], b"SHOUT THIS");

    Ok(())
}

#[tokio::test]
async fn test_broadcast_to_two_clients() -> anyhow::Result<()> {
    let (addr, handle, mut rx) = start(Options::default()).await?;
    let mut first = Client::connect(addr).await?;
    let mut second = Client::connect(addr).await?;
    let a = expect_opened(&mut rx).await;
    let b = expect_opened(&mut rx).await;
    assert_ne!(a, b);

    let mut ids = handle.connections();
    ids.sort();
    let mut expected = vec![a, b];
    expected.sort();
    assert_eq!(ids, expected);

    assert_eq!(handle.broadcast("to everyone"), 2);
    for client in [&mut first, &mut second] {
        let frame = client.read_frame().await?;
        assert_eq!(&frame.payload[..], b"to everyone");
    }

    Ok(())
}

#[tokio::test]
async fn test_server_disconnect() -> anyhow::Result<()> {
    let (addr, handle, mut rx) = start(Options::default()).await?;
    let mut client = Client::connect(addr).await?;
    let id = expect_opened(&mut rx).await;

    handle.disconnect(id)?;
    let frame = client.read_frame().await?;
    assert_eq!(frame.opcode, OpCode::Close);
    assert_eq!(frame.close_code(), Some(CloseCode::Normal));

    client.send(Frame::close(CloseCode::Normal, "")).await?;
    assert_eq!(next_event(&mut rx).await, Event::Closed(id));
    client.read_to_end().await?;

    assert!(handle.is_empty());
    assert!(matches!(
        handle.send(id, "gone"),
        Err(WebSocketError::UnknownConnection(_))
    ));

    Ok(())
}

#[tokio::test]
async fn test_client_close() -> anyhow::Result<()> {
    let (addr, handle, mut rx) = start(Options::default()).await?;
    let mut client = Client::connect(addr).await?;
    let id = expect_opened(&mut rx).await;

    client.send(Frame::close(CloseCode::Away, "bye")).await?;
    let echo = client.read_frame().await?;
    assert_eq!(echo.close_code(), Some(CloseCode::Away));
    assert_eq!(echo.close_reason(), Some("bye"));

    assert_eq!(next_event(&mut rx).await, Event::Closed(id));
    client.read_to_end().await?;
    assert_eq!(handle.len(), 0);

    Ok(())
}

#[tokio::test]
async fn test_abrupt_disconnect() -> anyhow::Result<()> {
    let (addr, handle, mut rx) = start(Options::default()).await?;
    let client = Client::connect(addr).await?;
    let id = expect_opened(&mut rx).await;

    drop(client);
    assert_eq!(next_event(&mut rx).await, Event::Closed(id));
    assert_eq!(handle.broadcast("anyone?"), 0);

    Ok(())
}

#[tokio::test]
async fn test_handshake_timeout() -> anyhow::Result<()> {
    let options = Options::default().with_handshake_timeout(Duration::from_millis(200));
    let (addr, handle, mut rx) = start(options).await?;

    let mut client = Client::raw(addr).await?;
    client.stream.write_all(b"GET / HTTP/1.1\r\n").await?;
    client.read_to_end().await?;

    assert!(client.buf.is_empty());
    assert!(handle.is_empty());
    // never opened, so nothing to report
    assert!(rx.try_recv().is_err());

    Ok(())
}

#[tokio::test]
async fn test_rejected_handshake() -> anyhow::Result<()> {
    let (addr, _handle, _rx) = start(Options::default()).await?;

    let mut client = Client::raw(addr).await?;
    client
        .stream
        .write_all(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n")
        .await?;
    let head = client.read_head().await?;
    assert!(head.starts_with("HTTP/1.1 400 Bad Request\r\n"));
    client.read_to_end().await?;

    Ok(())
}

#[tokio::test]
async fn test_oversized_frame() -> anyhow::Result<()> {
    let options = Options::default().with_max_payload_read(16);
    let (addr, _handle, mut rx) = start(options).await?;
    let mut client = Client::connect(addr).await?;
    let id = expect_opened(&mut rx).await;

    // header only: masked text frame declaring 1000 bytes
    client
        .stream
        .write_all(&[0x81, 0xFE, 0x03, 0xE8, 1, 2, 3, 4])
        .await?;

    let frame = client.read_frame().await?;
    assert_eq!(frame.close_code(), Some(CloseCode::Size));
    assert_eq!(next_event(&mut rx).await, Event::Closed(id));

    Ok(())
}

#[tokio::test]
async fn test_legacy_client() -> anyhow::Result<()> {
    let (addr, handle, mut rx) = start(Options::default()).await?;

    let mut client = Client::raw(addr).await?;
    client.stream.write_all(LEGACY_REQUEST).await?;
    let head = client.read_head().await?;
    assert!(head.starts_with("HTTP/1.1 101 Web Socket Protocol Handshake\r\n"));
    assert!(head.contains("Sec-WebSocket-Location: ws://example.com/demo\r\n"));
    while client.buf.len() < 16 {
        client.fill().await?;
    }
    assert_eq!(&client.buf.split_to(16)[..], b"8jKS'y:G*Co,Wxa-");

    let id = expect_opened(&mut rx).await;
    client.stream.write_all(&[0x00, b'h', b'i', 0xFF]).await?;
    assert_eq!(next_event(&mut rx).await, Event::Message(id, "hi".into()));

    assert_eq!(handle.broadcast("yo"), 1);
    while client.buf.len() < 4 {
        client.fill().await?;
    }
    assert_eq!(&client.buf.split_to(4)[..], &[0x00, b'y', b'o', 0xFF]);

    client.stream.write_all(&[0xFF, 0x00]).await?;
    assert_eq!(next_event(&mut rx).await, Event::Closed(id));

    Ok(())
}

#[tokio::test]
async fn test_idle_timeout() -> anyhow::Result<()> {
    let options = Options::default().with_idle_timeout(Duration::from_millis(300));
    let (addr, handle, mut rx) = start(options).await?;
    let mut client = Client::connect(addr).await?;
    let id = expect_opened(&mut rx).await;

    // traffic keeps it open past the timeout
    for _ in 0..4 {
        sleep(Duration::from_millis(100)).await;
        client.send(Frame::ping("still here")).await?;
        assert_eq!(client.read_frame().await?.opcode, OpCode::Pong);
    }
    assert_eq!(handle.len(), 1);

    let frame = client.read_frame().await?;
    assert_eq!(frame.close_code(), Some(CloseCode::Away));
    assert_eq!(next_event(&mut rx).await, Event::Closed(id));
    client.read_to_end().await?;
    assert!(handle.is_empty());

    Ok(())
}

#[tokio::test]
async fn test_unanswered_disconnect() -> anyhow::Result<()> {
    let close_timeout = Duration::from_millis(200);
    let options = Options::default().with_close_timeout(close_timeout);
    let (addr, handle, mut rx) = start(options).await?;
    let mut client = Client::connect(addr).await?;
    let id = expect_opened(&mut rx).await;

    let started = Instant::now();
    handle.disconnect(id)?;
    let frame = client.read_frame().await?;
    assert_eq!(frame.close_code(), Some(CloseCode::Normal));

    // the client never answers
    assert_eq!(next_event(&mut rx).await, Event::Closed(id));
    assert!(started.elapsed() >= close_timeout);
    assert!(handle.is_empty());
    client.read_to_end().await?;

    Ok(())
}

#[tokio::test]
async fn test_disconnect_client_that_stopped_reading() -> anyhow::Result<()> {
    let options = Options::default().with_close_timeout(Duration::from_millis(200));
    let (addr, handle, mut rx) = start(options).await?;
    // upgrades, then never reads again
    let _client = Client::connect(addr).await?;
    let id = expect_opened(&mut rx).await;

    let chunk = "x".repeat(64 * 1024);
    for _ in 0..400 {
        handle.broadcast(&chunk);
    }
    handle.disconnect(id)?;

    assert_eq!(next_event(&mut rx).await, Event::Closed(id));
    assert!(handle.is_empty());
    assert_eq!(handle.broadcast(&chunk), 0);

    Ok(())
}

#[tokio::test]
async fn test_full_queue_evicts_connection() -> anyhow::Result<()> {
    let options = Options::default()
        .with_max_queued_messages(4)
        .with_close_timeout(Duration::from_millis(200));
    let (addr, handle, mut rx) = start(options).await?;
    let mut client = Client::connect(addr).await?;
    let id = expect_opened(&mut rx).await;

    // the connection task gets no chance to run in between
    let reached: usize = (0..16).map(|_| handle.broadcast("tick")).sum();
    assert_eq!(reached, 4);
    assert!(handle.is_empty());
    assert!(matches!(
        handle.send(id, "late"),
        Err(WebSocketError::UnknownConnection(_))
    ));

    // what was queued is still delivered, then the policy close
    for _ in 0..4 {
        assert_eq!(&client.read_frame().await?.payload[..], b"tick");
    }
    let frame = client.read_frame().await?;
    assert_eq!(frame.close_code(), Some(CloseCode::Policy));
    assert_eq!(next_event(&mut rx).await, Event::Closed(id));

    Ok(())
}

#[cfg(feature = "json")]
#[tokio::test]
async fn test_json_messages() -> anyhow::Result<()> {
    #[derive(serde::Serialize)]
    struct Scene {
        room: &'static str,
        level: u8,
    }

    let (addr, handle, mut rx) = start(Options::default()).await?;
    let mut first = Client::connect(addr).await?;
    let a = expect_opened(&mut rx).await;
    let mut second = Client::connect(addr).await?;
    expect_opened(&mut rx).await;

    handle.send_json(a, &Scene { room: "lobby", level: 75 })?;
    let frame = first.read_frame().await?;
    assert_eq!(frame.opcode, OpCode::Text);
    assert_eq!(&frame.payload[..], br#"{"room":"lobby","level":75}"#);

    let reached = handle.broadcast_json(&Scene { room: "hall", level: 0 })?;
    assert_eq!(reached, 2);
    for client in [&mut first, &mut second] {
        let frame = client.read_frame().await?;
        let value: serde_json::Value = serde_json::from_slice(&frame.payload)?;
        assert_eq!(value, serde_json::json!({ "room": "hall", "level": 0 }));
    }

    Ok(())
}
