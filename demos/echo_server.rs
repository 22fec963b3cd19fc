//! A WebSocket echo server built on wsbridge.
//! Every text or binary message is sent back to the connection it came from.

use wsbridge::{ConnectionId, EventHandler, Handle, Options, Server};

struct Echo;

impl EventHandler for Echo {
    fn on_open(&self, handle: &Handle, id: ConnectionId) {
        log::info!("{id} connected, {} total", handle.len());
    }

    fn on_message(&self, handle: &Handle, id: ConnectionId, text: String) {
        if let Err(err) = handle.send(id, &text) {
            log::error!("{id}: unable to echo: {err}");
        }
    }

    fn on_close(&self, _handle: &Handle, id: ConnectionId) {
        log::info!("{id} disconnected");
    }
}

/// Listens on port 8080 and echoes everything back.
#[tokio::main]
async fn main() -> wsbridge::Result<()> {
    simple_logger::init_with_level(log::Level::Debug).expect("log");

    let server = Server::start(8080, Options::default(), Echo).await?;
    log::debug!("Listening on {}", server.local_addr()?);

    server.run().await
}
