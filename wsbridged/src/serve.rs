use std::{net::IpAddr, time::Duration};

use clap::Args;
use rustyline::ExternalPrinter;
use tokio::{
    runtime,
    sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender},
};
use wsbridge::{ConnectionId, Event, EventHandler, Handle, Options, Server};

use crate::console::Command;

/// Runs a WebSocket server with an interactive console.
///
/// Every line typed is broadcast to all open connections, unless it is one of the console
/// commands: `@<id> <text>` sends to one connection, `/kick <id>` closes it and `/list` shows
/// the connections.
#[derive(Args)]
#[command(alias = "s")]
pub struct Cmd {
    /// Address to listen on.
    #[arg(short, long, default_value = "0.0.0.0")]
    bind: IpAddr,

    /// Port to listen on.
    #[arg(short, long, default_value_t = 8080)]
    port: u16,

    /// Maximum payload of a single message, in bytes.
    #[arg(long, default_value_t = wsbridge::MAX_PAYLOAD_READ)]
    max_payload: usize,

    /// Time a client has to complete the handshake.
    /// Accepts human-readable formats like "5s", "1m", "500ms".
    #[arg(long, value_parser = humantime::parse_duration, default_value = "10s")]
    handshake_timeout: Duration,

    /// Closes connections that stay silent for this long.
    #[arg(long, value_parser = humantime::parse_duration)]
    idle_timeout: Option<Duration>,

    /// Messages that may wait for one connection before it is dropped as too slow.
    #[arg(long, default_value_t = 1024)]
    max_queued: usize,

    /// Rejects clients using the legacy two-key handshake.
    #[arg(long)]
    no_legacy: bool,

    /// Sends every received message back to its sender.
    #[arg(long)]
    echo: bool,

    /// Pretty-prints received messages that parse as JSON.
    #[arg(long)]
    json: bool,

    /// Logs protocol activity.
    #[arg(short, long)]
    verbose: bool,
}

impl Cmd {
    fn options(&self) -> Options {
        let mut options = Options::default()
            .with_max_payload_read(self.max_payload)
            .with_handshake_timeout(self.handshake_timeout)
            .with_max_queued_messages(self.max_queued);
        if let Some(timeout) = self.idle_timeout {
            options = options.with_idle_timeout(timeout);
        }
        if self.no_legacy {
            options = options.without_legacy_handshake();
        }
        options
    }
}

/// Forwards events to the console, echoing messages first when asked to.
struct Console {
    tx: UnboundedSender<Event>,
    echo: bool,
}

impl EventHandler for Console {
    fn on_open(&self, _handle: &Handle, id: ConnectionId) {
        let _ = self.tx.send(Event::Opened(id));
    }

    fn on_message(&self, handle: &Handle, id: ConnectionId, text: String) {
        if self.echo {
            if let Err(err) = handle.send(id, &text) {
                log::warn!("{id}: echo failed: {err}");
            }
        }
        let _ = self.tx.send(Event::Message(id, text));
    }

    fn on_close(&self, _handle: &Handle, id: ConnectionId) {
        let _ = self.tx.send(Event::Closed(id));
    }
}

pub fn run(cmd: Cmd) -> anyhow::Result<()> {
    let level = if cmd.verbose {
        log::Level::Debug
    } else {
        log::Level::Warn
    };
    simple_logger::init_with_level(level)?;

    let history_path = home::home_dir()
        .ok_or(anyhow::anyhow!("unable to determine home path"))?
        .join(".wsbridged_history");

    let mut rl = rustyline::DefaultEditor::with_config(
        rustyline::Config::builder()
            .auto_add_history(true)
            .completion_type(rustyline::CompletionType::List)
            .max_history_size(1000)?
            .build(),
    )?;
    // a missing history file is fine
    let _ = rl.load_history(&history_path);
    let printer = rl.create_external_printer()?;

    let runtime = runtime::Builder::new_multi_thread().enable_all().build()?;
    let _guard = runtime.enter();

    let (events_tx, events_rx) = unbounded_channel();
    let handler = Console {
        tx: events_tx,
        echo: cmd.echo,
    };
    let server = runtime.block_on(Server::bind((cmd.bind, cmd.port), cmd.options(), handler))?;
    println!("> Listening on ws://{}", server.local_addr()?);

    let handle = server.handle();
    runtime.spawn(async move {
        if let Err(err) = server.run().await {
            log::error!("server stopped: {err}");
        }
    });

    let (lines_tx, lines_rx) = unbounded_channel();
    runtime.spawn_blocking(move || loop {
        match rl.readline("> ") {
            Ok(line) => {
                if lines_tx.send(line).is_err() {
                    break;
                }
            }
            Err(_) => {
                if let Err(err) = rl.save_history(&history_path) {
                    log::warn!("unable to save history: {err}");
                }
                break;
            }
        }
    });

    let opts = Opts { json: cmd.json };
    runtime.block_on(console(handle, events_rx, lines_rx, printer, opts));

    runtime.shutdown_background();

    Ok(())
}

struct Opts {
    json: bool,
}

async fn console(
    handle: Handle,
    mut events: UnboundedReceiver<Event>,
    mut lines: UnboundedReceiver<String>,
    mut printer: impl ExternalPrinter,
    opts: Opts,
) {
    loop {
        tokio::select! {
            line = lines.recv() => {
                let Some(line) = line else {
                    break;
                };
                let output = match line.parse::<Command>() {
                    Ok(command) => execute(&handle, command),
                    Err(err) => Some(format!("{err:#}")),
                };
                if let Some(output) = output {
                    let _ = printer.print(output);
                }
            }
            event = events.recv() => {
                let Some(event) = event else {
                    break;
                };
                let _ = printer.print(describe(event, &opts));
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }
}

fn execute(handle: &Handle, command: Command) -> Option<String> {
    match command {
        Command::Nothing => None,
        Command::Broadcast(text) => Some(format!("<sent to {}>", handle.broadcast(&text))),
        Command::Send(id, text) => handle
            .send(id, &text)
            .err()
            .map(|err| format!("{id}: {err}")),
        Command::Kick(id) => handle
            .disconnect(id)
            .err()
            .map(|err| format!("{id}: {err}")),
        Command::List => {
            let ids = handle.connections();
            if ids.is_empty() {
                Some("<no connections>".to_owned())
            } else {
                let ids: Vec<String> = ids.iter().map(ToString::to_string).collect();
                Some(ids.join(" "))
            }
        }
    }
}

fn describe(event: Event, opts: &Opts) -> String {
    let now = chrono::Local::now().format("%H:%M:%S%.3f");
    match event {
        Event::Opened(id) => format!("{now} {id} <connected>"),
        Event::Closed(id) => format!("{now} {id} <disconnected>"),
        Event::Message(id, text) => {
            if opts.json {
                if let Ok(value) = serde_json::from_str::<serde_json::Value>(&text) {
                    return format!("{now} {id} {value:#}");
                }
            }
            format!("{now} {id} {text}")
        }
    }
}
