use clap::{Parser, Subcommand};

mod console;
mod serve;

/// Runs a WebSocket server and lets an operator talk to its connections.
///
/// Console input supports inline comments using // so lines can be documented and found again
/// with ctrl+r in history.
///
/// Examples:
///   {"type": "ping"} // broadcast a heartbeat
///   @3 {"type": "reboot"} // only to connection #3
///   /kick 3
///
#[derive(Parser)]
#[command(author, version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    Serve(serve::Cmd),
}

fn main() {
    let args = Cli::parse();
    let res = match args.command {
        Commands::Serve(cmd) => serve::run(cmd),
    };
    if let Err(err) = res {
        eprintln!("{:?}", err);
    }
}
