//! Operator console commands.

use std::str::FromStr;

use anyhow::{anyhow, bail, Context};
use wsbridge::ConnectionId;

/// One line typed by the operator.
#[derive(Debug, PartialEq, Eq)]
pub enum Command {
    /// A plain line goes to every open connection.
    Broadcast(String),
    /// `@<id> <text>`
    Send(ConnectionId, String),
    /// `/kick <id>`
    Kick(ConnectionId),
    /// `/list`
    List,
    /// Blank line or comment only.
    Nothing,
}

impl FromStr for Command {
    type Err = anyhow::Error;

    fn from_str(line: &str) -> anyhow::Result<Self> {
        let line = strip_comment(line).trim();
        if line.is_empty() {
            return Ok(Command::Nothing);
        }

        if let Some(rest) = line.strip_prefix('@') {
            let (id, text) = rest
                .split_once(char::is_whitespace)
                .ok_or_else(|| anyhow!("usage: @<id> <text>"))?;
            return Ok(Command::Send(parse_id(id)?, text.trim_start().to_owned()));
        }

        if let Some(rest) = line.strip_prefix('/') {
            let mut words = rest.split_whitespace();
            return match (words.next(), words.next()) {
                (Some("list"), None) => Ok(Command::List),
                (Some("kick"), Some(id)) => Ok(Command::Kick(parse_id(id)?)),
                (Some("kick"), None) => bail!("usage: /kick <id>"),
                _ => bail!("unknown command: /{rest}"),
            };
        }

        Ok(Command::Broadcast(line.to_owned()))
    }
}

fn parse_id(id: &str) -> anyhow::Result<ConnectionId> {
    id.parse()
        .with_context(|| format!("invalid connection id: {id}"))
}

/// Drops a trailing `// comment`.
fn strip_comment(line: &str) -> &str {
    match line.rfind("//") {
        // keep urls such as ws://host intact
        Some(pos) if !line[..pos].ends_with(':') => &line[..pos],
        _ => line,
    }
}
