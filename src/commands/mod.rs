//! Operator Console
//!
//! Line-oriented commands for driving the runtime from a terminal. Parsing
//! is separate from execution so the grammar can be tested without a
//! runtime.

use std::fmt::Write as _;

use thiserror::Error;

use crate::runtime::Tether;
use crate::session::format_elapsed;

/// Port used by `addserver` when none is given
const DEFAULT_PORT: u32 = 25565;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Connect {
        server: String,
        username: Option<String>,
        minutes: Option<u32>,
    },
    Schedule {
        server: String,
        delay_minutes: i64,
        username: Option<String>,
        minutes: Option<u32>,
    },
    Cancel {
        id: String,
    },
    Scheduled,
    Disconnect,
    Offline {
        minutes: u32,
    },
    CancelReconnect,
    Info,
    Ping,
    Status,
    AddServer {
        name: String,
        host: String,
        port: u32,
        username: Option<String>,
    },
    DelServer {
        name: String,
    },
    Servers,
    Help,
    Quit,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CommandError {
    #[error("Unknown command: {0}. Type 'help' for a list.")]
    Unknown(String),

    #[error("Usage: {0}")]
    Usage(&'static str),

    #[error("Not a number: {0}")]
    InvalidNumber(String),
}

/// Result of running a command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Reply(String),
    Quit,
}

const HELP: &str = "\
Commands:
  connect <server> [username] [minutes]   connect now, optionally for a limited time
  schedule <server> <delay> [username] [minutes]
                                          connect after <delay> minutes
  cancel <id>                             cancel a scheduled connection
  scheduled                               list scheduled connections
  disconnect                              leave the server
  offline <minutes>                       disconnect after <minutes>
  cancelreconnect                         stop a pending reconnection
  info                                    connection details
  ping                                    current latency
  status                                  lifecycle overview
  addserver <name> <host> [port] [username]
  delserver <name>
  servers                                 list saved servers
  quit                                    exit (the session resumes on next start)";

fn number<T: std::str::FromStr>(value: &str) -> Result<T, CommandError> {
    value
        .parse()
        .map_err(|_| CommandError::InvalidNumber(value.to_string()))
}

fn optional_number<T: std::str::FromStr>(value: Option<&&str>) -> Result<Option<T>, CommandError> {
    value.map(|v| number(v)).transpose()
}

/// Parse one console line. `None` for a blank line.
pub fn parse(line: &str) -> Option<Result<Command, CommandError>> {
    let mut words = line.split_whitespace();
    let name = words.next()?.trim_start_matches('!').to_lowercase();
    let args: Vec<&str> = words.collect();
    Some(parse_args(&name, &args))
}

fn parse_args(name: &str, args: &[&str]) -> Result<Command, CommandError> {
    let command = match name {
        "connect" => {
            let server = args
                .first()
                .ok_or(CommandError::Usage("connect <server> [username] [minutes]"))?;
            Command::Connect {
                server: server.to_string(),
                username: args.get(1).map(|u| u.to_string()),
                minutes: optional_number(args.get(2))?,
            }
        }
        "schedule" => {
            let (server, delay) = match args {
                [server, delay, ..] => (server, delay),
                _ => {
                    return Err(CommandError::Usage(
                        "schedule <server> <delay> [username] [minutes]",
                    ))
                }
            };
            Command::Schedule {
                server: server.to_string(),
                delay_minutes: number(delay)?,
                username: args.get(2).map(|u| u.to_string()),
                minutes: optional_number(args.get(3))?,
            }
        }
        "cancel" => Command::Cancel {
            id: args
                .first()
                .ok_or(CommandError::Usage("cancel <id>"))?
                .to_string(),
        },
        "scheduled" => Command::Scheduled,
        "disconnect" => Command::Disconnect,
        "offline" => Command::Offline {
            minutes: number(args.first().ok_or(CommandError::Usage("offline <minutes>"))?)?,
        },
        "cancelreconnect" => Command::CancelReconnect,
        "info" => Command::Info,
        "ping" => Command::Ping,
        "status" => Command::Status,
        "addserver" => {
            let (name, host) = match args {
                [name, host, ..] => (name, host),
                _ => {
                    return Err(CommandError::Usage(
                        "addserver <name> <host> [port] [username]",
                    ))
                }
            };
            Command::AddServer {
                name: name.to_string(),
                host: host.to_string(),
                port: optional_number(args.get(2))?.unwrap_or(DEFAULT_PORT),
                username: args.get(3).map(|u| u.to_string()),
            }
        }
        "delserver" => Command::DelServer {
            name: args
                .first()
                .ok_or(CommandError::Usage("delserver <name>"))?
                .to_string(),
        },
        "servers" => Command::Servers,
        "help" => Command::Help,
        "quit" | "exit" => Command::Quit,
        other => return Err(CommandError::Unknown(other.to_string())),
    };
    Ok(command)
}

/// Run a parsed command against the runtime
pub async fn execute(tether: &Tether, command: Command) -> Outcome {
    let reply = match command {
        Command::Connect {
            server,
            username,
            minutes,
        } => match tether.connect(&server, username, minutes).await {
            Ok(accepted) => format!(
                "Connecting to {} ({}) as {}...",
                accepted.server_name, accepted.address, accepted.username
            ),
            Err(e) => e.to_string(),
        },
        Command::Schedule {
            server,
            delay_minutes,
            username,
            minutes,
        } => match tether
            .schedule_connection(&server, delay_minutes, username, minutes)
            .await
        {
            Ok(id) => format!(
                "Scheduled connection to {} in {} minutes (id {}).",
                server, delay_minutes, id
            ),
            Err(e) => e.to_string(),
        },
        Command::Cancel { id } => {
            if tether.cancel_scheduled_connection(&id).await {
                format!("Cancelled scheduled connection {}.", id)
            } else {
                format!("No scheduled connection with id {}.", id)
            }
        }
        Command::Scheduled => {
            let scheduled = tether.list_scheduled_connections();
            if scheduled.is_empty() {
                "No scheduled connections.".to_string()
            } else {
                let mut out = String::from("Scheduled connections:");
                for entry in scheduled {
                    let _ = write!(
                        out,
                        "\n  {}  {}  in {} min",
                        entry.id, entry.server_name, entry.minutes_remaining
                    );
                }
                out
            }
        }
        Command::Disconnect => match tether.disconnect().await {
            Ok(server) => format!("Disconnected from {}.", server),
            Err(e) => e.to_string(),
        },
        Command::Offline { minutes } => match tether.set_disconnect_timer(minutes).await {
            Ok(()) => format!("Will disconnect in {} minutes.", minutes),
            Err(e) => e.to_string(),
        },
        Command::CancelReconnect => {
            if tether.cancel_reconnection() {
                "Reconnection cancelled.".to_string()
            } else {
                "No reconnection pending.".to_string()
            }
        }
        Command::Info => match tether.connection_info().await {
            Ok(info) => {
                let mut out = format!(
                    "Server: {} ({})\nUsername: {}\nConnected since: {}\nElapsed: {}",
                    info.server_name,
                    info.address,
                    info.username,
                    info.connected_since.format("%Y-%m-%d %H:%M:%S UTC"),
                    info.elapsed_display()
                );
                if let Some(minutes) = info.planned_duration_minutes {
                    let left = (u64::from(minutes) * 60).saturating_sub(info.duration_elapsed_secs);
                    let _ = write!(out, "\nAuto-disconnect in: {}", format_elapsed(left));
                }
                out
            }
            Err(e) => e.to_string(),
        },
        Command::Ping => match tether.ping().await {
            Ok(Some(ms)) => format!("Current ping: {}ms", ms),
            Ok(None) => "Ping not measured yet.".to_string(),
            Err(e) => e.to_string(),
        },
        Command::Status => {
            let status = tether.status().await;
            let mut out = format!("State: {:?}", status.state);
            if let Some(server) = status.server_name {
                let _ = write!(out, " ({})", server);
            }
            if status.reconnect_pending {
                let _ = write!(
                    out,
                    "\nReconnecting: attempt {}/{}",
                    status.reconnect_attempts,
                    tether.config().reconnect.max_attempts
                );
            }
            let _ = write!(
                out,
                "\nScheduled: {}\nSaved servers: {}",
                status.scheduled, status.saved_servers
            );
            out
        }
        Command::AddServer {
            name,
            host,
            port,
            username,
        } => match tether.add_server(&name, &host, port, username).await {
            Ok(profile) => format!("Saved server {} ({}).", profile.name, profile.address()),
            Err(e) => e.to_string(),
        },
        Command::DelServer { name } => match tether.remove_server(&name).await {
            Ok(profile) => format!("Removed server {}.", profile.name),
            Err(e) => e.to_string(),
        },
        Command::Servers => {
            let servers = tether.list_servers();
            if servers.is_empty() {
                "No saved servers.".to_string()
            } else {
                let mut out = String::from("Saved servers:");
                for server in servers {
                    let _ = write!(out, "\n  {}  {}", server.name, server.address());
                    if let Some(username) = server.default_username {
                        let _ = write!(out, "  (as {})", username);
                    }
                }
                out
            }
        }
        Command::Help => HELP.to_string(),
        Command::Quit => return Outcome::Quit,
    };
    Outcome::Reply(reply)
}
