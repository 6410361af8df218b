//! Tether binary
//!
//! # Usage
//!
//! ```bash
//! # Save a server, then run the console
//! tether add-server alpha mc.example.org 25565 --username AFKBot
//! tether
//!
//! # Use a different data directory
//! TETHER_DATA_DIR=/srv/tether tether run
//! ```

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use mimalloc::MiMalloc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

use tether::client::TcpConnector;
use tether::commands::{self, Outcome};
use tether::config::{self, TetherConfig};
use tether::router::TracingSink;
use tether::servers::ServerRegistry;
use tether::{init_logging, Tether};

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

/// Keeps a game bot connected to one server at a time
#[derive(Parser, Debug)]
#[command(name = "tether")]
#[command(version)]
struct Cli {
    /// Data directory (servers, session, schedules, logs)
    #[arg(long, env = "TETHER_DATA_DIR", global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the runtime with an interactive console (default)
    Run,
    /// Save or replace a server profile
    AddServer {
        name: String,
        host: String,
        #[arg(default_value_t = 25565)]
        port: u32,
        /// Default username for this server
        #[arg(long)]
        username: Option<String>,
    },
    /// Remove a server profile
    RemoveServer { name: String },
    /// List saved servers
    ListServers,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let data_dir = match cli.data_dir.map(Ok).unwrap_or_else(config::data_dir) {
        Ok(dir) => dir,
        Err(e) => {
            eprintln!("{}", e);
            return ExitCode::FAILURE;
        }
    };

    let (settings, warning) = TetherConfig::load_from_dir(&data_dir);
    let log_file = init_logging(settings.log_to_file.then_some(data_dir.as_path()));
    if let Some(warning) = warning {
        warn!("{}", warning);
    }
    if let Some(path) = log_file {
        info!("Logging to {:?}", path);
    }

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => {
            run_console(settings, &data_dir).await;
            ExitCode::SUCCESS
        }
        Command::AddServer {
            name,
            host,
            port,
            username,
        } => {
            let registry = ServerRegistry::open(&data_dir).await;
            match registry.add(&name, &host, port, username).await {
                Ok(profile) => {
                    println!("Saved server {} ({})", profile.name, profile.address());
                    ExitCode::SUCCESS
                }
                Err(e) => {
                    eprintln!("{}", e);
                    ExitCode::FAILURE
                }
            }
        }
        Command::RemoveServer { name } => {
            let registry = ServerRegistry::open(&data_dir).await;
            match registry.remove(&name).await {
                Ok(_) => {
                    println!("Removed server {}", name);
                    ExitCode::SUCCESS
                }
                Err(e) => {
                    eprintln!("{}", e);
                    ExitCode::FAILURE
                }
            }
        }
        Command::ListServers => {
            let registry = ServerRegistry::open(&data_dir).await;
            for server in registry.list() {
                println!("{}\t{}", server.name, server.address());
            }
            ExitCode::SUCCESS
        }
    }
}

async fn run_console(settings: TetherConfig, data_dir: &Path) {
    let connector = Arc::new(TcpConnector::new(settings.connect_timeout()));
    let tether = Tether::start(settings, data_dir, connector, Arc::new(TracingSink)).await;

    let report = tether.startup_report();
    if let Some(server) = &report.resuming {
        println!("Resuming last session on {}.", server);
    }
    println!("Type 'help' for commands.");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;

    loop {
        tokio::select! {
            line = lines.next_line(), if stdin_open => match line {
                Ok(Some(line)) => match commands::parse(&line) {
                    None => {}
                    Some(Err(e)) => println!("{}", e),
                    Some(Ok(command)) => match commands::execute(&tether, command).await {
                        Outcome::Reply(reply) => println!("{}", reply),
                        Outcome::Quit => break,
                    },
                },
                Ok(None) => {
                    info!("Console input closed, running until interrupted");
                    stdin_open = false;
                }
                Err(e) => {
                    warn!("Console read failed: {}", e);
                    stdin_open = false;
                }
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupt received");
                break;
            }
        }
    }

    tether.shutdown().await;
}
