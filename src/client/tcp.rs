//! TCP Transport Client
//!
//! Implements the "single owner" pattern for the socket: one task owns the
//! `TcpStream`, everything else talks to it through [`TcpClient`], which
//! forwards commands over an mpsc channel.
//!
//! No game protocol is spoken. A completed TCP handshake counts as world
//! entry, end-of-stream and IO errors count as connection loss, and the
//! handshake round trip is reported as latency.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, info, trace};

use super::{ClientError, ClientEvent, ClientSession, Endpoint, GameClient, GameConnector};

const UNKNOWN_LATENCY: u64 = u64::MAX;

/// Commands sent to the socket owner task
enum TcpCommand {
    Quit,
}

/// Builds [`TcpClient`]s
pub struct TcpConnector {
    connect_timeout: Duration,
}

impl TcpConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Default for TcpConnector {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

impl GameConnector for TcpConnector {
    fn open(&self, endpoint: &Endpoint) -> Result<ClientSession, ClientError> {
        if endpoint.host.trim().is_empty() {
            return Err(ClientError::InvalidEndpoint("empty host".to_string()));
        }
        if endpoint.port == 0 {
            return Err(ClientError::InvalidEndpoint("port 0".to_string()));
        }
        if endpoint.username.trim().is_empty() {
            return Err(ClientError::InvalidEndpoint("empty username".to_string()));
        }

        let (cmd_tx, cmd_rx) = mpsc::channel(8);
        let (event_tx, event_rx) = mpsc::channel(64);
        let latency = Arc::new(AtomicU64::new(UNKNOWN_LATENCY));

        tokio::spawn(run_socket_owner(
            endpoint.socket_addr(),
            self.connect_timeout,
            cmd_rx,
            event_tx,
            Arc::clone(&latency),
        ));

        Ok(ClientSession {
            client: Arc::new(TcpClient { cmd_tx, latency }),
            events: event_rx,
        })
    }
}

/// Controller for the socket owner task
pub struct TcpClient {
    cmd_tx: mpsc::Sender<TcpCommand>,
    latency: Arc<AtomicU64>,
}

#[async_trait]
impl GameClient for TcpClient {
    fn latency_ms(&self) -> Option<u64> {
        match self.latency.load(Ordering::Relaxed) {
            UNKNOWN_LATENCY => None,
            ms => Some(ms),
        }
    }

    async fn quit(&self) {
        // Owner already gone means the socket is already closed
        let _ = self.cmd_tx.send(TcpCommand::Quit).await;
    }
}

async fn run_socket_owner(
    addr: String,
    connect_timeout: Duration,
    mut cmd_rx: mpsc::Receiver<TcpCommand>,
    event_tx: mpsc::Sender<ClientEvent>,
    latency: Arc<AtomicU64>,
) {
    debug!("Socket owner started for {}", addr);
    let started = Instant::now();

    let connect = tokio::time::timeout(connect_timeout, TcpStream::connect(&addr));
    let stream = tokio::select! {
        result = connect => match result {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                let _ = event_tx.send(ClientEvent::Error { message: e.to_string() }).await;
                return;
            }
            Err(_) => {
                let _ = event_tx
                    .send(ClientEvent::Error {
                        message: format!("connect timed out after {}s", connect_timeout.as_secs()),
                    })
                    .await;
                return;
            }
        },
        cmd = cmd_rx.recv() => {
            // Quit (or every controller dropped) before the handshake finished
            if matches!(cmd, Some(TcpCommand::Quit) | None) {
                debug!("Socket owner for {} cancelled during connect", addr);
            }
            return;
        }
    };

    let rtt = started.elapsed().as_millis() as u64;
    latency.store(rtt, Ordering::Relaxed);
    info!("TCP connection to {} established ({}ms)", addr, rtt);

    if event_tx.send(ClientEvent::Spawned).await.is_err() {
        return;
    }

    let (mut reader, mut writer) = stream.into_split();
    let mut buf = vec![0u8; 4096];

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => match cmd {
                Some(TcpCommand::Quit) | None => {
                    let _ = writer.shutdown().await;
                    info!("TCP connection to {} closed on request", addr);
                    return;
                }
            },
            read = reader.read(&mut buf) => match read {
                Ok(0) => {
                    let _ = event_tx
                        .send(ClientEvent::End { reason: "connection closed by server".to_string() })
                        .await;
                    return;
                }
                Ok(n) => trace!("{} bytes from {}", n, addr),
                Err(e) => {
                    let _ = event_tx.send(ClientEvent::Error { message: e.to_string() }).await;
                    return;
                }
            },
        }
    }
}
