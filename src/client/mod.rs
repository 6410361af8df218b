//! Game Client Abstraction
//!
//! The connection core never speaks a game protocol. A [`GameConnector`]
//! builds a client for an endpoint and hands back:
//!
//! - a [`GameClient`] handle (latency, quit)
//! - an ordered stream of [`ClientEvent`]s
//!
//! ```text
//! ConnectionManager ──open()──▶ GameConnector
//!        ▲                           │
//!        │   ClientEvent (mpsc)      ▼
//!        └──────────────────── client task ──▶ server
//! ```
//!
//! Construction must not wait on the network: resolution and the handshake
//! happen inside the client task and surface as events.

mod error;
pub mod scripted;
pub mod tcp;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

pub use error::ClientError;
pub use scripted::{ScriptedClient, ScriptedConnector, ScriptedLink};
pub use tcp::{TcpClient, TcpConnector};

/// Where and as whom to connect
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub username: String,
}

impl Endpoint {
    /// Socket address string, bracketing IPv6 literals
    pub fn socket_addr(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

/// Events reported by a live client, in order
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// Entered the world; the session is usable from here on
    Spawned,
    Chat { sender: String, message: String },
    Health { health: f32, food: u32 },
    Death,
    Respawn,
    TimeOfDay { is_day: bool },
    /// Server-initiated removal
    Kicked { reason: String },
    Error { message: String },
    /// Stream ended without an explicit kick or error
    End { reason: String },
}

impl ClientEvent {
    /// Whether this event ends the client's life
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ClientEvent::Kicked { .. } | ClientEvent::Error { .. } | ClientEvent::End { .. }
        )
    }
}

/// Handle to a constructed client
#[async_trait]
pub trait GameClient: Send + Sync {
    /// Most recent round-trip latency, if one has been measured
    fn latency_ms(&self) -> Option<u64>;

    /// Leave the server. Must be safe to call more than once.
    async fn quit(&self);
}

/// A freshly opened client and its event stream
pub struct ClientSession {
    pub client: Arc<dyn GameClient>,
    pub events: mpsc::Receiver<ClientEvent>,
}

/// Builds clients. Called with the manager's session lock held, so it must
/// return promptly; failures here are reported straight to the caller.
pub trait GameConnector: Send + Sync {
    fn open(&self, endpoint: &Endpoint) -> Result<ClientSession, ClientError>;
}
