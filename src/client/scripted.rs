//! Scripted Connector
//!
//! In-memory [`GameConnector`] whose clients are driven by the caller: every
//! `open()` yields a [`ScriptedLink`] through which events are pushed into
//! the manager exactly as a real client would deliver them. Used by the test
//! suites and for dry runs without a server.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};

use super::{ClientError, ClientEvent, ClientSession, Endpoint, GameClient, GameConnector};

const UNKNOWN_LATENCY: u64 = u64::MAX;

/// Client half of a scripted link
pub struct ScriptedClient {
    latency: AtomicU64,
    quit: AtomicBool,
}

#[async_trait]
impl GameClient for ScriptedClient {
    fn latency_ms(&self) -> Option<u64> {
        match self.latency.load(Ordering::SeqCst) {
            UNKNOWN_LATENCY => None,
            ms => Some(ms),
        }
    }

    async fn quit(&self) {
        self.quit.store(true, Ordering::SeqCst);
    }
}

/// Caller-side handle to one opened client
#[derive(Clone)]
pub struct ScriptedLink {
    endpoint: Endpoint,
    events: mpsc::Sender<ClientEvent>,
    client: Arc<ScriptedClient>,
}

impl ScriptedLink {
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Deliver an event. Silently dropped once the receiver is gone.
    pub async fn emit(&self, event: ClientEvent) {
        let _ = self.events.send(event).await;
    }

    pub async fn spawn(&self) {
        self.emit(ClientEvent::Spawned).await;
    }

    pub async fn end(&self, reason: &str) {
        self.emit(ClientEvent::End {
            reason: reason.to_string(),
        })
        .await;
    }

    pub fn set_latency(&self, ms: u64) {
        self.client.latency.store(ms, Ordering::SeqCst);
    }

    pub fn was_quit(&self) -> bool {
        self.client.quit.load(Ordering::SeqCst)
    }

    /// Whether the consuming side has dropped its receiver
    pub fn is_closed(&self) -> bool {
        self.events.is_closed()
    }
}

#[derive(Default)]
struct ScriptedState {
    links: Vec<ScriptedLink>,
    fail_next: Option<String>,
}

pub struct ScriptedConnector {
    state: Mutex<ScriptedState>,
    opened: watch::Sender<usize>,
}

impl Default for ScriptedConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedConnector {
    pub fn new() -> Self {
        let (opened, _) = watch::channel(0);
        Self {
            state: Mutex::new(ScriptedState::default()),
            opened,
        }
    }

    /// Make the next `open()` fail synchronously
    pub fn fail_next_open(&self, message: &str) {
        self.state.lock().fail_next = Some(message.to_string());
    }

    pub fn open_count(&self) -> usize {
        self.state.lock().links.len()
    }

    pub fn link(&self, index: usize) -> Option<ScriptedLink> {
        self.state.lock().links.get(index).cloned()
    }

    pub fn last_link(&self) -> Option<ScriptedLink> {
        self.state.lock().links.last().cloned()
    }

    /// Wait until at least `count` clients have been opened and return the
    /// `count`-th one (a count of 0 is treated as 1)
    pub async fn wait_for_opens(&self, count: usize) -> ScriptedLink {
        let count = count.max(1);
        let mut rx = self.opened.subscribe();
        // Sender lives in self, so the channel can't close while we wait
        let _ = rx.wait_for(|opened| *opened >= count).await;
        let state = self.state.lock();
        state.links[count - 1].clone()
    }
}

impl GameConnector for ScriptedConnector {
    fn open(&self, endpoint: &Endpoint) -> Result<ClientSession, ClientError> {
        let mut state = self.state.lock();
        if let Some(message) = state.fail_next.take() {
            return Err(ClientError::ConnectionFailed(message));
        }

        let (events, rx) = mpsc::channel(32);
        let client = Arc::new(ScriptedClient {
            latency: AtomicU64::new(UNKNOWN_LATENCY),
            quit: AtomicBool::new(false),
        });
        state.links.push(ScriptedLink {
            endpoint: endpoint.clone(),
            events,
            client: Arc::clone(&client),
        });
        let count = state.links.len();
        drop(state);

        self.opened.send_replace(count);

        Ok(ClientSession { client, events: rx })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint() -> Endpoint {
        Endpoint {
            host: "localhost".to_string(),
            port: 25565,
            username: "bot".to_string(),
        }
    }

    #[tokio::test]
    async fn test_events_flow_through_link() {
        let connector = ScriptedConnector::new();
        let mut session = connector.open(&endpoint()).unwrap();
        let link = connector.wait_for_opens(1).await;

        link.spawn().await;
        link.set_latency(42);
        assert_eq!(session.events.recv().await, Some(ClientEvent::Spawned));
        assert_eq!(session.client.latency_ms(), Some(42));

        session.client.quit().await;
        assert!(link.was_quit());
    }

    #[test]
    fn test_fail_next_open() {
        let connector = ScriptedConnector::new();
        connector.fail_next_open("resolution failed");
        assert!(connector.open(&endpoint()).is_err());
        assert_eq!(connector.open_count(), 0);
        assert!(connector.open(&endpoint()).is_ok());
        assert_eq!(connector.open_count(), 1);
    }
}
