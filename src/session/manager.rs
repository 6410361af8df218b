//! Connection Manager
//!
//! Owns the single managed session and everything tied to it:
//!
//! ```text
//! ┌──────────────────── Slot (tokio Mutex) ────────────────────┐
//! │  session: Option<Session>        generation, state, ...    │
//! │  client:  Option<Arc<dyn GameClient>>                      │
//! │  tasks:                                                    │
//! │    ├── pump            client events → state machine       │
//! │    ├── liveness        periodic latency sampling           │
//! │    └── auto_disconnect optional duration timer             │
//! └────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every transition happens with the slot locked, which is what enforces the
//! at-most-one-session gate. Timers capture the session generation when they
//! are armed and do nothing if it no longer matches when they fire.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use super::error::ConnectionError;
use super::events::{DisconnectReason, LifecycleEvent};
use super::liveness::{spawn_sampler, LivenessConfig};
use super::reconnect::{ReconnectState, ReconnectionController};
use super::store::SessionStore;
use super::types::{
    ConnectAccepted, ConnectRequest, ConnectionInfo, LastSessionRecord, Session, SessionState,
};
use crate::client::{ClientEvent, ClientSession, Endpoint, GameClient, GameConnector};
use crate::router::{EventRouter, RoutedEvent};
use crate::servers::{ServerProfile, ServerRegistry};

/// Capacity of the lifecycle broadcast channel
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Background tasks bound to one session
#[derive(Default)]
struct SessionTasks {
    pump: Option<JoinHandle<()>>,
    liveness: Option<JoinHandle<()>>,
    auto_disconnect: Option<JoinHandle<()>>,
}

impl SessionTasks {
    fn abort_all(&mut self) {
        for handle in [
            self.pump.take(),
            self.liveness.take(),
            self.auto_disconnect.take(),
        ]
        .into_iter()
        .flatten()
        {
            handle.abort();
        }
    }
}

#[derive(Default)]
struct Slot {
    session: Option<Session>,
    client: Option<Arc<dyn GameClient>>,
    tasks: SessionTasks,
}

impl Slot {
    fn current(&self, generation: u64) -> Option<&Session> {
        self.session
            .as_ref()
            .filter(|session| session.generation == generation)
    }

    fn current_mut(&mut self, generation: u64) -> Option<&mut Session> {
        self.session
            .as_mut()
            .filter(|session| session.generation == generation)
    }

    /// Stop every task, quit the client and forget the session
    async fn teardown(&mut self) -> Option<Session> {
        self.tasks.abort_all();
        if let Some(client) = self.client.take() {
            client.quit().await;
        }
        self.session.take()
    }
}

pub struct ConnectionManager {
    registry: Arc<ServerRegistry>,
    session_store: Arc<SessionStore>,
    connector: Arc<dyn GameConnector>,
    router: Arc<EventRouter>,
    default_username: String,
    liveness: LivenessConfig,
    reconnect: Arc<ReconnectState>,
    loss_handler: parking_lot::Mutex<Option<Weak<ReconnectionController>>>,
    slot: Mutex<Slot>,
    generation: AtomicU64,
    events: broadcast::Sender<LifecycleEvent>,
}

impl ConnectionManager {
    pub fn new(
        registry: Arc<ServerRegistry>,
        session_store: Arc<SessionStore>,
        connector: Arc<dyn GameConnector>,
        router: Arc<EventRouter>,
        default_username: String,
        liveness: LivenessConfig,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Arc::new(Self {
            registry,
            session_store,
            connector,
            router,
            default_username,
            liveness,
            reconnect: Arc::new(ReconnectState::default()),
            loss_handler: parking_lot::Mutex::new(None),
            slot: Mutex::new(Slot::default()),
            generation: AtomicU64::new(0),
            events,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.events.subscribe()
    }

    /// Backoff state shared with the reconnection controller
    pub fn reconnect_state(&self) -> Arc<ReconnectState> {
        Arc::clone(&self.reconnect)
    }

    pub(super) fn set_loss_handler(&self, handler: Weak<ReconnectionController>) {
        *self.loss_handler.lock() = Some(handler);
    }

    pub(super) fn clear_loss_handler(&self) {
        self.loss_handler.lock().take();
    }

    fn emit(&self, event: LifecycleEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    fn effective_username(&self, request: &ConnectRequest, server: &ServerProfile) -> String {
        request
            .username
            .as_deref()
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .or(server.default_username.as_deref())
            .unwrap_or(&self.default_username)
            .to_string()
    }

    /// Start a session
    ///
    /// Returns once the client is constructed; world entry and loss arrive
    /// later as [`LifecycleEvent`]s. Rejected while any session exists.
    pub async fn connect(
        self: &Arc<Self>,
        request: ConnectRequest,
    ) -> Result<ConnectAccepted, ConnectionError> {
        let mut slot = self.slot.lock().await;

        if let Some(existing) = &slot.session {
            warn!(
                "Connect to {} rejected: session to {} is {:?}",
                request.server_name, existing.server.name, existing.state
            );
            return Err(ConnectionError::AlreadyConnected(existing.server.name.clone()));
        }

        let server = self
            .registry
            .get(&request.server_name)
            .ok_or_else(|| ConnectionError::UnknownServer(request.server_name.clone()))?;

        if request.duration_minutes == Some(0) {
            return Err(ConnectionError::InvalidDuration);
        }

        let username = self.effective_username(&request, &server);
        let endpoint = Endpoint {
            host: server.host.clone(),
            port: server.port,
            username: username.clone(),
        };

        let ClientSession { client, events } = self.connector.open(&endpoint).map_err(|e| {
            warn!("Failed to create client for {}: {}", server.address(), e);
            ConnectionError::from(e)
        })?;

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.router.begin_session(&username);

        slot.session = Some(Session {
            generation,
            state: SessionState::Connecting,
            server: server.clone(),
            effective_username: username.clone(),
            planned_duration_minutes: request.duration_minutes,
            started_at: None,
            intentional: false,
        });
        slot.client = Some(client);
        slot.tasks.pump = Some(self.spawn_event_pump(generation, events));

        info!(
            "Connecting to {} ({}) as {} [generation {}]",
            server.name,
            server.address(),
            username,
            generation
        );
        self.emit(LifecycleEvent::Connecting {
            generation,
            server_name: server.name.clone(),
        });

        Ok(ConnectAccepted {
            generation,
            server_name: server.name.clone(),
            address: server.address(),
            username,
        })
    }

    fn spawn_event_pump(
        self: &Arc<Self>,
        generation: u64,
        mut events: mpsc::Receiver<ClientEvent>,
    ) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let terminal = event.is_terminal();
                manager.handle_client_event(generation, event).await;
                if terminal {
                    return;
                }
            }
            manager
                .handle_client_event(
                    generation,
                    ClientEvent::End {
                        reason: "event stream closed".to_string(),
                    },
                )
                .await;
        })
    }

    async fn handle_client_event(self: &Arc<Self>, generation: u64, event: ClientEvent) {
        match &event {
            ClientEvent::Spawned => self.on_spawned(generation).await,
            ClientEvent::Death => {
                if self.set_liveness_paused(generation, true).await {
                    self.router.route_client_event(&event);
                }
            }
            ClientEvent::Respawn => {
                if self.set_liveness_paused(generation, false).await {
                    self.router.route_client_event(&event);
                }
            }
            ClientEvent::Kicked { reason } => {
                let reason = format!("kicked: {}", reason);
                self.on_terminated(generation, &event, reason).await
            }
            ClientEvent::Error { message } => {
                let reason = message.clone();
                self.on_terminated(generation, &event, reason).await
            }
            ClientEvent::End { reason } => {
                let reason = reason.clone();
                self.on_terminated(generation, &event, reason).await
            }
            _ => {
                if self.slot.lock().await.current(generation).is_some() {
                    self.router.route_client_event(&event);
                }
            }
        }
    }

    async fn on_spawned(self: &Arc<Self>, generation: u64) {
        let mut slot = self.slot.lock().await;
        let Slot {
            session,
            client,
            tasks,
        } = &mut *slot;

        let Some(session) = session
            .as_mut()
            .filter(|session| session.generation == generation)
        else {
            debug!("Ignoring spawn from stale generation {}", generation);
            return;
        };
        if session.state != SessionState::Connecting {
            debug!("Ignoring duplicate spawn in state {:?}", session.state);
            return;
        }

        let now = Utc::now();
        session.state = SessionState::Connected;
        session.started_at = Some(now);

        let previous_attempts = self.reconnect.reset_after_spawn();
        self.session_store
            .save(LastSessionRecord {
                server_name: session.server.name.clone(),
                username: session.effective_username.clone(),
                planned_duration_minutes: session.planned_duration_minutes,
                saved_at: now,
                reconnect_attempts_at_save_time: previous_attempts,
            })
            .await;

        if let Some(client) = client {
            if let Some(old_handle) = tasks.liveness.replace(spawn_sampler(
                Arc::clone(client),
                self.liveness.clone(),
                Arc::clone(&self.router),
                session.server.name.clone(),
            )) {
                old_handle.abort();
            }
        }

        if let Some(minutes) = session.planned_duration_minutes {
            if let Some(old_handle) = tasks
                .auto_disconnect
                .replace(self.arm_auto_disconnect(generation, minutes))
            {
                old_handle.abort();
            }
        }

        info!(
            "Connected to {} as {} (previous reconnect attempts: {})",
            session.server.address(),
            session.effective_username,
            previous_attempts
        );
        self.router.publish(RoutedEvent::Connected {
            server: session.server.name.clone(),
            address: session.server.address(),
            username: session.effective_username.clone(),
        });
        if let Some(minutes) = session.planned_duration_minutes {
            self.router
                .publish(RoutedEvent::AutoDisconnectArmed { minutes });
        }
        self.emit(LifecycleEvent::Connected {
            generation,
            server_name: session.server.name.clone(),
            username: session.effective_username.clone(),
        });
    }

    async fn on_terminated(&self, generation: u64, event: &ClientEvent, reason: String) {
        let mut slot = self.slot.lock().await;
        if slot.current(generation).is_none() {
            debug!("Ignoring terminal event from stale generation {}", generation);
            return;
        }

        // The pump is the task running this; detach instead of aborting it
        slot.tasks.pump.take();
        let Some(session) = slot.teardown().await else {
            return;
        };

        self.router.route_client_event(event);
        self.router.publish(RoutedEvent::ConnectionLost {
            server: session.server.name.clone(),
            reason: reason.clone(),
        });

        if session.intentional {
            info!("Session to {} ended: {}", session.server.name, reason);
            self.session_store.clear().await;
            self.emit(LifecycleEvent::Disconnected {
                generation,
                server_name: session.server.name.clone(),
                reason: DisconnectReason::Operator,
            });
        } else {
            warn!(
                "Lost connection to {} while {:?}: {}",
                session.server.name, session.state, reason
            );
            let request = session.request();

            // Still holding the slot: the retry is armed before the session
            // can be seen as idle
            let handler = self.loss_handler.lock().as_ref().and_then(Weak::upgrade);
            if let Some(handler) = handler {
                handler
                    .on_involuntary_disconnect(request.clone(), reason.clone())
                    .await;
            }

            self.emit(LifecycleEvent::InvoluntaryDisconnect {
                generation,
                request,
                reason,
            });
        }
    }

    /// Pause or resume liveness sampling. Returns false for a stale generation.
    async fn set_liveness_paused(&self, generation: u64, paused: bool) -> bool {
        let mut slot = self.slot.lock().await;
        let Slot {
            session,
            client,
            tasks,
        } = &mut *slot;

        let Some(session) = session
            .as_ref()
            .filter(|session| session.generation == generation)
        else {
            return false;
        };

        if paused {
            if let Some(handle) = tasks.liveness.take() {
                handle.abort();
                debug!("Liveness sampling paused for {}", session.server.name);
            }
        } else if session.state == SessionState::Connected && tasks.liveness.is_none() {
            if let Some(client) = client {
                tasks.liveness = Some(spawn_sampler(
                    Arc::clone(client),
                    self.liveness.clone(),
                    Arc::clone(&self.router),
                    session.server.name.clone(),
                ));
                debug!("Liveness sampling resumed for {}", session.server.name);
            }
        }
        true
    }

    fn arm_auto_disconnect(self: &Arc<Self>, generation: u64, minutes: u32) -> JoinHandle<()> {
        debug!(
            "Auto-disconnect armed for generation {} in {} minutes",
            generation, minutes
        );
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            sleep(Duration::from_secs(u64::from(minutes) * 60)).await;
            manager.expire(generation, minutes).await;
        })
    }

    async fn expire(&self, generation: u64, minutes: u32) {
        let mut slot = self.slot.lock().await;
        match slot.current_mut(generation) {
            Some(session) if session.state == SessionState::Connected => {
                session.state = SessionState::Ending;
                session.intentional = true;
            }
            _ => {
                debug!("Stale auto-disconnect timer for generation {}", generation);
                return;
            }
        }

        // Running on the timer task itself
        slot.tasks.auto_disconnect.take();
        let Some(session) = slot.teardown().await else {
            return;
        };

        self.reconnect.clear();
        self.session_store.clear().await;

        info!(
            "Auto-disconnected from {} after {} minutes",
            session.server.name, minutes
        );
        self.router.publish(RoutedEvent::AutoDisconnected { minutes });
        self.emit(LifecycleEvent::Disconnected {
            generation,
            server_name: session.server.name,
            reason: DisconnectReason::DurationElapsed,
        });
    }

    /// End the session on purpose. Returns the server it was connected to.
    pub async fn disconnect(&self) -> Result<String, ConnectionError> {
        let mut slot = self.slot.lock().await;
        let Some(session) = slot.session.as_mut() else {
            if self.reconnect.clear() {
                info!("Disconnect requested while reconnecting, pending attempt dropped");
            } else {
                info!("Disconnect requested with no active session");
            }
            return Err(ConnectionError::NotConnected);
        };

        // Flag first so nothing observing the teardown treats it as a loss
        session.intentional = true;
        session.state = SessionState::Ending;
        let generation = session.generation;

        let Some(session) = slot.teardown().await else {
            return Err(ConnectionError::NotConnected);
        };

        self.reconnect.clear();
        self.session_store.clear().await;

        info!("Disconnected from {}", session.server.name);
        self.emit(LifecycleEvent::Disconnected {
            generation,
            server_name: session.server.name.clone(),
            reason: DisconnectReason::Operator,
        });

        Ok(session.server.name)
    }

    /// Replace the auto-disconnect timer of the live session
    pub async fn set_disconnect_timer(self: &Arc<Self>, minutes: u32) -> Result<(), ConnectionError> {
        if minutes == 0 {
            return Err(ConnectionError::InvalidDuration);
        }

        let mut slot = self.slot.lock().await;
        let generation = match slot.session.as_mut() {
            Some(session) if session.state == SessionState::Connected => {
                session.planned_duration_minutes = Some(minutes);
                session.generation
            }
            _ => return Err(ConnectionError::NotConnected),
        };

        if let Some(old_handle) = slot
            .tasks
            .auto_disconnect
            .replace(self.arm_auto_disconnect(generation, minutes))
        {
            old_handle.abort();
        }
        self.router
            .publish(RoutedEvent::AutoDisconnectArmed { minutes });

        Ok(())
    }

    pub async fn state(&self) -> SessionState {
        self.slot
            .lock()
            .await
            .session
            .as_ref()
            .map(|session| session.state)
            .unwrap_or_default()
    }

    pub async fn is_connected(&self) -> bool {
        self.state().await == SessionState::Connected
    }

    /// Name of the server with a live or pending session
    pub async fn current_server(&self) -> Option<String> {
        self.slot
            .lock()
            .await
            .session
            .as_ref()
            .map(|session| session.server.name.clone())
    }

    pub async fn connection_info(&self) -> Result<ConnectionInfo, ConnectionError> {
        let slot = self.slot.lock().await;
        let session = slot
            .session
            .as_ref()
            .filter(|session| session.state == SessionState::Connected)
            .ok_or(ConnectionError::NotConnected)?;
        let started_at = session.started_at.ok_or(ConnectionError::NotConnected)?;

        let elapsed = (Utc::now() - started_at).num_seconds().max(0) as u64;
        Ok(ConnectionInfo {
            server_name: session.server.name.clone(),
            address: session.server.address(),
            username: session.effective_username.clone(),
            connected_since: started_at,
            duration_elapsed_secs: elapsed,
            planned_duration_minutes: session.planned_duration_minutes,
        })
    }

    /// Latest latency of the live session
    pub async fn ping(&self) -> Result<Option<u64>, ConnectionError> {
        let slot = self.slot.lock().await;
        match (&slot.session, &slot.client) {
            (Some(session), Some(client)) if session.state == SessionState::Connected => {
                Ok(client.latency_ms())
            }
            _ => Err(ConnectionError::NotConnected),
        }
    }

    /// Close the session for process exit. The last session record is kept
    /// so the next start resumes it.
    pub async fn shutdown(&self) {
        let mut slot = self.slot.lock().await;
        let Some(session) = slot.session.as_mut() else {
            return;
        };
        session.intentional = true;
        session.state = SessionState::Ending;
        let generation = session.generation;

        if let Some(session) = slot.teardown().await {
            info!(
                "Session to {} closed for shutdown, resume record kept",
                session.server.name
            );
            self.emit(LifecycleEvent::Disconnected {
                generation,
                server_name: session.server.name,
                reason: DisconnectReason::Shutdown,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ScriptedConnector;
    use crate::router::{CategoryToggles, ChannelSink};
    use tempfile::{tempdir, TempDir};

    struct Harness {
        _temp: TempDir,
        manager: Arc<ConnectionManager>,
        connector: Arc<ScriptedConnector>,
        store: Arc<SessionStore>,
        events: broadcast::Receiver<LifecycleEvent>,
    }

    async fn harness() -> Harness {
        let temp = tempdir().unwrap();
        let registry = Arc::new(ServerRegistry::open(temp.path()).await);
        registry
            .add("alpha", "127.0.0.1", 25565, Some("Steve".to_string()))
            .await
            .unwrap();
        registry.add("beta", "127.0.0.2", 25565, None).await.unwrap();

        let store = Arc::new(SessionStore::open(temp.path()).await);
        let connector = Arc::new(ScriptedConnector::new());
        let (sink, _routed) = ChannelSink::new();
        let router = Arc::new(EventRouter::new(Arc::new(sink), CategoryToggles::default()));

        let manager = ConnectionManager::new(
            registry,
            Arc::clone(&store),
            connector.clone(),
            router,
            "AFKBot".to_string(),
            LivenessConfig::default(),
        );
        let events = manager.subscribe();

        Harness {
            _temp: temp,
            manager,
            connector,
            store,
            events,
        }
    }

    async fn next_event(events: &mut broadcast::Receiver<LifecycleEvent>) -> LifecycleEvent {
        events.recv().await.unwrap()
    }

    async fn connect_and_spawn(h: &mut Harness, request: ConnectRequest) {
        h.manager.connect(request).await.unwrap();
        assert!(matches!(
            next_event(&mut h.events).await,
            LifecycleEvent::Connecting { .. }
        ));
        h.connector.last_link().unwrap().spawn().await;
        assert!(matches!(
            next_event(&mut h.events).await,
            LifecycleEvent::Connected { .. }
        ));
    }

    #[tokio::test]
    async fn test_second_connect_rejected() {
        let mut h = harness().await;
        connect_and_spawn(&mut h, ConnectRequest::new("alpha")).await;

        let result = h.manager.connect(ConnectRequest::new("beta")).await;
        assert!(matches!(result, Err(ConnectionError::AlreadyConnected(name)) if name == "alpha"));
        assert_eq!(h.connector.open_count(), 1);
        assert_eq!(h.manager.current_server().await.as_deref(), Some("alpha"));
    }

    #[tokio::test]
    async fn test_connect_while_connecting_rejected() {
        let h = harness().await;
        h.manager.connect(ConnectRequest::new("alpha")).await.unwrap();
        assert_eq!(h.manager.state().await, SessionState::Connecting);

        assert!(matches!(
            h.manager.connect(ConnectRequest::new("alpha")).await,
            Err(ConnectionError::AlreadyConnected(_))
        ));
        assert_eq!(h.connector.open_count(), 1);
    }

    #[tokio::test]
    async fn test_validation_failures_leave_idle() {
        let h = harness().await;

        assert!(matches!(
            h.manager.connect(ConnectRequest::new("nowhere")).await,
            Err(ConnectionError::UnknownServer(_))
        ));
        assert!(matches!(
            h.manager
                .connect(ConnectRequest::new("alpha").with_duration(0))
                .await,
            Err(ConnectionError::InvalidDuration)
        ));

        h.connector.fail_next_open("resolution failed");
        assert!(matches!(
            h.manager.connect(ConnectRequest::new("alpha")).await,
            Err(ConnectionError::Client(_))
        ));

        assert_eq!(h.manager.state().await, SessionState::Idle);
        assert_eq!(h.manager.reconnect_state().attempts(), 0);
    }

    #[tokio::test]
    async fn test_username_resolution() {
        let mut h = harness().await;

        connect_and_spawn(&mut h, ConnectRequest::new("alpha")).await;
        assert_eq!(h.connector.last_link().unwrap().endpoint().username, "Steve");
        h.manager.disconnect().await.unwrap();
        next_event(&mut h.events).await;

        connect_and_spawn(&mut h, ConnectRequest::new("beta")).await;
        assert_eq!(h.connector.last_link().unwrap().endpoint().username, "AFKBot");
        h.manager.disconnect().await.unwrap();
        next_event(&mut h.events).await;

        connect_and_spawn(&mut h, ConnectRequest::new("alpha").with_username("Alex")).await;
        assert_eq!(h.connector.last_link().unwrap().endpoint().username, "Alex");
    }

    #[tokio::test]
    async fn test_spawn_saves_record() {
        let mut h = harness().await;
        connect_and_spawn(&mut h, ConnectRequest::new("alpha").with_duration(30)).await;

        let record = h.store.current().unwrap();
        assert_eq!(record.server_name, "alpha");
        assert_eq!(record.username, "Steve");
        assert_eq!(record.planned_duration_minutes, Some(30));

        let info = h.manager.connection_info().await.unwrap();
        assert_eq!(info.address, "127.0.0.1:25565");
        assert_eq!(info.planned_duration_minutes, Some(30));
    }

    #[tokio::test]
    async fn test_disconnect_clears_record_and_quits() {
        let mut h = harness().await;
        connect_and_spawn(&mut h, ConnectRequest::new("alpha")).await;
        let link = h.connector.last_link().unwrap();

        assert_eq!(h.manager.disconnect().await.unwrap(), "alpha");
        assert!(link.was_quit());
        assert!(h.store.current().is_none());
        assert_eq!(h.manager.state().await, SessionState::Idle);
        assert!(matches!(
            next_event(&mut h.events).await,
            LifecycleEvent::Disconnected {
                reason: DisconnectReason::Operator,
                ..
            }
        ));

        assert!(matches!(
            h.manager.disconnect().await,
            Err(ConnectionError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_loss_keeps_record_and_reports_request() {
        let mut h = harness().await;
        connect_and_spawn(&mut h, ConnectRequest::new("alpha").with_duration(45)).await;

        h.connector
            .last_link()
            .unwrap()
            .emit(ClientEvent::Kicked {
                reason: "server restarting".to_string(),
            })
            .await;

        match next_event(&mut h.events).await {
            LifecycleEvent::InvoluntaryDisconnect { request, reason, .. } => {
                assert_eq!(request.server_name, "alpha");
                assert_eq!(request.username.as_deref(), Some("Steve"));
                assert_eq!(request.duration_minutes, Some(45));
                assert!(reason.contains("server restarting"));
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert!(h.store.current().is_some());
        assert_eq!(h.manager.state().await, SessionState::Idle);
    }

    #[tokio::test]
    async fn test_error_before_spawn_counts_as_loss() {
        let mut h = harness().await;
        h.manager.connect(ConnectRequest::new("alpha")).await.unwrap();
        next_event(&mut h.events).await;

        h.connector
            .last_link()
            .unwrap()
            .emit(ClientEvent::Error {
                message: "connection refused".to_string(),
            })
            .await;

        assert!(matches!(
            next_event(&mut h.events).await,
            LifecycleEvent::InvoluntaryDisconnect { .. }
        ));
        // Never spawned, so nothing to resume
        assert!(h.store.current().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_auto_disconnect_fires() {
        let mut h = harness().await;
        connect_and_spawn(&mut h, ConnectRequest::new("alpha").with_duration(1)).await;
        let started = tokio::time::Instant::now();

        assert!(matches!(
            next_event(&mut h.events).await,
            LifecycleEvent::Disconnected {
                reason: DisconnectReason::DurationElapsed,
                ..
            }
        ));
        assert!(started.elapsed() >= Duration::from_secs(60));
        assert!(h.store.current().is_none());
        assert!(h.connector.last_link().unwrap().was_quit());
    }

    #[tokio::test(start_paused = true)]
    async fn test_old_timer_does_not_end_new_session() {
        let mut h = harness().await;
        connect_and_spawn(&mut h, ConnectRequest::new("alpha").with_duration(1)).await;
        h.manager.disconnect().await.unwrap();
        next_event(&mut h.events).await;

        connect_and_spawn(&mut h, ConnectRequest::new("beta")).await;
        sleep(Duration::from_secs(180)).await;

        assert!(h.manager.is_connected().await);
        assert_eq!(h.manager.current_server().await.as_deref(), Some("beta"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_disconnect_timer() {
        let mut h = harness().await;
        assert!(matches!(
            h.manager.set_disconnect_timer(5).await,
            Err(ConnectionError::NotConnected)
        ));

        connect_and_spawn(&mut h, ConnectRequest::new("alpha")).await;
        assert!(matches!(
            h.manager.set_disconnect_timer(0).await,
            Err(ConnectionError::InvalidDuration)
        ));
        h.manager.set_disconnect_timer(2).await.unwrap();

        let started = tokio::time::Instant::now();
        assert!(matches!(
            next_event(&mut h.events).await,
            LifecycleEvent::Disconnected {
                reason: DisconnectReason::DurationElapsed,
                ..
            }
        ));
        assert!(started.elapsed() >= Duration::from_secs(120));
    }

    #[tokio::test]
    async fn test_ping_and_shutdown_keeps_record() {
        let mut h = harness().await;
        assert!(h.manager.ping().await.is_err());

        connect_and_spawn(&mut h, ConnectRequest::new("alpha")).await;
        h.connector.last_link().unwrap().set_latency(87);
        assert_eq!(h.manager.ping().await.unwrap(), Some(87));

        h.manager.shutdown().await;
        assert_eq!(h.manager.state().await, SessionState::Idle);
        assert!(h.store.current().is_some());
    }
}
