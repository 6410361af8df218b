//! Session Reconnection Module
//!
//! Reacts to involuntary disconnects with a linear backoff capped at a
//! maximum delay, re-invoking the connection manager until a spawn succeeds
//! or the attempt budget runs out.
//!
//! # Timer ownership
//!
//! At most one backoff timer exists, and the startup resume uses the same
//! slot. Every arm bumps the epoch, and a timer only fires if the epoch it
//! captured is still current, so a timer that survives its own abort
//! (already running) still can't act after a cancel.
//!
//! Losses are handed over by the manager while it still holds the session
//! slot, so a retry is armed before anyone can observe the session as idle.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use super::error::ConnectionError;
use super::manager::ConnectionManager;
use super::store::SessionStore;
use super::types::{ConnectRequest, LastSessionRecord};
use crate::router::{EventRouter, RoutedEvent};

/// Backoff settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconnectPolicy {
    /// Attempts before giving up
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay added per attempt (ms)
    #[serde(default = "default_step_delay_ms")]
    pub step_delay_ms: u64,
    /// Upper bound on any single delay (ms)
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_max_attempts() -> u32 {
    5
}

fn default_step_delay_ms() -> u64 {
    30_000
}

fn default_max_delay_ms() -> u64 {
    120_000
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            step_delay_ms: default_step_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl ReconnectPolicy {
    /// Delay before the given (1-based) attempt
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let ms = self
            .step_delay_ms
            .saturating_mul(u64::from(attempt))
            .min(self.max_delay_ms);
        Duration::from_millis(ms)
    }
}

/// Attempt counter and pending timer, shared with the connection manager
#[derive(Default)]
pub struct ReconnectState {
    attempts: AtomicU32,
    epoch: AtomicU64,
    pending: Mutex<Option<JoinHandle<()>>>,
    /// An attempt claimed its timer and its session has not settled yet
    in_flight: AtomicBool,
    /// The operator cancelled while an attempt was in flight
    stopped: AtomicBool,
}

impl ReconnectState {
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Whether a backoff or resume timer is waiting to fire
    pub fn is_pending(&self) -> bool {
        self.pending
            .lock()
            .as_ref()
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }

    /// Successful spawn: clear everything, returning the count it replaced
    pub fn reset_after_spawn(&self) -> u32 {
        let previous = self.attempts.swap(0, Ordering::SeqCst);
        self.clear();
        previous
    }

    /// Operator cancel. Drops the pending timer and resets the counter; an
    /// attempt already connecting may finish, but its failure won't re-arm.
    /// Returns whether there was anything to cancel.
    pub fn cancel(&self) -> bool {
        let was_in_flight = self.in_flight.load(Ordering::SeqCst);
        let was_pending = self.clear();
        if was_in_flight {
            self.stopped.store(true, Ordering::SeqCst);
        }
        was_pending || was_in_flight
    }

    /// End the reconnection episode: no timer, no counter, no in-flight
    /// attempt. Returns whether a timer was actually pending.
    pub(super) fn clear(&self) -> bool {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        self.attempts.store(0, Ordering::SeqCst);
        self.in_flight.store(false, Ordering::SeqCst);
        self.stopped.store(false, Ordering::SeqCst);
        match self.pending.lock().take() {
            Some(handle) => {
                let was_pending = !handle.is_finished();
                handle.abort();
                was_pending
            }
            None => false,
        }
    }

    /// A session was lost: settle any in-flight attempt.
    /// True if the operator cancelled it, so nothing may be re-armed.
    fn settle(&self) -> bool {
        self.in_flight.store(false, Ordering::SeqCst);
        self.stopped.swap(false, Ordering::SeqCst)
    }

    fn next_attempt(&self) -> (u32, u64) {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        (attempt, self.next_epoch())
    }

    fn next_epoch(&self) -> u64 {
        self.epoch.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn arm(&self, handle: JoinHandle<()>) {
        if let Some(old_handle) = self.pending.lock().replace(handle) {
            old_handle.abort();
        }
    }

    /// Called by a firing timer: true if it is still the current one, in
    /// which case its attempt is now in flight.
    /// The handle is released without aborting the caller.
    fn claim(&self, epoch: u64) -> bool {
        let mut pending = self.pending.lock();
        if self.epoch.load(Ordering::SeqCst) != epoch {
            return false;
        }
        pending.take();
        self.in_flight.store(true, Ordering::SeqCst);
        true
    }

    /// The claimed attempt never produced a session
    fn abandon(&self) {
        self.in_flight.store(false, Ordering::SeqCst);
        self.stopped.store(false, Ordering::SeqCst);
    }
}

/// Progress reports from the controller
#[derive(Debug, Clone, PartialEq)]
pub enum ReconnectEvent {
    Scheduled {
        server_name: String,
        attempt: u32,
        delay: Duration,
    },
    Attempting {
        server_name: String,
        attempt: u32,
    },
    AttemptRejected {
        server_name: String,
        attempt: u32,
        error: String,
    },
    GaveUp {
        server_name: String,
        attempts: u32,
    },
    Cancelled,
}

pub struct ReconnectionController {
    manager: Arc<ConnectionManager>,
    session_store: Arc<SessionStore>,
    router: Arc<EventRouter>,
    state: Arc<ReconnectState>,
    policy: ReconnectPolicy,
    events: broadcast::Sender<ReconnectEvent>,
}

impl ReconnectionController {
    pub fn new(
        manager: Arc<ConnectionManager>,
        session_store: Arc<SessionStore>,
        router: Arc<EventRouter>,
        policy: ReconnectPolicy,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(64);
        Arc::new(Self {
            state: manager.reconnect_state(),
            manager,
            session_store,
            router,
            policy,
            events,
        })
    }

    /// Register with the manager so every involuntary loss arms a retry
    /// before the session slot is released.
    pub fn attach(self: &Arc<Self>) {
        self.manager.set_loss_handler(Arc::downgrade(self));
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ReconnectEvent> {
        self.events.subscribe()
    }

    pub fn policy(&self) -> &ReconnectPolicy {
        &self.policy
    }

    pub fn attempts(&self) -> u32 {
        self.state.attempts()
    }

    pub fn is_pending(&self) -> bool {
        self.state.is_pending()
    }

    /// Operator cancel. A no-op when nothing is pending.
    pub fn cancel(&self) -> bool {
        let was_pending = self.state.cancel();
        if was_pending {
            info!("Pending reconnection cancelled");
            let _ = self.events.send(ReconnectEvent::Cancelled);
        } else {
            debug!("No pending reconnection to cancel");
        }
        was_pending
    }

    /// Called by the manager with the session slot still held
    pub(super) async fn on_involuntary_disconnect(
        self: &Arc<Self>,
        request: ConnectRequest,
        reason: String,
    ) {
        if self.state.settle() {
            info!(
                "Loss of {} not retried, reconnection was cancelled",
                request.server_name
            );
            self.state.clear();
            return;
        }

        let attempts = self.state.attempts();
        if attempts >= self.policy.max_attempts {
            self.give_up(&request.server_name, attempts).await;
            return;
        }

        debug!("Involuntary disconnect from {}: {}", request.server_name, reason);
        self.schedule_retry(request);
    }

    async fn give_up(&self, server_name: &str, attempts: u32) {
        self.state.clear();
        self.session_store.clear().await;

        error!(
            "Giving up on {} after {} reconnection attempts",
            server_name, attempts
        );
        self.router.publish(RoutedEvent::ReconnectGaveUp {
            server: server_name.to_string(),
            attempts,
        });
        let _ = self.events.send(ReconnectEvent::GaveUp {
            server_name: server_name.to_string(),
            attempts,
        });
    }

    fn schedule_retry(self: &Arc<Self>, request: ConnectRequest) {
        let (attempt, epoch) = self.state.next_attempt();
        let delay = self.policy.delay_for(attempt);

        info!(
            "Reconnecting to {} in {}s (attempt {}/{})",
            request.server_name,
            delay.as_secs(),
            attempt,
            self.policy.max_attempts
        );
        self.router.publish(RoutedEvent::ReconnectScheduled {
            server: request.server_name.clone(),
            attempt,
            max_attempts: self.policy.max_attempts,
            delay_secs: delay.as_secs(),
        });
        let _ = self.events.send(ReconnectEvent::Scheduled {
            server_name: request.server_name.clone(),
            attempt,
            delay,
        });

        let controller = Arc::clone(self);
        let handle = tokio::spawn(async move {
            sleep(delay).await;
            controller.fire(epoch, attempt, request).await;
        });
        self.state.arm(handle);
    }

    async fn fire(self: Arc<Self>, epoch: u64, attempt: u32, request: ConnectRequest) {
        if !self.state.claim(epoch) {
            debug!("Stale reconnection timer (epoch {}) ignored", epoch);
            return;
        }

        info!("Reconnection attempt {} to {}", attempt, request.server_name);
        let _ = self.events.send(ReconnectEvent::Attempting {
            server_name: request.server_name.clone(),
            attempt,
        });

        match self.manager.connect(request.clone()).await {
            Ok(_) => {}
            Err(ConnectionError::AlreadyConnected(current)) => {
                info!(
                    "Reconnection to {} abandoned, a session to {} already exists",
                    request.server_name, current
                );
                self.state.clear();
            }
            Err(e) => {
                warn!("Reconnection attempt {} to {} rejected: {}", attempt, request.server_name, e);
                let _ = self.events.send(ReconnectEvent::AttemptRejected {
                    server_name: request.server_name.clone(),
                    attempt,
                    error: e.to_string(),
                });
                self.on_involuntary_disconnect(request, e.to_string()).await;
            }
        }
    }

    /// Resume a session saved before the last shutdown once `grace` has passed.
    /// The grace timer is the pending reconnection until it fires.
    pub fn resume(self: &Arc<Self>, record: LastSessionRecord, grace: Duration) {
        info!(
            "Resuming session to {} as {} in {}s (had {} reconnect attempts)",
            record.server_name,
            record.username,
            grace.as_secs(),
            record.reconnect_attempts_at_save_time
        );

        let epoch = self.state.next_epoch();
        let controller = Arc::clone(self);
        let handle = tokio::spawn(async move {
            sleep(grace).await;
            controller.fire_resume(epoch, record).await;
        });
        self.state.arm(handle);
    }

    async fn fire_resume(self: Arc<Self>, epoch: u64, record: LastSessionRecord) {
        if !self.state.claim(epoch) {
            debug!("Stale resume timer (epoch {}) ignored", epoch);
            return;
        }

        let request = record.request();
        match self.manager.connect(request.clone()).await {
            Ok(_) => {}
            Err(ConnectionError::AlreadyConnected(_)) => {
                debug!("Session already active, skipping resume");
                self.state.abandon();
            }
            Err(ConnectionError::UnknownServer(name)) => {
                warn!("Cannot resume session: server {} no longer exists", name);
                self.state.abandon();
                self.session_store.clear().await;
            }
            Err(e) => {
                warn!("Resume of {} failed: {}", request.server_name, e);
                self.on_involuntary_disconnect(request, e.to_string()).await;
            }
        }
    }

    /// Detach from the manager and drop every timer this controller owns
    pub fn shutdown(&self) {
        self.manager.clear_loss_handler();
        self.state.clear();
    }
}
