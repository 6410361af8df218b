//! Connection Scheduler
//!
//! Turns "connect to X in N minutes" into a persisted entry plus a timer
//! task keyed by the entry id. Entries are fire-once: whatever the connect
//! outcome, the entry and its timer are gone afterwards.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use super::store::{ScheduleStore, ScheduledConnection};
use crate::router::{EventRouter, RoutedEvent};
use crate::servers::ServerRegistry;
use crate::session::{ConnectionError, ConnectionManager};

/// Longest accepted delay (one year)
const MAX_DELAY_MINUTES: i64 = 60 * 24 * 365;

#[derive(Error, Debug)]
pub enum ScheduleError {
    #[error("Unknown server: {0}")]
    UnknownServer(String),

    #[error("Invalid delay: {0} minutes")]
    InvalidDelay(i64),

    #[error("Duration must be at least one minute")]
    InvalidDuration,

    #[error("Connect failed: {0}")]
    Connect(#[from] ConnectionError),
}

impl serde::Serialize for ScheduleError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

/// One line of the schedule listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledSummary {
    pub id: String,
    pub server_name: String,
    pub minutes_remaining: i64,
    pub fire_at: DateTime<Utc>,
}

/// Outcome of startup recovery
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub rearmed: usize,
    pub dropped: usize,
}

pub struct ConnectionScheduler {
    registry: Arc<ServerRegistry>,
    manager: Arc<ConnectionManager>,
    store: Arc<ScheduleStore>,
    router: Arc<EventRouter>,
    timers: DashMap<String, JoinHandle<()>>,
    last_id: AtomicI64,
}

impl ConnectionScheduler {
    pub fn new(
        registry: Arc<ServerRegistry>,
        manager: Arc<ConnectionManager>,
        store: Arc<ScheduleStore>,
        router: Arc<EventRouter>,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            manager,
            store,
            router,
            timers: DashMap::new(),
            last_id: AtomicI64::new(0),
        })
    }

    /// Millisecond timestamp, bumped when two ids land in the same millisecond
    fn next_id(&self) -> String {
        let now = Utc::now().timestamp_millis();
        let mut last = self.last_id.load(Ordering::SeqCst);
        loop {
            let candidate = now.max(last + 1);
            match self
                .last_id
                .compare_exchange(last, candidate, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => return candidate.to_string(),
                Err(actual) => last = actual,
            }
        }
    }

    /// Persist and arm a future connection. Returns the entry id.
    pub async fn schedule(
        self: &Arc<Self>,
        server_name: &str,
        delay_minutes: i64,
        username: Option<String>,
        duration_minutes: Option<u32>,
    ) -> Result<String, ScheduleError> {
        if !self.registry.contains(server_name) {
            return Err(ScheduleError::UnknownServer(server_name.to_string()));
        }
        if delay_minutes <= 0 || delay_minutes > MAX_DELAY_MINUTES {
            return Err(ScheduleError::InvalidDelay(delay_minutes));
        }
        if duration_minutes == Some(0) {
            return Err(ScheduleError::InvalidDuration);
        }

        let entry = ScheduledConnection {
            id: self.next_id(),
            server_name: server_name.to_string(),
            username: username.filter(|u| !u.trim().is_empty()),
            planned_duration_minutes: duration_minutes,
            fire_at: Utc::now() + chrono::Duration::minutes(delay_minutes),
        };
        let id = entry.id.clone();

        self.store.insert(entry).await;
        self.arm(id.clone(), Duration::from_secs(delay_minutes as u64 * 60));

        info!(
            "Scheduled connection {} to {} in {} minutes",
            id, server_name, delay_minutes
        );
        Ok(id)
    }

    fn arm(self: &Arc<Self>, id: String, delay: Duration) {
        let scheduler = Arc::clone(self);
        let timer_id = id.clone();
        let handle = tokio::spawn(async move {
            sleep(delay).await;
            scheduler.fire(&timer_id).await;
        });

        if let Some(old_handle) = self.timers.insert(id, handle) {
            old_handle.abort();
        }
    }

    async fn fire(&self, id: &str) {
        // Our own handle; dropping it detaches
        self.timers.remove(id);

        let Some(entry) = self.store.get(id) else {
            debug!("Scheduled connection {} no longer exists", id);
            return;
        };

        let outcome = self.connect_scheduled(&entry).await;
        self.store.remove(id).await;

        match outcome {
            Ok(()) => {
                info!("Scheduled connection {} to {} started", id, entry.server_name);
                self.router.publish(RoutedEvent::ScheduledFired {
                    id: id.to_string(),
                    server: entry.server_name,
                });
            }
            Err(e) => {
                self.router.publish(RoutedEvent::ScheduledFailed {
                    id: id.to_string(),
                    server: entry.server_name,
                    reason: e.to_string(),
                });
            }
        }
    }

    async fn connect_scheduled(&self, entry: &ScheduledConnection) -> Result<(), ScheduleError> {
        if !self.registry.contains(&entry.server_name) {
            error!(
                "Scheduled connection {} failed: server {} no longer exists",
                entry.id, entry.server_name
            );
            return Err(ScheduleError::UnknownServer(entry.server_name.clone()));
        }

        self.manager.connect(entry.request()).await.map_err(|e| {
            warn!("Scheduled connection {} failed: {}", entry.id, e);
            ScheduleError::from(e)
        })?;
        Ok(())
    }

    /// Remove an entry and its timer. False if the id is unknown.
    pub async fn cancel(&self, id: &str) -> bool {
        let had_timer = match self.timers.remove(id) {
            Some((_, handle)) => {
                handle.abort();
                true
            }
            None => false,
        };
        let had_entry = self.store.remove(id).await.is_some();

        if had_timer || had_entry {
            info!("Scheduled connection {} cancelled", id);
            true
        } else {
            debug!("Scheduled connection {} not found", id);
            false
        }
    }

    /// Pending entries, soonest first
    pub fn list(&self) -> Vec<ScheduledSummary> {
        let now = Utc::now();
        self.store
            .list()
            .into_iter()
            .map(|entry| ScheduledSummary {
                minutes_remaining: entry.minutes_remaining(now),
                id: entry.id,
                server_name: entry.server_name,
                fire_at: entry.fire_at,
            })
            .collect()
    }

    /// Number of armed timers
    pub fn armed(&self) -> usize {
        self.timers.len()
    }

    /// Re-arm persisted entries after a restart. Entries whose time passed
    /// while the process was down are dropped, not fired.
    pub async fn recover(self: &Arc<Self>) -> RecoveryReport {
        let now = Utc::now();
        let mut report = RecoveryReport::default();

        for entry in self.store.list() {
            if entry.is_due(now) {
                warn!(
                    "Dropping missed scheduled connection {} to {} (was due {})",
                    entry.id, entry.server_name, entry.fire_at
                );
                self.store.remove(&entry.id).await;
                report.dropped += 1;
                continue;
            }

            let remaining = entry
                .remaining(now)
                .to_std()
                .unwrap_or(Duration::ZERO);
            debug!(
                "Re-arming scheduled connection {} in {}s",
                entry.id,
                remaining.as_secs()
            );
            self.arm(entry.id, remaining);
            report.rearmed += 1;
        }

        if report.rearmed > 0 || report.dropped > 0 {
            info!(
                "Schedule recovery: {} re-armed, {} dropped",
                report.rearmed, report.dropped
            );
        }
        report
    }

    /// Stop every timer. Persisted entries stay for the next start.
    pub fn shutdown(&self) {
        let ids: Vec<String> = self.timers.iter().map(|entry| entry.key().clone()).collect();
        for id in ids {
            if let Some((_, handle)) = self.timers.remove(&id) {
                handle.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ScriptedConnector;
    use crate::router::{CategoryToggles, ChannelSink};
    use crate::session::{LivenessConfig, SessionStore};
    use tempfile::{tempdir, TempDir};
    use tokio::sync::mpsc;

    struct Harness {
        temp: TempDir,
        registry: Arc<ServerRegistry>,
        manager: Arc<ConnectionManager>,
        connector: Arc<ScriptedConnector>,
        router: Arc<EventRouter>,
        routed: mpsc::UnboundedReceiver<RoutedEvent>,
    }

    async fn harness() -> Harness {
        let temp = tempdir().unwrap();
        let registry = Arc::new(ServerRegistry::open(temp.path()).await);
        registry.add("alpha", "127.0.0.1", 25565, None).await.unwrap();

        let connector = Arc::new(ScriptedConnector::new());
        let (sink, routed) = ChannelSink::new();
        let router = Arc::new(EventRouter::new(Arc::new(sink), CategoryToggles::default()));
        let manager = ConnectionManager::new(
            Arc::clone(&registry),
            Arc::new(SessionStore::open(temp.path()).await),
            connector.clone(),
            Arc::clone(&router),
            "AFKBot".to_string(),
            LivenessConfig::default(),
        );

        Harness {
            temp,
            registry,
            manager,
            connector,
            router,
            routed,
        }
    }

    async fn scheduler(h: &Harness) -> Arc<ConnectionScheduler> {
        ConnectionScheduler::new(
            Arc::clone(&h.registry),
            Arc::clone(&h.manager),
            Arc::new(ScheduleStore::open(h.temp.path()).await),
            Arc::clone(&h.router),
        )
    }

    async fn next_schedule_event(rx: &mut mpsc::UnboundedReceiver<RoutedEvent>) -> RoutedEvent {
        loop {
            let event = rx.recv().await.unwrap();
            if matches!(
                event,
                RoutedEvent::ScheduledFired { .. } | RoutedEvent::ScheduledFailed { .. }
            ) {
                return event;
            }
        }
    }

    #[tokio::test]
    async fn test_validation() {
        let h = harness().await;
        let scheduler = scheduler(&h).await;

        assert!(matches!(
            scheduler.schedule("nowhere", 5, None, None).await,
            Err(ScheduleError::UnknownServer(_))
        ));
        assert!(matches!(
            scheduler.schedule("alpha", 0, None, None).await,
            Err(ScheduleError::InvalidDelay(0))
        ));
        assert!(matches!(
            scheduler.schedule("alpha", -3, None, None).await,
            Err(ScheduleError::InvalidDelay(-3))
        ));
        assert!(matches!(
            scheduler.schedule("alpha", 5, None, Some(0)).await,
            Err(ScheduleError::InvalidDuration)
        ));
        assert!(scheduler.list().is_empty());
        assert_eq!(scheduler.armed(), 0);
    }

    #[tokio::test]
    async fn test_ids_are_unique_and_listed_in_order() {
        let h = harness().await;
        let scheduler = scheduler(&h).await;

        let late = scheduler.schedule("alpha", 30, None, None).await.unwrap();
        let soon = scheduler.schedule("alpha", 5, None, None).await.unwrap();
        assert_ne!(late, soon);

        let listed = scheduler.list();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].id, soon);
        assert_eq!(listed[0].minutes_remaining, 5);
        assert_eq!(listed[1].id, late);
        assert_eq!(scheduler.armed(), 2);
    }

    #[tokio::test]
    async fn test_cancel() {
        let h = harness().await;
        let scheduler = scheduler(&h).await;
        let id = scheduler.schedule("alpha", 5, None, None).await.unwrap();

        assert!(scheduler.cancel(&id).await);
        assert!(!scheduler.cancel(&id).await);
        assert!(!scheduler.cancel("12345").await);
        assert!(scheduler.list().is_empty());
        assert_eq!(scheduler.armed(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fire_connects_once_and_removes_entry() {
        let mut h = harness().await;
        let scheduler = scheduler(&h).await;
        scheduler
            .schedule("alpha", 5, Some("Alex".to_string()), Some(20))
            .await
            .unwrap();

        assert!(matches!(
            next_schedule_event(&mut h.routed).await,
            RoutedEvent::ScheduledFired { .. }
        ));
        assert_eq!(h.connector.open_count(), 1);
        assert_eq!(h.connector.last_link().unwrap().endpoint().username, "Alex");
        assert!(scheduler.list().is_empty());
        assert_eq!(scheduler.armed(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fire_while_connected_is_reported() {
        let mut h = harness().await;
        let scheduler = scheduler(&h).await;
        h.manager
            .connect(crate::session::ConnectRequest::new("alpha"))
            .await
            .unwrap();
        scheduler.schedule("alpha", 1, None, None).await.unwrap();

        match next_schedule_event(&mut h.routed).await {
            RoutedEvent::ScheduledFailed { reason, .. } => {
                assert!(reason.contains("Already connected"))
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(h.connector.open_count(), 1);
        assert!(scheduler.list().is_empty());
    }

    #[tokio::test]
    async fn test_recover_drops_past_entries() {
        let h = harness().await;
        let store = Arc::new(ScheduleStore::open(h.temp.path()).await);
        store
            .insert(ScheduledConnection {
                id: "1".to_string(),
                server_name: "alpha".to_string(),
                username: None,
                planned_duration_minutes: None,
                fire_at: Utc::now() - chrono::Duration::minutes(10),
            })
            .await;
        store
            .insert(ScheduledConnection {
                id: "2".to_string(),
                server_name: "alpha".to_string(),
                username: None,
                planned_duration_minutes: None,
                fire_at: Utc::now() + chrono::Duration::minutes(10),
            })
            .await;

        let scheduler = ConnectionScheduler::new(
            Arc::clone(&h.registry),
            Arc::clone(&h.manager),
            Arc::clone(&store),
            Arc::clone(&h.router),
        );
        let report = scheduler.recover().await;

        assert_eq!(report, RecoveryReport { rearmed: 1, dropped: 1 });
        assert!(store.get("1").is_none());
        assert_eq!(scheduler.armed(), 1);
        assert!(ScheduleStore::open(h.temp.path()).await.get("1").is_none());
        assert_eq!(h.connector.open_count(), 0);
    }
}
