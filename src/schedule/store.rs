//! Scheduled connection persistence

use std::collections::BTreeMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{error, info};

use crate::config::JsonStore;
use crate::session::ConnectRequest;

pub const SCHEDULE_FILE: &str = "scheduled.json";

/// A one-shot connection request waiting for its fire time
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledConnection {
    pub id: String,
    pub server_name: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub planned_duration_minutes: Option<u32>,
    pub fire_at: DateTime<Utc>,
}

impl ScheduledConnection {
    /// Time left until firing, zero once due
    pub fn remaining(&self, now: DateTime<Utc>) -> chrono::Duration {
        (self.fire_at - now).max(chrono::Duration::zero())
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.fire_at <= now
    }

    /// Whole minutes left, rounded up
    pub fn minutes_remaining(&self, now: DateTime<Utc>) -> i64 {
        let secs = self.remaining(now).num_seconds();
        (secs + 59) / 60
    }

    pub fn request(&self) -> ConnectRequest {
        ConnectRequest {
            server_name: self.server_name.clone(),
            username: self.username.clone(),
            duration_minutes: self.planned_duration_minutes,
        }
    }
}

pub type ScheduleTable = BTreeMap<String, ScheduledConnection>;

pub struct ScheduleStore {
    entries: RwLock<ScheduleTable>,
    store: JsonStore<ScheduleTable>,
    mutation: Mutex<()>,
}

impl ScheduleStore {
    pub async fn open(dir: &Path) -> Self {
        let store: JsonStore<ScheduleTable> = JsonStore::in_dir(dir, SCHEDULE_FILE);
        let entries = match store.load().await {
            Ok(entries) => {
                if !entries.is_empty() {
                    info!("Loaded {} scheduled connection(s)", entries.len());
                }
                entries
            }
            Err(e) => {
                error!("Failed to load scheduled connections: {}", e);
                ScheduleTable::new()
            }
        };

        Self {
            entries: RwLock::new(entries),
            store,
            mutation: Mutex::new(()),
        }
    }

    pub fn get(&self, id: &str) -> Option<ScheduledConnection> {
        self.entries.read().get(id).cloned()
    }

    /// All entries, soonest first
    pub fn list(&self) -> Vec<ScheduledConnection> {
        let mut entries: Vec<_> = self.entries.read().values().cloned().collect();
        entries.sort_by(|a, b| a.fire_at.cmp(&b.fire_at).then_with(|| a.id.cmp(&b.id)));
        entries
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub async fn insert(&self, entry: ScheduledConnection) {
        let _guard = self.mutation.lock().await;
        let snapshot = {
            let mut entries = self.entries.write();
            entries.insert(entry.id.clone(), entry);
            entries.clone()
        };
        self.persist(&snapshot).await;
    }

    pub async fn remove(&self, id: &str) -> Option<ScheduledConnection> {
        let _guard = self.mutation.lock().await;
        let (removed, snapshot) = {
            let mut entries = self.entries.write();
            let removed = entries.remove(id)?;
            (removed, entries.clone())
        };
        self.persist(&snapshot).await;
        Some(removed)
    }

    async fn persist(&self, snapshot: &ScheduleTable) {
        if let Err(e) = self.store.save(snapshot).await {
            error!("Failed to persist scheduled connections: {}", e);
        }
    }
}
