//! Last-session persistence
//!
//! One optional [`LastSessionRecord`] in `last_session.json`. Written on every
//! spawn, deleted on intentional disconnect or give-up. The cached copy is
//! authoritative for the running process; disk failures only cost recovery.

use std::path::Path;

use parking_lot::RwLock;
use tokio::sync::Mutex;
use tracing::{debug, error, info};

use super::types::LastSessionRecord;
use crate::config::JsonStore;

pub const LAST_SESSION_FILE: &str = "last_session.json";

pub struct SessionStore {
    current: RwLock<Option<LastSessionRecord>>,
    store: JsonStore<Option<LastSessionRecord>>,
    mutation: Mutex<()>,
}

impl SessionStore {
    pub async fn open(dir: &Path) -> Self {
        let store: JsonStore<Option<LastSessionRecord>> = JsonStore::in_dir(dir, LAST_SESSION_FILE);
        let current = match store.load().await {
            Ok(record) => {
                if let Some(record) = &record {
                    info!(
                        "Found last session record for {} (saved {})",
                        record.server_name, record.saved_at
                    );
                }
                record
            }
            Err(e) => {
                error!("Failed to load last session record: {}", e);
                None
            }
        };

        Self {
            current: RwLock::new(current),
            store,
            mutation: Mutex::new(()),
        }
    }

    pub fn current(&self) -> Option<LastSessionRecord> {
        self.current.read().clone()
    }

    pub async fn save(&self, record: LastSessionRecord) {
        let _guard = self.mutation.lock().await;
        let snapshot = Some(record);
        *self.current.write() = snapshot.clone();
        if let Err(e) = self.store.save(&snapshot).await {
            error!("Failed to persist last session record: {}", e);
        }
    }

    pub async fn clear(&self) {
        let _guard = self.mutation.lock().await;
        let had_record = self.current.write().take().is_some();
        if let Err(e) = self.store.remove().await {
            error!("Failed to delete last session record: {}", e);
        } else if had_record {
            debug!("Last session record cleared");
        }
    }
}
