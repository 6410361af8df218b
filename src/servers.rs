//! Server Registry
//!
//! Durable name → endpoint mapping. Every other component resolves server
//! names here; nothing in the connection core ever deletes an entry.

use std::collections::BTreeMap;
use std::path::Path;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{error, info};

use crate::config::JsonStore;

/// Registry file name inside the data directory
pub const SERVERS_FILE: &str = "servers.json";

/// A saved game server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerProfile {
    pub name: String,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub default_username: Option<String>,
}

impl ServerProfile {
    /// `host:port` for display
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

pub type ServerTable = BTreeMap<String, ServerProfile>;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Server name must not be empty")]
    EmptyName,

    #[error("Server host must not be empty")]
    EmptyHost,

    #[error("Port {0} is outside 1-65535")]
    InvalidPort(u32),

    #[error("Server not found: {0}")]
    NotFound(String),
}

impl serde::Serialize for RegistryError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

pub struct ServerRegistry {
    servers: RwLock<ServerTable>,
    store: JsonStore<ServerTable>,
    /// Serializes mutate-then-persist so snapshots hit disk in order
    mutation: Mutex<()>,
}

impl ServerRegistry {
    /// Open the registry stored in `dir`, starting empty if it can't be read
    pub async fn open(dir: &Path) -> Self {
        let store: JsonStore<ServerTable> = JsonStore::in_dir(dir, SERVERS_FILE);
        let servers = match store.load().await {
            Ok(servers) => {
                info!("Loaded {} saved server(s) from {:?}", servers.len(), store.path());
                servers
            }
            Err(e) => {
                error!("Failed to load server registry: {}", e);
                ServerTable::new()
            }
        };

        Self {
            servers: RwLock::new(servers),
            store,
            mutation: Mutex::new(()),
        }
    }

    pub fn get(&self, name: &str) -> Option<ServerProfile> {
        self.servers.read().get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.servers.read().contains_key(name)
    }

    /// All servers, ordered by name
    pub fn list(&self) -> Vec<ServerProfile> {
        self.servers.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.servers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.read().is_empty()
    }

    /// Save a server, replacing any existing profile with the same name
    pub async fn add(
        &self,
        name: &str,
        host: &str,
        port: u32,
        default_username: Option<String>,
    ) -> Result<ServerProfile, RegistryError> {
        let name = name.trim();
        let host = host.trim();
        if name.is_empty() {
            return Err(RegistryError::EmptyName);
        }
        if host.is_empty() {
            return Err(RegistryError::EmptyHost);
        }
        let port = u16::try_from(port)
            .ok()
            .filter(|p| *p != 0)
            .ok_or(RegistryError::InvalidPort(port))?;

        let profile = ServerProfile {
            name: name.to_string(),
            host: host.to_string(),
            port,
            default_username: default_username.filter(|u| !u.trim().is_empty()),
        };

        let _guard = self.mutation.lock().await;
        let snapshot = {
            let mut servers = self.servers.write();
            servers.insert(profile.name.clone(), profile.clone());
            servers.clone()
        };
        info!("Saved server {} as {}", profile.name, profile.address());
        self.persist(&snapshot).await;

        Ok(profile)
    }

    pub async fn remove(&self, name: &str) -> Result<ServerProfile, RegistryError> {
        let _guard = self.mutation.lock().await;
        let (removed, snapshot) = {
            let mut servers = self.servers.write();
            let removed = servers
                .remove(name)
                .ok_or_else(|| RegistryError::NotFound(name.to_string()))?;
            (removed, servers.clone())
        };
        info!("Removed server {}", name);
        self.persist(&snapshot).await;

        Ok(removed)
    }

    async fn persist(&self, snapshot: &ServerTable) {
        if let Err(e) = self.store.save(snapshot).await {
            error!("Failed to persist server registry: {}", e);
        }
    }
}
