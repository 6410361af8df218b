//! Runtime settings
//!
//! Read once at startup from `<data_dir>/config.json`. Every field has a
//! default so a partial (or missing) file is fine.

use std::collections::BTreeSet;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::router::EventCategory;
use crate::session::{LivenessConfig, ReconnectPolicy};

/// Username used when neither the request nor the server profile names one
pub const DEFAULT_USERNAME: &str = "AFKBot";

/// Settings file name inside the data directory
pub const CONFIG_FILE: &str = "config.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TetherConfig {
    #[serde(default = "default_username")]
    pub default_username: String,

    #[serde(default)]
    pub reconnect: ReconnectPolicy,

    #[serde(default)]
    pub liveness: LivenessConfig,

    /// Delay before resuming the last session after a restart (seconds)
    #[serde(default = "default_resume_grace_secs")]
    pub resume_grace_secs: u64,

    /// TCP connect timeout for the bundled transport (seconds)
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    #[serde(default = "default_true")]
    pub log_to_file: bool,

    /// Event categories the router drops instead of delivering
    #[serde(default)]
    pub disabled_categories: BTreeSet<EventCategory>,
}

fn default_username() -> String {
    DEFAULT_USERNAME.to_string()
}

fn default_resume_grace_secs() -> u64 {
    5
}

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_true() -> bool {
    true
}

impl Default for TetherConfig {
    fn default() -> Self {
        Self {
            default_username: default_username(),
            reconnect: ReconnectPolicy::default(),
            liveness: LivenessConfig::default(),
            resume_grace_secs: default_resume_grace_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
            log_to_file: true,
            disabled_categories: BTreeSet::new(),
        }
    }
}

impl TetherConfig {
    /// Load settings from `dir/config.json`
    ///
    /// Runs before logging is initialised, so problems are returned as a
    /// warning string for the caller to log once the subscriber exists.
    pub fn load_from_dir(dir: &Path) -> (Self, Option<String>) {
        let path = dir.join(CONFIG_FILE);
        match std::fs::read_to_string(&path) {
            Ok(contents) => match serde_json::from_str::<Self>(&contents) {
                Ok(config) => (config, None),
                Err(e) => (
                    Self::default(),
                    Some(format!("Ignoring malformed {:?}: {}", path, e)),
                ),
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => (Self::default(), None),
            Err(e) => (
                Self::default(),
                Some(format!("Failed to read {:?}: {}", path, e)),
            ),
        }
    }

    pub fn resume_grace(&self) -> Duration {
        Duration::from_secs(self.resume_grace_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}
