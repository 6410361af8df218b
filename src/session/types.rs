//! Session data types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::servers::ServerProfile;

/// Lifecycle state of the single managed session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// No client exists
    #[default]
    Idle,
    /// Client constructed, waiting for world entry
    Connecting,
    /// In the world
    Connected,
    /// Voluntary teardown in progress
    Ending,
}

impl SessionState {
    /// Whether a client is live or pending
    pub fn is_active(&self) -> bool {
        !matches!(self, SessionState::Idle)
    }
}

/// Parameters of a connect call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectRequest {
    pub server_name: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub duration_minutes: Option<u32>,
}

impl ConnectRequest {
    pub fn new(server_name: impl Into<String>) -> Self {
        Self {
            server_name: server_name.into(),
            username: None,
            duration_minutes: None,
        }
    }

    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    pub fn with_duration(mut self, minutes: u32) -> Self {
        self.duration_minutes = Some(minutes);
        self
    }
}

/// Synchronous acceptance of a connect call
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectAccepted {
    pub generation: u64,
    pub server_name: String,
    pub address: String,
    pub username: String,
}

/// The live session, owned by the connection manager
#[derive(Debug, Clone)]
pub struct Session {
    /// Identity captured by every timer armed for this session
    pub generation: u64,
    pub state: SessionState,
    pub server: ServerProfile,
    pub effective_username: String,
    pub planned_duration_minutes: Option<u32>,
    pub started_at: Option<DateTime<Utc>>,
    pub intentional: bool,
}

impl Session {
    /// The request that would recreate this session
    pub fn request(&self) -> ConnectRequest {
        ConnectRequest {
            server_name: self.server.name.clone(),
            username: Some(self.effective_username.clone()),
            duration_minutes: self.planned_duration_minutes,
        }
    }
}

/// Snapshot used for crash recovery
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LastSessionRecord {
    pub server_name: String,
    pub username: String,
    pub planned_duration_minutes: Option<u32>,
    pub saved_at: DateTime<Utc>,
    pub reconnect_attempts_at_save_time: u32,
}

impl LastSessionRecord {
    pub fn request(&self) -> ConnectRequest {
        ConnectRequest {
            server_name: self.server_name.clone(),
            username: Some(self.username.clone()),
            duration_minutes: self.planned_duration_minutes,
        }
    }
}

/// Details of the live session for display
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionInfo {
    pub server_name: String,
    pub address: String,
    pub username: String,
    pub connected_since: DateTime<Utc>,
    pub duration_elapsed_secs: u64,
    pub planned_duration_minutes: Option<u32>,
}

impl ConnectionInfo {
    /// Elapsed time as `1h 2m 3s`, `2m 3s` or `3s`
    pub fn elapsed_display(&self) -> String {
        format_elapsed(self.duration_elapsed_secs)
    }
}

pub fn format_elapsed(total_secs: u64) -> String {
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let seconds = total_secs % 60;

    if hours > 0 {
        format!("{}h {}m {}s", hours, minutes, seconds)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_elapsed() {
        assert_eq!(format_elapsed(0), "0s");
        assert_eq!(format_elapsed(123), "2m 3s");
        assert_eq!(format_elapsed(3723), "1h 2m 3s");
        assert_eq!(format_elapsed(7200), "2h 0m 0s");
    }

    #[test]
    fn test_record_serializes_camel_case() {
        let record = LastSessionRecord {
            server_name: "alpha".to_string(),
            username: "Steve".to_string(),
            planned_duration_minutes: Some(60),
            saved_at: Utc::now(),
            reconnect_attempts_at_save_time: 2,
        };

        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["serverName"], "alpha");
        assert_eq!(json["plannedDurationMinutes"], 60);
        assert_eq!(json["reconnectAttemptsAtSaveTime"], 2);

        let request = record.request();
        assert_eq!(request.username.as_deref(), Some("Steve"));
        assert_eq!(request.duration_minutes, Some(60));
    }

    #[test]
    fn test_request_builder() {
        let request = ConnectRequest::new("alpha").with_username("Alex").with_duration(15);
        assert_eq!(request.server_name, "alpha");
        assert_eq!(request.username.as_deref(), Some("Alex"));
        assert_eq!(request.duration_minutes, Some(15));
    }
}
