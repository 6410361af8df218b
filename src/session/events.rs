//! Lifecycle events broadcast by the connection manager

use super::types::ConnectRequest;

/// Why a voluntary teardown happened
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Operator asked for it
    Operator,
    /// Auto-disconnect timer expired
    DurationElapsed,
    /// Process shutting down
    Shutdown,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LifecycleEvent {
    Connecting {
        generation: u64,
        server_name: String,
    },
    Connected {
        generation: u64,
        server_name: String,
        username: String,
    },
    /// Loss not requested by anyone; the reconnection controller reacts to this
    InvoluntaryDisconnect {
        generation: u64,
        request: ConnectRequest,
        reason: String,
    },
    Disconnected {
        generation: u64,
        server_name: String,
        reason: DisconnectReason,
    },
}

impl LifecycleEvent {
    pub fn generation(&self) -> u64 {
        match self {
            LifecycleEvent::Connecting { generation, .. }
            | LifecycleEvent::Connected { generation, .. }
            | LifecycleEvent::InvoluntaryDisconnect { generation, .. }
            | LifecycleEvent::Disconnected { generation, .. } => *generation,
        }
    }
}
