//! Session Management Module
//!
//! The connection lifecycle core: the single managed session, its liveness
//! sampling, crash-recovery record and reconnection policy.

pub mod error;
pub mod events;
pub mod liveness;
pub mod manager;
pub mod reconnect;
pub mod store;
pub mod types;

pub use error::ConnectionError;
pub use events::{DisconnectReason, LifecycleEvent};
pub use liveness::{LatencyClass, LivenessConfig};
pub use manager::ConnectionManager;
pub use reconnect::{ReconnectEvent, ReconnectPolicy, ReconnectState, ReconnectionController};
pub use store::{SessionStore, LAST_SESSION_FILE};
pub use types::{
    format_elapsed, ConnectAccepted, ConnectRequest, ConnectionInfo, LastSessionRecord, Session,
    SessionState,
};
