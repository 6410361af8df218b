//! Scheduled Connections
//!
//! Durable, restart-safe delayed calls to the connection manager.

pub mod scheduler;
pub mod store;

pub use scheduler::{ConnectionScheduler, RecoveryReport, ScheduleError, ScheduledSummary};
pub use store::{ScheduleStore, ScheduledConnection, SCHEDULE_FILE};
