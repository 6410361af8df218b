//! Runtime wiring
//!
//! [`Tether`] builds every component over one data directory, performs
//! startup recovery (schedules first, then the last session after a grace
//! delay) and exposes the operations front ends call.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{error, info};

use crate::client::GameConnector;
use crate::config::TetherConfig;
use crate::router::{CategoryToggles, EventCategory, EventRouter, EventSink};
use crate::schedule::{
    ConnectionScheduler, RecoveryReport, ScheduleError, ScheduleStore, ScheduledSummary,
};
use crate::servers::{RegistryError, ServerProfile, ServerRegistry};
use crate::session::{
    ConnectAccepted, ConnectRequest, ConnectionError, ConnectionInfo, ConnectionManager,
    LifecycleEvent, ReconnectEvent, ReconnectionController, SessionState, SessionStore,
};

/// What startup recovery did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StartupReport {
    pub schedules: RecoveryReport,
    /// Server whose session will be resumed after the grace delay
    pub resuming: Option<String>,
}

/// Snapshot for the `status` command
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub state: SessionState,
    pub server_name: Option<String>,
    pub reconnect_attempts: u32,
    pub reconnect_pending: bool,
    pub scheduled: usize,
    pub saved_servers: usize,
}

pub struct Tether {
    config: TetherConfig,
    data_dir: PathBuf,
    registry: Arc<ServerRegistry>,
    router: Arc<EventRouter>,
    manager: Arc<ConnectionManager>,
    reconnector: Arc<ReconnectionController>,
    scheduler: Arc<ConnectionScheduler>,
    startup: StartupReport,
}

impl Tether {
    pub async fn start(
        config: TetherConfig,
        data_dir: &Path,
        connector: Arc<dyn GameConnector>,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        if let Err(e) = tokio::fs::create_dir_all(data_dir).await {
            error!("Failed to create data directory {:?}: {}", data_dir, e);
        }

        let registry = Arc::new(ServerRegistry::open(data_dir).await);
        let session_store = Arc::new(SessionStore::open(data_dir).await);
        let schedule_store = Arc::new(ScheduleStore::open(data_dir).await);

        let router = Arc::new(EventRouter::new(
            sink,
            CategoryToggles::with_disabled(config.disabled_categories.clone()),
        ));

        let manager = ConnectionManager::new(
            Arc::clone(&registry),
            Arc::clone(&session_store),
            connector,
            Arc::clone(&router),
            config.default_username.clone(),
            config.liveness.clone(),
        );

        let reconnector = ReconnectionController::new(
            Arc::clone(&manager),
            Arc::clone(&session_store),
            Arc::clone(&router),
            config.reconnect.clone(),
        );
        reconnector.attach();

        let scheduler = ConnectionScheduler::new(
            Arc::clone(&registry),
            Arc::clone(&manager),
            schedule_store,
            Arc::clone(&router),
        );

        let mut startup = StartupReport {
            schedules: scheduler.recover().await,
            resuming: None,
        };

        if let Some(record) = session_store.current() {
            startup.resuming = Some(record.server_name.clone());
            reconnector.resume(record, config.resume_grace());
        }

        info!(
            "Tether started ({} servers, {} scheduled)",
            registry.len(),
            scheduler.list().len()
        );

        Self {
            config,
            data_dir: data_dir.to_path_buf(),
            registry,
            router,
            manager,
            reconnector,
            scheduler,
            startup,
        }
    }

    pub fn config(&self) -> &TetherConfig {
        &self.config
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn startup_report(&self) -> &StartupReport {
        &self.startup
    }

    pub fn manager(&self) -> &Arc<ConnectionManager> {
        &self.manager
    }

    pub fn scheduler(&self) -> &Arc<ConnectionScheduler> {
        &self.scheduler
    }

    pub fn reconnector(&self) -> &Arc<ReconnectionController> {
        &self.reconnector
    }

    pub fn subscribe_lifecycle(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.manager.subscribe()
    }

    pub fn subscribe_reconnect(&self) -> broadcast::Receiver<ReconnectEvent> {
        self.reconnector.subscribe()
    }

    // ---- connection ----

    pub async fn connect(
        &self,
        server_name: &str,
        username: Option<String>,
        duration_minutes: Option<u32>,
    ) -> Result<ConnectAccepted, ConnectionError> {
        self.manager
            .connect(ConnectRequest {
                server_name: server_name.to_string(),
                username,
                duration_minutes,
            })
            .await
    }

    pub async fn disconnect(&self) -> Result<String, ConnectionError> {
        self.manager.disconnect().await
    }

    pub async fn set_disconnect_timer(&self, minutes: u32) -> Result<(), ConnectionError> {
        self.manager.set_disconnect_timer(minutes).await
    }

    pub async fn connection_info(&self) -> Result<ConnectionInfo, ConnectionError> {
        self.manager.connection_info().await
    }

    pub async fn ping(&self) -> Result<Option<u64>, ConnectionError> {
        self.manager.ping().await
    }

    pub async fn is_connected(&self) -> bool {
        self.manager.is_connected().await
    }

    pub async fn current_server(&self) -> Option<String> {
        self.manager.current_server().await
    }

    pub fn cancel_reconnection(&self) -> bool {
        self.reconnector.cancel()
    }

    // ---- scheduling ----

    pub async fn schedule_connection(
        &self,
        server_name: &str,
        delay_minutes: i64,
        username: Option<String>,
        duration_minutes: Option<u32>,
    ) -> Result<String, ScheduleError> {
        self.scheduler
            .schedule(server_name, delay_minutes, username, duration_minutes)
            .await
    }

    pub async fn cancel_scheduled_connection(&self, id: &str) -> bool {
        self.scheduler.cancel(id).await
    }

    pub fn list_scheduled_connections(&self) -> Vec<ScheduledSummary> {
        self.scheduler.list()
    }

    // ---- servers ----

    pub async fn add_server(
        &self,
        name: &str,
        host: &str,
        port: u32,
        default_username: Option<String>,
    ) -> Result<ServerProfile, RegistryError> {
        self.registry.add(name, host, port, default_username).await
    }

    pub async fn remove_server(&self, name: &str) -> Result<ServerProfile, RegistryError> {
        self.registry.remove(name).await
    }

    pub fn list_servers(&self) -> Vec<ServerProfile> {
        self.registry.list()
    }

    // ---- misc ----

    pub fn set_event_enabled(&self, category: EventCategory, enabled: bool) {
        self.router.set_enabled(category, enabled);
    }

    pub async fn status(&self) -> StatusReport {
        StatusReport {
            state: self.manager.state().await,
            server_name: self.manager.current_server().await,
            reconnect_attempts: self.reconnector.attempts(),
            reconnect_pending: self.reconnector.is_pending(),
            scheduled: self.scheduler.list().len(),
            saved_servers: self.registry.len(),
        }
    }

    /// Stop every timer and close the session, keeping everything needed to
    /// resume on the next start
    pub async fn shutdown(&self) {
        info!("Shutting down");
        self.scheduler.shutdown();
        self.reconnector.shutdown();
        self.manager.shutdown().await;
    }
}
