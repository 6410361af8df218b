//! End-to-end lifecycle scenarios against the scripted connector

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tempfile::tempdir;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{sleep, Instant};

use tether::client::{ClientEvent, ScriptedConnector};
use tether::config::TetherConfig;
use tether::router::{ChannelSink, RoutedEvent};
use tether::schedule::{ScheduleStore, ScheduledConnection};
use tether::session::{ConnectionError, LifecycleEvent, ReconnectEvent, LAST_SESSION_FILE};
use tether::Tether;

struct Running {
    tether: Tether,
    connector: Arc<ScriptedConnector>,
    routed: mpsc::UnboundedReceiver<RoutedEvent>,
}

async fn start(dir: &Path) -> Running {
    let connector = Arc::new(ScriptedConnector::new());
    let (sink, routed) = ChannelSink::new();
    let tether = Tether::start(
        TetherConfig::default(),
        dir,
        connector.clone(),
        Arc::new(sink),
    )
    .await;
    Running {
        tether,
        connector,
        routed,
    }
}

async fn start_with_alpha(dir: &Path) -> Running {
    let running = start(dir).await;
    running
        .tether
        .add_server("alpha", "127.0.0.1", 25565, None)
        .await
        .unwrap();
    running
        .tether
        .add_server("beta", "127.0.0.2", 25565, None)
        .await
        .unwrap();
    running
}

async fn wait_connected(events: &mut broadcast::Receiver<LifecycleEvent>) {
    loop {
        if let LifecycleEvent::Connected { .. } = events.recv().await.unwrap() {
            return;
        }
    }
}

/// Next backoff decision, skipping attempt notices
async fn next_decision(events: &mut broadcast::Receiver<ReconnectEvent>) -> ReconnectEvent {
    loop {
        match events.recv().await.unwrap() {
            ReconnectEvent::Attempting { .. } | ReconnectEvent::AttemptRejected { .. } => {}
            other => return other,
        }
    }
}

async fn connect_live(running: &Running, server: &str, username: Option<&str>, minutes: Option<u32>) {
    let mut lifecycle = running.tether.subscribe_lifecycle();
    let opened = running.connector.open_count();
    running
        .tether
        .connect(server, username.map(str::to_string), minutes)
        .await
        .unwrap();
    running.connector.wait_for_opens(opened + 1).await.spawn().await;
    wait_connected(&mut lifecycle).await;
}

#[tokio::test(start_paused = true)]
async fn second_connect_is_rejected_without_side_effects() {
    let temp = tempdir().unwrap();
    let running = start_with_alpha(temp.path()).await;
    connect_live(&running, "alpha", None, None).await;

    let result = running.tether.connect("beta", None, None).await;
    assert!(matches!(result, Err(ConnectionError::AlreadyConnected(name)) if name == "alpha"));
    assert_eq!(running.connector.open_count(), 1);
    assert!(running.tether.is_connected().await);
    assert_eq!(running.tether.current_server().await.as_deref(), Some("alpha"));
}

#[tokio::test(start_paused = true)]
async fn backoff_sequence_then_give_up() {
    let temp = tempdir().unwrap();
    let running = start_with_alpha(temp.path()).await;
    let mut decisions = running.tether.subscribe_reconnect();

    connect_live(&running, "alpha", None, None).await;
    running.connector.link(0).unwrap().end("connection reset").await;

    for (index, expected_secs) in [30u64, 60, 90, 120, 120].into_iter().enumerate() {
        let attempt = index as u32 + 1;
        match next_decision(&mut decisions).await {
            ReconnectEvent::Scheduled {
                attempt: scheduled,
                delay,
                ..
            } => {
                assert_eq!(scheduled, attempt);
                assert_eq!(delay, Duration::from_secs(expected_secs));
            }
            other => panic!("expected a scheduled retry, got {:?}", other),
        }

        let armed_at = Instant::now();
        let link = running.connector.wait_for_opens(index + 2).await;
        let waited = armed_at.elapsed();
        assert!(waited >= Duration::from_secs(expected_secs));
        assert!(waited < Duration::from_secs(expected_secs + 1));

        // The retry never reaches the world
        link.end("connection refused").await;
    }

    assert_eq!(
        next_decision(&mut decisions).await,
        ReconnectEvent::GaveUp {
            server_name: "alpha".to_string(),
            attempts: 5,
        }
    );
    assert!(!running.tether.reconnector().is_pending());
    assert_eq!(running.tether.reconnector().attempts(), 0);
    assert!(!temp.path().join(LAST_SESSION_FILE).exists());

    sleep(Duration::from_secs(600)).await;
    assert_eq!(running.connector.open_count(), 6);
    assert!(!running.tether.is_connected().await);
}

#[tokio::test(start_paused = true)]
async fn live_loss_reconnects_once_after_thirty_seconds() {
    let temp = tempdir().unwrap();
    let running = start_with_alpha(temp.path()).await;
    let mut decisions = running.tether.subscribe_reconnect();

    connect_live(&running, "alpha", Some("Alex"), Some(60)).await;
    running
        .connector
        .link(0)
        .unwrap()
        .emit(ClientEvent::Kicked {
            reason: "timed out".to_string(),
        })
        .await;

    assert!(matches!(
        next_decision(&mut decisions).await,
        ReconnectEvent::Scheduled { attempt: 1, .. }
    ));
    let lost_at = Instant::now();

    let link = running.connector.wait_for_opens(2).await;
    assert!(lost_at.elapsed() >= Duration::from_secs(30));
    assert_eq!(link.endpoint().username, "Alex");

    sleep(Duration::from_secs(300)).await;
    assert_eq!(running.connector.open_count(), 2);

    // Spawning the retry resets the budget and keeps the planned duration
    let mut lifecycle = running.tether.subscribe_lifecycle();
    link.spawn().await;
    wait_connected(&mut lifecycle).await;
    assert_eq!(running.tether.reconnector().attempts(), 0);
    let info = running.tether.connection_info().await.unwrap();
    assert_eq!(info.planned_duration_minutes, Some(60));
}

#[tokio::test(start_paused = true)]
async fn cancel_reconnection_stops_pending_retry() {
    let temp = tempdir().unwrap();
    let running = start_with_alpha(temp.path()).await;
    let mut decisions = running.tether.subscribe_reconnect();

    connect_live(&running, "alpha", None, None).await;
    running.connector.link(0).unwrap().end("lost").await;
    assert!(matches!(
        next_decision(&mut decisions).await,
        ReconnectEvent::Scheduled { .. }
    ));

    assert!(running.tether.cancel_reconnection());
    sleep(Duration::from_secs(300)).await;
    assert_eq!(running.connector.open_count(), 1);

    // Nothing pending: a no-op
    assert!(!running.tether.cancel_reconnection());
}

#[tokio::test(start_paused = true)]
async fn missed_schedule_is_dropped_at_startup() {
    let temp = tempdir().unwrap();
    {
        let store = ScheduleStore::open(temp.path()).await;
        store
            .insert(ScheduledConnection {
                id: "1700000000000".to_string(),
                server_name: "alpha".to_string(),
                username: None,
                planned_duration_minutes: None,
                fire_at: Utc::now() - chrono::Duration::minutes(3),
            })
            .await;
    }

    let running = start_with_alpha(temp.path()).await;
    assert_eq!(running.tether.startup_report().schedules.dropped, 1);
    assert!(running.tether.list_scheduled_connections().is_empty());
    assert!(ScheduleStore::open(temp.path()).await.is_empty());

    sleep(Duration::from_secs(600)).await;
    assert_eq!(running.connector.open_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn future_schedule_survives_restart() {
    let temp = tempdir().unwrap();
    {
        let running = start_with_alpha(temp.path()).await;
        running
            .tether
            .schedule_connection("alpha", 10, None, None)
            .await
            .unwrap();
        running.tether.shutdown().await;
    }

    let mut running = start(temp.path()).await;
    assert_eq!(running.tether.startup_report().schedules.rearmed, 1);

    loop {
        if let RoutedEvent::ScheduledFired { server, .. } = running.routed.recv().await.unwrap() {
            assert_eq!(server, "alpha");
            break;
        }
    }
    assert_eq!(running.connector.open_count(), 1);
    assert!(running.tether.list_scheduled_connections().is_empty());
}

#[tokio::test(start_paused = true)]
async fn disconnect_then_restart_does_not_resume() {
    let temp = tempdir().unwrap();
    {
        let running = start_with_alpha(temp.path()).await;
        connect_live(&running, "alpha", None, None).await;
        running.tether.disconnect().await.unwrap();
        running.tether.shutdown().await;
    }

    let running = start(temp.path()).await;
    assert!(running.tether.startup_report().resuming.is_none());
    sleep(Duration::from_secs(60)).await;
    assert_eq!(running.connector.open_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn shutdown_then_restart_resumes_after_grace() {
    let temp = tempdir().unwrap();
    {
        let running = start_with_alpha(temp.path()).await;
        connect_live(&running, "alpha", Some("Steve"), Some(30)).await;
        running.tether.shutdown().await;
    }

    let running = start(temp.path()).await;
    assert_eq!(
        running.tether.startup_report().resuming.as_deref(),
        Some("alpha")
    );

    let started = Instant::now();
    let link = running.connector.wait_for_opens(1).await;
    assert!(started.elapsed() >= Duration::from_secs(5));
    assert_eq!(link.endpoint().username, "Steve");
}

#[tokio::test(start_paused = true)]
async fn failing_resume_enters_backoff() {
    let temp = tempdir().unwrap();
    {
        let running = start_with_alpha(temp.path()).await;
        connect_live(&running, "alpha", None, None).await;
        running.tether.shutdown().await;
    }

    let connector = Arc::new(ScriptedConnector::new());
    connector.fail_next_open("name resolution failed");
    let (sink, _routed) = ChannelSink::new();
    let tether = Tether::start(
        TetherConfig::default(),
        temp.path(),
        connector.clone(),
        Arc::new(sink),
    )
    .await;
    let mut decisions = tether.subscribe_reconnect();

    assert!(matches!(
        next_decision(&mut decisions).await,
        ReconnectEvent::Scheduled { attempt: 1, .. }
    ));
    let link = connector.wait_for_opens(1).await;
    assert_eq!(link.endpoint().host, "127.0.0.1");
}

#[tokio::test(start_paused = true)]
async fn schedule_for_deleted_server_fails_without_connecting() {
    let temp = tempdir().unwrap();
    let mut running = start_with_alpha(temp.path()).await;

    running
        .tether
        .schedule_connection("alpha", 5, None, None)
        .await
        .unwrap();
    running.tether.remove_server("alpha").await.unwrap();

    loop {
        match running.routed.recv().await.unwrap() {
            RoutedEvent::ScheduledFailed { server, reason, .. } => {
                assert_eq!(server, "alpha");
                assert!(reason.contains("Unknown server"));
                break;
            }
            RoutedEvent::ScheduledFired { .. } => panic!("schedule fired for a deleted server"),
            _ => {}
        }
    }

    assert_eq!(running.connector.open_count(), 0);
    assert!(running.tether.list_scheduled_connections().is_empty());
    assert_eq!(running.tether.scheduler().armed(), 0);
}

#[tokio::test(start_paused = true)]
async fn cancel_during_resume_grace_stops_resume() {
    let temp = tempdir().unwrap();
    {
        let running = start_with_alpha(temp.path()).await;
        connect_live(&running, "alpha", None, None).await;
        running.tether.shutdown().await;
    }

    let running = start(temp.path()).await;
    assert_eq!(
        running.tether.startup_report().resuming.as_deref(),
        Some("alpha")
    );
    assert!(running.tether.reconnector().is_pending());

    assert!(running.tether.cancel_reconnection());
    sleep(Duration::from_secs(60)).await;
    assert_eq!(running.connector.open_count(), 0);
    assert!(!running.tether.reconnector().is_pending());
}

#[tokio::test(start_paused = true)]
async fn retry_is_armed_before_loss_is_observable() {
    let temp = tempdir().unwrap();
    let running = start_with_alpha(temp.path()).await;
    connect_live(&running, "alpha", None, None).await;

    let mut lifecycle = running.tether.subscribe_lifecycle();
    running.connector.link(0).unwrap().end("connection reset").await;
    loop {
        if let LifecycleEvent::InvoluntaryDisconnect { .. } = lifecycle.recv().await.unwrap() {
            break;
        }
    }

    // Idle already, and the retry is already there to cancel
    assert!(!running.tether.is_connected().await);
    assert!(running.tether.reconnector().is_pending());
    assert!(running.tether.cancel_reconnection());

    sleep(Duration::from_secs(300)).await;
    assert_eq!(running.connector.open_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn cancel_while_retry_connecting_ends_backoff_on_failure() {
    let temp = tempdir().unwrap();
    let running = start_with_alpha(temp.path()).await;
    let mut decisions = running.tether.subscribe_reconnect();

    connect_live(&running, "alpha", None, None).await;
    running.connector.link(0).unwrap().end("lost").await;
    assert!(matches!(
        next_decision(&mut decisions).await,
        ReconnectEvent::Scheduled { attempt: 1, .. }
    ));

    // The retry has opened its client and is still connecting
    let link = running.connector.wait_for_opens(2).await;
    assert!(!running.tether.reconnector().is_pending());
    assert!(running.tether.cancel_reconnection());

    link.end("connection refused").await;
    sleep(Duration::from_secs(600)).await;
    assert_eq!(running.connector.open_count(), 2);
    assert_eq!(running.tether.reconnector().attempts(), 0);
    assert!(!running.tether.reconnector().is_pending());
    assert!(!running.tether.is_connected().await);
}

#[tokio::test(start_paused = true)]
async fn cancel_while_retry_connecting_keeps_a_successful_spawn() {
    let temp = tempdir().unwrap();
    let running = start_with_alpha(temp.path()).await;
    let mut decisions = running.tether.subscribe_reconnect();

    connect_live(&running, "alpha", None, None).await;
    running.connector.link(0).unwrap().end("lost").await;
    next_decision(&mut decisions).await;

    let link = running.connector.wait_for_opens(2).await;
    assert!(running.tether.cancel_reconnection());
    assert_eq!(next_decision(&mut decisions).await, ReconnectEvent::Cancelled);

    let mut lifecycle = running.tether.subscribe_lifecycle();
    link.spawn().await;
    wait_connected(&mut lifecycle).await;

    // A later loss of this session starts a fresh backoff
    link.end("lost again").await;
    assert!(matches!(
        next_decision(&mut decisions).await,
        ReconnectEvent::Scheduled { attempt: 1, .. }
    ));
}

#[tokio::test(start_paused = true)]
async fn disconnect_during_backoff_drops_pending_retry() {
    let temp = tempdir().unwrap();
    let running = start_with_alpha(temp.path()).await;
    let mut decisions = running.tether.subscribe_reconnect();

    connect_live(&running, "alpha", None, None).await;
    running.connector.link(0).unwrap().end("lost").await;
    assert!(matches!(
        next_decision(&mut decisions).await,
        ReconnectEvent::Scheduled { .. }
    ));

    assert!(matches!(
        running.tether.disconnect().await,
        Err(ConnectionError::NotConnected)
    ));
    assert!(!running.tether.reconnector().is_pending());

    sleep(Duration::from_secs(300)).await;
    assert_eq!(running.connector.open_count(), 1);
}
