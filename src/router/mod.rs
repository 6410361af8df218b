//! Event Router
//!
//! Turns raw client events and core lifecycle notices into [`RoutedEvent`]s
//! and hands them to a pluggable [`EventSink`] (the chat front end, a log,
//! a test channel), dropping categories the operator has switched off.
//!
//! Categories are a closed set; the sink never sees string-keyed event names.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::client::ClientEvent;

/// Health below this raises an alert (out of 20)
const LOW_HEALTH: f32 = 10.0;

/// Food below this raises an alert (out of 20)
const LOW_FOOD: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventCategory {
    Connection,
    Reconnect,
    Schedule,
    Chat,
    Health,
    Death,
    Kick,
    TimeOfDay,
    Ping,
}

impl EventCategory {
    pub const ALL: [EventCategory; 9] = [
        EventCategory::Connection,
        EventCategory::Reconnect,
        EventCategory::Schedule,
        EventCategory::Chat,
        EventCategory::Health,
        EventCategory::Death,
        EventCategory::Kick,
        EventCategory::TimeOfDay,
        EventCategory::Ping,
    ];
}

/// Which categories reach the sink. Everything is on unless disabled.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CategoryToggles {
    #[serde(default)]
    disabled: BTreeSet<EventCategory>,
}

impl CategoryToggles {
    pub fn with_disabled(disabled: BTreeSet<EventCategory>) -> Self {
        Self { disabled }
    }

    pub fn is_enabled(&self, category: EventCategory) -> bool {
        !self.disabled.contains(&category)
    }

    pub fn set(&mut self, category: EventCategory, enabled: bool) {
        if enabled {
            self.disabled.remove(&category);
        } else {
            self.disabled.insert(category);
        }
    }
}

/// An event ready for the operator
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RoutedEvent {
    Connected { server: String, address: String, username: String },
    AutoDisconnectArmed { minutes: u32 },
    AutoDisconnected { minutes: u32 },
    ConnectionLost { server: String, reason: String },
    ClientError { message: String },
    Kicked { reason: String },
    ReconnectScheduled { server: String, attempt: u32, max_attempts: u32, delay_secs: u64 },
    ReconnectGaveUp { server: String, attempts: u32 },
    ScheduledFired { id: String, server: String },
    ScheduledFailed { id: String, server: String, reason: String },
    Chat { sender: String, message: String },
    LowHealth { health: f32 },
    LowFood { food: u32 },
    Died,
    Respawned,
    Daybreak,
    Nightfall,
    HighPing { latency_ms: u64 },
    PingSample { latency_ms: u64 },
}

impl RoutedEvent {
    pub fn category(&self) -> EventCategory {
        match self {
            RoutedEvent::Connected { .. }
            | RoutedEvent::AutoDisconnectArmed { .. }
            | RoutedEvent::AutoDisconnected { .. }
            | RoutedEvent::ConnectionLost { .. }
            | RoutedEvent::ClientError { .. } => EventCategory::Connection,
            RoutedEvent::Kicked { .. } => EventCategory::Kick,
            RoutedEvent::ReconnectScheduled { .. } | RoutedEvent::ReconnectGaveUp { .. } => {
                EventCategory::Reconnect
            }
            RoutedEvent::ScheduledFired { .. } | RoutedEvent::ScheduledFailed { .. } => {
                EventCategory::Schedule
            }
            RoutedEvent::Chat { .. } => EventCategory::Chat,
            RoutedEvent::LowHealth { .. } | RoutedEvent::LowFood { .. } => EventCategory::Health,
            RoutedEvent::Died | RoutedEvent::Respawned => EventCategory::Death,
            RoutedEvent::Daybreak | RoutedEvent::Nightfall => EventCategory::TimeOfDay,
            RoutedEvent::HighPing { .. } | RoutedEvent::PingSample { .. } => EventCategory::Ping,
        }
    }
}

impl fmt::Display for RoutedEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RoutedEvent::Connected { address, username, .. } => {
                write!(f, "Connected to {} as {}.", address, username)
            }
            RoutedEvent::AutoDisconnectArmed { minutes } => {
                write!(f, "Set to auto-disconnect in {} minutes.", minutes)
            }
            RoutedEvent::AutoDisconnected { minutes } => {
                write!(f, "Auto-disconnected after {} minutes.", minutes)
            }
            RoutedEvent::ConnectionLost { server, reason } => {
                write!(f, "Lost connection to {}: {}", server, reason)
            }
            RoutedEvent::ClientError { message } => write!(f, "Error: {}", message),
            RoutedEvent::Kicked { reason } => write!(f, "Kicked from server: {}", reason),
            RoutedEvent::ReconnectScheduled {
                server,
                attempt,
                max_attempts,
                delay_secs,
            } => write!(
                f,
                "Reconnecting to {} in {}s (attempt {}/{}).",
                server, delay_secs, attempt, max_attempts
            ),
            RoutedEvent::ReconnectGaveUp { server, attempts } => write!(
                f,
                "Gave up reconnecting to {} after {} attempts.",
                server, attempts
            ),
            RoutedEvent::ScheduledFired { id, server } => {
                write!(f, "Scheduled connection {} to {} started.", id, server)
            }
            RoutedEvent::ScheduledFailed { id, server, reason } => write!(
                f,
                "Scheduled connection {} to {} failed: {}",
                id, server, reason
            ),
            RoutedEvent::Chat { sender, message } => write!(f, "[Chat] {}: {}", sender, message),
            RoutedEvent::LowHealth { health } => {
                write!(f, "Alert: health low ({}/20)!", health)
            }
            RoutedEvent::LowFood { food } => write!(f, "Alert: hunger low ({}/20)!", food),
            RoutedEvent::Died => write!(f, "Alert: the bot has died."),
            RoutedEvent::Respawned => write!(f, "The bot has respawned."),
            RoutedEvent::Daybreak => write!(f, "Time update: daytime has begun."),
            RoutedEvent::Nightfall => write!(f, "Time update: nighttime has begun."),
            RoutedEvent::HighPing { latency_ms } => write!(f, "High ping alert: {}ms", latency_ms),
            RoutedEvent::PingSample { latency_ms } => write!(f, "Current ping: {}ms", latency_ms),
        }
    }
}

/// Destination for routed events
pub trait EventSink: Send + Sync {
    fn deliver(&self, event: &RoutedEvent);
}

/// Writes every event to the tracing log
#[derive(Debug, Default)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn deliver(&self, event: &RoutedEvent) {
        match event.category() {
            EventCategory::Kick | EventCategory::Death => warn!(category = ?event.category(), "{}", event),
            EventCategory::Health if matches!(event, RoutedEvent::LowHealth { .. }) => {
                warn!(category = ?event.category(), "{}", event)
            }
            category => info!(category = ?category, "{}", event),
        }
    }
}

/// Forwards events into an unbounded channel
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<RoutedEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<RoutedEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelSink {
    fn deliver(&self, event: &RoutedEvent) {
        if self.tx.send(event.clone()).is_err() {
            debug!("Event sink receiver dropped, discarding {:?}", event.category());
        }
    }
}

pub struct EventRouter {
    sink: Arc<dyn EventSink>,
    toggles: RwLock<CategoryToggles>,
    /// Username of the live session, so the bot's own chat isn't echoed
    own_username: Mutex<Option<String>>,
    /// Last reported day/night state; only flips are forwarded
    last_is_day: Mutex<Option<bool>>,
}

impl EventRouter {
    pub fn new(sink: Arc<dyn EventSink>, toggles: CategoryToggles) -> Self {
        Self {
            sink,
            toggles: RwLock::new(toggles),
            own_username: Mutex::new(None),
            last_is_day: Mutex::new(None),
        }
    }

    pub fn set_enabled(&self, category: EventCategory, enabled: bool) {
        self.toggles.write().set(category, enabled);
        info!("Event category {:?} {}", category, if enabled { "enabled" } else { "disabled" });
    }

    pub fn is_enabled(&self, category: EventCategory) -> bool {
        self.toggles.read().is_enabled(category)
    }

    /// Reset per-session state for a newly opened client
    pub fn begin_session(&self, username: &str) {
        *self.own_username.lock() = Some(username.to_string());
        *self.last_is_day.lock() = None;
    }

    /// Deliver an event unless its category is switched off
    pub fn publish(&self, event: RoutedEvent) {
        if !self.is_enabled(event.category()) {
            debug!("Dropping {:?} event (category disabled)", event.category());
            return;
        }
        self.sink.deliver(&event);
    }

    /// Translate a non-lifecycle client event and publish it
    pub fn route_client_event(&self, event: &ClientEvent) {
        match event {
            ClientEvent::Spawned => {}
            ClientEvent::Chat { sender, message } => {
                let own = self.own_username.lock().clone();
                if own.as_deref() != Some(sender.as_str()) {
                    self.publish(RoutedEvent::Chat {
                        sender: sender.clone(),
                        message: message.clone(),
                    });
                }
            }
            ClientEvent::Health { health, food } => {
                if *health < LOW_HEALTH {
                    self.publish(RoutedEvent::LowHealth { health: *health });
                }
                if *food < LOW_FOOD {
                    self.publish(RoutedEvent::LowFood { food: *food });
                }
            }
            ClientEvent::Death => self.publish(RoutedEvent::Died),
            ClientEvent::Respawn => self.publish(RoutedEvent::Respawned),
            ClientEvent::TimeOfDay { is_day } => {
                let flipped = {
                    let mut last = self.last_is_day.lock();
                    let flipped = *last != Some(*is_day);
                    *last = Some(*is_day);
                    flipped
                };
                if flipped {
                    self.publish(if *is_day {
                        RoutedEvent::Daybreak
                    } else {
                        RoutedEvent::Nightfall
                    });
                }
            }
            ClientEvent::Kicked { reason } => self.publish(RoutedEvent::Kicked {
                reason: reason.clone(),
            }),
            ClientEvent::Error { message } => self.publish(RoutedEvent::ClientError {
                message: message.clone(),
            }),
            // Loss itself is reported by the manager with the server name attached
            ClientEvent::End { .. } => {}
        }
    }
}
