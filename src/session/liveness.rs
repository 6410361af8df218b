//! Liveness Sampling
//!
//! While a session is in the world, a background task reads the client's
//! round-trip latency on a fixed interval. Latency above the threshold is
//! always reported; otherwise a random fraction of samples is surfaced so
//! operators see the connection is alive without flooding the sink.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, warn};

use crate::client::GameClient;
use crate::router::{EventRouter, RoutedEvent};

/// Number of samples kept for the running average
const SAMPLE_WINDOW: usize = 10;

/// Liveness sampling settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LivenessConfig {
    /// Seconds between samples
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    /// Latency above this is reported as high (ms)
    #[serde(default = "default_high_latency_ms")]
    pub high_latency_ms: u64,
    /// Chance that a normal sample is surfaced (0.0 - 1.0)
    #[serde(default = "default_sample_probability")]
    pub sample_probability: f64,
}

fn default_interval_secs() -> u64 {
    30
}

fn default_high_latency_ms() -> u64 {
    500
}

fn default_sample_probability() -> f64 {
    0.2
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            high_latency_ms: default_high_latency_ms(),
            sample_probability: default_sample_probability(),
        }
    }
}

impl LivenessConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }

    pub fn classify(&self, latency_ms: u64) -> LatencyClass {
        if latency_ms > self.high_latency_ms {
            LatencyClass::High
        } else {
            LatencyClass::Normal
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LatencyClass {
    Normal,
    High,
}

/// Recent latency samples, averaged for the high-latency warning
#[derive(Debug, Default)]
struct LivenessTracker {
    samples: VecDeque<u64>,
}

impl LivenessTracker {
    fn record(&mut self, latency_ms: u64) {
        if self.samples.len() >= SAMPLE_WINDOW {
            self.samples.pop_front();
        }
        self.samples.push_back(latency_ms);
    }

    fn average(&self) -> Option<u64> {
        if self.samples.is_empty() {
            None
        } else {
            Some(self.samples.iter().sum::<u64>() / self.samples.len() as u64)
        }
    }
}

/// Start the periodic sampler for a live client
///
/// The first sample is taken one full interval after spawn. The task runs
/// until aborted by the owner.
pub fn spawn_sampler(
    client: Arc<dyn GameClient>,
    config: LivenessConfig,
    router: Arc<EventRouter>,
    server_name: String,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let period = config.interval();
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut rng = StdRng::from_entropy();
        let mut tracker = LivenessTracker::default();
        let probability = config.sample_probability.clamp(0.0, 1.0);

        loop {
            ticker.tick().await;

            let Some(latency_ms) = client.latency_ms() else {
                debug!("Liveness[{}]: no latency measured yet", server_name);
                continue;
            };
            tracker.record(latency_ms);

            match config.classify(latency_ms) {
                LatencyClass::High => {
                    warn!(
                        "Liveness[{}]: high latency {}ms (avg {:?}ms)",
                        server_name,
                        latency_ms,
                        tracker.average()
                    );
                    router.publish(RoutedEvent::HighPing { latency_ms });
                }
                LatencyClass::Normal => {
                    debug!("Liveness[{}]: {}ms", server_name, latency_ms);
                    if rng.gen_bool(probability) {
                        router.publish(RoutedEvent::PingSample { latency_ms });
                    }
                }
            }
        }
    })
}
