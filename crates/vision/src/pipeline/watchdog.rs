//! Stall reporting for the pipeline stages.
//!
//! Each stage beats while it is making progress. A stage silent for longer
//! than the stale threshold is reported once per stall episode. The watchdog
//! only observes; shutdown policy belongs to the stages themselves.

use std::{
    io,
    sync::atomic::{AtomicU64, Ordering},
    thread,
    time::{Duration, Instant},
};

use crossbeam_channel::{Receiver, RecvTimeoutError};
use tracing::{info, warn};

use crate::pipeline::instrumentation;

/// Sleep interval between watchdog health checks.
pub(crate) const WATCHDOG_POLL_INTERVAL_MS: u64 = 500;
/// Time without a heartbeat before a component is considered stalled.
pub(crate) const WATCHDOG_STALE_THRESHOLD_MS: u64 = 1_500;
/// Grace period at startup allowing components to warm up before monitoring.
pub(crate) const WATCHDOG_STARTUP_GRACE_MS: u64 = 5_000;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum HealthComponent {
    Capture,
    Inference,
    Dispatch,
}

impl HealthComponent {
    pub(crate) const ALL: [HealthComponent; 3] = [
        HealthComponent::Capture,
        HealthComponent::Inference,
        HealthComponent::Dispatch,
    ];

    pub(crate) fn label(self) -> &'static str {
        match self {
            HealthComponent::Capture => "capture",
            HealthComponent::Inference => "inference",
            HealthComponent::Dispatch => "dispatch",
        }
    }

    fn slot(self) -> usize {
        self as usize
    }
}

/// Last heartbeat per stage, in milliseconds since `origin`.
pub(crate) struct PipelineHealth {
    origin: Instant,
    beats: [AtomicU64; 3],
}

impl PipelineHealth {
    pub(crate) fn new() -> Self {
        Self::with_grace(Duration::from_millis(WATCHDOG_STARTUP_GRACE_MS))
    }

    /// Treats every stage as having beaten `grace` into the future.
    pub(crate) fn with_grace(grace: Duration) -> Self {
        let deadline = grace.as_millis() as u64;
        Self {
            origin: Instant::now(),
            beats: std::array::from_fn(|_| AtomicU64::new(deadline)),
        }
    }

    pub(crate) fn beat(&self, component: HealthComponent) {
        self.beat_at(component, self.now_ms());
    }

    fn beat_at(&self, component: HealthComponent, now_ms: u64) {
        self.beats[component.slot()].store(now_ms, Ordering::Relaxed);
    }

    fn now_ms(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }

    /// Components that have not beaten within `threshold` as of `now_ms`.
    pub(crate) fn stale_components(&self, now_ms: u64, threshold: u64) -> Vec<HealthComponent> {
        HealthComponent::ALL
            .into_iter()
            .filter(|component| {
                let last = self.beats[component.slot()].load(Ordering::Relaxed);
                now_ms.saturating_sub(last) > threshold
            })
            .collect()
    }
}

/// Spawns the watchdog; it exits when `stop` receives a message or disconnects.
pub(crate) fn spawn_watchdog(
    health: std::sync::Arc<PipelineHealth>,
    stop: Receiver<()>,
) -> io::Result<thread::JoinHandle<()>> {
    instrumentation::spawn_thread("vision-watchdog", move || {
        let mut stalled = [false; 3];
        loop {
            match stop.recv_timeout(Duration::from_millis(WATCHDOG_POLL_INTERVAL_MS)) {
                Err(RecvTimeoutError::Timeout) => {}
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            }
            let stale = health.stale_components(health.now_ms(), WATCHDOG_STALE_THRESHOLD_MS);
            for component in HealthComponent::ALL {
                let is_stale = stale.contains(&component);
                let was_stale = &mut stalled[component.slot()];
                if is_stale && !*was_stale {
                    warn!(
                        stage = component.label(),
                        "no progress for over {WATCHDOG_STALE_THRESHOLD_MS} ms"
                    );
                    metrics::counter!("vision_stage_stalls_total", "stage" => component.label())
                        .increment(1);
                } else if !is_stale && *was_stale {
                    info!(stage = component.label(), "stage recovered");
                }
                *was_stale = is_stale;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stages_inside_grace_are_healthy() {
        let health = PipelineHealth::with_grace(Duration::from_millis(5_000));
        assert!(health.stale_components(6_000, 1_500).is_empty());
        assert_eq!(health.stale_components(6_501, 1_500).len(), 3);
    }

    #[test]
    fn only_silent_stages_are_stale() {
        let health = PipelineHealth::with_grace(Duration::ZERO);
        health.beat_at(HealthComponent::Capture, 100);
        health.beat_at(HealthComponent::Inference, 1_900);
        health.beat_at(HealthComponent::Dispatch, 1_000);
        assert_eq!(
            health.stale_components(2_000, 1_500),
            vec![HealthComponent::Capture]
        );
    }

    #[test]
    fn watchdog_stops_on_signal() {
        let health = std::sync::Arc::new(PipelineHealth::new());
        let (tx, rx) = crossbeam_channel::bounded(1);
        let handle = spawn_watchdog(health, rx).unwrap();
        tx.send(()).unwrap();
        handle.join().unwrap();
    }
}
