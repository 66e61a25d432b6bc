//! Server lifecycle: health state, shutdown signalling, and in-flight
//! dispatch tracking.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use tokio::sync::{watch, Notify};

/// Server health state.
///
/// State machine: Starting -> Ready -> Draining -> Stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
    /// Listeners are not accepting yet.
    Starting,
    /// Accepting and dispatching requests.
    Ready,
    /// No new sessions or requests; waiting for in-flight dispatches.
    Draining,
    /// Every in-flight dispatch finished.
    Stopped,
}

impl HealthState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Ready => "ready",
            Self::Draining => "draining",
            Self::Stopped => "stopped",
        }
    }
}

#[derive(Debug, Default)]
struct InFlight {
    count: AtomicU64,
    idle: Notify,
}

/// Coordinates graceful shutdown across listeners and sessions.
///
/// 1. Health probes read [`health_state`](Self::health_state)
/// 2. Listeners and sessions watch [`shutdown_receiver`](Self::shutdown_receiver)
/// 3. Each dispatch holds an [`InFlightGuard`]
/// 4. [`wait_for_drain`](Self::wait_for_drain) waits for the guards to go
#[derive(Debug)]
pub struct ShutdownController {
    signal: watch::Sender<bool>,
    in_flight: Arc<InFlight>,
    health: ArcSwap<HealthState>,
}

impl ShutdownController {
    /// Creates a controller in the `Starting` state.
    #[must_use]
    pub fn new() -> Self {
        Self {
            signal: watch::channel(false).0,
            in_flight: Arc::new(InFlight::default()),
            health: ArcSwap::from_pointee(HealthState::Starting),
        }
    }

    pub fn set_ready(&self) {
        self.health.store(Arc::new(HealthState::Ready));
    }

    /// Receiver that flips to `true` when shutdown starts.
    #[must_use]
    pub fn shutdown_receiver(&self) -> watch::Receiver<bool> {
        self.signal.subscribe()
    }

    /// Moves to `Draining` and wakes every shutdown receiver. Idempotent.
    pub fn trigger_shutdown(&self) {
        if self.health_state() != HealthState::Stopped {
            self.health.store(Arc::new(HealthState::Draining));
        }
        self.signal.send_replace(true);
    }

    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        *self.signal.borrow()
    }

    /// Resolves once shutdown has been triggered.
    pub async fn wait_for_shutdown(&self) {
        let mut rx = self.signal.subscribe();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    #[must_use]
    pub fn health_state(&self) -> HealthState {
        *self.health.load_full()
    }

    /// Tracks one dispatch until the guard is dropped.
    #[must_use]
    pub fn in_flight_guard(&self) -> InFlightGuard {
        self.in_flight.count.fetch_add(1, Ordering::AcqRel);
        InFlightGuard {
            in_flight: Arc::clone(&self.in_flight),
        }
    }

    #[must_use]
    pub fn in_flight_count(&self) -> u64 {
        self.in_flight.count.load(Ordering::Acquire)
    }

    /// Waits up to `timeout` for every in-flight dispatch to finish.
    ///
    /// Returns `true` and moves to `Stopped` if they did; returns `false`
    /// and stays `Draining` otherwise.
    pub async fn wait_for_drain(&self, timeout: Duration) -> bool {
        let drained = tokio::time::timeout(timeout, async {
            loop {
                let idle = self.in_flight.idle.notified();
                if self.in_flight_count() == 0 {
                    return;
                }
                idle.await;
            }
        })
        .await
        .is_ok();
        if drained {
            self.health.store(Arc::new(HealthState::Stopped));
        }
        drained
    }
}

impl Default for ShutdownController {
    fn default() -> Self {
        Self::new()
    }
}

/// Decrements the in-flight count when dropped, panics included.
#[derive(Debug)]
pub struct InFlightGuard {
    in_flight: Arc<InFlight>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if self.in_flight.count.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.in_flight.idle.notify_waiters();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_moves_forward() {
        let shutdown = ShutdownController::default();
        assert_eq!(shutdown.health_state(), HealthState::Starting);
        assert!(!shutdown.is_shutting_down());

        shutdown.set_ready();
        assert_eq!(shutdown.health_state().as_str(), "ready");

        shutdown.trigger_shutdown();
        shutdown.trigger_shutdown();
        assert!(shutdown.is_shutting_down());
        assert_eq!(shutdown.health_state(), HealthState::Draining);
    }

    #[tokio::test]
    async fn stopped_survives_a_late_trigger() {
        let shutdown = ShutdownController::new();
        shutdown.trigger_shutdown();
        assert!(shutdown.wait_for_drain(Duration::from_millis(10)).await);
        shutdown.trigger_shutdown();
        assert_eq!(shutdown.health_state(), HealthState::Stopped);
    }

    #[tokio::test]
    async fn waiters_wake_on_trigger() {
        let shutdown = Arc::new(ShutdownController::new());
        let mut receiver = shutdown.shutdown_receiver();
        let waiter = {
            let shutdown = Arc::clone(&shutdown);
            tokio::spawn(async move { shutdown.wait_for_shutdown().await })
        };

        shutdown.trigger_shutdown();
        waiter.await.unwrap();
        receiver.changed().await.unwrap();
        assert!(*receiver.borrow());

        // Already triggered: resolves at once.
        shutdown.wait_for_shutdown().await;
    }

    #[tokio::test]
    async fn drain_tracks_guards_held_by_other_tasks() {
        let shutdown = ShutdownController::new();
        let guards: Vec<_> = (0..3).map(|_| shutdown.in_flight_guard()).collect();
        assert_eq!(shutdown.in_flight_count(), 3);
        shutdown.trigger_shutdown();

        let workers: Vec<_> = guards
            .into_iter()
            .enumerate()
            .map(|(i, guard)| {
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(10 * (i as u64 + 1))).await;
                    drop(guard);
                })
            })
            .collect();

        assert!(shutdown.wait_for_drain(Duration::from_secs(2)).await);
        assert_eq!(shutdown.in_flight_count(), 0);
        assert_eq!(shutdown.health_state(), HealthState::Stopped);
        for worker in workers {
            worker.await.unwrap();
        }
    }

    #[tokio::test]
    async fn drain_gives_up_after_timeout() {
        let shutdown = ShutdownController::new();
        let guard = shutdown.in_flight_guard();
        shutdown.trigger_shutdown();
        assert!(!shutdown.wait_for_drain(Duration::from_millis(20)).await);
        assert_eq!(shutdown.health_state(), HealthState::Draining);

        drop(guard);
        assert!(shutdown.wait_for_drain(Duration::from_millis(20)).await);
    }
}
