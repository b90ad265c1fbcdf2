//! Dispatcher health and the count of operations currently executing.
//!
//! Health is published through an `ArcSwap` so `submit` can check it without
//! taking a lock. Executing operations hold an `InFlightGuard`; dropping the
//! last one wakes anyone waiting in `wait_for_drain`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use parking_lot::{Condvar, Mutex};

/// Dispatcher health, in order: Starting -> Ready -> Draining -> Stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
    /// Constructed, workers not yet running.
    Starting,
    /// Accepting operations.
    Ready,
    /// Refusing new operations; running ones may finish.
    Draining,
    /// Every worker has exited.
    Stopped,
}

#[derive(Debug, Default)]
struct Running {
    count: Mutex<u64>,
    idle: Condvar,
}

/// Shared lifecycle state consulted by `submit` and by every worker.
#[derive(Debug)]
pub struct Lifecycle {
    state: ArcSwap<HealthState>,
    running: Arc<Running>,
}

impl Lifecycle {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: ArcSwap::from_pointee(HealthState::Starting),
            running: Arc::new(Running::default()),
        }
    }

    fn transition(&self, to: HealthState) {
        let from = *self.state.swap(Arc::new(to));
        if from != to {
            tracing::debug!(from = ?from, to = ?to, "health state changed");
        }
    }

    pub fn set_ready(&self) {
        self.transition(HealthState::Ready);
    }

    /// Moves to `Draining`. New operations are refused from here on.
    pub fn begin_drain(&self) {
        self.transition(HealthState::Draining);
    }

    pub fn set_stopped(&self) {
        self.transition(HealthState::Stopped);
    }

    #[must_use]
    pub fn health_state(&self) -> HealthState {
        **self.state.load()
    }

    #[must_use]
    pub fn is_accepting(&self) -> bool {
        self.health_state() == HealthState::Ready
    }

    /// Counts one executing operation until the guard is dropped,
    /// including when the operation panics.
    #[must_use]
    pub fn in_flight_guard(&self) -> InFlightGuard {
        *self.running.count.lock() += 1;
        InFlightGuard {
            running: Arc::clone(&self.running),
        }
    }

    #[must_use]
    pub fn in_flight_count(&self) -> u64 {
        *self.running.count.lock()
    }

    /// Blocks until no operation is in flight or `timeout` expires.
    ///
    /// Returns `true` and moves to `Stopped` on a full drain; returns
    /// `false` (state unchanged) on timeout.
    pub fn wait_for_drain(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut count = self.running.count.lock();
        while *count > 0 {
            if self.running.idle.wait_until(&mut count, deadline).timed_out() {
                return false;
            }
        }
        drop(count);
        self.set_stopped();
        true
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

/// Marks one operation as executing for as long as it lives.
#[derive(Debug)]
pub struct InFlightGuard {
    running: Arc<Running>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let mut count = self.running.count.lock();
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.running.idle.notify_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transitions_in_order() {
        let lifecycle = Lifecycle::new();
        assert_eq!(lifecycle.health_state(), HealthState::Starting);
        assert!(!lifecycle.is_accepting());

        lifecycle.set_ready();
        assert!(lifecycle.is_accepting());

        lifecycle.begin_drain();
        assert_eq!(lifecycle.health_state(), HealthState::Draining);
        assert!(!lifecycle.is_accepting());
    }

    #[test]
    fn guards_count_executing_operations() {
        let lifecycle = Lifecycle::new();
        let first = lifecycle.in_flight_guard();
        let second = lifecycle.in_flight_guard();
        assert_eq!(lifecycle.in_flight_count(), 2);
        drop(first);
        assert_eq!(lifecycle.in_flight_count(), 1);
        drop(second);
        assert_eq!(lifecycle.in_flight_count(), 0);
    }

    #[test]
    fn guard_released_when_holder_panics() {
        let lifecycle = Arc::new(Lifecycle::new());
        let inner = Arc::clone(&lifecycle);
        let joined = std::thread::spawn(move || {
            let _guard = inner.in_flight_guard();
            panic!("operation failed");
        })
        .join();
        assert!(joined.is_err());
        assert_eq!(lifecycle.in_flight_count(), 0);
    }

    #[test]
    fn drain_wakes_when_last_guard_drops() {
        let lifecycle = Arc::new(Lifecycle::new());
        lifecycle.set_ready();
        let guard = lifecycle.in_flight_guard();
        lifecycle.begin_drain();

        assert!(!lifecycle.wait_for_drain(Duration::from_millis(30)));
        assert_eq!(lifecycle.health_state(), HealthState::Draining);

        let releaser = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(30));
            drop(guard);
        });
        assert!(lifecycle.wait_for_drain(Duration::from_secs(5)));
        assert_eq!(lifecycle.health_state(), HealthState::Stopped);
        releaser.join().unwrap();
    }

    #[test]
    fn idle_lifecycle_drains_immediately() {
        let lifecycle = Lifecycle::new();
        assert!(lifecycle.wait_for_drain(Duration::ZERO));
        assert_eq!(lifecycle.health_state(), HealthState::Stopped);
    }
}
