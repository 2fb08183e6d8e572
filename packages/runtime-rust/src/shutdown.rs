//! Instance lifecycle with in-flight tracking.
//!
//! `ArcSwap` holds the lifecycle state; an atomic counter with RAII guards
//! tracks inbound requests and outstanding acts so `close` can drain them.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use tokio::sync::watch;

/// Lifecycle state: `Starting -> Ready -> Closing -> Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    /// Plugins are still registering.
    Starting,
    Ready,
    /// `close` is running; new work is refused.
    Closing,
    Closed,
}

/// Coordinates closing an instance.
#[derive(Debug)]
pub struct ShutdownController {
    signal: watch::Sender<bool>,
    in_flight: Arc<AtomicU64>,
    state: Arc<ArcSwap<Lifecycle>>,
}

impl ShutdownController {
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self {
            signal: tx,
            in_flight: Arc::new(AtomicU64::new(0)),
            state: Arc::new(ArcSwap::from_pointee(Lifecycle::Starting)),
        }
    }

    pub fn set_ready(&self) {
        self.state.store(Arc::new(Lifecycle::Ready));
    }

    /// A receiver that flips to `true` once closing starts. Pending acts
    /// select on it to abort their wait.
    #[must_use]
    pub fn receiver(&self) -> watch::Receiver<bool> {
        self.signal.subscribe()
    }

    /// Moves to `Closing` and wakes every receiver. Returns `false` when
    /// closing had already started.
    pub fn begin_close(&self) -> bool {
        let previous = self.state.swap(Arc::new(Lifecycle::Closing));
        if matches!(*previous, Lifecycle::Closing | Lifecycle::Closed) {
            self.state.store(previous);
            return false;
        }
        // Receivers may all be gone.
        let _ = self.signal.send(true);
        true
    }

    pub fn set_closed(&self) {
        self.state.store(Arc::new(Lifecycle::Closed));
    }

    #[must_use]
    pub fn state(&self) -> Lifecycle {
        **self.state.load()
    }

    #[must_use]
    pub fn is_closing(&self) -> bool {
        matches!(self.state(), Lifecycle::Closing | Lifecycle::Closed)
    }

    /// Counts one unit of in-flight work until the guard is dropped, panics
    /// included.
    #[must_use]
    pub fn in_flight_guard(&self) -> InFlightGuard {
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        InFlightGuard {
            in_flight: Arc::clone(&self.in_flight),
        }
    }

    #[must_use]
    pub fn in_flight_count(&self) -> u64 {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Waits until no work is in flight, up to `timeout`. Returns `false`
    /// when the timeout expired first.
    pub async fn wait_for_drain(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.in_flight_count() == 0 {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

impl Default for ShutdownController {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
pub struct InFlightGuard {
    in_flight: Arc<AtomicU64>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn walks_the_lifecycle() {
        let controller = ShutdownController::new();
        assert_eq!(controller.state(), Lifecycle::Starting);
        controller.set_ready();
        assert_eq!(controller.state(), Lifecycle::Ready);
        assert!(controller.begin_close());
        assert!(controller.is_closing());
        controller.set_closed();
        assert_eq!(controller.state(), Lifecycle::Closed);
    }

    #[test]
    fn closing_twice_is_reported() {
        let controller = ShutdownController::new();
        assert!(controller.begin_close());
        assert!(!controller.begin_close());
        controller.set_closed();
        assert!(!controller.begin_close());
        assert_eq!(controller.state(), Lifecycle::Closed);
    }

    #[tokio::test]
    async fn receivers_observe_close() {
        let controller = ShutdownController::new();
        let mut rx = controller.receiver();
        assert!(!*rx.borrow());
        controller.begin_close();
        rx.changed().await.unwrap();
        assert!(*rx.borrow());
    }

    #[tokio::test(start_paused = true)]
    async fn drain_waits_for_guards() {
        let controller = ShutdownController::new();
        let guard = controller.in_flight_guard();
        assert_eq!(controller.in_flight_count(), 1);

        let release = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            drop(guard);
        });

        assert!(controller.wait_for_drain(Duration::from_secs(1)).await);
        release.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn drain_gives_up_after_timeout() {
        let controller = ShutdownController::new();
        let _guard = controller.in_flight_guard();
        assert!(!controller.wait_for_drain(Duration::from_millis(20)).await);
    }
}
