//! Per-registration circuit breaker.
//!
//! State machine:
//! - CLOSED: failures are counted; `maxFailures` of them open the circuit.
//! - OPEN: nothing is admitted. Entering OPEN arms a one-shot half-open timer
//!   and a reset interval that keeps zeroing the failure counter. Any record
//!   while OPEN re-arms the half-open timer if it is not running.
//! - HALF_OPEN: successes are counted; `minSuccesses` of them close the
//!   circuit. Any failure reopens it.
//!
//! The breaker never fails. Callers check [`CircuitBreaker::available`] before
//! dispatching and report the outcome afterwards.

use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::CircuitBreakerConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half-open",
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A state change of one breaker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitTransition {
    /// Name of the breaker, usually the signature of its pattern.
    pub breaker: String,
    pub from: CircuitState,
    pub to: CircuitState,
}

// ---------------------------------------------------------------------------
// Internal state
// ---------------------------------------------------------------------------

struct BreakerState {
    state: CircuitState,
    failures: u32,
    successes: u32,
    half_open_timer: Option<JoinHandle<()>>,
    reset_timer: Option<JoinHandle<()>>,
}

struct Inner {
    name: String,
    config: CircuitBreakerConfig,
    state: Mutex<BreakerState>,
    transitions: Option<broadcast::Sender<CircuitTransition>>,
}

impl Inner {
    fn emit(&self, from: CircuitState, to: CircuitState) {
        debug!(breaker = %self.name, %from, %to, "circuit transition");
        metrics::counter!("hemera_circuit_transitions_total", "to" => to.name()).increment(1);
        if let Some(tx) = &self.transitions {
            // No receivers is fine.
            let _ = tx.send(CircuitTransition {
                breaker: self.name.clone(),
                from,
                to,
            });
        }
    }

    fn enter_half_open(&self) {
        let moved = {
            let mut st = self.state.lock();
            st.half_open_timer = None;
            if st.state == CircuitState::Open {
                st.state = CircuitState::HalfOpen;
                st.successes = 0;
                true
            } else {
                false
            }
        };
        if moved {
            self.emit(CircuitState::Open, CircuitState::HalfOpen);
        }
    }

    fn reset_failures(&self) {
        self.state.lock().failures = 0;
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let st = self.state.get_mut();
        abort(&mut st.half_open_timer);
        abort(&mut st.reset_timer);
    }
}

fn abort(timer: &mut Option<JoinHandle<()>>) {
    if let Some(handle) = timer.take() {
        handle.abort();
    }
}

// ---------------------------------------------------------------------------
// CircuitBreaker
// ---------------------------------------------------------------------------

/// Shared handle to one breaker.
#[derive(Clone)]
pub struct CircuitBreaker {
    inner: Arc<Inner>,
}

impl CircuitBreaker {
    /// Creates a CLOSED breaker. Transitions are sent to `transitions` when
    /// given.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        config: CircuitBreakerConfig,
        transitions: Option<broadcast::Sender<CircuitTransition>>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                config,
                state: Mutex::new(BreakerState {
                    state: CircuitState::Closed,
                    failures: 0,
                    successes: 0,
                    half_open_timer: None,
                    reset_timer: None,
                }),
                transitions,
            }),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    #[must_use]
    pub fn state(&self) -> CircuitState {
        self.inner.state.lock().state
    }

    #[must_use]
    pub fn failures(&self) -> u32 {
        self.inner.state.lock().failures
    }

    #[must_use]
    pub fn successes(&self) -> u32 {
        self.inner.state.lock().successes
    }

    /// `false` while the circuit is OPEN.
    #[must_use]
    pub fn available(&self) -> bool {
        self.state() != CircuitState::Open
    }

    pub fn success(&self) {
        self.record(true);
    }

    pub fn failure(&self) {
        self.record(false);
    }

    /// Records the outcome of one dispatch.
    pub fn record(&self, success: bool) {
        let cfg = &self.inner.config;
        let transition = {
            let mut st = self.inner.state.lock();
            match st.state {
                CircuitState::Closed => {
                    if success {
                        None
                    } else {
                        st.failures = st.failures.saturating_add(1);
                        (st.failures >= cfg.max_failures).then(|| self.open(&mut st, CircuitState::Closed))
                    }
                }
                CircuitState::Open => {
                    if st.half_open_timer.as_ref().is_none_or(JoinHandle::is_finished) {
                        st.half_open_timer = self.arm_half_open();
                    }
                    None
                }
                CircuitState::HalfOpen => {
                    if success {
                        st.successes = st.successes.saturating_add(1);
                        (st.successes >= cfg.min_successes).then(|| {
                            st.state = CircuitState::Closed;
                            st.failures = 0;
                            st.successes = 0;
                            abort(&mut st.half_open_timer);
                            abort(&mut st.reset_timer);
                            (CircuitState::HalfOpen, CircuitState::Closed)
                        })
                    } else {
                        Some(self.open(&mut st, CircuitState::HalfOpen))
                    }
                }
            }
        };

        if let Some((from, to)) = transition {
            self.inner.emit(from, to);
        }
    }

    fn open(&self, st: &mut BreakerState, from: CircuitState) -> (CircuitState, CircuitState) {
        st.state = CircuitState::Open;
        st.successes = 0;
        abort(&mut st.half_open_timer);
        st.half_open_timer = self.arm_half_open();
        if st.reset_timer.is_none() {
            st.reset_timer = self.arm_reset_interval();
        }
        (from, CircuitState::Open)
    }

    fn arm_half_open(&self) -> Option<JoinHandle<()>> {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(breaker = %self.inner.name, "no runtime; half-open timer not armed");
            return None;
        };
        let delay = Duration::from_millis(self.inner.config.half_open_time);
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        Some(runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(inner) = weak.upgrade() {
                inner.enter_half_open();
            }
        }))
    }

    fn arm_reset_interval(&self) -> Option<JoinHandle<()>> {
        let period = self.inner.config.reset_interval_time;
        if period == 0 {
            return None;
        }
        let runtime = tokio::runtime::Handle::try_current().ok()?;
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        Some(runtime.spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(period));
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else { break };
                inner.reset_failures();
            }
        }))
    }

    /// Stops both timers; the state is kept.
    pub fn shutdown(&self) {
        let mut st = self.inner.state.lock();
        abort(&mut st.half_open_timer);
        abort(&mut st.reset_timer);
    }
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let st = self.inner.state.lock();
        f.debug_struct("CircuitBreaker")
            .field("name", &self.inner.name)
            .field("state", &st.state)
            .field("failures", &st.failures)
            .field("successes", &st.successes)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn config(max_failures: u32, min_successes: u32) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            enabled: true,
            max_failures,
            min_successes,
            half_open_time: 100,
            reset_interval_time: 1_000,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn opens_then_half_opens_then_closes() {
        let (tx, mut rx) = broadcast::channel(16);
        let breaker = CircuitBreaker::new("math", config(3, 2), Some(tx));

        breaker.failure();
        breaker.failure();
        assert_eq!(breaker.state(), CircuitState::Closed);
        breaker.failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.available());

        tokio::time::sleep(Duration::from_millis(101)).await;
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert!(breaker.available());

        breaker.success();
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        breaker.success();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.failures(), 0);

        let seen: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok()).map(|t| t.to).collect();
        assert_eq!(
            seen,
            vec![CircuitState::Open, CircuitState::HalfOpen, CircuitState::Closed]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn failure_in_half_open_reopens() {
        let breaker = CircuitBreaker::new("math", config(1, 2), None);
        breaker.failure();
        tokio::time::sleep(Duration::from_millis(101)).await;
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        breaker.success();
        breaker.failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert_eq!(breaker.successes(), 0);

        tokio::time::sleep(Duration::from_millis(101)).await;
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
    }

    #[tokio::test(start_paused = true)]
    async fn records_while_open_do_not_extend_the_timer() {
        let breaker = CircuitBreaker::new("math", config(1, 1), None);
        breaker.failure();
        tokio::time::sleep(Duration::from_millis(60)).await;
        breaker.failure();
        breaker.success();
        tokio::time::sleep(Duration::from_millis(41)).await;
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
    }

    #[tokio::test(start_paused = true)]
    async fn reset_interval_zeroes_failures_while_open() {
        let cfg = CircuitBreakerConfig {
            half_open_time: 10_000,
            reset_interval_time: 50,
            ..config(2, 1)
        };
        let breaker = CircuitBreaker::new("math", cfg, None);
        breaker.failure();
        breaker.failure();
        assert_eq!(breaker.failures(), 2);

        tokio::time::sleep(Duration::from_millis(51)).await;
        assert_eq!(breaker.failures(), 0);
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn successes_while_closed_change_nothing() {
        let breaker = CircuitBreaker::new("math", config(2, 1), None);
        breaker.success();
        breaker.failure();
        breaker.success();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.failures(), 1);
        breaker.shutdown();
    }
}
