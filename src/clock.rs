//! Time source for watchdogs and reconnect backoff

use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use flume::{Receiver, RecvTimeoutError};

/// Injectable clock
///
/// The dispatch loop reads `now` for its heartbeat and starvation watchdogs,
/// and the fault monitor `sleep`s between reconnect attempts.
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> Instant;

    /// Wait for `delay`, returning early with `false` once `cancel` disconnects.
    fn sleep(&self, delay: Duration, cancel: &Receiver<()>) -> bool;
}

/// Wall clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, delay: Duration, cancel: &Receiver<()>) -> bool {
        matches!(cancel.recv_timeout(delay), Err(RecvTimeoutError::Timeout))
    }
}

/// Deterministic clock for tests
///
/// Time only moves through `advance` and `sleep`; every sleep is recorded.
#[derive(Debug, Clone)]
pub struct ManualClock {
    inner: Arc<Mutex<ManualInner>>,
}

#[derive(Debug)]
struct ManualInner {
    origin: Instant,
    elapsed: Duration,
    sleeps: Vec<Duration>,
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(ManualInner {
                origin: Instant::now(),
                elapsed: Duration::ZERO,
                sleeps: Vec::new(),
            })),
        }
    }

    pub fn advance(&self, by: Duration) {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .elapsed += by;
    }

    /// Every delay passed to `sleep`, in call order
    pub fn sleeps(&self) -> Vec<Duration> {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .sleeps
            .clone()
    }

    pub fn elapsed(&self) -> Duration {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .elapsed
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.origin + inner.elapsed
    }

    fn sleep(&self, delay: Duration, cancel: &Receiver<()>) -> bool {
        {
            let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            inner.sleeps.push(delay);
            inner.elapsed += delay;
        }
        !cancel.is_disconnected()
    }
}
