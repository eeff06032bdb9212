//! Fault supervision and reconnect backoff
//!
//! Streaming faults never surface to the caller directly. The dispatch loop
//! signals them here; a supervisor thread moves the session to `Faulted`,
//! then retries the full open / configure / start sequence with exponential
//! backoff. Only when the budget is spent does the session close with
//! `ReconnectExhausted`.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use arc_swap::ArcSwap;
use flume::{Receiver, Selector};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::error::{CameraError, Result};

/// Bounded exponential backoff
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(200),
            multiplier: 2.0,
            max_delay: Duration::from_secs(5),
            max_attempts: 5,
        }
    }
}

impl ReconnectPolicy {
    /// Wait before the given 1-based attempt
    ///
    /// The first attempt runs immediately; attempt `k` waits
    /// `base * multiplier^(k-2)`, capped at `max_delay`.
    pub fn delay_before(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let exponent = i32::try_from(attempt - 2).unwrap_or(i32::MAX);
        let secs = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        Duration::try_from_secs_f64(secs)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// What went wrong with a running stream
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FaultKind {
    #[error("transport failure: {0}")]
    Io(String),

    #[error("no transport activity for {0:?}")]
    HeartbeatTimeout(Duration),

    #[error("no buffer queued with the transport for {0:?}")]
    BufferStarvation(Duration),
}

/// Fault raised by a dispatch loop, tagged with its stream generation
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct FaultSignal {
    pub generation: u64,
    pub kind: FaultKind,
}

/// Progress of fault handling, delivered to `on_fault` handlers
#[derive(Debug, Clone, PartialEq)]
pub enum FaultEvent {
    Faulted(FaultKind),
    ReconnectScheduled { attempt: u32, delay: Duration },
    ReconnectFailed { attempt: u32, error: String },
    Reconnected { attempts: u32 },
    ReconnectExhausted { attempts: u32 },
}

pub type FaultHandler = Arc<dyn Fn(&FaultEvent) + Send + Sync>;

/// Session-side operations the supervisor drives
pub(crate) trait Recoverable: Send + Sync {
    /// Streaming -> Faulted; false when the fault is stale or the session moved on
    fn begin_recovery(&self, generation: u64, kind: &FaultKind) -> bool;

    /// Faulted -> Reconnecting; false once the session is closed
    fn enter_reconnecting(&self) -> bool;

    /// Reopen, reconfigure and restart; the session is Streaming on success
    fn attempt_reconnect(&self) -> Result<()>;

    /// Close the session with `ReconnectExhausted`
    fn give_up(&self, attempts: u32, last_error: String);
}

pub struct FaultMonitor {
    policy: ReconnectPolicy,
    clock: Arc<dyn Clock>,
    handlers: ArcSwap<Vec<FaultHandler>>,
}

impl FaultMonitor {
    pub fn new(policy: ReconnectPolicy, clock: Arc<dyn Clock>) -> Self {
        Self {
            policy,
            clock,
            handlers: ArcSwap::from_pointee(Vec::new()),
        }
    }

    pub fn policy(&self) -> &ReconnectPolicy {
        &self.policy
    }

    pub fn subscribe(&self, handler: FaultHandler) {
        self.handlers.rcu(|current| {
            let mut next = Vec::clone(current);
            next.push(Arc::clone(&handler));
            next
        });
    }

    pub(crate) fn notify(&self, event: &FaultEvent) {
        for handler in self.handlers.load().iter() {
            if catch_unwind(AssertUnwindSafe(|| handler(event))).is_err() {
                warn!(?event, "Fault handler panicked");
            }
        }
    }

    /// Supervisor thread: handles fault signals until `shutdown` disconnects
    pub(crate) fn spawn_supervisor<R: Recoverable + 'static>(
        self: &Arc<Self>,
        name: String,
        target: Weak<R>,
        signals: Receiver<FaultSignal>,
        shutdown: Receiver<()>,
    ) -> Result<JoinHandle<()>> {
        let monitor = Arc::clone(self);
        thread::Builder::new()
            .name(name)
            .spawn(move || loop {
                let signal = Selector::new()
                    .recv(&signals, |signal| signal.ok())
                    .recv(&shutdown, |_| None)
                    .wait();
                let Some(signal) = signal else { break };
                let Some(target) = target.upgrade() else { break };
                monitor.recover(target.as_ref(), signal, &shutdown);
            })
            .map_err(|e| {
                CameraError::ResourceExhausted(format!("cannot spawn supervisor thread: {e}"))
            })
    }

    /// Run one fault through the reconnect state machine
    pub(crate) fn recover(
        &self,
        target: &dyn Recoverable,
        signal: FaultSignal,
        shutdown: &Receiver<()>,
    ) {
        if !target.begin_recovery(signal.generation, &signal.kind) {
            debug!(generation = signal.generation, "Ignoring stale fault");
            return;
        }
        self.notify(&FaultEvent::Faulted(signal.kind));
        if !target.enter_reconnecting() {
            return;
        }

        let mut last_error = String::from("no reconnect attempts allowed");
        for attempt in 1..=self.policy.max_attempts {
            let delay = self.policy.delay_before(attempt);
            self.notify(&FaultEvent::ReconnectScheduled { attempt, delay });
            if !delay.is_zero() && !self.clock.sleep(delay, shutdown) {
                debug!(attempt, "Reconnect cancelled");
                return;
            }
            if shutdown.is_disconnected() {
                return;
            }

            match target.attempt_reconnect() {
                Ok(()) => {
                    info!(attempt, "Reconnected");
                    self.notify(&FaultEvent::Reconnected { attempts: attempt });
                    return;
                }
                Err(e) if e.is_fatal() => {
                    debug!(attempt, "Reconnect abandoned: {}", e);
                    return;
                }
                Err(e) => {
                    warn!(attempt, "Reconnect attempt failed: {}", e);
                    last_error = e.to_string();
                    self.notify(&FaultEvent::ReconnectFailed {
                        attempt,
                        error: last_error.clone(),
                    });
                }
            }
        }

        let attempts = self.policy.max_attempts;
        error!(attempts, last_error = %last_error, "Reconnect budget exhausted");
        target.give_up(attempts, last_error);
        self.notify(&FaultEvent::ReconnectExhausted { attempts });
    }
}
