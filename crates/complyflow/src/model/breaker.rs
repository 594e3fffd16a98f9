//! Circuit breaker shared by every caller of one model endpoint.

use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
enum Inner {
    Closed { consecutive_failures: u32 },
    Open { until: Instant },
    /// A probe is in flight; everyone else waits for its outcome.
    HalfOpen,
}

/// Opens after `threshold` consecutive failed invocations, rejects calls
/// for `cooldown`, then lets a single probe through. The probe's outcome
/// closes or re-opens the breaker.
#[derive(Debug)]
pub struct CircuitBreaker {
    threshold: u32,
    cooldown: Duration,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, cooldown: Duration) -> Self {
        Self {
            threshold: threshold.max(1),
            cooldown,
            inner: Mutex::new(Inner::Closed {
                consecutive_failures: 0,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // Every write replaces the whole state, so a poisoned lock is still usable.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Asks to place a call. `Err` carries how long until the breaker will
    /// admit a probe.
    pub fn try_acquire(&self) -> Result<(), Duration> {
        let mut inner = self.lock();
        match *inner {
            Inner::Closed { .. } => Ok(()),
            Inner::Open { until } => {
                let now = Instant::now();
                if now >= until {
                    *inner = Inner::HalfOpen;
                    log::info!("Model circuit half-open, sending probe");
                    Ok(())
                } else {
                    Err(until - now)
                }
            }
            Inner::HalfOpen => Err(Duration::ZERO),
        }
    }

    /// The service answered (including with a client-side rejection).
    pub fn record_success(&self) {
        let mut inner = self.lock();
        if matches!(*inner, Inner::HalfOpen) {
            log::info!("Model circuit closed after successful probe");
        }
        *inner = Inner::Closed {
            consecutive_failures: 0,
        };
    }

    /// An invocation exhausted its transient retry budget.
    pub fn record_failure(&self) {
        let mut inner = self.lock();
        let next = match *inner {
            Inner::Closed {
                consecutive_failures,
            } => {
                let failures = consecutive_failures + 1;
                if failures >= self.threshold {
                    log::warn!(
                        "Model circuit opened after {} consecutive failures (cooldown {:?})",
                        failures,
                        self.cooldown
                    );
                    Inner::Open {
                        until: Instant::now() + self.cooldown,
                    }
                } else {
                    Inner::Closed {
                        consecutive_failures: failures,
                    }
                }
            }
            Inner::HalfOpen => {
                log::warn!("Model circuit probe failed, re-opening");
                Inner::Open {
                    until: Instant::now() + self.cooldown,
                }
            }
            Inner::Open { until } => Inner::Open { until },
        };
        *inner = next;
    }

    pub fn state(&self) -> BreakerState {
        match *self.lock() {
            Inner::Closed { .. } => BreakerState::Closed,
            Inner::Open { until } if Instant::now() >= until => BreakerState::HalfOpen,
            Inner::Open { .. } => BreakerState::Open,
            Inner::HalfOpen => BreakerState::HalfOpen,
        }
    }
}
