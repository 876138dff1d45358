//! Three-state circuit breaker guarding one external service.
//!
//! Closed lets requests through and counts consecutive failures. Once the
//! threshold is reached the breaker opens and rejects requests for a
//! cooldown. After the cooldown a single probe is admitted (half-open): a
//! success closes the circuit, a failure reopens it with a longer cooldown.

use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub cooldown: Duration,
    pub max_cooldown: Duration,
    pub cooldown_multiplier: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(30),
            max_cooldown: Duration::from_secs(600),
            cooldown_multiplier: 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerPhase {
    Closed,
    Open,
    HalfOpen,
}

/// How a request was let through; reported back with its outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Normal,
    Probe,
}

/// One admitted request. Report its outcome with [`success`] or
/// [`failure`]; a permit dropped unreported (the request was cancelled or
/// timed out) counts as a failure if it carried the half-open probe, so the
/// breaker can never wait on a probe that will not come back.
///
/// [`success`]: BreakerPermit::success
/// [`failure`]: BreakerPermit::failure
#[must_use]
#[derive(Debug)]
pub struct BreakerPermit<'a> {
    breaker: &'a CircuitBreaker,
    admission: Admission,
    settled: bool,
}

impl BreakerPermit<'_> {
    pub fn admission(&self) -> Admission {
        self.admission
    }

    pub fn success(mut self) {
        self.settled = true;
        self.breaker.record_success(self.admission);
    }

    pub fn failure(mut self) {
        self.settled = true;
        self.breaker.record_failure(self.admission);
    }
}

impl Drop for BreakerPermit<'_> {
    fn drop(&mut self) {
        if !self.settled && self.admission == Admission::Probe {
            warn!(breaker = %self.breaker.name, "probe abandoned, counting it as failed");
            self.breaker.record_failure(self.admission);
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum State {
    Closed { consecutive_failures: u32 },
    Open { until: Instant, cooldown: Duration },
    HalfOpen { probe_in_flight: bool, cooldown: Duration },
}

#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    state: Mutex<State>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            state: Mutex::new(State::Closed {
                consecutive_failures: 0,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn phase(&self) -> BreakerPhase {
        match *self.lock() {
            State::Closed { .. } => BreakerPhase::Closed,
            State::Open { .. } => BreakerPhase::Open,
            State::HalfOpen { .. } => BreakerPhase::HalfOpen,
        }
    }

    /// `Err(wait)` means the request must not be sent; retry after `wait`.
    pub fn admit(&self) -> Result<Admission, Duration> {
        let mut state = self.lock();
        let now = Instant::now();
        match *state {
            State::Closed { .. } => Ok(Admission::Normal),
            State::Open { until, cooldown } => {
                if now >= until {
                    *state = State::HalfOpen {
                        probe_in_flight: true,
                        cooldown,
                    };
                    info!(breaker = %self.name, "circuit half-open, admitting probe");
                    Ok(Admission::Probe)
                } else {
                    Err(until - now)
                }
            }
            State::HalfOpen {
                probe_in_flight: true,
                cooldown,
            } => Err(self.probe_wait(cooldown)),
            State::HalfOpen {
                probe_in_flight: false,
                cooldown,
            } => {
                *state = State::HalfOpen {
                    probe_in_flight: true,
                    cooldown,
                };
                Ok(Admission::Probe)
            }
        }
    }

    /// Like [`admit`](Self::admit), but ties the outcome to a guard.
    pub fn enter(&self) -> Result<BreakerPermit<'_>, Duration> {
        self.admit().map(|admission| BreakerPermit {
            breaker: self,
            admission,
            settled: false,
        })
    }

    pub fn record_success(&self, admission: Admission) {
        let mut state = self.lock();
        if !matches!(*state, State::Closed { consecutive_failures: 0 }) {
            info!(breaker = %self.name, ?admission, "circuit closed");
        }
        *state = State::Closed {
            consecutive_failures: 0,
        };
    }

    pub fn record_failure(&self, admission: Admission) {
        let mut state = self.lock();
        let now = Instant::now();
        match (*state, admission) {
            (State::HalfOpen { cooldown, .. }, Admission::Probe) => {
                let next = cooldown
                    .saturating_mul(self.config.cooldown_multiplier.max(1))
                    .min(self.config.max_cooldown);
                warn!(
                    breaker = %self.name,
                    cooldown_ms = next.as_millis() as u64,
                    "probe failed, circuit reopened"
                );
                *state = State::Open {
                    until: now + next,
                    cooldown: next,
                };
            }
            (State::Closed { consecutive_failures }, _) => {
                let failures = consecutive_failures + 1;
                if failures >= self.config.failure_threshold.max(1) {
                    warn!(
                        breaker = %self.name,
                        failures,
                        cooldown_ms = self.config.cooldown.as_millis() as u64,
                        "circuit opened"
                    );
                    *state = State::Open {
                        until: now + self.config.cooldown,
                        cooldown: self.config.cooldown,
                    };
                } else {
                    *state = State::Closed {
                        consecutive_failures: failures,
                    };
                }
            }
            // Late failures from requests admitted before the circuit opened.
            _ => {}
        }
    }

    fn probe_wait(&self, cooldown: Duration) -> Duration {
        (cooldown / 4).max(Duration::from_millis(50))
    }
}
