use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use maestro_core::BreakerPolicy;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{info, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum CircuitState {
    Closed,
    Open { since: Instant },
    /// At most one probe publish is admitted at a time.
    HalfOpen { probing: bool },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct BreakerSnapshot {
    pub state: BreakerState,
    pub consecutive_failures: u32,
    pub failure_threshold: u32,
    pub times_opened: u64,
    /// Remaining cool-down while open; zero once a probe would be admitted.
    pub retry_after_ms: Option<u64>,
}

/// How a publish was admitted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Admission {
    Normal,
    Probe,
}

/// Consecutive-failure circuit breaker:
/// N failures → open → cool-down → half-open probe → closed or open again.
pub(crate) struct CircuitBreaker {
    state: Mutex<CircuitState>,
    consecutive_failures: AtomicU32,
    times_opened: AtomicU64,
    threshold: u32,
    cooldown: Duration,
}

impl CircuitBreaker {
    pub(crate) fn new(policy: &BreakerPolicy) -> Self {
        Self {
            state: Mutex::new(CircuitState::Closed),
            consecutive_failures: AtomicU32::new(0),
            times_opened: AtomicU64::new(0),
            threshold: policy.failure_threshold.max(1),
            cooldown: policy.recovery_timeout(),
        }
    }

    /// Admit a publish, or return how long the caller should wait.
    pub(crate) fn try_acquire(&self) -> Result<Admission, Duration> {
        let mut state = self.state.lock();
        match *state {
            CircuitState::Closed => Ok(Admission::Normal),
            CircuitState::Open { since } => {
                let elapsed = since.elapsed();
                if elapsed >= self.cooldown {
                    *state = CircuitState::HalfOpen { probing: true };
                    info!("event channel breaker half-open, admitting probe");
                    Ok(Admission::Probe)
                } else {
                    Err(self.cooldown - elapsed)
                }
            }
            CircuitState::HalfOpen { probing: false } => {
                *state = CircuitState::HalfOpen { probing: true };
                Ok(Admission::Probe)
            }
            CircuitState::HalfOpen { probing: true } => Err(Duration::ZERO),
        }
    }

    pub(crate) fn record_success(&self, admission: Admission) {
        let mut state = self.state.lock();
        match (admission, *state) {
            (Admission::Probe, _) => {
                self.consecutive_failures.store(0, Ordering::Relaxed);
                *state = CircuitState::Closed;
                info!("event channel breaker closed after successful probe");
            }
            (Admission::Normal, CircuitState::Closed) => {
                self.consecutive_failures.store(0, Ordering::Relaxed);
            }
            // A slow publish admitted before the breaker opened does not close it.
            (Admission::Normal, _) => {}
        }
    }

    pub(crate) fn record_failure(&self, admission: Admission) {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
        let mut state = self.state.lock();
        match (admission, *state) {
            (Admission::Probe, _) => {
                *state = CircuitState::Open { since: Instant::now() };
                let _ = self.times_opened.fetch_add(1, Ordering::Relaxed);
                warn!(failures, "event channel probe failed, breaker re-opened");
            }
            (Admission::Normal, CircuitState::Closed) if failures >= self.threshold => {
                *state = CircuitState::Open { since: Instant::now() };
                let _ = self.times_opened.fetch_add(1, Ordering::Relaxed);
                warn!(
                    failures,
                    threshold = self.threshold,
                    cooldown_ms = self.cooldown.as_millis() as u64,
                    "event channel breaker opened"
                );
            }
            _ => {}
        }
    }

    /// Give the probe slot back when a probe publish is abandoned.
    pub(crate) fn release_probe(&self) {
        let mut state = self.state.lock();
        if *state == (CircuitState::HalfOpen { probing: true }) {
            *state = CircuitState::HalfOpen { probing: false };
        }
    }

    pub(crate) fn state(&self) -> BreakerState {
        match *self.state.lock() {
            CircuitState::Closed => BreakerState::Closed,
            CircuitState::Open { .. } => BreakerState::Open,
            CircuitState::HalfOpen { .. } => BreakerState::HalfOpen,
        }
    }

    /// Read-only view; never advances open → half-open.
    pub(crate) fn snapshot(&self) -> BreakerSnapshot {
        let state = *self.state.lock();
        let (public, retry_after_ms) = match state {
            CircuitState::Closed => (BreakerState::Closed, None),
            CircuitState::Open { since } => (
                BreakerState::Open,
                Some(self.cooldown.saturating_sub(since.elapsed()).as_millis() as u64),
            ),
            CircuitState::HalfOpen { .. } => (BreakerState::HalfOpen, None),
        };
        BreakerSnapshot {
            state: public,
            consecutive_failures: self.consecutive_failures.load(Ordering::Relaxed),
            failure_threshold: self.threshold,
            times_opened: self.times_opened.load(Ordering::Relaxed),
            retry_after_ms,
        }
    }
}
