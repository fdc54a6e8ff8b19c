// SPDX-License-Identifier: MIT OR Apache-2.0
//! Circuit breaker guarding the submission path.
//!
//! State machine: `closed → open` after a configured number of consecutive
//! failures; `open → half_open` once the reset window has elapsed since the
//! last failure; `half_open → closed` on the next success, `half_open → open`
//! on the next failure.  While half-open, exactly one trial submission is
//! admitted.
//!
//! Single writer (the worker's completion hook); the submission path takes
//! the same lock for reads.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    /// Normal operation; submissions flow.
    Closed,
    /// Tripped; submissions are rejected.
    Open,
    /// Probing; one trial submission is admitted.
    HalfOpen,
}

impl fmt::Display for BreakerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        };
        f.write_str(s)
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: BreakerState,
    consecutive_failures: u32,
    last_failure: Option<Instant>,
    trial_admitted: bool,
}

/// Consecutive-failure circuit breaker.
#[derive(Debug)]
pub struct CircuitBreaker {
    threshold: u32,
    reset: Duration,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    /// Create a closed breaker tripping after `threshold` consecutive
    /// failures and probing again after `reset`.
    pub fn new(threshold: u32, reset: Duration) -> Self {
        Self {
            threshold,
            reset,
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                last_failure: None,
                trial_admitted: false,
            }),
        }
    }

    /// Current effective state.  An open breaker whose reset window has
    /// elapsed reports (and becomes) half-open.
    pub fn state(&self) -> BreakerState {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        Self::settle(&mut inner, self.reset);
        inner.state
    }

    /// Number of consecutive failures recorded.
    pub fn consecutive_failures(&self) -> u32 {
        let inner = self.inner.lock().expect("breaker lock poisoned");
        inner.consecutive_failures
    }

    /// Whether a submission would currently be admitted, without consuming
    /// the half-open trial slot.  Used by the status probe.
    pub fn would_admit(&self) -> bool {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        Self::settle(&mut inner, self.reset);
        match inner.state {
            BreakerState::Closed => true,
            BreakerState::Open => false,
            BreakerState::HalfOpen => !inner.trial_admitted,
        }
    }

    /// Admit one submission if the breaker allows it.  In the half-open
    /// state this consumes the single trial slot.
    pub fn try_admit(&self) -> bool {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        Self::settle(&mut inner, self.reset);
        match inner.state {
            BreakerState::Closed => true,
            BreakerState::Open => false,
            BreakerState::HalfOpen => {
                if inner.trial_admitted {
                    false
                } else {
                    inner.trial_admitted = true;
                    true
                }
            }
        }
    }

    /// Record a successful completion.
    pub fn record_success(&self) {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        if inner.state != BreakerState::Closed {
            info!(target: "tour.queue.breaker", "circuit closed after successful completion");
        }
        inner.state = BreakerState::Closed;
        inner.consecutive_failures = 0;
        inner.trial_admitted = false;
    }

    /// Record a failed completion.
    pub fn record_failure(&self) {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        Self::settle(&mut inner, self.reset);
        inner.consecutive_failures += 1;
        inner.last_failure = Some(Instant::now());
        let tripped = match inner.state {
            BreakerState::HalfOpen => true,
            BreakerState::Closed => inner.consecutive_failures >= self.threshold,
            BreakerState::Open => false,
        };
        if tripped {
            warn!(
                target: "tour.queue.breaker",
                consecutive_failures = inner.consecutive_failures,
                "circuit opened"
            );
            inner.state = BreakerState::Open;
        }
        inner.trial_admitted = false;
    }

    /// Promote `open` to `half_open` once the reset window has elapsed.
    fn settle(inner: &mut BreakerInner, reset: Duration) {
        if inner.state == BreakerState::Open
            && inner
                .last_failure
                .is_none_or(|at| at.elapsed() >= reset)
        {
            inner.state = BreakerState::HalfOpen;
            inner.trial_admitted = false;
        }
    }
}
