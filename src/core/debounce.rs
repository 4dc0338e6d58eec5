//! Debounced orphan sweep.
//!
//! During fast navigation every settle would trigger a full orphan sweep. With
//! a debounce delay the sweep is postponed until the control loop has been
//! quiet for the delay:
//! 1. Each settle (re)schedules the sweep
//! 2. Any new event pushes the deadline out again
//! 3. The control loop calls `tick()` when it wakes up idle

use std::time::{Duration, Instant};

/// Deadline timer for the orphan sweep
#[derive(Debug, Clone)]
pub struct DebouncedSweep {
    delay: Duration,
    pending: Option<Instant>,
}

impl Default for DebouncedSweep {
    fn default() -> Self {
        Self {
            delay: Duration::from_millis(500),
            pending: None,
        }
    }
}

impl DebouncedSweep {
    pub fn new(delay_ms: u64) -> Self {
        Self {
            delay: Duration::from_millis(delay_ms),
            pending: None,
        }
    }

    pub fn delay_ms(&self) -> u64 {
        self.delay.as_millis() as u64
    }

    /// Schedule a sweep; an already pending one is pushed back.
    pub fn schedule(&mut self) {
        self.pending = Some(Instant::now() + self.delay);
        log::trace!("Orphan sweep scheduled in {}ms", self.delay.as_millis());
    }

    /// Push back a pending sweep without scheduling a new one.
    pub fn postpone(&mut self) {
        if self.pending.is_some() {
            self.schedule();
        }
    }

    pub fn cancel(&mut self) {
        if self.pending.take().is_some() {
            log::trace!("Orphan sweep cancelled");
        }
    }

    /// True once the deadline passed; clears the pending state.
    pub fn tick(&mut self) -> bool {
        let Some(at) = self.pending else {
            return false;
        };

        if Instant::now() >= at {
            self.pending = None;
            true
        } else {
            false
        }
    }

    /// Time left until the sweep is due (for the control loop's wait timeout)
    pub fn remaining(&self) -> Option<Duration> {
        self.pending
            .map(|at| at.saturating_duration_since(Instant::now()))
    }

    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }
}
