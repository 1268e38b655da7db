//! Wall-clock schedule of the periodic learning step.

use std::time::{Duration, Instant};

/// Decides when the next learning step is due
#[derive(Debug, Clone)]
pub struct StepTimer {
    interval: Duration,
    next_due: Option<Instant>,
}

impl StepTimer {
    /// Start a timer whose first step is due one interval after `now`
    pub fn new(interval: Duration, now: Instant) -> Self {
        StepTimer {
            interval,
            next_due: Some(now + interval),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn next_due(&self) -> Option<Instant> {
        self.next_due
    }

    pub fn is_due(&self, now: Instant) -> bool {
        self.next_due.map_or(false, |due| now >= due)
    }

    /// Schedule the next step one interval after `now`
    pub fn reschedule(&mut self, now: Instant) {
        if self.next_due.is_some() {
            self.next_due = Some(now + self.interval);
        }
    }

    /// Make a step due no later than `now`
    pub fn expedite(&mut self, now: Instant) {
        if let Some(due) = self.next_due {
            self.next_due = Some(due.min(now));
        }
    }

    pub fn cancel(&mut self) {
        self.next_due = None;
    }

    pub fn is_cancelled(&self) -> bool {
        self.next_due.is_none()
    }
}
