//! Clock-driven scheduling primitives.
//!
//! Neither type owns a timer. The host calls `take_due` / `poll` with the
//! current time (from its event loop, or a `ManualClock` in tests).

use std::time::Duration;

/// A single pending task that is pushed back every time it is rescheduled.
///
/// `schedule` replaces the pending value and resets the deadline, so rapid
/// calls coalesce into one execution carrying the latest value.
#[derive(Debug)]
pub struct Debouncer<T> {
    delay_ms: u64,
    pending: Option<Pending<T>>,
}

#[derive(Debug)]
struct Pending<T> {
    value: T,
    due_at: u64,
}

impl<T> Debouncer<T> {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay_ms: delay.as_millis() as u64,
            pending: None,
        }
    }

    /// Schedule `value`, replacing any pending value and resetting the deadline.
    pub fn schedule(&mut self, value: T, now_ms: u64) {
        self.pending = Some(Pending {
            value,
            due_at: now_ms + self.delay_ms,
        });
    }

    /// Put `value` back after a failed run unless something newer was
    /// scheduled meanwhile. Returns true if `value` was kept.
    pub fn reschedule_if_empty(&mut self, value: T, now_ms: u64) -> bool {
        if self.pending.is_some() {
            return false;
        }
        self.schedule(value, now_ms);
        true
    }

    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    pub fn due_at(&self) -> Option<u64> {
        self.pending.as_ref().map(|p| p.due_at)
    }

    /// Take the pending value if its deadline has passed.
    pub fn take_due(&mut self, now_ms: u64) -> Option<T> {
        match &self.pending {
            Some(p) if now_ms >= p.due_at => self.pending.take().map(|p| p.value),
            _ => None,
        }
    }

    /// Take the pending value regardless of its deadline.
    pub fn flush(&mut self) -> Option<T> {
        self.pending.take().map(|p| p.value)
    }

    /// Drop the pending value. Returns true if something was pending.
    pub fn cancel(&mut self) -> bool {
        self.pending.take().is_some()
    }
}

/// Fixed-period recurring deadline.
#[derive(Debug, Clone)]
pub struct Ticker {
    period_ms: u64,
    next_at: u64,
}

impl Ticker {
    pub fn new(period: Duration, now_ms: u64) -> Self {
        let period_ms = period.as_millis() as u64;
        Self {
            period_ms,
            next_at: now_ms + period_ms,
        }
    }

    /// Returns true once per elapsed period and schedules the next one.
    pub fn poll(&mut self, now_ms: u64) -> bool {
        if now_ms < self.next_at {
            return false;
        }
        self.next_at = now_ms + self.period_ms;
        true
    }

    /// Push the next deadline a full period out (after an out-of-band run).
    pub fn reset(&mut self, now_ms: u64) {
        self.next_at = now_ms + self.period_ms;
    }
}
