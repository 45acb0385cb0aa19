//! Elapsed-time scheduling over the monotonic millisecond tick.
//!
//! Tick counts wrap; comparisons use the wrap-tolerant signed-difference
//! form. Nothing here persists across restarts.

use crate::release::ReleaseCheckState;

pub type Ticks = u32;

/// Re-check one hour after a failed release check.
pub const RECHECK_AFTER_ERROR: Ticks = 60 * 60 * 1000;
/// Re-check twelve hours after a successful one.
pub const RECHECK_PERIOD: Ticks = 12 * 60 * 60 * 1000;
/// Backstop delay before re-issuing a deferred scan the link never unblocked.
pub const SCAN_RETRY_DELAY: Ticks = 5 * 1000;

/// True when `now` is at or past `a` in wrapping tick arithmetic.
pub fn time_after_or_equal(now: Ticks, a: Ticks) -> bool {
    (a.wrapping_sub(now) as i32) <= 0
}

pub fn is_expired(start: Ticks, now: Ticks, delay: Ticks) -> bool {
    time_after_or_equal(now, start.wrapping_add(delay))
}

/// Decides when the periodic release re-check is due.
#[derive(Debug, Default)]
pub struct CheckSchedule {
    last_check: Option<Ticks>,
}

impl CheckSchedule {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that a check started now.
    pub fn mark(&mut self, now: Ticks) {
        self.last_check = Some(now);
    }

    /// A check is due immediately after boot, one hour after an error and
    /// twelve hours after a completed check.
    pub fn due(&self, now: Ticks, state: &ReleaseCheckState) -> bool {
        match self.last_check {
            None => true,
            Some(start) => {
                let delay = match state {
                    ReleaseCheckState::Error => RECHECK_AFTER_ERROR,
                    _ => RECHECK_PERIOD,
                };
                is_expired(start, now, delay)
            }
        }
    }
}
