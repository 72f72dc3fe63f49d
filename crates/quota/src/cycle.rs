//! Usage cycle rollover
//!
//! Cycles are fixed-length rolling windows measured from the user's anchor:
//! cycle `k` covers `[anchor + k*L, anchor + (k+1)*L)`. Rollover is computed
//! on access inside the enforcer's transaction; there is no background job.

use time::{Duration, OffsetDateTime};

use crate::record::SubscriptionRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CycleResetScheduler {
    cycle_length: Duration,
}

impl Default for CycleResetScheduler {
    fn default() -> Self {
        Self::new(Duration::days(30))
    }
}

impl CycleResetScheduler {
    /// Non-positive lengths are bumped to one second so the arithmetic below
    /// never divides by zero
    pub fn new(cycle_length: Duration) -> Self {
        Self {
            cycle_length: cycle_length.max(Duration::SECOND),
        }
    }

    pub fn cycle_length(&self) -> Duration {
        self.cycle_length
    }

    /// True once `now` has reached the end of the cycle that starts at `anchor`.
    /// A clock behind the anchor is never stale.
    pub fn is_stale(&self, cycle_anchor: OffsetDateTime, now: OffsetDateTime) -> bool {
        now >= self.reset_at(cycle_anchor)
    }

    /// Start of the cycle containing `now`, skipping any number of missed cycles
    pub fn next_anchor(&self, cycle_anchor: OffsetDateTime, now: OffsetDateTime) -> OffsetDateTime {
        if now <= cycle_anchor {
            return cycle_anchor;
        }
        let elapsed = (now - cycle_anchor).whole_seconds();
        let length = self.cycle_length.whole_seconds();
        let cycles = elapsed / length;
        cycle_anchor + Duration::seconds(cycles * length)
    }

    /// When the cycle starting at `anchor` ends and counters reset
    pub fn reset_at(&self, cycle_anchor: OffsetDateTime) -> OffsetDateTime {
        cycle_anchor + self.cycle_length
    }

    /// Roll the record forward if its cycle is over. Returns true when a
    /// reset was applied.
    pub(crate) fn roll_over(&self, record: &mut SubscriptionRecord, now: OffsetDateTime) -> bool {
        if !self.is_stale(record.cycle_anchor, now) {
            return false;
        }
        let previous = record.cycle_anchor;
        let anchor = self.next_anchor(previous, now);
        record.reset_monthly(anchor);
        tracing::info!(
            user_id = %record.user_id,
            previous_anchor = %previous,
            cycle_anchor = %anchor,
            "Usage cycle rolled over"
        );
        true
    }
}
