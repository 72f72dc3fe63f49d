//! Per-user subscription state
//!
//! Fields are readable by anyone but only this crate's managers mutate them.

use std::collections::BTreeMap;

use quotaguard_shared::{Feature, MeterKind, Tier, UserId};
use serde::Serialize;
use time::OffsetDateTime;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubscriptionRecord {
    pub(crate) user_id: UserId,
    pub(crate) tier: Tier,
    #[serde(with = "time::serde::rfc3339::option")]
    pub(crate) tier_expires_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub(crate) cycle_anchor: OffsetDateTime,
    pub(crate) monthly_counters: BTreeMap<Feature, i64>,
    pub(crate) gauge_counters: BTreeMap<Feature, i64>,
}

impl SubscriptionRecord {
    /// Fresh record on the lowest tier with the cycle anchored at `now`
    pub fn new(user_id: UserId, now: OffsetDateTime) -> Self {
        Self {
            user_id,
            tier: Tier::lowest(),
            tier_expires_at: None,
            cycle_anchor: now,
            monthly_counters: BTreeMap::new(),
            gauge_counters: BTreeMap::new(),
        }
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    pub fn tier(&self) -> Tier {
        self.tier
    }

    pub fn tier_expires_at(&self) -> Option<OffsetDateTime> {
        self.tier_expires_at
    }

    pub fn cycle_anchor(&self) -> OffsetDateTime {
        self.cycle_anchor
    }

    pub fn monthly_used(&self, feature: Feature) -> i64 {
        self.monthly_counters.get(&feature).copied().unwrap_or(0)
    }

    pub fn gauge_value(&self, feature: Feature) -> i64 {
        self.gauge_counters.get(&feature).copied().unwrap_or(0)
    }

    /// Current counter for a feature, whichever meter it uses
    pub fn counter(&self, feature: Feature) -> i64 {
        match feature.meter() {
            MeterKind::Monthly => self.monthly_used(feature),
            MeterKind::Gauge => self.gauge_value(feature),
        }
    }

    pub(crate) fn set_counter(&mut self, feature: Feature, value: i64) {
        let counters = match feature.meter() {
            MeterKind::Monthly => &mut self.monthly_counters,
            MeterKind::Gauge => &mut self.gauge_counters,
        };
        counters.insert(feature, value);
    }

    pub(crate) fn reset_monthly(&mut self, anchor: OffsetDateTime) {
        self.monthly_counters.clear();
        self.cycle_anchor = anchor;
    }

    /// Clamp negative counters and drop counters filed under the wrong meter.
    /// Returns what was corrected so the caller can log it.
    pub(crate) fn sanitize(&mut self) -> Vec<CounterCorruption> {
        let mut found = Vec::new();
        for (meter, counters) in [
            (MeterKind::Monthly, &mut self.monthly_counters),
            (MeterKind::Gauge, &mut self.gauge_counters),
        ] {
            counters.retain(|feature, value| {
                if feature.meter() != meter {
                    found.push(CounterCorruption {
                        feature: *feature,
                        meter,
                        value: *value,
                        corrected_to: None,
                    });
                    return false;
                }
                true
            });
            for (feature, value) in counters.iter_mut() {
                if *value < 0 {
                    found.push(CounterCorruption {
                        feature: *feature,
                        meter,
                        value: *value,
                        corrected_to: Some(0),
                    });
                    *value = 0;
                }
            }
        }
        found
    }
}

/// A counter that violated its invariant when loaded
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CounterCorruption {
    pub feature: Feature,
    /// Map the bad value was found in
    pub meter: MeterKind,
    pub value: i64,
    /// `None` when the entry was removed instead of clamped
    pub corrected_to: Option<i64>,
}

impl std::fmt::Display for CounterCorruption {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.corrected_to {
            Some(to) => write!(
                f,
                "{} counter for {} was {}, clamped to {}",
                self.meter, self.feature, self.value, to
            ),
            None => write!(
                f,
                "{} counter for {} does not belong to that meter (value {}), removed",
                self.meter, self.feature, self.value
            ),
        }
    }
}
