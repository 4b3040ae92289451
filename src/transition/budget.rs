// =============================================================================
// Daily Transition Budget
// =============================================================================
//
// Two limits per local calendar day:
//   1. Count  - executed transitions
//   2. Cost   - cumulative actual cost, percent of the exposure transitioned
//
// Counters live on the transition manager (no ambient state) and are reset by
// an explicit `maybe_reset` at the top of every gating call.
// =============================================================================

use chrono::{DateTime, Local, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyBudget {
    pub date: NaiveDate,
    pub transitions: u32,
    /// Sum of actual cost amounts today.
    pub cost: f64,
    /// Sum of actual cost percentages today.
    pub cost_pct: f64,
}

impl DailyBudget {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            date: local_date(now),
            transitions: 0,
            cost: 0.0,
            cost_pct: 0.0,
        }
    }

    /// Reset the counters if the local date rolled since the last call.
    /// Returns true when a reset happened.
    pub fn maybe_reset(&mut self, now: DateTime<Utc>) -> bool {
        let today = local_date(now);
        if self.date == today {
            return false;
        }
        info!(
            old_date = %self.date,
            new_date = %today,
            transitions = self.transitions,
            "date rolled - resetting daily transition budget"
        );
        *self = Self::new(now);
        true
    }

    /// `(true, None)` when another transition fits, otherwise `(false,
    /// Some(reason))`.
    pub fn can_transition(&self, max_transitions: u32, max_cost_pct: f64) -> (bool, Option<String>) {
        if self.transitions >= max_transitions {
            return (
                false,
                Some(format!(
                    "daily limit reached: {} transitions today (limit {max_transitions})",
                    self.transitions
                )),
            );
        }
        if self.cost_pct >= max_cost_pct {
            return (
                false,
                Some(format!(
                    "daily limit reached: {:.3}% cost today (limit {max_cost_pct:.3}%)",
                    self.cost_pct
                )),
            );
        }
        (true, None)
    }

    /// Counters belong to the local day of `now`.
    pub fn is_current(&self, now: DateTime<Utc>) -> bool {
        self.date == local_date(now)
    }

    pub fn record(&mut self, cost: f64, cost_pct: f64, now: DateTime<Utc>) {
        self.maybe_reset(now);
        self.transitions += 1;
        self.cost += cost;
        self.cost_pct += cost_pct;
    }
}

fn local_date(now: DateTime<Utc>) -> NaiveDate {
    now.with_timezone(&Local).date_naive()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn count_limit_trips() {
        let now = Utc::now();
        let mut b = DailyBudget::new(now);
        assert!(b.can_transition(2, 3.0).0);
        b.record(1.0, 0.1, now);
        b.record(1.0, 0.1, now);
        let (ok, reason) = b.can_transition(2, 3.0);
        assert!(!ok);
        assert!(reason.unwrap().contains("daily limit reached"));
    }

    #[test]
    fn cost_limit_trips() {
        let now = Utc::now();
        let mut b = DailyBudget::new(now);
        b.record(30.0, 3.5, now);
        let (ok, reason) = b.can_transition(10, 3.0);
        assert!(!ok);
        assert!(reason.unwrap().contains("cost today"));
    }

    #[test]
    fn resets_on_new_day() {
        let now = Utc::now();
        let mut b = DailyBudget::new(now);
        b.record(1.0, 0.1, now);
        assert!(!b.maybe_reset(now));
        assert!(b.maybe_reset(now + Duration::days(1)));
        assert_eq!(b.transitions, 0);
        assert!(b.cost_pct.abs() < f64::EPSILON);
    }
}
