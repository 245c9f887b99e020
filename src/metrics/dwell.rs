// src/metrics/dwell.rs
//
// Dwell and bounce. store_dwell (entry -> exit) is the canonical metric;
// observed dwell only exists when at least one interior track was linked.
//
// Visits closed by timeout have an inferred exit (last activity, or the entry
// itself when nothing was ever linked). Their dwell is not a measurement, so
// they are counted in `timed_out` and kept out of the mean and the bounce rate.

use crate::types::{Timestamp, Visit};
use serde::Serialize;

pub fn store_dwell(entry_ts: Timestamp, exit_ts: Timestamp) -> i64 {
    (exit_ts - entry_ts).max(0)
}

pub fn is_bounce(store_dwell_sec: i64, bounce_threshold_sec: i64) -> bool {
    store_dwell_sec < bounce_threshold_sec
}

/// `last_seen_inside - first_seen_inside` over the linked tracks' spans.
pub fn observed_dwell<I>(spans: I) -> Option<i64>
where
    I: IntoIterator<Item = (Timestamp, Timestamp)>,
{
    spans
        .into_iter()
        .fold(None, |acc: Option<(Timestamp, Timestamp)>, (first, last)| match acc {
            None => Some((first, last)),
            Some((lo, hi)) => Some((lo.min(first), hi.max(last))),
        })
        .map(|(lo, hi)| (hi - lo).max(0))
}

/// Running totals over closed visits.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DwellStats {
    pub closed: u64,
    /// Closed with an inferred exit; excluded from every rate below.
    pub timed_out: u64,
    pub bounced: u64,
    pub total_store_dwell_sec: i64,
    pub observed_dwell_visits: u64,
}

impl DwellStats {
    pub fn record(&mut self, visit: &Visit) {
        let Some(dwell) = visit.store_dwell_sec else {
            return;
        };
        self.closed += 1;
        if visit.observed_dwell_sec.is_some() {
            self.observed_dwell_visits += 1;
        }
        if visit.inferred_endpoint {
            self.timed_out += 1;
            return;
        }
        self.total_store_dwell_sec += dwell;
        if visit.bounce_flag == Some(true) {
            self.bounced += 1;
        }
    }

    /// Visits with an observed exit.
    pub fn measured(&self) -> u64 {
        self.closed - self.timed_out
    }

    pub fn mean_store_dwell_sec(&self) -> Option<f64> {
        let n = self.measured();
        (n > 0).then(|| self.total_store_dwell_sec as f64 / n as f64)
    }

    pub fn bounce_rate(&self) -> Option<f64> {
        let n = self.measured();
        (n > 0).then(|| self.bounced as f64 / n as f64)
    }
}
