// src/metrics/footfall.rs
//
// Deduplicated footfall. An IN from an entrance track that crossed (either
// way) within `reentry_cooldown_sec` is a continuation, not a new visitor.

use crate::types::{CrossingDirection, EntryExitEvent, Timestamp, TrackKey};
use chrono::{DateTime, NaiveDate};
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

const HOUR_SEC: i64 = 3600;

pub struct FootfallCounter {
    cooldown_sec: i64,
    last_crossing: HashMap<TrackKey, Timestamp>,
    hourly: BTreeMap<Timestamp, u64>,
    total: u64,
    continuations: u64,
}

impl FootfallCounter {
    pub fn new(cooldown_sec: i64) -> Self {
        Self {
            cooldown_sec,
            last_crossing: HashMap::new(),
            hourly: BTreeMap::new(),
            total: 0,
            continuations: 0,
        }
    }

    /// Returns true when the event produced a footfall increment.
    pub fn record(&mut self, event: &EntryExitEvent) -> bool {
        let key = event.source_key();
        let previous = self.last_crossing.insert(key, event.timestamp);
        if event.direction == CrossingDirection::Out {
            return false;
        }

        let continuation = previous
            .map(|t| event.timestamp >= t && event.timestamp - t <= self.cooldown_sec)
            .unwrap_or(false);
        if continuation {
            self.continuations += 1;
            debug!(
                "{}#{} re-entered within {}s cooldown, not counted",
                event.camera_id, event.source_track_id, self.cooldown_sec
            );
            return false;
        }

        let hour = event.timestamp - event.timestamp.rem_euclid(HOUR_SEC);
        *self.hourly.entry(hour).or_insert(0) += 1;
        self.total += 1;
        true
    }

    /// Forget crossings that can no longer suppress a count.
    pub fn prune(&mut self, now: Timestamp) {
        let cooldown = self.cooldown_sec;
        self.last_crossing.retain(|_, t| now - *t <= cooldown);
    }

    /// Drop hourly buckets that ended before `before`. The lifetime total
    /// is unaffected.
    pub fn rotate(&mut self, before: Timestamp) -> usize {
        let keep_from = before - before.rem_euclid(HOUR_SEC);
        let len = self.hourly.len();
        self.hourly = self.hourly.split_off(&keep_from);
        len - self.hourly.len()
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn continuations(&self) -> u64 {
        self.continuations
    }

    /// Counts keyed by the start of each UTC hour.
    pub fn hourly(&self) -> &BTreeMap<Timestamp, u64> {
        &self.hourly
    }

    pub fn daily(&self) -> BTreeMap<NaiveDate, u64> {
        let mut days = BTreeMap::new();
        for (hour, count) in &self.hourly {
            if let Some(dt) = DateTime::from_timestamp(*hour, 0) {
                *days.entry(dt.date_naive()).or_insert(0) += count;
            }
        }
        days
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn crossing(ts: Timestamp, track: u64, direction: CrossingDirection) -> EntryExitEvent {
        EntryExitEvent {
            store_id: "s1".into(),
            camera_id: "D01".into(),
            direction,
            timestamp: ts,
            source_track_id: track,
        }
    }

    #[test]
    fn test_reentry_within_cooldown_counts_once() {
        let mut ff = FootfallCounter::new(60);
        assert!(ff.record(&crossing(0, 1, CrossingDirection::In)));
        assert!(!ff.record(&crossing(30, 1, CrossingDirection::In)));
        assert_eq!(ff.total(), 1);
        assert_eq!(ff.continuations(), 1);
    }

    #[test]
    fn test_reentry_after_exit_within_cooldown_is_continuation() {
        let mut ff = FootfallCounter::new(60);
        ff.record(&crossing(0, 1, CrossingDirection::In));
        ff.record(&crossing(100, 1, CrossingDirection::Out));
        assert!(!ff.record(&crossing(130, 1, CrossingDirection::In)));
        assert!(ff.record(&crossing(300, 1, CrossingDirection::In)));
        assert_eq!(ff.total(), 2);
    }

    #[test]
    fn test_different_tracks_count_separately() {
        let mut ff = FootfallCounter::new(60);
        ff.record(&crossing(0, 1, CrossingDirection::In));
        ff.record(&crossing(5, 2, CrossingDirection::In));
        assert_eq!(ff.total(), 2);
    }

    #[test]
    fn test_hourly_and_daily_buckets() {
        let mut ff = FootfallCounter::new(60);
        // 2024-03-01T10:00:00Z and 2024-03-01T11:30:00Z
        let ten = 1_709_287_200;
        ff.record(&crossing(ten + 10, 1, CrossingDirection::In));
        ff.record(&crossing(ten + 5400, 2, CrossingDirection::In));
        assert_eq!(ff.hourly().get(&ten), Some(&1));
        assert_eq!(ff.hourly().get(&(ten + 3600)), Some(&1));
        let day = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        assert_eq!(ff.daily().get(&day), Some(&2));
    }

    #[test]
    fn test_rotate_keeps_hour_containing_horizon() {
        let mut ff = FootfallCounter::new(60);
        ff.record(&crossing(10, 1, CrossingDirection::In));
        ff.record(&crossing(3700, 2, CrossingDirection::In));
        ff.record(&crossing(7300, 3, CrossingDirection::In));

        assert_eq!(ff.rotate(3600 + 1800), 1);
        assert_eq!(ff.hourly().keys().copied().collect::<Vec<_>>(), vec![3600, 7200]);
        assert_eq!(ff.total(), 3);
    }
}
