// src/pipeline/reorder_buffer.rs
//
// Bounded-lateness reorder buffer, one per store. Items are held until the
// highest timestamp seen is `lateness` seconds past them, then released in
// (timestamp, rank, arrival) order. Once a cutoff has been released, any
// item at or before it is late and discarded; an exact duplicate of a
// buffered item is dropped.

use crate::types::Timestamp;
use std::collections::BTreeMap;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Accepted,
    Late,
    Duplicate,
}

pub struct ReorderBuffer<T> {
    lateness: i64,
    entries: BTreeMap<(Timestamp, u8, u64), T>,
    next_seq: u64,
    max_seen: Option<Timestamp>,
    released_through: Option<Timestamp>,
}

impl<T: PartialEq> ReorderBuffer<T> {
    pub fn new(lateness: i64) -> Self {
        Self {
            lateness: lateness.max(0),
            entries: BTreeMap::new(),
            next_seq: 0,
            max_seen: None,
            released_through: None,
        }
    }

    /// `rank` orders items that share a timestamp.
    pub fn push(&mut self, ts: Timestamp, rank: u8, item: T) -> PushOutcome {
        if let Some(released) = self.released_through {
            if ts <= released {
                warn!(
                    "late event t={} discarded (already released through t={})",
                    ts, released
                );
                return PushOutcome::Late;
            }
        }
        let duplicate = self
            .entries
            .range((ts, rank, 0)..=(ts, rank, u64::MAX))
            .any(|(_, existing)| *existing == item);
        if duplicate {
            debug!("duplicate event t={} dropped", ts);
            return PushOutcome::Duplicate;
        }

        self.entries.insert((ts, rank, self.next_seq), item);
        self.next_seq += 1;
        self.observe(ts);
        PushOutcome::Accepted
    }

    /// Advance event time without an item (e.g. an empty frame).
    pub fn observe(&mut self, ts: Timestamp) {
        self.max_seen = Some(self.max_seen.map_or(ts, |m| m.max(ts)));
    }

    /// Items whose lateness window has passed, in order.
    pub fn pop_ready(&mut self) -> Vec<(Timestamp, T)> {
        match self.max_seen {
            Some(max) => self.release_through(max - self.lateness),
            None => Vec::new(),
        }
    }

    /// Everything still buffered, in order.
    pub fn drain(&mut self) -> Vec<(Timestamp, T)> {
        match self.entries.keys().next_back().map(|k| k.0) {
            Some(last) => self.release_through(last),
            None => Vec::new(),
        }
    }

    fn release_through(&mut self, cutoff: Timestamp) -> Vec<(Timestamp, T)> {
        let keep = self.entries.split_off(&(cutoff + 1, 0, 0));
        let ready = std::mem::replace(&mut self.entries, keep);
        self.released_through = Some(self.released_through.map_or(cutoff, |r| r.max(cutoff)));
        ready.into_iter().map(|((ts, _, _), item)| (ts, item)).collect()
    }

    /// Event time up to which everything has been released.
    pub fn released_through(&self) -> Option<Timestamp> {
        self.released_through
    }

    pub fn max_seen(&self) -> Option<Timestamp> {
        self.max_seen
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reorders_within_lateness() {
        let mut buf = ReorderBuffer::new(5);
        buf.push(10, 0, "b");
        buf.push(8, 0, "a");
        assert!(buf.pop_ready().is_empty(), "nothing is 5s old yet");
        buf.push(14, 0, "c");
        let ready: Vec<_> = buf.pop_ready().into_iter().map(|(_, v)| v).collect();
        assert_eq!(ready, vec!["a"]);
        let rest: Vec<_> = buf.drain().into_iter().map(|(_, v)| v).collect();
        assert_eq!(rest, vec!["b", "c"]);
    }

    #[test]
    fn test_rank_orders_same_timestamp() {
        let mut buf = ReorderBuffer::new(0);
        buf.push(5, 2, "out");
        buf.push(5, 0, "track");
        buf.push(5, 1, "in");
        let order: Vec<_> = buf.drain().into_iter().map(|(_, v)| v).collect();
        assert_eq!(order, vec!["track", "in", "out"]);
    }

    #[test]
    fn test_late_event_is_discarded() {
        let mut buf = ReorderBuffer::new(2);
        buf.push(10, 0, 1);
        buf.push(20, 0, 2);
        assert_eq!(buf.pop_ready().len(), 1);
        assert_eq!(buf.released_through(), Some(18));
        assert_eq!(buf.push(9, 0, 3), PushOutcome::Late);
        assert_eq!(buf.push(18, 0, 4), PushOutcome::Late);
        assert_eq!(buf.push(19, 0, 5), PushOutcome::Accepted);
    }

    #[test]
    fn test_exact_duplicate_dropped() {
        let mut buf = ReorderBuffer::new(5);
        assert_eq!(buf.push(3, 1, "in#4"), PushOutcome::Accepted);
        assert_eq!(buf.push(3, 1, "in#4"), PushOutcome::Duplicate);
        assert_eq!(buf.len(), 1);
    }

    #[test]
    fn test_observe_releases_without_items() {
        let mut buf = ReorderBuffer::new(3);
        buf.push(1, 0, "x");
        buf.observe(4);
        assert_eq!(buf.pop_ready().len(), 1);
    }
}
