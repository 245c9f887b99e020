// src/pipeline/metrics.rs
//
// Production observability. Counts what every stage did, shared by all
// stores of an engine. Export via logs or the run summary.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug, Clone)]
pub struct PipelineMetrics {
    pub frames: Arc<AtomicU64>,
    pub detection_errors: Arc<AtomicU64>,
    pub tracks_started: Arc<AtomicU64>,
    pub tracks_ended: Arc<AtomicU64>,
    pub entries: Arc<AtomicU64>,
    pub exits: Arc<AtomicU64>,
    pub unmatched_exits: Arc<AtomicU64>,
    pub duplicate_entries: Arc<AtomicU64>,
    pub late_events: Arc<AtomicU64>,
    pub duplicate_events: Arc<AtomicU64>,
    pub visits_started: Arc<AtomicU64>,
    pub visits_closed: Arc<AtomicU64>,
    pub visits_bounced: Arc<AtomicU64>,
    pub visits_timed_out: Arc<AtomicU64>,
    pub alerts: Arc<AtomicU64>,
    pub risk_dropped: Arc<AtomicU64>,
    pub terminal_noops: Arc<AtomicU64>,
    pub rejected_events: Arc<AtomicU64>,
    pub started_at: Instant,
}

impl Default for PipelineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineMetrics {
    pub fn new() -> Self {
        Self {
            frames: Arc::new(AtomicU64::new(0)),
            detection_errors: Arc::new(AtomicU64::new(0)),
            tracks_started: Arc::new(AtomicU64::new(0)),
            tracks_ended: Arc::new(AtomicU64::new(0)),
            entries: Arc::new(AtomicU64::new(0)),
            exits: Arc::new(AtomicU64::new(0)),
            unmatched_exits: Arc::new(AtomicU64::new(0)),
            duplicate_entries: Arc::new(AtomicU64::new(0)),
            late_events: Arc::new(AtomicU64::new(0)),
            duplicate_events: Arc::new(AtomicU64::new(0)),
            visits_started: Arc::new(AtomicU64::new(0)),
            visits_closed: Arc::new(AtomicU64::new(0)),
            visits_bounced: Arc::new(AtomicU64::new(0)),
            visits_timed_out: Arc::new(AtomicU64::new(0)),
            alerts: Arc::new(AtomicU64::new(0)),
            risk_dropped: Arc::new(AtomicU64::new(0)),
            terminal_noops: Arc::new(AtomicU64::new(0)),
            rejected_events: Arc::new(AtomicU64::new(0)),
            started_at: Instant::now(),
        }
    }

    pub fn inc(&self, counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self, counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }

    pub fn frames_per_sec(&self) -> f64 {
        let frames = self.frames.load(Ordering::Relaxed);
        let elapsed = self.started_at.elapsed().as_secs_f64();
        if elapsed > 0.01 {
            frames as f64 / elapsed
        } else {
            0.0
        }
    }

    pub fn summary(&self) -> MetricsSummary {
        let load = |c: &Arc<AtomicU64>| c.load(Ordering::Relaxed);
        MetricsSummary {
            frames: load(&self.frames),
            frames_per_sec: self.frames_per_sec(),
            detection_errors: load(&self.detection_errors),
            tracks_started: load(&self.tracks_started),
            tracks_ended: load(&self.tracks_ended),
            entries: load(&self.entries),
            exits: load(&self.exits),
            unmatched_exits: load(&self.unmatched_exits),
            duplicate_entries: load(&self.duplicate_entries),
            late_events: load(&self.late_events),
            duplicate_events: load(&self.duplicate_events),
            visits_started: load(&self.visits_started),
            visits_closed: load(&self.visits_closed),
            visits_bounced: load(&self.visits_bounced),
            visits_timed_out: load(&self.visits_timed_out),
            alerts: load(&self.alerts),
            risk_dropped: load(&self.risk_dropped),
            terminal_noops: load(&self.terminal_noops),
            rejected_events: load(&self.rejected_events),
            elapsed_secs: self.started_at.elapsed().as_secs_f64(),
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct MetricsSummary {
    pub frames: u64,
    pub frames_per_sec: f64,
    pub detection_errors: u64,
    pub tracks_started: u64,
    pub tracks_ended: u64,
    pub entries: u64,
    pub exits: u64,
    pub unmatched_exits: u64,
    pub duplicate_entries: u64,
    pub late_events: u64,
    pub duplicate_events: u64,
    pub visits_started: u64,
    pub visits_closed: u64,
    pub visits_bounced: u64,
    pub visits_timed_out: u64,
    pub alerts: u64,
    pub risk_dropped: u64,
    pub terminal_noops: u64,
    pub rejected_events: u64,
    pub elapsed_secs: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clones_share_counters() {
        let metrics = PipelineMetrics::new();
        let other = metrics.clone();
        other.inc(&other.alerts);
        metrics.inc(&metrics.alerts);
        assert_eq!(metrics.summary().alerts, 2);
    }
}
