// src/metrics/summary.rs
//
// Per-store reporting: camera hotspot ranking, the busiest time bucket, and
// the roll-up summary the binary prints at the end of a run.

use crate::metrics::dwell::DwellStats;
use crate::metrics::heatmap::ZoneOccupancy;
use crate::types::Timestamp;
use chrono::{DateTime, NaiveDate};
use serde::Serialize;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CameraActivity {
    pub frames: u64,
    /// Frames with at least one person.
    pub relevant_frames: u64,
    pub total_people: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CameraHotspot {
    pub camera_id: String,
    pub relevant_frames: u64,
    pub total_people: u64,
    pub avg_people_per_relevant_frame: f64,
    pub hotspot_rank: usize,
}

pub struct ActivityLog {
    peak_bucket_sec: i64,
    cameras: BTreeMap<String, CameraActivity>,
    people_per_bucket: BTreeMap<Timestamp, u64>,
}

impl ActivityLog {
    pub fn new(peak_bucket_sec: i64) -> Self {
        Self {
            peak_bucket_sec: peak_bucket_sec.max(1),
            cameras: BTreeMap::new(),
            people_per_bucket: BTreeMap::new(),
        }
    }

    /// Make a camera appear in the ranking even if it never records a frame.
    pub fn register_camera(&mut self, camera_id: &str) {
        self.cameras.entry(camera_id.to_string()).or_default();
    }

    pub fn record_frame(&mut self, camera_id: &str, ts: Timestamp, person_count: u64) {
        let cam = self.cameras.entry(camera_id.to_string()).or_default();
        cam.frames += 1;
        if person_count > 0 {
            cam.relevant_frames += 1;
            cam.total_people += person_count;
            let bucket = ts - ts.rem_euclid(self.peak_bucket_sec);
            *self.people_per_bucket.entry(bucket).or_insert(0) += person_count;
        }
    }

    /// Cameras ranked by average people per relevant frame, then total people,
    /// then camera id. Idle cameras rank last with zeros.
    pub fn camera_ranking(&self) -> Vec<CameraHotspot> {
        let mut rows: Vec<CameraHotspot> = self
            .cameras
            .iter()
            .map(|(camera_id, a)| {
                let avg = if a.relevant_frames > 0 {
                    a.total_people as f64 / a.relevant_frames as f64
                } else {
                    0.0
                };
                CameraHotspot {
                    camera_id: camera_id.clone(),
                    relevant_frames: a.relevant_frames,
                    total_people: a.total_people,
                    avg_people_per_relevant_frame: (avg * 1000.0).round() / 1000.0,
                    hotspot_rank: 0,
                }
            })
            .collect();
        rows.sort_by(|a, b| {
            b.avg_people_per_relevant_frame
                .partial_cmp(&a.avg_people_per_relevant_frame)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(b.total_people.cmp(&a.total_people))
                .then(a.camera_id.cmp(&b.camera_id))
        });
        for (i, row) in rows.iter_mut().enumerate() {
            row.hotspot_rank = i + 1;
        }
        rows
    }

    /// Drop people buckets that ended before `before`. Per-camera totals
    /// are lifetime counters and stay.
    pub fn rotate(&mut self, before: Timestamp) -> usize {
        let keep_from = before - before.rem_euclid(self.peak_bucket_sec);
        let len = self.people_per_bucket.len();
        self.people_per_bucket = self.people_per_bucket.split_off(&keep_from);
        len - self.people_per_bucket.len()
    }

    /// Bucket with the most people; earliest wins ties.
    pub fn peak_bucket(&self) -> Option<Timestamp> {
        self.people_per_bucket
            .iter()
            .fold(None, |best: Option<(Timestamp, u64)>, (bucket, people)| match best {
                Some((_, top)) if top >= *people => best,
                _ => Some((*bucket, *people)),
            })
            .map(|(bucket, _)| bucket)
    }
}

/// Roll-up for one store. `mean_store_dwell_sec` and `bounce_rate` only
/// cover visits with an observed exit; timeouts are reported in
/// `dwell.timed_out`. Time-bucketed fields only reach back `retention_sec`.
#[derive(Debug, Clone, Serialize)]
pub struct StoreSummary {
    pub store_id: String,
    pub footfall: u64,
    pub footfall_continuations: u64,
    /// Keyed by the UTC hour, "YYYY-MM-DDTHH:00Z".
    pub footfall_hourly: BTreeMap<String, u64>,
    pub footfall_daily: BTreeMap<NaiveDate, u64>,
    pub visits_started: u64,
    pub visits_open: usize,
    pub dwell: DwellStats,
    pub mean_store_dwell_sec: Option<f64>,
    pub bounce_rate: Option<f64>,
    pub alerts: u64,
    pub images_total: u64,
    pub images_valid: u64,
    /// Heatmap deltas dropped from the outbound queue.
    pub events_dropped: u64,
    /// Live tracks per camera at the time of the summary.
    pub active_tracks: BTreeMap<String, usize>,
    pub top_camera_hotspot: Option<String>,
    /// "HH:MM" (UTC) of the busiest bucket.
    pub peak_time_bucket: Option<String>,
    pub camera_hotspots: Vec<CameraHotspot>,
    pub top_zones: Vec<ZoneOccupancy>,
}

pub fn format_bucket(ts: Timestamp) -> Option<String> {
    DateTime::from_timestamp(ts, 0).map(|dt| dt.format("%H:%M").to_string())
}

pub fn format_hour(ts: Timestamp) -> Option<String> {
    DateTime::from_timestamp(ts, 0).map(|dt| dt.format("%Y-%m-%dT%H:00Z").to_string())
}
