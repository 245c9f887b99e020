// src/metrics/heatmap.rs
//
// Hotspot occupancy. Every interior frame adds +1 occupancy-second to each
// grid cell and zone occupied by at least one person, in the frame's time
// bucket. Counters only grow; `rotate` is the only way a bucket disappears.
//
// Accumulation is a commutative sum on sharded maps, so frames can be
// applied from any thread in any order without going through the store's
// exclusive section.

use crate::config::{CameraConfig, GridConfig, ZoneConfig};
use crate::types::{BBox, FrameDetections, ObjectClass, Timestamp};
use dashmap::DashMap;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct CellKey {
    pub bucket_start: Timestamp,
    pub camera_id: String,
    pub row: u32,
    pub col: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ZoneKey {
    pub bucket_start: Timestamp,
    pub zone: String,
}

/// What one frame contributed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HeatmapDelta {
    pub camera_id: String,
    pub bucket_start: Timestamp,
    pub cells: Vec<(u32, u32)>,
    pub zones: Vec<String>,
}

impl HeatmapDelta {
    pub fn is_empty(&self) -> bool {
        self.cells.is_empty() && self.zones.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ZoneOccupancy {
    pub zone: String,
    pub occupancy_sec: u64,
}

pub fn cell_for(grid: &GridConfig, x: f32, y: f32) -> Option<(u32, u32)> {
    if !(0.0..=grid.width).contains(&x) || !(0.0..=grid.height).contains(&y) {
        return None;
    }
    let col = ((x / grid.width) * grid.cols as f32) as u32;
    let row = ((y / grid.height) * grid.rows as f32) as u32;
    Some((row.min(grid.rows - 1), col.min(grid.cols - 1)))
}

/// Zones whose rectangle contains the box centre.
pub fn zones_containing<'a>(camera: &'a CameraConfig, bbox: &BBox) -> impl Iterator<Item = &'a ZoneConfig> {
    let (x, y) = bbox.center();
    camera.zones.iter().filter(move |z| z.rect.contains_point(x, y))
}

pub struct HeatmapAggregator {
    bucket_sec: i64,
    min_confidence: f32,
    cells: DashMap<CellKey, u64>,
    zones: DashMap<ZoneKey, u64>,
}

impl HeatmapAggregator {
    pub fn new(bucket_sec: i64, min_confidence: f32) -> Self {
        Self {
            bucket_sec: bucket_sec.max(1),
            min_confidence,
            cells: DashMap::new(),
            zones: DashMap::new(),
        }
    }

    pub fn bucket_start(&self, ts: Timestamp) -> Timestamp {
        ts - ts.rem_euclid(self.bucket_sec)
    }

    pub fn apply_frame(&self, camera: &CameraConfig, frame: &FrameDetections) -> HeatmapDelta {
        let bucket_start = self.bucket_start(frame.timestamp);
        let mut cells = BTreeSet::new();
        let mut zones = BTreeSet::new();

        for det in frame
            .usable()
            .filter(|d| d.class == ObjectClass::Person && d.confidence >= self.min_confidence)
        {
            let (x, y) = det.bbox.center();
            if let Some(grid) = &camera.grid {
                if let Some(cell) = cell_for(grid, x, y) {
                    cells.insert(cell);
                }
            }
            for zone in zones_containing(camera, &det.bbox) {
                zones.insert(zone.name.clone());
            }
        }

        for (row, col) in &cells {
            let key = CellKey {
                bucket_start,
                camera_id: camera.camera_id.clone(),
                row: *row,
                col: *col,
            };
            *self.cells.entry(key).or_insert(0) += 1;
        }
        for zone in &zones {
            let key = ZoneKey {
                bucket_start,
                zone: zone.clone(),
            };
            *self.zones.entry(key).or_insert(0) += 1;
        }

        HeatmapDelta {
            camera_id: camera.camera_id.clone(),
            bucket_start,
            cells: cells.into_iter().collect(),
            zones: zones.into_iter().collect(),
        }
    }

    pub fn cell_totals(&self) -> BTreeMap<CellKey, u64> {
        self.cells
            .iter()
            .map(|e| (e.key().clone(), *e.value()))
            .collect()
    }

    pub fn zone_totals(&self) -> BTreeMap<ZoneKey, u64> {
        self.zones
            .iter()
            .map(|e| (e.key().clone(), *e.value()))
            .collect()
    }

    /// Read-time hotspot query: zones ranked by occupancy across buckets in
    /// `[from, to)`, or all buckets when no range is given.
    pub fn top_zones(&self, n: usize, range: Option<(Timestamp, Timestamp)>) -> Vec<ZoneOccupancy> {
        let mut totals: BTreeMap<String, u64> = BTreeMap::new();
        for e in self.zones.iter() {
            let in_range = range
                .map(|(from, to)| e.key().bucket_start >= from && e.key().bucket_start < to)
                .unwrap_or(true);
            if in_range {
                *totals.entry(e.key().zone.clone()).or_insert(0) += *e.value();
            }
        }
        let mut ranked: Vec<ZoneOccupancy> = totals
            .into_iter()
            .map(|(zone, occupancy_sec)| ZoneOccupancy { zone, occupancy_sec })
            .collect();
        ranked.sort_by(|a, b| b.occupancy_sec.cmp(&a.occupancy_sec).then(a.zone.cmp(&b.zone)));
        ranked.truncate(n);
        ranked
    }

    /// Roll up: drop every bucket that started before `before`. Returns removed entries.
    pub fn rotate(&self, before: Timestamp) -> usize {
        let len = self.cells.len() + self.zones.len();
        self.cells.retain(|k, _| k.bucket_start >= before);
        self.zones.retain(|k, _| k.bucket_start >= before);
        len - (self.cells.len() + self.zones.len())
    }
}
