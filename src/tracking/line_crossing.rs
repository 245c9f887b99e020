// src/tracking/line_crossing.rs
//
// Entrance-line crossing detection. Each entrance-camera track's
// bottom-centre (feet) point is classified against the calibrated line;
// a committed side change produces an IN or OUT EntryExitEvent.
//
// A dead band around the line absorbs box jitter: points inside it never
// change the committed side, so a person loitering on the threshold does
// not fire a burst of crossings.

use crate::config::{LineConfig, LineSide};
use crate::types::{BBox, CrossingDirection, EntryExitEvent, TrackDelta, TrackEventKind};
use std::collections::HashMap;
use tracing::{debug, info};

pub struct LineCrossingDetector {
    store_id: String,
    camera_id: String,
    line: LineConfig,
    /// Last committed side per entrance track.
    sides: HashMap<u64, LineSide>,
}

impl LineCrossingDetector {
    pub fn new(store_id: &str, camera_id: &str, line: LineConfig) -> Self {
        Self {
            store_id: store_id.to_string(),
            camera_id: camera_id.to_string(),
            line,
            sides: HashMap::new(),
        }
    }

    /// Signed distance of the box's feet point from the line (positive = left of a -> b).
    fn signed_distance(&self, bbox: &BBox) -> f32 {
        let (cx, _) = bbox.center();
        let (px, py) = (cx, bbox.y2);
        let [ax, ay] = self.line.a;
        let [bx, by] = self.line.b;
        let len = self.line.length();
        if len <= f32::EPSILON {
            return 0.0;
        }
        ((bx - ax) * (py - ay) - (by - ay) * (px - ax)) / len
    }

    fn classify(&self, bbox: &BBox) -> Option<LineSide> {
        let d = self.signed_distance(bbox);
        if d > self.line.dead_band {
            Some(LineSide::Left)
        } else if d < -self.line.dead_band {
            Some(LineSide::Right)
        } else {
            None
        }
    }

    /// Feed this camera's track events; returns crossings in input order.
    pub fn process(&mut self, deltas: &[TrackDelta]) -> Vec<EntryExitEvent> {
        let mut crossings = Vec::new();
        for d in deltas {
            if d.kind == TrackEventKind::Ended {
                self.sides.remove(&d.track_id);
                continue;
            }
            let Some(bbox) = d.bbox else { continue };
            let Some(side) = self.classify(&bbox) else {
                continue;
            };

            match self.sides.insert(d.track_id, side) {
                Some(prev) if prev != side => {
                    let direction = if side == self.line.inside {
                        CrossingDirection::In
                    } else {
                        CrossingDirection::Out
                    };
                    info!(
                        "🚪 {} {:?} crossing by {}#{} at t={}",
                        self.store_id, direction, self.camera_id, d.track_id, d.timestamp
                    );
                    crossings.push(EntryExitEvent {
                        store_id: self.store_id.clone(),
                        camera_id: self.camera_id.clone(),
                        direction,
                        timestamp: d.timestamp,
                        source_track_id: d.track_id,
                    });
                }
                Some(_) => {}
                None => debug!(
                    "{}#{} first seen on {:?} side",
                    self.camera_id, d.track_id, side
                ),
            }
        }
        crossings
    }

    #[cfg(test)]
    pub fn tracked_count(&self) -> usize {
        self.sides.len()
    }
}
