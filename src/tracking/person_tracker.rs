// src/tracking/person_tracker.rs
//
// Tracking-by-detection for a single camera at ~1 Hz.
//
// Design:
//   - Greedy assignment on a combined score: IoU against the motion-predicted
//     box plus normalised centroid proximity (people move a lot between
//     one-second frames, so IoU alone drops tracks)
//   - Unmatched tracks coast for `max_missed_frames` before ending
//   - Unmatched detections start new tracks; ids are camera-local and never reused
//   - Bag detections attach to the nearest person box that contains them
//
// Sparse or broken input is never an error: a dropped frame is a gap, an
// error frame is an empty frame, malformed boxes are skipped.

use crate::config::TrackerSettings;
use crate::types::{
    BBox, Detection, FrameDetections, ObjectClass, Timestamp, Track, TrackDelta, TrackEventKind,
    TrackPoint, TrackState,
};
use tracing::debug;

// ============================================================================
// LIVE TRACK
// ============================================================================

#[derive(Debug, Clone)]
struct LiveTrack {
    track: Track,
    /// Pixels per second, estimated from the last two hits.
    velocity: (f32, f32),
    last_bbox: BBox,
    last_seen: Timestamp,
}

impl LiveTrack {
    fn new(camera_id: &str, id: u64, det: &Detection, ts: Timestamp) -> Self {
        Self {
            track: Track {
                camera_id: camera_id.to_string(),
                id,
                start_ts: ts,
                end_ts: None,
                positions: vec![TrackPoint {
                    timestamp: ts,
                    bbox: det.bbox,
                }],
                bag_sightings: Vec::new(),
                state: TrackState::Active,
            },
            velocity: (0.0, 0.0),
            last_bbox: det.bbox,
            last_seen: ts,
        }
    }

    fn predicted_bbox(&self, ts: Timestamp) -> BBox {
        let dt = (ts - self.last_seen).max(0) as f32;
        self.last_bbox
            .translate(self.velocity.0 * dt, self.velocity.1 * dt)
    }

    fn missed_frames(&self, ts: Timestamp, interval: i64) -> i64 {
        (ts - self.last_seen) / interval
    }

    fn update_with_detection(&mut self, det: &Detection, ts: Timestamp) {
        let dt = (ts - self.last_seen).max(1) as f32;
        let (px, py) = self.last_bbox.center();
        let (cx, cy) = det.bbox.center();
        self.velocity = ((cx - px) / dt, (cy - py) / dt);
        self.last_bbox = det.bbox;
        self.last_seen = ts;
        self.track.positions.push(TrackPoint {
            timestamp: ts,
            bbox: det.bbox,
        });
    }

    fn end(&mut self) {
        self.track.state = TrackState::Ended;
        self.track.end_ts = Some(self.last_seen);
    }
}

fn delta(track: &Track, kind: TrackEventKind, ts: Timestamp, bbox: Option<BBox>, bag: bool) -> TrackDelta {
    TrackDelta {
        camera_id: track.camera_id.clone(),
        track_id: track.id,
        kind,
        timestamp: ts,
        bbox,
        bag_seen: bag,
    }
}

// ============================================================================
// TRACKER
// ============================================================================

pub struct PersonTracker {
    camera_id: String,
    config: TrackerSettings,
    tracks: Vec<LiveTrack>,
    next_id: u64,
    last_frame_ts: Option<Timestamp>,
}

impl PersonTracker {
    pub fn new(camera_id: &str, config: TrackerSettings) -> Self {
        Self {
            camera_id: camera_id.to_string(),
            config,
            tracks: Vec::with_capacity(16),
            next_id: 1,
            last_frame_ts: None,
        }
    }

    /// Process one frame. Returns the track create/update/end events it caused.
    pub fn update(&mut self, frame: &FrameDetections) -> Vec<TrackDelta> {
        let ts = frame.timestamp;
        if let Some(last) = self.last_frame_ts {
            if ts <= last {
                debug!(
                    "{}: ignoring stale frame t={} (last t={})",
                    self.camera_id, ts, last
                );
                return Vec::new();
            }
        }
        self.last_frame_ts = Some(ts);

        let mut events = Vec::new();
        let interval = self.config.frame_interval_sec;
        let max_missed = self.config.max_missed_frames as i64;

        // Tracks that already exceeded the grace window cannot be matched.
        self.end_tracks(|t| t.missed_frames(ts, interval) - 1 > max_missed, ts, &mut events);

        let persons: Vec<&Detection> = frame
            .usable()
            .filter(|d| d.class == ObjectClass::Person && d.confidence >= self.config.min_confidence)
            .collect();
        let bags: Vec<&Detection> = frame
            .usable()
            .filter(|d| d.class == ObjectClass::Bag && d.confidence >= self.config.min_confidence)
            .collect();

        // ════════════════════════════════════════════════════════════════════
        // ASSOCIATION
        // ════════════════════════════════════════════════════════════════════
        let mut pairs: Vec<(usize, usize, f32)> = Vec::new();
        for (ti, live) in self.tracks.iter().enumerate() {
            let predicted = live.predicted_bbox(ts);
            let (tx, ty) = predicted.center();
            for (di, det) in persons.iter().enumerate() {
                let (dx, dy) = det.bbox.center();
                let dist = ((tx - dx).powi(2) + (ty - dy).powi(2)).sqrt();
                let proximity = (1.0 - dist / self.config.max_centroid_distance).max(0.0);
                let score = self.config.iou_weight * predicted.iou(&det.bbox)
                    + (1.0 - self.config.iou_weight) * proximity;
                if score >= self.config.min_match_score && score > 0.0 {
                    pairs.push((ti, di, score));
                }
            }
        }
        pairs.sort_by(|a, b| {
            b.2.partial_cmp(&a.2)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.0.cmp(&b.0))
                .then(a.1.cmp(&b.1))
        });

        let mut track_matched = vec![false; self.tracks.len()];
        let mut det_owner: Vec<Option<usize>> = vec![None; persons.len()];
        for (ti, di, _) in &pairs {
            if track_matched[*ti] || det_owner[*di].is_some() {
                continue;
            }
            track_matched[*ti] = true;
            det_owner[*di] = Some(*ti);
            self.tracks[*ti].update_with_detection(persons[*di], ts);
        }

        // ════════════════════════════════════════════════════════════════════
        // NEW TRACKS
        // ════════════════════════════════════════════════════════════════════
        let mut started = vec![false; persons.len()];
        for (di, owner) in det_owner.iter_mut().enumerate() {
            if owner.is_none() {
                let live = LiveTrack::new(&self.camera_id, self.next_id, persons[di], ts);
                debug!("{}: new track T{} at t={}", self.camera_id, self.next_id, ts);
                self.next_id += 1;
                self.tracks.push(live);
                *owner = Some(self.tracks.len() - 1);
                started[di] = true;
            }
        }

        // ════════════════════════════════════════════════════════════════════
        // BAG ATTACHMENT
        // ════════════════════════════════════════════════════════════════════
        let mut bag_on_det = vec![false; persons.len()];
        for bag in &bags {
            let (bx, by) = bag.bbox.center();
            let nearest = persons
                .iter()
                .enumerate()
                .filter(|(_, p)| p.bbox.expand(self.config.bag_attach_margin).contains_point(bx, by))
                .min_by(|(_, a), (_, b)| {
                    let da = dist_sq(a.bbox.center(), (bx, by));
                    let db = dist_sq(b.bbox.center(), (bx, by));
                    da.partial_cmp(&db).unwrap_or(std::cmp::Ordering::Equal)
                })
                .map(|(di, _)| di);
            if let Some(di) = nearest {
                bag_on_det[di] = true;
            }
        }

        for (di, owner) in det_owner.iter().enumerate() {
            let Some(ti) = owner else { continue };
            let live = &mut self.tracks[*ti];
            if bag_on_det[di] {
                live.track.bag_sightings.push(ts);
            }
            let kind = if started[di] {
                TrackEventKind::Started
            } else {
                TrackEventKind::Updated
            };
            events.push(delta(&live.track, kind, ts, Some(live.last_bbox), bag_on_det[di]));
        }

        // ════════════════════════════════════════════════════════════════════
        // COAST / END
        // ════════════════════════════════════════════════════════════════════
        self.end_tracks(|t| t.missed_frames(ts, interval) > max_missed, ts, &mut events);

        events
    }

    /// End tracks whose grace window has run out by `now`, without a new frame.
    pub fn expire(&mut self, now: Timestamp) -> Vec<TrackDelta> {
        let interval = self.config.frame_interval_sec;
        let max_missed = self.config.max_missed_frames as i64;
        let mut events = Vec::new();
        self.end_tracks(|t| t.missed_frames(now, interval) > max_missed, now, &mut events);
        events
    }

    fn end_tracks<F>(&mut self, should_end: F, ts: Timestamp, events: &mut Vec<TrackDelta>)
    where
        F: Fn(&LiveTrack) -> bool,
    {
        let camera_id = &self.camera_id;
        self.tracks.retain_mut(|live| {
            if !should_end(live) {
                return true;
            }
            live.end();
            debug!(
                "{}: track T{} ended (last seen t={}, {} positions)",
                camera_id,
                live.track.id,
                live.last_seen,
                live.track.positions.len()
            );
            events.push(delta(&live.track, TrackEventKind::Ended, ts, None, false));
            false
        });
    }

    #[cfg(test)]
    pub fn get_track(&self, id: u64) -> Option<&Track> {
        self.tracks.iter().map(|t| &t.track).find(|t| t.id == id)
    }

    pub fn active_count(&self) -> usize {
        self.tracks.len()
    }
}

fn dist_sq(a: (f32, f32), b: (f32, f32)) -> f32 {
    (a.0 - b.0).powi(2) + (a.1 - b.1).powi(2)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn det(ts: Timestamp, x1: f32, y1: f32, x2: f32, y2: f32, class: ObjectClass) -> Detection {
        Detection {
            camera_id: "D02".into(),
            timestamp: ts,
            bbox: BBox::new(x1, y1, x2, y2),
            class,
            confidence: 0.8,
        }
    }

    fn frame(ts: Timestamp, detections: Vec<Detection>) -> FrameDetections {
        FrameDetections {
            camera_id: "D02".into(),
            timestamp: ts,
            detections,
            detection_error: None,
        }
    }

    fn person_at(ts: Timestamp, x: f32) -> Detection {
        det(ts, x, 100.0, x + 60.0, 260.0, ObjectClass::Person)
    }

    #[test]
    fn test_track_continues_across_frames() {
        let mut tracker = PersonTracker::new("D02", TrackerSettings::default());
        let e0 = tracker.update(&frame(0, vec![person_at(0, 100.0)]));
        assert_eq!(e0.len(), 1);
        assert_eq!(e0[0].kind, TrackEventKind::Started);

        // person walks 40px per second
        for t in 1..5 {
            let e = tracker.update(&frame(t, vec![person_at(t, 100.0 + 40.0 * t as f32)]));
            assert_eq!(e.len(), 1);
            assert_eq!(e[0].kind, TrackEventKind::Updated);
            assert_eq!(e[0].track_id, e0[0].track_id, "track id should be stable");
        }
        assert_eq!(tracker.active_count(), 1);
        assert_eq!(tracker.get_track(e0[0].track_id).unwrap().positions.len(), 5);
    }

    #[test]
    fn test_track_survives_short_gap() {
        let mut tracker = PersonTracker::new("D02", TrackerSettings::default());
        let first = tracker.update(&frame(0, vec![person_at(0, 100.0)]))[0].track_id;
        // frames 1 and 2 empty / dropped
        tracker.update(&frame(1, vec![]));
        let e = tracker.update(&frame(3, vec![person_at(3, 110.0)]));
        assert_eq!(e.len(), 1);
        assert_eq!(e[0].track_id, first);
        assert_eq!(e[0].kind, TrackEventKind::Updated);
    }

    #[test]
    fn test_track_ends_after_grace_window() {
        let mut tracker = PersonTracker::new("D02", TrackerSettings::default());
        tracker.update(&frame(0, vec![person_at(0, 100.0)]));
        let mut ended = Vec::new();
        for t in 1..=5 {
            ended.extend(
                tracker
                    .update(&frame(t, vec![]))
                    .into_iter()
                    .filter(|e| e.kind == TrackEventKind::Ended),
            );
        }
        assert_eq!(ended.len(), 1, "exactly one end event");
        assert_eq!(tracker.active_count(), 0);
    }

    #[test]
    fn test_ids_are_never_reused() {
        let mut tracker = PersonTracker::new("D02", TrackerSettings::default());
        let a = tracker.update(&frame(0, vec![person_at(0, 100.0)]))[0].track_id;
        tracker.expire(100);
        let b = tracker.update(&frame(101, vec![person_at(101, 100.0)]))[0].track_id;
        assert_ne!(a, b);
    }

    #[test]
    fn test_error_frame_is_treated_as_empty() {
        let mut tracker = PersonTracker::new("D02", TrackerSettings::default());
        tracker.update(&frame(0, vec![person_at(0, 100.0)]));
        let mut errored = frame(1, vec![person_at(1, 100.0)]);
        errored.detection_error = Some("timeout".into());
        let events = tracker.update(&errored);
        assert!(events.is_empty());
        assert_eq!(tracker.active_count(), 1, "track coasts through an error frame");
    }

    #[test]
    fn test_malformed_detection_is_skipped() {
        let mut tracker = PersonTracker::new("D02", TrackerSettings::default());
        let bad = det(0, 50.0, 50.0, 10.0, 10.0, ObjectClass::Person);
        assert!(tracker.update(&frame(0, vec![bad])).is_empty());
    }

    #[test]
    fn test_bag_attaches_to_nearest_person() {
        let mut tracker = PersonTracker::new("D02", TrackerSettings::default());
        let bag = det(0, 120.0, 200.0, 140.0, 230.0, ObjectClass::Bag);
        let events = tracker.update(&frame(0, vec![person_at(0, 100.0), person_at(0, 400.0), bag]));
        let with_bag: Vec<_> = events.iter().filter(|e| e.bag_seen).collect();
        assert_eq!(with_bag.len(), 1);
        let track = tracker.get_track(with_bag[0].track_id).unwrap();
        assert_eq!(track.bag_sightings, vec![0]);
        assert_eq!(track.positions[0].bbox.x1, 100.0);
    }

    #[test]
    fn test_stale_frame_ignored() {
        let mut tracker = PersonTracker::new("D02", TrackerSettings::default());
        tracker.update(&frame(5, vec![person_at(5, 100.0)]));
        assert!(tracker.update(&frame(4, vec![person_at(4, 300.0)])).is_empty());
        assert_eq!(tracker.active_count(), 1);
    }
}
