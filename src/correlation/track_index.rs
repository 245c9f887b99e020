// src/correlation/track_index.rs
//
// Per-store view of recent tracks, fed by TrackDeltas in event-time order.
// The stitcher reads doorway geometry from it; visit closure reads interior
// activity, hotspot seconds and bag sightings. Nothing identity-linking is
// kept: an entry is only first/last box, timestamps and counters, and it is
// removed once the visit that claimed it closes.

use crate::config::{CameraConfig, CameraRole};
use crate::metrics::dwell;
use crate::metrics::heatmap::zones_containing;
use crate::types::{BBox, Timestamp, TrackDelta, TrackEventKind, TrackKey, Visit, VisitId};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq)]
pub struct IndexedTrack {
    pub key: TrackKey,
    pub interior: bool,
    pub start_ts: Timestamp,
    pub first_bbox: BBox,
    /// Fraction of the first box inside the camera's doorway zone.
    pub doorway_overlap: f32,
    pub last_ts: Timestamp,
    pub last_bbox: BBox,
    /// Distance from the last box centre to the doorway-zone centre.
    pub doorway_distance: Option<f32>,
    pub bag_sightings: Vec<Timestamp>,
    /// Hotspot zone name -> occupancy seconds.
    pub hotspot_seconds: BTreeMap<String, u64>,
    pub ended: bool,
    pub claimed_by: Option<VisitId>,
}

impl IndexedTrack {
    fn new(key: TrackKey, camera: &CameraConfig, ts: Timestamp, bbox: BBox) -> Self {
        Self {
            key,
            interior: camera.role == CameraRole::Interior,
            start_ts: ts,
            first_bbox: bbox,
            doorway_overlap: camera
                .doorway_zone
                .map(|zone| bbox.overlap_fraction(&zone))
                .unwrap_or(0.0),
            last_ts: ts,
            last_bbox: bbox,
            doorway_distance: doorway_distance(camera, &bbox),
            bag_sightings: Vec::new(),
            hotspot_seconds: BTreeMap::new(),
            ended: false,
            claimed_by: None,
        }
    }

    pub fn bag_within(&self, from: Timestamp, to: Timestamp) -> bool {
        self.bag_sightings.iter().any(|t| *t >= from && *t <= to)
    }
}

fn doorway_distance(camera: &CameraConfig, bbox: &BBox) -> Option<f32> {
    let zone = camera.doorway_zone?;
    let (zx, zy) = zone.center();
    let (bx, by) = bbox.center();
    Some(((zx - bx).powi(2) + (zy - by).powi(2)).sqrt())
}

/// What the linked tracks say about a visit at closure time.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LinkedActivity {
    pub observed_dwell_sec: Option<i64>,
    pub last_activity: Option<Timestamp>,
    pub hotspot_contributions: BTreeMap<String, u64>,
    pub bag_seen: bool,
}

#[derive(Default)]
pub struct TrackIndex {
    tracks: BTreeMap<TrackKey, IndexedTrack>,
}

impl TrackIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&mut self, delta: &TrackDelta, camera: &CameraConfig) {
        let key = delta.key();
        if delta.kind == TrackEventKind::Ended {
            if let Some(track) = self.tracks.get_mut(&key) {
                track.ended = true;
            }
            return;
        }
        let Some(bbox) = delta.bbox else {
            return;
        };

        let track = self
            .tracks
            .entry(key.clone())
            .or_insert_with(|| IndexedTrack::new(key, camera, delta.timestamp, bbox));
        if delta.timestamp >= track.last_ts {
            track.last_ts = delta.timestamp;
            track.last_bbox = bbox;
            track.doorway_distance = doorway_distance(camera, &bbox);
        }
        if delta.bag_seen {
            track.bag_sightings.push(delta.timestamp);
        }
        for zone in zones_containing(camera, &bbox).filter(|z| z.hotspot) {
            *track.hotspot_seconds.entry(zone.name.clone()).or_insert(0) += 1;
        }
    }

    pub fn get(&self, key: &TrackKey) -> Option<&IndexedTrack> {
        self.tracks.get(key)
    }

    pub fn interior_tracks(&self) -> impl Iterator<Item = &IndexedTrack> {
        self.tracks.values().filter(|t| t.interior)
    }

    /// Returns false when the track is unknown or already claimed.
    pub fn claim(&mut self, key: &TrackKey, visit_id: VisitId) -> bool {
        match self.tracks.get_mut(key) {
            Some(track) if track.claimed_by.is_none() => {
                track.claimed_by = Some(visit_id);
                true
            }
            _ => false,
        }
    }

    pub fn summarize(
        &self,
        visit: &Visit,
        exit_track: Option<&TrackKey>,
        bag_from: Timestamp,
        bag_to: Timestamp,
    ) -> LinkedActivity {
        let linked: Vec<&IndexedTrack> = visit
            .linked_tracks()
            .filter_map(|key| self.tracks.get(key))
            .collect();

        let mut hotspot_contributions = BTreeMap::new();
        for track in &linked {
            for (zone, sec) in &track.hotspot_seconds {
                *hotspot_contributions.entry(zone.clone()).or_insert(0) += *sec;
            }
        }
        let exit_bag = exit_track
            .and_then(|key| self.tracks.get(key))
            .map(|t| t.bag_within(bag_from, bag_to))
            .unwrap_or(false);

        LinkedActivity {
            observed_dwell_sec: dwell::observed_dwell(linked.iter().map(|t| (t.start_ts, t.last_ts))),
            last_activity: linked.iter().map(|t| t.last_ts).max(),
            hotspot_contributions,
            bag_seen: exit_bag || linked.iter().any(|t| t.bag_within(bag_from, bag_to)),
        }
    }

    /// Forget everything tied to a closed visit.
    pub fn release_visit(&mut self, visit: &Visit) {
        for key in visit.linked_tracks() {
            self.tracks.remove(key);
        }
        if self
            .tracks
            .get(&visit.entry_track)
            .map(|t| t.ended)
            .unwrap_or(false)
        {
            self.tracks.remove(&visit.entry_track);
        }
    }

    /// Drop ended, unclaimed tracks last seen before `before`.
    pub fn prune(&mut self, before: Timestamp) -> usize {
        let len = self.tracks.len();
        self.tracks
            .retain(|_, t| !(t.ended && t.claimed_by.is_none() && t.last_ts < before));
        len - self.tracks.len()
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }
}
