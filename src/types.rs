// src/types.rs
//
// Shared event and entity types. Everything that crosses a module boundary
// lives here so the tracker, correlator, visit manager and risk engine all
// speak the same vocabulary.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Seconds since the Unix epoch. All reasoning runs at 1 Hz resolution.
pub type Timestamp = i64;

// ============================================================================
// GEOMETRY
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BBox {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    pub fn center(&self) -> (f32, f32) {
        ((self.x1 + self.x2) * 0.5, (self.y1 + self.y2) * 0.5)
    }

    pub fn width(&self) -> f32 {
        (self.x2 - self.x1).max(0.0)
    }

    pub fn height(&self) -> f32 {
        (self.y2 - self.y1).max(0.0)
    }

    pub fn area(&self) -> f32 {
        self.width() * self.height()
    }

    /// Finite coordinates with positive extent.
    pub fn is_valid(&self) -> bool {
        [self.x1, self.y1, self.x2, self.y2]
            .iter()
            .all(|v| v.is_finite())
            && self.x2 > self.x1
            && self.y2 > self.y1
    }

    pub fn contains_point(&self, x: f32, y: f32) -> bool {
        x >= self.x1 && x <= self.x2 && y >= self.y1 && y <= self.y2
    }

    /// Grow the box by `ratio` of its own width/height on every side.
    pub fn expand(&self, ratio: f32) -> BBox {
        let dx = self.width() * ratio;
        let dy = self.height() * ratio;
        BBox::new(self.x1 - dx, self.y1 - dy, self.x2 + dx, self.y2 + dy)
    }

    pub fn translate(&self, dx: f32, dy: f32) -> BBox {
        BBox::new(self.x1 + dx, self.y1 + dy, self.x2 + dx, self.y2 + dy)
    }

    pub fn intersection_area(&self, other: &BBox) -> f32 {
        let x1 = self.x1.max(other.x1);
        let y1 = self.y1.max(other.y1);
        let x2 = self.x2.min(other.x2);
        let y2 = self.y2.min(other.y2);
        (x2 - x1).max(0.0) * (y2 - y1).max(0.0)
    }

    pub fn iou(&self, other: &BBox) -> f32 {
        let inter = self.intersection_area(other);
        if inter <= 0.0 {
            return 0.0;
        }
        let union = self.area() + other.area() - inter;
        if union > 0.0 {
            inter / union
        } else {
            0.0
        }
    }

    /// Fraction of this box's area lying inside `zone` (0 = outside, 1 = fully inside).
    pub fn overlap_fraction(&self, zone: &BBox) -> f32 {
        let area = self.area();
        if area <= 0.0 {
            return 0.0;
        }
        (self.intersection_area(zone) / area).clamp(0.0, 1.0)
    }
}

// ============================================================================
// DETECTIONS & TRACKS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectClass {
    Person,
    Bag,
}

/// One detected object in one frame. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub camera_id: String,
    pub timestamp: Timestamp,
    pub bbox: BBox,
    pub class: ObjectClass,
    pub confidence: f32,
}

impl Detection {
    pub fn is_well_formed(&self) -> bool {
        self.bbox.is_valid() && self.confidence.is_finite() && (0.0..=1.0).contains(&self.confidence)
    }
}

/// All detections for one camera at one timestep.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameDetections {
    pub camera_id: String,
    pub timestamp: Timestamp,
    #[serde(default)]
    pub detections: Vec<Detection>,
    /// Upstream detector failure marker. A frame carrying one is treated as empty.
    #[serde(default)]
    pub detection_error: Option<String>,
}

impl FrameDetections {
    pub fn empty(camera_id: &str, timestamp: Timestamp) -> Self {
        Self {
            camera_id: camera_id.to_string(),
            timestamp,
            detections: Vec::new(),
            detection_error: None,
        }
    }

    /// Detections usable for tracking; error frames and malformed entries yield nothing.
    pub fn usable(&self) -> impl Iterator<Item = &Detection> {
        let errored = self.detection_error.is_some();
        self.detections
            .iter()
            .filter(move |d| !errored && d.is_well_formed())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TrackState {
    Active,
    Ended,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrackPoint {
    pub timestamp: Timestamp,
    pub bbox: BBox,
}

/// A person's trajectory within one camera's field of view.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Track {
    pub camera_id: String,
    pub id: u64,
    pub start_ts: Timestamp,
    pub end_ts: Option<Timestamp>,
    pub positions: Vec<TrackPoint>,
    /// Timestamps at which a bag was seen attached to this person.
    pub bag_sightings: Vec<Timestamp>,
    pub state: TrackState,
}

impl Track {
    pub fn key(&self) -> TrackKey {
        TrackKey::new(&self.camera_id, self.id)
    }

    pub fn first_position(&self) -> Option<&TrackPoint> {
        self.positions.first()
    }

    pub fn last_position(&self) -> Option<&TrackPoint> {
        self.positions.last()
    }
}

/// Camera-scoped identity of a track. Never carries cross-camera meaning.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TrackKey {
    pub camera_id: String,
    pub track_id: u64,
}

impl TrackKey {
    pub fn new(camera_id: &str, track_id: u64) -> Self {
        Self {
            camera_id: camera_id.to_string(),
            track_id,
        }
    }
}

impl fmt::Display for TrackKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.camera_id, self.track_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TrackEventKind {
    Started,
    Updated,
    Ended,
}

/// Track create/update/end notification, as produced by a tracker lane or
/// received from an external tracker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackDelta {
    pub camera_id: String,
    pub track_id: u64,
    pub kind: TrackEventKind,
    pub timestamp: Timestamp,
    #[serde(default)]
    pub bbox: Option<BBox>,
    #[serde(default)]
    pub bag_seen: bool,
}

impl TrackDelta {
    pub fn key(&self) -> TrackKey {
        TrackKey::new(&self.camera_id, self.track_id)
    }
}

// ============================================================================
// CROSSINGS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CrossingDirection {
    In,
    Out,
}

/// Entrance-line crossing. Immutable once emitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryExitEvent {
    pub store_id: String,
    pub camera_id: String,
    pub direction: CrossingDirection,
    pub timestamp: Timestamp,
    pub source_track_id: u64,
}

impl EntryExitEvent {
    pub fn source_key(&self) -> TrackKey {
        TrackKey::new(&self.camera_id, self.source_track_id)
    }
}

// ============================================================================
// VISITS
// ============================================================================

/// Store-scoped anonymous visit identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VisitId(pub u64);

impl fmt::Display for VisitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{:06}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VisitState {
    Started,
    Stitched,
    Ended,
    Bounced,
}

impl VisitState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Ended | Self::Bounced)
    }

    /// Position in the forward-only lifecycle.
    pub fn rank(&self) -> u8 {
        match self {
            Self::Started => 0,
            Self::Stitched => 1,
            Self::Ended | Self::Bounced => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StitchConfidence {
    None,
    Low,
    Med,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClosureCause {
    ExitEvent,
    Timeout,
}

/// Audit record tying one interior track to a visit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VisitLink {
    pub visit_id: VisitId,
    pub track: TrackKey,
    pub match_score: f32,
    pub confidence: StitchConfidence,
}

/// An interior track that was considered while stitching a visit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StitchCandidate {
    pub track: TrackKey,
    pub start_ts: Timestamp,
    pub score: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Visit {
    pub visit_id: VisitId,
    pub store_id: String,
    pub entry_ts: Timestamp,
    pub exit_ts: Option<Timestamp>,
    pub state: VisitState,
    pub stitch_confidence: StitchConfidence,
    /// Entrance track whose IN crossing opened the visit.
    pub entry_track: TrackKey,
    pub links: Vec<VisitLink>,
    pub stitch_audit: Vec<StitchCandidate>,
    pub observed_dwell_sec: Option<i64>,
    pub store_dwell_sec: Option<i64>,
    pub bounce_flag: Option<bool>,
    pub bag_evidence_seen: bool,
    /// Zone name -> occupancy seconds contributed by the linked tracks.
    pub hotspot_contributions: BTreeMap<String, u64>,
    pub inferred_endpoint: bool,
    pub closure_cause: Option<ClosureCause>,
}

impl Visit {
    pub fn is_open(&self) -> bool {
        !self.state.is_terminal()
    }

    pub fn linked_tracks(&self) -> impl Iterator<Item = &TrackKey> {
        self.links.iter().map(|l| &l.track)
    }
}

// ============================================================================
// ALERTS
// ============================================================================

/// Ordered by declaration so a reason set always serializes identically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReasonCode {
    LongDwell,
    NoBagEvidence,
    HotspotVisit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlertState {
    Suspected,
    Dispatched,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub store_id: String,
    pub visit_id: VisitId,
    pub risk_score: f64,
    pub reason_codes: BTreeSet<ReasonCode>,
    pub created_ts: Timestamp,
    pub state: AlertState,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_iou_overlap() {
        let a = BBox::new(0.0, 0.0, 100.0, 100.0);
        let b = BBox::new(50.0, 50.0, 150.0, 150.0);
        assert!((a.iou(&b) - 2500.0 / 17500.0).abs() < 0.001);
    }

    #[test]
    fn test_iou_disjoint_is_zero() {
        let a = BBox::new(0.0, 0.0, 10.0, 10.0);
        let b = BBox::new(20.0, 20.0, 30.0, 30.0);
        assert_eq!(a.iou(&b), 0.0);
    }

    #[test]
    fn test_overlap_fraction_inside_zone() {
        let zone = BBox::new(0.0, 0.0, 100.0, 100.0);
        let inside = BBox::new(10.0, 10.0, 20.0, 20.0);
        let half = BBox::new(90.0, 0.0, 110.0, 10.0);
        assert_eq!(inside.overlap_fraction(&zone), 1.0);
        assert!((half.overlap_fraction(&zone) - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_malformed_detection_rejected() {
        let det = Detection {
            camera_id: "D01".into(),
            timestamp: 0,
            bbox: BBox::new(10.0, 10.0, 5.0, 20.0),
            class: ObjectClass::Person,
            confidence: 0.9,
        };
        assert!(!det.is_well_formed());

        let nan = Detection {
            bbox: BBox::new(0.0, 0.0, f32::NAN, 1.0),
            ..det.clone()
        };
        assert!(!nan.is_well_formed());
    }

    #[test]
    fn test_error_frame_has_no_usable_detections() {
        let frame = FrameDetections {
            camera_id: "D01".into(),
            timestamp: 5,
            detections: vec![Detection {
                camera_id: "D01".into(),
                timestamp: 5,
                bbox: BBox::new(0.0, 0.0, 10.0, 10.0),
                class: ObjectClass::Person,
                confidence: 0.8,
            }],
            detection_error: Some("model unavailable".into()),
        };
        assert_eq!(frame.usable().count(), 0);
    }

    #[test]
    fn test_reason_codes_serialize_in_stable_order() {
        let codes: BTreeSet<ReasonCode> =
            [ReasonCode::NoBagEvidence, ReasonCode::LongDwell].into_iter().collect();
        let json = serde_json::to_string(&codes).unwrap();
        assert_eq!(json, r#"["LONG_DWELL","NO_BAG_EVIDENCE"]"#);
    }
}
