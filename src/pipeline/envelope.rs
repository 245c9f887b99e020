// src/pipeline/envelope.rs
//
// Inbound event contract. One envelope per event; the payload shape depends
// on `event_type`. Decoding is strict about identity fields and lenient
// about detections: a broken detection list degrades to an empty frame.

use crate::detector::FrameRef;
use crate::error::EnvelopeError;
use crate::types::{
    BBox, CrossingDirection, Detection, EntryExitEvent, FrameDetections, ObjectClass, Timestamp,
    TrackDelta, TrackEventKind,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    FrameIngested,
    DetectionsCreated,
    TrackStarted,
    TrackUpdated,
    TrackEnded,
    EntryDetected,
    ExitDetected,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub event_type: EventType,
    pub store_id: String,
    pub camera_id: String,
    pub timestamp: Timestamp,
    #[serde(default)]
    pub payload: Value,
}

/// Decoded envelope.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Frame(FrameRef),
    Detections(FrameDetections),
    Track(TrackDelta),
    Crossing(EntryExitEvent),
}

#[derive(Debug, Deserialize)]
struct FramePayload {
    path: PathBuf,
}

#[derive(Debug, Deserialize)]
struct DetectionPayload {
    bbox: BBox,
    class: ObjectClass,
    confidence: f32,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct DetectionsPayload {
    detections: Vec<Value>,
    detection_error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TrackPayload {
    track_id: u64,
    #[serde(default)]
    bbox: Option<BBox>,
    #[serde(default)]
    bag_seen: bool,
}

#[derive(Debug, Deserialize)]
struct CrossingPayload {
    track_id: u64,
}

impl Envelope {
    pub fn from_json(line: &str) -> Result<Self, EnvelopeError> {
        Ok(serde_json::from_str(line)?)
    }

    fn payload<T: for<'de> Deserialize<'de>>(&self) -> Result<T, EnvelopeError> {
        serde_json::from_value(self.payload.clone()).map_err(|e| EnvelopeError::InvalidPayload {
            event_type: format!("{:?}", self.event_type),
            reason: e.to_string(),
        })
    }

    pub fn decode(&self) -> Result<Inbound, EnvelopeError> {
        let track_kind = match self.event_type {
            EventType::FrameIngested => {
                let p: FramePayload = self.payload()?;
                return Ok(Inbound::Frame(FrameRef {
                    camera_id: self.camera_id.clone(),
                    timestamp: self.timestamp,
                    path: p.path,
                }));
            }
            EventType::DetectionsCreated => return Ok(Inbound::Detections(self.decode_detections())),
            EventType::EntryDetected | EventType::ExitDetected => {
                let p: CrossingPayload = self.payload()?;
                let direction = if self.event_type == EventType::EntryDetected {
                    CrossingDirection::In
                } else {
                    CrossingDirection::Out
                };
                return Ok(Inbound::Crossing(EntryExitEvent {
                    store_id: self.store_id.clone(),
                    camera_id: self.camera_id.clone(),
                    direction,
                    timestamp: self.timestamp,
                    source_track_id: p.track_id,
                }));
            }
            EventType::TrackStarted => TrackEventKind::Started,
            EventType::TrackUpdated => TrackEventKind::Updated,
            EventType::TrackEnded => TrackEventKind::Ended,
        };

        let p: TrackPayload = self.payload()?;
        Ok(Inbound::Track(TrackDelta {
            camera_id: self.camera_id.clone(),
            track_id: p.track_id,
            kind: track_kind,
            timestamp: self.timestamp,
            bbox: p.bbox,
            bag_seen: p.bag_seen,
        }))
    }

    fn decode_detections(&self) -> FrameDetections {
        let mut frame = FrameDetections::empty(&self.camera_id, self.timestamp);
        let payload: DetectionsPayload = match serde_json::from_value(self.payload.clone()) {
            Ok(p) => p,
            Err(e) => {
                warn!(
                    "{}/{} t={}: unreadable detections payload, treating frame as empty: {}",
                    self.store_id, self.camera_id, self.timestamp, e
                );
                frame.detection_error = Some(format!("malformed payload: {}", e));
                return frame;
            }
        };

        frame.detection_error = payload.detection_error;
        frame.detections = payload
            .detections
            .into_iter()
            .filter_map(|v| serde_json::from_value::<DetectionPayload>(v).ok())
            .map(|d| Detection {
                camera_id: self.camera_id.clone(),
                timestamp: self.timestamp,
                bbox: d.bbox,
                class: d.class,
                confidence: d.confidence,
            })
            .collect();
        frame
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_entry() {
        let env = Envelope::from_json(
            r#"{"event_type":"ENTRY_DETECTED","store_id":"s1","camera_id":"D01","timestamp":12,"payload":{"track_id":4}}"#,
        )
        .unwrap();
        match env.decode().unwrap() {
            Inbound::Crossing(e) => {
                assert_eq!(e.direction, CrossingDirection::In);
                assert_eq!(e.source_track_id, 4);
                assert_eq!(e.timestamp, 12);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_decode_track_delta() {
        let env = Envelope::from_json(
            r#"{"event_type":"TRACK_UPDATED","store_id":"s1","camera_id":"D02","timestamp":3,
                "payload":{"track_id":9,"bbox":{"x1":1,"y1":2,"x2":30,"y2":90},"bag_seen":true}}"#,
        )
        .unwrap();
        let Inbound::Track(delta) = env.decode().unwrap() else {
            panic!("expected track delta");
        };
        assert_eq!(delta.kind, TrackEventKind::Updated);
        assert!(delta.bag_seen);
        assert_eq!(delta.bbox.map(|b| b.x2), Some(30.0));
    }

    #[test]
    fn test_malformed_detections_become_empty_frame() {
        let env = Envelope {
            event_type: EventType::DetectionsCreated,
            store_id: "s1".into(),
            camera_id: "D02".into(),
            timestamp: 5,
            payload: serde_json::json!({"detections": "garbage"}),
        };
        let Inbound::Detections(frame) = env.decode().unwrap() else {
            panic!("expected detections");
        };
        assert!(frame.detections.is_empty());
        assert!(frame.detection_error.is_some());
    }

    #[test]
    fn test_bad_detection_entries_are_skipped() {
        let env = Envelope {
            event_type: EventType::DetectionsCreated,
            store_id: "s1".into(),
            camera_id: "D02".into(),
            timestamp: 5,
            payload: serde_json::json!({"detections": [
                {"bbox": {"x1": 0, "y1": 0, "x2": 10, "y2": 30}, "class": "person", "confidence": 0.9},
                {"bbox": {"x1": 0, "y1": 0, "x2": 10, "y2": 30}, "class": "dog", "confidence": 0.9},
                {"class": "bag"}
            ]}),
        };
        let Inbound::Detections(frame) = env.decode().unwrap() else {
            panic!("expected detections");
        };
        assert_eq!(frame.detections.len(), 1);
        assert!(frame.detection_error.is_none());
    }

    #[test]
    fn test_track_payload_without_id_is_rejected() {
        let env = Envelope {
            event_type: EventType::TrackStarted,
            store_id: "s1".into(),
            camera_id: "D02".into(),
            timestamp: 5,
            payload: serde_json::json!({}),
        };
        assert!(matches!(env.decode(), Err(EnvelopeError::InvalidPayload { .. })));
    }
}
