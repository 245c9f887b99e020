// src/detector.rs
//
// Detector capability boundary. The core only ever sees `dyn Detector`;
// which backend a store uses is decided at onboarding. A failing backend
// yields a DetectionError, which the pipeline turns into an empty frame.

use crate::config::DetectorKind;
use crate::error::DetectionError;
use crate::types::{BBox, Detection, ObjectClass, Timestamp};
use chrono::{NaiveDate, NaiveTime};
use std::path::{Path, PathBuf};
use tracing::warn;

pub const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "bmp", "webp"];

/// A single snapshot handed to a detector.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameRef {
    pub camera_id: String,
    pub timestamp: Timestamp,
    pub path: PathBuf,
}

pub trait Detector: Send + Sync {
    fn detect(&self, frame: &FrameRef) -> Result<Vec<Detection>, DetectionError>;

    fn name(&self) -> &'static str;
}

// ============================================================================
// MOCK BACKEND
// ============================================================================

/// Deterministic detector seeded by the frame's file name. Used for local
/// runs and tests where no model is installed.
pub struct MockDetector {
    pub conf_threshold: f32,
    pub frame_width: f32,
    pub frame_height: f32,
}

impl Default for MockDetector {
    fn default() -> Self {
        Self {
            conf_threshold: 0.25,
            frame_width: 640.0,
            frame_height: 480.0,
        }
    }
}

impl MockDetector {
    fn seed(path: &Path) -> u32 {
        path.file_name()
            .map(|n| n.to_string_lossy().chars().map(|c| c as u32).sum())
            .unwrap_or(0)
    }
}

impl Detector for MockDetector {
    fn detect(&self, frame: &FrameRef) -> Result<Vec<Detection>, DetectionError> {
        let seed = Self::seed(&frame.path);
        let person_count = seed % 4;
        if person_count == 0 {
            return Ok(Vec::new());
        }

        let conf = self
            .conf_threshold
            .max((0.55 + (seed % 30) as f32 / 100.0).min(0.95));
        let slot_w = self.frame_width / person_count as f32;
        let box_w = slot_w * 0.5;
        let box_h = self.frame_height * 0.4;
        let y1 = (seed % 7) as f32 / 7.0 * (self.frame_height - box_h);

        Ok((0..person_count)
            .map(|i| {
                let x1 = i as f32 * slot_w + slot_w * 0.25;
                Detection {
                    camera_id: frame.camera_id.clone(),
                    timestamp: frame.timestamp,
                    bbox: BBox::new(x1, y1, x1 + box_w, y1 + box_h),
                    class: ObjectClass::Person,
                    confidence: conf,
                }
            })
            .collect())
    }

    fn name(&self) -> &'static str {
        "mock"
    }
}

// ============================================================================
// UNAVAILABLE BACKEND
// ============================================================================

/// Stand-in used when no model can be loaded. Every frame reports the reason.
pub struct UnavailableDetector {
    pub reason: String,
}

impl Detector for UnavailableDetector {
    fn detect(&self, _frame: &FrameRef) -> Result<Vec<Detection>, DetectionError> {
        Err(DetectionError(self.reason.clone()))
    }

    fn name(&self) -> &'static str {
        "unavailable"
    }
}

pub fn build_detector(kind: DetectorKind) -> Box<dyn Detector> {
    match kind {
        DetectorKind::Mock => Box::new(MockDetector::default()),
        DetectorKind::Unavailable => {
            warn!("Detector unavailable for this store; frames will be treated as empty");
            Box::new(UnavailableDetector {
                reason: "detector unavailable".to_string(),
            })
        }
        DetectorKind::External => Box::new(UnavailableDetector {
            reason: "store expects upstream detections".to_string(),
        }),
    }
}

// ============================================================================
// SNAPSHOT VALIDATION
// ============================================================================

pub const ZERO_BYTE: &str = "zero_byte";
pub const UNREADABLE: &str = "unreadable";

/// Cheap check run before a snapshot reaches a detector: the file must be
/// non-empty and carry a decodable image header.
pub fn validate_snapshot(path: &Path) -> Result<(), DetectionError> {
    let meta = std::fs::metadata(path).map_err(|_| DetectionError(UNREADABLE.to_string()))?;
    if meta.len() == 0 {
        return Err(DetectionError(ZERO_BYTE.to_string()));
    }
    image::image_dimensions(path)
        .map(|_| ())
        .map_err(|_| DetectionError(UNREADABLE.to_string()))
}

// ============================================================================
// SNAPSHOT NAMES
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedSnapshot {
    pub timestamp: Timestamp,
    pub camera_id: String,
    pub frame_no: u64,
}

/// Parse `HH-MM-SS_Dnn-<frame>.jpg` into a timestamp on `reference_day` (UTC).
pub fn parse_snapshot_name(name: &str, reference_day: NaiveDate) -> Option<ParsedSnapshot> {
    let stem = name.strip_suffix(".jpg")?;
    let (time_part, rest) = stem.split_once('_')?;
    let (camera_id, frame_part) = rest.split_once('-')?;

    let camera_ok = camera_id.len() == 3
        && camera_id.starts_with('D')
        && camera_id[1..].chars().all(|c| c.is_ascii_digit());
    if !camera_ok || frame_part.is_empty() || !frame_part.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }

    let hms: Vec<&str> = time_part.split('-').collect();
    if hms.len() != 3 || hms.iter().any(|p| p.len() != 2) {
        return None;
    }
    let h = hms[0].parse().ok()?;
    let m = hms[1].parse().ok()?;
    let s = hms[2].parse().ok()?;
    let time = NaiveTime::from_hms_opt(h, m, s)?;

    Some(ParsedSnapshot {
        timestamp: reference_day.and_time(time).and_utc().timestamp(),
        camera_id: camera_id.to_string(),
        frame_no: frame_part.parse().ok()?,
    })
}

pub fn is_image_path(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}
