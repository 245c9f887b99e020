// src/config.rs
//
// YAML configuration. Every threshold has a documented default; a store may
// override any of them. Resolution order: built-in default -> global
// `defaults` block -> per-store `thresholds` block.
//
// Validation runs at store onboarding. A store with an invalid config never
// starts its pipeline.

use crate::error::ConfigError;
use crate::types::BBox;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;

// ============================================================================
// TOP LEVEL
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub defaults: ThresholdOverrides,
    #[serde(default)]
    pub tracker: TrackerOverrides,
    #[serde(default)]
    pub stores: Vec<StoreConfig>,
}

impl Config {
    pub fn load(path: &str) -> Result<Self> {
        let contents =
            fs::read_to_string(path).with_context(|| format!("Failed to read config {}", path))?;
        Self::from_yaml_str(&contents).with_context(|| format!("Failed to parse config {}", path))
    }

    pub fn from_yaml_str(contents: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(contents)?;
        Ok(config)
    }

    /// Resolve every store, rejecting duplicates. Individual store errors are
    /// returned as-is so the caller can decide whether to skip or abort.
    pub fn resolve_stores(&self) -> Vec<Result<StoreSettings, ConfigError>> {
        let mut seen = HashSet::new();
        self.stores
            .iter()
            .map(|store| {
                if !seen.insert(store.store_id.clone()) {
                    return Err(ConfigError::DuplicateStore(store.store_id.clone()));
                }
                store.resolve(&self.defaults, &self.tracker)
            })
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "store_visits=info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// How long a store waits for stragglers before releasing events in order.
    pub reorder_lateness_sec: i64,
    /// Bound on queued HEATMAP_UPDATED events; lifecycle events are never dropped.
    pub event_bus_capacity: usize,
    pub top_zones: usize,
    /// Period of the wall-clock tick that settles quiet stores.
    pub clock_tick_sec: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            reorder_lateness_sec: 5,
            event_bus_capacity: 10_000,
            top_zones: 5,
            clock_tick_sec: 1,
        }
    }
}

// ============================================================================
// THRESHOLDS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RiskWeights {
    pub dwell: f64,
    pub no_bag: f64,
    pub hotspot: f64,
}

impl Default for RiskWeights {
    fn default() -> Self {
        Self {
            dwell: 0.3,
            no_bag: 0.6,
            hotspot: 0.1,
        }
    }
}

/// Fully resolved per-store thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Thresholds {
    pub reentry_cooldown_sec: i64,
    pub bounce_threshold_sec: i64,
    pub engaged_dwell_threshold_sec: i64,
    pub bag_check_window_sec: i64,
    pub los_alert_threshold: f64,
    /// Stitching window Δ.
    pub stitch_window_sec: i64,
    /// Store-dwell ceiling after which an open visit is force-closed.
    pub max_store_dwell_sec: i64,
    /// A lone candidate at or above this score stitches with HIGH confidence.
    pub strong_match_score: f32,
    pub hotspot_bucket_sec: i64,
    pub peak_bucket_sec: i64,
    /// Optional extra trigger: minimum seconds in hotspot zones.
    pub min_hotspot_engagement_sec: Option<i64>,
    pub hotspot_reason_min_sec: i64,
    pub risk_weights: RiskWeights,
    pub dwell_excess_norm_sec: i64,
    pub hotspot_norm_sec: i64,
    /// How long closed visits, alerts and time buckets are kept in memory.
    pub retention_sec: i64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            reentry_cooldown_sec: 60,
            bounce_threshold_sec: 120,
            engaged_dwell_threshold_sec: 180,
            bag_check_window_sec: 10,
            los_alert_threshold: 0.75,
            stitch_window_sec: 8,
            max_store_dwell_sec: 4 * 3600,
            strong_match_score: 0.5,
            hotspot_bucket_sec: 3600,
            peak_bucket_sec: 60,
            min_hotspot_engagement_sec: None,
            hotspot_reason_min_sec: 10,
            risk_weights: RiskWeights::default(),
            dwell_excess_norm_sec: 300,
            hotspot_norm_sec: 60,
            retention_sec: 24 * 3600,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThresholdOverrides {
    pub reentry_cooldown_sec: Option<i64>,
    pub bounce_threshold_sec: Option<i64>,
    pub engaged_dwell_threshold_sec: Option<i64>,
    pub bag_check_window_sec: Option<i64>,
    pub los_alert_threshold: Option<f64>,
    pub stitch_window_sec: Option<i64>,
    pub max_store_dwell_sec: Option<i64>,
    pub strong_match_score: Option<f32>,
    pub hotspot_bucket_sec: Option<i64>,
    pub peak_bucket_sec: Option<i64>,
    pub min_hotspot_engagement_sec: Option<i64>,
    pub hotspot_reason_min_sec: Option<i64>,
    pub risk_weights: Option<RiskWeights>,
    pub dwell_excess_norm_sec: Option<i64>,
    pub hotspot_norm_sec: Option<i64>,
    pub retention_sec: Option<i64>,
}

impl Thresholds {
    pub fn with_overrides(&self, o: &ThresholdOverrides) -> Thresholds {
        Thresholds {
            reentry_cooldown_sec: o.reentry_cooldown_sec.unwrap_or(self.reentry_cooldown_sec),
            bounce_threshold_sec: o.bounce_threshold_sec.unwrap_or(self.bounce_threshold_sec),
            engaged_dwell_threshold_sec: o
                .engaged_dwell_threshold_sec
                .unwrap_or(self.engaged_dwell_threshold_sec),
            bag_check_window_sec: o.bag_check_window_sec.unwrap_or(self.bag_check_window_sec),
            los_alert_threshold: o.los_alert_threshold.unwrap_or(self.los_alert_threshold),
            stitch_window_sec: o.stitch_window_sec.unwrap_or(self.stitch_window_sec),
            max_store_dwell_sec: o.max_store_dwell_sec.unwrap_or(self.max_store_dwell_sec),
            strong_match_score: o.strong_match_score.unwrap_or(self.strong_match_score),
            hotspot_bucket_sec: o.hotspot_bucket_sec.unwrap_or(self.hotspot_bucket_sec),
            peak_bucket_sec: o.peak_bucket_sec.unwrap_or(self.peak_bucket_sec),
            min_hotspot_engagement_sec: o
                .min_hotspot_engagement_sec
                .or(self.min_hotspot_engagement_sec),
            hotspot_reason_min_sec: o
                .hotspot_reason_min_sec
                .unwrap_or(self.hotspot_reason_min_sec),
            risk_weights: o.risk_weights.unwrap_or(self.risk_weights),
            dwell_excess_norm_sec: o.dwell_excess_norm_sec.unwrap_or(self.dwell_excess_norm_sec),
            hotspot_norm_sec: o.hotspot_norm_sec.unwrap_or(self.hotspot_norm_sec),
            retention_sec: o.retention_sec.unwrap_or(self.retention_sec),
        }
    }

    pub fn validate(&self, store_id: &str) -> Result<(), ConfigError> {
        let invalid = |name: &'static str, reason: &str| ConfigError::InvalidThreshold {
            store_id: store_id.to_string(),
            name,
            reason: reason.to_string(),
        };

        let non_negative = [
            ("reentry_cooldown_sec", self.reentry_cooldown_sec),
            ("bounce_threshold_sec", self.bounce_threshold_sec),
            ("engaged_dwell_threshold_sec", self.engaged_dwell_threshold_sec),
            ("bag_check_window_sec", self.bag_check_window_sec),
            ("hotspot_reason_min_sec", self.hotspot_reason_min_sec),
        ];
        for (name, value) in non_negative {
            if value < 0 {
                return Err(invalid(name, "must be >= 0"));
            }
        }

        let positive = [
            ("stitch_window_sec", self.stitch_window_sec),
            ("max_store_dwell_sec", self.max_store_dwell_sec),
            ("hotspot_bucket_sec", self.hotspot_bucket_sec),
            ("peak_bucket_sec", self.peak_bucket_sec),
            ("dwell_excess_norm_sec", self.dwell_excess_norm_sec),
            ("hotspot_norm_sec", self.hotspot_norm_sec),
            ("retention_sec", self.retention_sec),
        ];
        for (name, value) in positive {
            if value <= 0 {
                return Err(invalid(name, "must be > 0"));
            }
        }

        if !(0.0..=1.0).contains(&self.los_alert_threshold) {
            return Err(invalid("los_alert_threshold", "must be within [0, 1]"));
        }
        if !(0.0..=1.0).contains(&self.strong_match_score) {
            return Err(invalid("strong_match_score", "must be within [0, 1]"));
        }
        if let Some(min) = self.min_hotspot_engagement_sec {
            if min < 0 {
                return Err(invalid("min_hotspot_engagement_sec", "must be >= 0"));
            }
        }

        let w = self.risk_weights;
        let weights = [w.dwell, w.no_bag, w.hotspot];
        if weights.iter().any(|v| !v.is_finite() || *v < 0.0) {
            return Err(invalid("risk_weights", "weights must be finite and >= 0"));
        }
        if weights.iter().sum::<f64>() <= 0.0 {
            return Err(invalid("risk_weights", "at least one weight must be > 0"));
        }
        Ok(())
    }
}

// ============================================================================
// TRACKER SETTINGS
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackerSettings {
    pub min_confidence: f32,
    /// Frames a track survives without a match before it ends.
    pub max_missed_frames: u32,
    pub min_match_score: f32,
    /// Share of the match score coming from IoU; the rest is centroid proximity.
    pub iou_weight: f32,
    pub max_centroid_distance: f32,
    pub frame_interval_sec: i64,
    pub bag_attach_margin: f32,
}

impl Default for TrackerSettings {
    fn default() -> Self {
        Self {
            min_confidence: 0.25,
            max_missed_frames: 3,
            min_match_score: 0.2,
            iou_weight: 0.6,
            max_centroid_distance: 150.0,
            frame_interval_sec: 1,
            bag_attach_margin: 0.25,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerOverrides {
    pub min_confidence: Option<f32>,
    pub max_missed_frames: Option<u32>,
    pub min_match_score: Option<f32>,
    pub iou_weight: Option<f32>,
    pub max_centroid_distance: Option<f32>,
    pub frame_interval_sec: Option<i64>,
    pub bag_attach_margin: Option<f32>,
}

impl TrackerSettings {
    pub fn with_overrides(&self, o: &TrackerOverrides) -> TrackerSettings {
        TrackerSettings {
            min_confidence: o.min_confidence.unwrap_or(self.min_confidence),
            max_missed_frames: o.max_missed_frames.unwrap_or(self.max_missed_frames),
            min_match_score: o.min_match_score.unwrap_or(self.min_match_score),
            iou_weight: o.iou_weight.unwrap_or(self.iou_weight),
            max_centroid_distance: o.max_centroid_distance.unwrap_or(self.max_centroid_distance),
            frame_interval_sec: o.frame_interval_sec.unwrap_or(self.frame_interval_sec),
            bag_attach_margin: o.bag_attach_margin.unwrap_or(self.bag_attach_margin),
        }
    }

    fn validate(&self, store_id: &str) -> Result<(), ConfigError> {
        let invalid = |name: &'static str, reason: &str| ConfigError::InvalidThreshold {
            store_id: store_id.to_string(),
            name,
            reason: reason.to_string(),
        };
        if !(0.0..=1.0).contains(&self.iou_weight) {
            return Err(invalid("iou_weight", "must be within [0, 1]"));
        }
        if self.max_centroid_distance <= 0.0 {
            return Err(invalid("max_centroid_distance", "must be > 0"));
        }
        if self.frame_interval_sec <= 0 {
            return Err(invalid("frame_interval_sec", "must be > 0"));
        }
        if self.bag_attach_margin < 0.0 {
            return Err(invalid("bag_attach_margin", "must be >= 0"));
        }
        Ok(())
    }
}

// ============================================================================
// STORES & CAMERAS
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DetectorKind {
    /// Detections arrive already computed (DETECTIONS_CREATED).
    #[default]
    External,
    Mock,
    Unavailable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CameraRole {
    Entrance,
    Interior,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LineSide {
    #[default]
    Left,
    Right,
}

/// Calibrated entrance line. `inside` names the side of a -> b that is the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineConfig {
    pub a: [f32; 2],
    pub b: [f32; 2],
    #[serde(default)]
    pub inside: LineSide,
    #[serde(default = "default_dead_band")]
    pub dead_band: f32,
}

fn default_dead_band() -> f32 {
    4.0
}

impl LineConfig {
    pub fn length(&self) -> f32 {
        ((self.b[0] - self.a[0]).powi(2) + (self.b[1] - self.a[1]).powi(2)).sqrt()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridConfig {
    pub width: f32,
    pub height: f32,
    pub rows: u32,
    pub cols: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZoneConfig {
    pub name: String,
    pub rect: BBox,
    #[serde(default)]
    pub hotspot: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraConfig {
    pub camera_id: String,
    pub role: CameraRole,
    #[serde(default)]
    pub entrance_line: Option<LineConfig>,
    #[serde(default)]
    pub doorway_zone: Option<BBox>,
    #[serde(default)]
    pub grid: Option<GridConfig>,
    #[serde(default)]
    pub zones: Vec<ZoneConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreConfig {
    pub store_id: String,
    #[serde(default)]
    pub detector: DetectorKind,
    #[serde(default)]
    pub thresholds: ThresholdOverrides,
    #[serde(default)]
    pub tracker: TrackerOverrides,
    #[serde(default)]
    pub cameras: Vec<CameraConfig>,
}

/// A store config after defaults have been applied and validation passed.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreSettings {
    pub store_id: String,
    pub detector: DetectorKind,
    pub thresholds: Thresholds,
    pub tracker: TrackerSettings,
    pub cameras: Vec<CameraConfig>,
}

impl StoreSettings {
    pub fn camera(&self, camera_id: &str) -> Option<&CameraConfig> {
        self.cameras.iter().find(|c| c.camera_id == camera_id)
    }

    pub fn interior_cameras(&self) -> impl Iterator<Item = &CameraConfig> {
        self.cameras
            .iter()
            .filter(|c| c.role == CameraRole::Interior)
    }
}

impl StoreConfig {
    /// Minimal store with default thresholds, handy for tests and demos.
    pub fn new(store_id: &str, cameras: Vec<CameraConfig>) -> Self {
        Self {
            store_id: store_id.to_string(),
            detector: DetectorKind::External,
            thresholds: ThresholdOverrides::default(),
            tracker: TrackerOverrides::default(),
            cameras,
        }
    }

    pub fn resolve(
        &self,
        defaults: &ThresholdOverrides,
        tracker_defaults: &TrackerOverrides,
    ) -> Result<StoreSettings, ConfigError> {
        if self.store_id.trim().is_empty() {
            return Err(ConfigError::EmptyStoreId);
        }

        let thresholds = Thresholds::default()
            .with_overrides(defaults)
            .with_overrides(&self.thresholds);
        thresholds.validate(&self.store_id)?;

        let tracker = TrackerSettings::default()
            .with_overrides(tracker_defaults)
            .with_overrides(&self.tracker);
        tracker.validate(&self.store_id)?;

        self.validate_cameras()?;

        Ok(StoreSettings {
            store_id: self.store_id.clone(),
            detector: self.detector,
            thresholds,
            tracker,
            cameras: self.cameras.clone(),
        })
    }

    fn validate_cameras(&self) -> Result<(), ConfigError> {
        let geometry = |camera_id: &str, reason: String| ConfigError::InvalidGeometry {
            store_id: self.store_id.clone(),
            camera_id: camera_id.to_string(),
            reason,
        };

        let mut seen = HashSet::new();
        let mut has_entrance = false;
        for cam in &self.cameras {
            if !seen.insert(cam.camera_id.as_str()) {
                return Err(ConfigError::DuplicateCamera {
                    store_id: self.store_id.clone(),
                    camera_id: cam.camera_id.clone(),
                });
            }

            if cam.role == CameraRole::Entrance {
                has_entrance = true;
                let usable = cam
                    .entrance_line
                    .as_ref()
                    .map(|l| l.length() > f32::EPSILON && l.dead_band >= 0.0)
                    .unwrap_or(false);
                if !usable {
                    return Err(ConfigError::MissingEntranceLine {
                        store_id: self.store_id.clone(),
                        camera_id: cam.camera_id.clone(),
                    });
                }
            }

            if let Some(zone) = &cam.doorway_zone {
                if !zone.is_valid() {
                    return Err(geometry(&cam.camera_id, "doorway_zone is empty or inverted".into()));
                }
            }
            if let Some(grid) = &cam.grid {
                if grid.rows == 0 || grid.cols == 0 || grid.width <= 0.0 || grid.height <= 0.0 {
                    return Err(geometry(&cam.camera_id, "grid needs positive size, rows and cols".into()));
                }
            }
            for zone in &cam.zones {
                if !zone.rect.is_valid() {
                    return Err(geometry(
                        &cam.camera_id,
                        format!("zone '{}' is empty or inverted", zone.name),
                    ));
                }
            }
        }

        if !has_entrance {
            return Err(ConfigError::NoEntranceCamera(self.store_id.clone()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
logging:
  level: "store_visits=debug"
defaults:
  bounce_threshold_sec: 90
stores:
  - store_id: "s1"
    detector: mock
    thresholds:
      los_alert_threshold: 0.8
    cameras:
      - camera_id: "D01"
        role: entrance
        entrance_line: { a: [0.0, 100.0], b: [640.0, 100.0], inside: right }
      - camera_id: "D02"
        role: interior
        doorway_zone: { x1: 0.0, y1: 0.0, x2: 200.0, y2: 200.0 }
        grid: { width: 640.0, height: 480.0, rows: 4, cols: 4 }
        zones:
          - { name: "electronics", rect: { x1: 300.0, y1: 0.0, x2: 640.0, y2: 240.0 }, hotspot: true }
"#;

    #[test]
    fn test_overrides_layer_over_defaults() {
        let config = Config::from_yaml_str(SAMPLE).unwrap();
        let stores = config.resolve_stores();
        let settings = stores[0].as_ref().unwrap();

        assert_eq!(settings.thresholds.bounce_threshold_sec, 90);
        assert_eq!(settings.thresholds.los_alert_threshold, 0.8);
        // untouched values keep their documented defaults
        assert_eq!(settings.thresholds.reentry_cooldown_sec, 60);
        assert_eq!(settings.thresholds.engaged_dwell_threshold_sec, 180);
        assert_eq!(settings.thresholds.bag_check_window_sec, 10);
        assert_eq!(settings.detector, DetectorKind::Mock);
        assert_eq!(settings.interior_cameras().count(), 1);
    }

    #[test]
    fn test_missing_entrance_line_is_fatal() {
        let store = StoreConfig::new(
            "s1",
            vec![CameraConfig {
                camera_id: "D01".into(),
                role: CameraRole::Entrance,
                entrance_line: None,
                doorway_zone: None,
                grid: None,
                zones: vec![],
            }],
        );
        let err = store
            .resolve(&ThresholdOverrides::default(), &TrackerOverrides::default())
            .unwrap_err();
        assert!(matches!(err, ConfigError::MissingEntranceLine { .. }));
    }

    #[test]
    fn test_store_without_entrance_camera_is_fatal() {
        let store = StoreConfig::new("s1", vec![]);
        let err = store
            .resolve(&ThresholdOverrides::default(), &TrackerOverrides::default())
            .unwrap_err();
        assert_eq!(err, ConfigError::NoEntranceCamera("s1".into()));
    }

    #[test]
    fn test_out_of_range_alert_threshold_is_fatal() {
        let mut config = Config::from_yaml_str(SAMPLE).unwrap();
        config.stores[0].thresholds.los_alert_threshold = Some(1.5);
        let err = config.resolve_stores().remove(0).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidThreshold { name: "los_alert_threshold", .. }
        ));
    }

    #[test]
    fn test_duplicate_store_rejected() {
        let mut config = Config::from_yaml_str(SAMPLE).unwrap();
        let dup = config.stores[0].clone();
        config.stores.push(dup);
        let results = config.resolve_stores();
        assert!(results[0].is_ok());
        assert_eq!(
            results[1].as_ref().unwrap_err(),
            &ConfigError::DuplicateStore("s1".into())
        );
    }

    #[test]
    fn test_zero_weights_rejected() {
        let t = Thresholds {
            risk_weights: RiskWeights {
                dwell: 0.0,
                no_bag: 0.0,
                hotspot: 0.0,
            },
            ..Thresholds::default()
        };
        assert!(t.validate("s1").is_err());
    }
}
