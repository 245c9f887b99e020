// src/lib.rs
//
// Retail visit engine: per-camera person tracking, doorway stitching of
// entrance crossings to interior tracks, visit lifecycle, footfall / dwell /
// hotspot metrics and loss-of-sale alerting, one serialized lane per store.

pub mod alerts;
pub mod config;
pub mod correlation;
pub mod detector;
pub mod error;
pub mod metrics;
pub mod pipeline;
pub mod risk;
pub mod tracking;
pub mod types;
pub mod visits;
