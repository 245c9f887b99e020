// src/metrics/mod.rs
//
// Metrics aggregator: footfall (deduplicated), dwell/bounce fixed at visit
// closure, hotspot occupancy, and per-store reporting.

pub mod dwell;
pub mod footfall;
pub mod heatmap;
pub mod summary;

pub use dwell::DwellStats;
pub use footfall::FootfallCounter;
pub use heatmap::{HeatmapAggregator, HeatmapDelta, ZoneOccupancy};
pub use summary::{ActivityLog, CameraHotspot, StoreSummary};
