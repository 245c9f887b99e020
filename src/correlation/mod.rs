// src/correlation/mod.rs
//
// Doorway correlation: entrance crossings + interior tracks -> visit skeletons.

pub mod stitcher;
pub mod track_index;

pub use stitcher::{StitchOutcome, Stitcher};
pub use track_index::{IndexedTrack, LinkedActivity, TrackIndex};
