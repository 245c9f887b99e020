// src/tracking/mod.rs
//
// Per-camera stage. One lane per camera, no state shared between lanes:
//
//   FrameDetections → person_tracker → TrackDelta ─┬→ store pipeline (interior)
//                                                  └→ line_crossing → EntryExitEvent (entrance)

pub mod line_crossing;
pub mod person_tracker;

pub use line_crossing::LineCrossingDetector;
pub use person_tracker::PersonTracker;
