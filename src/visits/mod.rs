// src/visits/mod.rs

pub mod lifecycle;

pub use lifecycle::{CloseRequest, StitchUpdate, VisitManager};
