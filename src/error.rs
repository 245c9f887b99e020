// src/error.rs
//
// Typed failures at module seams. Only ConfigError is operator-visible;
// everything else degrades confidence or is a caller-side no-op.

use crate::types::{VisitId, VisitState};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VisitError {
    /// The visit already reached ENDED/BOUNCED. Callers treat this as a no-op.
    #[error("visit {0} is already closed")]
    VisitAlreadyClosed(VisitId),

    #[error("visit {0} does not exist")]
    UnknownVisit(VisitId),

    #[error("visit {id}: transition {from:?} -> {to:?} is not allowed")]
    InvalidTransition {
        id: VisitId,
        from: VisitState,
        to: VisitState,
    },
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("store id must not be empty")]
    EmptyStoreId,

    #[error("store '{0}' is configured more than once")]
    DuplicateStore(String),

    #[error("camera '{camera_id}' is configured more than once (store '{store_id}')")]
    DuplicateCamera { store_id: String, camera_id: String },

    #[error("store '{0}' has no entrance camera")]
    NoEntranceCamera(String),

    #[error("entrance camera '{camera_id}' in store '{store_id}' has no usable entrance_line")]
    MissingEntranceLine { store_id: String, camera_id: String },

    #[error("store '{store_id}': threshold '{name}' is invalid ({reason})")]
    InvalidThreshold {
        store_id: String,
        name: &'static str,
        reason: String,
    },

    #[error("store '{store_id}', camera '{camera_id}': {reason}")]
    InvalidGeometry {
        store_id: String,
        camera_id: String,
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("detection failed: {0}")]
pub struct DetectionError(pub String);

#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("malformed envelope: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("{event_type} payload is invalid: {reason}")]
    InvalidPayload { event_type: String, reason: String },
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("store '{0}' is not onboarded")]
    UnknownStore(String),

    #[error("camera '{camera_id}' is not registered for store '{store_id}'")]
    UnknownCamera { store_id: String, camera_id: String },

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Envelope(#[from] EnvelopeError),
}
