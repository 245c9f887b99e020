// src/pipeline/mod.rs

pub mod engine;
pub mod envelope;
pub mod event_bus;
pub mod metrics;
pub mod reorder_buffer;
pub mod store_pipeline;

pub use engine::Engine;
pub use envelope::{Envelope, EventType, Inbound};
pub use event_bus::{EventBus, OutboundEvent};
pub use metrics::{MetricsSummary, PipelineMetrics};
pub use reorder_buffer::{PushOutcome, ReorderBuffer};
pub use store_pipeline::{StoreItem, StorePipeline};
