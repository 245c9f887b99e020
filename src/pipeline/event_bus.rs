// src/pipeline/event_bus.rs
//
// Decoupled event system. Stores publish outbound events instead of calling
// storage, alerting or dashboard collaborators directly.

use crate::metrics::HeatmapDelta;
use crate::types::{Alert, Timestamp, Visit, VisitId};
use serde::Serialize;
use std::collections::VecDeque;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event_type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutboundEvent {
    VisitStarted {
        visit: Visit,
    },

    VisitStitched {
        visit: Visit,
    },

    /// Every closure, bounced or not.
    VisitEnded {
        visit: Visit,
    },

    BounceDetected {
        visit: Visit,
    },

    HeatmapUpdated {
        store_id: String,
        delta: HeatmapDelta,
    },

    BagEvidenceDetected {
        store_id: String,
        visit_id: VisitId,
        timestamp: Timestamp,
    },

    LossOfSaleSuspected {
        alert: Alert,
    },
}

impl OutboundEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::VisitStarted { .. } => "VISIT_STARTED",
            Self::VisitStitched { .. } => "VISIT_STITCHED",
            Self::VisitEnded { .. } => "VISIT_ENDED",
            Self::BounceDetected { .. } => "BOUNCE_DETECTED",
            Self::HeatmapUpdated { .. } => "HEATMAP_UPDATED",
            Self::BagEvidenceDetected { .. } => "BAG_EVIDENCE_DETECTED",
            Self::LossOfSaleSuspected { .. } => "LOSS_OF_SALE_SUSPECTED",
        }
    }
}

/// Two queues drained in publish order. Lifecycle and alert events are
/// never dropped; HEATMAP_UPDATED deltas are bounded and a full heatmap
/// queue drops its oldest delta (the counters themselves stay exact).
pub struct EventBus {
    next_seq: u64,
    lifecycle: VecDeque<(u64, OutboundEvent)>,
    heatmap: VecDeque<(u64, OutboundEvent)>,
    heatmap_capacity: usize,
    dropped: u64,
}

impl EventBus {
    pub fn new(heatmap_capacity: usize) -> Self {
        let heatmap_capacity = heatmap_capacity.max(1);
        Self {
            next_seq: 0,
            lifecycle: VecDeque::new(),
            heatmap: VecDeque::with_capacity(heatmap_capacity.min(1024)),
            heatmap_capacity,
            dropped: 0,
        }
    }

    pub fn publish(&mut self, event: OutboundEvent) {
        let seq = self.next_seq;
        self.next_seq += 1;

        if !matches!(event, OutboundEvent::HeatmapUpdated { .. }) {
            self.lifecycle.push_back((seq, event));
            return;
        }
        if self.heatmap.len() >= self.heatmap_capacity {
            if self.dropped == 0 {
                warn!(
                    "Heatmap event queue full ({} events), dropping oldest deltas",
                    self.heatmap_capacity
                );
            }
            self.heatmap.pop_front();
            self.dropped += 1;
        }
        self.heatmap.push_back((seq, event));
    }

    pub fn drain(&mut self) -> Vec<OutboundEvent> {
        let mut merged: Vec<(u64, OutboundEvent)> =
            Vec::with_capacity(self.lifecycle.len() + self.heatmap.len());
        merged.extend(self.lifecycle.drain(..));
        merged.extend(self.heatmap.drain(..));
        merged.sort_by_key(|(seq, _)| *seq);
        merged.into_iter().map(|(_, event)| event).collect()
    }

    #[cfg(test)]
    pub fn pending_count(&self) -> usize {
        self.lifecycle.len() + self.heatmap.len()
    }

    /// Heatmap deltas dropped because nobody drained in time.
    pub fn dropped_count(&self) -> u64 {
        self.dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bag(ts: Timestamp) -> OutboundEvent {
        OutboundEvent::BagEvidenceDetected {
            store_id: "s1".into(),
            visit_id: VisitId(1),
            timestamp: ts,
        }
    }

    fn heat(bucket_start: Timestamp) -> OutboundEvent {
        OutboundEvent::HeatmapUpdated {
            store_id: "s1".into(),
            delta: HeatmapDelta {
                camera_id: "D02".into(),
                bucket_start,
                cells: vec![(0, 0)],
                zones: vec![],
            },
        }
    }

    #[test]
    fn test_full_heatmap_queue_drops_oldest_delta() {
        let mut bus = EventBus::new(2);
        bus.publish(heat(1));
        bus.publish(heat(2));
        bus.publish(heat(3));
        assert_eq!(bus.dropped_count(), 1);
        assert_eq!(bus.drain(), vec![heat(2), heat(3)]);
        assert_eq!(bus.pending_count(), 0);
    }

    #[test]
    fn test_lifecycle_events_survive_heatmap_flood() {
        let mut bus = EventBus::new(4);
        bus.publish(heat(0));
        bus.publish(bag(1));
        for ts in 2..1000 {
            bus.publish(heat(ts));
        }
        bus.publish(bag(1000));

        let drained = bus.drain();
        let bags: Vec<&OutboundEvent> = drained
            .iter()
            .filter(|e| !matches!(e, OutboundEvent::HeatmapUpdated { .. }))
            .collect();
        assert_eq!(bags, vec![&bag(1), &bag(1000)], "lifecycle events are never dropped");
        assert_eq!(drained.len(), 2 + 4);
        assert_eq!(bus.dropped_count(), 995);
        // publish order is preserved across the two queues
        assert_eq!(drained.first(), Some(&bag(1)));
        assert_eq!(drained.last(), Some(&bag(1000)));
    }

    #[test]
    fn test_event_tag_serialization() {
        let json = serde_json::to_value(bag(5)).unwrap();
        assert_eq!(json["event_type"], "BAG_EVIDENCE_DETECTED");
        assert_eq!(json["visit_id"], 1);
        assert_eq!(bag(5).name(), "BAG_EVIDENCE_DETECTED");
    }
}
