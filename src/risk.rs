// src/risk.rs
//
// Loss-of-sale risk engine. Runs once per closed visit, reads only the
// closed Visit snapshot, and never mutates visit or tracker state.
//
// Trigger (all required):
//   - visit ENDED by an exit crossing (BOUNCED and timed-out visits never qualify)
//   - store_dwell_sec >= engaged_dwell_threshold_sec
//   - no bag evidence within bag_check_window_sec of exit
//   - hotspot seconds >= min_hotspot_engagement_sec, when configured
//
// Score (each factor in [0,1], clamped sum):
//   w_no_bag  · [no bag evidence]
// + w_dwell   · dwell_factor(store_dwell)
// + w_hotspot · min(1, hotspot_sec / hotspot_norm_sec)
//
// dwell_factor rises linearly to 0.5 at the engaged threshold, then on to
// 1.0 over `dwell_excess_norm_sec` of excess, so it never decreases in dwell.

use crate::config::Thresholds;
use crate::types::{
    Alert, AlertState, ClosureCause, ReasonCode, Timestamp, Visit, VisitId, VisitState,
};
use serde::Serialize;
use std::collections::hash_map::Entry;
use std::collections::{BTreeSet, HashMap};
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Ineligible {
    NotEnded,
    NoExitEvent,
    ShortDwell,
    BagEvidence,
    LowHotspotEngagement,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RiskDecision {
    NotCandidate(Ineligible),
    /// Candidate scored below the alert threshold.
    Dropped { score: f64 },
    Alert(Alert),
}

pub struct RiskEngine {
    thresholds: Thresholds,
}

impl RiskEngine {
    pub fn new(thresholds: &Thresholds) -> Self {
        Self {
            thresholds: thresholds.clone(),
        }
    }

    fn dwell_factor(&self, store_dwell_sec: i64) -> f64 {
        let engaged = self.thresholds.engaged_dwell_threshold_sec.max(1) as f64;
        let dwell = store_dwell_sec.max(0) as f64;
        if dwell < engaged {
            return 0.5 * dwell / engaged;
        }
        let norm = self.thresholds.dwell_excess_norm_sec.max(1) as f64;
        0.5 + 0.5 * ((dwell - engaged) / norm).min(1.0)
    }

    pub fn score(&self, store_dwell_sec: i64, bag_evidence_seen: bool, hotspot_sec: u64) -> f64 {
        let w = &self.thresholds.risk_weights;
        let no_bag = if bag_evidence_seen { 0.0 } else { 1.0 };
        let hotspot = (hotspot_sec as f64 / self.thresholds.hotspot_norm_sec.max(1) as f64).min(1.0);
        let raw = w.no_bag * no_bag + w.dwell * self.dwell_factor(store_dwell_sec) + w.hotspot * hotspot;
        raw.clamp(0.0, 1.0)
    }

    /// Reason codes satisfied by a visit snapshot.
    pub fn reasons(&self, visit: &Visit) -> BTreeSet<ReasonCode> {
        let mut reasons = BTreeSet::new();
        if visit.store_dwell_sec.unwrap_or(0) >= self.thresholds.engaged_dwell_threshold_sec {
            reasons.insert(ReasonCode::LongDwell);
        }
        if !visit.bag_evidence_seen {
            reasons.insert(ReasonCode::NoBagEvidence);
        }
        let hotspot_sec = hotspot_seconds(visit);
        if hotspot_sec > 0 && hotspot_sec >= self.thresholds.hotspot_reason_min_sec.max(0) as u64 {
            reasons.insert(ReasonCode::HotspotVisit);
        }
        reasons
    }

    fn eligibility(&self, visit: &Visit) -> Result<(), Ineligible> {
        if visit.state != VisitState::Ended {
            return Err(Ineligible::NotEnded);
        }
        if visit.closure_cause != Some(ClosureCause::ExitEvent) {
            return Err(Ineligible::NoExitEvent);
        }
        if visit.store_dwell_sec.unwrap_or(0) < self.thresholds.engaged_dwell_threshold_sec {
            return Err(Ineligible::ShortDwell);
        }
        if visit.bag_evidence_seen {
            return Err(Ineligible::BagEvidence);
        }
        if let Some(min) = self.thresholds.min_hotspot_engagement_sec {
            if hotspot_seconds(visit) < min.max(0) as u64 {
                return Err(Ineligible::LowHotspotEngagement);
            }
        }
        Ok(())
    }

    pub fn evaluate(&self, visit: &Visit, now: Timestamp) -> RiskDecision {
        if let Err(why) = self.eligibility(visit) {
            return RiskDecision::NotCandidate(why);
        }

        let store_dwell = visit.store_dwell_sec.unwrap_or(0);
        let score = self.score(store_dwell, visit.bag_evidence_seen, hotspot_seconds(visit));
        if score < self.thresholds.los_alert_threshold {
            debug!(
                "visit {} risk candidate dropped: score {:.3} < {:.2}",
                visit.visit_id, score, self.thresholds.los_alert_threshold
            );
            return RiskDecision::Dropped { score };
        }

        let alert = Alert {
            store_id: visit.store_id.clone(),
            visit_id: visit.visit_id,
            risk_score: score,
            reason_codes: self.reasons(visit),
            created_ts: visit.exit_ts.unwrap_or(now),
            state: AlertState::Suspected,
        };
        info!(
            "⚠️  {} visit {} loss-of-sale suspected: score {:.2} {:?}",
            alert.store_id, alert.visit_id, alert.risk_score, alert.reason_codes
        );
        RiskDecision::Alert(alert)
    }
}

fn hotspot_seconds(visit: &Visit) -> u64 {
    visit.hotspot_contributions.values().sum()
}

/// At most one alert per visit.
#[derive(Default)]
pub struct AlertLedger {
    alerted: HashMap<VisitId, Timestamp>,
}

impl AlertLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// True the first time a visit is admitted.
    pub fn admit(&mut self, visit_id: VisitId, ts: Timestamp) -> bool {
        match self.alerted.entry(visit_id) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(ts);
                true
            }
        }
    }

    /// Forget visits alerted before `before`. Visit ids are never reused, so
    /// a pruned visit cannot be admitted twice.
    pub fn prune(&mut self, before: Timestamp) -> usize {
        let len = self.alerted.len();
        self.alerted.retain(|_, ts| *ts >= before);
        len - self.alerted.len()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.alerted.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.alerted.is_empty()
    }
}
