// src/visits/lifecycle.rs
//
// Per-store visit arena and state machine:
//
//   STARTED ──(stitch attempted)──> STITCHED ──(close)──> ENDED | BOUNCED
//
// The manager owns every Visit record. Other components never hold a
// reference into the arena; they ask for snapshots and submit requests.
// Terminal states are final: any later mutation returns
// VisitError::VisitAlreadyClosed, which callers treat as a no-op.

use crate::error::VisitError;
use crate::metrics::dwell;
use crate::types::{
    ClosureCause, EntryExitEvent, StitchCandidate, StitchConfidence, Timestamp, TrackKey, Visit,
    VisitId, VisitLink, VisitState,
};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::{debug, info};

/// Result of a stitching attempt, applied atomically by `mark_stitched`.
#[derive(Debug, Clone, PartialEq)]
pub struct StitchUpdate {
    pub confidence: StitchConfidence,
    pub links: Vec<VisitLink>,
    pub audit: Vec<StitchCandidate>,
}

/// Everything needed to close a visit in one step.
#[derive(Debug, Clone, PartialEq)]
pub struct CloseRequest {
    pub exit_ts: Timestamp,
    pub cause: ClosureCause,
    pub observed_dwell_sec: Option<i64>,
    pub hotspot_contributions: BTreeMap<String, u64>,
}

pub struct VisitManager {
    store_id: String,
    visits: HashMap<VisitId, Visit>,
    open: BTreeSet<VisitId>,
    next_seq: u64,
}

impl VisitManager {
    pub fn new(store_id: &str) -> Self {
        Self {
            store_id: store_id.to_string(),
            visits: HashMap::new(),
            open: BTreeSet::new(),
            next_seq: 1,
        }
    }

    /// Open a visit for an IN crossing.
    pub fn start(&mut self, entry: &EntryExitEvent) -> VisitId {
        let id = VisitId(self.next_seq);
        self.next_seq += 1;
        let visit = Visit {
            visit_id: id,
            store_id: self.store_id.clone(),
            entry_ts: entry.timestamp,
            exit_ts: None,
            state: VisitState::Started,
            stitch_confidence: StitchConfidence::None,
            entry_track: entry.source_key(),
            links: Vec::new(),
            stitch_audit: Vec::new(),
            observed_dwell_sec: None,
            store_dwell_sec: None,
            bounce_flag: None,
            bag_evidence_seen: false,
            hotspot_contributions: BTreeMap::new(),
            inferred_endpoint: false,
            closure_cause: None,
        };
        info!(
            "{} visit {} started at t={} ({})",
            self.store_id, id, entry.timestamp, visit.entry_track
        );
        self.visits.insert(id, visit);
        self.open.insert(id);
        id
    }

    pub fn get(&self, id: VisitId) -> Option<&Visit> {
        self.visits.get(&id)
    }

    pub fn snapshot(&self, id: VisitId) -> Result<Visit, VisitError> {
        self.visits.get(&id).cloned().ok_or(VisitError::UnknownVisit(id))
    }

    /// Open visits in creation order.
    pub fn open_visits(&self) -> impl Iterator<Item = &Visit> {
        self.open.iter().filter_map(|id| self.visits.get(id))
    }

    pub fn open_count(&self) -> usize {
        self.open.len()
    }

    /// Visits held in memory: open ones plus closed ones not yet evicted.
    pub fn total_count(&self) -> usize {
        self.visits.len()
    }

    /// Every visit ever opened, evicted or not.
    pub fn started_count(&self) -> u64 {
        self.next_seq - 1
    }

    pub fn closed_visits(&self) -> impl Iterator<Item = &Visit> {
        self.visits.values().filter(|v| !v.is_open())
    }

    pub fn find_open_by_entry_track(&self, key: &TrackKey) -> Option<VisitId> {
        self.open_visits()
            .find(|v| &v.entry_track == key)
            .map(|v| v.visit_id)
    }

    fn open_mut(&mut self, id: VisitId) -> Result<&mut Visit, VisitError> {
        let visit = self.visits.get_mut(&id).ok_or(VisitError::UnknownVisit(id))?;
        if visit.state.is_terminal() {
            return Err(VisitError::VisitAlreadyClosed(id));
        }
        Ok(visit)
    }

    /// STARTED -> STITCHED. Happens exactly once, whatever the match quality.
    pub fn mark_stitched(&mut self, id: VisitId, update: StitchUpdate) -> Result<&Visit, VisitError> {
        let visit = self.open_mut(id)?;
        if visit.state != VisitState::Started {
            return Err(VisitError::InvalidTransition {
                id,
                from: visit.state,
                to: VisitState::Stitched,
            });
        }
        visit.state = VisitState::Stitched;
        visit.stitch_confidence = update.confidence;
        visit.links = update.links;
        visit.stitch_audit = update.audit;
        debug!(
            "visit {} stitched: {:?} ({} link(s), {} candidate(s))",
            id,
            visit.stitch_confidence,
            visit.links.len(),
            visit.stitch_audit.len()
        );
        Ok(&*visit)
    }

    /// Bag evidence near the exit. Returns true when newly recorded.
    pub fn record_bag_evidence(&mut self, id: VisitId) -> Result<bool, VisitError> {
        let visit = self.open_mut(id)?;
        let newly = !visit.bag_evidence_seen;
        visit.bag_evidence_seen = true;
        Ok(newly)
    }

    /// STITCHED -> ENDED | BOUNCED. Dwell and bounce are fixed here and never
    /// change afterwards.
    pub fn close(
        &mut self,
        id: VisitId,
        request: CloseRequest,
        bounce_threshold_sec: i64,
    ) -> Result<Visit, VisitError> {
        let visit = self.open_mut(id)?;
        if visit.state != VisitState::Stitched {
            return Err(VisitError::InvalidTransition {
                id,
                from: visit.state,
                to: VisitState::Ended,
            });
        }

        let exit_ts = request.exit_ts.max(visit.entry_ts);
        let store_dwell = dwell::store_dwell(visit.entry_ts, exit_ts);
        let bounce = dwell::is_bounce(store_dwell, bounce_threshold_sec);

        visit.exit_ts = Some(exit_ts);
        visit.store_dwell_sec = Some(store_dwell);
        visit.observed_dwell_sec = request.observed_dwell_sec;
        visit.bounce_flag = Some(bounce);
        visit.hotspot_contributions = request.hotspot_contributions;
        visit.closure_cause = Some(request.cause);
        if request.cause == ClosureCause::Timeout {
            visit.stitch_confidence = StitchConfidence::Low;
            visit.inferred_endpoint = true;
        }
        visit.state = if bounce {
            VisitState::Bounced
        } else {
            VisitState::Ended
        };

        let snapshot = visit.clone();
        self.open.remove(&id);
        info!(
            "{} visit {} closed {:?} via {:?}: dwell={}s, stitch={:?}",
            self.store_id,
            id,
            snapshot.state,
            request.cause,
            store_dwell,
            snapshot.stitch_confidence
        );
        Ok(snapshot)
    }

    /// Drop closed visits that ended before `before`. Returns how many were evicted.
    pub fn evict_closed(&mut self, before: Timestamp) -> usize {
        let len = self.visits.len();
        self.visits
            .retain(|_, v| v.is_open() || v.exit_ts.map(|t| t >= before).unwrap_or(true));
        len - self.visits.len()
    }
}
