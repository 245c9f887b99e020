// src/correlation/stitcher.rs
//
// Doorway correlator. Links an entrance IN crossing to the interior track
// that appeared in the doorway zone shortly after it, and picks which open
// visit an OUT crossing closes.
//
// Candidate score for an interior track starting `dt` seconds after the IN:
//
//   score = doorway_overlap × (1 − 0.5 · dt / Δ)
//
// so a box fully inside the doorway zone scores 1.0 at dt = 0 and 0.5 at the
// edge of the window. Decisions only depend on the index contents and the
// entry timestamps, never on arrival order, so replays stitch identically.

use crate::correlation::track_index::{IndexedTrack, TrackIndex};
use crate::types::{
    EntryExitEvent, StitchCandidate, StitchConfidence, Timestamp, Visit, VisitId, VisitLink,
};
use crate::visits::StitchUpdate;
use std::cmp::Ordering;
use tracing::debug;

#[derive(Debug, Clone, PartialEq)]
pub enum StitchOutcome {
    /// Exactly one strong candidate.
    Matched(StitchConfidence, VisitLink),
    /// Several candidates, or one weak one. Best first.
    Ambiguous(Vec<StitchCandidate>),
    NoMatch,
}

impl StitchOutcome {
    pub fn confidence(&self) -> StitchConfidence {
        match self {
            Self::Matched(confidence, _) => *confidence,
            Self::Ambiguous(_) => StitchConfidence::Med,
            Self::NoMatch => StitchConfidence::Low,
        }
    }

    pub fn into_update(self, visit_id: VisitId) -> StitchUpdate {
        match self {
            Self::Matched(confidence, link) => StitchUpdate {
                confidence,
                links: vec![link],
                audit: Vec::new(),
            },
            Self::Ambiguous(candidates) => StitchUpdate {
                confidence: StitchConfidence::Med,
                links: candidates
                    .first()
                    .map(|best| VisitLink {
                        visit_id,
                        track: best.track.clone(),
                        match_score: best.score,
                        confidence: StitchConfidence::Med,
                    })
                    .into_iter()
                    .collect(),
                audit: candidates,
            },
            Self::NoMatch => StitchUpdate {
                confidence: StitchConfidence::Low,
                links: Vec::new(),
                audit: Vec::new(),
            },
        }
    }
}

fn rank(a: &StitchCandidate, b: &StitchCandidate) -> Ordering {
    b.score
        .partial_cmp(&a.score)
        .unwrap_or(Ordering::Equal)
        .then(a.start_ts.cmp(&b.start_ts))
        .then(a.track.cmp(&b.track))
}

pub struct Stitcher {
    window_sec: i64,
    strong_match_score: f32,
}

impl Stitcher {
    pub fn new(window_sec: i64, strong_match_score: f32) -> Self {
        Self {
            window_sec: window_sec.max(1),
            strong_match_score,
        }
    }

    pub fn window_sec(&self) -> i64 {
        self.window_sec
    }

    /// Watermark at which an IN's stitching decision becomes final.
    pub fn deadline(&self, entry_ts: Timestamp) -> Timestamp {
        entry_ts + self.window_sec
    }

    fn in_window(&self, entry_ts: Timestamp, start_ts: Timestamp) -> bool {
        start_ts >= entry_ts && start_ts <= entry_ts + self.window_sec
    }

    pub fn score(&self, entry_ts: Timestamp, track: &IndexedTrack) -> Option<f32> {
        if !track.interior || track.doorway_overlap <= 0.0 || !self.in_window(entry_ts, track.start_ts) {
            return None;
        }
        let dt = (track.start_ts - entry_ts) as f32;
        Some(track.doorway_overlap * (1.0 - 0.5 * dt / self.window_sec as f32))
    }

    /// Candidates for the IN at `entry_ts`, best first. Tracks already claimed
    /// by another visit are skipped, and so are tracks that also fall in the
    /// window of a later pending IN: the nearer entry gets them.
    pub fn candidates(
        &self,
        entry_ts: Timestamp,
        later_entries: &[Timestamp],
        index: &TrackIndex,
    ) -> Vec<StitchCandidate> {
        let mut candidates: Vec<StitchCandidate> = index
            .interior_tracks()
            .filter(|t| t.claimed_by.is_none())
            .filter(|t| {
                !later_entries
                    .iter()
                    .any(|e| *e > entry_ts && t.start_ts >= *e && self.in_window(*e, t.start_ts))
            })
            .filter_map(|t| {
                self.score(entry_ts, t).map(|score| StitchCandidate {
                    track: t.key.clone(),
                    start_ts: t.start_ts,
                    score,
                })
            })
            .collect();
        candidates.sort_by(rank);
        candidates
    }

    pub fn stitch(
        &self,
        visit_id: VisitId,
        entry_ts: Timestamp,
        later_entries: &[Timestamp],
        index: &TrackIndex,
    ) -> StitchOutcome {
        let candidates = self.candidates(entry_ts, later_entries, index);
        for c in &candidates {
            debug!(
                "visit {} candidate {} start={} score={:.3}",
                visit_id, c.track, c.start_ts, c.score
            );
        }
        match candidates.as_slice() {
            [] => StitchOutcome::NoMatch,
            [only] if only.score >= self.strong_match_score => StitchOutcome::Matched(
                StitchConfidence::High,
                VisitLink {
                    visit_id,
                    track: only.track.clone(),
                    match_score: only.score,
                    confidence: StitchConfidence::High,
                },
            ),
            _ => StitchOutcome::Ambiguous(candidates),
        }
    }

    /// Which open visit an OUT crossing closes, in priority order:
    ///   1. the visit opened by the same entrance track
    ///   2. a visit whose linked track was last seen within Δ before the OUT,
    ///      nearest the doorway first
    ///   3. the oldest visit that entered before the OUT
    pub fn match_exit<'a, I>(&self, exit: &EntryExitEvent, open: I, index: &TrackIndex) -> Option<VisitId>
    where
        I: IntoIterator<Item = &'a Visit>,
    {
        let open: Vec<&Visit> = open.into_iter().collect();
        let source = exit.source_key();

        if let Some(v) = open.iter().find(|v| v.entry_track == source) {
            return Some(v.visit_id);
        }

        let near_doorway = open
            .iter()
            .filter_map(|v| {
                v.linked_tracks()
                    .filter_map(|key| index.get(key))
                    .filter(|t| t.last_ts <= exit.timestamp && exit.timestamp - t.last_ts <= self.window_sec)
                    .map(|t| t.doorway_distance.unwrap_or(f32::MAX))
                    .min_by(|a, b| a.partial_cmp(b).unwrap_or(Ordering::Equal))
                    .map(|distance| (v.visit_id, distance))
            })
            .min_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(Ordering::Equal).then(a.0.cmp(&b.0)));
        if let Some((visit_id, _)) = near_doorway {
            return Some(visit_id);
        }

        open.iter()
            .filter(|v| v.entry_ts <= exit.timestamp)
            .min_by_key(|v| (v.entry_ts, v.visit_id))
            .map(|v| v.visit_id)
    }
}
