// src/pipeline/store_pipeline.rs
//
// One store's serial lane. Everything that touches the open-visit set runs
// here, under the store's exclusive section:
//
//   TrackDelta / EntryExitEvent
//     → reorder buffer (bounded lateness)
//     → advance watermark to t-1   (finalize stitches, fire timeouts)
//     → apply                       (index track | start visit | close visit)
//     → closure                     (dwell, bounce, bag evidence, risk, alert)
//
// Timeouts and OUT crossings are decided in event-time order, so whichever
// comes first closes the visit and the other becomes a no-op.
//
// Memory is bounded by `retention_sec`: once a minute of event time, closed
// visits, alert ledger entries and time buckets older than the horizon are
// dropped. Lifetime counters are kept separately and never shrink.

use crate::alerts::{self, AlertSink};
use crate::config::StoreSettings;
use crate::correlation::{Stitcher, TrackIndex};
use crate::error::VisitError;
use crate::metrics::{
    summary::{format_bucket, format_hour},
    ActivityLog, DwellStats, FootfallCounter, HeatmapAggregator, HeatmapDelta, StoreSummary,
};
use crate::pipeline::event_bus::{EventBus, OutboundEvent};
use crate::pipeline::metrics::PipelineMetrics;
use crate::pipeline::reorder_buffer::{PushOutcome, ReorderBuffer};
use crate::risk::{AlertLedger, RiskDecision, RiskEngine};
use crate::types::{
    Alert, ClosureCause, CrossingDirection, EntryExitEvent, Timestamp, TrackDelta, TrackEventKind,
    TrackKey, VisitId, VisitState,
};
use crate::visits::{CloseRequest, VisitManager};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

const HOUSEKEEPING_EVERY_SEC: i64 = 60;

#[derive(Debug, Clone, PartialEq)]
pub enum StoreItem {
    Track(TrackDelta),
    Crossing(EntryExitEvent),
}

impl StoreItem {
    fn timestamp(&self) -> Timestamp {
        match self {
            Self::Track(d) => d.timestamp,
            Self::Crossing(e) => e.timestamp,
        }
    }

    /// Same-second order: track observations, then INs, then OUTs.
    fn rank(&self) -> u8 {
        match self {
            Self::Track(_) => 0,
            Self::Crossing(e) if e.direction == CrossingDirection::In => 1,
            Self::Crossing(_) => 2,
        }
    }
}

pub struct StorePipeline {
    settings: Arc<StoreSettings>,
    visits: VisitManager,
    index: TrackIndex,
    stitcher: Stitcher,
    footfall: FootfallCounter,
    dwell: DwellStats,
    activity: ActivityLog,
    risk: RiskEngine,
    ledger: AlertLedger,
    reorder: ReorderBuffer<StoreItem>,
    bus: EventBus,
    metrics: PipelineMetrics,
    sink: Arc<dyn AlertSink>,
    heatmap: Arc<HeatmapAggregator>,
    watermark: Option<Timestamp>,
    last_housekeeping: Option<Timestamp>,
    alerts: Vec<Alert>,
    alerts_total: u64,
    images_total: u64,
    images_valid: u64,
}

impl StorePipeline {
    pub fn new(
        settings: Arc<StoreSettings>,
        heatmap: Arc<HeatmapAggregator>,
        reorder_lateness_sec: i64,
        event_bus_capacity: usize,
        metrics: PipelineMetrics,
        sink: Arc<dyn AlertSink>,
    ) -> Self {
        let t = &settings.thresholds;
        let mut activity = ActivityLog::new(t.peak_bucket_sec);
        for cam in &settings.cameras {
            activity.register_camera(&cam.camera_id);
        }
        Self {
            visits: VisitManager::new(&settings.store_id),
            index: TrackIndex::new(),
            stitcher: Stitcher::new(t.stitch_window_sec, t.strong_match_score),
            footfall: FootfallCounter::new(t.reentry_cooldown_sec),
            dwell: DwellStats::default(),
            activity,
            risk: RiskEngine::new(t),
            ledger: AlertLedger::new(),
            reorder: ReorderBuffer::new(reorder_lateness_sec),
            bus: EventBus::new(event_bus_capacity),
            metrics,
            sink,
            heatmap,
            watermark: None,
            last_housekeeping: None,
            alerts: Vec::new(),
            alerts_total: 0,
            images_total: 0,
            images_valid: 0,
            settings,
        }
    }

    pub fn store_id(&self) -> &str {
        &self.settings.store_id
    }

    pub fn visits(&self) -> &VisitManager {
        &self.visits
    }

    /// Alerts still inside the retention horizon.
    pub fn alerts(&self) -> &[Alert] {
        &self.alerts
    }

    pub fn heatmap(&self) -> &HeatmapAggregator {
        &self.heatmap
    }

    pub fn watermark(&self) -> Option<Timestamp> {
        self.watermark
    }

    // ========================================================================
    // INPUT
    // ========================================================================

    pub fn submit(&mut self, item: StoreItem) {
        let (ts, rank) = (item.timestamp(), item.rank());
        match self.reorder.push(ts, rank, item) {
            PushOutcome::Accepted => {}
            PushOutcome::Late => self.metrics.inc(&self.metrics.late_events),
            PushOutcome::Duplicate => self.metrics.inc(&self.metrics.duplicate_events),
        }
        self.process_ready();
    }

    pub fn submit_track(&mut self, delta: TrackDelta) {
        self.submit(StoreItem::Track(delta));
    }

    pub fn submit_crossing(&mut self, event: EntryExitEvent) {
        self.submit(StoreItem::Crossing(event));
    }

    /// A frame was seen at `ts` (possibly empty): lets event time move on.
    pub fn observe_time(&mut self, ts: Timestamp) {
        self.reorder.observe(ts);
        self.process_ready();
    }

    pub fn record_frame(&mut self, camera_id: &str, ts: Timestamp, persons: u64) {
        self.activity.record_frame(camera_id, ts, persons);
    }

    /// A snapshot file was offered; `valid` is the outcome of validation.
    pub fn record_snapshot(&mut self, valid: bool) {
        self.images_total += 1;
        if valid {
            self.images_valid += 1;
        }
    }

    pub fn publish_heatmap(&mut self, delta: HeatmapDelta) {
        if !delta.is_empty() {
            self.bus.publish(OutboundEvent::HeatmapUpdated {
                store_id: self.settings.store_id.clone(),
                delta,
            });
        }
    }

    fn process_ready(&mut self) {
        for (ts, item) in self.reorder.pop_ready() {
            self.process(ts, item);
        }
        if let Some(through) = self.reorder.released_through() {
            self.advance(through);
        }
    }

    fn process(&mut self, ts: Timestamp, item: StoreItem) {
        // everything strictly before `ts` is final once `ts` is released
        self.advance(ts - 1);
        match item {
            StoreItem::Track(delta) => self.apply_track(&delta),
            StoreItem::Crossing(event) if event.direction == CrossingDirection::In => {
                self.apply_entry(&event)
            }
            StoreItem::Crossing(event) => self.apply_exit(&event),
        }
    }

    /// Release everything buffered and move event time to the newest item.
    pub fn flush(&mut self) {
        for (ts, item) in self.reorder.drain() {
            self.process(ts, item);
        }
        if let Some(max) = self.reorder.max_seen() {
            self.advance(max);
        }
    }

    /// End of input: flush, then settle every stitch still waiting on its window.
    pub fn finish(&mut self) {
        self.flush();
        let pending: Vec<VisitId> = self
            .visits
            .open_visits()
            .filter(|v| v.state == VisitState::Started)
            .map(|v| v.visit_id)
            .collect();
        for id in pending {
            self.finalize_stitch(id);
        }
    }

    // ========================================================================
    // WATERMARK
    // ========================================================================

    /// Event time reached `watermark`: stitch windows that closed, timeouts that expired.
    fn advance(&mut self, watermark: Timestamp) {
        if self.watermark.map_or(false, |w| watermark <= w) {
            return;
        }
        self.watermark = Some(watermark);

        let due: Vec<VisitId> = self
            .visits
            .open_visits()
            .filter(|v| v.state == VisitState::Started && self.stitcher.deadline(v.entry_ts) <= watermark)
            .map(|v| v.visit_id)
            .collect();
        for id in due {
            self.finalize_stitch(id);
        }

        let max_dwell = self.settings.thresholds.max_store_dwell_sec;
        let expired: Vec<VisitId> = self
            .visits
            .open_visits()
            .filter(|v| v.entry_ts + max_dwell <= watermark)
            .map(|v| v.visit_id)
            .collect();
        for id in expired {
            if self.visits.get(id).map(|v| v.state) == Some(VisitState::Started) {
                self.finalize_stitch(id);
            }
            self.close_visit(id, ClosureCause::Timeout, watermark, None);
        }

        let horizon = 2 * self.stitcher.window_sec();
        self.index.prune(watermark - horizon);
        self.footfall.prune(watermark);

        let housekeeping_due = self
            .last_housekeeping
            .map_or(true, |last| watermark - last >= HOUSEKEEPING_EVERY_SEC);
        if housekeeping_due {
            self.housekeeping(watermark);
        }
    }

    /// Drop everything that ended before the retention horizon.
    fn housekeeping(&mut self, watermark: Timestamp) {
        self.last_housekeeping = Some(watermark);
        let horizon = watermark - self.settings.thresholds.retention_sec;

        let visits = self.visits.evict_closed(horizon);
        let ledger = self.ledger.prune(horizon);
        let held = self.alerts.len();
        self.alerts.retain(|a| a.created_ts >= horizon);
        let alerts = held - self.alerts.len();
        let cells = self.heatmap.rotate(self.heatmap.bucket_start(horizon));
        let buckets = self.activity.rotate(horizon) + self.footfall.rotate(horizon);

        if visits + ledger + alerts + cells + buckets > 0 {
            debug!(
                "{}: retention before t={}: {} visit(s), {} ledger entries, {} alert(s), {} heatmap key(s), {} bucket(s) dropped",
                self.settings.store_id, horizon, visits, ledger, alerts, cells, buckets
            );
        }
    }

    fn finalize_stitch(&mut self, id: VisitId) {
        let Some(entry_ts) = self.visits.get(id).map(|v| v.entry_ts) else {
            return;
        };
        let later_entries: Vec<Timestamp> = self
            .visits
            .open_visits()
            .filter(|v| v.state == VisitState::Started && v.visit_id != id && v.entry_ts > entry_ts)
            .map(|v| v.entry_ts)
            .collect();

        let update = self
            .stitcher
            .stitch(id, entry_ts, &later_entries, &self.index)
            .into_update(id);
        for link in &update.links {
            self.index.claim(&link.track, id);
        }
        match self.visits.mark_stitched(id, update) {
            Ok(visit) => {
                let visit = visit.clone();
                self.bus.publish(OutboundEvent::VisitStitched { visit });
            }
            Err(e) => self.state_conflict(e),
        }
    }

    fn state_conflict(&self, e: VisitError) {
        self.metrics.inc(&self.metrics.terminal_noops);
        warn!("{}: {} (ignored)", self.settings.store_id, e);
    }

    // ========================================================================
    // APPLY
    // ========================================================================

    fn apply_track(&mut self, delta: &TrackDelta) {
        let Some(camera) = self.settings.camera(&delta.camera_id) else {
            debug!("{}: track from unknown camera {}", self.settings.store_id, delta.camera_id);
            return;
        };
        match delta.kind {
            TrackEventKind::Started => self.metrics.inc(&self.metrics.tracks_started),
            TrackEventKind::Ended => self.metrics.inc(&self.metrics.tracks_ended),
            TrackEventKind::Updated => {}
        }
        self.index.observe(delta, camera);
    }

    fn apply_entry(&mut self, event: &EntryExitEvent) {
        self.metrics.inc(&self.metrics.entries);
        self.footfall.record(event);

        let source = event.source_key();
        if let Some(existing) = self.visits.find_open_by_entry_track(&source) {
            self.metrics.inc(&self.metrics.duplicate_entries);
            debug!(
                "{}: IN from {} ignored, visit {} already open",
                self.settings.store_id, source, existing
            );
            return;
        }

        let id = self.visits.start(event);
        self.metrics.inc(&self.metrics.visits_started);
        if let Ok(visit) = self.visits.snapshot(id) {
            self.bus.publish(OutboundEvent::VisitStarted { visit });
        }
    }

    fn apply_exit(&mut self, event: &EntryExitEvent) {
        self.metrics.inc(&self.metrics.exits);
        self.footfall.record(event);

        let Some(id) = self
            .stitcher
            .match_exit(event, self.visits.open_visits(), &self.index)
        else {
            self.metrics.inc(&self.metrics.unmatched_exits);
            debug!(
                "{}: OUT at t={} from {} matched no open visit",
                self.settings.store_id,
                event.timestamp,
                event.source_key()
            );
            return;
        };

        if self.visits.get(id).map(|v| v.state) == Some(VisitState::Started) {
            self.finalize_stitch(id);
        }
        self.close_visit(id, ClosureCause::ExitEvent, event.timestamp, Some(event.source_key()));
    }

    // ========================================================================
    // CLOSURE
    // ========================================================================

    fn close_visit(
        &mut self,
        id: VisitId,
        cause: ClosureCause,
        exit_ts: Timestamp,
        exit_track: Option<TrackKey>,
    ) {
        let visit = match self.visits.snapshot(id) {
            Ok(v) => v,
            Err(e) => return self.state_conflict(e),
        };
        let t = &self.settings.thresholds;

        // a timed-out visit ends at its last interior sighting, not at the watermark
        let exit_ts = match cause {
            ClosureCause::ExitEvent => exit_ts,
            ClosureCause::Timeout => self
                .index
                .summarize(&visit, None, visit.entry_ts, visit.entry_ts)
                .last_activity
                .unwrap_or(visit.entry_ts),
        };
        let activity = self.index.summarize(
            &visit,
            exit_track.as_ref(),
            exit_ts - t.bag_check_window_sec,
            exit_ts,
        );

        if activity.bag_seen {
            match self.visits.record_bag_evidence(id) {
                Ok(true) => self.bus.publish(OutboundEvent::BagEvidenceDetected {
                    store_id: self.settings.store_id.clone(),
                    visit_id: id,
                    timestamp: exit_ts,
                }),
                Ok(false) => {}
                Err(e) => return self.state_conflict(e),
            }
        }

        let request = CloseRequest {
            exit_ts,
            cause,
            observed_dwell_sec: activity.observed_dwell_sec,
            hotspot_contributions: activity.hotspot_contributions,
        };
        let closed = match self.visits.close(id, request, t.bounce_threshold_sec) {
            Ok(v) => v,
            Err(e) => return self.state_conflict(e),
        };

        self.metrics.inc(&self.metrics.visits_closed);
        if cause == ClosureCause::Timeout {
            self.metrics.inc(&self.metrics.visits_timed_out);
        }
        self.dwell.record(&closed);
        self.index.release_visit(&closed);

        self.bus.publish(OutboundEvent::VisitEnded {
            visit: closed.clone(),
        });
        if closed.state == VisitState::Bounced {
            self.metrics.inc(&self.metrics.visits_bounced);
            self.bus.publish(OutboundEvent::BounceDetected {
                visit: closed.clone(),
            });
        }

        match self.risk.evaluate(&closed, exit_ts) {
            RiskDecision::Alert(mut alert) => {
                if !self.ledger.admit(closed.visit_id, exit_ts) {
                    return;
                }
                alerts::dispatch(self.sink.as_ref(), &mut alert);
                self.metrics.inc(&self.metrics.alerts);
                self.alerts_total += 1;
                self.alerts.push(alert.clone());
                self.bus.publish(OutboundEvent::LossOfSaleSuspected { alert });
            }
            RiskDecision::Dropped { .. } => self.metrics.inc(&self.metrics.risk_dropped),
            RiskDecision::NotCandidate(_) => {}
        }
    }

    // ========================================================================
    // OUTPUT
    // ========================================================================

    pub fn drain_events(&mut self) -> Vec<OutboundEvent> {
        self.bus.drain()
    }

    pub fn summary(&self, top_zones: usize, active_tracks: BTreeMap<String, usize>) -> StoreSummary {
        let camera_hotspots = self.activity.camera_ranking();
        let top_camera_hotspot = camera_hotspots
            .first()
            .filter(|c| c.relevant_frames > 0)
            .map(|c| c.camera_id.clone());
        let summary = StoreSummary {
            store_id: self.settings.store_id.clone(),
            footfall: self.footfall.total(),
            footfall_continuations: self.footfall.continuations(),
            footfall_hourly: self
                .footfall
                .hourly()
                .iter()
                .filter_map(|(hour, n)| format_hour(*hour).map(|h| (h, *n)))
                .collect(),
            footfall_daily: self.footfall.daily(),
            visits_started: self.visits.started_count(),
            visits_open: self.visits.open_count(),
            dwell: self.dwell.clone(),
            mean_store_dwell_sec: self.dwell.mean_store_dwell_sec(),
            bounce_rate: self.dwell.bounce_rate(),
            alerts: self.alerts_total,
            images_total: self.images_total,
            images_valid: self.images_valid,
            events_dropped: self.bus.dropped_count(),
            active_tracks,
            top_camera_hotspot,
            peak_time_bucket: self.activity.peak_bucket().and_then(format_bucket),
            camera_hotspots,
            top_zones: self.heatmap.top_zones(top_zones, None),
        };
        info!(
            "{}: footfall={} visits={} open={} bounces={} alerts={}",
            summary.store_id,
            summary.footfall,
            summary.visits_started,
            summary.visits_open,
            summary.dwell.bounced,
            summary.alerts
        );
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::LogSink;
    use crate::config::{CameraConfig, CameraRole, LineConfig, LineSide, StoreConfig};
    use crate::config::{ThresholdOverrides, TrackerOverrides};
    use crate::types::{BBox, StitchConfidence, Visit};
    use crate::types::ReasonCode;
    use std::collections::BTreeSet;

    fn settings() -> Arc<StoreSettings> {
        settings_with(ThresholdOverrides::default())
    }

    fn settings_with(overrides: ThresholdOverrides) -> Arc<StoreSettings> {
        let cameras = vec![
            CameraConfig {
                camera_id: "D01".into(),
                role: CameraRole::Entrance,
                entrance_line: Some(LineConfig {
                    a: [0.0, 200.0],
                    b: [640.0, 200.0],
                    inside: LineSide::Left,
                    dead_band: 4.0,
                }),
                doorway_zone: None,
                grid: None,
                zones: vec![],
            },
            CameraConfig {
                camera_id: "D02".into(),
                role: CameraRole::Interior,
                entrance_line: None,
                doorway_zone: Some(BBox::new(0.0, 0.0, 100.0, 300.0)),
                grid: None,
                zones: vec![],
            },
        ];
        let store = StoreConfig::new("s1", cameras);
        Arc::new(
            store
                .resolve(&overrides, &TrackerOverrides::default())
                .unwrap(),
        )
    }

    fn pipeline() -> StorePipeline {
        pipeline_from(settings(), 1000)
    }

    fn pipeline_from(settings: Arc<StoreSettings>, bus_capacity: usize) -> StorePipeline {
        let t = &settings.thresholds;
        let heatmap = Arc::new(HeatmapAggregator::new(t.hotspot_bucket_sec, 0.25));
        StorePipeline::new(
            settings,
            heatmap,
            5,
            bus_capacity,
            PipelineMetrics::new(),
            Arc::new(LogSink),
        )
    }

    fn heat_delta(ts: Timestamp) -> HeatmapDelta {
        HeatmapDelta {
            camera_id: "D02".into(),
            bucket_start: ts,
            cells: vec![(1, 1)],
            zones: vec!["checkout".into()],
        }
    }

    fn crossing(direction: CrossingDirection, ts: Timestamp, track: u64) -> StoreItem {
        StoreItem::Crossing(EntryExitEvent {
            store_id: "s1".into(),
            camera_id: "D01".into(),
            direction,
            timestamp: ts,
            source_track_id: track,
        })
    }

    fn interior(kind: TrackEventKind, ts: Timestamp, track: u64, bbox: Option<BBox>) -> StoreItem {
        StoreItem::Track(TrackDelta {
            camera_id: "D02".into(),
            track_id: track,
            kind,
            timestamp: ts,
            bbox,
            bag_seen: false,
        })
    }

    fn doorway() -> BBox {
        BBox::new(10.0, 10.0, 60.0, 200.0)
    }

    fn only_visit(p: &StorePipeline) -> Visit {
        let all: Vec<&Visit> = p.visits().closed_visits().collect();
        assert_eq!(all.len(), 1, "expected exactly one closed visit");
        all[0].clone()
    }

    #[test]
    fn test_scenario_a_long_visit_without_bag_alerts() {
        let mut p = pipeline();
        p.submit(crossing(CrossingDirection::In, 0, 1));
        p.submit(interior(TrackEventKind::Started, 3, 7, Some(doorway())));
        p.submit(interior(TrackEventKind::Updated, 60, 7, Some(BBox::new(300.0, 10.0, 350.0, 200.0))));
        p.submit(interior(TrackEventKind::Ended, 190, 7, None));
        p.submit(crossing(CrossingDirection::Out, 200, 1));
        p.finish();

        let v = only_visit(&p);
        assert_eq!(v.state, VisitState::Ended);
        assert_eq!(v.store_dwell_sec, Some(200));
        assert_eq!(v.stitch_confidence, StitchConfidence::High);
        assert_eq!(v.bounce_flag, Some(false));
        assert_eq!(v.observed_dwell_sec, Some(57));

        assert_eq!(p.alerts().len(), 1);
        let alert = &p.alerts()[0];
        assert!(alert.risk_score >= 0.75);
        let expected: BTreeSet<ReasonCode> =
            [ReasonCode::LongDwell, ReasonCode::NoBagEvidence].into_iter().collect();
        assert_eq!(alert.reason_codes, expected);

        let names: Vec<&str> = p.drain_events().iter().map(|e| e.name()).collect();
        assert_eq!(
            names,
            vec!["VISIT_STARTED", "VISIT_STITCHED", "VISIT_ENDED", "LOSS_OF_SALE_SUSPECTED"]
        );
    }

    #[test]
    fn test_scenario_b_short_visit_bounces_without_alert() {
        let mut p = pipeline();
        p.submit(crossing(CrossingDirection::In, 0, 1));
        p.submit(crossing(CrossingDirection::Out, 45, 1));
        p.finish();

        let v = only_visit(&p);
        assert_eq!(v.state, VisitState::Bounced);
        assert_eq!(v.store_dwell_sec, Some(45));
        assert_eq!(v.bounce_flag, Some(true));
        assert!(p.alerts().is_empty());
    }

    #[test]
    fn test_scenario_c_entrance_only_visit() {
        let mut p = pipeline();
        p.submit(crossing(CrossingDirection::In, 0, 1));
        p.submit(crossing(CrossingDirection::Out, 300, 1));
        p.finish();

        let v = only_visit(&p);
        assert_eq!(v.state, VisitState::Ended);
        assert_eq!(v.stitch_confidence, StitchConfidence::Low);
        assert_eq!(v.store_dwell_sec, Some(300));
        assert_eq!(v.observed_dwell_sec, None);
    }

    #[test]
    fn test_out_of_order_delivery_within_lateness() {
        let mut p = pipeline();
        p.submit(interior(TrackEventKind::Started, 3, 7, Some(doorway())));
        p.submit(crossing(CrossingDirection::In, 0, 1));
        p.submit(crossing(CrossingDirection::Out, 200, 1));
        p.finish();
        assert_eq!(only_visit(&p).stitch_confidence, StitchConfidence::High);
    }

    #[test]
    fn test_bag_near_exit_blocks_alert() {
        let mut p = pipeline();
        p.submit(crossing(CrossingDirection::In, 0, 1));
        p.submit(interior(TrackEventKind::Started, 3, 7, Some(doorway())));
        p.submit(StoreItem::Track(TrackDelta {
            camera_id: "D02".into(),
            track_id: 7,
            kind: TrackEventKind::Updated,
            timestamp: 195,
            bbox: Some(doorway()),
            bag_seen: true,
        }));
        p.submit(crossing(CrossingDirection::Out, 200, 1));
        p.finish();

        let v = only_visit(&p);
        assert!(v.bag_evidence_seen);
        assert!(p.alerts().is_empty());
        let names: Vec<&str> = p.drain_events().iter().map(|e| e.name()).collect();
        assert!(names.contains(&"BAG_EVIDENCE_DETECTED"));
    }

    #[test]
    fn test_timeout_closes_once_and_later_out_is_ignored() {
        let mut p = pipeline();
        p.submit(crossing(CrossingDirection::In, 0, 1));
        p.submit(interior(TrackEventKind::Started, 2, 7, Some(doorway())));
        p.submit(interior(TrackEventKind::Updated, 500, 7, Some(doorway())));
        // ceiling is 4h; time moves past it before the OUT shows up
        p.observe_time(4 * 3600 + 10);
        p.submit(crossing(CrossingDirection::Out, 4 * 3600 + 20, 1));
        p.finish();

        let v = only_visit(&p);
        assert_eq!(v.closure_cause, Some(ClosureCause::Timeout));
        assert_eq!(v.exit_ts, Some(500));
        assert_eq!(v.stitch_confidence, StitchConfidence::Low);
        assert!(v.inferred_endpoint);
        assert_eq!(p.metrics.summary().visits_timed_out, 1);
        assert_eq!(p.metrics.summary().unmatched_exits, 1);
        assert!(p.alerts().is_empty());
    }

    #[test]
    fn test_out_before_ceiling_wins_over_timeout() {
        let mut p = pipeline();
        p.submit(crossing(CrossingDirection::In, 0, 1));
        p.submit(crossing(CrossingDirection::Out, 4 * 3600 - 1, 1));
        p.observe_time(5 * 3600);
        p.finish();
        let v = only_visit(&p);
        assert_eq!(v.closure_cause, Some(ClosureCause::ExitEvent));
        assert_eq!(p.metrics.summary().visits_timed_out, 0);
    }

    #[test]
    fn test_duplicate_in_does_not_open_second_visit() {
        let mut p = pipeline();
        p.submit(crossing(CrossingDirection::In, 0, 1));
        p.submit(crossing(CrossingDirection::In, 3, 1));
        p.finish();
        assert_eq!(p.visits().total_count(), 1);
        assert_eq!(p.metrics.summary().duplicate_entries, 1);
    }

    #[test]
    fn test_two_entries_share_doorway_track() {
        let mut p = pipeline();
        p.submit(crossing(CrossingDirection::In, 0, 1));
        p.submit(crossing(CrossingDirection::In, 4, 2));
        p.submit(interior(TrackEventKind::Started, 6, 7, Some(doorway())));
        p.submit(crossing(CrossingDirection::Out, 300, 1));
        p.submit(crossing(CrossingDirection::Out, 301, 2));
        p.finish();

        let mut closed: Vec<Visit> = p.visits().closed_visits().cloned().collect();
        closed.sort_by_key(|v| v.visit_id);
        assert_eq!(closed[0].stitch_confidence, StitchConfidence::Low);
        assert_eq!(closed[1].stitch_confidence, StitchConfidence::High);
    }

    #[test]
    fn test_stitching_is_deterministic_across_runs() {
        let run = || {
            let mut p = pipeline();
            p.submit(crossing(CrossingDirection::In, 0, 1));
            p.submit(interior(TrackEventKind::Started, 2, 7, Some(doorway())));
            p.submit(interior(TrackEventKind::Started, 4, 8, Some(doorway())));
            p.submit(crossing(CrossingDirection::Out, 250, 1));
            p.finish();
            let v = only_visit(&p);
            (v.stitch_confidence, v.links, v.stitch_audit)
        };
        let first = run();
        assert_eq!(first.0, StitchConfidence::Med);
        assert_eq!(first, run());
    }

    #[test]
    fn test_heatmap_flood_does_not_evict_visit_events() {
        let mut p = pipeline_from(settings(), 16);
        p.submit(crossing(CrossingDirection::In, 0, 1));
        p.submit(crossing(CrossingDirection::Out, 300, 1));
        for ts in 0..1000 {
            p.publish_heatmap(heat_delta(ts));
        }
        p.finish();

        let events = p.drain_events();
        let names: Vec<&str> = events
            .iter()
            .map(|e| e.name())
            .filter(|n| *n != "HEATMAP_UPDATED")
            .collect();
        assert_eq!(
            names,
            vec!["VISIT_STARTED", "VISIT_STITCHED", "VISIT_ENDED", "LOSS_OF_SALE_SUSPECTED"]
        );
        assert_eq!(events.len(), 4 + 16);
        assert_eq!(p.summary(5, BTreeMap::new()).events_dropped, 1000 - 16);
    }

    #[test]
    fn test_retention_bounds_closed_visits_alerts_and_buckets() {
        let overrides = ThresholdOverrides {
            retention_sec: Some(600),
            ..Default::default()
        };
        let mut p = pipeline_from(settings_with(overrides), 1000);

        let camera = CameraConfig {
            camera_id: "D02".into(),
            role: CameraRole::Interior,
            entrance_line: None,
            doorway_zone: None,
            grid: Some(crate::config::GridConfig {
                width: 400.0,
                height: 400.0,
                rows: 4,
                cols: 4,
            }),
            zones: vec![crate::config::ZoneConfig {
                name: "checkout".into(),
                rect: BBox::new(0.0, 0.0, 400.0, 400.0),
                hotspot: true,
            }],
        };
        let frame = crate::types::FrameDetections {
            camera_id: "D02".into(),
            timestamp: 0,
            detections: vec![crate::types::Detection {
                camera_id: "D02".into(),
                timestamp: 0,
                bbox: BBox::new(40.0, 40.0, 60.0, 60.0),
                class: crate::types::ObjectClass::Person,
                confidence: 0.9,
            }],
            detection_error: None,
        };
        p.heatmap().apply_frame(&camera, &frame);
        p.record_frame("D02", 0, 1);
        assert_eq!(p.heatmap().zone_totals().len(), 1);

        for i in 0..50u64 {
            let entry = i as Timestamp * 1000;
            p.submit(crossing(CrossingDirection::In, entry, i + 1));
            p.submit(crossing(CrossingDirection::Out, entry + 300, i + 1));
        }
        p.finish();

        assert!(p.visits().total_count() <= 2, "{} visits retained", p.visits().total_count());
        assert!(p.ledger.len() <= 2, "{} ledger entries retained", p.ledger.len());
        assert!(p.alerts().len() <= 2);
        assert!(p.heatmap().zone_totals().is_empty());
        assert!(p.heatmap().cell_totals().is_empty());

        let summary = p.summary(5, BTreeMap::new());
        assert_eq!(summary.visits_started, 50);
        assert_eq!(summary.dwell.closed, 50);
        assert_eq!(summary.alerts, 50);
        assert_eq!(summary.footfall, 50);
        assert!(summary.footfall_hourly.len() <= 2);
        assert_eq!(summary.peak_time_bucket, None);
        assert_eq!(summary.camera_hotspots[0].total_people, 1);
    }

    #[test]
    fn test_timed_out_entrance_only_visits_skip_bounce_rate() {
        let mut p = pipeline();
        p.submit(crossing(CrossingDirection::In, 0, 1));
        p.submit(crossing(CrossingDirection::Out, 300, 1));
        // nothing ever linked: closes at its entry once the 4h ceiling passes
        p.submit(crossing(CrossingDirection::In, 400, 2));
        p.observe_time(5 * 3600);
        p.finish();

        let summary = p.summary(5, BTreeMap::new());
        assert_eq!(summary.dwell.closed, 2);
        assert_eq!(summary.dwell.timed_out, 1);
        assert_eq!(summary.bounce_rate, Some(0.0));
        assert_eq!(summary.mean_store_dwell_sec, Some(300.0));
    }

    #[test]
    fn test_snapshot_counts_in_summary() {
        let mut p = pipeline();
        p.record_snapshot(true);
        p.record_snapshot(false);
        p.record_snapshot(true);
        let summary = p.summary(5, BTreeMap::from([("D02".to_string(), 3)]));
        assert_eq!(summary.images_total, 3);
        assert_eq!(summary.images_valid, 2);
        assert_eq!(summary.active_tracks.get("D02"), Some(&3));
    }

    #[test]
    fn test_closed_visit_invariants_hold() {
        let mut p = pipeline();
        let mut items = Vec::new();
        for (i, (entry, exit)) in [(0, 30), (10, 400), (20, 121), (30, 149)].iter().enumerate() {
            items.push(crossing(CrossingDirection::In, *entry, i as u64 + 1));
            items.push(crossing(CrossingDirection::Out, *exit, i as u64 + 1));
        }
        items.sort_by_key(|item| (item.timestamp(), item.rank()));
        for item in items {
            p.submit(item);
        }
        p.finish();
        assert_eq!(p.visits().closed_visits().count(), 4);
        let thr = p.settings.thresholds.bounce_threshold_sec;
        for v in p.visits().closed_visits() {
            let (entry, exit) = (v.entry_ts, v.exit_ts.unwrap());
            assert!(entry <= exit);
            assert_eq!(v.store_dwell_sec, Some(exit - entry));
            assert_eq!(v.bounce_flag, Some(exit - entry < thr));
        }
    }
}
