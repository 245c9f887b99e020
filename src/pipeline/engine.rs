// src/pipeline/engine.rs
//
// Multi-store engine. Stores are independent: each has its own exclusive
// section (the StorePipeline mutex) and one lane per camera, so different
// stores, and different cameras of one store, never wait on each other.
//
//   envelope ─┬─ FRAME_INGESTED ── detector ─┐
//             ├─ DETECTIONS_CREATED ─────────┴─ camera lane (tracker, line)
//             │                                   ├─ heatmap (sharded, lock-free for the store)
//             │                                   └─ store pipeline
//             ├─ TRACK_* ─────────────────────────── store pipeline
//             └─ ENTRY/EXIT_DETECTED ─────────────── store pipeline
//
// Event time also moves without input: `spawn_clock` ticks `advance_all`
// so stitch windows close and stale visits time out on a quiet feed.

use crate::alerts::AlertSink;
use crate::config::{CameraRole, Config, EngineConfig, StoreSettings};
use crate::detector::{build_detector, validate_snapshot, Detector, FrameRef};
use crate::error::{ConfigError, EngineError};
use crate::metrics::{HeatmapAggregator, StoreSummary};
use crate::pipeline::envelope::{Envelope, Inbound};
use crate::pipeline::event_bus::OutboundEvent;
use crate::pipeline::metrics::PipelineMetrics;
use crate::pipeline::store_pipeline::StorePipeline;
use crate::tracking::{LineCrossingDetector, PersonTracker};
use crate::types::{EntryExitEvent, FrameDetections, ObjectClass, Timestamp, TrackDelta};
use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

struct CameraLane {
    tracker: PersonTracker,
    crossing: Option<LineCrossingDetector>,
}

struct StoreHandle {
    settings: Arc<StoreSettings>,
    detector: Box<dyn Detector>,
    lanes: HashMap<String, Mutex<CameraLane>>,
    heatmap: Arc<HeatmapAggregator>,
    pipeline: Mutex<StorePipeline>,
}

pub struct Engine {
    config: EngineConfig,
    stores: RwLock<HashMap<String, Arc<StoreHandle>>>,
    metrics: PipelineMetrics,
    sink: Arc<dyn AlertSink>,
}

impl Engine {
    pub fn new(config: EngineConfig, sink: Arc<dyn AlertSink>) -> Self {
        Self {
            config,
            stores: RwLock::new(HashMap::new()),
            metrics: PipelineMetrics::new(),
            sink,
        }
    }

    pub fn metrics(&self) -> &PipelineMetrics {
        &self.metrics
    }

    // ========================================================================
    // ONBOARDING
    // ========================================================================

    /// Register a resolved store. Its detector backend is chosen here.
    pub async fn onboard(&self, settings: StoreSettings) -> Result<(), EngineError> {
        let mut stores = self.stores.write().await;
        if stores.contains_key(&settings.store_id) {
            return Err(ConfigError::DuplicateStore(settings.store_id.clone()).into());
        }

        let settings = Arc::new(settings);
        let lanes = settings
            .cameras
            .iter()
            .map(|cam| {
                let crossing = match (cam.role, &cam.entrance_line) {
                    (CameraRole::Entrance, Some(line)) => Some(LineCrossingDetector::new(
                        &settings.store_id,
                        &cam.camera_id,
                        line.clone(),
                    )),
                    _ => None,
                };
                let lane = CameraLane {
                    tracker: PersonTracker::new(&cam.camera_id, settings.tracker.clone()),
                    crossing,
                };
                (cam.camera_id.clone(), Mutex::new(lane))
            })
            .collect();

        let heatmap = Arc::new(HeatmapAggregator::new(
            settings.thresholds.hotspot_bucket_sec,
            settings.tracker.min_confidence,
        ));
        let handle = StoreHandle {
            detector: build_detector(settings.detector),
            heatmap: heatmap.clone(),
            pipeline: Mutex::new(StorePipeline::new(
                settings.clone(),
                heatmap,
                self.config.reorder_lateness_sec,
                self.config.event_bus_capacity,
                self.metrics.clone(),
                self.sink.clone(),
            )),
            lanes,
            settings: settings.clone(),
        };
        info!(
            "🏬 Store {} onboarded: {} camera(s) ({} interior), detector={}",
            settings.store_id,
            settings.cameras.len(),
            settings.interior_cameras().count(),
            handle.detector.name()
        );
        stores.insert(settings.store_id.clone(), Arc::new(handle));
        Ok(())
    }

    /// Onboard every store in the config. A store with a configuration error
    /// is not started; the others are. Returns the errors.
    pub async fn onboard_all(&self, config: &Config) -> Vec<ConfigError> {
        let mut failures = Vec::new();
        for resolved in config.resolve_stores() {
            let result = match resolved {
                Ok(settings) => self.onboard(settings).await,
                Err(e) => Err(e.into()),
            };
            match result {
                Ok(()) => {}
                Err(EngineError::Config(e)) => {
                    error!("Store onboarding failed: {}", e);
                    failures.push(e);
                }
                Err(e) => error!("Store onboarding failed: {}", e),
            }
        }
        failures
    }

    async fn store(&self, store_id: &str) -> Result<Arc<StoreHandle>, EngineError> {
        self.stores
            .read()
            .await
            .get(store_id)
            .cloned()
            .ok_or_else(|| EngineError::UnknownStore(store_id.to_string()))
    }

    pub async fn store_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.stores.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    // ========================================================================
    // INGEST
    // ========================================================================

    pub async fn ingest(&self, envelope: &Envelope) -> Result<(), EngineError> {
        let result = self.route(envelope).await;
        if result.is_err() {
            self.metrics.inc(&self.metrics.rejected_events);
        }
        result
    }

    async fn route(&self, envelope: &Envelope) -> Result<(), EngineError> {
        let store_id = envelope.store_id.as_str();
        match envelope.decode()? {
            Inbound::Frame(frame) => self.ingest_snapshot(store_id, frame).await,
            Inbound::Detections(frame) => self.ingest_frame(store_id, frame).await,
            Inbound::Track(delta) => self.ingest_track(store_id, delta).await,
            Inbound::Crossing(event) => self.ingest_crossing(event).await,
        }
    }

    /// Validate a snapshot and run the store's detector on it. An invalid file
    /// or a detector failure becomes an empty frame carrying the reason.
    pub async fn ingest_snapshot(&self, store_id: &str, frame: FrameRef) -> Result<(), EngineError> {
        let store = self.store(store_id).await?;
        if store.settings.camera(&frame.camera_id).is_none() {
            return Err(EngineError::UnknownCamera {
                store_id: store_id.to_string(),
                camera_id: frame.camera_id,
            });
        }

        let checked = validate_snapshot(&frame.path);
        store.pipeline.lock().await.record_snapshot(checked.is_ok());
        let detections = match checked.and_then(|()| store.detector.detect(&frame)) {
            Ok(detections) => FrameDetections {
                camera_id: frame.camera_id.clone(),
                timestamp: frame.timestamp,
                detections,
                detection_error: None,
            },
            Err(e) => {
                warn!(
                    "{}/{} t={}: {}, continuing with empty frame",
                    store_id, frame.camera_id, frame.timestamp, e
                );
                FrameDetections {
                    detection_error: Some(e.to_string()),
                    ..FrameDetections::empty(&frame.camera_id, frame.timestamp)
                }
            }
        };
        self.ingest_frame(store_id, detections).await
    }

    pub async fn ingest_frame(&self, store_id: &str, frame: FrameDetections) -> Result<(), EngineError> {
        let store = self.store(store_id).await?;
        let camera = store
            .settings
            .camera(&frame.camera_id)
            .ok_or_else(|| EngineError::UnknownCamera {
                store_id: store_id.to_string(),
                camera_id: frame.camera_id.clone(),
            })?;
        let lane = store
            .lanes
            .get(&frame.camera_id)
            .ok_or_else(|| EngineError::UnknownCamera {
                store_id: store_id.to_string(),
                camera_id: frame.camera_id.clone(),
            })?;

        self.metrics.inc(&self.metrics.frames);
        if frame.detection_error.is_some() {
            self.metrics.inc(&self.metrics.detection_errors);
        }

        let (deltas, crossings) = {
            let mut lane = lane.lock().await;
            let deltas = lane.tracker.update(&frame);
            let crossings = match lane.crossing.as_mut() {
                Some(line) => line.process(&deltas),
                None => Vec::new(),
            };
            (deltas, crossings)
        };

        let heatmap_delta = (camera.role == CameraRole::Interior)
            .then(|| store.heatmap.apply_frame(camera, &frame));
        let min_conf = store.settings.tracker.min_confidence;
        let persons = frame
            .usable()
            .filter(|d| d.class == ObjectClass::Person && d.confidence >= min_conf)
            .count() as u64;
        debug!(
            "{}/{} t={}: {} person(s), {} track event(s), {} crossing(s)",
            store_id,
            frame.camera_id,
            frame.timestamp,
            persons,
            deltas.len(),
            crossings.len()
        );

        let mut pipeline = store.pipeline.lock().await;
        pipeline.record_frame(&frame.camera_id, frame.timestamp, persons);
        if let Some(delta) = heatmap_delta {
            pipeline.publish_heatmap(delta);
        }
        for delta in deltas {
            pipeline.submit_track(delta);
        }
        for crossing in crossings {
            pipeline.submit_crossing(crossing);
        }
        pipeline.observe_time(frame.timestamp);
        Ok(())
    }

    /// Track event from an external tracker.
    pub async fn ingest_track(&self, store_id: &str, delta: TrackDelta) -> Result<(), EngineError> {
        let store = self.store(store_id).await?;
        if store.settings.camera(&delta.camera_id).is_none() {
            return Err(EngineError::UnknownCamera {
                store_id: store_id.to_string(),
                camera_id: delta.camera_id,
            });
        }
        store.pipeline.lock().await.submit_track(delta);
        Ok(())
    }

    /// Crossing from an external line detector.
    pub async fn ingest_crossing(&self, event: EntryExitEvent) -> Result<(), EngineError> {
        let store = self.store(&event.store_id).await?;
        if store.settings.camera(&event.camera_id).is_none() {
            return Err(EngineError::UnknownCamera {
                store_id: event.store_id,
                camera_id: event.camera_id,
            });
        }
        store.pipeline.lock().await.submit_crossing(event);
        Ok(())
    }

    // ========================================================================
    // TIME & OUTPUT
    // ========================================================================

    /// Wall-clock tick: expire silent tracks and let every store's event time
    /// reach `now`, which fires due stitches and timeouts.
    pub async fn advance_all(&self, now: Timestamp) {
        let stores: Vec<Arc<StoreHandle>> = self.stores.read().await.values().cloned().collect();
        for store in stores {
            let mut ended = Vec::new();
            for lane in store.lanes.values() {
                ended.extend(lane.lock().await.tracker.expire(now));
            }
            let mut pipeline = store.pipeline.lock().await;
            for delta in ended {
                pipeline.submit_track(delta);
            }
            pipeline.observe_time(now);
        }
    }

    /// Drive `advance_all` from a timer. `now` supplies the event-time second
    /// for each tick; use `Engine::wall_clock` for live feeds.
    pub fn spawn_clock<F>(self: &Arc<Self>, period: Duration, now: F) -> JoinHandle<()>
    where
        F: Fn() -> Timestamp + Send + 'static,
    {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!("⏱️  Engine clock running every {:?}", period);
            loop {
                interval.tick().await;
                engine.advance_all(now()).await;
            }
        })
    }

    pub fn wall_clock() -> Timestamp {
        Utc::now().timestamp()
    }

    /// End of input for every store.
    pub async fn finish(&self) {
        let stores: Vec<Arc<StoreHandle>> = self.stores.read().await.values().cloned().collect();
        for store in stores {
            store.pipeline.lock().await.finish();
        }
    }

    /// Outbound events from all stores, grouped by store id.
    pub async fn drain_events(&self) -> Vec<OutboundEvent> {
        let mut ids: Vec<(String, Arc<StoreHandle>)> = self
            .stores
            .read()
            .await
            .iter()
            .map(|(id, s)| (id.clone(), s.clone()))
            .collect();
        ids.sort_by(|a, b| a.0.cmp(&b.0));

        let mut events = Vec::new();
        for (_, store) in ids {
            events.extend(store.pipeline.lock().await.drain_events());
        }
        events
    }

    pub async fn summary(&self, store_id: &str) -> Result<StoreSummary, EngineError> {
        let store = self.store(store_id).await?;
        let mut active_tracks = BTreeMap::new();
        for (camera_id, lane) in &store.lanes {
            active_tracks.insert(camera_id.clone(), lane.lock().await.tracker.active_count());
        }
        let pipeline = store.pipeline.lock().await;
        Ok(pipeline.summary(self.config.top_zones, active_tracks))
    }

    pub async fn summaries(&self) -> Vec<StoreSummary> {
        let mut out = Vec::new();
        for id in self.store_ids().await {
            if let Ok(summary) = self.summary(&id).await {
                out.push(summary);
            }
        }
        out
    }
}
