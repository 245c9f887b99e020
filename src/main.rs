// src/main.rs
//
// Feed envelopes through the engine and print what comes out, one JSON
// event per line, followed by the per-store summaries.
//
//   store-visits [config.yaml] [events.jsonl | snapshots/ | -]
//
// A file or snapshot directory is replayed in event time. `-` reads live
// JSON-lines envelopes from stdin; a wall-clock tick keeps event time moving
// while the feed is quiet.
//
// Snapshot directories are laid out as <root>/<store_id>/HH-MM-SS_Dnn-<n>.jpg;
// SNAPSHOT_DATE (YYYY-MM-DD, default today UTC) anchors the time of day.

use anyhow::{Context, Result};
use chrono::{NaiveDate, Utc};
use serde_json::json;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use store_visits::alerts::LogSink;
use store_visits::config::Config;
use store_visits::detector::{is_image_path, parse_snapshot_name};
use store_visits::pipeline::{Engine, Envelope, EventType};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use walkdir::WalkDir;

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    let config_path = args.get(1).map(String::as_str).unwrap_or("config.yaml");
    let config = Config::load(config_path)?;

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.logging.level))
        .context("Invalid logging.level filter")?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    info!("🏪 Store visit engine starting ({} store(s) configured)", config.stores.len());

    let engine = Arc::new(Engine::new(config.engine.clone(), Arc::new(LogSink)));
    let failures = engine.onboard_all(&config).await;
    if !failures.is_empty() {
        error!("{} store(s) not started due to configuration errors", failures.len());
    }

    let Some(input) = args.get(2) else {
        warn!("No input given; nothing to replay");
        return Ok(());
    };

    let rejected = if input == "-" {
        let tick = Duration::from_secs(config.engine.clock_tick_sec.max(1));
        run_live(&engine, tick).await?
    } else {
        run_replay(&engine, Path::new(input)).await?
    };
    engine.finish().await;
    emit(&engine).await?;

    let summaries = engine.summaries().await;
    println!("{}", serde_json::to_string_pretty(&json!({ "stores": summaries }))?);

    let metrics = engine.metrics().summary();
    info!("✓ Replay complete");
    info!("  Frames: {} ({} detection errors)", metrics.frames, metrics.detection_errors);
    info!("  Entries / exits: {} / {}", metrics.entries, metrics.exits);
    info!(
        "  Visits: {} started, {} closed ({} bounced, {} timed out)",
        metrics.visits_started, metrics.visits_closed, metrics.visits_bounced, metrics.visits_timed_out
    );
    info!("  Alerts: {} ({} candidates dropped)", metrics.alerts, metrics.risk_dropped);
    if rejected > 0 || metrics.late_events > 0 {
        warn!(
            "  Rejected: {}, late: {}, duplicates: {}",
            rejected, metrics.late_events, metrics.duplicate_events
        );
    }
    info!("  Processing speed: {:.1} frames/s", metrics.frames_per_sec);
    Ok(())
}

// ============================================================================
// INPUT MODES
// ============================================================================

/// Envelopes ingested between two drains of the outbound queues.
const DRAIN_EVERY: usize = 500;

async fn emit(engine: &Engine) -> Result<()> {
    for event in engine.drain_events().await {
        println!("{}", serde_json::to_string(&event)?);
    }
    Ok(())
}

async fn ingest_counted(engine: &Engine, envelope: &Envelope, rejected: &mut usize) {
    if let Err(e) = engine.ingest(envelope).await {
        *rejected += 1;
        warn!("Event rejected: {}", e);
    }
}

async fn run_replay(engine: &Engine, input: &Path) -> Result<usize> {
    let envelopes = load_input(input)?;
    info!("Replaying {} event(s) from {}", envelopes.len(), input.display());

    let mut rejected = 0usize;
    for (n, envelope) in envelopes.iter().enumerate() {
        ingest_counted(engine, envelope, &mut rejected).await;
        if (n + 1) % DRAIN_EVERY == 0 {
            emit(engine).await?;
        }
    }
    if let Some(last) = envelopes.iter().map(|e| e.timestamp).max() {
        engine.advance_all(last).await;
    }
    Ok(rejected)
}

async fn run_live(engine: &Arc<Engine>, tick: Duration) -> Result<usize> {
    info!("📡 Reading live envelopes from stdin");
    let clock = engine.spawn_clock(tick, Engine::wall_clock);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut drain = tokio::time::interval(tick);
    let mut rejected = 0usize;

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("Failed to read stdin")? else {
                    break;
                };
                if line.trim().is_empty() {
                    continue;
                }
                match Envelope::from_json(&line) {
                    Ok(envelope) => ingest_counted(engine, &envelope, &mut rejected).await,
                    Err(e) => {
                        rejected += 1;
                        warn!("stdin: skipping line: {}", e);
                    }
                }
            }
            _ = drain.tick() => emit(engine).await?,
        }
    }

    clock.abort();
    engine.advance_all(Engine::wall_clock()).await;
    info!("stdin closed");
    Ok(rejected)
}

fn load_input(path: &Path) -> Result<Vec<Envelope>> {
    if path.is_dir() {
        scan_snapshots(path)
    } else {
        read_jsonl(path)
    }
}

fn read_jsonl(path: &Path) -> Result<Vec<Envelope>> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let mut envelopes = Vec::new();
    for (n, line) in contents.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match Envelope::from_json(line) {
            Ok(env) => envelopes.push(env),
            Err(e) => warn!("{}:{}: skipping line: {}", path.display(), n + 1, e),
        }
    }
    Ok(envelopes)
}

fn scan_snapshots(root: &Path) -> Result<Vec<Envelope>> {
    let day = match std::env::var("SNAPSHOT_DATE") {
        Ok(s) => NaiveDate::parse_from_str(&s, "%Y-%m-%d")
            .with_context(|| format!("SNAPSHOT_DATE '{}' is not YYYY-MM-DD", s))?,
        Err(_) => Utc::now().date_naive(),
    };

    let mut frames = Vec::new();
    for entry in WalkDir::new(root)
        .follow_links(true)
        .into_iter()
        .filter_map(|e| e.ok())
    {
        let path = entry.path();
        if !entry.file_type().is_file() || !is_image_path(path) {
            continue;
        }
        let name = entry.file_name().to_string_lossy();
        let Some(parsed) = parse_snapshot_name(&name, day) else {
            warn!("Skipping unrecognised snapshot name {}", path.display());
            continue;
        };
        let store_id = path
            .parent()
            .and_then(|p| p.file_name())
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        frames.push((parsed, store_id, name.into_owned(), path.to_path_buf()));
    }
    frames.sort_by(|a, b| {
        (a.0.timestamp, &a.0.camera_id, &a.2).cmp(&(b.0.timestamp, &b.0.camera_id, &b.2))
    });

    info!("Found {} snapshot(s) under {}", frames.len(), root.display());
    Ok(frames
        .into_iter()
        .map(|(parsed, store_id, _, path)| Envelope {
            event_type: EventType::FrameIngested,
            store_id,
            camera_id: parsed.camera_id,
            timestamp: parsed.timestamp,
            payload: json!({ "path": path.to_string_lossy() }),
        })
        .collect())
}
