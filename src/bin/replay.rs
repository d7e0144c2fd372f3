use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;

use anyhow::Context;
use chrono::Utc;
use clap::Parser;
use crossbeam::channel::{bounded, Sender};
use flate2::read::GzDecoder;
use low_latency_tracking::estimator::{HistoryEntry, PoseHistory};
use low_latency_tracking::simulation::{HeadMotion, SensorEvent, SimulationConfig, TimedEvent};
use low_latency_tracking::types::{Pose, Vec3};
use low_latency_tracking::{LowLatencyTracker, TrackingConfig, VisualInertialSample};
use nalgebra::{Matrix3, Quaternion};
use serde::Deserialize;
use serde_json::json;

#[derive(Parser, Debug)]
struct Args {
    /// Recorded session (*.json or *.json.gz)
    #[arg(long, conflicts_with = "simulate")]
    log: Option<PathBuf>,

    /// Replay a synthetic session of this many seconds
    #[arg(long)]
    simulate: Option<f64>,

    /// Tracking configuration (JSON, missing fields take defaults)
    #[arg(long)]
    config: Option<PathBuf>,

    /// How far past the newest gyro sample each prediction looks [ms]
    #[arg(long, default_value = "20")]
    lookahead_ms: f64,

    /// Disable low-latency mode (visual passthrough)
    #[arg(long, default_value_t = false)]
    no_llt: bool,

    /// Feed each sensor stream from its own thread
    #[arg(long, default_value_t = false)]
    threaded: bool,

    /// Seconds between health status lines
    #[arg(long, default_value = "1.0")]
    status_every: f64,
}

// ─── Recorded session format ─────────────────────────────────────────────────

#[derive(Deserialize)]
struct ImuData {
    timestamp: f64,
    x: f64,
    y: f64,
    z: f64,
}

#[derive(Deserialize)]
struct VisualData {
    timestamp: f64,
    position: [f64; 3],
    /// (w, x, y, z)
    orientation: [f64; 4],
    /// Row-major 3x3
    #[serde(default)]
    intrinsics: Option<[f64; 9]>,
}

#[derive(Deserialize)]
struct Reading {
    timestamp: f64,
    accel: Option<ImuData>,
    gyro: Option<ImuData>,
    visual: Option<VisualData>,
}

#[derive(Deserialize)]
struct LogFile {
    readings: Vec<Reading>,
}

fn load_log(path: &Path) -> anyhow::Result<LogFile> {
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    if path.extension().map(|e| e == "gz").unwrap_or(false) {
        let reader = BufReader::new(GzDecoder::new(file));
        Ok(serde_json::from_reader(reader)?)
    } else {
        Ok(serde_json::from_reader(BufReader::new(file))?)
    }
}

fn log_events(log: LogFile) -> Vec<TimedEvent> {
    let mut events = Vec::with_capacity(log.readings.len());
    for r in log.readings {
        if let Some(a) = r.accel {
            events.push(TimedEvent {
                delivered_at: r.timestamp,
                event: SensorEvent::Accel(low_latency_tracking::AccelerometerSample::new(
                    a.timestamp,
                    Vec3::new(a.x, a.y, a.z),
                )),
            });
        }
        if let Some(g) = r.gyro {
            events.push(TimedEvent {
                delivered_at: r.timestamp,
                event: SensorEvent::Gyro(low_latency_tracking::GyroSample::new(
                    g.timestamp,
                    Vec3::new(g.x, g.y, g.z),
                )),
            });
        }
        if let Some(v) = r.visual {
            let [w, x, y, z] = v.orientation;
            let intrinsics = v
                .intrinsics
                .map(|k| Matrix3::from_row_slice(&k))
                .unwrap_or_else(Matrix3::identity);
            match VisualInertialSample::new(
                v.timestamp,
                Vec3::from(v.position),
                Quaternion::new(w, x, y, z),
                intrinsics,
            ) {
                Ok(sample) => events.push(TimedEvent {
                    delivered_at: r.timestamp,
                    event: SensorEvent::Visual(sample),
                }),
                Err(e) => log::warn!("skipping visual record at {:.3}: {e}", v.timestamp),
            }
        }
    }
    events.sort_by(|a, b| a.delivered_at.total_cmp(&b.delivered_at));
    events
}

// ─── Replay ──────────────────────────────────────────────────────────────────

fn ingest(tracker: &LowLatencyTracker, event: &SensorEvent) {
    match event {
        SensorEvent::Accel(a) => tracker.on_accelerometer_data_updated(a.timestamp, a.acceleration),
        SensorEvent::Gyro(g) => tracker.on_gyro_data_updated(g.timestamp, g.angular_rate),
        SensorEvent::Visual(v) => tracker.on_arkit_data_updated(
            v.timestamp,
            v.position,
            v.orientation.into_inner(),
            v.intrinsics,
        ),
    }
}

struct StreamWorkers {
    senders: [Sender<SensorEvent>; 3],
    handles: Vec<thread::JoinHandle<()>>,
}

impl StreamWorkers {
    fn spawn(tracker: &Arc<LowLatencyTracker>) -> Self {
        let mut handles = Vec::new();
        let mut make = || {
            let (tx, rx) = bounded::<SensorEvent>(256);
            let tracker = Arc::clone(tracker);
            handles.push(thread::spawn(move || {
                for event in rx {
                    ingest(&tracker, &event);
                }
            }));
            tx
        };
        let senders = [make(), make(), make()];
        Self { senders, handles }
    }

    fn send(&self, event: SensorEvent) -> anyhow::Result<()> {
        let idx = match event {
            SensorEvent::Accel(_) => 0,
            SensorEvent::Gyro(_) => 1,
            SensorEvent::Visual(_) => 2,
        };
        self.senders[idx]
            .send(event)
            .map_err(|_| anyhow::anyhow!("stream worker exited"))
    }

    fn join(self) -> anyhow::Result<()> {
        drop(self.senders);
        for handle in self.handles {
            handle
                .join()
                .map_err(|_| anyhow::anyhow!("stream worker panicked"))?;
        }
        Ok(())
    }
}

fn rms(values: &[f64]) -> f64 {
    if values.is_empty() {
        return f64::NAN;
    }
    (values.iter().map(|v| v * v).sum::<f64>() / values.len() as f64).sqrt()
}

fn run(events: &[TimedEvent], tracker: Arc<LowLatencyTracker>, args: &Args) -> anyhow::Result<serde_json::Value> {
    let lookahead = args.lookahead_ms / 1000.0;
    let workers = args.threaded.then(|| StreamWorkers::spawn(&tracker));

    let mut reference = PoseHistory::new(events.len().max(1));
    let mut predictions: Vec<Pose> = Vec::new();
    let mut not_ready = 0u64;
    let mut next_status = f64::NEG_INFINITY;

    for timed in events {
        match &workers {
            Some(w) => w.send(timed.event)?,
            None => ingest(&tracker, &timed.event),
        }

        match &timed.event {
            SensorEvent::Visual(v) => reference.push(HistoryEntry {
                timestamp: v.timestamp,
                position: v.position,
                orientation: v.orientation,
            }),
            SensorEvent::Gyro(g) => match tracker.get_pose(g.timestamp + lookahead) {
                Ok(pose) => predictions.push(pose),
                Err(_) => not_ready += 1,
            },
            SensorEvent::Accel(_) => {}
        }

        if timed.delivered_at >= next_status {
            log::info!("t={:.2}s {}", timed.delivered_at, tracker.format_status(timed.delivered_at));
            next_status = timed.delivered_at + args.status_every;
        }
    }
    if let Some(w) = workers {
        w.join()?;
    }

    // Score only predictions bracketed by reference poses.
    let last_reference = events
        .iter()
        .rev()
        .find_map(|e| match e.event {
            SensorEvent::Visual(v) => Some(v.timestamp),
            _ => None,
        })
        .unwrap_or(f64::NEG_INFINITY);
    let mut orientation_err = Vec::new();
    let mut position_err = Vec::new();
    for pose in predictions.iter().filter(|p| p.timestamp <= last_reference) {
        if let Some((position, orientation)) = reference.interpolate(pose.timestamp) {
            orientation_err.push(pose.orientation.angle_to(&orientation).to_degrees());
            position_err.push((pose.position - position).norm());
        }
    }
    let max = |v: &[f64]| v.iter().copied().fold(0.0_f64, f64::max);
    let last_time = events.last().map(|e| e.delivered_at).unwrap_or(0.0);

    Ok(json!({
        "events": events.len(),
        "lookahead_ms": args.lookahead_ms,
        "threaded": args.threaded,
        "low_latency": tracker.is_llt_open(),
        "predictions": predictions.len(),
        "scored": orientation_err.len(),
        "not_ready": not_ready,
        "rms_orientation_deg": rms(&orientation_err),
        "max_orientation_deg": max(&orientation_err),
        "rms_position_m": rms(&position_err),
        "max_position_m": max(&position_err),
        "final_phase": tracker.filter_state().phase,
        "stats": tracker.stats(),
        "health": tracker.health_report(last_time),
    }))
}

fn ts_now() -> String {
    Utc::now().format("%H:%M:%S").to_string()
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let config = match args.config.as_ref() {
        Some(path) => TrackingConfig::from_json_file(path)?,
        None => TrackingConfig::default(),
    };
    let tracker = Arc::new(LowLatencyTracker::new(config)?);
    if args.no_llt {
        tracker.set_is_llt_open(false);
    }

    let events = match (args.log.as_ref(), args.simulate) {
        (Some(path), _) => {
            log::info!("[{}] Replaying {}", ts_now(), path.display());
            log_events(load_log(path)?)
        }
        (None, seconds) => {
            let duration = seconds.unwrap_or(5.0);
            log::info!("[{}] Simulating {:.1}s session", ts_now(), duration);
            HeadMotion::new(SimulationConfig {
                duration,
                ..SimulationConfig::default()
            })
            .generate()
        }
    };
    if events.is_empty() {
        anyhow::bail!("no sensor events to replay");
    }

    let summary = run(&events, tracker, &args)?;
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}
