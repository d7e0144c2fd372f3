// Pose estimator: lifecycle state machine around the error-state EKF.
//
// Runs on the visual-inertial callback under the tracker's estimator lock.
// Each correction first replays the buffered inertial samples between the
// previous state time and the new measurement, then fuses the measurement.
// The result is published as an immutable `FilterState` snapshot.

use std::collections::VecDeque;

use serde::Serialize;

use crate::buffers::SampleBuffer;
use crate::config::TrackingConfig;
use crate::error::TrackingError;
use crate::filters::pose_ekf::{NominalState, PoseEkf};
use crate::filters::prefilter::stationary_mean;
use crate::filters::propagation::{plan_steps, StepLimits};
use crate::imu_sync::pair_streams;
use crate::types::{
    AccelerometerSample, Conditioned, ErrorStateMat, GyroSample, Quat, Vec3,
    VisualInertialSample,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum TrackingPhase {
    Uninitialized,
    Initializing,
    Tracking,
    Lost,
}

// ─── Events ──────────────────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq)]
pub enum TrackerEvent {
    Initialized { timestamp: f64, gyro_bias: Vec3, warm_samples: usize },
    Corrected { position_m: f64, orientation_rad: f64 },
    OutlierRejected { position_m: f64, orientation_rad: f64, consecutive: u32 },
    Relocalized { timestamp: f64, after_outliers: u32 },
    Reinitialized { gap_secs: f64 },
    StaleCorrection { gap_secs: f64 },
    CorrectionsOverdue { gap_secs: f64 },
    VisualOutOfOrder { timestamp: f64, state_timestamp: f64 },
    IntegrationClamped { steps: usize },
    BiasRefined { updates: usize, gyro_bias: Vec3 },
    TrackingLost { gap_secs: f64 },
    SampleDropped { stream: &'static str, error: TrackingError },
}

// ─── Pose history ────────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct HistoryEntry {
    pub timestamp: f64,
    pub position: Vec3,
    pub orientation: Quat,
}

/// Bounded ring of recent corrected poses, for queries behind the state time.
#[derive(Clone, Debug)]
pub struct PoseHistory {
    entries: VecDeque<HistoryEntry>,
    capacity: usize,
}

impl PoseHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity.max(1)),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&mut self, entry: HistoryEntry) {
        if self.entries.len() >= self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Pose at `t`: lerp position, slerp orientation. Clamped to the stored span.
    pub fn interpolate(&self, t: f64) -> Option<(Vec3, Quat)> {
        let first = self.entries.front()?;
        let last = self.entries.back()?;
        if t <= first.timestamp {
            return Some((first.position, first.orientation));
        }
        if t >= last.timestamp {
            return Some((last.position, last.orientation));
        }

        let idx = self.entries.partition_point(|e| e.timestamp <= t);
        let (a, b) = (&self.entries[idx - 1], &self.entries[idx]);
        let span = b.timestamp - a.timestamp;
        let u = if span > f64::EPSILON {
            (t - a.timestamp) / span
        } else {
            1.0
        };
        let orientation = a
            .orientation
            .try_slerp(&b.orientation, u, 1e-9)
            .unwrap_or_else(|| a.orientation.nlerp(&b.orientation, u));
        Some((a.position.lerp(&b.position, u), orientation))
    }
}

// ─── Published snapshot ──────────────────────────────────────────────────────

/// Immutable copy of the estimator output read by the query path.
#[derive(Clone, Debug)]
pub struct FilterState {
    pub nominal: NominalState,
    pub covariance: ErrorStateMat,
    /// Time the nominal state refers to.
    pub last_correction_timestamp: f64,
    pub phase: TrackingPhase,
    pub initialized: bool,
    pub valid: bool,
    pub consecutive_outliers: u32,
    pub history: PoseHistory,
}

impl FilterState {
    pub fn uninitialized(config: &TrackingConfig) -> Self {
        PoseEstimator::new(config).snapshot()
    }
}

// ─── Estimator ───────────────────────────────────────────────────────────────

pub struct PoseEstimator {
    ekf: PoseEkf,
    phase: TrackingPhase,
    state_timestamp: Option<f64>,
    consecutive_outliers: u32,
    history: PoseHistory,
    limits: StepLimits,
    config: TrackingConfig,
}

impl PoseEstimator {
    pub fn new(config: &TrackingConfig) -> Self {
        Self {
            ekf: PoseEkf::new(config),
            phase: TrackingPhase::Uninitialized,
            state_timestamp: None,
            consecutive_outliers: 0,
            history: PoseHistory::new(config.pose_history_len),
            limits: StepLimits::from_config(config),
            config: config.clone(),
        }
    }

    pub fn phase(&self) -> TrackingPhase {
        self.phase
    }

    pub fn state_timestamp(&self) -> Option<f64> {
        self.state_timestamp
    }

    pub fn is_valid(&self) -> bool {
        matches!(self.phase, TrackingPhase::Tracking | TrackingPhase::Lost)
    }

    /// Full reset, learned bias included.
    pub fn reset(&mut self) {
        *self = Self::new(&self.config);
    }

    /// Drop back to warm-up, keeping the learned gyro bias.
    pub fn reinitialize(&mut self) {
        self.phase = TrackingPhase::Initializing;
        self.state_timestamp = None;
        self.consecutive_outliers = 0;
        self.history.clear();
    }

    /// Staleness check against the newest sensor time `now`.
    ///
    /// Past `stale_threshold` a tracking estimator is marked lost; past
    /// `hard_stale_limit` it drops back to warm-up.
    pub fn expire_if_stale(&mut self, now: f64) -> Option<TrackerEvent> {
        let ts = self.state_timestamp.filter(|_| self.is_valid())?;
        let gap = now - ts;
        if gap > self.config.hard_stale_limit {
            self.reinitialize();
            return Some(TrackerEvent::TrackingLost { gap_secs: gap });
        }
        if gap > self.config.stale_threshold && self.phase == TrackingPhase::Tracking {
            self.phase = TrackingPhase::Lost;
            return Some(TrackerEvent::CorrectionsOverdue { gap_secs: gap });
        }
        None
    }

    pub fn snapshot(&self) -> FilterState {
        FilterState {
            nominal: self.ekf.state,
            covariance: self.ekf.covariance,
            last_correction_timestamp: self.state_timestamp.unwrap_or(f64::NEG_INFINITY),
            phase: self.phase,
            initialized: self.phase != TrackingPhase::Uninitialized,
            valid: self.is_valid(),
            consecutive_outliers: self.consecutive_outliers,
            history: self.history.clone(),
        }
    }

    /// Fold one visual-inertial sample into the filter.
    pub fn process_visual(
        &mut self,
        sample: &VisualInertialSample,
        gyro: &SampleBuffer<Conditioned<GyroSample>>,
        accel: &SampleBuffer<AccelerometerSample>,
    ) -> Vec<TrackerEvent> {
        let mut events = Vec::new();

        let last = match (self.phase, self.state_timestamp) {
            (TrackingPhase::Tracking | TrackingPhase::Lost, Some(last)) => last,
            _ => {
                self.initialize(sample, gyro, &mut events);
                return events;
            }
        };

        if sample.timestamp <= last {
            events.push(TrackerEvent::VisualOutOfOrder {
                timestamp: sample.timestamp,
                state_timestamp: last,
            });
            return events;
        }

        let gap = sample.timestamp - last;
        if gap > self.config.hard_stale_limit {
            events.push(TrackerEvent::Reinitialized { gap_secs: gap });
            let bias = self.ekf.state.gyro_bias;
            self.seed(sample, bias);
            return events;
        }
        if gap > self.config.stale_threshold {
            self.phase = TrackingPhase::Lost;
            events.push(TrackerEvent::StaleCorrection { gap_secs: gap });
        }

        self.propagate(last, sample.timestamp, gyro, accel, &mut events);

        match self.ekf.correct_pose(&sample.position, &sample.orientation) {
            Ok(residual) => {
                self.phase = TrackingPhase::Tracking;
                self.consecutive_outliers = 0;
                events.push(TrackerEvent::Corrected {
                    position_m: residual.position_m,
                    orientation_rad: residual.orientation_rad,
                });
            }
            Err(TrackingError::OutlierMeasurement {
                position_m,
                orientation_rad,
            }) => {
                self.consecutive_outliers += 1;
                self.phase = TrackingPhase::Lost;
                events.push(TrackerEvent::OutlierRejected {
                    position_m,
                    orientation_rad,
                    consecutive: self.consecutive_outliers,
                });
                if self.consecutive_outliers >= self.config.max_consecutive_outliers {
                    events.push(TrackerEvent::Relocalized {
                        timestamp: sample.timestamp,
                        after_outliers: self.consecutive_outliers,
                    });
                    let bias = self.ekf.state.gyro_bias;
                    self.seed(sample, bias);
                    return events;
                }
            }
            Err(other) => log::warn!("unexpected correction failure: {other}"),
        }

        self.state_timestamp = Some(sample.timestamp);
        self.record_history(sample.timestamp);
        gyro.discard_before(last);
        accel.discard_before(last);
        events
    }

    /// Seed from the first sample. The gyro bias comes from the warm-up window
    /// when one is buffered and still; otherwise the current estimate is kept
    /// and stationary updates refine it later.
    fn initialize(
        &mut self,
        sample: &VisualInertialSample,
        gyro: &SampleBuffer<Conditioned<GyroSample>>,
        events: &mut Vec<TrackerEvent>,
    ) {
        let need = self.config.warmup_gyro_samples;
        let warm = gyro.snapshot_until(sample.timestamp);
        let estimated = (need > 0 && warm.len() >= need)
            .then(|| {
                let rates: Vec<Vec3> = warm[warm.len() - need..]
                    .iter()
                    .map(|g| g.sample.angular_rate)
                    .collect();
                stationary_mean(&rates, &self.config)
            })
            .flatten();
        let bias = estimated.unwrap_or(self.ekf.state.gyro_bias);
        self.seed(sample, bias);
        events.push(TrackerEvent::Initialized {
            timestamp: sample.timestamp,
            gyro_bias: bias,
            warm_samples: warm.len(),
        });
    }

    /// Take the measured pose as the state, exactly.
    fn seed(&mut self, sample: &VisualInertialSample, gyro_bias: Vec3) {
        self.ekf
            .reset_to(sample.position, sample.orientation, gyro_bias);
        self.phase = TrackingPhase::Tracking;
        self.state_timestamp = Some(sample.timestamp);
        self.consecutive_outliers = 0;
        self.history.clear();
        self.record_history(sample.timestamp);
    }

    fn propagate(
        &mut self,
        from: f64,
        to: f64,
        gyro: &SampleBuffer<Conditioned<GyroSample>>,
        accel: &SampleBuffer<AccelerometerSample>,
        events: &mut Vec<TrackerEvent>,
    ) {
        let (gyro_anchor, gyro_window) = gyro.window_between(from, to);
        let (accel_anchor, accel_window) = accel.window_between(from, to);
        let (anchor, imu) = pair_streams(
            gyro_anchor.as_ref(),
            &gyro_window,
            accel_anchor.as_ref(),
            &accel_window,
        );
        let plan = plan_steps(from, anchor.as_ref(), &imu, to, &self.limits);
        if plan.clamped > 0 {
            events.push(TrackerEvent::IntegrationClamped {
                steps: plan.clamped,
            });
        }

        let mut bias_updates = 0;
        for step in &plan.steps {
            let rate = step.angular_rate.unwrap_or(self.ekf.state.gyro_bias);
            let force = step
                .acceleration
                .filter(|_| self.config.use_accel_for_velocity);
            self.ekf.predict(&rate, force.as_ref(), step.dt);
            if step.stationary && step.angular_rate.is_some() {
                self.ekf.update_stationary_gyro(&rate);
                bias_updates += 1;
            }
        }
        if bias_updates > 0 {
            events.push(TrackerEvent::BiasRefined {
                updates: bias_updates,
                gyro_bias: self.ekf.state.gyro_bias,
            });
        }
    }

    fn record_history(&mut self, timestamp: f64) {
        self.history.push(HistoryEntry {
            timestamp,
            position: self.ekf.state.position,
            orientation: self.ekf.state.orientation,
        });
    }
}
