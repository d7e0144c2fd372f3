// Low-latency tracker: the owned engine handed to the sensor bridge and the
// render loop.
//
// Three ingestion entry points (one per stream, each with its own buffer
// lock), one query entry point and the lifecycle controls. Estimator work runs
// on the visual-inertial callback under a single mutator lock; the query path
// only clones the published `FilterState` and copies short sample windows.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, TryLockError};

use nalgebra::{Matrix3, Quaternion};
use serde::Serialize;

use crate::buffers::{lock, LatestCell, SampleBuffer};
use crate::config::{FeatureFlags, TrackingConfig};
use crate::error::{NotReadyReason, Result, TrackingError};
use crate::estimator::{FilterState, PoseEstimator, TrackerEvent, TrackingPhase};
use crate::filters::prefilter::InertialPreFilter;
use crate::filters::propagation::{extrapolate, plan_steps, StepLimits};
use crate::health::{HealthMonitor, HealthReport};
use crate::imu_sync::pair_streams;
use crate::types::{
    AccelerometerSample, Conditioned, GyroSample, Pose, PoseConfidence, Vec3,
    VisualInertialSample,
};

// ─── Counters ────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct TrackerStats {
    accel_accepted: AtomicU64,
    accel_dropped: AtomicU64,
    gyro_accepted: AtomicU64,
    gyro_dropped: AtomicU64,
    visual_accepted: AtomicU64,
    visual_dropped: AtomicU64,
    corrections: AtomicU64,
    outliers: AtomicU64,
    relocalizations: AtomicU64,
    reinitializations: AtomicU64,
    stale_inputs: AtomicU64,
    queries: AtomicU64,
    queries_not_ready: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl TrackerStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            accel_accepted: get(&self.accel_accepted),
            accel_dropped: get(&self.accel_dropped),
            gyro_accepted: get(&self.gyro_accepted),
            gyro_dropped: get(&self.gyro_dropped),
            visual_accepted: get(&self.visual_accepted),
            visual_dropped: get(&self.visual_dropped),
            corrections: get(&self.corrections),
            outliers: get(&self.outliers),
            relocalizations: get(&self.relocalizations),
            reinitializations: get(&self.reinitializations),
            stale_inputs: get(&self.stale_inputs),
            queries: get(&self.queries),
            queries_not_ready: get(&self.queries_not_ready),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub accel_accepted: u64,
    pub accel_dropped: u64,
    pub gyro_accepted: u64,
    pub gyro_dropped: u64,
    pub visual_accepted: u64,
    pub visual_dropped: u64,
    pub corrections: u64,
    pub outliers: u64,
    pub relocalizations: u64,
    pub reinitializations: u64,
    pub stale_inputs: u64,
    pub queries: u64,
    pub queries_not_ready: u64,
}

// ─── Engine ──────────────────────────────────────────────────────────────────

pub struct LowLatencyTracker {
    config: TrackingConfig,
    limits: StepLimits,
    gravity: Vec3,

    active: AtomicBool,
    flags: RwLock<FeatureFlags>,

    prefilter: InertialPreFilter,
    accel: SampleBuffer<AccelerometerSample>,
    gyro: SampleBuffer<Conditioned<GyroSample>>,
    visual: LatestCell<VisualInertialSample>,

    /// Single mutator of the filter.
    estimator: Mutex<PoseEstimator>,
    /// Latest published estimator output.
    state: Mutex<Arc<FilterState>>,

    health: HealthMonitor,
    stats: TrackerStats,
}

impl LowLatencyTracker {
    pub fn new(config: TrackingConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::build(config))
    }

    fn build(config: TrackingConfig) -> Self {
        Self {
            limits: StepLimits::from_config(&config),
            gravity: config.gravity_vector(),
            active: AtomicBool::new(true),
            flags: RwLock::new(FeatureFlags::default()),
            prefilter: InertialPreFilter::new(&config),
            accel: SampleBuffer::new("accel", config.accel_buffer_capacity),
            gyro: SampleBuffer::new("gyro", config.gyro_buffer_capacity),
            visual: LatestCell::new(),
            estimator: Mutex::new(PoseEstimator::new(&config)),
            state: Mutex::new(Arc::new(FilterState::uninitialized(&config))),
            health: HealthMonitor::new(&config),
            stats: TrackerStats::default(),
            config,
        }
    }

    pub fn config(&self) -> &TrackingConfig {
        &self.config
    }

    // ── Ingestion ──

    pub fn on_accelerometer_data_updated(&self, timestamp: f64, acceleration: Vec3) {
        let sample = AccelerometerSample::new(timestamp, acceleration);
        let conditioned = match self.prefilter.condition_accel(sample, self.flags()) {
            Ok(s) => s,
            Err(error) => {
                bump(&self.stats.accel_dropped);
                self.record(TrackerEvent::SampleDropped { stream: "accel", error });
                return;
            }
        };
        if self.accel.push(conditioned).accepted() {
            bump(&self.stats.accel_accepted);
            self.health.accel.update(timestamp);
        } else {
            bump(&self.stats.accel_dropped);
        }
    }

    pub fn on_gyro_data_updated(&self, timestamp: f64, angular_rate: Vec3) {
        let sample = GyroSample::new(timestamp, angular_rate);
        let conditioned = match self.prefilter.condition_gyro(sample, self.flags()) {
            Ok(s) => s,
            Err(error) => {
                bump(&self.stats.gyro_dropped);
                self.record(TrackerEvent::SampleDropped { stream: "gyro", error });
                return;
            }
        };
        if self.gyro.push(conditioned).accepted() {
            bump(&self.stats.gyro_accepted);
            self.health.gyro.update(timestamp);
        } else {
            bump(&self.stats.gyro_dropped);
        }
    }

    pub fn on_arkit_data_updated(
        &self,
        timestamp: f64,
        position: Vec3,
        orientation: Quaternion<f64>,
        intrinsics: Matrix3<f64>,
    ) {
        let sample = match VisualInertialSample::new(timestamp, position, orientation, intrinsics) {
            Ok(s) => s,
            Err(error) => {
                bump(&self.stats.visual_dropped);
                self.record(TrackerEvent::SampleDropped { stream: "visual", error });
                return;
            }
        };
        self.visual.set(sample);
        bump(&self.stats.visual_accepted);
        self.health.visual.update(timestamp);

        if !self.is_active() {
            return;
        }

        let events = {
            let mut estimator = lock(&self.estimator);
            let events = estimator.process_visual(&sample, &self.gyro, &self.accel);
            self.publish(&estimator);
            events
        };
        for event in events {
            self.record(event);
        }
    }

    // ── Query ──

    /// Pose at `target_timestamp` on the sensor clock.
    pub fn get_pose(&self, target_timestamp: f64) -> Result<Pose> {
        bump(&self.stats.queries);
        let result = self.query(target_timestamp);
        if result.is_err() {
            bump(&self.stats.queries_not_ready);
        }
        result
    }

    fn query(&self, target: f64) -> Result<Pose> {
        if !self.is_active() {
            return Err(TrackingError::NotReady(NotReadyReason::Inactive));
        }
        if !target.is_finite() {
            return Err(TrackingError::NotReady(NotReadyReason::InvalidTimestamp));
        }
        if !self.flags().low_latency {
            let sample = self
                .visual
                .get()
                .ok_or(TrackingError::NotReady(NotReadyReason::NoVisualSample))?;
            return Ok(Pose {
                timestamp: sample.timestamp,
                position: sample.position,
                orientation: sample.orientation,
                confidence: PoseConfidence::Passthrough,
            });
        }

        let state = self.filter_state();
        if !state.valid {
            let reason = match state.phase {
                TrackingPhase::Uninitialized => NotReadyReason::Uninitialized,
                _ => NotReadyReason::Initializing,
            };
            return Err(TrackingError::NotReady(reason));
        }

        // Staleness runs on the sensor clock; the caller's target never expires tracking.
        let state_ts = state.last_correction_timestamp;
        let now = self.newest_sensor_timestamp().unwrap_or(state_ts).max(state_ts);
        let gap = now - state_ts;
        if gap > self.config.hard_stale_limit {
            self.check_staleness(now);
            return Err(TrackingError::NotReady(NotReadyReason::TrackingLost));
        }
        if gap > self.config.stale_threshold && state.phase == TrackingPhase::Tracking {
            self.check_staleness(now);
        }

        let age = target.max(now) - state_ts;
        let confidence = if state.phase == TrackingPhase::Lost || age > self.config.stale_threshold {
            PoseConfidence::Degraded
        } else {
            PoseConfidence::Nominal
        };

        if target < state_ts {
            let (position, orientation) = state
                .history
                .interpolate(target)
                .unwrap_or((state.nominal.position, state.nominal.orientation));
            return Ok(Pose {
                timestamp: target,
                position,
                orientation,
                confidence,
            });
        }

        let (gyro_anchor, gyro) = self.gyro.window_since(state_ts);
        let (accel_anchor, accel) = self.accel.window_since(state_ts);
        let (anchor, imu) =
            pair_streams(gyro_anchor.as_ref(), &gyro, accel_anchor.as_ref(), &accel);
        let plan = plan_steps(state_ts, anchor.as_ref(), &imu, target, &self.limits);
        let predicted = extrapolate(
            &state.nominal,
            &plan,
            &self.gravity,
            self.config.use_accel_for_velocity,
        );

        Ok(Pose {
            timestamp: target,
            position: predicted.position,
            orientation: predicted.orientation,
            confidence,
        })
    }

    fn newest_sensor_timestamp(&self) -> Option<f64> {
        [
            self.gyro.latest().map(|s| s.sample.timestamp),
            self.accel.latest().map(|s| s.timestamp),
            self.visual.get().map(|s| s.timestamp),
        ]
        .into_iter()
        .flatten()
        .reduce(f64::max)
    }

    /// Mark the estimator lost or re-initialise it, unless a correction is in flight.
    fn check_staleness(&self, now: f64) {
        let mut estimator = match self.estimator.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => return,
        };
        if let Some(event) = estimator.expire_if_stale(now) {
            self.publish(&estimator);
            drop(estimator);
            self.record(event);
        }
    }

    fn publish(&self, estimator: &PoseEstimator) {
        *lock(&self.state) = Arc::new(estimator.snapshot());
    }

    /// Latest published estimator output.
    pub fn filter_state(&self) -> Arc<FilterState> {
        Arc::clone(&lock(&self.state))
    }

    // ── Lifecycle ──

    /// Enable the engine; filtering of both inertial streams is switched back on.
    pub fn activate(&self) {
        self.active.store(true, Ordering::Release);
        self.update_flags(|f| {
            f.filter_gyro = true;
            f.filter_accel = true;
        });
        log::info!("low-latency tracking activated");
    }

    pub fn deactivate(&self) {
        self.active.store(false, Ordering::Release);
        log::info!("low-latency tracking deactivated");
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Force re-entry to warm-up; buffered samples are kept.
    pub fn init_ekf(&self) {
        let mut estimator = lock(&self.estimator);
        estimator.reinitialize();
        self.publish(&estimator);
        log::info!("estimator re-initialising");
    }

    /// Full reset of buffers and filter state.
    pub fn clear(&self) {
        let mut estimator = lock(&self.estimator);
        self.accel.clear();
        self.gyro.clear();
        self.visual.clear();
        self.prefilter.reset();
        self.health.reset();
        estimator.reset();
        self.publish(&estimator);
        log::info!("tracker cleared");
    }

    // ── Feature flags ──

    pub fn flags(&self) -> FeatureFlags {
        *self.flags.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn update_flags(&self, f: impl FnOnce(&mut FeatureFlags)) {
        let mut flags = self.flags.write().unwrap_or_else(PoisonError::into_inner);
        f(&mut flags);
    }

    pub fn set_is_llt_open(&self, value: bool) {
        self.update_flags(|f| f.low_latency = value);
    }

    pub fn is_llt_open(&self) -> bool {
        self.flags().low_latency
    }

    pub fn set_is_filtering_gyro(&self, value: bool) {
        self.update_flags(|f| f.filter_gyro = value);
    }

    pub fn set_is_filtering_acc(&self, value: bool) {
        self.update_flags(|f| f.filter_accel = value);
    }

    // ── Diagnostics ──

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn health_report(&self, now: f64) -> HealthReport {
        self.health.check_health(now)
    }

    pub fn format_status(&self, now: f64) -> String {
        self.health.format_status(now)
    }

    /// Camera intrinsics of the newest visual-inertial sample.
    pub fn latest_intrinsics(&self) -> Option<Matrix3<f64>> {
        self.visual.get().map(|s| s.intrinsics)
    }

    fn record(&self, event: TrackerEvent) {
        match &event {
            TrackerEvent::Corrected { .. } => {
                bump(&self.stats.corrections);
                log::trace!("{event:?}");
            }
            TrackerEvent::OutlierRejected { .. } => {
                bump(&self.stats.outliers);
                log::warn!("{event:?}");
            }
            TrackerEvent::Relocalized { .. } => {
                bump(&self.stats.relocalizations);
                log::warn!("{event:?}");
            }
            TrackerEvent::Reinitialized { .. } | TrackerEvent::TrackingLost { .. } => {
                bump(&self.stats.reinitializations);
                log::warn!("{event:?}");
            }
            TrackerEvent::StaleCorrection { .. }
            | TrackerEvent::CorrectionsOverdue { .. }
            | TrackerEvent::IntegrationClamped { .. }
            | TrackerEvent::VisualOutOfOrder { .. } => {
                bump(&self.stats.stale_inputs);
                log::warn!("{event:?}");
            }
            TrackerEvent::Initialized { .. } => log::info!("{event:?}"),
            TrackerEvent::BiasRefined { .. }
            | TrackerEvent::SampleDropped { .. } => log::debug!("{event:?}"),
        }
    }
}

impl Default for LowLatencyTracker {
    fn default() -> Self {
        Self::build(TrackingConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulation::{HeadMotion, SensorEvent, SimulationConfig, TimedEvent};
    use crate::types::Quat;
    use approx::assert_relative_eq;
    use std::thread;

    fn feed_gyro(tracker: &LowLatencyTracker, from: i32, to: i32, rate: Vec3) {
        for i in from..=to {
            tracker.on_gyro_data_updated(i as f64 * 0.01, rate);
        }
    }

    fn feed_visual(tracker: &LowLatencyTracker, t: f64, position: Vec3, orientation: Quat) {
        tracker.on_arkit_data_updated(t, position, orientation.into_inner(), Matrix3::identity());
    }

    fn not_ready(result: Result<Pose>) -> NotReadyReason {
        match result {
            Err(TrackingError::NotReady(reason)) => reason,
            other => panic!("expected NotReady, got {other:?}"),
        }
    }

    fn select(events: &[TimedEvent], pick: fn(&SensorEvent) -> bool) -> Vec<SensorEvent> {
        events.iter().map(|e| e.event).filter(|e| pick(e)).collect()
    }

    /// Tracking from a correction at t=0 with a zero-rate warm-up before it.
    fn tracking_at_origin() -> LowLatencyTracker {
        let tracker = LowLatencyTracker::default();
        feed_gyro(&tracker, -20, 0, Vec3::zeros());
        feed_visual(&tracker, 0.0, Vec3::zeros(), Quat::identity());
        tracker
    }

    #[test]
    fn test_not_ready_before_visual() {
        let tracker = LowLatencyTracker::default();
        feed_gyro(&tracker, 0, 20, Vec3::new(0.0, 0.5, 0.0));
        assert_eq!(not_ready(tracker.get_pose(0.2)), NotReadyReason::Uninitialized);
        assert_eq!(tracker.stats().queries_not_ready, 1);
    }

    #[test]
    fn test_first_correction_returned_unchanged() {
        let tracker = LowLatencyTracker::default();
        let position = Vec3::new(1.0, 2.0, 3.0);
        let orientation = Quat::from_scaled_axis(Vec3::new(0.0, 0.2, 0.1));
        feed_visual(&tracker, 0.0, position, orientation);

        let pose = tracker.get_pose(0.0).unwrap();
        assert_eq!(pose.position, position);
        assert_relative_eq!(pose.orientation.angle_to(&orientation), 0.0, epsilon = 1e-6);
        assert_eq!(pose.confidence, PoseConfidence::Nominal);
    }

    #[test]
    fn test_constant_rate_after_first_correction() {
        let tracker = LowLatencyTracker::default();
        let omega = Vec3::new(0.0, 1.0, 0.0);
        tracker.on_gyro_data_updated(0.0, omega);
        feed_visual(&tracker, 0.0, Vec3::zeros(), Quat::identity());
        feed_gyro(&tracker, 1, 10, omega);

        let pose = tracker.get_pose(0.1).unwrap();
        let expected = Quat::from_scaled_axis(omega * 0.1);
        assert_relative_eq!(pose.orientation.angle_to(&expected), 0.0, epsilon = 1e-6);
        assert_eq!(pose.confidence, PoseConfidence::Nominal);
    }

    #[test]
    fn test_identity_at_correction_time() {
        let tracker = LowLatencyTracker::default();
        feed_gyro(&tracker, -20, 0, Vec3::zeros());
        let position = Vec3::new(0.1, 1.6, -0.3);
        let orientation = Quat::from_scaled_axis(Vec3::new(0.1, 0.4, -0.2));
        feed_visual(&tracker, 0.0, position, orientation);

        let pose = tracker.get_pose(0.0).unwrap();
        assert_eq!(pose.position, position);
        assert_relative_eq!(pose.orientation.angle_to(&orientation), 0.0, epsilon = 1e-6);
        assert_eq!(pose.confidence, PoseConfidence::Nominal);
    }

    #[test]
    fn test_constant_rate_integration() {
        let tracker = LowLatencyTracker::default();
        let omega = Vec3::new(0.0, 1.0, 0.0);
        let q0 = Quat::from_scaled_axis(Vec3::new(0.3, 0.0, 0.1));
        feed_gyro(&tracker, -20, 0, omega);
        feed_visual(&tracker, 0.0, Vec3::zeros(), q0);
        feed_gyro(&tracker, 1, 10, omega);

        let pose = tracker.get_pose(0.1).unwrap();
        let expected = q0 * Quat::from_scaled_axis(omega * 0.1);
        assert_relative_eq!(pose.orientation.angle_to(&expected), 0.0, epsilon = 1e-6);
        assert_relative_eq!(pose.orientation.quaternion().norm(), 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_static_no_drift_with_learned_bias() {
        let tracker = LowLatencyTracker::default();
        let bias = Vec3::new(0.01, -0.005, 0.002);
        feed_gyro(&tracker, -30, 0, bias);
        feed_visual(&tracker, 0.0, Vec3::zeros(), Quat::identity());
        feed_gyro(&tracker, 1, 80, bias);

        let pose = tracker.get_pose(0.8).unwrap();
        assert!(pose.orientation.angle() < 1e-6);
        assert!(pose.position.norm() < 1e-9);
        assert_eq!(pose.confidence, PoseConfidence::Degraded);
        assert_relative_eq!(tracker.filter_state().nominal.gyro_bias, bias, epsilon = 1e-9);
    }

    #[test]
    fn test_outlier_does_not_jump() {
        let tracker = tracking_at_origin();
        feed_gyro(&tracker, 1, 10, Vec3::zeros());
        let before = tracker.get_pose(0.1).unwrap();

        feed_visual(&tracker, 0.1, Vec3::new(3.0, 0.0, 0.0), Quat::identity());
        let after = tracker.get_pose(0.1).unwrap();

        assert!((after.position - before.position).norm() < 1e-3);
        assert!(after.orientation.angle_to(&before.orientation) < 1e-3);
        assert_eq!(after.confidence, PoseConfidence::Degraded);
        assert_eq!(tracker.stats().outliers, 1);
        assert_eq!(tracker.filter_state().phase, TrackingPhase::Lost);
    }

    #[test]
    fn test_relocalizes_after_repeated_outliers() {
        let tracker = tracking_at_origin();
        let moved = Vec3::new(2.0, 0.0, 0.0);
        for i in 1..=5 {
            feed_visual(&tracker, i as f64 * 0.02, moved, Quat::identity());
        }
        assert_eq!(tracker.stats().relocalizations, 1);
        let pose = tracker.get_pose(0.1).unwrap();
        assert_eq!(pose.position, moved);
        assert_eq!(pose.confidence, PoseConfidence::Nominal);
    }

    #[test]
    fn test_clear_returns_not_ready() {
        let tracker = tracking_at_origin();
        assert!(tracker.get_pose(0.0).is_ok());

        tracker.clear();
        assert_eq!(not_ready(tracker.get_pose(0.0)), NotReadyReason::Uninitialized);
        assert_eq!(not_ready(tracker.get_pose(5.0)), NotReadyReason::Uninitialized);
        assert!(tracker.latest_intrinsics().is_none());
    }

    #[test]
    fn test_deactivated_engine() {
        let tracker = LowLatencyTracker::default();
        tracker.deactivate();
        assert!(!tracker.is_active());
        feed_gyro(&tracker, -20, 0, Vec3::zeros());
        feed_visual(&tracker, 0.0, Vec3::zeros(), Quat::identity());
        assert_eq!(not_ready(tracker.get_pose(0.0)), NotReadyReason::Inactive);
        assert_eq!(tracker.stats().gyro_accepted, 21);

        tracker.set_is_filtering_gyro(false);
        tracker.set_is_filtering_acc(false);
        tracker.activate();
        let flags = tracker.flags();
        assert!(flags.filter_gyro && flags.filter_accel);
        // The correction arrived while inactive and was never folded in.
        assert_eq!(not_ready(tracker.get_pose(0.0)), NotReadyReason::Uninitialized);

        feed_visual(&tracker, 0.01, Vec3::zeros(), Quat::identity());
        assert!(tracker.get_pose(0.01).is_ok());
    }

    #[test]
    fn test_passthrough_mode() {
        let tracker = LowLatencyTracker::default();
        tracker.set_is_llt_open(false);
        assert!(!tracker.is_llt_open());
        assert_eq!(not_ready(tracker.get_pose(0.0)), NotReadyReason::NoVisualSample);

        let position = Vec3::new(1.0, 2.0, 3.0);
        let orientation = Quat::from_scaled_axis(Vec3::new(0.0, 0.5, 0.0));
        feed_visual(&tracker, 0.5, position, orientation);

        let pose = tracker.get_pose(0.7).unwrap();
        assert_eq!(pose.confidence, PoseConfidence::Passthrough);
        assert_eq!(pose.timestamp, 0.5);
        assert_eq!(pose.position, position);
        assert!(pose.orientation.angle_to(&orientation) < 1e-6);
        assert_eq!(tracker.latest_intrinsics(), Some(Matrix3::identity()));
    }

    #[test]
    fn test_backward_query_interpolates_history() {
        let tracker = tracking_at_origin();
        feed_gyro(&tracker, 1, 10, Vec3::zeros());
        feed_visual(&tracker, 0.1, Vec3::new(0.01, 0.0, 0.0), Quat::identity());

        let corrected = tracker.filter_state().nominal.position;
        assert!(corrected.x > 0.0);
        let pose = tracker.get_pose(0.05).unwrap();
        assert_relative_eq!(pose.position.x, 0.5 * corrected.x, epsilon = 1e-12);

        let oldest = tracker.get_pose(-1.0).unwrap();
        assert_eq!(oldest.position, Vec3::zeros());
    }

    #[test]
    fn test_overdue_corrections_mark_lost() {
        let tracker = tracking_at_origin();
        feed_gyro(&tracker, 1, 40, Vec3::zeros());

        let pose = tracker.get_pose(0.4).unwrap();
        assert_eq!(pose.confidence, PoseConfidence::Degraded);
        assert_eq!(tracker.filter_state().phase, TrackingPhase::Lost);

        feed_visual(&tracker, 0.4, Vec3::zeros(), Quat::identity());
        assert_eq!(tracker.filter_state().phase, TrackingPhase::Tracking);
        assert_eq!(tracker.get_pose(0.4).unwrap().confidence, PoseConfidence::Nominal);
    }

    #[test]
    fn test_hard_staleness_reinitializes() {
        let tracker = tracking_at_origin();
        feed_gyro(&tracker, 1, 150, Vec3::zeros());
        assert_eq!(not_ready(tracker.get_pose(1.5)), NotReadyReason::TrackingLost);
        assert_eq!(tracker.filter_state().phase, TrackingPhase::Initializing);
        assert_eq!(tracker.stats().reinitializations, 1);

        feed_visual(&tracker, 1.5, Vec3::new(0.2, 0.0, 0.0), Quat::identity());
        let pose = tracker.get_pose(1.5).unwrap();
        assert_eq!(pose.position, Vec3::new(0.2, 0.0, 0.0));
    }

    #[test]
    fn test_query_target_cannot_expire_tracking() {
        let tracker = tracking_at_origin();
        feed_gyro(&tracker, 1, 10, Vec3::zeros());

        assert_eq!(not_ready(tracker.get_pose(f64::NAN)), NotReadyReason::InvalidTimestamp);
        assert_eq!(
            not_ready(tracker.get_pose(f64::INFINITY)),
            NotReadyReason::InvalidTimestamp
        );

        let far = tracker.get_pose(1e6).unwrap();
        assert!(far.is_finite());
        assert_eq!(far.confidence, PoseConfidence::Degraded);

        assert_eq!(tracker.filter_state().phase, TrackingPhase::Tracking);
        assert_eq!(tracker.stats().reinitializations, 0);
        assert_eq!(tracker.get_pose(0.1).unwrap().confidence, PoseConfidence::Nominal);
    }

    #[test]
    fn test_init_ekf_forces_warmup() {
        let tracker = tracking_at_origin();
        tracker.init_ekf();
        assert_eq!(not_ready(tracker.get_pose(0.0)), NotReadyReason::Initializing);
        feed_visual(&tracker, 0.005, Vec3::zeros(), Quat::identity());
        assert!(tracker.get_pose(0.005).is_ok());
    }

    #[test]
    fn test_malformed_samples_dropped() {
        let tracker = LowLatencyTracker::default();
        tracker.on_gyro_data_updated(0.0, Vec3::new(f64::NAN, 0.0, 0.0));
        tracker.on_accelerometer_data_updated(0.0, Vec3::new(0.0, 1e4, 0.0));
        tracker.on_arkit_data_updated(
            0.0,
            Vec3::zeros(),
            Quaternion::new(0.0, 0.0, 0.0, 0.0),
            Matrix3::identity(),
        );
        tracker.on_gyro_data_updated(0.01, Vec3::zeros());

        let stats = tracker.stats();
        assert_eq!(stats.gyro_dropped, 1);
        assert_eq!(stats.accel_dropped, 1);
        assert_eq!(stats.visual_dropped, 1);
        assert_eq!(stats.gyro_accepted, 1);
        assert!(tracker.latest_intrinsics().is_none());
        assert!(!tracker.health_report(0.01).visual.healthy);
    }

    #[test]
    fn test_rejects_invalid_config() {
        let config = TrackingConfig {
            gyro_buffer_capacity: 0,
            ..TrackingConfig::default()
        };
        assert!(matches!(LowLatencyTracker::new(config), Err(TrackingError::Config(_))));
    }

    #[test]
    fn test_simulated_session_accuracy() {
        let sim = HeadMotion::new(SimulationConfig {
            duration: 4.0,
            ..SimulationConfig::default()
        });
        let tracker = LowLatencyTracker::default();
        let lookahead = 0.02;

        let mut checked = 0;
        let mut max_orientation_err: f64 = 0.0;
        let mut max_position_err: f64 = 0.0;
        for timed in sim.generate() {
            match timed.event {
                SensorEvent::Accel(a) => {
                    tracker.on_accelerometer_data_updated(a.timestamp, a.acceleration)
                }
                SensorEvent::Visual(v) => tracker.on_arkit_data_updated(
                    v.timestamp,
                    v.position,
                    v.orientation.into_inner(),
                    v.intrinsics,
                ),
                SensorEvent::Gyro(g) => {
                    tracker.on_gyro_data_updated(g.timestamp, g.angular_rate);
                    if g.timestamp < 1.0 {
                        continue;
                    }
                    let target = g.timestamp + lookahead;
                    let pose = tracker.get_pose(target).unwrap();
                    assert_relative_eq!(pose.orientation.quaternion().norm(), 1.0, epsilon = 1e-6);
                    let (position, orientation) = sim.pose_at(target);
                    max_orientation_err = max_orientation_err.max(pose.orientation.angle_to(&orientation));
                    max_position_err = max_position_err.max((pose.position - position).norm());
                    checked += 1;
                }
            }
        }

        assert!(checked > 250);
        assert!(max_orientation_err < 0.02, "orientation error {max_orientation_err}");
        assert!(max_position_err < 0.02, "position error {max_position_err}");
        assert_eq!(tracker.stats().outliers, 0);
    }

    #[test]
    fn test_concurrent_ingestion_and_queries() {
        let sim = HeadMotion::new(SimulationConfig {
            duration: 2.0,
            ..SimulationConfig::default()
        });
        let events = sim.generate();
        let tracker = Arc::new(LowLatencyTracker::default());

        let streams = [
            select(&events, |e| matches!(e, SensorEvent::Accel(_))),
            select(&events, |e| matches!(e, SensorEvent::Gyro(_))),
            select(&events, |e| matches!(e, SensorEvent::Visual(_))),
        ];

        let mut handles = Vec::new();
        for stream in streams {
            let tracker = Arc::clone(&tracker);
            handles.push(thread::spawn(move || {
                for event in stream {
                    match event {
                        SensorEvent::Accel(a) => {
                            tracker.on_accelerometer_data_updated(a.timestamp, a.acceleration)
                        }
                        SensorEvent::Gyro(g) => {
                            tracker.on_gyro_data_updated(g.timestamp, g.angular_rate)
                        }
                        SensorEvent::Visual(v) => tracker.on_arkit_data_updated(
                            v.timestamp,
                            v.position,
                            v.orientation.into_inner(),
                            v.intrinsics,
                        ),
                    }
                }
            }));
        }

        let reader = {
            let tracker = Arc::clone(&tracker);
            thread::spawn(move || {
                for i in 0..2000 {
                    if let Ok(pose) = tracker.get_pose(i as f64 * 0.001) {
                        assert!(pose.is_finite());
                        assert_relative_eq!(pose.orientation.quaternion().norm(), 1.0, epsilon = 1e-6);
                    }
                    if i == 1000 {
                        tracker.set_is_filtering_gyro(false);
                    }
                }
            })
        };

        for handle in handles {
            handle.join().unwrap();
        }
        reader.join().unwrap();

        let stats = tracker.stats();
        assert_eq!(stats.queries, 2000);
        assert!(stats.gyro_accepted > 0 && stats.visual_accepted > 0);
    }
}
