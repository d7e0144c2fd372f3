use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TrackingError};
use crate::types::Vec3;

// ─── Configuration ───────────────────────────────────────────────────────────

/// Numeric tuning for the engine. Fixed for the engine's lifetime.
///
/// Every field is optional in JSON; missing fields take the defaults below.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackingConfig {
    // ── Buffers ──
    pub accel_buffer_capacity: usize,
    pub gyro_buffer_capacity: usize,
    pub pose_history_len: usize,

    // ── Time clamps ──
    /// Longest single integration step [s].
    pub max_integration_dt: f64,
    /// Longest hold of the newest rate past the newest sample [s].
    pub max_extrapolation: f64,
    /// Gap after which corrections count as stale and poses degrade [s].
    pub stale_threshold: f64,
    /// Gap after which the estimator drops back to initialising [s].
    pub hard_stale_limit: f64,

    // ── Warm-up ──
    pub warmup_gyro_samples: usize,

    // ── Pre-filter ──
    pub gyro_lpf_cutoff_hz: f64,
    pub accel_lpf_cutoff_hz: f64,
    /// Used for the low-pass step when consecutive timestamps are unusable.
    pub nominal_sample_rate_hz: f64,
    pub stationary_window: usize,
    pub stationary_gyro_std: f64,
    pub stationary_accel_std: f64,
    /// Upper bound on a plausible gyro bias [rad/s]; slower turns would be learned as bias.
    pub stationary_max_rate: f64,
    pub max_angular_rate: f64,
    pub max_acceleration: f64,

    // ── Process noise (continuous-time densities) ──
    pub gyro_noise_density: f64,
    pub accel_noise_density: f64,
    pub gyro_bias_random_walk: f64,
    pub position_random_walk: f64,

    // ── Initial uncertainty ──
    pub initial_velocity_std: f64,
    pub initial_gyro_bias_std: f64,

    // ── Measurement noise ──
    pub visual_position_std: f64,
    pub visual_orientation_std: f64,
    pub stationary_gyro_noise: f64,

    // ── Gating ──
    pub max_position_residual: f64,
    pub max_orientation_residual: f64,
    pub max_consecutive_outliers: u32,

    // ── Motion model ──
    /// World-frame gravity (y-up session frame).
    pub gravity: [f64; 3],
    pub use_accel_for_velocity: bool,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            accel_buffer_capacity: 256,
            gyro_buffer_capacity: 256,
            pose_history_len: 32,
            max_integration_dt: 0.2,
            max_extrapolation: 0.2,
            stale_threshold: 0.25,
            hard_stale_limit: 1.0,
            warmup_gyro_samples: 10,
            gyro_lpf_cutoff_hz: 40.0,
            accel_lpf_cutoff_hz: 10.0,
            nominal_sample_rate_hz: 100.0,
            stationary_window: 20,
            stationary_gyro_std: 0.02,
            stationary_accel_std: 0.05,
            stationary_max_rate: 0.03,
            max_angular_rate: 35.0,
            max_acceleration: 160.0,
            gyro_noise_density: 0.005,
            accel_noise_density: 0.1,
            gyro_bias_random_walk: 1e-4,
            position_random_walk: 1e-3,
            initial_velocity_std: 0.1,
            initial_gyro_bias_std: 0.01,
            visual_position_std: 0.005,
            visual_orientation_std: 0.01,
            stationary_gyro_noise: 0.01,
            max_position_residual: 0.3,
            max_orientation_residual: 0.35,
            max_consecutive_outliers: 5,
            gravity: [0.0, -9.81, 0.0],
            use_accel_for_velocity: true,
        }
    }
}

impl TrackingConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| TrackingError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            TrackingError::Config(format!("{}: {e}", path.as_ref().display()))
        })?;
        Self::from_json_str(&text)
    }

    pub fn gravity_vector(&self) -> Vec3 {
        Vec3::new(self.gravity[0], self.gravity[1], self.gravity[2])
    }

    pub fn validate(&self) -> Result<()> {
        if self.accel_buffer_capacity == 0 || self.gyro_buffer_capacity == 0 {
            return Err(TrackingError::Config("buffer capacity must be > 0".into()));
        }
        if self.pose_history_len == 0 {
            return Err(TrackingError::Config("pose history must hold at least one pose".into()));
        }
        if self.stationary_window < 2 {
            return Err(TrackingError::Config("stationary window needs >= 2 samples".into()));
        }
        let positive = [
            ("max_integration_dt", self.max_integration_dt),
            ("stale_threshold", self.stale_threshold),
            ("hard_stale_limit", self.hard_stale_limit),
            ("gyro_lpf_cutoff_hz", self.gyro_lpf_cutoff_hz),
            ("accel_lpf_cutoff_hz", self.accel_lpf_cutoff_hz),
            ("nominal_sample_rate_hz", self.nominal_sample_rate_hz),
            ("visual_position_std", self.visual_position_std),
            ("visual_orientation_std", self.visual_orientation_std),
            ("stationary_gyro_noise", self.stationary_gyro_noise),
        ];
        for (name, value) in positive {
            if !(value.is_finite() && value > 0.0) {
                return Err(TrackingError::Config(format!("{name} must be > 0, got {value}")));
            }
        }
        if self.max_extrapolation < 0.0 || !self.max_extrapolation.is_finite() {
            return Err(TrackingError::Config("max_extrapolation must be >= 0".into()));
        }
        if self.hard_stale_limit < self.stale_threshold {
            return Err(TrackingError::Config(
                "hard_stale_limit must not be below stale_threshold".into(),
            ));
        }
        if !self.gravity.iter().all(|g| g.is_finite()) {
            return Err(TrackingError::Config("gravity must be finite".into()));
        }
        Ok(())
    }
}

// ─── Feature flags ───────────────────────────────────────────────────────────

/// Runtime toggles, read as one snapshot per processing step.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureFlags {
    pub filter_gyro: bool,
    pub filter_accel: bool,
    /// Off: `get_pose` passes the newest visual-inertial pose through.
    pub low_latency: bool,
}

impl Default for FeatureFlags {
    fn default() -> Self {
        Self {
            filter_gyro: true,
            filter_accel: true,
            low_latency: true,
        }
    }
}
