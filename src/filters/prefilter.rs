//! Inertial pre-filter: sample validation, optional low-pass smoothing and
//! stationarity detection for the gyro and accelerometer streams.
//!
//! Each stream has its own state behind its own lock, so a gyro producer never
//! waits on the accelerometer producer. Gyro bias is not tracked here: the pose
//! filter owns it and stationary gyro samples are fed to it as bias
//! measurements.

use std::collections::VecDeque;
use std::f64::consts::PI;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use crate::buffers::lock;
use crate::config::{FeatureFlags, TrackingConfig};
use crate::error::{Result, TrackingError};
use crate::types::{AccelerometerSample, Conditioned, GyroSample, Vec3};

// ─── Signal processing ───────────────────────────────────────────────────────

/// First-order low-pass with a time-varying step.
#[derive(Clone, Debug)]
struct LowPassFilter {
    cutoff_hz: f64,
    nominal_dt: f64,
    last_output: Vec3,
    last_timestamp: Option<f64>,
}

impl LowPassFilter {
    fn new(cutoff_hz: f64, nominal_rate_hz: f64) -> Self {
        Self {
            cutoff_hz,
            nominal_dt: 1.0 / nominal_rate_hz,
            last_output: Vec3::zeros(),
            last_timestamp: None,
        }
    }

    fn update(&mut self, input: Vec3, timestamp: f64) -> Vec3 {
        let Some(prev) = self.last_timestamp else {
            self.prime(input, timestamp);
            return input;
        };
        let mut dt = timestamp - prev;
        if dt <= 0.0 || dt > 10.0 * self.nominal_dt {
            dt = self.nominal_dt;
        }
        let rc = 1.0 / (2.0 * PI * self.cutoff_hz);
        let alpha = dt / (rc + dt);
        self.last_output = self.last_output * (1.0 - alpha) + input * alpha;
        self.last_timestamp = Some(timestamp);
        self.last_output
    }

    /// Track the raw signal without smoothing, so re-enabling does not jump.
    fn prime(&mut self, input: Vec3, timestamp: f64) {
        self.last_output = input;
        self.last_timestamp = Some(timestamp);
    }

    fn reset(&mut self) {
        self.last_output = Vec3::zeros();
        self.last_timestamp = None;
    }
}

/// Sliding window of vectors with mean and spread.
#[derive(Clone, Debug)]
struct MotionWindow {
    window: VecDeque<Vec3>,
    size: usize,
}

impl MotionWindow {
    fn new(size: usize) -> Self {
        Self {
            window: VecDeque::with_capacity(size),
            size,
        }
    }

    fn push(&mut self, value: Vec3) {
        if self.window.len() >= self.size {
            self.window.pop_front();
        }
        self.window.push_back(value);
    }

    fn is_full(&self) -> bool {
        self.window.len() >= self.size
    }

    fn mean(&self) -> Vec3 {
        if self.window.is_empty() {
            return Vec3::zeros();
        }
        self.window.iter().sum::<Vec3>() / self.window.len() as f64
    }

    /// RMS distance from the window mean.
    fn std_dev(&self) -> f64 {
        if self.window.len() < 2 {
            return 0.0;
        }
        let mean = self.mean();
        let var = self
            .window
            .iter()
            .map(|v| (v - mean).norm_squared())
            .sum::<f64>()
            / self.window.len() as f64;
        var.sqrt()
    }

    fn clear(&mut self) {
        self.window.clear();
    }
}

/// Mean of a rate window judged still, or `None` if it moved.
pub fn stationary_mean(rates: &[Vec3], config: &TrackingConfig) -> Option<Vec3> {
    if rates.len() < 2 {
        return None;
    }
    let mut window = MotionWindow::new(rates.len());
    rates.iter().for_each(|r| window.push(*r));
    let mean = window.mean();
    (window.std_dev() < config.stationary_gyro_std && mean.norm() < config.stationary_max_rate)
        .then_some(mean)
}

// ─── Per-stream channels ─────────────────────────────────────────────────────

#[derive(Clone, Debug)]
struct StreamChannel {
    lpf: LowPassFilter,
    window: MotionWindow,
    last_timestamp: Option<f64>,
}

impl StreamChannel {
    fn new(cutoff_hz: f64, nominal_rate_hz: f64, window: usize) -> Self {
        Self {
            lpf: LowPassFilter::new(cutoff_hz, nominal_rate_hz),
            window: MotionWindow::new(window),
            last_timestamp: None,
        }
    }

    fn check_order(&self, stream: &'static str, timestamp: f64) -> Result<()> {
        match self.last_timestamp {
            Some(prev) if timestamp < prev => Err(TrackingError::StaleInput {
                stream,
                gap_secs: prev - timestamp,
            }),
            _ => Ok(()),
        }
    }

    fn filter(&mut self, raw: Vec3, timestamp: f64, enabled: bool) -> Vec3 {
        self.last_timestamp = Some(timestamp);
        self.window.push(raw);
        if enabled {
            self.lpf.update(raw, timestamp)
        } else {
            self.lpf.prime(raw, timestamp);
            raw
        }
    }

    fn reset(&mut self) {
        self.lpf.reset();
        self.window.clear();
        self.last_timestamp = None;
    }
}

// ─── Pre-filter ──────────────────────────────────────────────────────────────

pub struct InertialPreFilter {
    gyro: Mutex<StreamChannel>,
    accel: Mutex<StreamChannel>,
    /// Accelerometer spread is low; written by the accel producer only.
    accel_quiet: AtomicBool,
    stationary_gyro_std: f64,
    stationary_accel_std: f64,
    stationary_max_rate: f64,
    max_angular_rate: f64,
    max_acceleration: f64,
}

impl InertialPreFilter {
    pub fn new(config: &TrackingConfig) -> Self {
        Self {
            gyro: Mutex::new(StreamChannel::new(
                config.gyro_lpf_cutoff_hz,
                config.nominal_sample_rate_hz,
                config.stationary_window,
            )),
            accel: Mutex::new(StreamChannel::new(
                config.accel_lpf_cutoff_hz,
                config.nominal_sample_rate_hz,
                config.stationary_window,
            )),
            accel_quiet: AtomicBool::new(true),
            stationary_gyro_std: config.stationary_gyro_std,
            stationary_accel_std: config.stationary_accel_std,
            stationary_max_rate: config.stationary_max_rate,
            max_angular_rate: config.max_angular_rate,
            max_acceleration: config.max_acceleration,
        }
    }

    /// Validate, optionally smooth, and tag a raw gyro sample.
    ///
    /// Malformed or out-of-order samples are rejected before touching any
    /// running statistics.
    pub fn condition_gyro(
        &self,
        sample: GyroSample,
        flags: FeatureFlags,
    ) -> Result<Conditioned<GyroSample>> {
        if !sample.is_finite() {
            return Err(TrackingError::MalformedSample(format!(
                "gyro sample at {} not finite",
                sample.timestamp
            )));
        }
        let rate = sample.magnitude();
        if rate > self.max_angular_rate {
            return Err(TrackingError::MalformedSample(format!(
                "gyro rate {rate:.2} rad/s out of range"
            )));
        }

        let mut channel = lock(&self.gyro);
        channel.check_order("gyro", sample.timestamp)?;
        let filtered = channel.filter(sample.angular_rate, sample.timestamp, flags.filter_gyro);

        let still = channel.window.is_full()
            && channel.window.std_dev() < self.stationary_gyro_std
            && channel.window.mean().norm() < self.stationary_max_rate;
        let stationary = still && self.accel_quiet.load(Ordering::Acquire);

        Ok(Conditioned {
            sample: GyroSample::new(sample.timestamp, filtered),
            stationary,
        })
    }

    /// Validate and optionally smooth a raw accelerometer sample.
    pub fn condition_accel(
        &self,
        sample: AccelerometerSample,
        flags: FeatureFlags,
    ) -> Result<AccelerometerSample> {
        if !sample.is_finite() {
            return Err(TrackingError::MalformedSample(format!(
                "accelerometer sample at {} not finite",
                sample.timestamp
            )));
        }
        let magnitude = sample.magnitude();
        if magnitude > self.max_acceleration {
            return Err(TrackingError::MalformedSample(format!(
                "acceleration {magnitude:.1} m/s² out of range"
            )));
        }

        let mut channel = lock(&self.accel);
        channel.check_order("accel", sample.timestamp)?;
        let filtered = channel.filter(sample.acceleration, sample.timestamp, flags.filter_accel);
        self.accel_quiet.store(
            channel.window.std_dev() < self.stationary_accel_std,
            Ordering::Release,
        );

        Ok(AccelerometerSample::new(sample.timestamp, filtered))
    }

    /// Remove the estimator's bias from a measured angular rate.
    pub fn correct_gyro(angular_rate: &Vec3, bias: &Vec3) -> Vec3 {
        angular_rate - bias
    }

    pub fn reset(&self) {
        lock(&self.gyro).reset();
        lock(&self.accel).reset();
        self.accel_quiet.store(true, Ordering::Release);
    }
}
