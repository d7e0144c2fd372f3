pub mod linalg;

pub use linalg::*;

use nalgebra::{Matrix3, Quaternion};

use crate::error::{Result, TrackingError};

/// Anything that lives in a time-ordered sample buffer.
pub trait Timestamped {
    /// Sensor-clock time in seconds.
    fn timestamp(&self) -> f64;
}

/// Accelerometer reading (specific force, device frame, m/s²).
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct AccelerometerSample {
    pub timestamp: f64,
    pub acceleration: Vec3,
}

impl AccelerometerSample {
    pub fn new(timestamp: f64, acceleration: Vec3) -> Self {
        Self {
            timestamp,
            acceleration,
        }
    }

    pub fn is_finite(&self) -> bool {
        self.timestamp.is_finite() && self.acceleration.iter().all(|v| v.is_finite())
    }

    pub fn magnitude(&self) -> f64 {
        self.acceleration.norm()
    }
}

/// Gyroscope reading (angular rate, device frame, rad/s).
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct GyroSample {
    pub timestamp: f64,
    pub angular_rate: Vec3,
}

impl GyroSample {
    pub fn new(timestamp: f64, angular_rate: Vec3) -> Self {
        Self {
            timestamp,
            angular_rate,
        }
    }

    pub fn is_finite(&self) -> bool {
        self.timestamp.is_finite() && self.angular_rate.iter().all(|v| v.is_finite())
    }

    pub fn magnitude(&self) -> f64 {
        self.angular_rate.norm()
    }
}

/// Absolute pose from the visual-inertial tracking session.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct VisualInertialSample {
    pub timestamp: f64,
    pub position: Vec3,
    /// Always unit norm; enforced by [`VisualInertialSample::new`].
    pub orientation: Quat,
    pub intrinsics: Matrix3<f64>,
}

impl VisualInertialSample {
    /// Builds a sample, normalising the orientation.
    ///
    /// Rejects non-finite fields and degenerate (near-zero) quaternions.
    pub fn new(
        timestamp: f64,
        position: Vec3,
        orientation: Quaternion<f64>,
        intrinsics: Matrix3<f64>,
    ) -> Result<Self> {
        if !timestamp.is_finite() {
            return Err(TrackingError::MalformedSample(format!(
                "visual timestamp {timestamp}"
            )));
        }
        if !position.iter().all(|v| v.is_finite()) {
            return Err(TrackingError::MalformedSample(
                "visual position not finite".to_string(),
            ));
        }
        if !intrinsics.iter().all(|v| v.is_finite()) {
            return Err(TrackingError::MalformedSample(
                "camera intrinsics not finite".to_string(),
            ));
        }
        let norm = orientation.norm();
        if !norm.is_finite() || norm < 1e-6 {
            return Err(TrackingError::MalformedSample(format!(
                "visual orientation norm {norm}"
            )));
        }

        Ok(Self {
            timestamp,
            position,
            orientation: Quat::new_normalize(orientation),
            intrinsics,
        })
    }
}

/// Gyro rate paired with the accelerometer value interpolated at the same instant.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ImuSample {
    pub timestamp: f64,
    pub angular_rate: Vec3,
    /// `None` when no accelerometer data brackets this instant.
    pub acceleration: Option<Vec3>,
    /// Pre-filter judged the device still around this sample.
    pub stationary: bool,
}

/// A sample after the pre-filter, tagged with the stationarity verdict.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Conditioned<T> {
    pub sample: T,
    pub stationary: bool,
}

impl Timestamped for AccelerometerSample {
    fn timestamp(&self) -> f64 {
        self.timestamp
    }
}

impl Timestamped for GyroSample {
    fn timestamp(&self) -> f64 {
        self.timestamp
    }
}

impl Timestamped for VisualInertialSample {
    fn timestamp(&self) -> f64 {
        self.timestamp
    }
}

impl Timestamped for ImuSample {
    fn timestamp(&self) -> f64 {
        self.timestamp
    }
}

impl<T: Timestamped> Timestamped for Conditioned<T> {
    fn timestamp(&self) -> f64 {
        self.sample.timestamp()
    }
}

/// How much the caller should trust a returned pose.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PoseConfidence {
    /// Recent correction, inertial extrapolation on top.
    Nominal,
    /// Dead reckoning: corrections stale or being rejected.
    Degraded,
    /// Low-latency mode off; raw visual-inertial pose.
    Passthrough,
}

/// Answer to a pose query.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Pose {
    pub timestamp: f64,
    pub position: Vec3,
    pub orientation: Quat,
    pub confidence: PoseConfidence,
}

impl Pose {
    pub fn is_finite(&self) -> bool {
        self.position.iter().all(|v| v.is_finite())
            && self.orientation.coords.iter().all(|v| v.is_finite())
    }
}
