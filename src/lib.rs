//! Low-latency head-pose tracking.
//!
//! Fuses high-rate gyroscope and accelerometer streams with delayed
//! visual-inertial poses in an error-state EKF, and answers pose queries at
//! arbitrary (usually future) timestamps by integrating the inertial samples
//! newer than the last correction.
//!
//! [`LowLatencyTracker`] is the entry point; everything else is exposed for
//! replay tooling and tests.

pub mod buffers;
pub mod config;
pub mod error;
pub mod estimator;
pub mod filters;
pub mod health;
pub mod imu_sync;
pub mod simulation;
pub mod tracker;
pub mod types;

pub use config::{FeatureFlags, TrackingConfig};
pub use error::{NotReadyReason, Result, TrackingError};
pub use estimator::{FilterState, TrackerEvent, TrackingPhase};
pub use health::{HealthMonitor, HealthReport};
pub use tracker::{LowLatencyTracker, StatsSnapshot};
pub use types::{
    AccelerometerSample, GyroSample, Pose, PoseConfidence, VisualInertialSample,
};
