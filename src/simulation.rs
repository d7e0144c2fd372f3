//! Deterministic synthetic head motion.
//!
//! The head rests until `still_until`, then yaws and nods sinusoidally while
//! swaying sideways. Gyro and accelerometer streams are derived analytically
//! from the trajectory (with a constant gyro bias and a small deterministic
//! ripple standing in for sensor noise); visual-inertial samples report the
//! exact pose and are delivered `visual_latency` after their timestamp.

use std::f64::consts::PI;

use nalgebra::Matrix3;
use serde::{Deserialize, Serialize};

use crate::types::{AccelerometerSample, GyroSample, Quat, Vec3, VisualInertialSample};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    pub duration: f64,
    pub gyro_rate_hz: f64,
    pub accel_rate_hz: f64,
    pub visual_rate_hz: f64,
    /// Delivery delay of visual-inertial samples [s].
    pub visual_latency: f64,
    pub still_until: f64,

    // ── Trajectory ──
    pub yaw_amplitude: f64,
    pub pitch_amplitude: f64,
    pub motion_frequency_hz: f64,
    pub sway_radius: f64,

    // ── Sensor errors ──
    pub gyro_bias: [f64; 3],
    pub gyro_noise: f64,
    pub accel_noise: f64,

    pub gravity: [f64; 3],
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            duration: 5.0,
            gyro_rate_hz: 100.0,
            accel_rate_hz: 100.0,
            visual_rate_hz: 60.0,
            visual_latency: 0.03,
            still_until: 0.5,
            yaw_amplitude: 0.5,
            pitch_amplitude: 0.1,
            motion_frequency_hz: 0.5,
            sway_radius: 0.05,
            gyro_bias: [0.01, -0.005, 0.002],
            gyro_noise: 0.002,
            accel_noise: 0.02,
            gravity: [0.0, -9.81, 0.0],
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum SensorEvent {
    Accel(AccelerometerSample),
    Gyro(GyroSample),
    Visual(VisualInertialSample),
}

/// A sensor event stamped with the moment it reaches the engine.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TimedEvent {
    pub delivered_at: f64,
    pub event: SensorEvent,
}

pub struct HeadMotion {
    config: SimulationConfig,
}

impl HeadMotion {
    pub fn new(config: SimulationConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SimulationConfig {
        &self.config
    }

    fn omega(&self) -> f64 {
        2.0 * PI * self.config.motion_frequency_hz
    }

    fn moving_time(&self, t: f64) -> f64 {
        (t - self.config.still_until).max(0.0)
    }

    /// Yaw, yaw rate, pitch, pitch rate.
    fn angles(&self, t: f64) -> (f64, f64, f64, f64) {
        let tau = self.moving_time(t);
        let w = self.omega();
        let wp = 1.3 * w;
        let moving = if t > self.config.still_until { 1.0 } else { 0.0 };
        let yaw = self.config.yaw_amplitude * (w * tau).sin();
        let yaw_rate = moving * self.config.yaw_amplitude * w * (w * tau).cos();
        let pitch = self.config.pitch_amplitude * (1.0 - (wp * tau).cos());
        let pitch_rate = moving * self.config.pitch_amplitude * wp * (wp * tau).sin();
        (yaw, yaw_rate, pitch, pitch_rate)
    }

    fn orientation_at(&self, t: f64) -> Quat {
        let (yaw, _, pitch, _) = self.angles(t);
        Quat::from_axis_angle(&Vec3::y_axis(), yaw) * Quat::from_axis_angle(&Vec3::x_axis(), pitch)
    }

    /// Ground-truth pose.
    pub fn pose_at(&self, t: f64) -> (Vec3, Quat) {
        let tau = self.moving_time(t);
        let s = self.config.sway_radius * (1.0 - (self.omega() * tau).cos());
        (Vec3::new(s, 0.0, 0.5 * s), self.orientation_at(t))
    }

    fn linear_acceleration(&self, t: f64) -> Vec3 {
        if t <= self.config.still_until {
            return Vec3::zeros();
        }
        let w = self.omega();
        let a = self.config.sway_radius * w * w * (w * self.moving_time(t)).cos();
        Vec3::new(a, 0.0, 0.5 * a)
    }

    /// True body-frame angular rate.
    pub fn angular_rate_at(&self, t: f64) -> Vec3 {
        let (_, yaw_rate, pitch, pitch_rate) = self.angles(t);
        let pitch_rot = Quat::from_axis_angle(&Vec3::x_axis(), pitch);
        pitch_rot.inverse() * Vec3::new(0.0, yaw_rate, 0.0) + Vec3::new(pitch_rate, 0.0, 0.0)
    }

    /// True body-frame specific force.
    pub fn specific_force_at(&self, t: f64) -> Vec3 {
        let gravity = Vec3::from(self.config.gravity);
        self.orientation_at(t).inverse() * (self.linear_acceleration(t) - gravity)
    }

    fn ripple(t: f64, amplitude: f64) -> Vec3 {
        let axis = |f: f64, phase: f64| {
            0.5 * amplitude * ((2.0 * PI * f * t + phase).sin() + (2.0 * PI * 1.618 * f * t).cos())
        };
        Vec3::new(axis(37.3, 0.0), axis(41.9, 1.0), axis(53.1, 2.0))
    }

    pub fn gyro_at(&self, t: f64) -> GyroSample {
        let bias = Vec3::from(self.config.gyro_bias);
        let rate = self.angular_rate_at(t) + bias + Self::ripple(t, self.config.gyro_noise);
        GyroSample::new(t, rate)
    }

    pub fn accel_at(&self, t: f64) -> AccelerometerSample {
        let force = self.specific_force_at(t) + Self::ripple(t + 0.37, self.config.accel_noise);
        AccelerometerSample::new(t, force)
    }

    pub fn visual_at(&self, t: f64) -> VisualInertialSample {
        let (position, orientation) = self.pose_at(t);
        VisualInertialSample {
            timestamp: t,
            position,
            orientation,
            intrinsics: Matrix3::new(1400.0, 0.0, 960.0, 0.0, 1400.0, 540.0, 0.0, 0.0, 1.0),
        }
    }

    fn stamps(&self, rate_hz: f64) -> impl Iterator<Item = f64> {
        let count = (self.config.duration * rate_hz).floor() as usize;
        (0..=count).map(move |i| i as f64 / rate_hz)
    }

    /// Every sample of the session, ordered by delivery time.
    pub fn generate(&self) -> Vec<TimedEvent> {
        let mut events: Vec<TimedEvent> = Vec::new();
        events.extend(self.stamps(self.config.accel_rate_hz).map(|t| TimedEvent {
            delivered_at: t,
            event: SensorEvent::Accel(self.accel_at(t)),
        }));
        events.extend(self.stamps(self.config.gyro_rate_hz).map(|t| TimedEvent {
            delivered_at: t,
            event: SensorEvent::Gyro(self.gyro_at(t)),
        }));
        events.extend(self.stamps(self.config.visual_rate_hz).map(|t| TimedEvent {
            delivered_at: t + self.config.visual_latency,
            event: SensorEvent::Visual(self.visual_at(t)),
        }));
        events.sort_by(|a, b| a.delivered_at.total_cmp(&b.delivered_at));
        events
    }
}

impl Default for HeadMotion {
    fn default() -> Self {
        Self::new(SimulationConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_still_phase_reads_bias_and_gravity() {
        let sim = HeadMotion::new(SimulationConfig {
            gyro_noise: 0.0,
            accel_noise: 0.0,
            ..SimulationConfig::default()
        });
        let gyro = sim.gyro_at(0.2);
        assert_relative_eq!(gyro.angular_rate, Vec3::new(0.01, -0.005, 0.002), epsilon = 1e-12);
        let accel = sim.accel_at(0.2);
        assert_relative_eq!(accel.acceleration, Vec3::new(0.0, 9.81, 0.0), epsilon = 1e-12);
    }

    #[test]
    fn test_rates_match_trajectory() {
        let sim = HeadMotion::default();
        let dt = 1e-5;
        for &t in &[0.8, 1.3, 2.7] {
            let q0 = sim.pose_at(t).1;
            let q1 = sim.pose_at(t + dt).1;
            let numeric = (q0.inverse() * q1).scaled_axis() / dt;
            assert_relative_eq!(numeric, sim.angular_rate_at(t), epsilon = 1e-3);
        }
    }

    #[test]
    fn test_events_ordered_by_delivery() {
        let sim = HeadMotion::new(SimulationConfig {
            duration: 1.0,
            ..SimulationConfig::default()
        });
        let events = sim.generate();
        assert!(events.windows(2).all(|w| w[0].delivered_at <= w[1].delivered_at));

        let visual = events
            .iter()
            .filter(|e| matches!(e.event, SensorEvent::Visual(_)))
            .count();
        assert_eq!(visual, 61);
    }
}
