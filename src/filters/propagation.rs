//! Step planning over merged inertial samples.
//!
//! Both the estimator (full predict with covariance) and the query layer
//! (nominal state only) walk the same sequence of integration steps, so the
//! stepping rules live here: trapezoidal rates between samples, linear
//! interpolation at window edges, a clamp on every step, and a bounded hold of
//! the newest rate past the newest sample.

use crate::config::TrackingConfig;
use crate::filters::pose_ekf::NominalState;
use crate::filters::prefilter::InertialPreFilter;
use crate::types::{ImuSample, Vec3};

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct StepLimits {
    pub max_dt: f64,
    pub max_extrapolation: f64,
}

impl StepLimits {
    pub fn from_config(config: &TrackingConfig) -> Self {
        Self {
            max_dt: config.max_integration_dt,
            max_extrapolation: config.max_extrapolation,
        }
    }
}

/// One integration step. Rates are raw (bias not removed).
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Step {
    /// `None` when no gyro data exists; orientation is held.
    pub angular_rate: Option<Vec3>,
    /// Device-frame specific force.
    pub acceleration: Option<Vec3>,
    pub dt: f64,
    pub stationary: bool,
}

#[derive(Clone, Debug, Default)]
pub struct StepPlan {
    pub steps: Vec<Step>,
    /// Steps whose gap exceeded the clamp.
    pub clamped: usize,
    /// Seconds integrated past the newest sample.
    pub extrapolated: f64,
}

impl StepPlan {
    fn push_segment(&mut self, from: &ImuSample, to: &ImuSample, dt: f64, limits: &StepLimits) {
        if dt <= 0.0 {
            return;
        }
        let dt = if dt > limits.max_dt {
            self.clamped += 1;
            limits.max_dt
        } else {
            dt
        };
        let acceleration = match (from.acceleration, to.acceleration) {
            (Some(a), Some(b)) => Some((a + b) * 0.5),
            (a, b) => a.or(b),
        };
        self.steps.push(Step {
            angular_rate: Some((from.angular_rate + to.angular_rate) * 0.5),
            acceleration,
            dt,
            stationary: from.stationary && to.stationary,
        });
    }

    pub fn total_dt(&self) -> f64 {
        self.steps.iter().map(|s| s.dt).sum()
    }
}

/// Sample state at `t` on the segment `a → b`.
fn lerp_imu(a: &ImuSample, b: &ImuSample, t: f64) -> ImuSample {
    let span = b.timestamp - a.timestamp;
    let u = if span > f64::EPSILON {
        ((t - a.timestamp) / span).clamp(0.0, 1.0)
    } else {
        1.0
    };
    let acceleration = match (a.acceleration, b.acceleration) {
        (Some(x), Some(y)) => Some(x.lerp(&y, u)),
        (x, y) => y.or(x),
    };
    ImuSample {
        timestamp: t,
        angular_rate: a.angular_rate.lerp(&b.angular_rate, u),
        acceleration,
        stationary: b.stationary,
    }
}

/// Plan the steps carrying a state at `start` to `target`.
///
/// `anchor` is the newest sample at or before `start`; `samples` are ascending
/// and may extend past `target`, in which case the last step ends on the
/// interpolated value at `target`.
pub fn plan_steps(
    start: f64,
    anchor: Option<&ImuSample>,
    samples: &[ImuSample],
    target: f64,
    limits: &StepLimits,
) -> StepPlan {
    let mut plan = StepPlan::default();
    if target <= start {
        return plan;
    }

    let mut cursor = start;
    let mut prev = anchor.copied();
    for sample in samples.iter().filter(|s| s.timestamp > start) {
        let at_cursor = prev.map_or(*sample, |p| lerp_imu(&p, sample, cursor));
        if sample.timestamp >= target {
            let at_target = prev.map_or(*sample, |p| lerp_imu(&p, sample, target));
            plan.push_segment(&at_cursor, &at_target, target - cursor, limits);
            return plan;
        }
        plan.push_segment(&at_cursor, sample, sample.timestamp - cursor, limits);
        cursor = sample.timestamp;
        prev = Some(*sample);
    }

    let dt = (target - cursor).min(limits.max_extrapolation);
    if dt > 0.0 {
        plan.extrapolated = dt;
        plan.steps.push(match prev {
            Some(p) => Step {
                angular_rate: Some(p.angular_rate),
                acceleration: p.acceleration,
                dt,
                stationary: p.stationary,
            },
            None => Step {
                angular_rate: None,
                acceleration: None,
                dt,
                stationary: false,
            },
        });
    }
    plan
}

/// Walk a plan over the nominal state only (query path).
pub fn extrapolate(
    state: &NominalState,
    plan: &StepPlan,
    gravity: &Vec3,
    use_acceleration: bool,
) -> NominalState {
    let mut out = *state;
    for step in &plan.steps {
        let rate = step
            .angular_rate
            .map(|w| InertialPreFilter::correct_gyro(&w, &state.gyro_bias))
            .unwrap_or_else(Vec3::zeros);
        let accel = step
            .acceleration
            .filter(|_| use_acceleration)
            .map(|f| out.world_acceleration(&f, gravity));
        out.integrate(&rate, accel.as_ref(), step.dt);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Quat;
    use approx::assert_relative_eq;

    fn limits() -> StepLimits {
        StepLimits {
            max_dt: 0.2,
            max_extrapolation: 0.05,
        }
    }

    fn imu(t: f64, wy: f64) -> ImuSample {
        ImuSample {
            timestamp: t,
            angular_rate: Vec3::new(0.0, wy, 0.0),
            acceleration: None,
            stationary: false,
        }
    }

    #[test]
    fn test_steps_cover_window_exactly() {
        let samples: Vec<_> = (1..=10).map(|i| imu(i as f64 * 0.01, 1.0)).collect();
        let anchor = imu(0.0, 1.0);
        let plan = plan_steps(0.0, Some(&anchor), &samples, 0.1, &limits());
        assert_eq!(plan.steps.len(), 10);
        assert_relative_eq!(plan.total_dt(), 0.1, epsilon = 1e-12);
        assert_eq!(plan.clamped, 0);
        assert_eq!(plan.extrapolated, 0.0);
    }

    #[test]
    fn test_trapezoid_between_samples() {
        let anchor = imu(0.0, 0.0);
        let samples = [imu(0.1, 2.0)];
        let plan = plan_steps(0.0, Some(&anchor), &samples, 0.1, &limits());
        assert_relative_eq!(plan.steps[0].angular_rate.unwrap().y, 1.0);

        // Window starts mid-segment: first step uses the interpolated rate.
        let plan = plan_steps(0.05, Some(&anchor), &samples, 0.1, &limits());
        assert_relative_eq!(plan.steps[0].angular_rate.unwrap().y, 1.5);
        assert_relative_eq!(plan.steps[0].dt, 0.05, epsilon = 1e-12);
    }

    #[test]
    fn test_target_between_samples() {
        let samples = [imu(0.1, 0.0), imu(0.2, 2.0)];
        let plan = plan_steps(0.0, None, &samples, 0.15, &limits());
        assert_relative_eq!(plan.total_dt(), 0.15, epsilon = 1e-12);
        let last = plan.steps.last().unwrap();
        assert_relative_eq!(last.angular_rate.unwrap().y, 0.5);
    }

    #[test]
    fn test_extrapolation_and_gap_clamps() {
        let samples = [imu(0.5, 1.0)];
        let plan = plan_steps(0.0, None, &samples, 1.0, &limits());
        assert_eq!(plan.clamped, 1);
        assert_relative_eq!(plan.extrapolated, 0.05);
        assert_relative_eq!(plan.total_dt(), 0.25, epsilon = 1e-12);

        let empty = plan_steps(0.0, None, &[], 1.0, &limits());
        assert_eq!(empty.steps.len(), 1);
        assert!(empty.steps[0].angular_rate.is_none());
        assert_relative_eq!(empty.total_dt(), 0.05);

        assert!(plan_steps(1.0, None, &samples, 1.0, &limits()).steps.is_empty());
    }

    #[test]
    fn test_extrapolate_nominal_state() {
        let samples: Vec<_> = (1..=10).map(|i| imu(i as f64 * 0.01, 1.0)).collect();
        let anchor = imu(0.0, 1.0);
        let plan = plan_steps(0.0, Some(&anchor), &samples, 0.1, &limits());

        let start = NominalState {
            velocity: Vec3::new(1.0, 0.0, 0.0),
            ..NominalState::default()
        };
        let gravity = Vec3::new(0.0, -9.81, 0.0);
        let out = extrapolate(&start, &plan, &gravity, true);

        let expected = Quat::from_scaled_axis(Vec3::new(0.0, 0.1, 0.0));
        assert_relative_eq!(out.orientation.angle_to(&expected), 0.0, epsilon = 1e-6);
        assert_relative_eq!(out.position.x, 0.1, epsilon = 1e-12);
    }
}
