//! Error-state extended Kalman filter for head pose.
//!
//! Nominal state: position, velocity, orientation (unit quaternion, body to
//! world) and gyro bias. The 12-dimensional error state is
//! `[δp, δv, δθ, δbg]` with `δθ` a right-multiplied rotation vector, so
//! `q_true = q ⊗ Exp(δθ)`.

use nalgebra::{Matrix3, SVector};

use crate::config::TrackingConfig;
use crate::error::{Result, TrackingError};
use crate::types::{
    ErrorStateMat, ErrorStateVec, GyroNoise, GyroResidual, JacobianGyro, JacobianPose,
    KalmanGainGyro, KalmanGainPose, PoseNoise, PoseResidual, Quat, Vec3, IDX_ATT,
    IDX_GYRO_BIAS, IDX_POS, IDX_VEL,
};

/// Best estimate of the pose, without uncertainty.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct NominalState {
    pub position: Vec3,
    pub velocity: Vec3,
    pub orientation: Quat,
    pub gyro_bias: Vec3,
}

impl Default for NominalState {
    fn default() -> Self {
        Self {
            position: Vec3::zeros(),
            velocity: Vec3::zeros(),
            orientation: Quat::identity(),
            gyro_bias: Vec3::zeros(),
        }
    }
}

impl NominalState {
    /// Advance by one step without touching covariance.
    ///
    /// `angular_rate` is already bias-corrected. `acceleration` is the
    /// world-frame linear acceleration; `None` holds velocity constant.
    pub fn integrate(&mut self, angular_rate: &Vec3, acceleration: Option<&Vec3>, dt: f64) {
        match acceleration {
            Some(a) => {
                self.position += self.velocity * dt + a * (0.5 * dt * dt);
                self.velocity += a * dt;
            }
            None => self.position += self.velocity * dt,
        }
        let delta = Quat::from_scaled_axis(angular_rate * dt);
        self.orientation = Quat::new_normalize((self.orientation * delta).into_inner());
    }

    /// World-frame linear acceleration from a device-frame specific force.
    pub fn world_acceleration(&self, specific_force: &Vec3, gravity: &Vec3) -> Vec3 {
        self.orientation * specific_force + gravity
    }

    pub fn is_finite(&self) -> bool {
        self.position.iter().all(|v| v.is_finite())
            && self.velocity.iter().all(|v| v.is_finite())
            && self.orientation.coords.iter().all(|v| v.is_finite())
            && self.gyro_bias.iter().all(|v| v.is_finite())
    }
}

/// Residual magnitudes of an accepted visual-inertial correction.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CorrectionResidual {
    pub position_m: f64,
    pub orientation_rad: f64,
}

pub struct PoseEkf {
    pub state: NominalState,

    /// Error-state covariance [12x12]
    pub covariance: ErrorStateMat,

    gravity: Vec3,

    // Continuous-time noise densities
    q_gyro: f64,
    q_accel: f64,
    q_gyro_bias: f64,
    q_position: f64,

    // Initial uncertainty
    p0_velocity: f64,
    p0_gyro_bias: f64,

    // Measurement noise (std)
    r_position: f64,
    r_orientation: f64,
    r_stationary_gyro: f64,

    max_position_residual: f64,
    max_orientation_residual: f64,

    /// Update counters
    visual_updates: u64,
    gyro_updates: u64,
}

impl PoseEkf {
    pub fn new(config: &TrackingConfig) -> Self {
        let mut ekf = Self {
            state: NominalState::default(),
            covariance: ErrorStateMat::identity(),
            gravity: config.gravity_vector(),
            q_gyro: config.gyro_noise_density,
            q_accel: config.accel_noise_density,
            q_gyro_bias: config.gyro_bias_random_walk,
            q_position: config.position_random_walk,
            p0_velocity: config.initial_velocity_std,
            p0_gyro_bias: config.initial_gyro_bias_std,
            r_position: config.visual_position_std,
            r_orientation: config.visual_orientation_std,
            r_stationary_gyro: config.stationary_gyro_noise,
            max_position_residual: config.max_position_residual,
            max_orientation_residual: config.max_orientation_residual,
            visual_updates: 0,
            gyro_updates: 0,
        };
        ekf.reset_covariance();
        ekf
    }

    /// Seed the nominal state from an absolute pose. Velocity restarts at zero.
    pub fn reset_to(&mut self, position: Vec3, orientation: Quat, gyro_bias: Vec3) {
        self.state = NominalState {
            position,
            velocity: Vec3::zeros(),
            orientation,
            gyro_bias,
        };
        self.reset_covariance();
    }

    fn reset_covariance(&mut self) {
        let mut diag = ErrorStateVec::zeros();
        let blocks = [
            (IDX_POS, self.r_position),
            (IDX_VEL, self.p0_velocity),
            (IDX_ATT, self.r_orientation),
            (IDX_GYRO_BIAS, self.p0_gyro_bias),
        ];
        for (idx, std) in blocks {
            diag.fixed_rows_mut::<3>(idx).fill(std * std);
        }
        self.covariance = ErrorStateMat::from_diagonal(&diag);
    }

    pub fn gravity(&self) -> &Vec3 {
        &self.gravity
    }

    /// Propagate state and covariance by `dt` from a raw (biased) gyro rate
    /// and, optionally, a device-frame specific force.
    pub fn predict(&mut self, gyro_raw: &Vec3, specific_force: Option<&Vec3>, dt: f64) {
        if dt <= 0.0 {
            return;
        }
        let omega = gyro_raw - self.state.gyro_bias;
        let rot = self.state.orientation.to_rotation_matrix().into_inner();
        let accel_world = specific_force.map(|f| self.state.world_acceleration(f, &self.gravity));

        // ── State Jacobian ──
        let mut f_mat = ErrorStateMat::identity();
        f_mat
            .fixed_view_mut::<3, 3>(IDX_POS, IDX_VEL)
            .copy_from(&(Matrix3::<f64>::identity() * dt));
        if let Some(f) = specific_force {
            f_mat
                .fixed_view_mut::<3, 3>(IDX_VEL, IDX_ATT)
                .copy_from(&(-rot * f.cross_matrix() * dt));
        }
        let delta_rot = Quat::from_scaled_axis(omega * dt).to_rotation_matrix().into_inner();
        f_mat
            .fixed_view_mut::<3, 3>(IDX_ATT, IDX_ATT)
            .copy_from(&delta_rot.transpose());
        f_mat
            .fixed_view_mut::<3, 3>(IDX_ATT, IDX_GYRO_BIAS)
            .copy_from(&(-Matrix3::<f64>::identity() * dt));

        // ── Process noise ──
        let mut q_diag = ErrorStateVec::zeros();
        let blocks = [
            (IDX_POS, self.q_position),
            (IDX_VEL, self.q_accel),
            (IDX_ATT, self.q_gyro),
            (IDX_GYRO_BIAS, self.q_gyro_bias),
        ];
        for (idx, density) in blocks {
            q_diag.fixed_rows_mut::<3>(idx).fill(density * density * dt);
        }
        let q_mat = ErrorStateMat::from_diagonal(&q_diag);

        self.state.integrate(&omega, accel_world.as_ref(), dt);
        self.covariance = f_mat * self.covariance * f_mat.transpose() + q_mat;
        self.symmetrize();
    }

    /// Fuse an absolute pose. Residuals above the gate are rejected and leave
    /// the filter untouched.
    pub fn correct_pose(&mut self, position: &Vec3, orientation: &Quat) -> Result<CorrectionResidual> {
        let r_pos = position - self.state.position;
        let r_att = (self.state.orientation.inverse() * orientation).scaled_axis();
        let residual = CorrectionResidual {
            position_m: r_pos.norm(),
            orientation_rad: r_att.norm(),
        };
        if residual.position_m > self.max_position_residual
            || residual.orientation_rad > self.max_orientation_residual
        {
            return Err(TrackingError::OutlierMeasurement {
                position_m: residual.position_m,
                orientation_rad: residual.orientation_rad,
            });
        }

        let mut innovation = PoseResidual::zeros();
        innovation.fixed_rows_mut::<3>(0).copy_from(&r_pos);
        innovation.fixed_rows_mut::<3>(3).copy_from(&r_att);

        let mut h = JacobianPose::zeros();
        h.fixed_view_mut::<3, 3>(0, IDX_POS).fill_with_identity();
        h.fixed_view_mut::<3, 3>(3, IDX_ATT).fill_with_identity();

        let pos_var = self.r_position * self.r_position;
        let att_var = self.r_orientation * self.r_orientation;
        let r = PoseNoise::from_diagonal(&SVector::<f64, 6>::from([
            pos_var, pos_var, pos_var, att_var, att_var, att_var,
        ]));

        let s_mat = h * self.covariance * h.transpose() + r;
        let Some(s_inv) = s_mat.try_inverse() else {
            log::warn!("pose correction skipped: singular innovation covariance");
            return Ok(residual);
        };
        let k: KalmanGainPose = self.covariance * h.transpose() * s_inv;
        self.apply_update(&(k * innovation), &(k * h), &(k * r * k.transpose()));
        self.visual_updates += 1;
        Ok(residual)
    }

    /// Stationary pseudo-measurement: the gyro reads its own bias.
    pub fn update_stationary_gyro(&mut self, gyro_meas: &Vec3) {
        let innovation: GyroResidual = gyro_meas - self.state.gyro_bias;

        let mut h = JacobianGyro::zeros();
        h.fixed_view_mut::<3, 3>(0, IDX_GYRO_BIAS).fill_with_identity();

        let var = self.r_stationary_gyro * self.r_stationary_gyro;
        let r = GyroNoise::identity() * var;

        let s_mat = h * self.covariance * h.transpose() + r;
        if let Some(s_inv) = s_mat.try_inverse() {
            let k: KalmanGainGyro = self.covariance * h.transpose() * s_inv;
            self.apply_update(&(k * innovation), &(k * h), &(k * r * k.transpose()));
            self.gyro_updates += 1;
        }
    }

    /// Apply a gain already computed against the current covariance, Joseph form.
    fn apply_update(&mut self, dx: &ErrorStateVec, kh: &ErrorStateMat, krk: &ErrorStateMat) {
        self.inject(dx);
        let i_kh = ErrorStateMat::identity() - kh;
        self.covariance = i_kh * self.covariance * i_kh.transpose() + krk;
        self.symmetrize();
    }

    /// Fold an error-state estimate into the nominal state.
    fn inject(&mut self, dx: &ErrorStateVec) {
        self.state.position += dx.fixed_rows::<3>(IDX_POS);
        self.state.velocity += dx.fixed_rows::<3>(IDX_VEL);
        let d_theta: Vec3 = dx.fixed_rows::<3>(IDX_ATT).into_owned();
        let corrected = self.state.orientation * Quat::from_scaled_axis(d_theta);
        self.state.orientation = Quat::new_normalize(corrected.into_inner());
        self.state.gyro_bias += dx.fixed_rows::<3>(IDX_GYRO_BIAS);
    }

    fn symmetrize(&mut self) {
        self.covariance = (self.covariance + self.covariance.transpose()) * 0.5;
    }

    pub fn covariance_trace(&self) -> f64 {
        self.covariance.trace()
    }

    pub fn visual_updates(&self) -> u64 {
        self.visual_updates
    }

    pub fn gyro_updates(&self) -> u64 {
        self.gyro_updates
    }
}
