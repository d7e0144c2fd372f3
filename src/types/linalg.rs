//! Linear algebra type system for the pose filter
//!
//! Provides compile-time dimension checking and clean type aliases
//! for the error-state Kalman filter.

use nalgebra::{SMatrix, SVector, UnitQuaternion, Vector3};

// ===== State Dimensions =====
pub const ERROR_STATE_DIM: usize = 12;

// Error-state block offsets: [δp, δv, δθ, δb_g]
pub const IDX_POS: usize = 0;
pub const IDX_VEL: usize = 3;
pub const IDX_ATT: usize = 6;
pub const IDX_GYRO_BIAS: usize = 9;

// ===== Measurement Dimensions =====
pub const MEASURE_DIM_POSE: usize = 6; // (x, y, z, θx, θy, θz)
pub const MEASURE_DIM_GYRO: usize = 3; // stationary rate

// ===== Error-State Filter Types =====
pub type ErrorStateVec = SVector<f64, ERROR_STATE_DIM>;
pub type ErrorStateMat = SMatrix<f64, ERROR_STATE_DIM, ERROR_STATE_DIM>;

// Measurement types
pub type PoseResidual = SVector<f64, MEASURE_DIM_POSE>;
pub type PoseNoise = SMatrix<f64, MEASURE_DIM_POSE, MEASURE_DIM_POSE>;
pub type GyroResidual = SVector<f64, MEASURE_DIM_GYRO>;
pub type GyroNoise = SMatrix<f64, MEASURE_DIM_GYRO, MEASURE_DIM_GYRO>;

// Kalman gain types
pub type KalmanGainPose = SMatrix<f64, ERROR_STATE_DIM, MEASURE_DIM_POSE>; // 12×6
pub type KalmanGainGyro = SMatrix<f64, ERROR_STATE_DIM, MEASURE_DIM_GYRO>; // 12×3

// Jacobian types
pub type JacobianPose = SMatrix<f64, MEASURE_DIM_POSE, ERROR_STATE_DIM>; // 6×12
pub type JacobianGyro = SMatrix<f64, MEASURE_DIM_GYRO, ERROR_STATE_DIM>; // 3×12

// ===== Geometry =====
pub type Vec3 = Vector3<f64>;
pub type Quat = UnitQuaternion<f64>;
