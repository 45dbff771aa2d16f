//! Linear algebra type system for the calibration harness
//!
//! Provides compile-time dimension checking and clean type aliases
//! for the pose filter, the PnP solver and the noise parameter vector.

use nalgebra::{Isometry3, SMatrix, SVector};

// ===== Tracker Noise Parameters =====
pub const PARAM_DIM: usize = 4;

/// [positional noise, rotational noise, beacon noise, measurement variance scale]
pub type ParamVec = SVector<f64, PARAM_DIM>;

// ===== Pose Filter Dimensions =====
pub const STATE_DIM_POSE: usize = 12; // [p, v, theta, omega]
pub const MEASURE_DIM_POSE: usize = 6; // [theta, p]

pub type PoseStateVec = SVector<f64, STATE_DIM_POSE>;
pub type PoseStateMat = SMatrix<f64, STATE_DIM_POSE, STATE_DIM_POSE>;

// Measurement types for the pose filter
pub type PoseMeasVec = SVector<f64, MEASURE_DIM_POSE>;
pub type PoseMeasNoise = SMatrix<f64, MEASURE_DIM_POSE, MEASURE_DIM_POSE>;

// Kalman gain and Jacobian
pub type KalmanGainPose = SMatrix<f64, STATE_DIM_POSE, MEASURE_DIM_POSE>; // 12×6
pub type JacobianPose = SMatrix<f64, MEASURE_DIM_POSE, STATE_DIM_POSE>; // 6×12

// ===== PnP Types =====
pub type PnpVec = SVector<f64, 6>; // [delta_theta, delta_t]
pub type PnpMat = SMatrix<f64, 6, 6>;
pub type ReprojectionJacobian = SMatrix<f64, 2, 6>;

/// Rigid transform of the tracked body expressed in camera space.
pub type Pose = Isometry3<f64>;
