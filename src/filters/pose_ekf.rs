/// 12-Dimensional Error-State Kalman Filter for a rigid body seen by a camera
///
/// Nominal state:
///   position p, velocity v (camera frame, meters)
///   orientation q (unit quaternion), angular velocity omega (rad/s)
///
/// Error state [12D]:
/// [0-2]:   Position error
/// [3-5]:   Velocity error
/// [6-8]:   Orientation error (small angle, applied on the left)
/// [9-11]:  Angular velocity error
///
/// Motion model is constant velocity for both position and orientation,
/// driven by white acceleration noise. Measurements are full poses
/// ordered [theta, p] as produced by the PnP solver.
use nalgebra::{Isometry3, Matrix3, Translation3, UnitQuaternion, Vector3};
use serde::{Deserialize, Serialize};

use crate::types::{
    JacobianPose, KalmanGainPose, Pose, PoseMeasNoise, PoseMeasVec, PoseStateMat, PoseStateVec,
};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PoseEkfState {
    pub position: (f64, f64, f64),
    pub velocity: (f64, f64, f64),
    /// Quaternion (w, x, y, z)
    pub quaternion: (f64, f64, f64, f64),
    pub angular_velocity: (f64, f64, f64),
    pub covariance_trace: f64,
    pub predicts: u64,
    pub updates: u64,
    pub rejected_updates: u64,
}

pub struct PoseEkf {
    position: Vector3<f64>,
    velocity: Vector3<f64>,
    rotation: UnitQuaternion<f64>,
    angular_velocity: Vector3<f64>,

    /// Error-state covariance [12x12]
    covariance: PoseStateMat,

    /// White acceleration spectral density for position [m²/s³]
    positional_noise: f64,
    /// White angular acceleration spectral density [rad²/s³]
    rotational_noise: f64,

    initialized: bool,
    predict_count: u64,
    update_count: u64,
    rejected_count: u64,
}

impl PoseEkf {
    pub fn new(positional_noise: f64, rotational_noise: f64) -> Self {
        Self {
            position: Vector3::zeros(),
            velocity: Vector3::zeros(),
            rotation: UnitQuaternion::identity(),
            angular_velocity: Vector3::zeros(),
            covariance: PoseStateMat::identity(),
            positional_noise,
            rotational_noise,
            initialized: false,
            predict_count: 0,
            update_count: 0,
            rejected_count: 0,
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Seed the filter from a first pose measurement at rest.
    pub fn initialize(
        &mut self,
        pose: &Pose,
        pose_noise: &PoseMeasNoise,
        velocity_variance: f64,
        angular_velocity_variance: f64,
    ) {
        self.position = pose.translation.vector;
        self.rotation = pose.rotation;
        self.velocity = Vector3::zeros();
        self.angular_velocity = Vector3::zeros();

        let mut p = PoseStateMat::zeros();
        // Measurement blocks are [theta, p], state blocks are [p, v, theta, omega]
        p.fixed_view_mut::<3, 3>(0, 0)
            .copy_from(&pose_noise.fixed_view::<3, 3>(3, 3));
        p.fixed_view_mut::<3, 3>(6, 6)
            .copy_from(&pose_noise.fixed_view::<3, 3>(0, 0));
        p.fixed_view_mut::<3, 3>(0, 6)
            .copy_from(&pose_noise.fixed_view::<3, 3>(3, 0));
        p.fixed_view_mut::<3, 3>(6, 0)
            .copy_from(&pose_noise.fixed_view::<3, 3>(0, 3));
        p.fixed_view_mut::<3, 3>(3, 3)
            .copy_from(&(Matrix3::identity() * velocity_variance));
        p.fixed_view_mut::<3, 3>(9, 9)
            .copy_from(&(Matrix3::identity() * angular_velocity_variance));
        self.covariance = p;

        self.initialized = true;
        self.update_count += 1;
    }

    /// Forget everything; the next measurement re-initializes.
    pub fn reset(&mut self) {
        *self = Self::new(self.positional_noise, self.rotational_noise);
    }

    /// Propagate nominal state and covariance by `dt` seconds.
    pub fn predict(&mut self, dt: f64) {
        if !self.initialized || !(dt > 0.0) || !dt.is_finite() {
            return;
        }

        self.position += self.velocity * dt;
        self.rotation = UnitQuaternion::from_scaled_axis(self.angular_velocity * dt) * self.rotation;

        let f = Self::build_transition(dt);
        let q = self.build_process_noise(dt);
        self.covariance = f * self.covariance * f.transpose() + q;
        self.symmetrize();

        self.predict_count += 1;
    }

    fn build_transition(dt: f64) -> PoseStateMat {
        let mut f = PoseStateMat::identity();
        f.fixed_view_mut::<3, 3>(0, 3)
            .copy_from(&(Matrix3::identity() * dt));
        f.fixed_view_mut::<3, 3>(6, 9)
            .copy_from(&(Matrix3::identity() * dt));
        f
    }

    /// Discretized white-acceleration noise for each (value, rate) block pair.
    fn build_process_noise(&self, dt: f64) -> PoseStateMat {
        let mut q = PoseStateMat::zeros();
        let dt2 = dt * dt;
        let dt3 = dt2 * dt;
        for (offset, density) in [(0, self.positional_noise), (6, self.rotational_noise)] {
            for axis in 0..3 {
                let i = offset + axis;
                let j = offset + 3 + axis;
                q[(i, i)] = density * dt3 / 3.0;
                q[(i, j)] = density * dt2 / 2.0;
                q[(j, i)] = density * dt2 / 2.0;
                q[(j, j)] = density * dt;
            }
        }
        q
    }

    /// Pose measurement update. Returns false when the innovation
    /// covariance is singular and the update was skipped.
    pub fn update_pose(&mut self, measured: &Pose, noise: &PoseMeasNoise) -> bool {
        if !self.initialized {
            return false;
        }

        let mut residual = PoseMeasVec::zeros();
        let rotation_error = (measured.rotation * self.rotation.inverse()).scaled_axis();
        residual
            .fixed_rows_mut::<3>(0)
            .copy_from(&rotation_error);
        residual
            .fixed_rows_mut::<3>(3)
            .copy_from(&(measured.translation.vector - self.position));

        let h = Self::measurement_jacobian();
        let p = self.covariance;
        let s = h * p * h.transpose() + noise;
        let Some(s_inv) = s.try_inverse() else {
            self.rejected_count += 1;
            return false; // Singular innovation covariance
        };
        let k: KalmanGainPose = p * h.transpose() * s_inv;
        let dx: PoseStateVec = k * residual;

        self.position += dx.fixed_rows::<3>(0);
        self.velocity += dx.fixed_rows::<3>(3);
        self.rotation =
            UnitQuaternion::from_scaled_axis(dx.fixed_rows::<3>(6).into_owned()) * self.rotation;
        self.angular_velocity += dx.fixed_rows::<3>(9);

        // Joseph form
        let i_kh = PoseStateMat::identity() - k * h;
        self.covariance = i_kh * p * i_kh.transpose() + k * noise * k.transpose();
        self.symmetrize();

        self.update_count += 1;
        true
    }

    fn measurement_jacobian() -> JacobianPose {
        let mut h = JacobianPose::zeros();
        h.fixed_view_mut::<3, 3>(0, 6).copy_from(&Matrix3::identity());
        h.fixed_view_mut::<3, 3>(3, 0).copy_from(&Matrix3::identity());
        h
    }

    fn symmetrize(&mut self) {
        self.covariance = (self.covariance + self.covariance.transpose()) * 0.5;
    }

    pub fn pose(&self) -> Pose {
        Isometry3::from_parts(Translation3::from(self.position), self.rotation)
    }

    pub fn get_state(&self) -> PoseEkfState {
        let q = self.rotation.quaternion();
        PoseEkfState {
            position: (self.position.x, self.position.y, self.position.z),
            velocity: (self.velocity.x, self.velocity.y, self.velocity.z),
            quaternion: (q.w, q.i, q.j, q.k),
            angular_velocity: (
                self.angular_velocity.x,
                self.angular_velocity.y,
                self.angular_velocity.z,
            ),
            covariance_trace: self.covariance.trace(),
            predicts: self.predict_count,
            updates: self.update_count,
            rejected_updates: self.rejected_count,
        }
    }
}
