/// Tracking system contract
///
/// The calibration and comparison code reaches the tracker only through
/// these traits. `beacon_system` is the production implementation; tests
/// use a scripted double.

pub mod beacon_system;
pub mod camera;
pub mod pnp;

pub use beacon_system::{BeaconTrackerConfig, BeaconTrackingSystem, BeaconTrackingSystemFactory};
pub use camera::CameraParameters;
pub use pnp::{Correspondence, PnpError, PnpSolution, RansacConfig};

use nalgebra::{UnitQuaternion, Vector3};
use serde::{Deserialize, Serialize};

use crate::error::BuildError;
use crate::types::{Blob, MeasurementRecord, ParamVec, Pose, Timestamp};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BodyId(pub usize);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TargetId(pub usize);

impl BodyId {
    pub const PRIMARY: BodyId = BodyId(0);
}

impl TargetId {
    pub const PRIMARY: TargetId = TargetId(0);
}

/// Noise model the optimizer tunes.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TrackerParams {
    /// Process noise autocorrelation, [0..3] position axes, [3..6] rotation axes
    pub process_noise_autocorrelation: [f64; 6],
    pub beacon_process_noise: f64,
    pub measurement_variance_scale_factor: f64,
}

impl Default for TrackerParams {
    fn default() -> Self {
        Self::from_vec(&ParamVec::new(4.14e-6, 1e-2, 0.0, 5e-2))
    }
}

impl TrackerParams {
    /// [positional noise, rotational noise, beacon noise, variance scale]
    pub fn from_vec(x: &ParamVec) -> Self {
        Self {
            process_noise_autocorrelation: [x[0], x[0], x[0], x[1], x[1], x[1]],
            beacon_process_noise: x[2],
            measurement_variance_scale_factor: x[3],
        }
    }

    pub fn positional_noise(&self) -> f64 {
        self.process_noise_autocorrelation[0]
    }

    pub fn rotational_noise(&self) -> f64 {
        self.process_noise_autocorrelation[3]
    }

    /// Rejects negative or non-finite entries.
    pub fn validate(&self) -> Result<(), BuildError> {
        let named = [
            ("positional_noise", self.process_noise_autocorrelation[0]),
            ("positional_noise", self.process_noise_autocorrelation[1]),
            ("positional_noise", self.process_noise_autocorrelation[2]),
            ("rotational_noise", self.process_noise_autocorrelation[3]),
            ("rotational_noise", self.process_noise_autocorrelation[4]),
            ("rotational_noise", self.process_noise_autocorrelation[5]),
            ("beacon_process_noise", self.beacon_process_noise),
            (
                "measurement_variance_scale_factor",
                self.measurement_variance_scale_factor,
            ),
        ];
        for (name, value) in named {
            if !value.is_finite() || value < 0.0 {
                return Err(BuildError::InvalidParameter { name, value });
            }
        }
        Ok(())
    }
}

/// One camera frame as the tracker sees it.
#[derive(Clone, Copy, Debug)]
pub struct FrameData<'a> {
    pub timestamp: Timestamp,
    pub blobs: &'a [Blob],
    pub camera: &'a CameraParameters,
}

impl<'a> FrameData<'a> {
    pub fn from_record(record: &'a MeasurementRecord, camera: &'a CameraParameters) -> Self {
        Self {
            timestamp: record.timestamp,
            blobs: &record.blobs,
            camera,
        }
    }
}

/// Single-frame pose from RANSAC PnP, no temporal filtering.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RansacPose {
    pub position: Vector3<f64>,
    pub rotation: UnitQuaternion<f64>,
}

pub trait TrackedTarget {
    fn pose_estimate(&self) -> Option<Pose>;

    fn has_pose_estimate(&self) -> bool {
        self.pose_estimate().is_some()
    }

    /// Pose from the target's current correspondences alone.
    fn estimate_pose_ransac(&self, camera: &CameraParameters) -> Option<RansacPose>;
}

pub trait TrackedBody {
    fn target(&self, id: TargetId) -> Option<&dyn TrackedTarget>;
}

pub trait TrackingSystem {
    /// Feed one frame, returning the bodies that received measurements.
    fn update_from_frame(&mut self, frame: FrameData<'_>) -> Vec<BodyId>;

    fn body(&self, id: BodyId) -> Option<&dyn TrackedBody>;

    fn target(&self, body: BodyId, target: TargetId) -> Option<&dyn TrackedTarget> {
        self.body(body)?.target(target)
    }
}

/// Builds fresh tracking systems for a given noise model.
pub trait TrackingSystemFactory {
    type System: TrackingSystem;

    fn build(&self, params: &TrackerParams) -> Result<Self::System, BuildError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_params_from_vec_layout() {
        let params = TrackerParams::from_vec(&ParamVec::new(1.0, 2.0, 3.0, 4.0));
        assert_eq!(
            params.process_noise_autocorrelation,
            [1.0, 1.0, 1.0, 2.0, 2.0, 2.0]
        );
        assert_eq!(params.beacon_process_noise, 3.0);
        assert_eq!(params.measurement_variance_scale_factor, 4.0);
    }

    #[test]
    fn test_params_validate() {
        assert!(TrackerParams::default().validate().is_ok());

        let negative = TrackerParams::from_vec(&ParamVec::new(1.0, -2.0, 0.0, 1.0));
        assert_eq!(
            negative.validate(),
            Err(BuildError::InvalidParameter {
                name: "rotational_noise",
                value: -2.0
            })
        );

        let nan = TrackerParams::from_vec(&ParamVec::new(1.0, 1.0, 0.0, f64::NAN));
        assert!(nan.validate().is_err());
    }
}
