use log::debug;
use nalgebra::{Point3, Quaternion, Translation3, UnitQuaternion, Vector2, Vector3};
use serde::{Deserialize, Serialize};

use super::camera::CameraParameters;
use super::pnp::{self, Correspondence, PnpSolution, RansacConfig, MIN_SAMPLE};
use super::{
    BodyId, FrameData, RansacPose, TargetId, TrackedBody, TrackedTarget, TrackerParams,
    TrackingSystem, TrackingSystemFactory,
};
use crate::error::BuildError;
use crate::filters::PoseEkf;
use crate::types::{Blob, Pose, PoseMeasNoise, Timestamp};

/// Cross-shaped LED plate, 14 cm across, two layers 3 cm apart [m]
const DEFAULT_BEACONS: [[f64; 3]; 8] = [
    [0.05, 0.05, 0.0],
    [-0.05, 0.05, 0.0],
    [-0.05, -0.05, 0.0],
    [0.05, -0.05, 0.0],
    [0.0, 0.07, 0.03],
    [0.07, 0.0, 0.03],
    [0.0, -0.07, 0.03],
    [-0.07, 0.0, 0.03],
];

const MIN_NOISE: f64 = 1e-12;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BeaconTrackerConfig {
    /// Beacon positions in the body frame [m]
    pub beacons: Vec<[f64; 3]>,
    /// Where the body is assumed to be while not tracking [m]
    pub acquisition_position: [f64; 3],
    /// Orientation assumed while not tracking (w, x, y, z)
    pub acquisition_rotation: [f64; 4],
    /// Blob-to-projection match radius while tracking [px]
    pub association_gate_px: f64,
    /// Match radius around the acquisition pose [px]
    pub acquisition_gate_px: f64,
    /// Per-axis blob center variance before scaling [px²]
    pub base_pixel_variance: f64,
    /// Frames without a measurement update before the estimate is dropped
    pub max_coast_frames: u32,
    pub initial_velocity_variance: f64,
    pub initial_angular_velocity_variance: f64,
    pub ransac: RansacConfig,
}

impl Default for BeaconTrackerConfig {
    fn default() -> Self {
        Self {
            beacons: DEFAULT_BEACONS.to_vec(),
            acquisition_position: [0.0, 0.0, 0.5],
            acquisition_rotation: [1.0, 0.0, 0.0, 0.0],
            association_gate_px: 25.0,
            acquisition_gate_px: 60.0,
            base_pixel_variance: 1.0,
            max_coast_frames: 5,
            initial_velocity_variance: 0.1,
            initial_angular_velocity_variance: 1.0,
            ransac: RansacConfig::default(),
        }
    }
}

impl BeaconTrackerConfig {
    pub fn acquisition_pose(&self) -> Result<Pose, BuildError> {
        let [w, x, y, z] = self.acquisition_rotation;
        let quaternion = Quaternion::new(w, x, y, z);
        let norm = quaternion.norm();
        let rotation = UnitQuaternion::try_new(quaternion, 1e-9).ok_or(
            BuildError::InvalidParameter {
                name: "acquisition_rotation",
                value: norm,
            },
        )?;
        let position = Vector3::from(self.acquisition_position);
        if !position.iter().all(|v| v.is_finite()) {
            return Err(BuildError::InvalidParameter {
                name: "acquisition_position",
                value: position.norm(),
            });
        }
        Ok(Pose::from_parts(Translation3::from(position), rotation))
    }

    fn validate(&self) -> Result<(), BuildError> {
        if self.beacons.len() < MIN_SAMPLE {
            return Err(BuildError::TooFewBeacons {
                required: MIN_SAMPLE,
                actual: self.beacons.len(),
            });
        }
        for beacon in &self.beacons {
            if let Some(value) = beacon.iter().find(|v| !v.is_finite()) {
                return Err(BuildError::InvalidParameter {
                    name: "beacons",
                    value: *value,
                });
            }
        }
        for (name, value) in [
            ("association_gate_px", self.association_gate_px),
            ("acquisition_gate_px", self.acquisition_gate_px),
            ("base_pixel_variance", self.base_pixel_variance),
        ] {
            if !(value > 0.0) || !value.is_finite() {
                return Err(BuildError::InvalidParameter { name, value });
            }
        }
        Ok(())
    }
}

/// Match blobs to beacons projected under `reference`.
///
/// Pairs are claimed greedily in order of pixel distance, so each blob and
/// each beacon is used at most once. Output is ordered by blob index.
pub fn associate(
    beacons: &[Vector3<f64>],
    blobs: &[Blob],
    camera: &CameraParameters,
    reference: &Pose,
    gate_px: f64,
) -> Vec<Correspondence> {
    let projected: Vec<Option<Vector2<f64>>> = beacons
        .iter()
        .map(|b| camera.project(&reference.transform_point(&Point3::from(*b)).coords))
        .collect();

    let width = camera.image_size.width as f64;
    let height = camera.image_size.height as f64;
    let gate_sq = gate_px * gate_px;

    let mut candidates: Vec<(f64, usize, usize)> = Vec::new();
    for (blob_index, blob) in blobs.iter().enumerate() {
        // Blobs may be measured against a different resolution than the camera model
        let (u, v) = blob.normalized();
        let pixel = Vector2::new(u * width, v * height);
        for (beacon_index, projection) in projected.iter().enumerate() {
            let Some(projection) = projection else {
                continue;
            };
            let dist_sq = (projection - pixel).norm_squared();
            if dist_sq <= gate_sq {
                candidates.push((dist_sq, blob_index, beacon_index));
            }
        }
    }
    candidates.sort_by(|a, b| {
        a.0.total_cmp(&b.0)
            .then(a.1.cmp(&b.1))
            .then(a.2.cmp(&b.2))
    });

    let mut blob_claimed = vec![false; blobs.len()];
    let mut beacon_claimed = vec![false; beacons.len()];
    let mut matched = Vec::new();
    for (_, blob_index, beacon_index) in candidates {
        if blob_claimed[blob_index] || beacon_claimed[beacon_index] {
            continue;
        }
        blob_claimed[blob_index] = true;
        beacon_claimed[beacon_index] = true;
        let (u, v) = blobs[blob_index].normalized();
        matched.push(Correspondence {
            beacon: beacons[beacon_index],
            pixel: Vector2::new(u * width, v * height),
            beacon_index,
            blob_index,
        });
    }
    matched.sort_by_key(|c| c.blob_index);
    matched
}

/// The single rigid target carried by the tracked body.
pub struct BeaconTarget {
    beacons: Vec<Vector3<f64>>,
    config: BeaconTrackerConfig,
    acquisition_pose: Pose,
    pixel_variance: f64,
    beacon_noise: f64,
    filter: PoseEkf,
    tracking: bool,
    last_timestamp: Option<Timestamp>,
    frames_since_update: u32,
    reference_pose: Pose,
    correspondences: Vec<Correspondence>,
}

impl BeaconTarget {
    fn new(config: &BeaconTrackerConfig, params: &TrackerParams) -> Result<Self, BuildError> {
        let acquisition_pose = config.acquisition_pose()?;
        Ok(Self {
            beacons: config.beacons.iter().map(|b| Vector3::from(*b)).collect(),
            config: config.clone(),
            acquisition_pose,
            pixel_variance: params.measurement_variance_scale_factor * config.base_pixel_variance,
            beacon_noise: params.beacon_process_noise,
            filter: PoseEkf::new(params.positional_noise(), params.rotational_noise()),
            tracking: false,
            last_timestamp: None,
            frames_since_update: 0,
            reference_pose: acquisition_pose,
            correspondences: Vec::new(),
        })
    }

    /// Returns true when the frame produced a measurement update.
    fn process_frame(&mut self, frame: &FrameData<'_>) -> bool {
        let dt = self
            .last_timestamp
            .map(|previous| frame.timestamp.seconds_since(&previous));
        self.last_timestamp = Some(frame.timestamp);
        if let Some(dt) = dt {
            if self.tracking {
                self.filter.predict(dt);
            }
        }

        let gate = if self.tracking {
            self.reference_pose = self.filter.pose();
            self.config.association_gate_px
        } else {
            self.reference_pose = self.acquisition_pose;
            self.config.acquisition_gate_px
        };
        self.correspondences = associate(
            &self.beacons,
            frame.blobs,
            frame.camera,
            &self.reference_pose,
            gate,
        );

        match self.solve(frame.camera) {
            Some(solution) if self.apply(&solution) => {
                self.tracking = true;
                self.frames_since_update = 0;
                true
            }
            _ => {
                self.coast();
                false
            }
        }
    }

    fn solve(&self, camera: &CameraParameters) -> Option<PnpSolution> {
        pnp::solve_pnp_ransac(
            &self.correspondences,
            camera,
            &self.reference_pose,
            &self.config.ransac,
        )
        .ok()
    }

    fn apply(&mut self, solution: &PnpSolution) -> bool {
        let Some(covariance) = solution.covariance(self.pixel_variance) else {
            return false;
        };
        let mut noise: PoseMeasNoise = covariance;
        for k in 0..6 {
            noise[(k, k)] += MIN_NOISE;
        }
        for k in 3..6 {
            noise[(k, k)] += self.beacon_noise;
        }

        if self.filter.is_initialized() {
            self.filter.update_pose(&solution.pose, &noise)
        } else {
            self.filter.initialize(
                &solution.pose,
                &noise,
                self.config.initial_velocity_variance,
                self.config.initial_angular_velocity_variance,
            );
            debug!(
                "[beacon] acquired target with {} inliers, rms {:.3} px",
                solution.inliers.len(),
                solution.rms_px
            );
            true
        }
    }

    fn coast(&mut self) {
        self.frames_since_update = self.frames_since_update.saturating_add(1);
        if self.tracking && self.frames_since_update > self.config.max_coast_frames {
            debug!(
                "[beacon] lost target after {} frames without update",
                self.frames_since_update
            );
            self.tracking = false;
            self.filter.reset();
        }
    }

    pub fn correspondences(&self) -> &[Correspondence] {
        &self.correspondences
    }

    pub fn filter(&self) -> &PoseEkf {
        &self.filter
    }
}

impl TrackedTarget for BeaconTarget {
    fn pose_estimate(&self) -> Option<Pose> {
        self.tracking.then(|| self.filter.pose())
    }

    fn estimate_pose_ransac(&self, camera: &CameraParameters) -> Option<RansacPose> {
        self.solve(camera).map(|solution| RansacPose {
            position: solution.pose.translation.vector,
            rotation: solution.pose.rotation,
        })
    }
}

pub struct BeaconBody {
    target: BeaconTarget,
}

impl TrackedBody for BeaconBody {
    fn target(&self, id: TargetId) -> Option<&dyn TrackedTarget> {
        (id == TargetId::PRIMARY).then_some(&self.target as &dyn TrackedTarget)
    }
}

/// Single-body tracker for a rigid constellation of beacons.
pub struct BeaconTrackingSystem {
    body: BeaconBody,
    frames: u64,
}

impl BeaconTrackingSystem {
    pub fn new(config: &BeaconTrackerConfig, params: &TrackerParams) -> Result<Self, BuildError> {
        params.validate()?;
        config.validate()?;
        Ok(Self {
            body: BeaconBody {
                target: BeaconTarget::new(config, params)?,
            },
            frames: 0,
        })
    }

    pub fn frames_processed(&self) -> u64 {
        self.frames
    }

    pub fn primary_target(&self) -> &BeaconTarget {
        &self.body.target
    }
}

impl TrackingSystem for BeaconTrackingSystem {
    fn update_from_frame(&mut self, frame: FrameData<'_>) -> Vec<BodyId> {
        self.frames += 1;
        if self.body.target.process_frame(&frame) {
            vec![BodyId::PRIMARY]
        } else {
            Vec::new()
        }
    }

    fn body(&self, id: BodyId) -> Option<&dyn TrackedBody> {
        (id == BodyId::PRIMARY).then_some(&self.body as &dyn TrackedBody)
    }
}

pub struct BeaconTrackingSystemFactory {
    config: BeaconTrackerConfig,
}

impl BeaconTrackingSystemFactory {
    pub fn new(config: BeaconTrackerConfig) -> Self {
        Self { config }
    }
}

impl TrackingSystemFactory for BeaconTrackingSystemFactory {
    type System = BeaconTrackingSystem;

    fn build(&self, params: &TrackerParams) -> Result<Self::System, BuildError> {
        BeaconTrackingSystem::new(&self.config, params)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::{scene_pose, scene_record, SCENE_DT};
    use crate::types::ParamVec;

    fn build() -> BeaconTrackingSystem {
        BeaconTrackingSystemFactory::new(BeaconTrackerConfig::default())
            .build(&TrackerParams::default())
            .unwrap()
    }

    #[test]
    fn test_tracks_synthetic_scene() {
        let camera = CameraParameters::default();
        let mut system = build();

        for k in 0..60 {
            let record = scene_record(k, &camera);
            let updated = system.update_from_frame(FrameData::from_record(&record, &camera));
            assert_eq!(updated, vec![BodyId::PRIMARY], "frame {k} not updated");
        }

        let truth = scene_pose(59.0 * SCENE_DT);
        let target = system.target(BodyId::PRIMARY, TargetId::PRIMARY).unwrap();
        let estimate = target.pose_estimate().unwrap();
        assert!((estimate.translation.vector - truth.translation.vector).norm() < 1e-2);
        assert!(estimate.rotation.angle_to(&truth.rotation) < 0.05);
        assert_eq!(system.frames_processed(), 60);
        let state = system.primary_target().filter().get_state();
        assert_eq!(state.updates, 60);
        assert_eq!(state.predicts, 59);
    }

    #[test]
    fn test_ransac_estimate_uses_current_frame() {
        let camera = CameraParameters::default();
        let mut system = build();
        for k in 0..10 {
            let record = scene_record(k, &camera);
            system.update_from_frame(FrameData::from_record(&record, &camera));
        }

        assert!(system.primary_target().correspondences().len() >= MIN_SAMPLE);
        let truth = scene_pose(9.0 * SCENE_DT);
        let target = system.target(BodyId::PRIMARY, TargetId::PRIMARY).unwrap();
        let ransac = target.estimate_pose_ransac(&camera).unwrap();
        assert!((ransac.position - truth.translation.vector).norm() < 1e-6);
        assert!(ransac.rotation.angle_to(&truth.rotation) < 1e-6);
    }

    #[test]
    fn test_drops_estimate_after_coasting() {
        let camera = CameraParameters::default();
        let mut system = build();
        let record = scene_record(0, &camera);
        system.update_from_frame(FrameData::from_record(&record, &camera));
        assert!(system.primary_target().has_pose_estimate());

        let max_coast = BeaconTrackerConfig::default().max_coast_frames as i64;
        for k in 1..=max_coast {
            let mut empty = scene_record(k as usize, &camera);
            empty.blobs.clear();
            let updated = system.update_from_frame(FrameData::from_record(&empty, &camera));
            assert!(updated.is_empty());
            assert!(system.primary_target().has_pose_estimate());
        }

        let mut empty = scene_record(max_coast as usize + 1, &camera);
        empty.blobs.clear();
        system.update_from_frame(FrameData::from_record(&empty, &camera));
        assert!(!system.primary_target().has_pose_estimate());
        assert!(system
            .primary_target()
            .estimate_pose_ransac(&camera)
            .is_none());
    }

    #[test]
    fn test_associate_claims_each_blob_once() {
        let camera = CameraParameters::default();
        let pose = scene_pose(0.0);
        let record = scene_record(0, &camera);
        let beacons: Vec<Vector3<f64>> = BeaconTrackerConfig::default()
            .beacons
            .iter()
            .map(|b| Vector3::from(*b))
            .collect();

        let mut blobs = record.blobs.clone();
        blobs.push(blobs[0]);
        let matched = associate(&beacons, &blobs, &camera, &pose, 5.0);

        assert_eq!(matched.len(), beacons.len());
        let mut seen: Vec<usize> = matched.iter().map(|c| c.beacon_index).collect();
        seen.sort_unstable();
        seen.dedup();
        assert_eq!(seen.len(), beacons.len());
    }

    #[test]
    fn test_build_rejects_bad_input() {
        let factory = BeaconTrackingSystemFactory::new(BeaconTrackerConfig::default());
        let negative = TrackerParams::from_vec(&ParamVec::new(-1.0, 0.0, 0.0, 1.0));
        assert!(matches!(
            factory.build(&negative),
            Err(BuildError::InvalidParameter { .. })
        ));

        let sparse = BeaconTrackerConfig {
            beacons: vec![[0.0, 0.0, 0.0]; 3],
            ..BeaconTrackerConfig::default()
        };
        assert_eq!(
            BeaconTrackingSystemFactory::new(sparse)
                .build(&TrackerParams::default())
                .err(),
            Some(BuildError::TooFewBeacons {
                required: 4,
                actual: 3
            })
        );
    }
}
