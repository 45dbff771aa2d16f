use std::cell::Cell;

use nalgebra::{Point3, Translation3, UnitQuaternion, Vector3};

use crate::error::BuildError;
use crate::tracking::{
    BeaconTrackerConfig, BodyId, CameraParameters, FrameData, RansacPose, TargetId, TrackedBody,
    TrackedTarget, TrackerParams, TrackingSystem, TrackingSystemFactory,
};
use crate::types::{Blob, MeasurementRecord, Pose, Timestamp};

/// Frame spacing of the synthetic scene [s]
pub(crate) const SCENE_DT: f64 = 0.033_333;

pub(crate) fn pose_at(x: f64, y: f64, z: f64) -> Pose {
    Pose::from_parts(Translation3::new(x, y, z), UnitQuaternion::identity())
}

/// Record with identity ground truth at the origin.
pub(crate) fn record(seconds: i64, microseconds: i64, blobs: Vec<Blob>) -> MeasurementRecord {
    MeasurementRecord {
        timestamp: Timestamp::new(seconds, microseconds),
        ground_truth_position: Vector3::zeros(),
        ground_truth_rotation: UnitQuaternion::identity(),
        blobs,
    }
}

/// Record whose ground truth sits at `position`.
pub(crate) fn record_at(seconds: i64, microseconds: i64, position: Vector3<f64>) -> MeasurementRecord {
    MeasurementRecord {
        ground_truth_position: position,
        ..record(seconds, microseconds, Vec::new())
    }
}

pub(crate) fn beacon_layout() -> Vec<[f64; 3]> {
    BeaconTrackerConfig::default().beacons
}

/// Slow wobble around the default acquisition pose.
pub(crate) fn scene_pose(t: f64) -> Pose {
    let translation = Translation3::new(
        0.02 * (0.5 * t).sin(),
        0.015 * (0.5 * t).cos() - 0.015,
        0.5 + 0.02 * (0.3 * t).sin(),
    );
    let rotation = UnitQuaternion::from_euler_angles(
        0.1 * (0.4 * t).sin(),
        0.1 * (0.4 * t).cos() - 0.1,
        0.2 * (0.2 * t).sin(),
    );
    Pose::from_parts(translation, rotation)
}

pub(crate) fn project_blobs(pose: &Pose, camera: &CameraParameters) -> Vec<Blob> {
    beacon_layout()
        .iter()
        .filter_map(|b| {
            let p_cam = pose.transform_point(&Point3::from(Vector3::from(*b))).coords;
            camera
                .project(&p_cam)
                .map(|px| Blob::new(px.x, px.y, 4.0, camera.image_size))
        })
        .collect()
}

/// Frame `k` of the synthetic scene, noiseless blobs and exact ground truth.
pub(crate) fn scene_record(k: usize, camera: &CameraParameters) -> MeasurementRecord {
    let t = k as f64 * SCENE_DT;
    let total_us = k as i64 * 33_333;
    let pose = scene_pose(t);
    MeasurementRecord {
        timestamp: Timestamp::new(100 + total_us / 1_000_000, total_us % 1_000_000),
        ground_truth_position: pose.translation.vector,
        ground_truth_rotation: pose.rotation,
        blobs: project_blobs(&pose, camera),
    }
}

/// What the scripted target reports after one update.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub(crate) struct ScriptedFrame {
    pub pose: Option<Pose>,
    pub ransac: Option<RansacPose>,
}

impl ScriptedFrame {
    pub fn tracked(pose: Pose) -> Self {
        Self {
            pose: Some(pose),
            ransac: None,
        }
    }

    pub fn ransac(position: Vector3<f64>) -> Self {
        Self {
            pose: None,
            ransac: Some(RansacPose {
                position,
                rotation: UnitQuaternion::identity(),
            }),
        }
    }
}

pub(crate) struct ScriptedTarget {
    current: ScriptedFrame,
    ransac_queries: Cell<usize>,
}

impl TrackedTarget for ScriptedTarget {
    fn pose_estimate(&self) -> Option<Pose> {
        self.current.pose
    }

    fn estimate_pose_ransac(&self, _camera: &CameraParameters) -> Option<RansacPose> {
        self.ransac_queries.set(self.ransac_queries.get() + 1);
        self.current.ransac
    }
}

pub(crate) struct ScriptedBody {
    target: ScriptedTarget,
}

impl TrackedBody for ScriptedBody {
    fn target(&self, id: TargetId) -> Option<&dyn TrackedTarget> {
        (id == TargetId::PRIMARY).then_some(&self.target as &dyn TrackedTarget)
    }
}

/// Tracking system double that replays a per-update script.
pub(crate) struct ScriptedSystem {
    script: Vec<ScriptedFrame>,
    body: ScriptedBody,
    pub updates: usize,
    pub seen: Vec<Timestamp>,
}

impl ScriptedSystem {
    pub fn new(script: Vec<ScriptedFrame>) -> Self {
        Self {
            script,
            body: ScriptedBody {
                target: ScriptedTarget {
                    current: ScriptedFrame::default(),
                    ransac_queries: Cell::new(0),
                },
            },
            updates: 0,
            seen: Vec::new(),
        }
    }

    pub fn ransac_queries(&self) -> usize {
        self.body.target.ransac_queries.get()
    }
}

impl TrackingSystem for ScriptedSystem {
    fn update_from_frame(&mut self, frame: FrameData<'_>) -> Vec<BodyId> {
        let index = self.updates;
        self.updates += 1;
        self.seen.push(frame.timestamp);
        self.body.target.current = self.script.get(index).copied().unwrap_or_default();
        if self.body.target.current.pose.is_some() {
            vec![BodyId::PRIMARY]
        } else {
            Vec::new()
        }
    }

    fn body(&self, id: BodyId) -> Option<&dyn TrackedBody> {
        (id == BodyId::PRIMARY).then_some(&self.body as &dyn TrackedBody)
    }
}

type ScriptFn = Box<dyn Fn(&TrackerParams) -> Result<Vec<ScriptedFrame>, BuildError>>;

/// Factory double: the script is derived from the requested parameters.
pub(crate) struct ScriptedFactory {
    script: ScriptFn,
    builds: Cell<usize>,
}

impl ScriptedFactory {
    pub fn new(
        script: impl Fn(&TrackerParams) -> Result<Vec<ScriptedFrame>, BuildError> + 'static,
    ) -> Self {
        Self {
            script: Box::new(script),
            builds: Cell::new(0),
        }
    }

    pub fn builds(&self) -> usize {
        self.builds.get()
    }
}

impl TrackingSystemFactory for ScriptedFactory {
    type System = ScriptedSystem;

    fn build(&self, params: &TrackerParams) -> Result<Self::System, BuildError> {
        self.builds.set(self.builds.get() + 1);
        Ok(ScriptedSystem::new((self.script)(params)?))
    }
}
