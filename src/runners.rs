use log::debug;

use crate::smoothing::{PoseSmoother, SmootherConfig};
use crate::tracking::{BodyId, CameraParameters, FrameData, TargetId, TrackingSystem};
use crate::types::{MeasurementRecord, Pose, Timestamp};

/// Per-frame outcome of a pose pipeline.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct FrameOutput {
    pub pose: Option<Pose>,
}

impl FrameOutput {
    pub fn none() -> Self {
        Self { pose: None }
    }

    pub fn has_pose(&self) -> bool {
        self.pose.is_some()
    }
}

/// One pose pipeline driven a record at a time.
pub trait AlgorithmRunner {
    fn name(&self) -> &'static str;

    fn step(
        &mut self,
        system: &mut dyn TrackingSystem,
        camera: &CameraParameters,
        record: &MeasurementRecord,
    ) -> FrameOutput;
}

/// Feeds every frame into the tracker and reports its filtered pose.
#[derive(Clone, Debug)]
pub struct FullTracker {
    body: BodyId,
    target: TargetId,
}

impl Default for FullTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl FullTracker {
    pub fn new() -> Self {
        Self {
            body: BodyId::PRIMARY,
            target: TargetId::PRIMARY,
        }
    }
}

impl AlgorithmRunner for FullTracker {
    fn name(&self) -> &'static str {
        "full_tracker"
    }

    fn step(
        &mut self,
        system: &mut dyn TrackingSystem,
        camera: &CameraParameters,
        record: &MeasurementRecord,
    ) -> FrameOutput {
        system.update_from_frame(FrameData::from_record(record, camera));
        let pose = system
            .target(self.body, self.target)
            .filter(|target| target.has_pose_estimate())
            .and_then(|target| target.pose_estimate());
        FrameOutput { pose }
    }
}

/// Single-frame RANSAC pose passed through a one-euro smoother.
///
/// Reads the target's current correspondences without advancing the
/// tracker, so another runner must have updated the system for this frame.
#[derive(Clone, Debug)]
pub struct RansacSmoothed {
    body: BodyId,
    target: TargetId,
    smoother: PoseSmoother,
    last_success: Option<Timestamp>,
    last_dt: Option<f64>,
}

impl Default for RansacSmoothed {
    fn default() -> Self {
        Self::new(&SmootherConfig::default())
    }
}

impl RansacSmoothed {
    pub fn new(config: &SmootherConfig) -> Self {
        Self {
            body: BodyId::PRIMARY,
            target: TargetId::PRIMARY,
            smoother: PoseSmoother::new(config),
            last_success: None,
            last_dt: None,
        }
    }

    /// Step used on the most recent successful frame.
    pub fn last_dt(&self) -> Option<f64> {
        self.last_dt
    }
}

impl AlgorithmRunner for RansacSmoothed {
    fn name(&self) -> &'static str {
        "ransac_smoothed"
    }

    fn step(
        &mut self,
        system: &mut dyn TrackingSystem,
        camera: &CameraParameters,
        record: &MeasurementRecord,
    ) -> FrameOutput {
        let Some(estimate) = system
            .target(self.body, self.target)
            .and_then(|target| target.estimate_pose_ransac(camera))
        else {
            return FrameOutput::none();
        };

        // First success has no predecessor and uses a one second step
        let dt = match self.last_success {
            Some(previous) => record.timestamp.seconds_since(&previous),
            None => 1.0,
        };
        self.last_success = Some(record.timestamp);
        self.last_dt = Some(dt);

        self.smoother
            .filter(dt, &estimate.position, &estimate.rotation);
        let position = self.smoother.position();
        debug!(
            "[ransac] smoothed position {:.4} {:.4} {:.4}",
            position.x, position.y, position.z
        );
        FrameOutput {
            pose: Some(self.smoother.pose()),
        }
    }
}
