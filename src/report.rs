//! Comparison scoring
//!
//! Observes the paired frames the comparison driver emits and scores each
//! runner against the recorded ground truth. Nothing here feeds back into
//! the runners.

use chrono::Utc;
use serde::Serialize;
use serde_json::json;

use crate::comparison::{ComparisonFrame, RunnerNames};
use crate::runners::FrameOutput;
use crate::types::{MeasurementRecord, Pose};

/// One runner's pose on one frame, with its error against ground truth.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PoseReport {
    pub position: [f64; 3],
    /// w, x, y, z
    pub rotation: [f64; 4],
    pub position_error_m: f64,
    pub rotation_error_deg: f64,
}

impl PoseReport {
    fn new(pose: &Pose, record: &MeasurementRecord) -> Self {
        let t = pose.translation.vector;
        let q = pose.rotation.quaternion();
        Self {
            position: [t.x, t.y, t.z],
            rotation: [q.w, q.i, q.j, q.k],
            position_error_m: (t - record.ground_truth_position).norm(),
            rotation_error_deg: pose
                .rotation
                .angle_to(&record.ground_truth_rotation)
                .to_degrees(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct FrameReport {
    pub index: usize,
    pub timestamp: f64,
    pub blobs: usize,
    pub primary: Option<PoseReport>,
    pub secondary: Option<PoseReport>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RunnerSummary {
    pub name: &'static str,
    pub frames: usize,
    pub frames_with_pose: usize,
    pub availability: f64,
    /// Error statistics are `None` when the runner never produced a pose.
    pub mean_position_error_m: Option<f64>,
    pub rms_position_error_m: Option<f64>,
    pub max_position_error_m: Option<f64>,
    pub mean_rotation_error_deg: Option<f64>,
}

#[derive(Default)]
struct ErrorAccumulator {
    frames: usize,
    with_pose: usize,
    position_sum: f64,
    position_sq_sum: f64,
    position_max: f64,
    rotation_sum: f64,
}

impl ErrorAccumulator {
    fn add(&mut self, pose: Option<&PoseReport>) {
        self.frames += 1;
        let Some(pose) = pose else {
            return;
        };
        self.with_pose += 1;
        self.position_sum += pose.position_error_m;
        self.position_sq_sum += pose.position_error_m * pose.position_error_m;
        self.position_max = self.position_max.max(pose.position_error_m);
        self.rotation_sum += pose.rotation_error_deg;
    }

    fn summary(&self, name: &'static str) -> RunnerSummary {
        let n = self.with_pose as f64;
        let stat = |value: f64| (self.with_pose > 0).then_some(value);
        RunnerSummary {
            name,
            frames: self.frames,
            frames_with_pose: self.with_pose,
            availability: if self.frames > 0 {
                n / self.frames as f64
            } else {
                0.0
            },
            mean_position_error_m: stat(self.position_sum / n),
            rms_position_error_m: stat((self.position_sq_sum / n).sqrt()),
            max_position_error_m: stat(self.position_max),
            mean_rotation_error_deg: stat(self.rotation_sum / n),
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct ComparisonReport {
    /// RFC 3339, UTC
    pub generated_at: String,
    pub primary: RunnerSummary,
    pub secondary: RunnerSummary,
    pub frames: Vec<FrameReport>,
}

impl ComparisonReport {
    /// Score `frames` against the records they were produced from.
    pub fn build(
        names: RunnerNames,
        records: &[MeasurementRecord],
        frames: &[ComparisonFrame],
    ) -> Self {
        let mut primary = ErrorAccumulator::default();
        let mut secondary = ErrorAccumulator::default();
        let mut reports = Vec::with_capacity(frames.len());

        for frame in frames {
            let Some(record) = records.get(frame.index) else {
                continue;
            };
            let report = FrameReport {
                index: frame.index,
                timestamp: frame.timestamp.as_secs_f64(),
                blobs: record.blobs.len(),
                primary: score(&frame.primary, record),
                secondary: score(&frame.secondary, record),
            };
            primary.add(report.primary.as_ref());
            secondary.add(report.secondary.as_ref());
            reports.push(report);
        }

        Self {
            generated_at: Utc::now().to_rfc3339(),
            primary: primary.summary(names.primary),
            secondary: secondary.summary(names.secondary),
            frames: reports,
        }
    }

    /// Headline numbers without the per-frame list.
    pub fn summary_json(&self) -> serde_json::Value {
        json!({
            "generated_at": self.generated_at,
            "frames": self.frames.len(),
            "runners": [self.primary, self.secondary],
        })
    }
}

fn score(output: &FrameOutput, record: &MeasurementRecord) -> Option<PoseReport> {
    output.pose.as_ref().map(|pose| PoseReport::new(pose, record))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::{pose_at, record_at};
    use crate::types::Timestamp;
    use approx::assert_relative_eq;
    use nalgebra::Vector3;

    const NAMES: RunnerNames = RunnerNames {
        primary: "a",
        secondary: "b",
    };

    fn frame(index: usize, primary: Option<Pose>, secondary: Option<Pose>) -> ComparisonFrame {
        ComparisonFrame {
            index,
            timestamp: Timestamp::new(index as i64, 0),
            primary: FrameOutput { pose: primary },
            secondary: FrameOutput { pose: secondary },
        }
    }

    #[test]
    fn test_summary_statistics() {
        let records: Vec<MeasurementRecord> = (0..3)
            .map(|k| record_at(k, 0, Vector3::new(0.0, 0.0, 1.0)))
            .collect();
        let frames = vec![
            frame(0, Some(pose_at(0.3, 0.0, 1.0)), None),
            frame(1, Some(pose_at(0.0, 0.4, 1.0)), None),
            frame(2, None, Some(pose_at(0.0, 0.0, 1.0))),
        ];

        let report = ComparisonReport::build(NAMES, &records, &frames);

        assert_eq!(report.frames.len(), 3);
        assert_eq!(report.primary.frames_with_pose, 2);
        assert_relative_eq!(report.primary.availability, 2.0 / 3.0);
        assert_relative_eq!(report.primary.mean_position_error_m.unwrap(), 0.35, epsilon = 1e-12);
        assert_relative_eq!(
            report.primary.rms_position_error_m.unwrap(),
            (0.125f64).sqrt(),
            epsilon = 1e-12
        );
        assert_relative_eq!(report.primary.max_position_error_m.unwrap(), 0.4, epsilon = 1e-12);
        assert_relative_eq!(report.primary.mean_rotation_error_deg.unwrap(), 0.0);

        assert_eq!(report.secondary.frames_with_pose, 1);
        assert_relative_eq!(report.secondary.mean_position_error_m.unwrap(), 0.0);
    }

    #[test]
    fn test_runner_without_poses_has_no_error_stats() {
        let records = vec![record_at(0, 0, Vector3::zeros())];
        let report = ComparisonReport::build(NAMES, &records, &[frame(0, None, None)]);
        assert_eq!(report.primary.frames, 1);
        assert_eq!(report.primary.availability, 0.0);
        assert!(report.primary.mean_position_error_m.is_none());
        assert!(report.secondary.max_position_error_m.is_none());
    }

    #[test]
    fn test_rotation_error_in_degrees() {
        let records = vec![record_at(0, 0, Vector3::zeros())];
        let rotated = Pose::from_parts(
            nalgebra::Translation3::identity(),
            nalgebra::UnitQuaternion::from_axis_angle(&Vector3::y_axis(), 10f64.to_radians()),
        );
        let report = ComparisonReport::build(NAMES, &records, &[frame(0, Some(rotated), None)]);
        let pose = report.frames[0].primary.as_ref().unwrap();
        assert_relative_eq!(pose.rotation_error_deg, 10.0, epsilon = 1e-9);
    }

    #[test]
    fn test_summary_json_shape() {
        let records = vec![record_at(0, 0, Vector3::zeros())];
        let report = ComparisonReport::build(NAMES, &records, &[frame(0, None, None)]);
        let value = report.summary_json();
        assert_eq!(value["frames"], 1);
        assert_eq!(value["runners"][0]["name"], "a");
        assert_eq!(value["runners"][1]["name"], "b");
        assert!(value["runners"][0]["mean_position_error_m"].is_null());
        assert!(value.get("generated_at").is_some());
    }
}
