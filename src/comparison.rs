use log::debug;
use serde::Serialize;

use crate::runners::{AlgorithmRunner, FrameOutput};
use crate::tracking::{CameraParameters, TrackingSystem};
use crate::types::{MeasurementRecord, Timestamp};

/// Both runners' outputs for one record.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ComparisonFrame {
    pub index: usize,
    pub timestamp: Timestamp,
    pub primary: FrameOutput,
    pub secondary: FrameOutput,
}

/// Runner names in step order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct RunnerNames {
    pub primary: &'static str,
    pub secondary: &'static str,
}

/// Drives two runners over one record sequence in lockstep.
///
/// The primary runner always steps first on a record, so a secondary that
/// only reads the shared system sees it already advanced for that frame.
pub struct ComparisonDriver<S, A, B> {
    system: S,
    camera: CameraParameters,
    primary: A,
    secondary: B,
}

impl<S, A, B> ComparisonDriver<S, A, B>
where
    S: TrackingSystem,
    A: AlgorithmRunner,
    B: AlgorithmRunner,
{
    pub fn new(system: S, camera: CameraParameters, primary: A, secondary: B) -> Self {
        Self {
            system,
            camera,
            primary,
            secondary,
        }
    }

    pub fn names(&self) -> RunnerNames {
        RunnerNames {
            primary: self.primary.name(),
            secondary: self.secondary.name(),
        }
    }

    pub fn step(&mut self, index: usize, record: &MeasurementRecord) -> ComparisonFrame {
        let primary = self.primary.step(&mut self.system, &self.camera, record);
        let secondary = self.secondary.step(&mut self.system, &self.camera, record);
        debug!(
            "[compare] frame {} t={:.6} {}={} {}={}",
            index,
            record.timestamp.as_secs_f64(),
            self.primary.name(),
            describe(&primary),
            self.secondary.name(),
            describe(&secondary),
        );
        ComparisonFrame {
            index,
            timestamp: record.timestamp,
            primary,
            secondary,
        }
    }

    /// One step per record, in order.
    pub fn run(&mut self, records: &[MeasurementRecord]) -> Vec<ComparisonFrame> {
        records
            .iter()
            .enumerate()
            .map(|(index, record)| self.step(index, record))
            .collect()
    }

    pub fn into_parts(self) -> (S, A, B) {
        (self.system, self.primary, self.secondary)
    }
}

fn describe(output: &FrameOutput) -> String {
    match &output.pose {
        Some(pose) => {
            let t = pose.translation.vector;
            format!("({:.4}, {:.4}, {:.4})", t.x, t.y, t.z)
        }
        None => "none".to_string(),
    }
}
