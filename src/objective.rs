use log::{debug, warn};
use nalgebra::DVector;
use serde::Serialize;

use crate::config::CostConfig;
use crate::error::OptimizerError;
use crate::optimizer::{OptimizerConfig, Termination, TrustRegionOptimizer};
use crate::runners::{AlgorithmRunner, FullTracker};
use crate::tracking::{CameraParameters, TrackerParams, TrackingSystemFactory};
use crate::types::{MeasurementRecord, ParamVec, Pose, PARAM_DIM};

/// Scores one replayed frame against its ground truth.
pub trait CostMetric {
    /// `estimate` is `None` when the tracker had no pose for the frame.
    fn frame_cost(&self, record: &MeasurementRecord, estimate: Option<&Pose>) -> f64;
}

/// Squared position error plus squared weighted rotation angle.
#[derive(Clone, Debug, PartialEq)]
pub struct PoseErrorCost {
    pub rotation_weight: f64,
    pub missing_pose_penalty: f64,
}

impl From<&CostConfig> for PoseErrorCost {
    fn from(config: &CostConfig) -> Self {
        Self {
            rotation_weight: config.rotation_weight,
            missing_pose_penalty: config.missing_pose_penalty,
        }
    }
}

impl Default for PoseErrorCost {
    fn default() -> Self {
        Self::from(&CostConfig::default())
    }
}

impl CostMetric for PoseErrorCost {
    fn frame_cost(&self, record: &MeasurementRecord, estimate: Option<&Pose>) -> f64 {
        let Some(pose) = estimate else {
            return self.missing_pose_penalty;
        };
        let position_error = (pose.translation.vector - record.ground_truth_position).norm_squared();
        let angle = pose.rotation.angle_to(&record.ground_truth_rotation) * self.rotation_weight;
        position_error + angle * angle
    }
}

/// Replays the whole sequence through a fresh tracker per candidate.
pub struct ObjectiveEvaluator<'a, F, M> {
    factory: &'a F,
    records: &'a [MeasurementRecord],
    camera: CameraParameters,
    metric: M,
    invalid_penalty: f64,
}

impl<'a, F, M> ObjectiveEvaluator<'a, F, M>
where
    F: TrackingSystemFactory,
    M: CostMetric,
{
    pub fn new(
        factory: &'a F,
        records: &'a [MeasurementRecord],
        camera: CameraParameters,
        metric: M,
    ) -> Self {
        Self {
            factory,
            records,
            camera,
            metric,
            invalid_penalty: CostConfig::default().invalid_parameter_penalty,
        }
    }

    pub fn with_invalid_penalty(mut self, penalty: f64) -> Self {
        self.invalid_penalty = penalty;
        self
    }

    pub fn invalid_penalty(&self) -> f64 {
        self.invalid_penalty
    }

    /// Mean frame cost for `candidate`; invalid candidates, failed builds and
    /// non-finite results all cost the fixed penalty.
    pub fn evaluate(&self, candidate: &ParamVec) -> f64 {
        if let Some(value) = candidate.iter().find(|v| !v.is_finite() || **v < 0.0) {
            debug!("[objective] rejecting parameter {} in {:?}", value, candidate.as_slice());
            return self.invalid_penalty;
        }

        let params = TrackerParams::from_vec(candidate);
        let mut system = match self.factory.build(&params) {
            Ok(system) => system,
            Err(e) => {
                warn!("[objective] could not build tracking system: {}", e);
                return self.invalid_penalty;
            }
        };

        let mut runner = FullTracker::new();
        let mut total = 0.0;
        for record in self.records {
            let output = runner.step(&mut system, &self.camera, record);
            total += self.metric.frame_cost(record, output.pose.as_ref());
        }
        let cost = if self.records.is_empty() {
            0.0
        } else {
            total / self.records.len() as f64
        };

        if cost.is_finite() {
            cost
        } else {
            self.invalid_penalty
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct CalibrationOutcome {
    pub parameters: [f64; PARAM_DIM],
    pub cost: f64,
    pub evaluations: usize,
    pub termination: Termination,
}

/// Tune the noise parameters by minimizing the evaluator's cost.
pub fn calibrate<F, M>(
    evaluator: &ObjectiveEvaluator<'_, F, M>,
    initial: &ParamVec,
    config: &OptimizerConfig,
) -> Result<CalibrationOutcome, OptimizerError>
where
    F: TrackingSystemFactory,
    M: CostMetric,
{
    let x0 = DVector::from_column_slice(initial.as_slice());
    let result = TrustRegionOptimizer::new(config.clone()).minimize(&x0, |x| {
        evaluator.evaluate(&ParamVec::from_column_slice(x.as_slice()))
    })?;

    let mut parameters = [0.0; PARAM_DIM];
    parameters.copy_from_slice(result.parameters.as_slice());
    Ok(CalibrationOutcome {
        parameters,
        cost: result.cost,
        evaluations: result.evaluations,
        termination: result.termination,
    })
}
