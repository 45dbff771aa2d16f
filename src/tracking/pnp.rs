use nalgebra::{Point3, Translation3, UnitQuaternion, Vector2, Vector3};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::camera::CameraParameters;
use crate::types::{PnpMat, PnpVec, Pose, ReprojectionJacobian};

/// Points per RANSAC hypothesis.
pub const MIN_SAMPLE: usize = 4;

const LM_MAX_ITERATIONS: usize = 30;
const LM_MAX_DAMPING: f64 = 1e10;

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RansacConfig {
    pub max_iterations: usize,
    pub reprojection_threshold_px: f64,
    pub min_inliers: usize,
    pub seed: u64,
}

impl Default for RansacConfig {
    fn default() -> Self {
        Self {
            max_iterations: 50,
            reprojection_threshold_px: 4.0,
            min_inliers: 4,
            seed: 0x5EED_u64,
        }
    }
}

/// A blob paired with the beacon it was associated to.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Correspondence {
    /// Beacon position in the body frame [m]
    pub beacon: Vector3<f64>,
    /// Observed blob center [px]
    pub pixel: Vector2<f64>,
    pub beacon_index: usize,
    pub blob_index: usize,
}

#[derive(Clone, Debug)]
pub struct PnpSolution {
    pub pose: Pose,
    pub inliers: Vec<usize>,
    pub iterations: usize,
    pub rms_px: f64,
    /// Gauss-Newton normal matrix JᵀJ over the inliers, ordered [theta, t]
    pub information: PnpMat,
}

impl PnpSolution {
    /// Pose covariance for a given per-axis pixel variance.
    pub fn covariance(&self, pixel_variance: f64) -> Option<PnpMat> {
        self.information
            .try_inverse()
            .map(|inverse| inverse * pixel_variance)
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PnpError {
    #[error("pnp requires at least {required} points, got {actual}")]
    NotEnoughPoints { required: usize, actual: usize },

    #[error("pnp failed to find a valid pose")]
    NoSolution,
}

struct Refinement {
    pose: Pose,
    information: PnpMat,
    cost: f64,
}

/// Squared pixel distance between a correspondence and its reprojection,
/// `None` when the beacon lands behind the camera.
pub fn reprojection_error_sq(
    pose: &Pose,
    correspondence: &Correspondence,
    camera: &CameraParameters,
) -> Option<f64> {
    let p_cam = pose.transform_point(&Point3::from(correspondence.beacon)).coords;
    camera
        .project(&p_cam)
        .map(|pixel| (pixel - correspondence.pixel).norm_squared())
}

pub fn solve_pnp_ransac(
    correspondences: &[Correspondence],
    camera: &CameraParameters,
    seed_pose: &Pose,
    config: &RansacConfig,
) -> Result<PnpSolution, PnpError> {
    let total = correspondences.len();
    let required = config.min_inliers.max(MIN_SAMPLE);
    if total < required {
        return Err(PnpError::NotEnoughPoints {
            required,
            actual: total,
        });
    }

    let threshold_sq = config.reprojection_threshold_px * config.reprojection_threshold_px;
    let max_iterations = if total == MIN_SAMPLE {
        1
    } else {
        config.max_iterations.max(1)
    };

    let mut rng = ChaCha8Rng::seed_from_u64(config.seed);
    let mut best: Option<(Pose, Vec<usize>, f64)> = None;
    let mut iterations = 0usize;

    while iterations < max_iterations {
        iterations += 1;
        let sample = rand::seq::index::sample(&mut rng, total, MIN_SAMPLE).into_vec();
        let Some(fit) = refine(correspondences, &sample, camera, *seed_pose) else {
            continue;
        };

        let (inliers, error) = consensus(&fit.pose, correspondences, camera, threshold_sq);
        let better = match &best {
            None => true,
            Some((_, best_inliers, best_error)) => {
                inliers.len() > best_inliers.len()
                    || (inliers.len() == best_inliers.len() && error < *best_error)
            }
        };
        if better {
            let complete = inliers.len() == total;
            best = Some((fit.pose, inliers, error));
            if complete {
                break;
            }
        }
    }

    let (pose, inliers, _) = best.ok_or(PnpError::NoSolution)?;
    if inliers.len() < required {
        return Err(PnpError::NoSolution);
    }

    let refined = refine(correspondences, &inliers, camera, pose).ok_or(PnpError::NoSolution)?;
    let rms_px = (refined.cost / inliers.len() as f64).sqrt();

    Ok(PnpSolution {
        pose: refined.pose,
        inliers,
        iterations,
        rms_px,
        information: refined.information,
    })
}

fn consensus(
    pose: &Pose,
    correspondences: &[Correspondence],
    camera: &CameraParameters,
    threshold_sq: f64,
) -> (Vec<usize>, f64) {
    let mut inliers = Vec::new();
    let mut error = 0.0;
    for (idx, correspondence) in correspondences.iter().enumerate() {
        if let Some(err_sq) = reprojection_error_sq(pose, correspondence, camera) {
            if err_sq <= threshold_sq {
                inliers.push(idx);
                error += err_sq;
            }
        }
    }
    (inliers, error)
}

/// Levenberg-Marquardt on SE(3) with left-multiplied rotation increments.
fn refine(
    correspondences: &[Correspondence],
    indices: &[usize],
    camera: &CameraParameters,
    initial: Pose,
) -> Option<Refinement> {
    let mut pose = initial;
    let (mut jtj, mut jtr, mut cost) = normal_equations(&pose, correspondences, indices, camera)?;
    let mut lambda = 1e-3;

    for _ in 0..LM_MAX_ITERATIONS {
        let mut damped = jtj;
        for k in 0..6 {
            damped[(k, k)] += lambda * (jtj[(k, k)] + 1e-9);
        }
        let Some(cholesky) = damped.cholesky() else {
            lambda *= 10.0;
            if lambda > LM_MAX_DAMPING {
                break;
            }
            continue;
        };
        let delta = cholesky.solve(&(-jtr));
        let candidate = apply_increment(&pose, &delta);

        match normal_equations(&candidate, correspondences, indices, camera) {
            Some((c_jtj, c_jtr, c_cost)) if c_cost < cost => {
                let improvement = cost - c_cost;
                pose = candidate;
                jtj = c_jtj;
                jtr = c_jtr;
                cost = c_cost;
                lambda = (lambda * 0.3).max(1e-12);
                if improvement <= 1e-14 * (1.0 + cost) || delta.norm() < 1e-12 {
                    break;
                }
            }
            _ => {
                lambda *= 10.0;
                if lambda > LM_MAX_DAMPING {
                    break;
                }
            }
        }
    }

    Some(Refinement {
        pose,
        information: jtj,
        cost,
    })
}

fn normal_equations(
    pose: &Pose,
    correspondences: &[Correspondence],
    indices: &[usize],
    camera: &CameraParameters,
) -> Option<(PnpMat, PnpVec, f64)> {
    let mut jtj = PnpMat::zeros();
    let mut jtr = PnpVec::zeros();
    let mut cost = 0.0;

    for &idx in indices {
        let correspondence = correspondences.get(idx)?;
        let rotated = pose.rotation * correspondence.beacon;
        let p_cam = rotated + pose.translation.vector;
        let pixel = camera.project(&p_cam)?;
        let residual = pixel - correspondence.pixel;

        // d p_cam / d theta = -[R p]x, d p_cam / d t = I
        let d_proj = camera.projection_jacobian(&p_cam);
        let mut j = ReprojectionJacobian::zeros();
        j.fixed_view_mut::<2, 3>(0, 0)
            .copy_from(&(d_proj * -rotated.cross_matrix()));
        j.fixed_view_mut::<2, 3>(0, 3).copy_from(&d_proj);

        jtj += j.transpose() * j;
        jtr += j.transpose() * residual;
        cost += residual.norm_squared();
    }

    Some((jtj, jtr, cost))
}

fn apply_increment(pose: &Pose, delta: &PnpVec) -> Pose {
    let rotation =
        UnitQuaternion::from_scaled_axis(delta.fixed_rows::<3>(0).into_owned()) * pose.rotation;
    let translation = pose.translation.vector + delta.fixed_rows::<3>(3);
    Pose::from_parts(Translation3::from(translation), rotation)
}
