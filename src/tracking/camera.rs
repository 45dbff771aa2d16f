use nalgebra::{Matrix2x3, Vector2, Vector3};
use serde::{Deserialize, Serialize};

use crate::error::BuildError;
use crate::types::ImageSize;

const MIN_DEPTH: f64 = 1e-6;

/// Undistorted pinhole camera handed unchanged to every pose pipeline.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraParameters {
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
    pub image_size: ImageSize,
}

impl Default for CameraParameters {
    fn default() -> Self {
        Self {
            fx: 700.2,
            fy: 700.2,
            cx: 318.31,
            cy: 237.83,
            image_size: ImageSize::default(),
        }
    }
}

impl CameraParameters {
    pub fn validate(&self) -> Result<(), BuildError> {
        if !(self.fx > 0.0 && self.fy > 0.0) || !self.fx.is_finite() || !self.fy.is_finite() {
            return Err(BuildError::InvalidCamera(format!(
                "focal lengths must be positive (fx={}, fy={})",
                self.fx, self.fy
            )));
        }
        if !self.cx.is_finite() || !self.cy.is_finite() {
            return Err(BuildError::InvalidCamera(
                "principal point must be finite".to_string(),
            ));
        }
        Ok(())
    }

    /// Pixel location of a camera-space point, `None` behind the camera.
    pub fn project(&self, p_cam: &Vector3<f64>) -> Option<Vector2<f64>> {
        if p_cam.z <= MIN_DEPTH {
            return None;
        }
        Some(Vector2::new(
            self.fx * p_cam.x / p_cam.z + self.cx,
            self.fy * p_cam.y / p_cam.z + self.cy,
        ))
    }

    /// d(pixel) / d(p_cam)
    pub fn projection_jacobian(&self, p_cam: &Vector3<f64>) -> Matrix2x3<f64> {
        let inv_z = 1.0 / p_cam.z;
        let inv_z2 = inv_z * inv_z;
        Matrix2x3::new(
            self.fx * inv_z,
            0.0,
            -self.fx * p_cam.x * inv_z2,
            0.0,
            self.fy * inv_z,
            -self.fy * p_cam.y * inv_z2,
        )
    }
}
