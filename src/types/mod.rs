pub mod linalg;

pub use linalg::*;

use nalgebra::{Isometry3, Translation3, UnitQuaternion, Vector3};
use serde::{Deserialize, Serialize};

/// Capture time of a frame, split the way the recorder writes it.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timestamp {
    pub seconds: i64,
    pub microseconds: i64,
}

impl Timestamp {
    pub fn new(seconds: i64, microseconds: i64) -> Self {
        Self {
            seconds,
            microseconds,
        }
    }

    /// Signed elapsed seconds from `earlier` to `self`.
    pub fn seconds_since(&self, earlier: &Timestamp) -> f64 {
        (self.seconds - earlier.seconds) as f64
            + (self.microseconds - earlier.microseconds) as f64 * 1e-6
    }

    pub fn as_secs_f64(&self) -> f64 {
        self.seconds as f64 + self.microseconds as f64 * 1e-6
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageSize {
    pub width: u32,
    pub height: u32,
}

impl Default for ImageSize {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
        }
    }
}

/// A detected bright spot in the camera image.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Blob {
    /// Image x coordinate [pixels]
    pub x: f64,
    /// Image y coordinate [pixels]
    pub y: f64,
    /// Apparent blob size [pixels]
    pub size: f64,
    /// Resolution the coordinates were measured against
    pub image_size: ImageSize,
}

impl Blob {
    pub fn new(x: f64, y: f64, size: f64, image_size: ImageSize) -> Self {
        Self {
            x,
            y,
            size,
            image_size,
        }
    }

    /// Coordinates scaled into [0, 1] by the reference resolution.
    pub fn normalized(&self) -> (f64, f64) {
        (
            self.x / self.image_size.width as f64,
            self.y / self.image_size.height as f64,
        )
    }

    pub fn is_within_image(&self) -> bool {
        let (u, v) = self.normalized();
        (0.0..=1.0).contains(&u) && (0.0..=1.0).contains(&v)
    }
}

/// One replayed frame: ground truth plus the blobs seen at that instant.
///
/// Only fully parsed rows become records, so holding one means it is valid.
#[derive(Clone, Debug, PartialEq)]
pub struct MeasurementRecord {
    pub timestamp: Timestamp,
    pub ground_truth_position: Vector3<f64>,
    pub ground_truth_rotation: UnitQuaternion<f64>,
    pub blobs: Vec<Blob>,
}

impl MeasurementRecord {
    pub fn ground_truth_pose(&self) -> Pose {
        Isometry3::from_parts(
            Translation3::from(self.ground_truth_position),
            self.ground_truth_rotation,
        )
    }
}
