/// State estimation filters
///
/// Error-state Kalman filtering of the tracked body's pose from
/// camera-derived pose measurements.

pub mod pose_ekf;

pub use pose_ekf::{PoseEkf, PoseEkfState};
