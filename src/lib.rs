//! Offline calibration and comparison harness for a beacon pose tracker
//!
//! Recorded frames (ground truth plus detected blobs) are replayed through
//! the tracker to tune its noise model with a derivative-free optimizer, or
//! to compare the full filter against a smoothed single-frame RANSAC pose.

pub mod comparison;
pub mod config;
pub mod error;
pub mod filters;
pub mod loader;
pub mod objective;
pub mod optimizer;
pub mod report;
pub mod runners;
pub mod smoothing;
pub mod tracking;
pub mod types;

#[cfg(test)]
mod test_helpers;
