use std::f64::consts::PI;

use nalgebra::{Translation3, UnitQuaternion, Vector3};
use serde::{Deserialize, Serialize};

use crate::types::Pose;

/// One-euro filter tuning.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OneEuroParams {
    /// Cutoff at zero speed [Hz]
    pub min_cutoff: f64,
    /// Cutoff increase per unit of filtered speed
    pub beta: f64,
    /// Cutoff used to smooth the derivative [Hz]
    pub derivative_cutoff: f64,
}

impl Default for OneEuroParams {
    fn default() -> Self {
        Self {
            min_cutoff: 1.0,
            beta: 0.5,
            derivative_cutoff: 1.0,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SmootherConfig {
    pub position: OneEuroParams,
    pub rotation: OneEuroParams,
}

/// Low-pass blend factor for a given step and cutoff frequency
fn alpha(dt: f64, cutoff: f64) -> f64 {
    let tau = 1.0 / (2.0 * PI * cutoff);
    1.0 / (1.0 + tau / dt)
}

/// Adaptive low-pass filter on a 3-vector
#[derive(Clone, Debug)]
pub struct OneEuroVector {
    params: OneEuroParams,
    previous: Option<Vector3<f64>>,
    filtered: Vector3<f64>,
    derivative: Vector3<f64>,
}

impl OneEuroVector {
    pub fn new(params: OneEuroParams) -> Self {
        Self {
            params,
            previous: None,
            filtered: Vector3::zeros(),
            derivative: Vector3::zeros(),
        }
    }

    /// Feed one sample; the first sample passes through unchanged
    pub fn filter(&mut self, dt: f64, value: &Vector3<f64>) -> Vector3<f64> {
        match self.previous {
            None => {
                self.filtered = *value;
                self.derivative = Vector3::zeros();
            }
            Some(previous) => {
                let raw_derivative = (value - previous) / dt;
                let a_d = alpha(dt, self.params.derivative_cutoff);
                self.derivative += (raw_derivative - self.derivative) * a_d;

                let cutoff = self.params.min_cutoff + self.params.beta * self.derivative.norm();
                let a = alpha(dt, cutoff);
                self.filtered += (value - self.filtered) * a;
            }
        }
        self.previous = Some(*value);
        self.filtered
    }

    pub fn value(&self) -> Vector3<f64> {
        self.filtered
    }
}

/// Adaptive low-pass filter on orientations.
///
/// Speed is the angular rate between consecutive raw samples. Each sample is
/// first moved onto the hemisphere of the previous one so q and -q filter
/// identically.
#[derive(Clone, Debug)]
pub struct OneEuroRotation {
    params: OneEuroParams,
    previous: Option<UnitQuaternion<f64>>,
    filtered: UnitQuaternion<f64>,
    angular_rate: Vector3<f64>,
}

impl OneEuroRotation {
    pub fn new(params: OneEuroParams) -> Self {
        Self {
            params,
            previous: None,
            filtered: UnitQuaternion::identity(),
            angular_rate: Vector3::zeros(),
        }
    }

    pub fn filter(&mut self, dt: f64, value: &UnitQuaternion<f64>) -> UnitQuaternion<f64> {
        match self.previous {
            None => {
                self.filtered = *value;
                self.angular_rate = Vector3::zeros();
                self.previous = Some(*value);
            }
            Some(previous) => {
                let sample = same_hemisphere(value, &previous);
                let raw_rate = (sample * previous.inverse()).scaled_axis() / dt;
                let a_d = alpha(dt, self.params.derivative_cutoff);
                self.angular_rate += (raw_rate - self.angular_rate) * a_d;

                let cutoff = self.params.min_cutoff + self.params.beta * self.angular_rate.norm();
                let a = alpha(dt, cutoff);
                self.filtered = self
                    .filtered
                    .try_slerp(&sample, a, 1e-9)
                    .unwrap_or(sample);
                self.previous = Some(sample);
            }
        }
        self.filtered
    }

    pub fn value(&self) -> UnitQuaternion<f64> {
        self.filtered
    }
}

fn same_hemisphere(q: &UnitQuaternion<f64>, reference: &UnitQuaternion<f64>) -> UnitQuaternion<f64> {
    if q.coords.dot(&reference.coords) < 0.0 {
        UnitQuaternion::new_unchecked(-q.into_inner())
    } else {
        *q
    }
}

/// One-euro smoothing of a pose stream, position and rotation independently
#[derive(Clone, Debug)]
pub struct PoseSmoother {
    position: OneEuroVector,
    rotation: OneEuroRotation,
}

impl Default for PoseSmoother {
    fn default() -> Self {
        Self::new(&SmootherConfig::default())
    }
}

impl PoseSmoother {
    pub fn new(config: &SmootherConfig) -> Self {
        Self {
            position: OneEuroVector::new(config.position),
            rotation: OneEuroRotation::new(config.rotation),
        }
    }

    /// Advance both filters; a non-positive `dt` is treated as one second.
    pub fn filter(&mut self, dt: f64, position: &Vector3<f64>, rotation: &UnitQuaternion<f64>) {
        let dt = if dt <= 0.0 { 1.0 } else { dt };
        self.position.filter(dt, position);
        self.rotation.filter(dt, rotation);
    }

    pub fn position(&self) -> Vector3<f64> {
        self.position.value()
    }

    pub fn rotation(&self) -> UnitQuaternion<f64> {
        self.rotation.value()
    }

    /// Filtered rotation followed by filtered translation.
    pub fn pose(&self) -> Pose {
        Pose::from_parts(Translation3::from(self.position()), self.rotation())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn rotation(angle: f64) -> UnitQuaternion<f64> {
        UnitQuaternion::from_axis_angle(&Vector3::z_axis(), angle)
    }

    #[test]
    fn test_first_sample_passes_through() {
        let mut smoother = PoseSmoother::default();
        let p = Vector3::new(1.0, -2.0, 3.0);
        let q = rotation(0.7);
        smoother.filter(0.01, &p, &q);
        assert_eq!(smoother.position(), p);
        assert!(smoother.rotation().angle_to(&q) < 1e-12);
    }

    #[test]
    fn test_zero_dt_matches_unit_dt() {
        let samples = [
            (Vector3::new(0.0, 0.0, 0.0), rotation(0.0)),
            (Vector3::new(1.0, 0.5, 0.0), rotation(0.3)),
            (Vector3::new(2.0, 0.0, -1.0), rotation(0.1)),
        ];
        let mut zero = PoseSmoother::default();
        let mut unit = PoseSmoother::default();
        for (p, q) in &samples {
            zero.filter(0.0, p, q);
            unit.filter(1.0, p, q);
            assert_eq!(zero.position(), unit.position());
            assert_eq!(zero.rotation(), unit.rotation());
        }

        let mut negative = PoseSmoother::default();
        for (p, q) in &samples {
            negative.filter(-0.5, p, q);
        }
        assert_eq!(negative.pose(), unit.pose());
    }

    #[test]
    fn test_lags_behind_step_then_converges() {
        let mut smoother = PoseSmoother::default();
        smoother.filter(0.01, &Vector3::zeros(), &rotation(0.0));
        smoother.filter(0.01, &Vector3::new(1.0, 0.0, 0.0), &rotation(0.5));
        let after_step = smoother.position().x;
        assert!(after_step > 0.0 && after_step < 1.0);
        assert!(smoother.rotation().angle() < 0.5);

        for _ in 0..2000 {
            smoother.filter(0.01, &Vector3::new(1.0, 0.0, 0.0), &rotation(0.5));
        }
        assert_relative_eq!(smoother.position().x, 1.0, epsilon = 1e-6);
        assert!(smoother.rotation().angle_to(&rotation(0.5)) < 1e-6);
    }

    #[test]
    fn test_negated_quaternion_filters_identically() {
        let stream = [0.0, 0.1, 0.25, 0.3, 0.32];
        let mut plain = OneEuroRotation::new(OneEuroParams::default());
        let mut flipped = OneEuroRotation::new(OneEuroParams::default());
        for (k, angle) in stream.iter().enumerate() {
            let q = rotation(*angle);
            let q_neg = if k % 2 == 1 {
                UnitQuaternion::new_unchecked(-q.into_inner())
            } else {
                q
            };
            let a = plain.filter(0.02, &q);
            let b = flipped.filter(0.02, &q_neg);
            assert!(a.angle_to(&b) < 1e-9, "diverged at sample {k}");
        }
    }

    #[test]
    fn test_alpha_bounds() {
        let a = alpha(0.01, 1.0);
        assert!(a > 0.0 && a < 1.0);
        assert!(alpha(1.0, 1.0) > a);
    }
}
