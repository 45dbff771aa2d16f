//! Quadratic interpolation model and its KKT system
//!
//! The model is Q(x) = c + gᵀ(x - x₀) + ½ (x - x₀)ᵀ H (x - x₀) around a
//! centre x₀. Between iterations it is corrected by the quadratic of least
//! Frobenius norm Hessian that interpolates the current residuals, which is
//! the symmetric Broyden update Powell's NEWUOA uses.

use nalgebra::{DMatrix, DVector};

#[derive(Clone, Debug)]
pub(crate) struct QuadraticModel {
    pub center: DVector<f64>,
    pub constant: f64,
    pub gradient: DVector<f64>,
    pub hessian: DMatrix<f64>,
}

impl QuadraticModel {
    pub fn zero(center: DVector<f64>) -> Self {
        let n = center.len();
        Self {
            center,
            constant: 0.0,
            gradient: DVector::zeros(n),
            hessian: DMatrix::zeros(n, n),
        }
    }

    pub fn value(&self, x: &DVector<f64>) -> f64 {
        let d = x - &self.center;
        self.constant + self.step_change(&d)
    }

    /// Q(center + s) - Q(center)
    pub fn step_change(&self, s: &DVector<f64>) -> f64 {
        self.gradient.dot(s) + 0.5 * s.dot(&(&self.hessian * s))
    }

    /// Re-express the same quadratic around a new centre.
    pub fn recenter(&mut self, new_center: &DVector<f64>) {
        let d = new_center - &self.center;
        self.constant += self.step_change(&d);
        self.gradient += &self.hessian * &d;
        self.center = new_center.clone();
    }

    /// Add a correction fitted in coordinates scaled by `scale`.
    fn add_scaled(&mut self, correction: &Correction, scale: f64) {
        self.constant += correction.constant;
        self.gradient += &correction.gradient / scale;
        self.hessian += &correction.hessian / (scale * scale);
    }

    /// Refit so the model interpolates every (point, value) pair exactly.
    /// Returns false when the interpolation system is singular.
    pub fn refit(&mut self, points: &[DVector<f64>], values: &[f64]) -> bool {
        let scale = farthest_distance(points, &self.center).max(f64::MIN_POSITIVE);
        let Some(system) = InterpolationSystem::build(points, &self.center, scale) else {
            return false;
        };
        let residuals: Vec<f64> = points
            .iter()
            .zip(values)
            .map(|(p, f)| f - self.value(p))
            .collect();
        let correction = system.solve(&residuals);
        self.add_scaled(&correction, scale);
        true
    }
}

pub(crate) struct Correction {
    pub constant: f64,
    pub gradient: DVector<f64>,
    pub hessian: DMatrix<f64>,
}

/// Inverse of the KKT matrix W = [A Pᵀ; P 0] for the current point set,
/// with Aᵢⱼ = ½ (dᵢᵀ dⱼ)² and P holding the rows [1, dᵢᵀ].
pub(crate) struct InterpolationSystem {
    inverse: DMatrix<f64>,
    offsets: Vec<DVector<f64>>,
    scale: f64,
}

impl InterpolationSystem {
    pub fn build(points: &[DVector<f64>], center: &DVector<f64>, scale: f64) -> Option<Self> {
        let m = points.len();
        let n = center.len();
        let offsets: Vec<DVector<f64>> = points.iter().map(|p| (p - center) / scale).collect();

        let dim = m + n + 1;
        let mut w = DMatrix::zeros(dim, dim);
        for i in 0..m {
            for j in 0..m {
                let d = offsets[i].dot(&offsets[j]);
                w[(i, j)] = 0.5 * d * d;
            }
            w[(i, m)] = 1.0;
            w[(m, i)] = 1.0;
            for k in 0..n {
                w[(i, m + 1 + k)] = offsets[i][k];
                w[(m + 1 + k, i)] = offsets[i][k];
            }
        }

        let inverse = w.lu().try_inverse()?;
        if !inverse.iter().all(|v| v.is_finite()) {
            return None;
        }
        Some(Self {
            inverse,
            offsets,
            scale,
        })
    }

    pub fn scale(&self) -> f64 {
        self.scale
    }

    fn npt(&self) -> usize {
        self.offsets.len()
    }

    /// Minimum-norm quadratic (scaled coordinates) through `rhs` at the points.
    pub fn solve(&self, rhs: &[f64]) -> Correction {
        let m = self.npt();
        let n = self.offsets.first().map(|d| d.len()).unwrap_or(0);
        let mut b = DVector::zeros(self.inverse.nrows());
        for (slot, value) in b.iter_mut().zip(rhs) {
            *slot = *value;
        }
        let z = &self.inverse * b;
        self.quadratic_from(z.as_slice(), m, n)
    }

    /// Lagrange function ℓₜ of point `t` in scaled coordinates.
    pub fn lagrange(&self, t: usize) -> Correction {
        let m = self.npt();
        let n = self.offsets.first().map(|d| d.len()).unwrap_or(0);
        let column: Vec<f64> = self.inverse.column(t).iter().copied().collect();
        self.quadratic_from(&column, m, n)
    }

    /// ℓₜ evaluated at scaled offset `d`.
    pub fn lagrange_value(&self, t: usize, d: &DVector<f64>) -> f64 {
        let m = self.npt();
        let column = self.inverse.column(t);
        let mut value = column[m];
        for k in 0..d.len() {
            value += column[m + 1 + k] * d[k];
        }
        for (j, offset) in self.offsets.iter().enumerate() {
            let dot = offset.dot(d);
            value += 0.5 * column[j] * dot * dot;
        }
        value
    }

    fn quadratic_from(&self, z: &[f64], m: usize, n: usize) -> Correction {
        let mut hessian = DMatrix::zeros(n, n);
        for (j, offset) in self.offsets.iter().enumerate() {
            hessian += offset * offset.transpose() * z[j];
        }
        Correction {
            constant: z[m],
            gradient: DVector::from_iterator(n, z[m + 1..m + 1 + n].iter().copied()),
            hessian,
        }
    }
}

pub(crate) fn farthest_distance(points: &[DVector<f64>], center: &DVector<f64>) -> f64 {
    points
        .iter()
        .map(|p| (p - center).norm())
        .fold(0.0, f64::max)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn points_2d(rho: f64) -> Vec<DVector<f64>> {
        vec![
            DVector::from_vec(vec![0.0, 0.0]),
            DVector::from_vec(vec![rho, 0.0]),
            DVector::from_vec(vec![0.0, rho]),
            DVector::from_vec(vec![-rho, 0.0]),
            DVector::from_vec(vec![0.0, -rho]),
        ]
    }

    #[test]
    fn test_refit_interpolates_values() {
        let points = points_2d(0.5);
        let f = |x: &DVector<f64>| 3.0 + x[0] - 2.0 * x[1] + x[0] * x[0] + 0.5 * x[1] * x[1];
        let values: Vec<f64> = points.iter().map(f).collect();

        let mut model = QuadraticModel::zero(DVector::zeros(2));
        assert!(model.refit(&points, &values));
        for (p, v) in points.iter().zip(&values) {
            assert_relative_eq!(model.value(p), *v, epsilon = 1e-10);
        }
        // Axis points pin down the diagonal Hessian and the gradient
        assert_relative_eq!(model.gradient[0], 1.0, epsilon = 1e-10);
        assert_relative_eq!(model.hessian[(1, 1)], 1.0, epsilon = 1e-10);
    }

    #[test]
    fn test_lagrange_functions_are_cardinal() {
        let points = points_2d(1.0);
        let center = DVector::zeros(2);
        let system = InterpolationSystem::build(&points, &center, 1.0).unwrap();
        for t in 0..points.len() {
            for (j, p) in points.iter().enumerate() {
                let expected = if t == j { 1.0 } else { 0.0 };
                assert_relative_eq!(system.lagrange_value(t, p), expected, epsilon = 1e-10);
            }
        }
    }

    #[test]
    fn test_recenter_preserves_values() {
        let mut model = QuadraticModel::zero(DVector::zeros(2));
        model.constant = 1.0;
        model.gradient = DVector::from_vec(vec![0.5, -1.0]);
        model.hessian = DMatrix::from_row_slice(2, 2, &[2.0, 0.3, 0.3, 1.0]);
        let probe = DVector::from_vec(vec![0.7, -0.2]);
        let before = model.value(&probe);
        model.recenter(&DVector::from_vec(vec![0.1, 0.4]));
        assert_relative_eq!(model.value(&probe), before, epsilon = 1e-12);
    }

    #[test]
    fn test_duplicate_points_are_degenerate() {
        let mut points = points_2d(1.0);
        points[4] = points[3].clone();
        assert!(InterpolationSystem::build(&points, &DVector::zeros(2), 1.0).is_none());
    }
}
