use nalgebra::{DMatrix, DVector};

const BISECTION_STEPS: usize = 200;
const EIGEN_EPS: f64 = 1e-14;

/// Minimize gᵀs + ½ sᵀHs subject to ‖s‖ ≤ delta.
///
/// Works in the eigenbasis of H and bisects on the shift μ of the secular
/// equation ‖(H + μI)⁻¹ g‖ = delta, including the hard case where g has no
/// component along the most negative eigenvector.
pub(crate) fn trust_region_step(g: &DVector<f64>, h: &DMatrix<f64>, delta: f64) -> DVector<f64> {
    let n = g.len();
    if n == 0 || !(delta > 0.0) {
        return DVector::zeros(n);
    }

    let eigen = h.clone().symmetric_eigen();
    let lambdas = &eigen.eigenvalues;
    let basis = &eigen.eigenvectors;
    let g_hat = basis.transpose() * g;

    let (min_index, lambda_min) = lambdas
        .iter()
        .copied()
        .enumerate()
        .fold((0, f64::INFINITY), |best, (i, l)| if l < best.1 { (i, l) } else { best });

    let step_for = |mu: f64| -> DVector<f64> {
        let mut coeffs = DVector::zeros(n);
        for i in 0..n {
            let denom = lambdas[i] + mu;
            if denom.abs() > EIGEN_EPS {
                coeffs[i] = -g_hat[i] / denom;
            }
        }
        basis * coeffs
    };

    if lambda_min > EIGEN_EPS {
        let newton = step_for(0.0);
        if newton.norm() <= delta {
            return newton;
        }
    }

    let g_norm = g.norm();
    if g_norm <= f64::MIN_POSITIVE {
        // Stationary model: move along negative curvature if there is any
        return if lambda_min < 0.0 {
            basis.column(min_index) * delta
        } else {
            DVector::zeros(n)
        };
    }

    let lower = (-lambda_min).max(0.0);
    let nudge = EIGEN_EPS * (1.0 + lower);
    let edge = step_for(lower + nudge);
    if edge.norm() < delta && lambda_min <= 0.0 {
        // Hard case: fill the remaining radius along the extreme eigenvector
        let partial = step_for(lower);
        let tau = (delta * delta - partial.norm_squared()).max(0.0).sqrt();
        return partial + basis.column(min_index) * tau;
    }

    let mut lo = lower + nudge;
    let mut hi = lower + g_norm / delta;
    for _ in 0..BISECTION_STEPS {
        let mid = 0.5 * (lo + hi);
        if step_for(mid).norm() > delta {
            lo = mid;
        } else {
            hi = mid;
        }
        if hi - lo <= 1e-15 * hi.max(1.0) {
            break;
        }
    }
    step_for(hi)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn model_change(g: &DVector<f64>, h: &DMatrix<f64>, s: &DVector<f64>) -> f64 {
        g.dot(s) + 0.5 * s.dot(&(h * s))
    }

    #[test]
    fn test_interior_newton_step() {
        let g = DVector::from_vec(vec![1.0, -2.0]);
        let h = DMatrix::from_diagonal(&DVector::from_vec(vec![2.0, 4.0]));
        let s = trust_region_step(&g, &h, 10.0);
        assert_relative_eq!(s[0], -0.5, epsilon = 1e-12);
        assert_relative_eq!(s[1], 0.5, epsilon = 1e-12);
    }

    #[test]
    fn test_boundary_step_when_newton_too_long() {
        let g = DVector::from_vec(vec![4.0, 0.0]);
        let h = DMatrix::identity(2, 2);
        let s = trust_region_step(&g, &h, 1.0);
        assert_relative_eq!(s.norm(), 1.0, epsilon = 1e-9);
        assert_relative_eq!(s[0], -1.0, epsilon = 1e-9);
    }

    #[test]
    fn test_negative_curvature_reaches_boundary() {
        let g = DVector::from_vec(vec![0.1, 0.0]);
        let h = DMatrix::from_diagonal(&DVector::from_vec(vec![1.0, -1.0]));
        let s = trust_region_step(&g, &h, 0.5);
        assert_relative_eq!(s.norm(), 0.5, epsilon = 1e-9);
        assert!(model_change(&g, &h, &s) < 0.0);
    }

    #[test]
    fn test_linear_model_steps_downhill() {
        let g = DVector::from_vec(vec![3.0, 4.0]);
        let h = DMatrix::zeros(2, 2);
        let s = trust_region_step(&g, &h, 2.0);
        assert_relative_eq!(s.norm(), 2.0, epsilon = 1e-9);
        assert_relative_eq!(s[0], -1.2, epsilon = 1e-9);
    }
}
