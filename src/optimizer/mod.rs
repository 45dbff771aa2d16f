/// Derivative-free minimization
///
/// A trust-region method in the style of Powell's NEWUOA: the objective is
/// modelled by a quadratic that interpolates `npt` sampled points, steps
/// are taken inside a shrinking trust region, and the objective is only
/// ever seen as a black box.

mod model;
mod trust_region;

use log::{debug, info};
use nalgebra::DVector;
use serde::{Deserialize, Serialize};

use crate::error::OptimizerError;
use model::{farthest_distance, InterpolationSystem, QuadraticModel};
use trust_region::trust_region_step;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    /// Interpolation points, `None` means 2n (at least n + 2)
    pub interpolation_points: Option<usize>,
    /// Initial trust region radius; swapped with `rho_end` if smaller
    pub rho_begin: f64,
    /// Final trust region radius
    pub rho_end: f64,
    /// Hard cap on objective evaluations
    pub max_evaluations: usize,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            interpolation_points: None,
            rho_begin: 1e-4,
            rho_end: 1e-8,
            max_evaluations: 10,
        }
    }
}

impl OptimizerConfig {
    /// (begin, end) with begin ≥ end.
    pub fn radii(&self) -> (f64, f64) {
        if self.rho_end > self.rho_begin {
            (self.rho_end, self.rho_begin)
        } else {
            (self.rho_begin, self.rho_end)
        }
    }

    pub fn interpolation_points_for(&self, n: usize) -> usize {
        self.interpolation_points.unwrap_or((2 * n).max(n + 2))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Termination {
    /// Trust region reached `rho_end`
    Converged,
    BudgetExhausted,
    NonFiniteObjective,
    DegenerateModel,
}

#[derive(Clone, Debug)]
pub struct OptimizationResult {
    /// Best point evaluated
    pub parameters: DVector<f64>,
    pub cost: f64,
    pub evaluations: usize,
    pub termination: Termination,
}

pub struct TrustRegionOptimizer {
    config: OptimizerConfig,
}

impl TrustRegionOptimizer {
    pub fn new(config: OptimizerConfig) -> Self {
        Self { config }
    }

    pub fn minimize<F>(
        &self,
        x0: &DVector<f64>,
        objective: F,
    ) -> Result<OptimizationResult, OptimizerError>
    where
        F: FnMut(&DVector<f64>) -> f64,
    {
        let n = x0.len();
        if n == 0 {
            return Err(OptimizerError::EmptyParameters);
        }
        let npt = self.config.interpolation_points_for(n);
        let (min, max) = (n + 2, (n + 1) * (n + 2) / 2);
        if npt < min || npt > max {
            return Err(OptimizerError::InterpolationCount { npt, min, max });
        }
        let (rho_begin, rho_end) = self.config.radii();
        if !(rho_end > 0.0) || !rho_begin.is_finite() {
            return Err(OptimizerError::InvalidRadius {
                begin: rho_begin,
                end: rho_end,
            });
        }
        if self.config.max_evaluations == 0 {
            return Err(OptimizerError::ZeroBudget);
        }

        let mut run = Run {
            objective,
            budget: self.config.max_evaluations,
            evaluations: 0,
            npt,
            points: Vec::with_capacity(npt),
            values: Vec::with_capacity(npt),
            kopt: 0,
        };
        let termination = run.execute(x0, rho_begin, rho_end);
        info!(
            "[optimizer] stopped ({:?}) after {} evaluations, cost {:.6e}",
            termination,
            run.evaluations,
            run.best_value().unwrap_or(f64::NAN)
        );

        let (parameters, cost) = match run.best() {
            Some((x, f)) => (x, f),
            None => (x0.clone(), f64::NAN),
        };
        Ok(OptimizationResult {
            parameters,
            cost,
            evaluations: run.evaluations,
            termination,
        })
    }
}

enum Stop {
    Budget,
    NonFinite,
}

struct Run<F> {
    objective: F,
    budget: usize,
    evaluations: usize,
    npt: usize,
    points: Vec<DVector<f64>>,
    values: Vec<f64>,
    kopt: usize,
}

impl<F> Run<F>
where
    F: FnMut(&DVector<f64>) -> f64,
{
    fn evaluate(&mut self, x: &DVector<f64>) -> Result<f64, Stop> {
        if self.evaluations >= self.budget {
            return Err(Stop::Budget);
        }
        self.evaluations += 1;
        let value = (self.objective)(x);
        debug!(
            "[optimizer] eval {} f={:.6e} x={:?}",
            self.evaluations,
            value,
            x.as_slice()
        );
        if value.is_finite() {
            Ok(value)
        } else {
            Err(Stop::NonFinite)
        }
    }

    fn best(&self) -> Option<(DVector<f64>, f64)> {
        self.values
            .iter()
            .enumerate()
            .min_by(|a, b| a.1.total_cmp(b.1))
            .map(|(i, f)| (self.points[i].clone(), *f))
    }

    fn best_value(&self) -> Option<f64> {
        self.best().map(|(_, f)| f)
    }

    fn execute(&mut self, x0: &DVector<f64>, rho_begin: f64, rho_end: f64) -> Termination {
        match self.initialize(x0, rho_begin) {
            Ok(()) => {}
            Err(stop) => return stop.into(),
        }
        match self.iterate(rho_begin, rho_end) {
            Ok(termination) => termination,
            Err(stop) => stop.into(),
        }
    }

    /// x0, then x0 ± rho along each axis, then two-axis points if npt > 2n + 1.
    fn initialize(&mut self, x0: &DVector<f64>, rho: f64) -> Result<(), Stop> {
        let n = x0.len();
        let f0 = self.evaluate(x0)?;
        self.push(x0.clone(), f0);

        let mut plus = vec![f64::NAN; n];
        let mut minus = vec![f64::NAN; n];
        for i in 0..n {
            if self.points.len() == self.npt {
                break;
            }
            let mut x = x0.clone();
            x[i] += rho;
            plus[i] = self.evaluate(&x)?;
            self.push(x, plus[i]);
        }
        for i in 0..n {
            if self.points.len() == self.npt {
                break;
            }
            let mut x = x0.clone();
            x[i] -= rho;
            minus[i] = self.evaluate(&x)?;
            self.push(x, minus[i]);
        }

        // Step each axis toward its better side
        let side = |i: usize| -> f64 {
            if minus[i] < plus[i] {
                -1.0
            } else {
                1.0
            }
        };
        'pairs: for i in 0..n {
            for j in (i + 1)..n {
                if self.points.len() == self.npt {
                    break 'pairs;
                }
                let mut x = x0.clone();
                x[i] += side(i) * rho;
                x[j] += side(j) * rho;
                let f = self.evaluate(&x)?;
                self.push(x, f);
            }
        }
        Ok(())
    }

    fn push(&mut self, x: DVector<f64>, f: f64) {
        if self.values.is_empty() || f < self.values[self.kopt] {
            self.kopt = self.values.len();
        }
        self.points.push(x);
        self.values.push(f);
    }

    fn iterate(&mut self, rho_begin: f64, rho_end: f64) -> Result<Termination, Stop> {
        let mut rho = rho_begin;
        let mut delta = rho_begin;
        let mut model = QuadraticModel::zero(self.points[self.kopt].clone());
        if !model.refit(&self.points, &self.values) {
            return Ok(Termination::DegenerateModel);
        }
        let mut improve_geometry = false;

        loop {
            if self.evaluations >= self.budget {
                return Err(Stop::Budget);
            }
            let center = self.points[self.kopt].clone();
            model.recenter(&center);

            if improve_geometry {
                improve_geometry = false;
                if !self.geometry_step(&mut model, &center, delta, rho)? {
                    return Ok(Termination::DegenerateModel);
                }
                continue;
            }

            let step = trust_region_step(&model.gradient, &model.hessian, delta);
            let step_norm = step.norm();

            if step_norm < 0.5 * rho {
                // Step too short to be worth an evaluation
                let previous_delta = delta;
                delta = (0.5 * delta).max(rho);
                if delta <= 1.5 * rho {
                    delta = rho;
                }
                if farthest_distance(&self.points, &center) > 2.0 * delta {
                    improve_geometry = true;
                    continue;
                }
                if previous_delta > rho {
                    continue;
                }
            } else {
                let predicted = -model.step_change(&step);
                let x_new = &center + &step;
                let f_new = self.evaluate(&x_new)?;
                let f_opt = self.values[self.kopt];
                let ratio = if predicted > 0.0 {
                    (f_opt - f_new) / predicted
                } else {
                    -1.0
                };

                delta = if ratio <= 0.1 {
                    (0.5 * delta).min(step_norm)
                } else if ratio <= 0.7 {
                    (0.5 * delta).max(step_norm)
                } else {
                    (0.5 * delta).max(2.0 * step_norm)
                };
                if delta <= 1.5 * rho {
                    delta = rho;
                }

                let scale = farthest_distance(&self.points, &center).max(rho);
                let Some(system) = InterpolationSystem::build(&self.points, &center, scale) else {
                    return Ok(Termination::DegenerateModel);
                };
                let improved = f_new < f_opt;
                let t = self.replacement_index(&system, &center, &(&step / scale), delta, improved);
                self.points[t] = x_new;
                self.values[t] = f_new;
                if improved {
                    self.kopt = t;
                }
                if !model.refit(&self.points, &self.values) {
                    return Ok(Termination::DegenerateModel);
                }

                if ratio >= 0.1 {
                    continue;
                }
                let best = self.points[self.kopt].clone();
                if farthest_distance(&self.points, &best) > 2.0 * delta {
                    improve_geometry = true;
                    continue;
                }
                if delta > rho {
                    continue;
                }
            }

            if rho <= rho_end {
                return Ok(Termination::Converged);
            }
            let rho_new = next_rho(rho, rho_end);
            delta = (0.5 * rho).max(rho_new);
            rho = rho_new;
            info!(
                "[optimizer] rho -> {:.3e} after {} evaluations, best {:.6e}",
                rho, self.evaluations, self.values[self.kopt]
            );
        }
    }

    /// Point whose removal keeps the set best poised for the new step,
    /// weighted toward points far from the current best.
    fn replacement_index(
        &self,
        system: &InterpolationSystem,
        center: &DVector<f64>,
        scaled_step: &DVector<f64>,
        delta: f64,
        improved: bool,
    ) -> usize {
        let mut best = (0usize, f64::NEG_INFINITY);
        for t in 0..self.points.len() {
            if t == self.kopt && !improved {
                continue;
            }
            let ell = system.lagrange_value(t, scaled_step).abs();
            let distance = (&self.points[t] - center).norm();
            let weight = (distance / delta).powi(2).max(1.0);
            let score = ell * weight;
            if score > best.1 {
                best = (t, score);
            }
        }
        best.0
    }

    /// Move the farthest point to where its Lagrange function is largest.
    fn geometry_step(
        &mut self,
        model: &mut QuadraticModel,
        center: &DVector<f64>,
        delta: f64,
        rho: f64,
    ) -> Result<bool, Stop> {
        let t = (0..self.points.len())
            .filter(|&i| i != self.kopt)
            .max_by(|&a, &b| {
                let da = (&self.points[a] - center).norm();
                let db = (&self.points[b] - center).norm();
                da.total_cmp(&db)
            })
            .unwrap_or(0);
        let distance = (&self.points[t] - center).norm();
        let radius = (0.1 * distance).min(delta).max(rho);

        let scale = farthest_distance(&self.points, center).max(rho);
        let Some(system) = InterpolationSystem::build(&self.points, center, scale) else {
            return Ok(false);
        };
        let d = maximize_lagrange(&system, t, radius / system.scale()) * system.scale();

        let x_new = center + d;
        let f_new = self.evaluate(&x_new)?;
        self.points[t] = x_new;
        self.values[t] = f_new;
        if f_new < self.values[self.kopt] {
            self.kopt = t;
        }
        Ok(model.refit(&self.points, &self.values))
    }
}

impl From<Stop> for Termination {
    fn from(stop: Stop) -> Self {
        match stop {
            Stop::Budget => Termination::BudgetExhausted,
            Stop::NonFinite => Termination::NonFiniteObjective,
        }
    }
}

/// Scaled step within `radius` maximizing |ℓₜ|.
fn maximize_lagrange(system: &InterpolationSystem, t: usize, radius: f64) -> DVector<f64> {
    let ell = system.lagrange(t);
    let down = trust_region_step(&ell.gradient, &ell.hessian, radius);
    let up = trust_region_step(&(-&ell.gradient), &(-&ell.hessian), radius);
    let value = |d: &DVector<f64>| system.lagrange_value(t, d).abs();

    let chosen = if value(&down) >= value(&up) { down } else { up };
    if chosen.norm() > 0.0 {
        chosen
    } else {
        let mut axis = DVector::zeros(ell.gradient.len());
        if !axis.is_empty() {
            axis[0] = radius;
        }
        axis
    }
}

/// Powell's schedule for shrinking the lower trust region bound.
fn next_rho(rho: f64, rho_end: f64) -> f64 {
    let ratio = rho / rho_end;
    if ratio <= 16.0 {
        rho_end
    } else if ratio <= 250.0 {
        ratio.sqrt() * rho_end
    } else {
        0.1 * rho
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn sphere(target: &[f64]) -> impl Fn(&DVector<f64>) -> f64 + '_ {
        move |x: &DVector<f64>| {
            x.iter()
                .zip(target)
                .map(|(a, b)| (a - b) * (a - b))
                .sum::<f64>()
        }
    }

    fn config(rho_begin: f64, rho_end: f64, max_evaluations: usize) -> OptimizerConfig {
        OptimizerConfig {
            interpolation_points: None,
            rho_begin,
            rho_end,
            max_evaluations,
        }
    }

    #[test]
    fn test_never_exceeds_budget() {
        for budget in [1, 3, 8, 10, 25] {
            let calls = Cell::new(0usize);
            let f = sphere(&[0.3, -0.2, 0.1, 0.4]);
            let result = TrustRegionOptimizer::new(config(0.1, 1e-8, budget))
                .minimize(&DVector::zeros(4), |x| {
                    calls.set(calls.get() + 1);
                    f(x)
                })
                .unwrap();
            assert!(calls.get() <= budget, "budget {budget} exceeded");
            assert_eq!(calls.get(), result.evaluations);
            assert_eq!(result.termination, Termination::BudgetExhausted);
        }
    }

    #[test]
    fn test_converges_on_quadratic() {
        let target = [0.3, -0.2, 0.1, 0.4];
        let result = TrustRegionOptimizer::new(config(0.1, 1e-6, 500))
            .minimize(&DVector::zeros(4), sphere(&target))
            .unwrap();
        for (x, t) in result.parameters.iter().zip(&target) {
            assert!((x - t).abs() < 1e-3, "{x} vs {t}");
        }
        assert!(result.cost < 1e-6);
        assert!(result.evaluations <= 500);
    }

    #[test]
    fn test_converges_on_scaled_quadratic() {
        // Ill-conditioned, rotated bowl
        let f = |x: &DVector<f64>| {
            let u = x[0] + x[1] - 1.0;
            let v = x[0] - x[1];
            10.0 * u * u + 0.5 * v * v + 2.0
        };
        let result = TrustRegionOptimizer::new(config(0.2, 1e-7, 400))
            .minimize(&DVector::from_vec(vec![-1.0, 2.0]), f)
            .unwrap();
        assert!((result.parameters[0] - 0.5).abs() < 5e-3);
        assert!((result.parameters[1] - 0.5).abs() < 5e-3);
        assert!(result.cost - 2.0 < 1e-4);
    }

    #[test]
    fn test_swapped_radii_are_equivalent() {
        let target = [0.05, 0.02, -0.03, 0.01];
        let a = TrustRegionOptimizer::new(config(0.05, 1e-5, 60))
            .minimize(&DVector::zeros(4), sphere(&target))
            .unwrap();
        let b = TrustRegionOptimizer::new(config(1e-5, 0.05, 60))
            .minimize(&DVector::zeros(4), sphere(&target))
            .unwrap();
        assert_eq!(a.parameters, b.parameters);
        assert_eq!(a.evaluations, b.evaluations);
        assert_eq!(a.termination, b.termination);
    }

    #[test]
    fn test_rejects_invalid_config() {
        let x0 = DVector::zeros(4);
        let bad_npt = OptimizerConfig {
            interpolation_points: Some(5),
            ..config(0.1, 1e-6, 10)
        };
        assert_eq!(
            TrustRegionOptimizer::new(bad_npt)
                .minimize(&x0, |_| 0.0)
                .unwrap_err(),
            OptimizerError::InterpolationCount {
                npt: 5,
                min: 6,
                max: 15
            }
        );
        assert_eq!(
            TrustRegionOptimizer::new(config(0.1, 1e-6, 0))
                .minimize(&x0, |_| 0.0)
                .unwrap_err(),
            OptimizerError::ZeroBudget
        );
        assert!(matches!(
            TrustRegionOptimizer::new(config(0.1, 0.0, 10)).minimize(&x0, |_| 0.0),
            Err(OptimizerError::InvalidRadius { .. })
        ));
        assert_eq!(
            TrustRegionOptimizer::new(config(0.1, 1e-6, 10))
                .minimize(&DVector::zeros(0), |_| 0.0)
                .unwrap_err(),
            OptimizerError::EmptyParameters
        );
    }

    #[test]
    fn test_stops_on_non_finite_objective() {
        let calls = Cell::new(0usize);
        let x0 = DVector::from_vec(vec![1.0, 2.0, 3.0, 4.0]);
        let result = TrustRegionOptimizer::new(config(0.1, 1e-6, 50))
            .minimize(&x0, |_| {
                calls.set(calls.get() + 1);
                if calls.get() == 1 {
                    5.0
                } else {
                    f64::NAN
                }
            })
            .unwrap();
        assert_eq!(result.termination, Termination::NonFiniteObjective);
        assert_eq!(result.evaluations, 2);
        assert_eq!(result.parameters, x0);
        assert_eq!(result.cost, 5.0);
    }

    #[test]
    fn test_explicit_interpolation_points() {
        let target = [0.1, 0.2];
        let cfg = OptimizerConfig {
            interpolation_points: Some(6),
            ..config(0.1, 1e-6, 200)
        };
        let result = TrustRegionOptimizer::new(cfg)
            .minimize(&DVector::zeros(2), sphere(&target))
            .unwrap();
        assert!(result.cost < 1e-6);
    }

    #[test]
    fn test_rho_schedule() {
        assert_eq!(next_rho(1e-5, 1e-6), 1e-6);
        assert!((next_rho(1e-4, 1e-6) - 1e-5).abs() < 1e-18);
        assert!((next_rho(1e-2, 1e-6) - 1e-3).abs() < 1e-15);
    }
}
