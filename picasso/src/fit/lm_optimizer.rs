//! Levenberg-Marquardt optimizer for PSF fitting.
//!
//! Generic over the model's parameter count and shared by all PSF variants.
//! Uses f64 throughout for numerical stability. Parameters are a plain array
//! owned by the call, so candidates can be fit in parallel.

use super::FitRejection;
use super::linear_solver::solve;
use crate::config::FitObjective;
use crate::psf::PsfModel;

/// Floor on the expected count, keeping the Poisson terms finite.
pub const MIN_EXPECTED: f64 = 1e-6;

/// Added to the damped diagonal so a zero column cannot make the system singular.
const DIAGONAL_EPSILON: f64 = 1e-12;

/// Configuration for Levenberg-Marquardt optimization.
#[derive(Debug, Clone)]
pub struct LmConfig {
    pub max_iterations: usize,
    /// Threshold for both the relative parameter step and the relative
    /// objective improvement.
    pub tolerance: f64,
    pub objective: FitObjective,
    /// Initial damping parameter.
    pub initial_lambda: f64,
    /// Factor to increase lambda on a failed step.
    pub lambda_up: f64,
    /// Factor to decrease lambda on a successful step.
    pub lambda_down: f64,
    /// Damping beyond this means no descent direction is left.
    pub max_lambda: f64,
    /// Out-of-bounds trial steps tolerated over one fit. A fit that keeps
    /// stepping out is pressed against a bound and is rejected with its reason.
    pub max_bound_violations: usize,
}

impl Default for LmConfig {
    fn default() -> Self {
        Self {
            max_iterations: 50,
            tolerance: 1e-6,
            objective: FitObjective::PoissonMle,
            initial_lambda: 0.001,
            lambda_up: 10.0,
            lambda_down: 0.1,
            max_lambda: 1e10,
            max_bound_violations: 4,
        }
    }
}

/// Converged parameters.
#[derive(Debug, Clone, Copy)]
pub struct LmResult<const N: usize> {
    pub params: [f64; N],
    /// Final objective: Poisson deviance or sum of squared residuals.
    pub objective: f64,
    pub iterations: usize,
}

/// Fit `model` to the samples `data_z` at offsets `(data_x, data_y)`.
///
/// Every trial step is projected with [`PsfModel::constrain`]; a step that
/// still violates a bound is retried with more damping. More than
/// `max_bound_violations` such steps reject the fit with the bound's reason.
pub fn optimize<const N: usize, M: PsfModel<N>>(
    model: &M,
    data_x: &[f64],
    data_y: &[f64],
    data_z: &[f64],
    initial_params: [f64; N],
    config: &LmConfig,
) -> Result<LmResult<N>, FitRejection> {
    if let Some(reason) = model.bounds_violation(&initial_params) {
        return Err(reason);
    }

    let mut params = initial_params;
    let mut objective = compute_objective(model, data_x, data_y, data_z, &params, config.objective);
    if !objective.is_finite() {
        return Err(FitRejection::NonFinite);
    }

    let mut lambda = config.initial_lambda;
    let mut bound_violations = 0;

    for iter in 0..config.max_iterations {
        let iterations = iter + 1;

        let (hessian, gradient) =
            normal_equations(model, data_x, data_y, data_z, &params, config.objective);

        let mut damped_hessian = hessian;
        for (i, row) in damped_hessian.iter_mut().enumerate() {
            row[i] += lambda * row[i] + DIAGONAL_EPSILON;
        }

        let Some(delta) = solve(&damped_hessian, &gradient) else {
            lambda *= config.lambda_up;
            if lambda > config.max_lambda {
                return Err(FitRejection::NotConverged);
            }
            continue;
        };

        let mut trial = params;
        for (p, d) in trial.iter_mut().zip(delta.iter()) {
            *p += d;
        }
        model.constrain(&mut trial);

        if let Some(reason) = model.bounds_violation(&trial) {
            bound_violations += 1;
            if bound_violations > config.max_bound_violations {
                return Err(reason);
            }
            lambda *= config.lambda_up;
            if lambda > config.max_lambda {
                return Err(FitRejection::NotConverged);
            }
            continue;
        }

        let trial_objective =
            compute_objective(model, data_x, data_y, data_z, &trial, config.objective);
        let step = relative_step(&delta, &params);

        if trial_objective.is_finite() && trial_objective < objective {
            let improvement = (objective - trial_objective) / objective.max(f64::MIN_POSITIVE);
            params = trial;
            objective = trial_objective;
            lambda *= config.lambda_down;

            if step < config.tolerance || improvement < config.tolerance {
                return Ok(LmResult {
                    params,
                    objective,
                    iterations,
                });
            }
        } else {
            // No improvement from a step below the tolerance: stationary point.
            if step < config.tolerance {
                return Ok(LmResult {
                    params,
                    objective,
                    iterations,
                });
            }
            lambda *= config.lambda_up;
            if lambda > config.max_lambda {
                return Err(FitRejection::NotConverged);
            }
        }
    }

    Err(FitRejection::NotConverged)
}

/// Largest parameter change relative to the parameter's magnitude (at least 1).
#[inline]
fn relative_step<const N: usize>(delta: &[f64; N], params: &[f64; N]) -> f64 {
    delta
        .iter()
        .zip(params.iter())
        .map(|(d, p)| d.abs() / p.abs().max(1.0))
        .fold(0.0f64, f64::max)
}

/// Poisson deviance contribution of one pixel with `k` observed and `mu` expected.
#[inline]
pub fn poisson_deviance(k: f64, mu: f64) -> f64 {
    let mu = mu.max(MIN_EXPECTED);
    if k > 0.0 {
        2.0 * (mu - k - k * (mu / k).ln())
    } else {
        2.0 * mu
    }
}

/// Objective of `params` over the window.
pub fn compute_objective<const N: usize, M: PsfModel<N>>(
    model: &M,
    data_x: &[f64],
    data_y: &[f64],
    data_z: &[f64],
    params: &[f64; N],
    objective: FitObjective,
) -> f64 {
    let samples = data_x.iter().zip(data_y.iter()).zip(data_z.iter());
    match objective {
        FitObjective::PoissonMle => samples
            .map(|((&x, &y), &k)| poisson_deviance(k, model.evaluate(x, y, params)))
            .sum(),
        FitObjective::LeastSquares => samples
            .map(|((&x, &y), &k)| {
                let residual = k - model.evaluate(x, y, params);
                residual * residual
            })
            .sum(),
    }
}

/// Weighted normal equations `(Σ w·JJᵀ, Σ w·J·r)`.
///
/// Poisson weights are `1/μ`, which makes the matrix the Fisher information and
/// the vector the descent direction of the deviance. Least squares uses unit
/// weights. Only the upper triangle is accumulated, then mirrored.
#[allow(clippy::needless_range_loop)]
pub fn normal_equations<const N: usize, M: PsfModel<N>>(
    model: &M,
    data_x: &[f64],
    data_y: &[f64],
    data_z: &[f64],
    params: &[f64; N],
    objective: FitObjective,
) -> ([[f64; N]; N], [f64; N]) {
    let mut hessian = [[0.0f64; N]; N];
    let mut gradient = [0.0f64; N];

    for ((&x, &y), &k) in data_x.iter().zip(data_y.iter()).zip(data_z.iter()) {
        let (mu, row) = model.evaluate_and_jacobian(x, y, params);
        let (weight, residual) = match objective {
            FitObjective::PoissonMle => {
                let mu = mu.max(MIN_EXPECTED);
                (1.0 / mu, k - mu)
            }
            FitObjective::LeastSquares => (1.0, k - mu),
        };

        for i in 0..N {
            let weighted = weight * row[i];
            gradient[i] += weighted * residual;
            for j in i..N {
                hessian[i][j] += weighted * row[j];
            }
        }
    }

    for i in 1..N {
        for j in 0..i {
            hessian[i][j] = hessian[j][i];
        }
    }

    (hessian, gradient)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::psf::{PsfBounds, SymmetricGaussian};

    fn model() -> SymmetricGaussian {
        SymmetricGaussian::new(PsfBounds {
            window_radius: 4.0,
            min_sigma: 0.4,
        })
    }

    fn sample_grid(truth: &[f64; 5]) -> (Vec<f64>, Vec<f64>, Vec<f64>) {
        let model = model();
        let mut xs = Vec::new();
        let mut ys = Vec::new();
        let mut zs = Vec::new();
        for y in -4..=4 {
            for x in -4..=4 {
                xs.push(x as f64);
                ys.push(y as f64);
                zs.push(model.evaluate(x as f64, y as f64, truth));
            }
        }
        (xs, ys, zs)
    }

    #[test]
    fn test_poisson_deviance_zero_at_match() {
        assert!(poisson_deviance(12.0, 12.0).abs() < 1e-12);
        assert!(poisson_deviance(12.0, 15.0) > 0.0);
        assert!(poisson_deviance(12.0, 9.0) > 0.0);
        assert_eq!(poisson_deviance(0.0, 3.0), 6.0);
    }

    #[test]
    fn test_recovers_exact_parameters() {
        let truth = [0.35, -0.6, 1800.0, 9.0, 1.25];
        let (xs, ys, zs) = sample_grid(&truth);
        let start = [0.0, 0.0, 1500.0, 8.0, 1.5];

        for objective in [FitObjective::PoissonMle, FitObjective::LeastSquares] {
            let config = LmConfig {
                objective,
                ..Default::default()
            };
            let result = optimize(&model(), &xs, &ys, &zs, start, &config).unwrap();
            for (fitted, expected) in result.params.iter().zip(truth.iter()) {
                assert!(
                    (fitted - expected).abs() <= 1e-3 * expected.abs().max(1.0),
                    "{objective:?}: {:?} vs {truth:?}",
                    result.params
                );
            }
            assert!(result.iterations >= 1);
            assert!(result.iterations <= config.max_iterations);
        }
    }

    #[test]
    fn test_invalid_start_is_rejected() {
        let (xs, ys, zs) = sample_grid(&[0.0, 0.0, 1000.0, 5.0, 1.3]);
        let result = optimize(
            &model(),
            &xs,
            &ys,
            &zs,
            [0.0, 0.0, -10.0, 5.0, 1.3],
            &LmConfig::default(),
        );
        assert_eq!(result.unwrap_err(), FitRejection::NegativeIntensity);
    }

    #[test]
    fn test_iteration_limit_reports_not_converged() {
        let (xs, ys, zs) = sample_grid(&[0.5, 0.5, 1000.0, 5.0, 1.3]);
        let config = LmConfig {
            max_iterations: 1,
            ..Default::default()
        };
        let result = optimize(&model(), &xs, &ys, &zs, [0.0, 0.0, 700.0, 6.0, 1.6], &config);
        assert_eq!(result.unwrap_err(), FitRejection::NotConverged);
    }

    #[test]
    fn test_point_source_collapses_width() {
        // A single bright pixel: the best Gaussian is narrower than any bound.
        let xs: Vec<f64> = (-4..=4).flat_map(|_| -4..=4).map(f64::from).collect();
        let ys: Vec<f64> = (-4..=4).flat_map(|y| std::iter::repeat_n(y, 9)).map(f64::from).collect();
        let zs: Vec<f64> = xs
            .iter()
            .zip(ys.iter())
            .map(|(&x, &y)| if x == 0.0 && y == 0.0 { 2010.0 } else { 10.0 })
            .collect();
        let config = LmConfig {
            max_iterations: 200,
            ..Default::default()
        };

        let result = optimize(&model(), &xs, &ys, &zs, [0.0, 0.0, 2000.0, 10.0, 1.3], &config);

        assert_eq!(result.unwrap_err(), FitRejection::WidthCollapsed);
    }

    #[test]
    fn test_normal_equations_are_symmetric() {
        let params = [0.2, -0.1, 1000.0, 5.0, 1.3];
        let (xs, ys, zs) = sample_grid(&[0.0, 0.0, 900.0, 6.0, 1.2]);
        for objective in [FitObjective::PoissonMle, FitObjective::LeastSquares] {
            let (h, _) = normal_equations(&model(), &xs, &ys, &zs, &params, objective);
            for i in 0..5 {
                assert!(h[i][i] > 0.0);
                for j in 0..5 {
                    assert_eq!(h[i][j], h[j][i]);
                }
            }
        }
    }
}
