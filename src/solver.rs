//! Damped Gauss–Newton (Levenberg–Marquardt) iteration
//!
//! Solves the weighted normal equations `(JᵀJ + λI)·δ = Jᵀr` at each step,
//! where `J` and `r` are already weighted by the per-measurement standard
//! deviations. The damping factor λ interpolates between Gauss–Newton
//! (λ → 0) and gradient descent (λ → ∞): a step that reduces the weighted
//! sum of squares is accepted and λ shrinks, otherwise the step is rejected
//! and λ grows. Damping that grows past its cap without ever reducing the
//! cost is a fit failure, as is a normal-equations system that stays
//! singular under damping.

use log::{debug, trace};
use nalgebra::DVector;
use nalgebra::linalg::Cholesky;

use crate::error::CalibrationError;
use crate::model::{Evaluation, ResidualModel};
use crate::types::SolverSettings;

/// Converged solver state handed to the statistics stage.
pub(crate) struct SolverOutcome {
    /// Free parameters at convergence.
    pub params: DVector<f64>,
    /// Weighted residuals and Jacobian at convergence.
    pub evaluation: Evaluation,
    /// Weighted sum of squared residuals at convergence.
    pub cost: f64,
    /// Number of outer iterations performed.
    pub iterations: usize,
}

/// Minimize the weighted residual sum of squares starting from `x0`.
pub(crate) fn solve(
    model: &ResidualModel<'_>,
    x0: DVector<f64>,
    settings: &SolverSettings,
) -> Result<SolverOutcome, CalibrationError> {
    let mut x = x0;
    let mut evaluation = model
        .evaluate(&x)
        .ok_or(CalibrationError::SingularInitialMatrix)?;
    let mut cost = evaluation.residuals.norm_squared();
    let mut lambda = settings.initial_damping;
    let n = x.len();

    let mut iterations = 0;

    while iterations < settings.max_iterations {
        iterations += 1;

        let jtj = evaluation.jacobian.transpose() * &evaluation.jacobian;
        let gradient = evaluation.jacobian.transpose() * &evaluation.residuals;

        // Retry the step with growing damping until it reduces the cost.
        loop {
            let mut damped = jtj.clone();
            for k in 0..n {
                damped[(k, k)] += lambda;
            }

            let step = match Cholesky::new(damped) {
                Some(cholesky) => cholesky.solve(&gradient),
                None => {
                    // Not positive definite even with damping; grow λ and
                    // retry, or give up once the cap is hit.
                    lambda *= settings.damping_increase;
                    if lambda > settings.max_damping {
                        return Err(CalibrationError::SingularSystem);
                    }
                    continue;
                }
            };

            let step_norm = step.norm();
            let candidate = &x - &step;
            let candidate_cost = model.residuals(&candidate).map(|r| r.norm_squared());

            match candidate_cost {
                // A trial matrix that is singular or does not reduce the
                // cost is rejected the same way.
                Some(new_cost) if new_cost <= cost => {
                    trace!(
                        "iteration {}: accepted step, cost {:.6e} -> {:.6e}, lambda {:.1e}",
                        iterations, cost, new_cost, lambda
                    );

                    let improvement = cost - new_cost;
                    let small_improvement =
                        improvement <= settings.cost_tolerance * cost.max(f64::MIN_POSITIVE);
                    let small_step =
                        step_norm <= settings.step_tolerance * x.norm().max(settings.step_tolerance);
                    let converged = small_improvement || small_step;

                    x = candidate;
                    evaluation = model
                        .evaluate(&x)
                        .ok_or(CalibrationError::SingularSystem)?;
                    cost = new_cost;
                    lambda = (lambda * settings.damping_decrease).max(f64::MIN_POSITIVE);

                    if converged {
                        debug!(
                            "converged after {} iterations, cost {:.6e}",
                            iterations, cost
                        );
                        return Ok(SolverOutcome {
                            params: x,
                            evaluation,
                            cost,
                            iterations,
                        });
                    }
                    break;
                }
                _ => {
                    trace!(
                        "iteration {}: rejected step, cost {:.6e}, lambda {:.1e}",
                        iterations, cost, lambda
                    );
                    lambda *= settings.damping_increase;
                    if lambda > settings.max_damping {
                        return Err(CalibrationError::NoConvergence(iterations));
                    }
                }
            }
        }
    }

    Err(CalibrationError::NoConvergence(iterations))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::measurement::{Measurement, MeasurementSet};
    use nalgebra::{Matrix3, Vector3};

    fn spread_directions(count: usize) -> Vec<Vector3<f64>> {
        // Spiral points over the sphere, enough spread for a well-posed fit.
        (0..count)
            .map(|i| {
                let z = 1.0 - 2.0 * (i as f64 + 0.5) / count as f64;
                let radius = (1.0 - z * z).sqrt();
                let angle = 2.39996 * i as f64;
                Vector3::new(radius * angle.cos(), radius * angle.sin(), z)
            })
            .collect()
    }

    fn synthesize(
        matrix: &Matrix3<f64>,
        bias: Vector3<f64>,
        norm: f64,
        count: usize,
    ) -> MeasurementSet {
        spread_directions(count)
            .into_iter()
            .map(|dir| Measurement::new(matrix * (dir * norm) + bias, 1e-9).unwrap())
            .collect()
    }

    #[test]
    fn test_solver_recovers_upper_triangular_matrix() {
        let truth = Matrix3::new(
            1.04, 0.021, -0.013, //
            0.0, 0.982, 0.017, //
            0.0, 0.0, 1.025,
        );
        let bias = Vector3::new(4.0e-6, -2.5e-6, 1.5e-6);
        let norm = 52.8e-6;

        let set = synthesize(&truth, bias, norm, 12);
        let norms = vec![norm; set.len()];
        let model = ResidualModel::new(&set, bias, &norms, true);

        let x0 = model.params_from_matrix(&Matrix3::identity());
        let outcome = solve(&model, x0, &SolverSettings::default()).unwrap();

        let estimated = model.matrix_from_params(&outcome.params);
        for row in 0..3 {
            for col in 0..3 {
                assert!(
                    (estimated[(row, col)] - truth[(row, col)]).abs() < 1e-9,
                    "entry ({}, {}): estimated {}, truth {}",
                    row,
                    col,
                    estimated[(row, col)],
                    truth[(row, col)]
                );
            }
        }
        assert!(outcome.iterations > 0);
        assert!(outcome.cost >= 0.0);
    }

    #[test]
    fn test_solver_rejects_singular_initial_matrix() {
        let truth = Matrix3::identity();
        let bias = Vector3::zeros();
        let set = synthesize(&truth, bias, 50.0e-6, 12);
        let norms = vec![50.0e-6; set.len()];
        let model = ResidualModel::new(&set, bias, &norms, false);

        let x0 = model.params_from_matrix(&Matrix3::zeros());
        let result = solve(&model, x0, &SolverSettings::default());
        assert!(matches!(
            result,
            Err(CalibrationError::SingularInitialMatrix)
        ));
    }

    #[test]
    fn test_solver_converges_immediately_at_the_optimum() {
        let truth = Matrix3::new(
            1.02, 0.015, -0.011, //
            0.0, 0.99, 0.02, //
            0.0, 0.0, 1.01,
        );
        let bias = Vector3::new(1.0e-6, 2.0e-6, -3.0e-6);
        let norm = 49.7e-6;

        let set = synthesize(&truth, bias, norm, 10);
        let norms = vec![norm; set.len()];
        let model = ResidualModel::new(&set, bias, &norms, true);

        let x0 = model.params_from_matrix(&truth);
        let outcome = solve(&model, x0, &SolverSettings::default()).unwrap();

        // Starting at the optimum must not diverge or error out.
        let estimated = model.matrix_from_params(&outcome.params);
        assert!((estimated - truth).norm() < 1e-9);
    }
}
