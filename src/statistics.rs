//! Goodness-of-fit statistics derived from the converged solver state

use nalgebra::{Matrix3, SMatrix};

use crate::error::CalibrationError;
use crate::solver::SolverOutcome;

/// Result of a successful calibration.
///
/// Committed atomically by `calibrate()`: either every field reflects the
/// new fit, or a previous result (if any) is left untouched.
#[derive(Debug, Clone, PartialEq)]
pub struct EstimationResult {
    /// Estimated cross-axis sensitivity matrix.
    pub matrix: Matrix3<f64>,
    /// Covariance of the nine matrix entries, column-major ordering.
    ///
    /// Under the common-axis constraint the rows and columns of the three
    /// structurally zero entries are exactly 0.0.
    pub covariance: SMatrix<f64, 9, 9>,
    /// Weighted residual sum of squares at convergence.
    pub chi_sq: f64,
    /// Chi-square per degree of freedom (measurements − free parameters).
    pub mse: f64,
}

/// Derive covariance, chi-square, and MSE from the converged state.
///
/// The covariance is `mse · (JᵀJ)⁻¹` on the free parameters (the Jacobian
/// is already weighted, so `JᵀJ` is the weighted normal matrix),
/// symmetrized against rounding asymmetry and embedded into the full 9×9
/// entry ordering.
pub(crate) fn derive(
    matrix: Matrix3<f64>,
    outcome: &SolverOutcome,
    free_indices: &[usize],
    measurement_count: usize,
) -> Result<EstimationResult, CalibrationError> {
    let parameter_count = free_indices.len();
    debug_assert!(measurement_count > parameter_count);

    let chi_sq = outcome.cost;
    let degrees_of_freedom = (measurement_count - parameter_count) as f64;
    let mse = chi_sq / degrees_of_freedom;

    let normal = outcome.evaluation.jacobian.transpose() * &outcome.evaluation.jacobian;
    let inverse = normal
        .try_inverse()
        .ok_or(CalibrationError::SingularSystem)?;

    let mut covariance = SMatrix::<f64, 9, 9>::zeros();
    for (a, &full_a) in free_indices.iter().enumerate() {
        for (b, &full_b) in free_indices.iter().enumerate() {
            // Symmetrize while embedding; the inverse can pick up rounding
            // asymmetry of a few ulps.
            covariance[(full_a, full_b)] = mse * 0.5 * (inverse[(a, b)] + inverse[(b, a)]);
        }
    }

    Ok(EstimationResult {
        matrix,
        covariance,
        chi_sq,
        mse,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::COMMON_AXIS_FIXED_INDICES;
    use crate::solver::SolverOutcome;
    use nalgebra::{DMatrix, DVector};

    fn fake_outcome(measurements: usize, parameters: usize) -> SolverOutcome {
        // Full-column-rank Jacobian with distinct, well-conditioned rows.
        let jacobian = DMatrix::from_fn(measurements, parameters, |i, k| {
            1.0 / (1.0 + i as f64 + k as f64) + if i == k { 1.0 } else { 0.0 }
        });
        let residuals = DVector::from_fn(measurements, |i, _| 0.1 * (i as f64 + 1.0));
        let cost = residuals.norm_squared();

        SolverOutcome {
            params: DVector::zeros(parameters),
            evaluation: crate::model::Evaluation {
                residuals,
                jacobian,
            },
            cost,
            iterations: 1,
        }
    }

    #[test]
    fn test_chi_square_and_mse() {
        let outcome = fake_outcome(10, 6);
        let free: Vec<usize> = vec![0, 3, 4, 6, 7, 8];
        let result = derive(Matrix3::identity(), &outcome, &free, 10).unwrap();

        let expected_chi_sq: f64 = (1..=10).map(|i| (0.1 * i as f64).powi(2)).sum();
        assert!((result.chi_sq - expected_chi_sq).abs() < 1e-12);
        assert!((result.mse - expected_chi_sq / 4.0).abs() < 1e-12);
    }

    #[test]
    fn test_common_axis_embedding_zeroes_fixed_rows_and_columns() {
        let outcome = fake_outcome(10, 6);
        let free: Vec<usize> = vec![0, 3, 4, 6, 7, 8];
        let result = derive(Matrix3::identity(), &outcome, &free, 10).unwrap();

        for &fixed in &COMMON_AXIS_FIXED_INDICES {
            for k in 0..9 {
                assert_eq!(result.covariance[(fixed, k)], 0.0);
                assert_eq!(result.covariance[(k, fixed)], 0.0);
            }
        }

        // Free-parameter variances are populated and positive.
        for &free_index in &free {
            assert!(result.covariance[(free_index, free_index)] > 0.0);
        }
    }

    #[test]
    fn test_covariance_is_symmetric() {
        let outcome = fake_outcome(12, 9);
        let free: Vec<usize> = (0..9).collect();
        let result = derive(Matrix3::identity(), &outcome, &free, 12).unwrap();

        for a in 0..9 {
            for b in 0..9 {
                assert_eq!(result.covariance[(a, b)], result.covariance[(b, a)]);
            }
        }
    }
}
