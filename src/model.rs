//! Residual model for the magnitude-constrained calibration fit
//!
//! Each measurement contributes one scalar equation
//!
//! ```text
//! r = (‖M⁻¹·(raw − bias)‖ − norm) / stddev
//! ```
//!
//! where `M` is the cross-axis sensitivity matrix being estimated. Only the
//! magnitude of the reference field is known, not its direction, so the
//! problem is nonlinear in `M` and is solved iteratively. This module packs
//! the free entries of `M` into a parameter vector, evaluates the weighted
//! residual vector, and builds its analytic Jacobian.

use nalgebra::{DMatrix, DVector, Matrix3, Vector3};

use crate::measurement::MeasurementSet;

/// Free parameters of the general fit, column-major entries of `M`.
const GENERAL_INDICES: [usize; 9] = [0, 1, 2, 3, 4, 5, 6, 7, 8];

/// Free parameters of the common-axis fit: the entries on and above the
/// diagonal, column-major. The three below-diagonal cross couplings are
/// structurally zero, making `M` upper triangular.
const COMMON_AXIS_INDICES: [usize; 6] = [0, 3, 4, 6, 7, 8];

/// Column-major full indices of the entries fixed to zero under the
/// common-axis constraint.
#[cfg(test)]
pub(crate) const COMMON_AXIS_FIXED_INDICES: [usize; 3] = [1, 2, 5];

/// Residual vector and weighted Jacobian at one parameter point.
pub(crate) struct Evaluation {
    /// Weighted residuals, one per measurement.
    pub residuals: DVector<f64>,
    /// Weighted Jacobian, measurements × free parameters.
    pub jacobian: DMatrix<f64>,
}

/// The nonlinear measurement model shared by every solver iteration.
///
/// Borrows the measurement set and resolved per-measurement reference norms;
/// the bias is fixed for the whole fit.
pub(crate) struct ResidualModel<'a> {
    measurements: &'a MeasurementSet,
    bias: Vector3<f64>,
    norms: &'a [f64],
    common_axis: bool,
}

impl<'a> ResidualModel<'a> {
    pub(crate) fn new(
        measurements: &'a MeasurementSet,
        bias: Vector3<f64>,
        norms: &'a [f64],
        common_axis: bool,
    ) -> Self {
        debug_assert_eq!(measurements.len(), norms.len());
        Self {
            measurements,
            bias,
            norms,
            common_axis,
        }
    }

    /// Number of free parameters: 9 general, 6 common-axis.
    pub(crate) fn parameter_count(&self) -> usize {
        self.free_indices().len()
    }

    /// Column-major full indices of the free entries of `M`.
    pub(crate) fn free_indices(&self) -> &'static [usize] {
        if self.common_axis {
            &COMMON_AXIS_INDICES
        } else {
            &GENERAL_INDICES
        }
    }

    /// Pack the free entries of `M` into a parameter vector.
    ///
    /// Under the common-axis constraint the below-diagonal entries of the
    /// input are ignored; they are structurally zero.
    pub(crate) fn params_from_matrix(&self, matrix: &Matrix3<f64>) -> DVector<f64> {
        let indices = self.free_indices();
        DVector::from_fn(indices.len(), |k, _| {
            let (row, col) = (indices[k] % 3, indices[k] / 3);
            matrix[(row, col)]
        })
    }

    /// Rebuild `M` from a parameter vector; fixed entries are zero.
    pub(crate) fn matrix_from_params(&self, params: &DVector<f64>) -> Matrix3<f64> {
        let mut matrix = Matrix3::zeros();
        for (k, &full) in self.free_indices().iter().enumerate() {
            let (row, col) = (full % 3, full / 3);
            matrix[(row, col)] = params[k];
        }
        matrix
    }

    /// Weighted residual vector at `params`, or `None` if `M` is singular.
    pub(crate) fn residuals(&self, params: &DVector<f64>) -> Option<DVector<f64>> {
        let matrix = self.matrix_from_params(params);
        let inverse = matrix.try_inverse()?;

        let mut residuals = DVector::zeros(self.measurements.len());
        for (i, measurement) in self.measurements.iter().enumerate() {
            let corrected = inverse * (measurement.raw() - self.bias);
            residuals[i] = (corrected.norm() - self.norms[i]) / measurement.stddev();
        }

        Some(residuals)
    }

    /// Weighted residuals and analytic Jacobian at `params`, or `None` if
    /// `M` is singular.
    ///
    /// With `v = raw − bias`, `u = M⁻¹v`, `û = u/‖u‖`, and `w = M⁻ᵀû`, the
    /// derivative of `‖u‖` through the matrix inverse is
    /// `∂‖u‖/∂M[j,k] = −w_j·u_k` (from `dM⁻¹ = −M⁻¹·dM·M⁻¹`).
    pub(crate) fn evaluate(&self, params: &DVector<f64>) -> Option<Evaluation> {
        let matrix = self.matrix_from_params(params);
        let inverse = matrix.try_inverse()?;
        let inverse_t = inverse.transpose();

        let count = self.measurements.len();
        let indices = self.free_indices();

        let mut residuals = DVector::zeros(count);
        let mut jacobian = DMatrix::zeros(count, indices.len());

        for (i, measurement) in self.measurements.iter().enumerate() {
            let weight = 1.0 / measurement.stddev();
            let u = inverse * (measurement.raw() - self.bias);
            let norm_u = u.norm();

            residuals[i] = (norm_u - self.norms[i]) * weight;

            // A zero corrected vector has no defined direction; its
            // magnitude gradient is left at zero.
            if norm_u > 0.0 {
                let w = inverse_t * (u / norm_u);
                for (k, &full) in indices.iter().enumerate() {
                    let (row, col) = (full % 3, full / 3);
                    jacobian[(i, k)] = -w[row] * u[col] * weight;
                }
            }
        }

        Some(Evaluation {
            residuals,
            jacobian,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::measurement::Measurement;
    use approx::assert_relative_eq;

    fn test_matrix() -> Matrix3<f64> {
        Matrix3::new(
            1.05, 0.02, -0.015, //
            0.01, 0.97, 0.025, //
            -0.02, 0.015, 1.03,
        )
    }

    fn test_set() -> MeasurementSet {
        [
            Vector3::new(48.0e-6, 3.0e-6, -21.0e-6),
            Vector3::new(-12.0e-6, 44.0e-6, 17.0e-6),
            Vector3::new(25.0e-6, -30.0e-6, 28.0e-6),
        ]
        .into_iter()
        .map(|raw| Measurement::new(raw, 1e-9).unwrap())
        .collect()
    }

    #[test]
    fn test_general_pack_unpack_round_trip() {
        let set = test_set();
        let norms = [50.0e-6; 3];
        let model = ResidualModel::new(&set, Vector3::zeros(), &norms, false);

        let matrix = test_matrix();
        let params = model.params_from_matrix(&matrix);
        assert_eq!(params.len(), 9);

        let rebuilt = model.matrix_from_params(&params);
        assert_eq!(rebuilt, matrix);
    }

    #[test]
    fn test_common_axis_pack_zeroes_lower_triangle() {
        let set = test_set();
        let norms = [50.0e-6; 3];
        let model = ResidualModel::new(&set, Vector3::zeros(), &norms, true);

        let params = model.params_from_matrix(&test_matrix());
        assert_eq!(params.len(), 6);

        let rebuilt = model.matrix_from_params(&params);
        // Upper triangle survives, lower triangle is structurally zero.
        assert_eq!(rebuilt[(0, 1)], 0.02);
        assert_eq!(rebuilt[(0, 2)], -0.015);
        assert_eq!(rebuilt[(1, 2)], 0.025);
        assert_eq!(rebuilt[(1, 0)], 0.0);
        assert_eq!(rebuilt[(2, 0)], 0.0);
        assert_eq!(rebuilt[(2, 1)], 0.0);
    }

    #[test]
    fn test_residual_is_zero_for_exact_model() {
        let matrix = test_matrix();
        let bias = Vector3::new(5.0e-6, -3.0e-6, 2.0e-6);
        let norm = 50.0e-6;

        // Synthesize raw = M·field + bias from fields of known magnitude.
        let directions = [
            Vector3::new(1.0, 0.0, 0.0),
            Vector3::new(0.0, 1.0, 0.0),
            Vector3::new(0.6, -0.64, 0.48),
        ];
        let set: MeasurementSet = directions
            .iter()
            .map(|dir| {
                let field = dir.normalize() * norm;
                Measurement::new(matrix * field + bias, 1e-9).unwrap()
            })
            .collect();

        let norms = [norm; 3];
        let model = ResidualModel::new(&set, bias, &norms, false);
        let params = model.params_from_matrix(&matrix);
        let residuals = model.residuals(&params).unwrap();

        for i in 0..3 {
            assert!(
                residuals[i].abs() < 1e-6,
                "residual {} should vanish for exact data, got {}",
                i,
                residuals[i]
            );
        }
    }

    #[test]
    fn test_analytic_jacobian_matches_finite_differences() {
        let set = test_set();
        let norms = [50.0e-6, 49.5e-6, 50.5e-6];
        let bias = Vector3::new(2.0e-6, -1.0e-6, 3.0e-6);

        for common_axis in [false, true] {
            let model = ResidualModel::new(&set, bias, &norms, common_axis);
            let params = model.params_from_matrix(&test_matrix());
            let evaluation = model.evaluate(&params).unwrap();

            let step = 1e-7;
            for k in 0..model.parameter_count() {
                let mut plus = params.clone();
                let mut minus = params.clone();
                plus[k] += step;
                minus[k] -= step;

                let r_plus = model.residuals(&plus).unwrap();
                let r_minus = model.residuals(&minus).unwrap();

                for i in 0..set.len() {
                    let numeric = (r_plus[i] - r_minus[i]) / (2.0 * step);
                    assert_relative_eq!(
                        evaluation.jacobian[(i, k)],
                        numeric,
                        max_relative = 1e-5,
                        epsilon = 1e-3
                    );
                }
            }
        }
    }

    #[test]
    fn test_singular_matrix_is_reported() {
        let set = test_set();
        let norms = [50.0e-6; 3];
        let model = ResidualModel::new(&set, Vector3::zeros(), &norms, false);

        let params = model.params_from_matrix(&Matrix3::zeros());
        assert!(model.residuals(&params).is_none());
        assert!(model.evaluate(&params).is_none());
    }
}
