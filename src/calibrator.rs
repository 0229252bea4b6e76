//! Magnetometer calibrator with a ready/running state machine
//!
//! Ties the measurement model, the Levenberg–Marquardt solver, and the
//! fit statistics together behind a single configuration surface. All
//! mutators are guarded by the running flag: while a `calibrate()` call is
//! in progress every configuration change fails with a locked-state error
//! and leaves prior state untouched.

use log::{debug, info};
use nalgebra::{Matrix3, SMatrix, Vector3};

use crate::error::CalibrationError;
use crate::measurement::MeasurementSet;
use crate::model::ResidualModel;
use crate::solver;
use crate::statistics::{self, EstimationResult};
use crate::types::{CalibrationListener, CalibratorState, ReferenceNorm, SolverSettings};

/// Minimum number of measurements for a well-posed fit.
///
/// One more than the number of free matrix parameters, so the
/// normal-equations system has more equations than unknowns: 10 for the
/// general fit, 7 under the common-axis constraint.
pub fn minimum_required(common_axis: bool) -> usize {
    if common_axis { 7 } else { 10 }
}

/// Nonlinear least-squares estimator of a magnetometer's cross-axis
/// sensitivity matrix.
///
/// Given raw body-frame measurements, a known hard-iron bias, and the known
/// reference field magnitude at each measurement, `calibrate()` fits the
/// 3×3 soft-iron matrix `M` in the measurement model
/// `raw = M·field + bias`, propagates measurement noise into a 9×9
/// parameter covariance, and reports chi-square and MSE goodness-of-fit.
///
/// # Example
/// ```
/// use nalgebra::{Matrix3, Vector3};
/// use mag_calib::{MagnetometerCalibrator, Measurement, MeasurementSet, minimum_required};
///
/// // The true sensor response: upper-triangular soft iron, known bias.
/// let truth = Matrix3::new(
///     1.04, 0.02, -0.01,
///     0.0, 0.98, 0.015,
///     0.0, 0.0, 1.02,
/// );
/// let bias = Vector3::new(4.0e-6, -2.0e-6, 1.0e-6); // tesla
/// let norm = 52.8e-6; // tesla, e.g. from a geomagnetic model
///
/// // Synthesize measurements from well-spread orientations.
/// let set: MeasurementSet = (0..minimum_required(true))
///     .map(|i| {
///         let z = 1.0 - 2.0 * (i as f64 + 0.5) / 7.0;
///         let r = (1.0f64 - z * z).sqrt();
///         let a = 2.39996 * i as f64;
///         let field = Vector3::new(r * a.cos(), r * a.sin(), z) * norm;
///         Measurement::new(truth * field + bias, 1e-9).unwrap()
///     })
///     .collect();
///
/// let mut calibrator = MagnetometerCalibrator::new();
/// calibrator.set_common_axis(true).unwrap();
/// calibrator.set_measurements(set).unwrap();
/// calibrator.set_bias(bias).unwrap();
/// calibrator.set_reference_norm(norm).unwrap();
/// assert!(calibrator.is_ready());
///
/// calibrator.calibrate().unwrap();
/// let estimated = calibrator.estimated_matrix().unwrap();
/// assert!((estimated - truth).norm() < 1e-9);
/// ```
pub struct MagnetometerCalibrator {
    /// Measurements for the next `calibrate()` call.
    measurements: MeasurementSet,
    /// Known hard-iron bias in tesla; required before calibrating.
    bias: Option<Vector3<f64>>,
    /// Starting point for the iteration.
    initial_matrix: Matrix3<f64>,
    /// Whether the three below-diagonal cross couplings are fixed to zero.
    common_axis: bool,
    /// Known reference field magnitude source; required before calibrating.
    reference_norm: Option<ReferenceNorm>,
    /// Optional start/end observer.
    listener: Option<Box<dyn CalibrationListener>>,
    /// Solver tuning.
    settings: SolverSettings,
    /// Lock flag for the duration of `calibrate()`.
    running: bool,
    /// Last successful fit, replaced wholesale on each success.
    result: Option<EstimationResult>,
}

impl MagnetometerCalibrator {
    /// Create a calibrator with default solver settings.
    ///
    /// The initial matrix defaults to identity; bias and reference norm
    /// start unset, so the calibrator is not ready until they are provided.
    pub fn new() -> Self {
        Self::with_settings(SolverSettings::default())
    }

    /// Create a calibrator with specific solver settings.
    pub fn with_settings(settings: SolverSettings) -> Self {
        Self {
            measurements: MeasurementSet::new(),
            bias: None,
            initial_matrix: Matrix3::identity(),
            common_axis: false,
            reference_norm: None,
            listener: None,
            settings,
            running: false,
            result: None,
        }
    }

    fn ensure_unlocked(&self) -> Result<(), CalibrationError> {
        if self.running {
            Err(CalibrationError::Locked)
        } else {
            Ok(())
        }
    }

    /// Replace the measurement set.
    pub fn set_measurements(&mut self, measurements: MeasurementSet) -> Result<(), CalibrationError> {
        self.ensure_unlocked()?;
        self.measurements = measurements;
        Ok(())
    }

    /// The configured measurement set.
    pub fn measurements(&self) -> &MeasurementSet {
        &self.measurements
    }

    /// Set the known hard-iron bias from a 3-vector (tesla).
    pub fn set_bias(&mut self, bias: Vector3<f64>) -> Result<(), CalibrationError> {
        self.ensure_unlocked()?;
        self.bias = Some(bias);
        Ok(())
    }

    /// Set the known hard-iron bias from three scalar coordinates (tesla).
    pub fn set_bias_coordinates(
        &mut self,
        x: f64,
        y: f64,
        z: f64,
    ) -> Result<(), CalibrationError> {
        self.set_bias(Vector3::new(x, y, z))
    }

    /// Set the known hard-iron bias from a slice (tesla).
    ///
    /// # Errors
    /// Returns [`CalibrationError::InvalidSize`] unless the slice has
    /// exactly 3 elements; the previous bias is left untouched.
    pub fn set_bias_slice(&mut self, bias: &[f64]) -> Result<(), CalibrationError> {
        self.ensure_unlocked()?;
        if bias.len() != 3 {
            return Err(CalibrationError::InvalidSize {
                expected: 3,
                actual: bias.len(),
            });
        }
        self.bias = Some(Vector3::new(bias[0], bias[1], bias[2]));
        Ok(())
    }

    /// The configured hard-iron bias, if set.
    pub fn bias(&self) -> Option<Vector3<f64>> {
        self.bias
    }

    /// The configured hard-iron bias as scalar coordinates, if set.
    pub fn bias_coordinates(&self) -> Option<(f64, f64, f64)> {
        self.bias.map(|b| (b.x, b.y, b.z))
    }

    /// Enable or disable the common-axis constraint.
    ///
    /// When enabled, the three cross couplings below the diagonal are held
    /// at zero, reducing the free parameters from 9 to 6 and the minimum
    /// measurement count from 10 to 7.
    pub fn set_common_axis(&mut self, common_axis: bool) -> Result<(), CalibrationError> {
        self.ensure_unlocked()?;
        self.common_axis = common_axis;
        Ok(())
    }

    /// Whether the common-axis constraint is enabled.
    pub fn is_common_axis(&self) -> bool {
        self.common_axis
    }

    /// Set the iteration starting point.
    ///
    /// Under the common-axis constraint, entries below the diagonal are
    /// ignored; those parameters are structurally zero.
    pub fn set_initial_matrix(&mut self, matrix: Matrix3<f64>) -> Result<(), CalibrationError> {
        self.ensure_unlocked()?;
        self.initial_matrix = matrix;
        Ok(())
    }

    /// Set the iteration starting point from a 9-element row-major slice.
    ///
    /// # Errors
    /// Returns [`CalibrationError::InvalidSize`] unless the slice has
    /// exactly 9 elements; the previous matrix is left untouched.
    pub fn set_initial_matrix_slice(&mut self, entries: &[f64]) -> Result<(), CalibrationError> {
        self.ensure_unlocked()?;
        if entries.len() != 9 {
            return Err(CalibrationError::InvalidSize {
                expected: 9,
                actual: entries.len(),
            });
        }
        self.initial_matrix = Matrix3::from_row_slice(entries);
        Ok(())
    }

    /// The configured iteration starting point.
    pub fn initial_matrix(&self) -> Matrix3<f64> {
        self.initial_matrix
    }

    /// Set a single reference field magnitude shared by every measurement.
    ///
    /// # Errors
    /// Returns [`CalibrationError::NonPositiveNorm`] if the magnitude is
    /// zero, negative, or not finite.
    pub fn set_reference_norm(&mut self, norm: f64) -> Result<(), CalibrationError> {
        self.ensure_unlocked()?;
        if !norm.is_finite() || norm <= 0.0 {
            return Err(CalibrationError::NonPositiveNorm(norm));
        }
        self.reference_norm = Some(ReferenceNorm::Global(norm));
        Ok(())
    }

    /// Set one reference field magnitude per measurement, in measurement
    /// order.
    ///
    /// The vector length is checked against the measurement count by
    /// `is_ready()`, not here, so norms and measurements may be configured
    /// in either order.
    ///
    /// # Errors
    /// Returns [`CalibrationError::NonPositiveNorm`] if any magnitude is
    /// zero, negative, or not finite; the previous source is left
    /// untouched.
    pub fn set_reference_norms(&mut self, norms: Vec<f64>) -> Result<(), CalibrationError> {
        self.ensure_unlocked()?;
        if let Some(&bad) = norms.iter().find(|n| !n.is_finite() || **n <= 0.0) {
            return Err(CalibrationError::NonPositiveNorm(bad));
        }
        self.reference_norm = Some(ReferenceNorm::PerMeasurement(norms));
        Ok(())
    }

    /// Remove the reference norm source, making the calibrator not ready.
    pub fn clear_reference_norm(&mut self) -> Result<(), CalibrationError> {
        self.ensure_unlocked()?;
        self.reference_norm = None;
        Ok(())
    }

    /// The configured reference norm source, if set.
    pub fn reference_norm(&self) -> Option<&ReferenceNorm> {
        self.reference_norm.as_ref()
    }

    /// Attach a start/end listener.
    pub fn set_listener(
        &mut self,
        listener: Box<dyn CalibrationListener>,
    ) -> Result<(), CalibrationError> {
        self.ensure_unlocked()?;
        self.listener = Some(listener);
        Ok(())
    }

    /// Detach the listener.
    pub fn clear_listener(&mut self) -> Result<(), CalibrationError> {
        self.ensure_unlocked()?;
        self.listener = None;
        Ok(())
    }

    /// Replace the solver settings.
    pub fn set_settings(&mut self, settings: SolverSettings) -> Result<(), CalibrationError> {
        self.ensure_unlocked()?;
        self.settings = settings;
        Ok(())
    }

    /// The current solver settings.
    pub fn settings(&self) -> SolverSettings {
        self.settings
    }

    /// Minimum measurement count under the current common-axis setting.
    pub fn minimum_required_measurements(&self) -> usize {
        minimum_required(self.common_axis)
    }

    /// Whether the configuration is complete enough to calibrate.
    ///
    /// True iff the measurement count meets the minimum, a bias is set, and
    /// a reference norm source is set (with a matching length when
    /// per-measurement). Independent of the order the pieces were set in.
    pub fn is_ready(&self) -> bool {
        if self.bias.is_none() {
            return false;
        }
        match &self.reference_norm {
            None => return false,
            Some(ReferenceNorm::Global(_)) => {}
            Some(ReferenceNorm::PerMeasurement(norms)) => {
                if norms.len() != self.measurements.len() {
                    return false;
                }
            }
        }
        self.measurements.len() >= self.minimum_required_measurements()
    }

    /// Whether a `calibrate()` call is in progress.
    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Three-state lifecycle view.
    pub fn state(&self) -> CalibratorState {
        if self.running {
            CalibratorState::Running
        } else if self.is_ready() {
            CalibratorState::Ready
        } else {
            CalibratorState::NotReady
        }
    }

    /// Run the fit.
    ///
    /// Transitions to running, fires `on_calibration_start`, iterates the
    /// solver, and on success commits the result atomically, fires
    /// `on_calibration_end`, and returns to ready. On failure nothing is
    /// committed, any previous result is left intact, the error propagates,
    /// and the calibrator returns to ready.
    ///
    /// # Errors
    /// - [`CalibrationError::Locked`] if a calibration is already running.
    /// - [`CalibrationError::NotReady`] if `is_ready()` is false.
    /// - [`CalibrationError::SingularInitialMatrix`],
    ///   [`CalibrationError::SingularSystem`], or
    ///   [`CalibrationError::NoConvergence`] from the solver.
    pub fn calibrate(&mut self) -> Result<(), CalibrationError> {
        self.ensure_unlocked()?;
        if !self.is_ready() {
            return Err(CalibrationError::NotReady);
        }

        info!(
            "calibrating with {} measurements, {} free parameters",
            self.measurements.len(),
            if self.common_axis { 6 } else { 9 }
        );

        self.running = true;
        if let Some(listener) = self.listener.as_mut() {
            listener.on_calibration_start();
        }

        let outcome = self.run_fit();
        self.running = false;

        let result = outcome?;
        debug!(
            "fit succeeded: chi_sq = {:.6e}, mse = {:.6e}",
            result.chi_sq, result.mse
        );

        self.result = Some(result);
        if let Some(listener) = self.listener.as_mut() {
            listener.on_calibration_end();
        }
        Ok(())
    }

    fn run_fit(&self) -> Result<EstimationResult, CalibrationError> {
        let bias = self.bias.ok_or(CalibrationError::NotReady)?;
        let norms: Vec<f64> = match self.reference_norm.as_ref() {
            Some(ReferenceNorm::Global(norm)) => vec![*norm; self.measurements.len()],
            Some(ReferenceNorm::PerMeasurement(norms)) => norms.clone(),
            None => return Err(CalibrationError::NotReady),
        };

        let model = ResidualModel::new(&self.measurements, bias, &norms, self.common_axis);
        let x0 = model.params_from_matrix(&self.initial_matrix);
        let outcome = solver::solve(&model, x0, &self.settings)?;
        debug!(
            "solver finished after {} iterations, cost {:.6e}",
            outcome.iterations, outcome.cost
        );

        statistics::derive(
            model.matrix_from_params(&outcome.params),
            &outcome,
            model.free_indices(),
            self.measurements.len(),
        )
    }

    /// Estimated cross-axis matrix from the last successful fit.
    pub fn estimated_matrix(&self) -> Option<Matrix3<f64>> {
        self.result.as_ref().map(|r| r.matrix)
    }

    /// One entry of the estimated matrix, or `None` before the first
    /// successful fit or for an out-of-range index.
    pub fn estimated_entry(&self, row: usize, col: usize) -> Option<f64> {
        if row > 2 || col > 2 {
            return None;
        }
        self.result.as_ref().map(|r| r.matrix[(row, col)])
    }

    /// Covariance of the nine matrix entries (column-major ordering) from
    /// the last successful fit.
    pub fn estimated_covariance(&self) -> Option<&SMatrix<f64, 9, 9>> {
        self.result.as_ref().map(|r| &r.covariance)
    }

    /// Weighted residual sum of squares from the last successful fit.
    pub fn estimated_chi_sq(&self) -> Option<f64> {
        self.result.as_ref().map(|r| r.chi_sq)
    }

    /// Chi-square per degree of freedom from the last successful fit.
    pub fn estimated_mse(&self) -> Option<f64> {
        self.result.as_ref().map(|r| r.mse)
    }

    /// Full result of the last successful fit.
    pub fn estimation_result(&self) -> Option<&EstimationResult> {
        self.result.as_ref()
    }
}

impl Default for MagnetometerCalibrator {
    fn default() -> Self {
        Self::new()
    }
}
