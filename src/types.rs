//! Core types and configuration for the magnetometer calibration library

/// Source of the known reference field magnitude.
///
/// The calibrator never evaluates a geomagnetic model itself; the caller
/// obtains the expected field magnitude (for example from a World Magnetic
/// Model evaluation at the measurement position and date) and passes it in,
/// either as a single magnitude shared by every measurement or as one
/// magnitude per measurement.
///
/// # Example
/// ```
/// use mag_calib::ReferenceNorm;
///
/// // All measurements taken at the same location and time.
/// let norm = ReferenceNorm::Global(52.8e-6); // tesla
///
/// // Measurements taken along a trajectory.
/// let norms = ReferenceNorm::PerMeasurement(vec![52.8e-6, 52.7e-6, 52.9e-6]);
/// # let _ = (norm, norms);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub enum ReferenceNorm {
    /// One magnitude in tesla shared by every measurement.
    Global(f64),
    /// One magnitude in tesla per measurement, in measurement order.
    ///
    /// The vector length must equal the measurement count; the calibrator
    /// checks this as part of its readiness rule.
    PerMeasurement(Vec<f64>),
}

/// Levenberg–Marquardt solver settings
///
/// Tuning parameters for the damped Gauss–Newton iteration. The defaults
/// are appropriate for typical magnetometer data and rarely need changing.
///
/// # Example
/// ```
/// use mag_calib::SolverSettings;
///
/// let settings = SolverSettings {
///     max_iterations: 200,   // Allow more iterations for poor initial guesses
///     ..Default::default()
/// };
/// ```
#[derive(Debug, Clone, Copy)]
pub struct SolverSettings {
    /// Maximum number of solver iterations before giving up.
    pub max_iterations: usize,
    /// Relative cost-improvement threshold that declares convergence.
    ///
    /// An accepted step that improves the weighted sum of squares by less
    /// than this fraction terminates the iteration.
    pub cost_tolerance: f64,
    /// Relative step-size threshold that declares convergence.
    ///
    /// An accepted step whose norm falls below this fraction of the
    /// parameter norm terminates the iteration. This catches fits that
    /// start at or next to the optimum, where the cost is already at the
    /// rounding floor.
    pub step_tolerance: f64,
    /// Initial damping factor λ applied to the normal equations.
    pub initial_damping: f64,
    /// Multiplier applied to λ after a rejected step.
    pub damping_increase: f64,
    /// Multiplier applied to λ after an accepted step.
    pub damping_decrease: f64,
    /// Upper bound on λ; exceeding it is treated as a fit failure.
    pub max_damping: f64,
}

impl Default for SolverSettings {
    fn default() -> Self {
        Self {
            max_iterations: 100,
            cost_tolerance: 1e-12,
            step_tolerance: 1e-14,
            initial_damping: 1e-3,
            damping_increase: 10.0,
            damping_decrease: 0.1,
            max_damping: 1e12,
        }
    }
}

/// Calibrator lifecycle states
///
/// `NotReady` and `Ready` are distinguished only by whether the
/// configuration satisfies the readiness rule; `Running` is entered for the
/// duration of a `calibrate()` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalibratorState {
    /// Measurements, bias, or reference norm are still missing.
    NotReady,
    /// All required configuration is present; `calibrate()` may be called.
    Ready,
    /// A calibration is in progress; all mutators are locked.
    Running,
}

/// Observer for calibration lifecycle events.
///
/// Both notifications are synchronous and fire on the calling thread, each
/// exactly once per successful `calibrate()` call. `on_calibration_end`
/// fires only when the fit succeeds; a solver failure surfaces through the
/// returned error instead.
///
/// # Example
/// ```
/// use mag_calib::CalibrationListener;
///
/// struct Progress;
///
/// impl CalibrationListener for Progress {
///     fn on_calibration_start(&mut self) {
///         println!("calibration started");
///     }
///     fn on_calibration_end(&mut self) {
///         println!("calibration finished");
///     }
/// }
/// ```
pub trait CalibrationListener {
    /// Called immediately after the calibrator transitions to running.
    fn on_calibration_start(&mut self) {}

    /// Called after a successful fit, once the result is committed.
    fn on_calibration_end(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_solver_settings() {
        let settings = SolverSettings::default();
        assert_eq!(settings.max_iterations, 100);
        assert_eq!(settings.cost_tolerance, 1e-12);
        assert_eq!(settings.step_tolerance, 1e-14);
        assert_eq!(settings.initial_damping, 1e-3);
        assert_eq!(settings.damping_increase, 10.0);
        assert_eq!(settings.damping_decrease, 0.1);
        assert_eq!(settings.max_damping, 1e12);
    }

    #[test]
    fn test_listener_default_methods_are_noops() {
        struct Silent;
        impl CalibrationListener for Silent {}

        let mut listener = Silent;
        listener.on_calibration_start();
        listener.on_calibration_end();
    }
}
