//! Error type for the calibration library

use thiserror::Error;

/// Errors that can occur while configuring or running a calibration.
///
/// Configuration and state errors leave the calibrator untouched; numerical
/// errors from a failed fit leave any previously committed result intact.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CalibrationError {
    /// A slice argument had the wrong number of elements.
    #[error("expected {expected} elements, got {actual}")]
    InvalidSize {
        /// Required element count.
        expected: usize,
        /// Element count actually supplied.
        actual: usize,
    },
    /// A measurement standard deviation was zero, negative, or not finite.
    #[error("measurement stddev must be positive and finite, got {0}")]
    NonPositiveStddev(f64),
    /// A raw measurement triad contained a NaN or infinite component.
    #[error("raw measurement components must be finite, got ({0}, {1}, {2})")]
    NonFiniteRaw(f64, f64, f64),
    /// A reference field magnitude was zero, negative, or not finite.
    #[error("reference norm must be positive and finite, got {0}")]
    NonPositiveNorm(f64),
    /// A mutator or `calibrate()` was called while a calibration was
    /// already running.
    #[error("calibration in progress, configuration is locked")]
    Locked,
    /// `calibrate()` was called before measurements, bias, and reference
    /// norm were all configured.
    #[error("calibrator is not ready: measurements, bias, or reference norm missing")]
    NotReady,
    /// The configured iteration starting matrix is not invertible.
    #[error("initial matrix is singular")]
    SingularInitialMatrix,
    /// The normal equations were singular and damping could not cure it.
    #[error("normal equations are singular")]
    SingularSystem,
    /// The damping factor exceeded its cap before the fit converged.
    #[error("no convergence after {0} iterations")]
    NoConvergence(usize),
}
