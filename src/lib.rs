//! mag-calib - Nonlinear least-squares magnetometer calibration
//!
//! This library fits the cross-axis sensitivity matrix (scale factors plus
//! cross couplings, the "soft iron") of a triaxial magnetometer whose
//! hard-iron bias is already known, using only the magnitude of the
//! reference magnetic field at each measurement. Because the field's
//! direction is not needed, measurements can be collected by freely
//! rotating the sensor at a location where a geomagnetic model supplies the
//! expected field strength.
//!
//! # Features
//!
//! - Damped Gauss-Newton (Levenberg-Marquardt) iteration with analytic
//!   Jacobians through the matrix inverse
//! - Optional common-axis constraint fixing the three below-diagonal cross
//!   couplings to zero (9 → 6 free parameters)
//! - Measurement-noise propagation into a 9×9 parameter covariance plus
//!   chi-square and MSE goodness-of-fit statistics
//! - Strict ready/running state machine with start/end listener
//!   notifications guarding against concurrent misuse
//!
//! # Quick Start
//!
//! ```rust
//! use nalgebra::Vector3;
//! use mag_calib::{MagnetometerCalibrator, Measurement, MeasurementSet};
//!
//! let mut calibrator = MagnetometerCalibrator::new();
//!
//! // Raw body-frame samples with their noise standard deviation (tesla).
//! let set: MeasurementSet = raw_samples()
//!     .into_iter()
//!     .map(|raw| Measurement::new(raw, 1e-9).unwrap())
//!     .collect();
//!
//! calibrator.set_measurements(set).unwrap();
//! calibrator.set_bias(Vector3::new(4.0e-6, -2.0e-6, 1.0e-6)).unwrap();
//! calibrator.set_reference_norm(52.8e-6).unwrap(); // e.g. from a WMM evaluation
//!
//! if calibrator.is_ready() {
//!     calibrator.calibrate().unwrap();
//!     let soft_iron = calibrator.estimated_matrix().unwrap();
//!     let chi_sq = calibrator.estimated_chi_sq().unwrap();
//!     # let _ = (soft_iron, chi_sq);
//! }
//! # fn raw_samples() -> Vec<Vector3<f64>> {
//! #     (0..10)
//! #         .map(|i| {
//! #             let z = 1.0 - 2.0 * (i as f64 + 0.5) / 10.0;
//! #             let r = (1.0f64 - z * z).sqrt();
//! #             let a = 2.39996 * i as f64;
//! #             Vector3::new(r * a.cos(), r * a.sin(), z) * 52.8e-6
//! #                 + Vector3::new(4.0e-6, -2.0e-6, 1.0e-6)
//! #         })
//! #         .collect()
//! # }
//! ```

pub mod calibrator;
mod error;
pub mod measurement;
mod model;
mod solver;
pub mod statistics;
mod types;

// Re-export all public types and functions
pub use calibrator::{MagnetometerCalibrator, minimum_required};
pub use error::CalibrationError;
pub use measurement::{Measurement, MeasurementSet};
pub use statistics::EstimationResult;
pub use types::{CalibrationListener, CalibratorState, ReferenceNorm, SolverSettings};
