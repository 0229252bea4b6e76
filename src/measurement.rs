//! Magnetometer measurements and measurement collections

use nalgebra::Vector3;

use crate::error::CalibrationError;

/// A single raw magnetometer sample.
///
/// Holds the uncalibrated flux-density triad in the body frame, the
/// measurement noise standard deviation used to weight the fit, and an
/// optional quality score. Measurements are immutable once constructed.
///
/// # Example
/// ```
/// use nalgebra::Vector3;
/// use mag_calib::Measurement;
///
/// let raw = Vector3::new(21.3e-6, -4.1e-6, 43.7e-6); // tesla
/// let measurement = Measurement::new(raw, 1e-9).unwrap();
/// assert_eq!(measurement.stddev(), 1e-9);
/// ```
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Measurement {
    /// Raw flux-density triad in tesla, body frame.
    raw: Vector3<f64>,
    /// Measurement noise standard deviation in tesla.
    stddev: f64,
    /// Optional quality score for caller-side selection policies.
    quality: Option<f64>,
}

impl Measurement {
    /// Create a measurement from a raw triad and its noise standard deviation.
    ///
    /// # Errors
    /// Returns [`CalibrationError::NonPositiveStddev`] if `stddev` is zero,
    /// negative, or not finite, or [`CalibrationError::NonFiniteRaw`] if any
    /// component of `raw` is NaN or infinite.
    pub fn new(raw: Vector3<f64>, stddev: f64) -> Result<Self, CalibrationError> {
        if !stddev.is_finite() || stddev <= 0.0 {
            return Err(CalibrationError::NonPositiveStddev(stddev));
        }
        if !raw.iter().all(|c| c.is_finite()) {
            return Err(CalibrationError::NonFiniteRaw(raw.x, raw.y, raw.z));
        }

        Ok(Self {
            raw,
            stddev,
            quality: None,
        })
    }

    /// Create a measurement carrying a quality score.
    ///
    /// The score is stored and exposed but does not influence the fit
    /// weights; robust selection policies belong to the caller.
    ///
    /// # Errors
    /// Same validation as [`Measurement::new`].
    pub fn with_quality(
        raw: Vector3<f64>,
        stddev: f64,
        quality: f64,
    ) -> Result<Self, CalibrationError> {
        let mut measurement = Self::new(raw, stddev)?;
        measurement.quality = Some(quality);
        Ok(measurement)
    }

    /// Raw flux-density triad in tesla, body frame.
    pub fn raw(&self) -> Vector3<f64> {
        self.raw
    }

    /// Measurement noise standard deviation in tesla.
    pub fn stddev(&self) -> f64 {
        self.stddev
    }

    /// Quality score, if one was attached.
    pub fn quality(&self) -> Option<f64> {
        self.quality
    }
}

/// An ordered collection of magnetometer measurements.
///
/// The calibrator borrows the set for the duration of a `calibrate()` call;
/// measurement order is preserved and matters when per-measurement
/// reference norms are used.
///
/// # Example
/// ```
/// use nalgebra::Vector3;
/// use mag_calib::{Measurement, MeasurementSet};
///
/// let mut set = MeasurementSet::new();
/// set.push(Measurement::new(Vector3::new(48.0e-6, 1.2e-6, -21.0e-6), 1e-9).unwrap());
/// assert_eq!(set.len(), 1);
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MeasurementSet {
    measurements: Vec<Measurement>,
}

impl MeasurementSet {
    /// Create an empty measurement set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a measurement, preserving insertion order.
    pub fn push(&mut self, measurement: Measurement) {
        self.measurements.push(measurement);
    }

    /// Number of measurements in the set.
    pub fn len(&self) -> usize {
        self.measurements.len()
    }

    /// Whether the set contains no measurements.
    pub fn is_empty(&self) -> bool {
        self.measurements.is_empty()
    }

    /// Iterate over measurements in insertion order.
    pub fn iter(&self) -> core::slice::Iter<'_, Measurement> {
        self.measurements.iter()
    }
}

impl From<Vec<Measurement>> for MeasurementSet {
    fn from(measurements: Vec<Measurement>) -> Self {
        Self { measurements }
    }
}

impl FromIterator<Measurement> for MeasurementSet {
    fn from_iter<I: IntoIterator<Item = Measurement>>(iter: I) -> Self {
        Self {
            measurements: iter.into_iter().collect(),
        }
    }
}

impl<'a> IntoIterator for &'a MeasurementSet {
    type Item = &'a Measurement;
    type IntoIter = core::slice::Iter<'a, Measurement>;

    fn into_iter(self) -> Self::IntoIter {
        self.measurements.iter()
    }
}
