//! Motor position ↔ wavelength calibration.
//!
//! The grating motor stores its calibration in non-volatile memory as three
//! quadratic coefficients plus a packed wavelength range:
//!
//! ```text
//! wavelength_nm(position) = A·position² + B·position + C
//! ```
//!
//! The coefficients use a vendor fixed-point float encoding (see [`decode_float`]),
//! not IEEE-754. Inverting the quadratic needs a fixed choice of root, which depends
//! only on the sign of `A` and on whether the curve is ascending over the operating
//! range; [`CalibrationModel`] resolves that once at construction.

use serde::{Deserialize, Serialize};

use crate::error::TuningError;

/// Positions sampled to decide whether the calibration curve is ascending.
const MONOTONICITY_PROBE: (i32, i32) = (0, 5000);

/// Decode a calibration constant from its 32-bit firmware representation.
///
/// Bit layout, most significant first:
///
/// | bits   | meaning                                                      |
/// |--------|--------------------------------------------------------------|
/// | 31     | mantissa sign (0 = positive)                                 |
/// | 30..8  | 23-bit unsigned mantissa, value divided by 1 000 000         |
/// | 7      | exponent sign (0 = positive)                                 |
/// | 6..0   | 7-bit exponent magnitude, base 2                             |
///
/// Result: `sign · mantissa · 2^(±exponent)`.
pub fn decode_float(raw: u32) -> f64 {
    let mantissa_sign = if raw & 0x8000_0000 == 0 { 1.0 } else { -1.0 };
    let mantissa = f64::from((raw >> 8) & 0x007F_FFFF) / 1_000_000.0;
    let exponent_sign = if raw & 0x80 == 0 { 1 } else { -1 };
    let exponent = (raw & 0x7F) as i32;
    mantissa_sign * mantissa * 2f64.powi(exponent_sign * exponent)
}

/// Encode a value in the firmware float format.
///
/// Lossy: the mantissa keeps six decimal places of a value in `[0, 8.388607]`.
/// Used when seeding simulated devices with a calibration.
pub fn encode_float(value: f64) -> u32 {
    if value == 0.0 || !value.is_finite() {
        return 0;
    }
    let magnitude = value.abs();
    let max_mantissa = f64::from(0x007F_FFFFu32) / 1_000_000.0;
    let exponent = (magnitude / max_mantissa).log2().ceil().clamp(-127.0, 127.0) as i32;
    let mantissa = magnitude / 2f64.powi(exponent);
    let mantissa_bits = ((mantissa * 1_000_000.0).round() as u32).min(0x007F_FFFF);

    let mut raw = mantissa_bits << 8;
    if value < 0.0 {
        raw |= 0x8000_0000;
    }
    if exponent < 0 {
        raw |= 0x80;
    }
    raw | exponent.unsigned_abs()
}

/// Immutable calibration record read from the motor at connect time.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CalibrationParameters {
    /// Quadratic coefficient of `λ(x) = A·x² + B·x + C`, nm per count².
    pub a: f64,
    /// Linear coefficient, nm per count.
    pub b: f64,
    /// Wavelength at position zero, nm.
    pub c: f64,
    /// Lower end of the usable range, nm.
    pub min_wavelength_nm: f64,
    /// Upper end of the usable range, nm.
    pub max_wavelength_nm: f64,
}

impl CalibrationParameters {
    /// Decode the four raw calibration words.
    ///
    /// Words 0..=2 hold A, B and C. Word 3 packs two `u16` values in tenths of a
    /// nanometer: the low half is the maximum wavelength, the high half the minimum.
    pub fn from_words(words: [u32; 4]) -> Self {
        let max_tenths = words[3] & 0xFFFF;
        let min_tenths = words[3] >> 16;
        Self {
            a: decode_float(words[0]),
            b: decode_float(words[1]),
            c: decode_float(words[2]),
            min_wavelength_nm: f64::from(min_tenths) / 10.0,
            max_wavelength_nm: f64::from(max_tenths) / 10.0,
        }
    }

    /// Inverse of [`from_words`](Self::from_words), up to encoding precision.
    pub fn to_words(&self) -> [u32; 4] {
        let tenths = |nm: f64| ((nm * 10.0).round().clamp(0.0, f64::from(u16::MAX))) as u32;
        [
            encode_float(self.a),
            encode_float(self.b),
            encode_float(self.c),
            (tenths(self.min_wavelength_nm) << 16) | tenths(self.max_wavelength_nm),
        ]
    }

    /// Replace the stored range with a narrower operating window.
    pub fn with_bounds(mut self, min_nm: f64, max_nm: f64) -> Self {
        self.min_wavelength_nm = min_nm;
        self.max_wavelength_nm = max_nm;
        self
    }
}

/// Which root of the quadratic maps wavelengths back onto the operating branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RootBranch {
    /// Vertex plus the square root.
    Plus,
    /// Vertex minus the square root.
    Minus,
}

impl RootBranch {
    /// Branch for a given sign of `A` and curve direction.
    ///
    /// `A > 0` and ascending yields plus; flipping either one flips the root,
    /// flipping both restores it.
    pub fn select(a_positive: bool, ascending: bool) -> Self {
        if a_positive == ascending {
            RootBranch::Plus
        } else {
            RootBranch::Minus
        }
    }

    fn sign(self) -> f64 {
        match self {
            RootBranch::Plus => 1.0,
            RootBranch::Minus => -1.0,
        }
    }
}

/// Position ↔ wavelength conversion with the inversion branch resolved once.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CalibrationModel {
    params: CalibrationParameters,
    ascending: bool,
    branch: RootBranch,
}

impl CalibrationModel {
    /// Build a model, resolving the root branch.
    ///
    /// # Errors
    /// `OutOfDomain` when `A` is zero or not finite, since the quadratic inversion is
    /// then undefined for every wavelength.
    pub fn new(params: CalibrationParameters) -> Result<Self, TuningError> {
        if params.a == 0.0 || !params.a.is_finite() {
            return Err(TuningError::OutOfDomain {
                wavelength_nm: params.c,
            });
        }
        let wavelength = |p: i32| {
            let p = f64::from(p);
            params.a * p * p + params.b * p + params.c
        };
        let ascending = wavelength(MONOTONICITY_PROBE.1) - wavelength(MONOTONICITY_PROBE.0) > 0.0;
        let branch = RootBranch::select(params.a > 0.0, ascending);
        tracing::debug!(
            a = params.a,
            b = params.b,
            c = params.c,
            ascending,
            ?branch,
            "Calibration model resolved"
        );
        Ok(Self {
            params,
            ascending,
            branch,
        })
    }

    /// Parameters the model was built from.
    pub fn parameters(&self) -> &CalibrationParameters {
        &self.params
    }

    /// Whether wavelength grows with position over the calibrated range.
    pub fn is_ascending(&self) -> bool {
        self.ascending
    }

    /// Root used by [`wavelength_to_position`](Self::wavelength_to_position).
    pub fn branch(&self) -> RootBranch {
        self.branch
    }

    /// Whether `wavelength_nm` lies within the calibrated range (inclusive).
    pub fn contains(&self, wavelength_nm: f64) -> bool {
        wavelength_nm >= self.params.min_wavelength_nm
            && wavelength_nm <= self.params.max_wavelength_nm
    }

    /// Reject wavelengths outside the calibrated range.
    pub fn check_range(&self, wavelength_nm: f64) -> Result<(), TuningError> {
        if self.contains(wavelength_nm) {
            Ok(())
        } else {
            Err(TuningError::OutOfRange {
                wavelength_nm,
                min_nm: self.params.min_wavelength_nm,
                max_nm: self.params.max_wavelength_nm,
            })
        }
    }

    /// Wavelength in nm at an absolute motor position.
    pub fn position_to_wavelength(&self, position: i32) -> f64 {
        let p = f64::from(position);
        self.params.a * p * p + self.params.b * p + self.params.c
    }

    /// Absolute motor position for a wavelength, truncated toward zero.
    ///
    /// Does not check the calibrated range; callers do that first.
    pub fn wavelength_to_position(&self, wavelength_nm: f64) -> Result<i32, TuningError> {
        let CalibrationParameters { a, b, c, .. } = self.params;
        let vertex = -b / (2.0 * a);
        let discriminant = b * b / (4.0 * a * a) - (c - wavelength_nm) / a;
        if discriminant < 0.0 || !discriminant.is_finite() {
            return Err(TuningError::OutOfDomain { wavelength_nm });
        }
        let position = (vertex + self.branch.sign() * discriminant.sqrt()).trunc();
        if position < f64::from(i32::MIN) || position > f64::from(i32::MAX) {
            return Err(TuningError::OutOfDomain { wavelength_nm });
        }
        Ok(position as i32)
    }
}
