//! Optical frequency value object.
//!
//! `Frequency` stores a single canonical quantity (GHz) and derives vacuum
//! wavelength and wavenumber from it on demand, so every view of the same value
//! is consistent by construction.
//!
//! ```
//! use laser_tuning::frequency::{Frequency, FrequencyUnit};
//!
//! let f = Frequency::new(760.0, FrequencyUnit::Nanometers);
//! assert!((f.nm() - 760.0).abs() < 1e-9);
//!
//! let g = Frequency::parse(13_157.0, "cm-1").unwrap();
//! assert!(g.ghz() > 394_000.0);
//! ```

use std::fmt;
use std::ops::{Add, Sub};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::TuningError;

/// Vacuum speed of light in m/s.
pub const SPEED_OF_LIGHT: f64 = 299_792_458.0;

/// Units a [`Frequency`] can be constructed from or expressed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FrequencyUnit {
    /// Gigahertz (canonical).
    Gigahertz,
    /// Megahertz.
    Megahertz,
    /// Vacuum wavelength in nanometers.
    Nanometers,
    /// Wavenumber in inverse centimeters.
    Wavenumber,
}

impl FromStr for FrequencyUnit {
    type Err = TuningError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ghz" => Ok(Self::Gigahertz),
            "mhz" => Ok(Self::Megahertz),
            "nm" => Ok(Self::Nanometers),
            "cm-1" | "cm^-1" | "wavenumber" => Ok(Self::Wavenumber),
            _ => Err(TuningError::InvalidUnit(s.to_string())),
        }
    }
}

impl fmt::Display for FrequencyUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Gigahertz => "GHz",
            Self::Megahertz => "MHz",
            Self::Nanometers => "nm",
            Self::Wavenumber => "cm-1",
        };
        f.write_str(s)
    }
}

/// An optical frequency, stored internally in GHz.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Default, Serialize, Deserialize)]
pub struct Frequency {
    ghz: f64,
}

impl Frequency {
    /// Build a frequency from a value in the given unit.
    pub fn new(value: f64, unit: FrequencyUnit) -> Self {
        let ghz = match unit {
            FrequencyUnit::Gigahertz => value,
            FrequencyUnit::Megahertz => value * 1e-3,
            // nm and GHz powers of ten cancel
            FrequencyUnit::Nanometers => SPEED_OF_LIGHT / value,
            FrequencyUnit::Wavenumber => value * SPEED_OF_LIGHT * 1e-7,
        };
        Self { ghz }
    }

    /// Build a frequency from a value and a textual unit tag.
    ///
    /// # Errors
    /// `TuningError::InvalidUnit` if `unit` is not one of GHz, MHz, nm or cm-1.
    pub fn parse(value: f64, unit: &str) -> Result<Self, TuningError> {
        Ok(Self::new(value, unit.parse()?))
    }

    /// Frequency of `ghz` gigahertz.
    pub const fn from_ghz(ghz: f64) -> Self {
        Self { ghz }
    }

    /// Frequency of `mhz` megahertz.
    pub fn from_mhz(mhz: f64) -> Self {
        Self::new(mhz, FrequencyUnit::Megahertz)
    }

    /// Frequency of light with vacuum wavelength `nm`.
    pub fn from_nm(nm: f64) -> Self {
        Self::new(nm, FrequencyUnit::Nanometers)
    }

    /// Frequency of light with wavenumber `cm` in cm⁻¹.
    pub fn from_wavenumber(cm: f64) -> Self {
        Self::new(cm, FrequencyUnit::Wavenumber)
    }

    /// Value in GHz.
    pub fn ghz(&self) -> f64 {
        self.ghz
    }

    /// Value in MHz.
    pub fn mhz(&self) -> f64 {
        self.ghz * 1e3
    }

    /// Equivalent vacuum wavelength in nm.
    pub fn nm(&self) -> f64 {
        SPEED_OF_LIGHT / self.ghz
    }

    /// Equivalent inverse vacuum wavelength in cm⁻¹.
    pub fn wavenumber(&self) -> f64 {
        self.ghz / (SPEED_OF_LIGHT * 1e-7)
    }

    /// Express this frequency in `unit`.
    pub fn value_in(&self, unit: FrequencyUnit) -> f64 {
        match unit {
            FrequencyUnit::Gigahertz => self.ghz(),
            FrequencyUnit::Megahertz => self.mhz(),
            FrequencyUnit::Nanometers => self.nm(),
            FrequencyUnit::Wavenumber => self.wavenumber(),
        }
    }

    /// Magnitude, for comparing detunings.
    pub fn abs(self) -> Self {
        Self {
            ghz: self.ghz.abs(),
        }
    }
}

impl Add for Frequency {
    type Output = Frequency;

    fn add(self, rhs: Self) -> Self::Output {
        Frequency::from_ghz(self.ghz + rhs.ghz)
    }
}

impl Sub for Frequency {
    type Output = Frequency;

    fn sub(self, rhs: Self) -> Self::Output {
        Frequency::from_ghz(self.ghz - rhs.ghz)
    }
}

impl fmt::Display for Frequency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.6} GHz ({:.5} nm)", self.ghz, self.nm())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f64, b: f64, rel: f64) -> bool {
        (a - b).abs() <= rel * a.abs().max(b.abs())
    }

    #[test]
    fn test_wavelength_conversion() {
        let f = Frequency::from_nm(500.0);
        assert!(close(f.ghz(), 599_584.916, 1e-12));
        assert!(close(f.nm(), 500.0, 1e-12));
        assert!(close(f.wavenumber(), 20_000.0, 1e-12));
    }

    #[test]
    fn test_wavenumber_conversion() {
        let f = Frequency::from_wavenumber(20_000.0);
        assert!(close(f.ghz(), 599_584.916, 1e-12));
        assert!(close(f.nm(), 500.0, 1e-12));
    }

    #[test]
    fn test_mhz_is_thousandth_of_ghz() {
        let tol = Frequency::from_mhz(10.0);
        assert!(close(tol.ghz(), 0.01, 1e-15));
        assert!(close(tol.mhz(), 10.0, 1e-12));
    }

    #[test]
    fn test_unit_tags_case_insensitive() {
        assert_eq!("GHz".parse::<FrequencyUnit>().unwrap(), FrequencyUnit::Gigahertz);
        assert_eq!("NM".parse::<FrequencyUnit>().unwrap(), FrequencyUnit::Nanometers);
        assert_eq!("cm-1".parse::<FrequencyUnit>().unwrap(), FrequencyUnit::Wavenumber);
    }

    #[test]
    fn test_invalid_unit_rejected() {
        let err = Frequency::parse(1.0, "furlongs").unwrap_err();
        assert!(matches!(err, TuningError::InvalidUnit(ref u) if u == "furlongs"));
    }

    #[test]
    fn test_difference_and_display() {
        let a = Frequency::from_ghz(394_000.010);
        let b = Frequency::from_ghz(394_000.000);
        assert!(close((a - b).ghz(), 0.010, 1e-6));
        assert!(close((b - a).abs().ghz(), 0.010, 1e-6));
        assert!(a.to_string().contains("GHz"));
    }
}
