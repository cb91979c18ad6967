//! Error types for laser tuning and locking.
//!
//! Two layers, both built on `thiserror`:
//!
//! - **`HardwareError`**: what a capability trait implementation reports. Device-level
//!   failures always carry the vendor error code; transport failures come from the
//!   wavemeter or SCPI link; `OutOfBounds` is a rejected actuator request.
//! - **`TuningError`**: what the control core reports to its callers. It wraps
//!   `HardwareError` via `#[from]` so driver errors propagate with `?`, and adds the
//!   calibration, range, locking and configuration failures of the core itself.
//!
//! `CalibrationDesync` is the one variant that must never be downgraded to a log line:
//! it carries the stored-position value that has to be restored by hand before any
//! further wavelength computation can be trusted.

use std::time::Duration;

use thiserror::Error;

use crate::config::ConfigError;

/// Convenience alias for results using the core error type.
pub type AppResult<T> = std::result::Result<T, TuningError>;

/// Convenience alias for results returned by hardware capability traits.
pub type HardwareResult<T> = std::result::Result<T, HardwareError>;

/// Failure reported by a device or its transport.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum HardwareError {
    /// Vendor error code returned by a device call.
    #[error("device error 0x{code:08X} during {operation}")]
    Device { code: u32, operation: String },

    /// Link to the device failed or returned something unparseable.
    #[error("transport error: {0}")]
    Transport(String),

    /// Set-point rejected before reaching the device.
    #[error("requested {requested} outside allowed range [{min}, {max}]")]
    OutOfBounds { requested: f64, min: f64, max: f64 },
}

impl HardwareError {
    /// Shorthand for a coded device failure.
    pub fn device(code: u32, operation: impl Into<String>) -> Self {
        Self::Device {
            code,
            operation: operation.into(),
        }
    }

    /// Vendor error code, if this is a device-level failure.
    pub fn code(&self) -> Option<u32> {
        match self {
            Self::Device { code, .. } => Some(*code),
            _ => None,
        }
    }
}

/// Errors surfaced by the tuning core.
#[derive(Error, Debug)]
pub enum TuningError {
    /// Frequency unit string not recognized by the parser.
    #[error("unrecognized frequency unit '{0}' (expected GHz, MHz, nm or cm-1)")]
    InvalidUnit(String),

    /// Wavelength for which the calibration quadratic has no real root.
    #[error("wavelength {wavelength_nm} nm has no real solution in the calibration quadratic")]
    OutOfDomain { wavelength_nm: f64 },

    /// Target outside the calibrated window. Raised before any device access.
    #[error("wavelength {wavelength_nm:.4} nm out of range (min {min_nm} nm, max {max_nm} nm)")]
    OutOfRange {
        wavelength_nm: f64,
        min_nm: f64,
        max_nm: f64,
    },

    /// Device failure outside the write-back.
    #[error(transparent)]
    Hardware(#[from] HardwareError),

    /// The stored motor position no longer matches the grating.
    ///
    /// `position` is the value the operator has to restore by hand.
    #[error(
        "stored motor position could not be updated; it must be manually set to {position}: {source}"
    )]
    CalibrationDesync {
        position: i32,
        #[source]
        source: HardwareError,
    },

    /// A single relative move did not report completion in time.
    #[error("motor move of {counts} counts did not complete within {timeout:?}")]
    MoveTimeout { counts: i32, timeout: Duration },

    /// The task running a grating move panicked or was aborted.
    #[error("motor move task terminated abnormally: {0}")]
    MoveTask(String),

    /// The lock session gave up without ever stabilizing.
    #[error("failed to lock laser: no stable lock after {elapsed:?}")]
    FailedToLockLaser { elapsed: Duration },

    /// The lock session task panicked or ended without a terminal state.
    #[error("lock task terminated abnormally: {0}")]
    LockTask(String),

    /// Invalid configuration or lock parameters.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl TuningError {
    /// Whether the persisted motor reference can no longer be trusted.
    pub fn is_desync(&self) -> bool {
        matches!(self, Self::CalibrationDesync { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_error_display_includes_code() {
        let err = HardwareError::device(0x1000_0008, "move_relative");
        assert_eq!(
            err.to_string(),
            "device error 0x10000008 during move_relative"
        );
        assert_eq!(err.code(), Some(0x1000_0008));
        assert_eq!(HardwareError::Transport("eof".into()).code(), None);
    }

    #[test]
    fn test_desync_message_names_position() {
        let err = TuningError::CalibrationDesync {
            position: 123_456,
            source: HardwareError::device(0x0503_0000, "write_stored_position"),
        };
        assert!(err.is_desync());
        assert!(err.to_string().contains("manually set to 123456"));
    }

    #[test]
    fn test_hardware_error_converts() {
        let err: TuningError = HardwareError::Transport("timeout".into()).into();
        assert!(matches!(err, TuningError::Hardware(_)));
        assert_eq!(err.to_string(), "transport error: timeout");
    }
}
