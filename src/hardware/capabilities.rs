//! Capability traits consumed by the tuning core.
//!
//! Each trait is the narrowest surface the core needs from one collaborator.
//! Drivers implement them; tests use the mocks in [`crate::hardware::mock`].
//!
//! All methods take `&self`; implementations that need exclusive access to a
//! port or SDK handle guard it internally.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::HardwareResult;
use crate::frequency::Frequency;

/// Live frequency measurement (wavemeter).
///
/// Must tolerate being called at 10 Hz or faster.
#[async_trait]
pub trait FrequencySource: Send + Sync {
    /// Read the current laser frequency.
    async fn read(&self) -> HardwareResult<Frequency>;
}

/// Voltage-limited fine actuator (piezo).
#[async_trait]
pub trait BoundedActuator: Send + Sync {
    /// Hard physical limit; valid set-points satisfy `|volts| <= limit`.
    fn limit(&self) -> f64;

    /// Current output in volts.
    async fn get(&self) -> HardwareResult<f64>;

    /// Set the output.
    ///
    /// # Errors
    /// `HardwareError::OutOfBounds` if `|volts| > limit()`; the output is unchanged.
    async fn set(&self, volts: f64) -> HardwareResult<()>;
}

/// Absolute-position coarse actuator (grating motor) with a persisted reference.
///
/// *Stored position* is the absolute reference kept in non-volatile memory.
/// *Live position* is the controller's own counter since its last reset and is only
/// meaningful as a difference across a single move.
#[async_trait]
pub trait PositionActuator: Send + Sync {
    /// Power the drive. Required before a move.
    async fn enable(&self) -> HardwareResult<()>;

    /// Power the drive down so the grating is not held under current.
    async fn disable(&self) -> HardwareResult<()>;

    /// Start a relative move without waiting for it to finish.
    async fn move_relative(&self, counts: i32) -> HardwareResult<()>;

    /// Whether the last commanded move has reached its target.
    async fn is_move_complete(&self) -> HardwareResult<bool>;

    /// Persisted absolute position, in counts.
    async fn read_stored_position(&self) -> HardwareResult<i32>;

    /// Persist a new absolute position, in counts.
    async fn write_stored_position(&self, position: i32) -> HardwareResult<()>;

    /// Controller counter since its last reset, in counts.
    async fn read_live_position(&self) -> HardwareResult<i32>;

    /// The four raw calibration words (A, B, C, packed wavelength range).
    async fn read_calibration_words(&self) -> HardwareResult<[u32; 4]>;
}

#[async_trait]
impl<T: FrequencySource + ?Sized> FrequencySource for Arc<T> {
    async fn read(&self) -> HardwareResult<Frequency> {
        (**self).read().await
    }
}

#[async_trait]
impl<T: BoundedActuator + ?Sized> BoundedActuator for Arc<T> {
    fn limit(&self) -> f64 {
        (**self).limit()
    }

    async fn get(&self) -> HardwareResult<f64> {
        (**self).get().await
    }

    async fn set(&self, volts: f64) -> HardwareResult<()> {
        (**self).set(volts).await
    }
}

#[async_trait]
impl<T: PositionActuator + ?Sized> PositionActuator for Arc<T> {
    async fn enable(&self) -> HardwareResult<()> {
        (**self).enable().await
    }

    async fn disable(&self) -> HardwareResult<()> {
        (**self).disable().await
    }

    async fn move_relative(&self, counts: i32) -> HardwareResult<()> {
        (**self).move_relative(counts).await
    }

    async fn is_move_complete(&self) -> HardwareResult<bool> {
        (**self).is_move_complete().await
    }

    async fn read_stored_position(&self) -> HardwareResult<i32> {
        (**self).read_stored_position().await
    }

    async fn write_stored_position(&self, position: i32) -> HardwareResult<()> {
        (**self).write_stored_position(position).await
    }

    async fn read_live_position(&self) -> HardwareResult<i32> {
        (**self).read_live_position().await
    }

    async fn read_calibration_words(&self) -> HardwareResult<[u32; 4]> {
        (**self).read_calibration_words().await
    }
}
