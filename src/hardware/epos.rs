//! Maxon EPOS positioning controller driving the grating motor.
//!
//! The EPOS command library is a blocking C API addressed through an open device
//! handle. This module does not load the library; it consumes the narrow call
//! surface in [`EposSdk`] and layers the grating-specific conventions on top:
//!
//! - the absolute wavelength reference lives in object `0x2081` sub `0` (i32)
//! - calibration words live in object `0x200C` subs `1..=4` (u32 each)
//! - the controller must be in profile-position mode with a bounded position profile
//!
//! `EposDrive` owns the device handle and closes it exactly once when dropped,
//! including when [`EposDrive::connect`] fails after the device was opened.

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::{HardwareError, HardwareResult};
use crate::hardware::capabilities::PositionActuator;

/// Object holding the persisted absolute position.
pub const STORED_POSITION_OBJECT: (u16, u8) = (0x2081, 0);

/// Object holding the calibration words (subindices 1..=4).
pub const CALIBRATION_OBJECT: u16 = 0x200C;

/// Operation mode code for profile position mode.
pub const PROFILE_POSITION_MODE: i8 = 1;

/// Position profile limits beyond which the profile is reset to [`PositionProfile::SAFE`].
const MAX_PROFILE_VELOCITY: u32 = 11_400;
const MAX_PROFILE_ACCELERATION: u32 = 20_000;
const MAX_PROFILE_DECELERATION: u32 = 20_000;

/// Opaque handle returned by the command library.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceHandle(pub usize);

/// Velocity (rpm) and acceleration/deceleration (rpm/s) for profile moves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PositionProfile {
    /// Profile velocity, rpm.
    pub velocity: u32,
    /// Profile acceleration, rpm/s.
    pub acceleration: u32,
    /// Profile deceleration, rpm/s.
    pub deceleration: u32,
}

impl PositionProfile {
    /// Profile applied when the stored one exceeds the grating's limits.
    pub const SAFE: PositionProfile = PositionProfile {
        velocity: 3_000,
        acceleration: 20_000,
        deceleration: 20_000,
    };

    /// Whether every value is within what the grating mount tolerates.
    pub fn within_limits(&self) -> bool {
        self.velocity <= MAX_PROFILE_VELOCITY
            && self.acceleration <= MAX_PROFILE_ACCELERATION
            && self.deceleration <= MAX_PROFILE_DECELERATION
    }
}

/// Blocking calls of the EPOS command library used by [`EposDrive`].
///
/// Every call returns the library's error code on failure.
pub trait EposSdk: Send {
    /// Open the USB connection to the drive.
    fn open_device(&mut self) -> Result<DeviceHandle, u32>;
    /// Release a handle from [`open_device`](Self::open_device).
    fn close_device(&mut self, handle: DeviceHandle) -> Result<(), u32>;
    /// Reset the drive's fault state.
    fn clear_fault(&mut self, handle: DeviceHandle) -> Result<(), u32>;
    /// Whether the power stage is enabled.
    fn get_enable_state(&mut self, handle: DeviceHandle) -> Result<bool, u32>;
    /// Enable the power stage.
    fn set_enable_state(&mut self, handle: DeviceHandle) -> Result<(), u32>;
    /// Disable the power stage.
    fn set_disable_state(&mut self, handle: DeviceHandle) -> Result<(), u32>;
    /// Current operation mode code.
    fn get_operation_mode(&mut self, handle: DeviceHandle) -> Result<i8, u32>;
    /// Switch the operation mode.
    fn set_operation_mode(&mut self, handle: DeviceHandle, mode: i8) -> Result<(), u32>;
    /// Profile used for position moves.
    fn get_position_profile(&mut self, handle: DeviceHandle) -> Result<PositionProfile, u32>;
    /// Replace the profile used for position moves.
    fn set_position_profile(
        &mut self,
        handle: DeviceHandle,
        profile: PositionProfile,
    ) -> Result<(), u32>;
    /// Start a move to `target`, absolute or relative to the current position.
    fn move_to_position(
        &mut self,
        handle: DeviceHandle,
        target: i32,
        absolute: bool,
        immediately: bool,
    ) -> Result<(), u32>;
    /// Whether the last move has reached its target.
    fn get_movement_state(&mut self, handle: DeviceHandle) -> Result<bool, u32>;
    /// Actual position counter.
    fn get_position_is(&mut self, handle: DeviceHandle) -> Result<i32, u32>;
    /// Read `len` bytes of an object-dictionary entry (little-endian).
    fn get_object(
        &mut self,
        handle: DeviceHandle,
        index: u16,
        subindex: u8,
        len: usize,
    ) -> Result<Vec<u8>, u32>;
    /// Write bytes to an object-dictionary entry (little-endian).
    fn set_object(
        &mut self,
        handle: DeviceHandle,
        index: u16,
        subindex: u8,
        data: &[u8],
    ) -> Result<(), u32>;
}

/// Grating motor on an EPOS controller.
pub struct EposDrive<S: EposSdk> {
    sdk: Mutex<S>,
    handle: DeviceHandle,
}

impl<S: EposSdk> std::fmt::Debug for EposDrive<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EposDrive")
            .field("handle", &self.handle)
            .finish()
    }
}

impl<S: EposSdk> EposDrive<S> {
    /// Open the controller and bring it into a well-defined idle state.
    ///
    /// Sequence: open, clear fault, disable if enabled, select profile-position mode,
    /// replace an out-of-limits position profile with [`PositionProfile::SAFE`].
    ///
    /// # Errors
    /// The first failing library call, as `HardwareError::Device`. The handle is
    /// closed before the error is returned.
    pub fn connect(mut sdk: S) -> HardwareResult<Self> {
        let handle = sdk
            .open_device()
            .map_err(|code| HardwareError::device(code, "open_device"))?;
        tracing::info!(?handle, "EPOS controller opened");

        // From here on, dropping `drive` closes the handle.
        let drive = Self {
            sdk: Mutex::new(sdk),
            handle,
        };
        drive.initialize()?;
        Ok(drive)
    }

    fn initialize(&self) -> HardwareResult<()> {
        self.call("clear_fault", |sdk, h| sdk.clear_fault(h))?;

        if self.call("get_enable_state", |sdk, h| sdk.get_enable_state(h))? {
            self.call("set_disable_state", |sdk, h| sdk.set_disable_state(h))?;
        }

        let mode = self.call("get_operation_mode", |sdk, h| sdk.get_operation_mode(h))?;
        if mode != PROFILE_POSITION_MODE {
            tracing::info!(mode, "Switching EPOS to profile position mode");
            self.call("set_operation_mode", |sdk, h| {
                sdk.set_operation_mode(h, PROFILE_POSITION_MODE)
            })?;
        }

        let profile = self.call("get_position_profile", |sdk, h| sdk.get_position_profile(h))?;
        if !profile.within_limits() {
            tracing::warn!(
                ?profile,
                safe = ?PositionProfile::SAFE,
                "Position profile exceeds grating limits, resetting"
            );
            self.call("set_position_profile", |sdk, h| {
                sdk.set_position_profile(h, PositionProfile::SAFE)
            })?;
        }
        Ok(())
    }

    /// Handle of the open device.
    pub fn handle(&self) -> DeviceHandle {
        self.handle
    }

    fn call<T>(
        &self,
        operation: &str,
        f: impl FnOnce(&mut S, DeviceHandle) -> Result<T, u32>,
    ) -> HardwareResult<T> {
        let mut sdk = self.sdk.lock();
        f(&mut *sdk, self.handle).map_err(|code| HardwareError::device(code, operation))
    }

    fn read_object<const N: usize>(&self, index: u16, subindex: u8) -> HardwareResult<[u8; N]> {
        let bytes = self.call("get_object", |sdk, h| sdk.get_object(h, index, subindex, N))?;
        bytes.as_slice().try_into().map_err(|_| {
            HardwareError::Transport(format!(
                "object 0x{index:04X}/{subindex} returned {} bytes, expected {N}",
                bytes.len()
            ))
        })
    }
}

impl<S: EposSdk> Drop for EposDrive<S> {
    fn drop(&mut self) {
        let handle = self.handle;
        match self.sdk.get_mut().close_device(handle) {
            Ok(()) => tracing::info!(?handle, "EPOS controller closed"),
            Err(code) => tracing::warn!(?handle, code, "Failed to close EPOS controller"),
        }
    }
}

#[async_trait]
impl<S: EposSdk + 'static> PositionActuator for EposDrive<S> {
    async fn enable(&self) -> HardwareResult<()> {
        self.call("set_enable_state", |sdk, h| sdk.set_enable_state(h))
    }

    async fn disable(&self) -> HardwareResult<()> {
        self.call("set_disable_state", |sdk, h| sdk.set_disable_state(h))
    }

    async fn move_relative(&self, counts: i32) -> HardwareResult<()> {
        self.call("move_to_position", |sdk, h| {
            sdk.move_to_position(h, counts, false, true)
        })
    }

    async fn is_move_complete(&self) -> HardwareResult<bool> {
        self.call("get_movement_state", |sdk, h| sdk.get_movement_state(h))
    }

    async fn read_stored_position(&self) -> HardwareResult<i32> {
        let (index, subindex) = STORED_POSITION_OBJECT;
        Ok(i32::from_le_bytes(self.read_object::<4>(index, subindex)?))
    }

    async fn write_stored_position(&self, position: i32) -> HardwareResult<()> {
        let (index, subindex) = STORED_POSITION_OBJECT;
        self.call("set_object", |sdk, h| {
            sdk.set_object(h, index, subindex, &position.to_le_bytes())
        })
    }

    async fn read_live_position(&self) -> HardwareResult<i32> {
        self.call("get_position_is", |sdk, h| sdk.get_position_is(h))
    }

    async fn read_calibration_words(&self) -> HardwareResult<[u32; 4]> {
        let mut words = [0u32; 4];
        for (word, subindex) in words.iter_mut().zip(1u8..) {
            *word = u32::from_le_bytes(self.read_object::<4>(CALIBRATION_OBJECT, subindex)?);
        }
        Ok(words)
    }
}
