//! Tunable laser coarse/fine tuning and frequency locking.
//!
//! A grating motor ([`coarse::CoarseActuator`]) moves the laser close to a target
//! frequency using a quadratic calibration ([`calibration::CalibrationModel`]). A piezo
//! PI loop ([`fine_lock::FineLockController`]) then locks onto the wavemeter reading.
//! [`orchestrator::TuningOrchestrator`] sequences the two.
//!
//! Hardware is reached through the capability traits in [`hardware::capabilities`];
//! [`hardware::mock`] provides simulated devices.

pub mod calibration;
pub mod coarse;
pub mod config;
pub mod error;
pub mod fine_lock;
pub mod frequency;
pub mod hardware;
pub mod logging;
pub mod orchestrator;

pub use calibration::{CalibrationModel, CalibrationParameters};
pub use coarse::CoarseActuator;
pub use config::TuningConfig;
pub use error::{AppResult, HardwareError, TuningError};
pub use fine_lock::{FineLockController, LockHandle, LockParams, LockState};
pub use frequency::{Frequency, FrequencyUnit};
pub use orchestrator::{TuneOutcome, TuningOrchestrator};
