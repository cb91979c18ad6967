//! Device capabilities and drivers.
//!
//! - `capabilities`: the traits the tuning core is written against
//! - `epos`: Maxon EPOS grating motor drive
//! - `lion`: Sacher Lion laser head (piezo, current, status)
//! - `mock`: simulated devices for tests and dry runs

pub mod capabilities;
pub mod epos;
pub mod lion;
pub mod mock;

pub use capabilities::{BoundedActuator, FrequencySource, PositionActuator};
