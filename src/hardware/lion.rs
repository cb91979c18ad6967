//! Sacher Lion tunable diode laser head.
//!
//! SCPI command layer over any [`ScpiTransport`] (GPIB/VISA/serial framing lives in
//! the transport). Implements [`BoundedActuator`] for the piezo offset, which is the
//! fine actuator of the lock loop.
//!
//! # Example Usage
//!
//! ```rust,ignore
//! let laser = LionLaser::new(transport);
//! println!("{}", laser.identify().await?);
//! laser.set(1.25).await?; // piezo offset in volts
//! for fault in laser.system_status().await?.faults() {
//!     tracing::warn!(fault, "Laser reports fault");
//! }
//! ```

use async_trait::async_trait;

use crate::error::{HardwareError, HardwareResult};
use crate::hardware::capabilities::BoundedActuator;

/// Piezo offset range of the laser head in volts.
pub const PIEZO_LIMIT_VOLTS: f64 = 13.0;

/// Permitted diode current window in mA.
pub const CURRENT_RANGE_MA: (f64, f64) = (130.0, 150.0);

/// Line-oriented SCPI query/write primitives.
#[async_trait]
pub trait ScpiTransport: Send + Sync {
    /// Send `command` and return the response line without terminator.
    async fn query(&self, command: &str) -> HardwareResult<String>;

    /// Send `command` without reading a response.
    async fn write(&self, command: &str) -> HardwareResult<()>;
}

/// Status word faults, indexed by decimal digit (least significant first) and bit.
const STATUS_FAULTS: [[&str; 3]; 5] = [
    [
        "I-Limit reached",
        "Laser Open Load / Compliance Voltage too low",
        "Error Laser requires TEC enabled",
    ],
    [
        "Temperature Watch Out of Window",
        "Temperature Out of Range",
        "Temperature Not Reached",
    ],
    [
        "Modulation Voltage Out of Range",
        "Photodiode Out of Range",
        "Piezo Voltage Out of Range",
    ],
    [
        "Laser Head Loop Open",
        "Extern Interlock Loop Open",
        "TEC Loop Open",
    ],
    [
        "Remote Control Command Error",
        "Temperature Coupling Out of Range",
        "Device Over Temperature",
    ],
];

/// Decoded `:SYSTEM:STATUS?` response.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SystemStatus {
    faults: Vec<&'static str>,
}

impl SystemStatus {
    /// Decode the five-digit status word.
    ///
    /// Each decimal digit is a 3-bit group for one fault category: laser, TEC,
    /// range, loop, device (least significant digit first).
    pub fn decode(raw: &str) -> HardwareResult<Self> {
        let malformed = || HardwareError::Transport(format!("malformed status word '{raw}'"));
        let digits = raw.trim();
        if digits.is_empty() || digits.len() > STATUS_FAULTS.len() {
            return Err(malformed());
        }

        let mut faults = Vec::new();
        for (category, ch) in STATUS_FAULTS.iter().zip(digits.chars().rev()) {
            let bits = ch.to_digit(10).filter(|d| *d < 8).ok_or_else(malformed)?;
            for (bit, name) in category.iter().enumerate() {
                if bits & (1 << bit) != 0 {
                    faults.push(*name);
                }
            }
        }
        Ok(Self { faults })
    }

    /// No fault bit set.
    pub fn is_ok(&self) -> bool {
        self.faults.is_empty()
    }

    /// Names of the faults that are set.
    pub fn faults(&self) -> &[&'static str] {
        &self.faults
    }
}

/// Sacher Lion laser head.
#[derive(Debug)]
pub struct LionLaser<T> {
    transport: T,
    piezo_limit: f64,
}

impl<T: ScpiTransport> LionLaser<T> {
    /// Laser head on `transport` with the standard piezo range.
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            piezo_limit: PIEZO_LIMIT_VOLTS,
        }
    }

    /// `*IDN?` response.
    pub async fn identify(&self) -> HardwareResult<String> {
        self.transport.query("*IDN?").await
    }

    /// Operating hours as reported (`HH:MM:SS`).
    pub async fn working_hours(&self) -> HardwareResult<String> {
        self.transport.query(":SYSTEM:Laser:Hours?").await
    }

    /// Serial number of the laser head.
    pub async fn serial_number(&self) -> HardwareResult<String> {
        self.transport.query(":SYSTEM:SERIALNUMBER?").await
    }

    /// Current fault status.
    pub async fn system_status(&self) -> HardwareResult<SystemStatus> {
        let raw = self.transport.query(":SYSTEM:STATUS?").await?;
        SystemStatus::decode(&raw)
    }

    /// Diode current in mA.
    pub async fn current_ma(&self) -> HardwareResult<f64> {
        Ok(1000.0 * self.query_f64(":LASER:CURRENT?").await?)
    }

    /// Diode current limit in mA.
    pub async fn current_limit_ma(&self) -> HardwareResult<f64> {
        Ok(1000.0 * self.query_f64(":LASER:ILIMIT?").await?)
    }

    /// Set the diode current in mA.
    ///
    /// # Errors
    /// `OutOfBounds` outside [`CURRENT_RANGE_MA`]; nothing is sent.
    pub async fn set_current_ma(&self, milliamps: f64) -> HardwareResult<()> {
        let (min, max) = CURRENT_RANGE_MA;
        if !(min..=max).contains(&milliamps) {
            return Err(HardwareError::OutOfBounds {
                requested: milliamps,
                min,
                max,
            });
        }
        self.transport
            .write(&format!(":LASER:CURRENT {milliamps:0.1}mA"))
            .await
    }

    /// `IMODE` or `PMODE`.
    pub async fn laser_mode(&self) -> HardwareResult<String> {
        self.transport.query(":LASER:MODE?").await
    }

    /// Switch the diode current on.
    pub async fn laser_on(&self) -> HardwareResult<()> {
        self.transport.write(":LASER:STATUS 1").await
    }

    /// Switch the diode current off.
    pub async fn laser_off(&self) -> HardwareResult<()> {
        self.transport.write(":LASER:STATUS 0").await
    }

    async fn query_f64(&self, command: &str) -> HardwareResult<f64> {
        let response = self.transport.query(command).await?;
        response.trim().parse().map_err(|_| {
            HardwareError::Transport(format!(
                "could not parse '{response}' as a number (query {command})"
            ))
        })
    }
}

#[async_trait]
impl<T: ScpiTransport> BoundedActuator for LionLaser<T> {
    fn limit(&self) -> f64 {
        self.piezo_limit
    }

    async fn get(&self) -> HardwareResult<f64> {
        self.query_f64(":PIEZO:OFFSET?").await
    }

    async fn set(&self, volts: f64) -> HardwareResult<()> {
        if !volts.is_finite() || volts.abs() > self.piezo_limit {
            return Err(HardwareError::OutOfBounds {
                requested: volts,
                min: -self.piezo_limit,
                max: self.piezo_limit,
            });
        }
        // Set form is sent without the root colon, unlike the query
        self.transport
            .write(&format!("PIEZO:OFFSET {volts}V"))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashMap;

    #[derive(Default)]
    struct FakeTransport {
        responses: HashMap<&'static str, &'static str>,
        written: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ScpiTransport for FakeTransport {
        async fn query(&self, command: &str) -> HardwareResult<String> {
            self.responses
                .get(command)
                .map(|r| r.to_string())
                .ok_or_else(|| HardwareError::Transport(format!("no response to {command}")))
        }

        async fn write(&self, command: &str) -> HardwareResult<()> {
            self.written.lock().push(command.to_string());
            Ok(())
        }
    }

    #[test]
    fn test_status_ok() {
        let status = SystemStatus::decode("0").unwrap();
        assert!(status.is_ok());
    }

    #[test]
    fn test_status_decodes_digits_and_bits() {
        // digit 0 (laser) = 1 -> I-Limit; digit 2 (range) = 4 -> piezo;
        // digit 4 (device) = 6 -> coupling + over temperature
        let status = SystemStatus::decode("60401").unwrap();
        assert_eq!(
            status.faults(),
            &[
                "I-Limit reached",
                "Piezo Voltage Out of Range",
                "Temperature Coupling Out of Range",
                "Device Over Temperature",
            ]
        );
    }

    #[test]
    fn test_status_rejects_garbage() {
        assert!(SystemStatus::decode("80000").is_err());
        assert!(SystemStatus::decode("123456").is_err());
        assert!(SystemStatus::decode("").is_err());
    }

    #[tokio::test]
    async fn test_piezo_get_and_bounded_set() {
        let mut transport = FakeTransport::default();
        transport.responses.insert(":PIEZO:OFFSET?", " 1.25\r");
        let laser = LionLaser::new(transport);

        assert_eq!(laser.get().await.unwrap(), 1.25);
        laser.set(-2.5).await.unwrap();
        assert!(matches!(
            laser.set(13.01).await,
            Err(HardwareError::OutOfBounds { .. })
        ));
        assert_eq!(
            *laser.transport.written.lock(),
            vec!["PIEZO:OFFSET -2.5V".to_string()]
        );
    }

    #[tokio::test]
    async fn test_current_guard() {
        let mut transport = FakeTransport::default();
        transport.responses.insert(":LASER:CURRENT?", "0.1402");
        let laser = LionLaser::new(transport);

        assert!((laser.current_ma().await.unwrap() - 140.2).abs() < 1e-9);
        assert!(laser.set_current_ma(129.9).await.is_err());
        laser.set_current_ma(140.0).await.unwrap();
        assert_eq!(
            *laser.transport.written.lock(),
            vec![":LASER:CURRENT 140.0mA".to_string()]
        );
    }
}
