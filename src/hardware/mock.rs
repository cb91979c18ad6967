//! Mock Hardware Implementations
//!
//! Simulated devices for testing the tuning core without physical hardware.
//! All mocks are cheaply cloneable handles onto shared state, so a test can keep
//! one clone for inspection while the component under test owns another.
//!
//! # Available Mocks
//!
//! - `MockPositionActuator` - grating motor with stored/live positions, call log and
//!   failure injection
//! - `MockPiezo` - voltage-bounded piezo (±13 V by default)
//! - `MockWavemeter` - scripted frequency readings
//! - `SimulatedLaser` - wavemeter whose reading follows the mock motor and piezo
//!
//! Mocks never sleep; pacing comes from the component under test.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::calibration::{CalibrationModel, CalibrationParameters};
use crate::error::{HardwareError, HardwareResult};
use crate::frequency::Frequency;
use crate::hardware::capabilities::{BoundedActuator, FrequencySource, PositionActuator};

/// Piezo range of the Lion laser head.
pub const DEFAULT_PIEZO_LIMIT: f64 = 13.0;

/// Piezo tuning coefficient of the simulated laser head, GHz per volt (frequency falls
/// as voltage rises).
pub const SIMULATED_GHZ_PER_VOLT: f64 = 1.5;

// =============================================================================
// MockPositionActuator - Simulated Grating Motor
// =============================================================================

/// One recorded call on a [`MockPositionActuator`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MotorCall {
    /// [`PositionActuator::enable`].
    Enable,
    /// [`PositionActuator::disable`].
    Disable,
    /// Relative move of the given counts.
    MoveRelative(i32),
    /// Move-complete poll.
    PollComplete,
    /// Stored-position read.
    ReadStored,
    /// Stored-position write of the given value, recorded even when it fails.
    WriteStored(i32),
    /// Live-position read.
    ReadLive,
    /// Calibration word read.
    ReadCalibration,
}

#[derive(Debug, Clone, Copy)]
struct LiveReadFailure {
    succeed: usize,
    code: u32,
}

#[derive(Debug, Clone, Copy)]
struct MoveFailure {
    code: u32,
    travelled: i32,
}

#[derive(Debug)]
struct MotorState {
    stored: i32,
    live: i32,
    origin: i32,
    words: [u32; 4],
    enabled: bool,
    polls_per_move: u32,
    polls_remaining: u32,
    moves_issued: usize,
    move_failures: HashMap<usize, MoveFailure>,
    poll_failure: Option<u32>,
    write_failure: Option<u32>,
    live_failure: Option<LiveReadFailure>,
    calls: Vec<MotorCall>,
}

/// Mock grating motor.
///
/// Relative moves update the live counter immediately and then report completion
/// after `polls_per_move` negative polls. The physical absolute position is
/// `initial stored position + live counter`, independent of later writes to the
/// stored position.
///
/// # Example
///
/// ```rust,ignore
/// let motor = MockPositionActuator::new(params, 1000);
/// motor.fail_move(1, 0x0800_0000, 0); // second move errors without moving
/// ```
#[derive(Debug, Clone)]
pub struct MockPositionActuator {
    state: Arc<Mutex<MotorState>>,
}

impl MockPositionActuator {
    /// Motor carrying `params` in its calibration memory, idle at `stored_position`.
    pub fn new(params: CalibrationParameters, stored_position: i32) -> Self {
        Self::with_words(params.to_words(), stored_position)
    }

    /// Motor with raw calibration words.
    pub fn with_words(words: [u32; 4], stored_position: i32) -> Self {
        Self {
            state: Arc::new(Mutex::new(MotorState {
                stored: stored_position,
                live: 0,
                origin: stored_position,
                words,
                enabled: false,
                polls_per_move: 1,
                polls_remaining: 0,
                moves_issued: 0,
                move_failures: HashMap::new(),
                poll_failure: None,
                write_failure: None,
                live_failure: None,
                calls: Vec::new(),
            })),
        }
    }

    /// Number of "not yet" polls before each move reports completion.
    pub fn with_polls_per_move(self, polls: u32) -> Self {
        self.state.lock().polls_per_move = polls;
        self
    }

    /// Make the `index`-th move (0-based) fail with `code` after travelling `travelled`.
    pub fn fail_move(&self, index: usize, code: u32, travelled: i32) {
        self.state
            .lock()
            .move_failures
            .insert(index, MoveFailure { code, travelled });
    }

    /// Make the next completion poll fail with `code`.
    pub fn fail_next_poll(&self, code: u32) {
        self.state.lock().poll_failure = Some(code);
    }

    /// Make every stored-position write fail with `code`.
    pub fn fail_writes(&self, code: u32) {
        self.state.lock().write_failure = Some(code);
    }

    /// Let the next `reads` live-position reads succeed, then fail every later one
    /// with `code`.
    pub fn fail_live_reads_after(&self, reads: usize, code: u32) {
        self.state.lock().live_failure = Some(LiveReadFailure {
            succeed: reads,
            code,
        });
    }

    /// Value in the persisted position register.
    pub fn stored_position(&self) -> i32 {
        self.state.lock().stored
    }

    /// Relative counter since power-up.
    pub fn live_position(&self) -> i32 {
        self.state.lock().live
    }

    /// True absolute position of the simulated grating.
    pub fn physical_position(&self) -> i32 {
        let state = self.state.lock();
        state.origin + state.live
    }

    /// Whether the drive is currently powered.
    pub fn is_enabled(&self) -> bool {
        self.state.lock().enabled
    }

    /// Every call made so far, in order.
    pub fn calls(&self) -> Vec<MotorCall> {
        self.state.lock().calls.clone()
    }

    /// Relative moves issued so far, in order.
    pub fn moves(&self) -> Vec<i32> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                MotorCall::MoveRelative(counts) => Some(counts),
                _ => None,
            })
            .collect()
    }

    /// Stored-position writes attempted so far, in order.
    pub fn writes(&self) -> Vec<i32> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                MotorCall::WriteStored(p) => Some(p),
                _ => None,
            })
            .collect()
    }

    /// Forget the call log, keeping positions and injected failures.
    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }
}

#[async_trait]
impl PositionActuator for MockPositionActuator {
    async fn enable(&self) -> HardwareResult<()> {
        let mut state = self.state.lock();
        state.calls.push(MotorCall::Enable);
        state.enabled = true;
        Ok(())
    }

    async fn disable(&self) -> HardwareResult<()> {
        let mut state = self.state.lock();
        state.calls.push(MotorCall::Disable);
        state.enabled = false;
        Ok(())
    }

    async fn move_relative(&self, counts: i32) -> HardwareResult<()> {
        let mut state = self.state.lock();
        state.calls.push(MotorCall::MoveRelative(counts));
        let index = state.moves_issued;
        state.moves_issued += 1;

        if let Some(failure) = state.move_failures.get(&index).copied() {
            state.live += failure.travelled;
            return Err(HardwareError::device(failure.code, "move_relative"));
        }
        if !state.enabled {
            return Err(HardwareError::device(0x3400_0000, "move_relative (disabled)"));
        }

        state.live += counts;
        state.polls_remaining = state.polls_per_move;
        Ok(())
    }

    async fn is_move_complete(&self) -> HardwareResult<bool> {
        let mut state = self.state.lock();
        state.calls.push(MotorCall::PollComplete);
        if let Some(code) = state.poll_failure.take() {
            return Err(HardwareError::device(code, "is_move_complete"));
        }
        if state.polls_remaining > 0 {
            state.polls_remaining -= 1;
            Ok(false)
        } else {
            Ok(true)
        }
    }

    async fn read_stored_position(&self) -> HardwareResult<i32> {
        let mut state = self.state.lock();
        state.calls.push(MotorCall::ReadStored);
        Ok(state.stored)
    }

    async fn write_stored_position(&self, position: i32) -> HardwareResult<()> {
        let mut state = self.state.lock();
        state.calls.push(MotorCall::WriteStored(position));
        if let Some(code) = state.write_failure {
            return Err(HardwareError::device(code, "write_stored_position"));
        }
        state.stored = position;
        Ok(())
    }

    async fn read_live_position(&self) -> HardwareResult<i32> {
        let mut state = self.state.lock();
        state.calls.push(MotorCall::ReadLive);
        if let Some(failure) = state.live_failure.as_mut() {
            if failure.succeed == 0 {
                return Err(HardwareError::device(failure.code, "read_live_position"));
            }
            failure.succeed -= 1;
        }
        Ok(state.live)
    }

    async fn read_calibration_words(&self) -> HardwareResult<[u32; 4]> {
        let mut state = self.state.lock();
        state.calls.push(MotorCall::ReadCalibration);
        Ok(state.words)
    }
}

// =============================================================================
// MockPiezo - Simulated Fine Actuator
// =============================================================================

#[derive(Debug)]
struct PiezoState {
    volts: f64,
    history: Vec<f64>,
    failure: Option<u32>,
}

/// Mock voltage-bounded piezo.
///
/// Records every accepted set-point; rejected (out-of-bounds) requests are not
/// recorded and leave the output unchanged.
#[derive(Debug, Clone)]
pub struct MockPiezo {
    limit: f64,
    state: Arc<Mutex<PiezoState>>,
}

impl Default for MockPiezo {
    fn default() -> Self {
        Self::new(DEFAULT_PIEZO_LIMIT)
    }
}

impl MockPiezo {
    /// Piezo accepting `-limit..=limit` volts, starting at 0 V.
    pub fn new(limit: f64) -> Self {
        Self {
            limit,
            state: Arc::new(Mutex::new(PiezoState {
                volts: 0.0,
                history: Vec::new(),
                failure: None,
            })),
        }
    }

    /// Start from a given output voltage.
    pub fn with_voltage(self, volts: f64) -> Self {
        self.state.lock().volts = volts;
        self
    }

    /// Make every `set` fail with a device error.
    pub fn fail_sets(&self, code: u32) {
        self.state.lock().failure = Some(code);
    }

    /// Current output voltage.
    pub fn voltage(&self) -> f64 {
        self.state.lock().volts
    }

    /// Accepted set-points, in order.
    pub fn history(&self) -> Vec<f64> {
        self.state.lock().history.clone()
    }

    /// Number of accepted set-points.
    pub fn set_count(&self) -> usize {
        self.state.lock().history.len()
    }
}

#[async_trait]
impl BoundedActuator for MockPiezo {
    fn limit(&self) -> f64 {
        self.limit
    }

    async fn get(&self) -> HardwareResult<f64> {
        Ok(self.state.lock().volts)
    }

    async fn set(&self, volts: f64) -> HardwareResult<()> {
        let mut state = self.state.lock();
        if let Some(code) = state.failure {
            return Err(HardwareError::device(code, "set piezo voltage"));
        }
        if volts.abs() > self.limit {
            return Err(HardwareError::OutOfBounds {
                requested: volts,
                min: -self.limit,
                max: self.limit,
            });
        }
        state.volts = volts;
        state.history.push(volts);
        Ok(())
    }
}

// =============================================================================
// MockWavemeter - Scripted Frequency Readings
// =============================================================================

#[derive(Debug, Default)]
struct WavemeterState {
    script: VecDeque<HardwareResult<Frequency>>,
    fallback: Option<Frequency>,
    reads: usize,
}

/// Wavemeter returning scripted readings, then repeating a fallback value.
#[derive(Debug, Clone, Default)]
pub struct MockWavemeter {
    state: Arc<Mutex<WavemeterState>>,
}

impl MockWavemeter {
    /// Always reads `frequency`.
    pub fn constant(frequency: Frequency) -> Self {
        let meter = Self::default();
        meter.set_fallback(frequency);
        meter
    }

    /// Reads `readings` in order, then keeps repeating the last one.
    pub fn scripted(readings: impl IntoIterator<Item = Frequency>) -> Self {
        let meter = Self::default();
        for f in readings {
            meter.push(f);
        }
        let last = meter.state.lock().script.back().cloned();
        if let Some(Ok(f)) = last {
            meter.set_fallback(f);
        }
        meter
    }

    /// Queue one more reading.
    pub fn push(&self, frequency: Frequency) {
        self.state.lock().script.push_back(Ok(frequency));
    }

    /// Queue a transport failure.
    pub fn push_error(&self, message: &str) {
        self.state
            .lock()
            .script
            .push_back(Err(HardwareError::Transport(message.to_string())));
    }

    /// Value returned once the script is exhausted.
    pub fn set_fallback(&self, frequency: Frequency) {
        self.state.lock().fallback = Some(frequency);
    }

    /// Number of reads served, failures included.
    pub fn read_count(&self) -> usize {
        self.state.lock().reads
    }
}

#[async_trait]
impl FrequencySource for MockWavemeter {
    async fn read(&self) -> HardwareResult<Frequency> {
        let mut state = self.state.lock();
        state.reads += 1;
        match state.script.pop_front() {
            Some(reading) => reading,
            None => state
                .fallback
                .ok_or_else(|| HardwareError::Transport("wavemeter has no reading".to_string())),
        }
    }
}

// =============================================================================
// SimulatedLaser - Motor + Piezo Physical Model
// =============================================================================

/// Wavemeter view of a laser driven by a [`MockPositionActuator`] and [`MockPiezo`].
///
/// `frequency = c / λ(physical position) - 1.5 GHz/V · piezo + drift`
#[derive(Debug, Clone)]
pub struct SimulatedLaser {
    model: CalibrationModel,
    motor: MockPositionActuator,
    piezo: MockPiezo,
    drift_ghz: Arc<Mutex<f64>>,
}

impl SimulatedLaser {
    /// Laser whose grating is `motor` and whose piezo is `piezo`, with no drift.
    pub fn new(model: CalibrationModel, motor: MockPositionActuator, piezo: MockPiezo) -> Self {
        Self {
            model,
            motor,
            piezo,
            drift_ghz: Arc::new(Mutex::new(0.0)),
        }
    }

    /// Offset the emitted frequency, e.g. to model thermal drift.
    pub fn set_drift(&self, ghz: f64) {
        *self.drift_ghz.lock() = ghz;
    }

    /// Current emitted frequency.
    pub fn frequency(&self) -> Frequency {
        let wavelength = self
            .model
            .position_to_wavelength(self.motor.physical_position());
        Frequency::from_ghz(
            Frequency::from_nm(wavelength).ghz() - SIMULATED_GHZ_PER_VOLT * self.piezo.voltage()
                + *self.drift_ghz.lock(),
        )
    }
}

#[async_trait]
impl FrequencySource for SimulatedLaser {
    async fn read(&self) -> HardwareResult<Frequency> {
        Ok(self.frequency())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> CalibrationParameters {
        CalibrationParameters {
            a: -2e-10,
            b: 1.6e-4,
            c: 750.0,
            min_wavelength_nm: 752.0,
            max_wavelength_nm: 772.0,
        }
    }

    #[tokio::test]
    async fn test_motor_move_and_poll() {
        let motor = MockPositionActuator::new(params(), 500).with_polls_per_move(2);
        motor.enable().await.unwrap();
        motor.move_relative(250).await.unwrap();
        assert!(!motor.is_move_complete().await.unwrap());
        assert!(!motor.is_move_complete().await.unwrap());
        assert!(motor.is_move_complete().await.unwrap());
        assert_eq!(motor.live_position(), 250);
        assert_eq!(motor.physical_position(), 750);
        // Stored position only changes when written
        assert_eq!(motor.stored_position(), 500);
    }

    #[tokio::test]
    async fn test_motor_failure_injection() {
        let motor = MockPositionActuator::new(params(), 0);
        motor.enable().await.unwrap();
        motor.fail_move(0, 0x0800_0000, 40);
        let err = motor.move_relative(100).await.unwrap_err();
        assert_eq!(err.code(), Some(0x0800_0000));
        assert_eq!(motor.live_position(), 40);
        // Failure consumed by index, the next move succeeds
        motor.move_relative(60).await.unwrap();
        assert_eq!(motor.moves(), vec![100, 60]);
    }

    #[tokio::test]
    async fn test_motor_rejects_move_while_disabled() {
        let motor = MockPositionActuator::new(params(), 0);
        assert!(motor.move_relative(10).await.is_err());
        assert_eq!(motor.live_position(), 0);
    }

    #[tokio::test]
    async fn test_calibration_words_round_trip() {
        let motor = MockPositionActuator::new(params(), 0);
        let words = motor.read_calibration_words().await.unwrap();
        let decoded = CalibrationParameters::from_words(words);
        assert!((decoded.a - params().a).abs() < 1e-15);
        assert_eq!(decoded.min_wavelength_nm, 752.0);
        assert_eq!(decoded.max_wavelength_nm, 772.0);
    }

    #[tokio::test]
    async fn test_piezo_bounds() {
        let piezo = MockPiezo::default();
        piezo.set(12.5).await.unwrap();
        let err = piezo.set(-13.5).await.unwrap_err();
        assert!(matches!(err, HardwareError::OutOfBounds { .. }));
        assert_eq!(piezo.voltage(), 12.5);
        assert_eq!(piezo.history(), vec![12.5]);
    }

    #[tokio::test]
    async fn test_wavemeter_script_then_fallback() {
        let meter = MockWavemeter::scripted([Frequency::from_ghz(1.0), Frequency::from_ghz(2.0)]);
        meter.push_error("link down");
        assert_eq!(meter.read().await.unwrap().ghz(), 1.0);
        assert_eq!(meter.read().await.unwrap().ghz(), 2.0);
        assert!(meter.read().await.is_err());
        assert_eq!(meter.read().await.unwrap().ghz(), 2.0);
        assert_eq!(meter.read_count(), 4);
    }

    #[tokio::test]
    async fn test_simulated_laser_follows_piezo() {
        let model = CalibrationModel::new(params()).unwrap();
        let motor = MockPositionActuator::new(params(), 100_000);
        let piezo = MockPiezo::default();
        let laser = SimulatedLaser::new(model, motor, piezo.clone());

        let before = laser.read().await.unwrap().ghz();
        piezo.set(1.0).await.unwrap();
        let after = laser.read().await.unwrap().ghz();
        assert!((before - after - SIMULATED_GHZ_PER_VOLT).abs() < 1e-6);
    }
}
