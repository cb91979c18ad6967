//! Coarse wavelength positioning via the grating motor.
//!
//! The motor keeps an absolute *stored position* in non-volatile memory. Every move
//! is measured with the controller's live counter and the stored position is
//! rewritten afterwards, whatever happened to the move itself. When that rewrite
//! fails the error carries the value that has to be restored by hand.
//!
//! Approaches from below always end with a positive move of `hysteresis_counts`, so
//! gear backlash is taken up in the same direction every time.

use std::sync::Arc;

use tokio::time::{sleep, Instant};
use tracing::Instrument;

use crate::calibration::{CalibrationModel, CalibrationParameters};
use crate::config::CoarseConfig;
use crate::error::{AppResult, TuningError};
use crate::frequency::Frequency;
use crate::hardware::capabilities::PositionActuator;

/// Relative moves reaching `diff` counts from the current position.
///
/// Negative travel overshoots by `hysteresis` and comes back up.
pub fn backlash_plan(diff: i32, hysteresis: i32) -> Vec<i32> {
    if diff < 0 {
        vec![diff.saturating_sub(hysteresis), hysteresis]
    } else {
        vec![diff]
    }
}

/// Grating motor with its calibration.
#[derive(Debug)]
pub struct CoarseActuator<P> {
    actuator: Arc<P>,
    model: CalibrationModel,
    config: CoarseConfig,
}

impl<P: PositionActuator + 'static> CoarseActuator<P> {
    /// Read the calibration from the motor and sanity-check its positions.
    ///
    /// `config.wavelength_bounds`, when set, replaces the range stored on the motor.
    pub async fn connect(actuator: P, config: &CoarseConfig) -> AppResult<Self> {
        let words = actuator.read_calibration_words().await?;
        let mut params = CalibrationParameters::from_words(words);
        if let Some([min, max]) = config.wavelength_bounds {
            params = params.with_bounds(min, max);
        }
        let model = CalibrationModel::new(params)?;

        let stored = actuator.read_stored_position().await?;
        let live = actuator.read_live_position().await?;
        tracing::info!(
            stored,
            live,
            wavelength_nm = model.position_to_wavelength(stored),
            min_nm = params.min_wavelength_nm,
            max_nm = params.max_wavelength_nm,
            "Coarse actuator connected"
        );

        Ok(Self {
            actuator: Arc::new(actuator),
            model,
            config: config.clone(),
        })
    }

    /// Calibration loaded from the motor, with any configured bounds applied.
    pub fn calibration(&self) -> &CalibrationModel {
        &self.model
    }

    /// Underlying motor.
    pub fn actuator(&self) -> &P {
        &self.actuator
    }

    /// Wavelength at the stored position, in nm.
    pub async fn wavelength(&self) -> AppResult<f64> {
        let stored = self.actuator.read_stored_position().await?;
        Ok(self.model.position_to_wavelength(stored))
    }

    /// Move the grating so that the laser emits near `target`.
    ///
    /// The moves and the stored-position write-back run on their own task, so they
    /// complete even if this future is dropped part-way.
    ///
    /// # Errors
    /// - `OutOfRange` before any device access if the target lies outside the
    ///   calibrated window
    /// - `CalibrationDesync` if the stored position could not be rewritten
    /// - any move failure, after the stored position has been rewritten
    pub async fn go_to_wavelength(&self, target: Frequency) -> AppResult<()> {
        let wavelength_nm = target.nm();
        self.model.check_range(wavelength_nm)?;

        let stored = self.actuator.read_stored_position().await?;
        let baseline = self.actuator.read_live_position().await?;
        let target_position = self.model.wavelength_to_position(wavelength_nm)?;
        let diff = target_position.saturating_sub(stored);
        let plan = backlash_plan(diff, self.config.hysteresis_counts);

        tracing::info!(
            wavelength_nm,
            stored,
            target_position,
            moves = ?plan,
            "Moving grating"
        );

        let sequence = MoveSequence {
            actuator: Arc::clone(&self.actuator),
            config: self.config.clone(),
            stored,
            baseline,
        };
        let position = tokio::spawn(sequence.run(plan).in_current_span())
            .await
            .map_err(|err| TuningError::MoveTask(err.to_string()))??;

        tracing::info!(
            position,
            wavelength_nm = self.model.position_to_wavelength(position),
            "Grating in position"
        );
        Ok(())
    }

    /// Re-reference the stored position to an externally measured wavelength.
    ///
    /// Recovery path after a `CalibrationDesync` when the logged value was lost.
    pub async fn set_reference_wavelength(&self, wavelength_nm: f64) -> AppResult<i32> {
        self.model.check_range(wavelength_nm)?;
        let position = self.model.wavelength_to_position(wavelength_nm)?;
        self.actuator.write_stored_position(position).await?;
        tracing::info!(wavelength_nm, position, "Stored position re-referenced");
        Ok(position)
    }
}

/// Moves of one `go_to_wavelength` call plus the write-back that must follow them.
struct MoveSequence<P> {
    actuator: Arc<P>,
    config: CoarseConfig,
    stored: i32,
    baseline: i32,
}

impl<P: PositionActuator> MoveSequence<P> {
    /// Run `plan`, then rewrite the stored position. Returns the new stored position.
    async fn run(self, plan: Vec<i32>) -> AppResult<i32> {
        let mut completed = 0i32;
        let mut outcome = Ok(());
        for counts in plan {
            outcome = self.move_relative(counts).await;
            if outcome.is_err() {
                break;
            }
            completed = completed.saturating_add(counts);
        }

        let written = self.write_back(completed).await;
        match (outcome, written) {
            (Err(move_err), Err(desync)) => {
                tracing::error!(error = %move_err, "Grating move failed before desync");
                Err(desync)
            }
            (Ok(()), Err(desync)) => Err(desync),
            (Err(move_err), Ok(position)) => {
                tracing::warn!(
                    error = %move_err,
                    position,
                    "Grating move failed; stored position updated to where the motor stopped"
                );
                Err(move_err)
            }
            (Ok(()), Ok(position)) => Ok(position),
        }
    }

    /// One relative move: enable, move, wait, disable. Disables on failure too.
    async fn move_relative(&self, counts: i32) -> AppResult<()> {
        let result = self.move_and_wait(counts).await;
        match self.actuator.disable().await {
            Ok(()) => result,
            Err(err) if result.is_err() => {
                tracing::warn!(error = %err, "Failed to disable motor after failed move");
                result
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn move_and_wait(&self, counts: i32) -> AppResult<()> {
        self.actuator.enable().await?;
        self.actuator.move_relative(counts).await?;

        let deadline = Instant::now() + self.config.move_timeout;
        loop {
            if self.actuator.is_move_complete().await? {
                tracing::debug!(counts, "Move complete");
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(TuningError::MoveTimeout {
                    counts,
                    timeout: self.config.move_timeout,
                });
            }
            sleep(self.config.poll_interval).await;
        }
    }

    /// Rewrite the stored position from the live displacement since `baseline`.
    ///
    /// Without a live reading the best estimate is `stored` plus the completed moves;
    /// it is reported for manual restore and not written.
    async fn write_back(&self, completed: i32) -> AppResult<i32> {
        let position = match self.actuator.read_live_position().await {
            Ok(live) => self.stored.wrapping_add(live.wrapping_sub(self.baseline)),
            Err(source) => {
                let position = self.stored.saturating_add(completed);
                tracing::error!(
                    position,
                    error = %source,
                    "Could not read live position; stored position must be manually set"
                );
                return Err(TuningError::CalibrationDesync { position, source });
            }
        };

        if let Err(source) = self.actuator.write_stored_position(position).await {
            tracing::error!(
                position,
                error = %source,
                "Failed to write back stored position; stored position must be manually set"
            );
            return Err(TuningError::CalibrationDesync { position, source });
        }
        Ok(position)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::{MockPositionActuator, MotorCall};
    use std::time::Duration;
    use tracing_test::traced_test;

    fn params() -> CalibrationParameters {
        CalibrationParameters {
            a: -2e-10,
            b: 1.6e-4,
            c: 750.0,
            min_wavelength_nm: 752.0,
            max_wavelength_nm: 772.0,
        }
    }

    async fn connected(stored: i32) -> (CoarseActuator<MockPositionActuator>, MockPositionActuator) {
        let motor = MockPositionActuator::new(params(), stored);
        let coarse = CoarseActuator::connect(motor.clone(), &CoarseConfig::default())
            .await
            .unwrap();
        motor.clear_calls();
        (coarse, motor)
    }

    /// Target frequency and the position the loaded calibration maps it to.
    fn target_near(coarse: &CoarseActuator<MockPositionActuator>, position: i32) -> (Frequency, i32) {
        let target = Frequency::from_nm(coarse.calibration().position_to_wavelength(position));
        let expected = coarse
            .calibration()
            .wavelength_to_position(target.nm())
            .unwrap();
        (target, expected)
    }

    #[test]
    fn test_backlash_plan() {
        assert_eq!(backlash_plan(-100, 10_000), vec![-10_100, 10_000]);
        assert_eq!(backlash_plan(0, 10_000), vec![0]);
        assert_eq!(backlash_plan(250, 10_000), vec![250]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_forward_move_is_single() {
        let (coarse, motor) = connected(50_000).await;
        let (target, expected) = target_near(&coarse, 100_000);

        coarse.go_to_wavelength(target).await.unwrap();

        assert_eq!(motor.moves(), vec![expected - 50_000]);
        assert_eq!(motor.stored_position(), expected);
        assert_eq!(motor.physical_position(), expected);
        assert!(!motor.is_enabled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_backward_move_takes_up_backlash() {
        let (coarse, motor) = connected(100_000).await;
        let (target, expected) = target_near(&coarse, 90_000);
        let diff = expected - 100_000;

        coarse.go_to_wavelength(target).await.unwrap();

        assert_eq!(motor.moves(), vec![diff - 10_000, 10_000]);
        assert_eq!(motor.writes(), vec![expected]);
        assert_eq!(motor.physical_position(), expected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_each_move_is_enabled_polled_and_disabled() {
        let (coarse, motor) = connected(50_000).await;
        let (target, expected) = target_near(&coarse, 60_000);

        coarse.go_to_wavelength(target).await.unwrap();

        assert_eq!(
            motor.calls(),
            vec![
                MotorCall::ReadStored,
                MotorCall::ReadLive,
                MotorCall::Enable,
                MotorCall::MoveRelative(expected - 50_000),
                MotorCall::PollComplete,
                MotorCall::PollComplete,
                MotorCall::Disable,
                MotorCall::ReadLive,
                MotorCall::WriteStored(expected),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_second_move_still_writes_back_once() {
        let (coarse, motor) = connected(100_000).await;
        let (target, expected) = target_near(&coarse, 90_000);
        let first = expected - 100_000 - 10_000;
        motor.fail_move(1, 0x0800_0000, 4_000);

        let err = coarse.go_to_wavelength(target).await.unwrap_err();

        match err {
            TuningError::Hardware(hw) => assert_eq!(hw.code(), Some(0x0800_0000)),
            other => panic!("unexpected error {other:?}"),
        }
        assert_eq!(motor.writes(), vec![100_000 + first + 4_000]);
        assert_eq!(motor.stored_position(), motor.physical_position());
        assert!(!motor.is_enabled());
    }

    #[tokio::test]
    async fn test_out_of_range_touches_nothing() {
        let (coarse, motor) = connected(100_000).await;

        let err = coarse
            .go_to_wavelength(Frequency::from_nm(790.0))
            .await
            .unwrap_err();

        assert!(matches!(err, TuningError::OutOfRange { .. }));
        assert!(motor.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn test_write_failure_reports_position_to_restore() {
        let (coarse, motor) = connected(50_000).await;
        let (target, expected) = target_near(&coarse, 60_000);
        motor.fail_writes(0x0503_0000);

        let err = coarse.go_to_wavelength(target).await.unwrap_err();

        match err {
            TuningError::CalibrationDesync { position, ref source } => {
                assert_eq!(position, expected);
                assert_eq!(source.code(), Some(0x0503_0000));
            }
            ref other => panic!("unexpected error {other:?}"),
        }
        assert!(err.to_string().contains(&format!("manually set to {expected}")));
        assert!(logs_contain("stored position must be manually set"));
        assert_eq!(motor.writes().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreadable_live_position_reports_estimate() {
        let (coarse, motor) = connected(50_000).await;
        let (target, expected) = target_near(&coarse, 60_000);
        motor.fail_live_reads_after(1, 0x0602_0000);

        let err = coarse.go_to_wavelength(target).await.unwrap_err();

        match err {
            TuningError::CalibrationDesync { position, ref source } => {
                assert_eq!(position, 50_000 + (expected - 50_000));
                assert_eq!(source.code(), Some(0x0602_0000));
            }
            ref other => panic!("unexpected error {other:?}"),
        }
        assert!(err.to_string().contains("during read_live_position"));
        assert!(motor.writes().is_empty());
        assert_eq!(motor.stored_position(), 50_000);
        assert!(!motor.is_enabled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_poll_disables_and_writes_back_once() {
        let (coarse, motor) = connected(50_000).await;
        let (target, expected) = target_near(&coarse, 60_000);
        motor.fail_next_poll(0x9);

        let err = coarse.go_to_wavelength(target).await.unwrap_err();

        match err {
            TuningError::Hardware(hw) => assert_eq!(hw.code(), Some(0x9)),
            other => panic!("unexpected error {other:?}"),
        }
        assert_eq!(motor.writes(), vec![expected]);
        assert!(!motor.is_enabled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_move_still_disables_and_writes_back() {
        let motor = MockPositionActuator::new(params(), 50_000).with_polls_per_move(20);
        let coarse = CoarseActuator::connect(motor.clone(), &CoarseConfig::default())
            .await
            .unwrap();
        let (target, expected) = target_near(&coarse, 60_000);

        let cut_short =
            tokio::time::timeout(Duration::from_secs(1), coarse.go_to_wavelength(target)).await;
        assert!(cut_short.is_err());
        assert!(motor.is_enabled());

        tokio::time::sleep(Duration::from_secs(10)).await;

        assert_eq!(motor.writes(), vec![expected]);
        assert_eq!(motor.stored_position(), motor.physical_position());
        assert!(!motor.is_enabled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_move_timeout_still_writes_back() {
        let motor = MockPositionActuator::new(params(), 50_000).with_polls_per_move(u32::MAX);
        let config = CoarseConfig {
            move_timeout: Duration::from_secs(2),
            ..CoarseConfig::default()
        };
        let coarse = CoarseActuator::connect(motor.clone(), &config).await.unwrap();
        let (target, expected) = target_near(&coarse, 60_000);

        let err = coarse.go_to_wavelength(target).await.unwrap_err();

        assert!(matches!(err, TuningError::MoveTimeout { .. }));
        assert_eq!(motor.writes(), vec![expected]);
        assert!(!motor.is_enabled());
    }

    #[tokio::test]
    async fn test_bounds_override_and_re_reference() {
        let motor = MockPositionActuator::new(params(), 0);
        let config = CoarseConfig {
            wavelength_bounds: Some([760.0, 765.0]),
            ..CoarseConfig::default()
        };
        let coarse = CoarseActuator::connect(motor.clone(), &config).await.unwrap();

        assert!(coarse.set_reference_wavelength(770.0).await.is_err());
        let position = coarse.set_reference_wavelength(764.0).await.unwrap();
        assert_eq!(motor.stored_position(), position);
        assert!((coarse.wavelength().await.unwrap() - 764.0).abs() < 1e-3);
    }
}
