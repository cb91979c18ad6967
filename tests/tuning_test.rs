//! End-to-end tuning against the simulated laser.

use std::time::Duration;

use laser_tuning::calibration::{CalibrationModel, CalibrationParameters};
use laser_tuning::config::TuningConfig;
use laser_tuning::fine_lock::LockState;
use laser_tuning::hardware::mock::{MockPiezo, MockPositionActuator, SimulatedLaser};
use laser_tuning::{Frequency, TuningError, TuningOrchestrator};
use tokio_test::{assert_err, assert_ok};

type SimOrchestrator = TuningOrchestrator<MockPositionActuator, SimulatedLaser, MockPiezo>;

/// Grating calibration used throughout: ascending over 752-772 nm, vertex at 400 000.
fn calibration() -> CalibrationParameters {
    CalibrationParameters {
        a: -2e-10,
        b: 1.6e-4,
        c: 750.0,
        min_wavelength_nm: 752.0,
        max_wavelength_nm: 772.0,
    }
}

struct Rig {
    motor: MockPositionActuator,
    piezo: MockPiezo,
    laser: SimulatedLaser,
    orchestrator: SimOrchestrator,
}

async fn rig_with_piezo(stored: i32, piezo: MockPiezo) -> Rig {
    let motor = MockPositionActuator::new(calibration(), stored);
    // The motor only holds the lossy firmware encoding
    let model =
        CalibrationModel::new(CalibrationParameters::from_words(calibration().to_words())).unwrap();
    let laser = SimulatedLaser::new(model, motor.clone(), piezo.clone());
    let orchestrator = TuningOrchestrator::connect(
        motor.clone(),
        laser.clone(),
        piezo.clone(),
        &TuningConfig::default(),
    )
    .await
    .unwrap();
    motor.clear_calls();
    Rig {
        motor,
        piezo,
        laser,
        orchestrator,
    }
}

async fn rig(stored: i32) -> Rig {
    rig_with_piezo(stored, MockPiezo::default()).await
}

fn detuning_ghz(rig: &Rig, target: Frequency) -> f64 {
    (rig.laser.frequency() - target).ghz()
}

#[tokio::test(start_paused = true)]
async fn test_tune_compensates_drift_with_piezo() {
    let rig = rig(120_000).await;
    rig.laser.set_drift(2.0);
    let target = Frequency::from_nm(758.0);

    let outcome = assert_ok!(rig.orchestrator.tune_to(target, Duration::from_secs(30)).await);

    assert!(outcome.locked);
    assert!(detuning_ghz(&rig, target).abs() < 0.02);
    // 2 GHz of drift at 1.5 GHz/V, plus whatever the grating left over
    assert!((rig.piezo.voltage() - 2.0 / 1.5).abs() < 0.1);
    // Approached from above: overshoot and come back up
    let moves = rig.motor.moves();
    assert_eq!(moves.len(), 2);
    assert_eq!(moves[1], 10_000);
    assert_eq!(rig.motor.stored_position(), rig.motor.physical_position());
    assert!(!rig.orchestrator.fine().is_locking());
}

#[tokio::test]
async fn test_out_of_range_target_touches_no_device() {
    let rig = rig(100_000).await;

    let err = assert_err!(
        rig.orchestrator
            .tune_to(Frequency::from_nm(790.0), Duration::from_secs(5))
            .await
    );

    assert!(matches!(err, TuningError::OutOfRange { .. }));
    assert!(rig.motor.calls().is_empty());
    assert_eq!(rig.piezo.set_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_desync_aborts_tuning() {
    let rig = rig(50_000).await;
    rig.motor.fail_writes(0x0503_0000);

    let err = assert_err!(
        rig.orchestrator
            .tune_to(Frequency::from_nm(764.0), Duration::from_secs(5))
            .await
    );

    assert!(err.is_desync());
    assert_eq!(rig.motor.writes().len(), 1);
    assert_eq!(rig.piezo.set_count(), 0);
    assert!(!rig.orchestrator.fine().is_locking());
}

#[tokio::test(start_paused = true)]
async fn test_hold_relocks_after_disturbance() {
    let rig = rig(50_000).await;
    let target = Frequency::from_nm(764.0);

    let handle = assert_ok!(rig.orchestrator.hold(target).await);
    assert!(handle.wait_locked(Duration::from_secs(20)).await);

    let mut states = handle.subscribe();
    rig.laser.set_drift(0.5);
    let lost = tokio::time::timeout(
        Duration::from_secs(1),
        states.wait_for(|s| *s == LockState::Searching),
    )
    .await
    .map(|r| r.is_ok());
    assert_eq!(lost, Ok(true));

    assert!(handle.wait_locked(Duration::from_secs(20)).await);
    assert!(detuning_ghz(&rig, target).abs() < 0.01);

    assert_ok!(rig.orchestrator.release().await);
    assert_eq!(handle.state(), LockState::Cancelled);
    assert!(!rig.orchestrator.fine().is_locking());
}

#[tokio::test(start_paused = true)]
async fn test_hold_gives_up_when_piezo_cannot_reach() {
    let rig = rig_with_piezo(50_000, MockPiezo::new(0.05)).await;
    rig.laser.set_drift(2.0);

    let handle = assert_ok!(rig.orchestrator.hold(Frequency::from_nm(764.0)).await);
    let err = assert_err!(handle.finished().await);

    assert!(matches!(err, TuningError::FailedToLockLaser { .. }));
    assert!(rig.piezo.voltage().abs() <= 0.05);
    assert!(!rig.orchestrator.fine().is_locking());
    // Already given up, so releasing is not an error
    assert_ok!(rig.orchestrator.release().await);
}

#[tokio::test(start_paused = true)]
async fn test_retune_cancels_held_lock() {
    let rig = rig(50_000).await;

    let held = assert_ok!(rig.orchestrator.hold(Frequency::from_nm(764.0)).await);
    assert!(held.wait_locked(Duration::from_secs(20)).await);

    let outcome = assert_ok!(rig.orchestrator.tune(Frequency::from_nm(766.0)).await);

    assert_eq!(held.state(), LockState::Cancelled);
    assert!(outcome.locked);
}
