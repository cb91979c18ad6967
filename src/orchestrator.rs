//! Coarse-then-fine tuning.
//!
//! [`TuningOrchestrator`] sequences the grating move and the piezo lock: move close,
//! lock tightly, report whether the laser made it to the target.

use std::time::Duration;

use tokio::time::Instant;

use crate::coarse::CoarseActuator;
use crate::config::{TuneConfig, TuningConfig};
use crate::error::{AppResult, TuningError};
use crate::fine_lock::{FineLockController, LockHandle, LockParams};
use crate::frequency::Frequency;
use crate::hardware::capabilities::{BoundedActuator, FrequencySource, PositionActuator};

/// Result of a [`TuningOrchestrator::tune_to`] request.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TuneOutcome {
    /// Requested frequency.
    pub target: Frequency,
    /// Whether lock was reached before the deadline.
    pub locked: bool,
    /// Time from request to lock (or to giving up), coarse move included.
    pub elapsed: Duration,
}

/// Owns the coarse actuator and the lock controller of one laser.
pub struct TuningOrchestrator<P, F, A> {
    coarse: CoarseActuator<P>,
    fine: FineLockController<F, A>,
    tune: TuneConfig,
}

impl<P, F, A> TuningOrchestrator<P, F, A>
where
    P: PositionActuator + 'static,
    F: FrequencySource + 'static,
    A: BoundedActuator + 'static,
{
    /// Orchestrator over already connected stages.
    pub fn new(coarse: CoarseActuator<P>, fine: FineLockController<F, A>, tune: TuneConfig) -> Self {
        Self { coarse, fine, tune }
    }

    /// Connect the motor and build both stages from one configuration.
    pub async fn connect(
        motor: P,
        source: F,
        piezo: A,
        config: &TuningConfig,
    ) -> AppResult<Self> {
        let coarse = CoarseActuator::connect(motor, &config.coarse).await?;
        let fine = FineLockController::new(source, piezo, config.lock.clone());
        Ok(Self::new(coarse, fine, config.tune.clone()))
    }

    /// Grating stage.
    pub fn coarse(&self) -> &CoarseActuator<P> {
        &self.coarse
    }

    /// Piezo lock stage.
    pub fn fine(&self) -> &FineLockController<F, A> {
        &self.fine
    }

    /// Move to `target`, lock with the tuning tolerance and report the result.
    ///
    /// The lock session is always stopped before returning, locked or not.
    ///
    /// # Errors
    /// Coarse-stage errors propagate unchanged; failing to lock is reported through
    /// [`TuneOutcome::locked`], not as an error.
    pub async fn tune_to(&self, target: Frequency, timeout: Duration) -> AppResult<TuneOutcome> {
        let started = Instant::now();
        self.release().await?;
        self.coarse.go_to_wavelength(target).await?;

        let params = LockParams::new(target, self.fine.config())
            .with_tolerance(Frequency::from_ghz(self.tune.tolerance_ghz))
            .with_stable_after(self.tune.stable_after);
        let handle = self.fine.lock(params).await?;
        let locked = handle.wait_locked(timeout).await;
        let elapsed = started.elapsed();
        self.release().await?;

        if locked {
            tracing::info!(target_ghz = target.ghz(), ?elapsed, "Tuned");
        } else {
            tracing::warn!(target_ghz = target.ghz(), ?elapsed, "Tuning did not lock in time");
        }
        Ok(TuneOutcome {
            target,
            locked,
            elapsed,
        })
    }

    /// [`tune_to`](Self::tune_to) with the configured timeout.
    pub async fn tune(&self, target: Frequency) -> AppResult<TuneOutcome> {
        self.tune_to(target, self.tune.timeout).await
    }

    /// Move to `target` and keep a cold lock running until [`release`](Self::release).
    pub async fn hold(&self, target: Frequency) -> AppResult<LockHandle> {
        self.release().await?;
        self.coarse.go_to_wavelength(target).await?;
        let params = LockParams::new(target, self.fine.config());
        self.fine.lock(params).await
    }

    /// Stop any running lock session and wait for it to exit.
    ///
    /// A session that had already given up is not an error here.
    pub async fn release(&self) -> AppResult<()> {
        match self.fine.stop().await {
            Ok(()) | Err(TuningError::FailedToLockLaser { .. }) => Ok(()),
            Err(err) => Err(err),
        }
    }
}
