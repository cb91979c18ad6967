//! Piezo PI frequency lock.
//!
//! A [`FineLockController`] runs at most one lock session at a time. Each session is
//! a spawned tokio task that owns all loop state: it reads the wavemeter every
//! `period`, feeds the detuning through a [`PiLoop`] and nudges the piezo with
//! [`apply_response`]. Callers observe a session through its [`LockHandle`].
//!
//! ```text
//! Starting -> Searching <-> Locked -> Cancelled
//!                 |
//!                 +-> Failed (no lock within `timeout` of the last search start)
//! ```
//!
//! The give-up timer restarts every time lock is lost, so a locked laser that drifts
//! away gets a full `timeout` to recover.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, Instant, MissedTickBehavior};
use tracing::Instrument;

use crate::config::{ConfigError, LockConfig};
use crate::error::{AppResult, HardwareError, TuningError};
use crate::frequency::Frequency;
use crate::hardware::capabilities::{BoundedActuator, FrequencySource};

/// Per-session lock parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LockParams {
    /// Frequency the loop steers towards.
    pub setpoint: Frequency,
    /// Detuning magnitude accepted as "on target".
    pub tolerance: Frequency,
    /// In-tolerance samples that must be strictly exceeded before declaring lock.
    pub stable_after: u32,
    /// Proportional gain, dimensionless.
    pub p: f64,
    /// Weight of the windowed error mean relative to the instantaneous error.
    pub i: f64,
    /// Integration window in samples.
    pub tau: usize,
}

impl LockParams {
    /// Cold-lock parameters from configuration.
    pub fn new(setpoint: Frequency, config: &LockConfig) -> Self {
        Self {
            setpoint,
            tolerance: Frequency::from_ghz(config.tolerance_ghz),
            stable_after: config.stable_after,
            p: config.p,
            i: config.i,
            tau: config.tau,
        }
    }

    /// Replace the lock tolerance, e.g. a tighter one for tuning requests.
    pub fn with_tolerance(mut self, tolerance: Frequency) -> Self {
        self.tolerance = tolerance;
        self
    }

    /// Replace the number of stable samples required for lock.
    pub fn with_stable_after(mut self, stable_after: u32) -> Self {
        self.stable_after = stable_after;
        self
    }

    /// Replace both PI gains.
    pub fn with_gains(mut self, p: f64, i: f64) -> Self {
        self.p = p;
        self.i = i;
        self
    }

    /// Replace the integration window.
    pub fn with_tau(mut self, tau: usize) -> Self {
        self.tau = tau;
        self
    }

    fn validate(&self) -> AppResult<()> {
        let invalid = |msg: String| Err(TuningError::Config(ConfigError::ValidationError(msg)));
        if self.tau == 0 {
            return invalid("lock tau must be at least 1".to_string());
        }
        let tol = self.tolerance.ghz();
        if !(tol.is_finite() && tol > 0.0) {
            return invalid(format!("lock tolerance must be positive, got {tol} GHz"));
        }
        if !(self.setpoint.ghz().is_finite() && self.p.is_finite() && self.i.is_finite()) {
            return invalid("lock setpoint and gains must be finite".to_string());
        }
        Ok(())
    }
}

/// Observable lifecycle of a lock session.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LockState {
    /// Spawned, first sample not taken yet.
    Starting,
    /// Steering towards the setpoint without a stable lock.
    Searching,
    /// Detuning has stayed within tolerance for long enough.
    Locked,
    /// Stopped on request.
    Cancelled,
    /// Gave up after searching for longer than the configured timeout.
    Failed { elapsed: Duration },
}

impl LockState {
    /// Whether the session has ended.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Cancelled | Self::Failed { .. })
    }
}

/// Lock status change produced by one [`PiLoop::update`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockTransition {
    /// Lock status is the same as before the sample.
    Unchanged,
    /// Searching to locked.
    Acquired,
    /// Locked to searching after an out-of-tolerance sample.
    Lost,
}

/// Proportional-integral loop state, free of any I/O.
#[derive(Debug, Clone)]
pub struct PiLoop {
    kp: f64,
    i: f64,
    tolerance_ghz: f64,
    stable_after: u32,
    history: VecDeque<f64>,
    tau: usize,
    counter: u32,
    locked: bool,
}

impl PiLoop {
    /// `kp_scale` converts GHz of detuning into volts (sensitivity times damping).
    pub fn new(params: &LockParams, kp_scale: f64) -> Self {
        let tau = params.tau.max(1);
        Self {
            kp: params.p * kp_scale,
            i: params.i,
            tolerance_ghz: params.tolerance.ghz().abs(),
            stable_after: params.stable_after,
            history: VecDeque::with_capacity(tau),
            tau,
            counter: 0,
            locked: false,
        }
    }

    /// Whether the loop currently considers itself locked.
    pub fn is_locked(&self) -> bool {
        self.locked
    }

    /// Consecutive in-tolerance samples while searching.
    pub fn stable_count(&self) -> u32 {
        self.counter
    }

    /// Mean of the retained error samples.
    pub fn integral(&self) -> f64 {
        if self.history.is_empty() {
            0.0
        } else {
            self.history.iter().sum::<f64>() / self.history.len() as f64
        }
    }

    /// Feed one detuning sample (measured minus setpoint, GHz).
    ///
    /// Returns the actuator response in volts and any change in lock status.
    pub fn update(&mut self, error_ghz: f64) -> (f64, LockTransition) {
        let mut transition = LockTransition::Unchanged;

        if error_ghz.abs() < self.tolerance_ghz {
            if !self.locked {
                self.counter += 1;
            }
        } else {
            self.counter = 0;
            if self.locked {
                self.locked = false;
                transition = LockTransition::Lost;
            }
        }

        if !self.locked && self.counter > self.stable_after {
            self.locked = true;
            transition = LockTransition::Acquired;
        }

        if self.history.len() == self.tau {
            self.history.pop_front();
        }
        self.history.push_back(error_ghz);

        let response = self.kp * (error_ghz + self.i * self.integral());
        (response, transition)
    }
}

/// Result of trying to apply one loop response to the piezo.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    /// Step in volts that was applied.
    Applied(f64),
    /// The scaled step fell below the minimum; nothing was sent.
    TooSmall,
    /// Every scaling attempt was too large or out of bounds.
    Exhausted,
    /// The actuator failed for another reason; nothing changed.
    DeviceError(HardwareError),
}

/// Apply `response` volts to `actuator`, starting from `voltage`.
///
/// The step is divided by ten until it is at most `max_step_volts` and the resulting
/// set-point is within bounds, for at most `scale_attempts` tries. A step below
/// `min_step_volts` is skipped. `voltage` is updated only when a set succeeds.
pub async fn apply_response<A: BoundedActuator + ?Sized>(
    actuator: &A,
    voltage: &mut f64,
    response: f64,
    config: &LockConfig,
) -> StepOutcome {
    if !response.is_finite() {
        return StepOutcome::Exhausted;
    }
    let mut step = response;
    for _ in 0..config.scale_attempts {
        let attempt = step;
        step /= 10.0;
        if attempt.abs() > config.max_step_volts {
            continue;
        }
        if attempt.abs() < config.min_step_volts {
            return StepOutcome::TooSmall;
        }
        match actuator.set(*voltage + attempt).await {
            Ok(()) => {
                *voltage += attempt;
                return StepOutcome::Applied(attempt);
            }
            Err(HardwareError::OutOfBounds { .. }) => continue,
            Err(err) => return StepOutcome::DeviceError(err),
        }
    }
    StepOutcome::Exhausted
}

/// Caller's view of one lock session.
#[derive(Debug, Clone)]
pub struct LockHandle {
    setpoint: Frequency,
    locked: watch::Receiver<bool>,
    state: watch::Receiver<LockState>,
}

impl LockHandle {
    /// Frequency this session steers towards.
    pub fn setpoint(&self) -> Frequency {
        self.setpoint
    }

    /// Current value of the session's lock flag.
    pub fn is_locked(&self) -> bool {
        *self.locked.borrow()
    }

    /// Latest published state.
    pub fn state(&self) -> LockState {
        *self.state.borrow()
    }

    /// Receiver for state changes.
    pub fn subscribe(&self) -> watch::Receiver<LockState> {
        self.state.clone()
    }

    /// Wait up to `limit` for the lock flag. Returns immediately if already locked.
    pub async fn wait_locked(&self, limit: Duration) -> bool {
        let mut locked = self.locked.clone();
        let result = timeout(limit, locked.wait_for(|l| *l)).await;
        matches!(result, Ok(Ok(_)))
    }

    /// Wait for the session to end.
    ///
    /// # Errors
    /// `FailedToLockLaser` if the session gave up; `LockTask` if it ended without
    /// reporting a terminal state.
    pub async fn finished(&self) -> AppResult<()> {
        let mut state = self.state.clone();
        let terminal = state.wait_for(LockState::is_terminal).await.map(|s| *s);
        let last = terminal.unwrap_or_else(|_| *state.borrow());
        match last {
            LockState::Cancelled => Ok(()),
            LockState::Failed { elapsed } => Err(TuningError::FailedToLockLaser { elapsed }),
            other => Err(TuningError::LockTask(format!(
                "lock session ended in state {other:?}"
            ))),
        }
    }
}

#[derive(Debug, Default)]
struct SessionFlags {
    cancel: AtomicBool,
    locking: AtomicBool,
}

/// Runs piezo lock sessions against a frequency source.
pub struct FineLockController<F, A> {
    source: Arc<F>,
    actuator: Arc<A>,
    config: LockConfig,
    flags: Arc<SessionFlags>,
    session: Mutex<Option<JoinHandle<AppResult<()>>>>,
}

impl<F, A> FineLockController<F, A>
where
    F: FrequencySource + 'static,
    A: BoundedActuator + 'static,
{
    /// Controller with no session running.
    pub fn new(source: F, actuator: A, config: LockConfig) -> Self {
        Self {
            source: Arc::new(source),
            actuator: Arc::new(actuator),
            config,
            flags: Arc::new(SessionFlags::default()),
            session: Mutex::new(None),
        }
    }

    /// Loop configuration shared by every session.
    pub fn config(&self) -> &LockConfig {
        &self.config
    }

    /// Whether a session is currently running.
    pub fn is_locking(&self) -> bool {
        self.flags.locking.load(Ordering::SeqCst)
    }

    /// Ask the running session to exit at its next iteration. Idempotent.
    pub fn stop_locking(&self) {
        self.flags.cancel.store(true, Ordering::SeqCst);
    }

    /// Start a session, first cancelling and awaiting any previous one.
    pub async fn lock(&self, params: LockParams) -> AppResult<LockHandle> {
        params.validate()?;
        if self.config.period.is_zero() {
            return Err(TuningError::Config(ConfigError::ValidationError(
                "lock.period must be non-zero".to_string(),
            )));
        }

        let mut session = self.session.lock().await;
        self.flags.cancel.store(true, Ordering::SeqCst);
        if let Some(previous) = session.take() {
            match join_session(previous).await {
                Ok(()) => tracing::debug!("Previous lock session cancelled"),
                Err(err) => tracing::debug!(error = %err, "Previous lock session ended with error"),
            }
        }
        self.flags.locking.store(false, Ordering::SeqCst);
        self.flags.cancel.store(false, Ordering::SeqCst);

        let voltage = self.actuator.get().await?;
        let (locked_tx, locked_rx) = watch::channel(false);
        let (state_tx, state_rx) = watch::channel(LockState::Starting);

        let span = tracing::info_span!("lock_session", setpoint_ghz = params.setpoint.ghz());
        let lock_loop = LockLoop {
            source: Arc::clone(&self.source),
            actuator: Arc::clone(&self.actuator),
            config: self.config.clone(),
            params,
            flags: Arc::clone(&self.flags),
            locked: locked_tx,
            state: state_tx,
        };

        self.flags.locking.store(true, Ordering::SeqCst);
        *session = Some(tokio::spawn(lock_loop.run(voltage).instrument(span)));
        tracing::info!(
            setpoint_ghz = params.setpoint.ghz(),
            tolerance_ghz = params.tolerance.ghz(),
            stable_after = params.stable_after,
            start_volts = voltage,
            "Lock session started"
        );

        Ok(LockHandle {
            setpoint: params.setpoint,
            locked: locked_rx,
            state: state_rx,
        })
    }

    /// Cancel the running session and wait for it to exit.
    ///
    /// Returns the session's own result: `Ok` when it was cancelled, or
    /// `FailedToLockLaser` when it had already given up.
    pub async fn stop(&self) -> AppResult<()> {
        self.stop_locking();
        let mut session = self.session.lock().await;
        let result = match session.take() {
            Some(task) => join_session(task).await,
            None => Ok(()),
        };
        self.flags.locking.store(false, Ordering::SeqCst);
        result
    }
}

impl<F, A> Drop for FineLockController<F, A> {
    fn drop(&mut self) {
        self.flags.cancel.store(true, Ordering::SeqCst);
    }
}

async fn join_session(task: JoinHandle<AppResult<()>>) -> AppResult<()> {
    task.await
        .map_err(|err| TuningError::LockTask(err.to_string()))?
}

/// State owned by one spawned session.
struct LockLoop<F, A> {
    source: Arc<F>,
    actuator: Arc<A>,
    config: LockConfig,
    params: LockParams,
    flags: Arc<SessionFlags>,
    locked: watch::Sender<bool>,
    state: watch::Sender<LockState>,
}

impl<F: FrequencySource, A: BoundedActuator> LockLoop<F, A> {
    async fn run(self, mut voltage: f64) -> AppResult<()> {
        let mut pi = PiLoop::new(&self.params, self.config.gain_scale());
        let mut search_start = Instant::now();
        let mut ticker = interval(self.config.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.state.send_replace(LockState::Searching);

        loop {
            ticker.tick().await;

            if self.flags.cancel.load(Ordering::SeqCst) {
                self.flags.locking.store(false, Ordering::SeqCst);
                self.locked.send_replace(false);
                self.state.send_replace(LockState::Cancelled);
                tracing::info!(volts = voltage, "Lock session cancelled");
                return Ok(());
            }

            let elapsed = search_start.elapsed();
            if !pi.is_locked() && elapsed > self.config.timeout {
                self.flags.cancel.store(true, Ordering::SeqCst);
                self.flags.locking.store(false, Ordering::SeqCst);
                self.state.send_replace(LockState::Failed { elapsed });
                tracing::error!(?elapsed, volts = voltage, "Failed to lock laser");
                return Err(TuningError::FailedToLockLaser { elapsed });
            }

            let current = match self.source.read().await {
                Ok(frequency) => frequency,
                Err(err) => {
                    tracing::warn!(error = %err, "Frequency read failed; skipping iteration");
                    continue;
                }
            };
            let error_ghz = current.ghz() - self.params.setpoint.ghz();
            let (response, transition) = pi.update(error_ghz);

            match transition {
                LockTransition::Acquired => {
                    self.locked.send_replace(true);
                    self.state.send_replace(LockState::Locked);
                    tracing::info!(
                        error_ghz,
                        volts = voltage,
                        after = ?search_start.elapsed(),
                        "Laser locked"
                    );
                }
                LockTransition::Lost => {
                    self.locked.send_replace(false);
                    self.state.send_replace(LockState::Searching);
                    search_start = Instant::now();
                    tracing::warn!(error_ghz, volts = voltage, "Lock lost; searching");
                }
                LockTransition::Unchanged => {}
            }

            match apply_response(&*self.actuator, &mut voltage, response, &self.config).await {
                StepOutcome::Applied(step) => {
                    tracing::trace!(error_ghz, response, step, volts = voltage, "Piezo step");
                }
                StepOutcome::TooSmall => {}
                StepOutcome::Exhausted => {
                    tracing::warn!(response, volts = voltage, "No piezo step within bounds");
                }
                StepOutcome::DeviceError(err) => {
                    tracing::warn!(error = %err, response, "Piezo set failed; skipping step");
                }
            }
        }
    }
}
