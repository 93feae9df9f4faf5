//! Entrypoint for the recovery engine
//!
//! A run is a small state machine:
//!
//! `Idle -> Initializing -> Scanning (repeated) -> Sweeping -> Done`
//!
//! with any remote failure or interrupt moving it to `Failed`. Exactly one remote call is in
//! flight at a time. Interrupts and timeouts are checked at the boundaries between calls.

use std::future::Future;
use std::sync::{
    atomic::{self, AtomicBool},
    Arc,
};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::convergence::{ConvergenceDetector, CursorObservation};
use crate::error::{RunError, ServiceError};
use crate::interface::{validate_inputs, InputValidator, ScanService};
use crate::pacing::PacingController;
use crate::primitives::{BatchSize, RunEvent, RunOutcome, RunState, ScanParameters};

/// What to do when the scan service returns a cursor lower than the previous one
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RegressionPolicy {
    /// Log it and keep scanning, the regression just means "not converged"
    #[default]
    Continue,
    /// Fail the run with [`RunError::CursorRegressed`]
    Fail,
}

/// Tunables of a run
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct OrchestratorSettings {
    /// Batch size controller
    pub pacing: PacingController,
    /// Upper bound on a single remote call, `None` waits forever
    pub call_timeout: Option<Duration>,
    /// Handling of cursors moving backwards
    pub regression_policy: RegressionPolicy,
}

/// Drives one recovery run against a [`ScanService`].
///
/// An orchestrator owns exactly one session: once [`ScanOrchestrator::start`] has been called
/// it cannot be started again.
pub struct ScanOrchestrator<S> {
    service: S,
    settings: OrchestratorSettings,
    state: RunState,
    event_sender: Option<mpsc::UnboundedSender<RunEvent>>,
    interrupt: Arc<AtomicBool>,
}

impl<S> ScanOrchestrator<S>
where
    S: ScanService,
{
    /// Creates an idle orchestrator
    pub fn new(service: S, settings: OrchestratorSettings) -> Self {
        ScanOrchestrator {
            service,
            settings,
            state: RunState::Idle,
            event_sender: None,
            interrupt: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Publishes [`RunEvent`]s on `event_sender` while the run progresses.
    ///
    /// Events are dropped silently once the receiver is gone.
    pub fn with_events(mut self, event_sender: mpsc::UnboundedSender<RunEvent>) -> Self {
        self.event_sender = Some(event_sender);
        self
    }

    /// Flag that stops the run before its next remote call when set.
    ///
    /// A call already in flight is allowed to finish.
    pub fn interrupt_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.interrupt)
    }

    /// Current state of the run
    pub fn state(&self) -> RunState {
        self.state
    }

    /// Scan service this orchestrator drives
    pub fn service(&self) -> &S {
        &self.service
    }

    /// Checks the seed and destination with `validator`, then runs [`Self::start`].
    ///
    /// Rejected inputs fail the run with [`RunError::Validation`] before any session call.
    pub async fn start_validated<V: InputValidator>(
        &mut self,
        validator: &V,
        params: ScanParameters,
    ) -> Result<RunOutcome, RunError> {
        if self.state != RunState::Idle {
            return Err(RunError::SessionReused(self.state));
        }

        if let Err(failure) = validate_inputs(validator, params.seed(), params.destination()).await
        {
            tracing::error!("Recovery inputs rejected. {}", failure);
            self.transition(RunState::Failed);
            return Err(RunError::Validation(failure));
        }

        self.start(params).await
    }

    /// Runs init, the scan loop and the sweep.
    ///
    /// `params` must already have passed [`crate::interface::validate_inputs`], see
    /// [`Self::start_validated`]. Every remote failure is terminal; nothing is retried.
    pub async fn start(&mut self, params: ScanParameters) -> Result<RunOutcome, RunError> {
        if self.state != RunState::Idle {
            return Err(RunError::SessionReused(self.state));
        }

        match self.drive(params).await {
            Ok(outcome) => {
                tracing::info!(
                    "Recovery complete at height {} after {} scan steps.",
                    outcome.end_height(),
                    outcome.iterations()
                );
                self.transition(RunState::Done);
                Ok(outcome)
            }
            Err(error) => {
                tracing::error!("Recovery failed. {}", error);
                self.transition(RunState::Failed);
                Err(error)
            }
        }
    }

    async fn drive(&mut self, mut params: ScanParameters) -> Result<RunOutcome, RunError> {
        let run_start = Instant::now();
        let pacing = self.settings.pacing;
        let mut batch_size = pacing.initial_batch_size();
        let mut convergence = ConvergenceDetector::new();
        let mut iterations = 0u32;

        self.transition(RunState::Initializing);
        self.check_interrupt(&params)?;
        tracing::info!(
            "Initializing scan session from birth height {}.",
            params.birth_height()
        );
        self.call(self.service.init(&params))
            .await
            .map_err(RunError::InitFailed)?;

        let end_height = loop {
            self.transition(RunState::Scanning);
            self.check_interrupt(&params)?;

            // `BatchSize` cannot hold zero, clamp anyway in case the controller is swapped out
            let requested = BatchSize::new(batch_size.get());
            let step_start = Instant::now();
            let cursor = self
                .call(self.service.scan_step(&params, requested))
                .await
                .map_err(|source| RunError::ScanStepFailed {
                    end_height: params.end_height(),
                    source,
                })?;
            let elapsed = step_start.elapsed();
            iterations += 1;

            batch_size = pacing.next(requested, elapsed);
            tracing::debug!(
                "Scan step {} requested {} blocks, took {:?}, next batch {}.",
                iterations,
                requested,
                elapsed,
                batch_size
            );
            if batch_size != requested {
                self.emit(RunEvent::BatchResized {
                    from: requested,
                    to: batch_size,
                });
            }

            params.set_end_height(cursor);
            tracing::info!("Scanned to height {}.", cursor);
            self.emit(RunEvent::Progress {
                cursor,
                batch_size: requested,
                elapsed,
            });

            match convergence.observe(cursor) {
                CursorObservation::Converged => break cursor,
                CursorObservation::First | CursorObservation::Advanced { .. } => (),
                CursorObservation::Regressed { previous } => {
                    tracing::warn!(
                        "Scan cursor regressed from {} to {}.",
                        previous,
                        cursor
                    );
                    self.emit(RunEvent::CursorRegressed {
                        previous,
                        current: cursor,
                    });
                    if self.settings.regression_policy == RegressionPolicy::Fail {
                        return Err(RunError::CursorRegressed {
                            previous,
                            current: cursor,
                        });
                    }
                }
            }
        };

        self.transition(RunState::Sweeping);
        self.check_interrupt(&params)?;
        tracing::info!("Scan converged at height {}, sweeping.", end_height);
        self.call(self.service.sweep(&params))
            .await
            .map_err(|source| RunError::SweepFailed { end_height, source })?;

        Ok(RunOutcome::from_parts(
            end_height,
            iterations,
            batch_size,
            run_start.elapsed(),
        ))
    }

    async fn call<T>(
        &self,
        request: impl Future<Output = Result<T, ServiceError>>,
    ) -> Result<T, ServiceError> {
        match self.settings.call_timeout {
            Some(limit) => tokio::time::timeout(limit, request)
                .await
                .map_err(|_| ServiceError::Timeout(limit))?,
            None => request.await,
        }
    }

    fn check_interrupt(&self, params: &ScanParameters) -> Result<(), RunError> {
        if self.interrupt.load(atomic::Ordering::Acquire) {
            tracing::info!("Recovery interrupted in state {}.", self.state);
            return Err(RunError::Interrupted {
                end_height: params.end_height(),
            });
        }

        Ok(())
    }

    /// Enters `state` and publishes it. Scanning is re-entered, and published, once per step.
    fn transition(&mut self, state: RunState) {
        tracing::debug!("Run state {} -> {}.", self.state, state);
        self.state = state;
        self.emit(RunEvent::StateChanged(state));
    }

    fn emit(&self, event: RunEvent) {
        if let Some(sender) = &self.event_sender {
            // receiver may have been dropped, the run does not depend on it
            let _ = sender.send(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use super::*;
    use crate::interface::InputValidator;
    use crate::primitives::ScanCursor;

    use secrecy::SecretString;

    #[derive(Default)]
    struct ScriptedService {
        cursors: Mutex<VecDeque<Result<u32, ServiceError>>>,
        step_delay: Duration,
        calls: Mutex<Vec<String>>,
        batches: Mutex<Vec<u32>>,
    }

    impl ScriptedService {
        fn new(cursors: &[u32]) -> Self {
            ScriptedService {
                cursors: Mutex::new(cursors.iter().copied().map(Ok).collect()),
                ..Default::default()
            }
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl InputValidator for ScriptedService {
        async fn validate_seed(&self, _seed: &str) -> Result<bool, ServiceError> {
            Ok(true)
        }

        async fn validate_address(&self, _address: &str) -> Result<bool, ServiceError> {
            Ok(true)
        }
    }

    impl ScanService for ScriptedService {
        async fn init(&self, _params: &ScanParameters) -> Result<(), ServiceError> {
            self.calls.lock().unwrap().push("init".to_string());
            Ok(())
        }

        async fn scan_step(
            &self,
            _params: &ScanParameters,
            batch_size: BatchSize,
        ) -> Result<ScanCursor, ServiceError> {
            self.calls.lock().unwrap().push("scan".to_string());
            self.batches.lock().unwrap().push(batch_size.get());
            tokio::time::sleep(self.step_delay).await;
            let next = self
                .cursors
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Err(ServiceError::Remote {
                    code: -1,
                    message: "script exhausted".to_string(),
                }));
            next.map(ScanCursor::from_u32)
        }

        async fn sweep(&self, params: &ScanParameters) -> Result<(), ServiceError> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("sweep@{}", params.end_height().unwrap()));
            Ok(())
        }
    }

    fn params() -> ScanParameters {
        ScanParameters::new(
            SecretString::new("seed".to_string()),
            "u1dest".to_string(),
            5,
            3,
            2_757_209,
            "https://zec.rocks".to_string(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_cursor_triggers_a_single_sweep() {
        let service = ScriptedService::new(&[5_000, 5_000]);
        let mut orchestrator = ScanOrchestrator::new(&service, OrchestratorSettings::default());

        let outcome = orchestrator.start(params()).await.unwrap();

        assert_eq!(outcome.end_height(), ScanCursor::from_u32(5_000));
        assert_eq!(outcome.iterations(), 2);
        assert_eq!(orchestrator.state(), RunState::Done);
        assert_eq!(service.calls(), vec!["init", "scan", "scan", "sweep@5000"]);
    }

    #[tokio::test(start_paused = true)]
    async fn batch_size_follows_step_latency() {
        let service = ScriptedService {
            step_delay: Duration::from_secs(5),
            ..ScriptedService::new(&[100, 250, 250])
        };
        let mut orchestrator = ScanOrchestrator::new(&service, OrchestratorSettings::default());

        let outcome = orchestrator.start(params()).await.unwrap();

        assert_eq!(*service.batches.lock().unwrap(), vec![1_000, 1_200, 1_440]);
        assert_eq!(outcome.final_batch_size(), BatchSize::new(1_728));
    }

    #[tokio::test(start_paused = true)]
    async fn state_changes_are_published() {
        let service = ScriptedService::new(&[10, 20, 20]);
        let (sender, mut receiver) = mpsc::unbounded_channel();
        let mut orchestrator =
            ScanOrchestrator::new(&service, OrchestratorSettings::default()).with_events(sender);

        orchestrator.start(params()).await.unwrap();
        drop(orchestrator);

        let mut states = Vec::new();
        while let Some(event) = receiver.recv().await {
            if let RunEvent::StateChanged(state) = event {
                states.push(state);
            }
        }
        assert_eq!(
            states,
            vec![
                RunState::Initializing,
                RunState::Scanning,
                RunState::Scanning,
                RunState::Scanning,
                RunState::Sweeping,
                RunState::Done
            ]
        );
    }

    #[tokio::test]
    async fn interrupted_run_never_calls_the_service() {
        let service = ScriptedService::new(&[10, 10]);
        let mut orchestrator = ScanOrchestrator::new(&service, OrchestratorSettings::default());
        orchestrator
            .interrupt_handle()
            .store(true, atomic::Ordering::Release);

        let error = orchestrator.start(params()).await.unwrap_err();

        assert_eq!(error, RunError::Interrupted { end_height: None });
        assert_eq!(orchestrator.state(), RunState::Failed);
        assert!(service.calls().is_empty());
    }

    #[tokio::test]
    async fn orchestrator_runs_one_session_only() {
        let service = ScriptedService::new(&[10, 10]);
        let mut orchestrator = ScanOrchestrator::new(&service, OrchestratorSettings::default());
        orchestrator.start(params()).await.unwrap();

        assert_eq!(
            orchestrator.start(params()).await,
            Err(RunError::SessionReused(RunState::Done))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn slow_call_times_out_when_limited() {
        let service = ScriptedService {
            step_delay: Duration::from_secs(60),
            ..ScriptedService::new(&[10, 10])
        };
        let settings = OrchestratorSettings {
            call_timeout: Some(Duration::from_secs(30)),
            ..Default::default()
        };
        let mut orchestrator = ScanOrchestrator::new(&service, settings);

        let error = orchestrator.start(params()).await.unwrap_err();

        assert_eq!(
            error,
            RunError::ScanStepFailed {
                end_height: None,
                source: ServiceError::Timeout(Duration::from_secs(30)),
            }
        );
    }
}
