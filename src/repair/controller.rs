use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anvil_common::{
    BuildAttempt, BuildIteration, BuildState, CollaboratorError, Diagnostic, FeatureRequest,
    ImplementationPlan, Outcome, Planner, SynthesisOutput, SynthesisRequest, Synthesizer,
    TestResult, ValidationResult, Validator, WorkspaceSnapshot,
};
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use super::events::{BuildEvent, BuildObserver, NoopObserver};
use crate::config::BuildConfig;
use crate::workspace::{WorkspaceHandle, WorkspaceStore};

/// Result of driving one attempt to a terminal state.
#[derive(Debug)]
pub struct RunOutcome {
    pub attempt: BuildAttempt,
    /// The snapshot the attempt ended on: the passing snapshot on success,
    /// the last one produced otherwise.
    pub final_snapshot: Option<WorkspaceSnapshot>,
}

/// What happened to one iteration once it is recorded.
enum Step {
    Passed(WorkspaceSnapshot),
    Failed,
    Replan,
    Fatal(String),
}

/// The repair loop: plan, then synthesize -> validate -> test until the
/// tests pass or the iteration budget runs out.
///
/// Every collaborator call is bounded by the step timeouts in `BuildConfig`.
/// A timed-out or failed synthesis counts as a failed iteration. The live
/// workspace ends on the passing snapshot after `Success` and back on the
/// starting snapshot after any other outcome.
pub struct RepairController {
    planner: Arc<dyn Planner>,
    synthesizer: Arc<dyn Synthesizer>,
    validator: Arc<dyn Validator>,
    store: WorkspaceStore,
    config: BuildConfig,
    observer: Arc<dyn BuildObserver>,
}

impl RepairController {
    pub fn new(
        planner: Arc<dyn Planner>,
        synthesizer: Arc<dyn Synthesizer>,
        validator: Arc<dyn Validator>,
        store: WorkspaceStore,
        config: BuildConfig,
    ) -> Self {
        Self {
            planner,
            synthesizer,
            validator,
            store,
            config,
            observer: Arc::new(NoopObserver),
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn BuildObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Drive `attempt` for `request` to a terminal outcome. `handle` must be
    /// the lease for the request's factory.
    pub async fn run(
        &self,
        attempt: BuildAttempt,
        request: &FeatureRequest,
        handle: &WorkspaceHandle,
        cancel: &CancellationToken,
    ) -> RunOutcome {
        let span = tracing::info_span!(
            "attempt",
            attempt_id = %attempt.id,
            factory_id = attempt.factory_id
        );
        self.drive(attempt, request, handle, cancel)
            .instrument(span)
            .await
    }

    async fn drive(
        &self,
        mut attempt: BuildAttempt,
        request: &FeatureRequest,
        handle: &WorkspaceHandle,
        cancel: &CancellationToken,
    ) -> RunOutcome {
        let base = match self.store.latest(handle) {
            Ok(snap) => snap,
            Err(e) => {
                self.enter(&mut attempt, BuildState::Planning).await;
                return self
                    .finish(attempt, Outcome::Fatal, Some(format!("workspace unavailable: {}", e)), None)
                    .await;
            }
        };

        if cancel.is_cancelled() {
            return self.finish(attempt, Outcome::Cancelled, None, None).await;
        }

        self.enter(&mut attempt, BuildState::Planning).await;
        match self.obtain_plan(request).await {
            Ok(plan) => self.set_plan(&mut attempt, plan).await,
            Err(reason) => {
                return self.finish(attempt, Outcome::Fatal, Some(reason), None).await;
            }
        }

        let mut feedback: Vec<Diagnostic> = Vec::new();
        let mut last_snapshot: Option<WorkspaceSnapshot> = None;

        loop {
            let index = attempt.next_index();
            self.enter(&mut attempt, BuildState::Synthesizing).await;
            let mut iteration = BuildIteration::begin(index);

            let step = self
                .run_iteration(&mut attempt, request, handle, &mut iteration, &feedback)
                .await;
            if let Some(id) = &iteration.snapshot_id
                && let Ok(snap) = self.store.load_snapshot(attempt.factory_id, id)
            {
                last_snapshot = Some(snap);
            }
            feedback = iteration.feedback();
            if let Err(e) = self.record(&mut attempt, iteration).await {
                self.rollback(handle, &base);
                return self
                    .finish(attempt, Outcome::Fatal, Some(e), last_snapshot)
                    .await;
            }

            match step {
                Step::Passed(snapshot) => {
                    return self
                        .finish(attempt, Outcome::Success, None, Some(snapshot))
                        .await;
                }
                Step::Fatal(reason) => {
                    self.rollback(handle, &base);
                    return self
                        .finish(attempt, Outcome::Fatal, Some(reason), last_snapshot)
                        .await;
                }
                Step::Replan => {
                    // Budget spent: escalate without planning again.
                    if !attempt.has_budget() {
                        self.rollback(handle, &base);
                        let final_snapshot = last_snapshot.or(Some(base));
                        return self
                            .finish(attempt, Outcome::Escalated, None, final_snapshot)
                            .await;
                    }
                    self.enter(&mut attempt, BuildState::Planning).await;
                    match self.obtain_plan(request).await {
                        Ok(plan) => self.set_plan(&mut attempt, plan).await,
                        Err(reason) => {
                            self.rollback(handle, &base);
                            return self
                                .finish(attempt, Outcome::Fatal, Some(reason), last_snapshot)
                                .await;
                        }
                    }
                }
                Step::Failed => {
                    self.enter(&mut attempt, BuildState::Retry).await;
                    if !attempt.has_budget() {
                        self.rollback(handle, &base);
                        let final_snapshot = last_snapshot.or(Some(base));
                        return self
                            .finish(attempt, Outcome::Escalated, None, final_snapshot)
                            .await;
                    }
                }
            }

            if cancel.is_cancelled() {
                tracing::info!("cancellation requested between iterations");
                self.rollback(handle, &base);
                return self
                    .finish(attempt, Outcome::Cancelled, None, last_snapshot)
                    .await;
            }
        }
    }

    /// One synthesize -> validate -> test pass. Fills in `iteration` and
    /// reports how it ended; recording is left to the caller.
    async fn run_iteration(
        &self,
        attempt: &mut BuildAttempt,
        request: &FeatureRequest,
        handle: &WorkspaceHandle,
        iteration: &mut BuildIteration,
        feedback: &[Diagnostic],
    ) -> Step {
        let Some(plan) = attempt.plan.clone() else {
            return Step::Fatal("no plan available for synthesis".to_string());
        };
        let synthesis = bounded(
            self.config.timeouts.synthesize(),
            self.synthesizer.synthesize(SynthesisRequest {
                feature: request,
                plan: &plan,
                iteration: iteration.iteration_index,
                diagnostics: feedback,
            }),
        )
        .await;

        let diff = match synthesis {
            None => {
                iteration.diagnostics.push(Diagnostic::synthetic(
                    "timeout",
                    &format!(
                        "synthesis did not finish within {}s",
                        self.config.timeouts.synthesize_secs
                    ),
                ));
                return Step::Failed;
            }
            Some(Err(e)) => {
                tracing::warn!(iteration = iteration.iteration_index, error = %e, "synthesis failed");
                iteration
                    .diagnostics
                    .push(Diagnostic::synthetic("synthesis", &e.to_string()));
                return Step::Failed;
            }
            Some(Ok(SynthesisOutput::Replan { reason })) => {
                tracing::info!(iteration = iteration.iteration_index, %reason, "synthesizer requested a new plan");
                iteration
                    .diagnostics
                    .push(Diagnostic::synthetic("replan", &reason));
                return Step::Replan;
            }
            Some(Ok(SynthesisOutput::Diff(diff))) => diff,
        };

        let applied = self.store.apply(handle, &diff);
        iteration.code_diff = Some(diff);
        let snapshot = match applied {
            Ok(snapshot) => snapshot,
            Err(e) => {
                tracing::error!(iteration = iteration.iteration_index, error = %e, "failed to apply diff");
                iteration
                    .diagnostics
                    .push(Diagnostic::synthetic("apply", &e.to_string()));
                return Step::Fatal(format!("failed to apply diff: {}", e));
            }
        };
        iteration.snapshot_id = Some(snapshot.id().clone());

        self.enter(attempt, BuildState::Validating).await;
        let validation = bounded(
            self.config.timeouts.validate(),
            self.validator.validate_static(&snapshot),
        )
        .await
        .unwrap_or_else(|| {
            ValidationResult::timed_out("static check", self.config.timeouts.validate_secs)
        });
        let passed_static = validation.passed;
        iteration.validation_result = Some(validation);
        if !passed_static {
            return Step::Failed;
        }

        self.enter(attempt, BuildState::Testing).await;
        let tests = bounded(self.config.timeouts.test(), self.validator.run_tests(&snapshot))
            .await
            .unwrap_or_else(|| TestResult::timed_out(self.config.timeouts.test_secs));
        let passed_tests = tests.passed;
        iteration.test_result = Some(tests);

        if passed_tests {
            Step::Passed(snapshot)
        } else {
            Step::Failed
        }
    }

    /// Ask the planner for a usable plan, retrying malformed answers,
    /// errors and timeouts up to `plan_retry_limit` extra times.
    async fn obtain_plan(&self, request: &FeatureRequest) -> Result<ImplementationPlan, String> {
        let tries = self.config.plan_retry_limit + 1;
        let mut last_error = String::new();
        for n in 1..=tries {
            let result = bounded(self.config.timeouts.plan(), self.planner.plan(request)).await;
            let error = match result {
                Some(Ok(plan)) => match plan.check() {
                    Ok(()) => return Ok(plan),
                    Err(reason) => CollaboratorError::Malformed(reason).to_string(),
                },
                Some(Err(e)) => e.to_string(),
                None => format!(
                    "planning did not finish within {}s",
                    self.config.timeouts.plan_secs
                ),
            };
            tracing::warn!(try_number = n, tries, error = %error, "planning failed");
            last_error = error;
        }
        Err(format!(
            "no usable plan after {} tries: {}",
            tries, last_error
        ))
    }

    async fn set_plan(&self, attempt: &mut BuildAttempt, plan: ImplementationPlan) {
        tracing::info!(steps = plan.steps.len(), files = ?plan.all_files(), "plan ready");
        attempt.plan = Some(plan.clone());
        let event = BuildEvent::PlanReady {
            attempt_id: attempt.id,
            factory_id: attempt.factory_id,
            plan,
        };
        self.observer.on_event(attempt, &event).await;
    }

    async fn enter(&self, attempt: &mut BuildAttempt, state: BuildState) {
        attempt.states.push(state);
        // Mid-iteration states refer to the iteration not yet recorded.
        let iteration = match state {
            BuildState::Synthesizing | BuildState::Validating | BuildState::Testing => {
                attempt.next_index()
            }
            _ => attempt.iteration_count(),
        };
        tracing::debug!(state = %state, iteration, "state entered");
        let event = BuildEvent::StateEntered {
            attempt_id: attempt.id,
            factory_id: attempt.factory_id,
            state,
            iteration,
        };
        self.observer.on_event(attempt, &event).await;
    }

    async fn record(
        &self,
        attempt: &mut BuildAttempt,
        mut iteration: BuildIteration,
    ) -> Result<(), String> {
        iteration.ended_at = Utc::now();
        tracing::info!(
            iteration = iteration.iteration_index,
            passed = iteration.passed(),
            diagnostics = iteration.feedback().len(),
            "iteration recorded"
        );
        attempt
            .push_iteration(iteration.clone())
            .map_err(|e| format!("iteration bookkeeping failed: {}", e))?;
        let event = BuildEvent::IterationRecorded {
            attempt_id: attempt.id,
            factory_id: attempt.factory_id,
            iteration,
        };
        self.observer.on_event(attempt, &event).await;
        Ok(())
    }

    /// Put the live tree back on the snapshot the attempt started from.
    fn rollback(&self, handle: &WorkspaceHandle, base: &WorkspaceSnapshot) {
        if let Err(e) = self.store.restore(handle, base) {
            tracing::error!(error = %e, snapshot = base.id().short(), "failed to restore workspace");
        }
    }

    async fn finish(
        &self,
        mut attempt: BuildAttempt,
        outcome: Outcome,
        error: Option<String>,
        final_snapshot: Option<WorkspaceSnapshot>,
    ) -> RunOutcome {
        let terminal = match outcome {
            Outcome::Success => BuildState::Success,
            Outcome::Escalated => BuildState::Escalated,
            Outcome::Cancelled => BuildState::Cancelled,
            Outcome::Fatal | Outcome::Pending => BuildState::Fatal,
        };
        attempt.states.push(terminal);
        attempt.error = error;
        attempt.final_snapshot_id = final_snapshot.as_ref().map(|s| s.id().clone());
        attempt.finish(outcome);

        match outcome {
            Outcome::Success => tracing::info!(
                iterations = attempt.iteration_count(),
                "attempt succeeded"
            ),
            _ => tracing::warn!(
                outcome = %outcome,
                iterations = attempt.iteration_count(),
                error = attempt.error.as_deref().unwrap_or(""),
                "attempt did not succeed"
            ),
        }

        let event = BuildEvent::finished(&attempt);
        self.observer.on_event(&attempt, &event).await;
        RunOutcome {
            attempt,
            final_snapshot,
        }
    }
}

/// Await `fut` for at most `limit`. `None` means it timed out.
async fn bounded<F: Future>(limit: Duration, fut: F) -> Option<F::Output> {
    tokio::time::timeout(limit, fut).await.ok()
}
