//! End-to-end behaviour of the repair loop against scripted collaborators
//! and a real on-disk workspace store.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anvil::config::{BuildConfig, StepTimeouts};
use anvil::errors::WorkspaceError;
use anvil::repair::{BuildEvent, RecordingObserver, RepairController, RunOutcome};
use anvil::workspace::{WorkspaceHandle, WorkspaceStore};
use anvil_common::{
    BuildAttempt, BuildState, CodeDiff, CollaboratorError, Diagnostic, FailingCase,
    FeatureRequest, ImplementationPlan, Outcome, PlanStep, Planner, SynthesisOutput,
    SynthesisRequest, Synthesizer, TestResult, ValidationResult, Validator, WorkspaceSnapshot,
};
use async_trait::async_trait;
use tempfile::{TempDir, tempdir};
use tokio_util::sync::CancellationToken;

// =============================================================================
// Scripted collaborators
// =============================================================================

fn plan() -> ImplementationPlan {
    ImplementationPlan {
        summary: "add a greeting endpoint".into(),
        steps: vec![PlanStep {
            description: "write the handler".into(),
            files: vec!["src/greet.rs".into()],
        }],
        target_files: vec!["src/greet.rs".into()],
        dependencies: vec![],
    }
}

fn empty_plan() -> ImplementationPlan {
    ImplementationPlan {
        summary: String::new(),
        steps: vec![],
        target_files: vec![],
        dependencies: vec![],
    }
}

/// Answers from a queue, then with a good plan once the queue is empty.
#[derive(Default)]
struct ScriptedPlanner {
    replies: Mutex<VecDeque<Result<ImplementationPlan, CollaboratorError>>>,
    calls: Mutex<u32>,
}

impl ScriptedPlanner {
    fn with(replies: Vec<Result<ImplementationPlan, CollaboratorError>>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            calls: Mutex::new(0),
        }
    }

    fn calls(&self) -> u32 {
        *self.calls.lock().unwrap()
    }
}

#[async_trait]
impl Planner for ScriptedPlanner {
    async fn plan(&self, _request: &FeatureRequest) -> Result<ImplementationPlan, CollaboratorError> {
        *self.calls.lock().unwrap() += 1;
        self.replies.lock().unwrap().pop_front().unwrap_or_else(|| Ok(plan()))
    }
}

enum Reply {
    Diff(CodeDiff),
    Replan(&'static str),
    Error,
    Hang,
}

/// Answers from a queue; once empty, writes a file named after the iteration.
#[derive(Default)]
struct ScriptedSynth {
    replies: Mutex<VecDeque<Reply>>,
    /// Diagnostics received on each call, in call order.
    seen: Mutex<Vec<Vec<Diagnostic>>>,
    cancel_on_call: Option<CancellationToken>,
}

impl ScriptedSynth {
    fn with(replies: Vec<Reply>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            ..Self::default()
        }
    }

    fn seen(&self) -> Vec<Vec<Diagnostic>> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl Synthesizer for ScriptedSynth {
    async fn synthesize(
        &self,
        request: SynthesisRequest<'_>,
    ) -> Result<SynthesisOutput, CollaboratorError> {
        self.seen.lock().unwrap().push(request.diagnostics.to_vec());
        if let Some(token) = &self.cancel_on_call {
            token.cancel();
        }
        let reply = self.replies.lock().unwrap().pop_front();
        match reply {
            Some(Reply::Diff(diff)) => Ok(SynthesisOutput::Diff(diff)),
            Some(Reply::Replan(reason)) => Ok(SynthesisOutput::Replan {
                reason: reason.to_string(),
            }),
            Some(Reply::Error) => Err(CollaboratorError::Rejected("model refused".into())),
            Some(Reply::Hang) => {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Err(CollaboratorError::Transient("unreachable".into()))
            }
            None => Ok(SynthesisOutput::Diff(CodeDiff::default().write(
                "src/greet.rs",
                &format!("pub fn greet() {{ /* {} */ }}", request.iteration),
            ))),
        }
    }
}

/// Static and test verdicts from queues; passes once a queue runs dry.
/// The first `*_hangs` calls of each check never answer in time.
#[derive(Default)]
struct ScriptedValidator {
    statics: Mutex<VecDeque<ValidationResult>>,
    tests: Mutex<VecDeque<TestResult>>,
    tests_always_fail: bool,
    test_runs: Mutex<u32>,
    static_hangs: Mutex<u32>,
    test_hangs: Mutex<u32>,
}

impl ScriptedValidator {
    fn failing_tests() -> Self {
        Self {
            tests_always_fail: true,
            ..Self::default()
        }
    }

    fn with_statics(statics: Vec<ValidationResult>) -> Self {
        Self {
            statics: Mutex::new(statics.into()),
            ..Self::default()
        }
    }

    fn hanging(static_hangs: u32, test_hangs: u32) -> Self {
        Self {
            static_hangs: Mutex::new(static_hangs),
            test_hangs: Mutex::new(test_hangs),
            ..Self::default()
        }
    }

    fn test_runs(&self) -> u32 {
        *self.test_runs.lock().unwrap()
    }
}

/// Takes one hang from `remaining`; true if this call should hang.
fn take_hang(remaining: &Mutex<u32>) -> bool {
    let mut remaining = remaining.lock().unwrap();
    if *remaining == 0 {
        return false;
    }
    *remaining -= 1;
    true
}

fn failing_case() -> TestResult {
    TestResult::fail(vec![FailingCase {
        name: "greet::says_hello".into(),
        message: "assertion failed".into(),
        stack: None,
    }])
}

#[async_trait]
impl Validator for ScriptedValidator {
    async fn validate_static(&self, _snapshot: &WorkspaceSnapshot) -> ValidationResult {
        if take_hang(&self.static_hangs) {
            tokio::time::sleep(Duration::from_secs(30)).await;
        }
        self.statics
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(ValidationResult::pass)
    }

    async fn run_tests(&self, _snapshot: &WorkspaceSnapshot) -> TestResult {
        *self.test_runs.lock().unwrap() += 1;
        if take_hang(&self.test_hangs) {
            tokio::time::sleep(Duration::from_secs(30)).await;
        }
        if self.tests_always_fail {
            return failing_case();
        }
        self.tests
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| TestResult::pass(None))
    }
}

fn lint_error() -> ValidationResult {
    ValidationResult::fail(vec![Diagnostic::new(
        Some("src/greet.rs"),
        Some(1),
        "expected `;`",
        "syntax",
    )])
}

// =============================================================================
// Harness
// =============================================================================

struct Harness {
    _dir: TempDir,
    store: WorkspaceStore,
    handle: WorkspaceHandle,
    config: BuildConfig,
}

fn harness(max_iterations: u32) -> Harness {
    let dir = tempdir().unwrap();
    let store = WorkspaceStore::new(dir.path().join("workspaces")).unwrap();
    let handle = store.create(1).unwrap();
    let config = BuildConfig {
        max_iterations,
        timeouts: StepTimeouts {
            plan_secs: 5,
            synthesize_secs: 1,
            validate_secs: 5,
            test_secs: 5,
        },
        workspace_root: dir.path().join("workspaces"),
        ..BuildConfig::default()
    };
    Harness {
        _dir: dir,
        store,
        handle,
        config,
    }
}

impl Harness {
    fn controller(
        &self,
        planner: Arc<ScriptedPlanner>,
        synth: Arc<ScriptedSynth>,
        validator: Arc<ScriptedValidator>,
    ) -> RepairController {
        RepairController::new(planner, synth, validator, self.store.clone(), self.config.clone())
    }

    async fn run(&self, controller: &RepairController) -> RunOutcome {
        self.run_with(controller, &CancellationToken::new()).await
    }

    async fn run_with(&self, controller: &RepairController, cancel: &CancellationToken) -> RunOutcome {
        let request = FeatureRequest::new(1, "add a greeting endpoint");
        let attempt = BuildAttempt::new(&request, self.config.max_iterations);
        controller.run(attempt, &request, &self.handle, cancel).await
    }
}

fn indices(attempt: &BuildAttempt) -> Vec<u32> {
    attempt.iterations().iter().map(|i| i.iteration_index).collect()
}

// =============================================================================
// Scenarios
// =============================================================================

mod scenarios {
    use super::*;

    #[tokio::test]
    async fn test_static_failure_then_pass_succeeds_on_second_iteration() {
        let h = harness(5);
        let validator = Arc::new(ScriptedValidator::with_statics(vec![lint_error()]));
        let controller = h.controller(
            Arc::new(ScriptedPlanner::default()),
            Arc::new(ScriptedSynth::default()),
            validator.clone(),
        );

        let out = h.run(&controller).await;

        assert_eq!(out.attempt.outcome, Outcome::Success);
        assert_eq!(out.attempt.iteration_count(), 2);
        assert_eq!(
            out.attempt.states,
            vec![
                BuildState::Planning,
                BuildState::Synthesizing,
                BuildState::Validating,
                BuildState::Retry,
                BuildState::Synthesizing,
                BuildState::Validating,
                BuildState::Testing,
                BuildState::Success,
            ]
        );
        // Tests never ran for the iteration that failed static checks.
        assert_eq!(validator.test_runs(), 1);
        let first = &out.attempt.iterations()[0];
        assert!(first.test_result.is_none());
    }

    #[tokio::test]
    async fn test_identical_scripts_give_identical_traces() {
        let mut traces = Vec::new();
        for _ in 0..2 {
            let h = harness(5);
            let controller = h.controller(
                Arc::new(ScriptedPlanner::default()),
                Arc::new(ScriptedSynth::default()),
                Arc::new(ScriptedValidator::with_statics(vec![lint_error(), lint_error()])),
            );
            let out = h.run(&controller).await;
            traces.push((out.attempt.states.clone(), out.attempt.outcome, indices(&out.attempt)));
        }
        assert_eq!(traces[0], traces[1]);
        assert_eq!(traces[0].1, Outcome::Success);
        assert_eq!(traces[0].2, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_budget_exhaustion_escalates_with_full_history() {
        let h = harness(2);
        let controller = h.controller(
            Arc::new(ScriptedPlanner::default()),
            Arc::new(ScriptedSynth::default()),
            Arc::new(ScriptedValidator::failing_tests()),
        );

        let out = h.run(&controller).await;

        assert_eq!(out.attempt.outcome, Outcome::Escalated);
        assert_eq!(out.attempt.iteration_count(), 2);
        assert_eq!(indices(&out.attempt), vec![1, 2]);
        assert_eq!(out.attempt.states.last(), Some(&BuildState::Escalated));
        assert!(out.final_snapshot.is_some());
        let diagnostics = out.attempt.final_diagnostics();
        assert!(!diagnostics.is_empty());
        assert!(diagnostics.iter().all(|d| d.rule == "test"));
    }

    #[tokio::test]
    async fn test_every_outcome_is_terminal_with_gapless_indices() {
        for max in 1..=4 {
            let h = harness(max);
            let controller = h.controller(
                Arc::new(ScriptedPlanner::default()),
                Arc::new(ScriptedSynth::default()),
                Arc::new(ScriptedValidator::failing_tests()),
            );
            let out = h.run(&controller).await;
            assert!(out.attempt.outcome.is_terminal());
            assert!(out.attempt.ended_at.is_some());
            assert_eq!(indices(&out.attempt), (1..=max).collect::<Vec<_>>());
        }
    }

    #[tokio::test]
    async fn test_failed_iterations_leave_workspace_on_base() {
        let h = harness(2);
        let base = h.store.latest(&h.handle).unwrap();
        let controller = h.controller(
            Arc::new(ScriptedPlanner::default()),
            Arc::new(ScriptedSynth::default()),
            Arc::new(ScriptedValidator::failing_tests()),
        );

        h.run(&controller).await;

        assert_eq!(h.store.latest(&h.handle).unwrap().id(), base.id());
        assert!(!h.handle.tree_path().join("src/greet.rs").exists());
    }

    #[tokio::test]
    async fn test_success_leaves_workspace_on_passing_snapshot() {
        let h = harness(3);
        let controller = h.controller(
            Arc::new(ScriptedPlanner::default()),
            Arc::new(ScriptedSynth::default()),
            Arc::new(ScriptedValidator::default()),
        );

        let out = h.run(&controller).await;

        let passing = out.final_snapshot.unwrap();
        assert_eq!(h.store.latest(&h.handle).unwrap().id(), passing.id());
        assert_eq!(out.attempt.final_snapshot_id.as_ref(), Some(passing.id()));
        assert!(h.handle.tree_path().join("src/greet.rs").exists());
    }

    #[tokio::test]
    async fn test_failed_apply_is_fatal_and_keeps_latest_hash() {
        let h = harness(5);
        let base = h.store.latest(&h.handle).unwrap();
        let synth = Arc::new(ScriptedSynth::with(vec![
            Reply::Diff(CodeDiff::default().write("src/greet.rs", "pub fn greet() {}")),
            Reply::Diff(
                CodeDiff::default()
                    .write("src/ok.rs", "// fine")
                    .write("../escape.rs", "// outside the tree"),
            ),
        ]));
        let controller = h.controller(
            Arc::new(ScriptedPlanner::default()),
            synth,
            Arc::new(ScriptedValidator::failing_tests()),
        );

        let out = h.run(&controller).await;

        assert_eq!(out.attempt.outcome, Outcome::Fatal);
        assert_eq!(out.attempt.iteration_count(), 2);
        assert!(out.attempt.error.as_deref().unwrap().contains("failed to apply diff"));
        let second = &out.attempt.iterations()[1];
        assert!(second.snapshot_id.is_none());
        assert!(second.diagnostics.iter().any(|d| d.rule == "apply"));

        assert_eq!(h.store.latest(&h.handle).unwrap().id(), base.id());
        assert!(!h.handle.tree_path().join("src/ok.rs").exists());
        assert!(!h.handle.tree_path().join("src/greet.rs").exists());
    }

    #[tokio::test]
    async fn test_replan_records_iteration_and_plans_again() {
        let h = harness(5);
        let planner = Arc::new(ScriptedPlanner::default());
        let synth = Arc::new(ScriptedSynth::with(vec![Reply::Replan("plan misses the router")]));
        let controller = h.controller(planner.clone(), synth, Arc::new(ScriptedValidator::default()));

        let out = h.run(&controller).await;

        assert_eq!(out.attempt.outcome, Outcome::Success);
        assert_eq!(planner.calls(), 2);
        assert_eq!(indices(&out.attempt), vec![1, 2]);
        let first = &out.attempt.iterations()[0];
        assert_eq!(first.diagnostics[0].rule, "replan");
        assert_eq!(
            &out.attempt.states[..4],
            &[
                BuildState::Planning,
                BuildState::Synthesizing,
                BuildState::Planning,
                BuildState::Synthesizing,
            ]
        );
    }

    #[tokio::test]
    async fn test_replan_on_last_iteration_escalates() {
        let h = harness(1);
        let synth = Arc::new(ScriptedSynth::with(vec![Reply::Replan("stuck")]));
        let controller = h.controller(
            Arc::new(ScriptedPlanner::default()),
            synth,
            Arc::new(ScriptedValidator::default()),
        );

        let out = h.run(&controller).await;

        assert_eq!(out.attempt.outcome, Outcome::Escalated);
        assert_eq!(out.attempt.iteration_count(), 1);
    }

    #[tokio::test]
    async fn test_replan_with_budget_spent_escalates_without_planning() {
        let h = harness(1);
        let planner = Arc::new(ScriptedPlanner::with(vec![
            Ok(plan()),
            Ok(empty_plan()),
            Ok(empty_plan()),
            Ok(empty_plan()),
        ]));
        let synth = Arc::new(ScriptedSynth::with(vec![Reply::Replan("wrong approach")]));
        let controller = h.controller(
            planner.clone(),
            synth,
            Arc::new(ScriptedValidator::default()),
        );

        let out = h.run(&controller).await;

        assert_eq!(out.attempt.outcome, Outcome::Escalated);
        assert!(out.attempt.error.is_none());
        assert_eq!(planner.calls(), 1);
        assert_eq!(
            out.attempt.states,
            vec![
                BuildState::Planning,
                BuildState::Synthesizing,
                BuildState::Escalated,
            ]
        );
        let base = h.store.latest(&h.handle).unwrap();
        assert_eq!(out.attempt.final_snapshot_id.as_ref(), Some(base.id()));
    }

    #[tokio::test]
    async fn test_malformed_plans_retry_then_fatal() {
        let h = harness(5);
        let planner = Arc::new(ScriptedPlanner::with(vec![
            Err(CollaboratorError::Malformed("not json".into())),
            Ok(empty_plan()),
            Err(CollaboratorError::Transient("connection reset".into())),
        ]));
        let controller = h.controller(
            planner.clone(),
            Arc::new(ScriptedSynth::default()),
            Arc::new(ScriptedValidator::default()),
        );

        let out = h.run(&controller).await;

        // plan_retry_limit = 2 -> three tries, none counted as iterations.
        assert_eq!(planner.calls(), 3);
        assert_eq!(out.attempt.outcome, Outcome::Fatal);
        assert_eq!(out.attempt.iteration_count(), 0);
        assert!(out.attempt.plan.is_none());
        assert!(out.attempt.error.as_deref().unwrap().contains("no usable plan"));
    }

    #[tokio::test]
    async fn test_plan_retry_recovers_within_limit() {
        let h = harness(5);
        let planner = Arc::new(ScriptedPlanner::with(vec![Ok(empty_plan())]));
        let controller = h.controller(
            planner.clone(),
            Arc::new(ScriptedSynth::default()),
            Arc::new(ScriptedValidator::default()),
        );

        let out = h.run(&controller).await;

        assert_eq!(planner.calls(), 2);
        assert_eq!(out.attempt.outcome, Outcome::Success);
        assert_eq!(out.attempt.iteration_count(), 1);
    }

    #[tokio::test]
    async fn test_synthesis_timeout_counts_as_failed_iteration() {
        let h = harness(3);
        let synth = Arc::new(ScriptedSynth::with(vec![Reply::Hang]));
        let controller = h.controller(
            Arc::new(ScriptedPlanner::default()),
            synth.clone(),
            Arc::new(ScriptedValidator::default()),
        );

        let out = h.run(&controller).await;

        assert_eq!(out.attempt.outcome, Outcome::Success);
        assert_eq!(out.attempt.iteration_count(), 2);
        let first = &out.attempt.iterations()[0];
        assert_eq!(first.diagnostics[0].rule, "timeout");
        assert!(first.snapshot_id.is_none());
        // The timeout is handed to the next synthesis call as feedback.
        assert_eq!(synth.seen()[1][0].rule, "timeout");
    }

    #[tokio::test]
    async fn test_static_check_timeout_counts_as_failed_iteration() {
        let mut h = harness(3);
        h.config.timeouts.validate_secs = 1;
        let validator = Arc::new(ScriptedValidator::hanging(1, 0));
        let synth = Arc::new(ScriptedSynth::default());
        let controller = h.controller(
            Arc::new(ScriptedPlanner::default()),
            synth.clone(),
            validator.clone(),
        );

        let out = h.run(&controller).await;

        assert_eq!(out.attempt.outcome, Outcome::Success);
        assert_eq!(out.attempt.iteration_count(), 2);
        let first = &out.attempt.iterations()[0];
        let validation = first.validation_result.as_ref().unwrap();
        assert!(!validation.passed);
        assert_eq!(validation.diagnostics[0].rule, "timeout");
        assert!(first.test_result.is_none());
        assert_eq!(validator.test_runs(), 1);
        assert_eq!(synth.seen()[1][0].rule, "timeout");
    }

    #[tokio::test]
    async fn test_test_suite_timeout_counts_as_failed_iteration() {
        let mut h = harness(2);
        h.config.timeouts.test_secs = 1;
        let validator = Arc::new(ScriptedValidator::hanging(0, 2));
        let controller = h.controller(
            Arc::new(ScriptedPlanner::default()),
            Arc::new(ScriptedSynth::default()),
            validator.clone(),
        );

        let out = h.run(&controller).await;

        // Both iterations time out: the budget runs out, nothing is fatal.
        assert_eq!(out.attempt.outcome, Outcome::Escalated);
        assert!(out.attempt.error.is_none());
        assert_eq!(indices(&out.attempt), vec![1, 2]);
        assert_eq!(validator.test_runs(), 2);
        for iteration in out.attempt.iterations() {
            let tests = iteration.test_result.as_ref().unwrap();
            assert!(!tests.passed);
            assert_eq!(tests.failing_cases[0].name, "timeout");
        }
    }

    #[tokio::test]
    async fn test_synthesis_error_counts_as_failed_iteration() {
        let h = harness(2);
        let synth = Arc::new(ScriptedSynth::with(vec![Reply::Error, Reply::Error]));
        let controller = h.controller(
            Arc::new(ScriptedPlanner::default()),
            synth,
            Arc::new(ScriptedValidator::default()),
        );

        let out = h.run(&controller).await;

        assert_eq!(out.attempt.outcome, Outcome::Escalated);
        assert_eq!(out.attempt.iteration_count(), 2);
        assert!(out.attempt.final_diagnostics().iter().all(|d| d.rule == "synthesis"));
    }

    #[tokio::test]
    async fn test_prior_diagnostics_are_passed_verbatim() {
        let h = harness(3);
        let synth = Arc::new(ScriptedSynth::default());
        let validator = Arc::new(ScriptedValidator {
            tests: Mutex::new(vec![failing_case()].into()),
            ..ScriptedValidator::default()
        });
        let controller = h.controller(Arc::new(ScriptedPlanner::default()), synth.clone(), validator);

        let out = h.run(&controller).await;

        assert_eq!(out.attempt.outcome, Outcome::Success);
        let seen = synth.seen();
        assert!(seen[0].is_empty());
        assert_eq!(seen[1], out.attempt.iterations()[0].feedback());
        assert_eq!(seen[1][0].rule, "test");
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let h = harness(3);
        let controller = h.controller(
            Arc::new(ScriptedPlanner::default()),
            Arc::new(ScriptedSynth::default()),
            Arc::new(ScriptedValidator::default()),
        );
        let cancel = CancellationToken::new();
        cancel.cancel();

        let out = h.run_with(&controller, &cancel).await;

        assert_eq!(out.attempt.outcome, Outcome::Cancelled);
        assert_eq!(out.attempt.iteration_count(), 0);
    }

    #[tokio::test]
    async fn test_cancellation_takes_effect_between_iterations() {
        let h = harness(5);
        let base = h.store.latest(&h.handle).unwrap();
        let cancel = CancellationToken::new();
        let synth = Arc::new(ScriptedSynth {
            cancel_on_call: Some(cancel.clone()),
            ..ScriptedSynth::default()
        });
        let controller = h.controller(
            Arc::new(ScriptedPlanner::default()),
            synth,
            Arc::new(ScriptedValidator::failing_tests()),
        );

        let out = h.run_with(&controller, &cancel).await;

        // The in-progress iteration completes and is recorded first.
        assert_eq!(out.attempt.outcome, Outcome::Cancelled);
        assert_eq!(out.attempt.iteration_count(), 1);
        assert_eq!(h.store.latest(&h.handle).unwrap().id(), base.id());
    }

    #[tokio::test]
    async fn test_observer_sees_every_iteration_and_one_finish() {
        let h = harness(3);
        let observer = Arc::new(RecordingObserver::default());
        let controller = h
            .controller(
                Arc::new(ScriptedPlanner::default()),
                Arc::new(ScriptedSynth::default()),
                Arc::new(ScriptedValidator::with_statics(vec![lint_error()])),
            )
            .with_observer(observer.clone());

        let out = h.run(&controller).await;

        let events = observer.events();
        let recorded = events
            .iter()
            .filter(|e| matches!(e, BuildEvent::IterationRecorded { .. }))
            .count();
        assert_eq!(recorded, 2);
        assert!(matches!(events.first(), Some(BuildEvent::StateEntered { state: BuildState::Planning, .. })));
        match events.last() {
            Some(BuildEvent::Finished {
                outcome,
                iteration_count,
                ..
            }) => {
                assert_eq!(*outcome, Outcome::Success);
                assert_eq!(*iteration_count, 2);
            }
            other => panic!("expected Finished, got {:?}", other),
        }
        assert!(events.iter().all(|e| e.attempt_id() == out.attempt.id));
    }
}

// =============================================================================
// Workspace exclusivity
// =============================================================================

mod exclusivity {
    use super::*;

    #[test]
    fn test_second_lease_is_refused_until_release() {
        let dir = tempdir().unwrap();
        let store = WorkspaceStore::new(dir.path()).unwrap();
        let handle = store.create(7).unwrap();

        let err = store.create(7).unwrap_err();
        assert!(matches!(err, WorkspaceError::AlreadyExists { factory_id: 7 }));
        assert!(store.create(8).is_ok());

        store.release(handle);
        assert!(store.create(7).is_ok());
    }

    #[test]
    fn test_lease_is_exclusive_across_store_instances() {
        let dir = tempdir().unwrap();
        let first = WorkspaceStore::new(dir.path()).unwrap();
        let second = WorkspaceStore::new(dir.path()).unwrap();

        let handle = first.create(3).unwrap();
        assert!(matches!(
            second.create(3),
            Err(WorkspaceError::AlreadyExists { .. })
        ));
        drop(handle);
        assert!(second.create(3).is_ok());
    }
}
