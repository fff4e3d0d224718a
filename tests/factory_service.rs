//! Registry, setup tracking and the build runner working together on one
//! database and workspace root.

use std::sync::Arc;
use std::time::Duration;

use anvil::config::BuildConfig;
use anvil::escalation::EscalationHandler;
use anvil::factory::db::{DbHandle, FactoryDb};
use anvil::factory::models::{FactoryStatus, NewFactory, SetupTaskStatus};
use anvil::factory::registry::Registry;
use anvil::factory::runner::{BuildRunner, CollaboratorSource, Collaborators};
use anvil::factory::setup::SetupTracker;
use anvil::workspace::WorkspaceStore;
use anvil_common::{
    CodeDiff, CollaboratorError, FeatureRequest, ImplementationPlan, Outcome, PlanStep, Planner,
    SynthesisOutput, SynthesisRequest, Synthesizer, TestResult, ValidationResult, Validator,
    WorkspaceSnapshot,
};
use async_trait::async_trait;
use tempfile::{TempDir, tempdir};
use tokio::sync::broadcast;

/// Plans one step, writes one file, passes or fails every test run.
struct Canned {
    tests_pass: bool,
}

#[async_trait]
impl Planner for Canned {
    async fn plan(&self, _r: &FeatureRequest) -> Result<ImplementationPlan, CollaboratorError> {
        Ok(ImplementationPlan {
            summary: "store sessions".into(),
            steps: vec![PlanStep {
                description: "add session table".into(),
                files: vec!["src/session.rs".into()],
            }],
            target_files: vec!["src/session.rs".into()],
            dependencies: vec![],
        })
    }
}

#[async_trait]
impl Synthesizer for Canned {
    async fn synthesize(
        &self,
        r: SynthesisRequest<'_>,
    ) -> Result<SynthesisOutput, CollaboratorError> {
        Ok(SynthesisOutput::Diff(CodeDiff::default().write(
            "src/session.rs",
            &format!("// session store, iteration {}", r.iteration),
        )))
    }
}

#[async_trait]
impl Validator for Canned {
    async fn validate_static(&self, _s: &WorkspaceSnapshot) -> ValidationResult {
        ValidationResult::pass()
    }

    async fn run_tests(&self, _s: &WorkspaceSnapshot) -> TestResult {
        if self.tests_pass {
            TestResult::pass(None)
        } else {
            TestResult::fail(vec![anvil_common::FailingCase {
                name: "session::expires".into(),
                message: "session never expired".into(),
                stack: None,
            }])
        }
    }
}

struct CannedSource {
    tests_pass: bool,
}

impl CollaboratorSource for CannedSource {
    fn collaborators(&self, _config: &BuildConfig, _store: &WorkspaceStore) -> Collaborators {
        let canned = Arc::new(Canned {
            tests_pass: self.tests_pass,
        });
        Collaborators {
            planner: canned.clone(),
            synthesizer: canned.clone(),
            validator: canned,
        }
    }
}

struct Service {
    _dir: TempDir,
    db: DbHandle,
    registry: Registry,
    setup: SetupTracker,
    runner: BuildRunner,
}

fn service(tests_pass: bool) -> Service {
    let dir = tempdir().unwrap();
    let db = DbHandle::new(FactoryDb::new(&dir.path().join("anvil.db")).unwrap());
    let store = WorkspaceStore::new(dir.path().join("workspaces")).unwrap();
    let (tx, _) = broadcast::channel(64);
    let defaults = BuildConfig {
        max_iterations: 2,
        workspace_root: dir.path().join("workspaces"),
        ..BuildConfig::default()
    };
    let escalation = EscalationHandler::new(db.clone());
    Service {
        registry: Registry::new(db.clone(), tx.clone(), defaults),
        setup: SetupTracker::new(db.clone(), tx.clone()),
        runner: BuildRunner::new(
            db.clone(),
            store,
            tx,
            escalation,
            Arc::new(CannedSource { tests_pass }),
        ),
        db,
        _dir: dir,
    }
}

fn new_factory(gate_on_setup: bool) -> NewFactory {
    NewFactory {
        tenant_id: "acme".into(),
        name: "billing".into(),
        assistants: vec![],
        gate_on_setup,
        max_iterations: None,
    }
}

async fn wait_until_finished(runner: &BuildRunner, factory_id: i64) {
    for _ in 0..500 {
        if runner.in_flight(factory_id).await.is_none() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("attempt did not finish");
}

#[tokio::test]
async fn test_builds_proceed_with_setup_tasks_outstanding() {
    let svc = service(true);
    let factory = svc.registry.create_factory(new_factory(false)).await.unwrap();
    assert_eq!(factory.status, FactoryStatus::Active);

    let tasks = svc
        .setup
        .generate_tasks(factory.id, "needs a postgres database and a stripe api key")
        .await
        .unwrap();
    assert_eq!(tasks.len(), 2);

    let submitted = svc.runner.submit(factory.id, "store sessions").await.unwrap();
    wait_until_finished(&svc.runner, factory.id).await;

    let attempt = svc
        .db
        .lock_sync()
        .unwrap()
        .get_attempt(submitted.attempt_id)
        .unwrap()
        .unwrap();
    assert_eq!(attempt.outcome, Outcome::Success);

    // The build left every setup task as it was.
    let after = svc.setup.list_tasks(factory.id).await.unwrap();
    assert!(after.iter().all(|t| t.status == SetupTaskStatus::Pending));
}

#[tokio::test]
async fn test_setup_changes_leave_attempt_history_alone() {
    let svc = service(false);
    let factory = svc.registry.create_factory(new_factory(false)).await.unwrap();

    let submitted = svc.runner.submit(factory.id, "store sessions").await.unwrap();
    wait_until_finished(&svc.runner, factory.id).await;
    let before = svc
        .db
        .lock_sync()
        .unwrap()
        .get_attempt(submitted.attempt_id)
        .unwrap()
        .unwrap();
    assert_eq!(before.outcome, Outcome::Escalated);

    let tasks = svc
        .setup
        .generate_tasks(factory.id, "deploy with docker")
        .await
        .unwrap();
    for task in &tasks {
        svc.setup
            .update_task(task.id, SetupTaskStatus::Completed)
            .await
            .unwrap();
    }

    let after = svc
        .db
        .lock_sync()
        .unwrap()
        .get_attempt(submitted.attempt_id)
        .unwrap()
        .unwrap();
    assert_eq!(before, after);
    let factory = svc.registry.get_factory(factory.id).await.unwrap();
    assert_eq!(factory.status, FactoryStatus::Active);
}

#[tokio::test]
async fn test_gated_factory_accepts_requests_only_after_setup() {
    let svc = service(true);
    let factory = svc.registry.create_factory(new_factory(true)).await.unwrap();
    assert_eq!(factory.status, FactoryStatus::Provisioning);

    let tasks = svc
        .setup
        .generate_tasks(factory.id, "register the webhook callback url")
        .await
        .unwrap();
    assert!(svc.runner.submit(factory.id, "too early").await.is_err());

    for task in &tasks {
        svc.setup
            .update_task(task.id, SetupTaskStatus::Completed)
            .await
            .unwrap();
    }
    let factory = svc.registry.get_factory(factory.id).await.unwrap();
    assert_eq!(factory.status, FactoryStatus::Active);

    svc.runner.submit(factory.id, "now").await.unwrap();
    wait_until_finished(&svc.runner, factory.id).await;
}

#[tokio::test]
async fn test_escalation_is_recorded_once_per_attempt() {
    let svc = service(false);
    let factory = svc.registry.create_factory(new_factory(false)).await.unwrap();

    let submitted = svc.runner.submit(factory.id, "store sessions").await.unwrap();
    wait_until_finished(&svc.runner, factory.id).await;

    let guard = svc.db.lock_sync().unwrap();
    let escalations = guard.list_escalations(factory.id).unwrap();
    assert_eq!(escalations.len(), 1);
    assert_eq!(escalations[0].attempt_id, submitted.attempt_id);
    assert_eq!(escalations[0].iteration_count, 2);
    // Escalation does not change the factory's status.
    let factory = guard.get_factory(factory.id).unwrap().unwrap();
    assert_eq!(factory.status, FactoryStatus::Active);
}
