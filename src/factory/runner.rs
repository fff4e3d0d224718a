use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anvil_common::{
    BuildAttempt, FeatureRequest, Outcome, Planner, SnapshotId, Synthesizer, Validator,
};
use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::db::DbHandle;
use super::models::Factory;
use super::ws::{WsMessage, broadcast_message};
use crate::config::BuildConfig;
use crate::errors::{FactoryError, WorkspaceError};
use crate::escalation::EscalationHandler;
use crate::reasoning::HttpReasoningClient;
use crate::repair::{BuildEvent, BuildObserver, RepairController, RunOutcome};
use crate::validation::CommandValidator;
use crate::workspace::{WorkspaceHandle, WorkspaceRoots, WorkspaceStore};

/// How long `shutdown` waits for each cancelled attempt to wind down.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// The collaborators one attempt runs with.
pub struct Collaborators {
    pub planner: Arc<dyn Planner>,
    pub synthesizer: Arc<dyn Synthesizer>,
    pub validator: Arc<dyn Validator>,
}

/// Builds collaborators for a factory's `BuildConfig`. `store` is the
/// store holding that factory's workspace.
pub trait CollaboratorSource: Send + Sync {
    fn collaborators(&self, config: &BuildConfig, store: &WorkspaceStore) -> Collaborators;
}

/// The reasoning service for planning and synthesis, local commands for
/// validation.
pub struct ServiceCollaborators {
    reasoning: Arc<HttpReasoningClient>,
}

impl ServiceCollaborators {
    pub fn new(reasoning: HttpReasoningClient) -> Self {
        Self {
            reasoning: Arc::new(reasoning),
        }
    }
}

impl CollaboratorSource for ServiceCollaborators {
    fn collaborators(&self, config: &BuildConfig, store: &WorkspaceStore) -> Collaborators {
        Collaborators {
            planner: self.reasoning.clone(),
            synthesizer: self.reasoning.clone(),
            validator: Arc::new(CommandValidator::new(
                store.clone(),
                config.lint.clone(),
                config.test.clone(),
            )),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SubmittedBuild {
    pub attempt_id: Uuid,
    pub feature_request_id: Uuid,
}

struct RunningAttempt {
    attempt_id: Uuid,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

type RunningMap = Arc<Mutex<HashMap<i64, RunningAttempt>>>;

fn lock_running(running: &RunningMap) -> MutexGuard<'_, HashMap<i64, RunningAttempt>> {
    running.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Owned by an attempt's task. Dropping it removes the factory's `running`
/// entry if it still belongs to this attempt, so a task that panics or is
/// aborted does not stay in flight.
struct RunningEntry {
    running: RunningMap,
    factory_id: i64,
    attempt_id: Uuid,
    settled: bool,
}

impl Drop for RunningEntry {
    fn drop(&mut self) {
        if !self.settled {
            tracing::error!(
                factory_id = self.factory_id,
                attempt_id = %self.attempt_id,
                "attempt task ended before settling"
            );
        }
        let mut running = lock_running(&self.running);
        if running
            .get(&self.factory_id)
            .is_some_and(|r| r.attempt_id == self.attempt_id)
        {
            running.remove(&self.factory_id);
        }
    }
}

/// Writes every controller event to the database and the live stream.
struct PersistingObserver {
    db: DbHandle,
    ws_tx: broadcast::Sender<String>,
}

#[async_trait]
impl BuildObserver for PersistingObserver {
    async fn on_event(&self, attempt: &BuildAttempt, event: &BuildEvent) {
        let snapshot = attempt.clone();
        let iteration = match event {
            BuildEvent::IterationRecorded { iteration, .. } => Some(iteration.clone()),
            _ => None,
        };
        let result = self
            .db
            .call(move |db| {
                if let Some(iteration) = &iteration {
                    db.upsert_iteration(snapshot.id, iteration)?;
                }
                db.update_attempt(&snapshot)
            })
            .await;
        if let Err(e) = result {
            tracing::error!(attempt_id = %attempt.id, error = %format!("{:#}", e), "failed to persist build event");
        }
        broadcast_message(&self.ws_tx, &WsMessage::Build(event.clone()));
    }
}

/// Owns in-flight attempts: one tokio task per attempt, at most one per
/// factory (the workspace lease enforces it).
#[derive(Clone)]
pub struct BuildRunner {
    db: DbHandle,
    roots: WorkspaceRoots,
    ws_tx: broadcast::Sender<String>,
    escalation: EscalationHandler,
    source: Arc<dyn CollaboratorSource>,
    running: RunningMap,
}

impl BuildRunner {
    /// `store` is the server's default root; factories created with another
    /// `workspace_root` get a store opened on demand.
    pub fn new(
        db: DbHandle,
        store: WorkspaceStore,
        ws_tx: broadcast::Sender<String>,
        escalation: EscalationHandler,
        source: Arc<dyn CollaboratorSource>,
    ) -> Self {
        Self {
            db,
            roots: WorkspaceRoots::new(store),
            ws_tx,
            escalation,
            source,
            running: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn store(&self) -> &WorkspaceStore {
        self.roots.default_store()
    }

    /// The store holding `factory`'s workspace.
    pub fn store_for(&self, factory: &Factory) -> Result<WorkspaceStore, FactoryError> {
        Ok(self.roots.open(&factory.config.workspace_root)?)
    }

    /// The attempt currently running for `factory_id`.
    pub async fn in_flight(&self, factory_id: i64) -> Option<Uuid> {
        lock_running(&self.running)
            .get(&factory_id)
            .map(|r| r.attempt_id)
    }

    /// Accept a feature request and start its attempt in the background.
    pub async fn submit(
        &self,
        factory_id: i64,
        description: &str,
    ) -> Result<SubmittedBuild, FactoryError> {
        let description = description.trim();
        if description.is_empty() {
            return Err(FactoryError::BadRequest("description must not be empty".into()));
        }

        let factory = self.load_factory(factory_id).await?;
        if !factory.status.accepts_requests() {
            return Err(FactoryError::NotAcceptingRequests {
                id: factory_id,
                status: factory.status.to_string(),
            });
        }

        let store = self.store_for(&factory)?;
        let handle = lease(&store, factory_id)?;

        let request = FeatureRequest::new(factory_id, description);
        let attempt = BuildAttempt::new(&request, factory.config.max_iterations);
        let submitted = SubmittedBuild {
            attempt_id: attempt.id,
            feature_request_id: request.id,
        };
        {
            let request = request.clone();
            let attempt = attempt.clone();
            self.db
                .call(move |db| {
                    db.insert_feature_request(&request)?;
                    db.insert_attempt(&attempt)
                })
                .await?;
        }

        tracing::info!(
            factory_id,
            attempt_id = %attempt.id,
            max_iterations = attempt.max_iterations,
            "feature request accepted"
        );
        broadcast_message(
            &self.ws_tx,
            &WsMessage::AttemptQueued {
                attempt_id: attempt.id,
                factory_id,
                feature_request_id: request.id,
                description: request.description.clone(),
            },
        );

        let collaborators = self.source.collaborators(&factory.config, &store);
        let controller = RepairController::new(
            collaborators.planner,
            collaborators.synthesizer,
            collaborators.validator,
            store.clone(),
            factory.config.clone(),
        )
        .with_observer(Arc::new(PersistingObserver {
            db: self.db.clone(),
            ws_tx: self.ws_tx.clone(),
        }));

        let cancel = CancellationToken::new();
        let attempt_id = attempt.id;
        let mut running = lock_running(&self.running);
        let task = {
            let runner = self.clone();
            let cancel = cancel.clone();
            let entry = RunningEntry {
                running: self.running.clone(),
                factory_id,
                attempt_id,
                settled: false,
            };
            tokio::spawn(async move {
                let mut entry = entry;
                let outcome = controller.run(attempt, &request, &handle, &cancel).await;
                runner.settle(&store, outcome).await;
                store.release(handle);
                entry.settled = true;
            })
        };
        running.insert(
            factory_id,
            RunningAttempt {
                attempt_id,
                cancel,
                task,
            },
        );
        Ok(submitted)
    }

    /// Apply a finished attempt's effects on the factory.
    async fn settle(&self, store: &WorkspaceStore, outcome: RunOutcome) {
        let RunOutcome {
            attempt,
            final_snapshot,
        } = outcome;
        match (attempt.outcome, final_snapshot) {
            (Outcome::Success, Some(snapshot)) => {
                let factory_id = attempt.factory_id;
                let id = snapshot.id().clone();
                match self
                    .db
                    .call(move |db| db.set_current_snapshot(factory_id, Some(&id)))
                    .await
                {
                    Ok(factory) => {
                        broadcast_message(&self.ws_tx, &WsMessage::FactoryUpdated { factory })
                    }
                    Err(e) => tracing::error!(
                        factory_id,
                        error = %format!("{:#}", e),
                        "failed to record passing snapshot"
                    ),
                }
            }
            (Outcome::Escalated, Some(snapshot)) => {
                if let Err(e) = self.escalation.escalate(store, &attempt, &snapshot).await {
                    tracing::error!(attempt_id = %attempt.id, error = %e, "escalation failed");
                }
            }
            (Outcome::Success | Outcome::Escalated, None) => {
                tracing::warn!(attempt_id = %attempt.id, outcome = %attempt.outcome, "attempt finished without a snapshot");
            }
            _ => {}
        }
    }

    /// Signal cancellation; the attempt stops at its next iteration boundary.
    pub async fn cancel(&self, factory_id: i64, attempt_id: Uuid) -> Result<(), FactoryError> {
        {
            let running = lock_running(&self.running);
            if let Some(r) = running.get(&factory_id)
                && r.attempt_id == attempt_id
            {
                tracing::info!(factory_id, %attempt_id, "cancelling attempt");
                r.cancel.cancel();
                return Ok(());
            }
        }
        let attempt = self.db.call(move |db| db.get_attempt(attempt_id)).await?;
        match attempt {
            Some(a) if a.factory_id == factory_id => Err(FactoryError::AttemptNotRunning {
                id: attempt_id.to_string(),
            }),
            _ => Err(FactoryError::AttemptNotFound {
                id: attempt_id.to_string(),
            }),
        }
    }

    /// Cancel every in-flight attempt and wait for them to stop.
    pub async fn shutdown(&self) {
        let drained: Vec<(i64, RunningAttempt)> = lock_running(&self.running).drain().collect();
        for (_, r) in &drained {
            r.cancel.cancel();
        }
        for (factory_id, r) in drained {
            tracing::info!(factory_id, attempt_id = %r.attempt_id, "waiting for attempt to stop");
            if tokio::time::timeout(SHUTDOWN_GRACE, r.task).await.is_err() {
                tracing::warn!(factory_id, attempt_id = %r.attempt_id, "attempt did not stop in time");
            }
        }
    }

    /// Restore a factory's workspace to an earlier snapshot. Refused while an
    /// attempt holds the workspace.
    pub async fn revert(
        &self,
        factory_id: i64,
        snapshot_id: SnapshotId,
    ) -> Result<Factory, FactoryError> {
        let factory = self.load_factory(factory_id).await?;
        let store = self.store_for(&factory)?;
        let handle = lease(&store, factory_id)?;
        let snapshot = store.load_snapshot(factory_id, &snapshot_id)?;
        store.restore(&handle, &snapshot)?;
        let id = snapshot_id.clone();
        let factory = self
            .db
            .call(move |db| db.set_current_snapshot(factory_id, Some(&id)))
            .await?;
        store.release(handle);

        tracing::info!(factory_id, snapshot = %snapshot_id.short(), "workspace reverted");
        broadcast_message(
            &self.ws_tx,
            &WsMessage::WorkspaceReverted {
                factory_id,
                snapshot_id,
            },
        );
        broadcast_message(
            &self.ws_tx,
            &WsMessage::FactoryUpdated {
                factory: factory.clone(),
            },
        );
        Ok(factory)
    }

    async fn load_factory(&self, id: i64) -> Result<Factory, FactoryError> {
        self.db
            .call(move |db| db.get_factory(id))
            .await?
            .ok_or(FactoryError::FactoryNotFound { id })
    }
}

fn lease(store: &WorkspaceStore, factory_id: i64) -> Result<WorkspaceHandle, FactoryError> {
    store.create(factory_id).map_err(|e| match e {
        WorkspaceError::AlreadyExists { factory_id } => FactoryError::BuildInFlight { factory_id },
        other => other.into(),
    })
}
