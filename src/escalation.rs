//! Hands stalled attempts to a human.
//!
//! An escalation writes a durable artifact (the attempt with its full
//! iteration history, plus the final snapshot's files) under
//! `<workspace_root>/escalations/<attempt_id>/`, stores a record keyed by
//! attempt id, and notifies reviewers once. Calling it again for the same
//! attempt returns the stored record and sends nothing.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anvil_common::{BuildAttempt, Diagnostic, WorkspaceSnapshot};
use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::errors::FactoryError;
use crate::factory::db::DbHandle;
use crate::factory::models::EscalationRecord;
use crate::factory::ws::{WsMessage, broadcast_message};
use crate::workspace::WorkspaceStore;

pub const ESCALATIONS_DIR: &str = "escalations";

/// Payload sent to the review channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EscalationNotice {
    pub attempt_id: Uuid,
    pub factory_id: i64,
    pub iteration_count: u32,
    pub final_diagnostics: Vec<Diagnostic>,
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notice: &EscalationNotice) -> anyhow::Result<()>;
}

/// Publishes escalations on the live event stream.
pub struct BroadcastNotifier {
    tx: broadcast::Sender<String>,
}

impl BroadcastNotifier {
    pub fn new(tx: broadcast::Sender<String>) -> Self {
        Self { tx }
    }
}

#[async_trait]
impl Notifier for BroadcastNotifier {
    async fn notify(&self, notice: &EscalationNotice) -> anyhow::Result<()> {
        broadcast_message(&self.tx, &WsMessage::Escalated(notice.clone()));
        Ok(())
    }
}

/// POSTs the notice as JSON to a configured URL.
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: &str) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("Failed to build webhook HTTP client")?;
        Ok(Self {
            client,
            url: url.to_string(),
        })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, notice: &EscalationNotice) -> anyhow::Result<()> {
        self.client
            .post(&self.url)
            .json(notice)
            .send()
            .await
            .with_context(|| format!("Failed to deliver escalation webhook to {}", self.url))?
            .error_for_status()
            .context("Escalation webhook returned error status")?;
        Ok(())
    }
}

#[derive(Clone)]
pub struct EscalationHandler {
    db: DbHandle,
    notifiers: Vec<Arc<dyn Notifier>>,
}

impl EscalationHandler {
    pub fn new(db: DbHandle) -> Self {
        Self {
            db,
            notifiers: Vec::new(),
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifiers.push(notifier);
        self
    }

    /// Where the artifact for `attempt_id` lives under a workspace root.
    pub fn artifact_dir(workspace_root: &Path, attempt_id: Uuid) -> PathBuf {
        workspace_root
            .join(ESCALATIONS_DIR)
            .join(attempt_id.to_string())
    }

    /// Package `attempt` and `snapshot`, taken from `store`, for review.
    /// Idempotent by attempt id. Factory status is left alone.
    pub async fn escalate(
        &self,
        store: &WorkspaceStore,
        attempt: &BuildAttempt,
        snapshot: &WorkspaceSnapshot,
    ) -> Result<EscalationRecord, FactoryError> {
        let attempt_id = attempt.id;
        let existing = self
            .db
            .call(move |db| db.get_escalation_by_attempt(attempt_id))
            .await?;
        if let Some(record) = existing {
            tracing::debug!(%attempt_id, "attempt already escalated");
            return Ok(record);
        }

        let dir = Self::artifact_dir(store.root(), attempt_id);
        Self::write_artifact(store, &dir, attempt, snapshot)?;

        let diagnostics = attempt.final_diagnostics();
        let notice = EscalationNotice {
            attempt_id,
            factory_id: attempt.factory_id,
            iteration_count: attempt.iteration_count(),
            final_diagnostics: diagnostics.clone(),
        };
        let factory_id = attempt.factory_id;
        let feature_request_id = attempt.feature_request_id;
        let iteration_count = attempt.iteration_count();
        let snapshot_id = snapshot.id().clone();
        let artifact_path = dir.display().to_string();
        let (record, created) = self
            .db
            .call(move |db| {
                db.insert_escalation(
                    attempt_id,
                    factory_id,
                    feature_request_id,
                    iteration_count,
                    &diagnostics,
                    Some(&snapshot_id),
                    &artifact_path,
                )
            })
            .await?;

        if created {
            tracing::warn!(
                %attempt_id,
                factory_id,
                iterations = iteration_count,
                artifact = %record.artifact_path,
                "attempt escalated for human review"
            );
            for notifier in &self.notifiers {
                if let Err(e) = notifier.notify(&notice).await {
                    tracing::error!(%attempt_id, error = %format!("{:#}", e), "escalation notification failed");
                }
            }
        }
        Ok(record)
    }

    fn write_artifact(
        store: &WorkspaceStore,
        dir: &Path,
        attempt: &BuildAttempt,
        snapshot: &WorkspaceSnapshot,
    ) -> Result<(), FactoryError> {
        let files_dir = dir.join("snapshot");
        if files_dir.exists() {
            std::fs::remove_dir_all(&files_dir)
                .with_context(|| format!("Failed to clear {}", files_dir.display()))?;
        }
        std::fs::create_dir_all(&files_dir)
            .with_context(|| format!("Failed to create {}", files_dir.display()))?;

        let attempt_json =
            serde_json::to_vec_pretty(attempt).context("Failed to serialize attempt")?;
        std::fs::write(dir.join("attempt.json"), attempt_json)
            .context("Failed to write attempt.json")?;
        let manifest =
            serde_json::to_vec_pretty(snapshot).context("Failed to serialize snapshot")?;
        std::fs::write(dir.join("manifest.json"), manifest)
            .context("Failed to write manifest.json")?;
        store.checkout(snapshot, &files_dir)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BuildConfig;
    use crate::factory::db::FactoryDb;
    use anvil_common::{BuildIteration, CodeDiff, FeatureRequest, Outcome, TestResult, ValidationResult};
    use std::sync::Mutex;
    use tempfile::tempdir;

    #[derive(Default)]
    struct CountingNotifier {
        notices: Mutex<Vec<EscalationNotice>>,
    }

    #[async_trait]
    impl Notifier for CountingNotifier {
        async fn notify(&self, notice: &EscalationNotice) -> anyhow::Result<()> {
            self.notices.lock().unwrap().push(notice.clone());
            Ok(())
        }
    }

    struct FailingNotifier;

    #[async_trait]
    impl Notifier for FailingNotifier {
        async fn notify(&self, _notice: &EscalationNotice) -> anyhow::Result<()> {
            anyhow::bail!("review channel down")
        }
    }

    fn escalated_attempt(db: &DbHandle, store: &WorkspaceStore) -> (BuildAttempt, WorkspaceSnapshot) {
        let guard = db.lock_sync().unwrap();
        let factory = guard
            .create_factory("t", "f", &[], &BuildConfig::default(), false)
            .unwrap();
        let req = FeatureRequest::new(factory.id, "add cart");
        guard.insert_feature_request(&req).unwrap();
        let mut attempt = BuildAttempt::new(&req, 1);
        guard.insert_attempt(&attempt).unwrap();
        drop(guard);

        let handle = store.create(factory.id).unwrap();
        let snap = store
            .apply(&handle, &CodeDiff::default().write("src/cart.rs", "fn total() {}"))
            .unwrap();
        let mut it = BuildIteration::begin(1);
        it.validation_result = Some(ValidationResult::pass());
        it.test_result = Some(TestResult::fail(vec![anvil_common::FailingCase {
            name: "cart::total".into(),
            message: "wrong sum".into(),
            stack: None,
        }]));
        attempt.push_iteration(it).unwrap();
        attempt.finish(Outcome::Escalated);
        (attempt, snap)
    }

    #[tokio::test]
    async fn test_escalate_is_idempotent_and_notifies_once() {
        let dir = tempdir().unwrap();
        let db = DbHandle::new(FactoryDb::new_in_memory().unwrap());
        let store = WorkspaceStore::new(dir.path().join("ws")).unwrap();
        let counter = Arc::new(CountingNotifier::default());
        let handler = EscalationHandler::new(db.clone())
            .with_notifier(counter.clone())
            .with_notifier(Arc::new(FailingNotifier));

        let (attempt, snap) = escalated_attempt(&db, &store);
        let first = handler.escalate(&store, &attempt, &snap).await.unwrap();
        let second = handler.escalate(&store, &attempt, &snap).await.unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(first.iteration_count, 1);
        assert_eq!(first.final_diagnostics[0].rule, "test");
        assert_eq!(counter.notices.lock().unwrap().len(), 1);

        let dir = EscalationHandler::artifact_dir(store.root(), attempt.id);
        assert!(dir.join("attempt.json").exists());
        assert!(dir.join("manifest.json").exists());
        assert_eq!(
            std::fs::read_to_string(dir.join("snapshot/src/cart.rs")).unwrap(),
            "fn total() {}"
        );
    }

    #[tokio::test]
    async fn test_escalate_leaves_factory_status_unchanged() {
        let dir = tempdir().unwrap();
        let db = DbHandle::new(FactoryDb::new_in_memory().unwrap());
        let store = WorkspaceStore::new(dir.path().join("ws")).unwrap();
        let handler = EscalationHandler::new(db.clone());
        let (attempt, snap) = escalated_attempt(&db, &store);
        let before = db.lock_sync().unwrap().get_factory(attempt.factory_id).unwrap().unwrap();

        handler.escalate(&store, &attempt, &snap).await.unwrap();

        let after = db.lock_sync().unwrap().get_factory(attempt.factory_id).unwrap().unwrap();
        assert_eq!(before.status, after.status);
    }

    #[tokio::test]
    async fn test_broadcast_notifier_publishes_escalated_message() {
        let (tx, mut rx) = broadcast::channel(4);
        let notifier = BroadcastNotifier::new(tx);
        notifier
            .notify(&EscalationNotice {
                attempt_id: Uuid::nil(),
                factory_id: 3,
                iteration_count: 2,
                final_diagnostics: vec![],
            })
            .await
            .unwrap();
        let msg = rx.recv().await.unwrap();
        assert!(msg.contains("\"type\":\"Escalated\""));
    }
}
