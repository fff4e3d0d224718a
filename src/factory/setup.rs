use std::collections::HashSet;

use tokio::sync::broadcast;

use super::db::DbHandle;
use super::models::{Factory, FactoryStatus, SetupCategory, SetupTask, SetupTaskStatus};
use super::ws::{WsMessage, broadcast_message};
use crate::errors::FactoryError;

/// Categories whose keywords appear in `plan_summary`, in generation order.
pub fn derive_categories(plan_summary: &str) -> Vec<SetupCategory> {
    let text = plan_summary.to_lowercase();
    SetupCategory::DERIVED
        .into_iter()
        .filter(|c| c.keywords().iter().any(|k| text.contains(k)))
        .collect()
}

/// Externally completed setup steps. Works only on setup tasks and factory
/// status; build attempts are never read or changed here.
#[derive(Clone)]
pub struct SetupTracker {
    db: DbHandle,
    ws_tx: broadcast::Sender<String>,
}

impl SetupTracker {
    pub fn new(db: DbHandle, ws_tx: broadcast::Sender<String>) -> Self {
        Self { db, ws_tx }
    }

    /// Create tasks for the categories the summary mentions, skipping
    /// categories the factory already has. Returns only the new tasks.
    pub async fn generate_tasks(
        &self,
        factory_id: i64,
        plan_summary: &str,
    ) -> Result<Vec<SetupTask>, FactoryError> {
        let categories = derive_categories(plan_summary);
        let created = self
            .db
            .call(move |db| {
                if db.get_factory(factory_id)?.is_none() {
                    return Ok(Err(FactoryError::FactoryNotFound { id: factory_id }));
                }
                let existing: HashSet<_> = db
                    .list_setup_tasks(factory_id)?
                    .into_iter()
                    .map(|t| t.category)
                    .collect();

                let wanted: Vec<(SetupCategory, bool)> = if categories.is_empty() {
                    vec![(SetupCategory::Review, false)]
                } else {
                    categories.into_iter().map(|c| (c, true)).collect()
                };

                let mut created = Vec::new();
                for (category, required) in wanted {
                    if existing.contains(&category) {
                        continue;
                    }
                    created.push(db.create_setup_task(
                        factory_id,
                        category,
                        category.default_title(),
                        required,
                    )?);
                }
                Ok(Ok(created))
            })
            .await??;

        tracing::info!(factory_id, created = created.len(), "setup tasks generated");
        for task in &created {
            broadcast_message(&self.ws_tx, &WsMessage::SetupTaskUpdated { task: task.clone() });
        }
        self.promote_if_ready(factory_id).await?;
        Ok(created)
    }

    pub async fn update_task(
        &self,
        task_id: i64,
        status: SetupTaskStatus,
    ) -> Result<SetupTask, FactoryError> {
        let task = self
            .db
            .call(move |db| {
                if db.get_setup_task(task_id)?.is_none() {
                    return Ok(None);
                }
                db.update_setup_task_status(task_id, status).map(Some)
            })
            .await?
            .ok_or(FactoryError::SetupTaskNotFound { id: task_id })?;

        tracing::info!(
            factory_id = task.factory_id,
            task_id,
            category = %task.category,
            status = %task.status,
            "setup task updated"
        );
        broadcast_message(&self.ws_tx, &WsMessage::SetupTaskUpdated { task: task.clone() });
        self.promote_if_ready(task.factory_id).await?;
        Ok(task)
    }

    pub async fn get_task(&self, task_id: i64) -> Result<SetupTask, FactoryError> {
        self.db
            .call(move |db| db.get_setup_task(task_id))
            .await?
            .ok_or(FactoryError::SetupTaskNotFound { id: task_id })
    }

    pub async fn list_tasks(&self, factory_id: i64) -> Result<Vec<SetupTask>, FactoryError> {
        let tasks = self
            .db
            .call(move |db| {
                if db.get_factory(factory_id)?.is_none() {
                    return Ok(None);
                }
                db.list_setup_tasks(factory_id).map(Some)
            })
            .await?;
        tasks.ok_or(FactoryError::FactoryNotFound { id: factory_id })
    }

    /// Promote a gated `Provisioning` factory once every required task is
    /// completed or skipped.
    async fn promote_if_ready(&self, factory_id: i64) -> Result<Option<Factory>, FactoryError> {
        let promoted = self
            .db
            .call(move |db| {
                let Some(factory) = db.get_factory(factory_id)? else {
                    return Ok(None);
                };
                if !factory.gate_on_setup || factory.status != FactoryStatus::Provisioning {
                    return Ok(None);
                }
                let ready = db
                    .list_setup_tasks(factory_id)?
                    .iter()
                    .filter(|t| t.required)
                    .all(|t| t.status.is_resolved());
                if !ready {
                    return Ok(None);
                }
                db.set_factory_status(factory_id, FactoryStatus::Active).map(Some)
            })
            .await?;

        if let Some(factory) = &promoted {
            tracing::info!(factory_id, "required setup resolved, factory active");
            broadcast_message(
                &self.ws_tx,
                &WsMessage::FactoryUpdated {
                    factory: factory.clone(),
                },
            );
        }
        Ok(promoted)
    }
}
