use tokio::sync::broadcast;

use super::db::DbHandle;
use super::models::{Factory, FactoryStatus, NewFactory};
use super::ws::{WsMessage, broadcast_message};
use crate::config::BuildConfig;
use crate::errors::FactoryError;

/// Factory identity and lifecycle.
///
/// New factories start `Provisioning`. A factory without `gate_on_setup` is
/// promoted to `Active` as soon as it is created; a gated one waits for the
/// setup tracker to see every required task resolved.
#[derive(Clone)]
pub struct Registry {
    db: DbHandle,
    ws_tx: broadcast::Sender<String>,
    defaults: BuildConfig,
}

impl Registry {
    pub fn new(db: DbHandle, ws_tx: broadcast::Sender<String>, defaults: BuildConfig) -> Self {
        Self { db, ws_tx, defaults }
    }

    pub fn defaults(&self) -> &BuildConfig {
        &self.defaults
    }

    /// Register a factory. Its `BuildConfig` is fixed here from the server
    /// defaults plus any per-factory override.
    pub async fn create_factory(&self, new: NewFactory) -> Result<Factory, FactoryError> {
        let tenant_id = new.tenant_id.trim().to_string();
        let name = new.name.trim().to_string();
        if tenant_id.is_empty() {
            return Err(FactoryError::BadRequest("tenant_id must not be empty".into()));
        }
        if name.is_empty() {
            return Err(FactoryError::BadRequest("name must not be empty".into()));
        }

        let mut config = self.defaults.clone();
        if let Some(max) = new.max_iterations {
            config.max_iterations = max;
        }
        config
            .validate()
            .map_err(|e| FactoryError::BadRequest(e.to_string()))?;

        let assistants = new.assistants;
        let gate = new.gate_on_setup;
        let factory = self
            .db
            .call(move |db| {
                let factory = db.create_factory(&tenant_id, &name, &assistants, &config, gate)?;
                if gate {
                    Ok(factory)
                } else {
                    db.set_factory_status(factory.id, FactoryStatus::Active)
                }
            })
            .await?;

        tracing::info!(
            factory_id = factory.id,
            tenant_id = %factory.tenant_id,
            status = %factory.status,
            "factory created"
        );
        broadcast_message(
            &self.ws_tx,
            &WsMessage::FactoryCreated {
                factory: factory.clone(),
            },
        );
        Ok(factory)
    }

    pub async fn get_factory(&self, id: i64) -> Result<Factory, FactoryError> {
        self.db
            .call(move |db| db.get_factory(id))
            .await?
            .ok_or(FactoryError::FactoryNotFound { id })
    }

    pub async fn list_by_tenant(&self, tenant_id: Option<String>) -> Result<Vec<Factory>, FactoryError> {
        Ok(self
            .db
            .call(move |db| db.list_factories(tenant_id.as_deref()))
            .await?)
    }

    /// Move a factory to `to`. Setting the current status again is a no-op.
    pub async fn update_status(&self, id: i64, to: FactoryStatus) -> Result<Factory, FactoryError> {
        let result = self
            .db
            .call(move |db| {
                let Some(factory) = db.get_factory(id)? else {
                    return Ok(Err(FactoryError::FactoryNotFound { id }));
                };
                if factory.status == to {
                    return Ok(Ok((factory, false)));
                }
                if !factory.status.can_transition_to(to) {
                    return Ok(Err(FactoryError::InvalidTransition {
                        id,
                        from: factory.status.to_string(),
                        to: to.to_string(),
                    }));
                }
                Ok(Ok((db.set_factory_status(id, to)?, true)))
            })
            .await?;
        let (factory, changed) = result?;

        if changed {
            tracing::info!(factory_id = id, status = %to, "factory status changed");
            broadcast_message(
                &self.ws_tx,
                &WsMessage::FactoryUpdated {
                    factory: factory.clone(),
                },
            );
        }
        Ok(factory)
    }
}
