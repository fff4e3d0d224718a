use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{Router, routing::get};
use tokio::sync::broadcast;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use super::api::{self, AppState};
use super::db::{DbHandle, FactoryDb};
use super::registry::Registry;
use super::runner::{BuildRunner, ServiceCollaborators};
use super::setup::SetupTracker;
use super::ws;
use crate::config::{AnvilConfig, BuildConfig, ReasoningSection};
use crate::escalation::{BroadcastNotifier, EscalationHandler, WebhookNotifier};
use crate::reasoning::HttpReasoningClient;
use crate::workspace::WorkspaceStore;

/// Capacity of the live event channel.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Everything `start_server` needs, resolved from `AnvilConfig`.
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub db_path: PathBuf,
    pub workspace_root: PathBuf,
    pub dev_mode: bool,
    pub build: BuildConfig,
    pub reasoning: ReasoningSection,
    pub webhook_url: Option<String>,
}

impl ServerConfig {
    pub fn from_config(config: &AnvilConfig) -> Self {
        Self {
            host: config.toml.server.host.clone(),
            port: config.toml.server.port,
            db_path: config.db_path(),
            workspace_root: config.workspace_root(),
            dev_mode: config.toml.server.dev_mode,
            build: config.build_config(),
            reasoning: config.toml.reasoning.clone(),
            webhook_url: config.toml.escalation.webhook_url.clone(),
        }
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Build the full application router: API, live events and request tracing.
pub fn build_router(state: Arc<AppState>, dev_mode: bool) -> Router {
    let mut app = api::api_router()
        .route("/ws", get(ws::ws_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http());
    if dev_mode {
        app = app.layer(CorsLayer::permissive());
    }
    app
}

/// Wire the database, workspace store, collaborators and services together.
pub fn build_state(config: &ServerConfig, db: FactoryDb) -> Result<Arc<AppState>> {
    let db = DbHandle::new(db);
    let (ws_tx, _rx) = broadcast::channel::<String>(EVENT_CHANNEL_CAPACITY);
    let store = WorkspaceStore::new(&config.workspace_root)
        .with_context(|| format!("Failed to open workspace root {}", config.workspace_root.display()))?;

    let mut escalation = EscalationHandler::new(db.clone())
        .with_notifier(Arc::new(BroadcastNotifier::new(ws_tx.clone())));
    if let Some(url) = &config.webhook_url {
        escalation = escalation.with_notifier(Arc::new(WebhookNotifier::new(url)?));
    }

    let reasoning = HttpReasoningClient::new(&config.reasoning)?;
    let runner = BuildRunner::new(
        db.clone(),
        store,
        ws_tx.clone(),
        escalation,
        Arc::new(ServiceCollaborators::new(reasoning)),
    );

    Ok(Arc::new(AppState {
        registry: Registry::new(db.clone(), ws_tx.clone(), config.build.clone()),
        setup: SetupTracker::new(db.clone(), ws_tx.clone()),
        runner,
        db,
        ws_tx,
    }))
}

/// Start the build status server and run until Ctrl+C.
pub async fn start_server(config: ServerConfig) -> Result<()> {
    if let Some(parent) = config.db_path.parent() {
        std::fs::create_dir_all(parent).context("Failed to create database directory")?;
    }

    let db = FactoryDb::new(&config.db_path).context("Failed to initialize factory database")?;
    let orphaned = db.fail_orphaned_attempts()?;
    if orphaned > 0 {
        tracing::warn!(count = orphaned, "closed attempts left pending by a previous run");
    }

    let state = build_state(&config, db)?;
    let app = build_router(state.clone(), config.dev_mode);

    let addr = config.addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;
    let local_addr = listener.local_addr()?;
    tracing::info!(
        addr = %local_addr,
        db = %config.db_path.display(),
        workspaces = %config.workspace_root.display(),
        reasoning = %config.reasoning.endpoint,
        "anvil build server listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    state.runner.shutdown().await;
    tracing::info!("server shut down gracefully");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for Ctrl+C");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown requested");
}
