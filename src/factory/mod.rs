//! Factory service: registry, setup tracking, build runner and the HTTP API.
//!
//! ## Module Map
//!
//! ```text
//! ┌──────────┐   HTTP   ┌──────────────────────────────────────────────────┐
//! │  Client  │ ───────> │  server.rs  (axum Router, ServerConfig)          │
//! │          │ <─────── │    └─ api.rs  (route handlers, AppState)         │
//! └──────────┘ WebSocket│         │                                        │
//!                       │         │ BuildRunner::submit()                  │
//!                       │         v                                        │
//!                       │  runner.rs  (one tokio task per attempt)         │
//!                       │         │                                        │
//!                       │         │ RepairController::run()                │
//!                       │         v                                        │
//!                       │  crate::repair  (plan/synthesize/validate/test)  │
//!                       │         │                                        │
//!                       │         │ Escalated -> EscalationHandler         │
//!                       │         v                                        │
//!                       │  crate::escalation                               │
//!                       └──────────────────────────────────────────────────┘
//! ```
//!
//! ## Supporting Modules
//!
//! | Module     | Responsibility                                               |
//! |------------|--------------------------------------------------------------|
//! | `models`   | `Factory`, `SetupTask`, attempt summaries, escalation records |
//! | `db`       | SQLite access via `DbHandle` (`Arc<Mutex<_>>` + blocking pool) |
//! | `registry` | Factory creation and status transitions                      |
//! | `setup`    | Setup task generation and the `gate_on_setup` promotion      |
//! | `ws`       | `WsMessage` enum + `broadcast_message()` helper              |
//!
//! ## Typical Request Flow
//!
//! 1. `POST /factories/{id}/features` -> `api::submit_feature()`
//! 2. `BuildRunner::submit` checks the factory is `Active`, leases its
//!    workspace (a second lease fails, giving `409`), stores the feature
//!    request and a pending attempt, and spawns the controller.
//! 3. Every state change, plan and iteration is written to `db` and
//!    broadcast on `/ws` as it happens.
//! 4. On `Success` the passing snapshot becomes the factory's current
//!    snapshot; on `Escalated` the escalation handler packages the attempt
//!    for review. The lease is released either way.

pub mod api;
pub mod db;
pub mod models;
pub mod registry;
pub mod runner;
pub mod server;
pub mod setup;
pub mod ws;
