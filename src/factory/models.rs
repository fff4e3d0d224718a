use std::str::FromStr;

use anvil_common::{BuildAttempt, BuildState, Diagnostic, FeatureRequest, Outcome, SnapshotId};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::BuildConfig;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FactoryStatus {
    Provisioning,
    Active,
    Paused,
    Error,
}

impl FactoryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Provisioning => "provisioning",
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Error => "error",
        }
    }

    /// Provisioning -> Active, Active <-> Paused, anything -> Error,
    /// Error -> Provisioning.
    pub fn can_transition_to(&self, to: FactoryStatus) -> bool {
        use FactoryStatus::*;
        matches!(
            (self, to),
            (Provisioning, Active)
                | (Active, Paused)
                | (Paused, Active)
                | (_, Error)
                | (Error, Provisioning)
        )
    }

    pub fn accepts_requests(&self) -> bool {
        matches!(self, Self::Active)
    }
}

impl std::fmt::Display for FactoryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FactoryStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "provisioning" => Ok(Self::Provisioning),
            "active" => Ok(Self::Active),
            "paused" => Ok(Self::Paused),
            "error" => Ok(Self::Error),
            _ => Err(format!("Invalid factory status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Factory {
    pub id: i64,
    pub tenant_id: String,
    pub name: String,
    pub status: FactoryStatus,
    /// Opaque references to the assistants bound to this factory.
    pub assistants: Vec<String>,
    pub config: BuildConfig,
    pub current_snapshot_id: Option<SnapshotId>,
    pub gate_on_setup: bool,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewFactory {
    pub tenant_id: String,
    pub name: String,
    #[serde(default)]
    pub assistants: Vec<String>,
    #[serde(default)]
    pub gate_on_setup: bool,
    /// Per-factory iteration ceiling; falls back to the server default.
    #[serde(default)]
    pub max_iterations: Option<u32>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FactoryDetail {
    #[serde(flatten)]
    pub factory: Factory,
    pub setup_tasks: Vec<SetupTask>,
    pub in_flight_attempt: Option<Uuid>,
}

// ── Setup tasks ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SetupCategory {
    Credentials,
    Database,
    Secrets,
    Deployment,
    Domain,
    Webhook,
    Review,
}

impl SetupCategory {
    /// Categories derived from plan text, in the order they are generated.
    pub const DERIVED: [SetupCategory; 6] = [
        Self::Credentials,
        Self::Database,
        Self::Secrets,
        Self::Deployment,
        Self::Domain,
        Self::Webhook,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Credentials => "credentials",
            Self::Database => "database",
            Self::Secrets => "secrets",
            Self::Deployment => "deployment",
            Self::Domain => "domain",
            Self::Webhook => "webhook",
            Self::Review => "review",
        }
    }

    pub fn keywords(&self) -> &'static [&'static str] {
        match self {
            Self::Credentials => &["credential", "api key", "api_key", "apikey", "oauth", "token"],
            Self::Database => &["database", "postgres", "mysql", "sqlite", "migration", "schema"],
            Self::Secrets => &["secret", "password", "private key", "encryption key"],
            Self::Deployment => &["deploy", "container", "docker", "kubernetes", "hosting"],
            Self::Domain => &["domain", "dns", "certificate", "tls", "ssl"],
            Self::Webhook => &["webhook", "integration", "callback url", "third-party"],
            Self::Review => &[],
        }
    }

    pub fn default_title(&self) -> &'static str {
        match self {
            Self::Credentials => "Provide API credentials",
            Self::Database => "Provision and connect a database",
            Self::Secrets => "Configure application secrets",
            Self::Deployment => "Configure deployment target",
            Self::Domain => "Configure domain and DNS",
            Self::Webhook => "Register webhook and integration endpoints",
            Self::Review => "Review generated setup requirements",
        }
    }
}

impl std::fmt::Display for SetupCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SetupCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "credentials" => Ok(Self::Credentials),
            "database" => Ok(Self::Database),
            "secrets" => Ok(Self::Secrets),
            "deployment" => Ok(Self::Deployment),
            "domain" => Ok(Self::Domain),
            "webhook" => Ok(Self::Webhook),
            "review" => Ok(Self::Review),
            _ => Err(format!("Invalid setup category: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SetupTaskStatus {
    Pending,
    InProgress,
    Completed,
    Skipped,
    Blocked,
}

impl SetupTaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Skipped => "skipped",
            Self::Blocked => "blocked",
        }
    }

    /// Completed or skipped tasks no longer gate a factory.
    pub fn is_resolved(&self) -> bool {
        matches!(self, Self::Completed | Self::Skipped)
    }
}

impl std::fmt::Display for SetupTaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SetupTaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "in_progress" => Ok(Self::InProgress),
            "completed" => Ok(Self::Completed),
            "skipped" => Ok(Self::Skipped),
            "blocked" => Ok(Self::Blocked),
            _ => Err(format!("Invalid setup task status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetupTask {
    pub id: i64,
    pub factory_id: i64,
    pub category: SetupCategory,
    pub title: String,
    pub status: SetupTaskStatus,
    pub required: bool,
    pub created_at: String,
    pub updated_at: String,
}

// ── Attempts & escalations ───────────────────────────────────────────

/// Row shape for attempt listings; iterations are omitted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptSummary {
    pub id: Uuid,
    pub factory_id: i64,
    pub feature_request_id: Uuid,
    pub description: String,
    pub outcome: Outcome,
    pub state: Option<BuildState>,
    pub iteration_count: u32,
    pub max_iterations: u32,
    pub final_snapshot_id: Option<SnapshotId>,
    pub error: Option<String>,
    pub started_at: String,
    pub ended_at: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AttemptDetail {
    pub feature_request: FeatureRequest,
    pub state: Option<BuildState>,
    pub attempt: BuildAttempt,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscalationRecord {
    pub id: i64,
    pub attempt_id: Uuid,
    pub factory_id: i64,
    pub feature_request_id: Uuid,
    pub iteration_count: u32,
    pub final_diagnostics: Vec<Diagnostic>,
    pub snapshot_id: Option<SnapshotId>,
    pub artifact_path: String,
    pub created_at: String,
}
