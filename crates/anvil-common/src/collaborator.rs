//! The three collaborator seams of the repair loop.
//!
//! The controller only ever sees these traits; concrete HTTP clients,
//! command runners and test doubles implement them.

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

use crate::diff::CodeDiff;
use crate::model::{Diagnostic, FeatureRequest, ImplementationPlan, TestResult, ValidationResult};
use crate::snapshot::WorkspaceSnapshot;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum CollaboratorError {
    /// Network or process failure that may succeed on retry.
    #[error("Transient collaborator failure: {0}")]
    Transient(String),

    /// The collaborator answered, but not with something we can use.
    #[error("Malformed collaborator response: {0}")]
    Malformed(String),

    /// The collaborator refused the request outright.
    #[error("Collaborator rejected request: {0}")]
    Rejected(String),
}

impl CollaboratorError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Input for one synthesis call. On iteration 1 `diagnostics` is empty.
#[derive(Debug, Clone, Serialize)]
pub struct SynthesisRequest<'a> {
    pub feature: &'a FeatureRequest,
    pub plan: &'a ImplementationPlan,
    pub iteration: u32,
    pub diagnostics: &'a [Diagnostic],
}

#[derive(Debug, Clone, PartialEq)]
pub enum SynthesisOutput {
    Diff(CodeDiff),
    /// The synthesizer cannot make progress with the current plan.
    Replan { reason: String },
}

#[async_trait]
pub trait Planner: Send + Sync {
    async fn plan(&self, request: &FeatureRequest) -> Result<ImplementationPlan, CollaboratorError>;
}

#[async_trait]
pub trait Synthesizer: Send + Sync {
    async fn synthesize(
        &self,
        request: SynthesisRequest<'_>,
    ) -> Result<SynthesisOutput, CollaboratorError>;
}

/// Static checks and tests against a snapshot. Implementations report
/// timeouts and runner failures as failing results, never as errors, and
/// must not modify the snapshot.
#[async_trait]
pub trait Validator: Send + Sync {
    async fn validate_static(&self, snapshot: &WorkspaceSnapshot) -> ValidationResult;

    async fn run_tests(&self, snapshot: &WorkspaceSnapshot) -> TestResult;
}
