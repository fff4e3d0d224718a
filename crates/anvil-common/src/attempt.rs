use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::diff::CodeDiff;
use crate::model::{Diagnostic, FeatureRequest, ImplementationPlan, TestResult, ValidationResult};
use crate::snapshot::SnapshotId;

/// States of the repair loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildState {
    Planning,
    Synthesizing,
    Validating,
    Testing,
    Retry,
    Success,
    Escalated,
    Fatal,
    Cancelled,
}

impl BuildState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Planning => "planning",
            Self::Synthesizing => "synthesizing",
            Self::Validating => "validating",
            Self::Testing => "testing",
            Self::Retry => "retry",
            Self::Success => "success",
            Self::Escalated => "escalated",
            Self::Fatal => "fatal",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Success | Self::Escalated | Self::Fatal | Self::Cancelled
        )
    }
}

impl std::fmt::Display for BuildState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BuildState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "planning" => Ok(Self::Planning),
            "synthesizing" => Ok(Self::Synthesizing),
            "validating" => Ok(Self::Validating),
            "testing" => Ok(Self::Testing),
            "retry" => Ok(Self::Retry),
            "success" => Ok(Self::Success),
            "escalated" => Ok(Self::Escalated),
            "fatal" => Ok(Self::Fatal),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("Invalid build state: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Pending,
    Success,
    Escalated,
    Fatal,
    Cancelled,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Success => "success",
            Self::Escalated => "escalated",
            Self::Fatal => "fatal",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Outcome {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "success" => Ok(Self::Success),
            "escalated" => Ok(Self::Escalated),
            "fatal" => Ok(Self::Fatal),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("Invalid outcome: {}", s)),
        }
    }
}

/// One synthesize -> validate -> test pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildIteration {
    pub iteration_index: u32,
    pub code_diff: Option<CodeDiff>,
    pub snapshot_id: Option<SnapshotId>,
    pub validation_result: Option<ValidationResult>,
    pub test_result: Option<TestResult>,
    /// Findings raised by the loop itself (synthesis failure, re-plan request).
    #[serde(default)]
    pub diagnostics: Vec<Diagnostic>,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
}

impl BuildIteration {
    pub fn begin(iteration_index: u32) -> Self {
        let now = Utc::now();
        Self {
            iteration_index,
            code_diff: None,
            snapshot_id: None,
            validation_result: None,
            test_result: None,
            diagnostics: Vec::new(),
            started_at: now,
            ended_at: now,
        }
    }

    pub fn passed(&self) -> bool {
        self.validation_result.as_ref().is_some_and(|v| v.passed)
            && self.test_result.as_ref().is_some_and(|t| t.passed)
    }

    /// Diagnostics handed to the next synthesis call: loop findings, then
    /// static-check findings, then failing tests. Order is preserved and
    /// nothing is deduplicated.
    pub fn feedback(&self) -> Vec<Diagnostic> {
        let mut out = self.diagnostics.clone();
        if let Some(v) = &self.validation_result {
            out.extend(v.diagnostics.iter().cloned());
        }
        if let Some(t) = &self.test_result {
            out.extend(t.diagnostics());
        }
        out
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum AttemptError {
    #[error("Iteration {got} out of order (expected {expected})")]
    OutOfOrder { expected: u32, got: u32 },

    #[error("Iteration {index} exceeds budget of {max}")]
    BudgetExceeded { index: u32, max: u32 },

    #[error("Attempt already finished with outcome {0}")]
    AlreadyFinished(Outcome),
}

/// Full lifecycle record of one feature request through the repair loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildAttempt {
    pub id: Uuid,
    pub factory_id: i64,
    pub feature_request_id: Uuid,
    pub plan: Option<ImplementationPlan>,
    iterations: Vec<BuildIteration>,
    pub outcome: Outcome,
    pub max_iterations: u32,
    /// Every state the controller entered, in order.
    pub states: Vec<BuildState>,
    pub final_snapshot_id: Option<SnapshotId>,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl BuildAttempt {
    pub fn new(request: &FeatureRequest, max_iterations: u32) -> Self {
        Self::with_id(Uuid::new_v4(), request, max_iterations)
    }

    pub fn with_id(id: Uuid, request: &FeatureRequest, max_iterations: u32) -> Self {
        Self {
            id,
            factory_id: request.factory_id,
            feature_request_id: request.id,
            plan: None,
            iterations: Vec::new(),
            outcome: Outcome::Pending,
            max_iterations,
            states: Vec::new(),
            final_snapshot_id: None,
            error: None,
            started_at: Utc::now(),
            ended_at: None,
        }
    }

    /// Rebuild an attempt from persisted parts, re-checking iteration order.
    #[allow(clippy::too_many_arguments)]
    pub fn from_parts(
        id: Uuid,
        factory_id: i64,
        feature_request_id: Uuid,
        plan: Option<ImplementationPlan>,
        iterations: Vec<BuildIteration>,
        outcome: Outcome,
        max_iterations: u32,
        states: Vec<BuildState>,
        final_snapshot_id: Option<SnapshotId>,
        error: Option<String>,
        started_at: DateTime<Utc>,
        ended_at: Option<DateTime<Utc>>,
    ) -> Result<Self, AttemptError> {
        let mut attempt = Self {
            id,
            factory_id,
            feature_request_id,
            plan,
            iterations: Vec::with_capacity(iterations.len()),
            outcome: Outcome::Pending,
            max_iterations,
            states,
            final_snapshot_id,
            error,
            started_at,
            ended_at,
        };
        for it in iterations {
            attempt.push_iteration(it)?;
        }
        attempt.outcome = outcome;
        Ok(attempt)
    }

    pub fn iterations(&self) -> &[BuildIteration] {
        &self.iterations
    }

    pub fn last_iteration(&self) -> Option<&BuildIteration> {
        self.iterations.last()
    }

    pub fn iteration_count(&self) -> u32 {
        self.iterations.len() as u32
    }

    pub fn next_index(&self) -> u32 {
        self.iteration_count() + 1
    }

    /// Whether another iteration fits inside the budget.
    pub fn has_budget(&self) -> bool {
        self.next_index() <= self.max_iterations
    }

    /// Append an iteration. Indices must be contiguous from 1 and stay
    /// within `max_iterations`.
    pub fn push_iteration(&mut self, iteration: BuildIteration) -> Result<(), AttemptError> {
        if self.outcome.is_terminal() {
            return Err(AttemptError::AlreadyFinished(self.outcome));
        }
        let expected = self.next_index();
        if iteration.iteration_index != expected {
            return Err(AttemptError::OutOfOrder {
                expected,
                got: iteration.iteration_index,
            });
        }
        if iteration.iteration_index > self.max_iterations {
            return Err(AttemptError::BudgetExceeded {
                index: iteration.iteration_index,
                max: self.max_iterations,
            });
        }
        self.iterations.push(iteration);
        Ok(())
    }

    /// Diagnostics from the most recent iteration.
    pub fn final_diagnostics(&self) -> Vec<Diagnostic> {
        self.last_iteration()
            .map(BuildIteration::feedback)
            .unwrap_or_default()
    }

    pub fn current_state(&self) -> Option<BuildState> {
        self.states.last().copied()
    }

    pub fn finish(&mut self, outcome: Outcome) {
        self.outcome = outcome;
        self.ended_at = Some(Utc::now());
    }
}
