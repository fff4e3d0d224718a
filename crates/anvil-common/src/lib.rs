//! Shared domain types for the Anvil build factory.
//!
//! Everything the repair loop passes between its collaborators lives here:
//! feature requests, plans, diffs, snapshots, validation/test results and the
//! build attempt record itself. The three collaborator traits (`Planner`,
//! `Synthesizer`, `Validator`) are the only seams the controller depends on.

pub mod attempt;
pub mod collaborator;
pub mod diff;
pub mod model;
pub mod snapshot;

pub use attempt::{AttemptError, BuildAttempt, BuildIteration, BuildState, Outcome};
pub use collaborator::{
    CollaboratorError, Planner, SynthesisOutput, SynthesisRequest, Synthesizer, Validator,
};
pub use diff::{CodeDiff, FileEdit};
pub use model::{
    Diagnostic, FailingCase, FeatureRequest, ImplementationPlan, PlanStep, TestResult,
    ValidationResult,
};
pub use snapshot::{SnapshotId, WorkspaceSnapshot, blob_hash};
