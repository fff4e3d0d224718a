//! The repair loop controller and the events it emits.
//!
//! ```text
//! PLANNING -> SYNTHESIZING -> VALIDATING -> TESTING -> SUCCESS
//!     ^            ^  |            |           |
//!     |            |  | replan     v           v
//!     +------------+--+         RETRY <--------+
//!                  |             |
//!                  +-------------+---> ESCALATED (budget spent)
//! ```
//!
//! `FATAL` ends an attempt whose plan could not be obtained or whose diff
//! could not be applied; `CANCELLED` ends one stopped between iterations.

mod controller;
pub mod events;

pub use controller::{RepairController, RunOutcome};
pub use events::{BuildEvent, BuildObserver, NoopObserver, RecordingObserver};
