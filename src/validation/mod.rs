//! Static checks and test runs against workspace snapshots.

pub mod parser;
mod runner;

pub use runner::{CommandRun, CommandValidator};
