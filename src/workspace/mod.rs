//! Per-factory workspaces: leased file trees with content-addressed
//! snapshots, atomic diff application and rollback.

mod roots;
mod store;

pub use roots::WorkspaceRoots;
pub use store::{WorkspaceHandle, WorkspaceStore};
