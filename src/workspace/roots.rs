use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use super::WorkspaceStore;
use crate::errors::WorkspaceError;

/// Workspace stores keyed by root directory.
///
/// A factory keeps the `workspace_root` it was created with, so one server
/// may serve factories living under different roots. Each root is opened
/// once and shared, keeping its lease table process-wide.
#[derive(Clone)]
pub struct WorkspaceRoots {
    default: WorkspaceStore,
    opened: Arc<Mutex<HashMap<PathBuf, WorkspaceStore>>>,
}

impl WorkspaceRoots {
    pub fn new(default: WorkspaceStore) -> Self {
        Self {
            default,
            opened: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// The server's own root.
    pub fn default_store(&self) -> &WorkspaceStore {
        &self.default
    }

    /// The store rooted at `root`, opening it on first use.
    pub fn open(&self, root: &Path) -> Result<WorkspaceStore, WorkspaceError> {
        if root == self.default.root() {
            return Ok(self.default.clone());
        }
        // Entries are only inserted once fully opened.
        let mut opened = self.opened.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(store) = opened.get(root) {
            return Ok(store.clone());
        }
        let store = WorkspaceStore::new(root)?;
        tracing::info!(root = %root.display(), "opened workspace root");
        opened.insert(root.to_path_buf(), store.clone());
        Ok(store)
    }
}
