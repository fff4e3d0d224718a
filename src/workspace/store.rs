use std::collections::{BTreeMap, HashSet};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex};

use anvil_common::{CodeDiff, FileEdit, SnapshotId, WorkspaceSnapshot, blob_hash};
use fs2::FileExt;
use tempfile::NamedTempFile;
use walkdir::WalkDir;

use crate::errors::WorkspaceError;

type Result<T> = std::result::Result<T, WorkspaceError>;

const TREE_DIR: &str = "tree";
const OBJECTS_DIR: &str = "objects";
const SNAPSHOTS_DIR: &str = "snapshots";
const HEAD_FILE: &str = "HEAD";
const LOCK_FILE: &str = ".lock";

/// Per-factory isolated file trees with content-addressed snapshots.
///
/// On-disk layout under `root/<factory_id>/`:
///
/// ```text
/// tree/                 live working tree the validators check out from
/// objects/<sha256>      file blobs
/// snapshots/<id>.json   snapshot manifests
/// HEAD                  id of the latest snapshot
/// .lock                 advisory lock held while a handle is live
/// ```
#[derive(Clone)]
pub struct WorkspaceStore {
    inner: Arc<StoreInner>,
}

struct StoreInner {
    root: PathBuf,
    leases: Mutex<HashSet<i64>>,
}

/// Exclusive access to one factory's workspace. Dropping the handle
/// releases the lease and the lock file.
pub struct WorkspaceHandle {
    factory_id: i64,
    store: WorkspaceStore,
    lock: File,
}

impl std::fmt::Debug for WorkspaceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkspaceHandle")
            .field("factory_id", &self.factory_id)
            .finish()
    }
}

impl WorkspaceHandle {
    pub fn factory_id(&self) -> i64 {
        self.factory_id
    }

    pub fn tree_path(&self) -> PathBuf {
        self.store.tree_dir(self.factory_id)
    }
}

impl Drop for WorkspaceHandle {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.lock) {
            tracing::warn!(factory_id = self.factory_id, error = %e, "failed to unlock workspace");
        }
        if let Ok(mut leases) = self.store.inner.leases.lock() {
            leases.remove(&self.factory_id);
        }
        tracing::debug!(factory_id = self.factory_id, "workspace released");
    }
}

impl WorkspaceStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|e| WorkspaceError::io(&root, e))?;
        Ok(Self {
            inner: Arc::new(StoreInner {
                root,
                leases: Mutex::new(HashSet::new()),
            }),
        })
    }

    pub fn root(&self) -> &Path {
        &self.inner.root
    }

    fn factory_dir(&self, factory_id: i64) -> PathBuf {
        self.inner.root.join(factory_id.to_string())
    }

    fn tree_dir(&self, factory_id: i64) -> PathBuf {
        self.factory_dir(factory_id).join(TREE_DIR)
    }

    fn object_path(&self, factory_id: i64, blob: &str) -> PathBuf {
        self.factory_dir(factory_id).join(OBJECTS_DIR).join(blob)
    }

    fn manifest_path(&self, factory_id: i64, id: &SnapshotId) -> PathBuf {
        self.factory_dir(factory_id)
            .join(SNAPSHOTS_DIR)
            .join(format!("{}.json", id))
    }

    /// Lease the workspace for a factory, creating it on first use.
    ///
    /// Fails with `AlreadyExists` when another handle is live, in this
    /// process or in another one sharing the same root.
    pub fn create(&self, factory_id: i64) -> Result<WorkspaceHandle> {
        {
            let mut leases = self
                .inner
                .leases
                .lock()
                .map_err(|e| WorkspaceError::LeaseTableUnavailable(e.to_string()))?;
            if !leases.insert(factory_id) {
                return Err(WorkspaceError::AlreadyExists { factory_id });
            }
        }

        match self.open_locked(factory_id) {
            Ok(lock) => {
                let handle = WorkspaceHandle {
                    factory_id,
                    store: self.clone(),
                    lock,
                };
                if self.read_head(factory_id)?.is_none() {
                    let initial = self.snapshot(&handle)?;
                    tracing::info!(factory_id, snapshot = initial.id().short(), "workspace initialized");
                }
                Ok(handle)
            }
            Err(e) => {
                if let Ok(mut leases) = self.inner.leases.lock() {
                    leases.remove(&factory_id);
                }
                Err(e)
            }
        }
    }

    fn open_locked(&self, factory_id: i64) -> Result<File> {
        let dir = self.factory_dir(factory_id);
        for sub in [TREE_DIR, OBJECTS_DIR, SNAPSHOTS_DIR] {
            let path = dir.join(sub);
            fs::create_dir_all(&path).map_err(|e| WorkspaceError::io(&path, e))?;
        }
        let lock_path = dir.join(LOCK_FILE);
        let lock = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)
            .map_err(|e| WorkspaceError::io(&lock_path, e))?;
        lock.try_lock_exclusive()
            .map_err(|_| WorkspaceError::AlreadyExists { factory_id })?;
        Ok(lock)
    }

    /// Release a handle explicitly. Equivalent to dropping it.
    pub fn release(&self, handle: WorkspaceHandle) {
        drop(handle);
    }

    /// Capture the live tree as a snapshot and make it the latest.
    ///
    /// Ids are derived from content alone, so a tree matching any stored
    /// snapshot returns that snapshot unchanged and only moves HEAD.
    /// Manifests are never rewritten.
    pub fn snapshot(&self, handle: &WorkspaceHandle) -> Result<WorkspaceSnapshot> {
        let factory_id = handle.factory_id;
        let head = self.read_head(factory_id)?;
        let files = self.scan_tree(factory_id)?;

        let id = WorkspaceSnapshot::compute_id(&files);
        if head.as_ref() == Some(&id) {
            return self.load_snapshot(factory_id, &id);
        }
        // Content seen before: reuse the stored manifest as-is.
        if self.manifest_path(factory_id, &id).exists() {
            let existing = self.load_snapshot(factory_id, &id)?;
            self.write_head(factory_id, &id)?;
            return Ok(existing);
        }

        let snapshot = WorkspaceSnapshot::new(factory_id, head, files);
        self.write_manifest(&snapshot)?;
        self.write_head(factory_id, snapshot.id())?;
        Ok(snapshot)
    }

    /// The most recent snapshot for the handle's factory.
    pub fn latest(&self, handle: &WorkspaceHandle) -> Result<WorkspaceSnapshot> {
        match self.read_head(handle.factory_id)? {
            Some(id) => self.load_snapshot(handle.factory_id, &id),
            None => self.snapshot(handle),
        }
    }

    /// Apply a diff on top of the latest snapshot and capture the result.
    ///
    /// Every path is checked before anything is written. If a write fails
    /// part way, the live tree is restored to the prior snapshot and the
    /// latest snapshot is left unchanged.
    pub fn apply(&self, handle: &WorkspaceHandle, diff: &CodeDiff) -> Result<WorkspaceSnapshot> {
        for edit in &diff.edits {
            validate_relative_path(edit.path())?;
        }

        let base = self.latest(handle)?;
        let tree = self.tree_dir(handle.factory_id);

        if let Err(e) = write_edits(&tree, &diff.edits) {
            tracing::warn!(
                factory_id = handle.factory_id,
                base = base.id().short(),
                error = %e,
                "diff application failed, rolling back"
            );
            self.restore(handle, &base)?;
            return Err(e);
        }

        self.snapshot(handle)
    }

    /// Make the live tree match `snapshot` exactly and mark it latest.
    pub fn restore(&self, handle: &WorkspaceHandle, snapshot: &WorkspaceSnapshot) -> Result<()> {
        if snapshot.factory_id() != handle.factory_id {
            return Err(WorkspaceError::ForeignSnapshot {
                factory_id: handle.factory_id,
                snapshot_factory: snapshot.factory_id(),
            });
        }
        if !snapshot.verify() {
            return Err(WorkspaceError::CorruptSnapshot {
                id: snapshot.id().to_string(),
                reason: "id does not match manifest".to_string(),
            });
        }

        let tree = self.tree_dir(handle.factory_id);
        let current = self.scan_tree(handle.factory_id)?;

        for path in current.keys() {
            if !snapshot.files().contains_key(path) {
                let full = tree.join(path);
                fs::remove_file(&full).map_err(|e| WorkspaceError::io(&full, e))?;
            }
        }
        for (path, blob) in snapshot.files() {
            if current.get(path) == Some(blob) {
                continue;
            }
            let bytes = self.read_blob(handle.factory_id, snapshot.id(), blob)?;
            let full = tree.join(path);
            if let Some(parent) = full.parent() {
                fs::create_dir_all(parent).map_err(|e| WorkspaceError::io(parent, e))?;
            }
            fs::write(&full, bytes).map_err(|e| WorkspaceError::io(&full, e))?;
        }
        prune_empty_dirs(&tree);

        self.write_head(handle.factory_id, snapshot.id())?;
        tracing::info!(
            factory_id = handle.factory_id,
            snapshot = snapshot.id().short(),
            "workspace restored"
        );
        Ok(())
    }

    /// Load a stored snapshot. Does not require a lease.
    pub fn load_snapshot(&self, factory_id: i64, id: &SnapshotId) -> Result<WorkspaceSnapshot> {
        let path = self.manifest_path(factory_id, id);
        let content = fs::read_to_string(&path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => WorkspaceError::SnapshotNotFound {
                factory_id,
                id: id.to_string(),
            },
            _ => WorkspaceError::io(&path, e),
        })?;
        let snapshot: WorkspaceSnapshot =
            serde_json::from_str(&content).map_err(|e| WorkspaceError::CorruptSnapshot {
                id: id.to_string(),
                reason: e.to_string(),
            })?;
        if snapshot.id() != id || !snapshot.verify() {
            return Err(WorkspaceError::CorruptSnapshot {
                id: id.to_string(),
                reason: "id does not match manifest".to_string(),
            });
        }
        if snapshot.factory_id() != factory_id {
            return Err(WorkspaceError::ForeignSnapshot {
                factory_id,
                snapshot_factory: snapshot.factory_id(),
            });
        }
        Ok(snapshot)
    }

    /// Materialize a snapshot into `dir`, which should be empty. The live
    /// tree is not touched.
    pub fn checkout(&self, snapshot: &WorkspaceSnapshot, dir: &Path) -> Result<()> {
        for (path, blob) in snapshot.files() {
            let bytes = self.read_blob(snapshot.factory_id(), snapshot.id(), blob)?;
            let full = dir.join(path);
            if let Some(parent) = full.parent() {
                fs::create_dir_all(parent).map_err(|e| WorkspaceError::io(parent, e))?;
            }
            fs::write(&full, bytes).map_err(|e| WorkspaceError::io(&full, e))?;
        }
        Ok(())
    }

    /// Contents of one file in a snapshot.
    pub fn read_file(&self, snapshot: &WorkspaceSnapshot, path: &str) -> Result<Option<Vec<u8>>> {
        match snapshot.blob_for(path) {
            Some(blob) => self
                .read_blob(snapshot.factory_id(), snapshot.id(), blob)
                .map(Some),
            None => Ok(None),
        }
    }

    fn read_blob(&self, factory_id: i64, snapshot: &SnapshotId, blob: &str) -> Result<Vec<u8>> {
        let path = self.object_path(factory_id, blob);
        let bytes = fs::read(&path).map_err(|e| WorkspaceError::CorruptSnapshot {
            id: snapshot.to_string(),
            reason: format!("missing blob {}: {}", blob, e),
        })?;
        if blob_hash(&bytes) != blob {
            return Err(WorkspaceError::CorruptSnapshot {
                id: snapshot.to_string(),
                reason: format!("blob {} failed its hash check", blob),
            });
        }
        Ok(bytes)
    }

    /// Hash every file in the live tree, storing new blobs on the way.
    fn scan_tree(&self, factory_id: i64) -> Result<BTreeMap<String, String>> {
        let tree = self.tree_dir(factory_id);
        let mut files = BTreeMap::new();
        for entry in WalkDir::new(&tree).min_depth(1).sort_by_file_name() {
            let entry = entry.map_err(|e| {
                let path = e.path().map(Path::to_path_buf).unwrap_or_else(|| tree.clone());
                WorkspaceError::io(path, std::io::Error::other(e.to_string()))
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            let rel = entry
                .path()
                .strip_prefix(&tree)
                .map_err(|e| WorkspaceError::InvalidPath {
                    path: entry.path().display().to_string(),
                    reason: e.to_string(),
                })?;
            let rel = rel
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            let bytes = fs::read(entry.path()).map_err(|e| WorkspaceError::io(entry.path(), e))?;
            let blob = blob_hash(&bytes);
            self.store_blob(factory_id, &blob, &bytes)?;
            files.insert(rel, blob);
        }
        Ok(files)
    }

    fn store_blob(&self, factory_id: i64, blob: &str, bytes: &[u8]) -> Result<()> {
        let path = self.object_path(factory_id, blob);
        if path.exists() {
            return Ok(());
        }
        write_atomic(&path, bytes)
    }

    fn write_manifest(&self, snapshot: &WorkspaceSnapshot) -> Result<()> {
        let path = self.manifest_path(snapshot.factory_id(), snapshot.id());
        let json = serde_json::to_vec_pretty(snapshot).map_err(|e| {
            WorkspaceError::CorruptSnapshot {
                id: snapshot.id().to_string(),
                reason: e.to_string(),
            }
        })?;
        write_atomic(&path, &json)
    }

    fn read_head(&self, factory_id: i64) -> Result<Option<SnapshotId>> {
        let path = self.factory_dir(factory_id).join(HEAD_FILE);
        match fs::read_to_string(&path) {
            Ok(s) => s
                .trim()
                .parse()
                .map(Some)
                .map_err(|reason| WorkspaceError::CorruptSnapshot {
                    id: s.trim().to_string(),
                    reason,
                }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(WorkspaceError::io(&path, e)),
        }
    }

    fn write_head(&self, factory_id: i64, id: &SnapshotId) -> Result<()> {
        let path = self.factory_dir(factory_id).join(HEAD_FILE);
        write_atomic(&path, id.as_str().as_bytes())
    }
}

/// Reject anything that could escape the workspace tree.
fn validate_relative_path(path: &str) -> Result<()> {
    let invalid = |reason: &str| WorkspaceError::InvalidPath {
        path: path.to_string(),
        reason: reason.to_string(),
    };
    if path.trim().is_empty() {
        return Err(invalid("path is empty"));
    }
    let p = Path::new(path);
    if p.is_absolute() {
        return Err(invalid("path must be relative"));
    }
    for component in p.components() {
        match component {
            Component::Normal(_) | Component::CurDir => {}
            Component::ParentDir => return Err(invalid("path must not contain '..'")),
            Component::RootDir | Component::Prefix(_) => {
                return Err(invalid("path must be relative"));
            }
        }
    }
    Ok(())
}

fn write_edits(tree: &Path, edits: &[FileEdit]) -> Result<()> {
    for edit in edits {
        let full = tree.join(edit.path());
        let apply_failed = |source| WorkspaceError::ApplyFailed {
            path: edit.path().to_string(),
            source,
        };
        match edit {
            FileEdit::Write { content, .. } => {
                if let Some(parent) = full.parent() {
                    fs::create_dir_all(parent).map_err(apply_failed)?;
                }
                fs::write(&full, content).map_err(apply_failed)?;
            }
            FileEdit::Delete { .. } => match fs::remove_file(&full) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(apply_failed(e)),
            },
        }
    }
    prune_empty_dirs(tree);
    Ok(())
}

fn prune_empty_dirs(tree: &Path) {
    for entry in WalkDir::new(tree)
        .min_depth(1)
        .contents_first(true)
        .into_iter()
        .filter_map(|e| e.ok())
    {
        if entry.file_type().is_dir() {
            // Fails harmlessly on non-empty directories.
            let _ = fs::remove_dir(entry.path());
        }
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = NamedTempFile::new_in(dir).map_err(|e| WorkspaceError::io(dir, e))?;
    tmp.write_all(bytes)
        .map_err(|e| WorkspaceError::io(path, e))?;
    tmp.persist(path)
        .map_err(|e| WorkspaceError::io(path, e.error))?;
    Ok(())
}
