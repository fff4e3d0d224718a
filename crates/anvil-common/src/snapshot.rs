use std::collections::BTreeMap;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Hex-encoded SHA-256 of a snapshot manifest.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SnapshotId(String);

impl SnapshotId {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 12 hex chars, for log lines.
    pub fn short(&self) -> &str {
        &self.0[..12.min(self.0.len())]
    }
}

impl std::fmt::Display for SnapshotId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for SnapshotId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() == 64 && s.chars().all(|c| c.is_ascii_hexdigit()) {
            Ok(Self(s.to_ascii_lowercase()))
        } else {
            Err(format!("Invalid snapshot id: {}", s))
        }
    }
}

/// Hex SHA-256 of file contents.
pub fn blob_hash(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Immutable, content-addressed capture of a workspace.
///
/// The id is derived only from the `(path, blob)` manifest, so two captures
/// of identical trees share an id regardless of when they were taken or
/// which snapshot they descend from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkspaceSnapshot {
    id: SnapshotId,
    factory_id: i64,
    parent: Option<SnapshotId>,
    files: BTreeMap<String, String>,
    created_at: DateTime<Utc>,
}

impl WorkspaceSnapshot {
    pub fn new(
        factory_id: i64,
        parent: Option<SnapshotId>,
        files: BTreeMap<String, String>,
    ) -> Self {
        Self {
            id: Self::compute_id(&files),
            factory_id,
            parent,
            files,
            created_at: Utc::now(),
        }
    }

    pub fn compute_id(files: &BTreeMap<String, String>) -> SnapshotId {
        let mut hasher = Sha256::new();
        for (path, blob) in files {
            hasher.update(path.as_bytes());
            hasher.update([0u8]);
            hasher.update(blob.as_bytes());
            hasher.update([b'\n']);
        }
        SnapshotId(hex::encode(hasher.finalize()))
    }

    pub fn id(&self) -> &SnapshotId {
        &self.id
    }

    pub fn factory_id(&self) -> i64 {
        self.factory_id
    }

    pub fn parent(&self) -> Option<&SnapshotId> {
        self.parent.as_ref()
    }

    /// Relative path -> blob hash.
    pub fn files(&self) -> &BTreeMap<String, String> {
        &self.files
    }

    pub fn blob_for(&self, path: &str) -> Option<&str> {
        self.files.get(path).map(String::as_str)
    }

    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// True when the stored id matches the manifest. Used after loading a
    /// snapshot from disk.
    pub fn verify(&self) -> bool {
        Self::compute_id(&self.files) == self.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manifest(entries: &[(&str, &str)]) -> BTreeMap<String, String> {
        entries
            .iter()
            .map(|(p, c)| (p.to_string(), blob_hash(c.as_bytes())))
            .collect()
    }

    #[test]
    fn test_identical_trees_share_an_id() {
        let a = WorkspaceSnapshot::new(1, None, manifest(&[("a.rs", "x"), ("b.rs", "y")]));
        let b = WorkspaceSnapshot::new(
            1,
            Some(a.id().clone()),
            manifest(&[("b.rs", "y"), ("a.rs", "x")]),
        );
        assert_eq!(a.id(), b.id());
    }

    #[test]
    fn test_content_change_changes_id() {
        let a = WorkspaceSnapshot::new(1, None, manifest(&[("a.rs", "x")]));
        let b = WorkspaceSnapshot::new(1, None, manifest(&[("a.rs", "z")]));
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_snapshot_id_parse() {
        let snap = WorkspaceSnapshot::new(1, None, BTreeMap::new());
        let parsed: SnapshotId = snap.id().as_str().parse().unwrap();
        assert_eq!(&parsed, snap.id());
        assert!("xyz".parse::<SnapshotId>().is_err());
        assert_eq!(snap.id().short().len(), 12);
    }

    #[test]
    fn test_verify_detects_tampering() {
        let snap = WorkspaceSnapshot::new(1, None, manifest(&[("a.rs", "x")]));
        assert!(snap.verify());
        let mut json = serde_json::to_value(&snap).unwrap();
        json["files"]["a.rs"] = serde_json::Value::String(blob_hash(b"other"));
        let tampered: WorkspaceSnapshot = serde_json::from_value(json).unwrap();
        assert!(!tampered.verify());
    }
}
