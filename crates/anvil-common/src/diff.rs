use serde::{Deserialize, Serialize};

/// A single file operation inside a code diff. Paths are relative to the
/// workspace root.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum FileEdit {
    Write { path: String, content: String },
    Delete { path: String },
}

impl FileEdit {
    pub fn path(&self) -> &str {
        match self {
            Self::Write { path, .. } | Self::Delete { path } => path,
        }
    }
}

/// Whole-file edits returned by the synthesizer for one iteration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CodeDiff {
    #[serde(default)]
    pub edits: Vec<FileEdit>,
}

impl CodeDiff {
    pub fn new(edits: Vec<FileEdit>) -> Self {
        Self { edits }
    }

    pub fn write(mut self, path: &str, content: &str) -> Self {
        self.edits.push(FileEdit::Write {
            path: path.to_string(),
            content: content.to_string(),
        });
        self
    }

    pub fn delete(mut self, path: &str) -> Self {
        self.edits.push(FileEdit::Delete {
            path: path.to_string(),
        });
        self
    }

    pub fn is_empty(&self) -> bool {
        self.edits.is_empty()
    }

    pub fn touched_paths(&self) -> Vec<&str> {
        self.edits.iter().map(FileEdit::path).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_edit_serde_uses_op_tag() {
        let edit = FileEdit::Delete {
            path: "old.rs".into(),
        };
        let json = serde_json::to_value(&edit).unwrap();
        assert_eq!(json["op"], "delete");
        assert_eq!(json["path"], "old.rs");

        let parsed: FileEdit =
            serde_json::from_str(r#"{"op": "write", "path": "a.rs", "content": "fn a() {}"}"#)
                .unwrap();
        assert_eq!(parsed.path(), "a.rs");
    }

    #[test]
    fn test_builder_keeps_edit_order() {
        let diff = CodeDiff::default().write("a.rs", "a").delete("b.rs");
        assert_eq!(diff.touched_paths(), vec!["a.rs", "b.rs"]);
        assert!(!diff.is_empty());
    }
}
