use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// A recording row as stored in the record store.
///
/// `relative_path` is relative to the documents root; the absolute
/// location is resolved at read time so stored rows survive the app
/// directory moving.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Recording {
    pub id: i64,
    pub name: String,
    pub relative_path: String,
    /// Seconds since epoch, float precision.
    pub created_at: f64,
    pub content: String,
}

impl Recording {
    /// Resolve the backing audio file against the documents root.
    pub fn resolve(&self, root: &Path) -> PathBuf {
        root.join(&self.relative_path)
    }

    /// Whether the backing audio file currently exists under `root`.
    pub fn file_exists(&self, root: &Path) -> bool {
        self.resolve(root).exists()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Recording {
        Recording {
            id: 1,
            name: "take1".to_string(),
            relative_path: "recordings/a.wav".to_string(),
            created_at: 100.0,
            content: String::new(),
        }
    }

    #[test]
    fn test_resolve_joins_root() {
        let resolved = sample().resolve(Path::new("/data/airec"));
        assert_eq!(resolved, PathBuf::from("/data/airec/recordings/a.wav"));
    }

    #[test]
    fn test_file_exists_tracks_backing_file() {
        let dir = tempfile::tempdir().unwrap();
        let rec = sample();

        assert!(!rec.file_exists(dir.path()));

        let path = rec.resolve(dir.path());
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, b"RIFF").unwrap();

        assert!(rec.file_exists(dir.path()));
    }
}
