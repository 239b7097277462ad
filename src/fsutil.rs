//! Small filesystem helpers shared by the state-owning modules.

use std::io::Write;
use std::path::{Path, PathBuf};

/// Temp sibling of `path`: `.<name>.tmp-<uuid>` in the same directory, so the
/// final rename never crosses a filesystem boundary.
#[must_use]
pub fn temp_sibling(path: &Path) -> PathBuf {
    let tmp_name = format!(
        ".{}.tmp-{}",
        path.file_name().and_then(|n| n.to_str()).unwrap_or("state"),
        uuid::Uuid::new_v4().simple()
    );
    path.parent()
        .map(|p| p.join(&tmp_name))
        .unwrap_or_else(|| PathBuf::from(&tmp_name))
}

/// Write `content` via temp file, fsync and rename (creates the parent).
pub fn write_atomic(path: &Path, content: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp_path = temp_sibling(path);
    let result = (|| {
        let mut file = std::fs::File::create(&tmp_path)?;
        file.write_all(content)?;
        file.sync_all()?;
        std::fs::rename(&tmp_path, path)
    })();
    if result.is_err() {
        let _ = std::fs::remove_file(&tmp_path);
    }
    result
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;

    #[test]
    fn write_atomic_creates_parent_and_replaces() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/state.json");
        write_atomic(&path, b"one").unwrap();
        write_atomic(&path, b"two").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "two");

        let leftovers: Vec<_> = std::fs::read_dir(path.parent().unwrap())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains(".tmp-"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn temp_sibling_stays_in_directory() {
        let tmp = temp_sibling(Path::new("/a/b/active"));
        assert_eq!(tmp.parent(), Some(Path::new("/a/b")));
        assert!(tmp.file_name().unwrap().to_string_lossy().starts_with(".active.tmp-"));
    }
}
