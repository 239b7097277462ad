//! ZIP payload extraction into a not-yet-active bundle directory.

use super::descriptor::BundleId;
use std::fs::File;
use std::io;
use std::path::{Component, Path, PathBuf};

/// Extraction failures.
#[derive(Debug, thiserror::Error)]
pub enum ExtractError {
    #[error("bundle {0} is the active bundle; refusing to overwrite it")]
    AlreadyActive(String),

    #[error("unsafe archive entry {0:?}")]
    UnsafeEntry(String),

    #[error("invalid archive: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Entry path relative to the bundle root, or `None` for absolute paths and
/// any `..` component.
fn safe_entry_path(name: &str) -> Option<PathBuf> {
    if name.starts_with('/') || name.starts_with('\\') {
        return None;
    }
    let path = Path::new(name);
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    Some(out)
}

/// Extract `archive` into `<bundles_dir>/<id>`.
///
/// The archive is unpacked into a hidden staging directory first and renamed
/// into place only when every entry succeeded. An existing inactive directory
/// for `id` is replaced; the active one never is.
///
/// # Errors
///
/// Returns an [`ExtractError`]; the staging directory is removed on failure.
pub fn extract_bundle(
    archive: &Path,
    bundles_dir: &Path,
    id: &BundleId,
    active: Option<&BundleId>,
) -> Result<PathBuf, ExtractError> {
    if active == Some(id) {
        return Err(ExtractError::AlreadyActive(id.to_string()));
    }

    let staging = bundles_dir.join(format!(".extract-{id}-{}", uuid::Uuid::new_v4().simple()));
    let result = unpack(archive, &staging).and_then(|entries| {
        let target = bundles_dir.join(id.as_str());
        if target.exists() {
            tracing::info!(bundle_id = %id, "replacing inactive bundle directory");
            std::fs::remove_dir_all(&target)?;
        }
        std::fs::rename(&staging, &target)?;
        tracing::info!(bundle_id = %id, entries, target = %target.display(), "bundle extracted");
        Ok(target)
    });

    if result.is_err() {
        let _ = std::fs::remove_dir_all(&staging);
    }
    result
}

fn unpack(archive: &Path, dest: &Path) -> Result<usize, ExtractError> {
    let mut zip = zip::ZipArchive::new(File::open(archive)?)?;
    std::fs::create_dir_all(dest)?;

    for i in 0..zip.len() {
        let mut entry = zip.by_index(i)?;
        let name = entry.name().to_owned();
        let rel = safe_entry_path(&name)
            .filter(|_| entry.enclosed_name().is_some())
            .ok_or_else(|| ExtractError::UnsafeEntry(name.clone()))?;
        if rel.as_os_str().is_empty() {
            continue;
        }
        let out_path = dest.join(&rel);

        if entry.is_dir() {
            std::fs::create_dir_all(&out_path)?;
            continue;
        }
        if let Some(parent) = out_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut out = File::create(&out_path)?;
        io::copy(&mut entry, &mut out)?;

        if let Some(mode) = entry.unix_mode() {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&out_path, std::fs::Permissions::from_mode(mode & 0o777))?;
        }
    }
    Ok(zip.len())
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use std::io::Write;
    use zip::ZipWriter;
    use zip::write::SimpleFileOptions;

    fn make_zip(path: &Path, entries: &[(&str, &[u8])]) {
        let mut zip = ZipWriter::new(File::create(path).unwrap());
        let options = SimpleFileOptions::default();
        for (name, data) in entries {
            zip.start_file(*name, options).unwrap();
            zip.write_all(data).unwrap();
        }
        zip.finish().unwrap();
    }

    fn id(raw: &str) -> BundleId {
        BundleId::parse(raw).unwrap()
    }

    #[test]
    fn safe_paths() {
        assert_eq!(safe_entry_path("a/b.txt"), Some(PathBuf::from("a/b.txt")));
        assert_eq!(safe_entry_path("./a"), Some(PathBuf::from("a")));
        assert_eq!(safe_entry_path("/etc/passwd"), None);
        assert_eq!(safe_entry_path("a/../../x"), None);
    }

    #[test]
    fn extracts_into_named_directory() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("b.zip");
        make_zip(&archive, &[("app/run.sh", b"echo hi"), ("VERSION", b"1.1")]);

        let target = extract_bundle(&archive, dir.path(), &id("robotBundle1.1"), None).unwrap();
        assert_eq!(target, dir.path().join("robotBundle1.1"));
        assert_eq!(std::fs::read_to_string(target.join("VERSION")).unwrap(), "1.1");
        assert!(target.join("app/run.sh").exists());

        let hidden: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with(".extract-"))
            .collect();
        assert!(hidden.is_empty());
    }

    #[test]
    fn traversal_entry_is_rejected_without_residue() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("evil.zip");
        make_zip(&archive, &[("ok.txt", b"ok"), ("../escape.txt", b"bad")]);

        let err = extract_bundle(&archive, dir.path(), &id("b2"), None).unwrap_err();
        assert!(matches!(err, ExtractError::UnsafeEntry(_)));
        assert!(!dir.path().join("b2").exists());
        assert!(!dir.path().join("escape.txt").exists());
    }

    #[test]
    fn refuses_active_id() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("b.zip");
        make_zip(&archive, &[("x", b"x")]);
        let err = extract_bundle(&archive, dir.path(), &id("b1"), Some(&id("b1"))).unwrap_err();
        assert!(matches!(err, ExtractError::AlreadyActive(_)));
    }

    #[test]
    fn replaces_inactive_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("b1")).unwrap();
        std::fs::write(dir.path().join("b1/stale.txt"), "old").unwrap();
        let archive = dir.path().join("b.zip");
        make_zip(&archive, &[("fresh.txt", b"new")]);

        let target = extract_bundle(&archive, dir.path(), &id("b1"), Some(&id("b0"))).unwrap();
        assert!(target.join("fresh.txt").exists());
        assert!(!target.join("stale.txt").exists());
    }

    #[test]
    fn garbage_archive_is_zip_error() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("b.zip");
        std::fs::write(&archive, b"not a zip").unwrap();
        let err = extract_bundle(&archive, dir.path(), &id("b3"), None).unwrap_err();
        assert!(matches!(err, ExtractError::Zip(_)));
    }
}
