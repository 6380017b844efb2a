use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum ProvisionError {
    #[error("Failed to create directory {path:?}: {source}")]
    DirectoryCreation { path: PathBuf, source: io::Error },
}

/// Create `path` and any missing parents. Existing directories are left as they are.
pub fn ensure_dir(path: &Path) -> Result<(), ProvisionError> {
    if path.is_dir() {
        debug!("Directory already present: {:?}", path);
        return Ok(());
    }

    std::fs::create_dir_all(path).map_err(|source| ProvisionError::DirectoryCreation {
        path: path.to_path_buf(),
        source,
    })?;

    info!("Created directory {:?}", path);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_creates_nested_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("a").join("b").join("c");
        ensure_dir(&target).unwrap();
        assert!(target.is_dir());
    }

    #[test]
    fn test_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("session");
        ensure_dir(&target).unwrap();
        std::fs::write(target.join("keep.txt"), "x").unwrap();

        ensure_dir(&target).unwrap();

        assert!(target.is_dir());
        assert_eq!(std::fs::read_to_string(target.join("keep.txt")).unwrap(), "x");
        assert_eq!(std::fs::read_dir(&target).unwrap().count(), 1);
    }

    #[test]
    fn test_file_in_the_way_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, "not a dir").unwrap();

        let err = ensure_dir(&blocker.join("child")).unwrap_err();
        assert!(matches!(err, ProvisionError::DirectoryCreation { .. }));
    }
}
