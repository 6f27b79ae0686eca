use std::path::{Path, PathBuf};

use crate::Result;

/// Temporary files for parts in flight, kept inside one directory so that
/// leftovers are easy to find and remove.
#[derive(Debug, Clone)]
pub struct FileStaging {
    dir: PathBuf,
}

impl FileStaging {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn create_temporary(&self) -> Result<PathBuf> {
        let file = tempfile::Builder::new()
            .prefix("staged-")
            .suffix(".part")
            .tempfile_in(&self.dir)?;
        let (_, path) = file.keep().map_err(|e| e.error)?;
        Ok(path)
    }

    /// Best-effort removal; failures are logged and swallowed.
    pub fn discard(&self, path: &Path) {
        match std::fs::remove_file(path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!(
                    event = "staging.discard_failed",
                    path = %path.display(),
                    error = %e,
                    "staging.discard_failed"
                );
            }
        }
    }

    pub fn discard_all<'a>(&self, paths: impl IntoIterator<Item = &'a PathBuf>) {
        for path in paths {
            self.discard(path);
        }
    }

    /// Moves a finished staged file to `target`, creating missing parents.
    pub fn destage(&self, staged: &Path, target: &Path) -> Result<()> {
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        match std::fs::rename(staged, target) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::CrossesDevices => {
                std::fs::copy(staged, target)?;
                self.discard(staged);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn staged_files(&self) -> Result<Vec<PathBuf>> {
        let mut out = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            out.push(entry?.path());
        }
        out.sort();
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_discard_and_destage() {
        let dir = tempfile::tempdir().unwrap();
        let staging = FileStaging::new(dir.path().join("staging")).unwrap();

        let a = staging.create_temporary().unwrap();
        let b = staging.create_temporary().unwrap();
        assert_ne!(a, b);
        assert_eq!(staging.staged_files().unwrap().len(), 2);

        staging.discard(&a);
        staging.discard(&a);
        std::fs::write(&b, b"data").unwrap();

        let target = dir.path().join("out").join("nested").join("file.txt");
        staging.destage(&b, &target).unwrap();
        assert_eq!(std::fs::read(&target).unwrap(), b"data");
        assert!(staging.staged_files().unwrap().is_empty());
    }
}
