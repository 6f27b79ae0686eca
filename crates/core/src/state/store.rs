use std::fs::{File, OpenOptions};
use std::io::Write;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::model::{OperationId, OperationType};
use crate::state::{BackupState, RecoveryState};
use crate::{Error, Result};

const VERSION_EXTENSION: &str = "json";

/// Strictly increasing millisecond stamp, unique within the process.
fn next_version() -> u64 {
    static LAST_VERSION: AtomicU64 = AtomicU64::new(0);

    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64;

    let mut prev = LAST_VERSION.load(Ordering::Relaxed);
    loop {
        let next = now.max(prev + 1);
        match LAST_VERSION.compare_exchange_weak(prev, next, Ordering::Relaxed, Ordering::Relaxed) {
            Ok(_) => return next,
            Err(current) => prev = current,
        }
    }
}

/// File-backed store keeping the `max_versions` most recent snapshots of `T`.
#[derive(Debug)]
pub struct StateStore<T> {
    dir: PathBuf,
    max_versions: usize,
    _state: PhantomData<fn() -> T>,
}

impl<T> Clone for StateStore<T> {
    fn clone(&self) -> Self {
        Self {
            dir: self.dir.clone(),
            max_versions: self.max_versions,
            _state: PhantomData,
        }
    }
}

impl<T: Serialize + DeserializeOwned> StateStore<T> {
    pub fn new(dir: impl Into<PathBuf>, max_versions: usize) -> Result<Self> {
        if max_versions == 0 {
            return Err(Error::InvalidConfig {
                message: "state store must retain at least one version".to_string(),
            });
        }
        Ok(Self {
            dir: dir.into(),
            max_versions,
            _state: PhantomData,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn persist(&self, state: &T) -> Result<()> {
        std::fs::create_dir_all(&self.dir)?;

        let path = self
            .dir
            .join(format!("{:016}.{VERSION_EXTENSION}", next_version()));
        let tmp = path.with_extension(format!("{VERSION_EXTENSION}.tmp.{}", std::process::id()));
        let data = serde_json::to_vec(state)?;

        let mut f = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp)?;
        f.write_all(&data)?;
        f.sync_all()?;
        drop(f);

        std::fs::rename(&tmp, &path)?;

        if let Ok(dir) = File::open(&self.dir) {
            let _ = dir.sync_all();
        }

        self.prune()
    }

    /// Newest readable version; corrupt versions are skipped.
    pub fn restore(&self) -> Result<Option<T>> {
        for path in self.versions()?.into_iter().rev() {
            let parsed = std::fs::read(&path)
                .map_err(Error::from)
                .and_then(|bytes| serde_json::from_slice::<T>(&bytes).map_err(Error::from));
            match parsed {
                Ok(state) => return Ok(Some(state)),
                Err(e) => {
                    tracing::warn!(
                        event = "state.version_skipped",
                        path = %path.display(),
                        error = %e,
                        "state.version_skipped"
                    );
                }
            }
        }
        Ok(None)
    }

    pub fn prune(&self) -> Result<()> {
        let versions = self.versions()?;
        let excess = versions.len().saturating_sub(self.max_versions);
        for path in versions.into_iter().take(excess) {
            std::fs::remove_file(&path)?;
        }
        Ok(())
    }

    pub fn discard(&self) -> Result<()> {
        for path in self.versions()? {
            std::fs::remove_file(&path)?;
        }
        Ok(())
    }

    /// Version files, oldest first.
    pub fn versions(&self) -> Result<Vec<PathBuf>> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut out = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) == Some(VERSION_EXTENSION) {
                out.push(path);
            }
        }
        out.sort();
        Ok(out)
    }
}

/// Per-operation state stores under `<root>/<kind>/<operation>/`.
#[derive(Debug, Clone)]
pub struct StateStores {
    root: PathBuf,
    max_versions: usize,
}

impl StateStores {
    pub fn new(root: impl Into<PathBuf>, max_versions: usize) -> Self {
        Self {
            root: root.into(),
            max_versions,
        }
    }

    pub fn backup(&self, operation: OperationId) -> Result<StateStore<BackupState>> {
        StateStore::new(self.operation_dir(OperationType::Backup, operation), self.max_versions)
    }

    pub fn recovery(&self, operation: OperationId) -> Result<StateStore<RecoveryState>> {
        StateStore::new(
            self.operation_dir(OperationType::Recovery, operation),
            self.max_versions,
        )
    }

    pub fn operations(&self, kind: OperationType) -> Result<Vec<OperationId>> {
        let dir = self.root.join(kind.to_string());
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut out = Vec::new();
        for entry in entries {
            let entry = entry?;
            if let Some(id) = entry
                .file_name()
                .to_str()
                .and_then(|name| OperationId::parse_str(name).ok())
            {
                out.push(id);
            }
        }
        out.sort();
        Ok(out)
    }

    fn operation_dir(&self, kind: OperationType, operation: OperationId) -> PathBuf {
        self.root.join(kind.to_string()).join(operation.to_string())
    }
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;

    #[test]
    fn keeps_only_the_newest_versions() {
        let dir = tempfile::tempdir().unwrap();
        let store: StateStore<u32> = StateStore::new(dir.path().join("s"), 2).unwrap();

        for i in 0..5u32 {
            store.persist(&i).unwrap();
        }
        assert_eq!(store.versions().unwrap().len(), 2);
        assert_eq!(store.restore().unwrap(), Some(4));
    }

    #[test]
    fn restore_skips_corrupt_versions() {
        let dir = tempfile::tempdir().unwrap();
        let store: StateStore<Vec<String>> = StateStore::new(dir.path(), 3).unwrap();

        store.persist(&vec!["good".to_string()]).unwrap();
        store.persist(&vec!["newer".to_string()]).unwrap();
        let newest = store.versions().unwrap().pop().unwrap();
        std::fs::write(&newest, b"{not json").unwrap();

        assert_eq!(store.restore().unwrap(), Some(vec!["good".to_string()]));

        for path in store.versions().unwrap() {
            std::fs::write(path, b"garbage").unwrap();
        }
        assert_eq!(store.restore().unwrap(), None);
    }

    #[test]
    fn missing_store_restores_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let store: StateStore<u32> = StateStore::new(dir.path().join("missing"), 1).unwrap();
        assert_eq!(store.restore().unwrap(), None);
        store.discard().unwrap();
        assert!(StateStore::<u32>::new(dir.path(), 0).is_err());
    }

    #[test]
    fn lists_operations_per_kind() {
        let dir = tempfile::tempdir().unwrap();
        let stores = StateStores::new(dir.path(), 2);
        let op = Uuid::new_v4();

        let state = BackupState::start(op, Uuid::new_v4());
        stores.backup(op).unwrap().persist(&state).unwrap();

        assert_eq!(stores.operations(OperationType::Backup).unwrap(), vec![op]);
        assert!(stores.operations(OperationType::Recovery).unwrap().is_empty());
        assert_eq!(stores.backup(op).unwrap().restore().unwrap(), Some(state));
    }
}
