//! Lifecycle sinks for running operations.
//!
//! Trackers receive every pipeline event, fold it into the operation's state
//! ledger and periodically persist the ledger so an interrupted backup can be
//! resumed.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use serde::Serialize;
use serde::de::DeserializeOwned;
use uuid::Uuid;

use crate::Result;
use crate::model::{EntityMetadata, OperationId, SourceEntity, TargetEntity};
use crate::state::{BackupState, RecoveryState, StateStore, StateStores};

const DEFAULT_FLUSH_EVERY: usize = 32;

pub trait BackupTracker: Send + Sync {
    /// Registers a fresh or resumed state.
    fn started(&self, state: BackupState);
    fn entity_discovered(&self, operation: OperationId, path: &Path);
    fn specification_unmatched(&self, operation: OperationId, rules: Vec<String>);
    fn entity_examined(&self, operation: OperationId, path: &Path);
    fn entity_collected(&self, operation: OperationId, entity: &SourceEntity);
    fn entity_processing_started(&self, operation: OperationId, path: &Path, expected_parts: u32);
    fn entity_part_processed(&self, operation: OperationId, path: &Path);
    fn entity_processed(
        &self,
        operation: OperationId,
        path: &Path,
        metadata: &EntityMetadata,
        content_changed: bool,
    );
    fn entity_failed(&self, operation: OperationId, path: &Path, reason: &str);
    fn metadata_collected(&self, operation: OperationId);
    fn metadata_pushed(&self, operation: OperationId, entry: Uuid);
    fn failure_encountered(&self, operation: OperationId, failure: &str);
    fn completed(&self, operation: OperationId);
    fn state(&self, operation: OperationId) -> Option<BackupState>;
}

pub trait RecoveryTracker: Send + Sync {
    fn started(&self, state: RecoveryState);
    fn entry_selected(&self, operation: OperationId, entry: Uuid);
    fn entity_examined(&self, operation: OperationId, path: &Path);
    fn entity_collected(&self, operation: OperationId, entity: &TargetEntity);
    fn entity_processing_started(&self, operation: OperationId, path: &Path, expected_parts: u32);
    fn entity_part_processed(&self, operation: OperationId, path: &Path);
    fn entity_processed(&self, operation: OperationId, path: &Path);
    fn entity_metadata_applied(&self, operation: OperationId, path: &Path);
    fn entity_failed(&self, operation: OperationId, path: &Path, reason: &str);
    fn failure_encountered(&self, operation: OperationId, failure: &str);
    fn completed(&self, operation: OperationId);
    fn state(&self, operation: OperationId) -> Option<RecoveryState>;
}

struct Tracked<S> {
    state: Option<S>,
    store: Option<StateStore<S>>,
    unflushed: usize,
}

struct Ledger<S> {
    kind: &'static str,
    states: Mutex<HashMap<OperationId, Tracked<S>>>,
    flush_every: usize,
}

impl<S: Clone + Serialize + DeserializeOwned> Ledger<S> {
    fn new(kind: &'static str, flush_every: usize) -> Self {
        Self {
            kind,
            states: Mutex::new(HashMap::new()),
            flush_every: flush_every.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<OperationId, Tracked<S>>> {
        self.states.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn insert(&self, operation: OperationId, state: S, store: Option<StateStore<S>>) {
        let mut tracked = Tracked {
            state: Some(state),
            store,
            unflushed: 0,
        };
        self.flush(operation, &mut tracked);
        self.lock().insert(operation, tracked);
    }

    fn update(&self, operation: OperationId, milestone: bool, f: impl FnOnce(S) -> S) {
        let mut states = self.lock();
        let Some(tracked) = states.get_mut(&operation) else {
            tracing::warn!(
                event = "tracker.unknown_operation",
                kind = self.kind,
                operation = %operation,
                "tracker.unknown_operation"
            );
            return;
        };
        if let Some(state) = tracked.state.take() {
            tracked.state = Some(f(state));
        }
        tracked.unflushed += 1;
        if milestone || tracked.unflushed >= self.flush_every {
            self.flush(operation, tracked);
        }
    }

    fn flush(&self, operation: OperationId, tracked: &mut Tracked<S>) {
        tracked.unflushed = 0;
        let (Some(store), Some(state)) = (&tracked.store, &tracked.state) else {
            return;
        };
        if let Err(e) = store.persist(state) {
            tracing::warn!(
                event = "tracker.persist_failed",
                kind = self.kind,
                operation = %operation,
                error = %e,
                "tracker.persist_failed"
            );
        }
    }

    fn get(&self, operation: OperationId) -> Option<S> {
        self.lock()
            .get(&operation)
            .and_then(|tracked| tracked.state.clone())
    }
}

fn restore_from<S: Serialize + DeserializeOwned>(
    kind: &'static str,
    operation: OperationId,
    store: Result<StateStore<S>>,
) -> Option<S> {
    match store.and_then(|store| store.restore()) {
        Ok(state) => state,
        Err(e) => {
            tracing::warn!(
                event = "tracker.restore_failed",
                kind,
                operation = %operation,
                error = %e,
                "tracker.restore_failed"
            );
            None
        }
    }
}

pub struct DefaultBackupTracker {
    ledger: Ledger<BackupState>,
    stores: Option<StateStores>,
}

impl DefaultBackupTracker {
    /// In-memory only.
    pub fn new() -> Self {
        Self {
            ledger: Ledger::new("backup", DEFAULT_FLUSH_EVERY),
            stores: None,
        }
    }

    pub fn persistent(stores: StateStores, flush_every: usize) -> Self {
        Self {
            ledger: Ledger::new("backup", flush_every),
            stores: Some(stores),
        }
    }
}

impl Default for DefaultBackupTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl BackupTracker for DefaultBackupTracker {
    fn started(&self, state: BackupState) {
        let operation = state.operation;
        tracing::info!(
            event = "backup.started",
            operation = %operation,
            definition = %state.definition,
            resumed = !state.entities.collected.is_empty(),
            "backup.started"
        );
        let store = self.stores.as_ref().and_then(|s| s.backup(operation).ok());
        self.ledger.insert(operation, state, store);
    }

    fn entity_discovered(&self, operation: OperationId, path: &Path) {
        tracing::debug!(event = "backup.entity.discovered", operation = %operation, path = %path.display(), "backup.entity.discovered");
        self.ledger
            .update(operation, false, |s| s.entity_discovered(path));
    }

    fn specification_unmatched(&self, operation: OperationId, rules: Vec<String>) {
        for rule in &rules {
            tracing::warn!(event = "backup.specification.unmatched", operation = %operation, rule = %rule, "backup.specification.unmatched");
        }
        self.ledger
            .update(operation, false, |s| s.specification_unmatched(rules));
    }

    fn entity_examined(&self, operation: OperationId, path: &Path) {
        tracing::debug!(event = "backup.entity.examined", operation = %operation, path = %path.display(), "backup.entity.examined");
        self.ledger.update(operation, false, |s| s.entity_examined(path));
    }

    fn entity_collected(&self, operation: OperationId, entity: &SourceEntity) {
        tracing::debug!(
            event = "backup.entity.collected",
            operation = %operation,
            path = %entity.path.display(),
            content_changed = entity.has_content_changed(),
            "backup.entity.collected"
        );
        self.ledger
            .update(operation, false, |s| s.entity_collected(entity.clone()));
    }

    fn entity_processing_started(&self, operation: OperationId, path: &Path, expected_parts: u32) {
        tracing::debug!(event = "backup.entity.processing", operation = %operation, path = %path.display(), expected_parts, "backup.entity.processing");
        self.ledger.update(operation, false, |s| {
            s.entity_processing_started(path, expected_parts)
        });
    }

    fn entity_part_processed(&self, operation: OperationId, path: &Path) {
        self.ledger
            .update(operation, false, |s| s.entity_part_processed(path));
    }

    fn entity_processed(
        &self,
        operation: OperationId,
        path: &Path,
        metadata: &EntityMetadata,
        content_changed: bool,
    ) {
        tracing::info!(
            event = "backup.entity.processed",
            operation = %operation,
            path = %path.display(),
            content_changed,
            "backup.entity.processed"
        );
        self.ledger.update(operation, false, |s| {
            s.entity_processed(path, metadata.clone(), content_changed)
        });
    }

    fn entity_failed(&self, operation: OperationId, path: &Path, reason: &str) {
        tracing::warn!(event = "backup.entity.failed", operation = %operation, path = %path.display(), reason, "backup.entity.failed");
        self.ledger.update(operation, true, |s| {
            s.entity_failed(path, reason.to_string())
        });
    }

    fn metadata_collected(&self, operation: OperationId) {
        tracing::info!(event = "backup.metadata.collected", operation = %operation, "backup.metadata.collected");
        self.ledger.update(operation, true, |s| s.metadata_collected());
    }

    fn metadata_pushed(&self, operation: OperationId, entry: Uuid) {
        tracing::info!(event = "backup.metadata.pushed", operation = %operation, entry = %entry, "backup.metadata.pushed");
        self.ledger
            .update(operation, true, |s| s.metadata_pushed(entry));
    }

    fn failure_encountered(&self, operation: OperationId, failure: &str) {
        tracing::error!(event = "backup.failed", operation = %operation, error = failure, "backup.failed");
        self.ledger.update(operation, true, |s| {
            s.failure_encountered(failure.to_string())
        });
    }

    fn completed(&self, operation: OperationId) {
        tracing::info!(event = "backup.completed", operation = %operation, "backup.completed");
        self.ledger.update(operation, true, |s| s.backup_completed());
    }

    fn state(&self, operation: OperationId) -> Option<BackupState> {
        self.ledger.get(operation).or_else(|| {
            let stores = self.stores.as_ref()?;
            restore_from("backup", operation, stores.backup(operation))
        })
    }
}

pub struct DefaultRecoveryTracker {
    ledger: Ledger<RecoveryState>,
    stores: Option<StateStores>,
}

impl DefaultRecoveryTracker {
    pub fn new() -> Self {
        Self {
            ledger: Ledger::new("recovery", DEFAULT_FLUSH_EVERY),
            stores: None,
        }
    }

    pub fn persistent(stores: StateStores, flush_every: usize) -> Self {
        Self {
            ledger: Ledger::new("recovery", flush_every),
            stores: Some(stores),
        }
    }
}

impl Default for DefaultRecoveryTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl RecoveryTracker for DefaultRecoveryTracker {
    fn started(&self, state: RecoveryState) {
        let operation = state.operation;
        tracing::info!(
            event = "recovery.started",
            operation = %operation,
            definition = %state.definition,
            "recovery.started"
        );
        let store = self.stores.as_ref().and_then(|s| s.recovery(operation).ok());
        self.ledger.insert(operation, state, store);
    }

    fn entry_selected(&self, operation: OperationId, entry: Uuid) {
        tracing::info!(event = "recovery.entry.selected", operation = %operation, entry = %entry, "recovery.entry.selected");
        self.ledger.update(operation, true, |s| s.entry_selected(entry));
    }

    fn entity_examined(&self, operation: OperationId, path: &Path) {
        tracing::debug!(event = "recovery.entity.examined", operation = %operation, path = %path.display(), "recovery.entity.examined");
        self.ledger.update(operation, false, |s| s.entity_examined(path));
    }

    fn entity_collected(&self, operation: OperationId, entity: &TargetEntity) {
        tracing::debug!(
            event = "recovery.entity.collected",
            operation = %operation,
            path = %entity.path.display(),
            destination = %entity.destination_path().display(),
            "recovery.entity.collected"
        );
        self.ledger
            .update(operation, false, |s| s.entity_collected(entity.clone()));
    }

    fn entity_processing_started(&self, operation: OperationId, path: &Path, expected_parts: u32) {
        tracing::debug!(event = "recovery.entity.processing", operation = %operation, path = %path.display(), expected_parts, "recovery.entity.processing");
        self.ledger.update(operation, false, |s| {
            s.entity_processing_started(path, expected_parts)
        });
    }

    fn entity_part_processed(&self, operation: OperationId, path: &Path) {
        self.ledger
            .update(operation, false, |s| s.entity_part_processed(path));
    }

    fn entity_processed(&self, operation: OperationId, path: &Path) {
        tracing::info!(event = "recovery.entity.processed", operation = %operation, path = %path.display(), "recovery.entity.processed");
        self.ledger.update(operation, false, |s| s.entity_processed(path));
    }

    fn entity_metadata_applied(&self, operation: OperationId, path: &Path) {
        tracing::debug!(event = "recovery.entity.metadata_applied", operation = %operation, path = %path.display(), "recovery.entity.metadata_applied");
        self.ledger
            .update(operation, false, |s| s.entity_metadata_applied(path));
    }

    fn entity_failed(&self, operation: OperationId, path: &Path, reason: &str) {
        tracing::warn!(event = "recovery.entity.failed", operation = %operation, path = %path.display(), reason, "recovery.entity.failed");
        self.ledger.update(operation, true, |s| {
            s.entity_failed(path, reason.to_string())
        });
    }

    fn failure_encountered(&self, operation: OperationId, failure: &str) {
        tracing::error!(event = "recovery.failed", operation = %operation, error = failure, "recovery.failed");
        self.ledger.update(operation, true, |s| {
            s.failure_encountered(failure.to_string())
        });
    }

    fn completed(&self, operation: OperationId) {
        tracing::info!(event = "recovery.completed", operation = %operation, "recovery.completed");
        self.ledger.update(operation, true, |s| s.recovery_completed());
    }

    fn state(&self, operation: OperationId) -> Option<RecoveryState> {
        self.ledger.get(operation).or_else(|| {
            let stores = self.stores.as_ref()?;
            restore_from("recovery", operation, stores.recovery(operation))
        })
    }
}
