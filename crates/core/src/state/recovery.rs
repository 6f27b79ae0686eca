use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::model::{OperationId, TargetEntity};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryState {
    pub operation: OperationId,
    pub definition: Uuid,
    pub entry: Option<Uuid>,
    pub started: DateTime<Utc>,
    pub entities: RecoveryEntities,
    pub failures: Vec<String>,
    pub completed: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryEntities {
    pub examined: BTreeSet<PathBuf>,
    pub collected: BTreeMap<PathBuf, TargetEntity>,
    pub pending: BTreeMap<PathBuf, PendingTargetEntity>,
    pub processed: BTreeSet<PathBuf>,
    pub metadata_applied: BTreeSet<PathBuf>,
    pub failed: BTreeMap<PathBuf, String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingTargetEntity {
    pub expected_parts: u32,
    pub processed_parts: u32,
}

impl RecoveryState {
    pub fn start(operation: OperationId, definition: Uuid) -> Self {
        Self {
            operation,
            definition,
            entry: None,
            started: Utc::now(),
            entities: RecoveryEntities::default(),
            failures: Vec::new(),
            completed: None,
        }
    }

    pub fn entry_selected(mut self, entry: Uuid) -> Self {
        self.entry = Some(entry);
        self
    }

    pub fn entity_examined(mut self, path: &Path) -> Self {
        self.entities.examined.insert(path.to_path_buf());
        self
    }

    pub fn entity_collected(mut self, entity: TargetEntity) -> Self {
        self.entities.collected.insert(entity.path.clone(), entity);
        self
    }

    pub fn entity_processing_started(mut self, path: &Path, expected_parts: u32) -> Self {
        self.entities.pending.insert(
            path.to_path_buf(),
            PendingTargetEntity {
                expected_parts,
                processed_parts: 0,
            },
        );
        self
    }

    pub fn entity_part_processed(mut self, path: &Path) -> Self {
        if let Some(pending) = self.entities.pending.get_mut(path) {
            pending.processed_parts += 1;
        }
        self
    }

    pub fn entity_processed(mut self, path: &Path) -> Self {
        self.entities.pending.remove(path);
        self.entities.processed.insert(path.to_path_buf());
        self
    }

    pub fn entity_metadata_applied(mut self, path: &Path) -> Self {
        self.entities.metadata_applied.insert(path.to_path_buf());
        self
    }

    pub fn entity_failed(mut self, path: &Path, reason: String) -> Self {
        self.entities.pending.remove(path);
        self.entities.failed.insert(path.to_path_buf(), reason);
        self
    }

    pub fn failure_encountered(mut self, failure: String) -> Self {
        self.failures.push(failure);
        self
    }

    pub fn recovery_completed(mut self) -> Self {
        self.completed = Some(Utc::now());
        self
    }

    pub fn is_completed(&self) -> bool {
        self.completed.is_some()
    }

    pub fn remaining_entities(&self) -> Vec<TargetEntity> {
        if self.is_completed() {
            return Vec::new();
        }
        self.entities
            .collected
            .iter()
            .filter(|(path, _)| !self.entities.processed.contains(*path))
            .map(|(_, entity)| entity.clone())
            .collect()
    }
}
