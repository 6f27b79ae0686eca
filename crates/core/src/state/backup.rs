use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::model::{EntityMetadata, OperationId, SourceEntity};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupState {
    pub operation: OperationId,
    pub definition: Uuid,
    pub started: DateTime<Utc>,
    pub entities: BackupEntities,
    pub metadata_collected: Option<DateTime<Utc>>,
    pub metadata_pushed: Option<DateTime<Utc>>,
    /// Dataset entry created by the metadata push.
    pub entry: Option<Uuid>,
    pub failures: Vec<String>,
    pub completed: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupEntities {
    pub discovered: BTreeSet<PathBuf>,
    pub unmatched: Vec<String>,
    pub examined: BTreeSet<PathBuf>,
    pub collected: BTreeMap<PathBuf, SourceEntity>,
    pub pending: BTreeMap<PathBuf, PendingSourceEntity>,
    pub processed: BTreeMap<PathBuf, ProcessedSourceEntity>,
    pub failed: BTreeMap<PathBuf, String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingSourceEntity {
    pub expected_parts: u32,
    pub processed_parts: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessedSourceEntity {
    pub metadata: EntityMetadata,
    pub content_changed: bool,
}

impl BackupState {
    pub fn start(operation: OperationId, definition: Uuid) -> Self {
        Self {
            operation,
            definition,
            started: Utc::now(),
            entities: BackupEntities::default(),
            metadata_collected: None,
            metadata_pushed: None,
            entry: None,
            failures: Vec::new(),
            completed: None,
        }
    }

    pub fn entity_discovered(mut self, path: &Path) -> Self {
        self.entities.discovered.insert(path.to_path_buf());
        self
    }

    pub fn specification_unmatched(mut self, rules: impl IntoIterator<Item = String>) -> Self {
        self.entities.unmatched.extend(rules);
        self
    }

    pub fn entity_examined(mut self, path: &Path) -> Self {
        self.entities.examined.insert(path.to_path_buf());
        self
    }

    pub fn entity_collected(mut self, entity: SourceEntity) -> Self {
        self.entities.collected.insert(entity.path.clone(), entity);
        self
    }

    pub fn entity_processing_started(mut self, path: &Path, expected_parts: u32) -> Self {
        self.entities.pending.insert(
            path.to_path_buf(),
            PendingSourceEntity {
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

    pub fn entity_processed(
        mut self,
        path: &Path,
        metadata: EntityMetadata,
        content_changed: bool,
    ) -> Self {
        self.entities.pending.remove(path);
        self.entities.failed.remove(path);
        self.entities.processed.insert(
            path.to_path_buf(),
            ProcessedSourceEntity {
                metadata,
                content_changed,
            },
        );
        self
    }

    pub fn entity_failed(mut self, path: &Path, reason: String) -> Self {
        self.entities.pending.remove(path);
        self.entities.failed.insert(path.to_path_buf(), reason);
        self
    }

    pub fn metadata_collected(mut self) -> Self {
        self.metadata_collected = Some(Utc::now());
        self
    }

    pub fn metadata_pushed(mut self, entry: Uuid) -> Self {
        self.metadata_pushed = Some(Utc::now());
        self.entry = Some(entry);
        self
    }

    pub fn failure_encountered(mut self, failure: String) -> Self {
        self.failures.push(failure);
        self
    }

    pub fn backup_completed(mut self) -> Self {
        self.completed = Some(Utc::now());
        self
    }

    pub fn is_completed(&self) -> bool {
        self.completed.is_some()
    }

    /// Collected entities that have not been processed yet.
    pub fn remaining_entities(&self) -> Vec<SourceEntity> {
        if self.is_completed() {
            return Vec::new();
        }
        self.entities
            .collected
            .iter()
            .filter(|(path, _)| !self.entities.processed.contains_key(*path))
            .map(|(_, entity)| entity.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use chrono::TimeZone;

    use super::*;
    use crate::model::{Checksum, FileMetadata};

    fn entity(path: &str) -> SourceEntity {
        let metadata = EntityMetadata::File(FileMetadata {
            path: PathBuf::from(path),
            size: 1,
            link: None,
            is_hidden: false,
            created: Utc.timestamp_opt(1, 0).unwrap(),
            updated: Utc.timestamp_opt(1, 0).unwrap(),
            owner: "u".to_string(),
            group: "g".to_string(),
            permissions: "rw-------".to_string(),
            checksum: Checksum::from_be_bytes(&[1]),
            crates: BTreeMap::new(),
            compression: "none".to_string(),
        });
        SourceEntity {
            path: PathBuf::from(path),
            existing_metadata: None,
            current_metadata: metadata,
        }
    }

    #[test]
    fn remaining_entities_are_collected_minus_processed() {
        let a = entity("/a");
        let b = entity("/b");
        let state = BackupState::start(Uuid::new_v4(), Uuid::new_v4())
            .entity_discovered(&a.path)
            .entity_discovered(&b.path)
            .entity_examined(&a.path)
            .entity_examined(&b.path)
            .entity_collected(a.clone())
            .entity_collected(b.clone())
            .entity_processing_started(&a.path, 2)
            .entity_part_processed(&a.path);

        assert_eq!(
            state.entities.pending.get(&a.path),
            Some(&PendingSourceEntity {
                expected_parts: 2,
                processed_parts: 1
            })
        );
        assert_eq!(state.remaining_entities().len(), 2);

        let state = state.entity_processed(&a.path, a.current_metadata.clone(), true);
        assert!(state.entities.pending.is_empty());
        assert_eq!(state.remaining_entities(), vec![b.clone()]);

        let state = state.backup_completed();
        assert!(state.remaining_entities().is_empty());
    }

    #[test]
    fn failed_entities_remain_for_resumption() {
        let a = entity("/a");
        let state = BackupState::start(Uuid::new_v4(), Uuid::new_v4())
            .entity_collected(a.clone())
            .entity_processing_started(&a.path, 1)
            .entity_failed(&a.path, "io error".to_string());

        assert!(state.entities.pending.is_empty());
        assert_eq!(state.entities.failed.len(), 1);
        assert_eq!(state.remaining_entities(), vec![a]);
    }

    #[test]
    fn state_survives_json() {
        let a = entity("/a");
        let state = BackupState::start(Uuid::new_v4(), Uuid::new_v4())
            .entity_collected(a.clone())
            .entity_processed(&a.path, a.current_metadata.clone(), false)
            .metadata_collected();
        let json = serde_json::to_vec(&state).unwrap();
        let parsed: BackupState = serde_json::from_slice(&json).unwrap();
        assert_eq!(parsed, state);
    }
}
