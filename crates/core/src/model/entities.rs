use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::model::EntityMetadata;

/// An entity considered for backup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceEntity {
    pub path: PathBuf,
    pub existing_metadata: Option<EntityMetadata>,
    pub current_metadata: EntityMetadata,
}

impl SourceEntity {
    pub fn has_changed(&self) -> bool {
        match &self.existing_metadata {
            Some(existing) => existing != &self.current_metadata,
            None => true,
        }
    }

    pub fn has_content_changed(&self) -> bool {
        let EntityMetadata::File(current) = &self.current_metadata else {
            return false;
        };
        if current.link.is_some() {
            return false;
        }

        match &self.existing_metadata {
            Some(EntityMetadata::File(existing)) => {
                existing.link.is_some()
                    || existing.size != current.size
                    || existing.checksum != current.checksum
            }
            Some(EntityMetadata::Directory(_)) | None => true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Destination {
    /// Restore every entity to its original path.
    Default,
    /// Restore under an alternate root, either mirroring the original
    /// structure or flattening entities directly into `path`.
    Directory {
        path: PathBuf,
        keep_default_structure: bool,
    },
}

/// An entity selected for recovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetEntity {
    pub path: PathBuf,
    pub destination: Destination,
    pub existing_metadata: EntityMetadata,
    pub current_metadata: Option<EntityMetadata>,
}

impl TargetEntity {
    pub fn destination_path(&self) -> PathBuf {
        destination_path_for(&self.destination, self.existing_metadata.path())
    }

    pub fn has_changed(&self) -> bool {
        match &self.current_metadata {
            Some(current) => !self.existing_metadata.same_attributes(current),
            None => true,
        }
    }

    pub fn has_content_changed(&self) -> bool {
        let EntityMetadata::File(existing) = &self.existing_metadata else {
            return false;
        };
        if existing.link.is_some() {
            return false;
        }

        match &self.current_metadata {
            Some(EntityMetadata::File(current)) => {
                current.link.is_some()
                    || current.size != existing.size
                    || current.checksum != existing.checksum
            }
            Some(EntityMetadata::Directory(_)) | None => true,
        }
    }
}

pub fn destination_path_for(destination: &Destination, original: &Path) -> PathBuf {
    match destination {
        Destination::Default => original.to_path_buf(),
        Destination::Directory {
            path,
            keep_default_structure: true,
        } => {
            let relative: PathBuf = original
                .components()
                .filter(|c| matches!(c, Component::Normal(_)))
                .collect();
            path.join(relative)
        }
        Destination::Directory {
            path,
            keep_default_structure: false,
        } => match original.file_name() {
            Some(name) => path.join(name),
            None => path.clone(),
        },
    }
}
