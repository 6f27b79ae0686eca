use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

mod dataset_metadata;
mod entities;
mod entity_metadata;

pub use dataset_metadata::{DatasetMetadata, EntityState, FilesystemMetadata, MetadataLookup};
pub use entities::{Destination, SourceEntity, TargetEntity, destination_path_for};
pub use entity_metadata::{
    Checksum, DirectoryMetadata, EntityMetadata, FileMetadata, mode_from_permissions,
    permissions_from_mode,
};

pub type OperationId = Uuid;
pub type CrateId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    Backup,
    Recovery,
    Expiration,
    Validation,
    KeyRotation,
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Backup => "backup",
            Self::Recovery => "recovery",
            Self::Expiration => "expiration",
            Self::Validation => "validation",
            Self::KeyRotation => "key-rotation",
        };
        f.write_str(name)
    }
}

/// Who is performing an operation: the owning user, the device it runs on and
/// the storage node the device pushes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    pub user: Uuid,
    pub device: Uuid,
    pub node: Uuid,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetDefinition {
    pub id: Uuid,
    pub info: String,
    pub device: Uuid,
    pub redundant_copies: u32,
    pub created: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetEntry {
    pub id: Uuid,
    pub definition: Uuid,
    pub device: Uuid,
    pub data: BTreeSet<CrateId>,
    pub metadata: CrateId,
    pub created: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateDatasetEntry {
    pub definition: Uuid,
    pub device: Uuid,
    pub data: BTreeSet<CrateId>,
    pub metadata: CrateId,
}

/// Descriptor pushed alongside every crate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub crate_id: CrateId,
    pub size: u64,
    pub copies: u32,
    pub origin: Uuid,
    pub source: Uuid,
}
