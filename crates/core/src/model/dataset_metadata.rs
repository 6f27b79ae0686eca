use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::crypto::Encoder;
use crate::model::{CrateId, EntityMetadata};
use crate::remote::ApiClient;
use crate::secrets::DeviceMetadataSecret;
use crate::{Error, Result};

const METADATA_AAD: &[u8] = b"cratekeeper.dataset-metadata.v1";

/// Per-entry metadata: what changed in this entry plus the lifecycle of every
/// entity known to the dataset so far.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetMetadata {
    pub content_changed: BTreeMap<PathBuf, EntityMetadata>,
    pub metadata_changed: BTreeMap<PathBuf, EntityMetadata>,
    pub filesystem: FilesystemMetadata,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilesystemMetadata {
    pub entities: BTreeMap<PathBuf, EntityState>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum EntityState {
    New,
    Updated,
    /// Unchanged since the referenced entry, which holds its metadata.
    Existing { entry: Uuid },
}

impl DatasetMetadata {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn get(&self, path: &Path) -> Option<&EntityMetadata> {
        self.content_changed
            .get(path)
            .or_else(|| self.metadata_changed.get(path))
    }

    pub fn content_changed_bytes(&self) -> u64 {
        self.content_changed
            .values()
            .filter_map(|m| m.as_file())
            .map(|f| f.size)
            .sum()
    }

    /// Crates referenced by the content changed in this entry.
    pub fn data_crates(&self) -> BTreeSet<CrateId> {
        self.content_changed
            .values()
            .filter_map(|m| m.as_file())
            .flat_map(|f| f.crates.values().copied())
            .collect()
    }

    pub async fn collect(&self, path: &Path, api: &dyn ApiClient) -> Result<Option<EntityMetadata>> {
        MetadataLookup::new(self, api).collect(path).await
    }

    pub async fn require(&self, path: &Path, api: &dyn ApiClient) -> Result<EntityMetadata> {
        self.collect(path, api)
            .await?
            .ok_or_else(|| Error::MissingMetadata {
                path: path.to_path_buf(),
            })
    }

    /// JSON, zstd-compressed, then encrypted under the metadata secret.
    pub fn to_crate_bytes(
        &self,
        encoder: &dyn Encoder,
        secret: &DeviceMetadataSecret,
    ) -> Result<Vec<u8>> {
        let json = serde_json::to_vec(self)?;
        let compressed = zstd::stream::encode_all(json.as_slice(), 0)?;
        if compressed.len() as u64 > encoder.max_plaintext_size() {
            return Err(Error::InvalidConfig {
                message: format!(
                    "dataset metadata too large to encrypt ({} bytes)",
                    compressed.len()
                ),
            });
        }
        encoder.encrypt(secret.key(), secret.iv(), METADATA_AAD, &compressed)
    }

    pub fn from_crate_bytes(
        encoder: &dyn Encoder,
        secret: &DeviceMetadataSecret,
        bytes: &[u8],
    ) -> Result<Self> {
        let compressed = encoder.decrypt(secret.key(), secret.iv(), METADATA_AAD, bytes)?;
        let json = zstd::stream::decode_all(compressed.as_slice())?;
        let metadata = serde_json::from_slice(&json).map_err(|e| Error::Integrity {
            message: format!("invalid dataset metadata: {e}"),
        })?;
        Ok(metadata)
    }
}

impl FilesystemMetadata {
    pub fn new(changes: impl IntoIterator<Item = PathBuf>) -> Self {
        Self {
            entities: changes
                .into_iter()
                .map(|path| (path, EntityState::New))
                .collect(),
        }
    }

    /// Rolls this snapshot forward past `latest_entry`.
    pub fn updated(&self, changes: impl IntoIterator<Item = PathBuf>, latest_entry: Uuid) -> Self {
        let mut entities: BTreeMap<PathBuf, EntityState> = self
            .entities
            .iter()
            .map(|(path, state)| {
                let state = match state {
                    EntityState::New | EntityState::Updated => EntityState::Existing {
                        entry: latest_entry,
                    },
                    existing @ EntityState::Existing { .. } => *existing,
                };
                (path.clone(), state)
            })
            .collect();

        for path in changes {
            let state = if entities.contains_key(&path) {
                EntityState::Updated
            } else {
                EntityState::New
            };
            entities.insert(path, state);
        }

        Self { entities }
    }
}

/// Resolves entity metadata against a dataset's latest metadata, following
/// `Existing` pointers to the entries that last changed each entity.
pub struct MetadataLookup<'a> {
    latest: &'a DatasetMetadata,
    api: &'a dyn ApiClient,
    previous: HashMap<Uuid, DatasetMetadata>,
}

impl<'a> MetadataLookup<'a> {
    pub fn new(latest: &'a DatasetMetadata, api: &'a dyn ApiClient) -> Self {
        Self {
            latest,
            api,
            previous: HashMap::new(),
        }
    }

    pub async fn collect(&mut self, path: &Path) -> Result<Option<EntityMetadata>> {
        match self.latest.filesystem.entities.get(path) {
            None => Ok(None),
            Some(EntityState::New) | Some(EntityState::Updated) => {
                Ok(self.latest.get(path).cloned())
            }
            Some(EntityState::Existing { entry }) => {
                let entry = *entry;
                if !self.previous.contains_key(&entry) {
                    let dataset_entry = self.api.dataset_entry(entry).await?;
                    let metadata = self.api.dataset_metadata(&dataset_entry).await?;
                    self.previous.insert(entry, metadata);
                }
                Ok(self
                    .previous
                    .get(&entry)
                    .and_then(|m| m.get(path))
                    .cloned())
            }
        }
    }
}
