use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::crypto::Encoder;
use crate::model::{
    CrateId, CreateDatasetEntry, DatasetDefinition, DatasetEntry, DatasetMetadata, Manifest,
};
use crate::secrets::{DerivationConfig, DeviceSecret};
use crate::{Error, Result};

mod http;

pub use http::{HttpApiClient, HttpCoreClient, HttpCredentials, HttpDiscoveryClient};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Crate storage.
pub trait CoreClient: Send + Sync {
    /// Identifies the endpoint this client talks to.
    fn id(&self) -> &str;

    fn push<'a>(&'a self, manifest: Manifest, content: Vec<u8>) -> BoxFuture<'a, ()>;

    /// `None` when the crate does not exist.
    fn pull<'a>(&'a self, crate_id: CrateId) -> BoxFuture<'a, Option<Vec<u8>>>;
}

/// Dataset definitions, entries and their metadata.
pub trait ApiClient: Send + Sync {
    fn id(&self) -> &str;

    fn dataset_definitions<'a>(&'a self) -> BoxFuture<'a, Vec<DatasetDefinition>>;

    fn dataset_definition<'a>(&'a self, definition: Uuid) -> BoxFuture<'a, DatasetDefinition>;

    fn dataset_entries<'a>(&'a self, definition: Uuid) -> BoxFuture<'a, Vec<DatasetEntry>>;

    fn dataset_entry<'a>(&'a self, entry: Uuid) -> BoxFuture<'a, DatasetEntry>;

    fn latest_entry<'a>(
        &'a self,
        definition: Uuid,
        until: Option<DateTime<Utc>>,
    ) -> BoxFuture<'a, Option<DatasetEntry>>;

    fn create_dataset_entry<'a>(&'a self, request: CreateDatasetEntry) -> BoxFuture<'a, Uuid>;

    fn dataset_metadata<'a>(&'a self, entry: &'a DatasetEntry) -> BoxFuture<'a, DatasetMetadata>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndpointKind {
    Core,
    Api,
    Discovery,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceEndpoint {
    pub id: String,
    pub kind: EndpointKind,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum ServiceDiscoveryResult {
    KeepExisting,
    SwitchTo {
        endpoints: Vec<ServiceEndpoint>,
        recreate_existing: bool,
    },
}

pub trait DiscoveryClient: Send + Sync {
    fn id(&self) -> &str;

    fn latest<'a>(&'a self, is_initial_request: bool) -> BoxFuture<'a, ServiceDiscoveryResult>;
}

/// Hands out the clients an operation should use right now.
pub trait ClientProvider: Send + Sync {
    fn api(&self) -> Result<Arc<dyn ApiClient>>;

    fn core(&self) -> Result<Arc<dyn CoreClient>>;
}

#[derive(Clone)]
pub struct StaticClientProvider {
    api: Arc<dyn ApiClient>,
    core: Arc<dyn CoreClient>,
}

impl StaticClientProvider {
    pub fn new(api: Arc<dyn ApiClient>, core: Arc<dyn CoreClient>) -> Self {
        Self { api, core }
    }
}

impl ClientProvider for StaticClientProvider {
    fn api(&self) -> Result<Arc<dyn ApiClient>> {
        Ok(self.api.clone())
    }

    fn core(&self) -> Result<Arc<dyn CoreClient>> {
        Ok(self.core.clone())
    }
}

/// Pulls and decrypts dataset metadata crates on behalf of an [`ApiClient`].
#[derive(Clone)]
pub struct MetadataCrateReader {
    core: Arc<dyn CoreClient>,
    secret: Arc<DeviceSecret>,
    derivation: DerivationConfig,
    encoder: Arc<dyn Encoder>,
}

impl MetadataCrateReader {
    pub fn new(
        core: Arc<dyn CoreClient>,
        secret: Arc<DeviceSecret>,
        derivation: DerivationConfig,
        encoder: Arc<dyn Encoder>,
    ) -> Self {
        Self {
            core,
            secret,
            derivation,
            encoder,
        }
    }

    pub async fn read(&self, entry: &DatasetEntry) -> Result<DatasetMetadata> {
        let bytes = self
            .core
            .pull(entry.metadata)
            .await?
            .ok_or(Error::MissingCrate {
                crate_id: entry.metadata,
            })?;
        let secret = self
            .secret
            .to_metadata_secret(entry.metadata, &self.derivation)?;
        DatasetMetadata::from_crate_bytes(self.encoder.as_ref(), &secret, &bytes)
    }
}

#[derive(Default)]
pub struct InMemoryCoreClient {
    inner: Mutex<HashMap<CrateId, (Manifest, Vec<u8>)>>,
    pushed: AtomicUsize,
    pulled: AtomicUsize,
}

impl InMemoryCoreClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_count(&self) -> usize {
        self.pushed.load(Ordering::Relaxed)
    }

    pub fn pull_count(&self) -> usize {
        self.pulled.load(Ordering::Relaxed)
    }

    pub async fn crate_count(&self) -> usize {
        self.inner.lock().await.len()
    }

    pub async fn manifest(&self, crate_id: CrateId) -> Option<Manifest> {
        self.inner.lock().await.get(&crate_id).map(|(m, _)| m.clone())
    }

    pub async fn remove(&self, crate_id: CrateId) -> Option<Vec<u8>> {
        self.inner.lock().await.remove(&crate_id).map(|(_, b)| b)
    }
}

impl CoreClient for InMemoryCoreClient {
    fn id(&self) -> &str {
        "test.mem"
    }

    fn push<'a>(&'a self, manifest: Manifest, content: Vec<u8>) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            if content.len() as u64 != manifest.size {
                return Err(Error::remote(format!(
                    "crate size mismatch: manifest={} actual={}",
                    manifest.size,
                    content.len()
                )));
            }
            self.inner
                .lock()
                .await
                .insert(manifest.crate_id, (manifest, content));
            self.pushed.fetch_add(1, Ordering::Relaxed);
            Ok(())
        })
    }

    fn pull<'a>(&'a self, crate_id: CrateId) -> BoxFuture<'a, Option<Vec<u8>>> {
        Box::pin(async move {
            self.pulled.fetch_add(1, Ordering::Relaxed);
            Ok(self
                .inner
                .lock()
                .await
                .get(&crate_id)
                .map(|(_, b)| b.clone()))
        })
    }
}

pub struct InMemoryApiClient {
    definitions: Mutex<BTreeMap<Uuid, DatasetDefinition>>,
    entries: Mutex<Vec<DatasetEntry>>,
    metadata: MetadataCrateReader,
}

impl InMemoryApiClient {
    pub fn new(metadata: MetadataCrateReader) -> Self {
        Self {
            definitions: Mutex::new(BTreeMap::new()),
            entries: Mutex::new(Vec::new()),
            metadata,
        }
    }

    pub async fn put_definition(&self, definition: DatasetDefinition) {
        self.definitions
            .lock()
            .await
            .insert(definition.id, definition);
    }

    pub async fn entry_count(&self) -> usize {
        self.entries.lock().await.len()
    }
}

impl ApiClient for InMemoryApiClient {
    fn id(&self) -> &str {
        "test.mem"
    }

    fn dataset_definitions<'a>(&'a self) -> BoxFuture<'a, Vec<DatasetDefinition>> {
        Box::pin(async move { Ok(self.definitions.lock().await.values().cloned().collect()) })
    }

    fn dataset_definition<'a>(&'a self, definition: Uuid) -> BoxFuture<'a, DatasetDefinition> {
        Box::pin(async move {
            self.definitions
                .lock()
                .await
                .get(&definition)
                .cloned()
                .ok_or_else(|| Error::remote(format!("dataset definition not found: {definition}")))
        })
    }

    fn dataset_entries<'a>(&'a self, definition: Uuid) -> BoxFuture<'a, Vec<DatasetEntry>> {
        Box::pin(async move {
            Ok(self
                .entries
                .lock()
                .await
                .iter()
                .filter(|e| e.definition == definition)
                .cloned()
                .collect())
        })
    }

    fn dataset_entry<'a>(&'a self, entry: Uuid) -> BoxFuture<'a, DatasetEntry> {
        Box::pin(async move {
            self.entries
                .lock()
                .await
                .iter()
                .find(|e| e.id == entry)
                .cloned()
                .ok_or_else(|| Error::remote(format!("dataset entry not found: {entry}")))
        })
    }

    fn latest_entry<'a>(
        &'a self,
        definition: Uuid,
        until: Option<DateTime<Utc>>,
    ) -> BoxFuture<'a, Option<DatasetEntry>> {
        Box::pin(async move {
            // Entries are appended in creation order.
            Ok(self
                .entries
                .lock()
                .await
                .iter()
                .filter(|e| e.definition == definition)
                .filter(|e| until.is_none_or(|until| e.created <= until))
                .next_back()
                .cloned())
        })
    }

    fn create_dataset_entry<'a>(&'a self, request: CreateDatasetEntry) -> BoxFuture<'a, Uuid> {
        Box::pin(async move {
            let entry = DatasetEntry {
                id: Uuid::new_v4(),
                definition: request.definition,
                device: request.device,
                data: request.data,
                metadata: request.metadata,
                created: Utc::now(),
            };
            let id = entry.id;
            self.entries.lock().await.push(entry);
            Ok(id)
        })
    }

    fn dataset_metadata<'a>(&'a self, entry: &'a DatasetEntry) -> BoxFuture<'a, DatasetMetadata> {
        Box::pin(async move { self.metadata.read(entry).await })
    }
}
