#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use chrono::Utc;
use cratekeeper_core::model::{CrateId, DatasetDefinition, DeviceIdentity, Manifest};
use cratekeeper_core::remote::{
    ApiClient, BoxFuture, CoreClient, InMemoryApiClient, InMemoryCoreClient, MetadataCrateReader,
    StaticClientProvider,
};
use cratekeeper_core::{
    ChecksumAlgorithm, Compression, DefaultBackupTracker, DefaultRecoveryTracker,
    DerivationConfig, DeviceSecret, Encoder, Error, FileStaging, MetadataExtractor, Providers,
    XChaChaEncoder,
};
use tempfile::TempDir;
use uuid::Uuid;

/// Fails every push after the first `allowed` ones.
pub struct FailingCoreClient {
    inner: InMemoryCoreClient,
    allowed: AtomicUsize,
    attempts: AtomicUsize,
}

impl FailingCoreClient {
    pub fn new(allowed: usize) -> Self {
        Self {
            inner: InMemoryCoreClient::new(),
            allowed: AtomicUsize::new(allowed),
            attempts: AtomicUsize::new(0),
        }
    }

    pub fn allow_all(&self) {
        self.allowed.store(usize::MAX, Ordering::SeqCst);
    }
}

impl CoreClient for FailingCoreClient {
    fn id(&self) -> &str {
        "test.failing"
    }

    fn push<'a>(&'a self, manifest: Manifest, content: Vec<u8>) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            if self.attempts.fetch_add(1, Ordering::SeqCst) >= self.allowed.load(Ordering::SeqCst) {
                return Err(Error::remote("push rejected"));
            }
            self.inner.push(manifest, content).await
        })
    }

    fn pull<'a>(&'a self, crate_id: CrateId) -> BoxFuture<'a, Option<Vec<u8>>> {
        self.inner.pull(crate_id)
    }
}

pub struct Harness {
    pub temp: TempDir,
    pub source: PathBuf,
    pub core: Arc<dyn CoreClient>,
    /// Set when the core client is the plain in-memory one.
    pub memory: Option<Arc<InMemoryCoreClient>>,
    pub api: Arc<InMemoryApiClient>,
    pub definition: DatasetDefinition,
    pub providers: Providers,
}

impl Harness {
    pub async fn new(max_part_size: u64) -> Self {
        let memory = Arc::new(InMemoryCoreClient::new());
        Self::build(max_part_size, memory.clone(), Some(memory)).await
    }

    pub async fn with_core(max_part_size: u64, core: Arc<dyn CoreClient>) -> Self {
        Self::build(max_part_size, core, None).await
    }

    async fn build(
        max_part_size: u64,
        core: Arc<dyn CoreClient>,
        memory: Option<Arc<InMemoryCoreClient>>,
    ) -> Self {
        let temp = TempDir::new().unwrap();
        let source = temp.path().join("source");
        std::fs::create_dir_all(&source).unwrap();

        let identity = DeviceIdentity {
            user: Uuid::new_v4(),
            device: Uuid::new_v4(),
            node: Uuid::new_v4(),
        };
        let secret = Arc::new(DeviceSecret::generate(identity.user, identity.device));
        let encoder: Arc<dyn Encoder> = Arc::new(XChaChaEncoder);
        let derivation = DerivationConfig::default();

        let api = Arc::new(InMemoryApiClient::new(MetadataCrateReader::new(
            Arc::clone(&core),
            Arc::clone(&secret),
            derivation.clone(),
            Arc::clone(&encoder),
        )));
        let definition = DatasetDefinition {
            id: Uuid::new_v4(),
            info: "test".to_string(),
            device: identity.device,
            redundant_copies: 2,
            created: Utc::now(),
        };
        api.put_definition(definition.clone()).await;

        let api_client: Arc<dyn ApiClient> = api.clone();
        let providers = Providers {
            identity,
            secret,
            derivation,
            extractor: MetadataExtractor::new(ChecksumAlgorithm::Sha256, Compression::default()),
            encoder,
            staging: FileStaging::new(temp.path().join("staging")).unwrap(),
            max_part_size,
            clients: Arc::new(StaticClientProvider::new(api_client, Arc::clone(&core))),
            backup_tracker: Arc::new(DefaultBackupTracker::new()),
            recovery_tracker: Arc::new(DefaultRecoveryTracker::new()),
        };

        Self {
            temp,
            source,
            core,
            memory,
            api,
            definition,
            providers,
        }
    }

    pub fn push_count(&self) -> usize {
        self.memory.as_ref().map(|m| m.push_count()).unwrap_or_default()
    }

    pub fn write(&self, relative: &str, bytes: &[u8]) -> PathBuf {
        let path = self.source.join(relative);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, bytes).unwrap();
        path
    }

    pub fn staged_files(&self) -> Vec<PathBuf> {
        self.providers.staging.staged_files().unwrap()
    }

    pub fn restore_dir(&self) -> PathBuf {
        self.temp.path().join("restore")
    }

    /// Where `original` lands when recovered under [`Self::restore_dir`]
    /// with the default structure kept.
    pub fn restored(&self, original: &Path) -> PathBuf {
        let relative: PathBuf = original
            .components()
            .filter(|c| matches!(c, std::path::Component::Normal(_)))
            .collect();
        self.restore_dir().join(relative)
    }
}

/// Deterministic bytes that zstd cannot shrink much.
pub fn noise(len: usize, seed: u64) -> Vec<u8> {
    let mut state = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
    (0..len)
        .map(|_| {
            state = state
                .wrapping_mul(6364136223846793005)
                .wrapping_add(1442695040888963407);
            (state >> 33) as u8
        })
        .collect()
}

pub fn set_mode(path: &Path, mode: u32) {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).unwrap();
}
