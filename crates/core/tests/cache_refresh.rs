mod common;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use common::Harness;
use cratekeeper_core::model::{CreateDatasetEntry, DatasetDefinition, DatasetEntry, DatasetMetadata};
use cratekeeper_core::remote::{
    ApiClient, BoxFuture, ClientProvider, InMemoryApiClient, StaticClientProvider,
};
use cratekeeper_core::{
    BackupRequest, BackupSource, CacheRefreshConfig, CacheRefreshHandler, DatasetsCache, Error,
    RefreshTarget, run_backup,
};
use uuid::Uuid;

/// Serves everything from memory except the latest entry, which always fails.
struct LatestEntryUnavailable(Arc<InMemoryApiClient>);

impl ApiClient for LatestEntryUnavailable {
    fn id(&self) -> &str {
        "test.latest_unavailable"
    }

    fn dataset_definitions<'a>(&'a self) -> BoxFuture<'a, Vec<DatasetDefinition>> {
        self.0.dataset_definitions()
    }

    fn dataset_definition<'a>(&'a self, definition: Uuid) -> BoxFuture<'a, DatasetDefinition> {
        self.0.dataset_definition(definition)
    }

    fn dataset_entries<'a>(&'a self, definition: Uuid) -> BoxFuture<'a, Vec<DatasetEntry>> {
        self.0.dataset_entries(definition)
    }

    fn dataset_entry<'a>(&'a self, entry: Uuid) -> BoxFuture<'a, DatasetEntry> {
        self.0.dataset_entry(entry)
    }

    fn latest_entry<'a>(
        &'a self,
        _definition: Uuid,
        _until: Option<DateTime<Utc>>,
    ) -> BoxFuture<'a, Option<DatasetEntry>> {
        Box::pin(async { Err(Error::remote("latest entry unavailable")) })
    }

    fn create_dataset_entry<'a>(&'a self, request: CreateDatasetEntry) -> BoxFuture<'a, Uuid> {
        self.0.create_dataset_entry(request)
    }

    fn dataset_metadata<'a>(&'a self, entry: &'a DatasetEntry) -> BoxFuture<'a, DatasetMetadata> {
        self.0.dataset_metadata(entry)
    }
}

fn copies(targets: &[RefreshTarget], target: RefreshTarget) -> usize {
    targets.iter().filter(|t| **t == target).count()
}

fn handler(h: &Harness, config: CacheRefreshConfig) -> CacheRefreshHandler {
    let clients: Arc<dyn ClientProvider> = Arc::new(StaticClientProvider::new(
        h.api.clone(),
        Arc::clone(&h.core),
    ));
    CacheRefreshHandler::new(config, clients, Arc::new(DatasetsCache::default()))
}

fn slow_config() -> CacheRefreshConfig {
    CacheRefreshConfig::new(
        Duration::from_secs(60),
        Duration::from_secs(120),
        Duration::from_secs(600),
    )
    .unwrap()
}

#[tokio::test]
async fn refreshing_definitions_enqueues_their_entries() {
    let h = Harness::new(1024).await;
    let handler = handler(&h, slow_config());
    let definition = h.definition.id;

    handler
        .refresh_now(RefreshTarget::AllDatasetDefinitions)
        .await
        .unwrap();

    let cache = handler.cache();
    assert_eq!(cache.definitions(), vec![h.definition.clone()]);
    assert_eq!(cache.definition(definition), Some(h.definition.clone()));

    let (active, pending) = handler.queued();
    assert_eq!(
        active,
        vec![
            RefreshTarget::LatestDatasetEntry { definition },
            RefreshTarget::AllDatasetEntries { definition },
        ]
    );
    assert_eq!(pending, vec![RefreshTarget::AllDatasetDefinitions]);

    // Already tracked targets are not duplicated.
    handler
        .refresh_now(RefreshTarget::AllDatasetDefinitions)
        .await
        .unwrap();
    assert_eq!(handler.queued().0.len(), 2);

    let stats = handler.stats();
    let definitions = &stats[&RefreshTarget::AllDatasetDefinitions];
    assert_eq!(definitions.successes, 2);
    assert_eq!(definitions.failures, 0);
    assert!(definitions.last_success.is_some());
}

#[tokio::test]
async fn failed_refresh_is_recorded_in_stats() {
    let h = Harness::new(1024).await;
    let handler = handler(&h, slow_config());
    let target = RefreshTarget::IndividualDatasetEntry {
        entry: Uuid::new_v4(),
    };

    assert!(handler.refresh_now(target).await.is_err());

    let stats = handler.stats();
    assert_eq!(stats[&target].failures, 1);
    assert_eq!(stats[&target].successes, 0);
    assert!(stats[&target].last_error.is_some());
    // Untracked targets stay untracked.
    let (active, pending) = handler.queued();
    assert!(!active.contains(&target));
    assert!(!pending.contains(&target));
}

#[tokio::test]
async fn background_loop_populates_the_cache() {
    let h = Harness::new(1024).await;
    let file = h.write("tracked.txt", b"tracked");
    let backup = run_backup(
        &h.providers,
        Uuid::new_v4(),
        BackupRequest {
            definition: h.definition.id,
            source: BackupSource::Entities(vec![file]),
        },
    )
    .await
    .unwrap();

    let config = CacheRefreshConfig::new(
        Duration::from_millis(5),
        Duration::from_millis(10),
        Duration::from_millis(50),
    )
    .unwrap();
    let handler = handler(&h, config);
    handler.start();
    // Second start is a no-op.
    handler.start();

    let cache = handler.cache();
    let definition = h.definition.id;
    let populated = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let latest = cache.latest_entry(definition).flatten();
            let entries = cache.entries(definition).unwrap_or_default();
            if latest.is_some() && !entries.is_empty() {
                return (latest, entries);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    handler.stop().await;

    assert_eq!(populated.0.map(|e| e.id), Some(backup.entry));
    assert_eq!(populated.1.len(), 1);
    assert!(handler.stats()[&RefreshTarget::AllDatasetDefinitions].successes >= 1);
}

#[tokio::test]
async fn failing_target_is_queued_once_across_cycles() {
    let h = Harness::new(1024).await;
    let clients: Arc<dyn ClientProvider> = Arc::new(StaticClientProvider::new(
        Arc::new(LatestEntryUnavailable(h.api.clone())),
        Arc::clone(&h.core),
    ));
    let config = CacheRefreshConfig::new(
        Duration::from_millis(1),
        Duration::from_millis(2),
        Duration::from_millis(20),
    )
    .unwrap();
    let handler = CacheRefreshHandler::new(config, clients, Arc::new(DatasetsCache::default()));
    let latest = RefreshTarget::LatestDatasetEntry {
        definition: h.definition.id,
    };

    handler.start();
    let deadline = tokio::time::Instant::now() + Duration::from_millis(500);
    while tokio::time::Instant::now() < deadline {
        let (active, pending) = handler.queued();
        let all: Vec<RefreshTarget> = active.into_iter().chain(pending).collect();
        assert!(copies(&all, latest) <= 1, "{all:?}");
        assert!(copies(&all, RefreshTarget::AllDatasetDefinitions) <= 1, "{all:?}");
        assert!(all.len() <= 3, "{all:?}");
        tokio::time::sleep(Duration::from_millis(3)).await;
    }
    handler.stop().await;

    // Stopping mid-cycle keeps the failing target queued.
    let (active, pending) = handler.queued();
    assert_eq!(copies(&active, latest) + copies(&pending, latest), 1);
    let stats = handler.stats();
    assert!(stats[&latest].failures >= 2);
    assert_eq!(stats[&latest].successes, 0);
}

#[test]
fn config_from_settings_validates_ordering() {
    let mut settings = cratekeeper_core::CacheRefreshSettings::default();
    assert!(CacheRefreshConfig::from_settings(&settings).is_ok());

    settings.active_interval_ms = settings.pending_interval_ms;
    assert!(CacheRefreshConfig::from_settings(&settings).is_err());
}
