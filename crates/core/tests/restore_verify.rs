mod common;

use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::{Harness, noise, set_mode};
use cratekeeper_core::model::{CrateId, Destination, Manifest};
use cratekeeper_core::remote::{BoxFuture, CoreClient, InMemoryCoreClient};
use cratekeeper_core::{
    BackupRequest, BackupSource, Error, RecoveryRequest, RecoverySource, RecoveryTracker,
    Specification, part_index, run_backup, run_recovery,
};
use regex::Regex;
use uuid::Uuid;

/// Answers earlier pulls later, so concurrent pulls finish in reverse.
struct ReversingCoreClient {
    inner: InMemoryCoreClient,
    pulls: AtomicU64,
    finished: Mutex<Vec<CrateId>>,
}

impl ReversingCoreClient {
    fn new() -> Self {
        Self {
            inner: InMemoryCoreClient::new(),
            pulls: AtomicU64::new(0),
            finished: Mutex::new(Vec::new()),
        }
    }
}

impl CoreClient for ReversingCoreClient {
    fn id(&self) -> &str {
        "test.reversing"
    }

    fn push<'a>(&'a self, manifest: Manifest, content: Vec<u8>) -> BoxFuture<'a, ()> {
        self.inner.push(manifest, content)
    }

    fn pull<'a>(&'a self, crate_id: CrateId) -> BoxFuture<'a, Option<Vec<u8>>> {
        Box::pin(async move {
            let call = self.pulls.fetch_add(1, Ordering::SeqCst);
            let delay = 20u64.saturating_sub(call) * 10;
            tokio::time::sleep(Duration::from_millis(delay)).await;
            let bytes = self.inner.pull(crate_id).await;
            self.finished.lock().unwrap().push(crate_id);
            bytes
        })
    }
}

fn mtime(path: &Path) -> i64 {
    std::fs::symlink_metadata(path).unwrap().mtime()
}

fn mode(path: &Path) -> u32 {
    std::fs::symlink_metadata(path).unwrap().permissions().mode() & 0o777
}

async fn backup_everything(h: &Harness) -> Uuid {
    let spec = Specification::parse(&format!("+ {} **", h.source.display())).unwrap();
    run_backup(
        &h.providers,
        Uuid::new_v4(),
        BackupRequest {
            definition: h.definition.id,
            source: BackupSource::Specification(spec),
        },
    )
    .await
    .unwrap()
    .entry
}

fn restore_request(h: &Harness, query: Option<Regex>) -> RecoveryRequest {
    RecoveryRequest {
        source: RecoverySource::Latest {
            definition: h.definition.id,
            until: None,
        },
        destination: Destination::Directory {
            path: h.restore_dir(),
            keep_default_structure: true,
        },
        query,
    }
}

#[tokio::test]
async fn recovery_restores_content_links_and_attributes() {
    let h = Harness::new(16).await;
    let data = h.write("data.bin", &noise(1000, 7));
    let empty = h.write("empty.txt", b"");
    let nested = h.write("nested/deeper/notes.txt", b"nested notes");
    let private = h.write("private.txt", b"keep out");
    set_mode(&private, 0o640);
    let link = h.source.join("data.link");
    std::os::unix::fs::symlink("data.bin", &link).unwrap();

    let entry = backup_everything(&h).await;

    let operation = Uuid::new_v4();
    let result = run_recovery(&h.providers, operation, restore_request(&h, None))
        .await
        .unwrap();
    assert_eq!(result.entry, entry);
    assert_eq!(result.entities_failed, 0);
    // Root, nested, nested/deeper and five entities inside.
    assert_eq!(result.entities_examined, 8);
    assert_eq!(result.entities_processed, 8);
    assert!(result.crates_pulled > 60);

    for original in [&data, &empty, &nested, &private] {
        let restored = h.restored(original);
        assert_eq!(
            std::fs::read(&restored).unwrap(),
            std::fs::read(original).unwrap(),
            "{}",
            original.display()
        );
        assert_eq!(mode(&restored), mode(original), "{}", original.display());
        assert_eq!(mtime(&restored), mtime(original), "{}", original.display());
    }

    let restored_link = h.restored(&link);
    assert_eq!(
        std::fs::read_link(&restored_link).unwrap(),
        PathBuf::from("data.bin")
    );
    assert_eq!(mtime(&restored_link), mtime(&link));

    let restored_dir = h.restored(&h.source.join("nested"));
    assert_eq!(mtime(&restored_dir), mtime(&h.source.join("nested")));
    assert_eq!(mode(&h.restored(&private)), 0o640);

    let state = h.providers.recovery_tracker.state(operation).unwrap();
    assert!(state.is_completed());
    assert_eq!(state.entry, Some(entry));
    assert_eq!(state.entities.metadata_applied.len(), 8);
    assert!(h.staged_files().is_empty());

    // Everything already matches.
    let again = run_recovery(&h.providers, Uuid::new_v4(), restore_request(&h, None))
        .await
        .unwrap();
    assert_eq!(again.entities_examined, 8);
    assert_eq!(again.entities_collected, 0);
    assert_eq!(again.crates_pulled, 0);
}

#[tokio::test]
async fn recovery_replaces_modified_content() {
    let h = Harness::new(64).await;
    let file = h.write("letter.txt", b"dear reader");
    backup_everything(&h).await;

    run_recovery(&h.providers, Uuid::new_v4(), restore_request(&h, None))
        .await
        .unwrap();
    let restored = h.restored(&file);
    std::fs::write(&restored, b"tampered with").unwrap();

    let result = run_recovery(&h.providers, Uuid::new_v4(), restore_request(&h, None))
        .await
        .unwrap();
    assert!(result.entities_collected >= 1);
    assert_eq!(std::fs::read(&restored).unwrap(), b"dear reader");
}

#[tokio::test]
async fn recovery_query_limits_entities() {
    let h = Harness::new(1024).await;
    let wanted = h.write("reports/2024.csv", b"a,b,c");
    let other = h.write("reports/notes.txt", b"not this one");
    backup_everything(&h).await;

    let query = Regex::new(r"\.csv$").unwrap();
    let result = run_recovery(&h.providers, Uuid::new_v4(), restore_request(&h, Some(query)))
        .await
        .unwrap();
    assert_eq!(result.entities_examined, 1);
    assert_eq!(result.entities_processed, 1);
    assert_eq!(std::fs::read(h.restored(&wanted)).unwrap(), b"a,b,c");
    assert!(!h.restored(&other).exists());
}

#[tokio::test]
async fn recovery_from_specific_entry_uses_that_version() {
    let h = Harness::new(1024).await;
    let file = h.write("draft.txt", b"version one");
    let first = backup_everything(&h).await;

    std::fs::write(&file, b"version two, longer").unwrap();
    backup_everything(&h).await;

    let request = RecoveryRequest {
        source: RecoverySource::Entry(first),
        destination: Destination::Directory {
            path: h.restore_dir(),
            keep_default_structure: false,
        },
        query: Some(Regex::new("^draft").unwrap()),
    };
    let result = run_recovery(&h.providers, Uuid::new_v4(), request)
        .await
        .unwrap();
    assert_eq!(result.entry, first);
    assert_eq!(
        std::fs::read(h.restore_dir().join("draft.txt")).unwrap(),
        b"version one"
    );
}

#[tokio::test]
async fn parts_finishing_out_of_order_still_restore_the_file() {
    use cratekeeper_core::remote::ApiClient;

    let core = Arc::new(ReversingCoreClient::new());
    let h = Harness::with_core(48, core.clone()).await;
    let content = noise(300, 13);
    let file = h.write("shuffled.bin", &content);
    backup_everything(&h).await;

    let entry = h.api.latest_entry(h.definition.id, None).await.unwrap().unwrap();
    let metadata = h.api.dataset_metadata(&entry).await.unwrap();
    let crates = &metadata.content_changed[&file].as_file().unwrap().crates;
    assert!(crates.len() >= 3);
    let index_of = |id: &CrateId| {
        crates
            .iter()
            .find(|(_, c)| *c == id)
            .and_then(|(part, _)| part_index(part))
    };

    core.finished.lock().unwrap().clear();
    let result = run_recovery(&h.providers, Uuid::new_v4(), restore_request(&h, None))
        .await
        .unwrap();
    assert_eq!(result.entities_failed, 0);

    let finished: Vec<u32> = core
        .finished
        .lock()
        .unwrap()
        .iter()
        .filter_map(index_of)
        .collect();
    assert_eq!(finished.len(), crates.len());
    let mut sorted = finished.clone();
    sorted.sort();
    assert_ne!(finished, sorted, "pulls finished in index order");

    assert_eq!(std::fs::read(h.restored(&file)).unwrap(), content);
    assert!(h.staged_files().is_empty());
}

#[tokio::test]
async fn recovery_without_entries_fails() {
    let h = Harness::new(1024).await;
    let err = run_recovery(&h.providers, Uuid::new_v4(), restore_request(&h, None))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Remote { .. }), "{err}");
}

#[tokio::test]
async fn missing_crate_aborts_recovery_and_cleans_staging() {
    use cratekeeper_core::remote::ApiClient;

    let h = Harness::new(4).await;
    let lost = h.write("lost.bin", &noise(64, 5));
    backup_everything(&h).await;

    let memory = h.memory.as_ref().unwrap();
    let entry = h.api.latest_entry(h.definition.id, None).await.unwrap().unwrap();
    let metadata = h.api.dataset_metadata(&entry).await.unwrap();
    let crates = &metadata.content_changed[&lost].as_file().unwrap().crates;
    assert!(crates.len() > 2);
    // Parts pulled alongside the dropped one have been staged by the time it is missed.
    let dropped = crates.values().last().unwrap();
    memory.remove(*dropped).await.unwrap();

    let operation = Uuid::new_v4();
    let err = run_recovery(&h.providers, operation, restore_request(&h, None))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::MissingCrate { .. }), "{err}");
    assert!(!h.restored(&lost).exists());
    assert!(h.staged_files().is_empty());

    let state = h.providers.recovery_tracker.state(operation).unwrap();
    assert!(!state.is_completed());
    assert_eq!(state.failures.len(), 1);
}
