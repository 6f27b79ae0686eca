use std::collections::BTreeMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::compression::CompressionAlgorithm;
use crate::model::{
    CreateDatasetEntry, DatasetDefinition, DatasetMetadata, EntityMetadata, FilesystemMetadata,
    Manifest, MetadataLookup, OperationId, SourceEntity,
};
use crate::parts::{StagedPart, partition_and_stage};
use crate::providers::Providers;
use crate::remote::CoreClient;
use crate::specification::Specification;
use crate::state::BackupState;
use crate::{Error, Result};

/// Where the entities of a backup come from.
#[derive(Debug, Clone)]
pub enum BackupSource {
    /// Discover entities by walking the rules' directories.
    Specification(Specification),
    /// Back up exactly these paths.
    Entities(Vec<PathBuf>),
    /// Continue an interrupted backup from its persisted state.
    Resumed(BackupState),
}

#[derive(Debug, Clone)]
pub struct BackupRequest {
    pub definition: Uuid,
    pub source: BackupSource,
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupResult {
    pub operation: OperationId,
    pub entry: Uuid,
    pub metadata_crate: Uuid,
    pub entities_discovered: u64,
    pub entities_unmatched: u64,
    pub entities_collected: u64,
    pub entities_processed: u64,
    pub entities_failed: u64,
    pub crates_pushed: u64,
    pub bytes_read: u64,
    pub bytes_pushed: u64,
}

#[derive(Default)]
pub struct BackupOptions<'a> {
    pub cancel: Option<&'a CancellationToken>,
}

pub async fn run_backup(
    providers: &Providers,
    operation: OperationId,
    request: BackupRequest,
) -> Result<BackupResult> {
    run_backup_with(providers, operation, request, BackupOptions::default()).await
}

pub async fn run_backup_with(
    providers: &Providers,
    operation: OperationId,
    request: BackupRequest,
    options: BackupOptions<'_>,
) -> Result<BackupResult> {
    let result = backup(providers, operation, request, &options).await;
    match &result {
        Ok(_) => providers.backup_tracker.completed(operation),
        Err(e) => {
            error!(
                event = "backup.failed",
                operation = %operation,
                error = %e,
                "backup.failed"
            );
            providers
                .backup_tracker
                .failure_encountered(operation, &e.to_string());
        }
    }
    result
}

fn check_cancelled(options: &BackupOptions<'_>) -> Result<()> {
    if let Some(cancel) = options.cancel
        && cancel.is_cancelled()
    {
        return Err(Error::Cancelled);
    }
    Ok(())
}

async fn backup(
    providers: &Providers,
    operation: OperationId,
    request: BackupRequest,
    options: &BackupOptions<'_>,
) -> Result<BackupResult> {
    let tracker = providers.backup_tracker.as_ref();
    let api = providers.clients.api()?;
    let core = providers.clients.core()?;

    let definition = api.dataset_definition(request.definition).await?;
    let max_part_size = providers.effective_max_part_size();
    debug!(
        event = "backup.prepare",
        operation = %operation,
        definition = %definition.id,
        redundant_copies = definition.redundant_copies,
        max_part_size,
        "backup.prepare"
    );

    let latest_entry = api.latest_entry(definition.id, None).await?;
    let latest_metadata = match &latest_entry {
        Some(entry) => api.dataset_metadata(entry).await?,
        None => DatasetMetadata::empty(),
    };

    let mut result = BackupResult {
        operation,
        ..BackupResult::default()
    };

    // Stage 1: discovery.
    let phase_started = Instant::now();
    debug!(event = "phase.start", phase = "discovery", "phase.start");

    let (resumed, paths) = match request.source {
        BackupSource::Specification(specification) => {
            tracker.started(BackupState::start(operation, definition.id));
            let discovered = specification.discover()?;
            let unmatched: Vec<String> = discovered
                .unmatched
                .iter()
                .map(|u| format!("{} ({})", u.rule, u.reason))
                .collect();
            for rule in &unmatched {
                warn!(
                    event = "backup.rule_unmatched",
                    operation = %operation,
                    rule = %rule,
                    "backup.rule_unmatched"
                );
            }
            result.entities_unmatched = unmatched.len() as u64;
            tracker.specification_unmatched(operation, unmatched);
            (None, discovered.entities.into_iter().collect::<Vec<_>>())
        }
        BackupSource::Entities(entities) => {
            tracker.started(BackupState::start(operation, definition.id));
            (None, entities)
        }
        BackupSource::Resumed(state) => {
            if state.is_completed() {
                return Err(Error::OperationAlreadyCompleted { operation });
            }
            let remaining: Vec<PathBuf> = state
                .remaining_entities()
                .into_iter()
                .map(|entity| entity.path)
                .collect();
            tracker.started(state.clone());
            (Some(state), remaining)
        }
    };

    for path in &paths {
        check_cancelled(options)?;
        if resumed.is_none() {
            tracker.entity_discovered(operation, path);
        }
    }
    result.entities_discovered = paths.len() as u64;

    debug!(
        event = "phase.finish",
        phase = "discovery",
        duration_ms = phase_started.elapsed().as_millis() as u64,
        entities = result.entities_discovered,
        unmatched = result.entities_unmatched,
        resumed = resumed.is_some(),
        "phase.finish"
    );

    // Stage 2: collection.
    let phase_started = Instant::now();
    debug!(event = "phase.start", phase = "collection", "phase.start");

    let mut lookup = MetadataLookup::new(&latest_metadata, api.as_ref());
    let mut collected: Vec<SourceEntity> = Vec::new();
    for path in &paths {
        check_cancelled(options)?;
        tracker.entity_examined(operation, path);

        let existing = lookup.collect(path).await?;
        let current = match providers.extractor.extract(path, existing.as_ref()) {
            Ok(current) => current,
            Err(e) if !e.is_fatal() => {
                warn!(
                    event = "backup.entity_skipped",
                    operation = %operation,
                    path = %path.display(),
                    error = %e,
                    "backup.entity_skipped"
                );
                tracker.entity_failed(operation, path, &e.to_string());
                result.entities_failed += 1;
                continue;
            }
            Err(e) => return Err(e),
        };

        let entity = SourceEntity {
            path: path.clone(),
            existing_metadata: existing,
            current_metadata: current,
        };
        if !entity.has_changed() {
            continue;
        }
        tracker.entity_collected(operation, &entity);
        collected.push(entity);
    }
    result.entities_collected = collected.len() as u64;

    debug!(
        event = "phase.finish",
        phase = "collection",
        duration_ms = phase_started.elapsed().as_millis() as u64,
        examined = paths.len() as u64,
        collected = result.entities_collected,
        "phase.finish"
    );

    // Stage 3: processing.
    let phase_started = Instant::now();
    debug!(event = "phase.start", phase = "processing", "phase.start");

    let mut content_changed: BTreeMap<PathBuf, EntityMetadata> = BTreeMap::new();
    let mut metadata_changed: BTreeMap<PathBuf, EntityMetadata> = BTreeMap::new();
    if let Some(state) = &resumed {
        for (path, processed) in &state.entities.processed {
            if processed.content_changed {
                content_changed.insert(path.clone(), processed.metadata.clone());
            } else {
                metadata_changed.insert(path.clone(), processed.metadata.clone());
            }
        }
    }

    let processor = EntityProcessor {
        providers,
        core: core.as_ref(),
        definition: &definition,
        operation,
        max_part_size,
    };
    for entity in &collected {
        check_cancelled(options)?;

        let content = entity.has_content_changed();
        let processed = if content {
            processor.process_content(entity, options, &mut result).await
        } else {
            Ok(entity.current_metadata.clone())
        };

        match processed {
            Ok(metadata) => {
                tracker.entity_processed(operation, &entity.path, &metadata, content);
                result.entities_processed += 1;
                if content {
                    content_changed.insert(entity.path.clone(), metadata);
                } else {
                    metadata_changed.insert(entity.path.clone(), metadata);
                }
            }
            Err(e) if !e.is_fatal() => {
                warn!(
                    event = "backup.entity_failed",
                    operation = %operation,
                    path = %entity.path.display(),
                    error = %e,
                    "backup.entity_failed"
                );
                tracker.entity_failed(operation, &entity.path, &e.to_string());
                result.entities_failed += 1;
            }
            Err(e) => return Err(e),
        }
    }

    debug!(
        event = "phase.finish",
        phase = "processing",
        duration_ms = phase_started.elapsed().as_millis() as u64,
        processed = result.entities_processed,
        failed = result.entities_failed,
        crates_pushed = result.crates_pushed,
        bytes_read = result.bytes_read,
        bytes_pushed = result.bytes_pushed,
        "phase.finish"
    );

    // Stage 4: metadata collection.
    check_cancelled(options)?;
    let changes: Vec<PathBuf> = content_changed
        .keys()
        .chain(metadata_changed.keys())
        .cloned()
        .collect();
    let filesystem = match &latest_entry {
        Some(entry) => latest_metadata.filesystem.updated(changes, entry.id),
        None => FilesystemMetadata::new(changes),
    };
    let metadata = DatasetMetadata {
        content_changed,
        metadata_changed,
        filesystem,
    };
    tracker.metadata_collected(operation);

    // Stage 5: metadata push.
    check_cancelled(options)?;
    let phase_started = Instant::now();
    debug!(event = "phase.start", phase = "metadata_push", "phase.start");

    let metadata_crate = Uuid::new_v4();
    let secret = providers
        .secret
        .to_metadata_secret(metadata_crate, &providers.derivation)?;
    let bytes = metadata.to_crate_bytes(providers.encoder.as_ref(), &secret)?;
    let manifest = processor.manifest(metadata_crate, bytes.len() as u64);
    let metadata_bytes = bytes.len() as u64;
    core.push(manifest, bytes).await.map_err(|e| {
        error!(
            event = "io.core.push_failed",
            crate_id = %metadata_crate,
            kind = "metadata",
            error = %e,
            "io.core.push_failed"
        );
        e
    })?;
    result.crates_pushed += 1;
    result.bytes_pushed += metadata_bytes;

    let entry = api
        .create_dataset_entry(CreateDatasetEntry {
            definition: definition.id,
            device: providers.identity.device,
            data: metadata.data_crates(),
            metadata: metadata_crate,
        })
        .await?;
    tracker.metadata_pushed(operation, entry);

    result.entry = entry;
    result.metadata_crate = metadata_crate;

    debug!(
        event = "phase.finish",
        phase = "metadata_push",
        duration_ms = phase_started.elapsed().as_millis() as u64,
        entry = %entry,
        metadata_crate = %metadata_crate,
        metadata_bytes,
        "phase.finish"
    );

    Ok(result)
}

struct EntityProcessor<'a> {
    providers: &'a Providers,
    core: &'a dyn CoreClient,
    definition: &'a DatasetDefinition,
    operation: OperationId,
    max_part_size: u64,
}

impl EntityProcessor<'_> {
    fn manifest(&self, crate_id: Uuid, size: u64) -> Manifest {
        Manifest {
            crate_id,
            size,
            copies: self.definition.redundant_copies,
            origin: self.providers.identity.node,
            source: self.providers.identity.node,
        }
    }

    /// Compresses, splits, encrypts and pushes one file. Staged parts are
    /// removed whatever the outcome.
    async fn process_content(
        &self,
        entity: &SourceEntity,
        options: &BackupOptions<'_>,
        result: &mut BackupResult,
    ) -> Result<EntityMetadata> {
        let EntityMetadata::File(file) = &entity.current_metadata else {
            return Ok(entity.current_metadata.clone());
        };
        if entity.path.to_str().is_none() {
            return Err(Error::NonUtf8Path {
                path: entity.path.clone(),
            });
        }

        let staging = &self.providers.staging;
        let algorithm = CompressionAlgorithm::from_str(&file.compression)?;
        let source = File::open(&entity.path)?;
        let compressed = self
            .providers
            .extractor
            .compression
            .compress(algorithm, source)?;
        let parts = partition_and_stage(compressed, staging, self.max_part_size, &entity.path)?;

        self.providers.backup_tracker.entity_processing_started(
            self.operation,
            &entity.path,
            parts.len() as u32,
        );

        let pushed = self.push_parts(&entity.path, &parts, options, result).await;
        staging.discard_all(parts.iter().map(|p| &p.staged));

        let mut processed = file.clone();
        processed.crates = pushed?;
        result.bytes_read += file.size;
        Ok(EntityMetadata::File(processed))
    }

    async fn push_parts(
        &self,
        path: &Path,
        parts: &[StagedPart],
        options: &BackupOptions<'_>,
        result: &mut BackupResult,
    ) -> Result<BTreeMap<String, Uuid>> {
        let mut crates = BTreeMap::new();
        for part in parts {
            check_cancelled(options)?;

            let plaintext = std::fs::read(&part.staged)?;
            let secret = self
                .providers
                .secret
                .to_file_secret(&part.part_path, &self.providers.derivation)?;
            let ciphertext = self.providers.encoder.encrypt(
                secret.key(),
                secret.iv(),
                part.part_path.as_bytes(),
                &plaintext,
            )?;

            let crate_id = Uuid::new_v4();
            let size = ciphertext.len() as u64;
            self.core
                .push(self.manifest(crate_id, size), ciphertext)
                .await
                .map_err(|e| {
                    error!(
                        event = "io.core.push_failed",
                        crate_id = %crate_id,
                        part = %part.part_path,
                        kind = "data",
                        error = %e,
                        "io.core.push_failed"
                    );
                    e
                })?;

            result.crates_pushed += 1;
            result.bytes_pushed += size;
            crates.insert(part.part_path.clone(), crate_id);
            self.providers
                .backup_tracker
                .entity_part_processed(self.operation, path);
        }
        Ok(crates)
    }
}
