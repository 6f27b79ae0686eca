use std::collections::BTreeMap;
use std::fs::{DirBuilder, File};
use std::io::Cursor;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::compression::CompressionAlgorithm;
use crate::model::{
    DatasetEntry, Destination, EntityMetadata, FileMetadata, MetadataLookup, OperationId,
    TargetEntity,
};
use crate::parts::{PartSource, merged, part_index};
use crate::providers::Providers;
use crate::remote::CoreClient;
use crate::state::RecoveryState;
use crate::{Error, Result, metadata};

/// Directories created during recovery start out private to the owner; their
/// recorded permissions are applied at the end.
const RECOVERED_DIRECTORY_MODE: u32 = 0o700;

/// Crates of one file pulled at the same time.
const PULL_CONCURRENCY: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoverySource {
    /// Latest entry of the definition, optionally no newer than `until`.
    Latest {
        definition: Uuid,
        until: Option<DateTime<Utc>>,
    },
    Entry(Uuid),
}

#[derive(Debug, Clone)]
pub struct RecoveryRequest {
    pub source: RecoverySource,
    pub destination: Destination,
    /// Restricts recovery to entities whose absolute path or file name match.
    pub query: Option<Regex>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryResult {
    pub operation: OperationId,
    pub definition: Uuid,
    pub entry: Uuid,
    pub entities_examined: u64,
    pub entities_collected: u64,
    pub entities_processed: u64,
    pub entities_failed: u64,
    pub crates_pulled: u64,
    pub bytes_written: u64,
}

#[derive(Default)]
pub struct RecoveryOptions<'a> {
    pub cancel: Option<&'a CancellationToken>,
}

pub async fn run_recovery(
    providers: &Providers,
    operation: OperationId,
    request: RecoveryRequest,
) -> Result<RecoveryResult> {
    run_recovery_with(providers, operation, request, RecoveryOptions::default()).await
}

pub async fn run_recovery_with(
    providers: &Providers,
    operation: OperationId,
    request: RecoveryRequest,
    options: RecoveryOptions<'_>,
) -> Result<RecoveryResult> {
    let result = recover(providers, operation, request, &options).await;
    match &result {
        Ok(_) => providers.recovery_tracker.completed(operation),
        Err(e) => {
            error!(
                event = "recovery.failed",
                operation = %operation,
                error = %e,
                "recovery.failed"
            );
            providers
                .recovery_tracker
                .failure_encountered(operation, &e.to_string());
        }
    }
    result
}

fn check_cancelled(options: &RecoveryOptions<'_>) -> Result<()> {
    if let Some(cancel) = options.cancel
        && cancel.is_cancelled()
    {
        return Err(Error::Cancelled);
    }
    Ok(())
}

fn matches_query(query: Option<&Regex>, path: &Path) -> bool {
    let Some(query) = query else {
        return true;
    };
    let full = path.to_string_lossy();
    if query.is_match(&full) {
        return true;
    }
    path.file_name()
        .map(|name| query.is_match(&name.to_string_lossy()))
        .unwrap_or(false)
}

async fn select_entry(providers: &Providers, source: &RecoverySource) -> Result<DatasetEntry> {
    let api = providers.clients.api()?;
    match source {
        RecoverySource::Latest { definition, until } => api
            .latest_entry(*definition, *until)
            .await?
            .ok_or_else(|| Error::remote(format!("no dataset entry found for {definition}"))),
        RecoverySource::Entry(entry) => api.dataset_entry(*entry).await,
    }
}

async fn recover(
    providers: &Providers,
    operation: OperationId,
    request: RecoveryRequest,
    options: &RecoveryOptions<'_>,
) -> Result<RecoveryResult> {
    let tracker = providers.recovery_tracker.as_ref();
    let api = providers.clients.api()?;
    let core = providers.clients.core()?;

    let entry = select_entry(providers, &request.source).await?;
    tracker.started(RecoveryState::start(operation, entry.definition));
    tracker.entry_selected(operation, entry.id);
    debug!(
        event = "recovery.prepare",
        operation = %operation,
        definition = %entry.definition,
        entry = %entry.id,
        query = request.query.as_ref().map(|q| q.as_str()).unwrap_or(""),
        "recovery.prepare"
    );

    let mut result = RecoveryResult {
        operation,
        definition: entry.definition,
        entry: entry.id,
        ..RecoveryResult::default()
    };

    let dataset = api.dataset_metadata(&entry).await?;

    // Collection.
    let phase_started = Instant::now();
    debug!(event = "phase.start", phase = "collection", "phase.start");

    let mut lookup = MetadataLookup::new(&dataset, api.as_ref());
    let mut collected: Vec<TargetEntity> = Vec::new();
    for path in dataset.filesystem.entities.keys() {
        check_cancelled(options)?;
        if !matches_query(request.query.as_ref(), path) {
            continue;
        }
        tracker.entity_examined(operation, path);
        result.entities_examined += 1;

        let target = match collect_target(providers, &mut lookup, path, &request.destination).await
        {
            Ok(target) => target,
            Err(e) if !e.is_fatal() => {
                warn!(
                    event = "recovery.entity_skipped",
                    operation = %operation,
                    path = %path.display(),
                    error = %e,
                    "recovery.entity_skipped"
                );
                tracker.entity_failed(operation, path, &e.to_string());
                result.entities_failed += 1;
                continue;
            }
            Err(e) => return Err(e),
        };
        if !target.has_changed() {
            continue;
        }
        tracker.entity_collected(operation, &target);
        collected.push(target);
    }
    result.entities_collected = collected.len() as u64;

    debug!(
        event = "phase.finish",
        phase = "collection",
        duration_ms = phase_started.elapsed().as_millis() as u64,
        examined = result.entities_examined,
        collected = result.entities_collected,
        "phase.finish"
    );

    // Processing; parents sort before their children.
    let phase_started = Instant::now();
    debug!(event = "phase.start", phase = "processing", "phase.start");

    let processor = TargetProcessor {
        providers,
        core: Arc::clone(&core),
        operation,
    };
    let mut processed: Vec<&TargetEntity> = Vec::new();
    for target in &collected {
        check_cancelled(options)?;
        match processor.process(target, &mut result).await {
            Ok(()) => {
                tracker.entity_processed(operation, &target.path);
                result.entities_processed += 1;
                processed.push(target);
            }
            Err(e) if !e.is_fatal() => {
                warn!(
                    event = "recovery.entity_failed",
                    operation = %operation,
                    path = %target.path.display(),
                    error = %e,
                    "recovery.entity_failed"
                );
                tracker.entity_failed(operation, &target.path, &e.to_string());
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
        crates_pulled = result.crates_pulled,
        bytes_written = result.bytes_written,
        "phase.finish"
    );

    // Metadata application, deepest entities first so that restoring a
    // directory's mtime is not undone by writes into it.
    let phase_started = Instant::now();
    debug!(event = "phase.start", phase = "metadata", "phase.start");

    let mut applied = 0u64;
    for target in processed.iter().rev() {
        check_cancelled(options)?;
        let destination = target.destination_path();
        match metadata::apply(&target.existing_metadata, &destination) {
            Ok(()) => {
                tracker.entity_metadata_applied(operation, &target.path);
                applied += 1;
            }
            Err(e) => {
                warn!(
                    event = "recovery.metadata_failed",
                    operation = %operation,
                    path = %destination.display(),
                    error = %e,
                    "recovery.metadata_failed"
                );
                tracker.entity_failed(operation, &target.path, &e.to_string());
                result.entities_failed += 1;
            }
        }
    }

    debug!(
        event = "phase.finish",
        phase = "metadata",
        duration_ms = phase_started.elapsed().as_millis() as u64,
        applied,
        "phase.finish"
    );

    Ok(result)
}

async fn collect_target(
    providers: &Providers,
    lookup: &mut MetadataLookup<'_>,
    path: &Path,
    destination: &Destination,
) -> Result<TargetEntity> {
    let existing = lookup
        .collect(path)
        .await?
        .ok_or_else(|| Error::MissingMetadata {
            path: path.to_path_buf(),
        })?;
    let destination_path = crate::model::destination_path_for(destination, existing.path());
    let current = providers.extractor.extract_if_exists(&destination_path)?;
    Ok(TargetEntity {
        path: path.to_path_buf(),
        destination: destination.clone(),
        existing_metadata: existing,
        current_metadata: current,
    })
}

struct TargetProcessor<'a> {
    providers: &'a Providers,
    core: Arc<dyn CoreClient>,
    operation: OperationId,
}

impl TargetProcessor<'_> {
    async fn process(&self, target: &TargetEntity, result: &mut RecoveryResult) -> Result<()> {
        let destination = target.destination_path();
        if let Some(parent) = destination.parent() {
            create_private_dirs(parent)?;
        }

        match &target.existing_metadata {
            EntityMetadata::Directory(_) => create_private_dirs(&destination),
            EntityMetadata::File(file) => match &file.link {
                Some(link) => recreate_link(link, &destination),
                None if target.has_content_changed() => {
                    self.restore_content(target, file, &destination, result)
                        .await
                }
                None => Ok(()),
            },
        }
    }

    /// Pulls every crate of `file`, then decrypts, merges and decompresses
    /// them into a staged file that replaces `destination`.
    async fn restore_content(
        &self,
        target: &TargetEntity,
        file: &FileMetadata,
        destination: &Path,
        result: &mut RecoveryResult,
    ) -> Result<()> {
        let expected = expected_parts(file)?;
        self.providers.recovery_tracker.entity_processing_started(
            self.operation,
            &target.path,
            expected.len() as u32,
        );

        let staging = &self.providers.staging;
        let mut pulled: Vec<(u32, String, PathBuf)> = Vec::new();
        let restored: Result<()> = async {
            // Parts are staged in the order their pulls finish; merging
            // restores index order. Returning early aborts the pulls in flight.
            let mut queued = expected.iter();
            let mut in_flight = JoinSet::new();
            loop {
                while in_flight.len() < PULL_CONCURRENCY {
                    let Some((index, part_path, crate_id)) = queued.next() else {
                        break;
                    };
                    let core = Arc::clone(&self.core);
                    let (index, part_path, crate_id) = (*index, part_path.clone(), *crate_id);
                    in_flight.spawn(async move {
                        let bytes = core
                            .pull(crate_id)
                            .await?
                            .ok_or(Error::MissingCrate { crate_id })?;
                        Ok::<_, Error>((index, part_path, bytes))
                    });
                }
                let Some(joined) = in_flight.join_next().await else {
                    break;
                };
                let (index, part_path, bytes) =
                    joined.map_err(|e| Error::remote(format!("crate pull task failed: {e}")))??;
                let staged = staging.create_temporary()?;
                pulled.push((index, part_path, staged.clone()));
                std::fs::write(&staged, &bytes)?;
                result.crates_pulled += 1;
            }

            let output = staging.create_temporary()?;
            let written = self.merge_into(target, file, &pulled, &output);
            match written {
                Ok(written) if written == file.size => {
                    staging.destage(&output, destination)?;
                    result.bytes_written += written;
                    Ok(())
                }
                Ok(written) => {
                    staging.discard(&output);
                    Err(Error::Integrity {
                        message: format!(
                            "recovered size mismatch for {}: expected {} bytes, got {written}",
                            target.path.display(),
                            file.size
                        ),
                    })
                }
                Err(e) => {
                    staging.discard(&output);
                    Err(e)
                }
            }
        }
        .await;

        staging.discard_all(pulled.iter().map(|(_, _, staged)| staged));
        restored
    }

    fn merge_into(
        &self,
        target: &TargetEntity,
        file: &FileMetadata,
        pulled: &[(u32, String, PathBuf)],
        output: &Path,
    ) -> Result<u64> {
        let sources = pulled
            .iter()
            .map(|(index, part_path, staged)| {
                let encoder = self.providers.encoder.clone();
                let secret = self.providers.secret.clone();
                let derivation = self.providers.derivation.clone();
                let part = part_path.clone();
                let staged = staged.clone();
                PartSource::new(*index, part_path.clone(), move || {
                    let ciphertext = std::fs::read(&staged)?;
                    let secret = secret.to_file_secret(&part, &derivation)?;
                    let plaintext = encoder.decrypt(
                        secret.key(),
                        secret.iv(),
                        part.as_bytes(),
                        &ciphertext,
                    )?;
                    Ok(Box::new(Cursor::new(plaintext)) as Box<dyn std::io::Read + Send>)
                })
            })
            .collect();

        let tracker = Arc::clone(&self.providers.recovery_tracker);
        let operation = self.operation;
        let path = target.path.clone();
        let reader = merged(sources, move |_| {
            tracker.entity_part_processed(operation, &path);
        })?;

        let algorithm = CompressionAlgorithm::from_str(&file.compression)?;
        let mut decompressed = self
            .providers
            .extractor
            .compression
            .decompress(algorithm, reader)?;
        let mut out = File::create(output)?;
        let written = std::io::copy(&mut decompressed, &mut out)?;
        out.sync_all()?;
        Ok(written)
    }
}

/// `(index, part path, crate)` triples in part order; indices must be dense.
fn expected_parts(file: &FileMetadata) -> Result<Vec<(u32, String, Uuid)>> {
    let mut by_index: BTreeMap<u32, (String, Uuid)> = BTreeMap::new();
    for (part_path, crate_id) in &file.crates {
        let index = part_index(part_path).ok_or_else(|| Error::Integrity {
            message: format!("invalid part path: {part_path}"),
        })?;
        by_index.insert(index, (part_path.clone(), *crate_id));
    }

    let last = by_index.keys().next_back().copied();
    match last {
        None => Err(Error::Integrity {
            message: format!("no crates recorded for {}", file.path.display()),
        }),
        Some(last) if last as usize + 1 != by_index.len() => Err(Error::Integrity {
            message: format!(
                "missing parts for {}: expected {} but found {}",
                file.path.display(),
                last + 1,
                by_index.len()
            ),
        }),
        Some(_) => Ok(by_index
            .into_iter()
            .map(|(index, (part_path, crate_id))| (index, part_path, crate_id))
            .collect()),
    }
}

fn create_private_dirs(path: &Path) -> Result<()> {
    DirBuilder::new()
        .recursive(true)
        .mode(RECOVERED_DIRECTORY_MODE)
        .create(path)?;
    Ok(())
}

fn recreate_link(link: &Path, destination: &Path) -> Result<()> {
    match std::fs::symlink_metadata(destination) {
        Ok(meta) if meta.is_dir() => {
            return Err(Error::Integrity {
                message: format!(
                    "cannot replace directory with link: {}",
                    destination.display()
                ),
            });
        }
        Ok(_) => std::fs::remove_file(destination)?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    std::os::unix::fs::symlink(link, destination)?;
    Ok(())
}
