//! Splitting a byte stream into bounded parts and stitching parts back together.

use std::collections::VecDeque;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use crate::staging::FileStaging;
use crate::{Error, Result};

const PART_SUFFIX: &str = "__part=";

pub fn part_path(base: &Path, index: u32) -> String {
    format!("{}{PART_SUFFIX}{index}", base.display())
}

/// Extracts `<n>` from a `<path>__part=<n>` name.
pub fn part_index(part_path: &str) -> Option<u32> {
    let (_, index) = part_path.rsplit_once(PART_SUFFIX)?;
    index.parse().ok()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedPart {
    pub index: u32,
    pub part_path: String,
    pub staged: PathBuf,
}

/// Writes `source` into staged files of at most `max_part_size` bytes each.
///
/// An empty source still yields a single (empty) part. On failure every file
/// staged so far is discarded.
pub fn partition_and_stage(
    mut source: impl Read,
    staging: &FileStaging,
    max_part_size: u64,
    base: &Path,
) -> Result<Vec<StagedPart>> {
    if max_part_size == 0 {
        return Err(Error::InvalidConfig {
            message: "max part size must be > 0".to_string(),
        });
    }

    let mut parts: Vec<StagedPart> = Vec::new();
    let result = (|| -> Result<()> {
        loop {
            let index = parts.len() as u32;
            let staged = staging.create_temporary()?;
            let written = match write_part(&mut source, &staged, max_part_size) {
                Ok(n) => n,
                Err(e) => {
                    staging.discard(&staged);
                    return Err(e);
                }
            };

            if written == 0 && index > 0 {
                staging.discard(&staged);
                return Ok(());
            }

            parts.push(StagedPart {
                index,
                part_path: part_path(base, index),
                staged,
            });

            if written < max_part_size {
                return Ok(());
            }
        }
    })();

    match result {
        Ok(()) => Ok(parts),
        Err(e) => {
            staging.discard_all(parts.iter().map(|p| &p.staged));
            Err(e)
        }
    }
}

fn write_part(source: &mut impl Read, staged: &Path, max_part_size: u64) -> Result<u64> {
    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .truncate(true)
        .open(staged)?;
    let written = std::io::copy(&mut source.take(max_part_size), &mut file)?;
    file.flush()?;
    Ok(written)
}

pub type PartSupplier = Box<dyn FnOnce() -> Result<Box<dyn Read + Send>> + Send>;

/// One part awaiting merge; `supplier` opens its (decrypted) bytes on demand.
pub struct PartSource {
    pub index: u32,
    pub part_path: String,
    pub supplier: PartSupplier,
}

impl PartSource {
    pub fn new(
        index: u32,
        part_path: impl Into<String>,
        supplier: impl FnOnce() -> Result<Box<dyn Read + Send>> + Send + 'static,
    ) -> Self {
        Self {
            index,
            part_path: part_path.into(),
            supplier: Box::new(supplier),
        }
    }
}

pub type PartCallback = Box<dyn FnMut(&str) + Send>;

/// Concatenates parts in index order. A part's supplier runs only once the
/// previous part has been fully read.
pub struct MergedReader {
    remaining: VecDeque<PartSource>,
    current: Option<(String, Box<dyn Read + Send>)>,
    on_part_processed: PartCallback,
}

pub fn merged(
    mut parts: Vec<PartSource>,
    on_part_processed: impl FnMut(&str) + Send + 'static,
) -> Result<MergedReader> {
    if parts.is_empty() {
        return Err(Error::Integrity {
            message: "at least one crate expected".to_string(),
        });
    }
    parts.sort_by_key(|p| p.index);
    Ok(MergedReader {
        remaining: parts.into(),
        current: None,
        on_part_processed: Box::new(on_part_processed),
    })
}

impl Read for MergedReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            if self.current.is_none() {
                let Some(next) = self.remaining.pop_front() else {
                    return Ok(0);
                };
                let reader = (next.supplier)()?;
                self.current = Some((next.part_path, reader));
            }

            if let Some((part_path, reader)) = self.current.as_mut() {
                let n = reader.read(buf)?;
                if n > 0 {
                    return Ok(n);
                }
                (self.on_part_processed)(part_path);
                self.current = None;
            }
        }
    }
}
