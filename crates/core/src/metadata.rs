//! Reading entity attributes from disk and applying them back on recovery.

use std::collections::BTreeMap;
use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::Path;

use chrono::{DateTime, Utc};
use filetime::FileTime;
use nix::unistd::{Gid, Group, Uid, User};

use crate::checksum::ChecksumAlgorithm;
use crate::compression::Compression;
use crate::model::{
    Checksum, DirectoryMetadata, EntityMetadata, FileMetadata, mode_from_permissions,
    permissions_from_mode,
};
use crate::{Error, Result};

#[derive(Debug, Clone)]
pub struct MetadataExtractor {
    pub checksum: ChecksumAlgorithm,
    pub compression: Compression,
}

impl MetadataExtractor {
    pub fn new(checksum: ChecksumAlgorithm, compression: Compression) -> Self {
        Self {
            checksum,
            compression,
        }
    }

    /// Builds current metadata for `path`. When the content matches `existing`,
    /// the existing crate references are carried over.
    pub fn extract(
        &self,
        path: &Path,
        existing: Option<&EntityMetadata>,
    ) -> Result<EntityMetadata> {
        let meta = fs::symlink_metadata(path)?;

        let is_hidden = path
            .file_name()
            .and_then(|n| n.to_str())
            .map(|n| n.starts_with('.'))
            .unwrap_or(false);
        let updated = timestamp(meta.mtime());
        let created = meta
            .created()
            .ok()
            .map(|t| DateTime::<Utc>::from(t).timestamp())
            .map(timestamp)
            .unwrap_or(updated);
        let owner = owner_name(meta.uid());
        let group = group_name(meta.gid());
        let permissions = permissions_from_mode(meta.mode());

        if meta.file_type().is_symlink() {
            let target = fs::read_link(path)?;
            return Ok(EntityMetadata::File(FileMetadata {
                path: path.to_path_buf(),
                size: 0,
                link: Some(target),
                is_hidden,
                created,
                updated,
                owner,
                group,
                permissions,
                checksum: Checksum::zero(),
                crates: BTreeMap::new(),
                compression: crate::compression::CompressionAlgorithm::None
                    .name()
                    .to_string(),
            }));
        }

        if meta.is_dir() {
            return Ok(EntityMetadata::Directory(DirectoryMetadata {
                path: path.to_path_buf(),
                link: None,
                is_hidden,
                created,
                updated,
                owner,
                group,
                permissions,
            }));
        }

        let size = meta.len();
        let checksum = self.checksum.calculate(path)?;
        let crates = match existing {
            Some(EntityMetadata::File(f))
                if f.link.is_none() && f.size == size && f.checksum == checksum =>
            {
                f.crates.clone()
            }
            _ => BTreeMap::new(),
        };
        let compression = match existing {
            Some(EntityMetadata::File(f)) if !crates.is_empty() => f.compression.clone(),
            _ => self.compression.algorithm_for(path).name().to_string(),
        };

        Ok(EntityMetadata::File(FileMetadata {
            path: path.to_path_buf(),
            size,
            link: None,
            is_hidden,
            created,
            updated,
            owner,
            group,
            permissions,
            checksum,
            crates,
            compression,
        }))
    }

    /// Like [`Self::extract`], but a missing path yields `None`.
    pub fn extract_if_exists(&self, path: &Path) -> Result<Option<EntityMetadata>> {
        match fs::symlink_metadata(path) {
            Ok(_) => self.extract(path, None).map(Some),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

fn timestamp(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap_or_default()
}

fn owner_name(uid: u32) -> String {
    match User::from_uid(Uid::from_raw(uid)) {
        Ok(Some(user)) => user.name,
        _ => uid.to_string(),
    }
}

fn group_name(gid: u32) -> String {
    match Group::from_gid(Gid::from_raw(gid)) {
        Ok(Some(group)) => group.name,
        _ => gid.to_string(),
    }
}

fn resolve_uid(owner: &str) -> Result<u32> {
    if let Ok(uid) = owner.parse::<u32>() {
        return Ok(uid);
    }
    match User::from_name(owner) {
        Ok(Some(user)) => Ok(user.uid.as_raw()),
        Ok(None) => Err(Error::Integrity {
            message: format!("unknown user: {owner}"),
        }),
        Err(e) => Err(Error::Io(e.into())),
    }
}

fn resolve_gid(group: &str) -> Result<u32> {
    if let Ok(gid) = group.parse::<u32>() {
        return Ok(gid);
    }
    match Group::from_name(group) {
        Ok(Some(group)) => Ok(group.gid.as_raw()),
        Ok(None) => Err(Error::Integrity {
            message: format!("unknown group: {group}"),
        }),
        Err(e) => Err(Error::Io(e.into())),
    }
}

/// Applies owner/group, permissions and modification time from `metadata`
/// onto the entity at `path`. Links keep their own permissions.
pub fn apply(metadata: &EntityMetadata, path: &Path) -> Result<()> {
    let current = fs::symlink_metadata(path)?;
    let uid = resolve_uid(metadata.owner())?;
    let gid = resolve_gid(metadata.group())?;

    let is_link = current.file_type().is_symlink();

    if current.uid() != uid || current.gid() != gid {
        std::os::unix::fs::lchown(path, Some(uid), Some(gid))?;
    }

    let modified = FileTime::from_unix_time(metadata.updated().timestamp(), 0);
    if is_link {
        filetime::set_symlink_file_times(path, modified, modified)?;
        return Ok(());
    }

    use std::os::unix::fs::PermissionsExt;
    let mode = mode_from_permissions(metadata.permissions())?;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))?;
    filetime::set_file_mtime(path, modified)?;

    Ok(())
}
