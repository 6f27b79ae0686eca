use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::model::CrateId;
use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EntityMetadata {
    File(FileMetadata),
    Directory(DirectoryMetadata),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMetadata {
    pub path: PathBuf,
    pub size: u64,
    pub link: Option<PathBuf>,
    pub is_hidden: bool,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    pub owner: String,
    pub group: String,
    pub permissions: String,
    pub checksum: Checksum,
    /// Part path (`<path>__part=<n>`) to the crate holding that part.
    pub crates: BTreeMap<String, CrateId>,
    pub compression: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryMetadata {
    pub path: PathBuf,
    pub link: Option<PathBuf>,
    pub is_hidden: bool,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    pub owner: String,
    pub group: String,
    pub permissions: String,
}

impl EntityMetadata {
    pub fn path(&self) -> &Path {
        match self {
            Self::File(f) => &f.path,
            Self::Directory(d) => &d.path,
        }
    }

    pub fn link(&self) -> Option<&Path> {
        match self {
            Self::File(f) => f.link.as_deref(),
            Self::Directory(d) => d.link.as_deref(),
        }
    }

    pub fn owner(&self) -> &str {
        match self {
            Self::File(f) => &f.owner,
            Self::Directory(d) => &d.owner,
        }
    }

    pub fn group(&self) -> &str {
        match self {
            Self::File(f) => &f.group,
            Self::Directory(d) => &d.group,
        }
    }

    pub fn permissions(&self) -> &str {
        match self {
            Self::File(f) => &f.permissions,
            Self::Directory(d) => &d.permissions,
        }
    }

    pub fn updated(&self) -> DateTime<Utc> {
        match self {
            Self::File(f) => f.updated,
            Self::Directory(d) => d.updated,
        }
    }

    pub fn is_directory(&self) -> bool {
        matches!(self, Self::Directory(_))
    }

    pub fn as_file(&self) -> Option<&FileMetadata> {
        match self {
            Self::File(f) => Some(f),
            Self::Directory(_) => None,
        }
    }

    /// Attribute-level equality, ignoring path, crate references and creation
    /// time (which cannot be restored on most filesystems).
    pub fn same_attributes(&self, other: &EntityMetadata) -> bool {
        let common = self.link() == other.link()
            && self.owner() == other.owner()
            && self.group() == other.group()
            && self.permissions() == other.permissions()
            && self.updated() == other.updated();

        match (self, other) {
            (Self::File(a), Self::File(b)) => common && a.size == b.size && a.checksum == b.checksum,
            (Self::Directory(_), Self::Directory(_)) => common,
            _ => false,
        }
    }
}

/// Content digest as an unsigned arbitrary-precision integer.
///
/// Stored as big-endian magnitude without leading zero bytes so that digests
/// compare by numeric value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Checksum(Vec<u8>);

impl Checksum {
    pub fn from_be_bytes(bytes: &[u8]) -> Self {
        let start = bytes.iter().position(|b| *b != 0).unwrap_or(bytes.len());
        Self(bytes[start..].to_vec())
    }

    pub fn zero() -> Self {
        Self(Vec::new())
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn from_hex(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.is_empty() || s == "0" {
            return Ok(Self::zero());
        }
        let padded = if s.len() % 2 == 1 {
            format!("0{s}")
        } else {
            s.to_string()
        };
        let bytes = hex::decode(padded).map_err(|e| Error::Integrity {
            message: format!("invalid checksum hex: {e}"),
        })?;
        Ok(Self::from_be_bytes(&bytes))
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            f.write_str("0")
        } else {
            f.write_str(&hex::encode(&self.0))
        }
    }
}

impl Serialize for Checksum {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Checksum {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Checksum::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

const PERMISSION_BITS: [(u32, char); 9] = [
    (0o400, 'r'),
    (0o200, 'w'),
    (0o100, 'x'),
    (0o040, 'r'),
    (0o020, 'w'),
    (0o010, 'x'),
    (0o004, 'r'),
    (0o002, 'w'),
    (0o001, 'x'),
];

/// `0o754` -> `rwxr-xr--`
pub fn permissions_from_mode(mode: u32) -> String {
    PERMISSION_BITS
        .iter()
        .map(|(bit, c)| if mode & bit != 0 { *c } else { '-' })
        .collect()
}

/// `rwxr-xr--` -> `0o754`
pub fn mode_from_permissions(permissions: &str) -> Result<u32> {
    let chars: Vec<char> = permissions.chars().collect();
    if chars.len() != PERMISSION_BITS.len() {
        return Err(Error::InvalidConfig {
            message: format!("invalid permissions string: {permissions:?}"),
        });
    }

    let mut mode = 0u32;
    for (c, (bit, expected)) in chars.iter().zip(PERMISSION_BITS.iter()) {
        match c {
            '-' => {}
            c if c == expected => mode |= bit,
            _ => {
                return Err(Error::InvalidConfig {
                    message: format!("invalid permissions string: {permissions:?}"),
                });
            }
        }
    }
    Ok(mode)
}
