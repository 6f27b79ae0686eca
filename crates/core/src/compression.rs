use std::collections::BTreeSet;
use std::fmt;
use std::io::Read;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

const ZSTD_LEVEL: i32 = 3;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionAlgorithm {
    #[default]
    Zstd,
    None,
}

impl CompressionAlgorithm {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Zstd => "zstd",
            Self::None => "none",
        }
    }
}

impl fmt::Display for CompressionAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for CompressionAlgorithm {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "zstd" => Ok(Self::Zstd),
            "none" | "" => Ok(Self::None),
            other => Err(Error::InvalidConfig {
                message: format!("unsupported compression algorithm: {other}"),
            }),
        }
    }
}

/// Picks a compression algorithm per file and wraps readers accordingly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Compression {
    pub default: CompressionAlgorithm,
    /// Lowercase extensions (without the dot) that are stored as-is.
    pub disabled_extensions: BTreeSet<String>,
}

impl Default for Compression {
    fn default() -> Self {
        Self {
            default: CompressionAlgorithm::Zstd,
            disabled_extensions: default_disabled_extensions(),
        }
    }
}

pub fn default_disabled_extensions() -> BTreeSet<String> {
    [
        "7z", "avi", "bz2", "gif", "gz", "heic", "jpeg", "jpg", "m4a", "mkv", "mov", "mp3", "mp4",
        "png", "rar", "webm", "webp", "xz", "zip", "zst",
    ]
    .into_iter()
    .map(str::to_string)
    .collect()
}

impl Compression {
    pub fn algorithm_for(&self, path: &Path) -> CompressionAlgorithm {
        let disabled = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| self.disabled_extensions.contains(&e.to_ascii_lowercase()))
            .unwrap_or(false);

        if disabled {
            CompressionAlgorithm::None
        } else {
            self.default
        }
    }

    pub fn compress<'a>(
        &self,
        algorithm: CompressionAlgorithm,
        reader: impl Read + Send + 'a,
    ) -> Result<Box<dyn Read + Send + 'a>> {
        match algorithm {
            CompressionAlgorithm::Zstd => {
                Ok(Box::new(zstd::stream::read::Encoder::new(reader, ZSTD_LEVEL)?))
            }
            CompressionAlgorithm::None => Ok(Box::new(reader)),
        }
    }

    pub fn decompress<'a>(
        &self,
        algorithm: CompressionAlgorithm,
        reader: impl Read + Send + 'a,
    ) -> Result<Box<dyn Read + Send + 'a>> {
        match algorithm {
            CompressionAlgorithm::Zstd => Ok(Box::new(zstd::stream::read::Decoder::new(reader)?)),
            CompressionAlgorithm::None => Ok(Box::new(reader)),
        }
    }
}
