use std::fmt;
use std::io::Read;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::model::Checksum;
use crate::{Error, Result};

const READ_BUFFER_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumAlgorithm {
    Crc32,
    Md5,
    Sha1,
    #[default]
    Sha256,
}

impl ChecksumAlgorithm {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Crc32 => "crc32",
            Self::Md5 => "md5",
            Self::Sha1 => "sha1",
            Self::Sha256 => "sha256",
        }
    }

    pub fn calculate(&self, path: &Path) -> Result<Checksum> {
        let file = std::fs::File::open(path)?;
        self.calculate_reader(file)
    }

    pub fn calculate_reader(&self, mut reader: impl Read) -> Result<Checksum> {
        let mut digest = Digest::new(*self);
        let mut buf = vec![0u8; READ_BUFFER_BYTES];
        loop {
            let n = reader.read(&mut buf)?;
            if n == 0 {
                break;
            }
            digest.update(&buf[..n]);
        }
        Ok(digest.finish())
    }
}

impl fmt::Display for ChecksumAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ChecksumAlgorithm {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "crc32" => Ok(Self::Crc32),
            "md5" => Ok(Self::Md5),
            "sha1" | "sha-1" => Ok(Self::Sha1),
            "sha256" | "sha-256" => Ok(Self::Sha256),
            other => Err(Error::InvalidConfig {
                message: format!("unsupported checksum algorithm: {other}"),
            }),
        }
    }
}

enum Digest {
    Crc32(crc32fast::Hasher),
    Md5(md5::Context),
    Sha1(sha1::Sha1),
    Sha256(sha2::Sha256),
}

impl Digest {
    fn new(algorithm: ChecksumAlgorithm) -> Self {
        match algorithm {
            ChecksumAlgorithm::Crc32 => Self::Crc32(crc32fast::Hasher::new()),
            ChecksumAlgorithm::Md5 => Self::Md5(md5::Context::new()),
            ChecksumAlgorithm::Sha1 => Self::Sha1(sha1::Sha1::default()),
            ChecksumAlgorithm::Sha256 => Self::Sha256(sha2::Sha256::default()),
        }
    }

    fn update(&mut self, bytes: &[u8]) {
        match self {
            Self::Crc32(h) => h.update(bytes),
            Self::Md5(h) => h.consume(bytes),
            Self::Sha1(h) => sha1::Digest::update(h, bytes),
            Self::Sha256(h) => sha2::Digest::update(h, bytes),
        }
    }

    fn finish(self) -> Checksum {
        match self {
            Self::Crc32(h) => Checksum::from_be_bytes(&h.finalize().to_be_bytes()),
            Self::Md5(h) => Checksum::from_be_bytes(&h.compute().0),
            Self::Sha1(h) => Checksum::from_be_bytes(&sha1::Digest::finalize(h)),
            Self::Sha256(h) => Checksum::from_be_bytes(&sha2::Digest::finalize(h)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_digests() {
        let input = b"hello".as_slice();
        assert_eq!(
            ChecksumAlgorithm::Crc32.calculate_reader(input).unwrap().to_string(),
            "3610a686"
        );
        assert_eq!(
            ChecksumAlgorithm::Md5.calculate_reader(input).unwrap().to_string(),
            "5d41402abc4b2a76b9719d911017c592"
        );
        assert_eq!(
            ChecksumAlgorithm::Sha1.calculate_reader(input).unwrap().to_string(),
            "aaf4c61ddcc5e8a2dabede0f3b482cd9aea9434d"
        );
        assert_eq!(
            ChecksumAlgorithm::Sha256.calculate_reader(input).unwrap().to_string(),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }

    #[test]
    fn streams_files_larger_than_the_buffer() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("big.bin");
        let data: Vec<u8> = (0..(READ_BUFFER_BYTES * 3 + 17)).map(|i| i as u8).collect();
        std::fs::write(&path, &data).unwrap();

        let from_file = ChecksumAlgorithm::Sha256.calculate(&path).unwrap();
        let from_memory = ChecksumAlgorithm::Sha256
            .calculate_reader(data.as_slice())
            .unwrap();
        assert_eq!(from_file, from_memory);
    }

    #[test]
    fn parses_names() {
        assert_eq!("SHA-256".parse::<ChecksumAlgorithm>().unwrap(), ChecksumAlgorithm::Sha256);
        assert_eq!("crc32".parse::<ChecksumAlgorithm>().unwrap(), ChecksumAlgorithm::Crc32);
        assert!("blake3".parse::<ChecksumAlgorithm>().is_err());
    }
}
