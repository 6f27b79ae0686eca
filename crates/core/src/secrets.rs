use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};

use base64::Engine;
use hkdf::Hkdf;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha512;
use uuid::Uuid;

use crate::crypto::{IV_LEN, KEY_LEN};
use crate::model::CrateId;
use crate::{Error, Result};

pub const DEVICE_SECRET_PREFIX: &str = "CKS1:";
pub const DEVICE_SECRET_FILE_NAME: &str = "device.secret";

const DEVICE_SECRET_MIN_BYTES: usize = 16;
const DEVICE_SECRET_DEFAULT_BYTES: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DerivationConfig {
    pub file_key_size: usize,
    pub metadata_key_size: usize,
    pub iv_size: usize,
}

impl Default for DerivationConfig {
    fn default() -> Self {
        Self {
            file_key_size: KEY_LEN,
            metadata_key_size: KEY_LEN,
            iv_size: IV_LEN,
        }
    }
}

impl DerivationConfig {
    pub fn validate(&self) -> Result<()> {
        if self.file_key_size != KEY_LEN || self.metadata_key_size != KEY_LEN {
            return Err(Error::InvalidConfig {
                message: format!("secrets key sizes must be {KEY_LEN} bytes"),
            });
        }
        if self.iv_size != IV_LEN {
            return Err(Error::InvalidConfig {
                message: format!("secrets iv size must be {IV_LEN} bytes"),
            });
        }
        Ok(())
    }
}

/// Root key material for one user + device pairing.
#[derive(Clone)]
pub struct DeviceSecret {
    user: Uuid,
    device: Uuid,
    secret: Vec<u8>,
}

impl fmt::Debug for DeviceSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceSecret")
            .field("user", &self.user)
            .field("device", &self.device)
            .field("secret", &"<redacted>")
            .finish()
    }
}

impl DeviceSecret {
    pub fn new(user: Uuid, device: Uuid, secret: Vec<u8>) -> Result<Self> {
        if secret.len() < DEVICE_SECRET_MIN_BYTES {
            return Err(Error::InvalidConfig {
                message: format!(
                    "device secret must be at least {DEVICE_SECRET_MIN_BYTES} bytes (got {})",
                    secret.len()
                ),
            });
        }
        Ok(Self {
            user,
            device,
            secret,
        })
    }

    pub fn generate(user: Uuid, device: Uuid) -> Self {
        let mut secret = vec![0u8; DEVICE_SECRET_DEFAULT_BYTES];
        rand::rngs::OsRng.fill_bytes(&mut secret);
        Self {
            user,
            device,
            secret,
        }
    }

    pub fn user(&self) -> Uuid {
        self.user
    }

    pub fn device(&self) -> Uuid {
        self.device
    }

    pub fn to_file_secret(
        &self,
        file: &str,
        config: &DerivationConfig,
    ) -> Result<DeviceFileSecret> {
        let salt = format!("{}-{}-{}", self.user, self.device, file);
        let (key, iv) = self.derive(
            salt.as_bytes(),
            b"file-key",
            config.file_key_size,
            b"file-iv",
            config.iv_size,
        )?;
        Ok(DeviceFileSecret {
            file: file.to_string(),
            key,
            iv,
        })
    }

    pub fn to_metadata_secret(
        &self,
        crate_id: CrateId,
        config: &DerivationConfig,
    ) -> Result<DeviceMetadataSecret> {
        let salt = format!("{}-{}-{}", self.user, self.device, crate_id);
        let (key, iv) = self.derive(
            salt.as_bytes(),
            b"metadata-key",
            config.metadata_key_size,
            b"metadata-iv",
            config.iv_size,
        )?;
        Ok(DeviceMetadataSecret { crate_id, key, iv })
    }

    fn derive(
        &self,
        salt: &[u8],
        key_info: &[u8],
        key_size: usize,
        iv_info: &[u8],
        iv_size: usize,
    ) -> Result<(Vec<u8>, Vec<u8>)> {
        let hkdf = Hkdf::<Sha512>::new(Some(salt), &self.secret);

        let mut key = vec![0u8; key_size];
        hkdf.expand(key_info, &mut key).map_err(|_| Error::Crypto)?;

        let mut iv = vec![0u8; iv_size];
        hkdf.expand(iv_info, &mut iv).map_err(|_| Error::Crypto)?;

        Ok((key, iv))
    }

    pub fn encode(&self) -> String {
        let b64 = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(&self.secret);
        format!("{DEVICE_SECRET_PREFIX}{b64}")
    }

    pub fn decode(user: Uuid, device: Uuid, s: &str) -> Result<Self> {
        let rest = s
            .trim()
            .strip_prefix(DEVICE_SECRET_PREFIX)
            .ok_or_else(|| Error::InvalidConfig {
                message: format!("invalid device secret (missing {DEVICE_SECRET_PREFIX} prefix)"),
            })?;

        let bytes = base64::engine::general_purpose::URL_SAFE_NO_PAD
            .decode(rest.as_bytes())
            .map_err(|e| Error::InvalidConfig {
                message: format!("invalid device secret (bad base64url): {e}"),
            })?;
        Self::new(user, device, bytes)
    }
}

/// Key + iv for a single file part.
pub struct DeviceFileSecret {
    file: String,
    key: Vec<u8>,
    iv: Vec<u8>,
}

impl DeviceFileSecret {
    pub fn file(&self) -> &str {
        &self.file
    }

    pub fn key(&self) -> &[u8] {
        &self.key
    }

    pub fn iv(&self) -> &[u8] {
        &self.iv
    }
}

impl fmt::Debug for DeviceFileSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceFileSecret")
            .field("file", &self.file)
            .finish_non_exhaustive()
    }
}

/// Key + iv for a single metadata crate.
pub struct DeviceMetadataSecret {
    crate_id: CrateId,
    key: Vec<u8>,
    iv: Vec<u8>,
}

impl DeviceMetadataSecret {
    pub fn crate_id(&self) -> CrateId {
        self.crate_id
    }

    pub fn key(&self) -> &[u8] {
        &self.key
    }

    pub fn iv(&self) -> &[u8] {
        &self.iv
    }
}

impl fmt::Debug for DeviceMetadataSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceMetadataSecret")
            .field("crate_id", &self.crate_id)
            .finish_non_exhaustive()
    }
}

pub fn device_secret_path(config_dir: &Path) -> PathBuf {
    config_dir.join(DEVICE_SECRET_FILE_NAME)
}

pub fn read_device_secret_file(path: &Path, user: Uuid, device: Uuid) -> Result<DeviceSecret> {
    let text = std::fs::read_to_string(path)?;
    DeviceSecret::decode(user, device, &text)
}

pub fn write_device_secret_file_private(path: &Path, secret: &DeviceSecret) -> Result<()> {
    if let Some(parent) = path.parent() {
        ensure_private_dir(parent)?;
    }
    write_atomic_private(path, (secret.encode() + "\n").as_bytes())?;
    Ok(())
}

fn write_atomic_private(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let tmp = path.with_extension("tmp");

    #[cfg(unix)]
    {
        use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
        let mut f = std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .mode(0o600)
            .open(&tmp)?;
        f.write_all(bytes)?;
        f.sync_all()?;
        std::fs::rename(&tmp, path)?;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
        Ok(())
    }

    #[cfg(not(unix))]
    {
        let mut f = std::fs::File::create(&tmp)?;
        f.write_all(bytes)?;
        f.sync_all()?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }
}

fn ensure_private_dir(path: &Path) -> std::io::Result<()> {
    if path.exists() {
        return Ok(());
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        std::fs::DirBuilder::new().recursive(true).mode(0o700).create(path)
    }

    #[cfg(not(unix))]
    {
        std::fs::create_dir_all(path)
    }
}
