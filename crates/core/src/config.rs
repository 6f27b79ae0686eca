use std::path::{Path, PathBuf};

use serde::de::Error as _;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::checksum::ChecksumAlgorithm;
use crate::compression::Compression;
use crate::crypto::MAX_PLAINTEXT_BYTES;
use crate::model::DeviceIdentity;
use crate::remote::HttpCredentials;
use crate::secrets::DerivationConfig;
use crate::{Error, Result};

pub const CONFIG_SCHEMA_VERSION: u32 = 1;

pub const DEFAULT_MAX_PART_SIZE: u64 = 32 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientConfig {
    pub version: u32,
    pub identity: IdentityConfig,
    #[serde(default)]
    pub api: ApiEndpointConfig,
    #[serde(default)]
    pub core: CoreEndpointConfig,
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    #[serde(default)]
    pub cache_refresh: CacheRefreshSettings,
    #[serde(default)]
    pub backup: BackupSettings,
    #[serde(default)]
    pub secrets: DerivationConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityConfig {
    pub user: Uuid,
    pub device: Uuid,
    pub node: Uuid,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiEndpointConfig {
    pub url: String,
    #[serde(default)]
    pub credentials: Option<HttpCredentials>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoreEndpointConfig {
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    pub enabled: bool,
    #[serde(default)]
    pub url: String,
    pub interval_secs: u64,
    pub initial_delay_secs: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheRefreshSettings {
    pub initial_delay_ms: u64,
    pub active_interval_ms: u64,
    pub pending_interval_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupSettings {
    pub max_part_size: u64,
    #[serde(default)]
    pub checksum: ChecksumAlgorithm,
    pub state_versions: usize,
    #[serde(default)]
    pub compression: Compression,
}

impl Default for ApiEndpointConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:9090".to_string(),
            credentials: None,
        }
    }
}

impl Default for CoreEndpointConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:9091".to_string(),
        }
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: String::new(),
            interval_secs: 30 * 60,
            initial_delay_secs: 5,
        }
    }
}

impl Default for CacheRefreshSettings {
    fn default() -> Self {
        Self {
            initial_delay_ms: 5_000,
            active_interval_ms: 30_000,
            pending_interval_ms: 15 * 60 * 1000,
        }
    }
}

impl Default for BackupSettings {
    fn default() -> Self {
        Self {
            max_part_size: DEFAULT_MAX_PART_SIZE,
            checksum: ChecksumAlgorithm::default(),
            state_versions: 5,
            compression: Compression::default(),
        }
    }
}

impl BackupSettings {
    /// Part size actually used, bounded by what the encoder accepts.
    pub fn effective_max_part_size(&self, encoder_max: u64) -> u64 {
        self.max_part_size.min(encoder_max)
    }
}

impl ClientConfig {
    pub fn new(identity: IdentityConfig) -> Self {
        Self {
            version: CONFIG_SCHEMA_VERSION,
            identity,
            api: ApiEndpointConfig::default(),
            core: CoreEndpointConfig::default(),
            discovery: DiscoveryConfig::default(),
            cache_refresh: CacheRefreshSettings::default(),
            backup: BackupSettings::default(),
            secrets: DerivationConfig::default(),
        }
    }

    pub fn device_identity(&self) -> DeviceIdentity {
        DeviceIdentity {
            user: self.identity.user,
            device: self.identity.device,
            node: self.identity.node,
        }
    }
}

pub fn config_path(config_dir: &Path) -> PathBuf {
    config_dir.join("config.toml")
}

/// Missing config yields `None`; the caller decides whether that is fatal.
pub fn load_config(config_dir: &Path) -> Result<Option<ClientConfig>> {
    let path = config_path(config_dir);
    if !path.exists() {
        return Ok(None);
    }

    let text = std::fs::read_to_string(&path).map_err(|e| Error::InvalidConfig {
        message: format!("config read failed: {e}"),
    })?;

    let config = parse_config(&text).map_err(|e| Error::InvalidConfig {
        message: format!("config invalid: {e}"),
    })?;
    validate_config(&config)?;
    Ok(Some(config))
}

pub fn parse_config(text: &str) -> std::result::Result<ClientConfig, toml::de::Error> {
    let raw: toml::Value = toml::from_str(text)?;
    let version = raw
        .get("version")
        .and_then(|v| v.as_integer())
        .and_then(|v| u32::try_from(v).ok());

    match version {
        Some(CONFIG_SCHEMA_VERSION) => toml::from_str::<ClientConfig>(text),
        Some(other) => Err(toml::de::Error::custom(format!(
            "unsupported config schema version: {other} (expected {CONFIG_SCHEMA_VERSION})"
        ))),
        None => Err(toml::de::Error::custom("missing config schema version")),
    }
}

pub fn to_toml(config: &ClientConfig) -> Result<String> {
    validate_config(config)?;
    toml::to_string(config).map_err(|e| Error::InvalidConfig {
        message: format!("config encode failed: {e}"),
    })
}

pub fn save_config(config_dir: &Path, config: &ClientConfig) -> Result<()> {
    let text = to_toml(config)?;

    let path = config_path(config_dir);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| Error::InvalidConfig {
            message: format!("config dir create failed: {e}"),
        })?;
    }

    atomic_write(&path, text.as_bytes()).map_err(|e| Error::InvalidConfig {
        message: format!("config write failed: {e}"),
    })?;
    Ok(())
}

pub fn validate_config(config: &ClientConfig) -> Result<()> {
    if config.version != CONFIG_SCHEMA_VERSION {
        return Err(Error::InvalidConfig {
            message: format!(
                "config.version must be {CONFIG_SCHEMA_VERSION} (got {})",
                config.version
            ),
        });
    }

    let identity = &config.identity;
    if identity.user.is_nil() || identity.device.is_nil() || identity.node.is_nil() {
        return Err(Error::InvalidConfig {
            message: "identity.user, identity.device and identity.node must be set".to_string(),
        });
    }

    validate_url("api.url", &config.api.url)?;
    validate_url("core.url", &config.core.url)?;

    if config.discovery.enabled {
        validate_url("discovery.url", &config.discovery.url)?;
        if config.discovery.interval_secs == 0 {
            return Err(Error::InvalidConfig {
                message: "discovery.interval_secs must be > 0".to_string(),
            });
        }
        if config.discovery.initial_delay_secs > config.discovery.interval_secs {
            return Err(Error::InvalidConfig {
                message: "discovery.initial_delay_secs must be <= discovery.interval_secs"
                    .to_string(),
            });
        }
    }

    let refresh = &config.cache_refresh;
    if !(refresh.initial_delay_ms < refresh.active_interval_ms
        && refresh.active_interval_ms < refresh.pending_interval_ms)
    {
        return Err(Error::InvalidConfig {
            message: "cache_refresh must satisfy initial_delay_ms < active_interval_ms < pending_interval_ms"
                .to_string(),
        });
    }

    if config.backup.max_part_size == 0 {
        return Err(Error::InvalidConfig {
            message: "backup.max_part_size must be > 0".to_string(),
        });
    }
    if config.backup.max_part_size > MAX_PLAINTEXT_BYTES {
        tracing::warn!(
            event = "config.max_part_size_capped",
            max_part_size = config.backup.max_part_size,
            cap = MAX_PLAINTEXT_BYTES,
            "config.max_part_size_capped"
        );
    }
    if config.backup.state_versions < 1 {
        return Err(Error::InvalidConfig {
            message: "backup.state_versions must be >= 1".to_string(),
        });
    }

    config.secrets.validate()
}

fn validate_url(field: &str, url: &str) -> Result<()> {
    let url = url.trim();
    if !(url.starts_with("http://") || url.starts_with("https://")) {
        return Err(Error::InvalidConfig {
            message: format!("{field} must be an http(s) url (got {url:?})"),
        });
    }
    Ok(())
}

fn atomic_write(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, bytes)?;
    std::fs::rename(tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> ClientConfig {
        let input = r#"
version = 1

[identity]
user = "00000000-0000-0000-0000-000000000001"
device = "00000000-0000-0000-0000-000000000002"
node = "00000000-0000-0000-0000-000000000003"

[api]
url = "https://api.example.com"

[api.credentials]
type = "bearer_token"
token = "abc"
"#;
        parse_config(input).unwrap()
    }

    #[test]
    fn defaults_fill_missing_sections() {
        let config = base_config();
        validate_config(&config).unwrap();
        assert_eq!(config.backup.max_part_size, DEFAULT_MAX_PART_SIZE);
        assert_eq!(config.backup.checksum, ChecksumAlgorithm::Sha256);
        assert!(!config.discovery.enabled);
        assert_eq!(
            config.api.credentials,
            Some(HttpCredentials::BearerToken {
                token: "abc".to_string()
            })
        );
    }

    #[test]
    fn rejects_other_schema_versions() {
        assert!(parse_config("version = 7\n").is_err());
        assert!(parse_config("[identity]\n").is_err());
    }

    #[test]
    fn cache_refresh_intervals_are_ordered() {
        let mut config = base_config();
        config.cache_refresh.active_interval_ms = config.cache_refresh.pending_interval_ms;
        assert!(validate_config(&config).is_err());

        let mut config = base_config();
        config.cache_refresh.initial_delay_ms = config.cache_refresh.active_interval_ms;
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn discovery_requires_url_when_enabled() {
        let mut config = base_config();
        config.discovery.enabled = true;
        assert!(validate_config(&config).is_err());
        config.discovery.url = "https://discovery.example.com".to_string();
        validate_config(&config).unwrap();
    }

    #[test]
    fn effective_part_size_is_capped_by_encoder() {
        let mut settings = BackupSettings::default();
        settings.max_part_size = MAX_PLAINTEXT_BYTES * 2;
        assert_eq!(
            settings.effective_max_part_size(MAX_PLAINTEXT_BYTES),
            MAX_PLAINTEXT_BYTES
        );
    }

    #[test]
    fn save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_config(dir.path()).unwrap().is_none());

        let config = base_config();
        save_config(dir.path(), &config).unwrap();
        assert_eq!(load_config(dir.path()).unwrap(), Some(config));
    }
}
