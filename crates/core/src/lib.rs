mod backup;
mod cache_refresh;
mod checksum;
mod compression;
mod config;
mod crypto;
mod discovery;
mod error;
mod executor;
mod metadata;
mod parts;
mod providers;
mod recovery;
mod run_log;
mod secrets;
mod specification;
mod staging;
mod tracking;

pub mod model;
pub mod remote;
pub mod state;

pub const APP_NAME: &str = "CrateKeeper";

pub use backup::{
    BackupOptions, BackupRequest, BackupResult, BackupSource, run_backup, run_backup_with,
};
pub use cache_refresh::{
    CacheRefreshConfig, CacheRefreshHandler, DatasetsCache, RefreshStats, RefreshTarget,
};
pub use checksum::ChecksumAlgorithm;
pub use compression::{Compression, CompressionAlgorithm, default_disabled_extensions};
pub use config::{
    ApiEndpointConfig, BackupSettings, CONFIG_SCHEMA_VERSION, CacheRefreshSettings, ClientConfig,
    CoreEndpointConfig, DEFAULT_MAX_PART_SIZE, DiscoveryConfig, IdentityConfig, config_path,
    load_config, parse_config, save_config, to_toml, validate_config,
};
pub use crypto::{Encoder, MAX_PLAINTEXT_BYTES, XChaChaEncoder, decrypt_framed, encrypt_framed};
pub use discovery::{
    ClientFactory, DefaultServiceDiscovery, DiscoveryTiming, HttpClientFactory,
    ServiceDiscoveryProvider,
};
pub use error::{Error, Result};
pub use executor::{CompletedOperation, OperationExecutor, OperationOutcome};
pub use metadata::{MetadataExtractor, apply as apply_metadata};
pub use parts::{
    PartSource, StagedPart, merged, part_index, part_path, partition_and_stage,
};
pub use providers::Providers;
pub use recovery::{
    RecoveryOptions, RecoveryRequest, RecoveryResult, RecoverySource, run_recovery,
    run_recovery_with,
};
pub use run_log::{OperationLogGuard, init_logging, start_operation_log};
pub use secrets::{
    DerivationConfig, DeviceFileSecret, DeviceMetadataSecret, DeviceSecret, device_secret_path,
    read_device_secret_file, write_device_secret_file_private,
};
pub use specification::{DiscoveredEntities, Rule, RuleOperation, Specification, UnmatchedRule};
pub use staging::FileStaging;
pub use tracking::{BackupTracker, DefaultBackupTracker, DefaultRecoveryTracker, RecoveryTracker};
