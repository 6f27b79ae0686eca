use std::sync::Arc;

use crate::crypto::Encoder;
use crate::metadata::MetadataExtractor;
use crate::model::DeviceIdentity;
use crate::remote::ClientProvider;
use crate::secrets::{DerivationConfig, DeviceSecret};
use crate::staging::FileStaging;
use crate::tracking::{BackupTracker, RecoveryTracker};

/// Everything a backup or recovery needs, built once by the composition root
/// and handed to every operation.
#[derive(Clone)]
pub struct Providers {
    pub identity: DeviceIdentity,
    pub secret: Arc<DeviceSecret>,
    pub derivation: DerivationConfig,
    pub extractor: MetadataExtractor,
    pub encoder: Arc<dyn Encoder>,
    pub staging: FileStaging,
    /// Configured bound; see [`Providers::effective_max_part_size`].
    pub max_part_size: u64,
    pub clients: Arc<dyn ClientProvider>,
    pub backup_tracker: Arc<dyn BackupTracker>,
    pub recovery_tracker: Arc<dyn RecoveryTracker>,
}

impl Providers {
    pub fn effective_max_part_size(&self) -> u64 {
        self.max_part_size.min(self.encoder.max_plaintext_size())
    }
}
