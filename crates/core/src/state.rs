//! Crash-resumable progress ledgers for running operations.

mod backup;
mod recovery;
mod store;

pub use backup::{BackupEntities, BackupState, PendingSourceEntity, ProcessedSourceEntity};
pub use recovery::{PendingTargetEntity, RecoveryEntities, RecoveryState};
pub use store::{StateStore, StateStores};
