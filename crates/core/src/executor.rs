//! Supervises running operations: at most one active operation per type,
//! cancellation on request and a record of finished operations.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::backup::{BackupOptions, BackupRequest, BackupSource, run_backup_with};
use crate::model::{OperationId, OperationType};
use crate::providers::Providers;
use crate::recovery::{RecoveryOptions, RecoveryRequest, run_recovery_with};
use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationOutcome {
    Completed,
    Failed { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedOperation {
    pub kind: OperationType,
    pub outcome: OperationOutcome,
}

struct ActiveOperation {
    kind: OperationType,
    cancel: CancellationToken,
    outcome: watch::Receiver<Option<OperationOutcome>>,
}

#[derive(Default)]
struct Operations {
    active: HashMap<OperationId, ActiveOperation>,
    completed: HashMap<OperationId, CompletedOperation>,
}

#[derive(Clone)]
pub struct OperationExecutor {
    providers: Providers,
    operations: Arc<Mutex<Operations>>,
}

impl OperationExecutor {
    pub fn new(providers: Providers) -> Self {
        Self {
            providers,
            operations: Arc::new(Mutex::new(Operations::default())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Operations> {
        self.operations.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Must be called from within a Tokio runtime.
    pub fn start_backup(&self, request: BackupRequest) -> Result<OperationId> {
        let operation = Uuid::new_v4();
        let providers = self.providers.clone();
        self.spawn(operation, OperationType::Backup, move |cancel| async move {
            let options = BackupOptions {
                cancel: Some(&cancel),
            };
            run_backup_with(&providers, operation, request, options)
                .await
                .map(|_| ())
        })?;
        Ok(operation)
    }

    /// Continues an interrupted backup under its original id.
    pub fn resume_backup(&self, operation: OperationId) -> Result<OperationId> {
        let state = self
            .providers
            .backup_tracker
            .state(operation)
            .ok_or(Error::OperationNotFound { operation })?;
        if state.is_completed() {
            return Err(Error::OperationAlreadyCompleted { operation });
        }

        let request = BackupRequest {
            definition: state.definition,
            source: BackupSource::Resumed(state),
        };
        let providers = self.providers.clone();
        self.spawn(operation, OperationType::Backup, move |cancel| async move {
            let options = BackupOptions {
                cancel: Some(&cancel),
            };
            run_backup_with(&providers, operation, request, options)
                .await
                .map(|_| ())
        })?;
        Ok(operation)
    }

    pub fn start_recovery(&self, request: RecoveryRequest) -> Result<OperationId> {
        let operation = Uuid::new_v4();
        let providers = self.providers.clone();
        self.spawn(operation, OperationType::Recovery, move |cancel| async move {
            let options = RecoveryOptions {
                cancel: Some(&cancel),
            };
            run_recovery_with(&providers, operation, request, options)
                .await
                .map(|_| ())
        })?;
        Ok(operation)
    }

    pub fn start_expiration(&self) -> Result<OperationId> {
        Err(Error::UnsupportedOperation {
            kind: OperationType::Expiration,
        })
    }

    pub fn start_validation(&self) -> Result<OperationId> {
        Err(Error::UnsupportedOperation {
            kind: OperationType::Validation,
        })
    }

    pub fn start_key_rotation(&self) -> Result<OperationId> {
        Err(Error::UnsupportedOperation {
            kind: OperationType::KeyRotation,
        })
    }

    /// Requests cancellation; the operation finishes at its next checkpoint.
    pub fn stop(&self, operation: OperationId) -> Result<()> {
        let operations = self.lock();
        if let Some(active) = operations.active.get(&operation) {
            info!(
                event = "operation.stop_requested",
                operation = %operation,
                kind = %active.kind,
                "operation.stop_requested"
            );
            active.cancel.cancel();
            return Ok(());
        }
        if operations.completed.contains_key(&operation) {
            return Err(Error::OperationAlreadyCompleted { operation });
        }
        Err(Error::OperationNotFound { operation })
    }

    pub async fn wait(&self, operation: OperationId) -> Result<OperationOutcome> {
        let mut outcome = {
            let operations = self.lock();
            if let Some(active) = operations.active.get(&operation) {
                active.outcome.clone()
            } else if let Some(completed) = operations.completed.get(&operation) {
                return Ok(completed.outcome.clone());
            } else {
                return Err(Error::OperationNotFound { operation });
            }
        };

        let finished = outcome
            .wait_for(|o| o.is_some())
            .await
            .map_err(|_| Error::OperationNotFound { operation })?;
        Ok((*finished)
            .clone()
            .unwrap_or(OperationOutcome::Failed {
                reason: "operation outcome unavailable".to_string(),
            }))
    }

    pub fn active(&self) -> Vec<(OperationId, OperationType)> {
        let mut out: Vec<_> = self
            .lock()
            .active
            .iter()
            .map(|(id, op)| (*id, op.kind))
            .collect();
        out.sort_by_key(|(id, _)| *id);
        out
    }

    pub fn completed(&self) -> HashMap<OperationId, CompletedOperation> {
        self.lock().completed.clone()
    }

    fn spawn<F, Fut>(&self, operation: OperationId, kind: OperationType, run: F) -> Result<()>
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let cancel = CancellationToken::new();
        let (tx, rx) = watch::channel(None);
        {
            let mut operations = self.lock();
            if let Some((existing, _)) = operations.active.iter().find(|(_, op)| op.kind == kind) {
                return Err(Error::OperationAlreadyActive {
                    operation: *existing,
                    kind,
                });
            }
            operations.completed.remove(&operation);
            operations.active.insert(
                operation,
                ActiveOperation {
                    kind,
                    cancel: cancel.clone(),
                    outcome: rx,
                },
            );
        }

        info!(
            event = "operation.started",
            operation = %operation,
            kind = %kind,
            "operation.started"
        );

        let operations = Arc::clone(&self.operations);
        let task = tokio::spawn(run(cancel));
        tokio::spawn(async move {
            let outcome = match task.await {
                Ok(Ok(())) => OperationOutcome::Completed,
                Ok(Err(e)) => OperationOutcome::Failed {
                    reason: e.to_string(),
                },
                Err(e) => {
                    warn!(
                        event = "operation.panicked",
                        operation = %operation,
                        kind = %kind,
                        error = %e,
                        "operation.panicked"
                    );
                    OperationOutcome::Failed {
                        reason: format!("operation task failed: {e}"),
                    }
                }
            };

            info!(
                event = "operation.finished",
                operation = %operation,
                kind = %kind,
                outcome = ?outcome,
                "operation.finished"
            );

            {
                let mut operations = operations.lock().unwrap_or_else(|e| e.into_inner());
                operations.active.remove(&operation);
                operations.completed.insert(
                    operation,
                    CompletedOperation {
                        kind,
                        outcome: outcome.clone(),
                    },
                );
            }
            let _ = tx.send(Some(outcome));
        });

        Ok(())
    }
}
