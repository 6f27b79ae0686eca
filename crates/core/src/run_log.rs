//! Operation logs: one NDJSON file per backup or recovery.
//!
//! Backup and recovery may run side by side, so every open log is keyed by
//! its operation id. Events carrying an `operation` field land only in that
//! operation's log; events without one (phase markers, staging cleanup) are
//! written to every open log.

use std::collections::HashMap;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, OnceLock};

use chrono::{SecondsFormat, Utc};
use serde_json::{Map, Value};
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use crate::model::{OperationId, OperationType};

pub const LOG_ENV: &str = "CRATEKEEPER_LOG";
pub const LOG_DIR_ENV: &str = "CRATEKEEPER_LOG_DIR";

static OPEN_LOGS: OnceLock<OperationLogs> = OnceLock::new();
static TRACING_INIT: OnceLock<()> = OnceLock::new();

#[derive(Default)]
struct OperationLogs {
    open: Mutex<HashMap<OperationId, BufWriter<File>>>,
}

impl OperationLogs {
    fn get() -> &'static Self {
        OPEN_LOGS.get_or_init(Self::default)
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<OperationId, BufWriter<File>>> {
        self.open.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn open(&self, operation: OperationId, path: &Path) -> std::io::Result<()> {
        let mut open = self.lock();
        if open.contains_key(&operation) {
            return Err(std::io::Error::new(
                std::io::ErrorKind::AlreadyExists,
                format!("operation log already open for {operation}"),
            ));
        }
        let file = OpenOptions::new().create_new(true).write(true).open(path)?;
        open.insert(operation, BufWriter::new(file));
        Ok(())
    }

    fn close(&self, operation: OperationId) -> std::io::Result<()> {
        let Some(mut writer) = self.lock().remove(&operation) else {
            return Ok(());
        };
        writer.flush()?;
        writer.get_ref().sync_all()
    }

    /// Lines that fail to write are dropped; logging never fails an operation.
    fn write(&self, operation: Option<OperationId>, line: &[u8]) {
        let mut open = self.lock();
        for (id, writer) in open.iter_mut() {
            if operation.is_none_or(|op| op == *id) {
                let _ = writer.write_all(line);
            }
        }
    }

    fn is_idle(&self) -> bool {
        self.lock().is_empty()
    }
}

/// Event fields as JSON, plus the operation they belong to when tagged.
#[derive(Default)]
struct EventFields {
    fields: Map<String, Value>,
    operation: Option<OperationId>,
}

impl EventFields {
    fn insert(&mut self, field: &Field, value: Value) {
        if field.name() == "operation" {
            self.operation = value.as_str().and_then(|s| s.parse().ok());
        }
        self.fields.insert(field.name().to_string(), value);
    }
}

impl Visit for EventFields {
    fn record_str(&mut self, field: &Field, value: &str) {
        self.insert(field, Value::from(value));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.insert(field, Value::from(value));
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.insert(field, Value::from(value));
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.insert(field, Value::from(value));
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        self.insert(field, Value::from(value));
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        self.insert(field, Value::from(format!("{value:?}")));
    }
}

struct OperationLogLayer;

impl<S: Subscriber> Layer<S> for OperationLogLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let logs = OperationLogs::get();
        if logs.is_idle() {
            return;
        }

        let mut fields = EventFields::default();
        event.record(&mut fields);
        let operation = fields.operation;
        let meta = event.metadata();
        let record = serde_json::json!({
            "timestamp": Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true),
            "level": meta.level().to_string(),
            "target": meta.target(),
            "fields": Value::Object(fields.fields),
        });

        let mut line = record.to_string().into_bytes();
        line.push(b'\n');
        logs.write(operation, &line);
    }
}

fn build_env_filter_from(cratekeeper_log: Option<&str>, rust_log: Option<&str>) -> EnvFilter {
    let default = || EnvFilter::new("debug");
    cratekeeper_log
        .or(rust_log)
        .map(|v| EnvFilter::try_new(v).unwrap_or_else(|_| default()))
        .unwrap_or_else(default)
}

fn build_env_filter() -> EnvFilter {
    build_env_filter_from(
        std::env::var(LOG_ENV).ok().as_deref(),
        std::env::var("RUST_LOG").ok().as_deref(),
    )
}

/// Installs the global subscriber once. Human-readable output goes to stderr
/// at `info` unless `verbose` is set.
pub fn init_logging(verbose: bool) {
    TRACING_INIT.get_or_init(|| {
        let console_level = if verbose { "debug" } else { "info" };
        let console = tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(false)
            .with_filter(EnvFilter::new(console_level));

        let _ = tracing_subscriber::registry()
            .with(OperationLogLayer.with_filter(build_env_filter()))
            .with(console)
            .try_init();
    });
}

/// Flushes and closes the operation's log when dropped.
pub struct OperationLogGuard {
    operation: OperationId,
    path: PathBuf,
}

impl OperationLogGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for OperationLogGuard {
    fn drop(&mut self) {
        if let Err(e) = OperationLogs::get().close(self.operation) {
            tracing::warn!(
                event = "log.close_failed",
                path = %self.path.display(),
                error = %e,
                "log.close_failed"
            );
        }
    }
}

/// Opens `<log dir>/op-<kind>-<utc>-<operation>.ndjson`. The log dir is
/// `CRATEKEEPER_LOG_DIR` when set, else `<data_dir>/logs`.
pub fn start_operation_log(
    kind: OperationType,
    operation: OperationId,
    data_dir: &Path,
) -> std::io::Result<OperationLogGuard> {
    init_logging(false);

    let log_dir = std::env::var_os(LOG_DIR_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|| data_dir.join("logs"));
    std::fs::create_dir_all(&log_dir)?;

    let path = log_dir.join(format!(
        "op-{kind}-{}-{operation}.ndjson",
        Utc::now().format("%Y%m%dT%H%M%SZ")
    ));
    OperationLogs::get().open(operation, &path)?;

    Ok(OperationLogGuard { operation, path })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn records(path: &Path) -> Vec<serde_json::Value> {
        std::fs::read_to_string(path)
            .unwrap()
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect()
    }

    fn operations(records: &[serde_json::Value]) -> Vec<String> {
        records
            .iter()
            .filter_map(|r| r["fields"]["operation"].as_str())
            .map(str::to_string)
            .collect()
    }

    #[test]
    fn env_filter_precedence_is_cratekeeper_then_rust_log_then_default() {
        let f1 = build_env_filter_from(Some("info"), Some("debug"));
        let f2 = build_env_filter_from(None, Some("warn"));
        let f3 = build_env_filter_from(None, None);

        assert_eq!(f1.to_string(), "info");
        assert_eq!(f2.to_string(), "warn");
        assert_eq!(f3.to_string(), "debug");
    }

    #[test]
    fn operation_log_records_tagged_events_and_closes_on_drop() {
        let temp = tempfile::tempdir().unwrap();
        let operation = uuid::Uuid::new_v4();
        let guard = start_operation_log(OperationType::Backup, operation, temp.path()).unwrap();

        let name = guard.path().file_name().unwrap().to_string_lossy().to_string();
        assert_eq!(guard.path().parent(), Some(temp.path().join("logs").as_path()));
        assert!(name.starts_with("op-backup-"));
        assert!(name.ends_with(&format!("{operation}.ndjson")));
        assert!(start_operation_log(OperationType::Backup, operation, temp.path()).is_err());

        tracing::debug!(
            event = "backup.entity.processing",
            operation = %operation,
            path = "/data/a.txt",
            expected_parts = 3u64,
            "backup.entity.processing"
        );

        let path = guard.path().to_path_buf();
        drop(guard);
        tracing::info!(event = "backup.completed", operation = %operation, "backup.completed");

        let records = records(&path);
        let processing = records
            .iter()
            .find(|r| r["fields"]["event"] == "backup.entity.processing")
            .unwrap();
        assert_eq!(processing["level"], "DEBUG");
        assert_eq!(processing["fields"]["expected_parts"], 3);
        assert_eq!(processing["fields"]["operation"], operation.to_string());
        assert!(processing["timestamp"].as_str().unwrap().ends_with('Z'));
        assert!(
            records
                .iter()
                .all(|r| r["fields"]["event"] != "backup.completed")
        );
    }

    #[test]
    fn concurrent_operations_get_separate_logs() {
        let temp = tempfile::tempdir().unwrap();
        let backup = uuid::Uuid::new_v4();
        let recovery = uuid::Uuid::new_v4();
        let backup_log = start_operation_log(OperationType::Backup, backup, temp.path()).unwrap();
        let recovery_log =
            start_operation_log(OperationType::Recovery, recovery, temp.path()).unwrap();

        tracing::info!(event = "backup.started", operation = %backup, "backup.started");
        tracing::info!(event = "recovery.started", operation = %recovery, "recovery.started");
        tracing::debug!(event = "phase.start", phase = "collection", "phase.start");

        let (backup_path, recovery_path) =
            (backup_log.path().to_path_buf(), recovery_log.path().to_path_buf());
        drop(backup_log);
        drop(recovery_log);

        let backup_records = records(&backup_path);
        let recovery_records = records(&recovery_path);
        assert!(operations(&backup_records).contains(&backup.to_string()));
        assert!(!operations(&backup_records).contains(&recovery.to_string()));
        assert!(operations(&recovery_records).contains(&recovery.to_string()));
        assert!(!operations(&recovery_records).contains(&backup.to_string()));

        for records in [&backup_records, &recovery_records] {
            assert!(records.iter().any(|r| r["fields"]["event"] == "phase.start"));
        }
    }
}
