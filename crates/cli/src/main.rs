use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand, ValueEnum};
use cratekeeper_core::model::{Destination, OperationId, OperationType};
use cratekeeper_core::remote::{
    ClientProvider, EndpointKind, ServiceEndpoint, StaticClientProvider,
};
use cratekeeper_core::state::StateStores;
use cratekeeper_core::{
    APP_NAME, BackupOptions, BackupRequest, BackupSource, BackupTracker, CacheRefreshConfig,
    CacheRefreshHandler, ClientConfig, ClientFactory, DatasetsCache, DefaultBackupTracker,
    DefaultRecoveryTracker, DefaultServiceDiscovery, DeviceSecret, DiscoveryTiming, Encoder,
    FileStaging, HttpClientFactory, IdentityConfig, MetadataExtractor, Providers, RecoveryOptions,
    RecoveryRequest, RecoverySource, RecoveryTracker, ServiceDiscoveryProvider, Specification,
    XChaChaEncoder, device_secret_path, init_logging, load_config, read_device_secret_file,
    run_backup_with, run_recovery_with, save_config, start_operation_log, to_toml,
    write_device_secret_file_private,
};
use regex::Regex;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

const CONFIG_DIR_ENV: &str = "CRATEKEEPER_CONFIG_DIR";
const DATA_DIR_ENV: &str = "CRATEKEEPER_DATA_DIR";
const STATE_FLUSH_EVERY: usize = 32;

#[derive(Parser)]
#[command(name = "cratekeeper")]
#[command(about = "CrateKeeper backup client", long_about = None)]
struct Cli {
    #[arg(long)]
    json: bool,

    /// Emit NDJSON task state events on stdout.
    #[arg(long)]
    events: bool,

    #[arg(long, short)]
    verbose: bool,

    #[arg(long)]
    config_dir: Option<PathBuf>,

    #[arg(long)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Creates a device identity, config file and device secret.
    Init {
        #[arg(long)]
        api_url: Option<String>,
        #[arg(long)]
        core_url: Option<String>,
    },
    Config {
        #[command(subcommand)]
        cmd: ConfigCmd,
    },
    Backup {
        #[command(subcommand)]
        cmd: BackupCmd,
    },
    Recover {
        #[command(subcommand)]
        cmd: RecoverCmd,
    },
    State {
        #[command(subcommand)]
        cmd: StateCmd,
    },
    /// Keeps service discovery and the dataset cache fresh until interrupted.
    Serve,
}

#[derive(Subcommand)]
enum ConfigCmd {
    Show,
}

#[derive(Subcommand)]
enum BackupCmd {
    Run(BackupRunArgs),
    Resume {
        #[arg(long)]
        operation: Uuid,
    },
}

#[derive(Args)]
struct BackupRunArgs {
    #[arg(long)]
    definition: Uuid,
    /// Rule file with `+`/`-` lines.
    #[arg(long, conflicts_with = "entity", required_unless_present = "entity")]
    rules: Option<PathBuf>,
    #[arg(long)]
    entity: Vec<PathBuf>,
}

#[derive(Subcommand)]
enum RecoverCmd {
    Run(RecoverRunArgs),
}

#[derive(Args)]
struct RecoverRunArgs {
    #[arg(long, conflicts_with = "entry", required_unless_present = "entry")]
    definition: Option<Uuid>,
    /// RFC 3339 timestamp; only entries created up to it are considered.
    #[arg(long, requires = "definition")]
    until: Option<String>,
    #[arg(long)]
    entry: Option<Uuid>,
    /// Restore under this directory instead of the original paths.
    #[arg(long)]
    destination: Option<PathBuf>,
    #[arg(long, requires = "destination")]
    keep_structure: bool,
    #[arg(long)]
    query: Option<String>,
}

#[derive(Subcommand)]
enum StateCmd {
    Show {
        #[arg(long, value_enum)]
        kind: StateKind,
        #[arg(long)]
        operation: Option<Uuid>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum StateKind {
    Backup,
    Recovery,
}

#[derive(Debug, Serialize)]
struct CliError {
    code: &'static str,
    message: String,
    details: serde_json::Value,
    retryable: bool,
}

impl CliError {
    fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: serde_json::json!({}),
            retryable: false,
        }
    }

    fn retryable(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: serde_json::json!({}),
            retryable: true,
        }
    }

    fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    let code = match run(cli).await {
        Ok(()) => 0,
        Err(e) => {
            emit_error(&e);
            1
        }
    };
    std::process::exit(code);
}

async fn run(cli: Cli) -> Result<(), CliError> {
    let config_dir = cli
        .config_dir
        .or_else(|| std::env::var(CONFIG_DIR_ENV).ok().map(PathBuf::from))
        .unwrap_or_else(default_config_dir);
    let data_dir = cli
        .data_dir
        .or_else(|| std::env::var(DATA_DIR_ENV).ok().map(PathBuf::from))
        .unwrap_or_else(default_data_dir);
    let out = Output {
        json: cli.json,
        events: cli.events,
    };

    match cli.cmd {
        Command::Init { api_url, core_url } => init(&config_dir, api_url, core_url, out),
        Command::Config { cmd } => match cmd {
            ConfigCmd::Show => config_show(&config_dir, out),
        },
        Command::Backup { cmd } => match cmd {
            BackupCmd::Run(args) => {
                let entities = match args.rules {
                    Some(rules) => BackupSource::Specification(
                        Specification::load(&rules).map_err(map_core_err)?,
                    ),
                    None => BackupSource::Entities(absolute_paths(args.entity)?),
                };
                let request = BackupRequest {
                    definition: args.definition,
                    source: entities,
                };
                let ctx = Context::build(&config_dir, &data_dir)?;
                backup_run(&ctx, Uuid::new_v4(), request, out).await
            }
            BackupCmd::Resume { operation } => {
                let ctx = Context::build(&config_dir, &data_dir)?;
                let state = ctx.providers.backup_tracker.state(operation).ok_or_else(|| {
                    CliError::new("operation.not_found", format!("no state for {operation}"))
                })?;
                let request = BackupRequest {
                    definition: state.definition,
                    source: BackupSource::Resumed(state),
                };
                backup_run(&ctx, operation, request, out).await
            }
        },
        Command::Recover { cmd } => match cmd {
            RecoverCmd::Run(args) => {
                let request = recovery_request(args)?;
                let ctx = Context::build(&config_dir, &data_dir)?;
                recover_run(&ctx, request, out).await
            }
        },
        Command::State { cmd } => match cmd {
            StateCmd::Show { kind, operation } => {
                let ctx = Context::build(&config_dir, &data_dir)?;
                state_show(&ctx, kind, operation, out)
            }
        },
        Command::Serve => {
            let ctx = Context::build(&config_dir, &data_dir)?;
            serve(&ctx, out).await
        }
    }
}

#[derive(Clone, Copy)]
struct Output {
    json: bool,
    events: bool,
}

impl Output {
    fn task_state(&self, operation: OperationId, kind: OperationType, state: &str) {
        if !self.events {
            return;
        }
        println!(
            "{}",
            serde_json::json!({
                "type": "task.state",
                "taskId": operation,
                "kind": kind,
                "state": state,
            })
        );
    }
}

/// Everything a command needs once the config and device secret are loaded.
struct Context {
    config: ClientConfig,
    data_dir: PathBuf,
    stores: StateStores,
    clients: ServiceDiscoveryProvider,
    providers: Providers,
}

impl Context {
    fn build(config_dir: &Path, data_dir: &Path) -> Result<Self, CliError> {
        let config = load_config(config_dir).map_err(map_core_err)?.ok_or_else(|| {
            CliError::new(
                "config.missing",
                format!("no config in {}; run `cratekeeper init`", config_dir.display()),
            )
        })?;
        let identity = config.device_identity();

        let secret_path = device_secret_path(config_dir);
        let secret = Arc::new(
            read_device_secret_file(&secret_path, identity.user, identity.device).map_err(
                |e| {
                    CliError::new("secret.unavailable", e.to_string())
                        .with_details(serde_json::json!({ "path": secret_path }))
                },
            )?,
        );
        let encoder: Arc<dyn Encoder> = Arc::new(XChaChaEncoder);

        let factory: Arc<dyn ClientFactory> = Arc::new(HttpClientFactory::new(
            config.api.credentials.clone(),
            Arc::clone(&secret),
            config.secrets.clone(),
            Arc::clone(&encoder),
        ));
        let clients = client_provider(&config, factory);

        let stores = StateStores::new(data_dir.join("state"), config.backup.state_versions);
        let staging = FileStaging::new(data_dir.join("staging")).map_err(map_core_err)?;

        let providers = Providers {
            identity,
            secret,
            derivation: config.secrets.clone(),
            extractor: MetadataExtractor::new(
                config.backup.checksum,
                config.backup.compression.clone(),
            ),
            encoder,
            staging,
            max_part_size: config.backup.max_part_size,
            clients: Arc::new(clients.clone()),
            backup_tracker: Arc::new(DefaultBackupTracker::persistent(
                stores.clone(),
                STATE_FLUSH_EVERY,
            )),
            recovery_tracker: Arc::new(DefaultRecoveryTracker::persistent(
                stores.clone(),
                STATE_FLUSH_EVERY,
            )),
        };

        Ok(Self {
            config,
            data_dir: data_dir.to_path_buf(),
            stores,
            clients,
            providers,
        })
    }
}

fn client_provider(config: &ClientConfig, factory: Arc<dyn ClientFactory>) -> ServiceDiscoveryProvider {
    let api = ServiceEndpoint {
        id: "configured.api".to_string(),
        kind: EndpointKind::Api,
        url: config.api.url.clone(),
    };
    let core = ServiceEndpoint {
        id: "configured.core".to_string(),
        kind: EndpointKind::Core,
        url: config.core.url.clone(),
    };

    if !config.discovery.enabled {
        let core = factory.core(&core);
        let api = factory.api(&api, Arc::clone(&core));
        return ServiceDiscoveryProvider::Disabled(StaticClientProvider::new(api, core));
    }

    let discovery = ServiceEndpoint {
        id: "configured.discovery".to_string(),
        kind: EndpointKind::Discovery,
        url: config.discovery.url.clone(),
    };
    let timing = DiscoveryTiming {
        initial_delay: Duration::from_secs(config.discovery.initial_delay_secs),
        interval: Duration::from_secs(config.discovery.interval_secs),
    };
    ServiceDiscoveryProvider::Default(Arc::new(DefaultServiceDiscovery::new(
        factory,
        vec![discovery, api, core],
        timing,
    )))
}

/// Cancels `token` on Ctrl-C.
fn cancel_on_interrupt(token: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!(event = "cli.interrupted", "cli.interrupted");
            token.cancel();
        }
    });
}

fn init(
    config_dir: &Path,
    api_url: Option<String>,
    core_url: Option<String>,
    out: Output,
) -> Result<(), CliError> {
    if load_config(config_dir).map_err(map_core_err)?.is_some() {
        return Err(CliError::new(
            "config.exists",
            format!("config already exists in {}", config_dir.display()),
        ));
    }
    let secret_path = device_secret_path(config_dir);
    if secret_path.exists() {
        return Err(CliError::new(
            "secret.exists",
            format!("device secret already exists: {}", secret_path.display()),
        ));
    }

    let mut config = ClientConfig::new(IdentityConfig {
        user: Uuid::new_v4(),
        device: Uuid::new_v4(),
        node: Uuid::new_v4(),
    });
    if let Some(url) = api_url {
        config.api.url = url;
    }
    if let Some(url) = core_url {
        config.core.url = url;
    }
    save_config(config_dir, &config).map_err(map_core_err)?;

    let secret = DeviceSecret::generate(config.identity.user, config.identity.device);
    write_device_secret_file_private(&secret_path, &secret).map_err(map_core_err)?;

    if out.json {
        println!(
            "{}",
            serde_json::json!({ "identity": config.identity, "secret": secret_path })
        );
    } else {
        println!("user={}", config.identity.user);
        println!("device={}", config.identity.device);
        println!("node={}", config.identity.node);
        println!("secret={}", secret_path.display());
    }
    Ok(())
}

fn config_show(config_dir: &Path, out: Output) -> Result<(), CliError> {
    let config = load_config(config_dir)
        .map_err(map_core_err)?
        .ok_or_else(|| CliError::new("config.missing", "config not found"))?;
    let secret_present = device_secret_path(config_dir).exists();

    if out.json {
        println!(
            "{}",
            serde_json::json!({ "config": config, "secrets": { "deviceSecretPresent": secret_present } })
        );
    } else {
        let text = to_toml(&config).map_err(map_core_err)?;
        print!("{text}");
        if !text.ends_with('\n') {
            println!();
        }
        println!();
        println!("deviceSecretPresent={secret_present}");
    }
    Ok(())
}

async fn backup_run(
    ctx: &Context,
    operation: OperationId,
    request: BackupRequest,
    out: Output,
) -> Result<(), CliError> {
    let _log = start_operation_log(OperationType::Backup, operation, &ctx.data_dir)
        .map_err(|e| CliError::new("log.unavailable", e.to_string()))?;
    let cancel = CancellationToken::new();
    cancel_on_interrupt(cancel.clone());

    out.task_state(operation, OperationType::Backup, "running");
    let options = BackupOptions {
        cancel: Some(&cancel),
    };
    let result = run_backup_with(&ctx.providers, operation, request, options)
        .await
        .map_err(|e| {
            out.task_state(operation, OperationType::Backup, "failed");
            map_core_err(e).with_details(serde_json::json!({ "operation": operation }))
        })?;
    out.task_state(operation, OperationType::Backup, "succeeded");
    if out.events {
        return Ok(());
    }

    if out.json {
        println!(
            "{}",
            serde_json::to_string(&result)
                .map_err(|e| CliError::new("output.invalid", e.to_string()))?
        );
    } else {
        println!("operation={} entry={}", result.operation, result.entry);
        println!(
            "discovered={} collected={} processed={} failed={} unmatchedRules={}",
            result.entities_discovered,
            result.entities_collected,
            result.entities_processed,
            result.entities_failed,
            result.entities_unmatched
        );
        println!(
            "cratesPushed={} bytesRead={} bytesPushed={}",
            result.crates_pushed, result.bytes_read, result.bytes_pushed
        );
    }
    Ok(())
}

fn recovery_request(args: RecoverRunArgs) -> Result<RecoveryRequest, CliError> {
    let source = match (args.entry, args.definition) {
        (Some(entry), _) => RecoverySource::Entry(entry),
        (None, Some(definition)) => {
            let until = args
                .until
                .as_deref()
                .map(parse_until)
                .transpose()?;
            RecoverySource::Latest { definition, until }
        }
        (None, None) => {
            return Err(CliError::new(
                "args.invalid",
                "either --definition or --entry is required",
            ));
        }
    };

    let destination = match args.destination {
        Some(path) => Destination::Directory {
            path: absolute_path(path)?,
            keep_default_structure: args.keep_structure,
        },
        None => Destination::Default,
    };

    let query = args
        .query
        .as_deref()
        .map(Regex::new)
        .transpose()
        .map_err(|e| CliError::new("args.invalid", format!("invalid query: {e}")))?;

    Ok(RecoveryRequest {
        source,
        destination,
        query,
    })
}

fn parse_until(text: &str) -> Result<DateTime<Utc>, CliError> {
    DateTime::parse_from_rfc3339(text)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| CliError::new("args.invalid", format!("invalid --until: {e}")))
}

async fn recover_run(ctx: &Context, request: RecoveryRequest, out: Output) -> Result<(), CliError> {
    let operation = Uuid::new_v4();
    let _log = start_operation_log(OperationType::Recovery, operation, &ctx.data_dir)
        .map_err(|e| CliError::new("log.unavailable", e.to_string()))?;
    let cancel = CancellationToken::new();
    cancel_on_interrupt(cancel.clone());

    out.task_state(operation, OperationType::Recovery, "running");
    let options = RecoveryOptions {
        cancel: Some(&cancel),
    };
    let result = run_recovery_with(&ctx.providers, operation, request, options)
        .await
        .map_err(|e| {
            out.task_state(operation, OperationType::Recovery, "failed");
            map_core_err(e).with_details(serde_json::json!({ "operation": operation }))
        })?;
    out.task_state(operation, OperationType::Recovery, "succeeded");
    if out.events {
        return Ok(());
    }

    if out.json {
        println!(
            "{}",
            serde_json::to_string(&result)
                .map_err(|e| CliError::new("output.invalid", e.to_string()))?
        );
    } else {
        println!("operation={} entry={}", result.operation, result.entry);
        println!(
            "examined={} collected={} processed={} failed={}",
            result.entities_examined,
            result.entities_collected,
            result.entities_processed,
            result.entities_failed
        );
        println!(
            "cratesPulled={} bytesWritten={}",
            result.crates_pulled, result.bytes_written
        );
    }
    Ok(())
}

fn state_show(
    ctx: &Context,
    kind: StateKind,
    operation: Option<Uuid>,
    out: Output,
) -> Result<(), CliError> {
    let kind = match kind {
        StateKind::Backup => OperationType::Backup,
        StateKind::Recovery => OperationType::Recovery,
    };
    let requested = operation.is_some();
    let operations = match operation {
        Some(operation) => vec![operation],
        None => ctx.stores.operations(kind).map_err(map_core_err)?,
    };

    let mut states = Vec::new();
    for operation in operations {
        let state = match kind {
            OperationType::Backup => ctx
                .providers
                .backup_tracker
                .state(operation)
                .map(serde_json::to_value),
            _ => ctx
                .providers
                .recovery_tracker
                .state(operation)
                .map(serde_json::to_value),
        };
        match state {
            Some(value) => {
                states.push(value.map_err(|e| CliError::new("output.invalid", e.to_string()))?)
            }
            None if requested => {
                return Err(CliError::new(
                    "operation.not_found",
                    format!("no readable state for {operation}"),
                ));
            }
            None => {}
        }
    }

    if out.json {
        println!("{}", serde_json::json!({ "kind": kind, "states": states }));
    } else {
        for state in &states {
            println!("{}", summarize_state(state));
        }
    }
    Ok(())
}

fn summarize_state(state: &serde_json::Value) -> String {
    let field = |name: &str| {
        state
            .get(name)
            .filter(|v| !v.is_null())
            .map(|v| v.as_str().map(str::to_string).unwrap_or_else(|| v.to_string()))
            .unwrap_or_else(|| "-".to_string())
    };
    let count = |name: &str| {
        state
            .get("entities")
            .and_then(|e| e.get(name))
            .map(|v| {
                v.as_object()
                    .map(|o| o.len())
                    .or_else(|| v.as_array().map(|a| a.len()))
                    .unwrap_or(0)
            })
            .unwrap_or(0)
    };
    let failures = state
        .get("failures")
        .and_then(|f| f.as_array())
        .map(|f| f.len())
        .unwrap_or(0);
    format!(
        "operation={} started={} completed={} entry={} collected={} processed={} failed={} failures={}",
        field("operation"),
        field("started"),
        field("completed"),
        field("entry"),
        count("collected"),
        count("processed"),
        count("failed"),
        failures
    )
}

async fn serve(ctx: &Context, out: Output) -> Result<(), CliError> {
    let refresh =
        CacheRefreshConfig::from_settings(&ctx.config.cache_refresh).map_err(map_core_err)?;
    let clients: Arc<dyn ClientProvider> = Arc::new(ctx.clients.clone());
    let handler = CacheRefreshHandler::new(refresh, clients, Arc::new(DatasetsCache::default()));

    tracing::info!(event = "cli.serve_started", app = APP_NAME, "cli.serve_started");
    ctx.clients.start();
    handler.start();

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| CliError::new("signal.unavailable", e.to_string()))?;

    handler.stop().await;
    ctx.clients.stop().await;
    tracing::info!(event = "cli.serve_stopped", "cli.serve_stopped");

    let stats = handler.stats();
    if out.json {
        let stats: serde_json::Map<String, serde_json::Value> = stats
            .iter()
            .map(|(target, s)| {
                (
                    target.to_string(),
                    serde_json::json!({
                        "successes": s.successes,
                        "failures": s.failures,
                        "lastSuccess": s.last_success,
                        "lastFailure": s.last_failure,
                        "lastError": s.last_error,
                    }),
                )
            })
            .collect();
        println!("{}", serde_json::json!({ "refresh": stats }));
    } else {
        let mut lines: Vec<String> = stats
            .iter()
            .map(|(target, s)| {
                format!(
                    "{target} successes={} failures={}",
                    s.successes, s.failures
                )
            })
            .collect();
        lines.sort();
        for line in lines {
            println!("{line}");
        }
    }
    Ok(())
}

fn absolute_path(path: PathBuf) -> Result<PathBuf, CliError> {
    std::path::absolute(&path)
        .map_err(|e| CliError::new("args.invalid", format!("{}: {e}", path.display())))
}

fn absolute_paths(paths: Vec<PathBuf>) -> Result<Vec<PathBuf>, CliError> {
    paths.into_iter().map(absolute_path).collect()
}

fn default_config_dir() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    PathBuf::from(home).join(".config").join(APP_NAME.to_lowercase())
}

fn default_data_dir() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    PathBuf::from(home)
        .join(".local")
        .join("share")
        .join(APP_NAME.to_lowercase())
}

fn map_core_err(e: cratekeeper_core::Error) -> CliError {
    use cratekeeper_core::Error;
    match e {
        Error::InvalidConfig { message } => CliError::new("config.invalid", message),
        Error::Remote { message } => CliError::retryable("remote.unavailable", message),
        Error::Http(e) => CliError::retryable("remote.unavailable", e.to_string()),
        Error::MissingCrate { crate_id } => {
            CliError::new("crate.missing", format!("missing crate: {crate_id}"))
        }
        Error::Integrity { message } => CliError::new("integrity", message),
        Error::Crypto => CliError::new("crypto.failed", "decryption failed"),
        Error::Cancelled => CliError::new("task.cancelled", "cancelled"),
        Error::OperationNotFound { operation } => CliError::new(
            "operation.not_found",
            format!("operation not found: {operation}"),
        ),
        Error::OperationAlreadyCompleted { operation } => CliError::new(
            "operation.completed",
            format!("operation already completed: {operation}"),
        ),
        other => CliError::new("unknown", other.to_string()),
    }
}

fn emit_error(e: &CliError) {
    let json = serde_json::to_string(e).unwrap_or_else(|_| "{\"code\":\"unknown\",\"message\":\"json encode failed\",\"details\":{},\"retryable\":false}".to_string());
    let _ = writeln!(std::io::stderr(), "{json}");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backup_run_requires_rules_or_entities() {
        assert!(Cli::try_parse_from(["cratekeeper", "backup", "run", "--definition", &Uuid::new_v4().to_string()]).is_err());
        assert!(
            Cli::try_parse_from([
                "cratekeeper",
                "backup",
                "run",
                "--definition",
                &Uuid::new_v4().to_string(),
                "--rules",
                "rules.txt",
                "--entity",
                "/tmp/a",
            ])
            .is_err()
        );
        assert!(
            Cli::try_parse_from([
                "cratekeeper",
                "backup",
                "run",
                "--definition",
                &Uuid::new_v4().to_string(),
                "--entity",
                "/tmp/a",
                "--entity",
                "/tmp/b",
            ])
            .is_ok()
        );
    }

    #[test]
    fn recovery_request_from_args() {
        let definition = Uuid::new_v4();
        let args = RecoverRunArgs {
            definition: Some(definition),
            until: Some("2024-05-01T12:00:00+02:00".to_string()),
            entry: None,
            destination: Some(PathBuf::from("/restore")),
            keep_structure: true,
            query: Some(r"\.txt$".to_string()),
        };
        let request = recovery_request(args).unwrap();

        match request.source {
            RecoverySource::Latest { definition: d, until } => {
                assert_eq!(d, definition);
                assert_eq!(until.unwrap().to_rfc3339(), "2024-05-01T10:00:00+00:00");
            }
            other => panic!("unexpected source: {other:?}"),
        }
        assert_eq!(
            request.destination,
            Destination::Directory {
                path: PathBuf::from("/restore"),
                keep_default_structure: true,
            }
        );
        assert!(request.query.unwrap().is_match("notes.txt"));
    }

    #[test]
    fn invalid_query_is_rejected() {
        let args = RecoverRunArgs {
            definition: None,
            until: None,
            entry: Some(Uuid::new_v4()),
            destination: None,
            keep_structure: false,
            query: Some("(".to_string()),
        };
        let err = recovery_request(args).unwrap_err();
        assert_eq!(err.code, "args.invalid");
    }

    #[test]
    fn state_summary_counts_entities() {
        let state = serde_json::json!({
            "operation": "op",
            "started": "2024-01-01T00:00:00Z",
            "completed": null,
            "entities": { "collected": { "/a": {}, "/b": {} }, "processed": {}, "failed": { "/b": "gone" } },
            "failures": ["push rejected"],
        });
        let line = summarize_state(&state);
        assert!(line.contains("collected=2"));
        assert!(line.contains("failed=1"));
        assert!(line.contains("completed=-"));
        assert!(line.contains("failures=1"));
    }
}
