//! # PostgreSQL Partition Migrator
//!
//! Moves data from trigger- or rule-partitioned tables on a legacy
//! PostgreSQL source into a freshly provisioned target, safely, resumably
//! and at high throughput.
//!
//! The binary is the reference observer: it assembles a run request from
//! the config file and CLI flags, spawns the migration worker, renders
//! progress and log events, answers truncate prompts and maps the final
//! run status to an exit code (0 completed, 2 failed, 3 canceled).

pub mod bus;
pub mod config;
pub mod discovery;
pub mod domain;
pub mod engine;
pub mod logging;
pub mod paths;
pub mod pg;
pub mod schema_builder;
pub mod store;
pub mod vault;

use std::io::Write as _;
use std::process;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use log::error;

use crate::bus::{EngineEvent, LogLevel, TruncateDecision, WorkerState};
use crate::config::{AppConfig, CliArgs};
use crate::domain::errors::{MigrationError, Result};
use crate::domain::models::ConnectionProfile;
use crate::engine::worker;
use crate::logging::SessionLogger;
use crate::paths::AppPaths;
use crate::store::logs::LogSink;
use crate::store::profiles::ProfileSpec;
use crate::store::Store;
use crate::vault::CredentialVault;

/// Queue depth for the background log writer.
const LOG_QUEUE_CAPACITY: usize = 4096;

fn main() {
    // 1. Parse arguments and load the run request.
    let args = CliArgs::parse();
    let mut app_config = match &args.config {
        Some(path) => match AppConfig::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("failed to load config: {e}");
                process::exit(2);
            }
        },
        None => AppConfig::default(),
    };
    if let Err(e) = app_config.merge_cli(&args) {
        eprintln!("invalid arguments: {e}");
        process::exit(2);
    }
    if let Err(e) = app_config.validate() {
        eprintln!("invalid configuration: {e}");
        process::exit(2);
    }

    // 2. Resolve storage, the metadata store and the credential vault.
    let exit_code = match run(app_config) {
        Ok(code) => code,
        Err(e) => {
            error!("startup failed: {e}");
            eprintln!("startup failed: {e}");
            2
        }
    };
    process::exit(exit_code);
}

fn run(app_config: AppConfig) -> Result<i32> {
    let app_paths = AppPaths::resolve()?;
    let store = Store::open(&app_paths.db_path())?;
    let vault = CredentialVault::load(&app_paths.vault_key_path())?;

    // 3. Session logging: file + store sink + observer bus, behind the
    //    `log` facade.
    let logger = SessionLogger::new(app_paths.logs_dir()?);
    let sink = Arc::new(LogSink::spawn(store.clone(), LOG_QUEUE_CAPACITY));
    logger.attach_sink(sink.clone());
    logging::install_facade(logger.clone())?;

    let (event_bus, event_stream) = bus::channel();
    logger.attach_bus(event_bus.clone());

    // 4. Resolve the profile (inline block upserts; otherwise stored).
    let profile = resolve_profile(&store, &vault, &app_config)?;
    logger.info(
        "main",
        &format!(
            "profile {} ({} -> {})",
            profile.name,
            profile.source.describe(),
            profile.target.describe()
        ),
    );

    // 5. Spawn the worker and observe it until a terminal state.
    let request = app_config.to_run_request();
    let assume_yes = request.auto_approve_truncate;
    let handle = worker::spawn(
        store.clone(),
        logger.clone(),
        profile,
        request,
        event_bus,
    );

    observe(&event_stream, &handle, assume_yes);

    // 6. Join, drain the log queue, exit with the run's code.
    let summary = handle.join();
    if let Some(e) = &summary.error {
        eprintln!("run ended {}: {e}", summary.status.as_str());
    }
    println!(
        "run {}: {} partition(s), {} row(s)",
        summary.status.as_str(),
        summary.completed_partitions,
        summary.total_rows
    );
    sink.flush(Duration::from_secs(10));
    if sink.dropped_count() > 0 {
        eprintln!(
            "warning: {} log entries were dropped under backpressure",
            sink.dropped_count()
        );
    }
    Ok(summary.exit_code())
}

/// Pumps engine events to the console until the worker reaches a terminal
/// state, answering truncate prompts from stdin.
fn observe(stream: &bus::EventStream, handle: &worker::WorkerHandle, assume_yes: bool) {
    loop {
        if let Some(progress) = stream.latest_progress() {
            println!(
                "[{}/{}] {} {}/{} rows | total {} rows | {:.0} rows/s {:.2} MB/s | ETA {:.0}s",
                progress.partition_index + 1,
                progress.total_partitions,
                progress.partition,
                progress.partition_rows,
                progress.partition_total_rows,
                progress.total_rows,
                progress.rows_per_sec,
                progress.mb_per_sec,
                progress.eta_seconds
            );
        }

        match stream.events.recv_timeout(Duration::from_millis(200)) {
            Ok(EngineEvent::Log {
                level,
                component,
                message,
            }) => {
                if level != LogLevel::Debug {
                    println!("[{}] [{component}] {message}", level.as_str());
                }
            }
            Ok(EngineEvent::State(state)) => {
                println!("worker state: {state:?}");
                if matches!(
                    state,
                    WorkerState::Completed | WorkerState::Failed | WorkerState::Canceled
                ) {
                    return;
                }
            }
            Ok(EngineEvent::ConnectionStatus { role, ok, message }) => {
                println!(
                    "{role:?} connection: {} ({message})",
                    if ok { "ok" } else { "FAILED" }
                );
            }
            Ok(EngineEvent::TruncateRequest {
                partition,
                existing_rows,
            }) => {
                let decision = if assume_yes {
                    TruncateDecision::Approve
                } else {
                    prompt_truncate(&partition, existing_rows)
                };
                handle.respond_truncate(decision);
            }
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => continue,
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => return,
        }
    }
}

fn prompt_truncate(partition: &str, existing_rows: i64) -> TruncateDecision {
    print!("{partition} already holds {existing_rows} row(s). Truncate and overwrite? [y/N] ");
    let _ = std::io::stdout().flush();
    let mut answer = String::new();
    if std::io::stdin().read_line(&mut answer).is_err() {
        return TruncateDecision::Deny;
    }
    match answer.trim().to_lowercase().as_str() {
        "y" | "yes" => TruncateDecision::Approve,
        _ => TruncateDecision::Deny,
    }
}

/// Inline profile blocks are written through to the store so later runs
/// can reference them by name; otherwise the name must already exist.
fn resolve_profile(
    store: &Store,
    vault: &CredentialVault,
    app_config: &AppConfig,
) -> Result<ConnectionProfile> {
    if let Some(inline) = &app_config.profile {
        return store.upsert_profile(
            vault,
            &ProfileSpec {
                name: inline.name.clone(),
                description: inline.description.clone(),
                source: inline.source.clone(),
                target: inline.target.clone(),
                compat_mode: inline.compat_mode,
            },
        );
    }

    let name = app_config
        .migration
        .profile
        .as_deref()
        .expect("validated: profile name present");
    store.profile_by_name(vault, name)?.ok_or_else(|| {
        MigrationError::Config(format!(
            "profile {name} not found; define it in the config file first"
        ))
    })
}
