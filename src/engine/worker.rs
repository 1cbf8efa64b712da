//! # Base Worker
//!
//! Owns one migration run end to end: lifecycle state machine, the
//! pause/stop gate observed at every suspension point, per-partition
//! checkpoint gating, the transient-retry policy and run finalization.
//! The engine variant only supplies the per-partition copy routine.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, Sender};
use log::{error, info, warn};
use postgres::{CancelToken, NoTls};

use crate::bus::{ConnectionRole, EngineEvent, EventBus, TruncateDecision, WorkerState};
use crate::discovery::{self, DiscoveryRequest};
use crate::domain::errors::{ErrorKind, MigrationError, Result};
use crate::domain::models::{
    Checkpoint, CheckpointStatus, ConnectionProfile, EngineKind, PartitionDescriptor, RunStatus,
};
use crate::domain::table_types::TableType;
use crate::engine::metrics::ProgressTracker;
use crate::engine::Engine;
use crate::logging::SessionLogger;
use crate::pg;
use crate::schema_builder::TruncateConfirmer;
use crate::store::runs::NewRun;
use crate::store::Store;

const PAUSE_POLL: Duration = Duration::from_millis(50);
/// Backoff schedule for transient failures.
const RETRY_BACKOFF: [Duration; 3] = [
    Duration::from_secs(1),
    Duration::from_secs(4),
    Duration::from_secs(16),
];
/// Minimum interval between progress events.
const PROGRESS_INTERVAL: Duration = Duration::from_secs(1);

/// Everything the observer asked for in one run.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub start: chrono::NaiveDate,
    pub end: chrono::NaiveDate,
    pub types: Vec<TableType>,
    pub engine: EngineKind,
    pub resume: bool,
    pub continue_on_error: bool,
    /// Answers truncate prompts with `Approve` without asking the observer.
    pub auto_approve_truncate: bool,
}

/// Terminal report returned from `WorkerHandle::join`.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub run_id: Option<i64>,
    pub status: RunStatus,
    pub completed_partitions: usize,
    pub total_rows: u64,
    pub error: Option<String>,
}

impl RunSummary {
    /// Process exit code: 0 completed, 2 failed, 3 canceled.
    pub fn exit_code(&self) -> i32 {
        match self.status {
            RunStatus::Completed => 0,
            RunStatus::Canceled => 3,
            _ => 2,
        }
    }
}

// --- State cell ------------------------------------------------------------

/// Worker state with monotone transitions; every accepted change emits a
/// state event. Terminal states are frozen.
#[derive(Clone)]
pub struct StateCell {
    state: Arc<Mutex<WorkerState>>,
    bus: EventBus,
}

impl StateCell {
    pub fn new(bus: EventBus) -> StateCell {
        StateCell {
            state: Arc::new(Mutex::new(WorkerState::Idle)),
            bus,
        }
    }

    pub fn get(&self) -> WorkerState {
        *self.state.lock().expect("state mutex")
    }

    /// Applies the transition if it is legal; returns whether it took.
    pub fn set(&self, next: WorkerState) -> bool {
        let mut guard = self.state.lock().expect("state mutex");
        if !transition_allowed(*guard, next) {
            return false;
        }
        *guard = next;
        drop(guard);
        self.bus.emit_state(next);
        true
    }
}

fn transition_allowed(from: WorkerState, to: WorkerState) -> bool {
    use WorkerState::*;
    if from == to {
        return false;
    }
    match from {
        Idle => to == Running,
        Running => matches!(to, Paused | Completed | Failed | Canceled),
        Paused => matches!(to, Running | Canceled | Failed),
        // Terminal states never change again.
        Completed | Failed | Canceled => false,
    }
}

// --- Control gate ----------------------------------------------------------

/// Single cancellation/pause token shared by every blocking call in a run.
/// `stop` additionally cancels any registered in-flight server query.
#[derive(Clone)]
pub struct ControlGate {
    paused: Arc<AtomicBool>,
    stopped: Arc<AtomicBool>,
    cancel_tokens: Arc<Mutex<Vec<CancelToken>>>,
    state: StateCell,
}

impl ControlGate {
    pub fn new(state: StateCell) -> ControlGate {
        ControlGate {
            paused: Arc::new(AtomicBool::new(false)),
            stopped: Arc::new(AtomicBool::new(false)),
            cancel_tokens: Arc::new(Mutex::new(Vec::new())),
            state,
        }
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    /// Requests cancellation and interrupts in-flight COPY/queries by
    /// canceling their backend connections.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.paused.store(false, Ordering::SeqCst);
        if let Ok(tokens) = self.cancel_tokens.lock() {
            for token in tokens.iter() {
                if let Err(e) = token.cancel_query(NoTls) {
                    warn!("cancel request failed: {e}");
                }
            }
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Suspension point: blocks while paused, errors once stopped. Engines
    /// call this before every network round-trip and batch.
    pub fn pause_point(&self) -> Result<()> {
        if self.is_stopped() {
            return Err(MigrationError::Canceled);
        }
        if self.paused.load(Ordering::SeqCst) {
            self.state.set(WorkerState::Paused);
            while self.paused.load(Ordering::SeqCst) && !self.is_stopped() {
                std::thread::sleep(PAUSE_POLL);
            }
            if self.is_stopped() {
                return Err(MigrationError::Canceled);
            }
            self.state.set(WorkerState::Running);
        }
        Ok(())
    }

    /// Gate-aware sleep used by the retry backoff.
    pub fn sleep(&self, duration: Duration) -> Result<()> {
        let deadline = Instant::now() + duration;
        while Instant::now() < deadline {
            self.pause_point()?;
            std::thread::sleep(PAUSE_POLL.min(duration));
        }
        Ok(())
    }

    /// Registers a backend to cancel on `stop`; cleared per partition.
    pub fn register_cancel_token(&self, token: CancelToken) {
        if let Ok(mut tokens) = self.cancel_tokens.lock() {
            tokens.push(token);
        }
    }

    pub fn clear_cancel_tokens(&self) {
        if let Ok(mut tokens) = self.cancel_tokens.lock() {
            tokens.clear();
        }
    }
}

// --- Progress emission -----------------------------------------------------

/// Rate-limits progress events to one per second, with forced emission at
/// partition boundaries.
pub struct ProgressEmitter {
    last_emit: Option<Instant>,
}

impl ProgressEmitter {
    pub fn new() -> ProgressEmitter {
        ProgressEmitter { last_emit: None }
    }

    pub fn maybe_emit(&mut self, bus: &EventBus, tracker: &ProgressTracker, force: bool) {
        let due = match self.last_emit {
            Some(at) => at.elapsed() >= PROGRESS_INTERVAL,
            None => true,
        };
        if force || due {
            bus.publish_progress(tracker.snapshot());
            self.last_emit = Some(Instant::now());
        }
    }
}

impl Default for ProgressEmitter {
    fn default() -> Self {
        Self::new()
    }
}

// --- Truncate confirmation -------------------------------------------------

/// Routes truncate confirmations over the bus and blocks for the
/// observer's decision, honoring stop while waiting.
pub struct BusConfirmer {
    bus: EventBus,
    decisions: Receiver<TruncateDecision>,
    gate: ControlGate,
    auto_approve: bool,
}

impl TruncateConfirmer for BusConfirmer {
    fn confirm(&self, partition: &str, existing_rows: i64) -> Result<TruncateDecision> {
        if self.auto_approve {
            return Ok(TruncateDecision::Approve);
        }
        // Stale answers from a previous prompt must not satisfy this one.
        while self.decisions.try_recv().is_ok() {}

        self.bus.emit(EngineEvent::TruncateRequest {
            partition: partition.to_string(),
            existing_rows,
        });
        loop {
            if self.gate.is_stopped() {
                return Err(MigrationError::Canceled);
            }
            match self.decisions.recv_timeout(Duration::from_millis(100)) {
                Ok(decision) => return Ok(decision),
                Err(crossbeam_channel::RecvTimeoutError::Timeout) => continue,
                Err(crossbeam_channel::RecvTimeoutError::Disconnected) => {
                    return Err(MigrationError::Canceled)
                }
            }
        }
    }
}

// --- Per-partition context -------------------------------------------------

/// Shared capabilities handed to the engine's per-partition routine.
pub struct PartitionCtx<'a> {
    pub run_id: i64,
    pub partition_index: usize,
    pub store: &'a Store,
    pub bus: &'a EventBus,
    pub gate: &'a ControlGate,
    pub tracker: &'a mut ProgressTracker,
    pub emitter: &'a mut ProgressEmitter,
    pub confirmer: &'a dyn TruncateConfirmer,
}

// --- Worker ----------------------------------------------------------------

/// Handle held by the observer: control surface plus the join point.
pub struct WorkerHandle {
    gate: ControlGate,
    decisions_tx: Sender<TruncateDecision>,
    thread: Option<JoinHandle<RunSummary>>,
}

impl WorkerHandle {
    pub fn pause(&self) {
        self.gate.pause();
    }

    pub fn resume(&self) {
        self.gate.resume();
    }

    pub fn stop(&self) {
        self.gate.stop();
    }

    pub fn respond_truncate(&self, decision: TruncateDecision) {
        let _ = self.decisions_tx.send(decision);
    }

    /// Waits for the run to end and returns its summary.
    pub fn join(mut self) -> RunSummary {
        match self.thread.take().map(|t| t.join()) {
            Some(Ok(summary)) => summary,
            _ => RunSummary {
                run_id: None,
                status: RunStatus::Failed,
                completed_partitions: 0,
                total_rows: 0,
                error: Some("worker thread panicked".to_string()),
            },
        }
    }
}

/// Spawns the worker thread for one run.
pub fn spawn(
    store: Store,
    logger: SessionLogger,
    profile: ConnectionProfile,
    request: RunRequest,
    bus: EventBus,
) -> WorkerHandle {
    let state = StateCell::new(bus.clone());
    let gate = ControlGate::new(state.clone());
    let (decisions_tx, decisions_rx) = unbounded();

    let handle_gate = gate.clone();
    let thread = std::thread::Builder::new()
        .name("migration-worker".to_string())
        .spawn(move || {
            let worker = MigrationWorker {
                store,
                logger,
                profile,
                request,
                bus,
                state,
                gate,
                decisions_rx,
            };
            worker.run()
        })
        .expect("failed to spawn migration worker");

    WorkerHandle {
        gate: handle_gate,
        decisions_tx,
        thread: Some(thread),
    }
}

struct MigrationWorker {
    store: Store,
    logger: SessionLogger,
    profile: ConnectionProfile,
    request: RunRequest,
    bus: EventBus,
    state: StateCell,
    gate: ControlGate,
    decisions_rx: Receiver<TruncateDecision>,
}

impl MigrationWorker {
    fn run(self) -> RunSummary {
        self.state.set(WorkerState::Running);

        let mut summary = RunSummary {
            run_id: None,
            status: RunStatus::Failed,
            completed_partitions: 0,
            total_rows: 0,
            error: None,
        };

        match self.execute(&mut summary) {
            Ok(()) => {}
            Err(e) => {
                let status = match e.kind() {
                    ErrorKind::Canceled => RunStatus::Canceled,
                    _ => RunStatus::Failed,
                };
                summary.status = status;
                summary.error = Some(e.to_string());
                self.logger.error("worker", &format!("run ended: {e}"));
                if let Some(run_id) = summary.run_id {
                    let _ = self
                        .store
                        .update_run_status(run_id, status, Some(&e.to_string()));
                }
            }
        }

        self.state.set(match summary.status {
            RunStatus::Completed => WorkerState::Completed,
            RunStatus::Canceled => WorkerState::Canceled,
            _ => WorkerState::Failed,
        });
        summary
    }

    fn execute(&self, summary: &mut RunSummary) -> Result<()> {
        let request = &self.request;

        // Fail fast before touching either database.
        let discovery_request = DiscoveryRequest {
            start: request.start,
            end: request.end,
            types: request.types.clone(),
        };
        discovery_request.validate()?;

        // Connection probes, surfaced to the observer and the history row.
        let (source_ok, source_msg) = pg::check_connection(&self.profile.source);
        self.bus.emit(EngineEvent::ConnectionStatus {
            role: ConnectionRole::Source,
            ok: source_ok,
            message: source_msg.clone(),
        });
        let (target_ok, target_msg) = pg::check_connection(&self.profile.target);
        self.bus.emit(EngineEvent::ConnectionStatus {
            role: ConnectionRole::Target,
            ok: target_ok,
            message: target_msg.clone(),
        });
        if !source_ok {
            return Err(MigrationError::Validation(format!(
                "source connection failed: {source_msg}"
            )));
        }
        if !target_ok {
            return Err(MigrationError::Validation(format!(
                "target connection failed: {target_msg}"
            )));
        }

        // Discovery runs against a dedicated connection; it is
        // deterministic, so resumed runs re-derive the same ordered list.
        let mut discovery_client = pg::connect(&self.profile.source)?;
        let partitions = discovery::discover(&mut discovery_client, &discovery_request)?;
        drop(discovery_client);

        let run = self.open_run(&partitions)?;
        summary.run_id = Some(run.id);
        self.logger.set_run_id(Some(run.id));
        self.store
            .record_connection_checks(run.id, &source_msg, &target_msg)?;

        if partitions.is_empty() {
            // A run over an empty catalog window completes without DDL.
            self.logger
                .info("worker", "no partitions matched the requested range");
            self.store
                .update_run_status(run.id, RunStatus::Completed, None)?;
            summary.status = RunStatus::Completed;
            return Ok(());
        }

        let compat = {
            let mut client = pg::connect(&self.profile.target)?;
            pg::resolve_compat_mode(&mut client, self.profile.compat_mode)
        };

        let engine = Engine::build(request.engine, &self.profile, compat)?;
        let confirmer = BusConfirmer {
            bus: self.bus.clone(),
            decisions: self.decisions_rx.clone(),
            gate: self.gate.clone(),
            auto_approve: request.auto_approve_truncate,
        };

        let mut tracker = ProgressTracker::new(partitions.len());
        let mut emitter = ProgressEmitter::new();
        let mut run_error: Option<MigrationError> = None;

        for (index, descriptor) in partitions.iter().enumerate() {
            self.gate.pause_point()?;

            let checkpoint = self
                .store
                .get_checkpoint(run.id, &descriptor.child)?
                .ok_or_else(|| {
                    MigrationError::Store(format!("missing checkpoint for {}", descriptor.child))
                })?;

            if checkpoint.status == CheckpointStatus::Completed {
                // Completed checkpoints are never reopened within a run.
                self.logger.info(
                    "worker",
                    &format!("{} already completed, skipping", descriptor.child),
                );
                tracker.complete_partition();
                continue;
            }

            let mut ctx = PartitionCtx {
                run_id: run.id,
                partition_index: index,
                store: &self.store,
                bus: &self.bus,
                gate: &self.gate,
                tracker: &mut tracker,
                emitter: &mut emitter,
                confirmer: &confirmer,
            };

            let result = self.run_partition_with_retry(&engine, &mut ctx, descriptor, &checkpoint);
            self.gate.clear_cancel_tokens();

            match result {
                Ok(rows) => {
                    tracker.complete_partition();
                    emitter.maybe_emit(&self.bus, &tracker, true);
                    self.store.update_run_progress(
                        run.id,
                        tracker.completed_partitions() as i64,
                        tracker.total_rows() as i64,
                    )?;
                    summary.completed_partitions = tracker.completed_partitions();
                    summary.total_rows = tracker.total_rows();
                    self.logger.success(
                        "worker",
                        &format!("{} completed ({rows} rows)", descriptor.child),
                    );
                }
                Err(e) => {
                    let kind = e.kind();
                    let reason = match kind {
                        ErrorKind::Canceled => "canceled".to_string(),
                        ErrorKind::ConfirmationDenied => "user declined truncate".to_string(),
                        _ => e.to_string(),
                    };
                    self.store.mark_checkpoint(
                        run.id,
                        &descriptor.child,
                        CheckpointStatus::Failed,
                        self.request.engine,
                        None,
                        Some(&reason),
                    )?;

                    match kind {
                        ErrorKind::Canceled | ErrorKind::Fatal => return Err(e),
                        ErrorKind::ConfirmationDenied => {
                            // The run always proceeds past a declined truncate.
                            self.logger.warning("worker", &e.to_string());
                        }
                        _ if self.request.continue_on_error => {
                            self.logger
                                .error("worker", &format!("{}: {e}", descriptor.child));
                            if run_error.is_none() {
                                run_error = Some(e);
                            }
                        }
                        _ => return Err(e),
                    }
                }
            }
        }

        match run_error {
            Some(e) => {
                self.store
                    .update_run_status(run.id, RunStatus::Failed, Some(&e.to_string()))?;
                summary.status = RunStatus::Failed;
                summary.error = Some(e.to_string());
            }
            None => {
                self.store
                    .update_run_status(run.id, RunStatus::Completed, None)?;
                summary.status = RunStatus::Completed;
            }
        }
        summary.completed_partitions = tracker.completed_partitions();
        summary.total_rows = tracker.total_rows();
        Ok(())
    }

    /// Reuses the latest resumable run when asked to, otherwise starts a
    /// fresh one; either way the checkpoint rows cover every partition.
    fn open_run(
        &self,
        partitions: &[PartitionDescriptor],
    ) -> Result<crate::domain::models::MigrationRun> {
        let run = if self.request.resume {
            self.store.incomplete_run_for(self.profile.id)?
        } else {
            None
        };

        let run = match run {
            Some(existing) => {
                info!(
                    "resuming run {} ({} of {} partitions done)",
                    existing.id, existing.completed_partitions, existing.total_partitions
                );
                self.store
                    .update_run_session(existing.id, self.logger.session_id())?;
                self.store
                    .update_run_status(existing.id, RunStatus::Running, None)?;
                existing
            }
            None => self.store.create_run(&NewRun {
                profile_id: self.profile.id,
                session_id: self.logger.session_id().to_string(),
                start_date: self.request.start.to_string(),
                end_date: self.request.end.to_string(),
                engine: self.request.engine,
            })?,
        };

        let names: Vec<&str> = partitions.iter().map(|p| p.child.as_str()).collect();
        self.store
            .create_checkpoints(run.id, &names, self.request.engine)?;
        self.store
            .set_run_partition_total(run.id, partitions.len() as i64)?;
        Ok(run)
    }

    /// Runs the engine routine, retrying transient failures on the fixed
    /// backoff schedule. The checkpoint passed to later attempts is
    /// re-read so a mid-partition offset survives the retry.
    fn run_partition_with_retry(
        &self,
        engine: &Engine,
        ctx: &mut PartitionCtx<'_>,
        descriptor: &PartitionDescriptor,
        checkpoint: &Checkpoint,
    ) -> Result<u64> {
        let mut attempt = 0;
        let mut current = checkpoint.clone();
        loop {
            match engine.migrate_partition(ctx, descriptor, &current) {
                Ok(rows) => return Ok(rows),
                Err(e) if e.kind() == ErrorKind::Transient && attempt < RETRY_BACKOFF.len() => {
                    let backoff = RETRY_BACKOFF[attempt];
                    attempt += 1;
                    error!(
                        "{}: transient failure (attempt {attempt}): {e}; retrying in {:?}",
                        descriptor.child, backoff
                    );
                    self.gate.sleep(backoff)?;
                    current = ctx
                        .store
                        .get_checkpoint(ctx.run_id, &descriptor.child)?
                        .unwrap_or(current);
                }
                Err(e) => return Err(e),
            }
        }
    }
}
