//! # Control / Event Bus
//!
//! Typed channels between the engine and its observer. State changes, log
//! lines, connection probes and truncate confirmations ride a reliable
//! unbounded channel; progress uses a lossy latest-value slot because only
//! the most recent update matters to a renderer.

use std::sync::{Arc, Mutex};

use crossbeam_channel::{unbounded, Receiver, Sender};

/// Severity scale used on the observer channel and in the store.
/// `Success` sits between `Info` and `Warning`, mirroring the log table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Success,
    Warning,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Success => "SUCCESS",
            LogLevel::Warning => "WARNING",
            LogLevel::Error => "ERROR",
        }
    }
}

/// Worker lifecycle states surfaced to observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    Running,
    Paused,
    Completed,
    Failed,
    Canceled,
}

/// Which side of the profile a connection probe refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionRole {
    Source,
    Target,
}

/// One progress sample. Consecutive samples within a run are monotone in
/// `total_rows`.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressUpdate {
    /// Zero-based index of the partition being copied.
    pub partition_index: usize,
    pub total_partitions: usize,
    pub partition: String,
    pub partition_rows: u64,
    pub partition_total_rows: u64,
    pub total_rows: u64,
    pub total_bytes: u64,
    pub rows_per_sec: f64,
    pub mb_per_sec: f64,
    pub eta_seconds: f64,
    pub elapsed_seconds: f64,
}

/// Reliable engine→observer notifications.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    Log {
        level: LogLevel,
        component: String,
        message: String,
    },
    State(WorkerState),
    ConnectionStatus {
        role: ConnectionRole,
        ok: bool,
        message: String,
    },
    /// The engine is blocked until the observer answers via the worker
    /// handle.
    TruncateRequest {
        partition: String,
        existing_rows: i64,
    },
}

/// Observer's answer to a `TruncateRequest`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TruncateDecision {
    Approve,
    Deny,
}

/// Latest-value cell for progress updates: writers overwrite, the reader
/// takes the newest and clears the slot.
#[derive(Clone, Default)]
pub struct ProgressSlot {
    slot: Arc<Mutex<Option<ProgressUpdate>>>,
}

impl ProgressSlot {
    pub fn publish(&self, update: ProgressUpdate) {
        if let Ok(mut guard) = self.slot.lock() {
            *guard = Some(update);
        }
    }

    /// Takes the most recent update, leaving the slot empty.
    pub fn take(&self) -> Option<ProgressUpdate> {
        self.slot.lock().ok().and_then(|mut guard| guard.take())
    }
}

/// Engine-side sending half.
#[derive(Clone)]
pub struct EventBus {
    events: Sender<EngineEvent>,
    progress: ProgressSlot,
}

impl EventBus {
    /// Reliable delivery; a vanished observer is not an engine error.
    pub fn emit(&self, event: EngineEvent) {
        let _ = self.events.send(event);
    }

    pub fn emit_state(&self, state: WorkerState) {
        self.emit(EngineEvent::State(state));
    }

    pub fn publish_progress(&self, update: ProgressUpdate) {
        self.progress.publish(update);
    }
}

/// Observer-side receiving half.
pub struct EventStream {
    pub events: Receiver<EngineEvent>,
    progress: ProgressSlot,
}

impl EventStream {
    /// Most recent progress update since the last call, if any.
    pub fn latest_progress(&self) -> Option<ProgressUpdate> {
        self.progress.take()
    }
}

/// Builds a connected bus pair.
pub fn channel() -> (EventBus, EventStream) {
    let (events_tx, events_rx) = unbounded();
    let progress = ProgressSlot::default();
    (
        EventBus {
            events: events_tx,
            progress: progress.clone(),
        },
        EventStream {
            events: events_rx,
            progress,
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(total_rows: u64) -> ProgressUpdate {
        ProgressUpdate {
            partition_index: 0,
            total_partitions: 3,
            partition: "point_history_240921".to_string(),
            partition_rows: total_rows,
            partition_total_rows: 86_400,
            total_rows,
            total_bytes: total_rows * 40,
            rows_per_sec: 1000.0,
            mb_per_sec: 0.04,
            eta_seconds: 10.0,
            elapsed_seconds: 1.0,
        }
    }

    #[test]
    fn test_progress_is_lossy_latest() {
        let (bus, stream) = channel();
        bus.publish_progress(sample(100));
        bus.publish_progress(sample(200));
        bus.publish_progress(sample(300));

        // Only the newest survives, and the slot clears after a take.
        assert_eq!(stream.latest_progress().unwrap().total_rows, 300);
        assert!(stream.latest_progress().is_none());
    }

    #[test]
    fn test_events_are_reliable_and_ordered() {
        let (bus, stream) = channel();
        bus.emit_state(WorkerState::Running);
        bus.emit(EngineEvent::TruncateRequest {
            partition: "point_history_240921".to_string(),
            existing_rows: 10_000,
        });
        bus.emit_state(WorkerState::Completed);

        let collected: Vec<EngineEvent> = stream.events.try_iter().collect();
        assert_eq!(collected.len(), 3);
        assert!(matches!(collected[0], EngineEvent::State(WorkerState::Running)));
        assert!(matches!(
            collected[1],
            EngineEvent::TruncateRequest { existing_rows: 10_000, .. }
        ));
        assert!(matches!(
            collected[2],
            EngineEvent::State(WorkerState::Completed)
        ));
    }

    #[test]
    fn test_emit_without_observer_does_not_panic() {
        let (bus, stream) = channel();
        drop(stream);
        bus.emit_state(WorkerState::Failed);
    }
}
