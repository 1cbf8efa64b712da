//! Log repository and the bounded background writer.
//!
//! Engine threads push records through `LogSink`; a background thread
//! batches them into the `logs` table. The queue is bounded with a
//! drop-oldest policy so a stalled writer can never block a copy, and
//! store write failures degrade to stderr rather than interrupting the
//! run. `flush` drains the queue and is awaited by the run's cleanup.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{bounded, select, unbounded, Receiver, Sender};
use rusqlite::params;

use crate::domain::errors::Result;
use crate::domain::models::LogRecord;
use crate::store::{format_ts, Store};

/// Largest batch written in one transaction.
const WRITE_BATCH: usize = 100;

impl Store {
    /// Bulk insert; all-or-nothing.
    pub fn append_logs(&self, records: &[LogRecord]) -> Result<()> {
        self.with_tx(|tx| {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO logs (session_id, run_id, ts, level, component, message, context)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            )?;
            for record in records {
                stmt.execute(params![
                    record.session_id,
                    record.run_id,
                    format_ts(record.ts),
                    record.level,
                    record.component,
                    record.message,
                    record.context,
                ])?;
            }
            Ok(())
        })
    }

    /// Log entries of one session, oldest first.
    pub fn logs_for_session(&self, session_id: &str) -> Result<Vec<LogRecord>> {
        self.with_conn(|c| {
            let mut stmt = c.prepare(
                "SELECT session_id, run_id, ts, level, component, message, context
                 FROM logs WHERE session_id = ?1 ORDER BY id",
            )?;
            let rows = stmt.query_map(params![session_id], |row| {
                let ts: String = row.get(2)?;
                Ok(LogRecord {
                    session_id: row.get(0)?,
                    run_id: row.get(1)?,
                    ts: crate::store::parse_ts(&ts)?,
                    level: row.get(3)?,
                    component: row.get(4)?,
                    message: row.get(5)?,
                    context: row.get(6)?,
                })
            })?;
            rows.collect()
        })
    }
}

enum Control {
    Flush(Sender<()>),
    Shutdown,
}

/// Producer handle for the background log writer. Clone-cheap and shared
/// across the worker threads.
pub struct LogSink {
    entries_tx: Sender<LogRecord>,
    // Sender-side eviction handle implementing the drop-oldest policy.
    entries_rx: Receiver<LogRecord>,
    control_tx: Sender<Control>,
    dropped: Arc<AtomicU64>,
    writer: Option<JoinHandle<()>>,
}

impl LogSink {
    /// Spawns the writer thread over a queue of `capacity` records.
    pub fn spawn(store: Store, capacity: usize) -> LogSink {
        let (entries_tx, entries_rx) = bounded::<LogRecord>(capacity);
        let (control_tx, control_rx) = unbounded::<Control>();
        let consumer_rx = entries_rx.clone();

        let writer = std::thread::Builder::new()
            .name("log-writer".to_string())
            .spawn(move || writer_loop(store, consumer_rx, control_rx))
            .expect("failed to spawn log writer thread");

        LogSink {
            entries_tx,
            entries_rx,
            control_tx,
            dropped: Arc::new(AtomicU64::new(0)),
            writer: Some(writer),
        }
    }

    /// Non-blocking enqueue. When the queue is full the oldest record is
    /// evicted to make room.
    pub fn push(&self, record: LogRecord) {
        if self.entries_tx.is_full() {
            if self.entries_rx.try_recv().is_ok() {
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
        let _ = self.entries_tx.try_send(record);
    }

    /// Records evicted so far by the drop-oldest policy.
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Blocks until everything enqueued so far has been written, or the
    /// timeout elapses.
    pub fn flush(&self, timeout: Duration) -> bool {
        let (ack_tx, ack_rx) = bounded(1);
        if self.control_tx.send(Control::Flush(ack_tx)).is_err() {
            return false;
        }
        ack_rx.recv_timeout(timeout).is_ok()
    }

    /// Flushes and stops the writer thread.
    pub fn close(mut self, timeout: Duration) {
        self.flush(timeout);
        let _ = self.control_tx.send(Control::Shutdown);
        if let Some(handle) = self.writer.take() {
            let _ = handle.join();
        }
    }
}

fn writer_loop(store: Store, entries_rx: Receiver<LogRecord>, control_rx: Receiver<Control>) {
    let mut buffer: Vec<LogRecord> = Vec::with_capacity(WRITE_BATCH);
    loop {
        select! {
            recv(control_rx) -> msg => match msg {
                Ok(Control::Flush(ack)) => {
                    drain_fully(&store, &entries_rx, &mut buffer);
                    let _ = ack.send(());
                }
                Ok(Control::Shutdown) | Err(_) => {
                    drain_fully(&store, &entries_rx, &mut buffer);
                    return;
                }
            },
            recv(entries_rx) -> msg => match msg {
                Ok(record) => {
                    buffer.push(record);
                    drain_into(&entries_rx, &mut buffer);
                    write_batches(&store, &mut buffer);
                }
                Err(_) => {
                    write_batches(&store, &mut buffer);
                    return;
                }
            },
        }
    }
}

fn drain_into(rx: &Receiver<LogRecord>, buffer: &mut Vec<LogRecord>) {
    while buffer.len() < WRITE_BATCH {
        match rx.try_recv() {
            Ok(record) => buffer.push(record),
            Err(_) => break,
        }
    }
}

/// Writes batches until the queue is empty; used by flush and shutdown.
fn drain_fully(store: &Store, rx: &Receiver<LogRecord>, buffer: &mut Vec<LogRecord>) {
    loop {
        drain_into(rx, buffer);
        if buffer.is_empty() {
            return;
        }
        write_batches(store, buffer);
    }
}

fn write_batches(store: &Store, buffer: &mut Vec<LogRecord>) {
    if buffer.is_empty() {
        return;
    }
    if let Err(e) = store.append_logs(buffer) {
        // Log persistence is best-effort: fall back to stderr.
        eprintln!("log writer: failed to persist {} entries: {e}", buffer.len());
    }
    buffer.clear();
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn record(message: &str) -> LogRecord {
        LogRecord {
            session_id: "sess-1".to_string(),
            run_id: None,
            ts: Utc::now(),
            level: "INFO".to_string(),
            component: "test".to_string(),
            message: message.to_string(),
            context: None,
        }
    }

    #[test]
    fn test_flush_persists_everything() {
        let store = Store::open_in_memory().unwrap();
        let sink = LogSink::spawn(store.clone(), 64);

        for i in 0..10 {
            sink.push(record(&format!("line {i}")));
        }
        assert!(sink.flush(Duration::from_secs(5)));

        let rows = store.logs_for_session("sess-1").unwrap();
        assert_eq!(rows.len(), 10);
        assert_eq!(rows[0].message, "line 0");
        sink.close(Duration::from_secs(1));
    }

    #[test]
    fn test_append_batch_round_trip() {
        let store = Store::open_in_memory().unwrap();
        store
            .append_logs(&[record("a"), record("b")])
            .unwrap();
        let rows = store.logs_for_session("sess-1").unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].message, "b");
        assert_eq!(rows[1].component, "test");
    }

    #[test]
    fn test_close_drains_queue() {
        let store = Store::open_in_memory().unwrap();
        let sink = LogSink::spawn(store.clone(), 64);
        for i in 0..25 {
            sink.push(record(&format!("line {i}")));
        }
        sink.close(Duration::from_secs(5));

        let rows = store.logs_for_session("sess-1").unwrap();
        assert_eq!(rows.len(), 25);
    }
}
