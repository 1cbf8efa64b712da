//! Checkpoint repository. One row per `(run, partition)`, created up front
//! in discovery order; the engines move rows through
//! `pending → in_progress → completed | failed`.

use chrono::Utc;
use rusqlite::{params, OptionalExtension, Row};

use crate::domain::errors::Result;
use crate::domain::models::{Checkpoint, CheckpointStatus, EngineKind};
use crate::store::{format_ts, parse_ts, Store};

impl Store {
    /// Seeds pending checkpoints for every partition, keeping discovery
    /// order in `seq`. Partitions that already have a row keep it.
    pub fn create_checkpoints(
        &self,
        run_id: i64,
        partitions: &[&str],
        engine: EngineKind,
    ) -> Result<()> {
        let now = format_ts(Utc::now());
        self.with_tx(|tx| {
            for (seq, partition) in partitions.iter().enumerate() {
                tx.execute(
                    "INSERT INTO checkpoints (run_id, partition_name, seq, status, engine, updated_at)
                     VALUES (?1, ?2, ?3, 'pending', ?4, ?5)
                     ON CONFLICT(run_id, partition_name) DO NOTHING",
                    params![run_id, partition, seq as i64, engine.as_str(), now],
                )?;
            }
            Ok(())
        })
    }

    /// Every checkpoint of the run, in discovery order.
    pub fn checkpoints_for(&self, run_id: i64) -> Result<Vec<Checkpoint>> {
        self.with_conn(|c| {
            let mut stmt =
                c.prepare(&format!("{CHECKPOINT_SELECT} WHERE run_id = ?1 ORDER BY seq"))?;
            let rows = stmt.query_map(params![run_id], checkpoint_from_row)?;
            rows.collect()
        })
    }

    /// Partitions still to process, in discovery order.
    pub fn pending_checkpoints_for(&self, run_id: i64) -> Result<Vec<Checkpoint>> {
        self.with_conn(|c| {
            let mut stmt = c.prepare(&format!(
                "{CHECKPOINT_SELECT} WHERE run_id = ?1 AND status != 'completed' ORDER BY seq"
            ))?;
            let rows = stmt.query_map(params![run_id], checkpoint_from_row)?;
            rows.collect()
        })
    }

    pub fn get_checkpoint(&self, run_id: i64, partition: &str) -> Result<Option<Checkpoint>> {
        self.with_conn(|c| {
            c.query_row(
                &format!("{CHECKPOINT_SELECT} WHERE run_id = ?1 AND partition_name = ?2"),
                params![run_id, partition],
                checkpoint_from_row,
            )
            .optional()
        })
    }

    /// Batch-commit bookkeeping for the row-batch engine.
    pub fn update_checkpoint_progress(
        &self,
        run_id: i64,
        partition: &str,
        rows_copied: i64,
        last_offset: i64,
        bytes_transferred: i64,
    ) -> Result<()> {
        let now = format_ts(Utc::now());
        self.with_tx(|tx| {
            tx.execute(
                "UPDATE checkpoints
                 SET rows_copied = ?3, last_offset = ?4, bytes_transferred = ?5, updated_at = ?6
                 WHERE run_id = ?1 AND partition_name = ?2",
                params![run_id, partition, rows_copied, last_offset, bytes_transferred, now],
            )?;
            Ok(())
        })
    }

    /// Status transition, stamped with the engine that actually processed
    /// the partition; `rows_copied` and the error text are only written
    /// when provided.
    pub fn mark_checkpoint(
        &self,
        run_id: i64,
        partition: &str,
        status: CheckpointStatus,
        engine: EngineKind,
        rows_copied: Option<i64>,
        error: Option<&str>,
    ) -> Result<()> {
        let now = format_ts(Utc::now());
        self.with_tx(|tx| {
            tx.execute(
                "UPDATE checkpoints
                 SET status = ?3,
                     engine = ?4,
                     rows_copied = COALESCE(?5, rows_copied),
                     error_message = COALESCE(?6, error_message),
                     updated_at = ?7
                 WHERE run_id = ?1 AND partition_name = ?2",
                params![
                    run_id,
                    partition,
                    status.as_str(),
                    engine.as_str(),
                    rows_copied,
                    error,
                    now
                ],
            )?;
            Ok(())
        })
    }
}

const CHECKPOINT_SELECT: &str = "SELECT run_id, partition_name, seq, status, rows_copied, last_offset,
        bytes_transferred, engine, error_message, updated_at
 FROM checkpoints";

fn checkpoint_from_row(row: &Row<'_>) -> rusqlite::Result<Checkpoint> {
    let status: String = row.get(3)?;
    let engine: String = row.get(7)?;
    let updated_at: String = row.get(9)?;
    Ok(Checkpoint {
        run_id: row.get(0)?,
        partition_name: row.get(1)?,
        seq: row.get(2)?,
        status: CheckpointStatus::parse(&status).unwrap_or(CheckpointStatus::Pending),
        rows_copied: row.get(4)?,
        last_offset: row.get(5)?,
        bytes_transferred: row.get(6)?,
        engine: EngineKind::parse(&engine).unwrap_or(EngineKind::StreamingCopy),
        error_message: row.get(8)?,
        updated_at: parse_ts(&updated_at)?,
    })
}
