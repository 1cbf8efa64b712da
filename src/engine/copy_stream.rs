//! # Streaming COPY Engine
//!
//! Pipes `COPY ... TO STDOUT` on the source straight into
//! `COPY ... FROM STDIN` on the target. The two sides run on separate
//! threads joined by a bounded byte-chunk channel capped at 10 MB of
//! buffered data, so a slow target back-pressures the source instead of
//! spooling to disk. A partition is atomic: there is no offset to resume,
//! only `pending → in_progress → completed | failed`.
//!
//! After both sides finish, the target row count is reconciled against the
//! source count; any mismatch fails the partition.

use std::io::{Read, Write};
use std::time::Duration;

use crossbeam_channel::{bounded, RecvTimeoutError};
use log::{info, warn};

use crate::domain::errors::{MigrationError, Result};
use crate::domain::models::{Checkpoint, CheckpointStatus, EngineKind, PartitionDescriptor};
use crate::engine::worker::PartitionCtx;
use crate::pg::{self, PgPool};
use crate::schema_builder::{SchemaBuilder, TruncateMode};

/// Read granularity on the producer side.
const CHUNK_SIZE: usize = 64 * 1024;
/// Bounded pipe: at most 10 MB in flight.
const MAX_BUFFERED_BYTES: usize = 10 * 1024 * 1024;
const CHANNEL_CAPACITY: usize = MAX_BUFFERED_BYTES / CHUNK_SIZE;

pub struct CopyStreamEngine {
    source: PgPool,
    target: PgPool,
}

impl CopyStreamEngine {
    pub fn new(source: PgPool, target: PgPool) -> CopyStreamEngine {
        CopyStreamEngine { source, target }
    }

    /// Streams one partition; returns the reconciled target row count.
    pub fn migrate_partition(
        &self,
        ctx: &mut PartitionCtx<'_>,
        descriptor: &PartitionDescriptor,
        _checkpoint: &Checkpoint,
    ) -> Result<u64> {
        let child = &descriptor.child;
        let spec = descriptor.table_type.spec();

        let mut source = self.source.get()?;
        let mut target = self.target.get()?;
        ctx.gate.register_cancel_token(source.cancel_token());
        ctx.gate.register_cancel_token(target.cancel_token());

        if ctx.partition_index == 0 {
            pg::check_copy_privileges(&mut source);
            pg::check_copy_privileges(&mut target);
        }

        let size = pg::estimate_table_size(&mut source, child)?;
        if !size.exists {
            warn!("{child}: source table missing, marked completed");
            ctx.store.mark_checkpoint(
                ctx.run_id,
                child,
                CheckpointStatus::Completed,
                EngineKind::StreamingCopy,
                Some(0),
                None,
            )?;
            return Ok(0);
        }
        let source_count = size.row_count;
        info!(
            "{child}: {source_count} rows, {:.1} MB",
            size.total_bytes as f64 / (1024.0 * 1024.0)
        );
        ctx.tracker
            .begin_partition(ctx.partition_index, child, source_count.max(0) as u64);

        if source_count == 0 {
            ctx.store.mark_checkpoint(
                ctx.run_id,
                child,
                CheckpointStatus::Completed,
                EngineKind::StreamingCopy,
                Some(0),
                None,
            )?;
            warn!("{child}: no data, marked completed");
            return Ok(0);
        }

        // The COPY engine owns its target: pre-existing rows are truncated
        // without asking.
        SchemaBuilder::ensure_target_ready(
            &mut target,
            descriptor,
            TruncateMode::Auto,
            ctx.confirmer,
        )?;
        ctx.store.mark_checkpoint(
            ctx.run_id,
            child,
            CheckpointStatus::InProgress,
            EngineKind::StreamingCopy,
            None,
            None,
        )?;

        let columns = spec.column_list();
        let copy_out_sql = format!(
            "COPY (SELECT {columns} FROM {child} ORDER BY {}) TO STDOUT WITH (FORMAT CSV, HEADER FALSE, NULL 'NULL')",
            spec.order_key_list()
        );
        let copy_in_sql =
            format!("COPY {child} ({columns}) FROM STDIN WITH (FORMAT CSV, NULL 'NULL')");

        let producer_gate = ctx.gate.clone();
        let (chunk_tx, chunk_rx) = bounded::<Vec<u8>>(CHANNEL_CAPACITY);

        let (written_rows, transferred_bytes) =
            std::thread::scope(|scope| -> Result<(u64, u64)> {
                // Owned by this closure so every exit path closes the pipe
                // and unblocks the producer.
                let chunk_rx = chunk_rx;

                let producer = scope.spawn(move || -> Result<u64> {
                    let mut reader = source.copy_out(copy_out_sql.as_str())?;
                    let mut bytes_sent = 0u64;
                    let mut buffer = vec![0u8; CHUNK_SIZE];
                    loop {
                        if producer_gate.is_stopped() {
                            return Err(MigrationError::Canceled);
                        }
                        let n = reader.read(&mut buffer)?;
                        if n == 0 {
                            break;
                        }
                        bytes_sent += n as u64;
                        if chunk_tx.send(buffer[..n].to_vec()).is_err() {
                            // Consumer went away; its error is the real one.
                            return Ok(bytes_sent);
                        }
                    }
                    Ok(bytes_sent)
                });

                let mut writer = target.copy_in(copy_in_sql.as_str())?;
                let mut streamed_rows = 0u64;
                loop {
                    if ctx.gate.is_stopped() {
                        // Dropping the writer aborts the COPY; the open
                        // transaction rolls back on the server.
                        return Err(MigrationError::Canceled);
                    }
                    match chunk_rx.recv_timeout(Duration::from_millis(100)) {
                        Ok(chunk) => {
                            writer.write_all(&chunk)?;
                            // Row delimiter count: an estimate for live
                            // progress (quoted newlines overcount), the
                            // exact figure comes from COPY itself.
                            let newlines =
                                chunk.iter().filter(|b| **b == b'\n').count() as u64;
                            streamed_rows += newlines;
                            ctx.tracker.add(newlines, chunk.len() as u64);
                            ctx.emitter.maybe_emit(ctx.bus, ctx.tracker, false);
                        }
                        Err(RecvTimeoutError::Timeout) => continue,
                        Err(RecvTimeoutError::Disconnected) => break,
                    }
                }

                let bytes_sent = match producer.join() {
                    Ok(result) => result?,
                    Err(_) => {
                        return Err(MigrationError::Validation(
                            "copy producer thread panicked".to_string(),
                        ))
                    }
                };
                let written = writer.finish()?;
                // Top up the live estimate to the authoritative count.
                if written > streamed_rows {
                    ctx.tracker.add(written - streamed_rows, 0);
                }
                Ok((written, bytes_sent))
            })?;

        // Reconcile: both COPY legs succeeded, now the counts must agree.
        let target_count = pg::count_rows(&mut target, child)?;
        if target_count != source_count {
            return Err(MigrationError::RowCountMismatch {
                partition: child.clone(),
                src_count: source_count,
                target: target_count,
            });
        }

        ctx.store.update_checkpoint_progress(
            ctx.run_id,
            child,
            target_count,
            0,
            transferred_bytes as i64,
        )?;
        ctx.store.mark_checkpoint(
            ctx.run_id,
            child,
            CheckpointStatus::Completed,
            EngineKind::StreamingCopy,
            Some(target_count),
            None,
        )?;
        ctx.emitter.maybe_emit(ctx.bus, ctx.tracker, true);
        info!(
            "{child}: copied {written_rows} rows / {:.1} MB",
            transferred_bytes as f64 / (1024.0 * 1024.0)
        );
        Ok(target_count as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::table_types::TableType;

    #[test]
    fn test_channel_bound_respects_spool_limit() {
        assert!(CHANNEL_CAPACITY * CHUNK_SIZE <= MAX_BUFFERED_BYTES);
        assert!(CHANNEL_CAPACITY >= 1);
    }

    #[test]
    fn test_copy_statements_shape() {
        let spec = TableType::PointHistory.spec();
        let columns = spec.column_list();
        let copy_out = format!(
            "COPY (SELECT {columns} FROM point_history_240921 ORDER BY {}) TO STDOUT WITH (FORMAT CSV, HEADER FALSE, NULL 'NULL')",
            spec.order_key_list()
        );
        assert!(copy_out.contains("ORDER BY path_id, issued_date"));
        assert!(copy_out.contains("NULL 'NULL'"));

        let copy_in = format!(
            "COPY point_history_240921 ({columns}) FROM STDIN WITH (FORMAT CSV, NULL 'NULL')"
        );
        assert!(copy_in.contains("(path_id, issued_date, changed_value, connection_status)"));
    }
}
