//! # Row-Batch Engine
//!
//! Batched `SELECT ... LIMIT/OFFSET` from the source with parameterized
//! bulk INSERTs into the target, one transaction per batch. The checkpoint
//! records the committed offset after every batch, so a restarted run
//! resumes mid-partition. Batch size adapts to observed batch latency.
//!
//! Offset paging is only stable when every page is ordered by the family's
//! stable key and the source is quiescent for the duration of the
//! migration; the engine assumes both.

use std::time::{Duration, Instant};

use chrono::NaiveDateTime;
use log::{info, warn};
use postgres::types::ToSql;
use postgres::Row;

use crate::domain::errors::Result;
use crate::domain::models::{Checkpoint, CheckpointStatus, EngineKind, PartitionDescriptor};
use crate::domain::table_types::TableType;
use crate::engine::worker::PartitionCtx;
use crate::pg::{self, PgPool};
use crate::schema_builder::{SchemaBuilder, TruncateMode};

pub const INITIAL_BATCH_SIZE: i64 = 100_000;
pub const MIN_BATCH_SIZE: i64 = 10_000;
pub const MAX_BATCH_SIZE: i64 = 500_000;

/// Fast batches grow 1.5×; slow ones halve.
const GROW_THRESHOLD: Duration = Duration::from_secs(1);
const SHRINK_THRESHOLD: Duration = Duration::from_secs(10);

/// Next batch size given how long the previous batch took.
pub(crate) fn next_batch_size(current: i64, elapsed: Duration) -> i64 {
    if elapsed < GROW_THRESHOLD {
        (current * 3 / 2).min(MAX_BATCH_SIZE)
    } else if elapsed > SHRINK_THRESHOLD {
        (current / 2).max(MIN_BATCH_SIZE)
    } else {
        current
    }
}

/// Halving step used on memory-pressure errors.
pub(crate) fn halve_batch_size(current: i64) -> i64 {
    (current / 2).max(MIN_BATCH_SIZE)
}

pub struct RowBatchEngine {
    source: PgPool,
    target: PgPool,
}

impl RowBatchEngine {
    pub fn new(source: PgPool, target: PgPool) -> RowBatchEngine {
        RowBatchEngine { source, target }
    }

    /// Copies one partition; returns the number of rows in the target.
    pub fn migrate_partition(
        &self,
        ctx: &mut PartitionCtx<'_>,
        descriptor: &PartitionDescriptor,
        checkpoint: &Checkpoint,
    ) -> Result<u64> {
        let child = &descriptor.child;
        let spec = descriptor.table_type.spec();

        let mut source = self.source.get()?;
        let mut target = self.target.get()?;
        ctx.gate.register_cancel_token(source.cancel_token());
        ctx.gate.register_cancel_token(target.cancel_token());

        let total = pg::count_rows(&mut source, child)?;
        info!("{child}: {total} source rows");
        ctx.tracker
            .begin_partition(ctx.partition_index, child, total.max(0) as u64);

        if total == 0 {
            ctx.store.mark_checkpoint(
                ctx.run_id,
                child,
                CheckpointStatus::Completed,
                EngineKind::RowBatch,
                Some(0),
                None,
            )?;
            warn!("{child}: no data, marked completed");
            return Ok(0);
        }

        // A partition interrupted mid-copy keeps its already-copied prefix:
        // only the DDL half of the readiness check runs, never the
        // truncate gate.
        let resuming =
            checkpoint.status == CheckpointStatus::InProgress && checkpoint.last_offset > 0;
        if resuming {
            SchemaBuilder::ensure_schema(&mut target, descriptor)?;
        } else {
            SchemaBuilder::ensure_target_ready(
                &mut target,
                descriptor,
                TruncateMode::Confirm,
                ctx.confirmer,
            )?;
        }

        ctx.store.mark_checkpoint(
            ctx.run_id,
            child,
            CheckpointStatus::InProgress,
            EngineKind::RowBatch,
            None,
            None,
        )?;

        // Column list and statements are fixed once per partition.
        let columns = spec.column_list();
        let select_sql = format!(
            "SELECT {columns} FROM {child} ORDER BY {} LIMIT $1 OFFSET $2",
            spec.order_key_list()
        );
        let insert_sql = build_insert_sql(child, spec.columns.len(), &columns);

        let mut offset = if resuming {
            // The target's committed count is the authoritative resume
            // point; a crash between batch commit and checkpoint write
            // leaves the checkpoint one batch behind.
            let committed = pg::count_rows(&mut target, child)?;
            if committed != checkpoint.last_offset {
                warn!(
                    "{child}: checkpoint offset {} disagrees with target count {committed}, resuming at {committed}",
                    checkpoint.last_offset
                );
            }
            info!("{child}: resuming at offset {committed}");
            ctx.tracker.resume_partition_at(committed.max(0) as u64);
            committed.max(0)
        } else {
            0
        };
        let mut batch_size = INITIAL_BATCH_SIZE;

        while offset < total {
            ctx.gate.pause_point()?;

            let batch_started = Instant::now();
            let rows = source.query(select_sql.as_str(), &[&batch_size, &offset])?;
            if rows.is_empty() {
                break;
            }

            let batch = decode_rows(descriptor.table_type, &rows)?;
            let inserted = match insert_batch(&mut target, &insert_sql, &batch) {
                Ok(n) => n,
                Err(e) if e.is_memory_pressure() => {
                    // Halve and retry this batch once at the smaller size.
                    batch_size = halve_batch_size(batch_size);
                    warn!("{child}: memory pressure, retrying batch at {batch_size}");
                    let retry_rows =
                        source.query(select_sql.as_str(), &[&batch_size, &offset])?;
                    let retry_batch = decode_rows(descriptor.table_type, &retry_rows)?;
                    insert_batch(&mut target, &insert_sql, &retry_batch)?
                }
                Err(e) => return Err(e),
            };

            offset += inserted as i64;
            ctx.tracker.add(inserted, 0);
            ctx.store
                .update_checkpoint_progress(ctx.run_id, child, offset, offset, 0)?;
            ctx.emitter.maybe_emit(ctx.bus, ctx.tracker, false);

            batch_size = next_batch_size(batch_size, batch_started.elapsed());
        }

        ctx.store.mark_checkpoint(
            ctx.run_id,
            child,
            CheckpointStatus::Completed,
            EngineKind::RowBatch,
            Some(offset),
            None,
        )?;
        ctx.emitter.maybe_emit(ctx.bus, ctx.tracker, true);
        Ok(offset as u64)
    }
}

/// `INSERT INTO <child> (<cols>) VALUES ($1, ..., $n)`.
fn build_insert_sql(child: &str, column_count: usize, columns: &str) -> String {
    let placeholders = (1..=column_count)
        .map(|i| format!("${i}"))
        .collect::<Vec<_>>()
        .join(", ");
    format!("INSERT INTO {child} ({columns}) VALUES ({placeholders})")
}

/// One source row, decoded into the family's fixed shape so it can be
/// re-bound as INSERT parameters.
enum BatchRow {
    Point {
        path_id: Option<i64>,
        issued_date: Option<i64>,
        changed_value: Option<String>,
        connection_status: Option<bool>,
    },
    Energy {
        sensor_id: Option<i64>,
        issued_date: Option<NaiveDateTime>,
        station_id: Option<String>,
        value: Option<f64>,
        co2: Option<f64>,
        cost: Option<f64>,
    },
    Running {
        path_id: Option<i64>,
        issued_date: Option<i64>,
        save_type: Option<i32>,
        checked_time: Option<i64>,
        running_time: Option<i64>,
        accu_time: Option<i64>,
        running_count: Option<i32>,
        eng_value: Option<f64>,
        eng_accu_value: Option<f64>,
        previous_weight_value: Option<f64>,
    },
}

impl BatchRow {
    fn from_row(table_type: TableType, row: &Row) -> Result<BatchRow> {
        let decoded = match table_type {
            TableType::PointHistory | TableType::TrendHistory => BatchRow::Point {
                path_id: row.try_get(0)?,
                issued_date: row.try_get(1)?,
                changed_value: row.try_get(2)?,
                connection_status: row.try_get(3)?,
            },
            TableType::EnergyDisplay => BatchRow::Energy {
                sensor_id: row.try_get(0)?,
                issued_date: row.try_get(1)?,
                station_id: row.try_get(2)?,
                value: row.try_get(3)?,
                co2: row.try_get(4)?,
                cost: row.try_get(5)?,
            },
            TableType::RunningTimeHistory => BatchRow::Running {
                path_id: row.try_get(0)?,
                issued_date: row.try_get(1)?,
                save_type: row.try_get(2)?,
                checked_time: row.try_get(3)?,
                running_time: row.try_get(4)?,
                accu_time: row.try_get(5)?,
                running_count: row.try_get(6)?,
                eng_value: row.try_get(7)?,
                eng_accu_value: row.try_get(8)?,
                previous_weight_value: row.try_get(9)?,
            },
        };
        Ok(decoded)
    }

    fn params(&self) -> Vec<&(dyn ToSql + Sync)> {
        match self {
            BatchRow::Point {
                path_id,
                issued_date,
                changed_value,
                connection_status,
            } => vec![path_id, issued_date, changed_value, connection_status],
            BatchRow::Energy {
                sensor_id,
                issued_date,
                station_id,
                value,
                co2,
                cost,
            } => vec![sensor_id, issued_date, station_id, value, co2, cost],
            BatchRow::Running {
                path_id,
                issued_date,
                save_type,
                checked_time,
                running_time,
                accu_time,
                running_count,
                eng_value,
                eng_accu_value,
                previous_weight_value,
            } => vec![
                path_id,
                issued_date,
                save_type,
                checked_time,
                running_time,
                accu_time,
                running_count,
                eng_value,
                eng_accu_value,
                previous_weight_value,
            ],
        }
    }
}

fn decode_rows(table_type: TableType, rows: &[Row]) -> Result<Vec<BatchRow>> {
    rows.iter()
        .map(|row| BatchRow::from_row(table_type, row))
        .collect()
}

/// Inserts the batch inside a single transaction with a prepared statement
/// executed per row (`executemany` shape). Rolls back on any failure.
fn insert_batch(
    target: &mut postgres::Client,
    insert_sql: &str,
    batch: &[BatchRow],
) -> Result<u64> {
    let mut tx = target.transaction()?;
    let statement = tx.prepare(insert_sql)?;
    for row in batch {
        tx.execute(&statement, &row.params())?;
    }
    tx.commit()?;
    Ok(batch.len() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fast_batches_grow_capped() {
        let grown = next_batch_size(INITIAL_BATCH_SIZE, Duration::from_millis(400));
        assert_eq!(grown, 150_000);
        assert_eq!(
            next_batch_size(MAX_BATCH_SIZE, Duration::from_millis(400)),
            MAX_BATCH_SIZE
        );
    }

    #[test]
    fn test_slow_batches_shrink_floored() {
        let shrunk = next_batch_size(INITIAL_BATCH_SIZE, Duration::from_secs(11));
        assert_eq!(shrunk, 50_000);
        assert_eq!(
            next_batch_size(MIN_BATCH_SIZE, Duration::from_secs(11)),
            MIN_BATCH_SIZE
        );
    }

    #[test]
    fn test_middling_latency_keeps_size() {
        assert_eq!(
            next_batch_size(200_000, Duration::from_secs(5)),
            200_000
        );
    }

    #[test]
    fn test_halve_respects_floor() {
        assert_eq!(halve_batch_size(100_000), 50_000);
        assert_eq!(halve_batch_size(MIN_BATCH_SIZE), MIN_BATCH_SIZE);
        assert_eq!(halve_batch_size(15_000), MIN_BATCH_SIZE);
    }

    #[test]
    fn test_repeated_growth_reaches_cap() {
        let mut size = INITIAL_BATCH_SIZE;
        for _ in 0..10 {
            size = next_batch_size(size, Duration::from_millis(100));
        }
        assert_eq!(size, MAX_BATCH_SIZE);
    }

    #[test]
    fn test_insert_sql_shape() {
        let spec = TableType::PointHistory.spec();
        let sql = build_insert_sql("point_history_240921", spec.columns.len(), &spec.column_list());
        assert_eq!(
            sql,
            "INSERT INTO point_history_240921 (path_id, issued_date, changed_value, connection_status) VALUES ($1, $2, $3, $4)"
        );
    }

    #[test]
    fn test_insert_sql_running_time_has_ten_placeholders() {
        let spec = TableType::RunningTimeHistory.spec();
        let sql = build_insert_sql("running_time_history_240921", spec.columns.len(), &spec.column_list());
        assert!(sql.contains("$10"));
        assert!(!sql.contains("$11"));
    }
}
