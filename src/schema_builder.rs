//! # Target Schema Builder
//!
//! Reproduces the source partitioning layout on the target: parent table
//! with family indexes, trigger-based dispatch for `point_history`,
//! per-partition rules for the other families, inherited children with
//! date-range CHECK constraints, and the catalog mirror row.
//!
//! All DDL for one partition runs inside a single transaction so a partial
//! create rolls back. The SQL text builders are pure: the same descriptor
//! always yields the same statements.

use chrono::{Local, TimeZone};
use log::{info, warn};
use postgres::{Client, Transaction};

use crate::domain::errors::{MigrationError, Result};
use crate::domain::models::PartitionDescriptor;
use crate::domain::table_types::{DateColumnKind, Dispatch, TableType, TableTypeSpec};
use crate::bus::TruncateDecision;
use crate::pg::{self, CONTROL_STATEMENT_TIMEOUT_MS};

/// How `ensure_target_ready` deals with a pre-populated child.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TruncateMode {
    /// Truncate immediately (streaming COPY engine).
    Auto,
    /// Ask the observer and block for the answer (row-batch engine).
    Confirm,
}

/// Seam for the blocking truncate confirmation; the worker routes this to
/// the observer channel.
pub trait TruncateConfirmer {
    fn confirm(&self, partition: &str, existing_rows: i64) -> Result<TruncateDecision>;
}

/// Outcome of the readiness check, for logging.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReadyOutcome {
    pub created_parent: bool,
    pub created_child: bool,
    pub truncated_rows: i64,
}

// --- SQL text builders -----------------------------------------------------

/// `CREATE TABLE IF NOT EXISTS <parent> (...)` from the registry shape.
pub fn parent_table_ddl(spec: &TableTypeSpec) -> String {
    let columns = spec
        .columns
        .iter()
        .map(|c| format!("    {} {}", c.name, c.sql_type))
        .collect::<Vec<_>>()
        .join(",\n");
    format!("CREATE TABLE IF NOT EXISTS {} (\n{}\n)", spec.parent_table, columns)
}

/// Family-specific parent indexes.
pub fn parent_index_ddl(spec: &TableTypeSpec) -> String {
    let parent = spec.parent_table;
    match spec.date_kind {
        DateColumnKind::Timestamp => format!(
            "CREATE INDEX IF NOT EXISTS {parent}_sensor_id_date
             ON {parent} USING btree (sensor_id, issued_date);
             CREATE INDEX IF NOT EXISTS {parent}_station_id_idx
             ON {parent} USING btree (station_id);"
        ),
        DateColumnKind::EpochMillis => format!(
            "CREATE INDEX IF NOT EXISTS {parent}_path_id_date
             ON {parent} USING btree (path_id, issued_date);
             CREATE INDEX IF NOT EXISTS {parent}_path_id_idx
             ON {parent} USING btree (path_id);"
        ),
    }
}

/// PL/pgSQL dispatch function for trigger-partitioned parents. The child
/// suffix is derived from the millisecond epoch at insert time.
pub fn trigger_function_ddl(parent: &str) -> String {
    format!(
        "CREATE OR REPLACE FUNCTION {parent}_partition_insert()
RETURNS trigger
LANGUAGE plpgsql
AS $function$
DECLARE
    _insert_time bigint;
    _insert_date text;
BEGIN
    _insert_time := (NEW.issued_date/1000)::bigint;
    _insert_date := to_char(to_timestamp(_insert_time), 'YYMMDD');

    EXECUTE 'INSERT INTO {parent}_'||_insert_date||' VALUES ($1.*);' USING NEW;

    RETURN NULL;
END;
$function$"
    )
}

/// `BEFORE INSERT` trigger wiring for the dispatch function.
pub fn trigger_ddl(parent: &str) -> String {
    format!(
        "DROP TRIGGER IF EXISTS insert_{parent}_trigger ON {parent};
         CREATE TRIGGER insert_{parent}_trigger
         BEFORE INSERT ON {parent}
         FOR EACH ROW EXECUTE PROCEDURE {parent}_partition_insert();"
    )
}

/// Inherited child with the date-range CHECK and, for PH, the primary key.
pub fn child_table_ddl(descriptor: &PartitionDescriptor) -> String {
    let spec = descriptor.table_type.spec();
    let child = &descriptor.child;
    let date_column = spec.date_column;

    let check = match spec.date_kind {
        DateColumnKind::EpochMillis => format!(
            "CONSTRAINT {child}_{date_column}_check CHECK ({date_column} >= {} AND {date_column} <= {})",
            descriptor.from_date, descriptor.to_date
        ),
        DateColumnKind::Timestamp => format!(
            "CONSTRAINT {child}_{date_column}_check CHECK ({date_column} >= {} AND {date_column} <= {})",
            timestamp_literal(descriptor.from_date),
            timestamp_literal(descriptor.to_date)
        ),
    };

    let mut constraints = Vec::new();
    if spec.child_primary_key {
        constraints.push(format!(
            "CONSTRAINT {child}_pkey PRIMARY KEY ({})",
            spec.order_key_list()
        ));
    }
    constraints.push(check);

    format!(
        "CREATE TABLE IF NOT EXISTS {child} (\n    {}\n) INHERITS ({})",
        constraints.join(",\n    "),
        descriptor.parent
    )
}

/// `DROP RULE` + `CREATE RULE` pair for rule-dispatched families.
///
/// Literal formatting follows the family's date type: bigint casts for the
/// millisecond families, `timestamp without time zone` literals for ED.
pub fn rule_ddl(descriptor: &PartitionDescriptor) -> (String, String) {
    let spec = descriptor.table_type.spec();
    let parent = &descriptor.parent;
    let child = &descriptor.child;
    let date_column = spec.date_column;
    let rule_name = format!("rule_{child}");

    let condition = match spec.date_kind {
        DateColumnKind::EpochMillis => format!(
            "(new.{date_column} >= '{}'::bigint) AND (new.{date_column} <= '{}'::bigint)",
            descriptor.from_date, descriptor.to_date
        ),
        DateColumnKind::Timestamp => format!(
            "(new.{date_column} >= {}) AND (new.{date_column} <= {})",
            timestamp_literal(descriptor.from_date),
            timestamp_literal(descriptor.to_date)
        ),
    };

    let columns = spec.column_list();
    let values = spec
        .columns
        .iter()
        .map(|c| format!("new.{}", c.name))
        .collect::<Vec<_>>()
        .join(", ");

    let drop = format!("DROP RULE IF EXISTS {rule_name} ON {parent}");
    let create = format!(
        "CREATE RULE {rule_name} AS
ON INSERT TO {parent}
WHERE {condition}
DO INSTEAD INSERT INTO {child} ({columns})
VALUES ({values})"
    );
    (drop, create)
}

/// `'YYYY-MM-DD HH:MM:SS'::timestamp without time zone` from a ms epoch,
/// rendered in local time the way the source rules are.
pub fn timestamp_literal(epoch_ms: i64) -> String {
    let dt = Local
        .timestamp_millis_opt(epoch_ms)
        .earliest()
        .expect("epoch milliseconds in range");
    format!(
        "'{}'::timestamp without time zone",
        dt.format("%Y-%m-%d %H:%M:%S")
    )
}

const CATALOG_TABLE_DDL: &str = "
    CREATE TABLE IF NOT EXISTS partition_table_info (
        table_name varchar(100) NOT NULL,
        table_data varchar(10) NOT NULL,
        from_date bigint NOT NULL,
        to_date bigint NOT NULL,
        use_flag boolean NOT NULL,
        save_date timestamp NOT NULL,
        cluster_index boolean DEFAULT false
    )";

// --- Executor --------------------------------------------------------------

/// Stateless executor over a target connection.
pub struct SchemaBuilder;

impl SchemaBuilder {
    /// Ensures parent, dispatch objects, the child and the catalog mirror
    /// exist on the target, then applies the truncate policy.
    pub fn ensure_target_ready(
        client: &mut Client,
        descriptor: &PartitionDescriptor,
        mode: TruncateMode,
        confirmer: &dyn TruncateConfirmer,
    ) -> Result<ReadyOutcome> {
        let mut outcome = Self::ensure_schema(client, descriptor)?;
        outcome.truncated_rows =
            Self::ensure_partition_ready(client, descriptor, mode, confirmer)?;
        Ok(outcome)
    }

    /// DDL half of the readiness check, in one transaction per partition so
    /// partial creates roll back. Resumed partitions run only this half,
    /// keeping their already-copied prefix intact.
    pub fn ensure_schema(
        client: &mut Client,
        descriptor: &PartitionDescriptor,
    ) -> Result<ReadyOutcome> {
        let mut outcome = ReadyOutcome::default();
        let spec = descriptor.table_type.spec();

        {
            let mut tx = client.transaction()?;
            tx.batch_execute(&format!(
                "SET LOCAL statement_timeout = {CONTROL_STATEMENT_TIMEOUT_MS}"
            ))?;

            if !tx_table_exists(&mut tx, &descriptor.parent)? {
                info!("creating parent table {}", descriptor.parent);
                tx.batch_execute(&parent_table_ddl(spec))?;
                tx.batch_execute(&parent_index_ddl(spec))?;
                if spec.dispatch == Dispatch::Trigger {
                    tx.batch_execute(&trigger_function_ddl(&descriptor.parent))?;
                    tx.batch_execute(&trigger_ddl(&descriptor.parent))?;
                }
                outcome.created_parent = true;
            } else {
                verify_table_shape(&mut tx, &descriptor.parent, spec)?;
            }

            if !tx_table_exists(&mut tx, &descriptor.child)? {
                info!("creating partition table {}", descriptor.child);
                tx.batch_execute(&child_table_ddl(descriptor))?;
                if spec.dispatch == Dispatch::Rules {
                    let (drop, create) = rule_ddl(descriptor);
                    tx.batch_execute(&drop)?;
                    tx.batch_execute(&create)?;
                }
                mirror_catalog_row(&mut tx, descriptor)?;
                outcome.created_child = true;
            } else {
                verify_table_shape(&mut tx, &descriptor.child, spec)?;
            }

            tx.commit()?;
        }

        if outcome.created_child && descriptor.table_type == TableType::PointHistory {
            cluster_child(client, &descriptor.child);
        }
        Ok(outcome)
    }

    /// Guarantees the child is empty before the copy starts. Existing rows
    /// are truncated immediately (`Auto`) or after observer approval
    /// (`Confirm`); a decline aborts the partition.
    pub fn ensure_partition_ready(
        client: &mut Client,
        descriptor: &PartitionDescriptor,
        mode: TruncateMode,
        confirmer: &dyn TruncateConfirmer,
    ) -> Result<i64> {
        let existing = pg::count_rows(client, &descriptor.child)?;
        if existing == 0 {
            return Ok(0);
        }

        if mode == TruncateMode::Confirm {
            warn!(
                "{} already holds {existing} row(s); asking for confirmation",
                descriptor.child
            );
            match confirmer.confirm(&descriptor.child, existing)? {
                TruncateDecision::Approve => {}
                TruncateDecision::Deny => {
                    return Err(MigrationError::ConfirmationDenied {
                        partition: descriptor.child.clone(),
                    });
                }
            }
        }

        info!("truncating {} ({existing} existing rows)", descriptor.child);
        client.batch_execute(&format!(
            "TRUNCATE TABLE {} RESTART IDENTITY",
            pg::quote_ident(&descriptor.child)
        ))?;
        Ok(existing)
    }
}

fn tx_table_exists(tx: &mut Transaction<'_>, table: &str) -> Result<bool> {
    let row = tx.query_one(
        "SELECT EXISTS (
             SELECT 1 FROM information_schema.tables
             WHERE table_schema = 'public' AND table_name = $1
         )",
        &[&table],
    )?;
    Ok(row.get(0))
}

/// An existing table must carry at least the registry columns; anything
/// less is a schema conflict, not something to paper over with DDL.
fn verify_table_shape(
    tx: &mut Transaction<'_>,
    table: &str,
    spec: &TableTypeSpec,
) -> Result<()> {
    let rows = tx.query(
        "SELECT column_name FROM information_schema.columns
         WHERE table_schema = 'public' AND table_name = $1",
        &[&table],
    )?;
    let present: std::collections::HashSet<String> =
        rows.iter().map(|row| row.get::<_, String>(0)).collect();

    for column in spec.columns {
        if !present.contains(column.name) {
            return Err(MigrationError::SchemaConflict {
                table: table.to_string(),
                reason: format!("missing expected column {}", column.name),
            });
        }
    }
    Ok(())
}

/// Inserts the catalog row for the child on the target, creating the
/// catalog table first if needed. The source's `cluster_index` value is
/// preserved verbatim.
fn mirror_catalog_row(tx: &mut Transaction<'_>, descriptor: &PartitionDescriptor) -> Result<()> {
    tx.batch_execute(CATALOG_TABLE_DDL)?;
    let existing = tx.query_opt(
        "SELECT 1 FROM partition_table_info WHERE table_name = $1",
        &[&descriptor.child],
    )?;
    if existing.is_none() {
        tx.execute(
            "INSERT INTO partition_table_info
                 (table_name, table_data, from_date, to_date, use_flag, save_date, cluster_index)
             VALUES ($1, $2, $3, $4, true, $5, $6)",
            &[
                &descriptor.child,
                &descriptor.table_type.code(),
                &descriptor.from_date,
                &descriptor.to_date,
                &Local::now().naive_local(),
                &descriptor.cluster_index,
            ],
        )?;
    }
    Ok(())
}

/// Physically orders a PH child by its primary key. Privilege or lock
/// failures only warn; the copy proceeds regardless.
fn cluster_child(client: &mut Client, child: &str) {
    let sql = format!("CLUSTER {child} USING {child}_pkey");
    match client.batch_execute(&sql) {
        Ok(()) => info!("clustered {child} on {child}_pkey"),
        Err(e) => warn!("cluster skipped for {child}: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(table_type: TableType, child_suffix: &str) -> PartitionDescriptor {
        let parent = table_type.parent_table().to_string();
        PartitionDescriptor {
            child: format!("{parent}_{child_suffix}"),
            parent,
            table_type,
            from_date: 1_726_844_400_000,
            to_date: 1_726_930_799_999,
            estimated_rows: None,
            cluster_index: true,
        }
    }

    #[test]
    fn test_parent_ddl_matches_registry() {
        let ddl = parent_table_ddl(TableType::PointHistory.spec());
        assert!(ddl.starts_with("CREATE TABLE IF NOT EXISTS point_history"));
        assert!(ddl.contains("path_id int8"));
        assert!(ddl.contains("changed_value varchar(100)"));
        assert!(ddl.contains("connection_status bool"));
    }

    #[test]
    fn test_child_ddl_point_history() {
        let ddl = child_table_ddl(&descriptor(TableType::PointHistory, "240921"));
        assert!(ddl.contains("CREATE TABLE IF NOT EXISTS point_history_240921"));
        assert!(ddl.contains("INHERITS (point_history)"));
        assert!(ddl.contains("point_history_240921_pkey PRIMARY KEY (path_id, issued_date)"));
        assert!(ddl.contains("issued_date >= 1726844400000"));
        assert!(ddl.contains("issued_date <= 1726930799999"));
    }

    #[test]
    fn test_child_ddl_trend_history_has_no_pkey() {
        let ddl = child_table_ddl(&descriptor(TableType::TrendHistory, "240921"));
        assert!(!ddl.contains("PRIMARY KEY"));
        assert!(ddl.contains("trend_history_240921_issued_date_check"));
    }

    #[test]
    fn test_rule_ddl_bigint_family() {
        let (drop, create) = rule_ddl(&descriptor(TableType::TrendHistory, "240921"));
        assert_eq!(
            drop,
            "DROP RULE IF EXISTS rule_trend_history_240921 ON trend_history"
        );
        assert!(create.contains("CREATE RULE rule_trend_history_240921 AS"));
        assert!(create.contains("'1726844400000'::bigint"));
        assert!(create.contains("DO INSTEAD INSERT INTO trend_history_240921"));
        assert!(create.contains("(path_id, issued_date, changed_value, connection_status)"));
        assert!(create.contains("new.path_id, new.issued_date"));
    }

    #[test]
    fn test_rule_ddl_timestamp_family() {
        let (_, create) = rule_ddl(&descriptor(TableType::EnergyDisplay, "2409"));
        assert!(create.contains("::timestamp without time zone"));
        assert!(!create.contains("::bigint"));
        assert!(create.contains("new.sensor_id"));
        assert!(create.contains("new.cost"));
    }

    #[test]
    fn test_trigger_ddl_names() {
        let function = trigger_function_ddl("point_history");
        assert!(function.contains("FUNCTION point_history_partition_insert()"));
        assert!(function.contains("'YYMMDD'"));
        assert!(function.contains("INSERT INTO point_history_'||_insert_date"));

        let trigger = trigger_ddl("point_history");
        assert!(trigger.contains("insert_point_history_trigger"));
        assert!(trigger.contains("BEFORE INSERT ON point_history"));
    }

    #[test]
    fn test_builders_are_deterministic() {
        let d = descriptor(TableType::RunningTimeHistory, "240921");
        assert_eq!(child_table_ddl(&d), child_table_ddl(&d));
        assert_eq!(rule_ddl(&d), rule_ddl(&d));
    }

    #[test]
    fn test_timestamp_literal_shape() {
        let literal = timestamp_literal(1_726_844_400_000);
        assert!(literal.starts_with('\''));
        assert!(literal.ends_with("'::timestamp without time zone"));
        // 'YYYY-MM-DD HH:MM:SS' is 21 chars including quotes.
        assert_eq!(literal.split("::").next().unwrap().len(), 21);
    }

    #[test]
    fn test_parent_indexes_per_family() {
        let ph = parent_index_ddl(TableType::PointHistory.spec());
        assert!(ph.contains("point_history_path_id_date"));

        let ed = parent_index_ddl(TableType::EnergyDisplay.spec());
        assert!(ed.contains("energy_display_sensor_id_date"));
        assert!(ed.contains("energy_display_station_id_idx"));
    }
}
