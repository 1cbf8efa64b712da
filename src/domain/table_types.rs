//! # Table-Type Registry
//!
//! Declarative metadata for every supported partitioned table family.
//!
//! Each family describes one parent table whose daily children follow the
//! `<parent>_YYMMDD` naming scheme. The registry fixes the column shape, the
//! date-column type, the dispatch mechanism (trigger vs. per-partition
//! rules) and the stable ordering key used for paged reads.

use serde::{Deserialize, Serialize};

use crate::domain::errors::{MigrationError, Result};

/// Supported partition table families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TableType {
    /// `point_history`: trigger-dispatched, bigint ms dates.
    #[serde(rename = "PH")]
    PointHistory,
    /// `trend_history`: rule-dispatched, bigint ms dates.
    #[serde(rename = "TH")]
    TrendHistory,
    /// `energy_display`: rule-dispatched, `timestamp` dates.
    #[serde(rename = "ED")]
    EnergyDisplay,
    /// `running_time_history`: rule-dispatched, bigint ms dates.
    #[serde(rename = "RT")]
    RunningTimeHistory,
}

/// How INSERTs on the parent reach the right child.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// A PL/pgSQL `BEFORE INSERT` trigger computes the child name at runtime.
    Trigger,
    /// One static `CREATE RULE` per child with a date-range predicate.
    Rules,
}

/// The SQL type of the partitioning date column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DateColumnKind {
    /// `int8` holding a Unix epoch in milliseconds.
    EpochMillis,
    /// `timestamp without time zone`.
    Timestamp,
}

/// One column of a family's fixed shape.
#[derive(Debug, Clone, Copy)]
pub struct ColumnDef {
    pub name: &'static str,
    pub sql_type: &'static str,
}

/// Static configuration for a partition family.
#[derive(Debug, Clone, Copy)]
pub struct TableTypeSpec {
    /// Parent table name, e.g. `point_history`.
    pub parent_table: &'static str,
    /// Human-readable name for logs.
    pub display_name: &'static str,
    pub dispatch: Dispatch,
    /// Name of the partitioning date column.
    pub date_column: &'static str,
    pub date_kind: DateColumnKind,
    pub columns: &'static [ColumnDef],
    /// Stable ordering key for paged reads; offsets are only reproducible
    /// when every page is sorted by this key.
    pub order_key: &'static [&'static str],
    /// Children of this family get a primary key on the ordering key.
    pub child_primary_key: bool,
}

const POINT_HISTORY_COLUMNS: &[ColumnDef] = &[
    ColumnDef { name: "path_id", sql_type: "int8" },
    ColumnDef { name: "issued_date", sql_type: "int8" },
    ColumnDef { name: "changed_value", sql_type: "varchar(100)" },
    ColumnDef { name: "connection_status", sql_type: "bool" },
];

const ENERGY_DISPLAY_COLUMNS: &[ColumnDef] = &[
    ColumnDef { name: "sensor_id", sql_type: "int8" },
    ColumnDef { name: "issued_date", sql_type: "timestamp" },
    ColumnDef { name: "station_id", sql_type: "varchar(20)" },
    ColumnDef { name: "value", sql_type: "float8" },
    ColumnDef { name: "co2", sql_type: "float8" },
    ColumnDef { name: "cost", sql_type: "float8" },
];

const RUNNING_TIME_COLUMNS: &[ColumnDef] = &[
    ColumnDef { name: "path_id", sql_type: "int8" },
    ColumnDef { name: "issued_date", sql_type: "int8" },
    ColumnDef { name: "save_type", sql_type: "int4" },
    ColumnDef { name: "checked_time", sql_type: "int8" },
    ColumnDef { name: "running_time", sql_type: "int8" },
    ColumnDef { name: "accu_time", sql_type: "int8" },
    ColumnDef { name: "running_count", sql_type: "int4" },
    ColumnDef { name: "eng_value", sql_type: "float8" },
    ColumnDef { name: "eng_accu_value", sql_type: "float8" },
    ColumnDef { name: "previous_weight_value", sql_type: "float8" },
];

const POINT_HISTORY_SPEC: TableTypeSpec = TableTypeSpec {
    parent_table: "point_history",
    display_name: "Point History",
    dispatch: Dispatch::Trigger,
    date_column: "issued_date",
    date_kind: DateColumnKind::EpochMillis,
    columns: POINT_HISTORY_COLUMNS,
    order_key: &["path_id", "issued_date"],
    child_primary_key: true,
};

const TREND_HISTORY_SPEC: TableTypeSpec = TableTypeSpec {
    parent_table: "trend_history",
    display_name: "Trend History",
    dispatch: Dispatch::Rules,
    date_column: "issued_date",
    date_kind: DateColumnKind::EpochMillis,
    columns: POINT_HISTORY_COLUMNS,
    order_key: &["path_id", "issued_date"],
    child_primary_key: false,
};

const ENERGY_DISPLAY_SPEC: TableTypeSpec = TableTypeSpec {
    parent_table: "energy_display",
    display_name: "Energy Display",
    dispatch: Dispatch::Rules,
    date_column: "issued_date",
    date_kind: DateColumnKind::Timestamp,
    columns: ENERGY_DISPLAY_COLUMNS,
    order_key: &["sensor_id", "issued_date", "station_id"],
    child_primary_key: false,
};

const RUNNING_TIME_SPEC: TableTypeSpec = TableTypeSpec {
    parent_table: "running_time_history",
    display_name: "Running Time History",
    dispatch: Dispatch::Rules,
    date_column: "issued_date",
    date_kind: DateColumnKind::EpochMillis,
    columns: RUNNING_TIME_COLUMNS,
    order_key: &["path_id", "issued_date"],
    child_primary_key: false,
};

impl TableType {
    /// All supported families, in catalog-code order.
    pub const ALL: &'static [TableType] = &[
        TableType::PointHistory,
        TableType::TrendHistory,
        TableType::EnergyDisplay,
        TableType::RunningTimeHistory,
    ];

    /// The catalog code stored in `partition_table_info.table_data`.
    pub fn code(&self) -> &'static str {
        match self {
            TableType::PointHistory => "PH",
            TableType::TrendHistory => "TH",
            TableType::EnergyDisplay => "ED",
            TableType::RunningTimeHistory => "RT",
        }
    }

    /// Resolves a catalog code; unknown codes are a validation error.
    pub fn from_code(code: &str) -> Result<TableType> {
        match code {
            "PH" => Ok(TableType::PointHistory),
            "TH" => Ok(TableType::TrendHistory),
            "ED" => Ok(TableType::EnergyDisplay),
            "RT" => Ok(TableType::RunningTimeHistory),
            other => Err(MigrationError::Validation(format!(
                "unknown table type code: {other}"
            ))),
        }
    }

    pub fn spec(&self) -> &'static TableTypeSpec {
        match self {
            TableType::PointHistory => &POINT_HISTORY_SPEC,
            TableType::TrendHistory => &TREND_HISTORY_SPEC,
            TableType::EnergyDisplay => &ENERGY_DISPLAY_SPEC,
            TableType::RunningTimeHistory => &RUNNING_TIME_SPEC,
        }
    }

    pub fn parent_table(&self) -> &'static str {
        self.spec().parent_table
    }
}

impl TableTypeSpec {
    /// Comma-joined column list, e.g. `path_id, issued_date, ...`.
    pub fn column_list(&self) -> String {
        self.columns
            .iter()
            .map(|c| c.name)
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// Comma-joined ordering key, e.g. `path_id, issued_date`.
    pub fn order_key_list(&self) -> String {
        self.order_key.join(", ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_round_trip() {
        for t in TableType::ALL {
            assert_eq!(TableType::from_code(t.code()).unwrap(), *t);
        }
    }

    #[test]
    fn test_unknown_code_rejected() {
        assert!(TableType::from_code("XX").is_err());
    }

    #[test]
    fn test_point_history_uses_trigger() {
        let spec = TableType::PointHistory.spec();
        assert_eq!(spec.dispatch, Dispatch::Trigger);
        assert_eq!(spec.date_kind, DateColumnKind::EpochMillis);
        assert!(spec.child_primary_key);
    }

    #[test]
    fn test_energy_display_is_timestamp_typed() {
        let spec = TableType::EnergyDisplay.spec();
        assert_eq!(spec.dispatch, Dispatch::Rules);
        assert_eq!(spec.date_kind, DateColumnKind::Timestamp);
        assert_eq!(spec.order_key, &["sensor_id", "issued_date", "station_id"]);
    }

    #[test]
    fn test_running_time_shape() {
        let spec = TableType::RunningTimeHistory.spec();
        assert_eq!(spec.columns.len(), 10);
        assert_eq!(spec.column_list().split(", ").count(), 10);
    }

    #[test]
    fn test_shared_point_shape() {
        // PH and TH share the same four-column shape.
        let ph = TableType::PointHistory.spec();
        let th = TableType::TrendHistory.spec();
        assert_eq!(ph.column_list(), th.column_list());
        assert_eq!(ph.order_key_list(), "path_id, issued_date");
    }
}
