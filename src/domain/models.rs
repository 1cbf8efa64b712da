//! # Domain Models
//!
//! Plain data carried between the store, the discovery step and the
//! engines: connection profiles, partition descriptors, run history and
//! checkpoints. Profiles ↔ runs ↔ checkpoints form a tree linked by
//! surrogate ids; no struct holds a back-reference.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::table_types::TableType;

/// TLS requirement for a PostgreSQL connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SslMode {
    Disable,
    #[default]
    Prefer,
    Require,
}

/// Server compatibility profile; decides which session tuning applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompatMode {
    /// Resolve from `server_version_num` at connect time.
    #[default]
    Auto,
    V9_3,
    V16,
}

impl CompatMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            CompatMode::Auto => "auto",
            CompatMode::V9_3 => "v9_3",
            CompatMode::V16 => "v16",
        }
    }

    pub fn parse(s: &str) -> Option<CompatMode> {
        match s {
            "auto" => Some(CompatMode::Auto),
            "v9_3" => Some(CompatMode::V9_3),
            "v16" => Some(CompatMode::V16),
            _ => None,
        }
    }
}

/// One side of a profile: everything needed to open a connection.
///
/// The password only exists in plaintext inside this struct; at rest both
/// configs are sealed by the credential vault.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    pub host: String,
    pub port: u16,
    pub dbname: String,
    pub user: String,
    pub password: String,
    #[serde(default)]
    pub sslmode: SslMode,
}

impl ConnectionConfig {
    /// Display form with the password elided, safe for logs.
    pub fn describe(&self) -> String {
        format!(
            "{}@{}:{}/{}",
            self.user, self.host, self.port, self.dbname
        )
    }
}

/// A stored source/target connection pair.
#[derive(Debug, Clone)]
pub struct ConnectionProfile {
    pub id: i64,
    pub name: String,
    pub description: String,
    pub source: ConnectionConfig,
    pub target: ConnectionConfig,
    pub compat_mode: CompatMode,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One partition to migrate, as resolved by discovery.
///
/// Invariant: `from_date <= to_date`; `child` is unique within a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionDescriptor {
    /// Parent table, e.g. `point_history`.
    pub parent: String,
    /// Child table, e.g. `point_history_240921`.
    pub child: String,
    pub table_type: TableType,
    /// Lower bound, Unix epoch milliseconds (catalog representation).
    pub from_date: i64,
    /// Upper bound, Unix epoch milliseconds (catalog representation).
    pub to_date: i64,
    /// Best-effort planner estimate; never authoritative.
    pub estimated_rows: Option<i64>,
    /// Mirrored verbatim into the target catalog row.
    pub cluster_index: bool,
}

/// Which copy routine a run uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineKind {
    RowBatch,
    StreamingCopy,
}

impl EngineKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EngineKind::RowBatch => "row_batch",
            EngineKind::StreamingCopy => "streaming_copy",
        }
    }

    pub fn parse(s: &str) -> Option<EngineKind> {
        match s {
            "row_batch" | "batch" => Some(EngineKind::RowBatch),
            "streaming_copy" | "copy" => Some(EngineKind::StreamingCopy),
            _ => None,
        }
    }
}

/// Lifecycle of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Running,
    Paused,
    Completed,
    Failed,
    Canceled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Paused => "paused",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Canceled => "canceled",
        }
    }

    pub fn parse(s: &str) -> Option<RunStatus> {
        match s {
            "running" => Some(RunStatus::Running),
            "paused" => Some(RunStatus::Paused),
            "completed" => Some(RunStatus::Completed),
            "failed" => Some(RunStatus::Failed),
            "canceled" => Some(RunStatus::Canceled),
            _ => None,
        }
    }

    /// Terminal states are never left again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Canceled
        )
    }
}

/// One activation of the engine against a profile.
#[derive(Debug, Clone)]
pub struct MigrationRun {
    pub id: i64,
    pub profile_id: i64,
    pub session_id: String,
    pub start_date: String,
    pub end_date: String,
    pub engine: EngineKind,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub status: RunStatus,
    pub total_partitions: i64,
    pub completed_partitions: i64,
    pub total_rows: i64,
    pub error_message: Option<String>,
}

/// Per-partition progress record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl CheckpointStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckpointStatus::Pending => "pending",
            CheckpointStatus::InProgress => "in_progress",
            CheckpointStatus::Completed => "completed",
            CheckpointStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<CheckpointStatus> {
        match s {
            "pending" => Some(CheckpointStatus::Pending),
            "in_progress" => Some(CheckpointStatus::InProgress),
            "completed" => Some(CheckpointStatus::Completed),
            "failed" => Some(CheckpointStatus::Failed),
            _ => None,
        }
    }
}

/// Resume state for one `(run, partition)` pair.
///
/// Invariant: once `completed`, a checkpoint is never reopened within the
/// same run, and `rows_copied` equals the source count at commit time.
#[derive(Debug, Clone)]
pub struct Checkpoint {
    pub run_id: i64,
    pub partition_name: String,
    /// Discovery-order ordinal; `pending_for` sorts on this.
    pub seq: i64,
    pub status: CheckpointStatus,
    pub rows_copied: i64,
    /// Row-batch resume offset; the COPY engine always restarts from zero.
    pub last_offset: i64,
    pub bytes_transferred: i64,
    /// Copy routine that produced this checkpoint, recorded per partition
    /// so a resumed run under a different engine stays attributable.
    pub engine: EngineKind,
    pub error_message: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// One structured log record bound for the `logs` table.
#[derive(Debug, Clone)]
pub struct LogRecord {
    pub session_id: String,
    pub run_id: Option<i64>,
    pub ts: DateTime<Utc>,
    pub level: String,
    pub component: String,
    pub message: String,
    pub context: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_status_round_trip() {
        for s in [
            RunStatus::Running,
            RunStatus::Paused,
            RunStatus::Completed,
            RunStatus::Failed,
            RunStatus::Canceled,
        ] {
            assert_eq!(RunStatus::parse(s.as_str()), Some(s));
        }
        assert!(RunStatus::Completed.is_terminal());
        assert!(!RunStatus::Paused.is_terminal());
    }

    #[test]
    fn test_engine_kind_aliases() {
        assert_eq!(EngineKind::parse("copy"), Some(EngineKind::StreamingCopy));
        assert_eq!(EngineKind::parse("batch"), Some(EngineKind::RowBatch));
        assert_eq!(
            EngineKind::parse("streaming_copy"),
            Some(EngineKind::StreamingCopy)
        );
        assert_eq!(EngineKind::parse("bulk"), None);
    }

    #[test]
    fn test_describe_hides_password() {
        let cfg = ConnectionConfig {
            host: "db1".to_string(),
            port: 5432,
            dbname: "scada".to_string(),
            user: "migrator".to_string(),
            password: "s3cret".to_string(),
            sslmode: SslMode::Prefer,
        };
        let shown = cfg.describe();
        assert!(!shown.contains("s3cret"));
        assert_eq!(shown, "migrator@db1:5432/scada");
    }
}
