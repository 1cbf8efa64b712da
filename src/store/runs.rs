//! Run-history repository. A run row is created when the worker starts,
//! updated as partitions finish and finalized exactly once with a terminal
//! status.

use chrono::Utc;
use rusqlite::{params, OptionalExtension, Row};

use crate::domain::errors::Result;
use crate::domain::models::{EngineKind, MigrationRun, RunStatus};
use crate::store::{format_ts, parse_ts, Store};

/// Input for a new run row.
#[derive(Debug, Clone)]
pub struct NewRun {
    pub profile_id: i64,
    pub session_id: String,
    pub start_date: String,
    pub end_date: String,
    pub engine: EngineKind,
}

impl Store {
    pub fn create_run(&self, new: &NewRun) -> Result<MigrationRun> {
        let now = format_ts(Utc::now());
        let id = self.with_tx(|tx| {
            tx.execute(
                "INSERT INTO migration_runs (profile_id, session_id, start_date, end_date, engine, started_at, status)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'running')",
                params![
                    new.profile_id,
                    new.session_id,
                    new.start_date,
                    new.end_date,
                    new.engine.as_str(),
                    now
                ],
            )?;
            Ok(tx.last_insert_rowid())
        })?;
        Ok(self.get_run(id)?.expect("run row just inserted"))
    }

    pub fn get_run(&self, id: i64) -> Result<Option<MigrationRun>> {
        self.with_conn(|c| {
            c.query_row(
                &format!("{RUN_SELECT} WHERE id = ?1"),
                params![id],
                run_from_row,
            )
            .optional()
        })
    }

    /// Latest run for the profile that is still worth resuming
    /// (`running`, `paused` or `failed`).
    pub fn incomplete_run_for(&self, profile_id: i64) -> Result<Option<MigrationRun>> {
        self.with_conn(|c| {
            c.query_row(
                &format!(
                    "{RUN_SELECT} WHERE profile_id = ?1
                       AND status IN ('running', 'paused', 'failed')
                     ORDER BY started_at DESC LIMIT 1"
                ),
                params![profile_id],
                run_from_row,
            )
            .optional()
        })
    }

    /// A resumed run gets the resuming process's session id.
    pub fn update_run_session(&self, run_id: i64, session_id: &str) -> Result<()> {
        self.with_tx(|tx| {
            tx.execute(
                "UPDATE migration_runs SET session_id = ?2 WHERE id = ?1",
                params![run_id, session_id],
            )?;
            Ok(())
        })
    }

    /// Status change; terminal statuses also stamp `completed_at`.
    pub fn update_run_status(
        &self,
        run_id: i64,
        status: RunStatus,
        error: Option<&str>,
    ) -> Result<()> {
        let completed_at = status.is_terminal().then(|| format_ts(Utc::now()));
        self.with_tx(|tx| {
            tx.execute(
                "UPDATE migration_runs
                 SET status = ?2,
                     error_message = COALESCE(?3, error_message),
                     completed_at = COALESCE(?4, completed_at)
                 WHERE id = ?1",
                params![run_id, status.as_str(), error, completed_at],
            )?;
            Ok(())
        })
    }

    pub fn set_run_partition_total(&self, run_id: i64, total_partitions: i64) -> Result<()> {
        self.with_tx(|tx| {
            tx.execute(
                "UPDATE migration_runs SET total_partitions = ?2 WHERE id = ?1",
                params![run_id, total_partitions],
            )?;
            Ok(())
        })
    }

    pub fn update_run_progress(
        &self,
        run_id: i64,
        completed_partitions: i64,
        total_rows: i64,
    ) -> Result<()> {
        self.with_tx(|tx| {
            tx.execute(
                "UPDATE migration_runs SET completed_partitions = ?2, total_rows = ?3 WHERE id = ?1",
                params![run_id, completed_partitions, total_rows],
            )?;
            Ok(())
        })
    }

    /// Stores the pre-run connection probe outcomes.
    pub fn record_connection_checks(
        &self,
        run_id: i64,
        source_status: &str,
        target_status: &str,
    ) -> Result<()> {
        let now = format_ts(Utc::now());
        self.with_tx(|tx| {
            tx.execute(
                "UPDATE migration_runs
                 SET source_connection_status = ?2,
                     target_connection_status = ?3,
                     connection_check_time = ?4
                 WHERE id = ?1",
                params![run_id, source_status, target_status, now],
            )?;
            Ok(())
        })
    }

    /// Removes a run; cascades to checkpoints and log entries.
    pub fn delete_run(&self, run_id: i64) -> Result<bool> {
        let n = self.with_tx(|tx| {
            tx.execute("DELETE FROM migration_runs WHERE id = ?1", params![run_id])
        })?;
        Ok(n > 0)
    }
}

const RUN_SELECT: &str = "SELECT id, profile_id, session_id, start_date, end_date, engine,
        started_at, completed_at, status, total_partitions, completed_partitions,
        total_rows, error_message
 FROM migration_runs";

fn run_from_row(row: &Row<'_>) -> rusqlite::Result<MigrationRun> {
    let engine: String = row.get(5)?;
    let status: String = row.get(8)?;
    let started_at: String = row.get(6)?;
    let completed_at: Option<String> = row.get(7)?;
    Ok(MigrationRun {
        id: row.get(0)?,
        profile_id: row.get(1)?,
        session_id: row.get(2)?,
        start_date: row.get(3)?,
        end_date: row.get(4)?,
        engine: EngineKind::parse(&engine).unwrap_or(EngineKind::StreamingCopy),
        started_at: parse_ts(&started_at)?,
        completed_at: completed_at.as_deref().map(parse_ts).transpose()?,
        status: RunStatus::parse(&status).unwrap_or(RunStatus::Failed),
        total_partitions: row.get(9)?,
        completed_partitions: row.get(10)?,
        total_rows: row.get(11)?,
        error_message: row.get(12)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::profiles::ProfileSpec;
    use crate::domain::models::{CompatMode, ConnectionConfig, SslMode};
    use crate::vault::CredentialVault;

    fn seed_profile(store: &Store) -> i64 {
        let vault = CredentialVault::from_key(&[1u8; 32]);
        let config = ConnectionConfig {
            host: "h".to_string(),
            port: 5432,
            dbname: "d".to_string(),
            user: "u".to_string(),
            password: "p".to_string(),
            sslmode: SslMode::Disable,
        };
        store
            .upsert_profile(
                &vault,
                &ProfileSpec {
                    name: "p1".to_string(),
                    description: String::new(),
                    source: config.clone(),
                    target: config,
                    compat_mode: CompatMode::Auto,
                },
            )
            .unwrap()
            .id
    }

    fn new_run(profile_id: i64) -> NewRun {
        NewRun {
            profile_id,
            session_id: "sess-1".to_string(),
            start_date: "2024-09-21".to_string(),
            end_date: "2024-09-23".to_string(),
            engine: EngineKind::StreamingCopy,
        }
    }

    #[test]
    fn test_create_starts_running() {
        let store = Store::open_in_memory().unwrap();
        let profile_id = seed_profile(&store);
        let run = store.create_run(&new_run(profile_id)).unwrap();
        assert_eq!(run.status, RunStatus::Running);
        assert_eq!(run.engine, EngineKind::StreamingCopy);
        assert_eq!(run.session_id, "sess-1");
        assert_eq!(run.start_date, "2024-09-21");
        assert!(run.completed_at.is_none());
    }

    #[test]
    fn test_terminal_status_stamps_completed_at() {
        let store = Store::open_in_memory().unwrap();
        let run = store.create_run(&new_run(seed_profile(&store))).unwrap();

        store
            .update_run_status(run.id, RunStatus::Completed, None)
            .unwrap();
        let reread = store.get_run(run.id).unwrap().unwrap();
        assert_eq!(reread.status, RunStatus::Completed);
        assert!(reread.completed_at.is_some());
    }

    #[test]
    fn test_incomplete_for_picks_resumable() {
        let store = Store::open_in_memory().unwrap();
        let profile_id = seed_profile(&store);

        let done = store.create_run(&new_run(profile_id)).unwrap();
        store
            .update_run_status(done.id, RunStatus::Completed, None)
            .unwrap();
        assert!(store.incomplete_run_for(profile_id).unwrap().is_none());

        let failed = store.create_run(&new_run(profile_id)).unwrap();
        store
            .update_run_status(failed.id, RunStatus::Failed, Some("net down"))
            .unwrap();
        let found = store.incomplete_run_for(profile_id).unwrap().unwrap();
        assert_eq!(found.id, failed.id);
        assert_eq!(found.error_message.as_deref(), Some("net down"));
    }

    #[test]
    fn test_delete_cascades_to_children() {
        let store = Store::open_in_memory().unwrap();
        let run = store.create_run(&new_run(seed_profile(&store))).unwrap();
        store
            .create_checkpoints(run.id, &["point_history_240921"], EngineKind::StreamingCopy)
            .unwrap();

        assert!(store.delete_run(run.id).unwrap());
        let n: i64 = store
            .with_conn(|c| c.query_row("SELECT COUNT(*) FROM checkpoints", [], |r| r.get(0)))
            .unwrap();
        assert_eq!(n, 0);
    }
}
