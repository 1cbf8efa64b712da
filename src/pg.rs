//! # PostgreSQL Plumbing
//!
//! Connection construction from profile configs, a custom r2d2 manager,
//! the pre-run connection probe, per-connection session tuning and the
//! small query helpers shared by discovery and the engines.

use std::time::Duration;

use log::{debug, info, warn};
use postgres::config::SslMode as PgSslMode;
use postgres::{Client, Config, NoTls};
use r2d2::ManageConnection;

use crate::domain::errors::Result;
use crate::domain::models::{CompatMode, ConnectionConfig, SslMode};

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);
/// Statement timeout for counts and DDL; COPY itself runs unbounded.
pub const CONTROL_STATEMENT_TIMEOUT_MS: i64 = 60_000;

/// Builds a driver config from a profile connection config.
fn pg_config(cfg: &ConnectionConfig, connect_timeout: Option<Duration>) -> Config {
    let mut config = Config::new();
    config
        .host(&cfg.host)
        .port(cfg.port)
        .dbname(&cfg.dbname)
        .user(&cfg.user)
        .password(&cfg.password)
        .application_name("pg-partition-migrator");
    config.ssl_mode(match cfg.sslmode {
        SslMode::Disable => PgSslMode::Disable,
        SslMode::Prefer => PgSslMode::Prefer,
        SslMode::Require => PgSslMode::Require,
    });
    if let Some(timeout) = connect_timeout {
        config.connect_timeout(timeout);
    }
    config
}

/// Opens a single connection.
pub fn connect(cfg: &ConnectionConfig) -> Result<Client> {
    Ok(pg_config(cfg, None).connect(NoTls)?)
}

/// r2d2 connection manager over the sync `postgres` client.
///
/// `Debug` is implemented by hand so the password can never reach a log
/// line through the pool.
#[derive(Clone)]
pub struct PgConnectionManager {
    config: Config,
    label: String,
}

impl PgConnectionManager {
    pub fn new(cfg: &ConnectionConfig, label: &str) -> PgConnectionManager {
        PgConnectionManager {
            config: pg_config(cfg, Some(PROBE_TIMEOUT)),
            label: label.to_string(),
        }
    }
}

impl std::fmt::Debug for PgConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgConnectionManager")
            .field("label", &self.label)
            .field("password", &"*****")
            .finish()
    }
}

impl ManageConnection for PgConnectionManager {
    type Connection = Client;
    type Error = postgres::Error;

    fn connect(&self) -> std::result::Result<Client, postgres::Error> {
        debug!("opening {} connection", self.label);
        self.config.clone().connect(NoTls)
    }

    fn is_valid(&self, conn: &mut Client) -> std::result::Result<(), postgres::Error> {
        conn.simple_query("SELECT 1").map(|_| ())
    }

    fn has_broken(&self, conn: &mut Client) -> bool {
        conn.is_closed()
    }
}

/// Small fixed-size pool for one side of a run.
pub type PgPool = r2d2::Pool<PgConnectionManager>;

/// Applies bulk-load session tuning to every pooled connection exactly
/// once, right after it is opened.
#[derive(Debug)]
struct TuningCustomizer {
    compat: CompatMode,
}

impl r2d2::CustomizeConnection<Client, postgres::Error> for TuningCustomizer {
    fn on_acquire(&self, conn: &mut Client) -> std::result::Result<(), postgres::Error> {
        apply_session_tuning(conn, self.compat);
        Ok(())
    }
}

/// Builds a pool; with `tuning` set, new connections get the compat
/// profile's session parameters before first use.
pub fn build_pool(
    cfg: &ConnectionConfig,
    label: &str,
    size: u32,
    tuning: Option<CompatMode>,
) -> Result<PgPool> {
    let manager = PgConnectionManager::new(cfg, label);
    let mut builder = r2d2::Pool::builder()
        .max_size(size)
        .connection_timeout(Duration::from_secs(30));
    if let Some(compat) = tuning {
        builder = builder.connection_customizer(Box::new(TuningCustomizer { compat }));
    }
    Ok(builder.build(manager)?)
}

/// Quick reachability probe with a 5 s timeout. Returns `(ok, message)`
/// with a classified, human-readable failure reason.
pub fn check_connection(cfg: &ConnectionConfig) -> (bool, String) {
    match pg_config(cfg, Some(PROBE_TIMEOUT)).connect(NoTls) {
        Ok(mut client) => match client.simple_query("SELECT 1") {
            Ok(_) => (true, format!("connected to {}", cfg.describe())),
            Err(e) => (false, format!("handshake succeeded but query failed: {e}")),
        },
        Err(e) => (false, classify_connect_error(cfg, &e)),
    }
}

fn classify_connect_error(cfg: &ConnectionConfig, e: &postgres::Error) -> String {
    let text = e.to_string();
    if text.contains("password authentication failed") || text.contains("authentication") {
        format!("authentication failed for user {}", cfg.user)
    } else if text.contains("timed out") || text.contains("timeout") {
        "network timeout".to_string()
    } else if text.contains("does not exist") {
        format!("database {} does not exist", cfg.dbname)
    } else if text.contains("refused") || text.contains("could not connect") {
        format!("host unreachable: {}:{}", cfg.host, cfg.port)
    } else {
        format!("connection failed: {text}")
    }
}

/// Resolves `auto` compatibility by asking the server for its version.
pub fn resolve_compat_mode(client: &mut Client, requested: CompatMode) -> CompatMode {
    if requested != CompatMode::Auto {
        return requested;
    }
    let resolved = client
        .query_one("SHOW server_version_num", &[])
        .ok()
        .and_then(|row| row.get::<_, String>(0).parse::<i64>().ok())
        .map(|num| if num < 100_000 { CompatMode::V9_3 } else { CompatMode::V16 })
        .unwrap_or(CompatMode::V9_3);
    info!("resolved compatibility mode: {}", resolved.as_str());
    resolved
}

/// Session-level bulk-load tuning, applied once per connection before any
/// partition. Parameters a server rejects (wrong version, not
/// session-settable) are logged and skipped.
pub fn apply_session_tuning(client: &mut Client, compat: CompatMode) {
    let params: &[(&str, &str)] = match compat {
        CompatMode::V9_3 | CompatMode::Auto => {
            &[("synchronous_commit", "off"), ("work_mem", "128MB")]
        }
        CompatMode::V16 => &[
            ("synchronous_commit", "off"),
            ("work_mem", "256MB"),
            ("max_wal_size", "4GB"),
        ],
    };
    for (name, value) in params {
        match client.batch_execute(&format!("SET {name} = '{value}'")) {
            Ok(()) => debug!("session tuning: {name} = {value}"),
            Err(e) => warn!("session tuning skipped: {name} = {value}: {e}"),
        }
    }
}

/// True when `table` exists in the public schema.
pub fn table_exists(client: &mut Client, table: &str) -> Result<bool> {
    let row = client.query_one(
        "SELECT EXISTS (
             SELECT 1 FROM information_schema.tables
             WHERE table_schema = 'public' AND table_name = $1
         )",
        &[&table],
    )?;
    Ok(row.get(0))
}

/// Exact row count with the control-plane statement timeout.
pub fn count_rows(client: &mut Client, table: &str) -> Result<i64> {
    let mut tx = client.transaction()?;
    tx.batch_execute(&format!(
        "SET LOCAL statement_timeout = {CONTROL_STATEMENT_TIMEOUT_MS}"
    ))?;
    let count_sql = format!("SELECT COUNT(*) FROM {}", quote_ident(table));
    let row = tx.query_one(count_sql.as_str(), &[])?;
    let count: i64 = row.get(0);
    tx.commit()?;
    Ok(count)
}

/// Size summary used by the COPY engine for its denominator and metrics.
#[derive(Debug, Clone, Copy)]
pub struct TableSize {
    pub exists: bool,
    pub row_count: i64,
    pub total_bytes: i64,
}

pub fn estimate_table_size(client: &mut Client, table: &str) -> Result<TableSize> {
    if !table_exists(client, table)? {
        return Ok(TableSize {
            exists: false,
            row_count: 0,
            total_bytes: 0,
        });
    }
    let row_count = count_rows(client, table)?;
    let row = client.query_one("SELECT pg_total_relation_size($1::regclass)", &[&table])?;
    let total_bytes: i64 = row.get(0);
    Ok(TableSize {
        exists: true,
        row_count,
        total_bytes,
    })
}

/// Double-quotes an identifier, doubling any embedded quote.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Best-effort COPY privilege probe; a definitive answer needs superuser
/// catalogs, so failures only produce a warning.
pub fn check_copy_privileges(client: &mut Client) {
    match client.query_one(
        "SELECT rolsuper FROM pg_roles WHERE rolname = current_user",
        &[],
    ) {
        Ok(row) => {
            let superuser: bool = row.get(0);
            if !superuser {
                debug!("current user is not superuser; COPY relies on table grants");
            }
        }
        Err(e) => warn!("could not verify COPY privileges: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_ident_plain() {
        assert_eq!(quote_ident("point_history_240921"), "\"point_history_240921\"");
    }

    #[test]
    fn test_quote_ident_escapes_quotes() {
        assert_eq!(quote_ident("odd\"name"), "\"odd\"\"name\"");
    }

    #[test]
    fn test_manager_debug_masks_password() {
        let cfg = ConnectionConfig {
            host: "db1".to_string(),
            port: 5432,
            dbname: "scada".to_string(),
            user: "migrator".to_string(),
            password: "s3cret".to_string(),
            sslmode: SslMode::Require,
        };
        let manager = PgConnectionManager::new(&cfg, "source");
        let debug = format!("{manager:?}");
        assert!(!debug.contains("s3cret"));
        assert!(debug.contains("source"));
    }
}
