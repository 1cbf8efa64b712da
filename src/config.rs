//! # Configuration Module
//!
//! Handles parsing of YAML/JSON run-request files and command-line
//! arguments.
//!
//! ## Key Structs
//! - `AppConfig`: the top-level configuration object.
//! - `CliArgs`: the struct derived from Clap for CLI parsing.
//!
//! CLI values override the file; `validate` runs before any connection is
//! opened so invalid requests fail fast.

use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use clap::Parser;
use serde::Deserialize;

use crate::domain::errors::{MigrationError, Result};
use crate::domain::models::{CompatMode, ConnectionConfig, EngineKind};
use crate::domain::table_types::TableType;
use crate::engine::worker::RunRequest;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
/// Command Line Arguments
pub struct CliArgs {
    /// Path to a run-request file (YAML or JSON)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    // Overrides for ad-hoc runs
    /// Stored profile name to run against
    #[arg(long)]
    pub profile: Option<String>,
    /// First calendar day of the range (YYYY-MM-DD)
    #[arg(long)]
    pub start_date: Option<String>,
    /// Last calendar day of the range (YYYY-MM-DD)
    #[arg(long)]
    pub end_date: Option<String>,
    /// Comma-separated table type codes (PH,TH,ED,RT)
    #[arg(long)]
    pub table_types: Option<String>,
    /// Copy engine: "copy" (streaming COPY) or "batch" (row batches)
    #[arg(long)]
    pub engine: Option<String>,
    /// Resume the profile's latest unfinished run
    #[arg(long)]
    pub resume: bool,
    /// Keep going after a failed partition instead of aborting the run
    #[arg(long)]
    pub continue_on_error: bool,
    /// Answer truncate confirmations with yes
    #[arg(short = 'y', long)]
    pub assume_yes: bool,
}

#[derive(Debug, Deserialize, Clone)]
/// Inline connection profile; upserted into the store before the run.
pub struct ProfileConfig {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub source: ConnectionConfig,
    pub target: ConnectionConfig,
    #[serde(default)]
    pub compat_mode: CompatMode,
}

#[derive(Debug, Deserialize, Clone, Default)]
/// Run parameters.
pub struct MigrationConfig {
    /// Stored profile name (alternative to an inline `profile` block)
    pub profile: Option<String>,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    pub table_types: Option<Vec<TableType>>,
    pub engine: Option<EngineKind>,
    #[serde(default)]
    pub resume: bool,
    #[serde(default)]
    pub continue_on_error: bool,
    #[serde(default)]
    pub assume_yes: bool,
}

#[derive(Debug, Deserialize, Clone)]
/// Main application configuration.
pub struct AppConfig {
    /// Inline connection profile (optional)
    pub profile: Option<ProfileConfig>,
    /// Run parameters
    #[serde(default)]
    pub migration: MigrationConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        AppConfig {
            profile: None,
            migration: MigrationConfig::default(),
        }
    }
}

impl AppConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: AppConfig = if path.extension().is_some_and(|ext| ext == "json") {
            serde_json::from_str(&contents)
                .map_err(|e| MigrationError::Config(format!("{}: {e}", path.display())))?
        } else {
            serde_yaml::from_str(&contents)
                .map_err(|e| MigrationError::Config(format!("{}: {e}", path.display())))?
        };
        Ok(config)
    }

    pub fn merge_cli(&mut self, args: &CliArgs) -> Result<()> {
        let m = &mut self.migration;
        if let Some(name) = &args.profile {
            m.profile = Some(name.clone());
        }
        if let Some(s) = &args.start_date {
            m.start_date = Some(parse_date(s)?);
        }
        if let Some(s) = &args.end_date {
            m.end_date = Some(parse_date(s)?);
        }
        if let Some(codes) = &args.table_types {
            m.table_types = Some(parse_table_types(codes)?);
        }
        if let Some(engine) = &args.engine {
            m.engine = Some(EngineKind::parse(engine).ok_or_else(|| {
                MigrationError::Config(format!(
                    "unknown engine {engine} (expected \"copy\" or \"batch\")"
                ))
            })?);
        }
        if args.resume {
            m.resume = true;
        }
        if args.continue_on_error {
            m.continue_on_error = true;
        }
        if args.assume_yes {
            m.assume_yes = true;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let m = &self.migration;
        if self.profile.is_none() && m.profile.is_none() {
            return Err(MigrationError::Config(
                "no profile given: add a profile block or --profile <name>".to_string(),
            ));
        }
        let (start, end) = match (m.start_date, m.end_date) {
            (Some(start), Some(end)) => (start, end),
            _ => {
                return Err(MigrationError::Config(
                    "both start_date and end_date are required".to_string(),
                ))
            }
        };
        if start > end {
            return Err(MigrationError::Config(format!(
                "start_date {start} is after end_date {end}"
            )));
        }
        match &m.table_types {
            Some(types) if !types.is_empty() => {}
            _ => {
                return Err(MigrationError::Config(
                    "table_types must name at least one of PH, TH, ED, RT".to_string(),
                ))
            }
        }
        Ok(())
    }

    /// The validated run request; call after `validate`.
    pub fn to_run_request(&self) -> RunRequest {
        let m = &self.migration;
        RunRequest {
            start: m.start_date.expect("validated"),
            end: m.end_date.expect("validated"),
            types: m.table_types.clone().expect("validated"),
            engine: m.engine.unwrap_or(EngineKind::StreamingCopy),
            resume: m.resume,
            continue_on_error: m.continue_on_error,
            auto_approve_truncate: m.assume_yes,
        }
    }
}

fn parse_date(s: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .map_err(|_| MigrationError::Config(format!("invalid date {s} (expected YYYY-MM-DD)")))
}

fn parse_table_types(codes: &str) -> Result<Vec<TableType>> {
    let mut types = Vec::new();
    for code in codes.split(',') {
        let code = code.trim();
        if code.is_empty() {
            continue;
        }
        let table_type = TableType::from_code(&code.to_uppercase())
            .map_err(|_| MigrationError::Config(format!("unknown table type code: {code}")))?;
        if !types.contains(&table_type) {
            types.push(table_type);
        }
    }
    Ok(types)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const YAML: &str = r#"
profile:
  name: "legacy-site"
  source:
    host: "src-db"
    port: 5432
    dbname: "scada"
    user: "reader"
    password: "src-pass"
  target:
    host: "dst-db"
    port: 5433
    dbname: "scada"
    user: "writer"
    password: "dst-pass"
    sslmode: require
  compat_mode: v9_3
migration:
  start_date: 2024-09-21
  end_date: 2024-09-23
  table_types: [PH, ED]
  engine: streaming_copy
"#;

    fn write_config(contents: &str, suffix: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(suffix).tempfile().unwrap();
        write!(file, "{contents}").unwrap();
        file
    }

    #[test]
    fn test_load_yaml_config() {
        let file = write_config(YAML, ".yaml");
        let config = AppConfig::from_file(file.path()).expect("failed to parse config");

        let profile = config.profile.as_ref().unwrap();
        assert_eq!(profile.name, "legacy-site");
        assert_eq!(profile.compat_mode, CompatMode::V9_3);
        assert_eq!(profile.source.host, "src-db");
        assert_eq!(
            profile.target.sslmode,
            crate::domain::models::SslMode::Require
        );

        let m = &config.migration;
        assert_eq!(m.start_date.unwrap().to_string(), "2024-09-21");
        assert_eq!(
            m.table_types.as_deref(),
            Some(&[TableType::PointHistory, TableType::EnergyDisplay][..])
        );
        assert_eq!(m.engine, Some(EngineKind::StreamingCopy));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_cli_overrides_file() {
        let file = write_config(YAML, ".yaml");
        let mut config = AppConfig::from_file(file.path()).unwrap();
        let args = CliArgs::parse_from([
            "pg-partition-migrator",
            "--end-date",
            "2024-09-30",
            "--table-types",
            "ph,rt",
            "--engine",
            "batch",
            "--assume-yes",
        ]);
        config.merge_cli(&args).unwrap();

        let request = config.to_run_request();
        assert_eq!(request.end.to_string(), "2024-09-30");
        assert_eq!(
            request.types,
            vec![TableType::PointHistory, TableType::RunningTimeHistory]
        );
        assert_eq!(request.engine, EngineKind::RowBatch);
        assert!(request.auto_approve_truncate);
    }

    #[test]
    fn test_validate_requires_types_and_dates() {
        let mut config = AppConfig::default();
        config.migration.profile = Some("p".to_string());
        assert!(config.validate().is_err());

        config.migration.start_date = parse_date("2024-09-21").ok();
        config.migration.end_date = parse_date("2024-09-23").ok();
        assert!(config.validate().is_err()); // still no table types

        config.migration.table_types = Some(vec![TableType::PointHistory]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_inverted_range() {
        let mut config = AppConfig::default();
        config.migration.profile = Some("p".to_string());
        config.migration.start_date = parse_date("2024-09-23").ok();
        config.migration.end_date = parse_date("2024-09-21").ok();
        config.migration.table_types = Some(vec![TableType::PointHistory]);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unknown_type_code_rejected() {
        assert!(parse_table_types("PH,XX").is_err());
        assert_eq!(
            parse_table_types("ph, th").unwrap(),
            vec![TableType::PointHistory, TableType::TrendHistory]
        );
    }

    #[test]
    fn test_json_config_accepted() {
        let json = r#"{
            "migration": {
                "profile": "stored-profile",
                "start_date": "2024-02-01",
                "end_date": "2024-02-29",
                "table_types": ["PH", "ED"],
                "engine": "row_batch"
            }
        }"#;
        let file = write_config(json, ".json");
        let config = AppConfig::from_file(file.path()).unwrap();
        assert!(config.profile.is_none());
        assert_eq!(config.migration.profile.as_deref(), Some("stored-profile"));
        assert!(config.validate().is_ok());
    }
}
