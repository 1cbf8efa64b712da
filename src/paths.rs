//! # Application Paths
//!
//! Single resolution point for every location the engine persists to:
//! the metadata store, the vault key and the log directory. The root is
//! the platform data directory, overridable through
//! `MIGRATION_APP_DATA_DIR` (used by tests and portable installs).

use std::path::{Path, PathBuf};

use directories::ProjectDirs;

use crate::domain::errors::{MigrationError, Result};

/// Environment variable redirecting the storage root.
pub const DATA_DIR_ENV: &str = "MIGRATION_APP_DATA_DIR";

/// Resolved storage layout, computed once at startup and passed explicitly.
#[derive(Debug, Clone)]
pub struct AppPaths {
    root: PathBuf,
}

impl AppPaths {
    /// Resolves the storage root from the environment override or the
    /// platform data directory, creating it if missing.
    pub fn resolve() -> Result<AppPaths> {
        match std::env::var_os(DATA_DIR_ENV) {
            Some(dir) => Self::at(PathBuf::from(dir)),
            None => {
                let dirs = ProjectDirs::from("", "", "pg-partition-migrator").ok_or_else(|| {
                    MigrationError::Config("could not determine a home directory".to_string())
                })?;
                Self::at(dirs.data_dir().to_path_buf())
            }
        }
    }

    /// Uses an explicit root (tests inject a temp directory here).
    pub fn at(root: PathBuf) -> Result<AppPaths> {
        std::fs::create_dir_all(&root)?;
        Ok(AppPaths { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The embedded metadata store.
    pub fn db_path(&self) -> PathBuf {
        self.root.join("migration.db")
    }

    /// The 256-bit vault key.
    pub fn vault_key_path(&self) -> PathBuf {
        self.root.join("vault.key")
    }

    /// Daily-rotated text logs live here.
    pub fn logs_dir(&self) -> Result<PathBuf> {
        let dir = self.root.join("logs");
        std::fs::create_dir_all(&dir)?;
        Ok(dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_under_root() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = AppPaths::at(tmp.path().to_path_buf()).unwrap();

        assert_eq!(paths.db_path(), tmp.path().join("migration.db"));
        assert_eq!(paths.vault_key_path(), tmp.path().join("vault.key"));

        let logs = paths.logs_dir().unwrap();
        assert!(logs.is_dir());
        assert_eq!(logs, tmp.path().join("logs"));
    }

    #[test]
    fn test_root_is_created() {
        let tmp = tempfile::tempdir().unwrap();
        let nested = tmp.path().join("a").join("b");
        let paths = AppPaths::at(nested.clone()).unwrap();
        assert!(nested.is_dir());
        assert_eq!(paths.root(), nested.as_path());
    }
}
