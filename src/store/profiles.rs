//! Profile repository: CRUD over `profiles` with vault-sealed connection
//! configs. Plaintext credentials exist only in the returned
//! `ConnectionProfile`; at rest both sides are AES-sealed JSON.

use chrono::Utc;
use rusqlite::{params, OptionalExtension, Row};

use crate::domain::errors::{MigrationError, Result};
use crate::domain::models::{CompatMode, ConnectionConfig, ConnectionProfile};
use crate::store::{format_ts, parse_ts, Store};
use crate::vault::CredentialVault;

/// Input for creating or updating a profile.
#[derive(Debug, Clone)]
pub struct ProfileSpec {
    pub name: String,
    pub description: String,
    pub source: ConnectionConfig,
    pub target: ConnectionConfig,
    pub compat_mode: CompatMode,
}

impl Store {
    /// Inserts the profile, or updates the existing row with the same name.
    pub fn upsert_profile(
        &self,
        vault: &CredentialVault,
        spec: &ProfileSpec,
    ) -> Result<ConnectionProfile> {
        let source_sealed = seal_config(vault, &spec.source)?;
        let target_sealed = seal_config(vault, &spec.target)?;
        let now = format_ts(Utc::now());

        self.with_tx(|tx| {
            tx.execute(
                "INSERT INTO profiles (name, description, source_config, target_config, compat_mode, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
                 ON CONFLICT(name) DO UPDATE SET
                     description = excluded.description,
                     source_config = excluded.source_config,
                     target_config = excluded.target_config,
                     compat_mode = excluded.compat_mode,
                     updated_at = excluded.updated_at",
                params![
                    spec.name,
                    spec.description,
                    source_sealed,
                    target_sealed,
                    spec.compat_mode.as_str(),
                    now
                ],
            )?;
            Ok(())
        })?;

        self.profile_by_name(vault, &spec.name)?.ok_or_else(|| {
            MigrationError::Store(format!("profile {} vanished after upsert", spec.name))
        })
    }

    pub fn profile_by_name(
        &self,
        vault: &CredentialVault,
        name: &str,
    ) -> Result<Option<ConnectionProfile>> {
        let row = self.with_conn(|c| {
            c.query_row(
                "SELECT id, name, description, source_config, target_config, compat_mode, created_at, updated_at
                 FROM profiles WHERE name = ?1",
                params![name],
                raw_profile,
            )
            .optional()
        })?;
        row.map(|raw| decode_profile(vault, raw)).transpose()
    }

    pub fn profile_by_id(
        &self,
        vault: &CredentialVault,
        id: i64,
    ) -> Result<Option<ConnectionProfile>> {
        let row = self.with_conn(|c| {
            c.query_row(
                "SELECT id, name, description, source_config, target_config, compat_mode, created_at, updated_at
                 FROM profiles WHERE id = ?1",
                params![id],
                raw_profile,
            )
            .optional()
        })?;
        row.map(|raw| decode_profile(vault, raw)).transpose()
    }

    /// Names only, for listings that must not touch the vault.
    pub fn list_profile_names(&self) -> Result<Vec<(i64, String)>> {
        self.with_conn(|c| {
            let mut stmt = c.prepare("SELECT id, name FROM profiles ORDER BY name")?;
            let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
            rows.collect()
        })
    }

    /// Removes a profile; cascades to its runs, checkpoints and logs.
    pub fn delete_profile(&self, id: i64) -> Result<bool> {
        let n = self.with_tx(|tx| tx.execute("DELETE FROM profiles WHERE id = ?1", params![id]))?;
        Ok(n > 0)
    }
}

struct RawProfile {
    id: i64,
    name: String,
    description: String,
    source_sealed: String,
    target_sealed: String,
    compat_mode: String,
    created_at: String,
    updated_at: String,
}

fn raw_profile(row: &Row<'_>) -> rusqlite::Result<RawProfile> {
    Ok(RawProfile {
        id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        source_sealed: row.get(3)?,
        target_sealed: row.get(4)?,
        compat_mode: row.get(5)?,
        created_at: row.get(6)?,
        updated_at: row.get(7)?,
    })
}

fn seal_config(vault: &CredentialVault, config: &ConnectionConfig) -> Result<String> {
    let json = serde_json::to_vec(config)
        .map_err(|e| MigrationError::Store(format!("profile serialization failed: {e}")))?;
    vault.seal(&json)
}

fn open_config(vault: &CredentialVault, sealed: &str) -> Result<ConnectionConfig> {
    let json = vault.open(sealed)?;
    serde_json::from_slice(&json)
        .map_err(|e| MigrationError::Store(format!("profile deserialization failed: {e}")))
}

fn decode_profile(vault: &CredentialVault, raw: RawProfile) -> Result<ConnectionProfile> {
    Ok(ConnectionProfile {
        id: raw.id,
        name: raw.name,
        description: raw.description,
        source: open_config(vault, &raw.source_sealed)?,
        target: open_config(vault, &raw.target_sealed)?,
        compat_mode: CompatMode::parse(&raw.compat_mode).unwrap_or_default(),
        created_at: parse_ts(&raw.created_at)?,
        updated_at: parse_ts(&raw.updated_at)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::SslMode;

    fn test_config(host: &str) -> ConnectionConfig {
        ConnectionConfig {
            host: host.to_string(),
            port: 5432,
            dbname: "scada".to_string(),
            user: "migrator".to_string(),
            password: "pw-secret".to_string(),
            sslmode: SslMode::Prefer,
        }
    }

    fn test_spec(name: &str) -> ProfileSpec {
        ProfileSpec {
            name: name.to_string(),
            description: "legacy site".to_string(),
            source: test_config("src-db"),
            target: test_config("dst-db"),
            compat_mode: CompatMode::V9_3,
        }
    }

    #[test]
    fn test_create_and_fetch() {
        let store = Store::open_in_memory().unwrap();
        let vault = CredentialVault::from_key(&[9u8; 32]);

        let created = store.upsert_profile(&vault, &test_spec("site-a")).unwrap();
        assert!(created.id > 0);

        let fetched = store.profile_by_name(&vault, "site-a").unwrap().unwrap();
        assert_eq!(fetched.source.password, "pw-secret");
        assert_eq!(fetched.compat_mode, CompatMode::V9_3);
        assert_eq!(fetched.id, created.id);
    }

    #[test]
    fn test_credentials_encrypted_at_rest() {
        let store = Store::open_in_memory().unwrap();
        let vault = CredentialVault::from_key(&[9u8; 32]);
        store.upsert_profile(&vault, &test_spec("site-a")).unwrap();

        let sealed: String = store
            .with_conn(|c| {
                c.query_row("SELECT source_config FROM profiles", [], |row| row.get(0))
            })
            .unwrap();
        assert!(!sealed.contains("pw-secret"));
        assert!(!sealed.contains("src-db"));
    }

    #[test]
    fn test_upsert_updates_in_place() {
        let store = Store::open_in_memory().unwrap();
        let vault = CredentialVault::from_key(&[9u8; 32]);

        let first = store.upsert_profile(&vault, &test_spec("site-a")).unwrap();
        let mut changed = test_spec("site-a");
        changed.source.host = "src-db-2".to_string();
        let second = store.upsert_profile(&vault, &changed).unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(second.source.host, "src-db-2");
        assert_eq!(store.list_profile_names().unwrap().len(), 1);
    }

    #[test]
    fn test_delete_missing_returns_false() {
        let store = Store::open_in_memory().unwrap();
        assert!(!store.delete_profile(42).unwrap());
    }
}
