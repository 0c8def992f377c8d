//! Resumption record persistence.
//!
//! One JSON-encoded [`SessionConfig`] per local identifier, so an application
//! restart can `rejoin` its member slot. Corrupt records are deleted and the
//! load fails rather than resuming with bad data.

use crate::session::SessionConfig;
use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::warn;

/// Key-value store for resumption records
pub trait ConfigStore: Send + Sync {
    /// Inserts or replaces the record for `config.local_id`.
    fn save(&self, config: &SessionConfig) -> Result<()>;

    /// Returns `Ok(None)` when nothing is stored for `local_id`.
    fn load(&self, local_id: &str) -> Result<Option<SessionConfig>>;

    /// Deletes the record. Returns Ok(()) whether or not the row exists.
    fn delete(&self, local_id: &str) -> Result<()>;
}

/// Persists resumption records in SQLite.
pub struct SqliteConfigStore {
    conn: Mutex<Connection>,
}

impl SqliteConfigStore {
    /// Opens (or creates) the SQLite database and ensures the table exists.
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let path = db_path.as_ref();
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open session DB at {}", path.display()))?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.create_table()?;
        Ok(store)
    }

    /// Store that lives only as long as the process
    pub fn in_memory() -> Result<Self> {
        Self::new(":memory:")
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("Session DB connection mutex poisoned"))
    }

    fn create_table(&self) -> Result<()> {
        let conn = self.conn()?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS session_records (
                local_id   TEXT PRIMARY KEY,
                record     TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );",
        )
        .context("Failed to create session_records table")?;
        Ok(())
    }

    /// Stores raw record text. Used to exercise corrupt-record handling.
    #[cfg(test)]
    fn save_raw(&self, local_id: &str, record: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO session_records (local_id, record, updated_at)
             VALUES (?1, ?2, ?3)",
            params![local_id, record, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }
}

impl ConfigStore for SqliteConfigStore {
    fn save(&self, config: &SessionConfig) -> Result<()> {
        let record =
            serde_json::to_string(config).context("Failed to serialize session record")?;
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO session_records (local_id, record, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(local_id) DO UPDATE SET
                record = excluded.record,
                updated_at = excluded.updated_at",
            params![config.local_id, record, Utc::now().to_rfc3339()],
        )
        .context("Failed to save session record")?;
        Ok(())
    }

    fn load(&self, local_id: &str) -> Result<Option<SessionConfig>> {
        let record: Option<String> = {
            let conn = self.conn()?;
            conn.query_row(
                "SELECT record FROM session_records WHERE local_id = ?1",
                params![local_id],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to query session record")?
        };

        let Some(record) = record else {
            return Ok(None);
        };

        match serde_json::from_str::<SessionConfig>(&record) {
            Ok(config) => Ok(Some(config)),
            Err(e) => {
                warn!(local_id = %local_id, error = %e, "Deleting corrupt session record");
                self.delete(local_id)?;
                Err(anyhow::Error::new(e)
                    .context(format!("Corrupt session record for '{}' was deleted", local_id)))
            }
        }
    }

    fn delete(&self, local_id: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "DELETE FROM session_records WHERE local_id = ?1",
            params![local_id],
        )
        .context("Failed to delete session record")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn in_memory_store() -> SqliteConfigStore {
        SqliteConfigStore::in_memory().expect("in-memory store failed")
    }

    #[test]
    fn test_save_and_load() {
        let store = in_memory_store();
        let mut config = SessionConfig::random("p1", "duel", 2);
        config.member_id = Some("m1".to_string());

        store.save(&config).expect("save failed");

        let loaded = store.load("p1").expect("load failed").expect("record missing");
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_load_missing_is_none() {
        let store = in_memory_store();
        assert!(store.load("nobody").expect("load failed").is_none());
    }

    #[test]
    fn test_save_overwrites() {
        let store = in_memory_store();
        let mut config = SessionConfig::random("p1", "duel", 2);
        store.save(&config).unwrap();

        config.session_id = Some("S1".to_string());
        config.session_started = true;
        store.save(&config).unwrap();

        let loaded = store.load("p1").unwrap().unwrap();
        assert_eq!(loaded.session_id.as_deref(), Some("S1"));
        assert!(loaded.session_started);
    }

    #[test]
    fn test_delete() {
        let store = in_memory_store();
        store.save(&SessionConfig::random("p1", "duel", 2)).unwrap();

        store.delete("p1").expect("delete failed");
        assert!(store.load("p1").unwrap().is_none());

        // Deleting again is not an error
        store.delete("p1").expect("second delete failed");
    }

    #[test]
    fn test_corrupt_record_is_deleted_and_fails() {
        let store = in_memory_store();
        store.save_raw("p1", "{not json").unwrap();

        let err = store.load("p1").expect_err("corrupt record must fail");
        assert!(err.to_string().contains("Corrupt session record"));

        // Record is gone afterwards
        assert!(store.load("p1").unwrap().is_none());
    }

    #[test]
    fn test_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sessions.db");

        {
            let store = SqliteConfigStore::new(&path).unwrap();
            store.save(&SessionConfig::host_private("p1", "duel", 4)).unwrap();
        }

        let store = SqliteConfigStore::new(&path).unwrap();
        let loaded = store.load("p1").unwrap().unwrap();
        assert!(loaded.is_private);
        assert_eq!(loaded.num_members, 4);
    }
}
