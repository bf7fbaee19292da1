//! SQLite persistence for registrations and workers.
//!
//! Two tables back the lifecycle layer: `registrations` holds the scope and
//! the four worker slots as nullable foreign keys, `workers` holds each
//! worker's script URL, install state and skip-waiting flag. Slot moves that
//! touch multiple rows run inside a transaction so a crash never leaves a
//! worker in two slots.

use std::path::Path;
use std::time::Duration;

use r2d2::{CustomizeConnection, Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("sqlite failure: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("connection pool failure: {0}")]
    Pool(#[from] r2d2::Error),
    #[error("failed to prepare data directory: {0}")]
    DataDir(#[from] std::io::Error),
}

#[derive(Debug, Clone)]
pub struct RegistrationRow {
    pub registration_id: String,
    pub scope: String,
    pub active: Option<String>,
    pub waiting: Option<String>,
    pub installing: Option<String>,
    pub redundant: Option<String>,
}

#[derive(Debug, Clone)]
pub struct WorkerRow {
    pub worker_id: String,
    pub registration_id: String,
    pub url: String,
    pub install_state: String,
    pub skip_waiting: bool,
}

#[derive(Debug, Clone, Copy)]
struct SqliteCustomizer;

impl CustomizeConnection<Connection, rusqlite::Error> for SqliteCustomizer {
    fn on_acquire(&self, conn: &mut Connection) -> Result<(), rusqlite::Error> {
        conn.busy_timeout(Duration::from_secs(1))?;
        Ok(())
    }
}

/// Pooled handle onto the core database.
#[derive(Clone)]
pub struct CoreStorage {
    pool: Pool<SqliteConnectionManager>,
}

impl CoreStorage {
    pub fn open(path: &Path) -> Result<Self, StorageError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let manager = SqliteConnectionManager::file(path);
        let pool = Pool::builder()
            .max_size(4)
            .connection_customizer(Box::new(SqliteCustomizer))
            .build(manager)?;
        let storage = CoreStorage { pool };
        storage.initialise_schema()?;
        debug!(target: "storage", path = %path.display(), "opened core database");
        Ok(storage)
    }

    /// In-memory database shared across the pool, for hosts that do not want
    /// registrations to outlive the process.
    pub fn open_in_memory() -> Result<Self, StorageError> {
        let manager = SqliteConnectionManager::file("file:breakwater-core?mode=memory&cache=shared")
            .with_flags(
                rusqlite::OpenFlags::SQLITE_OPEN_URI
                    | rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE
                    | rusqlite::OpenFlags::SQLITE_OPEN_CREATE,
            );
        let pool = Pool::builder()
            .max_size(4)
            .connection_customizer(Box::new(SqliteCustomizer))
            .build(manager)?;
        let storage = CoreStorage { pool };
        storage.initialise_schema()?;
        Ok(storage)
    }

    fn conn(&self) -> Result<PooledConnection<SqliteConnectionManager>, StorageError> {
        Ok(self.pool.get()?)
    }

    fn initialise_schema(&self) -> Result<(), StorageError> {
        let conn = self.conn()?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             CREATE TABLE IF NOT EXISTS registrations (
                 registration_id TEXT PRIMARY KEY,
                 scope TEXT NOT NULL,
                 active TEXT,
                 waiting TEXT,
                 installing TEXT,
                 redundant TEXT
             );
             CREATE TABLE IF NOT EXISTS workers (
                 worker_id TEXT PRIMARY KEY,
                 registration_id TEXT NOT NULL,
                 url TEXT NOT NULL,
                 install_state TEXT NOT NULL,
                 skip_waiting INTEGER NOT NULL DEFAULT 0
             );
             CREATE INDEX IF NOT EXISTS idx_registrations_scope ON registrations(scope);",
        )?;
        Ok(())
    }

    // --- registrations ---

    pub fn insert_registration(&self, registration_id: &str, scope: &str) -> Result<(), StorageError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO registrations (registration_id, scope) VALUES (?1, ?2)",
            params![registration_id, scope],
        )?;
        Ok(())
    }

    pub fn load_registration(&self, registration_id: &str) -> Result<Option<RegistrationRow>, StorageError> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                "SELECT registration_id, scope, active, waiting, installing, redundant
                 FROM registrations WHERE registration_id = ?1",
                params![registration_id],
                Self::registration_from_row,
            )
            .optional()?;
        Ok(row)
    }

    pub fn find_registration_by_scope(&self, scope: &str) -> Result<Option<String>, StorageError> {
        let conn = self.conn()?;
        let id = conn
            .query_row(
                "SELECT registration_id FROM registrations WHERE scope = ?1",
                params![scope],
                |row| row.get(0),
            )
            .optional()?;
        Ok(id)
    }

    /// Registration whose scope is the longest prefix of the page URL.
    pub fn find_registration_for_page(&self, page_url: &str) -> Result<Option<String>, StorageError> {
        let conn = self.conn()?;
        let id = conn
            .query_row(
                "SELECT registration_id FROM registrations
                 WHERE substr(?1, 1, length(scope)) = scope
                 ORDER BY length(scope) DESC LIMIT 1",
                params![page_url],
                |row| row.get(0),
            )
            .optional()?;
        Ok(id)
    }

    pub fn registration_ids_with_scope_prefix(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let conn = self.conn()?;
        let mut statement = conn.prepare(
            "SELECT registration_id FROM registrations WHERE substr(scope, 1, length(?1)) = ?1 ORDER BY scope",
        )?;
        let ids = statement
            .query_map(params![prefix], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(ids)
    }

    /// Like [`find_registration_for_page`](Self::find_registration_for_page)
    /// but only considers registrations whose active slot holds a fully
    /// activated worker.
    pub fn ready_registration_id(&self, page_url: &str) -> Result<Option<String>, StorageError> {
        let conn = self.conn()?;
        let id = conn
            .query_row(
                "SELECT r.registration_id FROM registrations AS r
                 INNER JOIN workers AS w ON r.active = w.worker_id
                 WHERE substr(?1, 1, length(r.scope)) = r.scope AND w.install_state = 'activated'
                 ORDER BY length(r.scope) DESC LIMIT 1",
                params![page_url],
                |row| row.get(0),
            )
            .optional()?;
        Ok(id)
    }

    pub fn delete_registration(&self, registration_id: &str) -> Result<(), StorageError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM workers WHERE registration_id = ?1",
            params![registration_id],
        )?;
        tx.execute(
            "DELETE FROM registrations WHERE registration_id = ?1",
            params![registration_id],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Point a registration slot at a worker (or clear it). When a different
    /// worker is displaced, it moves to the redundant slot and its install
    /// state flips in the same transaction.
    pub fn move_worker_into_slot(
        &self,
        registration_id: &str,
        slot_column: &'static str,
        worker_id: Option<&str>,
        demote_worker_id: Option<&str>,
        delete_worker_id: Option<&str>,
    ) -> Result<(), StorageError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute(
            &format!("UPDATE registrations SET {slot_column} = ?1 WHERE registration_id = ?2"),
            params![worker_id, registration_id],
        )?;
        if let Some(demoted) = demote_worker_id {
            tx.execute(
                "UPDATE registrations SET redundant = ?1 WHERE registration_id = ?2",
                params![demoted, registration_id],
            )?;
            tx.execute(
                "UPDATE workers SET install_state = 'redundant' WHERE worker_id = ?1",
                params![demoted],
            )?;
        }
        if let Some(deleted) = delete_worker_id {
            tx.execute("DELETE FROM workers WHERE worker_id = ?1", params![deleted])?;
        }
        tx.commit()?;
        Ok(())
    }

    // --- workers ---

    pub fn insert_worker(&self, row: &WorkerRow) -> Result<(), StorageError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO workers (worker_id, registration_id, url, install_state, skip_waiting)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                row.worker_id,
                row.registration_id,
                row.url,
                row.install_state,
                row.skip_waiting as i64
            ],
        )?;
        Ok(())
    }

    pub fn load_worker(&self, worker_id: &str) -> Result<Option<WorkerRow>, StorageError> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                "SELECT worker_id, registration_id, url, install_state, skip_waiting
                 FROM workers WHERE worker_id = ?1",
                params![worker_id],
                |row| {
                    Ok(WorkerRow {
                        worker_id: row.get(0)?,
                        registration_id: row.get(1)?,
                        url: row.get(2)?,
                        install_state: row.get(3)?,
                        skip_waiting: row.get::<_, i64>(4)? != 0,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    pub fn update_worker_state(&self, worker_id: &str, install_state: &str) -> Result<(), StorageError> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE workers SET install_state = ?1 WHERE worker_id = ?2",
            params![install_state, worker_id],
        )?;
        Ok(())
    }

    pub fn update_worker_skip_waiting(&self, worker_id: &str, skip_waiting: bool) -> Result<(), StorageError> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE workers SET skip_waiting = ?1 WHERE worker_id = ?2",
            params![skip_waiting as i64, worker_id],
        )?;
        Ok(())
    }

    pub fn delete_worker(&self, worker_id: &str) -> Result<(), StorageError> {
        let conn = self.conn()?;
        conn.execute("DELETE FROM workers WHERE worker_id = ?1", params![worker_id])?;
        Ok(())
    }

    fn registration_from_row(row: &rusqlite::Row<'_>) -> Result<RegistrationRow, rusqlite::Error> {
        Ok(RegistrationRow {
            registration_id: row.get(0)?,
            scope: row.get(1)?,
            active: row.get(2)?,
            waiting: row.get(3)?,
            installing: row.get(4)?,
            redundant: row.get(5)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn temp_storage() -> (TempDir, CoreStorage) {
        let dir = TempDir::new().unwrap();
        let storage = CoreStorage::open(&dir.path().join("core.sqlite")).unwrap();
        (dir, storage)
    }

    #[test]
    fn registration_round_trips() {
        let (_dir, storage) = temp_storage();
        storage
            .insert_registration("reg-1", "https://example.com/app/")
            .unwrap();
        let row = storage.load_registration("reg-1").unwrap().unwrap();
        assert_eq!(row.scope, "https://example.com/app/");
        assert!(row.active.is_none());
    }

    #[test]
    fn longest_scope_prefix_wins() {
        let (_dir, storage) = temp_storage();
        storage
            .insert_registration("shallow", "https://example.com/")
            .unwrap();
        storage
            .insert_registration("deep", "https://example.com/app/")
            .unwrap();
        let found = storage
            .find_registration_for_page("https://example.com/app/page.html")
            .unwrap();
        assert_eq!(found.as_deref(), Some("deep"));
        let found = storage
            .find_registration_for_page("https://example.com/other.html")
            .unwrap();
        assert_eq!(found.as_deref(), Some("shallow"));
        let found = storage
            .find_registration_for_page("https://elsewhere.com/app/")
            .unwrap();
        assert_eq!(found, None);
    }

    #[test]
    fn scope_prefixes_match_literally_not_as_patterns() {
        let (_dir, storage) = temp_storage();
        storage
            .insert_registration("underscored", "https://example.com/my_app/")
            .unwrap();
        storage
            .insert_registration("encoded", "https://example.com/a%20b/")
            .unwrap();

        let found = storage
            .find_registration_for_page("https://example.com/myXapp/page.html")
            .unwrap();
        assert_eq!(found, None);
        let found = storage
            .find_registration_for_page("https://example.com/my_app/page.html")
            .unwrap();
        assert_eq!(found.as_deref(), Some("underscored"));
        let found = storage
            .find_registration_for_page("https://example.com/aX20b/index.html")
            .unwrap();
        assert_eq!(found, None);

        let ids = storage
            .registration_ids_with_scope_prefix("https://example.com/my_")
            .unwrap();
        assert_eq!(ids, vec!["underscored".to_string()]);
    }

    #[test]
    fn ready_requires_an_activated_active_worker() {
        let (_dir, storage) = temp_storage();
        storage
            .insert_registration("reg-1", "https://example.com/app/")
            .unwrap();
        let page = "https://example.com/app/index.html";
        assert!(storage.ready_registration_id(page).unwrap().is_none());

        storage
            .insert_worker(&WorkerRow {
                worker_id: "w-1".into(),
                registration_id: "reg-1".into(),
                url: "https://example.com/app/sw.js".into(),
                install_state: "activating".into(),
                skip_waiting: false,
            })
            .unwrap();
        storage
            .move_worker_into_slot("reg-1", "active", Some("w-1"), None, None)
            .unwrap();
        assert!(storage.ready_registration_id(page).unwrap().is_none());

        storage.update_worker_state("w-1", "activated").unwrap();
        assert_eq!(storage.ready_registration_id(page).unwrap().as_deref(), Some("reg-1"));
    }

    #[test]
    fn slot_move_demotes_the_displaced_worker() {
        let (_dir, storage) = temp_storage();
        storage
            .insert_registration("reg-1", "https://example.com/")
            .unwrap();
        for (id, state) in [("old", "activated"), ("new", "activating")] {
            storage
                .insert_worker(&WorkerRow {
                    worker_id: id.into(),
                    registration_id: "reg-1".into(),
                    url: "https://example.com/sw.js".into(),
                    install_state: state.into(),
                    skip_waiting: false,
                })
                .unwrap();
        }
        storage
            .move_worker_into_slot("reg-1", "active", Some("old"), None, None)
            .unwrap();
        storage
            .move_worker_into_slot("reg-1", "active", Some("new"), Some("old"), None)
            .unwrap();

        let reg = storage.load_registration("reg-1").unwrap().unwrap();
        assert_eq!(reg.active.as_deref(), Some("new"));
        assert_eq!(reg.redundant.as_deref(), Some("old"));
        let old = storage.load_worker("old").unwrap().unwrap();
        assert_eq!(old.install_state, "redundant");
    }

    #[test]
    fn slot_move_can_delete_a_worker_row() {
        let (_dir, storage) = temp_storage();
        storage
            .insert_registration("reg-1", "https://example.com/")
            .unwrap();
        storage
            .insert_worker(&WorkerRow {
                worker_id: "doomed".into(),
                registration_id: "reg-1".into(),
                url: "https://example.com/sw.js".into(),
                install_state: "installing".into(),
                skip_waiting: false,
            })
            .unwrap();
        storage
            .move_worker_into_slot("reg-1", "installing", Some("doomed"), None, None)
            .unwrap();
        storage
            .move_worker_into_slot("reg-1", "installing", None, None, Some("doomed"))
            .unwrap();

        let reg = storage.load_registration("reg-1").unwrap().unwrap();
        assert!(reg.installing.is_none());
        assert!(storage.load_worker("doomed").unwrap().is_none());
    }

    #[test]
    fn skip_waiting_flag_persists() {
        let (_dir, storage) = temp_storage();
        storage
            .insert_registration("reg-1", "https://example.com/")
            .unwrap();
        storage
            .insert_worker(&WorkerRow {
                worker_id: "w-1".into(),
                registration_id: "reg-1".into(),
                url: "https://example.com/sw.js".into(),
                install_state: "installing".into(),
                skip_waiting: false,
            })
            .unwrap();
        storage.update_worker_skip_waiting("w-1", true).unwrap();
        assert!(storage.load_worker("w-1").unwrap().unwrap().skip_waiting);
    }
}
