use super::types::{AppliedState, ProcessStatus, ServiceLogRow, ServiceProcess};
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use fs2::FileExt;
use rusqlite::OptionalExtension;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use tokio_rusqlite::Connection;
use tracing::{debug, warn};

const LOCK_FILE_NAME: &str = ".lock";

/// SQLite-backed durable store for applied state, service process rows and
/// service logs.
///
/// Opened in WAL mode for crash recovery. A best-effort advisory file lock
/// (`<data_dir>/.lock`) guards against two agents sharing one data directory;
/// losing the lock logs a warning rather than failing, so read-only CLI
/// commands (`status`, `logs`) work while the daemon runs.
pub struct StateStore {
    conn: Connection,
    /// Held for the lifetime of the store; released on drop.
    #[allow(dead_code)]
    lock_file: Option<std::fs::File>,
}

impl StateStore {
    /// Open (or create) the state database and run schema migration.
    pub async fn open(db_path: &Path) -> Result<Self> {
        let dir = db_path
            .parent()
            .ok_or_else(|| Error::Filesystem(format!("state db path {:?} has no parent", db_path)))?;
        std::fs::create_dir_all(dir)?;

        let lock_file = Self::try_acquire_lock(&dir.join(LOCK_FILE_NAME));

        let conn = Connection::open(db_path).await?;
        conn.call(|conn: &mut rusqlite::Connection| {
            conn.pragma_update(None, "journal_mode", "WAL")?;
            conn.pragma_update(None, "synchronous", "NORMAL")?;
            conn.pragma_update(None, "busy_timeout", 5000)?;
            Ok(())
        })
        .await?;

        let store = Self { conn, lock_file };
        store.migrate().await?;
        Ok(store)
    }

    /// Ephemeral in-memory store for tests.
    pub async fn open_in_memory() -> Result<Self> {
        let conn = Connection::open(":memory:").await?;
        let store = Self {
            conn,
            lock_file: None,
        };
        store.migrate().await?;
        Ok(store)
    }

    /// Best-effort exclusive advisory lock; `None` when another process holds it.
    fn try_acquire_lock(lock_path: &Path) -> Option<std::fs::File> {
        let mut file = match OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(lock_path)
        {
            Ok(f) => f,
            Err(e) => {
                debug!("Could not open lock file {:?}: {}", lock_path, e);
                return None;
            }
        };

        match FileExt::try_lock_exclusive(&file) {
            Ok(()) => {
                let _ = file.set_len(0);
                let _ = writeln!(file, "{}", std::process::id());
                debug!("Acquired advisory lock on {:?}", lock_path);
                Some(file)
            }
            Err(_) => {
                warn!(
                    "Another agent may be using this data directory ({:?} is locked); \
                     proceeding without exclusive lock",
                    lock_path
                );
                None
            }
        }
    }

    /// Create tables if absent, then additively add any newly required
    /// columns. Idempotent; safe to run on every startup.
    async fn migrate(&self) -> Result<()> {
        self.conn
            .call(|conn: &mut rusqlite::Connection| {
                conn.execute_batch(
                    r#"
                    CREATE TABLE IF NOT EXISTS applied_state (
                        id INTEGER PRIMARY KEY CHECK (id = 1),
                        stack_version INTEGER NOT NULL,
                        state_hash TEXT NOT NULL,
                        applied_at TEXT
                    );

                    CREATE TABLE IF NOT EXISTS service_processes (
                        service_id TEXT PRIMARY KEY,
                        service_name TEXT NOT NULL,
                        git_commit TEXT NOT NULL DEFAULT '',
                        status TEXT NOT NULL DEFAULT 'stopped',
                        restart_count INTEGER NOT NULL DEFAULT 0,
                        last_error TEXT,
                        started_at TEXT,
                        updated_at TEXT
                    );

                    CREATE TABLE IF NOT EXISTS service_logs (
                        id INTEGER PRIMARY KEY AUTOINCREMENT,
                        service_id TEXT NOT NULL,
                        level TEXT NOT NULL,
                        message TEXT NOT NULL,
                        created_at TEXT DEFAULT (datetime('now'))
                    );

                    CREATE INDEX IF NOT EXISTS idx_service_logs_service_id
                        ON service_logs(service_id);
                    "#,
                )?;

                // Columns added after the initial schema ship as additive
                // migrations keyed off PRAGMA table_info.
                let wanted: &[(&str, &str)] = &[
                    ("container_id", "TEXT"),
                    ("container_name", "TEXT"),
                    ("image_tag", "TEXT"),
                    ("blue_port", "INTEGER"),
                    ("green_port", "INTEGER"),
                    ("active_port", "INTEGER"),
                ];

                let mut existing = Vec::new();
                {
                    let mut stmt = conn.prepare("PRAGMA table_info(service_processes)")?;
                    let names = stmt.query_map([], |row| row.get::<_, String>(1))?;
                    for name in names {
                        existing.push(name?);
                    }
                }

                for (name, definition) in wanted {
                    if existing.iter().any(|c| c == name) {
                        continue;
                    }
                    conn.execute(
                        &format!(
                            "ALTER TABLE service_processes ADD COLUMN {} {}",
                            name, definition
                        ),
                        [],
                    )?;
                }

                Ok(())
            })
            .await
            .map_err(Error::from)
    }

    // ========================================================================
    // Applied state
    // ========================================================================

    pub async fn get_applied_state(&self) -> Result<Option<AppliedState>> {
        self.conn
            .call(|conn: &mut rusqlite::Connection| {
                let row = conn
                    .query_row(
                        "SELECT stack_version, state_hash, applied_at FROM applied_state WHERE id = 1",
                        [],
                        |row| {
                            let version: u64 = row.get(0)?;
                            let hash: String = row.get(1)?;
                            let applied_at: Option<String> = row.get(2)?;
                            Ok(AppliedState {
                                stack_version: version,
                                state_hash: hash,
                                applied_at: applied_at.as_deref().and_then(parse_timestamp),
                            })
                        },
                    )
                    .optional()?;
                Ok(row)
            })
            .await
            .map_err(Error::from)
    }

    pub async fn set_applied_state(&self, version: u64, hash: &str) -> Result<()> {
        let hash = hash.to_string();
        let now = Utc::now().to_rfc3339();
        self.conn
            .call(move |conn: &mut rusqlite::Connection| {
                conn.execute(
                    "INSERT INTO applied_state (id, stack_version, state_hash, applied_at)
                     VALUES (1, ?1, ?2, ?3)
                     ON CONFLICT(id) DO UPDATE SET
                         stack_version = excluded.stack_version,
                         state_hash = excluded.state_hash,
                         applied_at = excluded.applied_at",
                    rusqlite::params![version, hash, now],
                )?;
                Ok(())
            })
            .await
            .map_err(Error::from)
    }

    // ========================================================================
    // Service processes
    // ========================================================================

    pub async fn get_service_process(&self, service_id: &str) -> Result<Option<ServiceProcess>> {
        let service_id = service_id.to_string();
        self.conn
            .call(move |conn: &mut rusqlite::Connection| {
                let row = conn
                    .query_row(
                        &format!("{} WHERE service_id = ?1", SELECT_PROCESS),
                        rusqlite::params![service_id],
                        row_to_process,
                    )
                    .optional()?;
                Ok(row)
            })
            .await
            .map_err(Error::from)
    }

    pub async fn list_service_processes(&self) -> Result<Vec<ServiceProcess>> {
        self.conn
            .call(|conn: &mut rusqlite::Connection| {
                let mut stmt =
                    conn.prepare(&format!("{} ORDER BY service_id", SELECT_PROCESS))?;
                let rows = stmt.query_map([], row_to_process)?;
                let mut processes = Vec::new();
                for row in rows {
                    processes.push(row?);
                }
                Ok(processes)
            })
            .await
            .map_err(Error::from)
    }

    pub async fn save_service_process(&self, process: &ServiceProcess) -> Result<()> {
        let p = process.clone();
        let now = Utc::now().to_rfc3339();
        self.conn
            .call(move |conn: &mut rusqlite::Connection| {
                conn.execute(
                    "INSERT INTO service_processes (
                         service_id, service_name, git_commit, container_id, container_name,
                         image_tag, status, restart_count, last_error,
                         blue_port, green_port, active_port, started_at, updated_at
                     ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
                     ON CONFLICT(service_id) DO UPDATE SET
                         service_name = excluded.service_name,
                         git_commit = excluded.git_commit,
                         container_id = excluded.container_id,
                         container_name = excluded.container_name,
                         image_tag = excluded.image_tag,
                         status = excluded.status,
                         restart_count = excluded.restart_count,
                         last_error = excluded.last_error,
                         blue_port = excluded.blue_port,
                         green_port = excluded.green_port,
                         active_port = excluded.active_port,
                         started_at = excluded.started_at,
                         updated_at = excluded.updated_at",
                    rusqlite::params![
                        p.service_id,
                        p.service_name,
                        p.git_commit,
                        p.container_id,
                        p.container_name,
                        p.image_tag,
                        p.status.to_string(),
                        p.restart_count,
                        p.last_error,
                        p.blue_port,
                        p.green_port,
                        p.active_port,
                        p.started_at.map(|t| t.to_rfc3339()),
                        now,
                    ],
                )?;
                Ok(())
            })
            .await
            .map_err(Error::from)
    }

    pub async fn delete_service_process(&self, service_id: &str) -> Result<()> {
        let service_id = service_id.to_string();
        self.conn
            .call(move |conn: &mut rusqlite::Connection| {
                conn.execute(
                    "DELETE FROM service_processes WHERE service_id = ?1",
                    rusqlite::params![service_id],
                )?;
                conn.execute(
                    "DELETE FROM service_logs WHERE service_id = ?1",
                    rusqlite::params![service_id],
                )?;
                Ok(())
            })
            .await
            .map_err(Error::from)
    }

    // ========================================================================
    // Service logs
    // ========================================================================

    pub async fn log(&self, service_id: &str, level: &str, message: &str) -> Result<()> {
        let (service_id, level, message) = (
            service_id.to_string(),
            level.to_string(),
            message.to_string(),
        );
        let now = Utc::now().to_rfc3339();
        self.conn
            .call(move |conn: &mut rusqlite::Connection| {
                conn.execute(
                    "INSERT INTO service_logs (service_id, level, message, created_at)
                     VALUES (?1, ?2, ?3, ?4)",
                    rusqlite::params![service_id, level, message, now],
                )?;
                Ok(())
            })
            .await
            .map_err(Error::from)
    }

    /// Newest rows first, at most `limit`.
    pub async fn get_logs(&self, service_id: &str, limit: u32) -> Result<Vec<ServiceLogRow>> {
        let service_id = service_id.to_string();
        self.conn
            .call(move |conn: &mut rusqlite::Connection| {
                let mut stmt = conn.prepare(
                    "SELECT id, service_id, level, message, created_at FROM service_logs
                     WHERE service_id = ?1 ORDER BY id DESC LIMIT ?2",
                )?;
                let rows = stmt.query_map(rusqlite::params![service_id, limit], row_to_log)?;
                let mut logs = Vec::new();
                for row in rows {
                    logs.push(row?);
                }
                Ok(logs)
            })
            .await
            .map_err(Error::from)
    }

    /// Rows with `id > after_id`, ascending; the tail-follow primitive.
    pub async fn stream_logs(&self, service_id: &str, after_id: i64) -> Result<Vec<ServiceLogRow>> {
        let service_id = service_id.to_string();
        self.conn
            .call(move |conn: &mut rusqlite::Connection| {
                let mut stmt = conn.prepare(
                    "SELECT id, service_id, level, message, created_at FROM service_logs
                     WHERE service_id = ?1 AND id > ?2 ORDER BY id ASC",
                )?;
                let rows = stmt.query_map(rusqlite::params![service_id, after_id], row_to_log)?;
                let mut logs = Vec::new();
                for row in rows {
                    logs.push(row?);
                }
                Ok(logs)
            })
            .await
            .map_err(Error::from)
    }

    /// Keep only the `keep` newest rows for a service.
    pub async fn prune_logs(&self, service_id: &str, keep: u32) -> Result<()> {
        let service_id = service_id.to_string();
        self.conn
            .call(move |conn: &mut rusqlite::Connection| {
                conn.execute(
                    "DELETE FROM service_logs
                     WHERE service_id = ?1 AND id NOT IN (
                         SELECT id FROM service_logs WHERE service_id = ?1
                         ORDER BY id DESC LIMIT ?2
                     )",
                    rusqlite::params![service_id, keep],
                )?;
                Ok(())
            })
            .await
            .map_err(Error::from)
    }
}

const SELECT_PROCESS: &str = "SELECT service_id, service_name, git_commit, container_id, \
     container_name, image_tag, status, restart_count, last_error, blue_port, green_port, \
     active_port, started_at, updated_at FROM service_processes";

fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

fn row_to_process(row: &rusqlite::Row<'_>) -> rusqlite::Result<ServiceProcess> {
    let status_str: String = row.get(6)?;
    let started_at: Option<String> = row.get(12)?;
    let updated_at: Option<String> = row.get(13)?;
    Ok(ServiceProcess {
        service_id: row.get(0)?,
        service_name: row.get(1)?,
        git_commit: row.get(2)?,
        container_id: row.get(3)?,
        container_name: row.get(4)?,
        image_tag: row.get(5)?,
        status: status_str.parse().unwrap_or(ProcessStatus::Stopped),
        restart_count: row.get(7)?,
        last_error: row.get(8)?,
        blue_port: row.get(9)?,
        green_port: row.get(10)?,
        active_port: row.get(11)?,
        started_at: started_at.as_deref().and_then(parse_timestamp),
        updated_at: updated_at.as_deref().and_then(parse_timestamp),
    })
}

fn row_to_log(row: &rusqlite::Row<'_>) -> rusqlite::Result<ServiceLogRow> {
    let created_at: Option<String> = row.get(4)?;
    Ok(ServiceLogRow {
        id: row.get(0)?,
        service_id: row.get(1)?,
        level: row.get(2)?,
        message: row.get(3)?,
        created_at: created_at.as_deref().and_then(parse_timestamp),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn applied_state_round_trip() {
        let store = StateStore::open_in_memory().await.unwrap();
        assert!(store.get_applied_state().await.unwrap().is_none());

        store.set_applied_state(7, "abc123").await.unwrap();
        let applied = store.get_applied_state().await.unwrap().unwrap();
        assert_eq!(applied.stack_version, 7);
        assert_eq!(applied.state_hash, "abc123");
        assert!(applied.applied_at.is_some());

        // Singleton row: a second write replaces, not appends.
        store.set_applied_state(8, "def456").await.unwrap();
        let applied = store.get_applied_state().await.unwrap().unwrap();
        assert_eq!(applied.stack_version, 8);
        assert_eq!(applied.state_hash, "def456");
    }

    #[tokio::test]
    async fn service_process_round_trip() {
        let store = StateStore::open_in_memory().await.unwrap();

        let mut process = ServiceProcess::new("svc-1", "api");
        process.git_commit = "deadbeef".to_string();
        process.status = ProcessStatus::Running;
        process.blue_port = Some(3000);
        process.green_port = Some(3001);
        process.active_port = Some(3000);
        process.container_name = Some("buildvigil-svc-1".to_string());
        process.started_at = Some(Utc::now());
        store.save_service_process(&process).await.unwrap();

        let loaded = store.get_service_process("svc-1").await.unwrap().unwrap();
        assert_eq!(loaded.service_name, "api");
        assert_eq!(loaded.git_commit, "deadbeef");
        assert_eq!(loaded.status, ProcessStatus::Running);
        assert_eq!(loaded.blue_port, Some(3000));
        assert_eq!(loaded.green_port, Some(3001));
        assert_eq!(loaded.active_port, Some(3000));
        assert!(loaded.updated_at.is_some());

        store.delete_service_process("svc-1").await.unwrap();
        assert!(store.get_service_process("svc-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn logs_stream_and_prune() {
        let store = StateStore::open_in_memory().await.unwrap();
        for i in 0..10 {
            store
                .log("svc-1", "info", &format!("line {}", i))
                .await
                .unwrap();
        }
        store.log("svc-2", "error", "other service").await.unwrap();

        let newest = store.get_logs("svc-1", 3).await.unwrap();
        assert_eq!(newest.len(), 3);
        assert_eq!(newest[0].message, "line 9");

        let all = store.stream_logs("svc-1", 0).await.unwrap();
        assert_eq!(all.len(), 10);
        let after = store.stream_logs("svc-1", all[7].id).await.unwrap();
        assert_eq!(after.len(), 2);
        assert_eq!(after[0].message, "line 8");

        store.prune_logs("svc-1", 4).await.unwrap();
        let remaining = store.stream_logs("svc-1", 0).await.unwrap();
        assert_eq!(remaining.len(), 4);
        assert_eq!(remaining[0].message, "line 6");
        // Other services are untouched by pruning.
        assert_eq!(store.get_logs("svc-2", 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn deleting_a_service_drops_its_logs() {
        let store = StateStore::open_in_memory().await.unwrap();
        let process = ServiceProcess::new("svc-1", "api");
        store.save_service_process(&process).await.unwrap();
        store.log("svc-1", "info", "hello").await.unwrap();

        store.delete_service_process("svc-1").await.unwrap();
        assert!(store.get_logs("svc-1", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn migration_is_idempotent_on_existing_database() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("state.db");
        {
            let store = StateStore::open(&db_path).await.unwrap();
            store.set_applied_state(1, "h1").await.unwrap();
        }
        // Reopening runs migrate() again over the existing schema.
        let store = StateStore::open(&db_path).await.unwrap();
        let applied = store.get_applied_state().await.unwrap().unwrap();
        assert_eq!(applied.state_hash, "h1");
    }

    #[tokio::test]
    async fn port_columns_are_added_to_old_databases() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("state.db");
        {
            // Simulate a database created before the port columns existed.
            let conn = rusqlite::Connection::open(&db_path).unwrap();
            conn.execute_batch(
                "CREATE TABLE service_processes (
                     service_id TEXT PRIMARY KEY,
                     service_name TEXT NOT NULL,
                     git_commit TEXT NOT NULL DEFAULT '',
                     status TEXT NOT NULL DEFAULT 'stopped',
                     restart_count INTEGER NOT NULL DEFAULT 0,
                     last_error TEXT,
                     started_at TEXT,
                     updated_at TEXT
                 );
                 INSERT INTO service_processes (service_id, service_name) VALUES ('svc-1', 'api');",
            )
            .unwrap();
        }

        let store = StateStore::open(&db_path).await.unwrap();
        let loaded = store.get_service_process("svc-1").await.unwrap().unwrap();
        assert_eq!(loaded.blue_port, None);

        let mut updated = loaded;
        updated.blue_port = Some(3000);
        updated.green_port = Some(3001);
        store.save_service_process(&updated).await.unwrap();
        let reloaded = store.get_service_process("svc-1").await.unwrap().unwrap();
        assert_eq!(reloaded.blue_port, Some(3000));
    }
}
