//! SQLite engine for the local store.
//!
//! One connection behind a mutex, WAL journal, and an exclusive lock file so
//! that two agents never share a store.

use crate::entity::{CommandEntity, KeyValueEntity, StateSearchKey};
use crate::error::{DbError, Result};
use crate::lock::{try_lock_exclusive, DbLockGuard};
use crate::Db;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::{debug_span, info, warn};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS kv_entities (
    key TEXT PRIMARY KEY,
    state TEXT NOT NULL,
    value TEXT NOT NULL,
    file_name TEXT
);
CREATE INDEX IF NOT EXISTS ix_kv_entities_state ON kv_entities(state);
CREATE INDEX IF NOT EXISTS ix_kv_entities_file_name ON kv_entities(file_name);

CREATE TABLE IF NOT EXISTS commands (
    id TEXT PRIMARY KEY,
    command_result INTEGER NOT NULL,
    acked INTEGER NOT NULL,
    task_id TEXT NOT NULL,
    version INTEGER NOT NULL,
    delivery_time TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS ix_commands_acked ON commands(acked);
"#;

const KV_COLUMNS: &str = "key, state, value, file_name";
const COMMAND_COLUMNS: &str = "id, command_result, acked, task_id, version, delivery_time";

/// SQLite-backed [`Db`].
pub struct SqliteDb {
    path: Option<PathBuf>,
    // Dropped before the lock guard
    conn: Mutex<Option<Connection>>,
    lock: Mutex<Option<DbLockGuard>>,
}

impl SqliteDb {
    /// Open or create a store at `path`.
    ///
    /// Fails with a lock error when another agent holds the store.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let guard = try_lock_exclusive(path)?;
        let conn = Connection::open(path)?;
        let journal_mode: String =
            conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch(SCHEMA)?;

        info!(path = %path.display(), journal_mode = %journal_mode, "local store opened");

        Ok(Self {
            path: Some(path.to_path_buf()),
            conn: Mutex::new(Some(conn)),
            lock: Mutex::new(Some(guard)),
        })
    }

    /// Private in-memory store, no lock file.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            path: None,
            conn: Mutex::new(Some(conn)),
            lock: Mutex::new(None),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn is_closed(&self) -> bool {
        lock_ignoring_poison(&self.conn).is_none()
    }

    fn with_conn<T>(
        &self,
        op: &'static str,
        f: impl FnOnce(&mut Connection) -> Result<T>,
    ) -> Result<T> {
        let span = debug_span!("db.exec", op = op, duration_ms = tracing::field::Empty);
        let _enter = span.enter();
        let start = Instant::now();

        let mut slot = lock_ignoring_poison(&self.conn);
        let conn = slot.as_mut().ok_or(DbError::Closed)?;
        let result = f(conn);

        span.record("duration_ms", start.elapsed().as_millis() as u64);
        result
    }

    fn query_entities(
        &self,
        op: &'static str,
        sql: &str,
        param: &dyn rusqlite::ToSql,
    ) -> Result<Vec<KeyValueEntity>> {
        self.with_conn(op, |conn| {
            let mut stmt = conn.prepare_cached(sql)?;
            let rows = stmt.query_map([param], entity_from_row)?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
    }

    fn query_entity(
        &self,
        op: &'static str,
        sql: &str,
        param: &dyn rusqlite::ToSql,
    ) -> Result<Option<KeyValueEntity>> {
        self.with_conn(op, |conn| {
            Ok(conn
                .query_row(sql, [param], entity_from_row)
                .optional()?)
        })
    }
}

fn lock_ignoring_poison<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn entity_from_row(row: &Row<'_>) -> rusqlite::Result<KeyValueEntity> {
    Ok(KeyValueEntity {
        key: row.get(0)?,
        state: row.get(1)?,
        value: row.get(2)?,
        file_name: row.get(3)?,
    })
}

fn command_from_row(row: &Row<'_>) -> rusqlite::Result<CommandEntity> {
    let delivery_time: String = row.get(5)?;
    let delivery_time = DateTime::parse_from_rfc3339(&delivery_time)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(5, Type::Text, Box::new(e)))?;
    Ok(CommandEntity {
        id: row.get(0)?,
        command_result: row.get(1)?,
        acked: row.get(2)?,
        task_id: row.get(3)?,
        version: row.get(4)?,
        delivery_time,
    })
}

fn format_time(time: &DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn select_entity(conn: &Connection, key: &str) -> rusqlite::Result<Option<KeyValueEntity>> {
    conn.query_row(
        &format!("SELECT {KV_COLUMNS} FROM kv_entities WHERE key = ?1"),
        [key],
        entity_from_row,
    )
    .optional()
}

fn select_command(conn: &Connection, id: &str) -> rusqlite::Result<Option<CommandEntity>> {
    conn.query_row(
        &format!("SELECT {COMMAND_COLUMNS} FROM commands WHERE id = ?1"),
        [id],
        command_from_row,
    )
    .optional()
}

fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if e.code == ErrorCode::ConstraintViolation
    )
}

impl Db for SqliteDb {
    fn get(&self, key: &str) -> Result<Option<KeyValueEntity>> {
        self.with_conn("get", |conn| Ok(select_entity(conn, key)?))
    }

    fn set(&self, entity: KeyValueEntity) -> Result<()> {
        if entity.key.is_empty() {
            return Err(DbError::NullKey);
        }
        self.with_conn("set", |conn| {
            let inserted = conn.execute(
                "INSERT INTO kv_entities (key, state, value, file_name) VALUES (?1, ?2, ?3, ?4)",
                params![entity.key, entity.state, entity.value, entity.file_name],
            );
            match inserted {
                Ok(_) => Ok(()),
                Err(e) if is_constraint_violation(&e) => Err(DbError::already_exists(entity.key)),
                Err(e) => Err(e.into()),
            }
        })
    }

    fn put(&self, entity: KeyValueEntity) -> Result<Option<KeyValueEntity>> {
        if entity.key.is_empty() {
            return Err(DbError::NullKey);
        }
        self.with_conn("put", |conn| {
            let tx = conn.transaction()?;
            let previous = select_entity(&tx, &entity.key)?;
            tx.execute(
                "INSERT INTO kv_entities (key, state, value, file_name) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(key) DO UPDATE SET
                    state = excluded.state,
                    value = excluded.value,
                    file_name = excluded.file_name",
                params![entity.key, entity.state, entity.value, entity.file_name],
            )?;
            tx.commit()?;
            Ok(previous)
        })
    }

    fn remove(&self, key: &str) -> Result<Option<KeyValueEntity>> {
        if key.is_empty() {
            return Err(DbError::NullKey);
        }
        self.with_conn("remove", |conn| {
            let tx = conn.transaction()?;
            let previous = select_entity(&tx, key)?;
            if previous.is_some() {
                tx.execute("DELETE FROM kv_entities WHERE key = ?1", [key])?;
            }
            tx.commit()?;
            Ok(previous)
        })
    }

    fn search(&self, state: StateSearchKey) -> Result<Vec<KeyValueEntity>> {
        self.query_entities(
            "search",
            &format!("SELECT {KV_COLUMNS} FROM kv_entities WHERE state = ?1 ORDER BY key"),
            &state,
        )
    }

    fn search_one(&self, state: StateSearchKey) -> Result<Option<KeyValueEntity>> {
        self.query_entity(
            "search_one",
            &format!("SELECT {KV_COLUMNS} FROM kv_entities WHERE state = ?1 ORDER BY key LIMIT 1"),
            &state,
        )
    }

    fn search_one_by_file_name(&self, file_name: &str) -> Result<Option<KeyValueEntity>> {
        self.query_entity(
            "search_one_by_file_name",
            &format!(
                "SELECT {KV_COLUMNS} FROM kv_entities WHERE file_name = ?1 ORDER BY key LIMIT 1"
            ),
            &file_name,
        )
    }

    fn find_all(&self, prefix: &str) -> Result<Vec<KeyValueEntity>> {
        // substr keeps `%` and `_` in the prefix literal
        self.query_entities(
            "find_all",
            &format!(
                "SELECT {KV_COLUMNS} FROM kv_entities
                 WHERE substr(key, 1, length(?1)) = ?1 ORDER BY key"
            ),
            &prefix,
        )
    }

    fn get_command(&self, id: &str) -> Result<Option<CommandEntity>> {
        self.with_conn("get_command", |conn| Ok(select_command(conn, id)?))
    }

    fn put_command(&self, entity: CommandEntity) -> Result<Option<CommandEntity>> {
        if entity.id.is_empty() {
            return Err(DbError::NullKey);
        }
        self.with_conn("put_command", |conn| {
            let tx = conn.transaction()?;
            let previous = select_command(&tx, &entity.id)?;
            tx.execute(
                "INSERT INTO commands (id, command_result, acked, task_id, version, delivery_time)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(id) DO UPDATE SET
                    command_result = excluded.command_result,
                    acked = excluded.acked,
                    task_id = excluded.task_id,
                    version = excluded.version,
                    delivery_time = excluded.delivery_time",
                params![
                    entity.id,
                    entity.command_result,
                    entity.acked,
                    entity.task_id,
                    entity.version,
                    format_time(&entity.delivery_time),
                ],
            )?;
            tx.commit()?;
            Ok(previous)
        })
    }

    fn search_commands(&self, acked: bool) -> Result<Vec<CommandEntity>> {
        self.with_conn("search_commands", |conn| {
            let mut stmt = conn.prepare_cached(&format!(
                "SELECT {COMMAND_COLUMNS} FROM commands WHERE acked = ?1 ORDER BY delivery_time, id"
            ))?;
            let rows = stmt.query_map([acked], command_from_row)?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
    }

    fn close(&self) -> Result<()> {
        let conn = lock_ignoring_poison(&self.conn).take();
        let Some(conn) = conn else {
            return Ok(());
        };

        let span = debug_span!("db.close", path = ?self.path);
        let _enter = span.enter();

        if self.path.is_some() {
            if let Err(e) = conn.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_| Ok(())) {
                warn!(error = %e, "WAL checkpoint failed on close");
            }
        }
        let closed = conn.close().map_err(|(_, e)| DbError::from(e));
        lock_ignoring_poison(&self.lock).take();

        if let Some(path) = &self.path {
            info!(path = %path.display(), "local store closed");
        }
        closed
    }
}

impl std::fmt::Debug for SqliteDb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteDb")
            .field("path", &self.path)
            .field("closed", &self.is_closed())
            .finish()
    }
}
