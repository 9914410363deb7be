//! Local store for the Courier agent.
//!
//! Durable key/value entries (trigger profiles, file bookmarks) and command
//! entities with acknowledgement tracking, behind the [`Db`] trait.
//!
//! # Usage
//!
//! ```rust,ignore
//! use courier_db::{Db, KeyValueEntity, SqliteDb, StateSearchKey};
//!
//! let db = SqliteDb::open("/var/lib/courier/localdb/agent.sqlite3")?;
//! db.set(KeyValueEntity::new("offset_a.log", "128", StateSearchKey::Running))?;
//! let running = db.search(StateSearchKey::Running)?;
//! db.close()?;
//! ```

mod command;
mod entity;
mod error;
pub mod lock;
mod sqlite;

pub use command::CommandDb;
pub use entity::{CommandEntity, KeyValueEntity, StateSearchKey};
pub use error::{DbError, Result};
pub use sqlite::SqliteDb;

/// Uniform local store contract.
///
/// Absence is `Ok(None)` or an empty list; only real failures are errors.
pub trait Db: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<KeyValueEntity>>;

    /// Insert once. Fails with [`DbError::AlreadyExists`] when the key is present
    /// and [`DbError::NullKey`] when it is empty.
    fn set(&self, entity: KeyValueEntity) -> Result<()>;

    /// Upsert, returning the entity that was replaced.
    fn put(&self, entity: KeyValueEntity) -> Result<Option<KeyValueEntity>>;

    fn remove(&self, key: &str) -> Result<Option<KeyValueEntity>>;

    fn search(&self, state: StateSearchKey) -> Result<Vec<KeyValueEntity>>;

    fn search_one(&self, state: StateSearchKey) -> Result<Option<KeyValueEntity>>;

    fn search_one_by_file_name(&self, file_name: &str) -> Result<Option<KeyValueEntity>>;

    /// Entries whose key starts with `prefix`, matched literally.
    fn find_all(&self, prefix: &str) -> Result<Vec<KeyValueEntity>>;

    fn get_command(&self, id: &str) -> Result<Option<CommandEntity>>;

    /// Upsert a command, returning the one that was replaced.
    fn put_command(&self, entity: CommandEntity) -> Result<Option<CommandEntity>>;

    fn search_commands(&self, acked: bool) -> Result<Vec<CommandEntity>>;

    /// Flush and release the store. Idempotent; later calls fail with [`DbError::Closed`].
    fn close(&self) -> Result<()>;
}
