//! Persistence of trigger profiles and file bookmarks in the local store.

use crate::error::{AgentError, Result};
use courier_conf::TriggerProfile;
use courier_db::{Db, KeyValueEntity, StateSearchKey};
use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

/// Key prefix for persisted trigger profiles.
pub const TRIGGER_ID_PREFIX: &str = "trigger_";

/// Key prefix for file bookmarks.
pub const BOOKMARK_PREFIX: &str = "bookmark_";

/// Trigger profiles stored as flat JSON under `trigger_<id>`.
#[derive(Clone)]
pub struct TriggerProfileDb {
    db: Arc<dyn Db>,
}

impl TriggerProfileDb {
    pub fn new(db: Arc<dyn Db>) -> Self {
        Self { db }
    }

    pub fn key_for(trigger_id: &str) -> String {
        format!("{}{}", TRIGGER_ID_PREFIX, trigger_id)
    }

    /// Upsert a profile.
    pub fn store_trigger(&self, profile: &TriggerProfile) -> Result<()> {
        let id = profile
            .trigger_id()
            .ok_or_else(|| AgentError::invalid_profile("trigger profile has no id"))?;
        let entity = KeyValueEntity::new(
            Self::key_for(&id),
            profile.to_json_str(),
            StateSearchKey::Accepted,
        );
        let replaced = self.db.put(entity)?.is_some();
        debug!(trigger_id = %id, replaced, "trigger profile stored");
        Ok(())
    }

    pub fn get_trigger(&self, trigger_id: &str) -> Result<Option<TriggerProfile>> {
        match self.db.get(&Self::key_for(trigger_id))? {
            Some(entity) => Ok(Some(TriggerProfile::parse_json_str(&entity.value)?)),
            None => Ok(None),
        }
    }

    /// Remove a profile. Returns `false` when none was stored.
    pub fn delete_trigger(&self, trigger_id: &str) -> Result<bool> {
        Ok(self.db.remove(&Self::key_for(trigger_id))?.is_some())
    }

    /// Every stored profile. Rows that fail to parse are skipped.
    pub fn triggers(&self) -> Result<Vec<TriggerProfile>> {
        let rows = self.db.find_all(TRIGGER_ID_PREFIX)?;
        let mut profiles = Vec::with_capacity(rows.len());
        for row in rows {
            match TriggerProfile::parse_json_str(&row.value) {
                Ok(profile) => profiles.push(profile),
                Err(e) => warn!(key = %row.key, error = %e, "skipping unreadable trigger profile"),
            }
        }
        Ok(profiles)
    }
}

/// Modification time of every file a trigger already turned into a job.
///
/// Stored under `bookmark_<trigger id>|<path>` with the file path as the
/// entry's file name and the mtime in nanoseconds as its value.
#[derive(Clone)]
pub struct FileBookmarkDb {
    db: Arc<dyn Db>,
}

impl FileBookmarkDb {
    pub fn new(db: Arc<dyn Db>) -> Self {
        Self { db }
    }

    fn prefix_for(trigger_id: &str) -> String {
        format!("{}{}|", BOOKMARK_PREFIX, trigger_id)
    }

    pub fn key_for(trigger_id: &str, path: &Path) -> String {
        format!("{}{}", Self::prefix_for(trigger_id), path.display())
    }

    /// Whether `path` was already emitted with exactly this mtime.
    pub fn is_recorded(&self, trigger_id: &str, path: &Path, modified: SystemTime) -> Result<bool> {
        let Some(nanos) = epoch_nanos(modified) else {
            return Ok(false);
        };
        Ok(self
            .db
            .get(&Self::key_for(trigger_id, path))?
            .map_or(false, |entity| entity.value == nanos.to_string()))
    }

    pub fn record(&self, trigger_id: &str, path: &Path, modified: SystemTime) -> Result<()> {
        let Some(nanos) = epoch_nanos(modified) else {
            return Ok(());
        };
        let entity = KeyValueEntity::new(
            Self::key_for(trigger_id, path),
            nanos.to_string(),
            StateSearchKey::Success,
        )
        .with_file_name(path.to_string_lossy());
        self.db.put(entity)?;
        Ok(())
    }

    /// Drop every bookmark of a trigger. Returns how many were removed.
    pub fn clear(&self, trigger_id: &str) -> Result<usize> {
        let rows = self.db.find_all(&Self::prefix_for(trigger_id))?;
        let mut removed = 0;
        for row in rows {
            if self.db.remove(&row.key)?.is_some() {
                removed += 1;
            }
        }
        debug!(trigger_id, removed, "file bookmarks cleared");
        Ok(removed)
    }
}

fn epoch_nanos(time: SystemTime) -> Option<u128> {
    time.duration_since(UNIX_EPOCH).ok().map(|d| d.as_nanos())
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_conf::keys;
    use courier_db::SqliteDb;

    fn profile(id: &str) -> TriggerProfile {
        let mut profile = TriggerProfile::new();
        profile.set(keys::JOB_ID, id);
        profile.set(keys::JOB_TRIGGER, "directory");
        profile.set(keys::JOB_DIR_FILTER_PATTERN, "/data/*.log");
        profile
    }

    #[test]
    fn test_store_get_delete() {
        let db: Arc<dyn Db> = Arc::new(SqliteDb::open_in_memory().unwrap());
        let store = TriggerProfileDb::new(db.clone());

        store.store_trigger(&profile("t1")).unwrap();
        store.store_trigger(&profile("t1")).unwrap();

        assert_eq!(store.get_trigger("t1").unwrap().unwrap(), profile("t1"));
        let row = db.get("trigger_t1").unwrap().unwrap();
        assert_eq!(row.state, StateSearchKey::Accepted);

        assert!(store.delete_trigger("t1").unwrap());
        assert!(!store.delete_trigger("t1").unwrap());
        assert!(store.get_trigger("t1").unwrap().is_none());
    }

    #[test]
    fn test_triggers_skips_unreadable_rows() {
        let db: Arc<dyn Db> = Arc::new(SqliteDb::open_in_memory().unwrap());
        let store = TriggerProfileDb::new(db.clone());
        store.store_trigger(&profile("t1")).unwrap();
        store.store_trigger(&profile("t2")).unwrap();
        db.set(KeyValueEntity::new("trigger_bad", "{not json", StateSearchKey::Accepted))
            .unwrap();
        db.set(KeyValueEntity::new("other", "{}", StateSearchKey::Accepted))
            .unwrap();

        let ids: Vec<_> = store
            .triggers()
            .unwrap()
            .into_iter()
            .filter_map(|p| p.trigger_id())
            .collect();
        assert_eq!(ids, vec!["t1", "t2"]);
    }

    #[test]
    fn test_store_requires_id() {
        let db: Arc<dyn Db> = Arc::new(SqliteDb::open_in_memory().unwrap());
        let store = TriggerProfileDb::new(db);
        assert!(store.store_trigger(&TriggerProfile::new()).is_err());
    }

    #[test]
    fn test_bookmarks_match_exact_mtime() {
        let db: Arc<dyn Db> = Arc::new(SqliteDb::open_in_memory().unwrap());
        let bookmarks = FileBookmarkDb::new(db.clone());
        let path = Path::new("/data/in/a.log");
        let modified = UNIX_EPOCH + std::time::Duration::from_secs(1_700_000_000);

        assert!(!bookmarks.is_recorded("t1", path, modified).unwrap());
        bookmarks.record("t1", path, modified).unwrap();
        assert!(bookmarks.is_recorded("t1", path, modified).unwrap());
        assert!(!bookmarks
            .is_recorded("t1", path, modified + std::time::Duration::from_secs(1))
            .unwrap());
        assert!(!bookmarks.is_recorded("t2", path, modified).unwrap());

        let row = db.search_one_by_file_name("/data/in/a.log").unwrap().unwrap();
        assert_eq!(row.key, FileBookmarkDb::key_for("t1", path));
    }

    #[test]
    fn test_clear_bookmarks_is_scoped_to_trigger() {
        let db: Arc<dyn Db> = Arc::new(SqliteDb::open_in_memory().unwrap());
        let bookmarks = FileBookmarkDb::new(db);
        let modified = UNIX_EPOCH + std::time::Duration::from_secs(5);
        bookmarks.record("t1", Path::new("/a"), modified).unwrap();
        bookmarks.record("t1", Path::new("/b"), modified).unwrap();
        bookmarks.record("t10", Path::new("/a"), modified).unwrap();

        assert_eq!(bookmarks.clear("t1").unwrap(), 2);
        assert!(!bookmarks.is_recorded("t1", Path::new("/a"), modified).unwrap());
        assert!(bookmarks.is_recorded("t10", Path::new("/a"), modified).unwrap());
    }
}
