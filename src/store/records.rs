//! JSON file store, one file per username

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::game::player::PlayerRecord;

/// Persistence errors. Logged by callers, never retried.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("record io error: {0}")]
    Io(#[from] io::Error),

    #[error("record serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("record task failed: {0}")]
    Task(String),
}

/// Blocking record storage. Callers on the runtime go through `spawn_blocking`.
pub trait RecordStore: Send + Sync + 'static {
    /// `Ok(None)` when the username has never been saved
    fn load(&self, username: &str) -> Result<Option<PlayerRecord>, StoreError>;

    fn save(&self, record: &PlayerRecord) -> Result<(), StoreError>;
}

#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    /// Create the data directory if needed
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, username: &str) -> PathBuf {
        self.dir.join(format!("{username}.json"))
    }
}

impl RecordStore for FileStore {
    fn load(&self, username: &str) -> Result<Option<PlayerRecord>, StoreError> {
        let raw = match fs::read_to_string(self.path_for(username)) {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(Some(serde_json::from_str(&raw)?))
    }

    fn save(&self, record: &PlayerRecord) -> Result<(), StoreError> {
        let json = serde_json::to_vec_pretty(record)?;
        let target = self.path_for(&record.username);
        let tmp = target.with_extension("json.tmp");
        fs::write(&tmp, json)?;
        fs::rename(&tmp, &target)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::unit::fixtures::templates;
    use uuid::Uuid;

    fn scratch_store() -> FileStore {
        let dir = std::env::temp_dir().join(format!("tower-duel-{}", Uuid::new_v4()));
        FileStore::open(dir).unwrap()
    }

    #[test]
    fn missing_record_is_none() {
        let store = scratch_store();
        assert!(store.load("nobody").unwrap().is_none());
        let _ = fs::remove_dir_all(store.dir());
    }

    #[test]
    fn saved_record_reloads() {
        let store = scratch_store();
        let mut record = PlayerRecord::new("alice", "pw", &templates());
        record.exp = 42;
        record.level = 3;
        store.save(&record).unwrap();

        let loaded = store.load("alice").unwrap().unwrap();
        assert_eq!(loaded.exp, 42);
        assert_eq!(loaded.level, 3);
        assert_eq!(loaded.towers, record.towers);
        assert!(!store.dir().join("alice.json.tmp").exists());
        let _ = fs::remove_dir_all(store.dir());
    }

    #[test]
    fn corrupt_record_is_an_error() {
        let store = scratch_store();
        fs::write(store.dir().join("mallory.json"), "{not json").unwrap();
        assert!(matches!(store.load("mallory"), Err(StoreError::Serde(_))));
        let _ = fs::remove_dir_all(store.dir());
    }
}
