//! In-memory store for tests

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::game::player::PlayerRecord;

use super::records::{RecordStore, StoreError};

#[derive(Default)]
pub struct MemoryStore {
    records: Mutex<HashMap<String, PlayerRecord>>,
    saves: Mutex<HashMap<String, usize>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, record: PlayerRecord) {
        self.records.lock().insert(record.username.clone(), record);
    }

    pub fn get(&self, username: &str) -> Option<PlayerRecord> {
        self.records.lock().get(username).cloned()
    }

    /// Number of saves recorded for `username`
    pub fn save_count(&self, username: &str) -> usize {
        self.saves.lock().get(username).copied().unwrap_or(0)
    }
}

impl RecordStore for MemoryStore {
    fn load(&self, username: &str) -> Result<Option<PlayerRecord>, StoreError> {
        Ok(self.get(username))
    }

    fn save(&self, record: &PlayerRecord) -> Result<(), StoreError> {
        self.insert(record.clone());
        *self.saves.lock().entry(record.username.clone()).or_default() += 1;
        Ok(())
    }
}
