//! Backend-independent pool state
//!
//! Both stores hold a `PoolState` behind a mutex and delegate every contract
//! method to it; the file store additionally persists a `Snapshot` after each
//! mutation that actually changed something.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::record::{KeyId, KeyRecord};

/// On-disk representation of the pool.
#[derive(Debug, Default, Serialize, Deserialize)]
pub(crate) struct Snapshot {
    #[serde(default)]
    pub next_id: u64,
    #[serde(default)]
    pub cursor: Option<KeyId>,
    #[serde(default)]
    pub keys: Vec<KeyRecord>,
}

#[derive(Debug, Clone)]
pub(crate) struct PoolState {
    records: BTreeMap<KeyId, KeyRecord>,
    by_value: HashMap<String, KeyId>,
    next_id: u64,
    cursor: Option<KeyId>,
}

impl Default for PoolState {
    fn default() -> Self {
        Self {
            records: BTreeMap::new(),
            by_value: HashMap::new(),
            next_id: 1,
            cursor: None,
        }
    }
}

impl PoolState {
    /// Rebuild state from a snapshot, rejecting duplicate ids or values.
    pub fn from_snapshot(snapshot: Snapshot) -> Result<Self> {
        let mut state = Self::default();
        for record in snapshot.keys {
            if state.records.contains_key(&record.id) {
                return Err(Error::Parse(format!("duplicate key id {}", record.id)));
            }
            if state.by_value.contains_key(&record.value) {
                return Err(Error::Parse(format!(
                    "duplicate key value (fingerprint {})",
                    record.fingerprint()
                )));
            }
            state.by_value.insert(record.value.clone(), record.id);
            state.records.insert(record.id, record);
        }
        let max_id = state.records.keys().next_back().map_or(0, |id| id.0);
        state.next_id = snapshot.next_id.max(max_id + 1);
        state.cursor = snapshot.cursor;
        Ok(state)
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            next_id: self.next_id,
            cursor: self.cursor,
            keys: self.records.values().cloned().collect(),
        }
    }

    pub fn insert(&mut self, value: &str) -> Result<KeyRecord> {
        if self.by_value.contains_key(value) {
            return Err(Error::Conflict(common::fingerprint(value)));
        }
        let id = KeyId(self.next_id);
        self.next_id += 1;
        let record = KeyRecord {
            id,
            value: value.to_string(),
            alive: true,
            last_used: 0,
        };
        self.by_value.insert(record.value.clone(), id);
        self.records.insert(id, record.clone());
        Ok(record)
    }

    pub fn next_alive_after(&self, cursor: Option<KeyId>) -> Option<KeyRecord> {
        let mut candidates: Box<dyn Iterator<Item = &KeyRecord>> = match cursor {
            Some(c) => Box::new(
                self.records
                    .range((std::ops::Bound::Excluded(c), std::ops::Bound::Unbounded))
                    .map(|(_, r)| r),
            ),
            None => Box::new(self.records.values()),
        };
        candidates.find(|r| r.alive).cloned()
    }

    pub fn least_recently_used_alive(&self) -> Option<KeyRecord> {
        self.records
            .values()
            .filter(|r| r.alive)
            .min_by_key(|r| (r.last_used, r.id))
            .cloned()
    }

    pub fn conditional_update_last_used(
        &mut self,
        id: KeyId,
        expected_previous: u64,
        new_value: u64,
    ) -> bool {
        match self.records.get_mut(&id) {
            Some(record) if record.last_used == expected_previous => {
                record.last_used = new_value;
                true
            }
            _ => false,
        }
    }

    pub fn advance_cursor(&mut self, expected: Option<KeyId>, next: KeyId) -> bool {
        if self.cursor != expected {
            return false;
        }
        self.cursor = Some(next);
        true
    }

    /// Returns `(found, changed)`.
    pub fn set_alive(&mut self, value: &str, alive: bool) -> (bool, bool) {
        let Some(id) = self.by_value.get(value) else {
            return (false, false);
        };
        match self.records.get_mut(id) {
            Some(record) => {
                let changed = record.alive != alive;
                record.alive = alive;
                (true, changed)
            }
            None => (false, false),
        }
    }

    pub fn find_by_value(&self, value: &str) -> Option<KeyRecord> {
        self.by_value
            .get(value)
            .and_then(|id| self.records.get(id))
            .cloned()
    }

    pub fn count_alive(&self) -> usize {
        self.records.values().filter(|r| r.alive).count()
    }

    pub fn list(&self) -> Vec<KeyRecord> {
        self.records.values().cloned().collect()
    }

    pub fn cursor(&self) -> Option<KeyId> {
        self.cursor
    }

    pub fn set_cursor(&mut self, id: KeyId) {
        self.cursor = Some(id);
    }
}
