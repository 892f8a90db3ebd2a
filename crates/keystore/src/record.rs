//! Persisted key record

use std::fmt;

use serde::{Deserialize, Serialize};

/// Insertion-ordered identifier of a key. Defines rotation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KeyId(pub u64);

impl fmt::Display for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One API key in the pool.
///
/// `last_used` is the unix millisecond timestamp of the most recent
/// acquisition and also serves as the optimistic-concurrency version: a claim
/// only succeeds if the stored value still equals what the claimant read.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyRecord {
    pub id: KeyId,
    pub value: String,
    #[serde(default = "default_alive")]
    pub alive: bool,
    #[serde(default)]
    pub last_used: u64,
}

fn default_alive() -> bool {
    true
}

impl KeyRecord {
    /// Fingerprint of the key value, safe for logs.
    pub fn fingerprint(&self) -> String {
        common::fingerprint(&self.value)
    }
}

impl fmt::Debug for KeyRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyRecord")
            .field("id", &self.id)
            .field("key", &self.fingerprint())
            .field("alive", &self.alive)
            .field("last_used", &self.last_used)
            .finish()
    }
}
