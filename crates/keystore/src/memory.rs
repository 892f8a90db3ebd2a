//! Process-local key store

use tokio::sync::Mutex;

use crate::record::{KeyId, KeyRecord};
use crate::state::PoolState;
use crate::store::{KeyStore, StoreFuture};

/// In-memory `KeyStore`.
///
/// A single tokio Mutex makes every contract method atomic. Nothing survives
/// a restart; use `FileKeyStore` for that.
#[derive(Debug, Default)]
pub struct MemoryKeyStore {
    state: Mutex<PoolState>,
}

impl MemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a store pre-populated with `values` in order. Duplicates are
    /// skipped.
    pub fn with_keys<I, S>(values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut state = PoolState::default();
        for value in values {
            let _ = state.insert(value.as_ref());
        }
        Self {
            state: Mutex::new(state),
        }
    }
}

impl KeyStore for MemoryKeyStore {
    fn insert<'a>(&'a self, value: &'a str) -> StoreFuture<'a, KeyRecord> {
        Box::pin(async move { self.state.lock().await.insert(value) })
    }

    fn next_alive_after(&self, cursor: Option<KeyId>) -> StoreFuture<'_, Option<KeyRecord>> {
        Box::pin(async move { Ok(self.state.lock().await.next_alive_after(cursor)) })
    }

    fn least_recently_used_alive(&self) -> StoreFuture<'_, Option<KeyRecord>> {
        Box::pin(async move { Ok(self.state.lock().await.least_recently_used_alive()) })
    }

    fn conditional_update_last_used(
        &self,
        id: KeyId,
        expected_previous: u64,
        new_value: u64,
    ) -> StoreFuture<'_, bool> {
        Box::pin(async move {
            Ok(self
                .state
                .lock()
                .await
                .conditional_update_last_used(id, expected_previous, new_value))
        })
    }

    fn advance_cursor(&self, expected: Option<KeyId>, next: KeyId) -> StoreFuture<'_, bool> {
        Box::pin(async move { Ok(self.state.lock().await.advance_cursor(expected, next)) })
    }

    fn set_alive<'a>(&'a self, value: &'a str, alive: bool) -> StoreFuture<'a, bool> {
        Box::pin(async move {
            let (found, _) = self.state.lock().await.set_alive(value, alive);
            Ok(found)
        })
    }

    fn find_by_value<'a>(&'a self, value: &'a str) -> StoreFuture<'a, Option<KeyRecord>> {
        Box::pin(async move { Ok(self.state.lock().await.find_by_value(value)) })
    }

    fn count_alive(&self) -> StoreFuture<'_, usize> {
        Box::pin(async move { Ok(self.state.lock().await.count_alive()) })
    }

    fn list(&self) -> StoreFuture<'_, Vec<KeyRecord>> {
        Box::pin(async move { Ok(self.state.lock().await.list()) })
    }

    fn get_cursor(&self) -> StoreFuture<'_, Option<KeyId>> {
        Box::pin(async move { Ok(self.state.lock().await.cursor()) })
    }

    fn set_cursor(&self, id: KeyId) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            self.state.lock().await.set_cursor(id);
            Ok(())
        })
    }
}
