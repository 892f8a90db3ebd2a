//! The `KeyStore` contract
//!
//! Every method is a single atomic operation against the backing store. The
//! pool composes them into rotation; the store itself knows nothing about
//! retry policy.

use std::future::Future;
use std::pin::Pin;

use crate::error::Result;
use crate::record::{KeyId, KeyRecord};

/// Boxed future returned by `KeyStore` methods.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Persistence backend for the key pool.
///
/// Uses `Pin<Box<dyn Future>>` return types so the pool can hold an
/// `Arc<dyn KeyStore>` chosen at startup.
pub trait KeyStore: Send + Sync {
    /// Insert a new alive key with the next id. Fails with `Error::Conflict`
    /// when the value is already present.
    fn insert<'a>(&'a self, value: &'a str) -> StoreFuture<'a, KeyRecord>;

    /// Smallest-id alive key strictly after `cursor` (`None` = from the start).
    fn next_alive_after(&self, cursor: Option<KeyId>) -> StoreFuture<'_, Option<KeyRecord>>;

    /// Alive key with the smallest `last_used`, ties broken by id.
    fn least_recently_used_alive(&self) -> StoreFuture<'_, Option<KeyRecord>>;

    /// Set `last_used = new_value` iff it currently equals `expected_previous`.
    /// Returns whether a row was updated.
    fn conditional_update_last_used(
        &self,
        id: KeyId,
        expected_previous: u64,
        new_value: u64,
    ) -> StoreFuture<'_, bool>;

    /// Move the cursor to `next` iff it currently equals `expected`.
    /// Returns whether the cursor moved.
    fn advance_cursor(&self, expected: Option<KeyId>, next: KeyId) -> StoreFuture<'_, bool>;

    /// Set the liveness flag of the key with this value. Returns false if no
    /// such key exists.
    fn set_alive<'a>(&'a self, value: &'a str, alive: bool) -> StoreFuture<'a, bool>;

    fn find_by_value<'a>(&'a self, value: &'a str) -> StoreFuture<'a, Option<KeyRecord>>;

    fn count_alive(&self) -> StoreFuture<'_, usize>;

    /// All records ordered by id.
    fn list(&self) -> StoreFuture<'_, Vec<KeyRecord>>;

    fn get_cursor(&self) -> StoreFuture<'_, Option<KeyId>>;

    /// Unconditionally move the cursor.
    fn set_cursor(&self, id: KeyId) -> StoreFuture<'_, ()>;
}
