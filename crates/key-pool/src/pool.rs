//! Key rotation over a shared `KeyStore`
//!
//! The pool keeps no state of its own beyond its settings. Every decision is
//! read from the store and every claim is a conditional write, so two pools
//! over the same store (or two tasks over the same pool) can never both win
//! the same slot of a rotation round. Losers back off with random jitter and
//! re-read.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use keystore::{KeyRecord, KeyStore};
use rand::RngExt;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// Order in which `acquire()` hands out keys.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Rotation {
    /// Ascending id after the shared cursor, wrapping to the smallest id.
    #[default]
    RoundRobin,
    /// Alive key with the oldest `last_used`, ties broken by id.
    LeastRecentlyUsed,
}

#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub rotation: Rotation,
    /// Upper bound of the random delay after a lost claim.
    pub conflict_backoff: Duration,
    /// Consecutive lost claims tolerated before `Error::Contention`.
    pub max_conflict_retries: u32,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            rotation: Rotation::RoundRobin,
            conflict_backoff: Duration::from_millis(100),
            max_conflict_retries: 32,
        }
    }
}

/// Result of adding a key through the operator path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportOutcome {
    Inserted,
    Reactivated,
    AlreadyAlive,
}

impl ImportOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            ImportOutcome::Inserted => "inserted",
            ImportOutcome::Reactivated => "reactivated",
            ImportOutcome::AlreadyAlive => "already_alive",
        }
    }
}

/// Key counts for health and admin endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolSummary {
    pub keys_total: usize,
    pub keys_alive: usize,
    pub keys_quarantined: usize,
}

enum Claim {
    Won(KeyRecord),
    Lost,
}

/// Pool of API keys backed by an injected store.
pub struct KeyPool {
    store: Arc<dyn KeyStore>,
    settings: PoolSettings,
}

impl KeyPool {
    pub fn new(store: Arc<dyn KeyStore>, settings: PoolSettings) -> Self {
        info!(
            rotation = ?settings.rotation,
            max_conflict_retries = settings.max_conflict_retries,
            "key pool initialized"
        );
        Self { store, settings }
    }

    pub fn settings(&self) -> &PoolSettings {
        &self.settings
    }

    /// Claim the next alive key and advance rotation.
    ///
    /// Returns `PoolExhausted` when no key is alive and `Contention` when
    /// `max_conflict_retries` consecutive claims were lost to other callers.
    /// The returned record carries the freshly stamped `last_used`.
    pub async fn acquire(&self) -> Result<KeyRecord> {
        let mut conflicts = 0u32;
        loop {
            let claim = match self.settings.rotation {
                Rotation::RoundRobin => self.claim_next().await?,
                Rotation::LeastRecentlyUsed => self.claim_least_recently_used().await?,
            };

            match claim {
                Claim::Won(record) => {
                    debug!(
                        key_id = %record.id,
                        key = %record.fingerprint(),
                        conflicts,
                        "acquired key"
                    );
                    return Ok(record);
                }
                Claim::Lost => {
                    conflicts += 1;
                    metrics::counter!("key_pool_acquire_conflicts_total").increment(1);
                    if conflicts >= self.settings.max_conflict_retries {
                        warn!(conflicts, "giving up on key claim after repeated conflicts");
                        return Err(Error::Contention(conflicts));
                    }
                    let delay = self.conflict_jitter();
                    debug!(
                        conflicts,
                        delay_ms = delay.as_millis() as u64,
                        "key claim conflict, retrying after jitter"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Round-robin claim: the cursor write decides who owns this slot of the
    /// round, the `last_used` write guards against a cursor that cycled back.
    async fn claim_next(&self) -> Result<Claim> {
        let cursor = self.store.get_cursor().await?;
        let candidate = match self.store.next_alive_after(cursor).await? {
            Some(record) => record,
            None => self
                .store
                .next_alive_after(None)
                .await?
                .ok_or(Error::PoolExhausted)?,
        };

        if !self.store.advance_cursor(cursor, candidate.id).await? {
            return Ok(Claim::Lost);
        }
        let id = candidate.id;
        let claim = self.stamp(candidate).await?;
        if matches!(claim, Claim::Lost) {
            // The slot was never issued; hand it back unless someone has
            // moved the cursor since. A cursor that started empty stays put.
            if let Some(previous) = cursor {
                self.store.advance_cursor(Some(id), previous).await?;
            }
        }
        Ok(claim)
    }

    async fn claim_least_recently_used(&self) -> Result<Claim> {
        let candidate = self
            .store
            .least_recently_used_alive()
            .await?
            .ok_or(Error::PoolExhausted)?;
        let id = candidate.id;
        let claim = self.stamp(candidate).await?;
        if matches!(claim, Claim::Won(_)) {
            self.store.set_cursor(id).await?;
        }
        Ok(claim)
    }

    async fn stamp(&self, mut candidate: KeyRecord) -> Result<Claim> {
        // Strictly increasing so the version changes even within one millisecond.
        let stamped = now_millis().max(candidate.last_used + 1);
        if !self
            .store
            .conditional_update_last_used(candidate.id, candidate.last_used, stamped)
            .await?
        {
            return Ok(Claim::Lost);
        }
        candidate.last_used = stamped;
        Ok(Claim::Won(candidate))
    }

    fn conflict_jitter(&self) -> Duration {
        let max = self.settings.conflict_backoff.as_millis() as u64;
        if max == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::rng().random_range(0..max))
    }

    /// Register a caller-supplied key after it proved valid upstream.
    ///
    /// - absent: inserted and returned as is
    /// - quarantined: reactivated and returned
    /// - already alive: a normal `acquire()`, so one caller cannot pin a slot
    pub async fn register(&self, value: &str) -> Result<KeyRecord> {
        let (record, outcome) = self.upsert(value).await?;
        match outcome {
            ImportOutcome::AlreadyAlive => self.acquire().await,
            ImportOutcome::Inserted | ImportOutcome::Reactivated => Ok(record),
        }
    }

    /// Add a key from configuration or the admin API. Never touches rotation.
    pub async fn import(&self, value: &str) -> Result<ImportOutcome> {
        let (_, outcome) = self.upsert(value).await?;
        Ok(outcome)
    }

    async fn upsert(&self, value: &str) -> Result<(KeyRecord, ImportOutcome)> {
        if value.is_empty() {
            return Err(Error::InvalidKey("key must not be empty".into()));
        }

        let existing = match self.store.find_by_value(value).await? {
            Some(record) => record,
            None => match self.store.insert(value).await {
                Ok(record) => {
                    info!(key_id = %record.id, key = %record.fingerprint(), "registered new key");
                    record_registration(ImportOutcome::Inserted);
                    return Ok((record, ImportOutcome::Inserted));
                }
                Err(keystore::Error::Conflict(_)) => {
                    debug!(key = %common::fingerprint(value), "lost insert race, re-reading");
                    self.store
                        .find_by_value(value)
                        .await?
                        .ok_or_else(|| keystore::Error::Conflict(common::fingerprint(value)))?
                }
                Err(e) => return Err(e.into()),
            },
        };

        if existing.alive {
            record_registration(ImportOutcome::AlreadyAlive);
            return Ok((existing, ImportOutcome::AlreadyAlive));
        }

        self.store.set_alive(value, true).await?;
        info!(key_id = %existing.id, key = %existing.fingerprint(), "reactivated quarantined key");
        record_registration(ImportOutcome::Reactivated);
        Ok((
            KeyRecord {
                alive: true,
                ..existing
            },
            ImportOutcome::Reactivated,
        ))
    }

    /// True iff `value` is a known, alive pool key.
    pub async fn validate(&self, value: &str) -> Result<bool> {
        Ok(self
            .store
            .find_by_value(value)
            .await?
            .is_some_and(|record| record.alive))
    }

    /// Take a key out of rotation. Idempotent; unknown keys are ignored.
    pub async fn quarantine(&self, value: &str) -> Result<()> {
        match self.store.find_by_value(value).await? {
            Some(record) if record.alive => {
                self.store.set_alive(value, false).await?;
                metrics::counter!("key_pool_quarantined_total").increment(1);
                warn!(key_id = %record.id, key = %record.fingerprint(), "key quarantined");
            }
            Some(record) => {
                debug!(key_id = %record.id, "key already quarantined");
            }
            None => {
                debug!(key = %common::fingerprint(value), "quarantine of unknown key ignored");
            }
        }
        Ok(())
    }

    /// Number of alive keys.
    pub async fn count(&self) -> Result<usize> {
        Ok(self.store.count_alive().await?)
    }

    /// All keys ordered by id, including quarantined ones.
    pub async fn list(&self) -> Result<Vec<KeyRecord>> {
        Ok(self.store.list().await?)
    }

    pub async fn summary(&self) -> Result<PoolSummary> {
        let keys = self.store.list().await?;
        let keys_alive = keys.iter().filter(|k| k.alive).count();
        Ok(PoolSummary {
            keys_total: keys.len(),
            keys_alive,
            keys_quarantined: keys.len() - keys_alive,
        })
    }
}

fn record_registration(outcome: ImportOutcome) {
    metrics::counter!("key_pool_registered_total", "outcome" => outcome.label()).increment(1);
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use keystore::{KeyId, MemoryKeyStore, StoreFuture};
    use metrics_exporter_prometheus::PrometheusBuilder;

    fn fast_settings(rotation: Rotation) -> PoolSettings {
        PoolSettings {
            rotation,
            conflict_backoff: Duration::from_millis(1),
            max_conflict_retries: 32,
        }
    }

    fn pool_with(keys: &[&str]) -> (KeyPool, Arc<MemoryKeyStore>) {
        let store = Arc::new(MemoryKeyStore::with_keys(keys.iter().copied()));
        let pool = KeyPool::new(store.clone(), fast_settings(Rotation::RoundRobin));
        (pool, store)
    }

    async fn acquire_values(pool: &KeyPool, n: usize) -> Vec<String> {
        let mut out = Vec::new();
        for _ in 0..n {
            out.push(pool.acquire().await.unwrap().value);
        }
        out
    }

    #[tokio::test]
    async fn round_robin_visits_every_key_in_id_order_and_wraps() {
        let (pool, _) = pool_with(&["a", "b", "c"]);
        assert_eq!(
            acquire_values(&pool, 6).await,
            vec!["a", "b", "c", "a", "b", "c"]
        );
    }

    #[tokio::test]
    async fn round_robin_starts_after_the_stored_cursor() {
        let (pool, store) = pool_with(&["a", "b", "c"]);
        store.set_cursor(KeyId(1)).await.unwrap();
        assert_eq!(acquire_values(&pool, 3).await, vec!["b", "c", "a"]);
        assert_eq!(store.get_cursor().await.unwrap(), Some(KeyId(1)));
    }

    #[tokio::test]
    async fn acquire_stamps_strictly_increasing_last_used() {
        let (pool, _) = pool_with(&["only"]);
        let first = pool.acquire().await.unwrap();
        let second = pool.acquire().await.unwrap();
        assert!(first.last_used > 0);
        assert!(second.last_used > first.last_used);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_acquires_never_share_a_key_within_a_round() {
        let keys: Vec<String> = (0..8).map(|i| format!("key-{i}")).collect();
        let store = Arc::new(MemoryKeyStore::with_keys(&keys));
        let pool = Arc::new(KeyPool::new(store, fast_settings(Rotation::RoundRobin)));

        let mut handles = Vec::new();
        for _ in 0..keys.len() {
            let pool = pool.clone();
            handles.push(tokio::spawn(async move { pool.acquire().await.unwrap().id }));
        }

        let mut ids = Vec::new();
        for handle in handles {
            ids.push(handle.await.unwrap().0);
        }
        ids.sort_unstable();
        assert_eq!(ids, (1..=8).collect::<Vec<u64>>());
    }

    #[tokio::test]
    async fn quarantined_key_is_never_acquired_until_registered_again() {
        let (pool, _) = pool_with(&["a", "b"]);
        pool.quarantine("a").await.unwrap();
        assert_eq!(acquire_values(&pool, 4).await, vec!["b", "b", "b", "b"]);
        assert_eq!(pool.count().await.unwrap(), 1);
        assert!(!pool.validate("a").await.unwrap());

        let record = pool.register("a").await.unwrap();
        assert_eq!(record.value, "a");
        assert!(record.alive);
        assert!(pool.validate("a").await.unwrap());
        assert_eq!(pool.count().await.unwrap(), 2);

        let mut round = acquire_values(&pool, 2).await;
        round.sort();
        assert_eq!(round, vec!["a", "b"], "reactivated key is back in rotation");
    }

    #[tokio::test]
    async fn quarantine_is_idempotent_and_ignores_unknown_keys() {
        let (pool, _) = pool_with(&["a"]);
        pool.quarantine("a").await.unwrap();
        pool.quarantine("a").await.unwrap();
        pool.quarantine("never-seen").await.unwrap();
        assert_eq!(pool.count().await.unwrap(), 0);
        assert_eq!(pool.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn empty_or_fully_quarantined_pool_is_exhausted() {
        let (pool, _) = pool_with(&[]);
        assert!(matches!(pool.acquire().await, Err(Error::PoolExhausted)));

        let (pool, _) = pool_with(&["a"]);
        pool.quarantine("a").await.unwrap();
        assert!(matches!(pool.acquire().await, Err(Error::PoolExhausted)));
    }

    #[tokio::test]
    async fn register_inserts_unknown_key_unvalidated() {
        let (pool, _) = pool_with(&["a"]);
        let record = pool.register("new").await.unwrap();
        assert_eq!(record.value, "new");
        assert_eq!(record.last_used, 0);
        assert!(pool.validate("new").await.unwrap());
        assert_eq!(pool.count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn register_of_alive_key_defers_to_rotation() {
        let (pool, _) = pool_with(&["a", "b"]);
        let record = pool.register("b").await.unwrap();
        assert_eq!(record.value, "a", "alive keys go through acquire()");
    }

    #[tokio::test]
    async fn register_rejects_empty_key() {
        let (pool, _) = pool_with(&[]);
        assert!(matches!(
            pool.register("").await,
            Err(Error::InvalidKey(_))
        ));
    }

    #[tokio::test]
    async fn import_reports_outcome_and_leaves_rotation_alone() {
        let (pool, store) = pool_with(&["a"]);
        assert_eq!(pool.import("b").await.unwrap(), ImportOutcome::Inserted);
        assert_eq!(pool.import("b").await.unwrap(), ImportOutcome::AlreadyAlive);
        pool.quarantine("b").await.unwrap();
        assert_eq!(pool.import("b").await.unwrap(), ImportOutcome::Reactivated);
        assert_eq!(store.get_cursor().await.unwrap(), None);
        assert!(matches!(pool.import("").await, Err(Error::InvalidKey(_))));
    }

    #[tokio::test]
    async fn summary_counts_alive_and_quarantined() {
        let (pool, _) = pool_with(&["a", "b", "c"]);
        pool.quarantine("b").await.unwrap();
        assert_eq!(
            pool.summary().await.unwrap(),
            PoolSummary {
                keys_total: 3,
                keys_alive: 2,
                keys_quarantined: 1,
            }
        );
    }

    #[tokio::test]
    async fn least_recently_used_rotation_picks_oldest_key() {
        let store = Arc::new(MemoryKeyStore::with_keys(["a", "b", "c"]));
        for (id, last_used) in [(1, 300), (2, 100), (3, 200)] {
            assert!(
                store
                    .conditional_update_last_used(KeyId(id), 0, last_used)
                    .await
                    .unwrap()
            );
        }
        let pool = KeyPool::new(store.clone(), fast_settings(Rotation::LeastRecentlyUsed));
        assert_eq!(acquire_values(&pool, 3).await, vec!["b", "c", "a"]);
        assert_eq!(store.get_cursor().await.unwrap(), Some(KeyId(1)));
    }

    /// Store where one of the two claim writes always loses, as if another
    /// replica kept winning every round.
    struct Contended {
        inner: MemoryKeyStore,
        lose_cursor: bool,
        lose_stamp: bool,
    }

    impl Contended {
        fn new(keys: &[&str], lose_cursor: bool, lose_stamp: bool) -> Self {
            Self {
                inner: MemoryKeyStore::with_keys(keys.iter().copied()),
                lose_cursor,
                lose_stamp,
            }
        }
    }

    impl KeyStore for Contended {
        fn insert<'a>(&'a self, value: &'a str) -> StoreFuture<'a, KeyRecord> {
            self.inner.insert(value)
        }
        fn next_alive_after(&self, cursor: Option<KeyId>) -> StoreFuture<'_, Option<KeyRecord>> {
            self.inner.next_alive_after(cursor)
        }
        fn least_recently_used_alive(&self) -> StoreFuture<'_, Option<KeyRecord>> {
            self.inner.least_recently_used_alive()
        }
        fn conditional_update_last_used(
            &self,
            id: KeyId,
            expected_previous: u64,
            new_value: u64,
        ) -> StoreFuture<'_, bool> {
            if self.lose_stamp {
                return Box::pin(async { Ok(false) });
            }
            self.inner
                .conditional_update_last_used(id, expected_previous, new_value)
        }
        fn advance_cursor(&self, expected: Option<KeyId>, next: KeyId) -> StoreFuture<'_, bool> {
            if self.lose_cursor {
                return Box::pin(async { Ok(false) });
            }
            self.inner.advance_cursor(expected, next)
        }
        fn set_alive<'a>(&'a self, value: &'a str, alive: bool) -> StoreFuture<'a, bool> {
            self.inner.set_alive(value, alive)
        }
        fn find_by_value<'a>(&'a self, value: &'a str) -> StoreFuture<'a, Option<KeyRecord>> {
            self.inner.find_by_value(value)
        }
        fn count_alive(&self) -> StoreFuture<'_, usize> {
            self.inner.count_alive()
        }
        fn list(&self) -> StoreFuture<'_, Vec<KeyRecord>> {
            self.inner.list()
        }
        fn get_cursor(&self) -> StoreFuture<'_, Option<KeyId>> {
            self.inner.get_cursor()
        }
        fn set_cursor(&self, id: KeyId) -> StoreFuture<'_, ()> {
            self.inner.set_cursor(id)
        }
    }

    #[tokio::test]
    async fn repeated_conflicts_surface_as_contention() {
        let store = Arc::new(Contended::new(&["a"], true, false));
        let pool = KeyPool::new(
            store,
            PoolSettings {
                rotation: Rotation::RoundRobin,
                conflict_backoff: Duration::from_millis(1),
                max_conflict_retries: 3,
            },
        );
        assert!(matches!(pool.acquire().await, Err(Error::Contention(3))));
    }

    #[tokio::test]
    async fn lost_stamp_hands_the_cursor_back() {
        let store = Arc::new(Contended::new(&["a", "b", "c"], false, true));
        store.set_cursor(KeyId(1)).await.unwrap();
        let pool = KeyPool::new(
            store.clone(),
            PoolSettings {
                rotation: Rotation::RoundRobin,
                conflict_backoff: Duration::from_millis(1),
                max_conflict_retries: 3,
            },
        );

        assert!(matches!(pool.acquire().await, Err(Error::Contention(3))));
        assert_eq!(
            store.get_cursor().await.unwrap(),
            Some(KeyId(1)),
            "no key was issued, so no slot is skipped"
        );
    }

    #[tokio::test]
    async fn pool_counters_are_recorded() {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        let _guard = metrics::set_default_local_recorder(&recorder);

        let (pool, _) = pool_with(&["a"]);
        pool.import("b").await.unwrap();
        pool.quarantine("a").await.unwrap();

        let output = handle.render();
        assert!(output.contains("key_pool_quarantined_total"), "got: {output}");
        assert!(output.contains("outcome=\"inserted\""), "got: {output}");
    }
}
