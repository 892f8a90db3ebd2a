//! Contract tests run against every backend.

use std::sync::Arc;

use crate::error::Error;
use crate::record::KeyId;
use crate::store::KeyStore;
use crate::{FileKeyStore, MemoryKeyStore};

async fn backends() -> Vec<(&'static str, Arc<dyn KeyStore>, Option<tempfile::TempDir>)> {
    let dir = tempfile::tempdir().unwrap();
    let file = FileKeyStore::load(dir.path().join("keys.json"))
        .await
        .unwrap();
    vec![
        ("memory", Arc::new(MemoryKeyStore::new()), None),
        ("file", Arc::new(file), Some(dir)),
    ]
}

#[tokio::test]
async fn insert_assigns_increasing_ids_and_rejects_duplicates() {
    for (name, store, _dir) in backends().await {
        let a = store.insert("a").await.unwrap();
        let b = store.insert("b").await.unwrap();
        assert!(a.id < b.id, "{name}");
        assert!(a.alive && a.last_used == 0, "{name}");

        let dup = store.insert("a").await;
        assert!(matches!(dup, Err(Error::Conflict(_))), "{name}");
        assert_eq!(store.list().await.unwrap().len(), 2, "{name}");
    }
}

#[tokio::test]
async fn next_alive_after_wraps_only_when_asked_from_start() {
    for (name, store, _dir) in backends().await {
        let a = store.insert("a").await.unwrap();
        let b = store.insert("b").await.unwrap();
        let c = store.insert("c").await.unwrap();

        let first = store.next_alive_after(None).await.unwrap().unwrap();
        assert_eq!(first.id, a.id, "{name}");
        let after_a = store.next_alive_after(Some(a.id)).await.unwrap().unwrap();
        assert_eq!(after_a.id, b.id, "{name}");
        assert!(
            store.next_alive_after(Some(c.id)).await.unwrap().is_none(),
            "{name}"
        );

        store.set_alive("b", false).await.unwrap();
        let skip = store.next_alive_after(Some(a.id)).await.unwrap().unwrap();
        assert_eq!(skip.id, c.id, "{name}: dead keys are skipped");
    }
}

#[tokio::test]
async fn next_alive_after_accepts_a_cursor_pointing_at_a_dead_key() {
    for (name, store, _dir) in backends().await {
        store.insert("a").await.unwrap();
        let b = store.insert("b").await.unwrap();
        let c = store.insert("c").await.unwrap();
        store.set_alive("b", false).await.unwrap();

        let next = store.next_alive_after(Some(b.id)).await.unwrap().unwrap();
        assert_eq!(next.id, c.id, "{name}");
    }
}

#[tokio::test]
async fn conditional_update_only_applies_on_matching_version() {
    for (name, store, _dir) in backends().await {
        let a = store.insert("a").await.unwrap();

        assert!(
            store.conditional_update_last_used(a.id, 0, 10).await.unwrap(),
            "{name}"
        );
        assert!(
            !store.conditional_update_last_used(a.id, 0, 20).await.unwrap(),
            "{name}: stale version must lose"
        );
        assert!(
            !store
                .conditional_update_last_used(KeyId(999), 0, 20)
                .await
                .unwrap(),
            "{name}: unknown id"
        );
        let a = store.find_by_value("a").await.unwrap().unwrap();
        assert_eq!(a.last_used, 10, "{name}");
    }
}

#[tokio::test]
async fn advance_cursor_is_compare_and_set() {
    for (name, store, _dir) in backends().await {
        let a = store.insert("a").await.unwrap();
        let b = store.insert("b").await.unwrap();

        assert_eq!(store.get_cursor().await.unwrap(), None, "{name}");
        assert!(store.advance_cursor(None, a.id).await.unwrap(), "{name}");
        assert!(
            !store.advance_cursor(None, b.id).await.unwrap(),
            "{name}: second claimant with a stale cursor loses"
        );
        assert!(store.advance_cursor(Some(a.id), b.id).await.unwrap(), "{name}");
        assert_eq!(store.get_cursor().await.unwrap(), Some(b.id), "{name}");

        store.set_cursor(a.id).await.unwrap();
        assert_eq!(store.get_cursor().await.unwrap(), Some(a.id), "{name}");
    }
}

#[tokio::test]
async fn least_recently_used_prefers_oldest_then_lowest_id() {
    for (name, store, _dir) in backends().await {
        let a = store.insert("a").await.unwrap();
        let b = store.insert("b").await.unwrap();

        let lru = store.least_recently_used_alive().await.unwrap().unwrap();
        assert_eq!(lru.id, a.id, "{name}: tie broken by id");

        store.conditional_update_last_used(a.id, 0, 5).await.unwrap();
        let lru = store.least_recently_used_alive().await.unwrap().unwrap();
        assert_eq!(lru.id, b.id, "{name}");

        store.set_alive("b", false).await.unwrap();
        let lru = store.least_recently_used_alive().await.unwrap().unwrap();
        assert_eq!(lru.id, a.id, "{name}: dead keys are never chosen");
    }
}

#[tokio::test]
async fn set_alive_and_count() {
    for (name, store, _dir) in backends().await {
        store.insert("a").await.unwrap();
        store.insert("b").await.unwrap();
        assert_eq!(store.count_alive().await.unwrap(), 2, "{name}");

        assert!(store.set_alive("a", false).await.unwrap(), "{name}");
        assert_eq!(store.count_alive().await.unwrap(), 1, "{name}");
        assert!(store.set_alive("a", true).await.unwrap(), "{name}");
        assert_eq!(store.count_alive().await.unwrap(), 2, "{name}");

        assert!(!store.set_alive("nope", false).await.unwrap(), "{name}");
        assert!(store.find_by_value("nope").await.unwrap().is_none(), "{name}");
    }
}

#[tokio::test]
async fn empty_store_has_no_candidates() {
    for (name, store, _dir) in backends().await {
        assert!(store.next_alive_after(None).await.unwrap().is_none(), "{name}");
        assert!(
            store.least_recently_used_alive().await.unwrap().is_none(),
            "{name}"
        );
        assert_eq!(store.count_alive().await.unwrap(), 0, "{name}");
    }
}
