//! JSON-file key store
//!
//! Holds the whole pool in memory behind a tokio Mutex and rewrites the file
//! after every mutation that changed state. Writes use temp-file + rename so
//! a crash mid-write leaves the previous file intact.
//!
//! The mutex makes conditional writes atomic within one process. Replicas
//! sharing a pool need a store with real conditional updates; this backend is
//! for single-instance deployments.

use std::path::{Path, PathBuf};

use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::record::{KeyId, KeyRecord};
use crate::state::{PoolState, Snapshot};
use crate::store::{KeyStore, StoreFuture};

/// File-backed `KeyStore`.
pub struct FileKeyStore {
    path: PathBuf,
    state: Mutex<PoolState>,
}

impl FileKeyStore {
    /// Load the pool from `path`.
    ///
    /// A missing file is a cold start: the store begins empty and writes an
    /// empty snapshot so later loads take the normal path.
    pub async fn load(path: PathBuf) -> Result<Self> {
        let state = if path.exists() {
            let contents = tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| Error::Io(format!("reading key file: {e}")))?;
            let snapshot: Snapshot = serde_json::from_str(&contents)
                .map_err(|e| Error::Parse(format!("parsing key file: {e}")))?;
            let state = PoolState::from_snapshot(snapshot)?;
            info!(
                path = %path.display(),
                keys = state.list().len(),
                keys_alive = state.count_alive(),
                "loaded key store"
            );
            state
        } else {
            info!(path = %path.display(), "key file not found, starting with empty store");
            let state = PoolState::default();
            write_atomic(&path, &state.snapshot()).await?;
            state
        };

        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Apply `change` to a copy of the state and persist it when the change
    /// reports it modified something. Memory is updated only after the write
    /// succeeds.
    async fn commit<T>(
        &self,
        change: impl FnOnce(&mut PoolState) -> Result<(T, bool)>,
    ) -> Result<T> {
        let mut state = self.state.lock().await;
        let mut next = state.clone();
        let (out, changed) = change(&mut next)?;
        if changed {
            write_atomic(&self.path, &next.snapshot()).await?;
            *state = next;
        }
        Ok(out)
    }
}

impl KeyStore for FileKeyStore {
    fn insert<'a>(&'a self, value: &'a str) -> StoreFuture<'a, KeyRecord> {
        Box::pin(self.commit(move |state| Ok((state.insert(value)?, true))))
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
        Box::pin(self.commit(move |state| {
            let updated = state.conditional_update_last_used(id, expected_previous, new_value);
            Ok((updated, updated))
        }))
    }

    fn advance_cursor(&self, expected: Option<KeyId>, next: KeyId) -> StoreFuture<'_, bool> {
        Box::pin(self.commit(move |state| {
            let moved = state.advance_cursor(expected, next);
            Ok((moved, moved))
        }))
    }

    fn set_alive<'a>(&'a self, value: &'a str, alive: bool) -> StoreFuture<'a, bool> {
        Box::pin(self.commit(move |state| Ok(state.set_alive(value, alive))))
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
        Box::pin(self.commit(move |state| {
            state.set_cursor(id);
            Ok(((), true))
        }))
    }
}

/// Write the snapshot to `path` via a sibling temp file and rename.
///
/// The file holds raw API keys, so permissions are 0600 on unix.
async fn write_atomic(path: &Path, snapshot: &Snapshot) -> Result<()> {
    let json = serde_json::to_string_pretty(snapshot)
        .map_err(|e| Error::Parse(format!("serializing key file: {e}")))?;

    let dir = path
        .parent()
        .ok_or_else(|| Error::Io("key file path has no parent directory".into()))?;

    let tmp_path = dir.join(format!(".keys.tmp.{}", std::process::id()));

    tokio::fs::write(&tmp_path, json.as_bytes())
        .await
        .map_err(|e| Error::Io(format!("writing temp key file: {e}")))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        tokio::fs::set_permissions(&tmp_path, perms)
            .await
            .map_err(|e| Error::Io(format!("setting key file permissions: {e}")))?;
    }

    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|e| Error::Io(format!("renaming temp key file: {e}")))?;

    debug!(path = %path.display(), "persisted key store");
    Ok(())
}
