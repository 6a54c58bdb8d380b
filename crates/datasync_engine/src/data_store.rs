//! Typed, asynchronous access to synchronized records.

use crate::engine::EngineHandle;
use crate::error::{SyncError, SyncResult};
use crate::local_store::LocalStore;
use datasync_protocol::{from_cbor, to_cbor, ObjectKey};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

/// An application type stored and synchronized by a [`DataStore`].
///
/// Values are encoded as CBOR; `TYPE_NAME` and `key()` together form the
/// record's identity on every device.
///
/// ```rust,ignore
/// #[derive(Serialize, Deserialize)]
/// struct Todo { id: String, title: String }
///
/// impl SyncObject for Todo {
///     const TYPE_NAME: &'static str = "Todo";
///     fn key(&self) -> String { self.id.clone() }
/// }
/// ```
pub trait SyncObject: Serialize + DeserializeOwned + Send + 'static {
    /// Type name shared by every record of this type.
    const TYPE_NAME: &'static str;

    /// Identifier, unique within the type.
    fn key(&self) -> String;
}

/// Counts running store operations so shutdown can wait for them.
#[derive(Default)]
pub(crate) struct OpTracker {
    active: AtomicUsize,
    closed: AtomicBool,
    idle: Notify,
}

struct OpGuard(Arc<OpTracker>);

impl Drop for OpGuard {
    fn drop(&mut self) {
        if self.0.active.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}

impl OpTracker {
    fn begin(self: &Arc<Self>) -> SyncResult<OpGuard> {
        self.active.fetch_add(1, Ordering::SeqCst);
        let guard = OpGuard(Arc::clone(self));
        if self.closed.load(Ordering::SeqCst) {
            return Err(SyncError::ShutDown);
        }
        Ok(guard)
    }

    /// Rejects new operations and waits for running ones to finish.
    pub(crate) async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        loop {
            let idle = self.idle.notified();
            if self.active.load(Ordering::SeqCst) == 0 {
                return;
            }
            idle.await;
        }
    }
}

/// Asynchronous store of [`SyncObject`]s.
///
/// Each operation runs on the blocking pool and resolves when the local
/// store has finished; writes then wake the engine to upload.
#[derive(Clone)]
pub struct DataStore {
    store: Arc<LocalStore>,
    engine: EngineHandle,
    ops: Arc<OpTracker>,
}

impl DataStore {
    pub(crate) fn new(store: Arc<LocalStore>, engine: EngineHandle, ops: Arc<OpTracker>) -> Self {
        Self { store, engine, ops }
    }

    /// Saves `object`, returning its new version.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding or the local write fails, or after
    /// the manager is finalized.
    pub async fn save<T: SyncObject>(&self, object: &T) -> SyncResult<u64> {
        let key = ObjectKey::new(T::TYPE_NAME, object.key());
        let value = to_cbor(object).map_err(|e| SyncError::Codec(e.to_string()))?;
        let record = self.run(move |store| store.save(&key, value)).await?;
        self.engine.notify_local_change();
        Ok(record.version)
    }

    /// Loads the object stored under `key`.
    ///
    /// # Errors
    ///
    /// Returns an error if the read or decoding fails.
    pub async fn load<T: SyncObject>(&self, key: impl Into<String>) -> SyncResult<Option<T>> {
        let key = ObjectKey::new(T::TYPE_NAME, key);
        self.run(move |store| store.load(&key))
            .await?
            .map(|bytes| decode(&bytes))
            .transpose()
    }

    /// Removes the object stored under `key`. Returns false if there was none.
    ///
    /// # Errors
    ///
    /// Returns an error if the local write fails.
    pub async fn remove<T: SyncObject>(&self, key: impl Into<String>) -> SyncResult<bool> {
        let key = ObjectKey::new(T::TYPE_NAME, key);
        let removed = self.run(move |store| store.remove(&key)).await?;
        if removed {
            self.engine.notify_local_change();
        }
        Ok(removed)
    }

    /// Loads every live object of type `T`, ordered by key.
    ///
    /// # Errors
    ///
    /// Returns an error if the read or decoding fails.
    pub async fn load_all<T: SyncObject>(&self) -> SyncResult<Vec<T>> {
        let values = self
            .run(|store| store.load_all(T::TYPE_NAME.as_bytes()))
            .await?;
        values.iter().map(|bytes| decode(bytes)).collect()
    }

    /// Keys of every live object of type `T`.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails.
    pub async fn keys<T: SyncObject>(&self) -> SyncResult<Vec<String>> {
        self.run(|store| store.keys(T::TYPE_NAME.as_bytes())).await
    }

    /// Number of live objects of type `T`.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails.
    pub async fn count<T: SyncObject>(&self) -> SyncResult<usize> {
        self.run(|store| store.count(T::TYPE_NAME.as_bytes())).await
    }

    /// Marks every object of type `T` for upload again, for example after
    /// the server lost its data. Returns the number of records marked.
    ///
    /// # Errors
    ///
    /// Returns an error if the change log cannot be written.
    pub async fn resync<T: SyncObject>(&self) -> SyncResult<usize> {
        let marked = self
            .run(|store| store.resync(T::TYPE_NAME.as_bytes()))
            .await?;
        if marked > 0 {
            self.engine.notify_local_change();
        }
        Ok(marked)
    }

    async fn run<R, F>(&self, f: F) -> SyncResult<R>
    where
        R: Send + 'static,
        F: FnOnce(&LocalStore) -> SyncResult<R> + Send + 'static,
    {
        let guard = self.ops.begin()?;
        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || {
            let _guard = guard;
            f(&store)
        })
        .await
        .map_err(|e| SyncError::Cancelled(e.to_string()))?
    }
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> SyncResult<T> {
    from_cbor(bytes).map_err(|e| SyncError::Codec(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn close_waits_for_running_operations() {
        let tracker = Arc::new(OpTracker::default());
        let guard = tracker.begin().unwrap();

        let closing = {
            let tracker = Arc::clone(&tracker);
            tokio::spawn(async move { tracker.close().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!closing.is_finished());
        assert!(matches!(tracker.begin(), Err(SyncError::ShutDown)));

        drop(guard);
        tokio::time::timeout(Duration::from_secs(1), closing)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn close_without_operations_returns() {
        let tracker = Arc::new(OpTracker::default());
        tracker.close().await;
        tracker.close().await;
    }
}
