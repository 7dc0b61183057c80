//! In-memory object store
//!
//! Backs the embedded device API when no external key-value cluster is
//! configured. Versioned JSON objects live under hierarchical path keys
//! (`/<resource>/<name>`); a store-global revision counter is bumped on
//! every write and doubles as the per-object revision. All writes serialize
//! under a single mutex, so watchers observe events in write order.
//!
//! Watch notification is non-blocking: a watcher whose buffer is full is
//! disconnected and receives a terminal `Overflowed` event.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};

/// Default per-watcher event buffer.
const DEFAULT_WATCH_CAPACITY: usize = 64;

/// Sentinel store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("key already exists: {0}")]
    AlreadyExists(String),

    #[error("key not found: {0}")]
    NotFound(String),

    #[error("revision conflict on {key}: read {read}, current {current}")]
    Conflict { key: String, read: u64, current: u64 },
}

impl StoreError {
    pub fn is_already_exists(&self) -> bool {
        matches!(self, StoreError::AlreadyExists(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }
}

/// Error from `guaranteed_update`: either a store failure or one raised by
/// the caller's mutator.
#[derive(Debug, Error)]
pub enum UpdateError<E> {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("mutator: {0}")]
    Mutator(E),
}

/// A stored value plus the revision of the write that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct RawObject {
    pub value: Value,
    pub revision: u64,
}

/// Store statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreStats {
    pub object_count: usize,
}

/// Prefix listing result: every matching entry plus the store revision the
/// listing was taken at.
#[derive(Debug, Clone)]
pub struct ListResult {
    pub items: Vec<(String, RawObject)>,
    pub revision: u64,
}

/// Change notification delivered to watchers, in write serialization order.
#[derive(Debug, Clone)]
pub enum WatchEvent {
    Added { key: String, object: RawObject },
    Modified { key: String, object: RawObject },
    Deleted { key: String, object: RawObject },
    /// Terminal: this watcher fell behind and was disconnected. Re-list and
    /// re-watch to recover.
    Overflowed,
}

impl WatchEvent {
    pub fn key(&self) -> Option<&str> {
        match self {
            WatchEvent::Added { key, .. }
            | WatchEvent::Modified { key, .. }
            | WatchEvent::Deleted { key, .. } => Some(key),
            WatchEvent::Overflowed => None,
        }
    }

    pub fn object(&self) -> Option<&RawObject> {
        match self {
            WatchEvent::Added { object, .. }
            | WatchEvent::Modified { object, .. }
            | WatchEvent::Deleted { object, .. } => Some(object),
            WatchEvent::Overflowed => None,
        }
    }
}

struct Watcher {
    prefix: String,
    tx: mpsc::Sender<WatchEvent>,
    overflowed: Arc<AtomicBool>,
}

/// Receiving side of a prefix watch. Dropping the handle cancels the watch;
/// the store prunes the dead sender on its next write to the prefix.
pub struct WatchHandle {
    rx: mpsc::Receiver<WatchEvent>,
    overflowed: Arc<AtomicBool>,
    done: bool,
}

impl WatchHandle {
    /// Next event, or None once the watch has ended. A watcher that was
    /// disconnected for falling behind sees a final `Overflowed` event.
    pub async fn recv(&mut self) -> Option<WatchEvent> {
        if self.done {
            return None;
        }

        match self.rx.recv().await {
            Some(event) => Some(event),
            None => {
                self.done = true;
                if self.overflowed.load(Ordering::SeqCst) {
                    Some(WatchEvent::Overflowed)
                } else {
                    None
                }
            }
        }
    }
}

struct StoreInner {
    objects: BTreeMap<String, RawObject>,
    revision: u64,
    watchers: Vec<Watcher>,
}

impl StoreInner {
    fn notify(&mut self, key: &str, event: &WatchEvent) {
        self.watchers.retain(|w| {
            if !key.starts_with(&w.prefix) {
                return true;
            }

            match w.tx.try_send(event.clone()) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    warn!(prefix = %w.prefix, "watcher buffer full, disconnecting");
                    w.overflowed.store(true, Ordering::SeqCst);
                    false
                }
                Err(TrySendError::Closed(_)) => false,
            }
        });
    }
}

/// The in-memory object store.
pub struct MemoryStore {
    inner: Mutex<StoreInner>,
    watch_capacity: usize,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_watch_capacity(DEFAULT_WATCH_CAPACITY)
    }

    /// Mostly for tests exercising the overflow path.
    pub fn with_watch_capacity(watch_capacity: usize) -> Self {
        Self {
            inner: Mutex::new(StoreInner {
                objects: BTreeMap::new(),
                revision: 0,
                watchers: Vec::new(),
            }),
            watch_capacity,
        }
    }

    fn lock(&self) -> MutexGuard<'_, StoreInner> {
        // The store never panics while holding the lock; treat poisoning as
        // unreachable rather than propagating it through every caller.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Store a new object. Fails with `AlreadyExists` if the key is present.
    pub fn create(&self, key: &str, value: Value) -> Result<RawObject, StoreError> {
        let mut inner = self.lock();

        if inner.objects.contains_key(key) {
            return Err(StoreError::AlreadyExists(key.to_string()));
        }

        inner.revision += 1;
        let object = RawObject {
            value,
            revision: inner.revision,
        };
        inner.objects.insert(key.to_string(), object.clone());
        inner.notify(
            key,
            &WatchEvent::Added {
                key: key.to_string(),
                object: object.clone(),
            },
        );

        Ok(object)
    }

    /// Fetch one object. Fails with `NotFound` if absent.
    pub fn get(&self, key: &str) -> Result<RawObject, StoreError> {
        self.lock()
            .objects
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(key.to_string()))
    }

    /// All entries whose key starts with `prefix`, plus the current store
    /// revision as the list revision.
    pub fn get_list(&self, prefix: &str) -> ListResult {
        let inner = self.lock();
        let items = inner
            .objects
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        ListResult {
            items,
            revision: inner.revision,
        }
    }

    /// Read-modify-write with optimistic concurrency.
    ///
    /// The mutator runs outside the store lock against a snapshot; if another
    /// writer lands in between, the write is abandoned and the mutator re-runs
    /// against the fresh object (the caller observes the conflict as a re-run
    /// with a higher input revision). A mutator result equal to the current
    /// value performs no write and returns success.
    ///
    /// With `ignore_not_found`, a missing key returns `Ok(None)` instead of
    /// `NotFound`.
    pub fn guaranteed_update<F, E>(
        &self,
        key: &str,
        ignore_not_found: bool,
        mut mutator: F,
    ) -> Result<Option<RawObject>, UpdateError<E>>
    where
        F: FnMut(&RawObject) -> Result<Value, E>,
    {
        loop {
            let snapshot = {
                let inner = self.lock();
                match inner.objects.get(key) {
                    Some(o) => o.clone(),
                    None if ignore_not_found => return Ok(None),
                    None => return Err(StoreError::NotFound(key.to_string()).into()),
                }
            };

            let mutated = mutator(&snapshot).map_err(UpdateError::Mutator)?;

            let mut inner = self.lock();
            let current_revision = match inner.objects.get(key) {
                Some(o) => o.revision,
                None if ignore_not_found => return Ok(None),
                None => return Err(StoreError::NotFound(key.to_string()).into()),
            };

            if current_revision != snapshot.revision {
                debug!(
                    key,
                    read = snapshot.revision,
                    current = current_revision,
                    "update conflict, re-reading"
                );
                continue;
            }

            if mutated == snapshot.value {
                return Ok(Some(snapshot));
            }

            inner.revision += 1;
            let object = RawObject {
                value: mutated,
                revision: inner.revision,
            };
            inner.objects.insert(key.to_string(), object.clone());
            inner.notify(
                key,
                &WatchEvent::Modified {
                    key: key.to_string(),
                    object: object.clone(),
                },
            );

            return Ok(Some(object));
        }
    }

    /// Single-shot compare-and-swap: replace the object only if its
    /// revision still matches what the caller read. This is the primitive
    /// the device API maps stale-revision writes onto; `guaranteed_update`
    /// wraps the same check in a re-read loop.
    pub fn update(
        &self,
        key: &str,
        expected_revision: u64,
        value: Value,
    ) -> Result<RawObject, StoreError> {
        let mut inner = self.lock();

        let current_revision = inner
            .objects
            .get(key)
            .map(|o| o.revision)
            .ok_or_else(|| StoreError::NotFound(key.to_string()))?;

        if current_revision != expected_revision {
            return Err(StoreError::Conflict {
                key: key.to_string(),
                read: expected_revision,
                current: current_revision,
            });
        }

        inner.revision += 1;
        let object = RawObject {
            value,
            revision: inner.revision,
        };
        inner.objects.insert(key.to_string(), object.clone());
        inner.notify(
            key,
            &WatchEvent::Modified {
                key: key.to_string(),
                object: object.clone(),
            },
        );

        Ok(object)
    }

    /// Remove an object, returning the deleted value. Fails with `NotFound`
    /// if absent.
    pub fn delete(&self, key: &str) -> Result<RawObject, StoreError> {
        let mut inner = self.lock();

        let object = inner
            .objects
            .remove(key)
            .ok_or_else(|| StoreError::NotFound(key.to_string()))?;

        inner.revision += 1;
        inner.notify(
            key,
            &WatchEvent::Deleted {
                key: key.to_string(),
                object: object.clone(),
            },
        );

        Ok(object)
    }

    /// Watch all writes under `prefix` that happen after this call.
    pub fn watch(&self, prefix: &str) -> WatchHandle {
        let (tx, rx) = mpsc::channel(self.watch_capacity);
        let overflowed = Arc::new(AtomicBool::new(false));

        self.lock().watchers.push(Watcher {
            prefix: prefix.to_string(),
            tx,
            overflowed: overflowed.clone(),
        });

        WatchHandle {
            rx,
            overflowed,
            done: false,
        }
    }

    pub fn stats(&self) -> StoreStats {
        StoreStats {
            object_count: self.lock().objects.len(),
        }
    }

    /// Current store-global revision.
    pub fn current_revision(&self) -> u64 {
        self.lock().revision
    }
}
