//! Local Cache: namespaced JSON values over a persistent key/value store.
//!
//! Reads are served from an in-memory mirror and fall through to the store on
//! a miss. Writes land in the mirror first; before [`LocalCache::init`] has
//! loaded the store they are queued and flushed afterwards. Same-process
//! consumers can subscribe to changes with [`LocalCache::on_change`].

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::db::{Database, StorageError};

pub const KEY_PREFIX: &str = "fitlog:";

/// Unprefixed key prefixes that the quota cleanup pass may evict.
pub const TRANSIENT_PREFIXES: &[&str] = &["log", "temp", "tmp", "cache"];

/// Platform byte store underneath the cache. Keys passed here are already
/// namespaced.
pub trait KeyValueStore: Send {
    fn read(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;
    fn write(&self, key: &str, value: &[u8]) -> Result<(), StorageError>;
    fn erase(&self, key: &str) -> Result<bool, StorageError>;
    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StorageError>;
}

impl KeyValueStore for Database {
    fn read(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        self.kv_get(key)
    }

    fn write(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        self.kv_put(key, value)
    }

    fn erase(&self, key: &str) -> Result<bool, StorageError> {
        self.kv_delete(key)
    }

    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        self.kv_keys(prefix)
    }
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("could not persist '{key}'")]
    Persist { key: String, source: StorageError },

    #[error("could not encode '{key}'")]
    Encode {
        key: String,
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

pub type ChangeHandler = Arc<dyn Fn(&str, Option<&Value>) + Send + Sync>;

struct Listener {
    id: SubscriptionId,
    key: String,
    handler: ChangeHandler,
}

#[derive(Default)]
struct CacheState {
    /// `None` records a key known to be absent.
    memory: HashMap<String, Option<Value>>,
    /// Keys written before init, in arrival order.
    pending: Vec<String>,
    initialized: bool,
}

pub struct LocalCache {
    store: Mutex<Box<dyn KeyValueStore>>,
    state: Mutex<CacheState>,
    listeners: Mutex<Vec<Listener>>,
    next_subscription: AtomicU64,
}

fn storage_key(key: &str) -> String {
    format!("{KEY_PREFIX}{key}")
}

fn is_transient(key: &str) -> bool {
    TRANSIENT_PREFIXES
        .iter()
        .any(|prefix| key.starts_with(prefix))
}

impl LocalCache {
    pub fn new(store: impl KeyValueStore + 'static) -> Self {
        Self {
            store: Mutex::new(Box::new(store)),
            state: Mutex::new(CacheState::default()),
            listeners: Mutex::new(Vec::new()),
            next_subscription: AtomicU64::new(1),
        }
    }

    // The state and store locks are never held at the same time.
    fn lock_state(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_store(&self) -> MutexGuard<'_, Box<dyn KeyValueStore>> {
        self.store.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Load every namespaced key into memory and flush writes queued before
    /// startup. Returns the number of keys loaded; a repeated call does
    /// nothing and returns 0.
    pub fn init(&self) -> usize {
        if self.is_initialized() {
            return 0;
        }

        let stored = match self.lock_store().keys_with_prefix(KEY_PREFIX) {
            Ok(keys) => keys,
            Err(e) => {
                warn!(error = %e, "could not list cached keys; starting empty");
                Vec::new()
            }
        };

        let mut loaded = Vec::with_capacity(stored.len());
        for full_key in stored {
            let Some(key) = full_key.strip_prefix(KEY_PREFIX) else {
                continue;
            };
            if let Some(value) = self.read_store(key) {
                loaded.push((key.to_string(), value));
            }
        }
        let loaded_count = loaded.len();

        let pending = {
            let mut state = self.lock_state();
            if state.initialized {
                return 0;
            }
            for (key, value) in loaded {
                // Values written before init are newer than what was stored.
                state.memory.entry(key).or_insert(Some(value));
            }
            state.initialized = true;
            std::mem::take(&mut state.pending)
        };

        let flushed = self.flush(pending);
        info!(loaded = loaded_count, flushed, "local cache initialized");
        loaded_count
    }

    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.lock_state().initialized
    }

    /// Persist queued keys once each, in order of their last write, using the
    /// value currently in memory.
    fn flush(&self, pending: Vec<String>) -> usize {
        let mut last_write: HashMap<&str, usize> = HashMap::new();
        for (i, key) in pending.iter().enumerate() {
            last_write.insert(key.as_str(), i);
        }
        let mut order: Vec<(usize, &str)> = last_write.into_iter().map(|(k, i)| (i, k)).collect();
        order.sort_unstable();

        let mut flushed = 0;
        for (_, key) in order {
            let current = self.lock_state().memory.get(key).cloned().flatten();
            match current {
                Some(value) => {
                    if let Err(e) = self.persist_value(key, &value) {
                        warn!(key, error = %e, "queued write could not be persisted");
                        continue;
                    }
                }
                None => self.erase_store(key),
            }
            flushed += 1;
        }
        flushed
    }

    // --- Reads ---

    /// Typed read. Returns `default` when the key is absent, unreadable or
    /// does not decode as `T`.
    pub fn get<T: DeserializeOwned>(&self, key: &str, default: T) -> T {
        match self.get_value(key) {
            Some(value) => match serde_json::from_value(value) {
                Ok(parsed) => parsed,
                Err(e) => {
                    debug!(key, error = %e, "cached value has unexpected shape");
                    default
                }
            },
            None => default,
        }
    }

    pub fn get_or_default<T: DeserializeOwned + Default>(&self, key: &str) -> T {
        self.get(key, T::default())
    }

    /// Raw JSON read with the same fall-through rules as [`Self::get`].
    pub fn get_value(&self, key: &str) -> Option<Value> {
        if let Some(entry) = self.lock_state().memory.get(key) {
            return entry.clone();
        }
        let loaded = self.read_store(key);
        self.lock_state()
            .memory
            .entry(key.to_string())
            .or_insert(loaded)
            .clone()
    }

    pub fn has(&self, key: &str) -> bool {
        self.get_value(key).is_some()
    }

    /// Every key present in the store or in memory, unprefixed and sorted.
    pub fn list_keys(&self) -> Vec<String> {
        let mut keys: BTreeSet<String> = match self.lock_store().keys_with_prefix(KEY_PREFIX) {
            Ok(stored) => stored
                .iter()
                .filter_map(|k| k.strip_prefix(KEY_PREFIX))
                .map(str::to_string)
                .collect(),
            Err(e) => {
                warn!(error = %e, "could not list cached keys");
                BTreeSet::new()
            }
        };

        let state = self.lock_state();
        for (key, entry) in &state.memory {
            if entry.is_some() {
                keys.insert(key.clone());
            } else {
                keys.remove(key);
            }
        }
        keys.into_iter().collect()
    }

    fn read_store(&self, key: &str) -> Option<Value> {
        let result = self.lock_store().read(&storage_key(key));
        match result {
            Ok(Some(bytes)) => match serde_json::from_slice(&bytes) {
                Ok(value) => Some(value),
                Err(e) => {
                    warn!(key, error = %e, "ignoring unparsable cached value");
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                warn!(key, error = %e, "cache read failed; treating as absent");
                None
            }
        }
    }

    // --- Writes ---

    /// Store `value` under `key`. Memory is updated before anything else, so a
    /// following `get` sees the new value even if persisting fails. Only a
    /// write that still does not fit after the cleanup pass is an error.
    pub fn set<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<(), CacheError> {
        let value = serde_json::to_value(value).map_err(|source| CacheError::Encode {
            key: key.to_string(),
            source,
        })?;

        let queued = {
            let mut state = self.lock_state();
            state.memory.insert(key.to_string(), Some(value.clone()));
            if state.initialized {
                false
            } else {
                state.pending.push(key.to_string());
                true
            }
        };

        let result = if queued {
            debug!(key, "cache not initialized; write queued");
            Ok(())
        } else {
            self.persist_value(key, &value)
        };

        self.notify(key, Some(&value));
        result
    }

    pub fn remove(&self, key: &str) {
        let queued = {
            let mut state = self.lock_state();
            state.memory.insert(key.to_string(), None);
            if state.initialized {
                false
            } else {
                state.pending.push(key.to_string());
                true
            }
        };
        if !queued {
            self.erase_store(key);
        }
        self.notify(key, None);
    }

    fn erase_store(&self, key: &str) {
        if let Err(e) = self.lock_store().erase(&storage_key(key)) {
            warn!(key, error = %e, "cache delete failed; removed from memory only");
        }
    }

    fn persist_value(&self, key: &str, value: &Value) -> Result<(), CacheError> {
        let bytes = serde_json::to_vec(value).map_err(|source| CacheError::Encode {
            key: key.to_string(),
            source,
        })?;
        let full_key = storage_key(key);

        let evicted = {
            let store = self.lock_store();
            match store.write(&full_key, &bytes) {
                Ok(()) => return Ok(()),
                Err(StorageError::QuotaExceeded { needed, limit }) => {
                    warn!(key, needed, limit, "storage full; evicting transient keys");
                    let evicted = evict_transient(&**store, &full_key);
                    if let Err(source) = store.write(&full_key, &bytes) {
                        drop(store);
                        self.forget(&evicted);
                        return Err(CacheError::Persist {
                            key: key.to_string(),
                            source,
                        });
                    }
                    info!(key, evicted = evicted.len(), "write succeeded after cleanup");
                    evicted
                }
                Err(e) => {
                    warn!(key, error = %e, "cache write failed; kept in memory only");
                    return Ok(());
                }
            }
        };

        self.forget(&evicted);
        Ok(())
    }

    /// Mark evicted keys absent in memory and tell their listeners.
    fn forget(&self, keys: &[String]) {
        {
            let mut state = self.lock_state();
            for key in keys {
                state.memory.insert(key.clone(), None);
            }
        }
        for key in keys {
            self.notify(key, None);
        }
    }

    // --- Change notification ---

    /// Register `handler` for writes to `key`. Delivery is synchronous, on the
    /// writer's thread, with no cache lock held.
    pub fn on_change(
        &self,
        key: &str,
        handler: impl Fn(&str, Option<&Value>) + Send + Sync + 'static,
    ) -> SubscriptionId {
        let id = SubscriptionId(self.next_subscription.fetch_add(1, Ordering::Relaxed));
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Listener {
                id,
                key: key.to_string(),
                handler: Arc::new(handler),
            });
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut listeners = self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let before = listeners.len();
        listeners.retain(|l| l.id != id);
        listeners.len() != before
    }

    fn notify(&self, key: &str, value: Option<&Value>) {
        let handlers: Vec<ChangeHandler> = self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|l| l.key == key)
            .map(|l| Arc::clone(&l.handler))
            .collect();
        for handler in handlers {
            handler(key, value);
        }
    }
}

/// Delete transient keys other than `keep`. Returns the unprefixed names of
/// the keys removed.
fn evict_transient(store: &dyn KeyValueStore, keep: &str) -> Vec<String> {
    let keys = match store.keys_with_prefix(KEY_PREFIX) {
        Ok(keys) => keys,
        Err(e) => {
            warn!(error = %e, "could not list keys for cleanup");
            return Vec::new();
        }
    };

    let mut evicted = Vec::new();
    for full_key in keys {
        let Some(name) = full_key.strip_prefix(KEY_PREFIX) else {
            continue;
        };
        if full_key == keep || !is_transient(name) {
            continue;
        }
        match store.erase(&full_key) {
            Ok(_) => evicted.push(name.to_string()),
            Err(e) => warn!(key = name, error = %e, "could not evict transient key"),
        }
    }
    evicted
}
