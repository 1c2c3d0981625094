//! Copy-on-write cache of resolved backend addresses.
//!
//! Keys are the raw ciphertext bytes exactly as received; values are the
//! decrypted `host:port` strings. Decryption is deterministic, so an entry
//! never changes once stored and nothing is evicted individually.
//!
//! Readers clone the current snapshot handle under a read lock held only for
//! the pointer copy, then look up without any lock. Writers serialize on a
//! separate mutex, build a fresh map from the current snapshot, insert, and
//! publish it. When the snapshot has reached `max_entries` the fresh map
//! starts empty instead, which bounds memory without any LRU bookkeeping.

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Default upper bound before the cache is reset.
pub const DEFAULT_MAX_ENTRIES: usize = 1024 * 1024;

/// An immutable view of the cache at one point in time.
pub type Snapshot = Arc<HashMap<Vec<u8>, String>>;

/// Process-wide address cache, shared by handle between connection tasks.
#[derive(Debug)]
pub struct AddressCache {
    /// Currently published snapshot.
    current: RwLock<Snapshot>,
    /// Serializes writers; never held across I/O.
    writer: Mutex<()>,
    max_entries: usize,
}

impl Default for AddressCache {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ENTRIES)
    }
}

impl AddressCache {
    pub fn new(max_entries: usize) -> Self {
        Self {
            current: RwLock::new(Arc::new(HashMap::new())),
            writer: Mutex::new(()),
            max_entries: max_entries.max(1),
        }
    }

    /// The currently published snapshot.
    pub fn snapshot(&self) -> Snapshot {
        self.current.read().clone()
    }

    /// Look up a ciphertext key.
    pub fn get(&self, key: &[u8]) -> Option<String> {
        self.snapshot().get(key).cloned()
    }

    /// Store a resolved address.
    ///
    /// Returns `false` when another writer already stored this key, in which
    /// case the existing value is kept.
    pub fn insert(&self, key: &[u8], addr: &str) -> bool {
        let _guard = self.writer.lock();

        let current = self.snapshot();
        if current.contains_key(key) {
            debug!(key_len = key.len(), "address already cached by a concurrent writer");
            return false;
        }

        let mut next = if current.len() < self.max_entries {
            (*current).clone()
        } else {
            info!(entries = current.len(), "address cache full, resetting");
            HashMap::new()
        };
        next.insert(key.to_vec(), addr.to_string());

        *self.current.write() = Arc::new(next);
        true
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn max_entries(&self) -> usize {
        self.max_entries
    }
}
