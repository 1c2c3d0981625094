//! Encrypted backend address resolution.
//!
//! Looks the ciphertext up in the shared [`AddressCache`] first and only
//! falls back to decryption on a miss. Successful decryptions are published
//! to the cache; failures are returned with the fallback address so the
//! caller can reject the connection.

use frontgate_core::{AddressCache, AddressCipher, GateError};
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tracing::{debug, warn};

/// Address designated for tokens that cannot be resolved.
pub const FALLBACK_ADDR: &str = "127.0.0.1:8888";

/// Resolution failure: the underlying cipher error plus the fallback address.
#[derive(Debug, Error)]
#[error("could not resolve backend address: {source}")]
pub struct ResolveError {
    pub fallback: &'static str,
    #[source]
    pub source: GateError,
}

/// Maps encrypted address tokens to plaintext `host:port` strings.
///
/// Built once at startup and shared by `Arc` with every connection task.
#[derive(Debug)]
pub struct AddressResolver {
    cache: AddressCache,
    cipher: AddressCipher,
    /// Number of times the cipher was invoked (cache misses).
    decrypts: AtomicU64,
}

impl AddressResolver {
    pub fn new(cipher: AddressCipher, cache: AddressCache) -> Self {
        Self {
            cache,
            cipher,
            decrypts: AtomicU64::new(0),
        }
    }

    /// Resolve a ciphertext token to its backend address.
    pub fn resolve(&self, key: &[u8]) -> Result<String, ResolveError> {
        if let Some(addr) = self.cache.get(key) {
            debug!(key_len = key.len(), addr = %addr, "address cache hit");
            return Ok(addr);
        }

        self.decrypts.fetch_add(1, Ordering::Relaxed);
        let addr = self.cipher.decrypt(key).map_err(|e| {
            warn!(key_len = key.len(), error = %e, "backend address decrypt failed");
            ResolveError {
                fallback: FALLBACK_ADDR,
                source: e,
            }
        })?;

        if self.cache.insert(key, &addr) {
            debug!(
                key_len = key.len(),
                addr = %addr,
                entries = self.cache.len(),
                decrypts = self.decrypt_count(),
                "address cached"
            );
        }
        Ok(addr)
    }

    /// How many lookups missed the cache and went to the cipher.
    pub fn decrypt_count(&self) -> u64 {
        self.decrypts.load(Ordering::Relaxed)
    }

    pub fn cache(&self) -> &AddressCache {
        &self.cache
    }

    pub fn cipher(&self) -> &AddressCipher {
        &self.cipher
    }
}
