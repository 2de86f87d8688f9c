use std::hash::Hash;
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use alloy::primitives::Address;
use lru::LruCache;
use parking_lot::Mutex;
use uuid::Uuid;

pub const DEDUP_CACHE_SIZE: usize = 4096;
pub const DEDUP_CACHE_TTL: Duration = Duration::from_secs(12);

pub const REPLACEMENT_NONCE_CACHE_SIZE: usize = 4096;
pub const REPLACEMENT_NONCE_CACHE_TTL: Duration = Duration::from_secs(60);

/// Bounded LRU where every entry expires `ttl` after it was written.
///
/// Expired entries are treated as absent and evicted lazily on access.
pub struct TtlCache<K: Hash + Eq, V> {
    entries: Mutex<LruCache<K, (Instant, V)>>,
    ttl: Duration,
}

impl<K: Hash + Eq, V: Clone> TtlCache<K, V> {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity).expect("cache capacity must be non-zero");
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            ttl,
        }
    }

    pub fn get(&self, key: &K) -> Option<V> {
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some((written, value)) if written.elapsed() < self.ttl => Some(value.clone()),
            Some(_) => {
                entries.pop(key);
                None
            }
            None => None,
        }
    }

    pub fn insert(&self, key: K, value: V) {
        self.entries.lock().put(key, (Instant::now(), value));
    }

    /// Inserts `key` unless a live entry already exists.
    /// Returns true when the key was absent (or expired).
    pub fn insert_if_absent(&self, key: K, value: V) -> bool {
        let mut entries = self.entries.lock();
        if let Some((written, _)) = entries.peek(&key) {
            if written.elapsed() < self.ttl {
                return false;
            }
        }
        entries.put(key, (Instant::now(), value));
        true
    }
}

/// Suppresses requests whose uuid was already seen within the TTL window.
pub struct DedupCache {
    seen: TtlCache<Uuid, ()>,
}

impl DedupCache {
    pub fn new() -> Self {
        Self {
            seen: TtlCache::new(DEDUP_CACHE_SIZE, DEDUP_CACHE_TTL),
        }
    }

    /// Returns true the first time a uuid is observed within the TTL window.
    pub fn insert(&self, uuid: Uuid) -> bool {
        self.seen.insert_if_absent(uuid, ())
    }
}

impl Default for DedupCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Tracks the highest replacement nonce per (uuid, signer) and rejects
/// submissions that do not strictly advance it.
pub struct ReplacementNonceCache {
    nonces: TtlCache<(Uuid, Address), u64>,
}

impl ReplacementNonceCache {
    pub fn new() -> Self {
        Self {
            nonces: TtlCache::new(REPLACEMENT_NONCE_CACHE_SIZE, REPLACEMENT_NONCE_CACHE_TTL),
        }
    }

    /// Returns true iff `nonce` is accepted: the pair is unseen or the nonce
    /// is strictly greater than the recorded one. Accepted nonces overwrite.
    pub fn observe(&self, uuid: Uuid, signer: Address, nonce: u64) -> bool {
        let key = (uuid, signer);
        match self.nonces.get(&key) {
            Some(stored) if nonce <= stored => false,
            _ => {
                self.nonces.insert(key, nonce);
                true
            }
        }
    }
}

impl Default for ReplacementNonceCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dedup_suppresses_within_ttl() {
        let cache = DedupCache::new();
        let uuid = Uuid::new_v4();
        assert!(cache.insert(uuid));
        assert!(!cache.insert(uuid));
        assert!(cache.insert(Uuid::new_v4()));
    }

    #[test]
    fn ttl_entries_expire() {
        let cache = TtlCache::new(16, Duration::from_millis(0));
        cache.insert("key", 1u64);
        assert_eq!(cache.get(&"key"), None);
        assert!(cache.insert_if_absent("key", 2u64));
    }

    #[test]
    fn nonce_must_strictly_advance() {
        let cache = ReplacementNonceCache::new();
        let uuid = Uuid::new_v4();
        let signer = Address::repeat_byte(0x11);
        assert!(cache.observe(uuid, signer, 1));
        assert!(cache.observe(uuid, signer, 3));
        assert!(!cache.observe(uuid, signer, 2));
        assert!(!cache.observe(uuid, signer, 3));
        assert!(cache.observe(uuid, signer, 4));
    }

    #[test]
    fn nonce_tracked_per_signer() {
        let cache = ReplacementNonceCache::new();
        let uuid = Uuid::new_v4();
        assert!(cache.observe(uuid, Address::repeat_byte(0x11), 5));
        assert!(cache.observe(uuid, Address::repeat_byte(0x22), 1));
    }

    #[test]
    fn lru_evicts_oldest_when_full() {
        let cache = TtlCache::new(2, Duration::from_secs(60));
        cache.insert(1u8, ());
        cache.insert(2u8, ());
        cache.insert(3u8, ());
        assert_eq!(cache.get(&1u8), None);
        assert_eq!(cache.get(&3u8), Some(()));
    }
}
