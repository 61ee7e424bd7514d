//! # Local Stores
//!
//! Two TTL maps, each behind a single reader/writer lock:
//!
//! | Store | Shape | Writers |
//! |-------|-------|---------|
//! | [`ValueStore`] | `Key → StoredValue` | local PutValue, inbound STORE |
//! | [`ProviderStore`] | `Key → {NodeId → ProviderRecord}` | local Provide, inbound ADD_PROVIDER |
//!
//! Expired entries are invisible to readers immediately and physically
//! removed by the cleanup task through `remove_expired`. No lock here is ever
//! held together with another store's lock or across an await point.

use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use tokio::time::{Duration, Instant};
use tracing::trace;

use crate::identity::{now_ms, NodeId, PeerInfo};
use crate::keyspace::Key;

/// Hard cap on distinct keys held by either store.
pub const MAX_STORED_KEYS: usize = 100_000;

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ============================================================================
// Value Store
// ============================================================================

/// What a stored value is. Peer records went through signature, sequence
/// and address checks before landing here.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ValueKind {
    Plain,
    PeerRecord,
}

#[derive(Clone, Debug)]
pub struct StoredValue {
    pub value: Vec<u8>,
    pub kind: ValueKind,
    pub expires_at: Instant,
}

impl StoredValue {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PutOutcome {
    Stored,
    /// A plain value may not replace a peer record.
    KindConflict,
    /// Store is at capacity and the key is new.
    Full,
}

#[derive(Debug)]
pub struct ValueStore {
    entries: RwLock<HashMap<Key, StoredValue>>,
    capacity: usize,
}

impl Default for ValueStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ValueStore {
    pub fn new() -> Self {
        Self::with_capacity(MAX_STORED_KEYS)
    }

    /// A store holding at most `capacity` distinct keys.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            capacity,
        }
    }

    pub fn put(
        &self,
        key: Key,
        value: Vec<u8>,
        kind: ValueKind,
        ttl: Duration,
    ) -> PutOutcome {
        let now = Instant::now();
        let mut entries = write(&self.entries);

        if let Some(existing) = entries.get(&key)
            && !existing.is_expired(now)
            && existing.kind == ValueKind::PeerRecord
            && kind == ValueKind::Plain
        {
            return PutOutcome::KindConflict;
        }
        if !entries.contains_key(&key) && entries.len() >= self.capacity {
            return PutOutcome::Full;
        }

        trace!(key = %key.short(), len = value.len(), ?kind, "value stored");
        entries.insert(
            key,
            StoredValue {
                value,
                kind,
                expires_at: now + ttl,
            },
        );
        PutOutcome::Stored
    }

    /// The live entry for `key`, if any.
    pub fn get(&self, key: &Key) -> Option<StoredValue> {
        let now = Instant::now();
        read(&self.entries)
            .get(key)
            .filter(|v| !v.is_expired(now))
            .cloned()
    }

    pub fn remove_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = write(&self.entries);
        let before = entries.len();
        entries.retain(|_, v| !v.is_expired(now));
        before - entries.len()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        read(&self.entries).len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ============================================================================
// Provider Store
// ============================================================================

/// One node's announcement that it can serve a key.
#[derive(Clone, Debug)]
pub struct ProviderRecord {
    pub provider: PeerInfo,
    /// Wall-clock registration time, milliseconds since the epoch.
    pub registered_at_ms: u64,
    pub expires_at: Instant,
}

#[derive(Debug, Default)]
pub struct ProviderStore {
    providers: RwLock<HashMap<Key, HashMap<NodeId, ProviderRecord>>>,
}

impl ProviderStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or refresh `provider` for `key`.
    ///
    /// A refresh replaces only the announcer's own record. New announcers are
    /// refused once the key holds `max_per_key` live providers.
    pub fn add(&self, key: Key, provider: PeerInfo, ttl: Duration, max_per_key: usize) -> bool {
        let now = Instant::now();
        let mut providers = write(&self.providers);

        if !providers.contains_key(&key) && providers.len() >= MAX_STORED_KEYS {
            return false;
        }
        let set = providers.entry(key).or_default();
        if !set.contains_key(&provider.node_id) {
            set.retain(|_, r| r.expires_at > now);
            if set.len() >= max_per_key {
                return false;
            }
        }

        trace!(key = %key.short(), provider = %provider.node_id.short(), "provider registered");
        set.insert(
            provider.node_id,
            ProviderRecord {
                provider,
                registered_at_ms: now_ms(),
                expires_at: now + ttl,
            },
        );
        true
    }

    /// Live providers of `key`, most recently registered first.
    pub fn get(&self, key: &Key) -> Vec<ProviderRecord> {
        let now = Instant::now();
        let providers = read(&self.providers);
        let mut out: Vec<ProviderRecord> = providers
            .get(key)
            .map(|set| set.values().filter(|r| r.expires_at > now).cloned().collect())
            .unwrap_or_default();
        out.sort_by(|a, b| b.registered_at_ms.cmp(&a.registered_at_ms));
        out
    }

    /// Remove `node_id`'s record for `key`.
    pub fn remove(&self, key: &Key, node_id: &NodeId) -> bool {
        let mut providers = write(&self.providers);
        let Some(set) = providers.get_mut(key) else {
            return false;
        };
        let removed = set.remove(node_id).is_some();
        if set.is_empty() {
            providers.remove(key);
        }
        removed
    }

    /// Purge expired records and empty keys. Returns the records removed.
    pub fn remove_expired(&self) -> usize {
        let now = Instant::now();
        let mut providers = write(&self.providers);
        let mut removed = 0;
        providers.retain(|_, set| {
            let before = set.len();
            set.retain(|_, r| r.expires_at > now);
            removed += before - set.len();
            !set.is_empty()
        });
        removed
    }

    /// Number of keys with at least one record.
    #[cfg(test)]
    pub fn key_count(&self) -> usize {
        read(&self.providers).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keyspace::{provider_key, system_key, VALUE_TYPE};

    fn node(byte: u8) -> NodeId {
        NodeId::from_bytes([byte; 32])
    }

    fn provider(byte: u8) -> PeerInfo {
        PeerInfo::new(node(byte), vec![format!("198.51.100.{byte}:4000")])
    }

    #[tokio::test]
    async fn put_then_get_returns_value() {
        let store = ValueStore::new();
        let key = system_key(VALUE_TYPE, b"k");
        let outcome = store.put(key, b"v".to_vec(), ValueKind::Plain, Duration::from_secs(60));
        assert_eq!(outcome, PutOutcome::Stored);
        assert_eq!(store.get(&key).map(|v| v.value), Some(b"v".to_vec()));
    }

    #[tokio::test]
    async fn overwrite_replaces_value() {
        let store = ValueStore::new();
        let key = system_key(VALUE_TYPE, b"k");
        store.put(key, b"a".to_vec(), ValueKind::Plain, Duration::from_secs(60));
        store.put(key, b"b".to_vec(), ValueKind::Plain, Duration::from_secs(60));
        let stored = store.get(&key).expect("present");
        assert_eq!(stored.value, b"b".to_vec());
    }

    #[tokio::test]
    async fn plain_value_cannot_replace_peer_record() {
        let store = ValueStore::new();
        let key = system_key(VALUE_TYPE, b"rec");
        store.put(key, b"record".to_vec(), ValueKind::PeerRecord, Duration::from_secs(60));
        let outcome = store.put(key, b"junk".to_vec(), ValueKind::Plain, Duration::from_secs(60));
        assert_eq!(outcome, PutOutcome::KindConflict);
        assert_eq!(store.get(&key).map(|v| v.value), Some(b"record".to_vec()));
    }

    #[tokio::test]
    async fn full_store_refuses_new_keys_but_updates_existing() {
        let store = ValueStore::with_capacity(1);
        let first = system_key(VALUE_TYPE, b"first");
        let second = system_key(VALUE_TYPE, b"second");
        let ttl = Duration::from_secs(60);
        assert_eq!(store.put(first, b"a".to_vec(), ValueKind::Plain, ttl), PutOutcome::Stored);
        assert_eq!(store.put(second, b"b".to_vec(), ValueKind::Plain, ttl), PutOutcome::Full);
        assert_eq!(store.put(first, b"c".to_vec(), ValueKind::Plain, ttl), PutOutcome::Stored);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_values_vanish_and_are_purged() {
        let store = ValueStore::new();
        let key = system_key(VALUE_TYPE, b"k");
        store.put(key, b"v".to_vec(), ValueKind::Plain, Duration::from_secs(60));

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(store.get(&key).is_none());
        assert_eq!(store.len(), 1);

        assert_eq!(store.remove_expired(), 1);
        assert!(store.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn provider_expires_after_ttl_and_cleanup() {
        let store = ProviderStore::new();
        let key = provider_key("video-42", None);
        let ttl = Duration::from_secs(24 * 3600);
        assert!(store.add(key, provider(1), ttl, 64));

        let found = store.get(&key);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].provider.node_id, node(1));

        tokio::time::advance(Duration::from_secs(25 * 3600)).await;
        assert_eq!(store.remove_expired(), 1);
        assert!(store.get(&key).is_empty());
        assert_eq!(store.key_count(), 0);
    }

    #[tokio::test]
    async fn providers_accumulate_per_announcer() {
        let store = ProviderStore::new();
        let key = provider_key("ns", Some("realm"));
        let ttl = Duration::from_secs(60);
        store.add(key, provider(1), ttl, 64);
        store.add(key, provider(2), ttl, 64);
        store.add(key, provider(1), ttl, 64);
        assert_eq!(store.get(&key).len(), 2);
    }

    #[tokio::test]
    async fn provider_set_is_bounded() {
        let store = ProviderStore::new();
        let key = provider_key("busy", None);
        let ttl = Duration::from_secs(60);
        assert!(store.add(key, provider(1), ttl, 2));
        assert!(store.add(key, provider(2), ttl, 2));
        assert!(!store.add(key, provider(3), ttl, 2));
        // Existing announcers may still refresh.
        assert!(store.add(key, provider(1), ttl, 2));
    }

    #[tokio::test]
    async fn remove_only_touches_named_provider() {
        let store = ProviderStore::new();
        let key = provider_key("ns", None);
        let ttl = Duration::from_secs(60);
        store.add(key, provider(1), ttl, 64);
        store.add(key, provider(2), ttl, 64);
        assert!(store.remove(&key, &node(1)));
        assert!(!store.remove(&key, &node(1)));
        let left: Vec<NodeId> = store.get(&key).iter().map(|r| r.provider.node_id).collect();
        assert_eq!(left, vec![node(2)]);
    }
}
