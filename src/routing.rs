//! # Routing Table
//!
//! 256 k-buckets indexed by the position of the highest set bit of
//! `XOR(local, remote)`: bucket `i` holds nodes whose distance lies in
//! `[2^i, 2^(i+1))`, so the node differing only in the lowest bit lands in
//! bucket 0 and half of the key space lands in bucket 255.
//!
//! ## Buckets
//!
//! Each bucket is an LRU list of at most K [`RoutingNode`]s (front = least
//! recently seen) plus a replacement cache, also capped at K, for overflow
//! candidates. A NodeId is never in both lists of a bucket at once.
//!
//! When a bucket is full the caller receives a [`PendingEviction`]: it pings
//! the least-recently-seen node and reports back through
//! [`RoutingTable::resolve_eviction`]. A live node keeps its slot and the
//! candidate stays cached; a dead one is replaced by the candidate. Only one
//! eviction ping per bucket is in flight at a time.
//!
//! ## Concurrency
//!
//! Every bucket has its own lock and no operation holds two bucket locks at
//! once. `size()` reads an atomic counter and may briefly lag the buckets.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

use tokio::time::{Duration, Instant};
use tracing::trace;

use crate::identity::{distance_cmp, xor_bytes, NodeId, PeerInfo};
use crate::keyspace::Key;

pub const NUM_BUCKETS: usize = 256;

/// Bucket index of `other` as seen from `local`: 255 minus the number of
/// leading zero bits of the XOR distance. `None` when the two are equal.
pub fn bucket_index(local: &[u8; 32], other: &[u8; 32]) -> Option<usize> {
    let dist = xor_bytes(local, other);
    for (byte_idx, byte) in dist.iter().enumerate() {
        if *byte != 0 {
            let leading = byte_idx * 8 + byte.leading_zeros() as usize;
            return Some(255 - leading);
        }
    }
    None
}

/// A random key whose distance from `local` falls inside bucket `bucket_idx`.
pub fn random_key_in_bucket(local: &NodeId, bucket_idx: usize) -> Key {
    let bucket_idx = bucket_idx.min(NUM_BUCKETS - 1);
    let mut distance = [0u8; 32];
    if getrandom::getrandom(&mut distance).is_err() {
        let local_bytes = local.as_bytes();
        for (i, byte) in distance.iter_mut().enumerate() {
            *byte = local_bytes[i].wrapping_add((bucket_idx.wrapping_mul(i + 1)) as u8);
        }
    }

    // Bit `bucket_idx` counted from the least significant end.
    let byte_pos = 31 - bucket_idx / 8;
    let target_bit = 1u8 << (bucket_idx % 8);

    for byte in distance.iter_mut().take(byte_pos) {
        *byte = 0;
    }
    let lower_mask = target_bit.wrapping_sub(1);
    distance[byte_pos] = target_bit | (distance[byte_pos] & lower_mask);

    Key::from_bytes(xor_bytes(local.as_bytes(), &distance))
}

/// A node held by exactly one bucket.
#[derive(Clone, Debug)]
pub struct RoutingNode {
    pub node_id: NodeId,
    pub addrs: Vec<String>,
    /// Last successful exchange.
    pub last_seen: Instant,
    /// Consecutive failed exchanges since `last_seen`.
    pub failures: u32,
}

impl RoutingNode {
    fn from_peer(peer: PeerInfo) -> Self {
        Self {
            node_id: peer.node_id,
            addrs: peer.addrs,
            last_seen: Instant::now(),
            failures: 0,
        }
    }

    pub fn peer_info(&self) -> PeerInfo {
        PeerInfo::new(self.node_id, self.addrs.clone())
    }

    fn refresh_from(&mut self, peer: PeerInfo) {
        if !peer.addrs.is_empty() {
            self.addrs = peer.addrs;
        }
        self.last_seen = Instant::now();
        self.failures = 0;
    }
}

/// Eviction decision the caller must resolve by pinging `lru`.
#[derive(Clone, Debug)]
pub struct PendingEviction {
    pub bucket_index: usize,
    pub lru: PeerInfo,
    pub candidate: PeerInfo,
}

#[derive(Debug)]
pub enum AddOutcome {
    Inserted,
    Updated,
    /// Bucket full; the candidate waits in the replacement cache while
    /// the least-recently-seen node is pinged.
    PingRequired(PendingEviction),
    /// Bucket full with a ping already in flight; the candidate was cached.
    Cached,
    /// The local node is never routed to.
    Ignored,
}

#[derive(Debug)]
struct KBucket {
    nodes: VecDeque<RoutingNode>,
    replacements: VecDeque<RoutingNode>,
    pending_ping: Option<NodeId>,
    last_touched: Instant,
}

impl KBucket {
    fn new() -> Self {
        Self {
            nodes: VecDeque::new(),
            replacements: VecDeque::new(),
            pending_ping: None,
            last_touched: Instant::now(),
        }
    }

    fn position(&self, id: &NodeId) -> Option<usize> {
        self.nodes.iter().position(|n| &n.node_id == id)
    }

    fn take_replacement(&mut self, id: &NodeId) -> Option<RoutingNode> {
        let pos = self.replacements.iter().position(|n| &n.node_id == id)?;
        self.replacements.remove(pos)
    }

    fn cache_replacement(&mut self, node: RoutingNode, k: usize) {
        self.take_replacement(&node.node_id);
        self.replacements.push_back(node);
        while self.replacements.len() > k {
            self.replacements.pop_front();
        }
    }

    /// Returns `(outcome, inserted_into_active)`.
    fn touch(&mut self, peer: PeerInfo, k: usize, bucket_index: usize) -> (AddOutcome, bool) {
        self.last_touched = Instant::now();

        if let Some(pos) = self.position(&peer.node_id) {
            if let Some(mut existing) = self.nodes.remove(pos) {
                existing.refresh_from(peer);
                self.nodes.push_back(existing);
            }
            return (AddOutcome::Updated, false);
        }

        if self.nodes.len() < k {
            let node = match self.take_replacement(&peer.node_id) {
                Some(mut cached) => {
                    cached.refresh_from(peer);
                    cached
                }
                None => RoutingNode::from_peer(peer),
            };
            self.nodes.push_back(node);
            return (AddOutcome::Inserted, true);
        }

        let candidate = peer.clone();
        self.cache_replacement(RoutingNode::from_peer(peer), k);

        if self.pending_ping.is_some() {
            return (AddOutcome::Cached, false);
        }
        let Some(lru) = self.nodes.front() else {
            return (AddOutcome::Cached, false);
        };
        self.pending_ping = Some(lru.node_id);
        let pending = PendingEviction {
            bucket_index,
            lru: lru.peer_info(),
            candidate,
        };
        (AddOutcome::PingRequired(pending), false)
    }

    fn promote(&mut self, id: &NodeId) -> bool {
        match self.position(id).and_then(|pos| self.nodes.remove(pos)) {
            Some(mut node) => {
                node.last_seen = Instant::now();
                node.failures = 0;
                self.nodes.push_back(node);
                self.last_touched = Instant::now();
                true
            }
            None => false,
        }
    }

    /// Fill a free slot from the replacement cache, freshest first.
    fn promote_replacement(&mut self, k: usize) -> bool {
        if self.nodes.len() >= k {
            return false;
        }
        match self.replacements.pop_back() {
            Some(node) => {
                self.nodes.push_back(node);
                true
            }
            None => false,
        }
    }

    /// Removes an active node. Returns `(removed, promoted_replacement)`.
    fn remove(&mut self, id: &NodeId, k: usize) -> (bool, bool) {
        let removed = self
            .position(id)
            .and_then(|pos| self.nodes.remove(pos))
            .is_some();
        self.take_replacement(id);
        if self.pending_ping.as_ref() == Some(id) {
            self.pending_ping = None;
        }
        let promoted = removed && self.promote_replacement(k);
        (removed, promoted)
    }
}

#[derive(Debug)]
pub struct RoutingTable {
    local_id: NodeId,
    k: usize,
    buckets: Vec<Mutex<KBucket>>,
    size: AtomicUsize,
}

impl RoutingTable {
    pub fn new(local_id: NodeId, k: usize) -> Self {
        let buckets = (0..NUM_BUCKETS).map(|_| Mutex::new(KBucket::new())).collect();
        Self {
            local_id,
            k,
            buckets,
            size: AtomicUsize::new(0),
        }
    }

    fn bucket(&self, idx: usize) -> MutexGuard<'_, KBucket> {
        self.buckets[idx]
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn index_of(&self, id: &NodeId) -> Option<usize> {
        bucket_index(self.local_id.as_bytes(), id.as_bytes())
    }

    /// Insert or refresh `peer` after a successful exchange.
    pub fn add(&self, peer: PeerInfo) -> AddOutcome {
        let Some(idx) = self.index_of(&peer.node_id) else {
            return AddOutcome::Ignored;
        };
        let (outcome, inserted) = self.bucket(idx).touch(peer, self.k, idx);
        if inserted {
            self.size.fetch_add(1, Ordering::Relaxed);
        }
        outcome
    }

    /// Promote a known node to most-recently-seen, taking its new
    /// addresses if any. Returns false when the node is not in the table.
    pub fn update(&self, peer: &PeerInfo) -> bool {
        let Some(idx) = self.index_of(&peer.node_id) else {
            return false;
        };
        let mut bucket = self.bucket(idx);
        let Some(pos) = bucket.position(&peer.node_id) else {
            return false;
        };
        match bucket.nodes.remove(pos) {
            Some(mut node) => {
                node.refresh_from(peer.clone());
                bucket.nodes.push_back(node);
                bucket.last_touched = Instant::now();
                true
            }
            None => false,
        }
    }

    /// Drop a node, backfilling the bucket from its replacement cache.
    pub fn remove(&self, id: &NodeId) -> bool {
        let Some(idx) = self.index_of(id) else {
            return false;
        };
        let (removed, promoted) = self.bucket(idx).remove(id, self.k);
        if removed && !promoted {
            self.size.fetch_sub(1, Ordering::Relaxed);
        }
        removed
    }

    /// Apply the outcome of an eviction ping.
    pub fn resolve_eviction(&self, pending: &PendingEviction, lru_alive: bool) {
        let idx = pending.bucket_index;
        let mut bucket = self.bucket(idx);
        if bucket.pending_ping.as_ref() == Some(&pending.lru.node_id) {
            bucket.pending_ping = None;
        }

        if lru_alive {
            bucket.promote(&pending.lru.node_id);
            trace!(
                bucket = idx,
                kept = %pending.lru.node_id.short(),
                cached = %pending.candidate.node_id.short(),
                "eviction ping answered, candidate stays cached"
            );
            return;
        }

        let removed = bucket
            .position(&pending.lru.node_id)
            .and_then(|pos| bucket.nodes.remove(pos))
            .is_some();

        let mut filled = false;
        if bucket.nodes.len() < self.k {
            if let Some(candidate) = bucket.take_replacement(&pending.candidate.node_id) {
                bucket.nodes.push_back(candidate);
                filled = true;
            } else {
                filled = bucket.promote_replacement(self.k);
            }
        }
        drop(bucket);

        match (removed, filled) {
            (true, false) => {
                self.size.fetch_sub(1, Ordering::Relaxed);
            }
            (false, true) => {
                self.size.fetch_add(1, Ordering::Relaxed);
            }
            _ => {}
        }
        trace!(
            bucket = idx,
            evicted = %pending.lru.node_id.short(),
            "eviction ping failed, least-recently-seen node replaced"
        );
    }

    /// Record a failed exchange. The node is kept until cleanup.
    pub fn mark_failed(&self, id: &NodeId) -> Option<u32> {
        let idx = self.index_of(id)?;
        let mut bucket = self.bucket(idx);
        let pos = bucket.position(id)?;
        let node = bucket.nodes.get_mut(pos)?;
        node.failures = node.failures.saturating_add(1);
        Some(node.failures)
    }

    /// Remove every node with at least `max_failures` consecutive failures.
    pub fn purge_failed(&self, max_failures: u32) -> usize {
        let mut purged = 0;
        for idx in 0..NUM_BUCKETS {
            let mut bucket = self.bucket(idx);
            let dead: Vec<NodeId> = bucket
                .nodes
                .iter()
                .filter(|n| n.failures >= max_failures)
                .map(|n| n.node_id)
                .collect();
            for id in dead {
                let (removed, promoted) = bucket.remove(&id, self.k);
                if removed {
                    purged += 1;
                    if !promoted {
                        self.size.fetch_sub(1, Ordering::Relaxed);
                    }
                }
            }
        }
        purged
    }

    pub fn get(&self, id: &NodeId) -> Option<RoutingNode> {
        let idx = self.index_of(id)?;
        let bucket = self.bucket(idx);
        bucket.position(id).and_then(|pos| bucket.nodes.get(pos).cloned())
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.get(id).is_some()
    }

    /// Whether `id` sits in a replacement cache.
    #[cfg(test)]
    pub fn is_cached(&self, id: &NodeId) -> bool {
        let Some(idx) = self.index_of(id) else {
            return false;
        };
        self.bucket(idx).replacements.iter().any(|n| &n.node_id == id)
    }

    /// Approximate count of active nodes.
    pub fn size(&self) -> usize {
        self.size.load(Ordering::Relaxed)
    }

    /// Up to `count` active nodes closest to `target`, nearest first.
    ///
    /// Buckets are visited in distance order: the target's own bucket, then
    /// every lower bucket as a group, then each higher bucket in turn.
    pub fn nearest_peers(&self, target: &Key, count: usize) -> Vec<PeerInfo> {
        if count == 0 {
            return Vec::new();
        }

        let mut groups: Vec<Vec<usize>> = Vec::new();
        match bucket_index(self.local_id.as_bytes(), target.as_bytes()) {
            Some(j) => {
                groups.push(vec![j]);
                if j > 0 {
                    groups.push((0..j).collect());
                }
                groups.extend((j + 1..NUM_BUCKETS).map(|i| vec![i]));
            }
            None => groups.extend((0..NUM_BUCKETS).map(|i| vec![i])),
        }

        let mut candidates: Vec<([u8; 32], PeerInfo)> = Vec::new();
        for group in groups {
            for idx in group {
                let bucket = self.bucket(idx);
                candidates.extend(
                    bucket
                        .nodes
                        .iter()
                        .map(|n| (xor_bytes(n.node_id.as_bytes(), target.as_bytes()), n.peer_info())),
                );
            }
            if candidates.len() >= count {
                break;
            }
        }

        candidates.sort_by(|a, b| distance_cmp(&a.0, &b.0));
        candidates.truncate(count);
        candidates.into_iter().map(|(_, peer)| peer).collect()
    }

    /// Non-empty buckets not touched within `threshold`.
    pub fn stale_buckets(&self, threshold: Duration) -> Vec<usize> {
        (0..NUM_BUCKETS)
            .filter(|&idx| {
                let bucket = self.bucket(idx);
                !bucket.nodes.is_empty() && bucket.last_touched.elapsed() > threshold
            })
            .collect()
    }

    pub fn mark_bucket_refreshed(&self, idx: usize) {
        if idx < NUM_BUCKETS {
            self.bucket(idx).last_touched = Instant::now();
        }
    }
}
