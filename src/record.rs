//! # Signed Peer Records
//!
//! A [`SignedPeerRecord`] is a node's own statement of where it can be
//! reached, stored in the DHT under [`peer_record_key`].
//!
//! ## Sequence Numbers
//!
//! For a given NodeId the accepted sequence numbers strictly increase, both
//! as issued by [`SequenceGenerator`] and as enforced on receipt by
//! [`PeerRecordManager::accept_sequence_with`]. Issuing uses
//! `max(last + 1, wall-clock µs)` in a compare-and-swap loop, so restarts
//! without durable state still move forward as long as the clock does.
//!
//! ## Signed Payload
//!
//! ```text
//! node_id (32) ‖ addr_count (u32 LE) ‖ [addr_len (u32 LE) ‖ addr]* ‖ seq (u64 LE) ‖ timestamp_ms (u64 LE)
//! ```
//!
//! signed under [`PEER_RECORD_SIGNATURE_DOMAIN`].

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use anyhow::Context;
use lru::LruCache;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace, warn};

use crate::crypto::{sign_with_domain, verify_with_domain, Signer, Verifier, PEER_RECORD_SIGNATURE_DOMAIN};
use crate::error::Result;
use crate::identity::{now_micros, now_ms, validate_addrs, NodeId, PeerInfo};
use crate::keyspace::peer_record_key;
use crate::lookup::LookupEngine;
use crate::messages::{self, RequestBody, StoreRecord};
use crate::storage::{PutOutcome, ValueKind, ValueStore};

/// How far in the future a record timestamp may be before it is treated as
/// clock skew.
pub const MAX_FUTURE_SKEW: Duration = Duration::from_secs(5 * 60);

/// Maximum NodeIds whose last accepted sequence is remembered.
/// SECURITY: bounded so the table cannot be grown without limit.
const MAX_TRACKED_SEQUENCES: usize = 10_000;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedPeerRecord {
    pub node_id: NodeId,
    pub addrs: Vec<String>,
    pub seq: u64,
    pub timestamp_ms: u64,
    pub signature: Vec<u8>,
}

/// Reasons a record fails verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordError {
    /// Address list or signature length out of bounds.
    Malformed,
    SignatureInvalid,
    ClockSkewFuture { record_ts: u64, local_ts: u64 },
    Stale { record_ts: u64, local_ts: u64 },
}

impl std::fmt::Display for RecordError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecordError::Malformed => write!(f, "malformed peer record"),
            RecordError::SignatureInvalid => write!(f, "peer record signature invalid"),
            RecordError::ClockSkewFuture { record_ts, local_ts } => write!(
                f,
                "peer record timestamp {record_ts} ahead of local clock {local_ts}"
            ),
            RecordError::Stale { record_ts, local_ts } => {
                write!(f, "peer record from {record_ts} expired at {local_ts}")
            }
        }
    }
}

impl std::error::Error for RecordError {}

impl SignedPeerRecord {
    pub fn build_signed_payload(node_id: &NodeId, addrs: &[String], seq: u64, timestamp_ms: u64) -> Vec<u8> {
        let addr_bytes: usize = addrs.iter().map(|a| 4 + a.len()).sum();
        let mut payload = Vec::with_capacity(32 + 4 + addr_bytes + 16);
        payload.extend_from_slice(node_id.as_bytes());
        payload.extend_from_slice(&(addrs.len() as u32).to_le_bytes());
        for addr in addrs {
            payload.extend_from_slice(&(addr.len() as u32).to_le_bytes());
            payload.extend_from_slice(addr.as_bytes());
        }
        payload.extend_from_slice(&seq.to_le_bytes());
        payload.extend_from_slice(&timestamp_ms.to_le_bytes());
        payload
    }

    /// Sign a record for the signer's own NodeId.
    pub fn sign(signer: &dyn Signer, addrs: Vec<String>, seq: u64, timestamp_ms: u64) -> Self {
        let node_id = signer.node_id();
        let payload = Self::build_signed_payload(&node_id, &addrs, seq, timestamp_ms);
        let signature = sign_with_domain(signer, PEER_RECORD_SIGNATURE_DOMAIN, &payload);
        Self {
            node_id,
            addrs,
            seq,
            timestamp_ms,
            signature,
        }
    }

    pub fn validate_structure(&self) -> bool {
        validate_addrs(&self.addrs) && self.signature.len() == 64
    }

    pub fn verify(&self, verifier: &dyn Verifier) -> Result<(), RecordError> {
        if !self.validate_structure() {
            return Err(RecordError::Malformed);
        }
        let payload = Self::build_signed_payload(&self.node_id, &self.addrs, self.seq, self.timestamp_ms);
        if verify_with_domain(
            verifier,
            &self.node_id,
            PEER_RECORD_SIGNATURE_DOMAIN,
            &payload,
            &self.signature,
        ) {
            Ok(())
        } else {
            Err(RecordError::SignatureInvalid)
        }
    }

    /// Signature check plus timestamp bounds: no older than `max_age` and
    /// no further ahead than [`MAX_FUTURE_SKEW`].
    pub fn verify_fresh(&self, verifier: &dyn Verifier, max_age: Duration) -> Result<(), RecordError> {
        self.verify(verifier)?;
        let local_ts = now_ms();
        let max_skew = MAX_FUTURE_SKEW.as_millis() as u64;
        if self.timestamp_ms > local_ts.saturating_add(max_skew) {
            return Err(RecordError::ClockSkewFuture {
                record_ts: self.timestamp_ms,
                local_ts,
            });
        }
        if local_ts.saturating_sub(self.timestamp_ms) > max_age.as_millis() as u64 {
            return Err(RecordError::Stale {
                record_ts: self.timestamp_ms,
                local_ts,
            });
        }
        Ok(())
    }

    pub fn peer_info(&self) -> PeerInfo {
        PeerInfo::new(self.node_id, self.addrs.clone())
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        messages::serialize(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, bincode::Error> {
        messages::deserialize_bounded(bytes)
    }
}

/// Issues strictly increasing sequence numbers without persistent state.
///
/// A wall clock stepped backwards below a value issued before a restart can
/// produce a sequence that peers still holding the old record will reject
/// until it expires.
#[derive(Debug, Default)]
pub struct SequenceGenerator {
    last: AtomicU64,
}

impl SequenceGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self) -> u64 {
        self.next_with_clock(now_micros())
    }

    fn next_with_clock(&self, clock_micros: u64) -> u64 {
        let mut last = self.last.load(Ordering::Acquire);
        loop {
            let candidate = last.saturating_add(1).max(clock_micros);
            match self
                .last
                .compare_exchange_weak(last, candidate, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return candidate,
                Err(actual) => last = actual,
            }
        }
    }

    pub fn last_issued(&self) -> u64 {
        self.last.load(Ordering::Acquire)
    }
}

/// Owns the local record and the replay-protection state for remote ones.
pub struct PeerRecordManager {
    signer: Arc<dyn Signer>,
    verifier: Arc<dyn Verifier>,
    sequence: SequenceGenerator,
    record_ttl: Duration,
    current: RwLock<Option<SignedPeerRecord>>,
    accepted: Mutex<LruCache<NodeId, u64>>,
}

impl PeerRecordManager {
    pub fn new(signer: Arc<dyn Signer>, verifier: Arc<dyn Verifier>, record_ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(MAX_TRACKED_SEQUENCES).unwrap_or(NonZeroUsize::MIN);
        Self {
            signer,
            verifier,
            sequence: SequenceGenerator::new(),
            record_ttl,
            current: RwLock::new(None),
            accepted: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.signer.node_id()
    }

    pub fn verifier(&self) -> &dyn Verifier {
        self.verifier.as_ref()
    }

    pub fn record_ttl(&self) -> Duration {
        self.record_ttl
    }

    /// Sign a fresh record for `addrs` and make it the current one.
    pub fn build(&self, addrs: Vec<String>) -> SignedPeerRecord {
        let record = SignedPeerRecord::sign(self.signer.as_ref(), addrs, self.sequence.next(), now_ms());
        trace!(seq = record.seq, addrs = record.addrs.len(), "built local peer record");
        *self.current.write().unwrap_or_else(|p| p.into_inner()) = Some(record.clone());
        record
    }

    pub fn current(&self) -> Option<SignedPeerRecord> {
        self.current.read().unwrap_or_else(|p| p.into_inner()).clone()
    }

    /// STORE request publishing `record`.
    pub fn store_request(&self, record: &SignedPeerRecord) -> RequestBody {
        RequestBody::Store {
            key: peer_record_key(&record.node_id),
            record: StoreRecord::PeerRecord(record.clone()),
            ttl_secs: self.record_ttl.as_secs(),
        }
    }

    /// Whether `seq` would be accepted for `node_id` right now.
    pub fn is_newer(&self, node_id: &NodeId, seq: u64) -> bool {
        let accepted = self.accepted.lock().unwrap_or_else(|p| p.into_inner());
        accepted.peek(node_id).is_none_or(|&last| seq > last)
    }

    /// Atomically record `seq` as the newest for `node_id`. Fails when it is
    /// not strictly greater than the last accepted value.
    #[cfg(test)]
    pub fn accept_sequence(&self, node_id: &NodeId, seq: u64) -> bool {
        let mut accepted = self.accepted.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(&last) = accepted.peek(node_id)
            && seq <= last
        {
            return false;
        }
        accepted.put(*node_id, seq);
        true
    }

    /// Run `store` and commit `seq` for `node_id` only when it reports
    /// [`PutOutcome::Stored`]. `None` when `seq` is not newer than the last
    /// accepted value.
    ///
    /// The check, the store and the commit happen under the sequence lock,
    /// so a failed store leaves the sequence free for a retry and two
    /// racing STOREs for one node cannot both commit.
    pub fn accept_sequence_with(
        &self,
        node_id: &NodeId,
        seq: u64,
        store: impl FnOnce() -> PutOutcome,
    ) -> Option<PutOutcome> {
        let mut accepted = self.accepted.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(&last) = accepted.peek(node_id)
            && seq <= last
        {
            return None;
        }
        let outcome = store();
        if outcome == PutOutcome::Stored {
            accepted.put(*node_id, seq);
        }
        Some(outcome)
    }

    /// Whether `seq` is at least the last accepted value for `node_id`.
    /// Unlike [`Self::is_newer`] a repeat of the accepted record passes.
    fn is_current(&self, node_id: &NodeId, seq: u64) -> bool {
        let accepted = self.accepted.lock().unwrap_or_else(|p| p.into_inner());
        accepted.peek(node_id).is_none_or(|&last| seq >= last)
    }

    /// Validate a record returned by a lookup for `expected`.
    ///
    /// Anything that is not a fresh, correctly signed record for exactly
    /// that node yields `None`.
    ///
    /// # Security
    ///
    /// A record older than the last accepted sequence for `expected` is
    /// refused, so a responder holding a superseded record cannot roll the
    /// node's addresses back. Callers that use the result must commit it
    /// with [`Self::adopt`].
    pub fn validate_lookup(&self, expected: &NodeId, record: &SignedPeerRecord) -> Option<SignedPeerRecord> {
        if &record.node_id != expected {
            debug!(
                expected = %expected.short(),
                got = %record.node_id.short(),
                "peer record bound to wrong node"
            );
            return None;
        }
        if !self.is_current(expected, record.seq) {
            debug!(node = %expected.short(), seq = record.seq, "discarding superseded peer record");
            return None;
        }
        match record.verify_fresh(self.verifier.as_ref(), self.record_ttl) {
            Ok(()) => Some(record.clone()),
            Err(e) => {
                debug!(node = %expected.short(), error = %e, "discarding peer record");
                None
            }
        }
    }

    /// Record the sequence of a lookup result that is about to be used.
    /// Returns false when a newer record was accepted in the meantime.
    pub fn adopt(&self, record: &SignedPeerRecord) -> bool {
        let mut accepted = self.accepted.lock().unwrap_or_else(|p| p.into_inner());
        match accepted.peek(&record.node_id) {
            Some(&last) if record.seq < last => false,
            Some(&last) if record.seq == last => true,
            _ => {
                accepted.put(record.node_id, record.seq);
                true
            }
        }
    }
}

impl PeerRecordManager {
    /// Sign a record for `addrs`, hold it locally and STORE it at the
    /// `replication` nodes closest to its key.
    pub(crate) async fn publish(
        &self,
        engine: &LookupEngine,
        values: &ValueStore,
        addrs: Vec<String>,
        replication: usize,
    ) -> Result<SignedPeerRecord> {
        let record = self.build(addrs);
        let key = peer_record_key(&record.node_id);
        let bytes = record.to_bytes().context("failed to encode peer record")?;
        let held = self.accept_sequence_with(&record.node_id, record.seq, || {
            values.put(key, bytes, ValueKind::PeerRecord, self.record_ttl)
        });
        if held != Some(PutOutcome::Stored) {
            warn!(seq = record.seq, outcome = ?held, "local copy of peer record not held");
        }

        let mut targets = engine.find_node(key).await;
        targets.truncate(replication);
        let stored = engine.replicate(targets, self.store_request(&record)).await;
        info!(seq = record.seq, stored, "published peer record");
        Ok(record)
    }

    /// Re-sign and re-publish the current record. `None` before the first
    /// publish.
    pub(crate) async fn republish(
        &self,
        engine: &LookupEngine,
        values: &ValueStore,
        replication: usize,
    ) -> Result<Option<SignedPeerRecord>> {
        let Some(current) = self.current() else {
            return Ok(None);
        };
        self.publish(engine, values, current.addrs, replication).await.map(Some)
    }

    /// Find a valid record for `node_id`: the local store first, then an
    /// iterative FIND_VALUE. Invalid records count as not found.
    pub(crate) async fn lookup(
        &self,
        engine: &LookupEngine,
        values: &ValueStore,
        node_id: &NodeId,
    ) -> Option<SignedPeerRecord> {
        let key = peer_record_key(node_id);
        let local = values
            .get(&key)
            .filter(|v| v.kind == ValueKind::PeerRecord)
            .and_then(|v| SignedPeerRecord::from_bytes(&v.value).ok())
            .and_then(|r| self.validate_lookup(node_id, &r));
        if local.is_some() {
            return local;
        }

        let found = engine
            .find_value(key, |record| match record {
                StoreRecord::PeerRecord(r) => self.validate_lookup(node_id, r).is_some(),
                StoreRecord::Value(_) => false,
            })
            .await;
        match found {
            Some(StoreRecord::PeerRecord(record)) if self.adopt(&record) => Some(record),
            _ => None,
        }
    }
}

impl std::fmt::Debug for PeerRecordManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerRecordManager")
            .field("node_id", &self.node_id())
            .field("last_seq", &self.sequence.last_issued())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Ed25519Verifier;
    use crate::identity::Keypair;

    fn manager() -> (Arc<Keypair>, PeerRecordManager) {
        let kp = Arc::new(Keypair::generate());
        let mgr = PeerRecordManager::new(kp.clone(), Arc::new(Ed25519Verifier), Duration::from_secs(3600));
        (kp, mgr)
    }

    #[test]
    fn sequence_follows_clock_when_ahead() {
        let generator = SequenceGenerator::new();
        assert_eq!(generator.next_with_clock(1_000), 1_000);
        assert_eq!(generator.next_with_clock(5_000), 5_000);
    }

    #[test]
    fn sequence_increments_when_clock_lags() {
        let generator = SequenceGenerator::new();
        assert_eq!(generator.next_with_clock(1_000), 1_000);
        assert_eq!(generator.next_with_clock(10), 1_001);
        assert_eq!(generator.next_with_clock(1_001), 1_002);
    }

    #[test]
    fn sequence_is_unique_across_threads() {
        let generator = Arc::new(SequenceGenerator::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let generator = generator.clone();
                std::thread::spawn(move || (0..500).map(|_| generator.next()).collect::<Vec<_>>())
            })
            .collect();

        let mut all = Vec::new();
        for handle in handles {
            let issued = handle.join().expect("thread");
            assert!(issued.windows(2).all(|w| w[0] < w[1]), "per-thread order");
            all.extend(issued);
        }
        let total = all.len();
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), total, "no sequence issued twice");
    }

    #[test]
    fn signed_record_verifies() {
        let (kp, mgr) = manager();
        let record = mgr.build(vec!["203.0.113.9:4000".into()]);
        assert_eq!(record.node_id, kp.node_id());
        assert!(record.verify(&Ed25519Verifier).is_ok());
        assert_eq!(mgr.current(), Some(record));
    }

    #[test]
    fn tampered_address_breaks_signature() {
        let (_, mgr) = manager();
        let mut record = mgr.build(vec!["203.0.113.9:4000".into()]);
        record.addrs[0] = "198.51.100.1:4000".into();
        assert_eq!(record.verify(&Ed25519Verifier), Err(RecordError::SignatureInvalid));
    }

    #[test]
    fn tampered_sequence_breaks_signature() {
        let (_, mgr) = manager();
        let mut record = mgr.build(vec!["203.0.113.9:4000".into()]);
        record.seq += 1;
        assert_eq!(record.verify(&Ed25519Verifier), Err(RecordError::SignatureInvalid));
    }

    #[test]
    fn stale_and_future_records_fail_freshness() {
        let kp = Keypair::generate();
        let old = SignedPeerRecord::sign(&kp, vec![], 1, now_ms() - 2 * 3600 * 1000);
        assert!(matches!(
            old.verify_fresh(&Ed25519Verifier, Duration::from_secs(3600)),
            Err(RecordError::Stale { .. })
        ));

        let future = SignedPeerRecord::sign(&kp, vec![], 2, now_ms() + 3600 * 1000);
        assert!(matches!(
            future.verify_fresh(&Ed25519Verifier, Duration::from_secs(3600)),
            Err(RecordError::ClockSkewFuture { .. })
        ));
    }

    #[test]
    fn accepted_sequences_strictly_increase() {
        let (_, mgr) = manager();
        let node = NodeId::from_bytes([5u8; 32]);
        assert!(mgr.accept_sequence(&node, 100));
        assert!(!mgr.accept_sequence(&node, 99));
        assert!(!mgr.accept_sequence(&node, 100));
        assert!(!mgr.is_newer(&node, 100));
        assert!(mgr.is_newer(&node, 101));
        assert!(mgr.accept_sequence(&node, 101));
    }

    #[test]
    fn lookup_validation_rejects_foreign_binding() {
        let (_, mgr) = manager();
        let other = Keypair::generate();
        let record = SignedPeerRecord::sign(&other, vec!["203.0.113.1:1".into()], 1, now_ms());
        assert!(mgr.validate_lookup(&other.node_id(), &record).is_some());
        assert!(mgr.validate_lookup(&mgr.node_id(), &record).is_none());
    }

    #[test]
    fn failed_store_does_not_consume_sequence() {
        let (_, mgr) = manager();
        let node = NodeId::from_bytes([6u8; 32]);
        assert_eq!(mgr.accept_sequence_with(&node, 10, || PutOutcome::Full), Some(PutOutcome::Full));
        assert!(mgr.is_newer(&node, 10));

        assert_eq!(mgr.accept_sequence_with(&node, 10, || PutOutcome::Stored), Some(PutOutcome::Stored));
        assert_eq!(mgr.accept_sequence_with(&node, 10, || PutOutcome::Stored), None);
    }

    #[test]
    fn lookup_refuses_records_older_than_accepted() {
        let (_, mgr) = manager();
        let owner = Keypair::generate();
        assert!(mgr.accept_sequence(&owner.node_id(), 100));

        let older = SignedPeerRecord::sign(&owner, vec!["203.0.113.66:1".into()], 99, now_ms());
        assert!(mgr.validate_lookup(&owner.node_id(), &older).is_none());
        assert!(!mgr.adopt(&older));

        let same = SignedPeerRecord::sign(&owner, vec!["203.0.113.7:1".into()], 100, now_ms());
        assert!(mgr.validate_lookup(&owner.node_id(), &same).is_some());
        assert!(mgr.adopt(&same));
    }

    #[test]
    fn adopted_lookup_result_raises_the_floor() {
        let (_, mgr) = manager();
        let owner = Keypair::generate();
        let newer = SignedPeerRecord::sign(&owner, vec!["203.0.113.8:1".into()], 200, now_ms());
        assert!(mgr.validate_lookup(&owner.node_id(), &newer).is_some());
        assert!(mgr.adopt(&newer));

        let older = SignedPeerRecord::sign(&owner, vec!["203.0.113.66:1".into()], 150, now_ms());
        assert!(mgr.validate_lookup(&owner.node_id(), &older).is_none());
        assert!(!mgr.is_newer(&owner.node_id(), 200));
    }

    #[test]
    fn record_bytes_roundtrip() {
        let (_, mgr) = manager();
        let record = mgr.build(vec!["203.0.113.9:4000".into()]);
        let decoded = SignedPeerRecord::from_bytes(&record.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded, record);
    }
}
