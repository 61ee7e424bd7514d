//! # Protocol Handler
//!
//! Serves inbound DHT streams: one request frame in, one response frame out.
//!
//! ## Security Gate
//!
//! Every request must come from the identity the transport verified on the
//! connection. Mutating requests additionally pass through:
//!
//! | Request | Checks, in order |
//! |---------|------------------|
//! | STORE (peer record) | rate limit, record bound to sender, key matches record, signature and freshness, sequence newer than last accepted, addresses publicly routable |
//! | STORE (value) | rate limit, size bound, not targeting the sender's peer-record key |
//! | ADD_PROVIDER | rate limit, provider is the sender |
//! | REMOVE_PROVIDER | only the sender's own record is touched |
//!
//! A request that fails a check gets an error response and changes no state.
//! Rate budgets are charged when a request arrives, before validation, so
//! invalid requests still count against the sender.

use std::collections::VecDeque;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

use lru::LruCache;
use tokio::io::AsyncWriteExt;
use tokio::time::{Duration, Instant};
use tracing::{debug, trace, warn};

use crate::config::DhtConfig;
use crate::identity::{NodeId, PeerInfo};
use crate::keyspace::{peer_record_key, Key};
use crate::messages::{
    read_frame, write_frame, RejectReason, Request, RequestBody, Response, ResponseBody, StoreRecord,
    MAX_DESERIALIZE_SIZE, MAX_PEERS_PER_RESPONSE,
};
use crate::network::NetworkAdapter;
use crate::protocols::BoxedStream;
use crate::record::{PeerRecordManager, RecordError, SignedPeerRecord};
use crate::storage::{ProviderStore, PutOutcome, ValueKind, ValueStore};

/// Deadline for reading the request frame from an inbound stream.
pub const REQUEST_READ_TIMEOUT: Duration = Duration::from_secs(10);

/// SECURITY: bounded so rotating identities cannot grow limiter state.
const MAX_TRACKED_SENDERS: usize = 10_000;

// ============================================================================
// Rate Limiting
// ============================================================================

#[derive(Clone, Copy, Debug)]
enum Budget {
    PeerRecord,
    ProviderAdd,
    ValueStore,
}

/// Sliding-window request times for one sender.
#[derive(Debug, Default)]
struct SenderBudget {
    peer_records: VecDeque<Instant>,
    provider_adds: VecDeque<Instant>,
    value_stores: VecDeque<Instant>,
}

impl SenderBudget {
    /// Record a request. Returns true when it exceeds `limit` per `window`.
    fn check_and_record(&mut self, budget: Budget, limit: usize, window: Duration) -> bool {
        let times = match budget {
            Budget::PeerRecord => &mut self.peer_records,
            Budget::ProviderAdd => &mut self.provider_adds,
            Budget::ValueStore => &mut self.value_stores,
        };
        let now = Instant::now();
        while let Some(front) = times.front() {
            if now.duration_since(*front) >= window {
                times.pop_front();
            } else {
                break;
            }
        }
        if times.len() >= limit {
            return true;
        }
        times.push_back(now);
        false
    }
}

// ============================================================================
// Address Policy
// ============================================================================

fn is_public_v4(ip: &Ipv4Addr) -> bool {
    !(ip.is_private() || ip.is_loopback() || ip.is_link_local() || ip.is_unspecified() || ip.is_broadcast())
}

fn is_public_v6(ip: &Ipv6Addr) -> bool {
    if let Some(v4) = ip.to_ipv4_mapped() {
        return is_public_v4(&v4);
    }
    let first = ip.segments()[0];
    let unique_local = first & 0xfe00 == 0xfc00;
    let link_local = first & 0xffc0 == 0xfe80;
    !(ip.is_loopback() || ip.is_unspecified() || unique_local || link_local)
}

/// Whether `addr` (`ip:port` or a bare IP) may appear in a peer record.
/// Anything that does not parse as an IP address is refused.
pub fn is_publicly_routable(addr: &str) -> bool {
    let ip = match addr.parse::<SocketAddr>() {
        Ok(sock) => sock.ip(),
        Err(_) => match addr.parse::<IpAddr>() {
            Ok(ip) => ip,
            Err(_) => return false,
        },
    };
    match ip {
        IpAddr::V4(v4) => is_public_v4(&v4),
        IpAddr::V6(v6) => is_public_v6(&v6),
    }
}

fn capped_ttl(requested_secs: u64, max: Duration) -> Duration {
    if requested_secs == 0 {
        max
    } else {
        Duration::from_secs(requested_secs).min(max)
    }
}

// ============================================================================
// Handler
// ============================================================================

/// Answers inbound DHT requests against the local stores.
///
/// One request per stream: the handler reads a single frame bounded by
/// [`REQUEST_READ_TIMEOUT`] and `MAX_DESERIALIZE_SIZE`, answers it, and closes.
/// The caller passes the transport-verified identity of the remote end; the
/// request's `sender` must match it or the request is rejected before any
/// state changes.
///
/// SECURITY: writes (STORE, ADD_PROVIDER) are charged against a per-sender
/// budget that resets every `rate_limit_window`. The budget table is an LRU
/// capped at `MAX_TRACKED_SENDERS`, so a flood of fresh identities evicts
/// old budgets rather than growing memory.
pub struct ProtocolHandler {
    config: Arc<DhtConfig>,
    network: NetworkAdapter,
    values: Arc<ValueStore>,
    providers: Arc<ProviderStore>,
    records: Arc<PeerRecordManager>,
    budgets: Mutex<LruCache<NodeId, SenderBudget>>,
}

impl ProtocolHandler {
    pub(crate) fn new(
        config: Arc<DhtConfig>,
        network: NetworkAdapter,
        values: Arc<ValueStore>,
        providers: Arc<ProviderStore>,
        records: Arc<PeerRecordManager>,
    ) -> Self {
        let capacity = NonZeroUsize::new(MAX_TRACKED_SENDERS).unwrap_or(NonZeroUsize::MIN);
        Self {
            config,
            network,
            values,
            providers,
            records,
            budgets: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn protocol_id(&self) -> &str {
        &self.config.protocol_id
    }

    /// Serve one request on `stream`, opened by the transport-verified
    /// `remote` identity.
    pub async fn serve_stream(&self, remote: NodeId, mut stream: BoxedStream) -> anyhow::Result<()> {
        let request: Request = tokio::time::timeout(
            REQUEST_READ_TIMEOUT,
            read_frame(&mut stream, MAX_DESERIALIZE_SIZE as usize),
        )
        .await
        .map_err(|_| anyhow::anyhow!("request read timed out"))??;

        let response = self.handle_request(&remote, request);
        write_frame(&mut stream, &response).await?;
        let _ = stream.shutdown().await;
        Ok(())
    }

    /// Answer a decoded request from the connection identity `remote`.
    pub fn handle_request(&self, remote: &NodeId, request: Request) -> Response {
        let Request {
            request_id,
            sender,
            body,
        } = request;
        let kind = body.message_type();

        let body = if sender.node_id != *remote {
            warn!(
                claimed = %sender.node_id.short(),
                verified = %remote.short(),
                ?kind,
                "rejecting request: sender does not match connection identity"
            );
            ResponseBody::rejected(RejectReason::IdentityMismatch)
        } else if !sender.validate_structure() {
            debug!(peer = %remote.short(), ?kind, "rejecting request: malformed sender");
            ResponseBody::rejected(RejectReason::Malformed)
        } else {
            let body = self.dispatch(&sender, body);
            match &body {
                ResponseBody::Error { reason, .. } => {
                    trace!(peer = %remote.short(), ?kind, ?reason, "request refused");
                }
                _ => {
                    if !sender.addrs.is_empty() {
                        self.network.observe(sender);
                    }
                }
            }
            body
        };

        Response {
            request_id,
            sender: self.network.local_peer().clone(),
            body,
        }
    }

    fn dispatch(&self, sender: &PeerInfo, body: RequestBody) -> ResponseBody {
        match body {
            RequestBody::Ping => ResponseBody::Pong,
            RequestBody::FindNode { target } => ResponseBody::Nodes {
                closer: self.closer_peers(&target, &sender.node_id),
            },
            RequestBody::FindValue { key } => ResponseBody::Value {
                record: self.local_record(&key),
                closer: self.closer_peers(&key, &sender.node_id),
            },
            RequestBody::Store {
                key,
                record: StoreRecord::PeerRecord(record),
                ttl_secs,
            } => self.store_peer_record(sender, key, record, ttl_secs),
            RequestBody::Store {
                key,
                record: StoreRecord::Value(value),
                ttl_secs,
            } => self.store_value(sender, key, value, ttl_secs),
            RequestBody::AddProvider { key, ttl_secs } => self.add_provider(sender, key, ttl_secs),
            RequestBody::GetProviders { key } => ResponseBody::Providers {
                providers: self
                    .providers
                    .get(&key)
                    .into_iter()
                    .take(MAX_PEERS_PER_RESPONSE)
                    .map(|r| r.provider)
                    .collect(),
                closer: self.closer_peers(&key, &sender.node_id),
            },
            RequestBody::RemoveProvider { key } => {
                let removed = self.providers.remove(&key, &sender.node_id);
                debug!(key = %key.short(), provider = %sender.node_id.short(), removed, "provider withdrawn");
                ResponseBody::Stored
            }
        }
    }

    /// The K closest known nodes to `target`, never including `requester`.
    fn closer_peers(&self, target: &Key, requester: &NodeId) -> Vec<PeerInfo> {
        let k = self.config.k;
        let mut peers = self.network.routing().nearest_peers(target, k + 1);
        peers.retain(|p| &p.node_id != requester);
        peers.truncate(k);
        peers
    }

    fn local_record(&self, key: &Key) -> Option<StoreRecord> {
        let stored = self.values.get(key)?;
        match stored.kind {
            ValueKind::Plain => Some(StoreRecord::Value(stored.value)),
            ValueKind::PeerRecord => SignedPeerRecord::from_bytes(&stored.value)
                .ok()
                .map(StoreRecord::PeerRecord),
        }
    }

    fn over_budget(&self, sender: &NodeId, budget: Budget) -> bool {
        let limit = match budget {
            Budget::PeerRecord => self.config.peer_record_rate_limit,
            Budget::ProviderAdd => self.config.provider_add_rate_limit,
            Budget::ValueStore => self.config.value_store_rate_limit,
        };
        let mut budgets = self.budgets.lock().unwrap_or_else(|p| p.into_inner());
        let limited = budgets
            .get_or_insert_mut(*sender, SenderBudget::default)
            .check_and_record(budget, limit, self.config.rate_limit_window);
        if limited {
            warn!(peer = %sender.short(), ?budget, limit, "rejecting request: rate limited");
        }
        limited
    }

    /// Check order is cheapest-first and nothing is written until every
    /// check passes: rate budget, owner identity, key derivation, signature
    /// and freshness, sequence, then address policy.
    ///
    /// SECURITY: the sequence is committed under the same lock as the store
    /// write and only when the write succeeds. A record refused for capacity
    /// can be resent with the same sequence; a replayed or concurrent older
    /// record is refused with `StaleSequence`.
    fn store_peer_record(
        &self,
        sender: &PeerInfo,
        key: Key,
        record: SignedPeerRecord,
        ttl_secs: u64,
    ) -> ResponseBody {
        if self.over_budget(&sender.node_id, Budget::PeerRecord) {
            return ResponseBody::rejected(RejectReason::RateLimited);
        }
        if record.node_id != sender.node_id {
            warn!(
                sender = %sender.node_id.short(),
                record = %record.node_id.short(),
                "rejecting peer record: not published by its owner"
            );
            return ResponseBody::rejected(RejectReason::IdentityMismatch);
        }
        if key != peer_record_key(&record.node_id) {
            warn!(peer = %sender.node_id.short(), key = %key.short(), "rejecting peer record: key mismatch");
            return ResponseBody::rejected(RejectReason::KeyMismatch);
        }
        if let Err(e) = record.verify_fresh(self.records.verifier(), self.records.record_ttl()) {
            warn!(peer = %sender.node_id.short(), error = %e, "rejecting peer record");
            let reason = match e {
                RecordError::SignatureInvalid => RejectReason::InvalidSignature,
                RecordError::Malformed | RecordError::ClockSkewFuture { .. } | RecordError::Stale { .. } => {
                    RejectReason::Malformed
                }
            };
            return ResponseBody::rejected(reason);
        }
        if !self.records.is_newer(&record.node_id, record.seq) {
            warn!(peer = %sender.node_id.short(), seq = record.seq, "rejecting peer record: stale sequence");
            return ResponseBody::rejected(RejectReason::StaleSequence);
        }
        if !self.config.allow_private_addrs
            && let Some(bad) = record.addrs.iter().find(|a| !is_publicly_routable(a))
        {
            warn!(peer = %sender.node_id.short(), addr = %bad, "rejecting peer record: disallowed address");
            return ResponseBody::rejected(RejectReason::DisallowedAddress);
        }
        let bytes = match record.to_bytes() {
            Ok(bytes) => bytes,
            Err(_) => return ResponseBody::rejected(RejectReason::Malformed),
        };
        let ttl = capped_ttl(ttl_secs, self.config.peer_record_ttl);
        let outcome = self.records.accept_sequence_with(&record.node_id, record.seq, || {
            self.values.put(key, bytes, ValueKind::PeerRecord, ttl)
        });
        match outcome {
            Some(PutOutcome::Stored) => {
                debug!(peer = %sender.node_id.short(), seq = record.seq, "stored peer record");
                ResponseBody::Stored
            }
            // A concurrent STORE for the same node won.
            None => ResponseBody::rejected(RejectReason::StaleSequence),
            Some(PutOutcome::KindConflict) => ResponseBody::rejected(RejectReason::KeyMismatch),
            Some(PutOutcome::Full) => ResponseBody::rejected(RejectReason::StoreFull),
        }
    }

    fn store_value(&self, sender: &PeerInfo, key: Key, value: Vec<u8>, ttl_secs: u64) -> ResponseBody {
        if self.over_budget(&sender.node_id, Budget::ValueStore) {
            return ResponseBody::rejected(RejectReason::RateLimited);
        }
        if value.len() > self.config.max_value_size {
            debug!(peer = %sender.node_id.short(), size = value.len(), "rejecting value: too large");
            return ResponseBody::rejected(RejectReason::TooLarge);
        }
        if key == peer_record_key(&sender.node_id) {
            warn!(peer = %sender.node_id.short(), "rejecting untyped store under peer-record key");
            return ResponseBody::rejected(RejectReason::KeyMismatch);
        }

        let ttl = capped_ttl(ttl_secs, self.config.value_ttl);
        match self.values.put(key, value, ValueKind::Plain, ttl) {
            PutOutcome::Stored => {
                trace!(peer = %sender.node_id.short(), key = %key.short(), "stored value");
                ResponseBody::Stored
            }
            PutOutcome::KindConflict => ResponseBody::rejected(RejectReason::KeyMismatch),
            PutOutcome::Full => ResponseBody::rejected(RejectReason::StoreFull),
        }
    }

    fn add_provider(&self, sender: &PeerInfo, key: Key, ttl_secs: u64) -> ResponseBody {
        if self.over_budget(&sender.node_id, Budget::ProviderAdd) {
            return ResponseBody::rejected(RejectReason::RateLimited);
        }
        if sender.addrs.is_empty() {
            return ResponseBody::rejected(RejectReason::Malformed);
        }
        let ttl = capped_ttl(ttl_secs, self.config.provider_ttl);
        if self
            .providers
            .add(key, sender.clone(), ttl, self.config.max_providers_per_key)
        {
            trace!(peer = %sender.node_id.short(), key = %key.short(), "provider added");
            ResponseBody::Stored
        } else {
            ResponseBody::rejected(RejectReason::StoreFull)
        }
    }
}

impl std::fmt::Debug for ProtocolHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProtocolHandler")
            .field("local", &self.network.local_peer().node_id)
            .field("protocol_id", &self.config.protocol_id)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Ed25519Verifier;
    use crate::identity::{now_ms, Keypair};
    use crate::keyspace::{provider_key, system_key, VALUE_TYPE};
    use crate::lifecycle::TaskSet;
    use crate::protocols::{Host, NoAddrCache};
    use crate::routing::RoutingTable;
    use async_trait::async_trait;

    struct OfflineHost;

    #[async_trait]
    impl Host for OfflineHost {
        async fn connect(&self, _node_id: &NodeId, _addrs: &[String]) -> anyhow::Result<()> {
            anyhow::bail!("offline")
        }

        async fn open_stream(&self, _node_id: &NodeId, _protocol: &str) -> anyhow::Result<BoxedStream> {
            anyhow::bail!("offline")
        }
    }

    struct Fixture {
        handler: ProtocolHandler,
        values: Arc<ValueStore>,
        routing: Arc<RoutingTable>,
    }

    fn fixture_with(config: DhtConfig) -> Fixture {
        fixture_on(config, ValueStore::new())
    }

    fn fixture_on(config: DhtConfig, values: ValueStore) -> Fixture {
        let local = Arc::new(Keypair::generate());
        let routing = Arc::new(RoutingTable::new(local.node_id(), config.k));
        let network = NetworkAdapter::new(
            PeerInfo::new(local.node_id(), vec!["203.0.113.1:4000".into()]),
            Arc::new(OfflineHost),
            Arc::new(NoAddrCache),
            routing.clone(),
            &config.protocol_id,
            config.query_timeout,
            TaskSet::new(),
        );
        let values = Arc::new(values);
        let records = Arc::new(PeerRecordManager::new(
            local,
            Arc::new(Ed25519Verifier),
            config.peer_record_ttl,
        ));
        let handler = ProtocolHandler::new(
            Arc::new(config),
            network,
            values.clone(),
            Arc::new(ProviderStore::new()),
            records,
        );
        Fixture {
            handler,
            values,
            routing,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(DhtConfig::default())
    }

    fn sender_of(kp: &Keypair) -> PeerInfo {
        PeerInfo::new(kp.node_id(), vec!["198.51.100.7:4000".into()])
    }

    fn request(kp: &Keypair, body: RequestBody) -> Request {
        Request {
            request_id: 7,
            sender: sender_of(kp),
            body,
        }
    }

    fn store_record(kp: &Keypair, addrs: &[&str], seq: u64) -> RequestBody {
        let record = SignedPeerRecord::sign(kp, addrs.iter().map(|a| a.to_string()).collect(), seq, now_ms());
        RequestBody::Store {
            key: peer_record_key(&kp.node_id()),
            record: StoreRecord::PeerRecord(record),
            ttl_secs: 3600,
        }
    }

    fn reason(response: &Response) -> Option<RejectReason> {
        match &response.body {
            ResponseBody::Error { reason, .. } => Some(*reason),
            _ => None,
        }
    }

    fn send(fx: &Fixture, kp: &Keypair, body: RequestBody) -> Response {
        fx.handler.handle_request(&kp.node_id(), request(kp, body))
    }

    #[tokio::test(start_paused = true)]
    async fn full_store_leaves_sequence_free_for_retry() {
        let fx = fixture_on(DhtConfig::default(), ValueStore::with_capacity(1));
        let filler = system_key(VALUE_TYPE, b"filler");
        fx.values.put(filler, b"x".to_vec(), ValueKind::Plain, Duration::from_secs(60));

        let kp = Keypair::generate();
        let body = store_record(&kp, &["198.51.100.7:4000"], 5);
        assert_eq!(reason(&send(&fx, &kp, body.clone())), Some(RejectReason::StoreFull));

        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(fx.values.remove_expired(), 1);

        let retried = send(&fx, &kp, body);
        assert!(matches!(retried.body, ResponseBody::Stored), "{:?}", retried.body);
        assert!(fx.values.get(&peer_record_key(&kp.node_id())).is_some());
    }

    #[tokio::test]
    async fn replayed_lower_sequence_is_rejected() {
        let fx = fixture();
        let kp = Keypair::generate();
        let ok = send(&fx, &kp, store_record(&kp, &["198.51.100.7:4000"], 100));
        assert!(matches!(ok.body, ResponseBody::Stored));

        let replay = send(&fx, &kp, store_record(&kp, &["198.51.100.8:4000"], 99));
        assert_eq!(reason(&replay), Some(RejectReason::StaleSequence));

        let stored = fx.values.get(&peer_record_key(&kp.node_id())).expect("kept");
        let record = SignedPeerRecord::from_bytes(&stored.value).unwrap();
        assert_eq!(record.seq, 100);
    }

    #[tokio::test]
    async fn private_address_rejected_despite_valid_signature() {
        let fx = fixture();
        let kp = Keypair::generate();
        let response = send(&fx, &kp, store_record(&kp, &["192.168.1.5:4000"], 1));
        assert_eq!(reason(&response), Some(RejectReason::DisallowedAddress));
        assert!(fx.values.get(&peer_record_key(&kp.node_id())).is_none());

        // The refused record must not have consumed its sequence number.
        let retry = send(&fx, &kp, store_record(&kp, &["198.51.100.7:4000"], 1));
        assert!(matches!(retry.body, ResponseBody::Stored));
    }

    #[tokio::test]
    async fn private_addresses_allowed_when_configured() {
        let fx = fixture_with(DhtConfig {
            allow_private_addrs: true,
            ..DhtConfig::default()
        });
        let kp = Keypair::generate();
        let response = send(&fx, &kp, store_record(&kp, &["192.168.1.5:4000"], 1));
        assert!(matches!(response.body, ResponseBody::Stored));
    }

    #[tokio::test(start_paused = true)]
    async fn eleventh_peer_record_store_in_window_is_rate_limited() {
        let fx = fixture();
        let kp = Keypair::generate();
        for seq in 1..=10 {
            let response = send(&fx, &kp, store_record(&kp, &["198.51.100.7:4000"], seq));
            assert!(matches!(response.body, ResponseBody::Stored), "store {seq}");
        }
        let eleventh = send(&fx, &kp, store_record(&kp, &["198.51.100.7:4000"], 11));
        assert_eq!(reason(&eleventh), Some(RejectReason::RateLimited));

        tokio::time::advance(Duration::from_secs(61)).await;
        let later = send(&fx, &kp, store_record(&kp, &["198.51.100.7:4000"], 12));
        assert!(matches!(later.body, ResponseBody::Stored));
    }

    #[tokio::test]
    async fn provider_adds_are_rate_limited_separately() {
        let fx = fixture();
        let kp = Keypair::generate();
        let key = provider_key("video-42", None);
        for _ in 0..50 {
            let response = send(&fx, &kp, RequestBody::AddProvider { key, ttl_secs: 60 });
            assert!(matches!(response.body, ResponseBody::Stored));
        }
        let over = send(&fx, &kp, RequestBody::AddProvider { key, ttl_secs: 60 });
        assert_eq!(reason(&over), Some(RejectReason::RateLimited));

        let record = send(&fx, &kp, store_record(&kp, &["198.51.100.7:4000"], 1));
        assert!(matches!(record.body, ResponseBody::Stored));
    }

    #[tokio::test]
    async fn sender_must_match_connection_identity() {
        let fx = fixture();
        let kp = Keypair::generate();
        let impostor = Keypair::generate();
        let response = fx
            .handler
            .handle_request(&impostor.node_id(), request(&kp, RequestBody::Ping));
        assert_eq!(reason(&response), Some(RejectReason::IdentityMismatch));
        assert!(!fx.routing.contains(&kp.node_id()));
    }

    #[tokio::test]
    async fn records_may_only_be_stored_by_their_owner() {
        let fx = fixture();
        let owner = Keypair::generate();
        let relayer = Keypair::generate();
        let response = send(&fx, &relayer, store_record(&owner, &["198.51.100.7:4000"], 1));
        assert_eq!(reason(&response), Some(RejectReason::IdentityMismatch));
    }

    #[tokio::test]
    async fn tampered_record_fails_signature_check() {
        let fx = fixture();
        let kp = Keypair::generate();
        let mut record = SignedPeerRecord::sign(&kp, vec!["198.51.100.7:4000".into()], 5, now_ms());
        record.addrs[0] = "198.51.100.66:4000".into();
        let body = RequestBody::Store {
            key: peer_record_key(&kp.node_id()),
            record: StoreRecord::PeerRecord(record),
            ttl_secs: 3600,
        };
        assert_eq!(reason(&send(&fx, &kp, body)), Some(RejectReason::InvalidSignature));
    }

    #[tokio::test]
    async fn record_under_wrong_key_is_refused() {
        let fx = fixture();
        let kp = Keypair::generate();
        let record = SignedPeerRecord::sign(&kp, vec!["198.51.100.7:4000".into()], 5, now_ms());
        let body = RequestBody::Store {
            key: system_key(VALUE_TYPE, b"elsewhere"),
            record: StoreRecord::PeerRecord(record),
            ttl_secs: 3600,
        };
        assert_eq!(reason(&send(&fx, &kp, body)), Some(RejectReason::KeyMismatch));
    }

    #[tokio::test]
    async fn plain_store_cannot_clobber_peer_record() {
        let fx = fixture();
        let kp = Keypair::generate();
        send(&fx, &kp, store_record(&kp, &["198.51.100.7:4000"], 1));
        let body = RequestBody::Store {
            key: peer_record_key(&kp.node_id()),
            record: StoreRecord::Value(b"junk".to_vec()),
            ttl_secs: 60,
        };
        assert_eq!(reason(&send(&fx, &kp, body)), Some(RejectReason::KeyMismatch));
    }

    #[tokio::test]
    async fn oversized_value_is_refused() {
        let fx = fixture();
        let kp = Keypair::generate();
        let body = RequestBody::Store {
            key: system_key(VALUE_TYPE, b"big"),
            record: StoreRecord::Value(vec![0u8; 64 * 1024 + 1]),
            ttl_secs: 60,
        };
        assert_eq!(reason(&send(&fx, &kp, body)), Some(RejectReason::TooLarge));
    }

    #[tokio::test]
    async fn stored_value_is_served_by_find_value() {
        let fx = fixture();
        let kp = Keypair::generate();
        let key = system_key(VALUE_TYPE, b"greeting");
        let store = RequestBody::Store {
            key,
            record: StoreRecord::Value(b"hello".to_vec()),
            ttl_secs: 60,
        };
        assert!(matches!(send(&fx, &kp, store).body, ResponseBody::Stored));

        match send(&fx, &kp, RequestBody::FindValue { key }).body {
            ResponseBody::Value {
                record: Some(StoreRecord::Value(v)),
                ..
            } => assert_eq!(v, b"hello"),
            other => panic!("unexpected {other:?}"),
        }
        // Accepted requests put the sender into the routing table.
        assert!(fx.routing.contains(&kp.node_id()));
    }

    #[tokio::test]
    async fn closer_peers_exclude_the_requester() {
        let fx = fixture();
        let kp = Keypair::generate();
        let other = Keypair::generate();
        fx.routing.add(sender_of(&kp));
        fx.routing.add(sender_of(&other));

        match send(&fx, &kp, RequestBody::FindNode { target: Key::from(kp.node_id()) }).body {
            ResponseBody::Nodes { closer } => {
                let ids: Vec<NodeId> = closer.iter().map(|p| p.node_id).collect();
                assert_eq!(ids, vec![other.node_id()]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn remove_provider_only_withdraws_own_record() {
        let fx = fixture();
        let a = Keypair::generate();
        let b = Keypair::generate();
        let key = provider_key("ns", Some("realm"));
        send(&fx, &a, RequestBody::AddProvider { key, ttl_secs: 60 });
        send(&fx, &b, RequestBody::AddProvider { key, ttl_secs: 60 });
        send(&fx, &a, RequestBody::RemoveProvider { key });

        match send(&fx, &b, RequestBody::GetProviders { key }).body {
            ResponseBody::Providers { providers, .. } => {
                let ids: Vec<NodeId> = providers.iter().map(|p| p.node_id).collect();
                assert_eq!(ids, vec![b.node_id()]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn serve_stream_answers_one_request() {
        let fx = fixture();
        let kp = Keypair::generate();
        let (mut client, server) = tokio::io::duplex(64 * 1024);
        let remote = kp.node_id();
        let serve = fx.handler.serve_stream(remote, Box::new(server));

        let exchange = async {
            write_frame(&mut client, &request(&kp, RequestBody::Ping)).await.unwrap();
            read_frame::<_, Response>(&mut client, 1 << 20).await.unwrap()
        };
        let (served, response) = tokio::join!(serve, exchange);
        served.unwrap();
        assert_eq!(response.request_id, 7);
        assert!(matches!(response.body, ResponseBody::Pong));
    }

    #[test]
    fn address_policy() {
        assert!(is_publicly_routable("198.51.100.7:4000"));
        assert!(is_publicly_routable("[2001:db8::1]:4000"));
        assert!(!is_publicly_routable("192.168.1.5"));
        assert!(!is_publicly_routable("192.168.1.5:4000"));
        assert!(!is_publicly_routable("10.0.0.1:4000"));
        assert!(!is_publicly_routable("127.0.0.1:4000"));
        assert!(!is_publicly_routable("169.254.1.1:4000"));
        assert!(!is_publicly_routable("0.0.0.0:4000"));
        assert!(!is_publicly_routable("[::1]:4000"));
        assert!(!is_publicly_routable("[fe80::1]:4000"));
        assert!(!is_publicly_routable("[fd00::1]:4000"));
        assert!(!is_publicly_routable("[::ffff:192.168.1.5]:4000"));
        assert!(!is_publicly_routable("example.com:4000"));
    }
}
