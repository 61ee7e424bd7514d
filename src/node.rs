//! # DHT Facade
//!
//! [`Dht`] composes the routing table, stores, record manager, network
//! adapter, lookup engine, protocol handler and lifecycle into one owned
//! aggregate. Cloning a `Dht` is cheap and shares that aggregate.
//!
//! ## Quick Start
//!
//! ```ignore
//! let keypair = Arc::new(Keypair::generate());
//! let dht = Dht::with_keypair(config, host, keypair, Arc::new(NoAddrCache))?;
//!
//! // Inbound streams for `dht.handler().protocol_id()` go to the handler.
//! tokio::spawn(serve_inbound(dht.handler()));
//!
//! dht.start().await?;
//! dht.put_value(system_key(VALUE_TYPE, b"greeting"), b"hello".to_vec()).await?;
//!
//! let mut peers = dht.find_peers("chat", FindPeersOptions::default())?;
//! while let Some(peer) = peers.recv().await {
//!     println!("found {}", peer.node_id);
//! }
//! dht.stop().await?;
//! ```
//!
//! Background tasks hold a reference to the aggregate until [`Dht::stop`]
//! joins them, so a started DHT must be stopped to be released.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::{Duration, Instant};
use tracing::{debug, info};

use crate::config::DhtConfig;
use crate::crypto::{Ed25519Verifier, Signer, Verifier};
use crate::error::{DhtError, Result};
use crate::handler::ProtocolHandler;
use crate::identity::{Keypair, NodeId, PeerInfo};
use crate::keyspace::{peer_record_key, provider_key, Key};
use crate::lifecycle::{DhtState, Lifecycle, Maintenance, Schedule};
use crate::lookup::{LookupEngine, Visit};
use crate::messages::{RejectReason, RequestBody, StoreRecord};
use crate::network::NetworkAdapter;
use crate::protocols::{AddrCache, Host};
use crate::record::{PeerRecordManager, SignedPeerRecord};
use crate::routing::{random_key_in_bucket, RoutingTable};
use crate::storage::{ProviderStore, PutOutcome, ValueKind, ValueStore};

/// Options for [`Dht::find_peers`].
#[derive(Clone, Debug, Default)]
pub struct FindPeersOptions {
    /// Scope the namespace to a realm.
    pub realm: Option<String>,
    /// Maximum peers to yield. Defaults to K.
    pub limit: Option<usize>,
}

/// Options for [`Dht::advertise`].
#[derive(Clone, Debug, Default)]
pub struct AdvertiseOptions {
    pub realm: Option<String>,
}

/// Read and maintenance access to the routing table.
pub struct RoutingTableView<'a> {
    table: &'a RoutingTable,
}

impl RoutingTableView<'_> {
    pub fn size(&self) -> usize {
        self.table.size()
    }

    pub fn nearest_peers(&self, key: &Key, count: usize) -> Vec<PeerInfo> {
        self.table.nearest_peers(key, count)
    }

    /// Promote a known node to most-recently-seen.
    pub fn update(&self, peer: &PeerInfo) -> bool {
        self.table.update(peer)
    }

    pub fn remove(&self, node_id: &NodeId) -> bool {
        self.table.remove(node_id)
    }

    pub fn contains(&self, node_id: &NodeId) -> bool {
        self.table.contains(node_id)
    }
}

/// Entries this node published itself and keeps alive. Provider entries
/// remember whether they were broadcast; local-only ones stay local on
/// republish.
#[derive(Default)]
struct Originated {
    values: HashMap<Key, (Vec<u8>, Instant)>,
    provided: HashMap<Key, (bool, Instant)>,
}

struct DhtCore {
    config: Arc<DhtConfig>,
    local: PeerInfo,
    routing: Arc<RoutingTable>,
    values: Arc<ValueStore>,
    providers: Arc<ProviderStore>,
    records: Arc<PeerRecordManager>,
    network: NetworkAdapter,
    engine: LookupEngine,
    handler: Arc<ProtocolHandler>,
    lifecycle: Lifecycle,
    originated: Mutex<Originated>,
}

/// A DHT node.
///
/// Public operations other than [`Dht::bootstrap`] require the `Running`
/// state and fail with [`DhtError::NotStarted`] before [`Dht::start`] and
/// [`DhtError::Closed`] after [`Dht::stop`]. Streaming lookups run on the
/// node's task set and end early when the node stops.
///
/// SECURITY: values and peer records learned from lookups are checked
/// before they are returned. Oversized values are dropped; peer records must
/// sit under their owner's key, carry a valid signature and be fresh, and
/// their sequence may not be lower than one already accepted for that node.
/// A returned record raises the accepted sequence, so older records are
/// refused from then on.
#[derive(Clone)]
pub struct Dht {
    core: Arc<DhtCore>,
}

impl Dht {
    pub fn new(
        config: DhtConfig,
        host: Arc<dyn Host>,
        signer: Arc<dyn Signer>,
        verifier: Arc<dyn Verifier>,
        addr_cache: Arc<dyn AddrCache>,
    ) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);
        let local = PeerInfo::new(signer.node_id(), config.listen_addrs.clone());

        let lifecycle = Lifecycle::new();
        let routing = Arc::new(RoutingTable::new(local.node_id, config.k));
        let values = Arc::new(ValueStore::new());
        let providers = Arc::new(ProviderStore::new());
        let records = Arc::new(PeerRecordManager::new(signer, verifier, config.peer_record_ttl));
        let network = NetworkAdapter::new(
            local.clone(),
            host,
            addr_cache,
            routing.clone(),
            &config.protocol_id,
            config.query_timeout,
            lifecycle.tasks().clone(),
        );
        let engine = LookupEngine::new(network.clone(), config.k, config.alpha, config.max_lookup_rounds);
        let handler = Arc::new(ProtocolHandler::new(
            config.clone(),
            network.clone(),
            values.clone(),
            providers.clone(),
            records.clone(),
        ));

        debug!(node = %local.node_id.short(), addrs = ?local.addrs, "dht created");
        Ok(Self {
            core: Arc::new(DhtCore {
                config,
                local,
                routing,
                values,
                providers,
                records,
                network,
                engine,
                handler,
                lifecycle,
                originated: Mutex::new(Originated::default()),
            }),
        })
    }

    /// Ed25519 identity with the stock verifier.
    pub fn with_keypair(
        config: DhtConfig,
        host: Arc<dyn Host>,
        keypair: Arc<Keypair>,
        addr_cache: Arc<dyn AddrCache>,
    ) -> Result<Self> {
        Self::new(config, host, keypair, Arc::new(Ed25519Verifier), addr_cache)
    }

    pub fn node_id(&self) -> NodeId {
        self.core.local.node_id
    }

    pub fn local_peer(&self) -> &PeerInfo {
        &self.core.local
    }

    pub fn config(&self) -> &DhtConfig {
        &self.core.config
    }

    /// Handler to wire inbound protocol streams into.
    pub fn handler(&self) -> Arc<ProtocolHandler> {
        self.core.handler.clone()
    }

    pub fn state(&self) -> DhtState {
        self.core.lifecycle.state()
    }

    pub fn is_bootstrapped(&self) -> bool {
        self.core.lifecycle.is_bootstrapped()
    }

    pub fn routing_table(&self) -> RoutingTableView<'_> {
        RoutingTableView {
            table: &self.core.routing,
        }
    }

    /// The local node's current signed record, once published.
    pub fn local_record(&self) -> Option<SignedPeerRecord> {
        self.core.records.current()
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    /// Bootstrap once and schedule the maintenance jobs. A failed bootstrap
    /// is retried in the background with capped exponential backoff.
    pub async fn start(&self) -> Result<()> {
        let config = &self.core.config;
        let schedule = Schedule {
            refresh: config.refresh_interval,
            cleanup: config.cleanup_interval,
            republish: config.republish_interval,
            backoff_initial: config.bootstrap_backoff_initial,
            backoff_max: config.bootstrap_backoff_max,
        };
        self.core.lifecycle.start(self.core.clone(), schedule).await
    }

    /// Cancel all background work and wait for it to exit. The DHT cannot
    /// be restarted afterwards. Called during start, this waits for start to
    /// finish first.
    pub async fn stop(&self) -> Result<()> {
        self.core.lifecycle.stop().await
    }

    /// Contact the configured seeds, look up the local ID and publish the
    /// local peer record.
    pub async fn bootstrap(&self) -> Result<()> {
        self.core.lifecycle.ensure_active()?;
        self.core.bootstrap().await?;
        self.core.lifecycle.mark_bootstrapped();
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Values
    // ------------------------------------------------------------------------

    /// Store `value` locally and replicate it to the nodes closest to `key`
    /// in the background.
    pub async fn put_value(&self, key: Key, value: Vec<u8>) -> Result<()> {
        self.core.lifecycle.ensure_running()?;
        if value.len() > self.core.config.max_value_size {
            return Err(DhtError::Rejected(RejectReason::TooLarge));
        }
        self.core.store_local_value(key, value.clone())?;
        self.core
            .originated
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .values
            .insert(key, (value.clone(), Instant::now()));

        let core = self.core.clone();
        self.core.lifecycle.tasks().spawn("replicate-value", async move {
            core.replicate_value(key, value).await;
        });
        Ok(())
    }

    /// Local store first, then an iterative FIND_VALUE.
    pub async fn get_value(&self, key: Key) -> Result<Vec<u8>> {
        self.core.lifecycle.ensure_running()?;
        if let Some(stored) = self.core.values.get(&key) {
            return Ok(stored.value);
        }

        let max = self.core.config.max_value_size;
        let records = &self.core.records;
        let found = self
            .core
            .engine
            .find_value(key, |record| match record {
                StoreRecord::Value(v) => v.len() <= max,
                StoreRecord::PeerRecord(r) => {
                    peer_record_key(&r.node_id) == key && records.validate_lookup(&r.node_id, r).is_some()
                }
            })
            .await;
        match found {
            Some(StoreRecord::Value(value)) => Ok(value),
            Some(StoreRecord::PeerRecord(record)) if records.adopt(&record) => {
                record.to_bytes().map_err(|e| DhtError::Network(e.into()))
            }
            _ => Err(DhtError::KeyNotFound),
        }
    }

    // ------------------------------------------------------------------------
    // Providers
    // ------------------------------------------------------------------------

    /// Register the local node as a provider of `key`. With `broadcast` the
    /// announcement is also sent to the nodes closest to `key`.
    pub async fn provide(&self, key: Key, broadcast: bool) -> Result<()> {
        self.core.lifecycle.ensure_running()?;
        self.core.announce_provider(key, broadcast).await;
        self.core
            .originated
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .provided
            .insert(key, (broadcast, Instant::now()));
        Ok(())
    }

    /// Withdraw the local provider record for `key`, locally and at the
    /// nodes closest to it.
    pub async fn remove_provider(&self, key: Key) -> Result<()> {
        self.core.lifecycle.ensure_running()?;
        self.core
            .originated
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .provided
            .remove(&key);
        self.core.providers.remove(&key, &self.core.local.node_id);
        let targets = self.core.closest_nodes(key).await;
        let withdrawn = self
            .core
            .engine
            .replicate(targets, RequestBody::RemoveProvider { key })
            .await;
        debug!(key = %key.short(), withdrawn, "provider record removed");
        Ok(())
    }

    /// Stream of providers of `key`, local ones first, at most K of them.
    pub fn find_providers(&self, key: Key) -> Result<mpsc::Receiver<PeerInfo>> {
        self.core.stream_providers(key, self.core.config.k, false)
    }

    /// Providers of `namespace`, excluding the local node.
    pub fn find_peers(&self, namespace: &str, options: FindPeersOptions) -> Result<mpsc::Receiver<PeerInfo>> {
        let key = provider_key(namespace, options.realm.as_deref());
        let limit = options.limit.unwrap_or(self.core.config.k);
        self.core.stream_providers(key, limit, true)
    }

    /// Announce the local node under `namespace`. Returns the interval at
    /// which the announcement is refreshed.
    pub async fn advertise(&self, namespace: &str, options: AdvertiseOptions) -> Result<Duration> {
        let key = provider_key(namespace, options.realm.as_deref());
        self.provide(key, true).await?;
        Ok(self.core.config.provider_ttl / 2)
    }

    // ------------------------------------------------------------------------
    // Peers
    // ------------------------------------------------------------------------

    /// Addresses of `node_id`: signed peer record, then the routing table,
    /// then an iterative FIND_NODE for an exact match.
    pub async fn find_peer(&self, node_id: &NodeId) -> Result<PeerInfo> {
        self.core.lifecycle.ensure_running()?;
        if *node_id == self.core.local.node_id {
            return Ok(self.core.local.clone());
        }

        let core = &self.core;
        if let Some(record) = core.records.lookup(&core.engine, &core.values, node_id).await {
            debug!(peer = %node_id.short(), seq = record.seq, "resolved via peer record");
            return Ok(record.peer_info());
        }
        if let Some(node) = core.routing.get(node_id) {
            debug!(peer = %node_id.short(), "resolved via routing table");
            return Ok(node.peer_info());
        }
        core.engine
            .find_node(Key::from(*node_id))
            .await
            .into_iter()
            .find(|p| p.node_id == *node_id)
            .ok_or(DhtError::PeerNotFound)
    }

    /// Nodes closest to `key` found by an iterative lookup.
    pub async fn find_closest(&self, key: Key) -> Result<Vec<PeerInfo>> {
        self.core.lifecycle.ensure_running()?;
        let nodes = self.core.engine.find_node(key).await;
        if nodes.is_empty() {
            return Err(DhtError::NoNodes);
        }
        Ok(nodes)
    }
}

impl std::fmt::Debug for Dht {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dht")
            .field("node_id", &self.core.local.node_id)
            .field("state", &self.state())
            .field("routing_size", &self.core.routing.size())
            .finish_non_exhaustive()
    }
}

impl DhtCore {
    fn store_local_value(&self, key: Key, value: Vec<u8>) -> Result<()> {
        match self
            .values
            .put(key, value, ValueKind::Plain, self.config.value_ttl)
        {
            PutOutcome::Stored => Ok(()),
            PutOutcome::KindConflict => Err(DhtError::Rejected(RejectReason::KeyMismatch)),
            PutOutcome::Full => Err(DhtError::Rejected(RejectReason::StoreFull)),
        }
    }

    async fn closest_nodes(&self, key: Key) -> Vec<PeerInfo> {
        let mut nodes = self.engine.find_node(key).await;
        nodes.truncate(self.config.replication_factor);
        nodes
    }

    async fn replicate_value(&self, key: Key, value: Vec<u8>) {
        let targets = self.closest_nodes(key).await;
        let body = RequestBody::Store {
            key,
            record: StoreRecord::Value(value),
            ttl_secs: self.config.value_ttl.as_secs(),
        };
        let stored = self.engine.replicate(targets, body).await;
        debug!(key = %key.short(), stored, "value replicated");
    }

    async fn announce_provider(&self, key: Key, broadcast: bool) {
        let ttl = self.config.provider_ttl;
        self.providers
            .add(key, self.local.clone(), ttl, self.config.max_providers_per_key);
        if !broadcast {
            return;
        }
        let targets = self.closest_nodes(key).await;
        let body = RequestBody::AddProvider {
            key,
            ttl_secs: ttl.as_secs(),
        };
        let announced = self.engine.replicate(targets, body).await;
        debug!(key = %key.short(), announced, "provider announced");
    }

    fn stream_providers(self: &Arc<Self>, key: Key, limit: usize, exclude_self: bool) -> Result<mpsc::Receiver<PeerInfo>> {
        self.lifecycle.ensure_running()?;
        let limit = limit.max(1);
        let (tx, rx) = mpsc::channel(limit);
        let core = self.clone();

        let spawned = self.lifecycle.tasks().spawn("find-providers", async move {
            let local = core.local.node_id;
            let mut seen: HashSet<NodeId> = HashSet::new();
            let mut emitted = 0usize;
            let mut emit = |peer: &PeerInfo| {
                if (exclude_self && peer.node_id == local) || !seen.insert(peer.node_id) {
                    return Visit::Continue;
                }
                // A closed receiver ends the lookup.
                if tx.try_send(peer.clone()).is_err() {
                    return Visit::Stop;
                }
                emitted += 1;
                if emitted >= limit { Visit::Stop } else { Visit::Continue }
            };

            for record in core.providers.get(&key) {
                if emit(&record.provider) == Visit::Stop {
                    return;
                }
            }
            core.engine.get_providers(key, &mut emit).await;
        });
        if !spawned {
            return Err(DhtError::Closed);
        }
        Ok(rx)
    }
}

#[async_trait]
impl Maintenance for DhtCore {
    async fn bootstrap(&self) -> Result<()> {
        let seeds: Vec<PeerInfo> = self
            .config
            .bootstrap_peers
            .iter()
            .filter(|p| p.node_id != self.local.node_id)
            .cloned()
            .collect();

        if !seeds.is_empty() {
            let mut pings = JoinSet::new();
            for seed in seeds {
                let network = self.network.clone();
                pings.spawn(async move {
                    let alive = network.ping(&seed).await;
                    (seed, alive)
                });
            }
            let mut reachable = 0usize;
            while let Some(joined) = pings.join_next().await {
                let Ok((seed, alive)) = joined else { continue };
                if alive {
                    reachable += 1;
                } else {
                    debug!(seed = %seed.node_id.short(), "bootstrap seed unreachable");
                }
            }
            if reachable == 0 {
                return Err(DhtError::NoNodes);
            }

            let found = self.engine.find_node(Key::from(self.local.node_id)).await;
            info!(seeds = reachable, found = found.len(), routing = self.routing.size(), "bootstrap contacted network");
        } else {
            debug!("no bootstrap peers configured");
        }

        self.records
            .publish(&self.engine, &self.values, self.local.addrs.clone(), self.config.replication_factor)
            .await?;
        Ok(())
    }

    async fn refresh_buckets(&self) -> Result<()> {
        let stale = self.routing.stale_buckets(self.config.refresh_interval);
        if stale.is_empty() {
            return Ok(());
        }
        debug!(buckets = stale.len(), "refreshing stale buckets");
        for idx in stale {
            let target = random_key_in_bucket(&self.local.node_id, idx);
            self.engine.find_node(target).await;
            self.routing.mark_bucket_refreshed(idx);
        }
        Ok(())
    }

    async fn cleanup(&self) -> Result<()> {
        let values = self.values.remove_expired();
        let providers = self.providers.remove_expired();
        let nodes = self.routing.purge_failed(self.config.max_node_failures);
        debug!(values, providers, nodes, "cleanup removed expired entries");
        Ok(())
    }

    async fn republish(&self) -> Result<()> {
        let record = self
            .records
            .republish(&self.engine, &self.values, self.config.replication_factor)
            .await;

        let now = Instant::now();
        let (values, provided) = {
            let mut originated = self.originated.lock().unwrap_or_else(|p| p.into_inner());
            let value_due = self.config.value_ttl / 2;
            let provider_due = self.config.provider_ttl / 2;
            let values: Vec<(Key, Vec<u8>)> = originated
                .values
                .iter_mut()
                .filter(|(_, (_, at))| now.duration_since(*at) >= value_due)
                .map(|(key, (value, at))| {
                    *at = now;
                    (*key, value.clone())
                })
                .collect();
            let provided: Vec<(Key, bool)> = originated
                .provided
                .iter_mut()
                .filter(|(_, (_, at))| now.duration_since(*at) >= provider_due)
                .map(|(key, (broadcast, at))| {
                    *at = now;
                    (*key, *broadcast)
                })
                .collect();
            (values, provided)
        };

        for (key, value) in values {
            if let Err(e) = self.store_local_value(key, value.clone()) {
                debug!(key = %key.short(), error = %e, "local value refresh failed");
            }
            self.replicate_value(key, value).await;
        }
        for (key, broadcast) in provided {
            self.announce_provider(key, broadcast).await;
        }
        record.map(|_| ())
    }
}
