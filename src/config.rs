//! # DHT Configuration
//!
//! Every tunable lives in [`DhtConfig`]. The defaults are the production
//! values; tests shrink timeouts and intervals.

use std::time::Duration;

use crate::error::{DhtError, Result};
use crate::identity::PeerInfo;

/// Bucket size (K).
pub const DEFAULT_K: usize = 20;
/// Lookup parallelism (α).
pub const DEFAULT_ALPHA: usize = 3;
pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(60 * 60);
pub const DEFAULT_REPLICATION_FACTOR: usize = 3;
pub const DEFAULT_PROVIDER_TTL: Duration = Duration::from_secs(24 * 60 * 60);
pub const DEFAULT_PEER_RECORD_TTL: Duration = Duration::from_secs(60 * 60);
pub const DEFAULT_VALUE_TTL: Duration = Duration::from_secs(60 * 60);
pub const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(10 * 60);
pub const DEFAULT_REPUBLISH_INTERVAL: Duration = Duration::from_secs(20 * 60);
pub const DEFAULT_PEER_RECORD_RATE_LIMIT: usize = 10;
pub const DEFAULT_PROVIDER_ADD_RATE_LIMIT: usize = 50;
pub const DEFAULT_VALUE_STORE_RATE_LIMIT: usize = 50;
pub const DEFAULT_RATE_LIMIT_WINDOW: Duration = Duration::from_secs(60);
pub const DEFAULT_MAX_LOOKUP_ROUNDS: usize = 10;
pub const DEFAULT_MAX_NODE_FAILURES: u32 = 3;
pub const DEFAULT_MAX_VALUE_SIZE: usize = 64 * 1024;
pub const DEFAULT_MAX_PROVIDERS_PER_KEY: usize = 64;
pub const DEFAULT_PROTOCOL_ID: &str = "/realm-dht/kad/1.0.0";

#[derive(Clone, Debug)]
pub struct DhtConfig {
    /// Bucket size and the result count of node lookups.
    pub k: usize,
    /// Parallel queries per lookup round.
    pub alpha: usize,
    /// Deadline for a single request/response exchange.
    pub query_timeout: Duration,
    /// Buckets untouched for longer than this are refreshed.
    pub refresh_interval: Duration,
    pub replication_factor: usize,
    pub provider_ttl: Duration,
    pub peer_record_ttl: Duration,
    pub value_ttl: Duration,
    pub cleanup_interval: Duration,
    pub republish_interval: Duration,
    /// Peer-record STOREs accepted per sender per window.
    pub peer_record_rate_limit: usize,
    /// ADD_PROVIDER requests accepted per sender per window.
    pub provider_add_rate_limit: usize,
    /// Plain value STOREs accepted per sender per window.
    pub value_store_rate_limit: usize,
    pub rate_limit_window: Duration,
    pub max_lookup_rounds: usize,
    /// Consecutive failed exchanges before cleanup drops a routing entry.
    pub max_node_failures: u32,
    pub bootstrap_peers: Vec<PeerInfo>,
    pub bootstrap_backoff_initial: Duration,
    pub bootstrap_backoff_max: Duration,
    /// Addresses advertised for the local node.
    pub listen_addrs: Vec<String>,
    /// Accept private and loopback addresses in peer records.
    /// Only meant for single-host test networks.
    pub allow_private_addrs: bool,
    pub max_value_size: usize,
    pub max_providers_per_key: usize,
    pub protocol_id: String,
}

impl Default for DhtConfig {
    fn default() -> Self {
        Self {
            k: DEFAULT_K,
            alpha: DEFAULT_ALPHA,
            query_timeout: DEFAULT_QUERY_TIMEOUT,
            refresh_interval: DEFAULT_REFRESH_INTERVAL,
            replication_factor: DEFAULT_REPLICATION_FACTOR,
            provider_ttl: DEFAULT_PROVIDER_TTL,
            peer_record_ttl: DEFAULT_PEER_RECORD_TTL,
            value_ttl: DEFAULT_VALUE_TTL,
            cleanup_interval: DEFAULT_CLEANUP_INTERVAL,
            republish_interval: DEFAULT_REPUBLISH_INTERVAL,
            peer_record_rate_limit: DEFAULT_PEER_RECORD_RATE_LIMIT,
            provider_add_rate_limit: DEFAULT_PROVIDER_ADD_RATE_LIMIT,
            value_store_rate_limit: DEFAULT_VALUE_STORE_RATE_LIMIT,
            rate_limit_window: DEFAULT_RATE_LIMIT_WINDOW,
            max_lookup_rounds: DEFAULT_MAX_LOOKUP_ROUNDS,
            max_node_failures: DEFAULT_MAX_NODE_FAILURES,
            bootstrap_peers: Vec::new(),
            bootstrap_backoff_initial: Duration::from_secs(2),
            bootstrap_backoff_max: Duration::from_secs(5 * 60),
            listen_addrs: Vec::new(),
            allow_private_addrs: false,
            max_value_size: DEFAULT_MAX_VALUE_SIZE,
            max_providers_per_key: DEFAULT_MAX_PROVIDERS_PER_KEY,
            protocol_id: DEFAULT_PROTOCOL_ID.to_string(),
        }
    }
}

impl DhtConfig {
    pub fn validate(&self) -> Result<()> {
        fn invalid(msg: &str) -> Result<()> {
            Err(DhtError::InvalidConfig(msg.to_string()))
        }

        if self.k == 0 {
            return invalid("k must be positive");
        }
        if self.alpha == 0 || self.alpha > self.k {
            return invalid("alpha must be in 1..=k");
        }
        if self.replication_factor == 0 {
            return invalid("replication_factor must be positive");
        }
        if self.max_lookup_rounds == 0 {
            return invalid("max_lookup_rounds must be positive");
        }
        let durations = [
            ("query_timeout", self.query_timeout),
            ("refresh_interval", self.refresh_interval),
            ("provider_ttl", self.provider_ttl),
            ("peer_record_ttl", self.peer_record_ttl),
            ("value_ttl", self.value_ttl),
            ("cleanup_interval", self.cleanup_interval),
            ("republish_interval", self.republish_interval),
            ("rate_limit_window", self.rate_limit_window),
            ("bootstrap_backoff_initial", self.bootstrap_backoff_initial),
        ];
        for (name, value) in durations {
            if value.is_zero() {
                return Err(DhtError::InvalidConfig(format!("{name} must be non-zero")));
            }
        }
        if self.peer_record_rate_limit == 0
            || self.provider_add_rate_limit == 0
            || self.value_store_rate_limit == 0
        {
            return invalid("rate limits must be positive");
        }
        if self.republish_interval >= self.peer_record_ttl {
            return invalid("republish_interval must be shorter than peer_record_ttl");
        }
        if self.bootstrap_backoff_initial > self.bootstrap_backoff_max {
            return invalid("bootstrap_backoff_initial exceeds bootstrap_backoff_max");
        }
        if self.max_value_size == 0 || self.max_value_size > crate::messages::MAX_VALUE_SIZE {
            return invalid("max_value_size out of range");
        }
        if self.max_providers_per_key == 0 {
            return invalid("max_providers_per_key must be positive");
        }
        if self.protocol_id.is_empty() {
            return invalid("protocol_id must not be empty");
        }
        if self.bootstrap_peers.iter().any(|p| !p.validate_structure()) {
            return invalid("bootstrap peer has malformed addresses");
        }
        if !crate::identity::validate_addrs(&self.listen_addrs) {
            return invalid("listen_addrs malformed");
        }
        Ok(())
    }
}
