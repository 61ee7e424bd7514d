//! In-process network for integration tests.
//!
//! `MemoryHost` delivers streams over `tokio::io::duplex` straight into the
//! target node's `ProtocolHandler`, with the dialer's identity standing in
//! for a transport-verified one.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use realm_dht::{BoxedStream, Dht, DhtConfig, Host, Keypair, NoAddrCache, NodeId, PeerInfo, ProtocolHandler};

const STREAM_BUFFER: usize = 1 << 20;

struct Endpoint {
    handler: Arc<ProtocolHandler>,
    up: bool,
}

/// Registry of every node reachable in a test.
#[derive(Default)]
pub struct MemoryNetwork {
    nodes: Mutex<HashMap<NodeId, Endpoint>>,
    next_host: Mutex<u8>,
}

impl MemoryNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn register(&self, node_id: NodeId, handler: Arc<ProtocolHandler>) {
        self.nodes
            .lock()
            .unwrap()
            .insert(node_id, Endpoint { handler, up: true });
    }

    pub fn set_up(&self, node_id: &NodeId, up: bool) {
        if let Some(endpoint) = self.nodes.lock().unwrap().get_mut(node_id) {
            endpoint.up = up;
        }
    }

    fn handler(&self, node_id: &NodeId) -> Option<Arc<ProtocolHandler>> {
        self.nodes
            .lock()
            .unwrap()
            .get(node_id)
            .filter(|e| e.up)
            .map(|e| e.handler.clone())
    }

    /// A fresh documentation-range address, one per node.
    pub fn next_addr(&self) -> String {
        let mut next = self.next_host.lock().unwrap();
        *next += 1;
        format!("203.0.113.{}:4001", *next)
    }

    /// Build an unstarted node attached to this network.
    pub fn node(self: &Arc<Self>, config: DhtConfig) -> Dht {
        self.node_with_keypair(config, Arc::new(Keypair::generate()))
    }

    pub fn node_with_keypair(self: &Arc<Self>, config: DhtConfig, keypair: Arc<Keypair>) -> Dht {
        self.try_node(config, keypair).unwrap()
    }

    pub fn try_node(self: &Arc<Self>, mut config: DhtConfig, keypair: Arc<Keypair>) -> realm_dht::Result<Dht> {
        if config.listen_addrs.is_empty() {
            config.listen_addrs = vec![self.next_addr()];
        }
        let host = Arc::new(MemoryHost {
            local: keypair.node_id(),
            network: self.clone(),
        });
        let dht = Dht::with_keypair(config, host, keypair, Arc::new(NoAddrCache))?;
        self.register(dht.node_id(), dht.handler());
        Ok(dht)
    }
}

pub struct MemoryHost {
    local: NodeId,
    network: Arc<MemoryNetwork>,
}

#[async_trait]
impl Host for MemoryHost {
    async fn connect(&self, node_id: &NodeId, addrs: &[String]) -> Result<()> {
        if addrs.is_empty() {
            bail!("no addresses for {}", node_id.short());
        }
        if self.network.handler(node_id).is_none() {
            bail!("{} unreachable", node_id.short());
        }
        Ok(())
    }

    async fn open_stream(&self, node_id: &NodeId, protocol: &str) -> Result<BoxedStream> {
        let Some(handler) = self.network.handler(node_id) else {
            bail!("{} unreachable", node_id.short());
        };
        if handler.protocol_id() != protocol {
            bail!("protocol {protocol} not supported");
        }
        let (client, server) = tokio::io::duplex(STREAM_BUFFER);
        let remote = self.local;
        tokio::spawn(async move {
            let _ = handler.serve_stream(remote, Box::new(server)).await;
        });
        Ok(Box::new(client))
    }
}

/// Configuration with short timers for tests.
pub fn test_config() -> DhtConfig {
    DhtConfig {
        query_timeout: Duration::from_secs(2),
        bootstrap_backoff_initial: Duration::from_secs(1),
        bootstrap_backoff_max: Duration::from_secs(8),
        ..DhtConfig::default()
    }
}

pub fn seeded_config(seeds: &[&Dht]) -> DhtConfig {
    DhtConfig {
        bootstrap_peers: seeds.iter().map(|d| d.local_peer().clone()).collect::<Vec<PeerInfo>>(),
        ..test_config()
    }
}

/// Start `count` nodes, each seeded with the first.
pub async fn cluster(network: &Arc<MemoryNetwork>, count: usize) -> Vec<Dht> {
    let first = network.node(test_config());
    first.start().await.unwrap();
    let mut nodes = vec![first];
    for _ in 1..count {
        let node = network.node(seeded_config(&[&nodes[0]]));
        node.start().await.unwrap();
        nodes.push(node);
    }
    nodes
}

pub async fn stop_all(nodes: &[Dht]) {
    for node in nodes {
        let _ = node.stop().await;
    }
}
