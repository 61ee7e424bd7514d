//! Collaborator traits consumed by the DHT.
//!
//! | Collaborator | Trait | Purpose |
//! |--------------|-------|---------|
//! | Transport | [`Host`] | dial a node and open a DHT-protocol stream |
//! | Peerstore | [`AddrCache`] | read-only addresses learned elsewhere |
//! | Signing | [`crate::Signer`] / [`crate::Verifier`] | see `crypto` |
//!
//! None of these may call back into the DHT facade. In particular an
//! `AddrCache` implementation must answer from memory and never trigger a
//! discovery query.

use std::collections::HashMap;
use std::sync::RwLock;

use anyhow::Result;
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::identity::NodeId;

/// A bidirectional byte stream to a single remote node.
pub trait DhtStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> DhtStream for T {}

pub type BoxedStream = Box<dyn DhtStream>;

/// Connection capability supplied by the transport layer.
///
/// The transport authenticates the remote end: a stream returned by
/// `open_stream(node_id, ..)` reaches `node_id` and nobody else, and inbound
/// streams are handed to the protocol handler together with the identity
/// the transport verified.
#[async_trait]
pub trait Host: Send + Sync + 'static {
    /// Ensure a connection to `node_id` using the given candidate addresses.
    async fn connect(&self, node_id: &NodeId, addrs: &[String]) -> Result<()>;

    /// Open a stream speaking `protocol` on an established connection.
    async fn open_stream(&self, node_id: &NodeId, protocol: &str) -> Result<BoxedStream>;
}

/// Read-only view of an external address book.
pub trait AddrCache: Send + Sync + 'static {
    fn addrs(&self, node_id: &NodeId) -> Vec<String>;
}

/// An address cache that knows nothing.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoAddrCache;

impl AddrCache for NoAddrCache {
    fn addrs(&self, _node_id: &NodeId) -> Vec<String> {
        Vec::new()
    }
}

/// In-memory address book filled by the embedding application.
#[derive(Debug, Default)]
pub struct StaticAddrCache {
    entries: RwLock<HashMap<NodeId, Vec<String>>>,
}

impl StaticAddrCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, node_id: NodeId, addrs: Vec<String>) {
        self.entries
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .insert(node_id, addrs);
    }
}

impl AddrCache for StaticAddrCache {
    fn addrs(&self, node_id: &NodeId) -> Vec<String> {
        self.entries
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(node_id)
            .cloned()
            .unwrap_or_default()
    }
}
