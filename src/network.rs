//! # Network Adapter
//!
//! Turns "send this request to that NodeId" into a framed exchange over a
//! [`Host`] stream.
//!
//! ## Address Resolution
//!
//! Addresses come only from state the DHT already owns, in this order:
//!
//! 1. the routing table
//! 2. the injected read-only [`AddrCache`]
//! 3. addresses carried alongside the target in a lookup response
//!    ([`NetworkAdapter::send_to`] only)
//!
//! If none of them knows the target the send fails with
//! [`DhtError::NoKnownAddress`]. The adapter never asks a discovery service,
//! since that service is itself a client of this DHT.
//!
//! ## Contact Bookkeeping
//!
//! Every successful exchange (including one answered with a rejection)
//! observes the peer into the routing table. A timeout or transport error
//! bumps the node's failure counter without evicting it. When an insert hits
//! a full bucket the least-recently-seen node is pinged on a background task
//! and the bucket resolves the eviction with the result.

use std::sync::Arc;

use anyhow::Context;
use tokio::io::AsyncWriteExt;
use tokio::time::Duration;
use tracing::{debug, trace};

use crate::error::{DhtError, Result};
use crate::identity::{NodeId, PeerInfo};
use crate::lifecycle::TaskSet;
use crate::messages::{
    read_frame, write_frame, Request, RequestBody, Response, ResponseBody, MAX_DESERIALIZE_SIZE,
};
use crate::protocols::{AddrCache, Host};
use crate::routing::{AddOutcome, PendingEviction, RoutingTable};

/// Outbound request/response exchange over the [`Host`].
///
/// Every exchange runs under `query_timeout`. A timeout or transport error
/// counts as a failure against the target's routing entry; a response, even
/// a rejection, counts as contact and refreshes it. Responses whose id or
/// sender do not match the request are treated as transport errors.
///
/// SECURITY: addresses one peer reports for another are a last resort.
/// Resolution prefers the routing table, then the address cache, and only
/// then the hint that came with the lookup response.
#[derive(Clone)]
pub(crate) struct NetworkAdapter {
    local: PeerInfo,
    host: Arc<dyn Host>,
    addr_cache: Arc<dyn AddrCache>,
    routing: Arc<RoutingTable>,
    protocol_id: Arc<str>,
    query_timeout: Duration,
    tasks: TaskSet,
}

impl NetworkAdapter {
    pub fn new(
        local: PeerInfo,
        host: Arc<dyn Host>,
        addr_cache: Arc<dyn AddrCache>,
        routing: Arc<RoutingTable>,
        protocol_id: &str,
        query_timeout: Duration,
        tasks: TaskSet,
    ) -> Self {
        Self {
            local,
            host,
            addr_cache,
            routing,
            protocol_id: Arc::from(protocol_id),
            query_timeout,
            tasks,
        }
    }

    pub fn local_peer(&self) -> &PeerInfo {
        &self.local
    }

    pub fn routing(&self) -> &Arc<RoutingTable> {
        &self.routing
    }

    /// Candidate addresses for `target`, first non-empty source wins.
    pub fn resolve(&self, target: &NodeId, hint: &[String]) -> Option<Vec<String>> {
        if let Some(node) = self.routing.get(target)
            && !node.addrs.is_empty()
        {
            return Some(node.addrs);
        }
        let cached = self.addr_cache.addrs(target);
        if !cached.is_empty() {
            return Some(cached);
        }
        if !hint.is_empty() {
            return Some(hint.to_vec());
        }
        None
    }

    /// Send to a node known to the routing table or the address cache.
    #[cfg(test)]
    pub async fn send(&self, target: &NodeId, body: RequestBody) -> Result<ResponseBody> {
        let addrs = self
            .resolve(target, &[])
            .ok_or(DhtError::NoKnownAddress(*target))?;
        self.exchange(target, addrs, body).await
    }

    /// Send to a peer learned from a lookup response or configuration,
    /// falling back to the addresses it came with.
    pub async fn send_to(&self, peer: &PeerInfo, body: RequestBody) -> Result<ResponseBody> {
        let addrs = self
            .resolve(&peer.node_id, &peer.addrs)
            .ok_or(DhtError::NoKnownAddress(peer.node_id))?;
        self.exchange(&peer.node_id, addrs, body).await
    }

    async fn exchange(&self, target: &NodeId, addrs: Vec<String>, body: RequestBody) -> Result<ResponseBody> {
        let request = Request {
            request_id: rand::random(),
            sender: self.local.clone(),
            body,
        };
        let kind = request.body.message_type();
        trace!(peer = %target.short(), ?kind, id = request.request_id, "sending request");

        let outcome = tokio::time::timeout(self.query_timeout, self.round_trip(target, &addrs, &request)).await;
        let response = match outcome {
            Err(_) => {
                let failures = self.routing.mark_failed(target);
                debug!(peer = %target.short(), ?kind, ?failures, "request timed out");
                return Err(DhtError::Timeout);
            }
            Ok(Err(e)) => {
                let failures = self.routing.mark_failed(target);
                debug!(peer = %target.short(), ?kind, ?failures, error = %e, "request failed");
                return Err(DhtError::Network(e));
            }
            Ok(Ok(response)) => response,
        };

        let observed_addrs = if response.sender.addrs.is_empty() {
            addrs
        } else {
            response.sender.addrs
        };
        self.observe(PeerInfo::new(*target, observed_addrs));

        match response.body {
            ResponseBody::Error { reason, message } => {
                debug!(peer = %target.short(), ?kind, ?reason, %message, "request rejected");
                Err(DhtError::Rejected(reason))
            }
            body => Ok(body),
        }
    }

    async fn round_trip(&self, target: &NodeId, addrs: &[String], request: &Request) -> anyhow::Result<Response> {
        self.host
            .connect(target, addrs)
            .await
            .with_context(|| format!("failed to connect to {}", target.short()))?;
        let mut stream = self
            .host
            .open_stream(target, &self.protocol_id)
            .await
            .context("failed to open stream")?;

        write_frame(&mut stream, request).await?;
        let response: Response = read_frame(&mut stream, MAX_DESERIALIZE_SIZE as usize).await?;
        let _ = stream.shutdown().await;

        if response.request_id != request.request_id {
            anyhow::bail!(
                "response id {} does not match request id {}",
                response.request_id,
                request.request_id
            );
        }
        if response.sender.node_id != *target {
            anyhow::bail!("response sent by {} instead of {}", response.sender.node_id.short(), target.short());
        }
        if !response.sender.validate_structure() {
            anyhow::bail!("malformed sender in response");
        }
        Ok(response)
    }

    /// Record a successful contact with `peer`.
    pub fn observe(&self, peer: PeerInfo) {
        if let AddOutcome::PingRequired(pending) = self.routing.add(peer) {
            self.spawn_eviction_ping(pending);
        }
    }

    fn spawn_eviction_ping(&self, pending: PendingEviction) {
        let adapter = self.clone();
        let fallback = pending.clone();
        let spawned = self.tasks.spawn("eviction-ping", async move {
            let alive = adapter.ping(&pending.lru).await;
            trace!(
                bucket = pending.bucket_index,
                lru = %pending.lru.node_id.short(),
                alive,
                "eviction ping finished"
            );
            adapter.routing.resolve_eviction(&pending, alive);
        });
        if !spawned {
            // Shutting down: keep the existing node.
            self.routing.resolve_eviction(&fallback, true);
        }
    }

    /// Whether `peer` answers a PING. A rejection still proves liveness.
    pub async fn ping(&self, peer: &PeerInfo) -> bool {
        match self.send_to(peer, RequestBody::Ping).await {
            Ok(_) | Err(DhtError::Rejected(_)) => true,
            Err(_) => false,
        }
    }
}
