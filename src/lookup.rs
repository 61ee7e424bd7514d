//! # Iterative Lookups
//!
//! One engine drives FIND_NODE, FIND_VALUE and GET_PROVIDERS:
//!
//! 1. Seed the shortlist with the K nearest nodes from the routing table.
//! 2. Each round, query the α closest shortlist entries not yet queried, in
//!    parallel.
//! 3. Merge closer peers from every response, sort by XOR distance to the
//!    target and keep the closest K. Peers that fail drop off the shortlist;
//!    a failed exchange never aborts the lookup.
//! 4. Stop when a response callback says so, when no unqueried node is left
//!    among the closest K, or after `max_rounds` rounds.
//!
//! Lookups only ever talk to the network through [`NetworkAdapter`], so
//! they are bound by its address-resolution rules.

use std::collections::HashSet;

use tokio::task::JoinSet;
use tracing::{debug, trace};

use crate::error::Result;
use crate::identity::{distance_cmp, xor_bytes, NodeId, PeerInfo};
use crate::keyspace::Key;
use crate::messages::{RequestBody, ResponseBody, StoreRecord, MAX_PEERS_PER_RESPONSE};
use crate::network::NetworkAdapter;

/// Whether a lookup should keep going after a response.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Visit {
    Continue,
    Stop,
}

/// Sort `peers` nearest-first relative to `target`.
pub(crate) fn sort_by_distance(peers: &mut [PeerInfo], target: &Key) {
    peers.sort_by(|a, b| {
        distance_cmp(
            &xor_bytes(a.node_id.as_bytes(), target.as_bytes()),
            &xor_bytes(b.node_id.as_bytes(), target.as_bytes()),
        )
    });
}

#[derive(Clone)]
pub(crate) struct LookupEngine {
    network: NetworkAdapter,
    k: usize,
    alpha: usize,
    max_rounds: usize,
}

impl LookupEngine {
    pub fn new(network: NetworkAdapter, k: usize, alpha: usize, max_rounds: usize) -> Self {
        Self {
            network,
            k,
            alpha,
            max_rounds,
        }
    }

    #[cfg(test)]
    pub fn network(&self) -> &NetworkAdapter {
        &self.network
    }

    /// The K closest responsive nodes to `target`.
    pub async fn find_node(&self, target: Key) -> Vec<PeerInfo> {
        self.iterate(target, RequestBody::FindNode { target }, |_, _| Visit::Continue)
            .await
    }

    /// First record for `key` that `accept` approves.
    pub async fn find_value<A>(&self, key: Key, accept: A) -> Option<StoreRecord>
    where
        A: Fn(&StoreRecord) -> bool + Send + Sync,
    {
        let mut found = None;
        self.iterate(key, RequestBody::FindValue { key }, |peer, body| {
            if let ResponseBody::Value { record: Some(record), .. } = body {
                if accept(record) {
                    trace!(key = %key.short(), from = %peer.node_id.short(), "value found");
                    found = Some(record.clone());
                    return Visit::Stop;
                }
                debug!(key = %key.short(), from = %peer.node_id.short(), "discarding unacceptable record");
            }
            Visit::Continue
        })
        .await;
        found
    }

    /// Feed every provider of `key` to `on_provider` until it returns
    /// [`Visit::Stop`] or the lookup runs out of nodes.
    pub async fn get_providers<F>(&self, key: Key, mut on_provider: F)
    where
        F: FnMut(&PeerInfo) -> Visit + Send,
    {
        self.iterate(key, RequestBody::GetProviders { key }, |_, body| {
            if let ResponseBody::Providers { providers, .. } = body {
                for provider in providers.iter().take(MAX_PEERS_PER_RESPONSE) {
                    if !provider.validate_structure() {
                        continue;
                    }
                    if on_provider(provider) == Visit::Stop {
                        return Visit::Stop;
                    }
                }
            }
            Visit::Continue
        })
        .await;
    }

    /// Send `body` to each of `peers` in parallel. Returns how many accepted.
    pub async fn replicate(&self, peers: Vec<PeerInfo>, body: RequestBody) -> usize {
        let mut set = JoinSet::new();
        for peer in peers {
            let net = self.network.clone();
            let body = body.clone();
            set.spawn(async move {
                let result: Result<ResponseBody> = net.send_to(&peer, body).await;
                (peer, result)
            });
        }

        let mut accepted = 0;
        while let Some(joined) = set.join_next().await {
            let Ok((peer, result)) = joined else { continue };
            match result {
                Ok(ResponseBody::Stored) => accepted += 1,
                Ok(other) => debug!(peer = %peer.node_id.short(), ?other, "unexpected reply to store"),
                Err(e) => debug!(peer = %peer.node_id.short(), error = %e, "replication failed"),
            }
        }
        accepted
    }

    async fn iterate<F>(&self, target: Key, body: RequestBody, mut on_response: F) -> Vec<PeerInfo>
    where
        F: FnMut(&PeerInfo, &ResponseBody) -> Visit + Send,
    {
        let local: NodeId = self.network.local_peer().node_id;
        let mut shortlist = self.network.routing().nearest_peers(&target, self.k);
        let mut seen: HashSet<NodeId> = shortlist.iter().map(|p| p.node_id).collect();
        let mut queried: HashSet<NodeId> = HashSet::new();
        let kind = body.message_type();

        let mut round = 0;
        while round < self.max_rounds {
            round += 1;
            let candidates: Vec<PeerInfo> = shortlist
                .iter()
                .filter(|p| !queried.contains(&p.node_id))
                .take(self.alpha)
                .cloned()
                .collect();
            if candidates.is_empty() {
                break;
            }

            let mut set = JoinSet::new();
            for peer in candidates {
                queried.insert(peer.node_id);
                let net = self.network.clone();
                let body = body.clone();
                set.spawn(async move {
                    let result = net.send_to(&peer, body).await;
                    (peer, result)
                });
            }

            let mut stopped = false;
            while let Some(joined) = set.join_next().await {
                let Ok((peer, result)) = joined else { continue };
                match result {
                    Ok(response) => {
                        for closer in response.closer().iter().take(MAX_PEERS_PER_RESPONSE) {
                            if closer.node_id == local
                                || closer.addrs.is_empty()
                                || !closer.validate_structure()
                                || !seen.insert(closer.node_id)
                            {
                                continue;
                            }
                            shortlist.push(closer.clone());
                        }
                        if on_response(&peer, &response) == Visit::Stop {
                            stopped = true;
                            set.abort_all();
                            break;
                        }
                    }
                    Err(e) => {
                        trace!(peer = %peer.node_id.short(), ?kind, error = %e, "lookup query failed");
                        shortlist.retain(|p| p.node_id != peer.node_id);
                    }
                }
            }

            sort_by_distance(&mut shortlist, &target);
            shortlist.truncate(self.k);
            if stopped {
                break;
            }
        }

        debug!(
            target = %target.short(),
            ?kind,
            rounds = round,
            queried = queried.len(),
            found = shortlist.len(),
            "lookup finished"
        );
        shortlist
    }
}
