//! # realm-dht - Kademlia DHT with Realm-Scoped Records
//!
//! realm-dht is a Kademlia-style distributed hash table for peer discovery
//! and small-value storage:
//!
//! - **Keys**: 256-bit BLAKE3 digests, optionally scoped to a realm
//! - **Routing**: 256 k-buckets over the XOR metric with ping-before-evict
//! - **Values**: TTL-bounded opaque values replicated to the closest nodes
//! - **Providers**: "who has this key" announcements, the basis of namespace discovery
//! - **Peer records**: signed, sequence-numbered address records with replay protection
//!
//! ## Architecture
//!
//! [`Dht`] is the entry point. It owns every component and drives the
//! maintenance jobs (bootstrap, bucket refresh, expiry, republish) on a
//! cancellable task set. The transport is supplied by the caller through the
//! [`Host`] trait; [`TcpHost`] is a ready-made TCP implementation with a
//! signed identity handshake.
//!
//! ## Security Model
//!
//! - Identity = Ed25519 public key
//! - Peer records are signed under a dedicated domain and must carry a
//!   strictly increasing sequence number
//! - Inbound writes are rate limited per sender and bounded per key
//! - Peer-record addresses must be publicly routable unless explicitly allowed
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|--------|
//! | `node` | [`Dht`] facade combining all components |
//! | `identity` | Keypairs, NodeIds, PeerInfo |
//! | `crypto` | Signer/Verifier traits and domain-separated signatures |
//! | `keyspace` | Key derivation and realm scoping |
//! | `routing` | K-bucket routing table |
//! | `storage` | Value and provider stores |
//! | `record` | Signed peer records and sequence tracking |
//! | `messages` | Wire types and length-prefixed framing |
//! | `network` | Request/response exchange and address resolution |
//! | `lookup` | Iterative α-parallel lookups |
//! | `handler` | Inbound request validation and dispatch |
//! | `lifecycle` | State machine and background jobs |
//! | `protocols` | Host and address-cache traits |
//! | `transport` | TCP host with identity handshake |

mod config;
mod crypto;
mod error;
mod handler;
mod identity;
mod keyspace;
mod lifecycle;
mod lookup;
mod messages;
mod network;
mod node;
mod protocols;
mod record;
mod routing;
mod storage;
mod transport;

pub use config::DhtConfig;
pub use crypto::{
    sign_with_domain, verify_with_domain, Ed25519Verifier, SignatureError, Signer, Verifier,
    HANDSHAKE_SIGNATURE_DOMAIN, PEER_RECORD_SIGNATURE_DOMAIN,
};
pub use error::{DhtError, Result};
pub use handler::{is_publicly_routable, ProtocolHandler, REQUEST_READ_TIMEOUT};
pub use identity::{Keypair, NodeId, PeerInfo, MAX_ADDRS, MAX_ADDR_LEN};
pub use keyspace::{
    peer_record_key, provider_key, realm_key, system_key, Key, PEER_RECORD_TYPE, PROVIDER_TYPE, VALUE_TYPE,
};
pub use lifecycle::DhtState;
pub use messages::{
    read_frame, write_frame, MessageType, RejectReason, Request, RequestBody, Response, ResponseBody,
    StoreRecord, MAX_PEERS_PER_RESPONSE, MAX_VALUE_SIZE,
};
pub use node::{AdvertiseOptions, Dht, FindPeersOptions, RoutingTableView};
pub use protocols::{AddrCache, BoxedStream, DhtStream, Host, NoAddrCache, StaticAddrCache};
pub use record::{RecordError, SignedPeerRecord};
pub use transport::{Inbound, TcpHost, HANDSHAKE_TIMEOUT};
