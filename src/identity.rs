//! # Node Identity
//!
//! Core identity types shared by every other module:
//!
//! - [`Keypair`]: Ed25519 signing keypair
//! - [`NodeId`]: 256-bit identifier, equal to the node's Ed25519 public key
//! - [`PeerInfo`]: a NodeId together with its candidate network addresses
//!
//! ## Identity Model
//!
//! **NodeId = Ed25519 public key.** Possession of the secret key proves the
//! identity, so no external authority is needed, and the 32 bytes are used
//! directly as a point in the Kademlia XOR metric space.
//!
//! ## Invariants
//!
//! - `NodeId::from_bytes(b).as_bytes() == b`
//! - `a.xor_distance(b) == b.xor_distance(a)`
//! - `a.xor_distance(b) == [0; 32]` exactly when `a == b`

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Maximum number of addresses carried by a [`PeerInfo`] or peer record.
pub const MAX_ADDRS: usize = 16;

/// Maximum length of a single address string.
pub const MAX_ADDR_LEN: usize = 256;

/// Wall-clock milliseconds since the Unix epoch.
#[inline]
pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Wall-clock microseconds since the Unix epoch.
/// Feeds the peer-record sequence generator.
#[inline]
pub(crate) fn now_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros() as u64
}

#[derive(Clone)]
pub struct Keypair {
    signing_key: SigningKey,
}

impl Keypair {
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        Self { signing_key }
    }

    pub fn from_secret_key_bytes(bytes: &[u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(bytes);
        Self { signing_key }
    }

    pub fn secret_key_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }

    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    pub fn node_id(&self) -> NodeId {
        NodeId::from_bytes(self.public_key_bytes())
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing_key.sign(message)
    }

    pub fn verify(&self, message: &[u8], signature: &Signature) -> bool {
        self.signing_key.verifying_key().verify(message, signature).is_ok()
    }
}

impl std::fmt::Debug for Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keypair")
            .field("node_id", &hex::encode(self.public_key_bytes()))
            .finish_non_exhaustive()
    }
}

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId([u8; 32]);

impl NodeId {
    #[inline]
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    #[inline]
    pub fn xor_distance(&self, other: &NodeId) -> [u8; 32] {
        xor_bytes(&self.0, &other.0)
    }

    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }

    /// First eight bytes in hex, the form used in log fields.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..8])
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        if bytes.len() != 32 {
            return Err(hex::FromHexError::InvalidStringLength);
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }

    /// Whether the identifier is a usable Ed25519 public key.
    ///
    /// All-zero and all-0xFF identifiers are rejected up front.
    #[inline]
    pub fn is_valid(&self) -> bool {
        if self.0.iter().all(|&b| b == 0) || self.0.iter().all(|&b| b == 0xFF) {
            return false;
        }
        VerifyingKey::try_from(self.0.as_slice()).is_ok()
    }
}

/// Byte-wise XOR of two points in the 256-bit space.
#[inline]
pub fn xor_bytes(a: &[u8; 32], b: &[u8; 32]) -> [u8; 32] {
    let mut out = [0u8; 32];
    for (i, byte) in out.iter_mut().enumerate() {
        *byte = a[i] ^ b[i];
    }
    out
}

/// Compare two XOR distances as big-endian 256-bit integers.
///
/// `Less` means `a` is closer to the shared target than `b`.
#[inline]
pub fn distance_cmp(a: &[u8; 32], b: &[u8; 32]) -> std::cmp::Ordering {
    a.cmp(b)
}

impl std::fmt::Debug for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "NodeId({})", &self.to_hex()[..16])
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl From<[u8; 32]> for NodeId {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl From<NodeId> for [u8; 32] {
    fn from(id: NodeId) -> Self {
        id.0
    }
}

impl AsRef<[u8]> for NodeId {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// A node and the addresses it can be reached at.
///
/// This is the unsigned reference exchanged in message headers, FIND_NODE
/// results and provider records. The signed, replay-protected form is
/// [`crate::SignedPeerRecord`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PeerInfo {
    pub node_id: NodeId,
    pub addrs: Vec<String>,
}

impl PeerInfo {
    pub fn new(node_id: NodeId, addrs: Vec<String>) -> Self {
        Self { node_id, addrs }
    }

    /// Bounds on the number and size of addresses.
    pub fn validate_structure(&self) -> bool {
        validate_addrs(&self.addrs)
    }
}

pub(crate) fn validate_addrs(addrs: &[String]) -> bool {
    addrs.len() <= MAX_ADDRS && addrs.iter().all(|a| !a.is_empty() && a.len() <= MAX_ADDR_LEN)
}

impl PartialEq for PeerInfo {
    fn eq(&self, other: &Self) -> bool {
        self.node_id == other.node_id
    }
}

impl Eq for PeerInfo {}

impl std::hash::Hash for PeerInfo {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.node_id.hash(state);
    }
}
