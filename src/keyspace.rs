//! # Key Space
//!
//! Maps (scope, realm, type, payload) tuples onto opaque 256-bit keys.
//!
//! | Scope | Preimage |
//! |-------|----------|
//! | system | `SYSTEM_SCOPE ‖ len(type) ‖ type ‖ payload` |
//! | realm | `REALM_SCOPE ‖ len(realm) ‖ realm ‖ len(type) ‖ type ‖ payload` |
//!
//! The hash is BLAKE3, so keys are uniformly distributed and a key carries no
//! scope information once derived. Isolation between the system scope and
//! each realm comes entirely from the distinct preimages; variable-length
//! fields are length-prefixed so no two tuples share a preimage.

use serde::{Deserialize, Serialize};

use crate::identity::NodeId;

const SYSTEM_SCOPE: &[u8] = b"realm-dht/system\0";
const REALM_SCOPE: &[u8] = b"realm-dht/realm\0";

/// Type tag for signed peer records.
pub const PEER_RECORD_TYPE: &str = "peer-record";

/// Type tag for provider namespaces.
pub const PROVIDER_TYPE: &str = "provider";

/// Type tag for application values.
pub const VALUE_TYPE: &str = "value";

/// A point in the 256-bit key space.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Key([u8; 32]);

impl Key {
    #[inline]
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// First eight bytes in hex, the form used in log fields.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..8])
    }

    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }
}

impl From<NodeId> for Key {
    fn from(id: NodeId) -> Self {
        Self(*id.as_bytes())
    }
}

impl From<[u8; 32]> for Key {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl std::fmt::Debug for Key {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Key({})", self.short())
    }
}

impl std::fmt::Display for Key {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

fn push_len_prefixed(hasher: &mut blake3::Hasher, field: &[u8]) {
    hasher.update(&(field.len() as u32).to_le_bytes());
    hasher.update(field);
}

/// Key in the global system scope.
pub fn system_key(key_type: &str, payload: &[u8]) -> Key {
    let mut hasher = blake3::Hasher::new();
    hasher.update(SYSTEM_SCOPE);
    push_len_prefixed(&mut hasher, key_type.as_bytes());
    hasher.update(payload);
    Key(*hasher.finalize().as_bytes())
}

/// Key scoped to a single realm.
pub fn realm_key(realm_id: &[u8], key_type: &str, payload: &[u8]) -> Key {
    let mut hasher = blake3::Hasher::new();
    hasher.update(REALM_SCOPE);
    push_len_prefixed(&mut hasher, realm_id);
    push_len_prefixed(&mut hasher, key_type.as_bytes());
    hasher.update(payload);
    Key(*hasher.finalize().as_bytes())
}

/// Key under which `node_id` publishes its signed peer record.
/// Peer records always live in the system scope.
pub fn peer_record_key(node_id: &NodeId) -> Key {
    system_key(PEER_RECORD_TYPE, node_id.as_bytes())
}

/// Provider key for a namespace, optionally scoped to a realm.
pub fn provider_key(namespace: &str, realm: Option<&str>) -> Key {
    match realm {
        Some(realm) => realm_key(realm.as_bytes(), PROVIDER_TYPE, namespace.as_bytes()),
        None => system_key(PROVIDER_TYPE, namespace.as_bytes()),
    }
}
