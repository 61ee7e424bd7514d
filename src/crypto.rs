//! # Signing Collaborators
//!
//! The DHT never touches key material directly. Signing goes through the
//! [`Signer`] collaborator and verification through [`Verifier`], so a host
//! application can back them with an HSM, a remote signer or, by default, the
//! Ed25519 implementations in this module.
//!
//! ## Domain Separation
//!
//! Every signed structure is prefixed with a unique domain tag before it is
//! handed to the signer, so a signature produced for one purpose can never be
//! replayed as another (a handshake signature is never a valid peer record).

use ed25519_dalek::{Signature, VerifyingKey};

use crate::identity::{Keypair, NodeId};

// ============================================================================
// Signature Error Types
// ============================================================================

/// Reason a signature failed to verify.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureError {
    /// Signature is missing (empty).
    Missing,
    /// Signature has invalid length (expected 64 bytes for Ed25519).
    InvalidLength,
    /// Cryptographic verification failed.
    VerificationFailed,
    /// The NodeId is not a valid Ed25519 point.
    InvalidPublicKey,
}

impl std::fmt::Display for SignatureError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignatureError::Missing => write!(f, "signature is missing"),
            SignatureError::InvalidLength => write!(f, "signature has invalid length"),
            SignatureError::VerificationFailed => write!(f, "signature verification failed"),
            SignatureError::InvalidPublicKey => write!(f, "invalid public key"),
        }
    }
}

impl std::error::Error for SignatureError {}

// ============================================================================
// Domain Separation Prefixes
// ============================================================================

/// Domain prefix for signed peer records.
pub const PEER_RECORD_SIGNATURE_DOMAIN: &[u8] = b"realm-dht-peer-record-v1:";

/// Domain prefix for the transport identity handshake.
pub const HANDSHAKE_SIGNATURE_DOMAIN: &[u8] = b"realm-dht-handshake-v1:";

// ============================================================================
// Collaborator Traits
// ============================================================================

/// Produces signatures on behalf of the local node.
pub trait Signer: Send + Sync + 'static {
    /// The identity whose private key backs this signer.
    fn node_id(&self) -> NodeId;

    fn sign(&self, data: &[u8]) -> Vec<u8>;
}

/// Checks signatures made by arbitrary nodes.
pub trait Verifier: Send + Sync + 'static {
    fn verify(&self, node_id: &NodeId, data: &[u8], signature: &[u8]) -> bool;
}

impl Signer for Keypair {
    fn node_id(&self) -> NodeId {
        Keypair::node_id(self)
    }

    fn sign(&self, data: &[u8]) -> Vec<u8> {
        Keypair::sign(self, data).to_bytes().to_vec()
    }
}

/// Ed25519 verification where the NodeId is the public key.
#[derive(Clone, Copy, Debug, Default)]
pub struct Ed25519Verifier;

impl Verifier for Ed25519Verifier {
    fn verify(&self, node_id: &NodeId, data: &[u8], signature: &[u8]) -> bool {
        verify_ed25519(node_id, data, signature).is_ok()
    }
}

/// Strict Ed25519 verification of `signature` over `data` by `node_id`.
pub fn verify_ed25519(
    node_id: &NodeId,
    data: &[u8],
    signature: &[u8],
) -> Result<(), SignatureError> {
    if signature.is_empty() {
        return Err(SignatureError::Missing);
    }
    let sig_bytes: [u8; 64] = signature
        .try_into()
        .map_err(|_| SignatureError::InvalidLength)?;
    let verifying_key = VerifyingKey::try_from(node_id.as_bytes().as_slice())
        .map_err(|_| SignatureError::InvalidPublicKey)?;
    let sig = Signature::from_bytes(&sig_bytes);

    verifying_key
        .verify_strict(data, &sig)
        .map_err(|_| SignatureError::VerificationFailed)
}

// ============================================================================
// Domain-Separated Signature Helpers
// ============================================================================

fn prefixed(domain: &[u8], data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(domain.len() + data.len());
    out.extend_from_slice(domain);
    out.extend_from_slice(data);
    out
}

/// Sign `data` under `domain` with the given signer.
pub fn sign_with_domain(signer: &dyn Signer, domain: &[u8], data: &[u8]) -> Vec<u8> {
    signer.sign(&prefixed(domain, data))
}

/// Verify a signature produced by [`sign_with_domain`].
pub fn verify_with_domain(
    verifier: &dyn Verifier,
    node_id: &NodeId,
    domain: &[u8],
    data: &[u8],
    signature: &[u8],
) -> bool {
    signature.len() == 64 && verifier.verify(node_id, &prefixed(domain, data), signature)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn domain_separated_signatures_verify() {
        let kp = Keypair::generate();
        let sig = sign_with_domain(&kp, PEER_RECORD_SIGNATURE_DOMAIN, b"data");
        assert!(verify_with_domain(
            &Ed25519Verifier,
            &kp.node_id(),
            PEER_RECORD_SIGNATURE_DOMAIN,
            b"data",
            &sig
        ));
    }

    #[test]
    fn signature_does_not_cross_domains() {
        let kp = Keypair::generate();
        let sig = sign_with_domain(&kp, HANDSHAKE_SIGNATURE_DOMAIN, b"data");
        assert!(!verify_with_domain(
            &Ed25519Verifier,
            &kp.node_id(),
            PEER_RECORD_SIGNATURE_DOMAIN,
            b"data",
            &sig
        ));
    }

    #[test]
    fn wrong_signer_is_rejected() {
        let kp = Keypair::generate();
        let other = Keypair::generate();
        let sig = Signer::sign(&kp, b"data");
        assert_eq!(
            verify_ed25519(&other.node_id(), b"data", &sig),
            Err(SignatureError::VerificationFailed)
        );
    }

    #[test]
    fn malformed_signatures_are_classified() {
        let kp = Keypair::generate();
        assert_eq!(verify_ed25519(&kp.node_id(), b"x", &[]), Err(SignatureError::Missing));
        assert_eq!(
            verify_ed25519(&kp.node_id(), b"x", &[0u8; 10]),
            Err(SignatureError::InvalidLength)
        );
    }
}
