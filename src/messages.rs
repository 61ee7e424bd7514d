//! # Wire Protocol Messages
//!
//! Logical schema of the DHT protocol and its framing.
//!
//! ## Message Types
//!
//! | Type | Request payload | Response |
//! |------|-----------------|----------|
//! | `FIND_NODE` | target key | `Nodes` |
//! | `FIND_VALUE` | key | `Value` (record or closer peers) |
//! | `STORE` | key, record, TTL | `Stored` |
//! | `PING` | none | `Pong` |
//! | `ADD_PROVIDER` | key, TTL | `Stored` |
//! | `GET_PROVIDERS` | key | `Providers` |
//! | `REMOVE_PROVIDER` | key | `Stored` |
//!
//! Any request may instead be answered with `Error { reason, .. }`.
//!
//! Every envelope carries the requester-chosen `request_id` and the sender's
//! [`PeerInfo`]. A response must echo the request id and come from the node
//! the request was sent to.
//!
//! ## Framing
//!
//! One exchange per stream: a 4-byte big-endian length followed by a bincode
//! body, first for the request and then for the response. All decoding goes
//! through [`deserialize_bounded`].

use anyhow::{Context, Result};
use bincode::Options;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::identity::PeerInfo;
use crate::keyspace::Key;
use crate::record::SignedPeerRecord;

/// Ceiling for a stored value, whatever the configuration says (1 MiB).
pub const MAX_VALUE_SIZE: usize = 1024 * 1024;

/// Maximum buffer size for deserialization: one maximal value plus room for
/// peer lists and envelope fields.
pub const MAX_DESERIALIZE_SIZE: u64 = (MAX_VALUE_SIZE as u64) + 64 * 1024;

/// Maximum peers accepted from a single response.
/// SECURITY: a single peer cannot flood a lookup shortlist.
pub const MAX_PEERS_PER_RESPONSE: usize = 100;

/// Returns bincode options with size limits enforced.
fn bincode_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_DESERIALIZE_SIZE)
        .with_fixint_encoding()
}

/// Deserialize with size bounds enforced.
pub fn deserialize_bounded<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, bincode::Error> {
    bincode_options().deserialize(bytes)
}

pub fn serialize<T: Serialize>(value: &T) -> Result<Vec<u8>, bincode::Error> {
    bincode_options().serialize(value)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    FindNode,
    FindValue,
    Store,
    Ping,
    AddProvider,
    GetProviders,
    RemoveProvider,
}

/// Payload of a STORE.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum StoreRecord {
    Value(Vec<u8>),
    PeerRecord(SignedPeerRecord),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum RequestBody {
    FindNode { target: Key },
    FindValue { key: Key },
    Store { key: Key, record: StoreRecord, ttl_secs: u64 },
    Ping,
    /// Announces the sender as a provider of `key`.
    AddProvider { key: Key, ttl_secs: u64 },
    GetProviders { key: Key },
    /// Withdraws the sender's own provider record for `key`.
    RemoveProvider { key: Key },
}

impl RequestBody {
    pub fn message_type(&self) -> MessageType {
        match self {
            RequestBody::FindNode { .. } => MessageType::FindNode,
            RequestBody::FindValue { .. } => MessageType::FindValue,
            RequestBody::Store { .. } => MessageType::Store,
            RequestBody::Ping => MessageType::Ping,
            RequestBody::AddProvider { .. } => MessageType::AddProvider,
            RequestBody::GetProviders { .. } => MessageType::GetProviders,
            RequestBody::RemoveProvider { .. } => MessageType::RemoveProvider,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Request {
    pub request_id: u64,
    pub sender: PeerInfo,
    pub body: RequestBody,
}

/// Why a request was refused.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RejectReason {
    RateLimited,
    InvalidSignature,
    StaleSequence,
    DisallowedAddress,
    IdentityMismatch,
    KeyMismatch,
    Malformed,
    TooLarge,
    StoreFull,
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RejectReason::RateLimited => "rate limit exceeded",
            RejectReason::InvalidSignature => "invalid signature",
            RejectReason::StaleSequence => "sequence number not newer than last accepted",
            RejectReason::DisallowedAddress => "address not publicly routable",
            RejectReason::IdentityMismatch => "sender does not match connection identity",
            RejectReason::KeyMismatch => "key does not match record",
            RejectReason::Malformed => "malformed request",
            RejectReason::TooLarge => "value too large",
            RejectReason::StoreFull => "store full",
        };
        f.write_str(s)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum ResponseBody {
    Pong,
    Stored,
    Nodes {
        closer: Vec<PeerInfo>,
    },
    Value {
        record: Option<StoreRecord>,
        closer: Vec<PeerInfo>,
    },
    Providers {
        providers: Vec<PeerInfo>,
        closer: Vec<PeerInfo>,
    },
    Error {
        reason: RejectReason,
        message: String,
    },
}

impl ResponseBody {
    pub fn rejected(reason: RejectReason) -> Self {
        ResponseBody::Error {
            reason,
            message: reason.to_string(),
        }
    }

    /// Closer peers carried by lookup responses.
    pub fn closer(&self) -> &[PeerInfo] {
        match self {
            ResponseBody::Nodes { closer }
            | ResponseBody::Value { closer, .. }
            | ResponseBody::Providers { closer, .. } => closer,
            _ => &[],
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Response {
    pub request_id: u64,
    pub sender: PeerInfo,
    pub body: ResponseBody,
}

// ============================================================================
// Framing
// ============================================================================

/// Write one length-prefixed frame.
pub async fn write_frame<W, T>(writer: &mut W, message: &T) -> Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
    T: Serialize,
{
    let bytes = serialize(message).context("failed to serialize frame")?;
    let len = u32::try_from(bytes.len()).context("frame length overflows u32")?;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one length-prefixed frame, refusing bodies above `max_len`.
pub async fn read_frame<R, T>(reader: &mut R, max_len: usize) -> Result<T>
where
    R: AsyncRead + Unpin + ?Sized,
    T: DeserializeOwned,
{
    let mut len_buf = [0u8; 4];
    reader
        .read_exact(&mut len_buf)
        .await
        .context("failed to read frame header")?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > max_len {
        anyhow::bail!("frame too large: {} bytes (max {})", len, max_len);
    }
    let mut body = vec![0u8; len];
    reader
        .read_exact(&mut body)
        .await
        .context("failed to read frame body")?;
    deserialize_bounded(&body).context("failed to deserialize frame")
}
