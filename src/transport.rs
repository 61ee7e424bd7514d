//! # TCP Transport
//!
//! [`TcpHost`] implements [`Host`] over plain TCP, one connection per
//! stream. Each stream opens with a mutual identity handshake:
//!
//! ```text
//! dialer                                    listener
//!   │── Hello { node_id, protocol, nonce_d } ──▶│
//!   │◀── Ack { node_id, nonce_l, sig(nonce_d) } ─│   dialer checks node_id == expected
//!   │── Proof { sig(nonce_l) } ─────────────────▶│   listener checks sig against Hello.node_id
//! ```
//!
//! Signatures cover `nonce ‖ signer_id ‖ peer_id` under
//! [`HANDSHAKE_SIGNATURE_DOMAIN`]. After the handshake the stream carries DHT
//! frames and the listener hands it to the application as an [`Inbound`]
//! together with the verified identity.
//!
//! `connect` dials and parks the raw socket. `open_stream` consumes a parked
//! socket when there is one and dials the last working address otherwise.

use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use lru::LruCache;
use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::crypto::{sign_with_domain, verify_with_domain, Signer, Verifier, HANDSHAKE_SIGNATURE_DOMAIN};
use crate::identity::NodeId;
use crate::messages::{read_frame, write_frame};
use crate::protocols::{BoxedStream, Host};

/// Deadline for TCP connect plus handshake.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

const MAX_HANDSHAKE_FRAME: usize = 4 * 1024;
const MAX_KNOWN_PEERS: usize = 4_096;
const INBOUND_QUEUE: usize = 256;

#[derive(Serialize, Deserialize)]
struct Hello {
    node_id: NodeId,
    protocol: String,
    nonce: [u8; 32],
}

#[derive(Serialize, Deserialize)]
struct Ack {
    node_id: NodeId,
    nonce: [u8; 32],
    signature: Vec<u8>,
}

#[derive(Serialize, Deserialize)]
struct Proof {
    signature: Vec<u8>,
}

/// An authenticated inbound stream.
pub struct Inbound {
    pub remote: NodeId,
    pub protocol: String,
    pub stream: BoxedStream,
}

impl std::fmt::Debug for Inbound {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Inbound")
            .field("remote", &self.remote)
            .field("protocol", &self.protocol)
            .finish_non_exhaustive()
    }
}

fn transcript(nonce: &[u8; 32], signer: &NodeId, peer: &NodeId) -> Vec<u8> {
    let mut data = Vec::with_capacity(96);
    data.extend_from_slice(nonce);
    data.extend_from_slice(signer.as_bytes());
    data.extend_from_slice(peer.as_bytes());
    data
}

fn fresh_nonce() -> Result<[u8; 32]> {
    let mut nonce = [0u8; 32];
    getrandom::getrandom(&mut nonce).map_err(|e| anyhow::anyhow!("nonce generation failed: {e}"))?;
    Ok(nonce)
}

pub struct TcpHost {
    signer: Arc<dyn Signer>,
    verifier: Arc<dyn Verifier>,
    local_addr: SocketAddr,
    parked: Mutex<LruCache<NodeId, TcpStream>>,
    known: Mutex<LruCache<NodeId, SocketAddr>>,
    cancel: CancellationToken,
}

impl TcpHost {
    /// Listen on `addr`. Authenticated inbound streams arrive on the
    /// returned receiver.
    pub async fn bind(
        addr: &str,
        signer: Arc<dyn Signer>,
        verifier: Arc<dyn Verifier>,
    ) -> Result<(Arc<Self>, mpsc::Receiver<Inbound>)> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind {addr}"))?;
        let local_addr = listener.local_addr()?;
        let capacity = NonZeroUsize::new(MAX_KNOWN_PEERS).unwrap_or(NonZeroUsize::MIN);

        let host = Arc::new(Self {
            signer,
            verifier,
            local_addr,
            parked: Mutex::new(LruCache::new(capacity)),
            known: Mutex::new(LruCache::new(capacity)),
            cancel: CancellationToken::new(),
        });

        let (tx, rx) = mpsc::channel(INBOUND_QUEUE);
        tokio::spawn(host.clone().accept_loop(listener, tx));
        debug!(addr = %local_addr, node = %host.signer.node_id().short(), "tcp host listening");
        Ok((host, rx))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn node_id(&self) -> NodeId {
        self.signer.node_id()
    }

    /// Stop accepting connections.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener, tx: mpsc::Sender<Inbound>) {
        loop {
            let accepted = tokio::select! {
                _ = self.cancel.cancelled() => break,
                accepted = listener.accept() => accepted,
            };
            let (stream, remote_addr) = match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    continue;
                }
            };
            let host = self.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                match tokio::time::timeout(HANDSHAKE_TIMEOUT, host.accept_handshake(stream)).await {
                    Ok(Ok(inbound)) => {
                        trace!(remote = %inbound.remote.short(), addr = %remote_addr, "inbound stream");
                        let _ = tx.send(inbound).await;
                    }
                    Ok(Err(e)) => debug!(addr = %remote_addr, error = %e, "inbound handshake failed"),
                    Err(_) => debug!(addr = %remote_addr, "inbound handshake timed out"),
                }
            });
        }
        debug!(addr = %self.local_addr, "tcp host stopped accepting");
    }

    async fn accept_handshake(&self, mut stream: TcpStream) -> Result<Inbound> {
        let local = self.signer.node_id();
        let hello: Hello = read_frame(&mut stream, MAX_HANDSHAKE_FRAME).await?;
        let nonce = fresh_nonce()?;
        let ack = Ack {
            node_id: local,
            nonce,
            signature: sign_with_domain(
                self.signer.as_ref(),
                HANDSHAKE_SIGNATURE_DOMAIN,
                &transcript(&hello.nonce, &local, &hello.node_id),
            ),
        };
        write_frame(&mut stream, &ack).await?;

        let proof: Proof = read_frame(&mut stream, MAX_HANDSHAKE_FRAME).await?;
        if !verify_with_domain(
            self.verifier.as_ref(),
            &hello.node_id,
            HANDSHAKE_SIGNATURE_DOMAIN,
            &transcript(&nonce, &hello.node_id, &local),
            &proof.signature,
        ) {
            anyhow::bail!("handshake proof from {} does not verify", hello.node_id.short());
        }
        Ok(Inbound {
            remote: hello.node_id,
            protocol: hello.protocol,
            stream: Box::new(stream),
        })
    }

    async fn dial_handshake(&self, mut stream: TcpStream, expected: &NodeId, protocol: &str) -> Result<TcpStream> {
        let local = self.signer.node_id();
        let nonce = fresh_nonce()?;
        write_frame(
            &mut stream,
            &Hello {
                node_id: local,
                protocol: protocol.to_string(),
                nonce,
            },
        )
        .await?;

        let ack: Ack = read_frame(&mut stream, MAX_HANDSHAKE_FRAME).await?;
        if ack.node_id != *expected {
            anyhow::bail!("dialed {} but reached {}", expected.short(), ack.node_id.short());
        }
        if !verify_with_domain(
            self.verifier.as_ref(),
            expected,
            HANDSHAKE_SIGNATURE_DOMAIN,
            &transcript(&nonce, expected, &local),
            &ack.signature,
        ) {
            anyhow::bail!("handshake signature from {} does not verify", expected.short());
        }

        let proof = Proof {
            signature: sign_with_domain(
                self.signer.as_ref(),
                HANDSHAKE_SIGNATURE_DOMAIN,
                &transcript(&ack.nonce, &local, expected),
            ),
        };
        write_frame(&mut stream, &proof).await?;
        Ok(stream)
    }

    async fn dial(&self, node_id: &NodeId, addrs: &[SocketAddr]) -> Result<(TcpStream, SocketAddr)> {
        let mut last_error = None;
        for addr in addrs {
            match tokio::time::timeout(HANDSHAKE_TIMEOUT, TcpStream::connect(addr)).await {
                Ok(Ok(stream)) => {
                    let _ = stream.set_nodelay(true);
                    return Ok((stream, *addr));
                }
                Ok(Err(e)) => last_error = Some(anyhow::Error::new(e).context(format!("connect {addr}"))),
                Err(_) => last_error = Some(anyhow::anyhow!("connect {addr} timed out")),
            }
        }
        Err(last_error.unwrap_or_else(|| anyhow::anyhow!("no usable address for {}", node_id.short())))
    }
}

#[async_trait]
impl Host for TcpHost {
    async fn connect(&self, node_id: &NodeId, addrs: &[String]) -> Result<()> {
        let parsed: Vec<SocketAddr> = addrs.iter().filter_map(|a| a.parse().ok()).collect();
        let (stream, addr) = self.dial(node_id, &parsed).await?;
        self.known
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .put(*node_id, addr);
        self.parked
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .put(*node_id, stream);
        Ok(())
    }

    async fn open_stream(&self, node_id: &NodeId, protocol: &str) -> Result<BoxedStream> {
        let parked = self.parked.lock().unwrap_or_else(|p| p.into_inner()).pop(node_id);
        let stream = match parked {
            Some(stream) => stream,
            None => {
                let addr = self
                    .known
                    .lock()
                    .unwrap_or_else(|p| p.into_inner())
                    .get(node_id)
                    .copied()
                    .with_context(|| format!("not connected to {}", node_id.short()))?;
                self.dial(node_id, &[addr]).await?.0
            }
        };
        let stream = tokio::time::timeout(HANDSHAKE_TIMEOUT, self.dial_handshake(stream, node_id, protocol))
            .await
            .context("handshake timed out")??;
        Ok(Box::new(stream))
    }
}

impl std::fmt::Debug for TcpHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpHost")
            .field("node_id", &self.signer.node_id())
            .field("local_addr", &self.local_addr)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Ed25519Verifier;
    use crate::identity::Keypair;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    async fn host() -> (Arc<TcpHost>, mpsc::Receiver<Inbound>, Arc<Keypair>) {
        let kp = Arc::new(Keypair::generate());
        let (host, rx) = TcpHost::bind("127.0.0.1:0", kp.clone(), Arc::new(Ed25519Verifier))
            .await
            .unwrap();
        (host, rx, kp)
    }

    #[tokio::test]
    async fn handshake_delivers_verified_identity() {
        let (a, _a_rx, a_kp) = host().await;
        let (b, mut b_rx, b_kp) = host().await;

        a.connect(&b_kp.node_id(), &[b.local_addr().to_string()]).await.unwrap();
        let mut stream = a.open_stream(&b_kp.node_id(), "/test/1").await.unwrap();
        stream.write_all(b"ping").await.unwrap();

        let mut inbound = b_rx.recv().await.unwrap();
        assert_eq!(inbound.remote, a_kp.node_id());
        assert_eq!(inbound.protocol, "/test/1");
        let mut buf = [0u8; 4];
        inbound.stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[tokio::test]
    async fn wrong_expected_identity_is_refused() {
        let (a, _a_rx, _) = host().await;
        let (b, _b_rx, _) = host().await;
        let stranger = Keypair::generate().node_id();

        a.connect(&stranger, &[b.local_addr().to_string()]).await.unwrap();
        let err = a.open_stream(&stranger, "/test/1").await.err().unwrap();
        assert!(format!("{err:#}").contains("but reached"));
    }

    #[tokio::test]
    async fn reconnects_from_remembered_address() {
        let (a, _a_rx, _) = host().await;
        let (b, mut b_rx, b_kp) = host().await;

        a.connect(&b_kp.node_id(), &[b.local_addr().to_string()]).await.unwrap();
        drop(a.open_stream(&b_kp.node_id(), "/test/1").await.unwrap());
        // The parked socket was consumed; this dials again.
        drop(a.open_stream(&b_kp.node_id(), "/test/1").await.unwrap());
        assert!(b_rx.recv().await.is_some());
        assert!(b_rx.recv().await.is_some());
    }

    #[tokio::test]
    async fn unknown_peer_without_connect_fails() {
        let (a, _a_rx, _) = host().await;
        let err = a.open_stream(&Keypair::generate().node_id(), "/test/1").await.err().unwrap();
        assert!(err.to_string().contains("not connected"));
    }
}
