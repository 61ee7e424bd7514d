use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::mpsc;
use tokio::time::{self, Duration};
use tracing::{debug, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use realm_dht::{
    AdvertiseOptions, Dht, DhtConfig, Ed25519Verifier, FindPeersOptions, Inbound, Keypair, NoAddrCache, NodeId,
    PeerInfo, ProtocolHandler, TcpHost,
};

#[derive(Clone, Debug)]
struct BootstrapPeer {
    addr: SocketAddr,
    node_id: NodeId,
}

impl FromStr for BootstrapPeer {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let (addr_part, id_part) = s
            .rsplit_once('/')
            .context("bootstrap peer must include a node id (format: IP:PORT/NODE_ID)")?;

        let addr: SocketAddr = addr_part.parse().context("invalid socket address")?;
        let node_id = NodeId::from_hex(id_part).context("node id must be 64 hex characters")?;

        Ok(BootstrapPeer { addr, node_id })
    }
}

#[derive(Parser, Debug)]
#[command(name = "realm-dht")]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(short, long, default_value = "0.0.0.0:0")]
    bind: SocketAddr,

    /// Address to advertise in the peer record. Defaults to the bound address.
    #[arg(long)]
    external: Option<SocketAddr>,

    #[arg(short = 'B', long = "bootstrap", value_name = "PEER")]
    bootstrap: Vec<BootstrapPeer>,

    /// Namespaces to advertise this node under.
    #[arg(short, long = "provide", value_name = "NAMESPACE")]
    provide: Vec<String>,

    /// Namespace to search for peers in.
    #[arg(long, value_name = "NAMESPACE")]
    discover: Option<String>,

    #[arg(long)]
    realm: Option<String>,

    /// Accept private and loopback addresses in peer records.
    #[arg(long)]
    allow_private: bool,

    #[arg(short, long, default_value = "300")]
    status_interval: u64,
}

async fn serve_inbound(handler: Arc<ProtocolHandler>, mut inbound: mpsc::Receiver<Inbound>) {
    while let Some(Inbound { remote, protocol, stream }) = inbound.recv().await {
        if protocol != handler.protocol_id() {
            debug!(remote = %remote.short(), protocol = %protocol, "unknown protocol");
            continue;
        }
        let handler = handler.clone();
        tokio::spawn(async move {
            if let Err(e) = handler.serve_stream(remote, stream).await {
                debug!(remote = %remote.short(), error = %e, "stream failed");
            }
        });
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .init();

    let keypair = Arc::new(Keypair::generate());
    let (host, inbound) = TcpHost::bind(&args.bind.to_string(), keypair.clone(), Arc::new(Ed25519Verifier)).await?;
    let advertised = args.external.unwrap_or_else(|| host.local_addr());

    let config = DhtConfig {
        listen_addrs: vec![advertised.to_string()],
        allow_private_addrs: args.allow_private,
        bootstrap_peers: args
            .bootstrap
            .iter()
            .map(|p| PeerInfo::new(p.node_id, vec![p.addr.to_string()]))
            .collect(),
        ..DhtConfig::default()
    };

    let dht = Dht::with_keypair(config, host.clone(), keypair, Arc::new(NoAddrCache))?;
    info!("node id: {}", dht.node_id());
    info!("listening on {}", host.local_addr());

    tokio::spawn(serve_inbound(dht.handler(), inbound));
    dht.start().await?;

    for namespace in &args.provide {
        let options = AdvertiseOptions { realm: args.realm.clone() };
        match dht.advertise(namespace, options).await {
            Ok(ttl) => info!(namespace = %namespace, refresh_secs = ttl.as_secs(), "advertised"),
            Err(e) => warn!(namespace = %namespace, error = %e, "advertise failed"),
        }
    }

    let mut interval = time::interval(Duration::from_secs(args.status_interval.max(1)));

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("received shutdown signal, exiting gracefully");
                break;
            }
            _ = interval.tick() => {
                info!(
                    state = ?dht.state(),
                    bootstrapped = dht.is_bootstrapped(),
                    routing_size = dht.routing_table().size(),
                    "status"
                );
                if let Some(namespace) = &args.discover {
                    let options = FindPeersOptions { realm: args.realm.clone(), limit: None };
                    match dht.find_peers(namespace, options) {
                        Ok(mut peers) => {
                            while let Some(peer) = peers.recv().await {
                                info!(namespace = %namespace, peer = %peer.node_id, addrs = ?peer.addrs, "discovered peer");
                            }
                        }
                        Err(e) => warn!(namespace = %namespace, error = %e, "discovery failed"),
                    }
                }
            }
        }
    }

    dht.stop().await?;
    host.shutdown();
    Ok(())
}
