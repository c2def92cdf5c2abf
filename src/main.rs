//! Cubenet node binary.
//!
//! Starts the cube store, the peer database and the network manager,
//! binds a server for inbound peers and keeps running until interrupted.

use clap::Parser;
use cubenet::net::{Address, NetConfig, NetEvent, NetworkManager, PeerDb, Server, DEFAULT_PORT};
use cubenet::store::{CubeStore, RetentionPolicy};
use cubenet::types::{NodeType, REQUIRED_DIFFICULTY};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "cubenet", version, about = "Cubenet: p2p cube storage node")]
struct Args {
    /// Listen port
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Data directory
    #[arg(short, long, default_value = "./data")]
    data_dir: PathBuf,

    /// Seed nodes (comma-separated ip:port)
    #[arg(short, long)]
    seeds: Option<String>,

    /// Run as a light node (no key polling, no unsolicited cubes)
    #[arg(long)]
    light: bool,

    /// Required hashcash difficulty for stored cubes
    #[arg(long, default_value_t = REQUIRED_DIFFICULTY)]
    difficulty: u8,

    /// Disable peer exchange (node requests neither sent nor honored)
    #[arg(long)]
    no_peer_exchange: bool,

    /// External IP address remote peers can dial us back on
    #[arg(short = 'e', long)]
    external_ip: Option<IpAddr>,

    /// Retention window in days; cubes dated outside +/- this many days
    /// are rejected. 0 disables retention.
    #[arg(long, default_value_t = 0)]
    retention_days: u64,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cubenet=info".into()),
        )
        .init();

    let args = Args::parse();

    if let Err(e) = std::fs::create_dir_all(&args.data_dir) {
        error!("cannot create data dir {}: {}", args.data_dir.display(), e);
        std::process::exit(1);
    }

    let retention = (args.retention_days > 0).then(|| RetentionPolicy {
        past_secs: args.retention_days * 24 * 60 * 60,
        future_secs: args.retention_days * 24 * 60 * 60,
    });

    let store = match CubeStore::open(args.data_dir.join("cubes"), args.difficulty, retention) {
        Ok(s) => Arc::new(s),
        Err(e) => {
            error!("cannot open cube store: {}", e);
            std::process::exit(1);
        }
    };
    info!("cube store open, {} cubes", store.len());

    let peer_db = Arc::new(PeerDb::new());
    let peers_path = args.data_dir.join("peers.dat");
    if peers_path.exists() {
        match peer_db.load(&peers_path).await {
            Ok(()) => info!("loaded peer snapshot"),
            Err(e) => warn!("ignoring peer snapshot: {}", e),
        }
    }

    let my_address = args
        .external_ip
        .map(|ip| Address::Tcp(SocketAddr::new(ip, args.port)));

    let cfg = NetConfig {
        node_type: if args.light {
            NodeType::Light
        } else {
            NodeType::Full
        },
        peer_exchange: !args.no_peer_exchange,
        my_address: my_address.clone(),
        ..NetConfig::default()
    };

    let (manager, mut events) =
        NetworkManager::start(cfg, Arc::clone(&store), Arc::clone(&peer_db));

    let listen = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), args.port);
    match Server::bind(listen, my_address, Arc::clone(&manager)).await {
        Ok(server) => manager.add_server(server).await,
        Err(e) => {
            error!("cannot bind {}: {}", listen, e);
            std::process::exit(1);
        }
    }

    // Seed the peer database so the connect loop has candidates.
    if let Some(seeds) = &args.seeds {
        for seed in seeds.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            match seed.parse::<SocketAddr>() {
                Ok(sock) => {
                    peer_db
                        .learn_peer(cubenet::net::Peer::from_address(Address::Tcp(sock)))
                        .await;
                }
                Err(_) => warn!("bad seed address {:?}, skipping", seed),
            }
        }
    }

    let event_task = tokio::spawn(async move {
        while let Some(ev) = events.recv().await {
            match ev {
                NetEvent::PeerOnline(h) => info!(
                    "peer online: {} ({})",
                    h.remote_socket(),
                    h.remote_id().map(hex::encode).unwrap_or_default()
                ),
                NetEvent::PeerClosed(h) => info!("peer closed: {}", h.remote_socket()),
                NetEvent::Shutdown => break,
            }
        }
    });

    tokio::signal::ctrl_c().await.ok();
    info!("interrupt received, shutting down");
    manager.shutdown().await;
    if let Err(e) = peer_db.save(&peers_path).await {
        warn!("could not save peer snapshot: {}", e);
    }
    event_task.await.ok();
}
