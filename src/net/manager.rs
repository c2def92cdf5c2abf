//! Fleet-level connection orchestration.
//!
//! The manager owns the process peer id, every server and every live
//! connection. It dials new peers from the database up to the connection
//! limit, detects self-connections and duplicates once HELLO identifies
//! the remote, and replaces closed connections.

use super::peer::{NetworkPeer, PeerCtx, PeerEvent, PeerHandle, PeerState};
use super::peer_db::{PeerDb, PeerDbEvent};
use super::server::Server;
use super::transport::{Connection, NetError};
use super::types::{
    Address, Peer, MAXIMUM_CONNECTIONS, NEW_PEER_INTERVAL_MS, RECONNECT_INTERVAL_SECS,
};
use crate::store::CubeStore;
use crate::types::{NodeType, PeerId};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, Notify};
use tracing::{debug, info, warn};

/// Depth of the externally visible event channel.
const EVENT_CHANNEL_SIZE: usize = 256;

/// Node-level networking configuration.
#[derive(Clone)]
pub struct NetConfig {
    pub node_type: NodeType,
    /// When false, node requests are neither sent nor honored.
    pub peer_exchange: bool,
    /// Dialable server address advertised to remotes after HELLO.
    pub my_address: Option<Address>,
    pub maximum_connections: usize,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            node_type: NodeType::Full,
            peer_exchange: true,
            my_address: None,
            maximum_connections: MAXIMUM_CONNECTIONS,
        }
    }
}

/// Events surfaced to the node embedding the manager.
#[derive(Debug, Clone)]
pub enum NetEvent {
    PeerOnline(PeerHandle),
    PeerClosed(PeerHandle),
    Shutdown,
}

/// Fleet-level traffic and connection statistics.
#[derive(Debug, Clone, Default)]
pub struct NetworkStats {
    pub incoming: usize,
    pub outgoing: usize,
    pub online: usize,
    pub tx_packets: u64,
    pub tx_bytes: u64,
    pub rx_packets: u64,
    pub rx_bytes: u64,
}

/// Owns servers and connections; one per node.
pub struct NetworkManager {
    id: PeerId,
    cfg: NetConfig,
    store: Arc<CubeStore>,
    peer_db: Arc<PeerDb>,

    incoming: Mutex<Vec<PeerHandle>>,
    outgoing: Mutex<Vec<PeerHandle>>,
    servers: Mutex<Vec<Server>>,

    peer_events_tx: mpsc::Sender<PeerEvent>,
    net_events_tx: mpsc::Sender<NetEvent>,

    shutting_down: AtomicBool,
    connect_running: AtomicBool,
    next_index: AtomicU64,
    /// Wakes the connect loop early (new peer learned, peer closed).
    connect_nudge: Notify,
}

impl NetworkManager {
    /// Create the manager and spawn its connect and event loops. The
    /// returned receiver carries node-visible [`NetEvent`]s.
    pub fn start(
        cfg: NetConfig,
        store: Arc<CubeStore>,
        peer_db: Arc<PeerDb>,
    ) -> (Arc<NetworkManager>, mpsc::Receiver<NetEvent>) {
        let id: PeerId = rand::random();
        let (peer_events_tx, peer_events_rx) = mpsc::channel(EVENT_CHANNEL_SIZE);
        let (net_events_tx, net_events_rx) = mpsc::channel(EVENT_CHANNEL_SIZE);

        let manager = Arc::new(NetworkManager {
            id,
            cfg,
            store,
            peer_db,
            incoming: Mutex::new(Vec::new()),
            outgoing: Mutex::new(Vec::new()),
            servers: Mutex::new(Vec::new()),
            peer_events_tx,
            net_events_tx,
            shutting_down: AtomicBool::new(false),
            connect_running: AtomicBool::new(false),
            next_index: AtomicU64::new(0),
            connect_nudge: Notify::new(),
        });

        info!("network manager up, id {}", hex::encode(id));
        tokio::spawn(Arc::clone(&manager).event_loop(peer_events_rx));
        tokio::spawn(Arc::clone(&manager).connect_loop());
        tokio::spawn(Arc::clone(&manager).watch_new_peers());

        (manager, net_events_rx)
    }

    /// Our stable 16-byte process identity.
    pub fn id(&self) -> PeerId {
        self.id
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Snapshot of every live connection handle.
    pub async fn peers(&self) -> Vec<PeerHandle> {
        let mut out = self.incoming.lock().await.clone();
        out.extend(self.outgoing.lock().await.iter().cloned());
        out
    }

    /// Live connections that completed HELLO.
    pub async fn online_peers(&self) -> Vec<PeerHandle> {
        self.peers()
            .await
            .into_iter()
            .filter(|h| h.is_online())
            .collect()
    }

    pub async fn connection_count(&self) -> usize {
        self.incoming.lock().await.len() + self.outgoing.lock().await.len()
    }

    /// Aggregate counters over every live connection.
    pub async fn stats(&self) -> NetworkStats {
        let incoming = self.incoming.lock().await.clone();
        let outgoing = self.outgoing.lock().await.clone();
        let mut stats = NetworkStats {
            incoming: incoming.len(),
            outgoing: outgoing.len(),
            ..NetworkStats::default()
        };
        for handle in incoming.iter().chain(outgoing.iter()) {
            if handle.is_online() {
                stats.online += 1;
            }
            let s = handle.stats();
            stats.tx_packets += s.tx_packets;
            stats.tx_bytes += s.tx_bytes;
            stats.rx_packets += s.rx_packets;
            stats.rx_bytes += s.rx_bytes;
        }
        stats
    }

    /// Register a server so shutdown reaches it.
    pub async fn add_server(&self, server: Server) {
        self.servers.lock().await.push(server);
    }

    // -------------------------------------------------------------------------
    // CONNECTING
    // -------------------------------------------------------------------------

    /// Dial an explicit address (seed nodes, tests, CLI).
    pub async fn connect(self: &Arc<Self>, addr: &Address) -> Result<Option<PeerHandle>, NetError> {
        let conn = Connection::connect(addr).await?;
        Ok(self.register_connection(conn, false).await)
    }

    /// Adopt an established connection. Used by servers for inbound
    /// streams and by the dialer for outbound ones.
    pub async fn register_connection(
        self: &Arc<Self>,
        conn: Connection,
        inbound: bool,
    ) -> Option<PeerHandle> {
        if self.is_shutting_down() {
            return None;
        }
        if inbound && self.connection_count().await >= self.cfg.maximum_connections {
            warn!(
                "dropping inbound connection from {}: at connection limit",
                conn.peer_socket()
            );
            return None;
        }

        let index = self.next_index.fetch_add(1, Ordering::SeqCst);
        let ctx = PeerCtx {
            my_id: self.id,
            node_type: self.cfg.node_type,
            peer_exchange: self.cfg.peer_exchange,
            my_address: self.cfg.my_address.clone(),
            store: Arc::clone(&self.store),
            peer_db: Arc::clone(&self.peer_db),
            events_tx: self.peer_events_tx.clone(),
        };
        let handle = NetworkPeer::spawn(conn, inbound, index, ctx);
        if inbound {
            self.incoming.lock().await.push(handle.clone());
        } else {
            self.outgoing.lock().await.push(handle.clone());
        }
        debug!(
            "{} connection #{} to {}",
            if inbound { "inbound" } else { "outbound" },
            index,
            handle.remote_socket()
        );
        Some(handle)
    }

    /// One pass of the connect loop: pick and dial at most one candidate.
    /// Returns whether a candidate was selected.
    async fn connect_peers(self: &Arc<Self>) -> bool {
        if self.is_shutting_down() {
            return false;
        }
        // A second concurrent pass would double-dial the same candidate.
        if self
            .connect_running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }

        let found = 'pass: {
            if self.connection_count().await >= self.cfg.maximum_connections {
                break 'pass false;
            }
            let exclude: Vec<Peer> = self
                .peers()
                .await
                .iter()
                .map(|h| h.peer_record())
                .collect();
            let Some(candidate) = self.peer_db.select(&exclude).await else {
                break 'pass false;
            };
            self.peer_db.record_attempt(&candidate).await;
            let manager = Arc::clone(self);
            tokio::spawn(async move {
                manager.dial(candidate).await;
            });
            true
        };

        self.connect_running.store(false, Ordering::SeqCst);
        found
    }

    async fn dial(self: Arc<Self>, peer: Peer) {
        let Some(addr) = peer.primary_address().cloned() else {
            return;
        };
        match Connection::connect(&addr).await {
            Ok(conn) => {
                self.register_connection(conn, false).await;
            }
            Err(e) => debug!("dial {} failed: {}", addr, e),
        }
    }

    async fn connect_loop(self: Arc<Self>) {
        loop {
            if self.is_shutting_down() {
                break;
            }
            let found = self.connect_peers().await;
            let wait = if found {
                Duration::from_millis(NEW_PEER_INTERVAL_MS)
            } else {
                Duration::from_secs(RECONNECT_INTERVAL_SECS)
            };
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = self.connect_nudge.notified() => {}
            }
        }
    }

    /// Opportunistic dialing: a freshly learned peer wakes the connect
    /// loop instead of waiting out the interval.
    async fn watch_new_peers(self: Arc<Self>) {
        let mut rx = self.peer_db.subscribe();
        loop {
            match rx.recv().await {
                Ok(PeerDbEvent::NewPeer(_)) => self.connect_nudge.notify_one(),
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
            if self.is_shutting_down() {
                break;
            }
        }
    }

    // -------------------------------------------------------------------------
    // PEER LIFE-CYCLE
    // -------------------------------------------------------------------------

    async fn event_loop(self: Arc<Self>, mut rx: mpsc::Receiver<PeerEvent>) {
        while let Some(event) = rx.recv().await {
            match event {
                PeerEvent::Online(handle) => self.on_peer_online(handle).await,
                PeerEvent::Closed(handle) => self.on_peer_closed(handle).await,
            }
        }
    }

    async fn on_peer_online(self: &Arc<Self>, handle: PeerHandle) {
        let Some(remote_id) = handle.remote_id() else {
            return;
        };

        // Self-connection: we completed a HELLO with our own id. Both
        // ends of the loop report online; only the first blacklists.
        if remote_id == self.id {
            warn!(
                "connected to ourselves via {}, blacklisting",
                handle.remote_socket()
            );
            let record = handle.peer_record();
            if !self.peer_db.is_blacklisted(&record).await {
                self.peer_db.blacklist(record).await;
            }
            handle.close().await;
            return;
        }

        // Duplicate: another live connection already carries this id.
        // Close the newer one and teach the original record the extra
        // address form.
        let duplicate_of = self
            .peers()
            .await
            .into_iter()
            .find(|h| {
                h.index != handle.index
                    && h.remote_id() == Some(remote_id)
                    && !matches!(h.state(), PeerState::Closing | PeerState::Closed)
            });
        if let Some(original) = duplicate_of {
            info!(
                "duplicate connection to {} (already at {}), closing newer",
                hex::encode(remote_id),
                original.remote_socket()
            );
            self.peer_db
                .add_known_address(
                    &original.peer_record(),
                    Address::Tcp(handle.remote_socket()),
                )
                .await;
            handle.close().await;
            return;
        }

        self.peer_db.verify_peer(handle.peer_record()).await;
        self.peer_db.record_success(&handle.peer_record()).await;

        // Eager kick: one immediate round instead of waiting out the
        // periodic timers, which keep running inside the peer.
        if !self.cfg.node_type.is_light() {
            handle.send_key_request().await;
        }
        if self.cfg.peer_exchange {
            handle.send_node_request().await;
        }

        let _ = self.net_events_tx.send(NetEvent::PeerOnline(handle)).await;
    }

    async fn on_peer_closed(self: &Arc<Self>, handle: PeerHandle) {
        let list = if handle.inbound {
            &self.incoming
        } else {
            &self.outgoing
        };
        list.lock().await.retain(|h| h.index != handle.index);
        debug!("connection #{} closed", handle.index);

        let _ = self.net_events_tx.send(NetEvent::PeerClosed(handle)).await;
        // Look for a replacement right away.
        self.connect_nudge.notify_one();
    }

    // -------------------------------------------------------------------------
    // SHUTDOWN
    // -------------------------------------------------------------------------

    /// Stop the connect loop, shut the servers, close every peer. Safe to
    /// call more than once.
    pub async fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("network manager shutting down");
        self.connect_nudge.notify_one();

        for server in self.servers.lock().await.drain(..) {
            server.shutdown();
        }
        for handle in self.peers().await {
            handle.close().await;
        }
        let _ = self.net_events_tx.send(NetEvent::Shutdown).await;
    }
}
