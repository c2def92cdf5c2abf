//! Per-connection protocol state machine.
//!
//! Each connection is driven by one task owning the transport exclusively.
//! The task multiplexes inbound frames, manager commands, store and peer
//! database events, and the protocol timers.
//!
//! ```text
//! State transitions:
//!
//! ┌─────────┐ transport ready ┌──────┐ valid HELLO  ┌────────┐
//! │ Opening │────────────────►│ Open │─────────────►│ Online │
//! └─────────┘                 └──┬───┘              └───┬────┘
//!                                │ HELLO timeout        │ close / error /
//!                                ▼                      ▼ conflicting HELLO
//!                            ┌─────────┐  cleanup  ┌────────┐
//!                            │ Closing │──────────►│ Closed │
//!                            └─────────┘           └────────┘
//! ```
//!
//! Once `Closed`, a peer is never reused; `peer_closed` fires exactly once.

use super::message::{KeyOffer, Message, MessageClass, MessageError, SubscriptionCode};
use super::peer_db::{PeerDb, PeerDbEvent};
use super::transport::{Connection, ConnectionReader, ConnectionWriter, NetError};
use super::types::{
    Address, AddressType, Peer, CUBE_SUBSCRIPTION_PERIOD_SECS, KEY_REQUEST_TIME_SECS,
    MAX_CUBE_HASH_COUNT, MAX_NODE_ADDRESS_COUNT, NETWORK_TIMEOUT_SECS, NODE_REQUEST_TIME_SECS,
    PROTOCOL_VERSION,
};
use crate::cube::{Cube, CubeMeta};
use crate::store::CubeStore;
use crate::types::{now, CubeKey, NodeType, PeerId};
use std::collections::{HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{interval_at, Instant};
use tracing::{debug, info, trace, warn};

/// Housekeeping cadence: HELLO/request timeout checks and subscription
/// expiry.
const MAINTENANCE_INTERVAL_MS: u64 = 1000;

/// Command channel depth per peer.
const COMMAND_CHANNEL_SIZE: usize = 64;

// =============================================================================
// STATE MACHINE
// =============================================================================

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    /// Waiting for the transport to become ready.
    Opening,
    /// Transport ready; HELLO sent, awaiting the remote's.
    Open,
    /// HELLO exchanged; all messages are processed.
    Online,
    /// Teardown in progress.
    Closing,
    /// Fully torn down. Terminal.
    Closed,
}

/// Commands the manager pushes into a running peer task.
#[derive(Debug)]
pub enum PeerCommand {
    /// Ask the remote for its key inventory now.
    SendKeyRequest,
    /// Ask the remote for known peer addresses now.
    SendNodeRequest,
    /// Subscribe to push updates for the given cube keys.
    SubscribeCube(Vec<CubeKey>),
    /// Tear the connection down.
    Close,
}

/// Events surfaced to the owning manager.
#[derive(Debug, Clone)]
pub enum PeerEvent {
    /// HELLO completed; the handle carries the learned remote id.
    Online(PeerHandle),
    /// Connection fully closed. Emitted exactly once per peer.
    Closed(PeerHandle),
}

// =============================================================================
// TRAFFIC COUNTERS
// =============================================================================

#[derive(Default)]
struct ClassCounter {
    tx_packets: AtomicU64,
    tx_bytes: AtomicU64,
    rx_packets: AtomicU64,
    rx_bytes: AtomicU64,
}

/// Per-peer traffic counters, total and broken down per message class.
#[derive(Default)]
pub struct PeerStats {
    tx_packets: AtomicU64,
    tx_bytes: AtomicU64,
    rx_packets: AtomicU64,
    rx_bytes: AtomicU64,
    per_class: [ClassCounter; MessageClass::ALL.len()],
}

/// Snapshot of one class's counters.
#[derive(Debug, Clone)]
pub struct ClassStats {
    pub command: &'static str,
    pub tx_packets: u64,
    pub tx_bytes: u64,
    pub rx_packets: u64,
    pub rx_bytes: u64,
}

/// Point-in-time copy of a peer's counters.
#[derive(Debug, Clone)]
pub struct PeerStatsSnapshot {
    pub tx_packets: u64,
    pub tx_bytes: u64,
    pub rx_packets: u64,
    pub rx_bytes: u64,
    pub per_class: Vec<ClassStats>,
}

impl PeerStats {
    fn record_tx(&self, class: MessageClass, bytes: usize) {
        self.tx_packets.fetch_add(1, Ordering::Relaxed);
        self.tx_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
        let c = &self.per_class[class as usize];
        c.tx_packets.fetch_add(1, Ordering::Relaxed);
        c.tx_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    fn record_rx(&self, class: Option<MessageClass>, bytes: usize) {
        self.rx_packets.fetch_add(1, Ordering::Relaxed);
        self.rx_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
        if let Some(class) = class {
            let c = &self.per_class[class as usize];
            c.rx_packets.fetch_add(1, Ordering::Relaxed);
            c.rx_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> PeerStatsSnapshot {
        PeerStatsSnapshot {
            tx_packets: self.tx_packets.load(Ordering::Relaxed),
            tx_bytes: self.tx_bytes.load(Ordering::Relaxed),
            rx_packets: self.rx_packets.load(Ordering::Relaxed),
            rx_bytes: self.rx_bytes.load(Ordering::Relaxed),
            per_class: MessageClass::ALL
                .iter()
                .map(|class| {
                    let c = &self.per_class[*class as usize];
                    ClassStats {
                        command: class.command(),
                        tx_packets: c.tx_packets.load(Ordering::Relaxed),
                        tx_bytes: c.tx_bytes.load(Ordering::Relaxed),
                        rx_packets: c.rx_packets.load(Ordering::Relaxed),
                        rx_bytes: c.rx_bytes.load(Ordering::Relaxed),
                    }
                })
                .collect(),
        }
    }
}

// =============================================================================
// HANDLE
// =============================================================================

struct PeerSharedState {
    remote_sock: SocketAddr,
    remote_id: std::sync::Mutex<Option<PeerId>>,
    state: std::sync::Mutex<PeerState>,
    stats: PeerStats,
}

/// Cloneable view of a running peer task, held by the manager and tests.
#[derive(Clone)]
pub struct PeerHandle {
    /// Unique per connection for the process lifetime.
    pub index: u64,
    pub inbound: bool,
    shared: Arc<PeerSharedState>,
    cmd_tx: mpsc::Sender<PeerCommand>,
}

impl std::fmt::Debug for PeerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerHandle")
            .field("index", &self.index)
            .field("inbound", &self.inbound)
            .field("remote", &self.remote_socket())
            .field("state", &self.state())
            .finish()
    }
}

impl PeerHandle {
    pub fn remote_socket(&self) -> SocketAddr {
        self.shared.remote_sock
    }

    /// Remote id once HELLO has completed.
    pub fn remote_id(&self) -> Option<PeerId> {
        *self.shared.remote_id.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn state(&self) -> PeerState {
        *self.shared.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_online(&self) -> bool {
        self.state() == PeerState::Online
    }

    pub fn stats(&self) -> PeerStatsSnapshot {
        self.shared.stats.snapshot()
    }

    /// Identity record for this connection: learned id plus the socket
    /// address the stream runs on.
    pub fn peer_record(&self) -> Peer {
        let addr = Address::Tcp(self.remote_socket());
        match self.remote_id() {
            Some(id) => Peer::with_id(id, addr),
            None => Peer::from_address(addr),
        }
    }

    pub async fn send_key_request(&self) {
        let _ = self.cmd_tx.send(PeerCommand::SendKeyRequest).await;
    }

    pub async fn send_node_request(&self) {
        let _ = self.cmd_tx.send(PeerCommand::SendNodeRequest).await;
    }

    pub async fn subscribe_cubes(&self, keys: Vec<CubeKey>) {
        let _ = self.cmd_tx.send(PeerCommand::SubscribeCube(keys)).await;
    }

    pub async fn close(&self) {
        let _ = self.cmd_tx.send(PeerCommand::Close).await;
    }
}

// =============================================================================
// CONTEXT
// =============================================================================

/// Everything a peer task needs from its node.
#[derive(Clone)]
pub struct PeerCtx {
    pub my_id: PeerId,
    pub node_type: NodeType,
    /// When false, node requests are neither sent nor honored.
    pub peer_exchange: bool,
    /// Our dialable server address, advertised after HELLO.
    pub my_address: Option<Address>,
    pub store: Arc<CubeStore>,
    pub peer_db: Arc<PeerDb>,
    pub events_tx: mpsc::Sender<PeerEvent>,
}

// =============================================================================
// NETWORK PEER
// =============================================================================

/// One protocol conversation, owning its transport.
pub struct NetworkPeer {
    handle: PeerHandle,
    /// Frames delivered by the reader task, in receipt order. The reader
    /// owns the read half; a channel recv can be dropped mid-wait without
    /// losing frame alignment.
    frames_rx: mpsc::Receiver<Result<Vec<u8>, NetError>>,
    writer: ConnectionWriter,
    ctx: PeerCtx,
    store_events: broadcast::Receiver<CubeMeta>,
    db_events: broadcast::Receiver<PeerDbEvent>,
    cmd_rx: mpsc::Receiver<PeerCommand>,

    state: PeerState,
    remote_id: Option<PeerId>,

    /// Metadata not yet offered to this remote. Seeded with the whole
    /// store at connect time, fed by `cube_added` afterwards; each entry
    /// is drained at most once.
    unsent_offers: VecDeque<CubeMeta>,
    /// Exchangeable peers not yet advertised to this remote.
    unsent_peers: Vec<Peer>,
    /// Keys we asked this remote for and have not yet received.
    requested: HashSet<CubeKey>,
    /// Keys we subscribed to on this remote (accepts their pushes even on
    /// a light node).
    client_subscriptions: HashSet<CubeKey>,
    /// Keys the remote subscribed to, with expiry timestamps.
    subscriptions: HashMap<CubeKey, u64>,

    hello_deadline: Option<Instant>,
    request_deadline: Option<Instant>,
    closed_emitted: bool,
}

impl NetworkPeer {
    /// Wrap an established connection and spawn its task. Returns the
    /// handle; the task reports further life-cycle through `ctx.events_tx`.
    pub fn spawn(conn: Connection, inbound: bool, index: u64, ctx: PeerCtx) -> PeerHandle {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CHANNEL_SIZE);
        let shared = Arc::new(PeerSharedState {
            remote_sock: conn.peer_socket(),
            remote_id: std::sync::Mutex::new(None),
            state: std::sync::Mutex::new(PeerState::Opening),
            stats: PeerStats::default(),
        });
        let handle = PeerHandle {
            index,
            inbound,
            shared,
            cmd_tx,
        };

        let store_events = ctx.store.subscribe();
        let db_events = ctx.peer_db.subscribe();
        let (reader, writer) = conn.split();
        let (frame_tx, frames_rx) = mpsc::channel(COMMAND_CHANNEL_SIZE);
        tokio::spawn(Self::read_loop(reader, frame_tx));

        let peer = NetworkPeer {
            handle: handle.clone(),
            frames_rx,
            writer,
            ctx,
            store_events,
            db_events,
            cmd_rx,
            state: PeerState::Opening,
            remote_id: None,
            unsent_offers: VecDeque::new(),
            unsent_peers: Vec::new(),
            requested: HashSet::new(),
            client_subscriptions: HashSet::new(),
            subscriptions: HashMap::new(),
            hello_deadline: None,
            request_deadline: None,
            closed_emitted: false,
        };
        tokio::spawn(peer.run());
        handle
    }

    /// Pump frames from the transport into the peer task. Ends on close,
    /// transport error, or when the peer task goes away.
    async fn read_loop(
        mut reader: ConnectionReader,
        tx: mpsc::Sender<Result<Vec<u8>, NetError>>,
    ) {
        loop {
            match reader.next_message().await {
                Ok(Some(frame)) => {
                    if tx.send(Ok(frame)).await.is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    let _ = tx.send(Err(e)).await;
                    break;
                }
            }
        }
    }

    fn set_state(&mut self, state: PeerState) {
        self.state = state;
        *self
            .handle
            .shared
            .state
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = state;
    }

    /// Our own identity record, used to filter ourselves out of peer
    /// exchange.
    fn self_record(&self) -> Peer {
        let mut p = Peer {
            id: Some(self.ctx.my_id),
            addresses: Vec::new(),
            primary: 0,
            last_connect_attempt: 0,
            attempt_count: 0,
        };
        if let Some(addr) = &self.ctx.my_address {
            p.add_address(addr.clone());
        }
        p
    }

    async fn run(mut self) {
        // The transport is ready once constructed: Opening -> Open, HELLO
        // goes out immediately and the response timer starts.
        self.set_state(PeerState::Open);

        // Seed the unsent inventory and peer list for this remote.
        if let Ok(metas) = self.ctx.store.all_meta().await {
            self.unsent_offers.extend(metas);
        }
        let me = self.self_record();
        for p in self.ctx.peer_db.exchangeable_peers().await {
            if !p.same_peer(&me) {
                self.unsent_peers.push(p);
            }
        }

        if self
            .send(&Message::Hello { id: self.ctx.my_id })
            .await
            .is_err()
        {
            self.set_state(PeerState::Closing);
        }
        self.hello_deadline =
            Some(Instant::now() + Duration::from_secs(NETWORK_TIMEOUT_SECS));

        let mut key_timer = interval_at(
            Instant::now() + Duration::from_secs(KEY_REQUEST_TIME_SECS),
            Duration::from_secs(KEY_REQUEST_TIME_SECS),
        );
        let mut node_timer = interval_at(
            Instant::now() + Duration::from_secs(NODE_REQUEST_TIME_SECS),
            Duration::from_secs(NODE_REQUEST_TIME_SECS),
        );
        let mut maintenance = interval_at(
            Instant::now() + Duration::from_millis(MAINTENANCE_INTERVAL_MS),
            Duration::from_millis(MAINTENANCE_INTERVAL_MS),
        );

        while !matches!(self.state, PeerState::Closing | PeerState::Closed) {
            tokio::select! {
                frame = self.frames_rx.recv() => match frame {
                    Some(Ok(bytes)) => {
                        if let Err(e) = self.handle_frame(&bytes).await {
                            debug!("{}: closing after error: {}", self.handle.remote_socket(), e);
                            self.set_state(PeerState::Closing);
                        }
                    }
                    Some(Err(e)) => {
                        debug!("{}: transport error: {}", self.handle.remote_socket(), e);
                        self.set_state(PeerState::Closing);
                    }
                    None => {
                        trace!("{}: remote closed", self.handle.remote_socket());
                        self.set_state(PeerState::Closing);
                    }
                },
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd).await,
                    None => self.set_state(PeerState::Closing),
                },
                ev = self.store_events.recv() => {
                    if let Ok(meta) = ev {
                        self.on_cube_added(meta).await;
                    }
                },
                ev = self.db_events.recv() => {
                    if let Ok(PeerDbEvent::ExchangeablePeer(p)) = ev {
                        self.on_exchangeable_peer(p);
                    }
                },
                _ = key_timer.tick() => {
                    if self.state == PeerState::Online && !self.ctx.node_type.is_light() {
                        self.send_or_close(Message::KeyRequest).await;
                    }
                },
                _ = node_timer.tick() => {
                    if self.state == PeerState::Online && self.ctx.peer_exchange {
                        self.send_or_close(Message::NodeRequest).await;
                    }
                },
                _ = maintenance.tick() => self.maintenance(),
            }
        }

        // Teardown: timers die with this task, event receivers drop, the
        // transport closes, and peer_closed fires exactly once.
        self.writer.close().await;
        self.set_state(PeerState::Closed);
        if !self.closed_emitted {
            self.closed_emitted = true;
            let _ = self
                .ctx
                .events_tx
                .send(PeerEvent::Closed(self.handle.clone()))
                .await;
        }
    }

    // -------------------------------------------------------------------------
    // SENDING
    // -------------------------------------------------------------------------

    async fn send(&mut self, msg: &Message) -> Result<(), NetError> {
        let bytes = msg.encode();
        self.writer.send(&bytes).await?;
        self.handle.shared.stats.record_tx(msg.class(), bytes.len());
        trace!("{}: sent {}", self.handle.remote_socket(), msg.command());
        Ok(())
    }

    async fn send_or_close(&mut self, msg: Message) {
        if let Err(e) = self.send(&msg).await {
            debug!("{}: send failed: {}", self.handle.remote_socket(), e);
            self.set_state(PeerState::Closing);
        }
    }

    // -------------------------------------------------------------------------
    // INBOUND DISPATCH
    // -------------------------------------------------------------------------

    async fn handle_frame(&mut self, bytes: &[u8]) -> Result<(), NetError> {
        // Any inbound traffic satisfies an armed request timer.
        self.request_deadline = None;

        let (version, msg) = match Message::decode(bytes) {
            Ok(v) => v,
            Err(MessageError::BadHello) => {
                // A malformed HELLO id is a handshake failure, not noise.
                warn!("{}: bad hello, closing", self.handle.remote_socket());
                self.handle.shared.stats.record_rx(None, bytes.len());
                return Err(MessageError::BadHello.into());
            }
            Err(e) => {
                // One undecodable message does not take the peer down.
                debug!("{}: undecodable message: {}", self.handle.remote_socket(), e);
                self.handle.shared.stats.record_rx(None, bytes.len());
                return Ok(());
            }
        };
        self.handle
            .shared
            .stats
            .record_rx(Some(msg.class()), bytes.len());
        if version != PROTOCOL_VERSION {
            debug!(
                "{}: protocol version {} (ours {})",
                self.handle.remote_socket(),
                version,
                PROTOCOL_VERSION
            );
        }
        trace!("{}: received {}", self.handle.remote_socket(), msg.command());

        if let Message::Hello { id } = msg {
            return self.handle_hello(id).await;
        }

        // Everything else is processed only once online.
        if self.state != PeerState::Online {
            debug!(
                "{}: ignoring {} before hello",
                self.handle.remote_socket(),
                msg.command()
            );
            return Ok(());
        }

        match msg {
            Message::Hello { .. } => unreachable!("handled above"),
            Message::KeyRequest => self.handle_key_request().await,
            Message::KeyResponse(offers) => self.handle_key_response(offers).await,
            Message::CubeRequest(keys) => self.handle_cube_request(keys).await,
            Message::CubeResponse(cubes) => self.handle_cube_response(cubes).await,
            Message::NodeRequest => self.handle_node_request().await,
            Message::NodeResponse(addrs) => self.handle_node_response(addrs).await,
            Message::MyServerAddress { addr_type, addr } => {
                self.handle_my_server_address(addr_type, &addr).await
            }
            Message::SubscribeCube(keys) => self.handle_subscribe_cube(keys).await,
            Message::SubscriptionConfirmation { code, .. } => {
                debug!(
                    "{}: subscription {}",
                    self.handle.remote_socket(),
                    match code {
                        SubscriptionCode::Confirmed => "confirmed",
                        SubscriptionCode::KeyNotAvailable => "denied (key not available)",
                    }
                );
                Ok(())
            }
        }
    }

    async fn handle_hello(&mut self, id: PeerId) -> Result<(), NetError> {
        if self.state == PeerState::Online {
            if self.remote_id == Some(id) {
                // Re-HELLO with the same id is harmless.
                return Ok(());
            }
            warn!(
                "{}: hello with conflicting id {}, closing",
                self.handle.remote_socket(),
                hex::encode(id)
            );
            self.set_state(PeerState::Closing);
            return Ok(());
        }

        self.remote_id = Some(id);
        *self
            .handle
            .shared
            .remote_id
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(id);
        self.hello_deadline = None;
        self.set_state(PeerState::Online);
        info!(
            "{}: online as {}",
            self.handle.remote_socket(),
            hex::encode(id)
        );

        let _ = self
            .ctx
            .events_tx
            .send(PeerEvent::Online(self.handle.clone()))
            .await;

        if let Some(addr) = self.ctx.my_address.clone() {
            self.send_or_close(Message::MyServerAddress {
                addr_type: addr.kind(),
                addr: addr.to_wire(),
            })
            .await;
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // KEY EXCHANGE
    // -------------------------------------------------------------------------

    async fn handle_key_request(&mut self) -> Result<(), NetError> {
        let mut offers = Vec::new();
        while offers.len() < MAX_CUBE_HASH_COUNT {
            let Some(meta) = self.unsent_offers.pop_front() else {
                break;
            };
            offers.push(KeyOffer {
                cube_type: meta.cube_type as u8,
                challenge_level: meta.challenge_level,
                date: meta.date,
                key: meta.key,
            });
        }
        trace!(
            "{}: offering {} keys",
            self.handle.remote_socket(),
            offers.len()
        );
        self.send(&Message::KeyResponse(offers)).await
    }

    async fn handle_key_response(&mut self, offers: Vec<KeyOffer>) -> Result<(), NetError> {
        let mut missing: Vec<CubeKey> = Vec::new();
        for offer in offers {
            if missing.len() >= MAX_CUBE_HASH_COUNT {
                break;
            }
            if self.requested.contains(&offer.key) {
                continue;
            }
            let stored = self
                .ctx
                .store
                .get_cube_info(&offer.key)
                .await
                .unwrap_or(None);
            match stored {
                None => missing.push(offer.key),
                Some(stored) if stored.cube_type.is_mutable() => {
                    // The advertisement carries no hash, so only the first
                    // two contest criteria can be judged remotely; ties
                    // stay with the incumbent.
                    if (offer.date, offer.challenge_level)
                        > (stored.date, stored.challenge_level)
                    {
                        missing.push(offer.key);
                    }
                }
                Some(_) => {}
            }
        }

        if missing.is_empty() {
            return Ok(());
        }
        debug!(
            "{}: requesting {} cubes",
            self.handle.remote_socket(),
            missing.len()
        );
        self.requested.extend(missing.iter().copied());
        self.request_deadline =
            Some(Instant::now() + Duration::from_secs(NETWORK_TIMEOUT_SECS));
        self.send(&Message::CubeRequest(missing)).await
    }

    async fn handle_cube_request(&mut self, keys: Vec<CubeKey>) -> Result<(), NetError> {
        let mut cubes = Vec::new();
        // Missing keys are silently omitted; the requester saw an
        // advertisement and may ask again.
        for key in keys.iter().take(MAX_CUBE_HASH_COUNT) {
            if let Ok(Some(binary)) = self.ctx.store.get_binary(key) {
                cubes.push(binary);
            }
        }
        trace!(
            "{}: serving {} of {} requested cubes",
            self.handle.remote_socket(),
            cubes.len(),
            keys.len()
        );
        self.send(&Message::CubeResponse(cubes)).await
    }

    async fn handle_cube_response(&mut self, cubes: Vec<Vec<u8>>) -> Result<(), NetError> {
        for binary in cubes {
            let key = match Cube::from_binary(&binary) {
                Ok(mut cube) => cube.key().await.ok(),
                Err(_) => None,
            };

            // Light nodes only accept deliveries they asked for or
            // subscribed to; full nodes take everything (gossip).
            if self.ctx.node_type.is_light() {
                let wanted = key.map(|k| {
                    self.requested.contains(&k) || self.client_subscriptions.contains(&k)
                });
                if !wanted.unwrap_or(false) {
                    debug!(
                        "{}: dropping unsolicited cube delivery",
                        self.handle.remote_socket()
                    );
                    continue;
                }
            }

            // Rejections are logged by the store and otherwise ignored.
            let _ = self.ctx.store.add_cube(&binary).await;
            if let Some(k) = key {
                self.requested.remove(&k);
            }
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // PEER EXCHANGE
    // -------------------------------------------------------------------------

    async fn handle_node_request(&mut self) -> Result<(), NetError> {
        if !self.ctx.peer_exchange {
            return Ok(());
        }
        // Random draw without replacement from the unsent list.
        let mut addrs = Vec::new();
        while addrs.len() < MAX_NODE_ADDRESS_COUNT && !self.unsent_peers.is_empty() {
            let idx =
                rand::Rng::gen_range(&mut rand::thread_rng(), 0..self.unsent_peers.len());
            let peer = self.unsent_peers.swap_remove(idx);
            if let Some(addr) = peer.primary_address() {
                addrs.push((addr.kind(), addr.to_wire()));
            }
        }
        self.send(&Message::NodeResponse(addrs)).await
    }

    async fn handle_node_response(
        &mut self,
        addrs: Vec<(AddressType, String)>,
    ) -> Result<(), NetError> {
        if !self.ctx.peer_exchange {
            return Ok(());
        }
        for (kind, s) in addrs {
            match Address::parse(kind, &s) {
                Ok(addr) => {
                    self.ctx.peer_db.learn_peer(Peer::from_address(addr)).await;
                }
                Err(e) => debug!(
                    "{}: unusable advertised address {:?}: {}",
                    self.handle.remote_socket(),
                    s,
                    e
                ),
            }
        }
        Ok(())
    }

    async fn handle_my_server_address(
        &mut self,
        addr_type: AddressType,
        addr: &str,
    ) -> Result<(), NetError> {
        let observed = self.handle.remote_socket().ip();
        let advertised = match Address::parse_with_observed_ip(addr_type, addr, Some(observed)) {
            Ok(a) => a,
            Err(e) => {
                debug!(
                    "{}: unusable server address {:?}: {}",
                    self.handle.remote_socket(),
                    addr,
                    e
                );
                return Ok(());
            }
        };

        let Some(id) = self.remote_id else {
            return Ok(());
        };
        // The advertised address becomes primary; the socket we actually
        // see the peer on stays as a secondary identity.
        let mut record = Peer::with_id(id, advertised.clone());
        record.add_address(Address::Tcp(self.handle.remote_socket()));
        debug!(
            "{}: advertises server address {}",
            self.handle.remote_socket(),
            advertised
        );
        self.ctx.peer_db.mark_exchangeable(record).await;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // SUBSCRIPTIONS
    // -------------------------------------------------------------------------

    async fn handle_subscribe_cube(&mut self, keys: Vec<CubeKey>) -> Result<(), NetError> {
        if keys.is_empty() {
            return Ok(());
        }

        // Collect current hashes; any unknown key denies the whole set.
        let mut hashes: Vec<crate::types::Hash> = Vec::with_capacity(keys.len());
        let mut all_known = true;
        for key in &keys {
            match self.ctx.store.get_binary(key) {
                Ok(Some(binary)) => hashes.push(crate::crypto::sha3(&binary)),
                _ => {
                    all_known = false;
                    break;
                }
            }
        }

        // Single key: the blobs are the key and its current hash.
        // Multi key: hashes of the concatenations, so the client can
        // verify the confirmed set.
        let key_blob = if keys.len() == 1 {
            keys[0]
        } else {
            let concat: Vec<u8> = keys.iter().flat_map(|k| k.iter().copied()).collect();
            crate::crypto::sha3(&concat)
        };

        if !all_known {
            debug!(
                "{}: denying subscription, key not available",
                self.handle.remote_socket()
            );
            return self
                .send(&Message::SubscriptionConfirmation {
                    code: SubscriptionCode::KeyNotAvailable,
                    key_blob,
                    hash_blob: [0u8; 32],
                    duration_ms: 0,
                })
                .await;
        }

        let hash_blob = if hashes.len() == 1 {
            hashes[0]
        } else {
            let concat: Vec<u8> = hashes.iter().flat_map(|h| h.iter().copied()).collect();
            crate::crypto::sha3(&concat)
        };

        let expiry = now() + CUBE_SUBSCRIPTION_PERIOD_SECS;
        for key in &keys {
            self.subscriptions.insert(*key, expiry);
        }
        debug!(
            "{}: confirmed subscription for {} keys",
            self.handle.remote_socket(),
            keys.len()
        );
        self.send(&Message::SubscriptionConfirmation {
            code: SubscriptionCode::Confirmed,
            key_blob,
            hash_blob,
            duration_ms: (CUBE_SUBSCRIPTION_PERIOD_SECS * 1000) as u32,
        })
        .await
    }

    // -------------------------------------------------------------------------
    // EVENTS
    // -------------------------------------------------------------------------

    async fn on_cube_added(&mut self, meta: CubeMeta) {
        // Push to active subscribers immediately, without a request.
        let subscribed = self
            .subscriptions
            .get(&meta.key)
            .is_some_and(|expiry| *expiry > now());
        if self.state == PeerState::Online && subscribed {
            if let Ok(Some(binary)) = self.ctx.store.get_binary(&meta.key) {
                debug!(
                    "{}: pushing subscribed cube {}",
                    self.handle.remote_socket(),
                    hex::encode(meta.key)
                );
                self.send_or_close(Message::CubeResponse(vec![binary])).await;
            }
        }

        // Queue for the next key request unless an identical offer waits.
        if !self
            .unsent_offers
            .iter()
            .any(|m| m.key == meta.key && m.hash == meta.hash)
        {
            self.unsent_offers.push_back(meta);
        }
    }

    fn on_exchangeable_peer(&mut self, peer: Peer) {
        if peer.same_peer(&self.self_record()) {
            return;
        }
        if !self.unsent_peers.iter().any(|p| p.same_peer(&peer)) {
            self.unsent_peers.push(peer);
        }
    }

    // -------------------------------------------------------------------------
    // COMMANDS AND MAINTENANCE
    // -------------------------------------------------------------------------

    async fn handle_command(&mut self, cmd: PeerCommand) {
        match cmd {
            PeerCommand::SendKeyRequest => self.send_or_close(Message::KeyRequest).await,
            PeerCommand::SendNodeRequest => {
                if self.ctx.peer_exchange {
                    self.send_or_close(Message::NodeRequest).await;
                }
            }
            PeerCommand::SubscribeCube(keys) => {
                self.client_subscriptions.extend(keys.iter().copied());
                self.send_or_close(Message::SubscribeCube(keys)).await;
            }
            PeerCommand::Close => self.set_state(PeerState::Closing),
        }
    }

    fn maintenance(&mut self) {
        let now_instant = Instant::now();
        if let Some(deadline) = self.hello_deadline
            && now_instant >= deadline
        {
            warn!(
                "{}: no hello within {}s, closing",
                self.handle.remote_socket(),
                NETWORK_TIMEOUT_SECS
            );
            self.set_state(PeerState::Closing);
            return;
        }
        if let Some(deadline) = self.request_deadline
            && now_instant >= deadline
        {
            warn!(
                "{}: request timed out, closing",
                self.handle.remote_socket()
            );
            self.set_state(PeerState::Closing);
            return;
        }

        let now_ts = now();
        self.subscriptions.retain(|_, expiry| *expiry > now_ts);
    }
}
