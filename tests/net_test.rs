//! End-to-end network scenarios over localhost TCP.
//!
//! Each test wires full in-process nodes (store, peer database, manager,
//! server) together and drives the real protocol. Difficulty is 0
//! throughout so cube sealing is instant.
//!
//! Run with: cargo test --test net_test -- --nocapture

use cubenet::crypto::{sha3, Keypair};
use cubenet::cube::Cube;
use cubenet::field::Field;
use cubenet::net::{Address, NetConfig, NetEvent, NetworkManager, PeerDb, PeerHandle, Server};
use cubenet::store::CubeStore;
use cubenet::types::{now_timestamp, CubeKey, NodeType};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::sleep;

/// Sequential test ports; each node gets its own.
static NEXT_PORT: AtomicU16 = AtomicU16::new(29310);

fn next_port() -> u16 {
    NEXT_PORT.fetch_add(1, Ordering::SeqCst)
}

struct TestNode {
    port: u16,
    store: Arc<CubeStore>,
    peer_db: Arc<PeerDb>,
    manager: Arc<NetworkManager>,
    #[allow(dead_code)]
    events: mpsc::Receiver<NetEvent>,
}

impl TestNode {
    async fn spawn(node_type: NodeType) -> TestNode {
        let port = next_port();
        let store = Arc::new(CubeStore::open_temporary(0, None).unwrap());
        let peer_db = Arc::new(PeerDb::new());
        let my_address = Address::Tcp(format!("127.0.0.1:{}", port).parse().unwrap());

        let cfg = NetConfig {
            node_type,
            peer_exchange: true,
            my_address: Some(my_address.clone()),
            ..NetConfig::default()
        };
        let (manager, events) =
            NetworkManager::start(cfg, Arc::clone(&store), Arc::clone(&peer_db));

        let listen: SocketAddr = format!("0.0.0.0:{}", port).parse().unwrap();
        let server = Server::bind(listen, Some(my_address), Arc::clone(&manager))
            .await
            .unwrap();
        manager.add_server(server).await;

        TestNode {
            port,
            store,
            peer_db,
            manager,
            events,
        }
    }

    fn address(&self) -> Address {
        Address::Tcp(format!("127.0.0.1:{}", self.port).parse().unwrap())
    }

    /// Dial another node and wait for the HELLO exchange to finish.
    async fn connect_to(&self, other: &TestNode) -> PeerHandle {
        let handle = self
            .manager
            .connect(&other.address())
            .await
            .unwrap()
            .expect("connection registered");
        assert!(
            wait_until(|| {
                let h = handle.clone();
                async move { h.is_online() }
            })
            .await,
            "handshake did not complete"
        );
        handle
    }
}

/// Poll a condition for up to three seconds (the scenario budget).
async fn wait_until<F, Fut>(cond: F) -> bool
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..60 {
        if cond().await {
            return true;
        }
        sleep(Duration::from_millis(50)).await;
    }
    false
}

async fn add_frozen(store: &CubeStore, payload: &[u8]) -> CubeKey {
    let mut cube = Cube::sculpt_frozen(vec![Field::payload(payload.to_vec())], 0).unwrap();
    let bytes = cube.binary().await.unwrap().to_vec();
    store.add_cube(&bytes).await.unwrap().expect("stored").key
}

async fn add_muc(store: &CubeStore, seed: u8, payload: &[u8], date: u64) -> CubeKey {
    let mut cube = Cube::sculpt_muc(
        Keypair::from_seed(&[seed; 32]),
        vec![Field::payload(payload.to_vec())],
        0,
    )
    .unwrap();
    cube.set_date(date).unwrap();
    let bytes = cube.binary().await.unwrap().to_vec();
    store.add_cube(&bytes).await.unwrap().expect("stored").key
}

/// Scenario: frozen cube sync across a three-node chain.
#[tokio::test(flavor = "multi_thread")]
async fn frozen_sync_between_three_peers() {
    let a = TestNode::spawn(NodeType::Full).await;
    let b = TestNode::spawn(NodeType::Full).await;
    let c = TestNode::spawn(NodeType::Full).await;

    for i in 0u8..10 {
        add_frozen(&a.store, &[i]).await;
    }
    assert_eq!(a.store.len(), 10);

    // B pulls from A.
    let b_to_a = b.connect_to(&a).await;
    b_to_a.send_key_request().await;
    let b_store = Arc::clone(&b.store);
    assert!(
        wait_until(|| {
            let s = Arc::clone(&b_store);
            async move { s.len() == 10 }
        })
        .await,
        "b did not sync all cubes (has {})",
        b.store.len()
    );

    // C pulls from B.
    let c_to_b = c.connect_to(&b).await;
    c_to_b.send_key_request().await;
    let c_store = Arc::clone(&c.store);
    assert!(
        wait_until(|| {
            let s = Arc::clone(&c_store);
            async move { s.len() == 10 }
        })
        .await,
        "c did not sync all cubes (has {})",
        c.store.len()
    );

    // Byte-identical replicas.
    for key in a.store.all_keys().unwrap() {
        let original = a.store.get_binary(&key).unwrap().unwrap();
        assert_eq!(b.store.get_binary(&key).unwrap().unwrap(), original);
        assert_eq!(c.store.get_binary(&key).unwrap().unwrap(), original);
    }
}

/// Scenario: a MUC update converges to the newer version.
#[tokio::test(flavor = "multi_thread")]
async fn muc_update_convergence() {
    let a = TestNode::spawn(NodeType::Full).await;
    let b = TestNode::spawn(NodeType::Full).await;

    let t = now_timestamp();
    let key = add_muc(&a.store, 11, b"first", t).await;

    let b_to_a = b.connect_to(&a).await;
    b_to_a.send_key_request().await;
    let b_store = Arc::clone(&b.store);
    let k = key;
    assert!(
        wait_until(|| {
            let s = Arc::clone(&b_store);
            async move { s.has_cube(&k).unwrap_or(false) }
        })
        .await,
        "b did not receive the muc"
    );
    assert_eq!(
        Cube::from_binary(&b.store.get_binary(&key).unwrap().unwrap())
            .unwrap()
            .payload(),
        Some(&b"first"[..])
    );

    // A publishes a newer version under the same key.
    let key2 = add_muc(&a.store, 11, b"second", t + 1).await;
    assert_eq!(key2, key);
    let expected = a.store.get_binary(&key).unwrap().unwrap();

    // Re-request on each poll, the way the periodic key timer would; the
    // new offer may land in the unsent queue just after a request drains.
    let mut converged = false;
    for _ in 0..60 {
        b_to_a.send_key_request().await;
        sleep(Duration::from_millis(50)).await;
        if b.store.get_binary(&k).ok().flatten().as_deref() == Some(&expected[..]) {
            converged = true;
            break;
        }
    }
    assert!(converged, "b did not converge on the update");

    let stored = b.store.get_binary(&key).unwrap().unwrap();
    assert_eq!(
        Cube::from_binary(&stored).unwrap().payload(),
        Some(&b"second"[..])
    );
    assert_eq!(sha3(&stored), sha3(&expected));
}

/// Scenario: connecting to our own server blacklists the address.
#[tokio::test(flavor = "multi_thread")]
async fn self_connection_is_blacklisted() {
    let n = TestNode::spawn(NodeType::Full).await;

    let _ = n.manager.connect(&n.address()).await.unwrap();

    let db = Arc::clone(&n.peer_db);
    assert!(
        wait_until(|| {
            let db = Arc::clone(&db);
            async move { db.stats().await.blacklisted == 1 }
        })
        .await,
        "self address was not blacklisted"
    );

    let manager = Arc::clone(&n.manager);
    assert!(
        wait_until(|| {
            let m = Arc::clone(&manager);
            async move { m.connection_count().await == 0 }
        })
        .await,
        "self connection was not torn down"
    );
    assert_eq!(n.peer_db.stats().await.blacklisted, 1);
}

/// Scenario: a second connection to the same node via an alternate
/// address is detected as a duplicate and merged, not blacklisted.
#[tokio::test(flavor = "multi_thread")]
async fn duplicate_connection_is_merged() {
    let m = TestNode::spawn(NodeType::Full).await;
    let o = TestNode::spawn(NodeType::Full).await;

    let first = m.connect_to(&o).await;
    let o_id = first.remote_id().unwrap();

    // O advertises its server address; M marks it exchangeable.
    let m_db = Arc::clone(&m.peer_db);
    assert!(
        wait_until(|| {
            let db = Arc::clone(&m_db);
            async move { db.stats().await.exchangeable == 1 }
        })
        .await,
        "o never became exchangeable on m"
    );

    // Syntactically different loopback form for the same node.
    let alt = Address::Tcp(format!("127.0.0.2:{}", o.port).parse().unwrap());
    let _ = m.manager.connect(&alt).await.unwrap();

    // Exactly one live connection per side once the duplicate settles.
    let mm = Arc::clone(&m.manager);
    assert!(
        wait_until(|| {
            let m = Arc::clone(&mm);
            async move { m.connection_count().await == 1 }
        })
        .await,
        "m kept the duplicate connection"
    );
    let om = Arc::clone(&o.manager);
    assert!(
        wait_until(|| {
            let m = Arc::clone(&om);
            async move { m.connection_count().await == 1 }
        })
        .await,
        "o kept the duplicate connection"
    );

    // The surviving connection still carries the same identity, the
    // record accumulated the second address, and nobody got blacklisted.
    let peers = m.manager.online_peers().await;
    assert_eq!(peers.len(), 1);
    assert_eq!(peers[0].remote_id(), Some(o_id));

    let stats = m.peer_db.stats().await;
    assert_eq!(stats.exchangeable, 1);
    assert_eq!(stats.blacklisted, 0);

    let record = &m.peer_db.exchangeable_peers().await[0];
    assert!(
        record.addresses.len() >= 2,
        "expected multiple address forms, got {:?}",
        record.addresses
    );
}

/// Scenario: subscription push delivers a MUC update unrequested.
#[tokio::test(flavor = "multi_thread")]
async fn subscription_pushes_updates() {
    let a = TestNode::spawn(NodeType::Full).await;
    let b = TestNode::spawn(NodeType::Full).await;

    let t = now_timestamp();
    let key = add_muc(&a.store, 21, b"v1", t).await;

    let b_to_a = b.connect_to(&a).await;

    // B learns v1 through the ordinary pull path first.
    b_to_a.send_key_request().await;
    let b_store = Arc::clone(&b.store);
    assert!(
        wait_until(|| {
            let s = Arc::clone(&b_store);
            async move { s.has_cube(&key).unwrap_or(false) }
        })
        .await
    );

    // Subscribe, then update on A. The new binary must arrive without
    // any further request from B.
    b_to_a.subscribe_cubes(vec![key]).await;
    sleep(Duration::from_millis(200)).await;

    add_muc(&a.store, 21, b"v2", t + 1).await;
    let expected = a.store.get_binary(&key).unwrap().unwrap();

    let b_store = Arc::clone(&b.store);
    let want = expected.clone();
    assert!(
        wait_until(|| {
            let s = Arc::clone(&b_store);
            let want = want.clone();
            async move {
                s.get_binary(&key)
                    .ok()
                    .flatten()
                    .map(|bin| bin == want)
                    .unwrap_or(false)
            }
        })
        .await,
        "subscribed update was not pushed"
    );
    assert_eq!(
        Cube::from_binary(&b.store.get_binary(&key).unwrap().unwrap())
            .unwrap()
            .payload(),
        Some(&b"v2"[..])
    );
}

/// Node exchange: a third node learns peers it never dialed directly.
#[tokio::test(flavor = "multi_thread")]
async fn node_exchange_spreads_addresses() {
    let a = TestNode::spawn(NodeType::Full).await;
    let b = TestNode::spawn(NodeType::Full).await;
    let c = TestNode::spawn(NodeType::Full).await;

    // A and B know each other; both sides exchange server addresses.
    let _a_to_b = a.connect_to(&b).await;
    let a_db = Arc::clone(&a.peer_db);
    assert!(
        wait_until(|| {
            let db = Arc::clone(&a_db);
            async move { db.stats().await.exchangeable >= 1 }
        })
        .await
    );

    // C connects to A and asks for nodes.
    let c_to_a = c.connect_to(&a).await;
    c_to_a.send_node_request().await;

    // C must learn specifically B's server address, which it never
    // dialed itself.
    let c_db = Arc::clone(&c.peer_db);
    let b_record = cubenet::net::Peer::from_address(b.address());
    assert!(
        wait_until(|| {
            let db = Arc::clone(&c_db);
            let b_record = b_record.clone();
            async move { db.contains(&b_record).await }
        })
        .await,
        "c never learned b's address from a"
    );
}

/// Manager shutdown closes every connection and stops accepting.
#[tokio::test(flavor = "multi_thread")]
async fn shutdown_is_clean_and_idempotent() {
    let a = TestNode::spawn(NodeType::Full).await;
    let b = TestNode::spawn(NodeType::Full).await;

    let _handle = b.connect_to(&a).await;

    b.manager.shutdown().await;
    b.manager.shutdown().await; // idempotent

    let bm = Arc::clone(&b.manager);
    assert!(
        wait_until(|| {
            let m = Arc::clone(&bm);
            async move { m.connection_count().await == 0 }
        })
        .await
    );

    let am = Arc::clone(&a.manager);
    assert!(
        wait_until(|| {
            let m = Arc::clone(&am);
            async move { m.connection_count().await == 0 }
        })
        .await,
        "a still sees the closed connection"
    );

    // A manager that is shutting down refuses new connections.
    assert!(b.manager.connect(&a.address()).await.unwrap().is_none());
}
