//! Peer lifecycle database.
//!
//! Peers live in four disjoint buckets:
//!
//! - `unverified`, keyed by primary-address string: heard of, never
//!   completed a HELLO with us
//! - `verified`, keyed by id hex: HELLO completed, but no publicly
//!   reachable address known
//! - `exchangeable`, keyed by id hex: HELLO completed and we hold an
//!   address we can hand to other peers
//! - `blacklisted`, keyed by address string: never connect again
//!
//! Transitions are monotonic toward `exchangeable`; `blacklisted`
//! supersedes everything and is never left.

use super::types::Peer;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info};

/// Capacity of the peer event channel.
const EVENT_CHANNEL_SIZE: usize = 256;

/// Maximum serialized snapshot size accepted on load.
const MAX_SNAPSHOT_FILE_SIZE: u64 = 16 * 1024 * 1024;

#[derive(Error, Debug)]
pub enum PeerDbError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("corrupt peer snapshot")]
    Corrupt,
}

/// Lifecycle notifications for interested connections.
#[derive(Debug, Clone)]
pub enum PeerDbEvent {
    NewPeer(Peer),
    VerifiedPeer(Peer),
    ExchangeablePeer(Peer),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerDbStats {
    pub unverified: usize,
    pub verified: usize,
    pub exchangeable: usize,
    pub blacklisted: usize,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Buckets {
    unverified: HashMap<String, Peer>,
    verified: HashMap<String, Peer>,
    exchangeable: HashMap<String, Peer>,
    blacklisted: HashMap<String, Peer>,
}

impl Buckets {
    fn contains(&self, peer: &Peer) -> bool {
        self.all_live().any(|p| p.same_peer(peer)) || self.is_blacklisted(peer)
    }

    fn all_live(&self) -> impl Iterator<Item = &Peer> {
        self.unverified
            .values()
            .chain(self.verified.values())
            .chain(self.exchangeable.values())
    }

    fn is_blacklisted(&self, peer: &Peer) -> bool {
        self.blacklisted.values().any(|p| p.same_peer(peer))
    }

    fn remove_matching(map: &mut HashMap<String, Peer>, peer: &Peer) -> Option<Peer> {
        let key = map
            .iter()
            .find(|(_, p)| p.same_peer(peer))
            .map(|(k, _)| k.clone())?;
        map.remove(&key)
    }
}

/// Shared peer database. Mutations are serialized; readers get snapshots.
pub struct PeerDb {
    inner: Mutex<Buckets>,
    events: broadcast::Sender<PeerDbEvent>,
}

impl Default for PeerDb {
    fn default() -> Self {
        Self::new()
    }
}

impl PeerDb {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_SIZE);
        Self {
            inner: Mutex::new(Buckets::default()),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PeerDbEvent> {
        self.events.subscribe()
    }

    /// Register a peer we heard about. Lands in `unverified` unless the
    /// peer is already known anywhere (including the blacklist).
    pub async fn learn_peer(&self, peer: Peer) -> bool {
        let Some(addr) = peer.primary_address() else {
            return false;
        };
        let key = addr.to_string();

        let mut inner = self.inner.lock().await;
        if inner.contains(&peer) {
            return false;
        }
        debug!("learned peer {}", key);
        inner.unverified.insert(key, peer.clone());
        drop(inner);
        let _ = self.events.send(PeerDbEvent::NewPeer(peer));
        true
    }

    /// Record a completed HELLO. Moves the peer out of `unverified`; a
    /// no-op if it is already exchangeable or blacklisted.
    pub async fn verify_peer(&self, peer: Peer) -> bool {
        let Some(id_hex) = peer.id_hex() else {
            return false;
        };

        let mut inner = self.inner.lock().await;
        if inner.is_blacklisted(&peer) {
            return false;
        }

        let removed = Buckets::remove_matching(&mut inner.unverified, &peer);

        if let Some(existing) = inner.exchangeable.get_mut(&id_hex) {
            existing.merge(&peer);
            return false;
        }

        let mut record = removed.unwrap_or_else(|| peer.clone());
        record.merge(&peer);
        record.mark_success();
        let entry = inner
            .verified
            .entry(id_hex.clone())
            .or_insert_with(|| record.clone());
        entry.merge(&record);
        let snapshot = entry.clone();
        drop(inner);

        debug!("verified peer {}", id_hex);
        let _ = self.events.send(PeerDbEvent::VerifiedPeer(snapshot));
        true
    }

    /// Promote a peer to `exchangeable`: we now hold an address other
    /// nodes can dial it on.
    pub async fn mark_exchangeable(&self, peer: Peer) -> bool {
        let Some(id_hex) = peer.id_hex() else {
            return false;
        };

        let mut inner = self.inner.lock().await;
        if inner.is_blacklisted(&peer) {
            return false;
        }

        let mut record = peer.clone();
        if let Some(p) = Buckets::remove_matching(&mut inner.unverified, &peer) {
            record.merge(&p);
        }
        if let Some(p) = Buckets::remove_matching(&mut inner.verified, &peer) {
            record.merge(&p);
        }
        let entry = inner
            .exchangeable
            .entry(id_hex.clone())
            .or_insert_with(|| record.clone());
        entry.merge(&record);
        let snapshot = entry.clone();
        drop(inner);

        debug!("peer {} is exchangeable", id_hex);
        let _ = self.events.send(PeerDbEvent::ExchangeablePeer(snapshot));
        true
    }

    /// Blacklist a peer. Removes it from every live bucket; supersedes
    /// all other states.
    pub async fn blacklist(&self, peer: Peer) {
        let mut inner = self.inner.lock().await;
        Buckets::remove_matching(&mut inner.unverified, &peer);
        Buckets::remove_matching(&mut inner.verified, &peer);
        Buckets::remove_matching(&mut inner.exchangeable, &peer);

        let key = peer
            .primary_address()
            .map(|a| a.to_string())
            .or_else(|| peer.id_hex())
            .unwrap_or_default();
        info!("blacklisting peer {}", key);
        inner.blacklisted.insert(key, peer);
    }

    pub async fn is_blacklisted(&self, peer: &Peer) -> bool {
        self.inner.lock().await.is_blacklisted(peer)
    }

    /// Whether any bucket (including the blacklist) knows this peer.
    pub async fn contains(&self, peer: &Peer) -> bool {
        self.inner.lock().await.contains(peer)
    }

    /// Stamp an outbound attempt on the stored record.
    pub async fn record_attempt(&self, peer: &Peer) {
        let mut inner = self.inner.lock().await;
        let inner = &mut *inner;
        for map in [
            &mut inner.unverified,
            &mut inner.verified,
            &mut inner.exchangeable,
        ] {
            if let Some(p) = map.values_mut().find(|p| p.same_peer(peer)) {
                p.mark_attempt();
                return;
            }
        }
    }

    /// Reset the stored record's backoff after a successful connection.
    pub async fn record_success(&self, peer: &Peer) {
        let mut inner = self.inner.lock().await;
        let inner = &mut *inner;
        for map in [
            &mut inner.unverified,
            &mut inner.verified,
            &mut inner.exchangeable,
        ] {
            if let Some(p) = map.values_mut().find(|p| p.same_peer(peer)) {
                p.mark_success();
                return;
            }
        }
    }

    /// Attach a newly learned address form to a known peer record.
    pub async fn add_known_address(&self, peer: &Peer, addr: super::types::Address) {
        let mut inner = self.inner.lock().await;
        let inner = &mut *inner;
        for map in [
            &mut inner.unverified,
            &mut inner.verified,
            &mut inner.exchangeable,
        ] {
            if let Some(p) = map.values_mut().find(|p| p.same_peer(peer)) {
                p.add_address(addr);
                return;
            }
        }
    }

    /// Pick an outbound candidate: any live peer not excluded whose
    /// reconnect backoff has elapsed, uniformly at random.
    pub async fn select(&self, exclude: &[Peer]) -> Option<Peer> {
        let now = crate::types::now();
        let inner = self.inner.lock().await;
        let eligible: Vec<&Peer> = inner
            .all_live()
            .filter(|p| !exclude.iter().any(|e| e.same_peer(p)))
            .filter(|p| p.eligible(now))
            .collect();
        if eligible.is_empty() {
            return None;
        }
        let idx = rand::Rng::gen_range(&mut rand::thread_rng(), 0..eligible.len());
        Some(eligible[idx].clone())
    }

    /// Snapshot of all exchangeable peers (for node exchange).
    pub async fn exchangeable_peers(&self) -> Vec<Peer> {
        self.inner
            .lock()
            .await
            .exchangeable
            .values()
            .cloned()
            .collect()
    }

    pub async fn stats(&self) -> PeerDbStats {
        let inner = self.inner.lock().await;
        PeerDbStats {
            unverified: inner.unverified.len(),
            verified: inner.verified.len(),
            exchangeable: inner.exchangeable.len(),
            blacklisted: inner.blacklisted.len(),
        }
    }

    // -------------------------------------------------------------------------
    // SNAPSHOT PERSISTENCE
    // -------------------------------------------------------------------------

    /// Persist the peer table.
    pub async fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), PeerDbError> {
        let inner = self.inner.lock().await;
        let data = bincode::serialize(&*inner).map_err(|_| PeerDbError::Corrupt)?;
        std::fs::write(path, data)?;
        Ok(())
    }

    /// Load a previously saved peer table, with a file-size cap applied
    /// before deserialization.
    pub async fn load<P: AsRef<Path>>(&self, path: P) -> Result<(), PeerDbError> {
        let data = std::fs::read(&path)?;
        if data.len() as u64 > MAX_SNAPSHOT_FILE_SIZE {
            return Err(PeerDbError::Corrupt);
        }
        let buckets: Buckets = bincode::deserialize(&data).map_err(|_| PeerDbError::Corrupt)?;
        *self.inner.lock().await = buckets;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::types::Address;

    fn tcp_peer(s: &str) -> Peer {
        Peer::from_address(Address::Tcp(s.parse().unwrap()))
    }

    fn id_peer(id: u8, s: &str) -> Peer {
        Peer::with_id([id; 16], Address::Tcp(s.parse().unwrap()))
    }

    #[tokio::test]
    async fn learn_verify_exchange_lifecycle() {
        let db = PeerDb::new();

        assert!(db.learn_peer(tcp_peer("1.1.1.1:1984")).await);
        // Learning the same address twice is a no-op.
        assert!(!db.learn_peer(tcp_peer("1.1.1.1:1984")).await);
        assert_eq!(db.stats().await.unverified, 1);

        // HELLO completed: moves to verified.
        assert!(db.verify_peer(id_peer(9, "1.1.1.1:1984")).await);
        let stats = db.stats().await;
        assert_eq!(stats.unverified, 0);
        assert_eq!(stats.verified, 1);

        // Server address learned: exchangeable.
        assert!(db.mark_exchangeable(id_peer(9, "1.1.1.1:1984")).await);
        let stats = db.stats().await;
        assert_eq!(stats.verified, 0);
        assert_eq!(stats.exchangeable, 1);

        // verify after exchangeable stays exchangeable.
        assert!(!db.verify_peer(id_peer(9, "1.1.1.1:1984")).await);
        assert_eq!(db.stats().await.exchangeable, 1);
    }

    #[tokio::test]
    async fn blacklist_supersedes_everything() {
        let db = PeerDb::new();
        db.learn_peer(tcp_peer("2.2.2.2:1984")).await;
        db.blacklist(tcp_peer("2.2.2.2:1984")).await;

        let stats = db.stats().await;
        assert_eq!(stats.unverified, 0);
        assert_eq!(stats.blacklisted, 1);

        // A blacklisted peer cannot come back in under any transition.
        assert!(!db.learn_peer(tcp_peer("2.2.2.2:1984")).await);
        assert!(!db.verify_peer(id_peer(1, "2.2.2.2:1984")).await);
        assert!(!db.mark_exchangeable(id_peer(1, "2.2.2.2:1984")).await);
        assert!(db.is_blacklisted(&tcp_peer("2.2.2.2:1984")).await);
        assert!(db.select(&[]).await.is_none());
    }

    #[tokio::test]
    async fn selection_respects_exclude_and_backoff() {
        let db = PeerDb::new();
        db.learn_peer(tcp_peer("3.3.3.3:1984")).await;
        db.learn_peer(tcp_peer("4.4.4.4:1984")).await;

        // Excluding one leaves the other.
        let got = db.select(&[tcp_peer("3.3.3.3:1984")]).await.unwrap();
        assert!(got.same_peer(&tcp_peer("4.4.4.4:1984")));

        // A fresh attempt puts the peer on backoff.
        db.record_attempt(&tcp_peer("4.4.4.4:1984")).await;
        let got = db.select(&[tcp_peer("3.3.3.3:1984")]).await;
        assert!(got.is_none());

        // Excluding nothing still yields the non-backed-off peer.
        let got = db.select(&[]).await.unwrap();
        assert!(got.same_peer(&tcp_peer("3.3.3.3:1984")));
    }

    #[tokio::test]
    async fn events_are_emitted() {
        let db = PeerDb::new();
        let mut rx = db.subscribe();

        db.learn_peer(tcp_peer("5.5.5.5:1984")).await;
        assert!(matches!(rx.recv().await.unwrap(), PeerDbEvent::NewPeer(_)));

        db.verify_peer(id_peer(5, "5.5.5.5:1984")).await;
        assert!(matches!(
            rx.recv().await.unwrap(),
            PeerDbEvent::VerifiedPeer(_)
        ));

        db.mark_exchangeable(id_peer(5, "5.5.5.5:1984")).await;
        assert!(matches!(
            rx.recv().await.unwrap(),
            PeerDbEvent::ExchangeablePeer(_)
        ));
    }

    #[tokio::test]
    async fn snapshot_roundtrip() {
        let db = PeerDb::new();
        db.learn_peer(tcp_peer("6.6.6.6:1984")).await;
        db.verify_peer(id_peer(6, "7.7.7.7:1984")).await;
        db.blacklist(tcp_peer("8.8.8.8:1984")).await;

        let dir = std::env::temp_dir().join(format!("cubenet_peers_{}", std::process::id()));
        db.save(&dir).await.unwrap();

        let db2 = PeerDb::new();
        db2.load(&dir).await.unwrap();
        let stats = db2.stats().await;
        assert_eq!(stats.unverified, 1);
        assert_eq!(stats.verified, 1);
        assert_eq!(stats.blacklisted, 1);

        std::fs::remove_file(dir).ok();
    }
}
