//! P2P networking layer

pub mod manager;
pub mod message;
pub mod peer;
pub mod peer_db;
pub mod server;
pub mod transport;
pub mod types;

// Re-exports
pub use manager::{NetConfig, NetEvent, NetworkManager, NetworkStats};
pub use message::{KeyOffer, Message, MessageClass, MessageError, SubscriptionCode};
pub use peer::{
    ClassStats, NetworkPeer, PeerCommand, PeerCtx, PeerEvent, PeerHandle, PeerState, PeerStats,
    PeerStatsSnapshot,
};
pub use peer_db::{PeerDb, PeerDbError, PeerDbEvent, PeerDbStats};
pub use server::Server;
pub use transport::{Connection, ConnectionReader, ConnectionWriter, NetError};
pub use types::*;
