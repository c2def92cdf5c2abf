//! Network constants, addresses and peer records.

use crate::types::{now, PeerId};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use thiserror::Error;

// =============================================================================
// PROTOCOL IDENTIFICATION
// =============================================================================

/// Protocol version byte leading every message. A mismatch is logged and
/// the message processed anyway (legacy peers ignore the byte).
pub const PROTOCOL_VERSION: u8 = 1;

/// Default TCP port.
pub const DEFAULT_PORT: u16 = 1984;

// =============================================================================
// CONNECTION LIMITS AND TIMERS
// =============================================================================

/// Maximum live connections (inbound plus outbound).
pub const MAXIMUM_CONNECTIONS: usize = 20;

/// Handshake and request timeout in seconds. An expected response must
/// arrive (or any traffic at all) within this window.
pub const NETWORK_TIMEOUT_SECS: u64 = 10;

/// Interval between periodic key requests on full nodes.
pub const KEY_REQUEST_TIME_SECS: u64 = 10;

/// Interval between periodic node requests when peer exchange is on.
pub const NODE_REQUEST_TIME_SECS: u64 = 60;

/// Delay before looking for the next outbound candidate after a
/// successful selection.
pub const NEW_PEER_INTERVAL_MS: u64 = 1000;

/// Delay before retrying selection when no candidate was eligible. Also
/// the base unit of the reconnect backoff.
pub const RECONNECT_INTERVAL_SECS: u64 = 10;

/// How long a cube subscription stays active before the subscriber must
/// renew.
pub const CUBE_SUBSCRIPTION_PERIOD_SECS: u64 = 300;

/// Reconnect backoff is `fibonacci(min(attempts, FIB_MAX))` reconnect
/// intervals; caps the backoff near 2.7 hours.
pub const FIB_MAX: u32 = 16;

// =============================================================================
// MESSAGE SIZE LIMITS
// =============================================================================

/// Hard cap on any inbound frame. A full cube response (1000 cubes of
/// 1 KiB) fits with room to spare.
pub const MESSAGE_SIZE_LIMIT: usize = 2 * 1024 * 1024;

/// Maximum keys per key response / cube request / cube response.
pub const MAX_CUBE_HASH_COUNT: usize = 1000;

/// Maximum addresses per node response.
pub const MAX_NODE_ADDRESS_COUNT: usize = 100;

/// Maximum length of one ASCII address on the wire.
pub const MAX_ADDRESS_LENGTH: usize = 256;

// =============================================================================
// ADDRESSES
// =============================================================================

#[derive(Error, Debug)]
pub enum AddressError {
    #[error("unknown address type {0}")]
    UnknownType(u8),
    #[error("unparseable address")]
    Unparseable,
}

/// Wire tag of an address form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum AddressType {
    /// Plain TCP `ip:port`.
    Tcp = 1,
    /// Opaque address string of a layered transport, passed through
    /// verbatim.
    Opaque = 2,
}

impl AddressType {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(AddressType::Tcp),
            2 => Some(AddressType::Opaque),
            _ => None,
        }
    }
}

/// One address form a peer can be reached on. Addresses of different
/// forms never compare equal, even if they would resolve to the same
/// endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Address {
    Tcp(SocketAddr),
    Opaque(String),
}

impl Address {
    pub fn kind(&self) -> AddressType {
        match self {
            Address::Tcp(_) => AddressType::Tcp,
            Address::Opaque(_) => AddressType::Opaque,
        }
    }

    /// Parse a wire address of the given type.
    ///
    /// A TCP address starting with `::` is a wildcard advertisement: the
    /// sender asks us to substitute the IP we observe the connection from.
    /// Use [`Address::parse_with_observed_ip`] for those.
    pub fn parse(kind: AddressType, s: &str) -> Result<Address, AddressError> {
        match kind {
            AddressType::Tcp => {
                let sock: SocketAddr = s.parse().map_err(|_| AddressError::Unparseable)?;
                Ok(Address::Tcp(sock))
            }
            AddressType::Opaque => {
                if s.is_empty() || s.len() > MAX_ADDRESS_LENGTH {
                    return Err(AddressError::Unparseable);
                }
                Ok(Address::Opaque(s.to_string()))
            }
        }
    }

    /// Parse a wire address, resolving the `::` wildcard form against the
    /// IP the connection is observed from.
    pub fn parse_with_observed_ip(
        kind: AddressType,
        s: &str,
        observed: Option<IpAddr>,
    ) -> Result<Address, AddressError> {
        if kind == AddressType::Tcp
            && let Some(rest) = s.strip_prefix("::")
            && let Ok(port) = rest.trim_start_matches(':').parse::<u16>()
        {
            let ip = observed.ok_or(AddressError::Unparseable)?;
            return Ok(Address::Tcp(SocketAddr::new(ip, port)));
        }
        Self::parse(kind, s)
    }

    /// Wire string form.
    pub fn to_wire(&self) -> String {
        match self {
            Address::Tcp(sock) => sock.to_string(),
            Address::Opaque(s) => s.clone(),
        }
    }

    pub fn socket_addr(&self) -> Option<SocketAddr> {
        match self {
            Address::Tcp(sock) => Some(*sock),
            Address::Opaque(_) => None,
        }
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Address::Tcp(sock) => write!(f, "tcp:{}", sock),
            Address::Opaque(s) => write!(f, "opaque:{}", s),
        }
    }
}

impl From<SocketAddr> for Address {
    fn from(sock: SocketAddr) -> Self {
        Address::Tcp(sock)
    }
}

// =============================================================================
// PEER RECORD
// =============================================================================

/// Everything we know about a node, connected or not. A peer accumulates
/// addresses over its lifetime (the socket we saw it on, the server
/// address it advertises, forms relayed by others).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Peer {
    /// 16-byte random identity learned via HELLO. `None` until the first
    /// completed handshake.
    pub id: Option<PeerId>,
    /// All known address forms, deduplicated.
    pub addresses: Vec<Address>,
    /// Index of the address to dial and to hand to other peers.
    pub primary: usize,
    /// Timestamp of the last outbound connection attempt.
    pub last_connect_attempt: u64,
    /// Consecutive attempts since the last success.
    pub attempt_count: u32,
}

impl Peer {
    pub fn from_address(addr: Address) -> Self {
        Self {
            id: None,
            addresses: vec![addr],
            primary: 0,
            last_connect_attempt: 0,
            attempt_count: 0,
        }
    }

    pub fn with_id(id: PeerId, addr: Address) -> Self {
        Self {
            id: Some(id),
            addresses: vec![addr],
            primary: 0,
            last_connect_attempt: 0,
            attempt_count: 0,
        }
    }

    /// The address to dial and advertise.
    pub fn primary_address(&self) -> Option<&Address> {
        self.addresses.get(self.primary)
    }

    /// Record an additional address form. Returns whether it was new.
    pub fn add_address(&mut self, addr: Address) -> bool {
        if self.addresses.contains(&addr) {
            return false;
        }
        self.addresses.push(addr);
        true
    }

    /// Two records describe the same node when they share an id or any
    /// address form.
    pub fn same_peer(&self, other: &Peer) -> bool {
        if let (Some(a), Some(b)) = (&self.id, &other.id)
            && a == b
        {
            return true;
        }
        self.addresses
            .iter()
            .any(|a| other.addresses.contains(a))
    }

    /// Fold the other record's addresses (and id, if ours is unknown)
    /// into this one.
    pub fn merge(&mut self, other: &Peer) {
        if self.id.is_none() {
            self.id = other.id;
        }
        for addr in &other.addresses {
            self.add_address(addr.clone());
        }
    }

    pub fn mark_attempt(&mut self) {
        self.last_connect_attempt = now();
        self.attempt_count += 1;
    }

    pub fn mark_success(&mut self) {
        self.attempt_count = 0;
    }

    /// Whether this peer may be dialed again: the reconnect backoff is
    /// `fibonacci(min(attempts, FIB_MAX))` reconnect intervals since the
    /// last attempt.
    pub fn eligible(&self, now: u64) -> bool {
        if self.last_connect_attempt == 0 {
            return true;
        }
        let wait = fibonacci(self.attempt_count.min(FIB_MAX)) * RECONNECT_INTERVAL_SECS;
        self.last_connect_attempt <= now.saturating_sub(wait)
    }

    /// Hex form of the peer id, used as a bucket key.
    pub fn id_hex(&self) -> Option<String> {
        self.id.map(hex::encode)
    }
}

/// Iterative fibonacci; `fibonacci(0) == 0`, `fibonacci(1) == 1`.
pub fn fibonacci(n: u32) -> u64 {
    let (mut a, mut b) = (0u64, 1u64);
    for _ in 0..n {
        (a, b) = (b, a + b);
    }
    a
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tcp(s: &str) -> Address {
        Address::Tcp(s.parse().unwrap())
    }

    #[test]
    fn address_equality_is_per_variant() {
        assert_eq!(tcp("1.2.3.4:1984"), tcp("1.2.3.4:1984"));
        assert_ne!(tcp("1.2.3.4:1984"), tcp("1.2.3.4:1985"));
        assert_ne!(
            tcp("1.2.3.4:1984"),
            Address::Opaque("1.2.3.4:1984".to_string())
        );
    }

    #[test]
    fn wildcard_address_substitutes_observed_ip() {
        let observed: IpAddr = "9.8.7.6".parse().unwrap();
        let addr =
            Address::parse_with_observed_ip(AddressType::Tcp, "::1984", Some(observed)).unwrap();
        assert_eq!(addr, tcp("9.8.7.6:1984"));

        // Without an observed IP the wildcard cannot resolve.
        assert!(Address::parse_with_observed_ip(AddressType::Tcp, "::1984", None).is_err());

        // Regular addresses pass through.
        let addr =
            Address::parse_with_observed_ip(AddressType::Tcp, "5.5.5.5:19", Some(observed))
                .unwrap();
        assert_eq!(addr, tcp("5.5.5.5:19"));
    }

    #[test]
    fn peer_equality_by_id_or_address() {
        let a = Peer::with_id([1u8; 16], tcp("1.1.1.1:1984"));
        let b = Peer::with_id([1u8; 16], tcp("2.2.2.2:1984"));
        let c = Peer::from_address(tcp("1.1.1.1:1984"));
        let d = Peer::from_address(tcp("3.3.3.3:1984"));

        assert!(a.same_peer(&b)); // shared id
        assert!(a.same_peer(&c)); // shared address
        assert!(!a.same_peer(&d));

        // Reflexive and symmetric.
        assert!(a.same_peer(&a));
        assert!(c.same_peer(&a));
    }

    #[test]
    fn merge_accumulates_addresses() {
        let mut a = Peer::from_address(tcp("1.1.1.1:1984"));
        let b = Peer::with_id([7u8; 16], tcp("2.2.2.2:1984"));
        a.merge(&b);
        assert_eq!(a.id, Some([7u8; 16]));
        assert_eq!(a.addresses.len(), 2);

        // Merging again is a no-op.
        a.merge(&b);
        assert_eq!(a.addresses.len(), 2);
    }

    #[test]
    fn backoff_grows_fibonacci() {
        assert_eq!(fibonacci(0), 0);
        assert_eq!(fibonacci(1), 1);
        assert_eq!(fibonacci(2), 1);
        assert_eq!(fibonacci(3), 2);
        assert_eq!(fibonacci(7), 13);
        assert_eq!(fibonacci(16), 987);

        let mut p = Peer::from_address(tcp("1.1.1.1:1984"));
        assert!(p.eligible(now()));
        p.mark_attempt();
        // One attempt: backoff is one reconnect interval.
        assert!(!p.eligible(p.last_connect_attempt + RECONNECT_INTERVAL_SECS - 1));
        assert!(p.eligible(p.last_connect_attempt + RECONNECT_INTERVAL_SECS));
    }
}
