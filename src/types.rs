//! Core constants and shared types for the cube format.

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

// =============================================================================
// CUBE FORMAT CONSTANTS
// =============================================================================
// These values define the binary record layout and are wire-critical:
// every peer on the network must agree on them byte for byte.

/// Total size of one cube binary. Every record is exactly this long.
pub const CUBE_SIZE: usize = 1024;

/// Size of a cube key (content hash for frozen cubes, public key for MUCs).
pub const CUBE_KEY_SIZE: usize = 32;

/// Size of a SHA3-256 digest.
pub const HASH_SIZE: usize = 32;

/// Size of the owner fingerprint inside a MUC signature region:
/// the first 8 bytes of `sha3(public_key)`.
pub const FINGERPRINT_SIZE: usize = 8;

/// Ed25519 detached signature size.
pub const SIGNATURE_SIZE: usize = 64;

/// Ed25519 public key size.
pub const PUBLIC_KEY_SIZE: usize = 32;

/// Size of the hashcash nonce region varied during mining (2^32 trials).
pub const NONCE_SIZE: usize = 4;

/// Size of the cube date field: 40-bit big-endian seconds since epoch.
pub const TIMESTAMP_SIZE: usize = 5;

/// Size of the cube type tag field.
pub const CUBE_TYPE_SIZE: usize = 1;

/// Size of the challenge level byte in key advertisements.
pub const CHALLENGE_LEVEL_SIZE: usize = 1;

/// Random identifier of a running node, stable per process.
pub const PEER_ID_SIZE: usize = 16;

/// Trailing zero bits required of `sha3(binary)` for a frozen cube to be
/// accepted. Tests run with 0 for determinism.
pub const REQUIRED_DIFFICULTY: u8 = 12;

// =============================================================================
// SHARED TYPE ALIASES
// =============================================================================

/// 32-byte SHA3-256 digest.
pub type Hash = [u8; HASH_SIZE];

/// 32-byte cube key.
pub type CubeKey = [u8; CUBE_KEY_SIZE];

/// 16-byte node identifier exchanged in HELLO.
pub type PeerId = [u8; PEER_ID_SIZE];

// =============================================================================
// CUBE TYPE
// =============================================================================

/// Cube type tag carried in the leading positional field.
///
/// All codes other than the two below are reserved; records carrying them
/// are rejected at decompile time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum CubeType {
    /// Mutable User Cube: keyed by its embedded public key, replaced by
    /// newer signed versions under the contest rule.
    Muc = 0x00,
    /// Frozen (regular) cube: immutable, keyed by content hash, secured
    /// by hashcash.
    Frozen = 0xFF,
}

impl CubeType {
    /// Parse a type tag byte. Reserved codes return `None`.
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0x00 => Some(CubeType::Muc),
            0xFF => Some(CubeType::Frozen),
            _ => None,
        }
    }

    /// Whether records of this type carry an owner signature.
    pub fn is_signed(&self) -> bool {
        matches!(self, CubeType::Muc)
    }

    /// Whether records of this type may be replaced by newer versions.
    pub fn is_mutable(&self) -> bool {
        matches!(self, CubeType::Muc)
    }
}

impl std::fmt::Display for CubeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CubeType::Muc => write!(f, "muc"),
            CubeType::Frozen => write!(f, "frozen"),
        }
    }
}

// =============================================================================
// NODE TYPE
// =============================================================================

/// Node operating mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeType {
    /// Replicates the full cube set; requests keys periodically.
    Full,
    /// Fetches only explicitly requested cubes; never polls for keys and
    /// drops unsolicited cube deliveries.
    Light,
}

impl NodeType {
    pub fn is_light(&self) -> bool {
        matches!(self, NodeType::Light)
    }
}

// =============================================================================
// TIME
// =============================================================================

/// Current time in seconds since UNIX epoch.
pub fn now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Current time truncated to the 40-bit range of the cube date field.
pub fn now_timestamp() -> u64 {
    now() & 0xFF_FFFF_FFFF
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cube_type_codes() {
        assert_eq!(CubeType::from_u8(0xFF), Some(CubeType::Frozen));
        assert_eq!(CubeType::from_u8(0x00), Some(CubeType::Muc));
        assert_eq!(CubeType::from_u8(0x01), None);
        assert_eq!(CubeType::from_u8(0x7F), None);
        assert!(CubeType::Muc.is_signed());
        assert!(!CubeType::Frozen.is_mutable());
    }

    #[test]
    fn timestamp_fits_40_bits() {
        assert!(now_timestamp() <= 0xFF_FFFF_FFFF);
    }
}
