//! Hashing, proof-of-work counting and Ed25519 detached signatures.

use crate::types::{Hash, FINGERPRINT_SIZE, PUBLIC_KEY_SIZE, SIGNATURE_SIZE};
use ed25519_dalek::{Signer, SigningKey, Verifier, VerifyingKey};
use sha3::{Digest, Sha3_256};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("invalid signature")]
    InvalidSignature,
    #[error("invalid public key")]
    InvalidPublicKey,
}

/// SHA3-256 of `data`.
pub fn sha3(data: &[u8]) -> Hash {
    Sha3_256::digest(data).into()
}

/// SHA3-256 over the concatenation of two buffers.
pub fn sha3_concat(a: &[u8], b: &[u8]) -> Hash {
    let mut hasher = Sha3_256::new();
    hasher.update(a);
    hasher.update(b);
    hasher.finalize().into()
}

/// Owner fingerprint: first 8 bytes of `sha3(public_key)`.
pub fn fingerprint(public_key: &[u8]) -> [u8; FINGERPRINT_SIZE] {
    let h = sha3(public_key);
    let mut out = [0u8; FINGERPRINT_SIZE];
    out.copy_from_slice(&h[..FINGERPRINT_SIZE]);
    out
}

/// Count zero bits from the low-order end of the last byte backwards.
///
/// This is the hashcash difficulty metric: all peers must agree on the
/// byte/bit convention or they will disagree on which cubes are valid.
pub fn trailing_zero_bits(buf: &[u8]) -> u32 {
    let mut count = 0u32;
    for byte in buf.iter().rev() {
        if *byte == 0 {
            count += 8;
        } else {
            count += byte.trailing_zeros();
            break;
        }
    }
    count
}

/// Ed25519 keypair used to own a mutable cube.
pub struct Keypair {
    signing: SigningKey,
}

impl Keypair {
    /// Generate a fresh random keypair.
    pub fn generate() -> Self {
        let mut seed = [0u8; 32];
        rand::Rng::fill(&mut rand::thread_rng(), &mut seed);
        Self {
            signing: SigningKey::from_bytes(&seed),
        }
    }

    /// Derive a keypair from a 32-byte seed. Deterministic.
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        Self {
            signing: SigningKey::from_bytes(seed),
        }
    }

    /// Public key bytes.
    pub fn public_key(&self) -> [u8; PUBLIC_KEY_SIZE] {
        self.signing.verifying_key().to_bytes()
    }

    /// Detached signature over `message`.
    pub fn sign(&self, message: &[u8]) -> [u8; SIGNATURE_SIZE] {
        self.signing.sign(message).to_bytes()
    }
}

/// Verify a detached Ed25519 signature.
pub fn verify(public_key: &[u8], message: &[u8], signature: &[u8]) -> Result<(), CryptoError> {
    let pk: [u8; PUBLIC_KEY_SIZE] = public_key
        .try_into()
        .map_err(|_| CryptoError::InvalidPublicKey)?;
    let pk = VerifyingKey::from_bytes(&pk).map_err(|_| CryptoError::InvalidPublicKey)?;
    let sig: [u8; SIGNATURE_SIZE] = signature
        .try_into()
        .map_err(|_| CryptoError::InvalidSignature)?;
    let sig = ed25519_dalek::Signature::from_bytes(&sig);
    pk.verify(message, &sig)
        .map_err(|_| CryptoError::InvalidSignature)
}
