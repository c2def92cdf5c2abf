//! The cube: a fixed-size self-contained binary record.
//!
//! A cube is sculpted field by field, then sealed: compiled to exactly
//! `CUBE_SIZE` bytes, mined until its hash shows the required trailing
//! zero bits, and (for mutable cubes) signed by its owner key. Any field
//! mutation after sealing invalidates the cached binary and hash; the next
//! access re-seals lazily.
//!
//! Frozen cubes are keyed by `sha3(binary)`. MUCs are keyed by the owner
//! public key and carry `fingerprint || signature` as their last field,
//! where the signature covers the whole binary up to and including the
//! fingerprint.

use crate::crypto::{self, fingerprint, sha3, trailing_zero_bits, CryptoError, Keypair};
use crate::field::{Field, FieldDef, FieldError, FieldType, Fields};
use crate::types::{
    now_timestamp, CubeKey, CubeType, Hash, CUBE_SIZE, FINGERPRINT_SIZE, NONCE_SIZE,
    PUBLIC_KEY_SIZE, SIGNATURE_SIZE, TIMESTAMP_SIZE,
};
use rand::RngCore;
use thiserror::Error;

/// Hash attempts per mining slice before yielding back to the runtime.
/// Keeps one mining cube from starving connection tasks.
const MINING_BATCH: u64 = 1000;

#[derive(Error, Debug)]
pub enum CubeError {
    #[error("field: {0}")]
    Field(#[from] FieldError),
    #[error("cube binary must be {CUBE_SIZE} bytes, got {0}")]
    BinaryLength(usize),
    #[error("invalid cube binary")]
    BinaryData,
    #[error("content does not fit cube")]
    ContentSize,
    #[error("cube signature invalid")]
    Signature,
    #[error("fingerprint mismatch")]
    Fingerprint,
    #[error("insufficient difficulty")]
    InsufficientDifficulty,
    #[error("nonce space exhausted")]
    NonceSpaceExhausted,
    #[error("missing field {0:?}")]
    MissingField(FieldType),
    #[error("api misuse: {0}")]
    ApiMisuse(&'static str),
    #[error("crypto: {0}")]
    Crypto(#[from] CryptoError),
}

/// Encode a cube date: 40-bit big-endian seconds since epoch.
pub fn encode_date(ts: u64) -> [u8; TIMESTAMP_SIZE] {
    let b = ts.to_be_bytes();
    [b[3], b[4], b[5], b[6], b[7]]
}

/// Decode a 40-bit big-endian cube date.
pub fn decode_date(b: &[u8]) -> Result<u64, CubeError> {
    if b.len() != TIMESTAMP_SIZE {
        return Err(CubeError::Field(FieldError::WrongType));
    }
    let mut out = 0u64;
    for byte in b {
        out = (out << 8) | *byte as u64;
    }
    Ok(out)
}

/// Stored-record metadata: everything the store and the protocol need to
/// know about a cube without holding its binary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CubeMeta {
    pub key: CubeKey,
    pub hash: Hash,
    pub date: u64,
    pub challenge_level: u8,
    pub cube_type: CubeType,
}

/// A cube under construction or a sealed record.
pub struct Cube {
    cube_type: CubeType,
    fields: Fields,
    keypair: Option<Keypair>,
    difficulty: u8,
    binary: Option<Vec<u8>>,
    hash: Option<Hash>,
}

impl Cube {
    // -------------------------------------------------------------------------
    // SCULPTING
    // -------------------------------------------------------------------------

    /// Sculpt a frozen cube around the given content fields.
    pub fn sculpt_frozen(content: Vec<Field>, difficulty: u8) -> Result<Self, CubeError> {
        Self::validate_content(&content, &crate::field::FROZEN_DEF)?;

        let mut fields = Fields::new(&crate::field::FROZEN_DEF);
        fields.push(Field::new(
            FieldType::TypeTag,
            vec![CubeType::Frozen as u8],
        ));
        for f in content {
            fields.push(f);
        }
        fields.push(Field::new(
            FieldType::Date,
            encode_date(now_timestamp()).to_vec(),
        ));
        fields.push(Field::new(FieldType::Nonce, random_bytes(NONCE_SIZE)));

        let mut cube = Self {
            cube_type: CubeType::Frozen,
            fields,
            keypair: None,
            difficulty,
            binary: None,
            hash: None,
        };
        cube.repad()?;
        Ok(cube)
    }

    /// Sculpt a mutable user cube owned by `keypair`.
    pub fn sculpt_muc(
        keypair: Keypair,
        content: Vec<Field>,
        difficulty: u8,
    ) -> Result<Self, CubeError> {
        Self::validate_content(&content, &crate::field::MUC_DEF)?;

        let mut fields = Fields::new(&crate::field::MUC_DEF);
        fields.push(Field::new(FieldType::TypeTag, vec![CubeType::Muc as u8]));
        for f in content {
            fields.push(f);
        }
        fields.push(Field::new(
            FieldType::PublicKey,
            keypair.public_key().to_vec(),
        ));
        fields.push(Field::new(
            FieldType::Date,
            encode_date(now_timestamp()).to_vec(),
        ));
        fields.push(Field::new(FieldType::Nonce, random_bytes(NONCE_SIZE)));
        fields.push(Field::new(
            FieldType::Signature,
            vec![0u8; FINGERPRINT_SIZE + SIGNATURE_SIZE],
        ));

        let mut cube = Self {
            cube_type: CubeType::Muc,
            fields,
            keypair: Some(keypair),
            difficulty,
            binary: None,
            hash: None,
        };
        cube.repad()?;
        Ok(cube)
    }

    fn validate_content(content: &[Field], def: &FieldDef) -> Result<(), CubeError> {
        for f in content {
            if f.field_type.is_reserved() {
                return Err(CubeError::Field(FieldError::NotImplemented(f.field_type)));
            }
            if def.is_positional(f.field_type) || f.field_type == FieldType::Remainder {
                return Err(CubeError::ApiMisuse(
                    "positional fields are sculpted by the cube, not the caller",
                ));
            }
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // PARSING
    // -------------------------------------------------------------------------

    /// Parse a received binary. Validates size and structure only; call
    /// [`Cube::verify`] for authenticity.
    pub fn from_binary(bytes: &[u8]) -> Result<Self, CubeError> {
        if bytes.len() != CUBE_SIZE {
            return Err(CubeError::BinaryLength(bytes.len()));
        }
        let cube_type = CubeType::from_u8(bytes[0]).ok_or(CubeError::BinaryData)?;
        let fields = Fields::decompile(bytes, FieldDef::for_cube_type(cube_type))?;

        Ok(Self {
            cube_type,
            fields,
            keypair: None,
            difficulty: 0,
            binary: Some(bytes.to_vec()),
            hash: Some(sha3(bytes)),
        })
    }

    // -------------------------------------------------------------------------
    // ACCESSORS
    // -------------------------------------------------------------------------

    pub fn cube_type(&self) -> CubeType {
        self.cube_type
    }

    pub fn fields(&self) -> &Fields {
        &self.fields
    }

    /// First payload field value, if any.
    pub fn payload(&self) -> Option<&[u8]> {
        self.fields
            .get_first(FieldType::Payload)
            .map(|f| f.value.as_slice())
    }

    /// Sculpt date (40-bit seconds since epoch).
    pub fn date(&self) -> Result<u64, CubeError> {
        let f = self
            .fields
            .get_first(FieldType::Date)
            .ok_or(CubeError::MissingField(FieldType::Date))?;
        decode_date(&f.value)
    }

    /// Embedded owner public key (MUCs only).
    pub fn public_key(&self) -> Option<[u8; PUBLIC_KEY_SIZE]> {
        let f = self.fields.get_first(FieldType::PublicKey)?;
        f.value.as_slice().try_into().ok()
    }

    // -------------------------------------------------------------------------
    // MUTATION
    // -------------------------------------------------------------------------

    /// Replace (or insert) the payload field. Invalidates the seal.
    pub fn set_payload(&mut self, value: Vec<u8>) {
        if let Some(f) = self.fields.get_first_mut(FieldType::Payload) {
            f.value = value;
            f.start = None;
        } else {
            self.fields
                .insert_after_front_positionals(Field::payload(value));
        }
        self.cube_manipulated();
    }

    /// Set the sculpt date. Invalidates the seal.
    pub fn set_date(&mut self, ts: u64) -> Result<(), CubeError> {
        self.fields
            .ensure_field_in_back(Field::new(FieldType::Date, encode_date(ts).to_vec()))?;
        self.cube_manipulated();
        Ok(())
    }

    /// Insert an additional content field after the front positional block.
    /// Invalidates the seal.
    pub fn insert_field(&mut self, field: Field) -> Result<(), CubeError> {
        Self::validate_content(std::slice::from_ref(&field), self.fields.def())?;
        self.fields.insert_after_front_positionals(field);
        self.cube_manipulated();
        Ok(())
    }

    /// Drop any cached binary and hash. Called on every field mutation.
    fn cube_manipulated(&mut self) {
        self.binary = None;
        self.hash = None;
    }

    // -------------------------------------------------------------------------
    // SEALING
    // -------------------------------------------------------------------------

    /// Strip padding and remainder fields, then insert fresh random filler
    /// sized so the compiled layout is exactly `CUBE_SIZE`.
    fn repad(&mut self) -> Result<(), CubeError> {
        let def = self.fields.def();
        let kept: Vec<Field> = self
            .fields
            .iter()
            .filter(|f| {
                f.field_type != FieldType::Padding && f.field_type != FieldType::Remainder
            })
            .cloned()
            .collect();
        self.fields = Fields::from_fields(kept, def);

        let used = self.fields.byte_len();
        if used > CUBE_SIZE {
            return Err(CubeError::ContentSize);
        }
        let slack = CUBE_SIZE - used;
        match slack {
            0 => {}
            // One spare byte cannot hold a padding header.
            1 => return Err(CubeError::ContentSize),
            n => self
                .fields
                .insert_before_back_positionals(Field::new(FieldType::Padding, random_bytes(n - 2))),
        }
        Ok(())
    }

    async fn seal(&mut self) -> Result<(), CubeError> {
        self.repad()?;
        let mut buf = self.fields.compile(CUBE_SIZE)?;

        let nonce_start = self
            .fields
            .get_first(FieldType::Nonce)
            .and_then(|f| f.start)
            .ok_or(CubeError::MissingField(FieldType::Nonce))?;

        // MUC sealing needs the owner key: the signature covers the nonce,
        // so every mining attempt re-signs.
        let muc = match self.cube_type {
            CubeType::Muc => {
                let sig_start = self
                    .fields
                    .get_first(FieldType::Signature)
                    .and_then(|f| f.start)
                    .ok_or(CubeError::MissingField(FieldType::Signature))?;
                let keypair = self
                    .keypair
                    .as_ref()
                    .ok_or(CubeError::ApiMisuse("sealing a muc requires its keypair"))?;
                let fp = fingerprint(&keypair.public_key());
                Some((sig_start, fp))
            }
            CubeType::Frozen => None,
        };

        let mut nonce: u32 = rand::random();
        let mut attempts: u64 = 0;
        let hash = loop {
            let mut found = None;
            for _ in 0..MINING_BATCH {
                buf[nonce_start..nonce_start + NONCE_SIZE].copy_from_slice(&nonce.to_be_bytes());

                if let Some((sig_start, fp)) = &muc {
                    let sig_start = *sig_start;
                    buf[sig_start..sig_start + FINGERPRINT_SIZE].copy_from_slice(fp);
                    let keypair = self
                        .keypair
                        .as_ref()
                        .ok_or(CubeError::ApiMisuse("sealing a muc requires its keypair"))?;
                    let sig = keypair.sign(&buf[..sig_start + FINGERPRINT_SIZE]);
                    buf[sig_start + FINGERPRINT_SIZE..sig_start + FINGERPRINT_SIZE + SIGNATURE_SIZE]
                        .copy_from_slice(&sig);
                }

                let h = sha3(&buf);
                if trailing_zero_bits(&h) >= self.difficulty as u32 {
                    found = Some(h);
                    break;
                }

                nonce = nonce.wrapping_add(1);
                attempts += 1;
                if attempts > u32::MAX as u64 {
                    return Err(CubeError::NonceSpaceExhausted);
                }
            }
            if let Some(h) = found {
                break h;
            }
            // Yield between slices so mining cooperates with I/O tasks.
            tokio::task::yield_now().await;
        };

        // Mirror the mined regions back into the field list so the fields
        // and the binary stay interchangeable.
        if let Some(f) = self.fields.get_first_mut(FieldType::Nonce) {
            f.value = buf[nonce_start..nonce_start + NONCE_SIZE].to_vec();
        }
        if let Some((sig_start, _)) = &muc
            && let Some(f) = self.fields.get_first_mut(FieldType::Signature)
        {
            f.value = buf[*sig_start..*sig_start + FINGERPRINT_SIZE + SIGNATURE_SIZE].to_vec();
        }

        self.binary = Some(buf);
        self.hash = Some(hash);
        Ok(())
    }

    async fn ensure_sealed(&mut self) -> Result<(), CubeError> {
        if self.binary.is_none() {
            self.seal().await?;
        }
        Ok(())
    }

    /// The sealed binary, mining and signing on first access.
    pub async fn binary(&mut self) -> Result<&[u8], CubeError> {
        self.ensure_sealed().await?;
        match &self.binary {
            Some(b) => Ok(b.as_slice()),
            None => Err(CubeError::ApiMisuse("seal produced no binary")),
        }
    }

    /// Hash of the sealed binary.
    pub async fn hash(&mut self) -> Result<Hash, CubeError> {
        self.ensure_sealed().await?;
        self.hash.ok_or(CubeError::ApiMisuse("seal produced no hash"))
    }

    /// The cube key: content hash for frozen cubes, owner public key for
    /// MUCs.
    pub async fn key(&mut self) -> Result<CubeKey, CubeError> {
        match self.cube_type {
            CubeType::Frozen => self.hash().await,
            CubeType::Muc => self
                .public_key()
                .ok_or(CubeError::MissingField(FieldType::PublicKey)),
        }
    }

    /// Metadata of a sealed cube.
    pub async fn meta(&mut self) -> Result<CubeMeta, CubeError> {
        let hash = self.hash().await?;
        let key = self.key().await?;
        Ok(CubeMeta {
            key,
            hash,
            date: self.date()?,
            challenge_level: trailing_zero_bits(&hash).min(u8::MAX as u32) as u8,
            cube_type: self.cube_type,
        })
    }

    // -------------------------------------------------------------------------
    // VERIFICATION
    // -------------------------------------------------------------------------

    /// Validate the authenticity proof of a sealed cube in isolation:
    /// hashcash for frozen cubes, fingerprint plus signature for MUCs.
    pub fn verify(&self, required_difficulty: u8) -> Result<(), CubeError> {
        let binary = self
            .binary
            .as_ref()
            .ok_or(CubeError::ApiMisuse("verify requires a sealed cube"))?;

        match self.cube_type {
            CubeType::Frozen => {
                let h = self.hash.unwrap_or_else(|| sha3(binary));
                if trailing_zero_bits(&h) < required_difficulty as u32 {
                    return Err(CubeError::InsufficientDifficulty);
                }
                Ok(())
            }
            CubeType::Muc => {
                let pk = self
                    .public_key()
                    .ok_or(CubeError::MissingField(FieldType::PublicKey))?;
                let sig_field = self
                    .fields
                    .get_first(FieldType::Signature)
                    .ok_or(CubeError::MissingField(FieldType::Signature))?;
                let sig_start = sig_field
                    .start
                    .ok_or(CubeError::ApiMisuse("signature field not finalized"))?;
                if sig_field.value.len() != FINGERPRINT_SIZE + SIGNATURE_SIZE {
                    return Err(CubeError::Signature);
                }

                // The embedded public key must hash to the fingerprint.
                if sig_field.value[..FINGERPRINT_SIZE] != fingerprint(&pk) {
                    return Err(CubeError::Fingerprint);
                }

                // Signed payload: everything up to and including the
                // fingerprint, excluding the signature bytes themselves.
                let signed = &binary[..sig_start + FINGERPRINT_SIZE];
                crypto::verify(&pk, signed, &sig_field.value[FINGERPRINT_SIZE..])
                    .map_err(|_| CubeError::Signature)
            }
        }
    }
}

fn random_bytes(n: usize) -> Vec<u8> {
    let mut out = vec![0u8; n];
    rand::thread_rng().fill_bytes(&mut out);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frozen_cube_seals_and_verifies() {
        let mut cube = Cube::sculpt_frozen(vec![Field::payload(b"hello".to_vec())], 0).unwrap();
        let bytes = cube.binary().await.unwrap().to_vec();
        assert_eq!(bytes.len(), CUBE_SIZE);

        let parsed = Cube::from_binary(&bytes).unwrap();
        assert_eq!(parsed.cube_type(), CubeType::Frozen);
        assert_eq!(parsed.payload(), Some(&b"hello"[..]));
        parsed.verify(0).unwrap();

        // Frozen key is the content hash.
        let mut parsed = parsed;
        assert_eq!(parsed.key().await.unwrap(), sha3(&bytes));
    }

    #[tokio::test]
    async fn frozen_cube_meets_difficulty() {
        let difficulty = 8;
        let mut cube =
            Cube::sculpt_frozen(vec![Field::payload(b"mined".to_vec())], difficulty).unwrap();
        let hash = cube.hash().await.unwrap();
        assert!(trailing_zero_bits(&hash) >= difficulty as u32);
        let parsed = Cube::from_binary(cube.binary().await.unwrap()).unwrap();
        parsed.verify(difficulty).unwrap();
    }

    #[tokio::test]
    async fn insufficient_difficulty_is_detected() {
        // Mine at 0; statistically a hash with >= 20 trailing zero bits
        // will not appear by chance.
        let mut cube = Cube::sculpt_frozen(vec![Field::payload(b"weak".to_vec())], 0).unwrap();
        let parsed = Cube::from_binary(cube.binary().await.unwrap()).unwrap();
        assert!(matches!(
            parsed.verify(20),
            Err(CubeError::InsufficientDifficulty)
        ));
    }

    #[tokio::test]
    async fn muc_seals_signs_and_verifies() {
        let kp = Keypair::from_seed(&[1u8; 32]);
        let pk = kp.public_key();
        let mut cube = Cube::sculpt_muc(kp, vec![Field::payload(b"mutable".to_vec())], 0).unwrap();

        // MUC key is the public key, available before sealing.
        assert_eq!(cube.key().await.unwrap(), pk);

        let bytes = cube.binary().await.unwrap().to_vec();
        let parsed = Cube::from_binary(&bytes).unwrap();
        assert_eq!(parsed.cube_type(), CubeType::Muc);
        parsed.verify(0).unwrap();
    }

    #[tokio::test]
    async fn muc_tamper_is_detected() {
        let kp = Keypair::from_seed(&[2u8; 32]);
        let mut cube = Cube::sculpt_muc(kp, vec![Field::payload(b"signed".to_vec())], 0).unwrap();
        let mut bytes = cube.binary().await.unwrap().to_vec();

        // Flip one payload byte: signature no longer matches.
        bytes[4] ^= 0x01;
        let parsed = Cube::from_binary(&bytes).unwrap();
        assert!(matches!(parsed.verify(0), Err(CubeError::Signature)));
    }

    #[tokio::test]
    async fn muc_fingerprint_mismatch_is_detected() {
        let kp = Keypair::from_seed(&[3u8; 32]);
        let mut cube = Cube::sculpt_muc(kp, vec![], 0).unwrap();
        let mut bytes = cube.binary().await.unwrap().to_vec();

        // Corrupt the fingerprint (first byte of the signature field).
        let fp_offset = CUBE_SIZE - FINGERPRINT_SIZE - SIGNATURE_SIZE;
        bytes[fp_offset] ^= 0xFF;
        let parsed = Cube::from_binary(&bytes).unwrap();
        assert!(matches!(parsed.verify(0), Err(CubeError::Fingerprint)));
    }

    #[tokio::test]
    async fn mutation_invalidates_seal() {
        let kp = Keypair::from_seed(&[4u8; 32]);
        let mut cube = Cube::sculpt_muc(kp, vec![Field::payload(b"v1".to_vec())], 0).unwrap();
        let first = cube.binary().await.unwrap().to_vec();

        cube.set_payload(b"v2".to_vec());
        cube.set_date(cube.date().unwrap() + 1).unwrap();
        let second = cube.binary().await.unwrap().to_vec();

        assert_ne!(first, second);
        let parsed = Cube::from_binary(&second).unwrap();
        parsed.verify(0).unwrap();
        assert_eq!(parsed.payload(), Some(&b"v2"[..]));
    }

    #[tokio::test]
    async fn oversized_content_is_rejected() {
        // A payload too large to fit next to the positional overhead.
        let res = Cube::sculpt_frozen(vec![Field::payload(vec![0u8; 1015])], 0);
        assert!(matches!(res, Err(CubeError::ContentSize)));
    }

    #[tokio::test]
    async fn wrong_length_binary_is_rejected() {
        assert!(matches!(
            Cube::from_binary(&[0u8; 100]),
            Err(CubeError::BinaryLength(100))
        ));
        assert!(matches!(
            Cube::from_binary(&vec![0x01; CUBE_SIZE]),
            Err(CubeError::BinaryData)
        ));
    }

    #[tokio::test]
    async fn roundtrip_fields_match() {
        let mut cube = Cube::sculpt_frozen(
            vec![Field::payload(b"abc".to_vec()), Field::notify([7u8; 32])],
            0,
        )
        .unwrap();
        let bytes = cube.binary().await.unwrap().to_vec();
        let parsed = Cube::from_binary(&bytes).unwrap();
        assert!(parsed.fields().equals(
            cube.fields(),
            crate::field::FieldEquality::Exact,
            false
        ));
    }
}
