//! TLV field engine with positional fields.
//!
//! A cube binary is an ordered field sequence: front positional fields at
//! fixed offsets from the start, back positional fields at fixed offsets
//! from the end, and tagged (type/length/value) fields in between.
//!
//! Header encoding:
//! - the 6-bit type tag occupies the high 6 bits of the first header byte
//! - fixed-length types carry no length field (1-byte header)
//! - variable-length types carry a 10-bit length in the low 2 bits of the
//!   first byte plus all of the second byte (2-byte header)
//! - positional fields carry no header at all; their presence and order
//!   come from the field definition
//!
//! First header bytes above 0xFC are forbidden, which reserves the 6-bit
//! tag 0x3F. It is used internally for the synthetic remainder field and
//! never compiled with a header.

use crate::types::{
    CubeType, CUBE_KEY_SIZE, CUBE_TYPE_SIZE, FINGERPRINT_SIZE, NONCE_SIZE, PUBLIC_KEY_SIZE,
    SIGNATURE_SIZE, TIMESTAMP_SIZE,
};
use thiserror::Error;

/// Largest value a 10-bit TLV length can describe.
pub const MAX_FIELD_LENGTH: usize = 0x3FF;

/// Highest compilable 6-bit type tag (0x3F is reserved).
const MAX_FIELD_TAG: u8 = 0x3E;

#[derive(Error, Debug)]
pub enum FieldError {
    #[error("binary length mismatch: expected {expected}, got {got}")]
    BinaryLength { expected: usize, got: usize },
    #[error("field size does not fit container")]
    FieldSize,
    #[error("unknown field type 0x{0:02x}")]
    UnknownType(u8),
    #[error("wrong field type")]
    WrongType,
    #[error("field type {0:?} not implemented")]
    NotImplemented(FieldType),
    #[error("api misuse: {0}")]
    ApiMisuse(&'static str),
}

// =============================================================================
// FIELD TYPES
// =============================================================================

/// Field type tags.
///
/// Positional types never appear in headers; their tag only identifies them
/// inside a parsed field list. TLV tags are wire-stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum FieldType {
    /// Cube type tag (front positional, 1 byte).
    TypeTag = 0x00,
    /// Application payload (TLV, variable).
    Payload = 0x01,
    /// Key of another cube this record points at (TLV, 32 bytes).
    Notify = 0x02,
    /// Reserved for key distribution records.
    KeyDistribution = 0x03,
    /// Reserved for shared-key records.
    SharedKey = 0x04,
    /// Reserved for encrypted bodies.
    Encrypted = 0x05,
    /// Random filler; TLV parsing stops after this field.
    Padding = 0x06,
    /// Owner public key (back positional on MUCs, 32 bytes).
    PublicKey = 0x10,
    /// Sculpt date, 40-bit big-endian seconds since epoch (back positional).
    Date = 0x11,
    /// Hashcash nonce (back positional, 4 bytes).
    Nonce = 0x12,
    /// Fingerprint plus detached signature (back positional on MUCs).
    Signature = 0x13,
    /// Synthetic field exposing raw bytes after the stop field. Never
    /// carries a header; compiled back verbatim.
    Remainder = 0x3F,
}

impl FieldType {
    /// Parse a 6-bit tag.
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0x00 => Some(FieldType::TypeTag),
            0x01 => Some(FieldType::Payload),
            0x02 => Some(FieldType::Notify),
            0x03 => Some(FieldType::KeyDistribution),
            0x04 => Some(FieldType::SharedKey),
            0x05 => Some(FieldType::Encrypted),
            0x06 => Some(FieldType::Padding),
            0x10 => Some(FieldType::PublicKey),
            0x11 => Some(FieldType::Date),
            0x12 => Some(FieldType::Nonce),
            0x13 => Some(FieldType::Signature),
            0x3F => Some(FieldType::Remainder),
            _ => None,
        }
    }

    /// Declared fixed value length, if any. Variable-length types return
    /// `None` and carry a length header.
    pub fn fixed_len(&self) -> Option<usize> {
        match self {
            FieldType::TypeTag => Some(CUBE_TYPE_SIZE),
            FieldType::Notify => Some(CUBE_KEY_SIZE),
            FieldType::PublicKey => Some(PUBLIC_KEY_SIZE),
            FieldType::Date => Some(TIMESTAMP_SIZE),
            FieldType::Nonce => Some(NONCE_SIZE),
            FieldType::Signature => Some(FINGERPRINT_SIZE + SIGNATURE_SIZE),
            _ => None,
        }
    }

    /// Reserved types decompile to `FieldError::NotImplemented`.
    pub fn is_reserved(&self) -> bool {
        matches!(
            self,
            FieldType::KeyDistribution | FieldType::SharedKey | FieldType::Encrypted
        )
    }
}

// =============================================================================
// FIELD DEFINITION
// =============================================================================

/// Describes how a field list maps onto a binary: which types are front and
/// back positional, where TLV parsing stops, and whether post-stop bytes are
/// surfaced as a synthetic remainder field.
#[derive(Debug, Clone, Copy)]
pub struct FieldDef {
    pub positional_front: &'static [FieldType],
    pub positional_back: &'static [FieldType],
    pub stop_field: Option<FieldType>,
    pub remainder_field: Option<FieldType>,
}

/// Frozen cube layout: `TYPE || tlv... || DATE || NONCE`.
pub static FROZEN_DEF: FieldDef = FieldDef {
    positional_front: &[FieldType::TypeTag],
    positional_back: &[FieldType::Date, FieldType::Nonce],
    stop_field: Some(FieldType::Padding),
    remainder_field: Some(FieldType::Remainder),
};

/// MUC layout: `TYPE || tlv... || PUBLIC_KEY || DATE || NONCE || SIGNATURE`.
/// The signature is always the last field; the nonce is the last region
/// mutated during mining that the signature still covers.
pub static MUC_DEF: FieldDef = FieldDef {
    positional_front: &[FieldType::TypeTag],
    positional_back: &[
        FieldType::PublicKey,
        FieldType::Date,
        FieldType::Nonce,
        FieldType::Signature,
    ],
    stop_field: Some(FieldType::Padding),
    remainder_field: Some(FieldType::Remainder),
};

impl FieldDef {
    pub fn for_cube_type(cube_type: CubeType) -> &'static FieldDef {
        match cube_type {
            CubeType::Frozen => &FROZEN_DEF,
            CubeType::Muc => &MUC_DEF,
        }
    }

    /// Is this type positional (front or back) under this definition?
    pub fn is_positional(&self, t: FieldType) -> bool {
        self.positional_front.contains(&t) || self.positional_back.contains(&t)
    }

    /// Summed length of all back positional fields.
    fn back_len(&self) -> Result<usize, FieldError> {
        let mut total = 0;
        for t in self.positional_back {
            total += t
                .fixed_len()
                .ok_or(FieldError::ApiMisuse("back positional must be fixed length"))?;
        }
        Ok(total)
    }
}

// =============================================================================
// FIELD
// =============================================================================

/// One field: a type tag, a value, and (once compiled or decompiled) the
/// offset of the value inside the binary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Field {
    pub field_type: FieldType,
    pub value: Vec<u8>,
    /// Offset of the value bytes within the compiled binary. `None` until
    /// the field is finalized.
    pub start: Option<usize>,
}

impl Field {
    pub fn new(field_type: FieldType, value: Vec<u8>) -> Self {
        Self {
            field_type,
            value,
            start: None,
        }
    }

    pub fn payload(value: impl Into<Vec<u8>>) -> Self {
        Self::new(FieldType::Payload, value.into())
    }

    pub fn notify(key: [u8; CUBE_KEY_SIZE]) -> Self {
        Self::new(FieldType::Notify, key.to_vec())
    }

    /// Header bytes this field occupies under `def`.
    pub fn header_len(&self, def: &FieldDef) -> usize {
        if def.is_positional(self.field_type) || self.field_type == FieldType::Remainder {
            0
        } else if self.field_type.fixed_len().is_some() {
            1
        } else {
            2
        }
    }

    /// Header plus value bytes under `def`.
    pub fn byte_len(&self, def: &FieldDef) -> usize {
        self.header_len(def) + self.value.len()
    }
}

// =============================================================================
// FIELDS COLLECTION
// =============================================================================

/// Ordered field list bound to a field definition.
#[derive(Debug, Clone)]
pub struct Fields {
    fields: Vec<Field>,
    def: &'static FieldDef,
}

/// Which parts of two field lists must match.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldEquality {
    /// Same order, same values, same finalized offsets.
    Exact,
    /// Same order, same values; offsets ignored.
    Ordered,
    /// Same multiset of (type, value); order and offsets ignored.
    Unordered,
}

impl Fields {
    pub fn new(def: &'static FieldDef) -> Self {
        Self {
            fields: Vec::new(),
            def,
        }
    }

    pub fn from_fields(fields: Vec<Field>, def: &'static FieldDef) -> Self {
        Self { fields, def }
    }

    pub fn def(&self) -> &'static FieldDef {
        self.def
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Field> {
        self.fields.iter()
    }

    pub fn push(&mut self, field: Field) {
        self.fields.push(field);
    }

    /// First field of the given type.
    pub fn get_first(&self, t: FieldType) -> Option<&Field> {
        self.fields.iter().find(|f| f.field_type == t)
    }

    pub fn get_first_mut(&mut self, t: FieldType) -> Option<&mut Field> {
        self.fields.iter_mut().find(|f| f.field_type == t)
    }

    /// All fields of the given type, in order.
    pub fn all(&self, t: FieldType) -> impl Iterator<Item = &Field> {
        self.fields.iter().filter(move |f| f.field_type == t)
    }

    /// Number of leading fields that are front positionals in declared order.
    fn front_positional_count(&self) -> usize {
        let mut n = 0;
        for (i, f) in self.fields.iter().enumerate() {
            match self.def.positional_front.get(i) {
                Some(t) if *t == f.field_type => n += 1,
                _ => break,
            }
        }
        n
    }

    /// Number of trailing fields that are back positionals.
    fn back_positional_count(&self) -> usize {
        let mut n = 0;
        for f in self.fields.iter().rev() {
            if self.def.positional_back.contains(&f.field_type) {
                n += 1;
            } else {
                break;
            }
        }
        n
    }

    /// Insert a field directly after the front positional block.
    pub fn insert_after_front_positionals(&mut self, field: Field) {
        let at = self.front_positional_count();
        self.fields.insert(at, field);
    }

    /// Insert a field directly before the back positional block.
    pub fn insert_before_back_positionals(&mut self, field: Field) {
        let at = self.fields.len() - self.back_positional_count();
        self.fields.insert(at, field);
    }

    /// Replace the value of an existing front positional of this type, or
    /// insert it at its declared slot.
    pub fn ensure_field_in_front(&mut self, field: Field) -> Result<(), FieldError> {
        let slot = self
            .def
            .positional_front
            .iter()
            .position(|t| *t == field.field_type)
            .ok_or(FieldError::ApiMisuse("not a front positional type"))?;
        if let Some(existing) = self.get_first_mut(field.field_type) {
            existing.value = field.value;
            existing.start = None;
            return Ok(());
        }
        let at = slot.min(self.front_positional_count());
        self.fields.insert(at, field);
        Ok(())
    }

    /// Replace the value of an existing back positional of this type, or
    /// insert it at its declared slot.
    pub fn ensure_field_in_back(&mut self, field: Field) -> Result<(), FieldError> {
        let slot = self
            .def
            .positional_back
            .iter()
            .position(|t| *t == field.field_type)
            .ok_or(FieldError::ApiMisuse("not a back positional type"))?;
        if let Some(existing) = self.get_first_mut(field.field_type) {
            existing.value = field.value;
            existing.start = None;
            return Ok(());
        }
        // Keep declared relative order within the present back block.
        let block_start = self.fields.len() - self.back_positional_count();
        let mut at = block_start;
        for f in &self.fields[block_start..] {
            let existing_slot = self
                .def
                .positional_back
                .iter()
                .position(|t| *t == f.field_type)
                .unwrap_or(usize::MAX);
            if existing_slot < slot {
                at += 1;
            } else {
                break;
            }
        }
        self.fields.insert(at, field);
        Ok(())
    }

    /// Summed byte length of all fields (headers plus values).
    pub fn byte_len(&self) -> usize {
        self.fields.iter().map(|f| f.byte_len(self.def)).sum()
    }

    // -------------------------------------------------------------------------
    // COMPILE
    // -------------------------------------------------------------------------

    /// Compile the field list into a binary of exactly `expected` bytes,
    /// finalizing every field's offset.
    pub fn compile(&mut self, expected: usize) -> Result<Vec<u8>, FieldError> {
        let total = self.byte_len();
        if total != expected {
            return Err(FieldError::BinaryLength {
                expected,
                got: total,
            });
        }

        let mut out = vec![0u8; expected];
        let mut cursor = 0usize;

        for field in &mut self.fields {
            let headerless = self.def.is_positional(field.field_type)
                || field.field_type == FieldType::Remainder;

            if let Some(fixed) = field.field_type.fixed_len()
                && field.value.len() != fixed
            {
                return Err(FieldError::FieldSize);
            }

            if !headerless {
                let tag = field.field_type as u8;
                if tag > MAX_FIELD_TAG {
                    return Err(FieldError::ApiMisuse("tag not compilable"));
                }
                match field.field_type.fixed_len() {
                    Some(_) => {
                        out[cursor] = tag << 2;
                        cursor += 1;
                    }
                    None => {
                        let len = field.value.len();
                        if len > MAX_FIELD_LENGTH {
                            return Err(FieldError::FieldSize);
                        }
                        out[cursor] = (tag << 2) | ((len >> 8) as u8 & 0x03);
                        out[cursor + 1] = (len & 0xFF) as u8;
                        cursor += 2;
                    }
                }
            }

            field.start = Some(cursor);
            out[cursor..cursor + field.value.len()].copy_from_slice(&field.value);
            cursor += field.value.len();
        }

        debug_assert_eq!(cursor, expected);
        Ok(out)
    }

    // -------------------------------------------------------------------------
    // DECOMPILE
    // -------------------------------------------------------------------------

    /// Parse a binary back into a field list.
    ///
    /// Back positionals are stripped from the tail first (their lengths are
    /// fixed), front positionals are read by running index, then TLV fields
    /// are parsed until the stop field or the end of the middle region.
    /// Post-stop bytes surface as the synthetic remainder field.
    pub fn decompile(bytes: &[u8], def: &'static FieldDef) -> Result<Fields, FieldError> {
        let back_len = def.back_len()?;
        if bytes.len() < back_len {
            return Err(FieldError::BinaryLength {
                expected: back_len,
                got: bytes.len(),
            });
        }
        let back_start = bytes.len() - back_len;

        let mut fields = Vec::new();
        let mut cursor = 0usize;

        // Front positionals by running index.
        for t in def.positional_front {
            let len = t
                .fixed_len()
                .ok_or(FieldError::ApiMisuse("front positional must be fixed length"))?;
            if cursor + len > back_start {
                return Err(FieldError::BinaryLength {
                    expected: cursor + len,
                    got: back_start,
                });
            }
            fields.push(Field {
                field_type: *t,
                value: bytes[cursor..cursor + len].to_vec(),
                start: Some(cursor),
            });
            cursor += len;
        }

        // TLV middle region.
        let mut stopped = false;
        while cursor < back_start {
            let first = bytes[cursor];
            let tag = first >> 2;
            let field_type = FieldType::from_tag(tag).ok_or(FieldError::UnknownType(tag))?;
            if field_type.is_reserved() {
                return Err(FieldError::NotImplemented(field_type));
            }
            if def.is_positional(field_type) || field_type == FieldType::Remainder {
                // A positional tag inside the TLV region is not a valid header.
                return Err(FieldError::UnknownType(tag));
            }

            let (header, len) = match field_type.fixed_len() {
                Some(fixed) => (1usize, fixed),
                None => {
                    if cursor + 2 > back_start {
                        return Err(FieldError::FieldSize);
                    }
                    let len = (((first & 0x03) as usize) << 8) | bytes[cursor + 1] as usize;
                    (2usize, len)
                }
            };
            if cursor + header + len > back_start {
                return Err(FieldError::FieldSize);
            }

            fields.push(Field {
                field_type,
                value: bytes[cursor + header..cursor + header + len].to_vec(),
                start: Some(cursor + header),
            });
            cursor += header + len;

            if def.stop_field == Some(field_type) {
                stopped = true;
                break;
            }
        }

        // Post-stop tail, if any, becomes the synthetic remainder field.
        if stopped && cursor < back_start {
            if let Some(rt) = def.remainder_field {
                fields.push(Field {
                    field_type: rt,
                    value: bytes[cursor..back_start].to_vec(),
                    start: Some(cursor),
                });
            }
            cursor = back_start;
        }
        debug_assert_eq!(cursor, back_start);

        // Back positionals from the tail.
        for t in def.positional_back {
            let len = t.fixed_len().ok_or(FieldError::ApiMisuse(
                "back positional must be fixed length",
            ))?;
            fields.push(Field {
                field_type: *t,
                value: bytes[cursor..cursor + len].to_vec(),
                start: Some(cursor),
            });
            cursor += len;
        }

        Ok(Fields { fields, def })
    }

    // -------------------------------------------------------------------------
    // EQUALITY
    // -------------------------------------------------------------------------

    /// Index of the stop field, if present.
    fn stop_index(&self) -> Option<usize> {
        let stop = self.def.stop_field?;
        self.fields.iter().position(|f| f.field_type == stop)
    }

    /// A field is disregarded when it sits after the stop field and is not
    /// positional, or is the synthetic remainder.
    fn is_disregarded(&self, index: usize) -> bool {
        let f = &self.fields[index];
        if Some(f.field_type) == self.def.remainder_field {
            return true;
        }
        match self.stop_index() {
            Some(stop) => index > stop && !self.def.is_positional(f.field_type),
            None => false,
        }
    }

    fn comparable(&self, ignore_disregarded: bool) -> Vec<&Field> {
        self.fields
            .iter()
            .enumerate()
            .filter(|(i, _)| !ignore_disregarded || !self.is_disregarded(*i))
            .map(|(_, f)| f)
            .collect()
    }

    /// Compare two field lists under the given equality metric.
    pub fn equals(&self, other: &Fields, mode: FieldEquality, ignore_disregarded: bool) -> bool {
        let a = self.comparable(ignore_disregarded);
        let b = other.comparable(ignore_disregarded);
        if a.len() != b.len() {
            return false;
        }
        match mode {
            FieldEquality::Exact => a
                .iter()
                .zip(&b)
                .all(|(x, y)| x.field_type == y.field_type && x.value == y.value && x.start == y.start),
            FieldEquality::Ordered => a
                .iter()
                .zip(&b)
                .all(|(x, y)| x.field_type == y.field_type && x.value == y.value),
            FieldEquality::Unordered => {
                let mut ka: Vec<_> = a.iter().map(|f| (f.field_type, &f.value)).collect();
                let mut kb: Vec<_> = b.iter().map(|f| (f.field_type, &f.value)).collect();
                ka.sort();
                kb.sort();
                ka == kb
            }
        }
    }
}
