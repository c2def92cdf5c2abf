//! Wire message codec.
//!
//! Every message is one transport frame:
//! `[protocol_version: u8][message_class: u8][payload...]`, all integers
//! big-endian. Decoding is bounded: counts are capped before allocation,
//! lengths are checked against the remaining buffer, and trailing bytes
//! are rejected.

use super::types::{
    AddressType, MAX_ADDRESS_LENGTH, MAX_CUBE_HASH_COUNT, MAX_NODE_ADDRESS_COUNT,
    PROTOCOL_VERSION,
};
use crate::types::{CubeKey, CUBE_KEY_SIZE, CUBE_SIZE, PEER_ID_SIZE, PeerId};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MessageError {
    #[error("truncated message")]
    Truncated,
    #[error("trailing bytes after message")]
    Trailing,
    #[error("unknown message class 0x{0:02x}")]
    UnknownClass(u8),
    #[error("count {got} exceeds limit {limit}")]
    TooMany { got: usize, limit: usize },
    #[error("invalid address in message")]
    BadAddress,
    #[error("invalid hello payload")]
    BadHello,
}

// =============================================================================
// MESSAGE CLASSES
// =============================================================================

/// Second header byte of every message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageClass {
    Hello = 0x00,
    KeyRequest = 0x01,
    KeyResponse = 0x02,
    CubeRequest = 0x03,
    CubeResponse = 0x04,
    NodeRequest = 0x05,
    NodeResponse = 0x06,
    MyServerAddress = 0x07,
    SubscribeCube = 0x08,
    SubscriptionConfirmation = 0x09,
}

impl MessageClass {
    /// All classes, for per-class statistics tables.
    pub const ALL: [MessageClass; 10] = [
        MessageClass::Hello,
        MessageClass::KeyRequest,
        MessageClass::KeyResponse,
        MessageClass::CubeRequest,
        MessageClass::CubeResponse,
        MessageClass::NodeRequest,
        MessageClass::NodeResponse,
        MessageClass::MyServerAddress,
        MessageClass::SubscribeCube,
        MessageClass::SubscriptionConfirmation,
    ];

    pub fn from_u8(v: u8) -> Option<Self> {
        Self::ALL.get(v as usize).copied()
    }

    pub fn command(&self) -> &'static str {
        match self {
            MessageClass::Hello => "hello",
            MessageClass::KeyRequest => "keyrequest",
            MessageClass::KeyResponse => "keyresponse",
            MessageClass::CubeRequest => "cuberequest",
            MessageClass::CubeResponse => "cuberesponse",
            MessageClass::NodeRequest => "noderequest",
            MessageClass::NodeResponse => "noderesponse",
            MessageClass::MyServerAddress => "myserveraddress",
            MessageClass::SubscribeCube => "subscribecube",
            MessageClass::SubscriptionConfirmation => "subscriptionconfirmation",
        }
    }
}

// =============================================================================
// PAYLOAD TYPES
// =============================================================================

/// One record of a key response: enough metadata for the receiver to
/// decide whether to fetch the cube.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyOffer {
    pub cube_type: u8,
    pub challenge_level: u8,
    /// 40-bit seconds since epoch.
    pub date: u64,
    pub key: CubeKey,
}

/// Subscription confirmation result code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SubscriptionCode {
    Confirmed = 0,
    KeyNotAvailable = 1,
}

impl SubscriptionCode {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(SubscriptionCode::Confirmed),
            1 => Some(SubscriptionCode::KeyNotAvailable),
            _ => None,
        }
    }
}

/// A decoded protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Hello { id: PeerId },
    KeyRequest,
    KeyResponse(Vec<KeyOffer>),
    CubeRequest(Vec<CubeKey>),
    CubeResponse(Vec<Vec<u8>>),
    NodeRequest,
    NodeResponse(Vec<(AddressType, String)>),
    MyServerAddress { addr_type: AddressType, addr: String },
    SubscribeCube(Vec<CubeKey>),
    SubscriptionConfirmation {
        code: SubscriptionCode,
        key_blob: [u8; 32],
        hash_blob: [u8; 32],
        duration_ms: u32,
    },
}

impl Message {
    pub fn class(&self) -> MessageClass {
        match self {
            Message::Hello { .. } => MessageClass::Hello,
            Message::KeyRequest => MessageClass::KeyRequest,
            Message::KeyResponse(_) => MessageClass::KeyResponse,
            Message::CubeRequest(_) => MessageClass::CubeRequest,
            Message::CubeResponse(_) => MessageClass::CubeResponse,
            Message::NodeRequest => MessageClass::NodeRequest,
            Message::NodeResponse(_) => MessageClass::NodeResponse,
            Message::MyServerAddress { .. } => MessageClass::MyServerAddress,
            Message::SubscribeCube(_) => MessageClass::SubscribeCube,
            Message::SubscriptionConfirmation { .. } => MessageClass::SubscriptionConfirmation,
        }
    }

    pub fn command(&self) -> &'static str {
        self.class().command()
    }

    // -------------------------------------------------------------------------
    // ENCODE
    // -------------------------------------------------------------------------

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(64);
        out.push(PROTOCOL_VERSION);
        out.push(self.class() as u8);

        match self {
            Message::Hello { id } => out.extend_from_slice(id),
            Message::KeyRequest | Message::NodeRequest => {}
            Message::KeyResponse(offers) => {
                put_u32(&mut out, offers.len() as u32);
                for o in offers {
                    out.push(o.cube_type);
                    out.push(o.challenge_level);
                    put_u40(&mut out, o.date);
                    out.extend_from_slice(&o.key);
                }
            }
            Message::CubeRequest(keys) | Message::SubscribeCube(keys) => {
                put_u32(&mut out, keys.len() as u32);
                for k in keys {
                    out.extend_from_slice(k);
                }
            }
            Message::CubeResponse(cubes) => {
                put_u32(&mut out, cubes.len() as u32);
                for c in cubes {
                    out.extend_from_slice(c);
                }
            }
            Message::NodeResponse(addrs) => {
                put_u32(&mut out, addrs.len() as u32);
                for (t, s) in addrs {
                    out.push(*t as u8);
                    put_u16(&mut out, s.len() as u16);
                    out.extend_from_slice(s.as_bytes());
                }
            }
            Message::MyServerAddress { addr_type, addr } => {
                out.push(*addr_type as u8);
                put_u16(&mut out, addr.len() as u16);
                out.extend_from_slice(addr.as_bytes());
            }
            Message::SubscriptionConfirmation {
                code,
                key_blob,
                hash_blob,
                duration_ms,
            } => {
                out.push(*code as u8);
                out.extend_from_slice(key_blob);
                out.extend_from_slice(hash_blob);
                put_u32(&mut out, *duration_ms);
            }
        }
        out
    }

    // -------------------------------------------------------------------------
    // DECODE
    // -------------------------------------------------------------------------

    /// Decode one frame. Returns the sender's protocol version alongside
    /// the message; version mismatches are the caller's to log.
    pub fn decode(frame: &[u8]) -> Result<(u8, Message), MessageError> {
        let mut r = Reader::new(frame);
        let version = r.u8()?;
        let class_byte = r.u8()?;
        let class =
            MessageClass::from_u8(class_byte).ok_or(MessageError::UnknownClass(class_byte))?;

        let msg = match class {
            MessageClass::Hello => {
                if r.remaining() != PEER_ID_SIZE {
                    return Err(MessageError::BadHello);
                }
                let mut id = [0u8; PEER_ID_SIZE];
                id.copy_from_slice(r.take(PEER_ID_SIZE)?);
                Message::Hello { id }
            }
            MessageClass::KeyRequest => Message::KeyRequest,
            MessageClass::NodeRequest => Message::NodeRequest,
            MessageClass::KeyResponse => {
                let count = r.bounded_count(MAX_CUBE_HASH_COUNT)?;
                let mut offers = Vec::with_capacity(count);
                for _ in 0..count {
                    let cube_type = r.u8()?;
                    let challenge_level = r.u8()?;
                    let date = r.u40()?;
                    let key = r.key()?;
                    offers.push(KeyOffer {
                        cube_type,
                        challenge_level,
                        date,
                        key,
                    });
                }
                Message::KeyResponse(offers)
            }
            MessageClass::CubeRequest => Message::CubeRequest(r.key_list()?),
            MessageClass::SubscribeCube => Message::SubscribeCube(r.key_list()?),
            MessageClass::CubeResponse => {
                let count = r.bounded_count(MAX_CUBE_HASH_COUNT)?;
                let mut cubes = Vec::with_capacity(count);
                for _ in 0..count {
                    cubes.push(r.take(CUBE_SIZE)?.to_vec());
                }
                Message::CubeResponse(cubes)
            }
            MessageClass::NodeResponse => {
                let count = r.bounded_count(MAX_NODE_ADDRESS_COUNT)?;
                let mut addrs = Vec::with_capacity(count);
                for _ in 0..count {
                    addrs.push(r.address()?);
                }
                Message::NodeResponse(addrs)
            }
            MessageClass::MyServerAddress => {
                let (addr_type, addr) = r.address()?;
                Message::MyServerAddress { addr_type, addr }
            }
            MessageClass::SubscriptionConfirmation => {
                let code =
                    SubscriptionCode::from_u8(r.u8()?).ok_or(MessageError::Truncated)?;
                let mut key_blob = [0u8; 32];
                key_blob.copy_from_slice(r.take(32)?);
                let mut hash_blob = [0u8; 32];
                hash_blob.copy_from_slice(r.take(32)?);
                let duration_ms = r.u32()?;
                Message::SubscriptionConfirmation {
                    code,
                    key_blob,
                    hash_blob,
                    duration_ms,
                }
            }
        };

        if r.remaining() != 0 {
            return Err(MessageError::Trailing);
        }
        Ok((version, msg))
    }
}

// =============================================================================
// BOUNDED READER
// =============================================================================

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], MessageError> {
        if self.remaining() < n {
            return Err(MessageError::Truncated);
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, MessageError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, MessageError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, MessageError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u40(&mut self) -> Result<u64, MessageError> {
        let b = self.take(5)?;
        let mut out = 0u64;
        for byte in b {
            out = (out << 8) | *byte as u64;
        }
        Ok(out)
    }

    /// Read a u32 count and reject it before allocating anything.
    fn bounded_count(&mut self, limit: usize) -> Result<usize, MessageError> {
        let count = self.u32()? as usize;
        if count > limit {
            return Err(MessageError::TooMany { got: count, limit });
        }
        Ok(count)
    }

    fn key(&mut self) -> Result<CubeKey, MessageError> {
        let mut key = [0u8; CUBE_KEY_SIZE];
        key.copy_from_slice(self.take(CUBE_KEY_SIZE)?);
        Ok(key)
    }

    fn key_list(&mut self) -> Result<Vec<CubeKey>, MessageError> {
        let count = self.bounded_count(MAX_CUBE_HASH_COUNT)?;
        let mut keys = Vec::with_capacity(count);
        for _ in 0..count {
            keys.push(self.key()?);
        }
        Ok(keys)
    }

    /// Read `{u8 type, u16 len, len ASCII bytes}`.
    fn address(&mut self) -> Result<(AddressType, String), MessageError> {
        let t = AddressType::from_u8(self.u8()?).ok_or(MessageError::BadAddress)?;
        let len = self.u16()? as usize;
        if len == 0 || len > MAX_ADDRESS_LENGTH {
            return Err(MessageError::BadAddress);
        }
        let bytes = self.take(len)?;
        if !bytes.is_ascii() {
            return Err(MessageError::BadAddress);
        }
        let s = String::from_utf8(bytes.to_vec()).map_err(|_| MessageError::BadAddress)?;
        Ok((t, s))
    }
}

fn put_u16(out: &mut Vec<u8>, v: u16) {
    out.extend_from_slice(&v.to_be_bytes());
}

fn put_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_be_bytes());
}

fn put_u40(out: &mut Vec<u8>, v: u64) {
    let b = v.to_be_bytes();
    out.extend_from_slice(&b[3..8]);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(msg: Message) {
        let bytes = msg.encode();
        assert_eq!(bytes[0], PROTOCOL_VERSION);
        let (version, decoded) = Message::decode(&bytes).unwrap();
        assert_eq!(version, PROTOCOL_VERSION);
        assert_eq!(decoded, msg);
    }

    #[test]
    fn all_classes_roundtrip() {
        roundtrip(Message::Hello { id: [3u8; 16] });
        roundtrip(Message::KeyRequest);
        roundtrip(Message::KeyResponse(vec![KeyOffer {
            cube_type: 0xFF,
            challenge_level: 4,
            date: 0xAB_CDEF_0123,
            key: [9u8; 32],
        }]));
        roundtrip(Message::CubeRequest(vec![[1u8; 32], [2u8; 32]]));
        roundtrip(Message::CubeResponse(vec![vec![7u8; CUBE_SIZE]]));
        roundtrip(Message::NodeRequest);
        roundtrip(Message::NodeResponse(vec![
            (AddressType::Tcp, "1.2.3.4:1984".to_string()),
            (AddressType::Opaque, "/dns4/node.example/tcp/4001".to_string()),
        ]));
        roundtrip(Message::MyServerAddress {
            addr_type: AddressType::Tcp,
            addr: "::1984".to_string(),
        });
        roundtrip(Message::SubscribeCube(vec![[5u8; 32]]));
        roundtrip(Message::SubscriptionConfirmation {
            code: SubscriptionCode::Confirmed,
            key_blob: [1u8; 32],
            hash_blob: [2u8; 32],
            duration_ms: 300_000,
        });
    }

    #[test]
    fn key_response_record_layout() {
        let msg = Message::KeyResponse(vec![KeyOffer {
            cube_type: 0xFF,
            challenge_level: 7,
            date: 0x01_0203_0405,
            key: [0xAA; 32],
        }]);
        let bytes = msg.encode();
        // header(2) + count(4) + type(1) + challenge(1) + u40(5) + key(32)
        assert_eq!(bytes.len(), 2 + 4 + 39);
        assert_eq!(&bytes[2..6], &[0, 0, 0, 1]);
        assert_eq!(bytes[6], 0xFF);
        assert_eq!(bytes[7], 7);
        assert_eq!(&bytes[8..13], &[0x01, 0x02, 0x03, 0x04, 0x05]);
    }

    #[test]
    fn oversized_counts_are_rejected() {
        let mut bytes = vec![PROTOCOL_VERSION, MessageClass::CubeRequest as u8];
        bytes.extend_from_slice(&(MAX_CUBE_HASH_COUNT as u32 + 1).to_be_bytes());
        assert!(matches!(
            Message::decode(&bytes),
            Err(MessageError::TooMany { .. })
        ));
    }

    #[test]
    fn truncation_is_rejected() {
        let bytes = Message::CubeResponse(vec![vec![1u8; CUBE_SIZE]]).encode();
        assert!(matches!(
            Message::decode(&bytes[..bytes.len() - 1]),
            Err(MessageError::Truncated)
        ));
        assert!(matches!(Message::decode(&[]), Err(MessageError::Truncated)));
    }

    #[test]
    fn trailing_bytes_are_rejected() {
        let mut bytes = Message::KeyRequest.encode();
        bytes.push(0);
        assert!(matches!(
            Message::decode(&bytes),
            Err(MessageError::Trailing)
        ));
    }

    #[test]
    fn bad_hello_length_is_flagged() {
        let mut bytes = vec![PROTOCOL_VERSION, MessageClass::Hello as u8];
        bytes.extend_from_slice(&[1u8; 8]);
        assert!(matches!(
            Message::decode(&bytes),
            Err(MessageError::BadHello)
        ));
    }

    #[test]
    fn unknown_class_is_rejected() {
        assert!(matches!(
            Message::decode(&[PROTOCOL_VERSION, 0x7F]),
            Err(MessageError::UnknownClass(0x7F))
        ));
    }

    #[test]
    fn non_ascii_address_is_rejected() {
        let mut bytes = vec![PROTOCOL_VERSION, MessageClass::MyServerAddress as u8];
        bytes.push(AddressType::Tcp as u8);
        bytes.extend_from_slice(&2u16.to_be_bytes());
        bytes.extend_from_slice(&[0xC3, 0xA9]);
        assert!(matches!(
            Message::decode(&bytes),
            Err(MessageError::BadAddress)
        ));
    }
}
