//! STUN/TURN message codec.
//!
//! Wire format:
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │ 0 0 │ Message Type (14) │ Message Length (16)           │
//! ├─────────────────────────────────────────────────────────┤
//! │ Magic Cookie (32) = 0x2112A442                          │
//! ├─────────────────────────────────────────────────────────┤
//! │ Transaction ID (96)                                     │
//! ├─────────────────────────────────────────────────────────┤
//! │ Attributes: Type (16) │ Length (16) │ Value, padded to 4│
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! The message type interleaves a 12-bit method with the 2-bit class:
//! `M11..M7 C1 M6..M4 C0 M3..M0`.

use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::crypto::{IntegrityKey, SecureRandom, INTEGRITY_SIZE};
use crate::error::{Error, Result};

/// Fixed value in every STUN header.
pub const MAGIC_COOKIE: u32 = 0x2112_A442;

/// Header size in bytes
pub const HEADER_SIZE: usize = 20;

/// Transaction id size in bytes
pub const TRANSACTION_ID_SIZE: usize = 12;

/// IANA protocol number carried in REQUESTED-TRANSPORT for UDP.
pub const TRANSPORT_UDP: u8 = 17;

/// Attribute types
pub mod attr {
    pub const USERNAME: u16 = 0x0006;
    pub const ERROR_CODE: u16 = 0x0009;
    pub const LIFETIME: u16 = 0x000D;
    pub const REALM: u16 = 0x0014;
    pub const NONCE: u16 = 0x0015;
    pub const XOR_RELAYED_ADDRESS: u16 = 0x0016;
    pub const REQUESTED_TRANSPORT: u16 = 0x0019;
    pub const MESSAGE_INTEGRITY_SHA256: u16 = 0x001C;
    pub const XOR_MAPPED_ADDRESS: u16 = 0x0020;
    pub const FINGERPRINT: u16 = 0x8028;
}

const FAMILY_IPV4: u8 = 0x01;

/// STUN and TURN methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Binding,
    Allocate,
    Refresh,
    Send,
    Data,
    CreatePermission,
    ChannelBind,
    Other(u16),
}

impl Method {
    pub fn code(self) -> u16 {
        match self {
            Method::Binding => 0x001,
            Method::Allocate => 0x003,
            Method::Refresh => 0x004,
            Method::Send => 0x006,
            Method::Data => 0x007,
            Method::CreatePermission => 0x008,
            Method::ChannelBind => 0x009,
            Method::Other(code) => code & 0x0FFF,
        }
    }

    pub fn from_code(code: u16) -> Self {
        match code {
            0x001 => Method::Binding,
            0x003 => Method::Allocate,
            0x004 => Method::Refresh,
            0x006 => Method::Send,
            0x007 => Method::Data,
            0x008 => Method::CreatePermission,
            0x009 => Method::ChannelBind,
            other => Method::Other(other),
        }
    }
}

/// Message class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Class {
    Request,
    Indication,
    SuccessResponse,
    FailureResponse,
}

impl Class {
    fn bits(self) -> u16 {
        match self {
            Class::Request => 0b00,
            Class::Indication => 0b01,
            Class::SuccessResponse => 0b10,
            Class::FailureResponse => 0b11,
        }
    }

    fn from_bits(bits: u16) -> Self {
        match bits & 0b11 {
            0b00 => Class::Request,
            0b01 => Class::Indication,
            0b10 => Class::SuccessResponse,
            _ => Class::FailureResponse,
        }
    }
}

fn encode_type(method: Method, class: Class) -> u16 {
    let m = method.code();
    let c = class.bits();
    ((m & 0x0F80) << 2) | ((m & 0x0070) << 1) | (m & 0x000F) | ((c & 0b10) << 7) | ((c & 0b01) << 4)
}

fn decode_type(message_type: u16) -> (Method, Class) {
    let m = (message_type & 0x000F) | ((message_type & 0x00E0) >> 1) | ((message_type & 0x3E00) >> 2);
    let c = ((message_type >> 7) & 0b10) | ((message_type >> 4) & 0b01);
    (Method::from_code(m), Class::from_bits(c))
}

fn padded(len: usize) -> usize {
    (len + 3) & !3
}

/// A single type-length-value attribute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    pub attr_type: u16,
    pub value: Bytes,
}

/// A STUN/TURN message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub method: Method,
    pub class: Class,
    pub transaction_id: [u8; TRANSACTION_ID_SIZE],
    pub attributes: Vec<Attribute>,
}

impl Message {
    pub fn new(method: Method, class: Class, transaction_id: [u8; TRANSACTION_ID_SIZE]) -> Self {
        Self {
            method,
            class,
            transaction_id,
            attributes: Vec::new(),
        }
    }

    /// A request with a fresh random transaction id.
    pub fn request(method: Method) -> Self {
        Self::new(method, Class::Request, SecureRandom::bytes::<TRANSACTION_ID_SIZE>())
    }

    /// A response to `request`, echoing its method and transaction id.
    pub fn response_to(request: &Message, class: Class) -> Self {
        Self::new(request.method, class, request.transaction_id)
    }

    pub fn push(&mut self, attr_type: u16, value: impl Into<Bytes>) {
        self.attributes.push(Attribute {
            attr_type,
            value: value.into(),
        });
    }

    /// Value of the first attribute of `attr_type`.
    pub fn attribute(&self, attr_type: u16) -> Option<&Bytes> {
        self.attributes
            .iter()
            .find(|a| a.attr_type == attr_type)
            .map(|a| &a.value)
    }

    pub fn has_attribute(&self, attr_type: u16) -> bool {
        self.attribute(attr_type).is_some()
    }

    pub fn push_text(&mut self, attr_type: u16, text: &str) {
        self.push(attr_type, Bytes::copy_from_slice(text.as_bytes()));
    }

    /// UTF-8 value of a text attribute (USERNAME, REALM, NONCE).
    pub fn text(&self, attr_type: u16) -> Option<&str> {
        self.attribute(attr_type)
            .and_then(|v| std::str::from_utf8(v).ok())
    }

    pub fn push_error_code(&mut self, code: u16, reason: &str) {
        let mut value = BytesMut::with_capacity(4 + reason.len());
        value.put_u16(0);
        value.put_u8((code / 100) as u8 & 0x07);
        value.put_u8((code % 100) as u8);
        value.put_slice(reason.as_bytes());
        self.push(attr::ERROR_CODE, value.freeze());
    }

    /// `(code, reason)` from ERROR-CODE.
    pub fn error_code(&self) -> Option<(u16, String)> {
        let value = self.attribute(attr::ERROR_CODE)?;
        if value.len() < 4 {
            return None;
        }
        let code = (value[2] & 0x07) as u16 * 100 + value[3] as u16;
        let reason = String::from_utf8_lossy(&value[4..]).into_owned();
        Some((code, reason))
    }

    pub fn push_lifetime(&mut self, seconds: u32) {
        self.push(attr::LIFETIME, Bytes::copy_from_slice(&seconds.to_be_bytes()));
    }

    pub fn lifetime(&self) -> Option<u32> {
        let value = self.attribute(attr::LIFETIME)?;
        let bytes: [u8; 4] = value.get(..4)?.try_into().ok()?;
        Some(u32::from_be_bytes(bytes))
    }

    pub fn push_requested_transport(&mut self, protocol: u8) {
        self.push(
            attr::REQUESTED_TRANSPORT,
            Bytes::copy_from_slice(&[protocol, 0, 0, 0]),
        );
    }

    pub fn requested_transport(&self) -> Option<u8> {
        self.attribute(attr::REQUESTED_TRANSPORT)?.first().copied()
    }

    /// Append an XOR-obfuscated IPv4 address attribute.
    pub fn push_xor_address(&mut self, attr_type: u16, addr: SocketAddrV4) {
        let cookie = MAGIC_COOKIE.to_be_bytes();
        let mut value = BytesMut::with_capacity(8);
        value.put_u8(0);
        value.put_u8(FAMILY_IPV4);
        value.put_u16(addr.port() ^ (MAGIC_COOKIE >> 16) as u16);
        for (octet, mask) in addr.ip().octets().iter().zip(cookie) {
            value.put_u8(octet ^ mask);
        }
        self.push(attr_type, value.freeze());
    }

    /// Decode an XOR address attribute. Only IPv4 is understood.
    pub fn xor_address(&self, attr_type: u16) -> Option<SocketAddrV4> {
        let value = self.attribute(attr_type)?;
        if value.len() < 8 || value[1] != FAMILY_IPV4 {
            return None;
        }
        let cookie = MAGIC_COOKIE.to_be_bytes();
        let port = u16::from_be_bytes([value[2], value[3]]) ^ (MAGIC_COOKIE >> 16) as u16;
        let ip = Ipv4Addr::new(
            value[4] ^ cookie[0],
            value[5] ^ cookie[1],
            value[6] ^ cookie[2],
            value[7] ^ cookie[3],
        );
        Some(SocketAddrV4::new(ip, port))
    }

    fn encode_excluding(&self, skip: Option<u16>) -> BytesMut {
        let attributes: Vec<&Attribute> = self
            .attributes
            .iter()
            .filter(|a| Some(a.attr_type) != skip)
            .collect();
        let body_len: usize = attributes.iter().map(|a| 4 + padded(a.value.len())).sum();

        let mut buf = BytesMut::with_capacity(HEADER_SIZE + body_len + 4 + INTEGRITY_SIZE);
        buf.put_u16(encode_type(self.method, self.class));
        buf.put_u16(body_len as u16);
        buf.put_u32(MAGIC_COOKIE);
        buf.put_slice(&self.transaction_id);
        for attribute in attributes {
            buf.put_u16(attribute.attr_type);
            buf.put_u16(attribute.value.len() as u16);
            buf.put_slice(&attribute.value);
            buf.put_bytes(0, padded(attribute.value.len()) - attribute.value.len());
        }
        buf
    }

    /// Encode the message into bytes for transmission.
    pub fn encode(&self) -> Bytes {
        self.encode_excluding(None).freeze()
    }

    /// Encode with a trailing MESSAGE-INTEGRITY-SHA256 keyed by `key`.
    ///
    /// The HMAC covers everything before the attribute, with the header
    /// length already counting it.
    pub fn encode_signed(&self, key: &IntegrityKey) -> Bytes {
        let mut buf = self.encode_excluding(Some(attr::MESSAGE_INTEGRITY_SHA256));
        let length = (buf.len() - HEADER_SIZE + 4 + INTEGRITY_SIZE) as u16;
        buf[2..4].copy_from_slice(&length.to_be_bytes());

        let mac = key.sign(&buf);
        buf.put_u16(attr::MESSAGE_INTEGRITY_SHA256);
        buf.put_u16(INTEGRITY_SIZE as u16);
        buf.put_slice(&mac);
        buf.freeze()
    }

    /// Check the MESSAGE-INTEGRITY-SHA256 attribute of an encoded message.
    pub fn verify_integrity(raw: &[u8], key: &IntegrityKey) -> bool {
        if raw.len() < HEADER_SIZE {
            return false;
        }
        let mut offset = HEADER_SIZE;
        while offset + 4 <= raw.len() {
            let attr_type = u16::from_be_bytes([raw[offset], raw[offset + 1]]);
            let len = u16::from_be_bytes([raw[offset + 2], raw[offset + 3]]) as usize;
            if attr_type == attr::MESSAGE_INTEGRITY_SHA256 {
                let Some(tag) = raw.get(offset + 4..offset + 4 + len) else {
                    return false;
                };
                let mut signed = raw[..offset].to_vec();
                let length = (offset - HEADER_SIZE + 4 + len) as u16;
                signed[2..4].copy_from_slice(&length.to_be_bytes());
                return key.verify(&signed, tag);
            }
            offset += 4 + padded(len);
        }
        false
    }

    /// Decode a message from bytes.
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_SIZE {
            return Err(Error::InvalidMessage("STUN message too short".into()));
        }

        let mut buf = data;
        let message_type = buf.get_u16();
        if message_type & 0xC000 != 0 {
            return Err(Error::InvalidMessage(
                "first two bits of a STUN message must be zero".into(),
            ));
        }
        let length = buf.get_u16() as usize;
        if buf.get_u32() != MAGIC_COOKIE {
            return Err(Error::InvalidMessage("magic cookie not found".into()));
        }
        if length != data.len() - HEADER_SIZE || length % 4 != 0 {
            return Err(Error::InvalidMessage(format!(
                "STUN length {} does not match {} body bytes",
                length,
                data.len() - HEADER_SIZE
            )));
        }

        let mut transaction_id = [0u8; TRANSACTION_ID_SIZE];
        buf.copy_to_slice(&mut transaction_id);

        // Only FINGERPRINT may follow the integrity attribute.
        let mut attributes = Vec::new();
        let mut after_integrity = false;
        while buf.has_remaining() {
            if buf.remaining() < 4 {
                return Err(Error::InvalidMessage("truncated attribute header".into()));
            }
            let attr_type = buf.get_u16();
            let len = buf.get_u16() as usize;
            if buf.remaining() < padded(len) {
                return Err(Error::InvalidMessage(format!(
                    "attribute 0x{:04x} overruns message",
                    attr_type
                )));
            }
            let value = Bytes::copy_from_slice(&buf[..len]);
            buf.advance(padded(len));
            if after_integrity && attr_type != attr::FINGERPRINT {
                continue;
            }
            after_integrity |= attr_type == attr::MESSAGE_INTEGRITY_SHA256;
            attributes.push(Attribute { attr_type, value });
        }

        let (method, class) = decode_type(message_type);
        Ok(Self {
            method,
            class,
            transaction_id,
            attributes,
        })
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?} {:?} {}",
            self.method,
            self.class,
            hex::encode(self.transaction_id)
        )
    }
}
