// src/nat/stun/protocol.rs
//! STUN message codec (RFC 5389 / RFC 8489) with the ICE and TURN attributes
//!
//! Decoding never trusts declared lengths: every read is bounds-checked and
//! any inconsistency is reported as a [`StunError`].

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use crc::{Crc, CRC_32_ISO_HDLC};
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use sha1::Sha1;

use crate::nat::error::{NatResult, StunError};

/// STUN magic cookie (RFC 5389 Section 6)
pub const MAGIC_COOKIE: u32 = 0x2112A442;

/// STUN header size (20 bytes)
pub const HEADER_SIZE: usize = 20;

/// Maximum STUN message size we accept or produce
pub const MAX_MESSAGE_SIZE: usize = 65536;

/// XOR constant applied to the FINGERPRINT CRC
const FINGERPRINT_XOR: u32 = 0x5354554E;

/// HMAC-SHA1 output length
const INTEGRITY_LEN: usize = 20;

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// STUN message types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum MessageType {
    // Binding
    BindingRequest = 0x0001,
    BindingIndication = 0x0011,
    BindingResponse = 0x0101,
    BindingError = 0x0111,

    // Allocate (TURN)
    AllocateRequest = 0x0003,
    AllocateResponse = 0x0103,
    AllocateError = 0x0113,

    // Refresh (TURN)
    RefreshRequest = 0x0004,
    RefreshResponse = 0x0104,
    RefreshError = 0x0114,

    // Send / Data (TURN)
    SendIndication = 0x0016,
    DataIndication = 0x0017,

    // CreatePermission (TURN)
    CreatePermissionRequest = 0x0008,
    CreatePermissionResponse = 0x0108,
    CreatePermissionError = 0x0118,

    // ChannelBind (TURN)
    ChannelBindRequest = 0x0009,
    ChannelBindResponse = 0x0109,
    ChannelBindError = 0x0119,
}

impl MessageType {
    /// Message class (request, indication, response, error)
    pub fn class(&self) -> MessageClass {
        match (*self as u16) & 0x0110 {
            0x0000 => MessageClass::Request,
            0x0010 => MessageClass::Indication,
            0x0100 => MessageClass::SuccessResponse,
            _ => MessageClass::ErrorResponse,
        }
    }

    /// 12-bit method
    pub fn method(&self) -> u16 {
        let value = *self as u16;
        (value & 0x000F) | ((value & 0x00E0) >> 1) | ((value & 0x3E00) >> 2)
    }

    /// Create from method and class
    pub fn from_method_class(method: u16, class: MessageClass) -> Option<Self> {
        if method > 0x0FFF {
            return None;
        }

        let m0 = method & 0x000F;
        let m1 = (method & 0x0070) << 1;
        let m2 = (method & 0x0F80) << 2;

        let class_bits = match class {
            MessageClass::Request => 0x0000,
            MessageClass::Indication => 0x0010,
            MessageClass::SuccessResponse => 0x0100,
            MessageClass::ErrorResponse => 0x0110,
        };

        Self::from_u16(m0 | m1 | m2 | class_bits)
    }

    /// Map a raw header value to a known type
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            0x0001 => Some(Self::BindingRequest),
            0x0011 => Some(Self::BindingIndication),
            0x0101 => Some(Self::BindingResponse),
            0x0111 => Some(Self::BindingError),
            0x0003 => Some(Self::AllocateRequest),
            0x0103 => Some(Self::AllocateResponse),
            0x0113 => Some(Self::AllocateError),
            0x0004 => Some(Self::RefreshRequest),
            0x0104 => Some(Self::RefreshResponse),
            0x0114 => Some(Self::RefreshError),
            0x0016 => Some(Self::SendIndication),
            0x0017 => Some(Self::DataIndication),
            0x0008 => Some(Self::CreatePermissionRequest),
            0x0108 => Some(Self::CreatePermissionResponse),
            0x0118 => Some(Self::CreatePermissionError),
            0x0009 => Some(Self::ChannelBindRequest),
            0x0109 => Some(Self::ChannelBindResponse),
            0x0119 => Some(Self::ChannelBindError),
            _ => None,
        }
    }

    /// Success or error response
    pub fn is_response(&self) -> bool {
        matches!(self.class(), MessageClass::SuccessResponse | MessageClass::ErrorResponse)
    }
}

/// STUN message class
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageClass {
    Request,
    Indication,
    SuccessResponse,
    ErrorResponse,
}

/// STUN attribute types understood by this codec
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum AttributeType {
    // Comprehension-required (0x0000-0x7FFF)
    MappedAddress = 0x0001,
    Username = 0x0006,
    MessageIntegrity = 0x0008,
    ErrorCode = 0x0009,
    UnknownAttributes = 0x000A,
    ChannelNumber = 0x000C,
    Lifetime = 0x000D,
    XorPeerAddress = 0x0012,
    Data = 0x0013,
    Realm = 0x0014,
    Nonce = 0x0015,
    XorRelayedAddress = 0x0016,
    RequestedTransport = 0x0019,
    XorMappedAddress = 0x0020,
    Priority = 0x0024,
    UseCandidate = 0x0025,

    // Comprehension-optional (0x8000-0xFFFF)
    Software = 0x8022,
    Fingerprint = 0x8028,
    IceControlled = 0x8029,
    IceControlling = 0x802A,
}

impl AttributeType {
    /// Map a raw attribute type to a known one
    pub fn from_u16(value: u16) -> Option<Self> {
        Some(match value {
            0x0001 => Self::MappedAddress,
            0x0006 => Self::Username,
            0x0008 => Self::MessageIntegrity,
            0x0009 => Self::ErrorCode,
            0x000A => Self::UnknownAttributes,
            0x000C => Self::ChannelNumber,
            0x000D => Self::Lifetime,
            0x0012 => Self::XorPeerAddress,
            0x0013 => Self::Data,
            0x0014 => Self::Realm,
            0x0015 => Self::Nonce,
            0x0016 => Self::XorRelayedAddress,
            0x0019 => Self::RequestedTransport,
            0x0020 => Self::XorMappedAddress,
            0x0024 => Self::Priority,
            0x0025 => Self::UseCandidate,
            0x8022 => Self::Software,
            0x8028 => Self::Fingerprint,
            0x8029 => Self::IceControlled,
            0x802A => Self::IceControlling,
            _ => return None,
        })
    }

    /// Check if a raw attribute type is comprehension-required
    pub fn is_comprehension_required(raw: u16) -> bool {
        raw < 0x8000
    }
}

/// STUN transaction ID (96 bits)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransactionId([u8; 12]);

impl TransactionId {
    /// Generate a new transaction ID from the OS CSPRNG
    pub fn new() -> Self {
        let mut id = [0u8; 12];
        OsRng.fill_bytes(&mut id);
        Self(id)
    }

    /// Create from bytes
    pub fn from_bytes(bytes: [u8; 12]) -> Self {
        Self(bytes)
    }

    /// Get as bytes
    pub fn as_bytes(&self) -> &[u8; 12] {
        &self.0
    }
}

impl Default for TransactionId {
    fn default() -> Self {
        Self::new()
    }
}

/// A decoded STUN attribute
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Attribute {
    MappedAddress(SocketAddr),
    XorMappedAddress(SocketAddr),
    XorPeerAddress(SocketAddr),
    XorRelayedAddress(SocketAddr),
    Username(String),
    Realm(String),
    Nonce(Vec<u8>),
    Software(String),
    ErrorCode { code: u16, reason: String },
    UnknownAttributes(Vec<u16>),
    MessageIntegrity(Vec<u8>),
    Fingerprint(u32),
    Priority(u32),
    UseCandidate,
    IceControlled(u64),
    IceControlling(u64),
    ChannelNumber(u16),
    Lifetime(u32),
    Data(Vec<u8>),
    /// IANA protocol number, 17 for UDP
    RequestedTransport(u8),
}

impl Attribute {
    /// Wire type of this attribute
    pub fn attr_type(&self) -> AttributeType {
        match self {
            Self::MappedAddress(_) => AttributeType::MappedAddress,
            Self::XorMappedAddress(_) => AttributeType::XorMappedAddress,
            Self::XorPeerAddress(_) => AttributeType::XorPeerAddress,
            Self::XorRelayedAddress(_) => AttributeType::XorRelayedAddress,
            Self::Username(_) => AttributeType::Username,
            Self::Realm(_) => AttributeType::Realm,
            Self::Nonce(_) => AttributeType::Nonce,
            Self::Software(_) => AttributeType::Software,
            Self::ErrorCode { .. } => AttributeType::ErrorCode,
            Self::UnknownAttributes(_) => AttributeType::UnknownAttributes,
            Self::MessageIntegrity(_) => AttributeType::MessageIntegrity,
            Self::Fingerprint(_) => AttributeType::Fingerprint,
            Self::Priority(_) => AttributeType::Priority,
            Self::UseCandidate => AttributeType::UseCandidate,
            Self::IceControlled(_) => AttributeType::IceControlled,
            Self::IceControlling(_) => AttributeType::IceControlling,
            Self::ChannelNumber(_) => AttributeType::ChannelNumber,
            Self::Lifetime(_) => AttributeType::Lifetime,
            Self::Data(_) => AttributeType::Data,
            Self::RequestedTransport(_) => AttributeType::RequestedTransport,
        }
    }

    fn encode(&self, buf: &mut BytesMut, tid: &TransactionId) -> NatResult<()> {
        let start_pos = buf.len();
        buf.put_u16(self.attr_type() as u16);
        buf.put_u16(0); // Length placeholder

        match self {
            Self::MappedAddress(addr) => encode_address(buf, addr, false, tid),
            Self::XorMappedAddress(addr)
            | Self::XorPeerAddress(addr)
            | Self::XorRelayedAddress(addr) => encode_address(buf, addr, true, tid),
            Self::Username(s) | Self::Realm(s) | Self::Software(s) => buf.put_slice(s.as_bytes()),
            Self::Nonce(data) | Self::Data(data) | Self::MessageIntegrity(data) => buf.put_slice(data),
            Self::ErrorCode { code, reason } => {
                buf.put_u16(0); // Reserved
                buf.put_u8((code / 100) as u8);
                buf.put_u8((code % 100) as u8);
                buf.put_slice(reason.as_bytes());
            }
            Self::UnknownAttributes(types) => {
                for t in types {
                    buf.put_u16(*t);
                }
            }
            Self::Fingerprint(crc) => buf.put_u32(*crc),
            Self::Priority(p) => buf.put_u32(*p),
            Self::UseCandidate => {}
            Self::IceControlled(t) | Self::IceControlling(t) => buf.put_u64(*t),
            Self::ChannelNumber(n) => {
                buf.put_u16(*n);
                buf.put_u16(0); // RFFU
            }
            Self::Lifetime(secs) => buf.put_u32(*secs),
            Self::RequestedTransport(proto) => {
                buf.put_u8(*proto);
                buf.put_slice(&[0, 0, 0]);
            }
        }

        let value_len = buf.len() - start_pos - 4;
        if value_len > u16::MAX as usize {
            return Err(StunError::AttributeParseError {
                attr_type: self.attr_type() as u16,
                reason: format!("value too long ({} bytes)", value_len),
            }
            .into());
        }
        buf[start_pos + 2..start_pos + 4].copy_from_slice(&(value_len as u16).to_be_bytes());

        let padding = (4 - (value_len % 4)) % 4;
        buf.put_bytes(0, padding);
        Ok(())
    }

    fn decode(attr_type: AttributeType, value: &[u8], tid: &TransactionId) -> NatResult<Self> {
        let raw_type = attr_type as u16;
        let bad_len = |expected: usize| -> NatResult<Self> {
            Err(StunError::AttributeParseError {
                attr_type: raw_type,
                reason: format!("expected {} bytes, got {}", expected, value.len()),
            }
            .into())
        };
        let text = |value: &[u8]| -> NatResult<String> {
            String::from_utf8(value.to_vec()).map_err(|e| {
                StunError::AttributeParseError { attr_type: raw_type, reason: e.to_string() }.into()
            })
        };

        let mut cursor = value;
        Ok(match attr_type {
            AttributeType::MappedAddress => Self::MappedAddress(decode_address(value, false, tid)?),
            AttributeType::XorMappedAddress => Self::XorMappedAddress(decode_address(value, true, tid)?),
            AttributeType::XorPeerAddress => Self::XorPeerAddress(decode_address(value, true, tid)?),
            AttributeType::XorRelayedAddress => Self::XorRelayedAddress(decode_address(value, true, tid)?),
            AttributeType::Username => Self::Username(text(value)?),
            AttributeType::Realm => Self::Realm(text(value)?),
            AttributeType::Software => Self::Software(text(value)?),
            AttributeType::Nonce => Self::Nonce(value.to_vec()),
            AttributeType::Data => Self::Data(value.to_vec()),
            AttributeType::ErrorCode => {
                if value.len() < 4 {
                    return bad_len(4);
                }
                let class = (value[2] & 0x07) as u16;
                let number = value[3] as u16;
                let reason = String::from_utf8_lossy(&value[4..]).into_owned();
                Self::ErrorCode { code: class * 100 + number, reason }
            }
            AttributeType::UnknownAttributes => {
                let mut types = Vec::with_capacity(value.len() / 2);
                while cursor.remaining() >= 2 {
                    types.push(cursor.get_u16());
                }
                Self::UnknownAttributes(types)
            }
            AttributeType::MessageIntegrity => {
                if value.len() != INTEGRITY_LEN {
                    return bad_len(INTEGRITY_LEN);
                }
                Self::MessageIntegrity(value.to_vec())
            }
            AttributeType::Fingerprint | AttributeType::Priority | AttributeType::Lifetime => {
                if value.len() != 4 {
                    return bad_len(4);
                }
                let v = cursor.get_u32();
                match attr_type {
                    AttributeType::Fingerprint => Self::Fingerprint(v),
                    AttributeType::Priority => Self::Priority(v),
                    _ => Self::Lifetime(v),
                }
            }
            AttributeType::UseCandidate => {
                if !value.is_empty() {
                    return bad_len(0);
                }
                Self::UseCandidate
            }
            AttributeType::IceControlled | AttributeType::IceControlling => {
                if value.len() != 8 {
                    return bad_len(8);
                }
                let tie_breaker = cursor.get_u64();
                if attr_type == AttributeType::IceControlled {
                    Self::IceControlled(tie_breaker)
                } else {
                    Self::IceControlling(tie_breaker)
                }
            }
            AttributeType::ChannelNumber => {
                if value.len() != 4 {
                    return bad_len(4);
                }
                Self::ChannelNumber(cursor.get_u16())
            }
            AttributeType::RequestedTransport => {
                if value.len() != 4 {
                    return bad_len(4);
                }
                Self::RequestedTransport(value[0])
            }
        })
    }
}

/// STUN message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub message_type: MessageType,
    pub transaction_id: TransactionId,
    pub attributes: Vec<Attribute>,
    /// Comprehension-required attribute types we could not interpret
    pub unknown_attributes: Vec<u16>,
}

impl Message {
    /// Create new STUN message
    pub fn new(message_type: MessageType, transaction_id: TransactionId) -> Self {
        Self {
            message_type,
            transaction_id,
            attributes: Vec::new(),
            unknown_attributes: Vec::new(),
        }
    }

    /// Start a response of `class` to `request`, reusing its transaction id
    pub fn response_to(request: &Message, class: MessageClass) -> NatResult<Self> {
        let message_type = MessageType::from_method_class(request.message_type.method(), class)
            .ok_or(StunError::UnexpectedMessage(request.message_type as u16))?;
        Ok(Self::new(message_type, request.transaction_id))
    }

    /// Add attribute to message
    pub fn add_attribute(&mut self, attribute: Attribute) {
        self.attributes.push(attribute);
    }

    /// Builder-style `add_attribute`
    pub fn with_attribute(mut self, attribute: Attribute) -> Self {
        self.attributes.push(attribute);
        self
    }

    /// Get attribute by type
    pub fn get_attribute(&self, attr_type: AttributeType) -> Option<&Attribute> {
        self.attributes.iter().find(|a| a.attr_type() == attr_type)
    }

    /// Whether an attribute of this type is present
    pub fn has_attribute(&self, attr_type: AttributeType) -> bool {
        self.get_attribute(attr_type).is_some()
    }

    /// XOR-MAPPED-ADDRESS, falling back to MAPPED-ADDRESS
    pub fn mapped_address(&self) -> Option<SocketAddr> {
        self.attributes
            .iter()
            .find_map(|attr| match attr {
                Attribute::XorMappedAddress(addr) => Some(*addr),
                _ => None,
            })
            .or_else(|| {
                self.attributes.iter().find_map(|attr| match attr {
                    Attribute::MappedAddress(addr) => Some(*addr),
                    _ => None,
                })
            })
    }

    /// ERROR-CODE contents
    pub fn error_code(&self) -> Option<(u16, &str)> {
        self.attributes.iter().find_map(|attr| match attr {
            Attribute::ErrorCode { code, reason } => Some((*code, reason.as_str())),
            _ => None,
        })
    }

    /// USERNAME contents
    pub fn username(&self) -> Option<&str> {
        self.attributes.iter().find_map(|attr| match attr {
            Attribute::Username(name) => Some(name.as_str()),
            _ => None,
        })
    }

    /// Encode message to bytes, appending MESSAGE-INTEGRITY (HMAC-SHA1
    /// keyed with `integrity_key`) and FINGERPRINT when requested
    pub fn encode(&self, integrity_key: Option<&[u8]>, fingerprint: bool) -> NatResult<Bytes> {
        let mut buf = BytesMut::with_capacity(256);

        buf.put_u16(self.message_type as u16);
        buf.put_u16(0); // Message length (set later)
        buf.put_u32(MAGIC_COOKIE);
        buf.put_slice(self.transaction_id.as_bytes());

        for attr in &self.attributes {
            // Computed below
            if matches!(attr, Attribute::MessageIntegrity(_) | Attribute::Fingerprint(_)) {
                continue;
            }
            attr.encode(&mut buf, &self.transaction_id)?;
        }

        if let Some(key) = integrity_key {
            // Length covers the MESSAGE-INTEGRITY attribute itself
            let length = buf.len() - HEADER_SIZE + 4 + INTEGRITY_LEN;
            set_length(&mut buf, length)?;
            let mac = hmac_sha1(key, &buf)?;
            buf.put_u16(AttributeType::MessageIntegrity as u16);
            buf.put_u16(INTEGRITY_LEN as u16);
            buf.put_slice(&mac);
        }

        if fingerprint {
            let length = buf.len() - HEADER_SIZE + 8;
            set_length(&mut buf, length)?;
            let checksum = CRC32.checksum(&buf) ^ FINGERPRINT_XOR;
            buf.put_u16(AttributeType::Fingerprint as u16);
            buf.put_u16(4);
            buf.put_u32(checksum);
        }

        let length = buf.len() - HEADER_SIZE;
        set_length(&mut buf, length)?;
        Ok(buf.freeze())
    }

    /// Decode message from bytes
    pub fn decode(data: &[u8]) -> NatResult<Self> {
        if data.len() < HEADER_SIZE {
            return Err(StunError::ParseError(format!("Message too short ({} bytes)", data.len())).into());
        }
        if data.len() > MAX_MESSAGE_SIZE {
            return Err(StunError::ParseError(format!("Message too long ({} bytes)", data.len())).into());
        }

        let mut buf = data;
        let msg_type_raw = buf.get_u16();
        let msg_len = buf.get_u16() as usize;
        let magic = buf.get_u32();

        if msg_type_raw & 0xC000 != 0 {
            return Err(StunError::ParseError(format!("Not a STUN message type: 0x{:04X}", msg_type_raw)).into());
        }
        if magic != MAGIC_COOKIE {
            return Err(StunError::InvalidMagicCookie(magic).into());
        }

        let mut tid_bytes = [0u8; 12];
        buf.copy_to_slice(&mut tid_bytes);
        let transaction_id = TransactionId::from_bytes(tid_bytes);

        let message_type = MessageType::from_u16(msg_type_raw)
            .ok_or_else(|| StunError::ParseError(format!("Unknown message type: 0x{:04X}", msg_type_raw)))?;

        if buf.remaining() != msg_len {
            return Err(StunError::ParseError(format!(
                "Invalid message length: header says {}, got {}",
                msg_len,
                buf.remaining()
            ))
            .into());
        }
        if msg_len % 4 != 0 {
            return Err(StunError::ParseError(format!("Message length {} not 4-byte aligned", msg_len)).into());
        }

        let mut message = Self::new(message_type, transaction_id);
        let mut seen_integrity = false;

        while buf.has_remaining() {
            if buf.remaining() < 4 {
                return Err(StunError::ParseError("Incomplete attribute header".to_string()).into());
            }

            let attr_type_raw = buf.get_u16();
            let attr_len = buf.get_u16() as usize;
            let padded_len = attr_len + (4 - (attr_len % 4)) % 4;

            if buf.remaining() < padded_len {
                return Err(StunError::AttributeParseError {
                    attr_type: attr_type_raw,
                    reason: format!("declared {} bytes, {} remain", attr_len, buf.remaining()),
                }
                .into());
            }

            let (value, rest) = buf.split_at(attr_len);
            buf = &rest[padded_len - attr_len..];

            // Only FINGERPRINT may follow MESSAGE-INTEGRITY
            if seen_integrity && attr_type_raw != AttributeType::Fingerprint as u16 {
                continue;
            }

            match AttributeType::from_u16(attr_type_raw) {
                Some(attr_type) => {
                    if attr_type == AttributeType::MessageIntegrity {
                        seen_integrity = true;
                    }
                    message.attributes.push(Attribute::decode(attr_type, value, &transaction_id)?);
                }
                None if AttributeType::is_comprehension_required(attr_type_raw) => {
                    message.unknown_attributes.push(attr_type_raw);
                }
                None => {}
            }
        }

        Ok(message)
    }

    /// Verify MESSAGE-INTEGRITY against the raw bytes this message was decoded from
    pub fn verify_integrity(&self, key: &[u8], raw_msg: &[u8]) -> NatResult<()> {
        let pos = find_attribute_position(raw_msg, AttributeType::MessageIntegrity)
            .ok_or(StunError::MissingAttribute("MESSAGE-INTEGRITY"))?;

        let end = pos + 4 + INTEGRITY_LEN;
        if raw_msg.len() < end {
            return Err(StunError::IntegrityCheckFailed.into());
        }

        // Length field as it was when the sender computed the HMAC
        let mut covered = raw_msg[..pos].to_vec();
        covered[2..4].copy_from_slice(&((end - HEADER_SIZE) as u16).to_be_bytes());

        let mut mac = Hmac::<Sha1>::new_from_slice(key)
            .map_err(|e| StunError::ParseError(format!("Invalid key: {}", e)))?;
        mac.update(&covered);
        mac.verify_slice(&raw_msg[pos + 4..end])
            .map_err(|_| StunError::IntegrityCheckFailed.into())
    }

    /// Verify FINGERPRINT against the raw bytes this message was decoded from
    pub fn verify_fingerprint(&self, raw_msg: &[u8]) -> NatResult<()> {
        let expected = self
            .attributes
            .iter()
            .find_map(|attr| match attr {
                Attribute::Fingerprint(crc) => Some(*crc),
                _ => None,
            })
            .ok_or(StunError::MissingAttribute("FINGERPRINT"))?;

        let pos = find_attribute_position(raw_msg, AttributeType::Fingerprint)
            .ok_or(StunError::MissingAttribute("FINGERPRINT"))?;

        if CRC32.checksum(&raw_msg[..pos]) ^ FINGERPRINT_XOR == expected {
            Ok(())
        } else {
            Err(StunError::FingerprintCheckFailed.into())
        }
    }
}

/// Whether a datagram is STUN: top two bits clear and the magic cookie in place
pub fn is_stun(data: &[u8]) -> bool {
    data.len() >= HEADER_SIZE
        && data[0] & 0xC0 == 0
        && data[4..8] == MAGIC_COOKIE.to_be_bytes()
}

/// Whether a datagram is TURN ChannelData (first two bits `01`)
pub fn is_channel_data(data: &[u8]) -> bool {
    data.len() >= 4 && data[0] & 0xC0 == 0x40
}

/// Frame `payload` as ChannelData (RFC 5766 Section 11.4), padded to 4 bytes
pub fn encode_channel_data(channel: u16, payload: &[u8]) -> NatResult<Bytes> {
    if payload.len() > u16::MAX as usize {
        return Err(StunError::ParseError(format!("ChannelData payload too long ({} bytes)", payload.len())).into());
    }
    let padding = (4 - (payload.len() % 4)) % 4;
    let mut buf = BytesMut::with_capacity(4 + payload.len() + padding);
    buf.put_u16(channel);
    buf.put_u16(payload.len() as u16);
    buf.put_slice(payload);
    buf.put_bytes(0, padding);
    Ok(buf.freeze())
}

/// Split a ChannelData frame into channel number and payload
pub fn decode_channel_data(data: &[u8]) -> NatResult<(u16, &[u8])> {
    if !is_channel_data(data) {
        return Err(StunError::ParseError("Not a ChannelData frame".to_string()).into());
    }
    let channel = u16::from_be_bytes([data[0], data[1]]);
    let len = u16::from_be_bytes([data[2], data[3]]) as usize;
    if data.len() - 4 < len {
        return Err(StunError::ParseError(format!(
            "ChannelData declares {} bytes, {} present",
            len,
            data.len() - 4
        ))
        .into());
    }
    Ok((channel, &data[4..4 + len]))
}

fn set_length(buf: &mut BytesMut, len: usize) -> NatResult<()> {
    if len > u16::MAX as usize {
        return Err(StunError::ParseError(format!("Message too long ({} bytes)", len)).into());
    }
    buf[2..4].copy_from_slice(&(len as u16).to_be_bytes());
    Ok(())
}

fn hmac_sha1(key: &[u8], data: &[u8]) -> NatResult<[u8; INTEGRITY_LEN]> {
    let mut mac = Hmac::<Sha1>::new_from_slice(key)
        .map_err(|e| StunError::ParseError(format!("Invalid key: {}", e)))?;
    mac.update(data);
    let mut out = [0u8; INTEGRITY_LEN];
    out.copy_from_slice(&mac.finalize().into_bytes());
    Ok(out)
}

/// Offset of the first attribute of `attr_type` in a raw message
fn find_attribute_position(raw_msg: &[u8], attr_type: AttributeType) -> Option<usize> {
    let mut pos = HEADER_SIZE;

    while pos + 4 <= raw_msg.len() {
        let attr = u16::from_be_bytes([raw_msg[pos], raw_msg[pos + 1]]);
        let len = u16::from_be_bytes([raw_msg[pos + 2], raw_msg[pos + 3]]) as usize;

        if attr == attr_type as u16 {
            return Some(pos);
        }

        pos += 4 + len + (4 - (len % 4)) % 4;
    }

    None
}

fn encode_address(buf: &mut BytesMut, addr: &SocketAddr, xor: bool, tid: &TransactionId) {
    let port = if xor { addr.port() ^ (MAGIC_COOKIE >> 16) as u16 } else { addr.port() };

    buf.put_u8(0); // Reserved
    match addr.ip() {
        IpAddr::V4(ip) => {
            buf.put_u8(0x01);
            buf.put_u16(port);
            let mut octets = ip.octets();
            if xor {
                xor_in_place(&mut octets, tid);
            }
            buf.put_slice(&octets);
        }
        IpAddr::V6(ip) => {
            buf.put_u8(0x02);
            buf.put_u16(port);
            let mut octets = ip.octets();
            if xor {
                xor_in_place(&mut octets, tid);
            }
            buf.put_slice(&octets);
        }
    }
}

fn decode_address(value: &[u8], xor: bool, tid: &TransactionId) -> NatResult<SocketAddr> {
    if value.len() < 4 {
        return Err(StunError::ParseError("Address too short".to_string()).into());
    }

    let family = value[1];
    let port_raw = u16::from_be_bytes([value[2], value[3]]);
    let port = if xor { port_raw ^ (MAGIC_COOKIE >> 16) as u16 } else { port_raw };
    let body = &value[4..];

    let ip = match (family, body.len()) {
        (0x01, 4) => {
            let mut octets = [0u8; 4];
            octets.copy_from_slice(body);
            if xor {
                xor_in_place(&mut octets, tid);
            }
            IpAddr::V4(Ipv4Addr::from(octets))
        }
        (0x02, 16) => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(body);
            if xor {
                xor_in_place(&mut octets, tid);
            }
            IpAddr::V6(Ipv6Addr::from(octets))
        }
        (0x01, _) | (0x02, _) => {
            return Err(StunError::ParseError(format!(
                "Address body of {} bytes for family {}",
                body.len(),
                family
            ))
            .into())
        }
        _ => return Err(StunError::InvalidAddressFamily(family).into()),
    };

    Ok(SocketAddr::new(ip, port))
}

/// XOR with the magic cookie followed by the transaction id
fn xor_in_place(octets: &mut [u8], tid: &TransactionId) {
    let magic = MAGIC_COOKIE.to_be_bytes();
    let tid = tid.as_bytes();
    for (i, byte) in octets.iter_mut().enumerate() {
        *byte ^= if i < 4 { magic[i] } else { tid[i - 4] };
    }
}
