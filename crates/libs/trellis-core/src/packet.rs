use core::fmt;

use crate::buffer::FrameBuffer;
use crate::error::TrellisError;
use crate::hash::{AddressHash, Hasher, ADDRESS_LENGTH};

/// Maximum transmission unit of a framed packet.
pub const PACKET_MTU: usize = 500;
/// Largest header: flags, hops, transport id, destination, context.
pub const HEADER_MAX_SIZE: usize = 2 + ADDRESS_LENGTH * 2 + 1;
pub const HEADER_MIN_SIZE: usize = 2 + ADDRESS_LENGTH + 1;
/// Payload ceiling regardless of header variant.
pub const PACKET_MDU: usize = PACKET_MTU - HEADER_MAX_SIZE;
/// Ceiling for an identity- or link-encrypted payload.
pub const ENCRYPTED_MDU: usize = 383;
/// Hop counts at or above this are never forwarded again.
pub const MAX_HOPS: u8 = 128;

pub const PACKET_IFAC_MAX_LENGTH: usize = 64;

#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum IfacFlag {
    Open = 0b0,
    Authenticated = 0b1,
}

impl From<u8> for IfacFlag {
    fn from(value: u8) -> Self {
        match value & 0b1 {
            0b1 => IfacFlag::Authenticated,
            _ => IfacFlag::Open,
        }
    }
}

#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum HeaderType {
    Direct = 0b0,
    Transported = 0b1,
}

impl From<u8> for HeaderType {
    fn from(value: u8) -> Self {
        match value & 0b1 {
            0b1 => HeaderType::Transported,
            _ => HeaderType::Direct,
        }
    }
}

#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum PropagationType {
    Broadcast = 0b0,
    Transport = 0b1,
}

impl From<u8> for PropagationType {
    fn from(value: u8) -> Self {
        match value & 0b1 {
            0b1 => PropagationType::Transport,
            _ => PropagationType::Broadcast,
        }
    }
}

#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum ContextFlag {
    Unset = 0b0,
    Set = 0b1,
}

impl From<u8> for ContextFlag {
    fn from(value: u8) -> Self {
        match value & 0b1 {
            0b1 => ContextFlag::Set,
            _ => ContextFlag::Unset,
        }
    }
}

#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum DestinationType {
    Single = 0b00,
    Group = 0b01,
    Plain = 0b10,
    Link = 0b11,
}

impl From<u8> for DestinationType {
    fn from(value: u8) -> Self {
        match value & 0b11 {
            0b01 => DestinationType::Group,
            0b10 => DestinationType::Plain,
            0b11 => DestinationType::Link,
            _ => DestinationType::Single,
        }
    }
}

#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum PacketType {
    Data = 0b00,
    Announce = 0b01,
    LinkRequest = 0b10,
    Proof = 0b11,
}

impl From<u8> for PacketType {
    fn from(value: u8) -> Self {
        match value & 0b11 {
            0b01 => PacketType::Announce,
            0b10 => PacketType::LinkRequest,
            0b11 => PacketType::Proof,
            _ => PacketType::Data,
        }
    }
}

#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum PacketContext {
    None = 0x00,
    Resource = 0x01,              // packet is one resource part
    ResourceAdvertisement = 0x02, // resource offer ahead of transfer
    ResourceAck = 0x03,           // receiver window acknowledgement
    ResourceProof = 0x05,         // completion proof from the receiver
    ResourceCancel = 0x06,        // either side aborts the transfer
    PathResponse = 0x0B,          // announce answering a path request
    KeepAlive = 0xFA,
    LinkIdentify = 0xFB,
    LinkClose = 0xFC,
    LinkProof = 0xFD,
    LinkRequestProof = 0xFF,
}

impl From<u8> for PacketContext {
    fn from(value: u8) -> Self {
        match value {
            0x01 => PacketContext::Resource,
            0x02 => PacketContext::ResourceAdvertisement,
            0x03 => PacketContext::ResourceAck,
            0x05 => PacketContext::ResourceProof,
            0x06 => PacketContext::ResourceCancel,
            0x0B => PacketContext::PathResponse,
            0xFA => PacketContext::KeepAlive,
            0xFB => PacketContext::LinkIdentify,
            0xFC => PacketContext::LinkClose,
            0xFD => PacketContext::LinkProof,
            0xFF => PacketContext::LinkRequestProof,
            _ => PacketContext::None,
        }
    }
}

#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub struct Header {
    pub ifac_flag: IfacFlag,
    pub header_type: HeaderType,
    pub context_flag: ContextFlag,
    pub propagation_type: PropagationType,
    pub destination_type: DestinationType,
    pub packet_type: PacketType,
    pub hops: u8,
}

impl Default for Header {
    fn default() -> Self {
        Self {
            ifac_flag: IfacFlag::Open,
            header_type: HeaderType::Direct,
            context_flag: ContextFlag::Unset,
            propagation_type: PropagationType::Broadcast,
            destination_type: DestinationType::Single,
            packet_type: PacketType::Data,
            hops: 0,
        }
    }
}

impl Header {
    pub fn to_meta(&self) -> u8 {
        (self.ifac_flag as u8) << 7
            | (self.header_type as u8) << 6
            | (self.context_flag as u8) << 5
            | (self.propagation_type as u8) << 4
            | (self.destination_type as u8) << 2
            | (self.packet_type as u8)
    }

    pub fn from_meta(meta: u8) -> Self {
        Self {
            ifac_flag: IfacFlag::from(meta >> 7),
            header_type: HeaderType::from(meta >> 6),
            context_flag: ContextFlag::from(meta >> 5),
            propagation_type: PropagationType::from(meta >> 4),
            destination_type: DestinationType::from(meta >> 2),
            packet_type: PacketType::from(meta),
            hops: 0,
        }
    }
}

impl fmt::Display for Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:b}{:b}{:b}{:b}{:0>2b}{:0>2b}.{}",
            self.ifac_flag as u8,
            self.header_type as u8,
            self.context_flag as u8,
            self.propagation_type as u8,
            self.destination_type as u8,
            self.packet_type as u8,
            self.hops,
        )
    }
}

pub type PacketDataBuffer = FrameBuffer<PACKET_MDU>;

/// Dedup key and proof subject: the truncated hash of the hashable region.
pub type PacketHash = AddressHash;

#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub struct PacketIfac {
    pub access_code: [u8; PACKET_IFAC_MAX_LENGTH],
    pub length: usize,
}

impl PacketIfac {
    pub fn new_from_slice(slice: &[u8]) -> Self {
        let mut access_code = [0u8; PACKET_IFAC_MAX_LENGTH];
        let length = slice.len().min(PACKET_IFAC_MAX_LENGTH);
        access_code[..length].copy_from_slice(&slice[..length]);
        Self { access_code, length }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.access_code[..self.length]
    }
}

#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub struct Packet {
    pub header: Header,
    pub ifac: Option<PacketIfac>,
    pub destination: AddressHash,
    pub transport: Option<AddressHash>,
    pub context: PacketContext,
    pub data: PacketDataBuffer,
}

impl Packet {
    /// Decodes a framed packet. Total on the input slice: malformed frames
    /// yield an error without partial state.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, TrellisError> {
        if bytes.len() < HEADER_MIN_SIZE {
            return Err(TrellisError::MalformedPacket);
        }

        if bytes.len() > PACKET_MTU {
            return Err(TrellisError::MalformedPacket);
        }

        let flags = bytes[0];
        let hops = bytes[1];

        let mut header = Header::from_meta(flags);
        header.hops = hops;

        let mut idx = 2;

        let transport = if header.header_type == HeaderType::Transported {
            if bytes.len() < HEADER_MAX_SIZE {
                return Err(TrellisError::MalformedPacket);
            }
            let transport = AddressHash::try_from_slice(&bytes[idx..idx + ADDRESS_LENGTH])
                .map_err(|_| TrellisError::MalformedPacket)?;
            idx += ADDRESS_LENGTH;
            Some(transport)
        } else {
            None
        };

        let destination = AddressHash::try_from_slice(&bytes[idx..idx + ADDRESS_LENGTH])
            .map_err(|_| TrellisError::MalformedPacket)?;
        idx += ADDRESS_LENGTH;

        let context = PacketContext::from(bytes[idx]);
        idx += 1;

        if bytes.len() - idx > PACKET_MDU {
            return Err(TrellisError::MalformedPacket);
        }

        let data = PacketDataBuffer::from_slice(&bytes[idx..]);

        Ok(Self { header, ifac: None, destination, transport, context, data })
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, TrellisError> {
        let mut out = Vec::with_capacity(HEADER_MAX_SIZE + self.data.len());

        out.push(self.header.to_meta());
        out.push(self.header.hops);

        if self.header.header_type == HeaderType::Transported {
            let transport = self.transport.ok_or(TrellisError::InvalidArgument)?;
            out.extend_from_slice(transport.as_slice());
        }

        out.extend_from_slice(self.destination.as_slice());
        out.push(self.context as u8);
        out.extend_from_slice(self.data.as_slice());

        if out.len() > PACKET_MTU {
            return Err(TrellisError::MalformedPacket);
        }

        Ok(out)
    }

    /// Hash over the hashable region: flags with the routing nibble zeroed,
    /// destination, context, payload. Hops byte and transport id are
    /// excluded so the hash survives forwarding.
    pub fn hash(&self) -> PacketHash {
        Hasher::new()
            .update(&[self.header.to_meta() & 0b0000_1111])
            .update(self.destination.as_slice())
            .update(&[self.context as u8])
            .update(self.data.as_slice())
            .finish_address()
    }
}

impl Default for Packet {
    fn default() -> Self {
        Self {
            header: Default::default(),
            ifac: None,
            destination: AddressHash::zero(),
            transport: None,
            context: PacketContext::None,
            data: Default::default(),
        }
    }
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}", self.header)?;

        if let Some(transport) = self.transport {
            write!(f, " {}", transport)?;
        }

        write!(f, " {}", self.destination)?;
        write!(f, " 0x[{}]]", self.data.len())?;

        Ok(())
    }
}
