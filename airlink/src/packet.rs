//! Binary packet envelope shared by both ends of the link.
//!
//! Every datagram is one packet: a 16-byte header followed by a
//! fixed-size payload. All integers are little-endian.
//!
//! ```text
//! offset  size  field
//!      0     4  magic 0x44524F4E ("DRON")
//!      4     1  protocol version (1)
//!      5     1  type tag
//!      6     2  payload length
//!      8     4  timestamp, ms since Unix epoch (wrapping u32)
//!     12     4  CRC-32 of the payload
//! ```
//!
//! The CRC is the standard reflected polynomial with all-ones init and
//! final complement, computed over the payload only. Header fields
//! outside the length and checksum are therefore not corruption
//! protected; the magic and length checks catch the cases that matter
//! for framing.

use std::time::Duration;

use crate::error::ProtocolError;
use crate::time::unix_millis;
use crate::types::{
    AckData, BeaconData, ConfigData, ControlData, HeartbeatData, SynAckData, SynData, TelemetryData,
};

pub const PACKET_MAGIC: u32 = 0x44524F4E;
pub const PROTOCOL_VERSION: u8 = 1;
pub const HEADER_SIZE: usize = 16;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    Control = 0x01,
    Telemetry = 0x02,
    Heartbeat = 0x03,
    Config = 0x04,
    Beacon = 0x05,
    Syn = 0x06,
    Ack = 0x07,
    SynAck = 0x08,
}

impl PacketType {
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0x01 => Some(Self::Control),
            0x02 => Some(Self::Telemetry),
            0x03 => Some(Self::Heartbeat),
            0x04 => Some(Self::Config),
            0x05 => Some(Self::Beacon),
            0x06 => Some(Self::Syn),
            0x07 => Some(Self::Ack),
            0x08 => Some(Self::SynAck),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Header {
    magic: u32,
    version: u8,
    tag: u8,
    length: u16,
    timestamp: u32,
    checksum: u32,
}

/// One decoded or to-be-sent packet. Immutable once built.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Packet {
    header: Header,
    payload: Vec<u8>,
}

impl Packet {
    fn assemble(kind: PacketType, payload: Vec<u8>) -> Self {
        let header = Header {
            magic: PACKET_MAGIC,
            version: PROTOCOL_VERSION,
            tag: kind as u8,
            length: payload.len() as u16,
            timestamp: unix_millis(),
            checksum: crc32fast::hash(&payload),
        };
        Self {
            header,
            payload,
        }
    }

    pub fn control(data: &ControlData) -> Self {
        Self::assemble(PacketType::Control, data.to_bytes())
    }

    pub fn telemetry(data: &TelemetryData) -> Self {
        Self::assemble(PacketType::Telemetry, data.to_bytes())
    }

    pub fn heartbeat(data: &HeartbeatData) -> Self {
        Self::assemble(PacketType::Heartbeat, data.to_bytes())
    }

    pub fn config(data: &ConfigData) -> Self {
        Self::assemble(PacketType::Config, data.to_bytes())
    }

    pub fn beacon(data: &BeaconData) -> Self {
        Self::assemble(PacketType::Beacon, data.to_bytes())
    }

    pub fn syn(data: &SynData) -> Self {
        Self::assemble(PacketType::Syn, data.to_bytes())
    }

    pub fn ack(data: &AckData) -> Self {
        Self::assemble(PacketType::Ack, data.to_bytes())
    }

    pub fn syn_ack(data: &SynAckData) -> Self {
        Self::assemble(PacketType::SynAck, data.to_bytes())
    }

    /// Validates framing and integrity. Unknown type tags pass; they
    /// surface as `None` from [`packet_type`](Self::packet_type) and are
    /// dropped by the receive loops.
    pub fn decode(buf: &[u8]) -> Result<Self, ProtocolError> {
        if buf.len() < HEADER_SIZE {
            return Err(ProtocolError::TooSmall {
                len: buf.len(),
            });
        }
        let magic = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
        if magic != PACKET_MAGIC {
            return Err(ProtocolError::BadMagic {
                magic,
            });
        }
        let length = u16::from_le_bytes([buf[6], buf[7]]);
        let available = buf.len() - HEADER_SIZE;
        if usize::from(length) > available {
            return Err(ProtocolError::LengthMismatch {
                declared: usize::from(length),
                available,
            });
        }
        let checksum = u32::from_le_bytes([buf[12], buf[13], buf[14], buf[15]]);
        let payload = buf[HEADER_SIZE..HEADER_SIZE + usize::from(length)].to_vec();
        let computed = crc32fast::hash(&payload);
        if computed != checksum {
            return Err(ProtocolError::BadChecksum {
                expected: checksum,
                computed,
            });
        }
        Ok(Self {
            header: Header {
                magic,
                version: buf[4],
                tag: buf[5],
                length,
                timestamp: u32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]),
                checksum,
            },
            payload,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_SIZE + self.payload.len());
        buf.extend_from_slice(&self.header.magic.to_le_bytes());
        buf.push(self.header.version);
        buf.push(self.header.tag);
        buf.extend_from_slice(&self.header.length.to_le_bytes());
        buf.extend_from_slice(&self.header.timestamp.to_le_bytes());
        buf.extend_from_slice(&self.header.checksum.to_le_bytes());
        buf.extend_from_slice(&self.payload);
        buf
    }

    pub fn packet_type(&self) -> Option<PacketType> {
        PacketType::from_tag(self.header.tag)
    }

    pub fn type_tag(&self) -> u8 {
        self.header.tag
    }

    pub fn version(&self) -> u8 {
        self.header.version
    }

    pub fn timestamp(&self) -> u32 {
        self.header.timestamp
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// True when the header timestamp is older than `max_age`.
    /// Timestamps ahead of the local clock wrap to huge ages; the upper
    /// half of the range is treated as skew, never as age.
    pub fn is_stale(&self, max_age: Duration) -> bool {
        let age = unix_millis().wrapping_sub(self.header.timestamp);
        if age > u32::MAX / 2 {
            return false;
        }
        u64::from(age) > max_age.as_millis() as u64
    }

    fn expect(&self, requested: PacketType, size: usize) -> Result<&[u8], ProtocolError> {
        if self.header.tag != requested as u8 {
            return Err(ProtocolError::WrongType {
                requested,
                actual: self.header.tag,
            });
        }
        if self.payload.len() != size {
            return Err(ProtocolError::WrongPayloadSize {
                requested,
                expected: size,
                actual: self.payload.len(),
            });
        }
        Ok(&self.payload)
    }

    pub fn control_data(&self) -> Result<ControlData, ProtocolError> {
        self.expect(PacketType::Control, ControlData::WIRE_SIZE).map(ControlData::from_bytes)
    }

    pub fn telemetry_data(&self) -> Result<TelemetryData, ProtocolError> {
        self.expect(PacketType::Telemetry, TelemetryData::WIRE_SIZE).map(TelemetryData::from_bytes)
    }

    pub fn heartbeat_data(&self) -> Result<HeartbeatData, ProtocolError> {
        self.expect(PacketType::Heartbeat, HeartbeatData::WIRE_SIZE).map(HeartbeatData::from_bytes)
    }

    pub fn config_data(&self) -> Result<ConfigData, ProtocolError> {
        self.expect(PacketType::Config, ConfigData::WIRE_SIZE).map(ConfigData::from_bytes)
    }

    pub fn beacon_data(&self) -> Result<BeaconData, ProtocolError> {
        self.expect(PacketType::Beacon, BeaconData::WIRE_SIZE).map(BeaconData::from_bytes)
    }

    pub fn syn_data(&self) -> Result<SynData, ProtocolError> {
        self.expect(PacketType::Syn, SynData::WIRE_SIZE).map(SynData::from_bytes)
    }

    pub fn ack_data(&self) -> Result<AckData, ProtocolError> {
        self.expect(PacketType::Ack, AckData::WIRE_SIZE).map(AckData::from_bytes)
    }

    pub fn syn_ack_data(&self) -> Result<SynAckData, ProtocolError> {
        self.expect(PacketType::SynAck, SynAckData::WIRE_SIZE).map(SynAckData::from_bytes)
    }
}
