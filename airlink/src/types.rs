//! Fixed-size wire payloads carried inside the packet envelope.
//!
//! Every payload has one exact byte size and a single little-endian
//! layout. `to_bytes` always produces `WIRE_SIZE` bytes; `from_bytes`
//! expects a slice of exactly `WIRE_SIZE` bytes, which the typed packet
//! accessors guarantee before calling in.

use std::fmt;
use std::net::Ipv4Addr;

/// Fixed-length peer identifier, 8 bytes, NUL padded.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerId([u8; 8]);

impl PeerId {
    pub const SIZE: usize = 8;

    pub fn new(raw: [u8; 8]) -> Self {
        Self(raw)
    }

    /// Builds an id from a string, truncating past 8 bytes and padding
    /// shorter ones with NULs.
    pub fn from_str(id: &str) -> Self {
        let mut raw = [0u8; 8];
        for (dst, src) in raw.iter_mut().zip(id.bytes()) {
            *dst = src;
        }
        Self(raw)
    }

    pub fn as_bytes(&self) -> &[u8; 8] {
        &self.0
    }

    fn read(buf: &[u8]) -> Self {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&buf[..8]);
        Self(raw)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let end = self.0.iter().position(|&b| b == 0).unwrap_or(8);
        write!(f, "{}", String::from_utf8_lossy(&self.0[..end]))
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", self)
    }
}

fn get_u16(buf: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([buf[at], buf[at + 1]])
}

fn get_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

fn get_u64(buf: &[u8], at: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&buf[at..at + 8]);
    u64::from_le_bytes(raw)
}

fn get_f32(buf: &[u8], at: usize) -> f32 {
    f32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

fn get_f64(buf: &[u8], at: usize) -> f64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&buf[at..at + 8]);
    f64::from_le_bytes(raw)
}

/// Operator command for one control frame. Axis values are raw actuator
/// units in 0..=4095 with 2048 as center; `thrust` is 0 at idle.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ControlData {
    pub ailerons: u16,
    pub elevator: u16,
    pub rudder: u16,
    pub thrust: u16,
    pub aux1: u16,
    pub aux2: u16,
    /// Sender clock, milliseconds since the Unix epoch, wrapping.
    pub timestamp: u32,
    pub armed: bool,
    pub emergency_stop: bool,
}

impl Default for ControlData {
    fn default() -> Self {
        Self {
            ailerons: 2048,
            elevator: 2048,
            rudder: 2048,
            thrust: 0,
            aux1: 2048,
            aux2: 2048,
            timestamp: 0,
            armed: false,
            emergency_stop: false,
        }
    }
}

impl ControlData {
    pub const WIRE_SIZE: usize = 18;

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::WIRE_SIZE);
        buf.extend_from_slice(&self.ailerons.to_le_bytes());
        buf.extend_from_slice(&self.elevator.to_le_bytes());
        buf.extend_from_slice(&self.rudder.to_le_bytes());
        buf.extend_from_slice(&self.thrust.to_le_bytes());
        buf.extend_from_slice(&self.aux1.to_le_bytes());
        buf.extend_from_slice(&self.aux2.to_le_bytes());
        buf.extend_from_slice(&self.timestamp.to_le_bytes());
        buf.push(self.armed as u8);
        buf.push(self.emergency_stop as u8);
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> Self {
        Self {
            ailerons: get_u16(buf, 0),
            elevator: get_u16(buf, 2),
            rudder: get_u16(buf, 4),
            thrust: get_u16(buf, 6),
            aux1: get_u16(buf, 8),
            aux2: get_u16(buf, 10),
            timestamp: get_u32(buf, 12),
            armed: buf[16] != 0,
            emergency_stop: buf[17] != 0,
        }
    }
}

/// Aircraft state snapshot sent down to the ground station.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct TelemetryData {
    /// Attitude in degrees.
    pub roll: f32,
    pub pitch: f32,
    pub yaw: f32,
    /// Position in decimal degrees and meters above ground.
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: f32,
    pub battery_voltage: f32,
    /// Actual actuator channel outputs, raw units.
    pub ailerons_actual: u16,
    pub elevator_actual: u16,
    pub rudder_actual: u16,
    pub thrust_actual: u16,
    pub timestamp: u32,
}

impl TelemetryData {
    pub const WIRE_SIZE: usize = 48;

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::WIRE_SIZE);
        buf.extend_from_slice(&self.roll.to_le_bytes());
        buf.extend_from_slice(&self.pitch.to_le_bytes());
        buf.extend_from_slice(&self.yaw.to_le_bytes());
        buf.extend_from_slice(&self.latitude.to_le_bytes());
        buf.extend_from_slice(&self.longitude.to_le_bytes());
        buf.extend_from_slice(&self.altitude.to_le_bytes());
        buf.extend_from_slice(&self.battery_voltage.to_le_bytes());
        buf.extend_from_slice(&self.ailerons_actual.to_le_bytes());
        buf.extend_from_slice(&self.elevator_actual.to_le_bytes());
        buf.extend_from_slice(&self.rudder_actual.to_le_bytes());
        buf.extend_from_slice(&self.thrust_actual.to_le_bytes());
        buf.extend_from_slice(&self.timestamp.to_le_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> Self {
        Self {
            roll: get_f32(buf, 0),
            pitch: get_f32(buf, 4),
            yaw: get_f32(buf, 8),
            latitude: get_f64(buf, 12),
            longitude: get_f64(buf, 20),
            altitude: get_f32(buf, 28),
            battery_voltage: get_f32(buf, 32),
            ailerons_actual: get_u16(buf, 36),
            elevator_actual: get_u16(buf, 38),
            rudder_actual: get_u16(buf, 40),
            thrust_actual: get_u16(buf, 42),
            timestamp: get_u32(buf, 44),
        }
    }
}

/// Periodic liveness beacon. Only `timestamp` and `uptime` are
/// populated by this implementation; the load fields stay zero.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HeartbeatData {
    pub timestamp: u32,
    pub cpu_load: u16,
    pub ram_usage: u16,
    /// Seconds since the sending process started.
    pub uptime: u32,
}

impl HeartbeatData {
    pub const WIRE_SIZE: usize = 12;

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::WIRE_SIZE);
        buf.extend_from_slice(&self.timestamp.to_le_bytes());
        buf.extend_from_slice(&self.cpu_load.to_le_bytes());
        buf.extend_from_slice(&self.ram_usage.to_le_bytes());
        buf.extend_from_slice(&self.uptime.to_le_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> Self {
        Self {
            timestamp: get_u32(buf, 0),
            cpu_load: get_u16(buf, 4),
            ram_usage: get_u16(buf, 6),
            uptime: get_u32(buf, 8),
        }
    }
}

/// In-flight tuning update. `pid_gains` holds kp/ki/kd triplets for
/// roll, pitch, yaw and altitude in that order.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ConfigData {
    pub pid_gains: [f32; 12],
    pub control_rates: [u16; 4],
    pub filters: [u16; 4],
    pub mode: u8,
    pub flags: u8,
}

impl Default for ConfigData {
    fn default() -> Self {
        Self {
            pid_gains: [0.0; 12],
            control_rates: [0; 4],
            filters: [0; 4],
            mode: 0,
            flags: 0,
        }
    }
}

impl ConfigData {
    pub const WIRE_SIZE: usize = 66;

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::WIRE_SIZE);
        for gain in &self.pid_gains {
            buf.extend_from_slice(&gain.to_le_bytes());
        }
        for rate in &self.control_rates {
            buf.extend_from_slice(&rate.to_le_bytes());
        }
        for filter in &self.filters {
            buf.extend_from_slice(&filter.to_le_bytes());
        }
        buf.push(self.mode);
        buf.push(self.flags);
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> Self {
        let mut data = Self::default();
        for (i, gain) in data.pid_gains.iter_mut().enumerate() {
            *gain = get_f32(buf, i * 4);
        }
        for (i, rate) in data.control_rates.iter_mut().enumerate() {
            *rate = get_u16(buf, 48 + i * 2);
        }
        for (i, filter) in data.filters.iter_mut().enumerate() {
            *filter = get_u16(buf, 56 + i * 2);
        }
        data.mode = buf[64];
        data.flags = buf[65];
        data
    }
}

/// Discovery announcement, broadcast by an unpaired aircraft.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BeaconData {
    pub id: PeerId,
    pub capabilities: u32,
    /// Firmware version of the announcing peer.
    pub version: u16,
}

impl BeaconData {
    pub const WIRE_SIZE: usize = 14;

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::WIRE_SIZE);
        buf.extend_from_slice(self.id.as_bytes());
        buf.extend_from_slice(&self.capabilities.to_le_bytes());
        buf.extend_from_slice(&self.version.to_le_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> Self {
        Self {
            id: PeerId::read(buf),
            capabilities: get_u32(buf, 8),
            version: get_u16(buf, 12),
        }
    }
}

/// Connection request following a beacon.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SynData {
    pub id: PeerId,
}

impl SynData {
    pub const WIRE_SIZE: usize = 8;

    pub fn to_bytes(&self) -> Vec<u8> {
        self.id.as_bytes().to_vec()
    }

    pub fn from_bytes(buf: &[u8]) -> Self {
        Self {
            id: PeerId::read(buf),
        }
    }
}

/// Coordinator answer carrying the assigned address and session token.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AckData {
    pub id: PeerId,
    pub token: u64,
    pub address: Ipv4Addr,
}

impl AckData {
    pub const WIRE_SIZE: usize = 20;

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::WIRE_SIZE);
        buf.extend_from_slice(self.id.as_bytes());
        buf.extend_from_slice(&self.token.to_le_bytes());
        buf.extend_from_slice(&self.address.octets());
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> Self {
        Self {
            id: PeerId::read(buf),
            token: get_u64(buf, 8),
            address: Ipv4Addr::new(buf[16], buf[17], buf[18], buf[19]),
        }
    }
}

/// Peer confirmation closing the handshake.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SynAckData {
    pub id: PeerId,
    pub token: u64,
}

impl SynAckData {
    pub const WIRE_SIZE: usize = 16;

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::WIRE_SIZE);
        buf.extend_from_slice(self.id.as_bytes());
        buf.extend_from_slice(&self.token.to_le_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> Self {
        Self {
            id: PeerId::read(buf),
            token: get_u64(buf, 8),
        }
    }
}
