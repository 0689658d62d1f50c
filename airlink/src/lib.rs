//! Shared link layer for the aircraft and ground control units: wire
//! codec, liveness monitor, outbound queue and the plumbing both
//! binaries build their loops from.

use std::time::Duration;

pub mod error;
pub mod log;
pub mod monitor;
pub mod packet;
pub mod polling;
pub mod queue;
pub mod time;
pub mod types;

pub use error::ProtocolError;
pub use monitor::{LinkMonitor, LinkTransition};
pub use packet::{Packet, PacketType, HEADER_SIZE, PACKET_MAGIC, PROTOCOL_VERSION};
pub use queue::{Outbound, OutboundQueue};
pub use types::{
    AckData, BeaconData, ConfigData, ControlData, HeartbeatData, PeerId, SynAckData, SynData, TelemetryData,
};

/// Largest datagram either side will send or accept.
pub const MAX_DATAGRAM: usize = 1024;

/// Default UDP ports: the aircraft listens on 5760, the ground station
/// on 5761.
pub const DEFAULT_ACU_PORT: u16 = 5760;
pub const DEFAULT_GCU_PORT: u16 = 5761;

/// Default cadences and timeouts shared by both sides' configurations.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_millis(100);
pub const TELEMETRY_INTERVAL: Duration = Duration::from_millis(50);
pub const LINK_TIMEOUT: Duration = Duration::from_millis(500);
pub const DISCOVERY_INTERVAL: Duration = Duration::from_secs(1);
pub const CONNECTION_TIMEOUT: Duration = Duration::from_secs(5);
