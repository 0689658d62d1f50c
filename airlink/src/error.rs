use thiserror::Error;

use crate::packet::PacketType;

/// Per-packet decode and accessor failures. All of these are recovered
/// by dropping the offending datagram; none of them tears the link down.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("buffer of {len} bytes is smaller than the packet header")]
    TooSmall { len: usize },

    #[error("bad magic 0x{magic:08X}")]
    BadMagic { magic: u32 },

    #[error("declared payload of {declared} bytes exceeds {available} available")]
    LengthMismatch { declared: usize, available: usize },

    #[error("checksum mismatch, header 0x{expected:08X} computed 0x{computed:08X}")]
    BadChecksum { expected: u32, computed: u32 },

    #[error("requested {requested:?} payload from a 0x{actual:02X} packet")]
    WrongType { requested: PacketType, actual: u8 },

    #[error("{requested:?} payload must be {expected} bytes, got {actual}")]
    WrongPayloadSize {
        requested: PacketType,
        expected: usize,
        actual: usize,
    },
}
