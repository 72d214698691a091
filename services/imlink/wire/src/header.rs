//! Fixed packet header for the wire protocol.
//!
//! Every frame starts with a 28-byte big-endian header:
//!
//! ```text
//! offset  size  field
//!  0      4     magic (0xDECAFBAD)
//!  4      1     version major
//!  5      1     version minor
//!  6      2     message type
//!  8      4     sequence (8-bit category | 24-bit counter)
//! 12      4     timestamp (unix seconds)
//! 16      1     encrypt type
//! 17      1     compress type
//! 18      2     session id (short alias)
//! 20      4     body length
//! 24      4     checksum (CRC32 over the raw body)
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::WireError;

/// Frame magic sentinel
pub const PACKET_MAGIC: u32 = 0xDECA_FBAD;

/// Packet header size in bytes
pub const HEADER_SIZE: usize = 28;

/// Major protocol version; a mismatch is fatal to the connection
pub const VERSION_MAJOR: u8 = 1;

/// Minor protocol version; a mismatch negotiates down
pub const VERSION_MINOR: u8 = 0;

/// Message types carried in the header
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    /// Application message
    Normal = 0,
    /// Heartbeat probe or its echo
    Heartbeat = 1,
    /// Delivery acknowledgement
    Ack = 2,
    /// Session control (handshake, negotiation)
    Control = 3,
}

impl TryFrom<u16> for MessageType {
    type Error = WireError;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(MessageType::Normal),
            1 => Ok(MessageType::Heartbeat),
            2 => Ok(MessageType::Ack),
            3 => Ok(MessageType::Control),
            _ => Err(WireError::MessageType(value)),
        }
    }
}

/// Body encryption applied on the wire
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum EncryptType {
    /// Plain body
    #[default]
    None = 0,
    /// Integrity-only marker; the body travels in the clear
    Crc32 = 1,
    /// AES-256 sealed body
    Aes256 = 2,
}

impl TryFrom<u8> for EncryptType {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(EncryptType::None),
            1 => Ok(EncryptType::Crc32),
            2 => Ok(EncryptType::Aes256),
            _ => Err(WireError::EncryptType(value)),
        }
    }
}

/// Body compression applied on the wire
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum CompressType {
    /// Uncompressed body
    #[default]
    None = 0,
    /// zlib deflate
    Zlib = 1,
}

impl TryFrom<u8> for CompressType {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(CompressType::None),
            1 => Ok(CompressType::Zlib),
            _ => Err(WireError::CompressType(value)),
        }
    }
}

/// Major/minor protocol version pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProtocolVersion {
    /// Major version
    pub major: u8,
    /// Minor version
    pub minor: u8,
}

impl ProtocolVersion {
    /// The version this build speaks
    pub const CURRENT: ProtocolVersion = ProtocolVersion {
        major: VERSION_MAJOR,
        minor: VERSION_MINOR,
    };

    /// Negotiate with a peer: majors must match, minors settle on the lower one
    pub fn negotiate(self, peer: ProtocolVersion) -> Result<ProtocolVersion, WireError> {
        if self.major != peer.major {
            return Err(WireError::VersionUnsupported {
                major: peer.major,
                minor: peer.minor,
            });
        }
        Ok(ProtocolVersion {
            major: self.major,
            minor: self.minor.min(peer.minor),
        })
    }
}

impl std::fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Packet header (28 bytes on the wire)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PacketHeader {
    /// Magic sentinel
    pub magic: u32,
    /// Protocol major version
    pub version_major: u8,
    /// Protocol minor version
    pub version_minor: u8,
    /// Message type
    pub msg_type: MessageType,
    /// Category-packed sequence number
    pub sequence: u32,
    /// Send time in unix seconds
    pub timestamp: u32,
    /// Body encryption
    pub encrypt: EncryptType,
    /// Body compression
    pub compress: CompressType,
    /// Short alias of the owning session
    pub session_id: u16,
    /// Bytes of body following the header
    pub body_length: u32,
    /// CRC32 of the raw body
    pub checksum: u32,
}

impl PacketHeader {
    /// Create a header for the current protocol version, stamped with the current time
    pub fn new(msg_type: MessageType, sequence: u32, session_id: u16) -> Self {
        Self {
            magic: PACKET_MAGIC,
            version_major: VERSION_MAJOR,
            version_minor: VERSION_MINOR,
            msg_type,
            sequence,
            timestamp: unix_timestamp(),
            encrypt: EncryptType::None,
            compress: CompressType::None,
            session_id,
            body_length: 0,
            checksum: 0,
        }
    }

    /// Version carried by this header
    pub fn version(&self) -> ProtocolVersion {
        ProtocolVersion {
            major: self.version_major,
            minor: self.version_minor,
        }
    }

    /// Encode the header to bytes (big-endian)
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32(self.magic);
        buf.put_u8(self.version_major);
        buf.put_u8(self.version_minor);
        buf.put_u16(self.msg_type as u16);
        buf.put_u32(self.sequence);
        buf.put_u32(self.timestamp);
        buf.put_u8(self.encrypt as u8);
        buf.put_u8(self.compress as u8);
        buf.put_u16(self.session_id);
        buf.put_u32(self.body_length);
        buf.put_u32(self.checksum);
    }

    /// Decode the header from bytes (big-endian).
    ///
    /// Magic is checked before anything else and the major version right
    /// after it, so a foreign or incompatible stream is rejected before any
    /// length field is trusted. Nothing is consumed from `buf` on error.
    pub fn decode(buf: &mut Bytes) -> Result<Self, WireError> {
        if buf.len() < HEADER_SIZE {
            return Err(WireError::Incomplete);
        }

        let mut cursor = buf.slice(..HEADER_SIZE);

        let magic = cursor.get_u32();
        if magic != PACKET_MAGIC {
            return Err(WireError::MagicInvalid(magic));
        }

        let version_major = cursor.get_u8();
        let version_minor = cursor.get_u8();
        if version_major != VERSION_MAJOR {
            return Err(WireError::VersionUnsupported {
                major: version_major,
                minor: version_minor,
            });
        }

        let msg_type = MessageType::try_from(cursor.get_u16())?;
        let sequence = cursor.get_u32();
        let timestamp = cursor.get_u32();
        let encrypt = EncryptType::try_from(cursor.get_u8())?;
        let compress = CompressType::try_from(cursor.get_u8())?;
        let session_id = cursor.get_u16();
        let body_length = cursor.get_u32();
        let checksum = cursor.get_u32();

        buf.advance(HEADER_SIZE);

        Ok(Self {
            magic,
            version_major,
            version_minor,
            msg_type,
            sequence,
            timestamp,
            encrypt,
            compress,
            session_id,
            body_length,
            checksum,
        })
    }

    /// Reject headers stamped outside `now ± window` seconds
    pub fn check_timestamp(&self, now: u32, window: u32) -> Result<(), WireError> {
        if self.timestamp.abs_diff(now) > window {
            return Err(WireError::TimestampOutOfWindow {
                timestamp: self.timestamp,
                now,
            });
        }
        Ok(())
    }
}

/// CRC32 checksum over a raw body
pub fn body_checksum(body: &[u8]) -> u32 {
    crc32fast::hash(body)
}

/// Fold a 128-bit session identifier into the 16-bit header alias
pub fn session_id_from_uuid(uuid: &[u8; 16]) -> u16 {
    uuid.chunks_exact(2)
        .fold(0u16, |acc, word| acc ^ u16::from_be_bytes([word[0], word[1]]))
}

/// Current wall clock in unix seconds
pub fn unix_timestamp() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}
