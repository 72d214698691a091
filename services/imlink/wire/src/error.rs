//! Wire protocol error types.

use thiserror::Error;

/// Wire protocol errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    /// Incomplete frame (need more data)
    #[error("incomplete frame")]
    Incomplete,

    /// Magic sentinel does not match
    #[error("magic invalid: {0:#010x}")]
    MagicInvalid(u32),

    /// Major protocol version differs from ours
    #[error("version unsupported: {major}.{minor}")]
    VersionUnsupported {
        /// Peer major version
        major: u8,
        /// Peer minor version
        minor: u8,
    },

    /// CRC32 over the body does not match the header
    #[error("checksum mismatch: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch {
        /// Checksum carried in the header
        expected: u32,
        /// Checksum computed over the body
        actual: u32,
    },

    /// Declared body length does not match the bytes supplied
    #[error("body length mismatch: declared {declared}, actual {actual}")]
    BodyLengthMismatch {
        /// Length carried in the header
        declared: usize,
        /// Bytes actually available
        actual: usize,
    },

    /// Declared body exceeds the configured maximum
    #[error("body too large: {size} > {max}")]
    BodyTooLarge {
        /// Declared body size
        size: usize,
        /// Configured limit
        max: usize,
    },

    /// Unknown message type
    #[error("unknown message type {0}")]
    MessageType(u16),

    /// Unknown encrypt type
    #[error("unknown encrypt type {0}")]
    EncryptType(u8),

    /// Unknown compress type
    #[error("unknown compress type {0}")]
    CompressType(u8),

    /// No transform registered for the encrypt type
    #[error("unsupported encryption {0:?}")]
    UnsupportedEncryption(crate::EncryptType),

    /// No transform registered for the compress type
    #[error("unsupported compression {0:?}")]
    UnsupportedCompression(crate::CompressType),

    /// Header timestamp outside the replay window
    #[error("timestamp {timestamp} outside replay window (now {now})")]
    TimestampOutOfWindow {
        /// Header timestamp in seconds
        timestamp: u32,
        /// Local clock in seconds
        now: u32,
    },

    /// Payload transform failed
    #[error("transform failed: {0}")]
    Transform(#[from] TransformError),

    /// Permanent TLV decode failure
    #[error("tlv: {0}")]
    Tlv(#[from] TlvError),

    /// Parser buffer cannot take more bytes
    #[error("buffer overflow: {0} bytes buffered")]
    BufferOverflow(usize),
}

impl WireError {
    /// Whether the error only means more input is required
    pub fn is_incomplete(&self) -> bool {
        match self {
            WireError::Incomplete => true,
            WireError::Tlv(tlv) => tlv.is_incomplete(),
            _ => false,
        }
    }

    /// Whether the connection must be torn down rather than just the frame
    pub fn is_fatal_to_connection(&self) -> bool {
        matches!(self, WireError::VersionUnsupported { .. })
    }
}

/// TLV decode errors
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlvError {
    /// Fewer than 2 bytes left for a tag
    #[error("incomplete tag")]
    IncompleteTag,

    /// Fewer than 4 bytes left for a length
    #[error("incomplete length")]
    IncompleteLength,

    /// Declared length exceeds the remaining bytes
    #[error("incomplete value")]
    IncompleteValue,

    /// Tag repeated at one nesting level under the reject policy
    #[error("duplicate tag {0:#06x}")]
    DuplicateTag(u16),

    /// Nesting exceeds the configured depth
    #[error("nested too deep: depth {0}")]
    NestedTooDeep(usize),

    /// Nesting attempted under a tag outside the reserved container range
    #[error("invalid nested tag {0:#06x}")]
    InvalidNestedTag(u16),
}

impl TlvError {
    /// Incomplete variants mean "wait for more input", not a failure
    pub fn is_incomplete(&self) -> bool {
        matches!(
            self,
            TlvError::IncompleteTag | TlvError::IncompleteLength | TlvError::IncompleteValue
        )
    }
}

/// Ring buffer errors
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RingError {
    /// Fewer bytes buffered than requested
    #[error("insufficient data: requested {requested}, available {available}")]
    InsufficientData {
        /// Bytes requested
        requested: usize,
        /// Bytes buffered
        available: usize,
    },
}

/// Payload transform errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransformError {
    /// Sealing the payload failed
    #[error("seal failed: {0}")]
    Seal(String),

    /// Opening the payload failed
    #[error("open failed: {0}")]
    Open(String),
}
