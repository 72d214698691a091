//! Wire protocol framing, TLV payloads and stream reassembly for imlink.
//!
//! This crate is the pure, I/O-free half of the client: it turns headers and
//! bodies into bytes and bytes back into packets. Sockets, timers and session
//! state live in `imlink-session`.
//!
//! ## Features
//!
//! - **Fixed Header**: 28-byte big-endian header with magic, version and CRC32
//! - **TLV Bodies**: tag/length/value entries with bounded nesting under
//!   reserved container tags
//! - **Streaming Parser**: tolerates arbitrary fragmentation, linear or ring
//!   buffered, with explicit backpressure
//! - **Pluggable Transforms**: encryption/compression keyed by header tags
//!   (AES-256-GCM behind the `crypto` feature)
//!
//! ## Wire Format
//!
//! ```text
//! +------------------------+-------------------------------------+
//! | magic (4)              | 0xDECAFBAD                          |
//! +------------------------+-------------------------------------+
//! | ver major/minor (1+1)  | major must match, minor negotiates  |
//! +------------------------+-------------------------------------+
//! | msg type (2)           | normal / heartbeat / ack / control  |
//! +------------------------+-------------------------------------+
//! | sequence (4)           | category (8) | counter (24)         |
//! +------------------------+-------------------------------------+
//! | timestamp (4)          | unix seconds                        |
//! +------------------------+-------------------------------------+
//! | encrypt/compress (1+1) | transform tags                      |
//! +------------------------+-------------------------------------+
//! | session id (2)         | short alias of the session UUID     |
//! +------------------------+-------------------------------------+
//! | body length (4)        | bytes that follow                   |
//! +------------------------+-------------------------------------+
//! | checksum (4)           | CRC32 of the raw body               |
//! +------------------------+-------------------------------------+
//! | body                   | TLV run or opaque bytes             |
//! +------------------------+-------------------------------------+
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod codec;
pub mod error;
pub mod header;
pub mod parser;
pub mod ring;
pub mod tlv;
pub mod transform;

// Re-export main types
pub use codec::{decode, decode_with, encode, FrameBuilder, MAX_BODY_SIZE};
pub use error::{RingError, TlvError, TransformError, WireError};
pub use header::{
    body_checksum, session_id_from_uuid, unix_timestamp, CompressType, EncryptType, MessageType,
    PacketHeader, ProtocolVersion, HEADER_SIZE, PACKET_MAGIC, VERSION_MAJOR, VERSION_MINOR,
};
pub use parser::{
    BufferStrategy, FrameParser, ParseState, ParsedPacket, ParserConfig,
    DEFAULT_REPLAY_WINDOW_SECS, MAX_LINEAR_BUFFER,
};
pub use ring::{RingBuffer, DEFAULT_RING_CAPACITY};
pub use tlv::{
    decode_tlv, encode_tlv, encode_tlv_map, is_container_tag, ContentType, Features, Handshake,
    TagPolicy, TlvBuilder, TlvMap, TlvValue, CONTAINER_TAG_START, CONTROL_TAG_FEATURES,
    CONTROL_TAG_VERSION, DEFAULT_MAX_DEPTH,
};
pub use transform::{Identity, PayloadTransform, TransformRegistry};

#[cfg(feature = "crypto")]
pub use transform::Aes256GcmTransform;
