//! Tag-length-value payload encoding.
//!
//! A body is a run of `[tag:2][length:4][value:length]` entries. Values under
//! the reserved container range (`0xF000..=0xFFFF`) hold nested TLV runs;
//! every other value is opaque bytes.

use bitflags::bitflags;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::TlvError;
use crate::header::ProtocolVersion;

/// Tag (2B) + length (4B)
pub const TLV_ENTRY_OVERHEAD: usize = 6;

/// First tag of the reserved container range
pub const CONTAINER_TAG_START: u16 = 0xF000;

/// Default nesting bound (top level counts as depth 1)
pub const DEFAULT_MAX_DEPTH: usize = 4;

/// Control frame tag carrying `[major, minor]`
pub const CONTROL_TAG_VERSION: u16 = 0x0001;

/// Control frame tag carrying the `Features` bits as a u32
pub const CONTROL_TAG_FEATURES: u16 = 0x0002;

/// Whether values under `tag` may hold nested TLVs
pub fn is_container_tag(tag: u16) -> bool {
    tag >= CONTAINER_TAG_START
}

/// How repeated tags at one nesting level are handled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TagPolicy {
    /// Fail with `DuplicateTag`
    #[default]
    RejectDuplicates,
    /// Keep the first occurrence
    KeepFirst,
    /// Keep the last occurrence
    KeepLast,
}

/// Decoded TLV value
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TlvValue {
    /// Opaque bytes
    Bytes(Bytes),
    /// Nested entries under a container tag
    Nested(TlvMap),
}

impl TlvValue {
    /// Raw bytes, if this is a leaf
    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            TlvValue::Bytes(b) => Some(b),
            TlvValue::Nested(_) => None,
        }
    }

    /// UTF-8 view of a leaf
    pub fn as_str(&self) -> Option<&str> {
        self.as_bytes().and_then(|b| std::str::from_utf8(b).ok())
    }

    /// Big-endian u32 leaf
    pub fn as_u32(&self) -> Option<u32> {
        let b = self.as_bytes()?;
        let raw: [u8; 4] = b.as_ref().try_into().ok()?;
        Some(u32::from_be_bytes(raw))
    }

    /// Nested entries, if this is a container
    pub fn as_nested(&self) -> Option<&TlvMap> {
        match self {
            TlvValue::Nested(map) => Some(map),
            TlvValue::Bytes(_) => None,
        }
    }
}

/// Entries keyed by tag, ordered by tag
pub type TlvMap = BTreeMap<u16, TlvValue>;

/// Encode a single leaf entry
pub fn encode_tlv(tag: u16, value: &[u8], buf: &mut BytesMut) {
    buf.reserve(TLV_ENTRY_OVERHEAD + value.len());
    buf.put_u16(tag);
    buf.put_u32(value.len() as u32);
    buf.put_slice(value);
}

/// Encode a map, nesting containers. Nested values under a non-container tag
/// fail with `InvalidNestedTag`.
pub fn encode_tlv_map(map: &TlvMap, buf: &mut BytesMut) -> Result<(), TlvError> {
    for (&tag, value) in map {
        match value {
            TlvValue::Bytes(bytes) => encode_tlv(tag, bytes, buf),
            TlvValue::Nested(inner) => {
                if !is_container_tag(tag) {
                    return Err(TlvError::InvalidNestedTag(tag));
                }
                let mut nested = BytesMut::new();
                encode_tlv_map(inner, &mut nested)?;
                encode_tlv(tag, &nested, buf);
            }
        }
    }
    Ok(())
}

/// Decode a TLV run.
///
/// Incomplete variants of `TlvError` mean the input stopped mid-entry.
pub fn decode_tlv(bytes: &Bytes, policy: TagPolicy, max_depth: usize) -> Result<TlvMap, TlvError> {
    decode_level(bytes.clone(), policy, max_depth, 1)
}

fn decode_level(
    mut buf: Bytes,
    policy: TagPolicy,
    max_depth: usize,
    depth: usize,
) -> Result<TlvMap, TlvError> {
    if depth > max_depth {
        return Err(TlvError::NestedTooDeep(depth));
    }

    let mut map = TlvMap::new();
    while buf.has_remaining() {
        if buf.remaining() < 2 {
            return Err(TlvError::IncompleteTag);
        }
        let tag = buf.get_u16();

        if buf.remaining() < 4 {
            return Err(TlvError::IncompleteLength);
        }
        let len = buf.get_u32() as usize;

        if buf.remaining() < len {
            return Err(TlvError::IncompleteValue);
        }
        let raw = buf.split_to(len);

        let value = if is_container_tag(tag) {
            TlvValue::Nested(decode_level(raw, policy, max_depth, depth + 1)?)
        } else {
            TlvValue::Bytes(raw)
        };

        match policy {
            TagPolicy::RejectDuplicates => {
                if map.contains_key(&tag) {
                    return Err(TlvError::DuplicateTag(tag));
                }
                map.insert(tag, value);
            }
            TagPolicy::KeepFirst => {
                map.entry(tag).or_insert(value);
            }
            TagPolicy::KeepLast => {
                map.insert(tag, value);
            }
        }
    }
    Ok(map)
}

/// Application content tags
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ContentType {
    /// UTF-8 text
    Text = 0x1001,
    /// Image bytes or reference
    Image = 0x1002,
    /// Audio clip
    Audio = 0x1003,
    /// Video clip
    Video = 0x1004,
    /// Generic file
    File = 0x1005,
    /// Location payload
    Location = 0x1006,
    /// Application-defined
    Custom = 0x1007,
}

impl ContentType {
    /// Wire tag for this content type
    pub fn tag(self) -> u16 {
        self as u16
    }
}

impl TryFrom<u16> for ContentType {
    type Error = u16;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            0x1001 => Ok(ContentType::Text),
            0x1002 => Ok(ContentType::Image),
            0x1003 => Ok(ContentType::Audio),
            0x1004 => Ok(ContentType::Video),
            0x1005 => Ok(ContentType::File),
            0x1006 => Ok(ContentType::Location),
            0x1007 => Ok(ContentType::Custom),
            other => Err(other),
        }
    }
}

bitflags! {
    /// Capabilities exchanged during the version handshake
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct Features: u32 {
        /// Plain messaging
        const BASIC = 1 << 0;
        /// Encrypted bodies
        const ENCRYPTION = 1 << 1;
        /// Compressed bodies
        const COMPRESSION = 1 << 2;
        /// Read receipts
        const READ_RECEIPT = 1 << 3;
        /// Group conversations
        const GROUP_CHAT = 1 << 4;
    }
}

impl Default for Features {
    fn default() -> Self {
        Features::BASIC
    }
}

/// Version/feature handshake carried in a Control frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Handshake {
    /// Sender's protocol version
    pub version: ProtocolVersion,
    /// Sender's feature set
    pub features: Features,
}

impl Handshake {
    /// Encode as a Control frame body
    pub fn to_body(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(2 * TLV_ENTRY_OVERHEAD + 6);
        encode_tlv(
            CONTROL_TAG_VERSION,
            &[self.version.major, self.version.minor],
            &mut buf,
        );
        encode_tlv(
            CONTROL_TAG_FEATURES,
            &self.features.bits().to_be_bytes(),
            &mut buf,
        );
        buf.freeze()
    }

    /// Read a handshake out of decoded Control entries
    pub fn from_tlv(map: &TlvMap) -> Option<Self> {
        let version = map.get(&CONTROL_TAG_VERSION)?.as_bytes()?;
        if version.len() != 2 {
            return None;
        }
        let features = map
            .get(&CONTROL_TAG_FEATURES)
            .and_then(TlvValue::as_u32)
            .map(Features::from_bits_truncate)
            .unwrap_or_default();
        Some(Self {
            version: ProtocolVersion {
                major: version[0],
                minor: version[1],
            },
            features,
        })
    }
}

/// TLV body builder
#[derive(Debug, Clone, Default)]
pub struct TlvBuilder {
    map: TlvMap,
}

impl TlvBuilder {
    /// Create an empty builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert UTF-8 text under a content tag
    pub fn text(mut self, content: ContentType, value: &str) -> Self {
        self.map.insert(
            content.tag(),
            TlvValue::Bytes(Bytes::copy_from_slice(value.as_bytes())),
        );
        self
    }

    /// Insert raw bytes
    pub fn bytes(mut self, tag: u16, value: impl Into<Bytes>) -> Self {
        self.map.insert(tag, TlvValue::Bytes(value.into()));
        self
    }

    /// Insert a big-endian u32
    pub fn u32(mut self, tag: u16, value: u32) -> Self {
        self.map.insert(
            tag,
            TlvValue::Bytes(Bytes::copy_from_slice(&value.to_be_bytes())),
        );
        self
    }

    /// Insert a nested run; only valid under container tags, checked at build
    pub fn nested(mut self, tag: u16, inner: TlvBuilder) -> Self {
        self.map.insert(tag, TlvValue::Nested(inner.map));
        self
    }

    /// Encode the collected entries
    pub fn build(self) -> Result<Bytes, TlvError> {
        let mut buf = BytesMut::new();
        encode_tlv_map(&self.map, &mut buf)?;
        Ok(buf.freeze())
    }
}
