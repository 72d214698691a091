//! Streaming frame parser.
//!
//! Bytes arrive in arbitrary chunks. The parser buffers them, waits for a
//! full header, validates it, then waits for the full body and emits one
//! `ParsedPacket` per frame. Any validation failure parks the parser in
//! `ParseState::Error` until `reset()`.

use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::codec::{open_body, MAX_BODY_SIZE};
use crate::header::{unix_timestamp, MessageType, PacketHeader, HEADER_SIZE};
use crate::ring::{RingBuffer, DEFAULT_RING_CAPACITY};
use crate::tlv::{decode_tlv, TagPolicy, TlvMap, DEFAULT_MAX_DEPTH};
use crate::transform::TransformRegistry;
use crate::{TlvError, WireError};

/// Largest linear buffer before `feed` stops accepting bytes (20 MiB)
pub const MAX_LINEAR_BUFFER: usize = 20 * 1024 * 1024;

/// Default replay window in seconds, used when one is enabled
pub const DEFAULT_REPLAY_WINDOW_SECS: u32 = 60;

/// Parser states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseState {
    /// Waiting for a full header
    ParsingHeader,
    /// Header accepted, waiting for the body
    ParsingBody,
    /// A frame failed validation; only `reset()` recovers
    Error,
}

/// Internal buffering strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BufferStrategy {
    /// Growable contiguous buffer bounded by `max_linear_buffer`
    #[default]
    Linear,
    /// Fixed ring of `ring_capacity` bytes
    Ring,
}

/// Parser configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ParserConfig {
    /// Buffering strategy
    pub strategy: BufferStrategy,
    /// Ring size for `BufferStrategy::Ring`
    pub ring_capacity: usize,
    /// Linear buffer bound for `BufferStrategy::Linear`
    pub max_linear_buffer: usize,
    /// Largest accepted body
    pub max_body_size: usize,
    /// Duplicate tag handling for TLV bodies
    pub tlv_policy: TagPolicy,
    /// TLV nesting bound
    pub max_tlv_depth: usize,
    /// Reject frames stamped outside `now ± window` seconds
    pub replay_window: Option<u32>,
}

impl Default for ParserConfig {
    fn default() -> Self {
        Self {
            strategy: BufferStrategy::Linear,
            ring_capacity: DEFAULT_RING_CAPACITY,
            max_linear_buffer: MAX_LINEAR_BUFFER,
            max_body_size: MAX_BODY_SIZE,
            tlv_policy: TagPolicy::RejectDuplicates,
            max_tlv_depth: DEFAULT_MAX_DEPTH,
            replay_window: None,
        }
    }
}

/// One decoded frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedPacket {
    /// Frame header
    pub header: PacketHeader,
    /// Raw body after transforms were undone
    pub payload: Bytes,
    /// TLV entries when the body is a complete TLV run
    pub tlv: Option<TlvMap>,
    /// Why a complete body was rejected as TLV; the payload is still delivered
    pub tlv_error: Option<TlvError>,
}

#[derive(Debug)]
enum Store {
    Linear { buf: BytesMut, limit: usize },
    Ring(RingBuffer),
}

impl Store {
    fn len(&self) -> usize {
        match self {
            Store::Linear { buf, .. } => buf.len(),
            Store::Ring(ring) => ring.len(),
        }
    }

    fn capacity(&self) -> usize {
        match self {
            Store::Linear { limit, .. } => *limit,
            Store::Ring(ring) => ring.capacity(),
        }
    }

    fn append(&mut self, data: &[u8]) -> usize {
        match self {
            Store::Linear { buf, limit } => {
                let n = data.len().min(limit.saturating_sub(buf.len()));
                buf.extend_from_slice(&data[..n]);
                n
            }
            Store::Ring(ring) => ring.write(data),
        }
    }

    fn peek(&self, len: usize) -> Option<Bytes> {
        match self {
            Store::Linear { buf, .. } => {
                (buf.len() >= len).then(|| Bytes::copy_from_slice(&buf[..len]))
            }
            Store::Ring(ring) => ring.peek(len).ok(),
        }
    }

    fn take(&mut self, len: usize) -> Option<Bytes> {
        match self {
            Store::Linear { buf, .. } => (buf.len() >= len).then(|| buf.split_to(len).freeze()),
            Store::Ring(ring) => ring.read(len).ok(),
        }
    }

    fn clear(&mut self) {
        match self {
            Store::Linear { buf, .. } => buf.clear(),
            Store::Ring(ring) => ring.reset(),
        }
    }
}

/// Incremental frame parser
#[derive(Debug)]
pub struct FrameParser {
    config: ParserConfig,
    registry: TransformRegistry,
    store: Store,
    state: ParseState,
    pending: Option<PacketHeader>,
    last_error: Option<WireError>,
}

impl FrameParser {
    /// Create a parser with plain transforms only
    pub fn new(config: ParserConfig) -> Self {
        Self::with_registry(config, TransformRegistry::new())
    }

    /// Create a parser that opens bodies through `registry`
    pub fn with_registry(config: ParserConfig, registry: TransformRegistry) -> Self {
        let store = match config.strategy {
            BufferStrategy::Linear => Store::Linear {
                buf: BytesMut::with_capacity(HEADER_SIZE * 4),
                limit: config.max_linear_buffer,
            },
            BufferStrategy::Ring => Store::Ring(RingBuffer::new(config.ring_capacity)),
        };
        Self {
            config,
            registry,
            store,
            state: ParseState::ParsingHeader,
            pending: None,
            last_error: None,
        }
    }

    /// Current state
    pub fn state(&self) -> ParseState {
        self.state
    }

    /// Error that moved the parser into `ParseState::Error`
    pub fn last_error(&self) -> Option<&WireError> {
        self.last_error.as_ref()
    }

    /// Bytes buffered and not yet consumed
    pub fn buffered(&self) -> usize {
        self.store.len()
    }

    /// Append bytes. Returns how many were accepted; a short count means the
    /// buffer is full and packets must be drained before feeding the rest.
    pub fn feed(&mut self, data: &[u8]) -> usize {
        if self.state == ParseState::Error {
            return 0;
        }
        self.store.append(data)
    }

    /// Whether a full frame is buffered
    pub fn has_complete_packet(&self) -> bool {
        match self.state {
            ParseState::Error => false,
            ParseState::ParsingBody => self
                .pending
                .map(|h| self.store.len() >= h.body_length as usize)
                .unwrap_or(false),
            ParseState::ParsingHeader => {
                let Some(mut raw) = self.store.peek(HEADER_SIZE) else {
                    return false;
                };
                match PacketHeader::decode(&mut raw) {
                    Ok(h) => self.store.len() >= HEADER_SIZE + h.body_length as usize,
                    Err(_) => false,
                }
            }
        }
    }

    /// Consume one frame, or `Ok(None)` if more bytes are needed
    pub fn next_packet(&mut self) -> Result<Option<ParsedPacket>, WireError> {
        self.next_packet_at(unix_timestamp())
    }

    /// As `next_packet`, with an explicit clock for the replay window
    pub fn next_packet_at(&mut self, now: u32) -> Result<Option<ParsedPacket>, WireError> {
        if self.state == ParseState::Error {
            return Err(self
                .last_error
                .clone()
                .unwrap_or(WireError::Incomplete));
        }

        if self.state == ParseState::ParsingHeader {
            let Some(mut raw) = self.store.peek(HEADER_SIZE) else {
                return Ok(None);
            };
            let header = match PacketHeader::decode(&mut raw) {
                Ok(h) => h,
                Err(e) => return Err(self.fail(e)),
            };
            if let Err(e) = self.validate(&header, now) {
                return Err(self.fail(e));
            }
            self.store.take(HEADER_SIZE);
            self.pending = Some(header);
            self.state = ParseState::ParsingBody;
        }

        let Some(header) = self.pending else {
            return Err(self.fail(WireError::Incomplete));
        };
        let Some(body) = self.store.take(header.body_length as usize) else {
            return Ok(None);
        };
        self.pending = None;
        self.state = ParseState::ParsingHeader;

        let payload = match open_body(&header, body, &self.registry) {
            Ok(p) => p,
            Err(e) => return Err(self.fail(e)),
        };

        // bodies that are not a clean TLV run go up as opaque bytes
        let (tlv, tlv_error) = match header.msg_type {
            MessageType::Normal | MessageType::Control if !payload.is_empty() => {
                match decode_tlv(&payload, self.config.tlv_policy, self.config.max_tlv_depth) {
                    Ok(map) => (Some(map), None),
                    Err(e) if e.is_incomplete() => (None, None),
                    Err(e) => {
                        debug!(seq = header.sequence, error = %e, "body rejected as tlv");
                        (None, Some(e))
                    }
                }
            }
            _ => (None, None),
        };

        debug!(
            seq = header.sequence,
            msg_type = ?header.msg_type,
            len = payload.len(),
            "parsed packet"
        );

        Ok(Some(ParsedPacket {
            header,
            payload,
            tlv,
            tlv_error,
        }))
    }

    /// Discard all buffered state and return to `ParsingHeader`
    pub fn reset(&mut self) {
        self.store.clear();
        self.pending = None;
        self.last_error = None;
        self.state = ParseState::ParsingHeader;
    }

    fn validate(&self, header: &PacketHeader, now: u32) -> Result<(), WireError> {
        let body_len = header.body_length as usize;
        if body_len > self.config.max_body_size {
            return Err(WireError::BodyTooLarge {
                size: body_len,
                max: self.config.max_body_size,
            });
        }
        if body_len > self.store.capacity() {
            return Err(WireError::BufferOverflow(body_len));
        }
        if let Some(window) = self.config.replay_window {
            header.check_timestamp(now, window)?;
        }
        Ok(())
    }

    fn fail(&mut self, err: WireError) -> WireError {
        debug!(error = %err, "frame rejected, parser halted");
        self.state = ParseState::Error;
        self.last_error = Some(err.clone());
        err
    }
}

impl Default for FrameParser {
    fn default() -> Self {
        Self::new(ParserConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{encode, FrameBuilder};
    use crate::tlv::{ContentType, TlvBuilder};
    use proptest::prelude::*;

    fn frame(seq: u32, body: &[u8]) -> Bytes {
        let mut header = PacketHeader::new(MessageType::Normal, seq, 1);
        header.timestamp = 1_000;
        encode(&header, body).unwrap()
    }

    fn drain(parser: &mut FrameParser) -> Vec<ParsedPacket> {
        let mut out = Vec::new();
        while let Some(p) = parser.next_packet_at(1_000).unwrap() {
            out.push(p);
        }
        out
    }

    fn feed_in_chunks(config: ParserConfig, stream: &[u8], chunk: usize) -> Vec<ParsedPacket> {
        let mut parser = FrameParser::new(config);
        let mut out = Vec::new();
        for piece in stream.chunks(chunk.max(1)) {
            let mut rest = piece;
            while !rest.is_empty() {
                let n = parser.feed(rest);
                rest = &rest[n..];
                out.extend(drain(&mut parser));
            }
        }
        out
    }

    #[test]
    fn test_single_frame() {
        let mut parser = FrameParser::default();
        let bytes = frame(1, b"hello");
        assert_eq!(parser.feed(&bytes), bytes.len());
        assert!(parser.has_complete_packet());

        let packet = parser.next_packet_at(1_000).unwrap().unwrap();
        assert_eq!(packet.header.sequence, 1);
        assert_eq!(&packet.payload[..], b"hello");
        assert!(packet.tlv.is_none());
        assert_eq!(parser.state(), ParseState::ParsingHeader);
        assert_eq!(parser.buffered(), 0);
    }

    #[test]
    fn test_partial_body_waits() {
        let mut parser = FrameParser::default();
        let bytes = frame(1, &[0xAB; 1000]);
        parser.feed(&bytes[..HEADER_SIZE + 500]);

        assert!(!parser.has_complete_packet());
        assert!(parser.next_packet_at(1_000).unwrap().is_none());
        assert_eq!(parser.state(), ParseState::ParsingBody);
        assert!(!parser.has_complete_packet());

        parser.feed(&bytes[HEADER_SIZE + 500..]);
        assert!(parser.has_complete_packet());
        assert_eq!(parser.next_packet_at(1_000).unwrap().unwrap().payload.len(), 1000);
    }

    #[test]
    fn test_bad_magic_halts_until_reset() {
        let mut parser = FrameParser::default();
        let mut bytes = BytesMut::from(&frame(1, b"x")[..]);
        bytes[0..4].copy_from_slice(&[0, 0, 0, 0]);
        parser.feed(&bytes);

        assert_eq!(
            parser.next_packet_at(1_000).unwrap_err(),
            WireError::MagicInvalid(0)
        );
        assert_eq!(parser.state(), ParseState::Error);
        assert_eq!(parser.feed(b"more"), 0);
        assert!(parser.next_packet_at(1_000).is_err());

        parser.reset();
        assert_eq!(parser.buffered(), 0);
        parser.feed(&frame(2, b"ok"));
        assert_eq!(parser.next_packet_at(1_000).unwrap().unwrap().header.sequence, 2);
    }

    #[test]
    fn test_body_too_large() {
        let config = ParserConfig {
            max_body_size: 16,
            ..Default::default()
        };
        let mut parser = FrameParser::new(config);
        parser.feed(&frame(1, &[0u8; 17]));
        assert!(matches!(
            parser.next_packet_at(1_000),
            Err(WireError::BodyTooLarge { size: 17, max: 16 })
        ));
    }

    #[test]
    fn test_replay_window() {
        let config = ParserConfig {
            replay_window: Some(DEFAULT_REPLAY_WINDOW_SECS),
            ..Default::default()
        };
        let mut parser = FrameParser::new(config);
        parser.feed(&frame(1, b"stale"));
        assert!(matches!(
            parser.next_packet_at(1_000 + 61),
            Err(WireError::TimestampOutOfWindow { .. })
        ));
    }

    #[test]
    fn test_tlv_body_is_decoded() {
        let body = TlvBuilder::new()
            .text(ContentType::Text, "hi there")
            .build()
            .unwrap();
        let bytes = FrameBuilder::new(MessageType::Normal, 4, 1)
            .timestamp(1_000)
            .body(body)
            .build(&TransformRegistry::new())
            .unwrap();

        let mut parser = FrameParser::default();
        parser.feed(&bytes);
        let packet = parser.next_packet_at(1_000).unwrap().unwrap();
        let tlv = packet.tlv.unwrap();
        assert_eq!(tlv[&ContentType::Text.tag()].as_str(), Some("hi there"));
    }

    #[test]
    fn test_duplicate_tag_fails_only_that_frame() {
        let mut body = BytesMut::new();
        crate::tlv::encode_tlv(0x1001, b"a", &mut body);
        crate::tlv::encode_tlv(0x1001, b"b", &mut body);

        let mut parser = FrameParser::default();
        parser.feed(&frame(1, &body));
        parser.feed(&frame(2, b"next"));
        let packet = parser.next_packet_at(1_000).unwrap().unwrap();
        assert!(packet.tlv.is_none());
        assert_eq!(packet.tlv_error, Some(TlvError::DuplicateTag(0x1001)));
        assert_eq!(packet.payload, body.freeze());
        assert_eq!(parser.state(), ParseState::ParsingHeader);
        assert_eq!(parser.next_packet_at(1_000).unwrap().unwrap().header.sequence, 2);
    }

    #[test]
    fn test_zero_filled_body_is_opaque() {
        let mut parser = FrameParser::default();
        parser.feed(&frame(1, &[0u8; 12]));
        let packet = parser.next_packet_at(1_000).unwrap().unwrap();
        assert_eq!(&packet.payload[..], &[0u8; 12]);
        assert!(packet.tlv.is_none());
        assert!(packet.tlv_error.is_some());
        assert_eq!(parser.state(), ParseState::ParsingHeader);
        assert!(!parser.has_complete_packet());
    }

    #[test]
    fn test_ring_backpressure() {
        let config = ParserConfig {
            strategy: BufferStrategy::Ring,
            ring_capacity: 64,
            ..Default::default()
        };
        let first = frame(1, &[1u8; 20]);
        let second = frame(2, &[2u8; 20]);
        let mut stream = first.to_vec();
        stream.extend_from_slice(&second);

        let mut parser = FrameParser::new(config.clone());
        let accepted = parser.feed(&stream);
        assert_eq!(accepted, 64);
        assert_eq!(drain(&mut parser).len(), 1);
        parser.feed(&stream[accepted..]);
        assert_eq!(drain(&mut parser)[0].header.sequence, 2);

        let mut parser = FrameParser::new(config);
        parser.feed(&frame(3, &[0u8; 80])[..HEADER_SIZE]);
        assert_eq!(
            parser.next_packet_at(1_000).unwrap_err(),
            WireError::BufferOverflow(80)
        );
    }

    fn stream_of(bodies: &[Vec<u8>]) -> Vec<u8> {
        let mut stream = Vec::new();
        for (i, body) in bodies.iter().enumerate() {
            stream.extend_from_slice(&frame(i as u32, body));
        }
        stream
    }

    fn bodies_strategy() -> impl Strategy<Value = Vec<Vec<u8>>> {
        proptest::collection::vec(proptest::collection::vec(any::<u8>(), 0..48), 1..8)
    }

    proptest! {
        #[test]
        fn prop_chunking_is_invisible(
            bodies in bodies_strategy(),
            chunk in 1usize..97,
        ) {
            let stream = stream_of(&bodies);
            let whole = feed_in_chunks(ParserConfig::default(), &stream, stream.len());
            let pieces = feed_in_chunks(ParserConfig::default(), &stream, chunk);
            prop_assert_eq!(&whole, &pieces);
            prop_assert_eq!(whole.len(), bodies.len());
        }

        #[test]
        fn prop_ring_matches_linear(
            bodies in bodies_strategy(),
            chunk in 1usize..97,
        ) {
            let stream = stream_of(&bodies);
            let ring = ParserConfig {
                strategy: BufferStrategy::Ring,
                ring_capacity: 128,
                ..Default::default()
            };
            let linear = feed_in_chunks(ParserConfig::default(), &stream, chunk);
            let ringed = feed_in_chunks(ring, &stream, chunk);
            prop_assert_eq!(linear, ringed);
        }
    }

    #[test]
    fn test_one_byte_at_a_time() {
        let stream = stream_of(&[b"alpha".to_vec(), Vec::new(), b"gamma".to_vec()]);
        let packets = feed_in_chunks(ParserConfig::default(), &stream, 1);
        let seqs: Vec<u32> = packets.iter().map(|p| p.header.sequence).collect();
        assert_eq!(seqs, vec![0, 1, 2]);
    }
}
