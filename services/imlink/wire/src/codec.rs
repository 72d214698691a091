//! Whole-frame encoding and decoding.
//!
//! `encode`/`decode` work on plain bodies. `FrameBuilder` and `decode_with`
//! route the body through a `TransformRegistry` for encrypted or compressed
//! frames.

use bytes::{BufMut, Bytes, BytesMut};

use crate::header::{
    body_checksum, CompressType, EncryptType, MessageType, PacketHeader, HEADER_SIZE,
};
use crate::transform::TransformRegistry;
use crate::WireError;

/// Largest body accepted on either side (10 MiB)
pub const MAX_BODY_SIZE: usize = 10 * 1024 * 1024;

/// Encode a frame; `body_length` and `checksum` are filled in from `body`
pub fn encode(header: &PacketHeader, body: &[u8]) -> Result<Bytes, WireError> {
    if body.len() > MAX_BODY_SIZE {
        return Err(WireError::BodyTooLarge {
            size: body.len(),
            max: MAX_BODY_SIZE,
        });
    }
    let mut header = *header;
    header.body_length = body.len() as u32;
    header.checksum = body_checksum(body);

    let mut buf = BytesMut::with_capacity(HEADER_SIZE + body.len());
    header.encode(&mut buf);
    buf.put_slice(body);
    Ok(buf.freeze())
}

/// Decode one complete frame with plain encodings
pub fn decode(bytes: &Bytes) -> Result<(PacketHeader, Bytes), WireError> {
    decode_with(bytes, &TransformRegistry::new(), MAX_BODY_SIZE)
}

/// Decode one complete frame, opening the body through `registry`
pub fn decode_with(
    bytes: &Bytes,
    registry: &TransformRegistry,
    max_body: usize,
) -> Result<(PacketHeader, Bytes), WireError> {
    let mut buf = bytes.clone();
    let header = PacketHeader::decode(&mut buf)?;

    let declared = header.body_length as usize;
    if declared > max_body {
        return Err(WireError::BodyTooLarge {
            size: declared,
            max: max_body,
        });
    }
    if buf.len() != declared {
        return Err(WireError::BodyLengthMismatch {
            declared,
            actual: buf.len(),
        });
    }

    let raw = open_body(&header, buf, registry)?;
    Ok((header, raw))
}

/// Undo transforms on a wire body and verify the checksum over the result
pub(crate) fn open_body(
    header: &PacketHeader,
    wire_body: Bytes,
    registry: &TransformRegistry,
) -> Result<Bytes, WireError> {
    let raw = if header.encrypt == EncryptType::None && header.compress == CompressType::None {
        wire_body
    } else {
        registry.open(header.encrypt, header.compress, &wire_body)?
    };

    let actual = body_checksum(&raw);
    if actual != header.checksum {
        return Err(WireError::ChecksumMismatch {
            expected: header.checksum,
            actual,
        });
    }
    Ok(raw)
}

/// Frame builder for outbound packets
#[derive(Debug, Clone)]
pub struct FrameBuilder {
    header: PacketHeader,
    body: Bytes,
}

impl FrameBuilder {
    /// Start a frame for the current protocol version
    pub fn new(msg_type: MessageType, sequence: u32, session_id: u16) -> Self {
        Self {
            header: PacketHeader::new(msg_type, sequence, session_id),
            body: Bytes::new(),
        }
    }

    /// Start from an existing header (retransmissions keep their sequence)
    pub fn from_header(header: PacketHeader) -> Self {
        Self {
            header,
            body: Bytes::new(),
        }
    }

    /// Override the send timestamp
    pub fn timestamp(mut self, timestamp: u32) -> Self {
        self.header.timestamp = timestamp;
        self
    }

    /// Set body encryption
    pub fn encrypt(mut self, encrypt: EncryptType) -> Self {
        self.header.encrypt = encrypt;
        self
    }

    /// Set body compression
    pub fn compress(mut self, compress: CompressType) -> Self {
        self.header.compress = compress;
        self
    }

    /// Set the raw body
    pub fn body(mut self, body: Bytes) -> Self {
        self.body = body;
        self
    }

    /// Header as it will be written, before length and checksum are filled
    pub fn header(&self) -> &PacketHeader {
        &self.header
    }

    /// Seal the body and encode the frame
    pub fn build(self, registry: &TransformRegistry) -> Result<Bytes, WireError> {
        let mut header = self.header;
        header.checksum = body_checksum(&self.body);

        let wire_body =
            if header.encrypt == EncryptType::None && header.compress == CompressType::None {
                self.body
            } else {
                registry.seal(header.encrypt, header.compress, &self.body)?
            };

        if wire_body.len() > MAX_BODY_SIZE {
            return Err(WireError::BodyTooLarge {
                size: wire_body.len(),
                max: MAX_BODY_SIZE,
            });
        }
        header.body_length = wire_body.len() as u32;

        let mut buf = BytesMut::with_capacity(HEADER_SIZE + wire_body.len());
        header.encode(&mut buf);
        buf.put_slice(&wire_body);
        Ok(buf.freeze())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransformError;
    use crate::transform::PayloadTransform;
    use std::sync::Arc;

    #[derive(Debug)]
    struct Reverse;

    impl PayloadTransform for Reverse {
        fn seal(&self, body: &[u8]) -> Result<Bytes, TransformError> {
            Ok(body.iter().rev().copied().collect::<Vec<_>>().into())
        }

        fn open(&self, body: &[u8]) -> Result<Bytes, TransformError> {
            self.seal(body)
        }
    }

    #[test]
    fn test_encode_decode() {
        let header = PacketHeader::new(MessageType::Normal, 5, 7);
        let frame = encode(&header, b"hello world").unwrap();
        assert_eq!(frame.len(), HEADER_SIZE + 11);

        let (decoded, body) = decode(&frame).unwrap();
        assert_eq!(decoded.sequence, 5);
        assert_eq!(decoded.body_length, 11);
        assert_eq!(&body[..], b"hello world");
    }

    #[test]
    fn test_checksum_mismatch() {
        let header = PacketHeader::new(MessageType::Normal, 1, 1);
        let mut frame = BytesMut::from(&encode(&header, b"payload").unwrap()[..]);
        let last = frame.len() - 1;
        frame[last] ^= 0xFF;

        assert!(matches!(
            decode(&frame.freeze()),
            Err(WireError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_body_length_mismatch() {
        let header = PacketHeader::new(MessageType::Normal, 1, 1);
        let frame = encode(&header, b"payload").unwrap();
        let truncated = frame.slice(..frame.len() - 2);

        assert_eq!(
            decode(&truncated).unwrap_err(),
            WireError::BodyLengthMismatch {
                declared: 7,
                actual: 5
            }
        );
    }

    #[test]
    fn test_builder_checksum_covers_raw_body() {
        let mut registry = TransformRegistry::new();
        registry.register_encryption(EncryptType::Aes256, Arc::new(Reverse));

        let frame = FrameBuilder::new(MessageType::Normal, 9, 3)
            .encrypt(EncryptType::Aes256)
            .body(Bytes::from_static(b"abcdef"))
            .build(&registry)
            .unwrap();

        assert_eq!(&frame[HEADER_SIZE..], b"fedcba");
        let (header, raw) = decode_with(&frame, &registry, MAX_BODY_SIZE).unwrap();
        assert_eq!(header.checksum, body_checksum(b"abcdef"));
        assert_eq!(&raw[..], b"abcdef");

        // without the transform the frame cannot be opened
        assert_eq!(
            decode(&frame).unwrap_err(),
            WireError::UnsupportedEncryption(EncryptType::Aes256)
        );
    }

    #[test]
    fn test_encode_rejects_oversized_body() {
        let header = PacketHeader::new(MessageType::Normal, 1, 1);
        let body = vec![0u8; MAX_BODY_SIZE + 1];
        assert_eq!(
            encode(&header, &body).unwrap_err(),
            WireError::BodyTooLarge {
                size: MAX_BODY_SIZE + 1,
                max: MAX_BODY_SIZE
            }
        );
    }

    #[test]
    fn test_decode_rejects_oversized_body() {
        let header = PacketHeader::new(MessageType::Normal, 1, 1);
        let frame = encode(&header, &[0u8; 64]).unwrap();
        assert!(matches!(
            decode_with(&frame, &TransformRegistry::new(), 32),
            Err(WireError::BodyTooLarge { size: 64, max: 32 })
        ));
    }
}
