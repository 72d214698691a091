//! Pluggable body transforms keyed by the header's encrypt/compress tags.
//!
//! Sealing order is compress then encrypt; opening reverses it. The header
//! checksum always covers the raw body, before any transform.

use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::TransformError;
use crate::header::{CompressType, EncryptType};
use crate::WireError;

/// A reversible body transform
pub trait PayloadTransform: Send + Sync + std::fmt::Debug {
    /// Apply the transform to an outbound body
    fn seal(&self, body: &[u8]) -> Result<Bytes, TransformError>;

    /// Undo the transform on an inbound body
    fn open(&self, body: &[u8]) -> Result<Bytes, TransformError>;
}

/// Pass-through transform
#[derive(Debug, Default, Clone, Copy)]
pub struct Identity;

impl PayloadTransform for Identity {
    fn seal(&self, body: &[u8]) -> Result<Bytes, TransformError> {
        Ok(Bytes::copy_from_slice(body))
    }

    fn open(&self, body: &[u8]) -> Result<Bytes, TransformError> {
        Ok(Bytes::copy_from_slice(body))
    }
}

/// Registry of transforms available to a codec or parser
#[derive(Debug, Clone)]
pub struct TransformRegistry {
    encryption: HashMap<EncryptType, Arc<dyn PayloadTransform>>,
    compression: HashMap<CompressType, Arc<dyn PayloadTransform>>,
}

impl TransformRegistry {
    /// Registry that only knows the plain encodings
    /// (`EncryptType::None`, `EncryptType::Crc32`, `CompressType::None`)
    pub fn new() -> Self {
        let identity: Arc<dyn PayloadTransform> = Arc::new(Identity);
        let mut encryption = HashMap::new();
        encryption.insert(EncryptType::None, identity.clone());
        encryption.insert(EncryptType::Crc32, identity.clone());
        let mut compression = HashMap::new();
        compression.insert(CompressType::None, identity);
        Self {
            encryption,
            compression,
        }
    }

    /// Register (or replace) an encryption transform
    pub fn register_encryption(
        &mut self,
        kind: EncryptType,
        transform: Arc<dyn PayloadTransform>,
    ) -> &mut Self {
        self.encryption.insert(kind, transform);
        self
    }

    /// Register (or replace) a compression transform
    pub fn register_compression(
        &mut self,
        kind: CompressType,
        transform: Arc<dyn PayloadTransform>,
    ) -> &mut Self {
        self.compression.insert(kind, transform);
        self
    }

    /// Whether both transforms are available
    pub fn supports(&self, encrypt: EncryptType, compress: CompressType) -> bool {
        self.encryption.contains_key(&encrypt) && self.compression.contains_key(&compress)
    }

    /// Compress then encrypt a raw body
    pub fn seal(
        &self,
        encrypt: EncryptType,
        compress: CompressType,
        raw: &[u8],
    ) -> Result<Bytes, WireError> {
        let compressor = self
            .compression
            .get(&compress)
            .ok_or(WireError::UnsupportedCompression(compress))?;
        let encryptor = self
            .encryption
            .get(&encrypt)
            .ok_or(WireError::UnsupportedEncryption(encrypt))?;

        let compressed = compressor.seal(raw)?;
        Ok(encryptor.seal(&compressed)?)
    }

    /// Decrypt then decompress a wire body back to the raw body
    pub fn open(
        &self,
        encrypt: EncryptType,
        compress: CompressType,
        wire: &[u8],
    ) -> Result<Bytes, WireError> {
        let encryptor = self
            .encryption
            .get(&encrypt)
            .ok_or(WireError::UnsupportedEncryption(encrypt))?;
        let compressor = self
            .compression
            .get(&compress)
            .ok_or(WireError::UnsupportedCompression(compress))?;

        let decrypted = encryptor.open(wire)?;
        Ok(compressor.open(&decrypted)?)
    }
}

impl Default for TransformRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(feature = "crypto")]
pub use aead::Aes256GcmTransform;

#[cfg(feature = "crypto")]
mod aead {
    use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
    use aes_gcm::{Aes256Gcm, Key, Nonce};
    use bytes::{BufMut, Bytes, BytesMut};

    use super::PayloadTransform;
    use crate::error::TransformError;

    const NONCE_LEN: usize = 12;

    /// AES-256-GCM body sealing; output is `nonce(12) || ciphertext+tag`
    pub struct Aes256GcmTransform {
        cipher: Aes256Gcm,
    }

    impl Aes256GcmTransform {
        /// Create from a 32-byte key
        pub fn new(key: &[u8; 32]) -> Self {
            let key = Key::<Aes256Gcm>::from_slice(key);
            Self {
                cipher: Aes256Gcm::new(key),
            }
        }
    }

    impl std::fmt::Debug for Aes256GcmTransform {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("Aes256GcmTransform").finish_non_exhaustive()
        }
    }

    impl PayloadTransform for Aes256GcmTransform {
        fn seal(&self, body: &[u8]) -> Result<Bytes, TransformError> {
            let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
            let sealed = self
                .cipher
                .encrypt(&nonce, body)
                .map_err(|e| TransformError::Seal(e.to_string()))?;
            let mut out = BytesMut::with_capacity(NONCE_LEN + sealed.len());
            out.put_slice(&nonce);
            out.put_slice(&sealed);
            Ok(out.freeze())
        }

        fn open(&self, body: &[u8]) -> Result<Bytes, TransformError> {
            if body.len() < NONCE_LEN {
                return Err(TransformError::Open("missing nonce".to_string()));
            }
            let (nonce, sealed) = body.split_at(NONCE_LEN);
            let plain = self
                .cipher
                .decrypt(Nonce::from_slice(nonce), sealed)
                .map_err(|e| TransformError::Open(e.to_string()))?;
            Ok(Bytes::from(plain))
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn test_aes_seal_open() {
            let transform = Aes256GcmTransform::new(&[7u8; 32]);
            let sealed = transform.seal(b"secret").unwrap();
            assert_ne!(&sealed[NONCE_LEN..], b"secret");
            assert_eq!(&transform.open(&sealed).unwrap()[..], b"secret");

            let other = Aes256GcmTransform::new(&[8u8; 32]);
            assert!(other.open(&sealed).is_err());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct XorMask(u8);

    impl PayloadTransform for XorMask {
        fn seal(&self, body: &[u8]) -> Result<Bytes, TransformError> {
            Ok(body.iter().map(|b| b ^ self.0).collect::<Vec<_>>().into())
        }

        fn open(&self, body: &[u8]) -> Result<Bytes, TransformError> {
            self.seal(body)
        }
    }

    #[test]
    fn test_default_registry_is_plain() {
        let registry = TransformRegistry::new();
        let sealed = registry
            .seal(EncryptType::Crc32, CompressType::None, b"abc")
            .unwrap();
        assert_eq!(&sealed[..], b"abc");
        assert!(!registry.supports(EncryptType::Aes256, CompressType::None));
    }

    #[test]
    fn test_unregistered_transform() {
        let registry = TransformRegistry::new();
        assert_eq!(
            registry
                .seal(EncryptType::Aes256, CompressType::None, b"abc")
                .unwrap_err(),
            WireError::UnsupportedEncryption(EncryptType::Aes256)
        );
        assert_eq!(
            registry
                .open(EncryptType::None, CompressType::Zlib, b"abc")
                .unwrap_err(),
            WireError::UnsupportedCompression(CompressType::Zlib)
        );
    }

    #[test]
    fn test_registered_transform_roundtrip() {
        let mut registry = TransformRegistry::new();
        registry.register_encryption(EncryptType::Aes256, Arc::new(XorMask(0x5A)));

        let sealed = registry
            .seal(EncryptType::Aes256, CompressType::None, b"hello")
            .unwrap();
        assert_ne!(&sealed[..], b"hello");
        let opened = registry
            .open(EncryptType::Aes256, CompressType::None, &sealed)
            .unwrap();
        assert_eq!(&opened[..], b"hello");
    }
}
