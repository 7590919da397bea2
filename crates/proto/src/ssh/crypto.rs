//! Symmetric cryptography for the packet pipeline.
//!
//! This module implements the cipher and MAC suites the transport
//! negotiates:
//!
//! - AES-CTR and AES-CBC at 128/192/256 bit key sizes
//! - HMAC-SHA1, HMAC-SHA1-96, HMAC-SHA2-256, HMAC-SHA2-512, HMAC-MD5,
//!   HMAC-MD5-96
//!
//! plus the [`Registry`] used by every algorithm family: a fixed set of
//! built-ins and an insertion-checked, case-insensitively keyed map of
//! runtime-registered extensions.
//!
//! MAC verification is constant time. Key material is zeroized on drop.

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit, StreamCipher};
use aes::{Aes128, Aes192, Aes256};
use ctr::Ctr128BE;
use hmac::{Hmac, Mac};
use keel_platform::{KeelError, KeelResult};
use md5::Md5;
use sha1::Sha1;
use sha2::{Sha256, Sha512};
use subtle::ConstantTimeEq;
use zeroize::Zeroize;

type Aes128Ctr = Ctr128BE<Aes128>;
type Aes192Ctr = Ctr128BE<Aes192>;
type Aes256Ctr = Ctr128BE<Aes256>;
type Aes128CbcEnc = cbc::Encryptor<Aes128>;
type Aes192CbcEnc = cbc::Encryptor<Aes192>;
type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes128CbcDec = cbc::Decryptor<Aes128>;
type Aes192CbcDec = cbc::Decryptor<Aes192>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

/// AES block size in bytes; every supported cipher shares it.
pub const AES_BLOCK_SIZE: usize = 16;

/// Cipher algorithm for SSH packet encryption.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherAlgorithm {
    /// aes128-ctr
    Aes128Ctr,
    /// aes192-ctr
    Aes192Ctr,
    /// aes256-ctr
    Aes256Ctr,
    /// aes128-cbc
    Aes128Cbc,
    /// aes192-cbc
    Aes192Cbc,
    /// aes256-cbc
    Aes256Cbc,
}

impl CipherAlgorithm {
    /// Returns the wire name.
    pub fn name(&self) -> &'static str {
        match self {
            CipherAlgorithm::Aes128Ctr => "aes128-ctr",
            CipherAlgorithm::Aes192Ctr => "aes192-ctr",
            CipherAlgorithm::Aes256Ctr => "aes256-ctr",
            CipherAlgorithm::Aes128Cbc => "aes128-cbc",
            CipherAlgorithm::Aes192Cbc => "aes192-cbc",
            CipherAlgorithm::Aes256Cbc => "aes256-cbc",
        }
    }

    /// Returns the key size in bytes.
    pub fn key_size(&self) -> usize {
        match self {
            CipherAlgorithm::Aes128Ctr | CipherAlgorithm::Aes128Cbc => 16,
            CipherAlgorithm::Aes192Ctr | CipherAlgorithm::Aes192Cbc => 24,
            CipherAlgorithm::Aes256Ctr | CipherAlgorithm::Aes256Cbc => 32,
        }
    }

    /// Returns the IV size in bytes.
    pub fn iv_size(&self) -> usize {
        AES_BLOCK_SIZE
    }

    /// Returns the cipher block size in bytes.
    pub fn block_size(&self) -> usize {
        AES_BLOCK_SIZE
    }

    /// Parses a cipher algorithm from its wire name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "aes128-ctr" => Some(CipherAlgorithm::Aes128Ctr),
            "aes192-ctr" => Some(CipherAlgorithm::Aes192Ctr),
            "aes256-ctr" => Some(CipherAlgorithm::Aes256Ctr),
            "aes128-cbc" => Some(CipherAlgorithm::Aes128Cbc),
            "aes192-cbc" => Some(CipherAlgorithm::Aes192Cbc),
            "aes256-cbc" => Some(CipherAlgorithm::Aes256Cbc),
            _ => None,
        }
    }

    /// Default preference order (CTR before CBC, larger keys first).
    pub fn default_preference() -> Vec<String> {
        [
            "aes256-ctr",
            "aes192-ctr",
            "aes128-ctr",
            "aes256-cbc",
            "aes192-cbc",
            "aes128-cbc",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect()
    }
}

enum CipherInner {
    Ctr128(Box<Aes128Ctr>),
    Ctr192(Box<Aes192Ctr>),
    Ctr256(Box<Aes256Ctr>),
    CbcEnc128(Box<Aes128CbcEnc>),
    CbcEnc192(Box<Aes192CbcEnc>),
    CbcEnc256(Box<Aes256CbcEnc>),
    CbcDec128(Box<Aes128CbcDec>),
    CbcDec192(Box<Aes192CbcDec>),
    CbcDec256(Box<Aes256CbcDec>),
}

/// One direction of negotiated packet encryption.
///
/// CTR mode is symmetric; CBC mode instantiates an encryptor or a
/// decryptor depending on [`CipherDirection`].
pub struct CipherSuite {
    algorithm: CipherAlgorithm,
    inner: CipherInner,
}

/// Whether a [`CipherSuite`] seals outbound or opens inbound packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherDirection {
    /// Outbound (encrypting)
    Encrypt,
    /// Inbound (decrypting)
    Decrypt,
}

impl std::fmt::Debug for CipherSuite {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CipherSuite")
            .field("algorithm", &self.algorithm)
            .field("state", &"<redacted>")
            .finish()
    }
}

impl CipherSuite {
    /// Initialises a cipher from derived key material.
    ///
    /// # Errors
    ///
    /// Returns [`KeelError::Crypto`] if the key or IV material is
    /// shorter than the algorithm requires.
    pub fn new(
        algorithm: CipherAlgorithm,
        direction: CipherDirection,
        key: &[u8],
        iv: &[u8],
    ) -> KeelResult<Self> {
        if key.len() < algorithm.key_size() {
            return Err(KeelError::Crypto(format!(
                "Insufficient key material for {}: expected {}, got {}",
                algorithm.name(),
                algorithm.key_size(),
                key.len()
            )));
        }
        if iv.len() < algorithm.iv_size() {
            return Err(KeelError::Crypto(format!(
                "Insufficient IV material for {}: expected {}, got {}",
                algorithm.name(),
                algorithm.iv_size(),
                iv.len()
            )));
        }

        let key = &key[..algorithm.key_size()];
        let iv = GenericArray::from_slice(&iv[..AES_BLOCK_SIZE]);

        let inner = match (algorithm, direction) {
            (CipherAlgorithm::Aes128Ctr, _) => {
                CipherInner::Ctr128(Box::new(Aes128Ctr::new(GenericArray::from_slice(key), iv)))
            }
            (CipherAlgorithm::Aes192Ctr, _) => {
                CipherInner::Ctr192(Box::new(Aes192Ctr::new(GenericArray::from_slice(key), iv)))
            }
            (CipherAlgorithm::Aes256Ctr, _) => {
                CipherInner::Ctr256(Box::new(Aes256Ctr::new(GenericArray::from_slice(key), iv)))
            }
            (CipherAlgorithm::Aes128Cbc, CipherDirection::Encrypt) => CipherInner::CbcEnc128(
                Box::new(Aes128CbcEnc::new(GenericArray::from_slice(key), iv)),
            ),
            (CipherAlgorithm::Aes192Cbc, CipherDirection::Encrypt) => CipherInner::CbcEnc192(
                Box::new(Aes192CbcEnc::new(GenericArray::from_slice(key), iv)),
            ),
            (CipherAlgorithm::Aes256Cbc, CipherDirection::Encrypt) => CipherInner::CbcEnc256(
                Box::new(Aes256CbcEnc::new(GenericArray::from_slice(key), iv)),
            ),
            (CipherAlgorithm::Aes128Cbc, CipherDirection::Decrypt) => CipherInner::CbcDec128(
                Box::new(Aes128CbcDec::new(GenericArray::from_slice(key), iv)),
            ),
            (CipherAlgorithm::Aes192Cbc, CipherDirection::Decrypt) => CipherInner::CbcDec192(
                Box::new(Aes192CbcDec::new(GenericArray::from_slice(key), iv)),
            ),
            (CipherAlgorithm::Aes256Cbc, CipherDirection::Decrypt) => CipherInner::CbcDec256(
                Box::new(Aes256CbcDec::new(GenericArray::from_slice(key), iv)),
            ),
        };

        Ok(Self { algorithm, inner })
    }

    /// Returns the algorithm.
    pub fn algorithm(&self) -> CipherAlgorithm {
        self.algorithm
    }

    /// Transforms `data` in place.
    ///
    /// The cipher keeps its keystream/chaining state across calls, so
    /// packets must be processed in wire order.
    ///
    /// # Errors
    ///
    /// Returns [`KeelError::Crypto`] if `data` is not a multiple of the
    /// block size (CBC only; CTR accepts any length).
    pub fn process(&mut self, data: &mut [u8]) -> KeelResult<()> {
        match &mut self.inner {
            CipherInner::Ctr128(c) => c.apply_keystream(data),
            CipherInner::Ctr192(c) => c.apply_keystream(data),
            CipherInner::Ctr256(c) => c.apply_keystream(data),
            CipherInner::CbcEnc128(c) => cbc_blocks(data, |b| c.encrypt_block_mut(b))?,
            CipherInner::CbcEnc192(c) => cbc_blocks(data, |b| c.encrypt_block_mut(b))?,
            CipherInner::CbcEnc256(c) => cbc_blocks(data, |b| c.encrypt_block_mut(b))?,
            CipherInner::CbcDec128(c) => cbc_blocks(data, |b| c.decrypt_block_mut(b))?,
            CipherInner::CbcDec192(c) => cbc_blocks(data, |b| c.decrypt_block_mut(b))?,
            CipherInner::CbcDec256(c) => cbc_blocks(data, |b| c.decrypt_block_mut(b))?,
        }
        Ok(())
    }
}

fn cbc_blocks<F>(data: &mut [u8], mut op: F) -> KeelResult<()>
where
    F: FnMut(&mut GenericArray<u8, aes::cipher::consts::U16>),
{
    if data.len() % AES_BLOCK_SIZE != 0 {
        return Err(KeelError::Crypto(format!(
            "CBC input not block aligned: {} bytes",
            data.len()
        )));
    }
    for block in data.chunks_mut(AES_BLOCK_SIZE) {
        op(GenericArray::from_mut_slice(block));
    }
    Ok(())
}

/// MAC algorithm for SSH packet integrity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MacAlgorithm {
    /// hmac-sha1
    HmacSha1,
    /// hmac-sha1-96 (SHA-1 truncated to 96 bits)
    HmacSha1_96,
    /// hmac-sha2-256
    HmacSha256,
    /// hmac-sha2-512
    HmacSha512,
    /// hmac-md5
    HmacMd5,
    /// hmac-md5-96 (MD5 truncated to 96 bits)
    HmacMd5_96,
}

impl MacAlgorithm {
    /// Returns the wire name.
    pub fn name(&self) -> &'static str {
        match self {
            MacAlgorithm::HmacSha1 => "hmac-sha1",
            MacAlgorithm::HmacSha1_96 => "hmac-sha1-96",
            MacAlgorithm::HmacSha256 => "hmac-sha2-256",
            MacAlgorithm::HmacSha512 => "hmac-sha2-512",
            MacAlgorithm::HmacMd5 => "hmac-md5",
            MacAlgorithm::HmacMd5_96 => "hmac-md5-96",
        }
    }

    /// Returns the key size in bytes.
    pub fn key_size(&self) -> usize {
        match self {
            MacAlgorithm::HmacSha1 | MacAlgorithm::HmacSha1_96 => 20,
            MacAlgorithm::HmacSha256 => 32,
            MacAlgorithm::HmacSha512 => 64,
            MacAlgorithm::HmacMd5 | MacAlgorithm::HmacMd5_96 => 16,
        }
    }

    /// Returns the tag length in bytes as emitted on the wire.
    pub fn tag_size(&self) -> usize {
        match self {
            MacAlgorithm::HmacSha1 => 20,
            MacAlgorithm::HmacSha1_96 => 12,
            MacAlgorithm::HmacSha256 => 32,
            MacAlgorithm::HmacSha512 => 64,
            MacAlgorithm::HmacMd5 => 16,
            MacAlgorithm::HmacMd5_96 => 12,
        }
    }

    /// Parses a MAC algorithm from its wire name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "hmac-sha1" => Some(MacAlgorithm::HmacSha1),
            "hmac-sha1-96" => Some(MacAlgorithm::HmacSha1_96),
            "hmac-sha2-256" => Some(MacAlgorithm::HmacSha256),
            "hmac-sha2-512" => Some(MacAlgorithm::HmacSha512),
            "hmac-md5" => Some(MacAlgorithm::HmacMd5),
            "hmac-md5-96" => Some(MacAlgorithm::HmacMd5_96),
            _ => None,
        }
    }

    /// Default preference order.
    pub fn default_preference() -> Vec<String> {
        [
            "hmac-sha2-256",
            "hmac-sha2-512",
            "hmac-sha1",
            "hmac-sha1-96",
            "hmac-md5",
            "hmac-md5-96",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect()
    }
}

/// One direction of negotiated packet authentication.
pub struct MacSuite {
    algorithm: MacAlgorithm,
    key: Vec<u8>,
}

impl std::fmt::Debug for MacSuite {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MacSuite")
            .field("algorithm", &self.algorithm)
            .field("key", &"<redacted>")
            .finish()
    }
}

impl MacSuite {
    /// Initialises a MAC from derived key material.
    pub fn new(algorithm: MacAlgorithm, key_material: &[u8]) -> KeelResult<Self> {
        if key_material.len() < algorithm.key_size() {
            return Err(KeelError::Crypto(format!(
                "Insufficient key material for {}: expected {}, got {}",
                algorithm.name(),
                algorithm.key_size(),
                key_material.len()
            )));
        }
        Ok(Self {
            algorithm,
            key: key_material[..algorithm.key_size()].to_vec(),
        })
    }

    /// Returns the algorithm.
    pub fn algorithm(&self) -> MacAlgorithm {
        self.algorithm
    }

    /// Computes the tag over `sequence_number || packet` (RFC 4253
    /// Section 6.4), truncated to the algorithm's wire tag length.
    pub fn compute(&self, sequence_number: u32, packet: &[u8]) -> Vec<u8> {
        let seq = sequence_number.to_be_bytes();

        let mut tag = match self.algorithm {
            MacAlgorithm::HmacSha1 | MacAlgorithm::HmacSha1_96 => {
                let mut mac =
                    Hmac::<Sha1>::new_from_slice(&self.key).expect("HMAC accepts any key length");
                mac.update(&seq);
                mac.update(packet);
                mac.finalize().into_bytes().to_vec()
            }
            MacAlgorithm::HmacSha256 => {
                let mut mac =
                    Hmac::<Sha256>::new_from_slice(&self.key).expect("HMAC accepts any key length");
                mac.update(&seq);
                mac.update(packet);
                mac.finalize().into_bytes().to_vec()
            }
            MacAlgorithm::HmacSha512 => {
                let mut mac =
                    Hmac::<Sha512>::new_from_slice(&self.key).expect("HMAC accepts any key length");
                mac.update(&seq);
                mac.update(packet);
                mac.finalize().into_bytes().to_vec()
            }
            MacAlgorithm::HmacMd5 | MacAlgorithm::HmacMd5_96 => {
                let mut mac =
                    Hmac::<Md5>::new_from_slice(&self.key).expect("HMAC accepts any key length");
                mac.update(&seq);
                mac.update(packet);
                mac.finalize().into_bytes().to_vec()
            }
        };

        tag.truncate(self.algorithm.tag_size());
        tag
    }

    /// Verifies a received tag in constant time.
    ///
    /// # Errors
    ///
    /// Returns [`KeelError::Crypto`] on any mismatch.
    pub fn verify(&self, sequence_number: u32, packet: &[u8], received: &[u8]) -> KeelResult<()> {
        let computed = self.compute(sequence_number, packet);
        if computed.len() != received.len() {
            return Err(KeelError::Crypto("MAC length mismatch".to_string()));
        }
        if computed.ct_eq(received).into() {
            Ok(())
        } else {
            Err(KeelError::Crypto("MAC verification failed".to_string()))
        }
    }
}

impl Drop for MacSuite {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

/// Algorithm registry: built-in entries plus runtime extensions.
///
/// Lookups and collision checks are case-insensitive. Registration
/// rejects collisions with built-ins and with previously registered
/// extensions.
#[derive(Debug, Clone)]
pub struct Registry<T> {
    builtins: Vec<(String, T)>,
    extensions: Vec<(String, T)>,
}

impl<T> Registry<T> {
    /// Creates a registry from its built-in entries.
    pub fn with_builtins<I>(entries: I) -> Self
    where
        I: IntoIterator<Item = (String, T)>,
    {
        Self {
            builtins: entries.into_iter().collect(),
            extensions: Vec::new(),
        }
    }

    /// Registers an extension entry.
    ///
    /// # Errors
    ///
    /// Returns [`KeelError::Config`] when the name collides
    /// (case-insensitively) with a built-in or a prior extension.
    pub fn register(&mut self, name: &str, value: T) -> KeelResult<()> {
        if self.find(name).is_some() {
            return Err(KeelError::Config(format!(
                "Algorithm '{}' is already registered",
                name
            )));
        }
        self.extensions.push((name.to_string(), value));
        Ok(())
    }

    /// Looks up an entry by name, extensions shadowing nothing.
    pub fn find(&self, name: &str) -> Option<&T> {
        self.builtins
            .iter()
            .chain(self.extensions.iter())
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v)
    }

    /// Returns all registered names, built-ins first.
    pub fn names(&self) -> Vec<String> {
        self.builtins
            .iter()
            .chain(self.extensions.iter())
            .map(|(n, _)| n.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cipher_algorithm_properties() {
        let aes128 = CipherAlgorithm::Aes128Ctr;
        assert_eq!(aes128.name(), "aes128-ctr");
        assert_eq!(aes128.key_size(), 16);
        assert_eq!(aes128.iv_size(), 16);
        assert_eq!(aes128.block_size(), 16);

        let aes256cbc = CipherAlgorithm::Aes256Cbc;
        assert_eq!(aes256cbc.key_size(), 32);
        assert_eq!(aes256cbc.name(), "aes256-cbc");
    }

    #[test]
    fn test_cipher_from_name() {
        assert_eq!(
            CipherAlgorithm::from_name("aes192-ctr"),
            Some(CipherAlgorithm::Aes192Ctr)
        );
        assert!(CipherAlgorithm::from_name("chacha20-poly1305@openssh.com").is_none());
    }

    #[test]
    fn test_ctr_round_trip() {
        let key = vec![7u8; 32];
        let iv = vec![9u8; 16];
        let mut enc = CipherSuite::new(
            CipherAlgorithm::Aes256Ctr,
            CipherDirection::Encrypt,
            &key,
            &iv,
        )
        .unwrap();
        let mut dec = CipherSuite::new(
            CipherAlgorithm::Aes256Ctr,
            CipherDirection::Decrypt,
            &key,
            &iv,
        )
        .unwrap();

        let mut data = b"The quick brown fox jumps over the lazy dog".to_vec();
        let original = data.clone();

        enc.process(&mut data).unwrap();
        assert_ne!(data, original);
        dec.process(&mut data).unwrap();
        assert_eq!(data, original);
    }

    #[test]
    fn test_ctr_keystream_continuity() {
        // Two packets processed sequentially must decrypt sequentially.
        let key = vec![1u8; 16];
        let iv = vec![2u8; 16];
        let mut enc = CipherSuite::new(
            CipherAlgorithm::Aes128Ctr,
            CipherDirection::Encrypt,
            &key,
            &iv,
        )
        .unwrap();
        let mut dec = CipherSuite::new(
            CipherAlgorithm::Aes128Ctr,
            CipherDirection::Decrypt,
            &key,
            &iv,
        )
        .unwrap();

        let mut first = vec![0xaa; 32];
        let mut second = vec![0xbb; 48];
        enc.process(&mut first).unwrap();
        enc.process(&mut second).unwrap();
        dec.process(&mut first).unwrap();
        dec.process(&mut second).unwrap();
        assert_eq!(first, vec![0xaa; 32]);
        assert_eq!(second, vec![0xbb; 48]);
    }

    #[test]
    fn test_cbc_round_trip() {
        let key = vec![3u8; 16];
        let iv = vec![4u8; 16];
        let mut enc = CipherSuite::new(
            CipherAlgorithm::Aes128Cbc,
            CipherDirection::Encrypt,
            &key,
            &iv,
        )
        .unwrap();
        let mut dec = CipherSuite::new(
            CipherAlgorithm::Aes128Cbc,
            CipherDirection::Decrypt,
            &key,
            &iv,
        )
        .unwrap();

        let mut data = vec![0x5a; 64];
        enc.process(&mut data).unwrap();
        assert_ne!(data, vec![0x5a; 64]);
        dec.process(&mut data).unwrap();
        assert_eq!(data, vec![0x5a; 64]);
    }

    #[test]
    fn test_cbc_rejects_unaligned() {
        let key = vec![3u8; 16];
        let iv = vec![4u8; 16];
        let mut enc = CipherSuite::new(
            CipherAlgorithm::Aes128Cbc,
            CipherDirection::Encrypt,
            &key,
            &iv,
        )
        .unwrap();
        let mut data = vec![0u8; 30];
        assert!(enc.process(&mut data).is_err());
    }

    #[test]
    fn test_cipher_insufficient_key() {
        let result = CipherSuite::new(
            CipherAlgorithm::Aes256Ctr,
            CipherDirection::Encrypt,
            &[0u8; 16],
            &[0u8; 16],
        );
        assert!(matches!(result, Err(KeelError::Crypto(_))));
    }

    #[test]
    fn test_mac_algorithm_properties() {
        assert_eq!(MacAlgorithm::HmacSha1.tag_size(), 20);
        assert_eq!(MacAlgorithm::HmacSha1_96.tag_size(), 12);
        assert_eq!(MacAlgorithm::HmacSha256.key_size(), 32);
        assert_eq!(MacAlgorithm::HmacSha512.tag_size(), 64);
        assert_eq!(MacAlgorithm::HmacMd5.key_size(), 16);
        assert_eq!(MacAlgorithm::HmacMd5_96.tag_size(), 12);
    }

    #[test]
    fn test_mac_compute_and_verify() {
        let key = vec![0x11u8; 32];
        let mac = MacSuite::new(MacAlgorithm::HmacSha256, &key).unwrap();

        let packet = b"packet bytes";
        let tag = mac.compute(7, packet);
        assert_eq!(tag.len(), 32);
        assert!(mac.verify(7, packet, &tag).is_ok());

        // Wrong sequence number fails
        assert!(mac.verify(8, packet, &tag).is_err());
        // Tampered tag fails
        let mut bad = tag.clone();
        bad[0] ^= 1;
        assert!(mac.verify(7, packet, &bad).is_err());
    }

    #[test]
    fn test_truncated_mac_lengths() {
        let key = vec![0x22u8; 20];
        let mac = MacSuite::new(MacAlgorithm::HmacSha1_96, &key).unwrap();
        assert_eq!(mac.compute(0, b"x").len(), 12);
    }

    #[test]
    fn test_registry_builtin_lookup() {
        let registry = Registry::with_builtins(
            CipherAlgorithm::default_preference()
                .into_iter()
                .map(|n| (n.clone(), CipherAlgorithm::from_name(&n).unwrap())),
        );
        assert!(registry.find("aes128-ctr").is_some());
        assert!(registry.find("AES128-CTR").is_some());
        assert!(registry.find("des").is_none());
    }

    #[test]
    fn test_registry_extension_collisions() {
        let mut registry =
            Registry::with_builtins([("aes128-ctr".to_string(), CipherAlgorithm::Aes128Ctr)]);

        // Collides with built-in, case-insensitively
        assert!(registry
            .register("AES128-CTR", CipherAlgorithm::Aes128Ctr)
            .is_err());

        assert!(registry
            .register("aes128-ctr@example.com", CipherAlgorithm::Aes128Ctr)
            .is_ok());

        // Collides with prior extension
        assert!(registry
            .register("aes128-ctr@EXAMPLE.com", CipherAlgorithm::Aes128Ctr)
            .is_err());

        assert_eq!(registry.names().len(), 2);
    }
}
