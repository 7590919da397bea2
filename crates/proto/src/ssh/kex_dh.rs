//! Key exchange methods and key derivation (RFC 4253 Section 8,
//! RFC 4419, RFC 5656, RFC 8731).
//!
//! Supported methods:
//!
//! - `diffie-hellman-group1-sha1` / `diffie-hellman-group14-sha1`
//! - `diffie-hellman-group-exchange-sha256`
//! - `ecdh-sha2-nistp256` / `ecdh-sha2-nistp384` / `ecdh-sha2-nistp521`
//! - `curve25519-sha256` (and the pre-standard `@libssh.org` alias)
//!
//! Each method produces a shared secret K and an exchange hash H. H of
//! the *first* exchange becomes the session id and never changes on
//! rekey. The [`ClientKex`]/[`ServerKex`] drivers run the message flow;
//! the transport session feeds them raw payloads and sends whatever
//! they hand back.
//!
//! # Security
//!
//! - DH peer public values are validated to lie in (1, p-1)
//! - Ephemeral DH exponents are zeroized on drop
//! - GEX group sizes are clamped to [1024, 8192] bits

use crate::ssh::codec;
use crate::ssh::hostkey::HostKey;
use crate::ssh::message::MessageType;
use bytes::BytesMut;
use keel_platform::{KeelError, KeelResult};
use num_bigint::BigUint;
use once_cell::sync::Lazy;
use p256::elliptic_curve::sec1::ToEncodedPoint;
use ring::agreement::{agree_ephemeral, EphemeralPrivateKey, UnparsedPublicKey, X25519};
use ring::rand::SystemRandom;
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha384, Sha512};
use zeroize::Zeroize;

/// Hash function negotiated as part of the kex algorithm name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlgorithm {
    /// SHA-1 (group1/group14 legacy exchanges)
    Sha1,
    /// SHA-256
    Sha256,
    /// SHA-384
    Sha384,
    /// SHA-512
    Sha512,
}

impl HashAlgorithm {
    /// Digest size in bytes.
    pub fn output_len(&self) -> usize {
        match self {
            HashAlgorithm::Sha1 => 20,
            HashAlgorithm::Sha256 => 32,
            HashAlgorithm::Sha384 => 48,
            HashAlgorithm::Sha512 => 64,
        }
    }

    /// Hashes the concatenation of `parts`.
    pub fn hash(&self, parts: &[&[u8]]) -> Vec<u8> {
        match self {
            HashAlgorithm::Sha1 => {
                let mut hasher = Sha1::new();
                for part in parts {
                    hasher.update(part);
                }
                hasher.finalize().to_vec()
            }
            HashAlgorithm::Sha256 => {
                let mut hasher = Sha256::new();
                for part in parts {
                    hasher.update(part);
                }
                hasher.finalize().to_vec()
            }
            HashAlgorithm::Sha384 => {
                let mut hasher = Sha384::new();
                for part in parts {
                    hasher.update(part);
                }
                hasher.finalize().to_vec()
            }
            HashAlgorithm::Sha512 => {
                let mut hasher = Sha512::new();
                for part in parts {
                    hasher.update(part);
                }
                hasher.finalize().to_vec()
            }
        }
    }
}

/// Key exchange algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KexAlgorithm {
    /// diffie-hellman-group1-sha1 (1024-bit MODP, legacy)
    DhGroup1Sha1,
    /// diffie-hellman-group14-sha1 (2048-bit MODP)
    DhGroup14Sha1,
    /// diffie-hellman-group-exchange-sha256 (RFC 4419)
    DhGexSha256,
    /// ecdh-sha2-nistp256 (RFC 5656)
    EcdhNistp256,
    /// ecdh-sha2-nistp384
    EcdhNistp384,
    /// ecdh-sha2-nistp521
    EcdhNistp521,
    /// curve25519-sha256 (RFC 8731)
    Curve25519,
}

impl KexAlgorithm {
    /// Returns the wire name.
    pub fn name(&self) -> &'static str {
        match self {
            KexAlgorithm::DhGroup1Sha1 => "diffie-hellman-group1-sha1",
            KexAlgorithm::DhGroup14Sha1 => "diffie-hellman-group14-sha1",
            KexAlgorithm::DhGexSha256 => "diffie-hellman-group-exchange-sha256",
            KexAlgorithm::EcdhNistp256 => "ecdh-sha2-nistp256",
            KexAlgorithm::EcdhNistp384 => "ecdh-sha2-nistp384",
            KexAlgorithm::EcdhNistp521 => "ecdh-sha2-nistp521",
            KexAlgorithm::Curve25519 => "curve25519-sha256",
        }
    }

    /// Parses a kex algorithm from its wire name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "diffie-hellman-group1-sha1" => Some(KexAlgorithm::DhGroup1Sha1),
            "diffie-hellman-group14-sha1" => Some(KexAlgorithm::DhGroup14Sha1),
            "diffie-hellman-group-exchange-sha256" => Some(KexAlgorithm::DhGexSha256),
            "ecdh-sha2-nistp256" => Some(KexAlgorithm::EcdhNistp256),
            "ecdh-sha2-nistp384" => Some(KexAlgorithm::EcdhNistp384),
            "ecdh-sha2-nistp521" => Some(KexAlgorithm::EcdhNistp521),
            "curve25519-sha256" | "curve25519-sha256@libssh.org" => Some(KexAlgorithm::Curve25519),
            _ => None,
        }
    }

    /// Returns the hash the algorithm binds into its name.
    pub fn hash(&self) -> HashAlgorithm {
        match self {
            KexAlgorithm::DhGroup1Sha1 | KexAlgorithm::DhGroup14Sha1 => HashAlgorithm::Sha1,
            KexAlgorithm::DhGexSha256 => HashAlgorithm::Sha256,
            KexAlgorithm::EcdhNistp256 => HashAlgorithm::Sha256,
            KexAlgorithm::EcdhNistp384 => HashAlgorithm::Sha384,
            KexAlgorithm::EcdhNistp521 => HashAlgorithm::Sha512,
            KexAlgorithm::Curve25519 => HashAlgorithm::Sha256,
        }
    }

    /// Default preference order.
    pub fn default_preference() -> Vec<String> {
        [
            "curve25519-sha256",
            "ecdh-sha2-nistp256",
            "ecdh-sha2-nistp384",
            "ecdh-sha2-nistp521",
            "diffie-hellman-group-exchange-sha256",
            "diffie-hellman-group14-sha1",
            "diffie-hellman-group1-sha1",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect()
    }
}

/// DH Group 1 prime (Oakley Group 2, 1024-bit, RFC 2409).
static GROUP1_P: Lazy<BigUint> = Lazy::new(|| {
    BigUint::from_bytes_be(
        &hex::decode(
            "FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD1\
             29024E088A67CC74020BBEA63B139B22514A08798E3404DD\
             EF9519B3CD3A431B302B0A6DF25F14374FE1356D6D51C245\
             E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406B7ED\
             EE386BFB5A899FA5AE9F24117C4B1FE649286651ECE65381\
             FFFFFFFFFFFFFFFF",
        )
        .expect("Invalid hex"),
    )
});

/// DH Group 14 prime (2048-bit, RFC 3526).
static GROUP14_P: Lazy<BigUint> = Lazy::new(|| {
    BigUint::from_bytes_be(
        &hex::decode(
            "FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD1\
             29024E088A67CC74020BBEA63B139B22514A08798E3404DD\
             EF9519B3CD3A431B302B0A6DF25F14374FE1356D6D51C245\
             E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406B7ED\
             EE386BFB5A899FA5AE9F24117C4B1FE649286651ECE45B3D\
             C2007CB8A163BF0598DA48361C55D39A69163FA8FD24CF5F\
             83655D23DCA3AD961C62F356208552BB9ED529077096966D\
             670C354E4ABC9804F1746C08CA18217C32905E462E36CE3B\
             E39E772C180E86039B2783A2EC07A28FB5C55DF06F4C52C9\
             DE2BCBF6955817183995497CEA956AE515D2261898FA0510\
             15728E5A8AACAA68FFFFFFFFFFFFFFFF",
        )
        .expect("Invalid hex"),
    )
});

/// Generator shared by the built-in MODP groups.
static GENERATOR: Lazy<BigUint> = Lazy::new(|| BigUint::from(2u32));

/// Minimum GEX group size in bits.
pub const GEX_MIN_BITS: u32 = 1024;
/// Preferred GEX group size in bits.
pub const GEX_PREFERRED_BITS: u32 = 2048;
/// Maximum GEX group size in bits.
pub const GEX_MAX_BITS: u32 = 8192;

/// Finite-field Diffie-Hellman over an explicit MODP group.
///
/// Used for group1, group14 and the group-exchange flow (where the
/// server supplies p and g at run time).
pub struct DhExchange {
    p: BigUint,
    private_key: Vec<u8>,
    public_key: Vec<u8>,
}

impl DhExchange {
    /// Generates an ephemeral key pair in the given group.
    pub fn new(p: BigUint, g: BigUint) -> Self {
        use num_bigint::RandBigInt;
        use rand::thread_rng;

        let mut rng = thread_rng();
        let p_minus_one = &p - 1u32;
        let x = rng.gen_biguint_range(&BigUint::from(2u32), &p_minus_one);
        let y = g.modpow(&x, &p);

        Self {
            p,
            private_key: x.to_bytes_be(),
            public_key: y.to_bytes_be(),
        }
    }

    /// Generates a key pair in DH group 1.
    pub fn group1() -> Self {
        Self::new(GROUP1_P.clone(), GENERATOR.clone())
    }

    /// Generates a key pair in DH group 14.
    pub fn group14() -> Self {
        Self::new(GROUP14_P.clone(), GENERATOR.clone())
    }

    /// Returns the public value e (big-endian magnitude).
    pub fn public_key(&self) -> &[u8] {
        &self.public_key
    }

    /// Computes the shared secret K from the peer's public value.
    ///
    /// # Errors
    ///
    /// Returns [`KeelError::Crypto`] when the peer value lies outside
    /// (1, p-1).
    pub fn compute_shared_secret(&self, peer_public: &[u8]) -> KeelResult<Vec<u8>> {
        let y_peer = BigUint::from_bytes_be(peer_public);
        let p_minus_one = &self.p - 1u32;
        if y_peer <= BigUint::from(1u32) || y_peer >= p_minus_one {
            return Err(KeelError::Crypto(
                "Invalid DH peer public value: out of range".to_string(),
            ));
        }
        let x = BigUint::from_bytes_be(&self.private_key);
        Ok(y_peer.modpow(&x, &self.p).to_bytes_be())
    }
}

impl Drop for DhExchange {
    fn drop(&mut self) {
        self.private_key.zeroize();
    }
}

/// ECDH over a NIST curve (RFC 5656).
pub enum EcdhExchange {
    /// nistp256
    P256(p256::ecdh::EphemeralSecret),
    /// nistp384
    P384(p384::ecdh::EphemeralSecret),
    /// nistp521
    P521(p521::ecdh::EphemeralSecret),
}

impl EcdhExchange {
    /// Generates an ephemeral key pair for the named algorithm.
    pub fn generate(algorithm: KexAlgorithm) -> KeelResult<Self> {
        let mut rng = rand::rngs::OsRng;
        match algorithm {
            KexAlgorithm::EcdhNistp256 => Ok(EcdhExchange::P256(
                p256::ecdh::EphemeralSecret::random(&mut rng),
            )),
            KexAlgorithm::EcdhNistp384 => Ok(EcdhExchange::P384(
                p384::ecdh::EphemeralSecret::random(&mut rng),
            )),
            KexAlgorithm::EcdhNistp521 => Ok(EcdhExchange::P521(
                p521::ecdh::EphemeralSecret::random(&mut rng),
            )),
            other => Err(KeelError::Config(format!(
                "{} is not an ECDH algorithm",
                other.name()
            ))),
        }
    }

    /// Returns Q (uncompressed SEC1 point).
    pub fn public_bytes(&self) -> Vec<u8> {
        match self {
            EcdhExchange::P256(secret) => secret
                .public_key()
                .to_encoded_point(false)
                .as_bytes()
                .to_vec(),
            EcdhExchange::P384(secret) => secret
                .public_key()
                .to_encoded_point(false)
                .as_bytes()
                .to_vec(),
            EcdhExchange::P521(secret) => secret
                .public_key()
                .to_encoded_point(false)
                .as_bytes()
                .to_vec(),
        }
    }

    /// Computes the shared secret from the peer's SEC1 point.
    pub fn compute_shared_secret(self, peer_public: &[u8]) -> KeelResult<Vec<u8>> {
        match self {
            EcdhExchange::P256(secret) => {
                let peer = p256::PublicKey::from_sec1_bytes(peer_public).map_err(|_| {
                    KeelError::Crypto("Invalid nistp256 peer public key".to_string())
                })?;
                Ok(secret.diffie_hellman(&peer).raw_secret_bytes().to_vec())
            }
            EcdhExchange::P384(secret) => {
                let peer = p384::PublicKey::from_sec1_bytes(peer_public).map_err(|_| {
                    KeelError::Crypto("Invalid nistp384 peer public key".to_string())
                })?;
                Ok(secret.diffie_hellman(&peer).raw_secret_bytes().to_vec())
            }
            EcdhExchange::P521(secret) => {
                let peer = p521::PublicKey::from_sec1_bytes(peer_public).map_err(|_| {
                    KeelError::Crypto("Invalid nistp521 peer public key".to_string())
                })?;
                Ok(secret.diffie_hellman(&peer).raw_secret_bytes().to_vec())
            }
        }
    }
}

/// Curve25519 key exchange (RFC 8731).
pub struct Curve25519Exchange {
    private_key: EphemeralPrivateKey,
    public_key: [u8; 32],
}

impl Curve25519Exchange {
    /// Generates an ephemeral key pair.
    pub fn new() -> KeelResult<Self> {
        let rng = SystemRandom::new();
        let private_key = EphemeralPrivateKey::generate(&X25519, &rng)
            .map_err(|_| KeelError::Crypto("Failed to generate Curve25519 key".to_string()))?;

        let public_key = private_key
            .compute_public_key()
            .map_err(|_| KeelError::Crypto("Failed to compute Curve25519 public key".to_string()))?;

        let mut public_key_bytes = [0u8; 32];
        public_key_bytes.copy_from_slice(public_key.as_ref());

        Ok(Self {
            private_key,
            public_key: public_key_bytes,
        })
    }

    /// Returns the 32-byte public key.
    pub fn public_key(&self) -> &[u8; 32] {
        &self.public_key
    }

    /// Computes the shared secret from the peer's 32-byte public key.
    pub fn compute_shared_secret(self, peer_public: &[u8]) -> KeelResult<Vec<u8>> {
        if peer_public.len() != 32 {
            return Err(KeelError::Crypto(format!(
                "Curve25519 peer public key must be 32 bytes, got {}",
                peer_public.len()
            )));
        }
        let peer_public_key = UnparsedPublicKey::new(&X25519, peer_public);
        agree_ephemeral(self.private_key, &peer_public_key, |key_material| {
            key_material.to_vec()
        })
        .map_err(|_| KeelError::Crypto("Curve25519 key agreement failed".to_string()))
    }
}

/// Identification strings and KEXINIT payloads bound into the exchange
/// hash (RFC 4253 Section 8).
#[derive(Debug, Clone)]
pub struct KexContext {
    /// Client identification line, without CRLF.
    pub client_version: String,
    /// Server identification line, without CRLF.
    pub server_version: String,
    /// Client KEXINIT payload, exactly as sent.
    pub client_kexinit: Vec<u8>,
    /// Server KEXINIT payload, exactly as received.
    pub server_kexinit: Vec<u8>,
}

/// Computes the exchange hash H.
///
/// `middle` holds the method-specific fields already wire-encoded (the
/// mpint e/f pair for finite-field DH, the Q_C/Q_S strings for ECDH,
/// plus the group parameters for GEX). K is appended as an mpint.
pub fn compute_exchange_hash(
    hash: HashAlgorithm,
    ctx: &KexContext,
    host_key_blob: &[u8],
    middle: &[u8],
    shared_secret: &[u8],
) -> Vec<u8> {
    let mut input = BytesMut::new();
    codec::put_string_utf8(&mut input, &ctx.client_version);
    codec::put_string_utf8(&mut input, &ctx.server_version);
    codec::put_string(&mut input, &ctx.client_kexinit);
    codec::put_string(&mut input, &ctx.server_kexinit);
    codec::put_string(&mut input, host_key_blob);
    input.extend_from_slice(middle);
    codec::put_mpint(&mut input, shared_secret);
    hash.hash(&[&input])
}

/// Builds the method-specific hash fields for finite-field DH.
pub fn dh_hash_middle(e: &[u8], f: &[u8]) -> Vec<u8> {
    let mut buf = BytesMut::new();
    codec::put_mpint(&mut buf, e);
    codec::put_mpint(&mut buf, f);
    buf.to_vec()
}

/// Builds the method-specific hash fields for ECDH / Curve25519.
pub fn ecdh_hash_middle(q_c: &[u8], q_s: &[u8]) -> Vec<u8> {
    let mut buf = BytesMut::new();
    codec::put_string(&mut buf, q_c);
    codec::put_string(&mut buf, q_s);
    buf.to_vec()
}

/// Builds the method-specific hash fields for group exchange.
#[allow(clippy::too_many_arguments)]
pub fn gex_hash_middle(
    min: u32,
    preferred: u32,
    max: u32,
    p: &[u8],
    g: &[u8],
    e: &[u8],
    f: &[u8],
) -> Vec<u8> {
    let mut buf = BytesMut::new();
    codec::put_uint32(&mut buf, min);
    codec::put_uint32(&mut buf, preferred);
    codec::put_uint32(&mut buf, max);
    codec::put_mpint(&mut buf, p);
    codec::put_mpint(&mut buf, g);
    codec::put_mpint(&mut buf, e);
    codec::put_mpint(&mut buf, f);
    buf.to_vec()
}

/// Derives session key material (RFC 4253 Section 7.2).
///
/// ```text
/// Initial IV client to server:     HASH(K || H || "A" || session_id)
/// Initial IV server to client:     HASH(K || H || "B" || session_id)
/// Encryption key client to server: HASH(K || H || "C" || session_id)
/// Encryption key server to client: HASH(K || H || "D" || session_id)
/// Integrity key client to server:  HASH(K || H || "E" || session_id)
/// Integrity key server to client:  HASH(K || H || "F" || session_id)
/// ```
///
/// Output shorter than `key_length` is extended with
/// `HASH(K || H || previous_output)` blocks.
pub fn derive_key(
    hash: HashAlgorithm,
    shared_secret: &[u8],
    exchange_hash: &[u8],
    session_id: &[u8],
    key_type: u8,
    key_length: usize,
) -> Vec<u8> {
    let k_mpint = codec::mpint_bytes(shared_secret);

    let mut key = hash.hash(&[&k_mpint, exchange_hash, &[key_type], session_id]);
    while key.len() < key_length {
        let block = hash.hash(&[&k_mpint, exchange_hash, &key]);
        key.extend_from_slice(&block);
    }
    key.truncate(key_length);
    key
}

/// All six key strings derived after an exchange.
pub struct SessionKeys {
    /// Initial IV, client to server.
    pub iv_c2s: Vec<u8>,
    /// Initial IV, server to client.
    pub iv_s2c: Vec<u8>,
    /// Encryption key, client to server.
    pub enc_c2s: Vec<u8>,
    /// Encryption key, server to client.
    pub enc_s2c: Vec<u8>,
    /// Integrity key, client to server.
    pub mac_c2s: Vec<u8>,
    /// Integrity key, server to client.
    pub mac_s2c: Vec<u8>,
}

impl SessionKeys {
    /// Derives all six keys at the given sizes.
    pub fn derive(
        hash: HashAlgorithm,
        shared_secret: &[u8],
        exchange_hash: &[u8],
        session_id: &[u8],
        iv_len: usize,
        enc_len: usize,
        mac_len: usize,
    ) -> Self {
        let derive = |letter: u8, len: usize| {
            derive_key(hash, shared_secret, exchange_hash, session_id, letter, len)
        };
        Self {
            iv_c2s: derive(b'A', iv_len),
            iv_s2c: derive(b'B', iv_len),
            enc_c2s: derive(b'C', enc_len),
            enc_s2c: derive(b'D', enc_len),
            mac_c2s: derive(b'E', mac_len),
            mac_s2c: derive(b'F', mac_len),
        }
    }
}

impl Drop for SessionKeys {
    fn drop(&mut self) {
        self.iv_c2s.zeroize();
        self.iv_s2c.zeroize();
        self.enc_c2s.zeroize();
        self.enc_s2c.zeroize();
        self.mac_c2s.zeroize();
        self.mac_s2c.zeroize();
    }
}

/// Result of a completed key exchange.
pub struct KexOutcome {
    /// Shared secret K (raw big-endian magnitude).
    pub shared_secret: Vec<u8>,
    /// Exchange hash H.
    pub exchange_hash: Vec<u8>,
    /// Server host key blob (SSH wire encoding).
    pub host_key_blob: Vec<u8>,
    /// Server's signature over H (SSH wire encoding).
    pub signature: Vec<u8>,
    /// Hash algorithm bound to the kex method.
    pub hash: HashAlgorithm,
}

impl Drop for KexOutcome {
    fn drop(&mut self) {
        self.shared_secret.zeroize();
    }
}

/// One step of a kex driver.
pub enum KexStep {
    /// Send this payload; more messages will follow.
    Send(Vec<u8>),
    /// The exchange is complete. `send` is the final payload to emit
    /// (the server's reply message; `None` on the client side).
    Finished {
        /// Final payload to send, if any.
        send: Option<Vec<u8>>,
        /// The computed exchange result.
        outcome: Box<KexOutcome>,
    },
}

enum ClientState {
    Dh(DhExchange),
    GexAwaitGroup,
    GexAwaitReply {
        exchange: DhExchange,
        p: Vec<u8>,
        g: Vec<u8>,
    },
    Ecdh(EcdhExchange),
    X25519(Curve25519Exchange),
    Done,
}

/// Client side of the key exchange message flow.
pub struct ClientKex {
    algorithm: KexAlgorithm,
    ctx: KexContext,
    state: ClientState,
}

impl ClientKex {
    /// Creates the driver and returns the first payload to send.
    pub fn new(algorithm: KexAlgorithm, ctx: KexContext) -> KeelResult<(Self, Vec<u8>)> {
        let (state, first) = match algorithm {
            KexAlgorithm::DhGroup1Sha1 => {
                let exchange = DhExchange::group1();
                let payload = encode_kexdh_init(exchange.public_key());
                (ClientState::Dh(exchange), payload)
            }
            KexAlgorithm::DhGroup14Sha1 => {
                let exchange = DhExchange::group14();
                let payload = encode_kexdh_init(exchange.public_key());
                (ClientState::Dh(exchange), payload)
            }
            KexAlgorithm::DhGexSha256 => {
                let mut buf = BytesMut::new();
                codec::put_byte(&mut buf, MessageType::KexDhGexRequest as u8);
                codec::put_uint32(&mut buf, GEX_MIN_BITS);
                codec::put_uint32(&mut buf, GEX_PREFERRED_BITS);
                codec::put_uint32(&mut buf, GEX_MAX_BITS);
                (ClientState::GexAwaitGroup, buf.to_vec())
            }
            KexAlgorithm::EcdhNistp256
            | KexAlgorithm::EcdhNistp384
            | KexAlgorithm::EcdhNistp521 => {
                let exchange = EcdhExchange::generate(algorithm)?;
                let payload = encode_ecdh_init(&exchange.public_bytes());
                (ClientState::Ecdh(exchange), payload)
            }
            KexAlgorithm::Curve25519 => {
                let exchange = Curve25519Exchange::new()?;
                let payload = encode_ecdh_init(exchange.public_key());
                (ClientState::X25519(exchange), payload)
            }
        };

        Ok((
            Self {
                algorithm,
                ctx,
                state,
            },
            first,
        ))
    }

    /// Feeds the next inbound kex payload to the driver.
    ///
    /// # Errors
    ///
    /// Returns [`KeelError::Protocol`] on an unexpected message in the
    /// KEX window, [`KeelError::Crypto`] on bad peer values.
    pub fn handle(&mut self, payload: &[u8]) -> KeelResult<KexStep> {
        let state = std::mem::replace(&mut self.state, ClientState::Done);
        match state {
            ClientState::Dh(exchange) => {
                let reply = KexReply::from_bytes(payload, MessageType::KexdhReply as u8, true)?;
                let shared = exchange.compute_shared_secret(&reply.f)?;
                let middle = dh_hash_middle(exchange.public_key(), &reply.f);
                self.finish(reply, middle, shared)
            }
            ClientState::GexAwaitGroup => {
                let (p, g) = decode_gex_group(payload)?;
                let p_int = BigUint::from_bytes_be(&p);
                let bits = p_int.bits() as u32;
                if !(GEX_MIN_BITS..=GEX_MAX_BITS).contains(&bits) {
                    return Err(KeelError::Crypto(format!(
                        "GEX group size {} bits outside [{}, {}]",
                        bits, GEX_MIN_BITS, GEX_MAX_BITS
                    )));
                }
                let exchange = DhExchange::new(p_int, BigUint::from_bytes_be(&g));
                let mut buf = BytesMut::new();
                codec::put_byte(&mut buf, MessageType::KexDhGexInit as u8);
                codec::put_mpint(&mut buf, exchange.public_key());
                let init = buf.to_vec();
                self.state = ClientState::GexAwaitReply { exchange, p, g };
                Ok(KexStep::Send(init))
            }
            ClientState::GexAwaitReply { exchange, p, g } => {
                let reply = KexReply::from_bytes(payload, MessageType::KexDhGexReply as u8, true)?;
                let shared = exchange.compute_shared_secret(&reply.f)?;
                let middle = gex_hash_middle(
                    GEX_MIN_BITS,
                    GEX_PREFERRED_BITS,
                    GEX_MAX_BITS,
                    &p,
                    &g,
                    exchange.public_key(),
                    &reply.f,
                );
                self.finish(reply, middle, shared)
            }
            ClientState::Ecdh(exchange) => {
                let reply = KexReply::from_bytes(payload, MessageType::KexdhReply as u8, false)?;
                let q_c = exchange.public_bytes();
                let shared = exchange.compute_shared_secret(&reply.f)?;
                let middle = ecdh_hash_middle(&q_c, &reply.f);
                self.finish(reply, middle, shared)
            }
            ClientState::X25519(exchange) => {
                let reply = KexReply::from_bytes(payload, MessageType::KexdhReply as u8, false)?;
                let q_c = exchange.public_key().to_vec();
                let shared = exchange.compute_shared_secret(&reply.f)?;
                let middle = ecdh_hash_middle(&q_c, &reply.f);
                self.finish(reply, middle, shared)
            }
            ClientState::Done => Err(KeelError::Protocol(
                "Unexpected message after key exchange completed".to_string(),
            )),
        }
    }

    fn finish(
        &mut self,
        reply: KexReply,
        middle: Vec<u8>,
        shared_secret: Vec<u8>,
    ) -> KeelResult<KexStep> {
        let hash = self.algorithm.hash();
        let exchange_hash =
            compute_exchange_hash(hash, &self.ctx, &reply.host_key_blob, &middle, &shared_secret);
        Ok(KexStep::Finished {
            send: None,
            outcome: Box::new(KexOutcome {
                shared_secret,
                exchange_hash,
                host_key_blob: reply.host_key_blob,
                signature: reply.signature,
                hash,
            }),
        })
    }
}

enum ServerState {
    AwaitInit,
    GexAwaitRequest,
    GexAwaitInit {
        exchange: DhExchange,
        min: u32,
        preferred: u32,
        max: u32,
    },
    Done,
}

/// Server side of the key exchange message flow.
///
/// Symmetric counterpart of [`ClientKex`]; the loopback test rigs and
/// the session's accept path drive it with inbound kex payloads.
pub struct ServerKex {
    algorithm: KexAlgorithm,
    ctx: KexContext,
    host_key: std::sync::Arc<dyn HostKey>,
    state: ServerState,
}

impl ServerKex {
    /// Creates the responder driver.
    pub fn new(
        algorithm: KexAlgorithm,
        ctx: KexContext,
        host_key: std::sync::Arc<dyn HostKey>,
    ) -> Self {
        let state = match algorithm {
            KexAlgorithm::DhGexSha256 => ServerState::GexAwaitRequest,
            _ => ServerState::AwaitInit,
        };
        Self {
            algorithm,
            ctx,
            host_key,
            state,
        }
    }

    /// Feeds the next inbound kex payload to the driver.
    pub fn handle(&mut self, payload: &[u8]) -> KeelResult<KexStep> {
        let state = std::mem::replace(&mut self.state, ServerState::Done);
        match state {
            ServerState::AwaitInit => match self.algorithm {
                KexAlgorithm::DhGroup1Sha1 | KexAlgorithm::DhGroup14Sha1 => {
                    let e = decode_kexdh_init(payload, true)?;
                    let exchange = if self.algorithm == KexAlgorithm::DhGroup1Sha1 {
                        DhExchange::group1()
                    } else {
                        DhExchange::group14()
                    };
                    let shared = exchange.compute_shared_secret(&e)?;
                    let middle = dh_hash_middle(&e, exchange.public_key());
                    self.reply(
                        MessageType::KexdhReply as u8,
                        exchange.public_key().to_vec(),
                        true,
                        middle,
                        shared,
                    )
                }
                KexAlgorithm::EcdhNistp256
                | KexAlgorithm::EcdhNistp384
                | KexAlgorithm::EcdhNistp521 => {
                    let q_c = decode_kexdh_init(payload, false)?;
                    let exchange = EcdhExchange::generate(self.algorithm)?;
                    let q_s = exchange.public_bytes();
                    let shared = exchange.compute_shared_secret(&q_c)?;
                    let middle = ecdh_hash_middle(&q_c, &q_s);
                    self.reply(MessageType::KexdhReply as u8, q_s, false, middle, shared)
                }
                KexAlgorithm::Curve25519 => {
                    let q_c = decode_kexdh_init(payload, false)?;
                    let exchange = Curve25519Exchange::new()?;
                    let q_s = exchange.public_key().to_vec();
                    let shared = exchange.compute_shared_secret(&q_c)?;
                    let middle = ecdh_hash_middle(&q_c, &q_s);
                    self.reply(MessageType::KexdhReply as u8, q_s, false, middle, shared)
                }
                KexAlgorithm::DhGexSha256 => Err(KeelError::Protocol(
                    "Group exchange expects SSH_MSG_KEX_DH_GEX_REQUEST first".to_string(),
                )),
            },
            ServerState::GexAwaitRequest => {
                let mut offset = 0;
                let msg = codec::read_byte(payload, &mut offset)?;
                if msg != MessageType::KexDhGexRequest as u8 {
                    return Err(KeelError::Protocol(format!(
                        "Expected SSH_MSG_KEX_DH_GEX_REQUEST, got {}",
                        msg
                    )));
                }
                let min = codec::read_uint32(payload, &mut offset)?;
                let preferred = codec::read_uint32(payload, &mut offset)?;
                let max = codec::read_uint32(payload, &mut offset)?;

                // Serve group14 for any request that can accept 2048 bits.
                if min > 2048 || max < 2048 {
                    return Err(KeelError::Negotiation(format!(
                        "No supported GEX group in [{}, {}]",
                        min, max
                    )));
                }
                let exchange = DhExchange::group14();
                let mut buf = BytesMut::new();
                codec::put_byte(&mut buf, MessageType::KexdhReply as u8); // 31 = GEX_GROUP
                codec::put_mpint(&mut buf, &GROUP14_P.to_bytes_be());
                codec::put_mpint(&mut buf, &GENERATOR.to_bytes_be());
                let group_msg = buf.to_vec();
                self.state = ServerState::GexAwaitInit {
                    exchange,
                    min,
                    preferred,
                    max,
                };
                Ok(KexStep::Send(group_msg))
            }
            ServerState::GexAwaitInit {
                exchange,
                min,
                preferred,
                max,
            } => {
                let mut offset = 0;
                let msg = codec::read_byte(payload, &mut offset)?;
                if msg != MessageType::KexDhGexInit as u8 {
                    return Err(KeelError::Protocol(format!(
                        "Expected SSH_MSG_KEX_DH_GEX_INIT, got {}",
                        msg
                    )));
                }
                let e = codec::read_mpint(payload, &mut offset)?;
                let shared = exchange.compute_shared_secret(&e)?;
                let middle = gex_hash_middle(
                    min,
                    preferred,
                    max,
                    &GROUP14_P.to_bytes_be(),
                    &GENERATOR.to_bytes_be(),
                    &e,
                    exchange.public_key(),
                );
                self.reply(
                    MessageType::KexDhGexReply as u8,
                    exchange.public_key().to_vec(),
                    true,
                    middle,
                    shared,
                )
            }
            ServerState::Done => Err(KeelError::Protocol(
                "Unexpected message after key exchange completed".to_string(),
            )),
        }
    }

    fn reply(
        &mut self,
        msg_number: u8,
        f: Vec<u8>,
        f_is_mpint: bool,
        middle: Vec<u8>,
        shared_secret: Vec<u8>,
    ) -> KeelResult<KexStep> {
        let hash = self.algorithm.hash();
        let host_key_blob = self.host_key.public_key_blob();
        let exchange_hash =
            compute_exchange_hash(hash, &self.ctx, &host_key_blob, &middle, &shared_secret);
        let signature = self.host_key.sign(&exchange_hash)?;

        let mut buf = BytesMut::new();
        codec::put_byte(&mut buf, msg_number);
        codec::put_string(&mut buf, &host_key_blob);
        if f_is_mpint {
            codec::put_mpint(&mut buf, &f);
        } else {
            codec::put_string(&mut buf, &f);
        }
        codec::put_string(&mut buf, &signature);

        Ok(KexStep::Finished {
            send: Some(buf.to_vec()),
            outcome: Box::new(KexOutcome {
                shared_secret,
                exchange_hash,
                host_key_blob,
                signature,
                hash,
            }),
        })
    }
}

/// Parsed KEXDH_REPLY / KEX_ECDH_REPLY / KEX_DH_GEX_REPLY.
struct KexReply {
    host_key_blob: Vec<u8>,
    f: Vec<u8>,
    signature: Vec<u8>,
}

impl KexReply {
    fn from_bytes(data: &[u8], expected_msg: u8, f_is_mpint: bool) -> KeelResult<Self> {
        let mut offset = 0;
        let msg = codec::read_byte(data, &mut offset)?;
        if msg != expected_msg {
            return Err(KeelError::Protocol(format!(
                "Unexpected message in KEX window: expected {}, got {}",
                expected_msg, msg
            )));
        }
        let host_key_blob = codec::read_string(data, &mut offset)?;
        let f = if f_is_mpint {
            codec::read_mpint(data, &mut offset)?
        } else {
            codec::read_string(data, &mut offset)?
        };
        let signature = codec::read_string(data, &mut offset)?;
        Ok(Self {
            host_key_blob,
            f,
            signature,
        })
    }
}

fn encode_kexdh_init(e: &[u8]) -> Vec<u8> {
    let mut buf = BytesMut::new();
    codec::put_byte(&mut buf, MessageType::KexdhInit as u8);
    codec::put_mpint(&mut buf, e);
    buf.to_vec()
}

fn encode_ecdh_init(q_c: &[u8]) -> Vec<u8> {
    let mut buf = BytesMut::new();
    codec::put_byte(&mut buf, MessageType::KexdhInit as u8);
    codec::put_string(&mut buf, q_c);
    buf.to_vec()
}

fn decode_kexdh_init(data: &[u8], mpint: bool) -> KeelResult<Vec<u8>> {
    let mut offset = 0;
    let msg = codec::read_byte(data, &mut offset)?;
    if msg != MessageType::KexdhInit as u8 {
        return Err(KeelError::Protocol(format!(
            "Expected SSH_MSG_KEXDH_INIT, got {}",
            msg
        )));
    }
    if mpint {
        codec::read_mpint(data, &mut offset)
    } else {
        codec::read_string(data, &mut offset)
    }
}

fn decode_gex_group(data: &[u8]) -> KeelResult<(Vec<u8>, Vec<u8>)> {
    let mut offset = 0;
    let msg = codec::read_byte(data, &mut offset)?;
    // GEX_GROUP shares number 31 with KEXDH_REPLY.
    if msg != 31 {
        return Err(KeelError::Protocol(format!(
            "Expected SSH_MSG_KEX_DH_GEX_GROUP, got {}",
            msg
        )));
    }
    let p = codec::read_mpint(data, &mut offset)?;
    let g = codec::read_mpint(data, &mut offset)?;
    Ok((p, g))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::hostkey::Ed25519HostKey;
    use std::sync::Arc;

    fn test_context() -> KexContext {
        KexContext {
            client_version: "SSH-2.0-Keel_0.1.0".to_string(),
            server_version: "SSH-2.0-Keel_0.1.0".to_string(),
            client_kexinit: vec![20, 1, 2, 3],
            server_kexinit: vec![20, 4, 5, 6],
        }
    }

    #[test]
    fn test_dh_group14_agreement() {
        let client = DhExchange::group14();
        let server = DhExchange::group14();

        let client_secret = client.compute_shared_secret(server.public_key()).unwrap();
        let server_secret = server.compute_shared_secret(client.public_key()).unwrap();

        assert_eq!(client_secret, server_secret);
        assert!(!client_secret.is_empty());
    }

    #[test]
    fn test_dh_group1_agreement() {
        let client = DhExchange::group1();
        let server = DhExchange::group1();
        assert_eq!(
            client.compute_shared_secret(server.public_key()).unwrap(),
            server.compute_shared_secret(client.public_key()).unwrap()
        );
    }

    #[test]
    fn test_dh_rejects_degenerate_peer() {
        let exchange = DhExchange::group14();
        assert!(exchange.compute_shared_secret(&[1u8]).is_err());
        assert!(exchange.compute_shared_secret(&[0u8]).is_err());
        assert!(exchange
            .compute_shared_secret(&GROUP14_P.to_bytes_be())
            .is_err());
    }

    #[test]
    fn test_ecdh_p256_agreement() {
        let client = EcdhExchange::generate(KexAlgorithm::EcdhNistp256).unwrap();
        let server = EcdhExchange::generate(KexAlgorithm::EcdhNistp256).unwrap();
        let client_pub = client.public_bytes();
        let server_pub = server.public_bytes();

        assert_eq!(
            client.compute_shared_secret(&server_pub).unwrap(),
            server.compute_shared_secret(&client_pub).unwrap()
        );
    }

    #[test]
    fn test_ecdh_rejects_garbage_point() {
        let client = EcdhExchange::generate(KexAlgorithm::EcdhNistp256).unwrap();
        assert!(client.compute_shared_secret(&[0x04, 1, 2, 3]).is_err());
    }

    #[test]
    fn test_curve25519_agreement() {
        let client = Curve25519Exchange::new().unwrap();
        let server = Curve25519Exchange::new().unwrap();
        let client_pub = *client.public_key();
        let server_pub = *server.public_key();

        assert_eq!(
            client.compute_shared_secret(&server_pub).unwrap(),
            server.compute_shared_secret(&client_pub).unwrap()
        );
    }

    #[test]
    fn test_hash_algorithm_lengths() {
        assert_eq!(HashAlgorithm::Sha1.output_len(), 20);
        assert_eq!(HashAlgorithm::Sha256.output_len(), 32);
        assert_eq!(HashAlgorithm::Sha384.output_len(), 48);
        assert_eq!(HashAlgorithm::Sha512.output_len(), 64);
        assert_eq!(HashAlgorithm::Sha512.hash(&[b"x"]).len(), 64);
    }

    #[test]
    fn test_kex_algorithm_names() {
        for name in KexAlgorithm::default_preference() {
            assert!(KexAlgorithm::from_name(&name).is_some(), "unknown {}", name);
        }
        assert_eq!(
            KexAlgorithm::from_name("curve25519-sha256@libssh.org"),
            Some(KexAlgorithm::Curve25519)
        );
        assert!(KexAlgorithm::from_name("sntrup761x25519-sha512").is_none());
    }

    #[test]
    fn test_derive_key_properties() {
        let shared = vec![0x42; 32];
        let hash = vec![0x01; 32];
        let session_id = vec![0x02; 32];

        let key = derive_key(HashAlgorithm::Sha256, &shared, &hash, &session_id, b'C', 32);
        assert_eq!(key.len(), 32);

        // Different letters diverge
        let key_a = derive_key(HashAlgorithm::Sha256, &shared, &hash, &session_id, b'A', 32);
        assert_ne!(key, key_a);

        // Extension produces a consistent prefix
        let long = derive_key(HashAlgorithm::Sha256, &shared, &hash, &session_id, b'C', 64);
        assert_eq!(long.len(), 64);
        assert_eq!(&long[..32], &key[..]);

        // SHA-1 derivation also extends past one block
        let sha1_key = derive_key(HashAlgorithm::Sha1, &shared, &hash, &session_id, b'C', 24);
        assert_eq!(sha1_key.len(), 24);
    }

    #[test]
    fn test_exchange_hash_deterministic() {
        let ctx = test_context();
        let h1 = compute_exchange_hash(
            HashAlgorithm::Sha256,
            &ctx,
            b"hostkey",
            &dh_hash_middle(&[5], &[7]),
            &[9],
        );
        let h2 = compute_exchange_hash(
            HashAlgorithm::Sha256,
            &ctx,
            b"hostkey",
            &dh_hash_middle(&[5], &[7]),
            &[9],
        );
        assert_eq!(h1, h2);

        // Any changed input changes H
        let h3 = compute_exchange_hash(
            HashAlgorithm::Sha256,
            &ctx,
            b"hostkey2",
            &dh_hash_middle(&[5], &[7]),
            &[9],
        );
        assert_ne!(h1, h3);
    }

    fn run_loopback(algorithm: KexAlgorithm) {
        let ctx = test_context();
        let host_key = Arc::new(Ed25519HostKey::generate().unwrap());

        let (mut client, first) = ClientKex::new(algorithm, ctx.clone()).unwrap();
        let mut server = ServerKex::new(algorithm, ctx, host_key);

        let mut to_server = first;
        let (client_outcome, server_outcome) = loop {
            let server_step = server.handle(&to_server).unwrap();
            let (to_client, server_done) = match server_step {
                KexStep::Send(msg) => (msg, None),
                KexStep::Finished { send, outcome } => {
                    (send.expect("server reply payload"), Some(outcome))
                }
            };
            match client.handle(&to_client).unwrap() {
                KexStep::Send(msg) => {
                    to_server = msg;
                }
                KexStep::Finished { send, outcome } => {
                    assert!(send.is_none());
                    break (outcome, server_done.expect("server finished"));
                }
            }
        };

        assert_eq!(client_outcome.shared_secret, server_outcome.shared_secret);
        assert_eq!(client_outcome.exchange_hash, server_outcome.exchange_hash);
        assert_eq!(
            client_outcome.exchange_hash.len(),
            algorithm.hash().output_len()
        );
    }

    #[test]
    fn test_loopback_group14() {
        run_loopback(KexAlgorithm::DhGroup14Sha1);
    }

    #[test]
    fn test_loopback_group1() {
        run_loopback(KexAlgorithm::DhGroup1Sha1);
    }

    #[test]
    fn test_loopback_gex() {
        run_loopback(KexAlgorithm::DhGexSha256);
    }

    #[test]
    fn test_loopback_nistp256() {
        run_loopback(KexAlgorithm::EcdhNistp256);
    }

    #[test]
    fn test_loopback_nistp384() {
        run_loopback(KexAlgorithm::EcdhNistp384);
    }

    #[test]
    fn test_loopback_nistp521() {
        run_loopback(KexAlgorithm::EcdhNistp521);
    }

    #[test]
    fn test_loopback_curve25519() {
        run_loopback(KexAlgorithm::Curve25519);
    }

    #[test]
    fn test_session_keys_derivation() {
        let keys = SessionKeys::derive(
            HashAlgorithm::Sha256,
            &[0x42; 32],
            &[0x01; 32],
            &[0x02; 32],
            16,
            32,
            32,
        );
        assert_eq!(keys.iv_c2s.len(), 16);
        assert_eq!(keys.enc_c2s.len(), 32);
        assert_eq!(keys.mac_s2c.len(), 32);
        assert_ne!(keys.enc_c2s, keys.enc_s2c);
        assert_ne!(keys.iv_c2s, keys.iv_s2c);
    }
}
