//! Algorithm negotiation (RFC 4253 Section 7.1).
//!
//! Both sides open key exchange by sending `SSH_MSG_KEXINIT`: a random
//! 16-byte cookie followed by ten name-lists of algorithm preferences.
//! Negotiation picks, for every slot, the first client-preferred entry
//! that also appears in the server's list; an empty intersection in any
//! slot fails the session with a [`KeelError::Negotiation`].
//!
//! The full KEXINIT payloads of both sides are also inputs to the
//! exchange hash, so parsed messages retain their exact wire encoding.
//!
//! # Example
//!
//! ```rust
//! use keel_proto::ssh::kex::{KexInit, NewKeys};
//!
//! let kexinit = KexInit::new_default();
//! let bytes = kexinit.to_bytes();
//! assert_eq!(bytes[0], 20); // SSH_MSG_KEXINIT
//!
//! let newkeys = NewKeys::new();
//! assert_eq!(newkeys.to_bytes(), vec![21]);
//! ```

use crate::ssh::codec;
use crate::ssh::compress::CompressionAlgorithm;
use crate::ssh::crypto::{CipherAlgorithm, MacAlgorithm};
use crate::ssh::hostkey::HostKeyAlgorithm;
use crate::ssh::kex_dh::KexAlgorithm;
use crate::ssh::message::MessageType;
use bytes::BytesMut;
use keel_platform::{KeelError, KeelResult};
use rand::RngCore;

/// SSH_MSG_KEXINIT message (RFC 4253 Section 7.1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KexInit {
    /// Random cookie (16 bytes)
    cookie: [u8; 16],
    /// Key exchange algorithms
    kex_algorithms: Vec<String>,
    /// Server host key algorithms
    server_host_key_algorithms: Vec<String>,
    /// Encryption algorithms client to server
    encryption_client_to_server: Vec<String>,
    /// Encryption algorithms server to client
    encryption_server_to_client: Vec<String>,
    /// MAC algorithms client to server
    mac_client_to_server: Vec<String>,
    /// MAC algorithms server to client
    mac_server_to_client: Vec<String>,
    /// Compression algorithms client to server
    compression_client_to_server: Vec<String>,
    /// Compression algorithms server to client
    compression_server_to_client: Vec<String>,
    /// Languages client to server (usually empty)
    languages_client_to_server: Vec<String>,
    /// Languages server to client (usually empty)
    languages_server_to_client: Vec<String>,
    /// First KEX packet follows (guess optimisation)
    first_kex_packet_follows: bool,
}

/// Ordered preference lists feeding a [`KexInit`].
#[derive(Debug, Clone)]
pub struct AlgorithmPreferences {
    /// Key exchange algorithm names.
    pub kex: Vec<String>,
    /// Host key algorithm names.
    pub host_keys: Vec<String>,
    /// Cipher names (both directions).
    pub ciphers: Vec<String>,
    /// MAC names (both directions).
    pub macs: Vec<String>,
    /// Compression names (both directions).
    pub compression: Vec<String>,
}

impl Default for AlgorithmPreferences {
    fn default() -> Self {
        Self {
            kex: KexAlgorithm::default_preference(),
            host_keys: HostKeyAlgorithm::default_preference(),
            ciphers: CipherAlgorithm::default_preference(),
            macs: MacAlgorithm::default_preference(),
            compression: CompressionAlgorithm::default_preference(),
        }
    }
}

impl KexInit {
    /// Creates a KEXINIT from preference lists with a fresh cookie.
    pub fn new(prefs: &AlgorithmPreferences) -> Self {
        let mut cookie = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut cookie);

        Self {
            cookie,
            kex_algorithms: prefs.kex.clone(),
            server_host_key_algorithms: prefs.host_keys.clone(),
            encryption_client_to_server: prefs.ciphers.clone(),
            encryption_server_to_client: prefs.ciphers.clone(),
            mac_client_to_server: prefs.macs.clone(),
            mac_server_to_client: prefs.macs.clone(),
            compression_client_to_server: prefs.compression.clone(),
            compression_server_to_client: prefs.compression.clone(),
            languages_client_to_server: vec![],
            languages_server_to_client: vec![],
            first_kex_packet_follows: false,
        }
    }

    /// Creates a KEXINIT with the default preference lists.
    pub fn new_default() -> Self {
        Self::new(&AlgorithmPreferences::default())
    }

    /// Returns the cookie.
    pub fn cookie(&self) -> &[u8; 16] {
        &self.cookie
    }

    /// Returns the key exchange algorithm list.
    pub fn kex_algorithms(&self) -> &[String] {
        &self.kex_algorithms
    }

    /// Returns the host key algorithm list.
    pub fn server_host_key_algorithms(&self) -> &[String] {
        &self.server_host_key_algorithms
    }

    /// Returns whether a guessed first KEX packet follows.
    pub fn first_kex_packet_follows(&self) -> bool {
        self.first_kex_packet_follows
    }

    /// Serializes to bytes (without packet framing).
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();

        codec::put_byte(&mut buf, MessageType::KexInit as u8);
        buf.extend_from_slice(&self.cookie);

        codec::put_name_list(&mut buf, &self.kex_algorithms);
        codec::put_name_list(&mut buf, &self.server_host_key_algorithms);
        codec::put_name_list(&mut buf, &self.encryption_client_to_server);
        codec::put_name_list(&mut buf, &self.encryption_server_to_client);
        codec::put_name_list(&mut buf, &self.mac_client_to_server);
        codec::put_name_list(&mut buf, &self.mac_server_to_client);
        codec::put_name_list(&mut buf, &self.compression_client_to_server);
        codec::put_name_list(&mut buf, &self.compression_server_to_client);
        codec::put_name_list(&mut buf, &self.languages_client_to_server);
        codec::put_name_list(&mut buf, &self.languages_server_to_client);

        codec::put_boolean(&mut buf, self.first_kex_packet_follows);
        codec::put_uint32(&mut buf, 0); // reserved

        buf.to_vec()
    }

    /// Parses a KEXINIT message from bytes.
    ///
    /// # Errors
    ///
    /// Returns [`KeelError::Protocol`] on a wrong message number or a
    /// truncated field.
    pub fn from_bytes(data: &[u8]) -> KeelResult<Self> {
        let mut offset = 0;
        let msg = codec::read_byte(data, &mut offset)?;
        if msg != MessageType::KexInit as u8 {
            return Err(KeelError::Protocol(format!(
                "Invalid message type: expected 20 (SSH_MSG_KEXINIT), got {}",
                msg
            )));
        }

        if data.len() < 17 {
            return Err(KeelError::Protocol(format!(
                "KEXINIT message too short: {} bytes (minimum 17)",
                data.len()
            )));
        }
        let mut cookie = [0u8; 16];
        cookie.copy_from_slice(&data[1..17]);
        offset = 17;

        let kex_algorithms = codec::read_name_list(data, &mut offset)?;
        let server_host_key_algorithms = codec::read_name_list(data, &mut offset)?;
        let encryption_client_to_server = codec::read_name_list(data, &mut offset)?;
        let encryption_server_to_client = codec::read_name_list(data, &mut offset)?;
        let mac_client_to_server = codec::read_name_list(data, &mut offset)?;
        let mac_server_to_client = codec::read_name_list(data, &mut offset)?;
        let compression_client_to_server = codec::read_name_list(data, &mut offset)?;
        let compression_server_to_client = codec::read_name_list(data, &mut offset)?;
        let languages_client_to_server = codec::read_name_list(data, &mut offset)?;
        let languages_server_to_client = codec::read_name_list(data, &mut offset)?;

        let first_kex_packet_follows = codec::read_boolean(data, &mut offset)?;
        let _reserved = codec::read_uint32(data, &mut offset)?;

        Ok(Self {
            cookie,
            kex_algorithms,
            server_host_key_algorithms,
            encryption_client_to_server,
            encryption_server_to_client,
            mac_client_to_server,
            mac_server_to_client,
            compression_client_to_server,
            compression_server_to_client,
            languages_client_to_server,
            languages_server_to_client,
            first_kex_packet_follows,
        })
    }
}

/// The negotiated algorithm set (RFC 4253 Section 7.1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlgorithmSet {
    /// Key exchange algorithm.
    pub kex: String,
    /// Host key algorithm.
    pub host_key: String,
    /// Cipher, client to server.
    pub cipher_c2s: String,
    /// Cipher, server to client.
    pub cipher_s2c: String,
    /// MAC, client to server.
    pub mac_c2s: String,
    /// MAC, server to client.
    pub mac_s2c: String,
    /// Compression, client to server.
    pub compression_c2s: String,
    /// Compression, server to client.
    pub compression_s2c: String,
    /// Language, client to server (empty when unnegotiated).
    pub language_c2s: String,
    /// Language, server to client (empty when unnegotiated).
    pub language_s2c: String,
}

/// Picks the first client-preferred algorithm the server also lists.
pub fn negotiate_algorithm(
    slot: &str,
    client_list: &[String],
    server_list: &[String],
) -> KeelResult<String> {
    for client_alg in client_list {
        if server_list.contains(client_alg) {
            return Ok(client_alg.clone());
        }
    }
    Err(KeelError::Negotiation(format!(
        "No common {} algorithm: client={:?}, server={:?}",
        slot, client_list, server_list
    )))
}

/// The language slots may legitimately be empty on both sides.
fn negotiate_language(client_list: &[String], server_list: &[String]) -> String {
    client_list
        .iter()
        .find(|alg| server_list.contains(alg))
        .cloned()
        .unwrap_or_default()
}

/// Computes the negotiated [`AlgorithmSet`] from both KEXINIT messages.
///
/// The caller passes the messages in (client, server) order regardless
/// of its own role; tie-breaks always favour the client's preference.
///
/// # Errors
///
/// Returns [`KeelError::Negotiation`] naming the first slot with an
/// empty intersection.
pub fn negotiate(client: &KexInit, server: &KexInit) -> KeelResult<AlgorithmSet> {
    Ok(AlgorithmSet {
        kex: negotiate_algorithm("kex", &client.kex_algorithms, &server.kex_algorithms)?,
        host_key: negotiate_algorithm(
            "host key",
            &client.server_host_key_algorithms,
            &server.server_host_key_algorithms,
        )?,
        cipher_c2s: negotiate_algorithm(
            "cipher (client to server)",
            &client.encryption_client_to_server,
            &server.encryption_client_to_server,
        )?,
        cipher_s2c: negotiate_algorithm(
            "cipher (server to client)",
            &client.encryption_server_to_client,
            &server.encryption_server_to_client,
        )?,
        mac_c2s: negotiate_algorithm(
            "MAC (client to server)",
            &client.mac_client_to_server,
            &server.mac_client_to_server,
        )?,
        mac_s2c: negotiate_algorithm(
            "MAC (server to client)",
            &client.mac_server_to_client,
            &server.mac_server_to_client,
        )?,
        compression_c2s: negotiate_algorithm(
            "compression (client to server)",
            &client.compression_client_to_server,
            &server.compression_client_to_server,
        )?,
        compression_s2c: negotiate_algorithm(
            "compression (server to client)",
            &client.compression_server_to_client,
            &server.compression_server_to_client,
        )?,
        language_c2s: negotiate_language(
            &client.languages_client_to_server,
            &server.languages_client_to_server,
        ),
        language_s2c: negotiate_language(
            &client.languages_server_to_client,
            &server.languages_server_to_client,
        ),
    })
}

/// SSH_MSG_NEWKEYS message (RFC 4253 Section 7.3).
///
/// Sent by both sides once key exchange completes. From the instant
/// NEWKEYS is emitted, all subsequent outbound packets use the new
/// keys; inbound switches on receipt of the peer's NEWKEYS.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct NewKeys;

impl NewKeys {
    /// Creates a new SSH_MSG_NEWKEYS message.
    pub const fn new() -> Self {
        Self
    }

    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        vec![MessageType::NewKeys as u8]
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> KeelResult<Self> {
        if data.is_empty() {
            return Err(KeelError::Protocol("NEWKEYS message is empty".to_string()));
        }
        if data[0] != MessageType::NewKeys as u8 {
            return Err(KeelError::Protocol(format!(
                "Invalid message type: expected 21 (SSH_MSG_NEWKEYS), got {}",
                data[0]
            )));
        }
        Ok(Self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prefs(kex: &[&str], ciphers: &[&str]) -> AlgorithmPreferences {
        AlgorithmPreferences {
            kex: kex.iter().map(|s| s.to_string()).collect(),
            ciphers: ciphers.iter().map(|s| s.to_string()).collect(),
            ..AlgorithmPreferences::default()
        }
    }

    #[test]
    fn test_kexinit_round_trip() {
        let original = KexInit::new_default();
        let bytes = original.to_bytes();
        assert_eq!(bytes[0], 20);
        let parsed = KexInit::from_bytes(&bytes).unwrap();
        assert_eq!(parsed, original);
        // Re-encoding must be byte identical: the payload feeds the
        // exchange hash.
        assert_eq!(parsed.to_bytes(), bytes);
    }

    #[test]
    fn test_kexinit_parse_invalid_type() {
        let mut data = vec![99];
        data.extend_from_slice(&[0u8; 40]);
        assert!(KexInit::from_bytes(&data).is_err());
    }

    #[test]
    fn test_kexinit_parse_truncated() {
        let data = vec![20, 1, 2, 3];
        assert!(KexInit::from_bytes(&data).is_err());
    }

    #[test]
    fn test_negotiate_first_client_match() {
        let client = vec!["aes256-ctr".to_string(), "aes128-ctr".to_string()];
        let server = vec!["aes128-ctr".to_string(), "aes256-ctr".to_string()];
        assert_eq!(
            negotiate_algorithm("cipher", &client, &server).unwrap(),
            "aes256-ctr"
        );
    }

    #[test]
    fn test_negotiate_no_match_is_negotiation_error() {
        let client = vec!["aes256-ctr".to_string()];
        let server = vec!["3des-cbc".to_string()];
        let result = negotiate_algorithm("cipher", &client, &server);
        assert!(matches!(result, Err(KeelError::Negotiation(_))));
    }

    #[test]
    fn test_negotiate_full_set() {
        let client = KexInit::new(&prefs(
            &["ecdh-sha2-nistp256", "diffie-hellman-group14-sha1"],
            &["aes128-ctr"],
        ));
        let server = KexInit::new(&prefs(
            &["diffie-hellman-group14-sha1", "ecdh-sha2-nistp256"],
            &["aes128-ctr", "aes256-ctr"],
        ));

        let set = negotiate(&client, &server).unwrap();
        assert_eq!(set.kex, "ecdh-sha2-nistp256");
        assert_eq!(set.cipher_c2s, "aes128-ctr");
        assert_eq!(set.cipher_s2c, "aes128-ctr");
        assert_eq!(set.compression_c2s, "none");
        assert_eq!(set.language_c2s, "");
    }

    #[test]
    fn test_negotiate_empty_slot_fails() {
        let client = KexInit::new(&prefs(&["ecdh-sha2-nistp256"], &["aes128-ctr"]));
        let server = KexInit::new(&prefs(&["diffie-hellman-group1-sha1"], &["aes128-ctr"]));
        assert!(matches!(
            negotiate(&client, &server),
            Err(KeelError::Negotiation(_))
        ));
    }

    #[test]
    fn test_newkeys_round_trip() {
        let newkeys = NewKeys::new();
        let bytes = newkeys.to_bytes();
        assert_eq!(bytes, vec![21]);
        assert_eq!(NewKeys::from_bytes(&bytes).unwrap(), newkeys);
        assert!(NewKeys::from_bytes(&[20]).is_err());
        assert!(NewKeys::from_bytes(&[]).is_err());
    }

    #[test]
    fn test_default_preferences_are_valid_names() {
        let prefs = AlgorithmPreferences::default();
        for name in prefs
            .kex
            .iter()
            .chain(&prefs.host_keys)
            .chain(&prefs.ciphers)
            .chain(&prefs.macs)
            .chain(&prefs.compression)
        {
            assert!(crate::ssh::codec::is_valid_name(name), "bad name {}", name);
        }
    }
}
