//! SSH (Secure Shell) protocol implementation.
//!
//! # Architecture
//!
//! The engine is layered the way the RFCs are:
//!
//! 1. **Codec** ([`codec`]) - SSH primitive types (RFC 4251 Section 5)
//! 2. **Packet pipeline** ([`packet`], [`crypto`], [`compress`]) -
//!    framing, encryption, MAC, compression (RFC 4253 Section 6)
//! 3. **Key exchange** ([`kex`], [`kex_dh`], [`hostkey`]) - algorithm
//!    negotiation, shared-secret derivation, host key signatures
//! 4. **Transport session** ([`transport`], [`session`]) - the state
//!    machine, reader/writer tasks, rekeying
//! 5. **Services** ([`service`], [`auth`]) - service multiplexing and
//!    user authentication (RFC 4252)
//! 6. **Channels** ([`connection`], [`channel`]) - multiplexed byte
//!    pipes with credit-based flow control (RFC 4254)
//! 7. **SFTP** ([`sftp`]) - the file transfer client subsystem
//!
//! # Security Considerations
//!
//! - All packet parsing validates size limits (maximum 35000 bytes)
//! - MAC verification and credential comparison are constant time
//! - Key material is zeroized on drop
//! - No `unsafe` code
//!
//! # References
//!
//! - [RFC 4251](https://datatracker.ietf.org/doc/html/rfc4251) - SSH Protocol Architecture
//! - [RFC 4252](https://datatracker.ietf.org/doc/html/rfc4252) - SSH Authentication Protocol
//! - [RFC 4253](https://datatracker.ietf.org/doc/html/rfc4253) - SSH Transport Layer Protocol
//! - [RFC 4254](https://datatracker.ietf.org/doc/html/rfc4254) - SSH Connection Protocol

pub mod auth;
pub mod channel;
pub mod codec;
pub mod compress;
pub mod config;
pub mod connection;
pub mod crypto;
pub mod hostkey;
pub mod kex;
pub mod kex_dh;
pub mod message;
pub mod packet;
pub mod server;
pub mod service;
pub mod session;
pub mod sftp;
pub mod transport;
pub mod version;

// Re-export main types
pub use auth::{
    constant_time_compare, construct_signature_data, AuthAttempts, AuthBanner, AuthCredentials,
    AuthFailure, AuthMethod, AuthRequest, InteractivePromptResponder, KeyPairProvider,
    PasswordProvider,
};
pub use channel::{Channel, ChannelState};
pub use config::SshConfig;
pub use connection::{ChannelOpen, ChannelRequest, ChannelRequestType};
pub use crypto::{CipherAlgorithm, CipherSuite, MacAlgorithm, MacSuite, Registry};
pub use hostkey::{
    AcceptAnyHostKey, EcdsaHostKey, Ed25519HostKey, HostKey, HostKeyAlgorithm, HostKeyVerifier,
    PinnedHostKeys, RsaHostKey,
};
pub use kex::{negotiate, negotiate_algorithm, AlgorithmPreferences, AlgorithmSet, KexInit, NewKeys};
pub use kex_dh::{derive_key, Curve25519Exchange, DhExchange, EcdhExchange, KexAlgorithm};
pub use message::{DisconnectReason, MessageRange, MessageType};
pub use packet::{Packet, PacketCodec};
pub use server::{server_handshake, ServerAuthPolicy, ServerConnection};
pub use service::{ServiceRegistry, CONNECTION_SERVICE, USERAUTH_SERVICE};
pub use session::{client_handshake, ChannelEvent, ChannelHandle, Established, Role, SshSession};
pub use sftp::SftpClient;
pub use transport::{State, TransportState};
pub use version::Version;
