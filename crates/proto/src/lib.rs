//! Protocol engine for the Keel SSH stack.
//!
//! This crate implements the SSH v2 protocol suite:
//!
//! - **Transport layer** - binary packet protocol, key exchange, rekeying
//!   (RFC 4253)
//! - **User authentication** - password, public key and
//!   keyboard-interactive methods (RFC 4252, RFC 4256)
//! - **Connection layer** - channel multiplexing with credit-based flow
//!   control (RFC 4254)
//! - **SFTP client** - request/response file transfer over a `sftp`
//!   subsystem channel (draft-ietf-secsh-filexfer v3, with v4+ fields)
//!
//! # Features
//!
//! - `ssh` (default) - the SSH protocol engine
//! - `zlib` (default) - `zlib` / `zlib@openssh.com` payload compression
//!
//! # Example
//!
//! ```rust
//! use keel_proto::ssh::Packet;
//!
//! // Frame an SSH packet
//! let packet = Packet::new(b"SSH message payload".to_vec());
//! let wire_format = packet.to_bytes();
//!
//! // Parse from wire format
//! let parsed = Packet::from_bytes(&wire_format).unwrap();
//! assert_eq!(parsed.payload(), b"SSH message payload");
//! ```
//!
//! # References
//!
//! - [RFC 4251](https://datatracker.ietf.org/doc/html/rfc4251) - SSH Protocol Architecture
//! - [RFC 4252](https://datatracker.ietf.org/doc/html/rfc4252) - SSH Authentication Protocol
//! - [RFC 4253](https://datatracker.ietf.org/doc/html/rfc4253) - SSH Transport Layer Protocol
//! - [RFC 4254](https://datatracker.ietf.org/doc/html/rfc4254) - SSH Connection Protocol
//! - [draft-ietf-secsh-filexfer-02] - SFTP version 3

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![forbid(unsafe_code)]

#[cfg(feature = "ssh")]
pub mod ssh;
