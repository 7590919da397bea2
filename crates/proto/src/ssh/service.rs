//! Service layer (RFC 4253 Section 10).
//!
//! After NEWKEYS the client asks for a named service with
//! `SSH_MSG_SERVICE_REQUEST`; the server answers `SSH_MSG_SERVICE_ACCEPT`
//! (or disconnects). Only then may that service's traffic flow. Two
//! services exist in practice: `ssh-userauth` and `ssh-connection`.
//!
//! Services claim message-number ranges at registration; a payload is
//! routed to the service whose claim covers its message number.
//! Overlapping claims are a programming error and are rejected when the
//! second service registers.

use crate::ssh::codec;
use crate::ssh::message::MessageType;
use bytes::BytesMut;
use keel_platform::{KeelError, KeelResult};

/// Name of the user authentication service.
pub const USERAUTH_SERVICE: &str = "ssh-userauth";

/// Name of the connection service.
pub const CONNECTION_SERVICE: &str = "ssh-connection";

/// SSH_MSG_SERVICE_REQUEST.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceRequest {
    /// Requested service name.
    pub service_name: String,
}

impl ServiceRequest {
    /// Creates a request for the named service.
    pub fn new(service_name: &str) -> Self {
        Self {
            service_name: service_name.to_string(),
        }
    }

    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        codec::put_byte(&mut buf, MessageType::ServiceRequest as u8);
        codec::put_string_utf8(&mut buf, &self.service_name);
        buf.to_vec()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> KeelResult<Self> {
        let mut offset = 0;
        let msg = codec::read_byte(data, &mut offset)?;
        if msg != MessageType::ServiceRequest as u8 {
            return Err(KeelError::Protocol(format!(
                "Invalid message type: expected 5 (SSH_MSG_SERVICE_REQUEST), got {}",
                msg
            )));
        }
        Ok(Self {
            service_name: codec::read_string_utf8(data, &mut offset)?,
        })
    }
}

/// SSH_MSG_SERVICE_ACCEPT.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceAccept {
    /// Accepted service name; must echo the request.
    pub service_name: String,
}

impl ServiceAccept {
    /// Creates an accept for the named service.
    pub fn new(service_name: &str) -> Self {
        Self {
            service_name: service_name.to_string(),
        }
    }

    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        codec::put_byte(&mut buf, MessageType::ServiceAccept as u8);
        codec::put_string_utf8(&mut buf, &self.service_name);
        buf.to_vec()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> KeelResult<Self> {
        let mut offset = 0;
        let msg = codec::read_byte(data, &mut offset)?;
        if msg != MessageType::ServiceAccept as u8 {
            return Err(KeelError::Protocol(format!(
                "Invalid message type: expected 6 (SSH_MSG_SERVICE_ACCEPT), got {}",
                msg
            )));
        }
        Ok(Self {
            service_name: codec::read_string_utf8(data, &mut offset)?,
        })
    }
}

/// A registered service: a name plus the message-number ranges it owns.
#[derive(Debug, Clone)]
struct ServiceEntry {
    name: String,
    ranges: Vec<(u8, u8)>,
}

/// Routes payload message numbers to named services.
#[derive(Debug, Default)]
pub struct ServiceRegistry {
    services: Vec<ServiceEntry>,
}

impl ServiceRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates the standard registry: `ssh-userauth` owning 50-79 and
    /// `ssh-connection` owning 80-127.
    pub fn standard() -> Self {
        let mut registry = Self::new();
        registry
            .register(USERAUTH_SERVICE, &[(50, 79)])
            .expect("empty registry accepts first claim");
        registry
            .register(CONNECTION_SERVICE, &[(80, 127)])
            .expect("disjoint claim");
        registry
    }

    /// Registers a service with its claimed inclusive ranges.
    ///
    /// # Errors
    ///
    /// Returns [`KeelError::Config`] when a range overlaps an existing
    /// claim or is empty/inverted.
    pub fn register(&mut self, name: &str, ranges: &[(u8, u8)]) -> KeelResult<()> {
        for &(lo, hi) in ranges {
            if lo > hi {
                return Err(KeelError::Config(format!(
                    "Service '{}' claims inverted range {}-{}",
                    name, lo, hi
                )));
            }
            for entry in &self.services {
                for &(elo, ehi) in &entry.ranges {
                    if lo <= ehi && elo <= hi {
                        return Err(KeelError::Config(format!(
                            "Service '{}' range {}-{} overlaps '{}' range {}-{}",
                            name, lo, hi, entry.name, elo, ehi
                        )));
                    }
                }
            }
        }
        self.services.push(ServiceEntry {
            name: name.to_string(),
            ranges: ranges.to_vec(),
        });
        Ok(())
    }

    /// Returns the service claiming the given message number.
    pub fn route(&self, message_number: u8) -> Option<&str> {
        self.services
            .iter()
            .find(|entry| {
                entry
                    .ranges
                    .iter()
                    .any(|&(lo, hi)| (lo..=hi).contains(&message_number))
            })
            .map(|entry| entry.name.as_str())
    }

    /// Returns all registered service names.
    pub fn names(&self) -> Vec<&str> {
        self.services.iter().map(|e| e.name.as_str()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_request_round_trip() {
        let request = ServiceRequest::new(USERAUTH_SERVICE);
        let bytes = request.to_bytes();
        assert_eq!(bytes[0], 5);
        assert_eq!(ServiceRequest::from_bytes(&bytes).unwrap(), request);
    }

    #[test]
    fn test_service_accept_round_trip() {
        let accept = ServiceAccept::new(CONNECTION_SERVICE);
        let bytes = accept.to_bytes();
        assert_eq!(bytes[0], 6);
        assert_eq!(ServiceAccept::from_bytes(&bytes).unwrap(), accept);
    }

    #[test]
    fn test_wrong_message_number_rejected() {
        let request = ServiceRequest::new(USERAUTH_SERVICE);
        let mut bytes = request.to_bytes();
        bytes[0] = 6;
        assert!(ServiceRequest::from_bytes(&bytes).is_err());
    }

    #[test]
    fn test_standard_routing() {
        let registry = ServiceRegistry::standard();
        assert_eq!(registry.route(50), Some(USERAUTH_SERVICE));
        assert_eq!(registry.route(61), Some(USERAUTH_SERVICE));
        assert_eq!(registry.route(79), Some(USERAUTH_SERVICE));
        assert_eq!(registry.route(80), Some(CONNECTION_SERVICE));
        assert_eq!(registry.route(100), Some(CONNECTION_SERVICE));
        assert_eq!(registry.route(127), Some(CONNECTION_SERVICE));
        assert_eq!(registry.route(20), None);
        assert_eq!(registry.route(128), None);
    }

    #[test]
    fn test_overlap_rejected() {
        let mut registry = ServiceRegistry::standard();
        // Entirely inside ssh-userauth's claim
        assert!(registry.register("rogue", &[(60, 62)]).is_err());
        // Straddling a boundary
        assert!(registry.register("rogue", &[(70, 85)]).is_err());
        // Touching a single number
        assert!(registry.register("rogue", &[(127, 130)]).is_err());
        // Disjoint claim is fine
        assert!(registry.register("extension", &[(128, 140)]).is_ok());
        assert_eq!(registry.route(130), Some("extension"));
    }

    #[test]
    fn test_inverted_range_rejected() {
        let mut registry = ServiceRegistry::new();
        assert!(registry.register("bad", &[(90, 80)]).is_err());
    }
}
