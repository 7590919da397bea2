//! Session configuration.
//!
//! Every tunable the engine honours, with the defaults interop
//! experience suggests. Preference lists feed KEXINIT directly; an
//! empty list would make every exchange fail and is rejected up front.

use crate::ssh::auth::DEFAULT_MAX_AUTH_ATTEMPTS;
use crate::ssh::channel::{DEFAULT_MAX_PACKET, DEFAULT_WINDOW_SIZE};
use crate::ssh::kex::AlgorithmPreferences;
use crate::ssh::packet::{REKEY_BYTES_DEFAULT, REKEY_PACKETS_DEFAULT};
use crate::ssh::version::Version;
use keel_platform::{KeelError, KeelResult};
use std::time::Duration;

/// SFTP stream adapter chunk default (32 KiB).
pub const DEFAULT_SFTP_CHUNK: usize = 32 * 1024;

/// Session configuration.
#[derive(Debug, Clone)]
pub struct SshConfig {
    /// Our identification line.
    pub version: Version,

    /// Seconds between SSH_MSG_IGNORE liveness probes; `None` disables.
    /// A probe that cannot be delivered escalates to session teardown.
    pub heartbeat_interval: Option<Duration>,

    /// Server-side authentication attempt cap.
    pub max_auth_requests: u32,

    /// Initial per-channel receive window in bytes.
    pub window_size: u32,

    /// Per-channel maximum packet in bytes.
    pub max_packet: u32,

    /// Bytes in either direction before a rekey is forced.
    pub rekey_bytes: u64,

    /// Packets in either direction before a rekey is forced.
    pub rekey_packets: u64,

    /// SFTP read stream chunk size.
    pub sftp_read_chunk: usize,

    /// SFTP write stream chunk size.
    pub sftp_write_chunk: usize,

    /// Algorithm preference lists.
    pub algorithms: AlgorithmPreferences,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            version: Version::default_keel(),
            heartbeat_interval: None,
            max_auth_requests: DEFAULT_MAX_AUTH_ATTEMPTS,
            window_size: DEFAULT_WINDOW_SIZE,
            max_packet: DEFAULT_MAX_PACKET,
            rekey_bytes: REKEY_BYTES_DEFAULT,
            rekey_packets: REKEY_PACKETS_DEFAULT,
            sftp_read_chunk: DEFAULT_SFTP_CHUNK,
            sftp_write_chunk: DEFAULT_SFTP_CHUNK,
            algorithms: AlgorithmPreferences::default(),
        }
    }
}

impl SshConfig {
    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// [`KeelError::Config`] on empty preference lists, a zero window,
    /// or a packet size outside (0, 32768].
    pub fn validate(&self) -> KeelResult<()> {
        if self.algorithms.kex.is_empty()
            || self.algorithms.host_keys.is_empty()
            || self.algorithms.ciphers.is_empty()
            || self.algorithms.macs.is_empty()
            || self.algorithms.compression.is_empty()
        {
            return Err(KeelError::Config(
                "Algorithm preference lists must not be empty".to_string(),
            ));
        }
        if self.window_size == 0 {
            return Err(KeelError::Config("window-size must be non-zero".to_string()));
        }
        if self.max_packet == 0 || self.max_packet > crate::ssh::packet::MAX_PAYLOAD_SIZE as u32 {
            return Err(KeelError::Config(format!(
                "max-packet must lie in (0, {}]",
                crate::ssh::packet::MAX_PAYLOAD_SIZE
            )));
        }
        if self.sftp_read_chunk == 0 || self.sftp_write_chunk == 0 {
            return Err(KeelError::Config(
                "SFTP chunk sizes must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = SshConfig::default();
        config.validate().unwrap();
        assert_eq!(config.window_size, 2 * 1024 * 1024);
        assert_eq!(config.max_packet, 32 * 1024);
        assert_eq!(config.max_auth_requests, 6);
        assert!(config.heartbeat_interval.is_none());
    }

    #[test]
    fn test_empty_preference_list_rejected() {
        let mut config = SshConfig::default();
        config.algorithms.ciphers.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_window_rejected() {
        let mut config = SshConfig::default();
        config.window_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_oversized_max_packet_rejected() {
        let mut config = SshConfig::default();
        config.max_packet = 64 * 1024;
        assert!(config.validate().is_err());
    }
}
