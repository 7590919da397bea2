//! SSH identification line exchange (RFC 4253 Section 4.2).
//!
//! The protocol begins with both peers sending an identification line:
//!
//! ```text
//! SSH-protoversion-softwareversion SP comments CR LF
//! ```
//!
//! Example: `SSH-2.0-Keel_0.1.0`
//!
//! The line is at most 255 bytes including CRLF and is emitted before
//! any binary traffic. A server may precede its identification line
//! with free-form banner lines, which a client must skip.
//!
//! # Example
//!
//! ```rust
//! use keel_proto::ssh::version::Version;
//!
//! let version = Version::new("Keel_0.1.0", None);
//! assert_eq!(version.to_string(), "SSH-2.0-Keel_0.1.0");
//!
//! let parsed = Version::parse("SSH-2.0-OpenSSH_8.9\r\n").unwrap();
//! assert_eq!(parsed.software(), "OpenSSH_8.9");
//! ```

use keel_platform::{KeelError, KeelResult};
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};

/// Maximum length of the identification line including CRLF.
pub const MAX_VERSION_LENGTH: usize = 255;

/// Maximum number of banner lines accepted before the identification
/// line.
const MAX_BANNER_LINES: usize = 64;

/// SSH protocol identification string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Version {
    /// Protocol version (always "2.0" for lines we emit)
    proto_version: String,
    /// Software version (e.g. "Keel_0.1.0")
    software_version: String,
    /// Optional comments
    comments: Option<String>,
}

impl Version {
    /// Creates a new identification string with protocol version 2.0.
    pub fn new(software: &str, comments: Option<&str>) -> Self {
        Self {
            proto_version: "2.0".to_string(),
            software_version: software.to_string(),
            comments: comments.map(String::from),
        }
    }

    /// Returns the default Keel identification string.
    pub fn default_keel() -> Self {
        Self::new(&format!("Keel_{}", env!("CARGO_PKG_VERSION")), None)
    }

    /// Returns the protocol version component.
    pub fn protocol(&self) -> &str {
        &self.proto_version
    }

    /// Returns the software version component.
    pub fn software(&self) -> &str {
        &self.software_version
    }

    /// Returns the comments component, if any.
    pub fn comments(&self) -> Option<&str> {
        self.comments.as_deref()
    }

    /// Parses an identification line (with or without trailing CRLF).
    ///
    /// # Errors
    ///
    /// Returns [`KeelError::Protocol`] if the line is longer than 255
    /// bytes, does not start with `SSH-`, carries an unsupported
    /// protocol version, or contains NUL bytes.
    pub fn parse(line: &str) -> KeelResult<Self> {
        if line.len() > MAX_VERSION_LENGTH {
            return Err(KeelError::Protocol(format!(
                "Identification line too long: {} bytes (maximum {})",
                line.len(),
                MAX_VERSION_LENGTH
            )));
        }

        if line.contains('\0') {
            return Err(KeelError::Protocol(
                "Identification line contains NUL byte".to_string(),
            ));
        }

        let line = line.trim_end_matches(['\r', '\n']);

        let rest = line.strip_prefix("SSH-").ok_or_else(|| {
            KeelError::Protocol(format!("Identification line must start with SSH-: '{}'", line))
        })?;

        let (proto, software_and_comments) = rest.split_once('-').ok_or_else(|| {
            KeelError::Protocol("Identification line missing software version".to_string())
        })?;

        // 1.99 is the compatibility marker servers use for "2.0 capable"
        if proto != "2.0" && proto != "1.99" {
            return Err(KeelError::Protocol(format!(
                "Unsupported protocol version: '{}'",
                proto
            )));
        }

        let (software, comments) = match software_and_comments.split_once(' ') {
            Some((sw, cm)) => (sw.to_string(), Some(cm.to_string())),
            None => (software_and_comments.to_string(), None),
        };

        if software.is_empty() {
            return Err(KeelError::Protocol(
                "Empty software version in identification line".to_string(),
            ));
        }

        Ok(Self {
            proto_version: proto.to_string(),
            software_version: software,
            comments,
        })
    }

    /// Writes this identification line (with CRLF) to the stream.
    pub async fn write_to<W>(&self, writer: &mut W) -> KeelResult<()>
    where
        W: AsyncWrite + Unpin,
    {
        let line = format!("{}\r\n", self);
        if line.len() > MAX_VERSION_LENGTH {
            return Err(KeelError::Config(format!(
                "Identification line too long to send: {} bytes",
                line.len()
            )));
        }
        writer.write_all(line.as_bytes()).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Reads the peer's identification line from the stream, skipping
    /// any banner lines a server may send first.
    pub async fn read_from<R>(reader: &mut BufReader<R>) -> KeelResult<Self>
    where
        R: tokio::io::AsyncRead + Unpin,
    {
        for _ in 0..MAX_BANNER_LINES {
            let mut line = String::new();
            let n = reader.read_line(&mut line).await?;
            if n == 0 {
                return Err(KeelError::Protocol(
                    "Connection closed before identification line".to_string(),
                ));
            }
            if line.len() > MAX_VERSION_LENGTH {
                return Err(KeelError::Protocol(format!(
                    "Identification or banner line too long: {} bytes",
                    line.len()
                )));
            }
            if line.starts_with("SSH-") {
                return Self::parse(&line);
            }
            // Anything else is a pre-identification banner line.
            tracing::debug!(banner = %line.trim_end(), "skipping server banner line");
        }

        Err(KeelError::Protocol(
            "Too many banner lines before identification".to_string(),
        ))
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.comments {
            Some(comments) => write!(
                f,
                "SSH-{}-{} {}",
                self.proto_version, self.software_version, comments
            ),
            None => write!(f, "SSH-{}-{}", self.proto_version, self.software_version),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_new() {
        let version = Version::new("Keel_0.1.0", None);
        assert_eq!(version.to_string(), "SSH-2.0-Keel_0.1.0");
    }

    #[test]
    fn test_version_with_comments() {
        let version = Version::new("Keel_0.1.0", Some("testing"));
        assert_eq!(version.to_string(), "SSH-2.0-Keel_0.1.0 testing");
    }

    #[test]
    fn test_parse_plain() {
        let version = Version::parse("SSH-2.0-OpenSSH_8.9").unwrap();
        assert_eq!(version.protocol(), "2.0");
        assert_eq!(version.software(), "OpenSSH_8.9");
        assert!(version.comments().is_none());
    }

    #[test]
    fn test_parse_with_crlf_and_comments() {
        let version = Version::parse("SSH-2.0-OpenSSH_8.9 Ubuntu-3ubuntu0.1\r\n").unwrap();
        assert_eq!(version.software(), "OpenSSH_8.9");
        assert_eq!(version.comments(), Some("Ubuntu-3ubuntu0.1"));
    }

    #[test]
    fn test_parse_legacy_199() {
        let version = Version::parse("SSH-1.99-OldServer_1.0").unwrap();
        assert_eq!(version.protocol(), "1.99");
    }

    #[test]
    fn test_parse_rejects_v1() {
        assert!(Version::parse("SSH-1.5-OldServer").is_err());
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(Version::parse("HTTP/1.1 200 OK").is_err());
        assert!(Version::parse("SSH-2.0-").is_err());
    }

    #[test]
    fn test_parse_rejects_overlong() {
        let line = format!("SSH-2.0-{}", "x".repeat(300));
        assert!(Version::parse(&line).is_err());
    }

    #[test]
    fn test_parse_rejects_nul() {
        assert!(Version::parse("SSH-2.0-bad\0server").is_err());
    }

    #[test]
    fn test_round_trip() {
        let original = Version::new("Keel_0.1.0", Some("loopback"));
        let parsed = Version::parse(&original.to_string()).unwrap();
        assert_eq!(parsed, original);
    }

    #[tokio::test]
    async fn test_exchange_over_duplex_with_banner() {
        let (client, server) = tokio::io::duplex(1024);
        let (_, mut server_write) = tokio::io::split(server);
        let (client_read, _) = tokio::io::split(client);

        tokio::io::AsyncWriteExt::write_all(
            &mut server_write,
            b"Welcome to the test rig\r\nSSH-2.0-Keel_0.1.0\r\n",
        )
        .await
        .unwrap();

        let mut reader = BufReader::new(client_read);
        let version = Version::read_from(&mut reader).await.unwrap();
        assert_eq!(version.software(), "Keel_0.1.0");
    }
}
