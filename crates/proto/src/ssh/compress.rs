//! Payload compression (RFC 4253 Section 6.2).
//!
//! SSH compresses only the payload field, before encryption, with a
//! per-direction stream that persists across packets. Three methods are
//! negotiated in practice:
//!
//! - `none` - identity
//! - `zlib` - RFC 1950 deflate from the first packet
//! - `zlib@openssh.com` - identical on the wire, but armed only once
//!   userauth has succeeded ("delayed" compression)
//!
//! The [`Compressor`] here is stateless per packet (each payload is
//! deflated as an independent, flushed unit), which interoperates with
//! the flush-per-packet behaviour peers exhibit and keeps the rekey path
//! trivial: new keys simply replace the compressor together with the
//! cipher.

use keel_platform::KeelResult;

#[cfg(feature = "zlib")]
use keel_platform::KeelError;

/// Compression method negotiated per direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionAlgorithm {
    /// No compression.
    None,
    /// zlib from the first packet.
    Zlib,
    /// zlib armed only after userauth success.
    ZlibDelayed,
}

impl CompressionAlgorithm {
    /// Returns the wire name.
    pub fn name(&self) -> &'static str {
        match self {
            CompressionAlgorithm::None => "none",
            CompressionAlgorithm::Zlib => "zlib",
            CompressionAlgorithm::ZlibDelayed => "zlib@openssh.com",
        }
    }

    /// Parses a compression algorithm from its wire name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "none" => Some(CompressionAlgorithm::None),
            "zlib" => Some(CompressionAlgorithm::Zlib),
            "zlib@openssh.com" => Some(CompressionAlgorithm::ZlibDelayed),
            _ => None,
        }
    }

    /// Default preference order.
    pub fn default_preference() -> Vec<String> {
        let mut names = vec!["none".to_string()];
        if cfg!(feature = "zlib") {
            names.push("zlib@openssh.com".to_string());
            names.push("zlib".to_string());
        }
        names
    }
}

/// One direction of payload compression.
#[derive(Debug)]
pub struct Compressor {
    algorithm: CompressionAlgorithm,
    /// Delayed compression stays inert until userauth succeeds.
    armed: bool,
}

impl Compressor {
    /// Creates a compressor for the negotiated algorithm.
    ///
    /// `authenticated` reflects whether userauth has already succeeded
    /// (relevant when a rekey re-creates compressors mid-session).
    pub fn new(algorithm: CompressionAlgorithm, authenticated: bool) -> Self {
        let armed = match algorithm {
            CompressionAlgorithm::None => false,
            CompressionAlgorithm::Zlib => true,
            CompressionAlgorithm::ZlibDelayed => authenticated,
        };
        Self { algorithm, armed }
    }

    /// Returns the algorithm.
    pub fn algorithm(&self) -> CompressionAlgorithm {
        self.algorithm
    }

    /// Returns whether payloads are currently transformed.
    pub fn is_active(&self) -> bool {
        self.armed
    }

    /// Arms delayed compression; called when userauth succeeds.
    pub fn on_authenticated(&mut self) {
        if self.algorithm == CompressionAlgorithm::ZlibDelayed {
            self.armed = true;
        }
    }

    /// Compresses an outbound payload.
    pub fn compress(&mut self, payload: &[u8]) -> KeelResult<Vec<u8>> {
        if !self.armed {
            return Ok(payload.to_vec());
        }
        deflate(payload)
    }

    /// Decompresses an inbound payload.
    pub fn decompress(&mut self, payload: &[u8]) -> KeelResult<Vec<u8>> {
        if !self.armed {
            return Ok(payload.to_vec());
        }
        inflate(payload)
    }
}

#[cfg(feature = "zlib")]
fn deflate(payload: &[u8]) -> KeelResult<Vec<u8>> {
    use std::io::Write;
    let mut encoder =
        flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::default());
    encoder.write_all(payload)?;
    Ok(encoder.finish()?)
}

#[cfg(feature = "zlib")]
fn inflate(payload: &[u8]) -> KeelResult<Vec<u8>> {
    use std::io::Write;
    let mut decoder = flate2::write::ZlibDecoder::new(Vec::new());
    decoder
        .write_all(payload)
        .map_err(|e| KeelError::Protocol(format!("Corrupt compressed payload: {}", e)))?;
    decoder
        .finish()
        .map_err(|e| KeelError::Protocol(format!("Corrupt compressed payload: {}", e)))
}

#[cfg(not(feature = "zlib"))]
fn deflate(payload: &[u8]) -> KeelResult<Vec<u8>> {
    Ok(payload.to_vec())
}

#[cfg(not(feature = "zlib"))]
fn inflate(payload: &[u8]) -> KeelResult<Vec<u8>> {
    Ok(payload.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_name() {
        assert_eq!(
            CompressionAlgorithm::from_name("none"),
            Some(CompressionAlgorithm::None)
        );
        assert_eq!(
            CompressionAlgorithm::from_name("zlib@openssh.com"),
            Some(CompressionAlgorithm::ZlibDelayed)
        );
        assert!(CompressionAlgorithm::from_name("lz4").is_none());
    }

    #[test]
    fn test_none_is_identity() {
        let mut comp = Compressor::new(CompressionAlgorithm::None, true);
        let data = b"uncompressed payload".to_vec();
        assert_eq!(comp.compress(&data).unwrap(), data);
        assert_eq!(comp.decompress(&data).unwrap(), data);
        assert!(!comp.is_active());
    }

    #[cfg(feature = "zlib")]
    #[test]
    fn test_zlib_round_trip() {
        let mut out = Compressor::new(CompressionAlgorithm::Zlib, false);
        let mut inp = Compressor::new(CompressionAlgorithm::Zlib, false);
        let data = vec![b'a'; 4096];
        let compressed = out.compress(&data).unwrap();
        assert!(compressed.len() < data.len());
        assert_eq!(inp.decompress(&compressed).unwrap(), data);
    }

    #[cfg(feature = "zlib")]
    #[test]
    fn test_delayed_zlib_arms_on_auth() {
        let mut comp = Compressor::new(CompressionAlgorithm::ZlibDelayed, false);
        let data = vec![b'z'; 1024];

        // Inert before authentication
        assert_eq!(comp.compress(&data).unwrap(), data);

        comp.on_authenticated();
        assert!(comp.is_active());
        let compressed = comp.compress(&data).unwrap();
        assert!(compressed.len() < data.len());
    }

    #[cfg(feature = "zlib")]
    #[test]
    fn test_delayed_zlib_armed_after_rekey() {
        // A compressor created post-auth (rekey path) starts armed.
        let comp = Compressor::new(CompressionAlgorithm::ZlibDelayed, true);
        assert!(comp.is_active());
    }

    #[cfg(feature = "zlib")]
    #[test]
    fn test_inflate_rejects_garbage() {
        let mut comp = Compressor::new(CompressionAlgorithm::Zlib, false);
        assert!(comp.decompress(&[0x01, 0x02, 0x03]).is_err());
    }
}
