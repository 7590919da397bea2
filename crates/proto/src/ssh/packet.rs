//! SSH binary packet protocol (RFC 4253 Section 6).
//!
//! # Packet Format
//!
//! ```text
//! uint32    packet_length
//! byte      padding_length
//! byte[n1]  payload (n1 = packet_length - padding_length - 1)
//! byte[n2]  random padding (n2 = padding_length)
//! byte[m]   mac (MAC = Message Authentication Code)
//! ```
//!
//! # Constraints
//!
//! - `packet_length` does NOT include the MAC or the length field itself
//! - padding is at least 4 and at most 255 bytes
//! - `packet_length + 4` MUST be a multiple of max(8, cipher block size)
//! - payload is at most 32768 bytes; the whole packet at most 35000
//!
//! # Pipeline
//!
//! [`PacketCodec`] is one *direction* of the pipeline: it compresses,
//! frames, encrypts and MACs outbound payloads (or the inverse for
//! inbound), owns that direction's sequence number (wrapping at 2^32)
//! and counts bytes/packets for the rekey trigger. A MAC mismatch or an
//! out-of-range length is surfaced as a fatal [`KeelError::Crypto`] /
//! [`KeelError::Protocol`] and must terminate the session.

use crate::ssh::compress::{CompressionAlgorithm, Compressor};
use crate::ssh::crypto::{CipherSuite, MacSuite};
use bytes::{Buf, BufMut, BytesMut};
use keel_platform::{KeelError, KeelResult};
use rand::RngCore;

/// Maximum total packet size in bytes (RFC 4253 Section 6.1).
pub const MAX_PACKET_SIZE: usize = 35000;

/// Maximum payload size in bytes.
pub const MAX_PAYLOAD_SIZE: usize = 32768;

/// Minimum padding length in bytes (RFC 4253 Section 6).
pub const MIN_PADDING_LEN: u8 = 4;

/// Maximum padding length in bytes (fits in u8).
pub const MAX_PADDING_LEN: u8 = 255;

/// Rekey after this many bytes in either direction (1 GiB).
pub const REKEY_BYTES_DEFAULT: u64 = 1 << 30;

/// Rekey after this many packets in either direction.
pub const REKEY_PACKETS_DEFAULT: u64 = (1u64 << 32) - 1024;

/// An unencrypted SSH packet frame.
///
/// A `Packet` exists only for one trip through the pipeline: it is
/// built from a payload on the way out, or recovered from wire bytes on
/// the way in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    payload: Vec<u8>,
    padding: Vec<u8>,
}

impl Packet {
    /// Frames a payload with random padding for an 8-byte block size.
    ///
    /// # Panics
    ///
    /// Panics if the payload exceeds [`MAX_PAYLOAD_SIZE`]. Pipeline
    /// callers go through [`PacketCodec::seal`], which rejects oversized
    /// payloads with an error instead.
    pub fn new(payload: Vec<u8>) -> Self {
        Self::frame(payload, 8)
    }

    /// Frames a payload with random padding for the given block size.
    ///
    /// The padding is the smallest count >= 4 that makes the total frame
    /// a multiple of `max(8, block_size)`.
    pub fn frame(payload: Vec<u8>, block_size: usize) -> Self {
        assert!(
            payload.len() <= MAX_PAYLOAD_SIZE,
            "Payload size {} exceeds maximum {}",
            payload.len(),
            MAX_PAYLOAD_SIZE
        );

        let block = block_size.max(8);
        let header_len = 5; // 4 bytes packet_length + 1 byte padding_length

        let unpadded = header_len + payload.len();
        let mut padding_len = MIN_PADDING_LEN as usize;
        while (unpadded + padding_len) % block != 0 {
            padding_len += 1;
        }

        let mut padding = vec![0u8; padding_len];
        rand::thread_rng().fill_bytes(&mut padding);

        Self { payload, padding }
    }

    /// Returns the payload.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Returns the padding.
    pub fn padding(&self) -> &[u8] {
        &self.padding
    }

    /// Consumes the frame, returning the payload.
    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }

    /// Serializes the frame (without MAC) to wire format.
    pub fn to_bytes(&self) -> Vec<u8> {
        let packet_length = 1 + self.payload.len() + self.padding.len();
        let mut buf = BytesMut::with_capacity(4 + packet_length);
        buf.put_u32(packet_length as u32);
        buf.put_u8(self.padding.len() as u8);
        buf.put_slice(&self.payload);
        buf.put_slice(&self.padding);
        buf.to_vec()
    }

    /// Parses an unencrypted frame from wire format.
    ///
    /// # Errors
    ///
    /// Returns [`KeelError::Protocol`] if the data is shorter than the
    /// declared lengths or any length field is out of range.
    pub fn from_bytes(data: &[u8]) -> KeelResult<Self> {
        if data.len() < 5 {
            return Err(KeelError::Protocol(format!(
                "Packet too short: {} bytes (minimum 5)",
                data.len()
            )));
        }

        let mut buf = data;
        let packet_length = buf.get_u32() as usize;
        validate_packet_length(packet_length, 8)?;

        if buf.len() < packet_length {
            return Err(KeelError::Protocol(format!(
                "Incomplete packet: expected {} bytes, got {}",
                packet_length,
                buf.len()
            )));
        }

        let padding_length = buf.get_u8() as usize;
        if padding_length < MIN_PADDING_LEN as usize {
            return Err(KeelError::Protocol(format!(
                "Padding too short: {} bytes (minimum {})",
                padding_length, MIN_PADDING_LEN
            )));
        }
        if packet_length < 1 + padding_length {
            return Err(KeelError::Protocol(format!(
                "Invalid packet: packet_length ({}) too small for padding ({})",
                packet_length, padding_length
            )));
        }

        let payload_length = packet_length - 1 - padding_length;
        let payload = buf[..payload_length].to_vec();
        buf.advance(payload_length);
        let padding = buf[..padding_length].to_vec();

        Ok(Self { payload, padding })
    }
}

/// Validates a declared packet_length against the block size invariant.
fn validate_packet_length(packet_length: usize, block_size: usize) -> KeelResult<()> {
    if packet_length < 5 {
        return Err(KeelError::Protocol(format!(
            "Packet too small: {} bytes (minimum 5)",
            packet_length
        )));
    }
    if packet_length + 4 > MAX_PACKET_SIZE {
        return Err(KeelError::Protocol(format!(
            "Packet too large: {} bytes (maximum {})",
            packet_length, MAX_PACKET_SIZE
        )));
    }
    let block = block_size.max(8);
    if (packet_length + 4) % block != 0 {
        return Err(KeelError::Protocol(format!(
            "Packet length {} + 4 not a multiple of block size {}",
            packet_length, block
        )));
    }
    Ok(())
}

/// In-flight state for a partially received encrypted packet.
struct PendingHead {
    /// First cipher block, already decrypted.
    head: Vec<u8>,
    /// Declared packet_length.
    packet_length: usize,
}

/// One direction of the packet pipeline.
///
/// Before NEWKEYS the codec runs in plaintext mode (no cipher, no MAC,
/// no compression); [`PacketCodec::activate`] installs the negotiated
/// suites, which apply from the very next packet.
pub struct PacketCodec {
    cipher: Option<CipherSuite>,
    mac: Option<MacSuite>,
    compressor: Compressor,
    sequence: u32,
    pending: Option<PendingHead>,
    bytes_processed: u64,
    packets_processed: u64,
}

impl std::fmt::Debug for PacketCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketCodec")
            .field("encrypted", &self.cipher.is_some())
            .field("sequence", &self.sequence)
            .field("bytes_processed", &self.bytes_processed)
            .finish()
    }
}

impl PacketCodec {
    /// Creates a plaintext codec (pre-NEWKEYS state).
    pub fn new() -> Self {
        Self {
            cipher: None,
            mac: None,
            compressor: Compressor::new(CompressionAlgorithm::None, false),
            sequence: 0,
            pending: None,
            bytes_processed: 0,
            packets_processed: 0,
        }
    }

    /// Installs freshly derived suites; takes effect from the next
    /// packet in this direction.
    ///
    /// Sequence numbers are NOT reset by a key change (RFC 4253
    /// Section 7.3); the byte/packet rekey counters are.
    pub fn activate(
        &mut self,
        cipher: CipherSuite,
        mac: MacSuite,
        compressor: Compressor,
    ) -> KeelResult<()> {
        if self.pending.is_some() {
            return Err(KeelError::Protocol(
                "Key change in the middle of a packet".to_string(),
            ));
        }
        self.cipher = Some(cipher);
        self.mac = Some(mac);
        self.compressor = compressor;
        self.bytes_processed = 0;
        self.packets_processed = 0;
        Ok(())
    }

    /// Arms delayed compression after userauth success.
    pub fn on_authenticated(&mut self) {
        self.compressor.on_authenticated();
    }

    /// Returns the sequence number of the next packet.
    pub fn sequence(&self) -> u32 {
        self.sequence
    }

    /// Returns whether encryption is active.
    pub fn is_encrypted(&self) -> bool {
        self.cipher.is_some()
    }

    /// Bytes processed since the last key installation.
    pub fn bytes_processed(&self) -> u64 {
        self.bytes_processed
    }

    /// Packets processed since the last key installation.
    pub fn packets_processed(&self) -> u64 {
        self.packets_processed
    }

    /// Returns whether this direction has crossed a rekey threshold.
    pub fn needs_rekey(&self, bytes_limit: u64, packets_limit: u64) -> bool {
        self.is_encrypted()
            && (self.bytes_processed >= bytes_limit || self.packets_processed >= packets_limit)
    }

    fn block_size(&self) -> usize {
        self.cipher
            .as_ref()
            .map(|c| c.algorithm().block_size().max(8))
            .unwrap_or(8)
    }

    /// Seals a payload: compress, frame, MAC, encrypt.
    ///
    /// Returns the full wire bytes including the MAC tag and advances
    /// the sequence number.
    pub fn seal(&mut self, payload: &[u8]) -> KeelResult<Vec<u8>> {
        let compressed = self.compressor.compress(payload)?;
        if compressed.len() > MAX_PAYLOAD_SIZE {
            return Err(KeelError::Protocol(format!(
                "Payload size {} exceeds maximum {}",
                compressed.len(),
                MAX_PAYLOAD_SIZE
            )));
        }

        let frame = Packet::frame(compressed, self.block_size());
        let mut wire = frame.to_bytes();

        // MAC is computed over the plaintext, then the frame encrypted.
        let tag = self
            .mac
            .as_ref()
            .map(|mac| mac.compute(self.sequence, &wire));

        if let Some(cipher) = &mut self.cipher {
            cipher.process(&mut wire)?;
        }
        if let Some(tag) = tag {
            wire.extend_from_slice(&tag);
        }

        self.sequence = self.sequence.wrapping_add(1);
        self.bytes_processed += wire.len() as u64;
        self.packets_processed += 1;
        Ok(wire)
    }

    /// Opens inbound wire bytes.
    ///
    /// Call with the receive buffer; consumed bytes are split off the
    /// front. Returns `Ok(None)` when more bytes are needed for a
    /// complete packet, `Ok(Some(payload))` when one was recovered.
    ///
    /// # Errors
    ///
    /// Fatal errors: declared length out of [5, 35000] or not a block
    /// multiple ([`KeelError::Protocol`]), MAC mismatch
    /// ([`KeelError::Crypto`]).
    pub fn open(&mut self, buf: &mut BytesMut) -> KeelResult<Option<Vec<u8>>> {
        let block = self.block_size();

        if self.pending.is_none() {
            if buf.len() < block {
                return Ok(None);
            }
            let mut head = buf.split_to(block).to_vec();
            if let Some(cipher) = &mut self.cipher {
                cipher.process(&mut head)?;
            }
            let packet_length =
                u32::from_be_bytes([head[0], head[1], head[2], head[3]]) as usize;
            validate_packet_length(packet_length, block)?;
            self.pending = Some(PendingHead {
                head,
                packet_length,
            });
        }

        let (rest_len, tag_len) = {
            let pending = self.pending.as_ref().expect("pending head just set");
            let tag_len = self.mac.as_ref().map_or(0, |m| m.algorithm().tag_size());
            (4 + pending.packet_length - block, tag_len)
        };

        if buf.len() < rest_len + tag_len {
            return Ok(None);
        }

        let PendingHead {
            head,
            packet_length,
        } = self.pending.take().expect("pending head just checked");

        let mut rest = buf.split_to(rest_len).to_vec();
        if let Some(cipher) = &mut self.cipher {
            cipher.process(&mut rest)?;
        }

        let mut frame = head;
        frame.extend_from_slice(&rest);

        if let Some(mac) = &self.mac {
            let tag = buf.split_to(tag_len);
            mac.verify(self.sequence, &frame, &tag)?;
        }

        let packet = Packet::from_bytes(&frame)?;
        let payload = self.compressor.decompress(packet.payload())?;

        self.sequence = self.sequence.wrapping_add(1);
        self.bytes_processed += (4 + packet_length + tag_len) as u64;
        self.packets_processed += 1;
        Ok(Some(payload))
    }
}

impl Default for PacketCodec {
    fn default() -> Self {
        Self::new()
    }
}
