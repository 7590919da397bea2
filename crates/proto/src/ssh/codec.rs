//! SSH primitive type codec (RFC 4251 Section 5).
//!
//! Every SSH message is assembled from a small set of primitive types:
//! `byte`, `boolean`, `uint32`, `uint64`, `string` (length-prefixed byte
//! run), `mpint` (two's-complement big-endian multiple precision
//! integer) and `name-list` (comma-separated ASCII names). This module
//! centralises their encoders and decoders; the message modules build on
//! top of it instead of hand-rolling offsets.
//!
//! Decoders take `(data, &mut offset)` and fail with a
//! [`KeelError::Protocol`] "malformed field" error whenever a declared
//! length exceeds the remaining bytes. Encoders append to a `BytesMut`.
//!
//! # Example
//!
//! ```rust
//! use bytes::BytesMut;
//! use keel_proto::ssh::codec;
//!
//! let mut buf = BytesMut::new();
//! codec::put_string(&mut buf, b"ssh-userauth");
//!
//! let mut offset = 0;
//! let s = codec::read_string(&buf, &mut offset).unwrap();
//! assert_eq!(s, b"ssh-userauth");
//! assert_eq!(offset, buf.len());
//! ```

use bytes::{BufMut, BytesMut};
use keel_platform::{KeelError, KeelResult};

/// Appends a single byte.
pub fn put_byte(buf: &mut BytesMut, value: u8) {
    buf.put_u8(value);
}

/// Appends a boolean (single byte, 0 = false, anything else = true).
pub fn put_boolean(buf: &mut BytesMut, value: bool) {
    buf.put_u8(u8::from(value));
}

/// Appends a big-endian uint32.
pub fn put_uint32(buf: &mut BytesMut, value: u32) {
    buf.put_u32(value);
}

/// Appends a big-endian uint64.
pub fn put_uint64(buf: &mut BytesMut, value: u64) {
    buf.put_u64(value);
}

/// Appends a length-prefixed byte string.
pub fn put_string(buf: &mut BytesMut, value: &[u8]) {
    buf.put_u32(value.len() as u32);
    buf.put_slice(value);
}

/// Appends a length-prefixed UTF-8 string.
pub fn put_string_utf8(buf: &mut BytesMut, value: &str) {
    put_string(buf, value.as_bytes());
}

/// Appends an mpint (RFC 4251 Section 5).
///
/// The input is interpreted as an unsigned big-endian magnitude. Leading
/// zero bytes are trimmed; a single zero byte is prepended only when the
/// most significant bit would otherwise read as a sign bit. Zero encodes
/// as the empty string.
pub fn put_mpint(buf: &mut BytesMut, magnitude: &[u8]) {
    let trimmed: &[u8] = {
        let start = magnitude.iter().position(|&b| b != 0).unwrap_or(magnitude.len());
        &magnitude[start..]
    };

    if trimmed.is_empty() {
        buf.put_u32(0);
        return;
    }

    let pad = trimmed[0] & 0x80 != 0;
    buf.put_u32((trimmed.len() + usize::from(pad)) as u32);
    if pad {
        buf.put_u8(0);
    }
    buf.put_slice(trimmed);
}

/// Appends a name-list (comma-joined ASCII names).
///
/// # Panics
///
/// Debug-asserts that every name is non-empty, comma-free, printable
/// ASCII; lists built from the algorithm registries always satisfy this.
pub fn put_name_list(buf: &mut BytesMut, names: &[String]) {
    debug_assert!(names.iter().all(|n| is_valid_name(n)));
    let joined = names.join(",");
    put_string(buf, joined.as_bytes());
}

/// Returns whether `name` is a legal name-list element: non-empty,
/// comma-free, printable US-ASCII.
pub fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .bytes()
            .all(|b| (0x21..=0x7e).contains(&b) && b != b',')
}

fn truncated(what: &str, offset: usize) -> KeelError {
    KeelError::Protocol(format!("Malformed {} field at offset {}", what, offset))
}

/// Reads a single byte.
pub fn read_byte(data: &[u8], offset: &mut usize) -> KeelResult<u8> {
    let b = *data.get(*offset).ok_or_else(|| truncated("byte", *offset))?;
    *offset += 1;
    Ok(b)
}

/// Reads a boolean.
pub fn read_boolean(data: &[u8], offset: &mut usize) -> KeelResult<bool> {
    Ok(read_byte(data, offset)? != 0)
}

/// Reads a big-endian uint32.
pub fn read_uint32(data: &[u8], offset: &mut usize) -> KeelResult<u32> {
    if *offset + 4 > data.len() {
        return Err(truncated("uint32", *offset));
    }
    let value = u32::from_be_bytes([
        data[*offset],
        data[*offset + 1],
        data[*offset + 2],
        data[*offset + 3],
    ]);
    *offset += 4;
    Ok(value)
}

/// Reads a big-endian uint64.
pub fn read_uint64(data: &[u8], offset: &mut usize) -> KeelResult<u64> {
    if *offset + 8 > data.len() {
        return Err(truncated("uint64", *offset));
    }
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&data[*offset..*offset + 8]);
    *offset += 8;
    Ok(u64::from_be_bytes(bytes))
}

/// Reads a length-prefixed byte string.
pub fn read_string(data: &[u8], offset: &mut usize) -> KeelResult<Vec<u8>> {
    let length = read_uint32(data, offset)? as usize;
    if *offset + length > data.len() {
        return Err(truncated("string", *offset));
    }
    let value = data[*offset..*offset + length].to_vec();
    *offset += length;
    Ok(value)
}

/// Reads a length-prefixed string and decodes it as UTF-8.
pub fn read_string_utf8(data: &[u8], offset: &mut usize) -> KeelResult<String> {
    let bytes = read_string(data, offset)?;
    String::from_utf8(bytes)
        .map_err(|_| KeelError::Protocol("String field contains invalid UTF-8".to_string()))
}

/// Reads an mpint and returns its unsigned magnitude with the sign
/// padding byte stripped.
///
/// Negative mpints never appear in SSH key exchange; a set sign bit in
/// the first content byte without the zero pad is rejected.
pub fn read_mpint(data: &[u8], offset: &mut usize) -> KeelResult<Vec<u8>> {
    let raw = read_string(data, offset)?;
    if raw.is_empty() {
        return Ok(raw);
    }
    if raw[0] & 0x80 != 0 {
        return Err(KeelError::Protocol(
            "Negative mpint not permitted here".to_string(),
        ));
    }
    // Strip the sign pad, keep a single zero for the value zero.
    let start = raw
        .iter()
        .position(|&b| b != 0)
        .unwrap_or(raw.len().saturating_sub(1));
    Ok(raw[start..].to_vec())
}

/// Reads a name-list and splits it into its elements.
pub fn read_name_list(data: &[u8], offset: &mut usize) -> KeelResult<Vec<String>> {
    let raw = read_string(data, offset)?;
    let text = std::str::from_utf8(&raw)
        .map_err(|_| KeelError::Protocol("Name-list contains invalid UTF-8".to_string()))?;

    if text.is_empty() {
        return Ok(vec![]);
    }

    let names: Vec<String> = text.split(',').map(String::from).collect();
    for name in &names {
        if !is_valid_name(name) {
            return Err(KeelError::Protocol(format!(
                "Illegal name-list element: '{}'",
                name
            )));
        }
    }
    Ok(names)
}

/// Encodes an mpint into a standalone byte vector.
///
/// Convenience wrapper used by the exchange-hash and key-derivation
/// paths, which hash mpint encodings directly.
pub fn mpint_bytes(magnitude: &[u8]) -> Vec<u8> {
    let mut buf = BytesMut::new();
    put_mpint(&mut buf, magnitude);
    buf.to_vec()
}

/// Encodes a string into a standalone byte vector.
pub fn string_bytes(value: &[u8]) -> Vec<u8> {
    let mut buf = BytesMut::new();
    put_string(&mut buf, value);
    buf.to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uint32_round_trip() {
        let mut buf = BytesMut::new();
        put_uint32(&mut buf, 0xdeadbeef);
        let mut offset = 0;
        assert_eq!(read_uint32(&buf, &mut offset).unwrap(), 0xdeadbeef);
        assert_eq!(offset, 4);
    }

    #[test]
    fn test_uint64_round_trip() {
        let mut buf = BytesMut::new();
        put_uint64(&mut buf, u64::MAX - 7);
        let mut offset = 0;
        assert_eq!(read_uint64(&buf, &mut offset).unwrap(), u64::MAX - 7);
    }

    #[test]
    fn test_boolean_round_trip() {
        let mut buf = BytesMut::new();
        put_boolean(&mut buf, true);
        put_boolean(&mut buf, false);
        let mut offset = 0;
        assert!(read_boolean(&buf, &mut offset).unwrap());
        assert!(!read_boolean(&buf, &mut offset).unwrap());
    }

    #[test]
    fn test_string_round_trip() {
        let mut buf = BytesMut::new();
        put_string(&mut buf, b"hello world");
        let mut offset = 0;
        assert_eq!(read_string(&buf, &mut offset).unwrap(), b"hello world");
    }

    #[test]
    fn test_string_declared_length_exceeds_data() {
        let data = [0, 0, 0, 10, b'a', b'b'];
        let mut offset = 0;
        let result = read_string(&data, &mut offset);
        assert!(matches!(result, Err(KeelError::Protocol(_))));
    }

    #[test]
    fn test_uint32_truncated() {
        let data = [0, 0, 1];
        let mut offset = 0;
        assert!(read_uint32(&data, &mut offset).is_err());
    }

    #[test]
    fn test_mpint_zero() {
        let mut buf = BytesMut::new();
        put_mpint(&mut buf, &[]);
        assert_eq!(&buf[..], &[0, 0, 0, 0]);

        let mut buf = BytesMut::new();
        put_mpint(&mut buf, &[0, 0, 0]);
        assert_eq!(&buf[..], &[0, 0, 0, 0]);
    }

    #[test]
    fn test_mpint_sign_padding() {
        // High bit set: needs a leading zero byte
        let mut buf = BytesMut::new();
        put_mpint(&mut buf, &[0x80, 0x01]);
        assert_eq!(&buf[..], &[0, 0, 0, 3, 0x00, 0x80, 0x01]);

        // High bit clear: no padding
        let mut buf = BytesMut::new();
        put_mpint(&mut buf, &[0x7f, 0x01]);
        assert_eq!(&buf[..], &[0, 0, 0, 2, 0x7f, 0x01]);
    }

    #[test]
    fn test_mpint_leading_zeros_trimmed() {
        let mut buf = BytesMut::new();
        put_mpint(&mut buf, &[0x00, 0x00, 0x12, 0x34]);
        assert_eq!(&buf[..], &[0, 0, 0, 2, 0x12, 0x34]);
    }

    #[test]
    fn test_mpint_round_trip() {
        for magnitude in [&[0x12u8, 0x34][..], &[0xff, 0x00, 0x01], &[0x01]] {
            let mut buf = BytesMut::new();
            put_mpint(&mut buf, magnitude);
            let mut offset = 0;
            let decoded = read_mpint(&buf, &mut offset).unwrap();
            assert_eq!(decoded, magnitude);
            assert_eq!(offset, buf.len());
        }
    }

    #[test]
    fn test_mpint_rejects_negative() {
        // string of length 1 whose high bit is set, no sign pad
        let data = [0, 0, 0, 1, 0x80];
        let mut offset = 0;
        assert!(read_mpint(&data, &mut offset).is_err());
    }

    #[test]
    fn test_name_list_round_trip() {
        let names = vec![
            "aes128-ctr".to_string(),
            "aes256-ctr".to_string(),
            "hmac-sha2-256".to_string(),
        ];
        let mut buf = BytesMut::new();
        put_name_list(&mut buf, &names);
        let mut offset = 0;
        assert_eq!(read_name_list(&buf, &mut offset).unwrap(), names);
    }

    #[test]
    fn test_name_list_empty() {
        let mut buf = BytesMut::new();
        put_name_list(&mut buf, &[]);
        let mut offset = 0;
        assert!(read_name_list(&buf, &mut offset).unwrap().is_empty());
    }

    #[test]
    fn test_name_list_rejects_non_ascii() {
        let mut buf = BytesMut::new();
        put_string(&mut buf, "caf\u{e9},none".as_bytes());
        let mut offset = 0;
        assert!(read_name_list(&buf, &mut offset).is_err());
    }

    #[test]
    fn test_name_list_rejects_empty_element() {
        let mut buf = BytesMut::new();
        put_string(&mut buf, b"aes128-ctr,,none");
        let mut offset = 0;
        assert!(read_name_list(&buf, &mut offset).is_err());
    }

    #[test]
    fn test_is_valid_name() {
        assert!(is_valid_name("zlib@openssh.com"));
        assert!(!is_valid_name(""));
        assert!(!is_valid_name("a,b"));
        assert!(!is_valid_name("with space"));
    }
}
