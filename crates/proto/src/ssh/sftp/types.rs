//! SFTP data types: open modes, file attributes, directory entries.
//!
//! [`FileAttributes`] speaks both wire dialects: the version 3 layout
//! (uid/gid pair, combined access/modify time pair) and the version 4
//! layout (type byte, owner/group name strings, separate access,
//! creation and modification times). The encoders and decoders take
//! the negotiated protocol version; the plain `to_bytes`/`from_bytes`
//! pair stays on version 3 for the callers that never negotiate
//! higher.

use crate::ssh::codec;
use bytes::BytesMut;
use keel_platform::{KeelError, KeelResult};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// File open mode requested by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Open for reading.
    Read,
    /// Open for writing.
    Write,
    /// All writes append.
    Append,
    /// Create if missing.
    Create,
    /// Truncate to zero length.
    Truncate,
    /// Fail if the file exists.
    Exclusive,
}

/// SSH_FXF_READ
pub const FXF_READ: u32 = 0x0000_0001;
/// SSH_FXF_WRITE
pub const FXF_WRITE: u32 = 0x0000_0002;
/// SSH_FXF_APPEND
pub const FXF_APPEND: u32 = 0x0000_0004;
/// SSH_FXF_CREAT
pub const FXF_CREAT: u32 = 0x0000_0008;
/// SSH_FXF_TRUNC
pub const FXF_TRUNC: u32 = 0x0000_0010;
/// SSH_FXF_EXCL
pub const FXF_EXCL: u32 = 0x0000_0020;

/// Maps caller open modes to the SFTP pflags bitset.
///
/// # Errors
///
/// [`KeelError::InvalidArgument`] for `Exclusive` without `Create` (the
/// protocol gives the combination no meaning), rejected before any wire
/// traffic.
pub fn pflags(modes: &[OpenMode]) -> KeelResult<u32> {
    let mut flags = 0u32;
    for mode in modes {
        flags |= match mode {
            OpenMode::Read => FXF_READ,
            OpenMode::Write => FXF_WRITE,
            OpenMode::Append => FXF_APPEND,
            OpenMode::Create => FXF_CREAT,
            OpenMode::Truncate => FXF_TRUNC,
            OpenMode::Exclusive => FXF_EXCL,
        };
    }
    if flags & FXF_EXCL != 0 && flags & FXF_CREAT == 0 {
        return Err(KeelError::InvalidArgument(
            "Exclusive open requires Create".to_string(),
        ));
    }
    Ok(flags)
}

/// Rename behaviour.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyMode {
    /// Atomic rename (POSIX semantics), via the
    /// `posix-rename@openssh.com` extension.
    Atomic,
    /// Overwrite an existing target; also served by the POSIX rename
    /// extension, which replaces the target atomically.
    Overwrite,
}

/// An opaque server-issued handle naming an open file or directory.
///
/// Valid from OPEN/OPENDIR until CLOSE is acknowledged; the bytes mean
/// nothing to the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handle(pub(crate) Vec<u8>);

impl Handle {
    /// Wraps raw handle bytes received from the server.
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// The raw handle bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// SSH_FILEXFER_ATTR_SIZE
pub const ATTR_SIZE: u32 = 0x0000_0001;
/// SSH_FILEXFER_ATTR_UIDGID (version 3 only)
pub const ATTR_UIDGID: u32 = 0x0000_0002;
/// SSH_FILEXFER_ATTR_PERMISSIONS
pub const ATTR_PERMISSIONS: u32 = 0x0000_0004;
/// SSH_FILEXFER_ATTR_ACMODTIME (version 3: atime and mtime as a pair)
pub const ATTR_ACMODTIME: u32 = 0x0000_0008;
/// SSH_FILEXFER_ATTR_ACCESSTIME (version 4+; reuses the v3 pair's bit)
pub const ATTR_ACCESSTIME: u32 = 0x0000_0008;
/// SSH_FILEXFER_ATTR_CREATETIME (version 4+)
pub const ATTR_CREATETIME: u32 = 0x0000_0010;
/// SSH_FILEXFER_ATTR_MODIFYTIME (version 4+)
pub const ATTR_MODIFYTIME: u32 = 0x0000_0020;
/// SSH_FILEXFER_ATTR_OWNERGROUP (version 4+)
pub const ATTR_OWNERGROUP: u32 = 0x0000_0080;
/// SSH_FILEXFER_ATTR_EXTENDED
pub const ATTR_EXTENDED: u32 = 0x8000_0000;

const KNOWN_FLAGS_V3: u32 =
    ATTR_SIZE | ATTR_UIDGID | ATTR_PERMISSIONS | ATTR_ACMODTIME | ATTR_EXTENDED;

const KNOWN_FLAGS_V4: u32 = ATTR_SIZE
    | ATTR_PERMISSIONS
    | ATTR_ACCESSTIME
    | ATTR_CREATETIME
    | ATTR_MODIFYTIME
    | ATTR_OWNERGROUP
    | ATTR_EXTENDED;

/// SSH_FILEXFER_TYPE_REGULAR (version 4+ type byte)
pub const TYPE_REGULAR: u8 = 1;
/// SSH_FILEXFER_TYPE_DIRECTORY
pub const TYPE_DIRECTORY: u8 = 2;
/// SSH_FILEXFER_TYPE_SYMLINK
pub const TYPE_SYMLINK: u8 = 3;
/// SSH_FILEXFER_TYPE_SPECIAL
pub const TYPE_SPECIAL: u8 = 4;
/// SSH_FILEXFER_TYPE_UNKNOWN
pub const TYPE_UNKNOWN: u8 = 5;

const S_IFMT: u32 = 0o170000;
const S_IFREG: u32 = 0o100000;
const S_IFDIR: u32 = 0o040000;
const S_IFLNK: u32 = 0o120000;

/// File attributes: a flag bitset plus the fields whose bits are set.
///
/// Only flagged fields are transmitted or trusted. Flag bits this
/// implementation does not know are preserved together with their
/// field bytes, so re-encoding a decoded value is byte-identical even
/// against future protocol versions.
///
/// Each time field converts from its own integer: `access_time`,
/// `create_time` and `modify_time` never read one another's values.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileAttributes {
    flags: u32,
    /// File type byte (version 4+; derived from the permission bits
    /// when absent).
    pub file_type: Option<u8>,
    /// File size in bytes.
    pub size: Option<u64>,
    /// Owner uid (version 3).
    pub uid: Option<u32>,
    /// Owner gid (version 3).
    pub gid: Option<u32>,
    /// Owner name (version 4+).
    pub owner: Option<String>,
    /// Group name (version 4+).
    pub group: Option<String>,
    /// POSIX permission and file-type bits.
    pub permissions: Option<u32>,
    /// Access time, seconds since the epoch.
    pub atime: Option<u64>,
    /// Creation time, seconds since the epoch (version 4+).
    pub createtime: Option<u64>,
    /// Modification time, seconds since the epoch.
    pub mtime: Option<u64>,
    /// Extended (name, data) pairs.
    pub extended: Vec<(Vec<u8>, Vec<u8>)>,
    /// Raw bytes of fields carried by unknown flag bits.
    opaque_tail: Vec<u8>,
}

impl FileAttributes {
    /// Creates empty attributes (no flags set).
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the size field.
    pub fn set_size(&mut self, size: u64) -> &mut Self {
        self.flags |= ATTR_SIZE;
        self.size = Some(size);
        self
    }

    /// Sets uid and gid (version 3 transmits them together).
    pub fn set_uid_gid(&mut self, uid: u32, gid: u32) -> &mut Self {
        self.flags |= ATTR_UIDGID;
        self.uid = Some(uid);
        self.gid = Some(gid);
        self
    }

    /// Sets owner and group names (version 4+).
    pub fn set_owner_group(&mut self, owner: &str, group: &str) -> &mut Self {
        self.flags |= ATTR_OWNERGROUP;
        self.owner = Some(owner.to_string());
        self.group = Some(group.to_string());
        self
    }

    /// Sets the permission bits.
    pub fn set_permissions(&mut self, permissions: u32) -> &mut Self {
        self.flags |= ATTR_PERMISSIONS;
        self.permissions = Some(permissions);
        self
    }

    /// Sets access and modification times together (the version 3
    /// pair).
    pub fn set_times(&mut self, atime: u64, mtime: u64) -> &mut Self {
        self.flags |= ATTR_ACMODTIME;
        self.atime = Some(atime);
        self.mtime = Some(mtime);
        self
    }

    /// Sets the access time alone (version 4+).
    pub fn set_access_time(&mut self, atime: u64) -> &mut Self {
        self.flags |= ATTR_ACCESSTIME;
        self.atime = Some(atime);
        self
    }

    /// Sets the creation time alone (version 4+).
    pub fn set_create_time(&mut self, createtime: u64) -> &mut Self {
        self.flags |= ATTR_CREATETIME;
        self.createtime = Some(createtime);
        self
    }

    /// Sets the modification time alone (version 4+).
    pub fn set_modify_time(&mut self, mtime: u64) -> &mut Self {
        self.flags |= ATTR_MODIFYTIME;
        self.mtime = Some(mtime);
        self
    }

    /// Adds an extended pair.
    pub fn add_extended(&mut self, name: &[u8], data: &[u8]) -> &mut Self {
        self.flags |= ATTR_EXTENDED;
        self.extended.push((name.to_vec(), data.to_vec()));
        self
    }

    /// The raw flag bitset.
    pub fn flags(&self) -> u32 {
        self.flags
    }

    /// Whether this describes a regular file.
    pub fn is_regular_file(&self) -> bool {
        self.file_type == Some(TYPE_REGULAR)
            || self
                .permissions
                .is_some_and(|permissions| permissions & S_IFMT == S_IFREG)
    }

    /// Whether this describes a directory.
    pub fn is_directory(&self) -> bool {
        self.file_type == Some(TYPE_DIRECTORY)
            || self
                .permissions
                .is_some_and(|permissions| permissions & S_IFMT == S_IFDIR)
    }

    /// Whether this describes a symlink.
    pub fn is_symlink(&self) -> bool {
        self.file_type == Some(TYPE_SYMLINK)
            || self
                .permissions
                .is_some_and(|permissions| permissions & S_IFMT == S_IFLNK)
    }

    /// Access time as a [`SystemTime`], computed from `atime`.
    pub fn access_time(&self) -> Option<SystemTime> {
        self.atime
            .map(|seconds| UNIX_EPOCH + Duration::from_secs(seconds))
    }

    /// Creation time as a [`SystemTime`], computed from `createtime`.
    pub fn create_time(&self) -> Option<SystemTime> {
        self.createtime
            .map(|seconds| UNIX_EPOCH + Duration::from_secs(seconds))
    }

    /// Modification time as a [`SystemTime`], computed from `mtime`.
    pub fn modify_time(&self) -> Option<SystemTime> {
        self.mtime
            .map(|seconds| UNIX_EPOCH + Duration::from_secs(seconds))
    }

    fn derived_type(&self) -> u8 {
        if let Some(file_type) = self.file_type {
            return file_type;
        }
        match self.permissions.map(|permissions| permissions & S_IFMT) {
            Some(S_IFREG) => TYPE_REGULAR,
            Some(S_IFDIR) => TYPE_DIRECTORY,
            Some(S_IFLNK) => TYPE_SYMLINK,
            Some(_) => TYPE_SPECIAL,
            None => TYPE_UNKNOWN,
        }
    }

    /// Serializes for the negotiated protocol version.
    pub fn to_bytes_versioned(&self, version: u32) -> Vec<u8> {
        if version >= 4 {
            self.to_bytes_v4()
        } else {
            self.to_bytes()
        }
    }

    /// Parses for the negotiated protocol version, returning the value
    /// and the bytes consumed.
    pub fn from_bytes_versioned(data: &[u8], version: u32) -> KeelResult<(Self, usize)> {
        if version >= 4 {
            Self::from_bytes_v4(data)
        } else {
            Self::from_bytes(data)
        }
    }

    /// Serializes in the version 3 wire order: flags first, then each
    /// flagged field, unknown-field bytes and extended pairs last.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        codec::put_uint32(&mut buf, self.flags);
        if let Some(size) = self.size {
            codec::put_uint64(&mut buf, size);
        }
        if let (Some(uid), Some(gid)) = (self.uid, self.gid) {
            codec::put_uint32(&mut buf, uid);
            codec::put_uint32(&mut buf, gid);
        }
        if let Some(permissions) = self.permissions {
            codec::put_uint32(&mut buf, permissions);
        }
        if let (Some(atime), Some(mtime)) = (self.atime, self.mtime) {
            codec::put_uint32(&mut buf, atime as u32);
            codec::put_uint32(&mut buf, mtime as u32);
        }
        if !self.opaque_tail.is_empty() {
            buf.extend_from_slice(&self.opaque_tail);
        } else if self.flags & ATTR_EXTENDED != 0 {
            codec::put_uint32(&mut buf, self.extended.len() as u32);
            for (name, data) in &self.extended {
                codec::put_string(&mut buf, name);
                codec::put_string(&mut buf, data);
            }
        }
        buf.to_vec()
    }

    /// Parses the version 3 layout, returning the value and the bytes
    /// consumed.
    ///
    /// Fields behind unknown flag bits (and everything after them) are
    /// captured verbatim so the value re-encodes identically.
    pub fn from_bytes(data: &[u8]) -> KeelResult<(Self, usize)> {
        let mut offset = 0;
        let flags = codec::read_uint32(data, &mut offset)?;
        let mut attrs = Self {
            flags,
            ..Self::default()
        };

        if flags & ATTR_SIZE != 0 {
            attrs.size = Some(codec::read_uint64(data, &mut offset)?);
        }
        if flags & ATTR_UIDGID != 0 {
            attrs.uid = Some(codec::read_uint32(data, &mut offset)?);
            attrs.gid = Some(codec::read_uint32(data, &mut offset)?);
        }
        if flags & ATTR_PERMISSIONS != 0 {
            attrs.permissions = Some(codec::read_uint32(data, &mut offset)?);
        }
        if flags & ATTR_ACMODTIME != 0 {
            attrs.atime = Some(u64::from(codec::read_uint32(data, &mut offset)?));
            attrs.mtime = Some(u64::from(codec::read_uint32(data, &mut offset)?));
        }

        if flags & !KNOWN_FLAGS_V3 != 0 {
            // Unknown bits: preserve the remainder byte for byte.
            attrs.opaque_tail = data[offset..].to_vec();
            offset = data.len();
        } else if flags & ATTR_EXTENDED != 0 {
            Self::read_extended(data, &mut offset, &mut attrs)?;
        }

        Ok((attrs, offset))
    }

    /// Serializes in the version 4 wire order: flags, type byte, then
    /// each flagged field.
    ///
    /// The flag word is recomputed from the present fields under the
    /// version 4 bit assignments, so a value built through the v3
    /// setters still encodes correctly.
    fn to_bytes_v4(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();

        if !self.opaque_tail.is_empty() {
            codec::put_uint32(&mut buf, self.flags);
            buf.extend_from_slice(&self.opaque_tail);
            return buf.to_vec();
        }

        let mut flags = 0u32;
        if self.size.is_some() {
            flags |= ATTR_SIZE;
        }
        if self.owner.is_some() && self.group.is_some() {
            flags |= ATTR_OWNERGROUP;
        }
        if self.permissions.is_some() {
            flags |= ATTR_PERMISSIONS;
        }
        if self.atime.is_some() {
            flags |= ATTR_ACCESSTIME;
        }
        if self.createtime.is_some() {
            flags |= ATTR_CREATETIME;
        }
        if self.mtime.is_some() {
            flags |= ATTR_MODIFYTIME;
        }
        if !self.extended.is_empty() {
            flags |= ATTR_EXTENDED;
        }

        codec::put_uint32(&mut buf, flags);
        codec::put_byte(&mut buf, self.derived_type());
        if let Some(size) = self.size {
            codec::put_uint64(&mut buf, size);
        }
        if let (Some(owner), Some(group)) = (&self.owner, &self.group) {
            codec::put_string_utf8(&mut buf, owner);
            codec::put_string_utf8(&mut buf, group);
        }
        if let Some(permissions) = self.permissions {
            codec::put_uint32(&mut buf, permissions);
        }
        if let Some(atime) = self.atime {
            codec::put_uint64(&mut buf, atime);
        }
        if let Some(createtime) = self.createtime {
            codec::put_uint64(&mut buf, createtime);
        }
        if let Some(mtime) = self.mtime {
            codec::put_uint64(&mut buf, mtime);
        }
        if !self.extended.is_empty() {
            codec::put_uint32(&mut buf, self.extended.len() as u32);
            for (name, data) in &self.extended {
                codec::put_string(&mut buf, name);
                codec::put_string(&mut buf, data);
            }
        }
        buf.to_vec()
    }

    /// Parses the version 4 layout.
    ///
    /// Unknown flag bits (subsecond times, ACLs) change the layout of
    /// the fields that follow them, so their presence turns everything
    /// after the flag word into an opaque, byte-preserved tail.
    fn from_bytes_v4(data: &[u8]) -> KeelResult<(Self, usize)> {
        let mut offset = 0;
        let flags = codec::read_uint32(data, &mut offset)?;
        let mut attrs = Self {
            flags,
            ..Self::default()
        };

        if flags & !KNOWN_FLAGS_V4 != 0 {
            attrs.opaque_tail = data[offset..].to_vec();
            return Ok((attrs, data.len()));
        }

        attrs.file_type = Some(codec::read_byte(data, &mut offset)?);
        if flags & ATTR_SIZE != 0 {
            attrs.size = Some(codec::read_uint64(data, &mut offset)?);
        }
        if flags & ATTR_OWNERGROUP != 0 {
            attrs.owner = Some(codec::read_string_utf8(data, &mut offset)?);
            attrs.group = Some(codec::read_string_utf8(data, &mut offset)?);
        }
        if flags & ATTR_PERMISSIONS != 0 {
            attrs.permissions = Some(codec::read_uint32(data, &mut offset)?);
        }
        if flags & ATTR_ACCESSTIME != 0 {
            attrs.atime = Some(codec::read_uint64(data, &mut offset)?);
        }
        if flags & ATTR_CREATETIME != 0 {
            attrs.createtime = Some(codec::read_uint64(data, &mut offset)?);
        }
        if flags & ATTR_MODIFYTIME != 0 {
            attrs.mtime = Some(codec::read_uint64(data, &mut offset)?);
        }
        if flags & ATTR_EXTENDED != 0 {
            Self::read_extended(data, &mut offset, &mut attrs)?;
        }

        Ok((attrs, offset))
    }

    fn read_extended(data: &[u8], offset: &mut usize, attrs: &mut Self) -> KeelResult<()> {
        let count = codec::read_uint32(data, offset)? as usize;
        if count > 1024 {
            return Err(KeelError::Protocol(format!(
                "Unreasonable extended attribute count: {}",
                count
            )));
        }
        for _ in 0..count {
            let name = codec::read_string(data, offset)?;
            let value = codec::read_string(data, offset)?;
            attrs.extended.push((name, value));
        }
        Ok(())
    }
}

/// One directory entry from READDIR.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    /// File name relative to the directory.
    pub filename: String,
    /// Server-formatted `ls -l` style line (version 3 only; empty when
    /// version 4+ was negotiated). Display only; its layout is not
    /// specified and must not be parsed.
    pub longname: String,
    /// Entry attributes.
    pub attributes: FileAttributes,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pflags_mapping() {
        assert_eq!(pflags(&[OpenMode::Read]).unwrap(), 0x1);
        assert_eq!(pflags(&[OpenMode::Write]).unwrap(), 0x2);
        assert_eq!(
            pflags(&[OpenMode::Write, OpenMode::Create, OpenMode::Truncate]).unwrap(),
            0x2 | 0x8 | 0x10
        );
        assert_eq!(
            pflags(&[OpenMode::Create, OpenMode::Exclusive]).unwrap(),
            0x8 | 0x20
        );
        assert_eq!(pflags(&[OpenMode::Append]).unwrap(), 0x4);
    }

    #[test]
    fn test_exclusive_without_create_rejected_locally() {
        let result = pflags(&[OpenMode::Write, OpenMode::Exclusive]);
        assert!(matches!(result, Err(KeelError::InvalidArgument(_))));
    }

    #[test]
    fn test_attributes_round_trip_known_fields() {
        let mut attrs = FileAttributes::new();
        attrs
            .set_size(1_048_576)
            .set_uid_gid(1000, 1000)
            .set_permissions(0o100644)
            .set_times(1700000000, 1700000100);

        let bytes = attrs.to_bytes();
        let (parsed, consumed) = FileAttributes::from_bytes(&bytes).unwrap();
        assert_eq!(consumed, bytes.len());
        assert_eq!(parsed, attrs);
        assert_eq!(parsed.to_bytes(), bytes);
    }

    #[test]
    fn test_attributes_empty() {
        let attrs = FileAttributes::new();
        let bytes = attrs.to_bytes();
        assert_eq!(bytes, vec![0, 0, 0, 0]);
        let (parsed, consumed) = FileAttributes::from_bytes(&bytes).unwrap();
        assert_eq!(consumed, 4);
        assert_eq!(parsed, attrs);
    }

    #[test]
    fn test_attributes_extended_round_trip() {
        let mut attrs = FileAttributes::new();
        attrs.set_size(7);
        attrs.add_extended(b"acl@example", b"\x01\x02");

        let bytes = attrs.to_bytes();
        let (parsed, _) = FileAttributes::from_bytes(&bytes).unwrap();
        assert_eq!(parsed.extended.len(), 1);
        assert_eq!(parsed.to_bytes(), bytes);
    }

    #[test]
    fn test_unknown_flags_preserved_byte_for_byte() {
        // A future-version field behind an unknown bit (0x00000100).
        let mut wire = Vec::new();
        wire.extend_from_slice(&(ATTR_SIZE | 0x0000_0100).to_be_bytes());
        wire.extend_from_slice(&42u64.to_be_bytes()); // size
        wire.extend_from_slice(&[0xde, 0xad, 0xbe, 0xef, 0x01]); // unknown field bytes

        let (parsed, consumed) = FileAttributes::from_bytes(&wire).unwrap();
        assert_eq!(consumed, wire.len());
        assert_eq!(parsed.size, Some(42));
        // Round-trip is identity despite the unknown bit.
        assert_eq!(parsed.to_bytes(), wire);
    }

    #[test]
    fn test_v4_round_trip_owner_group_and_times() {
        let mut attrs = FileAttributes::new();
        attrs
            .set_size(4096)
            .set_owner_group("smx", "staff")
            .set_permissions(0o100600)
            .set_access_time(1000)
            .set_create_time(2000)
            .set_modify_time(3000);

        let bytes = attrs.to_bytes_versioned(4);
        let (parsed, consumed) = FileAttributes::from_bytes_versioned(&bytes, 4).unwrap();
        assert_eq!(consumed, bytes.len());
        assert_eq!(parsed.size, Some(4096));
        assert_eq!(parsed.owner.as_deref(), Some("smx"));
        assert_eq!(parsed.group.as_deref(), Some("staff"));
        assert_eq!(parsed.file_type, Some(TYPE_REGULAR));
        assert_eq!(parsed.atime, Some(1000));
        assert_eq!(parsed.createtime, Some(2000));
        assert_eq!(parsed.mtime, Some(3000));
        // Re-encoding a decoded value is identity.
        assert_eq!(parsed.to_bytes_versioned(4), bytes);
    }

    #[test]
    fn test_v4_each_time_converts_from_its_own_integer() {
        // Three deliberately different integers; each accessor must
        // reflect its own field only.
        let mut attrs = FileAttributes::new();
        attrs
            .set_access_time(1000)
            .set_create_time(2000)
            .set_modify_time(3000);

        let access = attrs.access_time().unwrap();
        let create = attrs.create_time().unwrap();
        let modify = attrs.modify_time().unwrap();
        assert_eq!(
            create.duration_since(access).unwrap(),
            Duration::from_secs(1000)
        );
        assert_eq!(
            modify.duration_since(create).unwrap(),
            Duration::from_secs(1000)
        );

        // And the wire preserves the distinction.
        let bytes = attrs.to_bytes_versioned(4);
        let (parsed, _) = FileAttributes::from_bytes_versioned(&bytes, 4).unwrap();
        assert_eq!(parsed.atime, Some(1000));
        assert_eq!(parsed.createtime, Some(2000));
        assert_eq!(parsed.mtime, Some(3000));
    }

    #[test]
    fn test_v4_type_byte_round_trip() {
        let mut attrs = FileAttributes::new();
        attrs.set_permissions(0o040755);
        let bytes = attrs.to_bytes_versioned(4);
        let (parsed, _) = FileAttributes::from_bytes_versioned(&bytes, 4).unwrap();
        assert_eq!(parsed.file_type, Some(TYPE_DIRECTORY));
        assert!(parsed.is_directory());

        // A bare type byte is enough for the type helpers.
        let mut link = FileAttributes::new();
        link.file_type = Some(TYPE_SYMLINK);
        assert!(link.is_symlink());
    }

    #[test]
    fn test_v4_unknown_flags_preserved_byte_for_byte() {
        // Subsecond times (0x100) change the time-field layout, so the
        // whole remainder is preserved opaquely.
        let mut wire = Vec::new();
        wire.extend_from_slice(&(ATTR_SIZE | 0x0000_0100).to_be_bytes());
        wire.push(TYPE_REGULAR);
        wire.extend_from_slice(&7u64.to_be_bytes());
        wire.extend_from_slice(&[0x01, 0x02, 0x03, 0x04]);

        let (parsed, consumed) = FileAttributes::from_bytes_versioned(&wire, 4).unwrap();
        assert_eq!(consumed, wire.len());
        // Nothing past the flag word was interpreted.
        assert!(parsed.size.is_none());
        assert_eq!(parsed.to_bytes_versioned(4), wire);
    }

    #[test]
    fn test_v3_setters_encode_under_v4() {
        // Values built through the v3 pair setter still carry both
        // times when encoded for a v4 peer.
        let mut attrs = FileAttributes::new();
        attrs.set_times(111, 222);
        let bytes = attrs.to_bytes_versioned(4);
        let (parsed, _) = FileAttributes::from_bytes_versioned(&bytes, 4).unwrap();
        assert_eq!(parsed.atime, Some(111));
        assert_eq!(parsed.mtime, Some(222));
        assert!(parsed.createtime.is_none());
    }

    #[test]
    fn test_file_type_helpers() {
        let mut attrs = FileAttributes::new();
        attrs.set_permissions(0o100644);
        assert!(attrs.is_regular_file());
        assert!(!attrs.is_directory());

        let mut dir = FileAttributes::new();
        dir.set_permissions(0o040755);
        assert!(dir.is_directory());

        let mut link = FileAttributes::new();
        link.set_permissions(0o120777);
        assert!(link.is_symlink());
    }

    #[test]
    fn test_times_convert_from_their_own_fields() {
        // atime and mtime each convert from their own integer; a
        // mismatch between the two must survive conversion.
        let mut attrs = FileAttributes::new();
        attrs.set_times(1000, 2000);

        let access = attrs.access_time().unwrap();
        let modify = attrs.modify_time().unwrap();
        assert_eq!(
            modify.duration_since(access).unwrap(),
            Duration::from_secs(1000)
        );
    }

    #[test]
    fn test_truncated_attributes_rejected() {
        let mut wire = Vec::new();
        wire.extend_from_slice(&ATTR_SIZE.to_be_bytes());
        wire.extend_from_slice(&[0, 0]); // half a size field
        assert!(FileAttributes::from_bytes(&wire).is_err());
        assert!(FileAttributes::from_bytes_versioned(&wire, 4).is_err());
    }
}
