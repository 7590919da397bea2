//! In-memory SFTP responder.
//!
//! A server over a flat in-memory filesystem, negotiating protocol
//! version 3 or 4 (capping lower via [`MemorySftpServer::limit_version`]).
//! It speaks raw SFTP frames (`handle_frame` maps one request frame to
//! one response frame), so it plugs into anything that can shuttle
//! channel data: the loopback test rigs here, or a real server session.
//!
//! Paths are normalised to absolute form; intermediate directories are
//! implied by their children (like an object store), plus any created
//! explicitly with MKDIR.

use super::message::{SftpMessage, SftpMessageType, SFTP_VERSION};
use super::types::{
    FileAttributes, ATTR_SIZE, FXF_APPEND, FXF_CREAT, FXF_EXCL, FXF_READ, FXF_TRUNC, FXF_WRITE,
};
use crate::ssh::codec;
use bytes::BytesMut;
use keel_platform::{KeelResult, SftpStatusCode};
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Entries per READDIR batch.
const READDIR_BATCH: usize = 100;

struct OpenHandle {
    path: String,
    /// Directory snapshot taken at OPENDIR time; `None` for files.
    dir_entries: Option<Vec<String>>,
    cursor: usize,
    append: bool,
}

/// In-memory SFTP server state.
pub struct MemorySftpServer {
    files: BTreeMap<String, Vec<u8>>,
    dirs: BTreeSet<String>,
    symlinks: BTreeMap<String, String>,
    permissions: HashMap<String, u32>,
    handles: HashMap<u32, OpenHandle>,
    next_handle: u32,
    /// Version governing the session, set by INIT (version 3 until
    /// the client negotiates higher).
    version: u32,
    /// Highest version this server will agree to.
    max_version: u32,
}

impl Default for MemorySftpServer {
    fn default() -> Self {
        Self {
            files: BTreeMap::new(),
            dirs: BTreeSet::new(),
            symlinks: BTreeMap::new(),
            permissions: HashMap::new(),
            handles: HashMap::new(),
            next_handle: 0,
            version: 3,
            max_version: SFTP_VERSION,
        }
    }
}

impl MemorySftpServer {
    /// Creates an empty filesystem.
    pub fn new() -> Self {
        Self::default()
    }

    /// Caps the version this server will negotiate (for exercising the
    /// version 3 wire paths against a version 4 capable client).
    pub fn limit_version(&mut self, version: u32) {
        self.max_version = version.clamp(3, SFTP_VERSION);
    }

    /// The version governing the session after INIT.
    pub fn version(&self) -> u32 {
        self.version
    }

    /// Seeds a file.
    pub fn add_file(&mut self, path: &str, contents: Vec<u8>) {
        self.files.insert(normalize(path), contents);
    }

    /// Returns a file's contents, if present.
    pub fn file(&self, path: &str) -> Option<&[u8]> {
        self.files.get(&normalize(path)).map(Vec::as_slice)
    }

    /// Handles one request frame (type byte + payload), returning the
    /// complete length-prefixed response bytes.
    pub fn handle_frame(&mut self, frame: &[u8]) -> Vec<u8> {
        match self.dispatch(frame) {
            Ok(response) => response.to_bytes(),
            Err(_) => {
                // Unparseable request: answer BAD_MESSAGE with id 0.
                status(0, SftpStatusCode::BadMessage).to_bytes()
            }
        }
    }

    fn dispatch(&mut self, frame: &[u8]) -> KeelResult<SftpMessage> {
        let message = SftpMessage::from_frame(frame)?;
        let payload = &message.payload;

        if message.msg_type == SftpMessageType::Init {
            let mut offset = 0;
            let client_version = codec::read_uint32(payload, &mut offset)?;
            self.version = client_version.min(self.max_version).max(3);

            let mut buf = BytesMut::new();
            codec::put_uint32(&mut buf, self.version);
            for name in ["posix-rename@openssh.com", "hardlink@openssh.com"] {
                codec::put_string_utf8(&mut buf, name);
                codec::put_string_utf8(&mut buf, "1");
            }
            return Ok(SftpMessage::new(SftpMessageType::Version, buf.to_vec()));
        }

        let mut offset = 0;
        let id = codec::read_uint32(payload, &mut offset)?;

        let result = match message.msg_type {
            SftpMessageType::Open => self.op_open(id, payload, &mut offset),
            SftpMessageType::Close => self.op_close(id, payload, &mut offset),
            SftpMessageType::Read => self.op_read(id, payload, &mut offset),
            SftpMessageType::Write => self.op_write(id, payload, &mut offset),
            SftpMessageType::OpenDir => self.op_opendir(id, payload, &mut offset),
            SftpMessageType::ReadDir => self.op_readdir(id, payload, &mut offset),
            SftpMessageType::Remove => self.op_remove(id, payload, &mut offset),
            SftpMessageType::MkDir => self.op_mkdir(id, payload, &mut offset),
            SftpMessageType::RmDir => self.op_rmdir(id, payload, &mut offset),
            SftpMessageType::Rename => self.op_rename(id, payload, &mut offset, false),
            SftpMessageType::Stat | SftpMessageType::LStat => {
                self.op_stat(id, payload, &mut offset, message.msg_type)
            }
            SftpMessageType::FStat => self.op_fstat(id, payload, &mut offset),
            SftpMessageType::SetStat => self.op_setstat(id, payload, &mut offset),
            SftpMessageType::FSetStat => self.op_fsetstat(id, payload, &mut offset),
            SftpMessageType::RealPath => self.op_realpath(id, payload, &mut offset),
            SftpMessageType::ReadLink => self.op_readlink(id, payload, &mut offset),
            SftpMessageType::Symlink => self.op_symlink(id, payload, &mut offset),
            SftpMessageType::Extended => self.op_extended(id, payload, &mut offset),
            _ => Ok(status(id, SftpStatusCode::OpUnsupported)),
        };

        // Any parse failure inside an op becomes BAD_MESSAGE.
        result.or_else(|_| Ok(status(id, SftpStatusCode::BadMessage)))
    }

    fn alloc_handle(&mut self, handle: OpenHandle) -> Vec<u8> {
        let id = self.next_handle;
        self.next_handle += 1;
        self.handles.insert(id, handle);
        id.to_be_bytes().to_vec()
    }

    fn resolve_handle(&self, bytes: &[u8]) -> Option<u32> {
        let bytes: [u8; 4] = bytes.try_into().ok()?;
        let id = u32::from_be_bytes(bytes);
        self.handles.contains_key(&id).then_some(id)
    }

    fn follow(&self, path: &str) -> String {
        let mut path = path.to_string();
        // Bounded chase; loops degrade to the final name.
        for _ in 0..8 {
            match self.symlinks.get(&path) {
                Some(target) => path = target.clone(),
                None => break,
            }
        }
        path
    }

    fn dir_exists(&self, path: &str) -> bool {
        if path == "/" || self.dirs.contains(path) {
            return true;
        }
        let prefix = format!("{}/", path);
        self.files.keys().any(|k| k.starts_with(&prefix))
            || self.dirs.iter().any(|d| d.starts_with(&prefix))
    }

    fn op_open(&mut self, id: u32, payload: &[u8], offset: &mut usize) -> KeelResult<SftpMessage> {
        let path = normalize(&codec::read_string_utf8(payload, offset)?);
        let flags = codec::read_uint32(payload, offset)?;
        let _attrs = FileAttributes::from_bytes_versioned(&payload[*offset..], self.version)?;

        let path = self.follow(&path);
        let exists = self.files.contains_key(&path);

        if flags & FXF_CREAT == 0 && !exists {
            return Ok(status(id, SftpStatusCode::NoSuchFile));
        }
        if flags & FXF_EXCL != 0 && exists {
            return Ok(status(id, SftpStatusCode::Failure));
        }
        if flags & (FXF_WRITE | FXF_READ) == 0 {
            return Ok(status(id, SftpStatusCode::BadMessage));
        }
        if flags & FXF_CREAT != 0 && !exists {
            self.files.insert(path.clone(), Vec::new());
        }
        if flags & FXF_TRUNC != 0 {
            if let Some(contents) = self.files.get_mut(&path) {
                contents.clear();
            }
        }

        let handle = self.alloc_handle(OpenHandle {
            path,
            dir_entries: None,
            cursor: 0,
            append: flags & FXF_APPEND != 0,
        });
        let mut buf = BytesMut::new();
        codec::put_uint32(&mut buf, id);
        codec::put_string(&mut buf, &handle);
        Ok(SftpMessage::new(SftpMessageType::Handle, buf.to_vec()))
    }

    fn op_close(&mut self, id: u32, payload: &[u8], offset: &mut usize) -> KeelResult<SftpMessage> {
        let handle = codec::read_string(payload, offset)?;
        match self.resolve_handle(&handle) {
            Some(key) => {
                self.handles.remove(&key);
                Ok(status(id, SftpStatusCode::Ok))
            }
            None => Ok(status(id, SftpStatusCode::Failure)),
        }
    }

    fn op_read(&mut self, id: u32, payload: &[u8], offset: &mut usize) -> KeelResult<SftpMessage> {
        let handle = codec::read_string(payload, offset)?;
        let file_offset = codec::read_uint64(payload, offset)? as usize;
        let len = codec::read_uint32(payload, offset)? as usize;

        let Some(key) = self.resolve_handle(&handle) else {
            return Ok(status(id, SftpStatusCode::Failure));
        };
        let path = self.handles[&key].path.clone();
        let Some(contents) = self.files.get(&path) else {
            return Ok(status(id, SftpStatusCode::NoSuchFile));
        };

        if file_offset >= contents.len() {
            return Ok(status(id, SftpStatusCode::Eof));
        }
        let end = (file_offset + len).min(contents.len());
        let mut buf = BytesMut::new();
        codec::put_uint32(&mut buf, id);
        codec::put_string(&mut buf, &contents[file_offset..end]);
        Ok(SftpMessage::new(SftpMessageType::Data, buf.to_vec()))
    }

    fn op_write(&mut self, id: u32, payload: &[u8], offset: &mut usize) -> KeelResult<SftpMessage> {
        let handle = codec::read_string(payload, offset)?;
        let file_offset = codec::read_uint64(payload, offset)? as usize;
        let data = codec::read_string(payload, offset)?;

        let Some(key) = self.resolve_handle(&handle) else {
            return Ok(status(id, SftpStatusCode::Failure));
        };
        let (path, append) = {
            let handle = &self.handles[&key];
            (handle.path.clone(), handle.append)
        };
        let Some(contents) = self.files.get_mut(&path) else {
            return Ok(status(id, SftpStatusCode::NoSuchFile));
        };

        let at = if append { contents.len() } else { file_offset };
        if at + data.len() > contents.len() {
            contents.resize(at + data.len(), 0);
        }
        contents[at..at + data.len()].copy_from_slice(&data);
        Ok(status(id, SftpStatusCode::Ok))
    }

    fn op_opendir(
        &mut self,
        id: u32,
        payload: &[u8],
        offset: &mut usize,
    ) -> KeelResult<SftpMessage> {
        let path = normalize(&codec::read_string_utf8(payload, offset)?);
        if !self.dir_exists(&path) {
            return Ok(status(id, SftpStatusCode::NoSuchFile));
        }

        // Snapshot the immediate children at open time.
        let prefix = if path == "/" {
            "/".to_string()
        } else {
            format!("{}/", path)
        };
        let mut names = BTreeSet::new();
        for key in self
            .files
            .keys()
            .chain(self.dirs.iter())
            .chain(self.symlinks.keys())
        {
            if let Some(rest) = key.strip_prefix(&prefix) {
                if rest.is_empty() {
                    continue;
                }
                let first = rest.split('/').next().unwrap_or(rest);
                names.insert(first.to_string());
            }
        }

        let handle = self.alloc_handle(OpenHandle {
            path,
            dir_entries: Some(names.into_iter().collect()),
            cursor: 0,
            append: false,
        });
        let mut buf = BytesMut::new();
        codec::put_uint32(&mut buf, id);
        codec::put_string(&mut buf, &handle);
        Ok(SftpMessage::new(SftpMessageType::Handle, buf.to_vec()))
    }

    fn op_readdir(
        &mut self,
        id: u32,
        payload: &[u8],
        offset: &mut usize,
    ) -> KeelResult<SftpMessage> {
        let handle = codec::read_string(payload, offset)?;
        let Some(key) = self.resolve_handle(&handle) else {
            return Ok(status(id, SftpStatusCode::Failure));
        };

        let (batch, dir_path) = {
            let state = self.handles.get_mut(&key).expect("handle resolved");
            let Some(entries) = &state.dir_entries else {
                return Ok(status(id, SftpStatusCode::Failure));
            };
            if state.cursor >= entries.len() {
                return Ok(status(id, SftpStatusCode::Eof));
            }
            let end = (state.cursor + READDIR_BATCH).min(entries.len());
            let batch: Vec<String> = entries[state.cursor..end].to_vec();
            state.cursor = end;
            (batch, state.path.clone())
        };

        let mut buf = BytesMut::new();
        codec::put_uint32(&mut buf, id);
        codec::put_uint32(&mut buf, batch.len() as u32);
        for name in &batch {
            let full = if dir_path == "/" {
                format!("/{}", name)
            } else {
                format!("{}/{}", dir_path, name)
            };
            let attrs = self.attrs_for(&full);
            codec::put_string_utf8(&mut buf, name);
            if self.version < 4 {
                codec::put_string_utf8(
                    &mut buf,
                    &format!("-rw-r--r-- 1 keel keel 0 Jan  1 00:00 {}", name),
                );
            }
            buf.extend_from_slice(&attrs.to_bytes_versioned(self.version));
        }
        Ok(SftpMessage::new(SftpMessageType::Name, buf.to_vec()))
    }

    fn attrs_for(&self, path: &str) -> FileAttributes {
        let mut attrs = FileAttributes::new();
        if let Some(contents) = self.files.get(path) {
            attrs.set_size(contents.len() as u64);
            attrs.set_permissions(self.permissions.get(path).copied().unwrap_or(0o100644));
        } else if self.symlinks.contains_key(path) {
            attrs.set_permissions(0o120777);
        } else if self.dir_exists(path) {
            attrs.set_permissions(self.permissions.get(path).copied().unwrap_or(0o040755));
        }
        if self.version >= 4 && attrs.flags() != 0 {
            attrs.set_owner_group("keel", "keel");
        }
        attrs
    }

    fn op_remove(&mut self, id: u32, payload: &[u8], offset: &mut usize) -> KeelResult<SftpMessage> {
        let path = normalize(&codec::read_string_utf8(payload, offset)?);
        if self.symlinks.remove(&path).is_some() {
            return Ok(status(id, SftpStatusCode::Ok));
        }
        match self.files.remove(&path) {
            Some(_) => Ok(status(id, SftpStatusCode::Ok)),
            None => Ok(status(id, SftpStatusCode::NoSuchFile)),
        }
    }

    fn op_mkdir(&mut self, id: u32, payload: &[u8], offset: &mut usize) -> KeelResult<SftpMessage> {
        let path = normalize(&codec::read_string_utf8(payload, offset)?);
        let _attrs = FileAttributes::from_bytes_versioned(&payload[*offset..], self.version)?;
        if self.dirs.contains(&path) || self.files.contains_key(&path) {
            return Ok(status(id, SftpStatusCode::Failure));
        }
        self.dirs.insert(path);
        Ok(status(id, SftpStatusCode::Ok))
    }

    fn op_rmdir(&mut self, id: u32, payload: &[u8], offset: &mut usize) -> KeelResult<SftpMessage> {
        let path = normalize(&codec::read_string_utf8(payload, offset)?);
        if !self.dirs.contains(&path) {
            return Ok(status(id, SftpStatusCode::NoSuchFile));
        }
        let prefix = format!("{}/", path);
        if self.files.keys().any(|k| k.starts_with(&prefix)) {
            return Ok(status(id, SftpStatusCode::Failure));
        }
        self.dirs.remove(&path);
        Ok(status(id, SftpStatusCode::Ok))
    }

    fn op_rename(
        &mut self,
        id: u32,
        payload: &[u8],
        offset: &mut usize,
        overwrite: bool,
    ) -> KeelResult<SftpMessage> {
        let old = normalize(&codec::read_string_utf8(payload, offset)?);
        let new = normalize(&codec::read_string_utf8(payload, offset)?);

        if !self.files.contains_key(&old) {
            return Ok(status(id, SftpStatusCode::NoSuchFile));
        }
        if self.files.contains_key(&new) && !overwrite {
            return Ok(status(id, SftpStatusCode::Failure));
        }
        let contents = self.files.remove(&old).expect("checked above");
        self.files.insert(new.clone(), contents);
        if let Some(perms) = self.permissions.remove(&old) {
            self.permissions.insert(new, perms);
        }
        Ok(status(id, SftpStatusCode::Ok))
    }

    fn op_stat(
        &mut self,
        id: u32,
        payload: &[u8],
        offset: &mut usize,
        which: SftpMessageType,
    ) -> KeelResult<SftpMessage> {
        let raw = normalize(&codec::read_string_utf8(payload, offset)?);
        let path = if which == SftpMessageType::Stat {
            self.follow(&raw)
        } else {
            raw
        };
        let attrs = self.attrs_for(&path);
        if attrs.flags() == 0 {
            return Ok(status(id, SftpStatusCode::NoSuchFile));
        }
        Ok(attrs_response(id, &attrs, self.version))
    }

    fn op_fstat(&mut self, id: u32, payload: &[u8], offset: &mut usize) -> KeelResult<SftpMessage> {
        let handle = codec::read_string(payload, offset)?;
        let Some(key) = self.resolve_handle(&handle) else {
            return Ok(status(id, SftpStatusCode::Failure));
        };
        let path = self.handles[&key].path.clone();
        let attrs = self.attrs_for(&path);
        Ok(attrs_response(id, &attrs, self.version))
    }

    fn op_setstat(
        &mut self,
        id: u32,
        payload: &[u8],
        offset: &mut usize,
    ) -> KeelResult<SftpMessage> {
        let path = normalize(&codec::read_string_utf8(payload, offset)?);
        let (attrs, _) = FileAttributes::from_bytes_versioned(&payload[*offset..], self.version)?;
        self.apply_setstat(&path, &attrs);
        Ok(status(id, SftpStatusCode::Ok))
    }

    fn op_fsetstat(
        &mut self,
        id: u32,
        payload: &[u8],
        offset: &mut usize,
    ) -> KeelResult<SftpMessage> {
        let handle = codec::read_string(payload, offset)?;
        let (attrs, _) = FileAttributes::from_bytes_versioned(&payload[*offset..], self.version)?;
        let Some(key) = self.resolve_handle(&handle) else {
            return Ok(status(id, SftpStatusCode::Failure));
        };
        let path = self.handles[&key].path.clone();
        self.apply_setstat(&path, &attrs);
        Ok(status(id, SftpStatusCode::Ok))
    }

    fn apply_setstat(&mut self, path: &str, attrs: &FileAttributes) {
        if let Some(permissions) = attrs.permissions {
            self.permissions.insert(path.to_string(), permissions);
        }
        if attrs.flags() & ATTR_SIZE != 0 {
            if let (Some(size), Some(contents)) = (attrs.size, self.files.get_mut(path)) {
                contents.resize(size as usize, 0);
            }
        }
    }

    fn op_realpath(
        &mut self,
        id: u32,
        payload: &[u8],
        offset: &mut usize,
    ) -> KeelResult<SftpMessage> {
        let path = normalize(&codec::read_string_utf8(payload, offset)?);
        let mut buf = BytesMut::new();
        codec::put_uint32(&mut buf, id);
        codec::put_uint32(&mut buf, 1);
        codec::put_string_utf8(&mut buf, &path);
        if self.version < 4 {
            codec::put_string_utf8(&mut buf, &path);
        }
        buf.extend_from_slice(&FileAttributes::new().to_bytes_versioned(self.version));
        Ok(SftpMessage::new(SftpMessageType::Name, buf.to_vec()))
    }

    fn op_readlink(
        &mut self,
        id: u32,
        payload: &[u8],
        offset: &mut usize,
    ) -> KeelResult<SftpMessage> {
        let path = normalize(&codec::read_string_utf8(payload, offset)?);
        let Some(target) = self.symlinks.get(&path) else {
            return Ok(status(id, SftpStatusCode::NoSuchFile));
        };
        let mut buf = BytesMut::new();
        codec::put_uint32(&mut buf, id);
        codec::put_uint32(&mut buf, 1);
        codec::put_string_utf8(&mut buf, target);
        if self.version < 4 {
            codec::put_string_utf8(&mut buf, target);
        }
        buf.extend_from_slice(&FileAttributes::new().to_bytes_versioned(self.version));
        Ok(SftpMessage::new(SftpMessageType::Name, buf.to_vec()))
    }

    fn op_symlink(
        &mut self,
        id: u32,
        payload: &[u8],
        offset: &mut usize,
    ) -> KeelResult<SftpMessage> {
        let link = normalize(&codec::read_string_utf8(payload, offset)?);
        let target = normalize(&codec::read_string_utf8(payload, offset)?);
        if self.symlinks.contains_key(&link) || self.files.contains_key(&link) {
            return Ok(status(id, SftpStatusCode::Failure));
        }
        self.symlinks.insert(link, target);
        Ok(status(id, SftpStatusCode::Ok))
    }

    fn op_extended(
        &mut self,
        id: u32,
        payload: &[u8],
        offset: &mut usize,
    ) -> KeelResult<SftpMessage> {
        let name = codec::read_string_utf8(payload, offset)?;
        match name.as_str() {
            "posix-rename@openssh.com" => self.op_rename(id, payload, offset, true),
            "hardlink@openssh.com" => {
                let existing = normalize(&codec::read_string_utf8(payload, offset)?);
                let link = normalize(&codec::read_string_utf8(payload, offset)?);
                match self.files.get(&existing).cloned() {
                    Some(contents) => {
                        self.files.insert(link, contents);
                        Ok(status(id, SftpStatusCode::Ok))
                    }
                    None => Ok(status(id, SftpStatusCode::NoSuchFile)),
                }
            }
            _ => Ok(status(id, SftpStatusCode::OpUnsupported)),
        }
    }
}

fn status(id: u32, code: SftpStatusCode) -> SftpMessage {
    let mut buf = BytesMut::new();
    codec::put_uint32(&mut buf, id);
    codec::put_uint32(&mut buf, code as u32);
    codec::put_string_utf8(&mut buf, code.message());
    codec::put_string_utf8(&mut buf, "en");
    SftpMessage::new(SftpMessageType::Status, buf.to_vec())
}

fn attrs_response(id: u32, attrs: &FileAttributes, version: u32) -> SftpMessage {
    let mut buf = BytesMut::new();
    codec::put_uint32(&mut buf, id);
    buf.extend_from_slice(&attrs.to_bytes_versioned(version));
    SftpMessage::new(SftpMessageType::Attrs, buf.to_vec())
}

/// Normalises a path to absolute form, resolving `.` and `..`.
fn normalize(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    if parts.is_empty() {
        "/".to_string()
    } else {
        format!("/{}", parts.join("/"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(msg_type: SftpMessageType, id: u32, body: &[u8]) -> Vec<u8> {
        let mut payload = id.to_be_bytes().to_vec();
        payload.extend_from_slice(body);
        let frame = SftpMessage::new(msg_type, payload).to_bytes();
        frame[4..].to_vec()
    }

    fn response_of(server: &mut MemorySftpServer, frame: &[u8]) -> SftpMessage {
        let bytes = server.handle_frame(frame);
        SftpMessage::from_frame(&bytes[4..]).unwrap()
    }

    #[test]
    fn test_normalize() {
        assert_eq!(normalize("/a/b/../c"), "/a/c");
        assert_eq!(normalize("a//b/./"), "/a/b");
        assert_eq!(normalize("."), "/");
        assert_eq!(normalize("/.."), "/");
    }

    #[test]
    fn test_init_advertises_extensions() {
        let mut server = MemorySftpServer::new();
        let frame = SftpMessage::new(SftpMessageType::Init, 3u32.to_be_bytes().to_vec()).to_bytes();
        let response = response_of(&mut server, &frame[4..]);
        assert_eq!(response.msg_type, SftpMessageType::Version);

        let mut offset = 0;
        assert_eq!(codec::read_uint32(&response.payload, &mut offset).unwrap(), 3);
        assert_eq!(server.version(), 3);
        let name = codec::read_string_utf8(&response.payload, &mut offset).unwrap();
        assert_eq!(name, "posix-rename@openssh.com");
    }

    #[test]
    fn test_init_negotiates_version_4() {
        let mut server = MemorySftpServer::new();
        let frame = SftpMessage::new(SftpMessageType::Init, 4u32.to_be_bytes().to_vec()).to_bytes();
        let response = response_of(&mut server, &frame[4..]);
        let mut offset = 0;
        assert_eq!(codec::read_uint32(&response.payload, &mut offset).unwrap(), 4);
        assert_eq!(server.version(), 4);

        // A capped server answers its limit instead.
        let mut capped = MemorySftpServer::new();
        capped.limit_version(3);
        let response = response_of(&mut capped, &frame[4..]);
        let mut offset = 0;
        assert_eq!(codec::read_uint32(&response.payload, &mut offset).unwrap(), 3);
    }

    #[test]
    fn test_v4_stat_carries_owner_group() {
        let mut server = MemorySftpServer::new();
        server.add_file("/f", vec![1, 2, 3]);
        let init = SftpMessage::new(SftpMessageType::Init, 4u32.to_be_bytes().to_vec()).to_bytes();
        let _ = server.handle_frame(&init[4..]);

        let mut body = BytesMut::new();
        codec::put_string_utf8(&mut body, "/f");
        let response = response_of(&mut server, &request(SftpMessageType::Stat, 9, &body));
        assert_eq!(response.msg_type, SftpMessageType::Attrs);

        let (attrs, _) =
            FileAttributes::from_bytes_versioned(&response.payload[4..], 4).unwrap();
        assert_eq!(attrs.size, Some(3));
        assert_eq!(attrs.owner.as_deref(), Some("keel"));
        assert_eq!(attrs.group.as_deref(), Some("keel"));
        assert!(attrs.is_regular_file());
    }

    #[test]
    fn test_status_echoes_request_id() {
        let mut server = MemorySftpServer::new();
        let mut body = BytesMut::new();
        codec::put_string_utf8(&mut body, "/nope");
        let frame = request(SftpMessageType::Remove, 77, &body);
        let response = response_of(&mut server, &frame);
        assert_eq!(response.msg_type, SftpMessageType::Status);

        let mut offset = 0;
        assert_eq!(codec::read_uint32(&response.payload, &mut offset).unwrap(), 77);
        assert_eq!(
            codec::read_uint32(&response.payload, &mut offset).unwrap(),
            SftpStatusCode::NoSuchFile as u32
        );
    }

    #[test]
    fn test_garbage_frame_answers_bad_message() {
        let mut server = MemorySftpServer::new();
        let bytes = server.handle_frame(&[5]); // READ with no payload
        let response = SftpMessage::from_frame(&bytes[4..]).unwrap();
        assert_eq!(response.msg_type, SftpMessageType::Status);
        let mut offset = 4; // skip id
        assert_eq!(
            codec::read_uint32(&response.payload, &mut offset).unwrap(),
            SftpStatusCode::BadMessage as u32
        );
    }

    #[test]
    fn test_append_mode() {
        let mut server = MemorySftpServer::new();
        server.add_file("/log", b"one".to_vec());

        let mut body = BytesMut::new();
        codec::put_string_utf8(&mut body, "/log");
        codec::put_uint32(&mut body, FXF_WRITE | FXF_APPEND);
        body.extend_from_slice(&FileAttributes::new().to_bytes());
        let response = response_of(&mut server, &request(SftpMessageType::Open, 1, &body));
        assert_eq!(response.msg_type, SftpMessageType::Handle);
        let mut offset = 4;
        let handle = codec::read_string(&response.payload, &mut offset).unwrap();

        let mut body = BytesMut::new();
        codec::put_string(&mut body, &handle);
        codec::put_uint64(&mut body, 0); // offset ignored in append mode
        codec::put_string(&mut body, b"two");
        let response = response_of(&mut server, &request(SftpMessageType::Write, 2, &body));
        assert_eq!(response.msg_type, SftpMessageType::Status);

        assert_eq!(server.file("/log").unwrap(), b"onetwo");
    }
}
