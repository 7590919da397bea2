//! SFTP client: request dispatch and the file operation surface.
//!
//! The client runs over a `subsystem` channel named `sftp`. After
//! `SSH_FXP_INIT`/`SSH_FXP_VERSION`, every request carries a 4-byte
//! request-id drawn from a monotonically increasing counter; the server
//! echoes it in the response. A demultiplexer task owns the channel's
//! inbound events, reassembles frames and completes the matching
//! request's completion sink; responses may arrive in any order.
//!
//! The pending-request map is guarded by a single lock held only for
//! insert and remove. When the channel closes, every outstanding sink
//! fails with `CONNECTION_LOST`. Cancelling an operation (dropping its
//! future or hitting its deadline) removes the sink; the server's late
//! response is discarded on arrival.

use super::message::{FrameBuffer, SftpMessage, SftpMessageType, SFTP_VERSION};
use super::types::{pflags, CopyMode, DirEntry, FileAttributes, Handle, OpenMode};
use crate::ssh::codec;
use crate::ssh::session::{with_deadline, ChannelEvent, ChannelHandle};
use bytes::BytesMut;
use keel_platform::{KeelError, KeelResult, SftpStatusCode};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// POSIX rename extension name.
const POSIX_RENAME_EXT: &str = "posix-rename@openssh.com";

/// Hard link extension name.
const HARDLINK_EXT: &str = "hardlink@openssh.com";

struct PendingState {
    sinks: HashMap<u32, oneshot::Sender<Vec<u8>>>,
    closed: bool,
}

struct SftpInner {
    channel: ChannelHandle,
    pending: Arc<Mutex<PendingState>>,
    next_request_id: AtomicU32,
    version: u32,
    extensions: Vec<(String, String)>,
    read_chunk: usize,
    write_chunk: usize,
    timeout: Option<Duration>,
}

fn lock_pending(pending: &Mutex<PendingState>) -> MutexGuard<'_, PendingState> {
    pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn connection_lost() -> KeelError {
    KeelError::sftp(SftpStatusCode::ConnectionLost)
}

/// SFTP client over an established channel. Cheap to clone; all clones
/// share one request-id space and one demultiplexer.
#[derive(Clone)]
pub struct SftpClient {
    inner: Arc<SftpInner>,
}

impl SftpClient {
    /// Requests the `sftp` subsystem on the channel, negotiates the
    /// protocol version and starts the demultiplexer.
    pub async fn start(
        channel: ChannelHandle,
        read_chunk: usize,
        write_chunk: usize,
        timeout: Option<Duration>,
    ) -> KeelResult<Self> {
        let accepted = channel
            .request(
                crate::ssh::connection::ChannelRequestType::Subsystem {
                    name: "sftp".to_string(),
                },
                true,
                timeout,
            )
            .await?;
        if !accepted {
            return Err(KeelError::Channel(
                "Server refused the sftp subsystem".to_string(),
            ));
        }
        Self::handshake(channel, read_chunk, write_chunk, timeout).await
    }

    /// Initializes the protocol on a channel whose `sftp` subsystem was
    /// already requested by other means.
    pub async fn handshake(
        mut channel: ChannelHandle,
        read_chunk: usize,
        write_chunk: usize,
        timeout: Option<Duration>,
    ) -> KeelResult<Self> {
        let mut events = channel.take_events().ok_or_else(|| {
            KeelError::Channel("Channel events already consumed".to_string())
        })?;

        // SSH_FXP_INIT carries only our version; no request-id yet.
        let init = SftpMessage::new(SftpMessageType::Init, SFTP_VERSION.to_be_bytes().to_vec());
        channel.send_data(&init.to_bytes()).await?;

        let mut frames = FrameBuffer::new();
        let version_frame = with_deadline(timeout, async {
            loop {
                if let Some(frame) = frames.next_frame()? {
                    return Ok(frame);
                }
                match events.recv().await {
                    Some(ChannelEvent::Data(data)) => frames.push(&data),
                    Some(ChannelEvent::Eof | ChannelEvent::Closed) | None => {
                        return Err(KeelError::sftp(SftpStatusCode::NoConnection))
                    }
                    Some(_) => {}
                }
            }
        })
        .await?;

        let message = SftpMessage::from_frame(&version_frame)?;
        if message.msg_type != SftpMessageType::Version {
            return Err(KeelError::Protocol(format!(
                "Expected SSH_FXP_VERSION, got {:?}",
                message.msg_type
            )));
        }

        let mut offset = 0;
        let version = codec::read_uint32(&message.payload, &mut offset)?;
        if !(3..=6).contains(&version) {
            return Err(KeelError::Protocol(format!(
                "Unsupported SFTP protocol version {}",
                version
            )));
        }
        // The server's answer governs the session; it may not exceed
        // our offer, so clamp a misbehaving peer rather than abort.
        let version = version.min(SFTP_VERSION);
        let mut extensions = Vec::new();
        while offset < message.payload.len() {
            let name = codec::read_string_utf8(&message.payload, &mut offset)?;
            let data = codec::read_string_utf8(&message.payload, &mut offset)?;
            extensions.push((name, data));
        }
        info!(version, extensions = extensions.len(), "SFTP session ready");

        let pending = Arc::new(Mutex::new(PendingState {
            sinks: HashMap::new(),
            closed: false,
        }));

        tokio::spawn(demux_task(events, frames, Arc::clone(&pending)));

        Ok(Self {
            inner: Arc::new(SftpInner {
                channel,
                pending,
                next_request_id: AtomicU32::new(0),
                version,
                extensions,
                read_chunk,
                write_chunk,
                timeout,
            }),
        })
    }

    /// The negotiated protocol version.
    pub fn version(&self) -> u32 {
        self.inner.version
    }

    /// Extension pairs the server advertised in SSH_FXP_VERSION.
    pub fn extensions(&self) -> &[(String, String)] {
        &self.inner.extensions
    }

    /// Read stream chunk size.
    pub(crate) fn read_chunk(&self) -> usize {
        self.inner.read_chunk
    }

    /// Write stream chunk size.
    pub(crate) fn write_chunk(&self) -> usize {
        self.inner.write_chunk
    }

    fn has_extension(&self, name: &str) -> bool {
        self.inner.extensions.iter().any(|(n, _)| n == name)
    }

    /// Issues one request and awaits its matched response.
    async fn roundtrip(
        &self,
        msg_type: SftpMessageType,
        body: &[u8],
    ) -> KeelResult<SftpMessage> {
        let request_id = self.inner.next_request_id.fetch_add(1, Ordering::SeqCst);
        let (sink, response) = oneshot::channel();
        {
            let mut pending = lock_pending(&self.inner.pending);
            if pending.closed {
                return Err(connection_lost());
            }
            // Ids wrap at 2^32; practical traffic never leaves one
            // outstanding for a full wrap.
            pending.sinks.insert(request_id, sink);
        }

        let mut payload = Vec::with_capacity(4 + body.len());
        payload.extend_from_slice(&request_id.to_be_bytes());
        payload.extend_from_slice(body);
        let frame = SftpMessage::new(msg_type, payload).to_bytes();

        if let Err(e) = self.inner.channel.send_data(&frame).await {
            lock_pending(&self.inner.pending).sinks.remove(&request_id);
            return Err(e);
        }

        let result = with_deadline(self.inner.timeout, async {
            response.await.map_err(|_| connection_lost())
        })
        .await;

        match result {
            Ok(frame) => {
                let message = SftpMessage::from_frame(&frame)?;
                let mut offset = 0;
                let echoed = codec::read_uint32(&message.payload, &mut offset)?;
                debug_assert_eq!(echoed, request_id);
                Ok(SftpMessage::new(
                    message.msg_type,
                    message.payload[4..].to_vec(),
                ))
            }
            Err(e) => {
                // Cancelled or timed out: release the id and let the
                // demultiplexer discard the late response.
                lock_pending(&self.inner.pending).sinks.remove(&request_id);
                Err(e)
            }
        }
    }

    /// Parses a STATUS payload (after the request-id).
    fn parse_status(payload: &[u8]) -> KeelResult<(SftpStatusCode, String)> {
        let mut offset = 0;
        let code = codec::read_uint32(payload, &mut offset)?;
        // Version 3+ always carries message and language tag.
        let message = codec::read_string_utf8(payload, &mut offset).unwrap_or_default();
        let code = SftpStatusCode::from_u32(code).unwrap_or(SftpStatusCode::Failure);
        Ok((code, message))
    }

    fn status_error(code: SftpStatusCode, message: String) -> KeelError {
        KeelError::Sftp {
            code,
            message: if message.is_empty() {
                code.message().to_string()
            } else {
                message
            },
        }
    }

    /// Maps a response expected to be STATUS(OK) to `()`.
    fn expect_ok(response: SftpMessage) -> KeelResult<()> {
        match response.msg_type {
            SftpMessageType::Status => {
                let (code, message) = Self::parse_status(&response.payload)?;
                if code == SftpStatusCode::Ok {
                    Ok(())
                } else {
                    Err(Self::status_error(code, message))
                }
            }
            other => Err(KeelError::Protocol(format!(
                "Expected SSH_FXP_STATUS, got {:?}",
                other
            ))),
        }
    }

    fn expect_handle(response: SftpMessage) -> KeelResult<Handle> {
        match response.msg_type {
            SftpMessageType::Handle => {
                let mut offset = 0;
                Ok(Handle(codec::read_string(&response.payload, &mut offset)?))
            }
            SftpMessageType::Status => {
                let (code, message) = Self::parse_status(&response.payload)?;
                Err(Self::status_error(code, message))
            }
            other => Err(KeelError::Protocol(format!(
                "Expected SSH_FXP_HANDLE, got {:?}",
                other
            ))),
        }
    }

    fn parse_attrs(&self, response: SftpMessage) -> KeelResult<FileAttributes> {
        match response.msg_type {
            SftpMessageType::Attrs => {
                let (attrs, _) =
                    FileAttributes::from_bytes_versioned(&response.payload, self.inner.version)?;
                Ok(attrs)
            }
            SftpMessageType::Status => {
                let (code, message) = Self::parse_status(&response.payload)?;
                Err(Self::status_error(code, message))
            }
            other => Err(KeelError::Protocol(format!(
                "Expected SSH_FXP_ATTRS, got {:?}",
                other
            ))),
        }
    }

    fn parse_names(&self, response: SftpMessage) -> KeelResult<Option<Vec<DirEntry>>> {
        match response.msg_type {
            SftpMessageType::Name => {
                let mut offset = 0;
                let count = codec::read_uint32(&response.payload, &mut offset)? as usize;
                let mut entries = Vec::with_capacity(count.min(4096));
                for _ in 0..count {
                    let filename = codec::read_string_utf8(&response.payload, &mut offset)?;
                    // Version 4 dropped the longname field.
                    let longname = if self.inner.version >= 4 {
                        String::new()
                    } else {
                        codec::read_string_utf8(&response.payload, &mut offset)?
                    };
                    let (attributes, used) = FileAttributes::from_bytes_versioned(
                        &response.payload[offset..],
                        self.inner.version,
                    )?;
                    offset += used;
                    entries.push(DirEntry {
                        filename,
                        longname,
                        attributes,
                    });
                }
                Ok(Some(entries))
            }
            SftpMessageType::Status => {
                let (code, message) = Self::parse_status(&response.payload)?;
                if code == SftpStatusCode::Eof {
                    Ok(None)
                } else {
                    Err(Self::status_error(code, message))
                }
            }
            other => Err(KeelError::Protocol(format!(
                "Expected SSH_FXP_NAME, got {:?}",
                other
            ))),
        }
    }

    /// Opens a file.
    pub async fn open(&self, path: &str, modes: &[OpenMode]) -> KeelResult<Handle> {
        self.open_with_attrs(path, modes, &FileAttributes::new()).await
    }

    /// Opens a file, passing initial attributes (permissions etc.).
    pub async fn open_with_attrs(
        &self,
        path: &str,
        modes: &[OpenMode],
        attrs: &FileAttributes,
    ) -> KeelResult<Handle> {
        let flags = pflags(modes)?;
        let mut body = BytesMut::new();
        codec::put_string_utf8(&mut body, path);
        codec::put_uint32(&mut body, flags);
        body.extend_from_slice(&attrs.to_bytes_versioned(self.inner.version));
        let response = self.roundtrip(SftpMessageType::Open, &body).await?;
        Self::expect_handle(response)
    }

    /// Closes a handle. After the acknowledgement the handle is dead.
    pub async fn close(&self, handle: &Handle) -> KeelResult<()> {
        let mut body = BytesMut::new();
        codec::put_string(&mut body, &handle.0);
        let response = self.roundtrip(SftpMessageType::Close, &body).await?;
        Self::expect_ok(response)
    }

    /// Reads up to `len` bytes at `offset`. Returns `None` at EOF; a
    /// short (non-empty) read is not an error.
    pub async fn read(
        &self,
        handle: &Handle,
        offset: u64,
        len: u32,
    ) -> KeelResult<Option<Vec<u8>>> {
        let mut body = BytesMut::new();
        codec::put_string(&mut body, &handle.0);
        codec::put_uint64(&mut body, offset);
        codec::put_uint32(&mut body, len);
        let response = self.roundtrip(SftpMessageType::Read, &body).await?;
        match response.msg_type {
            SftpMessageType::Data => {
                let mut offset = 0;
                Ok(Some(codec::read_string(&response.payload, &mut offset)?))
            }
            SftpMessageType::Status => {
                let (code, message) = Self::parse_status(&response.payload)?;
                if code == SftpStatusCode::Eof {
                    Ok(None)
                } else {
                    Err(Self::status_error(code, message))
                }
            }
            other => Err(KeelError::Protocol(format!(
                "Expected SSH_FXP_DATA, got {:?}",
                other
            ))),
        }
    }

    /// Writes `data` at `offset`.
    pub async fn write(&self, handle: &Handle, offset: u64, data: &[u8]) -> KeelResult<()> {
        let mut body = BytesMut::new();
        codec::put_string(&mut body, &handle.0);
        codec::put_uint64(&mut body, offset);
        codec::put_string(&mut body, data);
        let response = self.roundtrip(SftpMessageType::Write, &body).await?;
        Self::expect_ok(response)
    }

    /// Removes a file.
    pub async fn remove(&self, path: &str) -> KeelResult<()> {
        let response = self
            .roundtrip(SftpMessageType::Remove, &path_body(path))
            .await?;
        Self::expect_ok(response)
    }

    /// Creates a directory.
    pub async fn mkdir(&self, path: &str, attrs: &FileAttributes) -> KeelResult<()> {
        let mut body = BytesMut::new();
        codec::put_string_utf8(&mut body, path);
        body.extend_from_slice(&attrs.to_bytes_versioned(self.inner.version));
        let response = self.roundtrip(SftpMessageType::MkDir, &body).await?;
        Self::expect_ok(response)
    }

    /// Removes an empty directory.
    pub async fn rmdir(&self, path: &str) -> KeelResult<()> {
        let response = self
            .roundtrip(SftpMessageType::RmDir, &path_body(path))
            .await?;
        Self::expect_ok(response)
    }

    /// Renames `old_path` to `new_path`.
    ///
    /// With a [`CopyMode`], the POSIX rename extension is required;
    /// when the server did not advertise it the call fails locally
    /// with `OP_UNSUPPORTED`.
    pub async fn rename(
        &self,
        old_path: &str,
        new_path: &str,
        mode: Option<CopyMode>,
    ) -> KeelResult<()> {
        let mut body = BytesMut::new();
        match mode {
            None => {
                codec::put_string_utf8(&mut body, old_path);
                codec::put_string_utf8(&mut body, new_path);
                let response = self.roundtrip(SftpMessageType::Rename, &body).await?;
                Self::expect_ok(response)
            }
            Some(_) => {
                if !self.has_extension(POSIX_RENAME_EXT) {
                    return Err(KeelError::Sftp {
                        code: SftpStatusCode::OpUnsupported,
                        message: format!("Server lacks {}", POSIX_RENAME_EXT),
                    });
                }
                codec::put_string_utf8(&mut body, POSIX_RENAME_EXT);
                codec::put_string_utf8(&mut body, old_path);
                codec::put_string_utf8(&mut body, new_path);
                let response = self.roundtrip(SftpMessageType::Extended, &body).await?;
                Self::expect_ok(response)
            }
        }
    }

    /// Creates a symlink at `link_path` pointing to `target_path`.
    pub async fn symlink(&self, link_path: &str, target_path: &str) -> KeelResult<()> {
        let mut body = BytesMut::new();
        codec::put_string_utf8(&mut body, link_path);
        codec::put_string_utf8(&mut body, target_path);
        let response = self.roundtrip(SftpMessageType::Symlink, &body).await?;
        Self::expect_ok(response)
    }

    /// Creates a hard link via the `hardlink@openssh.com` extension.
    pub async fn link(&self, existing_path: &str, link_path: &str) -> KeelResult<()> {
        if !self.has_extension(HARDLINK_EXT) {
            return Err(KeelError::Sftp {
                code: SftpStatusCode::OpUnsupported,
                message: format!("Server lacks {}", HARDLINK_EXT),
            });
        }
        let mut body = BytesMut::new();
        codec::put_string_utf8(&mut body, HARDLINK_EXT);
        codec::put_string_utf8(&mut body, existing_path);
        codec::put_string_utf8(&mut body, link_path);
        let response = self.roundtrip(SftpMessageType::Extended, &body).await?;
        Self::expect_ok(response)
    }

    /// Reads a symlink's target.
    pub async fn readlink(&self, path: &str) -> KeelResult<String> {
        let response = self
            .roundtrip(SftpMessageType::ReadLink, &path_body(path))
            .await?;
        let entries = self.parse_names(response)?
            .ok_or_else(|| KeelError::Protocol("READLINK returned EOF".to_string()))?;
        entries
            .into_iter()
            .next()
            .map(|entry| entry.filename)
            .ok_or_else(|| KeelError::Protocol("READLINK returned no names".to_string()))
    }

    /// Canonicalizes a path.
    pub async fn realpath(&self, path: &str) -> KeelResult<String> {
        let response = self
            .roundtrip(SftpMessageType::RealPath, &path_body(path))
            .await?;
        let entries = self.parse_names(response)?
            .ok_or_else(|| KeelError::Protocol("REALPATH returned EOF".to_string()))?;
        entries
            .into_iter()
            .next()
            .map(|entry| entry.filename)
            .ok_or_else(|| KeelError::Protocol("REALPATH returned no names".to_string()))
    }

    /// Stats a path, following symlinks.
    pub async fn stat(&self, path: &str) -> KeelResult<FileAttributes> {
        let response = self
            .roundtrip(SftpMessageType::Stat, &path_body(path))
            .await?;
        self.parse_attrs(response)
    }

    /// Stats a path without following symlinks.
    pub async fn lstat(&self, path: &str) -> KeelResult<FileAttributes> {
        let response = self
            .roundtrip(SftpMessageType::LStat, &path_body(path))
            .await?;
        self.parse_attrs(response)
    }

    /// Stats an open handle.
    pub async fn fstat(&self, handle: &Handle) -> KeelResult<FileAttributes> {
        let mut body = BytesMut::new();
        codec::put_string(&mut body, &handle.0);
        let response = self.roundtrip(SftpMessageType::FStat, &body).await?;
        self.parse_attrs(response)
    }

    /// Applies attributes to a path.
    pub async fn setstat(&self, path: &str, attrs: &FileAttributes) -> KeelResult<()> {
        let mut body = BytesMut::new();
        codec::put_string_utf8(&mut body, path);
        body.extend_from_slice(&attrs.to_bytes_versioned(self.inner.version));
        let response = self.roundtrip(SftpMessageType::SetStat, &body).await?;
        Self::expect_ok(response)
    }

    /// Applies attributes to an open handle.
    pub async fn fsetstat(&self, handle: &Handle, attrs: &FileAttributes) -> KeelResult<()> {
        let mut body = BytesMut::new();
        codec::put_string(&mut body, &handle.0);
        body.extend_from_slice(&attrs.to_bytes_versioned(self.inner.version));
        let response = self.roundtrip(SftpMessageType::FSetStat, &body).await?;
        Self::expect_ok(response)
    }

    /// Opens a directory for iteration.
    pub async fn open_dir(&self, path: &str) -> KeelResult<Handle> {
        let response = self
            .roundtrip(SftpMessageType::OpenDir, &path_body(path))
            .await?;
        Self::expect_handle(response)
    }

    /// Reads the next batch of entries; `None` at end of directory.
    pub async fn read_dir_batch(&self, handle: &Handle) -> KeelResult<Option<Vec<DirEntry>>> {
        let mut body = BytesMut::new();
        codec::put_string(&mut body, &handle.0);
        let response = self.roundtrip(SftpMessageType::ReadDir, &body).await?;
        self.parse_names(response)
    }

    /// Opens a lazy directory iterator.
    ///
    /// The iterator is finite and not restartable; it buffers one
    /// READDIR batch at a time and closes the handle automatically at
    /// end of directory.
    pub async fn read_dir(&self, path: &str) -> KeelResult<ReadDir> {
        let handle = self.open_dir(path).await?;
        Ok(ReadDir {
            client: self.clone(),
            handle: Some(handle),
            buffer: VecDeque::new(),
            done: false,
        })
    }
}

/// Lazy directory iterator; see [`SftpClient::read_dir`].
pub struct ReadDir {
    client: SftpClient,
    handle: Option<Handle>,
    buffer: VecDeque<DirEntry>,
    done: bool,
}

impl ReadDir {
    /// Returns the next entry, or `None` once the directory is
    /// exhausted (at which point the handle has been closed).
    pub async fn next_entry(&mut self) -> KeelResult<Option<DirEntry>> {
        loop {
            if let Some(entry) = self.buffer.pop_front() {
                return Ok(Some(entry));
            }
            if self.done {
                return Ok(None);
            }
            let handle = self
                .handle
                .as_ref()
                .ok_or_else(|| KeelError::Protocol("ReadDir handle missing".to_string()))?;
            match self.client.read_dir_batch(handle).await? {
                Some(batch) => {
                    self.buffer.extend(batch);
                    // A server may legally return an empty NAME batch;
                    // loop and ask again.
                }
                None => {
                    self.done = true;
                    if let Some(handle) = self.handle.take() {
                        if let Err(e) = self.client.close(&handle).await {
                            warn!(error = %e, "closing directory handle failed");
                        }
                    }
                    return Ok(None);
                }
            }
        }
    }
}

fn path_body(path: &str) -> BytesMut {
    let mut body = BytesMut::new();
    codec::put_string_utf8(&mut body, path);
    body
}

async fn demux_task(
    mut events: mpsc::UnboundedReceiver<ChannelEvent>,
    mut frames: FrameBuffer,
    pending: Arc<Mutex<PendingState>>,
) {
    let fail_all = |pending: &Arc<Mutex<PendingState>>| {
        let mut state = lock_pending(pending);
        state.closed = true;
        // Dropping the sinks fails every waiter with CONNECTION_LOST.
        state.sinks.clear();
    };

    loop {
        match events.recv().await {
            Some(ChannelEvent::Data(data)) => {
                frames.push(&data);
                loop {
                    match frames.next_frame() {
                        Ok(Some(frame)) => {
                            if frame.len() < 5 {
                                warn!("runt SFTP response frame");
                                continue;
                            }
                            let request_id =
                                u32::from_be_bytes([frame[1], frame[2], frame[3], frame[4]]);
                            let sink = lock_pending(&pending).sinks.remove(&request_id);
                            match sink {
                                Some(sink) => {
                                    let _ = sink.send(frame);
                                }
                                None => {
                                    // Cancelled request; response dropped.
                                    debug!(request_id, "discarding unmatched SFTP response");
                                }
                            }
                        }
                        Ok(None) => break,
                        Err(e) => {
                            warn!(error = %e, "SFTP stream corrupt");
                            fail_all(&pending);
                            return;
                        }
                    }
                }
            }
            Some(ChannelEvent::Eof | ChannelEvent::Closed) | None => {
                debug!("SFTP channel closed");
                fail_all(&pending);
                return;
            }
            Some(_) => {}
        }
    }
}

/// Loopback plumbing shared by the SFTP test modules.
#[cfg(test)]
pub(crate) mod tests_support {
    use super::*;
    use crate::ssh::connection::ChannelData;
    use crate::ssh::session::{test_channel_pair, WriterCmd};
    use crate::ssh::sftp::memfs::MemorySftpServer;

    /// Wires a client channel to an in-memory SFTP server.
    pub(crate) async fn loopback_client(server: MemorySftpServer) -> SftpClient {
        let (channel, mut outbound_rx, event_tx) = test_channel_pair(1 << 30, 32 * 1024);

        tokio::spawn(async move {
            let mut server = server;
            let mut frames = FrameBuffer::new();
            while let Some(cmd) = outbound_rx.recv().await {
                let WriterCmd::Packet(payload) = cmd else { continue };
                let Ok(data) = ChannelData::from_bytes(&payload) else {
                    continue;
                };
                frames.push(&data.data);
                while let Some(frame) = frames.next_frame().unwrap() {
                    let response = server.handle_frame(&frame);
                    if event_tx.send(ChannelEvent::Data(response)).is_err() {
                        return;
                    }
                }
            }
        });

        SftpClient::handshake(channel, 32 * 1024, 32 * 1024, None)
            .await
            .unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::tests_support::loopback_client;
    use super::*;
    use crate::ssh::sftp::memfs::MemorySftpServer;

    #[tokio::test]
    async fn test_version_negotiation_and_extensions() {
        let client = loopback_client(MemorySftpServer::new()).await;
        assert_eq!(client.version(), 4);
        assert!(client
            .extensions()
            .iter()
            .any(|(name, _)| name == POSIX_RENAME_EXT));
    }

    #[tokio::test]
    async fn test_version_3_server_negotiates_down() {
        let mut server = MemorySftpServer::new();
        server.limit_version(3);
        server.add_file("/legacy", vec![9u8; 512]);
        let client = loopback_client(server).await;

        assert_eq!(client.version(), 3);
        // The v3 wire paths still work end to end.
        let attrs = client.stat("/legacy").await.unwrap();
        assert_eq!(attrs.size, Some(512));
        assert!(attrs.owner.is_none());

        let mut iter = client.read_dir("/").await.unwrap();
        let entry = iter.next_entry().await.unwrap().unwrap();
        assert_eq!(entry.filename, "legacy");
        // Version 3 NAME entries carry a longname.
        assert!(!entry.longname.is_empty());
    }

    #[tokio::test]
    async fn test_version_4_attributes_over_the_wire() {
        let mut server = MemorySftpServer::new();
        server.add_file("/owned", vec![1u8; 64]);
        let client = loopback_client(server).await;
        assert_eq!(client.version(), 4);

        // v4 ATTRS: type byte plus owner/group names.
        let attrs = client.stat("/owned").await.unwrap();
        assert_eq!(attrs.size, Some(64));
        assert_eq!(attrs.owner.as_deref(), Some("keel"));
        assert_eq!(attrs.group.as_deref(), Some("keel"));
        assert!(attrs.is_regular_file());

        // v4 NAME entries have no longname.
        let mut iter = client.read_dir("/").await.unwrap();
        let entry = iter.next_entry().await.unwrap().unwrap();
        assert_eq!(entry.filename, "owned");
        assert!(entry.longname.is_empty());
        assert_eq!(entry.attributes.owner.as_deref(), Some("keel"));

        // v4 SETSTAT round-trips separate access/create/modify times
        // through the encoder (the server applies what it stores).
        let mut update = FileAttributes::new();
        update
            .set_access_time(1000)
            .set_create_time(2000)
            .set_modify_time(3000)
            .set_permissions(0o100600);
        client.setstat("/owned", &update).await.unwrap();
        assert_eq!(client.stat("/owned").await.unwrap().permissions, Some(0o100600));
    }

    #[tokio::test]
    async fn test_write_then_read_round_trip() {
        let client = loopback_client(MemorySftpServer::new()).await;

        let handle = client
            .open(
                "/data.bin",
                &[OpenMode::Write, OpenMode::Create, OpenMode::Truncate],
            )
            .await
            .unwrap();
        client.write(&handle, 0, b"hello sftp").await.unwrap();
        client.close(&handle).await.unwrap();

        let handle = client.open("/data.bin", &[OpenMode::Read]).await.unwrap();
        let data = client.read(&handle, 0, 1024).await.unwrap().unwrap();
        assert_eq!(data, b"hello sftp");
        // Past the end: EOF is a status, not an error.
        assert!(client.read(&handle, 1024, 10).await.unwrap().is_none());
        client.close(&handle).await.unwrap();
    }

    #[tokio::test]
    async fn test_open_missing_file_is_no_such_file() {
        let client = loopback_client(MemorySftpServer::new()).await;
        let err = client.open("/missing", &[OpenMode::Read]).await.unwrap_err();
        assert!(matches!(
            err,
            KeelError::Sftp {
                code: SftpStatusCode::NoSuchFile,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_exclusive_create_semantics() {
        let client = loopback_client(MemorySftpServer::new()).await;

        let handle = client
            .open("/x", &[OpenMode::Write, OpenMode::Create, OpenMode::Exclusive])
            .await
            .unwrap();
        client.close(&handle).await.unwrap();

        // Second exclusive create must fail on the server.
        let err = client
            .open("/x", &[OpenMode::Write, OpenMode::Create, OpenMode::Exclusive])
            .await
            .unwrap_err();
        assert!(matches!(err, KeelError::Sftp { .. }));

        // Exclusive without Create never reaches the wire.
        let err = client
            .open("/y", &[OpenMode::Write, OpenMode::Exclusive])
            .await
            .unwrap_err();
        assert!(matches!(err, KeelError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn test_stat_reports_size() {
        let mut server = MemorySftpServer::new();
        server.add_file("/sized", vec![0u8; 1_048_576]);
        let client = loopback_client(server).await;

        let attrs = client.stat("/sized").await.unwrap();
        assert_eq!(attrs.size, Some(1_048_576));
        assert!(attrs.is_regular_file());
    }

    #[tokio::test]
    async fn test_remove_rename_mkdir_rmdir() {
        let mut server = MemorySftpServer::new();
        server.add_file("/a", b"contents".to_vec());
        let client = loopback_client(server).await;

        client.rename("/a", "/b", None).await.unwrap();
        assert!(client.stat("/a").await.is_err());
        assert_eq!(client.stat("/b").await.unwrap().size, Some(8));

        client.mkdir("/dir", &FileAttributes::new()).await.unwrap();
        assert!(client.stat("/dir").await.unwrap().is_directory());
        client.rmdir("/dir").await.unwrap();

        client.remove("/b").await.unwrap();
        assert!(client.stat("/b").await.is_err());
    }

    #[tokio::test]
    async fn test_posix_rename_overwrites() {
        let mut server = MemorySftpServer::new();
        server.add_file("/src", b"new".to_vec());
        server.add_file("/dst", b"old".to_vec());
        let client = loopback_client(server).await;

        // Plain rename refuses to clobber.
        assert!(client.rename("/src", "/dst", None).await.is_err());

        client
            .rename("/src", "/dst", Some(CopyMode::Overwrite))
            .await
            .unwrap();
        let handle = client.open("/dst", &[OpenMode::Read]).await.unwrap();
        assert_eq!(
            client.read(&handle, 0, 16).await.unwrap().unwrap(),
            b"new"
        );
        client.close(&handle).await.unwrap();
    }

    #[tokio::test]
    async fn test_symlink_and_readlink() {
        let mut server = MemorySftpServer::new();
        server.add_file("/target", b"t".to_vec());
        let client = loopback_client(server).await;

        client.symlink("/link", "/target").await.unwrap();
        assert_eq!(client.readlink("/link").await.unwrap(), "/target");
        assert!(client.lstat("/link").await.unwrap().is_symlink());
    }

    #[tokio::test]
    async fn test_realpath_canonicalizes() {
        let client = loopback_client(MemorySftpServer::new()).await;
        assert_eq!(client.realpath(".").await.unwrap(), "/");
        assert_eq!(client.realpath("/a/../b/./c").await.unwrap(), "/b/c");
    }

    #[tokio::test]
    async fn test_read_dir_returns_every_entry_once() {
        let mut server = MemorySftpServer::new();
        let mut expected = std::collections::HashSet::new();
        for i in 0..2500 {
            let name = format!("file-{:04}", i);
            server.add_file(&format!("/big/{}", name), vec![b'x']);
            expected.insert(name);
        }
        let client = loopback_client(server).await;

        let mut iter = client.read_dir("/big").await.unwrap();
        let mut seen = std::collections::HashSet::new();
        while let Some(entry) = iter.next_entry().await.unwrap() {
            assert!(seen.insert(entry.filename.clone()), "duplicate entry");
        }
        assert_eq!(seen, expected);

        // The iterator is finite and stays exhausted.
        assert!(iter.next_entry().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_request_ids_unique_among_in_flight() {
        let client = loopback_client(MemorySftpServer::new()).await;
        // Issue a burst of concurrent stats; every response must match
        // its own request (the memfs echoes ids it receives).
        let mut tasks = Vec::new();
        for _ in 0..32 {
            let client = client.clone();
            tasks.push(tokio::spawn(async move {
                client.realpath("/").await.unwrap()
            }));
        }
        for task in tasks {
            assert_eq!(task.await.unwrap(), "/");
        }
    }

    #[tokio::test]
    async fn test_fstat_and_setstat() {
        let mut server = MemorySftpServer::new();
        server.add_file("/f", vec![1, 2, 3]);
        let client = loopback_client(server).await;

        let handle = client.open("/f", &[OpenMode::Read]).await.unwrap();
        let attrs = client.fstat(&handle).await.unwrap();
        assert_eq!(attrs.size, Some(3));
        client.close(&handle).await.unwrap();

        let mut update = FileAttributes::new();
        update.set_permissions(0o100600);
        client.setstat("/f", &update).await.unwrap();
        assert_eq!(client.stat("/f").await.unwrap().permissions, Some(0o100600));
    }
}
