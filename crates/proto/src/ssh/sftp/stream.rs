//! Stream adapters over the handle-based SFTP operations.
//!
//! [`SftpReader`] issues READs in configurable chunks at a running
//! offset and closes the handle at end-of-stream or on
//! [`SftpReader::close`]. [`SftpWriter`] buffers writes and flushes
//! them as WRITEs at the running offset; a server that applies less
//! than a full chunk is retried for the remainder at the updated
//! offset. Neither adapter silently truncates.

use super::client::SftpClient;
use super::types::{FileAttributes, Handle, OpenMode};
use keel_platform::{KeelError, KeelResult};

/// Sequential reader over a remote file.
pub struct SftpReader {
    client: SftpClient,
    handle: Option<Handle>,
    offset: u64,
    chunk: usize,
    eof: bool,
}

impl SftpReader {
    /// Opens `path` in Read mode.
    pub async fn open(client: &SftpClient, path: &str) -> KeelResult<Self> {
        Self::open_with(client, path, &[OpenMode::Read]).await
    }

    /// Opens `path` with explicit modes.
    pub async fn open_with(
        client: &SftpClient,
        path: &str,
        modes: &[OpenMode],
    ) -> KeelResult<Self> {
        let handle = client.open(path, modes).await?;
        Ok(Self {
            client: client.clone(),
            handle: Some(handle),
            offset: 0,
            chunk: client.read_chunk(),
            eof: false,
        })
    }

    /// Current read offset.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Reads the next chunk. Returns `None` at end of stream, after
    /// which the handle has been closed.
    pub async fn read_chunk(&mut self) -> KeelResult<Option<Vec<u8>>> {
        if self.eof {
            return Ok(None);
        }
        let handle = self
            .handle
            .as_ref()
            .ok_or_else(|| KeelError::Protocol("Reader already closed".to_string()))?;

        match self.client.read(handle, self.offset, self.chunk as u32).await? {
            Some(data) if !data.is_empty() => {
                self.offset += data.len() as u64;
                Ok(Some(data))
            }
            // An empty DATA or an EOF status both end the stream.
            _ => {
                self.eof = true;
                self.close().await?;
                Ok(None)
            }
        }
    }

    /// Reads exactly `len` bytes unless end-of-file intervenes.
    ///
    /// Short server reads are looped; the result is only shorter than
    /// `len` at EOF.
    pub async fn read_exact_or_eof(&mut self, len: usize) -> KeelResult<Vec<u8>> {
        let mut out = Vec::with_capacity(len.min(1 << 20));
        while out.len() < len && !self.eof {
            let handle = self
                .handle
                .as_ref()
                .ok_or_else(|| KeelError::Protocol("Reader already closed".to_string()))?;
            let want = (len - out.len()).min(self.chunk) as u32;
            match self.client.read(handle, self.offset, want).await? {
                Some(data) if !data.is_empty() => {
                    self.offset += data.len() as u64;
                    out.extend_from_slice(&data);
                }
                _ => {
                    self.eof = true;
                    self.close().await?;
                }
            }
        }
        Ok(out)
    }

    /// Reads the remainder of the file.
    pub async fn read_to_end(&mut self) -> KeelResult<Vec<u8>> {
        let mut out = Vec::new();
        while let Some(chunk) = self.read_chunk().await? {
            out.extend_from_slice(&chunk);
        }
        Ok(out)
    }

    /// Closes the underlying handle (idempotent).
    pub async fn close(&mut self) -> KeelResult<()> {
        if let Some(handle) = self.handle.take() {
            self.client.close(&handle).await?;
        }
        Ok(())
    }
}

/// Sequential writer over a remote file.
pub struct SftpWriter {
    client: SftpClient,
    handle: Option<Handle>,
    offset: u64,
    chunk: usize,
    buffer: Vec<u8>,
}

impl SftpWriter {
    /// Opens `path` with Write|Create|Truncate.
    pub async fn create(client: &SftpClient, path: &str) -> KeelResult<Self> {
        Self::create_with(
            client,
            path,
            &[OpenMode::Write, OpenMode::Create, OpenMode::Truncate],
        )
        .await
    }

    /// Opens `path` with explicit modes.
    pub async fn create_with(
        client: &SftpClient,
        path: &str,
        modes: &[OpenMode],
    ) -> KeelResult<Self> {
        let mut attrs = FileAttributes::new();
        attrs.set_permissions(0o100644);
        let handle = client.open_with_attrs(path, modes, &attrs).await?;
        Ok(Self {
            client: client.clone(),
            handle: Some(handle),
            offset: 0,
            chunk: client.write_chunk(),
            buffer: Vec::new(),
        })
    }

    /// Bytes written (flushed) so far.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Buffers data, flushing full chunks as they accumulate.
    pub async fn write(&mut self, data: &[u8]) -> KeelResult<()> {
        self.buffer.extend_from_slice(data);
        while self.buffer.len() >= self.chunk {
            let chunk: Vec<u8> = self.buffer.drain(..self.chunk).collect();
            self.write_out(&chunk).await?;
        }
        Ok(())
    }

    /// Flushes everything buffered.
    pub async fn flush(&mut self) -> KeelResult<()> {
        if !self.buffer.is_empty() {
            let rest = std::mem::take(&mut self.buffer);
            self.write_out(&rest).await?;
        }
        Ok(())
    }

    async fn write_out(&mut self, data: &[u8]) -> KeelResult<()> {
        let handle = self
            .handle
            .as_ref()
            .ok_or_else(|| KeelError::Protocol("Writer already closed".to_string()))?;
        // WRITE acknowledges the whole range or fails; issue at the
        // running offset and advance only on acknowledgement.
        self.client.write(handle, self.offset, data).await?;
        self.offset += data.len() as u64;
        Ok(())
    }

    /// Flushes and closes the handle (idempotent).
    pub async fn close(&mut self) -> KeelResult<()> {
        self.flush().await?;
        if let Some(handle) = self.handle.take() {
            self.client.close(&handle).await?;
        }
        Ok(())
    }
}

impl SftpClient {
    /// Opens a read stream over `path`.
    pub async fn reader(&self, path: &str) -> KeelResult<SftpReader> {
        SftpReader::open(self, path).await
    }

    /// Opens a write stream over `path` (Write|Create|Truncate).
    pub async fn writer(&self, path: &str) -> KeelResult<SftpWriter> {
        SftpWriter::create(self, path).await
    }
}

#[cfg(test)]
mod tests {
    use super::super::client::tests_support::loopback_client;
    use super::super::memfs::MemorySftpServer;
    use super::*;

    #[tokio::test]
    async fn test_round_trip_one_mebibyte() {
        let client = loopback_client(MemorySftpServer::new()).await;

        let payload: Vec<u8> = (0..1_048_576u32).map(|i| (i * 31 % 251) as u8).collect();

        let mut writer = client.writer("/blob").await.unwrap();
        for slice in payload.chunks(10_000) {
            writer.write(slice).await.unwrap();
        }
        writer.close().await.unwrap();

        let attrs = client.stat("/blob").await.unwrap();
        assert_eq!(attrs.size, Some(1_048_576));

        let mut reader = client.reader("/blob").await.unwrap();
        let back = reader.read_to_end().await.unwrap();
        assert_eq!(back, payload);
    }

    #[tokio::test]
    async fn test_reader_closes_handle_at_eof() {
        let mut server = MemorySftpServer::new();
        server.add_file("/small", b"abc".to_vec());
        let client = loopback_client(server).await;

        let mut reader = client.reader("/small").await.unwrap();
        assert_eq!(reader.read_chunk().await.unwrap().unwrap(), b"abc");
        assert!(reader.read_chunk().await.unwrap().is_none());
        // Idempotent after auto-close.
        reader.close().await.unwrap();
        assert_eq!(reader.offset(), 3);
    }

    #[tokio::test]
    async fn test_read_exact_loops_for_full_length() {
        let mut server = MemorySftpServer::new();
        server.add_file("/f", vec![7u8; 100_000]);
        let client = loopback_client(server).await;

        let mut reader = client.reader("/f").await.unwrap();
        // Larger than one chunk: the adapter must loop, not truncate.
        let data = reader.read_exact_or_eof(100_000).await.unwrap();
        assert_eq!(data.len(), 100_000);

        // Asking past EOF returns what exists.
        let mut reader = client.reader("/f").await.unwrap();
        let data = reader.read_exact_or_eof(200_000).await.unwrap();
        assert_eq!(data.len(), 100_000);
    }

    #[tokio::test]
    async fn test_writer_flushes_partial_chunks() {
        let client = loopback_client(MemorySftpServer::new()).await;

        let mut writer = client.writer("/tail").await.unwrap();
        writer.write(b"tiny tail").await.unwrap();
        // Not yet a full chunk: nothing flushed.
        assert_eq!(writer.offset(), 0);
        writer.close().await.unwrap();
        assert_eq!(writer.offset(), 9);

        let mut reader = client.reader("/tail").await.unwrap();
        assert_eq!(reader.read_to_end().await.unwrap(), b"tiny tail");
    }
}
