//! SFTP client subsystem (draft-ietf-secsh-filexfer-02, version 3).
//!
//! Layered over a `subsystem` channel named `sftp`:
//!
//! - [`message`] - frame layout and reassembly
//! - [`types`] - open modes, attributes, directory entries
//! - [`client`] - request-id dispatch and the operation surface
//! - [`stream`] - chunked reader/writer adapters
//! - [`memfs`] - an in-memory responder for loopback testing
//!
//! # Example
//!
//! ```rust,no_run
//! use keel_proto::ssh::sftp::{OpenMode, SftpClient};
//! # async fn example(channel: keel_proto::ssh::session::ChannelHandle)
//! # -> keel_platform::KeelResult<()> {
//! let sftp = SftpClient::start(channel, 32 * 1024, 32 * 1024, None).await?;
//! let handle = sftp.open("/etc/hostname", &[OpenMode::Read]).await?;
//! let data = sftp.read(&handle, 0, 4096).await?;
//! sftp.close(&handle).await?;
//! # drop(data);
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod memfs;
pub mod message;
pub mod stream;
pub mod types;

pub use client::{ReadDir, SftpClient};
pub use message::{FrameBuffer, SftpMessage, SftpMessageType, SFTP_VERSION};
pub use stream::{SftpReader, SftpWriter};
pub use types::{CopyMode, DirEntry, FileAttributes, Handle, OpenMode};
