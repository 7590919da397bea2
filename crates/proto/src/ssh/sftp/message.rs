//! SFTP message framing (draft-ietf-secsh-filexfer-02).
//!
//! Every SFTP message is `uint32 length, byte type, byte[length-1]
//! payload` and rides as opaque bytes inside SSH channel data. Frames
//! routinely straddle CHANNEL_DATA boundaries, so inbound bytes go
//! through a [`FrameBuffer`] that reassembles complete frames.

use keel_platform::{KeelError, KeelResult};

/// Highest protocol version this client offers. Servers answer with
/// the version that will govern the session (at most this value); the
/// client interoperates down to version 3.
pub const SFTP_VERSION: u32 = 4;

/// Upper bound on a single SFTP frame; requests and responses are
/// chunked well below this.
pub const MAX_SFTP_FRAME: usize = 256 * 1024 + 1024;

/// SFTP message type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SftpMessageType {
    /// SSH_FXP_INIT
    Init = 1,
    /// SSH_FXP_VERSION
    Version = 2,
    /// SSH_FXP_OPEN
    Open = 3,
    /// SSH_FXP_CLOSE
    Close = 4,
    /// SSH_FXP_READ
    Read = 5,
    /// SSH_FXP_WRITE
    Write = 6,
    /// SSH_FXP_LSTAT
    LStat = 7,
    /// SSH_FXP_FSTAT
    FStat = 8,
    /// SSH_FXP_SETSTAT
    SetStat = 9,
    /// SSH_FXP_FSETSTAT
    FSetStat = 10,
    /// SSH_FXP_OPENDIR
    OpenDir = 11,
    /// SSH_FXP_READDIR
    ReadDir = 12,
    /// SSH_FXP_REMOVE
    Remove = 13,
    /// SSH_FXP_MKDIR
    MkDir = 14,
    /// SSH_FXP_RMDIR
    RmDir = 15,
    /// SSH_FXP_REALPATH
    RealPath = 16,
    /// SSH_FXP_STAT
    Stat = 17,
    /// SSH_FXP_RENAME
    Rename = 18,
    /// SSH_FXP_READLINK
    ReadLink = 19,
    /// SSH_FXP_SYMLINK
    Symlink = 20,

    /// SSH_FXP_STATUS
    Status = 101,
    /// SSH_FXP_HANDLE
    Handle = 102,
    /// SSH_FXP_DATA
    Data = 103,
    /// SSH_FXP_NAME
    Name = 104,
    /// SSH_FXP_ATTRS
    Attrs = 105,

    /// SSH_FXP_EXTENDED
    Extended = 200,
    /// SSH_FXP_EXTENDED_REPLY
    ExtendedReply = 201,
}

impl SftpMessageType {
    /// Converts a wire byte to a message type.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Init),
            2 => Some(Self::Version),
            3 => Some(Self::Open),
            4 => Some(Self::Close),
            5 => Some(Self::Read),
            6 => Some(Self::Write),
            7 => Some(Self::LStat),
            8 => Some(Self::FStat),
            9 => Some(Self::SetStat),
            10 => Some(Self::FSetStat),
            11 => Some(Self::OpenDir),
            12 => Some(Self::ReadDir),
            13 => Some(Self::Remove),
            14 => Some(Self::MkDir),
            15 => Some(Self::RmDir),
            16 => Some(Self::RealPath),
            17 => Some(Self::Stat),
            18 => Some(Self::Rename),
            19 => Some(Self::ReadLink),
            20 => Some(Self::Symlink),
            101 => Some(Self::Status),
            102 => Some(Self::Handle),
            103 => Some(Self::Data),
            104 => Some(Self::Name),
            105 => Some(Self::Attrs),
            200 => Some(Self::Extended),
            201 => Some(Self::ExtendedReply),
            _ => None,
        }
    }
}

/// One SFTP message: a type byte plus its payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SftpMessage {
    /// Message type.
    pub msg_type: SftpMessageType,
    /// Payload (everything after the type byte).
    pub payload: Vec<u8>,
}

impl SftpMessage {
    /// Creates a message.
    pub fn new(msg_type: SftpMessageType, payload: Vec<u8>) -> Self {
        Self { msg_type, payload }
    }

    /// Serializes to a length-prefixed frame.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(5 + self.payload.len());
        buf.extend_from_slice(&((self.payload.len() + 1) as u32).to_be_bytes());
        buf.push(self.msg_type as u8);
        buf.extend_from_slice(&self.payload);
        buf
    }

    /// Parses one complete frame.
    pub fn from_frame(frame: &[u8]) -> KeelResult<Self> {
        if frame.is_empty() {
            return Err(KeelError::Protocol("Empty SFTP frame".to_string()));
        }
        let msg_type = SftpMessageType::from_u8(frame[0]).ok_or_else(|| {
            KeelError::Protocol(format!("Unknown SFTP message type: {}", frame[0]))
        })?;
        Ok(Self {
            msg_type,
            payload: frame[1..].to_vec(),
        })
    }
}

/// Reassembles SFTP frames from channel-data fragments.
///
/// Push inbound bytes, pop complete frames (type byte plus payload,
/// length prefix stripped).
#[derive(Debug, Default)]
pub struct FrameBuffer {
    buffer: Vec<u8>,
}

impl FrameBuffer {
    /// Creates an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends channel data.
    pub fn push(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Pops the next complete frame, if one is buffered.
    ///
    /// # Errors
    ///
    /// [`KeelError::Protocol`] on a declared frame length of zero or
    /// beyond [`MAX_SFTP_FRAME`].
    pub fn next_frame(&mut self) -> KeelResult<Option<Vec<u8>>> {
        if self.buffer.len() < 4 {
            return Ok(None);
        }
        let length =
            u32::from_be_bytes([self.buffer[0], self.buffer[1], self.buffer[2], self.buffer[3]])
                as usize;
        if length == 0 || length > MAX_SFTP_FRAME {
            return Err(KeelError::Protocol(format!(
                "SFTP frame length {} out of range",
                length
            )));
        }
        if self.buffer.len() < 4 + length {
            return Ok(None);
        }
        let frame = self.buffer[4..4 + length].to_vec();
        self.buffer.drain(..4 + length);
        Ok(Some(frame))
    }
}
