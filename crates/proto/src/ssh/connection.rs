//! Connection protocol wire messages (RFC 4254).
//!
//! Channels multiplex logical byte pipes over the encrypted transport.
//! This module holds the message encodings; the per-channel state
//! machine and window accounting live in [`crate::ssh::channel`].

use crate::ssh::codec;
use crate::ssh::message::MessageType;
use bytes::BytesMut;
use keel_platform::{KeelError, KeelResult};

/// SSH_MSG_CHANNEL_OPEN (RFC 4254 Section 5.1).
///
/// Only `session` channels are opened by this engine; port-forwarding
/// channel types are out of scope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelOpen {
    /// Channel type name (always "session" when we originate).
    pub channel_type: String,
    /// Sender's local channel id.
    pub sender_channel: u32,
    /// Initial receive window in bytes.
    pub initial_window_size: u32,
    /// Maximum packet the sender accepts.
    pub maximum_packet_size: u32,
}

impl ChannelOpen {
    /// Creates a session-channel open message.
    pub fn session(sender_channel: u32, initial_window_size: u32, maximum_packet_size: u32) -> Self {
        Self {
            channel_type: "session".to_string(),
            sender_channel,
            initial_window_size,
            maximum_packet_size,
        }
    }

    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        codec::put_byte(&mut buf, MessageType::ChannelOpen as u8);
        codec::put_string_utf8(&mut buf, &self.channel_type);
        codec::put_uint32(&mut buf, self.sender_channel);
        codec::put_uint32(&mut buf, self.initial_window_size);
        codec::put_uint32(&mut buf, self.maximum_packet_size);
        buf.to_vec()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> KeelResult<Self> {
        let mut offset = 0;
        expect_message(data, &mut offset, MessageType::ChannelOpen)?;
        Ok(Self {
            channel_type: codec::read_string_utf8(data, &mut offset)?,
            sender_channel: codec::read_uint32(data, &mut offset)?,
            initial_window_size: codec::read_uint32(data, &mut offset)?,
            maximum_packet_size: codec::read_uint32(data, &mut offset)?,
        })
    }
}

/// SSH_MSG_CHANNEL_OPEN_CONFIRMATION.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelOpenConfirmation {
    /// Recipient's (our) channel id.
    pub recipient_channel: u32,
    /// Sender's (peer's) channel id.
    pub sender_channel: u32,
    /// Peer's initial receive window.
    pub initial_window_size: u32,
    /// Largest packet the peer accepts.
    pub maximum_packet_size: u32,
}

impl ChannelOpenConfirmation {
    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        codec::put_byte(&mut buf, MessageType::ChannelOpenConfirmation as u8);
        codec::put_uint32(&mut buf, self.recipient_channel);
        codec::put_uint32(&mut buf, self.sender_channel);
        codec::put_uint32(&mut buf, self.initial_window_size);
        codec::put_uint32(&mut buf, self.maximum_packet_size);
        buf.to_vec()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> KeelResult<Self> {
        let mut offset = 0;
        expect_message(data, &mut offset, MessageType::ChannelOpenConfirmation)?;
        Ok(Self {
            recipient_channel: codec::read_uint32(data, &mut offset)?,
            sender_channel: codec::read_uint32(data, &mut offset)?,
            initial_window_size: codec::read_uint32(data, &mut offset)?,
            maximum_packet_size: codec::read_uint32(data, &mut offset)?,
        })
    }
}

/// Reason codes for SSH_MSG_CHANNEL_OPEN_FAILURE.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ChannelOpenFailureReason {
    /// SSH_OPEN_ADMINISTRATIVELY_PROHIBITED
    AdministrativelyProhibited = 1,
    /// SSH_OPEN_CONNECT_FAILED
    ConnectFailed = 2,
    /// SSH_OPEN_UNKNOWN_CHANNEL_TYPE
    UnknownChannelType = 3,
    /// SSH_OPEN_RESOURCE_SHORTAGE
    ResourceShortage = 4,
}

impl ChannelOpenFailureReason {
    /// Converts a wire value. Unknown codes stay raw on the message so
    /// they can be reported verbatim.
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            1 => Some(Self::AdministrativelyProhibited),
            2 => Some(Self::ConnectFailed),
            3 => Some(Self::UnknownChannelType),
            4 => Some(Self::ResourceShortage),
            _ => None,
        }
    }
}

/// SSH_MSG_CHANNEL_OPEN_FAILURE.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelOpenFailure {
    /// Recipient's (our) channel id.
    pub recipient_channel: u32,
    /// Raw reason code (kept raw to round-trip unknown values).
    pub reason_code: u32,
    /// Human readable description.
    pub description: String,
}

impl ChannelOpenFailure {
    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        codec::put_byte(&mut buf, MessageType::ChannelOpenFailure as u8);
        codec::put_uint32(&mut buf, self.recipient_channel);
        codec::put_uint32(&mut buf, self.reason_code);
        codec::put_string_utf8(&mut buf, &self.description);
        codec::put_string_utf8(&mut buf, ""); // language
        buf.to_vec()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> KeelResult<Self> {
        let mut offset = 0;
        expect_message(data, &mut offset, MessageType::ChannelOpenFailure)?;
        let recipient_channel = codec::read_uint32(data, &mut offset)?;
        let reason_code = codec::read_uint32(data, &mut offset)?;
        let description = codec::read_string_utf8(data, &mut offset)?;
        let _language = codec::read_string_utf8(data, &mut offset)?;
        Ok(Self {
            recipient_channel,
            reason_code,
            description,
        })
    }
}

/// SSH_MSG_CHANNEL_WINDOW_ADJUST.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelWindowAdjust {
    /// Recipient's channel id.
    pub recipient_channel: u32,
    /// Bytes to add to the recipient's send window.
    pub bytes_to_add: u32,
}

impl ChannelWindowAdjust {
    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        codec::put_byte(&mut buf, MessageType::ChannelWindowAdjust as u8);
        codec::put_uint32(&mut buf, self.recipient_channel);
        codec::put_uint32(&mut buf, self.bytes_to_add);
        buf.to_vec()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> KeelResult<Self> {
        let mut offset = 0;
        expect_message(data, &mut offset, MessageType::ChannelWindowAdjust)?;
        Ok(Self {
            recipient_channel: codec::read_uint32(data, &mut offset)?,
            bytes_to_add: codec::read_uint32(data, &mut offset)?,
        })
    }
}

/// SSH_MSG_CHANNEL_DATA.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelData {
    /// Recipient's channel id.
    pub recipient_channel: u32,
    /// Payload bytes.
    pub data: Vec<u8>,
}

impl ChannelData {
    /// Creates a data message.
    pub fn new(recipient_channel: u32, data: Vec<u8>) -> Self {
        Self {
            recipient_channel,
            data,
        }
    }

    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        codec::put_byte(&mut buf, MessageType::ChannelData as u8);
        codec::put_uint32(&mut buf, self.recipient_channel);
        codec::put_string(&mut buf, &self.data);
        buf.to_vec()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> KeelResult<Self> {
        let mut offset = 0;
        expect_message(data, &mut offset, MessageType::ChannelData)?;
        Ok(Self {
            recipient_channel: codec::read_uint32(data, &mut offset)?,
            data: codec::read_string(data, &mut offset)?,
        })
    }
}

/// SSH_MSG_CHANNEL_EXTENDED_DATA (stderr stream).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelExtendedData {
    /// Recipient's channel id.
    pub recipient_channel: u32,
    /// Extended data type code (1 = stderr).
    pub data_type: u32,
    /// Payload bytes.
    pub data: Vec<u8>,
}

impl ChannelExtendedData {
    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        codec::put_byte(&mut buf, MessageType::ChannelExtendedData as u8);
        codec::put_uint32(&mut buf, self.recipient_channel);
        codec::put_uint32(&mut buf, self.data_type);
        codec::put_string(&mut buf, &self.data);
        buf.to_vec()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> KeelResult<Self> {
        let mut offset = 0;
        expect_message(data, &mut offset, MessageType::ChannelExtendedData)?;
        Ok(Self {
            recipient_channel: codec::read_uint32(data, &mut offset)?,
            data_type: codec::read_uint32(data, &mut offset)?,
            data: codec::read_string(data, &mut offset)?,
        })
    }
}

/// SSH_MSG_CHANNEL_EOF / SSH_MSG_CHANNEL_CLOSE share a one-field shape.
macro_rules! recipient_only_message {
    ($name:ident, $msg:expr, $doc:literal) => {
        #[doc = $doc]
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub struct $name {
            /// Recipient's channel id.
            pub recipient_channel: u32,
        }

        impl $name {
            /// Creates the message.
            pub fn new(recipient_channel: u32) -> Self {
                Self { recipient_channel }
            }

            /// Serializes to bytes.
            pub fn to_bytes(&self) -> Vec<u8> {
                let mut buf = BytesMut::new();
                codec::put_byte(&mut buf, $msg as u8);
                codec::put_uint32(&mut buf, self.recipient_channel);
                buf.to_vec()
            }

            /// Parses from bytes.
            pub fn from_bytes(data: &[u8]) -> KeelResult<Self> {
                let mut offset = 0;
                expect_message(data, &mut offset, $msg)?;
                Ok(Self {
                    recipient_channel: codec::read_uint32(data, &mut offset)?,
                })
            }
        }
    };
}

recipient_only_message!(ChannelEof, MessageType::ChannelEof, "SSH_MSG_CHANNEL_EOF.");
recipient_only_message!(ChannelClose, MessageType::ChannelClose, "SSH_MSG_CHANNEL_CLOSE.");
recipient_only_message!(
    ChannelSuccess,
    MessageType::ChannelSuccess,
    "SSH_MSG_CHANNEL_SUCCESS."
);
recipient_only_message!(
    ChannelFailure,
    MessageType::ChannelFailure,
    "SSH_MSG_CHANNEL_FAILURE."
);

/// Channel request types (RFC 4254 Sections 6.2-6.10).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelRequestType {
    /// Execute a command.
    Exec {
        /// Command line.
        command: String,
    },
    /// Start the user's shell.
    Shell,
    /// Start a named subsystem (e.g. "sftp").
    Subsystem {
        /// Subsystem name.
        name: String,
    },
    /// Allocate a pseudo terminal.
    PtyReq {
        /// TERM value.
        term: String,
        /// Columns.
        columns: u32,
        /// Rows.
        rows: u32,
        /// Width in pixels.
        width_px: u32,
        /// Height in pixels.
        height_px: u32,
        /// Encoded terminal modes.
        modes: Vec<u8>,
    },
    /// Set an environment variable.
    Env {
        /// Variable name.
        name: String,
        /// Variable value.
        value: String,
    },
    /// Window dimension change.
    WindowChange {
        /// Columns.
        columns: u32,
        /// Rows.
        rows: u32,
        /// Width in pixels.
        width_px: u32,
        /// Height in pixels.
        height_px: u32,
    },
    /// Command exit status (server to client).
    ExitStatus {
        /// Exit status.
        status: u32,
    },
    /// Command terminated by signal (server to client).
    ExitSignal {
        /// Signal name without "SIG".
        signal: String,
        /// Whether a core dump was produced.
        core_dumped: bool,
        /// Error message.
        message: String,
    },
    /// A request type this engine does not interpret.
    Unknown {
        /// Request name.
        name: String,
        /// Raw type-specific payload.
        data: Vec<u8>,
    },
}

impl ChannelRequestType {
    /// Returns the request type name.
    pub fn name(&self) -> &str {
        match self {
            ChannelRequestType::Exec { .. } => "exec",
            ChannelRequestType::Shell => "shell",
            ChannelRequestType::Subsystem { .. } => "subsystem",
            ChannelRequestType::PtyReq { .. } => "pty-req",
            ChannelRequestType::Env { .. } => "env",
            ChannelRequestType::WindowChange { .. } => "window-change",
            ChannelRequestType::ExitStatus { .. } => "exit-status",
            ChannelRequestType::ExitSignal { .. } => "exit-signal",
            ChannelRequestType::Unknown { name, .. } => name,
        }
    }
}

/// SSH_MSG_CHANNEL_REQUEST.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelRequest {
    /// Recipient's channel id.
    pub recipient_channel: u32,
    /// Request payload.
    pub request: ChannelRequestType,
    /// Whether the peer must reply with SUCCESS/FAILURE (in FIFO order).
    pub want_reply: bool,
}

impl ChannelRequest {
    /// Creates a request.
    pub fn new(recipient_channel: u32, request: ChannelRequestType, want_reply: bool) -> Self {
        Self {
            recipient_channel,
            request,
            want_reply,
        }
    }

    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        codec::put_byte(&mut buf, MessageType::ChannelRequest as u8);
        codec::put_uint32(&mut buf, self.recipient_channel);
        codec::put_string_utf8(&mut buf, self.request.name());
        codec::put_boolean(&mut buf, self.want_reply);

        match &self.request {
            ChannelRequestType::Exec { command } => {
                codec::put_string_utf8(&mut buf, command);
            }
            ChannelRequestType::Shell => {}
            ChannelRequestType::Subsystem { name } => {
                codec::put_string_utf8(&mut buf, name);
            }
            ChannelRequestType::PtyReq {
                term,
                columns,
                rows,
                width_px,
                height_px,
                modes,
            } => {
                codec::put_string_utf8(&mut buf, term);
                codec::put_uint32(&mut buf, *columns);
                codec::put_uint32(&mut buf, *rows);
                codec::put_uint32(&mut buf, *width_px);
                codec::put_uint32(&mut buf, *height_px);
                codec::put_string(&mut buf, modes);
            }
            ChannelRequestType::Env { name, value } => {
                codec::put_string_utf8(&mut buf, name);
                codec::put_string_utf8(&mut buf, value);
            }
            ChannelRequestType::WindowChange {
                columns,
                rows,
                width_px,
                height_px,
            } => {
                codec::put_uint32(&mut buf, *columns);
                codec::put_uint32(&mut buf, *rows);
                codec::put_uint32(&mut buf, *width_px);
                codec::put_uint32(&mut buf, *height_px);
            }
            ChannelRequestType::ExitStatus { status } => {
                codec::put_uint32(&mut buf, *status);
            }
            ChannelRequestType::ExitSignal {
                signal,
                core_dumped,
                message,
            } => {
                codec::put_string_utf8(&mut buf, signal);
                codec::put_boolean(&mut buf, *core_dumped);
                codec::put_string_utf8(&mut buf, message);
                codec::put_string_utf8(&mut buf, ""); // language
            }
            ChannelRequestType::Unknown { data, .. } => {
                buf.extend_from_slice(data);
            }
        }

        buf.to_vec()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> KeelResult<Self> {
        let mut offset = 0;
        expect_message(data, &mut offset, MessageType::ChannelRequest)?;
        let recipient_channel = codec::read_uint32(data, &mut offset)?;
        let name = codec::read_string_utf8(data, &mut offset)?;
        let want_reply = codec::read_boolean(data, &mut offset)?;

        let request = match name.as_str() {
            "exec" => ChannelRequestType::Exec {
                command: codec::read_string_utf8(data, &mut offset)?,
            },
            "shell" => ChannelRequestType::Shell,
            "subsystem" => ChannelRequestType::Subsystem {
                name: codec::read_string_utf8(data, &mut offset)?,
            },
            "pty-req" => ChannelRequestType::PtyReq {
                term: codec::read_string_utf8(data, &mut offset)?,
                columns: codec::read_uint32(data, &mut offset)?,
                rows: codec::read_uint32(data, &mut offset)?,
                width_px: codec::read_uint32(data, &mut offset)?,
                height_px: codec::read_uint32(data, &mut offset)?,
                modes: codec::read_string(data, &mut offset)?,
            },
            "env" => ChannelRequestType::Env {
                name: codec::read_string_utf8(data, &mut offset)?,
                value: codec::read_string_utf8(data, &mut offset)?,
            },
            "window-change" => ChannelRequestType::WindowChange {
                columns: codec::read_uint32(data, &mut offset)?,
                rows: codec::read_uint32(data, &mut offset)?,
                width_px: codec::read_uint32(data, &mut offset)?,
                height_px: codec::read_uint32(data, &mut offset)?,
            },
            "exit-status" => ChannelRequestType::ExitStatus {
                status: codec::read_uint32(data, &mut offset)?,
            },
            "exit-signal" => {
                let signal = codec::read_string_utf8(data, &mut offset)?;
                let core_dumped = codec::read_boolean(data, &mut offset)?;
                let message = codec::read_string_utf8(data, &mut offset)?;
                let _language = codec::read_string_utf8(data, &mut offset)?;
                ChannelRequestType::ExitSignal {
                    signal,
                    core_dumped,
                    message,
                }
            }
            _ => ChannelRequestType::Unknown {
                name,
                data: data[offset..].to_vec(),
            },
        };

        Ok(Self {
            recipient_channel,
            request,
            want_reply,
        })
    }
}

fn expect_message(data: &[u8], offset: &mut usize, expected: MessageType) -> KeelResult<()> {
    let msg = codec::read_byte(data, offset)?;
    if msg != expected as u8 {
        return Err(KeelError::Protocol(format!(
            "Invalid message type: expected {} ({}), got {}",
            expected as u8,
            expected.name(),
            msg
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_open_round_trip() {
        let open = ChannelOpen::session(3, 2 * 1024 * 1024, 32768);
        let bytes = open.to_bytes();
        assert_eq!(bytes[0], 90);
        assert_eq!(ChannelOpen::from_bytes(&bytes).unwrap(), open);
    }

    #[test]
    fn test_confirmation_round_trip() {
        let confirm = ChannelOpenConfirmation {
            recipient_channel: 3,
            sender_channel: 17,
            initial_window_size: 1 << 21,
            maximum_packet_size: 32768,
        };
        assert_eq!(
            ChannelOpenConfirmation::from_bytes(&confirm.to_bytes()).unwrap(),
            confirm
        );
    }

    #[test]
    fn test_open_failure_round_trip() {
        let failure = ChannelOpenFailure {
            recipient_channel: 3,
            reason_code: ChannelOpenFailureReason::AdministrativelyProhibited as u32,
            description: "no sessions".to_string(),
        };
        let parsed = ChannelOpenFailure::from_bytes(&failure.to_bytes()).unwrap();
        assert_eq!(parsed, failure);
        assert_eq!(
            ChannelOpenFailureReason::from_u32(parsed.reason_code),
            Some(ChannelOpenFailureReason::AdministrativelyProhibited)
        );
    }

    #[test]
    fn test_data_round_trip() {
        let data = ChannelData::new(5, b"stdout bytes".to_vec());
        let bytes = data.to_bytes();
        assert_eq!(bytes[0], 94);
        assert_eq!(ChannelData::from_bytes(&bytes).unwrap(), data);
    }

    #[test]
    fn test_extended_data_round_trip() {
        let data = ChannelExtendedData {
            recipient_channel: 5,
            data_type: 1,
            data: b"stderr bytes".to_vec(),
        };
        assert_eq!(ChannelExtendedData::from_bytes(&data.to_bytes()).unwrap(), data);
    }

    #[test]
    fn test_window_adjust_round_trip() {
        let adjust = ChannelWindowAdjust {
            recipient_channel: 2,
            bytes_to_add: 1 << 20,
        };
        assert_eq!(
            ChannelWindowAdjust::from_bytes(&adjust.to_bytes()).unwrap(),
            adjust
        );
    }

    #[test]
    fn test_eof_close_round_trip() {
        assert_eq!(
            ChannelEof::from_bytes(&ChannelEof::new(9).to_bytes()).unwrap(),
            ChannelEof::new(9)
        );
        assert_eq!(
            ChannelClose::from_bytes(&ChannelClose::new(9).to_bytes()).unwrap(),
            ChannelClose::new(9)
        );
    }

    #[test]
    fn test_request_variants_round_trip() {
        let requests = vec![
            ChannelRequestType::Exec {
                command: "echo hello".to_string(),
            },
            ChannelRequestType::Shell,
            ChannelRequestType::Subsystem {
                name: "sftp".to_string(),
            },
            ChannelRequestType::PtyReq {
                term: "xterm-256color".to_string(),
                columns: 80,
                rows: 24,
                width_px: 0,
                height_px: 0,
                modes: vec![0],
            },
            ChannelRequestType::Env {
                name: "LANG".to_string(),
                value: "C.UTF-8".to_string(),
            },
            ChannelRequestType::WindowChange {
                columns: 120,
                rows: 40,
                width_px: 0,
                height_px: 0,
            },
            ChannelRequestType::ExitStatus { status: 0 },
            ChannelRequestType::ExitSignal {
                signal: "TERM".to_string(),
                core_dumped: false,
                message: "terminated".to_string(),
            },
        ];

        for request in requests {
            let msg = ChannelRequest::new(7, request.clone(), true);
            let parsed = ChannelRequest::from_bytes(&msg.to_bytes()).unwrap();
            assert_eq!(parsed, msg, "round trip failed for {}", request.name());
        }
    }

    #[test]
    fn test_unknown_request_preserved() {
        let msg = ChannelRequest::new(
            1,
            ChannelRequestType::Unknown {
                name: "auth-agent-req@openssh.com".to_string(),
                data: vec![],
            },
            false,
        );
        let parsed = ChannelRequest::from_bytes(&msg.to_bytes()).unwrap();
        assert_eq!(parsed, msg);
    }

    #[test]
    fn test_truncated_request_rejected() {
        let msg = ChannelRequest::new(
            7,
            ChannelRequestType::Exec {
                command: "ls".to_string(),
            },
            true,
        );
        let bytes = msg.to_bytes();
        assert!(ChannelRequest::from_bytes(&bytes[..bytes.len() - 3]).is_err());
    }
}
