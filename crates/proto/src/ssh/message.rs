//! SSH protocol message numbers (RFC 4253 Section 12).
//!
//! # Message Categories
//!
//! - **Transport layer generic** (1-19): disconnect, ignore, debug
//! - **Algorithm negotiation** (20-29): KEXINIT, NEWKEYS
//! - **Key exchange method** (30-49): method-specific messages
//! - **User authentication** (50-79): authentication protocol
//! - **Connection protocol** (80-127): channel management
//! - 128 and above are reserved
//!
//! An unknown number inside a valid range is answered with
//! `SSH_MSG_UNIMPLEMENTED`; it never terminates the session. The range
//! classification lives here because the service layer routes payloads
//! by the range a registered service has claimed.

use keel_platform::{KeelError, KeelResult};

/// SSH message types as defined in RFC 4253 Section 12 and the method
/// RFCs layered on top of it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    // Transport layer generic (1-19)
    /// Disconnect message - terminates the connection.
    Disconnect = 1,
    /// Ignore message - padding or keep-alive.
    Ignore = 2,
    /// Unimplemented message - response to an unknown message number.
    Unimplemented = 3,
    /// Debug message.
    Debug = 4,
    /// Service request (e.g. "ssh-userauth").
    ServiceRequest = 5,
    /// Service accept.
    ServiceAccept = 6,

    // Algorithm negotiation (20-29)
    /// Key exchange init - algorithm negotiation.
    KexInit = 20,
    /// New keys - switch to the freshly derived keys.
    NewKeys = 21,

    // Key exchange method specific (30-49)
    /// KEXDH_INIT / KEX_ECDH_INIT (shared number 30).
    KexdhInit = 30,
    /// KEXDH_REPLY / KEX_ECDH_REPLY / KEX_DH_GEX_GROUP (shared
    /// number 31, disambiguated by the negotiated kex algorithm).
    KexdhReply = 31,
    /// KEX_DH_GEX_INIT.
    KexDhGexInit = 32,
    /// KEX_DH_GEX_REPLY.
    KexDhGexReply = 33,
    /// KEX_DH_GEX_REQUEST.
    KexDhGexRequest = 34,

    // User authentication (50-79)
    /// User authentication request.
    UserauthRequest = 50,
    /// User authentication failure (continuations + partial success).
    UserauthFailure = 51,
    /// User authentication success.
    UserauthSuccess = 52,
    /// User authentication banner.
    UserauthBanner = 53,
    /// PK_OK / PASSWD_CHANGEREQ / INFO_REQUEST (method-specific 60).
    UserauthPkOk = 60,
    /// INFO_RESPONSE (keyboard-interactive, RFC 4256).
    UserauthInfoResponse = 61,

    // Connection protocol (80-127)
    /// Global request.
    GlobalRequest = 80,
    /// Global request success.
    RequestSuccess = 81,
    /// Global request failure.
    RequestFailure = 82,
    /// Channel open.
    ChannelOpen = 90,
    /// Channel open confirmation.
    ChannelOpenConfirmation = 91,
    /// Channel open failure.
    ChannelOpenFailure = 92,
    /// Channel window adjust.
    ChannelWindowAdjust = 93,
    /// Channel data.
    ChannelData = 94,
    /// Channel extended data (stderr).
    ChannelExtendedData = 95,
    /// Channel EOF.
    ChannelEof = 96,
    /// Channel close.
    ChannelClose = 97,
    /// Channel request.
    ChannelRequest = 98,
    /// Channel success.
    ChannelSuccess = 99,
    /// Channel failure.
    ChannelFailure = 100,
}

/// Classification of a message number into its protocol range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageRange {
    /// 1-19: handled at transport level in any state.
    TransportGeneric,
    /// 20-49: algorithm negotiation and key exchange.
    KeyExchange,
    /// 50-79: user authentication service.
    UserAuth,
    /// 80-127: connection service.
    Connection,
    /// 128-255: reserved, always answered with UNIMPLEMENTED.
    Reserved,
}

impl MessageRange {
    /// Classifies a raw message number.
    pub fn of(number: u8) -> Self {
        match number {
            0..=19 => MessageRange::TransportGeneric,
            20..=49 => MessageRange::KeyExchange,
            50..=79 => MessageRange::UserAuth,
            80..=127 => MessageRange::Connection,
            _ => MessageRange::Reserved,
        }
    }

    /// Returns the inclusive number span of this range.
    pub fn span(&self) -> (u8, u8) {
        match self {
            MessageRange::TransportGeneric => (1, 19),
            MessageRange::KeyExchange => (20, 49),
            MessageRange::UserAuth => (50, 79),
            MessageRange::Connection => (80, 127),
            MessageRange::Reserved => (128, 255),
        }
    }
}

impl MessageType {
    /// Converts a byte to a message type.
    ///
    /// Numbers 31-34 are ambiguous between the plain and group-exchange
    /// key exchange flows; this conversion returns the plain-DH reading
    /// (`KexdhReply` for 31). KEX drivers that negotiated group
    /// exchange interpret the raw number themselves.
    pub fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(MessageType::Disconnect),
            2 => Some(MessageType::Ignore),
            3 => Some(MessageType::Unimplemented),
            4 => Some(MessageType::Debug),
            5 => Some(MessageType::ServiceRequest),
            6 => Some(MessageType::ServiceAccept),
            20 => Some(MessageType::KexInit),
            21 => Some(MessageType::NewKeys),
            30 => Some(MessageType::KexdhInit),
            31 => Some(MessageType::KexdhReply),
            32 => Some(MessageType::KexDhGexInit),
            33 => Some(MessageType::KexDhGexReply),
            34 => Some(MessageType::KexDhGexRequest),
            50 => Some(MessageType::UserauthRequest),
            51 => Some(MessageType::UserauthFailure),
            52 => Some(MessageType::UserauthSuccess),
            53 => Some(MessageType::UserauthBanner),
            60 => Some(MessageType::UserauthPkOk),
            61 => Some(MessageType::UserauthInfoResponse),
            80 => Some(MessageType::GlobalRequest),
            81 => Some(MessageType::RequestSuccess),
            82 => Some(MessageType::RequestFailure),
            90 => Some(MessageType::ChannelOpen),
            91 => Some(MessageType::ChannelOpenConfirmation),
            92 => Some(MessageType::ChannelOpenFailure),
            93 => Some(MessageType::ChannelWindowAdjust),
            94 => Some(MessageType::ChannelData),
            95 => Some(MessageType::ChannelExtendedData),
            96 => Some(MessageType::ChannelEof),
            97 => Some(MessageType::ChannelClose),
            98 => Some(MessageType::ChannelRequest),
            99 => Some(MessageType::ChannelSuccess),
            100 => Some(MessageType::ChannelFailure),
            _ => None,
        }
    }

    /// Returns the message type name.
    pub fn name(&self) -> &'static str {
        match self {
            MessageType::Disconnect => "SSH_MSG_DISCONNECT",
            MessageType::Ignore => "SSH_MSG_IGNORE",
            MessageType::Unimplemented => "SSH_MSG_UNIMPLEMENTED",
            MessageType::Debug => "SSH_MSG_DEBUG",
            MessageType::ServiceRequest => "SSH_MSG_SERVICE_REQUEST",
            MessageType::ServiceAccept => "SSH_MSG_SERVICE_ACCEPT",
            MessageType::KexInit => "SSH_MSG_KEXINIT",
            MessageType::NewKeys => "SSH_MSG_NEWKEYS",
            MessageType::KexdhInit => "SSH_MSG_KEXDH_INIT",
            MessageType::KexdhReply => "SSH_MSG_KEXDH_REPLY",
            MessageType::KexDhGexInit => "SSH_MSG_KEX_DH_GEX_INIT",
            MessageType::KexDhGexReply => "SSH_MSG_KEX_DH_GEX_REPLY",
            MessageType::KexDhGexRequest => "SSH_MSG_KEX_DH_GEX_REQUEST",
            MessageType::UserauthRequest => "SSH_MSG_USERAUTH_REQUEST",
            MessageType::UserauthFailure => "SSH_MSG_USERAUTH_FAILURE",
            MessageType::UserauthSuccess => "SSH_MSG_USERAUTH_SUCCESS",
            MessageType::UserauthBanner => "SSH_MSG_USERAUTH_BANNER",
            MessageType::UserauthPkOk => "SSH_MSG_USERAUTH_PK_OK",
            MessageType::UserauthInfoResponse => "SSH_MSG_USERAUTH_INFO_RESPONSE",
            MessageType::GlobalRequest => "SSH_MSG_GLOBAL_REQUEST",
            MessageType::RequestSuccess => "SSH_MSG_REQUEST_SUCCESS",
            MessageType::RequestFailure => "SSH_MSG_REQUEST_FAILURE",
            MessageType::ChannelOpen => "SSH_MSG_CHANNEL_OPEN",
            MessageType::ChannelOpenConfirmation => "SSH_MSG_CHANNEL_OPEN_CONFIRMATION",
            MessageType::ChannelOpenFailure => "SSH_MSG_CHANNEL_OPEN_FAILURE",
            MessageType::ChannelWindowAdjust => "SSH_MSG_CHANNEL_WINDOW_ADJUST",
            MessageType::ChannelData => "SSH_MSG_CHANNEL_DATA",
            MessageType::ChannelExtendedData => "SSH_MSG_CHANNEL_EXTENDED_DATA",
            MessageType::ChannelEof => "SSH_MSG_CHANNEL_EOF",
            MessageType::ChannelClose => "SSH_MSG_CHANNEL_CLOSE",
            MessageType::ChannelRequest => "SSH_MSG_CHANNEL_REQUEST",
            MessageType::ChannelSuccess => "SSH_MSG_CHANNEL_SUCCESS",
            MessageType::ChannelFailure => "SSH_MSG_CHANNEL_FAILURE",
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({})", self.name(), *self as u8)
    }
}

/// Disconnect reason codes (RFC 4253 Section 11.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum DisconnectReason {
    /// SSH_DISCONNECT_HOST_NOT_ALLOWED_TO_CONNECT
    HostNotAllowedToConnect = 1,
    /// SSH_DISCONNECT_PROTOCOL_ERROR
    ProtocolError = 2,
    /// SSH_DISCONNECT_KEY_EXCHANGE_FAILED
    KeyExchangeFailed = 3,
    /// SSH_DISCONNECT_RESERVED
    Reserved = 4,
    /// SSH_DISCONNECT_MAC_ERROR
    MacError = 5,
    /// SSH_DISCONNECT_COMPRESSION_ERROR
    CompressionError = 6,
    /// SSH_DISCONNECT_SERVICE_NOT_AVAILABLE
    ServiceNotAvailable = 7,
    /// SSH_DISCONNECT_PROTOCOL_VERSION_NOT_SUPPORTED
    ProtocolVersionNotSupported = 8,
    /// SSH_DISCONNECT_HOST_KEY_NOT_VERIFIABLE
    HostKeyNotVerifiable = 9,
    /// SSH_DISCONNECT_CONNECTION_LOST
    ConnectionLost = 10,
    /// SSH_DISCONNECT_BY_APPLICATION
    ByApplication = 11,
    /// SSH_DISCONNECT_TOO_MANY_CONNECTIONS
    TooManyConnections = 12,
    /// SSH_DISCONNECT_AUTH_CANCELLED_BY_USER
    AuthCancelledByUser = 13,
    /// SSH_DISCONNECT_NO_MORE_AUTH_METHODS_AVAILABLE
    NoMoreAuthMethodsAvailable = 14,
    /// SSH_DISCONNECT_ILLEGAL_USER_NAME
    IllegalUserName = 15,
}

impl DisconnectReason {
    /// Converts a wire value to a reason code.
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            1 => Some(Self::HostNotAllowedToConnect),
            2 => Some(Self::ProtocolError),
            3 => Some(Self::KeyExchangeFailed),
            4 => Some(Self::Reserved),
            5 => Some(Self::MacError),
            6 => Some(Self::CompressionError),
            7 => Some(Self::ServiceNotAvailable),
            8 => Some(Self::ProtocolVersionNotSupported),
            9 => Some(Self::HostKeyNotVerifiable),
            10 => Some(Self::ConnectionLost),
            11 => Some(Self::ByApplication),
            12 => Some(Self::TooManyConnections),
            13 => Some(Self::AuthCancelledByUser),
            14 => Some(Self::NoMoreAuthMethodsAvailable),
            15 => Some(Self::IllegalUserName),

            _ => None,
        }
    }
}

/// SSH_MSG_DISCONNECT payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Disconnect {
    /// Reason code.
    pub reason: DisconnectReason,
    /// Human readable description (may be empty).
    pub description: String,
    /// Language tag (usually empty).
    pub language: String,
}

impl Disconnect {
    /// Creates a new disconnect message.
    pub fn new(reason: DisconnectReason, description: &str) -> Self {
        Self {
            reason,
            description: description.to_string(),
            language: String::new(),
        }
    }

    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        use crate::ssh::codec;
        let mut buf = bytes::BytesMut::new();
        codec::put_byte(&mut buf, MessageType::Disconnect as u8);
        codec::put_uint32(&mut buf, self.reason as u32);
        codec::put_string_utf8(&mut buf, &self.description);
        codec::put_string_utf8(&mut buf, &self.language);
        buf.to_vec()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> KeelResult<Self> {
        use crate::ssh::codec;
        let mut offset = 0;
        let msg = codec::read_byte(data, &mut offset)?;
        if msg != MessageType::Disconnect as u8 {
            return Err(KeelError::Protocol(format!(
                "Invalid message type: expected 1 (SSH_MSG_DISCONNECT), got {}",
                msg
            )));
        }
        let code = codec::read_uint32(data, &mut offset)?;
        let reason = DisconnectReason::from_u32(code)
            .ok_or_else(|| KeelError::Protocol(format!("Unknown disconnect reason {}", code)))?;
        let description = codec::read_string_utf8(data, &mut offset)?;
        let language = codec::read_string_utf8(data, &mut offset)?;
        Ok(Self {
            reason,
            description,
            language,
        })
    }
}

/// SSH_MSG_UNIMPLEMENTED payload carrying the sequence number of the
/// offending packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Unimplemented {
    /// Sequence number of the packet that was not understood.
    pub sequence_number: u32,
}

impl Unimplemented {
    /// Creates the reply for the given inbound sequence number.
    pub fn new(sequence_number: u32) -> Self {
        Self { sequence_number }
    }

    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        use crate::ssh::codec;
        let mut buf = bytes::BytesMut::new();
        codec::put_byte(&mut buf, MessageType::Unimplemented as u8);
        codec::put_uint32(&mut buf, self.sequence_number);
        buf.to_vec()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> KeelResult<Self> {
        use crate::ssh::codec;
        let mut offset = 0;
        let msg = codec::read_byte(data, &mut offset)?;
        if msg != MessageType::Unimplemented as u8 {
            return Err(KeelError::Protocol(format!(
                "Invalid message type: expected 3 (SSH_MSG_UNIMPLEMENTED), got {}",
                msg
            )));
        }
        Ok(Self {
            sequence_number: codec::read_uint32(data, &mut offset)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_type_conversion() {
        assert_eq!(MessageType::from_u8(20), Some(MessageType::KexInit));
        assert_eq!(MessageType::from_u8(21), Some(MessageType::NewKeys));
        assert_eq!(MessageType::from_u8(61), Some(MessageType::UserauthInfoResponse));
        assert_eq!(MessageType::from_u8(255), None);
    }

    #[test]
    fn test_message_type_values() {
        assert_eq!(MessageType::Disconnect as u8, 1);
        assert_eq!(MessageType::KexInit as u8, 20);
        assert_eq!(MessageType::KexDhGexRequest as u8, 34);
        assert_eq!(MessageType::ChannelData as u8, 94);
    }

    #[test]
    fn test_range_classification() {
        assert_eq!(MessageRange::of(2), MessageRange::TransportGeneric);
        assert_eq!(MessageRange::of(20), MessageRange::KeyExchange);
        assert_eq!(MessageRange::of(49), MessageRange::KeyExchange);
        assert_eq!(MessageRange::of(50), MessageRange::UserAuth);
        assert_eq!(MessageRange::of(80), MessageRange::Connection);
        assert_eq!(MessageRange::of(127), MessageRange::Connection);
        assert_eq!(MessageRange::of(128), MessageRange::Reserved);
        assert_eq!(MessageRange::of(200), MessageRange::Reserved);
    }

    #[test]
    fn test_disconnect_round_trip() {
        let original = Disconnect::new(DisconnectReason::ProtocolError, "bad packet");
        let bytes = original.to_bytes();
        assert_eq!(bytes[0], 1);
        let parsed = Disconnect::from_bytes(&bytes).unwrap();
        assert_eq!(parsed, original);
    }

    #[test]
    fn test_disconnect_unknown_reason() {
        use crate::ssh::codec;
        let mut buf = bytes::BytesMut::new();
        codec::put_byte(&mut buf, 1);
        codec::put_uint32(&mut buf, 9999);
        codec::put_string_utf8(&mut buf, "");
        codec::put_string_utf8(&mut buf, "");
        assert!(Disconnect::from_bytes(&buf).is_err());
    }

    #[test]
    fn test_unimplemented_round_trip() {
        let original = Unimplemented::new(42);
        let parsed = Unimplemented::from_bytes(&original.to_bytes()).unwrap();
        assert_eq!(parsed.sequence_number, 42);
    }

    #[test]
    fn test_message_type_display() {
        assert_eq!(format!("{}", MessageType::KexInit), "SSH_MSG_KEXINIT(20)");
    }
}
