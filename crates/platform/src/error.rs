//! Error types for Keel.
//!
//! The variants follow the engine's failure taxonomy. Protocol, crypto
//! and negotiation errors are session-fatal; channel and SFTP errors are
//! local to the operation that raised them; `Timeout` is local unless it
//! fired on the transport liveness probe.

use std::fmt;

/// SFTP status codes (SSH_FX_*) surfaced through [`KeelError::Sftp`].
///
/// Codes 0-8 are the protocol version 3 set; the remaining values are
/// the version 4+ additions that a server may legally return once a
/// newer version has been negotiated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum SftpStatusCode {
    /// SSH_FX_OK - success
    Ok = 0,
    /// SSH_FX_EOF - end of file or directory
    Eof = 1,
    /// SSH_FX_NO_SUCH_FILE
    NoSuchFile = 2,
    /// SSH_FX_PERMISSION_DENIED
    PermissionDenied = 3,
    /// SSH_FX_FAILURE - generic failure
    Failure = 4,
    /// SSH_FX_BAD_MESSAGE - malformed request
    BadMessage = 5,
    /// SSH_FX_NO_CONNECTION - client has no connection
    NoConnection = 6,
    /// SSH_FX_CONNECTION_LOST
    ConnectionLost = 7,
    /// SSH_FX_OP_UNSUPPORTED
    OpUnsupported = 8,
    /// SSH_FX_INVALID_HANDLE (v4+)
    InvalidHandle = 9,
    /// SSH_FX_NO_SUCH_PATH (v4+)
    NoSuchPath = 10,
    /// SSH_FX_FILE_ALREADY_EXISTS (v4+)
    FileAlreadyExists = 11,
    /// SSH_FX_WRITE_PROTECT (v4+)
    WriteProtect = 12,
    /// SSH_FX_NO_MEDIA (v4+)
    NoMedia = 13,
    /// SSH_FX_NO_SPACE_ON_FILESYSTEM (v6)
    NoSpaceOnFilesystem = 14,
    /// SSH_FX_QUOTA_EXCEEDED (v6)
    QuotaExceeded = 15,
}

impl SftpStatusCode {
    /// Converts a wire value to a status code.
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(Self::Ok),
            1 => Some(Self::Eof),
            2 => Some(Self::NoSuchFile),
            3 => Some(Self::PermissionDenied),
            4 => Some(Self::Failure),
            5 => Some(Self::BadMessage),
            6 => Some(Self::NoConnection),
            7 => Some(Self::ConnectionLost),
            8 => Some(Self::OpUnsupported),
            9 => Some(Self::InvalidHandle),
            10 => Some(Self::NoSuchPath),
            11 => Some(Self::FileAlreadyExists),
            12 => Some(Self::WriteProtect),
            13 => Some(Self::NoMedia),
            14 => Some(Self::NoSpaceOnFilesystem),
            15 => Some(Self::QuotaExceeded),
            _ => None,
        }
    }

    /// Returns a human readable description.
    pub fn message(&self) -> &'static str {
        match self {
            Self::Ok => "Success",
            Self::Eof => "End of file",
            Self::NoSuchFile => "No such file or directory",
            Self::PermissionDenied => "Permission denied",
            Self::Failure => "Failure",
            Self::BadMessage => "Bad message",
            Self::NoConnection => "No connection",
            Self::ConnectionLost => "Connection lost",
            Self::OpUnsupported => "Operation not supported",
            Self::InvalidHandle => "Invalid handle",
            Self::NoSuchPath => "No such path",
            Self::FileAlreadyExists => "File already exists",
            Self::WriteProtect => "Write protected",
            Self::NoMedia => "No media",
            Self::NoSpaceOnFilesystem => "No space on filesystem",
            Self::QuotaExceeded => "Quota exceeded",
        }
    }
}

/// Unified error type for all Keel operations.
#[derive(Debug)]
pub enum KeelError {
    /// Underlying transport failed
    Io(std::io::Error),

    /// Configuration error
    Config(String),

    /// Malformed packet, bad sequence, unexpected message in state
    Protocol(String),

    /// MAC failure, signature failure, decryption failure
    Crypto(String),

    /// No common algorithm, host key rejected
    Negotiation(String),

    /// Authentication exhausted or credentials rejected
    Auth(String),

    /// Channel open refused, window violation, request failure
    Channel(String),

    /// SFTP status response other than OK/EOF
    Sftp {
        /// Status code reported by the server (or synthesised locally)
        code: SftpStatusCode,
        /// Server-supplied or synthesised message
        message: String,
    },

    /// Caller-supplied argument was invalid before any wire traffic
    InvalidArgument(String),

    /// An awaited operation exceeded its deadline
    Timeout,

    /// The operation's completion sink was dropped or cancelled
    Cancelled,
}

impl KeelError {
    /// Builds an SFTP error from a status code with its canned message.
    pub fn sftp(code: SftpStatusCode) -> Self {
        KeelError::Sftp {
            code,
            message: code.message().to_string(),
        }
    }

    /// Returns true when the error must tear the whole session down.
    ///
    /// Channel- and SFTP-level failures are local to the operation that
    /// raised them; everything protocol- or crypto-shaped is fatal.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            KeelError::Io(_)
                | KeelError::Protocol(_)
                | KeelError::Crypto(_)
                | KeelError::Negotiation(_)
        )
    }
}

impl fmt::Display for KeelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeelError::Io(e) => write!(f, "IO error: {}", e),
            KeelError::Config(msg) => write!(f, "Configuration error: {}", msg),
            KeelError::Protocol(msg) => write!(f, "Protocol error: {}", msg),
            KeelError::Crypto(msg) => write!(f, "Cryptographic error: {}", msg),
            KeelError::Negotiation(msg) => write!(f, "Negotiation error: {}", msg),
            KeelError::Auth(msg) => write!(f, "Authentication error: {}", msg),
            KeelError::Channel(msg) => write!(f, "Channel error: {}", msg),
            KeelError::Sftp { code, message } => {
                write!(f, "SFTP error {}: {}", *code as u32, message)
            }
            KeelError::InvalidArgument(msg) => write!(f, "Invalid argument: {}", msg),
            KeelError::Timeout => write!(f, "Operation timed out"),
            KeelError::Cancelled => write!(f, "Operation cancelled"),
        }
    }
}

impl std::error::Error for KeelError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            KeelError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for KeelError {
    fn from(err: std::io::Error) -> Self {
        KeelError::Io(err)
    }
}

/// Result type for Keel operations
pub type KeelResult<T> = Result<T, KeelError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = KeelError::Config("Invalid configuration".to_string());
        assert_eq!(
            err.to_string(),
            "Configuration error: Invalid configuration"
        );
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let keel_err: KeelError = io_err.into();
        assert!(matches!(keel_err, KeelError::Io(_)));
        assert!(keel_err.is_fatal());
    }

    #[test]
    fn test_sftp_error_display() {
        let err = KeelError::sftp(SftpStatusCode::NoSuchFile);
        assert_eq!(err.to_string(), "SFTP error 2: No such file or directory");
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_sftp_status_round_trip() {
        for value in 0..=15u32 {
            let code = SftpStatusCode::from_u32(value).unwrap();
            assert_eq!(code as u32, value);
        }
        assert!(SftpStatusCode::from_u32(999).is_none());
    }

    #[test]
    fn test_fatality_split() {
        assert!(KeelError::Protocol("x".into()).is_fatal());
        assert!(KeelError::Crypto("x".into()).is_fatal());
        assert!(KeelError::Negotiation("x".into()).is_fatal());
        assert!(!KeelError::Channel("x".into()).is_fatal());
        assert!(!KeelError::Auth("x".into()).is_fatal());
        assert!(!KeelError::Timeout.is_fatal());
        assert!(!KeelError::Cancelled.is_fatal());
    }
}
