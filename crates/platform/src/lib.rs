//! # Keel Platform
//!
//! Shared plumbing for the Keel SSH stack.
//!
//! This crate provides the unified error type ([`KeelError`]) and result
//! alias ([`KeelResult`]) used by every other crate in the workspace. It
//! deliberately knows nothing about the wire protocol; the error variants
//! mirror the failure taxonomy of the engine (protocol, crypto,
//! negotiation, authentication, channel, SFTP, I/O, timeout,
//! cancellation) so callers can decide between fatal and local handling
//! without string matching.
//!
//! # Examples
//!
//! ```
//! use keel_platform::{KeelError, KeelResult};
//!
//! fn example_function() -> KeelResult<String> {
//!     Ok("Hello, Keel!".to_string())
//! }
//!
//! # fn main() -> KeelResult<()> {
//! let result = example_function()?;
//! assert_eq!(result, "Hello, Keel!");
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod error;

pub use error::{KeelError, KeelResult, SftpStatusCode};

/// Platform version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
