//! Engine error type.
//!
//! The taxonomy follows the retry rules of the protocol: transient
//! reply failures (4xx) may be retried unmodified, permanent ones (5xx)
//! must not be, a lost connection is only retryable at an operation
//! boundary, and integrity/resource failures are resolved by policy,
//! never by silently keeping a partial file.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Categorised engine error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FtpError {
    pub kind: FtpErrorKind,
    pub message: String,
    /// FTP reply code that triggered the error, if any.
    pub code: Option<u16>,
    /// OS-level error code, if any.
    pub os_error: Option<i32>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub enum FtpErrorKind {
    /// TCP / DNS / proxy failure while opening a connection.
    ConnectionFailed,
    /// TLS handshake or certificate failure.
    TlsFailed,
    /// Login sequence rejected (USER/PASS/ACCT).
    AuthFailed,
    /// Server returned a 4xx reply; retry of the same command may succeed.
    ProtocolTransient,
    /// Server returned a 5xx reply; never retried unmodified.
    ProtocolPermanent,
    /// Control connection timed out or closed abruptly mid-command.
    ConnectionLost,
    /// Data channel could not be established or died prematurely.
    DataChannelFailed,
    /// Server sent something we cannot parse.
    ProtocolError,
    /// Out of memory, disk full and the like.
    Resource,
    /// Resume-overlap mismatch or ASCII/binary mismatch.
    Integrity,
    /// Local file I/O failure.
    Io,
    /// Operation cancelled by the user.
    Cancelled,
    /// Parameter validation failure.
    InvalidConfig,
}

pub type FtpResult<T> = Result<T, FtpError>;

impl FtpError {
    pub fn new(kind: FtpErrorKind, msg: impl Into<String>) -> Self {
        Self {
            kind,
            message: msg.into(),
            code: None,
            os_error: None,
        }
    }

    pub fn with_code(mut self, code: u16) -> Self {
        self.code = Some(code);
        self
    }

    pub fn with_os_error(mut self, os: i32) -> Self {
        self.os_error = Some(os);
        self
    }

    // ── Convenience constructors ─────────────────────────────────

    pub fn connection_failed(msg: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::ConnectionFailed, msg)
    }

    pub fn tls_failed(msg: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::TlsFailed, msg)
    }

    pub fn auth_failed(msg: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::AuthFailed, msg)
    }

    pub fn connection_lost(msg: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::ConnectionLost, msg)
    }

    pub fn data_channel(msg: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::DataChannelFailed, msg)
    }

    pub fn protocol_error(msg: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::ProtocolError, msg)
    }

    pub fn resource(msg: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::Resource, msg)
    }

    pub fn integrity(msg: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::Integrity, msg)
    }

    pub fn io_error(msg: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::Io, msg)
    }

    pub fn cancelled() -> Self {
        Self::new(FtpErrorKind::Cancelled, "Operation cancelled")
    }

    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::InvalidConfig, msg)
    }

    /// Classify an FTP reply code into the retry taxonomy.
    ///
    /// 421 means the server is closing the control connection, which for
    /// the caller is indistinguishable from losing it.
    pub fn from_reply(code: u16, text: &str) -> Self {
        let kind = match code {
            421 => FtpErrorKind::ConnectionLost,
            425 | 426 => FtpErrorKind::DataChannelFailed,
            430 | 530 | 532 => FtpErrorKind::AuthFailed,
            400..=499 => FtpErrorKind::ProtocolTransient,
            500..=599 => FtpErrorKind::ProtocolPermanent,
            _ => FtpErrorKind::ProtocolError,
        };
        Self {
            kind,
            message: text.to_string(),
            code: Some(code),
            os_error: None,
        }
    }

    /// Whether retrying the same command unmodified is allowed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self.kind,
            FtpErrorKind::ProtocolTransient | FtpErrorKind::DataChannelFailed
        )
    }
}

impl fmt::Display for FtpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(code) = self.code {
            write!(f, "[{:?} {}] {}", self.kind, code, self.message)
        } else {
            write!(f, "[{:?}] {}", self.kind, self.message)
        }
    }
}

impl std::error::Error for FtpError {}

impl From<std::io::Error> for FtpError {
    fn from(e: std::io::Error) -> Self {
        use std::io::ErrorKind;
        let kind = match e.kind() {
            ErrorKind::TimedOut => FtpErrorKind::ConnectionLost,
            ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
            | ErrorKind::UnexpectedEof => FtpErrorKind::ConnectionLost,
            ErrorKind::OutOfMemory => FtpErrorKind::Resource,
            _ => FtpErrorKind::Io,
        };
        let os = e.raw_os_error();
        let mut err = Self::new(kind, e.to_string());
        if let Some(os) = os {
            err = err.with_os_error(os);
        }
        err
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reply_classification() {
        assert_eq!(
            FtpError::from_reply(450, "busy").kind,
            FtpErrorKind::ProtocolTransient
        );
        assert_eq!(
            FtpError::from_reply(550, "No such file").kind,
            FtpErrorKind::ProtocolPermanent
        );
        assert_eq!(
            FtpError::from_reply(421, "closing").kind,
            FtpErrorKind::ConnectionLost
        );
        assert_eq!(
            FtpError::from_reply(530, "bad login").kind,
            FtpErrorKind::AuthFailed
        );
    }

    #[test]
    fn permanent_is_not_transient() {
        assert!(FtpError::from_reply(450, "x").is_transient());
        assert!(!FtpError::from_reply(550, "x").is_transient());
        assert!(!FtpError::connection_lost("x").is_transient());
    }

    #[test]
    fn io_error_mapping() {
        let e: FtpError = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "rst").into();
        assert_eq!(e.kind, FtpErrorKind::ConnectionLost);
        let e: FtpError = std::io::Error::new(std::io::ErrorKind::NotFound, "nf").into();
        assert_eq!(e.kind, FtpErrorKind::Io);
    }
}
