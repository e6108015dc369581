//! Error types for cryptmirror

use std::fmt;
use std::io;
use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for cryptmirror
#[derive(Error, Debug)]
pub enum Error {
    // Transport errors
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Fatal transport error: {message}")]
    FatalTransport {
        message: String,
        /// The sink connection itself is gone; a reconnect may help
        connection_lost: bool,
    },

    // Data errors
    #[error("Integrity error: {0}")]
    Integrity(String),

    #[error("File too large: {path} needs {size} bytes of ciphertext, limit is {limit}")]
    TooLarge { path: String, size: u64, limit: u64 },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Corrupt {file} at line {line}: {reason}")]
    Corrupt {
        file: String,
        line: usize,
        reason: String,
    },

    // Crypto errors
    #[error("Encryption error: {0}")]
    Encryption(String),

    #[error("Decryption error: {0}")]
    Decryption(String),

    #[error("Invalid key length: expected {expected}, got {got}")]
    InvalidKeyLength { expected: usize, got: usize },

    // Config errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Status file is locked by another run: {0}")]
    Locked(String),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Coarse error categories reported back to callers in issue lists
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Transport,
    FatalTransport,
    Integrity,
    TooLarge,
    NotFound,
    Config,
    Io,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Transport => "TransportError",
            ErrorKind::FatalTransport => "FatalTransportError",
            ErrorKind::Integrity => "IntegrityError",
            ErrorKind::TooLarge => "TooLargeError",
            ErrorKind::NotFound => "NotFound",
            ErrorKind::Config => "ConfigError",
            ErrorKind::Io => "IoError",
        };
        f.write_str(name)
    }
}

impl Error {
    /// Category of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Transport(_) => ErrorKind::Transport,
            Error::FatalTransport { .. } => ErrorKind::FatalTransport,
            Error::Integrity(_)
            | Error::Corrupt { .. }
            | Error::Decryption(_)
            | Error::Encryption(_) => ErrorKind::Integrity,
            Error::TooLarge { .. } => ErrorKind::TooLarge,
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::Config(_) | Error::InvalidKeyLength { .. } | Error::Locked(_) => {
                ErrorKind::Config
            }
            Error::Io(_) | Error::Internal(_) => ErrorKind::Io,
        }
    }

    /// Whether retrying the same operation may succeed
    pub fn is_retriable(&self) -> bool {
        matches!(self, Error::Transport(_))
    }

    /// Whether the sink connection must be re-established before continuing
    pub fn is_connection_lost(&self) -> bool {
        matches!(
            self,
            Error::FatalTransport {
                connection_lost: true,
                ..
            }
        )
    }

    pub(crate) fn fatal(message: impl Into<String>) -> Self {
        Error::FatalTransport {
            message: message.into(),
            connection_lost: false,
        }
    }

    pub(crate) fn connection_lost(message: impl Into<String>) -> Self {
        Error::FatalTransport {
            message: message.into(),
            connection_lost: true,
        }
    }
}

impl From<regex::Error> for Error {
    fn from(e: regex::Error) -> Self {
        Error::Config(format!("Invalid regular expression: {}", e))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Config(e.to_string())
    }
}
