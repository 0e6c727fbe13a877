//! Error types and result definitions for the projector bridge.
//! The first four variants are the taxonomy the core acts on; the rest are
//! transport-level failures that the session folds into them.

use thiserror::Error;

/// Represents all possible errors raised while driving a projector.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProjectorError {
    /// The device could not be reached (discovery, TCP connect, handshake)
    #[error("Connection error: {0}")]
    Connection(String),

    /// A `get` or `set` request was not delivered to the device
    #[error("Command error: {0}")]
    Command(String),

    /// A device payload (colour, scene, DP value) could not be interpreted
    #[error("Decode error: {0}")]
    Decode(String),

    /// A device or scene definition is invalid
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Standard IO error (network, timeout, etc.)
    #[error("IO error: {0}")]
    Io(String),

    /// JSON serialization or deserialization error
    #[error("JSON error: {0}")]
    Json(String),

    /// Request timed out
    #[error("Timeout waiting for device")]
    Timeout,

    /// Device is currently unreachable or disconnected
    #[error("Device offline")]
    Offline,

    /// Failed to encrypt a message for the device
    #[error("Encryption failed")]
    EncryptionFailed,

    /// Failed to decrypt a message from the device (wrong key or version)
    #[error("Decryption failed")]
    DecryptionFailed,

    /// CRC check failed for the received message
    #[error("CRC mismatch")]
    CrcMismatch,

    /// HMAC signature verification failed (v3.4)
    #[error("HMAC mismatch")]
    HmacMismatch,

    /// The message header was invalid
    #[error("Invalid header")]
    InvalidHeader,

    /// Generic error for wrong local key or protocol version
    #[error("Check device key or version")]
    KeyOrVersion,
}

/// A specialized Result type for projector operations.
pub type Result<T> = std::result::Result<T, ProjectorError>;

impl From<std::io::Error> for ProjectorError {
    fn from(err: std::io::Error) -> Self {
        ProjectorError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for ProjectorError {
    fn from(err: serde_json::Error) -> Self {
        ProjectorError::Json(err.to_string())
    }
}

impl ProjectorError {
    /// Folds a transport failure on the connect path into `Connection`.
    pub fn into_connection(self) -> Self {
        match self {
            e @ ProjectorError::Connection(_) => e,
            e => ProjectorError::Connection(e.to_string()),
        }
    }

    /// Folds a transport failure on the request path into `Command`.
    pub fn into_command(self) -> Self {
        match self {
            e @ ProjectorError::Command(_) => e,
            e => ProjectorError::Command(e.to_string()),
        }
    }

    pub fn is_configuration(&self) -> bool {
        matches!(self, ProjectorError::Configuration(_))
    }
}
