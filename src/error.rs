//! Error types for parley

use thiserror::Error;

use crate::voice::SpeakerId;

/// Result type alias for parley operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while coordinating a voice session
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// IO error (artifact write, delete or read)
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// WebSocket transport error
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// A capture segment already exists for this speaker
    #[error("already capturing speaker {0}")]
    AlreadyCapturing(SpeakerId),

    /// Malformed audio chunk or undecodable artifact
    #[error("decode error: {0}")]
    Decode(String),

    /// Audio device error
    #[error("audio error: {0}")]
    Audio(String),

    /// Discord gateway or voice error
    #[error("discord error: {0}")]
    Discord(String),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Failure class used when logging and recovering from an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// File write/delete/read failure; logged, work continues
    Io,
    /// Control channel failure; a reconnect is scheduled
    Connection,
    /// Rejected state transition; existing state is untouched
    State,
    /// Malformed audio; the affected segment or item is abandoned
    Decode,
    /// Startup-time failure (configuration, devices, gateway login)
    Setup,
}

impl Error {
    /// Classify this error
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Io(_) => ErrorKind::Io,
            Self::WebSocket(_) => ErrorKind::Connection,
            Self::AlreadyCapturing(_) => ErrorKind::State,
            Self::Decode(_) => ErrorKind::Decode,
            Self::Config(_) | Self::Audio(_) | Self::Discord(_) | Self::Toml(_) => {
                ErrorKind::Setup
            }
        }
    }
}
