use thiserror::Error;

/// Coarse classification of every failure a voice session can surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    PermissionDenied,
    DeviceNotFound,
    AuthFailure,
    NetworkError,
    UnknownError,
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("Microphone permission denied")]
    PermissionDenied,

    #[error("No capture device found")]
    DeviceNotFound,

    #[error("Audio capture failed: {0}")]
    Capture(String),

    #[error("Authentication failed: {0}")]
    AuthFailure(String),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("HTTP protocol error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Relay returned {status}: {message}")]
    Relay { status: u16, message: String },

    #[error("Failed to parse or serialize JSON: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid URL: {0}")]
    Url(#[from] url::ParseError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid base64 payload: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("Invalid audio payload: {0}")]
    InvalidAudio(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("The connection was closed unexpectedly")]
    ConnectionClosed,

    #[error("Session start was cancelled")]
    Cancelled,
}

impl Error {
    /// Classify the error into the session taxonomy.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::PermissionDenied => ErrorKind::PermissionDenied,
            Self::DeviceNotFound => ErrorKind::DeviceNotFound,
            Self::AuthFailure(_) => ErrorKind::AuthFailure,
            Self::WebSocket(_) | Self::Http(_) | Self::Io(_) | Self::ConnectionClosed => {
                ErrorKind::NetworkError
            }
            _ => ErrorKind::UnknownError,
        }
    }

    /// The single message shown to the user when a session fails.
    #[must_use]
    pub fn user_message(&self) -> String {
        match self.kind() {
            ErrorKind::PermissionDenied => {
                "Microphone permission denied. Check your system audio settings.".to_string()
            }
            ErrorKind::DeviceNotFound => "No microphone found.".to_string(),
            ErrorKind::AuthFailure => "Could not authenticate with the voice server.".to_string(),
            ErrorKind::NetworkError => "Connection error with the AI. Please try again.".to_string(),
            ErrorKind::UnknownError => format!("Could not connect: {self}"),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
