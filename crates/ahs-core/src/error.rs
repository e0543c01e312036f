use thiserror::Error;

/// Errors produced by the AHS protocol layer.
#[derive(Debug, Error)]
pub enum AhsError {
    #[error("codec error: {0}")]
    Codec(String),

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("token error: {0}")]
    Token(String),

    #[error("invalid key format: {0}")]
    InvalidKeyFormat(String),

    #[error("unsupported curve: {0}")]
    UnsupportedCurve(String),

    #[error("crypto error: {0}")]
    Crypto(String),

    #[error("unknown namespace: {0}")]
    UnknownNamespace(String),

    #[error("unknown command: {namespace}.{command}")]
    UnknownCommand { namespace: String, command: String },

    #[error("missing parameters: {}", .0.join(", "))]
    MissingParameters(Vec<String>),

    #[error("invalid parameter '{name}': expected {expected}")]
    InvalidParameter { name: String, expected: String },

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("channel error: {0}")]
    Channel(String),

    #[error("key conflict: {0}")]
    KeyConflict(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl From<ciborium::de::Error<std::io::Error>> for AhsError {
    fn from(e: ciborium::de::Error<std::io::Error>) -> Self {
        AhsError::Codec(e.to_string())
    }
}

impl From<ciborium::ser::Error<std::io::Error>> for AhsError {
    fn from(e: ciborium::ser::Error<std::io::Error>) -> Self {
        AhsError::Codec(e.to_string())
    }
}

impl From<serde_json::Error> for AhsError {
    fn from(e: serde_json::Error) -> Self {
        AhsError::Codec(e.to_string())
    }
}

pub type AhsResult<T> = Result<T, AhsError>;
