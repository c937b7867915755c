use thiserror::Error;

/// Crate-wide error type. Each variant corresponds to one failure domain so
/// callers can decide between retry, skip, and abort without string matching.
#[derive(Debug, Clone, Error)]
pub enum WardenError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("Remote operation failed: {0}")]
    Remote(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Listener error: {0}")]
    Listener(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("IO error: {0}")]
    Io(String),
}

pub type Result<T> = std::result::Result<T, WardenError>;

impl From<std::io::Error> for WardenError {
    fn from(err: std::io::Error) -> Self {
        WardenError::Io(err.to_string())
    }
}

impl From<rusqlite::Error> for WardenError {
    fn from(err: rusqlite::Error) -> Self {
        WardenError::Store(err.to_string())
    }
}

impl From<r2d2::Error> for WardenError {
    fn from(err: r2d2::Error) -> Self {
        WardenError::Store(err.to_string())
    }
}

impl From<serde_json::Error> for WardenError {
    fn from(err: serde_json::Error) -> Self {
        WardenError::Parse(err.to_string())
    }
}

impl From<mailparse::MailParseError> for WardenError {
    fn from(err: mailparse::MailParseError) -> Self {
        WardenError::Parse(err.to_string())
    }
}

impl From<reqwest::Error> for WardenError {
    fn from(err: reqwest::Error) -> Self {
        WardenError::Connection(err.to_string())
    }
}

impl From<toml::de::Error> for WardenError {
    fn from(err: toml::de::Error) -> Self {
        WardenError::Listener(err.to_string())
    }
}
