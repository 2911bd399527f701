use thiserror::Error;

#[derive(Debug, Error)]
pub enum DuebellError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid recurrence: {0}")]
    InvalidRecurrence(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl DuebellError {
    /// Short error code string used in structured log fields.
    pub fn code(&self) -> &'static str {
        match self {
            DuebellError::Config(_) => "CONFIG_ERROR",
            DuebellError::InvalidRecurrence(_) => "INVALID_RECURRENCE",
            DuebellError::Serialization(_) => "SERIALIZATION_ERROR",
            DuebellError::Io(_) => "IO_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, DuebellError>;
