use thiserror::Error;

#[derive(Debug, Error)]
pub enum NtfsError {
    #[error("Format corruption: {0}")]
    FormatCorruption(String),

    #[error("Capacity exhausted: {0}")]
    CapacityExhausted(String),

    #[error("Logical misuse: {0}")]
    LogicalMisuse(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Not supported: {0}")]
    NotSupported(String),
}

impl NtfsError {
    /// Whether the volume should be considered unusable after this error.
    ///
    /// `NotFound` is ordinary control flow; misuse and bad input are caller bugs
    /// that leave the volume untouched.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            NtfsError::FormatCorruption(_) | NtfsError::CapacityExhausted(_) | NtfsError::IoError(_)
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, NtfsError::NotFound(_))
    }
}

pub type Result<T> = std::result::Result<T, NtfsError>;
