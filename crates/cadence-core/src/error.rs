use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid identifier {value:?}: {reason}")]
    InvalidId { value: String, reason: String },
}

impl CoreError {
    /// Short error code string used in structured log fields.
    pub fn code(&self) -> &'static str {
        match self {
            CoreError::Config(_) => "CONFIG_ERROR",
            CoreError::InvalidId { .. } => "INVALID_ID",
        }
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;
