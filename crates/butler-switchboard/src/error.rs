use thiserror::Error;

#[derive(Debug, Error)]
pub enum SwitchboardError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Database error: {0}")]
    Database(#[from] butler_db::DbError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<butler_protocol::envelope::EnvelopeError> for SwitchboardError {
    fn from(e: butler_protocol::envelope::EnvelopeError) -> Self {
        SwitchboardError::Validation(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SwitchboardError>;
