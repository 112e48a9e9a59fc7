use thiserror::Error;

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Database error: {0}")]
    Database(#[from] butler_db::DbError),

    /// Aggregated startup report — every missing required variable with its
    /// source partition (`core`, `butler.env`, `module:<name>`).
    #[error("Missing required credentials: {}", .missing.iter()
        .map(|(var, source)| format!("{var} ({source})"))
        .collect::<Vec<_>>()
        .join(", "))]
    MissingRequired { missing: Vec<(String, String)> },
}

pub type Result<T> = std::result::Result<T, CredentialError>;
