use thiserror::Error;

#[derive(Debug, Error)]
pub enum ButlerError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Configuration error: {0}")]
    Config(String),

    /// Aggregated missing-credentials report produced at startup.
    /// Each entry is `(variable, source)` where source is `core`,
    /// `butler.env`, or `module:<name>`.
    #[error("Missing required credentials: {}", format_missing(.missing))]
    Credential { missing: Vec<(String, String)> },

    #[error("Module '{module}' failed during {phase}: {message}")]
    ModuleStartup {
        module: String,
        phase: String,
        message: String,
    },

    #[error("Butler '{butler}' is unreachable: {reason}")]
    ButlerUnreachable { butler: String, reason: String },

    #[error("OAuth token exchange failed: {0}")]
    TokenExchange(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Runtime adapter error: {0}")]
    Runtime(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Request timeout after {ms}ms")]
    Timeout { ms: u64 },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ButlerError {
    /// Short error code string used at the HTTP/MCP edges.
    pub fn code(&self) -> &'static str {
        match self {
            ButlerError::Validation(_) => "VALIDATION_ERROR",
            ButlerError::Config(_) => "CONFIG_ERROR",
            ButlerError::Credential { .. } => "CREDENTIAL_ERROR",
            ButlerError::ModuleStartup { .. } => "MODULE_STARTUP_ERROR",
            ButlerError::ButlerUnreachable { .. } => "BUTLER_UNREACHABLE",
            ButlerError::TokenExchange(_) => "TOKEN_EXCHANGE_ERROR",
            ButlerError::Database(_) => "DATABASE_ERROR",
            ButlerError::Runtime(_) => "RUNTIME_ERROR",
            ButlerError::Serialization(_) => "SERIALIZATION_ERROR",
            ButlerError::Io(_) => "IO_ERROR",
            ButlerError::Timeout { .. } => "TIMEOUT",
            ButlerError::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

fn format_missing(missing: &[(String, String)]) -> String {
    missing
        .iter()
        .map(|(var, source)| format!("{var} ({source})"))
        .collect::<Vec<_>>()
        .join(", ")
}

pub type Result<T> = std::result::Result<T, ButlerError>;
