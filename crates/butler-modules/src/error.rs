use thiserror::Error;

#[derive(Debug, Error)]
pub enum ModuleError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Module '{module}' failed during {phase}: {message}")]
    Startup {
        module: String,
        phase: String,
        message: String,
    },

    #[error("Module shutdown error: {0}")]
    Shutdown(String),

    #[error("Database error: {0}")]
    Database(#[from] butler_db::DbError),
}

pub type Result<T> = std::result::Result<T, ModuleError>;
