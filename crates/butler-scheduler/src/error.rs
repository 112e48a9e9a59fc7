use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("Database error: {0}")]
    Database(#[from] butler_db::DbError),

    #[error("Invalid schedule: {0}")]
    InvalidSchedule(String),

    #[error("Schedule not found: {name}")]
    NotFound { name: String },
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
