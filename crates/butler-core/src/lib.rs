pub mod config;
pub mod error;
pub mod ids;

pub use error::{ButlerError, Result};
