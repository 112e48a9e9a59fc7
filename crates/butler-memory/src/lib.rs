pub mod context;
pub mod db;
pub mod error;
pub mod store;
pub mod types;

pub use context::memory_context;
pub use error::MemoryError;
pub use store::MemoryStore;
pub use types::{Fact, MemoryKind, MemoryRecord, Permanence, Validity};
