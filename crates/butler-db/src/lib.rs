pub mod migrate;
pub mod pool;

pub use migrate::{run_migrations, Chain, Migration};
pub use pool::{Db, DbError, Result};
