//! DB-first secret resolution with env fallback.
//!
//! Each butler reads its own `butler_secrets` table first, then the shared
//! (and optionally legacy) databases, then — when allowed — the environment.
//! Raw secret values never appear in logs, Debug output, or listings.

pub mod backfill;
pub mod error;
pub mod scan;
pub mod store;
pub mod validate;

pub use backfill::backfill_shared_secrets;
pub use error::{CredentialError, Result};
pub use scan::{scan_config_for_secrets, SecretWarning};
pub use store::{CredentialStore, SecretMetadata};
pub use validate::{validate_credentials, RequiredCredentials};
