//! Credential persistence backends.
//!
//! Provides the [`CredentialStore`] trait and two implementations:
//! - [`FileCredentialStore`] - one JSON file per account, 0600/0700 modes
//! - [`MemoryCredentialStore`] - in-memory store for tests
//!
//! The store is constructed once at startup with a configured path and owned
//! by the auth manager.

mod file;
mod memory;

pub use file::FileCredentialStore;
pub use memory::MemoryCredentialStore;

use crate::auth::account::Account;
use crate::error::Result;

/// Trait for credential storage backends.
///
/// All implementations must be thread-safe (`Send + Sync`). Save/Delete are
/// serialized by a single writer inside each implementation.
pub trait CredentialStore: Send + Sync {
    /// Load one account from a single credential file.
    fn load(&self, name: &str) -> Result<Account>;

    /// Load a logical account split across a directory of sibling JSON
    /// files (AWS SSO cache layout): the primary file is read first and
    /// sibling fields are merged in without overwriting.
    fn load_dir(&self, path: &std::path::Path) -> Result<Vec<Account>>;

    /// Persist an account. Must be write-rename atomic.
    fn save(&self, account: &Account) -> Result<()>;

    /// Remove the stored account by name.
    fn delete(&self, name: &str) -> Result<()>;

    /// Enumerate all stored accounts, skipping unreadable files.
    fn list(&self) -> Result<Vec<Account>>;

    /// The name of this storage backend.
    fn name(&self) -> &str;
}

impl<T: CredentialStore + ?Sized> CredentialStore for std::sync::Arc<T> {
    fn load(&self, name: &str) -> Result<Account> {
        (**self).load(name)
    }
    fn load_dir(&self, path: &std::path::Path) -> Result<Vec<Account>> {
        (**self).load_dir(path)
    }
    fn save(&self, account: &Account) -> Result<()> {
        (**self).save(account)
    }
    fn delete(&self, name: &str) -> Result<()> {
        (**self).delete(name)
    }
    fn list(&self) -> Result<Vec<Account>> {
        (**self).list()
    }
    fn name(&self) -> &str {
        (**self).name()
    }
}
