//! In-memory credential store for tests.

use std::collections::HashMap;
use std::sync::RwLock;

use crate::auth::account::Account;
use crate::auth::store::CredentialStore;
use crate::error::{Error, Result};

/// Credential store backed by a `HashMap`. Never persists anything.
#[derive(Default)]
pub struct MemoryCredentialStore {
    accounts: RwLock<HashMap<String, Account>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn load(&self, name: &str) -> Result<Account> {
        self.accounts
            .read()
            .expect("memory store lock poisoned")
            .get(name)
            .cloned()
            .ok_or_else(|| Error::storage(name, "no such account"))
    }

    fn load_dir(&self, _path: &std::path::Path) -> Result<Vec<Account>> {
        Ok(Vec::new())
    }

    fn save(&self, account: &Account) -> Result<()> {
        self.accounts
            .write()
            .expect("memory store lock poisoned")
            .insert(account.id.clone(), account.clone());
        Ok(())
    }

    fn delete(&self, name: &str) -> Result<()> {
        self.accounts
            .write()
            .expect("memory store lock poisoned")
            .remove(name);
        Ok(())
    }

    fn list(&self) -> Result<Vec<Account>> {
        let mut accounts: Vec<Account> = self
            .accounts
            .read()
            .expect("memory store lock poisoned")
            .values()
            .cloned()
            .collect();
        accounts.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(accounts)
    }

    fn name(&self) -> &str {
        "memory"
    }
}
