//! Credential storage capability
//!
//! The session persists its authentication context through a plain
//! key/value interface so it can survive restarts without knowing where the
//! bytes end up. Applications plug in whatever medium they have (a file, a
//! keychain, browser storage behind FFI); `MemoryCredentialStore` covers
//! tests and short-lived processes.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use tiip_core::Result;

/// Key under which the session stores its record
pub const AUTH_STORAGE_KEY: &str = "tiip.auth";

/// Key/value store for persisted credentials
pub trait CredentialStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;

    fn set(&self, key: &str, value: &str) -> Result<()>;

    /// Remove a key; removing a missing key is not an error
    fn remove(&self, key: &str) -> Result<()>;
}

/// Process-local credential store
#[derive(Debug, Default)]
pub struct MemoryCredentialStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(entries.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.remove(key);
        Ok(())
    }
}
