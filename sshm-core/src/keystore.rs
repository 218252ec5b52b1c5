//! Secret-store abstraction for the symmetric encryption key.
//!
//! The cipher layer never talks to the OS keychain directly; it goes through
//! the [`KeyStore`] trait so the store can be swapped for an in-memory
//! implementation in tests.  The production implementation ([`OsKeyStore`])
//! is backed by the platform keychain via the `keyring` crate (macOS
//! Keychain, Windows Credential Manager, Linux kernel keyutils).

use std::collections::HashMap;
use std::sync::Mutex;

use zeroize::Zeroizing;

/// Keychain service name under which sshm stores its key material.
pub const SERVICE: &str = "sshm";

/// Account name of the single symmetric encryption key.
pub const KEY_ACCOUNT: &str = "encryption-key";

/// A failure talking to the underlying secret store.
#[derive(Debug, thiserror::Error)]
#[error("secret store entry {service}/{account}: {message}")]
pub struct StoreError {
    pub service: String,
    pub account: String,
    pub message: String,
}

impl StoreError {
    fn new(service: &str, account: &str, message: impl ToString) -> Self {
        Self {
            service: service.to_string(),
            account: account.to_string(),
            message: message.to_string(),
        }
    }
}

/// Minimal get/set view of an external secret store.
///
/// `get` returns `Ok(None)` when no entry exists for the pair — absence is
/// not an error, it is the signal for the cipher layer's generate-on-miss
/// path.
pub trait KeyStore {
    fn get(&self, service: &str, account: &str) -> Result<Option<Zeroizing<Vec<u8>>>, StoreError>;
    fn set(&self, service: &str, account: &str, secret: &[u8]) -> Result<(), StoreError>;
}

// ---------------------------------------------------------------------------
// OS keychain implementation
// ---------------------------------------------------------------------------

/// [`KeyStore`] backed by the platform keychain.
#[derive(Debug, Default, Clone, Copy)]
pub struct OsKeyStore;

impl KeyStore for OsKeyStore {
    fn get(&self, service: &str, account: &str) -> Result<Option<Zeroizing<Vec<u8>>>, StoreError> {
        let entry = keyring::Entry::new(service, account)
            .map_err(|e| StoreError::new(service, account, e))?;
        match entry.get_secret() {
            Ok(bytes) => Ok(Some(Zeroizing::new(bytes))),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(StoreError::new(service, account, e)),
        }
    }

    fn set(&self, service: &str, account: &str, secret: &[u8]) -> Result<(), StoreError> {
        let entry = keyring::Entry::new(service, account)
            .map_err(|e| StoreError::new(service, account, e))?;
        entry
            .set_secret(secret)
            .map_err(|e| StoreError::new(service, account, e))
    }
}

// ---------------------------------------------------------------------------
// In-memory implementation
// ---------------------------------------------------------------------------

/// [`KeyStore`] held entirely in memory.
///
/// Used by the cipher tests so no test run ever touches the real keychain.
#[derive(Debug, Default)]
pub struct MemoryKeyStore {
    entries: Mutex<HashMap<(String, String), Vec<u8>>>,
}

impl KeyStore for MemoryKeyStore {
    fn get(&self, service: &str, account: &str) -> Result<Option<Zeroizing<Vec<u8>>>, StoreError> {
        let entries = self.entries.lock().expect("keystore mutex poisoned");
        Ok(entries
            .get(&(service.to_string(), account.to_string()))
            .map(|v| Zeroizing::new(v.clone())))
    }

    fn set(&self, service: &str, account: &str, secret: &[u8]) -> Result<(), StoreError> {
        let mut entries = self.entries.lock().expect("keystore mutex poisoned");
        entries.insert((service.to_string(), account.to_string()), secret.to_vec());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_store_get_missing_returns_none() {
        let store = MemoryKeyStore::default();
        assert!(store.get(SERVICE, KEY_ACCOUNT).unwrap().is_none());
    }

    #[test]
    fn memory_store_set_then_get() {
        let store = MemoryKeyStore::default();
        store.set(SERVICE, KEY_ACCOUNT, b"key-material").unwrap();
        let got = store.get(SERVICE, KEY_ACCOUNT).unwrap().unwrap();
        assert_eq!(got.as_slice(), b"key-material");
    }

    #[test]
    fn memory_store_entries_are_scoped_by_pair() {
        let store = MemoryKeyStore::default();
        store.set("a", "x", b"one").unwrap();
        store.set("b", "x", b"two").unwrap();
        assert_eq!(store.get("a", "x").unwrap().unwrap().as_slice(), b"one");
        assert_eq!(store.get("b", "x").unwrap().unwrap().as_slice(), b"two");
        assert!(store.get("a", "y").unwrap().is_none());
    }

    #[test]
    fn store_error_mentions_service_and_account() {
        let err = StoreError::new("sshm", "encryption-key", "backend unavailable");
        let msg = err.to_string();
        assert!(msg.contains("sshm/encryption-key"));
        assert!(msg.contains("backend unavailable"));
    }
}
