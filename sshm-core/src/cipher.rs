//! At-rest encryption of stored connection passwords.
//!
//! Secrets are sealed with AES-256-GCM under a single 32-byte key that lives
//! in the OS secret store (see [`crate::keystore`]).  The envelope written
//! into the config file is `base64(nonce || ciphertext || tag)` — fully
//! self-contained apart from the key.
//!
//! The key is fetched from the store on **every** call rather than cached,
//! so an externally rotated or re-provisioned store entry takes effect
//! immediately.  When no entry exists yet, a fresh key is generated and
//! persisted before first use.  Two processes racing through that miss path
//! can each persist a different key, leaving one envelope undecryptable;
//! this is an accepted risk of the lazy-creation design and the caller's
//! plaintext-compat fallback keeps it non-fatal.

use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use base64::prelude::{Engine, BASE64_STANDARD};
use rand::RngCore;
use zeroize::Zeroizing;

use crate::keystore::{KeyStore, StoreError, KEY_ACCOUNT, SERVICE};

/// AES-256-GCM standard nonce length.
pub const NONCE_LEN: usize = 12;

/// AES-256 key length.
pub const KEY_LEN: usize = 32;

#[derive(Debug, thiserror::Error)]
pub enum CipherError {
    #[error("cannot obtain encryption key: {0}")]
    KeyRetrieval(#[from] StoreError),
    #[error("secure random source unavailable: {0}")]
    RandomSource(String),
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),
    #[error("authentication tag mismatch (wrong key or tampered envelope)")]
    AuthenticationTag,
}

/// Fetch the encryption key from the store, creating and persisting a fresh
/// one on first use.
fn fetch_key(store: &dyn KeyStore) -> Result<Zeroizing<[u8; KEY_LEN]>, CipherError> {
    if let Some(existing) = store.get(SERVICE, KEY_ACCOUNT)? {
        if existing.len() != KEY_LEN {
            return Err(CipherError::KeyRetrieval(StoreError {
                service: SERVICE.to_string(),
                account: KEY_ACCOUNT.to_string(),
                message: format!("stored key is {} bytes, expected {KEY_LEN}", existing.len()),
            }));
        }
        let mut key = Zeroizing::new([0u8; KEY_LEN]);
        key.copy_from_slice(&existing);
        return Ok(key);
    }

    // No entry yet: generate and persist before first use.
    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    rand::rngs::OsRng
        .try_fill_bytes(&mut *key)
        .map_err(|e| CipherError::RandomSource(e.to_string()))?;
    store.set(SERVICE, KEY_ACCOUNT, &*key)?;
    Ok(key)
}

/// Encrypt `plaintext` and return the base64 envelope for storage.
///
/// A fresh nonce is drawn from the OS CSPRNG on every call — identical
/// plaintexts never produce identical envelopes.
pub fn encrypt(store: &dyn KeyStore, plaintext: &str) -> Result<String, CipherError> {
    let key = fetch_key(store)?;
    let cipher = Aes256Gcm::new_from_slice(&*key)
        .map_err(|e| CipherError::RandomSource(e.to_string()))?;

    let mut nonce_bytes = [0u8; NONCE_LEN];
    rand::rngs::OsRng
        .try_fill_bytes(&mut nonce_bytes)
        .map_err(|e| CipherError::RandomSource(e.to_string()))?;
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext.as_bytes())
        .map_err(|_| CipherError::AuthenticationTag)?;

    // nonce || ciphertext || tag, then base64 for storage as config text.
    let mut envelope = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    envelope.extend_from_slice(&nonce_bytes);
    envelope.extend_from_slice(&ciphertext);
    Ok(BASE64_STANDARD.encode(&envelope))
}

/// Decrypt a base64 envelope produced by [`encrypt`].
///
/// Returns the plaintext wrapped in `Zeroizing` so it is scrubbed when the
/// caller drops it.
pub fn decrypt(store: &dyn KeyStore, envelope: &str) -> Result<Zeroizing<String>, CipherError> {
    let key = fetch_key(store)?;

    let decoded = BASE64_STANDARD
        .decode(envelope.trim())
        .map_err(|e| CipherError::MalformedEnvelope(format!("invalid base64: {e}")))?;
    if decoded.len() < NONCE_LEN {
        return Err(CipherError::MalformedEnvelope(format!(
            "{} bytes is too short to contain a {NONCE_LEN}-byte nonce",
            decoded.len()
        )));
    }
    let (nonce_bytes, ciphertext) = decoded.split_at(NONCE_LEN);

    let cipher = Aes256Gcm::new_from_slice(&*key)
        .map_err(|e| CipherError::RandomSource(e.to_string()))?;
    let plaintext = cipher
        .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
        .map(Zeroizing::new)
        .map_err(|_| CipherError::AuthenticationTag)?;

    let text = std::str::from_utf8(&plaintext)
        .map_err(|_| CipherError::MalformedEnvelope("decrypted secret is not valid UTF-8".into()))?
        .to_string();
    Ok(Zeroizing::new(text))
}
