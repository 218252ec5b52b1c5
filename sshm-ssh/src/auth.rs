//! Authentication-method resolution.
//!
//! Turns one saved [`Connection`] into the ordered set of methods for a
//! single connect attempt.  A key file takes exclusive priority: when one
//! is configured, the stored password is never offered alongside it.
//! Passphrase protection is detected structurally (the parsed key reports
//! it), not by matching error-message text, and triggers exactly one hidden
//! prompt followed by one retry.

use std::io;
use std::path::{Path, PathBuf};

use ssh_key::{LineEnding, PrivateKey};
use zeroize::Zeroizing;

use sshm_core::cipher;
use sshm_core::config::Connection;
use sshm_core::keystore::KeyStore;

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("cannot read private key {path}: {source}")]
    KeyRead { path: PathBuf, source: io::Error },
    #[error("cannot parse private key {path}: {reason}")]
    KeyParse { path: PathBuf, reason: String },
    #[error("failed to read passphrase: {0}")]
    PassphraseRead(#[source] io::Error),
}

/// One authentication method, in the order the handshake should offer them.
pub enum AuthMethod {
    /// Private key, held as PEM text ready for the transport.  Already
    /// decrypted — any passphrase handling happened during resolution.
    PublicKey { pem: Zeroizing<String> },
    Password(Zeroizing<String>),
}

impl std::fmt::Debug for AuthMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PublicKey { .. } => f.debug_struct("PublicKey").field("pem", &"[redacted]").finish(),
            Self::Password(_) => f.debug_tuple("Password").field(&"[redacted]").finish(),
        }
    }
}

/// Outcome of a first, passphrase-less parse of a key file.
enum ParsedKey {
    /// Usable as-is.
    Ready(Zeroizing<String>),
    /// Structurally recognised as passphrase-protected.
    NeedsPassphrase,
}

/// Resolve the methods for one connection attempt.
///
/// `prompt` is invoked at most once, only when the key file is passphrase
/// protected; injecting it keeps resolution testable without a terminal.
pub fn resolve(
    conn: &Connection,
    store: &dyn KeyStore,
    prompt: &mut dyn FnMut() -> io::Result<Zeroizing<String>>,
) -> Result<Vec<AuthMethod>, AuthError> {
    if let Some(path) = conn.key_path.as_deref() {
        let pem = load_key_pem(path, prompt)?;
        return Ok(vec![AuthMethod::PublicKey { pem }]);
    }

    if let Some(secret) = conn.password.as_deref().filter(|s| !s.is_empty()) {
        let password = match cipher::decrypt(store, secret) {
            Ok(plaintext) => plaintext,
            Err(err) => {
                // Entries written before encryption was introduced hold the
                // password verbatim; keep accepting them.
                tracing::warn!(
                    connection = %conn.name,
                    error = %err,
                    "stored password did not decrypt; treating it as legacy plaintext"
                );
                Zeroizing::new(secret.to_string())
            }
        };
        return Ok(vec![AuthMethod::Password(password)]);
    }

    Ok(Vec::new())
}

/// Read and validate the key file at `path`, prompting for a passphrase
/// when the key requires one.
fn load_key_pem(
    path: &Path,
    prompt: &mut dyn FnMut() -> io::Result<Zeroizing<String>>,
) -> Result<Zeroizing<String>, AuthError> {
    let pem = std::fs::read_to_string(path).map_err(|source| AuthError::KeyRead {
        path: path.to_path_buf(),
        source,
    })?;

    match classify(&pem) {
        Ok(ParsedKey::Ready(pem)) => Ok(pem),
        Ok(ParsedKey::NeedsPassphrase) => {
            let passphrase = prompt().map_err(AuthError::PassphraseRead)?;
            unlock(&pem, &passphrase).map_err(|reason| AuthError::KeyParse {
                path: path.to_path_buf(),
                reason,
            })
        }
        Err(reason) => Err(AuthError::KeyParse {
            path: path.to_path_buf(),
            reason,
        }),
    }
}

/// First parse attempt, without a passphrase.
///
/// Recognises the OpenSSH container (including its encrypted form) plus the
/// two PEM forms `sshm keys generate` writes: PKCS#1 RSA and PKCS#8
/// Ed25519.
fn classify(pem: &str) -> Result<ParsedKey, String> {
    match PrivateKey::from_openssh(pem) {
        Ok(key) if key.is_encrypted() => Ok(ParsedKey::NeedsPassphrase),
        Ok(_) => Ok(ParsedKey::Ready(Zeroizing::new(pem.to_string()))),
        Err(openssh_err) => {
            use ed25519_dalek::pkcs8::DecodePrivateKey;
            use rsa::pkcs1::DecodeRsaPrivateKey;

            if rsa::RsaPrivateKey::from_pkcs1_pem(pem).is_ok()
                || ed25519_dalek::SigningKey::from_pkcs8_pem(pem).is_ok()
            {
                Ok(ParsedKey::Ready(Zeroizing::new(pem.to_string())))
            } else if pem.contains("ENCRYPTED") {
                // Encrypted PKCS#8 or a legacy openssl PEM; either way the
                // caller prompts and unlock() sorts out which it was.
                Ok(ParsedKey::NeedsPassphrase)
            } else {
                Err(openssh_err.to_string())
            }
        }
    }
}

/// Second and final parse attempt, with the passphrase.  Any failure here
/// is fatal — there is no further fallback.
///
/// Handles the OpenSSH container (what ssh-keygen produces) and encrypted
/// PKCS#8.  The decrypted key is re-encoded in plaintext PEM for the
/// transport.
fn unlock(pem: &str, passphrase: &str) -> Result<Zeroizing<String>, String> {
    if let Ok(key) = PrivateKey::from_openssh(pem) {
        let key = key
            .decrypt(passphrase)
            .map_err(|_| "wrong passphrase or corrupt key".to_string())?;
        return key
            .to_openssh(LineEnding::LF)
            .map_err(|e| format!("cannot re-encode decrypted key: {e}"));
    }

    // Encrypted PKCS#8 ("BEGIN ENCRYPTED PRIVATE KEY").
    {
        use ed25519_dalek::pkcs8::{DecodePrivateKey, EncodePrivateKey};
        if let Ok(key) = ed25519_dalek::SigningKey::from_pkcs8_encrypted_pem(pem, passphrase) {
            return key
                .to_pkcs8_pem(pkcs8::LineEnding::LF)
                .map_err(|e| format!("cannot re-encode decrypted key: {e}"));
        }
    }
    {
        use rsa::pkcs1::EncodeRsaPrivateKey;
        use rsa::pkcs8::DecodePrivateKey;
        if let Ok(key) = rsa::RsaPrivateKey::from_pkcs8_encrypted_pem(pem, passphrase) {
            return key
                .to_pkcs1_pem(pkcs8::LineEnding::LF)
                .map_err(|e| format!("cannot re-encode decrypted key: {e}"));
        }
    }

    if pem.contains("DEK-Info") {
        // Pre-PKCS#8 openssl PEM encryption; its key derivation is not
        // supported.
        Err("legacy encrypted PEM keys are not supported \
             (convert with `ssh-keygen -p -o`)"
            .to_string())
    } else {
        Err("wrong passphrase or corrupt key".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;
    use ssh_key::Algorithm;
    use sshm_core::keystore::MemoryKeyStore;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn no_prompt() -> impl FnMut() -> io::Result<Zeroizing<String>> {
        || panic!("prompt must not be invoked")
    }

    fn write_key_file(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file.flush().unwrap();
        file
    }

    fn plain_ed25519_pem() -> String {
        let key = PrivateKey::random(&mut OsRng, Algorithm::Ed25519).unwrap();
        key.to_openssh(LineEnding::LF).unwrap().to_string()
    }

    fn encrypted_ed25519_pem(passphrase: &str) -> String {
        let key = PrivateKey::random(&mut OsRng, Algorithm::Ed25519).unwrap();
        let locked = key.encrypt(&mut OsRng, passphrase).unwrap();
        locked.to_openssh(LineEnding::LF).unwrap().to_string()
    }

    fn conn(key_path: Option<&Path>, password: Option<&str>) -> Connection {
        Connection {
            name: "test".to_string(),
            host: "example.test".to_string(),
            port: 22,
            user: "alice".to_string(),
            key_path: key_path.map(Path::to_path_buf),
            password: password.map(str::to_string),
            ..Connection::default()
        }
    }

    #[test]
    fn key_path_takes_exclusive_priority_over_secret() {
        let store = MemoryKeyStore::default();
        let file = write_key_file(&plain_ed25519_pem());
        let envelope = cipher::encrypt(&store, "hunter2").unwrap();

        let methods = resolve(
            &conn(Some(file.path()), Some(&envelope)),
            &store,
            &mut no_prompt(),
        )
        .unwrap();
        assert_eq!(methods.len(), 1);
        assert!(matches!(methods[0], AuthMethod::PublicKey { .. }));
    }

    #[test]
    fn secret_alone_resolves_to_one_password_method() {
        let store = MemoryKeyStore::default();
        let envelope = cipher::encrypt(&store, "hunter2").unwrap();
        let methods = resolve(&conn(None, Some(&envelope)), &store, &mut no_prompt()).unwrap();
        assert_eq!(methods.len(), 1);
        match &methods[0] {
            AuthMethod::Password(pw) => assert_eq!(pw.as_str(), "hunter2"),
            other => panic!("expected password method, got {other:?}"),
        }
    }

    #[test]
    fn undecryptable_secret_falls_back_to_plaintext() {
        let store = MemoryKeyStore::default();
        let methods = resolve(
            &conn(None, Some("plain-old-password")),
            &store,
            &mut no_prompt(),
        )
        .unwrap();
        match &methods[0] {
            AuthMethod::Password(pw) => assert_eq!(pw.as_str(), "plain-old-password"),
            other => panic!("expected password method, got {other:?}"),
        }
    }

    #[test]
    fn neither_key_nor_secret_resolves_to_empty_set() {
        let store = MemoryKeyStore::default();
        let methods = resolve(&conn(None, None), &store, &mut no_prompt()).unwrap();
        assert!(methods.is_empty());
        // An empty stored password counts as absent too.
        let methods = resolve(&conn(None, Some("")), &store, &mut no_prompt()).unwrap();
        assert!(methods.is_empty());
    }

    #[test]
    fn missing_key_file_is_a_read_error_with_the_path() {
        let store = MemoryKeyStore::default();
        let err = resolve(
            &conn(Some(Path::new("/nonexistent/id_ed25519")), None),
            &store,
            &mut no_prompt(),
        )
        .unwrap_err();
        match err {
            AuthError::KeyRead { path, .. } => {
                assert_eq!(path, Path::new("/nonexistent/id_ed25519"))
            }
            other => panic!("expected KeyRead, got {other:?}"),
        }
    }

    #[test]
    fn garbage_key_file_is_a_parse_error() {
        let store = MemoryKeyStore::default();
        let file = write_key_file("this is not a key");
        let err = resolve(&conn(Some(file.path()), None), &store, &mut no_prompt()).unwrap_err();
        assert!(matches!(err, AuthError::KeyParse { .. }));
    }

    #[test]
    fn encrypted_key_is_classified_without_string_matching() {
        let pem = encrypted_ed25519_pem("correct-horse");
        assert!(matches!(classify(&pem), Ok(ParsedKey::NeedsPassphrase)));
    }

    #[test]
    fn passphrase_prompted_exactly_once_and_correct_one_succeeds() {
        let store = MemoryKeyStore::default();
        let file = write_key_file(&encrypted_ed25519_pem("correct-horse"));

        let mut prompts = 0;
        let mut prompt = || {
            prompts += 1;
            Ok(Zeroizing::new("correct-horse".to_string()))
        };
        let methods = resolve(&conn(Some(file.path()), None), &store, &mut prompt).unwrap();
        assert_eq!(prompts, 1);
        assert_eq!(methods.len(), 1);
        match &methods[0] {
            AuthMethod::PublicKey { pem } => {
                // The resolved key is the decrypted one.
                let key = PrivateKey::from_openssh(pem.as_bytes()).unwrap();
                assert!(!key.is_encrypted());
            }
            other => panic!("expected public-key method, got {other:?}"),
        }
    }

    #[test]
    fn wrong_passphrase_fails_hard_with_no_fallback() {
        let store = MemoryKeyStore::default();
        let file = write_key_file(&encrypted_ed25519_pem("correct-horse"));
        let envelope = cipher::encrypt(&store, "hunter2").unwrap();

        let mut prompt = || Ok(Zeroizing::new("wrong-horse".to_string()));
        // Even with a stored secret available, a bad passphrase is fatal.
        let err = resolve(
            &conn(Some(file.path()), Some(&envelope)),
            &store,
            &mut prompt,
        )
        .unwrap_err();
        assert!(matches!(err, AuthError::KeyParse { .. }));
    }

    #[test]
    fn passphrase_read_failure_is_fatal() {
        let store = MemoryKeyStore::default();
        let file = write_key_file(&encrypted_ed25519_pem("correct-horse"));
        let mut prompt = || {
            Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "end of input",
            ))
        };
        let err = resolve(&conn(Some(file.path()), None), &store, &mut prompt).unwrap_err();
        assert!(matches!(err, AuthError::PassphraseRead(_)));
    }

    #[test]
    fn pkcs8_ed25519_from_keygen_is_accepted() {
        use crate::keygen::{KeyKind, KeyPair};
        let store = MemoryKeyStore::default();
        let pair = KeyPair::generate(KeyKind::Ed25519, 0).unwrap();
        let file = write_key_file(&pair.private_pem().unwrap());
        let methods = resolve(&conn(Some(file.path()), None), &store, &mut no_prompt()).unwrap();
        assert_eq!(methods.len(), 1);
        assert!(matches!(methods[0], AuthMethod::PublicKey { .. }));
    }

    #[test]
    fn pkcs1_rsa_from_keygen_is_accepted() {
        use crate::keygen::{KeyKind, KeyPair};
        let store = MemoryKeyStore::default();
        let pair = KeyPair::generate(KeyKind::Rsa, 0).unwrap();
        let file = write_key_file(&pair.private_pem().unwrap());
        let methods = resolve(&conn(Some(file.path()), None), &store, &mut no_prompt()).unwrap();
        assert_eq!(methods.len(), 1);
        assert!(matches!(methods[0], AuthMethod::PublicKey { .. }));
    }

    fn encrypted_pkcs8_ed25519_pem(passphrase: &str) -> String {
        use ed25519_dalek::pkcs8::EncodePrivateKey;
        let key = ed25519_dalek::SigningKey::generate(&mut OsRng);
        key.to_pkcs8_encrypted_pem(&mut OsRng, passphrase, pkcs8::LineEnding::LF)
            .unwrap()
            .to_string()
    }

    #[test]
    fn encrypted_pkcs8_key_unlocks_with_the_passphrase() {
        use ed25519_dalek::pkcs8::DecodePrivateKey;
        let store = MemoryKeyStore::default();
        let file = write_key_file(&encrypted_pkcs8_ed25519_pem("correct-horse"));

        let mut prompts = 0;
        let mut prompt = || {
            prompts += 1;
            Ok(Zeroizing::new("correct-horse".to_string()))
        };
        let methods = resolve(&conn(Some(file.path()), None), &store, &mut prompt).unwrap();
        assert_eq!(prompts, 1);
        match &methods[0] {
            AuthMethod::PublicKey { pem } => {
                // Re-encoded as plaintext PKCS#8.
                ed25519_dalek::SigningKey::from_pkcs8_pem(pem).unwrap();
            }
            other => panic!("expected public-key method, got {other:?}"),
        }
    }

    #[test]
    fn encrypted_pkcs8_wrong_passphrase_is_a_parse_error() {
        let store = MemoryKeyStore::default();
        let file = write_key_file(&encrypted_pkcs8_ed25519_pem("correct-horse"));
        let mut prompt = || Ok(Zeroizing::new("wrong-horse".to_string()));
        let err = resolve(&conn(Some(file.path()), None), &store, &mut prompt).unwrap_err();
        assert!(matches!(err, AuthError::KeyParse { .. }));
    }
}
