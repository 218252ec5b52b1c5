//! The on-disk configuration store: named connections and managed keys.
//!
//! Stored as TOML at `<config-dir>/sshm/config.toml` (overridable through
//! `SSHM_CONFIG`, which the tests use).  Saves go through a
//! write-then-rename with mode 0600 so the file is never partially written
//! and never world-readable; the parent directory is created with mode 0700.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot determine a config directory (HOME not set)")]
    NoConfigDir,
    #[error("cannot read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("cannot parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("cannot serialise config: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("cannot write config file {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// One saved connection.  The `password` field, when set, holds a cipher
/// envelope (see [`crate::cipher`]), never plaintext — except for entries
/// imported from installations that predate encryption, which the
/// authenticator handles with an explicit compat fallback.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Connection {
    #[serde(default)]
    pub id: u64,
    #[serde(default)]
    pub name: String,
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub user: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_used: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

fn default_port() -> u16 {
    22
}

/// A key pair managed by `sshm keys`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshKeyEntry {
    pub name: String,
    pub path: PathBuf,
    /// `"rsa"`, `"ed25519"`, or `"unknown"` for externally added keys.
    pub kind: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_key_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub next_id: u64,
    #[serde(default)]
    pub settings: Settings,
    #[serde(default)]
    pub connections: BTreeMap<String, Connection>,
    #[serde(default)]
    pub ssh_keys: BTreeMap<String, SshKeyEntry>,
}

/// Counts reported after [`AppConfig::merge`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MergeOutcome {
    pub added: usize,
    pub skipped: usize,
}

impl AppConfig {
    /// Default config file location, honouring the `SSHM_CONFIG` override.
    pub fn default_path() -> Result<PathBuf, ConfigError> {
        if let Ok(path) = std::env::var("SSHM_CONFIG") {
            return Ok(PathBuf::from(path));
        }
        dirs::config_dir()
            .map(|dir| dir.join("sshm").join("config.toml"))
            .ok_or(ConfigError::NoConfigDir)
    }

    /// Load the config from `path`.  A missing file is an empty config, not
    /// an error.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(source) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Persist the config to `path` (0600, write-then-rename).
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let text = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            create_private_dir(parent).map_err(|source| ConfigError::Write {
                path: path.to_path_buf(),
                source,
            })?;
        }
        write_private_file(path, text.as_bytes()).map_err(|source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Look up a connection by name, falling back to numeric id.
    pub fn find(&self, ident: &str) -> Option<(&str, &Connection)> {
        if let Some((name, conn)) = self.connections.get_key_value(ident) {
            return Some((name.as_str(), conn));
        }
        let id: u64 = ident.parse().ok()?;
        self.connections
            .iter()
            .find(|(_, c)| c.id == id)
            .map(|(name, conn)| (name.as_str(), conn))
    }

    /// Insert a new connection under `name`, assigning it the next id.
    ///
    /// Returns `false` without modifying anything when the name is taken.
    pub fn add_connection(&mut self, name: &str, mut conn: Connection) -> bool {
        if self.connections.contains_key(name) {
            return false;
        }
        self.next_id += 1;
        conn.id = self.next_id;
        conn.name = name.to_string();
        self.connections.insert(name.to_string(), conn);
        true
    }

    /// Merge connections from another config, skipping names that already
    /// exist locally.  Imported entries are re-numbered into this config's
    /// id space.
    pub fn merge(&mut self, other: AppConfig) -> MergeOutcome {
        let mut outcome = MergeOutcome {
            added: 0,
            skipped: 0,
        };
        for (name, conn) in other.connections {
            if self.add_connection(&name, conn) {
                outcome.added += 1;
            } else {
                outcome.skipped += 1;
            }
        }
        outcome
    }
}

// ---------------------------------------------------------------------------
// Private file helpers
// ---------------------------------------------------------------------------

fn create_private_dir(dir: &Path) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        std::fs::DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(dir)
    }
    #[cfg(not(unix))]
    std::fs::create_dir_all(dir)
}

/// Write `data` to `path` with mode 0600, replacing any existing file.
///
/// Writes to a sibling temp file first so the config is never partially
/// written, then renames into place.
fn write_private_file(path: &Path, data: &[u8]) -> std::io::Result<()> {
    use std::io::Write;

    let tmp_path = path.with_extension("toml.tmp");
    {
        // Mode is set at creation time so there is no window where the file
        // is readable by other users.
        #[cfg(unix)]
        let mut file = {
            use std::os::unix::fs::OpenOptionsExt;
            std::fs::OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .mode(0o600)
                .open(&tmp_path)?
        };
        #[cfg(not(unix))]
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path)?;

        file.write_all(data)?;
        file.flush()?;
    }
    std::fs::rename(&tmp_path, path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample_connection(host: &str) -> Connection {
        Connection {
            host: host.to_string(),
            port: 22,
            user: "alice".to_string(),
            created_at: Some(Utc::now()),
            ..Connection::default()
        }
    }

    #[test]
    fn load_missing_file_gives_empty_config() {
        let dir = TempDir::new().unwrap();
        let cfg = AppConfig::load(&dir.path().join("nope.toml")).unwrap();
        assert!(cfg.connections.is_empty());
        assert_eq!(cfg.next_id, 0);
    }

    #[test]
    fn save_load_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sub").join("config.toml");

        let mut cfg = AppConfig::default();
        let mut conn = sample_connection("example.test");
        conn.key_path = Some(PathBuf::from("/home/alice/.ssh/id_ed25519"));
        conn.tags = vec!["prod".to_string()];
        assert!(cfg.add_connection("web", conn));
        cfg.ssh_keys.insert(
            "deploy".to_string(),
            SshKeyEntry {
                name: "deploy".to_string(),
                path: PathBuf::from("/home/alice/.ssh/deploy"),
                kind: "ed25519".to_string(),
            },
        );

        cfg.save(&path).unwrap();
        let loaded = AppConfig::load(&path).unwrap();
        assert_eq!(loaded.next_id, 1);
        let conn = &loaded.connections["web"];
        assert_eq!(conn.id, 1);
        assert_eq!(conn.host, "example.test");
        assert_eq!(
            conn.key_path.as_deref(),
            Some(Path::new("/home/alice/.ssh/id_ed25519"))
        );
        assert_eq!(loaded.ssh_keys["deploy"].kind, "ed25519");
    }

    #[cfg(unix)]
    #[test]
    fn saved_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        AppConfig::default().save(&path).unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn duplicate_name_is_rejected() {
        let mut cfg = AppConfig::default();
        assert!(cfg.add_connection("web", sample_connection("a")));
        assert!(!cfg.add_connection("web", sample_connection("b")));
        assert_eq!(cfg.connections["web"].host, "a");
        assert_eq!(cfg.next_id, 1);
    }

    #[test]
    fn find_by_name_and_by_id() {
        let mut cfg = AppConfig::default();
        cfg.add_connection("web", sample_connection("a"));
        cfg.add_connection("db", sample_connection("b"));

        assert_eq!(cfg.find("db").unwrap().1.host, "b");
        // "1" is not a name, so it resolves as an id.
        assert_eq!(cfg.find("1").unwrap().0, "web");
        assert!(cfg.find("missing").is_none());
        assert!(cfg.find("99").is_none());
    }

    #[test]
    fn merge_skips_existing_names() {
        let mut cfg = AppConfig::default();
        cfg.add_connection("web", sample_connection("local"));

        let mut incoming = AppConfig::default();
        incoming.add_connection("web", sample_connection("remote"));
        incoming.add_connection("cache", sample_connection("cache.test"));

        let outcome = cfg.merge(incoming);
        assert_eq!(
            outcome,
            MergeOutcome {
                added: 1,
                skipped: 1
            }
        );
        assert_eq!(cfg.connections["web"].host, "local");
        assert_eq!(cfg.connections["cache"].host, "cache.test");
        // Imported entry got a fresh id in this config's sequence.
        assert_eq!(cfg.connections["cache"].id, 2);
    }

    #[test]
    fn empty_toml_parses_to_defaults() {
        let cfg: AppConfig = toml::from_str("").unwrap();
        assert!(cfg.connections.is_empty());
        assert!(cfg.settings.default_user.is_none());
    }

    #[test]
    fn port_defaults_to_22() {
        let cfg: AppConfig = toml::from_str(
            r#"
            [connections.web]
            host = "example.test"
            user = "alice"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.connections["web"].port, 22);
    }
}
