use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use keyring::Entry;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::{Config, CredentialBackendKind, APP_NAME};

/// The single key the session token lives under.
pub const TOKEN_KEY: &str = "auth_token";

/// File name used by `FileBackend` inside its directory
const CREDENTIALS_FILE: &str = "credentials.json";

/// Durable key-value storage for credentials.
pub trait CredentialBackend: Send + Sync {
    fn read(&self, key: &str) -> Result<Option<String>>;
    fn write(&self, key: &str, value: &str) -> Result<()>;
    fn delete(&self, key: &str) -> Result<()>;
}

// ============================================================================
// Backends
// ============================================================================

/// OS keychain storage.
pub struct KeyringBackend {
    service: String,
}

impl KeyringBackend {
    pub fn new(service: &str) -> Self {
        Self {
            service: service.to_string(),
        }
    }

    /// Why this build's keyring may lose tokens across restarts, if it may.
    pub fn persistence_caveat() -> Option<&'static str> {
        if cfg!(any(
            target_os = "macos",
            target_os = "windows",
            feature = "secret-service"
        )) {
            None
        } else if cfg!(target_os = "linux") {
            Some("kernel keyring only, tokens are lost on reboot; build with the secret-service feature")
        } else {
            Some("no native keychain on this platform, tokens are kept in memory only")
        }
    }

    fn entry(&self, key: &str) -> Result<Entry> {
        Entry::new(&self.service, key).context("Failed to create keyring entry")
    }
}

impl CredentialBackend for KeyringBackend {
    fn read(&self, key: &str) -> Result<Option<String>> {
        match self.entry(key)?.get_password() {
            Ok(value) => Ok(Some(value)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(e).context("Failed to retrieve token from keychain"),
        }
    }

    fn write(&self, key: &str, value: &str) -> Result<()> {
        self.entry(key)?
            .set_password(value)
            .context("Failed to store token in keychain")
    }

    fn delete(&self, key: &str) -> Result<()> {
        match self.entry(key)?.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(e).context("Failed to delete token from keychain"),
        }
    }
}

/// JSON file storage, one map of key to value per directory.
pub struct FileBackend {
    dir: PathBuf,
}

impl FileBackend {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    fn path(&self) -> PathBuf {
        self.dir.join(CREDENTIALS_FILE)
    }

    fn read_all(&self) -> Result<BTreeMap<String, String>> {
        let path = self.path();
        if !path.exists() {
            return Ok(BTreeMap::new());
        }
        let contents = std::fs::read_to_string(&path).context("Failed to read credentials file")?;
        serde_json::from_str(&contents).context("Failed to parse credentials file")
    }

    fn write_all(&self, values: &BTreeMap<String, String>) -> Result<()> {
        let path = self.path();
        if values.is_empty() {
            if path.exists() {
                std::fs::remove_file(&path).context("Failed to remove credentials file")?;
            }
            return Ok(());
        }
        std::fs::create_dir_all(&self.dir)?;
        let contents = serde_json::to_string_pretty(values)?;
        std::fs::write(path, contents).context("Failed to write credentials file")
    }
}

impl CredentialBackend for FileBackend {
    fn read(&self, key: &str) -> Result<Option<String>> {
        Ok(self.read_all()?.remove(key))
    }

    fn write(&self, key: &str, value: &str) -> Result<()> {
        let mut values = self.read_all().unwrap_or_default();
        values.insert(key.to_string(), value.to_string());
        self.write_all(&values)
    }

    fn delete(&self, key: &str) -> Result<()> {
        let mut values = self.read_all().unwrap_or_default();
        values.remove(key);
        self.write_all(&values)
    }
}

/// Process-local storage. Nothing survives a restart.
#[derive(Default)]
pub struct MemoryBackend {
    values: Mutex<HashMap<String, String>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CredentialBackend for MemoryBackend {
    fn read(&self, key: &str) -> Result<Option<String>> {
        let values = self
            .values
            .lock()
            .map_err(|_| anyhow::anyhow!("Credential memory lock poisoned"))?;
        Ok(values.get(key).cloned())
    }

    fn write(&self, key: &str, value: &str) -> Result<()> {
        let mut values = self
            .values
            .lock()
            .map_err(|_| anyhow::anyhow!("Credential memory lock poisoned"))?;
        values.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        let mut values = self
            .values
            .lock()
            .map_err(|_| anyhow::anyhow!("Credential memory lock poisoned"))?;
        values.remove(key);
        Ok(())
    }
}

// ============================================================================
// CredentialStore
// ============================================================================

/// What is actually written under `TOKEN_KEY`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialRecord {
    pub token: String,
    pub saved_at: DateTime<Utc>,
}

impl CredentialRecord {
    /// Minutes since the token was saved (0 on clock skew)
    pub fn age_minutes(&self) -> i64 {
        (Utc::now() - self.saved_at).num_minutes().max(0)
    }
}

/// Sole owner of the persisted session token.
///
/// The token is opaque: no shape validation happens here. Clones share the
/// same backend.
#[derive(Clone)]
pub struct CredentialStore {
    backend: Arc<dyn CredentialBackend>,
}

impl CredentialStore {
    pub fn new(backend: impl CredentialBackend + 'static) -> Self {
        Self {
            backend: Arc::new(backend),
        }
    }

    /// Store backed by process memory
    pub fn memory() -> Self {
        Self::new(MemoryBackend::new())
    }

    /// Build the store selected by `config.credential_backend`
    pub fn from_config(config: &Config) -> Result<Self> {
        let store = match config.credential_backend {
            CredentialBackendKind::Keyring => {
                if let Some(caveat) = KeyringBackend::persistence_caveat() {
                    warn!(caveat, "Keyring backend may not persist the session token; consider the file backend");
                }
                Self::new(KeyringBackend::new(APP_NAME))
            }
            CredentialBackendKind::File => Self::new(FileBackend::new(config.cache_dir()?)),
            CredentialBackendKind::Memory => Self::memory(),
        };
        debug!(backend = ?config.credential_backend, "Credential store configured");
        Ok(store)
    }

    /// Persist the token, replacing any previous one
    pub fn save(&self, token: &str) -> Result<()> {
        let record = CredentialRecord {
            token: token.to_string(),
            saved_at: Utc::now(),
        };
        let contents = serde_json::to_string(&record)?;
        self.backend.write(TOKEN_KEY, &contents)
    }

    /// Load the persisted token, if any
    pub fn load(&self) -> Result<Option<String>> {
        Ok(self.load_record()?.map(|r| r.token))
    }

    /// Load the token together with when it was saved.
    /// A record that cannot be parsed is cleared and reported as absent.
    pub fn load_record(&self) -> Result<Option<CredentialRecord>> {
        let Some(raw) = self.backend.read(TOKEN_KEY)? else {
            return Ok(None);
        };
        match serde_json::from_str(&raw) {
            Ok(record) => Ok(Some(record)),
            Err(e) => {
                warn!(error = %e, "Discarding unreadable credential record");
                self.clear()?;
                Ok(None)
            }
        }
    }

    /// Remove the persisted token. Succeeds when nothing is stored.
    pub fn clear(&self) -> Result<()> {
        self.backend.delete(TOKEN_KEY)
    }

    /// Check if a token is currently persisted
    pub fn has_token(&self) -> bool {
        matches!(self.load(), Ok(Some(_)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_save_then_load_round_trip() {
        let store = CredentialStore::memory();
        store.save("tok123").expect("save");
        assert_eq!(store.load().expect("load").as_deref(), Some("tok123"));
        assert!(store.has_token());
    }

    #[test]
    fn test_clear_then_load_is_absent() {
        let store = CredentialStore::memory();
        store.save("tok123").expect("save");
        store.clear().expect("clear");
        assert_eq!(store.load().expect("load"), None);

        // Clearing an empty store is fine
        store.clear().expect("clear again");
        assert!(!store.has_token());
    }

    #[test]
    fn test_token_is_opaque() {
        let store = CredentialStore::memory();
        let odd = "  not.a.jwt {\"quoted\"} \n";
        store.save(odd).expect("save");
        assert_eq!(store.load().expect("load").as_deref(), Some(odd));
    }

    #[test]
    fn test_clones_share_backend() {
        let store = CredentialStore::memory();
        let other = store.clone();
        store.save("shared").expect("save");
        assert_eq!(other.load().expect("load").as_deref(), Some("shared"));
    }

    #[test]
    fn test_corrupt_record_is_discarded() {
        let backend = MemoryBackend::new();
        backend.write(TOKEN_KEY, "raw-token-without-record").expect("write");
        let store = CredentialStore::new(backend);

        assert_eq!(store.load_record().expect("load"), None);
        assert!(!store.has_token());
    }

    #[test]
    #[cfg(all(target_os = "linux", not(feature = "secret-service")))]
    fn test_kernel_keyring_reports_caveat() {
        let caveat = KeyringBackend::persistence_caveat().expect("caveat");
        assert!(caveat.contains("reboot"));
    }

    #[test]
    #[cfg(any(target_os = "macos", target_os = "windows"))]
    fn test_native_keychain_has_no_caveat() {
        assert!(KeyringBackend::persistence_caveat().is_none());
    }

    #[test]
    fn test_record_age() {
        let record = CredentialRecord {
            token: "t".to_string(),
            saved_at: Utc::now() - Duration::minutes(45),
        };
        assert!(record.age_minutes() >= 44);

        let future = CredentialRecord {
            token: "t".to_string(),
            saved_at: Utc::now() + Duration::minutes(10),
        };
        assert_eq!(future.age_minutes(), 0);
    }

    #[test]
    fn test_file_backend_survives_new_instance() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = CredentialStore::new(FileBackend::new(dir.path().to_path_buf()));
        store.save("persisted").expect("save");

        // A fresh store over the same directory simulates a reload
        let reloaded = CredentialStore::new(FileBackend::new(dir.path().to_path_buf()));
        assert_eq!(reloaded.load().expect("load").as_deref(), Some("persisted"));

        reloaded.clear().expect("clear");
        assert!(!dir.path().join(CREDENTIALS_FILE).exists());
        assert_eq!(store.load().expect("load"), None);
    }
}
