use keyring::Entry;
use serde::{Deserialize, Serialize};

use crate::error::{Result, SyncError};

const SERVICE_NAME: &str = "anemone-sync";

/// Credential bundle for one remote host, as returned by
/// [`CredentialStore::load`] (spec.md §6).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Credentials {
    pub user: String,
    pub password: String,
    pub domain: Option<String>,
    pub port: Option<u16>,
}

/// The core never persists passwords itself — it calls out to a
/// `CredentialStore` implementation, generalized from the teacher's
/// `secrets.rs` free functions into the trait-shaped external
/// collaborator spec.md §6 describes.
pub trait CredentialStore: Send + Sync {
    fn load(&self, host: &str) -> Result<Option<Credentials>>;
    fn save(&self, host: &str, credentials: &Credentials) -> Result<()>;
    fn delete(&self, host: &str) -> Result<()>;
}

/// Default implementation, backed by the platform keyring — the same
/// `keyring` crate and `Entry` API the teacher's `secrets.rs` already
/// uses, re-keyed by host instead of by `TargetId`.
pub struct KeyringCredentialStore;

impl KeyringCredentialStore {
    fn entry(host: &str) -> Result<Entry> {
        Entry::new(SERVICE_NAME, host)
            .map_err(|err| SyncError::config(format!("failed to open keyring entry: {err}")))
    }
}

impl CredentialStore for KeyringCredentialStore {
    fn load(&self, host: &str) -> Result<Option<Credentials>> {
        let entry = Self::entry(host)?;
        match entry.get_password() {
            Ok(serialized) => {
                let credentials: Credentials = serde_json::from_str(&serialized)
                    .map_err(|err| SyncError::config(format!("corrupt credential entry: {err}")))?;
                Ok(Some(credentials))
            }
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(err) => Err(SyncError::config(format!(
                "failed to load keyring secret: {err}"
            ))),
        }
    }

    fn save(&self, host: &str, credentials: &Credentials) -> Result<()> {
        let entry = Self::entry(host)?;
        let serialized = serde_json::to_string(credentials)
            .map_err(|err| SyncError::config(format!("failed to serialize credentials: {err}")))?;
        entry
            .set_password(&serialized)
            .map_err(|err| SyncError::config(format!("failed to set keyring secret: {err}")))
    }

    fn delete(&self, host: &str) -> Result<()> {
        let entry = Self::entry(host)?;
        match entry.delete_password() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(err) => Err(SyncError::config(format!(
                "failed to delete keyring secret: {err}"
            ))),
        }
    }
}
