//! Encrypted credential store.
//!
//! Secrets are sealed with AES-256-GCM and only opened when a caller asks
//! for a specific entry, right before it is handed to a driver, a dump tool
//! or an uploader.

mod cipher;

pub use cipher::{load_or_create_master_key, MasterKey, MASTER_KEY_ENV};

use crate::error::{BackupError, Result};
use base64::{engine::general_purpose::STANDARD, Engine};
use cipher::Sealer;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use zeroize::Zeroizing;

/// Decrypted secret material. The secret is wiped from memory on drop and
/// never printed by `Debug`.
#[derive(Clone)]
pub struct Credential {
    username: Option<String>,
    secret: Zeroizing<String>,
}

impl Credential {
    pub fn new(username: Option<String>, secret: impl Into<String>) -> Self {
        Self {
            username,
            secret: Zeroizing::new(secret.into()),
        }
    }

    pub fn username(&self) -> &str {
        self.username.as_deref().unwrap_or("")
    }

    pub fn secret(&self) -> &str {
        &self.secret
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("username", &self.username)
            .field("secret", &"<redacted>")
            .finish()
    }
}

#[derive(Serialize, Deserialize)]
struct Plaintext {
    username: Option<String>,
    secret: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SealedEntry {
    nonce: String,
    ciphertext: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreFile {
    version: u32,
    entries: BTreeMap<String, SealedEntry>,
}

pub struct CredentialStore {
    path: Option<PathBuf>,
    sealer: Sealer,
    entries: BTreeMap<String, SealedEntry>,
}

impl CredentialStore {
    pub fn open(path: &Path, key: &MasterKey) -> Result<Self> {
        let entries = if path.exists() {
            let contents = fs::read_to_string(path)?;
            let file: StoreFile = serde_json::from_str(&contents)?;
            debug!("Loaded {} sealed credential(s) from {:?}", file.entries.len(), path);
            file.entries
        } else {
            BTreeMap::new()
        };

        Ok(Self {
            path: Some(path.to_path_buf()),
            sealer: Sealer::new(key),
            entries,
        })
    }

    /// Store that is never written to disk.
    pub fn in_memory(key: &MasterKey) -> Self {
        Self {
            path: None,
            sealer: Sealer::new(key),
            entries: BTreeMap::new(),
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    pub fn ids(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    pub fn get(&self, id: &str) -> Result<Credential> {
        let entry = self
            .entries
            .get(id)
            .ok_or_else(|| BackupError::Credential(format!("no credential stored for '{}'", id)))?;

        let nonce = STANDARD
            .decode(&entry.nonce)
            .map_err(|e| BackupError::Credential(format!("corrupt nonce for '{}': {}", id, e)))?;
        let ciphertext = STANDARD
            .decode(&entry.ciphertext)
            .map_err(|e| BackupError::Credential(format!("corrupt ciphertext for '{}': {}", id, e)))?;

        let plaintext = Zeroizing::new(self.sealer.open(id, &nonce, &ciphertext)?);
        let decoded: Plaintext = serde_json::from_slice(&plaintext)
            .map_err(|e| BackupError::Credential(format!("corrupt payload for '{}': {}", id, e)))?;

        Ok(Credential::new(decoded.username, decoded.secret))
    }

    pub fn put(&mut self, id: &str, credential: &Credential) -> Result<()> {
        if id.trim().is_empty() {
            return Err(BackupError::Credential("credential id must not be empty".into()));
        }
        let payload = Plaintext {
            username: credential.username.clone(),
            secret: credential.secret().to_string(),
        };
        let plaintext = Zeroizing::new(serde_json::to_vec(&payload)?);
        drop(Zeroizing::new(payload.secret));

        let (nonce, ciphertext) = self.sealer.seal(id, &plaintext)?;
        self.entries.insert(
            id.to_string(),
            SealedEntry {
                nonce: STANDARD.encode(nonce),
                ciphertext: STANDARD.encode(ciphertext),
            },
        );
        self.persist()?;
        info!("Stored credential '{}'", id);
        Ok(())
    }

    pub fn remove(&mut self, id: &str) -> Result<bool> {
        let removed = self.entries.remove(id).is_some();
        if removed {
            self.persist()?;
            info!("Removed credential '{}'", id);
        }
        Ok(removed)
    }

    fn persist(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let file = StoreFile {
            version: 1,
            entries: self.entries.clone(),
        };
        let tmp = path.with_extension("json.tmp");
        cipher::write_private(&tmp, serde_json::to_string_pretty(&file)?.as_bytes())?;
        fs::rename(&tmp, path)?;
        Ok(())
    }
}
