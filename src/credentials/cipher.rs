use crate::error::{BackupError, Result};
use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng, Payload};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::{engine::general_purpose::STANDARD, Engine};
use std::fs;
use std::io::Write;
use std::path::Path;
use tracing::{info, warn};
use zeroize::Zeroizing;

pub const MASTER_KEY_ENV: &str = "DB_BACKUP_MASTER_KEY";
const NONCE_LEN: usize = 12;

pub struct MasterKey(Zeroizing<[u8; 32]>);

impl MasterKey {
    pub fn generate() -> Self {
        let key = Aes256Gcm::generate_key(&mut OsRng);
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(key.as_slice());
        Self(Zeroizing::new(bytes))
    }

    pub fn from_base64(encoded: &str) -> Result<Self> {
        let decoded = Zeroizing::new(
            STANDARD
                .decode(encoded.trim())
                .map_err(|e| BackupError::Credential(format!("master key is not valid base64: {}", e)))?,
        );
        if decoded.len() != 32 {
            return Err(BackupError::Credential(format!(
                "master key must be 32 bytes, got {}",
                decoded.len()
            )));
        }
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&decoded);
        Ok(Self(Zeroizing::new(bytes)))
    }

    pub fn to_base64(&self) -> Zeroizing<String> {
        Zeroizing::new(STANDARD.encode(self.0.as_slice()))
    }
}

/// Master key from `DB_BACKUP_MASTER_KEY`, else from `key_file`, generating
/// and saving a fresh key there on first use.
pub fn load_or_create_master_key(key_file: &Path) -> Result<MasterKey> {
    if let Ok(encoded) = std::env::var(MASTER_KEY_ENV) {
        return MasterKey::from_base64(&encoded);
    }

    if key_file.exists() {
        let encoded = Zeroizing::new(fs::read_to_string(key_file)?);
        return MasterKey::from_base64(&encoded);
    }

    warn!(
        "No master key found, generating a new one at {:?}. Back this file up: credentials cannot be recovered without it.",
        key_file
    );
    if let Some(parent) = key_file.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let key = MasterKey::generate();
    write_private(key_file, key.to_base64().as_bytes())?;
    info!("Master key written to {:?}", key_file);
    Ok(key)
}

/// Writes `contents` to a file readable only by the owner.
pub(crate) fn write_private(path: &Path, contents: &[u8]) -> Result<()> {
    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path)?;
    file.write_all(contents)?;
    file.sync_all()?;
    Ok(())
}

pub(crate) struct Sealer {
    cipher: Aes256Gcm,
}

impl Sealer {
    pub fn new(key: &MasterKey) -> Self {
        Self {
            cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.0.as_slice())),
        }
    }

    /// Encrypts `plaintext`, binding it to `id` so sealed entries cannot be
    /// swapped between ids.
    pub fn seal(&self, id: &str, plaintext: &[u8]) -> Result<(Vec<u8>, Vec<u8>)> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(
                &nonce,
                Payload {
                    msg: plaintext,
                    aad: id.as_bytes(),
                },
            )
            .map_err(|_| BackupError::Credential(format!("failed to encrypt credential '{}'", id)))?;
        Ok((nonce.to_vec(), ciphertext))
    }

    pub fn open(&self, id: &str, nonce: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>> {
        if nonce.len() != NONCE_LEN {
            return Err(BackupError::Credential(format!("corrupt nonce for '{}'", id)));
        }
        self.cipher
            .decrypt(
                Nonce::from_slice(nonce),
                Payload {
                    msg: ciphertext,
                    aad: id.as_bytes(),
                },
            )
            .map_err(|_| {
                BackupError::Credential(format!(
                    "cannot decrypt credential '{}' (wrong master key or tampered entry)",
                    id
                ))
            })
    }
}
