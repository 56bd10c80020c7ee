//! Encrypted per-service secret storage.
//!
//! Secrets live as individual files named `<service_id>.<name>.secret` under
//! the secrets directory. Each file is the base64 of `nonce || AES-256-GCM
//! ciphertext` over the JSON-serialized secret record. The key is derived as
//! `SHA-256(agent_id || "-buildvigil-secret-key")`, binding every ciphertext
//! to the agent that wrote it; there is no re-encryption path for a rotated
//! agent id.

use crate::error::{Error, Result};
use aes_gcm::aead::{Aead, OsRng};
use aes_gcm::{AeadCore, Aes256Gcm, Key, KeyInit, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::PathBuf;

const KEY_SUFFIX: &str = "-buildvigil-secret-key";
const SECRET_EXT: &str = "secret";

#[derive(Debug, Serialize, Deserialize)]
struct SecretRecord {
    name: String,
    service_id: String,
    value: String,
}

/// File-backed secret store with authenticated encryption.
pub struct SecretStore {
    secrets_dir: PathBuf,
    key: Key<Aes256Gcm>,
}

impl SecretStore {
    pub fn new(secrets_dir: impl Into<PathBuf>, agent_id: &str) -> Result<Self> {
        let secrets_dir = secrets_dir.into();
        std::fs::create_dir_all(&secrets_dir)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&secrets_dir, std::fs::Permissions::from_mode(0o700))?;
        }

        let digest = Sha256::digest(format!("{}{}", agent_id, KEY_SUFFIX).as_bytes());
        let key = Key::<Aes256Gcm>::from_slice(&digest).to_owned();

        Ok(Self { secrets_dir, key })
    }

    fn secret_path(&self, service_id: &str, name: &str) -> PathBuf {
        self.secrets_dir
            .join(format!("{}.{}.{}", service_id, name, SECRET_EXT))
    }

    /// Store a secret, overwriting any previous value for the same name.
    pub fn set(&self, name: &str, service_id: &str, value: &str) -> Result<()> {
        let record = SecretRecord {
            name: name.to_string(),
            service_id: service_id.to_string(),
            value: value.to_string(),
        };
        let plaintext = serde_json::to_vec(&record)?;
        let encoded = self.encrypt(&plaintext)?;

        // Write to a sibling temp file and rename so a crash never leaves a
        // truncated secret behind.
        let path = self.secret_path(service_id, name);
        let tmp = path.with_extension("secret.tmp");
        std::fs::write(&tmp, encoded.as_bytes())?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600))?;
        }
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    /// Retrieve and decrypt a secret value.
    ///
    /// Fails with [`Error::SecretNotFound`] when the file is missing and
    /// [`Error::SecretDecrypt`] when the ciphertext cannot be opened.
    pub fn get(&self, name: &str, service_id: &str) -> Result<String> {
        let path = self.secret_path(service_id, name);
        let data = match std::fs::read_to_string(&path) {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::SecretNotFound(name.to_string()))
            }
            Err(e) => return Err(e.into()),
        };

        let plaintext = self
            .decrypt(data.trim())
            .map_err(|e| Error::SecretDecrypt(name.to_string(), e))?;
        let record: SecretRecord = serde_json::from_slice(&plaintext)
            .map_err(|e| Error::SecretDecrypt(name.to_string(), e.to_string()))?;
        Ok(record.value)
    }

    pub fn delete(&self, name: &str, service_id: &str) -> Result<()> {
        let path = self.secret_path(service_id, name);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::SecretNotFound(name.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Names of all secrets stored for a service.
    pub fn list(&self, service_id: &str) -> Result<Vec<String>> {
        let prefix = format!("{}.", service_id);
        let suffix = format!(".{}", SECRET_EXT);
        let mut names = Vec::new();

        for entry in std::fs::read_dir(&self.secrets_dir)? {
            let entry = entry?;
            let file_name = entry.file_name();
            let Some(file_name) = file_name.to_str() else {
                continue;
            };
            if let Some(middle) = file_name
                .strip_prefix(&prefix)
                .and_then(|rest| rest.strip_suffix(&suffix))
            {
                if !middle.is_empty() {
                    names.push(middle.to_string());
                }
            }
        }

        names.sort();
        Ok(names)
    }

    /// All decryptable secrets for a service as a name→value map.
    ///
    /// Files that fail to decrypt are skipped so one corrupt secret cannot
    /// block a deployment.
    pub fn all_for_service(&self, service_id: &str) -> Result<HashMap<String, String>> {
        let mut out = HashMap::new();
        for name in self.list(service_id)? {
            match self.get(&name, service_id) {
                Ok(value) => {
                    out.insert(name, value);
                }
                Err(e) => {
                    tracing::warn!(
                        "Skipping unreadable secret '{}' for service '{}': {}",
                        name,
                        service_id,
                        e
                    );
                }
            }
        }
        Ok(out)
    }

    fn encrypt(&self, plaintext: &[u8]) -> Result<String> {
        let cipher = Aes256Gcm::new(&self.key);
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = cipher
            .encrypt(&nonce, plaintext)
            .map_err(|e| Error::Config(format!("encryption failed: {}", e)))?;

        let mut blob = Vec::with_capacity(nonce.len() + ciphertext.len());
        blob.extend_from_slice(&nonce);
        blob.extend_from_slice(&ciphertext);
        Ok(BASE64.encode(blob))
    }

    fn decrypt(&self, encoded: &str) -> std::result::Result<Vec<u8>, String> {
        let blob = BASE64.decode(encoded).map_err(|e| e.to_string())?;
        let nonce_len = 12;
        if blob.len() < nonce_len {
            return Err("ciphertext too short".to_string());
        }
        let (nonce, ciphertext) = blob.split_at(nonce_len);
        let cipher = Aes256Gcm::new(&self.key);
        cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|e| e.to_string())
    }
}
