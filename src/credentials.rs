// Credential storage for governance secrets: PIN hash, TOTP seed, audit HMAC
// key, session tokens. Backed by the OS keychain when available, with an
// encrypted-at-rest file fallback keyed by a machine-derived secret.
//
// Values pass through a read-through cache that is invalidated on write;
// all writes are serialized by the interior mutex.

use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{AeadCore, Aes256Gcm, Key, Nonce};
use anyhow::{anyhow, bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, warn};
use zeroize::Zeroizing;

/// Keychain / file-store service namespace.
pub const SERVICE: &str = "ara";

/// Well-known credential keys.
pub const KEY_PIN_HASH: &str = "pin_hash";
pub const KEY_TOTP_SEED: &str = "totp_seed";
pub const KEY_TOTP_BACKUP_CODES: &str = "totp_backup_codes";
pub const KEY_AUDIT_HMAC: &str = "audit_hmac_key";
pub const KEY_SESSION_TOKENS: &str = "session_tokens";

// ── Backend trait ──────────────────────────────────────────────────────

pub trait CredentialBackend: Send + Sync {
    fn store(&self, service: &str, key: &str, value: &str) -> Result<()>;
    fn retrieve(&self, service: &str, key: &str) -> Result<Option<String>>;
    fn delete(&self, service: &str, key: &str) -> Result<()>;
    fn name(&self) -> &'static str;
}

// ── OS keychain backend ────────────────────────────────────────────────

pub struct KeychainBackend;

impl CredentialBackend for KeychainBackend {
    fn store(&self, service: &str, key: &str, value: &str) -> Result<()> {
        let entry = keyring::Entry::new(service, key)?;
        entry.set_password(value)?;
        Ok(())
    }

    fn retrieve(&self, service: &str, key: &str) -> Result<Option<String>> {
        let entry = keyring::Entry::new(service, key)?;
        match entry.get_password() {
            Ok(v) => Ok(Some(v)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn delete(&self, service: &str, key: &str) -> Result<()> {
        let entry = keyring::Entry::new(service, key)?;
        match entry.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn name(&self) -> &'static str {
        "keychain"
    }
}

// ── Encrypted file backend ─────────────────────────────────────────────

/// Fallback store: one JSON file per service under `~/.ara/credentials/`,
/// each value AES-256-GCM encrypted under a machine-derived key. Only
/// user-readable (0600 on unix).
pub struct EncryptedFileBackend {
    dir: PathBuf,
    key: Zeroizing<[u8; 32]>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct EncryptedEntries {
    /// key → base64(nonce || ciphertext)
    entries: HashMap<String, String>,
}

impl EncryptedFileBackend {
    pub fn new(dir: PathBuf) -> Self {
        Self {
            key: machine_key(),
            dir,
        }
    }

    /// Construct with an explicit key (tests).
    pub fn with_key(dir: PathBuf, key: [u8; 32]) -> Self {
        Self {
            key: Zeroizing::new(key),
            dir,
        }
    }

    fn file_for(&self, service: &str) -> PathBuf {
        self.dir.join(format!("{}.json", service))
    }

    fn load(&self, service: &str) -> Result<EncryptedEntries> {
        let path = self.file_for(service);
        if !path.exists() {
            return Ok(EncryptedEntries::default());
        }
        let content = std::fs::read_to_string(&path)?;
        Ok(serde_json::from_str(&content).unwrap_or_default())
    }

    fn save(&self, service: &str, entries: &EncryptedEntries) -> Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self.file_for(service);
        let json = serde_json::to_string_pretty(entries)?;
        std::fs::write(&path, json)?;
        restrict_permissions(&path);
        Ok(())
    }

    fn encrypt(&self, plaintext: &str) -> Result<String> {
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(self.key.as_ref()));
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|_| anyhow!("encryption failed"))?;
        let mut blob = nonce.to_vec();
        blob.extend_from_slice(&ciphertext);
        Ok(BASE64.encode(blob))
    }

    fn decrypt(&self, encoded: &str) -> Result<String> {
        let blob = BASE64.decode(encoded).context("corrupt credential blob")?;
        if blob.len() < 12 {
            bail!("corrupt credential blob");
        }
        let (nonce, ciphertext) = blob.split_at(12);
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(self.key.as_ref()));
        let plaintext = cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| anyhow!("decryption failed: wrong machine key or tampered store"))?;
        Ok(String::from_utf8(plaintext)?)
    }
}

impl CredentialBackend for EncryptedFileBackend {
    fn store(&self, service: &str, key: &str, value: &str) -> Result<()> {
        let mut entries = self.load(service)?;
        entries.entries.insert(key.to_string(), self.encrypt(value)?);
        self.save(service, &entries)
    }

    fn retrieve(&self, service: &str, key: &str) -> Result<Option<String>> {
        let entries = self.load(service)?;
        match entries.entries.get(key) {
            Some(blob) => Ok(Some(self.decrypt(blob)?)),
            None => Ok(None),
        }
    }

    fn delete(&self, service: &str, key: &str) -> Result<()> {
        let mut entries = self.load(service)?;
        if entries.entries.remove(key).is_some() {
            self.save(service, &entries)?;
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "encrypted_file"
    }
}

/// Derive the fallback encryption key from stable machine identity. Not a
/// substitute for the keychain; binds the file to this host and user.
fn machine_key() -> Zeroizing<[u8; 32]> {
    let hostname = gethostname::gethostname().to_string_lossy().to_string();
    let user = std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(b"ara-credential-store-v1");
    hasher.update(hostname.as_bytes());
    hasher.update(b"\x00");
    hasher.update(user.as_bytes());
    let digest = hasher.finalize();
    let mut key = [0u8; 32];
    key.copy_from_slice(&digest);
    Zeroizing::new(key)
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    if let Err(e) = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)) {
        warn!("Failed to restrict permissions on {:?}: {}", path, e);
    }
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) {}

// ── Store facade ───────────────────────────────────────────────────────

pub struct CredentialStore {
    backend: Box<dyn CredentialBackend>,
    cache: Mutex<HashMap<String, String>>,
}

impl CredentialStore {
    /// Open the preferred backend: probe the OS keychain with a write/read/
    /// delete roundtrip, fall back to the encrypted file store.
    pub fn open() -> Self {
        let probe_key = "backend_probe";
        let keychain = KeychainBackend;
        let probe = keychain
            .store(SERVICE, probe_key, "ok")
            .and_then(|_| keychain.retrieve(SERVICE, probe_key))
            .map(|v| v.as_deref() == Some("ok"));
        let _ = keychain.delete(SERVICE, probe_key);
        match probe {
            Ok(true) => {
                debug!("Credential store: using OS keychain");
                Self::with_backend(Box::new(keychain))
            }
            _ => {
                debug!("Credential store: keychain unavailable, using encrypted file");
                Self::with_backend(Box::new(EncryptedFileBackend::new(
                    crate::paths::credentials_dir(),
                )))
            }
        }
    }

    pub fn with_backend(backend: Box<dyn CredentialBackend>) -> Self {
        Self {
            backend,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    pub fn store(&self, key: &str, value: &str) -> Result<()> {
        self.backend.store(SERVICE, key, value)?;
        // Write-invalidate: next read goes through to the backend.
        self.cache.lock().expect("cache lock").remove(key);
        Ok(())
    }

    pub fn retrieve(&self, key: &str) -> Result<Option<String>> {
        if let Some(hit) = self.cache.lock().expect("cache lock").get(key) {
            return Ok(Some(hit.clone()));
        }
        let value = self.backend.retrieve(SERVICE, key)?;
        if let Some(v) = &value {
            self.cache
                .lock()
                .expect("cache lock")
                .insert(key.to_string(), v.clone());
        }
        Ok(value)
    }

    pub fn delete(&self, key: &str) -> Result<()> {
        self.backend.delete(SERVICE, key)?;
        self.cache.lock().expect("cache lock").remove(key);
        Ok(())
    }

    /// Fetch the audit HMAC key, generating and persisting a fresh random
    /// 32-byte key on first use.
    pub fn audit_hmac_key(&self) -> Result<Vec<u8>> {
        if let Some(encoded) = self.retrieve(KEY_AUDIT_HMAC)? {
            return BASE64
                .decode(encoded)
                .context("corrupt audit hmac key in credential store");
        }
        let key = random_bytes(32);
        self.store(KEY_AUDIT_HMAC, &BASE64.encode(&key))?;
        Ok(key)
    }

    /// Replace the audit HMAC key (chain rotation).
    pub fn rotate_audit_hmac_key(&self) -> Result<Vec<u8>> {
        let key = random_bytes(32);
        self.store(KEY_AUDIT_HMAC, &BASE64.encode(&key))?;
        Ok(key)
    }
}

pub fn random_bytes(n: usize) -> Vec<u8> {
    use rand::RngCore;
    let mut bytes = vec![0u8; n];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file_store() -> (CredentialStore, tempfile::TempDir) {
        let tmp = tempfile::tempdir().unwrap();
        let backend = EncryptedFileBackend::with_key(tmp.path().join("credentials"), [7u8; 32]);
        (CredentialStore::with_backend(Box::new(backend)), tmp)
    }

    #[test]
    fn roundtrip_store_retrieve_delete() {
        let (store, _tmp) = file_store();
        assert!(store.retrieve(KEY_PIN_HASH).unwrap().is_none());
        store.store(KEY_PIN_HASH, "argon2-hash-here").unwrap();
        assert_eq!(
            store.retrieve(KEY_PIN_HASH).unwrap().as_deref(),
            Some("argon2-hash-here")
        );
        store.delete(KEY_PIN_HASH).unwrap();
        assert!(store.retrieve(KEY_PIN_HASH).unwrap().is_none());
    }

    #[test]
    fn values_are_encrypted_on_disk() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("credentials");
        let backend = EncryptedFileBackend::with_key(dir.clone(), [9u8; 32]);
        backend.store(SERVICE, KEY_TOTP_SEED, "SECRETSEED").unwrap();
        let raw = std::fs::read_to_string(dir.join("ara.json")).unwrap();
        assert!(!raw.contains("SECRETSEED"));
    }

    #[test]
    fn wrong_key_fails_closed() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("credentials");
        let writer = EncryptedFileBackend::with_key(dir.clone(), [1u8; 32]);
        writer.store(SERVICE, KEY_PIN_HASH, "value").unwrap();
        let reader = EncryptedFileBackend::with_key(dir, [2u8; 32]);
        assert!(reader.retrieve(SERVICE, KEY_PIN_HASH).is_err());
    }

    #[test]
    fn cache_invalidated_on_write() {
        let (store, _tmp) = file_store();
        store.store("k", "v1").unwrap();
        assert_eq!(store.retrieve("k").unwrap().as_deref(), Some("v1"));
        store.store("k", "v2").unwrap();
        assert_eq!(store.retrieve("k").unwrap().as_deref(), Some("v2"));
    }

    #[test]
    fn audit_key_generated_once() {
        let (store, _tmp) = file_store();
        let k1 = store.audit_hmac_key().unwrap();
        let k2 = store.audit_hmac_key().unwrap();
        assert_eq!(k1, k2);
        assert_eq!(k1.len(), 32);
        let rotated = store.rotate_audit_hmac_key().unwrap();
        assert_ne!(k1, rotated);
    }

    #[test]
    fn delete_missing_key_is_ok() {
        let (store, _tmp) = file_store();
        store.delete("never_stored").unwrap();
    }
}
