//! Bootstraps and protects the two long-lived secrets the rest of the
//! system trusts: the HMAC shared secret and the at-rest encryption key.
//!
//! The loopback HMAC path must work before any token exists, so this is the
//! trust root for on-device bootstrap — nothing here depends on the
//! database.

use std::path::{Path, PathBuf};

use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::RngCore;
use zeroize::Zeroizing;

use crate::error::SecretsInitError;

const SHARED_SECRET_FILE: &str = "shared_secret.bin";
const ENCRYPTION_KEY_FILE: &str = "fernet_key.b64";
const SHARED_SECRET_LEN: usize = 32;
const ENCRYPTION_KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;

/// Owns the HMAC shared secret and the symmetric encryption key, loaded
/// from (or generated into) a restricted directory on disk.
pub struct SecretsStore {
    secrets_dir: PathBuf,
    shared_secret: Zeroizing<Vec<u8>>,
    encryption_key: Zeroizing<[u8; ENCRYPTION_KEY_LEN]>,
}

impl std::fmt::Debug for SecretsStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretsStore")
            .field("secrets_dir", &self.secrets_dir)
            .finish_non_exhaustive()
    }
}

impl SecretsStore {
    /// Idempotently ensures the secrets directory and both secret files
    /// exist with restrictive permissions, generating whichever are
    /// missing with a cryptographic RNG.
    pub fn load_or_create(secrets_dir: impl Into<PathBuf>) -> Result<Self, SecretsInitError> {
        let secrets_dir = secrets_dir.into();
        ensure_secrets_directory(&secrets_dir)?;

        let shared_secret = load_or_create_file(&secrets_dir, SHARED_SECRET_FILE, || {
            let mut bytes = vec![0u8; SHARED_SECRET_LEN];
            rand::thread_rng().fill_bytes(&mut bytes);
            bytes
        })?;

        let encryption_key_bytes = load_or_create_file(&secrets_dir, ENCRYPTION_KEY_FILE, || {
            let mut raw = [0u8; ENCRYPTION_KEY_LEN];
            rand::thread_rng().fill_bytes(&mut raw);
            URL_SAFE_NO_PAD.encode(raw).into_bytes()
        })?;

        let encryption_key = decode_encryption_key(&encryption_key_bytes)?;

        Ok(Self {
            secrets_dir,
            shared_secret: Zeroizing::new(shared_secret),
            encryption_key: Zeroizing::new(encryption_key),
        })
    }

    pub fn secrets_dir(&self) -> &Path {
        &self.secrets_dir
    }

    /// The raw HMAC shared secret. Never leaves the process in a response.
    pub fn shared_secret(&self) -> &[u8] {
        &self.shared_secret
    }

    /// Encrypts `data` with AES-256-GCM, prefixing the ciphertext with its
    /// randomly-generated nonce.
    pub fn encrypt(&self, data: &[u8]) -> Result<Vec<u8>, SecretsInitError> {
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&*self.encryption_key));
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(nonce, data)
            .map_err(|_| SecretsInitError::EncryptionFailed)?;

        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    /// Decrypts data produced by [`Self::encrypt`].
    pub fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>, SecretsInitError> {
        if data.len() < NONCE_LEN {
            return Err(SecretsInitError::DecryptionFailed);
        }
        let (nonce_bytes, ciphertext) = data.split_at(NONCE_LEN);
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&*self.encryption_key));
        cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|_| SecretsInitError::DecryptionFailed)
    }
}

fn ensure_secrets_directory(dir: &Path) -> Result<(), SecretsInitError> {
    std::fs::create_dir_all(dir).map_err(SecretsInitError::DirectoryCreate)?;
    set_permissions(dir, 0o700).map_err(SecretsInitError::DirectoryCreate)?;
    Ok(())
}

fn load_or_create_file(
    dir: &Path,
    name: &str,
    generate: impl FnOnce() -> Vec<u8>,
) -> Result<Vec<u8>, SecretsInitError> {
    let path = dir.join(name);

    if !path.exists() {
        let bytes = generate();
        std::fs::write(&path, &bytes).map_err(|source| SecretsInitError::Write {
            path: path.display().to_string(),
            source,
        })?;
        set_permissions(&path, 0o600).map_err(|source| SecretsInitError::Write {
            path: path.display().to_string(),
            source,
        })?;
        return Ok(bytes);
    }

    let bytes = std::fs::read(&path).map_err(|source| SecretsInitError::Read {
        path: path.display().to_string(),
        source,
    })?;
    if bytes.is_empty() {
        return Err(SecretsInitError::Empty(path.display().to_string()));
    }
    Ok(bytes)
}

fn decode_encryption_key(b64: &[u8]) -> Result<[u8; ENCRYPTION_KEY_LEN], SecretsInitError> {
    let text = std::str::from_utf8(b64).map_err(|_| SecretsInitError::InvalidKeyLength)?;
    let raw = URL_SAFE_NO_PAD
        .decode(text.trim())
        .map_err(|_| SecretsInitError::InvalidKeyLength)?;
    raw.try_into()
        .map_err(|_| SecretsInitError::InvalidKeyLength)
}

#[cfg(unix)]
fn set_permissions(path: &Path, mode: u32) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn set_permissions(_path: &Path, _mode: u32) -> std::io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_or_create_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = SecretsStore::load_or_create(dir.path()).unwrap();
        let secret_first = store.shared_secret().to_vec();

        let store_again = SecretsStore::load_or_create(dir.path()).unwrap();
        assert_eq!(secret_first, store_again.shared_secret());
    }

    #[test]
    fn shared_secret_is_32_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let store = SecretsStore::load_or_create(dir.path()).unwrap();
        assert_eq!(store.shared_secret().len(), SHARED_SECRET_LEN);
    }

    #[test]
    fn encrypt_decrypt_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = SecretsStore::load_or_create(dir.path()).unwrap();
        let plaintext = b"super secret key material";
        let ciphertext = store.encrypt(plaintext).unwrap();
        assert_ne!(ciphertext, plaintext);
        assert_eq!(store.decrypt(&ciphertext).unwrap(), plaintext);
    }

    #[test]
    fn rejects_empty_secret_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path()).unwrap();
        std::fs::write(dir.path().join(SHARED_SECRET_FILE), b"").unwrap();
        let err = SecretsStore::load_or_create(dir.path()).unwrap_err();
        assert!(matches!(err, SecretsInitError::Empty(_)));
    }

    #[cfg(unix)]
    #[test]
    fn directory_and_files_are_restricted() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let store = SecretsStore::load_or_create(dir.path()).unwrap();
        let dir_mode = std::fs::metadata(store.secrets_dir()).unwrap().permissions().mode() & 0o777;
        assert_eq!(dir_mode, 0o700);

        let file_mode = std::fs::metadata(store.secrets_dir().join(SHARED_SECRET_FILE))
            .unwrap()
            .permissions()
            .mode()
            & 0o777;
        assert_eq!(file_mode, 0o600);
    }
}
