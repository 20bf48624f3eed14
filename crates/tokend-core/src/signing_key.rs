//! Resolves and rotates the single active HMAC signing key.
//!
//! Invariant: at most one row in `signing_keys` has `active = true`. Rotation
//! and first-use creation both run inside one transaction that also revokes
//! tokens signed by keys other than the new one, so an old key can never be
//! used to mint or verify a token once it's been superseded.

use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::RngCore;
use tokio::sync::Mutex;

use crate::cache::SigningKeyCache;
use crate::db::Database;
use crate::error::SigningKeyError;
use crate::models::SigningKeyRow;
use crate::repositories::signing_keys;

const KEY_MATERIAL_LEN: usize = 32;

/// Owns signing-key resolution and rotation. Cheap to clone; internally
/// `Arc`-shared so every caller sees the same cache.
#[derive(Clone)]
pub struct SigningKeyManager {
    db: Arc<Database>,
    cache: Arc<Mutex<SigningKeyCache>>,
}

impl SigningKeyManager {
    pub fn new(db: Arc<Database>) -> Self {
        Self {
            db,
            cache: Arc::new(Mutex::new(SigningKeyCache::new())),
        }
    }

    /// The currently active key, creating one if this is a fresh database.
    pub async fn active_key(&self) -> Result<SigningKeyRow, SigningKeyError> {
        {
            let cache = self.cache.lock().await;
            if let Some(key) = cache.active() {
                return Ok(key.clone());
            }
        }

        if let Some(key) = signing_keys::get_active(self.db.pool()).await? {
            self.cache.lock().await.set_active(key.clone());
            return Ok(key);
        }

        self.create_first_key().await
    }

    /// A specific key by id, for verifying a token signed before rotation.
    /// Falls back to the database since the cache only warms lazily.
    pub async fn key_by_id(&self, key_id: i64) -> Result<Option<SigningKeyRow>, SigningKeyError> {
        {
            let cache = self.cache.lock().await;
            if let Some(key) = cache.get(key_id) {
                return Ok(Some(key.clone()));
            }
        }

        let row = signing_keys::get_by_id(self.db.pool(), key_id).await?;
        if let Some(ref key) = row {
            self.cache.lock().await.insert(key.clone());
        }
        Ok(row)
    }

    async fn create_first_key(&self) -> Result<SigningKeyRow, SigningKeyError> {
        let mut tx = self.db.pool().begin().await.map_err(|e| SigningKeyError::Database(e.into()))?;
        signing_keys::deactivate_all(&mut *tx).await?;
        let key = signing_keys::insert(&mut *tx, &generate_key_material()).await?;
        tx.commit().await.map_err(|e| SigningKeyError::Database(e.into()))?;

        self.cache.lock().await.set_active(key.clone());
        tracing::info!(component = "signing_key", action = "create_first_key", key_id = key.id, "created initial signing key");
        Ok(key)
    }

    /// Generates a new active key, deactivates the previous one, and revokes
    /// every token not signed by the new key — all atomically. Returns the
    /// new key and the number of tokens revoked.
    pub async fn rotate(&self) -> Result<(SigningKeyRow, u64), SigningKeyError> {
        let mut tx = self.db.pool().begin().await.map_err(|e| SigningKeyError::Database(e.into()))?;

        signing_keys::deactivate_all(&mut *tx).await?;
        let new_key = signing_keys::insert(&mut *tx, &generate_key_material()).await?;
        let revoked = crate::repositories::TokenRepository::revoke_all_except_key(&mut *tx, new_key.id).await?;

        tx.commit().await.map_err(|e| SigningKeyError::Database(e.into()))?;

        let mut cache = self.cache.lock().await;
        cache.set_active(new_key.clone());
        drop(cache);

        tracing::warn!(
            component = "signing_key",
            action = "rotate",
            key_id = new_key.id,
            tokens_revoked = revoked,
            "rotated signing key"
        );
        Ok((new_key, revoked))
    }

    pub async fn all_keys(&self) -> Result<Vec<SigningKeyRow>, SigningKeyError> {
        signing_keys::list_all(self.db.pool()).await.map_err(SigningKeyError::from)
    }
}

fn generate_key_material() -> String {
    let mut bytes = [0u8; KEY_MATERIAL_LEN];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn manager() -> (tempfile::TempDir, SigningKeyManager) {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::connect(dir.path().join("tokens.db"), 10).await.unwrap();
        (dir, SigningKeyManager::new(Arc::new(db)))
    }

    #[tokio::test]
    async fn first_call_creates_a_key() {
        let (_dir, mgr) = manager().await;
        let key = mgr.active_key().await.unwrap();
        assert!(key.active);
    }

    #[tokio::test]
    async fn active_key_is_stable_across_calls() {
        let (_dir, mgr) = manager().await;
        let first = mgr.active_key().await.unwrap();
        let second = mgr.active_key().await.unwrap();
        assert_eq!(first.id, second.id);
    }

    #[tokio::test]
    async fn rotate_replaces_the_active_key() {
        let (_dir, mgr) = manager().await;
        let first = mgr.active_key().await.unwrap();
        let (second, _revoked) = mgr.rotate().await.unwrap();
        assert_ne!(first.id, second.id);

        let current = mgr.active_key().await.unwrap();
        assert_eq!(current.id, second.id);

        let old = mgr.key_by_id(first.id).await.unwrap().unwrap();
        assert!(!old.active);
    }
}
