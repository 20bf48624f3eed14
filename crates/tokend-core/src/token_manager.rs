//! Issues, verifies, and revokes device bearer tokens.
//!
//! Tokens are three base64url segments — `header.payload.signature` — signed
//! with HMAC-SHA256 under the currently active [`SigningKeyManager`] key.
//! Verification is cache-first: a token seen recently short-circuits through
//! [`TokenCache`] without touching the database or recomputing the HMAC.

use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{Duration as ChronoDuration, Utc};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use tokio::sync::Mutex;

use serde::{Deserialize, Serialize};

use sqlx::error::DatabaseError as _;

use crate::cache::{CacheDebugEntry, CacheStats, TokenCache};
use crate::db::Database;
use crate::error::{DatabaseError, TokenError};
use crate::models::{Claims, SigningKeyRow};
use crate::repositories::{DeviceRepository, TokenRepository};
use crate::signing_key::SigningKeyManager;

type HmacSha256 = Hmac<Sha256>;

/// Retries after a `jti`/`token` unique-constraint collision before giving up.
const MAX_COLLISION_RETRIES: u32 = 3;

#[derive(Serialize, Deserialize)]
struct Header {
    alg: String,
    typ: String,
    kid: String,
}

/// Result of [`TokenManager::verify_cache_state`]: either a single token's
/// cached state, or entry counts across the whole cache when no token is
/// given.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum CacheInspection {
    Entry(CacheDebugEntry),
    Stats(CacheStats),
}

/// Row counts from the `tokens` table, for comparing cache and database
/// state in operational tooling.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct DbStateSnapshot {
    pub total_tokens: i64,
    pub revoked_tokens: i64,
}

/// Composes the signing-key manager, token cache, and database into the
/// token lifecycle: create, verify, revoke, rotate, and purge.
#[derive(Clone)]
pub struct TokenManager {
    db: Arc<Database>,
    signing_keys: SigningKeyManager,
    cache: Arc<Mutex<TokenCache>>,
    issuer: String,
    ttl: ChronoDuration,
    time_validation_enabled: bool,
}

impl TokenManager {
    pub fn new(
        db: Arc<Database>,
        signing_keys: SigningKeyManager,
        issuer: impl Into<String>,
        ttl: ChronoDuration,
        time_validation_enabled: bool,
    ) -> Self {
        Self {
            db,
            signing_keys,
            cache: Arc::new(Mutex::new(TokenCache::new())),
            issuer: issuer.into(),
            ttl,
            time_validation_enabled,
        }
    }

    /// Creates and persists a new token for `device_id`, registering the
    /// device on first use. Retries on a `jti`/`token` unique-constraint
    /// collision, regenerating `jti` each attempt.
    pub async fn create_token(&self, device_id: &str) -> Result<(String, Claims), TokenError> {
        DeviceRepository::get_or_create(self.db.pool(), device_id).await?;

        let key = self.signing_keys.active_key().await?;
        let key_bytes = URL_SAFE_NO_PAD
            .decode(&key.key)
            .map_err(|_| TokenError::InvalidSigningKey)?;

        let now = Utc::now();
        let exp = now + self.ttl;

        for attempt in 0..=MAX_COLLISION_RETRIES {
            let claims = Claims {
                sub: device_id.to_owned(),
                iss: self.issuer.clone(),
                did: device_id.to_owned(),
                exp: exp.timestamp(),
                iat: now.timestamp(),
                kid: key.id.to_string(),
                jti: generate_jti(),
            };

            let token_value = encode_token(&claims, &key_bytes)?;

            match TokenRepository::insert(self.db.pool(), &token_value, device_id, key.id, exp).await {
                Ok(_) => {
                    let mut cache = self.cache.lock().await;
                    cache.put_claims(token_value.clone(), claims.clone());
                    cache.put_validation(token_value.clone(), true);

                    tracing::info!(
                        component = "token_manager",
                        action = "create_token",
                        device_id,
                        key_id = key.id,
                        attempt,
                        "issued token"
                    );
                    return Ok((token_value, claims));
                }
                Err(err) if is_unique_violation(&err) && attempt < MAX_COLLISION_RETRIES => {
                    tracing::warn!(
                        component = "token_manager",
                        action = "create_token",
                        device_id,
                        attempt,
                        "jti collision, retrying"
                    );
                }
                Err(err) if is_unique_violation(&err) => return Err(TokenError::Collision),
                Err(err) => return Err(err.into()),
            }
        }

        unreachable!("loop always returns on its final iteration")
    }

    /// Verifies signature, expiry, and revocation status, consulting the
    /// cache before the database or the HMAC computation.
    pub async fn verify_token(&self, token: &str) -> Result<Claims, TokenError> {
        {
            let mut cache = self.cache.lock().await;
            if let Some(is_valid) = cache.get_validation(token) {
                if !is_valid {
                    return Err(TokenError::InvalidSignature);
                }
                if let Some(claims) = cache.get_claims(token) {
                    if !cache.is_expired(claims.exp, Utc::now()) {
                        return Ok(claims.clone());
                    }
                }
            }
        }

        match self.verify_token_uncached(token).await {
            Ok(claims) => {
                let mut cache = self.cache.lock().await;
                cache.put_claims(token.to_owned(), claims.clone());
                cache.put_validation(token.to_owned(), true);
                Ok(claims)
            }
            Err(err) => {
                let mut cache = self.cache.lock().await;
                cache.put_validation(token.to_owned(), false);
                Err(err)
            }
        }
    }

    async fn verify_token_uncached(&self, token: &str) -> Result<Claims, TokenError> {
        let header = decode_header(token)?;
        if header.alg != "HS256" {
            return Err(TokenError::Malformed("unsupported alg".into()));
        }
        let claims = decode_claims(token)?;
        if header.kid != claims.kid {
            return Err(TokenError::ClaimMismatch("kid"));
        }

        let key_id: i64 = claims
            .kid
            .parse()
            .map_err(|_| TokenError::MissingClaim("kid"))?;
        let key = self
            .signing_keys
            .key_by_id(key_id)
            .await?
            .ok_or(TokenError::InvalidSigningKey)?;
        let key_bytes = URL_SAFE_NO_PAD
            .decode(&key.key)
            .map_err(|_| TokenError::InvalidSigningKey)?;

        verify_signature(token, &key_bytes)?;

        if claims.iss != self.issuer {
            return Err(TokenError::ClaimMismatch("iss"));
        }
        if claims.sub != claims.did {
            return Err(TokenError::ClaimMismatch("sub"));
        }

        if self.time_validation_enabled && Utc::now().timestamp() >= claims.exp {
            return Err(TokenError::Expired);
        }

        let row = TokenRepository::get_by_value(self.db.pool(), token)
            .await?
            .ok_or(TokenError::NotFound)?;
        if row.revoked {
            return Err(TokenError::Revoked);
        }

        Ok(claims)
    }

    /// Revokes a single token, invalidating both cache tables so a future
    /// verification attempt falls through to the database.
    pub async fn revoke_token(&self, token: &str) -> Result<bool, TokenError> {
        let revoked = TokenRepository::revoke(self.db.pool(), token).await?;
        let mut cache = self.cache.lock().await;
        cache.invalidate_claims(token);
        cache.invalidate_validation(token);
        Ok(revoked)
    }

    /// Rotates the active signing key and clears the whole token cache,
    /// since every token not signed by the new key has just been revoked.
    pub async fn rotate_key(&self) -> Result<u64, TokenError> {
        let (_new_key, revoked) = self.signing_keys.rotate().await?;
        self.cache.lock().await.clear();
        Ok(revoked)
    }

    pub async fn purge_expired_tokens(&self) -> Result<u64, TokenError> {
        TokenRepository::purge_expired(self.db.pool()).await.map_err(TokenError::from)
    }

    pub async fn active_tokens_for_device(&self, device_id: &str) -> Result<usize, TokenError> {
        let rows = TokenRepository::get_active_for_device(self.db.pool(), device_id, false).await?;
        Ok(rows.len())
    }

    pub async fn count_tokens_for_key(&self, key_id: i64) -> Result<i64, TokenError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM tokens WHERE key_id = ?")
            .bind(key_id)
            .fetch_one(self.db.pool())
            .await
            .map_err(|e| TokenError::Database(e.into()))?;
        Ok(count)
    }

    pub fn signing_keys(&self) -> &SigningKeyManager {
        &self.signing_keys
    }

    /// All signing keys, active and retired, for operational tooling.
    pub async fn get_keys(&self) -> Result<Vec<SigningKeyRow>, TokenError> {
        self.signing_keys.all_keys().await.map_err(TokenError::from)
    }

    /// Whether the signing-key store has been initialized, i.e. an active
    /// key already exists. Used by the health probe.
    pub async fn signing_key_store_initialized(&self) -> bool {
        self.signing_keys.active_key().await.is_ok()
    }

    /// Inspects cached state for `token`, or overall cache table sizes when
    /// `token` is `None`.
    pub async fn verify_cache_state(&self, token: Option<&str>) -> CacheInspection {
        let cache = self.cache.lock().await;
        match token {
            Some(token) => CacheInspection::Entry(cache.debug(token)),
            None => CacheInspection::Stats(cache.stats()),
        }
    }

    /// Row counts from the `tokens` table, for comparing against cached and
    /// expected state.
    pub async fn verify_db_state(&self) -> Result<DbStateSnapshot, TokenError> {
        let total_tokens: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM tokens")
            .fetch_one(self.db.pool())
            .await
            .map_err(|e| TokenError::Database(e.into()))?;
        let revoked_tokens: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM tokens WHERE revoked = 1")
            .fetch_one(self.db.pool())
            .await
            .map_err(|e| TokenError::Database(e.into()))?;
        Ok(DbStateSnapshot { total_tokens, revoked_tokens })
    }
}

fn generate_jti() -> String {
    let mut bytes = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Whether `err` is a unique-constraint violation (a `jti`/`token` collision)
/// rather than some other database fault.
fn is_unique_violation(err: &DatabaseError) -> bool {
    match err {
        DatabaseError::Sqlx(sqlx::Error::Database(db_err)) => db_err.kind() == sqlx::error::ErrorKind::UniqueViolation,
        _ => false,
    }
}

fn encode_token(claims: &Claims, key_bytes: &[u8]) -> Result<String, TokenError> {
    let header = Header {
        alg: "HS256".to_owned(),
        typ: "JWT".to_owned(),
        kid: claims.kid.clone(),
    };
    let header_json = serde_json::to_vec(&header).map_err(|e| TokenError::Malformed(e.to_string()))?;
    let header_b64 = URL_SAFE_NO_PAD.encode(header_json);
    let payload_json = serde_json::to_vec(claims).map_err(|e| TokenError::Malformed(e.to_string()))?;
    let payload_b64 = URL_SAFE_NO_PAD.encode(payload_json);
    let signing_input = format!("{header_b64}.{payload_b64}");

    let mut mac = HmacSha256::new_from_slice(key_bytes).map_err(|_| TokenError::InvalidSigningKey)?;
    mac.update(signing_input.as_bytes());
    let signature_b64 = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());

    Ok(format!("{signing_input}.{signature_b64}"))
}

fn decode_header(token: &str) -> Result<Header, TokenError> {
    let header_b64 = token
        .split('.')
        .next()
        .ok_or_else(|| TokenError::Malformed("missing header".into()))?;
    let header_bytes = URL_SAFE_NO_PAD
        .decode(header_b64)
        .map_err(|e| TokenError::Malformed(e.to_string()))?;
    serde_json::from_slice(&header_bytes).map_err(|e| TokenError::Malformed(e.to_string()))
}

fn decode_claims(token: &str) -> Result<Claims, TokenError> {
    let mut parts = token.split('.');
    let _header = parts.next().ok_or_else(|| TokenError::Malformed("missing header".into()))?;
    let payload = parts.next().ok_or_else(|| TokenError::Malformed("missing payload".into()))?;
    let _signature = parts.next().ok_or_else(|| TokenError::Malformed("missing signature".into()))?;
    if parts.next().is_some() {
        return Err(TokenError::Malformed("too many segments".into()));
    }

    let payload_bytes = URL_SAFE_NO_PAD
        .decode(payload)
        .map_err(|e| TokenError::Malformed(e.to_string()))?;
    serde_json::from_slice(&payload_bytes).map_err(|e| TokenError::Malformed(e.to_string()))
}

fn verify_signature(token: &str, key_bytes: &[u8]) -> Result<(), TokenError> {
    let (signing_input, signature_b64) = token
        .rsplit_once('.')
        .ok_or_else(|| TokenError::Malformed("missing signature".into()))?;
    let signature = URL_SAFE_NO_PAD
        .decode(signature_b64)
        .map_err(|_| TokenError::InvalidSignature)?;

    let mut mac = HmacSha256::new_from_slice(key_bytes).map_err(|_| TokenError::InvalidSigningKey)?;
    mac.update(signing_input.as_bytes());
    let expected = mac.finalize().into_bytes();

    if expected.as_slice().ct_eq(&signature).into() {
        Ok(())
    } else {
        Err(TokenError::InvalidSignature)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn manager() -> (tempfile::TempDir, TokenManager) {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(Database::connect(dir.path().join("tokens.db"), 10).await.unwrap());
        let keys = SigningKeyManager::new(db.clone());
        let tm = TokenManager::new(db, keys, "tokend", ChronoDuration::minutes(30), true);
        (dir, tm)
    }

    #[tokio::test]
    async fn create_then_verify_round_trips() {
        let (_dir, tm) = manager().await;
        let (token, claims) = tm.create_token("device-1").await.unwrap();
        let verified = tm.verify_token(&token).await.unwrap();
        assert_eq!(verified.sub, claims.sub);
        assert_eq!(verified.jti, claims.jti);
    }

    #[tokio::test]
    async fn tampered_signature_is_rejected() {
        let (_dir, tm) = manager().await;
        let (token, _) = tm.create_token("device-1").await.unwrap();
        let mut tampered = token.clone();
        tampered.push('x');
        let err = tm.verify_token(&tampered).await.unwrap_err();
        assert!(matches!(err, TokenError::InvalidSignature));
    }

    #[tokio::test]
    async fn revoked_token_fails_verification() {
        let (_dir, tm) = manager().await;
        let (token, _) = tm.create_token("device-1").await.unwrap();
        assert!(tm.revoke_token(&token).await.unwrap());
        let err = tm.verify_token(&token).await.unwrap_err();
        assert!(matches!(err, TokenError::Revoked));
    }

    #[tokio::test]
    async fn rotation_revokes_tokens_signed_with_old_key() {
        let (_dir, tm) = manager().await;
        let (token, _) = tm.create_token("device-1").await.unwrap();
        let revoked = tm.rotate_key().await.unwrap();
        assert_eq!(revoked, 1);
        let err = tm.verify_token(&token).await.unwrap_err();
        assert!(matches!(err, TokenError::Revoked));
    }

    #[tokio::test]
    async fn expired_token_is_rejected() {
        let (_dir, tm) = manager().await;
        let tm = TokenManager::new(tm.db.clone(), tm.signing_keys.clone(), "tokend", ChronoDuration::seconds(-1), true);
        let (token, _) = tm.create_token("device-1").await.unwrap();
        let err = tm.verify_token(&token).await.unwrap_err();
        assert!(matches!(err, TokenError::Expired));
    }

    #[tokio::test]
    async fn expiry_is_not_enforced_when_time_validation_is_disabled() {
        let (_dir, tm) = manager().await;
        let tm = TokenManager::new(tm.db.clone(), tm.signing_keys.clone(), "tokend", ChronoDuration::seconds(-1), false);
        let (token, _) = tm.create_token("device-1").await.unwrap();
        assert!(tm.verify_token(&token).await.is_ok());
    }

    #[tokio::test]
    async fn repeated_create_token_calls_yield_distinct_tokens() {
        let (_dir, tm) = manager().await;
        let (first, _) = tm.create_token("device-1").await.unwrap();
        let (second, _) = tm.create_token("device-1").await.unwrap();
        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn duplicate_token_insert_is_detected_as_a_unique_violation() {
        let (_dir, tm) = manager().await;
        // Ensures an active signing key and a registered device exist so
        // the inserts below only collide on `tokens.token`.
        tm.create_token("device-1").await.unwrap();
        let key_id = tm.signing_keys.active_key().await.unwrap().id;
        let exp = Utc::now() + ChronoDuration::minutes(30);

        TokenRepository::insert(tm.db.pool(), "dup-token", "device-1", key_id, exp).await.unwrap();
        let err = TokenRepository::insert(tm.db.pool(), "dup-token", "device-1", key_id, exp)
            .await
            .unwrap_err();
        assert!(is_unique_violation(&err));
    }

    #[tokio::test]
    async fn signing_key_store_initialized_reflects_active_key_presence() {
        let (_dir, tm) = manager().await;
        assert!(!tm.signing_key_store_initialized().await);
        tm.create_token("device-1").await.unwrap();
        assert!(tm.signing_key_store_initialized().await);
    }

    #[tokio::test]
    async fn get_keys_returns_every_signing_key() {
        let (_dir, tm) = manager().await;
        tm.create_token("device-1").await.unwrap();
        tm.rotate_key().await.unwrap();
        let keys = tm.get_keys().await.unwrap();
        assert_eq!(keys.len(), 2);
    }

    #[tokio::test]
    async fn verify_cache_state_reports_entry_or_stats() {
        let (_dir, tm) = manager().await;
        let (token, _) = tm.create_token("device-1").await.unwrap();

        let entry_inspection = tm.verify_cache_state(Some(&token)).await;
        assert!(matches!(entry_inspection, CacheInspection::Entry(_)));
        if let CacheInspection::Entry(entry) = entry_inspection {
            assert!(entry.has_cached_claims);
            assert_eq!(entry.cached_validation, Some(true));
        }

        let stats_inspection = tm.verify_cache_state(None).await;
        assert!(matches!(stats_inspection, CacheInspection::Stats(_)));
        if let CacheInspection::Stats(stats) = stats_inspection {
            assert_eq!(stats.positive_entries, 1);
        }
    }

    #[tokio::test]
    async fn verify_db_state_counts_total_and_revoked_tokens() {
        let (_dir, tm) = manager().await;
        let (token, _) = tm.create_token("device-1").await.unwrap();
        tm.create_token("device-1").await.unwrap();
        tm.revoke_token(&token).await.unwrap();

        let snapshot = tm.verify_db_state().await.unwrap();
        assert_eq!(snapshot.total_tokens, 2);
        assert_eq!(snapshot.revoked_tokens, 1);
    }
}
