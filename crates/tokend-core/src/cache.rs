//! In-memory caches sitting in front of the database.
//!
//! Every table here is guarded by one mutex per cache; callers must never
//! hold that lock across an `.await` on a database call. Entries carry their
//! own TTL because the cache has no background sweeper of its own — it is
//! cleaned lazily, on read, by whichever request happens to touch a stale
//! entry.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::models::{Claims, SigningKeyRow};

/// Entry counts across the three cache tables, for operational visibility.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct CacheStats {
    pub positive_entries: usize,
    pub validation_entries: usize,
    pub timestamp_entries: usize,
}

/// Snapshot of cached state for a single token.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct CacheDebugEntry {
    pub has_cached_claims: bool,
    pub cached_validation: Option<bool>,
}

const VALIDATION_TTL: Duration = Duration::from_secs(5 * 60);
const TIMESTAMP_TTL: Duration = Duration::from_secs(60 * 60);
const TIMESTAMP_CACHE_CAP: usize = 1000;

struct ValidationEntry {
    is_valid: bool,
    recorded_at: Instant,
}

struct TimestampEntry {
    is_expired: bool,
    computed_at: Instant,
}

/// Caches decoded claims, pass/fail verification outcomes, and expiry
/// computations for tokens, all keyed off the raw token string or its
/// `exp` claim.
#[derive(Default)]
pub struct TokenCache {
    positive: HashMap<String, Claims>,
    validation: HashMap<String, ValidationEntry>,
    timestamps: HashMap<i64, TimestampEntry>,
}

impl TokenCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claims for a token that has already passed full verification.
    pub fn get_claims(&self, token: &str) -> Option<&Claims> {
        self.positive.get(token)
    }

    pub fn put_claims(&mut self, token: String, claims: Claims) {
        self.positive.insert(token, claims);
    }

    pub fn invalidate_claims(&mut self, token: &str) {
        self.positive.remove(token);
    }

    /// A cached validity verdict for `token`, if one was recorded within
    /// the last five minutes.
    pub fn get_validation(&mut self, token: &str) -> Option<bool> {
        let Some(entry) = self.validation.get(token) else {
            return None;
        };
        if entry.recorded_at.elapsed() > VALIDATION_TTL {
            self.validation.remove(token);
            return None;
        }
        Some(entry.is_valid)
    }

    pub fn put_validation(&mut self, token: String, is_valid: bool) {
        self.validation.insert(
            token,
            ValidationEntry {
                is_valid,
                recorded_at: Instant::now(),
            },
        );
    }

    pub fn invalidate_validation(&mut self, token: &str) {
        self.validation.remove(token);
    }

    /// Whether `exp_timestamp` (a Unix timestamp) is in the past, consulting
    /// the one-hour timestamp cache before computing it fresh.
    pub fn is_expired(&mut self, exp_timestamp: i64, now: DateTime<Utc>) -> bool {
        if let Some(entry) = self.timestamps.get(&exp_timestamp) {
            if entry.computed_at.elapsed() <= TIMESTAMP_TTL {
                return entry.is_expired;
            }
        }

        let is_expired = now.timestamp() >= exp_timestamp;
        self.evict_oldest_timestamp_if_full();
        self.timestamps.insert(
            exp_timestamp,
            TimestampEntry {
                is_expired,
                computed_at: Instant::now(),
            },
        );
        is_expired
    }

    fn evict_oldest_timestamp_if_full(&mut self) {
        if self.timestamps.len() < TIMESTAMP_CACHE_CAP {
            return;
        }
        if let Some(oldest_key) = self
            .timestamps
            .iter()
            .min_by_key(|(_, entry)| entry.computed_at)
            .map(|(key, _)| *key)
        {
            self.timestamps.remove(&oldest_key);
        }
    }

    pub fn clear(&mut self) {
        self.positive.clear();
        self.validation.clear();
        self.timestamps.clear();
    }

    /// Evicts positive-cache entries whose `exp` is no longer in the future.
    /// Returns the number of entries removed.
    pub fn clear_expired(&mut self, now: DateTime<Utc>) -> usize {
        let before = self.positive.len();
        self.positive.retain(|_, claims| claims.exp > now.timestamp());
        before - self.positive.len()
    }

    /// Snapshot of cached state for `token`, without mutating or evicting
    /// anything — intended for diagnostics, not the verification hot path.
    pub fn debug(&self, token: &str) -> CacheDebugEntry {
        CacheDebugEntry {
            has_cached_claims: self.positive.contains_key(token),
            cached_validation: self.validation.get(token).map(|entry| entry.is_valid),
        }
    }

    /// Entry counts across all three tables.
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            positive_entries: self.positive.len(),
            validation_entries: self.validation.len(),
            timestamp_entries: self.timestamps.len(),
        }
    }

    pub fn len_positive(&self) -> usize {
        self.positive.len()
    }
}

/// Caches signing-key rows by id, plus which one is currently active, so
/// token verification doesn't hit the database for every request.
#[derive(Default)]
pub struct SigningKeyCache {
    by_id: HashMap<i64, SigningKeyRow>,
    active_key_id: Option<i64>,
}

impl SigningKeyCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn active(&self) -> Option<&SigningKeyRow> {
        self.active_key_id.and_then(|id| self.by_id.get(&id))
    }

    pub fn get(&self, key_id: i64) -> Option<&SigningKeyRow> {
        self.by_id.get(&key_id)
    }

    /// Replaces the active key, demoting whatever key previously held that
    /// role but keeping it in the cache for verifying tokens signed before
    /// rotation.
    pub fn set_active(&mut self, key: SigningKeyRow) {
        self.active_key_id = Some(key.id);
        self.by_id.insert(key.id, key);
    }

    pub fn insert(&mut self, key: SigningKeyRow) {
        if key.active {
            self.active_key_id = Some(key.id);
        }
        self.by_id.insert(key.id, key);
    }

    pub fn clear(&mut self) {
        self.by_id.clear();
        self.active_key_id = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample_claims() -> Claims {
        Claims {
            sub: "device-1".into(),
            iss: "tokend".into(),
            did: "device-1".into(),
            exp: 9_999_999_999,
            iat: 0,
            kid: "1".into(),
            jti: "abc".into(),
        }
    }

    #[test]
    fn positive_cache_round_trips() {
        let mut cache = TokenCache::new();
        cache.put_claims("tok".into(), sample_claims());
        assert_eq!(cache.get_claims("tok").unwrap().sub, "device-1");
        cache.invalidate_claims("tok");
        assert!(cache.get_claims("tok").is_none());
    }

    #[test]
    fn validation_cache_returns_none_after_ttl_elapsed() {
        let mut cache = TokenCache::new();
        cache.put_validation("tok".into(), true);
        assert_eq!(cache.get_validation("tok"), Some(true));
    }

    #[test]
    fn timestamp_cache_memoizes_expiry() {
        let mut cache = TokenCache::new();
        let now = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        assert!(cache.is_expired(1_600_000_000, now));
        assert!(!cache.is_expired(1_800_000_000, now));
        assert!(cache.is_expired(1_600_000_000, now));
    }

    #[test]
    fn timestamp_cache_evicts_oldest_when_full() {
        let mut cache = TokenCache::new();
        let now = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        for i in 0..TIMESTAMP_CACHE_CAP as i64 {
            cache.is_expired(i, now);
        }
        assert_eq!(cache.timestamps.len(), TIMESTAMP_CACHE_CAP);
        cache.is_expired(TIMESTAMP_CACHE_CAP as i64, now);
        assert_eq!(cache.timestamps.len(), TIMESTAMP_CACHE_CAP);
        assert!(!cache.timestamps.contains_key(&0));
    }

    #[test]
    fn clear_expired_evicts_only_past_claims() {
        let mut cache = TokenCache::new();
        let mut expired = sample_claims();
        expired.exp = 100;
        cache.put_claims("expired".into(), expired);
        cache.put_claims("fresh".into(), sample_claims());

        let now = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let removed = cache.clear_expired(now);
        assert_eq!(removed, 1);
        assert!(cache.get_claims("expired").is_none());
        assert!(cache.get_claims("fresh").is_some());
    }

    #[test]
    fn debug_reports_cached_claims_and_validation() {
        let mut cache = TokenCache::new();
        cache.put_claims("tok".into(), sample_claims());
        cache.put_validation("tok".into(), true);

        let entry = cache.debug("tok");
        assert!(entry.has_cached_claims);
        assert_eq!(entry.cached_validation, Some(true));

        let missing = cache.debug("other");
        assert!(!missing.has_cached_claims);
        assert_eq!(missing.cached_validation, None);
    }

    #[test]
    fn stats_reports_entry_counts() {
        let mut cache = TokenCache::new();
        cache.put_claims("tok".into(), sample_claims());
        cache.put_validation("tok".into(), true);
        cache.is_expired(9_999_999_999, Utc::now());

        let stats = cache.stats();
        assert_eq!(stats.positive_entries, 1);
        assert_eq!(stats.validation_entries, 1);
        assert_eq!(stats.timestamp_entries, 1);
    }

    #[test]
    fn signing_key_cache_tracks_active_key() {
        let mut cache = SigningKeyCache::new();
        cache.insert(SigningKeyRow {
            id: 1,
            key: "k1".into(),
            active: true,
            created_at: Utc::now(),
            updated_at: None,
        });
        assert_eq!(cache.active().unwrap().id, 1);

        cache.set_active(SigningKeyRow {
            id: 2,
            key: "k2".into(),
            active: true,
            created_at: Utc::now(),
            updated_at: None,
        });
        assert_eq!(cache.active().unwrap().id, 2);
        assert!(cache.get(1).is_some());
    }
}
