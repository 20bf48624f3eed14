//! Thin, transactionally-scoped data access for keys, tokens, devices,
//! activity, and stats.
//!
//! Every function takes anything that implements `sqlx::Executor` for
//! SQLite, so callers can pass either a pool (read-only, autocommit
//! operations) or a transaction (multi-step operations that must commit
//! together, like token issuance and key rotation).

use chrono::{DateTime, Utc};
use sqlx::{Executor, Sqlite};
use std::collections::HashSet;

use crate::error::{DatabaseError, RepositoryError};
use crate::models::{ActivityKind, DeviceActivityRow, DeviceRow, DeviceStatsRow, SigningKeyRow, TokenRow};

/// Operations on `signing_keys`.
pub mod signing_keys {
    use super::*;

    pub async fn get_active<'c, E>(exec: E) -> Result<Option<SigningKeyRow>, DatabaseError>
    where
        E: Executor<'c, Database = Sqlite>,
    {
        sqlx::query_as::<_, SigningKeyRow>(
            "SELECT id, key, active, created_at, updated_at FROM signing_keys WHERE active = 1 LIMIT 1",
        )
        .fetch_optional(exec)
        .await
        .map_err(DatabaseError::from)
    }

    pub async fn get_by_id<'c, E>(exec: E, id: i64) -> Result<Option<SigningKeyRow>, DatabaseError>
    where
        E: Executor<'c, Database = Sqlite>,
    {
        sqlx::query_as::<_, SigningKeyRow>(
            "SELECT id, key, active, created_at, updated_at FROM signing_keys WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(exec)
        .await
        .map_err(DatabaseError::from)
    }

    pub async fn deactivate_all<'c, E>(exec: E) -> Result<(), DatabaseError>
    where
        E: Executor<'c, Database = Sqlite>,
    {
        sqlx::query("UPDATE signing_keys SET active = 0, updated_at = CURRENT_TIMESTAMP WHERE active = 1")
            .execute(exec)
            .await?;
        Ok(())
    }

    pub async fn insert<'c, E>(exec: E, key_material: &str) -> Result<SigningKeyRow, DatabaseError>
    where
        E: Executor<'c, Database = Sqlite>,
    {
        let id: i64 = sqlx::query_scalar(
            "INSERT INTO signing_keys (key, active) VALUES (?, 1) RETURNING id",
        )
        .bind(key_material)
        .fetch_one(exec)
        .await?;

        Ok(SigningKeyRow {
            id,
            key: key_material.to_owned(),
            active: true,
            created_at: Utc::now(),
            updated_at: None,
        })
    }

    pub async fn list_all<'c, E>(exec: E) -> Result<Vec<SigningKeyRow>, DatabaseError>
    where
        E: Executor<'c, Database = Sqlite>,
    {
        sqlx::query_as::<_, SigningKeyRow>(
            "SELECT id, key, active, created_at, updated_at FROM signing_keys ORDER BY created_at DESC",
        )
        .fetch_all(exec)
        .await
        .map_err(DatabaseError::from)
    }
}

/// Repository for tokens.
pub struct TokenRepository;

impl TokenRepository {
    pub async fn get_by_value<'c, E>(exec: E, token_value: &str) -> Result<Option<TokenRow>, DatabaseError>
    where
        E: Executor<'c, Database = Sqlite>,
    {
        sqlx::query_as::<_, TokenRow>(
            "SELECT id, token, device_id, key_id, expires_at, revoked, created_at FROM tokens WHERE token = ?",
        )
        .bind(token_value)
        .fetch_optional(exec)
        .await
        .map_err(DatabaseError::from)
    }

    pub async fn get_active_for_device<'c, E>(
        exec: E,
        device_id: &str,
        include_revoked: bool,
    ) -> Result<Vec<TokenRow>, DatabaseError>
    where
        E: Executor<'c, Database = Sqlite>,
    {
        let sql = if include_revoked {
            "SELECT id, token, device_id, key_id, expires_at, revoked, created_at FROM tokens \
             WHERE device_id = ? ORDER BY created_at DESC"
        } else {
            "SELECT id, token, device_id, key_id, expires_at, revoked, created_at FROM tokens \
             WHERE device_id = ? AND revoked = 0 AND expires_at > datetime('now') ORDER BY created_at DESC"
        };
        sqlx::query_as::<_, TokenRow>(sql)
            .bind(device_id)
            .fetch_all(exec)
            .await
            .map_err(DatabaseError::from)
    }

    pub async fn insert<'c, E>(
        exec: E,
        token_value: &str,
        device_id: &str,
        key_id: i64,
        expires_at: DateTime<Utc>,
    ) -> Result<TokenRow, DatabaseError>
    where
        E: Executor<'c, Database = Sqlite>,
    {
        let id: i64 = sqlx::query_scalar(
            "INSERT INTO tokens (token, device_id, key_id, expires_at, revoked) VALUES (?, ?, ?, ?, 0) RETURNING id",
        )
        .bind(token_value)
        .bind(device_id)
        .bind(key_id)
        .bind(expires_at)
        .fetch_one(exec)
        .await?;

        Ok(TokenRow {
            id,
            token: token_value.to_owned(),
            device_id: device_id.to_owned(),
            key_id,
            expires_at,
            revoked: false,
            created_at: Utc::now(),
        })
    }

    pub async fn revoke<'c, E>(exec: E, token_value: &str) -> Result<bool, DatabaseError>
    where
        E: Executor<'c, Database = Sqlite>,
    {
        let result = sqlx::query("UPDATE tokens SET revoked = 1 WHERE token = ? AND revoked = 0")
            .bind(token_value)
            .execute(exec)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Revokes every non-revoked token whose `key_id` differs from `new_key_id`.
    pub async fn revoke_all_except_key<'c, E>(exec: E, new_key_id: i64) -> Result<u64, DatabaseError>
    where
        E: Executor<'c, Database = Sqlite>,
    {
        let result = sqlx::query("UPDATE tokens SET revoked = 1 WHERE key_id != ? AND revoked = 0")
            .bind(new_key_id)
            .execute(exec)
            .await?;
        Ok(result.rows_affected())
    }

    /// Deletes rows that are both revoked and expired. Returns the count deleted.
    pub async fn purge_expired<'c, E>(exec: E) -> Result<u64, DatabaseError>
    where
        E: Executor<'c, Database = Sqlite>,
    {
        let result = sqlx::query("DELETE FROM tokens WHERE revoked = 1 AND expires_at < datetime('now')")
            .execute(exec)
            .await?;
        Ok(result.rows_affected())
    }
}

/// Repository for devices.
pub struct DeviceRepository;

impl DeviceRepository {
    pub async fn get_or_create<'c, E>(exec: E, device_id: &str) -> Result<DeviceRow, DatabaseError>
    where
        E: Executor<'c, Database = Sqlite> + Copy,
    {
        sqlx::query(
            "INSERT INTO devices (device_id, last_seen) VALUES (?, CURRENT_TIMESTAMP) \
             ON CONFLICT (device_id) DO UPDATE SET last_seen = CURRENT_TIMESTAMP",
        )
        .bind(device_id)
        .execute(exec)
        .await?;

        sqlx::query_as::<_, DeviceRow>(
            "SELECT device_id, first_seen, last_seen FROM devices WHERE device_id = ?",
        )
        .bind(device_id)
        .fetch_one(exec)
        .await
        .map_err(DatabaseError::from)
    }

    pub async fn get<'c, E>(exec: E, device_id: &str) -> Result<Option<DeviceRow>, DatabaseError>
    where
        E: Executor<'c, Database = Sqlite>,
    {
        sqlx::query_as::<_, DeviceRow>(
            "SELECT device_id, first_seen, last_seen FROM devices WHERE device_id = ?",
        )
        .bind(device_id)
        .fetch_optional(exec)
        .await
        .map_err(DatabaseError::from)
    }
}

/// Repository for per-device activity events.
pub struct ActivityRepository;

impl ActivityRepository {
    pub async fn create<'c, E>(
        exec: E,
        device_id: &str,
        endpoint: &str,
        status_code: i32,
        kind: ActivityKind,
    ) -> Result<(), DatabaseError>
    where
        E: Executor<'c, Database = Sqlite>,
    {
        let sql = format!(
            "INSERT INTO {} (device_id, endpoint, status_code) VALUES (?, ?, ?)",
            kind.table_name()
        );
        sqlx::query(&sql)
            .bind(device_id)
            .bind(endpoint)
            .bind(status_code)
            .execute(exec)
            .await?;
        Ok(())
    }

    pub async fn list<'c, E>(
        exec: E,
        device_id: Option<&str>,
        limit: i64,
        kind: ActivityKind,
    ) -> Result<Vec<DeviceActivityRow>, DatabaseError>
    where
        E: Executor<'c, Database = Sqlite>,
    {
        let table = kind.table_name();
        let rows = if let Some(device_id) = device_id {
            sqlx::query_as::<_, DeviceActivityRow>(&format!(
                "SELECT id, device_id, endpoint, status_code, timestamp FROM {table} \
                 WHERE device_id = ? ORDER BY timestamp DESC LIMIT ?"
            ))
            .bind(device_id)
            .bind(limit)
            .fetch_all(exec)
            .await?
        } else {
            sqlx::query_as::<_, DeviceActivityRow>(&format!(
                "SELECT id, device_id, endpoint, status_code, timestamp FROM {table} \
                 ORDER BY timestamp DESC LIMIT ?"
            ))
            .bind(limit)
            .fetch_all(exec)
            .await?
        };
        Ok(rows)
    }

    pub async fn purge_older_than<'c, E>(exec: E, cutoff: DateTime<Utc>) -> Result<u64, DatabaseError>
    where
        E: Executor<'c, Database = Sqlite>,
    {
        let result = sqlx::query("DELETE FROM device_activity_recent WHERE timestamp < ?")
            .bind(cutoff)
            .execute(exec)
            .await?;
        Ok(result.rows_affected())
    }
}

/// Repository for per-device stat aggregates.
pub struct StatsRepository;

impl StatsRepository {
    pub async fn get<'c, E>(exec: E, device_id: &str) -> Result<Option<DeviceStatsRow>, DatabaseError>
    where
        E: Executor<'c, Database = Sqlite>,
    {
        sqlx::query_as::<_, DeviceStatsRow>(
            "SELECT device_id, request_count, error_count, endpoint_count, last_activity \
             FROM device_stats WHERE device_id = ?",
        )
        .bind(device_id)
        .fetch_optional(exec)
        .await
        .map_err(DatabaseError::from)
    }

    /// Upserts the aggregate counters atomically; `endpoints` (if given)
    /// replaces `endpoint_count` with its cardinality.
    pub async fn update<'c, E>(
        exec: E,
        device_id: &str,
        delta_requests: i64,
        delta_errors: i64,
        endpoints: Option<&HashSet<String>>,
    ) -> Result<(), DatabaseError>
    where
        E: Executor<'c, Database = Sqlite>,
    {
        let endpoint_count = endpoints.map(|s| s.len() as i64);
        sqlx::query(
            "INSERT INTO device_stats (device_id, request_count, error_count, endpoint_count, last_activity) \
             VALUES (?, ?, ?, COALESCE(?, 0), CURRENT_TIMESTAMP) \
             ON CONFLICT (device_id) DO UPDATE SET \
                request_count = request_count + excluded.request_count, \
                error_count = error_count + excluded.error_count, \
                endpoint_count = COALESCE(?, device_stats.endpoint_count), \
                last_activity = CURRENT_TIMESTAMP",
        )
        .bind(device_id)
        .bind(delta_requests)
        .bind(delta_errors)
        .bind(endpoint_count)
        .bind(endpoint_count)
        .execute(exec)
        .await?;
        Ok(())
    }

    pub async fn active_devices<'c, E>(exec: E) -> Result<Vec<(TokenRow, DeviceStatsRow)>, DatabaseError>
    where
        E: Executor<'c, Database = Sqlite> + Copy,
    {
        let tokens = sqlx::query_as::<_, TokenRow>(
            "SELECT id, token, device_id, key_id, expires_at, revoked, created_at FROM tokens \
             WHERE revoked = 0 AND expires_at > datetime('now')",
        )
        .fetch_all(exec)
        .await?;

        let mut out = Vec::with_capacity(tokens.len());
        for token in tokens {
            if let Some(stats) = Self::get(exec, &token.device_id).await? {
                out.push((token, stats));
            }
        }
        Ok(out)
    }
}

/// Maps a missing required row to [`RepositoryError::NotFound`].
pub fn require<T>(value: Option<T>) -> Result<T, RepositoryError> {
    value.ok_or(RepositoryError::NotFound)
}
