//! Row types for the persisted schema. See `db::MIGRATIONS` for the DDL
//! these mirror.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A symmetric key used to sign and verify bearer tokens.
///
/// At most one row has `active = true`; the [`crate::signing_key::SigningKeyManager`]
/// enforces this, not a schema constraint.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct SigningKeyRow {
    pub id: i64,
    /// Opaque 32-byte secret, base64-encoded.
    pub key: String,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// A bearer token issued to a device.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct TokenRow {
    pub id: i64,
    pub token: String,
    pub device_id: String,
    pub key_id: i64,
    pub expires_at: DateTime<Utc>,
    pub revoked: bool,
    pub created_at: DateTime<Utc>,
}

/// A device known to the system, created on first token issuance.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct DeviceRow {
    pub device_id: String,
    pub first_seen: DateTime<Utc>,
    pub last_seen: Option<DateTime<Utc>>,
}

/// Per-device request/error/endpoint counters.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct DeviceStatsRow {
    pub device_id: String,
    pub request_count: i64,
    pub error_count: i64,
    pub endpoint_count: i64,
    pub last_activity: Option<DateTime<Utc>>,
}

/// A single activity event, either historical (`device_activity`) or
/// rolling (`device_activity_recent`) depending on which table it was read
/// from.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow, Serialize, Deserialize)]
pub struct DeviceActivityRow {
    pub id: i64,
    pub device_id: String,
    pub endpoint: String,
    pub status_code: i64,
    pub timestamp: DateTime<Utc>,
}

/// Which activity table an operation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivityKind {
    /// `device_activity_recent` — short retention, dashboard-facing.
    Recent,
    /// `device_activity` — append-only audit trail.
    Historical,
}

impl ActivityKind {
    pub fn table_name(self) -> &'static str {
        match self {
            ActivityKind::Recent => "device_activity_recent",
            ActivityKind::Historical => "device_activity",
        }
    }
}

/// Decoded JWT-style claims for a token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub iss: String,
    pub did: String,
    pub exp: i64,
    pub iat: i64,
    pub kid: String,
    pub jti: String,
}

impl Claims {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now.timestamp() >= self.exp
    }
}
