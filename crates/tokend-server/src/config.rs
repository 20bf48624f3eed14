//! Server configuration.
//!
//! Loads configuration from environment variables with sensible defaults.
//! All settings can be overridden via `TOKEND_*` environment variables.

use std::net::SocketAddr;
use std::path::PathBuf;

/// Server configuration, assembled once at startup and held immutably in
/// `AppState` behind an `Arc`.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind the HTTP listener to.
    pub bind_addr: SocketAddr,
    /// Log level filter (e.g., `info`, `debug`, `warn`).
    pub log_level: String,
    /// Default token lifetime, in days.
    pub access_token_ttl_days: i64,
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Size guardrail checked at runtime, in MiB.
    pub db_max_size_mb: u64,
    /// Root of the secrets directory.
    pub secrets_dir: PathBuf,
    /// Flush threshold for batched activity.
    pub activity_buffer_size: usize,
    /// Periodic activity flush interval, in seconds.
    pub activity_flush_interval_s: u64,
    /// Trim window for rolling activity, in days.
    pub recent_activity_retention_days: i64,
    /// Whether `exp` is enforced during token verification.
    pub time_validation_enabled: bool,
    /// Skip `mlockall` (for development without root/`CAP_IPC_LOCK`).
    pub disable_mlock: bool,
    /// The appliance identifier embedded in token `iss` claims.
    pub issuer: String,
}

impl ServerConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `TOKEND_BIND_ADDR` — full bind address (default: `127.0.0.1:31415`)
    /// - `TOKEND_LOG_LEVEL` — log filter (default: `info`)
    /// - `TOKEND_ACCESS_TOKEN_TTL_DAYS` — default token lifetime (default: `30`)
    /// - `TOKEND_DB_PATH` — database file location (default: `./data/tokens.db`)
    /// - `TOKEND_DB_MAX_SIZE_MB` — size guardrail (default: `10`)
    /// - `TOKEND_SECRETS_DIR` — secrets directory root (default: `./data/secrets`)
    /// - `TOKEND_ACTIVITY_BUFFER_SIZE` — flush threshold (default: `1000`)
    /// - `TOKEND_ACTIVITY_FLUSH_INTERVAL_S` — flush interval (default: `3600`)
    /// - `TOKEND_RECENT_ACTIVITY_RETENTION_DAYS` — rolling-activity retention (default: `1`)
    /// - `TOKEND_TIME_VALIDATION_ENABLED` — enforce `exp` (default: `true`)
    /// - `TOKEND_DISABLE_MLOCK` — skip `mlockall` for dev environments (default: `false`)
    /// - `TOKEND_ISSUER` — appliance identifier embedded in tokens (default: `tokend`)
    #[must_use]
    pub fn from_env() -> Self {
        let bind_addr = std::env::var("TOKEND_BIND_ADDR")
            .ok()
            .and_then(|addr| addr.parse().ok())
            .unwrap_or_else(|| SocketAddr::from(([127, 0, 0, 1], 31415)));

        let log_level = std::env::var("TOKEND_LOG_LEVEL").unwrap_or_else(|_| "info".to_owned());

        let access_token_ttl_days = env_parsed("TOKEND_ACCESS_TOKEN_TTL_DAYS", 30);

        let db_path = std::env::var("TOKEND_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./data/tokens.db"));

        let db_max_size_mb = env_parsed("TOKEND_DB_MAX_SIZE_MB", 10);

        let secrets_dir = std::env::var("TOKEND_SECRETS_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./data/secrets"));

        let activity_buffer_size = env_parsed("TOKEND_ACTIVITY_BUFFER_SIZE", 1000);
        let activity_flush_interval_s = env_parsed("TOKEND_ACTIVITY_FLUSH_INTERVAL_S", 3600);
        let recent_activity_retention_days = env_parsed("TOKEND_RECENT_ACTIVITY_RETENTION_DAYS", 1);

        let time_validation_enabled = std::env::var("TOKEND_TIME_VALIDATION_ENABLED")
            .map(|v| v != "false" && v != "0")
            .unwrap_or(true);

        let disable_mlock = std::env::var("TOKEND_DISABLE_MLOCK")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(false);

        let issuer = std::env::var("TOKEND_ISSUER").unwrap_or_else(|_| "tokend".to_owned());

        Self {
            bind_addr,
            log_level,
            access_token_ttl_days,
            db_path,
            db_max_size_mb,
            secrets_dir,
            activity_buffer_size,
            activity_flush_interval_s,
            recent_activity_retention_days,
            time_validation_enabled,
            disable_mlock,
            issuer,
        }
    }
}

fn env_parsed<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}
