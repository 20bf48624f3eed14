//! Embedded SQLite store: schema migrations, integrity verification,
//! self-repair on corruption, and the runtime pragmas every connection gets.

use std::path::{Path, PathBuf};

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use tokio::sync::Mutex;

use crate::error::DatabaseError;

const REQUIRED_INDEXES: &[&str] = &["idx_tokens_device_id", "idx_tokens_expires"];

/// Numbered, append-only migration scripts. Index `0` is always the
/// `schema_version` bootstrap; everything after is versioned starting at 1.
const MIGRATIONS: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS schema_version (
        version INTEGER PRIMARY KEY,
        applied_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
    )",
    "CREATE TABLE IF NOT EXISTS signing_keys (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        key TEXT NOT NULL UNIQUE,
        created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
        updated_at TIMESTAMP,
        active BOOLEAN NOT NULL DEFAULT 1
    )",
    "CREATE TABLE IF NOT EXISTS devices (
        device_id TEXT PRIMARY KEY,
        first_seen TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
        last_seen TIMESTAMP
    )",
    "CREATE TABLE IF NOT EXISTS tokens (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        token TEXT NOT NULL UNIQUE,
        created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
        expires_at TIMESTAMP NOT NULL,
        key_id INTEGER NOT NULL,
        device_id TEXT NOT NULL,
        revoked BOOLEAN NOT NULL DEFAULT 0,
        FOREIGN KEY (key_id) REFERENCES signing_keys (id),
        FOREIGN KEY (device_id) REFERENCES devices (device_id)
    )",
    "CREATE INDEX IF NOT EXISTS idx_tokens_device_id ON tokens(device_id)",
    "CREATE INDEX IF NOT EXISTS idx_tokens_expires ON tokens(expires_at)",
    "CREATE TABLE IF NOT EXISTS device_activity (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        device_id TEXT NOT NULL,
        endpoint TEXT NOT NULL,
        status_code INTEGER NOT NULL,
        timestamp TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
        FOREIGN KEY (device_id) REFERENCES devices (device_id)
    )",
    "CREATE INDEX IF NOT EXISTS idx_activity_device ON device_activity(device_id)",
    "CREATE INDEX IF NOT EXISTS idx_activity_timestamp ON device_activity(timestamp)",
    "CREATE TABLE IF NOT EXISTS device_stats (
        device_id TEXT PRIMARY KEY,
        request_count INTEGER NOT NULL DEFAULT 0,
        error_count INTEGER NOT NULL DEFAULT 0,
        endpoint_count INTEGER NOT NULL DEFAULT 0,
        last_activity TIMESTAMP,
        FOREIGN KEY (device_id) REFERENCES devices (device_id)
    )",
    "CREATE TABLE IF NOT EXISTS device_activity_recent (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        device_id TEXT NOT NULL,
        endpoint TEXT NOT NULL,
        status_code INTEGER NOT NULL,
        timestamp TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
        FOREIGN KEY (device_id) REFERENCES devices (device_id)
    )",
    "CREATE INDEX IF NOT EXISTS idx_activity_recent_device ON device_activity_recent(device_id)",
    "CREATE INDEX IF NOT EXISTS idx_activity_recent_timestamp ON device_activity_recent(timestamp)",
    "CREATE TRIGGER IF NOT EXISTS cleanup_old_activity
     AFTER INSERT ON device_activity_recent
     BEGIN
        DELETE FROM device_activity_recent
        WHERE timestamp < datetime('now', '-1 day');
     END",
];

/// Embedded SQL store. Owns the file handle and the pool of connections
/// drawn from it; initialization and recovery are serialized by `init_lock`
/// so only one caller ever performs recovery.
pub struct Database {
    path: PathBuf,
    max_size_mb: u64,
    pool: SqlitePool,
    init_lock: Mutex<()>,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("path", &self.path)
            .field("max_size_mb", &self.max_size_mb)
            .finish_non_exhaustive()
    }
}

impl Database {
    /// Ensures the database file exists and passes integrity verification,
    /// recreating it from migrations if either check fails.
    pub async fn connect(path: impl Into<PathBuf>, max_size_mb: u64) -> Result<Self, DatabaseError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        ensure_database_exists(&path).await?;
        let pool = open_pool(&path).await?;

        Ok(Self {
            path,
            max_size_mb,
            pool,
            init_lock: Mutex::new(()),
        })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Re-runs integrity verification, recreating the database in place if
    /// it fails. Serialized so concurrent callers don't race recovery.
    pub async fn ensure_healthy(&mut self) -> Result<(), DatabaseError> {
        let _guard = self.init_lock.lock().await;
        if !check_integrity(&self.pool).await? {
            tracing::error!(
                component = "database",
                action = "recreate_database",
                path = %self.path.display(),
                "integrity check failed, recreating"
            );
            self.pool.close().await;
            recreate_database(&self.path).await?;
            self.pool = open_pool(&self.path).await?;
        }
        Ok(())
    }

    pub async fn check_integrity(&self) -> Result<bool, DatabaseError> {
        check_integrity(&self.pool).await
    }

    /// Whether the database file is within the configured size guardrail.
    pub fn check_size(&self) -> bool {
        match std::fs::metadata(&self.path) {
            Ok(meta) => {
                let size_mb = meta.len() as f64 / (1024.0 * 1024.0);
                size_mb <= self.max_size_mb as f64
            }
            Err(_) => false,
        }
    }

    pub async fn vacuum(&self) -> Result<(), DatabaseError> {
        sqlx::query("VACUUM")
            .execute(&self.pool)
            .await
            .map_err(|e| DatabaseError::Vacuum(e.to_string()))?;
        Ok(())
    }

    /// Copies the database file to `destination` using SQLite's online
    /// backup facility (`VACUUM INTO`), refusing if integrity verification
    /// fails first.
    pub async fn backup(&self, destination: &Path) -> Result<(), DatabaseError> {
        if !self.check_integrity().await? {
            return Err(DatabaseError::Backup(
                "refusing to back up a database that failed integrity check".into(),
            ));
        }
        let dest = destination.display().to_string();
        sqlx::query(&format!("VACUUM INTO '{dest}'"))
            .execute(&self.pool)
            .await
            .map_err(|e| DatabaseError::Backup(e.to_string()))?;
        Ok(())
    }
}

async fn ensure_database_exists(path: &Path) -> Result<(), DatabaseError> {
    if !path.exists() {
        tracing::warn!(
            component = "database",
            action = "create_database",
            path = %path.display(),
            reason = "not_exists",
            "database creation needed"
        );
        return create_base_database(path).await;
    }

    let probe_pool = open_pool(path).await?;
    let healthy = check_integrity(&probe_pool).await?;
    probe_pool.close().await;

    if !healthy {
        tracing::error!(
            component = "database",
            action = "recreate_database",
            path = %path.display(),
            reason = "integrity_check_failed",
            "database integrity check failed"
        );
        recreate_database(path).await?;
    }
    Ok(())
}

async fn recreate_database(path: &Path) -> Result<(), DatabaseError> {
    if path.exists() {
        std::fs::remove_file(path)?;
    }
    for sidecar in ["-wal", "-shm"] {
        let p = path.with_extension(format!("db{sidecar}"));
        let _ = std::fs::remove_file(p);
    }
    create_base_database(path).await
}

async fn create_base_database(path: &Path) -> Result<(), DatabaseError> {
    let pool = open_pool(path).await?;
    run_migrations(&pool).await?;
    pool.close().await;

    tracing::info!(
        component = "database",
        action = "create_database",
        path = %path.display(),
        "created new database"
    );
    Ok(())
}

async fn open_pool(path: &Path) -> Result<SqlitePool, DatabaseError> {
    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
        .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
        .foreign_keys(true)
        .pragma("temp_store", "MEMORY")
        .pragma("cache_size", "-2000");

    SqlitePoolOptions::new()
        .max_connections(8)
        .connect_with(options)
        .await
        .map_err(DatabaseError::from)
}

async fn run_migrations(pool: &SqlitePool) -> Result<(), DatabaseError> {
    sqlx::query(MIGRATIONS[0]).execute(pool).await?;

    let current_version: i64 = sqlx::query_scalar("SELECT COALESCE(MAX(version), 0) FROM schema_version")
        .fetch_one(pool)
        .await?;

    let mut tx = pool.begin().await?;
    for (i, migration) in MIGRATIONS.iter().enumerate().skip(1) {
        let version = i as i64;
        if version <= current_version {
            continue;
        }
        if migration.contains("CREATE TRIGGER") {
            sqlx::query(migration).execute(&mut *tx).await?;
        } else {
            for statement in migration.split(';').map(str::trim).filter(|s| !s.is_empty()) {
                sqlx::query(statement).execute(&mut *tx).await?;
            }
        }
        sqlx::query("INSERT INTO schema_version (version) VALUES (?)")
            .bind(version)
            .execute(&mut *tx)
            .await?;
        tracing::debug!(component = "database", action = "apply_migration", version, "applied migration");
    }
    tx.commit().await?;
    Ok(())
}

async fn check_integrity(pool: &SqlitePool) -> Result<bool, DatabaseError> {
    // Connectivity check.
    if sqlx::query("SELECT name FROM sqlite_master LIMIT 1")
        .fetch_optional(pool)
        .await
        .is_err()
    {
        return Ok(false);
    }

    let journal_mode: String = sqlx::query_scalar("PRAGMA journal_mode")
        .fetch_one(pool)
        .await?;
    if !journal_mode.eq_ignore_ascii_case("wal") {
        tracing::error!(
            component = "database",
            action = "check_journal_mode",
            expected = "wal",
            actual = %journal_mode,
            "invalid journal mode"
        );
        return Ok(false);
    }

    let rows = sqlx::query("SELECT name FROM sqlite_master WHERE type = 'index'")
        .fetch_all(pool)
        .await?;
    let indexes: std::collections::HashSet<String> =
        rows.iter().map(|r| r.get::<String, _>("name")).collect();
    let missing: Vec<&str> = REQUIRED_INDEXES
        .iter()
        .filter(|name| !indexes.contains(**name))
        .copied()
        .collect();
    if !missing.is_empty() {
        tracing::error!(
            component = "database",
            action = "check_indexes",
            missing = ?missing,
            "missing required indexes"
        );
        return Ok(false);
    }

    let integrity: String = sqlx::query_scalar("PRAGMA integrity_check")
        .fetch_one(pool)
        .await?;
    if integrity != "ok" {
        tracing::error!(component = "database", action = "integrity_check", result = %integrity, "integrity check failed");
        return Ok(false);
    }

    let fk_violations = sqlx::query("PRAGMA foreign_key_check").fetch_all(pool).await?;
    if !fk_violations.is_empty() {
        tracing::error!(component = "database", action = "foreign_key_check", "foreign key check failed");
        return Ok(false);
    }

    Ok(true)
}
