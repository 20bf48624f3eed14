//! Typed errors for each core component.
//!
//! Kept separate per component so callers can match on the faults that are
//! actually possible for the operation they invoked; the HTTP boundary in
//! `tokend-server` collapses all of these into a single response shape.
//! Errors never carry key material or token contents — only identifiers and
//! operation descriptions.

use thiserror::Error;

/// Errors from bootstrapping or using the secrets directory.
#[derive(Debug, Error)]
pub enum SecretsInitError {
    #[error("failed to create secrets directory: {0}")]
    DirectoryCreate(#[source] std::io::Error),

    #[error("failed to read secret file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write secret file {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("secret file {0} exists but is empty")]
    Empty(String),

    #[error("encryption key is not the expected length")]
    InvalidKeyLength,

    #[error("encryption failed")]
    EncryptionFailed,

    #[error("decryption failed")]
    DecryptionFailed,
}

/// Errors from the embedded SQLite store.
#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("database corruption detected at {0}")]
    Corruption(String),

    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("database creation failed: {0}")]
    Create(String),

    #[error("vacuum failed: {0}")]
    Vacuum(String),

    #[error("backup failed: {0}")]
    Backup(String),
}

/// Errors from the signing-key manager.
#[derive(Debug, Error)]
pub enum SigningKeyError {
    #[error("no active signing key and none could be created")]
    NoActiveKey,

    #[error(transparent)]
    Database(#[from] DatabaseError),
}

/// Errors from token creation, verification, and revocation.
#[derive(Debug, Error)]
pub enum TokenError {
    #[error("malformed token: {0}")]
    Malformed(String),

    #[error("token not found")]
    NotFound,

    #[error("token revoked")]
    Revoked,

    #[error("token expired")]
    Expired,

    #[error("invalid signing key")]
    InvalidSigningKey,

    #[error("invalid signature")]
    InvalidSignature,

    #[error("missing required claim: {0}")]
    MissingClaim(&'static str),

    #[error("claim mismatch: {0}")]
    ClaimMismatch(&'static str),

    #[error("could not allocate a unique token after retrying")]
    Collision,

    #[error(transparent)]
    SigningKey(#[from] SigningKeyError),

    #[error(transparent)]
    Database(#[from] DatabaseError),
}

/// Errors surfaced while recording or flushing activity.
#[derive(Debug, Error)]
pub enum ActivityError {
    #[error(transparent)]
    Database(#[from] DatabaseError),
}

/// A row lookup or constraint failure from a repository method.
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("not found")]
    NotFound,

    #[error(transparent)]
    Database(#[from] DatabaseError),
}
