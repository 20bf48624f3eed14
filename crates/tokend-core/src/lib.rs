//! Core authentication domain: signing keys, token lifecycle, in-memory
//! caches, and the embedded SQLite store behind them.
//!
//! This crate knows nothing about HTTP; `tokend-server` composes it behind
//! an Axum middleware and a set of routes.

pub mod cache;
pub mod db;
pub mod error;
pub mod models;
pub mod repositories;
pub mod secrets;
pub mod signing_key;
pub mod token_manager;

pub use cache::{SigningKeyCache, TokenCache};
pub use db::Database;
pub use models::Claims;
pub use error::{ActivityError, DatabaseError, RepositoryError, SecretsInitError, SigningKeyError, TokenError};
pub use secrets::SecretsStore;
pub use signing_key::SigningKeyManager;
pub use token_manager::TokenManager;
