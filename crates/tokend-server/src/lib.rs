//! Token daemon HTTP server.
//!
//! Wires `tokend-core`'s signing keys, token lifecycle, and storage behind
//! an Axum server: the `AuthGate` middleware, activity accounting, the
//! retention sweeper, and a small set of routes.

pub mod activity;
pub mod auth_gate;
pub mod config;
pub mod error;
pub mod hardening;
pub mod retention;
pub mod routes;
pub mod state;
