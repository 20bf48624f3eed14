//! Shared harness for building a fully-wired app over a temp-file SQLite
//! database, the way `main.rs` composes `AppState` and the router.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::middleware as axum_mw;
use axum::Router;
use chrono::Duration as ChronoDuration;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use tower::ServiceExt;

use tokend_core::{Database, SecretsStore, SigningKeyManager, TokenManager};
use tokend_server::activity::{activity_middleware, ActivityRecorder};
use tokend_server::auth_gate::auth_gate;
use tokend_server::config::ServerConfig;
use tokend_server::routes;
use tokend_server::state::AppState;

type HmacSha256 = Hmac<Sha256>;

pub const LOOPBACK: SocketAddr = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 9);
pub const REMOTE: SocketAddr = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(192, 0, 2, 9)), 9);

pub struct Harness {
    pub state: Arc<AppState>,
    pub router: Router,
    _dir: tempfile::TempDir,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_buffer_size(1000).await
    }

    pub async fn with_buffer_size(buffer_size: usize) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut config = ServerConfig::from_env();
        config.db_path = dir.path().join("tokens.db");
        config.secrets_dir = dir.path().join("secrets");
        config.activity_buffer_size = buffer_size;
        Self::build(config, dir).await
    }

    /// Rebuilds a harness over an existing db path and secrets dir, the way
    /// the daemon reconnects across a restart.
    pub async fn reconnect(db_path: std::path::PathBuf, secrets_dir: std::path::PathBuf, dir: tempfile::TempDir) -> Self {
        let mut config = ServerConfig::from_env();
        config.db_path = db_path;
        config.secrets_dir = secrets_dir;
        Self::build(config, dir).await
    }

    async fn build(config: ServerConfig, dir: tempfile::TempDir) -> Self {
        let secrets_store = Arc::new(SecretsStore::load_or_create(config.secrets_dir.clone()).expect("secrets"));
        let db = Arc::new(Database::connect(config.db_path.clone(), config.db_max_size_mb).await.expect("db"));
        let signing_keys = SigningKeyManager::new(Arc::clone(&db));
        let token_manager = TokenManager::new(
            Arc::clone(&db),
            signing_keys,
            config.issuer.clone(),
            ChronoDuration::days(config.access_token_ttl_days),
            config.time_validation_enabled,
        );
        let activity = Arc::new(ActivityRecorder::new(Arc::clone(&db), &config));

        let state = Arc::new(AppState { config, db, token_manager, secrets_store, activity });

        let authenticated = Router::new()
            .nest("/auth", routes::auth::router())
            .merge(routes::system::authenticated_router())
            .route_layer(axum_mw::from_fn_with_state(Arc::clone(&state), activity_middleware))
            .route_layer(axum_mw::from_fn_with_state(Arc::clone(&state), auth_gate));

        let router = Router::new()
            .merge(routes::system::public_router())
            .merge(authenticated)
            .with_state(Arc::clone(&state));

        Self { state, router, _dir: dir }
    }

    /// Path and tempdir-owning handle to this harness's underlying state,
    /// so a caller can tear the harness down and rebuild over the same
    /// files.
    pub fn into_paths(self) -> (std::path::PathBuf, std::path::PathBuf, tempfile::TempDir) {
        let db_path = self.state.db.path().to_path_buf();
        let secrets_dir = self.state.config.secrets_dir.clone();
        (db_path, secrets_dir, self._dir)
    }

    pub fn shared_secret(&self) -> Vec<u8> {
        self.state.secrets_store.shared_secret().to_vec()
    }

    /// Sends a request through the router with `ConnectInfo` set to `peer`,
    /// the way `into_make_service_with_connect_info` would inject it.
    pub async fn send(&self, mut request: Request<Body>, peer: SocketAddr) -> axum::response::Response {
        request.extensions_mut().insert(axum::extract::ConnectInfo(peer));
        self.router.clone().oneshot(request).await.expect("router call")
    }
}

pub fn sign(secret: &[u8], method: &str, path: &str, query: &str, body: &str) -> String {
    let canonical = format!("{method}\n{path}\n{query}\n{body}");
    let mut mac = <HmacSha256 as Mac>::new_from_slice(secret).expect("hmac key");
    mac.update(canonical.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

pub async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), 1 << 20).await.expect("body");
    serde_json::from_slice(&bytes).expect("json body")
}

pub async fn issue_token(harness: &Harness, device_id: &str) -> String {
    let secret = harness.shared_secret();
    let body = format!(r#"{{"device_id":"{device_id}"}}"#);
    let signature = sign(&secret, "POST", "/auth/token", "", &body);

    let request = Request::builder()
        .method("POST")
        .uri("/auth/token")
        .header("x-request-signature", signature)
        .header("content-type", "application/json")
        .body(Body::from(body))
        .expect("request");

    let response = harness.send(request, LOOPBACK).await;
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    json["access_token"].as_str().expect("access_token").to_owned()
}
