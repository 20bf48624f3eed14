//! Token daemon entry point.
//!
//! Bootstraps secrets, the embedded database, and the token/activity
//! subsystems, then starts the Axum HTTP server with graceful shutdown. A
//! background retention worker runs alongside the server and is cancelled
//! on shutdown.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::http::HeaderValue;
use axum::middleware as axum_mw;
use axum::Router;
use chrono::Duration as ChronoDuration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::info;

use tower_http::cors::{Any, CorsLayer};
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;

use tokend_core::{Database, SecretsStore, SigningKeyManager, TokenManager};

use tokend_server::activity::{activity_middleware, ActivityRecorder};
use tokend_server::auth_gate::auth_gate;
use tokend_server::config::ServerConfig;
use tokend_server::hardening;
use tokend_server::retention::retention_worker;
use tokend_server::routes;
use tokend_server::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ServerConfig::from_env();

    // Hardening runs before logging is initialized, so failures use eprintln.
    apply_hardening(&config);

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level)),
        )
        .json()
        .init();

    info!(bind_addr = %config.bind_addr, "tokend starting");

    let state = build_app_state(&config).await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let retention_handle = {
        let token_manager = state.token_manager.clone();
        let db = Arc::clone(&state.db);
        let activity = Arc::clone(&state.activity);
        let config = state.config.clone();
        let mut rx = shutdown_rx.clone();
        tokio::spawn(async move {
            retention_worker(token_manager, db, activity, config, &mut rx).await;
        })
    };

    let app = build_router(Arc::clone(&state));

    let listener = TcpListener::bind(state.config.bind_addr)
        .await
        .with_context(|| format!("failed to bind to {}", state.config.bind_addr))?;

    info!(addr = %state.config.bind_addr, "tokend listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal(shutdown_tx))
    .await
    .context("server error")?;

    info!("waiting for background workers to stop");
    let _ = tokio::time::timeout(Duration::from_secs(10), retention_handle).await;

    // Flush whatever activity accumulated since the last periodic sweep.
    if let Err(e) = state.activity.flush().await {
        tracing::warn!(error = %e, "failed to flush activity buffers on shutdown");
    }

    info!("tokend stopped");
    Ok(())
}

/// Build the shared application state: secrets, database, signing keys, and
/// the token/activity subsystems that sit on top of them.
async fn build_app_state(config: &ServerConfig) -> anyhow::Result<Arc<AppState>> {
    let secrets_store = Arc::new(
        SecretsStore::load_or_create(config.secrets_dir.clone())
            .context("failed to bootstrap secrets")?,
    );

    let db = Arc::new(
        Database::connect(config.db_path.clone(), config.db_max_size_mb)
            .await
            .context("failed to open database")?,
    );

    let signing_keys = SigningKeyManager::new(Arc::clone(&db));
    let token_manager = TokenManager::new(
        Arc::clone(&db),
        signing_keys,
        config.issuer.clone(),
        ChronoDuration::days(config.access_token_ttl_days),
        config.time_validation_enabled,
    );
    let activity = Arc::new(ActivityRecorder::new(Arc::clone(&db), config));

    Ok(Arc::new(AppState {
        config: config.clone(),
        db,
        token_manager,
        secrets_store,
        activity,
    }))
}

/// Build the Axum router: an unauthenticated health route, and everything
/// else behind the auth gate and activity recorder.
fn build_router(state: Arc<AppState>) -> Router {
    let authenticated_routes = Router::new()
        .nest("/auth", routes::auth::router())
        .merge(routes::system::authenticated_router())
        .route_layer(axum_mw::from_fn_with_state(Arc::clone(&state), activity_middleware))
        .route_layer(axum_mw::from_fn_with_state(Arc::clone(&state), auth_gate));

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([axum::http::Method::GET, axum::http::Method::POST])
        .allow_headers([
            axum::http::header::CONTENT_TYPE,
            axum::http::header::AUTHORIZATION,
            axum::http::HeaderName::from_static("x-request-signature"),
        ]);

    Router::new()
        .merge(routes::system::public_router())
        .merge(authenticated_routes)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .layer(SetResponseHeaderLayer::overriding(
            axum::http::header::X_CONTENT_TYPE_OPTIONS,
            HeaderValue::from_static("nosniff"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            axum::http::header::X_FRAME_OPTIONS,
            HeaderValue::from_static("DENY"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            axum::http::header::CACHE_CONTROL,
            HeaderValue::from_static("no-store"),
        ))
        .with_state(state)
}

/// Wait for SIGINT or SIGTERM, then broadcast shutdown.
async fn shutdown_signal(shutdown_tx: watch::Sender<bool>) {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.ok();
    };

    #[cfg(unix)]
    let terminate = async {
        if let Ok(mut sig) = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            sig.recv().await;
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("shutdown signal received, stopping server");
    let _ = shutdown_tx.send(true);
}

/// Apply production hardening before logging is initialized.
#[allow(clippy::print_stderr)]
fn apply_hardening(config: &ServerConfig) {
    if let Err(e) = hardening::disable_core_dumps() {
        eprintln!("WARNING: failed to disable core dumps: {e}");
    }

    if config.disable_mlock {
        eprintln!("WARNING: mlock disabled via TOKEND_DISABLE_MLOCK — secrets may be swapped to disk");
    } else if let Err(e) = hardening::lock_memory() {
        eprintln!("WARNING: failed to lock memory: {e} (set TOKEND_DISABLE_MLOCK=true for dev)");
    }
}
