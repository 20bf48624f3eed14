//! Background sweeper that purges expired tokens and trims rolling
//! activity on a configurable cadence.
//!
//! Both sweeps run on the same tick, driven by `config.activity_flush_interval_s`,
//! so a single worker task covers them; each failure is retried independently
//! with exponential backoff before being logged and deferred to the next tick.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::activity::ActivityRecorder;
use crate::config::ServerConfig;
use tokend_core::repositories::ActivityRepository;
use tokend_core::{Database, TokenManager};

const MAX_RETRIES: u32 = 3;

/// Runs the token-purge and activity-retention sweeps, on a tick driven by
/// `config.activity_flush_interval_s`, until told to shut down.
pub async fn retention_worker(
    token_manager: TokenManager,
    db: Arc<Database>,
    activity: Arc<ActivityRecorder>,
    config: ServerConfig,
    shutdown: &mut watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(Duration::from_secs(config.activity_flush_interval_s));
    let mut consecutive_failures: u32 = 0;
    info!("retention worker started");

    loop {
        tokio::select! {
            _ = interval.tick() => {
                if activity.flush().await.is_err() {
                    warn!("periodic activity flush failed");
                }

                match retry_sweep(&token_manager, &db, config.recent_activity_retention_days, shutdown).await {
                    Ok(None) => {
                        info!("retention worker shutting down");
                        return;
                    }
                    Ok(Some((purged_tokens, purged_activity))) => {
                        consecutive_failures = 0;
                        info!(purged_tokens, purged_activity, "retention sweep complete");
                    }
                    Err(last_err) => {
                        consecutive_failures = consecutive_failures.saturating_add(1);
                        if consecutive_failures >= 5 {
                            tracing::error!(
                                error = %last_err,
                                consecutive_failures,
                                "retention sweep persistently failing — database may be unreachable"
                            );
                        } else {
                            warn!(
                                error = %last_err,
                                consecutive_failures,
                                retries = MAX_RETRIES,
                                "retention sweep failed after retries, will retry next tick"
                            );
                        }
                    }
                }
            }
            _ = shutdown.changed() => {
                info!("retention worker shutting down");
                return;
            }
        }
    }
}

async fn retry_sweep(
    token_manager: &TokenManager,
    db: &Arc<Database>,
    retention_days: i64,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<Option<(u64, u64)>, String> {
    let mut last_err = String::new();

    for attempt in 0..=MAX_RETRIES {
        let outcome = async {
            let purged_tokens = token_manager.purge_expired_tokens().await.map_err(|e| e.to_string())?;
            let cutoff = Utc::now() - chrono::Duration::days(retention_days);
            let purged_activity = ActivityRepository::purge_older_than(db.pool(), cutoff)
                .await
                .map_err(|e| e.to_string())?;
            Ok::<(u64, u64), String>((purged_tokens, purged_activity))
        }
        .await;

        match outcome {
            Ok(counts) => return Ok(Some(counts)),
            Err(e) => {
                last_err = e;
                if attempt == MAX_RETRIES {
                    break;
                }

                let backoff = Duration::from_secs(1u64 << attempt);
                tracing::debug!(
                    attempt = attempt.saturating_add(1),
                    max = MAX_RETRIES.saturating_add(1),
                    backoff_ms = backoff.as_millis() as u64,
                    error = %last_err,
                    "retention sweep failed, retrying"
                );

                tokio::select! {
                    () = tokio::time::sleep(backoff) => {}
                    _ = shutdown.changed() => {
                        return Ok(None);
                    }
                }
            }
        }
    }

    Err(last_err)
}
