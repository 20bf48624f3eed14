//! Buffers per-request activity and flushes it to the embedded database.
//!
//! Every request that passes the auth gate gets one [`ActivityRecorder::record`]
//! call. Counters (`device_stats`) and the rolling recent-activity tail
//! (`device_activity_recent`) are buffered in memory and flushed together;
//! the append-only historical trail (`device_activity`) is written
//! synchronously on every request so it is never lost to a crash between
//! flushes.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::Response;
use tokio::sync::Mutex;
use tracing::instrument;

use crate::auth_gate::AuthIdentity;
use crate::config::ServerConfig;
use crate::state::AppState;
use tokend_core::db::Database;
use tokend_core::error::ActivityError;
use tokend_core::models::ActivityKind;
use tokend_core::repositories::{ActivityRepository, StatsRepository};

/// Endpoint prefixes whose events are always written to the historical
/// trail immediately, regardless of buffer state.
const SIGNIFICANT_PREFIXES: &[&str] = &["/auth/", "/network/", "/system/"];

#[derive(Default)]
struct DeviceAggregate {
    requests: i64,
    errors: i64,
    endpoints: HashSet<String>,
}

struct PendingEvent {
    device_id: String,
    endpoint: String,
    status_code: i32,
}

#[derive(Default)]
struct Buffers {
    per_device: HashMap<String, DeviceAggregate>,
    recent: Vec<PendingEvent>,
}

/// Accumulates request activity and periodically flushes it to SQLite.
pub struct ActivityRecorder {
    db: Arc<Database>,
    buffers: Mutex<Buffers>,
    buffer_size: usize,
}

impl ActivityRecorder {
    #[must_use]
    pub fn new(db: Arc<Database>, config: &ServerConfig) -> Self {
        Self {
            db,
            buffers: Mutex::new(Buffers::default()),
            buffer_size: config.activity_buffer_size,
        }
    }

    /// Records one request. Every call writes immediately to the
    /// historical trail — the durable audit log — and folds into the
    /// buffered per-device counters; only "significant" events (errors, or
    /// endpoints under `/auth/`, `/network/`, `/system/`) also join the
    /// buffered recent-activity tail, flushed once it reaches
    /// `buffer_size` or the periodic sweep runs.
    #[instrument(skip(self), fields(device_id, endpoint, status_code))]
    pub async fn record(&self, device_id: &str, endpoint: &str, status_code: u16) -> Result<(), ActivityError> {
        let status_code = i32::from(status_code);
        let is_error = status_code >= 400;
        let is_significant = is_error || SIGNIFICANT_PREFIXES.iter().any(|p| endpoint.starts_with(p));

        ActivityRepository::create(self.db.pool(), device_id, endpoint, status_code, ActivityKind::Historical)
            .await?;

        let should_flush = {
            let mut buffers = self.buffers.lock().await;
            let aggregate = buffers.per_device.entry(device_id.to_owned()).or_default();
            aggregate.requests += 1;
            if is_error {
                aggregate.errors += 1;
            }
            aggregate.endpoints.insert(endpoint.to_owned());
            if is_significant {
                buffers.recent.push(PendingEvent {
                    device_id: device_id.to_owned(),
                    endpoint: endpoint.to_owned(),
                    status_code,
                });
            }
            buffers.recent.len() >= self.buffer_size
        };

        if should_flush {
            self.flush().await?;
        }

        Ok(())
    }

    /// Writes buffered counters and recent events to the database, then
    /// clears the buffers. Safe to call on an empty buffer; called both
    /// from [`Self::record`] when the buffer fills and periodically by the
    /// retention worker.
    #[instrument(skip(self))]
    pub async fn flush(&self) -> Result<(), ActivityError> {
        let (per_device, recent) = {
            let mut buffers = self.buffers.lock().await;
            if buffers.recent.is_empty() && buffers.per_device.is_empty() {
                return Ok(());
            }
            (std::mem::take(&mut buffers.per_device), std::mem::take(&mut buffers.recent))
        };

        let mut tx = self.db.pool().begin().await.map_err(tokend_core::error::DatabaseError::from)?;

        for event in &recent {
            ActivityRepository::create(
                &mut *tx,
                &event.device_id,
                &event.endpoint,
                event.status_code,
                ActivityKind::Recent,
            )
            .await?;
        }

        for (device_id, aggregate) in &per_device {
            StatsRepository::update(
                &mut *tx,
                device_id,
                aggregate.requests,
                aggregate.errors,
                Some(&aggregate.endpoints),
            )
            .await?;
        }

        tx.commit().await.map_err(tokend_core::error::DatabaseError::from)?;
        tracing::debug!(devices = per_device.len(), events = recent.len(), "flushed activity buffers");
        Ok(())
    }
}

/// Axum middleware that records one [`ActivityRecorder::record`] call per
/// request after the handler runs. Mounted behind the `AuthGate`, so
/// `AuthIdentity` is always present by the time this runs; requests with no
/// resolved device id (loopback callers that didn't pass `device_id`) are
/// recorded under `"unknown"` rather than dropped.
pub async fn activity_middleware(State(state): State<Arc<AppState>>, req: Request, next: Next) -> Response {
    let path = req.uri().path().to_owned();
    let identity = req.extensions().get::<AuthIdentity>().cloned();

    let response = next.run(req).await;

    let device_id = identity.and_then(|i| i.device_id).unwrap_or_else(|| "unknown".to_owned());
    let status = response.status().as_u16();
    if let Err(err) = state.activity.record(&device_id, &path, status).await {
        tracing::warn!(error = %err, device_id, path, "failed to record activity");
    }

    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    async fn test_recorder() -> (ActivityRecorder, tempfile::TempDir) {
        let dir = tempdir().expect("tempdir");
        let db_path = dir.path().join("activity.db");
        let db = Database::connect(&db_path, 10).await.expect("connect");
        let config = ServerConfig::from_env();
        (ActivityRecorder::new(Arc::new(db), &config), dir)
    }

    #[tokio::test]
    async fn record_below_buffer_size_does_not_flush_immediately() {
        let (recorder, _dir) = test_recorder().await;
        recorder.record("device-a", "/system/health", 200).await.expect("record");
        let buffers = recorder.buffers.lock().await;
        assert_eq!(buffers.recent.len(), 1);
    }

    #[tokio::test]
    async fn explicit_flush_drains_buffers() {
        let (recorder, _dir) = test_recorder().await;
        recorder.record("device-a", "/network/status", 200).await.expect("record");
        recorder.flush().await.expect("flush");
        let buffers = recorder.buffers.lock().await;
        assert!(buffers.recent.is_empty());
        assert!(buffers.per_device.is_empty());
    }

    #[tokio::test]
    async fn every_request_is_written_to_historical_trail_immediately() {
        let (recorder, _dir) = test_recorder().await;
        recorder.record("device-a", "/some/endpoint", 200).await.expect("record");
        let rows = ActivityRepository::list(recorder.db.pool(), Some("device-a"), 10, ActivityKind::Historical)
            .await
            .expect("list");
        assert_eq!(rows.len(), 1);
    }

    #[tokio::test]
    async fn insignificant_event_does_not_join_recent_buffer() {
        let (recorder, _dir) = test_recorder().await;
        recorder.record("device-a", "/some/endpoint", 200).await.expect("record");
        let buffers = recorder.buffers.lock().await;
        assert!(buffers.recent.is_empty());
        assert_eq!(buffers.per_device.get("device-a").map(|a| a.requests), Some(1));
    }
}
