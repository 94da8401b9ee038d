//! # Application State
//!
//! The single context object every connection and HTTP handler receives.
//! Nothing in the relay lives in a module-level global: configuration,
//! metrics, the session store and the dispatcher are created once in `main`
//! and handed out through `web::Data<AppState>`.
//!
//! ## Sharing Pattern:
//! - **Arc<RwLock<AppConfig>>**: many readers (every frame reads the dispatch
//!   thresholds), one occasional writer (`PUT /api/v1/config`)
//! - **Arc<RwLock<AppMetrics>>**: counters bumped by middleware, sockets and jobs
//! - **Arc<SessionStore> / Arc<Dispatcher>**: internally synchronized

use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Instant;

use crate::audio::session::SessionStore;
use crate::backend::BackendBridge;
use crate::config::AppConfig;
use crate::dispatch::dispatcher::Dispatcher;
use crate::error::{AppError, AppResult};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<RwLock<AppConfig>>,
    pub metrics: Arc<RwLock<AppMetrics>>,
    pub sessions: Arc<SessionStore>,
    pub dispatcher: Arc<Dispatcher>,
    pub backend_name: &'static str,
    pub start_time: Instant,
}

/// Counters collected across HTTP requests, sockets and pipeline jobs.
#[derive(Debug, Default, Clone, Serialize)]
pub struct AppMetrics {
    /// Total HTTP requests processed since start
    pub request_count: u64,
    pub error_count: u64,
    pub relay: RelayCounters,
    pub endpoint_metrics: HashMap<String, EndpointMetric>,
}

/// Audio relay counters.
#[derive(Debug, Default, Clone, Serialize)]
pub struct RelayCounters {
    pub frames_accepted: u64,
    pub frames_rejected: u64,
    pub dispatches_total: u64,
    pub idle_flushes: u64,
    pub jobs_completed: u64,
    pub jobs_failed: u64,
    pub jobs_timed_out: u64,
}

/// Per-endpoint request statistics.
#[derive(Debug, Default, Clone, Serialize)]
pub struct EndpointMetric {
    pub request_count: u64,
    pub total_duration_ms: u64,
    pub error_count: u64,
}

/// Write access to the metrics, recovering from a poisoned lock.
pub fn metrics_mut(metrics: &RwLock<AppMetrics>) -> RwLockWriteGuard<'_, AppMetrics> {
    metrics.write().unwrap_or_else(|p| p.into_inner())
}

pub fn config_read(config: &RwLock<AppConfig>) -> RwLockReadGuard<'_, AppConfig> {
    config.read().unwrap_or_else(|p| p.into_inner())
}

impl AppState {
    /// Build the relay around a backend. Must be called inside the tokio runtime
    /// that will run the pipeline jobs.
    pub fn new(config: AppConfig, backend: Arc<dyn BackendBridge>) -> Self {
        Self::with_shared_config(Arc::new(RwLock::new(config)), backend)
    }

    /// Same as [`AppState::new`], for a config the backend also reads.
    pub fn with_shared_config(config: Arc<RwLock<AppConfig>>, backend: Arc<dyn BackendBridge>) -> Self {
        let sessions = {
            let config = config_read(&config);
            Arc::new(SessionStore::new(
                config.performance.max_concurrent_sessions,
                config.dispatch.max_buffer_bytes,
            ))
        };
        let backend_name = backend.name();
        let metrics = Arc::new(RwLock::new(AppMetrics::default()));
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&sessions),
            backend,
            Arc::clone(&config),
            Arc::clone(&metrics),
            tokio::runtime::Handle::current(),
        ));

        Self {
            config,
            metrics,
            sessions,
            dispatcher,
            backend_name,
            start_time: Instant::now(),
        }
    }

    /// Copy of the current configuration; the lock is released immediately.
    pub fn get_config(&self) -> AppConfig {
        config_read(&self.config).clone()
    }

    /// Apply a partial JSON update (validated before it replaces anything).
    pub fn update_config(&self, updates: &str) -> AppResult<AppConfig> {
        let mut config = self.config.write().unwrap_or_else(|p| p.into_inner());
        config
            .update_from_json(updates)
            .map_err(|e| AppError::ValidationError(e.to_string()))?;
        Ok(config.clone())
    }

    pub fn increment_request_count(&self) {
        metrics_mut(&self.metrics).request_count += 1;
    }

    pub fn increment_error_count(&self) {
        metrics_mut(&self.metrics).error_count += 1;
    }

    pub fn record_endpoint_request(&self, endpoint: &str, duration_ms: u64, is_error: bool) {
        let mut metrics = metrics_mut(&self.metrics);
        let endpoint_metric = metrics.endpoint_metrics.entry(endpoint.to_string()).or_default();
        endpoint_metric.request_count += 1;
        endpoint_metric.total_duration_ms += duration_ms;
        if is_error {
            endpoint_metric.error_count += 1;
        }
    }

    pub fn record_rejected_frame(&self) {
        metrics_mut(&self.metrics).relay.frames_rejected += 1;
    }

    pub fn get_metrics_snapshot(&self) -> AppMetrics {
        self.metrics.read().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

impl EndpointMetric {
    pub fn average_duration_ms(&self) -> f64 {
        if self.request_count > 0 {
            self.total_duration_ms as f64 / self.request_count as f64
        } else {
            0.0
        }
    }

    /// Error rate in 0.0..=1.0.
    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::tests::ScriptedBackend;

    #[tokio::test]
    async fn test_endpoint_metrics() {
        let state = AppState::new(AppConfig::default(), Arc::new(Arc::new(ScriptedBackend::completing())));
        state.record_endpoint_request("GET /health", 10, false);
        state.record_endpoint_request("GET /health", 30, true);

        let snapshot = state.get_metrics_snapshot();
        let metric = &snapshot.endpoint_metrics["GET /health"];
        assert_eq!(metric.request_count, 2);
        assert!((metric.average_duration_ms() - 20.0).abs() < f64::EPSILON);
        assert!((metric.error_rate() - 0.5).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_invalid_config_update_is_rejected() {
        let state = AppState::new(AppConfig::default(), Arc::new(Arc::new(ScriptedBackend::completing())));
        let result = state.update_config(r#"{"dispatch": {"min_buffer_bytes": 0}}"#);
        assert!(matches!(result, Err(AppError::ValidationError(_))));
        assert_eq!(state.get_config().dispatch.min_buffer_bytes, 32_768);
    }

    #[tokio::test]
    async fn test_config_updates_reach_shared_readers() {
        let shared = Arc::new(RwLock::new(AppConfig::default()));
        let state = AppState::with_shared_config(
            Arc::clone(&shared),
            Arc::new(Arc::new(ScriptedBackend::completing())),
        );

        state
            .update_config(r#"{"synthesis": {"deadline_ms": 5000}}"#)
            .unwrap();

        assert_eq!(config_read(&shared).synthesis.deadline_ms, 5_000);
    }
}
