//! # Application State Management
//!
//! Shared state handed to every HTTP handler and consultation socket.
//!
//! ## Arc<RwLock<T>> Pattern
//! - **Arc**: every worker thread holds a reference to the same data
//! - **RwLock**: many readers or one writer at a time
//!
//! Config and metrics are mutable at runtime and live behind `Arc<RwLock<_>>`.
//! The record store and the live connector are immutable after startup and
//! are shared through plain `Arc`s.
//!
//! A poisoned lock is recovered rather than propagated: every writer here
//! leaves the data consistent before it could panic.

use crate::config::AppConfig;
use crate::consultation::SessionStats;
use crate::live::LiveConnector;
use crate::records::InMemoryRecords;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Instant;

#[derive(Clone)]
pub struct AppState {
    /// Application configuration (can be updated at runtime)
    pub config: Arc<RwLock<AppConfig>>,

    /// Request and consultation counters
    pub metrics: Arc<RwLock<AppMetrics>>,

    /// Users, pets and doctors the assistant can look up
    pub records: InMemoryRecords,

    /// Opens connections to the live speech endpoint
    pub connector: Arc<dyn LiveConnector>,

    pub start_time: Instant,
}

#[derive(Debug, Default, Clone)]
pub struct AppMetrics {
    /// Total number of HTTP requests processed since server start
    pub request_count: u64,

    /// Total number of 4xx/5xx responses since server start
    pub error_count: u64,

    /// Consultations currently holding a session slot
    pub active_sessions: usize,

    /// Key: endpoint pattern (e.g., "GET /api/v1/health")
    pub endpoint_metrics: HashMap<String, EndpointMetric>,

    pub consultations: ConsultationMetrics,
}

#[derive(Debug, Default, Clone)]
pub struct EndpointMetric {
    pub request_count: u64,
    pub total_duration_ms: u64,
    pub error_count: u64,
}

/// Totals across all finished and running consultations.
#[derive(Debug, Default, Clone, Serialize)]
pub struct ConsultationMetrics {
    pub started: u64,
    pub completed: u64,
    pub failed: u64,
    pub rejected_at_capacity: u64,
    pub frames_sent: u64,
    pub frames_muted: u64,
    pub audio_chunks_played: u64,
    pub audio_chunks_dropped: u64,
    pub tool_calls: u64,
    pub tool_failures: u64,
    pub audio_underruns: u64,
}

/// How a consultation ended, as seen by the socket that owned it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    Completed,
    Failed,
    Abandoned,
}

impl AppState {
    pub fn new(
        config: AppConfig,
        records: InMemoryRecords,
        connector: Arc<dyn LiveConnector>,
    ) -> Self {
        Self {
            config: Arc::new(RwLock::new(config)),
            metrics: Arc::new(RwLock::new(AppMetrics::default())),
            records,
            connector,
            start_time: Instant::now(),
        }
    }

    /// Get a copy of the current configuration.
    ///
    /// Cloning releases the lock immediately so readers never block writers
    /// for longer than a copy.
    pub fn get_config(&self) -> AppConfig {
        self.config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replace the configuration after validating it.
    pub fn update_config(&self, new_config: AppConfig) -> Result<(), String> {
        match new_config.validate() {
            Ok(_) => {
                *self.config.write().unwrap_or_else(PoisonError::into_inner) = new_config;
                Ok(())
            }
            Err(e) => Err(e.to_string()),
        }
    }

    fn with_metrics<R>(&self, f: impl FnOnce(&mut AppMetrics) -> R) -> R {
        let mut metrics = self.metrics.write().unwrap_or_else(PoisonError::into_inner);
        f(&mut metrics)
    }

    pub fn increment_request_count(&self) {
        self.with_metrics(|m| m.request_count += 1);
    }

    pub fn increment_error_count(&self) {
        self.with_metrics(|m| m.error_count += 1);
    }

    pub fn record_endpoint_request(&self, endpoint: &str, duration_ms: u64, is_error: bool) {
        self.with_metrics(|m| {
            let endpoint_metric = m.endpoint_metrics.entry(endpoint.to_string()).or_default();
            endpoint_metric.request_count += 1;
            endpoint_metric.total_duration_ms += duration_ms;
            if is_error {
                endpoint_metric.error_count += 1;
            }
        });
    }

    /// Reserve one of `max_concurrent_sessions` slots. The check and the
    /// increment happen under one write lock.
    pub fn try_acquire_session_slot(&self) -> bool {
        let limit = self.get_config().performance.max_concurrent_sessions;
        self.with_metrics(|m| {
            if m.active_sessions >= limit {
                m.consultations.rejected_at_capacity += 1;
                false
            } else {
                m.active_sessions += 1;
                m.consultations.started += 1;
                true
            }
        })
    }

    pub fn release_session_slot(&self) {
        self.with_metrics(|m| {
            if m.active_sessions > 0 {
                m.active_sessions -= 1;
            }
        });
    }

    /// Fold one finished session's counters into the totals.
    pub fn record_session_end(&self, stats: &SessionStats, outcome: SessionOutcome) {
        self.with_metrics(|m| {
            let c = &mut m.consultations;
            match outcome {
                SessionOutcome::Completed => c.completed += 1,
                SessionOutcome::Failed => c.failed += 1,
                SessionOutcome::Abandoned => {}
            }
            c.frames_sent += stats.frames_sent;
            c.frames_muted += stats.frames_muted;
            c.audio_chunks_played += stats.audio_chunks_played;
            c.audio_chunks_dropped += stats.audio_chunks_dropped;
            c.tool_calls += stats.tool_calls;
            c.tool_failures += stats.tool_failures;
            c.audio_underruns += stats.audio_underruns;
        });
    }

    pub fn get_metrics_snapshot(&self) -> AppMetrics {
        self.metrics
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
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

    /// Fraction of requests that failed, 0.0 to 1.0.
    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}
