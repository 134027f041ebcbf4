//! # Application State Management
//!
//! Shared state handed to every HTTP handler and every WebSocket connection
//! through `web::Data<AppState>`.
//!
//! ## What lives here:
//! - **config**: the live [`AppConfig`], replaceable at runtime via `PUT /api/v1/config`
//! - **metrics**: HTTP request counters plus media session counters
//! - **registry**: the process-wide [`SessionRegistry`]
//! - **bridge**: the codec bridge every session encodes and decodes through
//! - **session_runtime**: where per-connection dispatchers run
//!
//! ## The Arc<RwLock<T>> Pattern:
//! `AppState` is cloned once per worker thread by actix-web. Every field is
//! either immutable (`start_time`) or wrapped in `Arc` so that all clones
//! observe the same data. `std::sync::RwLock` is enough here because no
//! lock in this module is ever held across an `.await`.
//!
//! ## Poisoning:
//! A panicking writer poisons a `std::sync` lock. Metrics and config are
//! plain data that cannot be left half-written by any of the methods below,
//! so a poisoned lock is recovered with `PoisonError::into_inner` instead of
//! taking the whole server down.

use crate::codec::CodecBridge;
use crate::config::AppConfig;
use crate::session::{SessionRegistry, TeardownReport};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Instant;
use tokio::runtime::Handle;

/// State shared by all handlers and connections.
///
/// ## Cloning:
/// Cloning is cheap: it bumps the reference counts of the `Arc` fields.
/// The clone shares the same config, metrics, registry and bridge.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration (can be updated at runtime)
    pub config: Arc<RwLock<AppConfig>>,

    /// Request and media counters
    pub metrics: Arc<RwLock<AppMetrics>>,

    /// All live media sessions
    pub registry: Arc<SessionRegistry>,

    /// External encoder/decoder used by every session
    pub bridge: Arc<dyn CodecBridge>,

    /// When the server started
    pub start_time: Instant,

    /// Runtime that was current when the state was built. In the server that
    /// is the main runtime, which outlives every HTTP worker.
    session_runtime: Option<Handle>,
}

/// Counters collected since server start.
///
/// ## HTTP counters:
/// Maintained by [`crate::middleware::MetricsMiddleware`] for every request.
///
/// ## Media counters:
/// Maintained by the connection dispatcher as sessions open, stream,
/// and close. The number of *active* sessions is not stored here; it is
/// read from the registry when a snapshot is taken so it can never drift.
#[derive(Debug, Default, Clone)]
pub struct AppMetrics {
    /// Total number of HTTP requests processed since server start
    pub request_count: u64,

    /// Total number of HTTP requests that ended in a 4xx/5xx
    pub error_count: u64,

    /// Sessions currently registered (filled in by the snapshot)
    pub active_sessions: usize,

    /// Sessions ever opened
    pub sessions_opened: u64,

    /// Sessions that completed teardown
    pub sessions_finalized: u64,

    /// Upgrades refused because the session limit was reached
    pub sessions_rejected: u64,

    /// `.wav` files produced
    pub audio_artifacts: u64,

    /// Video containers produced
    pub video_artifacts: u64,

    /// Recorder finalize steps that failed
    pub finalize_failures: u64,

    /// Playback pipelines started
    pub playback_started: u64,

    /// Inbound messages dropped as malformed, unknown, or late
    pub rejected_messages: u64,

    /// Per-endpoint statistics, keyed by "METHOD /path"
    pub endpoint_metrics: HashMap<String, EndpointMetric>,
}

/// Statistics for one HTTP endpoint.
#[derive(Debug, Default, Clone)]
pub struct EndpointMetric {
    /// Number of requests to this specific endpoint
    pub request_count: u64,

    /// Total time spent processing all requests to this endpoint (milliseconds)
    pub total_duration_ms: u64,

    /// Number of errors that occurred for this endpoint
    pub error_count: u64,
}

impl AppState {
    /// Create the shared state.
    ///
    /// The registry's session limit is seeded from
    /// `performance.max_concurrent_sessions` and follows later config updates.
    pub fn new(config: AppConfig, bridge: Arc<dyn CodecBridge>) -> Self {
        let registry = Arc::new(SessionRegistry::new(
            config.performance.max_concurrent_sessions,
        ));
        Self {
            config: Arc::new(RwLock::new(config)),
            metrics: Arc::new(RwLock::new(AppMetrics::default())),
            registry,
            bridge,
            start_time: Instant::now(),
            session_runtime: Handle::try_current().ok(),
        }
    }

    /// Spawn a task that must finish even while the HTTP workers shut down.
    ///
    /// Worker runtimes are dropped on graceful stop, cancelling whatever was
    /// spawned on them. A dispatcher cancelled mid-teardown would leave its
    /// session stuck in FINALIZING, so session work goes to the runtime
    /// captured in [`AppState::new`] instead.
    pub fn spawn_session_task<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        match &self.session_runtime {
            Some(handle) => {
                handle.spawn(task);
            }
            None => {
                tokio::spawn(task);
            }
        }
    }

    /// Get a copy of the current configuration.
    ///
    /// The clone releases the read lock immediately; callers that need a
    /// consistent view for a whole operation (like creating a session)
    /// work from this copy.
    pub fn get_config(&self) -> AppConfig {
        self.config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replace the configuration after validating it.
    ///
    /// ## Effect on sessions:
    /// Sessions capture their settings when created, so only sessions opened
    /// after the update see the new values. The session limit is pushed into
    /// the registry right away.
    pub fn update_config(&self, new_config: AppConfig) -> Result<(), String> {
        match new_config.validate() {
            Ok(_) => {
                self.registry
                    .set_max_sessions(new_config.performance.max_concurrent_sessions);
                *self
                    .config
                    .write()
                    .unwrap_or_else(PoisonError::into_inner) = new_config;
                Ok(())
            }
            Err(e) => Err(e.to_string()),
        }
    }

    fn metrics_read(&self) -> RwLockReadGuard<'_, AppMetrics> {
        self.metrics.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn metrics_write(&self) -> RwLockWriteGuard<'_, AppMetrics> {
        self.metrics.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Increment the total request counter (called by middleware for every request).
    pub fn increment_request_count(&self) {
        self.metrics_write().request_count += 1;
    }

    /// Increment the total error counter (called when a request fails).
    pub fn increment_error_count(&self) {
        self.metrics_write().error_count += 1;
    }

    /// Record duration and outcome of one request to `endpoint`.
    ///
    /// ## Parameters:
    /// - **endpoint**: "METHOD /path", e.g. "GET /recordings"
    /// - **duration_ms**: how long the request took
    /// - **is_error**: whether the response was a 4xx/5xx
    pub fn record_endpoint_request(&self, endpoint: &str, duration_ms: u64, is_error: bool) {
        let mut metrics = self.metrics_write();
        let endpoint_metric = metrics
            .endpoint_metrics
            .entry(endpoint.to_string())
            .or_default();

        endpoint_metric.request_count += 1;
        endpoint_metric.total_duration_ms += duration_ms;
        if is_error {
            endpoint_metric.error_count += 1;
        }
    }

    pub fn record_session_opened(&self) {
        self.metrics_write().sessions_opened += 1;
    }

    pub fn record_session_rejected(&self) {
        self.metrics_write().sessions_rejected += 1;
    }

    /// Fold the result of one completed teardown into the counters.
    pub fn record_teardown(&self, report: &TeardownReport) {
        let mut metrics = self.metrics_write();
        metrics.sessions_finalized += 1;
        if report.audio.is_some() {
            metrics.audio_artifacts += 1;
        }
        if report.video.is_some() {
            metrics.video_artifacts += 1;
        }
        metrics.finalize_failures += report.failures.len() as u64;
    }

    pub fn record_playback_started(&self) {
        self.metrics_write().playback_started += 1;
    }

    pub fn record_rejected_message(&self) {
        self.metrics_write().rejected_messages += 1;
    }

    /// Get a snapshot of current metrics (used for the /metrics endpoint).
    ///
    /// The snapshot is a clone taken under the read lock, so serializing it
    /// never blocks writers. `active_sessions` is read from the registry.
    pub fn get_metrics_snapshot(&self) -> AppMetrics {
        let mut snapshot = self.metrics_read().clone();
        snapshot.active_sessions = self.registry.len();
        snapshot
    }

    /// Get server uptime in seconds.
    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

impl EndpointMetric {
    /// Average response time in milliseconds, `0.0` before the first request.
    pub fn average_duration_ms(&self) -> f64 {
        if self.request_count > 0 {
            self.total_duration_ms as f64 / self.request_count as f64
        } else {
            0.0
        }
    }

    /// Fraction of requests that failed, from `0.0` to `1.0`.
    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}
