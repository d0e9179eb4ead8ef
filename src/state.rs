//! # Application State Management
//!
//! Shared state handed to every HTTP handler and every relay connection. Nothing here
//! is a process-wide global: `main` builds one [`AppState`] at startup and actix passes
//! a clone (cheap, everything is behind `Arc`) to each worker.
//!
//! ## Key Rust Concepts:
//!
//! ### Arc (Atomically Reference Counted)
//! - **Purpose**: Allows multiple parts of the program to safely share ownership of data
//! - **Why needed**: Many requests and connections run simultaneously and all need the same registry
//!
//! ### RwLock (Reader-Writer Lock)
//! - **Purpose**: Allows multiple readers OR one writer at a time
//! - **parking_lot**: Its locks never poison, so a panicking request cannot wedge the metrics
//!
//! ### Trait objects (`Arc<dyn FrameSink>`)
//! - **Purpose**: The sink is chosen at startup (HTTP downstream or echo fallback)
//! - **Testing**: Tests swap in deterministic fakes without touching handler code

use chrono::Utc;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::warn;

use crate::config::AppConfig;
use crate::ingest::IngestTracker;
use crate::relay::{CloseReason, CloseReport, EchoSink, FrameSink, HttpSink};
use crate::session::{id, SessionRegistry};

/// The main application state that's shared across all request handlers.
#[derive(Clone)]
pub struct AppState {
    /// Startup configuration (read-only)
    pub config: Arc<AppConfig>,

    /// Session registry shared by the HTTP surface, the relay and the reaper
    pub registry: Arc<SessionRegistry>,

    /// Downstream processing sink
    pub sink: Arc<dyn FrameSink>,

    /// Recent ingests, for correlation polling
    pub ingest: Arc<IngestTracker>,

    /// Counters updated by middleware, handlers and relay connections
    pub metrics: Arc<RwLock<AppMetrics>>,

    /// When the server started
    pub start_time: Instant,

    /// Highest unix time handed out by `/health`
    clock: Arc<AtomicI64>,
}

/// Gateway counters collected since startup.
///
/// ## Why these metrics matter:
/// - **request_count / error_count**: Overall HTTP load and reliability
/// - **relay_***: Streaming connections and how they ended
/// - **frames_***: Relay throughput
/// - **ingest_***: Ingest endpoint outcomes
/// - **endpoint_metrics**: Per-route statistics keyed by route pattern
#[derive(Debug, Default, Clone)]
pub struct AppMetrics {
    pub request_count: u64,
    pub error_count: u64,
    pub relay_opened: u64,
    pub relay_active: u64,
    pub relay_closed: HashMap<CloseReason, u64>,
    pub frames_in: u64,
    pub frames_out: u64,
    pub ingest_accepted: u64,
    pub ingest_rejected: u64,
    pub endpoint_metrics: HashMap<String, EndpointMetric>,
}

/// Detailed metrics for a specific route.
#[derive(Debug, Default, Clone)]
pub struct EndpointMetric {
    /// Number of requests to this route
    pub request_count: u64,

    /// Total time spent processing requests to this route (milliseconds)
    pub total_duration_ms: u64,

    /// Number of 4xx/5xx responses for this route
    pub error_count: u64,
}

impl AppState {
    /// Build the shared state from validated configuration.
    ///
    /// ## What this does:
    /// 1. Picks the session id strategy named in the config
    /// 2. Builds the sink: HTTP downstream when a url is set, echo fallback otherwise
    /// 3. Creates the registry, ingest tracker and empty metrics
    pub fn new(config: AppConfig) -> anyhow::Result<Self> {
        let ids = id::from_strategy(&config.sessions.id_strategy).ok_or_else(|| {
            anyhow::anyhow!("Unknown session id strategy '{}'", config.sessions.id_strategy)
        })?;

        let sink: Arc<dyn FrameSink> = match &config.downstream.url {
            Some(url) => Arc::new(HttpSink::new(
                url.clone(),
                Duration::from_millis(config.downstream.timeout_ms),
            )?),
            None if config.downstream.echo_fallback => {
                warn!("No downstream configured: relay is running in degraded echo fallback mode");
                Arc::new(EchoSink)
            }
            None => return Err(anyhow::anyhow!("No downstream url configured")),
        };

        let registry = Arc::new(SessionRegistry::new(ids, config.sessions.max_active));
        Ok(Self::with_parts(config, registry, sink))
    }

    /// Assemble state from already built collaborators.
    pub fn with_parts(config: AppConfig, registry: Arc<SessionRegistry>, sink: Arc<dyn FrameSink>) -> Self {
        let ingest = Arc::new(IngestTracker::new(config.ingest.max_tracked, config.ingest.max_in_flight));
        Self {
            config: Arc::new(config),
            registry,
            sink,
            ingest,
            metrics: Arc::new(RwLock::new(AppMetrics::default())),
            start_time: Instant::now(),
            clock: Arc::new(AtomicI64::new(0)),
        }
    }

    /// Current unix time, never lower than a value returned before.
    ///
    /// A wall clock stepped backwards (NTP correction) would otherwise make `/health`
    /// report time going backwards.
    pub fn monotonic_unix_time(&self) -> i64 {
        let now = Utc::now().timestamp();
        let previous = self.clock.fetch_max(now, Ordering::AcqRel);
        previous.max(now)
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Count one HTTP request against its route pattern.
    pub fn record_endpoint_request(&self, endpoint: &str, duration_ms: u64, is_error: bool) {
        let mut metrics = self.metrics.write();
        metrics.request_count += 1;
        if is_error {
            metrics.error_count += 1;
        }

        let endpoint_metric = metrics.endpoint_metrics.entry(endpoint.to_string()).or_default();
        endpoint_metric.request_count += 1;
        endpoint_metric.total_duration_ms += duration_ms;
        if is_error {
            endpoint_metric.error_count += 1;
        }
    }

    pub fn record_relay_opened(&self) {
        let mut metrics = self.metrics.write();
        metrics.relay_opened += 1;
        metrics.relay_active += 1;
    }

    /// Fold a finished connection into the counters.
    ///
    /// `was_streaming` is false for connections rejected during `Open`; those were never
    /// counted as active.
    pub fn record_relay_closed(&self, report: &CloseReport, was_streaming: bool) {
        let mut metrics = self.metrics.write();
        if was_streaming {
            metrics.relay_active = metrics.relay_active.saturating_sub(1);
        }
        *metrics.relay_closed.entry(report.reason).or_default() += 1;
        metrics.frames_in += report.frames_in;
        metrics.frames_out += report.frames_out;
    }

    pub fn record_ingest(&self, accepted: bool) {
        let mut metrics = self.metrics.write();
        if accepted {
            metrics.ingest_accepted += 1;
        } else {
            metrics.ingest_rejected += 1;
        }
    }

    /// Snapshot of the counters; the lock is released before the caller formats them.
    pub fn metrics_snapshot(&self) -> AppMetrics {
        self.metrics.read().clone()
    }

    /// State with the echo sink, for unit tests.
    #[cfg(test)]
    pub fn for_tests(config: AppConfig) -> Self {
        let registry = Arc::new(SessionRegistry::new(
            Box::new(crate::session::id::UuidIdGenerator),
            config.sessions.max_active,
        ));
        Self::with_parts(config, registry, Arc::new(EchoSink))
    }
}

impl EndpointMetric {
    /// Average response time in milliseconds.
    pub fn average_duration_ms(&self) -> f64 {
        if self.request_count > 0 {
            self.total_duration_ms as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_monotonic_unix_time_never_decreases() {
        let state = AppState::for_tests(AppConfig::default());
        // Pretend an earlier call saw a clock far in the future.
        state.clock.store(Utc::now().timestamp() + 3_600, Ordering::Release);
        let first = state.monotonic_unix_time();
        let second = state.monotonic_unix_time();
        assert!(second >= first);
        assert!(first >= Utc::now().timestamp() + 3_599);
    }

    #[test]
    fn test_endpoint_metrics() {
        let state = AppState::for_tests(AppConfig::default());
        state.record_endpoint_request("GET /health", 4, false);
        state.record_endpoint_request("GET /health", 6, true);

        let metrics = state.metrics_snapshot();
        assert_eq!(metrics.request_count, 2);
        assert_eq!(metrics.error_count, 1);
        let health = &metrics.endpoint_metrics["GET /health"];
        assert_eq!(health.average_duration_ms(), 5.0);
    }

    #[test]
    fn test_new_builds_echo_fallback_by_default() {
        let state = AppState::new(AppConfig::default()).unwrap();
        assert!(state.sink.is_fallback());
    }

    #[test]
    fn test_new_builds_http_sink_when_configured() {
        let mut config = AppConfig::default();
        config.downstream.url = Some("http://127.0.0.1:9/process".to_string());
        let state = AppState::new(config).unwrap();
        assert_eq!(state.sink.name(), "http");
        assert!(!state.sink.is_fallback());
    }
}
