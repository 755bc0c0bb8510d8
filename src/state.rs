//! # Application State Management
//!
//! Shared state handed to every HTTP handler and every websocket session.
//!
//! ## What lives here:
//! - **config**: Immutable after startup, so a plain `Arc` is enough
//! - **gate**: The engine gate, the only path to the recognition engine
//! - **metrics**: Counters updated by sessions and read by the metrics endpoint
//!
//! ## Arc<RwLock<T>> Pattern
//! Metrics are written by many sessions and read by health checks. A reader-writer
//! lock keeps reads cheap; every critical section is a handful of integer updates.

use crate::config::AppConfig;
use crate::session::gate::EngineGate;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

/// State shared across handlers and sessions. Cloning is cheap: every field is an `Arc` or `Copy`.
#[derive(Debug, Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub gate: Arc<EngineGate>,
    metrics: Arc<RwLock<AppMetrics>>,
    pub start_time: Instant,
}

/// Connection and utterance counters since server start.
#[derive(Debug, Default, Clone)]
pub struct AppMetrics {
    /// Websocket connections accepted
    pub connections_total: u64,

    /// Connections currently running a session
    pub active_sessions: u32,

    /// Utterances that produced a transcript
    pub utterances_completed: u64,

    /// Utterances discarded because the connection went away
    pub utterances_aborted: u64,

    /// Utterances lost to an engine failure
    pub utterances_failed: u64,

    /// Connections closed for breaking the protocol
    pub protocol_violations: u64,

    /// Replies that could not be delivered
    pub transport_failures: u64,

    /// Sum of end-to-end utterance durations (open to transcript), milliseconds
    pub total_utterance_ms: u64,

    /// Sum of time spent in `finish` after the end-of-stream sentinel, milliseconds
    pub total_finalize_ms: u64,
}

impl AppMetrics {
    /// Average time from end-of-stream to transcript.
    pub fn average_finalize_ms(&self) -> f64 {
        if self.utterances_completed > 0 {
            self.total_finalize_ms as f64 / self.utterances_completed as f64
        } else {
            0.0
        }
    }

    /// Average utterance length, from first audio chunk to transcript.
    pub fn average_utterance_ms(&self) -> f64 {
        if self.utterances_completed > 0 {
            self.total_utterance_ms as f64 / self.utterances_completed as f64
        } else {
            0.0
        }
    }
}

impl AppState {
    pub fn new(config: AppConfig, gate: Arc<EngineGate>) -> Self {
        Self {
            config: Arc::new(config),
            gate,
            metrics: Arc::new(RwLock::new(AppMetrics::default())),
            start_time: Instant::now(),
        }
    }

    pub fn get_config(&self) -> &AppConfig {
        &self.config
    }

    pub fn session_opened(&self) {
        let mut metrics = self.write_metrics();
        metrics.connections_total += 1;
        metrics.active_sessions += 1;
    }

    /// Underflow-safe: never drops below zero.
    pub fn session_closed(&self) {
        let mut metrics = self.write_metrics();
        metrics.active_sessions = metrics.active_sessions.saturating_sub(1);
    }

    pub fn record_utterance_completed(&self, total: Duration, finalize: Duration) {
        let mut metrics = self.write_metrics();
        metrics.utterances_completed += 1;
        metrics.total_utterance_ms += total.as_millis() as u64;
        metrics.total_finalize_ms += finalize.as_millis() as u64;
    }

    pub fn record_utterance_aborted(&self) {
        self.write_metrics().utterances_aborted += 1;
    }

    pub fn record_utterance_failed(&self) {
        self.write_metrics().utterances_failed += 1;
    }

    pub fn record_protocol_violation(&self) {
        self.write_metrics().protocol_violations += 1;
    }

    pub fn record_transport_failure(&self) {
        self.write_metrics().transport_failures += 1;
    }

    /// Copy of the counters, so no lock is held while a response is serialized.
    pub fn get_metrics_snapshot(&self) -> AppMetrics {
        self.read_metrics().clone()
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    // A panic while holding the lock cannot leave counters half-updated in a way
    // that matters, so a poisoned lock is simply recovered.
    fn read_metrics(&self) -> RwLockReadGuard<'_, AppMetrics> {
        self.metrics.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_metrics(&self) -> RwLockWriteGuard<'_, AppMetrics> {
        self.metrics.write().unwrap_or_else(PoisonError::into_inner)
    }
}
