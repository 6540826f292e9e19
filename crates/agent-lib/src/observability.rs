//! Observability infrastructure for the batch agent
//!
//! Provides:
//! - Prometheus metrics (cycle statistics, session lifecycle, write failures, sink drops)
//! - Structured JSON logging with tracing

use crate::error::SessionError;
use crate::models::{CycleRecord, WindowMean};
use crate::session::SessionState;
use chrono::{DateTime, Utc};
use prometheus::{
    register_gauge, register_gauge_vec, register_histogram, register_int_counter,
    register_int_counter_vec, register_int_gauge, Gauge, GaugeVec, Histogram, IntCounter,
    IntCounterVec, IntGauge,
};
use std::sync::OnceLock;
use std::time::Duration;
use tracing::{error, info, warn};

/// Histogram buckets for batch durations (in seconds)
const DURATION_BUCKETS: &[f64] = &[
    0.5, 1.0, 2.0, 5.0, 10.0, 20.0, 30.0, 60.0, 120.0, 300.0, 600.0,
];

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<AgentMetricsInner> = OnceLock::new();

/// Inner metrics structure that holds the actual Prometheus metrics
struct AgentMetricsInner {
    cycles_completed: IntCounter,
    invalid_cycles: IntCounter,
    predicted_rate: Gauge,
    window_mean: GaugeVec,
    batch_duration_seconds: Histogram,
    session_connected: IntGauge,
    session_generation: IntGauge,
    session_attempts: IntCounter,
    liveness_failures: IntCounter,
    write_failures: IntCounterVec,
    sink_drops: IntCounter,
}

impl AgentMetricsInner {
    fn new() -> Self {
        Self {
            cycles_completed: register_int_counter!(
                "batch_agent_cycles_completed_total",
                "Total number of completed batch cycles"
            )
            .expect("Failed to register cycles_completed"),

            invalid_cycles: register_int_counter!(
                "batch_agent_invalid_cycles_total",
                "Completed cycles whose predicted rate could not be computed"
            )
            .expect("Failed to register invalid_cycles"),

            predicted_rate: register_gauge!(
                "batch_agent_predicted_rate",
                "Predicted flow rate of the most recent valid cycle"
            )
            .expect("Failed to register predicted_rate"),

            window_mean: register_gauge_vec!(
                "batch_agent_window_mean_rate",
                "Mean predicted flow rate over the most recent valid cycles",
                &["window"]
            )
            .expect("Failed to register window_mean"),

            batch_duration_seconds: register_histogram!(
                "batch_agent_batch_duration_seconds",
                "Duration of completed batches",
                DURATION_BUCKETS.to_vec()
            )
            .expect("Failed to register batch_duration_seconds"),

            session_connected: register_int_gauge!(
                "batch_agent_session_connected",
                "Whether the endpoint session is currently connected"
            )
            .expect("Failed to register session_connected"),

            session_generation: register_int_gauge!(
                "batch_agent_session_generation",
                "Number of the current session attempt"
            )
            .expect("Failed to register session_generation"),

            session_attempts: register_int_counter!(
                "batch_agent_session_attempts_total",
                "Total number of connection attempts"
            )
            .expect("Failed to register session_attempts"),

            liveness_failures: register_int_counter!(
                "batch_agent_liveness_failures_total",
                "Total number of failed liveness checks"
            )
            .expect("Failed to register liveness_failures"),

            write_failures: register_int_counter_vec!(
                "batch_agent_write_failures_total",
                "Total number of failed writes by component",
                &["component"]
            )
            .expect("Failed to register write_failures"),

            sink_drops: register_int_counter!(
                "batch_agent_sink_dropped_rows_total",
                "Rows dropped because the record sink queue was full"
            )
            .expect("Failed to register sink_drops"),
        }
    }
}

/// Agent metrics for Prometheus exposition
///
/// This is a lightweight handle to the global metrics instance.
/// Multiple clones share the same underlying metrics.
#[derive(Clone)]
pub struct AgentMetrics {
    _private: (),
}

impl Default for AgentMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl AgentMetrics {
    /// Create a new metrics handle (initializes global metrics if needed)
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(AgentMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &AgentMetricsInner {
        GLOBAL_METRICS.get_or_init(AgentMetricsInner::new)
    }

    /// Record a finalized cycle
    pub fn record_cycle(&self, record: &CycleRecord) {
        let inner = self.inner();
        inner.cycles_completed.inc();
        match record.predicted_rate {
            Some(rate) => {
                inner.predicted_rate.set(rate);
                inner.batch_duration_seconds.observe(record.duration_secs);
            }
            None => inner.invalid_cycles.inc(),
        }
    }

    /// Publish the current window means; empty windows are reported as NaN
    pub fn set_window_means(&self, windows: &[WindowMean]) {
        for window in windows {
            self.inner()
                .window_mean
                .with_label_values(&[&window.size.to_string()])
                .set(window.mean.unwrap_or(f64::NAN));
        }
    }

    pub fn set_session_connected(&self, connected: bool) {
        self.inner().session_connected.set(i64::from(connected));
    }

    pub fn set_session_generation(&self, generation: u64) {
        self.inner().session_generation.set(generation as i64);
    }

    pub fn inc_session_attempts(&self) {
        self.inner().session_attempts.inc();
    }

    pub fn inc_liveness_failures(&self) {
        self.inner().liveness_failures.inc();
    }

    /// Increment write failures for a component ("mirror", "dosing", ...)
    pub fn inc_write_failures(&self, component: &str) {
        self.inner()
            .write_failures
            .with_label_values(&[component])
            .inc();
    }

    pub fn inc_sink_drops(&self) {
        self.inner().sink_drops.inc();
    }

    /// Total completed cycles since process start
    pub fn cycles_completed(&self) -> u64 {
        self.inner().cycles_completed.get()
    }
}

/// Render window means as `k2=33.00 k4=-` for log lines
fn format_windows(windows: &[WindowMean]) -> String {
    windows
        .iter()
        .map(|w| match w.mean {
            Some(mean) => format!("k{}={:.2}", w.size, mean),
            None => format!("k{}=-", w.size),
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Structured logger for agent events
///
/// Provides consistent JSON-formatted logging for connection changes,
/// completed cycles and failures.
#[derive(Clone)]
pub struct StructuredLogger {
    station: String,
}

impl StructuredLogger {
    pub fn new(station: impl Into<String>) -> Self {
        Self {
            station: station.into(),
        }
    }

    pub fn station(&self) -> &str {
        &self.station
    }

    /// Log agent startup
    pub fn log_startup(&self, version: &str, endpoint: &str) {
        info!(
            event = "agent_started",
            station = %self.station,
            agent_version = %version,
            endpoint = %endpoint,
            "Batch agent started"
        );
    }

    /// Log agent shutdown
    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "agent_shutdown",
            station = %self.station,
            reason = %reason,
            "Batch agent shutting down"
        );
    }

    /// Log a session state change
    pub fn log_connection_state(&self, generation: u64, endpoint: &str, state: SessionState) {
        match state {
            SessionState::Failed => warn!(
                event = "connection_state",
                station = %self.station,
                generation = generation,
                endpoint = %endpoint,
                state = %state,
                "Session failed"
            ),
            _ => info!(
                event = "connection_state",
                station = %self.station,
                generation = generation,
                endpoint = %endpoint,
                state = %state,
                "Session {}", state
            ),
        }
    }

    /// Log a machine start or stop edge
    pub fn log_machine_state(&self, active: bool, at: DateTime<Utc>) {
        info!(
            event = "machine_state",
            station = %self.station,
            active = active,
            at = %at.to_rfc3339(),
            "{}",
            if active { "Machine active" } else { "Machine idle" }
        );
    }

    /// Log a completed cycle with its statistics
    pub fn log_cycle(&self, record: &CycleRecord, windows: &[WindowMean]) {
        match record.predicted_rate {
            Some(rate) => info!(
                event = "cycle_completed",
                station = %self.station,
                sequence = record.sequence,
                start_time = %record.start_time.to_rfc3339(),
                end_time = %record.end_time.to_rfc3339(),
                duration_secs = record.duration_secs,
                interval_secs = record.interval_secs,
                predicted_rate = rate,
                windows = %format_windows(windows),
                "Batch cycle completed"
            ),
            None => warn!(
                event = "cycle_completed",
                station = %self.station,
                sequence = record.sequence,
                start_time = %record.start_time.to_rfc3339(),
                end_time = %record.end_time.to_rfc3339(),
                duration_secs = record.duration_secs,
                interval_secs = record.interval_secs,
                anomaly = ?record.anomaly,
                windows = %format_windows(windows),
                "Batch cycle completed without a valid prediction"
            ),
        }
    }

    /// Log a failed liveness check
    pub fn log_liveness_failure(&self, generation: u64, error: &SessionError) {
        warn!(
            event = "liveness_failure",
            station = %self.station,
            generation = generation,
            error = %error,
            error_kind = error.kind(),
            "Liveness check failed"
        );
    }

    /// Log the backoff before the next attempt
    pub fn log_reconnect_scheduled(&self, generation: u64, backoff: Duration, error: &SessionError) {
        warn!(
            event = "reconnect_scheduled",
            station = %self.station,
            generation = generation,
            backoff_ms = backoff.as_millis() as u64,
            error = %error,
            error_kind = error.kind(),
            "Connection lost, reconnecting after backoff"
        );
    }

    /// Log a failed write by one of the actuators
    pub fn log_write_failure(&self, component: &str, address: &str, error: &SessionError) {
        warn!(
            event = "write_failure",
            station = %self.station,
            component = %component,
            address = %address,
            error = %error,
            error_kind = error.kind(),
            retryable = error.is_retryable(),
            "Write failed"
        );
    }

    /// Log one applied setpoint step
    pub fn log_setpoint_step(&self, step: usize, total: usize) {
        info!(
            event = "setpoint_step",
            station = %self.station,
            step = step + 1,
            total = total,
            "Setpoints applied"
        );
    }

    /// Log an error that stops the supervisor
    pub fn log_fatal(&self, error: &dyn std::error::Error) {
        error!(
            event = "supervisor_stopped",
            station = %self.station,
            error = %error,
            "Supervisor stopped on a non-retryable error"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(rate: Option<f64>) -> CycleRecord {
        let start = Utc::now();
        CycleRecord {
            sequence: 1,
            start_time: start,
            end_time: start + chrono::Duration::seconds(5),
            duration_secs: 5.0,
            interval_secs: 30.0,
            predicted_rate: rate,
            anomaly: None,
        }
    }

    #[test]
    fn test_agent_metrics_creation() {
        // Prometheus registry is process-global; only relative changes are asserted
        let metrics = AgentMetrics::new();
        let before = metrics.cycles_completed();

        metrics.record_cycle(&record(Some(5.5)));
        metrics.record_cycle(&record(None));
        metrics.set_window_means(&[WindowMean {
            size: 2,
            samples: 1,
            mean: Some(5.5),
        }]);
        metrics.set_session_connected(true);
        metrics.set_session_generation(3);
        metrics.inc_session_attempts();
        metrics.inc_liveness_failures();
        metrics.inc_write_failures("mirror");
        metrics.inc_sink_drops();

        assert!(metrics.cycles_completed() >= before + 2);
    }

    #[test]
    fn test_format_windows() {
        let windows = [
            WindowMean {
                size: 2,
                samples: 2,
                mean: Some(19.25),
            },
            WindowMean {
                size: 4,
                samples: 0,
                mean: None,
            },
        ];
        assert_eq!(format_windows(&windows), "k2=19.25 k4=-");
    }

    #[test]
    fn test_structured_logger_creation() {
        let logger = StructuredLogger::new("mixer-1");
        assert_eq!(logger.station(), "mixer-1");
    }
}
