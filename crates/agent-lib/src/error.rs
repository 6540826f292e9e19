//! Error taxonomy for the batch agent
//!
//! Session failures are split by what the supervisor may do about them:
//! connection and communication failures are retried through a full
//! reconnect, protocol errors are surfaced instead of retried. Computation
//! anomalies never propagate; they are stored on the affected cycle record.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failures raised by an endpoint session or its subscriptions
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    /// The session could not be established (transport or authentication)
    #[error("connection failure: {0}")]
    ConnectionFailure(String),

    /// Read, write or liveness failure on an established session
    #[error("communication error: {0}")]
    Communication(String),

    /// The endpoint rejected a well-formed request
    #[error("protocol error on {address}: {reason}")]
    Protocol { address: String, reason: String },
}

impl SessionError {
    pub fn protocol(address: impl ToString, reason: impl Into<String>) -> Self {
        SessionError::Protocol {
            address: address.to_string(),
            reason: reason.into(),
        }
    }

    /// Whether a full reconnect may clear this failure
    pub fn is_retryable(&self) -> bool {
        !matches!(self, SessionError::Protocol { .. })
    }

    /// Short label used in logs and metrics
    pub fn kind(&self) -> &'static str {
        match self {
            SessionError::ConnectionFailure(_) => "connection_failure",
            SessionError::Communication(_) => "communication_error",
            SessionError::Protocol { .. } => "protocol_error",
        }
    }
}

/// Anomalies that invalidate the prediction of a single cycle record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComputationAnomaly {
    #[error("interval since the previous batch end is not positive")]
    NonPositiveInterval,

    #[error("batch ended before it started")]
    NegativeDuration,

    #[error("first cycle measured from tracker start was discarded")]
    FirstCycle,
}

/// Invalid static configuration; fatal at startup
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("invalid signal address '{input}': {reason}")]
    InvalidAddress { input: String, reason: String },

    #[error("invalid endpoint '{url}': {reason}")]
    InvalidEndpoint { url: String, reason: String },

    #[error("no transport driver for endpoint scheme '{0}'")]
    UnsupportedScheme(String),

    #[error("reference flow rate must be positive and finite, got {0}")]
    InvalidFlowRate(f64),

    #[error("at least one rolling window size is required")]
    NoWindows,

    #[error("rolling window sizes must be greater than zero")]
    ZeroWindow,

    #[error("{0} must be greater than zero")]
    ZeroDuration(&'static str),

    #[error("signal {address} must be {expected}")]
    WrongSignalType {
        address: String,
        expected: &'static str,
    },

    #[error("setpoint sequence for {target} has {actual} values, expected {expected}")]
    SequenceLengthMismatch {
        target: String,
        expected: usize,
        actual: usize,
    },

    #[error("setpoint sequence has {targets} targets but {columns} value lists")]
    SequenceTargetMismatch { targets: usize, columns: usize },

    #[error("setpoint sequence needs at least one target and one step")]
    EmptySequence,

    #[error("value {value} cannot be written to {address}")]
    IncompatibleValue { address: String, value: String },
}

/// Failures opening the record sink
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("record sink I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("record sink CSV error: {0}")]
    Csv(#[from] csv::Error),
}

/// Conditions that stop the supervisor instead of triggering a retry
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("session setup rejected by endpoint: {0}")]
    Setup(SessionError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(SessionError::ConnectionFailure("refused".into()).is_retryable());
        assert!(SessionError::Communication("lost".into()).is_retryable());
        assert!(!SessionError::protocol("ns=2;i=7", "unknown node").is_retryable());
    }

    #[test]
    fn test_error_display() {
        let err = SessionError::protocol("ns=4;i=22", "unknown node");
        assert_eq!(err.to_string(), "protocol error on ns=4;i=22: unknown node");
        assert_eq!(err.kind(), "protocol_error");

        let err = ConfigError::SequenceLengthMismatch {
            target: "ns=2;s=Pump".into(),
            expected: 25,
            actual: 24,
        };
        assert!(err.to_string().contains("24 values, expected 25"));
    }

    #[test]
    fn test_anomaly_serializes_snake_case() {
        let json = serde_json::to_string(&ComputationAnomaly::NonPositiveInterval).unwrap();
        assert_eq!(json, "\"non_positive_interval\"");
    }
}
