//! Periodic signal sampler
//!
//! Reads one numeric signal at a fixed interval and queues each sample for
//! the record sink. A failed read is treated like a failed liveness check.

use crate::error::ConfigError;
use crate::models::{SignalAddress, SignalSample};
use crate::session::Session;
use crate::sink::RecordSink;
use crate::supervisor::FailureReporter;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq)]
pub struct SamplerConfig {
    pub address: SignalAddress,
    pub interval: Duration,
    /// Log a progress line every this many samples (0 disables)
    pub log_every: u64,
}

impl SamplerConfig {
    pub fn new(address: SignalAddress, interval: Duration) -> Self {
        Self {
            address,
            interval,
            log_every: 100,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.interval.is_zero() {
            return Err(ConfigError::ZeroDuration("sampler interval"));
        }
        Ok(())
    }
}

/// Sample until a read fails or the task is aborted
pub async fn run_sampler(
    config: SamplerConfig,
    session: Arc<dyn Session>,
    sink: Option<RecordSink<SignalSample>>,
    reporter: FailureReporter,
) {
    let mut ticker = interval(config.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut taken = 0u64;

    loop {
        ticker.tick().await;

        let value = match session.read(&config.address).await {
            Ok(value) => value,
            Err(e) => {
                warn!(address = %config.address, error = %e, "Sampler read failed");
                reporter.report(e);
                return;
            }
        };

        taken += 1;
        if let Some(sink) = &sink {
            sink.submit(SignalSample {
                timestamp: session.now(),
                value,
            });
        }

        if config.log_every > 0 && taken % config.log_every == 0 {
            info!(
                address = %config.address,
                samples = taken,
                latest = %value,
                "Sampling"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{SignalValue, ValueType};
    use crate::session::{Credentials, SessionFactory, SimulatedEndpoint};
    use crate::supervisor::ConnectionHandle;
    use tempfile::TempDir;

    fn load() -> SignalAddress {
        SignalAddress::parse("ns=2;i=7", ValueType::Float).unwrap()
    }

    #[tokio::test]
    async fn test_samples_reach_sink() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("load.csv");
        let (sink, writer) = RecordSink::open(&path, 64).unwrap();

        let endpoint = SimulatedEndpoint::new("sim://load-cell");
        endpoint.declare(load().node, SignalValue::Float(12.5));
        let session = endpoint.connector(Credentials::Anonymous).create();
        session.connect().await.unwrap();

        let handle = ConnectionHandle::new(1);
        let task = tokio::spawn(run_sampler(
            SamplerConfig::new(load(), Duration::from_millis(5)),
            session.clone(),
            Some(sink),
            handle.reporter(),
        ));

        tokio::time::sleep(Duration::from_millis(40)).await;
        session.disconnect().await;

        // The next read fails and ends the sampler, releasing the sink
        task.await.unwrap();
        assert!(handle.failure().is_some());

        let rows = writer.await.unwrap();
        assert!(rows >= 2);
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.starts_with("timestamp,value"));
        assert!(content.lines().skip(1).all(|line| line.ends_with(",12.5")));
    }

    #[test]
    fn test_config_validation() {
        let config = SamplerConfig::new(load(), Duration::ZERO);
        assert!(config.validate().is_err());
        assert_eq!(SamplerConfig::new(load(), Duration::from_millis(20)).log_every, 100);
    }
}
