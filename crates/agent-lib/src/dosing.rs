//! Dosing interlock controller
//!
//! Drives the "mixer disabled" interlock from the mixer run signal: a fixed
//! batch time after the mixer starts the interlock is set, and a minimum pause
//! after it stops the interlock is released. Both writes are deferred actions
//! executed by a worker in the order they were scheduled.

use crate::error::ConfigError;
use crate::models::{DataChange, SignalAddress, SignalValue, ValueType};
use crate::observability::{AgentMetrics, StructuredLogger};
use crate::session::{lock, DataChangeHandler, Session};
use crate::supervisor::FailureReporter;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Dosing controller settings
#[derive(Debug, Clone, PartialEq)]
pub struct DosingConfig {
    /// Boolean interlock output
    pub interlock: SignalAddress,
    /// Delay from mixer start to setting the interlock
    pub batch_time: Duration,
    /// Delay from mixer stop to releasing the interlock
    pub min_pause: Duration,
}

impl DosingConfig {
    pub fn new(interlock: SignalAddress) -> Self {
        Self {
            interlock,
            batch_time: Duration::from_secs(5),
            min_pause: Duration::from_secs(20),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.interlock.value_type != ValueType::Boolean {
            return Err(ConfigError::WrongSignalType {
                address: self.interlock.to_string(),
                expected: "boolean",
            });
        }
        if self.batch_time.is_zero() {
            return Err(ConfigError::ZeroDuration("dosing batch_time"));
        }
        if self.min_pause.is_zero() {
            return Err(ConfigError::ZeroDuration("dosing min_pause"));
        }
        Ok(())
    }
}

/// Interlock write due at a point in time
#[derive(Debug, Clone, Copy, PartialEq)]
struct ScheduledWrite {
    due: Instant,
    value: bool,
}

/// Handler side of the dosing controller
pub struct DosingController {
    source: SignalAddress,
    config: DosingConfig,
    last_seen: Mutex<Option<bool>>,
    tx: mpsc::UnboundedSender<ScheduledWrite>,
}

impl DosingController {
    /// Start the interlock worker for one session
    pub fn spawn(
        source: SignalAddress,
        config: DosingConfig,
        session: Arc<dyn Session>,
        reporter: FailureReporter,
        logger: StructuredLogger,
        metrics: AgentMetrics,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = tokio::spawn(run_interlock(
            config.interlock.clone(),
            rx,
            session,
            reporter,
            logger,
            metrics,
        ));
        (
            Self {
                source,
                config,
                last_seen: Mutex::new(None),
                tx,
            },
            worker,
        )
    }
}

impl DataChangeHandler for DosingController {
    fn on_data_change(&self, change: &DataChange) {
        if change.address != self.source {
            return;
        }

        let running = change.value.as_bool();
        {
            let mut last_seen = lock(&self.last_seen);
            if *last_seen == Some(running) {
                return;
            }
            *last_seen = Some(running);
        }

        let delay = if running {
            self.config.batch_time
        } else {
            self.config.min_pause
        };
        let write = ScheduledWrite {
            due: Instant::now() + delay,
            value: running,
        };

        debug!(
            interlock = %self.config.interlock,
            value = running,
            delay_secs = delay.as_secs_f64(),
            "Interlock write scheduled"
        );
        if self.tx.send(write).is_err() {
            warn!(interlock = %self.config.interlock, "Dosing worker stopped, interlock write dropped");
        }
    }

    fn name(&self) -> &str {
        "dosing"
    }
}

async fn run_interlock(
    interlock: SignalAddress,
    mut rx: mpsc::UnboundedReceiver<ScheduledWrite>,
    session: Arc<dyn Session>,
    reporter: FailureReporter,
    logger: StructuredLogger,
    metrics: AgentMetrics,
) {
    while let Some(write) = rx.recv().await {
        tokio::time::sleep_until(write.due).await;

        match session.write(&interlock, SignalValue::Bool(write.value)).await {
            Ok(()) => info!(
                interlock = %interlock,
                disabled = write.value,
                "{}",
                if write.value { "Mixer interlock set" } else { "Mixer interlock released" }
            ),
            Err(e) => {
                metrics.inc_write_failures("dosing");
                logger.log_write_failure("dosing", &interlock.to_string(), &e);
                if e.is_retryable() {
                    reporter.report(e);
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{Credentials, SessionFactory, SimulatedEndpoint};
    use crate::supervisor::ConnectionHandle;

    fn mixer_run() -> SignalAddress {
        SignalAddress::boolean("ns=2;s=Tags.GECO/MP_Mixer_Run").unwrap()
    }

    fn mixer_disabled() -> SignalAddress {
        SignalAddress::boolean("ns=2;s=Tags.GECO/MPRX_DI_Mixer_Disabled").unwrap()
    }

    fn change(value: bool) -> DataChange {
        DataChange {
            address: mixer_run(),
            value: SignalValue::Bool(value),
            received_at: chrono::Utc::now(),
        }
    }

    async fn setup() -> (SimulatedEndpoint, DosingController, ConnectionHandle) {
        let endpoint = SimulatedEndpoint::new("sim://mai");
        endpoint.declare_address(&mixer_run());
        endpoint.declare_address(&mixer_disabled());
        let session = endpoint.connector(Credentials::Anonymous).create();
        session.connect().await.unwrap();

        let handle = ConnectionHandle::new(1);
        let (controller, _worker) = DosingController::spawn(
            mixer_run(),
            DosingConfig::new(mixer_disabled()),
            session,
            handle.reporter(),
            StructuredLogger::new("test"),
            AgentMetrics::new(),
        );
        (endpoint, controller, handle)
    }

    async fn advance(secs: f64) {
        tokio::time::sleep(Duration::from_secs_f64(secs)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_interlock_follows_schedule() {
        let (endpoint, controller, handle) = setup().await;
        let interlock = mixer_disabled().node;

        controller.on_data_change(&change(true));
        advance(4.9).await;
        assert_eq!(endpoint.value(&interlock), Some(SignalValue::Bool(false)));
        advance(0.2).await;
        assert_eq!(endpoint.value(&interlock), Some(SignalValue::Bool(true)));

        controller.on_data_change(&change(false));
        advance(19.9).await;
        assert_eq!(endpoint.value(&interlock), Some(SignalValue::Bool(true)));
        advance(0.2).await;
        assert_eq!(endpoint.value(&interlock), Some(SignalValue::Bool(false)));

        assert!(handle.failure().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicates_schedule_nothing() {
        let (endpoint, controller, _handle) = setup().await;

        controller.on_data_change(&change(true));
        controller.on_data_change(&change(true));
        advance(6.0).await;
        assert_eq!(endpoint.stats().writes, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_actions_run_in_scheduling_order() {
        let (endpoint, controller, _handle) = setup().await;
        let interlock = mixer_disabled().node;

        // Stop scheduled first (due at 20s), then a start (due at 6s)
        controller.on_data_change(&change(false));
        advance(1.0).await;
        controller.on_data_change(&change(true));

        advance(10.0).await;
        assert_eq!(endpoint.stats().writes, 0);

        advance(10.0).await;
        assert_eq!(endpoint.value(&interlock), Some(SignalValue::Bool(true)));
        assert_eq!(endpoint.stats().writes, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_failure_reported() {
        let (endpoint, controller, handle) = setup().await;
        endpoint.set_link_down(true);

        controller.on_data_change(&change(true));
        advance(6.0).await;
        assert!(matches!(
            handle.failure(),
            Some(crate::error::SessionError::Communication(_))
        ));
    }

    #[test]
    fn test_config_validation() {
        assert!(DosingConfig::new(mixer_disabled()).validate().is_ok());

        let wrong_type = DosingConfig::new(
            SignalAddress::parse("ns=2;i=9", ValueType::Integer).unwrap(),
        );
        assert!(matches!(
            wrong_type.validate(),
            Err(ConfigError::WrongSignalType { .. })
        ));

        let mut zero = DosingConfig::new(mixer_disabled());
        zero.min_pause = Duration::ZERO;
        assert!(zero.validate().is_err());
    }
}
