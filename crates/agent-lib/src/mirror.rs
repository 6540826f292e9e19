//! Mirror actuator
//!
//! Relays every raw change of the watched signal to one or more secondary
//! outputs, coerced to each target's declared type. The handler only queues
//! the value; a worker owns the writes and fans each value out to all targets
//! concurrently so one slow or failing target never holds up another.

use crate::error::SessionError;
use crate::models::{DataChange, SignalAddress, SignalValue};
use crate::observability::{AgentMetrics, StructuredLogger};
use crate::session::{DataChangeHandler, Session};
use crate::supervisor::FailureReporter;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, warn};

/// Pending values between the delivery task and the mirror worker
const MIRROR_QUEUE_CAPACITY: usize = 256;

/// Handler side of the mirror: queues values for the worker
pub struct MirrorActuator {
    source: SignalAddress,
    tx: mpsc::Sender<SignalValue>,
}

impl MirrorActuator {
    /// Start the mirror worker for one session
    pub fn spawn(
        source: SignalAddress,
        targets: Vec<SignalAddress>,
        session: Arc<dyn Session>,
        reporter: FailureReporter,
        logger: StructuredLogger,
        metrics: AgentMetrics,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(MIRROR_QUEUE_CAPACITY);
        let worker = MirrorWorker {
            targets: Arc::new(targets),
            session,
            reporter,
            logger,
            metrics,
        };
        let task = tokio::spawn(worker.run(rx));
        (Self { source, tx }, task)
    }
}

impl DataChangeHandler for MirrorActuator {
    fn on_data_change(&self, change: &DataChange) {
        if change.address != self.source {
            return;
        }
        if let Err(e) = self.tx.try_send(change.value) {
            warn!(value = %change.value, error = %e, "Mirror queue unavailable, value not relayed");
        }
    }

    fn name(&self) -> &str {
        "mirror"
    }
}

struct MirrorWorker {
    targets: Arc<Vec<SignalAddress>>,
    session: Arc<dyn Session>,
    reporter: FailureReporter,
    logger: StructuredLogger,
    metrics: AgentMetrics,
}

impl MirrorWorker {
    async fn run(self, mut rx: mpsc::Receiver<SignalValue>) {
        while let Some(value) = rx.recv().await {
            let mut writes = JoinSet::new();
            for target in self.targets.iter().cloned() {
                let session = self.session.clone();
                writes.spawn(async move {
                    let result = match value.coerce(target.value_type) {
                        Some(coerced) => session.write(&target, coerced).await,
                        None => Err(SessionError::protocol(
                            &target,
                            format!("value {} is not a valid {}", value, target.value_type),
                        )),
                    };
                    (target, result)
                });
            }

            while let Some(joined) = writes.join_next().await {
                let Ok((target, result)) = joined else {
                    continue;
                };
                match result {
                    Ok(()) => debug!(target = %target, value = %value, "Value mirrored"),
                    Err(e) => {
                        self.metrics.inc_write_failures("mirror");
                        self.logger.log_write_failure("mirror", &target.to_string(), &e);
                        if e.is_retryable() {
                            self.reporter.report(e);
                        }
                    }
                }
            }
        }
    }
}
