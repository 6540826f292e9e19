//! Setpoint sequence driver
//!
//! Writes a schedule of setpoint vectors to several targets: at step `i`
//! every target receives its `i`-th value, then the driver holds for one step
//! duration. Progress lives in a shared cursor so a reconnect resumes at the
//! step that was interrupted instead of starting over.

use crate::error::ConfigError;
use crate::models::{SignalAddress, SignalValue};
use crate::observability::{AgentMetrics, StructuredLogger};
use crate::session::Session;
use crate::supervisor::FailureReporter;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Validated setpoint schedule
#[derive(Debug, Clone)]
pub struct SetpointSequence {
    targets: Vec<SignalAddress>,
    /// One column of coerced values per target
    columns: Vec<Vec<SignalValue>>,
    step: Duration,
    cursor: Arc<AtomicUsize>,
}

impl SetpointSequence {
    /// Build a sequence; every column must have the same, non-zero length and
    /// every value must be representable in its target's type
    pub fn new(
        targets: Vec<SignalAddress>,
        columns: Vec<Vec<SignalValue>>,
        step: Duration,
    ) -> Result<Self, ConfigError> {
        if targets.len() != columns.len() {
            return Err(ConfigError::SequenceTargetMismatch {
                targets: targets.len(),
                columns: columns.len(),
            });
        }
        let steps = columns.first().map(Vec::len).unwrap_or(0);
        if targets.is_empty() || steps == 0 {
            return Err(ConfigError::EmptySequence);
        }
        if step.is_zero() {
            return Err(ConfigError::ZeroDuration("sequence step"));
        }

        let mut coerced = Vec::with_capacity(columns.len());
        for (target, column) in targets.iter().zip(columns) {
            if column.len() != steps {
                return Err(ConfigError::SequenceLengthMismatch {
                    target: target.to_string(),
                    expected: steps,
                    actual: column.len(),
                });
            }
            let values = column
                .into_iter()
                .map(|value| {
                    value
                        .coerce(target.value_type)
                        .ok_or_else(|| ConfigError::IncompatibleValue {
                            address: target.to_string(),
                            value: value.to_string(),
                        })
                })
                .collect::<Result<Vec<_>, _>>()?;
            coerced.push(values);
        }

        Ok(Self {
            targets,
            columns: coerced,
            step,
            cursor: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn steps(&self) -> usize {
        self.columns.first().map(Vec::len).unwrap_or(0)
    }

    pub fn step_duration(&self) -> Duration {
        self.step
    }

    pub fn targets(&self) -> &[SignalAddress] {
        &self.targets
    }

    /// Index of the next step to apply
    pub fn position(&self) -> usize {
        self.cursor.load(Ordering::SeqCst)
    }

    pub fn is_finished(&self) -> bool {
        self.position() >= self.steps()
    }

    /// Values of every target at `step`
    pub fn values_at(&self, step: usize) -> Option<Vec<SignalValue>> {
        self.columns
            .iter()
            .map(|column| column.get(step).copied())
            .collect()
    }

    /// Apply the remaining steps on `session`
    ///
    /// The cursor advances only after a step has been held for its full
    /// duration. A retryable write failure is reported and ends this run; the
    /// next session picks up at the same step.
    pub async fn run(
        &self,
        session: Arc<dyn Session>,
        reporter: FailureReporter,
        logger: StructuredLogger,
        metrics: AgentMetrics,
    ) {
        let total = self.steps();
        if self.is_finished() {
            return;
        }
        info!(
            resume_at = self.position() + 1,
            total = total,
            "Running setpoint sequence"
        );

        while let Some(values) = self.values_at(self.position()) {
            let step = self.position();
            for (target, value) in self.targets.iter().zip(values) {
                if let Err(e) = session.write(target, value).await {
                    metrics.inc_write_failures("sequence");
                    logger.log_write_failure("sequence", &target.to_string(), &e);
                    if e.is_retryable() {
                        reporter.report(e);
                        return;
                    }
                }
            }
            logger.log_setpoint_step(step, total);

            tokio::time::sleep(self.step).await;
            self.cursor.fetch_add(1, Ordering::SeqCst);
        }

        info!(total = total, "Setpoint sequence finished");
    }
}
