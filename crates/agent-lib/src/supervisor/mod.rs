//! Connection supervisor
//!
//! Owns the connect / monitor / fail / retry lifecycle:
//!
//! ```text
//! Disconnected -> connect -> startup writes -> tracker per policy
//!     -> subscription + workers -> Connected (liveness poll)
//!     -> failure -> teardown -> Disconnected -> backoff -> ...
//! ```
//!
//! Every attempt gets a fresh session from the factory and a fresh
//! connection handle. Workers and the liveness poll report failures through
//! the handle; the first one ends the attempt. Connectivity loss is retried
//! forever, while configuration errors and protocol errors during setup stop
//! the supervisor.

mod handle;


pub use handle::{ConnectionHandle, FailureReporter};

use crate::dosing::{DosingConfig, DosingController};
use crate::error::{ConfigError, SessionError, SupervisorError};
use crate::health::{components, HealthRegistry};
use crate::mirror::MirrorActuator;
use crate::models::{CycleRecord, SignalAddress, SignalSample, SignalValue, ValueType};
use crate::observability::{AgentMetrics, StructuredLogger};
use crate::sampler::{run_sampler, SamplerConfig};
use crate::sequence::SetpointSequence;
use crate::session::{lock, HandlerSet, Session, SessionFactory, SessionState, Subscription};
use crate::sink::RecordSink;
use crate::tracker::{
    ContinuityPolicy, CycleTracker, SharedTracker, TrackerConfig, TrackerHandler, TrackerSnapshot,
};
use anyhow::Result;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info};

/// Parameter written once per session before subscriptions are installed
#[derive(Debug, Clone, PartialEq)]
pub struct StartupWrite {
    pub address: SignalAddress,
    pub value: SignalValue,
}

/// Configuration for the connection supervisor
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Boolean "machine active" signal
    pub watched: SignalAddress,
    /// Requested sampling interval of the subscription (default: 100ms)
    pub sampling_interval: Duration,
    /// Liveness poll interval (default: 1 second)
    pub poll_interval: Duration,
    /// Wait between a failure and the next attempt (default: 2 seconds)
    pub retry_backoff: Duration,
    pub tracker: TrackerConfig,
    pub continuity: ContinuityPolicy,
    /// Outputs that mirror the watched signal
    pub mirror_targets: Vec<SignalAddress>,
    pub dosing: Option<DosingConfig>,
    pub startup_writes: Vec<StartupWrite>,
    pub sequence: Option<SetpointSequence>,
    pub sampler: Option<SamplerConfig>,
}

impl SupervisorConfig {
    pub fn new(watched: SignalAddress) -> Self {
        Self {
            watched,
            sampling_interval: Duration::from_millis(100),
            poll_interval: Duration::from_secs(1),
            retry_backoff: Duration::from_secs(2),
            tracker: TrackerConfig::default(),
            continuity: ContinuityPolicy::Reset,
            mirror_targets: Vec::new(),
            dosing: None,
            startup_writes: Vec::new(),
            sequence: None,
            sampler: None,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.watched.value_type != ValueType::Boolean {
            return Err(ConfigError::WrongSignalType {
                address: self.watched.to_string(),
                expected: "boolean",
            });
        }
        if self.sampling_interval.is_zero() {
            return Err(ConfigError::ZeroDuration("sampling_interval"));
        }
        if self.poll_interval.is_zero() {
            return Err(ConfigError::ZeroDuration("poll_interval"));
        }
        if self.retry_backoff.is_zero() {
            return Err(ConfigError::ZeroDuration("retry_backoff"));
        }
        self.tracker.validate()?;

        for write in &self.startup_writes {
            if write.value.coerce(write.address.value_type).is_none() {
                return Err(ConfigError::IncompatibleValue {
                    address: write.address.to_string(),
                    value: write.value.to_string(),
                });
            }
        }
        if let Some(dosing) = &self.dosing {
            dosing.validate()?;
        }
        if let Some(sampler) = &self.sampler {
            sampler.validate()?;
        }
        Ok(())
    }

    /// Addresses installed in the change subscription
    pub fn addresses(&self) -> Vec<SignalAddress> {
        vec![self.watched.clone()]
    }
}

/// Summary returned when the supervisor stops on shutdown
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SupervisorReport {
    /// Session attempts made
    pub sessions: u64,
    /// Attempts that ended in a retryable failure
    pub failures: u64,
    /// Records produced by the tracker since its last reset
    pub cycles_completed: u64,
}

enum SessionOutcome {
    Shutdown,
    Lost(SessionError),
    Fatal(SessionError),
}

impl From<SessionError> for SessionOutcome {
    fn from(error: SessionError) -> Self {
        if error.is_retryable() {
            SessionOutcome::Lost(error)
        } else {
            SessionOutcome::Fatal(error)
        }
    }
}

/// Tasks owned by one session; aborted when the session is torn down
#[derive(Default)]
struct SessionTasks {
    subscription: Option<Subscription>,
    workers: Vec<JoinHandle<()>>,
}

impl Drop for SessionTasks {
    fn drop(&mut self) {
        if let Some(subscription) = &self.subscription {
            subscription.cancel();
        }
        for worker in &self.workers {
            worker.abort();
        }
    }
}

/// Supervised connection to one endpoint
pub struct Supervisor {
    config: SupervisorConfig,
    factory: Arc<dyn SessionFactory>,
    tracker: SharedTracker,
    snapshots: Arc<watch::Sender<TrackerSnapshot>>,
    state: watch::Sender<SessionState>,
    logger: StructuredLogger,
    metrics: AgentMetrics,
    health: Option<HealthRegistry>,
    cycle_sink: Option<RecordSink<CycleRecord>>,
    sample_sink: Option<RecordSink<SignalSample>>,
}

impl Supervisor {
    /// Latest tracker snapshot, updated on every start and completed cycle
    pub fn snapshots(&self) -> watch::Receiver<TrackerSnapshot> {
        self.snapshots.subscribe()
    }

    /// Session state as seen by the supervisor
    pub fn state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    pub fn tracker(&self) -> SharedTracker {
        self.tracker.clone()
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    /// Run until shutdown or a non-retryable error
    pub async fn run(
        &self,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<SupervisorReport, SupervisorError> {
        if let Err(e) = self.config.validate() {
            self.logger.log_fatal(&e);
            return Err(e.into());
        }

        if let Some(health) = &self.health {
            health.register(components::SESSION).await;
            health.register(components::TRACKER).await;
            if !self.config.mirror_targets.is_empty() {
                health.register(components::MIRROR).await;
            }
        }

        info!(
            watched = %self.config.watched,
            poll_ms = self.config.poll_interval.as_millis() as u64,
            backoff_ms = self.config.retry_backoff.as_millis() as u64,
            continuity = ?self.config.continuity,
            "Starting connection supervisor"
        );

        let mut report = SupervisorReport::default();
        let mut generation = 0u64;

        loop {
            generation += 1;
            report.sessions = generation;

            let session = self.factory.create();
            let outcome = tokio::select! {
                biased;
                _ = shutdown.recv() => SessionOutcome::Shutdown,
                outcome = self.attempt(generation, &session) => outcome,
            };

            session.disconnect().await;
            self.publish_state(generation, session.as_ref(), SessionState::Disconnected)
                .await;

            match outcome {
                SessionOutcome::Shutdown => break,
                SessionOutcome::Fatal(e) => {
                    if let Some(health) = &self.health {
                        health
                            .set_unhealthy(components::SESSION, e.to_string())
                            .await;
                    }
                    self.logger.log_fatal(&e);
                    return Err(SupervisorError::Setup(e));
                }
                SessionOutcome::Lost(e) => {
                    report.failures += 1;
                    if let Some(health) = &self.health {
                        health
                            .set_degraded(components::SESSION, format!("reconnecting: {}", e))
                            .await;
                    }
                    self.logger
                        .log_reconnect_scheduled(generation, self.config.retry_backoff, &e);

                    let stop = tokio::select! {
                        _ = tokio::time::sleep(self.config.retry_backoff) => false,
                        _ = shutdown.recv() => true,
                    };
                    if stop {
                        break;
                    }
                }
            }
        }

        report.cycles_completed = lock(&self.tracker).completed();
        info!(
            sessions = report.sessions,
            failures = report.failures,
            "Connection supervisor stopped"
        );
        Ok(report)
    }

    /// One attempt: connect, set up, monitor until the first failure
    async fn attempt(&self, generation: u64, session: &Arc<dyn Session>) -> SessionOutcome {
        self.metrics.inc_session_attempts();
        self.metrics.set_session_generation(generation);
        self.publish_state(generation, session.as_ref(), SessionState::Connecting)
            .await;

        if let Err(e) = session.connect().await {
            self.publish_state(generation, session.as_ref(), SessionState::Failed)
                .await;
            return e.into();
        }

        let handle = ConnectionHandle::new(generation);
        let _tasks = match self.install(generation, session, &handle).await {
            Ok(tasks) => tasks,
            Err(e) => return e.into(),
        };

        self.publish_state(generation, session.as_ref(), SessionState::Connected)
            .await;
        if let Some(health) = &self.health {
            health.set_healthy(components::SESSION).await;
        }

        self.monitor(generation, session, &handle).await
    }

    /// Startup writes, tracker, subscription and per-session workers
    async fn install(
        &self,
        generation: u64,
        session: &Arc<dyn Session>,
        handle: &ConnectionHandle,
    ) -> Result<SessionTasks, SessionError> {
        for write in &self.config.startup_writes {
            let value = write.value.coerce(write.address.value_type).ok_or_else(|| {
                SessionError::protocol(&write.address, "startup value has the wrong type")
            })?;
            session.write(&write.address, value).await?;
            debug!(address = %write.address, value = %value, "Startup write applied");
        }

        if let Some(sampler) = &self.config.sampler {
            // Surfaces an unknown sampler address as a setup error
            session.read(&sampler.address).await?;
        }

        let mut tasks = SessionTasks::default();
        let mut handlers = HandlerSet::new();

        {
            let mut tracker = lock(&self.tracker);
            let policy = if generation == 1 {
                ContinuityPolicy::Reset
            } else {
                self.config.continuity
            };
            tracker.begin_session(generation, session.now(), policy);
            self.snapshots.send_replace(tracker.snapshot());
        }

        let mut tracker_handler = TrackerHandler::new(
            self.config.watched.clone(),
            self.tracker.clone(),
            self.snapshots.clone(),
            self.logger.clone(),
            self.metrics.clone(),
        );
        if let Some(sink) = &self.cycle_sink {
            tracker_handler = tracker_handler.with_sink(sink.clone());
        }
        handlers.push(Arc::new(tracker_handler));

        if !self.config.mirror_targets.is_empty() {
            let (mirror, worker) = MirrorActuator::spawn(
                self.config.watched.clone(),
                self.config.mirror_targets.clone(),
                session.clone(),
                handle.reporter(),
                self.logger.clone(),
                self.metrics.clone(),
            );
            handlers.push(Arc::new(mirror));
            tasks.workers.push(worker);
        }

        if let Some(dosing) = &self.config.dosing {
            let (controller, worker) = DosingController::spawn(
                self.config.watched.clone(),
                dosing.clone(),
                session.clone(),
                handle.reporter(),
                self.logger.clone(),
                self.metrics.clone(),
            );
            handlers.push(Arc::new(controller));
            tasks.workers.push(worker);
        }

        let subscription = session
            .subscribe(
                self.config.sampling_interval,
                &self.config.addresses(),
                Arc::new(handlers),
            )
            .await?;
        debug!(
            generation = generation,
            subscription = subscription.id(),
            "Subscription installed"
        );
        tasks.subscription = Some(subscription);

        if let Some(sequence) = self.config.sequence.as_ref().filter(|s| !s.is_finished()) {
            let sequence = sequence.clone();
            let session = session.clone();
            let reporter = handle.reporter();
            let logger = self.logger.clone();
            let metrics = self.metrics.clone();
            tasks.workers.push(tokio::spawn(async move {
                sequence.run(session, reporter, logger, metrics).await
            }));
        }

        if let Some(sampler) = &self.config.sampler {
            tasks.workers.push(tokio::spawn(run_sampler(
                sampler.clone(),
                session.clone(),
                self.sample_sink.clone(),
                handle.reporter(),
            )));
        }

        Ok(tasks)
    }

    /// Poll liveness until it fails or a worker reports a failure
    async fn monitor(
        &self,
        generation: u64,
        session: &Arc<dyn Session>,
        handle: &ConnectionHandle,
    ) -> SessionOutcome {
        let period = self.config.poll_interval;
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                error = handle.failed() => return error.into(),
                _ = ticker.tick() => {
                    if let Err(e) = session.check_liveness().await {
                        self.metrics.inc_liveness_failures();
                        self.logger.log_liveness_failure(generation, &e);
                        return e.into();
                    }
                }
            }
        }
    }

    async fn publish_state(&self, generation: u64, session: &dyn Session, state: SessionState) {
        let previous = self.state.send_replace(state);
        if previous == state {
            return;
        }

        self.metrics
            .set_session_connected(state == SessionState::Connected);
        self.logger
            .log_connection_state(generation, session.endpoint(), state);
        if let Some(health) = &self.health {
            health.set_session_state(state).await;
        }
    }
}

/// Builder for the connection supervisor
pub struct SupervisorBuilder {
    config: Option<SupervisorConfig>,
    factory: Option<Arc<dyn SessionFactory>>,
    logger: Option<StructuredLogger>,
    metrics: Option<AgentMetrics>,
    health: Option<HealthRegistry>,
    cycle_sink: Option<RecordSink<CycleRecord>>,
    sample_sink: Option<RecordSink<SignalSample>>,
}

impl SupervisorBuilder {
    /// Create a new builder
    pub fn new() -> Self {
        Self {
            config: None,
            factory: None,
            logger: None,
            metrics: None,
            health: None,
            cycle_sink: None,
            sample_sink: None,
        }
    }

    pub fn config(mut self, config: SupervisorConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Set the session factory
    pub fn factory(mut self, factory: Arc<dyn SessionFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    pub fn logger(mut self, logger: StructuredLogger) -> Self {
        self.logger = Some(logger);
        self
    }

    pub fn metrics(mut self, metrics: AgentMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Report session state and component health here
    pub fn health(mut self, health: HealthRegistry) -> Self {
        self.health = Some(health);
        self
    }

    /// Append completed cycles to this sink
    pub fn cycle_sink(mut self, sink: RecordSink<CycleRecord>) -> Self {
        self.cycle_sink = Some(sink);
        self
    }

    /// Append sampler readings to this sink
    pub fn sample_sink(mut self, sink: RecordSink<SignalSample>) -> Self {
        self.sample_sink = Some(sink);
        self
    }

    /// Build the supervisor; configuration is validated when it runs
    pub fn build(self) -> Result<Supervisor> {
        let config = self
            .config
            .ok_or_else(|| anyhow::anyhow!("Supervisor config is required"))?;
        let factory = self
            .factory
            .ok_or_else(|| anyhow::anyhow!("Session factory is required"))?;

        let tracker = CycleTracker::new(config.tracker.clone(), Utc::now());
        let (snapshots, _) = watch::channel(tracker.snapshot());
        let (state, _) = watch::channel(SessionState::Disconnected);

        Ok(Supervisor {
            tracker: tracker.shared(),
            snapshots: Arc::new(snapshots),
            state,
            logger: self
                .logger
                .unwrap_or_else(|| StructuredLogger::new("batch-agent")),
            metrics: self.metrics.unwrap_or_default(),
            health: self.health,
            cycle_sink: self.cycle_sink,
            sample_sink: self.sample_sink,
            config,
            factory,
        })
    }
}

impl Default for SupervisorBuilder {
    fn default() -> Self {
        Self::new()
    }
}
