//! In-process simulated endpoint
//!
//! Implements the session contract against an in-memory node table so the
//! agent runs without field hardware and failure handling can be exercised
//! deterministically: connects can be refused, liveness checks can start
//! failing after a number of successes, the link can be dropped and writes to
//! individual nodes can be rejected.
//!
//! Every write publishes a change notification, including writes of an
//! unchanged value, so handlers see the same duplicates a real endpoint may
//! produce. Timestamps follow the tokio clock, which keeps them monotonic and
//! lets tests run on a paused clock.

use super::{
    lock, Credentials, DataChangeHandler, Session, SessionFactory, SessionState, Subscription,
};
use crate::error::SessionError;
use crate::models::{DataChange, NodeId, SignalAddress, SignalValue};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Capacity of the change broadcast and of each subscription queue
const NOTIFICATION_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
struct Published {
    node: NodeId,
    value: SignalValue,
    at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct FaultPlan {
    refuse_connects: u32,
    /// Remaining successful liveness checks before one fails
    liveness_budget: Option<u32>,
    link_down: bool,
    failing_writes: HashMap<NodeId, SessionError>,
}

#[derive(Debug, Default)]
struct Counters {
    connects: AtomicU64,
    disconnects: AtomicU64,
    subscriptions: AtomicU64,
    liveness_checks: AtomicU64,
    writes: AtomicU64,
}

/// Activity counters of a simulated endpoint
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EndpointStats {
    pub connects: u64,
    pub disconnects: u64,
    pub subscriptions: u64,
    pub liveness_checks: u64,
    pub writes: u64,
}

struct EndpointInner {
    url: String,
    required: Credentials,
    nodes: DashMap<NodeId, SignalValue>,
    changes: broadcast::Sender<Published>,
    faults: Mutex<FaultPlan>,
    counters: Counters,
    next_id: AtomicU64,
    epoch: DateTime<Utc>,
    origin: Instant,
}

/// Server side of the simulation, shared by every session created from it
#[derive(Clone)]
pub struct SimulatedEndpoint {
    inner: Arc<EndpointInner>,
}

impl SimulatedEndpoint {
    /// Endpoint accepting anonymous sessions
    pub fn new(url: impl Into<String>) -> Self {
        Self::with_credentials(url, Credentials::Anonymous)
    }

    /// Endpoint that only accepts the given credentials
    pub fn with_credentials(url: impl Into<String>, required: Credentials) -> Self {
        let (changes, _) = broadcast::channel(NOTIFICATION_CAPACITY);
        Self {
            inner: Arc::new(EndpointInner {
                url: url.into(),
                required,
                nodes: DashMap::new(),
                changes,
                faults: Mutex::new(FaultPlan::default()),
                counters: Counters::default(),
                next_id: AtomicU64::new(1),
                epoch: Utc::now(),
                origin: Instant::now(),
            }),
        }
    }

    pub fn url(&self) -> &str {
        &self.inner.url
    }

    /// Declare a node; an existing node keeps its value
    pub fn declare(&self, node: NodeId, initial: SignalValue) {
        self.inner.nodes.entry(node).or_insert(initial);
    }

    /// Declare the node behind `address` with the zero value of its type
    pub fn declare_address(&self, address: &SignalAddress) {
        self.declare(address.node.clone(), SignalValue::zero(address.value_type));
    }

    pub fn value(&self, node: &NodeId) -> Option<SignalValue> {
        self.inner.nodes.get(node).map(|value| *value)
    }

    /// Server-side change (e.g. the machine toggling its run signal)
    pub fn set_value(&self, node: &NodeId, value: SignalValue) -> Result<(), SessionError> {
        let stored = {
            let mut entry = self
                .inner
                .nodes
                .get_mut(node)
                .ok_or_else(|| SessionError::protocol(node, "unknown node"))?;
            let node_type = entry.value_type();
            let coerced = value.coerce(node_type).ok_or_else(|| {
                SessionError::protocol(node, format!("cannot store {} in a {} node", value, node_type))
            })?;
            *entry = coerced;
            coerced
        };
        self.publish(node.clone(), stored);
        Ok(())
    }

    /// Current endpoint time
    pub fn now(&self) -> DateTime<Utc> {
        let elapsed = Instant::now().duration_since(self.inner.origin);
        self.inner.epoch
            + chrono::Duration::from_std(elapsed).unwrap_or_else(|_| chrono::Duration::zero())
    }

    /// Refuse the next `count` connection attempts
    pub fn refuse_connects(&self, count: u32) {
        lock(&self.inner.faults).refuse_connects = count;
    }

    /// Let `successes` liveness checks pass, then fail the next one
    pub fn fail_liveness_after(&self, successes: u32) {
        lock(&self.inner.faults).liveness_budget = Some(successes);
    }

    /// Drop or restore the transport for every session
    pub fn set_link_down(&self, down: bool) {
        lock(&self.inner.faults).link_down = down;
    }

    /// Reject every write to `node` with `error`
    pub fn fail_writes_to(&self, node: NodeId, error: SessionError) {
        lock(&self.inner.faults).failing_writes.insert(node, error);
    }

    pub fn clear_write_failures(&self) {
        lock(&self.inner.faults).failing_writes.clear();
    }

    pub fn stats(&self) -> EndpointStats {
        let counters = &self.inner.counters;
        EndpointStats {
            connects: counters.connects.load(Ordering::SeqCst),
            disconnects: counters.disconnects.load(Ordering::SeqCst),
            subscriptions: counters.subscriptions.load(Ordering::SeqCst),
            liveness_checks: counters.liveness_checks.load(Ordering::SeqCst),
            writes: counters.writes.load(Ordering::SeqCst),
        }
    }

    /// Session factory presenting `credentials`
    pub fn connector(&self, credentials: Credentials) -> SimulatedConnector {
        SimulatedConnector {
            endpoint: self.clone(),
            credentials,
        }
    }

    fn publish(&self, node: NodeId, value: SignalValue) {
        // No receivers simply means nobody is subscribed yet
        let _ = self.inner.changes.send(Published {
            node,
            value,
            at: self.now(),
        });
    }

    fn accept(&self, offered: &Credentials) -> Result<(), SessionError> {
        {
            let mut faults = lock(&self.inner.faults);
            if faults.link_down {
                return Err(SessionError::ConnectionFailure(format!(
                    "{} unreachable",
                    self.inner.url
                )));
            }
            if faults.refuse_connects > 0 {
                faults.refuse_connects -= 1;
                return Err(SessionError::ConnectionFailure(
                    "connection refused".to_string(),
                ));
            }
        }

        if self.inner.required != Credentials::Anonymous && &self.inner.required != offered {
            return Err(SessionError::ConnectionFailure(
                "authentication rejected".to_string(),
            ));
        }
        Ok(())
    }

    fn next_id(&self) -> u64 {
        self.inner.next_id.fetch_add(1, Ordering::SeqCst)
    }
}

/// Client session against a simulated endpoint
pub struct SimulatedSession {
    id: u64,
    endpoint: SimulatedEndpoint,
    credentials: Credentials,
    state: Mutex<SessionState>,
    alive: watch::Sender<bool>,
    forwarders: Mutex<Vec<JoinHandle<()>>>,
}

impl SimulatedSession {
    pub fn new(endpoint: SimulatedEndpoint, credentials: Credentials) -> Self {
        let (alive, _) = watch::channel(false);
        Self {
            id: endpoint.next_id(),
            endpoint,
            credentials,
            state: Mutex::new(SessionState::Disconnected),
            alive,
            forwarders: Mutex::new(Vec::new()),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    fn set_state(&self, state: SessionState) {
        *lock(&self.state) = state;
    }

    fn ensure_connected(&self) -> Result<(), SessionError> {
        if self.state() != SessionState::Connected {
            return Err(SessionError::Communication(
                "session is not connected".to_string(),
            ));
        }
        if lock(&self.endpoint.inner.faults).link_down {
            return Err(SessionError::Communication("connection lost".to_string()));
        }
        Ok(())
    }

    fn check_address(&self, address: &SignalAddress) -> Result<(), SessionError> {
        let node_type = self
            .endpoint
            .value(&address.node)
            .map(|value| value.value_type())
            .ok_or_else(|| SessionError::protocol(address, "unknown node"))?;

        if node_type != address.value_type {
            return Err(SessionError::protocol(
                address,
                format!(
                    "node holds {} values but address declares {}",
                    node_type, address.value_type
                ),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl Session for SimulatedSession {
    fn endpoint(&self) -> &str {
        self.endpoint.url()
    }

    fn state(&self) -> SessionState {
        *lock(&self.state)
    }

    fn now(&self) -> DateTime<Utc> {
        self.endpoint.now()
    }

    async fn connect(&self) -> Result<(), SessionError> {
        self.set_state(SessionState::Connecting);

        if let Err(e) = self.endpoint.accept(&self.credentials) {
            self.set_state(SessionState::Failed);
            return Err(e);
        }

        self.endpoint
            .inner
            .counters
            .connects
            .fetch_add(1, Ordering::SeqCst);
        self.set_state(SessionState::Connected);
        self.alive.send_replace(true);

        debug!(
            session = self.id,
            endpoint = %self.endpoint.url(),
            "Simulated session connected"
        );
        Ok(())
    }

    async fn disconnect(&self) {
        let previous = std::mem::replace(&mut *lock(&self.state), SessionState::Disconnected);
        self.alive.send_replace(false);

        for forwarder in lock(&self.forwarders).drain(..) {
            forwarder.abort();
        }

        if previous != SessionState::Disconnected {
            self.endpoint
                .inner
                .counters
                .disconnects
                .fetch_add(1, Ordering::SeqCst);
            debug!(session = self.id, "Simulated session disconnected");
        }
    }

    async fn read(&self, address: &SignalAddress) -> Result<SignalValue, SessionError> {
        self.ensure_connected()?;
        self.check_address(address)?;
        self.endpoint
            .value(&address.node)
            .ok_or_else(|| SessionError::protocol(address, "unknown node"))
    }

    async fn write(&self, address: &SignalAddress, value: SignalValue) -> Result<(), SessionError> {
        self.ensure_connected()?;

        let injected = lock(&self.endpoint.inner.faults)
            .failing_writes
            .get(&address.node)
            .cloned();
        if let Some(error) = injected {
            return Err(error);
        }

        self.check_address(address)?;
        let coerced = value.coerce(address.value_type).ok_or_else(|| {
            SessionError::protocol(
                address,
                format!("value {} is not a valid {}", value, address.value_type),
            )
        })?;

        self.endpoint
            .inner
            .counters
            .writes
            .fetch_add(1, Ordering::SeqCst);
        self.endpoint.set_value(&address.node, coerced)
    }

    async fn check_liveness(&self) -> Result<(), SessionError> {
        self.ensure_connected()?;
        self.endpoint
            .inner
            .counters
            .liveness_checks
            .fetch_add(1, Ordering::SeqCst);

        let mut faults = lock(&self.endpoint.inner.faults);
        match faults.liveness_budget {
            Some(0) => {
                faults.liveness_budget = None;
                Err(SessionError::Communication(
                    "connection lost: liveness check timed out".to_string(),
                ))
            }
            Some(remaining) => {
                faults.liveness_budget = Some(remaining - 1);
                Ok(())
            }
            None => Ok(()),
        }
    }

    async fn subscribe(
        &self,
        interval: Duration,
        addresses: &[SignalAddress],
        handler: Arc<dyn DataChangeHandler>,
    ) -> Result<Subscription, SessionError> {
        self.ensure_connected()?;
        for address in addresses {
            self.check_address(address)?;
        }

        let id = self.endpoint.next_id();
        let (tx, rx) = mpsc::channel(NOTIFICATION_CAPACITY);

        // Subscribe before reading initial values so no change falls in between
        let mut changes = self.endpoint.inner.changes.subscribe();

        let now = self.endpoint.now();
        for address in addresses {
            if let Some(value) = self.endpoint.value(&address.node) {
                let _ = tx.try_send(DataChange {
                    address: address.clone(),
                    value,
                    received_at: now,
                });
            }
        }

        let watched: HashMap<NodeId, SignalAddress> = addresses
            .iter()
            .map(|address| (address.node.clone(), address.clone()))
            .collect();
        let mut alive = self.alive.subscribe();

        let forwarder = tokio::spawn(async move {
            loop {
                tokio::select! {
                    changed = alive.changed() => {
                        if changed.is_err() || !*alive.borrow() {
                            break;
                        }
                    }
                    published = changes.recv() => match published {
                        Ok(published) => {
                            let Some(address) = watched.get(&published.node) else {
                                continue;
                            };
                            let change = DataChange {
                                address: address.clone(),
                                value: published.value,
                                received_at: published.at,
                            };
                            if tx.send(change).await.is_err() {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(subscription = id, skipped, "Subscription lagged, notifications dropped");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        });
        lock(&self.forwarders).push(forwarder);

        self.endpoint
            .inner
            .counters
            .subscriptions
            .fetch_add(1, Ordering::SeqCst);

        debug!(
            session = self.id,
            subscription = id,
            addresses = addresses.len(),
            interval_ms = interval.as_millis() as u64,
            "Subscription created"
        );

        Ok(Subscription::start(
            id,
            interval,
            addresses.to_vec(),
            rx,
            self.alive.subscribe(),
            handler,
        ))
    }
}

/// Session factory for a simulated endpoint
#[derive(Clone)]
pub struct SimulatedConnector {
    endpoint: SimulatedEndpoint,
    credentials: Credentials,
}

impl SimulatedConnector {
    pub fn endpoint(&self) -> &SimulatedEndpoint {
        &self.endpoint
    }
}

impl SessionFactory for SimulatedConnector {
    fn create(&self) -> Arc<dyn Session> {
        Arc::new(SimulatedSession::new(
            self.endpoint.clone(),
            self.credentials.clone(),
        ))
    }
}

/// Toggles a boolean node through idle and active phases on a fixed schedule
pub struct MachineDriver {
    endpoint: SimulatedEndpoint,
    node: NodeId,
    active: Duration,
    idle: Duration,
}

impl MachineDriver {
    pub fn new(endpoint: SimulatedEndpoint, node: NodeId, active: Duration, idle: Duration) -> Self {
        Self {
            endpoint,
            node,
            active,
            idle,
        }
    }

    /// Run until shutdown: idle, switch on, hold, switch off, repeat
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        info!(
            node = %self.node,
            active_secs = self.active.as_secs_f64(),
            idle_secs = self.idle.as_secs_f64(),
            "Starting simulated machine"
        );

        loop {
            if !hold(self.idle, &mut shutdown).await {
                break;
            }
            self.switch(true);
            if !hold(self.active, &mut shutdown).await {
                break;
            }
            self.switch(false);
        }

        info!(node = %self.node, "Simulated machine stopped");
    }

    fn switch(&self, on: bool) {
        if let Err(e) = self.endpoint.set_value(&self.node, SignalValue::Bool(on)) {
            warn!(node = %self.node, error = %e, "Simulated machine could not switch");
        }
    }
}

/// Sleep for `period`; false if shutdown arrived first
async fn hold(period: Duration, shutdown: &mut broadcast::Receiver<()>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(period) => true,
        _ = shutdown.recv() => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ValueType;
    use tokio_test::{assert_err, assert_ok};

    struct Collect {
        changes: Mutex<Vec<DataChange>>,
    }

    impl Collect {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                changes: Mutex::new(Vec::new()),
            })
        }

        fn values(&self) -> Vec<SignalValue> {
            self.changes.lock().unwrap().iter().map(|c| c.value).collect()
        }
    }

    impl DataChangeHandler for Collect {
        fn on_data_change(&self, change: &DataChange) {
            self.changes.lock().unwrap().push(change.clone());
        }
    }

    fn run_signal() -> SignalAddress {
        SignalAddress::boolean("ns=2;s=Tags.GECO/MP_Mixer_Run").unwrap()
    }

    fn endpoint() -> SimulatedEndpoint {
        let endpoint = SimulatedEndpoint::new("sim://mixer");
        endpoint.declare_address(&run_signal());
        endpoint
    }

    #[tokio::test]
    async fn test_connect_and_disconnect() {
        let endpoint = endpoint();
        let session = endpoint.connector(Credentials::Anonymous).create();

        assert_eq!(session.state(), SessionState::Disconnected);
        session.connect().await.unwrap();
        assert_eq!(session.state(), SessionState::Connected);

        session.disconnect().await;
        session.disconnect().await;
        assert_eq!(session.state(), SessionState::Disconnected);

        let stats = endpoint.stats();
        assert_eq!(stats.connects, 1);
        assert_eq!(stats.disconnects, 1);
    }

    #[tokio::test]
    async fn test_refused_connects() {
        let endpoint = endpoint();
        endpoint.refuse_connects(1);

        let first = endpoint.connector(Credentials::Anonymous).create();
        let err = first.connect().await.unwrap_err();
        assert!(matches!(err, SessionError::ConnectionFailure(_)));
        assert_eq!(first.state(), SessionState::Failed);

        let second = endpoint.connector(Credentials::Anonymous).create();
        assert_ok!(second.connect().await);
    }

    #[tokio::test]
    async fn test_authentication() {
        let required = Credentials::UserPassword {
            username: "Admin".to_string(),
            password: "admin".to_string(),
        };
        let endpoint = SimulatedEndpoint::with_credentials("sim://load-cell", required.clone());

        let anonymous = endpoint.connector(Credentials::Anonymous).create();
        assert_err!(anonymous.connect().await);

        let authenticated = endpoint.connector(required).create();
        assert_ok!(authenticated.connect().await);
    }

    #[tokio::test]
    async fn test_read_write_errors() {
        let endpoint = endpoint();
        let session = endpoint.connector(Credentials::Anonymous).create();

        let err = session.read(&run_signal()).await.unwrap_err();
        assert!(matches!(err, SessionError::Communication(_)));

        session.connect().await.unwrap();

        let unknown = SignalAddress::boolean("ns=4;i=99").unwrap();
        let err = session.read(&unknown).await.unwrap_err();
        assert!(!err.is_retryable());

        let mistyped = SignalAddress::parse("ns=2;s=Tags.GECO/MP_Mixer_Run", ValueType::Float).unwrap();
        let err = session.write(&mistyped, SignalValue::Float(1.0)).await.unwrap_err();
        assert!(matches!(err, SessionError::Protocol { .. }));

        session
            .write(&run_signal(), SignalValue::Int(1))
            .await
            .unwrap();
        assert_eq!(
            session.read(&run_signal()).await.unwrap(),
            SignalValue::Bool(true)
        );
    }

    #[tokio::test]
    async fn test_liveness_budget() {
        let endpoint = endpoint();
        let session = endpoint.connector(Credentials::Anonymous).create();
        session.connect().await.unwrap();

        endpoint.fail_liveness_after(2);
        assert_ok!(session.check_liveness().await);
        assert_ok!(session.check_liveness().await);
        assert_err!(session.check_liveness().await);
        // The fault fires once
        assert_ok!(session.check_liveness().await);

        endpoint.set_link_down(true);
        assert_err!(session.check_liveness().await);
    }

    #[tokio::test]
    async fn test_subscription_initial_value_and_changes() {
        let endpoint = endpoint();
        let session = endpoint.connector(Credentials::Anonymous).create();
        session.connect().await.unwrap();

        let collect = Collect::new();
        let subscription = session
            .subscribe(Duration::from_millis(100), &[run_signal()], collect.clone())
            .await
            .unwrap();

        endpoint
            .set_value(&run_signal().node, SignalValue::Bool(true))
            .unwrap();
        endpoint
            .set_value(&run_signal().node, SignalValue::Bool(false))
            .unwrap();

        tokio::time::timeout(Duration::from_secs(1), async {
            while subscription.delivered() < 3 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        assert_eq!(
            collect.values(),
            vec![
                SignalValue::Bool(false),
                SignalValue::Bool(true),
                SignalValue::Bool(false)
            ]
        );
        assert_eq!(endpoint.stats().subscriptions, 1);
    }

    #[tokio::test]
    async fn test_subscription_revoked_on_disconnect() {
        let endpoint = endpoint();
        let session = endpoint.connector(Credentials::Anonymous).create();
        session.connect().await.unwrap();

        let collect = Collect::new();
        let subscription = session
            .subscribe(Duration::from_millis(100), &[run_signal()], collect)
            .await
            .unwrap();
        assert!(subscription.is_active());

        session.disconnect().await;
        assert!(!subscription.is_active());
    }

    #[tokio::test]
    async fn test_subscribe_unknown_address_is_protocol_error() {
        let endpoint = endpoint();
        let session = endpoint.connector(Credentials::Anonymous).create();
        session.connect().await.unwrap();

        let result = session
            .subscribe(
                Duration::from_millis(100),
                &[SignalAddress::boolean("ns=9;i=1").unwrap()],
                Collect::new(),
            )
            .await;
        assert!(matches!(result, Err(SessionError::Protocol { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_machine_driver_toggles() {
        let endpoint = endpoint();
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let driver = MachineDriver::new(
            endpoint.clone(),
            run_signal().node,
            Duration::from_secs(5),
            Duration::from_secs(25),
        );
        let task = tokio::spawn(driver.run(shutdown_rx));

        tokio::time::sleep(Duration::from_secs(26)).await;
        assert_eq!(endpoint.value(&run_signal().node), Some(SignalValue::Bool(true)));

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(endpoint.value(&run_signal().node), Some(SignalValue::Bool(false)));

        shutdown_tx.send(()).unwrap();
        task.await.unwrap();
    }
}
