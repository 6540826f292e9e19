//! Change subscriptions
//!
//! Each subscription is pumped by its own task. Notifications reach the
//! handler in the order the endpoint reported them, and delivery stops as
//! soon as the owning session reports that it is gone.

use crate::models::{DataChange, SignalAddress};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error};

/// Receives change notifications
///
/// Called on the delivery task; must return quickly. Slow work (writes,
/// delays) belongs on a worker fed from here.
pub trait DataChangeHandler: Send + Sync {
    fn on_data_change(&self, change: &DataChange);

    /// Name used in logs
    fn name(&self) -> &str {
        "handler"
    }
}

/// Fans one notification out to several independent handlers
#[derive(Default)]
pub struct HandlerSet {
    handlers: Vec<Arc<dyn DataChangeHandler>>,
}

impl HandlerSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, handler: Arc<dyn DataChangeHandler>) -> Self {
        self.handlers.push(handler);
        self
    }

    pub fn push(&mut self, handler: Arc<dyn DataChangeHandler>) {
        self.handlers.push(handler);
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl DataChangeHandler for HandlerSet {
    fn on_data_change(&self, change: &DataChange) {
        for handler in &self.handlers {
            // A panicking handler must not take the others down with it
            let outcome = catch_unwind(AssertUnwindSafe(|| handler.on_data_change(change)));
            if outcome.is_err() {
                error!(
                    handler = %handler.name(),
                    address = %change.address,
                    "Change handler panicked"
                );
            }
        }
    }

    fn name(&self) -> &str {
        "handler_set"
    }
}

/// Standing registration for change notifications
///
/// Never outlives its session: the delivery task watches the session's
/// liveness flag and ends when it drops to false. Dropping the subscription
/// aborts delivery.
pub struct Subscription {
    id: u64,
    interval: Duration,
    addresses: Vec<SignalAddress>,
    session_alive: watch::Receiver<bool>,
    delivered: Arc<AtomicU64>,
    task: JoinHandle<()>,
}

impl Subscription {
    /// Start delivering `notifications` to `handler`
    pub fn start(
        id: u64,
        interval: Duration,
        addresses: Vec<SignalAddress>,
        mut notifications: mpsc::Receiver<DataChange>,
        session_alive: watch::Receiver<bool>,
        handler: Arc<dyn DataChangeHandler>,
    ) -> Self {
        let delivered = Arc::new(AtomicU64::new(0));
        let counter = delivered.clone();
        let mut alive = session_alive.clone();

        let task = tokio::spawn(async move {
            if !*alive.borrow() {
                return;
            }

            loop {
                tokio::select! {
                    biased;
                    changed = alive.changed() => {
                        if changed.is_err() || !*alive.borrow() {
                            debug!(subscription = id, "Session gone, subscription revoked");
                            break;
                        }
                    }
                    change = notifications.recv() => {
                        match change {
                            Some(change) => {
                                handler.on_data_change(&change);
                                counter.fetch_add(1, Ordering::Relaxed);
                            }
                            None => break,
                        }
                    }
                }
            }
        });

        Self {
            id,
            interval,
            addresses,
            session_alive,
            delivered,
            task,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Requested sampling interval
    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn addresses(&self) -> &[SignalAddress] {
        &self.addresses
    }

    /// Number of notifications handed to the handler so far
    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    /// True while the owning session is alive and delivery is running
    pub fn is_active(&self) -> bool {
        *self.session_alive.borrow() && !self.task.is_finished()
    }

    pub fn cancel(&self) {
        self.task.abort();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.task.abort();
    }
}
