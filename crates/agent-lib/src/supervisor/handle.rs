//! Shared connection handle
//!
//! Workers and the liveness poll report failures here; the supervisor awaits
//! the first one and tears the session down. Each session attempt gets a
//! fresh handle, so a late report from a worker of an older session lands on
//! a handle nobody listens to anymore.

use crate::error::SessionError;
use crate::session::lock;
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use tracing::debug;

#[derive(Debug, Default)]
struct Slot {
    failure: Mutex<Option<SessionError>>,
    notify: Notify,
}

/// Supervisor side: one per session attempt
#[derive(Debug)]
pub struct ConnectionHandle {
    generation: u64,
    slot: Arc<Slot>,
}

impl ConnectionHandle {
    pub fn new(generation: u64) -> Self {
        Self {
            generation,
            slot: Arc::new(Slot::default()),
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Reporter handed to workers of this session
    pub fn reporter(&self) -> FailureReporter {
        FailureReporter {
            generation: self.generation,
            slot: self.slot.clone(),
        }
    }

    /// First failure reported so far, if any
    pub fn failure(&self) -> Option<SessionError> {
        lock(&self.slot.failure).clone()
    }

    /// Wait for the first reported failure
    pub async fn failed(&self) -> SessionError {
        loop {
            let notified = self.slot.notify.notified();
            if let Some(error) = self.failure() {
                return error;
            }
            notified.await;
        }
    }
}

/// Worker side of a connection handle
#[derive(Debug, Clone)]
pub struct FailureReporter {
    generation: u64,
    slot: Arc<Slot>,
}

impl FailureReporter {
    /// Record a failure; only the first one per session is kept
    pub fn report(&self, error: SessionError) {
        let mut failure = lock(&self.slot.failure);
        if failure.is_none() {
            debug!(generation = self.generation, error = %error, "Session failure reported");
            *failure = Some(error);
            drop(failure);
            self.slot.notify.notify_waiters();
            self.slot.notify.notify_one();
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn has_failed(&self) -> bool {
        lock(&self.slot.failure).is_some()
    }
}
