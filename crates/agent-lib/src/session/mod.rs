//! Endpoint sessions
//!
//! The device protocol is an external collaborator. This module defines the
//! contract the rest of the agent is written against:
//! - `Session`: connect/disconnect, point reads and writes, liveness checks
//!   and change subscriptions on one logical connection
//! - `SessionFactory`: creates a fresh session for every connection attempt
//! - `Subscription`: ordered change delivery to a `DataChangeHandler`
//!
//! An in-process simulated endpoint implements the contract for running
//! without field hardware.

mod simulated;
mod subscription;

pub use simulated::{
    EndpointStats, MachineDriver, SimulatedConnector, SimulatedEndpoint, SimulatedSession,
};
pub use subscription::{DataChangeHandler, HandlerSet, Subscription};

use crate::error::{ConfigError, SessionError};
use crate::models::{SignalAddress, SignalValue};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Lifecycle state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    Failed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Disconnected => "disconnected",
            SessionState::Connecting => "connecting",
            SessionState::Connected => "connected",
            SessionState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Credentials presented when a session is established
#[derive(Clone, PartialEq, Eq, Default)]
pub enum Credentials {
    #[default]
    Anonymous,
    UserPassword {
        username: String,
        password: String,
    },
    Certificate {
        certificate: PathBuf,
        private_key: PathBuf,
    },
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credentials::Anonymous => f.write_str("Anonymous"),
            Credentials::UserPassword { username, .. } => f
                .debug_struct("UserPassword")
                .field("username", username)
                .field("password", &"<redacted>")
                .finish(),
            Credentials::Certificate {
                certificate,
                private_key,
            } => f
                .debug_struct("Certificate")
                .field("certificate", certificate)
                .field("private_key", private_key)
                .finish(),
        }
    }
}

/// Endpoint identity and security profile
#[derive(Debug, Clone)]
pub struct EndpointConfig {
    /// Endpoint URL (e.g., "opc.tcp://10.129.4.80:48010" or "sim://local")
    pub url: String,
    pub credentials: Credentials,
}

impl EndpointConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            credentials: Credentials::Anonymous,
        }
    }

    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = credentials;
        self
    }

    /// URL scheme, validating the endpoint on the way
    pub fn scheme(&self) -> Result<String, ConfigError> {
        let url = url::Url::parse(&self.url).map_err(|e| ConfigError::InvalidEndpoint {
            url: self.url.clone(),
            reason: e.to_string(),
        })?;
        if url.host_str().map(str::is_empty).unwrap_or(true) {
            return Err(ConfigError::InvalidEndpoint {
                url: self.url.clone(),
                reason: "no host in endpoint URL".to_string(),
            });
        }
        Ok(url.scheme().to_string())
    }
}

/// One logical connection to an automation endpoint
///
/// Implementations are internally synchronized: delivery tasks, workers and
/// the liveness loop call into the same session concurrently.
#[async_trait]
pub trait Session: Send + Sync {
    /// Endpoint this session talks to
    fn endpoint(&self) -> &str;

    fn state(&self) -> SessionState;

    /// Current time in the clock change notifications are stamped with
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    /// Establish the session
    async fn connect(&self) -> Result<(), SessionError>;

    /// Release all resources; safe to call repeatedly
    async fn disconnect(&self);

    async fn read(&self, address: &SignalAddress) -> Result<SignalValue, SessionError>;

    /// Write a value; the side effect is external, callers must not assume
    /// that blind retries are safe
    async fn write(&self, address: &SignalAddress, value: SignalValue) -> Result<(), SessionError>;

    /// Fails when the transport has silently died
    async fn check_liveness(&self) -> Result<(), SessionError>;

    /// Watch `addresses`, delivering changes to `handler` in endpoint order
    async fn subscribe(
        &self,
        interval: Duration,
        addresses: &[SignalAddress],
        handler: Arc<dyn DataChangeHandler>,
    ) -> Result<Subscription, SessionError>;
}

/// Creates a fresh session for every connection attempt
pub trait SessionFactory: Send + Sync {
    fn create(&self) -> Arc<dyn Session>;
}

/// Lock a std mutex, recovering the data if a holder panicked
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
